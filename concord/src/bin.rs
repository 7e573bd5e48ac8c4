use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use concord::config::TestConfig;
use concord::{client, cluster};
use concord_base::{err, Result};

/// Replicated in-memory key-value store with selectable consistency.
#[derive(Debug, Parser)]
#[command(name = "concord")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch every replica and scripted client from a test configuration.
    Run { config: PathBuf },
    /// Run one replica as its own process, until killed.
    Replica {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        id: u32,
    },
    /// Run one scripted client from the configuration's clients list.
    Client {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        index: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("concord: {e:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { config } => {
            let cfg = TestConfig::load(&config)?;
            cluster::run(&cfg)
        }
        Command::Replica { config, id } => {
            let cfg = TestConfig::load(&config)?;
            let _replica = cluster::spawn_replica(&cfg, id)?;
            // Serves until the launcher kills the process.
            loop {
                std::thread::park();
            }
        }
        Command::Client { config, index } => {
            let cfg = TestConfig::load(&config)?;
            let spec = cfg
                .clients
                .get(index)
                .ok_or_else(|| err(format!("no client at index {index}")))?;
            client::run_script(spec, cfg.client_addr(spec.server_number)?)
        }
    }
}
