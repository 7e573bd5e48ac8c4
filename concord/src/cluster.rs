use std::sync::mpsc;
use std::thread;

use tracing::{debug, info};

use concord_base::{err, Result};
use concord_net::tcp::{TcpClientEndpoint, TcpPublisher, TcpSubscription};
use concord_net::ReplicaId;
use concord_rep::{Replica, ReplicaHandle};

use crate::client;
use crate::config::TestConfig;

// Stand one replica up on its configured ports. Order matters: bind the
// publish side first so peers can find it, connect outward to every peer
// (with back-off, since replicas start in any order), then hold until every
// peer has subscribed to us — a propose broadcast before that is simply
// lost, and with it the ack count it was owed. Only then does the client
// port open.
pub fn spawn_replica(cfg: &TestConfig, id: u32) -> Result<ReplicaHandle> {
    let (publisher, publish_addr) = TcpPublisher::bind(cfg.peer_addr(id)?)?;
    debug!(target: "concord", "replica {id} publishing on {publish_addr}");
    let subscription = TcpSubscription::connect(&cfg.peer_addrs_except(id)?)?;
    publisher.await_subscribers(cfg.num_servers as usize - 1)?;
    let (endpoint, client_addr) = TcpClientEndpoint::bind(cfg.client_addr(id)?)?;
    info!(target: "concord", "replica {id} serving clients on {client_addr}");
    Replica::spawn(
        ReplicaId(id),
        cfg.num_servers,
        cfg.consistency_level,
        Box::new(publisher),
        Box::new(subscription),
        Box::new(endpoint),
    )
}

// The whole test in one process: every replica, then every scripted client,
// as threads over the real TCP fabric. Returns once the last client script
// finishes; replica threads are not joined — they die with the process,
// which is how a test run ends.
pub fn run(cfg: &TestConfig) -> Result<()> {
    cfg.validate()?;

    let (ready_tx, ready_rx) = mpsc::channel();
    for id in 0..cfg.num_servers {
        let cfg = cfg.clone();
        let ready_tx = ready_tx.clone();
        thread::Builder::new()
            .name(format!("boot-r{id}"))
            .spawn(move || {
                let _ = ready_tx.send(spawn_replica(&cfg, id));
            })?;
    }
    let mut replicas = Vec::new();
    for _ in 0..cfg.num_servers {
        replicas.push(ready_rx.recv()??);
    }
    info!(target: "concord", "{} replicas up at {:?} consistency", cfg.num_servers, cfg.consistency_level);

    let mut clients = Vec::new();
    for spec in &cfg.clients {
        let spec = spec.clone();
        let addr = cfg.client_addr(spec.server_number)?;
        clients.push(
            thread::Builder::new()
                .name(format!("client-{}", spec.client_number))
                .spawn(move || client::run_script(&spec, addr))?,
        );
    }
    for client in clients {
        client.join().map_err(|_| err("client thread panicked"))??;
    }

    for replica in &replicas {
        debug!(target: "concord", "replica {} final store {:?}", replica.id(), replica.store_snapshot());
    }
    Ok(())
}
