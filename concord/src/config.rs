use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use concord_base::{err, Result};
use concord_net::ClientRequest;
use concord_rep::Mode;

// The test configuration file:
//
//   {
//     "num_servers": 2,
//     "consistency_level": "linearizability",
//     "port_number": { "0": [5000, 5001, 5002], "1": [5010, 5011, 5012] },
//     "clients": [ { "client_number": 0, "server_number": 0,
//                    "requests": [ {"type": "set", "key": "a", "value": 3},
//                                  {"type": "sleep", "value": 100},
//                                  {"type": "get", "key": "a"} ] } ]
//   }
//
// Port keys are stringly-numbered replica ids, and each maps to the triple
// (peer_in, peer_out, client_api). The triple shape is kept for
// compatibility with existing files; the TCP fabric binds peer_out (peers
// subscribe by connecting to it) and client_api, while peer_in never names
// a listener here because subscription connects outward.
#[derive(Clone, Debug, Deserialize)]
pub struct TestConfig {
    pub num_servers: u32,
    pub consistency_level: Mode,
    pub port_number: BTreeMap<String, PortTriple>,
    #[serde(default)]
    pub clients: Vec<ClientSpec>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PortTriple(pub u16, pub u16, pub u16);

impl PortTriple {
    pub fn peer_in(&self) -> u16 {
        self.0
    }
    pub fn peer_out(&self) -> u16 {
        self.1
    }
    pub fn client_api(&self) -> u16 {
        self.2
    }
}

// One scripted client: which replica it talks to and what it asks. A sleep
// entry stalls the script locally for `value` milliseconds and sends
// nothing.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientSpec {
    pub client_number: u32,
    pub server_number: u32,
    pub requests: Vec<ClientRequest>,
}

impl TestConfig {
    pub fn load(path: &Path) -> Result<TestConfig> {
        let text = std::fs::read_to_string(path)?;
        let cfg: TestConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_servers as usize != self.port_number.len() {
            return Err(err(format!(
                "num_servers is {} but port_number has {} entries",
                self.num_servers,
                self.port_number.len()
            )));
        }
        for key in self.port_number.keys() {
            let id: u32 = key
                .parse()
                .map_err(|_| err(format!("port_number key {key:?} is not a replica id")))?;
            if id >= self.num_servers {
                return Err(err(format!(
                    "port_number names replica {id} outside 0..{}",
                    self.num_servers
                )));
            }
        }
        for client in &self.clients {
            if client.server_number >= self.num_servers {
                return Err(err(format!(
                    "client {} is bound to unknown replica {}",
                    client.client_number, client.server_number
                )));
            }
        }
        Ok(())
    }

    pub fn ports(&self, id: u32) -> Result<PortTriple> {
        self.port_number
            .get(&id.to_string())
            .copied()
            .ok_or_else(|| err(format!("no ports configured for replica {id}")))
    }

    // The address replica `id` publishes peer traffic on.
    pub fn peer_addr(&self, id: u32) -> Result<SocketAddr> {
        Ok(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            self.ports(id)?.peer_out(),
        )))
    }

    pub fn peer_addrs_except(&self, id: u32) -> Result<Vec<SocketAddr>> {
        (0..self.num_servers)
            .filter(|peer| *peer != id)
            .map(|peer| self.peer_addr(peer))
            .collect()
    }

    pub fn client_addr(&self, id: u32) -> Result<SocketAddr> {
        Ok(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            self.ports(id)?.client_api(),
        )))
    }
}
