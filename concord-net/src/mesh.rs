// In-process mesh fabric over std mpsc channels. Each replica owns one
// inbound peer channel and one inbound client channel; a publisher holds the
// sending half of every other replica's peer channel. Per-sender FIFO falls
// out of each pairwise sender handle, and a publisher holds no handle to its
// own inbox, so nothing ever loops back.

use std::sync::mpsc;

use tracing::warn;

use concord_base::{err, Result};

use crate::{ClientEndpoint, ClientRequest, PeerMsg, Publisher, ReplicaId, ReplySlot, Subscription};

pub struct MeshPublisher {
    peers: Vec<(ReplicaId, mpsc::Sender<PeerMsg>)>,
}

impl Publisher for MeshPublisher {
    fn publish(&self, msg: &PeerMsg) -> Result<()> {
        for (peer, tx) in &self.peers {
            if tx.send(msg.clone()).is_err() {
                // A torn-down peer is not the sender's problem.
                warn!(target: "concord", "peer {} inbox closed, dropping message", peer);
            }
        }
        Ok(())
    }
}

pub struct MeshSubscription {
    rx: mpsc::Receiver<PeerMsg>,
}

impl Subscription for MeshSubscription {
    fn next(&mut self) -> Result<PeerMsg> {
        Ok(self.rx.recv()?)
    }
}

pub struct MeshClientEndpoint {
    rx: mpsc::Receiver<(ClientRequest, ReplySlot)>,
}

impl ClientEndpoint for MeshClientEndpoint {
    fn next(&mut self) -> Result<(ClientRequest, ReplySlot)> {
        Ok(self.rx.recv()?)
    }
}

// The client-side handle onto one replica's request/response channel.
// Lock-step is structural: request() does not return until the reply does.
#[derive(Clone)]
pub struct MeshClient {
    tx: mpsc::Sender<(ClientRequest, ReplySlot)>,
}

impl MeshClient {
    pub fn request(&self, req: ClientRequest) -> Result<String> {
        let (slot, rx) = ReplySlot::pair();
        self.tx
            .send((req, slot))
            .map_err(|_| err("replica client endpoint closed"))?;
        Ok(rx.recv()?)
    }
}

// Everything one replica needs to join the mesh, plus the client handle
// embedders and tests use to talk to it.
pub struct MeshNode {
    pub id: ReplicaId,
    pub publisher: MeshPublisher,
    pub subscription: MeshSubscription,
    pub endpoint: MeshClientEndpoint,
    pub client: MeshClient,
}

pub fn mesh(cluster_size: u32) -> Vec<MeshNode> {
    let mut peer_txs = Vec::new();
    let mut peer_rxs = Vec::new();
    for _ in 0..cluster_size {
        let (tx, rx) = mpsc::channel();
        peer_txs.push(tx);
        peer_rxs.push(rx);
    }

    let mut nodes = Vec::new();
    for (i, rx) in peer_rxs.into_iter().enumerate() {
        let id = ReplicaId(i as u32);
        let peers = peer_txs
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, tx)| (ReplicaId(j as u32), tx.clone()))
            .collect();
        let (client_tx, client_rx) = mpsc::channel();
        nodes.push(MeshNode {
            id,
            publisher: MeshPublisher { peers },
            subscription: MeshSubscription { rx },
            endpoint: MeshClientEndpoint { rx: client_rx },
            client: MeshClient { tx: client_tx },
        });
    }
    nodes
}
