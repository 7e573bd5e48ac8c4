use core::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use concord_base::{err, Result};

// A cluster is a fixed, fully-connected set of replicas. Each replica is
// known by a ReplicaId that is unique within the cluster and fixed at
// startup; ids double as the tie-break of the cluster-wide proposal order,
// so they are plain small integers rather than anything opaque.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// A Stamp is a Lamport scalar: advanced by one on every send event, and
// past any observed remote stamp on every receive event. Stamps order
// events only together with the id of the replica that produced them.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Stamp(pub u64);

impl Stamp {
    pub fn next(self) -> Stamp {
        Stamp(self.0 + 1)
    }
}

// The (stamp, origin) pair is a total order over everything any replica ever
// produces: compare stamps first, then origins. Last-writer-wins records and
// the holdback order are both expressed in terms of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Version {
    pub ts: Stamp,
    pub origin: ReplicaId,
}

// The two operations a client can ask of the store. Values are signed
// 64-bit; a key that was never set reads as zero.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Op {
    Set { key: String, value: i64 },
    Get { key: String },
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Set { .. } => OpKind::Set,
            Op::Get { .. } => OpKind::Get,
        }
    }
    pub fn key(&self) -> &str {
        match self {
            Op::Set { key, .. } => key,
            Op::Get { key } => key,
        }
    }
    pub fn value(&self) -> i64 {
        match self {
            Op::Set { value, .. } => *value,
            Op::Get { .. } => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Set,
    Get,
}

// A Proposal is an operation stamped at its origin. Field order matters:
// the derived Ord compares (ts, origin) first, which is exactly the
// cluster-wide delivery order, with equal stamps broken by origin id.
// Identity for ack accounting is the full tuple, not just (ts, origin).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Proposal {
    pub ts: Stamp,
    pub origin: ReplicaId,
    pub op: Op,
}

impl Proposal {
    pub fn version(&self) -> Version {
        Version {
            ts: self.ts,
            origin: self.origin,
        }
    }
}

// All replica-to-replica traffic is a single flat JSON object, the
// publish/subscribe schema:
//
//   {timestamp, id, operation, key, value, ack, msg_timestamp?}
//
// On a propose, `timestamp` is the proposal's stamp and `id` its origin.
// On an ack, `timestamp` is a fresh stamp from the acking replica while
// `id` still names the proposal's origin, so `msg_timestamp` is mandatory
// there: it carries the stamp of the propose being acknowledged. The acker
// itself is deliberately not named anywhere in the message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerMsg {
    pub timestamp: Stamp,
    pub id: ReplicaId,
    pub operation: OpKind,
    pub key: String,
    pub value: i64,
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_timestamp: Option<Stamp>,
}

impl PeerMsg {
    pub fn propose(p: &Proposal) -> PeerMsg {
        PeerMsg {
            timestamp: p.ts,
            id: p.origin,
            operation: p.op.kind(),
            key: p.op.key().to_string(),
            value: p.op.value(),
            ack: false,
            msg_timestamp: None,
        }
    }

    pub fn ack(sent_at: Stamp, p: &Proposal) -> PeerMsg {
        PeerMsg {
            timestamp: sent_at,
            id: p.origin,
            operation: p.op.kind(),
            key: p.op.key().to_string(),
            value: p.op.value(),
            ack: true,
            msg_timestamp: Some(p.ts),
        }
    }

    // Reconstruct the proposal this message proposes or acknowledges.
    pub fn proposal(&self) -> Result<Proposal> {
        let ts = if self.ack {
            self.msg_timestamp
                .ok_or_else(|| err("ack message missing msg_timestamp"))?
        } else {
            self.timestamp
        };
        let op = match self.operation {
            OpKind::Set => Op::Set {
                key: self.key.clone(),
                value: self.value,
            },
            OpKind::Get => Op::Get {
                key: self.key.clone(),
            },
        };
        Ok(Proposal {
            ts,
            origin: self.id,
            op,
        })
    }
}

// What a client sends per round trip, and also the shape of one scripted
// request in the test configuration file. `sleep` only ever appears in
// scripts: the driver stalls locally and sends nothing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Set,
    Get,
    Sleep,
}

// Exactly one reply must flow back per client request or the client
// deadlocks, so the reply capability is a value consumed by sending. Who
// resolves a slot varies by protocol (the client reactor for local reads,
// the deliverer for totally-ordered operations); whoever holds it last,
// there is no way to reply twice.
#[derive(Debug)]
pub struct ReplySlot(mpsc::Sender<String>);

impl ReplySlot {
    pub fn pair() -> (ReplySlot, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (ReplySlot(tx), rx)
    }

    pub fn send(self, reply: String) -> Result<()> {
        Ok(self.0.send(reply)?)
    }
}

// The three seams the replica shell talks through. The contract on the peer
// side is broadcast with per-sender-receiver FIFO, no delivery back to the
// sender, and reliable exactly-once under the assumed fault model. The
// client side is request/response, lock-step per client.
pub trait Publisher: Send + Sync {
    fn publish(&self, msg: &PeerMsg) -> Result<()>;
}

pub trait Subscription: Send {
    // Blocking; the merged inbound stream from every peer.
    fn next(&mut self) -> Result<PeerMsg>;
}

pub trait ClientEndpoint: Send {
    // Blocking; a request plus the slot its reply must go to.
    fn next(&mut self) -> Result<(ClientRequest, ReplySlot)>;
}

pub mod mesh;
pub mod tcp;
