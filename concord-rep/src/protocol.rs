use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use concord_base::{err, Result};
use concord_net::{ClientRequest, Op, OpKind, PeerMsg, Proposal, ReplySlot, RequestKind, Version};

use crate::replica::ReplicaCtx;

// The configured consistency level. Causal is accepted by the parser for
// compatibility with existing configuration files, but there is no protocol
// behind it; asking for one fails at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Linearizability,
    Sequential,
    Eventual,
    Causal,
}

impl Mode {
    pub fn protocol(self) -> Result<Arc<dyn Protocol>> {
        match self {
            Mode::Linearizability => Ok(Arc::new(Linearizable)),
            Mode::Sequential => Ok(Arc::new(Sequential)),
            Mode::Eventual => Ok(Arc::new(Eventual::new())),
            Mode::Causal => Err(err(
                "causal consistency is declared but has no protocol; configure another level",
            )),
        }
    }
}

// What varies between consistency levels, and nothing else: how a client
// request enters the system, what a peer message does on arrival, and how a
// released proposal is applied. The replica shell owns the threads and the
// shared state and calls through this seam.
pub trait Protocol: Send + Sync {
    fn on_client_request(&self, ctx: &ReplicaCtx, req: ClientRequest, slot: ReplySlot)
        -> Result<()>;

    fn on_peer_message(&self, ctx: &ReplicaCtx, msg: PeerMsg) -> Result<()>;

    // Apply one released proposal to the store and produce the reply owed to
    // the origin's client. The step is deterministic: replaying a replica's
    // released sequence against a fresh store reproduces its state.
    fn apply(&self, ctx: &ReplicaCtx, p: &Proposal) -> String {
        match &p.op {
            Op::Set { key, value } => {
                ctx.store.set(key, *value);
                "success".to_string()
            }
            Op::Get { key } => {
                let value = ctx.store.get(key);
                format!("{key}:{value}")
            }
        }
    }
}

fn client_op(req: &ClientRequest) -> Result<Op> {
    match req.kind {
        RequestKind::Set => Ok(Op::Set {
            key: req.key.clone(),
            value: req.value,
        }),
        RequestKind::Get => Ok(Op::Get {
            key: req.key.clone(),
        }),
        // Sleep is client-local; a replica seeing one is being misused.
        RequestKind::Sleep => Err(err("sleep request reached a replica")),
    }
}

// Origin half of total-order multicast: stamp the operation, park the reply
// for the deliverer, count our own acknowledgement, broadcast the propose.
// The reply is parked before the proposal can possibly release, so even a
// single-replica cluster (where our own ack already completes the count)
// cannot race the deliverer to the slot.
fn propose(ctx: &ReplicaCtx, op: Op, slot: ReplySlot) -> Result<()> {
    let ts = ctx.clock.tick();
    let p = Proposal {
        ts,
        origin: ctx.id,
        op,
    };
    debug!(target: "concord", "{} proposes {:?}", ctx.id, p);
    ctx.park_reply(p.clone(), slot);
    ctx.queue.enqueue(p.clone());
    ctx.queue.ack(&p);
    ctx.broadcast(&PeerMsg::propose(&p))
}

// Receiver half. A propose carries the origin's implicit acknowledgement
// and obliges us to broadcast our own; an explicit ack just counts. Every
// replica thereby counts each of the N replicas exactly once per proposal:
// the origin counts itself at creation plus N-1 acks off the wire, a peer
// counts the origin and itself at the propose plus N-2 acks off the wire.
fn total_order_peer(ctx: &ReplicaCtx, msg: PeerMsg) -> Result<()> {
    ctx.clock.observe(msg.timestamp);
    let p = msg.proposal()?;
    if msg.ack {
        ctx.queue.ack(&p);
        return Ok(());
    }
    if p.origin == ctx.id {
        // Loopback of our own propose; everything was counted at creation.
        return Ok(());
    }
    if !ctx.queue.enqueue(p.clone()) {
        // Duplicate propose; our ack is already out.
        return Ok(());
    }
    ctx.queue.ack(&p); // the origin's, carried by the propose itself
    ctx.queue.ack(&p); // ours, counted here rather than via loopback
    let sent_at = ctx.clock.tick();
    ctx.broadcast(&PeerMsg::ack(sent_at, &p))
}

// Both reads and writes ride the multicast, so every replica sees the same
// interleaving of gets among sets, which is what upgrades the shared write
// order into linearizability.
pub struct Linearizable;

impl Protocol for Linearizable {
    fn on_client_request(
        &self,
        ctx: &ReplicaCtx,
        req: ClientRequest,
        slot: ReplySlot,
    ) -> Result<()> {
        let op = client_op(&req)?;
        propose(ctx, op, slot)
    }

    fn on_peer_message(&self, ctx: &ReplicaCtx, msg: PeerMsg) -> Result<()> {
        total_order_peer(ctx, msg)
    }
}

// Writes ride the multicast; reads bypass it and answer from the local
// store, which may trail the cluster-wide write order. Still sequentially
// consistent: one total write order, and each client's reads are consistent
// with its own replica's position in it.
pub struct Sequential;

impl Protocol for Sequential {
    fn on_client_request(
        &self,
        ctx: &ReplicaCtx,
        req: ClientRequest,
        slot: ReplySlot,
    ) -> Result<()> {
        match client_op(&req)? {
            Op::Get { key } => {
                let value = ctx.store.get(&key);
                slot.send(format!("{key}:{value}"))
            }
            op @ Op::Set { .. } => propose(ctx, op, slot),
        }
    }

    fn on_peer_message(&self, ctx: &ReplicaCtx, msg: PeerMsg) -> Result<()> {
        total_order_peer(ctx, msg)
    }
}

// Last-writer-wins. Every operation is answered locally and immediately;
// writes also go out as acknowledgement-free proposes, and each replica
// keeps, per key, the (stamp, origin) of the writer it currently shows so
// that stale arrivals are discarded rather than applied.
pub struct Eventual {
    last_writer: Mutex<HashMap<String, Version>>,
}

impl Eventual {
    pub fn new() -> Eventual {
        Eventual {
            last_writer: Mutex::new(HashMap::new()),
        }
    }

    // The one write path, local and remote alike. The store write stays
    // under the record lock: the client reactor and the peer reactor race
    // on the same key, and record and store must never disagree about who
    // wrote last. The store and apply-log locks are innermost everywhere,
    // so the nesting cannot deadlock.
    fn write_if_newer(&self, ctx: &ReplicaCtx, key: &str, value: i64, candidate: Version) -> bool {
        let mut last_writer = self.last_writer.lock().unwrap();
        if let Some(existing) = last_writer.get(key) {
            if *existing >= candidate {
                return false;
            }
        }
        last_writer.insert(key.to_string(), candidate);
        ctx.store.set(key, value);
        ctx.record_applied(&Proposal {
            ts: candidate.ts,
            origin: candidate.origin,
            op: Op::Set {
                key: key.to_string(),
                value,
            },
        });
        true
    }
}

impl Protocol for Eventual {
    fn on_client_request(
        &self,
        ctx: &ReplicaCtx,
        req: ClientRequest,
        slot: ReplySlot,
    ) -> Result<()> {
        match client_op(&req)? {
            Op::Set { key, value } => {
                let ts = ctx.clock.tick();
                let candidate = Version {
                    ts,
                    origin: ctx.id,
                };
                // A fresh local stamp beats anything already applied here
                // (whatever we applied, we observed first), so this always
                // goes through.
                self.write_if_newer(ctx, &key, value, candidate);
                slot.send("success".to_string())?;
                ctx.broadcast(&PeerMsg::propose(&Proposal {
                    ts,
                    origin: ctx.id,
                    op: Op::Set { key, value },
                }))
            }
            Op::Get { key } => {
                let value = ctx.store.get(&key);
                slot.send(format!("{key}:{value}"))
            }
        }
    }

    fn on_peer_message(&self, ctx: &ReplicaCtx, msg: PeerMsg) -> Result<()> {
        ctx.clock.observe(msg.timestamp);
        if msg.ack || msg.operation != OpKind::Set {
            error!(target: "concord", "dropping peer message with no meaning under eventual: {:?}", msg);
            return Ok(());
        }
        let candidate = Version {
            ts: msg.timestamp,
            origin: msg.id,
        };
        if !self.write_if_newer(ctx, &msg.key, msg.value, candidate) {
            debug!(target: "concord", "{} discards stale write {:?}", ctx.id, msg);
        }
        Ok(())
    }
}
