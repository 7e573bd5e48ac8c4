use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use concord_base::Result;
use concord_net::{
    ClientEndpoint, PeerMsg, Proposal, Publisher, ReplicaId, ReplySlot, Subscription,
};

use crate::clock::LamportClock;
use crate::holdback::HoldbackQueue;
use crate::protocol::{Mode, Protocol};
use crate::store::KvStore;

// Everything one replica owns, shared by its three threads. Protocols see
// the world only through this: clock, store, queue, broadcast, the
// pending-reply table, and the replica's own identity.
pub struct ReplicaCtx {
    pub id: ReplicaId,
    pub cluster_size: u32,
    pub clock: LamportClock,
    pub store: KvStore,
    pub queue: HoldbackQueue,
    publisher: Box<dyn Publisher>,
    // Reply slots for proposals this replica originated, keyed by the full
    // proposal; resolved by the deliverer when the proposal releases.
    pending: Mutex<HashMap<Proposal, ReplySlot>>,
    // Proposals in the order this replica applied them. Diagnostic surface:
    // cross-replica agreement checks and deterministic replay both read it.
    applied: Mutex<Vec<Proposal>>,
}

impl ReplicaCtx {
    pub fn new(id: ReplicaId, cluster_size: u32, publisher: Box<dyn Publisher>) -> ReplicaCtx {
        ReplicaCtx {
            id,
            cluster_size,
            clock: LamportClock::new(),
            store: KvStore::new(),
            queue: HoldbackQueue::new(cluster_size),
            publisher,
            pending: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn broadcast(&self, msg: &PeerMsg) -> Result<()> {
        self.publisher.publish(msg)
    }

    pub fn park_reply(&self, p: Proposal, slot: ReplySlot) {
        if self.pending.lock().unwrap().insert(p, slot).is_some() {
            // Two live proposals with one identity; the earlier client can
            // no longer be answered.
            error!(target: "concord", "{} replaced a pending reply slot", self.id);
        }
    }

    pub fn take_reply(&self, p: &Proposal) -> Option<ReplySlot> {
        self.pending.lock().unwrap().remove(p)
    }

    pub fn record_applied(&self, p: &Proposal) {
        self.applied.lock().unwrap().push(p.clone());
    }

    pub fn applied(&self) -> Vec<Proposal> {
        self.applied.lock().unwrap().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

pub struct Replica;

impl Replica {
    // Wire a replica up and let it run. Three threads: the client reactor
    // feeding requests to the protocol, the peer reactor feeding it
    // messages, and the deliverer draining the holdback queue. The threads
    // are detached; a replica serves until its process goes away, and the
    // handle left behind is an introspection surface, not a lifetime.
    pub fn spawn(
        id: ReplicaId,
        cluster_size: u32,
        mode: Mode,
        publisher: Box<dyn Publisher>,
        subscription: Box<dyn Subscription>,
        endpoint: Box<dyn ClientEndpoint>,
    ) -> Result<ReplicaHandle> {
        let protocol = mode.protocol()?;
        let ctx = Arc::new(ReplicaCtx::new(id, cluster_size, publisher));

        let (c, p) = (Arc::clone(&ctx), Arc::clone(&protocol));
        thread::Builder::new()
            .name(format!("{id}-client"))
            .spawn(move || client_reactor(c, p, endpoint))?;

        let (c, p) = (Arc::clone(&ctx), Arc::clone(&protocol));
        thread::Builder::new()
            .name(format!("{id}-peer"))
            .spawn(move || peer_reactor(c, p, subscription))?;

        let (c, p) = (Arc::clone(&ctx), Arc::clone(&protocol));
        thread::Builder::new()
            .name(format!("{id}-deliver"))
            .spawn(move || deliverer(c, p))?;

        Ok(ReplicaHandle { ctx })
    }
}

fn client_reactor(
    ctx: Arc<ReplicaCtx>,
    protocol: Arc<dyn Protocol>,
    mut endpoint: Box<dyn ClientEndpoint>,
) {
    loop {
        let (req, slot) = match endpoint.next() {
            Ok(pair) => pair,
            Err(_) => {
                // Endpoint torn down; nothing left to serve.
                debug!(target: "concord", "{} client reactor stopping", ctx.id);
                return;
            }
        };
        // A failed request drops its slot, which disconnects that client;
        // the replica itself keeps serving.
        let _ = protocol.on_client_request(&ctx, req, slot);
    }
}

fn peer_reactor(
    ctx: Arc<ReplicaCtx>,
    protocol: Arc<dyn Protocol>,
    mut subscription: Box<dyn Subscription>,
) {
    loop {
        let msg = match subscription.next() {
            Ok(msg) => msg,
            Err(_) => {
                debug!(target: "concord", "{} peer reactor stopping", ctx.id);
                ctx.queue.close();
                return;
            }
        };
        // Errors here are malformed-message drops; already logged.
        let _ = protocol.on_peer_message(&ctx, msg);
    }
}

fn deliverer(ctx: Arc<ReplicaCtx>, protocol: Arc<dyn Protocol>) {
    while let Some(p) = ctx.queue.next_ready() {
        let reply = protocol.apply(&ctx, &p);
        ctx.record_applied(&p);
        debug!(target: "concord", "{} applied {:?}", ctx.id, p);
        if p.origin == ctx.id {
            if let Some(slot) = ctx.take_reply(&p) {
                let _ = slot.send(reply);
            } else {
                error!(target: "concord", "{} released its own proposal with no pending client", ctx.id);
            }
        }
    }
}

// What the spawner keeps: a window into the replica's state, good for
// bootstrap diagnostics and for the cluster test suites.
pub struct ReplicaHandle {
    ctx: Arc<ReplicaCtx>,
}

impl ReplicaHandle {
    pub fn id(&self) -> ReplicaId {
        self.ctx.id
    }

    pub fn store_snapshot(&self) -> BTreeMap<String, i64> {
        self.ctx.store.snapshot()
    }

    pub fn applied(&self) -> Vec<Proposal> {
        self.ctx.applied()
    }

    pub fn queue_len(&self) -> usize {
        self.ctx.queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.ctx.pending_len()
    }
}
