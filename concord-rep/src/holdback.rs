use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};

use concord_net::Proposal;

// The holdback queue: proposals ordered by (stamp, origin), each waiting for
// an acknowledgement from every replica before it may leave. Ack counters
// live beside the queue rather than inside it because the transport may
// reorder across senders: an ack can outrun the propose it acknowledges,
// and the count must survive until the propose shows up.
//
// Queue and counters share one mutex (the counters are only meaningful
// relative to queue contents) with a condvar so the deliverer can sleep
// until the head might have become releasable.

struct Inner {
    queue: BTreeSet<Proposal>,
    acks: HashMap<Proposal, u32>,
    closed: bool,
}

pub struct HoldbackQueue {
    cluster_size: u32,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl HoldbackQueue {
    pub fn new(cluster_size: u32) -> HoldbackQueue {
        HoldbackQueue {
            cluster_size,
            inner: Mutex::new(Inner {
                queue: BTreeSet::new(),
                acks: HashMap::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    // Insert unless an equal proposal is already queued. Returns whether it
    // was inserted, so callers can tell a duplicate from a first sighting.
    pub fn enqueue(&self, p: Proposal) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let inserted = inner.queue.insert(p);
        if inserted {
            self.ready.notify_all();
        }
        inserted
    }

    // Count one acknowledgement. The proposal need not be queued yet.
    pub fn ack(&self, p: &Proposal) {
        let mut inner = self.inner.lock().unwrap();
        *inner.acks.entry(p.clone()).or_insert(0) += 1;
        self.ready.notify_all();
    }

    // Release the head iff every replica has acknowledged it.
    pub fn try_deliver(&self) -> Option<Proposal> {
        let mut inner = self.inner.lock().unwrap();
        self.pop_releasable(&mut inner)
    }

    // Block until the head is releasable; None once close() was called and
    // nothing is releasable any more.
    pub fn next_ready(&self) -> Option<Proposal> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(p) = self.pop_releasable(&mut inner) {
                return Some(p);
            }
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_releasable(&self, inner: &mut Inner) -> Option<Proposal> {
        let head = inner.queue.first()?.clone();
        if inner.acks.get(&head).copied().unwrap_or(0) >= self.cluster_size {
            inner.queue.remove(&head);
            inner.acks.remove(&head);
            Some(head)
        } else {
            None
        }
    }
}
