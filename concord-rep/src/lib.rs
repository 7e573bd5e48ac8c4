// The consistency layer: three replication protocols over one replica
// fabric.
//
// Every replica holds the complete key-value map and takes set/get through
// a local request/response endpoint. The replica set is fixed and fully
// connected, the transport is reliable and FIFO per directed pair, and
// nothing here persists or recovers; what varies with the configured level
// is only how operations observed at different replicas get ordered:
//
//  1. Linearizability: classical Lamport total-order multicast, over reads
//     as well as writes. The origin stamps the operation and broadcasts a
//     propose; every replica holds it back in a queue ordered by
//     (stamp, origin) while acknowledgements accumulate; when the queue
//     head has an ack from every replica it is applied, and on the origin
//     the client gets its answer. Reads ride the same pipeline, so all
//     replicas agree on the read/write interleaving and an operation takes
//     effect between its invocation and its response.
//
//  2. Sequential: writes exactly as above; reads answered on the spot from
//     the local store. One cluster-wide write order, program order per
//     client, but a read may be stale with respect to real time.
//
//  3. Eventual: reads and writes are both local. Writes are broadcast
//     best-effort with no acknowledgements, and a receiving replica applies
//     one iff its (stamp, origin) beats the last writer it has recorded for
//     that key, so every key converges to its greatest writer.
//
// A fourth level, causal, is declared in configuration but has no protocol
// yet; asking for it is a startup error.
//
// Each replica runs three threads: a client reactor, a peer reactor, and a
// deliverer draining the holdback queue. They share the clock, store,
// queue, and pending-reply table. Locks are leaves with one exception: the
// eventual protocol writes the store and apply log under its last-writer
// lock, so record and store cannot disagree about who wrote last. The
// store and apply-log locks are innermost everywhere, so no cycle exists.

pub mod clock;
pub mod holdback;
pub mod protocol;
pub mod replica;
pub mod store;

pub use clock::LamportClock;
pub use holdback::HoldbackQueue;
pub use protocol::{Eventual, Linearizable, Mode, Protocol, Sequential};
pub use replica::{Replica, ReplicaCtx, ReplicaHandle};
pub use store::KvStore;
