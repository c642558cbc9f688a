//! Communication and coordination substrate for a distributed parameter
//! server.
//!
//! A courier cluster is a fixed set of worker, server, and scheduler
//! processes that exchange key-ranged key-value updates and control
//! messages. The crate provides the transport that frames and moves
//! [`Envelope`]s between node identities, the per-endpoint
//! [`RequestTracker`] that counts outstanding replies, the process-wide
//! [`Coordinator`] that owns topology and the barrier rendezvous protocol,
//! and the [`slice`](slice::slice) routine that partitions a sorted
//! key-value batch across server key ranges.
//!
//! There is no implicit global state: each process constructs one
//! [`Coordinator`] (tests may run several in one process) and hands it to
//! every tracker and application object built on top of it.

pub mod cluster;
pub mod config;
pub mod envelope;
pub mod error;
pub mod kv;
pub mod range;
pub mod sarray;
pub mod slice;
pub mod tracker;
pub mod transport;

pub use cluster::Coordinator;
pub use config::{NodeConfig, Role};
pub use envelope::{Control, ControlCmd, Envelope, Meta};
pub use error::{Error, Result};
pub use kv::{KvServer, KvWorker};
pub use range::KeyRange;
pub use sarray::{DataType, Element, SArray};
pub use slice::{slice, KvPairs};
pub use tracker::{Mailbox, RecvHandler, RequestTracker};
pub use transport::Transport;

/// Key type for the parameter domain. The served domain is `[0, Key::MAX)`.
pub type Key = u64;

/// Unique identity of one cluster process.
pub type NodeId = u32;

/// A node group identifier: a single node id, a role flag, or an
/// OR-combination of role flags.
pub type GroupId = u32;

/// Identity of one logical application endpoint within a node.
pub type EndpointId = u32;

/// Sequence number of one outstanding request within a tracker.
pub type Timestamp = u64;

/// Group flag addressing the scheduler. Doubles as the scheduler's node id.
pub const SCHEDULER: GroupId = 1;

/// Group flag addressing every server node.
pub const SERVER_GROUP: GroupId = 2;

/// Group flag addressing every worker node.
pub const WORKER_GROUP: GroupId = 4;

/// Every node in the cluster.
pub const ALL_GROUPS: GroupId = SCHEDULER | SERVER_GROUP | WORKER_GROUP;

/// Reserved node id of the scheduler.
///
/// Data node ids start at 8 so they can never collide with an OR-combination
/// of the role flags above (at most 7).
pub const SCHEDULER_ID: NodeId = SCHEDULER;

/// Node id of the server with the given rank.
pub fn server_rank_to_id(rank: usize) -> NodeId {
    (rank * 2 + 8) as NodeId
}

/// Node id of the worker with the given rank.
pub fn worker_rank_to_id(rank: usize) -> NodeId {
    (rank * 2 + 9) as NodeId
}

/// Rank of a server or worker node id. The scheduler has no rank.
pub fn node_id_to_rank(id: NodeId) -> usize {
    debug_assert!(id >= 8, "rank is only defined for data nodes");
    ((id - 8) / 2) as usize
}
