//! Crate-wide error taxonomy.
//!
//! Configuration and protocol violations are the fatal class: the embedder
//! is expected to abort startup (or the offending node) after logging.
//! Everything else is recoverable and returned to the caller.

use crate::{EndpointId, GroupId, NodeId};

/// Errors surfaced by the transport, coordinator, tracker, and slicer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or inconsistent bootstrap information. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A peer violated the wire or control protocol. Fatal for the
    /// receiving node.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Operation invoked before the transport was started.
    #[error("transport not started")]
    NotReady,

    /// No route to the destination node exists or could be established.
    #[error("no route to node {0}")]
    UnknownDestination(NodeId),

    /// Group id that was never registered at startup.
    #[error("unknown group id {0:#x}")]
    UnknownGroup(GroupId),

    /// Endpoint id already bound to another tracker.
    #[error("endpoint {0} already registered")]
    DuplicateEndpoint(EndpointId),

    /// A monitored peer missed enough heartbeats to be considered dead.
    /// Recoverable; reaction policy belongs to the embedder.
    #[error("peer {0} unreachable")]
    PeerUnreachable(NodeId),

    /// Slicer precondition violation: keys not strictly ascending.
    #[error("keys must be sorted and unique")]
    InvalidKeyOrder,

    /// Byte buffer cannot be reinterpreted at the requested element width.
    #[error("buffer of {bytes} bytes is not a multiple of element width {width}")]
    Layout { bytes: usize, width: usize },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
