//! Error types for segment versioning and invalidation.

use crate::segments::SegmentState;
use crate::types::{NodeId, SegmentId, TopologyId};
use thiserror::Error;

/// Result type alias for versioning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol violations. Two controllers mutated the same segment, or a
    /// transition was attempted from an impossible state.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The segment is not available for writes on this node.
    #[error("ownership error: {0}")]
    Ownership(#[from] OwnershipError),

    /// A transfer gate or the value-transfer signal failed.
    #[error("transfer failed: {0}")]
    Transfer(#[from] GateError),

    /// Transport errors. Absorbed by the broadcaster, never seen by writers.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The manager has been stopped.
    #[error("version manager stopped")]
    Stopped,
}

impl Error {
    /// Whether the caller should await the segment's transfer gate (or the
    /// next topology) and retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Ownership(OwnershipError::Blocked { .. }) => true,
            Error::Transfer(GateError::Stopping) => false,
            Error::Transfer(_) => true,
            _ => false,
        }
    }

    /// Whether this error signals an inconsistency that must not be retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Unrecoverable consistency errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Compare-and-set on a segment state failed.
    #[error("segment {segment} is in state {actual}, expected {expected}")]
    UnexpectedState {
        segment: SegmentId,
        expected: SegmentState,
        actual: SegmentState,
    },

    /// Topology id update that does not move forward.
    #[error("updating to topology {requested} but current is {current}")]
    StaleTopology {
        current: TopologyId,
        requested: TopologyId,
    },

    /// Another updater advanced the topology id concurrently.
    #[error("concurrent update to topology {requested}, current was {expected} but now it's {actual}")]
    ConcurrentTopologyUpdate {
        requested: TopologyId,
        expected: TopologyId,
        actual: TopologyId,
    },

    /// Segment index outside the table.
    #[error("segment {segment} out of range, table has {num_segments} segments")]
    SegmentOutOfRange { segment: SegmentId, num_segments: u32 },
}

/// Ownership and availability errors on the write path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    /// The segment is not owned by this node.
    #[error("segment {segment} is not owned by node {node_id}")]
    NotOwned { segment: SegmentId, node_id: NodeId },

    /// The segment is owned but blocked until key transfer starts.
    #[error("segment {segment} is currently blocked")]
    Blocked { segment: SegmentId },
}

/// Failure carried by a transfer gate or the value-transfer signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The segment was unregistered while a caller waited.
    #[error("the segment is no longer owned")]
    NoLongerOwned,

    /// Key transfer finished while the gate was still pending.
    #[error("segment state transition did not complete correctly")]
    TransitionIncomplete,

    /// Value transfer finished before versions were requested.
    #[error("failed to request versions")]
    VersionRequestFailed,

    /// The key transfer was cancelled by a newer topology.
    #[error("transfer cancelled")]
    Cancelled,

    /// The manager is stopping.
    #[error("cache is stopping")]
    Stopping,
}

/// Transport errors reported by an `InvalidationTransport`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// A member could not be reached.
    #[error("member {0} unreachable")]
    Unreachable(NodeId),

    /// The broadcast did not complete in time.
    #[error("broadcast timed out")]
    Timeout,

    /// Failed to send the command.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
