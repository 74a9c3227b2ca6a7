//! Topology collaborator contract.

use crate::types::{NodeId, SegmentId};

/// Read-only view of the current cache topology.
///
/// Segment ownership is decided by the consistent hash behind this trait;
/// the version manager only asks about the local node.
pub trait TopologyProvider: Send + Sync + std::fmt::Debug {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Whether the node has joined the cache topology.
    fn is_connected(&self) -> bool;

    /// Whether the current consistent hash assigns `segment` to this node.
    fn is_segment_local(&self, segment: SegmentId) -> bool;
}
