//! Write version allocation.
//!
//! Versions are `(topology_id, counter)`. The counter is per segment and is
//! reset only when the segment becomes freshly owned, never on a topology
//! change, so versions stay monotonic for the whole period of continuous
//! ownership and the topology component orders versions across changes.

use crate::error::{ProtocolError, Result};
use crate::segments::SegmentTable;
use crate::types::{EntryVersion, NodeId, SegmentId, TopologyId};
use std::sync::atomic::{AtomicU32, Ordering};

/// Tracks the current topology id and stamps writes with versions.
#[derive(Debug, Default)]
pub struct VersionAllocator {
    topology_id: AtomicU32,
    preloaded_topology_id: AtomicU32,
}

impl VersionAllocator {
    /// Create an allocator at topology 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id.load(Ordering::SeqCst)
    }

    /// Advance the topology id.
    ///
    /// The new id must be strictly greater than the current one, and the
    /// update is rejected if another updater advanced it concurrently.
    pub fn set_topology_id(&self, topology_id: TopologyId) -> Result<()> {
        let current = self.topology_id.load(Ordering::SeqCst);
        if current >= topology_id {
            return Err(ProtocolError::StaleTopology {
                current,
                requested: topology_id,
            }
            .into());
        }
        self.topology_id
            .compare_exchange(current, topology_id, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| {
                ProtocolError::ConcurrentTopologyUpdate {
                    requested: topology_id,
                    expected: current,
                    actual,
                }
                .into()
            })
    }

    /// Allocate the next version for a write in `segment`.
    pub fn allocate(
        &self,
        table: &SegmentTable,
        segment: SegmentId,
        node_id: NodeId,
    ) -> Result<EntryVersion> {
        table.allocate_version(segment, self.topology_id(), node_id)
    }

    /// Record the version of an entry loaded from persistent storage.
    pub fn update_preloaded_entry_version(&self, version: EntryVersion) {
        self.preloaded_topology_id
            .fetch_max(version.topology_id, Ordering::SeqCst);
    }

    /// Highest topology id seen among preloaded entries.
    pub fn preloaded_topology_id(&self) -> TopologyId {
        self.preloaded_topology_id.load(Ordering::SeqCst)
    }
}
