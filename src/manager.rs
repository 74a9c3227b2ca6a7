//! Segment version manager.
//!
//! `ScatteredVersionManager` is the entry point used by the rebalance driver
//! and the write path. It ties together the segment table, the version
//! allocator, the invalidation batcher and the value-transfer gate.
//!
//! # Write path
//!
//! ```rust,ignore
//! let version = manager.increment_version(segment)?;
//! // ... store the entry stamped with `version` ...
//! manager.schedule_key_invalidation(key, version, false)?;
//! ```
//!
//! A write that hits a BLOCKED segment gets a retryable
//! [`OwnershipError::Blocked`](crate::error::OwnershipError) and should await
//! [`ScatteredVersionManager::await_segment`] before retrying.
//!
//! # Rebalance path
//!
//! ```text
//! register_segment ──► start_key_transfer ──► notify_key_transfer_finished
//!                                                        │
//!     set_values_transfer_topology ──► ... ──► notify_value_transfer_finished
//! ```

use crate::completion::CompletionWaiter;
use crate::config::VersioningConfig;
use crate::error::{Error, GateError, Result};
use crate::invalidation::{
    InvalidationBatcher, InvalidationBroadcaster, InvalidationSink, InvalidationTransport,
};
use crate::metrics::VersioningMetrics;
use crate::segments::{SegmentState, SegmentTable};
use crate::topology::TopologyProvider;
use crate::types::{segment_for_key, EntryVersion, Key, SegmentId, TopologyId};
use crate::values::ValueTransferGate;
use crate::version::VersionAllocator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

/// Per-segment ownership, versioning and invalidation for one cache.
#[derive(Debug)]
pub struct ScatteredVersionManager {
    config: VersioningConfig,
    topology: Arc<dyn TopologyProvider>,
    table: SegmentTable,
    versions: VersionAllocator,
    values: ValueTransferGate,
    broadcaster: Arc<InvalidationBroadcaster>,
    batcher: Arc<InvalidationBatcher>,
    metrics: Arc<VersioningMetrics>,
    stopped: AtomicBool,
}

impl ScatteredVersionManager {
    /// Create a manager.
    ///
    /// Must be called from within a tokio runtime; broadcast tasks are
    /// spawned on it.
    pub fn new(
        config: VersioningConfig,
        topology: Arc<dyn TopologyProvider>,
        transport: Arc<dyn InvalidationTransport>,
        local_sink: Arc<dyn InvalidationSink>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime available: {}", e)))?;

        let metrics = Arc::new(VersioningMetrics::new());
        let broadcaster = Arc::new(InvalidationBroadcaster::new(
            transport,
            local_sink,
            config.retry.clone(),
            metrics.clone(),
        ));
        let batcher = Arc::new(InvalidationBatcher::new(
            config.invalidation_batch_size,
            broadcaster.clone(),
            metrics.clone(),
            runtime,
        ));

        Ok(Self {
            table: SegmentTable::new(config.num_segments),
            versions: VersionAllocator::new(),
            values: ValueTransferGate::new(),
            config,
            topology,
            broadcaster,
            batcher,
            metrics,
            stopped: AtomicBool::new(false),
        })
    }

    /// Set the initial state of every segment from the current topology.
    ///
    /// A segment is OWNED if the node is connected and the topology assigns
    /// it here, NOT_OWNED otherwise.
    pub fn start(&self) -> Result<()> {
        self.ensure_running()?;
        let connected = self.topology.is_connected();
        let mut owned = 0;
        for segment in 0..self.table.num_segments() {
            let state = if connected && self.topology.is_segment_local(segment) {
                owned += 1;
                SegmentState::Owned
            } else {
                SegmentState::NotOwned
            };
            self.table.initialize(segment, state)?;
        }
        self.metrics.owned_segments.set(owned);
        self.metrics.transfers_in_progress.set(0);
        info!(
            node_id = self.topology.local_node(),
            num_segments = self.table.num_segments(),
            owned = self.metrics.owned_segments.get(),
            "Version manager started"
        );
        self.dump_table();
        Ok(())
    }

    /// Stop the manager.
    ///
    /// Fails every pending transfer gate and the value-transfer signal with
    /// [`GateError::Stopping`], cancels broadcast retries and drops pending
    /// invalidations. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let node_id = self.topology.local_node();
        trace!(node_id, "Stopping version manager");

        self.values.stop();
        let failed = self.table.fail_pending_gates(GateError::Stopping);
        self.broadcaster.shutdown();
        let dropped = self.batcher.clear();

        info!(node_id, failed_gates = failed, dropped, "Version manager stopped");
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    // ---- rebalance ----

    /// Register this node as the new owner of `segment`: NOT_OWNED -> BLOCKED.
    #[tracing::instrument(skip(self), fields(node_id = self.topology.local_node()))]
    pub fn register_segment(&self, segment: SegmentId) -> Result<()> {
        self.ensure_running()?;
        self.table.register(segment, self.versions.topology_id())?;
        self.metrics.segments_registered.inc();
        self.metrics
            .record_transition(SegmentState::NotOwned, SegmentState::Blocked);
        Ok(())
    }

    /// Drop ownership of `segment`. Returns the state it was in.
    #[tracing::instrument(skip(self), fields(node_id = self.topology.local_node()))]
    pub fn unregister_segment(&self, segment: SegmentId) -> Result<SegmentState> {
        self.ensure_running()?;
        let previous = self.table.unregister(segment)?;
        self.metrics.segments_unregistered.inc();
        self.metrics
            .record_transition(previous, SegmentState::NotOwned);
        Ok(previous)
    }

    /// Move each segment from BLOCKED to KEY_TRANSFER and release writers
    /// blocked on it. Stops at the first segment in an unexpected state.
    #[tracing::instrument(skip(self, segments), fields(count = segments.len()))]
    pub fn start_key_transfer(&self, segments: &[SegmentId]) -> Result<()> {
        self.ensure_running()?;
        segments
            .iter()
            .try_for_each(|&segment| self.table.start_key_transfer(segment))
    }

    /// Finish the key transfer of `segment`. Returns the state it was in.
    ///
    /// A cancelled transfer returns the segment to NOT_OWNED regardless of
    /// `expect_values`.
    #[tracing::instrument(skip(self))]
    pub fn notify_key_transfer_finished(
        &self,
        segment: SegmentId,
        expect_values: bool,
        cancelled: bool,
    ) -> Result<SegmentState> {
        self.ensure_running()?;
        let previous = self
            .table
            .finish_key_transfer(segment, expect_values, cancelled)?;
        self.metrics.record_transition(
            previous,
            SegmentState::after_key_transfer(expect_values, cancelled),
        );
        Ok(previous)
    }

    /// Mark segments already held at start-up as OWNED: NOT_OWNED -> OWNED.
    #[tracing::instrument(skip(self, segments), fields(count = segments.len()))]
    pub fn set_owned_segments(&self, segments: &[SegmentId]) -> Result<()> {
        self.ensure_running()?;
        let topology_id = self.versions.topology_id();
        for &segment in segments {
            self.table.set_owned(segment, topology_id)?;
            self.metrics
                .record_transition(SegmentState::NotOwned, SegmentState::Owned);
        }
        debug!(
            node_id = self.topology.local_node(),
            ?segments,
            "Node is now owner of segments"
        );
        self.dump_table();
        Ok(())
    }

    /// A bulk value transfer for `topology_id` has started.
    #[tracing::instrument(skip(self))]
    pub fn set_values_transfer_topology(&self, topology_id: TopologyId) {
        self.values.begin(topology_id);
    }

    /// The value transfer for `topology_id` finished.
    ///
    /// Every segment still transferring becomes OWNED, then waiters for
    /// values of `topology_id` or older are released.
    #[tracing::instrument(skip(self))]
    pub fn notify_value_transfer_finished(&self, topology_id: TopologyId) {
        let promoted = self.table.finish_value_transfer_for_all(topology_id);
        self.values.end(topology_id);
        self.metrics.record_promoted(promoted);
        debug!(
            node_id = self.topology.local_node(),
            topology_id, promoted, "Finished values transfer"
        );
        self.dump_table();
    }

    // ---- topology and versions ----

    /// Advance the topology id. Must be strictly increasing.
    pub fn set_topology_id(&self, topology_id: TopologyId) -> Result<()> {
        self.versions.set_topology_id(topology_id)?;
        trace!(topology_id, "Topology id updated");
        Ok(())
    }

    /// Current topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.versions.topology_id()
    }

    pub fn segment_state(&self, segment: SegmentId) -> Result<SegmentState> {
        self.table.state(segment)
    }

    /// Stamp a write in `segment` with the next version.
    pub fn increment_version(&self, segment: SegmentId) -> Result<EntryVersion> {
        self.ensure_running()?;
        let version = self
            .versions
            .allocate(&self.table, segment, self.topology.local_node())?;
        self.metrics.versions_allocated.inc();
        Ok(version)
    }

    /// Whether `version` was stamped under this node's current ownership of
    /// `segment`.
    pub fn is_version_actual(&self, segment: SegmentId, version: EntryVersion) -> Result<bool> {
        self.table.is_version_actual(segment, version)
    }

    /// Record the version of an entry loaded from persistent storage.
    pub fn update_preloaded_entry_version(&self, version: EntryVersion) {
        self.versions.update_preloaded_entry_version(version);
    }

    pub fn preloaded_topology_id(&self) -> TopologyId {
        self.versions.preloaded_topology_id()
    }

    // ---- invalidations ----

    /// Announce an overwrite or removal of `key` at `version` to the cluster.
    ///
    /// Never blocks on I/O; the batch is sent in the background once full.
    pub fn schedule_key_invalidation(
        &self,
        key: impl Into<Key>,
        version: EntryVersion,
        removal: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        self.batcher.schedule(key.into(), version, removal);
        Ok(())
    }

    /// Drop every pending invalidation without sending it. Returns the
    /// number of entries dropped.
    pub fn clear_invalidations(&self) -> usize {
        self.batcher.clear()
    }

    /// Send pending invalidations now: the regular batch if it has entries,
    /// otherwise the pending removal confirmations. Returns whether anything
    /// was sent.
    pub fn start_flush(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.batcher.flush(true)
    }

    /// Wait until no invalidation broadcast is in flight.
    pub async fn wait_idle(&self) {
        self.batcher.wait_idle().await
    }

    /// Invalidations waiting in either batch.
    pub fn pending_invalidations(&self) -> usize {
        self.batcher.pending_regular() + self.batcher.pending_removed()
    }

    // ---- waiting ----

    /// Subscribe to the transfer gate of `segment`.
    ///
    /// Returns `None` if the segment was never registered on this node. The
    /// waiter resolves once the segment leaves BLOCKED, or fails if it is
    /// unregistered, cancelled or the manager stops.
    pub fn blocking_future(&self, segment: SegmentId) -> Result<Option<CompletionWaiter>> {
        Ok(self.table.blocking_gate(segment)?.map(|gate| gate.waiter()))
    }

    /// Wait until `segment` is no longer BLOCKED.
    pub async fn await_segment(&self, segment: SegmentId) -> Result<()> {
        match self.blocking_future(segment)? {
            Some(waiter) => waiter.wait().await.map_err(Error::from),
            None => Ok(()),
        }
    }

    /// Resolve once values for `topology_id` are available locally.
    pub async fn values_future(&self, topology_id: TopologyId) -> Result<()> {
        self.values
            .await_values_for(topology_id)
            .await
            .map_err(Error::from)
    }

    // ---- introspection ----

    pub fn config(&self) -> &VersioningConfig {
        &self.config
    }

    pub fn num_segments(&self) -> u32 {
        self.table.num_segments()
    }

    /// Segment that `key` falls into.
    pub fn segment_for_key(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.table.num_segments())
    }

    /// Snapshot of every segment's state.
    pub fn segment_states(&self) -> Vec<SegmentState> {
        self.table.states()
    }

    pub fn owned_segments(&self) -> Vec<SegmentId> {
        self.table.segments_in(SegmentState::Owned)
    }

    pub fn metrics(&self) -> &VersioningMetrics {
        &self.metrics
    }

    /// Segment table rendered 16 segments per row.
    pub fn render_table(&self) -> String {
        self.table.render()
    }

    fn dump_table(&self) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                node_id = self.topology.local_node(),
                "Segments for node:{}",
                self.table.render()
            );
        }
    }
}

impl Drop for ScatteredVersionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
