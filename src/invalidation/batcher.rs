//! Batching of invalidations produced by writes.
//!
//! Writes merge `(key, version, removal)` records into the regular batch.
//! When the batch reaches the configured size it is swapped out and handed to
//! the broadcaster. Once a regular batch is delivered, its removals move into
//! the second-stage removed batch, which is broadcast as removal
//! confirmations when it grows past the threshold.

use crate::invalidation::{Delivery, InvalidationBroadcaster, PendingBatch};
use crate::metrics::VersioningMetrics;
use crate::types::{EntryVersion, InvalidateVersionsCommand, InvalidationInfo, Key};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Accumulates invalidations and triggers broadcasts.
#[derive(Debug)]
pub struct InvalidationBatcher {
    regular: PendingBatch,
    removed: PendingBatch,
    batch_size: usize,
    broadcaster: Arc<InvalidationBroadcaster>,
    metrics: Arc<VersioningMetrics>,
    runtime: Handle,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a broadcast task ends.
struct InFlight(Arc<InvalidationBatcher>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl InvalidationBatcher {
    /// Create a batcher. Broadcast tasks are spawned on `runtime`.
    pub fn new(
        batch_size: usize,
        broadcaster: Arc<InvalidationBroadcaster>,
        metrics: Arc<VersioningMetrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            regular: PendingBatch::new(batch_size),
            removed: PendingBatch::new(batch_size),
            batch_size,
            broadcaster,
            metrics,
            runtime,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Merge an invalidation into the regular batch, flushing it if it
    /// reached the batch size.
    pub fn schedule(self: &Arc<Self>, key: Key, version: EntryVersion, removal: bool) {
        let size = self.regular.merge(key, InvalidationInfo::new(version, removal));
        self.metrics.invalidations_scheduled.inc();
        if size >= self.batch_size {
            self.flush_regular(false);
        }
    }

    /// Flush pending invalidations.
    ///
    /// Sends the regular batch if it has entries. Otherwise, when `force` is
    /// set, sends the removed batch instead. Returns whether a broadcast was
    /// started; an empty unforced flush performs no I/O.
    pub fn flush(self: &Arc<Self>, force: bool) -> bool {
        if self.flush_regular(force) {
            true
        } else if force {
            self.flush_removed()
        } else {
            false
        }
    }

    fn flush_regular(self: &Arc<Self>, force: bool) -> bool {
        let entries = self.regular.take();
        if entries.is_empty() {
            return false;
        }

        let command = InvalidateVersionsCommand::from_entries(entries, false);
        let removals = command.removal_count();
        trace!(keys = command.len(), removals, force, "Flushing regular invalidations");

        self.spawn(move |this| async move {
            let delivery = this.broadcaster.broadcast_regular(&command).await;
            if delivery.is_delivered() && (removals > 0 || force) {
                this.regular_invalidation_finished(&command, force);
            }
        });
        true
    }

    /// Promote the removals of a delivered regular batch.
    fn regular_invalidation_finished(self: &Arc<Self>, command: &InvalidateVersionsCommand, force: bool) {
        let size = self.removed.merge_all(
            command
                .entries()
                .filter(|(_, info)| info.removal)
                .map(|(key, info)| (key.clone(), InvalidationInfo::removed(info.version))),
        );
        if size > self.batch_size || (force && size > 0) {
            self.flush_removed();
        }
    }

    fn flush_removed(self: &Arc<Self>) -> bool {
        let entries = self.removed.take();
        if entries.is_empty() {
            return false;
        }

        let command = InvalidateVersionsCommand::from_entries(entries, true);
        trace!(keys = command.len(), "Flushing removal confirmations");

        self.spawn(move |this| async move {
            if let Delivery::Delivered { attempts } =
                this.broadcaster.broadcast_removal(&command).await
            {
                trace!(keys = command.len(), attempts, "Removal confirmations delivered");
            }
        });
        true
    }

    fn spawn<F, Fut>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(self.clone());
        let fut = task(self.clone());
        self.runtime.spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    /// Drop both batches without delivering them. Returns the number of
    /// entries dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.regular.clear() + self.removed.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared pending invalidations");
        }
        dropped
    }

    /// Entries waiting in the regular batch.
    pub fn pending_regular(&self) -> usize {
        self.regular.len()
    }

    /// Entries waiting in the removed batch.
    pub fn pending_removed(&self) -> usize {
        self.removed.len()
    }

    /// Pending regular record for `key`, if any.
    pub fn pending_for(&self, key: &[u8]) -> Option<InvalidationInfo> {
        self.regular.get(key)
    }

    /// Number of broadcast tasks still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no broadcast task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::testing::{MockTransport, RecordingSink};
    use bytes::Bytes;
    use std::time::Duration;

    struct Fixture {
        batcher: Arc<InvalidationBatcher>,
        transport: Arc<MockTransport>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(VersioningMetrics::new());
        let broadcaster = Arc::new(InvalidationBroadcaster::new(
            transport.clone(),
            sink.clone(),
            RetryPolicy::immediate(),
            metrics.clone(),
        ));
        let batcher = Arc::new(InvalidationBatcher::new(
            batch_size,
            broadcaster,
            metrics,
            Handle::current(),
        ));
        Fixture {
            batcher,
            transport,
            sink,
        }
    }

    async fn settle(batcher: &InvalidationBatcher) {
        tokio::time::timeout(Duration::from_secs(5), batcher.wait_idle())
            .await
            .expect("broadcasts did not settle");
    }

    fn key(s: &'static str) -> Key {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_empty_unforced_flush_does_no_io() {
        let f = fixture(10);
        assert!(!f.batcher.flush(false));
        settle(&f.batcher).await;
        assert!(f.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let f = fixture(3);
        f.batcher.schedule(key("a"), EntryVersion::new(1, 1), false);
        f.batcher.schedule(key("b"), EntryVersion::new(1, 2), false);
        assert!(f.transport.attempts().is_empty());
        assert_eq!(f.batcher.pending_regular(), 2);

        f.batcher.schedule(key("c"), EntryVersion::new(1, 3), false);
        settle(&f.batcher).await;

        let sent = f.transport.delivered();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 3);
        assert!(!sent[0].removal_batch);
        assert_eq!(f.batcher.pending_regular(), 0);
    }

    #[tokio::test]
    async fn test_tied_removal_wins_in_batch() {
        let f = fixture(100);
        f.batcher.schedule(key("k"), EntryVersion::new(5, 10), false);
        f.batcher.schedule(key("k"), EntryVersion::new(5, 10), true);
        assert_eq!(
            f.batcher.pending_for(b"k"),
            Some(InvalidationInfo::new(EntryVersion::new(5, 10), true))
        );

        assert!(f.batcher.flush(true));
        settle(&f.batcher).await;

        let regular = &f.transport.delivered()[0];
        assert_eq!(regular.keys, vec![key("k")]);
        assert_eq!(regular.removals, vec![true]);
    }

    #[tokio::test]
    async fn test_forced_flush_promotes_removals() {
        let f = fixture(100);
        f.batcher.schedule(key("gone"), EntryVersion::new(2, 4), true);
        f.batcher.schedule(key("kept"), EntryVersion::new(2, 5), false);

        assert!(f.batcher.flush(true));
        settle(&f.batcher).await;

        let sent = f.transport.delivered();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].removal_batch);
        assert!(sent[1].removal_batch);
        assert_eq!(sent[1].keys, vec![key("gone")]);
        assert_eq!(sent[1].versions, vec![4]);
        assert_eq!(f.sink.applied(), vec![sent[1].clone()]);
    }

    #[tokio::test]
    async fn test_unforced_flush_keeps_removals_below_threshold() {
        let f = fixture(2);
        f.batcher.schedule(key("x"), EntryVersion::new(1, 1), true);
        f.batcher.schedule(key("y"), EntryVersion::new(1, 2), true);
        settle(&f.batcher).await;

        // Regular batch delivered, both removals waiting in the second stage.
        assert_eq!(f.transport.delivered().len(), 1);
        assert_eq!(f.batcher.pending_removed(), 2);

        // A manual flush with nothing regular pending sends the removals.
        assert!(f.batcher.flush(true));
        settle(&f.batcher).await;
        let sent = f.transport.delivered();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].removal_batch);
        assert_eq!(f.batcher.pending_removed(), 0);
    }

    #[tokio::test]
    async fn test_removed_batch_flushes_past_threshold() {
        let f = fixture(2);
        for (i, k) in ["a", "b", "c", "d"].into_iter().enumerate() {
            f.batcher.schedule(key(k), EntryVersion::new(1, i as u64 + 1), true);
            settle(&f.batcher).await;
        }

        let removal_batches: Vec<_> = f
            .transport
            .delivered()
            .into_iter()
            .filter(|c| c.removal_batch)
            .collect();
        // Two removals sit at the threshold; the second regular batch pushes
        // the removed batch past it.
        assert_eq!(removal_batches.len(), 1);
        assert_eq!(removal_batches[0].len(), 4);
        assert_eq!(f.batcher.pending_removed(), 0);
    }

    #[tokio::test]
    async fn test_failed_broadcast_retried_without_loss() {
        let f = fixture(2);
        f.transport.fail_next(2);
        f.batcher.schedule(key("a"), EntryVersion::new(1, 1), false);
        f.batcher.schedule(key("b"), EntryVersion::new(1, 2), false);
        settle(&f.batcher).await;

        let attempts = f.transport.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(f.transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_both_batches() {
        let f = fixture(2);
        f.batcher.schedule(key("x"), EntryVersion::new(1, 1), true);
        f.batcher.schedule(key("y"), EntryVersion::new(1, 2), true);
        settle(&f.batcher).await;
        f.batcher.schedule(key("z"), EntryVersion::new(1, 3), false);

        assert_eq!(f.batcher.clear(), 3);
        assert_eq!(f.batcher.pending_regular(), 0);
        assert_eq!(f.batcher.pending_removed(), 0);
        assert!(!f.batcher.flush(true));
    }
}
