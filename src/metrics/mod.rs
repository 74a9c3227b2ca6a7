//! Metrics for segment ownership and invalidation traffic.
//!
//! Prometheus-style counters and gauges, updated on the hot path with relaxed
//! atomics and exported either as a [`MetricsSnapshot`] or as text exposition.

mod instruments;

pub use instruments::{Counter, Gauge, Instrument};

use crate::segments::SegmentState;

/// Metrics recorded by the version manager.
#[derive(Debug)]
pub struct VersioningMetrics {
    /// Versions handed out to writers.
    pub versions_allocated: Counter,
    /// Invalidations merged into the regular batch.
    pub invalidations_scheduled: Counter,
    /// Regular batches delivered to all members.
    pub regular_batches_sent: Counter,
    /// Removal-confirmation batches delivered to all members.
    pub removal_batches_sent: Counter,
    /// Keys delivered in regular batches.
    pub keys_invalidated: Counter,
    /// Keys delivered in removal-confirmation batches.
    pub keys_confirmed_removed: Counter,
    /// Failed broadcast attempts.
    pub broadcast_failures: Counter,
    /// Batches given up on by a bounded retry policy, or dropped at stop.
    pub batches_abandoned: Counter,
    /// Segments registered for incoming ownership.
    pub segments_registered: Counter,
    /// Segments unregistered.
    pub segments_unregistered: Counter,
    /// Segments currently OWNED.
    pub owned_segments: Gauge,
    /// Segments registered but not yet OWNED.
    pub transfers_in_progress: Gauge,
}

impl VersioningMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            versions_allocated: Counter::new(
                "scattered_versions_allocated_total",
                "Versions allocated for writes",
            ),
            invalidations_scheduled: Counter::new(
                "scattered_invalidations_scheduled_total",
                "Invalidations merged into the pending batch",
            ),
            regular_batches_sent: Counter::new(
                "scattered_regular_batches_sent_total",
                "Regular invalidation batches delivered",
            ),
            removal_batches_sent: Counter::new(
                "scattered_removal_batches_sent_total",
                "Removal confirmation batches delivered",
            ),
            keys_invalidated: Counter::new(
                "scattered_keys_invalidated_total",
                "Keys delivered in regular batches",
            ),
            keys_confirmed_removed: Counter::new(
                "scattered_keys_confirmed_removed_total",
                "Keys delivered in removal confirmation batches",
            ),
            broadcast_failures: Counter::new(
                "scattered_broadcast_failures_total",
                "Failed invalidation broadcast attempts",
            ),
            batches_abandoned: Counter::new(
                "scattered_batches_abandoned_total",
                "Invalidation batches never delivered",
            ),
            segments_registered: Counter::new(
                "scattered_segments_registered_total",
                "Segments registered for incoming ownership",
            ),
            segments_unregistered: Counter::new(
                "scattered_segments_unregistered_total",
                "Segments unregistered",
            ),
            owned_segments: Gauge::new("scattered_owned_segments", "Segments currently owned"),
            transfers_in_progress: Gauge::new(
                "scattered_segments_transferring",
                "Segments registered but not yet owned",
            ),
        }
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            versions_allocated: self.versions_allocated.get(),
            invalidations_scheduled: self.invalidations_scheduled.get(),
            regular_batches_sent: self.regular_batches_sent.get(),
            removal_batches_sent: self.removal_batches_sent.get(),
            keys_invalidated: self.keys_invalidated.get(),
            keys_confirmed_removed: self.keys_confirmed_removed.get(),
            broadcast_failures: self.broadcast_failures.get(),
            batches_abandoned: self.batches_abandoned.get(),
            segments_registered: self.segments_registered.get(),
            segments_unregistered: self.segments_unregistered.get(),
            owned_segments: self.owned_segments.get(),
            transfers_in_progress: self.transfers_in_progress.get(),
        }
    }

    /// Move the ownership gauges for one segment leaving `from` for `to`.
    pub fn record_transition(&self, from: SegmentState, to: SegmentState) {
        if let Some(gauge) = self.state_gauge(from) {
            gauge.dec();
        }
        if let Some(gauge) = self.state_gauge(to) {
            gauge.inc();
        }
    }

    /// Record `count` transferring segments forced to OWNED at once.
    pub fn record_promoted(&self, count: usize) {
        let count = count as i64;
        self.transfers_in_progress.add(-count);
        self.owned_segments.add(count);
    }

    fn state_gauge(&self, state: SegmentState) -> Option<&Gauge> {
        match state {
            SegmentState::Owned => Some(&self.owned_segments),
            s if s.is_transferring() => Some(&self.transfers_in_progress),
            _ => None,
        }
    }

    fn instruments(&self) -> [&dyn Instrument; 12] {
        [
            &self.versions_allocated,
            &self.invalidations_scheduled,
            &self.regular_batches_sent,
            &self.removal_batches_sent,
            &self.keys_invalidated,
            &self.keys_confirmed_removed,
            &self.broadcast_failures,
            &self.batches_abandoned,
            &self.segments_registered,
            &self.segments_unregistered,
            &self.owned_segments,
            &self.transfers_in_progress,
        ]
    }

    /// Render in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for instrument in self.instruments() {
            instrument.expose(&mut output);
        }
        output
    }
}

impl Default for VersioningMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of [`VersioningMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub versions_allocated: u64,
    pub invalidations_scheduled: u64,
    pub regular_batches_sent: u64,
    pub removal_batches_sent: u64,
    pub keys_invalidated: u64,
    pub keys_confirmed_removed: u64,
    pub broadcast_failures: u64,
    pub batches_abandoned: u64,
    pub segments_registered: u64,
    pub segments_unregistered: u64,
    pub owned_segments: i64,
    pub transfers_in_progress: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = VersioningMetrics::new();
        metrics.versions_allocated.inc_by(3);
        metrics.broadcast_failures.inc();
        metrics.owned_segments.set(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.versions_allocated, 3);
        assert_eq!(snapshot.broadcast_failures, 1);
        assert_eq!(snapshot.owned_segments, 7);
        assert_eq!(snapshot.regular_batches_sent, 0);
    }

    #[test]
    fn test_record_transition() {
        let metrics = VersioningMetrics::new();
        metrics.record_transition(SegmentState::NotOwned, SegmentState::Blocked);
        metrics.record_transition(SegmentState::NotOwned, SegmentState::Blocked);
        metrics.record_transition(SegmentState::Blocked, SegmentState::KeyTransfer);
        assert_eq!(metrics.transfers_in_progress.get(), 2);

        metrics.record_transition(SegmentState::KeyTransfer, SegmentState::Owned);
        metrics.record_transition(SegmentState::Blocked, SegmentState::NotOwned);
        assert_eq!(metrics.transfers_in_progress.get(), 0);
        assert_eq!(metrics.owned_segments.get(), 1);

        metrics.record_transition(SegmentState::NotOwned, SegmentState::ValueTransfer);
        metrics.record_promoted(1);
        assert_eq!(metrics.transfers_in_progress.get(), 0);
        assert_eq!(metrics.owned_segments.get(), 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = VersioningMetrics::new();
        metrics.regular_batches_sent.inc();

        let output = metrics.to_prometheus();
        assert!(output.contains("scattered_regular_batches_sent_total 1"));
        assert!(output.contains("# TYPE scattered_owned_segments gauge"));
    }
}
