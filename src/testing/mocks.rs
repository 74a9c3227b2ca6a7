//! In-memory collaborators.

use crate::error::{NetworkError, Result};
use crate::invalidation::{InvalidationSink, InvalidationTransport};
use crate::topology::TopologyProvider;
use crate::types::{InvalidateVersionsCommand, NodeId, SegmentId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Transport that records every broadcast and can be told to fail.
#[derive(Debug, Default)]
pub struct MockTransport {
    attempts: Mutex<Vec<InvalidateVersionsCommand>>,
    delivered: Mutex<Vec<InvalidateVersionsCommand>>,
    failures_remaining: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` broadcasts. `usize::MAX` fails forever.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Every command passed to `broadcast`, failed attempts included.
    pub fn attempts(&self) -> Vec<InvalidateVersionsCommand> {
        self.attempts.lock().clone()
    }

    /// Commands that were acknowledged.
    pub fn delivered(&self) -> Vec<InvalidateVersionsCommand> {
        self.delivered.lock().clone()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait::async_trait]
impl InvalidationTransport for MockTransport {
    async fn broadcast(&self, command: &InvalidateVersionsCommand) -> Result<()> {
        self.attempts.lock().push(command.clone());
        if self.take_failure() {
            return Err(NetworkError::Timeout.into());
        }
        self.delivered.lock().push(command.clone());
        Ok(())
    }
}

/// Sink that records every applied command.
#[derive(Debug, Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<InvalidateVersionsCommand>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<InvalidateVersionsCommand> {
        self.applied.lock().clone()
    }
}

#[async_trait::async_trait]
impl InvalidationSink for RecordingSink {
    async fn apply(&self, command: &InvalidateVersionsCommand) -> Result<()> {
        self.applied.lock().push(command.clone());
        Ok(())
    }
}

/// Topology with a fixed local segment set.
#[derive(Debug)]
pub struct StaticTopology {
    node_id: NodeId,
    connected: AtomicBool,
    local_segments: RwLock<HashSet<SegmentId>>,
}

impl StaticTopology {
    /// A connected node owning `segments`.
    pub fn new(node_id: NodeId, segments: impl IntoIterator<Item = SegmentId>) -> Self {
        Self {
            node_id,
            connected: AtomicBool::new(true),
            local_segments: RwLock::new(segments.into_iter().collect()),
        }
    }

    /// A node that has not joined the topology yet.
    pub fn disconnected(node_id: NodeId) -> Self {
        Self {
            node_id,
            connected: AtomicBool::new(false),
            local_segments: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl TopologyProvider for StaticTopology {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_segment_local(&self, segment: SegmentId) -> bool {
        self.local_segments.read().contains(&segment)
    }
}
