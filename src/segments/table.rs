//! Fixed-size table of per-segment ownership state.
//!
//! Each segment has a state slot, a version counter, the topology id in which
//! this node became owner, and an optional transfer gate. Single-slot
//! transitions use compare-and-set. Registration and unregistration touch
//! several arrays for one segment and take the table-wide transition lock;
//! they happen at rebalance frequency, never on the write path.

use crate::completion::Completion;
use crate::error::{GateError, OwnershipError, ProtocolError, Result};
use crate::segments::SegmentState;
use crate::types::{EntryVersion, NodeId, SegmentId, TopologyId};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Segment state table.
#[derive(Debug)]
pub struct SegmentTable {
    states: Box<[AtomicU8]>,
    versions: Box<[AtomicU64]>,
    owner_topology_ids: Box<[AtomicU32]>,
    gates: Box<[Mutex<Option<Arc<Completion>>>]>,
    transition_lock: Mutex<()>,
}

impl SegmentTable {
    /// Create a table with every segment NOT_OWNED.
    pub fn new(num_segments: u32) -> Self {
        let n = num_segments as usize;
        Self {
            states: (0..n)
                .map(|_| AtomicU8::new(SegmentState::NotOwned.as_u8()))
                .collect(),
            versions: (0..n).map(|_| AtomicU64::new(0)).collect(),
            owner_topology_ids: (0..n).map(|_| AtomicU32::new(0)).collect(),
            gates: (0..n).map(|_| Mutex::new(None)).collect(),
            transition_lock: Mutex::new(()),
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.states.len() as u32
    }

    fn index(&self, segment: SegmentId) -> Result<usize> {
        let idx = segment as usize;
        if idx < self.states.len() {
            Ok(idx)
        } else {
            Err(ProtocolError::SegmentOutOfRange {
                segment,
                num_segments: self.num_segments(),
            }
            .into())
        }
    }

    fn load(&self, idx: usize) -> SegmentState {
        SegmentState::from_u8(self.states[idx].load(Ordering::SeqCst))
    }

    fn compare_and_set(&self, idx: usize, expected: SegmentState, new: SegmentState) -> bool {
        self.states[idx]
            .compare_exchange(
                expected.as_u8(),
                new.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn swap(&self, idx: usize, new: SegmentState) -> SegmentState {
        SegmentState::from_u8(self.states[idx].swap(new.as_u8(), Ordering::SeqCst))
    }

    fn unexpected(&self, segment: SegmentId, expected: SegmentState) -> crate::error::Error {
        let actual = self
            .index(segment)
            .map(|idx| self.load(idx))
            .unwrap_or(SegmentState::NotOwned);
        ProtocolError::UnexpectedState {
            segment,
            expected,
            actual,
        }
        .into()
    }

    fn gate(&self, idx: usize) -> Option<Arc<Completion>> {
        self.gates[idx].lock().clone()
    }

    fn fail_gate(&self, idx: usize, error: GateError) {
        if let Some(gate) = self.gate(idx) {
            gate.fail(error);
        }
    }

    /// Current state of a segment.
    pub fn state(&self, segment: SegmentId) -> Result<SegmentState> {
        Ok(self.load(self.index(segment)?))
    }

    /// Set the initial state of a segment at start-up.
    pub(crate) fn initialize(&self, segment: SegmentId, state: SegmentState) -> Result<()> {
        let idx = self.index(segment)?;
        self.states[idx].store(state.as_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Owner topology id of a segment.
    pub fn owner_topology_id(&self, segment: SegmentId) -> Result<TopologyId> {
        Ok(self.owner_topology_ids[self.index(segment)?].load(Ordering::SeqCst))
    }

    /// Last allocated version counter of a segment.
    pub fn current_version(&self, segment: SegmentId) -> Result<u64> {
        Ok(self.versions[self.index(segment)?].load(Ordering::SeqCst))
    }

    /// NOT_OWNED -> BLOCKED.
    ///
    /// Resets the version counter, records `topology_id` as owner topology and
    /// installs a fresh transfer gate.
    pub fn register(&self, segment: SegmentId, topology_id: TopologyId) -> Result<()> {
        let idx = self.index(segment)?;
        let _guard = self.transition_lock.lock();

        if self.load(idx) != SegmentState::NotOwned {
            return Err(self.unexpected(segment, SegmentState::NotOwned));
        }
        self.owner_topology_ids[idx].store(topology_id, Ordering::SeqCst);
        self.versions[idx].store(0, Ordering::SeqCst);
        *self.gates[idx].lock() = Some(Arc::new(Completion::new()));

        if !self.compare_and_set(idx, SegmentState::NotOwned, SegmentState::Blocked) {
            return Err(self.unexpected(segment, SegmentState::NotOwned));
        }
        trace!(segment, topology_id, "Segment blocked for new owner");
        Ok(())
    }

    /// Any state -> NOT_OWNED. Returns the previous state.
    ///
    /// A pending transfer gate fails with [`GateError::NoLongerOwned`].
    pub fn unregister(&self, segment: SegmentId) -> Result<SegmentState> {
        let idx = self.index(segment)?;
        let _guard = self.transition_lock.lock();

        let previous = self.swap(idx, SegmentState::NotOwned);
        self.fail_gate(idx, GateError::NoLongerOwned);
        trace!(segment, %previous, "Segment unregistered");
        Ok(previous)
    }

    /// BLOCKED -> KEY_TRANSFER. Completes the transfer gate successfully.
    pub fn start_key_transfer(&self, segment: SegmentId) -> Result<()> {
        let idx = self.index(segment)?;
        if !self.compare_and_set(idx, SegmentState::Blocked, SegmentState::KeyTransfer) {
            return Err(self.unexpected(segment, SegmentState::Blocked));
        }
        if let Some(gate) = self.gate(idx) {
            gate.complete();
        }
        trace!(segment, "Segment expects key transfer");
        Ok(())
    }

    /// KEY_TRANSFER (or a still BLOCKED segment) -> NOT_OWNED if cancelled,
    /// VALUE_TRANSFER if values are expected, OWNED otherwise.
    ///
    /// A gate that is still pending fails: with [`GateError::Cancelled`] for a
    /// cancelled transfer, [`GateError::TransitionIncomplete`] otherwise.
    /// Returns the previous state.
    pub fn finish_key_transfer(
        &self,
        segment: SegmentId,
        expect_values: bool,
        cancelled: bool,
    ) -> Result<SegmentState> {
        let idx = self.index(segment)?;
        let update = SegmentState::after_key_transfer(expect_values, cancelled);

        let previous = loop {
            let current = self.load(idx);
            if !matches!(current, SegmentState::Blocked | SegmentState::KeyTransfer) {
                return Err(ProtocolError::UnexpectedState {
                    segment,
                    expected: SegmentState::KeyTransfer,
                    actual: current,
                }
                .into());
            }
            if self.compare_and_set(idx, current, update) {
                break current;
            }
        };

        self.fail_gate(
            idx,
            if cancelled {
                GateError::Cancelled
            } else {
                GateError::TransitionIncomplete
            },
        );
        trace!(segment, %previous, %update, "Finished key transfer");
        Ok(previous)
    }

    /// Force every BLOCKED, KEY_TRANSFER or VALUE_TRANSFER segment to OWNED.
    ///
    /// Segments still BLOCKED or in KEY_TRANSFER are anomalies at this point:
    /// their gates fail with [`GateError::VersionRequestFailed`] and a warning
    /// is logged. Returns the number of segments moved to OWNED.
    pub fn finish_value_transfer_for_all(&self, topology_id: TopologyId) -> usize {
        let mut promoted = 0;
        for idx in 0..self.states.len() {
            loop {
                let state = self.load(idx);
                match state {
                    SegmentState::NotOwned | SegmentState::Owned => break,
                    SegmentState::Blocked | SegmentState::KeyTransfer => {
                        self.fail_gate(idx, GateError::VersionRequestFailed);
                        warn!(
                            segment = idx,
                            topology_id,
                            %state,
                            "Stopped applying state but the segment is still transferring"
                        );
                    }
                    SegmentState::ValueTransfer => {}
                }
                if self.compare_and_set(idx, state, SegmentState::Owned) {
                    promoted += 1;
                    break;
                }
            }
        }
        promoted
    }

    /// NOT_OWNED -> OWNED directly, for segments owned at start-up.
    ///
    /// Resets the version counter and owner topology only once the segment
    /// is known to be NOT_OWNED; a rejected call leaves the segment as it was.
    /// A gate left over from an earlier ownership is dropped.
    pub fn set_owned(&self, segment: SegmentId, topology_id: TopologyId) -> Result<()> {
        let idx = self.index(segment)?;
        let _guard = self.transition_lock.lock();

        if self.load(idx) != SegmentState::NotOwned {
            return Err(self.unexpected(segment, SegmentState::NotOwned));
        }
        self.versions[idx].store(0, Ordering::SeqCst);
        self.owner_topology_ids[idx].store(topology_id, Ordering::SeqCst);
        *self.gates[idx].lock() = None;

        if !self.compare_and_set(idx, SegmentState::NotOwned, SegmentState::Owned) {
            return Err(self.unexpected(segment, SegmentState::NotOwned));
        }
        Ok(())
    }

    /// Allocate the next version for a write in `segment`.
    pub fn allocate_version(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        node_id: NodeId,
    ) -> Result<EntryVersion> {
        let idx = self.index(segment)?;
        match self.load(idx) {
            SegmentState::NotOwned => Err(OwnershipError::NotOwned { segment, node_id }.into()),
            SegmentState::Blocked => Err(OwnershipError::Blocked { segment }.into()),
            SegmentState::KeyTransfer | SegmentState::ValueTransfer | SegmentState::Owned => {
                let version = self.versions[idx].fetch_add(1, Ordering::SeqCst) + 1;
                Ok(EntryVersion::new(topology_id, version))
            }
        }
    }

    /// Whether `version` was stamped no earlier than this node's ownership
    /// of `segment` began.
    pub fn is_version_actual(&self, segment: SegmentId, version: EntryVersion) -> Result<bool> {
        let idx = self.index(segment)?;
        Ok(version.topology_id >= self.owner_topology_ids[idx].load(Ordering::SeqCst))
    }

    /// Transfer gate of a segment, if one was ever installed.
    pub fn blocking_gate(&self, segment: SegmentId) -> Result<Option<Arc<Completion>>> {
        Ok(self.gate(self.index(segment)?))
    }

    /// Fail every pending transfer gate. Returns the number failed.
    pub fn fail_pending_gates(&self, error: GateError) -> usize {
        self.gates
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .filter(|gate| gate.fail(error.clone()))
            .count()
    }

    /// Snapshot of every segment's state.
    pub fn states(&self) -> Vec<SegmentState> {
        (0..self.states.len()).map(|idx| self.load(idx)).collect()
    }

    /// Segments currently in `state`.
    pub fn segments_in(&self, state: SegmentState) -> Vec<SegmentId> {
        (0..self.states.len())
            .filter(|idx| self.load(*idx) == state)
            .map(|idx| idx as SegmentId)
            .collect()
    }

    /// Render the table, 16 segments per row as `NNNN=C`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, state) in self.states().into_iter().enumerate() {
            if idx % 16 == 0 {
                out.push('\n');
            }
            let _ = write!(out, "{:4}={} ", idx, state.single_char());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_register_and_key_transfer() {
        let table = SegmentTable::new(8);
        table.register(3, 5).unwrap();
        assert_eq!(table.state(3).unwrap(), SegmentState::Blocked);
        assert_eq!(table.owner_topology_id(3).unwrap(), 5);

        let gate = table.blocking_gate(3).unwrap().unwrap();
        assert!(!gate.is_done());

        table.start_key_transfer(3).unwrap();
        assert_eq!(table.state(3).unwrap(), SegmentState::KeyTransfer);
        assert_eq!(gate.result(), Some(Ok(())));

        let previous = table.finish_key_transfer(3, false, false).unwrap();
        assert_eq!(previous, SegmentState::KeyTransfer);
        assert_eq!(table.state(3).unwrap(), SegmentState::Owned);
    }

    #[test]
    fn test_register_twice_is_protocol_violation() {
        let table = SegmentTable::new(4);
        table.register(1, 1).unwrap();
        let err = table.register(1, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedState {
                segment: 1,
                expected: SegmentState::NotOwned,
                actual: SegmentState::Blocked,
            })
        ));
    }

    #[test]
    fn test_start_key_transfer_requires_blocked() {
        let table = SegmentTable::new(4);
        assert!(table.start_key_transfer(0).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_unregister_fails_gate() {
        let table = SegmentTable::new(4);
        table.register(2, 1).unwrap();
        let gate = table.blocking_gate(2).unwrap().unwrap();

        assert_eq!(table.unregister(2).unwrap(), SegmentState::Blocked);
        assert_eq!(table.state(2).unwrap(), SegmentState::NotOwned);
        assert_eq!(gate.result(), Some(Err(GateError::NoLongerOwned)));
    }

    #[test]
    fn test_cancelled_key_transfer() {
        let table = SegmentTable::new(4);
        table.register(0, 1).unwrap();
        let gate = table.blocking_gate(0).unwrap().unwrap();

        // Cancelled before the key transfer even started.
        table.finish_key_transfer(0, false, true).unwrap();
        assert_eq!(table.state(0).unwrap(), SegmentState::NotOwned);
        assert_eq!(gate.result(), Some(Err(GateError::Cancelled)));
    }

    #[test]
    fn test_cancellation_overrides_expected_values() {
        let table = SegmentTable::new(4);
        table.register(0, 1).unwrap();
        let gate = table.blocking_gate(0).unwrap().unwrap();

        let previous = table.finish_key_transfer(0, true, true).unwrap();
        assert_eq!(previous, SegmentState::Blocked);
        assert_eq!(table.state(0).unwrap(), SegmentState::NotOwned);
        assert_eq!(gate.result(), Some(Err(GateError::Cancelled)));

        table.register(1, 1).unwrap();
        table.start_key_transfer(1).unwrap();
        table.finish_key_transfer(1, true, true).unwrap();
        assert_eq!(table.state(1).unwrap(), SegmentState::NotOwned);
    }

    #[test]
    fn test_finish_key_transfer_expecting_values() {
        let table = SegmentTable::new(4);
        table.register(0, 1).unwrap();
        table.start_key_transfer(0).unwrap();
        table.finish_key_transfer(0, true, false).unwrap();
        assert_eq!(table.state(0).unwrap(), SegmentState::ValueTransfer);

        // Gate already completed successfully, failing it is a no-op.
        let gate = table.blocking_gate(0).unwrap().unwrap();
        assert_eq!(gate.result(), Some(Ok(())));
    }

    #[test]
    fn test_finish_key_transfer_from_owned_is_violation() {
        let table = SegmentTable::new(4);
        table.set_owned(1, 1).unwrap();
        assert!(table
            .finish_key_transfer(1, false, false)
            .unwrap_err()
            .is_protocol_violation());
    }

    #[test]
    fn test_allocate_version_by_state() {
        let table = SegmentTable::new(4);
        assert!(matches!(
            table.allocate_version(0, 1, 9),
            Err(Error::Ownership(OwnershipError::NotOwned { segment: 0, node_id: 9 }))
        ));

        table.register(0, 1).unwrap();
        assert!(matches!(
            table.allocate_version(0, 1, 9),
            Err(Error::Ownership(OwnershipError::Blocked { segment: 0 }))
        ));

        table.start_key_transfer(0).unwrap();
        assert_eq!(table.allocate_version(0, 2, 9).unwrap(), EntryVersion::new(2, 1));
        assert_eq!(table.allocate_version(0, 2, 9).unwrap(), EntryVersion::new(2, 2));
        assert_eq!(table.current_version(0).unwrap(), 2);
    }

    #[test]
    fn test_versions_reset_on_new_ownership() {
        let table = SegmentTable::new(2);
        table.set_owned(0, 1).unwrap();
        table.allocate_version(0, 1, 1).unwrap();
        table.allocate_version(0, 1, 1).unwrap();

        table.unregister(0).unwrap();
        table.register(0, 4).unwrap();
        table.start_key_transfer(0).unwrap();
        assert_eq!(table.allocate_version(0, 4, 1).unwrap(), EntryVersion::new(4, 1));
    }

    #[test]
    fn test_rejected_set_owned_keeps_ownership() {
        let table = SegmentTable::new(4);
        table.set_owned(1, 3).unwrap();
        assert_eq!(table.allocate_version(1, 3, 1).unwrap(), EntryVersion::new(3, 1));
        let last = table.allocate_version(1, 3, 1).unwrap();
        assert_eq!(last, EntryVersion::new(3, 2));

        let err = table.set_owned(1, 9).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedState {
                segment: 1,
                expected: SegmentState::NotOwned,
                actual: SegmentState::Owned,
            })
        ));

        assert_eq!(table.owner_topology_id(1).unwrap(), 3);
        assert!(table.is_version_actual(1, last).unwrap());
        let next = table.allocate_version(1, 3, 1).unwrap();
        assert!(next > last);
        assert_eq!(next, EntryVersion::new(3, 3));
    }

    #[test]
    fn test_set_owned_rejected_while_blocked() {
        let table = SegmentTable::new(4);
        table.register(2, 5).unwrap();
        table.start_key_transfer(2).unwrap();
        table.allocate_version(2, 5, 1).unwrap();

        assert!(table.set_owned(2, 8).unwrap_err().is_protocol_violation());
        assert_eq!(table.state(2).unwrap(), SegmentState::KeyTransfer);
        assert_eq!(table.owner_topology_id(2).unwrap(), 5);
        assert_eq!(table.current_version(2).unwrap(), 1);
    }

    #[test]
    fn test_set_owned_drops_stale_gate() {
        let table = SegmentTable::new(4);
        table.register(3, 1).unwrap();
        table.unregister(3).unwrap();
        table.set_owned(3, 2).unwrap();
        assert!(table.blocking_gate(3).unwrap().is_none());
    }

    #[test]
    fn test_version_actual() {
        let table = SegmentTable::new(2);
        table.register(1, 7).unwrap();
        assert!(table.is_version_actual(1, EntryVersion::new(7, 1)).unwrap());
        assert!(table.is_version_actual(1, EntryVersion::new(8, 0)).unwrap());
        assert!(!table.is_version_actual(1, EntryVersion::new(6, 100)).unwrap());
    }

    #[test]
    fn test_finish_value_transfer_for_all() {
        let table = SegmentTable::new(5);
        table.register(0, 1).unwrap(); // BLOCKED
        table.register(1, 1).unwrap();
        table.start_key_transfer(1).unwrap(); // KEY_TRANSFER
        table.register(2, 1).unwrap();
        table.start_key_transfer(2).unwrap();
        table.finish_key_transfer(2, true, false).unwrap(); // VALUE_TRANSFER
        table.set_owned(3, 1).unwrap(); // OWNED
        // 4 stays NOT_OWNED

        let blocked_gate = table.blocking_gate(0).unwrap().unwrap();

        assert_eq!(table.finish_value_transfer_for_all(1), 3);
        assert_eq!(
            table.states(),
            vec![
                SegmentState::Owned,
                SegmentState::Owned,
                SegmentState::Owned,
                SegmentState::Owned,
                SegmentState::NotOwned,
            ]
        );
        assert_eq!(blocked_gate.result(), Some(Err(GateError::VersionRequestFailed)));
    }

    #[test]
    fn test_out_of_range() {
        let table = SegmentTable::new(2);
        assert!(matches!(
            table.state(2),
            Err(Error::Protocol(ProtocolError::SegmentOutOfRange { segment: 2, num_segments: 2 }))
        ));
    }

    #[test]
    fn test_fail_pending_gates() {
        let table = SegmentTable::new(3);
        table.register(0, 1).unwrap();
        table.register(1, 1).unwrap();
        table.start_key_transfer(1).unwrap();

        assert_eq!(table.fail_pending_gates(GateError::Stopping), 1);
        assert_eq!(
            table.blocking_gate(0).unwrap().unwrap().result(),
            Some(Err(GateError::Stopping))
        );
    }

    #[test]
    fn test_render() {
        let table = SegmentTable::new(18);
        table.set_owned(1, 0).unwrap();
        let rendered = table.render();
        assert_eq!(rendered.lines().filter(|l| !l.is_empty()).count(), 2);
        assert!(rendered.contains("   1=O"));
        assert!(rendered.contains("  17=N"));
    }

    #[test]
    fn test_concurrent_version_allocation() {
        let table = Arc::new(SegmentTable::new(1));
        table.set_owned(0, 1).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| table.allocate_version(0, 1, 1).unwrap().version)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(*all.last().unwrap(), 4000);
    }
}
