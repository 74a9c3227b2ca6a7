//! Bulk value transfer tracking.
//!
//! While a rebalance streams values in, readers that need values of a given
//! topology wait on a shared completion signal. Each finished transfer
//! resolves the current signal and installs a fresh one under the same lock,
//! so a waiter always subscribes to a signal that will be resolved.

use crate::completion::Completion;
use crate::error::GateError;
use crate::types::TopologyId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct ValuesState {
    /// Last topology whose value transfer completed.
    values_topology: Option<TopologyId>,
    /// Resolved when the current (or next) value transfer finishes.
    signal: Arc<Completion>,
}

impl ValuesState {
    fn needs_wait(&self, topology_id: TopologyId) -> bool {
        self.values_topology.map_or(true, |done| topology_id > done)
    }
}

/// Tracks whether values are being transferred and lets callers await them.
#[derive(Debug)]
pub struct ValueTransferGate {
    transferring: AtomicBool,
    state: Mutex<ValuesState>,
}

impl ValueTransferGate {
    /// Create a gate with no transfer in progress.
    pub fn new() -> Self {
        Self {
            transferring: AtomicBool::new(false),
            state: Mutex::new(ValuesState {
                values_topology: None,
                signal: Arc::new(Completion::new()),
            }),
        }
    }

    /// Mark a value transfer for `topology_id` as in progress.
    pub fn begin(&self, topology_id: TopologyId) {
        let _state = self.state.lock();
        self.transferring.store(true, Ordering::SeqCst);
        trace!(topology_id, "Node will transfer values");
    }

    /// Mark the value transfer as finished and wake every waiter.
    pub fn end(&self, topology_id: TopologyId) {
        let finished = {
            let mut state = self.state.lock();
            state.values_topology = Some(state.values_topology.map_or(topology_id, |t| t.max(topology_id)));
            self.transferring.store(false, Ordering::SeqCst);
            std::mem::replace(&mut state.signal, Arc::new(Completion::new()))
        };
        finished.complete();
    }

    /// Whether a value transfer is in progress.
    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::SeqCst)
    }

    /// Last topology whose values have all been received.
    pub fn values_topology(&self) -> Option<TopologyId> {
        self.state.lock().values_topology
    }

    /// Resolve once values for `topology_id` are available.
    ///
    /// Returns immediately when no transfer is running or `topology_id` is
    /// not newer than the last completed transfer. Otherwise waits on the
    /// shared signal and re-checks, since a newer transfer may have started
    /// before this topology was reached.
    pub async fn await_values_for(&self, topology_id: TopologyId) -> Result<(), GateError> {
        loop {
            if !self.is_transferring() {
                return Ok(());
            }
            let waiter = {
                let state = self.state.lock();
                if !self.is_transferring() || !state.needs_wait(topology_id) {
                    return Ok(());
                }
                state.signal.waiter()
            };
            waiter.wait().await?;
        }
    }

    /// Whether `await_values_for(topology_id)` would resolve immediately.
    pub fn is_ready_for(&self, topology_id: TopologyId) -> bool {
        !self.is_transferring() || !self.state.lock().needs_wait(topology_id)
    }

    /// Fail current waiters and let every later call return immediately.
    pub fn stop(&self) {
        let signal = {
            let mut state = self.state.lock();
            state.values_topology = Some(TopologyId::MAX);
            state.signal.clone()
        };
        signal.fail(GateError::Stopping);
    }
}

impl Default for ValueTransferGate {
    fn default() -> Self {
        Self::new()
    }
}
