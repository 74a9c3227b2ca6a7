//! One-shot completion signal.
//!
//! A `Completion` is resolved at most once, either successfully or with a
//! [`GateError`]. Any number of waiters may await it; waiters that subscribe
//! after resolution return immediately. Holders that need a fresh signal
//! replace the whole `Arc<Completion>` instead of resetting it, so a waiter
//! can never miss the resolution of the signal it subscribed to.

use crate::error::GateError;
use tokio::sync::watch;

type Slot = Option<Result<(), GateError>>;

/// Single-shot completion signal with any number of waiters.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Slot>,
}

impl Completion {
    /// Create a pending signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Create a signal that is already completed.
    pub fn completed() -> Self {
        let (tx, _rx) = watch::channel(Some(Ok(())));
        Self { tx }
    }

    /// Complete successfully. Returns false if already resolved.
    pub fn complete(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Complete with an error. Returns false if already resolved.
    pub fn fail(&self, error: GateError) -> bool {
        self.resolve(Err(error))
    }

    fn resolve(&self, result: Result<(), GateError>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        })
    }

    /// Whether the signal has been resolved.
    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The resolution, if any.
    pub fn result(&self) -> Option<Result<(), GateError>> {
        self.tx.borrow().clone()
    }

    /// Subscribe to the signal. The waiter owns its receiver so it can be
    /// moved into another task.
    pub fn waiter(&self) -> CompletionWaiter {
        CompletionWaiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait for the signal to resolve.
    pub async fn wait(&self) -> Result<(), GateError> {
        self.waiter().wait().await
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned handle awaiting a [`Completion`].
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: watch::Receiver<Slot>,
}

impl CompletionWaiter {
    /// Wait for the signal to resolve.
    ///
    /// A signal dropped without resolution counts as cancelled.
    pub async fn wait(mut self) -> Result<(), GateError> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Ok(())),
            Err(_) => Err(GateError::Cancelled),
        }
    }
}
