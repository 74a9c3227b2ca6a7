//! Delivery of invalidation batches to the cluster.
//!
//! All network I/O and retry logic for invalidations lives here. A failed
//! broadcast is resent with exactly the same content until it succeeds, the
//! retry policy gives up, or the broadcaster is shut down.

use crate::config::RetryPolicy;
use crate::invalidation::{InvalidationSink, InvalidationTransport};
use crate::metrics::VersioningMetrics;
use crate::types::InvalidateVersionsCommand;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Outcome of delivering one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every live member acknowledged the batch.
    Delivered { attempts: usize },
    /// The retry policy ran out of attempts.
    Abandoned { attempts: usize },
    /// The broadcaster was shut down before delivery.
    Cancelled,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

/// Sends invalidation batches to all members with retries.
#[derive(Debug)]
pub struct InvalidationBroadcaster {
    transport: Arc<dyn InvalidationTransport>,
    local_sink: Arc<dyn InvalidationSink>,
    retry: RetryPolicy,
    metrics: Arc<VersioningMetrics>,
    shutdown: CancellationToken,
}

impl InvalidationBroadcaster {
    /// Create a broadcaster.
    pub fn new(
        transport: Arc<dyn InvalidationTransport>,
        local_sink: Arc<dyn InvalidationSink>,
        retry: RetryPolicy,
        metrics: Arc<VersioningMetrics>,
    ) -> Self {
        Self {
            transport,
            local_sink,
            retry,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop every in-flight retry loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Deliver a regular batch.
    pub async fn broadcast_regular(&self, command: &InvalidateVersionsCommand) -> Delivery {
        let delivery = self.deliver(command).await;
        if delivery.is_delivered() {
            self.metrics.regular_batches_sent.inc();
            self.metrics.keys_invalidated.inc_by(command.len() as u64);
        }
        delivery
    }

    /// Deliver a removal-confirmation batch, then apply it to the local node.
    ///
    /// The local application does not rely on the transport reaching this
    /// node; it always runs once the remote delivery succeeded.
    pub async fn broadcast_removal(&self, command: &InvalidateVersionsCommand) -> Delivery {
        let delivery = self.deliver(command).await;
        if delivery.is_delivered() {
            self.metrics.removal_batches_sent.inc();
            self.metrics
                .keys_confirmed_removed
                .inc_by(command.len() as u64);
            if let Err(e) = self.local_sink.apply(command).await {
                warn!(error = %e, keys = command.len(), "Failed to apply removal invalidations locally");
            }
        }
        delivery
    }

    async fn deliver(&self, command: &InvalidateVersionsCommand) -> Delivery {
        let mut delays = self.retry.delays();
        let mut attempts = 0;

        loop {
            if self.shutdown.is_cancelled() {
                self.metrics.batches_abandoned.inc();
                return Delivery::Cancelled;
            }

            attempts += 1;
            match self.transport.broadcast(command).await {
                Ok(()) => {
                    debug!(
                        keys = command.len(),
                        removal_batch = command.removal_batch,
                        attempts,
                        "Invalidation batch delivered"
                    );
                    return Delivery::Delivered { attempts };
                }
                Err(e) => {
                    self.metrics.broadcast_failures.inc();
                    warn!(
                        error = %e,
                        keys = command.len(),
                        removal_batch = command.removal_batch,
                        attempt = attempts,
                        "Failed invalidating remote caches, retrying"
                    );
                    if !self.retry.allows_attempt(attempts) {
                        self.metrics.batches_abandoned.inc();
                        error!(
                            keys = command.len(),
                            removal_batch = command.removal_batch,
                            attempts,
                            "Giving up on invalidation batch"
                        );
                        return Delivery::Abandoned { attempts };
                    }
                }
            }

            let delay = delays.next().unwrap_or(self.retry.max_delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.metrics.batches_abandoned.inc();
                    return Delivery::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
