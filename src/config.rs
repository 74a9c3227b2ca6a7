//! Configuration for the version manager.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone)]
pub struct VersioningConfig {
    /// Number of segments. Fixed for the process lifetime.
    pub num_segments: u32,

    /// Number of pending invalidations that triggers a broadcast.
    pub invalidation_batch_size: usize,

    /// Retry policy for invalidation broadcasts.
    pub retry: RetryPolicy,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            num_segments: 256,
            invalidation_batch_size: 128,
            retry: RetryPolicy::default(),
        }
    }
}

impl VersioningConfig {
    /// Create a configuration with the given segment count.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments,
            ..Default::default()
        }
    }

    /// Set the invalidation batch size.
    pub fn with_invalidation_batch_size(mut self, size: usize) -> Self {
        self.invalidation_batch_size = size;
        self
    }

    /// Set the broadcast retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the configuration for values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be greater than zero".to_string()));
        }
        if self.invalidation_batch_size == 0 {
            return Err(Error::Config(
                "invalidation_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(Error::Config(format!(
                "retry min_delay {:?} exceeds max_delay {:?}",
                self.retry.min_delay, self.retry.max_delay
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(Error::Config("retry max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Retry policy for invalidation broadcasts.
///
/// The default retries forever: a dropped invalidation leaves stale metadata
/// on remote nodes with no other repair path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,

    /// Upper bound for the delay between retries.
    pub max_delay: Duration,

    /// Total attempts (first send included). `None` retries forever.
    pub max_attempts: Option<usize>,

    /// Whether to add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retry forever without any delay.
    pub fn immediate() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: None,
            jitter: false,
        }
    }

    /// Limit the total number of attempts.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the delay bounds.
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn allows_attempt(&self, attempts: usize) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delays between consecutive attempts.
    ///
    /// Once the exponential schedule runs out the delay stays at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(32);
        if self.jitter {
            builder = builder.with_jitter();
        }
        let max_delay = self.max_delay;
        builder.build().chain(std::iter::repeat(max_delay))
    }
}
