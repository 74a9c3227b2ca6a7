//! Testing utilities for the version manager.
//!
//! In-memory stand-ins for the collaborators the manager depends on:
//! - [`MockTransport`]: records broadcasts, injects failures
//! - [`RecordingSink`]: records locally applied invalidations
//! - [`StaticTopology`]: fixed local segment set
//!
//! # Example
//!
//! ```rust,ignore
//! use scattered::testing::{MockTransport, RecordingSink, StaticTopology};
//!
//! let transport = Arc::new(MockTransport::new());
//! transport.fail_next(2); // the next two broadcasts time out
//! ```

mod mocks;

pub use mocks::{MockTransport, RecordingSink, StaticTopology};

use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
