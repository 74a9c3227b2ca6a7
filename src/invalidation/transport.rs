//! Collaborator contracts for delivering invalidations.

use crate::error::Result;
use crate::types::InvalidateVersionsCommand;

/// Sends invalidation commands to every live cluster member.
///
/// Members that leave while the call is in flight are ignored. The call
/// resolves once every remaining member has acknowledged, or fails. The
/// version manager makes no assumption about whether the local node is
/// among the targets.
#[async_trait::async_trait]
pub trait InvalidationTransport: Send + Sync + std::fmt::Debug {
    /// Broadcast a command and wait for acknowledgement.
    async fn broadcast(&self, command: &InvalidateVersionsCommand) -> Result<()>;
}

/// Applies an invalidation command to local state.
#[async_trait::async_trait]
pub trait InvalidationSink: Send + Sync + std::fmt::Debug {
    /// Execute the command against the local data container.
    async fn apply(&self, command: &InvalidateVersionsCommand) -> Result<()>;
}

/// Sink that ignores every command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait::async_trait]
impl InvalidationSink for NoopSink {
    async fn apply(&self, _command: &InvalidateVersionsCommand) -> Result<()> {
        Ok(())
    }
}
