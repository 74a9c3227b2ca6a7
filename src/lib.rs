//! Segment ownership, write versioning and invalidation for a partitioned cache.
//!
//! This crate is the core a scattered cache node uses to decide whether it may
//! accept writes for a segment, to stamp those writes with versions, and to
//! tell other nodes when the metadata they hold for a key went stale:
//! - **Segment table** with a lock-free per-segment state machine
//! - **Version allocator** scoped by topology id
//! - **Invalidation batching** with retried broadcasts
//! - **Value-transfer gate** for readers waiting on a rebalance
//!
//! The RPC transport, consistent hash and data container are collaborators
//! behind the [`InvalidationTransport`], [`InvalidationSink`] and
//! [`TopologyProvider`] traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use scattered::testing::{MockTransport, RecordingSink, StaticTopology};
//! use scattered::{ScatteredVersionManager, VersioningConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ScatteredVersionManager::new(
//!         VersioningConfig::new(256).with_invalidation_batch_size(64),
//!         Arc::new(StaticTopology::new(1, [0, 1, 2])),
//!         Arc::new(MockTransport::new()),
//!         Arc::new(RecordingSink::new()),
//!     )?;
//!     manager.start()?;
//!     manager.set_topology_id(1)?;
//!
//!     // Write path: stamp, store, announce.
//!     let version = manager.increment_version(0)?;
//!     manager.schedule_key_invalidation(&b"user:123"[..], version, false)?;
//!
//!     manager.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        write path / rebalance driver         │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          ScatteredVersionManager            │
//! │  • increment_version(segment)               │
//! │  • schedule_key_invalidation(key, version)  │
//! │  • register / unregister / transfer phases  │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬──────────────┐
//!     ▼               ▼               ▼              ▼
//! ┌─────────┐   ┌──────────┐   ┌────────────┐  ┌────────┐
//! │ Segment │   │ Version  │   │Invalidation│  │ Values │
//! │  Table  │   │Allocator │   │  Batcher   │  │  Gate  │
//! └─────────┘   └──────────┘   └────────────┘  └────────┘
//!                                     │
//!                                     ▼
//!                              broadcast + retry
//! ```
//!
//! # Consistency Model
//!
//! - **Versions**: strictly increasing per segment while continuously owned
//! - **Invalidations**: at-least-once per key and version, unordered across keys
//! - **Transitions**: a failed compare-and-set is a protocol violation, never retried

pub mod completion;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod manager;
pub mod metrics;
pub mod segments;
pub mod testing;
pub mod topology;
pub mod types;
pub mod values;
pub mod version;

// Re-export main types for convenience
pub use config::{RetryPolicy, VersioningConfig};
pub use error::{Error, GateError, NetworkError, OwnershipError, ProtocolError, Result};
pub use manager::ScatteredVersionManager;
pub use types::{
    segment_for_key, EntryVersion, InvalidateVersionsCommand, InvalidationInfo, Key, NodeId,
    SegmentId, TopologyId,
};

// Re-export collaborator contracts
pub use invalidation::{InvalidationSink, InvalidationTransport, NoopSink};
pub use topology::TopologyProvider;

// Re-export state and signal types
pub use completion::{Completion, CompletionWaiter};
pub use segments::SegmentState;
pub use values::ValueTransferGate;

// Re-export metrics types
pub use metrics::{Counter, Gauge, Instrument, MetricsSnapshot, VersioningMetrics};
