//! Invalidation protocol.
//!
//! Nodes that do not own a segment still keep metadata for its keys. Every
//! overwrite or removal on the owner is announced to all members so they can
//! drop stale metadata. Delivery is at-least-once per key and version, but
//! not ordered across keys; receivers compare the attached version.
//!
//! ```text
//!  write path ──► InvalidationBatcher ──(batch full)──► InvalidationBroadcaster ──► all members
//!                  │ regular batch                            │ retry until delivered
//!                  │                                          ▼
//!                  └◄──── removals of delivered batch ────────┘
//!                    removed batch ──(past threshold)──► removal confirmations ──► all members
//!                                                                      └──► local sink
//! ```

mod batch;
mod batcher;
mod broadcaster;
mod transport;

pub use batch::PendingBatch;
pub use batcher::InvalidationBatcher;
pub use broadcaster::{Delivery, InvalidationBroadcaster};
pub use transport::{InvalidationSink, InvalidationTransport, NoopSink};
