//! Segment ownership state machine.
//!
//! Every segment moves through the phases below during a rebalance. All
//! transitions are compare-and-set on the segment's state slot; a failed
//! compare-and-set is a protocol violation, never a retryable race.
//!
//! ```text
//!              register            start_key_transfer        finish_key_transfer
//!  NOT_OWNED ───────────► BLOCKED ───────────────────► KEY_TRANSFER ──────┬──────► OWNED
//!      ▲                     │                                  │          │
//!      │                     │ finish_key_transfer(cancelled)   │          │ (expect values)
//!      │◄────────────────────┴──────────────────────────────────┘          ▼
//!      │                                                            VALUE_TRANSFER
//!      │  unregister (any state)                                           │
//!      └───────────────────────────────    finish_value_transfer_for_all ──┴──► OWNED
//!
//!  NOT_OWNED ──── set_owned (preloaded owner) ────► OWNED
//! ```

mod state;
mod table;

pub use state::SegmentState;
pub use table::SegmentTable;
