//! Per-segment ownership phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ownership phase of a segment on the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentState {
    /// Not owned by this node.
    NotOwned = 0,
    /// Registered as new owner, no key data yet. Reads must wait.
    Blocked = 1,
    /// Receiving key metadata without values.
    KeyTransfer = 2,
    /// Keys present, values still streaming in.
    ValueTransfer = 3,
    /// Fully available.
    Owned = 4,
}

impl SegmentState {
    pub(crate) const fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SegmentState::NotOwned,
            1 => SegmentState::Blocked,
            2 => SegmentState::KeyTransfer,
            3 => SegmentState::ValueTransfer,
            4 => SegmentState::Owned,
            other => unreachable!("invalid segment state {other}"),
        }
    }

    /// One-letter code used in the segment table dump.
    pub fn single_char(self) -> char {
        match self {
            SegmentState::NotOwned => 'N',
            SegmentState::Blocked => 'B',
            SegmentState::KeyTransfer => 'K',
            SegmentState::ValueTransfer => 'V',
            SegmentState::Owned => 'O',
        }
    }

    /// State a segment lands in when its key transfer finishes.
    ///
    /// Cancellation wins over `expect_values`.
    pub const fn after_key_transfer(expect_values: bool, cancelled: bool) -> Self {
        if cancelled {
            SegmentState::NotOwned
        } else if expect_values {
            SegmentState::ValueTransfer
        } else {
            SegmentState::Owned
        }
    }

    /// Whether versions may be allocated in this state.
    pub fn accepts_writes(self) -> bool {
        matches!(
            self,
            SegmentState::KeyTransfer | SegmentState::ValueTransfer | SegmentState::Owned
        )
    }

    /// Whether the segment is between registration and full ownership.
    pub fn is_transferring(self) -> bool {
        matches!(
            self,
            SegmentState::Blocked | SegmentState::KeyTransfer | SegmentState::ValueTransfer
        )
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentState::NotOwned => write!(f, "NOT_OWNED"),
            SegmentState::Blocked => write!(f, "BLOCKED"),
            SegmentState::KeyTransfer => write!(f, "KEY_TRANSFER"),
            SegmentState::ValueTransfer => write!(f, "VALUE_TRANSFER"),
            SegmentState::Owned => write!(f, "OWNED"),
        }
    }
}
