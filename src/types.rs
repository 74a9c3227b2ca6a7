//! Core types shared by the segment table, the version allocator and the
//! invalidation protocol.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Index of a segment in `[0, num_segments)`.
pub type SegmentId = u32;

/// Cluster membership/ownership epoch.
pub type TopologyId = u32;

/// Cache keys are opaque byte strings.
pub type Key = Bytes;

/// Version stamped on every write: `(topology_id, counter)`.
///
/// Ordered by topology id first, then by counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryVersion {
    /// Topology in which the version was allocated.
    pub topology_id: TopologyId,
    /// Per-segment counter.
    pub version: u64,
}

impl EntryVersion {
    /// Create a new version.
    pub const fn new(topology_id: TopologyId, version: u64) -> Self {
        Self {
            topology_id,
            version,
        }
    }
}

impl PartialOrd for EntryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_id
            .cmp(&other.topology_id)
            .then(self.version.cmp(&other.version))
    }
}

impl std::fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topology_id, self.version)
    }
}

/// Pending invalidation for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationInfo {
    /// Version of the write that produced the invalidation.
    pub version: EntryVersion,
    /// Whether the write removed the entry.
    pub removal: bool,
}

impl InvalidationInfo {
    /// Create a new invalidation record.
    pub const fn new(version: EntryVersion, removal: bool) -> Self {
        Self { version, removal }
    }

    /// Record for a key confirmed as removed on every member.
    pub const fn removed(version: EntryVersion) -> Self {
        Self {
            version,
            removal: true,
        }
    }

    /// Whether `incoming` should replace `self` for the same key.
    ///
    /// A newer version always wins. On a tie the removal wins, so a tied
    /// overwrite never shadows a removal regardless of arrival order.
    pub fn superseded_by(&self, incoming: &InvalidationInfo) -> bool {
        incoming.version > self.version || (incoming.version == self.version && incoming.removal)
    }

    /// Merge `incoming` into an optional existing record.
    pub fn merge(existing: Option<InvalidationInfo>, incoming: InvalidationInfo) -> InvalidationInfo {
        match existing {
            Some(old) if !old.superseded_by(&incoming) => old,
            _ => incoming,
        }
    }
}

/// Invalidation message sent to every cluster member.
///
/// Keys, topology ids, versions and removal flags are parallel lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateVersionsCommand {
    /// Invalidated keys.
    pub keys: Vec<Key>,
    /// Topology id of each key's version.
    pub topology_ids: Vec<TopologyId>,
    /// Counter of each key's version.
    pub versions: Vec<u64>,
    /// Per-key removal flags. All `true` in a removal batch.
    pub removals: Vec<bool>,
    /// Whether every key in this command is confirmed removed on all members.
    pub removal_batch: bool,
}

impl InvalidateVersionsCommand {
    /// Build a command from `(key, info)` pairs.
    pub fn from_entries<I>(entries: I, removal_batch: bool) -> Self
    where
        I: IntoIterator<Item = (Key, InvalidationInfo)>,
    {
        let entries = entries.into_iter();
        let (lower, _) = entries.size_hint();
        let mut command = Self {
            keys: Vec::with_capacity(lower),
            topology_ids: Vec::with_capacity(lower),
            versions: Vec::with_capacity(lower),
            removals: Vec::with_capacity(lower),
            removal_batch,
        };
        for (key, info) in entries {
            command.keys.push(key);
            command.topology_ids.push(info.version.topology_id);
            command.versions.push(info.version.version);
            command.removals.push(info.removal);
        }
        command
    }

    /// Number of keys in the command.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the command carries no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of keys flagged as removals.
    pub fn removal_count(&self) -> usize {
        self.removals.iter().filter(|r| **r).count()
    }

    /// Iterate over `(key, info)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&Key, InvalidationInfo)> + '_ {
        self.keys.iter().enumerate().map(move |(i, key)| {
            let version = EntryVersion::new(self.topology_ids[i], self.versions[i]);
            (key, InvalidationInfo::new(version, self.removals[i]))
        })
    }

    /// Serialize command to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize command from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Map a key onto a segment.
///
/// Plain modulo over the key's XxHash64; intended for callers and tests that
/// have no consistent-hash provider at hand.
pub fn segment_for_key(key: &[u8], num_segments: u32) -> SegmentId {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(num_segments.max(1))) as SegmentId
}
