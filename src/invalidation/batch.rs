//! Swappable map of pending invalidations.

use crate::types::{InvalidationInfo, Key};
use dashmap::DashMap;
use parking_lot::RwLock;

/// Pending invalidations keyed by cache key.
///
/// Writers merge under the read side of the lock, so merges run in parallel
/// on the concurrent map. Taking the batch holds the write side only for the
/// pointer swap with a fresh map.
#[derive(Debug)]
pub struct PendingBatch {
    entries: RwLock<DashMap<Key, InvalidationInfo>>,
    capacity: usize,
}

impl PendingBatch {
    /// Create an empty batch sized for `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(DashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Merge a record for `key`. Returns the batch size after the merge.
    pub fn merge(&self, key: Key, info: InvalidationInfo) -> usize {
        let entries = self.entries.read();
        entries
            .entry(key)
            .and_modify(|old| *old = InvalidationInfo::merge(Some(*old), info))
            .or_insert(info);
        entries.len()
    }

    /// Merge several records. Returns the batch size after the merge.
    pub fn merge_all<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = (Key, InvalidationInfo)>,
    {
        let entries = self.entries.read();
        for (key, info) in records {
            entries
                .entry(key)
                .and_modify(|old| *old = InvalidationInfo::merge(Some(*old), info))
                .or_insert(info);
        }
        entries.len()
    }

    /// Swap the batch out for an empty one and return its entries.
    pub fn take(&self) -> Vec<(Key, InvalidationInfo)> {
        let taken = {
            let mut entries = self.entries.write();
            std::mem::replace(&mut *entries, DashMap::with_capacity(self.capacity))
        };
        taken.into_iter().collect()
    }

    /// Drop every pending entry. Returns the number dropped.
    pub fn clear(&self) -> usize {
        self.take().len()
    }

    /// Record pending for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<InvalidationInfo> {
        self.entries.read().get(key).map(|r| *r)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
