//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::Entry;
use crate::codec::Key;
use crate::range::KeyRange;

/// Per-entry bookkeeping cost added to key and value bytes when sizing
pub const ENTRY_OVERHEAD: usize = 16;

/// In-memory table for recent writes
///
/// Every generation of the table carries the sequence number its segment
/// will receive when flushed.
pub struct MemTable<K> {
    data: RwLock<BTreeMap<K, Entry>>,
    /// Approximate size in bytes
    size: AtomicUsize,
    sequence: u64,
}

fn entry_size<K: Key>(key: &K, entry: &Entry) -> usize {
    key.encoded_len() + entry.value_len() + ENTRY_OVERHEAD
}

impl<K: Key> MemTable<K> {
    /// Create a new empty MemTable for the given generation
    pub fn new(sequence: u64) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            sequence,
        }
    }

    /// Sequence number of this generation
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Insert or replace the record for `key`
    ///
    /// Returns the approximate table size after the write.
    pub fn insert(&self, key: K, entry: Entry) -> usize {
        let added = entry_size(&key, &entry);
        let mut data = self.data.write();
        let removed = data
            .get(&key)
            .map(|old| entry_size(&key, old))
            .unwrap_or(0);
        data.insert(key, entry);

        // Size only changes under the write lock, so load/store cannot race
        let new_size = self.size.load(Ordering::Acquire) + added - removed;
        self.size.store(new_size, Ordering::Release);
        new_size
    }

    /// Put a key-value pair
    pub fn put(&self, key: K, value: Vec<u8>) -> usize {
        self.insert(key, Entry::Value(value))
    }

    /// Delete a key (inserts tombstone)
    pub fn delete(&self, key: K) -> usize {
        self.insert(key, Entry::Tombstone)
    }

    /// Exact-match lookup (read lock)
    pub fn get(&self, key: &K) -> Option<Entry> {
        self.data.read().get(key).cloned()
    }

    /// Ordered records in `range`, captured now
    pub fn scan<R: RangeBounds<K>>(&self, range: R) -> MemTableScan<K> {
        let range = KeyRange::from_bounds(&range);
        if range.is_empty() {
            return MemTableScan::new(Vec::new());
        }
        let data = self.data.read();
        let records = data
            .range(range.as_bounds())
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        MemTableScan::new(records)
    }

    /// Snapshot of every record in key order
    pub fn iter(&self) -> MemTableScan<K> {
        self.scan(..)
    }

    /// Take every record in key order and leave the table empty
    pub fn drain(&self) -> impl Iterator<Item = (K, Entry)> {
        let mut data = self.data.write();
        let taken = std::mem::take(&mut *data);
        self.size.store(0, Ordering::Release);
        taken.into_iter()
    }

    /// Get approximate size in bytes
    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Number of records, tombstones included
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Smallest and largest key currently held
    pub fn key_bounds(&self) -> Option<(K, K)> {
        let data = self.data.read();
        let first = data.keys().next()?.clone();
        let last = data.keys().next_back()?.clone();
        Some((first, last))
    }
}

/// Ordered, restartable iterator over a memtable snapshot
///
/// Cloning shares the snapshot; `rewind` restarts from the first record.
#[derive(Clone)]
pub struct MemTableScan<K> {
    records: Arc<Vec<(K, Entry)>>,
    position: usize,
}

impl<K: Clone> MemTableScan<K> {
    fn new(records: Vec<(K, Entry)>) -> Self {
        Self {
            records: Arc::new(records),
            position: 0,
        }
    }

    /// Restart from the first record of the snapshot
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Records remaining
    pub fn remaining(&self) -> usize {
        self.records.len() - self.position
    }
}

impl<K: Clone> Iterator for MemTableScan<K> {
    type Item = (K, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.position)?.clone();
        self.position += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
