//! K-way merge over sorted sources
//!
//! Each source yields `(key, entry)` pairs in strictly ascending key order.
//! Sources are ranked by recency: index 0 is the newest. When several
//! sources hold the same key, only the newest one's entry is emitted.
//!
//! Tombstones pass through unchanged; callers decide whether to keep them
//! (compaction) or hide them (scans).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::codec::Key;
use crate::error::{LsmError, Result};
use crate::memtable::Entry;

/// A boxed source of sorted records
pub type EntryIter<K> = Box<dyn Iterator<Item = Result<(K, Entry)>> + Send>;

struct HeapEntry<K> {
    key: K,
    entry: Entry,
    source: usize,
    iterator: EntryIter<K>,
}

impl<K: Ord> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<K: Ord> Eq for HeapEntry<K> {}

impl<K: Ord> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: smallest key first, then newest source
impl<K: Ord> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges sources into one ascending, deduplicated stream
pub struct MergeIterator<K> {
    heap: BinaryHeap<HeapEntry<K>>,
    latest_key: Option<K>,
    /// Error hit while priming a source, reported on the first `next()`
    pending_error: Option<LsmError>,
    failed: bool,
}

impl<K: Key> MergeIterator<K> {
    /// Build a merge over `sources`, newest first
    pub fn new(sources: Vec<EntryIter<K>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut pending_error = None;

        for (source, mut iterator) in sources.into_iter().enumerate() {
            match iterator.next() {
                Some(Ok((key, entry))) => heap.push(HeapEntry {
                    key,
                    entry,
                    source,
                    iterator,
                }),
                Some(Err(e)) => {
                    if pending_error.is_none() {
                        pending_error = Some(e);
                    }
                }
                None => {}
            }
        }

        Self {
            heap,
            latest_key: None,
            pending_error,
            failed: false,
        }
    }

    /// Pull the next record from `source` and put it on the heap
    fn refill(&mut self, source: usize, mut iterator: EntryIter<K>) -> Result<()> {
        match iterator.next() {
            Some(Ok((key, entry))) => {
                self.heap.push(HeapEntry {
                    key,
                    entry,
                    source,
                    iterator,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn next_record(&mut self) -> Result<Option<(K, Entry)>> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }

        while let Some(head) = self.heap.pop() {
            let HeapEntry {
                key,
                entry,
                source,
                iterator,
            } = head;

            if self.latest_key.as_ref() == Some(&key) {
                // Shadowed by a newer source
                self.refill(source, iterator)?;
                continue;
            }

            self.latest_key = Some(key.clone());
            if let Err(e) = self.refill(source, iterator) {
                self.pending_error = Some(e);
            }
            return Ok(Some((key, entry)));
        }
        Ok(None)
    }
}

impl<K: Key> Iterator for MergeIterator<K> {
    type Item = Result<(K, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
