//! Owned key ranges
//!
//! Scans accept any `RangeBounds<K>`; internally they carry an owned copy so
//! iterators can outlive the caller's borrow.

use std::ops::{Bound, RangeBounds};

/// An owned `(start, end)` bound pair over keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub start: Bound<K>,
    pub end: Bound<K>,
}

impl<K: Ord + Clone> KeyRange<K> {
    /// Copy the bounds out of any range expression
    pub fn from_bounds<R: RangeBounds<K>>(range: &R) -> Self {
        Self {
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
        }
    }

    /// The unbounded range
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// True if `key` is below the start bound
    pub fn is_before_start(&self, key: &K) -> bool {
        match &self.start {
            Bound::Included(start) => key < start,
            Bound::Excluded(start) => key <= start,
            Bound::Unbounded => false,
        }
    }

    /// True if `key` is beyond the end bound
    pub fn is_past_end(&self, key: &K) -> bool {
        match &self.end {
            Bound::Included(end) => key > end,
            Bound::Excluded(end) => key >= end,
            Bound::Unbounded => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        !self.is_before_start(key) && !self.is_past_end(key)
    }

    /// True if no key can satisfy both bounds
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// True if the range intersects `[min, max]`
    pub fn overlaps(&self, min: &K, max: &K) -> bool {
        !self.is_empty() && !self.is_past_end(min) && !self.is_before_start(max)
    }

    /// Bound pair in the form `BTreeMap::range` expects
    pub fn as_bounds(&self) -> (Bound<&K>, Bound<&K>) {
        (self.start.as_ref(), self.end.as_ref())
    }
}

impl<K> RangeBounds<K> for KeyRange<K> {
    fn start_bound(&self) -> Bound<&K> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&K> {
        self.end.as_ref()
    }
}
