//! Segment Reader
//!
//! Opens segment files and serves point lookups and range scans straight
//! from disk. Only the header and the key bounds are held in memory; every
//! lookup binary-searches the on-disk index.

use std::cmp::Ordering as KeyOrdering;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::iterator::SegmentIter;
use super::{
    array, read_exact_or_corrupt, read_record, read_record_body, read_record_header, SegmentDescriptor,
    SegmentHeader, FLAG_FINAL_PART, FOOTER_SIZE, HEADER_SIZE, INDEX_SLOT_SIZE, MAGIC,
    RECORD_HEADER_SIZE,
};
use crate::codec::Key;
use crate::error::{LsmError, Result};
use crate::memtable::Entry;
use crate::range::KeyRange;

/// Reader for one immutable segment file
///
/// Point lookups share one file handle behind a mutex; scans open their own.
pub struct SegmentReader<K> {
    path: PathBuf,
    file: Mutex<BufReader<File>>,
    descriptor: SegmentDescriptor<K>,
    index_offset: u64,
    data_crc: u32,
    /// Number of lookups that touched the data or index block
    body_reads: AtomicU64,
}

fn decode_key<K: Key>(bytes: &[u8], path: &Path) -> Result<K> {
    K::decode(bytes).map_err(|e| {
        LsmError::Corruption(format!("{}: undecodable key: {}", path.display(), e))
    })
}

impl<K: Key> SegmentReader<K> {
    /// Open a segment for reading
    ///
    /// Reads the header, footer and bounds block only, and checks that the
    /// sizes they declare add up to the file length.
    pub fn open(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| LsmError::Corruption(format!("{}: {}", path.display(), reason));

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE + FOOTER_SIZE + 1 {
            return Err(corrupt(format!("file too short ({} bytes)", file_len)));
        }

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        read_exact_or_corrupt(&mut file, &mut header_buf, "segment header")?;
        let header = SegmentHeader::decode(&header_buf).map_err(|e| corrupt(e.to_string()))?;

        if header.total_bytes != file_len {
            return Err(corrupt(format!(
                "header declares {} bytes, file has {}",
                header.total_bytes, file_len
            )));
        }

        let index_len = header
            .record_count
            .checked_mul(INDEX_SLOT_SIZE)
            .ok_or_else(|| corrupt(format!("record count {} overflows", header.record_count)))?;
        let bounds_offset = header
            .index_offset
            .checked_add(index_len)
            .filter(|&end| end <= file_len - FOOTER_SIZE)
            .ok_or_else(|| {
                corrupt(format!(
                    "{} records at index offset {} do not fit in {} bytes",
                    header.record_count, header.index_offset, file_len
                ))
            })?;
        let data_len = header
            .index_offset
            .checked_sub(HEADER_SIZE)
            .ok_or_else(|| corrupt(format!("index offset {} inside header", header.index_offset)))?;
        if data_len < header.record_count * RECORD_HEADER_SIZE {
            return Err(corrupt(format!(
                "{} data bytes cannot hold {} records",
                data_len, header.record_count
            )));
        }

        // Footer
        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        read_exact_or_corrupt(&mut file, &mut footer, "segment footer")?;
        if &footer[4..8] != MAGIC {
            return Err(corrupt("invalid footer magic".to_string()));
        }
        let data_crc = u32::from_le_bytes(array(&footer[0..4]));

        // Bounds block fills the gap between index and footer exactly
        file.seek(SeekFrom::Start(bounds_offset))?;
        let mut bounds = vec![0u8; (file_len - FOOTER_SIZE - bounds_offset) as usize];
        read_exact_or_corrupt(&mut file, &mut bounds, "bounds block")?;
        let (min_key, max_key) = Self::parse_bounds(&bounds, path)?;
        if min_key.is_some() != (header.record_count > 0) {
            return Err(corrupt(format!(
                "bounds presence disagrees with record count {}",
                header.record_count
            )));
        }
        if let (Some(min), Some(max)) = (&min_key, &max_key) {
            if min > max {
                return Err(corrupt(format!("min key {:?} above max key {:?}", min, max)));
            }
        }

        let descriptor = SegmentDescriptor {
            record_count: header.record_count,
            total_bytes: header.total_bytes,
            key_size: header.key_size,
            value_size: header.value_size,
            raw_key_size: header.raw_key_size,
            raw_value_size: header.raw_value_size,
            min_key,
            max_key,
            sequence: header.sequence,
            base_sequence: header.base_sequence,
            group_id: header.group_id,
            part_index: header.part_index,
            is_final_part: header.flags & FLAG_FINAL_PART != 0,
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufReader::new(file)),
            descriptor,
            index_offset: header.index_offset,
            data_crc,
            body_reads: AtomicU64::new(0),
        })
    }

    fn parse_bounds(bounds: &[u8], path: &Path) -> Result<(Option<K>, Option<K>)> {
        let corrupt = || LsmError::Corruption(format!("{}: malformed bounds block", path.display()));
        let (&has_bounds, mut rest) = bounds.split_first().ok_or_else(corrupt)?;
        if has_bounds == 0 {
            return if rest.is_empty() { Ok((None, None)) } else { Err(corrupt()) };
        }

        let mut take_key = || -> Result<K> {
            if rest.len() < 4 {
                return Err(corrupt());
            }
            let len = u32::from_le_bytes(array(&rest[0..4])) as usize;
            if rest.len() < 4 + len {
                return Err(corrupt());
            }
            let key = decode_key(&rest[4..4 + len], path)?;
            rest = &rest[4 + len..];
            Ok(key)
        };
        let min = take_key()?;
        let max = take_key()?;
        if !rest.is_empty() {
            return Err(corrupt());
        }
        Ok((Some(min), Some(max)))
    }

    /// Get a record by key: O(log n) probes of the on-disk index
    ///
    /// Returns:
    /// - `Ok(Some(Entry::Value(_)))` => key found with value
    /// - `Ok(Some(Entry::Tombstone))` => key deleted in this segment
    /// - `Ok(None)` => key not in this segment
    pub fn find(&self, key: &K) -> Result<Option<Entry>> {
        // Range-skip fast path: no body I/O
        if !self.descriptor.might_contain(key) {
            return Ok(None);
        }
        self.body_reads.fetch_add(1, Ordering::Relaxed);

        let mut file = self.file.lock();
        let mut lo = 0;
        let mut hi = self.descriptor.record_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (probe, entry) = self.read_key_at(&mut file, mid)?;
            match probe.cmp(key) {
                KeyOrdering::Less => lo = mid + 1,
                KeyOrdering::Greater => hi = mid,
                KeyOrdering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }

    /// Iterate over records in `range`, seeking straight to the first one
    pub fn scan<R: RangeBounds<K>>(&self, range: R) -> Result<SegmentIter<K>> {
        let range = KeyRange::from_bounds(&range);
        let overlaps = match (&self.descriptor.min_key, &self.descriptor.max_key) {
            (Some(min), Some(max)) => range.overlaps(min, max),
            _ => false,
        };
        if !overlaps {
            return Ok(SegmentIter::empty(&self.path));
        }
        self.body_reads.fetch_add(1, Ordering::Relaxed);

        let (first, offset) = {
            let mut file = self.file.lock();
            let first = self.lower_bound(&mut file, &range.start)?;
            if first >= self.descriptor.record_count {
                return Ok(SegmentIter::empty(&self.path));
            }
            (first, self.record_offset(&mut file, first)?)
        };

        SegmentIter::open(
            &self.path,
            offset,
            self.index_offset,
            self.descriptor.record_count - first,
            range,
        )
    }

    /// Create an iterator over all records (for compaction)
    pub fn iter(&self) -> Result<SegmentIter<K>> {
        if self.descriptor.record_count == 0 {
            return Ok(SegmentIter::empty(&self.path));
        }
        SegmentIter::open(
            &self.path,
            HEADER_SIZE,
            self.index_offset,
            self.descriptor.record_count,
            KeyRange::full(),
        )
    }

    /// Full integrity check: data CRC, record count, key order, index offsets
    pub fn verify(&self) -> Result<()> {
        let corrupt = |reason: String| {
            LsmError::Corruption(format!("{}: {}", self.path.display(), reason))
        };

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut scratch = Vec::new();
        let mut position = HEADER_SIZE;
        let mut previous: Option<K> = None;
        let mut offsets = Vec::with_capacity(self.descriptor.record_count as usize);

        while position < self.index_offset {
            let record = read_record(&mut reader)?;
            scratch.clear();
            super::encode_record(&record.key, &record.entry, &mut scratch);
            hasher.update(&scratch);

            let key = decode_key::<K>(&record.key, &self.path)?;
            if let Some(prev) = &previous {
                if &key <= prev {
                    return Err(corrupt(format!("key {:?} not above {:?}", key, prev)));
                }
            }
            offsets.push(position);
            position += record.disk_size();
            previous = Some(key);
        }

        if position != self.index_offset {
            return Err(corrupt(format!(
                "data block ends at {}, index starts at {}",
                position, self.index_offset
            )));
        }
        if offsets.len() as u64 != self.descriptor.record_count {
            return Err(corrupt(format!(
                "found {} records, header declares {}",
                offsets.len(),
                self.descriptor.record_count
            )));
        }
        if previous != self.descriptor.max_key {
            return Err(corrupt("last key differs from max key".to_string()));
        }
        let crc = hasher.finalize();
        if crc != self.data_crc {
            return Err(corrupt(format!(
                "data CRC mismatch: stored {:08x}, computed {:08x}",
                self.data_crc, crc
            )));
        }

        let mut slot = [0u8; INDEX_SLOT_SIZE as usize];
        for (i, expected) in offsets.iter().enumerate() {
            read_exact_or_corrupt(&mut reader, &mut slot, "index slot")?;
            let stored = u64::from_le_bytes(slot);
            if stored != *expected {
                return Err(corrupt(format!(
                    "index slot {} points at {}, record is at {}",
                    i, stored, expected
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn descriptor(&self) -> &SegmentDescriptor<K> {
        &self.descriptor
    }

    /// Get record count
    pub fn record_count(&self) -> u64 {
        self.descriptor.record_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lookups and scans that had to read past the header
    pub fn body_reads(&self) -> u64 {
        self.body_reads.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Absolute offset of record `index`, read from the index block
    fn record_offset(&self, file: &mut BufReader<File>, index: u64) -> Result<u64> {
        file.seek(SeekFrom::Start(self.index_offset + index * INDEX_SLOT_SIZE))?;
        let mut slot = [0u8; INDEX_SLOT_SIZE as usize];
        read_exact_or_corrupt(file, &mut slot, "index slot")?;
        let offset = u64::from_le_bytes(slot);
        if offset < HEADER_SIZE || offset + RECORD_HEADER_SIZE > self.index_offset {
            return Err(LsmError::Corruption(format!(
                "{}: index slot {} points outside data block ({})",
                self.path.display(),
                index,
                offset
            )));
        }
        Ok(offset)
    }

    /// Decode the key of record `index`, leaving the file positioned at its value
    /// Read and checksum the record at `index`
    fn read_key_at(&self, file: &mut BufReader<File>, index: u64) -> Result<(K, Entry)> {
        let offset = self.record_offset(file, index)?;
        file.seek(SeekFrom::Start(offset))?;
        let header = read_record_header(file)?;
        if offset + header.disk_size() > self.index_offset {
            return Err(LsmError::Corruption(format!(
                "{}: record {} overruns data block",
                self.path.display(),
                index
            )));
        }
        let record = read_record_body(file, &header).map_err(|e| match e {
            LsmError::Corruption(reason) => LsmError::Corruption(format!(
                "{}: record {}: {}",
                self.path.display(),
                index,
                reason
            )),
            other => other,
        })?;
        Ok((decode_key(&record.key, &self.path)?, record.entry))
    }

    /// Index of the first record satisfying the start bound
    fn lower_bound(&self, file: &mut BufReader<File>, start: &Bound<K>) -> Result<u64> {
        let target = match start {
            Bound::Unbounded => return Ok(0),
            Bound::Included(k) | Bound::Excluded(k) => k,
        };
        let inclusive = matches!(start, Bound::Included(_));

        let mut lo = 0;
        let mut hi = self.descriptor.record_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (probe, _) = self.read_key_at(file, mid)?;
            let before = if inclusive { &probe < target } else { &probe <= target };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

impl<K> std::fmt::Debug for SegmentReader<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("index_offset", &self.index_offset)
            .finish()
    }
}
