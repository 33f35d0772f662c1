//! Segment Iterator
//!
//! Sequential iteration over the records of a segment, from a starting
//! record to the end of the data block or the end of a key range.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::read_record;
use crate::codec::Key;
use crate::error::{LsmError, Result};
use crate::memtable::Entry;
use crate::range::KeyRange;

/// Iterator over segment records in ascending key order
///
/// Owns its own file handle, so it can outlive the reader and run
/// concurrently with point lookups.
pub struct SegmentIter<K> {
    path: PathBuf,
    /// `None` for an iterator that yields nothing
    file: Option<BufReader<File>>,
    /// Stop reading when we reach this offset (start of index block)
    end_offset: u64,
    /// Current position in file
    current_offset: u64,
    /// Records left before the end of the data block
    remaining: u64,
    range: KeyRange<K>,
    done: bool,
}

impl<K: Key> SegmentIter<K> {
    pub(super) fn open(
        path: &Path,
        start_offset: u64,
        end_offset: u64,
        remaining: u64,
        range: KeyRange<K>,
    ) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            end_offset,
            current_offset: start_offset,
            remaining,
            range,
            done: false,
        })
    }

    pub(super) fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            end_offset: 0,
            current_offset: 0,
            remaining: 0,
            range: KeyRange::full(),
            done: true,
        }
    }

    fn read_next(&mut self) -> Result<Option<(K, Entry)>> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };

        if self.remaining == 0 || self.current_offset >= self.end_offset {
            if self.remaining != 0 || self.current_offset != self.end_offset {
                return Err(LsmError::Corruption(format!(
                    "{}: data block ended at {} with {} records outstanding",
                    self.path.display(),
                    self.current_offset,
                    self.remaining
                )));
            }
            return Ok(None);
        }

        let record = read_record(file)?;
        self.current_offset += record.disk_size();
        self.remaining -= 1;
        if self.current_offset > self.end_offset {
            return Err(LsmError::Corruption(format!(
                "{}: record overruns data block",
                self.path.display()
            )));
        }

        let key = K::decode(&record.key).map_err(|e| {
            LsmError::Corruption(format!("{}: undecodable key: {}", self.path.display(), e))
        })?;
        if self.range.is_past_end(&key) {
            return Ok(None);
        }
        Ok(Some((key, record.entry)))
    }
}

impl<K: Key> Iterator for SegmentIter<K> {
    type Item = Result<(K, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                self.file = None;
                None
            }
            Err(e) => {
                self.done = true;
                self.file = None;
                Some(Err(e))
            }
        }
    }
}
