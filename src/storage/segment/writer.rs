//! Segment Writer
//!
//! Writes sorted records to a new segment file in one pass.
//!
//! The file is built under `<path>.tmp` and renamed into place by
//! `finish()`, so readers never observe a partial segment.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    check_record_lengths, encode_record, SegmentDescriptor, SegmentHeader, SegmentMeta, FLAG_FINAL_PART, FOOTER_SIZE,
    HEADER_SIZE, INDEX_SLOT_SIZE, MAGIC, RECORD_HEADER_SIZE,
};
use crate::codec::Key;
use crate::error::{LsmError, Result};
use crate::memtable::Entry;
use crate::storage::sync_dir;

/// Temporary path a segment is built under
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Builder for a new segment from sorted, deduplicated records
pub struct SegmentWriter<K> {
    final_path: PathBuf,
    temp_path: PathBuf,
    /// `None` once finished or aborted
    writer: Option<BufWriter<File>>,
    meta: SegmentMeta,
    /// Absolute offset of every record, written as the index block
    offsets: Vec<u64>,
    /// Current write position
    current_offset: u64,
    key_size: u64,
    value_size: u64,
    raw_key_size: u64,
    raw_value_size: u64,
    min_key: Option<K>,
    last_key: Option<K>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
    scratch: Vec<u8>,
}

impl<K: Key> SegmentWriter<K> {
    /// Start a segment that will appear at `path` once finished
    ///
    /// Writes a placeholder header immediately; call `add()` in ascending
    /// key order, then `finish()`.
    pub fn create(path: &Path, meta: SegmentMeta) -> Result<Self> {
        let temp_path = temp_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&[0u8; HEADER_SIZE as usize])?;

        Ok(Self {
            final_path: path.to_path_buf(),
            temp_path,
            writer: Some(writer),
            meta,
            offsets: Vec::new(),
            current_offset: HEADER_SIZE,
            key_size: 0,
            value_size: 0,
            raw_key_size: 0,
            raw_value_size: 0,
            min_key: None,
            last_key: None,
            data_hasher: crc32fast::Hasher::new(),
            scratch: Vec::new(),
        })
    }

    /// Append a record. Keys must be strictly ascending.
    pub fn add(&mut self, key: &K, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(LsmError::Storage(format!(
                    "Segment keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LsmError::Storage("Segment writer already closed".to_string()))?;

        let key_bytes = key.to_bytes();
        check_record_lengths(key_bytes.len(), entry.value_len())?;
        self.scratch.clear();
        encode_record(&key_bytes, entry, &mut self.scratch);
        writer.write_all(&self.scratch)?;
        self.data_hasher.update(&self.scratch);

        self.offsets.push(self.current_offset);
        self.current_offset += self.scratch.len() as u64;

        let value_len = entry.value_len() as u64;
        self.raw_key_size += key_bytes.len() as u64;
        self.key_size += 4 + key_bytes.len() as u64;
        self.raw_value_size += value_len;
        self.value_size += (RECORD_HEADER_SIZE - 4) + value_len;

        if self.min_key.is_none() {
            self.min_key = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        Ok(())
    }

    /// Number of records added so far
    pub fn record_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// File size if the segment were finished now (bounds block excluded)
    pub fn estimated_size(&self) -> u64 {
        self.current_offset + self.record_count() * INDEX_SLOT_SIZE + FOOTER_SIZE
    }

    /// Finish building: write index, bounds and footer, patch the header,
    /// fsync, and rename into place.
    pub fn finish(mut self, is_final_part: bool) -> Result<SegmentDescriptor<K>> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| LsmError::Storage("Segment writer already closed".to_string()))?;

        let index_offset = self.current_offset;
        for offset in &self.offsets {
            writer.write_all(&offset.to_le_bytes())?;
        }

        let min_key = self.min_key.take();
        let max_key = self.last_key.take();
        let mut bounds = Vec::new();
        match (&min_key, &max_key) {
            (Some(min), Some(max)) => {
                let min = min.to_bytes();
                let max = max.to_bytes();
                bounds.push(1u8);
                bounds.extend_from_slice(&(min.len() as u32).to_le_bytes());
                bounds.extend_from_slice(&min);
                bounds.extend_from_slice(&(max.len() as u32).to_le_bytes());
                bounds.extend_from_slice(&max);
            }
            _ => bounds.push(0u8),
        }
        writer.write_all(&bounds)?;

        let data_crc = self.data_hasher.clone().finalize();
        writer.write_all(&data_crc.to_le_bytes())?;
        writer.write_all(MAGIC)?;

        let record_count = self.record_count();
        let total_bytes =
            index_offset + record_count * INDEX_SLOT_SIZE + bounds.len() as u64 + FOOTER_SIZE;
        let header = SegmentHeader {
            flags: if is_final_part { FLAG_FINAL_PART } else { 0 },
            part_index: self.meta.part_index,
            record_count,
            total_bytes,
            key_size: self.key_size,
            value_size: self.value_size,
            raw_key_size: self.raw_key_size,
            raw_value_size: self.raw_value_size,
            sequence: self.meta.sequence,
            base_sequence: self.meta.base_sequence,
            group_id: self.meta.group_id,
            index_offset,
        };

        writer.flush()?;
        let mut file = writer.into_inner().map_err(|e| {
            LsmError::Storage(format!("Failed to flush segment: {}", e))
        })?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)?;
        // Renamed: from here on the file is no longer ours to clean up
        self.temp_path = PathBuf::new();
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir)?;
        }

        tracing::debug!(
            path = %self.final_path.display(),
            records = record_count,
            bytes = total_bytes,
            sequence = self.meta.sequence,
            "Segment written"
        );

        Ok(SegmentDescriptor {
            record_count,
            total_bytes,
            key_size: self.key_size,
            value_size: self.value_size,
            raw_key_size: self.raw_key_size,
            raw_value_size: self.raw_value_size,
            min_key,
            max_key,
            sequence: self.meta.sequence,
            base_sequence: self.meta.base_sequence,
            group_id: self.meta.group_id,
            part_index: self.meta.part_index,
            is_final_part,
        })
    }

    /// Discard the segment, removing the temporary file
    pub fn abort(self) {
        drop(self);
    }

    /// Path the segment will have once finished
    pub fn path(&self) -> &Path {
        &self.final_path
    }
}

impl<K> Drop for SegmentWriter<K> {
    fn drop(&mut self) {
        self.writer.take();
        if !self.temp_path.as_os_str().is_empty() && self.temp_path.exists() {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                tracing::warn!(path = %self.temp_path.display(), error = %e, "Failed to remove temporary segment");
            }
        }
    }
}

/// Write `records` (ascending, deduplicated) as a complete one-part segment
pub fn write_segment<K: Key>(
    path: &Path,
    meta: SegmentMeta,
    records: impl IntoIterator<Item = (K, Entry)>,
) -> Result<SegmentDescriptor<K>> {
    let mut writer = SegmentWriter::create(path, meta)?;
    for (key, entry) in records {
        writer.add(&key, &entry)?;
    }
    writer.finish(true)
}
