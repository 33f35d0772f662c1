//! Segment Module
//!
//! Immutable on-disk sorted run of records.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (96 bytes)                                       │
//! │   Magic: "LSMS" (4) | Version: u16 (2) | Flags: u16 (2) │
//! │   PartIndex: u32 (4)                                    │
//! │   RecordCount | TotalBytes | KeySize | ValueSize        │
//! │   RawKeySize | RawValueSize | Sequence | BaseSequence   │
//! │   GroupId | IndexOffset                  (u64 each)     │
//! │   HeaderCRC: u32 (4)                                    │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Flags: u8][CRC: u32]       │
//! │   [Key][Value]                                          │
//! │   ... repeated for each record, ascending by key ...    │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (RecordCount × 8 bytes)                     │
//! │   [Offset: u64] absolute offset of each record          │
//! ├─────────────────────────────────────────────────────────┤
//! │ Bounds Block (variable)                                 │
//! │   [HasBounds: u8]                                       │
//! │   [MinLen: u32][MinKey][MaxLen: u32][MaxKey]            │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                        │
//! │   DataCRC: u32 (4) | Magic: "LSMS" (4)                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! All integers are little endian. The fixed-width index makes every record
//! boundary seekable, so lookups binary-search the file instead of loading it.
//! The record CRC covers the length/flag bytes, the key and the value, so a
//! damaged record is caught by the lookup that probes it.

mod iterator;
mod reader;
mod writer;

use std::io::{self, Read};

pub use iterator::SegmentIter;
pub use reader::SegmentReader;
pub use writer::{write_segment, SegmentWriter};

use crate::error::{LsmError, Result};
use crate::memtable::Entry;

// =============================================================================
// Shared Constants (used by writer, reader, iterator)
// =============================================================================

/// Magic bytes identifying a segment file
pub(crate) const MAGIC: &[u8; 4] = b"LSMS";

/// Current segment format version
pub(crate) const VERSION: u16 = 2;

/// Fixed header size
pub(crate) const HEADER_SIZE: u64 = 96;

/// Footer size: DataCRC (4) + Magic (4)
pub(crate) const FOOTER_SIZE: u64 = 8;

/// Per-record header: KeyLen (4) + ValLen (4) + Flags (1) + CRC (4)
pub(crate) const RECORD_HEADER_SIZE: u64 = 13;

/// Leading record bytes covered by the record CRC (lengths and flags)
const RECORD_PREFIX_SIZE: usize = 9;

/// Size of one index slot
pub(crate) const INDEX_SLOT_SIZE: u64 = 8;

/// Header flag: last part of its group
pub(crate) const FLAG_FINAL_PART: u16 = 0x0001;

/// Record flag: tombstone, no value bytes follow
pub(crate) const RECORD_TOMBSTONE: u8 = 0x01;

// =============================================================================
// Segment Metadata
// =============================================================================

/// Identity a writer stamps into a new segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Recency rank; higher is newer
    pub sequence: u64,
    /// Lowest sequence folded into this segment
    pub base_sequence: u64,
    /// Segments written together (one flush, one compaction) share a group
    pub group_id: u64,
    /// Position of this segment within its group
    pub part_index: u32,
}

impl SegmentMeta {
    /// Metadata for a memtable flush: a one-part group of its own
    pub fn flush(sequence: u64, file_id: u64) -> Self {
        Self {
            sequence,
            base_sequence: sequence,
            group_id: file_id,
            part_index: 0,
        }
    }
}

/// Descriptor stored in every segment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor<K> {
    pub record_count: u64,
    /// File size in bytes
    pub total_bytes: u64,
    /// Key bytes on disk, length prefixes included
    pub key_size: u64,
    /// Value bytes on disk, length prefixes and flags included
    pub value_size: u64,
    /// Key payload bytes
    pub raw_key_size: u64,
    /// Value payload bytes
    pub raw_value_size: u64,
    /// Smallest key (None for an empty segment)
    pub min_key: Option<K>,
    /// Largest key (None for an empty segment)
    pub max_key: Option<K>,
    pub sequence: u64,
    pub base_sequence: u64,
    pub group_id: u64,
    pub part_index: u32,
    pub is_final_part: bool,
}

impl<K: Ord> SegmentDescriptor<K> {
    /// Quick check if a key might be in this segment (range check)
    /// Returns false if key is definitely outside [min_key, max_key]
    pub fn might_contain(&self, key: &K) -> bool {
        match (&self.min_key, &self.max_key) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false,
        }
    }

    /// True when this segment resulted from merging other segments
    pub fn is_compacted(&self) -> bool {
        self.base_sequence < self.sequence
    }

    /// Inclusive sequence range this segment accounts for
    pub fn sequence_range(&self) -> (u64, u64) {
        (self.base_sequence, self.sequence)
    }
}

// =============================================================================
// Header encoding
// =============================================================================

/// Fixed-size header as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub flags: u16,
    pub part_index: u32,
    pub record_count: u64,
    pub total_bytes: u64,
    pub key_size: u64,
    pub value_size: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub sequence: u64,
    pub base_sequence: u64,
    pub group_id: u64,
    pub index_offset: u64,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.part_index.to_le_bytes());

        let fields = [
            self.record_count,
            self.total_bytes,
            self.key_size,
            self.value_size,
            self.raw_key_size,
            self.raw_value_size,
            self.sequence,
            self.base_sequence,
            self.group_id,
            self.index_offset,
        ];
        for (i, field) in fields.iter().enumerate() {
            let start = 12 + i * 8;
            buf[start..start + 8].copy_from_slice(&field.to_le_bytes());
        }

        let crc = crc32fast::hash(&buf[..92]);
        buf[92..96].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            return Err(LsmError::Corruption(format!(
                "Invalid segment magic: expected LSMS, got {:?}",
                &buf[0..4]
            )));
        }

        let stored_crc = u32::from_le_bytes(array(&buf[92..96]));
        let actual_crc = crc32fast::hash(&buf[..92]);
        if stored_crc != actual_crc {
            return Err(LsmError::Corruption(format!(
                "Header CRC mismatch: stored {:08x}, computed {:08x}",
                stored_crc, actual_crc
            )));
        }

        let version = u16::from_le_bytes(array(&buf[4..6]));
        if version != VERSION {
            return Err(LsmError::Corruption(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        let field = |i: usize| u64::from_le_bytes(array(&buf[12 + i * 8..20 + i * 8]));
        Ok(Self {
            flags: u16::from_le_bytes(array(&buf[6..8])),
            part_index: u32::from_le_bytes(array(&buf[8..12])),
            record_count: field(0),
            total_bytes: field(1),
            key_size: field(2),
            value_size: field(3),
            raw_key_size: field(4),
            raw_value_size: field(5),
            sequence: field(6),
            base_sequence: field(7),
            group_id: field(8),
            index_offset: field(9),
        })
    }
}

// =============================================================================
// Record encoding
// =============================================================================

/// A record as read from disk, key still encoded
#[derive(Debug)]
pub(crate) struct RawRecord {
    pub key: Vec<u8>,
    pub entry: Entry,
}

impl RawRecord {
    /// Bytes this record occupies in the data block
    pub fn disk_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.key.len() as u64 + self.entry.value_len() as u64
    }
}

/// Reject records whose lengths do not fit the u32 length fields
pub(crate) fn check_record_lengths(key_len: usize, value_len: usize) -> Result<()> {
    if u32::try_from(key_len).is_err() || u32::try_from(value_len).is_err() {
        return Err(LsmError::Storage(format!(
            "Record too large for a segment: {} key bytes, {} value bytes",
            key_len, value_len
        )));
    }
    Ok(())
}

fn record_crc(prefix: &[u8], key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(prefix);
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Encode one record: `[key_len][val_len][flags][crc][key][value]`
///
/// Lengths must have passed `check_record_lengths`.
pub(crate) fn encode_record(key: &[u8], entry: &Entry, out: &mut Vec<u8>) {
    let (value, flags): (&[u8], u8) = match entry {
        Entry::Value(v) => (v, 0),
        Entry::Tombstone => (&[], RECORD_TOMBSTONE),
    };
    let mut prefix = [0u8; RECORD_PREFIX_SIZE];
    prefix[0..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    prefix[4..8].copy_from_slice(&(value.len() as u32).to_le_bytes());
    prefix[8] = flags;

    out.extend_from_slice(&prefix);
    out.extend_from_slice(&record_crc(&prefix, key, value).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

/// Fixed leading part of a record
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    prefix: [u8; RECORD_PREFIX_SIZE],
    pub key_len: usize,
    pub value_len: usize,
    crc: u32,
}

impl RecordHeader {
    /// Bytes the whole record occupies in the data block
    pub fn disk_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.key_len as u64 + self.value_len as u64
    }

    fn is_tombstone(&self) -> bool {
        self.prefix[8] & RECORD_TOMBSTONE != 0
    }
}

pub(crate) fn read_record_header(reader: &mut impl Read) -> Result<RecordHeader> {
    let mut header = [0u8; RECORD_HEADER_SIZE as usize];
    read_exact_or_corrupt(reader, &mut header, "record header")?;
    let record = RecordHeader {
        prefix: array(&header[0..RECORD_PREFIX_SIZE]),
        key_len: u32::from_le_bytes(array(&header[0..4])) as usize,
        value_len: u32::from_le_bytes(array(&header[4..8])) as usize,
        crc: u32::from_le_bytes(array(&header[9..13])),
    };
    if record.is_tombstone() && record.value_len != 0 {
        return Err(LsmError::Corruption(format!(
            "Tombstone record carries {} value bytes",
            record.value_len
        )));
    }
    Ok(record)
}

/// Read key and value of a record whose header has been consumed, checking
/// the record CRC
pub(crate) fn read_record_body(reader: &mut impl Read, header: &RecordHeader) -> Result<RawRecord> {
    let mut key = vec![0u8; header.key_len];
    read_exact_or_corrupt(reader, &mut key, "record key")?;
    let mut value = vec![0u8; header.value_len];
    read_exact_or_corrupt(reader, &mut value, "record value")?;

    let crc = record_crc(&header.prefix, &key, &value);
    if crc != header.crc {
        return Err(LsmError::Corruption(format!(
            "Record checksum mismatch: stored {:08x}, computed {:08x}",
            header.crc, crc
        )));
    }

    let entry = if header.is_tombstone() {
        Entry::Tombstone
    } else {
        Entry::Value(value)
    };
    Ok(RawRecord { key, entry })
}

/// Read one complete record
pub(crate) fn read_record(reader: &mut impl Read) -> Result<RawRecord> {
    let header = read_record_header(reader)?;
    read_record_body(reader, &header)
}

/// `read_exact` that reports a short read as corruption: the header promised
/// bytes the file does not have.
pub(crate) fn read_exact_or_corrupt(reader: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            LsmError::Corruption(format!("Truncated {}", what))
        } else {
            LsmError::Io(e)
        }
    })
}

pub(crate) fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
