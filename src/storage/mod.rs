//! Storage Module
//!
//! Persistent storage layer: immutable sorted segments on disk.
//!
//! ## Responsibilities
//! - Persist memtable snapshots as sorted segments
//! - Point lookups and range scans without loading segment bodies
//! - Track which segments exist, newest first
//! - Merge segments to bound lookup fan-out (compaction)
//! - Crash recovery of the segment directory
//!
//! ## Directory Layout
//! ```text
//! segments/
//!   seg_<sequence:010>_<file_id:06>.sst        (published segment)
//!   seg_<sequence:010>_<file_id:06>.sst.tmp    (in progress, never read)
//! ```

pub mod compaction;
mod manager;
pub mod segment;

use std::io;
use std::path::Path;

pub use compaction::{CompactionControl, CompactionPlan, CompactionStats};
pub use manager::{RecoveryReport, SegmentHandle, SegmentList, StorageManager};
pub use segment::{
    write_segment, SegmentDescriptor, SegmentIter, SegmentMeta, SegmentReader, SegmentWriter,
};

/// fsync a directory so a rename or unlink inside it is durable
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
