//! Storage Manager
//!
//! Manages the set of live segments and coordinates flush and compaction
//! output.
//!
//! ## Responsibilities
//! - Discover existing segments on startup and repair interrupted work
//! - Hand out file names for new segments
//! - Publish new segments into the list, newest first
//! - Atomically swap compaction inputs for outputs

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::segment::{write_segment, SegmentDescriptor, SegmentMeta, SegmentReader};
use super::sync_dir;
use crate::codec::Key;
use crate::error::{LsmError, Result};
use crate::memtable::Entry;

/// Published segments, newest first
pub type SegmentList<K> = Arc<Vec<Arc<SegmentHandle<K>>>>;

/// A segment file the tree knows about
///
/// A damaged segment stays in the list so that lookups reaching it fail
/// instead of silently skipping data it might hold.
pub struct SegmentHandle<K> {
    file_id: u64,
    sequence: u64,
    path: PathBuf,
    state: SegmentState<K>,
}

enum SegmentState<K> {
    Live(SegmentReader<K>),
    Damaged(String),
}

impl<K: Key> SegmentHandle<K> {
    fn live(file_id: u64, reader: SegmentReader<K>) -> Self {
        Self {
            file_id,
            sequence: reader.descriptor().sequence,
            path: reader.path().to_path_buf(),
            state: SegmentState::Live(reader),
        }
    }

    fn damaged(file_id: u64, sequence: u64, path: PathBuf, reason: String) -> Self {
        Self {
            file_id,
            sequence,
            path,
            state: SegmentState::Damaged(reason),
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_damaged(&self) -> bool {
        matches!(self.state, SegmentState::Damaged(_))
    }

    /// The reader, or a `Corruption` error for a damaged segment
    pub fn reader(&self) -> Result<&SegmentReader<K>> {
        match &self.state {
            SegmentState::Live(reader) => Ok(reader),
            SegmentState::Damaged(reason) => Err(LsmError::Corruption(format!(
                "segment {} is unreadable: {}",
                self.path.display(),
                reason
            ))),
        }
    }

    pub fn descriptor(&self) -> Option<&SegmentDescriptor<K>> {
        match &self.state {
            SegmentState::Live(reader) => Some(reader.descriptor()),
            SegmentState::Damaged(_) => None,
        }
    }

    /// Group this segment was written in; damaged segments form their own
    pub fn group_id(&self) -> Option<u64> {
        self.descriptor().map(|d| d.group_id)
    }

    /// File size in bytes (0 when unknown)
    pub fn size_bytes(&self) -> u64 {
        self.descriptor().map_or(0, |d| d.total_bytes)
    }

    /// Inclusive sequence range covered by this segment
    fn sequence_range(&self) -> (u64, u64) {
        self.descriptor()
            .map_or((self.sequence, self.sequence), |d| d.sequence_range())
    }
}

/// What `StorageManager::open` found and repaired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Segments loaded into the list (damaged ones included)
    pub segments_loaded: usize,
    /// Segments whose header could not be trusted
    pub damaged_segments: usize,
    /// Leftover `.tmp` files removed
    pub temp_files_removed: usize,
    /// Compaction inputs removed because a complete output replaced them
    pub superseded_removed: usize,
    /// Parts of an unfinished compaction output removed
    pub incomplete_removed: usize,
}

/// Manages the storage layer
///
/// ## Concurrency:
/// - `segments`: copy-on-write list behind an RwLock; readers clone the
///   `Arc` and never block on flush or compaction beyond the pointer swap
/// - `next_file_id`: Atomic counter (lock-free)
/// - All methods use `&self` (no exclusive access needed)
pub struct StorageManager<K> {
    /// Directory where segments are stored
    data_dir: PathBuf,

    /// Published segments, newest first
    segments: RwLock<SegmentList<K>>,

    /// Next ID for creating new segment files (atomic, lock-free)
    next_file_id: AtomicU64,
}

impl<K: Key> StorageManager<K> {
    /// Open or create storage in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Remove `.tmp` files left by interrupted writes
    /// 3. Open every segment (damaged ones are kept, flagged)
    /// 4. Drop segments a completed compaction already replaced
    /// 5. Remove parts of compactions that never completed
    /// 6. Order newest first
    pub fn open(path: &Path) -> Result<(Self, RecoveryReport)> {
        fs::create_dir_all(path)?;
        let mut report = RecoveryReport::default();

        let mut found: Vec<(u64, u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if !file_path.is_file() {
                continue;
            }

            if file_path.extension().is_some_and(|ext| ext == "tmp") {
                tracing::debug!(path = %file_path.display(), "Removing leftover temporary segment");
                fs::remove_file(&file_path)?;
                report.temp_files_removed += 1;
                continue;
            }

            if let Some((sequence, file_id)) = Self::parse_segment_name(&file_path) {
                found.push((sequence, file_id, file_path));
            }
        }

        let mut handles = Vec::with_capacity(found.len());
        for (sequence, file_id, file_path) in found {
            let handle = match SegmentReader::open(&file_path) {
                Ok(reader) if reader.descriptor().sequence == sequence => {
                    SegmentHandle::live(file_id, reader)
                }
                Ok(reader) => {
                    let reason = format!(
                        "header sequence {} disagrees with file name",
                        reader.descriptor().sequence
                    );
                    SegmentHandle::damaged(file_id, sequence, file_path, reason)
                }
                Err(e) if e.is_corruption() => {
                    SegmentHandle::damaged(file_id, sequence, file_path, e.to_string())
                }
                Err(e) => return Err(e),
            };
            if let SegmentState::Damaged(reason) = &handle.state {
                tracing::error!(
                    path = %handle.path.display(),
                    %reason,
                    "Damaged segment: reads reaching it will fail"
                );
                report.damaged_segments += 1;
            }
            handles.push(handle);
        }

        let handles = Self::repair_compactions(handles, &mut report)?;
        let next_file_id = handles.iter().map(|h| h.file_id).max().map_or(1, |id| id + 1);

        let mut list: Vec<Arc<SegmentHandle<K>>> = handles.into_iter().map(Arc::new).collect();
        sort_newest_first(&mut list);
        report.segments_loaded = list.len();

        if report.temp_files_removed + report.superseded_removed + report.incomplete_removed > 0 {
            sync_dir(path)?;
        }

        Ok((
            Self {
                data_dir: path.to_path_buf(),
                segments: RwLock::new(Arc::new(list)),
                next_file_id: AtomicU64::new(next_file_id),
            },
            report,
        ))
    }

    /// Resolve compactions interrupted between renaming outputs and deleting
    /// inputs.
    ///
    /// A compaction group is complete when parts `0..=k` are all present and
    /// part `k` is flagged final. A complete group supersedes every older file
    /// whose sequence range lies inside its own; an incomplete group is
    /// discarded because its inputs are all still on disk.
    fn repair_compactions(
        handles: Vec<SegmentHandle<K>>,
        report: &mut RecoveryReport,
    ) -> Result<Vec<SegmentHandle<K>>> {
        let mut groups: BTreeMap<u64, Vec<&SegmentHandle<K>>> = BTreeMap::new();
        for handle in &handles {
            if let Some(desc) = handle.descriptor() {
                if desc.is_compacted() {
                    groups.entry(desc.group_id).or_default().push(handle);
                }
            }
        }

        let mut complete: Vec<(u64, (u64, u64))> = Vec::new();
        let mut discard: HashSet<u64> = HashSet::new();
        for (group_id, parts) in &groups {
            let mut indices: Vec<(u32, bool)> = parts
                .iter()
                .filter_map(|h| h.descriptor().map(|d| (d.part_index, d.is_final_part)))
                .collect();
            indices.sort();
            let contiguous = indices.iter().enumerate().all(|(i, (idx, _))| *idx as usize == i);
            let finished = indices.last().is_some_and(|(_, is_final)| *is_final);

            if contiguous && finished {
                complete.push((*group_id, parts[0].sequence_range()));
            } else {
                tracing::warn!(group_id, parts = parts.len(), "Discarding unfinished compaction output");
                discard.extend(parts.iter().map(|h| h.file_id));
                report.incomplete_removed += parts.len();
            }
        }

        let superseded = |handle: &SegmentHandle<K>| {
            let (base, seq) = handle.sequence_range();
            complete.iter().any(|(group_id, (g_base, g_seq))| {
                handle.group_id() != Some(*group_id)
                    && handle.file_id < *group_id
                    && *g_base <= base
                    && seq <= *g_seq
            })
        };

        let mut kept = Vec::with_capacity(handles.len());
        for handle in handles {
            if discard.contains(&handle.file_id) {
                fs::remove_file(&handle.path)?;
            } else if superseded(&handle) {
                tracing::info!(path = %handle.path.display(), "Removing segment replaced by compaction");
                fs::remove_file(&handle.path)?;
                report.superseded_removed += 1;
            } else {
                kept.push(handle);
            }
        }
        Ok(kept)
    }

    /// Current segment list (cheap: clones one `Arc`)
    pub fn snapshot(&self) -> SegmentList<K> {
        Arc::clone(&self.segments.read())
    }

    /// Reserve a file id and the path that goes with it
    pub fn allocate(&self, sequence: u64) -> (u64, PathBuf) {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        (file_id, self.segment_path(sequence, file_id))
    }

    /// Open a freshly written segment file as a handle (not yet published)
    pub fn open_handle(&self, file_id: u64, path: &Path) -> Result<Arc<SegmentHandle<K>>> {
        let reader = SegmentReader::open(path)?;
        Ok(Arc::new(SegmentHandle::live(file_id, reader)))
    }

    /// Write `records` as a one-part segment with the given sequence
    ///
    /// The segment is durable on return but not yet visible to readers.
    pub fn write_flush_segment(
        &self,
        sequence: u64,
        records: impl IntoIterator<Item = (K, Entry)>,
    ) -> Result<Arc<SegmentHandle<K>>> {
        let (file_id, path) = self.allocate(sequence);
        write_segment(&path, SegmentMeta::flush(sequence, file_id), records)?;
        self.open_handle(file_id, &path)
    }

    /// Make a segment visible to readers at its recency position
    pub fn publish(&self, handle: Arc<SegmentHandle<K>>) {
        let mut segments = self.segments.write();
        let mut list: Vec<_> = segments.iter().cloned().collect();
        list.push(handle);
        sort_newest_first(&mut list);
        *segments = Arc::new(list);
    }

    /// Atomically replace `inputs` (by file id) with `outputs`
    ///
    /// Fails without changing anything if an input is no longer published.
    pub fn replace(&self, inputs: &[u64], outputs: Vec<Arc<SegmentHandle<K>>>) -> Result<()> {
        let mut segments = self.segments.write();
        let published: HashSet<u64> = segments.iter().map(|h| h.file_id).collect();
        if let Some(missing) = inputs.iter().find(|id| !published.contains(id)) {
            return Err(LsmError::Compaction(format!(
                "input segment {} is no longer published",
                missing
            )));
        }

        let mut list: Vec<_> = segments
            .iter()
            .filter(|h| !inputs.contains(&h.file_id))
            .cloned()
            .collect();
        list.extend(outputs);
        sort_newest_first(&mut list);
        *segments = Arc::new(list);
        Ok(())
    }

    /// Delete segment files that have been unpublished
    ///
    /// Best effort: a failure leaves an orphan that recovery removes later.
    pub fn remove_files(&self, handles: &[Arc<SegmentHandle<K>>]) {
        for handle in handles {
            if let Err(e) = fs::remove_file(&handle.path) {
                tracing::warn!(path = %handle.path.display(), error = %e, "Failed to remove segment file");
            }
        }
        if let Err(e) = sync_dir(&self.data_dir) {
            tracing::warn!(error = %e, "Failed to sync segment directory");
        }
    }

    /// True if some published segment already accounts for `sequence`
    pub fn covers_sequence(&self, sequence: u64) -> bool {
        self.segments.read().iter().any(|h| {
            let (base, seq) = h.sequence_range();
            base <= sequence && sequence <= seq
        })
    }

    /// Highest sequence number of any segment (0 if none)
    pub fn max_sequence(&self) -> u64 {
        self.segments.read().iter().map(|h| h.sequence).max().unwrap_or(0)
    }

    /// Get the number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the next file ID (for testing/debugging)
    pub fn next_file_id(&self) -> u64 {
        self.next_file_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn segment_path(&self, sequence: u64, file_id: u64) -> PathBuf {
        self.data_dir.join(Self::segment_file_name(sequence, file_id))
    }

    /// "seg_0000000042_000007.sst" for sequence 42, file 7
    pub fn segment_file_name(sequence: u64, file_id: u64) -> String {
        format!("seg_{:010}_{:06}.sst", sequence, file_id)
    }

    /// Parse (sequence, file_id) from a segment file name
    /// "seg_0000000042_000007.sst" → Some((42, 7))
    pub fn parse_segment_name(path: &Path) -> Option<(u64, u64)> {
        if path.extension()? != "sst" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let rest = stem.strip_prefix("seg_")?;
        let (sequence, file_id) = rest.split_once('_')?;
        Some((sequence.parse().ok()?, file_id.parse().ok()?))
    }
}

/// Newest first: higher sequence, then higher file id
fn sort_newest_first<K>(list: &mut [Arc<SegmentHandle<K>>]) {
    list.sort_by(|a, b| (b.sequence, b.file_id).cmp(&(a.sequence, a.file_id)));
}
