//! Tree Module
//!
//! The LSM tree that coordinates all components.
//!
//! ## Responsibilities
//! - Coordinate WAL, memtables, and segments
//! - Handle concurrent read/write access
//! - Freeze and flush memtables when they fill up
//! - Trigger compaction when too many segments accumulate
//! - Manage crash recovery on startup

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::codec::Key;
use crate::config::Config;
use crate::error::{LsmError, Result};
use crate::memtable::{Entry, MemTable};
use crate::merge::{EntryIter, MergeIterator};
use crate::range::KeyRange;
use crate::storage::compaction::{self, CompactionControl, CompactionStats};
use crate::storage::{SegmentDescriptor, SegmentList, StorageManager};
use crate::wal::{Operation, WalRecovery, WalWriter};

/// Messages for the background compaction worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompactionSignal {
    /// Segment count went over the bound
    Compact,
    /// Tree is closing
    Shutdown,
}

/// The active memtable plus the frozen ones waiting to be flushed
struct MemTables<K> {
    active: Arc<MemTable<K>>,
    /// Oldest first
    frozen: VecDeque<Arc<MemTable<K>>>,
}

/// A log-structured merge tree over keys of type `K`
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (insert/delete and the freeze step): serialized by
///   `write_lock`. Lock order: write_lock → memtables → wal.
/// - **Flush**: serialized by `flush_lock`, runs without the write lock so
///   writers keep filling the new active memtable.
/// - **Reads** (find/scan): snapshot the memtables, then the segment list.
///   A flush publishes its segment before dropping the frozen memtable, so a
///   reader always sees the data in at least one of the two.
/// - **Compaction**: one at a time (`compaction_lock`), inline or on a
///   background thread.
pub struct LsmTree<K: Key> {
    inner: Arc<TreeInner<K>>,
    worker: Option<CompactionWorker>,
}

struct CompactionWorker {
    sender: Sender<CompactionSignal>,
    handle: JoinHandle<()>,
}

struct TreeInner<K> {
    config: Config,
    wal_dir: PathBuf,
    storage: StorageManager<K>,
    memtables: RwLock<MemTables<K>>,
    /// WAL of the active memtable (`None` when the WAL is disabled)
    wal: Mutex<Option<WalWriter>>,
    /// Sequence for the next memtable generation
    next_sequence: AtomicU64,
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    control: CompactionControl,
}

impl<K: Key> LsmTree<K> {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_DIR: &'static str = "wal";
    const SEGMENT_DIR: &'static str = "segments";

    /// Open or create a tree with the given config
    ///
    /// On startup:
    /// 1. Create the data, WAL and segment directories
    /// 2. Load segments, repairing interrupted flushes and compactions
    /// 3. Replay every WAL not yet covered by a segment into a segment
    /// 4. Start the background compactor if enabled
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.data_dir)?;
        let wal_dir = config.data_dir.join(Self::WAL_DIR);
        let segment_dir = config.data_dir.join(Self::SEGMENT_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&segment_dir)?;

        let (storage, report) = StorageManager::open(&segment_dir)?;
        tracing::info!(
            segments = report.segments_loaded,
            damaged = report.damaged_segments,
            temp_removed = report.temp_files_removed,
            superseded_removed = report.superseded_removed,
            incomplete_removed = report.incomplete_removed,
            "Segments recovered"
        );

        let max_wal_sequence = Self::replay_wal_files(&wal_dir, &storage)?;
        let next_sequence = storage.max_sequence().max(max_wal_sequence) + 1;

        let wal = if config.wal_enabled {
            Some(WalWriter::open(
                &Self::wal_path(&wal_dir, next_sequence),
                config.wal_sync_strategy,
            )?)
        } else {
            None
        };

        let inner = Arc::new(TreeInner {
            wal_dir,
            storage,
            memtables: RwLock::new(MemTables {
                active: Arc::new(MemTable::new(next_sequence)),
                frozen: VecDeque::new(),
            }),
            wal: Mutex::new(wal),
            next_sequence: AtomicU64::new(next_sequence + 1),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            control: CompactionControl::new(),
            config,
        });

        let worker = if inner.config.background_compaction {
            Some(CompactionWorker::spawn(Arc::clone(&inner))?)
        } else {
            None
        };

        tracing::info!(
            data_dir = %inner.config.data_dir.display(),
            segments = inner.storage.segment_count(),
            sequence = next_sequence,
            "Tree opened"
        );

        let tree = Self { inner, worker };
        tree.maybe_compact();
        Ok(tree)
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Replay WAL files left by a previous run, oldest first
    ///
    /// Each file becomes a segment with the file's sequence, then is deleted.
    /// Returns the highest WAL sequence seen (0 if none).
    fn replay_wal_files(wal_dir: &Path, storage: &StorageManager<K>) -> Result<u64> {
        let mut wal_files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(wal_dir)? {
            let path = entry?.path();
            if let Some(sequence) = Self::parse_wal_name(&path) {
                wal_files.push((sequence, path));
            }
        }
        wal_files.sort();

        let mut max_sequence = 0;
        for (sequence, path) in wal_files {
            max_sequence = max_sequence.max(sequence);

            if storage.covers_sequence(sequence) {
                tracing::debug!(sequence, "WAL already flushed, removing");
                fs::remove_file(&path)?;
                continue;
            }

            let (entries, result) = WalRecovery::recover(&path)?;
            if result.entries_recovered > 0 || result.entries_corrupted > 0 {
                tracing::info!(
                    sequence,
                    recovered = result.entries_recovered,
                    corrupted = result.entries_corrupted,
                    last_lsn = result.last_lsn,
                    "WAL recovery"
                );
            }

            let memtable = MemTable::new(sequence);
            for entry in entries {
                match entry.operation {
                    Operation::Put { key, value } => {
                        memtable.put(K::decode(&key)?, value);
                    }
                    Operation::Delete { key } => {
                        memtable.delete(K::decode(&key)?);
                    }
                }
            }

            if !memtable.is_empty() {
                tracing::debug!(sequence, records = memtable.len(), "Flushing recovered entries");
                let handle = storage.write_flush_segment(sequence, memtable.drain())?;
                storage.publish(handle);
            }
            fs::remove_file(&path)?;
        }
        Ok(max_sequence)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Insert or overwrite a key
    ///
    /// Steps:
    /// 1. Acquire write lock
    /// 2. Write to WAL (durability)
    /// 3. Write to the active memtable
    /// 4. Freeze and flush if a threshold is exceeded
    pub fn insert(&self, key: K, value: &[u8]) -> Result<()> {
        self.write(key, Entry::Value(value.to_vec()))
    }

    /// Delete a key (writes a tombstone)
    pub fn delete(&self, key: K) -> Result<()> {
        self.write(key, Entry::Tombstone)
    }

    fn write(&self, key: K, entry: Entry) -> Result<()> {
        let frozen = {
            let _write_guard = self.inner.write_lock.lock();

            if let Some(wal) = self.inner.wal.lock().as_mut() {
                let key = key.to_bytes();
                let operation = match &entry {
                    Entry::Value(value) => Operation::Put {
                        key,
                        value: value.clone(),
                    },
                    Entry::Tombstone => Operation::Delete { key },
                };
                wal.append(operation)?;
            }

            let active = Arc::clone(&self.inner.memtables.read().active);
            active.insert(key, entry);

            if self.inner.over_threshold(&active) {
                self.inner.freeze()?
            } else {
                false
            }
        };

        if frozen {
            self.inner.flush_frozen()?;
            self.maybe_compact();
        }
        Ok(())
    }

    /// Flush all buffered writes to segments
    ///
    /// Forces a flush regardless of memtable size. A no-op when nothing is
    /// buffered.
    pub fn flush(&self) -> Result<()> {
        {
            let _write_guard = self.inner.write_lock.lock();
            self.inner.freeze()?;
        }
        self.inner.flush_frozen()?;
        self.maybe_compact();
        Ok(())
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Get the value stored for `key`
    ///
    /// Search order, first hit wins:
    /// 1. Active memtable
    /// 2. Frozen memtables (newest first)
    /// 3. Segments (newest first)
    ///
    /// A tombstone ends the search with `None`.
    pub fn find(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let memtables = self.inner.memtable_snapshot();
        for memtable in &memtables {
            if let Some(entry) = memtable.get(key) {
                return Ok(entry.into_value());
            }
        }

        let segments = self.inner.storage.snapshot();
        for handle in segments.iter() {
            if let Some(entry) = handle.reader()?.find(key)? {
                return Ok(entry.into_value());
            }
        }
        Ok(None)
    }

    /// Iterate over live records in `range`, ascending
    ///
    /// The scan reads a snapshot of the memtables taken now; segments are
    /// streamed from disk lazily. Fails up front if a damaged segment is
    /// published.
    pub fn scan<R: RangeBounds<K>>(&self, range: R) -> Result<TreeScan<K>> {
        let range = KeyRange::from_bounds(&range);

        let mut sources: Vec<EntryIter<K>> = Vec::new();
        for memtable in self.inner.memtable_snapshot() {
            sources.push(Box::new(memtable.scan(range.clone()).map(Ok::<_, LsmError>)));
        }

        // A compaction may delete a snapshotted input before its file is
        // opened; the replacement list then holds the same data.
        let mut segments = self.inner.storage.snapshot();
        loop {
            match Self::open_segment_sources(&segments, &range) {
                Ok(opened) => {
                    sources.extend(opened);
                    break;
                }
                Err(LsmError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    let current = self.inner.storage.snapshot();
                    if Arc::ptr_eq(&current, &segments) {
                        return Err(LsmError::Io(e));
                    }
                    segments = current;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(TreeScan {
            merged: MergeIterator::new(sources),
        })
    }

    fn open_segment_sources(
        segments: &SegmentList<K>,
        range: &KeyRange<K>,
    ) -> Result<Vec<EntryIter<K>>> {
        let mut sources: Vec<EntryIter<K>> = Vec::with_capacity(segments.len());
        for handle in segments.iter() {
            let reader = handle.reader()?;
            sources.push(Box::new(reader.scan(range.clone())?));
        }
        Ok(sources)
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Merge every segment into one compaction group
    ///
    /// Returns `None` when there was nothing to merge.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        self.inner.compact_full()
    }

    /// Ask a running compaction to stop; it publishes nothing
    pub fn cancel_compaction(&self) {
        self.inner.control.cancel();
    }

    fn maybe_compact(&self) {
        if self.inner.storage.segment_count() <= self.inner.config.max_segments_before_compaction {
            return;
        }
        match &self.worker {
            Some(worker) => {
                if worker.sender.send(CompactionSignal::Compact).is_err() {
                    tracing::warn!("Compaction worker is gone");
                }
            }
            None => {
                if let Err(e) = self.inner.compact_automatic() {
                    tracing::error!(error = %e, "Automatic compaction failed");
                }
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close the tree gracefully
    ///
    /// Stops the compactor, flushes buffered writes and syncs the WAL.
    pub fn close(mut self) -> Result<()> {
        self.stop_worker();

        {
            let _write_guard = self.inner.write_lock.lock();
            self.inner.freeze()?;
        }
        self.inner.flush_frozen()?;

        if let Some(wal) = self.inner.wal.lock().as_mut() {
            wal.sync()?;
        }

        tracing::info!(
            data_dir = %self.inner.config.data_dir.display(),
            segments = self.inner.storage.segment_count(),
            "Tree closed"
        );
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.inner.control.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.sender.send(CompactionSignal::Shutdown);
            if worker.handle.join().is_err() {
                tracing::error!("Compaction worker panicked");
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Get the segment directory path
    pub fn segment_dir(&self) -> &Path {
        self.inner.storage.data_dir()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of published segments
    pub fn segment_count(&self) -> usize {
        self.inner.storage.segment_count()
    }

    /// Records in the active memtable
    pub fn memtable_len(&self) -> usize {
        self.inner.memtables.read().active.len()
    }

    /// Approximate size of the active memtable in bytes
    pub fn memtable_size(&self) -> usize {
        self.inner.memtables.read().active.size_bytes()
    }

    /// Memtables frozen but not yet flushed
    pub fn frozen_memtable_count(&self) -> usize {
        self.inner.memtables.read().frozen.len()
    }

    /// Descriptors of the readable segments, newest first
    pub fn descriptors(&self) -> Vec<SegmentDescriptor<K>> {
        self.inner
            .storage
            .snapshot()
            .iter()
            .filter_map(|h| h.descriptor().cloned())
            .collect()
    }

    /// Total body reads across published segments
    pub fn segment_body_reads(&self) -> u64 {
        self.inner
            .storage
            .snapshot()
            .iter()
            .filter_map(|h| h.reader().ok().map(|r| r.body_reads()))
            .sum()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn wal_path(wal_dir: &Path, sequence: u64) -> PathBuf {
        wal_dir.join(format!("wal_{:010}.log", sequence))
    }

    /// "wal_0000000042.log" → Some(42)
    fn parse_wal_name(path: &Path) -> Option<u64> {
        if path.extension()? != "log" {
            return None;
        }
        path.file_stem()?
            .to_str()?
            .strip_prefix("wal_")?
            .parse()
            .ok()
    }
}

impl<K: Key> Drop for LsmTree<K> {
    fn drop(&mut self) {
        self.stop_worker();
        if let Some(wal) = self.inner.wal.lock().as_mut() {
            if let Err(e) = wal.sync() {
                tracing::warn!(error = %e, "Failed to sync WAL on drop");
            }
        }
    }
}

impl<K: Key> TreeInner<K> {
    fn over_threshold(&self, memtable: &MemTable<K>) -> bool {
        memtable.len() > self.config.flush_threshold_records
            || memtable.size_bytes() > self.config.flush_threshold_bytes
    }

    /// Active memtable first, then frozen ones newest first
    fn memtable_snapshot(&self) -> Vec<Arc<MemTable<K>>> {
        let tables = self.memtables.read();
        let mut snapshot = Vec::with_capacity(tables.frozen.len() + 1);
        snapshot.push(Arc::clone(&tables.active));
        snapshot.extend(tables.frozen.iter().rev().cloned());
        snapshot
    }

    /// Swap in a fresh active memtable (and WAL). Caller holds `write_lock`.
    ///
    /// Returns false when the active memtable is empty.
    fn freeze(&self) -> Result<bool> {
        if self.memtables.read().active.is_empty() {
            return Ok(false);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let new_wal = if self.config.wal_enabled {
            Some(WalWriter::open(
                &LsmTree::<K>::wal_path(&self.wal_dir, sequence),
                self.config.wal_sync_strategy,
            )?)
        } else {
            None
        };

        {
            let mut tables = self.memtables.write();
            let frozen = std::mem::replace(&mut tables.active, Arc::new(MemTable::new(sequence)));
            tracing::debug!(
                sequence = frozen.sequence(),
                records = frozen.len(),
                bytes = frozen.size_bytes(),
                "Memtable frozen"
            );
            tables.frozen.push_back(frozen);
        }

        let old_wal = std::mem::replace(&mut *self.wal.lock(), new_wal);
        if let Some(mut old_wal) = old_wal {
            old_wal.sync()?;
        }
        Ok(true)
    }

    /// Write every frozen memtable to a segment, oldest first
    ///
    /// On error the failing memtable stays frozen (and readable) and is
    /// retried by the next flush.
    fn flush_frozen(&self) -> Result<()> {
        let _flush_guard = self.flush_lock.lock();

        loop {
            let oldest = match self.memtables.read().frozen.front() {
                Some(table) => Arc::clone(table),
                None => return Ok(()),
            };
            let sequence = oldest.sequence();

            if !oldest.is_empty() {
                let handle = self.storage.write_flush_segment(sequence, oldest.iter())?;
                tracing::debug!(
                    sequence,
                    records = oldest.len(),
                    path = %handle.path().display(),
                    "Memtable flushed"
                );
                self.storage.publish(handle);
            }

            {
                let mut tables = self.memtables.write();
                if tables.frozen.front().is_some_and(|t| Arc::ptr_eq(t, &oldest)) {
                    tables.frozen.pop_front();
                }
            }

            let wal_path = LsmTree::<K>::wal_path(&self.wal_dir, sequence);
            if wal_path.exists() {
                if let Err(e) = fs::remove_file(&wal_path) {
                    tracing::warn!(path = %wal_path.display(), error = %e, "Failed to remove flushed WAL");
                }
            }
        }
    }

    fn compact_full(&self) -> Result<Option<CompactionStats>> {
        let _compaction_guard = self.compaction_lock.lock();
        if self.control.is_shutdown() {
            return Err(LsmError::Compaction("tree is shutting down".to_string()));
        }
        self.control.reset();

        match compaction::plan_full(&self.storage.snapshot())? {
            Some(plan) => compaction::run(
                &self.storage,
                plan,
                self.config.target_segment_bytes,
                &self.control,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Compact until the segment count is within bound or no window is left
    fn compact_automatic(&self) -> Result<usize> {
        let _compaction_guard = self.compaction_lock.lock();
        let mut runs = 0;

        while self.storage.segment_count() > self.config.max_segments_before_compaction {
            if self.control.is_shutdown() {
                break;
            }
            self.control.reset();

            let plan = match compaction::plan_automatic(
                &self.storage.snapshot(),
                self.config.compaction_fan_in,
                self.config.compaction_strategy,
            ) {
                Some(plan) => plan,
                None => break,
            };
            compaction::run(
                &self.storage,
                plan,
                self.config.target_segment_bytes,
                &self.control,
            )?;
            runs += 1;
        }
        Ok(runs)
    }
}

impl CompactionWorker {
    fn spawn<K: Key>(inner: Arc<TreeInner<K>>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("lsm-compaction".into())
            .spawn(move || Self::run(inner, receiver))?;
        Ok(Self { sender, handle })
    }

    fn run<K: Key>(inner: Arc<TreeInner<K>>, receiver: Receiver<CompactionSignal>) {
        tracing::debug!("Compaction worker started");
        while let Ok(signal) = receiver.recv() {
            if signal == CompactionSignal::Shutdown {
                break;
            }
            // Coalesce queued requests into one pass
            let shutdown = receiver
                .try_iter()
                .any(|signal| signal == CompactionSignal::Shutdown);
            if shutdown {
                break;
            }

            match inner.compact_automatic() {
                Ok(runs) if runs > 0 => tracing::debug!(runs, "Background compaction pass done"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Background compaction failed"),
            }
        }
        tracing::debug!("Compaction worker stopped");
    }
}

/// Ordered stream of live records produced by `LsmTree::scan`
pub struct TreeScan<K> {
    merged: MergeIterator<K>,
}

impl<K: Key> Iterator for TreeScan<K> {
    type Item = Result<(K, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.merged.next()? {
                Ok((key, Entry::Value(value))) => return Some(Ok((key, value))),
                Ok((_, Entry::Tombstone)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
