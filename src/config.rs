//! Configuration for lsmstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{LsmError, Result};

/// Main configuration for an LSM tree instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files (WAL, segments)
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal/             (one log per memtable generation)
    ///     └── segments/        (segment files)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Flush once the memtable holds more than this many records
    pub flush_threshold_records: usize,

    /// Flush once the memtable grows beyond this many bytes
    pub flush_threshold_bytes: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Compaction is triggered when the segment count exceeds this bound
    pub max_segments_before_compaction: usize,

    /// Number of segments merged per automatic compaction step
    pub compaction_fan_in: usize,

    /// How the automatic policy picks the segments to merge
    pub compaction_strategy: CompactionStrategy,

    /// Compaction output is split into parts of roughly this size
    pub target_segment_bytes: u64,

    /// Run automatic compaction on a background thread instead of inline
    pub background_compaction: bool,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Log every write before acknowledging it. When disabled, the unflushed
    /// memtable is lost on crash.
    pub wal_enabled: bool,

    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Segment selection for automatic compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Merge the oldest `compaction_fan_in` segments
    OldestFirst,

    /// Merge the adjacent window of `compaction_fan_in` segments with the
    /// smallest total size
    SmallestFirst,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lsmstore_data"),
            flush_threshold_records: 100_000,
            flush_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            max_segments_before_compaction: 8,
            compaction_fan_in: 4,
            compaction_strategy: CompactionStrategy::OldestFirst,
            target_segment_bytes: 64 * 1024 * 1024, // 64 MB
            background_compaction: false,
            wal_enabled: true,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold_records == 0 {
            return Err(LsmError::Config(
                "flush_threshold_records must be greater than zero".to_string(),
            ));
        }
        if self.flush_threshold_bytes == 0 {
            return Err(LsmError::Config(
                "flush_threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_segments_before_compaction == 0 {
            return Err(LsmError::Config(
                "max_segments_before_compaction must be greater than zero".to_string(),
            ));
        }
        if self.compaction_fan_in < 2 {
            return Err(LsmError::Config(format!(
                "compaction_fan_in must be at least 2, got {}",
                self.compaction_fan_in
            )));
        }
        if self.target_segment_bytes == 0 {
            return Err(LsmError::Config(
                "target_segment_bytes must be greater than zero".to_string(),
            ));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(LsmError::Config(
                "WAL sync interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the record-count flush threshold
    pub fn flush_threshold_records(mut self, count: usize) -> Self {
        self.config.flush_threshold_records = count;
        self
    }

    /// Set the byte-size flush threshold
    pub fn flush_threshold_bytes(mut self, size: usize) -> Self {
        self.config.flush_threshold_bytes = size;
        self
    }

    /// Set the segment count that triggers compaction
    pub fn max_segments_before_compaction(mut self, count: usize) -> Self {
        self.config.max_segments_before_compaction = count;
        self
    }

    /// Set how many segments one compaction step merges
    pub fn compaction_fan_in(mut self, count: usize) -> Self {
        self.config.compaction_fan_in = count;
        self
    }

    /// Set the automatic compaction strategy
    pub fn compaction_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.config.compaction_strategy = strategy;
        self
    }

    /// Set the size at which compaction output is split
    pub fn target_segment_bytes(mut self, size: u64) -> Self {
        self.config.target_segment_bytes = size;
        self
    }

    /// Enable or disable the background compaction thread
    pub fn background_compaction(mut self, enabled: bool) -> Self {
        self.config.background_compaction = enabled;
        self
    }

    /// Enable or disable the write-ahead log
    pub fn wal_enabled(mut self, enabled: bool) -> Self {
        self.config.wal_enabled = enabled;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
