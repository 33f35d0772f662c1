//! Tests for LsmTree
//!
//! These tests verify:
//! - Basic insert/find/delete operations
//! - Freezing and flushing on record and byte thresholds
//! - Range scans across memtables and segments
//! - Crash recovery from WAL
//! - Inline, background and full compaction
//! - Damaged segments surfacing as errors
//! - Tree lifecycle (open/close)

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lsmstore::{CompactionStrategy, Config, ConfigBuilder, LsmError, LsmTree, WalSyncStrategy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path) -> ConfigBuilder {
    Config::builder()
        .data_dir(dir)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite) // Sync every write for test reliability
        .max_segments_before_compaction(1_000)
}

fn setup_temp_tree() -> (TempDir, LsmTree<u64>) {
    let temp_dir = TempDir::new().unwrap();
    let tree = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    (temp_dir, tree)
}

fn setup_temp_tree_with_small_memtable(records: usize) -> (TempDir, LsmTree<u64>) {
    let temp_dir = TempDir::new().unwrap();
    let tree = LsmTree::open(
        config(temp_dir.path())
            .flush_threshold_records(records)
            .build(),
    )
    .unwrap();
    (temp_dir, tree)
}

fn value(key: u64) -> Vec<u8> {
    format!("value-{}", key).into_bytes()
}

fn scan_keys(tree: &LsmTree<u64>, range: std::ops::Range<u64>) -> Vec<u64> {
    tree.scan(range)
        .unwrap()
        .map(|record| record.unwrap().0)
        .collect()
}

fn wal_files(dir: &Path) -> usize {
    fs::read_dir(dir.join("wal")).unwrap().count()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_tree_open_creates_directories() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");

    let _tree: LsmTree<u64> = LsmTree::open(config(&data_dir).build()).unwrap();

    assert!(data_dir.join("segments").is_dir());
    assert!(data_dir.join("wal").is_dir());
    assert_eq!(wal_files(&data_dir), 1);
}

#[test]
fn test_tree_insert_find() {
    let (_temp, tree) = setup_temp_tree();

    tree.insert(1, b"one").unwrap();
    assert_eq!(tree.find(&1).unwrap(), Some(b"one".to_vec()));
    assert_eq!(tree.find(&2).unwrap(), None);
}

#[test]
fn test_tree_insert_overwrite() {
    let (_temp, tree) = setup_temp_tree();

    tree.insert(1, b"first").unwrap();
    tree.insert(1, b"second").unwrap();

    assert_eq!(tree.find(&1).unwrap(), Some(b"second".to_vec()));
    assert_eq!(tree.memtable_len(), 1);
}

#[test]
fn test_tree_delete() {
    let (_temp, tree) = setup_temp_tree();

    tree.insert(1, b"one").unwrap();
    tree.delete(1).unwrap();
    assert_eq!(tree.find(&1).unwrap(), None);

    // Deleting a missing key is not an error
    tree.delete(99).unwrap();
    assert_eq!(tree.find(&99).unwrap(), None);
}

#[test]
fn test_tree_delete_shadows_flushed_value() {
    let (_temp, tree) = setup_temp_tree();

    tree.insert(1, b"one").unwrap();
    tree.flush().unwrap();
    tree.delete(1).unwrap();

    assert_eq!(tree.find(&1).unwrap(), None);
    tree.flush().unwrap();
    assert_eq!(tree.find(&1).unwrap(), None);
    assert_eq!(tree.segment_count(), 2);
}

#[test]
fn test_tree_empty_value() {
    let (_temp, tree) = setup_temp_tree();

    tree.insert(5, b"").unwrap();
    tree.flush().unwrap();

    assert_eq!(tree.find(&5).unwrap(), Some(Vec::new()));
}

#[test]
fn test_tree_byte_keys() {
    let temp_dir = TempDir::new().unwrap();
    let tree: LsmTree<Vec<u8>> = LsmTree::open(config(temp_dir.path()).build()).unwrap();

    tree.insert(b"banana".to_vec(), b"yellow").unwrap();
    tree.insert(b"apple".to_vec(), b"red").unwrap();
    tree.flush().unwrap();
    tree.insert(b"cherry".to_vec(), b"dark").unwrap();

    let keys: Vec<Vec<u8>> = tree
        .scan(b"a".to_vec()..b"c".to_vec())
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec()]);
}

// =============================================================================
// Flush Tests
// =============================================================================

#[test]
fn test_tree_manual_flush() {
    let (temp, tree) = setup_temp_tree();

    for key in 0..10 {
        tree.insert(key, &value(key)).unwrap();
    }
    tree.flush().unwrap();

    assert_eq!(tree.segment_count(), 1);
    assert_eq!(tree.memtable_len(), 0);
    assert_eq!(tree.frozen_memtable_count(), 0);
    // Flushed WAL is gone, the fresh one remains
    assert_eq!(wal_files(temp.path()), 1);

    for key in 0..10 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
}

#[test]
fn test_tree_flush_empty_memtable() {
    let (_temp, tree) = setup_temp_tree();

    tree.flush().unwrap();
    tree.flush().unwrap();

    assert_eq!(tree.segment_count(), 0);
}

#[test]
fn test_tree_failed_flush_keeps_data_readable() {
    let (temp, tree) = setup_temp_tree_with_small_memtable(2);
    let segments = temp.path().join("segments");

    tree.insert(1, &value(1)).unwrap();
    tree.insert(2, &value(2)).unwrap();

    // A plain file where the segment directory should be fails the flush
    fs::remove_dir_all(&segments).unwrap();
    fs::write(&segments, b"not a directory").unwrap();

    assert!(matches!(tree.insert(3, &value(3)), Err(LsmError::Io(_))));
    assert_eq!(tree.segment_count(), 0);
    assert_eq!(tree.frozen_memtable_count(), 1);
    assert_eq!(tree.find(&1).unwrap(), Some(value(1)));
    assert_eq!(tree.find(&3).unwrap(), Some(value(3)));

    fs::remove_file(&segments).unwrap();
    fs::create_dir(&segments).unwrap();

    tree.flush().unwrap();
    assert_eq!(tree.segment_count(), 1);
    assert_eq!(tree.frozen_memtable_count(), 0);
    for key in 1..=3 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
}

#[test]
fn test_tree_auto_flush_on_record_threshold() {
    let (_temp, tree) = setup_temp_tree_with_small_memtable(10);

    for key in 0..35 {
        tree.insert(key, &value(key)).unwrap();
    }

    // Freezes once a memtable holds more than 10 records
    assert_eq!(tree.segment_count(), 3);
    assert_eq!(tree.memtable_len(), 2);
    for d in tree.descriptors() {
        assert_eq!(d.record_count, 11);
    }
    for key in 0..35 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
}

#[test]
fn test_tree_auto_flush_on_byte_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let tree: LsmTree<u64> = LsmTree::open(
        config(temp_dir.path())
            .flush_threshold_bytes(64)
            .build(),
    )
    .unwrap();

    for key in 0..3 {
        tree.insert(key, &[7u8; 100]).unwrap();
    }

    assert_eq!(tree.segment_count(), 3);
    assert_eq!(tree.memtable_size(), 0);
}

#[test]
fn test_tree_segments_newest_first() {
    let (_temp, tree) = setup_temp_tree_with_small_memtable(2);

    for key in 0..9 {
        tree.insert(key, &value(key)).unwrap();
    }

    let sequences: Vec<u64> = tree.descriptors().iter().map(|d| d.sequence).collect();
    assert_eq!(sequences, vec![3, 2, 1]);
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_tree_scan_merges_sources() {
    let (_temp, tree) = setup_temp_tree();

    for key in [1, 3, 5] {
        tree.insert(key, b"old").unwrap();
    }
    tree.flush().unwrap();
    for key in [2, 3, 4] {
        tree.insert(key, b"new").unwrap();
    }
    tree.flush().unwrap();
    tree.insert(6, b"mem").unwrap();
    tree.delete(5).unwrap();

    let records: Vec<(u64, Vec<u8>)> = tree.scan(0..100).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(
        records,
        vec![
            (1, b"old".to_vec()),
            (2, b"new".to_vec()),
            (3, b"new".to_vec()),
            (4, b"new".to_vec()),
            (6, b"mem".to_vec()),
        ]
    );
}

#[test]
fn test_tree_scan_bounds() {
    let (_temp, tree) = setup_temp_tree_with_small_memtable(5);
    for key in 0..20 {
        tree.insert(key, &value(key)).unwrap();
    }

    assert_eq!(scan_keys(&tree, 3..7), vec![3, 4, 5, 6]);
    assert_eq!(scan_keys(&tree, 7..7), Vec::<u64>::new());
    assert_eq!(scan_keys(&tree, 18..100), vec![18, 19]);

    let inclusive: Vec<u64> = tree.scan(10..=12).unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(inclusive, vec![10, 11, 12]);

    assert_eq!(tree.scan(..).unwrap().count(), 20);
}

#[test]
fn test_tree_scan_is_a_snapshot_of_memtables() {
    let (_temp, tree) = setup_temp_tree();
    tree.insert(1, b"a").unwrap();

    let scan = tree.scan(0..10).unwrap();
    tree.insert(2, b"b").unwrap();

    let keys: Vec<u64> = scan.map(|r| r.unwrap().0).collect();
    assert_eq!(keys, vec![1]);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_tree_recovery_from_wal() {
    let temp_dir = TempDir::new().unwrap();

    {
        let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
        tree.insert(1, b"one").unwrap();
        tree.insert(2, b"two").unwrap();
        tree.delete(1).unwrap();
        // Dropped without close: only the WAL has the data
    }

    let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    assert_eq!(tree.find(&1).unwrap(), None);
    assert_eq!(tree.find(&2).unwrap(), Some(b"two".to_vec()));
    assert_eq!(tree.segment_count(), 1);
    assert_eq!(wal_files(temp_dir.path()), 1);
}

#[test]
fn test_tree_recovered_delete_shadows_segment() {
    let temp_dir = TempDir::new().unwrap();

    {
        let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
        tree.insert(1, b"one").unwrap();
        tree.flush().unwrap();
        tree.delete(1).unwrap();
    }

    let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    assert_eq!(tree.find(&1).unwrap(), None);
    assert_eq!(tree.segment_count(), 2);
}

#[test]
fn test_tree_sequences_continue_after_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
        tree.insert(1, b"old").unwrap();
        tree.close().unwrap();
    }

    let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    tree.insert(1, b"new").unwrap();
    tree.flush().unwrap();

    let sequences: Vec<u64> = tree.descriptors().iter().map(|d| d.sequence).collect();
    assert_eq!(sequences.len(), 2);
    assert!(sequences[0] > sequences[1]);
    assert_eq!(tree.find(&1).unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_tree_close_flushes_data() {
    let temp_dir = TempDir::new().unwrap();

    {
        let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
        for key in 0..50 {
            tree.insert(key, &value(key)).unwrap();
        }
        tree.close().unwrap();
    }

    let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    assert_eq!(tree.segment_count(), 1);
    assert_eq!(tree.memtable_len(), 0);
    for key in 0..50 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
}

#[test]
fn test_tree_without_wal_loses_unflushed_writes() {
    let temp_dir = TempDir::new().unwrap();
    let no_wal = || config(temp_dir.path()).wal_enabled(false).build();

    {
        let tree: LsmTree<u64> = LsmTree::open(no_wal()).unwrap();
        tree.insert(1, b"flushed").unwrap();
        tree.flush().unwrap();
        tree.insert(2, b"lost").unwrap();
        assert_eq!(wal_files(temp_dir.path()), 0);
    }

    let tree: LsmTree<u64> = LsmTree::open(no_wal()).unwrap();
    assert_eq!(tree.find(&1).unwrap(), Some(b"flushed".to_vec()));
    assert_eq!(tree.find(&2).unwrap(), None);
}

#[test]
fn test_tree_open_path_convenience() {
    let temp_dir = TempDir::new().unwrap();

    let tree: LsmTree<u64> = LsmTree::open_path(temp_dir.path()).unwrap();
    tree.insert(1, b"x").unwrap();

    assert_eq!(tree.data_dir(), temp_dir.path());
    assert_eq!(tree.segment_dir(), temp_dir.path().join("segments"));
    assert_eq!(tree.config().compaction_fan_in, 4);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_tree_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();

    let invalid = [
        config(temp_dir.path()).compaction_fan_in(1).build(),
        config(temp_dir.path()).flush_threshold_records(0).build(),
        config(temp_dir.path()).target_segment_bytes(0).build(),
        config(temp_dir.path())
            .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 0 })
            .build(),
    ];
    for cfg in invalid {
        let result = LsmTree::<u64>::open(cfg);
        assert!(matches!(result, Err(LsmError::Config(_))));
    }
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_tree_full_compaction() {
    let (_temp, tree) = setup_temp_tree_with_small_memtable(9);

    for key in 0..40 {
        tree.insert(key, &value(key)).unwrap();
    }
    for key in 0..10 {
        tree.delete(key).unwrap();
    }
    tree.flush().unwrap();
    assert!(tree.segment_count() > 1);

    let stats = tree.compact().unwrap().unwrap();
    assert!(stats.tombstones_dropped);
    assert_eq!(stats.records_written, 30);
    assert_eq!(tree.segment_count(), 1);

    for key in 0..10 {
        assert_eq!(tree.find(&key).unwrap(), None);
    }
    assert_eq!(scan_keys(&tree, 0..100), (10..40).collect::<Vec<_>>());

    // Already a single group
    assert!(tree.compact().unwrap().is_none());
}

#[test]
fn test_tree_compact_nothing() {
    let (_temp, tree) = setup_temp_tree();

    assert!(tree.compact().unwrap().is_none());
    tree.insert(1, b"x").unwrap();
    tree.flush().unwrap();
    assert!(tree.compact().unwrap().is_none());
}

#[test]
fn test_tree_inline_compaction_bounds_segments() {
    let temp_dir = TempDir::new().unwrap();
    let tree: LsmTree<u64> = LsmTree::open(
        config(temp_dir.path())
            .flush_threshold_records(4)
            .max_segments_before_compaction(3)
            .compaction_fan_in(2)
            .build(),
    )
    .unwrap();

    for key in 0..100 {
        tree.insert(key % 37, &value(key)).unwrap();
        assert!(tree.segment_count() <= 3);
    }

    // Last write of every key wins
    for key in 63..100 {
        assert_eq!(tree.find(&(key % 37)).unwrap(), Some(value(key)));
    }
}

#[test]
fn test_tree_smallest_first_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let tree: LsmTree<u64> = LsmTree::open(
        config(temp_dir.path())
            .flush_threshold_records(4)
            .max_segments_before_compaction(4)
            .compaction_fan_in(2)
            .compaction_strategy(CompactionStrategy::SmallestFirst)
            .build(),
    )
    .unwrap();

    for key in 0..80 {
        tree.insert(key, &value(key)).unwrap();
    }
    tree.delete(3).unwrap();
    tree.flush().unwrap();

    assert!(tree.segment_count() <= 4);
    assert_eq!(tree.find(&3).unwrap(), None);
    assert_eq!(scan_keys(&tree, 0..80).len(), 79);
}

#[test]
fn test_tree_background_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let tree: LsmTree<u64> = LsmTree::open(
        config(temp_dir.path())
            .flush_threshold_records(4)
            .max_segments_before_compaction(2)
            .background_compaction(true)
            .build(),
    )
    .unwrap();

    for key in 0..60 {
        tree.insert(key, &value(key)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while tree.segment_count() > 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(tree.segment_count() <= 2);

    for key in 0..60 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
    tree.close().unwrap();
}

#[test]
fn test_tree_close_stops_background_worker() {
    let temp_dir = TempDir::new().unwrap();
    let build = || {
        config(temp_dir.path())
            .flush_threshold_records(2)
            .max_segments_before_compaction(2)
            .background_compaction(true)
            .build()
    };

    {
        let tree: LsmTree<u64> = LsmTree::open(build()).unwrap();
        for key in 0..30 {
            tree.insert(key, &value(key)).unwrap();
        }
        tree.close().unwrap();
    }

    let tree: LsmTree<u64> = LsmTree::open(build()).unwrap();
    for key in 0..30 {
        assert_eq!(tree.find(&key).unwrap(), Some(value(key)));
    }
}

// =============================================================================
// Damaged Segment Tests
// =============================================================================

fn corrupt_oldest_segment(dir: &Path) {
    let mut segments: Vec<_> = fs::read_dir(dir.join("segments"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    let mut bytes = fs::read(&segments[0]).unwrap();
    bytes[24] ^= 0xFF;
    fs::write(&segments[0], bytes).unwrap();
}

#[test]
fn test_tree_damaged_segment_errors_on_read() {
    let temp_dir = TempDir::new().unwrap();

    {
        let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
        tree.insert(1, b"old").unwrap();
        tree.flush().unwrap();
        tree.insert(2, b"new").unwrap();
        tree.close().unwrap();
    }
    corrupt_oldest_segment(temp_dir.path());

    let tree: LsmTree<u64> = LsmTree::open(config(temp_dir.path()).build()).unwrap();
    assert_eq!(tree.segment_count(), 2);
    assert_eq!(tree.descriptors().len(), 1);

    // Found before the damaged segment is reached
    assert_eq!(tree.find(&2).unwrap(), Some(b"new".to_vec()));
    assert!(matches!(tree.find(&1), Err(LsmError::Corruption(_))));
    assert!(tree.scan(0..10).is_err());
    assert!(matches!(tree.compact(), Err(LsmError::Compaction(_))));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_tree_concurrent_reads_and_writes() {
    let temp_dir = TempDir::new().unwrap();
    let tree: Arc<LsmTree<u64>> = Arc::new(
        LsmTree::open(
            config(temp_dir.path())
                .flush_threshold_records(16)
                .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 64 })
                .build(),
        )
        .unwrap(),
    );

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in 0..500 {
                tree.insert(key, &value(key)).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for _ in 0..50 {
                    let keys: Vec<u64> =
                        tree.scan(0..500).unwrap().map(|r| r.unwrap().0).collect();
                    assert!(keys.windows(2).all(|w| w[0] < w[1]));
                    if let Some(v) = tree.find(&0).unwrap() {
                        assert_eq!(v, value(0));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(scan_keys(&tree, 0..500), (0..500).collect::<Vec<_>>());
}
