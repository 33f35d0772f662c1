//! Tests for WAL Reader

use std::fs::{self, OpenOptions};
use std::io::Write;

use lsmstore::config::WalSyncStrategy;
use lsmstore::wal::{Operation, WalReader, WalWriter};
use lsmstore::LsmError;

use super::{put, setup_temp_wal};

// =============================================================================
// Reading
// =============================================================================

#[test]
fn test_read_back_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(put("a", "1")).unwrap();
        writer.append(put("b", "2")).unwrap();
        writer.append(Operation::Delete { key: b"a".to_vec() }).unwrap();
    }

    let entries: Vec<_> = WalReader::open(&wal_path)
        .unwrap()
        .entries()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().map(|e| e.lsn).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(entries[2].operation, Operation::Delete { key: b"a".to_vec() });
}

#[test]
fn test_empty_file_has_no_entries() {
    let (_temp, wal_path) = setup_temp_wal();
    fs::write(&wal_path, b"").unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_entry().unwrap().is_none());
    assert_eq!(reader.position(), 0);
    assert_eq!(reader.last_lsn(), 0);
}

#[test]
fn test_missing_file_is_io_error() {
    let (_temp, wal_path) = setup_temp_wal();
    assert!(matches!(WalReader::open(&wal_path), Err(LsmError::Io(_))));
}

// =============================================================================
// Damaged Tails
// =============================================================================

#[test]
fn test_torn_tail_reports_corruption_after_valid_prefix() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(put("a", "1")).unwrap();
        writer.append(put("b", "2")).unwrap();
    }
    let valid_len = fs::metadata(&wal_path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[3, 0, 0, 0, 0, 0]).unwrap();
    }

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_some());
    assert!(matches!(reader.next_entry(), Err(LsmError::WalCorruption(_))));
    assert_eq!(reader.position(), valid_len);
    assert_eq!(reader.last_lsn(), 2);
}

#[test]
fn test_iterator_stops_after_error() {
    let (_temp, wal_path) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(put("a", "1")).unwrap();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[0xAB; 20]).unwrap();
    }

    let results: Vec<_> = WalReader::open(&wal_path).unwrap().entries().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}
