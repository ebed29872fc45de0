//! Tests for map recovery
//!
//! These tests verify:
//! - Full rebuilds for a missing, unreadable, stale or foreign index
//! - Catch-up replay when the index only misses the log tail
//! - Recovery from a torn log tail after a crash
//! - Explicit and cancelled rebuilds

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use durablemap::{
    DurableError, DurableMap, IndexAction, MapState, RebuildReason, Utf8Descriptor,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

type StringMap = DurableMap<Utf8Descriptor, Utf8Descriptor>;

fn setup_temp_map() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path().join("map");
    (temp_dir, base)
}

fn open(base: &Path) -> StringMap {
    DurableMap::open(base, Utf8Descriptor, Utf8Descriptor).unwrap()
}

fn s(value: &str) -> String {
    value.to_string()
}

fn get(map: &StringMap, key: &str) -> Option<String> {
    map.get(&s(key)).unwrap()
}

// =============================================================================
// Full Rebuilds
// =============================================================================

#[test]
fn test_missing_index_is_rebuilt() {
    let (_temp, base) = setup_temp_map();
    let index_path = {
        let map = open(&base);
        map.put(&s("a"), &s("1")).unwrap();
        map.put(&s("b"), &s("2")).unwrap();
        map.put(&s("a"), &s("3")).unwrap();
        map.close().unwrap();
        map.paths().index.clone()
    };
    fs::remove_file(&index_path).unwrap();

    let map = open(&base);
    let report = map.open_report();
    assert_eq!(report.index_action, IndexAction::Rebuilt(RebuildReason::Missing));
    let replay = report.replay.as_ref().unwrap();
    assert_eq!(replay.chunks_scanned, 3);
    assert_eq!(replay.entries_indexed, 3);

    assert_eq!(get(&map, "a"), Some(s("3")));
    assert_eq!(get(&map, "b"), Some(s("2")));
    assert_eq!(map.len(), 2);

    // The rebuilt index is persisted and trusted next time
    map.close().unwrap();
    drop(map);
    let map = open(&base);
    assert_eq!(map.open_report().index_action, IndexAction::UpToDate);
}

#[test]
fn test_garbage_index_is_rebuilt() {
    let (_temp, base) = setup_temp_map();
    let index_path = {
        let map = open(&base);
        map.put(&s("k"), &s("v")).unwrap();
        map.close().unwrap();
        map.paths().index.clone()
    };
    fs::write(&index_path, vec![0x5Au8; 4096]).unwrap();

    let map = open(&base);
    assert_eq!(
        map.open_report().index_action,
        IndexAction::Rebuilt(RebuildReason::Unreadable)
    );
    assert_eq!(get(&map, "k"), Some(s("v")));
}

#[test]
fn test_drop_without_close_is_rebuilt() {
    let (_temp, base) = setup_temp_map();
    {
        let map = open(&base);
        for i in 0..200 {
            map.put(&format!("k{}", i), &format!("v{}", i)).unwrap();
        }
        map.remove(&s("k5")).unwrap();
        // Dropped without close or flush
    }

    let map = open(&base);
    assert!(matches!(
        map.open_report().index_action,
        IndexAction::Rebuilt(_)
    ));
    assert!(map.open_report().log_recovery.is_some());
    assert_eq!(map.len(), 199);
    assert_eq!(get(&map, "k5"), None);
    assert_eq!(get(&map, "k199"), Some(s("v199")));
}

#[test]
fn test_torn_log_tail_loses_only_last_write() {
    let (_temp, base) = setup_temp_map();
    let log_path = {
        let map = open(&base);
        map.put(&s("a"), &s("1")).unwrap();
        map.put(&s("b"), &s("2")).unwrap();
        map.flush().unwrap();
        map.put(&s("c"), &"3".repeat(200)).unwrap();
        map.paths().log.clone()
        // Dropped without close
    };

    // Cut the last chunk in half, as if the machine died mid-write
    let len = fs::metadata(&log_path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&log_path).unwrap();
    file.set_len(len - 100).unwrap();
    drop(file);

    let map = open(&base);
    let report = map.open_report();
    let recovery = report.log_recovery.as_ref().unwrap();
    assert!(recovery.discarded_bytes > 0);
    assert!(matches!(report.index_action, IndexAction::Rebuilt(_)));

    assert_eq!(get(&map, "a"), Some(s("1")));
    assert_eq!(get(&map, "b"), Some(s("2")));
    assert_eq!(get(&map, "c"), None);
    assert_eq!(map.len(), 2);

    // The map keeps working after recovery
    map.put(&s("c"), &s("again")).unwrap();
    map.close().unwrap();
    drop(map);
    assert_eq!(get(&open(&base), "c"), Some(s("again")));
}

#[test]
fn test_index_ahead_of_log_is_rebuilt() {
    let (_temp, base) = setup_temp_map();
    let (log_path, early_log) = {
        let map = open(&base);
        map.put(&s("a"), &s("1")).unwrap();
        map.close().unwrap();
        let log_path = map.paths().log.clone();
        (log_path.clone(), fs::read(&log_path).unwrap())
    };
    {
        let map = open(&base);
        map.put(&s("b"), &s("2")).unwrap();
        map.close().unwrap();
    }

    // Restore the shorter log next to the newer index
    fs::write(&log_path, early_log).unwrap();

    let map = open(&base);
    assert_eq!(
        map.open_report().index_action,
        IndexAction::Rebuilt(RebuildReason::AheadOfLog)
    );
    assert_eq!(get(&map, "a"), Some(s("1")));
    assert_eq!(get(&map, "b"), None);
}

#[test]
fn test_foreign_index_is_rebuilt() {
    let temp = TempDir::new().unwrap();
    let first = temp.path().join("first");
    let second = temp.path().join("second");

    let first_index = {
        let map = open(&first);
        map.put(&s("from"), &s("first")).unwrap();
        map.close().unwrap();
        map.paths().index.clone()
    };
    let second_index = {
        let map = open(&second);
        map.put(&s("from"), &s("second")).unwrap();
        map.put(&s("only"), &s("second")).unwrap();
        map.close().unwrap();
        map.paths().index.clone()
    };
    fs::copy(&second_index, &first_index).unwrap();

    let map = open(&first);
    assert_eq!(
        map.open_report().index_action,
        IndexAction::Rebuilt(RebuildReason::GenerationMismatch)
    );
    assert_eq!(get(&map, "from"), Some(s("first")));
    assert_eq!(get(&map, "only"), None);
    assert_eq!(map.len(), 1);
}

// =============================================================================
// Catch-up
// =============================================================================

#[test]
fn test_stale_index_catches_up() {
    let (_temp, base) = setup_temp_map();
    let (index_path, snapshot, bound_at) = {
        let map = open(&base);
        map.put(&s("a"), &s("1")).unwrap();
        map.put(&s("b"), &s("2")).unwrap();
        map.flush().unwrap();
        let index_path = map.paths().index.clone();
        let snapshot = fs::read(&index_path).unwrap();
        let bound_at = map.log_size();

        map.put(&s("c"), &s("3")).unwrap();
        map.put(&s("a"), &s("4")).unwrap();
        map.remove(&s("b")).unwrap();
        map.close().unwrap();
        (index_path, snapshot, bound_at)
    };

    // An index that missed the last writes but is otherwise valid
    fs::write(&index_path, snapshot).unwrap();

    let map = open(&base);
    let report = map.open_report();
    assert_eq!(report.index_action, IndexAction::CaughtUp);
    let replay = report.replay.as_ref().unwrap();
    assert_eq!(replay.from_offset, bound_at);
    assert_eq!(replay.chunks_scanned, 3);
    assert_eq!(replay.entries_indexed, 2);
    assert_eq!(replay.removals_applied, 1);

    assert_eq!(get(&map, "a"), Some(s("4")));
    assert_eq!(get(&map, "b"), None);
    assert_eq!(get(&map, "c"), Some(s("3")));
    assert_eq!(map.len(), 2);
}

// =============================================================================
// Corruption While Serving
// =============================================================================

#[test]
fn test_corrupted_chunk_triggers_rebuild() {
    let (_temp, base) = setup_temp_map();
    let (log_path, log_size) = {
        let map = open(&base);
        map.put(&s("a"), &s("1")).unwrap();
        map.put(&s("b"), &s("2")).unwrap();
        map.close().unwrap();
        (map.paths().log.clone(), map.log_size())
    };

    // The last chunk holds the 7-byte put record of "b" in a 24-byte slot;
    // damage its first payload byte
    let mut raw = fs::read(&log_path).unwrap();
    let payload_at = (log_size - 24 + 16) as usize;
    raw[payload_at] ^= 0xFF;
    fs::write(&log_path, raw).unwrap();

    let map = open(&base);
    assert_eq!(map.open_report().index_action, IndexAction::UpToDate);

    // The bad chunk is found on first use, the log is cut there and the
    // index rebuilt from what remains
    assert_eq!(get(&map, "b"), None);
    assert_eq!(map.state(), MapState::Open);
    assert_eq!(get(&map, "a"), Some(s("1")));
    assert_eq!(map.len(), 1);
    assert!(map.log_size() < log_size);
}

// =============================================================================
// Explicit Rebuilds
// =============================================================================

#[test]
fn test_explicit_rebuild() {
    let (_temp, base) = setup_temp_map();
    let map = open(&base);
    for i in 0..50 {
        map.put(&format!("k{}", i), &s("v")).unwrap();
    }
    map.remove(&s("k0")).unwrap();

    let report = map.rebuild_index(&AtomicBool::new(false)).unwrap();
    assert_eq!(report.chunks_scanned, 51);
    assert_eq!(report.removals_applied, 1);
    assert_eq!(map.len(), 49);
    assert_eq!(map.state(), MapState::Open);
}

#[test]
fn test_cancelled_rebuild_is_redone_on_next_operation() {
    let (_temp, base) = setup_temp_map();
    let map = open(&base);
    map.put(&s("k"), &s("v")).unwrap();

    let result = map.rebuild_index(&AtomicBool::new(true));
    assert!(matches!(result, Err(DurableError::Cancelled)));
    assert_eq!(map.state(), MapState::Recovering);

    assert_eq!(get(&map, "k"), Some(s("v")));
    assert_eq!(map.state(), MapState::Open);
}

#[test]
fn test_close_after_cancelled_rebuild_persists_full_index() {
    let (_temp, base) = setup_temp_map();
    {
        let map = open(&base);
        map.put(&s("k1"), &s("v1")).unwrap();
        map.put(&s("k2"), &s("v2")).unwrap();
        assert!(map.rebuild_index(&AtomicBool::new(true)).is_err());
        map.close().unwrap();
    }

    let map = open(&base);
    assert!(map.open_report().was_clean());
    assert_eq!(map.len(), 2);
}

// =============================================================================
// Compaction Leftovers
// =============================================================================

#[test]
fn test_interrupted_compaction_files_removed() {
    let (_temp, base) = setup_temp_map();
    let paths = {
        let map = open(&base);
        map.put(&s("k"), &s("v")).unwrap();
        map.close().unwrap();
        map.paths().clone()
    };
    fs::write(&paths.compacting_log, b"half written").unwrap();
    fs::write(&paths.compacting_index, b"half written").unwrap();

    let map = open(&base);
    assert_eq!(map.open_report().stale_files_removed, 2);
    assert!(!paths.compacting_log.exists());
    assert!(!paths.compacting_index.exists());
    assert_eq!(get(&map, "k"), Some(s("v")));
}
