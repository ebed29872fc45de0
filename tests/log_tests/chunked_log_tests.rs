//! Tests for the chunked log
//!
//! These tests verify:
//! - Fixed and appendable chunk allocation and reads
//! - In-place appends and the set-once forward link
//! - Tail recovery after an unclean shutdown
//! - Corruption reporting for bad ids and damaged payloads
//! - Concurrent allocation

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use durablemap::config::SyncStrategy;
use durablemap::log::{ChunkId, ChunkKind, ChunkedLog, LOG_HEADER_SIZE};
use durablemap::DurableError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("test.log");
    (temp_dir, log_path)
}

fn open(path: &PathBuf) -> ChunkedLog {
    ChunkedLog::open(path, SyncStrategy::Manual).unwrap()
}

fn file_len(path: &PathBuf) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

// =============================================================================
// Allocation and Reads
// =============================================================================

#[test]
fn test_new_log_is_empty() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    assert!(log.is_empty());
    assert_eq!(log.chunks_count(), 0);
    assert_eq!(log.frontier(), LOG_HEADER_SIZE);
    assert!(!log.was_recovery_needed());
}

#[test]
fn test_fixed_chunk_read_back() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let first = log.append_fixed(b"hello", false).unwrap().id();
    let second = log.append_fixed(b"chunked world", false).unwrap().id();

    assert!(second > first);
    assert_eq!(&log.read(first).unwrap().read().unwrap()[..], b"hello");
    assert_eq!(&log.read(second).unwrap().read().unwrap()[..], b"chunked world");
    assert_eq!(log.chunks_count(), 2);

    let chunk = log.read(first).unwrap();
    assert_eq!(chunk.kind(), ChunkKind::Fixed { length: 5 });
    assert!(!chunk.is_appendable());
    assert!(chunk.is_full().unwrap());
}

#[test]
fn test_chunks_are_aligned() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    for len in 1..20usize {
        let chunk = log.append_fixed(&vec![7u8; len], false).unwrap();
        assert_eq!((chunk.offset() - LOG_HEADER_SIZE) % 8, 0);
    }
    assert_eq!((log.frontier() - LOG_HEADER_SIZE) % 8, 0);
}

#[test]
fn test_empty_fixed_payload_rejected() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    assert!(matches!(
        log.append_fixed(b"", false),
        Err(DurableError::Usage(_))
    ));
    assert!(log.is_empty());
}

#[test]
fn test_appendable_capacity_limits() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    assert!(matches!(log.append(0), Err(DurableError::Usage(_))));
    assert!(matches!(
        log.append(70_000),
        Err(DurableError::CapacityExceeded(_))
    ));
    assert!(log.append(65_535).is_ok());
}

// =============================================================================
// In-place Appends
// =============================================================================

#[test]
fn test_append_until_full() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let chunk = log.append(10).unwrap();
    assert_eq!(chunk.remaining().unwrap(), 10);

    assert!(chunk.append(4, |buf| {
        buf.copy_from_slice(b"abcd");
        Ok(())
    })
    .unwrap());
    assert!(chunk.append(4, |buf| {
        buf.copy_from_slice(b"efgh");
        Ok(())
    })
    .unwrap());
    assert_eq!(chunk.remaining().unwrap(), 2);

    // Too large for what is left: writer must not run
    let called = AtomicUsize::new(0);
    let appended = chunk
        .append(3, |_| {
            called.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    assert!(!appended);
    assert_eq!(called.load(Ordering::Relaxed), 0);

    assert_eq!(&log.read(chunk.id()).unwrap().read().unwrap()[..], b"abcdefgh");
}

#[test]
fn test_append_to_fixed_chunk_refused() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let chunk = log.append_fixed(b"fixed", false).unwrap();
    assert!(!chunk.append(1, |_| Ok(())).unwrap());
}

#[test]
fn test_appends_visible_through_other_handles() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let id = log.append(32).unwrap().id();
    let writer = log.read(id).unwrap();
    let reader = log.read(id).unwrap();

    writer
        .append(3, |buf| {
            buf.copy_from_slice(b"one");
            Ok(())
        })
        .unwrap();

    assert_eq!(&reader.read().unwrap()[..], b"one");
    assert_eq!(reader.remaining().unwrap(), 29);
}

#[test]
fn test_next_chunk_id_set_once() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let head = log.append_reserving_next_id(16).unwrap();
    let first = log.append(16).unwrap().id();
    let second = log.append(16).unwrap().id();

    assert!(head.has_next_chunk_id_field());
    assert_eq!(head.next_chunk_id().unwrap(), None);

    assert!(head.set_next_chunk_id(first).unwrap());
    assert!(!head.set_next_chunk_id(second).unwrap());
    assert_eq!(log.read(head.id()).unwrap().next_chunk_id().unwrap(), Some(first));
}

#[test]
fn test_next_chunk_id_without_field() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let chunk = log.append(16).unwrap();
    let other = log.append(16).unwrap().id();

    assert_eq!(chunk.next_chunk_id().unwrap(), None);
    assert!(matches!(
        chunk.set_next_chunk_id(other),
        Err(DurableError::Usage(_))
    ));
}

// =============================================================================
// Persistence and Recovery
// =============================================================================

#[test]
fn test_reopen_after_close() {
    let (_temp, path) = setup_temp_log();

    let (ids, generation, frontier) = {
        let log = open(&path);
        let ids: Vec<ChunkId> = (0..10)
            .map(|i| log.append_fixed(format!("record-{}", i).as_bytes(), false).unwrap().id())
            .collect();
        let appendable = log.append(64).unwrap();
        appendable
            .append(5, |buf| {
                buf.copy_from_slice(b"tail!");
                Ok(())
            })
            .unwrap();
        log.close().unwrap();
        (ids, log.generation(), log.frontier())
    };

    let log = open(&path);
    assert!(!log.was_recovery_needed());
    assert_eq!(log.generation(), generation);
    assert_eq!(log.frontier(), frontier);
    assert_eq!(log.chunks_count(), 11);

    for (i, id) in ids.iter().enumerate() {
        let payload = log.read(*id).unwrap().read().unwrap();
        assert_eq!(&payload[..], format!("record-{}", i).as_bytes());
    }
}

#[test]
fn test_data_version_persists() {
    let (_temp, path) = setup_temp_log();
    {
        let log = open(&path);
        assert_eq!(log.data_version(), 0);
        log.set_data_version(7).unwrap();
        log.close().unwrap();
    }
    let log = open(&path);
    assert_eq!(log.data_version(), 7);
}

#[test]
fn test_drop_without_close_keeps_written_chunks() {
    let (_temp, path) = setup_temp_log();

    let frontier = {
        let log = open(&path);
        for i in 0..5 {
            log.append_fixed(format!("v{}", i).as_bytes(), false).unwrap();
        }
        log.frontier()
        // Dropped without close
    };

    let log = open(&path);
    let recovery = log.recovery().expect("unclean shutdown must trigger recovery");
    assert_eq!(recovery.recovered_frontier, frontier);
    assert_eq!(recovery.discarded_bytes, 0);
    assert_eq!(recovery.chunks, 5);
    assert_eq!(log.chunks_count(), 5);
}

#[test]
fn test_garbage_tail_is_discarded() {
    let (_temp, path) = setup_temp_log();

    let (frontier, last) = {
        let log = open(&path);
        log.append_fixed(b"first", false).unwrap();
        let last = log.append_fixed(b"second", false).unwrap().id();
        (log.frontier(), last)
    };

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB; 40]).unwrap();
    drop(file);
    assert_eq!(file_len(&path), frontier + 40);

    let log = open(&path);
    let recovery = log.recovery().unwrap();
    assert_eq!(recovery.discarded_bytes, 40);
    assert_eq!(log.frontier(), frontier);
    assert_eq!(file_len(&path), frontier);
    assert_eq!(&log.read(last).unwrap().read().unwrap()[..], b"second");
}

#[test]
fn test_torn_last_chunk_is_cut() {
    let (_temp, path) = setup_temp_log();

    let (first, second) = {
        let log = open(&path);
        let first = log.append_fixed(b"complete", false).unwrap();
        let second = log.append_fixed(&[9u8; 100], false).unwrap();
        (first.id(), (second.id(), second.offset()))
    };

    // Simulate a crash half way through the second chunk
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(second.1 + 50).unwrap();
    drop(file);

    let log = open(&path);
    assert!(log.was_recovery_needed());
    assert_eq!(log.chunks_count(), 1);
    assert_eq!(log.frontier(), second.1);
    assert_eq!(&log.read(first).unwrap().read().unwrap()[..], b"complete");
    assert!(log.read(second.0).unwrap_err().is_corruption());
}

#[test]
fn test_link_into_torn_tail_is_reset() {
    let (_temp, path) = setup_temp_log();

    let (head, linked, kept, tail_offset) = {
        let log = open(&path);
        let head = log.append_reserving_next_id(32).unwrap();
        let linked = log.append_reserving_next_id(32).unwrap();
        let kept = log.append_fixed(b"kept", false).unwrap();
        assert!(linked.set_next_chunk_id(kept.id()).unwrap());

        let tail = log.append_reserving_next_id(64).unwrap();
        assert!(tail.append(4, |buf| {
            buf.copy_from_slice(b"tail");
            Ok(())
        })
        .unwrap());
        assert!(head.set_next_chunk_id(tail.id()).unwrap());
        (head.id(), linked.id(), kept.id(), tail.offset())
    };

    // The link reached the disk, the chunk it points at did not
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(tail_offset + 10).unwrap();
    drop(file);

    let log = open(&path);
    let recovery = log.recovery().unwrap();
    assert_eq!(recovery.recovered_frontier, tail_offset);
    assert_eq!(recovery.cleared_links, 1);
    assert_eq!(log.read(head).unwrap().next_chunk_id().unwrap(), None);
    assert_eq!(log.read(linked).unwrap().next_chunk_id().unwrap(), Some(kept));

    // The offset is reused; the old link must not resolve to the new chunk
    let reused = log.append_fixed(b"other", false).unwrap();
    assert_eq!(reused.offset(), tail_offset);
    let reused = reused.id();
    let head_chunk = log.read(head).unwrap();
    assert_eq!(head_chunk.next_chunk_id().unwrap(), None);
    assert!(head_chunk.set_next_chunk_id(reused).unwrap());
}

#[test]
fn test_truncate_at_resets_links_into_discarded_region() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let head = log.append_reserving_next_id(16).unwrap().id();
    let kept = log.append_fixed(b"kept", false).unwrap().id();
    let cut = log.frontier();
    let dropped = log.append_reserving_next_id(16).unwrap().id();
    assert!(log.read(head).unwrap().set_next_chunk_id(dropped).unwrap());

    log.truncate_at(cut).unwrap();

    assert_eq!(log.frontier(), cut);
    assert_eq!(log.chunks_count(), 2);
    assert_eq!(log.read(head).unwrap().next_chunk_id().unwrap(), None);
    assert_eq!(&log.read(kept).unwrap().read().unwrap()[..], b"kept");
}

#[test]
fn test_clean_close_ignores_bytes_past_frontier() {
    let (_temp, path) = setup_temp_log();

    let frontier = {
        let log = open(&path);
        log.append_fixed(b"kept", false).unwrap();
        log.close().unwrap();
        log.frontier()
    };

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0u8; 24]).unwrap();
    drop(file);

    let log = open(&path);
    assert!(!log.was_recovery_needed());
    assert_eq!(log.frontier(), frontier);
    assert_eq!(file_len(&path), frontier);
}

#[test]
fn test_foreign_file_is_incompatible() {
    let (_temp, path) = setup_temp_log();
    std::fs::write(&path, vec![0x42u8; 128]).unwrap();

    assert!(matches!(
        ChunkedLog::open(&path, SyncStrategy::Manual),
        Err(DurableError::IncompatibleFormat(_))
    ));
}

// =============================================================================
// Corruption Detection
// =============================================================================

#[test]
fn test_out_of_range_id_is_corruption() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);
    log.append_fixed(b"only", false).unwrap();

    let bogus = ChunkId::new(1_000_000).unwrap();
    assert!(matches!(log.read(bogus), Err(DurableError::LogCorruption(_))));
}

#[test]
fn test_id_inside_payload_is_corruption() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let chunk = log.append_fixed(&[0u8; 256], false).unwrap();
    log.append_fixed(b"after", false).unwrap();

    // Points into the zero-filled payload of the first chunk
    let inside = ChunkId::new(chunk.id().get() + 4).unwrap();
    assert!(log.read(inside).unwrap_err().is_corruption());
}

#[test]
fn test_damaged_payload_detected() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    log.append_fixed(b"intact", false).unwrap();
    let damaged = log.append_fixed(b"will be damaged", false).unwrap();
    let (damaged_id, damaged_offset) = (damaged.id(), damaged.offset());
    log.flush().unwrap();

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(damaged_offset + 16)).unwrap();
    file.write_all(b"W").unwrap();
    drop(file);

    assert!(matches!(
        log.read(damaged_id).unwrap().read(),
        Err(DurableError::LogCorruption(_))
    ));

    let outcome = log.scan_from(LOG_HEADER_SIZE, |_| Ok(true)).unwrap();
    assert_eq!(outcome.chunks_visited, 1);
    assert_eq!(outcome.torn.unwrap().offset, damaged_offset);
}

// =============================================================================
// Scans
// =============================================================================

#[test]
fn test_for_each_chunk_in_order() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let ids: Vec<ChunkId> = (0..20u8)
        .map(|i| log.append_fixed(&[i], false).unwrap().id())
        .collect();

    let mut seen = Vec::new();
    let completed = log
        .for_each_chunk(|chunk| {
            seen.push(chunk.id());
            Ok(true)
        })
        .unwrap();
    assert!(completed);
    assert_eq!(seen, ids);

    let mut visited = 0;
    let completed = log
        .for_each_chunk(|_| {
            visited += 1;
            Ok(visited < 5)
        })
        .unwrap();
    assert!(!completed);
    assert_eq!(visited, 5);
}

#[test]
fn test_scan_from_middle() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    log.append_fixed(b"a", false).unwrap();
    let start = log.frontier();
    log.append_fixed(b"b", false).unwrap();
    log.append_fixed(b"c", false).unwrap();

    let mut payloads = Vec::new();
    let outcome = log
        .scan_from(start, |chunk| {
            payloads.push(chunk.read()?.to_vec());
            Ok(true)
        })
        .unwrap();

    assert_eq!(payloads, vec![b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(outcome.end_offset, log.frontier());
    assert!(outcome.torn.is_none());

    // Not a chunk boundary
    assert!(matches!(
        log.scan_from(start + 3, |_| Ok(true)),
        Err(DurableError::Usage(_))
    ));
}

// =============================================================================
// Lifecycle and Concurrency
// =============================================================================

#[test]
fn test_closed_log_rejects_operations() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);
    let id = log.append_fixed(b"x", false).unwrap().id();

    log.close().unwrap();
    log.close().unwrap();

    assert!(log.is_closed());
    assert!(matches!(log.append_fixed(b"y", false), Err(DurableError::Closed)));
    assert!(matches!(log.read(id), Err(DurableError::Closed)));
}

#[test]
fn test_sync_every_write() {
    let (_temp, path) = setup_temp_log();
    let log = ChunkedLog::open(&path, SyncStrategy::EveryWrite).unwrap();
    let id = log.append_fixed(b"durable", false).unwrap().id();
    assert_eq!(&log.read(id).unwrap().read().unwrap()[..], b"durable");
}

#[test]
fn test_concurrent_allocation() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let ids = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = &log;
                scope.spawn(move |_| {
                    (0..100)
                        .map(|i| {
                            let payload = format!("t{}-{}", t, i);
                            (log.append_fixed(payload.as_bytes(), false).unwrap().id(), payload)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    assert_eq!(log.chunks_count(), 400);
    for (id, payload) in &ids {
        assert_eq!(&log.read(*id).unwrap().read().unwrap()[..], payload.as_bytes());
    }
}

#[test]
fn test_concurrent_appends_to_distinct_chunks() {
    let (_temp, path) = setup_temp_log();
    let log = open(&path);

    let chunk_ids: Vec<ChunkId> = (0..4).map(|_| log.append(400).unwrap().id()).collect();

    crossbeam::scope(|scope| {
        for id in &chunk_ids {
            let log = &log;
            scope.spawn(move |_| {
                let chunk = log.read(*id).unwrap();
                for _ in 0..100 {
                    assert!(chunk
                        .append(4, |buf| {
                            buf.copy_from_slice(b"1234");
                            Ok(())
                        })
                        .unwrap());
                }
            });
        }
    })
    .unwrap();

    for id in chunk_ids {
        let chunk = log.read(id).unwrap();
        assert!(chunk.is_full().unwrap());
        assert_eq!(chunk.read().unwrap().len(), 400);
    }
}
