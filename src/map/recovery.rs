//! Index recovery
//!
//! Decides on open whether the index can be trusted, and rebuilds or catches
//! it up by replaying the log.
//!
//! Replay rules:
//! - chunks are applied in log order, so a later record for a key overrides
//!   an earlier one
//! - a `Remove` record drops the key's entry
//! - continuation chunks of appendable values are reached through their head
//!   and are not indexed
//! - a full rebuild stops at the first torn chunk and truncates the log there

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::descriptor::KeyDescriptor;
use super::record::Record;
use crate::error::{DurableError, Result};
use crate::index::ExtendibleHashIndex;
use crate::log::{ChunkId, ChunkedLog, LogRecovery, LOG_HEADER_SIZE};

/// Why the index was rebuilt from the whole log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// No index file existed
    Missing,
    /// The index file could not be read or has another format
    Unreadable,
    /// The previous owner modified the index and did not flush it
    NotProperlyClosed,
    /// The index describes another log (e.g. an interrupted compaction)
    GenerationMismatch,
    /// The index references log data that is no longer there
    AheadOfLog,
    /// The log lost its tail on open
    LogRecovered,
    /// Replaying only the tail of the log failed
    CatchUpFailed,
    /// Corruption met while serving an operation, or an explicit request
    Requested,
}

/// How the index was brought in line with the log when the map opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
    UpToDate,
    /// Chunks appended after the index was last flushed were replayed
    CaughtUp,
    Rebuilt(RebuildReason),
}

/// Counters from one log replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Offset the replay started from
    pub from_offset: u64,
    pub chunks_scanned: u64,
    /// Put and values-head records applied to the index
    pub entries_indexed: u64,
    /// Records for new keys the full index could not take
    pub entries_skipped: u64,
    pub removals_applied: u64,
    /// Offset the log was truncated at, if a torn chunk ended the replay
    pub truncated_at: Option<u64>,
}

/// Everything recovery did while a map was opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    pub index_action: IndexAction,
    pub log_recovery: Option<LogRecovery>,
    pub replay: Option<ReplayReport>,
    /// Leftover `.compacting` files deleted on open
    pub stale_files_removed: usize,
}

impl OpenReport {
    /// True when the index was usable as found on disk
    pub fn was_clean(&self) -> bool {
        self.index_action == IndexAction::UpToDate && self.log_recovery.is_none()
    }
}

/// Find the index entry whose stored key equals `key`
///
/// Every candidate chunk for `hash` is read and its record key compared with
/// the descriptor's equality.
pub(crate) fn locate<KD: KeyDescriptor>(
    log: &ChunkedLog,
    index: &ExtendibleHashIndex,
    key_descriptor: &KD,
    hash: u64,
    key: &KD::Item,
) -> Result<Option<ChunkId>> {
    index.lookup(hash, |candidate| {
        let payload = log.read(candidate)?.read()?;
        match Record::decode(&payload)?.and_then(|record| record.key()) {
            Some(stored) => Ok(key_descriptor.equal(&key_descriptor.from_bytes(stored)?, key)),
            None => Ok(false),
        }
    })
}

/// Open the index next to `log`, rebuilding or catching it up as needed
pub(crate) fn prepare_index<KD: KeyDescriptor>(
    log: &ChunkedLog,
    index_path: &Path,
    segment_size: usize,
    key_descriptor: &KD,
) -> Result<(ExtendibleHashIndex, IndexAction, Option<ReplayReport>)> {
    let opened = if index_path.exists() {
        match ExtendibleHashIndex::open(index_path, segment_size) {
            Ok(index) => Ok(index),
            Err(e) if e.is_corruption() || matches!(e, DurableError::IncompatibleFormat(_)) => {
                warn!(path = %index_path.display(), error = %e, "Discarding unusable index");
                fs::remove_file(index_path)?;
                Err(RebuildReason::Unreadable)
            }
            Err(e) => return Err(e),
        }
    } else {
        Err(RebuildReason::Missing)
    };

    let (mut index, action) = match opened {
        Ok(index) => {
            let action = classify(log, &index);
            (index, action)
        }
        Err(reason) => (
            ExtendibleHashIndex::open(index_path, segment_size)?,
            IndexAction::Rebuilt(reason),
        ),
    };

    let never = AtomicBool::new(false);
    let (action, replay) = match action {
        IndexAction::UpToDate => (action, None),
        IndexAction::CaughtUp => {
            let (_, frontier) = index.log_binding();
            match replay(log, &mut index, key_descriptor, frontier, &never, false) {
                Ok(report) => (action, Some(report)),
                Err(e) if e.is_corruption() || matches!(e, DurableError::Usage(_)) => {
                    warn!(
                        path = %index_path.display(),
                        error = %e,
                        "Index catch-up failed, rebuilding from the whole log"
                    );
                    let report = rebuild(log, &mut index, key_descriptor, &never)?;
                    (IndexAction::Rebuilt(RebuildReason::CatchUpFailed), Some(report))
                }
                Err(e) => return Err(e),
            }
        }
        IndexAction::Rebuilt(reason) => {
            warn!(path = %index_path.display(), reason = ?reason, "Rebuilding index from log");
            (action, Some(rebuild(log, &mut index, key_descriptor, &never)?))
        }
    };

    if replay.is_some() {
        index.bind_to_log(log.generation(), log.frontier());
        index.flush()?;
    }
    Ok((index, action, replay))
}

fn classify(log: &ChunkedLog, index: &ExtendibleHashIndex) -> IndexAction {
    let (generation, frontier) = index.log_binding();
    if !index.was_properly_closed() {
        IndexAction::Rebuilt(RebuildReason::NotProperlyClosed)
    } else if log.was_recovery_needed() {
        IndexAction::Rebuilt(RebuildReason::LogRecovered)
    } else if generation != log.generation() {
        IndexAction::Rebuilt(RebuildReason::GenerationMismatch)
    } else if frontier > log.frontier() {
        IndexAction::Rebuilt(RebuildReason::AheadOfLog)
    } else if frontier < log.frontier() {
        IndexAction::CaughtUp
    } else {
        IndexAction::UpToDate
    }
}

/// Clear the index and replay the whole log into it
pub(crate) fn rebuild<KD: KeyDescriptor>(
    log: &ChunkedLog,
    index: &mut ExtendibleHashIndex,
    key_descriptor: &KD,
    cancel: &AtomicBool,
) -> Result<ReplayReport> {
    index.clear()?;
    let report = replay(log, index, key_descriptor, LOG_HEADER_SIZE, cancel, true)?;
    info!(
        path = %log.path().display(),
        chunks = report.chunks_scanned,
        entries = index.len(),
        skipped = report.entries_skipped,
        truncated_at = ?report.truncated_at,
        "Rebuilt index from log"
    );
    Ok(report)
}

/// Apply every chunk from `from` to the index
///
/// With `truncate_torn` a torn chunk cuts the log; otherwise it is reported
/// as `LogCorruption`, since the caller cannot tell a torn chunk from a bad
/// starting offset.
fn replay<KD: KeyDescriptor>(
    log: &ChunkedLog,
    index: &mut ExtendibleHashIndex,
    key_descriptor: &KD,
    from: u64,
    cancel: &AtomicBool,
    truncate_torn: bool,
) -> Result<ReplayReport> {
    let mut report = ReplayReport {
        from_offset: from,
        ..ReplayReport::default()
    };

    let outcome = log.scan_from(from, |chunk| {
        if cancel.load(Ordering::Acquire) {
            return Err(DurableError::Cancelled);
        }
        report.chunks_scanned += 1;

        let payload = chunk.read()?;
        if let Some(record) = Record::decode(&payload)? {
            apply(log, index, key_descriptor, chunk.id(), record, &mut report)?;
        }
        Ok(true)
    })?;

    if let Some(torn) = outcome.torn {
        if !truncate_torn {
            return Err(DurableError::LogCorruption(format!(
                "[{}] replay from offset {} met an invalid chunk: {}",
                log.path().display(),
                from,
                torn.reason
            )));
        }
        warn!(
            path = %log.path().display(),
            offset = torn.offset,
            reason = %torn.reason,
            "Replay stopped at torn chunk"
        );
        log.truncate_at(torn.offset)?;
        report.truncated_at = Some(torn.offset);
    }
    Ok(report)
}

fn apply<KD: KeyDescriptor>(
    log: &ChunkedLog,
    index: &mut ExtendibleHashIndex,
    key_descriptor: &KD,
    chunk_id: ChunkId,
    record: Record<'_>,
    report: &mut ReplayReport,
) -> Result<()> {
    match record {
        Record::Put { key, .. } | Record::ValuesHead { key, .. } => {
            let key = key_descriptor.from_bytes(key)?;
            let hash = key_descriptor.hash(&key);
            match locate(log, index, key_descriptor, hash, &key)? {
                Some(previous) => {
                    index.replace(hash, previous, chunk_id)?;
                }
                None => match index.insert(hash, chunk_id) {
                    Ok(_) => {}
                    Err(DurableError::CapacityExceeded(reason)) => {
                        warn!(
                            path = %log.path().display(),
                            chunk_id = %chunk_id,
                            reason = %reason,
                            "Skipped record the index has no room for"
                        );
                        report.entries_skipped += 1;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            }
            report.entries_indexed += 1;
        }
        Record::Remove { key } => {
            let key = key_descriptor.from_bytes(key)?;
            let hash = key_descriptor.hash(&key);
            if let Some(previous) = locate(log, index, key_descriptor, hash, &key)? {
                index.remove_value(hash, previous)?;
            }
            report.removals_applied += 1;
        }
        Record::ValuesTail { .. } => {}
    }
    Ok(())
}
