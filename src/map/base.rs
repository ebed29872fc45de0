//! State shared by both map kinds
//!
//! `MapCore` owns the files of one map (lock, log, index) and implements
//! everything that does not depend on how values are stored: opening with
//! recovery, lifecycle state, key lookup, flush/close and the compaction
//! file swap.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::descriptor::KeyDescriptor;
use super::recovery::{self, OpenReport, ReplayReport};
use crate::config::{Config, SyncStrategy};
use crate::error::{DurableError, Result};
use crate::factory::MapPaths;
use crate::index::{ExtendibleHashIndex, IndexStats};
use crate::lock::FileLock;
use crate::log::{ChunkId, ChunkedLog};

/// Lifecycle state of a map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Open,
    /// The index is being rebuilt, or a rebuild was cancelled and must be
    /// redone before the next operation
    Recovering,
    Closed,
}

pub(crate) struct MapCore<KD> {
    pub paths: MapPaths,
    pub config: Config,
    pub key_descriptor: KD,
    pub log: ChunkedLog,
    pub index: RwLock<ExtendibleHashIndex>,
    /// Serializes mutations
    pub write_lock: Mutex<()>,
    state: Mutex<MapState>,
    /// Index rebuilds started since open; chunk ids cached across a rebuild
    /// may point into a truncated log
    rebuilds: AtomicU64,
    lock: FileLock,
    open_report: OpenReport,
    kind: &'static str,
    format: u32,
}

impl<KD: KeyDescriptor> MapCore<KD> {
    /// Open the map files owned through `lock`
    ///
    /// `format` is the record format stored as the log's data version; a log
    /// written by the other map kind is rejected.
    pub fn open(
        paths: MapPaths,
        config: Config,
        key_descriptor: KD,
        lock: FileLock,
        kind: &'static str,
        format: u32,
    ) -> Result<Self> {
        let stale_files_removed = paths.remove_compaction_files()?;
        if stale_files_removed > 0 {
            warn!(
                path = %paths.log.display(),
                files = stale_files_removed,
                "Removed leftovers of an interrupted compaction"
            );
        }

        let log = ChunkedLog::open(&paths.log, config.sync_strategy)?;
        match log.data_version() {
            0 if log.is_empty() => log.set_data_version(format)?,
            version if version == format => {}
            version => {
                log.close()?;
                return Err(DurableError::IncompatibleFormat(format!(
                    "[{}] holds records of format {}, a {} needs format {}",
                    paths.log.display(),
                    version,
                    kind,
                    format
                )));
            }
        }

        let (index, index_action, replay) = recovery::prepare_index(
            &log,
            &paths.index,
            config.index_segment_size,
            &key_descriptor,
        )?;

        let open_report = OpenReport {
            index_action,
            log_recovery: log.recovery().cloned(),
            replay,
            stale_files_removed,
        };
        info!(
            path = %paths.log.display(),
            kind,
            entries = index.len(),
            index_action = ?open_report.index_action,
            "Opened map"
        );

        Ok(Self {
            paths,
            config,
            key_descriptor,
            log,
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
            state: Mutex::new(MapState::Open),
            rebuilds: AtomicU64::new(0),
            lock,
            open_report,
            kind,
            format,
        })
    }

    pub fn state(&self) -> MapState {
        *self.state.lock()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Acquire)
    }

    pub fn open_report(&self) -> &OpenReport {
        &self.open_report
    }

    /// Fail on a closed map; finish an abandoned rebuild first
    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            MapState::Open => Ok(()),
            MapState::Closed => Err(DurableError::Closed),
            MapState::Recovering => self.recover().map(|_| ()),
        }
    }

    /// Run `op`; on corruption rebuild the index and run it once more
    pub fn with_recovery<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        match op() {
            Err(e) if e.is_corruption() => {
                warn!(path = %self.paths.log.display(), error = %e, "Corruption while serving request");
                self.recover()?;
                op()
            }
            result => result,
        }
    }

    /// Rebuild the index from the whole log
    pub fn recover(&self) -> Result<ReplayReport> {
        self.rebuild_index(&AtomicBool::new(false))
    }

    /// Rebuild the index from the whole log, checking `cancel` between chunks
    ///
    /// A cancelled rebuild leaves the map `Recovering`; the next operation
    /// rebuilds again.
    pub fn rebuild_index(&self, cancel: &AtomicBool) -> Result<ReplayReport> {
        {
            let mut state = self.state.lock();
            if *state == MapState::Closed {
                return Err(DurableError::Closed);
            }
            *state = MapState::Recovering;
        }

        let (report, entries) = {
            let mut index = self.index.write();
            self.rebuilds.fetch_add(1, Ordering::AcqRel);
            let report = recovery::rebuild(&self.log, &mut index, &self.key_descriptor, cancel)?;
            index.bind_to_log(self.log.generation(), self.log.frontier());
            index.flush()?;
            (report, index.len())
        };

        *self.state.lock() = MapState::Open;
        info!(path = %self.paths.log.display(), entries, "Index rebuilt");
        Ok(report)
    }

    /// Encoded form of a key, as stored in records
    pub fn encode_key(&self, key: &KD::Item) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.key_descriptor.to_bytes(key, &mut bytes)?;
        Ok(bytes)
    }

    pub fn locate(&self, index: &ExtendibleHashIndex, key: &KD::Item) -> Result<Option<ChunkId>> {
        let hash = self.key_descriptor.hash(key);
        recovery::locate(&self.log, index, &self.key_descriptor, hash, key)
    }

    pub fn len(&self) -> usize {
        self.index.read().len() as usize
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.read().stats()
    }

    /// Every live `(hash, chunk id)`, in log order
    pub fn live_entries(&self) -> Result<Vec<(u64, ChunkId)>> {
        let mut entries = Vec::new();
        self.index.read().for_each(|hash, id| {
            entries.push((hash, id));
            Ok(true)
        })?;
        entries.sort_by_key(|(_, id)| *id);
        Ok(entries)
    }

    /// Sync the log, then persist the index bound to the synced frontier
    pub fn flush(&self) -> Result<()> {
        self.ensure_ready()?;
        let mut index = self.index.write();
        self.log.flush()?;
        index.bind_to_log(self.log.generation(), self.log.frontier());
        index.flush()
    }

    /// Flush and release the files; later operations fail with `Closed`
    pub fn close(&self) -> Result<()> {
        let _write = self.write_lock.lock();
        match self.state() {
            MapState::Closed => return Ok(()),
            MapState::Recovering => {
                self.recover()?;
            }
            MapState::Open => {}
        }
        let mut index = self.index.write();

        self.log.flush()?;
        index.bind_to_log(self.log.generation(), self.log.frontier());
        index.close()?;
        self.log.close()?;
        *self.state.lock() = MapState::Closed;

        info!(path = %self.paths.log.display(), kind = self.kind, "Closed map");
        Ok(())
    }

    /// Fresh log and index at the compaction paths
    pub fn create_compaction_target(&self) -> Result<(ChunkedLog, ExtendibleHashIndex)> {
        self.paths.remove_compaction_files()?;
        let log = ChunkedLog::open(&self.paths.compacting_log, SyncStrategy::Manual)?;
        log.set_data_version(self.format)?;
        let index =
            ExtendibleHashIndex::open(&self.paths.compacting_index, self.config.index_segment_size)?;
        Ok((log, index))
    }

    /// Seal a finished compaction target
    pub fn finish_compaction_target(log: ChunkedLog, mut index: ExtendibleHashIndex) -> Result<()> {
        log.flush()?;
        index.bind_to_log(log.generation(), log.frontier());
        index.close()?;
        log.close()
    }

    /// Drop a cancelled compaction target
    pub fn discard_compaction_target(&self, log: ChunkedLog, index: ExtendibleHashIndex) -> Result<()> {
        drop(log);
        drop(index);
        self.paths.remove_compaction_files()?;
        info!(path = %self.paths.log.display(), "Compaction cancelled");
        Ok(())
    }

    /// Close this map, move the compacted files over its own and reopen
    ///
    /// The log is renamed before the index. A crash in between leaves a
    /// new-generation log next to an old-generation index, which the next
    /// open rebuilds.
    pub fn install_compacted(self) -> Result<Self> {
        let before = self.log.frontier();
        self.close()?;

        let MapCore {
            paths,
            config,
            key_descriptor,
            log,
            index,
            lock,
            kind,
            format,
            ..
        } = self;
        drop(log);
        drop(index);

        fs::rename(&paths.compacting_log, &paths.log)?;
        fs::rename(&paths.compacting_index, &paths.index)?;

        let reopened = Self::open(paths, config, key_descriptor, lock, kind, format)?;
        info!(
            path = %reopened.paths.log.display(),
            before,
            after = reopened.log.frontier(),
            index_action = ?reopened.open_report.index_action,
            "Compaction installed"
        );
        Ok(reopened)
    }
}
