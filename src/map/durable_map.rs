//! Durable key/value map
//!
//! Each `put` appends one fixed chunk holding a `Put` record and points the
//! key's index entry at it; `remove` appends a `Remove` record before
//! dropping the entry. The log therefore always holds enough to rebuild the
//! index.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::base::{MapCore, MapState};
use super::descriptor::{DataDescriptor, KeyDescriptor};
use super::record::{encode_put, encode_remove, Record, PLAIN_MAP_FORMAT};
use super::recovery::{OpenReport, ReplayReport};
use crate::config::Config;
use crate::error::{DurableError, Result};
use crate::factory::MapPaths;
use crate::index::{ExtendibleHashIndex, IndexStats};
use crate::lock::FileLock;
use crate::log::{ChunkId, ChunkedLog};

/// Result of a compaction that may be cancelled
///
/// Both variants hand the map back: a cancelled compaction leaves the
/// original files untouched.
#[derive(Debug)]
pub enum CompactionOutcome<M> {
    Compacted(M),
    Cancelled(M),
}

impl<M> CompactionOutcome<M> {
    pub fn into_inner(self) -> M {
        match self {
            CompactionOutcome::Compacted(map) | CompactionOutcome::Cancelled(map) => map,
        }
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, CompactionOutcome::Compacted(_))
    }
}

/// Crash-resilient map from `KD::Item` to `VD::Item`
///
/// Reads run concurrently; mutations are serialized. Dropping the map without
/// `close()` is treated like a crash: the next open recovers from the log.
pub struct DurableMap<KD: KeyDescriptor, VD: DataDescriptor> {
    core: MapCore<KD>,
    value_descriptor: VD,
}

impl<KD: KeyDescriptor, VD: DataDescriptor> DurableMap<KD, VD> {
    /// Open or create the map whose files are `{path}.log`, `{path}.hash`
    /// and `{path}.lock`, with the default configuration
    pub fn open(path: impl AsRef<Path>, key_descriptor: KD, value_descriptor: VD) -> Result<Self> {
        Self::open_with(
            MapPaths::from_base(path.as_ref()),
            Config::default(),
            key_descriptor,
            value_descriptor,
        )
    }

    pub(crate) fn open_with(
        paths: MapPaths,
        config: Config,
        key_descriptor: KD,
        value_descriptor: VD,
    ) -> Result<Self> {
        config.validate()?;
        let lock = FileLock::acquire(&paths.lock)?;
        let core = MapCore::open(
            paths,
            config,
            key_descriptor,
            lock,
            "durable map",
            PLAIN_MAP_FORMAT,
        )?;
        Ok(Self {
            core,
            value_descriptor,
        })
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Insert or overwrite the value for `key`
    pub fn put(&self, key: &KD::Item, value: &VD::Item) -> Result<()> {
        self.core.ensure_ready()?;
        let key_bytes = self.core.encode_key(key)?;
        let mut value_bytes = Vec::new();
        self.value_descriptor.to_bytes(value, &mut value_bytes)?;
        let record = encode_put(&key_bytes, &value_bytes);

        let _write = self.core.write_lock.lock();
        self.core.with_recovery(|| {
            let mut index = self.core.index.write();
            let hash = self.core.key_descriptor.hash(key);
            let previous = self.core.locate(&index, key)?;
            if previous.is_none() {
                // A record the index cannot take must not reach the log
                index.reserve(hash)?;
            }
            let chunk_id = self.core.log.append_fixed(&record, false)?.id();

            match previous {
                Some(previous) => {
                    index.replace(hash, previous, chunk_id)?;
                }
                None => {
                    index.insert(hash, chunk_id)?;
                }
            }
            Ok(())
        })
    }

    /// Current value for `key`
    pub fn get(&self, key: &KD::Item) -> Result<Option<VD::Item>> {
        self.core.ensure_ready()?;
        self.core.with_recovery(|| {
            let index = self.core.index.read();
            let mut found = None;
            let hash = self.core.key_descriptor.hash(key);
            index.lookup(hash, |candidate| {
                let payload = self.core.log.read(candidate)?.read()?;
                match Record::decode(&payload)? {
                    Some(Record::Put { key: stored, value }) => {
                        let stored = self.core.key_descriptor.from_bytes(stored)?;
                        if !self.core.key_descriptor.equal(&stored, key) {
                            return Ok(false);
                        }
                        found = Some(self.value_descriptor.from_bytes(value)?);
                        Ok(true)
                    }
                    _ => Err(not_a_put(candidate)),
                }
            })?;
            Ok(found)
        })
    }

    /// Remove `key`; returns whether it was present
    pub fn remove(&self, key: &KD::Item) -> Result<bool> {
        self.core.ensure_ready()?;
        let record = encode_remove(&self.core.encode_key(key)?);

        let _write = self.core.write_lock.lock();
        self.core.with_recovery(|| {
            let mut index = self.core.index.write();
            let Some(previous) = self.core.locate(&index, key)? else {
                return Ok(false);
            };
            self.core.log.append_fixed(&record, false)?;
            index.remove_value(self.core.key_descriptor.hash(key), previous)?;
            Ok(true)
        })
    }

    pub fn contains_key(&self, key: &KD::Item) -> Result<bool> {
        self.core.ensure_ready()?;
        self.core.with_recovery(|| {
            let index = self.core.index.read();
            Ok(self.core.locate(&index, key)?.is_some())
        })
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live entry in log order
    ///
    /// Returns `Ok(false)` if the visitor stopped early. The visitor may call
    /// back into the map; entries written meanwhile may or may not be seen.
    pub fn for_each_entry<F>(&self, mut visitor: F) -> Result<bool>
    where
        F: FnMut(KD::Item, VD::Item) -> Result<bool>,
    {
        self.core.ensure_ready()?;
        for (_, chunk_id) in self.core.live_entries()? {
            let payload = self.core.log.read(chunk_id)?.read()?;
            let Some(Record::Put { key, value }) = Record::decode(&payload)? else {
                return Err(not_a_put(chunk_id));
            };
            let key = self.core.key_descriptor.from_bytes(key)?;
            let value = self.value_descriptor.from_bytes(value)?;
            if !visitor(key, value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Make every acknowledged write durable
    pub fn flush(&self) -> Result<()> {
        self.core.flush()
    }

    /// Flush and release the files; idempotent
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn state(&self) -> MapState {
        self.core.state()
    }

    /// What recovery did when the map was opened
    pub fn open_report(&self) -> &OpenReport {
        self.core.open_report()
    }

    pub fn index_stats(&self) -> IndexStats {
        self.core.index_stats()
    }

    pub fn paths(&self) -> &MapPaths {
        &self.core.paths
    }

    /// Bytes allocated in the log, header included
    pub fn log_size(&self) -> u64 {
        self.core.log.frontier()
    }

    /// Rebuild the index from the log
    pub fn rebuild_index(&self, cancel: &AtomicBool) -> Result<ReplayReport> {
        let _write = self.core.write_lock.lock();
        self.core.rebuild_index(cancel)
    }

    /// Rewrite the log keeping only live records
    pub fn compact(self) -> Result<Self> {
        Ok(self.compact_cancellable(&AtomicBool::new(false))?.into_inner())
    }

    /// Rewrite the log keeping only live records, checking `cancel` between
    /// chunks
    ///
    /// On error the map is gone; reopen it to continue.
    pub fn compact_cancellable(self, cancel: &AtomicBool) -> Result<CompactionOutcome<Self>> {
        self.core.ensure_ready()?;
        let (log, mut index) = self.core.create_compaction_target()?;

        if !self.copy_live(&log, &mut index, cancel)? {
            self.core.discard_compaction_target(log, index)?;
            return Ok(CompactionOutcome::Cancelled(self));
        }
        MapCore::<KD>::finish_compaction_target(log, index)?;

        let DurableMap {
            core,
            value_descriptor,
        } = self;
        Ok(CompactionOutcome::Compacted(Self {
            core: core.install_compacted()?,
            value_descriptor,
        }))
    }

    /// Copy every live `Put` chunk; `Ok(false)` if cancelled
    fn copy_live(
        &self,
        target: &ChunkedLog,
        target_index: &mut ExtendibleHashIndex,
        cancel: &AtomicBool,
    ) -> Result<bool> {
        let live = self.core.live_entries()?;
        for (hash, chunk_id) in &live {
            if cancel.load(Ordering::Acquire) {
                return Ok(false);
            }
            let payload = self.core.log.read(*chunk_id)?.read()?;
            let copied = target.append_fixed(&payload, false)?.id();
            target_index.insert(*hash, copied)?;
        }
        debug!(
            path = %self.core.paths.log.display(),
            records = live.len(),
            "Copied live records"
        );
        Ok(true)
    }
}

fn not_a_put(chunk_id: ChunkId) -> DurableError {
    DurableError::IndexCorruption(format!("chunk {} does not hold a put record", chunk_id))
}
