//! Appendable-values map
//!
//! Each key owns a chain of appendable chunks. The head chunk holds the key
//! followed by values; when it fills up, a larger continuation chunk is
//! allocated and linked from the previous one. Appending a value never
//! rewrites earlier ones.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use super::base::{MapCore, MapState};
use super::descriptor::{DataDescriptor, KeyDescriptor};
use super::durable_map::CompactionOutcome;
use super::record::{
    encode_remove, value_entries, value_entry_size, values_head_size, write_value_entry,
    write_values_head, write_values_tail, Record, VALUES_MAP_FORMAT, VALUES_TAIL_SIZE,
};
use super::recovery::{OpenReport, ReplayReport};
use crate::config::{Config, ValueRetention};
use crate::error::{DurableError, Result};
use crate::factory::MapPaths;
use crate::index::{ExtendibleHashIndex, IndexStats};
use crate::lock::FileLock;
use crate::log::{ChunkId, ChunkedLog, MAX_APPENDABLE_CAPACITY};

/// Map from a key to the ordered list of values appended for it
pub struct AppendableValuesMap<KD: KeyDescriptor, VD: DataDescriptor> {
    core: MapCore<KD>,
    value_descriptor: VD,
    tails: Mutex<TailCache>,
}

/// Head chunk id -> last chunk of its chain
///
/// Only valid for the index rebuild it was filled under: a rebuild may
/// truncate the log and the freed ids get reused.
#[derive(Default)]
struct TailCache {
    rebuilds: u64,
    tails: HashMap<ChunkId, ChunkId>,
}

impl<KD: KeyDescriptor, VD: DataDescriptor> AppendableValuesMap<KD, VD> {
    /// Open or create the map whose files start with `path`, with the
    /// default configuration
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
            "appendable values map",
            VALUES_MAP_FORMAT,
        )?;
        Ok(Self::from_core(core, value_descriptor))
    }

    fn from_core(core: MapCore<KD>, value_descriptor: VD) -> Self {
        Self {
            core,
            value_descriptor,
            tails: Mutex::new(TailCache::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Append `value` to the values of `key`
    pub fn append(&self, key: &KD::Item, value: &VD::Item) -> Result<()> {
        self.core.ensure_ready()?;
        let key_bytes = self.core.encode_key(key)?;
        let mut value_bytes = Vec::new();
        self.value_descriptor.to_bytes(value, &mut value_bytes)?;

        let _write = self.core.write_lock.lock();
        self.core.with_recovery(|| {
            let mut index = self.core.index.write();
            match self.core.locate(&index, key)? {
                None => {
                    let hash = self.core.key_descriptor.hash(key);
                    index.reserve(hash)?;
                    let head = write_head(
                        &self.core.log,
                        self.core.config.values_chunk_capacity,
                        &key_bytes,
                        &value_bytes,
                    )?;
                    index.insert(hash, head)?;
                    self.tails().insert(head, head);
                }
                Some(head) => {
                    let tail = self.tail_of(head)?;
                    let new_tail = append_to_chain(&self.core.log, tail, &value_bytes)?;
                    self.tails().insert(head, new_tail);
                }
            }
            Ok(())
        })
    }

    /// All values appended for `key`, oldest first; empty if the key is absent
    pub fn values(&self, key: &KD::Item) -> Result<Vec<VD::Item>> {
        self.core.ensure_ready()?;
        self.core.with_recovery(|| {
            let index = self.core.index.read();
            let Some(head) = self.core.locate(&index, key)? else {
                return Ok(Vec::new());
            };
            let mut values = Vec::new();
            walk_chain(&self.core.log, head, |value| {
                values.push(self.value_descriptor.from_bytes(value)?);
                Ok(())
            })?;
            Ok(values)
        })
    }

    /// Drop `key` and all its values; returns whether it was present
    pub fn remove(&self, key: &KD::Item) -> Result<bool> {
        self.core.ensure_ready()?;
        let record = encode_remove(&self.core.encode_key(key)?);

        let _write = self.core.write_lock.lock();
        self.core.with_recovery(|| {
            let mut index = self.core.index.write();
            let Some(head) = self.core.locate(&index, key)? else {
                return Ok(false);
            };
            self.core.log.append_fixed(&record, false)?;
            index.remove_value(self.core.key_descriptor.hash(key), head)?;
            self.tails().remove(&head);
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

    /// Number of keys with values
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every key; `Ok(false)` if the visitor stopped early
    pub fn for_each_key<F>(&self, mut visitor: F) -> Result<bool>
    where
        F: FnMut(KD::Item) -> Result<bool>,
    {
        self.core.ensure_ready()?;
        for (_, head) in self.core.live_entries()? {
            let payload = self.core.log.read(head)?.read()?;
            let Some(Record::ValuesHead { key, .. }) = Record::decode(&payload)? else {
                return Err(not_a_head(head));
            };
            if !visitor(self.core.key_descriptor.from_bytes(key)?)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Last chunk of the chain starting at `head`
    fn tail_of(&self, head: ChunkId) -> Result<ChunkId> {
        if let Some(tail) = self.tails().get(&head) {
            return Ok(*tail);
        }
        let mut tail = head;
        while let Some(next) = next_in_chain(&self.core.log, tail)? {
            tail = next;
        }
        self.tails().insert(head, tail);
        Ok(tail)
    }

    /// Cached chain tails, emptied if the index was rebuilt since they were
    /// recorded
    fn tails(&self) -> MappedMutexGuard<'_, HashMap<ChunkId, ChunkId>> {
        let mut cache = self.tails.lock();
        let rebuilds = self.core.rebuild_count();
        if cache.rebuilds != rebuilds {
            cache.tails.clear();
            cache.rebuilds = rebuilds;
        }
        MutexGuard::map(cache, |cache| &mut cache.tails)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn flush(&self) -> Result<()> {
        self.core.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn state(&self) -> MapState {
        self.core.state()
    }

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

    pub fn rebuild_index(&self, cancel: &AtomicBool) -> Result<ReplayReport> {
        let _write = self.core.write_lock.lock();
        self.core.rebuild_index(cancel)
    }

    /// Rewrite the log keeping the live keys, each in one chain packed as
    /// tightly as the chunk size limit allows
    ///
    /// `Config::value_retention` decides whether every value survives or only
    /// the most recent one.
    pub fn compact(self) -> Result<Self> {
        Ok(self.compact_cancellable(&AtomicBool::new(false))?.into_inner())
    }

    pub fn compact_cancellable(self, cancel: &AtomicBool) -> Result<CompactionOutcome<Self>> {
        self.core.ensure_ready()?;
        let (log, mut index) = self.core.create_compaction_target()?;

        if !self.copy_live(&log, &mut index, cancel)? {
            self.core.discard_compaction_target(log, index)?;
            return Ok(CompactionOutcome::Cancelled(self));
        }
        MapCore::<KD>::finish_compaction_target(log, index)?;

        let AppendableValuesMap {
            core,
            value_descriptor,
            ..
        } = self;
        Ok(CompactionOutcome::Compacted(Self::from_core(
            core.install_compacted()?,
            value_descriptor,
        )))
    }

    fn copy_live(
        &self,
        target: &ChunkedLog,
        target_index: &mut ExtendibleHashIndex,
        cancel: &AtomicBool,
    ) -> Result<bool> {
        let retention = self.core.config.value_retention;
        let live = self.core.live_entries()?;

        for (hash, head) in &live {
            if cancel.load(Ordering::Acquire) {
                return Ok(false);
            }
            let payload = self.core.log.read(*head)?.read()?;
            let Some(Record::ValuesHead { key, .. }) = Record::decode(&payload)? else {
                return Err(not_a_head(*head));
            };

            let mut values: Vec<Vec<u8>> = Vec::new();
            walk_chain(&self.core.log, *head, |value| {
                if retention == ValueRetention::LatestOnly {
                    values.clear();
                }
                values.push(value.to_vec());
                Ok(())
            })?;
            let Some((first, rest)) = values.split_first() else {
                continue;
            };

            let packed = values_head_size(key.len())
                + values.iter().map(|v| value_entry_size(v.len())).sum::<usize>();
            let capacity = packed
                .max(self.core.config.values_chunk_capacity)
                .min(MAX_APPENDABLE_CAPACITY);
            let new_head = write_head(target, capacity, key, first)?;
            let mut tail = new_head;
            for value in rest {
                tail = append_to_chain(target, tail, value)?;
            }
            target_index.insert(*hash, new_head)?;
        }

        debug!(
            path = %self.core.paths.log.display(),
            keys = live.len(),
            retention = ?retention,
            "Copied live value chains"
        );
        Ok(true)
    }
}

// =============================================================================
// Chain Primitives
// =============================================================================

/// Allocate a head chunk holding the key and its first value
fn write_head(log: &ChunkedLog, capacity: usize, key: &[u8], value: &[u8]) -> Result<ChunkId> {
    let needed = values_head_size(key.len()) + value_entry_size(value.len());
    let capacity = capacity.max(needed);
    if capacity > MAX_APPENDABLE_CAPACITY {
        return Err(DurableError::CapacityExceeded(format!(
            "key and first value need {} bytes, a chunk holds at most {}",
            needed, MAX_APPENDABLE_CAPACITY
        )));
    }

    let head = log.append_reserving_next_id(capacity)?;
    let written = head.append(needed, |buf| {
        let at = write_values_head(buf, key);
        write_value_entry(&mut buf[at..], value);
        Ok(())
    })?;
    if !written {
        return Err(DurableError::LogCorruption(format!(
            "new head chunk {} refused its first value",
            head.id()
        )));
    }
    Ok(head.id())
}

/// Append a value at the end of a chain; returns the chain's new tail
fn append_to_chain(log: &ChunkedLog, tail: ChunkId, value: &[u8]) -> Result<ChunkId> {
    let entry = value_entry_size(value.len());
    let tail_chunk = log.read(tail)?;
    if tail_chunk.append(entry, |buf| {
        write_value_entry(buf, value);
        Ok(())
    })? {
        return Ok(tail);
    }

    let needed = VALUES_TAIL_SIZE + entry;
    if needed > MAX_APPENDABLE_CAPACITY {
        return Err(DurableError::CapacityExceeded(format!(
            "value needs {} bytes, a chunk holds at most {}",
            needed, MAX_APPENDABLE_CAPACITY
        )));
    }
    let capacity = (tail_chunk.capacity() * 2)
        .max(needed)
        .min(MAX_APPENDABLE_CAPACITY);

    let next = log.append_reserving_next_id(capacity)?;
    next.append(needed, |buf| {
        let at = write_values_tail(buf);
        write_value_entry(&mut buf[at..], value);
        Ok(())
    })?;
    if !tail_chunk.set_next_chunk_id(next.id())? {
        return Err(DurableError::LogCorruption(format!(
            "chunk {} is already linked; it is not the end of its chain",
            tail
        )));
    }
    Ok(next.id())
}

/// Forward link of a chain chunk, checked to point further into the log
fn next_in_chain(log: &ChunkedLog, id: ChunkId) -> Result<Option<ChunkId>> {
    let next = log.read(id)?.next_chunk_id()?;
    match next {
        Some(next) if next <= id => Err(DurableError::LogCorruption(format!(
            "chunk {} links backwards to {}",
            id, next
        ))),
        other => Ok(other),
    }
}

/// Visit every value of the chain starting at `head`, oldest first
fn walk_chain<F>(log: &ChunkedLog, head: ChunkId, mut visit: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut current = Some(head);
    while let Some(id) = current {
        let payload = log.read(id)?.read()?;
        let values = match Record::decode(&payload)? {
            Some(Record::ValuesHead { values, .. }) if id == head => values,
            Some(Record::ValuesTail { values }) if id != head => values,
            None => &[][..],
            Some(_) => return Err(not_a_head(id)),
        };
        for value in value_entries(values) {
            visit(value?)?;
        }
        current = next_in_chain(log, id)?;
    }
    Ok(())
}

fn not_a_head(chunk_id: ChunkId) -> DurableError {
    DurableError::IndexCorruption(format!(
        "chunk {} is not part of a value chain where one was expected",
        chunk_id
    ))
}
