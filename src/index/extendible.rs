//! Extendible hash index
//!
//! Maps 64-bit key hashes to log chunk ids. The directory is indexed by the
//! low `global_depth` bits of a hash; slots inside a segment are probed from
//! a position derived from the high bits.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::header::{
    max_global_depth, IndexHeader, DIRECTORY_OFFSET, STATUS_OPENED, STATUS_PROPERLY_CLOSED,
};
use super::segment::Segment;
use crate::config::{MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use crate::error::{DurableError, Result};
use crate::file_io::{read_exact_at, write_all_at};
use crate::log::ChunkId;

/// Stored in place of a zero hash, which marks empty slots
const ZERO_HASH_SUBSTITUTE: u64 = 0x5DEE_CE66_D1CE_4E5B;

/// Shape and fill of an index, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub global_depth: u8,
    pub directory_size: usize,
    pub segments: usize,
    pub entries: u64,
    pub max_probe_length: usize,
}

/// On-disk extendible hash table from key hash to chunk id
///
/// All segments are kept in memory; `flush` writes the dirty ones. A hash may
/// map to several chunk ids: the single-valued methods (`get`, `put`,
/// `remove`) treat it as one value, the multi-valued ones let the caller
/// tell colliding keys apart.
pub struct ExtendibleHashIndex {
    path: PathBuf,
    file: File,
    header: IndexHeader,
    /// `segments[n - 1]` is data segment `n`
    segments: Vec<Segment>,
    max_depth: u8,
    header_dirty: bool,
    /// `STATUS_OPENED` has been persisted since the last flush
    opened_marker_written: bool,
    properly_closed_on_open: bool,
    closed: bool,
}

fn normalize(hash: u64) -> u64 {
    if hash == 0 {
        ZERO_HASH_SUBSTITUTE
    } else {
        hash
    }
}

impl ExtendibleHashIndex {
    /// Open or create an index file with the given segment size
    ///
    /// An existing file with a different magic, version or segment size is
    /// `IncompatibleFormat`; inconsistent structure is `IndexCorruption`.
    pub fn open(path: &Path, segment_size: usize) -> Result<Self> {
        if !segment_size.is_power_of_two() || !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&segment_size) {
            return Err(DurableError::Config(format!(
                "index segment size {} must be a power of two in [{}, {}]",
                segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut index = Self {
            path: path.to_path_buf(),
            file,
            header: IndexHeader::new(segment_size as u32),
            segments: Vec::new(),
            max_depth: max_global_depth(segment_size),
            header_dirty: true,
            opened_marker_written: false,
            properly_closed_on_open: true,
            closed: false,
        };

        if file_len == 0 {
            index.segments.push(Segment::new(segment_size, 0, 0));
            index.write_dirty()?;
            index.file.sync_all()?;
            debug!(path = %path.display(), segment_size, "Created index");
        } else {
            index.load(file_len)?;
            info!(
                path = %path.display(),
                entries = index.header.entries,
                segments = index.segments.len(),
                global_depth = index.header.global_depth,
                properly_closed = index.properly_closed_on_open,
                "Opened index"
            );
        }
        Ok(index)
    }

    fn load(&mut self, file_len: u64) -> Result<()> {
        let segment_size = self.header.segment_size;
        let mut fixed = [0u8; DIRECTORY_OFFSET];
        read_exact_at(&self.file, &mut fixed, 0).map_err(|e| self.corruption(e.to_string()))?;
        IndexHeader::check_format(&fixed, segment_size, &self.path)?;

        let mut raw = vec![0u8; segment_size as usize];
        read_exact_at(&self.file, &mut raw, 0).map_err(|e| self.corruption(e.to_string()))?;
        let header = IndexHeader::decode(&raw, &self.path)?;

        let needed = (u64::from(header.segments_count) + 1) * u64::from(segment_size);
        if file_len < needed {
            return Err(self.corruption(format!(
                "file is {} bytes, {} segments need {}",
                file_len, header.segments_count, needed
            )));
        }

        let mut segments = Vec::with_capacity(header.segments_count as usize);
        for number in 1..=header.segments_count {
            read_exact_at(&self.file, &mut raw, u64::from(number) * u64::from(segment_size))
                .map_err(|e| self.corruption(e.to_string()))?;
            segments.push(Segment::decode(&raw, number).map_err(|reason| self.corruption(reason))?);
        }

        for (slot, number) in header.directory.iter().enumerate() {
            let segment = &segments[(*number - 1) as usize];
            let consistent = segment.depth <= header.global_depth
                && (slot as u64) & ((1u64 << segment.depth) - 1) == u64::from(segment.hash_suffix);
            if !consistent {
                return Err(self.corruption(format!(
                    "directory slot {} points at segment {} (depth {}, suffix {})",
                    slot, number, segment.depth, segment.hash_suffix
                )));
            }
        }

        let alive: u64 = segments.iter().map(|s| s.alive() as u64).sum();
        if alive != header.entries {
            return Err(self.corruption(format!(
                "header counts {} entries, segments hold {}",
                header.entries, alive
            )));
        }

        self.properly_closed_on_open = header.file_status == STATUS_PROPERLY_CLOSED;
        self.header = header;
        self.segments = segments;
        self.header_dirty = false;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Single-valued API
    // -------------------------------------------------------------------------

    /// First chunk id stored for `hash`
    pub fn get(&self, hash: u64) -> Option<ChunkId> {
        let hash = normalize(hash);
        self.segment(hash)
            .probe(hash)
            .next()
            .and_then(|(_, chunk)| ChunkId::new(chunk))
    }

    /// Map `hash` to `chunk_id` alone, dropping any previous values
    ///
    /// Replacing existing values always fits; only a new hash can fail with
    /// `CapacityExceeded`, and then nothing changes.
    pub fn put(&mut self, hash: u64, chunk_id: ChunkId) -> Result<()> {
        self.check_open()?;
        let hash = normalize(hash);
        self.mark_modified()?;

        let position = self.segment_position(hash);
        let removed = self.segments[position].remove_all(hash);
        if removed == 0 {
            return self.insert_normalized(hash, chunk_id);
        }
        self.header.entries -= removed as u64;
        self.header_dirty = true;
        // The freed slots lie on the probe path of `hash`
        self.insert_at(position, hash, chunk_id)
    }

    /// Drop every value stored for `hash`
    pub fn remove(&mut self, hash: u64) -> Result<bool> {
        self.check_open()?;
        let hash = normalize(hash);
        if self.segment(hash).probe(hash).next().is_none() {
            return Ok(false);
        }
        self.mark_modified()?;

        let position = self.segment_position(hash);
        let removed = self.segments[position].remove_all(hash);
        self.header.entries -= removed as u64;
        self.header_dirty = true;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Multi-valued API
    // -------------------------------------------------------------------------

    /// First value for `hash` the acceptor agrees to
    pub fn lookup<F>(&self, hash: u64, mut acceptor: F) -> Result<Option<ChunkId>>
    where
        F: FnMut(ChunkId) -> Result<bool>,
    {
        let hash = normalize(hash);
        for (_, chunk) in self.segment(hash).probe(hash) {
            if let Some(id) = ChunkId::new(chunk) {
                if acceptor(id)? {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Add `(hash, chunk_id)`; `Ok(false)` if the pair is already present
    pub fn insert(&mut self, hash: u64, chunk_id: ChunkId) -> Result<bool> {
        self.check_open()?;
        let hash = normalize(hash);
        if self.segment(hash).contains(hash, chunk_id.get()) {
            return Ok(false);
        }
        self.mark_modified()?;
        self.insert_normalized(hash, chunk_id)?;
        Ok(true)
    }

    /// Make sure one more value for `hash` fits, splitting segments as needed
    ///
    /// Lets a caller find out before writing anything elsewhere that an
    /// `insert` would fail with `CapacityExceeded`. No entry changes.
    pub fn reserve(&mut self, hash: u64) -> Result<()> {
        self.check_open()?;
        let hash = normalize(hash);
        self.mark_modified()?;
        self.make_room(hash).map(|_| ())
    }

    /// Repoint `(hash, old)` to `new`
    pub fn replace(&mut self, hash: u64, old: ChunkId, new: ChunkId) -> Result<bool> {
        self.check_open()?;
        let hash = normalize(hash);
        let position = self.segment_position(hash);
        if !self.segments[position].contains(hash, old.get()) {
            return Ok(false);
        }
        self.mark_modified()?;

        let segment = &mut self.segments[position];
        if segment.contains(hash, new.get()) {
            segment.remove(hash, old.get());
            self.header.entries -= 1;
            self.header_dirty = true;
        } else {
            segment.replace(hash, old.get(), new.get());
        }
        Ok(true)
    }

    /// Drop the single `(hash, chunk_id)` pair
    pub fn remove_value(&mut self, hash: u64, chunk_id: ChunkId) -> Result<bool> {
        self.check_open()?;
        let hash = normalize(hash);
        let position = self.segment_position(hash);
        if !self.segments[position].contains(hash, chunk_id.get()) {
            return Ok(false);
        }
        self.mark_modified()?;

        self.segments[position].remove(hash, chunk_id.get());
        self.header.entries -= 1;
        self.header_dirty = true;
        Ok(true)
    }

    /// Visit every `(hash, chunk id)` pair in unspecified order
    ///
    /// Returns `Ok(false)` if the visitor stopped early.
    pub fn for_each<F>(&self, mut visitor: F) -> Result<bool>
    where
        F: FnMut(u64, ChunkId) -> Result<bool>,
    {
        for segment in &self.segments {
            for (hash, chunk) in segment.live_entries() {
                if let Some(id) = ChunkId::new(chunk) {
                    if !visitor(hash, id)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Whole-index operations
    // -------------------------------------------------------------------------

    /// Live `(hash, chunk id)` pairs
    pub fn len(&self) -> u64 {
        self.header.entries
    }

    pub fn is_empty(&self) -> bool {
        self.header.entries == 0
    }

    /// Drop every entry and shrink back to a single segment
    pub fn clear(&mut self) -> Result<()> {
        self.check_open()?;
        self.mark_modified()?;

        let segment_size = self.header.segment_size;
        let status = self.header.file_status;
        let (generation, frontier) = self.log_binding();
        self.header = IndexHeader::new(segment_size);
        self.header.file_status = status;
        self.header.log_generation = generation;
        self.header.log_frontier = frontier;
        self.segments = vec![Segment::new(segment_size as usize, 0, 0)];
        self.header_dirty = true;

        self.file.set_len(2 * u64::from(segment_size))?;
        debug!(path = %self.path.display(), "Cleared index");
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            global_depth: self.header.global_depth,
            directory_size: self.header.directory.len(),
            segments: self.segments.len(),
            entries: self.header.entries,
            max_probe_length: self
                .segments
                .iter()
                .map(|s| s.max_probe_length())
                .max()
                .unwrap_or(0),
        }
    }

    /// Record which log state the entries reflect; persisted on flush
    pub fn bind_to_log(&mut self, generation: u64, frontier: u64) {
        self.header.log_generation = generation;
        self.header.log_frontier = frontier;
        self.header_dirty = true;
    }

    /// `(generation, frontier)` of the log this index was last bound to
    pub fn log_binding(&self) -> (u64, u64) {
        (self.header.log_generation, self.header.log_frontier)
    }

    /// Whether the previous owner flushed after its last modification
    pub fn was_properly_closed(&self) -> bool {
        self.properly_closed_on_open
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn segment_size(&self) -> usize {
        self.header.segment_size as usize
    }

    /// Write dirty segments and mark the file properly closed
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        self.header.file_status = STATUS_PROPERLY_CLOSED;
        self.header_dirty = true;
        self.write_dirty()?;
        self.file.sync_data()?;
        self.opened_marker_written = false;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.file.sync_all()?;
        self.closed = true;
        debug!(path = %self.path.display(), entries = self.header.entries, "Closed index");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DurableError::Closed);
        }
        Ok(())
    }

    fn segment_position(&self, hash: u64) -> usize {
        let slot = (hash & self.header.directory_mask()) as usize;
        (self.header.directory[slot] - 1) as usize
    }

    fn segment(&self, hash: u64) -> &Segment {
        &self.segments[self.segment_position(hash)]
    }

    /// Persist `STATUS_OPENED` before the first change since open or flush
    fn mark_modified(&mut self) -> Result<()> {
        if self.opened_marker_written {
            return Ok(());
        }
        self.header.file_status = STATUS_OPENED;
        let raw = self.header.encode();
        write_all_at(&self.file, &raw[..DIRECTORY_OFFSET], 0)?;
        self.file.sync_data()?;
        self.opened_marker_written = true;
        Ok(())
    }

    fn insert_normalized(&mut self, hash: u64, chunk_id: ChunkId) -> Result<()> {
        let position = self.make_room(hash)?;
        self.insert_at(position, hash, chunk_id)
    }

    fn insert_at(&mut self, position: usize, hash: u64, chunk_id: ChunkId) -> Result<()> {
        if !self.segments[position].insert(hash, chunk_id.get()) {
            return Err(DurableError::CapacityExceeded(format!(
                "[{}] index segment has no free slot",
                self.path.display()
            )));
        }
        self.header.entries += 1;
        self.header_dirty = true;
        Ok(())
    }

    /// Split (and grow the directory) until the target segment can take one
    /// more entry within its load factor; returns the target segment
    fn make_room(&mut self, hash: u64) -> Result<usize> {
        loop {
            let position = self.segment_position(hash);
            let segment = &mut self.segments[position];
            let limit = segment.load_limit();

            if segment.used() < limit {
                return Ok(position);
            }
            if segment.alive() < limit {
                segment.prune_tombstones();
                return Ok(position);
            }

            if segment.depth == self.header.global_depth {
                if self.header.global_depth >= self.max_depth {
                    // The directory cannot grow: fill past the load factor,
                    // keeping one empty slot to terminate probes
                    segment.prune_tombstones();
                    if segment.alive() + 2 <= segment.capacity() {
                        return Ok(position);
                    }
                    return Err(DurableError::CapacityExceeded(format!(
                        "[{}] index is at maximum depth {} and segment {} is full",
                        self.path.display(),
                        self.max_depth,
                        position + 1
                    )));
                }
                self.double_directory();
            }
            self.split(position);
        }
    }

    fn double_directory(&mut self) {
        self.header.directory.extend_from_within(..);
        self.header.global_depth += 1;
        self.header_dirty = true;
        debug!(
            path = %self.path.display(),
            global_depth = self.header.global_depth,
            "Doubled index directory"
        );
    }

    fn split(&mut self, position: usize) {
        let segment_size = self.header.segment_size as usize;
        let old_depth = self.segments[position].depth;
        let suffix = self.segments[position].hash_suffix;
        let high_bit = 1u32 << old_depth;

        let (stay, moved): (Vec<(u64, u64)>, Vec<(u64, u64)>) = self.segments[position]
            .live_entries()
            .partition(|(hash, _)| (hash >> old_depth) & 1 == 0);

        let mut sibling = Segment::new(segment_size, suffix | high_bit, old_depth + 1);
        sibling.rebuild(moved);
        let original = &mut self.segments[position];
        original.depth = old_depth + 1;
        original.rebuild(stay);

        self.segments.push(sibling);
        let sibling_number = self.segments.len() as u32;
        self.header.segments_count = sibling_number;

        let new_mask = (1u64 << (old_depth + 1)) - 1;
        let sibling_suffix = u64::from(suffix | high_bit);
        for (slot, number) in self.header.directory.iter_mut().enumerate() {
            if (slot as u64) & new_mask == sibling_suffix {
                *number = sibling_number;
            }
        }
        self.header_dirty = true;

        debug!(
            path = %self.path.display(),
            segment = position + 1,
            sibling = sibling_number,
            depth = old_depth + 1,
            "Split index segment"
        );
    }

    fn write_dirty(&mut self) -> Result<()> {
        let segment_size = self.header.segment_size as usize;
        let mut raw = vec![0u8; segment_size];
        for (i, segment) in self.segments.iter_mut().enumerate() {
            if segment.dirty {
                segment.encode(&mut raw);
                write_all_at(&self.file, &raw, (i as u64 + 1) * segment_size as u64)?;
                segment.dirty = false;
            }
        }
        if self.header_dirty {
            write_all_at(&self.file, &self.header.encode(), 0)?;
            self.header_dirty = false;
        }
        Ok(())
    }

    fn corruption(&self, reason: String) -> DurableError {
        DurableError::IndexCorruption(format!("[{}] {}", self.path.display(), reason))
    }
}
