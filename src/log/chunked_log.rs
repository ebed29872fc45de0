//! Chunked append-only log
//!
//! Owns the log file: allocates chunks at the write frontier, resolves chunk
//! ids, scans the log in order and repairs a torn tail on open.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::chunk::{
    ChunkHeader, ChunkId, HeaderStatus, LogChunk, CHUNK_ALIGNMENT, CHUNK_HEADER_SIZE,
    MAX_APPENDABLE_CAPACITY, MAX_FIXED_PAYLOAD, NEXT_ID_FIELD_SIZE,
};
use super::header::{new_generation, LogHeader, LOG_HEADER_SIZE, STATUS_CLOSED, STATUS_OPEN};
use crate::config::SyncStrategy;
use crate::error::{DurableError, Result};
use crate::file_io::{get_u64, read_exact_at, read_up_to, write_all_at};

/// Result of a tolerant scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Valid chunks handed to the reader
    pub chunks_visited: u64,

    /// The reader returned `false`
    pub stopped_by_reader: bool,

    /// Offset just past the last visited chunk
    pub end_offset: u64,

    /// First chunk that failed validation, if the scan met one
    pub torn: Option<TornChunk>,
}

/// Location and cause of the first invalid chunk found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornChunk {
    pub offset: u64,
    pub reason: String,
}

/// What tail recovery did when the log was opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecovery {
    /// Frontier recorded in the header by the previous owner
    pub recorded_frontier: u64,

    /// Frontier after recovery: end of the last valid chunk
    pub recovered_frontier: u64,

    /// Bytes cut from the end of the file
    pub discarded_bytes: u64,

    /// Valid chunks kept
    pub chunks: u64,

    /// Forward links reset because their target was discarded
    pub cleared_links: u64,
}

enum ChunkStatus {
    Valid(ChunkHeader),
    Torn(String),
}

/// Append-only log of CRC-protected chunks
///
/// Appends to different chunks and reads may run from many threads through
/// `&ChunkedLog`; allocation and in-place chunk writes are serialized
/// internally.
pub struct ChunkedLog {
    path: PathBuf,
    file: File,
    generation: u64,

    /// Persisted fields not tracked by the atomics below
    header: Mutex<LogHeader>,

    /// First unallocated byte; published after the chunk is in the file
    frontier: AtomicU64,
    chunks_count: AtomicU64,

    allocation_lock: Mutex<()>,
    append_lock: Mutex<()>,

    sync_strategy: SyncStrategy,
    unsynced_writes: AtomicUsize,

    recovery: Option<LogRecovery>,
    closed: AtomicBool,
}

impl ChunkedLog {
    /// Open or create a log file
    ///
    /// A log that was not closed cleanly is scanned from the start and cut at
    /// the first chunk whose header or payload checksum does not verify.
    pub fn open(path: &Path, sync_strategy: SyncStrategy) -> Result<Self> {
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

        let (mut header, recovery) = if file_len == 0 {
            (LogHeader::new(new_generation()), None)
        } else {
            if file_len < LOG_HEADER_SIZE {
                return Err(DurableError::LogCorruption(format!(
                    "[{}] file is {} bytes, shorter than the log header",
                    path.display(),
                    file_len
                )));
            }
            let mut raw = [0u8; LOG_HEADER_SIZE as usize];
            read_exact_at(&file, &mut raw, 0)?;
            let header = LogHeader::decode(&raw, path)?;

            let trusted = header.status == STATUS_CLOSED
                && header.frontier >= LOG_HEADER_SIZE
                && header.frontier <= file_len;
            if trusted {
                if file_len > header.frontier {
                    file.set_len(header.frontier)?;
                }
                (header, None)
            } else {
                Self::recover_tail(path, &file, header, file_len)?
            }
        };

        header.status = STATUS_OPEN;
        write_all_at(&file, &header.encode(), 0)?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            generation = header.generation,
            frontier = header.frontier,
            chunks = header.chunks_count,
            recovered = recovery.is_some(),
            "Opened chunked log"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            generation: header.generation,
            frontier: AtomicU64::new(header.frontier),
            chunks_count: AtomicU64::new(header.chunks_count),
            header: Mutex::new(header),
            allocation_lock: Mutex::new(()),
            append_lock: Mutex::new(()),
            sync_strategy,
            unsynced_writes: AtomicUsize::new(0),
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    fn recover_tail(
        path: &Path,
        file: &File,
        mut header: LogHeader,
        file_len: u64,
    ) -> Result<(LogHeader, Option<LogRecovery>)> {
        let mut offset = LOG_HEADER_SIZE;
        let mut chunks = 0u64;
        let mut linked = Vec::new();
        while offset < file_len {
            match inspect_chunk(file, offset, file_len, true)? {
                Some(ChunkStatus::Valid(chunk)) => {
                    if chunk.has_next_field {
                        linked.push(offset);
                    }
                    offset += chunk.total_length();
                    chunks += 1;
                }
                Some(ChunkStatus::Torn(reason)) => {
                    warn!(path = %path.display(), offset, reason = %reason, "Torn chunk found");
                    break;
                }
                None => break,
            }
        }

        if offset < file_len {
            file.set_len(offset)?;
        }
        let cleared_links = clear_dangling_links(path, file, &linked, offset)?;

        let recovery = LogRecovery {
            recorded_frontier: header.frontier,
            recovered_frontier: offset,
            discarded_bytes: file_len - offset,
            chunks,
            cleared_links,
        };
        warn!(
            path = %path.display(),
            recorded_frontier = recovery.recorded_frontier,
            recovered_frontier = recovery.recovered_frontier,
            discarded_bytes = recovery.discarded_bytes,
            chunks,
            "Log was not closed cleanly, recovered tail"
        );

        header.frontier = offset;
        header.chunks_count = chunks;
        Ok((header, Some(recovery)))
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate an appendable chunk without a forward-link field
    pub fn append(&self, capacity: usize) -> Result<LogChunk<'_>> {
        self.allocate_appendable(capacity, false)
    }

    /// Allocate an appendable chunk whose next chunk id can be set later
    pub fn append_reserving_next_id(&self, capacity: usize) -> Result<LogChunk<'_>> {
        self.allocate_appendable(capacity, true)
    }

    /// Allocate a fixed chunk holding `payload`
    pub fn append_fixed(&self, payload: &[u8], reserve_next_id: bool) -> Result<LogChunk<'_>> {
        if payload.is_empty() {
            return Err(DurableError::Usage(
                "fixed chunk payload must not be empty".to_string(),
            ));
        }
        if payload.len() > MAX_FIXED_PAYLOAD {
            return Err(DurableError::CapacityExceeded(format!(
                "fixed chunk payload of {} bytes exceeds {}",
                payload.len(),
                MAX_FIXED_PAYLOAD
            )));
        }
        self.allocate(ChunkHeader::fixed(payload, reserve_next_id), payload)
    }

    fn allocate_appendable(&self, capacity: usize, reserve_next_id: bool) -> Result<LogChunk<'_>> {
        if capacity == 0 {
            return Err(DurableError::Usage(
                "appendable chunk capacity must be > 0".to_string(),
            ));
        }
        if capacity > MAX_APPENDABLE_CAPACITY {
            return Err(DurableError::CapacityExceeded(format!(
                "appendable chunk capacity {} exceeds {}",
                capacity, MAX_APPENDABLE_CAPACITY
            )));
        }
        self.allocate(ChunkHeader::appendable(capacity as u16, reserve_next_id), &[])
    }

    fn allocate(&self, header: ChunkHeader, payload: &[u8]) -> Result<LogChunk<'_>> {
        self.check_open()?;
        let total = header.total_length();

        let offset = {
            let _guard = self.allocation_lock.lock();
            let offset = self.frontier.load(Ordering::Acquire);

            let mut buf = vec![0u8; total as usize];
            buf[..CHUNK_HEADER_SIZE].copy_from_slice(&header.encode(offset));
            let start = header.payload_offset(0) as usize;
            buf[start..start + payload.len()].copy_from_slice(payload);
            write_all_at(&self.file, &buf, offset)?;

            self.frontier.store(offset + total, Ordering::Release);
            self.chunks_count.fetch_add(1, Ordering::AcqRel);
            offset
        };

        self.note_write()?;
        Ok(LogChunk::new(self, offset, header))
    }

    // -------------------------------------------------------------------------
    // Reads and scans
    // -------------------------------------------------------------------------

    /// Resolve a chunk id
    ///
    /// Ids outside the allocated region or pointing at anything but a valid
    /// chunk header are reported as `LogCorruption`.
    pub fn read(&self, id: ChunkId) -> Result<LogChunk<'_>> {
        self.check_open()?;
        let frontier = self.frontier.load(Ordering::Acquire);
        let offset = match id.to_offset() {
            Some(offset) if offset < frontier => offset,
            _ => {
                return Err(DurableError::LogCorruption(format!(
                    "[{}] chunk id {} is outside of the log (frontier {})",
                    self.path.display(),
                    id,
                    frontier
                )))
            }
        };

        let header = self.read_header_at(offset)?;
        if offset + header.total_length() > frontier {
            return Err(DurableError::LogCorruption(format!(
                "[{}] chunk {} extends past the frontier {}",
                self.path.display(),
                id,
                frontier
            )));
        }
        Ok(LogChunk::new(self, offset, header))
    }

    /// Visit every chunk in log order
    ///
    /// Returns `Ok(false)` if the reader stopped the scan. A malformed header
    /// aborts the scan with `LogCorruption`.
    pub fn for_each_chunk<F>(&self, mut reader: F) -> Result<bool>
    where
        F: FnMut(&LogChunk<'_>) -> Result<bool>,
    {
        let outcome = self.scan(LOG_HEADER_SIZE, false, &mut reader)?;
        if let Some(torn) = outcome.torn {
            return Err(DurableError::LogCorruption(format!(
                "[{}] {}",
                self.path.display(),
                torn.reason
            )));
        }
        Ok(!outcome.stopped_by_reader)
    }

    /// Visit valid chunks from `offset`, stopping at the first torn one
    ///
    /// Header and payload checksums are verified before a chunk reaches the
    /// reader. The position of an invalid chunk is reported in the outcome
    /// rather than as an error.
    pub fn scan_from<F>(&self, offset: u64, mut reader: F) -> Result<ScanOutcome>
    where
        F: FnMut(&LogChunk<'_>) -> Result<bool>,
    {
        self.scan(offset, true, &mut reader)
    }

    fn scan<F>(&self, offset: u64, verify_payload: bool, reader: &mut F) -> Result<ScanOutcome>
    where
        F: FnMut(&LogChunk<'_>) -> Result<bool>,
    {
        self.check_open()?;
        let limit = self.frontier.load(Ordering::Acquire);
        self.check_boundary(offset, limit)?;

        let mut position = offset;
        let mut visited = 0u64;
        while position < limit {
            match inspect_chunk(&self.file, position, limit, verify_payload)? {
                Some(ChunkStatus::Valid(header)) => {
                    let chunk = LogChunk::new(self, position, header);
                    visited += 1;
                    position += header.total_length();
                    if !reader(&chunk)? {
                        return Ok(ScanOutcome {
                            chunks_visited: visited,
                            stopped_by_reader: true,
                            end_offset: position,
                            torn: None,
                        });
                    }
                }
                Some(ChunkStatus::Torn(reason)) => {
                    return Ok(ScanOutcome {
                        chunks_visited: visited,
                        stopped_by_reader: false,
                        end_offset: position,
                        torn: Some(TornChunk {
                            offset: position,
                            reason,
                        }),
                    });
                }
                None => {
                    return Ok(ScanOutcome {
                        chunks_visited: visited,
                        stopped_by_reader: false,
                        end_offset: position,
                        torn: Some(TornChunk {
                            offset: position,
                            reason: format!("chunk at offset {} was never written", position),
                        }),
                    });
                }
            }
        }

        Ok(ScanOutcome {
            chunks_visited: visited,
            stopped_by_reader: false,
            end_offset: position,
            torn: None,
        })
    }

    /// Discard everything from `offset` on
    ///
    /// `offset` must be a chunk boundary inside the allocated region, usually
    /// the `TornChunk::offset` reported by a scan. Forward links of surviving
    /// chunks that point into the discarded region are reset.
    pub fn truncate_at(&self, offset: u64) -> Result<()> {
        self.check_open()?;
        let _guard = self.allocation_lock.lock();
        let _appends = self.append_lock.lock();
        let frontier = self.frontier.load(Ordering::Acquire);
        self.check_boundary(offset, frontier)?;

        let mut chunks = 0u64;
        let mut linked = Vec::new();
        let mut position = LOG_HEADER_SIZE;
        while position < offset {
            match inspect_chunk(&self.file, position, offset, false)? {
                Some(ChunkStatus::Valid(header)) => {
                    if header.has_next_field {
                        linked.push(position);
                    }
                    position += header.total_length();
                    chunks += 1;
                }
                _ => break,
            }
        }

        self.file.set_len(offset)?;
        clear_dangling_links(&self.path, &self.file, &linked, offset)?;
        self.frontier.store(offset, Ordering::Release);
        self.chunks_count.store(chunks, Ordering::Release);
        self.persist_header(STATUS_OPEN)?;
        self.file.sync_all()?;

        warn!(
            path = %self.path.display(),
            offset,
            discarded_bytes = frontier - offset,
            "Truncated log"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    /// Make every allocated chunk and append durable
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.persist_header(STATUS_OPEN)?;
        self.file.sync_data()?;
        self.unsynced_writes.store(0, Ordering::Release);
        debug!(path = %self.path.display(), frontier = self.frontier(), "Flushed log");
        Ok(())
    }

    /// Sync and mark the log as cleanly closed
    ///
    /// Further operations fail with `DurableError::Closed`. Dropping a log
    /// without closing it leaves it marked open, and the next open recovers
    /// its tail.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.allocation_lock.lock();
        self.file.sync_data()?;
        self.persist_header(STATUS_CLOSED)?;
        self.file.sync_all()?;
        self.closed.store(true, Ordering::Release);

        info!(
            path = %self.path.display(),
            frontier = self.frontier(),
            chunks = self.chunks_count(),
            "Closed chunked log"
        );
        Ok(())
    }

    fn persist_header(&self, status: u8) -> Result<()> {
        let mut header = self.header.lock();
        header.status = status;
        header.frontier = self.frontier.load(Ordering::Acquire);
        header.chunks_count = self.chunks_count.load(Ordering::Acquire);
        write_all_at(&self.file, &header.encode(), 0)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of this log file; a rewritten log gets a new one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offset of the first unallocated byte
    pub fn frontier(&self) -> u64 {
        self.frontier.load(Ordering::Acquire)
    }

    pub fn chunks_count(&self) -> u64 {
        self.chunks_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks_count() == 0
    }

    /// Record format version stored by the log's client
    pub fn data_version(&self) -> u32 {
        self.header.lock().data_version
    }

    /// Store the record format version in the header
    pub fn set_data_version(&self, version: u32) -> Result<()> {
        self.check_open()?;
        self.header.lock().data_version = version;
        self.persist_header(STATUS_OPEN)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Tail recovery performed by `open`, if the log was not closed cleanly
    pub fn recovery(&self) -> Option<&LogRecovery> {
        self.recovery.as_ref()
    }

    pub fn was_recovery_needed(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Chunk support
    // -------------------------------------------------------------------------

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn append_lock(&self) -> &Mutex<()> {
        &self.append_lock
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DurableError::Closed);
        }
        Ok(())
    }

    pub(crate) fn read_header_at(&self, offset: u64) -> Result<ChunkHeader> {
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        read_exact_at(&self.file, &mut raw, offset).map_err(|e| {
            DurableError::LogCorruption(format!(
                "[{}] chunk header at offset {} unreadable: {}",
                self.path.display(),
                offset,
                e
            ))
        })?;
        match ChunkHeader::decode(&raw, offset) {
            HeaderStatus::Valid(header) => Ok(header),
            HeaderStatus::Unwritten => Err(DurableError::LogCorruption(format!(
                "[{}] no chunk header at offset {}",
                self.path.display(),
                offset
            ))),
            HeaderStatus::Malformed(reason) => Err(DurableError::LogCorruption(format!(
                "[{}] {}",
                self.path.display(),
                reason
            ))),
        }
    }

    /// Count a write against the sync strategy
    pub(crate) fn note_write(&self) -> Result<()> {
        match self.sync_strategy {
            SyncStrategy::EveryWrite => self.file.sync_data()?,
            SyncStrategy::EveryNWrites { count } => {
                let pending = self.unsynced_writes.fetch_add(1, Ordering::AcqRel) + 1;
                if pending >= count {
                    self.unsynced_writes.store(0, Ordering::Release);
                    self.file.sync_data()?;
                }
            }
            SyncStrategy::Manual => {}
        }
        Ok(())
    }

    fn check_boundary(&self, offset: u64, limit: u64) -> Result<()> {
        if offset < LOG_HEADER_SIZE
            || offset > limit
            || (offset - LOG_HEADER_SIZE) % CHUNK_ALIGNMENT != 0
        {
            return Err(DurableError::Usage(format!(
                "offset {} is not a chunk boundary in [{}, {}]",
                offset, LOG_HEADER_SIZE, limit
            )));
        }
        Ok(())
    }
}

/// Reset the forward links of the chunks at `linked` that point at `cut` or
/// beyond; returns how many were reset
///
/// Everything from `cut` on was discarded, so such a link was never
/// committed. Left in place it would resolve to whatever chunk is allocated
/// there next.
fn clear_dangling_links(path: &Path, file: &File, linked: &[u64], cut: u64) -> Result<u64> {
    let mut cleared = 0u64;
    for &chunk_offset in linked {
        let at = chunk_offset + CHUNK_HEADER_SIZE as u64;
        let mut raw = [0u8; NEXT_ID_FIELD_SIZE];
        read_exact_at(file, &mut raw, at)?;

        let Some(target) = ChunkId::new(get_u64(&raw, 0)) else {
            continue;
        };
        if target.to_offset().map_or(true, |target| target >= cut) {
            write_all_at(file, &[0u8; NEXT_ID_FIELD_SIZE], at)?;
            cleared += 1;
            debug!(
                path = %path.display(),
                chunk_id = %ChunkId::from_offset(chunk_offset),
                target = %target,
                "Reset link into discarded tail"
            );
        }
    }
    if cleared > 0 {
        warn!(path = %path.display(), cleared, cut, "Reset forward links into discarded tail");
    }
    Ok(cleared)
}

/// Validate the chunk at `offset` against a region ending at `limit`
///
/// Returns `None` for a never-written header slot.
fn inspect_chunk(
    file: &File,
    offset: u64,
    limit: u64,
    verify_payload: bool,
) -> Result<Option<ChunkStatus>> {
    if offset + CHUNK_HEADER_SIZE as u64 > limit {
        return Ok(Some(ChunkStatus::Torn(format!(
            "chunk header at offset {} is cut off",
            offset
        ))));
    }

    let mut raw = [0u8; CHUNK_HEADER_SIZE];
    if read_up_to(file, &mut raw, offset)? < CHUNK_HEADER_SIZE {
        return Ok(Some(ChunkStatus::Torn(format!(
            "chunk header at offset {} is cut off",
            offset
        ))));
    }

    let header = match ChunkHeader::decode(&raw, offset) {
        HeaderStatus::Valid(header) => header,
        HeaderStatus::Unwritten => return Ok(None),
        HeaderStatus::Malformed(reason) => return Ok(Some(ChunkStatus::Torn(reason))),
    };

    if offset + header.total_length() > limit {
        return Ok(Some(ChunkStatus::Torn(format!(
            "chunk at offset {} extends past the end of the log",
            offset
        ))));
    }

    if verify_payload {
        let mut payload = vec![0u8; header.committed as usize];
        let read = read_up_to(file, &mut payload, header.payload_offset(offset))?;
        if read < payload.len() || crc32fast::hash(&payload) != header.crc {
            return Ok(Some(ChunkStatus::Torn(format!(
                "chunk at offset {} fails its payload checksum",
                offset
            ))));
        }
    }

    Ok(Some(ChunkStatus::Valid(header)))
}
