//! Log chunks
//!
//! Chunk ids, the 16-byte chunk header and the `LogChunk` handle.

use std::fmt;
use std::num::NonZeroU64;

use bytes::Bytes;

use super::chunked_log::ChunkedLog;
use super::header::LOG_HEADER_SIZE;
use crate::error::{DurableError, Result};
use crate::file_io::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, read_exact_at, write_all_at};

/// Every chunk starts on this boundary
pub const CHUNK_ALIGNMENT: u64 = 8;

/// Size of the fixed part of a chunk header
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Size of the optional forward-link field following the header
pub const NEXT_ID_FIELD_SIZE: usize = 8;

/// Largest payload of a fixed chunk
pub const MAX_FIXED_PAYLOAD: usize = (1 << 30) - 1;

/// Largest payload of an appendable chunk (capacity is a u16 in the header)
pub const MAX_APPENDABLE_CAPACITY: usize = u16::MAX as usize;

const TAG_BASE: u8 = 0xC0;
const TAG_BASE_MASK: u8 = 0xFC;
const TAG_APPENDABLE: u8 = 0x01;
const TAG_HAS_NEXT: u8 = 0x02;

const OFFSET_TAG: usize = 0;
const OFFSET_CHECK: usize = 1;
const OFFSET_CAPACITY: usize = 2;
const OFFSET_SIZE: usize = 4;
const OFFSET_CRC: usize = 8;
const OFFSET_RESERVED: usize = 12;

// =============================================================================
// Chunk Id
// =============================================================================

/// Stable identifier of a chunk
///
/// Derived from the chunk's file offset, so it grows with log position and
/// locates the chunk header without any lookup table. Zero is never a valid
/// id; the index uses it as "no chunk".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(NonZeroU64);

impl ChunkId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ChunkId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Id of the chunk starting at `offset` (aligned, past the file header)
    pub(crate) fn from_offset(offset: u64) -> Self {
        debug_assert!(offset >= LOG_HEADER_SIZE);
        debug_assert_eq!((offset - LOG_HEADER_SIZE) % CHUNK_ALIGNMENT, 0);
        ChunkId(NonZeroU64::MIN.saturating_add((offset - LOG_HEADER_SIZE) / CHUNK_ALIGNMENT))
    }

    /// File offset of the chunk header, `None` if the id cannot be addressed
    pub(crate) fn to_offset(self) -> Option<u64> {
        (self.get() - 1)
            .checked_mul(CHUNK_ALIGNMENT)?
            .checked_add(LOG_HEADER_SIZE)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Chunk Header
// =============================================================================

/// Chunk kind and size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Payload written in full at creation
    Fixed { length: u32 },

    /// Payload grows through appends up to `capacity`
    Appendable { capacity: u16 },
}

impl ChunkKind {
    /// Bytes reserved for the payload
    pub fn capacity(&self) -> usize {
        match *self {
            ChunkKind::Fixed { length } => length as usize,
            ChunkKind::Appendable { capacity } => capacity as usize,
        }
    }

    pub fn is_appendable(&self) -> bool {
        matches!(self, ChunkKind::Appendable { .. })
    }
}

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub kind: ChunkKind,
    pub has_next_field: bool,
    /// Payload bytes covered by `crc`; equals the length for fixed chunks
    pub committed: u32,
    pub crc: u32,
}

/// Outcome of decoding a header slot
pub(crate) enum HeaderStatus {
    Valid(ChunkHeader),
    /// All-zero tag: the slot was never written
    Unwritten,
    Malformed(String),
}

impl ChunkHeader {
    pub fn fixed(payload: &[u8], has_next_field: bool) -> Self {
        Self {
            kind: ChunkKind::Fixed {
                length: payload.len() as u32,
            },
            has_next_field,
            committed: payload.len() as u32,
            crc: crc32fast::hash(payload),
        }
    }

    pub fn appendable(capacity: u16, has_next_field: bool) -> Self {
        Self {
            kind: ChunkKind::Appendable { capacity },
            has_next_field,
            committed: 0,
            crc: 0,
        }
    }

    fn tag(&self) -> u8 {
        let mut tag = TAG_BASE;
        if self.kind.is_appendable() {
            tag |= TAG_APPENDABLE;
        }
        if self.has_next_field {
            tag |= TAG_HAS_NEXT;
        }
        tag
    }

    /// Size field covered by the check byte: length or capacity
    fn size_field(&self) -> u32 {
        match self.kind {
            ChunkKind::Fixed { length } => length,
            ChunkKind::Appendable { capacity } => u32::from(capacity),
        }
    }

    pub fn payload_offset(&self, chunk_offset: u64) -> u64 {
        let link = if self.has_next_field {
            NEXT_ID_FIELD_SIZE as u64
        } else {
            0
        };
        chunk_offset + CHUNK_HEADER_SIZE as u64 + link
    }

    /// Bytes the chunk occupies in the file, alignment padding included
    pub fn total_length(&self) -> u64 {
        let raw = self.payload_offset(0) + self.kind.capacity() as u64;
        raw.div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT
    }

    pub fn remaining(&self) -> usize {
        self.kind.capacity() - self.committed as usize
    }

    pub fn encode(&self, chunk_offset: u64) -> [u8; CHUNK_HEADER_SIZE] {
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        let tag = self.tag();
        raw[OFFSET_TAG] = tag;
        raw[OFFSET_CHECK] = check_byte(tag, self.size_field(), chunk_offset);
        match self.kind {
            ChunkKind::Fixed { length } => put_u32(&mut raw, OFFSET_SIZE, length),
            ChunkKind::Appendable { capacity } => {
                put_u16(&mut raw, OFFSET_CAPACITY, capacity);
                put_u32(&mut raw, OFFSET_SIZE, self.committed);
            }
        }
        put_u32(&mut raw, OFFSET_CRC, self.crc);
        raw
    }

    pub fn decode(raw: &[u8; CHUNK_HEADER_SIZE], chunk_offset: u64) -> HeaderStatus {
        let tag = raw[OFFSET_TAG];
        if tag == 0 {
            return HeaderStatus::Unwritten;
        }
        if tag & TAG_BASE_MASK != TAG_BASE {
            return HeaderStatus::Malformed(format!(
                "chunk at offset {}: unknown tag 0x{:02x}",
                chunk_offset, tag
            ));
        }
        if get_u32(raw, OFFSET_RESERVED) != 0 {
            return HeaderStatus::Malformed(format!(
                "chunk at offset {}: reserved header bytes are set",
                chunk_offset
            ));
        }

        let has_next_field = tag & TAG_HAS_NEXT != 0;
        let crc = get_u32(raw, OFFSET_CRC);
        let header = if tag & TAG_APPENDABLE != 0 {
            let capacity = get_u16(raw, OFFSET_CAPACITY);
            let committed = get_u32(raw, OFFSET_SIZE);
            if capacity == 0 || committed > u32::from(capacity) {
                return HeaderStatus::Malformed(format!(
                    "chunk at offset {}: committed {} outside capacity {}",
                    chunk_offset, committed, capacity
                ));
            }
            ChunkHeader {
                kind: ChunkKind::Appendable { capacity },
                has_next_field,
                committed,
                crc,
            }
        } else {
            let length = get_u32(raw, OFFSET_SIZE);
            if get_u16(raw, OFFSET_CAPACITY) != 0 || length == 0 || length as usize > MAX_FIXED_PAYLOAD
            {
                return HeaderStatus::Malformed(format!(
                    "chunk at offset {}: invalid fixed length {}",
                    chunk_offset, length
                ));
            }
            ChunkHeader {
                kind: ChunkKind::Fixed { length },
                has_next_field,
                committed: length,
                crc,
            }
        };

        if raw[OFFSET_CHECK] != check_byte(tag, header.size_field(), chunk_offset) {
            return HeaderStatus::Malformed(format!(
                "chunk at offset {}: header check byte mismatch",
                chunk_offset
            ));
        }
        HeaderStatus::Valid(header)
    }
}

/// Binds the immutable header fields to the chunk's position
fn check_byte(tag: u8, size_field: u32, chunk_offset: u64) -> u8 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&size_field.to_le_bytes());
    hasher.update(&chunk_offset.to_le_bytes());
    (hasher.finalize() & 0xFF) as u8
}

// =============================================================================
// Chunk Handle
// =============================================================================

/// Handle to one chunk of a `ChunkedLog`
///
/// Obtained from `ChunkedLog::append*`, `ChunkedLog::read` or a scan. The
/// handle caches the immutable part of the header; the committed size of an
/// appendable chunk is re-read from the file on every call.
pub struct LogChunk<'a> {
    log: &'a ChunkedLog,
    id: ChunkId,
    offset: u64,
    header: ChunkHeader,
}

impl<'a> LogChunk<'a> {
    pub(crate) fn new(log: &'a ChunkedLog, offset: u64, header: ChunkHeader) -> Self {
        Self {
            log,
            id: ChunkId::from_offset(offset),
            offset,
            header,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn kind(&self) -> ChunkKind {
        self.header.kind
    }

    pub fn capacity(&self) -> usize {
        self.header.kind.capacity()
    }

    pub fn is_appendable(&self) -> bool {
        self.header.kind.is_appendable()
    }

    pub fn has_next_chunk_id_field(&self) -> bool {
        self.header.has_next_field
    }

    /// File offset of the chunk header
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes the chunk occupies in the file
    pub fn total_length(&self) -> u64 {
        self.header.total_length()
    }

    /// Free payload bytes; always 0 for fixed chunks
    pub fn remaining(&self) -> Result<usize> {
        if !self.is_appendable() {
            return Ok(0);
        }
        Ok(self.current_header()?.remaining())
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.remaining()? == 0)
    }

    /// Committed payload, verified against the header CRC
    pub fn read(&self) -> Result<Bytes> {
        self.log.check_open()?;
        let header = self.current_header()?;
        let mut payload = vec![0u8; header.committed as usize];
        read_exact_at(self.log.file(), &mut payload, header.payload_offset(self.offset))
            .map_err(|e| self.corruption(format!("payload unreadable: {}", e)))?;

        if crc32fast::hash(&payload) != header.crc {
            return Err(self.corruption("payload checksum mismatch".to_string()));
        }
        Ok(Bytes::from(payload))
    }

    /// Append one record of exactly `record_size` bytes
    ///
    /// The writer fills the whole slice. Returns `Ok(false)` without calling
    /// the writer when the chunk is fixed or too full for the record.
    pub fn append<F>(&self, record_size: usize, writer: F) -> Result<bool>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        if !self.is_appendable() || record_size == 0 {
            return Ok(false);
        }
        self.log.check_open()?;

        let _guard = self.log.append_lock().lock();
        let mut header = self.current_header()?;
        if record_size > header.remaining() {
            return Ok(false);
        }

        let mut record = vec![0u8; record_size];
        writer(&mut record)?;

        let position = header.payload_offset(self.offset) + u64::from(header.committed);
        write_all_at(self.log.file(), &record, position)?;

        let mut hasher = crc32fast::Hasher::new_with_initial(header.crc);
        hasher.update(&record);
        header.crc = hasher.finalize();
        header.committed += record_size as u32;
        write_all_at(self.log.file(), &header.encode(self.offset), self.offset)?;

        self.log.note_write()?;
        Ok(true)
    }

    /// Forward link, `None` while unset or when the chunk has no link field
    pub fn next_chunk_id(&self) -> Result<Option<ChunkId>> {
        if !self.header.has_next_field {
            return Ok(None);
        }
        Ok(ChunkId::new(self.read_link()?))
    }

    /// Set the forward link once
    ///
    /// Returns `Ok(false)` if a link is already present.
    pub fn set_next_chunk_id(&self, next: ChunkId) -> Result<bool> {
        if !self.header.has_next_field {
            return Err(DurableError::Usage(format!(
                "chunk {} was not created with a next chunk id field",
                self.id
            )));
        }
        self.log.check_open()?;

        let _guard = self.log.append_lock().lock();
        if self.read_link()? != 0 {
            return Ok(false);
        }
        let mut raw = [0u8; NEXT_ID_FIELD_SIZE];
        put_u64(&mut raw, 0, next.get());
        write_all_at(
            self.log.file(),
            &raw,
            self.offset + CHUNK_HEADER_SIZE as u64,
        )?;
        self.log.note_write()?;
        Ok(true)
    }

    fn read_link(&self) -> Result<u64> {
        let mut raw = [0u8; NEXT_ID_FIELD_SIZE];
        read_exact_at(self.log.file(), &mut raw, self.offset + CHUNK_HEADER_SIZE as u64)
            .map_err(|e| self.corruption(format!("link field unreadable: {}", e)))?;
        Ok(get_u64(&raw, 0))
    }

    fn current_header(&self) -> Result<ChunkHeader> {
        if !self.is_appendable() {
            return Ok(self.header);
        }
        self.log.read_header_at(self.offset)
    }

    fn corruption(&self, reason: String) -> DurableError {
        DurableError::LogCorruption(format!(
            "[{}] chunk {}: {}",
            self.log.path().display(),
            self.id,
            reason
        ))
    }
}

impl fmt::Debug for LogChunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogChunk")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("kind", &self.header.kind)
            .field("has_next_field", &self.header.has_next_field)
            .finish()
    }
}
