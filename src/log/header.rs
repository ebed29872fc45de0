//! Log file header
//!
//! Fixed 64-byte header at the start of every log file.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DurableError, Result};
use crate::file_io::{get_u32, get_u64, put_u32, put_u64};

/// Magic bytes identifying a chunked log file
pub(crate) const LOG_MAGIC: &[u8; 4] = b"DMLG";

/// Current log format version
pub(crate) const LOG_FORMAT_VERSION: u32 = 1;

/// Header size; the first chunk starts right after it
pub const LOG_HEADER_SIZE: u64 = 64;

/// Written on open; a log found in this state on the next open was not closed
pub(crate) const STATUS_OPEN: u8 = 0;

/// Written by `close()` after everything else is synced
pub(crate) const STATUS_CLOSED: u8 = 1;

const OFFSET_MAGIC: usize = 0;
const OFFSET_FORMAT_VERSION: usize = 4;
const OFFSET_DATA_VERSION: usize = 8;
const OFFSET_STATUS: usize = 12;
const OFFSET_GENERATION: usize = 16;
const OFFSET_FRONTIER: usize = 24;
const OFFSET_CHUNKS_COUNT: usize = 32;

/// Decoded log header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogHeader {
    /// Version of the records stored in chunks, owned by the log's client
    pub data_version: u32,
    pub status: u8,
    /// Identity of this log instance; changes when compaction rewrites it
    pub generation: u64,
    /// First unallocated byte as of the last header write
    pub frontier: u64,
    pub chunks_count: u64,
}

impl LogHeader {
    pub fn new(generation: u64) -> Self {
        Self {
            data_version: 0,
            status: STATUS_OPEN,
            generation,
            frontier: LOG_HEADER_SIZE,
            chunks_count: 0,
        }
    }

    pub fn encode(&self) -> [u8; LOG_HEADER_SIZE as usize] {
        let mut raw = [0u8; LOG_HEADER_SIZE as usize];
        raw[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(LOG_MAGIC);
        put_u32(&mut raw, OFFSET_FORMAT_VERSION, LOG_FORMAT_VERSION);
        put_u32(&mut raw, OFFSET_DATA_VERSION, self.data_version);
        raw[OFFSET_STATUS] = self.status;
        put_u64(&mut raw, OFFSET_GENERATION, self.generation);
        put_u64(&mut raw, OFFSET_FRONTIER, self.frontier);
        put_u64(&mut raw, OFFSET_CHUNKS_COUNT, self.chunks_count);
        raw
    }

    pub fn decode(raw: &[u8; LOG_HEADER_SIZE as usize], path: &Path) -> Result<Self> {
        if &raw[OFFSET_MAGIC..OFFSET_MAGIC + 4] != LOG_MAGIC {
            return Err(DurableError::IncompatibleFormat(format!(
                "[{}] is not a chunked log: magic {:?}",
                path.display(),
                &raw[OFFSET_MAGIC..OFFSET_MAGIC + 4]
            )));
        }

        let version = get_u32(raw, OFFSET_FORMAT_VERSION);
        if version != LOG_FORMAT_VERSION {
            return Err(DurableError::IncompatibleFormat(format!(
                "[{}] log format version {} is not supported (current: {})",
                path.display(),
                version,
                LOG_FORMAT_VERSION
            )));
        }

        Ok(Self {
            data_version: get_u32(raw, OFFSET_DATA_VERSION),
            status: raw[OFFSET_STATUS],
            generation: get_u64(raw, OFFSET_GENERATION),
            frontier: get_u64(raw, OFFSET_FRONTIER),
            chunks_count: get_u64(raw, OFFSET_CHUNKS_COUNT),
        })
    }
}

static GENERATION_SALT: AtomicU64 = AtomicU64::new(0);

/// Fresh, non-zero generation for a newly created log
pub(crate) fn new_generation() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = GENERATION_SALT.fetch_add(1, Ordering::Relaxed);
    let pid = u64::from(std::process::id());

    let generation = nanos ^ (pid << 40) ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    generation.max(1)
}
