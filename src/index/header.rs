//! Index header segment
//!
//! Segment 0 of the index file: format identity, log binding, live entry
//! counter and the directory.

use std::path::Path;

use crate::error::{DurableError, Result};
use crate::file_io::{get_u32, get_u64, put_u32, put_u64};

/// Magic bytes identifying an extendible hash index file
pub(crate) const INDEX_MAGIC: &[u8; 4] = b"EHIX";

/// Current index format version
pub(crate) const INDEX_FORMAT_VERSION: u32 = 1;

/// Fixed fields occupy the first bytes; the directory follows
pub(crate) const DIRECTORY_OFFSET: usize = 80;

/// Status written by flush/close once every dirty segment is on disk
pub(crate) const STATUS_PROPERLY_CLOSED: u8 = 1;

/// Status written before the first modification after open or flush
pub(crate) const STATUS_OPENED: u8 = 0;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_SEGMENT_SIZE: usize = 8;
const OFFSET_SEGMENTS_COUNT: usize = 12;
const OFFSET_GLOBAL_DEPTH: usize = 16;
const OFFSET_FILE_STATUS: usize = 17;
const OFFSET_LOG_GENERATION: usize = 24;
const OFFSET_LOG_FRONTIER: usize = 32;
const OFFSET_ENTRIES: usize = 40;

/// Deepest directory that fits in the header segment
pub(crate) fn max_global_depth(segment_size: usize) -> u8 {
    let slots = (segment_size - DIRECTORY_OFFSET) / 4;
    // floor(log2(slots))
    (usize::BITS - 1 - slots.leading_zeros()) as u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexHeader {
    pub segment_size: u32,
    /// Data segments; segment `n` (1-based) lives at `n * segment_size`
    pub segments_count: u32,
    pub global_depth: u8,
    pub file_status: u8,
    pub log_generation: u64,
    pub log_frontier: u64,
    pub entries: u64,
    /// `2^global_depth` data segment numbers, indexed by the low hash bits
    pub directory: Vec<u32>,
}

impl IndexHeader {
    /// Header of a fresh index: one data segment, depth 0, unbound
    pub fn new(segment_size: u32) -> Self {
        Self {
            segment_size,
            segments_count: 1,
            global_depth: 0,
            file_status: STATUS_PROPERLY_CLOSED,
            log_generation: 0,
            log_frontier: 0,
            entries: 0,
            directory: vec![1],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; self.segment_size as usize];
        raw[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(INDEX_MAGIC);
        put_u32(&mut raw, OFFSET_VERSION, INDEX_FORMAT_VERSION);
        put_u32(&mut raw, OFFSET_SEGMENT_SIZE, self.segment_size);
        put_u32(&mut raw, OFFSET_SEGMENTS_COUNT, self.segments_count);
        raw[OFFSET_GLOBAL_DEPTH] = self.global_depth;
        raw[OFFSET_FILE_STATUS] = self.file_status;
        put_u64(&mut raw, OFFSET_LOG_GENERATION, self.log_generation);
        put_u64(&mut raw, OFFSET_LOG_FRONTIER, self.log_frontier);
        put_u64(&mut raw, OFFSET_ENTRIES, self.entries);
        for (i, segment) in self.directory.iter().enumerate() {
            put_u32(&mut raw, DIRECTORY_OFFSET + i * 4, *segment);
        }
        raw
    }

    /// Check format identity from the fixed fields
    ///
    /// Returns the segment size recorded in the file.
    pub fn check_format(fixed: &[u8], expected_segment_size: u32, path: &Path) -> Result<u32> {
        if &fixed[OFFSET_MAGIC..OFFSET_MAGIC + 4] != INDEX_MAGIC {
            return Err(DurableError::IncompatibleFormat(format!(
                "[{}] is not an extendible hash index",
                path.display()
            )));
        }
        let version = get_u32(fixed, OFFSET_VERSION);
        if version != INDEX_FORMAT_VERSION {
            return Err(DurableError::IncompatibleFormat(format!(
                "[{}] index format version {} is not supported (current: {})",
                path.display(),
                version,
                INDEX_FORMAT_VERSION
            )));
        }
        let segment_size = get_u32(fixed, OFFSET_SEGMENT_SIZE);
        if segment_size != expected_segment_size {
            return Err(DurableError::IncompatibleFormat(format!(
                "[{}] segment size {} differs from configured {}",
                path.display(),
                segment_size,
                expected_segment_size
            )));
        }
        Ok(segment_size)
    }

    /// Decode the whole header segment; the format must already be checked
    pub fn decode(raw: &[u8], path: &Path) -> Result<Self> {
        let segment_size = get_u32(raw, OFFSET_SEGMENT_SIZE);
        let global_depth = raw[OFFSET_GLOBAL_DEPTH];
        if global_depth > max_global_depth(segment_size as usize) {
            return Err(DurableError::IndexCorruption(format!(
                "[{}] global depth {} does not fit a {}-byte header segment",
                path.display(),
                global_depth,
                segment_size
            )));
        }

        let segments_count = get_u32(raw, OFFSET_SEGMENTS_COUNT);
        let directory: Vec<u32> = (0..1usize << global_depth)
            .map(|i| get_u32(raw, DIRECTORY_OFFSET + i * 4))
            .collect();
        if let Some(bad) = directory
            .iter()
            .find(|segment| **segment == 0 || **segment > segments_count)
        {
            return Err(DurableError::IndexCorruption(format!(
                "[{}] directory points at segment {} of {}",
                path.display(),
                bad,
                segments_count
            )));
        }

        Ok(Self {
            segment_size,
            segments_count,
            global_depth,
            file_status: raw[OFFSET_FILE_STATUS],
            log_generation: get_u64(raw, OFFSET_LOG_GENERATION),
            log_frontier: get_u64(raw, OFFSET_LOG_FRONTIER),
            entries: get_u64(raw, OFFSET_ENTRIES),
            directory,
        })
    }

    pub fn directory_mask(&self) -> u64 {
        (1u64 << self.global_depth) - 1
    }
}
