//! Chunked Append-Only Log Module
//!
//! Stores variable-length records in self-describing chunks.
//!
//! ## Responsibilities
//! - Allocate fixed and appendable chunks at the write frontier
//! - CRC32 checksums over every committed payload
//! - Chunk ids derived from file offsets (no lookup table)
//! - Tail recovery after an unclean shutdown
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                        │
//! │ magic │ format ver │ data ver │ status │ generation │    │
//! │ frontier │ chunk count                                   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Chunk 1 (8-byte aligned)                                 │
//! │ ┌─────┬───────┬──────────┬───────────┬─────┬──────────┐  │
//! │ │ tag │ check │ capacity │ size/used │ crc │ reserved │  │
//! │ └─────┴───────┴──────────┴───────────┴─────┴──────────┘  │
//! │ [next chunk id (8)]  payload ...  padding                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Chunk 2 ...                                              │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod chunk;
mod chunked_log;
mod header;

pub use chunk::{
    ChunkId, ChunkKind, LogChunk, CHUNK_ALIGNMENT, CHUNK_HEADER_SIZE, MAX_APPENDABLE_CAPACITY,
    MAX_FIXED_PAYLOAD, NEXT_ID_FIELD_SIZE,
};
pub use chunked_log::{ChunkedLog, LogRecovery, ScanOutcome, TornChunk};
pub use header::LOG_HEADER_SIZE;
