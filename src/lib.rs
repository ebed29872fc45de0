//! # durablemap
//!
//! A crash-resilient embedded key-value map with:
//! - A chunked append-only log holding every record
//! - An extendible hash index from key hash to log position
//! - Index recovery from the log after a crash or a lost index file
//! - Log compaction into a fresh generation
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageFactory                          │
//! │            (file layout, owner lock per map)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │          DurableMap / AppendableValuesMap                   │
//! │     (descriptors, write lock, recovery, compaction)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌───────────────┐
//!   │ ChunkedLog  │◄─────────│ Extendible    │
//!   │  {name}.log │ chunk id │ HashIndex     │
//!   └─────────────┘          │  {name}.hash  │
//!                            └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use durablemap::{DurableMap, Utf8Descriptor};
//!
//! let map = DurableMap::open("/tmp/users", Utf8Descriptor, Utf8Descriptor)?;
//! map.put(&"alice".to_string(), &"admin".to_string())?;
//! assert_eq!(map.get(&"alice".to_string())?, Some("admin".to_string()));
//! map.close()?;
//! # Ok::<(), durablemap::DurableError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod factory;
pub mod index;
pub mod lock;
pub mod log;
pub mod map;

mod file_io;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, SyncStrategy, ValueRetention};
pub use error::{DurableError, Result};
pub use factory::{MapPaths, StorageFactory};
pub use index::{ExtendibleHashIndex, IndexStats};
pub use log::{ChunkId, ChunkKind, ChunkedLog, LogChunk};
pub use map::{
    AppendableValuesMap, BincodeDescriptor, BytesDescriptor, CompactionOutcome, DataDescriptor,
    DurableMap, IndexAction, KeyDescriptor, MapState, OpenReport, RebuildReason, ReplayReport,
    U32Descriptor, U64Descriptor, Utf8Descriptor,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of durablemap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
