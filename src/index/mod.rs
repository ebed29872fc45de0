//! Extendible Hash Index Module
//!
//! Persistent map from 64-bit key hashes to log chunk ids.
//!
//! ## Responsibilities
//! - O(1) lookups through a directory of fixed-size segments
//! - Incremental growth: only an overflowing segment splits, and the
//!   directory doubles only when that segment is already at global depth
//! - Several chunk ids per hash, so colliding keys can coexist
//! - Binding to the log state it reflects, for recovery decisions
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────┐  offset 0
//! │ Header segment                               │
//! │ magic │ version │ segment size │ segments │  │
//! │ global depth │ status │ log generation │     │
//! │ log frontier │ entries │ directory u32[2^g]  │
//! ├──────────────────────────────────────────────┤  1 * segment_size
//! │ Data segment 1                               │
//! │ alive │ hash suffix │ local depth │          │
//! │ slots [(hash u64, chunk id u64); N]          │
//! ├──────────────────────────────────────────────┤  2 * segment_size
//! │ Data segment 2 ...                           │
//! └──────────────────────────────────────────────┘
//! ```

mod extendible;
mod header;
mod segment;

pub use extendible::{ExtendibleHashIndex, IndexStats};
