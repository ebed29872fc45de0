//! Map Module
//!
//! Typed maps built from a chunked log and an extendible hash index.
//!
//! ## Responsibilities
//! - Encode keys and values through descriptors
//! - Append records to the log, then point the index at them
//! - Resolve hash collisions by comparing stored keys
//! - Bring the index in line with the log on open (rebuild or catch-up)
//! - Compact the log into a fresh generation
//!
//! ## Write Path
//! ```text
//! put(k, v) ──► encode ──► log.append_fixed(Put record) ──► chunk id
//!                                                             │
//!               index.insert / replace(hash(k), chunk id) ◄───┘
//! ```
//!
//! ## Read Path
//! ```text
//! get(k) ──► index.lookup(hash(k)) ──► candidate chunk ids
//!                                        │
//!            log.read(id) ──► decode ──► stored key == k ? ──► value
//! ```

mod appendable;
mod base;
mod descriptor;
mod durable_map;
mod record;
mod recovery;

pub use appendable::AppendableValuesMap;
pub use base::MapState;
pub use descriptor::{
    hash_bytes, BincodeDescriptor, BytesDescriptor, DataDescriptor, KeyDescriptor, U32Descriptor,
    U64Descriptor, Utf8Descriptor,
};
pub use durable_map::{CompactionOutcome, DurableMap};
pub use recovery::{IndexAction, OpenReport, RebuildReason, ReplayReport};
