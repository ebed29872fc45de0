//! Configuration for durablemap
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{DurableError, Result};

/// Main configuration shared by every map opened through a `StorageFactory`
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all map files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {name}.log       (chunked append-only log)
    ///     ├── {name}.hash      (extendible hash index)
    ///     └── {name}.lock      (owner lock)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the log
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Size of one index segment in bytes (power of two)
    pub index_segment_size: usize,

    // -------------------------------------------------------------------------
    // Appendable-values Configuration
    // -------------------------------------------------------------------------
    /// Initial payload capacity of a key's head chunk
    pub values_chunk_capacity: usize,

    /// Which values survive compaction of an appendable-values map
    pub value_retention: ValueRetention,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every log write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced log writes (balanced durability/performance)
    EveryNWrites { count: usize },

    /// fsync only on explicit flush/close
    Manual,
}

/// Value history policy applied when an appendable-values map is compacted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRetention {
    /// Keep every value ever appended for a live key
    FullHistory,

    /// Keep only the most recently appended value
    LatestOnly,
}

/// Smallest accepted index segment
pub const MIN_SEGMENT_SIZE: usize = 512;

/// Largest accepted index segment
pub const MAX_SEGMENT_SIZE: usize = 1 << 20;

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./durablemap_data"),
            sync_strategy: SyncStrategy::EveryNWrites { count: 100 },
            index_segment_size: 32 * 1024, // 32 KB
            values_chunk_capacity: 64,
            value_retention: ValueRetention::FullHistory,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check values that would otherwise fail deep inside the storage layers
    pub fn validate(&self) -> Result<()> {
        let size = self.index_segment_size;
        if !size.is_power_of_two() || !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
            return Err(DurableError::Config(format!(
                "index_segment_size(={}) must be a power of two in [{}, {}]",
                size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if self.values_chunk_capacity == 0 {
            return Err(DurableError::Config(
                "values_chunk_capacity must be > 0".to_string(),
            ));
        }
        if let SyncStrategy::EveryNWrites { count: 0 } = self.sync_strategy {
            return Err(DurableError::Config(
                "EveryNWrites count must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all map files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the log sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the index segment size (in bytes)
    pub fn index_segment_size(mut self, size: usize) -> Self {
        self.config.index_segment_size = size;
        self
    }

    /// Set the initial head chunk capacity for appendable-values maps
    pub fn values_chunk_capacity(mut self, capacity: usize) -> Self {
        self.config.values_chunk_capacity = capacity;
        self
    }

    /// Set the compaction value retention policy
    pub fn value_retention(mut self, retention: ValueRetention) -> Self {
        self.config.value_retention = retention;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
