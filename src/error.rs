//! Error types for durablemap
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using DurableError
pub type Result<T> = std::result::Result<T, DurableError>;

/// Unified error type for durablemap operations
#[derive(Debug, Error)]
pub enum DurableError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    #[error("Log corruption detected: {0}")]
    LogCorruption(String),

    #[error("Index corruption detected: {0}")]
    IndexCorruption(String),

    #[error("Incompatible file format: {0}")]
    IncompatibleFormat(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid usage: {0}")]
    Usage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Storage is closed")]
    Closed,

    #[error("Storage is locked by another owner: {0}")]
    Locked(String),

    #[error("Operation cancelled")]
    Cancelled,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DurableError {
    /// True for structural inconsistencies that a full-log replay can repair
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DurableError::LogCorruption(_) | DurableError::IndexCorruption(_)
        )
    }
}

impl From<bincode::Error> for DurableError {
    fn from(e: bincode::Error) -> Self {
        DurableError::Serialization(e.to_string())
    }
}
