//! Owner lock for map files
//!
//! A map's log and index are owned by exactly one open instance. Ownership is
//! an advisory exclusive lock on `{name}.lock`, held for the lifetime of the
//! instance and released when the handle is dropped (including on crash, when
//! the OS releases it).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{DurableError, Result};

/// Exclusive advisory lock on a map's lock file
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    /// Acquire the lock without blocking
    ///
    /// Fails with `DurableError::Locked` if another handle (in this or another
    /// process) already owns the files.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|e| {
            DurableError::Locked(format!("{} ({})", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
