//! Storage factory
//!
//! Owns the file layout of every map under one data directory and opens
//! maps, logs and indexes by name.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::{DurableError, Result};
use crate::index::ExtendibleHashIndex;
use crate::lock::FileLock;
use crate::log::ChunkedLog;
use crate::map::{AppendableValuesMap, DataDescriptor, DurableMap, KeyDescriptor};

/// Files backing one map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapPaths {
    pub log: PathBuf,
    pub index: PathBuf,
    pub lock: PathBuf,
    /// Log being written by an in-progress compaction
    pub compacting_log: PathBuf,
    /// Index being written by an in-progress compaction
    pub compacting_index: PathBuf,
}

impl MapPaths {
    /// Paths for the map whose files start with `base` (`base.log`, ...)
    pub fn from_base(base: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(base.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            log: with_suffix(".log"),
            index: with_suffix(".hash"),
            lock: with_suffix(".lock"),
            compacting_log: with_suffix(".log.compacting"),
            compacting_index: with_suffix(".hash.compacting"),
        }
    }

    /// Delete leftovers of an interrupted compaction; returns how many existed
    pub(crate) fn remove_compaction_files(&self) -> Result<usize> {
        let mut removed = 0;
        for path in [&self.compacting_log, &self.compacting_index] {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

/// Opens maps by name inside `Config::data_dir`
///
/// The factory holds no open handles; each map owns its files through the
/// exclusive lock on `{name}.lock`.
#[derive(Debug, Clone)]
pub struct StorageFactory {
    config: Config,
}

impl StorageFactory {
    /// Validate the config and create the data directory
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        info!(data_dir = %config.data_dir.display(), "Storage factory ready");
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// File layout of the map called `name`
    pub fn paths(&self, name: &str) -> Result<MapPaths> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0');
        if !valid {
            return Err(DurableError::Usage(format!(
                "invalid map name {:?}: must be a plain file name",
                name
            )));
        }
        Ok(MapPaths::from_base(&self.config.data_dir.join(name)))
    }

    /// Open or create a key/value map
    pub fn open_map<KD, VD>(
        &self,
        name: &str,
        key_descriptor: KD,
        value_descriptor: VD,
    ) -> Result<DurableMap<KD, VD>>
    where
        KD: KeyDescriptor,
        VD: DataDescriptor,
    {
        DurableMap::open_with(
            self.paths(name)?,
            self.config.clone(),
            key_descriptor,
            value_descriptor,
        )
    }

    /// Open or create a map where each key accumulates a list of values
    pub fn open_values_map<KD, VD>(
        &self,
        name: &str,
        key_descriptor: KD,
        value_descriptor: VD,
    ) -> Result<AppendableValuesMap<KD, VD>>
    where
        KD: KeyDescriptor,
        VD: DataDescriptor,
    {
        AppendableValuesMap::open_with(
            self.paths(name)?,
            self.config.clone(),
            key_descriptor,
            value_descriptor,
        )
    }

    /// Open the raw chunked log `{name}.log`
    ///
    /// The caller is responsible for not opening a log that a map owns.
    pub fn open_log(&self, name: &str) -> Result<ChunkedLog> {
        ChunkedLog::open(&self.paths(name)?.log, self.config.sync_strategy)
    }

    /// Open the raw index `{name}.hash`
    pub fn open_index(&self, name: &str) -> Result<ExtendibleHashIndex> {
        ExtendibleHashIndex::open(&self.paths(name)?.index, self.config.index_segment_size)
    }

    /// Delete every file of the map called `name`
    ///
    /// Fails with `Locked` while the map is open.
    pub fn delete_files(&self, name: &str) -> Result<()> {
        let paths = self.paths(name)?;
        let lock = FileLock::acquire(&paths.lock)?;

        paths.remove_compaction_files()?;
        for path in [&paths.log, &paths.index] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(lock);
        match fs::remove_file(&paths.lock) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(name, "Deleted map files");
        Ok(())
    }
}
