//! Last-used timestamps, one marker file per key.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::StorageError;
use crate::storage::{key_to_relative, Key};

use super::fs::{adjust_permissions, create_folders, RootParams};

const MARKER_LEVELS: [i64; 2] = [1, -1];

pub trait UsageTracker: Send + Sync {
    /// Updates the usage time for a given key.
    fn update(&self, key: &Key) -> Result<(), StorageError>;

    /// Forgets the usage time for a given key.
    fn delete(&self, key: &Key) -> Result<(), StorageError>;

    fn get(&self, key: &Key) -> Result<Option<SystemTime>, StorageError>;
}

pub struct DummyUsage;

impl UsageTracker for DummyUsage {
    fn update(&self, _key: &Key) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete(&self, _key: &Key) -> Result<(), StorageError> {
        Ok(())
    }

    fn get(&self, _key: &Key) -> Result<Option<SystemTime>, StorageError> {
        Ok(None)
    }
}

/// Tracks usage through the mtime of an empty marker file per key.
pub struct StatUsage {
    root: PathBuf,
    params: RootParams,
}

impl StatUsage {
    pub fn new(root: PathBuf, params: RootParams) -> Self {
        StatUsage { root, params }
    }

    fn marker(&self, key: &Key) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(key_to_relative(key, &MARKER_LEVELS)?))
    }
}

impl UsageTracker for StatUsage {
    fn update(&self, key: &Key) -> Result<(), StorageError> {
        let marker = self.marker(key)?;
        let missing = !marker.exists();
        if let Some(parent) = marker.parent() {
            create_folders(parent, self.params)?;
        }
        // rewriting refreshes the mtime
        std::fs::write(&marker, b"")?;
        if missing {
            adjust_permissions(&marker, self.params, false)?;
        }
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StorageError> {
        let marker = self.marker(key)?;
        if marker.exists() {
            std::fs::remove_file(&marker)?;
        }
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<SystemTime>, StorageError> {
        let marker = self.marker(key)?;
        if !marker.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::metadata(&marker)?.modified()?))
    }
}
