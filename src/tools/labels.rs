//! Set-of-strings metadata per key, stored as JSON arrays.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::StorageError;
use crate::storage::{key_to_relative, Key};

use super::fs::{adjust_permissions, create_folders, RootParams};

const LABEL_LEVELS: [i64; 2] = [1, -1];

/// An unordered set of short strings attached to a key. Metadata only,
/// never part of the digest.
pub type Labels = BTreeSet<String>;

pub trait LabelsStorage: Send + Sync {
    /// Merges `labels` into the stored set. Label sets only grow.
    fn update(&self, key: &Key, labels: Option<&Labels>) -> Result<(), StorageError>;

    fn delete(&self, key: &Key) -> Result<(), StorageError>;

    fn get(&self, key: &Key) -> Result<Option<Labels>, StorageError>;
}

pub struct DummyLabels;

impl LabelsStorage for DummyLabels {
    fn update(&self, _key: &Key, _labels: Option<&Labels>) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete(&self, _key: &Key) -> Result<(), StorageError> {
        Ok(())
    }

    fn get(&self, _key: &Key) -> Result<Option<Labels>, StorageError> {
        Ok(None)
    }
}

pub struct JsonLabels {
    root: PathBuf,
    params: RootParams,
}

impl JsonLabels {
    pub fn new(root: PathBuf, params: RootParams) -> Self {
        JsonLabels { root, params }
    }

    fn file(&self, key: &Key) -> Result<PathBuf, StorageError> {
        let mut path = self.root.join(key_to_relative(key, &LABEL_LEVELS)?);
        path.set_extension("json");
        Ok(path)
    }
}

impl LabelsStorage for JsonLabels {
    fn update(&self, key: &Key, labels: Option<&Labels>) -> Result<(), StorageError> {
        let labels = match labels {
            Some(labels) if !labels.is_empty() => labels,
            _ => return Ok(()),
        };

        let file = self.file(key)?;
        let missing = !file.exists();

        let mut merged = self.get(key)?.unwrap_or_default();
        merged.extend(labels.iter().cloned());

        if let Some(parent) = file.parent() {
            create_folders(parent, self.params)?;
        }
        let entries: Vec<&String> = merged.iter().collect();
        std::fs::write(&file, serde_json::to_vec(&entries).expect("label sets are serializable"))?;
        if missing {
            adjust_permissions(&file, self.params, false)?;
        }
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StorageError> {
        let file = self.file(key)?;
        if file.exists() {
            std::fs::remove_file(&file)?;
        }
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Labels>, StorageError> {
        let file = self.file(key)?;
        if !file.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&file)?;
        let labels: Vec<String> = serde_json::from_slice(&raw).map_err(|err| {
            StorageError::Corruption(format!("invalid label file for {}: {}", key, err))
        })?;
        Ok(Some(labels.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fs::root_params;

    fn labels(items: &[&str]) -> Labels {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn labels_only_grow() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonLabels::new(dir.path().to_owned(), root_params(dir.path()).unwrap());
        let key = Key::from_hex("ff00").unwrap();

        assert_eq!(storage.get(&key).unwrap(), None);
        storage.update(&key, Some(&labels(&["a", "b"]))).unwrap();
        storage.update(&key, Some(&labels(&["b", "c"]))).unwrap();
        storage.update(&key, None).unwrap();
        assert_eq!(storage.get(&key).unwrap(), Some(labels(&["a", "b", "c"])));

        storage.delete(&key).unwrap();
        assert_eq!(storage.get(&key).unwrap(), None);
    }
}
