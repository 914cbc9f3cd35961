use std::fs::File;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::{init_storage, load_config, StorageConfig, CONFIG_NAME};
use crate::error::StorageError;
use crate::tools::fs::{
    adjust_permissions, create_folders, free_disk_space, get_size, match_readers, random_suffix,
    remove_file, root_params, RootParams,
};
use crate::tools::{Labels, LabelsStorage, Locker, SizeTracker, UsageTracker};

use super::digest::{key_to_relative, levels_key_size, HashAlgorithm, Key};
use super::location::{Entry, Location, ReadBody, WriteBody};
use super::value::{Value, ValueHandle};

const TMP_DIR: &str = ".tmp";
const TOOLS_DIR: &str = "tools";
const LEGACY_DATA_NAME: &str = "data";

/// A filesystem-backed location.
///
/// Blobs live in a nested hex tree under the root, laid out by the
/// configured key levels. Writes stage into `.tmp` and commit with a
/// rename, so readers observe either the complete read-only file or
/// nothing. Usage markers and label files live under `tools/`.
pub struct DiskDict {
    root: PathBuf,
    tmp: PathBuf,
    levels: Vec<i64>,
    algorithm: Option<HashAlgorithm>,
    params: RootParams,
    locker: Box<dyn Locker>,
    size_tracker: Box<dyn SizeTracker>,
    usage: Box<dyn UsageTracker>,
    labels: Box<dyn LabelsStorage>,
    min_free_size: u64,
    max_size: Option<u64>,
}

impl DiskDict {
    /// Opens the store at `root`, initializing a default config
    /// (`levels: [1, -1]`, no hash) if none exists yet.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_impl(root.as_ref(), None)
    }

    /// Opens the store at `root`, verifying the key layout matches when a
    /// config already exists and seeding one otherwise.
    pub fn open_with_levels(
        root: impl AsRef<Path>,
        levels: Vec<i64>,
    ) -> Result<Self, StorageError> {
        Self::open_impl(root.as_ref(), Some(levels))
    }

    fn open_impl(root: &Path, levels: Option<Vec<i64>>) -> Result<Self, StorageError> {
        let config = if root.join(CONFIG_NAME).exists() {
            let config = load_config(root)?;
            if let Some(ref levels) = levels {
                if *levels != config.effective_levels() {
                    return Err(StorageError::Config(format!(
                        "the passed levels ({:?}) don't match the ones from the config ({:?})",
                        levels,
                        config.effective_levels()
                    )));
                }
            }
            config
        } else {
            let config = StorageConfig {
                levels: Some(levels.unwrap_or_else(|| vec![1, -1])),
                ..StorageConfig::default()
            };
            init_storage(&config, root)?;
            config
        };

        let params = root_params(root)?;
        let tmp = root.join(TMP_DIR);
        create_folders(&tmp, params)?;

        let usage_folder = root.join(TOOLS_DIR).join("usage");
        let labels_folder = root.join(TOOLS_DIR).join("labels");
        create_folders(&usage_folder, params)?;
        create_folders(&labels_folder, params)?;

        Ok(DiskDict {
            levels: config.effective_levels(),
            algorithm: config.hash,
            locker: config.make_locker()?,
            size_tracker: config.make_size()?,
            usage: config.make_usage(usage_folder, params)?,
            labels: config.make_labels(labels_folder, params)?,
            min_free_size: config.free_disk_size,
            max_size: config.max_size,
            root: root.to_owned(),
            tmp,
            params,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn levels(&self) -> &[i64] {
        &self.levels
    }

    fn key_path(&self, key: &Key) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(key_to_relative(key, &self.levels)?))
    }

    fn writeable(&self) -> Result<bool, StorageError> {
        if self.min_free_size > 0 && free_disk_space(&self.root)? < self.min_free_size {
            return Ok(false);
        }
        if let Some(max_size) = self.max_size {
            if self.size_tracker.get()? > max_size {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Byte-for-byte comparison of the stored file against the incoming
    /// value. Consumes a buffered value.
    fn matches(&self, stored: &Path, value: &mut Value) -> Result<bool, StorageError> {
        let reader = value.reader()?;
        match_readers(reader, File::open(stored)?)
    }

    fn write_locked(
        &self,
        key: &Key,
        file: &Path,
        value: &mut Value,
        labels: Option<&Labels>,
        body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        // already stored: verify and reuse
        if file.exists() {
            let mut target = file.to_owned();
            if target.is_dir() {
                target = target.join(LEGACY_DATA_NAME);
            }
            if !self.matches(&target, value)? {
                return Err(StorageError::Collision(format!(
                    "written value and the new one don't match: {}",
                    key
                )));
            }
            let mut handle = ValueHandle::File(target);
            body(&mut handle)?;
            self.labels.update(key, labels)?;
            return Ok(true);
        }

        if !self.writeable()? {
            return Ok(false);
        }

        let tmp = self.tmp.join(format!("{}{}", key.hex(), random_suffix(8)));
        let staged = (|| -> Result<(), StorageError> {
            let parent = file.parent().expect("key paths have at least one directory level");
            create_folders(parent, self.params)?;

            let mut destination = File::create(&tmp)?;
            let mut reader = value.reader()?;
            std::io::copy(&mut reader, &mut destination)?;
            drop(destination);

            adjust_permissions(&tmp, self.params, true)?;

            // the rename is the commit point
            std::fs::rename(&tmp, file)?;
            Ok(())
        })();

        if let Err(err) = staged {
            if file.exists() {
                let _ = remove_file(file);
            }
            if tmp.exists() {
                let _ = remove_file(&tmp);
            }
            return Err(StorageError::Write(format!(
                "an error occurred while copying the file: {}",
                err
            )));
        }

        self.size_tracker.inc(get_size(file)?)?;
        self.usage.update(key)?;
        self.labels.update(key, labels)?;

        let mut handle = ValueHandle::File(file.to_owned());
        body(&mut handle)?;
        Ok(true)
    }

    fn entry_snapshot(&self, key: Key) -> Result<Entry, StorageError> {
        let guard = self.locker.lock_read(key.as_bytes())?;
        let last_used = self.usage.get(&key)?;
        let labels = self.labels.get(&key)?;
        guard.release()?;
        Ok(Entry { key, last_used, labels })
    }
}

impl Location for DiskDict {
    fn hash(&self) -> Option<HashAlgorithm> {
        self.algorithm
    }

    fn key_size(&self) -> Option<usize> {
        levels_key_size(&self.levels)
    }

    fn read(
        &self,
        key: &Key,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<bool, StorageError> {
        let mut file = self.key_path(key)?;
        let guard = self.locker.lock_read(key.as_bytes())?;

        if !file.exists() {
            guard.release()?;
            return Ok(false);
        }
        if file.is_dir() {
            // legacy: payloads used to live in a per-key directory; an
            // index entry may also legitimately be a directory of files
            let data = file.join(LEGACY_DATA_NAME);
            if data.is_file() {
                file = data;
            }
        }

        self.usage.update(key)?;
        let labels = if want_labels { self.labels.get(key)? } else { None };

        let mut handle = ValueHandle::File(file);
        let outcome = body(&mut handle, labels.as_ref());
        let released = guard.release();

        match outcome {
            Ok(()) => {
                released?;
                Ok(true)
            }
            Err(err) if err.is_corruption() => {
                log::warn!("removing corrupted entry {}", key);
                self.delete(key)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn write(
        &self,
        key: &Key,
        value: &mut Value,
        labels: Option<&Labels>,
        body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        let file = self.key_path(key)?;
        let guard = self.locker.lock_write(key.as_bytes())?;
        let outcome = self.write_locked(key, &file, value, labels, body);
        let released = guard.release();

        match outcome {
            Err(err) if err.is_corruption() => {
                if file.exists() {
                    let _ = remove_file(&file);
                }
                Err(err)
            }
            Ok(outcome) => {
                released?;
                Ok(outcome)
            }
            other => other,
        }
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        let file = self.key_path(key)?;
        let guard = self.locker.lock_write(key.as_bytes())?;

        let outcome = (|| -> Result<bool, StorageError> {
            if !file.exists() {
                return Ok(false);
            }

            let size;
            if file.is_dir() {
                let data = file.join(LEGACY_DATA_NAME);
                size = if data.is_file() { get_size(&data)? } else { 0 };
                std::fs::remove_dir_all(&file)?;
            } else {
                size = get_size(&file)?;
                remove_file(&file)?;
            }

            self.size_tracker.dec(size)?;
            self.usage.delete(key)?;
            self.labels.delete(key)?;
            Ok(true)
        })();

        let released = guard.release();
        let outcome = outcome?;
        released?;
        Ok(outcome)
    }

    fn touch(&self, key: &Key) -> Result<bool, StorageError> {
        if !self.key_path(key)?.exists() {
            return Ok(false);
        }
        self.usage.update(key)?;
        Ok(true)
    }

    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        let depth = self.levels.len();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // the scratch and metadata trees are not payload
                if entry.depth() == 1 {
                    let name = entry.file_name().to_string_lossy();
                    if name == TMP_DIR || name == TOOLS_DIR || name == CONFIG_NAME {
                        return false;
                    }
                }
                true
            });

        let root = self.root.clone();
        Box::new(walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    return Some(Err(StorageError::Read(format!(
                        "walking the storage tree failed: {}",
                        err
                    ))))
                }
            };
            if entry.depth() != depth {
                return None;
            }

            let relative = entry.path().strip_prefix(&root).ok()?;
            let hex_key: String = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect();
            let key = Key::from_hex(&hex_key).ok()?;

            Some(self.entry_snapshot(key))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_a_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let disk = DiskDict::open(&root).unwrap();
        assert_eq!(disk.levels(), &[1, -1]);
        assert!(root.join(CONFIG_NAME).is_file());
        assert!(root.join(TMP_DIR).is_dir());

        // reopening honors the stored config
        drop(disk);
        let disk = DiskDict::open(&root).unwrap();
        assert_eq!(disk.levels(), &[1, -1]);
        assert!(DiskDict::open_with_levels(&root, vec![2, -1]).is_err());
    }
}
