use std::collections::BTreeMap;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{SerializerError, StorageError};
use crate::storage::{
    digest_value, HashAlgorithm, HashKeyStorage, Key, Location, Value, ValueHandle,
};
use crate::tools::Labels;

use super::serializer::Serializer;

/// The versioned fingerprinting collaborator: turns an arbitrary cache key
/// into bytes, reproducibly for a given version.
pub trait CacheKey {
    fn fingerprint(&self, version: u32) -> Vec<u8>;
}

/// The fingerprint scheme's version history. Reads that miss under
/// `current` fall back to `previous` (newest first) and migrate hits
/// forward.
#[derive(Clone, Debug)]
pub struct Versions {
    pub current: u32,
    pub previous: Vec<u32>,
}

impl Default for Versions {
    fn default() -> Self {
        Versions { current: 0, previous: Vec::new() }
    }
}

pub struct PreparedKey {
    pub digest: Key,
    pub fingerprint: Vec<u8>,
}

/// A cache keyed by arbitrary fingerprintable values.
///
/// Couples an index location (which stores, per fingerprint digest, a
/// canonical JSON mapping of relative paths to blob digests) with a
/// [`HashKeyStorage`] holding the blobs themselves.
pub struct CacheStorage<S> {
    index: Arc<dyn Location>,
    storage: HashKeyStorage,
    serializer: S,
    algorithm: HashAlgorithm,
    versions: Versions,
}

impl<S: Serializer> CacheStorage<S> {
    pub fn new(
        index: Arc<dyn Location>,
        storage: HashKeyStorage,
        serializer: S,
    ) -> Result<Self, StorageError> {
        Self::with_versions(index, storage, serializer, Versions::default())
    }

    pub fn with_versions(
        index: Arc<dyn Location>,
        storage: HashKeyStorage,
        serializer: S,
        versions: Versions,
    ) -> Result<Self, StorageError> {
        let algorithm = match index.hash() {
            Some(algorithm) => algorithm,
            None => storage.algorithm(),
        };
        Ok(CacheStorage { index, storage, serializer, algorithm, versions })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn prepare(&self, key: &impl CacheKey) -> Result<PreparedKey, StorageError> {
        self.prepare_version(key, self.versions.current)
    }

    fn prepare_version(
        &self,
        key: &impl CacheKey,
        version: u32,
    ) -> Result<PreparedKey, StorageError> {
        let fingerprint = key.fingerprint(version);
        let digest = digest_value(&mut Value::from(fingerprint.clone()), self.algorithm)?;
        Ok(PreparedKey { digest, fingerprint })
    }

    /// Serializes the value into the blob storage and records the mapping
    /// in the index; fails with `Write` when the index refuses.
    pub fn write(
        &self,
        key: &impl CacheKey,
        value: &S::Item,
        labels: Option<&Labels>,
    ) -> Result<Key, StorageError> {
        let prepared = self.prepare(key)?;
        match self.write_prepared(&prepared, value, labels)? {
            Some(digest) => Ok(digest),
            None => Err(StorageError::Write(
                "the index could not be written to any storage".into(),
            )),
        }
    }

    /// Like [`write`](Self::write), but an index refusal yields `None`.
    pub fn try_write(
        &self,
        key: &impl CacheKey,
        value: &S::Item,
        labels: Option<&Labels>,
    ) -> Result<Option<Key>, StorageError> {
        let prepared = self.prepare(key)?;
        self.write_prepared(&prepared, value, labels)
    }

    fn write_prepared(
        &self,
        prepared: &PreparedKey,
        value: &S::Item,
        labels: Option<&Labels>,
    ) -> Result<Option<Key>, StorageError> {
        let digest = &prepared.digest;
        log::info!("serializing {}", digest);

        let contents = self
            .serializer
            .save(value, &mut |chunk| self.storage.write(chunk, labels))
            .map_err(|err| match err {
                SerializerError::Storage(err) => err,
                other => StorageError::Write(format!("serialization failed: {}", other)),
            })?;

        // a reproducible mapping each time: sorted keys, canonical JSON
        let mapping: BTreeMap<String, String> = contents
            .into_iter()
            .map(|(path, key)| (path, key.hex()))
            .collect();
        let encoded = serde_json::to_vec(&mapping).expect("string maps are serializable");

        log::info!("saving {} to the index", digest);
        match self.index.write_value(digest, &mut Value::from(encoded), None) {
            Ok(true) => Ok(Some(digest.clone())),
            Ok(false) => Ok(None),
            Err(StorageError::Collision(_)) => {
                let stored = self
                    .index
                    .read_bytes(digest)?
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                    .unwrap_or_default();
                Err(StorageError::Collision(format!(
                    "old mapping: {}; new mapping: {}",
                    stored,
                    serde_json::to_string(&mapping).expect("string maps are serializable"),
                )))
            }
            Err(err) => Err(err),
        }
    }

    /// Loads the cached value; a miss is an error.
    pub fn read(&self, key: &impl CacheKey) -> Result<S::Item, StorageError> {
        let prepared = self.prepare(key)?;
        match self.read_prepared(key, &prepared)? {
            Some(value) => Ok(value),
            None => Err(StorageError::Read(format!(
                "key {} is not found",
                prepared.digest
            ))),
        }
    }

    /// Loads the cached value; a miss yields `None`.
    pub fn try_read(&self, key: &impl CacheKey) -> Result<Option<S::Item>, StorageError> {
        let prepared = self.prepare(key)?;
        self.read_prepared(key, &prepared)
    }

    fn read_prepared(
        &self,
        key: &impl CacheKey,
        prepared: &PreparedKey,
    ) -> Result<Option<S::Item>, StorageError> {
        if let Some(value) = self.read_for_digest(&prepared.digest)? {
            log::info!("key {} found", prepared.digest);
            return Ok(Some(value));
        }

        // the cache is empty, but an older fingerprint version may hold it
        for &version in self.versions.previous.iter().rev() {
            let older = self.prepare_version(key, version)?;
            if let Some(value) = self.read_for_digest(&older.digest)? {
                log::info!(
                    "key {} found under fingerprint version {}, updating",
                    prepared.digest,
                    version
                );
                // store under the current digest for faster access next time
                if let Err(err) = self.write_prepared(prepared, &value, None) {
                    log::warn!("failed to migrate {}: {}", prepared.digest, err);
                }
                return Ok(Some(value));
            }
        }

        log::info!("key {} not found", prepared.digest);
        Ok(None)
    }

    fn read_for_digest(&self, digest: &Key) -> Result<Option<S::Item>, StorageError> {
        let mut loaded = None;
        let outcome = self.index.read(digest, false, &mut |handle, _| {
            let contents = unpack_mapping(handle)?;
            match self
                .serializer
                .load(&contents, &mut |key| self.storage.read_bytes(key))
            {
                Ok(value) => {
                    loaded = Some(value);
                    Ok(())
                }
                // the referenced data is corrupted or missing: quarantine
                // the index entry
                Err(SerializerError::Deserialization(err)) => Err(StorageError::Corruption(
                    format!("the data behind {} is invalid: {}", digest, err),
                )),
                Err(SerializerError::Storage(StorageError::Read(err))) => Err(
                    StorageError::Corruption(format!("the data behind {} is gone: {}", digest, err)),
                ),
                Err(SerializerError::Storage(err)) => Err(err),
                Err(SerializerError::Unsupported(err)) => Err(StorageError::Read(format!(
                    "could not deserialize the data from key {}: {}",
                    digest, err
                ))),
            }
        });

        match outcome {
            Ok(true) => Ok(loaded),
            Ok(false) => Ok(None),
            // quarantined: the entry is gone now, report a miss
            Err(err) if err.is_corruption() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Restores the `relative path -> blob key` pairs from an index entry.
///
/// The modern form is a canonical JSON object. The legacy form is a
/// directory of files, each holding the hex digest of its blob.
fn unpack_mapping(handle: &ValueHandle) -> Result<Vec<(String, Key)>, StorageError> {
    if let ValueHandle::File(path) = handle {
        if path.is_dir() {
            let mut contents = Vec::new();
            for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
                let entry = entry.map_err(|err| {
                    StorageError::Read(format!("walking the index entry failed: {}", err))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(path)
                    .expect("walked entries live under their root")
                    .to_string_lossy()
                    .into_owned();
                let raw = std::fs::read_to_string(entry.path())?;
                let key = Key::from_hex(raw.trim()).map_err(|_| {
                    StorageError::Corruption(format!(
                        "the index entry {:?} holds no digest",
                        relative
                    ))
                })?;
                contents.push((relative, key));
            }
            return Ok(contents);
        }
    }

    let raw = handle.to_bytes()?;
    let mapping: BTreeMap<String, String> = serde_json::from_slice(&raw)
        .map_err(|err| StorageError::Corruption(format!("invalid index entry: {}", err)))?;
    mapping
        .into_iter()
        .map(|(path, hex_key)| {
            let key = Key::from_hex(&hex_key).map_err(|_| {
                StorageError::Corruption(format!("the index entry {:?} holds no digest", path))
            })?;
            Ok((path, key))
        })
        .collect()
}
