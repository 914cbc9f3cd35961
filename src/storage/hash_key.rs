use std::sync::Arc;

use bytes::Bytes;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::{digest_value, HashAlgorithm, Key};
use super::fanout::Fanout;
use super::levels::{Level, Levels};
use super::location::{merge_location_traits, Location};
use super::value::{Value, ValueHandle};

/// The digest-on-write facade: values go in, keys come out.
///
/// Writes stream the value once through the digest algorithm and store it
/// under the resulting key in the local location. Reads probe local first
/// and optionally fall through to the remotes, replicating hits back into
/// local on the way out.
pub struct HashKeyStorage {
    local: Arc<dyn Location>,
    full: Levels,
    algorithm: HashAlgorithm,
}

impl HashKeyStorage {
    pub fn new(
        local: Arc<dyn Location>,
        remotes: Vec<Arc<dyn Location>>,
    ) -> Result<Self, StorageError> {
        Self::construct(local, remotes, None)
    }

    pub fn with_algorithm(
        local: Arc<dyn Location>,
        remotes: Vec<Arc<dyn Location>>,
        algorithm: HashAlgorithm,
    ) -> Result<Self, StorageError> {
        Self::construct(local, remotes, Some(algorithm))
    }

    fn construct(
        local: Arc<dyn Location>,
        remotes: Vec<Arc<dyn Location>>,
        algorithm: Option<HashAlgorithm>,
    ) -> Result<Self, StorageError> {
        let remote = Arc::new(Fanout::new(remotes)?);

        let graph: [&dyn Location; 2] = [local.as_ref(), remote.as_ref() as &dyn Location];
        let (inferred, _) = merge_location_traits(graph.iter().copied())?;

        let algorithm = match (algorithm, inferred) {
            (Some(explicit), Some(inferred)) if explicit != inferred => {
                return Err(StorageError::Config(format!(
                    "the requested algorithm {} doesn't match the locations' {}",
                    explicit.name(),
                    inferred.name()
                )))
            }
            (Some(explicit), _) => explicit,
            (None, Some(inferred)) => inferred,
            (None, None) => {
                return Err(StorageError::Config(
                    "no hash algorithm: neither the locations define one, nor was one passed explicitly"
                        .into(),
                ))
            }
        };

        let full = Levels::new(vec![
            Level::new(Arc::clone(&local)),
            Level::new(remote),
        ])?;

        Ok(HashKeyStorage { local, full, algorithm })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest_size(&self) -> usize {
        self.algorithm.digest_size()
    }

    /// Digests and stores a value; fails with `Write` if no storage
    /// accepts it.
    pub fn write(
        &self,
        value: impl Into<Value>,
        labels: Option<&Labels>,
    ) -> Result<Key, StorageError> {
        let (digest, written) = self.write_impl(value.into(), labels)?;
        if written {
            Ok(digest)
        } else {
            Err(StorageError::Write(format!(
                "the value {} couldn't be written to any storage",
                digest
            )))
        }
    }

    /// Like [`write`](Self::write), but a total refusal yields `None`.
    pub fn try_write(
        &self,
        value: impl Into<Value>,
        labels: Option<&Labels>,
    ) -> Result<Option<Key>, StorageError> {
        let (digest, written) = self.write_impl(value.into(), labels)?;
        Ok(if written { Some(digest) } else { None })
    }

    fn write_impl(
        &self,
        mut value: Value,
        labels: Option<&Labels>,
    ) -> Result<(Key, bool), StorageError> {
        let digest = digest_value(&mut value, self.algorithm)?;
        let written = self.local.write_value(&digest, &mut value, labels)?;
        Ok((digest, written))
    }

    /// Runs `body` over the stored value; a miss is an error.
    pub fn read<R>(
        &self,
        key: &Key,
        body: impl FnOnce(&mut ValueHandle) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        match self.read_impl(key, true, body)? {
            Some(result) => Ok(result),
            None => Err(StorageError::Read(format!("the key {} is not found", key))),
        }
    }

    /// Runs `body` over the stored value; a miss yields `None`.
    pub fn try_read<R>(
        &self,
        key: &Key,
        body: impl FnOnce(&mut ValueHandle) -> Result<R, StorageError>,
    ) -> Result<Option<R>, StorageError> {
        self.read_impl(key, true, body)
    }

    /// Probes only the local side, without fetching from remotes.
    pub fn try_read_local<R>(
        &self,
        key: &Key,
        body: impl FnOnce(&mut ValueHandle) -> Result<R, StorageError>,
    ) -> Result<Option<R>, StorageError> {
        self.read_impl(key, false, body)
    }

    fn read_impl<R>(
        &self,
        key: &Key,
        fetch: bool,
        body: impl FnOnce(&mut ValueHandle) -> Result<R, StorageError>,
    ) -> Result<Option<R>, StorageError> {
        let location: &dyn Location =
            if fetch { &self.full } else { self.local.as_ref() };

        let mut body = Some(body);
        let mut result = None;
        let found = location.read(key, false, &mut |value, _| {
            let body = body.take().expect("a read body runs at most once");
            result = Some(body(value)?);
            Ok(())
        });

        match found {
            Ok(true) => Ok(result),
            Ok(false) => Ok(None),
            // the entry was quarantined under us: a miss
            Err(err) if err.is_corruption() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads the whole value into memory; a miss is an error.
    pub fn read_bytes(&self, key: &Key) -> Result<Bytes, StorageError> {
        self.read(key, |value| Ok(value.to_bytes()?))
    }

    /// Presence probe over local and remotes, for migrations.
    pub fn fetch(&self, keys: &[Key]) -> Result<Vec<(Key, bool)>, StorageError> {
        self.full.read_batch(keys)
    }
}
