use std::time::SystemTime;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::{HashAlgorithm, Key};
use super::value::{Value, ValueHandle};

/// The body of a scoped read: called with the stored value (and its labels,
/// when requested) while the location guarantees the handle stays valid.
pub type ReadBody<'a> =
    &'a mut dyn FnMut(&mut ValueHandle, Option<&Labels>) -> Result<(), StorageError>;

/// The body of a scoped write: called with the committed value.
pub type WriteBody<'a> = &'a mut dyn FnMut(&mut ValueHandle) -> Result<(), StorageError>;

/// A snapshot of one stored entry, as yielded by [`Location::contents`].
pub struct Entry {
    pub key: Key,
    pub last_used: Option<SystemTime>,
    pub labels: Option<Labels>,
}

/// A backend that stores `key -> bytes [+ labels]`.
///
/// Reads and writes are scoped: the location invokes the caller's body while
/// it holds the per-key lock and guarantees the yielded handle is valid, and
/// releases all resources on every exit path.
///
/// Outcome conventions:
/// - `read` returns `Ok(true)` when the key was found and the body ran to
///   completion, `Ok(false)` on a miss (the body never runs).
/// - `write` returns `Ok(true)` when the value was stored (or already
///   present and verified identical), `Ok(false)` when the location refuses
///   the write (read-only, quota, size cap).
/// - a body that detects invalid content returns
///   [`StorageError::Corruption`]; the owning location quarantines the entry
///   and propagates the error, composers stop probing on it, and the facades
///   convert it into a miss.
///
/// The default `write`/`delete`/`touch` refuse, which is the whole
/// implementation of a read-only location.
pub trait Location: Send + Sync {
    /// The digest algorithm, if this location is bound to one. `None` means
    /// agnostic (e.g. a proxy or a plain byte store).
    fn hash(&self) -> Option<HashAlgorithm> {
        None
    }

    /// The exact key size in bytes, when the layout fixes one.
    fn key_size(&self) -> Option<usize> {
        None
    }

    fn read(
        &self,
        key: &Key,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<bool, StorageError>;

    fn write(
        &self,
        _key: &Key,
        _value: &mut Value,
        _labels: Option<&Labels>,
        _body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn delete(&self, _key: &Key) -> Result<bool, StorageError> {
        Ok(false)
    }

    /// Updates the key's last-used time without reading the payload.
    fn touch(&self, _key: &Key) -> Result<bool, StorageError> {
        Ok(false)
    }

    /// Probes several keys, returning `(key, present)` pairs. The default
    /// routes through `read`, which lets composed locations keep their
    /// side effects (usage touches, replication).
    fn read_batch(&self, keys: &[Key]) -> Result<Vec<(Key, bool)>, StorageError> {
        let mut probed = Vec::with_capacity(keys.len());
        for key in keys {
            let present = self.read(key, false, &mut |_, _| Ok(()))?;
            probed.push((key.clone(), present));
        }
        Ok(probed)
    }

    /// Enumerates the stored entries, for inspection and garbage
    /// collection.
    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        Box::new(std::iter::empty())
    }
}

impl dyn Location + '_ {
    /// Reads the whole value into memory; `Ok(None)` on a miss.
    pub fn read_bytes(&self, key: &Key) -> Result<Option<bytes::Bytes>, StorageError> {
        let mut out = None;
        let found = self.read(key, false, &mut |value, _| {
            out = Some(value.to_bytes()?);
            Ok(())
        })?;
        Ok(if found { out } else { None })
    }

    /// Writes without inspecting the committed handle; returns whether a
    /// location accepted the value.
    pub fn write_value(
        &self,
        key: &Key,
        value: &mut Value,
        labels: Option<&Labels>,
    ) -> Result<bool, StorageError> {
        self.write(key, value, labels, &mut |_| Ok(()))
    }
}

/// Verifies that the locations composed into one graph agree on the digest
/// algorithm and key size; returns the common ones.
pub fn merge_location_traits<'a>(
    locations: impl Iterator<Item = &'a dyn Location>,
) -> Result<(Option<HashAlgorithm>, Option<usize>), StorageError> {
    let mut hash = None;
    let mut key_size = None;
    for location in locations {
        if let Some(this) = location.hash() {
            match hash {
                None => hash = Some(this),
                Some(other) if other != this => {
                    return Err(StorageError::Config(format!(
                        "mixed hash algorithms in one graph: {} vs {}",
                        other.name(),
                        this.name()
                    )))
                }
                _ => {}
            }
        }
        if let Some(this) = location.key_size() {
            match key_size {
                None => key_size = Some(this),
                Some(other) if other != this => {
                    return Err(StorageError::Config(format!(
                        "mixed key sizes in one graph: {} vs {}",
                        other, this
                    )))
                }
                _ => {}
            }
        }
    }
    Ok((hash, key_size))
}
