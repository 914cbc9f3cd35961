use std::sync::Arc;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::{HashAlgorithm, Key};
use super::location::{merge_location_traits, Entry, Location, ReadBody, WriteBody};
use super::value::Value;

/// Horizontal sharding: several locations presented as alternatives.
///
/// Reads probe the children in declared order, first hit wins. Writes go to
/// the first child that accepts; a child that refuses is passed over, and a
/// buffered value is re-seeked so the next child sees a fresh stream.
pub struct Fanout {
    locations: Vec<Arc<dyn Location>>,
    hash: Option<HashAlgorithm>,
    key_size: Option<usize>,
}

impl Fanout {
    pub fn new(locations: Vec<Arc<dyn Location>>) -> Result<Self, StorageError> {
        let (hash, key_size) =
            merge_location_traits(locations.iter().map(|location| location.as_ref()))?;
        Ok(Fanout { locations, hash, key_size })
    }
}

impl Location for Fanout {
    fn hash(&self) -> Option<HashAlgorithm> {
        self.hash
    }

    fn key_size(&self) -> Option<usize> {
        self.key_size
    }

    fn read(
        &self,
        key: &Key,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<bool, StorageError> {
        for location in &self.locations {
            if location.read(key, want_labels, &mut *body)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn write(
        &self,
        key: &Key,
        value: &mut Value,
        labels: Option<&Labels>,
        body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        let position = value.stream_position()?;
        for location in &self.locations {
            if location.write(key, value, labels, &mut *body)? {
                return Ok(true);
            }
            if let Some(position) = position {
                value.seek_to(position)?;
            }
        }
        Ok(false)
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        let mut deleted = false;
        for location in &self.locations {
            deleted |= location.delete(key)?;
        }
        Ok(deleted)
    }

    fn touch(&self, key: &Key) -> Result<bool, StorageError> {
        let mut touched = false;
        for location in &self.locations {
            touched |= location.touch(key)?;
        }
        Ok(touched)
    }

    /// Carries the remaining-keys set across children, so a key found early
    /// is not probed again downstream.
    fn read_batch(&self, keys: &[Key]) -> Result<Vec<(Key, bool)>, StorageError> {
        let mut found = Vec::new();
        let mut remaining: Vec<Key> = keys.to_vec();

        for location in &self.locations {
            if remaining.is_empty() {
                break;
            }
            let mut missing = Vec::new();
            for (key, present) in location.read_batch(&remaining)? {
                if present {
                    found.push((key, true));
                } else {
                    missing.push(key);
                }
            }
            remaining = missing;
        }

        found.extend(remaining.into_iter().map(|key| (key, false)));
        Ok(found)
    }

    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        Box::new(self.locations.iter().flat_map(|location| location.contents()))
    }
}
