use std::sync::Arc;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::{HashAlgorithm, Key};
use super::location::{merge_location_traits, Entry, Location, ReadBody, WriteBody};
use super::value::{Value, ValueHandle};

/// One tier of a [`Levels`] composition.
pub struct Level {
    pub location: Arc<dyn Location>,
    /// Whether writes may land here.
    pub write: bool,
    /// Whether read-through replication may populate this tier.
    pub replicate: bool,
    pub name: Option<String>,
}

impl Level {
    pub fn new(location: Arc<dyn Location>) -> Self {
        Level { location, write: true, replicate: true, name: None }
    }

    pub fn read_only(mut self) -> Self {
        self.write = false;
        self
    }

    pub fn no_replicate(mut self) -> Self {
        self.replicate = false;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Vertical tiering with read-through replication.
///
/// Reads probe the tiers in priority order. A hit at tier `i` is replicated
/// into every higher-priority tier (indices `< i`) whose `replicate` flag is
/// set, through that tier's write path, before the caller's body runs; the
/// body then receives the replicated copy, or the original when every upper
/// tier refused. Labels travel with the copy. Writes land on the first
/// `write`-enabled tier that accepts.
pub struct Levels {
    levels: Vec<Level>,
    hash: Option<HashAlgorithm>,
    key_size: Option<usize>,
}

impl Levels {
    pub fn new(levels: Vec<Level>) -> Result<Self, StorageError> {
        let (hash, key_size) =
            merge_location_traits(levels.iter().map(|level| level.location.as_ref()))?;
        Ok(Levels { levels, hash, key_size })
    }

    /// All tiers writable and replicated, in the given priority order.
    pub fn flat(locations: Vec<Arc<dyn Location>>) -> Result<Self, StorageError> {
        Self::new(locations.into_iter().map(Level::new).collect())
    }

    /// Copies a value found at tier `index` into the replicating tiers
    /// above it, then hands the surviving handle to the caller's body.
    fn replicate_and_yield(
        &self,
        key: &Key,
        value: &mut ValueHandle,
        labels: Option<&Labels>,
        index: usize,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<(), StorageError> {
        let exposed = if want_labels { labels } else { None };

        for level in &self.levels[..index] {
            if !level.replicate {
                continue;
            }
            // each candidate gets a fresh source, so a refusal costs nothing
            let mut source = value.to_value();
            let written = level.location.write(key, &mut source, labels, &mut |mirrored| {
                body(mirrored, exposed)
            });
            match written {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(err) => return Err(err),
            }
        }

        body(value, exposed)
    }
}

impl Location for Levels {
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
        for (index, level) in self.levels.iter().enumerate() {
            // labels are always requested so replication can carry them
            let found = level.location.read(key, true, &mut |value, labels| {
                self.replicate_and_yield(key, value, labels, index, want_labels, &mut *body)
            })?;
            if found {
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
        for level in &self.levels {
            if !level.write {
                continue;
            }
            if level.location.write(key, value, labels, &mut *body)? {
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
        for level in &self.levels {
            if level.write {
                deleted |= level.location.delete(key)?;
            }
        }
        Ok(deleted)
    }

    fn touch(&self, key: &Key) -> Result<bool, StorageError> {
        let mut touched = false;
        for level in &self.levels {
            touched |= level.location.touch(key)?;
        }
        Ok(touched)
    }

    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        Box::new(self.levels.iter().flat_map(|level| level.location.contents()))
    }
}
