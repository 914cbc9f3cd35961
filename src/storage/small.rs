use std::io::Read;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::Key;
use super::location::{Entry, Location, ReadBody, WriteBody};
use super::value::{Value, ValueHandle};

/// A wrapper that only lets small values through to the underlying
/// location; anything of `max_size` bytes or more is refused, which makes
/// the wrapped location a natural hot tier inside [`Levels`].
pub struct SmallLocation {
    location: Box<dyn Location>,
    max_size: u64,
}

impl SmallLocation {
    pub fn new(location: Box<dyn Location>, max_size: u64) -> Self {
        SmallLocation { location, max_size }
    }
}

impl Location for SmallLocation {
    fn read(
        &self,
        key: &Key,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<bool, StorageError> {
        self.location.read(key, want_labels, body)
    }

    fn write(
        &self,
        key: &Key,
        value: &mut Value,
        labels: Option<&Labels>,
        body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        // read one byte past the limit to distinguish "fits" from "too big"
        let mut content = Vec::new();
        let position = value.stream_position()?;
        let copied = value.reader()?.take(self.max_size + 1).read_to_end(&mut content)?;

        if copied as u64 >= self.max_size {
            if let Some(position) = position {
                value.seek_to(position)?;
            }
            return Ok(false);
        }

        let mut materialized = Value::from(content);
        self.location.write(key, &mut materialized, labels, body)
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        self.location.delete(key)
    }

    fn touch(&self, key: &Key) -> Result<bool, StorageError> {
        self.location.touch(key)
    }

    fn read_batch(&self, keys: &[Key]) -> Result<Vec<(Key, bool)>, StorageError> {
        self.location.read_batch(keys)
    }

    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        self.location.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskDict;

    #[test]
    fn refuses_large_values() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskDict::open(dir.path().join("small")).unwrap();
        let small = SmallLocation::new(Box::new(disk), 4);
        let location: &dyn Location = &small;
        let key = Key::from_hex("aabb").unwrap();

        let accepted = location
            .write_value(&key, &mut Value::from(b"too large".to_vec()), None)
            .unwrap();
        assert!(!accepted);
        assert_eq!(location.read_bytes(&key).unwrap(), None);

        let accepted = location
            .write_value(&key, &mut Value::from(b"ok!".to_vec()), None)
            .unwrap();
        assert!(accepted);
        assert_eq!(location.read_bytes(&key).unwrap().unwrap().as_ref(), b"ok!");
    }
}
