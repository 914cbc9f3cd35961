use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{SerializerError, StorageError};
use crate::storage::{Key, Value};

/// Ingests one chunk into the backing storage and returns its key.
pub type WriteFn<'a> = &'a mut dyn FnMut(Value) -> Result<Key, StorageError>;

/// Streams one stored chunk back out of the backing storage.
pub type ReadFn<'a> = &'a mut dyn FnMut(&Key) -> Result<Bytes, StorageError>;

/// Converts a value into a sequence of `(relative path, blob key)` pairs
/// and reconstructs it from the same.
///
/// For any value, the set of relative paths and the chunk contents must be
/// a deterministic function of the value; that is what makes the stored
/// index reproducible across runs.
pub trait Serializer: Send + Sync {
    type Item;

    fn save(
        &self,
        value: &Self::Item,
        write: WriteFn<'_>,
    ) -> Result<Vec<(String, Key)>, SerializerError>;

    fn load(
        &self,
        contents: &[(String, Key)],
        read: ReadFn<'_>,
    ) -> Result<Self::Item, SerializerError>;
}

/// Tries its children in order and returns the first that succeeds; a
/// child signalling `Unsupported` is passed over.
pub struct ChainSerializer<T> {
    serializers: Vec<Box<dyn Serializer<Item = T>>>,
}

impl<T> ChainSerializer<T> {
    pub fn new(serializers: Vec<Box<dyn Serializer<Item = T>>>) -> Self {
        ChainSerializer { serializers }
    }
}

impl<T> Serializer for ChainSerializer<T> {
    type Item = T;

    fn save(
        &self,
        value: &Self::Item,
        write: WriteFn<'_>,
    ) -> Result<Vec<(String, Key)>, SerializerError> {
        for serializer in &self.serializers {
            match serializer.save(value, &mut *write) {
                Err(SerializerError::Unsupported(_)) => continue,
                other => return other,
            }
        }
        Err(SerializerError::Unsupported(
            "no serializer was able to save the value".into(),
        ))
    }

    fn load(
        &self,
        contents: &[(String, Key)],
        read: ReadFn<'_>,
    ) -> Result<Self::Item, SerializerError> {
        for serializer in &self.serializers {
            match serializer.load(contents, &mut *read) {
                Err(SerializerError::Unsupported(_)) => continue,
                other => return other,
            }
        }
        Err(SerializerError::Unsupported(
            "no serializer was able to load the value".into(),
        ))
    }
}

const JSON_NAME: &str = "value.json";

/// Stores any serde-serializable value as a single `value.json` chunk.
pub struct JsonSerializer<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        JsonSerializer { marker: PhantomData }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Serializer for JsonSerializer<T> {
    type Item = T;

    fn save(
        &self,
        value: &Self::Item,
        write: WriteFn<'_>,
    ) -> Result<Vec<(String, Key)>, SerializerError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|err| SerializerError::Unsupported(format!("not JSON-serializable: {}", err)))?;
        let key = write(Value::from(encoded))?;
        Ok(vec![(JSON_NAME.to_string(), key)])
    }

    fn load(
        &self,
        contents: &[(String, Key)],
        read: ReadFn<'_>,
    ) -> Result<Self::Item, SerializerError> {
        match contents {
            [(name, key)] if name.as_str() == JSON_NAME => {
                let raw = read(key)?;
                serde_json::from_slice(&raw).map_err(|err| {
                    SerializerError::Deserialization(format!("invalid JSON chunk: {}", err))
                })
            }
            _ => Err(SerializerError::Unsupported(format!(
                "expected a single {} entry",
                JSON_NAME
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn in_memory() -> (
        std::sync::Arc<parking_lot::Mutex<HashMap<Key, Bytes>>>,
        impl FnMut(Value) -> Result<Key, StorageError>,
    ) {
        let store = std::sync::Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let writer_store = std::sync::Arc::clone(&store);
        let write = move |mut value: Value| {
            let mut raw = Vec::new();
            std::io::Read::read_to_end(&mut value.reader()?, &mut raw)?;
            let key = crate::storage::digest_value(
                &mut Value::from(raw.clone()),
                crate::storage::HashAlgorithm::Sha256,
            )?;
            writer_store.lock().insert(key.clone(), Bytes::from(raw));
            Ok(key)
        };
        (store, write)
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::<Vec<u32>>::new();
        let (store, mut write) = in_memory();

        let contents = serializer.save(&vec![1, 2, 3], &mut write).unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].0, "value.json");

        let mut read = |key: &Key| {
            store
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::Read(format!("the key {} is not found", key)))
        };
        let value = serializer.load(&contents, &mut read).unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        // an alien layout is refused, not misread
        let alien = vec![("other.bin".to_string(), contents[0].1.clone())];
        match serializer.load(&alien, &mut read) {
            Err(SerializerError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn chain_falls_through() {
        struct Refusing;
        impl Serializer for Refusing {
            type Item = Vec<u32>;
            fn save(
                &self,
                _value: &Self::Item,
                _write: WriteFn<'_>,
            ) -> Result<Vec<(String, Key)>, SerializerError> {
                Err(SerializerError::Unsupported("always refuses".into()))
            }
            fn load(
                &self,
                _contents: &[(String, Key)],
                _read: ReadFn<'_>,
            ) -> Result<Self::Item, SerializerError> {
                Err(SerializerError::Unsupported("always refuses".into()))
            }
        }

        let chain = ChainSerializer::new(vec![
            Box::new(Refusing),
            Box::new(JsonSerializer::<Vec<u32>>::new()),
        ]);
        let (store, mut write) = in_memory();
        let contents = chain.save(&vec![7], &mut write).unwrap();

        let mut read = |key: &Key| {
            store
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::Read(format!("the key {} is not found", key)))
        };
        assert_eq!(chain.load(&contents, &mut read).unwrap(), vec![7]);

        let empty = ChainSerializer::<Vec<u32>>::new(vec![Box::new(Refusing)]);
        assert!(matches!(
            empty.save(&vec![7], &mut write),
            Err(SerializerError::Unsupported(_))
        ));
    }
}
