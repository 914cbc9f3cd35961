use std::path::Path;
use std::sync::Arc;

use depot::cache::{CacheKey, CacheStorage, JsonSerializer, ReadFn, Serializer, Versions, WriteFn};
use depot::config::{init_storage, StorageConfig};
use depot::error::{SerializerError, StorageError};
use depot::storage::{DiskDict, HashAlgorithm, HashKeyStorage, Key, Location, Value};

struct Token(&'static str);

impl CacheKey for Token {
    fn fingerprint(&self, version: u32) -> Vec<u8> {
        format!("{}:{}", version, self.0).into_bytes()
    }
}

fn sha_store(root: &Path) -> Arc<DiskDict> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = StorageConfig {
        hash: Some(HashAlgorithm::Sha256),
        levels: Some(vec![1, 31]),
        ..StorageConfig::default()
    };
    init_storage(&config, root).unwrap();
    Arc::new(DiskDict::open(root).unwrap())
}

fn cache_at(
    dir: &Path,
    versions: Versions,
) -> CacheStorage<JsonSerializer<Vec<String>>> {
    let index = sha_store(&dir.join("index"));
    let blobs = sha_store(&dir.join("blobs"));
    let storage = HashKeyStorage::new(blobs as Arc<dyn Location>, Vec::new()).unwrap();
    CacheStorage::with_versions(index as Arc<dyn Location>, storage, JsonSerializer::new(), versions)
        .unwrap()
}

fn value(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn cached_values_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_at(dir.path(), Versions::default());

    let key = Token("round-trip");
    let stored = value(&["alpha", "beta"]);

    assert_eq!(cache.try_read(&key).unwrap(), None);
    let digest = cache.write(&key, &stored, None).unwrap();
    assert_eq!(cache.read(&key).unwrap(), stored);
    assert_eq!(cache.prepare(&key).unwrap().digest, digest);

    // a distinct key does not alias
    assert_eq!(cache.try_read(&Token("other")).unwrap(), None);
}

#[test]
fn repeated_writes_produce_identical_index_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_at(dir.path(), Versions::default());
    let index = sha_store(&dir.path().join("index"));

    let key = Token("stable");
    let stored = value(&["gamma"]);

    let digest = cache.write(&key, &stored, None).unwrap();
    let index_location: &dyn Location = index.as_ref();
    let first = index_location.read_bytes(&digest).unwrap().unwrap();

    // wipe the index entry and write again: byte-identical canonical JSON
    assert!(index_location.delete(&digest).unwrap());
    let again = cache.write(&key, &stored, None).unwrap();
    assert_eq!(again, digest);
    let second = index_location.read_bytes(&digest).unwrap().unwrap();
    assert_eq!(first, second);

    // the entry parses as a sorted map of relative path to hex digest
    let parsed: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert!(parsed.as_object().unwrap().contains_key("value.json"));
}

#[test]
fn reads_fall_back_to_previous_fingerprint_versions() {
    let dir = tempfile::tempdir().unwrap();
    let old = cache_at(dir.path(), Versions { current: 1, previous: Vec::new() });
    let stored = value(&["migrated"]);
    old.write(&Token("ancient"), &stored, None).unwrap();

    let new = cache_at(dir.path(), Versions { current: 2, previous: vec![1] });
    assert_eq!(new.read(&Token("ancient")).unwrap(), stored);

    // the hit was migrated under the current version
    let index = sha_store(&dir.path().join("index"));
    let index: &dyn Location = index.as_ref();
    let current = new.prepare(&Token("ancient")).unwrap().digest;
    assert!(index.read_bytes(&current).unwrap().is_some());

    // a key never written under any version still misses
    assert_eq!(new.try_read(&Token("unknown")).unwrap(), None);
}

#[test]
fn legacy_directory_index_entries_are_unpacked() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_at(dir.path(), Versions::default());

    // store the blob through the regular path to learn its digest
    let key = Token("legacy");
    let stored = value(&["vintage"]);
    let digest = cache.write(&key, &stored, None).unwrap();

    let index = sha_store(&dir.path().join("index"));
    let index_location: &dyn Location = index.as_ref();
    let entry_bytes = index_location.read_bytes(&digest).unwrap().unwrap();
    let mapping: std::collections::BTreeMap<String, String> =
        serde_json::from_slice(&entry_bytes).unwrap();
    let blob_hex = mapping.get("value.json").unwrap().clone();

    // rebuild the entry in the directory form older writers produced
    assert!(index_location.delete(&digest).unwrap());
    let hex = digest.hex();
    let entry = index.root().join(&hex[..2]).join(&hex[2..]);
    std::fs::create_dir_all(&entry).unwrap();
    std::fs::write(entry.join("value.json"), blob_hex).unwrap();

    assert_eq!(cache.read(&key).unwrap(), stored);
}

#[test]
fn missing_blobs_quarantine_the_index_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_at(dir.path(), Versions::default());

    let key = Token("hollow");
    let stored = value(&["ghost"]);
    let digest = cache.write(&key, &stored, None).unwrap();

    // destroy every blob behind the index entry
    let blobs = sha_store(&dir.path().join("blobs"));
    let keys: Vec<Key> = blobs
        .contents()
        .map(|entry| entry.map(|entry| entry.key))
        .collect::<Result<_, _>>()
        .unwrap();
    let blobs_location: &dyn Location = blobs.as_ref();
    for blob in &keys {
        assert!(blobs_location.delete(blob).unwrap());
    }

    // the read degrades to a miss and removes the dangling index entry
    assert_eq!(cache.try_read(&key).unwrap(), None);
    let index = sha_store(&dir.path().join("index"));
    let index_location: &dyn Location = index.as_ref();
    assert_eq!(index_location.read_bytes(&digest).unwrap(), None);
}

/// Writes each item as its own chunk, keyed by the item itself; the
/// resulting mapping depends on the value, which is exactly what the
/// collision diagnostics need.
struct PerItem;

impl Serializer for PerItem {
    type Item = Vec<String>;

    fn save(
        &self,
        value: &Self::Item,
        write: WriteFn<'_>,
    ) -> Result<Vec<(String, Key)>, SerializerError> {
        let mut contents = Vec::new();
        for item in value {
            let key = write(Value::from(item.clone().into_bytes()))?;
            contents.push((item.clone(), key));
        }
        Ok(contents)
    }

    fn load(
        &self,
        contents: &[(String, Key)],
        read: ReadFn<'_>,
    ) -> Result<Self::Item, SerializerError> {
        let mut items = Vec::new();
        for (_, key) in contents {
            let raw = read(key)?;
            items.push(String::from_utf8(raw.to_vec()).map_err(|err| {
                SerializerError::Deserialization(format!("not utf-8: {}", err))
            })?);
        }
        Ok(items)
    }
}

#[test]
fn conflicting_mappings_surface_as_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let index = sha_store(&dir.path().join("index"));
    let blobs = sha_store(&dir.path().join("blobs"));
    let storage = HashKeyStorage::new(blobs as Arc<dyn Location>, Vec::new()).unwrap();
    let cache = CacheStorage::new(index as Arc<dyn Location>, storage, PerItem).unwrap();

    let key = Token("contested");
    cache.write(&key, &value(&["ab"]), None).unwrap();
    match cache.write(&key, &value(&["ba"]), None) {
        Err(StorageError::Collision(message)) => {
            assert!(message.contains("old mapping"), "unhelpful message: {}", message);
        }
        other => panic!("expected a collision, got {:?}", other),
    }
    // the first mapping is still served
    assert_eq!(cache.read(&key).unwrap(), value(&["ab"]));
}
