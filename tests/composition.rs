use std::path::Path;
use std::sync::Arc;

use depot::config::{init_storage, StorageConfig};
use depot::error::StorageError;
use depot::storage::{
    digest_value, DiskDict, Fanout, HashAlgorithm, HashKeyStorage, Key, Level, Levels, Location,
    SmallLocation, Value,
};

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

fn sha_key(payload: &[u8]) -> Key {
    digest_value(&mut Value::from(payload.to_vec()), HashAlgorithm::Sha256).unwrap()
}

fn put(disk: &DiskDict, payload: &[u8]) -> Key {
    let key = sha_key(payload);
    let location: &dyn Location = disk;
    assert!(location.write_value(&key, &mut Value::from(payload.to_vec()), None).unwrap());
    key
}

fn has(location: &dyn Location, key: &Key) -> bool {
    location.read_bytes(key).unwrap().is_some()
}

#[test]
fn fanout_reads_first_hit() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    let in_a = put(&a, b"only in a");
    let in_b = put(&b, b"only in b");
    let nowhere = sha_key(b"nowhere");

    let fanout = Fanout::new(vec![
        Arc::clone(&a) as Arc<dyn Location>,
        Arc::clone(&b) as Arc<dyn Location>,
    ])
    .unwrap();
    let fanout: &dyn Location = &fanout;

    assert_eq!(fanout.read_bytes(&in_a).unwrap().unwrap().as_ref(), b"only in a");
    assert_eq!(fanout.read_bytes(&in_b).unwrap().unwrap().as_ref(), b"only in b");
    assert_eq!(fanout.read_bytes(&nowhere).unwrap(), None);

    // probing a hit does not copy it across children
    assert!(!has(a.as_ref(), &in_b));
}

#[test]
fn fanout_batch_carries_the_remaining_set() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    let in_a = put(&a, b"batch a");
    let in_b = put(&b, b"batch b");
    let nowhere = sha_key(b"batch nothing");

    let fanout = Fanout::new(vec![
        Arc::clone(&a) as Arc<dyn Location>,
        Arc::clone(&b) as Arc<dyn Location>,
    ])
    .unwrap();

    let mut probed = fanout
        .read_batch(&[in_a.clone(), in_b.clone(), nowhere.clone()])
        .unwrap();
    probed.sort_by(|x, y| x.0.cmp(&y.0));
    let mut expected = vec![(in_a, true), (in_b, true), (nowhere, false)];
    expected.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(probed, expected);
}

#[test]
fn fanout_write_passes_over_refusals() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    // the first child only takes tiny payloads, so the write falls through
    let small = SmallLocation::new(Box::new(DiskDict::open(dir.path().join("a")).unwrap()), 4);
    let fanout = Fanout::new(vec![
        Arc::new(small) as Arc<dyn Location>,
        Arc::clone(&b) as Arc<dyn Location>,
    ])
    .unwrap();

    let payload = b"a payload well over the cap".to_vec();
    let key = sha_key(&payload);
    // a buffered value must be re-seeked after the refusal consumed it
    let mut value = Value::buffer(std::io::Cursor::new(payload.clone()));
    let fanout: &dyn Location = &fanout;
    assert!(fanout.write_value(&key, &mut value, None).unwrap());

    assert!(!has(a.as_ref(), &key));
    let stored: &dyn Location = b.as_ref();
    assert_eq!(stored.read_bytes(&key).unwrap().unwrap().as_ref(), &payload[..]);
}

#[test]
fn levels_replicate_hits_upward() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    let key = put(&b, b"replicated");
    let levels = Levels::flat(vec![
        Arc::clone(&a) as Arc<dyn Location>,
        Arc::clone(&b) as Arc<dyn Location>,
    ])
    .unwrap();
    let levels: &dyn Location = &levels;

    assert_eq!(levels.read_bytes(&key).unwrap().unwrap().as_ref(), b"replicated");

    // the read populated the higher-priority tier at the matching path
    let hex = key.hex();
    assert!(a.root().join(&hex[..2]).join(&hex[2..]).is_file());
}

#[test]
fn levels_respect_the_replicate_flag() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    let key = put(&b, b"stays put");
    let levels = Levels::new(vec![
        Level::new(Arc::clone(&a) as Arc<dyn Location>).no_replicate(),
        Level::new(Arc::clone(&b) as Arc<dyn Location>),
    ])
    .unwrap();
    let levels: &dyn Location = &levels;

    assert!(has(levels, &key));
    assert!(!has(a.as_ref(), &key));
}

#[test]
fn levels_respect_the_write_flag() {
    let dir = tempfile::tempdir().unwrap();
    let a = sha_store(&dir.path().join("a"));
    let b = sha_store(&dir.path().join("b"));

    let levels = Levels::new(vec![
        Level::new(Arc::clone(&a) as Arc<dyn Location>).read_only(),
        Level::new(Arc::clone(&b) as Arc<dyn Location>),
    ])
    .unwrap();

    let payload = b"lands in the second tier".to_vec();
    let key = sha_key(&payload);
    let composed: &dyn Location = &levels;
    assert!(composed.write_value(&key, &mut Value::from(payload.clone()), None).unwrap());

    assert!(!has(a.as_ref(), &key));
    assert!(has(b.as_ref(), &key));
}

#[test]
fn mixed_hash_algorithms_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sha = sha_store(&dir.path().join("sha"));

    let blake_root = dir.path().join("blake");
    let config = StorageConfig {
        hash: Some(HashAlgorithm::Blake2b),
        levels: Some(vec![1, 63]),
        ..StorageConfig::default()
    };
    init_storage(&config, &blake_root).unwrap();
    let blake = Arc::new(DiskDict::open(&blake_root).unwrap());

    let mixed = Fanout::new(vec![
        Arc::clone(&sha) as Arc<dyn Location>,
        blake as Arc<dyn Location>,
    ]);
    assert!(matches!(mixed, Err(StorageError::Config(_))));
}

#[test]
fn hash_key_storage_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let local = sha_store(&dir.path().join("local"));
    let remote = sha_store(&dir.path().join("remote"));

    let storage = HashKeyStorage::new(
        Arc::clone(&local) as Arc<dyn Location>,
        vec![Arc::clone(&remote) as Arc<dyn Location>],
    )
    .unwrap();
    assert_eq!(storage.algorithm(), HashAlgorithm::Sha256);
    assert_eq!(storage.digest_size(), 32);

    let key = storage.write(b"digested on write".to_vec(), None).unwrap();
    assert_eq!(key, sha_key(b"digested on write"));
    assert_eq!(storage.read_bytes(&key).unwrap().as_ref(), b"digested on write");

    // a remote-only key is fetched and replicated into local
    let remote_key = put(&remote, b"remote only");
    assert_eq!(storage.read_bytes(&remote_key).unwrap().as_ref(), b"remote only");
    assert!(has(local.as_ref(), &remote_key));

    // presence probe
    let missing = sha_key(b"never written");
    let fetched = storage.fetch(&[key.clone(), missing.clone()]).unwrap();
    assert!(fetched.contains(&(key, true)));
    assert!(fetched.contains(&(missing, false)));
}

#[test]
fn hash_key_storage_write_refusal_policy() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("full");
    let config = StorageConfig {
        hash: Some(HashAlgorithm::Sha256),
        levels: Some(vec![1, 31]),
        free_disk_size: u64::MAX,
        ..StorageConfig::default()
    };
    init_storage(&config, &root).unwrap();
    let local = Arc::new(DiskDict::open(&root).unwrap());

    let storage = HashKeyStorage::new(local as Arc<dyn Location>, Vec::new()).unwrap();
    assert_eq!(storage.try_write(b"no room".to_vec(), None).unwrap(), None);
    assert!(matches!(
        storage.write(b"no room".to_vec(), None),
        Err(StorageError::Write(_))
    ));

    let missing = sha_key(b"no room");
    assert!(matches!(
        storage.read_bytes(&missing),
        Err(StorageError::Read(_))
    ));
    assert!(storage.try_read(&missing, |_| Ok(())).unwrap().is_none());
}
