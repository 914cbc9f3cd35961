use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

use super::value::Value;

const DIGEST_BLOCK_SIZE: usize = 1024 * 1024;

/// A content-addressed key: the raw digest bytes of the payload.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(digest: Vec<u8>) -> Self {
        Key(digest)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, StorageError> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| StorageError::Read(format!("invalid hex key {:?}: {}", hex_str, err)))?;
        Ok(Key(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex encoding, as used on the wire and on the filesystem.
    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({})", self.hex())
    }
}

impl From<Vec<u8>> for Key {
    fn from(digest: Vec<u8>) -> Self {
        Key(digest)
    }
}

/// The hash algorithm of a storage graph. Fixed per graph; composing
/// locations with different algorithms is rejected at construction time.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    /// BLAKE2b-512, the unkeyed 64-byte variant.
    Blake2b,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake2b => "blake2b",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake2b => 64,
        }
    }

    fn message_digest(&self) -> Result<MessageDigest, StorageError> {
        let digest = match self {
            HashAlgorithm::Sha256 => Some(MessageDigest::sha256()),
            HashAlgorithm::Sha512 => Some(MessageDigest::sha512()),
            HashAlgorithm::Blake2b => MessageDigest::from_name("blake2b512"),
        };
        digest.ok_or_else(|| {
            StorageError::Config(format!("hash algorithm {} is not available", self.name()))
        })
    }

    pub fn hasher(&self) -> Result<Hasher, StorageError> {
        Hasher::new(self.message_digest()?)
            .map_err(|err| StorageError::Config(format!("unable to create hasher: {}", err)))
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = StorageError;

    fn from_str(name: &str) -> Result<Self, StorageError> {
        match name {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "blake2b" => Ok(HashAlgorithm::Blake2b),
            other => Err(StorageError::Config(format!("unknown hash algorithm: {}", other))),
        }
    }
}

/// Streams a value through the hash algorithm and returns its key.
///
/// Buffered values are hashed from their current position and re-seeked
/// back to it afterwards, so a subsequent write sees the same stream.
pub fn digest_value(value: &mut Value, algorithm: HashAlgorithm) -> Result<Key, StorageError> {
    let start = value.stream_position()?;
    let mut hasher = algorithm.hasher()?;

    let mut reader = value.reader()?;
    let mut buf = vec![0u8; DIGEST_BLOCK_SIZE];
    loop {
        let count = std::io::Read::read(&mut reader, &mut buf)?;
        if count == 0 {
            break;
        }
        hasher
            .write_all(&buf[..count])
            .map_err(|err| StorageError::Read(format!("hash update failed: {}", err)))?;
    }
    drop(reader);

    if let Some(position) = start {
        value.seek_to(position)?;
    }

    let digest = hasher
        .finish()
        .map_err(|err| StorageError::Read(format!("hash finish failed: {}", err)))?;
    Ok(Key::new(digest.to_vec()))
}

/// Validates a key layout: all segments positive, except an optional
/// trailing `-1` meaning "remainder"; the fixed segments must fit inside
/// the digest when the digest size is known.
pub fn validate_levels(levels: &[i64], digest_size: Option<usize>) -> Result<(), StorageError> {
    if levels.is_empty() {
        return Err(StorageError::Config("levels must not be empty".into()));
    }
    for (index, &level) in levels.iter().enumerate() {
        if level == -1 {
            if index + 1 != levels.len() {
                return Err(StorageError::Config(
                    "a -1 level is only allowed in the last position".into(),
                ));
            }
        } else if level <= 0 {
            return Err(StorageError::Config(format!("invalid level size: {}", level)));
        }
    }
    let fixed: i64 = levels.iter().filter(|&&level| level != -1).sum();
    if let Some(size) = digest_size {
        if fixed as usize > size {
            return Err(StorageError::Config(format!(
                "levels {:?} exceed the digest size {}",
                levels, size
            )));
        }
    }
    Ok(())
}

/// The key size implied by a layout: `None` if the layout ends in a
/// remainder segment and therefore accepts several sizes.
pub fn levels_key_size(levels: &[i64]) -> Option<usize> {
    if levels.iter().any(|&level| level == -1) {
        return None;
    }
    Some(levels.iter().sum::<i64>() as usize)
}

/// Maps a key to its relative path: path segment `i` consumes
/// `levels[i] * 2` lowercase hex characters, a trailing `-1` consumes the
/// remainder.
pub fn key_to_relative(key: &Key, levels: &[i64]) -> Result<PathBuf, StorageError> {
    if key.is_empty() {
        return Err(StorageError::Read("the key must be non-empty".into()));
    }

    let hex_key = key.hex();
    let mut path = PathBuf::new();
    let mut start = 0;
    for &level in levels {
        let stop = if level == -1 {
            hex_key.len()
        } else {
            start + level as usize * 2
        };
        if stop > hex_key.len() || stop == start {
            return Err(StorageError::Read(format!(
                "key {} does not fit the layout {:?}",
                hex_key, levels
            )));
        }
        path.push(&hex_key[start..stop]);
        start = stop;
    }
    if start != hex_key.len() {
        return Err(StorageError::Read(format!(
            "key {} does not fit the layout {:?}",
            hex_key, levels
        )));
    }

    Ok(path)
}
