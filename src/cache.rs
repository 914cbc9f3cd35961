//! The cache layer: values keyed by fingerprints of arbitrary objects.
//!
//! A [`Serializer`] turns a value into `(relative path, blob key)` pairs
//! backed by a [`HashKeyStorage`](crate::storage::HashKeyStorage);
//! [`CacheStorage`] records those pairs as a canonical JSON index entry
//! under the digest of the key's fingerprint.

mod serializer;
pub use serializer::*;

mod storage;
pub use storage::*;
