//! This crate implements a content-addressed storage engine with pluggable
//! backends, tiered replication and a fingerprint-keyed cache layer on top.
//!
//! # Data model
//!
//! Values are opaque byte blobs, stored under the digest of their contents
//! (the *key*). A stored blob is immutable: the only things that change
//! after the first write are its labels (a monotonically growing string
//! set) and its last-used timestamp.
//!
//! On disk, a key is split into fixed-size hex segments and laid out as
//! nested directories, so a 32-byte digest with `levels: [1, 31]` lands at
//! `<root>/<2 hex chars>/<62 hex chars>`.
//!
//! # Locations
//!
//! Every backend implements [`storage::Location`]: scoped reads and writes,
//! deletion, usage touches and enumeration. [`storage::DiskDict`] is the
//! filesystem backend, with atomic temp-and-rename writes, per-key
//! read/write locking, capacity bounds and integrity quarantine.
//! [`storage::Fanout`] shards horizontally across alternatives;
//! [`storage::Levels`] tiers vertically and replicates hits into the
//! faster tiers on the way out.
//!
//! # Locking
//!
//! Concurrent writers of one key are serialized through a
//! [`tools::Locker`]: a process-wide mutex for single-process setups, or a
//! Redis-backed reader/writer lock for a cluster. A reader observes either
//! the fully committed blob or nothing, because the rename into the final
//! path is the commit point.
//!
//! # The cache layer
//!
//! [`cache::CacheStorage`] caches arbitrary serialized values, keyed by a
//! versioned fingerprint of an arbitrary key object. The serialized chunks
//! go into a [`storage::HashKeyStorage`]; an index entry mapping relative
//! paths to chunk digests is stored as canonical JSON under the digest of
//! the fingerprint. Misses fall back to older fingerprint versions and
//! migrate forward on a hit.

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;
pub mod tools;

pub use error::{SerializerError, StorageError};
pub use storage::{
    DiskDict, Fanout, HashAlgorithm, HashKeyStorage, Key, Level, Levels, Location, Value,
    ValueHandle,
};
pub use tools::Labels;
