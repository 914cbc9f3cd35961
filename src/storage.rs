//! The location layer: content-addressed backends and their composition.
//!
//! A [`Location`] stores opaque blobs under their digest. [`DiskDict`] is
//! the filesystem backend; [`RedisLocation`] and [`SmallLocation`] are
//! alternatives for hot or tiny payloads. [`Fanout`] composes locations
//! horizontally (first hit wins), [`Levels`] vertically (tiers populated by
//! read-through replication). [`HashKeyStorage`] sits on top and turns
//! values into keys by digesting them on write.

mod digest;
pub use digest::*;

mod value;
pub use value::*;

mod location;
pub use location::*;

mod disk_dict;
pub use disk_dict::*;

mod fanout;
pub use fanout::*;

mod levels;
pub use levels::*;

mod redis;
pub use redis::*;

mod small;
pub use small::*;

mod hash_key;
pub use hash_key::*;
