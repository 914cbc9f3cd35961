//! Supporting services for locations: per-key locking, usage tracking,
//! label storage, size tracking, and shared filesystem helpers.
//!
//! Every service has a `Dummy` no-op variant, used when a storage root's
//! config does not ask for the real one.

pub mod fs;

mod locker;
pub use locker::*;

mod usage;
pub use usage::*;

mod labels;
pub use labels::*;

mod size;
pub use size::*;
