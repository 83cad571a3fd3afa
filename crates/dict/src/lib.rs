//! Concurrent keyed and ordered containers for ember
//!
//! Two structures live here:
//! - [`Dict`]: the incremental-rehash hash table with copy-on-write
//!   snapshots that backs every keyspace database and every set, hash, and
//!   sorted-set value
//! - [`SkipList`]: the probabilistic ordered index behind sorted sets

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dict;
pub mod skiplist;

pub use dict::{Dict, DictIter, DictSnapshot, RehashState, SnapshotIter};
pub use skiplist::{SkipIter, SkipList};
