//! Persistence engines for ember
//!
//! Two durable representations of the keyspace live here:
//! - [`rdb`]: the binary snapshot format with a streaming CRC-64 footer,
//!   written crash-safely via temp-file + fsync + atomic rename
//! - [`aof`]: the append-only command log with an asynchronous batched
//!   writer, torn-tail-tolerant recovery, and background rewrite

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aof;
pub mod error;
pub mod rdb;

pub use aof::{AofConfig, AofEngine, FsyncPolicy, RecoveryReport, RewriteReport};
pub use error::{PersistError, PersistResult};
pub use rdb::{load_file, load_slice, serialize_keyspace, LoadReport, SaveReport, SnapshotEngine};
