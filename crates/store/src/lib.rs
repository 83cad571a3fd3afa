//! Value types, keyspace, and command execution for ember
//!
//! The store turns decoded command arrays into keyspace mutations and reply
//! values. It owns:
//! - [`Value`]: the tagged value enum (string, list, set, hash, sorted set)
//! - [`Keyspace`] / [`Database`]: numbered databases with TTL tracking
//! - [`commands`]: the closed dispatch table shared by client connections,
//!   command-log recovery, and the replica apply loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod error;
pub mod keyspace;
pub mod value;

pub use commands::{execute, execute_pre_locked, try_execute, ConnState, Outcome};
pub use error::{StoreError, StoreResult};
pub use keyspace::{now_ms, Database, Keyspace, Stored, Ttl, DEFAULT_DB_COUNT, NO_EXPIRY};
pub use value::{fmt_score, SortedSet, StrValue, Value};
