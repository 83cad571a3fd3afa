//! ember — a Redis-protocol-compatible in-memory data store.
//!
//! This crate assembles the workspace into a runnable server:
//! - [`config`]: JSON configuration with validation
//! - [`server`]: keyspace + persistence + replication wiring
//! - [`conn`]: the per-connection command loop
//!
//! The heavy lifting lives in the member crates: `ember-core` (byte
//! strings, wire framing, checksums), `ember-dict` (incremental-rehash
//! dict and skiplist), `ember-store` (values, keyspace, command table),
//! `ember-persist` (snapshot and command log), and `ember-repl`
//! (primary-replica replication).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conn;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{Role, Server, StartupError};
