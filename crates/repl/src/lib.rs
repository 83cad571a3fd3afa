//! Primary-replica replication for ember
//!
//! Three pieces:
//! - [`Backlog`]: ring buffer of recently-propagated command bytes, indexed
//!   by absolute offset
//! - [`ReplicaClient`]: the replica-side state machine (PSYNC handshake,
//!   snapshot consumption, streaming apply, heartbeats, reconnects)
//! - [`ReplicationCoordinator`]: the primary side (commit order, PSYNC
//!   arbitration, per-replica sender/receiver threads)
//!
//! The crate talks to the rest of the system through two seams the server
//! implements: [`CommandSink`] (where replicated commands land) and
//! [`SnapshotSource`] (where full-resync blobs come from).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backlog;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod replica;

pub use backlog::{Backlog, DEFAULT_BACKLOG_SIZE};
pub use coordinator::{
    CoordinatorConfig, PeerInfo, ReplicationCoordinator, SnapshotSource, SyncKind,
};
pub use error::{ReplError, ReplResult};
pub use replica::{
    CommandSink, ReplicaClient, ReplicaConfig, ReplicaHandle, ReplicaState, ReplicaStatus,
};
