//! Primary-side replication coordinator.
//!
//! The coordinator lock defines the **commit order**: every write command
//! executed locally takes the lock, advances `master_replication_offset` by
//! its encoded length, appends the bytes to the backlog, and forwards them
//! to every streaming replica — in that order, atomically. Replica offsets
//! are defined entirely in terms of this stream.
//!
//! Each accepted replica gets two named threads: a sender owning the socket
//! write half (fed by a channel so the commit path never blocks on peer
//! sockets) and a receiver draining `REPLCONF ACK` and heartbeat `PING`
//! frames. A send failure drops the replica without retry; it will
//! reconnect with its saved offset.
//!
//! PSYNC arbitration: a partial resync is granted iff the requested run id
//! matches ours and the backlog still covers the requested offset;
//! otherwise the reply is a full resync with a snapshot blob generated
//! under the coordinator lock, so the blob corresponds exactly to the
//! announced offset.

use crate::backlog::{Backlog, DEFAULT_BACKLOG_SIZE};
use crate::error::{ReplError, ReplResult};
use crate::protocol::{bulk_prefix, format_continue, format_fullresync, StreamBuf};
use ember_core::{encode_command, ByteString};
use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Provider of full-resync snapshot blobs.
///
/// The embedding server implements this over the snapshot engine.
pub trait SnapshotSource: Send + Sync {
    /// Serialise the current keyspace as a snapshot image.
    fn full_snapshot(&self) -> Result<Vec<u8>, String>;
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Backlog ring capacity (default 1 MiB).
    pub backlog_capacity: usize,
    /// Per-replica socket write timeout (default 5000 ms).
    pub write_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            backlog_capacity: DEFAULT_BACKLOG_SIZE,
            write_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backlog capacity (builder pattern).
    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    /// Small backlog and short timeouts for tests.
    pub fn for_testing() -> Self {
        CoordinatorConfig {
            backlog_capacity: 4096,
            write_timeout_ms: 1000,
        }
    }
}

/// How a PSYNC request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Backlog range served from the requested offset.
    Partial,
    /// Snapshot blob sent as a new baseline.
    Full,
}

struct Peer {
    id: u64,
    addr: String,
    sender: mpsc::Sender<Vec<u8>>,
    acked: Arc<AtomicU64>,
}

struct CoordInner {
    master_offset: u64,
    backlog: Backlog,
    peers: Vec<Peer>,
    last_db: Option<usize>,
}

impl CoordInner {
    /// One committed chunk: offset, backlog, fan-out — the commit order.
    fn commit(&mut self, bytes: &[u8]) {
        self.master_offset += bytes.len() as u64;
        self.backlog.append(bytes);
        self.peers.retain(|peer| {
            let delivered = peer.sender.send(bytes.to_vec()).is_ok();
            if !delivered {
                warn!(
                    target: "ember::repl",
                    peer = peer.id,
                    addr = %peer.addr,
                    "replica send failed, dropping from streaming"
                );
            }
            delivered
        });
    }
}

/// Per-replica observable info.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer id (monotonic per accept).
    pub id: u64,
    /// Peer socket address.
    pub addr: String,
    /// Last offset the replica acknowledged.
    pub acked_offset: u64,
}

/// The primary-side coordinator.
pub struct ReplicationCoordinator {
    run_id: String,
    config: CoordinatorConfig,
    inner: Mutex<CoordInner>,
    next_peer_id: AtomicU64,
}

impl ReplicationCoordinator {
    /// Create a coordinator with a fresh run id.
    pub fn new(config: CoordinatorConfig) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        ReplicationCoordinator {
            run_id,
            inner: Mutex::new(CoordInner {
                master_offset: 0,
                backlog: Backlog::new(config.backlog_capacity),
                peers: Vec::new(),
                last_db: None,
            }),
            config,
            next_peer_id: AtomicU64::new(1),
        }
    }

    /// This primary's stable replication identity.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current commit offset.
    pub fn master_offset(&self) -> u64 {
        self.inner.lock().master_offset
    }

    /// Streaming replica count.
    pub fn replica_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// Per-replica acked offsets (lag is observed, only logged).
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .peers
            .iter()
            .map(|peer| PeerInfo {
                id: peer.id,
                addr: peer.addr.clone(),
                acked_offset: peer.acked.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Propagate one executed write command. Returns the new commit offset.
    ///
    /// Injects a `SELECT` frame into the stream whenever the target
    /// database changes, so replicas land every write in the right place.
    pub fn propagate(&self, db_index: usize, bytes: &[u8]) -> u64 {
        let mut inner = self.inner.lock();
        if inner.last_db != Some(db_index) {
            let select = encode_command(&[
                ByteString::from("SELECT"),
                ByteString::from_string(db_index.to_string()),
            ]);
            inner.commit(&select);
            inner.last_db = Some(db_index);
        }
        inner.commit(bytes);
        inner.master_offset
    }

    /// Decide how a PSYNC request would be served (exposed for tests and
    /// logging; [`ReplicationCoordinator::accept_replica`] applies it).
    pub fn sync_decision(&self, requested_id: Option<&str>, requested_offset: i64) -> SyncKind {
        let inner = self.inner.lock();
        let matches_us = requested_id == Some(self.run_id.as_str());
        if matches_us && requested_offset >= 0 && inner.backlog.can_serve(requested_offset as u64)
        {
            SyncKind::Partial
        } else {
            SyncKind::Full
        }
    }

    /// Serve a PSYNC handshake on `stream` and register the replica.
    ///
    /// The preamble (handshake reply plus blob or backlog range) is queued
    /// on the peer channel while the coordinator lock is held, so every
    /// commit after the decision point flows to the replica in order.
    pub fn accept_replica(
        &self,
        stream: TcpStream,
        requested_id: Option<&str>,
        requested_offset: i64,
        source: &dyn SnapshotSource,
    ) -> ReplResult<SyncKind> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut inner = self.inner.lock();
        let matches_us = requested_id == Some(self.run_id.as_str());
        let partial = matches_us
            && requested_offset >= 0
            && inner.backlog.can_serve(requested_offset as u64);

        let mut preamble = Vec::new();
        let kind = if partial {
            let range = inner.backlog.range_since(requested_offset as u64)?;
            preamble.extend_from_slice(&format_continue());
            preamble.extend_from_slice(&bulk_prefix(range.len()));
            preamble.extend_from_slice(&range);
            preamble.extend_from_slice(b"\r\n");
            SyncKind::Partial
        } else {
            // Generated under the lock: the blob corresponds exactly to the
            // announced offset because no write can commit meanwhile.
            let blob = match source.full_snapshot() {
                Ok(blob) => blob,
                Err(message) => {
                    drop(inner);
                    let mut stream = stream;
                    let _ = stream.write_all(b"-ERR snapshot generation failed\r\n");
                    return Err(ReplError::SnapshotFailed(message));
                }
            };
            preamble.extend_from_slice(&format_fullresync(&self.run_id, inner.master_offset));
            preamble.extend_from_slice(&bulk_prefix(blob.len()));
            preamble.extend_from_slice(&blob);
            preamble.extend_from_slice(b"\r\n");
            SyncKind::Full
        };

        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Vec<u8>>();
        sender
            .send(preamble)
            .expect("receiver held on this stack frame");
        let acked = Arc::new(AtomicU64::new(match kind {
            SyncKind::Partial => requested_offset.max(0) as u64,
            SyncKind::Full => 0,
        }));
        inner.peers.push(Peer {
            id,
            addr: peer_addr.clone(),
            sender,
            acked: Arc::clone(&acked),
        });
        let announced = inner.master_offset;
        drop(inner);

        info!(
            target: "ember::repl",
            peer = id,
            addr = %peer_addr,
            ?kind,
            offset = announced,
            "replica accepted"
        );
        self.spawn_peer_threads(id, stream, receiver, acked)?;
        Ok(kind)
    }

    fn spawn_peer_threads(
        &self,
        id: u64,
        stream: TcpStream,
        receiver: mpsc::Receiver<Vec<u8>>,
        acked: Arc<AtomicU64>,
    ) -> ReplResult<()> {
        let write_half = stream.try_clone()?;
        write_half
            .set_write_timeout(Some(Duration::from_millis(self.config.write_timeout_ms)))?;

        std::thread::Builder::new()
            .name(format!("ember-repl-sender-{}", id))
            .spawn(move || {
                let mut socket = write_half;
                while let Ok(chunk) = receiver.recv() {
                    if let Err(e) = socket.write_all(&chunk) {
                        debug!(target: "ember::repl", peer = id, error = %e, "sender exiting");
                        return;
                    }
                }
            })?;

        std::thread::Builder::new()
            .name(format!("ember-repl-receiver-{}", id))
            .spawn(move || {
                let mut reader = StreamBuf::new(stream);
                loop {
                    match reader.next_command() {
                        Ok(Some((args, _))) => handle_replica_frame(id, &args, &acked),
                        Ok(None) => continue,
                        Err(e) => {
                            debug!(target: "ember::repl", peer = id, error = %e, "receiver exiting");
                            return;
                        }
                    }
                }
            })?;
        Ok(())
    }
}

impl Default for ReplicationCoordinator {
    fn default() -> Self {
        ReplicationCoordinator::new(CoordinatorConfig::default())
    }
}

fn handle_replica_frame(peer: u64, args: &[ByteString], acked: &AtomicU64) {
    let Some(name) = args.first() else {
        return;
    };
    let name = name.as_str().unwrap_or("");
    if name.eq_ignore_ascii_case("REPLCONF")
        && args.len() == 3
        && args[1].as_str().is_some_and(|s| s.eq_ignore_ascii_case("ACK"))
    {
        if let Some(offset) = args[2].parse_i64() {
            acked.store(offset.max(0) as u64, Ordering::Release);
            debug!(target: "ember::repl", peer, offset, "replica ack");
        }
    } else if name.eq_ignore_ascii_case("PING") {
        debug!(target: "ember::repl", peer, "replica heartbeat");
    } else {
        warn!(target: "ember::repl", peer, command = name, "unexpected replica frame");
    }
}
