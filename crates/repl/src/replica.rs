//! Replica-side replication state machine.
//!
//! Lifecycle: DISCONNECTED → CONNECTING → SYNCING → STREAMING, with ERROR on
//! protocol violations. The state transitions are the only path that
//! mutates the observable fields (`current_master_id`,
//! `replication_offset`, `master_replication_offset`), and every exit saves
//! `(last_master_id, last_offset)` so the next connection attempt can ask
//! for a partial resync.
//!
//! The client runs three threads: the session thread (handshake + apply
//! loop), a heartbeat thread sending PING once a second (three consecutive
//! send failures kill the session), and nothing else — reconnects reuse the
//! session thread. Only STREAMING applies inbound commands to the keyspace,
//! through the [`CommandSink`] seam the embedding server provides.

use crate::error::{ReplError, ReplResult};
use crate::protocol::{
    parse_sync_reply, ping_command, psync_command, replconf_ack, write_all, StreamBuf, SyncReply,
};
use ember_core::ByteString;
use parking_lot::Mutex;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where replicated commands land.
///
/// The embedding server implements this over its keyspace (and, when the
/// log is enabled, mirrors applied commands into it).
pub trait CommandSink: Send + Sync + 'static {
    /// Apply one replicated command; `raw` is its wire encoding.
    fn apply(&self, args: &[ByteString], raw: &[u8]);

    /// Replace the entire keyspace with a snapshot image.
    fn load_snapshot(&self, image: &[u8]) -> Result<(), String>;
}

/// Replica lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// No connection; saved sync state may allow a partial resync later.
    Disconnected,
    /// Socket attempt / handshake in flight.
    Connecting,
    /// Consuming the full-resync snapshot blob.
    Syncing,
    /// Applying the live command stream.
    Streaming,
    /// Protocol violation; about to drop to Disconnected.
    Error,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplicaState::Disconnected => "disconnected",
            ReplicaState::Connecting => "connecting",
            ReplicaState::Syncing => "syncing",
            ReplicaState::Streaming => "streaming",
            ReplicaState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Replica client configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Heartbeat interval (default 1000 ms).
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat failures that kill the session (default 3).
    pub heartbeat_failure_limit: u32,
    /// Heartbeat send timeout (default 5000 ms).
    pub heartbeat_send_timeout_ms: u64,
    /// Handshake timeout (default 30 000 ms).
    pub handshake_timeout_ms: u64,
    /// ACK after this many applied commands (default 1).
    pub ack_every_commands: usize,
    /// Delay between reconnect attempts (default 1000 ms).
    pub retry_delay_ms: u64,
    /// Streaming read poll granularity (default 200 ms).
    pub poll_timeout_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            heartbeat_interval_ms: 1000,
            heartbeat_failure_limit: 3,
            heartbeat_send_timeout_ms: 5000,
            handshake_timeout_ms: 30_000,
            ack_every_commands: 1,
            retry_delay_ms: 1000,
            poll_timeout_ms: 200,
        }
    }
}

impl ReplicaConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight timings for tests.
    pub fn for_testing() -> Self {
        ReplicaConfig {
            heartbeat_interval_ms: 50,
            heartbeat_failure_limit: 3,
            heartbeat_send_timeout_ms: 500,
            handshake_timeout_ms: 2000,
            ack_every_commands: 1,
            retry_delay_ms: 50,
            poll_timeout_ms: 20,
        }
    }
}

/// Observable replica status.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    /// Current lifecycle state.
    pub state: ReplicaState,
    /// Run id of the primary this session is bound to.
    pub current_master_id: Option<String>,
    /// Bytes applied (baseline plus stream).
    pub replication_offset: u64,
    /// Offset the primary announced at the last sync.
    pub master_replication_offset: u64,
}

struct HandleInner {
    status: ReplicaStatus,
    /// Saved across disconnects for the next PSYNC.
    last_master_id: Option<String>,
    last_offset: i64,
}

/// Shared, observable replica state; mutated only by transitions.
pub struct ReplicaHandle {
    inner: Mutex<HandleInner>,
}

impl ReplicaHandle {
    fn new() -> Self {
        ReplicaHandle {
            inner: Mutex::new(HandleInner {
                status: ReplicaStatus {
                    state: ReplicaState::Disconnected,
                    current_master_id: None,
                    replication_offset: 0,
                    master_replication_offset: 0,
                },
                last_master_id: None,
                last_offset: -1,
            }),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ReplicaStatus {
        self.inner.lock().status.clone()
    }

    /// Saved `(master_id, offset)` for the next PSYNC.
    pub fn saved_sync(&self) -> (Option<String>, i64) {
        let inner = self.inner.lock();
        (inner.last_master_id.clone(), inner.last_offset)
    }

    fn transition(&self, inner: &mut HandleInner, to: ReplicaState) {
        let from = inner.status.state;
        if from != to {
            debug!(target: "ember::repl", %from, %to, "replica transition");
        }
        inner.status.state = to;
    }

    fn on_connecting(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, ReplicaState::Connecting);
    }

    fn on_fullresync(&self, run_id: String, offset: u64) {
        let mut inner = self.inner.lock();
        inner.status.current_master_id = Some(run_id);
        inner.status.master_replication_offset = offset;
        self.transition(&mut inner, ReplicaState::Syncing);
    }

    /// The snapshot is the new baseline; no bytes are added for it.
    fn on_full_sync_complete(&self) {
        let mut inner = self.inner.lock();
        inner.status.replication_offset = inner.status.master_replication_offset;
        self.transition(&mut inner, ReplicaState::Streaming);
    }

    fn on_continue(&self) {
        let mut inner = self.inner.lock();
        let resumed = inner.last_offset.max(0) as u64;
        inner.status.replication_offset = resumed;
        self.transition(&mut inner, ReplicaState::Streaming);
    }

    fn advance_offset(&self, bytes: usize) -> u64 {
        let mut inner = self.inner.lock();
        inner.status.replication_offset += bytes as u64;
        inner.status.replication_offset
    }

    fn on_error(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, ReplicaState::Error);
    }

    fn on_disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.status.current_master_id.is_some() {
            inner.last_master_id = inner.status.current_master_id.clone();
            inner.last_offset = inner.status.replication_offset as i64;
        }
        self.transition(&mut inner, ReplicaState::Disconnected);
    }
}

/// The replica client: owns the session thread and exposes the handle.
pub struct ReplicaClient {
    handle: Arc<ReplicaHandle>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaClient {
    /// Start replicating from `primary_addr`.
    pub fn start(
        primary_addr: String,
        sink: Arc<dyn CommandSink>,
        config: ReplicaConfig,
    ) -> ReplicaClient {
        let handle = Arc::new(ReplicaHandle::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_handle = Arc::clone(&handle);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("ember-replica".to_string())
            .spawn(move || {
                session_loop(primary_addr, thread_handle, sink, config, thread_shutdown);
            })
            .expect("spawn replica session thread");

        ReplicaClient {
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Observable state.
    pub fn handle(&self) -> Arc<ReplicaHandle> {
        Arc::clone(&self.handle)
    }

    /// Stop replicating; the session ends and the thread exits.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReplicaClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn session_loop(
    addr: String,
    handle: Arc<ReplicaHandle>,
    sink: Arc<dyn CommandSink>,
    config: ReplicaConfig,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match run_session(&addr, &handle, &sink, &config, &shutdown) {
            Ok(()) => {}
            Err(ReplError::Protocol(message)) => {
                warn!(target: "ember::repl", %message, "protocol violation");
                handle.on_error();
            }
            Err(e) => {
                debug!(target: "ember::repl", error = %e, "replication session ended");
            }
        }
        // Whatever happened, the state machine re-enters DISCONNECTED with
        // saved sync coordinates before the next attempt.
        handle.on_disconnect();
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        std::thread::sleep(Duration::from_millis(config.retry_delay_ms));
    }
}

fn run_session(
    addr: &str,
    handle: &Arc<ReplicaHandle>,
    sink: &Arc<dyn CommandSink>,
    config: &ReplicaConfig,
    shutdown: &Arc<AtomicBool>,
) -> ReplResult<()> {
    handle.on_connecting();
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(Duration::from_millis(config.handshake_timeout_ms)))?;
    let mut write_half = stream.try_clone()?;
    let mut reader = StreamBuf::new(stream);

    let (saved_id, saved_offset) = handle.saved_sync();
    write_all(
        &mut write_half,
        &psync_command(saved_id.as_deref(), saved_offset),
    )?;

    let line = reader.read_line()?;
    match parse_sync_reply(&line)? {
        SyncReply::FullResync { run_id, offset } => {
            info!(target: "ember::repl", %run_id, offset, "full resync");
            handle.on_fullresync(run_id, offset);
            let blob_len = reader.read_bulk_len()?;
            let image = reader.read_exact_bytes(blob_len)?;
            reader.expect_crlf()?;
            sink.load_snapshot(&image)
                .map_err(|e| ReplError::protocol(format!("snapshot load failed: {}", e)))?;
            handle.on_full_sync_complete();
            // At least one ACK per completed sync.
            write_all(&mut write_half, &replconf_ack(handle.status().replication_offset))?;
        }
        SyncReply::Continue => {
            info!(target: "ember::repl", offset = saved_offset, "partial resync");
            handle.on_continue();
            let bulk_len = reader.read_bulk_len()?;
            let bulk = reader.read_exact_bytes(bulk_len)?;
            reader.expect_crlf()?;
            apply_bulk(&bulk, handle, sink)?;
            write_all(&mut write_half, &replconf_ack(handle.status().replication_offset))?;
        }
    }

    // Streaming phase: poll reads so shutdown and heartbeat death are
    // noticed promptly.
    reader
        .stream()
        .set_read_timeout(Some(Duration::from_millis(config.poll_timeout_ms)))?;

    let session_dead = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(
        write_half.try_clone()?,
        config.clone(),
        Arc::clone(&session_dead),
        Arc::clone(shutdown),
    );

    let mut since_ack = 0usize;
    let result = loop {
        if shutdown.load(Ordering::Acquire) || session_dead.load(Ordering::Acquire) {
            break Ok(());
        }
        match reader.next_command() {
            Ok(None) => continue,
            Ok(Some((args, raw))) => {
                sink.apply(&args, &raw);
                let offset = handle.advance_offset(raw.len());
                since_ack += 1;
                if since_ack >= config.ack_every_commands {
                    since_ack = 0;
                    if write_all(&mut write_half, &replconf_ack(offset)).is_err() {
                        break Ok(());
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    session_dead.store(true, Ordering::Release);
    let _ = heartbeat.join();
    result
}

fn apply_bulk(
    bulk: &[u8],
    handle: &Arc<ReplicaHandle>,
    sink: &Arc<dyn CommandSink>,
) -> ReplResult<()> {
    let mut offset = 0usize;
    while offset < bulk.len() {
        let (args, consumed) = ember_core::decode_command(&bulk[offset..])
            .map_err(|e| ReplError::protocol(format!("bad byte in resync bulk: {}", e)))?;
        sink.apply(&args, &bulk[offset..offset + consumed]);
        handle.advance_offset(consumed);
        offset += consumed;
    }
    Ok(())
}

fn spawn_heartbeat(
    mut socket: TcpStream,
    config: ReplicaConfig,
    session_dead: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("ember-replica-heartbeat".to_string())
        .spawn(move || {
            socket
                .set_write_timeout(Some(Duration::from_millis(config.heartbeat_send_timeout_ms)))
                .ok();
            let mut failures = 0u32;
            loop {
                std::thread::sleep(Duration::from_millis(config.heartbeat_interval_ms));
                if session_dead.load(Ordering::Acquire) || shutdown.load(Ordering::Acquire) {
                    return;
                }
                match write_all(&mut socket, &ping_command()) {
                    Ok(()) => failures = 0,
                    Err(_) => {
                        failures += 1;
                        if failures >= config.heartbeat_failure_limit {
                            warn!(
                                target: "ember::repl",
                                failures,
                                "heartbeat failures, dropping session"
                            );
                            session_dead.store(true, Ordering::Release);
                            return;
                        }
                    }
                }
            }
        })
        .expect("spawn heartbeat thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let handle = ReplicaHandle::new();
        let status = handle.status();
        assert_eq!(status.state, ReplicaState::Disconnected);
        assert_eq!(status.replication_offset, 0);
        assert_eq!(handle.saved_sync(), (None, -1));
    }

    #[test]
    fn test_full_sync_transitions() {
        let handle = ReplicaHandle::new();
        handle.on_connecting();
        assert_eq!(handle.status().state, ReplicaState::Connecting);

        handle.on_fullresync("rid".to_string(), 500);
        let status = handle.status();
        assert_eq!(status.state, ReplicaState::Syncing);
        assert_eq!(status.master_replication_offset, 500);
        // Baseline not applied until the blob is consumed.
        assert_eq!(status.replication_offset, 0);

        handle.on_full_sync_complete();
        let status = handle.status();
        assert_eq!(status.state, ReplicaState::Streaming);
        assert_eq!(status.replication_offset, 500);
    }

    #[test]
    fn test_offset_monotonic_through_stream() {
        let handle = ReplicaHandle::new();
        handle.on_fullresync("rid".to_string(), 100);
        handle.on_full_sync_complete();

        let mut previous = handle.status().replication_offset;
        for raw_len in [14usize, 29, 7, 41] {
            let next = handle.advance_offset(raw_len);
            assert_eq!(next, previous + raw_len as u64);
            previous = next;
        }
        assert_eq!(previous, 100 + 14 + 29 + 7 + 41);
    }

    #[test]
    fn test_disconnect_saves_sync_coordinates() {
        let handle = ReplicaHandle::new();
        handle.on_connecting();
        handle.on_fullresync("rid".to_string(), 100);
        handle.on_full_sync_complete();
        handle.advance_offset(50);

        handle.on_disconnect();
        assert_eq!(handle.status().state, ReplicaState::Disconnected);
        assert_eq!(handle.saved_sync(), (Some("rid".to_string()), 150));
    }

    #[test]
    fn test_disconnect_before_any_sync_saves_nothing() {
        let handle = ReplicaHandle::new();
        handle.on_connecting();
        handle.on_disconnect();
        assert_eq!(handle.saved_sync(), (None, -1));
    }

    #[test]
    fn test_continue_resumes_saved_offset() {
        let handle = ReplicaHandle::new();
        handle.on_fullresync("rid".to_string(), 100);
        handle.on_full_sync_complete();
        handle.advance_offset(20);
        handle.on_disconnect();

        handle.on_connecting();
        handle.on_continue();
        let status = handle.status();
        assert_eq!(status.state, ReplicaState::Streaming);
        assert_eq!(status.replication_offset, 120);
    }

    #[test]
    fn test_error_state_reached() {
        let handle = ReplicaHandle::new();
        handle.on_connecting();
        handle.on_error();
        assert_eq!(handle.status().state, ReplicaState::Error);
        handle.on_disconnect();
        assert_eq!(handle.status().state, ReplicaState::Disconnected);
    }
}
