//! Server assembly: keyspace + persistence + replication.
//!
//! The server owns the startup recovery order (command log wins over the
//! snapshot when both are enabled), the commit lock that keeps the
//! replication stream and the command log in the same order, and the
//! infrastructure commands (SAVE, BGSAVE, BGREWRITEAOF, INFO, REPLICAOF)
//! that sit above the keyspace command table.

use crate::config::ServerConfig;
use ember_core::{encode_command, encode_reply, ByteString, Reply};
use ember_persist::{
    load_file, load_slice, serialize_keyspace, AofConfig, AofEngine, PersistError, SnapshotEngine,
};
use ember_repl::{
    CommandSink, CoordinatorConfig, ReplicaClient, ReplicaConfig, ReplicaStatus,
    ReplicationCoordinator, SnapshotSource,
};
use ember_store::{commands, ConnState, Keyspace};
use parking_lot::Mutex;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Whether this process is currently a primary or a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting writes and feeding replicas.
    Primary,
    /// Following a primary.
    Replica,
}

/// Fatal startup failures (exit code 2 at the launcher).
#[derive(Debug, Error)]
pub enum StartupError {
    /// Snapshot or command log could not be loaded.
    #[error("persistence load failed: {0}")]
    Persistence(#[from] PersistError),
}

/// The assembled server.
pub struct Server {
    config: ServerConfig,
    keyspace: Arc<Keyspace>,
    snapshot: Option<SnapshotEngine>,
    aof: Option<Arc<AofEngine>>,
    coordinator: ReplicationCoordinator,
    /// Held across backlog propagation and log append so both see every
    /// write in the same order (the commit order).
    commit_lock: Mutex<()>,
    replica: Mutex<Option<ReplicaClient>>,
}

impl Server {
    /// Build the server and run startup recovery.
    ///
    /// When both engines are enabled the command log is authoritative: it
    /// contains everything the snapshot does plus the tail, so the
    /// snapshot file is left for the next SAVE to refresh.
    pub fn bootstrap(config: ServerConfig) -> Result<Arc<Server>, StartupError> {
        let keyspace = Arc::new(Keyspace::new(config.db_count));

        let snapshot = config
            .rdb_enabled
            .then(|| SnapshotEngine::new(&config.rdb_file));

        let mut aof = None;
        if config.aof_enabled {
            let aof_config = AofConfig::new().with_fsync(config.fsync_policy());
            let (engine, report) = AofEngine::open(&config.aof_file, aof_config, &keyspace)?;
            info!(
                target: "ember::server",
                applied = report.applied,
                discarded = report.discarded,
                "command log recovered"
            );
            aof = Some(Arc::new(engine));
        } else if config.rdb_enabled && Path::new(&config.rdb_file).exists() {
            let report = load_file(Path::new(&config.rdb_file), &keyspace)?;
            info!(target: "ember::server", keys = report.keys_loaded, "snapshot loaded");
        }

        let coordinator = ReplicationCoordinator::new(
            CoordinatorConfig::new().with_backlog_capacity(config.backlog_size),
        );

        Ok(Arc::new(Server {
            config,
            keyspace,
            snapshot,
            aof,
            coordinator,
            commit_lock: Mutex::new(()),
            replica: Mutex::new(None),
        }))
    }

    /// The keyspace (integration tests drive it directly).
    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    /// The replication coordinator.
    pub fn coordinator(&self) -> &ReplicationCoordinator {
        &self.coordinator
    }

    /// Current role.
    pub fn role(&self) -> Role {
        if self.replica.lock().is_some() {
            Role::Replica
        } else {
            Role::Primary
        }
    }

    /// Replica-side status when following a primary.
    pub fn replica_status(&self) -> Option<ReplicaStatus> {
        self.replica.lock().as_ref().map(|r| r.handle().status())
    }

    /// Whether a command-log rewrite is currently running.
    pub fn log_rewrite_in_progress(&self) -> bool {
        self.aof
            .as_ref()
            .is_some_and(|aof| aof.rewrite_in_progress())
    }

    /// Execute one decoded command from a client connection.
    pub fn handle_command(self: &Arc<Self>, conn: &mut ConnState, args: &[ByteString]) -> Reply {
        let Some(name) = args.first() else {
            return Reply::err("empty command");
        };
        let upper = name.as_bytes().to_ascii_uppercase();
        match upper.as_slice() {
            b"SAVE" => self.cmd_save(),
            b"BGSAVE" => self.cmd_bgsave(),
            b"BGREWRITEAOF" => self.cmd_bgrewriteaof(),
            b"INFO" => self.cmd_info(),
            b"REPLICAOF" | b"SLAVEOF" => self.cmd_replicaof(args),
            // Replicas send REPLCONF during setup; acknowledge and move on.
            b"REPLCONF" => Reply::ok(),
            _ => {
                // Execution and propagation stay under one database write
                // lock so the commit order matches the execution order.
                let db_index = conn.db_index;
                let db = self.keyspace.db(db_index);
                let _guard = db.lock_writes();
                let outcome = commands::execute_pre_locked(&self.keyspace, conn, args);
                if outcome.dirty {
                    self.commit_write(db_index, args);
                }
                outcome.reply
            }
        }
    }

    /// Propagate and log one executed write, in commit order.
    fn commit_write(&self, db_index: usize, args: &[ByteString]) {
        let raw = encode_command(args);
        let _order = self.commit_lock.lock();
        self.coordinator.propagate(db_index, &raw);
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.append(db_index, raw) {
                // Live-log failure: the writer already refuses further
                // appends; surface loudly and keep serving reads.
                error!(target: "ember::server", error = %e, "command log append failed");
            }
        }
    }

    /// Hand a connection over to the replication coordinator after PSYNC.
    pub fn handle_psync(self: &Arc<Self>, stream: TcpStream, args: &[ByteString]) {
        if args.len() != 3 {
            let mut out = Vec::new();
            encode_reply(&Reply::err("wrong number of arguments for 'psync'"), &mut out);
            let mut stream = stream;
            let _ = std::io::Write::write_all(&mut stream, &out);
            return;
        }
        let requested_id = match args[1].as_str() {
            Some("?") | None => None,
            Some(id) => Some(id.to_string()),
        };
        let requested_offset = args[2].parse_i64().unwrap_or(-1);

        // Freeze every database for the handshake. A writer that already
        // executed but has not yet committed could otherwise leak its
        // mutation into the snapshot blob while its command is also
        // streamed afterwards. Database locks are always acquired before
        // the coordinator lock, so this nests cleanly with the commit path.
        let _frozen: Vec<_> = self
            .keyspace
            .databases()
            .iter()
            .map(|db| db.lock_writes())
            .collect();
        match self.coordinator.accept_replica(
            stream,
            requested_id.as_deref(),
            requested_offset,
            &**self as &dyn SnapshotSource,
        ) {
            Ok(kind) => info!(target: "ember::server", ?kind, "replica synchronised"),
            Err(e) => warn!(target: "ember::server", error = %e, "psync failed"),
        }
    }

    fn cmd_save(&self) -> Reply {
        match &self.snapshot {
            Some(engine) => match engine.save(&self.keyspace) {
                Ok(report) => {
                    info!(target: "ember::server", keys = report.keys_written, "SAVE complete");
                    Reply::ok()
                }
                Err(PersistError::SaveInProgress) => {
                    Reply::err("background save already in progress")
                }
                Err(e) => Reply::err(format!("save failed: {}", e)),
            },
            None => Reply::err("snapshotting is disabled"),
        }
    }

    fn cmd_bgsave(&self) -> Reply {
        match &self.snapshot {
            Some(engine) => match engine.save_in_background(&self.keyspace) {
                Ok(_handle) => Reply::Simple("Background saving started".to_string()),
                Err(PersistError::SaveInProgress) => {
                    Reply::err("background save already in progress")
                }
                Err(e) => Reply::err(format!("bgsave failed: {}", e)),
            },
            None => Reply::err("snapshotting is disabled"),
        }
    }

    fn cmd_bgrewriteaof(&self) -> Reply {
        match &self.aof {
            Some(aof) => match aof.rewrite(&self.keyspace) {
                Ok(_handle) => {
                    Reply::Simple("Background append only file rewriting started".to_string())
                }
                Err(PersistError::RewriteInProgress) => {
                    Reply::err("background rewrite already in progress")
                }
                Err(e) => Reply::err(format!("rewrite failed: {}", e)),
            },
            None => Reply::err("append only mode is disabled"),
        }
    }

    fn cmd_info(&self) -> Reply {
        let mut out = String::new();
        out.push_str("# Replication\r\n");
        match self.replica_status() {
            None => {
                out.push_str("role:master\r\n");
                out.push_str(&format!("master_replid:{}\r\n", self.coordinator.run_id()));
                out.push_str(&format!(
                    "master_repl_offset:{}\r\n",
                    self.coordinator.master_offset()
                ));
                let peers = self.coordinator.peers();
                out.push_str(&format!("connected_slaves:{}\r\n", peers.len()));
                for (i, peer) in peers.iter().enumerate() {
                    out.push_str(&format!(
                        "slave{}:addr={},ack={}\r\n",
                        i, peer.addr, peer.acked_offset
                    ));
                }
            }
            Some(status) => {
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_link_status:{}\r\n", status.state));
                out.push_str(&format!(
                    "slave_repl_offset:{}\r\n",
                    status.replication_offset
                ));
                if let Some(id) = &status.current_master_id {
                    out.push_str(&format!("master_replid:{}\r\n", id));
                }
            }
        }
        Reply::Bulk(ByteString::from_string(out))
    }

    fn cmd_replicaof(self: &Arc<Self>, args: &[ByteString]) -> Reply {
        if args.len() != 3 {
            return Reply::err("wrong number of arguments for 'replicaof'");
        }
        let first = args[1].as_str().unwrap_or("");
        let second = args[2].as_str().unwrap_or("");
        if first.eq_ignore_ascii_case("no") && second.eq_ignore_ascii_case("one") {
            if let Some(client) = self.replica.lock().take() {
                client.stop();
                info!(target: "ember::server", "promoted to primary");
            }
            return Reply::ok();
        }
        let Ok(port) = second.parse::<u16>() else {
            return Reply::err("invalid port");
        };
        let addr = format!("{}:{}", first, port);

        let mut slot = self.replica.lock();
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        let sink = Arc::new(ReplicaSink {
            server: Arc::clone(self),
            conn: Mutex::new(ConnState::new()),
        });
        let replica_config = ReplicaConfig {
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            ..ReplicaConfig::default()
        };
        *slot = Some(ReplicaClient::start(addr.clone(), sink, replica_config));
        info!(target: "ember::server", %addr, "now replicating");
        Reply::ok()
    }

    /// Bind the listener per the configured host and port.
    pub fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind((self.config.host.as_str(), self.config.port))
    }

    /// Accept loop; one thread per connection.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(self);
                    let spawned = std::thread::Builder::new()
                        .name("ember-conn".to_string())
                        .spawn(move || crate::conn::serve_connection(server, stream));
                    if let Err(e) = spawned {
                        error!(target: "ember::server", error = %e, "spawn failed");
                    }
                }
                Err(e) => warn!(target: "ember::server", error = %e, "accept failed"),
            }
        }
    }

    /// Orderly shutdown: stop replication, flush and close the log.
    pub fn shutdown(&self) {
        if let Some(client) = self.replica.lock().take() {
            client.stop();
        }
        if let Some(aof) = &self.aof {
            aof.shutdown();
        }
    }
}

impl SnapshotSource for Server {
    fn full_snapshot(&self) -> Result<Vec<u8>, String> {
        serialize_keyspace(&self.keyspace).map_err(|e| e.to_string())
    }
}

/// Where the replica session lands replicated commands.
struct ReplicaSink {
    server: Arc<Server>,
    /// Session-scoped connection state; SELECT frames in the stream move it.
    conn: Mutex<ConnState>,
}

impl CommandSink for ReplicaSink {
    fn apply(&self, args: &[ByteString], raw: &[u8]) {
        let mut conn = self.conn.lock();
        let outcome = commands::execute(&self.server.keyspace, &mut conn, args);
        if outcome.dirty {
            if let Some(aof) = &self.server.aof {
                if let Err(e) = aof.append(conn.db_index, raw.to_vec()) {
                    error!(target: "ember::server", error = %e, "replica log append failed");
                }
            }
        }
    }

    fn load_snapshot(&self, image: &[u8]) -> Result<(), String> {
        self.server.keyspace.flush_all();
        *self.conn.lock() = ConnState::new();
        load_slice(image, &self.server.keyspace)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
