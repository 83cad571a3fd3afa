//! Append-only command log.
//!
//! The log is the concatenation of executed write commands in commit order,
//! framed exactly as they travel on the wire. The engine wraps the batched
//! [`writer::LogWriter`] with database-select framing: whenever a command
//! targets a different database than the previous logged one, a `SELECT`
//! command is injected ahead of it so recovery lands every write in the
//! right database.
//!
//! During a background rewrite every appended command is also buffered in a
//! side queue (with its database index, framing resolved at cutover), which
//! the rewrite appends to the fresh file before atomically swapping it in.

pub mod config;
pub mod recovery;
pub mod rewrite;
pub mod writer;

pub use config::{AofConfig, FsyncPolicy};
pub use recovery::{recover, recover_slice, RecoveryReport};
pub use rewrite::RewriteReport;
pub use writer::LogWriter;

use crate::error::PersistResult;
use ember_core::{encode_command, ByteString};
use ember_store::Keyspace;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub(crate) struct AppendState {
    /// Database the last logged command executed against.
    pub(crate) last_db: Option<usize>,
    /// Buffered `(db, bytes)` while a rewrite is in flight.
    pub(crate) side_queue: Option<Vec<(usize, Vec<u8>)>>,
}

/// The command log engine: select framing, batched writer, rewrite.
pub struct AofEngine {
    pub(crate) path: PathBuf,
    pub(crate) config: AofConfig,
    pub(crate) writer: LogWriter,
    pub(crate) append_state: Mutex<AppendState>,
    pub(crate) rewriting: Arc<AtomicBool>,
}

/// Encode the `SELECT <db>` framing command.
pub(crate) fn select_command(db_index: usize) -> Vec<u8> {
    encode_command(&[
        ByteString::from("SELECT"),
        ByteString::from_string(db_index.to_string()),
    ])
}

impl AofEngine {
    /// Recover the log into `keyspace`, then open the writer at the intact
    /// tail.
    pub fn open(
        path: impl Into<PathBuf>,
        config: AofConfig,
        keyspace: &Keyspace,
    ) -> PersistResult<(AofEngine, RecoveryReport)> {
        let path = path.into();
        let report = recover(&path, keyspace)?;
        let writer = LogWriter::start(&path, report.valid_len, config.clone())?;
        let engine = AofEngine {
            path,
            config,
            writer,
            append_state: Mutex::new(AppendState {
                last_db: None,
                side_queue: None,
            }),
            rewriting: Arc::new(AtomicBool::new(false)),
        };
        Ok((engine, report))
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one executed write command, blocking under backpressure.
    ///
    /// `bytes` is the command's canonical wire encoding; `db_index` is the
    /// database it executed against.
    pub fn append(&self, db_index: usize, bytes: Vec<u8>) -> PersistResult<()> {
        let mut state = self.append_state.lock();
        if let Some(side) = &mut state.side_queue {
            side.push((db_index, bytes.clone()));
        }
        if state.last_db != Some(db_index) {
            self.writer.enqueue(select_command(db_index))?;
            state.last_db = Some(db_index);
        }
        self.writer.enqueue(bytes)
    }

    /// Block until everything appended so far is on disk.
    pub fn drain(&self) -> PersistResult<()> {
        self.writer.drain()
    }

    /// Whether a rewrite is currently running.
    pub fn rewrite_in_progress(&self) -> bool {
        self.rewriting.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Stop the writer thread, truncating the file to its logical tail.
    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}
