//! Command log recovery.
//!
//! Streams the log, decoding one command array at a time and re-executing it
//! through the keyspace. A torn trailing record — a short read, a length
//! that runs past the end, or a byte that cannot start a command array
//! (which is what pre-allocation padding looks like) — is logged and
//! skipped; recovery never aborts on partial data. The returned report
//! carries the valid tail so the writer resumes exactly where the intact
//! prefix ends.

use crate::error::PersistResult;
use ember_core::{decode_command, FrameError};
use ember_store::{commands, ConnState, Keyspace};
use std::path::Path;
use tracing::{info, warn};

/// Result of replaying a command log.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Commands successfully re-executed.
    pub applied: usize,
    /// Commands that decoded but failed execution (logged, skipped).
    pub failed: usize,
    /// Byte length of the intact prefix; the writer resumes here.
    pub valid_len: u64,
    /// Bytes discarded past the intact prefix (torn tail or padding).
    pub discarded: u64,
}

/// Replay the log at `path` into the keyspace.
///
/// A missing file is an empty log, not an error.
pub fn recover(path: &Path, keyspace: &Keyspace) -> PersistResult<RecoveryReport> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RecoveryReport::default())
        }
        Err(e) => return Err(e.into()),
    };
    let report = recover_slice(&bytes, keyspace);
    info!(
        target: "ember::aof",
        applied = report.applied,
        failed = report.failed,
        discarded = report.discarded,
        path = %path.display(),
        "command log recovered"
    );
    Ok(report)
}

/// Replay an in-memory log image.
pub fn recover_slice(bytes: &[u8], keyspace: &Keyspace) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut conn = ConnState::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        match decode_command(&bytes[offset..]) {
            Ok((args, consumed)) => {
                let outcome = commands::execute(keyspace, &mut conn, &args);
                if let ember_core::Reply::Error(message) = &outcome.reply {
                    // The log records commands that executed successfully
                    // once; an error here means operator-edited or
                    // cross-version data. Skip and keep going.
                    warn!(target: "ember::aof", error = %message, "recovered command failed");
                    report.failed += 1;
                } else {
                    report.applied += 1;
                }
                offset += consumed;
            }
            Err(FrameError::Incomplete) => {
                warn!(
                    target: "ember::aof",
                    offset,
                    remaining = bytes.len() - offset,
                    "torn record at log tail, truncating"
                );
                break;
            }
            Err(_) => {
                // First byte that cannot start a command array: the
                // boundary between real data and padding or torn bytes.
                break;
            }
        }
    }

    report.valid_len = offset as u64;
    report.discarded = (bytes.len() - offset) as u64;
    report
}
