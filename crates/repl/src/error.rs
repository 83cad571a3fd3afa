//! Error types for replication.

use std::io;
use thiserror::Error;

/// Result type alias for replication operations.
pub type ReplResult<T> = std::result::Result<T, ReplError>;

/// Errors raised on either side of the replication link.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Socket read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent bytes inconsistent with its state. The connection is
    /// closed; a replica transitions to ERROR then DISCONNECTED.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The handshake did not complete within its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A partial-resync range is no longer (or not yet) in the backlog.
    #[error("backlog cannot serve offset {from} (available {earliest}..{latest})")]
    BacklogUnavailable {
        /// Requested start offset.
        from: u64,
        /// Earliest servable offset.
        earliest: u64,
        /// Latest offset in the backlog.
        latest: u64,
    },

    /// Full-resync snapshot generation failed on the primary.
    #[error("snapshot generation failed: {0}")]
    SnapshotFailed(String),
}

impl ReplError {
    /// Create a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        ReplError::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_unavailable_display() {
        let err = ReplError::BacklogUnavailable {
            from: 10,
            earliest: 100,
            latest: 200,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("100..200"));
    }
}
