//! Error types for the persistence engines.

use std::io;
use thiserror::Error;

/// Result type alias for persistence operations.
pub type PersistResult<T> = std::result::Result<T, PersistError>;

/// Errors raised by the snapshot engine and the command log.
#[derive(Debug, Error)]
pub enum PersistError {
    /// File read/write/fsync failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch or malformed framing in a file being loaded.
    ///
    /// At startup this aborts the process; the data cannot be trusted.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A background save is already running against this file.
    #[error("background save already in progress")]
    SaveInProgress,

    /// A background rewrite is already running.
    #[error("background rewrite already in progress")]
    RewriteInProgress,

    /// A background save or rewrite was cancelled; the temp file was removed.
    #[error("background operation cancelled")]
    Cancelled,

    /// The log writer has shut down or refused writes after a live-file
    /// I/O failure.
    #[error("command log writer unavailable: {0}")]
    WriterClosed(String),
}

impl PersistError {
    /// Create a `Corruption` error.
    pub fn corruption(message: impl Into<String>) -> Self {
        PersistError::Corruption(message.into())
    }

    /// Whether this error means on-disk data cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, PersistError::Corruption(_))
    }

    /// Whether this error came from the I/O layer.
    pub fn is_io(&self) -> bool {
        matches!(self, PersistError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        assert!(PersistError::corruption("bad crc").is_corruption());
        assert!(!PersistError::corruption("bad crc").is_io());

        let io_err: PersistError = io::Error::new(io::ErrorKind::Other, "disk full").into();
        assert!(io_err.is_io());
        assert!(!io_err.is_corruption());
    }
}
