//! Error types for the wire framing layer.
//!
//! Framing errors are reported to clients as `-ERR` replies and are never
//! fatal to the process. `Incomplete` is not a failure at all: it tells the
//! caller to read more bytes and retry the decode.

use thiserror::Error;

/// Result type alias for framing operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Errors produced while decoding wire frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer ends before the frame does. Read more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,

    /// The bytes do not form a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A bulk string declared a length above the 512 MiB limit.
    #[error("bulk length {0} exceeds maximum")]
    BulkTooLong(i64),

    /// An array declared a length above the 1 048 576 element limit.
    #[error("array length {0} exceeds maximum")]
    ArrayTooLong(i64),
}

impl FrameError {
    /// Create a `Malformed` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        FrameError::Malformed(message.into())
    }

    /// Whether the decode should be retried once more input has arrived.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_is_retryable() {
        assert!(FrameError::Incomplete.is_incomplete());
        assert!(!FrameError::malformed("bad prefix").is_incomplete());
    }

    #[test]
    fn test_display_contains_detail() {
        let msg = FrameError::malformed("expected CRLF").to_string();
        assert!(msg.contains("expected CRLF"));

        let msg = FrameError::BulkTooLong(1 << 40).to_string();
        assert!(msg.contains("exceeds maximum"));
    }
}
