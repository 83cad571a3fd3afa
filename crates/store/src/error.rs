//! Error types for command execution.
//!
//! Every variant maps to a client-visible error reply; none of them is fatal
//! to the process. The conversion to a reply lives here so the server,
//! recovery, and replication paths all render errors identically.

use ember_core::Reply;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by command execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Operation against a key holding the wrong value type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A client-supplied value failed integer parsing.
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// A client-supplied score failed float parsing.
    #[error("value is not a valid float")]
    NotAFloat,

    /// Wrong number of arguments for a command.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// Command name not in the dispatch table.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Any other malformed input.
    #[error("{0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Create an `InvalidArgument` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    /// Render as the wire reply sent to the client.
    ///
    /// `WrongType` keeps its own error class prefix; everything else is an
    /// `ERR`-class reply.
    pub fn to_reply(&self) -> Reply {
        match self {
            StoreError::WrongType => Reply::Error(self.to_string()),
            other => Reply::Error(format!("ERR {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrongtype_keeps_error_class() {
        let reply = StoreError::WrongType.to_reply();
        match reply {
            Reply::Error(msg) => assert!(msg.starts_with("WRONGTYPE")),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_err_class_prefix() {
        let reply = StoreError::NotAnInteger.to_reply();
        match reply {
            Reply::Error(msg) => assert!(msg.starts_with("ERR ")),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_arity_names_command() {
        let msg = StoreError::WrongArity("get".to_string()).to_string();
        assert!(msg.contains("'get'"));
    }
}
