//! Server configuration.
//!
//! Loaded from a JSON file; every key is optional and falls back to its
//! default. Unknown keys and malformed values are configuration errors,
//! which the launcher maps to exit code 3.

use ember_persist::FsyncPolicy;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors (exit code 3 at startup).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON or has unknown/mistyped keys.
    #[error("cannot parse config file: {0}")]
    Parse(String),

    /// A value is out of its valid range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the listener.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Number of databases.
    pub db_count: usize,
    /// Whether the command log is enabled.
    pub aof_enabled: bool,
    /// Whether snapshotting is enabled.
    pub rdb_enabled: bool,
    /// Snapshot file path.
    pub rdb_file: String,
    /// Command log file path.
    pub aof_file: String,
    /// fsync policy: "always", "everysec", or "no".
    pub aof_fsync: String,
    /// Replication backlog capacity in bytes.
    pub backlog_size: usize,
    /// Replica heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db_count: 16,
            aof_enabled: false,
            rdb_enabled: false,
            rdb_file: "dump.rdb".to_string(),
            aof_file: "appendonly.aof".to_string(),
            aof_fsync: "always".to_string(),
            backlog_size: 1024 * 1024,
            heartbeat_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_count == 0 {
            return Err(ConfigError::Invalid("db_count must be at least 1".into()));
        }
        if self.backlog_size == 0 {
            return Err(ConfigError::Invalid("backlog_size must be non-zero".into()));
        }
        if FsyncPolicy::parse(&self.aof_fsync).is_none() {
            return Err(ConfigError::Invalid(format!(
                "aof_fsync must be one of always/everysec/no, got {:?}",
                self.aof_fsync
            )));
        }
        Ok(())
    }

    /// The parsed fsync policy; call after [`ServerConfig::validate`].
    pub fn fsync_policy(&self) -> FsyncPolicy {
        FsyncPolicy::parse(&self.aof_fsync).unwrap_or_default()
    }

    /// Set the port (builder pattern).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Ephemeral port, persistence off; tests layer what they need.
    pub fn for_testing() -> Self {
        ServerConfig {
            port: 0,
            ..Self::default()
        }
    }
}
