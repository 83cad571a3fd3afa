//! Command log configuration.

/// When the log file is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync after every write batch.
    #[default]
    Always,
    /// Coalesce fsyncs on the flush interval.
    EverySec,
    /// Leave flushing to the operating system.
    No,
}

impl FsyncPolicy {
    /// Parse the configuration value.
    pub fn parse(text: &str) -> Option<FsyncPolicy> {
        match text {
            "always" => Some(FsyncPolicy::Always),
            "everysec" => Some(FsyncPolicy::EverySec),
            "no" => Some(FsyncPolicy::No),
            _ => None,
        }
    }
}

/// Command log configuration parameters.
#[derive(Debug, Clone)]
pub struct AofConfig {
    /// Maximum queued items before enqueue blocks (default 1000).
    pub queue_items_max: usize,

    /// Maximum queued bytes before enqueue blocks (default 6 MiB).
    pub queue_bytes_max: usize,

    /// Maximum items consolidated into one write syscall (default 50).
    pub batch_items_max: usize,

    /// Commands at or above this size skip batching and are written alone
    /// (default 512 KiB).
    pub direct_write_bytes: usize,

    /// Pre-allocation unit; the file starts at one chunk and grows by one
    /// chunk at a time (default 4 MiB).
    pub preallocate_bytes: u64,

    /// fsync policy.
    pub fsync: FsyncPolicy,

    /// Coalescing granularity for [`FsyncPolicy::EverySec`], in ms.
    pub flush_interval_ms: u64,

    /// A single write syscall slower than this is logged (default 1 s).
    pub slow_write_warn_ms: u64,
}

impl Default for AofConfig {
    fn default() -> Self {
        AofConfig {
            queue_items_max: 1000,
            queue_bytes_max: 6 * 1024 * 1024,
            batch_items_max: 50,
            direct_write_bytes: 512 * 1024,
            preallocate_bytes: 4 * 1024 * 1024,
            fsync: FsyncPolicy::Always,
            flush_interval_ms: 1000,
            slow_write_warn_ms: 1000,
        }
    }
}

impl AofConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fsync policy (builder pattern).
    pub fn with_fsync(mut self, fsync: FsyncPolicy) -> Self {
        self.fsync = fsync;
        self
    }

    /// Set the queue byte bound (builder pattern).
    pub fn with_queue_bytes_max(mut self, bytes: usize) -> Self {
        self.queue_bytes_max = bytes;
        self
    }

    /// Set the queue item bound (builder pattern).
    pub fn with_queue_items_max(mut self, items: usize) -> Self {
        self.queue_items_max = items;
        self
    }

    /// Set the pre-allocation chunk (builder pattern).
    pub fn with_preallocate_bytes(mut self, bytes: u64) -> Self {
        self.preallocate_bytes = bytes;
        self
    }

    /// Configuration sized for tests: tiny pre-allocation, small queue.
    pub fn for_testing() -> Self {
        AofConfig {
            queue_items_max: 64,
            queue_bytes_max: 64 * 1024,
            batch_items_max: 8,
            direct_write_bytes: 8 * 1024,
            preallocate_bytes: 4 * 1024,
            fsync: FsyncPolicy::Always,
            flush_interval_ms: 20,
            slow_write_warn_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AofConfig::default();
        assert_eq!(config.queue_items_max, 1000);
        assert_eq!(config.queue_bytes_max, 6 * 1024 * 1024);
        assert_eq!(config.preallocate_bytes, 4 * 1024 * 1024);
        assert_eq!(config.fsync, FsyncPolicy::Always);
    }

    #[test]
    fn test_builder() {
        let config = AofConfig::new()
            .with_fsync(FsyncPolicy::EverySec)
            .with_queue_bytes_max(1024);
        assert_eq!(config.fsync, FsyncPolicy::EverySec);
        assert_eq!(config.queue_bytes_max, 1024);
    }

    #[test]
    fn test_fsync_parse() {
        assert_eq!(FsyncPolicy::parse("always"), Some(FsyncPolicy::Always));
        assert_eq!(FsyncPolicy::parse("everysec"), Some(FsyncPolicy::EverySec));
        assert_eq!(FsyncPolicy::parse("no"), Some(FsyncPolicy::No));
        assert_eq!(FsyncPolicy::parse("sometimes"), None);
    }
}
