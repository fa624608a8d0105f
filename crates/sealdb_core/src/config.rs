//! Database configuration.

use crate::crypto::MasterKey;
use std::path::PathBuf;
use std::time::Duration;

/// Default file chunk size: 5 MB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1000 * 1000;

/// Default inactivity timeout before a file reader or writer closes
/// itself. Prevents handles left open by mistake from pinning the file
/// in write mode forever.
pub const DEFAULT_READER_WRITER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default per-request deadline on the write queue.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on candidate ids returned by one index query.
pub const DEFAULT_INTERNAL_QUERY_LIMIT: usize = 10_000;

/// Default capacity of the bounded write channel.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Config {
    /// Storage directory.
    pub path: PathBuf,

    /// 32-byte master key protecting the config blob (which in turn
    /// wraps the content key every value is sealed under).
    pub master_key: MasterKey,

    /// Default chunk size for new files, in bytes.
    pub chunk_size: usize,

    /// Inactivity timeout after which file reader/writer handles
    /// auto-close.
    pub reader_writer_timeout: Duration,

    /// Deadline applied to write-queue submissions that do not carry
    /// their own.
    pub transaction_timeout: Duration,

    /// Cap on candidate ids per index scan.
    pub internal_query_limit: usize,

    /// Capacity of the bounded write channel; producers block when it
    /// is full.
    pub queue_depth: usize,
}

impl Config {
    /// Creates a configuration with default values for the given path
    /// and master key.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, master_key: MasterKey) -> Self {
        Self {
            path: path.into(),
            master_key,
            chunk_size: DEFAULT_CHUNK_SIZE,
            reader_writer_timeout: DEFAULT_READER_WRITER_TIMEOUT,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            internal_query_limit: DEFAULT_INTERNAL_QUERY_LIMIT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Sets the default file chunk size.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the handle inactivity timeout.
    #[must_use]
    pub fn reader_writer_timeout(mut self, timeout: Duration) -> Self {
        self.reader_writer_timeout = timeout;
        self
    }

    /// Sets the default write-queue deadline.
    #[must_use]
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the cap on candidate ids per index scan.
    #[must_use]
    pub fn internal_query_limit(mut self, limit: usize) -> Self {
        self.internal_query_limit = limit;
        self
    }

    /// Sets the write channel capacity.
    #[must_use]
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("master_key", &"[REDACTED]")
            .field("chunk_size", &self.chunk_size)
            .field("reader_writer_timeout", &self.reader_writer_timeout)
            .field("transaction_timeout", &self.transaction_timeout)
            .field("internal_query_limit", &self.internal_query_limit)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("/tmp/db", MasterKey::generate());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.reader_writer_timeout, DEFAULT_READER_WRITER_TIMEOUT);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new("/tmp/db", MasterKey::generate())
            .chunk_size(100_000)
            .transaction_timeout(Duration::from_secs(1))
            .queue_depth(0);
        assert_eq!(config.chunk_size, 100_000);
        assert_eq!(config.transaction_timeout, Duration::from_secs(1));
        // Depth is clamped to at least one slot.
        assert_eq!(config.queue_depth, 1);
    }

    #[test]
    fn debug_redacts_key() {
        let config = Config::new("/tmp/db", MasterKey::generate());
        let rendered = format!("{config:?}");
        assert!(rendered.contains("REDACTED"));
    }
}
