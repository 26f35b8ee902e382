//! Environment, database and transaction configuration.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Strict two-phase page locking.
    #[default]
    Serializable,
    /// Read locks are released at the end of each operation.
    ReadCommitted,
    /// Reads see the state committed when the transaction began, without
    /// taking read locks. Requires [`EnvConfig::multiversion`].
    Snapshot,
}

/// How much of the log recovery replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Redo from the last checkpoint.
    #[default]
    Normal,
    /// Redo from the first record of the oldest log file still present.
    Catastrophic,
}

/// Configuration for opening an environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    /// Whether to create the environment if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the environment already exists.
    pub error_if_exists: bool,

    /// Page size for new databases. Must be a power of two in
    /// [`MIN_PAGE_SIZE`]..=[`MAX_PAGE_SIZE`]. Ignored for existing
    /// environments, which keep the size they were created with.
    pub page_size: usize,

    /// Number of page frames in the cache.
    pub cache_pages: usize,

    /// Size of the in-memory log buffer; a full buffer is written out
    /// (but not synced).
    pub log_buffer_size: usize,

    /// Log file size at which a new log file is started.
    pub max_log_file_size: u32,

    /// Whether commit flushes the log by default.
    pub sync_on_commit: bool,

    /// How long a lock request may wait (`None` = until granted or
    /// chosen as deadlock victim).
    pub lock_timeout: Option<Duration>,

    /// How often blocked lock requests run the deadlock detector.
    pub deadlock_interval: Duration,

    /// Take a checkpoint after this many log bytes (0 = never).
    pub checkpoint_log_bytes: u64,

    /// Keep frozen page versions so snapshot transactions can run.
    pub multiversion: bool,

    /// Recovery mode used when opening.
    pub recovery: RecoveryMode,

    /// Remove log files no longer needed for recovery after checkpoints.
    pub log_auto_remove: bool,

    /// Retries for transient page I/O failures.
    pub io_retries: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            page_size: 4096,
            cache_pages: 1024,
            log_buffer_size: 256 * 1024,          // 256 KB
            max_log_file_size: 10 * 1024 * 1024, // 10 MB
            sync_on_commit: true,
            lock_timeout: None,
            deadlock_interval: Duration::from_millis(10),
            checkpoint_log_bytes: 0, // disabled
            multiversion: false,
            recovery: RecoveryMode::Normal,
            log_auto_remove: false,
            io_retries: 3,
        }
    }
}

impl EnvConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the environment if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the environment exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the page size for new environments.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the number of cache frames.
    #[must_use]
    pub const fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Sets the log buffer size.
    #[must_use]
    pub const fn log_buffer_size(mut self, size: usize) -> Self {
        self.log_buffer_size = size;
        self
    }

    /// Sets the log file rotation size.
    #[must_use]
    pub const fn max_log_file_size(mut self, size: u32) -> Self {
        self.max_log_file_size = size;
        self
    }

    /// Sets whether commits flush the log by default.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the deadlock detection interval.
    #[must_use]
    pub const fn deadlock_interval(mut self, interval: Duration) -> Self {
        self.deadlock_interval = interval;
        self
    }

    /// Sets the automatic checkpoint threshold in log bytes.
    #[must_use]
    pub const fn checkpoint_log_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_log_bytes = bytes;
        self
    }

    /// Enables or disables multiversion pages.
    #[must_use]
    pub const fn multiversion(mut self, value: bool) -> Self {
        self.multiversion = value;
        self
    }

    /// Sets the recovery mode.
    #[must_use]
    pub const fn recovery(mut self, mode: RecoveryMode) -> Self {
        self.recovery = mode;
        self
    }

    /// Sets whether unneeded log files are removed after checkpoints.
    #[must_use]
    pub const fn log_auto_remove(mut self, value: bool) -> Self {
        self.log_auto_remove = value;
        self
    }

    /// Sets the transient page I/O retry count.
    #[must_use]
    pub const fn io_retries(mut self, retries: u32) -> Self {
        self.io_retries = retries;
        self
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first bad setting.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(CoreError::invalid_argument(format!(
                "page size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.cache_pages < 8 {
            return Err(CoreError::invalid_argument(format!(
                "cache needs at least 8 frames, got {}",
                self.cache_pages
            )));
        }
        if (self.max_log_file_size as usize) < self.page_size * 4 {
            return Err(CoreError::invalid_argument(format!(
                "log file size {} is smaller than four pages",
                self.max_log_file_size
            )));
        }
        if self.log_buffer_size == 0 {
            return Err(CoreError::invalid_argument("log buffer size must be non-zero"));
        }
        if self.deadlock_interval.is_zero() {
            return Err(CoreError::invalid_argument(
                "deadlock interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for opening a database inside an environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbConfig {
    /// Create the database if it does not exist.
    pub create: bool,
    /// Fail if the database already exists.
    pub exclusive_create: bool,
    /// Reject writes through this handle.
    pub read_only: bool,
}

impl DbConfig {
    /// Creates a configuration that opens an existing database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether an existing database is an error.
    #[must_use]
    pub const fn exclusive_create(mut self, value: bool) -> Self {
        self.exclusive_create = value;
        self
    }

    /// Sets whether the handle is read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Fail lock requests immediately instead of waiting.
    pub no_wait: bool,
    /// Override [`EnvConfig::sync_on_commit`] for this transaction.
    pub sync: Option<bool>,
}

impl TxnOptions {
    /// Creates default (serializable, waiting, env-default sync) options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the isolation level.
    #[must_use]
    pub const fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Sets no-wait locking.
    #[must_use]
    pub const fn no_wait(mut self, value: bool) -> Self {
        self.no_wait = value;
        self
    }

    /// Forces or skips the log flush at commit.
    #[must_use]
    pub const fn sync(mut self, value: bool) -> Self {
        self.sync = Some(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EnvConfig::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(config.sync_on_commit);
        assert_eq!(config.page_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = EnvConfig::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .page_size(8192)
            .lock_timeout(Some(Duration::from_millis(50)))
            .multiversion(true);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(50)));
        assert!(config.multiversion);
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert!(EnvConfig::new().page_size(3000).validate().is_err());
        assert!(EnvConfig::new().page_size(256).validate().is_err());
        assert!(EnvConfig::new().page_size(128 * 1024).validate().is_err());
        assert!(EnvConfig::new().page_size(512).validate().is_ok());
    }

    #[test]
    fn rejects_tiny_cache_and_log() {
        assert!(EnvConfig::new().cache_pages(2).validate().is_err());
        assert!(EnvConfig::new().max_log_file_size(1024).validate().is_err());
        assert!(EnvConfig::new()
            .deadlock_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn txn_options_builder() {
        let opts = TxnOptions::new()
            .isolation(IsolationLevel::Snapshot)
            .no_wait(true)
            .sync(false);
        assert_eq!(opts.isolation, IsolationLevel::Snapshot);
        assert!(opts.no_wait);
        assert_eq!(opts.sync, Some(false));
    }
}
