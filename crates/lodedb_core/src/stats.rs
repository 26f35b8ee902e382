//! Environment statistics.
//!
//! Each subsystem owns a set of atomic counters that can be read while
//! operations are in progress. [`crate::Environment::stats`] collects them
//! into one [`EnvStats`] snapshot.
//!
//! ```rust,ignore
//! let stats = env.stats();
//! println!("cache hits: {}", stats.cache.hits);
//! println!("deadlocks: {}", stats.locks.deadlocks);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Log manager counters.
#[derive(Debug, Default)]
pub struct LogStats {
    records: AtomicU64,
    bytes: AtomicU64,
    buffer_writes: AtomicU64,
    syncs: AtomicU64,
    files_created: AtomicU64,
    files_removed: AtomicU64,
}

impl LogStats {
    pub(crate) fn record_append(&self, bytes: u64) {
        bump(&self.records);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_write(&self) {
        bump(&self.buffer_writes);
    }

    pub(crate) fn record_sync(&self) {
        bump(&self.syncs);
    }

    pub(crate) fn record_file_created(&self) {
        bump(&self.files_created);
    }

    pub(crate) fn record_files_removed(&self, count: u64) {
        self.files_removed.fetch_add(count, Ordering::Relaxed);
    }

    /// Total bytes appended since open.
    pub fn bytes(&self) -> u64 {
        load(&self.bytes)
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            records: load(&self.records),
            bytes: load(&self.bytes),
            buffer_writes: load(&self.buffer_writes),
            syncs: load(&self.syncs),
            files_created: load(&self.files_created),
            files_removed: load(&self.files_removed),
        }
    }
}

/// Copy of [`LogStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogStatsSnapshot {
    /// Records appended.
    pub records: u64,
    /// Bytes appended.
    pub bytes: u64,
    /// Buffer write-outs (without sync).
    pub buffer_writes: u64,
    /// Log syncs.
    pub syncs: u64,
    /// Log files started.
    pub files_created: u64,
    /// Log files removed by archiving.
    pub files_removed: u64,
}

/// Page cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    pages_written: AtomicU64,
    io_retries: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        bump(&self.hits);
    }

    pub(crate) fn record_miss(&self) {
        bump(&self.misses);
    }

    pub(crate) fn record_eviction(&self) {
        bump(&self.evictions);
    }

    pub(crate) fn record_page_written(&self) {
        bump(&self.pages_written);
    }

    pub(crate) fn record_io_retry(&self) {
        bump(&self.io_retries);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: load(&self.hits),
            misses: load(&self.misses),
            evictions: load(&self.evictions),
            pages_written: load(&self.pages_written),
            io_retries: load(&self.io_retries),
            dirty_pages: 0,
            capacity: 0,
        }
    }
}

/// Copy of [`CacheStats`] plus gauges filled in by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    /// Fetches served from the cache.
    pub hits: u64,
    /// Fetches that read from disk.
    pub misses: u64,
    /// Frames reused for another page.
    pub evictions: u64,
    /// Pages written back.
    pub pages_written: u64,
    /// Transient I/O failures that were retried.
    pub io_retries: u64,
    /// Dirty frames at snapshot time.
    pub dirty_pages: u64,
    /// Number of frames.
    pub capacity: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of fetches served from the cache.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock manager counters.
#[derive(Debug, Default)]
pub struct LockStats {
    requests: AtomicU64,
    waits: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
    not_granted: AtomicU64,
    detector_runs: AtomicU64,
}

impl LockStats {
    pub(crate) fn record_request(&self) {
        bump(&self.requests);
    }

    pub(crate) fn record_wait(&self) {
        bump(&self.waits);
    }

    pub(crate) fn record_deadlock(&self) {
        bump(&self.deadlocks);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub(crate) fn record_not_granted(&self) {
        bump(&self.not_granted);
    }

    pub(crate) fn record_detector_run(&self) {
        bump(&self.detector_runs);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            requests: load(&self.requests),
            waits: load(&self.waits),
            deadlocks: load(&self.deadlocks),
            timeouts: load(&self.timeouts),
            not_granted: load(&self.not_granted),
            detector_runs: load(&self.detector_runs),
        }
    }
}

/// Copy of [`LockStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStatsSnapshot {
    /// Lock requests.
    pub requests: u64,
    /// Requests that had to wait.
    pub waits: u64,
    /// Requests denied as deadlock victims.
    pub deadlocks: u64,
    /// Requests that timed out.
    pub timeouts: u64,
    /// No-wait requests refused.
    pub not_granted: u64,
    /// Deadlock detector passes.
    pub detector_runs: u64,
}

/// Transaction counters.
#[derive(Debug, Default)]
pub struct TxnStats {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    checkpoints: AtomicU64,
}

impl TxnStats {
    pub(crate) fn record_begin(&self) {
        bump(&self.begun);
    }

    pub(crate) fn record_commit(&self) {
        bump(&self.committed);
    }

    pub(crate) fn record_abort(&self) {
        bump(&self.aborted);
    }

    pub(crate) fn record_checkpoint(&self) {
        bump(&self.checkpoints);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: load(&self.begun),
            committed: load(&self.committed),
            aborted: load(&self.aborted),
            checkpoints: load(&self.checkpoints),
            active: 0,
        }
    }
}

/// Copy of [`TxnStats`] plus the active gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnStatsSnapshot {
    /// Transactions begun.
    pub begun: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Transactions active at snapshot time.
    pub active: u64,
}

/// All environment statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvStats {
    /// Log manager.
    pub log: LogStatsSnapshot,
    /// Page cache.
    pub cache: CacheStatsSnapshot,
    /// Lock manager.
    pub locks: LockStatsSnapshot,
    /// Transactions.
    pub txns: TxnStatsSnapshot,
}
