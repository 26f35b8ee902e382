//! Error types for LodeDB core.
//!
//! Every failure is a [`CoreError`] variant carrying the resource and
//! transaction it concerns. [`CoreError::kind`] folds the variants into the
//! handful of [`ErrorKind`] categories callers act on.

use crate::types::{Lsn, PageKey, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// What the caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Abort the transaction and run it again from the start.
    Retryable,
    /// The handle is closed or was invalidated; reopen it.
    HandleInvalid,
    /// The replication topology changed; back off and find the master.
    ReplicationTopology,
    /// Stop writing; the environment must be reopened with recovery.
    Fatal,
    /// A normal outcome of the call (missing key, duplicate key).
    Outcome,
    /// The call itself was wrong (bad argument, wrong state).
    Usage,
}

/// Errors that can occur in LodeDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] lodedb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transaction was chosen as deadlock victim.
    #[error("deadlock: {txid} chosen as victim while waiting for {resource}")]
    Deadlock {
        /// The victim transaction.
        txid: TransactionId,
        /// The resource it was waiting for.
        resource: String,
    },

    /// A lock wait exceeded the configured timeout.
    #[error("lock timeout: {txid} waiting for {resource}")]
    LockTimeout {
        /// The waiting transaction.
        txid: TransactionId,
        /// The contended resource.
        resource: String,
    },

    /// A no-wait lock request found the resource held.
    #[error("lock not granted: {txid} on {resource}")]
    LockNotGranted {
        /// The requesting transaction.
        txid: TransactionId,
        /// The contended resource.
        resource: String,
    },

    /// A snapshot transaction tried to write a page changed after its snapshot.
    #[error("update conflict: {txid} on page {page}")]
    UpdateConflict {
        /// The snapshot transaction.
        txid: TransactionId,
        /// The page that changed.
        page: PageKey,
    },

    /// Every page in the cache is pinned.
    #[error("page cache exhausted: all {capacity} frames pinned")]
    CacheExhausted {
        /// Number of frames in the cache.
        capacity: usize,
    },

    /// The key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists and overwrite was not allowed.
    #[error("key already exists")]
    KeyExists,

    /// The handle (environment or database) has been closed.
    #[error("handle is closed")]
    HandleClosed,

    /// The handle was invalidated by a replication rollback.
    #[error("handle dead: opened at epoch {opened}, environment now at epoch {current}")]
    HandleDead {
        /// Epoch recorded when the handle was opened.
        opened: u64,
        /// Current environment epoch.
        current: u64,
    },

    /// The transaction is no longer active.
    #[error("{txid} is not active ({state})")]
    TransactionClosed {
        /// The transaction.
        txid: TransactionId,
        /// Its current state.
        state: &'static str,
    },

    /// This site is not the replication master.
    #[error("writes rejected: this site is not the replication master")]
    NotMaster,

    /// Another site is master; this site has been demoted.
    #[error("duplicate master: generation {generation} has another master")]
    DuplicateMaster {
        /// The generation in which the conflict was detected.
        generation: u32,
    },

    /// An election is in progress; writes are suspended.
    #[error("election in progress")]
    ElectionInProgress,

    /// Writing or syncing the log failed.
    #[error("log I/O failure: {message}")]
    LogIo {
        /// Description of the failure.
        message: String,
    },

    /// The log is corrupted or invalid.
    #[error("log corruption at {lsn}: {message}")]
    LogCorruption {
        /// Position of the bad record.
        lsn: Lsn,
        /// Description of the corruption.
        message: String,
    },

    /// A page failed checksum verification when read from disk.
    #[error("page {page} checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// The damaged page.
        page: PageKey,
        /// Checksum stored in the page.
        expected: u32,
        /// Checksum computed over the page.
        actual: u32,
    },

    /// The environment hit a fatal error and must be reopened with recovery.
    #[error("run recovery: {reason}")]
    RunRecovery {
        /// The fatal error that poisoned the environment.
        reason: String,
    },

    /// The environment directory is held by another process.
    #[error("environment locked: another process has exclusive access")]
    EnvironmentLocked,

    /// The named database does not exist.
    #[error("database not found: {name}")]
    DatabaseNotFound {
        /// Name of the database.
        name: String,
    },

    /// The named database already exists.
    #[error("database already exists: {name}")]
    DatabaseExists {
        /// Name of the database.
        name: String,
    },

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Deadlock { .. }
            | Self::LockTimeout { .. }
            | Self::LockNotGranted { .. }
            | Self::UpdateConflict { .. }
            | Self::CacheExhausted { .. } => ErrorKind::Retryable,
            Self::HandleClosed | Self::HandleDead { .. } | Self::TransactionClosed { .. } => {
                ErrorKind::HandleInvalid
            }
            Self::NotMaster | Self::DuplicateMaster { .. } | Self::ElectionInProgress => {
                ErrorKind::ReplicationTopology
            }
            Self::Storage(_)
            | Self::Io(_)
            | Self::LogIo { .. }
            | Self::LogCorruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::RunRecovery { .. }
            | Self::InvalidFormat { .. } => ErrorKind::Fatal,
            Self::KeyNotFound
            | Self::KeyExists
            | Self::DatabaseNotFound { .. }
            | Self::DatabaseExists { .. } => ErrorKind::Outcome,
            Self::EnvironmentLocked
            | Self::InvalidArgument { .. }
            | Self::InvalidOperation { .. } => ErrorKind::Usage,
        }
    }

    /// Returns true if the transaction should be retried from the start.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Returns true if the error poisons the environment.
    ///
    /// Only log failures and detected corruption qualify; a plain I/O error
    /// from a page read that was retried and gave up is reported as fatal
    /// to the caller without poisoning.
    #[must_use]
    pub fn is_poisoning(&self) -> bool {
        matches!(
            self,
            Self::LogIo { .. } | Self::LogCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }

    /// Creates a log I/O error.
    pub fn log_io(message: impl Into<String>) -> Self {
        Self::LogIo {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(lsn: Lsn, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            lsn,
            message: message.into(),
        }
    }

    /// Creates a run-recovery error.
    pub fn run_recovery(reason: impl Into<String>) -> Self {
        Self::RunRecovery {
            reason: reason.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    #[test]
    fn retryable_errors() {
        let deadlock = CoreError::Deadlock {
            txid: TransactionId::new(4),
            resource: "page 1:3".into(),
        };
        assert!(deadlock.is_retryable());
        assert!(CoreError::CacheExhausted { capacity: 8 }.is_retryable());
        assert!(!CoreError::KeyNotFound.is_retryable());
        assert!(!CoreError::log_io("disk full").is_retryable());
    }

    #[test]
    fn categories() {
        assert_eq!(
            CoreError::HandleDead {
                opened: 1,
                current: 2
            }
            .kind(),
            ErrorKind::HandleInvalid
        );
        assert_eq!(
            CoreError::DuplicateMaster { generation: 3 }.kind(),
            ErrorKind::ReplicationTopology
        );
        assert_eq!(CoreError::run_recovery("x").kind(), ErrorKind::Fatal);
        assert_eq!(CoreError::KeyExists.kind(), ErrorKind::Outcome);
        assert_eq!(CoreError::EnvironmentLocked.kind(), ErrorKind::Usage);
    }

    #[test]
    fn poisoning_errors() {
        let page = PageKey::new(FileId::new(1), 9);
        assert!(CoreError::ChecksumMismatch {
            page,
            expected: 1,
            actual: 2
        }
        .is_poisoning());
        assert!(CoreError::log_corruption(Lsn::new(1, 16), "bad crc").is_poisoning());
        assert!(!CoreError::KeyNotFound.is_poisoning());
    }

    #[test]
    fn error_display() {
        let err = CoreError::ChecksumMismatch {
            page: PageKey::new(FileId::new(2), 5),
            expected: 0xdead_beef,
            actual: 0x1234,
        };
        assert_eq!(
            err.to_string(),
            "page 2:5 checksum mismatch: expected deadbeef, got 00001234"
        );

        let err = CoreError::log_corruption(Lsn::new(1, 40), "bad magic");
        assert_eq!(err.to_string(), "log corruption at 1/40: bad magic");
    }
}
