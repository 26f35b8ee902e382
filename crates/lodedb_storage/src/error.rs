//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to grow the storage through `truncate`.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncateBeyondEnd {
        /// The requested new size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Only interrupted or would-block I/O qualifies.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let interrupted = StorageError::Io(io::Error::new(io::ErrorKind::Interrupted, "signal"));
        assert!(interrupted.is_transient());

        let denied = StorageError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"));
        assert!(!denied.is_transient());

        assert!(!StorageError::Closed.is_transient());
        assert!(!StorageError::ReadPastEnd {
            offset: 10,
            len: 1,
            size: 4
        }
        .is_transient());
    }

    #[test]
    fn display_messages() {
        let err = StorageError::TruncateBeyondEnd {
            requested: 100,
            size: 10,
        };
        assert_eq!(
            err.to_string(),
            "cannot truncate to 100 bytes, storage holds 10"
        );
    }
}
