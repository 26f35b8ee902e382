//! Error types for replication.

use crate::message::SiteId;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors raised by the replication manager and its transports.
#[derive(Error, Debug)]
pub enum ReplError {
    /// Error from the local environment.
    #[error("environment error: {0}")]
    Core(#[from] lodedb_core::CoreError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid replication configuration.
    #[error("invalid replication config: {0}")]
    Config(String),

    /// The destination site is not part of the group.
    #[error("unknown site {0}")]
    UnknownSite(SiteId),

    /// The operation needs a different role.
    #[error("operation requires role {expected}, site is {actual}")]
    WrongRole {
        /// Role the operation needs.
        expected: &'static str,
        /// Role the site has.
        actual: &'static str,
    },

    /// Too few sites answered an election.
    #[error("election {generation} got {votes} votes, {needed} needed")]
    ElectionFailed {
        /// Election generation.
        generation: u32,
        /// Votes received, including our own.
        votes: usize,
        /// Majority of the group.
        needed: usize,
    },

    /// Every voting site has priority 0.
    #[error("election {generation} has no electable site")]
    NoElectableSite {
        /// Election generation.
        generation: u32,
    },

    /// An election was won but the environment could not be promoted.
    #[error("promotion failed: {0}")]
    Promotion(String),

    /// I/O error outside the environment.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager was shut down.
    #[error("replication manager is shut down")]
    Shutdown,

    /// Timed out waiting for the group.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ReplError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Core(e) => e.is_retryable(),
            ReplError::Transport { retryable, .. } => *retryable,
            ReplError::ElectionFailed { .. } | ReplError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for ReplError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ReplError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ReplError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ReplError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodedb_core::CoreError;

    #[test]
    fn retryable_errors() {
        assert!(ReplError::transport_retryable("site unreachable").is_retryable());
        assert!(!ReplError::transport_fatal("unknown site").is_retryable());
        assert!(ReplError::Timeout("acks").is_retryable());
        assert!(ReplError::ElectionFailed {
            generation: 2,
            votes: 1,
            needed: 2
        }
        .is_retryable());
        assert!(!ReplError::Shutdown.is_retryable());
        assert!(!ReplError::from(CoreError::NotMaster).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ReplError::WrongRole {
            expected: "master",
            actual: "client",
        };
        assert_eq!(err.to_string(), "operation requires role master, site is client");
        assert!(ReplError::UnknownSite(7).to_string().contains('7'));
    }
}
