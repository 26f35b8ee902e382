//! CLI command implementations.

pub mod dump;
pub mod log_dump;
pub mod maintenance;
pub mod stat;
pub mod verify;

use lodedb_core::{EnvConfig, Environment, RecoveryMode};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by commands beyond those of the engine.
#[derive(Error, Debug)]
pub enum CliError {
    /// Verification found damaged databases.
    #[error("verification found {problems} problem(s) in {databases} database(s)")]
    VerifyFailed {
        /// Problems found.
        problems: usize,
        /// Databases with problems.
        databases: usize,
    },

    /// Unsupported `--format` value.
    #[error("unknown output format {0:?} (expected text or json)")]
    UnknownFormat(String),
}

/// Output format of commands that support JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Result<Self, CliError> {
        match s {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Opens an existing environment, running recovery.
pub fn open_env(
    home: &Path,
    cache_pages: usize,
    recovery: RecoveryMode,
) -> Result<Arc<Environment>, Box<dyn std::error::Error>> {
    let config = EnvConfig::new()
        .create_if_missing(false)
        .cache_pages(cache_pages)
        .recovery(recovery);
    Ok(Environment::open(home, config)?)
}

/// Renders bytes as printable ASCII with escapes.
pub fn escape(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_keeps_ascii() {
        assert_eq!(escape(b"user:42"), "user:42");
        assert_eq!(escape(&[0, 0xff, b'a']), "\\x00\\xffa");
    }

    #[test]
    fn format_parsing() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert!(matches!(
            Format::parse("yaml"),
            Err(CliError::UnknownFormat(_))
        ));
    }
}
