//! Log dump command.
//!
//! Reads the log files directly, without opening (and so without
//! recovering) the environment.

use super::Format;
use lodedb_core::wal::{LogManager, WalRecord};
use lodedb_core::EnvConfig;
use serde::Serialize;
use std::path::Path;

/// One decoded log record.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Record position.
    pub lsn: String,
    /// Record type.
    pub kind: &'static str,
    /// Owning transaction, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Previous record of the same transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_lsn: Option<String>,
    /// Type-specific details.
    pub detail: String,
}

/// Runs the log dump command.
pub fn run(
    home: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let entries = read_log(home, limit)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for e in &entries {
                let txid = e.txid.map_or_else(|| "-".to_string(), |t| t.to_string());
                let prev = e.prev_lsn.as_deref().unwrap_or("-");
                println!(
                    "{:>14}  {:<12} txn={:<6} prev={:<14} {}",
                    e.lsn, e.kind, txid, prev, e.detail
                );
            }
            eprintln!("{} record(s)", entries.len());
        }
    }
    Ok(())
}

/// Decodes up to `limit` records from the start of the log in `home`.
pub fn read_log(
    home: &Path,
    limit: Option<usize>,
) -> Result<Vec<LogEntry>, Box<dyn std::error::Error>> {
    let defaults = EnvConfig::new();
    let log = LogManager::open(home, defaults.max_log_file_size, defaults.log_buffer_size)?;
    let mut entries = Vec::new();
    for item in log.iter_from(log.first_lsn()) {
        if limit.is_some_and(|max| entries.len() >= max) {
            break;
        }
        let (lsn, record) = item?;
        entries.push(describe(lsn.to_string(), &record));
    }
    Ok(entries)
}

fn describe(lsn: String, record: &WalRecord) -> LogEntry {
    let (kind, txid, prev_lsn, detail) = match record {
        WalRecord::Update {
            txid,
            prev_lsn,
            delta,
        } => (
            "update",
            Some(txid.0),
            Some(prev_lsn.to_string()),
            format!(
                "file={} page={} offset={} len={}",
                delta.file.0,
                delta.pgno,
                delta.offset,
                delta.after.len()
            ),
        ),
        WalRecord::Compensation {
            txid,
            prev_lsn,
            undo_next,
            delta,
        } => (
            "compensate",
            Some(txid.0),
            Some(prev_lsn.to_string()),
            format!(
                "file={} page={} undo_next={}",
                delta.file.0, delta.pgno, undo_next
            ),
        ),
        WalRecord::Commit {
            txid,
            prev_lsn,
            timestamp,
        } => (
            "commit",
            Some(txid.0),
            Some(prev_lsn.to_string()),
            format!("timestamp={timestamp}"),
        ),
        WalRecord::Abort { txid, prev_lsn } => {
            ("abort", Some(txid.0), Some(prev_lsn.to_string()), String::new())
        }
        WalRecord::Checkpoint {
            redo_lsn,
            next_txid,
            active,
        } => (
            "checkpoint",
            None,
            None,
            format!(
                "redo={} next_txid={} active={}",
                redo_lsn,
                next_txid.0,
                active.len()
            ),
        ),
    };
    LogEntry {
        lsn,
        kind,
        txid,
        prev_lsn,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodedb_core::{DbConfig, Environment, TxnOptions};

    #[test]
    fn reads_commits_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = Environment::open(dir.path(), EnvConfig::new().page_size(1024)).unwrap();
            let db = env.open_database("kv", DbConfig::new().create(true)).unwrap();
            let mut txn = env.begin(TxnOptions::new()).unwrap();
            db.put(&mut txn, b"k", b"v").unwrap();
            env.commit(&mut txn).unwrap();
            env.close().unwrap();
        }

        let entries = read_log(dir.path(), None).unwrap();
        assert!(entries.iter().any(|e| e.kind == "update"));
        assert!(entries.iter().any(|e| e.kind == "commit"));
        assert!(entries.iter().any(|e| e.kind == "checkpoint"));

        let limited = read_log(dir.path(), Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        let json = serde_json::to_string(&limited).unwrap();
        assert!(json.contains("\"lsn\""));
    }
}
