//! Stat command implementation.

use super::{open_env, Format};
use lodedb_core::{DbConfig, Environment, RecoveryMode, TxnOptions};
use serde::Serialize;
use std::path::Path;

/// Environment statistics.
#[derive(Debug, Serialize)]
pub struct StatResult {
    /// Environment directory.
    pub path: String,
    /// Environment id.
    pub env_id: String,
    /// Page size in bytes.
    pub page_size: usize,
    /// Log numbers.
    pub log: LogSection,
    /// Page cache numbers.
    pub cache: CacheSection,
    /// Lock manager numbers.
    pub locks: LockSection,
    /// Transaction numbers.
    pub txns: TxnSection,
    /// Per-database statistics.
    pub databases: Vec<DbSection>,
}

/// Log statistics.
#[derive(Debug, Serialize)]
pub struct LogSection {
    /// Oldest log position.
    pub first_lsn: String,
    /// End of the log.
    pub end_lsn: String,
    /// Log file numbers.
    pub files: Vec<u32>,
    /// Records appended since open.
    pub records: u64,
    /// Bytes appended since open.
    pub bytes: u64,
    /// Log syncs since open.
    pub syncs: u64,
}

/// Page cache statistics.
#[derive(Debug, Serialize)]
pub struct CacheSection {
    /// Capacity in pages.
    pub capacity: u64,
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Evicted pages.
    pub evictions: u64,
    /// Pages written back.
    pub pages_written: u64,
}

/// Lock statistics.
#[derive(Debug, Serialize)]
pub struct LockSection {
    /// Lock requests.
    pub requests: u64,
    /// Requests that waited.
    pub waits: u64,
    /// Deadlocks broken.
    pub deadlocks: u64,
}

/// Transaction statistics.
#[derive(Debug, Serialize)]
pub struct TxnSection {
    /// Transactions begun.
    pub begun: u64,
    /// Committed.
    pub committed: u64,
    /// Aborted.
    pub aborted: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Transactions rolled back by recovery at open.
    pub recovered_losers: usize,
}

/// Statistics for one database.
#[derive(Debug, Serialize)]
pub struct DbSection {
    /// Database name.
    pub name: String,
    /// Tree height.
    pub levels: u8,
    /// Number of keys.
    pub keys: u64,
    /// Leaf pages.
    pub leaf_pages: u64,
    /// Internal pages.
    pub internal_pages: u64,
    /// Overflow pages.
    pub overflow_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Highest allocated page.
    pub last_pgno: u64,
}

/// Runs the stat command.
pub fn run(
    home: &Path,
    cache_pages: usize,
    only: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let env = open_env(home, cache_pages, RecoveryMode::Normal)?;
    let result = collect(&env, home, only)?;
    env.close()?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn collect(
    env: &Environment,
    home: &Path,
    only: Option<&str>,
) -> Result<StatResult, Box<dyn std::error::Error>> {
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => env.list_databases(),
    };
    let mut databases = Vec::with_capacity(names.len());
    for name in names {
        let db = env.open_database(&name, DbConfig::new().read_only(true))?;
        let mut txn = env.begin(TxnOptions::new())?;
        let stat = db.stat(&mut txn)?;
        env.commit(&mut txn)?;
        databases.push(DbSection {
            name,
            levels: stat.levels,
            keys: stat.keys,
            leaf_pages: stat.leaf_pages,
            internal_pages: stat.internal_pages,
            overflow_pages: stat.overflow_pages,
            free_pages: stat.free_pages,
            last_pgno: u64::from(stat.last_pgno),
        });
    }

    let stats = env.stats();
    let log = env.log();
    Ok(StatResult {
        path: home.display().to_string(),
        env_id: env.env_id().to_string(),
        page_size: env.page_size(),
        log: LogSection {
            first_lsn: log.first_lsn().to_string(),
            end_lsn: log.end_lsn().to_string(),
            files: log.file_numbers(),
            records: stats.log.records,
            bytes: stats.log.bytes,
            syncs: stats.log.syncs,
        },
        cache: CacheSection {
            capacity: stats.cache.capacity,
            hits: stats.cache.hits,
            misses: stats.cache.misses,
            evictions: stats.cache.evictions,
            pages_written: stats.cache.pages_written,
        },
        locks: LockSection {
            requests: stats.locks.requests,
            waits: stats.locks.waits,
            deadlocks: stats.locks.deadlocks,
        },
        txns: TxnSection {
            begun: stats.txns.begun,
            committed: stats.txns.committed,
            aborted: stats.txns.aborted,
            checkpoints: stats.txns.checkpoints,
            recovered_losers: env.recovery_report().rolled_back.len(),
        },
        databases,
    })
}

fn print_text_output(result: &StatResult) {
    println!("LodeDB Environment Statistics");
    println!("=============================");
    println!("Path:       {}", result.path);
    println!("Env id:     {}", result.env_id);
    println!("Page size:  {} bytes", result.page_size);
    println!();
    println!("Log:");
    println!("  Range:    {} .. {}", result.log.first_lsn, result.log.end_lsn);
    println!("  Files:    {:?}", result.log.files);
    println!(
        "  Written:  {} records, {} bytes, {} syncs",
        result.log.records, result.log.bytes, result.log.syncs
    );
    println!("Cache:");
    println!(
        "  {} pages, {} hits, {} misses, {} evictions, {} written",
        result.cache.capacity,
        result.cache.hits,
        result.cache.misses,
        result.cache.evictions,
        result.cache.pages_written
    );
    println!("Locks:");
    println!(
        "  {} requests, {} waits, {} deadlocks",
        result.locks.requests, result.locks.waits, result.locks.deadlocks
    );
    println!("Transactions:");
    println!(
        "  {} begun, {} committed, {} aborted, {} checkpoints, {} rolled back at open",
        result.txns.begun,
        result.txns.committed,
        result.txns.aborted,
        result.txns.checkpoints,
        result.txns.recovered_losers
    );

    if !result.databases.is_empty() {
        println!();
        println!("Databases:");
        println!(
            "  {:<24} {:>6} {:>10} {:>8} {:>8} {:>8} {:>8}",
            "Name", "Levels", "Keys", "Leaf", "Internal", "Overflow", "Free"
        );
        for db in &result.databases {
            println!(
                "  {:<24} {:>6} {:>10} {:>8} {:>8} {:>8} {:>8}",
                db.name,
                db.levels,
                db.keys,
                db.leaf_pages,
                db.internal_pages,
                db.overflow_pages,
                db.free_pages
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodedb_core::EnvConfig;

    #[test]
    fn collects_database_sections() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), EnvConfig::new().page_size(1024)).unwrap();
        let db = env.open_database("people", DbConfig::new().create(true)).unwrap();
        let mut txn = env.begin(TxnOptions::new()).unwrap();
        for i in 0..50u32 {
            db.put(&mut txn, &i.to_be_bytes(), b"row").unwrap();
        }
        env.commit(&mut txn).unwrap();
        drop(db);

        let result = collect(&env, dir.path(), None).unwrap();
        assert_eq!(result.databases.len(), 1);
        assert_eq!(result.databases[0].name, "people");
        assert_eq!(result.databases[0].keys, 50);
        assert_eq!(result.page_size, 1024);
        assert!(result.txns.committed >= 1);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"people\""));
    }
}
