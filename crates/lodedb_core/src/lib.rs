//! # LodeDB Core
//!
//! Embedded transactional key-value engine.
//!
//! This crate provides:
//! - a page cache over fixed-size pages with checksums
//! - a write-ahead log with redo/undo recovery and checkpoints
//! - page-level locking with deadlock detection
//! - B+tree databases with overflow values, cursors and verification
//! - the [`Environment`] tying them together, plus the log hooks the
//!   replication layer needs
//!
//! ```rust,ignore
//! use lodedb_core::{DbConfig, EnvConfig, Environment, TxnOptions};
//!
//! let env = Environment::open_in_memory(EnvConfig::default())?;
//! let db = env.open_database("kv", DbConfig::new().create(true))?;
//! let mut txn = env.begin(TxnOptions::default())?;
//! db.put(&mut txn, b"hello", b"world")?;
//! env.commit(&mut txn)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod btree;
pub mod cache;
pub mod catalog;
mod config;
mod database;
pub mod env;
mod error;
pub mod failpoint;
mod health;
pub mod lock;
pub mod page;
mod recovery;
mod stats;
mod transaction;
mod types;
pub mod wal;

pub use btree::{Cursor, DbStat, KeyValuePair, VerifyReport};
pub use catalog::{ClassCatalog, MemoryClassCatalog, NullClassCatalog};
pub use config::{DbConfig, EnvConfig, IsolationLevel, RecoveryMode, TxnOptions};
pub use database::Database;
pub use env::{AppliedRecord, Environment, LogShipper};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use health::{EnvHealth, WriteGate};
pub use recovery::RecoveryReport;
pub use stats::{
    CacheStatsSnapshot, EnvStats, LockStatsSnapshot, LogStats, LogStatsSnapshot,
    TxnStatsSnapshot,
};
pub use transaction::{CheckpointInfo, CommitInfo, ReplicaAck, Transaction, TransactionState};
pub use types::{FileId, Lsn, PageKey, PageNo, SequenceNumber, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
