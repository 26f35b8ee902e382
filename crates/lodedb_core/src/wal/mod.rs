//! Write-ahead log.
//!
//! Every page change is described by a log record before the page may be
//! written back, and a transaction is committed once its commit record is
//! durable. The log is a numbered sequence of files (`log.0000000001`,
//! ...), each starting with a 16 byte header; a record's [`Lsn`] is its
//! file number and byte offset.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery policy
//!
//! Tolerated (treated as a clean end of log and cut off at open):
//!
//! - a truncated header or payload at the tail of the newest file
//!
//! Fatal (`LogCorruption`, the environment does not open):
//!
//! - CRC mismatch, bad magic, unknown record type, future version
//! - a torn record anywhere other than the tail
//!
//! [`Lsn`]: crate::types::Lsn

mod iterator;
mod record;
mod writer;

pub use iterator::LogIterator;
pub use record::{
    ActiveTxn, PageDelta, WalRecord, WalRecordType, RECORD_CRC_SIZE, RECORD_HEADER_SIZE,
    RECORD_MAGIC, RECORD_VERSION,
};
pub use writer::{log_file_name, LogManager, LOG_FILE_HEADER_SIZE, LOG_FILE_MAGIC};
