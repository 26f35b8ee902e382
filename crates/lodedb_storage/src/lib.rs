//! # LodeDB Storage
//!
//! Byte-store backends underneath LodeDB's page files and log files.
//!
//! Backends are **opaque byte stores**. The engine decides what a page or
//! a log record looks like; a backend only reads, writes, appends, syncs
//! and truncates bytes.
//!
//! ## Design Principles
//!
//! - Random-access writes (`write_at`) serve fixed-size page files
//! - Appends serve the log file set
//! - `sync` is the only durability point
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and in-memory environments
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use lodedb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(4096, b"page one").unwrap();
//! assert_eq!(backend.size().unwrap(), 4104);
//! assert_eq!(backend.read_at(4096, 8).unwrap(), b"page one");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
