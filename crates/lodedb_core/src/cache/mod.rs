//! Page cache.
//!
//! All database files of an environment share one [`PageCache`]. Pages are
//! pinned through [`PageCache::fetch`] and latched through the returned
//! [`PinnedPage`]; a dirty page is only written back after the log is
//! flushed up to its LSN.

mod file;
mod pool;
mod version;

pub use file::PageFile;
pub use pool::{FetchMode, PageCache, PinnedPage};
pub use version::{VersionStore, Visible};
