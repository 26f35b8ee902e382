//! Two-phase locking.
//!
//! Transactions lock pages (and, for whole-database operations, database
//! files) through the [`LockManager`]. Locks are held until commit or
//! abort, except read locks of read-committed transactions, which are
//! dropped at the end of each operation.

mod detector;
mod manager;
mod mode;

pub use manager::LockManager;
pub use mode::{LockMode, LockResource};
