//! Transactions.
//!
//! LodeDB transactions are:
//! - **Atomic**: abort, or recovery after a crash, undoes every change of
//!   an unfinished transaction through its chain of log records
//! - **Isolated**: page locks held to the end (serializable), read locks
//!   dropped per operation (read committed), or frozen page versions
//!   (snapshot)
//! - **Durable**: a commit is durable once its log record is flushed

pub(crate) mod apply;
mod manager;
mod state;

pub use manager::{CheckpointInfo, TransactionManager};
pub use state::{CommitInfo, ReplicaAck, Transaction, TransactionState};
