//! Transaction state.

use crate::config::{IsolationLevel, TxnOptions};
use crate::error::{CoreError, CoreResult};
use crate::transaction::manager::TransactionManager;
use crate::types::{Lsn, PageKey, SequenceNumber, TransactionId};
use std::collections::HashSet;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Commit record written, waiting for the log flush.
    Preparing,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

impl TransactionState {
    /// Lower-case name for messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Preparing => "preparing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// Outcome of the replication step of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaAck {
    /// No replication, or the ack policy does not wait.
    #[default]
    NotReplicated,
    /// Enough replicas acknowledged the commit.
    Acknowledged {
        /// Number of acknowledgements received.
        acks: usize,
    },
    /// The commit is durable locally but the ack policy was not met in time.
    Insufficient {
        /// Acknowledgements received.
        acks: usize,
        /// Acknowledgements required.
        required: usize,
    },
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    /// LSN of the commit record (`Lsn::ZERO` for read-only transactions).
    pub lsn: Lsn,
    /// Visibility sequence assigned to the commit.
    pub seq: SequenceNumber,
    /// Replica acknowledgement outcome.
    pub replication: ReplicaAck,
}

/// A transaction.
///
/// Obtained from [`crate::Environment::begin`]. A transaction dropped while
/// still active is aborted.
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    options: TxnOptions,
    snapshot: Option<SequenceNumber>,
    first_lsn: Lsn,
    last_lsn: Lsn,
    log_records: u64,
    dirtied: HashSet<PageKey>,
    epoch: u64,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        options: TxnOptions,
        snapshot: Option<SequenceNumber>,
        epoch: u64,
        manager: Arc<TransactionManager>,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            options,
            snapshot,
            first_lsn: Lsn::ZERO,
            last_lsn: Lsn::ZERO,
            log_records: 0,
            dirtied: HashSet::new(),
            epoch,
            manager,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.options.isolation
    }

    /// Options the transaction was started with.
    #[must_use]
    pub fn options(&self) -> TxnOptions {
        self.options
    }

    /// Snapshot sequence of a snapshot transaction.
    #[must_use]
    pub fn snapshot(&self) -> Option<SequenceNumber> {
        self.snapshot
    }

    /// First log record written by this transaction.
    #[must_use]
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Most recent log record written by this transaction.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Number of log records written.
    #[must_use]
    pub fn log_record_count(&self) -> u64 {
        self.log_records
    }

    /// Environment epoch the transaction was started in.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Pages this transaction has modified.
    pub fn dirtied(&self) -> impl Iterator<Item = &PageKey> {
        self.dirtied.iter()
    }

    pub(crate) fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub(crate) fn note_logged(&mut self, lsn: Lsn) {
        if self.first_lsn.is_zero() {
            self.first_lsn = lsn;
        }
        self.last_lsn = lsn;
        self.log_records += 1;
    }

    pub(crate) fn note_dirty(&mut self, key: PageKey) {
        self.dirtied.insert(key);
    }

    pub(crate) fn dirtied_set(&self) -> &HashSet<PageKey> {
        &self.dirtied
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Fails unless the transaction is active.
    ///
    /// # Errors
    ///
    /// Returns `TransactionClosed`.
    pub fn ensure_active(&self) -> CoreResult<()> {
        if self.state != TransactionState::Active {
            return Err(CoreError::TransactionClosed {
                txid: self.id,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("isolation", &self.options.isolation)
            .field("last_lsn", &self.last_lsn)
            .field("log_records", &self.log_records)
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Active | TransactionState::Preparing
        ) {
            let manager = Arc::clone(&self.manager);
            if let Err(e) = manager.abort(self) {
                tracing::warn!(txid = %self.id, error = %e, "abort on drop failed");
            }
        }
    }
}
