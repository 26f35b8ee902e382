//! Transaction manager.

use crate::cache::PageCache;
use crate::config::{IsolationLevel, TxnOptions};
use crate::error::{CoreError, CoreResult};
use crate::failpoint;
use crate::health::EnvHealth;
use crate::lock::LockManager;
use crate::stats::{TxnStats, TxnStatsSnapshot};
use crate::transaction::apply;
use crate::transaction::state::{CommitInfo, ReplicaAck, Transaction, TransactionState};
use crate::types::{Lsn, TransactionId};
use crate::wal::{ActiveTxn, LogManager, WalRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
struct ActiveEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
}

/// Result of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// LSN of the checkpoint record.
    pub lsn: Lsn,
    /// Where recovery starts redo when this is the last checkpoint.
    pub redo_lsn: Lsn,
    /// Oldest log position recovery can still need.
    pub oldest_needed: Lsn,
    /// Dirty pages written back.
    pub pages_written: usize,
}

/// Manages transactions with ACID guarantees.
///
/// The transaction manager provides:
/// - Transaction ids that are never reused, across restarts included
/// - Commit: a commit record, flushed unless the transaction opts out
/// - Abort: the transaction's chain of updates undone newest first, each
///   undo logged as a compensation record
/// - Fuzzy checkpoints that never stop running transactions
///
/// ## Durability
///
/// A commit is durable once its record is flushed. Pages are written back
/// lazily by the cache, always after the log covering them.
pub struct TransactionManager {
    log: Arc<LogManager>,
    cache: Arc<PageCache>,
    locks: Arc<LockManager>,
    health: Arc<EnvHealth>,
    next_txid: AtomicU64,
    active: Mutex<BTreeMap<TransactionId, ActiveEntry>>,
    checkpoint_lock: Mutex<()>,
    sync_on_commit: bool,
    stats: TxnStats,
}

impl TransactionManager {
    /// Creates a transaction manager. `next_txid` comes from recovery.
    #[must_use]
    pub fn new(
        log: Arc<LogManager>,
        cache: Arc<PageCache>,
        locks: Arc<LockManager>,
        health: Arc<EnvHealth>,
        sync_on_commit: bool,
        next_txid: u64,
    ) -> Self {
        Self {
            log,
            cache,
            locks,
            health,
            next_txid: AtomicU64::new(next_txid.max(1)),
            active: Mutex::new(BTreeMap::new()),
            checkpoint_lock: Mutex::new(()),
            sync_on_commit,
            stats: TxnStats::default(),
        }
    }

    /// The log.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// The page cache.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// The lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The environment health record.
    pub fn health(&self) -> &Arc<EnvHealth> {
        &self.health
    }

    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `HandleClosed` or `RunRecovery` for an unusable environment
    /// and `InvalidArgument` for snapshot isolation without multiversion
    /// pages.
    pub fn begin(self: &Arc<Self>, options: TxnOptions) -> CoreResult<Transaction> {
        self.health.check_usable()?;
        let snapshot = match options.isolation {
            IsolationLevel::Snapshot => {
                if !self.cache.versions().is_enabled() {
                    return Err(CoreError::invalid_argument(
                        "snapshot isolation requires multiversion pages",
                    ));
                }
                Some(self.cache.versions().begin_snapshot())
            }
            _ => None,
        };
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        self.active.lock().insert(
            id,
            ActiveEntry {
                first_lsn: Lsn::ZERO,
                last_lsn: Lsn::ZERO,
            },
        );
        self.stats.record_begin();
        tracing::trace!(txid = %id, isolation = ?options.isolation, "begin");
        Ok(Transaction::new(
            id,
            options,
            snapshot,
            self.health.epoch(),
            Arc::clone(self),
        ))
    }

    /// Appends a record on behalf of `txn` and chains it into the
    /// transaction's record list.
    pub(crate) fn append(&self, txn: &mut Transaction, record: &WalRecord) -> CoreResult<Lsn> {
        let lsn = self.log.append(record).inspect_err(|e| self.health.note(e))?;
        txn.note_logged(lsn);
        if let Some(entry) = self.active.lock().get_mut(&txn.id()) {
            if entry.first_lsn.is_zero() {
                entry.first_lsn = lsn;
            }
            entry.last_lsn = lsn;
        }
        self.locks.record_activity(txn.id(), 1);
        Ok(lsn)
    }

    /// Commits a transaction.
    ///
    /// A transaction that wrote nothing commits without touching the log.
    ///
    /// # Errors
    ///
    /// Returns `TransactionClosed`, `HandleDead` if a replication rollback
    /// invalidated the transaction, and fatal log errors. After a fatal
    /// error the outcome is decided by recovery.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<CommitInfo> {
        txn.ensure_active()?;
        self.health.check_epoch(txn.epoch())?;

        if txn.log_record_count() == 0 {
            self.finish(txn, TransactionState::Committed);
            self.stats.record_commit();
            return Ok(CommitInfo {
                lsn: Lsn::ZERO,
                seq: self.cache.versions().latest(),
                replication: ReplicaAck::NotReplicated,
            });
        }

        self.health.check_usable()?;
        txn.set_state(TransactionState::Preparing);
        let record = WalRecord::Commit {
            txid: txn.id(),
            prev_lsn: txn.last_lsn(),
            timestamp: now_millis(),
        };
        let lsn = self.append(txn, &record)?;

        if let Err(e) = failpoint::maybe_fail("commit.before_flush") {
            let err = CoreError::log_io(e.to_string());
            self.health.note(&err);
            return Err(err);
        }
        let sync = txn.options().sync.unwrap_or(self.sync_on_commit);
        if sync {
            self.log.flush(lsn).inspect_err(|e| self.health.note(e))?;
        }

        let seq = self
            .cache
            .versions()
            .on_commit(txn.id(), txn.dirtied_set().iter());
        self.finish(txn, TransactionState::Committed);
        self.stats.record_commit();
        tracing::debug!(txid = %txn.id(), %lsn, %seq, sync, "commit");
        Ok(CommitInfo {
            lsn,
            seq,
            replication: ReplicaAck::NotReplicated,
        })
    }

    /// Aborts a transaction, undoing every change it made.
    ///
    /// In a poisoned or closed environment nothing is undone in place; the
    /// transaction's locks are released and recovery rolls it back.
    ///
    /// # Errors
    ///
    /// Returns `TransactionClosed` for a finished transaction and fatal
    /// errors if undo fails, which also poison the environment.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        if !matches!(
            txn.state(),
            TransactionState::Active | TransactionState::Preparing
        ) {
            return txn.ensure_active();
        }
        if self.health.is_poisoned()
            || self.health.is_closed()
            || self.health.check_epoch(txn.epoch()).is_err()
        {
            tracing::warn!(txid = %txn.id(), "abort without undo");
            self.finish(txn, TransactionState::Aborted);
            self.stats.record_abort();
            return Ok(());
        }

        if let Err(e) = self.undo(txn) {
            self.health.poison(format!("undo of {} failed: {e}", txn.id()));
            self.finish(txn, TransactionState::Aborted);
            return Err(e);
        }
        self.cache
            .versions()
            .on_abort(txn.id(), txn.dirtied_set().iter());
        self.finish(txn, TransactionState::Aborted);
        self.stats.record_abort();
        tracing::debug!(txid = %txn.id(), "abort");
        Ok(())
    }

    /// Undoes the changes `txn` logged after `savepoint`, leaving it
    /// active. Used when one operation fails halfway through a structural
    /// change so the transaction can still commit what came before.
    ///
    /// In a poisoned or closed environment nothing is undone: the
    /// transaction can no longer commit and recovery rolls it back.
    ///
    /// # Errors
    ///
    /// Returns fatal errors if undo fails, which also poison the
    /// environment.
    pub(crate) fn rollback_to(&self, txn: &mut Transaction, savepoint: Lsn) -> CoreResult<()> {
        txn.ensure_active()?;
        if txn.last_lsn() <= savepoint {
            return Ok(());
        }
        if self.health.is_poisoned()
            || self.health.is_closed()
            || self.health.check_epoch(txn.epoch()).is_err()
        {
            return Ok(());
        }
        if let Err(e) = self.undo_after(txn, savepoint) {
            self.health
                .poison(format!("partial rollback of {} failed: {e}", txn.id()));
            return Err(e);
        }
        tracing::debug!(txid = %txn.id(), %savepoint, "operation rolled back");
        Ok(())
    }

    fn undo(&self, txn: &mut Transaction) -> CoreResult<()> {
        if txn.log_record_count() == 0 {
            return Ok(());
        }
        self.undo_after(txn, Lsn::ZERO)?;
        let record = WalRecord::Abort {
            txid: txn.id(),
            prev_lsn: txn.last_lsn(),
        };
        self.append(txn, &record)?;
        Ok(())
    }

    /// Compensates every change in the transaction's chain newer than
    /// `stop`. Compensation records point past what they undid, so a
    /// later full undo skips changes already rolled back.
    fn undo_after(&self, txn: &mut Transaction, stop: Lsn) -> CoreResult<()> {
        let mut next = txn.last_lsn();
        while next > stop {
            let (record, _) = self.log.read_record(next)?;
            next = match record {
                WalRecord::Update { prev_lsn, delta, .. } => {
                    let clr = apply::compensate(
                        &self.log,
                        &self.cache,
                        txn.id(),
                        txn.last_lsn(),
                        &delta,
                        prev_lsn,
                    )?;
                    if let Some(lsn) = clr {
                        self.chain(txn, lsn);
                    }
                    prev_lsn
                }
                WalRecord::Compensation { undo_next, .. } => undo_next,
                other => other.prev_lsn(),
            };
        }
        Ok(())
    }

    fn chain(&self, txn: &mut Transaction, lsn: Lsn) {
        txn.note_logged(lsn);
        if let Some(entry) = self.active.lock().get_mut(&txn.id()) {
            entry.last_lsn = lsn;
        }
    }

    fn finish(&self, txn: &mut Transaction, state: TransactionState) {
        self.locks.release_all(txn.id());
        if let Some(seq) = txn.snapshot() {
            self.cache.versions().end_snapshot(seq);
        }
        self.active.lock().remove(&txn.id());
        txn.set_state(state);
    }

    /// Takes a fuzzy checkpoint.
    ///
    /// Dirty pages older than the current end of the log are written back,
    /// then a checkpoint record listing the running transactions is
    /// appended and flushed. Transactions keep running throughout.
    ///
    /// # Errors
    ///
    /// Returns `RunRecovery` in a poisoned environment and log or page I/O
    /// errors.
    pub fn checkpoint(&self) -> CoreResult<CheckpointInfo> {
        self.health.check_usable()?;
        let _guard = self.checkpoint_lock.lock();

        let redo_lsn = self.log.end_lsn();
        let pages_written = self.cache.flush_dirty_before(redo_lsn)?;
        self.cache.sync_files()?;
        failpoint::maybe_fail("checkpoint.before_record")?;

        let active = self.active_transactions();
        let record = WalRecord::Checkpoint {
            redo_lsn,
            next_txid: TransactionId::new(self.next_txid()),
            active: active.clone(),
        };
        let lsn = self.log.append(&record).inspect_err(|e| self.health.note(e))?;
        self.log.flush(lsn).inspect_err(|e| self.health.note(e))?;

        let oldest_needed = active
            .iter()
            .map(|a| a.first_lsn)
            .fold(redo_lsn, Lsn::min);
        self.stats.record_checkpoint();
        tracing::info!(%lsn, %redo_lsn, pages_written, active = active.len(), "checkpoint");
        Ok(CheckpointInfo {
            lsn,
            redo_lsn,
            oldest_needed,
            pages_written,
        })
    }

    /// Running transactions that have written log records.
    pub fn active_transactions(&self) -> Vec<ActiveTxn> {
        self.active
            .lock()
            .iter()
            .filter(|(_, e)| !e.first_lsn.is_zero())
            .map(|(&txid, e)| ActiveTxn {
                txid,
                first_lsn: e.first_lsn,
                last_lsn: e.last_lsn,
            })
            .collect()
    }

    /// Number of running transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// The id the next transaction will get.
    pub fn next_txid(&self) -> u64 {
        self.next_txid.load(Ordering::SeqCst)
    }

    /// Makes sure future ids are at least `at_least`.
    pub fn advance_txid(&self, at_least: u64) {
        self.next_txid.fetch_max(at_least, Ordering::SeqCst);
    }

    /// Commit, abort and checkpoint counters.
    pub fn stats(&self) -> TxnStatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.active = self.active_count() as u64;
        snap
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txid", &self.next_txid())
            .field("active", &self.active_count())
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FetchMode, PageFile};
    use crate::page::PageType;
    use crate::types::{FileId, PageKey};
    use crate::wal::PageDelta;
    use std::time::Duration;

    fn setup(multiversion: bool) -> Arc<TransactionManager> {
        let log = Arc::new(LogManager::in_memory(1 << 20, 4096));
        let cache = Arc::new(PageCache::new(512, 16, Arc::clone(&log), multiversion, 0));
        cache.register_file(Arc::new(PageFile::in_memory(FileId::new(1), "t", 512)));
        let locks = Arc::new(LockManager::new(None, Duration::from_millis(5)));
        Arc::new(TransactionManager::new(
            log,
            cache,
            locks,
            Arc::new(EnvHealth::new(0)),
            true,
            1,
        ))
    }

    fn key() -> PageKey {
        PageKey::new(FileId::new(1), 3)
    }

    /// Writes `value` into the page body the way the tree does.
    fn write(mgr: &TransactionManager, txn: &mut Transaction, value: u8) {
        let cache = mgr.cache();
        let pinned = cache.fetch(key(), FetchMode::Create).unwrap();
        let mut page = pinned.write();
        if page.is_unused() {
            page.init(PageType::Leaf, 0);
        }
        let before = page.as_bytes()[40..41].to_vec();
        pinned.mark_dirty(mgr.log().end_lsn());
        let record = WalRecord::Update {
            txid: txn.id(),
            prev_lsn: txn.last_lsn(),
            delta: PageDelta {
                file: key().file,
                pgno: key().pgno,
                page_lsn: page.lsn(),
                offset: 40,
                before,
                after: vec![value],
            },
        };
        let lsn = mgr.append(txn, &record).unwrap();
        page.as_bytes_mut()[40] = value;
        page.set_lsn(lsn);
        txn.note_dirty(key());
    }

    fn read(mgr: &TransactionManager) -> u8 {
        let pinned = mgr.cache().fetch(key(), FetchMode::Create).unwrap();
        let byte = pinned.read().as_bytes()[40];
        byte
    }

    #[test]
    fn ids_increase() {
        let mgr = setup(false);
        let a = mgr.begin(TxnOptions::new()).unwrap();
        let b = mgr.begin(TxnOptions::new()).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(mgr.active_count(), 2);
    }

    #[test]
    fn checkpoint_records_next_txid() {
        let mgr = setup(false);
        let _a = mgr.begin(TxnOptions::new()).unwrap();
        let _b = mgr.begin(TxnOptions::new()).unwrap();
        let info = mgr.checkpoint().unwrap();
        let (record, _) = mgr.log().read_record(info.lsn).unwrap();
        match record {
            WalRecord::Checkpoint { next_txid, active, .. } => {
                assert_eq!(next_txid, TransactionId::new(mgr.next_txid()));
                assert_eq!(active.len(), 0);
            }
            other => panic!("expected a checkpoint, got {other:?}"),
        }
    }

    #[test]
    fn rollback_to_savepoint_keeps_earlier_changes() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut txn, 1);
        let savepoint = txn.last_lsn();
        write(&mgr, &mut txn, 2);
        write(&mgr, &mut txn, 3);

        mgr.rollback_to(&mut txn, savepoint).unwrap();
        assert_eq!(read(&mgr), 1);
        assert!(txn.is_active());
        // Nothing left to undo past the savepoint.
        mgr.rollback_to(&mut txn, savepoint).unwrap();
        assert_eq!(read(&mgr), 1);

        // A full abort skips the compensated changes and undoes the rest.
        mgr.abort(&mut txn).unwrap();
        assert_eq!(read(&mgr), 0);
    }

    #[test]
    fn commit_after_rollback_to_savepoint() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut txn, 4);
        let savepoint = txn.last_lsn();
        write(&mgr, &mut txn, 9);
        mgr.rollback_to(&mut txn, savepoint).unwrap();
        write(&mgr, &mut txn, 6);
        mgr.commit(&mut txn).unwrap();
        assert_eq!(read(&mgr), 6);
    }

    #[test]
    fn commit_flushes_log() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut txn, 5);
        let info = mgr.commit(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(mgr.log().flushed_lsn() > info.lsn);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn read_only_commit_writes_nothing() {
        let mgr = setup(false);
        let end = mgr.log().end_lsn();
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        let info = mgr.commit(&mut txn).unwrap();
        assert_eq!(info.lsn, Lsn::ZERO);
        assert_eq!(mgr.log().end_lsn(), end);
    }

    #[test]
    fn abort_restores_pages_and_logs_compensation() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut txn, 1);
        write(&mgr, &mut txn, 2);
        assert_eq!(read(&mgr), 2);
        mgr.abort(&mut txn).unwrap();
        assert_eq!(read(&mgr), 0);

        let kinds: Vec<_> = mgr
            .log()
            .iter_from(Lsn::ZERO)
            .map(|r| r.unwrap().1.record_type())
            .collect();
        use crate::wal::WalRecordType::*;
        assert_eq!(kinds, vec![Update, Update, Compensation, Compensation, Abort]);
    }

    #[test]
    fn drop_aborts() {
        let mgr = setup(false);
        {
            let mut txn = mgr.begin(TxnOptions::new()).unwrap();
            write(&mgr, &mut txn, 9);
        }
        assert_eq!(read(&mgr), 0);
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.stats().aborted, 1);
    }

    #[test]
    fn finished_transaction_rejects_commit() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        mgr.commit(&mut txn).unwrap();
        assert!(matches!(
            mgr.commit(&mut txn),
            Err(CoreError::TransactionClosed { .. })
        ));
        assert!(mgr.abort(&mut txn).is_err());
    }

    #[test]
    fn snapshot_requires_multiversion() {
        let mgr = setup(false);
        let opts = TxnOptions::new().isolation(IsolationLevel::Snapshot);
        assert!(matches!(
            mgr.begin(opts),
            Err(CoreError::InvalidArgument { .. })
        ));
        let mgr = setup(true);
        let txn = mgr.begin(opts).unwrap();
        assert!(txn.snapshot().is_some());
    }

    #[test]
    fn checkpoint_lists_running_writers() {
        let mgr = setup(false);
        let mut writer = mgr.begin(TxnOptions::new()).unwrap();
        let _reader = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut writer, 4);

        let info = mgr.checkpoint().unwrap();
        assert_eq!(info.pages_written, 1);
        assert_eq!(info.oldest_needed, writer.first_lsn());
        match mgr.log().read_record(info.lsn).unwrap().0 {
            WalRecord::Checkpoint { active, .. } => {
                assert_eq!(active.len(), 1);
                assert_eq!(active[0].txid, writer.id());
            }
            other => panic!("unexpected {other:?}"),
        }
        mgr.commit(&mut writer).unwrap();
    }

    #[test]
    fn failed_flush_before_commit_poisons() {
        let mgr = setup(false);
        let mut txn = mgr.begin(TxnOptions::new()).unwrap();
        write(&mgr, &mut txn, 3);
        failpoint::enable("commit.before_flush");
        let result = mgr.commit(&mut txn);
        failpoint::disable("commit.before_flush");
        assert!(matches!(result, Err(CoreError::LogIo { .. })));
        assert!(mgr.health().is_poisoned());
        assert!(matches!(
            mgr.begin(TxnOptions::new()),
            Err(CoreError::RunRecovery { .. })
        ));
    }
}
