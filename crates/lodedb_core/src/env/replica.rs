//! Hooks the replication layer drives: reading and applying raw log
//! records, cutting the log back after an election, and promotion.

use super::Environment;
use crate::cache::FetchMode;
use crate::error::{CoreError, CoreResult};
use crate::health::WriteGate;
use crate::lock::{LockMode, LockResource};
use crate::recovery;
use crate::transaction::apply;
use crate::transaction::ReplicaAck;
use crate::types::{Lsn, PageKey, TransactionId};
use crate::wal::{PageDelta, WalRecord, WalRecordType};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPLICA_LOCKER: u64 = 1 << 63;

/// Receives every local commit of a replication master.
pub trait LogShipper: Send + Sync {
    /// Called after the commit record at `lsn` is durable locally. Blocks
    /// for as long as the acknowledgement policy requires.
    fn on_commit(&self, lsn: Lsn) -> ReplicaAck;
}

/// What applying one shipped record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedRecord {
    /// Position of the record.
    pub lsn: Lsn,
    /// Its type.
    pub kind: WalRecordType,
    /// Transaction it belongs to.
    pub txid: Option<TransactionId>,
}

/// A shipped transaction that has not committed or aborted yet.
#[derive(Debug, Default)]
struct Pending {
    last_lsn: Lsn,
    pages: HashSet<PageKey>,
}

#[derive(Debug, Default)]
pub(crate) struct ReplicaState {
    pending: HashMap<TransactionId, Pending>,
}

fn locker(txid: TransactionId) -> TransactionId {
    TransactionId::new(REPLICA_LOCKER | txid.as_u64())
}

impl Environment {
    /// Installs the hook called on every commit. `None` removes it.
    pub fn set_log_shipper(&self, shipper: Option<Arc<dyn LogShipper>>) {
        *self.shipper.write() = shipper;
    }

    /// End of the local log.
    #[must_use]
    pub fn end_lsn(&self) -> Lsn {
        self.log.end_lsn()
    }

    /// LSN of the newest commit record, `Lsn::ZERO` if there is none.
    #[must_use]
    pub fn last_commit_lsn(&self) -> Lsn {
        Lsn::from_u64(self.last_commit.load(Ordering::SeqCst))
    }

    /// Position up to which this site's log is known to match the
    /// master's: the end of its newest commit record, or the start of the
    /// log if it has none.
    ///
    /// # Errors
    ///
    /// Log read errors.
    pub fn sync_point(&self) -> CoreResult<Lsn> {
        let last = self.last_commit_lsn();
        if last.is_zero() {
            return Ok(self.log.first_lsn());
        }
        let (_, len) = self.log.read_record(last)?;
        Ok(Lsn::new(last.file(), last.offset() + len as u32))
    }

    /// Every commit record still in the log, oldest first.
    ///
    /// # Errors
    ///
    /// `LogCorruption` and log read errors.
    pub fn commit_lsns(&self) -> CoreResult<Vec<Lsn>> {
        self.scan_commit_lsns()
    }

    pub(super) fn scan_commit_lsns(&self) -> CoreResult<Vec<Lsn>> {
        let mut out = Vec::new();
        for item in self.log.iter_from(self.log.first_lsn()) {
            let (lsn, record) = item?;
            if record.record_type() == WalRecordType::Commit {
                out.push(lsn);
            }
        }
        Ok(out)
    }

    /// Encoded records starting at `from`, at most `max` of them.
    ///
    /// # Errors
    ///
    /// `LogCorruption` and log read errors; a `from` older than the oldest
    /// log file fails with `InvalidArgument`.
    pub fn read_log_raw(&self, from: Lsn, max: usize) -> CoreResult<Vec<(Lsn, Vec<u8>)>> {
        self.health.check_usable()?;
        let first = self.log.first_lsn();
        if from < first {
            return Err(CoreError::invalid_argument(format!(
                "log before {first} has been removed, {from} requested"
            )));
        }
        let mut iter = self.log.iter_from(from);
        let mut out = Vec::new();
        while out.len() < max {
            match iter.next_raw()? {
                Some((lsn, _, raw)) => out.push((lsn, raw)),
                None => break,
            }
        }
        Ok(out)
    }

    /// Appends one record shipped by the master at the same LSN and
    /// applies it. Returns `None` for a record this log already holds.
    ///
    /// Shipped changes are applied under write locks held for the shipped
    /// transaction, so local readers never see uncommitted data.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the bytes are not one record or there is a
    ///   gap before `lsn`
    /// - `LogCorruption` for a record that does not fit its page
    /// - lock errors from waiting on local readers
    pub fn apply_log_raw(&self, lsn: Lsn, raw: &[u8]) -> CoreResult<Option<AppliedRecord>> {
        self.health.check_usable()?;
        if lsn < self.log.end_lsn() {
            return Ok(None);
        }
        if !self.log.continues_at(lsn) {
            return Err(CoreError::invalid_argument(format!(
                "record at {lsn} leaves a gap after {}",
                self.log.end_lsn()
            )));
        }
        let Some((record, _)) = WalRecord::decode(raw, lsn)? else {
            return Err(CoreError::invalid_argument(format!(
                "incomplete record shipped at {lsn}"
            )));
        };
        let applied = AppliedRecord {
            lsn,
            kind: record.record_type(),
            txid: record.txid(),
        };

        match &record {
            WalRecord::Update { txid, delta, .. } | WalRecord::Compensation { txid, delta, .. } => {
                self.lock_for_replica(*txid, delta)?;
                self.log.append_raw_at(lsn, raw)?;
                self.apply_delta(*txid, lsn, delta)?;
            }
            WalRecord::Commit { txid, .. } => {
                self.log.append_raw_at(lsn, raw)?;
                self.log.flush(lsn)?;
                let pending = self.replica.lock().pending.remove(txid);
                if let Some(pending) = pending {
                    self.cache.versions().on_commit(*txid, pending.pages.iter());
                }
                self.locks.release_all(locker(*txid));
                self.txns.advance_txid(txid.as_u64() + 1);
                self.last_commit.fetch_max(lsn.to_u64(), Ordering::SeqCst);
            }
            WalRecord::Abort { txid, .. } => {
                self.log.append_raw_at(lsn, raw)?;
                let pending = self.replica.lock().pending.remove(txid);
                if let Some(pending) = pending {
                    self.cache.versions().on_abort(*txid, pending.pages.iter());
                }
                self.locks.release_all(locker(*txid));
                self.txns.advance_txid(txid.as_u64() + 1);
            }
            WalRecord::Checkpoint { redo_lsn, next_txid, .. } => {
                self.log.append_raw_at(lsn, raw)?;
                self.log.flush(lsn)?;
                self.cache.flush_dirty_before(*redo_lsn)?;
                self.txns.advance_txid(next_txid.as_u64());
                let mut meta = self.meta.lock();
                meta.last_checkpoint = lsn;
                self.save_meta(&meta)?;
            }
        }
        tracing::trace!(%lsn, kind = ?applied.kind, "applied shipped record");
        Ok(Some(applied))
    }

    fn lock_for_replica(&self, txid: TransactionId, delta: &PageDelta) -> CoreResult<()> {
        let id = locker(txid);
        self.locks.set_protected(id, true);
        self.locks
            .acquire(id, LockResource::Database(delta.file), LockMode::IntentWrite, true)?;
        self.locks
            .acquire(id, LockResource::Page(delta.page()), LockMode::Write, true)
    }

    fn apply_delta(&self, txid: TransactionId, lsn: Lsn, delta: &PageDelta) -> CoreResult<()> {
        let key = delta.page();
        if self.cache.file(delta.file).is_some() {
            let pinned = self.cache.fetch(key, FetchMode::Create)?;
            self.cache.versions().before_write(key, txid, &pinned.read());
        }
        apply::redo(&self.cache, lsn, delta)?;
        self.txns.advance_txid(txid.as_u64() + 1);

        let mut st = self.replica.lock();
        let pending = st.pending.entry(txid).or_default();
        pending.last_lsn = lsn;
        pending.pages.insert(key);
        Ok(())
    }

    /// Cuts the log back to `lsn`, undoing every change recorded at or
    /// after it. Used by a client whose log holds records the new master
    /// never wrote. Waits up to `wait` for local transactions to finish.
    ///
    /// Every handle opened before the call fails with `HandleDead`
    /// afterwards. Returns the new epoch.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if local transactions are still running after
    /// `wait`, `InvalidArgument` for an `lsn` outside the log, and log and
    /// page I/O errors.
    pub fn rollback_log_to(&self, lsn: Lsn, wait: Duration) -> CoreResult<u64> {
        self.health.check_usable()?;
        let deadline = Instant::now() + wait;
        while self.txns.active_count() > 0 {
            if Instant::now() >= deadline {
                return Err(CoreError::invalid_operation(format!(
                    "cannot roll back the log: {} transactions still running",
                    self.txns.active_count()
                )));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut doomed = Vec::new();
        for item in self.log.iter_from(lsn) {
            let (at, record) = item?;
            if at < lsn {
                continue;
            }
            doomed.push((at, record));
        }
        for (at, record) in doomed.iter().rev() {
            if let Some(delta) = record.delta() {
                apply::revert(&self.cache, *at, delta)?;
            }
        }
        self.log.truncate_at(lsn)?;
        self.log.flush_all()?;
        self.rebuild_pending()?;

        let last_commit = self.scan_commit_lsns()?.last().map_or(0, |l| l.to_u64());
        self.last_commit.store(last_commit, Ordering::SeqCst);
        let epoch = self.health.bump_epoch();
        {
            let mut meta = self.meta.lock();
            meta.epoch = epoch;
            if meta.last_checkpoint >= lsn {
                meta.last_checkpoint = Lsn::ZERO;
            }
            self.save_meta(&meta)?;
        }
        tracing::warn!(%lsn, records = doomed.len(), epoch, "log rolled back");
        Ok(epoch)
    }

    /// Rebuilds the set of unfinished shipped transactions from the log
    /// and takes their page locks again.
    fn rebuild_pending(&self) -> CoreResult<()> {
        let mut st = self.replica.lock();
        for txid in st.pending.keys() {
            self.locks.release_all(locker(*txid));
        }
        st.pending.clear();

        let mut deltas: HashMap<TransactionId, Vec<PageDelta>> = HashMap::new();
        for item in self.log.iter_from(self.log.first_lsn()) {
            let (lsn, record) = item?;
            match record {
                WalRecord::Update { txid, delta, .. }
                | WalRecord::Compensation { txid, delta, .. } => {
                    let pending = st.pending.entry(txid).or_default();
                    pending.last_lsn = lsn;
                    pending.pages.insert(delta.page());
                    deltas.entry(txid).or_default().push(delta);
                }
                WalRecord::Commit { txid, .. } | WalRecord::Abort { txid, .. } => {
                    st.pending.remove(&txid);
                    deltas.remove(&txid);
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }
        drop(st);
        for (txid, deltas) in deltas {
            for delta in &deltas {
                self.lock_for_replica(txid, delta)?;
            }
        }
        Ok(())
    }

    /// Makes this site writable: shipped transactions that never finished
    /// are rolled back, then the write gate opens.
    ///
    /// # Errors
    ///
    /// Log and page errors from the rollback; the environment is poisoned
    /// if it fails half way.
    pub fn promote(&self) -> CoreResult<Vec<TransactionId>> {
        self.health.check_usable()?;
        let pending: Vec<(TransactionId, Pending)> = self.replica.lock().pending.drain().collect();
        let unfinished: Vec<(TransactionId, Lsn)> =
            pending.iter().map(|(txid, p)| (*txid, p.last_lsn)).collect();

        let rolled_back = match recovery::roll_back(&self.log, &self.cache, unfinished) {
            Ok(ids) => ids,
            Err(e) => {
                self.health.poison(format!("promotion rollback failed: {e}"));
                return Err(e);
            }
        };
        for (txid, p) in &pending {
            self.cache.versions().on_abort(*txid, p.pages.iter());
            self.locks.release_all(locker(*txid));
        }
        self.health.set_gate(WriteGate::Open);
        tracing::info!(rolled_back = rolled_back.len(), end = %self.log.end_lsn(), "promoted to master");
        Ok(rolled_back)
    }

    /// Shipped transactions that have not finished yet.
    #[must_use]
    pub fn pending_replica_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.replica.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
