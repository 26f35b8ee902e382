//! Crash recovery.
//!
//! Recovery runs while the environment is opened, before any transaction
//! can start:
//!
//! 1. **Analysis and redo** scan the log forward from the redo LSN of the
//!    last checkpoint (or from the oldest record in catastrophic mode).
//!    Every page change is reapplied unless the page already carries it,
//!    and a table of unfinished transactions is built.
//! 2. **Undo** rolls the unfinished transactions back together, always
//!    taking the newest outstanding record first, and writes compensation
//!    records and a final Abort record for each.
//!
//! The caller takes a checkpoint afterwards.

use crate::cache::PageCache;
use crate::config::RecoveryMode;
use crate::error::{CoreError, CoreResult};
use crate::transaction::apply;
use crate::types::{Lsn, TransactionId};
use crate::wal::{LogManager, WalRecord};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Where the forward scan started.
    pub start_lsn: Lsn,
    /// End of the log after recovery.
    pub end_lsn: Lsn,
    /// Records scanned forward.
    pub records_scanned: u64,
    /// Page changes reapplied.
    pub pages_redone: u64,
    /// Transactions that committed within the scanned range.
    pub committed: u64,
    /// Unfinished transactions that were rolled back.
    pub rolled_back: Vec<TransactionId>,
    /// Page changes undone.
    pub changes_undone: u64,
    /// Smallest transaction id that is safe to hand out.
    pub next_txid: u64,
    /// Timestamp of the newest commit seen.
    pub last_commit_timestamp: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Loser {
    last_lsn: Lsn,
}

/// Runs recovery over `log`, applying changes through `cache`.
///
/// `checkpoint` is the last checkpoint recorded in the environment
/// metadata, `Lsn::ZERO` if there is none.
///
/// # Errors
///
/// Returns `LogCorruption` for damaged or inconsistent records, and page
/// or log I/O errors.
pub fn recover(
    log: &LogManager,
    cache: &PageCache,
    mode: RecoveryMode,
    checkpoint: Lsn,
) -> CoreResult<RecoveryReport> {
    let mut report = RecoveryReport {
        next_txid: 1,
        ..RecoveryReport::default()
    };

    let start = match mode {
        RecoveryMode::Catastrophic => log.first_lsn(),
        RecoveryMode::Normal if checkpoint.is_zero() => log.first_lsn(),
        RecoveryMode::Normal => match log.read_record(checkpoint)?.0 {
            WalRecord::Checkpoint { redo_lsn, .. } => redo_lsn.min(checkpoint),
            other => {
                return Err(CoreError::log_corruption(
                    checkpoint,
                    format!("expected checkpoint record, found {:?}", other.record_type()),
                ))
            }
        },
    };
    report.start_lsn = start;
    tracing::info!(?mode, %start, %checkpoint, "recovery: redo pass");

    let mut losers: HashMap<TransactionId, Loser> = HashMap::new();
    let mut finished: HashSet<TransactionId> = HashSet::new();
    let mut max_txid = 0u64;

    for item in log.iter_from(start) {
        let (lsn, record) = item?;
        report.records_scanned += 1;
        if let Some(txid) = record.txid() {
            max_txid = max_txid.max(txid.as_u64());
        }
        match &record {
            WalRecord::Update { txid, delta, .. } | WalRecord::Compensation { txid, delta, .. } => {
                if apply::redo(cache, lsn, delta)? {
                    report.pages_redone += 1;
                }
                if !finished.contains(txid) {
                    let entry = losers.entry(*txid).or_insert(Loser { last_lsn: lsn });
                    entry.last_lsn = entry.last_lsn.max(lsn);
                }
            }
            WalRecord::Commit {
                txid, timestamp, ..
            } => {
                losers.remove(txid);
                finished.insert(*txid);
                report.committed += 1;
                report.last_commit_timestamp = Some(*timestamp);
            }
            WalRecord::Abort { txid, .. } => {
                losers.remove(txid);
                finished.insert(*txid);
            }
            WalRecord::Checkpoint {
                next_txid, active, ..
            } => {
                report.next_txid = report.next_txid.max(next_txid.as_u64());
                for a in active {
                    if finished.contains(&a.txid) {
                        continue;
                    }
                    let entry = losers.entry(a.txid).or_insert(Loser {
                        last_lsn: a.last_lsn,
                    });
                    entry.last_lsn = entry.last_lsn.max(a.last_lsn);
                }
            }
        }
    }
    report.next_txid = report.next_txid.max(max_txid + 1);
    tracing::info!(
        scanned = report.records_scanned,
        redone = report.pages_redone,
        losers = losers.len(),
        "recovery: redo pass done"
    );

    undo_losers(log, cache, losers, &mut report)?;
    log.flush_all()?;
    report.end_lsn = log.end_lsn();
    tracing::info!(
        rolled_back = report.rolled_back.len(),
        undone = report.changes_undone,
        end = %report.end_lsn,
        "recovery complete"
    );
    Ok(report)
}

/// Rolls back transactions whose records were applied but which never
/// finished, given their most recent LSNs. Used when a replica takes over
/// as master with shipped transactions still open.
pub(crate) fn roll_back(
    log: &LogManager,
    cache: &PageCache,
    unfinished: impl IntoIterator<Item = (TransactionId, Lsn)>,
) -> CoreResult<Vec<TransactionId>> {
    let losers = unfinished
        .into_iter()
        .map(|(txid, last_lsn)| (txid, Loser { last_lsn }))
        .collect();
    let mut report = RecoveryReport::default();
    undo_losers(log, cache, losers, &mut report)?;
    log.flush_all()?;
    Ok(report.rolled_back)
}

fn undo_losers(
    log: &LogManager,
    cache: &PageCache,
    mut losers: HashMap<TransactionId, Loser>,
    report: &mut RecoveryReport,
) -> CoreResult<()> {
    let mut queue: BinaryHeap<(Lsn, TransactionId)> = losers
        .iter()
        .map(|(&txid, loser)| (loser.last_lsn, txid))
        .collect();

    while let Some((lsn, txid)) = queue.pop() {
        let (record, _) = log.read_record(lsn)?;
        if record.txid() != Some(txid) {
            return Err(CoreError::log_corruption(
                lsn,
                format!("record does not belong to {txid}"),
            ));
        }
        let last_lsn = losers.get(&txid).map_or(lsn, |l| l.last_lsn);
        let next = match record {
            WalRecord::Update {
                prev_lsn, delta, ..
            } => {
                if let Some(clr) = apply::compensate(log, cache, txid, last_lsn, &delta, prev_lsn)? {
                    if let Some(loser) = losers.get_mut(&txid) {
                        loser.last_lsn = clr;
                    }
                }
                report.changes_undone += 1;
                prev_lsn
            }
            WalRecord::Compensation { undo_next, .. } => undo_next,
            other => other.prev_lsn(),
        };

        if next.is_zero() {
            let prev_lsn = losers.remove(&txid).map_or(last_lsn, |l| l.last_lsn);
            log.append(&WalRecord::Abort { txid, prev_lsn })?;
            report.rolled_back.push(txid);
            tracing::debug!(%txid, "recovery: rolled back");
        } else {
            queue.push((next, txid));
        }
    }
    report.rolled_back.sort_unstable();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FetchMode, PageFile};
    use crate::types::{FileId, PageKey};
    use crate::wal::PageDelta;
    use std::sync::Arc;

    fn log_and_cache() -> (Arc<LogManager>, PageCache) {
        let log = Arc::new(LogManager::in_memory(1 << 20, 1 << 16));
        let cache = fresh_cache(&log);
        (log, cache)
    }

    fn fresh_cache(log: &Arc<LogManager>) -> PageCache {
        let cache = PageCache::new(512, 16, Arc::clone(log), false, 0);
        cache.register_file(Arc::new(PageFile::in_memory(FileId::new(1), "t", 512)));
        cache
    }

    fn update(txid: u64, prev: Lsn, pgno: u32, before: u8, after: u8) -> WalRecord {
        WalRecord::Update {
            txid: TransactionId::new(txid),
            prev_lsn: prev,
            delta: PageDelta {
                file: FileId::new(1),
                pgno,
                page_lsn: Lsn::ZERO,
                offset: 64,
                before: vec![before],
                after: vec![after],
            },
        }
    }

    fn byte(cache: &PageCache, pgno: u32) -> u8 {
        let pinned = cache
            .fetch(PageKey::new(FileId::new(1), pgno), FetchMode::Create)
            .unwrap();
        let b = pinned.read().as_bytes()[64];
        b
    }

    #[test]
    fn committed_changes_are_redone_and_losers_undone() {
        let (log, _) = log_and_cache();
        let a1 = log.append(&update(1, Lsn::ZERO, 2, 0, 10)).unwrap();
        let b1 = log.append(&update(2, Lsn::ZERO, 3, 0, 20)).unwrap();
        log.append(&WalRecord::Commit {
            txid: TransactionId::new(1),
            prev_lsn: a1,
            timestamp: 77,
        })
        .unwrap();
        log.append(&update(2, b1, 3, 20, 21)).unwrap();

        // Fresh cache: nothing reached the file.
        let cache = fresh_cache(&log);
        let report = recover(&log, &cache, RecoveryMode::Normal, Lsn::ZERO).unwrap();
        assert_eq!(byte(&cache, 2), 10);
        assert_eq!(byte(&cache, 3), 0);
        assert_eq!(report.rolled_back, vec![TransactionId::new(2)]);
        assert_eq!(report.changes_undone, 2);
        assert_eq!(report.committed, 1);
        assert_eq!(report.next_txid, 3);
        assert_eq!(report.last_commit_timestamp, Some(77));
    }

    #[test]
    fn second_recovery_changes_nothing() {
        let (log, _) = log_and_cache();
        log.append(&update(5, Lsn::ZERO, 2, 0, 1)).unwrap();
        let cache = fresh_cache(&log);
        recover(&log, &cache, RecoveryMode::Normal, Lsn::ZERO).unwrap();
        let end = log.end_lsn();

        let cache = fresh_cache(&log);
        let report = recover(&log, &cache, RecoveryMode::Normal, Lsn::ZERO).unwrap();
        assert!(report.rolled_back.is_empty());
        assert_eq!(log.end_lsn(), end);
        assert_eq!(byte(&cache, 2), 0);
    }

    #[test]
    fn interrupted_undo_resumes_from_compensation() {
        let (log, _) = log_and_cache();
        let cache = fresh_cache(&log);
        let u1 = log.append(&update(4, Lsn::ZERO, 2, 0, 1)).unwrap();
        apply::redo(&cache, u1, update(4, Lsn::ZERO, 2, 0, 1).delta().unwrap()).unwrap();
        let u2 = log.append(&update(4, u1, 2, 1, 2)).unwrap();
        apply::redo(&cache, u2, update(4, u1, 2, 1, 2).delta().unwrap()).unwrap();
        // Crash after undoing u2 only.
        apply::compensate(
            &log,
            &cache,
            TransactionId::new(4),
            u2,
            update(4, u1, 2, 1, 2).delta().unwrap(),
            u1,
        )
        .unwrap();

        let cache = fresh_cache(&log);
        let report = recover(&log, &cache, RecoveryMode::Normal, Lsn::ZERO).unwrap();
        assert_eq!(report.changes_undone, 1);
        assert_eq!(byte(&cache, 2), 0);
    }

    #[test]
    fn checkpoint_bounds_redo_and_seeds_losers() {
        let (log, _) = log_and_cache();
        let u1 = log.append(&update(7, Lsn::ZERO, 2, 0, 1)).unwrap();
        let cache = fresh_cache(&log);
        apply::redo(&cache, u1, update(7, Lsn::ZERO, 2, 0, 1).delta().unwrap()).unwrap();
        cache.flush_all().unwrap();
        let redo_lsn = log.end_lsn();
        let ckpt = log
            .append(&WalRecord::Checkpoint {
                redo_lsn,
                next_txid: TransactionId::new(9),
                active: vec![crate::wal::ActiveTxn {
                    txid: TransactionId::new(7),
                    first_lsn: u1,
                    last_lsn: u1,
                }],
            })
            .unwrap();

        // The page file kept u1; recovery must still undo it.
        let report = recover(&log, &cache, RecoveryMode::Normal, ckpt).unwrap();
        assert_eq!(report.start_lsn, redo_lsn);
        assert_eq!(report.rolled_back, vec![TransactionId::new(7)]);
        assert_eq!(report.next_txid, 9);
        assert_eq!(byte(&cache, 2), 0);
    }

    #[test]
    fn non_checkpoint_lsn_is_rejected() {
        let (log, cache) = log_and_cache();
        let lsn = log.append(&update(1, Lsn::ZERO, 2, 0, 1)).unwrap();
        assert!(matches!(
            recover(&log, &cache, RecoveryMode::Normal, lsn),
            Err(CoreError::LogCorruption { .. })
        ));
    }
}
