//! Lock table and blocking acquisition.

use crate::error::{CoreError, CoreResult};
use crate::lock::detector;
use crate::lock::mode::{LockMode, LockResource};
use crate::stats::{LockStats, LockStatsSnapshot};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Grant {
    pub(crate) txid: TransactionId,
    pub(crate) mode: LockMode,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub(crate) txid: TransactionId,
    /// Mode the waiter will hold once granted.
    pub(crate) mode: LockMode,
    /// The waiter already holds a weaker lock on the resource.
    pub(crate) upgrade: bool,
}

#[derive(Debug, Default)]
pub(crate) struct LockEntry {
    pub(crate) granted: Vec<Grant>,
    pub(crate) waiting: VecDeque<Waiter>,
}

impl LockEntry {
    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Debug, Default)]
struct Locker {
    resources: HashSet<LockResource>,
    activity: u64,
    protected: bool,
    victim: bool,
}

#[derive(Debug)]
pub(crate) struct LockState {
    pub(crate) objects: HashMap<LockResource, LockEntry>,
    lockers: HashMap<TransactionId, Locker>,
    last_detect: Instant,
}

impl LockState {
    pub(crate) fn is_victim(&self, txid: TransactionId) -> bool {
        self.lockers.get(&txid).is_some_and(|l| l.victim)
    }

    pub(crate) fn is_protected(&self, txid: TransactionId) -> bool {
        self.lockers.get(&txid).is_some_and(|l| l.protected)
    }

    pub(crate) fn activity(&self, txid: TransactionId) -> u64 {
        self.lockers.get(&txid).map_or(0, |l| l.activity)
    }

    fn held_mode(&self, txid: TransactionId, resource: LockResource) -> Option<LockMode> {
        self.objects
            .get(&resource)?
            .granted
            .iter()
            .find(|g| g.txid == txid)
            .map(|g| g.mode)
    }

    fn can_grant(
        &self,
        txid: TransactionId,
        resource: LockResource,
        mode: LockMode,
        upgrade: bool,
    ) -> bool {
        let Some(entry) = self.objects.get(&resource) else {
            return true;
        };
        if entry
            .granted
            .iter()
            .any(|g| g.txid != txid && !g.mode.compatible(mode))
        {
            return false;
        }
        if upgrade {
            return true;
        }
        // First come, first served: an incompatible request queued ahead
        // blocks this one.
        for w in &entry.waiting {
            if w.txid == txid {
                break;
            }
            if !w.mode.compatible(mode) {
                return false;
            }
        }
        true
    }

    fn grant(&mut self, txid: TransactionId, resource: LockResource, mode: LockMode) {
        let entry = self.objects.entry(resource).or_default();
        match entry.granted.iter_mut().find(|g| g.txid == txid) {
            Some(g) => g.mode = mode,
            None => entry.granted.push(Grant { txid, mode }),
        }
        self.lockers
            .entry(txid)
            .or_default()
            .resources
            .insert(resource);
    }

    fn enqueue(&mut self, resource: LockResource, waiter: Waiter) {
        let entry = self.objects.entry(resource).or_default();
        if waiter.upgrade {
            let at = entry.waiting.iter().take_while(|w| w.upgrade).count();
            entry.waiting.insert(at, waiter);
        } else {
            entry.waiting.push_back(waiter);
        }
        self.lockers.entry(waiter.txid).or_default();
    }

    fn dequeue(&mut self, txid: TransactionId, resource: LockResource) {
        if let Some(entry) = self.objects.get_mut(&resource) {
            entry.waiting.retain(|w| w.txid != txid);
            if entry.is_empty() {
                self.objects.remove(&resource);
            }
        }
    }

    fn take_victim(&mut self, txid: TransactionId) -> bool {
        match self.lockers.get_mut(&txid) {
            Some(l) if l.victim => {
                l.victim = false;
                true
            }
            _ => false,
        }
    }
}

/// Page and database lock manager.
///
/// Lock requests that cannot be granted wait on a condition variable.
/// While anyone waits, the deadlock detector runs every
/// `deadlock_interval`; it picks victims from the wait-for graph and wakes
/// them with a `Deadlock` error.
pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    timeout: Option<Duration>,
    interval: Duration,
    stats: LockStats,
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new(timeout: Option<Duration>, interval: Duration) -> Self {
        Self {
            state: Mutex::new(LockState {
                objects: HashMap::new(),
                lockers: HashMap::new(),
                last_detect: Instant::now(),
            }),
            cond: Condvar::new(),
            timeout,
            interval,
            stats: LockStats::default(),
        }
    }

    /// Acquires `mode` on `resource` for `txid`, upgrading a lock it
    /// already holds to the weakest mode covering both.
    ///
    /// # Errors
    ///
    /// - `LockNotGranted` if `wait` is false and the lock is held
    /// - `LockTimeout` if the configured timeout passes
    /// - `Deadlock` if the requester is chosen as deadlock victim
    pub fn acquire(
        &self,
        txid: TransactionId,
        resource: LockResource,
        mode: LockMode,
        wait: bool,
    ) -> CoreResult<()> {
        self.stats.record_request();
        let mut st = self.state.lock();

        let held = st.held_mode(txid, resource);
        if held.is_some_and(|h| h.covers(mode)) {
            return Ok(());
        }
        let wanted = held.map_or(mode, |h| h.join(mode));
        let upgrade = held.is_some();

        if st.can_grant(txid, resource, wanted, upgrade) {
            st.grant(txid, resource, wanted);
            return Ok(());
        }
        if !wait {
            self.stats.record_not_granted();
            return Err(CoreError::LockNotGranted {
                txid,
                resource: resource.to_string(),
            });
        }

        self.stats.record_wait();
        st.enqueue(
            resource,
            Waiter {
                txid,
                mode: wanted,
                upgrade,
            },
        );
        tracing::trace!(%txid, %resource, mode = %wanted, "waiting for lock");
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            if st.take_victim(txid) {
                st.dequeue(txid, resource);
                self.cond.notify_all();
                self.stats.record_deadlock();
                tracing::debug!(%txid, %resource, "deadlock victim");
                return Err(CoreError::Deadlock {
                    txid,
                    resource: resource.to_string(),
                });
            }
            if st.can_grant(txid, resource, wanted, upgrade) {
                st.dequeue(txid, resource);
                st.grant(txid, resource, wanted);
                return Ok(());
            }

            let now = Instant::now();
            let mut slice = self.interval;
            if let Some(deadline) = deadline {
                if now >= deadline {
                    st.dequeue(txid, resource);
                    self.cond.notify_all();
                    self.stats.record_timeout();
                    return Err(CoreError::LockTimeout {
                        txid,
                        resource: resource.to_string(),
                    });
                }
                slice = slice.min(deadline - now);
            }

            if now.duration_since(st.last_detect) >= self.interval {
                st.last_detect = now;
                self.stats.record_detector_run();
                let victims = detector::find_victims(&st);
                if !victims.is_empty() {
                    for v in &victims {
                        if let Some(l) = st.lockers.get_mut(v) {
                            l.victim = true;
                        }
                    }
                    tracing::debug!(?victims, "deadlock detected");
                    self.cond.notify_all();
                    continue;
                }
            }

            self.cond.wait_for(&mut st, slice);
        }
    }

    /// Releases one read lock early (read-committed isolation). Write and
    /// intention-write locks are kept. Returns whether a lock was released.
    pub fn release_read(&self, txid: TransactionId, resource: LockResource) -> bool {
        let mut st = self.state.lock();
        let released = match st.objects.get_mut(&resource) {
            Some(entry) => {
                let before = entry.granted.len();
                entry.granted.retain(|g| g.txid != txid || !g.mode.is_read());
                let released = entry.granted.len() != before;
                if entry.is_empty() {
                    st.objects.remove(&resource);
                }
                released
            }
            None => false,
        };
        if released {
            if let Some(l) = st.lockers.get_mut(&txid) {
                l.resources.remove(&resource);
            }
            self.cond.notify_all();
        }
        released
    }

    /// Releases every lock held by `txid` and forgets the locker.
    pub fn release_all(&self, txid: TransactionId) {
        let mut st = self.state.lock();
        let Some(locker) = st.lockers.remove(&txid) else {
            return;
        };
        for resource in locker.resources {
            if let Some(entry) = st.objects.get_mut(&resource) {
                entry.granted.retain(|g| g.txid != txid);
                entry.waiting.retain(|w| w.txid != txid);
                if entry.is_empty() {
                    st.objects.remove(&resource);
                }
            }
        }
        self.cond.notify_all();
    }

    /// Adds `records` to the locker's log activity, used to choose
    /// deadlock victims.
    pub fn record_activity(&self, txid: TransactionId, records: u64) {
        self.state.lock().lockers.entry(txid).or_default().activity += records;
    }

    /// Marks a locker as never to be chosen as deadlock victim.
    pub fn set_protected(&self, txid: TransactionId, protected: bool) {
        self.state.lock().lockers.entry(txid).or_default().protected = protected;
    }

    /// Locks held by `txid`.
    pub fn held_by(&self, txid: TransactionId) -> Vec<(LockResource, LockMode)> {
        let st = self.state.lock();
        let Some(locker) = st.lockers.get(&txid) else {
            return Vec::new();
        };
        locker
            .resources
            .iter()
            .filter_map(|&r| st.held_mode(txid, r).map(|m| (r, m)))
            .collect()
    }

    /// Number of granted locks.
    pub fn lock_count(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .map(|e| e.granted.len())
            .sum()
    }

    /// Number of queued requests.
    pub fn waiting_count(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .map(|e| e.waiting.len())
            .sum()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LockStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, PageKey};
    use std::sync::Arc;
    use std::thread;

    fn page(n: u32) -> LockResource {
        LockResource::Page(PageKey::new(FileId::new(1), n))
    }

    fn t(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new(None, Duration::from_millis(5)))
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Read, true).unwrap();
        lm.acquire(t(2), page(1), LockMode::Read, true).unwrap();
        assert_eq!(lm.lock_count(), 2);
    }

    #[test]
    fn no_wait_conflict_is_not_granted() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Write, true).unwrap();
        let err = lm.acquire(t(2), page(1), LockMode::Read, false).unwrap_err();
        assert!(matches!(err, CoreError::LockNotGranted { .. }));
        assert_eq!(lm.stats().not_granted, 1);
    }

    #[test]
    fn upgrade_joins_modes() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Read, true).unwrap();
        lm.acquire(t(1), page(1), LockMode::IntentWrite, true).unwrap();
        assert_eq!(lm.held_by(t(1)), vec![(page(1), LockMode::ReadIntentWrite)]);
        // Already covered: no change.
        lm.acquire(t(1), page(1), LockMode::IntentRead, true).unwrap();
        assert_eq!(lm.lock_count(), 1);
    }

    #[test]
    fn waiter_granted_after_release() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Write, true).unwrap();
        let lm2 = Arc::clone(&lm);
        let h = thread::spawn(move || lm2.acquire(t(2), page(1), LockMode::Write, true));
        while lm.waiting_count() == 0 {
            thread::yield_now();
        }
        lm.release_all(t(1));
        h.join().unwrap().unwrap();
        assert_eq!(lm.held_by(t(2)), vec![(page(1), LockMode::Write)]);
    }

    #[test]
    fn timeout_expires() {
        let lm = Arc::new(LockManager::new(
            Some(Duration::from_millis(30)),
            Duration::from_millis(5),
        ));
        lm.acquire(t(1), page(1), LockMode::Write, true).unwrap();
        let err = lm.acquire(t(2), page(1), LockMode::Read, true).unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        assert_eq!(lm.waiting_count(), 0);
    }

    #[test]
    fn deadlock_picks_one_victim() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Write, true).unwrap();
        lm.acquire(t(2), page(2), LockMode::Write, true).unwrap();
        // t(1) did more work, so t(2) should lose.
        lm.record_activity(t(1), 10);
        lm.record_activity(t(2), 1);

        let lm1 = Arc::clone(&lm);
        let h1 = thread::spawn(move || {
            let r = lm1.acquire(t(1), page(2), LockMode::Write, true);
            if r.is_err() {
                lm1.release_all(t(1));
            }
            r
        });
        let lm2 = Arc::clone(&lm);
        let h2 = thread::spawn(move || {
            let r = lm2.acquire(t(2), page(1), LockMode::Write, true);
            if r.is_err() {
                lm2.release_all(t(2));
            }
            r
        });

        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();
        assert!(r1.is_ok());
        assert!(matches!(r2, Err(CoreError::Deadlock { .. })));
        assert_eq!(lm.stats().deadlocks, 1);
    }

    #[test]
    fn protected_locker_is_never_victim() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Write, true).unwrap();
        lm.acquire(t(2), page(2), LockMode::Write, true).unwrap();
        lm.set_protected(t(1), true);
        lm.record_activity(t(2), 100);

        let lm1 = Arc::clone(&lm);
        let h1 = thread::spawn(move || lm1.acquire(t(1), page(2), LockMode::Write, true));
        let lm2 = Arc::clone(&lm);
        let h2 = thread::spawn(move || {
            let r = lm2.acquire(t(2), page(1), LockMode::Write, true);
            if r.is_err() {
                lm2.release_all(t(2));
            }
            r
        });
        assert!(h1.join().unwrap().is_ok());
        assert!(h2.join().unwrap().is_err());
    }

    #[test]
    fn release_read_keeps_write_locks() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Read, true).unwrap();
        lm.acquire(t(1), page(2), LockMode::Write, true).unwrap();
        assert!(lm.release_read(t(1), page(1)));
        assert!(!lm.release_read(t(1), page(2)));
        assert_eq!(lm.held_by(t(1)), vec![(page(2), LockMode::Write)]);
    }

    #[test]
    fn queued_writer_blocks_new_reader() {
        let lm = manager();
        lm.acquire(t(1), page(1), LockMode::Read, true).unwrap();
        let lm2 = Arc::clone(&lm);
        let h = thread::spawn(move || lm2.acquire(t(2), page(1), LockMode::Write, true));
        while lm.waiting_count() == 0 {
            thread::yield_now();
        }
        // A new reader must queue behind the writer.
        let err = lm.acquire(t(3), page(1), LockMode::Read, false).unwrap_err();
        assert!(matches!(err, CoreError::LockNotGranted { .. }));
        lm.release_all(t(1));
        h.join().unwrap().unwrap();
    }
}
