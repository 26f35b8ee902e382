//! Frozen page versions for snapshot reads.
//!
//! When a transaction first modifies a page, the page's committed image is
//! frozen together with the commit sequence that produced it. A snapshot
//! reader at sequence `S` sees the newest image whose sequence is `<= S`:
//! the current page if it is committed and old enough, a frozen copy
//! otherwise. Frozen copies live in memory only and are dropped once no
//! running or future snapshot can need them.

use crate::page::Page;
use crate::types::{FileId, PageKey, SequenceNumber, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a snapshot reader should see for a page.
#[derive(Debug, Clone)]
pub enum Visible {
    /// The page as it is in the cache.
    Current,
    /// A frozen copy.
    Frozen(Arc<Page>),
}

#[derive(Debug)]
struct Frozen {
    seq: u64,
    origin: TransactionId,
    image: Arc<Page>,
}

#[derive(Debug, Default)]
struct PageVersions {
    /// Uncommitted modifier of the current image.
    writer: Option<TransactionId>,
    /// Sequence of the commit that produced the current image.
    committed: u64,
    /// Older images, oldest first.
    frozen: Vec<Frozen>,
}

#[derive(Debug, Default)]
struct VersionState {
    pages: HashMap<PageKey, PageVersions>,
    /// Active snapshot sequences with reference counts.
    snapshots: BTreeMap<u64, usize>,
    /// Sequence of the most recent visible commit.
    latest: u64,
}

impl VersionState {
    /// Oldest sequence any present or future snapshot can read at.
    fn horizon(&self) -> u64 {
        self.snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(self.latest)
    }

    fn prune(&mut self, key: PageKey) {
        let horizon = self.horizon();
        let Some(pv) = self.pages.get_mut(&key) else {
            return;
        };
        prune_versions(pv, horizon);
        if pv.writer.is_none() && pv.frozen.is_empty() && pv.committed <= horizon {
            self.pages.remove(&key);
        }
    }
}

fn prune_versions(pv: &mut PageVersions, horizon: u64) {
    let n = pv.frozen.len();
    let mut next_seqs = Vec::with_capacity(n);
    for i in 0..n {
        let next = if i + 1 < n {
            pv.frozen[i + 1].seq
        } else if pv.writer.is_some() {
            u64::MAX
        } else {
            pv.committed
        };
        next_seqs.push(next);
    }
    let mut i = 0;
    pv.frozen.retain(|_| {
        let keep = next_seqs[i] > horizon;
        i += 1;
        keep
    });
}

/// Tracks frozen page images and commit sequences.
#[derive(Debug)]
pub struct VersionStore {
    enabled: bool,
    state: Mutex<VersionState>,
}

impl VersionStore {
    /// Creates a store. When disabled, only commit sequences are tracked.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(VersionState::default()),
        }
    }

    /// Whether images are frozen.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sequence of the most recent commit.
    pub fn latest(&self) -> SequenceNumber {
        SequenceNumber::new(self.state.lock().latest)
    }

    /// Starts a snapshot at the latest commit and registers it.
    pub fn begin_snapshot(&self) -> SequenceNumber {
        let mut st = self.state.lock();
        let seq = st.latest;
        *st.snapshots.entry(seq).or_insert(0) += 1;
        SequenceNumber::new(seq)
    }

    /// Unregisters a snapshot and drops versions nobody needs any more.
    pub fn end_snapshot(&self, seq: SequenceNumber) {
        let mut st = self.state.lock();
        if let Some(count) = st.snapshots.get_mut(&seq.as_u64()) {
            *count -= 1;
            if *count == 0 {
                st.snapshots.remove(&seq.as_u64());
            }
        }
        let keys: Vec<PageKey> = st.pages.keys().copied().collect();
        for key in keys {
            st.prune(key);
        }
    }

    /// Number of active snapshots.
    pub fn active_snapshots(&self) -> usize {
        self.state.lock().snapshots.values().sum()
    }

    /// Records that `txid` is about to modify a page whose current
    /// (committed) image is `image`. Must be called with the page latched
    /// for writing. Later calls by the same writer are no-ops.
    pub fn before_write(&self, key: PageKey, txid: TransactionId, image: &Page) {
        if !self.enabled {
            return;
        }
        let mut st = self.state.lock();
        let pv = st.pages.entry(key).or_default();
        if pv.writer == Some(txid) {
            return;
        }
        pv.writer = Some(txid);
        pv.frozen.push(Frozen {
            seq: pv.committed,
            origin: txid,
            image: Arc::new(image.clone()),
        });
    }

    /// Decides which image of `key` a snapshot reader sees. Must be called
    /// with the current page latched.
    pub fn visible(&self, key: PageKey, reader: TransactionId, snapshot: SequenceNumber) -> Visible {
        let st = self.state.lock();
        let Some(pv) = st.pages.get(&key) else {
            return Visible::Current;
        };
        if pv.writer == Some(reader) {
            return Visible::Current;
        }
        let snapshot = snapshot.as_u64();
        if pv.writer.is_none() && pv.committed <= snapshot {
            return Visible::Current;
        }
        pv.frozen
            .iter()
            .rev()
            .find(|f| f.seq <= snapshot)
            .map_or(Visible::Current, |f| Visible::Frozen(Arc::clone(&f.image)))
    }

    /// True if a commit after `snapshot` changed the page.
    pub fn changed_since(&self, key: PageKey, snapshot: SequenceNumber) -> bool {
        self.state
            .lock()
            .pages
            .get(&key)
            .is_some_and(|pv| pv.committed > snapshot.as_u64())
    }

    /// Publishes a commit: the pages written by `txid` become current at a
    /// new sequence, which is returned.
    pub fn on_commit<'a>(
        &self,
        txid: TransactionId,
        pages: impl IntoIterator<Item = &'a PageKey>,
    ) -> SequenceNumber {
        let mut st = self.state.lock();
        st.latest += 1;
        let seq = st.latest;
        if self.enabled {
            let keys: Vec<PageKey> = pages.into_iter().copied().collect();
            for &key in &keys {
                if let Some(pv) = st.pages.get_mut(&key) {
                    if pv.writer == Some(txid) {
                        pv.writer = None;
                        pv.committed = seq;
                    }
                }
            }
            for key in keys {
                st.prune(key);
            }
        }
        SequenceNumber::new(seq)
    }

    /// Forgets the writes of an aborted transaction. Its pages have been
    /// restored, so the frozen image it created is the current one again.
    pub fn on_abort<'a>(&self, txid: TransactionId, pages: impl IntoIterator<Item = &'a PageKey>) {
        if !self.enabled {
            return;
        }
        let mut st = self.state.lock();
        for &key in pages {
            if let Some(pv) = st.pages.get_mut(&key) {
                if pv.writer == Some(txid) {
                    pv.writer = None;
                    if pv.frozen.last().is_some_and(|f| f.origin == txid) {
                        pv.frozen.pop();
                    }
                }
            }
            st.prune(key);
        }
    }

    /// Drops everything known about a file.
    pub fn forget_file(&self, file: FileId) {
        self.state.lock().pages.retain(|key, _| key.file != file);
    }

    /// Number of frozen images held.
    pub fn frozen_count(&self) -> usize {
        self.state.lock().pages.values().map(|pv| pv.frozen.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    fn key(pgno: u32) -> PageKey {
        PageKey::new(FileId::new(1), pgno)
    }

    fn image(tag: u8) -> Page {
        let mut p = Page::new(512);
        p.init(PageType::Leaf, 0);
        p.set_body(&[tag]).unwrap();
        p
    }

    fn body(v: &Visible) -> Option<u8> {
        match v {
            Visible::Current => None,
            Visible::Frozen(p) => Some(p.body()[0]),
        }
    }

    #[test]
    fn snapshot_sees_pre_image_of_uncommitted_write() {
        let store = VersionStore::new(true);
        let writer = TransactionId::new(1);
        let reader = TransactionId::new(2);
        let snap = store.begin_snapshot();

        store.before_write(key(5), writer, &image(0xa));
        assert_eq!(body(&store.visible(key(5), reader, snap)), Some(0xa));
        assert!(matches!(store.visible(key(5), writer, snap), Visible::Current));
    }

    #[test]
    fn snapshot_keeps_old_image_after_commit() {
        let store = VersionStore::new(true);
        let old_snap = store.begin_snapshot();
        store.before_write(key(5), TransactionId::new(1), &image(0xa));
        store.on_commit(TransactionId::new(1), &[key(5)]);

        let new_snap = store.begin_snapshot();
        let reader = TransactionId::new(9);
        assert_eq!(body(&store.visible(key(5), reader, old_snap)), Some(0xa));
        assert!(matches!(store.visible(key(5), reader, new_snap), Visible::Current));
        assert!(store.changed_since(key(5), old_snap));
        assert!(!store.changed_since(key(5), new_snap));
    }

    #[test]
    fn versions_dropped_when_no_snapshot_needs_them() {
        let store = VersionStore::new(true);
        let snap = store.begin_snapshot();
        store.before_write(key(1), TransactionId::new(1), &image(1));
        store.on_commit(TransactionId::new(1), &[key(1)]);
        assert_eq!(store.frozen_count(), 1);

        store.end_snapshot(snap);
        assert_eq!(store.frozen_count(), 0);
        assert_eq!(store.active_snapshots(), 0);
    }

    #[test]
    fn commit_without_snapshots_keeps_nothing() {
        let store = VersionStore::new(true);
        store.before_write(key(1), TransactionId::new(1), &image(1));
        assert_eq!(store.frozen_count(), 1);
        store.on_commit(TransactionId::new(1), &[key(1)]);
        assert_eq!(store.frozen_count(), 0);
    }

    #[test]
    fn abort_pops_its_version() {
        let store = VersionStore::new(true);
        let snap = store.begin_snapshot();
        store.before_write(key(1), TransactionId::new(1), &image(1));
        store.on_abort(TransactionId::new(1), &[key(1)]);
        assert_eq!(store.frozen_count(), 0);
        assert!(matches!(
            store.visible(key(1), TransactionId::new(2), snap),
            Visible::Current
        ));
    }

    #[test]
    fn sequences_advance_when_disabled() {
        let store = VersionStore::new(false);
        store.before_write(key(1), TransactionId::new(1), &image(1));
        assert_eq!(store.frozen_count(), 0);
        let a = store.on_commit(TransactionId::new(1), &[key(1)]);
        let b = store.on_commit(TransactionId::new(2), &[]);
        assert!(b > a);
        assert_eq!(store.latest(), b);
    }
}
