//! Shared page cache with clock eviction.
//!
//! Frames are guarded by individual read/write latches. The page table,
//! pin counts and dirty flags live under one cache mutex. Latch order is
//! frame latch, then cache mutex, then the log; the cache never waits for
//! a latch while holding its mutex.
//!
//! Page reads and eviction write-backs run with the mutex released. The
//! frame is pinned and marked busy for the duration; fetches of the page it
//! holds wait on a condition variable until the I/O is done.

use crate::cache::file::PageFile;
use crate::cache::version::VersionStore;
use crate::error::{CoreError, CoreResult};
use crate::failpoint;
use crate::page::Page;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::types::{FileId, Lsn, PageKey};
use crate::wal::LogManager;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// How to treat a page that is not in the file yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// The page must exist.
    Existing,
    /// A page past the end of the file is returned zero-filled.
    Create,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameMeta {
    key: Option<PageKey>,
    pins: u32,
    dirty: bool,
    /// LSN at or before the first change since the page was last clean.
    rec_lsn: Lsn,
    referenced: bool,
    /// Being read in or written back with the cache mutex released.
    busy: bool,
}

/// Frame picked by the clock hand.
enum Claim {
    /// Empty and off the page table; ready for a new page.
    Ready(usize),
    /// A dirty victim, pinned and busy under its old key until written.
    Dirty { idx: usize, old: PageKey },
}

struct CacheState {
    table: HashMap<PageKey, usize>,
    meta: Vec<FrameMeta>,
    free: Vec<usize>,
    hand: usize,
}

/// A page pinned in the cache. Unpinned on drop.
pub struct PinnedPage<'a> {
    cache: &'a PageCache,
    frame: usize,
    key: PageKey,
}

impl PinnedPage<'_> {
    /// The page's identity.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Latches the page for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.cache.frames[self.frame].read()
    }

    /// Latches the page for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.cache.frames[self.frame].write()
    }

    /// Marks the page dirty. `rec_lsn` must not be later than the first
    /// log record describing the change, so call this before appending it.
    pub fn mark_dirty(&self, rec_lsn: Lsn) {
        let mut st = self.cache.state.lock();
        let meta = &mut st.meta[self.frame];
        if !meta.dirty {
            meta.dirty = true;
            meta.rec_lsn = rec_lsn;
        }
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        let mut st = self.cache.state.lock();
        let meta = &mut st.meta[self.frame];
        debug_assert!(meta.pins > 0);
        meta.pins = meta.pins.saturating_sub(1);
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("key", &self.key)
            .field("frame", &self.frame)
            .finish()
    }
}

/// Fixed-capacity cache of pages from every database file.
pub struct PageCache {
    page_size: usize,
    frames: Vec<RwLock<Page>>,
    state: Mutex<CacheState>,
    io_done: Condvar,
    files: RwLock<HashMap<FileId, Arc<PageFile>>>,
    log: Arc<LogManager>,
    versions: VersionStore,
    io_retries: u32,
    stats: CacheStats,
}

impl PageCache {
    /// Creates a cache of `capacity` frames.
    #[must_use]
    pub fn new(
        page_size: usize,
        capacity: usize,
        log: Arc<LogManager>,
        multiversion: bool,
        io_retries: u32,
    ) -> Self {
        let frames = (0..capacity).map(|_| RwLock::new(Page::new(page_size))).collect();
        Self {
            page_size,
            frames,
            state: Mutex::new(CacheState {
                table: HashMap::new(),
                meta: vec![FrameMeta::default(); capacity],
                free: (0..capacity).rev().collect(),
                hand: 0,
            }),
            io_done: Condvar::new(),
            files: RwLock::new(HashMap::new()),
            log,
            versions: VersionStore::new(multiversion),
            io_retries,
            stats: CacheStats::default(),
        }
    }

    /// Page size of every cached file.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of frames.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// The frozen-version store.
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Makes a database file's pages reachable through the cache.
    pub fn register_file(&self, file: Arc<PageFile>) {
        self.files.write().insert(file.id(), file);
    }

    /// Returns a registered file.
    pub fn file(&self, id: FileId) -> Option<Arc<PageFile>> {
        self.files.read().get(&id).cloned()
    }

    /// Drops a file and every cached page of it, dirty or not.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if one of its pages is pinned.
    pub fn discard_file(&self, id: FileId) -> CoreResult<()> {
        let mut st = self.state.lock();
        let frames: Vec<(PageKey, usize)> = st
            .table
            .iter()
            .filter(|(key, _)| key.file == id)
            .map(|(&key, &idx)| (key, idx))
            .collect();
        if frames.iter().any(|&(_, idx)| st.meta[idx].pins > 0) {
            return Err(CoreError::invalid_operation(format!(
                "pages of {id} are still in use"
            )));
        }
        for (key, idx) in frames {
            st.table.remove(&key);
            st.meta[idx] = FrameMeta::default();
            st.free.push(idx);
        }
        drop(st);
        self.files.write().remove(&id);
        self.versions.forget_file(id);
        Ok(())
    }

    /// Pins a page, reading it from its file on a miss.
    ///
    /// # Errors
    ///
    /// Returns `CacheExhausted` if every frame is pinned, `ChecksumMismatch`
    /// for a damaged page, `InvalidFormat` for a missing page in
    /// [`FetchMode::Existing`], and I/O errors.
    pub fn fetch(&self, key: PageKey, mode: FetchMode) -> CoreResult<PinnedPage<'_>> {
        let mut st = self.state.lock();
        loop {
            if let Some(&idx) = st.table.get(&key) {
                if st.meta[idx].busy {
                    self.io_done.wait(&mut st);
                    continue;
                }
                let meta = &mut st.meta[idx];
                meta.pins += 1;
                meta.referenced = true;
                self.stats.record_hit();
                return Ok(PinnedPage {
                    cache: self,
                    frame: idx,
                    key,
                });
            }

            let file = self
                .file(key.file)
                .ok_or_else(|| CoreError::invalid_argument(format!("{} is not open", key.file)))?;
            match self.claim_frame(&mut st)? {
                Claim::Dirty { idx, old } => {
                    let written = MutexGuard::unlocked(&mut st, || {
                        let image = self.frames[idx].read().clone();
                        self.write_back(old, image)
                    });
                    let meta = &mut st.meta[idx];
                    meta.busy = false;
                    meta.pins = 0;
                    if let Err(e) = written {
                        self.io_done.notify_all();
                        tracing::warn!(page = %old, error = %e, "write-back of eviction victim failed");
                        return Err(e);
                    }
                    st.table.remove(&old);
                    st.meta[idx] = FrameMeta::default();
                    st.free.push(idx);
                    self.stats.record_eviction();
                    self.io_done.notify_all();
                    // Another thread may have loaded `key` meanwhile.
                }
                Claim::Ready(idx) => {
                    self.stats.record_miss();
                    st.table.insert(key, idx);
                    st.meta[idx] = FrameMeta {
                        key: Some(key),
                        pins: 1,
                        referenced: true,
                        busy: true,
                        ..FrameMeta::default()
                    };
                    let loaded = MutexGuard::unlocked(&mut st, || -> CoreResult<()> {
                        let page = self.load(&file, key, mode)?;
                        *self.frames[idx].write() = page;
                        Ok(())
                    });
                    st.meta[idx].busy = false;
                    self.io_done.notify_all();
                    if let Err(e) = loaded {
                        st.table.remove(&key);
                        st.meta[idx] = FrameMeta::default();
                        st.free.push(idx);
                        return Err(e);
                    }
                    return Ok(PinnedPage {
                        cache: self,
                        frame: idx,
                        key,
                    });
                }
            }
        }
    }

    /// Pins a page only if it is cached, waiting out I/O in progress.
    fn pin_if_cached(&self, key: PageKey) -> Option<PinnedPage<'_>> {
        let mut st = self.state.lock();
        loop {
            let idx = *st.table.get(&key)?;
            if st.meta[idx].busy {
                self.io_done.wait(&mut st);
                continue;
            }
            st.meta[idx].pins += 1;
            return Some(PinnedPage {
                cache: self,
                frame: idx,
                key,
            });
        }
    }

    /// Unpins a page, marking it dirty first if requested.
    pub fn release(&self, page: PinnedPage<'_>, dirty: bool) {
        if dirty {
            let lsn = page.read().lsn();
            page.mark_dirty(lsn);
        }
        drop(page);
    }

    /// Finds a frame for a new page: a free one, or an unpinned victim
    /// chosen by the clock hand. A clean victim is dropped on the spot; a
    /// dirty one is reserved for the caller to write back.
    fn claim_frame(&self, st: &mut CacheState) -> CoreResult<Claim> {
        if let Some(idx) = st.free.pop() {
            return Ok(Claim::Ready(idx));
        }
        let n = self.frames.len();
        for _ in 0..2 * n {
            let idx = st.hand;
            st.hand = (st.hand + 1) % n;
            let meta = &mut st.meta[idx];
            if meta.pins > 0 || meta.busy {
                continue;
            }
            if meta.referenced {
                meta.referenced = false;
                continue;
            }
            let Some(old) = meta.key else {
                return Ok(Claim::Ready(idx));
            };
            if meta.dirty {
                meta.pins = 1;
                meta.busy = true;
                return Ok(Claim::Dirty { idx, old });
            }
            st.table.remove(&old);
            st.meta[idx] = FrameMeta::default();
            self.stats.record_eviction();
            return Ok(Claim::Ready(idx));
        }
        Err(CoreError::CacheExhausted { capacity: n })
    }

    fn load(&self, file: &PageFile, key: PageKey, mode: FetchMode) -> CoreResult<Page> {
        let mut attempt = 0;
        loop {
            match file.read_page(key.pgno) {
                Ok(Some(page)) => {
                    page.verify(key)?;
                    return Ok(page);
                }
                Ok(None) => {
                    return match mode {
                        FetchMode::Create => Ok(Page::new(self.page_size)),
                        FetchMode::Existing => Err(CoreError::invalid_format(format!(
                            "page {key} is past the end of {}",
                            file.name()
                        ))),
                    };
                }
                Err(CoreError::Storage(e)) if e.is_transient() && attempt < self.io_retries => {
                    attempt += 1;
                    self.stats.record_io_retry();
                    tracing::debug!(page = %key, attempt, error = %e, "retrying page read");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes one page image, honoring write-ahead logging.
    fn write_back(&self, key: PageKey, mut image: Page) -> CoreResult<()> {
        let Some(file) = self.file(key.file) else {
            // The file was removed; nothing to preserve.
            return Ok(());
        };
        self.log.flush(image.lsn())?;
        image.seal(key.pgno);

        let mut attempt = 0;
        loop {
            let result = failpoint::maybe_fail("cache.write_page")
                .map_err(CoreError::from)
                .and_then(|()| file.write_page(key.pgno, &image));
            match result {
                Ok(()) => {
                    self.stats.record_page_written();
                    return Ok(());
                }
                Err(CoreError::Storage(e)) if e.is_transient() && attempt < self.io_retries => {
                    attempt += 1;
                    self.stats.record_io_retry();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes a cached page back if it is dirty. Returns whether it was.
    ///
    /// # Errors
    ///
    /// Returns log or page I/O errors.
    pub fn flush_page(&self, key: PageKey) -> CoreResult<bool> {
        let Some(page) = self.pin_if_cached(key) else {
            return Ok(false);
        };
        let frame = page.read();
        if !self.state.lock().meta[page.frame].dirty {
            return Ok(false);
        }
        self.write_back(key, frame.clone())?;
        let mut st = self.state.lock();
        st.meta[page.frame].dirty = false;
        st.meta[page.frame].rec_lsn = Lsn::ZERO;
        Ok(true)
    }

    /// Writes back every dirty page whose first unflushed change is older
    /// than `threshold`. Returns the number of pages written.
    ///
    /// # Errors
    ///
    /// Returns log or page I/O errors.
    pub fn flush_dirty_before(&self, threshold: Lsn) -> CoreResult<usize> {
        let keys: Vec<PageKey> = {
            let st = self.state.lock();
            st.meta
                .iter()
                .filter(|m| m.dirty && m.rec_lsn < threshold)
                .filter_map(|m| m.key)
                .collect()
        };
        let mut written = 0;
        for key in keys {
            if self.flush_page(key)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Writes back every dirty page and syncs every file.
    ///
    /// # Errors
    ///
    /// Returns log or page I/O errors.
    pub fn flush_all(&self) -> CoreResult<usize> {
        let written = self.flush_dirty_before(Lsn::MAX)?;
        self.sync_files()?;
        Ok(written)
    }

    /// Syncs every registered file.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub fn sync_files(&self) -> CoreResult<()> {
        let files: Vec<Arc<PageFile>> = self.files.read().values().cloned().collect();
        for file in files {
            file.sync()?;
        }
        Ok(())
    }

    /// Dirty pages and their recovery LSNs.
    pub fn dirty_pages(&self) -> Vec<(PageKey, Lsn)> {
        let st = self.state.lock();
        st.meta
            .iter()
            .filter(|m| m.dirty)
            .filter_map(|m| m.key.map(|k| (k, m.rec_lsn)))
            .collect()
    }

    /// Number of pinned frames.
    pub fn pinned_count(&self) -> usize {
        self.state.lock().meta.iter().filter(|m| m.pins > 0).count()
    }

    /// Counters plus dirty and capacity gauges.
    pub fn stats(&self) -> CacheStatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.dirty_pages = self.state.lock().meta.iter().filter(|m| m.dirty).count() as u64;
        snap.capacity = self.frames.len() as u64;
        snap
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("page_size", &self.page_size)
            .field("capacity", &self.frames.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use crate::types::TransactionId;
    use crate::wal::{PageDelta, WalRecord};

    const FILE: FileId = FileId::new(1);

    fn cache(capacity: usize) -> PageCache {
        let log = Arc::new(LogManager::in_memory(1 << 20, 1 << 16));
        let cache = PageCache::new(512, capacity, log, false, 2);
        cache.register_file(Arc::new(PageFile::in_memory(FILE, "t", 512)));
        cache
    }

    fn key(pgno: u32) -> PageKey {
        PageKey::new(FILE, pgno)
    }

    fn write_tag(cache: &PageCache, pgno: u32, tag: u8) {
        let page = cache.fetch(key(pgno), FetchMode::Create).unwrap();
        page.mark_dirty(Lsn::ZERO);
        let mut p = page.write();
        p.init(PageType::Leaf, 0);
        p.set_body(&[tag]).unwrap();
    }

    #[test]
    fn existing_mode_rejects_missing_page() {
        let cache = cache(8);
        let err = cache.fetch(key(3), FetchMode::Existing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
        assert_eq!(cache.pinned_count(), 0);
    }

    #[test]
    fn hit_after_miss() {
        let cache = cache(8);
        drop(cache.fetch(key(1), FetchMode::Create).unwrap());
        drop(cache.fetch(key(1), FetchMode::Create).unwrap());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let cache = cache(8);
        for pgno in 0..32 {
            write_tag(&cache, pgno, pgno as u8);
        }
        assert!(cache.stats().evictions > 0);
        for pgno in 0..32 {
            let page = cache.fetch(key(pgno), FetchMode::Existing).unwrap();
            assert_eq!(page.read().body(), &[pgno as u8]);
        }
    }

    #[test]
    fn all_pinned_is_exhausted() {
        let cache = cache(8);
        let pins: Vec<_> = (0..8)
            .map(|pgno| cache.fetch(key(pgno), FetchMode::Create).unwrap())
            .collect();
        let err = cache.fetch(key(100), FetchMode::Create).unwrap_err();
        assert!(matches!(err, CoreError::CacheExhausted { capacity: 8 }));
        drop(pins);
        assert!(cache.fetch(key(100), FetchMode::Create).is_ok());
    }

    #[test]
    fn write_back_flushes_log_first() {
        let log = Arc::new(LogManager::in_memory(1 << 20, 1 << 16));
        let cache = PageCache::new(512, 8, Arc::clone(&log), false, 2);
        cache.register_file(Arc::new(PageFile::in_memory(FILE, "t", 512)));

        let lsn = log
            .append(&WalRecord::Update {
                txid: TransactionId::new(1),
                prev_lsn: Lsn::ZERO,
                delta: PageDelta {
                    file: FILE,
                    pgno: 2,
                    page_lsn: Lsn::ZERO,
                    offset: 16,
                    before: vec![0],
                    after: vec![3],
                },
            })
            .unwrap();
        {
            let page = cache.fetch(key(2), FetchMode::Create).unwrap();
            page.mark_dirty(lsn);
            let mut p = page.write();
            p.init(PageType::Leaf, 0);
            p.set_lsn(lsn);
        }
        assert!(log.flushed_lsn() <= lsn);
        assert!(cache.flush_page(key(2)).unwrap());
        assert!(log.flushed_lsn() > lsn);
        assert!(cache.dirty_pages().is_empty());
    }

    #[test]
    fn flush_dirty_before_respects_threshold() {
        let cache = cache(8);
        for (pgno, lsn) in [(1, Lsn::new(1, 20)), (2, Lsn::new(1, 90))] {
            let page = cache.fetch(key(pgno), FetchMode::Create).unwrap();
            page.mark_dirty(lsn);
        }
        assert_eq!(cache.flush_dirty_before(Lsn::new(1, 50)).unwrap(), 1);
        assert_eq!(cache.dirty_pages(), vec![(key(2), Lsn::new(1, 90))]);
    }

    #[test]
    fn release_marks_dirty() {
        let cache = cache(8);
        let page = cache.fetch(key(4), FetchMode::Create).unwrap();
        cache.release(page, true);
        assert_eq!(cache.stats().dirty_pages, 1);
        assert_eq!(cache.pinned_count(), 0);
    }

    #[test]
    fn checksum_failure_on_read() {
        let file = Arc::new(PageFile::in_memory(FILE, "t", 512));
        let mut bad = Page::new(512);
        bad.init(PageType::Leaf, 0);
        bad.seal(1);
        bad.as_bytes_mut()[100] = 7;
        file.write_page(1, &bad).unwrap();

        let log = Arc::new(LogManager::in_memory(1 << 20, 1 << 16));
        let cache = PageCache::new(512, 8, log, false, 2);
        cache.register_file(file);
        let err = cache.fetch(key(1), FetchMode::Existing).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn failed_eviction_keeps_the_victim() {
        let cache = cache(2);
        write_tag(&cache, 1, 11);
        write_tag(&cache, 2, 22);

        failpoint::enable("cache.write_page");
        let err = cache.fetch(key(3), FetchMode::Create);
        failpoint::disable("cache.write_page");
        assert!(err.is_err());
        assert_eq!(cache.pinned_count(), 0);
        assert_eq!(cache.dirty_pages().len(), 2);

        drop(cache.fetch(key(3), FetchMode::Create).unwrap());
        for (pgno, tag) in [(1, 11), (2, 22)] {
            let page = cache.fetch(key(pgno), FetchMode::Existing).unwrap();
            assert_eq!(page.read().body(), &[tag]);
        }
    }

    #[test]
    fn concurrent_misses_and_evictions_keep_pages_intact() {
        let cache = cache(8);
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let cache = &cache;
                s.spawn(move || {
                    let pages = t * 16..t * 16 + 16;
                    for pgno in pages.clone() {
                        write_tag(cache, pgno, pgno as u8);
                    }
                    for _ in 0..4 {
                        for pgno in pages.clone() {
                            let page = cache.fetch(key(pgno), FetchMode::Existing).unwrap();
                            assert_eq!(page.read().body(), &[pgno as u8]);
                        }
                    }
                });
            }
        });
        assert_eq!(cache.pinned_count(), 0);
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn discard_file_drops_pages() {
        let cache = cache(8);
        write_tag(&cache, 1, 1);
        cache.discard_file(FILE).unwrap();
        assert!(cache.dirty_pages().is_empty());
        assert!(cache.file(FILE).is_none());
    }
}
