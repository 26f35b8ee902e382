//! Per-operation tree context: page locks, versioned reads and logged page
//! changes on behalf of one transaction.

use crate::btree::meta::{MetaPage, META_PGNO};
use crate::btree::node::Node;
use crate::cache::{FetchMode, Visible};
use crate::config::IsolationLevel;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, LockResource};
use crate::page::{changed_range, Page, PageType};
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{FileId, PageKey, PageNo, TransactionId};
use crate::wal::{PageDelta, WalRecord};
use std::sync::Arc;

pub(crate) struct TreeCtx<'t> {
    txn: &'t mut Transaction,
    mgr: Arc<TransactionManager>,
    file: FileId,
    capacity: usize,
    early_release: Vec<LockResource>,
}

impl<'t> TreeCtx<'t> {
    pub fn new(txn: &'t mut Transaction, file: FileId, page_size: usize) -> Self {
        let mgr = Arc::clone(txn.manager());
        Self {
            txn,
            mgr,
            file,
            capacity: page_size - crate::page::PAGE_HEADER_SIZE,
            early_release: Vec::new(),
        }
    }

    pub fn txid(&self) -> TransactionId {
        self.txn.id()
    }

    /// Body bytes available in one page.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_key(&self) -> usize {
        self.capacity / 8
    }

    /// Largest leaf entry kept inline.
    pub fn max_inline(&self) -> usize {
        self.capacity / 4
    }

    fn key(&self, pgno: PageNo) -> PageKey {
        PageKey::new(self.file, pgno)
    }

    fn is_snapshot(&self) -> bool {
        self.txn.snapshot().is_some()
    }

    /// Fails unless writes are currently allowed.
    pub fn check_writable(&self) -> CoreResult<()> {
        self.mgr.health().check_writable()
    }

    pub fn lock_db(&mut self, mode: LockMode) -> CoreResult<()> {
        if mode.is_read() && self.is_snapshot() {
            return Ok(());
        }
        self.acquire(LockResource::Database(self.file), mode)
    }

    /// Locks a page for reading or writing. Snapshot transactions skip
    /// read locks.
    pub fn lock(&mut self, pgno: PageNo, mode: LockMode) -> CoreResult<()> {
        if mode.is_read() && self.is_snapshot() {
            return Ok(());
        }
        self.acquire(LockResource::Page(self.key(pgno)), mode)
    }

    /// Locks a page on a write path. Taken by every isolation level.
    pub fn lock_path(&mut self, pgno: PageNo, mode: LockMode) -> CoreResult<()> {
        self.acquire(LockResource::Page(self.key(pgno)), mode)
    }

    fn acquire(&mut self, resource: LockResource, mode: LockMode) -> CoreResult<()> {
        let wait = !self.txn.options().no_wait;
        self.mgr
            .locks()
            .acquire(self.txn.id(), resource, mode, wait)?;
        if mode.is_read() && self.txn.isolation() == IsolationLevel::ReadCommitted {
            self.early_release.push(resource);
        }
        Ok(())
    }

    /// Runs `f` on the image of a page this transaction should see.
    fn with_visible<T>(&self, pgno: PageNo, f: impl FnOnce(&Page) -> CoreResult<T>) -> CoreResult<T> {
        let key = self.key(pgno);
        let cache = self.mgr.cache();
        let pinned = cache.fetch(key, FetchMode::Existing)?;
        let page = pinned.read();
        if let Some(snapshot) = self.txn.snapshot() {
            if let Visible::Frozen(image) = cache.versions().visible(key, self.txn.id(), snapshot) {
                drop(page);
                return f(&image);
            }
        }
        f(&page)
    }

    fn with_current<T>(&self, pgno: PageNo, f: impl FnOnce(&Page) -> CoreResult<T>) -> CoreResult<T> {
        let pinned = self.mgr.cache().fetch(self.key(pgno), FetchMode::Existing)?;
        let page = pinned.read();
        f(&page)
    }

    /// Node as seen by this transaction's reads.
    pub fn read_node(&self, pgno: PageNo) -> CoreResult<Node> {
        let key = self.key(pgno);
        self.with_visible(pgno, |p| Node::decode(p, key))
    }

    /// Current node, for write paths.
    pub fn read_current(&self, pgno: PageNo) -> CoreResult<Node> {
        let key = self.key(pgno);
        self.with_current(pgno, |p| Node::decode(p, key))
    }

    /// Level of the current root image, read without a lock.
    pub fn peek_level(&self, pgno: PageNo) -> CoreResult<u8> {
        self.with_current(pgno, |p| Ok(p.level()))
    }

    /// Body and next pointer of an overflow page, as read by this
    /// transaction (`current` for write paths).
    pub fn read_overflow(&self, pgno: PageNo, current: bool) -> CoreResult<(Vec<u8>, PageNo)> {
        let key = self.key(pgno);
        let read = |p: &Page| {
            if p.page_type()? != PageType::Overflow {
                return Err(CoreError::invalid_format(format!(
                    "page {key} is not an overflow page"
                )));
            }
            Ok((p.body().to_vec(), p.next()))
        };
        if current {
            self.with_current(pgno, read)
        } else {
            self.with_visible(pgno, read)
        }
    }

    pub fn read_meta(&self) -> CoreResult<MetaPage> {
        self.with_current(META_PGNO, MetaPage::decode)
    }

    /// Type and `next` link of the current image of a page.
    pub fn page_header(&self, pgno: PageNo) -> CoreResult<(PageType, PageNo)> {
        self.with_current(pgno, |p| Ok((p.page_type()?, p.next())))
    }

    /// Verifies the checksum of the page's last written image, if any.
    pub fn check_on_disk(&self, pgno: PageNo) -> CoreResult<()> {
        let key = self.key(pgno);
        let Some(file) = self.mgr.cache().file(self.file) else {
            return Err(CoreError::invalid_argument(format!("{} is not open", self.file)));
        };
        match file.read_page(pgno)? {
            Some(page) => page.verify(key),
            None => Ok(()),
        }
    }

    /// Snapshot writers may only change leaves nobody committed to since
    /// their snapshot.
    pub fn check_conflict(&self, pgno: PageNo) -> CoreResult<()> {
        let Some(snapshot) = self.txn.snapshot() else {
            return Ok(());
        };
        let key = self.key(pgno);
        if self.mgr.cache().versions().changed_since(key, snapshot) {
            return Err(CoreError::UpdateConflict {
                txid: self.txn.id(),
                page: key,
            });
        }
        Ok(())
    }

    /// Applies `f` to a page and logs the changed byte range as an Update
    /// record of this transaction. The caller holds the page's Write lock.
    pub fn modify(
        &mut self,
        pgno: PageNo,
        mode: FetchMode,
        f: impl FnOnce(&mut Page) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let key = self.key(pgno);
        let cache = Arc::clone(self.mgr.cache());
        let pinned = cache.fetch(key, mode)?;
        let mut page = pinned.write();

        let mut after = page.clone();
        f(&mut after)?;
        let Some(range) = changed_range(page.as_bytes(), after.as_bytes()) else {
            return Ok(());
        };

        cache.versions().before_write(key, self.txn.id(), &page);
        pinned.mark_dirty(self.mgr.log().end_lsn());
        let record = WalRecord::Update {
            txid: self.txn.id(),
            prev_lsn: self.txn.last_lsn(),
            delta: PageDelta {
                file: self.file,
                pgno,
                page_lsn: page.lsn(),
                offset: range.start as u32,
                before: page.as_bytes()[range.clone()].to_vec(),
                after: after.as_bytes()[range.clone()].to_vec(),
            },
        };
        let lsn = self.mgr.append(self.txn, &record)?;
        page.as_bytes_mut()[range.clone()].copy_from_slice(&after.as_bytes()[range]);
        page.set_lsn(lsn);
        self.txn.note_dirty(key);
        Ok(())
    }

    pub fn write_node(&mut self, pgno: PageNo, node: &Node) -> CoreResult<()> {
        self.modify(pgno, FetchMode::Existing, |p| node.encode_into(p))
    }

    fn write_meta(&mut self, meta: &MetaPage) -> CoreResult<()> {
        self.modify(META_PGNO, FetchMode::Existing, |p| meta.encode_into(p))
    }

    /// Takes a page off the free list, or extends the file, and
    /// Write-locks it.
    fn take_page(&mut self) -> CoreResult<PageNo> {
        self.lock(META_PGNO, LockMode::Write)?;
        let mut meta = self.read_meta()?;
        let pgno = if meta.free_head != 0 {
            let pgno = meta.free_head;
            meta.free_head = self.with_current(pgno, |p| Ok(p.next()))?;
            pgno
        } else {
            meta.last_pgno += 1;
            meta.last_pgno
        };
        self.write_meta(&meta)?;
        self.lock(pgno, LockMode::Write)?;
        Ok(pgno)
    }

    /// Allocates a page initialized with `node`.
    pub fn allocate(&mut self, node: &Node) -> CoreResult<PageNo> {
        let pgno = self.take_page()?;
        self.modify(pgno, FetchMode::Create, |p| node.encode_into(p))?;
        Ok(pgno)
    }

    /// Allocates an overflow page holding `chunk`.
    pub fn allocate_overflow(&mut self, chunk: &[u8], next: PageNo) -> CoreResult<PageNo> {
        let pgno = self.take_page()?;
        self.modify(pgno, FetchMode::Create, |p| {
            p.init(PageType::Overflow, 0);
            p.set_body(chunk)?;
            p.set_next(next);
            Ok(())
        })?;
        Ok(pgno)
    }

    /// Puts a page on the free list.
    pub fn free(&mut self, pgno: PageNo) -> CoreResult<()> {
        self.lock(META_PGNO, LockMode::Write)?;
        self.lock(pgno, LockMode::Write)?;
        let mut meta = self.read_meta()?;
        let head = meta.free_head;
        self.modify(pgno, FetchMode::Existing, |p| {
            p.init(PageType::Free, 0);
            p.set_next(head);
            Ok(())
        })?;
        meta.free_head = pgno;
        self.write_meta(&meta)
    }

    /// Resets the metadata to an empty file: no free pages, nothing past
    /// the root.
    pub fn reset_allocation(&mut self) -> CoreResult<()> {
        self.lock(META_PGNO, LockMode::Write)?;
        let mut meta = self.read_meta()?;
        meta.last_pgno = crate::btree::meta::ROOT_PGNO;
        meta.free_head = 0;
        self.write_meta(&meta)
    }

    /// Ends the operation: read-committed transactions give their read
    /// locks back.
    pub fn finish(self) {
        let locks = self.mgr.locks();
        for resource in self.early_release {
            locks.release_read(self.txn.id(), resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::meta::ROOT_PGNO;
    use crate::btree::node::{Leaf, LeafEntry, Value};
    use crate::config::{DbConfig, EnvConfig, TxnOptions};
    use crate::env::Environment;

    fn entry(key: &[u8]) -> LeafEntry {
        LeafEntry {
            key: key.to_vec(),
            value: Value::Inline(b"v".to_vec()),
        }
    }

    #[test]
    fn logged_change_carries_entry_count_and_link() {
        let env = Environment::open_in_memory(EnvConfig::new().page_size(512)).unwrap();
        let db = env.open_database("kv", DbConfig::new().create(true)).unwrap();
        let mut txn = env.begin(TxnOptions::new()).unwrap();
        let leaf = Leaf {
            entries: vec![entry(b"a"), entry(b"b"), entry(b"c")],
            next: 7,
        };

        let mut ctx = TreeCtx::new(&mut txn, db.file_id(), db.page_size());
        ctx.write_node(ROOT_PGNO, &Node::Leaf(leaf.clone())).unwrap();
        assert_eq!(ctx.read_current(ROOT_PGNO).unwrap(), Node::Leaf(leaf.clone()));
        ctx.finish();

        // Replaying the logged bytes over the previous image rebuilds the node.
        let (record, _) = env.log().read_record(txn.last_lsn()).unwrap();
        let delta = record.delta().unwrap();
        let mut replayed = Page::new(512);
        Node::Leaf(Leaf::default()).encode_into(&mut replayed).unwrap();
        let start = delta.offset as usize;
        assert!(start <= 18);
        replayed.as_bytes_mut()[start..start + delta.after.len()].copy_from_slice(&delta.after);
        assert_eq!(replayed.entry_count(), 3);
        assert_eq!(replayed.next(), 7);
        let key = PageKey::new(db.file_id(), ROOT_PGNO);
        assert_eq!(Node::decode(&replayed, key).unwrap(), Node::Leaf(leaf));

        env.commit(&mut txn).unwrap();
    }
}
