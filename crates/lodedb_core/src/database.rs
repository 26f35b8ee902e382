//! Database handles.

use crate::btree::{self, tree, Cursor, DbStat, KeyValuePair, TreeCtx, VerifyReport};
use crate::error::{CoreError, CoreResult};
use crate::transaction::{Transaction, TransactionManager};
use crate::types::FileId;
use parking_lot::Mutex;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Registry entry of one database file, shared by all of its handles.
#[derive(Debug)]
pub(crate) struct FileEntry {
    pub id: FileId,
    pub name: Mutex<String>,
    pub page_size: usize,
    pub handles: AtomicUsize,
}

impl FileEntry {
    pub fn new(id: FileId, name: &str, page_size: usize) -> Self {
        Self {
            id,
            name: Mutex::new(name.to_string()),
            page_size,
            handles: AtomicUsize::new(0),
        }
    }
}

/// An open database: one B+tree file of an [`crate::Environment`].
///
/// A handle is shared freely between threads and never owns
/// transactions; every operation runs under the transaction passed in.
/// Handles opened before a replication rollback fail with `HandleDead`.
///
/// # Example
///
/// ```rust,ignore
/// let env = Environment::open_in_memory(EnvConfig::default())?;
/// let db = env.open_database("accounts", DbConfig::new().create(true))?;
///
/// let mut txn = env.begin(TxnOptions::default())?;
/// db.put(&mut txn, b"alice", b"100")?;
/// env.commit(&mut txn)?;
/// ```
pub struct Database {
    entry: Arc<FileEntry>,
    mgr: Arc<TransactionManager>,
    read_only: bool,
    epoch: u64,
    closed: AtomicBool,
}

impl Database {
    pub(crate) fn new(
        entry: Arc<FileEntry>,
        mgr: Arc<TransactionManager>,
        read_only: bool,
        epoch: u64,
    ) -> Self {
        entry.handles.fetch_add(1, Ordering::SeqCst);
        Self {
            entry,
            mgr,
            read_only,
            epoch,
            closed: AtomicBool::new(false),
        }
    }

    /// Name of the database.
    #[must_use]
    pub fn name(&self) -> String {
        self.entry.name.lock().clone()
    }

    /// File id in the environment.
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.entry.id
    }

    /// Page size of the file.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.entry.page_size
    }

    /// Whether writes through this handle are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Largest key accepted by `put`.
    #[must_use]
    pub fn max_key_len(&self) -> usize {
        (self.entry.page_size - crate::page::PAGE_HEADER_SIZE) / 8
    }

    fn check_handle(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::HandleClosed);
        }
        let health = self.mgr.health();
        health.check_usable()?;
        health.check_epoch(self.epoch)
    }

    /// Runs one tree operation under `txn`.
    pub(crate) fn run<T>(
        &self,
        txn: &mut Transaction,
        write: bool,
        op: impl FnOnce(&mut TreeCtx<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.check_handle()?;
        if !Arc::ptr_eq(txn.manager(), &self.mgr) {
            return Err(CoreError::invalid_argument(
                "transaction belongs to another environment",
            ));
        }
        txn.ensure_active()?;
        self.mgr.health().check_epoch(txn.epoch())?;
        if write && self.read_only {
            return Err(CoreError::invalid_operation(format!(
                "database {} is open read-only",
                self.name()
            )));
        }

        let savepoint = txn.last_lsn();
        let logged = txn.log_record_count();
        let mut ctx = TreeCtx::new(txn, self.entry.id, self.entry.page_size);
        let result = op(&mut ctx);
        ctx.finish();
        if let Err(e) = &result {
            self.mgr.health().note(e);
            // A failed operation may have logged part of a split or merge.
            if txn.log_record_count() != logged {
                if let Err(undo) = self.mgr.rollback_to(txn, savepoint) {
                    tracing::error!(txid = %txn.id(), error = %undo, "rollback of failed operation failed");
                }
            }
        }
        result
    }

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Lock conflicts (`Deadlock`, `LockTimeout`, `LockNotGranted`),
    /// handle errors and I/O errors.
    pub fn get(&self, txn: &mut Transaction, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.run(txn, false, |ctx| tree::get(ctx, key))
    }

    /// True if `key` exists.
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn exists(&self, txn: &mut Transaction, key: &[u8]) -> CoreResult<bool> {
        Ok(self.get(txn, key)?.is_some())
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// After an error other than `InvalidArgument` the transaction should
    /// be aborted; a structural change may be half done in its view.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an oversized key, the write gate's error on a
    /// replication client, lock conflicts, `UpdateConflict` for snapshot
    /// transactions, and I/O errors.
    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.run(txn, true, |ctx| tree::put(ctx, key, value, true))
            .map(|_| ())
    }

    /// Stores `value` under a key that must not exist yet.
    ///
    /// # Errors
    ///
    /// `KeyExists` if it does, otherwise as [`Database::put`].
    pub fn put_no_overwrite(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.run(txn, true, |ctx| tree::put(ctx, key, value, false))
            .map(|_| ())
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if it does not exist, otherwise as [`Database::put`].
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> CoreResult<()> {
        self.run(txn, true, |ctx| tree::delete(ctx, key))
    }

    /// Records whose keys fall in `range`, in key order.
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn range<'k>(
        &self,
        txn: &mut Transaction,
        range: impl RangeBounds<&'k [u8]>,
    ) -> CoreResult<Vec<KeyValuePair>> {
        let start: Bound<&[u8]> = range.start_bound().cloned();
        let end: Bound<&[u8]> = range.end_bound().cloned();
        self.run(txn, false, |ctx| tree::range(ctx, start, end))
    }

    /// Every record in key order.
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn dump(&self, txn: &mut Transaction) -> CoreResult<Vec<KeyValuePair>> {
        self.run(txn, false, |ctx| {
            tree::range(ctx, Bound::Unbounded, Bound::Unbounded)
        })
    }

    /// Removes every record and returns how many there were.
    ///
    /// Takes an exclusive lock on the whole database.
    ///
    /// # Errors
    ///
    /// As [`Database::put`].
    pub fn truncate(&self, txn: &mut Transaction) -> CoreResult<u64> {
        self.run(txn, true, tree::truncate)
    }

    /// Opens a cursor positioned before the first record.
    #[must_use]
    pub fn cursor<'a>(&'a self, txn: &'a mut Transaction) -> Cursor<'a> {
        Cursor::new(self, txn)
    }

    /// Page and record counts of the tree.
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn stat(&self, txn: &mut Transaction) -> CoreResult<DbStat> {
        self.run(txn, false, btree::stat)
    }

    /// Checks the structure of the tree. Problems are listed in the
    /// report; only failures to read at all are errors.
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn verify(&self, txn: &mut Transaction) -> CoreResult<VerifyReport> {
        self.run(txn, false, btree::verify)
    }

    /// Flushes the log and writes this database's dirty pages to its
    /// file.
    ///
    /// # Errors
    ///
    /// Log and page I/O errors.
    pub fn sync(&self) -> CoreResult<()> {
        self.check_handle()?;
        self.mgr.log().flush_all()?;
        let cache = self.mgr.cache();
        for (key, _) in cache.dirty_pages() {
            if key.file == self.entry.id {
                cache.flush_page(key)?;
            }
        }
        if let Some(file) = cache.file(self.entry.id) {
            file.sync()?;
        }
        Ok(())
    }

    /// Closes the handle. Further calls fail with `HandleClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.entry.handles.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(db = %self.name(), "database closed");
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("file", &self.entry.id)
            .field("read_only", &self.read_only)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
