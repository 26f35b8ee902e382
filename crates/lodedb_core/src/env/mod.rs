//! The environment: one directory, one log, one cache and lock manager
//! shared by every database in it.

pub mod dir;
pub mod meta;
mod replica;

pub use replica::{AppliedRecord, LogShipper};

use crate::btree::{Leaf, MetaPage, Node, META_PGNO, ROOT_PGNO};
use crate::cache::{PageCache, PageFile};
use crate::config::{DbConfig, EnvConfig, TxnOptions};
use crate::database::{Database, FileEntry};
use crate::error::{CoreError, CoreResult};
use crate::health::{EnvHealth, WriteGate};
use crate::lock::LockManager;
use crate::page::Page;
use crate::recovery::{recover, RecoveryReport};
use crate::stats::EnvStats;
use crate::transaction::{CheckpointInfo, CommitInfo, Transaction, TransactionManager};
use crate::types::{FileId, Lsn};
use crate::wal::{LogManager, WalRecord};
use dir::EnvDir;
use meta::EnvMeta;
use parking_lot::{Mutex, RwLock};
use replica::ReplicaState;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const MAX_DB_NAME: usize = 255;

/// An open environment.
///
/// Exactly one `Environment` may hold a directory at a time (the `LOCK`
/// file); share it between threads as `Arc<Environment>`. Recovery runs
/// inside [`Environment::open`], so a successfully opened environment is
/// consistent.
///
/// # Example
///
/// ```rust,ignore
/// use lodedb_core::{DbConfig, EnvConfig, Environment, TxnOptions};
///
/// let env = Environment::open(Path::new("data"), EnvConfig::default())?;
/// let db = env.open_database("users", DbConfig::new().create(true))?;
///
/// let mut txn = env.begin(TxnOptions::default())?;
/// db.put(&mut txn, b"k", b"v")?;
/// env.commit(&mut txn)?;
/// env.close()?;
/// ```
pub struct Environment {
    config: EnvConfig,
    dir: Option<EnvDir>,
    meta: Mutex<EnvMeta>,
    page_size: usize,
    log: Arc<LogManager>,
    cache: Arc<PageCache>,
    locks: Arc<LockManager>,
    health: Arc<EnvHealth>,
    txns: Arc<TransactionManager>,
    files: Mutex<HashMap<String, Arc<FileEntry>>>,
    shipper: RwLock<Option<Arc<dyn LogShipper>>>,
    replica: Mutex<ReplicaState>,
    checkpoint_mark: AtomicU64,
    last_commit: AtomicU64,
    recovery: RecoveryReport,
}

impl Environment {
    /// Opens (or creates) the environment in `path` and runs recovery.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a bad configuration, a missing directory
    ///   without `create_if_missing`, or an existing one with
    ///   `error_if_exists`
    /// - `EnvironmentLocked` if another process holds the directory
    /// - `LogCorruption`, `ChecksumMismatch` and I/O errors from recovery
    pub fn open(path: &Path, config: EnvConfig) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let dir = EnvDir::open(path, config.create_if_missing)?;
        let meta = match dir.load_meta()? {
            Some(meta) => {
                if config.error_if_exists {
                    return Err(CoreError::invalid_argument(format!(
                        "environment already exists: {}",
                        path.display()
                    )));
                }
                meta
            }
            None => {
                if !config.create_if_missing {
                    return Err(CoreError::invalid_argument(format!(
                        "no environment in {}",
                        path.display()
                    )));
                }
                let meta = EnvMeta::new(config.page_size);
                dir.save_meta(&meta)?;
                meta
            }
        };
        let log = LogManager::open(dir.path(), config.max_log_file_size, config.log_buffer_size)?;
        Self::assemble(config, Some(dir), meta, log)
    }

    /// Opens an environment that lives only in memory.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad configuration.
    pub fn open_in_memory(config: EnvConfig) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let meta = EnvMeta::new(config.page_size);
        let log = LogManager::in_memory(config.max_log_file_size, config.log_buffer_size);
        Self::assemble(config, None, meta, log)
    }

    fn assemble(
        config: EnvConfig,
        dir: Option<EnvDir>,
        meta: EnvMeta,
        log: LogManager,
    ) -> CoreResult<Arc<Self>> {
        let page_size = meta.page_size as usize;
        let log = Arc::new(log);
        let health = Arc::new(EnvHealth::new(meta.epoch));
        let cache = Arc::new(PageCache::new(
            page_size,
            config.cache_pages,
            Arc::clone(&log),
            config.multiversion,
            config.io_retries,
        ));
        let locks = Arc::new(LockManager::new(config.lock_timeout, config.deadlock_interval));

        let mut files = HashMap::new();
        for (name, &id) in &meta.files {
            if let Some(dir) = &dir {
                let file = PageFile::open(id, name, &dir.db_path(name), page_size)?;
                cache.register_file(Arc::new(file));
            }
            files.insert(name.clone(), Arc::new(FileEntry::new(id, name, page_size)));
        }

        let recovery = recover(&log, &cache, config.recovery, meta.last_checkpoint)?;
        let txns = Arc::new(TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&cache),
            Arc::clone(&locks),
            Arc::clone(&health),
            config.sync_on_commit,
            recovery.next_txid,
        ));

        let env = Self {
            config,
            dir,
            meta: Mutex::new(meta),
            page_size,
            log,
            cache,
            locks,
            health,
            txns,
            files: Mutex::new(files),
            shipper: RwLock::new(None),
            replica: Mutex::new(ReplicaState::default()),
            checkpoint_mark: AtomicU64::new(0),
            last_commit: AtomicU64::new(0),
            recovery,
        };
        env.last_commit
            .store(env.scan_commit_lsns()?.last().map_or(0, |l| l.to_u64()), Ordering::SeqCst);
        env.checkpoint()?;
        tracing::info!(
            path = ?env.path(),
            page_size,
            databases = env.meta.lock().files.len(),
            rolled_back = env.recovery.rolled_back.len(),
            end = %env.log.end_lsn(),
            "environment opened"
        );
        Ok(Arc::new(env))
    }

    /// Directory of an on-disk environment.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(EnvDir::path)
    }

    /// Configuration the environment was opened with.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Page size of every database.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Identity fixed when the environment was created.
    #[must_use]
    pub fn env_id(&self) -> Uuid {
        self.meta.lock().env_id
    }

    /// Current handle epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.health.epoch()
    }

    /// What recovery did when the environment was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Shared health record (poison state, write gate, epoch).
    #[must_use]
    pub fn health(&self) -> &Arc<EnvHealth> {
        &self.health
    }

    /// The write-ahead log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Sets whether local writes are accepted.
    pub fn set_write_gate(&self, gate: WriteGate) {
        self.health.set_gate(gate);
    }

    /// Current write gate.
    #[must_use]
    pub fn write_gate(&self) -> WriteGate {
        self.health.gate()
    }

    fn save_meta(&self, meta: &EnvMeta) -> CoreResult<()> {
        match &self.dir {
            Some(dir) => dir.save_meta(meta),
            None => Ok(()),
        }
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// `HandleClosed`, `RunRecovery`, or `InvalidArgument` for snapshot
    /// isolation without [`EnvConfig::multiversion`].
    pub fn begin(&self, options: TxnOptions) -> CoreResult<Transaction> {
        self.txns.begin(options)
    }

    /// Commits a transaction. Returns once its commit record is durable
    /// (for syncing commits) and, on a replication master, once the
    /// acknowledgement policy is settled.
    ///
    /// # Errors
    ///
    /// `TransactionClosed`, `HandleDead`, and fatal log errors.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<CommitInfo> {
        let mut info = self.txns.commit(txn)?;
        if info.lsn.is_zero() {
            return Ok(info);
        }
        self.last_commit.fetch_max(info.lsn.to_u64(), Ordering::SeqCst);
        let shipper = self.shipper.read().clone();
        if let Some(shipper) = shipper {
            info.replication = shipper.on_commit(info.lsn);
        }
        self.maybe_checkpoint();
        Ok(info)
    }

    /// Aborts a transaction.
    ///
    /// # Errors
    ///
    /// `TransactionClosed` for a finished transaction, fatal errors if undo
    /// fails.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        self.txns.abort(txn)
    }

    fn maybe_checkpoint(&self) {
        let every = self.config.checkpoint_log_bytes;
        if every == 0 {
            return;
        }
        let written = self.log.stats().bytes();
        if written.saturating_sub(self.checkpoint_mark.load(Ordering::SeqCst)) < every {
            return;
        }
        if let Err(e) = self.checkpoint() {
            tracing::warn!(error = %e, "automatic checkpoint failed");
        }
    }

    /// Takes a checkpoint and records it in the environment metadata.
    /// With `log_auto_remove` set, log files no longer needed are removed.
    ///
    /// # Errors
    ///
    /// `RunRecovery`, the write gate's error on a replication client, and
    /// log or page I/O errors.
    pub fn checkpoint(&self) -> CoreResult<CheckpointInfo> {
        self.health.check_writable()?;
        let info = self.txns.checkpoint()?;
        {
            let mut meta = self.meta.lock();
            meta.last_checkpoint = info.lsn;
            self.save_meta(&meta)?;
        }
        self.checkpoint_mark
            .store(self.log.stats().bytes(), Ordering::SeqCst);
        if self.config.log_auto_remove {
            self.log.remove_files_before(info.oldest_needed)?;
        }
        Ok(info)
    }

    /// Removes log files that hold only records older than everything
    /// recovery could still need. Returns the removed file numbers.
    ///
    /// # Errors
    ///
    /// Log read errors and I/O errors.
    pub fn archive(&self) -> CoreResult<Vec<u32>> {
        self.health.check_usable()?;
        let checkpoint = self.meta.lock().last_checkpoint;
        if checkpoint.is_zero() {
            return Ok(Vec::new());
        }
        let redo_lsn = match self.log.read_record(checkpoint)?.0 {
            WalRecord::Checkpoint { redo_lsn, .. } => redo_lsn,
            other => {
                return Err(CoreError::log_corruption(
                    checkpoint,
                    format!("expected checkpoint record, found {:?}", other.record_type()),
                ))
            }
        };
        let keep_from = self
            .txns
            .active_transactions()
            .iter()
            .map(|a| a.first_lsn)
            .fold(redo_lsn.min(checkpoint), Lsn::min);
        self.log.remove_files_before(keep_from)
    }

    fn check_name(name: &str) -> CoreResult<()> {
        let bad = name.is_empty()
            || name.len() > MAX_DB_NAME
            || name.starts_with('.')
            || name.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
        if bad {
            return Err(CoreError::invalid_argument(format!(
                "invalid database name: {name:?}"
            )));
        }
        Ok(())
    }

    /// Opens a database, creating it if `config.create` allows.
    ///
    /// # Errors
    ///
    /// - `DatabaseNotFound` if it does not exist and may not be created
    /// - `DatabaseExists` with `exclusive_create` for an existing one
    /// - `InvalidArgument` for a bad name
    pub fn open_database(&self, name: &str, config: DbConfig) -> CoreResult<Database> {
        self.health.check_usable()?;
        Self::check_name(name)?;
        let mut files = self.files.lock();
        let entry = match files.get(name) {
            Some(entry) => {
                if config.exclusive_create {
                    return Err(CoreError::DatabaseExists {
                        name: name.to_string(),
                    });
                }
                Arc::clone(entry)
            }
            None => {
                if !config.create || config.read_only {
                    return Err(CoreError::DatabaseNotFound {
                        name: name.to_string(),
                    });
                }
                let entry = self.create_file(name)?;
                files.insert(name.to_string(), Arc::clone(&entry));
                entry
            }
        };
        tracing::debug!(db = name, file = %entry.id, read_only = config.read_only, "database opened");
        Ok(Database::new(
            entry,
            Arc::clone(&self.txns),
            config.read_only,
            self.health.epoch(),
        ))
    }

    /// Creates the file of a new database with its metadata page and an
    /// empty root leaf, then registers it.
    fn create_file(&self, name: &str) -> CoreResult<Arc<FileEntry>> {
        let mut meta = self.meta.lock();
        let id = meta.register(name);
        let result = self.init_file(id, name).and_then(|()| self.save_meta(&meta));
        if let Err(e) = result {
            meta.files.remove(name);
            if let Err(discard) = self.cache.discard_file(id) {
                tracing::warn!(db = name, file = %id, error = %discard, "discarding half-created file failed");
            }
            return Err(e);
        }
        tracing::info!(db = name, file = %id, "database created");
        Ok(Arc::new(FileEntry::new(id, name, self.page_size)))
    }

    fn init_file(&self, id: FileId, name: &str) -> CoreResult<()> {
        let file = match &self.dir {
            Some(dir) => PageFile::create(id, name, &dir.db_path(name), self.page_size)?,
            None => PageFile::in_memory(id, name, self.page_size),
        };
        let mut page = Page::new(self.page_size);
        MetaPage::new(self.page_size).encode_into(&mut page)?;
        page.seal(META_PGNO);
        file.write_page(META_PGNO, &page)?;

        let mut page = Page::new(self.page_size);
        Node::Leaf(Leaf::default()).encode_into(&mut page)?;
        page.seal(ROOT_PGNO);
        file.write_page(ROOT_PGNO, &page)?;
        file.sync()?;
        if let Some(dir) = &self.dir {
            self::dir::sync_directory(dir.path())?;
        }
        self.cache.register_file(Arc::new(file));
        Ok(())
    }

    fn quiesced(&self, what: &str, entry: &FileEntry) -> CoreResult<()> {
        if entry.handles.load(Ordering::SeqCst) > 0 {
            return Err(CoreError::invalid_operation(format!(
                "cannot {what} database {}: it has open handles",
                entry.name.lock()
            )));
        }
        if self.txns.active_count() > 0 {
            return Err(CoreError::invalid_operation(format!(
                "cannot {what} a database while transactions are running"
            )));
        }
        Ok(())
    }

    /// Deletes a database and its file.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound`, or `InvalidOperation` while the database has
    /// open handles or any transaction is running.
    pub fn remove_database(&self, name: &str) -> CoreResult<()> {
        self.health.check_usable()?;
        let mut files = self.files.lock();
        let entry = files.get(name).cloned().ok_or_else(|| CoreError::DatabaseNotFound {
            name: name.to_string(),
        })?;
        self.quiesced("remove", &entry)?;

        {
            let mut meta = self.meta.lock();
            meta.files.remove(name);
            self.save_meta(&meta)?;
        }
        files.remove(name);
        self.cache.discard_file(entry.id)?;
        if let Some(dir) = &self.dir {
            dir.remove_db_file(name)?;
        }
        tracing::info!(db = name, file = %entry.id, "database removed");
        Ok(())
    }

    /// Renames a database.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound`, `DatabaseExists` if `to` is taken, and
    /// `InvalidOperation` as for [`Environment::remove_database`].
    pub fn rename_database(&self, from: &str, to: &str) -> CoreResult<()> {
        self.health.check_usable()?;
        Self::check_name(to)?;
        let mut files = self.files.lock();
        let entry = files.get(from).cloned().ok_or_else(|| CoreError::DatabaseNotFound {
            name: from.to_string(),
        })?;
        if files.contains_key(to) {
            return Err(CoreError::DatabaseExists {
                name: to.to_string(),
            });
        }
        self.quiesced("rename", &entry)?;

        if let Some(dir) = &self.dir {
            self.log.flush_all()?;
            for (key, _) in self.cache.dirty_pages() {
                if key.file == entry.id {
                    self.cache.flush_page(key)?;
                }
            }
            self.cache.discard_file(entry.id)?;
            dir.rename_db_file(from, to)?;
            let file = PageFile::open(entry.id, to, &dir.db_path(to), self.page_size)?;
            self.cache.register_file(Arc::new(file));
        }
        {
            let mut meta = self.meta.lock();
            meta.files.remove(from);
            meta.files.insert(to.to_string(), entry.id);
            self.save_meta(&meta)?;
        }
        files.remove(from);
        *entry.name.lock() = to.to_string();
        files.insert(to.to_string(), entry);
        tracing::info!(from, to, "database renamed");
        Ok(())
    }

    /// Names of all databases, sorted.
    #[must_use]
    pub fn list_databases(&self) -> Vec<String> {
        self.meta.lock().files.keys().cloned().collect()
    }

    /// Log, cache, lock and transaction statistics.
    #[must_use]
    pub fn stats(&self) -> EnvStats {
        EnvStats {
            log: self.log.stats().snapshot(),
            cache: self.cache.stats(),
            locks: self.locks.stats(),
            txns: self.txns.stats(),
        }
    }

    /// Number of running transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.txns.active_count()
    }

    /// Checkpoints (masters and standalone environments) or writes back
    /// dirty pages (replication clients), then refuses further use.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Log and page I/O errors; the environment is closed regardless.
    pub fn close(&self) -> CoreResult<()> {
        if self.health.is_closed() {
            return Ok(());
        }
        let result = if self.health.is_poisoned() {
            Ok(())
        } else if self.health.check_writable().is_ok() {
            self.checkpoint().map(|_| ())
        } else {
            self.log
                .flush_all()
                .and_then(|()| self.cache.flush_all().map(|_| ()))
        };
        self.health.close();
        tracing::info!(path = ?self.path(), "environment closed");
        result
    }

    /// Closes the environment without writing anything: buffered log
    /// records and dirty pages are lost, as in a process crash. The
    /// directory lock is released once the last `Arc` is dropped.
    #[doc(hidden)]
    pub fn crash(&self) {
        self.health.close();
        tracing::warn!(path = ?self.path(), "environment crashed on request");
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path())
            .field("page_size", &self.page_size)
            .field("epoch", &self.health.epoch())
            .field("gate", &self.health.gate())
            .finish_non_exhaustive()
    }
}
