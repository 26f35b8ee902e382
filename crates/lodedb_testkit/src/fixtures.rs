//! Environment fixtures.
//!
//! [`TestEnv`] owns an environment plus, for on-disk environments, the
//! temporary directory holding it, so the directory outlives every reopen.

use lodedb_core::{DbConfig, EnvConfig, Environment, KeyValuePair, TxnOptions};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Configuration used by fixtures unless told otherwise: small pages so
/// modest workloads build multi-level trees.
pub fn test_config() -> EnvConfig {
    EnvConfig::new().page_size(1024).cache_pages(128)
}

/// A test environment with automatic cleanup.
pub struct TestEnv {
    env: Arc<Environment>,
    config: EnvConfig,
    dir: Option<TempDir>,
}

impl TestEnv {
    /// Opens an in-memory environment.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Opens an in-memory environment with `config`.
    pub fn memory_with(config: EnvConfig) -> Self {
        let env = Environment::open_in_memory(config)
            .expect("Failed to open in-memory environment");
        Self {
            env,
            config,
            dir: None,
        }
    }

    /// Opens an environment in a fresh temporary directory.
    pub fn on_disk() -> Self {
        Self::on_disk_with(test_config())
    }

    /// Opens an environment in a fresh temporary directory with `config`.
    pub fn on_disk_with(config: EnvConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let env = Environment::open(dir.path(), config)
            .expect("Failed to open environment");
        Self {
            env,
            config,
            dir: Some(dir),
        }
    }

    /// The environment.
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// The environment directory, `None` in memory.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// The configuration the environment was opened with.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Closes cleanly and opens the directory again.
    pub fn reopen(&mut self) {
        self.env.close().expect("Failed to close environment");
        self.open_again(self.config);
    }

    /// Drops the environment without flushing anything and opens the
    /// directory again, running recovery.
    pub fn crash_and_reopen(&mut self) {
        self.env.crash();
        self.open_again(self.config);
    }

    /// Like [`TestEnv::crash_and_reopen`], with a different configuration
    /// for the recovering open.
    pub fn crash_and_reopen_with(&mut self, config: EnvConfig) {
        self.env.crash();
        self.config = config;
        self.open_again(config);
    }

    fn open_again(&mut self, config: EnvConfig) {
        let path = self
            .path()
            .expect("In-memory environments cannot be reopened")
            .to_path_buf();
        // The directory lock goes with the last handle.
        let placeholder = Environment::open_in_memory(test_config())
            .expect("Failed to open placeholder environment");
        drop(std::mem::replace(&mut self.env, placeholder));
        self.env = Environment::open(&path, config).expect("Failed to reopen environment");
    }

    /// Writes `value` under the big-endian encoding of every number in
    /// `keys`, creating the database if needed, in one transaction.
    pub fn fill(&self, db: &str, keys: Range<u32>, value: &[u8]) {
        let handle = self
            .env
            .open_database(db, DbConfig::new().create(true))
            .expect("Failed to open database");
        let mut txn = self.env.begin(TxnOptions::new()).expect("Failed to begin");
        for i in keys {
            handle
                .put(&mut txn, &i.to_be_bytes(), value)
                .expect("Failed to put");
        }
        self.env.commit(&mut txn).expect("Failed to commit");
    }

    /// Every record of `db` in key order, after checking its structure.
    pub fn contents(&self, db: &str) -> Vec<KeyValuePair> {
        let handle = self
            .env
            .open_database(db, DbConfig::new())
            .expect("Failed to open database");
        let mut txn = self.env.begin(TxnOptions::new()).expect("Failed to begin");
        let all = handle.dump(&mut txn).expect("Failed to dump");
        let report = handle.verify(&mut txn).expect("Failed to verify");
        assert!(report.is_ok(), "{db} is damaged: {:?}", report.problems);
        self.env.commit(&mut txn).expect("Failed to commit");
        all
    }
}

impl std::ops::Deref for TestEnv {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

/// Runs a test against a temporary in-memory environment.
///
/// # Example
///
/// ```rust,ignore
/// use lodedb_testkit::with_memory_env;
///
/// #[test]
/// fn my_test() {
///     with_memory_env(|env| {
///         let db = env.open_database("kv", DbConfig::new().create(true)).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_memory_env<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Environment>) -> R,
{
    let test_env = TestEnv::memory();
    f(test_env.env())
}

/// Runs a test against an environment in a temporary directory.
pub fn with_disk_env<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Environment>, &Path) -> R,
{
    let test_env = TestEnv::on_disk();
    let path = test_env.path().expect("On-disk environment has a path");
    f(test_env.env(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_env_round_trip() {
        let env = TestEnv::memory();
        env.fill("kv", 0..50, b"v");
        assert_eq!(env.contents("kv").len(), 50);
        assert!(env.path().is_none());
    }

    #[test]
    fn reopen_keeps_data() {
        let mut env = TestEnv::on_disk();
        env.fill("kv", 0..200, b"v");
        let id = env.env_id();
        env.reopen();
        assert_eq!(env.env_id(), id);
        assert_eq!(env.contents("kv").len(), 200);
    }

    #[test]
    fn crash_and_reopen_recovers() {
        let mut env = TestEnv::on_disk();
        env.fill("kv", 0..200, b"v");
        env.crash_and_reopen();
        assert_eq!(env.contents("kv").len(), 200);
        assert!(env.recovery_report().records_scanned > 0);
    }

    #[test]
    fn helpers_hand_out_environments() {
        with_memory_env(|env| assert!(env.path().is_none()));
        with_disk_env(|env, path| assert_eq!(env.path(), Some(path)));
    }
}
