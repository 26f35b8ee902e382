//! Crash recovery testing.
//!
//! A [`CrashingEnv`] commits a known baseline, runs one more transaction
//! with a failpoint armed at a chosen [`CrashPoint`], crashes the
//! environment and reopens it. The outcome reports whether the final
//! transaction survived, and [`CrashPoint::allows`] says which outcomes
//! are acceptable at that point.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lodedb_testkit::crash::{CrashPoint, CrashingEnv};
//!
//! let outcome = CrashingEnv::new().run(CrashPoint::BeforeCommitFlush);
//! assert!(outcome.is_acceptable());
//! ```

use crate::fixtures::{test_config, TestEnv};
use lodedb_core::{failpoint, DbConfig, EnvConfig, Transaction, TxnOptions};
use std::collections::BTreeMap;

const DB: &str = "crash";

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash while the transaction is still running; its records may have
    /// reached the log.
    MidTransaction,
    /// Commit record appended but never flushed.
    BeforeCommitFlush,
    /// Log write reached the file but the sync failed.
    DuringLogSync,
    /// Commit durable, page write-back failed.
    DuringPageWrite,
    /// Pages flushed, checkpoint record never written.
    BeforeCheckpointRecord,
    /// Commit durable, nothing else written.
    AfterCommit,
}

/// What recovery may do with the transaction interrupted by a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Must be gone.
    Lost,
    /// Must be present.
    Durable,
    /// Either, but all or nothing.
    Atomic,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::MidTransaction,
        CrashPoint::BeforeCommitFlush,
        CrashPoint::DuringLogSync,
        CrashPoint::DuringPageWrite,
        CrashPoint::BeforeCheckpointRecord,
        CrashPoint::AfterCommit,
    ];

    /// Engine failpoint armed for this crash point, if any.
    pub fn failpoint(self) -> Option<&'static str> {
        match self {
            CrashPoint::BeforeCommitFlush => Some("commit.before_flush"),
            CrashPoint::DuringLogSync => Some("log.sync"),
            CrashPoint::DuringPageWrite => Some("cache.write_page"),
            CrashPoint::BeforeCheckpointRecord => Some("checkpoint.before_record"),
            CrashPoint::MidTransaction | CrashPoint::AfterCommit => None,
        }
    }

    /// Acceptable fate of the interrupted transaction.
    pub fn allows(self) -> Expect {
        match self {
            CrashPoint::MidTransaction | CrashPoint::BeforeCommitFlush => Expect::Lost,
            CrashPoint::DuringLogSync => Expect::Atomic,
            CrashPoint::DuringPageWrite
            | CrashPoint::BeforeCheckpointRecord
            | CrashPoint::AfterCommit => Expect::Durable,
        }
    }
}

/// Result of one crash run.
#[derive(Debug, Clone)]
pub struct CrashOutcome {
    /// Where the crash happened.
    pub point: CrashPoint,
    /// The baseline survived unchanged.
    pub baseline_intact: bool,
    /// Keys of the final transaction found after recovery.
    pub survivors: usize,
    /// Keys the final transaction wrote.
    pub written: usize,
    /// Nothing besides the baseline and the survivors was recovered.
    pub verified: bool,
    /// Transactions recovery rolled back.
    pub rolled_back: usize,
}

impl CrashOutcome {
    /// True if the outcome is one the crash point allows.
    pub fn is_acceptable(&self) -> bool {
        let tail_ok = match self.point.allows() {
            Expect::Lost => self.survivors == 0,
            Expect::Durable => self.survivors == self.written,
            Expect::Atomic => self.survivors == 0 || self.survivors == self.written,
        };
        self.baseline_intact && self.verified && tail_ok
    }
}

/// Crash harness over an on-disk environment.
#[derive(Debug)]
pub struct CrashingEnv {
    config: EnvConfig,
    baseline: u32,
    tail: u32,
    value_len: usize,
}

impl Default for CrashingEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashingEnv {
    /// A harness with a 300 key baseline and a 200 key final transaction.
    pub fn new() -> Self {
        Self {
            config: test_config(),
            baseline: 300,
            tail: 200,
            value_len: 48,
        }
    }

    /// Uses `config` for every open.
    #[must_use]
    pub fn with_config(mut self, config: EnvConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how many keys the baseline and the final transaction write.
    #[must_use]
    pub fn with_sizes(mut self, baseline: u32, tail: u32) -> Self {
        self.baseline = baseline;
        self.tail = tail;
        self
    }

    /// Sets the value length; values longer than a page go to overflow
    /// pages.
    #[must_use]
    pub fn with_value_len(mut self, len: usize) -> Self {
        self.value_len = len;
        self
    }

    /// Runs one crash at `point` in a fresh directory.
    pub fn run(&self, point: CrashPoint) -> CrashOutcome {
        let mut env = TestEnv::on_disk_with(self.config);
        let base_value = vec![0xB0; self.value_len];
        let tail_value = vec![0x7A; self.value_len];
        env.fill(DB, 0..self.baseline, &base_value);

        let (written, txn) = self.interrupted_transaction(&env, point, &tail_value);

        // Dropping a live transaction aborts it; after the crash that
        // writes nothing.
        env.crash();
        drop(txn);
        env.crash_and_reopen();

        let contents: BTreeMap<Vec<u8>, Vec<u8>> = env.contents(DB).into_iter().collect();
        let baseline_intact = (0..self.baseline).all(|i| {
            contents.get(&i.to_be_bytes()[..]) == Some(&base_value)
        });
        let survivors = (self.baseline..self.baseline + written as u32)
            .filter(|i| contents.get(&i.to_be_bytes()[..]) == Some(&tail_value))
            .count();
        let verified = contents.len() == self.baseline as usize + survivors;

        CrashOutcome {
            point,
            baseline_intact,
            survivors,
            written,
            verified,
            rolled_back: env.recovery_report().rolled_back.len(),
        }
    }

    /// Runs every crash point and returns the outcomes.
    pub fn run_all(&self) -> Vec<CrashOutcome> {
        CrashPoint::ALL.iter().map(|&p| self.run(p)).collect()
    }

    /// Writes the final transaction and stops at `point`. Errors from the
    /// armed failpoint are expected and ignored.
    fn interrupted_transaction(
        &self,
        env: &TestEnv,
        point: CrashPoint,
        value: &[u8],
    ) -> (usize, Transaction) {
        let db = env
            .open_database(DB, DbConfig::new())
            .expect("Failed to open database");
        let mut txn = env.begin(TxnOptions::new()).expect("Failed to begin");
        let keys = self.baseline..self.baseline + self.tail;
        for i in keys.clone() {
            db.put(&mut txn, &i.to_be_bytes(), value)
                .expect("Failed to put");
        }

        match point {
            CrashPoint::MidTransaction => {
                let _ = env.log().flush_all();
                let _ = db.sync();
            }
            CrashPoint::BeforeCommitFlush | CrashPoint::DuringLogSync => {
                self.arm(point);
                let _ = env.commit(&mut txn);
            }
            CrashPoint::DuringPageWrite => {
                env.commit(&mut txn).expect("Failed to commit");
                self.arm(point);
                let _ = db.sync();
            }
            CrashPoint::BeforeCheckpointRecord => {
                env.commit(&mut txn).expect("Failed to commit");
                self.arm(point);
                let _ = env.checkpoint();
            }
            CrashPoint::AfterCommit => {
                env.commit(&mut txn).expect("Failed to commit");
            }
        }
        failpoint::clear();
        (keys.len(), txn)
    }

    fn arm(&self, point: CrashPoint) {
        if let Some(name) = point.failpoint() {
            failpoint::enable(name);
        }
    }
}
