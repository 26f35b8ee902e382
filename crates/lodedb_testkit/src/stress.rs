//! Multi-threaded stress runners.
//!
//! Each runner drives an environment from several threads and reports
//! how many transactions committed and how many had to be retried after a
//! lock conflict.

use lodedb_core::{CoreResult, DbConfig, Environment, TxnOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Worker threads.
    pub threads: usize,
    /// Transactions per thread.
    pub txns_per_thread: usize,
    /// Writes per transaction.
    pub ops_per_txn: usize,
    /// Distinct keys shared by all threads in contended runs.
    pub key_space: u32,
    /// Value length in bytes.
    pub value_len: usize,
    /// Attempts per transaction before giving up.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            txns_per_thread: 100,
            ops_per_txn: 4,
            key_space: 64,
            value_len: 32,
            max_attempts: 50,
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    /// Transactions committed.
    pub committed: usize,
    /// Attempts aborted after a retryable error.
    pub retries: usize,
    /// Transactions abandoned after `max_attempts`.
    pub gave_up: usize,
    /// Wall clock time in milliseconds.
    pub elapsed_ms: u128,
    /// Committed transactions per second.
    pub txns_per_second: f64,
}

impl StressReport {
    fn new(committed: usize, retries: usize, gave_up: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        Self {
            committed,
            retries,
            gave_up,
            elapsed_ms: elapsed.as_millis(),
            txns_per_second: if secs > 0.0 {
                committed as f64 / secs
            } else {
                0.0
            },
        }
    }

    /// The report as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Committed: {}", self.committed);
        println!("Retries: {}", self.retries);
        println!("Gave up: {}", self.gave_up);
        println!("Elapsed: {} ms", self.elapsed_ms);
        println!("Throughput: {:.2} txns/sec", self.txns_per_second);
    }
}

#[derive(Default)]
struct Counters {
    committed: AtomicUsize,
    retries: AtomicUsize,
    gave_up: AtomicUsize,
}

impl Counters {
    fn report(&self, elapsed: Duration) -> StressReport {
        StressReport::new(
            self.committed.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.gave_up.load(Ordering::Relaxed),
            elapsed,
        )
    }
}

/// Runs `body` in a transaction, retrying on retryable errors.
fn with_retry(
    env: &Environment,
    counters: &Counters,
    max_attempts: usize,
    mut body: impl FnMut(&mut lodedb_core::Transaction) -> CoreResult<()>,
) -> CoreResult<()> {
    for _ in 0..max_attempts {
        let mut txn = env.begin(TxnOptions::new())?;
        match body(&mut txn).and_then(|()| env.commit(&mut txn).map(|_| ())) {
            Ok(()) => {
                counters.committed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                counters.retries.fetch_add(1, Ordering::Relaxed);
                let _ = env.abort(&mut txn);
            }
            Err(e) => return Err(e),
        }
    }
    counters.gave_up.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Every thread writes its own key range of database `db`; no two
/// transactions touch the same key, though they may share pages.
///
/// # Errors
///
/// Returns the first non-retryable engine error.
pub fn run_disjoint_writers(
    env: &Environment,
    db: &str,
    config: &StressConfig,
) -> CoreResult<StressReport> {
    let handle = env.open_database(db, DbConfig::new().create(true))?;
    let counters = Counters::default();
    let value = vec![0x5Au8; config.value_len];
    let start = Instant::now();

    thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                let (handle, counters, value) = (&handle, &counters, &value);
                s.spawn(move || -> CoreResult<()> {
                    for n in 0..config.txns_per_thread {
                        with_retry(env, counters, config.max_attempts, |txn| {
                            for op in 0..config.ops_per_txn {
                                let key = disjoint_key(t, n, op, config);
                                handle.put(txn, &key, value)?;
                            }
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("Stress worker panicked"))
            .collect::<CoreResult<Vec<()>>>()
    })?;

    Ok(counters.report(start.elapsed()))
}

fn disjoint_key(thread: usize, txn: usize, op: usize, config: &StressConfig) -> [u8; 8] {
    let seq = (txn * config.ops_per_txn + op) as u32;
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&(thread as u32).to_be_bytes());
    key[4..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Threads increment counters stored under keys of a shared key space, so
/// transactions conflict and deadlock. Each committed transaction adds
/// `ops_per_txn` to the sum of all counters, which
/// [`counter_total`] checks afterwards.
///
/// # Errors
///
/// Returns the first non-retryable engine error.
pub fn run_contended_counters(
    env: &Environment,
    db: &str,
    config: &StressConfig,
) -> CoreResult<StressReport> {
    let handle = env.open_database(db, DbConfig::new().create(true))?;
    let counters = Counters::default();
    let space = config.key_space.max(1);
    let start = Instant::now();

    thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                let (handle, counters) = (&handle, &counters);
                s.spawn(move || -> CoreResult<()> {
                    // xorshift32
                    let mut state = 0x9E37_79B9u32.wrapping_mul(t as u32 + 1);
                    for _ in 0..config.txns_per_thread {
                        let keys: Vec<u32> = (0..config.ops_per_txn)
                            .map(|_| {
                                state ^= state << 13;
                                state ^= state >> 17;
                                state ^= state << 5;
                                state % space
                            })
                            .collect();
                        with_retry(env, counters, config.max_attempts, |txn| {
                            for k in &keys {
                                let key = k.to_be_bytes();
                                let current = handle
                                    .get(txn, &key)?
                                    .map(|v| decode_counter(&v))
                                    .unwrap_or(0);
                                handle.put(txn, &key, &(current + 1).to_be_bytes())?;
                            }
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("Stress worker panicked"))
            .collect::<CoreResult<Vec<()>>>()
    })?;

    Ok(counters.report(start.elapsed()))
}

fn decode_counter(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

/// Sum of every counter written by [`run_contended_counters`].
///
/// # Errors
///
/// Returns engine errors.
pub fn counter_total(env: &Environment, db: &str) -> CoreResult<u64> {
    let handle = env.open_database(db, DbConfig::new())?;
    let mut txn = env.begin(TxnOptions::new())?;
    let total = handle
        .dump(&mut txn)?
        .iter()
        .map(|(_, v)| decode_counter(v))
        .sum();
    env.commit(&mut txn)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEnv;

    fn small() -> StressConfig {
        StressConfig {
            threads: 4,
            txns_per_thread: 25,
            ops_per_txn: 3,
            key_space: 16,
            value_len: 24,
            max_attempts: 200,
        }
    }

    #[test]
    fn disjoint_writers_all_commit() {
        let env = TestEnv::memory();
        let config = small();
        let report = run_disjoint_writers(&env, "disjoint", &config).unwrap();
        assert_eq!(report.committed, 100);
        assert_eq!(report.gave_up, 0);
        assert_eq!(env.contents("disjoint").len(), 300);
    }

    #[test]
    fn contended_counters_add_up() {
        let env = TestEnv::memory();
        let config = small();
        let report = run_contended_counters(&env, "counters", &config).unwrap();
        assert_eq!(report.committed + report.gave_up, 100);
        assert_eq!(
            counter_total(&env, "counters").unwrap(),
            (report.committed * config.ops_per_txn) as u64
        );
        assert!(report.to_json().contains("\"committed\""));
    }

    #[test]
    fn counters_decode_short_values() {
        assert_eq!(decode_counter(&7u64.to_be_bytes()), 7);
        assert_eq!(decode_counter(&[1, 0]), 256);
        assert_eq!(decode_counter(&[]), 0);
    }
}
