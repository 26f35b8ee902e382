//! Benchmark utilities.

#![warn(missing_docs)]

use lodedb_core::wal::{PageDelta, WalRecord};
use lodedb_core::{DbConfig, Database, EnvConfig, Environment, FileId, Lsn, TransactionId, TxnOptions};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

/// Generate random data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Big-endian keys `0..count` in random order.
pub fn shuffled_keys(count: u32) -> Vec<[u8; 4]> {
    let mut keys: Vec<_> = (0..count).map(u32::to_be_bytes).collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// In-memory environment with a single database, tuned for benchmarks.
pub fn bench_env(page_size: usize) -> (Arc<Environment>, Database) {
    let env = Environment::open_in_memory(
        EnvConfig::new()
            .page_size(page_size)
            .cache_pages(16 * 1024)
            .sync_on_commit(false),
    )
    .expect("Failed to open environment");
    let db = env
        .open_database("bench", DbConfig::new().create(true))
        .expect("Failed to create database");
    (env, db)
}

/// Loads `count` records with values of `value_len` bytes, in batches.
pub fn preload(env: &Environment, db: &Database, count: u32, value_len: usize) {
    let value = random_data(value_len);
    for chunk in (0..count).collect::<Vec<_>>().chunks(1000) {
        let mut txn = env.begin(TxnOptions::new()).expect("Failed to begin");
        for &i in chunk {
            db.put(&mut txn, &i.to_be_bytes(), &value)
                .expect("Failed to put");
        }
        env.commit(&mut txn).expect("Failed to commit");
    }
}

/// An update record changing `len` bytes of a page.
pub fn update_record(txid: u64, len: usize) -> WalRecord {
    WalRecord::Update {
        txid: TransactionId::new(txid),
        prev_lsn: Lsn::ZERO,
        delta: PageDelta {
            file: FileId::new(1),
            pgno: 7,
            page_lsn: Lsn::ZERO,
            offset: 64,
            before: vec![0; len],
            after: random_data(len),
        },
    }
}
