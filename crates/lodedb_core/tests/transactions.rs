//! Transaction semantics: atomicity, isolation levels and lock conflicts.

use lodedb_core::{
    CoreError, DbConfig, EnvConfig, Environment, ErrorKind, IsolationLevel, TransactionState,
    TxnOptions,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn env_with(config: EnvConfig) -> Arc<Environment> {
    Environment::open_in_memory(config.page_size(1024).cache_pages(128)).unwrap()
}

fn env() -> Arc<Environment> {
    env_with(EnvConfig::new())
}

fn create() -> DbConfig {
    DbConfig::new().create(true)
}

#[test]
fn committed_writes_are_visible_to_later_transactions() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    db.put(&mut txn, b"k", b"v").unwrap();
    let info = env.commit(&mut txn).unwrap();
    assert!(!info.lsn.is_zero());
    assert_eq!(txn.state(), TransactionState::Committed);

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    assert_eq!(db.get(&mut txn, b"k").unwrap().as_deref(), Some(&b"v"[..]));
    let info = env.commit(&mut txn).unwrap();
    assert!(info.lsn.is_zero(), "read-only commit writes no log record");
}

#[test]
fn abort_undoes_every_change() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    for i in 0..50u32 {
        db.put(&mut txn, &i.to_be_bytes(), b"keep").unwrap();
    }
    env.commit(&mut txn).unwrap();

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    for i in 0..50u32 {
        db.delete(&mut txn, &i.to_be_bytes()).unwrap();
    }
    for i in 100..600u32 {
        db.put(&mut txn, &i.to_be_bytes(), &[9u8; 40]).unwrap();
    }
    env.abort(&mut txn).unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    let all = db.dump(&mut txn).unwrap();
    assert_eq!(all.len(), 50);
    assert!(all.iter().all(|(_, v)| v == b"keep"));
    assert!(db.verify(&mut txn).unwrap().is_ok());
    env.commit(&mut txn).unwrap();
}

#[test]
fn dropping_an_active_transaction_aborts_it() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    {
        let mut txn = env.begin(TxnOptions::new()).unwrap();
        db.put(&mut txn, b"ghost", b"boo").unwrap();
    }
    assert_eq!(env.active_transactions(), 0);
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    assert_eq!(db.get(&mut txn, b"ghost").unwrap(), None);
    env.commit(&mut txn).unwrap();
    assert_eq!(env.stats().txns.aborted, 1);
}

#[test]
fn finished_transactions_are_closed() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    env.commit(&mut txn).unwrap();
    let err = db.get(&mut txn, b"k").unwrap_err();
    assert!(matches!(err, CoreError::TransactionClosed { .. }));
    assert_eq!(err.kind(), ErrorKind::HandleInvalid);
    assert!(matches!(
        env.commit(&mut txn),
        Err(CoreError::TransactionClosed { .. })
    ));
}

#[test]
fn serializable_reader_blocks_writer() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut reader = env.begin(TxnOptions::new()).unwrap();
    assert_eq!(db.get(&mut reader, b"k").unwrap(), None);

    let mut writer = env.begin(TxnOptions::new().no_wait(true)).unwrap();
    let err = db.put(&mut writer, b"k", b"v").unwrap_err();
    assert!(matches!(err, CoreError::LockNotGranted { .. }));
    assert!(err.is_retryable());
    env.abort(&mut writer).unwrap();

    env.commit(&mut reader).unwrap();
    let mut writer = env.begin(TxnOptions::new().no_wait(true)).unwrap();
    db.put(&mut writer, b"k", b"v").unwrap();
    env.commit(&mut writer).unwrap();
}

#[test]
fn read_committed_releases_read_locks() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut reader = env
        .begin(TxnOptions::new().isolation(IsolationLevel::ReadCommitted))
        .unwrap();
    assert_eq!(db.get(&mut reader, b"k").unwrap(), None);

    let mut writer = env.begin(TxnOptions::new().no_wait(true)).unwrap();
    db.put(&mut writer, b"k", b"v").unwrap();
    env.commit(&mut writer).unwrap();

    assert_eq!(db.get(&mut reader, b"k").unwrap().as_deref(), Some(&b"v"[..]));
    env.commit(&mut reader).unwrap();
}

#[test]
fn second_writer_times_out() {
    let env = env_with(EnvConfig::new().lock_timeout(Some(Duration::from_millis(100))));
    let db = env.open_database("t", create()).unwrap();
    let mut first = env.begin(TxnOptions::new()).unwrap();
    db.put(&mut first, b"k", b"first").unwrap();

    let mut second = env.begin(TxnOptions::new()).unwrap();
    let err = db.put(&mut second, b"k", b"second").unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { .. }), "{err}");
    env.abort(&mut second).unwrap();
    env.commit(&mut first).unwrap();

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    assert_eq!(db.get(&mut txn, b"k").unwrap().as_deref(), Some(&b"first"[..]));
    env.commit(&mut txn).unwrap();
}

#[test]
fn deadlock_picks_exactly_one_victim() {
    let env = env();
    let a = env.open_database("a", create()).unwrap();
    let b = env.open_database("b", create()).unwrap();
    let barrier = Barrier::new(2);

    let run = |first: &lodedb_core::Database, second: &lodedb_core::Database| {
        let mut txn = env.begin(TxnOptions::new()).unwrap();
        first.put(&mut txn, b"k", b"1").unwrap();
        barrier.wait();
        match second.put(&mut txn, b"k", b"2") {
            Ok(()) => {
                env.commit(&mut txn).unwrap();
                true
            }
            Err(CoreError::Deadlock { .. }) => {
                env.abort(&mut txn).unwrap();
                false
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    };

    let outcomes: Vec<bool> = thread::scope(|s| {
        let run = &run;
        let (a, b) = (&a, &b);
        let h1 = s.spawn(move || run(a, b));
        let h2 = s.spawn(move || run(b, a));
        vec![h1.join().unwrap(), h2.join().unwrap()]
    });

    assert_eq!(outcomes.iter().filter(|&&won| won).count(), 1);
    assert_eq!(env.stats().locks.deadlocks, 1);
}

#[test]
fn concurrent_writers_on_separate_databases() {
    let env = env();
    let dbs: Vec<_> = (0..4)
        .map(|i| env.open_database(&format!("db{i}"), create()).unwrap())
        .collect();

    thread::scope(|s| {
        for db in &dbs {
            let env = &env;
            s.spawn(move || {
                for i in 0..200u32 {
                    let mut txn = env.begin(TxnOptions::new()).unwrap();
                    db.put(&mut txn, &i.to_be_bytes(), b"v").unwrap();
                    env.commit(&mut txn).unwrap();
                }
            });
        }
    });

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    for db in &dbs {
        assert_eq!(db.dump(&mut txn).unwrap().len(), 200);
    }
    env.commit(&mut txn).unwrap();
}

#[test]
fn snapshot_reads_ignore_later_commits() {
    let env = env_with(EnvConfig::new().multiversion(true));
    let db = env.open_database("t", create()).unwrap();
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    db.put(&mut txn, b"k", b"old").unwrap();
    env.commit(&mut txn).unwrap();

    let mut snap = env
        .begin(TxnOptions::new().isolation(IsolationLevel::Snapshot))
        .unwrap();
    assert_eq!(db.get(&mut snap, b"k").unwrap().as_deref(), Some(&b"old"[..]));

    let mut writer = env.begin(TxnOptions::new().no_wait(true)).unwrap();
    db.put(&mut writer, b"k", b"new").unwrap();
    assert_eq!(db.get(&mut snap, b"k").unwrap().as_deref(), Some(&b"old"[..]));
    env.commit(&mut writer).unwrap();
    assert_eq!(db.get(&mut snap, b"k").unwrap().as_deref(), Some(&b"old"[..]));

    let err = db.put(&mut snap, b"k", b"mine").unwrap_err();
    assert!(matches!(err, CoreError::UpdateConflict { .. }), "{err}");
    env.abort(&mut snap).unwrap();

    let mut txn = env.begin(TxnOptions::new()).unwrap();
    assert_eq!(db.get(&mut txn, b"k").unwrap().as_deref(), Some(&b"new"[..]));
    env.commit(&mut txn).unwrap();
}

#[test]
fn snapshot_requires_multiversion() {
    let env = env();
    assert!(matches!(
        env.begin(TxnOptions::new().isolation(IsolationLevel::Snapshot)),
        Err(CoreError::InvalidArgument { .. })
    ));
}

#[test]
fn closed_handles_are_rejected() {
    let env = env();
    let db = env.open_database("t", create()).unwrap();
    let mut txn = env.begin(TxnOptions::new()).unwrap();
    db.close();
    assert!(matches!(db.get(&mut txn, b"k"), Err(CoreError::HandleClosed)));
    env.commit(&mut txn).unwrap();

    env.close().unwrap();
    assert!(matches!(
        env.begin(TxnOptions::new()),
        Err(CoreError::HandleClosed)
    ));
    env.close().unwrap();
}

#[test]
fn transaction_from_another_environment_is_refused() {
    let env1 = env();
    let env2 = env();
    let db = env1.open_database("t", create()).unwrap();
    let mut txn = env2.begin(TxnOptions::new()).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"k", b"v"),
        Err(CoreError::InvalidArgument { .. })
    ));
}
