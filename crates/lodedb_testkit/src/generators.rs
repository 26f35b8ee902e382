//! Property-based test generators using proptest.
//!
//! Workloads are sequences of [`KvOp`]s over a small key space so that
//! overwrites and deletes of existing keys are common. A [`KvModel`] runs
//! the same workload against a `BTreeMap` to predict every result.

use lodedb_core::{CoreError, CoreResult, Database, Environment, KeyValuePair, TxnOptions};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for keys drawn from `space` distinct values, with a few
/// longer variants sharing a prefix.
pub fn key_strategy(space: u16) -> impl Strategy<Value = Vec<u8>> {
    let space = space.max(1);
    prop_oneof![
        4 => (0..space).prop_map(|n| n.to_be_bytes().to_vec()),
        1 => (0..space, 1usize..40).prop_map(|(n, pad)| {
            let mut key = n.to_be_bytes().to_vec();
            key.resize(2 + pad, b'~');
            key
        }),
    ]
}

/// Strategy for values: mostly small, sometimes larger than a 1 KiB page
/// so they go to overflow pages.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => prop::collection::vec(any::<u8>(), 0..64),
        2 => prop::collection::vec(any::<u8>(), 64..400),
        1 => (1200usize..5000, any::<u8>()).prop_map(|(len, b)| vec![b; len]),
    ]
}

/// Strategy for database names.
pub fn db_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// One operation of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Store a value.
    Put {
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Store a value only if the key is absent.
    Insert {
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Key.
        key: Vec<u8>,
    },
    /// Read a key.
    Get {
        /// Key.
        key: Vec<u8>,
    },
}

/// Result of one operation, as the model predicts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvResult {
    /// The write was applied.
    Done,
    /// `Insert` found the key.
    Exists,
    /// `Delete` did not find the key.
    Missing,
    /// `Get` result.
    Value(Option<Vec<u8>>),
}

/// Strategy for a single operation over `space` keys.
pub fn op_strategy(space: u16) -> impl Strategy<Value = KvOp> {
    prop_oneof![
        5 => (key_strategy(space), value_strategy())
            .prop_map(|(key, value)| KvOp::Put { key, value }),
        1 => (key_strategy(space), value_strategy())
            .prop_map(|(key, value)| KvOp::Insert { key, value }),
        3 => key_strategy(space).prop_map(|key| KvOp::Delete { key }),
        2 => key_strategy(space).prop_map(|key| KvOp::Get { key }),
    ]
}

/// Strategy for a workload of `len` operations over `space` keys.
pub fn workload_strategy(
    space: u16,
    len: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<KvOp>> {
    prop::collection::vec(op_strategy(space), len)
}

/// Strategy for a workload split into transactions, each either committed
/// (`true`) or aborted.
pub fn transactional_workload_strategy(
    space: u16,
    txns: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<(Vec<KvOp>, bool)>> {
    prop::collection::vec((workload_strategy(space, 1..20), prop::bool::weighted(0.75)), txns)
}

/// Reference model of a database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvModel {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KvModel {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op` and returns its result.
    pub fn apply(&mut self, op: &KvOp) -> KvResult {
        match op {
            KvOp::Put { key, value } => {
                self.map.insert(key.clone(), value.clone());
                KvResult::Done
            }
            KvOp::Insert { key, value } => {
                if self.map.contains_key(key) {
                    KvResult::Exists
                } else {
                    self.map.insert(key.clone(), value.clone());
                    KvResult::Done
                }
            }
            KvOp::Delete { key } => match self.map.remove(key) {
                Some(_) => KvResult::Done,
                None => KvResult::Missing,
            },
            KvOp::Get { key } => KvResult::Value(self.map.get(key).cloned()),
        }
    }

    /// Model contents in key order.
    pub fn contents(&self) -> Vec<KeyValuePair> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the model holds no keys.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Applies `op` to `db` inside `txn`, mapping expected outcome errors to
/// the model's results.
///
/// # Errors
///
/// Returns any other engine error.
pub fn apply_op(
    db: &Database,
    txn: &mut lodedb_core::Transaction,
    op: &KvOp,
) -> CoreResult<KvResult> {
    let result = match op {
        KvOp::Put { key, value } => db.put(txn, key, value).map(|()| KvResult::Done),
        KvOp::Insert { key, value } => db.put_no_overwrite(txn, key, value).map(|()| KvResult::Done),
        KvOp::Delete { key } => db.delete(txn, key).map(|()| KvResult::Done),
        KvOp::Get { key } => db.get(txn, key).map(KvResult::Value),
    };
    match result {
        Err(CoreError::KeyExists) => Ok(KvResult::Exists),
        Err(CoreError::KeyNotFound) => Ok(KvResult::Missing),
        other => other,
    }
}

/// Runs a transactional workload against `db` and `model` side by side,
/// committing or aborting each transaction as the workload says. Panics
/// on the first diverging result.
///
/// # Errors
///
/// Returns engine errors other than the expected outcomes.
pub fn run_against_model(
    env: &Environment,
    db: &Database,
    model: &mut KvModel,
    workload: &[(Vec<KvOp>, bool)],
) -> CoreResult<()> {
    for (ops, commit) in workload {
        let mut txn = env.begin(TxnOptions::new())?;
        let mut scratch = model.clone();
        for op in ops {
            let got = apply_op(db, &mut txn, op)?;
            let want = scratch.apply(op);
            assert_eq!(got, want, "diverged on {op:?}");
        }
        if *commit {
            env.commit(&mut txn)?;
            *model = scratch;
        } else {
            env.abort(&mut txn)?;
        }
    }
    Ok(())
}
