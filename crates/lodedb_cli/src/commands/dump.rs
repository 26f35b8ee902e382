//! Dump command implementation.

use super::{escape, open_env, Format};
use lodedb_core::{DbConfig, Environment, RecoveryMode, TxnOptions};
use serde::Serialize;
use std::path::Path;

/// One record of a dump.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DumpEntry {
    /// Key, escaped.
    pub key: String,
    /// Value, escaped.
    pub value: String,
    /// Value length in bytes.
    pub value_len: usize,
}

/// Runs the dump command.
pub fn run(
    home: &Path,
    cache_pages: usize,
    name: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let env = open_env(home, cache_pages, RecoveryMode::Normal)?;
    let entries = dump(&env, name)?;
    env.close()?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for entry in &entries {
                println!("{} => {}", entry.key, entry.value);
            }
            eprintln!("{} record(s)", entries.len());
        }
    }
    Ok(())
}

fn dump(env: &Environment, name: &str) -> Result<Vec<DumpEntry>, Box<dyn std::error::Error>> {
    let db = env.open_database(name, DbConfig::new().read_only(true))?;
    let mut txn = env.begin(TxnOptions::new())?;
    let pairs = db.dump(&mut txn)?;
    env.commit(&mut txn)?;
    Ok(pairs
        .into_iter()
        .map(|(key, value)| DumpEntry {
            key: escape(&key),
            value: escape(&value),
            value_len: value.len(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodedb_core::EnvConfig;

    #[test]
    fn dump_is_in_key_order() {
        let env = Environment::open_in_memory(EnvConfig::new()).unwrap();
        let db = env.open_database("kv", DbConfig::new().create(true)).unwrap();
        let mut txn = env.begin(TxnOptions::new()).unwrap();
        db.put(&mut txn, b"b", b"2").unwrap();
        db.put(&mut txn, b"a", b"\x01").unwrap();
        env.commit(&mut txn).unwrap();

        let entries = dump(&env, "kv").unwrap();
        assert_eq!(
            entries,
            vec![
                DumpEntry {
                    key: "a".into(),
                    value: "\\x01".into(),
                    value_len: 1
                },
                DumpEntry {
                    key: "b".into(),
                    value: "2".into(),
                    value_len: 1
                },
            ]
        );
    }
}
