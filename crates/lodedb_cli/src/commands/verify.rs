//! Verify command implementation.

use super::{open_env, CliError};
use lodedb_core::{DbConfig, Environment, RecoveryMode, TxnOptions, VerifyReport};
use std::path::Path;

/// Runs the verify command.
pub fn run(
    home: &Path,
    cache_pages: usize,
    only: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let env = open_env(home, cache_pages, RecoveryMode::Normal)?;
    println!("Verifying environment at {:?}", home);
    println!();

    let reports = verify_all(&env, only)?;
    env.close()?;

    let mut problems = 0;
    let mut damaged = 0;
    for (name, report) in &reports {
        print_result(name, report);
        if !report.is_ok() {
            problems += report.problems.len();
            damaged += 1;
        }
    }

    println!();
    if damaged == 0 {
        println!("✓ {} database(s) verified", reports.len());
        Ok(())
    } else {
        println!("✗ Verification FAILED");
        Err(CliError::VerifyFailed {
            problems,
            databases: damaged,
        }
        .into())
    }
}

/// Verifies every database (or just `only`).
pub fn verify_all(
    env: &Environment,
    only: Option<&str>,
) -> Result<Vec<(String, VerifyReport)>, Box<dyn std::error::Error>> {
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => env.list_databases(),
    };
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let db = env.open_database(&name, DbConfig::new().read_only(true))?;
        let mut txn = env.begin(TxnOptions::new())?;
        let report = db.verify(&mut txn)?;
        env.commit(&mut txn)?;
        out.push((name, report));
    }
    Ok(out)
}

fn print_result(name: &str, report: &VerifyReport) {
    println!(
        "  {}: {} pages checked, {} keys",
        name, report.pages_checked, report.keys
    );
    for problem in &report.problems {
        println!("    ERROR: {}", problem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodedb_core::EnvConfig;

    #[test]
    fn healthy_databases_verify() {
        let env = Environment::open_in_memory(EnvConfig::new().page_size(1024)).unwrap();
        for name in ["a", "b"] {
            let db = env.open_database(name, DbConfig::new().create(true)).unwrap();
            let mut txn = env.begin(TxnOptions::new()).unwrap();
            for i in 0..300u32 {
                db.put(&mut txn, &i.to_le_bytes(), &[7u8; 20]).unwrap();
            }
            env.commit(&mut txn).unwrap();
        }
        let reports = verify_all(&env, None).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, r)| r.is_ok() && r.keys == 300));
        assert!(verify_all(&env, Some("missing")).is_err());
    }
}
