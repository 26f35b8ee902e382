//! Checkpoint, recover and archive commands.

use super::open_env;
use lodedb_core::RecoveryMode;
use std::path::Path;

/// Takes a checkpoint.
pub fn checkpoint(home: &Path, cache_pages: usize) -> Result<(), Box<dyn std::error::Error>> {
    let env = open_env(home, cache_pages, RecoveryMode::Normal)?;
    let info = env.checkpoint()?;
    println!("Checkpoint written at {}", info.lsn);
    println!("  Redo starts at:   {}", info.redo_lsn);
    println!("  Oldest needed:    {}", info.oldest_needed);
    println!("  Pages written:    {}", info.pages_written);
    env.close()?;
    Ok(())
}

/// Opens the environment with the requested recovery mode and reports
/// what recovery did.
pub fn recover(
    home: &Path,
    cache_pages: usize,
    catastrophic: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if catastrophic {
        RecoveryMode::Catastrophic
    } else {
        RecoveryMode::Normal
    };
    let env = open_env(home, cache_pages, mode)?;
    let report = env.recovery_report();
    println!("Recovery ({:?})", mode);
    println!("  Log range:        {} .. {}", report.start_lsn, report.end_lsn);
    println!("  Records scanned:  {}", report.records_scanned);
    println!("  Pages redone:     {}", report.pages_redone);
    println!("  Committed txns:   {}", report.committed);
    println!("  Rolled back:      {}", report.rolled_back.len());
    println!("  Changes undone:   {}", report.changes_undone);
    env.close()?;
    Ok(())
}

/// Checkpoints, then removes log files wholly before the oldest LSN
/// recovery still needs.
pub fn archive(home: &Path, cache_pages: usize) -> Result<(), Box<dyn std::error::Error>> {
    let env = open_env(home, cache_pages, RecoveryMode::Normal)?;
    env.checkpoint()?;
    let removed = env.archive()?;
    if removed.is_empty() {
        println!("No log files to remove");
    } else {
        println!("Removed {} log file(s): {:?}", removed.len(), removed);
    }
    println!("Log files kept: {:?}", env.log().file_numbers());
    env.close()?;
    Ok(())
}
