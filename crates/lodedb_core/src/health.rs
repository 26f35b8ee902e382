//! Environment-wide health: closed flag, poison state, handle epoch and
//! the replication write gate.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Whether this site accepts new writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteGate {
    /// Writes allowed (standalone environment or replication master).
    #[default]
    Open,
    /// This site is a replication client.
    NotMaster,
    /// This site was master and found another master.
    DuplicateMaster {
        /// Generation in which the conflict was detected.
        generation: u32,
    },
    /// An election is running.
    Electing,
}

impl WriteGate {
    fn check(self) -> CoreResult<()> {
        match self {
            Self::Open => Ok(()),
            Self::NotMaster => Err(CoreError::NotMaster),
            Self::DuplicateMaster { generation } => Err(CoreError::DuplicateMaster { generation }),
            Self::Electing => Err(CoreError::ElectionInProgress),
        }
    }
}

/// Shared by every component of one environment.
#[derive(Debug)]
pub struct EnvHealth {
    closed: AtomicBool,
    poisoned: Mutex<Option<String>>,
    gate: RwLock<WriteGate>,
    epoch: AtomicU64,
}

impl EnvHealth {
    /// Creates the health record for an environment at `epoch`.
    #[must_use]
    pub fn new(epoch: u64) -> Self {
        Self {
            closed: AtomicBool::new(false),
            poisoned: Mutex::new(None),
            gate: RwLock::new(WriteGate::Open),
            epoch: AtomicU64::new(epoch),
        }
    }

    /// Fails if the environment is closed or poisoned.
    ///
    /// # Errors
    ///
    /// Returns `HandleClosed` or `RunRecovery`.
    pub fn check_usable(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::HandleClosed);
        }
        if let Some(reason) = self.poisoned.lock().as_ref() {
            return Err(CoreError::run_recovery(reason.clone()));
        }
        Ok(())
    }

    /// Fails unless the environment is usable and accepts writes.
    ///
    /// # Errors
    ///
    /// Returns `HandleClosed`, `RunRecovery`, `NotMaster`,
    /// `DuplicateMaster` or `ElectionInProgress`.
    pub fn check_writable(&self) -> CoreResult<()> {
        self.check_usable()?;
        self.gate.read().check()
    }

    /// Fails if a handle opened at `opened` was invalidated.
    ///
    /// # Errors
    ///
    /// Returns `HandleDead`.
    pub fn check_epoch(&self, opened: u64) -> CoreResult<()> {
        let current = self.epoch();
        if opened != current {
            return Err(CoreError::HandleDead { opened, current });
        }
        Ok(())
    }

    /// Poisons the environment. Only the first reason is kept.
    pub fn poison(&self, reason: impl Into<String>) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            let reason = reason.into();
            tracing::error!(%reason, "environment poisoned; reopen with recovery");
            *poisoned = Some(reason);
        }
    }

    /// Poisons the environment if `err` is a fatal log or page error.
    pub fn note(&self, err: &CoreError) {
        if err.is_poisoning() {
            self.poison(err.to_string());
        }
    }

    /// Returns true once poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some()
    }

    /// Marks the environment closed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current handle epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidates every handle opened so far and returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current write gate.
    pub fn gate(&self) -> WriteGate {
        *self.gate.read()
    }

    /// Replaces the write gate.
    pub fn set_gate(&self, gate: WriteGate) {
        *self.gate.write() = gate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lsn;

    #[test]
    fn poison_keeps_first_reason() {
        let health = EnvHealth::new(0);
        assert!(health.check_usable().is_ok());
        health.poison("first");
        health.poison("second");
        match health.check_usable() {
            Err(CoreError::RunRecovery { reason }) => assert_eq!(reason, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn note_only_poisons_fatal_errors() {
        let health = EnvHealth::new(0);
        health.note(&CoreError::KeyNotFound);
        assert!(!health.is_poisoned());
        health.note(&CoreError::log_corruption(Lsn::new(1, 16), "bad"));
        assert!(health.is_poisoned());
    }

    #[test]
    fn gate_blocks_writes() {
        let health = EnvHealth::new(0);
        health.set_gate(WriteGate::NotMaster);
        assert!(health.check_usable().is_ok());
        assert!(matches!(health.check_writable(), Err(CoreError::NotMaster)));
        health.set_gate(WriteGate::DuplicateMaster { generation: 4 });
        assert!(matches!(
            health.check_writable(),
            Err(CoreError::DuplicateMaster { generation: 4 })
        ));
    }

    #[test]
    fn epoch_bump_kills_handles() {
        let health = EnvHealth::new(3);
        assert!(health.check_epoch(3).is_ok());
        assert_eq!(health.bump_epoch(), 4);
        assert!(matches!(
            health.check_epoch(3),
            Err(CoreError::HandleDead {
                opened: 3,
                current: 4
            })
        ));
    }

    #[test]
    fn closed_wins() {
        let health = EnvHealth::new(0);
        health.close();
        assert!(matches!(health.check_usable(), Err(CoreError::HandleClosed)));
    }
}
