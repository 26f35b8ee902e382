//! # LodeDB Testkit
//!
//! Test utilities for LodeDB.
//!
//! This crate provides:
//! - Environment fixtures, in memory or in a temporary directory
//! - A crash harness driven by engine failpoints
//! - Property-based workload generators using proptest, with a model to
//!   check results against
//! - Multi-threaded stress runners
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lodedb_testkit::prelude::*;
//!
//! #[test]
//! fn survives_a_crash() {
//!     let mut env = TestEnv::on_disk();
//!     env.fill("kv", 0..100, b"v");
//!     env.crash_and_reopen();
//!     assert_eq!(env.contents("kv").len(), 100);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::{CrashOutcome, CrashPoint, CrashingEnv};
pub use fixtures::{with_disk_env, with_memory_env, TestEnv};
pub use generators::{KvModel, KvOp};
pub use stress::{StressConfig, StressReport};
