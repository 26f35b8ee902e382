//! # LodeDB Replication
//!
//! Single-master log-shipping replication for LodeDB environments.
//!
//! This crate provides:
//! - a replication manager with master, client and electing roles
//! - log shipping at commit with acknowledgement policies
//! - elections by newest commit, priority and site id
//! - duplicate-master detection and demotion
//! - client sync against a new master, rolling back records it never wrote
//! - a pluggable transport with an in-process network
//!
//! ## Architecture
//!
//! Every site keeps an identical log: clients append shipped records at
//! the LSN the master wrote them at and redo them. A client that falls
//! behind asks for the missing records with a `LogRequest`. After a master
//! change, a client walks back through its commit records until one
//! matches the new master's log and cuts its log back to that point.
//!
//! ## Key Invariants
//!
//! - At most one site accepts writes in a given generation
//! - A newer generation always wins
//! - Records are applied in LSN order without gaps
//! - Databases exist on every site under the same file ids

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod manager;
mod message;
mod transport;

pub use config::{AckPolicy, ReplicationConfig};
pub use error::{ReplError, ReplResult};
pub use manager::{ElectionOutcome, ReplStats, ReplicationManager, Role, SiteStatus};
pub use message::{Envelope, Message, SiteId};
pub use transport::{InProcessNetwork, InProcessTransport, Transport};
