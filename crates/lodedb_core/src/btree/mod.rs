//! B+tree access method.
//!
//! Each database file is one tree. Page 0 holds the [`meta::MetaPage`],
//! the root stays at page 1, leaves are chained left to right and values
//! too large for a leaf live in overflow chains. Every page change goes
//! through [`ctx::TreeCtx::modify`], which logs it as an update of the
//! calling transaction.

mod ctx;
mod cursor;
pub(crate) mod meta;
mod node;
mod overflow;
pub(crate) mod tree;
mod verify;

pub(crate) use ctx::TreeCtx;
pub use cursor::Cursor;
pub use meta::{MetaPage, META_MAGIC, META_PGNO, META_VERSION, ROOT_PGNO};
pub(crate) use node::{Leaf, Node};
pub use tree::KeyValuePair;
pub use verify::{DbStat, VerifyReport};
pub(crate) use verify::{stat, verify};
