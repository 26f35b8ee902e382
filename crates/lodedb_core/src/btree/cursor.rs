//! Ordered cursor over one database.

use crate::btree::tree::{self, KeyValuePair};
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;

/// A position in a database's key order.
///
/// The cursor remembers the key it stands on rather than a page slot, so
/// it stays valid across splits and merges made by the same transaction.
/// Moving past either end returns `None` and leaves the position as it
/// was.
pub struct Cursor<'a> {
    db: &'a Database,
    txn: &'a mut Transaction,
    position: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(db: &'a Database, txn: &'a mut Transaction) -> Self {
        Self {
            db,
            txn,
            position: None,
        }
    }

    /// Key the cursor stands on.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.position.as_deref()
    }

    fn land(&mut self, found: Option<KeyValuePair>) -> Option<KeyValuePair> {
        if let Some((key, _)) = &found {
            self.position = Some(key.clone());
        }
        found
    }

    /// Moves to the smallest key.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn first(&mut self) -> CoreResult<Option<KeyValuePair>> {
        let found = self
            .db
            .run(self.txn, false, |ctx| tree::first_from(ctx, None, true))?;
        Ok(self.land(found))
    }

    /// Moves to the largest key.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn last(&mut self) -> CoreResult<Option<KeyValuePair>> {
        let found = self.db.run(self.txn, false, |ctx| tree::last_before(ctx, None))?;
        Ok(self.land(found))
    }

    /// Moves to the next key; the first one for an unpositioned cursor.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn next(&mut self) -> CoreResult<Option<KeyValuePair>> {
        let Some(at) = self.position.clone() else {
            return self.first();
        };
        let found = self
            .db
            .run(self.txn, false, |ctx| tree::first_from(ctx, Some(&at), false))?;
        Ok(self.land(found))
    }

    /// Moves to the previous key; the last one for an unpositioned cursor.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn prev(&mut self) -> CoreResult<Option<KeyValuePair>> {
        let Some(at) = self.position.clone() else {
            return self.last();
        };
        let found = self
            .db
            .run(self.txn, false, |ctx| tree::last_before(ctx, Some(&at)))?;
        Ok(self.land(found))
    }

    /// Moves to the smallest key `>= key`.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn seek(&mut self, key: &[u8]) -> CoreResult<Option<KeyValuePair>> {
        let found = self
            .db
            .run(self.txn, false, |ctx| tree::first_from(ctx, Some(key), true))?;
        Ok(self.land(found))
    }

    /// Moves to exactly `key` if it exists.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn seek_exact(&mut self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let value = self.db.run(self.txn, false, |ctx| tree::get(ctx, key))?;
        if value.is_some() {
            self.position = Some(key.to_vec());
        }
        Ok(value)
    }

    /// Re-reads the record under the cursor. `None` if it was deleted or
    /// the cursor is unpositioned.
    ///
    /// # Errors
    ///
    /// Lock, handle and I/O errors from the read.
    pub fn current(&mut self) -> CoreResult<Option<KeyValuePair>> {
        let Some(at) = self.position.clone() else {
            return Ok(None);
        };
        let value = self.db.run(self.txn, false, |ctx| tree::get(ctx, &at))?;
        Ok(value.map(|v| (at, v)))
    }

    /// Deletes the record under the cursor. The position is kept, so
    /// `next` and `prev` continue from the deleted key.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for an unpositioned cursor, `KeyNotFound` if the
    /// record is already gone, plus lock and I/O errors.
    pub fn delete_current(&mut self) -> CoreResult<()> {
        let Some(at) = self.position.clone() else {
            return Err(CoreError::invalid_operation("cursor is not positioned"));
        };
        self.db.run(self.txn, true, |ctx| tree::delete(ctx, &at))
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.db.name())
            .field("txid", &self.txn.id())
            .field("position", &self.position)
            .finish()
    }
}
