//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store.
///
/// LodeDB uses one backend per database file (fixed-size pages written in
/// place with [`write_at`](Self::write_at)) and one per log file (records
/// added with [`append`](Self::append)). The backend never interprets the
/// bytes.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `write_at` past the end grows the store, zero-filling any gap
/// - `read_at` returns exactly the bytes previously written at that offset
/// - Data is only guaranteed durable after `sync` returns
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, overwriting existing bytes.
    ///
    /// Writing past the current end grows the store; any gap between the
    /// old end and `offset` reads back as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// This does not make data durable; see [`sync`](Self::sync).
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used to cut a torn log tail after a crash, to roll back a replica's
    /// log, and to shrink a database file after truncation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `new_size` is greater than current size
    /// - The truncation fails
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
