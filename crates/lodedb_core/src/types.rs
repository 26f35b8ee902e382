//! Core type definitions for LodeDB.

use std::fmt;

/// Log sequence number: the position of a record in the log file set.
///
/// LSNs order first by log file number, then by byte offset inside the
/// file. Every log file starts with a header, so no record lives at offset
/// zero and [`Lsn::ZERO`] can stand for "no record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    file: u32,
    offset: u32,
}

impl Lsn {
    /// The null LSN.
    pub const ZERO: Self = Self { file: 0, offset: 0 };

    /// Largest possible LSN.
    pub const MAX: Self = Self {
        file: u32::MAX,
        offset: u32::MAX,
    };

    /// Creates an LSN from a log file number and offset.
    #[must_use]
    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Returns the log file number.
    #[must_use]
    pub const fn file(self) -> u32 {
        self.file
    }

    /// Returns the byte offset inside the log file.
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    /// Returns true for the null LSN.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.file == 0 && self.offset == 0
    }

    /// Packs the LSN into a `u64` (file in the high half).
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.file as u64) << 32) | self.offset as u64
    }

    /// Unpacks an LSN produced by [`Lsn::to_u64`].
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            file: (raw >> 32) as u32,
            offset: raw as u32,
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.offset)
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused within an
/// environment, including across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number for ordering commits.
///
/// Every commit gets the next sequence number; snapshot transactions read
/// the state as of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identifier of a database file inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
    /// Creates a new file ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Page number inside a database file.
pub type PageNo = u32;

/// Address of a page across the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    /// The database file.
    pub file: FileId,
    /// The page inside that file.
    pub pgno: PageNo,
}

impl PageKey {
    /// Creates a page address.
    #[must_use]
    pub const fn new(file: FileId, pgno: PageNo) -> Self {
        Self { file, pgno }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.pgno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_orders_by_file_then_offset() {
        assert!(Lsn::new(1, 900) < Lsn::new(2, 16));
        assert!(Lsn::new(2, 16) < Lsn::new(2, 17));
        assert!(Lsn::ZERO < Lsn::new(1, 16));
        assert!(Lsn::ZERO.is_zero());
    }

    #[test]
    fn lsn_packs_into_u64() {
        let lsn = Lsn::new(7, 4096);
        assert_eq!(Lsn::from_u64(lsn.to_u64()), lsn);
        assert!(Lsn::new(1, u32::MAX).to_u64() < Lsn::new(2, 0).to_u64());
    }

    #[test]
    fn display_formats() {
        assert_eq!(Lsn::new(3, 120).to_string(), "3/120");
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
        assert_eq!(SequenceNumber::new(9).to_string(), "seq:9");
        assert_eq!(PageKey::new(FileId::new(2), 17).to_string(), "2:17");
    }

    #[test]
    fn sequence_next() {
        assert_eq!(SequenceNumber::new(1).next(), SequenceNumber::new(2));
    }
}
