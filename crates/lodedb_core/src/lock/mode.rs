//! Lock modes and lockable resources.

use crate::types::{FileId, PageKey};
use std::fmt;

/// Lock mode.
///
/// The intention modes let a transaction announce page-level locking under
/// a database-level lock. Compatibility:
///
/// ```text
///            IR   IW   R    RIW  W
///   IR       y    y    y    y    n
///   IW       y    y    n    n    n
///   R        y    n    y    n    n
///   RIW      y    n    n    n    n
///   W        n    n    n    n    n
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intention to read below this resource.
    IntentRead,
    /// Intention to write below this resource.
    IntentWrite,
    /// Shared.
    Read,
    /// Shared with intention to write below.
    ReadIntentWrite,
    /// Exclusive.
    Write,
}

impl LockMode {
    /// Returns true if a lock in `self` can be held alongside `other`.
    #[must_use]
    pub fn compatible(self, other: Self) -> bool {
        use LockMode::{IntentRead, IntentWrite, Read, Write};
        match (self, other) {
            (Write, _) | (_, Write) => false,
            (IntentRead, _) | (_, IntentRead) => true,
            (IntentWrite, IntentWrite) | (Read, Read) => true,
            _ => false,
        }
    }

    /// Returns true if holding `self` already grants `other`.
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        use LockMode::{IntentRead, IntentWrite, Read, ReadIntentWrite, Write};
        match (self, other) {
            (a, b) if a == b => true,
            (Write, _) => true,
            (ReadIntentWrite, IntentRead | IntentWrite | Read) => true,
            (Read | IntentWrite, IntentRead) => true,
            _ => false,
        }
    }

    /// The weakest mode that covers both `self` and `other`.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            // Only Read and IntentWrite are incomparable below Write.
            match (self, other) {
                (LockMode::Read, LockMode::IntentWrite)
                | (LockMode::IntentWrite, LockMode::Read) => LockMode::ReadIntentWrite,
                _ => LockMode::Write,
            }
        }
    }

    /// Returns true for the modes released early by read-committed
    /// transactions.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, LockMode::Read | LockMode::IntentRead)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IntentRead => "IR",
            Self::IntentWrite => "IW",
            Self::Read => "R",
            Self::ReadIntentWrite => "RIW",
            Self::Write => "W",
        };
        f.write_str(s)
    }
}

/// Something that can be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// A whole database file.
    Database(FileId),
    /// One page.
    Page(PageKey),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(file) => write!(f, "database {file}"),
            Self::Page(key) => write!(f, "page {key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    const ALL: [LockMode; 5] = [IntentRead, IntentWrite, Read, ReadIntentWrite, Write];

    #[test]
    fn compatibility_matrix() {
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, a) in ALL.iter().enumerate() {
            for (j, b) in ALL.iter().enumerate() {
                assert_eq!(a.compatible(*b), expected[i][j], "{a} vs {b}");
            }
        }
    }

    #[test]
    fn join_is_least_upper_bound() {
        assert_eq!(Read.join(IntentWrite), ReadIntentWrite);
        assert_eq!(IntentRead.join(Read), Read);
        assert_eq!(Read.join(Write), Write);
        assert_eq!(ReadIntentWrite.join(IntentWrite), ReadIntentWrite);
        for a in ALL {
            for b in ALL {
                let j = a.join(b);
                assert!(j.covers(a) && j.covers(b), "{a} join {b} = {j}");
            }
        }
    }

    #[test]
    fn read_modes() {
        assert!(Read.is_read());
        assert!(IntentRead.is_read());
        assert!(!Write.is_read());
        assert!(!ReadIntentWrite.is_read());
    }

    #[test]
    fn resource_display() {
        let page = LockResource::Page(PageKey::new(FileId::new(2), 7));
        assert_eq!(page.to_string(), "page 2:7");
        assert_eq!(LockResource::Database(FileId::new(3)).to_string(), "database file:3");
    }
}
