//! Fixed-size page layout.
//!
//! Every page in a database file shares a 32 byte header:
//!
//! ```text
//! [0..4]   lsn file number    u32 LE
//! [4..8]   lsn offset         u32 LE
//! [8..12]  page number        u32 LE (stamped at write-out)
//! [12..16] crc32 checksum     u32 LE (over the page with this field skipped)
//! [16]     page type          u8
//! [17]     level              u8 (0 for leaves, >= 1 for internal pages)
//! [18..20] entry count        u16 LE
//! [20..24] next page          u32 LE (leaf sibling, overflow chain, free list)
//! [24..28] body length        u32 LE
//! [28..32] reserved
//! [32..]   body
//! ```
//!
//! The LSN, page number and checksum are owned by the cache and the log;
//! log records describe changes to bytes `16..` only.

use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, PageKey, PageNo};
use std::ops::Range;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 32;

/// First byte covered by page-change log records.
pub const LOGGED_START: usize = 16;

const CHECKSUM_RANGE: Range<usize> = 12..16;

/// Discriminant values for page types stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Never initialized (all zero).
    Unused = 0,
    /// Database metadata (page 0).
    Meta = 1,
    /// B-tree internal page.
    Internal = 2,
    /// B-tree leaf page.
    Leaf = 3,
    /// Overflow chunk of a large value.
    Overflow = 4,
    /// Page on the free list.
    Free = 5,
}

impl PageType {
    /// Converts a byte to a page type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unused),
            1 => Some(Self::Meta),
            2 => Some(Self::Internal),
            3 => Some(Self::Leaf),
            4 => Some(Self::Overflow),
            5 => Some(Self::Free),
            _ => None,
        }
    }

    /// Converts the page type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// An in-memory copy of one page.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    buf: Box<[u8]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.buf.len())
            .field("lsn", &self.lsn())
            .field("type", &self.buf[16])
            .field("level", &self.level())
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

impl Page {
    /// Creates a zero-filled page.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Wraps raw page bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buf: bytes.into_boxed_slice(),
        }
    }

    /// Returns the page size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Raw page bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw page bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// LSN of the last log record applied to this page.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        Lsn::new(read_u32(&self.buf, 0), read_u32(&self.buf, 4))
    }

    /// Sets the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        write_u32(&mut self.buf, 0, lsn.file());
        write_u32(&mut self.buf, 4, lsn.offset());
    }

    /// Page number stamped at the last write-out.
    #[must_use]
    pub fn pgno(&self) -> PageNo {
        read_u32(&self.buf, 8)
    }

    /// Stamps the page number.
    pub fn set_pgno(&mut self, pgno: PageNo) {
        write_u32(&mut self.buf, 8, pgno);
    }

    /// Reads the page type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for an unknown discriminant.
    pub fn page_type(&self) -> CoreResult<PageType> {
        PageType::from_byte(self.buf[16]).ok_or_else(|| {
            CoreError::invalid_format(format!("invalid page type {}", self.buf[16]))
        })
    }

    /// Tree level (0 = leaf).
    #[must_use]
    pub fn level(&self) -> u8 {
        self.buf[17]
    }

    /// Number of entries on the page.
    #[must_use]
    pub fn entry_count(&self) -> u16 {
        read_u16(&self.buf, 18)
    }

    /// Sets the number of entries on the page.
    pub fn set_entry_count(&mut self, count: u16) {
        write_u16(&mut self.buf, 18, count);
    }

    /// Next page in the sibling, overflow or free chain (0 = none).
    #[must_use]
    pub fn next(&self) -> PageNo {
        read_u32(&self.buf, 20)
    }

    /// Sets the next page link.
    pub fn set_next(&mut self, next: PageNo) {
        write_u32(&mut self.buf, 20, next);
    }

    /// Bytes of body in use.
    #[must_use]
    pub fn body_len(&self) -> usize {
        read_u32(&self.buf, 24) as usize
    }

    /// Body capacity for this page size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len() - PAGE_HEADER_SIZE
    }

    /// The used part of the body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        let len = self.body_len().min(self.capacity());
        &self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]
    }

    /// Resets type, level, counters and body, keeping LSN and page number.
    pub fn init(&mut self, page_type: PageType, level: u8) {
        self.buf[16] = page_type.as_byte();
        self.buf[17] = level;
        self.buf[18..].fill(0);
    }

    /// Replaces the body, updating the body length.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `body` exceeds the page capacity.
    pub fn set_body(&mut self, body: &[u8]) -> CoreResult<()> {
        if body.len() > self.capacity() {
            return Err(CoreError::invalid_argument(format!(
                "page body of {} bytes exceeds capacity {}",
                body.len(),
                self.capacity()
            )));
        }
        let end = PAGE_HEADER_SIZE + body.len();
        self.buf[PAGE_HEADER_SIZE..end].copy_from_slice(body);
        self.buf[end..].fill(0);
        write_u32(&mut self.buf, 24, body.len() as u32);
        Ok(())
    }

    /// True if the page has never been written.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.buf.iter().all(|&b| b == 0)
    }

    /// Computes the CRC-32 of the page, skipping the checksum field.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf[..CHECKSUM_RANGE.start]);
        hasher.update(&self.buf[CHECKSUM_RANGE.end..]);
        hasher.finalize()
    }

    /// Stored checksum.
    #[must_use]
    pub fn stored_checksum(&self) -> u32 {
        read_u32(&self.buf, CHECKSUM_RANGE.start)
    }

    /// Stamps page number and checksum before write-out.
    pub fn seal(&mut self, pgno: PageNo) {
        self.set_pgno(pgno);
        let crc = self.compute_checksum();
        write_u32(&mut self.buf, CHECKSUM_RANGE.start, crc);
    }

    /// Verifies checksum and page number of a page read from disk.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` on a bad checksum and `InvalidFormat` if
    /// the page carries another page's number.
    pub fn verify(&self, key: PageKey) -> CoreResult<()> {
        if self.is_unused() {
            return Ok(());
        }
        let expected = self.stored_checksum();
        let actual = self.compute_checksum();
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                page: key,
                expected,
                actual,
            });
        }
        if self.pgno() != key.pgno {
            return Err(CoreError::invalid_format(format!(
                "page {key} carries page number {}",
                self.pgno()
            )));
        }
        Ok(())
    }
}

/// Byte range in which two images of the same page differ.
///
/// Only the logged part of the page (`LOGGED_START..`) is compared.
#[must_use]
pub fn changed_range(before: &[u8], after: &[u8]) -> Option<Range<usize>> {
    debug_assert_eq!(before.len(), after.len());
    let first = (LOGGED_START..before.len()).find(|&i| before[i] != after[i])?;
    let last = (first..before.len())
        .rev()
        .find(|&i| before[i] != after[i])
        .unwrap_or(first);
    Some(first..last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    #[test]
    fn header_fields() {
        let mut page = Page::new(512);
        page.init(PageType::Leaf, 0);
        page.set_lsn(Lsn::new(3, 77));
        page.set_entry_count(5);
        page.set_next(9);

        assert_eq!(page.lsn(), Lsn::new(3, 77));
        assert_eq!(page.page_type().unwrap(), PageType::Leaf);
        assert_eq!(page.entry_count(), 5);
        assert_eq!(page.next(), 9);
        assert_eq!(page.capacity(), 512 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn init_keeps_lsn() {
        let mut page = Page::new(512);
        page.set_lsn(Lsn::new(1, 100));
        page.init(PageType::Internal, 2);
        page.set_body(b"abc").unwrap();
        page.init(PageType::Free, 0);
        assert_eq!(page.lsn(), Lsn::new(1, 100));
        assert_eq!(page.body_len(), 0);
        assert_eq!(page.page_type().unwrap(), PageType::Free);
    }

    #[test]
    fn body_too_large_is_rejected() {
        let mut page = Page::new(512);
        assert!(page.set_body(&[1u8; 480]).is_ok());
        assert!(page.set_body(&[1u8; 481]).is_err());
    }

    #[test]
    fn seal_and_verify() {
        let key = PageKey::new(FileId::new(1), 4);
        let mut page = Page::new(512);
        page.init(PageType::Leaf, 0);
        page.set_body(b"hello").unwrap();
        page.seal(4);
        assert!(page.verify(key).is_ok());

        page.as_bytes_mut()[40] ^= 0xff;
        assert!(matches!(
            page.verify(key),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn verify_detects_misplaced_page() {
        let mut page = Page::new(512);
        page.init(PageType::Leaf, 0);
        page.seal(7);
        let err = page.verify(PageKey::new(FileId::new(1), 8)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }

    #[test]
    fn zero_page_verifies() {
        let page = Page::new(1024);
        assert!(page.is_unused());
        assert!(page.verify(PageKey::new(FileId::new(1), 3)).is_ok());
    }

    #[test]
    fn changed_range_ignores_header_bookkeeping() {
        let mut a = Page::new(512);
        a.init(PageType::Leaf, 0);
        let mut b = a.clone();
        b.set_lsn(Lsn::new(9, 9));
        assert_eq!(changed_range(a.as_bytes(), b.as_bytes()), None);

        b.set_body(b"xyz").unwrap();
        let range = changed_range(a.as_bytes(), b.as_bytes()).unwrap();
        assert_eq!(range.start, 24);
        assert_eq!(range.end, PAGE_HEADER_SIZE + 3);
    }

    #[test]
    fn changed_range_covers_entry_count_and_next() {
        let mut a = Page::new(512);
        a.init(PageType::Leaf, 0);
        let mut b = a.clone();
        b.set_entry_count(7);
        assert_eq!(changed_range(a.as_bytes(), b.as_bytes()), Some(18..20));

        b.set_next(42);
        let range = changed_range(a.as_bytes(), b.as_bytes()).unwrap();
        assert_eq!(range.start, 18);
        assert!(range.end >= 21);

        let mut applied = a.clone();
        applied.as_bytes_mut()[range.clone()].copy_from_slice(&b.as_bytes()[range]);
        assert_eq!(applied.entry_count(), 7);
        assert_eq!(applied.next(), 42);
    }
}
