//! Database metadata page (page 0).
//!
//! ```text
//! [0..4]   magic "LDBM"
//! [4..6]   format version: u16 LE
//! [6..8]   reserved
//! [8..12]  page size: u32 LE
//! [12..16] root page: u32 LE (always 1)
//! [16..20] last allocated page: u32 LE
//! [20..24] free-list head: u32 LE (0 = empty)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::page::{Page, PageType};
use crate::types::PageNo;

/// Magic bytes at the start of the metadata body.
pub const META_MAGIC: &[u8; 4] = b"LDBM";

/// Current database format version.
pub const META_VERSION: u16 = 1;

/// Page number of the metadata page.
pub const META_PGNO: PageNo = 0;

/// Page number of the root; root splits keep it in place.
pub const ROOT_PGNO: PageNo = 1;

const META_BODY_SIZE: usize = 24;

/// Decoded metadata page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    /// Page size the file was created with.
    pub page_size: u32,
    /// Root page number.
    pub root: PageNo,
    /// Highest page number handed out so far.
    pub last_pgno: PageNo,
    /// First page of the free list.
    pub free_head: PageNo,
}

impl MetaPage {
    /// Metadata of a fresh database: a root leaf and nothing else.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            root: ROOT_PGNO,
            last_pgno: ROOT_PGNO,
            free_head: 0,
        }
    }

    /// Reads the metadata from page 0.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a wrong page type, bad magic or an
    /// unsupported version.
    pub fn decode(page: &Page) -> CoreResult<Self> {
        if page.page_type()? != PageType::Meta {
            return Err(CoreError::invalid_format("page 0 is not a metadata page"));
        }
        let b = page.body();
        if b.len() < META_BODY_SIZE || &b[0..4] != META_MAGIC {
            return Err(CoreError::invalid_format("bad database magic"));
        }
        let version = u16::from_le_bytes([b[4], b[5]]);
        if version > META_VERSION {
            return Err(CoreError::invalid_format(format!(
                "database format version {version} is newer than supported {META_VERSION}"
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
        Ok(Self {
            page_size: u32_at(8),
            root: u32_at(12),
            last_pgno: u32_at(16),
            free_head: u32_at(20),
        })
    }

    /// Rewrites page 0 with this metadata.
    ///
    /// # Errors
    ///
    /// Propagates body size errors (never for valid page sizes).
    pub fn encode_into(&self, page: &mut Page) -> CoreResult<()> {
        let mut b = Vec::with_capacity(META_BODY_SIZE);
        b.extend_from_slice(META_MAGIC);
        b.extend_from_slice(&META_VERSION.to_le_bytes());
        b.extend_from_slice(&[0, 0]);
        b.extend_from_slice(&self.page_size.to_le_bytes());
        b.extend_from_slice(&self.root.to_le_bytes());
        b.extend_from_slice(&self.last_pgno.to_le_bytes());
        b.extend_from_slice(&self.free_head.to_le_bytes());
        page.init(PageType::Meta, 0);
        page.set_body(&b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let mut meta = MetaPage::new(4096);
        meta.last_pgno = 17;
        meta.free_head = 9;
        let mut page = Page::new(4096);
        meta.encode_into(&mut page).unwrap();
        assert_eq!(MetaPage::decode(&page).unwrap(), meta);
    }

    #[test]
    fn rejects_other_pages() {
        let mut page = Page::new(512);
        page.init(PageType::Leaf, 0);
        assert!(MetaPage::decode(&page).is_err());

        let mut page = Page::new(512);
        page.init(PageType::Meta, 0);
        page.set_body(b"NOPE............................").unwrap();
        assert!(MetaPage::decode(&page).is_err());
    }
}
