//! Decoded B-tree nodes and their page encoding.
//!
//! ## Leaf body
//!
//! ```text
//! repeated: [key_len: u16 LE][key][tag: u8][value]
//!   tag 0: [len: u32 LE][bytes]          inline value
//!   tag 1: [pgno: u32 LE][len: u32 LE]   overflow chain
//! ```
//!
//! The header's `next` field links leaves left to right.
//!
//! ## Internal body
//!
//! ```text
//! [first_child: u32 LE]
//! repeated: [key_len: u16 LE][key][child: u32 LE]
//! ```
//!
//! Child `i` (for `i > 0`) holds keys `>= key[i-1]` and `< key[i]`; the
//! first child holds keys below the first separator.

use crate::error::{CoreError, CoreResult};
use crate::page::{Page, PageType};
use crate::types::{PageKey, PageNo};

const TAG_INLINE: u8 = 0;
const TAG_OVERFLOW: u8 = 1;

/// A leaf value: stored in the leaf or in an overflow chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Inline(Vec<u8>),
    Overflow { pgno: PageNo, len: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Value,
}

impl LeafEntry {
    pub fn encoded_len(&self) -> usize {
        2 + self.key.len()
            + 1
            + match &self.value {
                Value::Inline(v) => 4 + v.len(),
                Value::Overflow { .. } => 8,
            }
    }
}

/// Encoded size of a leaf entry with an inline value.
pub(crate) fn inline_entry_len(key: &[u8], value: &[u8]) -> usize {
    2 + key.len() + 1 + 4 + value.len()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Leaf {
    pub entries: Vec<LeafEntry>,
    pub next: PageNo,
}

impl Leaf {
    /// `Ok(i)` if `key` is entry `i`, `Err(i)` where it would be inserted.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    pub fn encoded_len(&self) -> usize {
        self.entries.iter().map(LeafEntry::encoded_len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Internal {
    pub level: u8,
    pub first: PageNo,
    pub entries: Vec<(Vec<u8>, PageNo)>,
}

impl Internal {
    /// Index of the child covering `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() <= key)
    }

    pub fn child(&self, idx: usize) -> PageNo {
        if idx == 0 {
            self.first
        } else {
            self.entries[idx - 1].1
        }
    }

    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    pub fn children(&self) -> impl Iterator<Item = PageNo> + '_ {
        std::iter::once(self.first).chain(self.entries.iter().map(|(_, c)| *c))
    }

    /// Removes child `idx`. Removing the first child promotes the second
    /// and drops its separator.
    pub fn remove_child(&mut self, idx: usize) {
        if idx == 0 {
            self.first = self.entries.remove(0).1;
        } else {
            self.entries.remove(idx - 1);
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|(k, _)| 2 + k.len() + 4)
            .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

impl Node {
    pub fn level(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Internal(n) => n.level,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Leaf(l) => l.encoded_len(),
            Self::Internal(n) => n.encoded_len(),
        }
    }

    pub fn decode(page: &Page, key: PageKey) -> CoreResult<Self> {
        let body = page.body();
        let count = page.entry_count() as usize;
        let mut r = BodyReader { body, pos: 0, key };
        match page.page_type()? {
            PageType::Leaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = r.u16()? as usize;
                    let k = r.bytes(key_len)?.to_vec();
                    let value = match r.u8()? {
                        TAG_INLINE => {
                            let len = r.u32()? as usize;
                            Value::Inline(r.bytes(len)?.to_vec())
                        }
                        TAG_OVERFLOW => Value::Overflow {
                            pgno: r.u32()?,
                            len: r.u32()?,
                        },
                        tag => return Err(r.error(format!("unknown value tag {tag}"))),
                    };
                    entries.push(LeafEntry { key: k, value });
                }
                r.finish()?;
                Ok(Self::Leaf(Leaf {
                    entries,
                    next: page.next(),
                }))
            }
            PageType::Internal => {
                let first = r.u32()?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = r.u16()? as usize;
                    let k = r.bytes(key_len)?.to_vec();
                    entries.push((k, r.u32()?));
                }
                r.finish()?;
                Ok(Self::Internal(Internal {
                    level: page.level(),
                    first,
                    entries,
                }))
            }
            other => Err(CoreError::invalid_format(format!(
                "page {key}: expected a tree node, found {other:?}"
            ))),
        }
    }

    /// Rewrites `page` to hold this node. The page LSN and number are kept.
    pub fn encode_into(&self, page: &mut Page) -> CoreResult<()> {
        let mut body = Vec::with_capacity(self.encoded_len());
        match self {
            Self::Leaf(leaf) => {
                for e in &leaf.entries {
                    body.extend_from_slice(&(e.key.len() as u16).to_le_bytes());
                    body.extend_from_slice(&e.key);
                    match &e.value {
                        Value::Inline(v) => {
                            body.push(TAG_INLINE);
                            body.extend_from_slice(&(v.len() as u32).to_le_bytes());
                            body.extend_from_slice(v);
                        }
                        Value::Overflow { pgno, len } => {
                            body.push(TAG_OVERFLOW);
                            body.extend_from_slice(&pgno.to_le_bytes());
                            body.extend_from_slice(&len.to_le_bytes());
                        }
                    }
                }
                page.init(PageType::Leaf, 0);
                page.set_body(&body)?;
                page.set_entry_count(leaf.entries.len() as u16);
                page.set_next(leaf.next);
            }
            Self::Internal(node) => {
                body.extend_from_slice(&node.first.to_le_bytes());
                for (k, child) in &node.entries {
                    body.extend_from_slice(&(k.len() as u16).to_le_bytes());
                    body.extend_from_slice(k);
                    body.extend_from_slice(&child.to_le_bytes());
                }
                page.init(PageType::Internal, node.level);
                page.set_body(&body)?;
                page.set_entry_count(node.entries.len() as u16);
            }
        }
        Ok(())
    }
}

struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
    key: PageKey,
}

impl<'a> BodyReader<'a> {
    fn error(&self, message: String) -> CoreError {
        CoreError::invalid_format(format!("page {}: {message}", self.key))
    }

    fn bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.body.len() {
            return Err(self.error(format!("entry runs past body end at {}", self.pos)));
        }
        let out = &self.body[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn finish(&self) -> CoreResult<()> {
        if self.pos != self.body.len() {
            return Err(self.error(format!(
                "{} trailing body bytes",
                self.body.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    fn key() -> PageKey {
        PageKey::new(FileId::new(1), 4)
    }

    #[test]
    fn leaf_encoding() {
        let leaf = Node::Leaf(Leaf {
            entries: vec![
                LeafEntry {
                    key: b"a".to_vec(),
                    value: Value::Inline(b"one".to_vec()),
                },
                LeafEntry {
                    key: b"b".to_vec(),
                    value: Value::Overflow { pgno: 9, len: 5000 },
                },
            ],
            next: 12,
        });
        let mut page = Page::new(512);
        leaf.encode_into(&mut page).unwrap();
        assert_eq!(page.body_len(), leaf.encoded_len());
        assert_eq!(page.next(), 12);
        assert_eq!(Node::decode(&page, key()).unwrap(), leaf);
    }

    #[test]
    fn internal_routing() {
        let node = Internal {
            level: 1,
            first: 2,
            entries: vec![(b"g".to_vec(), 3), (b"p".to_vec(), 4)],
        };
        assert_eq!(node.child(node.child_index(b"a")), 2);
        assert_eq!(node.child(node.child_index(b"g")), 3);
        assert_eq!(node.child(node.child_index(b"o")), 3);
        assert_eq!(node.child(node.child_index(b"z")), 4);
        assert_eq!(node.children().collect::<Vec<_>>(), vec![2, 3, 4]);

        let mut page = Page::new(512);
        Node::Internal(node.clone()).encode_into(&mut page).unwrap();
        assert_eq!(page.level(), 1);
        assert_eq!(Node::decode(&page, key()).unwrap(), Node::Internal(node));
    }

    #[test]
    fn leaf_search() {
        let leaf = Leaf {
            entries: ["b", "d"]
                .iter()
                .map(|k| LeafEntry {
                    key: k.as_bytes().to_vec(),
                    value: Value::Inline(Vec::new()),
                })
                .collect(),
            next: 0,
        };
        assert_eq!(leaf.search(b"b"), Ok(0));
        assert_eq!(leaf.search(b"c"), Err(1));
        assert_eq!(leaf.search(b"z"), Err(2));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut page = Page::new(512);
        page.init(PageType::Leaf, 0);
        page.set_body(&[5, 0, b'a']).unwrap();
        page.set_entry_count(1);
        assert!(matches!(
            Node::decode(&page, key()),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn wrong_page_type_is_rejected() {
        let mut page = Page::new(512);
        page.init(PageType::Overflow, 0);
        assert!(Node::decode(&page, key()).is_err());
    }
}
