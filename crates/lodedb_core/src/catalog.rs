//! Class catalogs.
//!
//! A catalog maps a serialized type description (a "format") to a short
//! id stored with every record, and back. The engine only sees the
//! [`ClassCatalog`] trait; bindings plug in whatever storage they like.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Maps class formats to stored ids and back.
pub trait ClassCatalog: Send + Sync {
    /// Returns the id under which `format` is stored, assigning one if
    /// needed.
    fn identify(&self, format: &[u8]) -> Vec<u8>;

    /// Returns the format stored under `id`.
    fn resolve(&self, id: &[u8]) -> Option<Vec<u8>>;
}

/// A catalog that hands out fresh ids and remembers nothing.
///
/// Ids count down from `i64::MAX` and are encoded big-endian, so they
/// never collide with the small ids a persistent catalog allocates.
#[derive(Debug)]
pub struct NullClassCatalog {
    next: Mutex<i64>,
}

impl NullClassCatalog {
    /// Creates a catalog whose first id is `i64::MAX`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: Mutex::new(i64::MAX),
        }
    }
}

impl Default for NullClassCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassCatalog for NullClassCatalog {
    fn identify(&self, _format: &[u8]) -> Vec<u8> {
        let mut next = self.next.lock();
        let id = *next;
        *next -= 1;
        id.to_be_bytes().to_vec()
    }

    fn resolve(&self, _id: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_format: HashMap<Vec<u8>, Vec<u8>>,
    by_id: HashMap<Vec<u8>, Vec<u8>>,
    next: u64,
}

/// A catalog kept in memory: one id per distinct format.
#[derive(Debug, Default)]
pub struct MemoryClassCatalog {
    entries: Mutex<Entries>,
}

impl MemoryClassCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of formats known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().by_id.len()
    }

    /// True if no format has been identified yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassCatalog for MemoryClassCatalog {
    fn identify(&self, format: &[u8]) -> Vec<u8> {
        let mut st = self.entries.lock();
        if let Some(id) = st.by_format.get(format) {
            return id.clone();
        }
        st.next += 1;
        let id = st.next.to_be_bytes().to_vec();
        st.by_format.insert(format.to_vec(), id.clone());
        st.by_id.insert(id.clone(), format.to_vec());
        id
    }

    fn resolve(&self, id: &[u8]) -> Option<Vec<u8>> {
        self.entries.lock().by_id.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_catalog_counts_down_from_max() {
        let catalog = NullClassCatalog::new();
        assert_eq!(catalog.identify(b"a"), i64::MAX.to_be_bytes().to_vec());
        assert_eq!(catalog.identify(b"a"), (i64::MAX - 1).to_be_bytes().to_vec());
        assert_eq!(catalog.resolve(&i64::MAX.to_be_bytes()), None);
    }

    #[test]
    fn memory_catalog_is_stable() {
        let catalog = MemoryClassCatalog::new();
        let a = catalog.identify(b"class A");
        let b = catalog.identify(b"class B");
        assert_ne!(a, b);
        assert_eq!(catalog.identify(b"class A"), a);
        assert_eq!(catalog.resolve(&b).as_deref(), Some(&b"class B"[..]));
        assert_eq!(catalog.resolve(b"nope"), None);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn catalogs_work_behind_the_trait() {
        let catalogs: Vec<Box<dyn ClassCatalog>> = vec![
            Box::new(NullClassCatalog::new()),
            Box::new(MemoryClassCatalog::new()),
        ];
        for catalog in &catalogs {
            assert_eq!(catalog.identify(b"fmt").len(), 8);
        }
    }
}
