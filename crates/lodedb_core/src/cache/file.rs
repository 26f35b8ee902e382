//! Page-granular access to one database file.

use crate::error::{CoreError, CoreResult};
use crate::page::Page;
use crate::types::{FileId, PageNo};
use lodedb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// A database file viewed as an array of fixed-size pages.
pub struct PageFile {
    id: FileId,
    name: String,
    path: Option<PathBuf>,
    page_size: usize,
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl PageFile {
    /// Opens an existing database file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file does not exist or cannot be opened.
    pub fn open(id: FileId, name: &str, path: &Path, page_size: usize) -> CoreResult<Self> {
        let backend = FileBackend::open_existing(path)?;
        Ok(Self::with_backend(id, name, Some(path), page_size, Box::new(backend)))
    }

    /// Creates (or opens) a database file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be created.
    pub fn create(id: FileId, name: &str, path: &Path, page_size: usize) -> CoreResult<Self> {
        let backend = FileBackend::open(path)?;
        Ok(Self::with_backend(id, name, Some(path), page_size, Box::new(backend)))
    }

    /// Creates a database file held in memory.
    #[must_use]
    pub fn in_memory(id: FileId, name: &str, page_size: usize) -> Self {
        Self::with_backend(id, name, None, page_size, Box::new(InMemoryBackend::new()))
    }

    fn with_backend(
        id: FileId,
        name: &str,
        path: Option<&Path>,
        page_size: usize,
        backend: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            path: path.map(Path::to_path_buf),
            page_size,
            backend: Mutex::new(backend),
        }
    }

    /// File identifier.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path on disk (`None` in memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads a page. Returns `None` for pages past the end of the file.
    ///
    /// A page only partly present (a torn file extension) is zero-filled.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure.
    pub fn read_page(&self, pgno: PageNo) -> CoreResult<Option<Page>> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let offset = u64::from(pgno) * self.page_size as u64;
        if offset >= size {
            return Ok(None);
        }
        let available = (size - offset).min(self.page_size as u64) as usize;
        let mut bytes = backend.read_at(offset, available)?;
        bytes.resize(self.page_size, 0);
        Ok(Some(Page::from_bytes(bytes)))
    }

    /// Writes a page in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a page of the wrong size, or a storage
    /// error on I/O failure.
    pub fn write_page(&self, pgno: PageNo, page: &Page) -> CoreResult<()> {
        if page.size() != self.page_size {
            return Err(CoreError::invalid_argument(format!(
                "page of {} bytes written to file with {} byte pages",
                page.size(),
                self.page_size
            )));
        }
        let offset = u64::from(pgno) * self.page_size as u64;
        self.backend.lock().write_at(offset, page.as_bytes())?;
        Ok(())
    }

    /// Number of whole pages in the file.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure.
    pub fn page_count(&self) -> CoreResult<u32> {
        let size = self.backend.lock().size()?;
        Ok((size / self.page_size as u64) as u32)
    }

    /// Forces written pages to stable storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
