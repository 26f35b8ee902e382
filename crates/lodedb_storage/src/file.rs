//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_data()`, and `sync_all()` when the file
///   length changed since the previous sync
///
/// # Thread Safety
///
/// Reads and writes share one file cursor, so both go through an internal
/// mutex.
///
/// # Example
///
/// ```no_run
/// use lodedb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("accounts.db")).unwrap();
/// backend.write_at(0, &[0u8; 4096]).unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: RwLock<u64>,
    /// File length at the last full sync. `None` forces the next sync to
    /// persist metadata.
    synced_size: Option<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: RwLock::new(size),
            synced_size: Some(size),
        })
    }

    /// Opens an existing file, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: RwLock::new(size),
            synced_size: Some(size),
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock();
        let mut size = self.size.write();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size = (*size).max(offset + data.len() as u64);

        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.lock();
        let mut size = self.size.write();

        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size += data.len() as u64;

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let size = *self.size.read();
        let file = self.file.lock();
        if self.synced_size == Some(size) {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        drop(file);
        self.synced_size = Some(size);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.lock();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: *size,
            });
        }

        self.synced_size = None;
        file.set_len(new_size)?;
        *size = new_size;
        file.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        assert!(FileBackend::open_existing(&path).is_err());

        FileBackend::open(&path).unwrap();
        assert!(FileBackend::open_existing(&path).is_ok());
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0000000001");

        let mut backend = FileBackend::open(&path).unwrap();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello world");
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(0, &[1u8; 16]).unwrap();
        backend.write_at(4, &[9u8; 4]).unwrap();

        let data = backend.read_at(0, 16).unwrap();
        assert_eq!(&data[..4], &[1, 1, 1, 1]);
        assert_eq!(&data[4..8], &[9, 9, 9, 9]);
        assert_eq!(&data[8..], &[1u8; 8]);
        assert_eq!(backend.size().unwrap(), 16);
    }

    #[test]
    fn write_at_past_end_zero_fills_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sparse.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.write_at(8, b"tail").unwrap();

        assert_eq!(backend.size().unwrap(), 12);
        assert_eq!(backend.read_at(0, 8).unwrap(), vec![0u8; 8]);
        assert_eq!(backend.read_at(8, 4).unwrap(), b"tail");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.write_at(0, b"persistent page").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent page");
    }

    #[test]
    fn truncate_shrinks_and_rejects_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(&[7u8; 64]).unwrap();

        backend.truncate(32).unwrap();
        assert_eq!(backend.size().unwrap(), 32);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);

        let err = backend.truncate(100).unwrap_err();
        assert!(matches!(err, StorageError::TruncateBeyondEnd { .. }));

        // Appends continue at the new end.
        assert_eq!(backend.append(b"x").unwrap(), 32);
    }

    #[test]
    fn sync_after_truncate_persists_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(&[1u8; 64]).unwrap();
        backend.sync().unwrap();
        assert_eq!(backend.synced_size, Some(64));

        // Growing back to the pre-truncate length must still take the full sync path.
        backend.truncate(16).unwrap();
        assert_eq!(backend.synced_size, None);
        backend.append(&[2u8; 48]).unwrap();
        assert_eq!(backend.size().unwrap(), 64);
        assert_ne!(backend.synced_size, Some(64));

        backend.sync().unwrap();
        assert_eq!(backend.synced_size, Some(64));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("env").join("log.0000000001");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }
}
