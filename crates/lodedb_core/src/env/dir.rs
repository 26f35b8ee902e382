//! Environment directory management.
//!
//! ```text
//! <home>/
//! ├─ ENV                 # environment metadata
//! ├─ LOCK                # exclusive process lock
//! ├─ log.0000000001 ...  # write-ahead log files
//! └─ <name>.db           # one file per database
//! ```

use crate::env::meta::EnvMeta;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const META_FILE: &str = "ENV";
const META_TEMP: &str = "ENV.tmp";
const LOCK_FILE: &str = "LOCK";

/// Database file suffix.
pub const DB_SUFFIX: &str = ".db";

/// Syncs a directory so created, renamed and removed entries are durable.
///
/// A no-op where directories cannot be synced.
#[cfg(unix)]
pub fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Syncs a directory so created, renamed and removed entries are durable.
///
/// A no-op where directories cannot be synced.
#[cfg(not(unix))]
pub fn sync_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// An environment directory held with an exclusive lock.
///
/// Only one `EnvDir` can exist per directory across processes; the lock
/// is released when it is dropped.
#[derive(Debug)]
pub struct EnvDir {
    path: PathBuf,
    _lock_file: File,
}

impl EnvDir {
    /// Opens or creates an environment directory and locks it.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the directory is missing and may not be
    ///   created, or the path is not a directory
    /// - `EnvironmentLocked` if another process holds it
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::invalid_argument(format!(
                    "environment directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EnvironmentLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a database file.
    #[must_use]
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{name}{DB_SUFFIX}"))
    }

    /// True if no metadata has been written yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.path.join(META_FILE).exists()
    }

    /// Loads the environment metadata; `None` for a new environment.
    ///
    /// # Errors
    ///
    /// Returns I/O errors and `InvalidFormat` for a damaged file.
    pub fn load_meta(&self) -> CoreResult<Option<EnvMeta>> {
        let path = self.path.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        EnvMeta::decode(&data).map(Some)
    }

    /// Replaces the metadata file atomically: write a temporary file, sync
    /// it, rename it over `ENV`, sync the directory.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn save_meta(&self, meta: &EnvMeta) -> CoreResult<()> {
        let temp = self.path.join(META_TEMP);
        let mut file = File::create(&temp)?;
        file.write_all(&meta.encode())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, self.path.join(META_FILE))?;
        sync_directory(&self.path)?;
        Ok(())
    }

    /// Deletes a database file.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than the file already being gone.
    pub fn remove_db_file(&self, name: &str) -> CoreResult<()> {
        match fs::remove_file(self.db_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        sync_directory(&self.path)?;
        Ok(())
    }

    /// Renames a database file.
    ///
    /// # Errors
    ///
    /// Returns I/O errors.
    pub fn rename_db_file(&self, from: &str, to: &str) -> CoreResult<()> {
        fs::rename(self.db_path(from), self.db_path(to))?;
        sync_directory(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let home = temp.path().join("env");
        let dir = EnvDir::open(&home, true).unwrap();
        assert!(home.is_dir());
        assert!(dir.is_new());
        assert_eq!(dir.db_path("accounts"), home.join("accounts.db"));
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = EnvDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let _first = EnvDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            EnvDir::open(temp.path(), true),
            Err(CoreError::EnvironmentLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(EnvDir::open(temp.path(), true).unwrap());
        EnvDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn meta_round_trip() {
        let temp = tempdir().unwrap();
        let dir = EnvDir::open(temp.path(), true).unwrap();
        assert!(dir.load_meta().unwrap().is_none());

        let mut meta = EnvMeta::new(4096);
        meta.register("orders");
        dir.save_meta(&meta).unwrap();
        assert!(!dir.is_new());
        assert_eq!(dir.load_meta().unwrap().unwrap(), meta);
    }

    #[test]
    fn rename_and_remove_db_files() {
        let temp = tempdir().unwrap();
        let dir = EnvDir::open(temp.path(), true).unwrap();
        fs::write(dir.db_path("a"), b"x").unwrap();
        dir.rename_db_file("a", "b").unwrap();
        assert!(dir.db_path("b").exists());
        dir.remove_db_file("b").unwrap();
        dir.remove_db_file("b").unwrap();
        assert!(!dir.db_path("b").exists());
    }
}
