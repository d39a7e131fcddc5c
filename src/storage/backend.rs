use crate::storage::{FileStore, StorageError, StorageManager};

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::debug;

/// A storage file on the local filesystem.
///
/// Spill files are scratch space: nothing is synced and the content does
/// not survive the process.
pub struct FileStorage {
    name: String,
    file: File,
}

impl FileStorage {
    /// Creates the file, truncating any previous content.
    pub fn create<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }
}

impl FileStore for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(StorageError::Io)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        self.file
            .write_all_at(buf, offset)
            .map_err(StorageError::Io)
    }

    fn truncate(&self, len: u64) -> Result<(), StorageError> {
        self.file.set_len(len).map_err(StorageError::Io)
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }
}

/// Keeps spill files in one directory.
pub struct FileStorageManager {
    directory: PathBuf,
    // removed with its content on drop
    _temporary: Option<TempDir>,
}

impl FileStorageManager {
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, StorageError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            _temporary: None,
        })
    }

    /// Spills into a fresh temporary directory, deleted when the manager
    /// is dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let temporary = TempDir::with_prefix("spillway-")?;
        debug!(path = %temporary.path().display(), "created spill directory");
        Ok(Self {
            directory: temporary.path().to_path_buf(),
            _temporary: Some(temporary),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl StorageManager for FileStorageManager {
    fn create(&self, name: &str) -> Result<Arc<dyn FileStore>, StorageError> {
        let file = FileStorage::create(self.directory.join(name), name)?;
        Ok(Arc::new(file))
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.directory.join(name)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
