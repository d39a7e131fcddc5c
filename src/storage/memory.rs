use crate::storage::{FileStore, StorageError, StorageManager};

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

/// A file held in memory.
pub struct MemoryFile {
    name: String,
    data: RwLock<Vec<u8>>,
    failing_writes: Arc<AtomicUsize>,
}

impl FileStore for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::InjectedFailure);
        }

        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<(), StorageError> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.data.read().len() as u64)
    }
}

/// Storage held in process memory, for tests and small deployments.
///
/// Writes can be made to fail with [`MemoryStorageManager::fail_next_writes`].
#[derive(Default)]
pub struct MemoryStorageManager {
    files: Mutex<HashMap<String, Arc<MemoryFile>>>,
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes, on any file, fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::Relaxed);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Bytes held by all files.
    pub fn stored_bytes(&self) -> u64 {
        self.files
            .lock()
            .values()
            .map(|file| file.data.read().len() as u64)
            .sum()
    }
}

impl StorageManager for MemoryStorageManager {
    fn create(&self, name: &str) -> Result<Arc<dyn FileStore>, StorageError> {
        let file = Arc::new(MemoryFile {
            name: name.to_string(),
            data: RwLock::new(Vec::new()),
            failing_writes: self.failing_writes.clone(),
        });
        self.files.lock().insert(name.to_string(), file.clone());
        Ok(file)
    }

    fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.files.lock().remove(name);
        Ok(())
    }
}
