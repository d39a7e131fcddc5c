mod backend;
mod block_store;
mod memory;

pub use backend::{FileStorage, FileStorageManager};
pub use block_store::BlockStore;
pub use memory::{MemoryFile, MemoryStorageManager};

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("storage bucket {bucket} has no free slot")]
    BucketFull { bucket: usize },
    #[error("injected write failure")]
    InjectedFailure,
}

/// A byte range addressed by offset.
pub trait FileStore: Send + Sync {
    fn name(&self) -> &str;
    /// Fills `buf` from `offset`; reading past the end is an error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError>;
    /// Writes all of `buf` at `offset`, extending the file as needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError>;
    fn truncate(&self, len: u64) -> Result<(), StorageError>;
    fn len(&self) -> Result<u64, StorageError>;
}

/// Creates and removes the files backing the storage tier.
pub trait StorageManager: Send + Sync {
    fn create(&self, name: &str) -> Result<Arc<dyn FileStore>, StorageError>;
    fn remove(&self, name: &str) -> Result<(), StorageError>;
}
