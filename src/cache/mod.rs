mod entry;
mod frame;
mod group;
mod permits;
mod tiered;

pub use permits::{AllocationLock, WritePermit, WritePermits};
pub use tiered::TieredCache;

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::inode::AllocatorError;
use crate::storage::StorageError;

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

pub type GroupId = i64;
pub type ObjectId = i64;

/// Identity of a cached object across groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: GroupId,
    pub id: ObjectId,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("allocator")]
    Allocator(#[from] AllocatorError),
    #[error("directory")]
    Directory(#[from] DirectoryError),
    #[error("storage")]
    Storage(#[from] StorageError),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("memory tier out of space after {attempts} eviction attempts")]
    OutOfSpace { attempts: usize },
    #[error("object serialization failed")]
    Serialization(#[source] io::Error),
    #[error("object frame corrupted")]
    Corrupted,
    #[error("object of {size} bytes exceeds the maximum of {max} bytes")]
    ObjectTooLarge { size: usize, max: usize },
}

impl CacheError {
    /// Whether evicting something may let the failed call succeed.
    fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            CacheError::Allocator(AllocatorError::Exhausted | AllocatorError::InodesExhausted)
                | CacheError::Directory(DirectoryError::Allocator(
                    AllocatorError::Exhausted | AllocatorError::InodesExhausted
                ))
        )
    }
}

/// Converts cached objects to and from bytes.
///
/// A serializer is bound to one cache group; its [`Serializer::id`] names
/// the group the objects belong to. The cache frames the serialized bytes
/// with their length and never looks inside.
pub trait Serializer<T>: Send + Sync {
    fn id(&self) -> GroupId;
    fn serialize(&self, object: &T, sink: &mut dyn Write) -> io::Result<()>;
    fn deserialize(&self, source: &mut dyn Read) -> io::Result<T>;
    fn prefers_soft_cache(&self) -> bool {
        false
    }
}

/// An object handed to or returned by the cache.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub id: ObjectId,
    pub object: Arc<T>,
}

impl<T> CacheEntry<T> {
    pub fn new(id: ObjectId, object: T) -> Self {
        Self {
            id,
            object: Arc::new(object),
        }
    }
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            object: self.object.clone(),
        }
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub storage_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotion_failures: u64,
    pub direct_to_storage: u64,
}

/// Occupancy of the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_blocks: usize,
    pub total_blocks: usize,
    pub used_inodes: usize,
    pub block_size: usize,
}
