use std::time::Duration;

use thiserror::Error;

/// Smallest block size accepted by [`Config::validate`].
pub const MIN_BLOCK_SIZE: usize = 512;
/// Largest block size accepted by [`Config::validate`].
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}")]
    BlockSize,
    #[error("memory buffer space must hold at least one block and fewer than 2^31 blocks")]
    MemoryBufferSpace,
    #[error("segment size must be a power-of-two multiple of the block size")]
    SegmentSize,
    #[error("inode count must be between 1 and 2^31")]
    InodeCount,
    #[error("max storage object size must be at least one block")]
    MaxStorageObjectSize,
    #[error("max memory object size must not exceed the max storage object size")]
    MaxMemoryObjectSize,
    #[error("storage needs at least one shard and one slot per bucket")]
    StorageLayout,
    #[error("lrfu lambda must be in (0, 1] and half life non-zero")]
    Lrfu,
    #[error("buffer backoff must be non-zero and not exceed max backoff")]
    Backoff,
}

/// Tuning constants of the LRFU eviction ordering.
///
/// These are tuning parameters without a derivation; they are kept
/// configurable rather than hard-coded.
#[derive(Debug, Clone)]
pub struct LrfuConfig {
    /// Number of clock ticks after which a frequency contribution has
    /// decayed to half its value.
    pub half_life: u64,
    /// Exponent of the recency term `now^lambda`. Values close to 1 make
    /// the ordering behave like LRU, small values like LFU.
    pub lambda: f64,
    /// Access intervals shorter than this are clamped up to it.
    pub min_interval: u64,
    /// Access intervals longer than this discard the accumulated value.
    pub max_interval: u64,
    /// Above this many ordered entries new entries queue up in plain
    /// insertion order.
    pub max_ordered_entries: usize,
}

impl LrfuConfig {
    pub fn with_half_life(half_life: u64) -> Self {
        Self {
            half_life,
            min_interval: (half_life / 256).max(1 << 9),
            max_interval: 62 * half_life,
            ..Self::default()
        }
    }
}

impl Default for LrfuConfig {
    fn default() -> Self {
        let half_life = 1 << 17;
        Self {
            half_life,
            lambda: 0.5,
            min_interval: (half_life / 256).max(1 << 9),
            max_interval: 62 * half_life,
            max_ordered_entries: 1 << 20,
        }
    }
}

/// Configuration of the quota and secondary caches of the buffer manager.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Process-wide reservation quota in KB. Derived from the memory
    /// buffer space when unset.
    pub max_reserve_kb: Option<i64>,
    /// How many times a `Wait` reservation backs off before it is forced.
    pub wait_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Capacity of the strong side cache of recently persisted batches.
    pub soft_cache_entries: usize,
    /// Keep weak references to persisted batches that are still alive
    /// elsewhere in the process.
    pub weak_cache: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_reserve_kb: None,
            wait_attempts: 8,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(64),
            soft_cache_entries: 256,
            weak_cache: true,
        }
    }
}

/// Configuration of the spill cache.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of a memory block and the unit of every storage bucket.
    pub block_size: usize,
    /// Bytes of the memory tier.
    pub memory_buffer_space: usize,
    /// Bytes of each anonymous memory segment backing the memory tier.
    pub segment_size: usize,
    /// Number of inodes, which bounds the number of memory resident
    /// objects. Defaults to half the memory block count.
    pub inode_count: Option<usize>,
    /// The largest object the storage tier accepts.
    pub max_storage_object_size: usize,
    /// Objects larger than this bypass the memory tier. Defaults to an
    /// eighth of the memory buffer space.
    pub max_memory_object_size: Option<usize>,
    /// Slots tracked by the allocator of each storage size bucket.
    pub storage_slots_per_bucket: usize,
    /// Files backing each storage size bucket.
    pub storage_shards: usize,
    /// Expected number of concurrently allocating threads.
    pub concurrency_level: usize,
    /// Emergency evictions attempted before an allocation reports
    /// that the memory tier is out of space.
    pub eviction_attempts: usize,
    /// Like `eviction_attempts`, for consecutive evictions that only found
    /// pinned or relocating objects.
    pub busy_eviction_attempts: usize,
    /// Attempts at writing an evicted object to storage.
    pub write_retries: usize,
    pub lrfu: LrfuConfig,
    pub buffer: BufferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            memory_buffer_space: 64 * 1024 * 1024, // 64mb
            segment_size: 16 * 1024 * 1024,        // 16mb
            inode_count: None,
            max_storage_object_size: 256 * 1024 * 1024, // 256mb
            max_memory_object_size: None,
            storage_slots_per_bucket: 1 << 16,
            storage_shards: 4,
            concurrency_level: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            eviction_attempts: 16,
            busy_eviction_attempts: 1 << 14,
            write_retries: 3,
            lrfu: LrfuConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl Config {
    pub fn memory_blocks(&self) -> usize {
        self.memory_buffer_space / self.block_size
    }

    pub fn inode_count(&self) -> usize {
        self.inode_count
            .unwrap_or_else(|| (self.memory_blocks() / 2).max(1))
    }

    pub fn max_memory_object_size(&self) -> usize {
        self.max_memory_object_size
            .unwrap_or(self.memory_buffer_space / 8)
            .clamp(self.block_size, self.memory_buffer_space)
    }

    pub fn max_reserve_kb(&self) -> i64 {
        self.buffer
            .max_reserve_kb
            .unwrap_or((self.memory_buffer_space / 1024) as i64)
    }

    /// Number of storage size buckets; bucket `i` stores objects of up
    /// to `block_size << i` bytes.
    pub fn storage_buckets(&self) -> usize {
        let max_blocks = self.max_storage_object_size.div_ceil(self.block_size);
        max_blocks.next_power_of_two().trailing_zeros() as usize + 1
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ConfigError::BlockSize);
        }

        let blocks = self.memory_blocks();
        if blocks == 0 || blocks >= (1 << 31) {
            return Err(ConfigError::MemoryBufferSpace);
        }

        if !self.segment_size.is_power_of_two() || self.segment_size < self.block_size {
            return Err(ConfigError::SegmentSize);
        }

        let inodes = self.inode_count();
        if inodes == 0 || inodes >= (1 << 31) {
            return Err(ConfigError::InodeCount);
        }

        if self.max_storage_object_size < self.block_size {
            return Err(ConfigError::MaxStorageObjectSize);
        }

        // every memory resident object must be demotable
        if self.max_memory_object_size() > self.max_storage_object_size {
            return Err(ConfigError::MaxMemoryObjectSize);
        }

        if self.storage_shards == 0 || self.storage_slots_per_bucket == 0 {
            return Err(ConfigError::StorageLayout);
        }

        if !(self.lrfu.lambda > 0.0 && self.lrfu.lambda <= 1.0) || self.lrfu.half_life == 0 {
            return Err(ConfigError::Lrfu);
        }

        if self.buffer.initial_backoff.is_zero()
            || self.buffer.initial_backoff > self.buffer.max_backoff
        {
            return Err(ConfigError::Backoff);
        }

        Ok(())
    }
}
