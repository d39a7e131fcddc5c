use crate::blocks::{BlockRef, BlockRefMut};
use crate::inode::{AllocatorError, BlockAllocator, BlockManager, InodeId};

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::little_endian::{I32, I64};
use zerocopy_derive::*;

const EMPTY_KEY: i64 = -1;
const TOMBSTONE: i64 = -2;
const MAX_LOAD: f64 = 0.7;
const SHRINK_DIVISOR: usize = 8;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Bucket {
    key: I64,
    value: I32,
}

const BUCKET_SIZE: usize = std::mem::size_of::<Bucket>();

const _: () = assert!(BUCKET_SIZE == 12);

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("cannot allocate directory blocks")]
    Allocator(#[from] AllocatorError),
}

enum Probe {
    Found { idx: usize, value: i32 },
    Vacant { idx: usize, tombstone: bool },
}

/// An open addressing `i64 -> i32` hash table stored in allocator blocks.
///
/// Buckets are 12 byte records (`key: i64`, `value: i32`, little endian)
/// laid out over the logical blocks of the directory's own inode, never
/// straddling a block boundary. A key of `-1` marks an empty bucket and
/// `-2` a tombstone, so keys must be non-negative.
///
/// ```text
///  bucket i ──► logical block i / buckets_per_block
///               offset       (i % buckets_per_block) * 12
///
///  +------------------------------------+------------------------------------+
///  | key | val | key | val | ... | pad  | key | val | key | val | ... | pad  |
///  +------------------------------------+------------------------------------+
///            logical block 0                       logical block 1
/// ```
///
/// Capacity is a power of two probed linearly. Reaching a load of 0.7
/// doubles it; dropping below an eighth halves it, down to the largest
/// power of two of buckets fitting one block. Every resize is a full
/// rehash which also drops tombstones.
///
/// The directory is not synchronized; callers hold the lock of the
/// owning cache group.
pub struct BlockHashDirectory {
    allocator: Arc<BlockAllocator>,
    inode: InodeId,
    capacity: usize,
    size: usize,
    tombstones: usize,
    min_capacity: usize,
    buckets_per_block: usize,
}

impl BlockHashDirectory {
    pub fn new(allocator: Arc<BlockAllocator>) -> Result<Self, DirectoryError> {
        let buckets_per_block = allocator.block_size() / BUCKET_SIZE;
        let min_capacity = 1 << (usize::BITS - 1 - buckets_per_block.leading_zeros());
        let inode = allocator.allocate_inode()?;

        let mut directory = Self {
            allocator,
            inode,
            capacity: 0,
            size: 0,
            tombstones: 0,
            min_capacity,
            buckets_per_block,
        };
        // on failure Drop gives back the inode
        directory.resize_blocks(min_capacity)?;
        directory.capacity = min_capacity;
        directory.clear_buckets();

        Ok(directory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    fn manager(&self) -> BlockManager<'_> {
        self.allocator.block_manager(self.inode)
    }

    fn blocks_for(&self, capacity: usize) -> usize {
        capacity.div_ceil(self.buckets_per_block)
    }

    fn location(&self, idx: usize) -> (usize, usize) {
        (
            idx / self.buckets_per_block,
            (idx % self.buckets_per_block) * BUCKET_SIZE,
        )
    }

    fn block(&self, index: usize) -> BlockRef<'_> {
        self.manager()
            .get_block(index)
            .unwrap_or_else(|e| panic!("directory block {index} missing: {e}"))
    }

    fn block_mut(&self, index: usize) -> BlockRefMut<'_> {
        self.manager()
            .get_block_mut(index)
            .unwrap_or_else(|e| panic!("directory block {index} missing: {e}"))
    }

    fn hash(&self, key: i64) -> usize {
        let bits = self.capacity.trailing_zeros();
        ((key as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> (u64::BITS - bits)) as usize
    }

    fn read_bucket(&self, idx: usize) -> (i64, i32) {
        let (block, offset) = self.location(idx);
        let block = self.block(block);
        let bucket = Bucket::ref_from_bytes(&block[offset..offset + BUCKET_SIZE]).unwrap();
        (bucket.key.get(), bucket.value.get())
    }

    fn write_bucket(&self, idx: usize, key: i64, value: i32) {
        let (block, offset) = self.location(idx);
        let mut block = self.block_mut(block);
        let bucket = Bucket::mut_from_bytes(&mut block[offset..offset + BUCKET_SIZE]).unwrap();
        bucket.key.set(key);
        bucket.value.set(value);
    }

    fn probe(&self, key: i64) -> Probe {
        let mask = self.capacity - 1;
        let mut idx = self.hash(key);
        let mut first_tombstone = None;

        for _ in 0..self.capacity {
            let (bucket_key, value) = self.read_bucket(idx);
            if bucket_key == key {
                return Probe::Found { idx, value };
            }
            if bucket_key == EMPTY_KEY {
                return match first_tombstone {
                    Some(idx) => Probe::Vacant {
                        idx,
                        tombstone: true,
                    },
                    None => Probe::Vacant {
                        idx,
                        tombstone: false,
                    },
                };
            }
            if bucket_key == TOMBSTONE && first_tombstone.is_none() {
                first_tombstone = Some(idx);
            }
            idx = (idx + 1) & mask;
        }

        // the load limit keeps at least one bucket empty or tombstoned
        let idx = first_tombstone.unwrap_or_else(|| panic!("hash directory has no free bucket"));
        Probe::Vacant {
            idx,
            tombstone: true,
        }
    }

    pub fn get(&self, key: i64) -> Option<i32> {
        match self.probe(key) {
            Probe::Found { value, .. } => Some(value),
            Probe::Vacant { .. } => None,
        }
    }

    pub fn contains_key(&self, key: i64) -> bool {
        self.get(key).is_some()
    }

    /// Maps `key` to `value`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `key` is negative.
    pub fn put(&mut self, key: i64, value: i32) -> Result<Option<i32>, DirectoryError> {
        assert!(key >= 0, "directory keys must be non-negative, got {key}");

        if let Probe::Found { idx, value: old } = self.probe(key) {
            self.write_bucket(idx, key, value);
            return Ok(Some(old));
        }

        let limit = (self.capacity as f64 * MAX_LOAD) as usize;
        if self.size + self.tombstones + 1 > limit {
            let capacity = if self.size + 1 > limit {
                self.capacity * 2
            } else {
                self.capacity
            };
            self.rehash(capacity)?;
        }

        self.insert_vacant(key, value);
        Ok(None)
    }

    fn insert_vacant(&mut self, key: i64, value: i32) {
        match self.probe(key) {
            Probe::Vacant { idx, tombstone } => {
                if tombstone {
                    self.tombstones -= 1;
                }
                self.write_bucket(idx, key, value);
                self.size += 1;
            }
            Probe::Found { .. } => unreachable!("key {key} already present"),
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: i64) -> Result<Option<i32>, DirectoryError> {
        let Probe::Found { idx, value } = self.probe(key) else {
            return Ok(None);
        };
        self.write_bucket(idx, TOMBSTONE, -1);
        self.size -= 1;
        self.tombstones += 1;

        if self.capacity > self.min_capacity && self.size < self.capacity / SHRINK_DIVISOR {
            self.rehash(self.capacity / 2)?;
        }

        Ok(Some(value))
    }

    /// Live entries in bucket order.
    pub fn entries(&self) -> Vec<(i64, i32)> {
        let mut entries = Vec::with_capacity(self.size);
        for block_index in 0..self.blocks_for(self.capacity) {
            let block = self.block(block_index);
            let first = block_index * self.buckets_per_block;
            let buckets = self.buckets_per_block.min(self.capacity - first);
            for i in 0..buckets {
                let offset = i * BUCKET_SIZE;
                let bucket = Bucket::ref_from_bytes(&block[offset..offset + BUCKET_SIZE]).unwrap();
                let key = bucket.key.get();
                if key >= 0 {
                    entries.push((key, bucket.value.get()));
                }
            }
        }
        entries
    }

    /// Removes every entry, returning them, and shrinks back to the
    /// minimum capacity.
    pub fn drain(&mut self) -> Result<HashMap<i64, i32>, DirectoryError> {
        let entries = self.entries().into_iter().collect();
        self.resize_blocks(self.min_capacity)?;
        self.capacity = self.min_capacity;
        self.size = 0;
        self.tombstones = 0;
        self.clear_buckets();
        Ok(entries)
    }

    fn clear_buckets(&self) {
        for block_index in 0..self.blocks_for(self.capacity) {
            // every byte 0xff is an empty key with a -1 value
            self.block_mut(block_index).fill(0xff);
        }
    }

    /// Grows or shrinks the block range to hold `capacity` buckets.
    fn resize_blocks(&mut self, capacity: usize) -> Result<(), DirectoryError> {
        let current = self.manager().block_count();
        let target = self.blocks_for(capacity);

        if target > current {
            let manager = self.manager();
            let mut source = self.allocator.free_list();
            for index in current..target {
                if let Err(e) = manager.allocate_block(index, &mut source) {
                    for index in (current..index).rev() {
                        manager.free_block(index)?;
                    }
                    return Err(e.into());
                }
            }
        } else {
            let manager = self.manager();
            for index in (target..current).rev() {
                manager.free_block(index)?;
            }
        }

        Ok(())
    }

    fn rehash(&mut self, capacity: usize) -> Result<(), DirectoryError> {
        let entries = self.entries();
        self.resize_blocks(capacity)?;
        self.capacity = capacity;
        self.size = 0;
        self.tombstones = 0;
        self.clear_buckets();
        for (key, value) in entries {
            self.insert_vacant(key, value);
        }
        Ok(())
    }
}

impl Drop for BlockHashDirectory {
    fn drop(&mut self) {
        self.manager().free_all();
    }
}
