use crate::bitset::ConcurrentBitSet;
use crate::storage::{FileStore, StorageError, StorageManager};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// One storage size bucket.
///
/// The bucket is a run of equally sized slots of `block_size << bucket`
/// bytes spread over `shards` files: slot `s` lives in file `s % shards` at
/// offset `(s / shards) * slot_size`.
///
/// Once the last slot is freed the files are truncated to zero.
pub struct BlockStore {
    manager: Arc<dyn StorageManager>,
    bucket: usize,
    slot_size: usize,
    files: Box<[Arc<dyn FileStore>]>,
    slots: ConcurrentBitSet,
    // writers share it, truncation takes it exclusively
    truncation: RwLock<()>,
}

impl BlockStore {
    pub fn new(
        manager: Arc<dyn StorageManager>,
        bucket: usize,
        block_size: usize,
        slot_count: usize,
        shards: usize,
        concurrency_level: usize,
    ) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(shards);
        for shard in 0..shards {
            files.push(manager.create(&format!("bucket_{bucket:02}_{shard:02}.spill"))?);
        }

        Ok(Self {
            manager,
            bucket,
            slot_size: block_size << bucket,
            files: files.into_boxed_slice(),
            slots: ConcurrentBitSet::new(slot_count, concurrency_level),
            truncation: RwLock::new(()),
        })
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn used_slots(&self) -> usize {
        self.slots.bits_set()
    }

    pub fn allocate(&self) -> Result<u32, StorageError> {
        self.slots
            .allocate()
            .map(|slot| slot as u32)
            .ok_or(StorageError::BucketFull {
                bucket: self.bucket,
            })
    }

    /// Releases `slot`, truncating the files if it was the last one.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not allocated.
    pub fn free(&self, slot: u32) -> Result<(), StorageError> {
        self.slots.free(slot as usize);
        if self.slots.bits_set() > 0 {
            return Ok(());
        }

        let _guard = self.truncation.write();
        // re-check, a slot may have been handed out meanwhile
        if self.slots.bits_set() == 0 {
            for file in self.files.iter() {
                file.truncate(0)?;
            }
            debug!(bucket = self.bucket, "truncated empty storage bucket");
        }
        Ok(())
    }

    fn locate(&self, slot: u32, offset: usize, len: usize) -> (&dyn FileStore, u64) {
        assert!(
            offset + len <= self.slot_size,
            "access of {len} bytes at {offset} overruns a slot of {} bytes",
            self.slot_size
        );
        let slot = slot as usize;
        let file = &self.files[slot % self.files.len()];
        let position = (slot / self.files.len()) * self.slot_size + offset;
        (file.as_ref(), position as u64)
    }

    pub fn write(&self, slot: u32, offset: usize, buf: &[u8]) -> Result<(), StorageError> {
        let (file, position) = self.locate(slot, offset, buf.len());
        let _guard = self.truncation.read();
        file.write_at(buf, position)
    }

    pub fn read(&self, slot: u32, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let (file, position) = self.locate(slot, offset, buf.len());
        file.read_at(buf, position)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        for file in self.files.iter() {
            if let Err(e) = self.manager.remove(file.name()) {
                warn!(file = file.name(), error = %e, "cannot remove storage file");
            }
        }
    }
}
