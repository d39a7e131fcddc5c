use crate::bitset::ConcurrentBitSet;
use crate::blocks::{BlockByteStore, BlockNo};
use crate::config::Config;
use crate::inode::{
    AllocatorError, BlockManager, FreeList, INODE_SIZE, Inode, InodeId, max_blocks_per_object,
    pointer_blocks_for,
};

use tracing::trace;
use zerocopy::FromBytes;

/// Allocator of inodes and data blocks of the memory tier.
///
/// Inode records are packed into their own byte store, data and pointer
/// blocks share the data byte store. Both are tracked by a
/// [`ConcurrentBitSet`]. Per-object access goes through a
/// [`BlockManager`] obtained with [`BlockAllocator::block_manager`].
pub struct BlockAllocator {
    inodes: BlockByteStore,
    data: BlockByteStore,
    inodes_in_use: ConcurrentBitSet,
    blocks_in_use: ConcurrentBitSet,
    inodes_per_block: usize,
}

impl BlockAllocator {
    pub fn new(config: &Config) -> Result<Self, AllocatorError> {
        Self::with_capacity(
            config.block_size,
            config.memory_blocks(),
            config.inode_count(),
            config.segment_size,
            config.concurrency_level,
        )
    }

    pub fn with_capacity(
        block_size: usize,
        block_count: usize,
        inode_count: usize,
        segment_size: usize,
        concurrency_level: usize,
    ) -> Result<Self, AllocatorError> {
        let inodes_per_block = block_size / INODE_SIZE;
        let inode_blocks = inode_count.div_ceil(inodes_per_block);

        Ok(Self {
            inodes: BlockByteStore::new(block_size, inode_blocks, segment_size)?,
            data: BlockByteStore::new(block_size, block_count, segment_size)?,
            inodes_in_use: ConcurrentBitSet::new(inode_count, concurrency_level),
            blocks_in_use: ConcurrentBitSet::new(block_count, concurrency_level),
            inodes_per_block,
        })
    }

    pub fn block_size(&self) -> usize {
        self.data.block_size()
    }

    /// Number of block pointers held by one pointer block.
    pub fn pointers_per_block(&self) -> usize {
        self.block_size() / std::mem::size_of::<i32>()
    }

    pub fn max_blocks_per_object(&self) -> usize {
        max_blocks_per_object(self.pointers_per_block())
    }

    pub fn pointer_blocks_for(&self, blocks: usize) -> usize {
        pointer_blocks_for(blocks, self.pointers_per_block())
    }

    pub fn block_count(&self) -> usize {
        self.data.block_count()
    }

    pub fn used_blocks(&self) -> usize {
        self.blocks_in_use.bits_set()
    }

    pub fn free_blocks(&self) -> usize {
        self.blocks_in_use.free_count()
    }

    pub fn used_inodes(&self) -> usize {
        self.inodes_in_use.bits_set()
    }

    pub fn free_inodes(&self) -> usize {
        self.inodes_in_use.free_count()
    }

    pub(crate) fn data(&self) -> &BlockByteStore {
        &self.data
    }

    /// Allocates an inode with every pointer slot empty.
    pub fn allocate_inode(&self) -> Result<InodeId, AllocatorError> {
        let inode = self
            .inodes_in_use
            .allocate()
            .ok_or(AllocatorError::InodesExhausted)? as InodeId;
        self.with_inode_mut(inode, Inode::clear);
        trace!(inode, "allocated inode");
        Ok(inode)
    }

    pub(crate) fn free_inode(&self, inode: InodeId) {
        self.inodes_in_use.free(inode as usize);
        trace!(inode, "freed inode");
    }

    pub fn allocate_data_block(&self) -> Option<BlockNo> {
        self.blocks_in_use.allocate().map(|block| block as BlockNo)
    }

    pub fn free_data_block(&self, block: BlockNo) {
        self.blocks_in_use.free(block as usize);
    }

    pub fn free_list(&self) -> FreeList<'_> {
        FreeList(self)
    }

    /// Handle over the blocks of an allocated inode.
    ///
    /// # Panics
    ///
    /// Panics if the inode is not allocated.
    pub fn block_manager(&self, inode: InodeId) -> BlockManager<'_> {
        assert!(
            self.inodes_in_use.get(inode as usize),
            "inode {inode} is not allocated"
        );
        BlockManager::new(self, inode)
    }

    fn inode_location(&self, inode: InodeId) -> (BlockNo, usize) {
        let inode = inode as usize;
        let block = (inode / self.inodes_per_block) as BlockNo;
        let offset = (inode % self.inodes_per_block) * INODE_SIZE;
        (block, offset)
    }

    pub(crate) fn with_inode<R>(&self, inode: InodeId, f: impl FnOnce(&Inode) -> R) -> R {
        let (block_no, offset) = self.inode_location(inode);
        let block = self.inodes.block(block_no);
        // records are unaligned and exactly INODE_SIZE bytes
        let record = Inode::ref_from_bytes(&block[offset..offset + INODE_SIZE]).unwrap();
        f(record)
    }

    pub(crate) fn with_inode_mut<R>(&self, inode: InodeId, f: impl FnOnce(&mut Inode) -> R) -> R {
        let (block_no, offset) = self.inode_location(inode);
        let mut block = self.inodes.block_mut(block_no);
        let record = Inode::mut_from_bytes(&mut block[offset..offset + INODE_SIZE]).unwrap();
        f(record)
    }
}
