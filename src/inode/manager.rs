use crate::blocks::{BlockNo, BlockRef, BlockRefMut, EMPTY};
use crate::inode::{AllocatorError, BlockAllocator, BlockSource, DIRECT_POINTERS, InodeId, Slot};

use tracing::trace;
use zerocopy::FromBytes;
use zerocopy::little_endian::I32;

fn pointers(block: &[u8]) -> &[I32] {
    // block sizes are powers of two >= 512, so always whole pointers
    <[I32]>::ref_from_bytes(block).unwrap()
}

fn pointers_mut(block: &mut [u8]) -> &mut [I32] {
    <[I32]>::mut_from_bytes(block).unwrap()
}

fn as_block(pointer: i32) -> Option<BlockNo> {
    (pointer != EMPTY).then_some(pointer as BlockNo)
}

/// Handle over the blocks of one inode.
///
/// Logical block `n` of the object is found through the direct pointers,
/// the indirect block or the doubly-indirect block of the inode, depending
/// on `n` (see [`crate::inode::Inode`]). Pointer blocks are allocated on
/// first use and freed once they no longer hold any pointer.
///
/// Latches are always taken from the inode towards the data block and
/// released before the next level is visited, except while a fresh pointer
/// block is linked into its parent.
///
/// A single writer per inode is assumed; concurrent readers of different
/// inodes never share pointer blocks.
pub struct BlockManager<'a> {
    allocator: &'a BlockAllocator,
    inode: InodeId,
}

impl<'a> BlockManager<'a> {
    pub(crate) fn new(allocator: &'a BlockAllocator, inode: InodeId) -> Self {
        Self { allocator, inode }
    }

    pub fn inode(&self) -> InodeId {
        self.inode
    }

    pub fn block_size(&self) -> usize {
        self.allocator.block_size()
    }

    fn slot(&self, index: usize) -> Result<Slot, AllocatorError> {
        Slot::for_index(index, self.allocator.pointers_per_block()).ok_or(
            AllocatorError::ObjectTooLarge {
                blocks: index + 1,
                max: self.allocator.max_blocks_per_object(),
            },
        )
    }

    fn pointer(&self, block: BlockNo, idx: usize) -> Option<BlockNo> {
        let block = self.allocator.data().block(block);
        as_block(pointers(&block)[idx].get())
    }

    fn init_pointer_block(&self, block: BlockNo) {
        let mut block = self.allocator.data().block_mut(block);
        // every byte 0xff is EMPTY in every slot
        block.fill(0xff);
    }

    /// Block number of logical block `index`, if allocated.
    pub fn resolve(&self, index: usize) -> Result<Option<BlockNo>, AllocatorError> {
        let block = match self.slot(index)? {
            Slot::Direct(i) => self
                .allocator
                .with_inode(self.inode, |inode| as_block(inode.direct[i].get())),
            Slot::Indirect(i) => self
                .allocator
                .with_inode(self.inode, |inode| as_block(inode.indirect.get()))
                .and_then(|indirect| self.pointer(indirect, i)),
            Slot::DoubleIndirect { outer, inner } => self
                .allocator
                .with_inode(self.inode, |inode| as_block(inode.double_indirect.get()))
                .and_then(|double| self.pointer(double, outer))
                .and_then(|second| self.pointer(second, inner)),
        };
        Ok(block)
    }

    /// Shared view of logical block `index`.
    pub fn get_block(&self, index: usize) -> Result<BlockRef<'a>, AllocatorError> {
        let block = self
            .resolve(index)?
            .ok_or(AllocatorError::BlockNotAllocated(index))?;
        Ok(self.allocator.data().block(block))
    }

    /// Exclusive view of logical block `index`.
    pub fn get_block_mut(&self, index: usize) -> Result<BlockRefMut<'a>, AllocatorError> {
        let block = self
            .resolve(index)?
            .ok_or(AllocatorError::BlockNotAllocated(index))?;
        Ok(self.allocator.data().block_mut(block))
    }

    /// Links a block from `source` as logical block `index` and returns an
    /// exclusive view of it. An already linked block is returned as is.
    ///
    /// Blocks must be allocated in order: `index - 1` has to exist.
    pub fn allocate_block(
        &self,
        index: usize,
        source: &mut impl BlockSource,
    ) -> Result<BlockRefMut<'a>, AllocatorError> {
        let slot = self.slot(index)?;
        debug_assert!(index == 0 || self.resolve(index - 1)?.is_some());

        let block = match slot {
            Slot::Direct(i) => self.allocator.with_inode_mut(self.inode, |inode| {
                match as_block(inode.direct[i].get()) {
                    Some(block) => Ok::<BlockNo, AllocatorError>(block),
                    None => {
                        let block = source.next_block()?;
                        inode.direct[i].set(block as i32);
                        Ok(block)
                    }
                }
            })?,
            Slot::Indirect(i) => {
                let indirect = self.ensure_root(false, source)?;
                self.ensure_slot(indirect, i, false, source)?
            }
            Slot::DoubleIndirect { outer, inner } => {
                let double = self.ensure_root(true, source)?;
                let second = self.ensure_slot(double, outer, true, source)?;
                self.ensure_slot(second, inner, false, source)?
            }
        };

        trace!(inode = self.inode, index, block, "allocated block");
        Ok(self.allocator.data().block_mut(block))
    }

    fn ensure_root(
        &self,
        double: bool,
        source: &mut impl BlockSource,
    ) -> Result<BlockNo, AllocatorError> {
        self.allocator.with_inode_mut(self.inode, |inode| {
            let root = if double {
                &mut inode.double_indirect
            } else {
                &mut inode.indirect
            };
            match as_block(root.get()) {
                Some(block) => Ok(block),
                None => {
                    let block = source.next_block()?;
                    self.init_pointer_block(block);
                    root.set(block as i32);
                    Ok(block)
                }
            }
        })
    }

    fn ensure_slot(
        &self,
        pointer_block: BlockNo,
        idx: usize,
        pointer_child: bool,
        source: &mut impl BlockSource,
    ) -> Result<BlockNo, AllocatorError> {
        let mut parent = self.allocator.data().block_mut(pointer_block);
        let slot = &mut pointers_mut(&mut parent)[idx];
        match as_block(slot.get()) {
            Some(block) => Ok(block),
            None => {
                let block = source.next_block()?;
                if pointer_child {
                    self.init_pointer_block(block);
                }
                slot.set(block as i32);
                Ok(block)
            }
        }
    }

    /// Publishes a block written through [`Self::allocate_block`] or
    /// [`Self::get_block_mut`]. Memory blocks are written in place, so this
    /// only releases the exclusive view.
    pub fn update(&self, block: BlockRefMut<'a>) {
        drop(block);
    }

    /// Unlinks and frees logical block `index`, along with any pointer
    /// block left without pointers. Objects shrink from the tail only.
    pub fn free_block(&self, index: usize) -> Result<Option<BlockNo>, AllocatorError> {
        let slot = self.slot(index)?;
        let data = self.allocator.data();

        let freed = self.allocator.with_inode_mut(self.inode, |inode| match slot {
            Slot::Direct(i) => {
                let block = as_block(inode.direct[i].get());
                inode.direct[i].set(EMPTY);
                block
            }
            Slot::Indirect(i) => {
                let indirect = as_block(inode.indirect.get())?;
                let block = {
                    let mut indirect_block = data.block_mut(indirect);
                    let slot = &mut pointers_mut(&mut indirect_block)[i];
                    let block = as_block(slot.get());
                    slot.set(EMPTY);
                    block
                };
                if i == 0 {
                    self.allocator.free_data_block(indirect);
                    inode.indirect.set(EMPTY);
                }
                block
            }
            Slot::DoubleIndirect { outer, inner } => {
                let double = as_block(inode.double_indirect.get())?;
                let mut double_block = data.block_mut(double);
                let outer_slot = &mut pointers_mut(&mut double_block)[outer];
                let second = as_block(outer_slot.get())?;
                let block = {
                    let mut second_block = data.block_mut(second);
                    let slot = &mut pointers_mut(&mut second_block)[inner];
                    let block = as_block(slot.get());
                    slot.set(EMPTY);
                    block
                };
                if inner == 0 {
                    self.allocator.free_data_block(second);
                    outer_slot.set(EMPTY);
                    if outer == 0 {
                        drop(double_block);
                        self.allocator.free_data_block(double);
                        inode.double_indirect.set(EMPTY);
                    }
                }
                block
            }
        });

        if let Some(block) = freed {
            self.allocator.free_data_block(block);
            trace!(inode = self.inode, index, block, "freed block");
        }
        Ok(freed)
    }

    /// Frees the pointers of a pointer block up to the first empty one and
    /// then the pointer block itself. Returns the number of blocks freed.
    fn free_pointer_block(&self, block: BlockNo, levels: usize) -> usize {
        let mut freed = 0;
        {
            let pointer_block = self.allocator.data().block(block);
            for pointer in pointers(&pointer_block) {
                let Some(child) = as_block(pointer.get()) else {
                    break;
                };
                freed += if levels > 1 {
                    self.free_pointer_block(child, levels - 1)
                } else {
                    self.allocator.free_data_block(child);
                    1
                };
            }
        }
        self.allocator.free_data_block(block);
        freed + 1
    }

    /// Frees every block of the object, pointer blocks included, and
    /// finally the inode. Returns the number of blocks freed.
    pub fn free_all(self) -> usize {
        let freed = self.allocator.with_inode_mut(self.inode, |inode| {
            let mut freed = 0;
            for pointer in inode.direct.iter() {
                let Some(block) = as_block(pointer.get()) else {
                    break;
                };
                self.allocator.free_data_block(block);
                freed += 1;
            }
            if let Some(indirect) = as_block(inode.indirect.get()) {
                freed += self.free_pointer_block(indirect, 1);
            }
            if let Some(double) = as_block(inode.double_indirect.get()) {
                freed += self.free_pointer_block(double, 2);
            }
            inode.clear();
            freed
        });

        self.allocator.free_inode(self.inode);
        trace!(inode = self.inode, freed, "freed inode blocks");
        freed
    }

    /// Number of logical blocks currently linked.
    pub fn block_count(&self) -> usize {
        let (direct, indirect, double) = self.allocator.with_inode(self.inode, |inode| {
            let direct = inode
                .direct
                .iter()
                .take_while(|p| p.get() != EMPTY)
                .count();
            (
                direct,
                as_block(inode.indirect.get()),
                as_block(inode.double_indirect.get()),
            )
        });
        if direct < DIRECT_POINTERS {
            return direct;
        }

        let count_pointers = |block: BlockNo| {
            let block = self.allocator.data().block(block);
            pointers(&block).iter().take_while(|p| p.get() != EMPTY).count()
        };

        let mut count = direct;
        match indirect {
            Some(indirect) => count += count_pointers(indirect),
            None => return count,
        }
        if let Some(double) = double {
            let seconds: Vec<BlockNo> = {
                let block = self.allocator.data().block(double);
                pointers(&block)
                    .iter()
                    .map_while(|p| as_block(p.get()))
                    .collect()
            };
            count += seconds.into_iter().map(count_pointers).sum::<usize>();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::inode::ReservedBlocks;

    fn allocator(block_size: usize, blocks: usize) -> BlockAllocator {
        BlockAllocator::with_capacity(block_size, blocks, 64, 1 << 20, 2).unwrap()
    }

    fn write_object(allocator: &BlockAllocator, blocks: usize) -> InodeId {
        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        let mut source = allocator.free_list();
        for index in 0..blocks {
            let mut block = manager.allocate_block(index, &mut source).unwrap();
            block[..8].copy_from_slice(&(index as u64).to_le_bytes());
            block[8..16].copy_from_slice(&(inode as u64).to_le_bytes());
            manager.update(block);
        }
        inode
    }

    fn check_object(allocator: &BlockAllocator, inode: InodeId, blocks: usize) {
        let manager = allocator.block_manager(inode);
        assert_eq!(manager.block_count(), blocks);
        for index in 0..blocks {
            let block = manager.get_block(index).unwrap();
            assert_eq!(&block[..8], &(index as u64).to_le_bytes());
            assert_eq!(&block[8..16], &(inode as u64).to_le_bytes());
        }
        assert!(matches!(
            manager.get_block(blocks),
            Err(AllocatorError::BlockNotAllocated(_))
        ));
    }

    #[test]
    fn direct_only_object() {
        let allocator = allocator(4096, 64);
        let inode = write_object(&allocator, 5);
        assert_eq!(allocator.used_blocks(), 5);
        check_object(&allocator, inode, 5);

        assert_eq!(allocator.block_manager(inode).free_all(), 5);
        assert_eq!(allocator.used_blocks(), 0);
        assert_eq!(allocator.used_inodes(), 0);
    }

    #[test]
    fn indirect_object() {
        let allocator = allocator(4096, 64);
        let inode = write_object(&allocator, 20);
        // 20 data blocks and the indirect block
        assert_eq!(allocator.used_blocks(), 21);
        check_object(&allocator, inode, 20);

        // block 19 resolves through the 6th slot of the indirect block
        let manager = allocator.block_manager(inode);
        let indirect = allocator.with_inode(inode, |record| record.indirect.get()) as BlockNo;
        let expected = {
            let block = allocator.data().block(indirect);
            pointers(&block)[19 - DIRECT_POINTERS].get() as BlockNo
        };
        assert_eq!(manager.get_block(19).unwrap().block_no(), expected);

        let used = allocator.used_blocks();
        assert_eq!(manager.free_all(), 21);
        assert_eq!(used - allocator.used_blocks(), 21);
        assert_eq!(allocator.used_inodes(), 0);
    }

    #[test]
    fn free_tail_releases_indirect_block() {
        let allocator = allocator(4096, 64);
        let inode = write_object(&allocator, 20);
        let manager = allocator.block_manager(inode);

        for index in (14..20).rev() {
            assert!(manager.free_block(index).unwrap().is_some());
        }
        // the indirect block went away with its last pointer
        assert_eq!(allocator.used_blocks(), 14);
        assert_eq!(
            allocator.with_inode(inode, |record| record.indirect.get()),
            EMPTY
        );

        assert!(manager.free_block(13).unwrap().is_some());
        assert_eq!(allocator.used_blocks(), 13);
        assert_eq!(manager.block_count(), 13);
        assert_eq!(manager.free_all(), 13);
        assert_eq!(allocator.used_blocks(), 0);
    }

    #[test]
    fn double_indirect_object() {
        // 512 byte blocks hold 128 pointers
        let allocator = allocator(512, 1024);
        let p = allocator.pointers_per_block();
        let blocks = DIRECT_POINTERS + p + 1;
        let inode = write_object(&allocator, blocks);
        // indirect, double indirect and one second level block
        assert_eq!(allocator.used_blocks(), blocks + 3);
        check_object(&allocator, inode, blocks);

        let blocks = DIRECT_POINTERS + p + p + 2;
        let other = write_object(&allocator, blocks);
        check_object(&allocator, other, blocks);
        check_object(&allocator, inode, DIRECT_POINTERS + p + 1);

        let manager = allocator.block_manager(other);
        assert_eq!(manager.free_all(), blocks + 4);
        assert_eq!(allocator.block_manager(inode).free_all(), DIRECT_POINTERS + p + 4);
        assert_eq!(allocator.used_blocks(), 0);
    }

    #[test]
    fn free_tail_of_double_indirect() {
        let allocator = allocator(512, 1024);
        let p = allocator.pointers_per_block();
        let blocks = DIRECT_POINTERS + p + p + 1;
        let inode = write_object(&allocator, blocks);
        let manager = allocator.block_manager(inode);
        let used = allocator.used_blocks();

        // last block sits alone in the second second-level block
        manager.free_block(blocks - 1).unwrap();
        assert_eq!(used - allocator.used_blocks(), 2);

        for index in (DIRECT_POINTERS + p..blocks - 1).rev() {
            manager.free_block(index).unwrap();
        }
        assert_eq!(
            allocator.with_inode(inode, |record| record.double_indirect.get()),
            EMPTY
        );
        assert_eq!(allocator.used_blocks(), DIRECT_POINTERS + p + 1);
        assert_eq!(manager.block_count(), DIRECT_POINTERS + p);
    }

    #[test]
    fn allocate_is_idempotent() {
        let allocator = allocator(4096, 64);
        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        let first = manager
            .allocate_block(0, &mut allocator.free_list())
            .unwrap()
            .block_no();
        let again = manager
            .allocate_block(0, &mut allocator.free_list())
            .unwrap()
            .block_no();
        assert_eq!(first, again);
        assert_eq!(allocator.used_blocks(), 1);
    }

    #[test]
    fn object_too_large() {
        let allocator = allocator(512, 64);
        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        let max = allocator.max_blocks_per_object();
        assert!(matches!(
            manager.allocate_block(max, &mut allocator.free_list()),
            Err(AllocatorError::ObjectTooLarge { .. })
        ));
    }

    #[test]
    fn exhausted_source() {
        let allocator = allocator(4096, 16);
        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        let mut source = allocator.free_list();
        for index in 0..14 {
            manager.allocate_block(index, &mut source).unwrap();
        }
        // one block left: taken by the indirect block, none for the data
        assert!(matches!(
            manager.allocate_block(14, &mut source),
            Err(AllocatorError::Exhausted)
        ));
        assert_eq!(manager.free_all(), 15);
        assert_eq!(allocator.used_blocks(), 0);
    }

    #[test]
    fn reserved_blocks_are_returned() {
        let allocator = allocator(4096, 64);
        let blocks: Vec<_> = (0..20)
            .map(|_| allocator.allocate_data_block().unwrap())
            .collect();
        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        {
            let mut reserved = ReservedBlocks::new(&allocator, blocks);
            for index in 0..10 {
                manager.allocate_block(index, &mut reserved).unwrap();
            }
            assert_eq!(reserved.remaining(), 10);
        }
        assert_eq!(allocator.used_blocks(), 10);
    }

    #[test]
    fn concurrent_objects() {
        use std::sync::Arc;

        const NUM_THREADS: usize = 8;
        let allocator = Arc::new(BlockAllocator::with_capacity(512, 4096, 64, 1 << 16, 8).unwrap());
        let mut handles = Vec::new();

        for i in 0..NUM_THREADS {
            let allocator = allocator.clone();
            let handle = std::thread::spawn(move || {
                for round in 0..20 {
                    let blocks = 1 + (i * 7 + round * 13) % 200;
                    let inode = write_object(&allocator, blocks);
                    check_object(&allocator, inode, blocks);
                    allocator.block_manager(inode).free_all();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(allocator.used_blocks(), 0);
        assert_eq!(allocator.used_inodes(), 0);
    }
}
