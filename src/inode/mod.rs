mod allocator;
mod manager;

pub use allocator::BlockAllocator;
pub use manager::BlockManager;

use crate::blocks::{BlockNo, EMPTY};

use std::io;

use thiserror::Error;
use zerocopy::little_endian::I32;
use zerocopy_derive::*;

/// Direct block pointers held by an inode.
pub const DIRECT_POINTERS: usize = 14;

/// Size of an inode record.
pub const INODE_SIZE: usize = std::mem::size_of::<Inode>();

const _: () = assert!(INODE_SIZE == 64);

pub type InodeId = u32;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("no free data block")]
    Exhausted,
    #[error("no free inode")]
    InodesExhausted,
    #[error("object of {blocks} blocks exceeds the maximum of {max} blocks")]
    ObjectTooLarge { blocks: usize, max: usize },
    #[error("logical block {0} is not allocated")]
    BlockNotAllocated(usize),
    #[error("cannot map memory segments")]
    Mmap(#[from] io::Error),
}

/// Metadata record of one logical object.
///
/// ```text
/// +-------------------------------+----------+-----------------+
/// | direct[0..14] (4 bytes each)  | indirect | double indirect |
/// +-------------------------------+----------+-----------------+
///        |                            |               |
///        v                            v               v
///   data blocks              [P pointers]      [P pointers]
///                                 |                 |
///                                 v                 v
///                            data blocks      [P pointers] ...
///                                                   |
///                                                   v
///                                              data blocks
/// ```
///
/// Unused slots hold [`EMPTY`]. Slots are filled left to right, so the
/// first empty slot bounds the number of blocks of the object.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Inode {
    pub direct: [I32; DIRECT_POINTERS],
    pub indirect: I32,
    pub double_indirect: I32,
}

impl Inode {
    pub fn clear(&mut self) {
        for pointer in self.direct.iter_mut() {
            pointer.set(EMPTY);
        }
        self.indirect.set(EMPTY);
        self.double_indirect.set(EMPTY);
    }
}

/// Position of a logical block within the inode addressing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect { outer: usize, inner: usize },
}

impl Slot {
    pub fn for_index(index: usize, pointers_per_block: usize) -> Option<Self> {
        if index < DIRECT_POINTERS {
            return Some(Slot::Direct(index));
        }
        let index = index - DIRECT_POINTERS;
        if index < pointers_per_block {
            return Some(Slot::Indirect(index));
        }
        let index = index - pointers_per_block;
        (index < pointers_per_block * pointers_per_block).then_some(Slot::DoubleIndirect {
            outer: index / pointers_per_block,
            inner: index % pointers_per_block,
        })
    }
}

/// Largest number of logical blocks an inode can address.
pub fn max_blocks_per_object(pointers_per_block: usize) -> usize {
    DIRECT_POINTERS + pointers_per_block + pointers_per_block * pointers_per_block
}

/// Number of pointer blocks needed to address `blocks` logical blocks.
pub fn pointer_blocks_for(blocks: usize, pointers_per_block: usize) -> usize {
    if blocks <= DIRECT_POINTERS {
        0
    } else if blocks <= DIRECT_POINTERS + pointers_per_block {
        1
    } else {
        let second_level = blocks - DIRECT_POINTERS - pointers_per_block;
        2 + second_level.div_ceil(pointers_per_block)
    }
}

/// Where newly linked blocks come from.
///
/// Block allocation never evicts while pointer latches are held; callers
/// that may need to evict reserve the blocks up front and hand them over
/// as [`ReservedBlocks`].
pub trait BlockSource {
    fn next_block(&mut self) -> Result<BlockNo, AllocatorError>;
}

/// Takes blocks straight from the allocator's free list.
pub struct FreeList<'a>(pub(crate) &'a BlockAllocator);

impl BlockSource for FreeList<'_> {
    fn next_block(&mut self) -> Result<BlockNo, AllocatorError> {
        self.0.allocate_data_block().ok_or(AllocatorError::Exhausted)
    }
}

/// Blocks reserved ahead of time; whatever is left is freed on drop.
pub struct ReservedBlocks<'a> {
    allocator: &'a BlockAllocator,
    blocks: Vec<BlockNo>,
}

impl<'a> ReservedBlocks<'a> {
    pub fn new(allocator: &'a BlockAllocator, blocks: Vec<BlockNo>) -> Self {
        Self { allocator, blocks }
    }

    pub fn push(&mut self, block: BlockNo) {
        self.blocks.push(block);
    }

    pub fn remaining(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockSource for ReservedBlocks<'_> {
    fn next_block(&mut self) -> Result<BlockNo, AllocatorError> {
        self.blocks.pop().ok_or(AllocatorError::Exhausted)
    }
}

impl Drop for ReservedBlocks<'_> {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.allocator.free_data_block(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_boundaries() {
        let p = 1024;
        assert_eq!(Slot::for_index(0, p), Some(Slot::Direct(0)));
        assert_eq!(Slot::for_index(13, p), Some(Slot::Direct(13)));
        assert_eq!(Slot::for_index(14, p), Some(Slot::Indirect(0)));
        assert_eq!(Slot::for_index(19, p), Some(Slot::Indirect(5)));
        assert_eq!(Slot::for_index(14 + p - 1, p), Some(Slot::Indirect(p - 1)));
        assert_eq!(
            Slot::for_index(14 + p, p),
            Some(Slot::DoubleIndirect { outer: 0, inner: 0 })
        );
        assert_eq!(
            Slot::for_index(14 + p + p + 3, p),
            Some(Slot::DoubleIndirect { outer: 1, inner: 3 })
        );
        assert_eq!(Slot::for_index(max_blocks_per_object(p), p), None);
    }

    #[test]
    fn pointer_block_counts() {
        let p = 128;
        assert_eq!(pointer_blocks_for(5, p), 0);
        assert_eq!(pointer_blocks_for(14, p), 0);
        assert_eq!(pointer_blocks_for(15, p), 1);
        assert_eq!(pointer_blocks_for(14 + p, p), 1);
        assert_eq!(pointer_blocks_for(14 + p + 1, p), 3);
        assert_eq!(pointer_blocks_for(14 + 3 * p, p), 4);
        assert_eq!(pointer_blocks_for(14 + 3 * p + 1, p), 5);
    }

    #[test]
    fn inode_layout() {
        use zerocopy::IntoBytes;

        let mut inode = Inode {
            direct: [I32::new(0); DIRECT_POINTERS],
            indirect: I32::new(0),
            double_indirect: I32::new(0),
        };
        inode.clear();
        inode.direct[0].set(7);
        let bytes = inode.as_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &7i32.to_le_bytes());
        assert_eq!(&bytes[56..60], &EMPTY.to_le_bytes());
        assert!(bytes[4..].iter().all(|&b| b == 0xff));
    }
}
