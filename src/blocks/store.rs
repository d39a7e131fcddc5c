use crate::blocks::BlockNo;

use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use memmap2::MmapMut;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// SAFETY:
// The mapping is only ever accessed through `base`, and every access to a
// block goes through the latch of that block in `BlockByteStore::latches`,
// so it is safe to share a segment between threads.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

// Anonymous mappings keep block bytes contiguous and off the heap, with no
// lock metadata interleaved between blocks.
struct Segment {
    // keeps the mapping alive; never dereferenced after construction
    _map: MmapMut,
    base: NonNull<u8>,
}

impl Segment {
    fn new(len: usize) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(len)?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| io::Error::other("null mapping"))?;
        Ok(Self { _map: map, base })
    }
}

/// A flat space of fixed-size blocks backed by large memory segments.
///
/// Given a block number the store hands out a bounded view of exactly that
/// block, guarded by a per-block latch: [`BlockRef`] for shared reads,
/// [`BlockRefMut`] for an exclusive write. Which caller may write which
/// block is decided by the allocator layer; the store only guarantees that
/// views of the same block never alias mutably.
///
/// ```text
///  block_no ──► segment = block_no >> blocks_per_segment_shift
///               offset  = (block_no & mask) * block_size
///
///  +--------------------+--------------------+-----
///  | segment 0 (mmap)   | segment 1 (mmap)   | ...
///  | b0 | b1 | .. | bn  | b0 | b1 | .. | bn  |
///  +--------------------+--------------------+-----
/// ```
pub struct BlockByteStore {
    segments: Box<[Segment]>,
    latches: Box<[RwLock<()>]>,
    block_size: usize,
    block_count: usize,
    blocks_per_segment_shift: u32,
}

impl BlockByteStore {
    /// Maps `block_count` blocks of `block_size` bytes, in segments of at
    /// most `segment_size` bytes.
    pub fn new(block_size: usize, block_count: usize, segment_size: usize) -> io::Result<Self> {
        assert!(block_size.is_power_of_two());
        assert!(segment_size.is_power_of_two() && segment_size >= block_size);
        assert!(block_count > 0 && block_count < (1 << 31));

        let blocks_per_segment = segment_size / block_size;
        let segment_count = block_count.div_ceil(blocks_per_segment);
        let segments = (0..segment_count)
            .map(|i| {
                let blocks = blocks_per_segment.min(block_count - i * blocks_per_segment);
                Segment::new(blocks * block_size)
            })
            .collect::<io::Result<Box<[_]>>>()?;
        let latches = std::iter::repeat_with(|| RwLock::new(()))
            .take(block_count)
            .collect();

        Ok(Self {
            segments,
            latches,
            block_size,
            block_count,
            blocks_per_segment_shift: blocks_per_segment.trailing_zeros(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    fn block_ptr(&self, block_no: BlockNo) -> *mut u8 {
        let block_no = block_no as usize;
        assert!(
            block_no < self.block_count,
            "block {block_no} out of range 0..{}",
            self.block_count
        );
        let segment = &self.segments[block_no >> self.blocks_per_segment_shift];
        let offset = (block_no & ((1 << self.blocks_per_segment_shift) - 1)) * self.block_size;
        // SAFETY: offset + block_size lies within the segment mapping
        unsafe { segment.base.as_ptr().add(offset) }
    }

    /// Shared view of a block.
    pub fn block(&self, block_no: BlockNo) -> BlockRef<'_> {
        let ptr = self.block_ptr(block_no);
        let _guard = self.latches[block_no as usize].read();
        // SAFETY: the read latch excludes any BlockRefMut of this block
        let data = unsafe { std::slice::from_raw_parts(ptr, self.block_size) };
        BlockRef {
            _guard,
            block_no,
            data,
        }
    }

    /// Exclusive view of a block.
    pub fn block_mut(&self, block_no: BlockNo) -> BlockRefMut<'_> {
        let ptr = self.block_ptr(block_no);
        let _guard = self.latches[block_no as usize].write();
        // SAFETY: the write latch excludes any other view of this block
        let data = unsafe { std::slice::from_raw_parts_mut(ptr, self.block_size) };
        BlockRefMut {
            _guard,
            block_no,
            data,
        }
    }
}

pub struct BlockRef<'store> {
    _guard: RwLockReadGuard<'store, ()>,
    block_no: BlockNo,
    data: &'store [u8],
}

pub struct BlockRefMut<'store> {
    _guard: RwLockWriteGuard<'store, ()>,
    block_no: BlockNo,
    data: &'store mut [u8],
}

impl BlockRef<'_> {
    pub fn block_no(&self) -> BlockNo {
        self.block_no
    }
}

impl BlockRefMut<'_> {
    pub fn block_no(&self) -> BlockNo {
        self.block_no
    }
}

impl Deref for BlockRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl Deref for BlockRefMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl DerefMut for BlockRefMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
