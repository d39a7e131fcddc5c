use crate::cache::{CacheError, Serializer};
use crate::inode::{BlockManager, BlockSource};
use crate::storage::BlockStore;

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

/// Bytes of the length prefix in front of every payload.
pub(crate) const HEADER_SIZE: usize = 8;

/// Serializes `object` into `[payload length: u64 le][payload]`.
pub(crate) fn encode<T>(serializer: &dyn Serializer<T>, object: &T) -> Result<Vec<u8>, CacheError> {
    let mut frame = Vec::new();
    frame
        .write_u64::<LittleEndian>(0)
        .map_err(CacheError::Serialization)?;
    serializer
        .serialize(object, &mut frame)
        .map_err(CacheError::Serialization)?;
    let payload = (frame.len() - HEADER_SIZE) as u64;
    LittleEndian::write_u64(&mut frame[..HEADER_SIZE], payload);
    Ok(frame)
}

/// Deserializes a frame held in `source`, which must not yield more than
/// `capacity` bytes.
pub(crate) fn decode<T>(
    serializer: &dyn Serializer<T>,
    mut source: impl Read,
    capacity: usize,
) -> Result<T, CacheError> {
    let payload = source
        .read_u64::<LittleEndian>()
        .map_err(|_| CacheError::Corrupted)?;
    if payload > capacity.saturating_sub(HEADER_SIZE) as u64 {
        return Err(CacheError::Corrupted);
    }
    let mut payload = source.take(payload);
    serializer
        .deserialize(&mut payload)
        .map_err(CacheError::Serialization)
}

/// Copies `frame` into logical blocks `0..` of an empty inode.
pub(crate) fn write_blocks(
    manager: &BlockManager<'_>,
    frame: &[u8],
    source: &mut impl BlockSource,
) -> Result<usize, CacheError> {
    let block_size = manager.block_size();
    let mut blocks = 0;
    for (index, chunk) in frame.chunks(block_size).enumerate() {
        let mut block = manager.allocate_block(index, source)?;
        block[..chunk.len()].copy_from_slice(chunk);
        manager.update(block);
        blocks += 1;
    }
    Ok(blocks)
}

/// Streams the bytes of an inode, one block latch at a time.
pub(crate) struct BlockReader<'a> {
    manager: BlockManager<'a>,
    block_size: usize,
    position: usize,
    end: usize,
}

impl<'a> BlockReader<'a> {
    pub fn new(manager: BlockManager<'a>, len: usize) -> Self {
        let block_size = manager.block_size();
        Self {
            manager,
            block_size,
            position: 0,
            end: len,
        }
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.end || buf.is_empty() {
            return Ok(0);
        }
        let index = self.position / self.block_size;
        let offset = self.position % self.block_size;
        let len = buf
            .len()
            .min(self.block_size - offset)
            .min(self.end - self.position);

        let block = self.manager.get_block(index).map_err(io::Error::other)?;
        buf[..len].copy_from_slice(&block[offset..offset + len]);
        self.position += len;
        Ok(len)
    }
}

/// Streams the bytes of a storage slot.
pub(crate) struct SlotReader<'a> {
    store: &'a BlockStore,
    slot: u32,
    position: usize,
    end: usize,
}

impl<'a> SlotReader<'a> {
    pub fn new(store: &'a BlockStore, slot: u32, len: usize) -> Self {
        Self {
            store,
            slot,
            position: 0,
            end: len,
        }
    }
}

impl Read for SlotReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.end - self.position);
        if len == 0 {
            return Ok(0);
        }
        self.store
            .read(self.slot, self.position, &mut buf[..len])
            .map_err(io::Error::other)?;
        self.position += len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::GroupId;
    use crate::inode::BlockAllocator;
    use crate::storage::MemoryStorageManager;

    use std::io::{BufReader, Write};
    use std::sync::Arc;

    struct Bytes;

    impl Serializer<Vec<u8>> for Bytes {
        fn id(&self) -> GroupId {
            0
        }

        fn serialize(&self, object: &Vec<u8>, sink: &mut dyn Write) -> io::Result<()> {
            sink.write_all(object)
        }

        fn deserialize(&self, source: &mut dyn Read) -> io::Result<Vec<u8>> {
            let mut object = Vec::new();
            source.read_to_end(&mut object)?;
            Ok(object)
        }
    }

    #[test]
    fn frame_through_blocks() {
        let allocator = BlockAllocator::with_capacity(512, 64, 4, 4096, 1).unwrap();
        let object: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let frame = encode(&Bytes, &object).unwrap();
        assert_eq!(frame.len(), 3008);
        assert_eq!(LittleEndian::read_u64(&frame), 3000);

        let inode = allocator.allocate_inode().unwrap();
        let manager = allocator.block_manager(inode);
        let blocks = write_blocks(&manager, &frame, &mut allocator.free_list()).unwrap();
        assert_eq!(blocks, 6);

        let reader = BlockReader::new(allocator.block_manager(inode), frame.len());
        let decoded = decode(&Bytes, reader, blocks * 512).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn frame_through_storage_slot() {
        let storage = Arc::new(MemoryStorageManager::new());
        let store = BlockStore::new(storage, 3, 512, 8, 2, 1).unwrap();
        let object: Vec<u8> = (0..3000).map(|i| (i % 241) as u8).collect();
        let frame = encode(&Bytes, &object).unwrap();

        let slot = store.allocate().unwrap();
        store.write(slot, 0, &frame).unwrap();

        let reader = BufReader::with_capacity(512, SlotReader::new(&store, slot, frame.len()));
        assert_eq!(decode(&Bytes, reader, frame.len()).unwrap(), object);

        // a short slot read cannot hold the header
        let reader = SlotReader::new(&store, slot, 4);
        assert!(matches!(
            decode(&Bytes, reader, 4),
            Err(CacheError::Corrupted)
        ));
    }

    #[test]
    fn corrupted_length() {
        let mut frame = encode(&Bytes, &vec![1u8; 10]).unwrap();
        LittleEndian::write_u64(&mut frame[..HEADER_SIZE], 1 << 40);
        assert!(matches!(
            decode(&Bytes, frame.as_slice(), frame.len()),
            Err(CacheError::Corrupted)
        ));
        assert!(matches!(
            decode(&Bytes, &frame[..4], 4096),
            Err(CacheError::Corrupted)
        ));
    }
}
