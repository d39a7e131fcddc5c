mod manager;
mod reserve;
mod soft_cache;
mod tuple_buffer;

pub use manager::BufferManager;
pub use reserve::{BufferReserveMode, ReservePool};
pub use soft_cache::SoftCache;
pub use tuple_buffer::TupleBuffer;

use crate::cache::{CacheEntry, CacheError, GroupId, ObjectId, Serializer, TieredCache};

use std::any::Any;
use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("cache")]
    Cache(#[from] CacheError),
    #[error("batch {id} of group {group} not found")]
    BatchNotFound { group: GroupId, id: ObjectId },
}

/// Encodes the batches of a tuple buffer.
///
/// The buffer manager frames and places the bytes; the codec owns the
/// batch format.
pub trait BatchCodec<T>: Send + Sync {
    fn encode(&self, batch: &T, sink: &mut dyn Write) -> io::Result<()>;
    fn decode(&self, source: &mut dyn Read) -> io::Result<T>;
    /// Rows in `batch`, used to estimate its memory footprint.
    fn row_count(&self, batch: &T) -> usize;
    /// Keep recently persisted batches strongly referenced.
    fn prefers_soft_cache(&self) -> bool {
        false
    }
}

/// Binds a [`BatchCodec`] to the cache group of one tuple buffer.
pub(crate) struct GroupSerializer<T> {
    group: GroupId,
    codec: Arc<dyn BatchCodec<T>>,
}

impl<T> GroupSerializer<T> {
    pub(crate) fn new(group: GroupId, codec: Arc<dyn BatchCodec<T>>) -> Self {
        Self { group, codec }
    }

    pub(crate) fn codec(&self) -> &dyn BatchCodec<T> {
        self.codec.as_ref()
    }
}

impl<T> Serializer<T> for GroupSerializer<T> {
    fn id(&self) -> GroupId {
        self.group
    }

    fn serialize(&self, object: &T, sink: &mut dyn Write) -> io::Result<()> {
        self.codec.encode(object, sink)
    }

    fn deserialize(&self, source: &mut dyn Read) -> io::Result<T> {
        self.codec.decode(source)
    }

    fn prefers_soft_cache(&self) -> bool {
        self.codec.prefers_soft_cache()
    }
}

pub(crate) type AnyBatch = Arc<dyn Any + Send + Sync>;

/// Type erased persistence of a resident batch.
pub(crate) trait PersistBatch: Send + Sync {
    fn persist(
        &self,
        cache: &TieredCache,
        id: ObjectId,
        batch: &AnyBatch,
    ) -> Result<bool, CacheError>;

    fn prefers_soft_cache(&self) -> bool;
}

impl<T: Send + Sync + 'static> PersistBatch for GroupSerializer<T> {
    fn persist(
        &self,
        cache: &TieredCache,
        id: ObjectId,
        batch: &AnyBatch,
    ) -> Result<bool, CacheError> {
        let object = batch
            .clone()
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("batch {id} of group {} has another type", self.group));
        cache.add(&CacheEntry { id, object }, self)
    }

    fn prefers_soft_cache(&self) -> bool {
        self.codec.prefers_soft_cache()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    /// Rows of `i64` values.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Rows(pub Vec<i64>);

    pub struct RowsCodec {
        pub soft: bool,
    }

    impl BatchCodec<Rows> for RowsCodec {
        fn encode(&self, batch: &Rows, sink: &mut dyn Write) -> io::Result<()> {
            sink.write_u32::<LittleEndian>(batch.0.len() as u32)?;
            for value in &batch.0 {
                sink.write_i64::<LittleEndian>(*value)?;
            }
            Ok(())
        }

        fn decode(&self, source: &mut dyn Read) -> io::Result<Rows> {
            let len = source.read_u32::<LittleEndian>()? as usize;
            let mut rows = Vec::with_capacity(len);
            for _ in 0..len {
                rows.push(source.read_i64::<LittleEndian>()?);
            }
            Ok(Rows(rows))
        }

        fn row_count(&self, batch: &Rows) -> usize {
            batch.0.len()
        }

        fn prefers_soft_cache(&self) -> bool {
            self.soft
        }
    }
}
