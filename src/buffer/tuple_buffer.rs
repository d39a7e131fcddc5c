use crate::buffer::manager::BufferManager;
use crate::buffer::{BufferError, GroupSerializer};
use crate::cache::{GroupId, ObjectId, ObjectKey, Serializer};
use crate::schema::BatchSchema;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// An ordered collection of batches sharing one schema.
///
/// Dropping the buffer deletes every batch it holds.
pub struct TupleBuffer<T: Send + Sync + 'static> {
    manager: Arc<BufferManager>,
    schema: BatchSchema,
    serializer: Arc<GroupSerializer<T>>,
    batches: Mutex<BTreeSet<ObjectId>>,
    next_id: AtomicI64,
    rows: AtomicUsize,
    removed: bool,
}

impl<T: Send + Sync + 'static> TupleBuffer<T> {
    pub(crate) fn new(
        manager: Arc<BufferManager>,
        schema: BatchSchema,
        serializer: Arc<GroupSerializer<T>>,
    ) -> Self {
        Self {
            manager,
            schema,
            serializer,
            batches: Mutex::new(BTreeSet::new()),
            next_id: AtomicI64::new(0),
            rows: AtomicUsize::new(0),
            removed: false,
        }
    }

    pub fn group(&self) -> GroupId {
        self.serializer.id()
    }

    pub fn schema(&self) -> &BatchSchema {
        &self.schema
    }

    /// Rows over all batches added so far.
    pub fn row_count(&self) -> usize {
        self.rows.load(Ordering::Acquire)
    }

    /// Appends `batch`, returning its id.
    pub fn add_batch(&self, batch: T) -> Result<ObjectId, BufferError> {
        let rows = self.serializer.codec().row_count(&batch);
        let size_kb = self.schema.estimate_batch_kb(rows);
        let key = self.key(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.manager
            .add_batch(key, Arc::new(batch), &self.serializer, size_kb)?;
        self.batches.lock().insert(key.id);
        self.rows.fetch_add(rows, Ordering::AcqRel);
        Ok(key.id)
    }

    pub fn get_batch(&self, id: ObjectId) -> Result<Arc<T>, BufferError> {
        if !self.batches.lock().contains(&id) {
            return Err(BufferError::BatchNotFound {
                group: self.group(),
                id,
            });
        }
        self.manager.get_batch(self.key(id), &self.serializer)
    }

    /// Returns whether `id` was part of the buffer.
    pub fn remove_batch(&self, id: ObjectId) -> Result<bool, BufferError> {
        if !self.batches.lock().remove(&id) {
            return Ok(false);
        }
        self.manager.remove_batch(self.key(id))?;
        Ok(true)
    }

    /// Ids of the batches in insertion order.
    pub fn batch_ids(&self) -> Vec<ObjectId> {
        self.batches.lock().iter().copied().collect()
    }

    /// Deletes the buffer and reports failures that dropping would only log.
    pub fn remove(mut self) -> Result<(), BufferError> {
        self.removed = true;
        self.manager.remove_group(self.group())
    }

    fn key(&self, id: ObjectId) -> ObjectKey {
        ObjectKey {
            group: self.group(),
            id,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for TupleBuffer<T> {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = self.manager.remove_group(self.group()) {
            warn!(group = self.group(), error = %e, "failed to remove tuple buffer");
        }
    }
}
