use crate::buffer::reserve::{BufferReserveMode, ReservePool};
use crate::buffer::soft_cache::SoftCache;
use crate::buffer::tuple_buffer::TupleBuffer;
use crate::buffer::{AnyBatch, BatchCodec, BufferError, GroupSerializer, PersistBatch};
use crate::cache::{GroupId, ObjectKey, TieredCache};
use crate::config::Config;
use crate::eviction::{EvictionKey, EvictionQueue};
use crate::schema::BatchSchema;
use crate::storage::StorageManager;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

/// A batch held in process memory, not yet persisted.
struct Resident {
    batch: AnyBatch,
    persist: Arc<dyn PersistBatch>,
    size_kb: i64,
    eviction_key: EvictionKey,
}

/// Entry point of the batch layer.
///
/// Batches added to tuple buffers stay in process memory while the quota
/// allows it. Whenever resident batches outgrow the unreserved quota, the
/// least valuable ones are written to the [`TieredCache`], which in turn
/// spills to storage under memory pressure.
pub struct BufferManager {
    cache: TieredCache,
    reserve: ReservePool,
    resident: Mutex<HashMap<ObjectKey, Resident>>,
    resident_order: EvictionQueue<ObjectKey>,
    active_batch_kb: AtomicI64,
    soft: SoftCache<ObjectKey, dyn Any + Send + Sync>,
    next_group: AtomicI64,
}

impl BufferManager {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageManager>,
    ) -> Result<Arc<Self>, BufferError> {
        let reserve = ReservePool::new(config.max_reserve_kb(), &config.buffer);
        let soft = SoftCache::new(config.buffer.soft_cache_entries, config.buffer.weak_cache);
        let resident_order = EvictionQueue::new(config.lrfu.clone());
        let cache = TieredCache::new(config, storage)?;

        info!(max_reserve_kb = reserve.max_kb(), "buffer manager ready");

        Ok(Arc::new(Self {
            cache,
            reserve,
            resident: Mutex::new(HashMap::new()),
            resident_order,
            active_batch_kb: AtomicI64::new(0),
            soft,
            next_group: AtomicI64::new(0),
        }))
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// Creates an empty tuple buffer backed by a new cache group.
    pub fn create_tuple_buffer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        schema: BatchSchema,
        codec: Arc<dyn BatchCodec<T>>,
    ) -> Result<TupleBuffer<T>, BufferError> {
        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        self.cache.create_cache_group(group)?;
        debug!(group, columns = schema.num_columns(), "created tuple buffer");

        Ok(TupleBuffer::new(
            self.clone(),
            schema,
            Arc::new(GroupSerializer::new(group, codec)),
        ))
    }

    /// Reserves quota for work outside the resident batches.
    ///
    /// Resident batches that no longer fit the unreserved quota are
    /// persisted before returning.
    pub fn reserve_buffers(&self, kb: i64, mode: BufferReserveMode) -> Result<i64, BufferError> {
        let granted = self.reserve.reserve(kb, mode);
        self.persist_overflow()?;
        Ok(granted)
    }

    pub fn release_buffers(&self, kb: i64) {
        self.reserve.release(kb);
    }

    pub fn reserved_kb(&self) -> i64 {
        self.reserve.reserved_kb()
    }

    /// Estimated KB of batches held in process memory.
    pub fn active_batch_kb(&self) -> i64 {
        self.active_batch_kb.load(Ordering::Acquire)
    }

    /// Deletes the batches of `group` everywhere.
    pub fn remove_group(&self, group: GroupId) -> Result<(), BufferError> {
        let removed = {
            let mut resident = self.resident.lock();
            let keys: Vec<_> = resident.keys().filter(|k| k.group == group).copied().collect();
            keys.into_iter()
                .filter_map(|key| resident.remove(&key).map(|batch| (key, batch)))
                .collect::<Vec<_>>()
        };
        for (key, batch) in removed {
            self.resident_order.remove(&key, &batch.eviction_key);
            self.active_batch_kb.fetch_sub(batch.size_kb, Ordering::AcqRel);
        }
        self.soft.retain(|key| key.group != group);

        let ids = self.cache.remove_cache_group(group)?;
        debug!(group, batches = ids.len(), "removed tuple buffer");
        Ok(())
    }

    pub(crate) fn add_batch<T: Send + Sync + 'static>(
        &self,
        key: ObjectKey,
        batch: Arc<T>,
        serializer: &Arc<GroupSerializer<T>>,
        size_kb: i64,
    ) -> Result<(), BufferError> {
        if !self.cache.add_to_cache_group(key.group, key.id)? {
            return Err(BufferError::BatchNotFound {
                group: key.group,
                id: key.id,
            });
        }

        let eviction_key = self
            .resident_order
            .policy()
            .next_key(&EvictionKey::default());
        self.resident.lock().insert(
            key,
            Resident {
                batch,
                persist: serializer.clone(),
                size_kb,
                eviction_key,
            },
        );
        self.resident_order.add(key, &eviction_key);
        self.active_batch_kb.fetch_add(size_kb, Ordering::AcqRel);
        trace!(group = key.group, id = key.id, size_kb, "added batch");

        if let Err(e) = self.persist_overflow() {
            warn!(
                error = %e,
                active_kb = self.active_batch_kb(),
                "batches stay resident over quota"
            );
        }
        Ok(())
    }

    pub(crate) fn get_batch<T: Send + Sync + 'static>(
        &self,
        key: ObjectKey,
        serializer: &GroupSerializer<T>,
    ) -> Result<Arc<T>, BufferError> {
        let resident = {
            let mut resident = self.resident.lock();
            resident.get_mut(&key).map(|entry| {
                self.resident_order.touch(&key, &mut entry.eviction_key);
                entry.batch.clone()
            })
        };
        if let Some(batch) = resident.or_else(|| self.soft.get(&key)) {
            return Ok(downcast(key, batch));
        }

        let Some(entry) = self.cache.get(key.id, serializer)? else {
            return Err(BufferError::BatchNotFound {
                group: key.group,
                id: key.id,
            });
        };
        let batch: AnyBatch = entry.object.clone();
        if serializer.codec().prefers_soft_cache() {
            self.soft.insert_strong(key, batch);
        } else {
            self.soft.insert_weak(key, &batch);
        }
        Ok(entry.object)
    }

    pub(crate) fn remove_batch(&self, key: ObjectKey) -> Result<bool, BufferError> {
        if let Some(batch) = self.resident.lock().remove(&key) {
            self.resident_order.remove(&key, &batch.eviction_key);
            self.active_batch_kb.fetch_sub(batch.size_kb, Ordering::AcqRel);
        }
        self.soft.remove(&key);
        Ok(self.cache.remove(key.group, key.id)?)
    }

    fn unreserved_kb(&self) -> i64 {
        self.reserve.available_kb()
    }

    /// Persists the least valuable resident batches until the rest fit
    /// the unreserved quota.
    fn persist_overflow(&self) -> Result<(), BufferError> {
        while self.active_batch_kb() > self.unreserved_kb().max(0) {
            let Some(key) = self.resident_order.poll_first() else {
                break;
            };
            // stays readable from the resident set until persisted
            let Some((batch, persist)) = self
                .resident
                .lock()
                .get(&key)
                .map(|entry| (entry.batch.clone(), entry.persist.clone()))
            else {
                continue;
            };

            if let Err(e) = persist.persist(&self.cache, key.id, &batch) {
                if let Some(entry) = self.resident.lock().get(&key) {
                    self.resident_order.add(key, &entry.eviction_key);
                }
                return Err(e.into());
            }

            // a batch removed meanwhile must not reach the side cache
            let Some(entry) = self.resident.lock().remove(&key) else {
                continue;
            };
            self.active_batch_kb.fetch_sub(entry.size_kb, Ordering::AcqRel);
            if persist.prefers_soft_cache() {
                self.soft.insert_strong(key, batch);
            } else {
                self.soft.insert_weak(key, &batch);
            }
            trace!(
                group = key.group,
                id = key.id,
                size_kb = entry.size_kb,
                "persisted batch"
            );
        }
        Ok(())
    }
}

fn downcast<T: Send + Sync + 'static>(key: ObjectKey, batch: AnyBatch) -> Arc<T> {
    batch
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("batch {} of group {} has another type", key.id, key.group))
}
