use crate::cache::entry::{Location, PhysicalInfo, PhysicalState};
use crate::cache::frame::{self, BlockReader, SlotReader};
use crate::cache::group::{CacheGroup, NO_INODE};
use crate::cache::{
    AllocationLock, CacheEntry, CacheError, CacheStats, GroupId, MemoryUsage, ObjectId,
    ObjectKey, Serializer, WritePermits,
};
use crate::config::Config;
use crate::directory::BlockHashDirectory;
use crate::eviction::EvictionQueue;
use crate::inode::{BlockAllocator, BlockSource, InodeId, ReservedBlocks};
use crate::storage::{BlockStore, StorageError, StorageManager};

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    storage_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    demotion_failures: AtomicU64,
    direct_to_storage: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum Eviction {
    Freed,
    /// Nothing freed yet, but pinned entries or demotions in flight will
    /// make progress.
    Busy,
    Nothing,
}

/// Failed eviction rounds of one allocation.
#[derive(Default)]
struct EvictionAttempts {
    idle: usize,
    busy: usize,
}

/// Two tier object cache: a block allocated memory tier in front of size
/// bucketed storage files.
///
/// Objects are framed with their length and live in exactly one tier. When
/// the memory tier runs out of blocks or inodes, the least valuable
/// resident objects (LRFU order) are copied to the storage bucket of their
/// size class and their memory is freed. Reading an object from storage
/// may promote it back into memory when it is hot and memory is free.
///
/// Every object belongs to a cache group and must be registered with
/// [`TieredCache::add_to_cache_group`] before it is added. Object ids are
/// non-negative.
///
/// Locks are taken in the order allocation lock, group, entry, eviction
/// queue. No group or entry lock is held while blocks are allocated, so
/// allocation can always evict.
pub struct TieredCache {
    config: Config,
    allocator: Arc<BlockAllocator>,
    buckets: Box<[BlockStore]>,
    groups: RwLock<HashMap<GroupId, Arc<CacheGroup>>>,
    queue: EvictionQueue<ObjectKey>,
    allocation: AllocationLock,
    permits: WritePermits,
    demotions: AtomicUsize,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: Config, storage: Arc<dyn StorageManager>) -> Result<Self, CacheError> {
        config.validate()?;

        let allocator = Arc::new(BlockAllocator::new(&config)?);
        let buckets = (0..config.storage_buckets())
            .map(|bucket| {
                BlockStore::new(
                    storage.clone(),
                    bucket,
                    config.block_size,
                    config.storage_slots_per_bucket,
                    config.storage_shards,
                    config.concurrency_level,
                )
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        let permits =
            WritePermits::new(config.memory_buffer_space / config.max_memory_object_size());

        info!(
            block_size = config.block_size,
            memory_blocks = config.memory_blocks(),
            inodes = config.inode_count(),
            storage_buckets = buckets.len(),
            write_permits = permits.total(),
            "created tiered cache"
        );

        Ok(Self {
            queue: EvictionQueue::new(config.lrfu.clone()),
            config,
            allocator,
            buckets,
            groups: RwLock::new(HashMap::new()),
            allocation: AllocationLock::new(),
            permits,
            demotions: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            storage_hits: c.storage_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            demotion_failures: c.demotion_failures.load(Ordering::Relaxed),
            direct_to_storage: c.direct_to_storage.load(Ordering::Relaxed),
        }
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            used_blocks: self.allocator.used_blocks(),
            total_blocks: self.allocator.block_count(),
            used_inodes: self.allocator.used_inodes(),
            block_size: self.allocator.block_size(),
        }
    }

    /// Number of objects in the eviction order, that is memory resident
    /// and not being relocated.
    pub fn evictable_objects(&self) -> usize {
        self.queue.len()
    }

    fn group(&self, group: GroupId) -> Option<Arc<CacheGroup>> {
        self.groups.read().get(&group).cloned()
    }

    fn member(&self, key: ObjectKey) -> Option<Arc<PhysicalInfo>> {
        let group = self.group(key.group)?;
        let info = group.state.lock().member(key.id);
        info
    }

    /// Creates an empty group. Returns `false` if it already exists.
    pub fn create_cache_group(&self, group: GroupId) -> Result<bool, CacheError> {
        if self.groups.read().contains_key(&group) {
            return Ok(false);
        }
        let directory = self.with_eviction(|| {
            Ok(self
                .allocation
                .allocate(|| BlockHashDirectory::new(self.allocator.clone()))?)
        })?;

        let mut groups = self.groups.write();
        if groups.contains_key(&group) {
            return Ok(false);
        }
        groups.insert(group, Arc::new(CacheGroup::new(group, directory)));
        debug!(group, "created cache group");
        Ok(true)
    }

    /// Registers `id` as a member of `group` without content.
    pub fn add_to_cache_group(&self, group: GroupId, id: ObjectId) -> Result<bool, CacheError> {
        let Some(group) = self.group(group) else {
            return Ok(false);
        };
        self.with_eviction(|| {
            self.allocation.allocate(|| {
                let mut state = group.state.lock();
                let state = &mut *state;
                let Some(directory) = state.directory.as_mut() else {
                    return Ok(false);
                };
                if state.entries.contains_key(&id) {
                    return Ok(false);
                }
                directory.put(id, NO_INODE)?;
                state.entries.insert(id, Arc::new(PhysicalInfo::new()));
                Ok(true)
            })
        })
    }

    /// Tears down `group`, freeing the memory and storage of every member.
    ///
    /// Returns the ids of the removed members.
    pub fn remove_cache_group(&self, group: GroupId) -> Result<Vec<ObjectId>, CacheError> {
        let Some(group) = self.groups.write().remove(&group) else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        let (directory, members) = {
            let mut state = group.state.lock();
            let mut directory = state.directory.take();
            let members = match directory.as_mut() {
                Some(directory) => directory.drain()?,
                None => HashMap::new(),
            };
            for (id, info) in state.entries.drain() {
                let mut entry = info.state.lock();
                entry.removed = true;
                self.queue.remove(
                    &ObjectKey {
                        group: group.id,
                        id,
                    },
                    &entry.eviction_key,
                );
                reclaimed.extend(entry.take_reclaimable());
            }
            (directory, members)
        };

        for location in reclaimed {
            self.free_location(location)?;
        }
        drop(directory);

        let mut ids: Vec<_> = members.into_keys().collect();
        ids.sort_unstable();
        debug!(group = group.id, objects = ids.len(), "removed cache group");
        Ok(ids)
    }

    /// Stores the object of `entry` in the group of `serializer`.
    ///
    /// Objects already stored are left alone, unless they sit in storage
    /// and are hot enough to be promoted. Returns whether the object was
    /// written; `false` also covers objects whose group or membership went
    /// away.
    pub fn add<T>(
        &self,
        entry: &CacheEntry<T>,
        serializer: &dyn Serializer<T>,
    ) -> Result<bool, CacheError> {
        let key = ObjectKey {
            group: serializer.id(),
            id: entry.id,
        };
        let Some(info) = self.member(key) else {
            return Ok(false);
        };

        {
            let mut state = info.state.lock();
            if state.removed || state.loading || state.evicting {
                return Ok(false);
            }
            match state.location {
                Location::Absent => {}
                Location::Storage { .. } if self.promotable(&state) => {}
                _ => return Ok(false),
            }
            state.loading = true;
        }

        let result = frame::encode(serializer, &entry.object)
            .and_then(|frame| self.store(key, &info, &frame, false));
        match result {
            Ok(true) => {
                trace!(group = key.group, id = key.id, "added object");
                Ok(true)
            }
            other => {
                self.abandon_load(&info)?;
                other
            }
        }
    }

    /// Reads the object `id` of the group of `serializer`.
    pub fn get<T>(
        &self,
        id: ObjectId,
        serializer: &dyn Serializer<T>,
    ) -> Result<Option<CacheEntry<T>>, CacheError> {
        let key = ObjectKey {
            group: serializer.id(),
            id,
        };
        let Some(info) = self.member(key) else {
            bump(&self.counters.misses);
            return Ok(None);
        };

        let (location, size) = {
            let mut state = info.state.lock();
            if state.removed || state.location == Location::Absent {
                bump(&self.counters.misses);
                return Ok(None);
            }
            state.pinned += 1;
            self.queue.touch(&key, &mut state.eviction_key);
            (state.location, state.size)
        };

        let result = match location {
            Location::Memory { inode } => {
                let reader = BlockReader::new(self.allocator.block_manager(inode), size);
                frame::decode(serializer, reader, size)
            }
            Location::Storage { slot, bucket } => {
                let reader = SlotReader::new(&self.buckets[bucket], slot, size);
                let reader = BufReader::with_capacity(self.config.block_size, reader);
                frame::decode(serializer, reader, size)
            }
            Location::Absent => unreachable!("pinned an absent entry"),
        };
        self.unpin(&info)?;
        let object = result?;

        if let Location::Memory { .. } = location {
            bump(&self.counters.memory_hits);
        } else {
            bump(&self.counters.storage_hits);
            if let Err(e) = self.try_promote(key, &info) {
                debug!(group = key.group, id, error = %e, "promotion failed");
            }
        }

        Ok(Some(CacheEntry {
            id,
            object: Arc::new(object),
        }))
    }

    /// Removes `id` from `group`, freeing its memory or storage.
    pub fn remove(&self, group: GroupId, id: ObjectId) -> Result<bool, CacheError> {
        let Some(group) = self.group(group) else {
            return Ok(false);
        };

        let reclaimed = {
            let mut state = group.state.lock();
            let state = &mut *state;
            let Some(directory) = state.directory.as_mut() else {
                return Ok(false);
            };
            if directory.remove(id)?.is_none() {
                return Ok(false);
            }
            let Some(info) = state.entries.remove(&id) else {
                return Ok(false);
            };
            let mut entry = info.state.lock();
            entry.removed = true;
            self.queue.remove(
                &ObjectKey {
                    group: group.id,
                    id,
                },
                &entry.eviction_key,
            );
            entry.take_reclaimable()
        };

        if let Some(location) = reclaimed {
            self.free_location(location)?;
        }
        Ok(true)
    }

    fn fits_memory(&self, size: usize) -> bool {
        size <= self.config.max_memory_object_size()
            && size.div_ceil(self.config.block_size) <= self.allocator.max_blocks_per_object()
    }

    /// Whether a stored object is worth moving back into memory.
    fn promotable(&self, state: &PhysicalState) -> bool {
        self.fits_memory(state.size) && self.is_hot(state)
    }

    fn is_hot(&self, state: &PhysicalState) -> bool {
        if state.eviction_key.is_untouched() {
            return false;
        }
        match self.queue.peek_first() {
            Some((_, coldest)) => state.eviction_key.order >= coldest,
            None => true,
        }
    }

    fn try_promote(&self, key: ObjectKey, info: &PhysicalInfo) -> Result<bool, CacheError> {
        let (slot, bucket, size) = {
            let mut state = info.state.lock();
            let idle = !state.removed && !state.loading && !state.evicting && state.pinned == 0;
            let Location::Storage { slot, bucket } = state.location else {
                return Ok(false);
            };
            if !idle || !self.promotable(&state) {
                return Ok(false);
            }
            state.loading = true;
            (slot, bucket, state.size)
        };

        // loading keeps the slot from being freed
        let mut frame = vec![0; size];
        let result = self.buckets[bucket]
            .read(slot, 0, &mut frame)
            .map_err(CacheError::from)
            .and_then(|()| self.store(key, info, &frame, true));
        match result {
            Ok(true) => {
                bump(&self.counters.promotions);
                debug!(group = key.group, id = key.id, "promoted object");
                Ok(true)
            }
            other => {
                self.abandon_load(info)?;
                other
            }
        }
    }

    /// Writes a frame for an entry marked `loading` and commits it.
    ///
    /// A promotion never waits or evicts; it gives up with `Ok(false)`
    /// instead.
    fn store(
        &self,
        key: ObjectKey,
        info: &PhysicalInfo,
        frame: &[u8],
        promotion: bool,
    ) -> Result<bool, CacheError> {
        let size = frame.len();
        let bucket = self.bucket_for(size)?;
        let blocks = size.div_ceil(self.config.block_size);

        let location = if self.fits_memory(size) {
            let inode = if promotion {
                let Some(_permit) = self.permits.try_acquire() else {
                    return Ok(false);
                };
                match self.write_memory_free_list(frame)? {
                    Some(inode) => inode,
                    None => return Ok(false),
                }
            } else {
                let _permit = self.permits.acquire();
                self.write_memory(frame)?
            };
            Location::Memory { inode }
        } else {
            if promotion {
                return Ok(false);
            }
            let slot = self.write_storage(bucket, frame)?;
            bump(&self.counters.direct_to_storage);
            Location::Storage { slot, bucket }
        };

        self.commit(key, info, location, size, blocks)
    }

    fn commit(
        &self,
        key: ObjectKey,
        info: &PhysicalInfo,
        location: Location,
        size: usize,
        blocks: usize,
    ) -> Result<bool, CacheError> {
        let group = self.group(key.group);
        let mut group_state = group.as_ref().map(|group| group.state.lock());
        let claimed = group_state
            .as_ref()
            .and_then(|state| state.member(key.id))
            .is_some_and(|member| std::ptr::eq(Arc::as_ptr(&member), info));

        let mut state = info.state.lock();
        state.loading = false;
        // removed concurrently, or a promotion racing a reader
        let promotion_blocked = state.pinned > 0 && state.location != Location::Absent;
        if !claimed || state.removed || promotion_blocked {
            let stale = state.take_reclaimable();
            drop(state);
            drop(group_state);
            self.free_location(location)?;
            if let Some(stale) = stale {
                self.free_location(stale)?;
            }
            return Ok(false);
        }

        if let Location::Memory { inode } = location {
            let directory = group_state
                .as_mut()
                .and_then(|state| state.directory.as_mut());
            if let Some(directory) = directory {
                // the key exists, so this never allocates
                directory.put(key.id, inode as i32)?;
            }
        }

        let previous = std::mem::replace(&mut state.location, location);
        state.size = size;
        state.memory_blocks = match location {
            Location::Memory { .. } => blocks,
            _ => 0,
        };
        self.queue.touch(&key, &mut state.eviction_key);
        if let Location::Memory { .. } = location {
            self.queue.add(key, &state.eviction_key);
        }
        drop(state);
        drop(group_state);

        self.free_location(previous)?;
        Ok(true)
    }

    fn abandon_load(&self, info: &PhysicalInfo) -> Result<(), CacheError> {
        let reclaimed = {
            let mut state = info.state.lock();
            state.loading = false;
            state.take_reclaimable()
        };
        if let Some(location) = reclaimed {
            self.free_location(location)?;
        }
        Ok(())
    }

    fn unpin(&self, info: &PhysicalInfo) -> Result<(), CacheError> {
        let reclaimed = {
            let mut state = info.state.lock();
            state.pinned -= 1;
            state.take_reclaimable()
        };
        if let Some(location) = reclaimed {
            self.free_location(location)?;
        }
        Ok(())
    }

    fn free_location(&self, location: Location) -> Result<(), CacheError> {
        match location {
            Location::Absent => {}
            Location::Memory { inode } => {
                self.allocator.block_manager(inode).free_all();
            }
            Location::Storage { slot, bucket } => self.buckets[bucket].free(slot)?,
        }
        Ok(())
    }

    fn bucket_for(&self, size: usize) -> Result<usize, CacheError> {
        let blocks = size.div_ceil(self.config.block_size).max(1);
        let bucket = blocks.next_power_of_two().trailing_zeros() as usize;
        if bucket >= self.buckets.len() {
            return Err(CacheError::ObjectTooLarge {
                size,
                max: self.config.block_size << (self.buckets.len() - 1),
            });
        }
        Ok(bucket)
    }

    /// Writes `frame` into a fresh inode, evicting as needed.
    fn write_memory(&self, frame: &[u8]) -> Result<InodeId, CacheError> {
        let blocks = frame.len().div_ceil(self.config.block_size);
        let needed = blocks + self.allocator.pointer_blocks_for(blocks);

        let inode = self.with_eviction(|| {
            Ok(self
                .allocation
                .allocate(|| self.allocator.allocate_inode())?)
        })?;
        let mut reserved = match self.reserve_blocks(needed) {
            Ok(reserved) => reserved,
            Err(e) => {
                self.allocator.block_manager(inode).free_all();
                return Err(e);
            }
        };
        self.fill_inode(inode, frame, &mut reserved)
    }

    /// Writes `frame` into a fresh inode using only free blocks.
    fn write_memory_free_list(&self, frame: &[u8]) -> Result<Option<InodeId>, CacheError> {
        let blocks = frame.len().div_ceil(self.config.block_size);
        if self.allocator.free_blocks() < blocks + self.allocator.pointer_blocks_for(blocks) {
            return Ok(None);
        }

        let result = self.allocation.allocate(|| -> Result<InodeId, CacheError> {
            let inode = self.allocator.allocate_inode()?;
            self.fill_inode(inode, frame, &mut self.allocator.free_list())
        });
        match result {
            Ok(inode) => Ok(Some(inode)),
            Err(e) if e.is_exhaustion() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fill_inode(
        &self,
        inode: InodeId,
        frame: &[u8],
        source: &mut impl BlockSource,
    ) -> Result<InodeId, CacheError> {
        let manager = self.allocator.block_manager(inode);
        match frame::write_blocks(&manager, frame, source) {
            Ok(_) => Ok(inode),
            Err(e) => {
                manager.free_all();
                Err(e)
            }
        }
    }

    fn write_storage(&self, bucket: usize, frame: &[u8]) -> Result<u32, CacheError> {
        let store = &self.buckets[bucket];
        let slot = store.allocate()?;
        if let Err(e) = self.write_with_retries(store, slot, 0, frame) {
            store.free(slot)?;
            return Err(e.into());
        }
        Ok(slot)
    }

    fn write_with_retries(
        &self,
        store: &BlockStore,
        slot: u32,
        offset: usize,
        buf: &[u8],
    ) -> Result<(), StorageError> {
        let attempts = self.config.write_retries.max(1);
        let mut attempt = 1;
        loop {
            match store.write(slot, offset, buf) {
                Err(e) if attempt < attempts => {
                    warn!(
                        bucket = store.bucket(),
                        slot,
                        attempt,
                        error = %e,
                        "storage write failed, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Reserves `count` data blocks, evicting as needed.
    fn reserve_blocks(&self, count: usize) -> Result<ReservedBlocks<'_>, CacheError> {
        let mut reserved = ReservedBlocks::new(&self.allocator, Vec::with_capacity(count));
        let mut attempts = EvictionAttempts::default();
        while reserved.remaining() < count {
            match self
                .allocation
                .allocate(|| self.allocator.allocate_data_block())
            {
                Some(block) => reserved.push(block),
                None => self.make_room(&mut attempts)?,
            }
        }
        Ok(reserved)
    }

    /// Runs `f` until it stops failing for lack of blocks or inodes.
    fn with_eviction<R>(
        &self,
        mut f: impl FnMut() -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut attempts = EvictionAttempts::default();
        loop {
            match f() {
                Err(e) if e.is_exhaustion() => self.make_room(&mut attempts)?,
                result => return result,
            }
        }
    }

    /// Evicts one object. Attempts that find nothing to evict count
    /// towards `eviction_attempts`, consecutive attempts that only find
    /// busy entries towards `busy_eviction_attempts`. Past either the
    /// memory tier is out of space.
    fn make_room(&self, attempts: &mut EvictionAttempts) -> Result<(), CacheError> {
        let exhausted = match self.evict_one()? {
            Eviction::Freed => {
                attempts.busy = 0;
                return Ok(());
            }
            Eviction::Busy => {
                attempts.busy += 1;
                attempts.busy >= self.config.busy_eviction_attempts
            }
            Eviction::Nothing => {
                attempts.idle += 1;
                attempts.idle >= self.config.eviction_attempts
            }
        };
        if exhausted {
            let total = attempts.idle + attempts.busy;
            warn!(
                idle = attempts.idle,
                busy = attempts.busy,
                "memory tier out of space"
            );
            return Err(CacheError::OutOfSpace { attempts: total });
        }
        thread::yield_now();
        Ok(())
    }

    /// Moves the least valuable resident object to storage.
    fn evict_one(&self) -> Result<Eviction, CacheError> {
        let (victim, busy) = self.allocation.select_victim(|| self.select_victim());
        let Some((key, info, inode)) = victim else {
            if busy || self.demotions.load(Ordering::Acquire) > 0 {
                return Ok(Eviction::Busy);
            }
            return Ok(Eviction::Nothing);
        };

        let result = self.demote(key, &info, inode);
        self.demotions.fetch_sub(1, Ordering::Release);
        match result {
            Ok(true) => Ok(Eviction::Freed),
            Ok(false) => Ok(Eviction::Busy),
            Err(e) => {
                bump(&self.counters.demotion_failures);
                warn!(group = key.group, id = key.id, error = %e, "demotion failed");
                let reclaimed = {
                    let mut state = info.state.lock();
                    state.evicting = false;
                    if !state.removed {
                        self.queue.add(key, &state.eviction_key);
                    }
                    state.take_reclaimable()
                };
                if let Some(location) = reclaimed {
                    self.free_location(location)?;
                }
                Err(e)
            }
        }
    }

    /// Picks the least valuable idle resident object and marks it
    /// `evicting`. Also tells whether busy entries were passed over.
    fn select_victim(&self) -> (Option<(ObjectKey, Arc<PhysicalInfo>, InodeId)>, bool) {
        let mut busy = Vec::new();
        let victim = loop {
            let Some(key) = self.queue.poll_first() else {
                break None;
            };
            let Some(info) = self.member(key) else {
                continue;
            };

            let mut state = info.state.lock();
            let location = state.location;
            let Location::Memory { inode } = location else {
                continue;
            };
            if state.removed || state.evicting || state.loading {
                continue;
            }
            if state.pinned > 0 {
                drop(state);
                busy.push((key, info));
                continue;
            }
            state.evicting = true;
            self.demotions.fetch_add(1, Ordering::AcqRel);
            drop(state);
            break Some((key, info, inode));
        };

        let passed_over = !busy.is_empty();
        for (key, info) in busy {
            let state = info.state.lock();
            if !state.removed && !state.evicting {
                self.queue.add(key, &state.eviction_key);
            }
        }
        (victim, passed_over)
    }

    fn demote(
        &self,
        key: ObjectKey,
        info: &PhysicalInfo,
        inode: InodeId,
    ) -> Result<bool, CacheError> {
        let size = info.state.lock().size;
        let bucket = self.bucket_for(size)?;
        let store = &self.buckets[bucket];
        let slot = store.allocate()?;
        if let Err(e) = self.copy_to_storage(inode, size, store, slot) {
            store.free(slot)?;
            return Err(e);
        }

        let group = self.group(key.group);
        let mut group_state = group.as_ref().map(|group| group.state.lock());
        let mut state = info.state.lock();
        state.evicting = false;

        if state.pinned > 0 {
            // a reader got in after the victim was chosen
            if !state.removed {
                self.queue.add(key, &state.eviction_key);
            }
            drop(state);
            drop(group_state);
            store.free(slot)?;
            return Ok(false);
        }

        if state.removed {
            state.location = Location::Absent;
            state.memory_blocks = 0;
            drop(state);
            drop(group_state);
            store.free(slot)?;
            self.allocator.block_manager(inode).free_all();
            return Ok(true);
        }

        state.location = Location::Storage { slot, bucket };
        state.memory_blocks = 0;
        drop(state);
        if let Some(directory) = group_state
            .as_mut()
            .and_then(|state| state.directory.as_mut())
        {
            directory.put(key.id, NO_INODE)?;
        }
        drop(group_state);

        let freed = self.allocator.block_manager(inode).free_all();
        bump(&self.counters.evictions);
        debug!(
            group = key.group,
            id = key.id,
            bucket,
            slot,
            freed,
            "demoted object to storage"
        );
        Ok(true)
    }

    fn copy_to_storage(
        &self,
        inode: InodeId,
        size: usize,
        store: &BlockStore,
        slot: u32,
    ) -> Result<(), CacheError> {
        let block_size = self.config.block_size;
        let manager = self.allocator.block_manager(inode);
        for index in 0..size.div_ceil(block_size) {
            let block = manager.get_block(index)?;
            let len = block_size.min(size - index * block_size);
            self.write_with_retries(store, slot, index * block_size, &block[..len])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::MemoryStorageManager;

    use std::io::{self, Read, Write};

    struct Bytes(GroupId);

    impl Serializer<Vec<u8>> for Bytes {
        fn id(&self) -> GroupId {
            self.0
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

    /// Removes its object from the cache halfway through serializing it.
    struct RemovingBytes<'a> {
        cache: &'a TieredCache,
        group: GroupId,
        id: ObjectId,
    }

    impl Serializer<Vec<u8>> for RemovingBytes<'_> {
        fn id(&self) -> GroupId {
            self.group
        }

        fn serialize(&self, object: &Vec<u8>, sink: &mut dyn Write) -> io::Result<()> {
            let (head, tail) = object.split_at(object.len() / 2);
            sink.write_all(head)?;
            assert!(self.cache.remove(self.group, self.id).unwrap());
            sink.write_all(tail)
        }

        fn deserialize(&self, source: &mut dyn Read) -> io::Result<Vec<u8>> {
            Bytes(self.group).deserialize(source)
        }
    }

    fn config() -> Config {
        Config {
            block_size: 512,
            memory_buffer_space: 512 * 64,
            segment_size: 512 * 64,
            inode_count: Some(16),
            max_storage_object_size: 64 * 1024,
            max_memory_object_size: Some(8 * 1024),
            storage_slots_per_bucket: 64,
            storage_shards: 2,
            concurrency_level: 2,
            ..Config::default()
        }
    }

    fn object(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    fn cache() -> (TieredCache, Arc<MemoryStorageManager>) {
        crate::init_test_logging();
        let storage = Arc::new(MemoryStorageManager::new());
        (TieredCache::new(config(), storage.clone()).unwrap(), storage)
    }

    fn put(cache: &TieredCache, group: GroupId, id: ObjectId, object: Vec<u8>) -> bool {
        cache.add_to_cache_group(group, id).unwrap();
        cache
            .add(&CacheEntry::new(id, object), &Bytes(group))
            .unwrap()
    }

    fn read(cache: &TieredCache, group: GroupId, id: ObjectId) -> Option<Vec<u8>> {
        cache
            .get(id, &Bytes(group))
            .unwrap()
            .map(|entry| entry.object.as_ref().clone())
    }

    #[test]
    fn add_and_get_from_memory() {
        let (cache, _) = cache();
        assert!(cache.create_cache_group(1).unwrap());
        assert!(!cache.create_cache_group(1).unwrap());

        assert!(put(&cache, 1, 10, object(1, 1000)));
        assert_eq!(read(&cache, 1, 10), Some(object(1, 1000)));
        // already stored
        assert!(
            !cache
                .add(&CacheEntry::new(10, object(2, 10)), &Bytes(1))
                .unwrap()
        );
        assert_eq!(read(&cache, 1, 10), Some(object(1, 1000)));

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 2);
        assert_eq!(stats.storage_hits, 0);
        assert_eq!(cache.evictable_objects(), 1);
    }

    #[test]
    fn add_requires_membership() {
        let (cache, _) = cache();
        let entry = CacheEntry::new(3, object(0, 10));
        // no group
        assert!(!cache.add(&entry, &Bytes(1)).unwrap());
        cache.create_cache_group(1).unwrap();
        // not registered
        assert!(!cache.add(&entry, &Bytes(1)).unwrap());
        assert_eq!(read(&cache, 1, 3), None);

        // registered but never written
        cache.add_to_cache_group(1, 3).unwrap();
        assert_eq!(read(&cache, 1, 3), None);
        assert!(cache.add(&entry, &Bytes(1)).unwrap());
        assert_eq!(read(&cache, 1, 3), Some(object(0, 10)));
    }

    #[test]
    fn memory_pressure_demotes_to_storage() {
        let (cache, storage) = cache();
        cache.create_cache_group(1).unwrap();
        for id in 0..20 {
            assert!(put(&cache, 1, id, object(id as u8, 2048)));
        }
        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert!(storage.stored_bytes() > 0);
        assert!(cache.memory_usage().used_blocks <= 64);

        for id in 0..20 {
            assert_eq!(read(&cache, 1, id), Some(object(id as u8, 2048)));
        }
        assert!(cache.stats().storage_hits > 0);
    }

    #[test]
    fn demote_then_promote_round_trip() {
        let (cache, _) = cache();
        cache.create_cache_group(1).unwrap();
        cache.create_cache_group(2).unwrap();
        let first = object(7, 3000);
        put(&cache, 1, 0, first.clone());
        for id in 0..12 {
            put(&cache, 2, id, object(0, 2048));
        }
        assert!(cache.stats().evictions > 0);

        // make room so that a storage hit can promote
        assert_eq!(cache.remove_cache_group(2).unwrap().len(), 12);
        assert_eq!(read(&cache, 1, 0), Some(first.clone()));
        let stats = cache.stats();
        assert_eq!(stats.storage_hits, 1);
        assert_eq!(stats.promotions, 1);

        assert_eq!(read(&cache, 1, 0), Some(first));
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[test]
    fn large_objects_bypass_memory() {
        let (cache, storage) = cache();
        cache.create_cache_group(1).unwrap();
        let before = cache.memory_usage().used_blocks;

        assert!(put(&cache, 1, 0, object(3, 10 * 1024)));
        assert_eq!(cache.memory_usage().used_blocks, before);
        assert_eq!(cache.stats().direct_to_storage, 1);
        assert!(storage.stored_bytes() >= 10 * 1024);
        assert_eq!(read(&cache, 1, 0), Some(object(3, 10 * 1024)));
        assert_eq!(cache.evictable_objects(), 0);
    }

    #[test]
    fn object_too_large() {
        let (cache, _) = cache();
        cache.create_cache_group(1).unwrap();
        cache.add_to_cache_group(1, 0).unwrap();
        let result = cache.add(&CacheEntry::new(0, object(0, 64 * 1024)), &Bytes(1));
        assert!(matches!(result, Err(CacheError::ObjectTooLarge { .. })));
        // the entry can still be written later
        assert!(put(&cache, 1, 0, object(0, 100)));
    }

    #[test]
    fn teardown_frees_everything() {
        let (cache, storage) = cache();
        cache.create_cache_group(1).unwrap();
        cache.create_cache_group(2).unwrap();
        for id in 0..16 {
            put(&cache, 1 + id % 2, id, object(id as u8, 1500));
        }
        put(&cache, 1, 100, object(1, 12 * 1024));

        assert!(cache.remove(1, 0).unwrap());
        assert!(!cache.remove(1, 0).unwrap());
        assert_eq!(read(&cache, 1, 0), None);

        let removed = cache.remove_cache_group(1).unwrap();
        assert_eq!(removed.len(), 8);
        assert_eq!(removed[0], 2);
        assert_eq!(read(&cache, 1, 2), None);
        assert!(cache.remove_cache_group(1).unwrap().is_empty());
        assert_eq!(cache.remove_cache_group(2).unwrap().len(), 8);

        let usage = cache.memory_usage();
        assert_eq!(usage.used_blocks, 0);
        assert_eq!(usage.used_inodes, 0);
        assert_eq!(storage.stored_bytes(), 0);
        assert_eq!(cache.evictable_objects(), 0);
    }

    #[test]
    fn failed_demotion_keeps_memory_copy() {
        let (cache, storage) = cache();
        cache.create_cache_group(1).unwrap();
        for id in 0..12 {
            put(&cache, 1, id, object(id as u8, 2048));
        }
        assert_eq!(cache.stats().evictions, 0);

        storage.fail_next_writes(usize::MAX);
        cache.add_to_cache_group(1, 12).unwrap();
        let result = cache.add(&CacheEntry::new(12, object(12, 2048)), &Bytes(1));
        assert!(matches!(
            result,
            Err(CacheError::Storage(StorageError::InjectedFailure))
        ));
        assert!(cache.stats().demotion_failures > 0);
        storage.fail_next_writes(0);

        for id in 0..12 {
            assert_eq!(read(&cache, 1, id), Some(object(id as u8, 2048)));
        }
        assert_eq!(cache.stats().memory_hits, 12);
        assert!(put(&cache, 1, 12, object(12, 2048)));
    }

    #[test]
    fn out_of_space_when_nothing_is_evictable() {
        let storage = Arc::new(MemoryStorageManager::new());
        let config = Config {
            memory_buffer_space: 512 * 4,
            segment_size: 512 * 4,
            max_memory_object_size: Some(512 * 4),
            eviction_attempts: 3,
            ..config()
        };
        let cache = TieredCache::new(config, storage).unwrap();
        cache.create_cache_group(1).unwrap();
        cache.add_to_cache_group(1, 0).unwrap();

        // one block holds the directory, the object needs four
        let result = cache.add(&CacheEntry::new(0, object(0, 2000)), &Bytes(1));
        assert!(matches!(result, Err(CacheError::OutOfSpace { attempts: 3 })));
        assert_eq!(cache.memory_usage().used_blocks, 1);
        assert_eq!(cache.memory_usage().used_inodes, 1);
    }

    #[test]
    fn add_racing_remove_leaves_nothing_behind() {
        let (cache, storage) = cache();
        cache.create_cache_group(1).unwrap();

        // memory resident, then straight to storage
        for (id, len) in [(0, 3000), (1, 10 * 1024)] {
            cache.add_to_cache_group(1, id).unwrap();
            let before = cache.memory_usage();
            let serializer = RemovingBytes {
                cache: &cache,
                group: 1,
                id,
            };
            let added = cache
                .add(&CacheEntry::new(id, object(5, len)), &serializer)
                .unwrap();
            assert!(!added);
            assert_eq!(read(&cache, 1, id), None);

            let after = cache.memory_usage();
            assert_eq!(after.used_blocks, before.used_blocks);
            assert_eq!(after.used_inodes, before.used_inodes);
            assert_eq!(storage.stored_bytes(), 0);
            assert_eq!(cache.evictable_objects(), 0);
        }
    }

    #[test]
    fn pinned_objects_bound_eviction() {
        let storage = Arc::new(MemoryStorageManager::new());
        let config = Config {
            memory_buffer_space: 512 * 4,
            segment_size: 512 * 4,
            max_memory_object_size: Some(512 * 4),
            eviction_attempts: 3,
            busy_eviction_attempts: 8,
            ..config()
        };
        let cache = TieredCache::new(config, storage).unwrap();
        cache.create_cache_group(1).unwrap();
        assert!(put(&cache, 1, 0, object(0, 1000)));
        let used = cache.memory_usage().used_blocks;
        assert_eq!(used, 3);

        // a reader holds the only resident object
        let info = cache.member(ObjectKey { group: 1, id: 0 }).unwrap();
        info.state.lock().pinned += 1;
        cache.add_to_cache_group(1, 1).unwrap();
        let result = cache.add(&CacheEntry::new(1, object(1, 1500)), &Bytes(1));
        assert!(matches!(result, Err(CacheError::OutOfSpace { attempts: 8 })));
        assert_eq!(cache.memory_usage().used_blocks, used);
        assert_eq!(cache.stats().evictions, 0);

        cache.unpin(&info).unwrap();
        assert!(
            cache
                .add(&CacheEntry::new(1, object(1, 1500)), &Bytes(1))
                .unwrap()
        );
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(read(&cache, 1, 0), Some(object(0, 1000)));
        assert_eq!(read(&cache, 1, 1), Some(object(1, 1500)));
    }

    #[test]
    fn removed_victim_is_not_requeued() {
        let (cache, _) = cache();
        cache.create_cache_group(1).unwrap();
        let before = cache.memory_usage();
        assert!(put(&cache, 1, 0, object(0, 1000)));

        let key = ObjectKey { group: 1, id: 0 };
        let (victim, busy) = cache.select_victim();
        assert!(!busy);
        let (victim_key, info, inode) = victim.unwrap();
        assert_eq!(victim_key, key);

        // a reader gets in and the object is removed during the copy
        info.state.lock().pinned += 1;
        assert!(cache.remove(1, 0).unwrap());
        assert!(!cache.demote(key, &info, inode).unwrap());
        cache.demotions.fetch_sub(1, Ordering::Release);
        assert_eq!(cache.evictable_objects(), 0);

        // the last reader frees the memory copy
        cache.unpin(&info).unwrap();
        let after = cache.memory_usage();
        assert_eq!(after.used_blocks, before.used_blocks);
        assert_eq!(after.used_inodes, before.used_inodes);
    }

    #[test]
    fn groups_are_created_under_memory_pressure() {
        let (cache, _) = cache();
        cache.create_cache_group(1).unwrap();
        // 61 of 64 blocks, 13 of 16 inodes
        for id in 0..12 {
            assert!(put(&cache, 1, id, object(id as u8, 2048)));
        }
        assert_eq!(cache.stats().evictions, 0);

        for group in 2..8 {
            assert!(cache.create_cache_group(group).unwrap());
            assert!(put(&cache, group, 0, object(group as u8, 100)));
        }
        assert!(cache.stats().evictions > 0);
        for id in 0..12 {
            assert_eq!(read(&cache, 1, id), Some(object(id as u8, 2048)));
        }
    }

    #[test]
    fn stored_objects_too_large_for_memory_are_not_rewritten() {
        let (cache, _) = cache();
        cache.create_cache_group(1).unwrap();
        assert!(put(&cache, 1, 0, object(3, 10 * 1024)));
        // touched, and nothing colder is resident
        assert_eq!(read(&cache, 1, 0), Some(object(3, 10 * 1024)));

        let again = CacheEntry::new(0, object(3, 10 * 1024));
        assert!(!cache.add(&again, &Bytes(1)).unwrap());
        let stats = cache.stats();
        assert_eq!(stats.direct_to_storage, 1);
        assert_eq!(stats.promotions, 0);
    }

    #[test]
    fn concurrent_groups() {
        let storage = Arc::new(MemoryStorageManager::new());
        let cache = Arc::new(TieredCache::new(config(), storage).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|group| {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache.create_cache_group(group).unwrap();
                    for id in 0..30 {
                        let len = 200 + (id as usize * 97) % 3000;
                        assert!(put(&cache, group, id, object(group as u8 ^ id as u8, len)));
                    }
                    for id in (0..30).rev() {
                        let len = 200 + (id as usize * 97) % 3000;
                        assert_eq!(
                            read(&cache, group, id),
                            Some(object(group as u8 ^ id as u8, len))
                        );
                    }
                    assert_eq!(cache.remove_cache_group(group).unwrap().len(), 30);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.memory_usage().used_blocks, 0);
        assert_eq!(cache.memory_usage().used_inodes, 0);
    }
}
