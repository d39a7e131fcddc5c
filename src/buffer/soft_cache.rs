use std::cmp::Reverse;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use priority_queue::PriorityQueue;

struct Entries<K: Hash + Eq, V: ?Sized> {
    // oldest access pops first
    strong: PriorityQueue<K, Reverse<u64>>,
    values: HashMap<K, Arc<V>>,
    // objects still alive elsewhere in the process
    weak: HashMap<K, Weak<V>>,
    tick: u64,
}

/// Side cache of objects that left the resident set.
///
/// A bounded LRU holds strong references; with `weak` enabled, objects
/// dropped from it (or inserted weakly) stay reachable for as long as
/// someone else keeps them alive. Nothing here is needed for correctness.
pub struct SoftCache<K: Hash + Eq, V: ?Sized> {
    entries: Mutex<Entries<K, V>>,
    capacity: usize,
    weak: bool,
}

impl<K: Hash + Eq + Clone, V: ?Sized> SoftCache<K, V> {
    pub fn new(capacity: usize, weak: bool) -> Self {
        Self {
            entries: Mutex::new(Entries {
                strong: PriorityQueue::new(),
                values: HashMap::new(),
                weak: HashMap::new(),
                tick: 0,
            }),
            capacity,
            weak,
        }
    }

    /// Keeps `value` alive until it is the least recently used of more
    /// than `capacity` entries.
    pub fn insert_strong(&self, key: K, value: Arc<V>) {
        if self.capacity == 0 {
            self.insert_weak(key, &value);
            return;
        }
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;
        entries.weak.remove(&key);
        entries.strong.push(key.clone(), Reverse(tick));
        entries.values.insert(key, value);

        while entries.strong.len() > self.capacity {
            let Some((oldest, _)) = entries.strong.pop() else {
                break;
            };
            if let Some(value) = entries.values.remove(&oldest)
                && self.weak
            {
                entries.weak.insert(oldest, Arc::downgrade(&value));
            }
        }
        self.prune(&mut entries);
    }

    /// Remembers `value` only while it is alive elsewhere.
    pub fn insert_weak(&self, key: K, value: &Arc<V>) {
        if !self.weak {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.values.contains_key(&key) {
            return;
        }
        entries.weak.insert(key, Arc::downgrade(value));
        self.prune(&mut entries);
    }

    fn prune(&self, entries: &mut Entries<K, V>) {
        if entries.weak.len() > 2 * self.capacity.max(16) {
            entries.weak.retain(|_, value| value.strong_count() > 0);
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.values.get(key).cloned() {
            entries.tick += 1;
            let tick = entries.tick;
            entries.strong.change_priority(key, Reverse(tick));
            return Some(value);
        }

        let value = entries.weak.get(key)?.upgrade();
        if value.is_none() {
            entries.weak.remove(key);
        }
        value
    }

    pub fn remove(&self, key: &K) {
        let mut entries = self.entries.lock();
        entries.strong.remove(key);
        entries.values.remove(key);
        entries.weak.remove(key);
    }

    /// Drops every entry whose key fails `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        let mut entries = self.entries.lock();
        entries.values.retain(|key, _| keep(key));
        entries.weak.retain(|key, _| keep(key));
        let Entries { strong, values, .. } = &mut *entries;
        strong.retain(|key, _| values.contains_key(key));
    }

    /// Entries held strongly.
    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
