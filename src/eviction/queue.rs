use crate::config::LrfuConfig;
use crate::eviction::{EvictionKey, LrfuPolicy};

use std::cmp::Ordering;

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

/// `f64` with a total order, so that it can be part of a map key.
#[derive(Debug, Clone, Copy)]
struct OrderValue(f64);

impl PartialEq for OrderValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderValue {}

impl PartialOrd for OrderValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// LRFU ordered queue of evictable entries.
///
/// Up to `max_ordered_entries` entries are kept sorted by their
/// [`EvictionKey::order`], ties broken by key. Past that, entries go to an
/// overflow sorted by last access (plain LRU) that is drained back into the
/// ordered part as it shrinks. Ordered entries are evicted before the
/// overflow.
///
/// Both parts are concurrent skip lists, so accesses to different entries
/// do not contend. An entry is located by the [`EvictionKey`] it was queued
/// with; callers serialize the updates of a single entry (the entry's own
/// lock) and pass its current key. Only moving entries out of the overflow
/// takes a lock, which accesses of unqueued entries wait for.
pub struct EvictionQueue<K> {
    policy: LrfuPolicy,
    ordered: SkipMap<(OrderValue, K), ()>,
    overflow: SkipMap<(u64, K), OrderValue>,
    refill: Mutex<()>,
    max_ordered: usize,
}

impl<K: Ord + Clone + Send + 'static> EvictionQueue<K> {
    pub fn new(config: LrfuConfig) -> Self {
        let max_ordered = config.max_ordered_entries.max(1);
        Self {
            policy: LrfuPolicy::new(config),
            ordered: SkipMap::new(),
            overflow: SkipMap::new(),
            refill: Mutex::new(()),
            max_ordered,
        }
    }

    pub fn policy(&self) -> &LrfuPolicy {
        &self.policy
    }

    fn push(&self, key: K, eviction_key: &EvictionKey) {
        let order = OrderValue(eviction_key.order);
        if self.ordered.len() < self.max_ordered {
            self.ordered.insert((order, key), ());
        } else {
            self.overflow.insert((eviction_key.last_access, key), order);
        }
    }

    fn unlink_once(&self, key: &K, eviction_key: &EvictionKey) -> bool {
        let ordered = (OrderValue(eviction_key.order), key.clone());
        if self.ordered.remove(&ordered).is_some() {
            return true;
        }
        let overflow = (eviction_key.last_access, key.clone());
        self.overflow.remove(&overflow).is_some()
    }

    /// Unlinks `key` queued under `eviction_key`, waiting out a concurrent
    /// move from the overflow.
    fn unlink(&self, key: &K, eviction_key: &EvictionKey) -> bool {
        if eviction_key.is_untouched() {
            return false;
        }
        if self.unlink_once(key, eviction_key) {
            return true;
        }
        let _moving = self.refill.lock();
        self.unlink_once(key, eviction_key)
    }

    fn refill(&self) {
        if self.overflow.is_empty() || self.ordered.len() >= self.max_ordered {
            return;
        }
        let Some(_moving) = self.refill.try_lock() else {
            return;
        };
        while self.ordered.len() < self.max_ordered {
            let Some(entry) = self.overflow.pop_front() else {
                break;
            };
            let (_, key) = entry.key();
            self.ordered.insert((*entry.value(), key.clone()), ());
        }
    }

    /// Makes `key` evictable. Untouched keys are not queued.
    pub fn add(&self, key: K, eviction_key: &EvictionKey) -> bool {
        if eviction_key.is_untouched() {
            return false;
        }
        self.unlink(&key, eviction_key);
        self.push(key, eviction_key);
        true
    }

    /// Records an access and repositions `key` if it is queued.
    ///
    /// Returns whether `key` was queued.
    pub fn touch(&self, key: &K, eviction_key: &mut EvictionKey) -> bool {
        let previous = *eviction_key;
        *eviction_key = self.policy.next_key(&previous);
        if !self.unlink(key, &previous) {
            return false;
        }
        // an overflow entry moves to the most recent end
        self.push(key.clone(), eviction_key);
        true
    }

    /// Unqueues `key`, last queued or touched with `eviction_key`.
    pub fn remove(&self, key: &K, eviction_key: &EvictionKey) -> bool {
        let removed = self.unlink(key, eviction_key);
        self.refill();
        removed
    }

    /// Removes and returns the least valuable entry.
    pub fn poll_first(&self) -> Option<K> {
        let key = match self.ordered.pop_front() {
            Some(entry) => Some(entry.key().1.clone()),
            None => self.overflow.pop_front().map(|entry| entry.key().1.clone()),
        };
        self.refill();
        key
    }

    /// The least valuable entry and its order value.
    pub fn peek_first(&self) -> Option<(K, f64)> {
        match self.ordered.front() {
            Some(entry) => {
                let (order, key) = entry.key();
                Some((key.clone(), order.0))
            }
            None => self.overflow.front().map(|entry| {
                let (_, key) = entry.key();
                (key.clone(), entry.value().0)
            }),
        }
    }

    pub fn contains(&self, key: &K, eviction_key: &EvictionKey) -> bool {
        if eviction_key.is_untouched() {
            return false;
        }
        self.ordered
            .contains_key(&(OrderValue(eviction_key.order), key.clone()))
            || self
                .overflow
                .contains_key(&(eviction_key.last_access, key.clone()))
    }

    pub fn len(&self) -> usize {
        self.ordered.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn ordered_len(&self) -> usize {
        self.ordered.len()
    }
}
