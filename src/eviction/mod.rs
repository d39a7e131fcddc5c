mod queue;

pub use queue::EvictionQueue;

use crate::config::LrfuConfig;

use std::sync::atomic::{AtomicU64, Ordering};

/// Ordering state of one cached entry.
///
/// Lower `order` values are evicted first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionKey {
    pub last_access: u64,
    pub order: f64,
}

impl EvictionKey {
    /// Key of an entry without a recorded access. Such entries never take
    /// part in eviction until their first [`LrfuPolicy::next_key`].
    pub const UNTOUCHED: Self = Self {
        last_access: 0,
        order: -1.0,
    };

    pub fn is_untouched(&self) -> bool {
        self.order < 0.0
    }
}

impl Default for EvictionKey {
    fn default() -> Self {
        Self::UNTOUCHED
    }
}

/// Logical clock and LRFU weighting.
///
/// Each access advances the clock by one tick and combines the decayed
/// previous value with a recency term:
///
/// ```text
/// value = prev * decay^max(dt, min_interval) + now^lambda    dt <= max_interval
/// value = now^lambda                                          dt >  max_interval
/// ```
///
/// where `decay = 0.5^(1 / half_life)`.
pub struct LrfuPolicy {
    clock: AtomicU64,
    config: LrfuConfig,
    decay: f64,
}

impl LrfuPolicy {
    pub fn new(config: LrfuConfig) -> Self {
        let decay = 0.5f64.powf(1.0 / config.half_life as f64);
        Self {
            clock: AtomicU64::new(0),
            config,
            decay,
        }
    }

    pub fn config(&self) -> &LrfuConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Key after an access at the next tick.
    pub fn next_key(&self, prev: &EvictionKey) -> EvictionKey {
        self.key_at(prev, self.tick())
    }

    fn key_at(&self, prev: &EvictionKey, now: u64) -> EvictionKey {
        let recency = (now as f64).powf(self.config.lambda);
        let order = if prev.is_untouched() {
            recency
        } else {
            let delta = now.saturating_sub(prev.last_access);
            if delta > self.config.max_interval {
                recency
            } else {
                let delta = delta.max(self.config.min_interval);
                prev.order * self.decay.powf(delta as f64) + recency
            }
        };

        EvictionKey {
            last_access: now,
            order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LrfuPolicy {
        LrfuPolicy::new(LrfuConfig::with_half_life(1 << 12))
    }

    #[test]
    fn first_access_is_recency_only() {
        let policy = policy();
        let key = policy.key_at(&EvictionKey::UNTOUCHED, 100);
        assert_eq!(key.last_access, 100);
        assert!((key.order - 10.0).abs() < 1e-9);
        assert!(!key.is_untouched());
    }

    #[test]
    fn frequency_accumulates() {
        let policy = policy();
        let once = policy.key_at(&EvictionKey::UNTOUCHED, 1000);
        let twice = policy.key_at(&once, 1001);
        let fresh = policy.key_at(&EvictionKey::UNTOUCHED, 1001);
        assert!(twice.order > fresh.order);
    }

    #[test]
    fn bursts_are_clamped() {
        let policy = policy();
        let min = policy.config().min_interval as f64;
        let mut key = policy.key_at(&EvictionKey::UNTOUCHED, 1000);
        for _ in 0..10_000 {
            key = policy.key_at(&key, 1000);
        }
        // a geometric series with ratio decay^min_interval
        let bound = (1000f64).sqrt() / (1.0 - policy.decay.powf(min));
        assert!(key.order <= bound + 1e-6);
    }

    #[test]
    fn long_idle_forgets_frequency() {
        let policy = policy();
        let mut key = policy.key_at(&EvictionKey::UNTOUCHED, 10);
        for now in 11..100 {
            key = policy.key_at(&key, now);
        }
        let late = 100 + policy.config().max_interval + 1;
        let after_idle = policy.key_at(&key, late);
        assert_eq!(after_idle.order, (late as f64).powf(0.5));
    }

    #[test]
    fn clock_advances() {
        let policy = policy();
        let a = policy.next_key(&EvictionKey::UNTOUCHED);
        let b = policy.next_key(&EvictionKey::UNTOUCHED);
        assert!(b.last_access > a.last_access);
        assert!(b.order > a.order);
        assert_eq!(policy.now(), 2);
    }
}
