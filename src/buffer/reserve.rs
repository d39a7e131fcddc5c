use crate::config::BufferConfig;

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// How [`ReservePool::reserve`] behaves when the quota is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferReserveMode {
    /// Wait, with backoff, for releases. Once the wait budget is spent the
    /// reservation is forced.
    Wait,
    /// Grant everything immediately, overdrawing the quota if needed.
    Force,
    /// Grant what is available without waiting.
    NoWait,
}

/// Process wide memory quota, in KB.
pub struct ReservePool {
    max_kb: i64,
    reserved: Mutex<i64>,
    released: Condvar,
    wait_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ReservePool {
    pub fn new(max_kb: i64, config: &BufferConfig) -> Self {
        Self {
            max_kb,
            reserved: Mutex::new(0),
            released: Condvar::new(),
            wait_attempts: config.wait_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    pub fn max_kb(&self) -> i64 {
        self.max_kb
    }

    pub fn reserved_kb(&self) -> i64 {
        *self.reserved.lock()
    }

    /// Unreserved quota; negative once forced reservations overdraw it.
    pub fn available_kb(&self) -> i64 {
        self.max_kb - *self.reserved.lock()
    }

    /// Reserves up to `kb`, returning the amount granted.
    ///
    /// `Wait` requests above the quota are clamped to it.
    pub fn reserve(&self, kb: i64, mode: BufferReserveMode) -> i64 {
        if kb <= 0 {
            return 0;
        }
        let mut reserved = self.reserved.lock();
        match mode {
            BufferReserveMode::Force => {
                *reserved += kb;
                kb
            }
            BufferReserveMode::NoWait => {
                let granted = kb.min(self.max_kb - *reserved).max(0);
                *reserved += granted;
                granted
            }
            BufferReserveMode::Wait => {
                let kb = kb.min(self.max_kb);
                let mut backoff = self.initial_backoff;
                for _ in 0..self.wait_attempts {
                    if self.max_kb - *reserved >= kb {
                        *reserved += kb;
                        return kb;
                    }
                    self.released.wait_for(&mut reserved, backoff);
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                if self.max_kb - *reserved < kb {
                    warn!(
                        kb,
                        reserved = *reserved,
                        max_kb = self.max_kb,
                        "forcing reservation after waiting"
                    );
                }
                *reserved += kb;
                kb
            }
        }
    }

    pub fn release(&self, kb: i64) {
        if kb <= 0 {
            return;
        }
        let mut reserved = self.reserved.lock();
        *reserved = (*reserved - kb).max(0);
        self.released.notify_all();
    }
}
