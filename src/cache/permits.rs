use parking_lot::{Condvar, Mutex, RwLock};

/// Bounds the number of threads writing objects into the memory tier.
///
/// Sized so that all permit holders together cannot need more than the
/// whole memory tier, which keeps them from waiting on each other's
/// evictions.
pub struct WritePermits {
    available: Mutex<usize>,
    released: Condvar,
    total: usize,
}

/// Returned to its [`WritePermits`] on drop.
pub struct WritePermit<'a> {
    permits: &'a WritePermits,
}

impl WritePermits {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            available: Mutex::new(total),
            released: Condvar::new(),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    pub fn acquire(&self) -> WritePermit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        WritePermit { permits: self }
    }

    pub fn try_acquire(&self) -> Option<WritePermit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(WritePermit { permits: self })
    }
}

impl Drop for WritePermit<'_> {
    fn drop(&mut self) {
        *self.permits.available.lock() += 1;
        self.permits.released.notify_one();
    }
}

/// Lock between block allocation and emergency victim selection.
///
/// Allocations share the lock; selecting a victim takes it exclusively,
/// so that no allocation observes a half selected victim. The relocation
/// I/O runs after the lock is released.
#[derive(Default)]
pub struct AllocationLock {
    lock: RwLock<()>,
}

impl AllocationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs an allocation.
    pub fn allocate<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.read();
        f()
    }

    /// Runs a victim selection, excluding all allocations.
    pub fn select_victim<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.write();
        f()
    }
}
