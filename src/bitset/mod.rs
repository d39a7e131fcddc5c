mod segment;

use segment::BitSegment;
pub use segment::GROUP_BITS;

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

const MIN_SEGMENT_BITS: usize = 1 << 12;

/// A concurrent free/used bitmap over a fixed address space.
///
/// The space is split into segments, each behind its own lock. Allocation
/// starts at a round-robin segment so that concurrent allocators spread
/// over different locks; freeing only touches the segment owning the bit.
///
/// ```text
///   next_segment ──► 0 1 2 3 0 1 ...
///
///   +-----------+-----------+-----------+-----------+
///   | segment 0 | segment 1 | segment 2 | segment 3 |   each a Mutex<BitSegment>
///   +-----------+-----------+-----------+-----------+
///   index = segment << segment_shift | bit
/// ```
pub struct ConcurrentBitSet {
    segments: Box<[Mutex<BitSegment>]>,
    segment_shift: u32,
    len: usize,
    bits_set: AtomicUsize,
    next_segment: AtomicUsize,
}

impl ConcurrentBitSet {
    /// Creates a bitset of `len` clear bits, segmented for about
    /// `concurrency_level` concurrent allocators.
    pub fn new(len: usize, concurrency_level: usize) -> Self {
        assert!(len > 0, "bitset must not be empty");

        let target_segments = (concurrency_level.max(1) * 4).next_power_of_two();
        let segment_bits = len
            .div_ceil(target_segments)
            .next_power_of_two()
            .max(MIN_SEGMENT_BITS);
        let segment_count = len.div_ceil(segment_bits);

        let segments = (0..segment_count)
            .map(|i| {
                let bits = segment_bits.min(len - i * segment_bits);
                Mutex::new(BitSegment::new(bits))
            })
            .collect();

        Self {
            segments,
            segment_shift: segment_bits.trailing_zeros(),
            len,
            bits_set: AtomicUsize::new(0),
            next_segment: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn locate(&self, idx: usize) -> (usize, usize) {
        assert!(idx < self.len, "bit {idx} out of range 0..{}", self.len);
        (idx >> self.segment_shift, idx & ((1 << self.segment_shift) - 1))
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of bits currently set.
    pub fn bits_set(&self) -> usize {
        self.bits_set.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.len - self.bits_set()
    }

    /// Sets a clear bit and returns its index, or `None` when every bit
    /// is set.
    pub fn allocate(&self) -> Option<usize> {
        let segment_count = self.segments.len();
        let start = self.next_segment.fetch_add(1, Ordering::Relaxed) % segment_count;

        for i in 0..segment_count {
            let segment_idx = (start + i) % segment_count;
            let mut segment = self.segments[segment_idx].lock();
            if let Some(bit) = segment.allocate() {
                self.bits_set.fetch_add(1, Ordering::AcqRel);
                return Some((segment_idx << self.segment_shift) | bit);
            }
        }

        None
    }

    /// Clears a set bit.
    ///
    /// # Panics
    ///
    /// Panics if the bit is not set: a double free means block ownership
    /// is already corrupted.
    pub fn free(&self, idx: usize) {
        let (segment_idx, bit) = self.locate(idx);
        let cleared = self.segments[segment_idx].lock().clear(bit);
        assert!(cleared, "freeing bit {idx} which is not set");
        self.bits_set.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sets a specific bit, returning whether it was previously clear.
    pub fn set(&self, idx: usize) -> bool {
        let (segment_idx, bit) = self.locate(idx);
        let set = self.segments[segment_idx].lock().set(bit);
        if set {
            self.bits_set.fetch_add(1, Ordering::AcqRel);
        }
        set
    }

    pub fn get(&self, idx: usize) -> bool {
        let (segment_idx, bit) = self.locate(idx);
        self.segments[segment_idx].lock().get(bit)
    }

    /// First clear bit at or after `from`.
    pub fn next_clear_bit(&self, from: usize) -> Option<usize> {
        self.next_bit(from, BitSegment::next_clear)
    }

    /// First set bit at or after `from`.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        self.next_bit(from, BitSegment::next_set)
    }

    fn next_bit(
        &self,
        from: usize,
        search: impl Fn(&BitSegment, usize) -> Option<usize>,
    ) -> Option<usize> {
        if from >= self.len {
            return None;
        }

        let (first, mut bit) = self.locate(from);
        for segment_idx in first..self.segments.len() {
            let segment = self.segments[segment_idx].lock();
            if let Some(found) = search(&segment, bit) {
                return Some((segment_idx << self.segment_shift) | found);
            }
            bit = 0;
        }

        None
    }

    /// Checks that the segment counters, the coarse index and the bitmap
    /// agree with the global count.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut total = 0;
        for segment in self.segments.iter() {
            let segment = segment.lock();
            segment.check_invariants();
            total += segment.bits_set();
        }
        assert_eq!(total, self.bits_set());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    #[test]
    fn allocate_until_exhausted() {
        let bitset = ConcurrentBitSet::new(10_000, 4);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let idx = bitset.allocate().unwrap();
            assert!(idx < 10_000);
            assert!(seen.insert(idx), "bit {idx} allocated twice");
        }
        assert_eq!(bitset.allocate(), None);
        assert_eq!(bitset.bits_set(), 10_000);
        assert_eq!(bitset.free_count(), 0);
        bitset.check_invariants();
    }

    #[test]
    fn free_then_reallocate() {
        let bitset = ConcurrentBitSet::new(64, 1);
        let bits: Vec<_> = (0..64).map(|_| bitset.allocate().unwrap()).collect();
        bitset.free(bits[17]);
        assert!(!bitset.get(bits[17]));
        assert_eq!(bitset.allocate(), Some(bits[17]));
        assert!(bitset.get(bits[17]));
    }

    #[test]
    #[should_panic]
    fn double_free() {
        let bitset = ConcurrentBitSet::new(128, 1);
        let idx = bitset.allocate().unwrap();
        bitset.free(idx);
        bitset.free(idx);
    }

    #[test]
    fn segments_follow_concurrency() {
        let bitset = ConcurrentBitSet::new(1 << 20, 8);
        assert_eq!(bitset.segment_count(), 32);

        // small spaces are not split below the minimum segment size
        let bitset = ConcurrentBitSet::new(5000, 8);
        assert_eq!(bitset.segment_count(), 2);
    }

    #[test]
    fn next_bit_queries() {
        let bitset = ConcurrentBitSet::new(3 * MIN_SEGMENT_BITS, 16);
        assert_eq!(bitset.next_set_bit(0), None);
        assert!(bitset.set(MIN_SEGMENT_BITS * 2 + 5));
        assert!(!bitset.set(MIN_SEGMENT_BITS * 2 + 5));
        assert_eq!(bitset.next_set_bit(0), Some(MIN_SEGMENT_BITS * 2 + 5));
        assert_eq!(bitset.next_clear_bit(MIN_SEGMENT_BITS * 2 + 5), Some(MIN_SEGMENT_BITS * 2 + 6));
        assert_eq!(bitset.next_set_bit(MIN_SEGMENT_BITS * 2 + 6), None);
        assert_eq!(bitset.next_clear_bit(3 * MIN_SEGMENT_BITS), None);
    }

    #[test]
    fn concurrent_allocate_free() {
        const NUM_THREADS: usize = 8;
        const ROUNDS: usize = 2000;
        let bitset = Arc::new(ConcurrentBitSet::new(4096, NUM_THREADS));
        let mut handles = Vec::new();

        for _ in 0..NUM_THREADS {
            let bitset = bitset.clone();
            let handle = std::thread::spawn(move || {
                let mut owned = Vec::new();
                for round in 0..ROUNDS {
                    if round % 3 == 2 {
                        if let Some(idx) = owned.pop() {
                            bitset.free(idx);
                        }
                    } else if let Some(idx) = bitset.allocate() {
                        owned.push(idx);
                    }
                }
                owned
            });
            handles.push(handle);
        }

        let mut all = HashSet::new();
        for handle in handles {
            for idx in handle.join().unwrap() {
                assert!(all.insert(idx), "bit {idx} owned by two threads");
            }
        }
        assert_eq!(all.len(), bitset.bits_set());
        bitset.check_invariants();
    }

    proptest! {
        #[test]
        fn allocate_free_sequences(ops in proptest::collection::vec(any::<(bool, usize)>(), 1..400)) {
            let bitset = ConcurrentBitSet::new(300, 2);
            let mut owned: Vec<usize> = Vec::new();
            for (allocate, pick) in ops {
                if allocate || owned.is_empty() {
                    match bitset.allocate() {
                        Some(idx) => {
                            prop_assert!(!owned.contains(&idx));
                            owned.push(idx);
                        }
                        None => prop_assert_eq!(owned.len(), 300),
                    }
                } else {
                    let idx = owned.swap_remove(pick % owned.len());
                    bitset.free(idx);
                }
                prop_assert_eq!(bitset.bits_set(), owned.len());
                bitset.check_invariants();
            }
        }
    }
}
