const WORD_BITS: usize = u64::BITS as usize;

/// Bits summarized by one entry of the coarse occupancy index.
pub const GROUP_BITS: usize = 512;
const WORDS_PER_GROUP: usize = GROUP_BITS / WORD_BITS;

/// One independently locked shard of a [`super::ConcurrentBitSet`].
///
/// Next to the bitmap the segment keeps a popcount per group of
/// [`GROUP_BITS`] bits, so that scans for a clear (or set) bit skip whole
/// groups that are full (or empty).
///
/// ```text
/// group_counts:  [ 512 ][ 512 ][ 37 ][  0 ] ...
///                   |      |      |     |
/// words:         [8 x u64][8 x u64][8 x u64][8 x u64] ...
///                 skipped  skipped  scanned  skipped when looking for set bits
/// ```
pub(super) struct BitSegment {
    words: Box<[u64]>,
    group_counts: Box<[u16]>,
    bits_set: usize,
    len: usize,
    // next likely clear bit
    next_free: usize,
}

impl BitSegment {
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(WORD_BITS);
        let groups = len.div_ceil(GROUP_BITS);
        Self {
            words: vec![0; words].into_boxed_slice(),
            group_counts: vec![0; groups].into_boxed_slice(),
            bits_set: 0,
            len,
            next_free: 0,
        }
    }

    #[inline]
    pub fn bits_set(&self) -> usize {
        self.bits_set
    }

    #[inline]
    fn group_len(&self, group: usize) -> usize {
        GROUP_BITS.min(self.len - group * GROUP_BITS)
    }

    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.words[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    /// Sets the bit, returning whether it was previously clear.
    pub fn set(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let word = &mut self.words[idx / WORD_BITS];
        let mask = 1 << (idx % WORD_BITS);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.group_counts[idx / GROUP_BITS] += 1;
        self.bits_set += 1;
        true
    }

    /// Clears the bit, returning whether it was previously set.
    pub fn clear(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let word = &mut self.words[idx / WORD_BITS];
        let mask = 1 << (idx % WORD_BITS);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.group_counts[idx / GROUP_BITS] -= 1;
        self.bits_set -= 1;
        self.next_free = self.next_free.min(idx);
        true
    }

    /// Sets the first clear bit at or after the free cursor, wrapping
    /// around once.
    pub fn allocate(&mut self) -> Option<usize> {
        if self.bits_set == self.len {
            return None;
        }

        let idx = self
            .next_clear(self.next_free)
            .or_else(|| self.next_clear(0))?;
        self.set(idx);
        self.next_free = idx + 1;
        Some(idx)
    }

    pub fn next_clear(&self, from: usize) -> Option<usize> {
        self.scan(from, |word| !word, |count, len| count == len)
    }

    pub fn next_set(&self, from: usize) -> Option<usize> {
        self.scan(from, |word| word, |count, _| count == 0)
    }

    fn scan(
        &self,
        from: usize,
        candidates: impl Fn(u64) -> u64,
        skip_group: impl Fn(usize, usize) -> bool,
    ) -> Option<usize> {
        let mut pos = from;
        let mut group = from / GROUP_BITS;

        while pos < self.len {
            if skip_group(self.group_counts[group] as usize, self.group_len(group)) {
                group += 1;
                pos = group * GROUP_BITS;
                continue;
            }

            let end = ((group + 1) * WORDS_PER_GROUP).min(self.words.len());
            let mut mask = !0u64 << (pos % WORD_BITS);
            for w in pos / WORD_BITS..end {
                let bits = candidates(self.words[w]) & mask;
                if bits != 0 {
                    let idx = w * WORD_BITS + bits.trailing_zeros() as usize;
                    // bits past the end of the last word never count
                    return (idx < self.len).then_some(idx);
                }
                mask = !0;
            }

            group += 1;
            pos = group * GROUP_BITS;
        }

        None
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        let popcount: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        let groups: usize = self.group_counts.iter().map(|&c| c as usize).sum();
        assert_eq!(popcount, self.bits_set);
        assert_eq!(groups, self.bits_set);
    }
}
