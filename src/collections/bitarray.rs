//! Packed Bit Array
//!
//! A fixed-capacity set of bits packed into 64-bit words, used by the
//! fixed-size heap bins to track block occupancy.
//!
//! # Design
//! - Capacity is `WORDS * 64` bits, chosen at compile time
//! - The logical length is fixed at construction and never changes
//! - Bits at or beyond the logical length are always zero
//! - The set-bit count is cached and recomputed lazily
//!
//! # Popcount caching
//! `popcount()` takes `&mut self`: it recomputes the count if any mutation
//! happened since the last call and caches the result. `cached_popcount()`
//! takes `&self` and returns the last cached value without recomputing, so it
//! can be stale. Use `count_ones()` for an exact count through `&self`.
//!
//! This container is *not* thread-safe; callers serialise access.

use core::fmt;
use core::ops::Index;

/// Number of bits in one storage word.
pub const WORD_BITS: usize = u64::BITS as usize;

/// Number of storage words needed to hold `bits` bits.
#[inline]
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// Mask of the bits of word `word` that lie below `len`.
const fn word_mask(len: usize, word: usize) -> u64 {
    let start = word * WORD_BITS;
    if len >= start + WORD_BITS {
        u64::MAX
    } else if len <= start {
        0
    } else {
        (1u64 << (len - start)) - 1
    }
}

/// A fixed-capacity packed bit array.
#[derive(Clone)]
pub struct Bitarray<const WORDS: usize> {
    /// Packed storage, bit `i` lives in `words[i / 64]` at position `i % 64`.
    words: [u64; WORDS],
    /// Logical number of bits.
    len: usize,
    /// Set by every mutation, cleared by `popcount()`.
    dirty: bool,
    /// Set-bit count as of the last `popcount()` call.
    last_popcount: usize,
}

impl<const WORDS: usize> Bitarray<WORDS> {
    /// Maximum number of bits this bit array type can hold.
    pub const CAPACITY: usize = WORDS * WORD_BITS;

    /// Create a bit array of `len` bits, all clear.
    ///
    /// # Panics
    /// Panics if `len` exceeds [`Self::CAPACITY`].
    #[inline]
    pub const fn new(len: usize) -> Self {
        Self::filled(len, false)
    }

    /// Create a bit array of `len` bits, all set to `value`.
    ///
    /// # Panics
    /// Panics if `len` exceeds [`Self::CAPACITY`].
    pub const fn filled(len: usize, value: bool) -> Self {
        assert!(len <= Self::CAPACITY, "bitarray length exceeds capacity");

        let mut words = [0u64; WORDS];
        if value {
            let mut word = 0;
            while word < WORDS {
                words[word] = word_mask(len, word);
                word += 1;
            }
        }

        Self {
            words,
            len,
            dirty: true,
            last_popcount: 0,
        }
    }

    /// Get the number of bits in the bit array.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check whether the bit array holds no bits at all.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, u64) {
        assert!(
            index < self.len,
            "bit index {} out of range for bitarray of length {}",
            index,
            self.len
        );
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    /// Get the bit at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        self.words[word] & mask != 0
    }

    /// Set the bit at `index`.
    #[inline]
    pub fn set(&mut self, index: usize) {
        self.assign(index, true);
    }

    /// Clear the bit at `index`.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.assign(index, false);
    }

    /// Write `value` to the bit at `index`.
    #[inline]
    pub fn assign(&mut self, index: usize, value: bool) {
        let (word, mask) = self.locate(index);
        self.dirty = true;
        // Branch-free conditional set/clear.
        self.words[word] = (self.words[word] & !mask) | ((value as u64).wrapping_neg() & mask);
    }

    /// Flip the bit at `index`.
    #[inline]
    pub fn toggle(&mut self, index: usize) {
        let (word, mask) = self.locate(index);
        self.dirty = true;
        self.words[word] ^= mask;
    }

    /// Set `count` bits starting at `start`.
    ///
    /// # Panics
    /// Panics if the range extends past the end of the bit array.
    pub fn set_range(&mut self, start: usize, count: usize) {
        self.fill_range(start, count, true);
    }

    /// Clear `count` bits starting at `start`.
    ///
    /// # Panics
    /// Panics if the range extends past the end of the bit array.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        self.fill_range(start, count, false);
    }

    fn fill_range(&mut self, start: usize, count: usize, value: bool) {
        if count == 0 {
            return;
        }

        let end = start.checked_add(count).unwrap_or(usize::MAX);
        assert!(
            end <= self.len,
            "bit range {}..{} out of range for bitarray of length {}",
            start,
            end,
            self.len
        );

        self.dirty = true;
        let mut i = start;

        // Partial leading word, bit by bit.
        while i < end && i % WORD_BITS != 0 {
            self.write_bit(i, value);
            i += 1;
        }

        // Whole words.
        let fill = if value { u64::MAX } else { 0 };
        while end - i >= WORD_BITS {
            self.words[i / WORD_BITS] = fill;
            i += WORD_BITS;
        }

        // Partial trailing word, bit by bit.
        while i < end {
            self.write_bit(i, value);
            i += 1;
        }
    }

    #[inline]
    fn write_bit(&mut self, index: usize, value: bool) {
        let mask = 1u64 << (index % WORD_BITS);
        if value {
            self.words[index / WORD_BITS] |= mask;
        } else {
            self.words[index / WORD_BITS] &= !mask;
        }
    }

    /// Find the first set bit.
    #[inline]
    pub fn find(&self) -> Option<usize> {
        self.find_value_from(0, true)
    }

    /// Find the first bit equal to `value`.
    #[inline]
    pub fn find_value(&self, value: bool) -> Option<usize> {
        self.find_value_from(0, value)
    }

    /// Find the first set bit at or after `start`.
    #[inline]
    pub fn find_from(&self, start: usize) -> Option<usize> {
        self.find_value_from(start, true)
    }

    /// Find the first bit equal to `value` at or after `start`.
    ///
    /// Returns `None` when the scan reaches the end without a match.
    pub fn find_value_from(&self, start: usize, value: bool) -> Option<usize> {
        let mut i = start;
        while i < self.len {
            let word_index = i / WORD_BITS;
            let word = if value {
                self.words[word_index]
            } else {
                !self.words[word_index]
            };

            let candidates = word & (u64::MAX << (i % WORD_BITS));
            if candidates != 0 {
                let pos = word_index * WORD_BITS + candidates.trailing_zeros() as usize;
                // Clear searches see the zero padding above `len` as matches.
                return (pos < self.len).then_some(pos);
            }

            i = (word_index + 1) * WORD_BITS;
        }

        None
    }

    /// Get the number of set bits, recomputing it if the array changed since
    /// the last call.
    pub fn popcount(&mut self) -> usize {
        if self.dirty {
            self.last_popcount = self.count_ones();
            self.dirty = false;
        }

        self.last_popcount
    }

    /// Get the set-bit count cached by the last [`popcount`](Self::popcount)
    /// call. May be stale if the array was mutated since.
    #[inline]
    pub fn cached_popcount(&self) -> usize {
        self.last_popcount
    }

    /// Count the set bits without touching the cache.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the bits in index order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

impl<const WORDS: usize> Index<usize> for Bitarray<WORDS> {
    type Output = bool;

    #[inline]
    fn index(&self, index: usize) -> &bool {
        if self.get(index) {
            &true
        } else {
            &false
        }
    }
}

// Equality is on contents only; the popcount cache is not compared.
impl<const WORDS: usize> PartialEq for Bitarray<WORDS> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.words == other.words
    }
}

impl<const WORDS: usize> Eq for Bitarray<WORDS> {}

impl<const WORDS: usize> fmt::Debug for Bitarray<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitarray<{}>[", self.len)?;
        for bit in self.iter() {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Bits200 = Bitarray<{ words_for(200) }>;

    #[test]
    fn test_initially_clear() {
        let bits = Bitarray::<2>::new(80);
        assert_eq!(bits.len(), 80);
        assert!(bits.iter().all(|b| !b));
    }

    #[test]
    fn test_initially_set() {
        let mut bits = Bitarray::<2>::filled(80, true);
        assert!(bits.iter().all(|b| b));
        assert_eq!(bits.popcount(), 80);
    }

    #[test]
    fn test_set_clear_toggle() {
        let mut bits = Bits200::new(200);
        bits.set(100);
        assert!(bits[100]);
        bits.clear(100);
        assert!(!bits[100]);
        bits.toggle(100);
        assert!(bits[100]);
        bits.toggle(100);
        assert!(!bits[100]);
    }

    #[test]
    fn test_assign() {
        let mut bits = Bits200::filled(200, true);
        bits.assign(100, false);
        assert!(!bits.get(100));
        bits.assign(100, true);
        assert!(bits.get(100));
    }

    #[test]
    fn test_popcount() {
        let mut bits = Bits200::new(200);
        bits.set(1);
        bits.set(10);
        bits.set(100);
        assert_eq!(bits.popcount(), 3);
    }

    #[test]
    fn test_cached_popcount_is_stale_until_recomputed() {
        let mut bits = Bits200::new(200);
        bits.set(5);
        assert_eq!(bits.popcount(), 1);

        bits.set(6);
        // The shared accessor trusts the cache.
        assert_eq!(bits.cached_popcount(), 1);
        assert_eq!(bits.count_ones(), 2);
        assert_eq!(bits.popcount(), 2);
        assert_eq!(bits.cached_popcount(), 2);
    }

    #[test]
    fn test_find() {
        let mut bits = Bits200::new(200);
        assert_eq!(bits.find(), None);
        bits.set(100);
        bits.set(150);
        assert_eq!(bits.find(), Some(100));
        // The start position is inclusive.
        assert_eq!(bits.find_from(100), Some(100));
        assert_eq!(bits.find_from(101), Some(150));
        assert_eq!(bits.find_from(151), None);
    }

    #[test]
    fn test_find_clear() {
        let mut bits = Bits200::filled(200, true);
        assert_eq!(bits.find_value(false), None);
        bits.clear(100);
        bits.clear(150);
        assert_eq!(bits.find_value(false), Some(100));
        assert_eq!(bits.find_value_from(101, false), Some(150));
    }

    #[test]
    fn test_find_clear_ignores_padding() {
        let bits = Bitarray::<1>::filled(10, true);
        assert_eq!(bits.find_value(false), None);
    }

    #[test]
    fn test_set_range() {
        let mut bits = Bitarray::<2>::new(100);
        bits.set_range(7, 90);
        assert_eq!(bits.popcount(), 90);
        assert_eq!(bits.find(), Some(7));
        assert_eq!(bits.find_value_from(7, false), Some(97));
    }

    #[test]
    fn test_clear_range() {
        let mut bits = Bitarray::<2>::filled(100, true);
        assert_eq!(bits.popcount(), 100);
        bits.clear_range(7, 90);
        assert_eq!(bits.popcount(), 10);
        assert_eq!(bits.find_value(false), Some(7));
        assert_eq!(bits.find_from(7), Some(97));
    }

    #[test]
    fn test_range_at_word_boundaries() {
        for start in [0usize, 1, 62, 63, 64, 65, 127, 128] {
            for count in [0, 1, 2, 63, 64, 65, 66, 130] {
                if start + count > 200 {
                    continue;
                }

                let mut bulk = Bits200::new(200);
                bulk.set(start.saturating_sub(1));
                let before = bulk.popcount();
                bulk.set_range(start, count);

                let mut single = Bits200::new(200);
                single.set(start.saturating_sub(1));
                for i in start..start + count {
                    single.set(i);
                }

                assert_eq!(bulk, single, "set_range({}, {})", start, count);
                let newly_set = (start..start + count)
                    .filter(|&i| i != start.saturating_sub(1))
                    .count();
                assert_eq!(bulk.popcount(), before + newly_set);

                bulk.clear_range(start, count);
                for i in start..start + count {
                    single.clear(i);
                }
                assert_eq!(bulk, single, "clear_range({}, {})", start, count);
            }
        }
    }

    #[test]
    fn test_range_up_to_end() {
        let mut bits = Bitarray::<2>::new(128);
        bits.set_range(64, 64);
        assert_eq!(bits.popcount(), 64);
        assert_eq!(bits.find(), Some(64));
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_index() {
        let bits = Bitarray::<1>::new(10);
        let _ = bits.get(10);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_set_range() {
        let mut bits = Bitarray::<1>::new(10);
        bits.set_range(5, 6);
    }
}
