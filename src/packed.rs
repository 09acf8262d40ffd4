//! Packed arrays of small unsigned integers.
//!
//! Entries never straddle a word boundary: each `u64` word holds
//! `64 / bits` entries, and any leftover high bits of a word are unused.

use core::{
    alloc::{Layout, LayoutError},
    fmt,
    ptr::NonNull,
};

type Word = u64;

const WORD_BITS: u32 = Word::BITS;

/// A fixed-length array of `bits`-wide unsigned integers.
///
/// The words are owned by the caller, which obtains a suitable region with
/// [`PackedArray::map_layout`].
pub struct PackedArray {
    bits: u32,
    per_word: usize,
    len: usize,
    words: NonNull<Word>,
}

impl PackedArray {
    /// Returns the number of words needed to hold `len` entries of `bits` bits.
    #[inline]
    pub fn num_words(bits: u32, len: usize) -> usize {
        assert!(bits > 0 && bits <= WORD_BITS, "unsupported entry width");

        let per_word = (WORD_BITS / bits) as usize;
        len.div_ceil(per_word)
    }

    /// Returns the layout of the words backing an array of `len` entries of
    /// `bits` bits.
    pub fn map_layout(bits: u32, len: usize) -> Result<Layout, LayoutError> {
        Layout::array::<Word>(Self::num_words(bits, len))
    }

    /// Constructs a zeroed array of `len` entries, backed by `words`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `words` must be valid for reads and writes for
    ///   `Self::map_layout(bits, len).size()` bytes, and it must be properly
    ///   aligned.
    /// - The memory at `words` must not be accessed by anything else while the
    ///   array exists.
    pub unsafe fn new(bits: u32, len: usize, words: NonNull<Word>) -> PackedArray {
        let num_words = Self::num_words(bits, len);

        for i in 0..num_words {
            unsafe { words.as_ptr().add(i).write(0) };
        }

        PackedArray {
            bits,
            per_word: (WORD_BITS / bits) as usize,
            len,
            words,
        }
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the width of each entry in bits.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Mask of the low `bits` bits.
    #[inline]
    fn front_mask(&self) -> Word {
        match self.bits {
            WORD_BITS => Word::MAX,
            b => (1 << b) - 1,
        }
    }

    /// Returns a tuple of the index of the word containing entry `index` and
    /// the shift of that entry within the word.
    #[inline]
    fn word_and_shift(&self, index: usize) -> (usize, u32) {
        let offset = index % self.per_word;
        (index / self.per_word, offset as u32 * self.bits)
    }

    #[inline]
    fn word(&self, word_idx: usize) -> Word {
        // In bounds: `word_idx` is derived from an index below `self.len`.
        unsafe { self.words.as_ptr().add(word_idx).read() }
    }

    #[inline]
    fn set_word(&mut self, word_idx: usize, value: Word) {
        unsafe { self.words.as_ptr().add(word_idx).write(value) };
    }

    /// Gets the value of the indexed entry.
    #[inline]
    pub fn get(&self, index: usize) -> Word {
        assert!(index < self.len, "packed array index out of bounds");

        let (word_idx, shift) = self.word_and_shift(index);
        (self.word(word_idx) >> shift) & self.front_mask()
    }

    /// Sets the value of the indexed entry.
    ///
    /// `value` must fit in `self.bits()` bits.
    #[inline]
    pub fn set(&mut self, index: usize, value: Word) {
        assert!(index < self.len, "packed array index out of bounds");
        debug_assert!(value <= self.front_mask(), "value too wide for entry");

        let (word_idx, shift) = self.word_and_shift(index);
        let mask = self.front_mask() << shift;
        let word = self.word(word_idx) & !mask;
        self.set_word(word_idx, word | ((value << shift) & mask));
    }

    /// Sets every entry in `lo..hi` to `value`.
    ///
    /// When the range covers whole words, those words are written with a
    /// single store each; only the partial first and last words are written
    /// entry by entry.
    pub fn set_range(&mut self, lo: usize, hi: usize, value: Word) {
        if lo >= hi {
            return;
        }

        assert!(hi <= self.len, "packed array range out of bounds");
        debug_assert!(value <= self.front_mask(), "value too wide for entry");

        let first_word = lo / self.per_word;
        let last_word = hi / self.per_word;

        // Same or adjacent words: no whole word in between.
        if last_word - first_word <= 1 {
            for index in lo..hi {
                self.set(index, value);
            }
            return;
        }

        let head_end = (first_word + 1) * self.per_word;
        for index in lo..head_end {
            self.set(index, value);
        }

        for index in last_word * self.per_word..hi {
            self.set(index, value);
        }

        let pattern = self.splat(value);
        for word_idx in first_word + 1..last_word {
            self.set_word(word_idx, pattern);
        }
    }

    /// Builds a word in which every entry holds `value`.
    fn splat(&self, value: Word) -> Word {
        (0..self.per_word as u32).fold(0, |word, slot| word | (value << (slot * self.bits)))
    }

    /// Returns an iterator over the entries.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            array: self,
            index: 0,
        }
    }
}

impl fmt::Debug for PackedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedArray")
            .field("bits", &self.bits)
            .field("len", &self.len)
            .finish()
    }
}

/// An iterator over the entries of a [`PackedArray`].
#[derive(Debug)]
pub struct Iter<'a> {
    array: &'a PackedArray,
    index: usize,
}

impl Iterator for Iter<'_> {
    type Item = Word;

    fn next(&mut self) -> Option<Word> {
        if self.index == self.array.len() {
            return None;
        }

        let value = self.array.get(self.index);
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.array.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    /// A `PackedArray` together with the `Vec` that backs it.
    struct VecPacked {
        array: PackedArray,
        _words: Vec<Word>,
    }

    impl VecPacked {
        fn new(bits: u32, len: usize) -> VecPacked {
            // Garbage on purpose: construction must zero the words.
            let mut words = vec![Word::MAX; PackedArray::num_words(bits, len)];
            let ptr = NonNull::new(words.as_mut_ptr()).unwrap();

            VecPacked {
                array: unsafe { PackedArray::new(bits, len, ptr) },
                _words: words,
            }
        }
    }

    #[test]
    fn init_many() {
        for bits in 1..=WORD_BITS {
            for len in 1..=130 {
                let p = VecPacked::new(bits, len);
                assert!(p.array.iter().all(|v| v == 0));
                assert_eq!(p.array.iter().len(), len);
            }
        }
    }

    #[test]
    fn num_words() {
        assert_eq!(PackedArray::num_words(1, 64), 1);
        assert_eq!(PackedArray::num_words(1, 65), 2);
        // 21 three-bit entries per word.
        assert_eq!(PackedArray::num_words(3, 16), 1);
        assert_eq!(PackedArray::num_words(3, 22), 2);
        assert_eq!(PackedArray::num_words(64, 3), 3);
    }

    #[test]
    fn get_back_values() {
        let mut p = VecPacked::new(5, 10000);
        let a = &mut p.array;

        a.set(90, 30);
        a.set(91, 31);
        a.set(89, 10);
        a.set(80, 10);

        assert_eq!(a.get(90), 30);
        assert_eq!(a.get(91), 31);
        assert_eq!(a.get(89), 10);
        assert_eq!(a.get(80), 10);

        a.set(90, 0);
        a.set(91, 20);

        assert_eq!(a.get(90), 0);
        assert_eq!(a.get(91), 20);
        assert_eq!(a.get(89), 10);
        assert_eq!(a.get(80), 10);
    }

    #[test]
    fn one_bit_entries() {
        let mut p = VecPacked::new(1, 1000);
        let a = &mut p.array;

        a.set(1, 0);
        a.set(999, 1);
        a.set(990, 1);

        assert_eq!(a.get(1), 0);
        assert_eq!(a.get(999), 1);
        assert_eq!(a.get(990), 1);
        assert_eq!(a.iter().filter(|&v| v == 1).count(), 2);

        a.set(999, 0);
        a.set(990, 0);

        assert_eq!(a.get(990), 0);
        assert_eq!(a.get(999), 0);
    }

    #[test]
    fn full_width_entries() {
        let mut p = VecPacked::new(64, 4);
        let a = &mut p.array;

        a.set(2, u64::MAX);
        a.set_range(0, 2, 7);

        assert_eq!(a.iter().collect::<Vec<_>>(), [7, 7, u64::MAX, 0]);
    }

    #[test]
    fn range_set() {
        let mut p = VecPacked::new(4, 9990);
        let a = &mut p.array;

        a.set_range(100, 1000, 9);
        a.set_range(1000, 2000, 8);

        assert!((100..1000).all(|i| a.get(i) == 9));
        assert!((1000..2000).all(|i| a.get(i) == 8));
        assert_eq!(a.get(99), 0);
        assert_eq!(a.get(2000), 0);

        a.set_range(101, 102, 7);
        assert_eq!(a.get(100), 9);
        assert_eq!(a.get(101), 7);
        assert!((102..1000).all(|i| a.get(i) == 9));
    }

    #[test]
    fn range_set_matches_single_sets() {
        for bits in [1, 3, 5, 13, 32] {
            let len = 300;
            let max = (1u64 << bits) - 1;

            for (lo, hi) in [(0, 300), (3, 4), (5, 70), (63, 65), (1, 299), (64, 128)] {
                let mut ranged = VecPacked::new(bits, len);
                let mut single = VecPacked::new(bits, len);

                ranged.array.set_range(lo, hi, max);
                for i in lo..hi {
                    single.array.set(i, max);
                }

                assert!(ranged.array.iter().eq(single.array.iter()));
            }
        }
    }

    #[test]
    fn empty_range_is_noop() {
        let mut p = VecPacked::new(3, 16);
        p.array.set_range(5, 5, 7);
        p.array.set_range(9, 2, 7);
        assert!(p.array.iter().all(|v| v == 0));
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_get() {
        let p = VecPacked::new(3, 16);
        p.array.get(16);
    }
}
