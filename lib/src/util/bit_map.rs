use std::fmt::{Debug, Error, Formatter};

/// Fixed-size bit vector, stored in 32-bit words (bit `i` lives in word `i / 32` at position
/// `i % 32`)
///
/// Frame maps use one bit per local variable and operand stack slot. The word size matches the
/// packed frame map tables attached to compiled methods, so maps can be copied into those tables
/// without re-packing.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitMap {
    words: Box<[u32]>,
    len: usize,
}

impl BitMap {
    pub const WORD_BITS: usize = 32;

    /// Number of words needed to hold `len` bits
    pub const fn words_for(len: usize) -> usize {
        (len + Self::WORD_BITS - 1) / Self::WORD_BITS
    }

    /// All bits clear
    pub fn zeros(len: usize) -> BitMap {
        BitMap {
            words: vec![0; Self::words_for(len)].into_boxed_slice(),
            len,
        }
    }

    /// All bits set
    pub fn filled(len: usize) -> BitMap {
        let mut map = BitMap {
            words: vec![u32::MAX; Self::words_for(len)].into_boxed_slice(),
            len,
        };
        map.mask_tail();
        map
    }

    /// Rebuild a bit map from packed words
    ///
    /// Extra words are ignored and missing words are treated as zero.
    pub fn from_words(len: usize, words: &[u32]) -> BitMap {
        let mut map = BitMap::zeros(len);
        for (dst, src) in map.words.iter_mut().zip(words) {
            *dst = *src;
        }
        map.mask_tail();
        map
    }

    fn mask_tail(&mut self) {
        let used = self.len % Self::WORD_BITS;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u32 << used) - 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len
            && self.words[index / Self::WORD_BITS] & (1 << (index % Self::WORD_BITS)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / Self::WORD_BITS] |= 1 << (index % Self::WORD_BITS);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / Self::WORD_BITS] &= !(1 << (index % Self::WORD_BITS));
        }
    }

    /// Replace every bit with zero
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    /// Intersect in place, returning whether any bit changed
    pub fn intersect_with(&mut self, other: &BitMap) -> bool {
        let mut changed = false;
        for (word, other_word) in self.words.iter_mut().zip(other.words.iter()) {
            let narrowed = *word & *other_word;
            changed |= narrowed != *word;
            *word = narrowed;
        }
        changed
    }

    /// Every bit set here is also set in `other`
    pub fn is_subset_of(&self, other: &BitMap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(word, other_word)| word & !other_word == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Indices of set bits, in increasing order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, word)| {
                let mut remaining = *word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_index * Self::WORD_BITS + bit)
                })
            })
    }
}

/// Bits print lowest index first (`0110` has bits 1 and 2 set)
impl Debug for BitMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let rendered: String = (0..self.len)
            .map(|i| if self.get(i) { '1' } else { '0' })
            .collect();
        f.write_str(&rendered)
    }
}
