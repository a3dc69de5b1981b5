//! A fixed-size bit array supporting constant-time scans for the highest
//! set bit.
use core::fmt;

use super::{find_last_set, Init};

/// The number of bits a [`PrioBitmap`] can hold. This matches the upper
/// bound of the `PRIORITY_LEVELS` configuration.
pub const PRIO_BITMAP_LEN: usize = 256;

type Word = usize;

const WORD_LEN: usize = usize::BITS as usize;
const WORD_COUNT: usize = (PRIO_BITMAP_LEN + WORD_LEN - 1) / WORD_LEN;

/// A two-level bit array over [`PRIO_BITMAP_LEN`] bit positions.
///
/// The first level is a single group word; the second level is an array of
/// bit words. Scanning for the highest set bit takes two `find_last_set`
/// operations regardless of the population.
///
/// The backing arrays are sized for the maximum rather than the configured
/// level count, trading at most a few words of storage for a stable-Rust
/// type definition.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    /// Invariant: bit `g` is set iff `words[g] != 0`.
    group: Word,
    words: [Word; WORD_COUNT],
}

impl Init for PrioBitmap {
    const INIT: Self = Self {
        group: 0,
        words: [0; WORD_COUNT],
    };
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_BITMAP_LEN);
        self.words[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        self.words[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.group |= 1 << (i / WORD_LEN);
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        let word = &mut self.words[i / WORD_LEN];
        *word &= !(1 << (i % WORD_LEN));
        if *word == 0 {
            self.group &= !(1 << (i / WORD_LEN));
        }
    }

    /// Get the position of the highest set bit.
    #[inline]
    pub fn find_last_set(&self) -> Option<usize> {
        let g = find_last_set(self.group)? as usize;
        let b = match find_last_set(self.words[g]) {
            Some(b) => b as usize,
            // The group invariant guarantees a non-zero word.
            None => unreachable!(),
        };
        Some(g * WORD_LEN + b)
    }

    /// Check if no bits are set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.group == 0
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIO_BITMAP_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}
