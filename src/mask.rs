//! Page Mask - Bitmap over one alignment granule
//!
//! One bit per 4 KiB page of a 2 MiB granule. Used for per-residency service
//! plans, OS residency queries and the prefetch heuristic.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use crate::types::PAGES_PER_GRANULE;

const WORDS: usize = PAGES_PER_GRANULE / 64;

/// Bitmap of pages within one granule
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageMask {
    words: [u64; WORDS],
}

impl PageMask {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Every page of the granule
    pub const fn full() -> Self {
        Self {
            words: [u64::MAX; WORDS],
        }
    }

    /// Pages `[first, end)`
    pub fn range(first: usize, end: usize) -> Self {
        let mut mask = Self::new();
        mask.set_range(first, end);
        mask
    }

    pub fn set(&mut self, page: usize) {
        debug_assert!(page < PAGES_PER_GRANULE);
        self.words[page / 64] |= 1 << (page % 64);
    }

    pub fn clear(&mut self, page: usize) {
        debug_assert!(page < PAGES_PER_GRANULE);
        self.words[page / 64] &= !(1 << (page % 64));
    }

    pub fn test(&self, page: usize) -> bool {
        page < PAGES_PER_GRANULE && self.words[page / 64] & (1 << (page % 64)) != 0
    }

    pub fn set_range(&mut self, first: usize, end: usize) {
        let end = end.min(PAGES_PER_GRANULE);
        for page in first..end {
            self.set(page);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set pages within `[first, end)`
    pub fn count_range(&self, first: usize, end: usize) -> usize {
        (first..end.min(PAGES_PER_GRANULE))
            .filter(|p| self.test(*p))
            .count()
    }

    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Iterate over set pages in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let mut bits = *word;
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }

    /// Iterate over maximal runs of set pages as `[start, end)`
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut page = 0;
        core::iter::from_fn(move || {
            while page < PAGES_PER_GRANULE && !self.test(page) {
                page += 1;
            }
            if page >= PAGES_PER_GRANULE {
                return None;
            }
            let start = page;
            while page < PAGES_PER_GRANULE && self.test(page) {
                page += 1;
            }
            Some((start, page))
        })
    }

    /// Pages in `self` but not in `other`
    pub fn and_not(&self, other: &PageMask) -> PageMask {
        *self & !*other
    }
}

impl BitOr for PageMask {
    type Output = PageMask;

    fn bitor(mut self, rhs: Self) -> Self::Output {
        self |= rhs;
        self
    }
}

impl BitOrAssign for PageMask {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= *b;
        }
    }
}

impl BitAnd for PageMask {
    type Output = PageMask;

    fn bitand(mut self, rhs: Self) -> Self::Output {
        self &= rhs;
        self
    }
}

impl BitAndAssign for PageMask {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= *b;
        }
    }
}

impl Not for PageMask {
    type Output = PageMask;

    fn not(mut self) -> Self::Output {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self
    }
}

impl fmt::Debug for PageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (start, end) in self.runs() {
            if end - start == 1 {
                list.entry(&start);
            } else {
                list.entry(&(start..end));
            }
        }
        list.finish()
    }
}
