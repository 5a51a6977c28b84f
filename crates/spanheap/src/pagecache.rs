//! Per-context page cache.
//!
//! A page cache is a 64-page-aligned window into the global page bitmap
//! that a context owns outright, letting it grab a handful of pages
//! without touching the global allocator lock. Two 64-bit masks track
//! the window: `cache` (1 = free) and `scav` (1 = reclaimed to the OS,
//! meaningful only while the page is also free).

use crate::sizeclass::PAGE_SIZE;

/// Number of pages a cache window spans.
pub const PAGE_CACHE_PAGES: usize = 64;

/// A context-owned window of up to 64 free pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageCache {
    base: usize,
    cache: u64,
    scav: u64,
}

impl PageCache {
    /// An empty cache; every allocation from it fails.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: 0,
            cache: 0,
            scav: 0,
        }
    }

    pub(crate) const fn new(base: usize, cache: u64, scav: u64) -> Self {
        Self { base, cache, scav }
    }

    /// Base address of the window.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Free-page mask (1 = free).
    #[must_use]
    pub const fn cache_mask(&self) -> u64 {
        self.cache
    }

    /// Reclaimed-page mask (1 = reclaimed; only while also free).
    #[must_use]
    pub const fn scav_mask(&self) -> u64 {
        self.scav
    }

    /// Whether the cache has no free pages left.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cache == 0
    }

    /// Allocates `npages` contiguous pages from the window.
    ///
    /// Returns the base address and the number of reclaimed bytes in
    /// the allocated range (so the caller can recommit them). A zero
    /// address means the window cannot satisfy the request; callers
    /// treat that as "go ask the global allocator", not as an error.
    pub fn alloc(&mut self, npages: usize) -> (usize, usize) {
        if self.cache == 0 {
            return (0, 0);
        }
        if npages == 1 {
            let i = self.cache.trailing_zeros() as usize;
            let scav = (self.scav >> i) & 1;
            self.cache &= !(1 << i);
            self.scav &= !(1 << i);
            return (self.base + i * PAGE_SIZE, scav as usize * PAGE_SIZE);
        }
        self.alloc_n(npages)
    }

    /// General case: first-fit search for a run of `npages` free bits,
    /// no wraparound.
    fn alloc_n(&mut self, npages: usize) -> (usize, usize) {
        if npages > PAGE_CACHE_PAGES {
            return (0, 0);
        }
        let i = find_bit_range_64(self.cache, npages as u32);
        if i >= 64 {
            return (0, 0);
        }
        let mask = if npages == PAGE_CACHE_PAGES {
            u64::MAX
        } else {
            ((1u64 << npages) - 1) << i
        };
        let scav_pages = (self.scav & mask).count_ones() as usize;
        self.cache &= !mask;
        self.scav &= !mask;
        (self.base + i as usize * PAGE_SIZE, scav_pages * PAGE_SIZE)
    }
}

/// Returns the lowest start index of a run of `n` set bits in `c`, or
/// 64 when no such run exists.
pub(crate) fn find_bit_range_64(mut c: u64, n: u32) -> u32 {
    let mut p = n - 1; // remaining shift to AND in
    let mut k = 1u32; // shift applied so far
    while p > 0 {
        if p <= k {
            c &= c >> (p & 63);
            break;
        }
        c &= c >> (k & 63);
        if c == 0 {
            return 64;
        }
        p -= k;
        k *= 2;
    }
    c.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_bit_range() {
        assert_eq!(find_bit_range_64(0, 1), 64);
        assert_eq!(find_bit_range_64(0b1, 1), 0);
        assert_eq!(find_bit_range_64(0b0110, 2), 1);
        assert_eq!(find_bit_range_64(0b0110, 3), 64);
        assert_eq!(find_bit_range_64(u64::MAX, 64), 0);
        assert_eq!(find_bit_range_64(u64::MAX << 1, 63), 1);
        assert_eq!(find_bit_range_64(0b1011_1000, 3), 3);
    }

    #[test]
    fn test_alloc_one_clears_both_masks() {
        let mut pc = PageCache::new(0x10000, 0b1010, 0b1000);
        let (addr, scav) = pc.alloc(1);
        assert_eq!(addr, 0x10000 + PAGE_SIZE);
        assert_eq!(scav, 0);
        assert_eq!(pc.cache_mask(), 0b1000);

        let (addr, scav) = pc.alloc(1);
        assert_eq!(addr, 0x10000 + 3 * PAGE_SIZE);
        assert_eq!(scav, PAGE_SIZE);
        assert_eq!(pc.cache_mask(), 0);
        assert_eq!(pc.scav_mask(), 0);
        assert!(pc.is_empty());
    }

    #[test]
    fn test_alloc_n_contiguous() {
        // Bits 1 and 2 free: a 2-page request lands one page in.
        let mut pc = PageCache::new(0x8000, 0b0000_0110, 0);
        let (addr, _) = pc.alloc(2);
        assert_eq!(addr, 0x8000 + PAGE_SIZE);
        assert_eq!(pc.cache_mask(), 0);
    }

    #[test]
    fn test_alloc_n_failure_leaves_masks_untouched() {
        let mut pc = PageCache::new(0x8000, 0b0101, 0b0101);
        let (addr, scav) = pc.alloc(2);
        assert_eq!(addr, 0);
        assert_eq!(scav, 0);
        assert_eq!(pc.cache_mask(), 0b0101);
        assert_eq!(pc.scav_mask(), 0b0101);
    }

    #[test]
    fn test_alloc_whole_window() {
        let mut pc = PageCache::new(0x8000, u64::MAX, 0);
        let (addr, _) = pc.alloc(64);
        assert_eq!(addr, 0x8000);
        assert!(pc.is_empty());
    }
}
