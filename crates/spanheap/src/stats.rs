//! Allocation counters.
//!
//! Contexts accumulate counts locally and flush them here in batches, so
//! these atomics see one update per refill rather than one per object.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::sizeclass::NUM_SIZE_CLASSES;

/// Heap-wide allocation counters, grouped by size class.
pub struct HeapStats {
    small_alloc_count: [AtomicU64; NUM_SIZE_CLASSES],
    tiny_alloc_count: AtomicU64,
    large_alloc_count: AtomicU64,
    large_alloc_bytes: AtomicU64,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            small_alloc_count: [const { AtomicU64::new(0) }; NUM_SIZE_CLASSES],
            tiny_alloc_count: AtomicU64::new(0),
            large_alloc_count: AtomicU64::new(0),
            large_alloc_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_small_allocs(&self, size_class: usize, count: u64) {
        self.small_alloc_count[size_class].fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_tiny_allocs(&self, count: u64) {
        self.tiny_alloc_count.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_large(&self, bytes: u64) {
        self.large_alloc_count.fetch_add(1, Ordering::Relaxed);
        self.large_alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Objects allocated in the given small size class so far.
    #[must_use]
    pub fn small_alloc_count(&self, size_class: usize) -> u64 {
        self.small_alloc_count[size_class].load(Ordering::Relaxed)
    }

    /// Allocations that went through the tiny allocator.
    #[must_use]
    pub fn tiny_alloc_count(&self) -> u64 {
        self.tiny_alloc_count.load(Ordering::Relaxed)
    }

    /// Number of large-object allocations.
    #[must_use]
    pub fn large_alloc_count(&self) -> u64 {
        self.large_alloc_count.load(Ordering::Relaxed)
    }

    /// Bytes allocated to large objects, span-rounded.
    #[must_use]
    pub fn large_alloc_bytes(&self) -> u64 {
        self.large_alloc_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = HeapStats::new();
        stats.add_small_allocs(3, 7);
        stats.add_tiny_allocs(2);
        stats.record_large(65536);
        assert_eq!(stats.small_alloc_count(3), 7);
        assert_eq!(stats.small_alloc_count(4), 0);
        assert_eq!(stats.tiny_alloc_count(), 2);
        assert_eq!(stats.large_alloc_count(), 1);
        assert_eq!(stats.large_alloc_bytes(), 65536);
    }
}
