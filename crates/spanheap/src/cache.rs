//! Per-context allocation caches.
//!
//! A context cache is the lock-free top tier: one cached span per span
//! class, a bump cursor for tiny pointer-free objects, and a page-cache
//! window for span carving. `&mut self` on every operation models the
//! runtime's guarantee that a context is not preempted mid-allocation;
//! nothing here takes a lock until a refill falls through to the
//! central lists.

use std::array;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::heap::{run_on_system_context, Heap};
use crate::pagecache::PageCache;
use crate::sizeclass::{
    size_to_class, SpanClass, LARGE_SIZE_CLASS, MAX_SMALL_SIZE, NUM_SPAN_CLASSES, PAGE_SIZE,
    SIZE_CLASSES, TINY_MAX, TINY_SPAN_CLASS,
};

/// A per-context allocation cache.
///
/// Contexts allocate without synchronization from spans they own
/// outright; the heap only gets involved when a span fills up. Dropping
/// the cache returns every span and cached page to the heap.
pub struct ContextCache {
    /// One cached span per span class; `None` is the empty placeholder.
    alloc: [Option<crate::span::SpanHandle>; NUM_SPAN_CLASSES],
    /// Base of the current tiny block, 0 when there is none.
    tiny: usize,
    /// Next free byte within the tiny block.
    tiny_offset: usize,
    /// Tiny allocations not yet flushed to the heap stats.
    tiny_allocs: u64,
    /// Scannable bytes allocated since the last controller flush.
    scan_alloc: usize,
    /// Sweep generation this cache last reconciled against.
    flush_gen: u32,
    page_cache: PageCache,
    heap: Arc<Heap>,
}

impl ContextCache {
    pub(crate) fn new(heap: Arc<Heap>) -> Self {
        Self {
            alloc: array::from_fn(|_| None),
            tiny: 0,
            tiny_offset: 0,
            tiny_allocs: 0,
            scan_alloc: 0,
            flush_gen: heap.sweepgen(),
            page_cache: PageCache::empty(),
            heap,
        }
    }

    /// The heap this cache allocates from.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocates `size` bytes. `noscan` marks the object pointer-free so
    /// the collector can skip it (and routes small ones to the tiny
    /// allocator). The memory is not zeroed.
    ///
    /// # Panics
    ///
    /// Panics on zero-size requests and when the OS is out of memory.
    pub fn allocate(&mut self, size: usize, noscan: bool) -> NonNull<u8> {
        assert!(size != 0, "zero-size allocation");
        if size > MAX_SMALL_SIZE {
            return self.allocate_large(size, noscan);
        }
        let addr = if noscan && size < TINY_MAX {
            self.allocate_tiny(size)
        } else {
            let class = size_to_class(size);
            let addr = self.alloc_from_span(SpanClass::new(class, noscan));
            if !noscan {
                self.scan_alloc += SIZE_CLASSES[class].size;
            }
            addr
        };
        // SAFETY: span memory comes from mapped, non-null chunk bases.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Bump-allocates within a shared 16-byte block. Joined objects die
    /// together: the block stays live until no object in it is marked.
    fn allocate_tiny(&mut self, size: usize) -> usize {
        let mut off = self.tiny_offset;
        // Align to the largest power of two dividing the size.
        if size & 7 == 0 {
            off = (off + 7) & !7;
        } else if size & 3 == 0 {
            off = (off + 3) & !3;
        } else if size & 1 == 0 {
            off = (off + 1) & !1;
        }
        if self.tiny != 0 && off + size <= TINY_MAX {
            let addr = self.tiny + off;
            self.tiny_offset = off + size;
            self.tiny_allocs += 1;
            return addr;
        }
        let addr = self.alloc_from_span(TINY_SPAN_CLASS);
        // Keep whichever block has more room left.
        if size < self.tiny_offset || self.tiny == 0 {
            self.tiny = addr;
            self.tiny_offset = size;
        }
        self.tiny_allocs += 1;
        addr
    }

    fn alloc_from_span(&mut self, spc: SpanClass) -> usize {
        loop {
            if let Some(handle) = &self.alloc[spc.index()] {
                let span = Arc::clone(&handle.span);
                // SAFETY: a cached span's bookkeeping belongs to this
                // context alone.
                let book = unsafe { span.book_mut() };
                let index = book.next_free_index(span.nelems());
                if index < span.nelems() {
                    book.alloc_count += 1;
                    return span.object_addr(index as usize);
                }
            }
            self.refill(spc);
        }
    }

    /// Swaps the full cached span for one with free slots.
    ///
    /// # Panics
    ///
    /// Panics when the cached span still has free slots ("refill of span
    /// with free space remaining"), when its state tag is not
    /// cached-current ("bad sweepgen in refill"), and when every tier
    /// below is exhausted ("out of memory").
    fn refill(&mut self, spc: SpanClass) {
        let sg = self.heap.sweepgen();
        if let Some(old) = self.alloc[spc.index()].take() {
            let span = Arc::clone(&old.span);
            // SAFETY: still cached, still ours.
            let book = unsafe { span.book_mut() };
            assert_eq!(
                book.alloc_count,
                span.nelems(),
                "refill of span with free space remaining"
            );
            assert_eq!(
                span.sweepgen(),
                sg.wrapping_add(3),
                "bad sweepgen in refill"
            );
            let slots_used = u64::from(book.alloc_count - book.alloc_count_before_cache);
            book.alloc_count_before_cache = 0;
            self.heap.stats().add_small_allocs(spc.size_class(), slots_used);
            self.heap
                .controller()
                .record_alloc(slots_used * span.elem_size() as u64);
            if spc == TINY_SPAN_CLASS {
                self.heap.stats().add_tiny_allocs(self.tiny_allocs);
                self.tiny_allocs = 0;
            }
            self.heap.central(spc).uncache_span(&self.heap, old);
        }

        let handle = self
            .heap
            .central(spc)
            .cache_span(&self.heap, Some(&mut self.page_cache))
            .unwrap_or_else(|| panic!("out of memory"));
        let span = Arc::clone(&handle.span);
        // SAFETY: caching confers ownership of the bookkeeping.
        let book = unsafe { span.book_mut() };
        assert!(
            book.alloc_count < span.nelems(),
            "span has no free space"
        );
        span.set_sweepgen(sg.wrapping_add(3));
        book.alloc_count_before_cache = book.alloc_count;

        // Credit the span's whole free capacity as live now; release_all
        // and the sweep correct the overshoot.
        let used_bytes = i64::from(book.alloc_count) * span.elem_size() as i64;
        self.heap.controller().update_live(
            (span.npages() * PAGE_SIZE) as i64 - used_bytes,
            self.scan_alloc as i64,
        );
        self.scan_alloc = 0;
        self.alloc[spc.index()] = Some(handle);
    }

    /// Allocates a dedicated single-object span for an object too big
    /// for any size class.
    fn allocate_large(&mut self, size: usize, noscan: bool) -> NonNull<u8> {
        let npages = size.div_ceil(PAGE_SIZE);
        let bytes = npages
            .checked_mul(PAGE_SIZE)
            .unwrap_or_else(|| panic!("out of memory"));
        let spc = SpanClass::new(LARGE_SIZE_CLASS, noscan);
        let handle = self
            .heap
            .alloc_span(npages, spc, Some(&mut self.page_cache))
            .unwrap_or_else(|| panic!("out of memory"));
        let span = Arc::clone(&handle.span);
        // SAFETY: a fresh span is exclusively ours until published.
        let book = unsafe { span.book_mut() };
        book.alloc_count = 1;
        book.freeindex = 1;
        book.alloc_bits[0] = 1;
        book.alloc_cache = 0;

        self.heap.stats().record_large(bytes as u64);
        self.heap.controller().record_alloc(bytes as u64);
        if !noscan {
            self.heap.controller().record_scan(bytes as u64);
        }
        // Credit the scan estimate too; the sweep debits the same
        // amount when the object dies.
        let scan_bytes = if noscan { 0 } else { bytes as i64 };
        self.heap.controller().update_live(bytes as i64, scan_bytes);

        // File it as swept-full so the background sweeper will find it
        // next cycle; there is nothing left to allocate from it.
        let sg = self.heap.sweepgen();
        self.heap.central(spc).full_swept(sg).push(handle.id);

        // SAFETY: the span base is mapped and non-null.
        unsafe { NonNull::new_unchecked(span.base() as *mut u8) }
    }

    /// Returns every cached span to its central list and reconciles the
    /// live-byte accounting in one batch.
    pub fn release_all(&mut self) {
        let scan_alloc = self.scan_alloc as i64;
        self.scan_alloc = 0;
        let sg = self.heap.sweepgen();
        let mut d_heap_live = 0i64;
        for index in 0..NUM_SPAN_CLASSES {
            let Some(handle) = self.alloc[index].take() else {
                continue;
            };
            let spc = SpanClass::from_index(index);
            let span = Arc::clone(&handle.span);
            // SAFETY: cached span; this context owns the bookkeeping.
            let book = unsafe { span.book_mut() };
            let slots_used = u64::from(book.alloc_count - book.alloc_count_before_cache);
            book.alloc_count_before_cache = 0;
            self.heap.stats().add_small_allocs(spc.size_class(), slots_used);
            self.heap
                .controller()
                .record_alloc(slots_used * span.elem_size() as u64);
            if span.sweepgen() != sg.wrapping_add(1) {
                // Refill credited the whole free capacity; take back
                // what never got used. Stale spans are left to the
                // sweep, which recounts them from scratch.
                d_heap_live -=
                    i64::from(span.nelems() - book.alloc_count) * span.elem_size() as i64;
            }
            self.heap.central(spc).uncache_span(&self.heap, handle);
        }
        self.tiny = 0;
        self.tiny_offset = 0;
        self.heap.stats().add_tiny_allocs(self.tiny_allocs);
        self.tiny_allocs = 0;
        self.heap.controller().update_live(d_heap_live, scan_alloc);
    }

    /// Synchronizes this cache with the current sweep cycle. Must run
    /// before the context allocates again after [`Heap::begin_sweep_cycle`].
    ///
    /// # Panics
    ///
    /// Panics ("bad flush generation") when the cache skipped a cycle,
    /// which means a context allocated through an entire collection
    /// without ever being flushed.
    pub fn prepare_for_sweep(&mut self) {
        let sg = self.heap.sweepgen();
        if self.flush_gen == sg {
            return;
        }
        assert_eq!(
            self.flush_gen,
            sg.wrapping_sub(2),
            "bad flush generation"
        );
        self.release_all();
        self.flush_gen = sg;
    }
}

impl Drop for ContextCache {
    fn drop(&mut self) {
        run_on_system_context(|| {
            self.release_all();
            self.heap.pages().flush_cache(&mut self.page_cache);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;

    #[test]
    fn test_tiny_allocations_pack_one_block() {
        let heap = Heap::new(HeapConfig::default());
        let mut ctx = heap.new_context();
        let a = ctx.allocate(4, true).as_ptr() as usize;
        let b = ctx.allocate(4, true).as_ptr() as usize;
        let c = ctx.allocate(8, true).as_ptr() as usize;
        // Two 4-byte objects and one aligned 8-byte object share the
        // 16-byte block.
        assert_eq!(b, a + 4);
        assert_eq!(c, a + 8);
        let d = ctx.allocate(8, true).as_ptr() as usize;
        assert_ne!(d, c);
    }

    #[test]
    fn test_tiny_alignment() {
        let heap = Heap::new(HeapConfig::default());
        let mut ctx = heap.new_context();
        let _ = ctx.allocate(1, true);
        let a = ctx.allocate(8, true).as_ptr() as usize;
        assert_eq!(a % 8, 0);
        let _ = ctx.allocate(2, true);
        let b = ctx.allocate(4, true).as_ptr() as usize;
        assert_eq!(b % 4, 0);
    }

    #[test]
    fn test_small_objects_are_distinct_and_class_sized() {
        let heap = Heap::new(HeapConfig::default());
        let mut ctx = heap.new_context();
        let mut seen = Vec::new();
        for _ in 0..32 {
            let p = ctx.allocate(100, false).as_ptr() as usize;
            assert_eq!(p % 8, 0);
            assert!(!seen.contains(&p));
            seen.push(p);
        }
        // 100 bytes routes to the 128-byte class.
        assert!(seen.windows(2).all(|w| w[1].abs_diff(w[0]) >= 128));
    }

    #[test]
    #[should_panic(expected = "zero-size allocation")]
    fn test_zero_size_rejected() {
        let heap = Heap::new(HeapConfig::default());
        let mut ctx = heap.new_context();
        let _ = ctx.allocate(0, true);
    }
}
