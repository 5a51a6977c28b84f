//! The shared heap: span arena, central lists, page allocator, and the
//! sweep generation that coordinates them.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cache::ContextCache;
use crate::central::CentralFreeList;
use crate::controller::{HeapController, PacerStats};
use crate::pagecache::{PageCache, PAGE_CACHE_PAGES};
use crate::pages::PageAllocator;
use crate::sizeclass::{SpanClass, NUM_SPAN_CLASSES, PAGE_SIZE};
use crate::span::{Span, SpanArena, SpanHandle};
use crate::stats::HeapStats;
use crate::sweep;

/// Spans at most this many pages may come out of a context's page cache.
const PAGE_CACHE_MAX_PAGES: usize = PAGE_CACHE_PAGES / 4;

/// Tunables for a [`Heap`].
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// How many unswept spans a central list may sweep while serving one
    /// refill before giving up and growing. Caps refill latency when the
    /// unswept sets are deep in still-full spans.
    pub sweep_budget: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self { sweep_budget: 100 }
    }
}

/// The shared tier of the allocator.
///
/// One heap serves many [`ContextCache`]s. All cross-context state lives
/// here: the span arena, one central free list per span class, the page
/// allocator, and the global sweep generation (always even; see
/// [`crate::sweep`] for how spans tag themselves against it).
pub struct Heap {
    arena: SpanArena,
    central: Box<[CentralFreeList]>,
    pages: PageAllocator,
    sweepgen: AtomicU32,
    controller: Arc<dyn HeapController>,
    stats: HeapStats,
    config: HeapConfig,
}

impl Heap {
    /// Creates a heap with a [`PacerStats`] controller.
    #[must_use]
    pub fn new(config: HeapConfig) -> Arc<Self> {
        Self::with_controller(config, Arc::new(PacerStats::new()))
    }

    /// Creates a heap reporting allocation signals to `controller`.
    #[must_use]
    pub fn with_controller(config: HeapConfig, controller: Arc<dyn HeapController>) -> Arc<Self> {
        Arc::new(Self {
            arena: SpanArena::new(),
            central: (0..NUM_SPAN_CLASSES)
                .map(|i| CentralFreeList::new(SpanClass::from_index(i)))
                .collect(),
            pages: PageAllocator::new(),
            sweepgen: AtomicU32::new(2),
            controller,
            stats: HeapStats::new(),
            config,
        })
    }

    /// Creates an allocation context backed by this heap.
    #[must_use]
    pub fn new_context(self: &Arc<Self>) -> ContextCache {
        ContextCache::new(Arc::clone(self))
    }

    /// Current sweep generation. Even; advanced by 2 per cycle.
    #[must_use]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub(crate) fn arena(&self) -> &SpanArena {
        &self.arena
    }

    pub(crate) fn central(&self, spanclass: SpanClass) -> &CentralFreeList {
        &self.central[spanclass.index()]
    }

    pub(crate) fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub(crate) fn controller(&self) -> &dyn HeapController {
        &*self.controller
    }

    pub(crate) fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocation counters.
    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Starts a new sweep cycle after the collector finishes marking.
    ///
    /// Every span tagged with the old generation becomes unswept; every
    /// context must call [`ContextCache::prepare_for_sweep`] before
    /// allocating again. The previous cycle must have finished (all
    /// unswept sets drained) before the next one starts.
    pub fn begin_sweep_cycle(&self) {
        let sg = self.sweepgen.fetch_add(2, Ordering::AcqRel).wrapping_add(2);
        #[cfg(debug_assertions)]
        for central in &self.central {
            debug_assert!(
                central.partial_swept(sg).is_empty() && central.full_swept(sg).is_empty(),
                "previous sweep cycle unfinished"
            );
        }
        tracing::debug!(sweepgen = sg, "sweep cycle started");
    }

    /// Sweeps one span, chosen from any central list's unswept sets.
    /// Returns `false` when nothing is left to sweep.
    pub fn sweep_one(&self) -> bool {
        let sg = self.sweepgen();
        for central in &self.central {
            for set in [central.partial_unswept(sg), central.full_unswept(sg)] {
                while let Some(id) = set.pop() {
                    let handle = SpanHandle {
                        id,
                        span: self.arena.get(id),
                    };
                    if handle.span.try_claim_sweep(sg) {
                        sweep::sweep_span(self, &handle, false);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Drains the unswept sets completely.
    pub fn finish_sweep(&self) {
        while self.sweep_one() {}
    }

    /// Carves a new span out of the page allocator.
    ///
    /// Small requests go through the caller's page cache when one is
    /// offered, refilling it from the global bitmaps only when it runs
    /// dry. `None` means the OS is out of memory.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        spanclass: SpanClass,
        pc: Option<&mut PageCache>,
    ) -> Option<SpanHandle> {
        let sg = self.sweepgen();
        let addr = match pc {
            Some(pc) if npages <= PAGE_CACHE_MAX_PAGES => {
                let (mut addr, mut reclaimed) = pc.alloc(npages);
                if addr == 0 && pc.is_empty() {
                    *pc = self.pages.alloc_to_cache()?;
                    (addr, reclaimed) = pc.alloc(npages);
                }
                if addr == 0 {
                    let (addr, _) = self.pages.alloc_pages(npages)?;
                    addr
                } else {
                    if reclaimed > 0 {
                        self.pages.commit(addr, npages * PAGE_SIZE)?;
                    }
                    addr
                }
            }
            _ => self.pages.alloc_pages(npages)?.0,
        };
        let handle = self
            .arena
            .insert_with(|id| Span::new(id, addr, npages, spanclass, sg));
        self.pages.record_span(&handle);
        tracing::trace!(
            base = addr,
            npages,
            span_class = spanclass.index(),
            "allocated span"
        );
        Some(handle)
    }

    /// Returns a fully free span's pages to the page allocator and
    /// retires its arena slot.
    pub(crate) fn free_span(&self, handle: &SpanHandle) {
        self.pages.clear_span(&handle.span);
        self.arena.remove(handle.id);
        self.pages.free_pages(handle.span.base(), handle.span.npages());
    }

    /// Resolves an address to the span whose pages contain it.
    #[must_use]
    pub fn span_at(&self, addr: usize) -> Option<Arc<Span>> {
        let id = self.pages.span_id_at(addr)?;
        self.arena.try_get(id)
    }

    /// Returns up to `max_bytes` of free memory to the OS.
    pub fn scavenge(&self, max_bytes: usize) -> usize {
        self.pages.scavenge(max_bytes)
    }

    /// Free pages in the global pool, cached windows excluded.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.pages.free_page_count()
    }

    /// Number of live spans.
    #[must_use]
    pub fn live_spans(&self) -> usize {
        self.arena.live_spans()
    }
}

thread_local! {
    static SYSTEM_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Runs `f` as runtime-internal work: allocator maintenance that must
/// not itself allocate through a context cache. Nestable; the flag is
/// restored on unwind.
pub fn run_on_system_context<R>(f: impl FnOnce() -> R) -> R {
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            SYSTEM_DEPTH.with(|d| d.set(d.get() - 1));
        }
    }
    SYSTEM_DEPTH.with(|d| d.set(d.get() + 1));
    let _guard = Guard;
    f()
}

/// Whether the current thread is inside [`run_on_system_context`].
#[must_use]
pub fn on_system_context() -> bool {
    SYSTEM_DEPTH.with(Cell::get) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_context_flag_nests_and_unwinds() {
        assert!(!on_system_context());
        run_on_system_context(|| {
            assert!(on_system_context());
            run_on_system_context(|| assert!(on_system_context()));
            assert!(on_system_context());
        });
        assert!(!on_system_context());

        let result = std::panic::catch_unwind(|| {
            run_on_system_context(|| panic!("boom"));
        });
        assert!(result.is_err());
        assert!(!on_system_context());
    }

    #[test]
    fn test_sweepgen_advances_by_two() {
        let heap = Heap::new(HeapConfig::default());
        assert_eq!(heap.sweepgen(), 2);
        heap.begin_sweep_cycle();
        assert_eq!(heap.sweepgen(), 4);
    }

    #[test]
    fn test_span_at_resolves_and_forgets() {
        let heap = Heap::new(HeapConfig::default());
        let spc = SpanClass::new(5, true);
        let handle = heap.alloc_span(1, spc, None).unwrap();
        let base = handle.span.base();
        let found = heap.span_at(base + 100).unwrap();
        assert_eq!(found.base(), base);
        heap.free_span(&handle);
        assert!(heap.span_at(base).is_none());
    }
}
