//! Central free lists, one per span class.
//!
//! A central list does not hold free objects itself; the spans do. Each
//! list is two pairs of span sets — `partial` (spans with a free slot)
//! and `full` (spans with none) — with the pair member selected by sweep
//! generation parity (`g/2 % 2`). The swept and unswept halves trade
//! roles each collection cycle, so two slots per set suffice.

use crate::heap::Heap;
use crate::pagecache::PageCache;
use crate::sizeclass::{SpanClass, SIZE_CLASSES};
use crate::span::SpanHandle;
use crate::spanset::SpanSet;
use crate::sweep;

/// Central list of spans for one span class, mediating between context
/// caches and the global page allocator.
pub(crate) struct CentralFreeList {
    spanclass: SpanClass,
    /// Spans with at least one free slot, split by generation parity.
    partial: [SpanSet; 2],
    /// Spans with no free slots, split by generation parity.
    full: [SpanSet; 2],
}

impl CentralFreeList {
    pub fn new(spanclass: SpanClass) -> Self {
        Self {
            spanclass,
            partial: [SpanSet::new(), SpanSet::new()],
            full: [SpanSet::new(), SpanSet::new()],
        }
    }

    /// Swept spans with free slots for this generation.
    pub fn partial_swept(&self, sweepgen: u32) -> &SpanSet {
        &self.partial[(sweepgen / 2 % 2) as usize]
    }

    /// Unswept spans with free slots for this generation.
    pub fn partial_unswept(&self, sweepgen: u32) -> &SpanSet {
        &self.partial[(1 - sweepgen / 2 % 2) as usize]
    }

    /// Swept spans without free slots for this generation.
    pub fn full_swept(&self, sweepgen: u32) -> &SpanSet {
        &self.full[(sweepgen / 2 % 2) as usize]
    }

    /// Unswept spans without free slots for this generation.
    pub fn full_unswept(&self, sweepgen: u32) -> &SpanSet {
        &self.full[(1 - sweepgen / 2 % 2) as usize]
    }

    /// Serves a span with at least one free slot to a context cache.
    ///
    /// Priority order: swept-partial pop; unswept-partial pop under the
    /// optimistic sweep claim; unswept-full under the same protocol,
    /// filing still-full spans with the swept set; finally [`grow`].
    /// The unswept scans share one budget (`HeapConfig::sweep_budget`)
    /// to cap worst-case latency.
    ///
    /// Returns `None` only when the page allocator itself is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if a served span turns out to have no free slots, which
    /// means free-slot accounting was corrupted upstream.
    ///
    /// [`grow`]: Self::grow
    pub fn cache_span(&self, heap: &Heap, pc: Option<&mut PageCache>) -> Option<SpanHandle> {
        let sg = heap.sweepgen();
        let mut budget = i64::from(heap.config().sweep_budget);

        let mut handle = self.partial_swept(sg).pop().map(|id| SpanHandle {
            id,
            span: heap.arena().get(id),
        });

        if handle.is_none() {
            while budget >= 0 {
                let Some(id) = self.partial_unswept(sg).pop() else {
                    break;
                };
                budget -= 1;
                let candidate = SpanHandle {
                    id,
                    span: heap.arena().get(id),
                };
                if candidate.span.try_claim_sweep(sg) {
                    sweep::sweep_span(heap, &candidate, true);
                    handle = Some(candidate);
                    break;
                }
                // A concurrent sweeper won the claim; it owns the span
                // now and will file it. Move on.
            }
        }

        if handle.is_none() {
            while budget >= 0 {
                let Some(id) = self.full_unswept(sg).pop() else {
                    break;
                };
                budget -= 1;
                let candidate = SpanHandle {
                    id,
                    span: heap.arena().get(id),
                };
                if candidate.span.try_claim_sweep(sg) {
                    sweep::sweep_span(heap, &candidate, true);
                    // SAFETY: we hold the span via the sweep claim.
                    let alloc_count = unsafe { candidate.span.book() }.alloc_count;
                    if alloc_count < candidate.span.nelems() {
                        handle = Some(candidate);
                        break;
                    }
                    // Sweeping freed nothing; file it as swept-full.
                    self.full_swept(sg).push(id);
                }
            }
        }

        let handle = match handle {
            Some(handle) => handle,
            None => {
                tracing::trace!(
                    span_class = self.spanclass.index(),
                    "central list exhausted; growing"
                );
                self.grow(heap, pc)?
            }
        };

        // SAFETY: the span is exclusively ours until the caller caches it.
        let book = unsafe { handle.span.book_mut() };
        assert!(
            book.alloc_count < handle.span.nelems() && book.freeindex < handle.span.nelems(),
            "span has no free objects"
        );
        // Prime the bitmap cursor so bit 0 lines up with freeindex.
        book.refill_cache_at_freeindex(handle.span.nelems());
        Some(handle)
    }

    /// Takes back a span a context cache is done with.
    ///
    /// Spans cached before the current sweep phase began are stale: no
    /// concurrent sweeper can see them, so they are swept synchronously
    /// here. Fresh spans are tagged swept and filed by fullness.
    ///
    /// # Panics
    ///
    /// Panics when the span has no allocations — a fully free span must
    /// never have been cached, so this is a bookkeeping bug upstream.
    pub fn uncache_span(&self, heap: &Heap, handle: SpanHandle) {
        let sg = heap.sweepgen();
        let span = &handle.span;
        // SAFETY: the uncaching cache is the owner until we file the span.
        let alloc_count = unsafe { span.book() }.alloc_count;
        assert!(alloc_count != 0, "uncaching span with no allocations");

        let stale = span.sweepgen() == sg.wrapping_add(1);
        if stale {
            // Our responsibility to sweep: the span predates this sweep
            // phase and is invisible to the background sweeper.
            span.set_sweepgen(sg.wrapping_sub(1));
            sweep::sweep_span(heap, &handle, false);
        } else {
            span.set_sweepgen(sg);
            if alloc_count < span.nelems() {
                self.partial_swept(sg).push(handle.id);
            } else {
                self.full_swept(sg).push(handle.id);
            }
        }
    }

    /// Allocates a brand-new span for this class from the page
    /// allocator. `None` propagates exhaustion; the caller decides
    /// whether that is fatal.
    fn grow(&self, heap: &Heap, pc: Option<&mut PageCache>) -> Option<SpanHandle> {
        let spec = SIZE_CLASSES[self.spanclass.size_class()];
        heap.alloc_span(spec.pages, self.spanclass, pc)
    }
}
