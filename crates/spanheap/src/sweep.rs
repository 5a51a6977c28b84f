//! Lazy, generation-based span sweeping.
//!
//! The heap carries a process-wide even sweep generation `g`, advanced
//! by 2 at the start of each collection cycle. A span's atomic state tag
//! encodes its sweep state relative to `g`:
//!
//! - `g`:   swept, uncached, usable;
//! - `g-2`: unswept, owned by nobody until claimed;
//! - `g-1`: claimed, being swept right now;
//! - `g+1`: cached before this cycle began (stale on uncaching);
//! - `g+3`: cached during this cycle; sweepers must not touch it.
//!
//! The sweep-ownership claim is a single compare-and-swap on the tag
//! ([`Span::try_claim_sweep`]); losing the race is benign contention,
//! not an error — the winner owns the span and will file it correctly.

use crate::heap::Heap;
use crate::span::SpanHandle;

/// Sweeps a claimed span: adopts the collector's mark bitmap as the new
/// allocation bitmap, resets the free cursor, and reports freed bytes to
/// the heap controller.
///
/// The caller must hold the sweep claim (state tag `g-1`), either from
/// [`Span::try_claim_sweep`] or from the stale-uncache path where no
/// concurrent sweeper can see the span.
///
/// With `preserve` the caller keeps ownership and the span is not filed
/// into any set. Otherwise the span is pushed to the appropriate swept
/// set, or — when sweeping leaves no live objects, dead large objects
/// included — its pages are returned to the page allocator. Returns
/// `true` in that last case.
///
/// # Panics
///
/// Panics when the span was not claimed, and when the mark bitmap shows
/// more live objects than were ever allocated; both indicate corruption
/// the allocator cannot recover from.
///
/// [`Span::try_claim_sweep`]: crate::span::Span
pub(crate) fn sweep_span(heap: &Heap, handle: &SpanHandle, preserve: bool) -> bool {
    let sg = heap.sweepgen();
    let span = &handle.span;
    assert_eq!(
        span.sweepgen(),
        sg.wrapping_sub(1),
        "sweeping a span without having claimed it"
    );

    // SAFETY: the sweep claim makes us the exclusive owner.
    let book = unsafe { span.book_mut() };

    let live = span.adopt_marks(book);
    assert!(
        live <= book.alloc_count,
        "sweep increased allocation count ({} -> {live})",
        book.alloc_count
    );
    let freed = book.alloc_count - live;
    book.alloc_count = live;
    book.freeindex = 0;
    book.refill_cache_at_freeindex(span.nelems());

    if freed > 0 {
        let bytes = u64::from(freed) * span.elem_size() as u64;
        let scan_delta = if span.span_class().is_noscan() {
            0
        } else {
            -(bytes as i64)
        };
        heap.controller().update_live(-(bytes as i64), scan_delta);
    }

    span.set_sweepgen(sg);

    if preserve {
        // Caller keeps the span; it never touches the swept sets.
        return false;
    }
    if book.alloc_count == 0 {
        tracing::trace!(
            base = span.base(),
            npages = span.npages(),
            "span fully free after sweep; returning pages"
        );
        heap.free_span(handle);
        return true;
    }
    let central = heap.central(span.span_class());
    if book.alloc_count < span.nelems() {
        central.partial_swept(sg).push(handle.id);
    } else {
        central.full_swept(sg).push(handle.id);
    }
    false
}
