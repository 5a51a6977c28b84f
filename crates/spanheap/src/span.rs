//! Spans and the span arena.
//!
//! A span is a contiguous run of pages dedicated to a single size class
//! (or one large object). Spans live in a slab arena and are referred to
//! by [`SpanId`] handles; ownership transfers between a context cache, a
//! central free list set, and the page allocator are the core
//! synchronization events of the allocator, mediated by the atomic
//! sweep-state tag (see [`crate::sweep`]).
//!
//! Span state is split three ways:
//! - geometry (base, pages, class, element size/count): immutable after
//!   creation, readable from any thread;
//! - the mark bitmap: written by the collector at any time, atomic;
//! - bookkeeping (allocation count, free cursor, alloc bitmap): owned by
//!   exactly one party at a time, behind an `UnsafeCell`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::sizeclass::{SpanClass, LARGE_SIZE_CLASS, PAGE_SIZE, SIZE_CLASSES};

/// Handle to a span slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u32);

impl SpanId {
    pub(crate) const fn to_raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// A span id paired with its arena entry.
///
/// This is the currency passed between the allocator tiers: popping a
/// handle from a set, claiming it for sweeping, or caching it in a
/// context all confer exclusive ownership of the span's bookkeeping.
#[derive(Clone)]
pub struct SpanHandle {
    /// Arena handle, used to push the span back into a set.
    pub id: SpanId,
    /// The span itself.
    pub span: Arc<Span>,
}

/// Owner-only span bookkeeping.
///
/// Mutated without synchronization; the sweep-state tag and the set
/// push/pop protocol guarantee a single owner at any time.
pub(crate) struct SpanBook {
    /// Number of allocated slots. Invariant: `alloc_count <= nelems`.
    pub alloc_count: u32,
    /// `alloc_count` snapshot taken when the span was cached.
    pub alloc_count_before_cache: u32,
    /// Slot index below which every slot is accounted as allocated.
    /// Invariant: `freeindex <= nelems`.
    pub freeindex: u32,
    /// Cache of inverted alloc bits; bit 0 corresponds to `freeindex`.
    pub alloc_cache: u64,
    /// One bit per slot; 1 means allocated as of the last sweep.
    pub alloc_bits: Box<[u64]>,
}

impl SpanBook {
    /// Re-primes `alloc_cache` so bit 0 corresponds to `freeindex`.
    pub fn refill_cache_at_freeindex(&mut self, nelems: u32) {
        if self.freeindex >= nelems {
            self.alloc_cache = 0;
            return;
        }
        let word = (self.freeindex / 64) as usize;
        self.alloc_cache = !self.alloc_bits[word] >> (self.freeindex % 64);
    }

    /// Finds the next free slot at or after `freeindex`, advancing the
    /// cursor past it. Returns `nelems` when the span is exhausted.
    pub fn next_free_index(&mut self, nelems: u32) -> u32 {
        if self.freeindex == nelems {
            return nelems;
        }
        let mut fi = self.freeindex;
        let mut cache = self.alloc_cache;
        while cache == 0 {
            // Current word exhausted; jump to the next word boundary.
            fi = (fi + 64) & !63;
            if fi >= nelems {
                self.freeindex = nelems;
                return nelems;
            }
            self.alloc_cache = !self.alloc_bits[(fi / 64) as usize];
            cache = self.alloc_cache;
        }
        let shift = cache.trailing_zeros();
        let result = fi + shift;
        if result >= nelems {
            self.freeindex = nelems;
            return nelems;
        }
        // Consume the found bit; two shifts so shift+1 == 64 is fine.
        self.alloc_cache = (cache >> shift) >> 1;
        self.freeindex = result + 1;
        if self.freeindex % 64 == 0 && self.freeindex != nelems {
            // Crossed into the next word; the cache must always cover
            // the word containing freeindex.
            self.alloc_cache = !self.alloc_bits[(self.freeindex / 64) as usize];
        }
        result
    }
}

/// A contiguous run of pages serving one size class or one large object.
pub struct Span {
    id: SpanId,
    base: usize,
    npages: usize,
    spanclass: SpanClass,
    elem_size: usize,
    nelems: u32,
    /// Sweep-state tag; see [`crate::sweep`] for the encoding.
    sweepgen: AtomicU32,
    /// Mark bitmap, written by the collector between mark and sweep.
    marks: Box<[AtomicU64]>,
    book: UnsafeCell<SpanBook>,
}

// SAFETY: geometry is immutable, `sweepgen` and `marks` are atomic, and
// `book` is only touched by the span's single current owner.
unsafe impl Send for Span {}
unsafe impl Sync for Span {}

impl Span {
    /// Builds a span over `[base, base + npages * PAGE_SIZE)` for the
    /// given class, tagged swept for generation `sweepgen`.
    pub(crate) fn new(
        id: SpanId,
        base: usize,
        npages: usize,
        spanclass: SpanClass,
        sweepgen: u32,
    ) -> Self {
        let (elem_size, nelems) = if spanclass.size_class() == LARGE_SIZE_CLASS {
            (npages * PAGE_SIZE, 1)
        } else {
            let spec = SIZE_CLASSES[spanclass.size_class()];
            (spec.size, (npages * PAGE_SIZE / spec.size) as u32)
        };
        let words = (nelems as usize).div_ceil(64);
        Self {
            id,
            base,
            npages,
            spanclass,
            elem_size,
            nelems,
            sweepgen: AtomicU32::new(sweepgen),
            marks: (0..words).map(|_| AtomicU64::new(0)).collect(),
            book: UnsafeCell::new(SpanBook {
                alloc_count: 0,
                alloc_count_before_cache: 0,
                freeindex: 0,
                alloc_cache: u64::MAX,
                alloc_bits: vec![0u64; words].into_boxed_slice(),
            }),
        }
    }

    /// Arena handle of this span.
    #[must_use]
    pub const fn id(&self) -> SpanId {
        self.id
    }

    /// Base address.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Pages covered by this span.
    #[must_use]
    pub const fn npages(&self) -> usize {
        self.npages
    }

    /// The span class this span serves.
    #[must_use]
    pub const fn span_class(&self) -> SpanClass {
        self.spanclass
    }

    /// Element size in bytes (the full span for large objects).
    #[must_use]
    pub const fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of object slots.
    #[must_use]
    pub const fn nelems(&self) -> u32 {
        self.nelems
    }

    /// Current sweep-state tag.
    #[must_use]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub(crate) fn set_sweepgen(&self, sweepgen: u32) {
        self.sweepgen.store(sweepgen, Ordering::Release);
    }

    /// Optimistic single-writer sweep claim: transitions the state tag
    /// from unswept (`g-2`) to being-swept (`g-1`). Failure means a
    /// concurrent sweeper owns the span; the caller must skip it.
    pub(crate) fn try_claim_sweep(&self, sweepgen: u32) -> bool {
        self.sweepgen
            .compare_exchange(
                sweepgen.wrapping_sub(2),
                sweepgen.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks the object at `index` live. Called by the collector; safe
    /// to race with the owner's bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics when `index` is out of bounds, which indicates a corrupt
    /// pointer on the collector side.
    pub fn set_marked(&self, index: usize) {
        assert!(
            index < self.nelems as usize,
            "mark index {index} out of bounds for span with {} elems",
            self.nelems
        );
        self.marks[index / 64].fetch_or(1 << (index % 64), Ordering::Relaxed);
    }

    /// Whether the object at `index` is currently marked.
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        index < self.nelems as usize
            && self.marks[index / 64].load(Ordering::Relaxed) >> (index % 64) & 1 == 1
    }

    /// Number of marked objects.
    #[must_use]
    pub fn count_marks(&self) -> u32 {
        self.marks
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum()
    }

    /// Adopts the mark bitmap as the new alloc bitmap and clears the
    /// marks, returning the number of live slots. Sweep-owner only.
    pub(crate) fn adopt_marks(&self, book: &mut SpanBook) -> u32 {
        let mut live = 0;
        for (word, mark) in book.alloc_bits.iter_mut().zip(self.marks.iter()) {
            let m = mark.swap(0, Ordering::Relaxed);
            *word = m;
            live += m.count_ones();
        }
        live
    }

    /// Returns the slot index containing `addr`, if it lies in this span.
    #[must_use]
    pub fn object_index(&self, addr: usize) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.npages * PAGE_SIZE {
            return None;
        }
        let index = (addr - self.base) / self.elem_size;
        (index < self.nelems as usize).then_some(index)
    }

    /// Address of the slot at `index`.
    #[must_use]
    pub fn object_addr(&self, index: usize) -> usize {
        self.base + index * self.elem_size
    }

    /// Shared view of the bookkeeping.
    ///
    /// # Safety
    ///
    /// The caller must be the span's exclusive owner, or otherwise know
    /// that no owner is mutating the bookkeeping concurrently.
    pub(crate) unsafe fn book(&self) -> &SpanBook {
        // SAFETY: per the function contract.
        unsafe { &*self.book.get() }
    }

    /// Mutable view of the bookkeeping.
    ///
    /// # Safety
    ///
    /// The caller must be the span's exclusive owner, and must not hold
    /// another reference obtained from this cell.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn book_mut(&self) -> &mut SpanBook {
        // SAFETY: per the function contract.
        unsafe { &mut *self.book.get() }
    }
}

/// Slab arena of spans, referenced by [`SpanId`] handles.
///
/// Slots are recycled through a free list; every insert produces a fresh
/// `Arc<Span>`, so a stale handle can never observe a recycled span's
/// bookkeeping through an old reference.
pub(crate) struct SpanArena {
    slots: RwLock<Vec<Option<Arc<Span>>>>,
    free_ids: Mutex<Vec<u32>>,
}

impl SpanArena {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free_ids: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a span built from its assigned handle.
    pub fn insert_with(&self, build: impl FnOnce(SpanId) -> Span) -> SpanHandle {
        let recycled = self.free_ids.lock().pop();
        if let Some(raw) = recycled {
            let span = Arc::new(build(SpanId(raw)));
            self.slots.write()[raw as usize] = Some(span.clone());
            return SpanHandle {
                id: SpanId(raw),
                span,
            };
        }
        let mut slots = self.slots.write();
        let raw = u32::try_from(slots.len()).expect("span arena exhausted");
        let span = Arc::new(build(SpanId(raw)));
        slots.push(Some(span.clone()));
        SpanHandle {
            id: SpanId(raw),
            span,
        }
    }

    /// Resolves a handle.
    ///
    /// # Panics
    ///
    /// Panics on a vacant slot: a set or cache held a handle to a span
    /// that was freed, which is an ownership-protocol violation.
    pub fn get(&self, id: SpanId) -> Arc<Span> {
        self.slots.read()[id.0 as usize]
            .clone()
            .unwrap_or_else(|| panic!("vacant span handle {id:?}"))
    }

    /// Resolves a handle that may race with span removal, as address
    /// lookups do.
    pub fn try_get(&self, id: SpanId) -> Option<Arc<Span>> {
        self.slots.read().get(id.0 as usize)?.clone()
    }

    /// Removes a span, recycling its slot.
    pub fn remove(&self, id: SpanId) {
        let prev = self.slots.write()[id.0 as usize].take();
        assert!(prev.is_some(), "double free of span handle {id:?}");
        self.free_ids.lock().push(id.0);
    }

    /// Number of live spans, for monitoring and tests.
    pub fn live_spans(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }
}
