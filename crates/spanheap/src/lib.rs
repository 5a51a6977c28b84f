//! A three-tier span allocator for a tracing garbage collector.
//!
//! `spanheap` carves objects out of **spans** (page runs dedicated to a
//! single size class) through three tiers:
//!
//! - [`ContextCache`] — one per execution context; allocates with no
//!   locking from spans the context owns outright.
//! - Central free lists — one per span class; hand spans to contexts and
//!   take them back, sweeping lazily as they go.
//! - The global page allocator — chunked OS reservations handed out as
//!   page runs, with a per-context [`PageCache`] fast path.
//!
//! # Quick start
//!
//! ```
//! use spanheap::{Heap, HeapConfig};
//!
//! let heap = Heap::new(HeapConfig::default());
//! let mut ctx = heap.new_context();
//!
//! let p = ctx.allocate(48, true); // 48 bytes, pointer-free
//! assert_eq!(p.as_ptr() as usize % 8, 0);
//! ```
//!
//! # Collection protocol
//!
//! The collector drives the heap through sweep generations:
//!
//! 1. Mark live objects via [`Heap::span_at`] and [`Span::set_marked`].
//! 2. [`Heap::begin_sweep_cycle`] — every span becomes unswept.
//! 3. Each context calls [`ContextCache::prepare_for_sweep`] before its
//!    next allocation.
//! 4. [`Heap::sweep_one`] (incremental) or [`Heap::finish_sweep`]
//!    reclaim dead objects and return empty spans' pages.
//!
//! Allocation and sweeping interleave freely; a refill that meets an
//! unswept span sweeps it on the spot.
//!
//! # Error handling
//!
//! Running out of OS memory, corrupting an invariant, or breaking the
//! collection protocol all panic: this allocator sits under a managed
//! runtime, and there is no caller that could meaningfully recover.

#![warn(missing_docs)]

mod cache;
mod central;
mod controller;
mod heap;
mod pagecache;
mod pages;
mod sizeclass;
mod span;
mod spanset;
mod stats;
mod sweep;

pub use cache::ContextCache;
pub use controller::{HeapController, PacerStats};
pub use heap::{on_system_context, run_on_system_context, Heap, HeapConfig};
pub use pagecache::PageCache;
pub use sizeclass::{
    class_nelems, size_to_class, SizeClassSpec, SpanClass, MAX_SMALL_SIZE, NUM_SIZE_CLASSES,
    NUM_SPAN_CLASSES, PAGE_SHIFT, PAGE_SIZE, SIZE_CLASSES, TINY_MAX,
};
pub use span::{Span, SpanHandle, SpanId};
pub use stats::HeapStats;
