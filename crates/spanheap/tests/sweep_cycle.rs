//! Sweep generations: marks become the new allocation bitmap, dead
//! slots are reallocated, and empty spans give their pages back.

use std::collections::HashSet;

use spanheap::{Heap, HeapConfig};

#[test]
fn test_unmarked_slots_are_reallocated_after_sweep() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let addrs: Vec<usize> = (0..8)
        .map(|_| ctx.allocate(1024, false).as_ptr() as usize)
        .collect();

    // The collector keeps slots 0, 2, 4, 5, 7 alive.
    let live: HashSet<usize> = [0, 2, 4, 5, 7].into_iter().collect();
    let span = heap.span_at(addrs[0]).expect("span lookup failed");
    for &i in &live {
        let index = span.object_index(addrs[i]).unwrap();
        span.set_marked(index);
    }

    heap.begin_sweep_cycle();
    ctx.prepare_for_sweep();
    heap.finish_sweep();

    // Three dead slots; the next three allocations fill exactly them.
    let dead: HashSet<usize> = (0..8).filter(|i| !live.contains(i)).map(|i| addrs[i]).collect();
    let reused: HashSet<usize> = (0..3)
        .map(|_| ctx.allocate(1024, false).as_ptr() as usize)
        .collect();
    assert_eq!(reused, dead);
    assert_eq!(heap.live_spans(), 1);
}

#[test]
fn test_fully_dead_span_returns_its_pages() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    for _ in 0..8 {
        let _ = ctx.allocate(1024, false);
    }
    assert_eq!(heap.live_spans(), 1);
    drop(ctx); // releases the span and the page-cache window

    let free_before = heap.free_page_count();
    heap.begin_sweep_cycle();
    heap.finish_sweep();

    assert_eq!(heap.live_spans(), 0);
    assert_eq!(heap.free_page_count(), free_before + 1);
}

#[test]
fn test_surviving_objects_are_never_reallocated() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let survivor = ctx.allocate(1024, false).as_ptr() as usize;
    let span = heap.span_at(survivor).unwrap();
    span.set_marked(span.object_index(survivor).unwrap());

    for _ in 0..3 {
        heap.begin_sweep_cycle();
        ctx.prepare_for_sweep();
        heap.finish_sweep();
        // Re-mark each cycle, as a real collector would.
        let span = heap.span_at(survivor).unwrap();
        span.set_marked(span.object_index(survivor).unwrap());
    }

    for _ in 0..32 {
        assert_ne!(ctx.allocate(1024, false).as_ptr() as usize, survivor);
    }
}

#[test]
fn test_sweep_one_reports_progress() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    // Two spans in two different classes, both released.
    let _ = ctx.allocate(1024, false);
    let _ = ctx.allocate(256, false);
    ctx.release_all();

    heap.begin_sweep_cycle();
    ctx.prepare_for_sweep();
    assert!(heap.sweep_one());
    assert!(heap.sweep_one());
    assert!(!heap.sweep_one());
}
