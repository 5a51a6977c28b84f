//! Controller and stats accounting across the allocate/release/sweep
//! life cycle.

use std::sync::Arc;

use spanheap::{Heap, HeapConfig, PacerStats, PAGE_SIZE};

#[test]
fn test_live_bytes_settle_after_release() {
    let pacer = Arc::new(PacerStats::new());
    let heap = Heap::with_controller(HeapConfig::default(), pacer.clone());
    let mut ctx = heap.new_context();

    let _ = ctx.allocate(1024, false);
    // While cached, the whole span is counted live (overshoot).
    assert_eq!(pacer.live_bytes(), PAGE_SIZE as i64);

    ctx.release_all();
    assert_eq!(pacer.live_bytes(), 1024);
    assert_eq!(pacer.scan_live_bytes(), 1024);
    assert_eq!(pacer.alloc_bytes(), 1024);
}

#[test]
fn test_sweep_subtracts_freed_bytes() {
    let pacer = Arc::new(PacerStats::new());
    let heap = Heap::with_controller(HeapConfig::default(), pacer.clone());
    let mut ctx = heap.new_context();

    let _ = ctx.allocate(1024, false);
    drop(ctx);

    heap.begin_sweep_cycle();
    heap.finish_sweep();
    assert_eq!(pacer.live_bytes(), 0);
    assert_eq!(pacer.scan_live_bytes(), 0);
}

#[test]
fn test_noscan_does_not_count_as_scannable() {
    let pacer = Arc::new(PacerStats::new());
    let heap = Heap::with_controller(HeapConfig::default(), pacer.clone());
    let mut ctx = heap.new_context();

    let _ = ctx.allocate(512, true);
    ctx.release_all();
    assert_eq!(pacer.alloc_bytes(), 512);
    assert_eq!(pacer.scan_live_bytes(), 0);
}

#[test]
fn test_heap_stats_roll_up_per_class() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    for _ in 0..5 {
        let _ = ctx.allocate(1024, false); // class slots
    }
    for _ in 0..3 {
        let _ = ctx.allocate(4, true); // tiny
    }
    let _ = ctx.allocate(PAGE_SIZE * 9, true); // large
    ctx.release_all();

    let stats = heap.stats();
    assert_eq!(stats.small_alloc_count(spanheap::size_to_class(1024)), 5);
    assert_eq!(stats.tiny_alloc_count(), 3);
    assert_eq!(stats.large_alloc_count(), 1);
    assert_eq!(stats.large_alloc_bytes(), (PAGE_SIZE * 9) as u64);
}

#[test]
fn test_large_allocation_accounting() {
    let pacer = Arc::new(PacerStats::new());
    let heap = Heap::with_controller(HeapConfig::default(), pacer.clone());
    let mut ctx = heap.new_context();

    // Above the largest size class: takes the dedicated-span path.
    let size = 6 * PAGE_SIZE;
    let bytes = size as i64;
    let _ = ctx.allocate(size, false);
    assert_eq!(pacer.live_bytes(), bytes);
    assert_eq!(pacer.scan_live_bytes(), bytes);
    assert_eq!(pacer.alloc_bytes(), bytes as u64);
    assert_eq!(pacer.scan_alloc_bytes(), bytes as u64);

    // Unmarked, the object dies with the cycle; both estimates must
    // settle back to zero.
    drop(ctx);
    heap.begin_sweep_cycle();
    heap.finish_sweep();
    assert_eq!(pacer.live_bytes(), 0);
    assert_eq!(pacer.scan_live_bytes(), 0);
}
