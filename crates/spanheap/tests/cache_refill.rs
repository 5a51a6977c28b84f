//! Context-cache refill behavior: spans fill up, refills pull
//! replacements, and exhausted classes grow new spans.

use spanheap::{class_nelems, size_to_class, Heap, HeapConfig, PAGE_SIZE};

#[test]
fn test_span_fills_then_refills() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    // The 1024-byte class packs 8 objects per one-page span.
    let class = size_to_class(1024);
    let nelems = class_nelems(class);
    assert_eq!(nelems, 8);

    let addrs: Vec<usize> = (0..nelems)
        .map(|_| ctx.allocate(1024, false).as_ptr() as usize)
        .collect();

    // All eight come from the same span, bump-style.
    let base = addrs[0];
    for (i, addr) in addrs.iter().enumerate() {
        assert_eq!(*addr, base + i * 1024);
    }
    assert_eq!(heap.live_spans(), 1);

    // The ninth forces a refill; with nothing to sweep, the central
    // list grows a second span.
    let ninth = ctx.allocate(1024, false).as_ptr() as usize;
    assert!(!(base..base + PAGE_SIZE).contains(&ninth));
    assert_eq!(heap.live_spans(), 2);
}

#[test]
fn test_small_class_span_hands_out_every_slot() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    // 48-byte spans hold 170 objects, spanning three bitmap words;
    // allocation must keep serving the same span past slot 63 and 127.
    let nelems = class_nelems(size_to_class(48));
    assert_eq!(nelems, 170);

    let addrs: Vec<usize> = (0..nelems)
        .map(|_| ctx.allocate(48, false).as_ptr() as usize)
        .collect();
    assert_eq!(heap.live_spans(), 1);
    let base = addrs[0];
    for (i, addr) in addrs.iter().enumerate() {
        assert_eq!(*addr, base + i * 48);
    }

    // Only now is the span exhausted.
    let next = ctx.allocate(48, false).as_ptr() as usize;
    assert!(!(base..base + PAGE_SIZE).contains(&next));
    assert_eq!(heap.live_spans(), 2);
}

#[test]
fn test_classes_do_not_share_spans() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let a = ctx.allocate(32, false).as_ptr() as usize;
    let b = ctx.allocate(1024, false).as_ptr() as usize;
    let c = ctx.allocate(32, false).as_ptr() as usize;

    // Same class resumes its span; the other class got its own.
    assert_eq!(c, a + 32);
    assert!(b.abs_diff(a) >= PAGE_SIZE);
}

#[test]
fn test_scan_and_noscan_spans_are_separate() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let scan = ctx.allocate(256, false).as_ptr() as usize;
    let noscan = ctx.allocate(256, true).as_ptr() as usize;
    assert!(scan.abs_diff(noscan) >= PAGE_SIZE);
    assert_eq!(heap.live_spans(), 2);
}

#[test]
fn test_many_allocations_stay_disjoint() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let mut addrs: Vec<usize> = (0..1000)
        .map(|_| ctx.allocate(48, false).as_ptr() as usize)
        .collect();
    addrs.sort_unstable();
    for w in addrs.windows(2) {
        assert!(w[1] - w[0] >= 48, "objects overlap");
    }
}
