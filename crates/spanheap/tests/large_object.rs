//! Large objects get dedicated single-object spans and die through the
//! ordinary sweep.

use spanheap::{Heap, HeapConfig, MAX_SMALL_SIZE, PAGE_SIZE};

#[test]
fn test_large_object_gets_a_dedicated_span() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let size = MAX_SMALL_SIZE + 1;
    let addr = ctx.allocate(size, true).as_ptr() as usize;

    let span = heap.span_at(addr).expect("large span not recorded");
    assert_eq!(span.base(), addr);
    assert_eq!(span.nelems(), 1);
    assert_eq!(span.npages(), size.div_ceil(PAGE_SIZE));
    assert_eq!(span.elem_size(), span.npages() * PAGE_SIZE);
    assert_eq!(heap.stats().large_alloc_count(), 1);
}

#[test]
fn test_interior_pointers_resolve_to_the_large_span() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let addr = ctx.allocate(5 * PAGE_SIZE, true).as_ptr() as usize;
    let span = heap.span_at(addr + 3 * PAGE_SIZE + 17).expect("interior lookup failed");
    assert_eq!(span.base(), addr);
    assert_eq!(span.object_index(addr + 3 * PAGE_SIZE + 17), Some(0));
}

#[test]
fn test_dead_large_object_frees_its_pages() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let npages = 6;
    let _ = ctx.allocate(npages * PAGE_SIZE, true);
    let spans_before = heap.live_spans();

    // Not marked: the whole span dies with the cycle.
    heap.begin_sweep_cycle();
    ctx.prepare_for_sweep();
    let free_before = heap.free_page_count();
    heap.finish_sweep();

    assert_eq!(heap.live_spans(), spans_before - 1);
    assert_eq!(heap.free_page_count(), free_before + npages);
}

#[test]
fn test_marked_large_object_survives() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    let addr = ctx.allocate(3 * PAGE_SIZE, true).as_ptr() as usize;
    let span = heap.span_at(addr).unwrap();
    span.set_marked(0);

    heap.begin_sweep_cycle();
    ctx.prepare_for_sweep();
    heap.finish_sweep();

    let span = heap.span_at(addr).expect("marked large object was freed");
    assert_eq!(span.base(), addr);
}

#[test]
fn test_huge_object_beyond_one_chunk() {
    let heap = Heap::new(HeapConfig::default());
    let mut ctx = heap.new_context();

    // Larger than a 512-page chunk: served by a dedicated reservation.
    let npages = 600;
    let addr = ctx.allocate(npages * PAGE_SIZE, true).as_ptr() as usize;
    let span = heap.span_at(addr).unwrap();
    assert_eq!(span.npages(), npages);

    heap.begin_sweep_cycle();
    ctx.prepare_for_sweep();
    let free_before = heap.free_page_count();
    heap.finish_sweep();
    assert_eq!(heap.free_page_count(), free_before + npages);
}
