//! Global page allocator.
//!
//! Address space is reserved from the OS in chunks of [`CHUNK_PAGES`]
//! pages and handed out as page runs through free/reclaimed bitmaps,
//! first-fit from a roving cursor. Requests larger than a chunk get a
//! dedicated reservation whose pages fold back into the general pool
//! when the owning span dies; the scavenger returns the memory itself.
//!
//! Lock order is `state` before `chunks`. The bitmaps live under the
//! `state` mutex; the chunk list (reservations plus the per-page span
//! map) is behind an `RwLock` so address lookups never contend with
//! allocation.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sys_pages::Reservation;

use crate::pagecache::{PageCache, PAGE_CACHE_PAGES};
use crate::sizeclass::PAGE_SIZE;
use crate::span::{Span, SpanHandle, SpanId};

/// Pages per address-space chunk.
pub(crate) const CHUNK_PAGES: usize = 512;

/// One OS reservation plus the per-page span map.
struct Chunk {
    base: usize,
    npages: usize,
    mapping: Reservation,
    /// Raw span id + 1 for each page; 0 means no span.
    span_map: Box<[AtomicU32]>,
}

impl Chunk {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.npages * PAGE_SIZE
    }

    fn page_of(&self, addr: usize) -> usize {
        (addr - self.base) / PAGE_SIZE
    }

    fn mapping_offset(&self, addr: usize) -> usize {
        addr - self.mapping.ptr() as usize
    }
}

/// Free/reclaimed bitmaps for one chunk. `base` and `npages` duplicate
/// the chunk's so bitmap operations never need the chunk list lock.
struct ChunkBits {
    base: usize,
    npages: usize,
    /// Free pages in this chunk; lets scans skip exhausted chunks.
    nfree: usize,
    /// 1 = free.
    free: Vec<u64>,
    /// 1 = returned to the OS; meaningful only while the page is free.
    scav: Vec<u64>,
}

impl ChunkBits {
    fn new_free(base: usize, npages: usize) -> Self {
        let words = npages.div_ceil(64);
        let mut free = vec![u64::MAX; words];
        if npages % 64 != 0 {
            // Bits past the end of the chunk must never look free.
            free[words - 1] = (1u64 << (npages % 64)) - 1;
        }
        Self {
            base,
            npages,
            nfree: npages,
            free,
            scav: vec![0; words],
        }
    }

    fn new_allocated(base: usize, npages: usize) -> Self {
        let words = npages.div_ceil(64);
        Self {
            base,
            npages,
            nfree: 0,
            free: vec![0; words],
            scav: vec![0; words],
        }
    }

    fn is_free(&self, page: usize) -> bool {
        self.free[page / 64] >> (page % 64) & 1 == 1
    }

    fn is_reclaimed(&self, page: usize) -> bool {
        self.scav[page / 64] >> (page % 64) & 1 == 1
    }

    /// First-fit search for `n` contiguous free pages at or after
    /// `start`. No wraparound; the caller handles chunk rotation.
    fn find_run(&self, start: usize, n: usize) -> Option<usize> {
        let mut page = start;
        let mut run = 0;
        while page < self.npages {
            // Skip whole allocated words when not mid-run.
            if run == 0 && page % 64 == 0 && self.free[page / 64] == 0 {
                page += 64;
                continue;
            }
            if self.is_free(page) {
                run += 1;
                if run == n {
                    return Some(page + 1 - n);
                }
            } else {
                run = 0;
            }
            page += 1;
        }
        None
    }

    /// Marks `[start, start + n)` allocated, returning how many of the
    /// pages had been returned to the OS.
    fn allocate_range(&mut self, start: usize, n: usize) -> usize {
        let mut reclaimed = 0;
        for page in start..start + n {
            debug_assert!(self.is_free(page), "allocating a page already in use");
            self.free[page / 64] &= !(1 << (page % 64));
            if self.is_reclaimed(page) {
                self.scav[page / 64] &= !(1 << (page % 64));
                reclaimed += 1;
            }
        }
        self.nfree -= n;
        reclaimed
    }

    fn free_range(&mut self, start: usize, n: usize) {
        for page in start..start + n {
            debug_assert!(!self.is_free(page), "freeing a page twice");
            self.free[page / 64] |= 1 << (page % 64);
        }
        self.nfree += n;
    }
}

struct PageState {
    bits: Vec<ChunkBits>,
    /// (chunk, page) scan hint; purely an optimization, searches wrap.
    cursor: (usize, usize),
    free_pages: usize,
}

/// The bottom allocator tier: page runs out of OS reservations.
pub(crate) struct PageAllocator {
    state: Mutex<PageState>,
    chunks: RwLock<Vec<Arc<Chunk>>>,
}

impl PageAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PageState {
                bits: Vec::new(),
                cursor: (0, 0),
                free_pages: 0,
            }),
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Allocates `npages` contiguous pages, growing the reservation when
    /// the pool is exhausted. Returns the base address and the number of
    /// previously reclaimed bytes in the run (already committed again by
    /// the time this returns).
    ///
    /// `None` means the OS refused more memory; the caller decides how
    /// fatal that is.
    pub fn alloc_pages(&self, npages: usize) -> Option<(usize, usize)> {
        assert!(npages > 0, "zero-page allocation");
        if npages > CHUNK_PAGES {
            return self.alloc_huge(npages);
        }
        let (addr, reclaimed_bytes) = {
            let mut state = self.state.lock();
            match Self::find_and_allocate(&mut state, npages) {
                Some(found) => found,
                None => {
                    self.grow(&mut state)?;
                    Self::find_and_allocate(&mut state, npages)?
                }
            }
        };
        if reclaimed_bytes > 0 && self.commit(addr, npages * PAGE_SIZE).is_none() {
            return None;
        }
        Some((addr, reclaimed_bytes))
    }

    /// Fills a context's page cache with one 64-page-aligned bitmap
    /// word's worth of free pages, however many that word holds.
    pub fn alloc_to_cache(&self) -> Option<PageCache> {
        let mut state = self.state.lock();
        if let Some(pc) = Self::fill_cache(&mut state) {
            return Some(pc);
        }
        self.grow(&mut state)?;
        Self::fill_cache(&mut state)
    }

    fn fill_cache(state: &mut PageState) -> Option<PageCache> {
        let nchunks = state.bits.len();
        if nchunks == 0 {
            return None;
        }
        let (start_chunk, start_page) = state.cursor;
        // One extra lap so the cursor chunk's head is scanned too.
        for step in 0..=nchunks {
            let ci = (start_chunk + step) % nchunks;
            let from = if step == 0 { start_page.min(state.bits[ci].npages) } else { 0 };
            if state.bits[ci].nfree == 0 {
                continue;
            }
            let Some(page) = state.bits[ci].find_run(from, 1) else {
                continue;
            };
            let word = page / 64;
            let bits = &mut state.bits[ci];
            let cache = bits.free[word];
            let scav = bits.scav[word] & cache;
            bits.free[word] = 0;
            bits.scav[word] &= !cache;
            let taken = cache.count_ones() as usize;
            bits.nfree -= taken;
            let base = bits.base + word * PAGE_CACHE_PAGES * PAGE_SIZE;
            state.free_pages -= taken;
            state.cursor = (ci, (word + 1) * 64);
            return Some(PageCache::new(base, cache, scav));
        }
        None
    }

    /// Returns a context's unused cached pages to the bitmaps and leaves
    /// the cache empty.
    pub fn flush_cache(&self, pc: &mut PageCache) {
        let cache = pc.cache_mask();
        if cache != 0 {
            let mut state = self.state.lock();
            let ci = Self::chunk_index(&state, pc.base());
            let bits = &mut state.bits[ci];
            let page0 = (pc.base() - bits.base) / PAGE_SIZE;
            debug_assert_eq!(page0 % 64, 0, "page cache window misaligned");
            let word = page0 / 64;
            debug_assert_eq!(bits.free[word] & cache, 0, "flushed pages already free");
            bits.free[word] |= cache;
            bits.scav[word] |= pc.scav_mask();
            let returned = cache.count_ones() as usize;
            bits.nfree += returned;
            state.free_pages += returned;
            if (ci, page0) < state.cursor {
                state.cursor = (ci, page0);
            }
        }
        *pc = PageCache::empty();
    }

    /// Frees `npages` pages starting at `addr`. The pages stay committed
    /// until the scavenger gets to them.
    pub fn free_pages(&self, addr: usize, npages: usize) {
        let mut state = self.state.lock();
        let ci = Self::chunk_index(&state, addr);
        let start = (addr - state.bits[ci].base) / PAGE_SIZE;
        state.bits[ci].free_range(start, npages);
        state.free_pages += npages;
        if (ci, start) < state.cursor {
            state.cursor = (ci, start);
        }
    }

    /// Free pages across all chunks, cached windows excluded.
    pub fn free_page_count(&self) -> usize {
        self.state.lock().free_pages
    }

    /// Returns up to `max_bytes` of free memory to the OS, sweeping the
    /// bitmaps for committed free runs. Returns the bytes released.
    pub fn scavenge(&self, max_bytes: usize) -> usize {
        let mut released = 0;
        let mut state = self.state.lock();
        let chunks = self.chunks.read();
        'chunks: for (ci, bits) in state.bits.iter_mut().enumerate() {
            let chunk = &chunks[ci];
            let mut page = 0;
            while page < bits.npages {
                if released >= max_bytes {
                    break 'chunks;
                }
                if !bits.is_free(page) || bits.is_reclaimed(page) {
                    page += 1;
                    continue;
                }
                let mut run = 1;
                while page + run < bits.npages
                    && released + run * PAGE_SIZE < max_bytes
                    && bits.is_free(page + run)
                    && !bits.is_reclaimed(page + run)
                {
                    run += 1;
                }
                let offset = chunk.mapping_offset(bits.base + page * PAGE_SIZE);
                match chunk.mapping.decommit(offset, run * PAGE_SIZE) {
                    Ok(()) => {
                        for p in page..page + run {
                            bits.scav[p / 64] |= 1 << (p % 64);
                        }
                        released += run * PAGE_SIZE;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to return pages to the OS");
                    }
                }
                page += run;
            }
        }
        if released > 0 {
            tracing::debug!(released, "scavenged free pages");
        }
        released
    }

    /// Re-commits `[addr, addr + len)` after pages in it were reclaimed.
    /// `None` means the OS refused; treat like any other exhaustion.
    pub fn commit(&self, addr: usize, len: usize) -> Option<()> {
        let chunks = self.chunks.read();
        let chunk = chunks
            .iter()
            .find(|c| c.contains(addr))
            .unwrap_or_else(|| panic!("commit of address {addr:#x} outside any chunk"));
        match chunk.mapping.commit(chunk.mapping_offset(addr), len) {
            Ok(()) => Some(()),
            Err(err) => {
                tracing::error!(%err, addr, len, "failed to re-commit pages");
                None
            }
        }
    }

    /// Points every page of the span's run at its arena handle so
    /// address-to-span lookups work.
    pub fn record_span(&self, handle: &SpanHandle) {
        let raw = handle.id.to_raw() + 1;
        self.for_span_pages(&handle.span, |slot| slot.store(raw, Ordering::Release));
    }

    pub fn clear_span(&self, span: &Span) {
        self.for_span_pages(span, |slot| slot.store(0, Ordering::Release));
    }

    fn for_span_pages(&self, span: &Span, f: impl Fn(&AtomicU32)) {
        let chunks = self.chunks.read();
        let chunk = chunks
            .iter()
            .find(|c| c.contains(span.base()))
            .unwrap_or_else(|| panic!("span base {:#x} outside any chunk", span.base()));
        let first = chunk.page_of(span.base());
        for page in first..first + span.npages() {
            f(&chunk.span_map[page]);
        }
    }

    /// Resolves an address to the span occupying its page, if any.
    pub fn span_id_at(&self, addr: usize) -> Option<SpanId> {
        let chunks = self.chunks.read();
        let chunk = chunks.iter().find(|c| c.contains(addr))?;
        let raw = chunk.span_map[chunk.page_of(addr)].load(Ordering::Acquire);
        (raw != 0).then(|| SpanId::from_raw(raw - 1))
    }

    fn find_and_allocate(state: &mut PageState, npages: usize) -> Option<(usize, usize)> {
        let nchunks = state.bits.len();
        if nchunks == 0 {
            return None;
        }
        let (start_chunk, start_page) = state.cursor;
        for step in 0..=nchunks {
            let ci = (start_chunk + step) % nchunks;
            let from = if step == 0 { start_page.min(state.bits[ci].npages) } else { 0 };
            if state.bits[ci].nfree < npages {
                continue;
            }
            let Some(start) = state.bits[ci].find_run(from, npages) else {
                continue;
            };
            let reclaimed = state.bits[ci].allocate_range(start, npages);
            let addr = state.bits[ci].base + start * PAGE_SIZE;
            state.free_pages -= npages;
            state.cursor = (ci, start + npages);
            return Some((addr, reclaimed * PAGE_SIZE));
        }
        None
    }

    fn grow(&self, state: &mut PageState) -> Option<()> {
        let chunk = match Self::map_chunk(CHUNK_PAGES) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::error!(%err, "failed to reserve a new chunk");
                return None;
            }
        };
        tracing::debug!(base = chunk.base, pages = chunk.npages, "grew the page pool");
        state.bits.push(ChunkBits::new_free(chunk.base, chunk.npages));
        state.free_pages += chunk.npages;
        self.chunks.write().push(Arc::new(chunk));
        Some(())
    }

    /// Requests beyond a chunk get their own exact-size reservation,
    /// pre-allocated to the caller in full.
    fn alloc_huge(&self, npages: usize) -> Option<(usize, usize)> {
        let chunk = match Self::map_chunk(npages) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::error!(%err, npages, "failed to reserve a huge span");
                return None;
            }
        };
        let addr = chunk.base;
        let mut state = self.state.lock();
        state.bits.push(ChunkBits::new_allocated(chunk.base, chunk.npages));
        self.chunks.write().push(Arc::new(chunk));
        Some((addr, 0))
    }

    /// Reserves a chunk, over-mapping by one page so the usable base can
    /// be rounded up to the allocator page size.
    fn map_chunk(npages: usize) -> io::Result<Chunk> {
        let mapping = Reservation::reserve(npages * PAGE_SIZE + PAGE_SIZE)?;
        let base = (mapping.ptr() as usize).next_multiple_of(PAGE_SIZE);
        Ok(Chunk {
            base,
            npages,
            mapping,
            span_map: (0..npages).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    fn chunk_index(state: &PageState, addr: usize) -> usize {
        state
            .bits
            .iter()
            .position(|b| addr >= b.base && addr < b.base + b.npages * PAGE_SIZE)
            .unwrap_or_else(|| panic!("address {addr:#x} outside any chunk"))
    }
}
