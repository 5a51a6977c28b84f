//! Heap growth accounting hooks.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sink for the allocation signals a collection pacer runs on.
///
/// The allocator reports in two granularities: per-span deltas as spans
/// move between tiers (`update_live`), and raw allocation volume as
/// contexts refill (`record_alloc`). Implementations must tolerate calls
/// from any thread; negative live deltas arrive from sweeping.
pub trait HeapController: Send + Sync {
    /// Bytes handed out to contexts since the last report.
    fn record_alloc(&self, bytes: u64);

    /// Bytes of pointer-bearing memory handed out since the last report.
    fn record_scan(&self, bytes: u64);

    /// Adjusts the live-byte and scannable-byte estimates. Sweeping
    /// reports negative deltas; caching spans reports positive ones.
    fn update_live(&self, bytes: i64, scan_bytes: i64);
}

/// Default controller: plain counters, queryable for tests and
/// monitoring.
#[derive(Debug, Default)]
pub struct PacerStats {
    alloc_bytes: AtomicU64,
    scan_alloc_bytes: AtomicU64,
    live_bytes: AtomicI64,
    scan_live_bytes: AtomicI64,
}

impl PacerStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes handed out to contexts.
    #[must_use]
    pub fn alloc_bytes(&self) -> u64 {
        self.alloc_bytes.load(Ordering::Relaxed)
    }

    /// Total pointer-bearing bytes handed out to contexts.
    #[must_use]
    pub fn scan_alloc_bytes(&self) -> u64 {
        self.scan_alloc_bytes.load(Ordering::Relaxed)
    }

    /// Current live-byte estimate. Overshoots between collections; the
    /// sweep corrects it downward.
    #[must_use]
    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Current scannable live-byte estimate.
    #[must_use]
    pub fn scan_live_bytes(&self) -> i64 {
        self.scan_live_bytes.load(Ordering::Relaxed)
    }
}

impl HeapController for PacerStats {
    fn record_alloc(&self, bytes: u64) {
        self.alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_scan(&self, bytes: u64) {
        self.scan_alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn update_live(&self, bytes: i64, scan_bytes: i64) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.scan_live_bytes.fetch_add(scan_bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_stats_accumulate() {
        let stats = PacerStats::new();
        stats.record_alloc(4096);
        stats.record_scan(1024);
        stats.update_live(4096, 1024);
        stats.update_live(-1000, -500);
        assert_eq!(stats.alloc_bytes(), 4096);
        assert_eq!(stats.scan_alloc_bytes(), 1024);
        assert_eq!(stats.live_bytes(), 3096);
        assert_eq!(stats.scan_live_bytes(), 524);
    }
}
