//! Process-wide allocator counters, shared by every `Allocator` instance.
//!
//! Updates are `Relaxed`; a `MemoryStats` snapshot reads each counter
//! separately, so two counters in one snapshot can disagree briefly (live
//! large bytes ahead of the reserved total, say). Nothing in the allocator
//! reads them back.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Gauge that tolerates a `sub` landing before its matching `add`: the raw
/// value may go negative for a moment, `get()` reports it as zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Bytes currently obtained from the OS through the VM layer (all three paths).
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Bytes of chunk mappings backing size-classed regions.
crate::sync::static_atomic! {
    pub static CHUNK_BYTES: Counter = Counter::new();
}
// Requested bytes of live large-path allocations.
crate::sync::static_atomic! {
    pub static LARGE_LIVE_BYTES: Counter = Counter::new();
}
// Mappings currently backed by explicit huge pages.
crate::sync::static_atomic! {
    pub static HUGE_PAGE_MAPPINGS: Counter = Counter::new();
}
// Huge-page attempts that fell back to standard pages (monotonic).
crate::sync::static_atomic! {
    pub static HUGE_PAGE_FALLBACKS: Counter = Counter::new();
}
// Allocation routing (monotonic).
crate::sync::static_atomic! {
    pub static FAST_HITS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SLOW_PATHS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static LARGE_ALLOCS: Counter = Counter::new();
}

/// Point-in-time copy of the process-wide allocator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub chunk_bytes: usize,
    pub large_live_bytes: usize,
    pub huge_page_mappings: usize,
    pub huge_page_fallbacks: usize,
    pub fast_hits: usize,
    pub slow_paths: usize,
    pub large_allocs: usize,
}

impl MemoryStats {
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.get(),
            chunk_bytes: CHUNK_BYTES.get(),
            large_live_bytes: LARGE_LIVE_BYTES.get(),
            huge_page_mappings: HUGE_PAGE_MAPPINGS.get(),
            huge_page_fallbacks: HUGE_PAGE_FALLBACKS.get(),
            fast_hits: FAST_HITS.get(),
            slow_paths: SLOW_PATHS.get(),
            large_allocs: LARGE_ALLOCS.get(),
        }
    }
}
