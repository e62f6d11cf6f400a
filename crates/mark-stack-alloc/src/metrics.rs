//! Mark stack allocator metrics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time view of allocator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStackMetrics {
    /// Magazines built from fresh space, including priming.
    pub magazines_created: usize,
    /// `alloc_magazine` calls served by the pool.
    pub pool_hits: usize,
    /// `alloc_magazine` calls that had to build a new magazine.
    pub pool_misses: usize,
    /// Magazines handed back through `free_magazine`.
    pub magazines_freed: usize,
    /// Number of times the space was expanded.
    pub expansions: usize,
    /// Bytes of address space reserved.
    pub reserved_bytes: usize,
    /// Bytes of the space committed.
    pub committed_bytes: usize,
    /// Bytes of the space handed out as magazines.
    pub used_bytes: usize,
}

/// Cumulative counters shared by all threads using one allocator.
///
/// Counters use relaxed ordering; a snapshot is only approximately
/// consistent while other threads are allocating.
#[derive(Debug, Default)]
pub struct AllocatorStats {
    magazines_created: AtomicUsize,
    pool_hits: AtomicUsize,
    pool_misses: AtomicUsize,
    magazines_freed: AtomicUsize,
}

impl AllocatorStats {
    /// Create a new `AllocatorStats` with all counters set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            magazines_created: AtomicUsize::new(0),
            pool_hits: AtomicUsize::new(0),
            pool_misses: AtomicUsize::new(0),
            magazines_freed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_created(&self) {
        self.magazines_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_freed(&self) {
        self.magazines_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Magazines built from fresh space.
    #[must_use]
    pub fn magazines_created(&self) -> usize {
        self.magazines_created.load(Ordering::Relaxed)
    }

    /// Allocations served by the pool.
    #[must_use]
    pub fn pool_hits(&self) -> usize {
        self.pool_hits.load(Ordering::Relaxed)
    }

    /// Allocations that missed the pool.
    #[must_use]
    pub fn pool_misses(&self) -> usize {
        self.pool_misses.load(Ordering::Relaxed)
    }

    /// Magazines returned to the pool by consumers.
    #[must_use]
    pub fn magazines_freed(&self) -> usize {
        self.magazines_freed.load(Ordering::Relaxed)
    }
}
