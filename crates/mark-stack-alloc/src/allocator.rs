//! The mark stack allocator.
//!
//! Marking threads exchange whole magazines with the allocator. Steady-state
//! traffic is served by the lock-free pool; the address space is only
//! touched on a pool miss.

use std::fmt;
use std::ptr::NonNull;

use crate::config::MarkStackConfig;
use crate::magazine::{Magazine, MagazineFactory};
use crate::metrics::{AllocatorStats, MarkStackMetrics};
use crate::pool::MagazinePool;
use crate::space::AddressSpaceArena;
use crate::tracing::{fatal, internal};

/// Hands out magazines of mark stacks to marking threads.
///
/// # Example
///
/// ```
/// use mark_stack_alloc::{MarkStackAllocator, MarkStackConfig};
///
/// let config = MarkStackConfig::default()
///     .with_stack_size(4096)
///     .with_magazine_size(64 * 1024)
///     .with_expand_size(256 * 1024)
///     .with_space_limit(1024 * 1024);
/// let allocator = MarkStackAllocator::new(config);
/// assert!(allocator.is_initialized());
///
/// let mut magazine = allocator.alloc_magazine().unwrap();
/// let stack = magazine.pop().unwrap();
/// magazine.push(stack).unwrap();
/// allocator.free_magazine(magazine);
/// ```
pub struct MarkStackAllocator {
    pool: MagazinePool,
    space: AddressSpaceArena,
    factory: MagazineFactory,
    config: MarkStackConfig,
    stats: AllocatorStats,
}

impl MarkStackAllocator {
    /// Reserve the mark stack space and prime the magazine pool.
    ///
    /// If the reservation fails the allocator is returned uninitialized;
    /// check [`is_initialized`](Self::is_initialized) before marking.
    ///
    /// # Panics
    ///
    /// An invalid configuration is fatal.
    #[must_use]
    pub fn new(config: MarkStackConfig) -> Self {
        if let Err(err) = config.validate() {
            fatal(&format!("Invalid mark stack configuration: {err}"));
        }

        let space = AddressSpaceArena::reserve(config.space_limit, config.expand_size);
        let allocator = Self {
            pool: MagazinePool::new(space.start(), config.space_limit, config.stack_size),
            space,
            factory: MagazineFactory::new(config.stack_size, config.magazine_size),
            config,
            stats: AllocatorStats::new(),
        };

        // Prime the pool to avoid an immediate space expansion when
        // marking starts.
        if allocator.is_initialized() {
            allocator.prime();
        }

        allocator
    }

    /// Returns `true` if the mark stack space was reserved.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.space.is_initialized()
    }

    /// The configuration this allocator was built with.
    #[must_use]
    pub const fn config(&self) -> &MarkStackConfig {
        &self.config
    }

    /// The underlying address space.
    #[must_use]
    pub const fn space(&self) -> &AddressSpaceArena {
        &self.space
    }

    /// Start of the mark stack space, or 0 if uninitialized.
    #[must_use]
    pub const fn space_start(&self) -> usize {
        self.space.start()
    }

    /// Approximate number of magazines waiting in the pool.
    #[must_use]
    pub fn pooled_magazines(&self) -> usize {
        self.pool.len()
    }

    /// Cumulative counters.
    #[must_use]
    pub const fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    /// Snapshot of allocator and space counters.
    #[must_use]
    pub fn metrics(&self) -> MarkStackMetrics {
        MarkStackMetrics {
            magazines_created: self.stats.magazines_created(),
            pool_hits: self.stats.pool_hits(),
            pool_misses: self.stats.pool_misses(),
            magazines_freed: self.stats.magazines_freed(),
            expansions: self.space.expansions(),
            reserved_bytes: self.space.reserved(),
            committed_bytes: self.space.committed(),
            used_bytes: self.space.used(),
        }
    }

    fn prime(&self) {
        let mut magazines = 0;
        for _ in 0..self.config.magazines_per_expansion() {
            let Some(magazine) = self.create_magazine_from_space() else {
                break;
            };
            self.pool.push(magazine);
            magazines += 1;
        }

        internal::log_primed(magazines, magazines * self.factory.capacity());
    }

    fn create_magazine_from_space(&self) -> Option<Magazine<'_>> {
        let addr = self.space.alloc(self.factory.magazine_size())?;
        let chunk = NonNull::new(addr as *mut u8)?;
        self.stats.record_created();

        // SAFETY: the space hands out every committed range exactly once and
        // keeps it mapped for as long as `self` lives.
        Some(unsafe { self.factory.build(chunk) })
    }

    /// Take a magazine, from the pool if possible, otherwise built from
    /// fresh space.
    ///
    /// Returns `None` only if the allocator is uninitialized.
    ///
    /// # Panics
    ///
    /// Running out of mark stack space is fatal.
    pub fn alloc_magazine(&self) -> Option<Magazine<'_>> {
        // Try allocating from the pool first
        if let Some(magazine) = self.pool.pop() {
            self.stats.record_hit();
            return Some(magazine);
        }

        self.stats.record_miss();
        let magazine = self.create_magazine_from_space()?;
        internal::log_pool_miss(magazine.addr());
        Some(magazine)
    }

    /// Return a magazine to the pool.
    ///
    /// The magazine may hold any number of stacks; its contents are not
    /// inspected.
    ///
    /// # Panics
    ///
    /// Panics if the magazine was taken from a different allocator.
    pub fn free_magazine(&self, magazine: Magazine<'_>) {
        assert!(
            self.space.contains(magazine.addr()),
            "Magazine does not belong to this allocator"
        );
        self.stats.record_freed();
        self.pool.push(magazine);
    }
}

impl Default for MarkStackAllocator {
    fn default() -> Self {
        Self::new(MarkStackConfig::default())
    }
}

impl fmt::Debug for MarkStackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkStackAllocator")
            .field("config", &self.config)
            .field("space", &self.space)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
