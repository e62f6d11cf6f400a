//! Mark stack address space.
//!
//! The whole space is reserved up front and committed in `expand_size`
//! increments. Allocation bumps `top` with a CAS loop while `top + size`
//! stays within the committed `end`; growing `end` is serialized by the
//! expansion lock.
//!
//! # Invariants
//!
//! - `start <= end <= start + limit` and `start <= top`
//! - `top <= end`, except while an expansion publishes its own slice: `top`
//!   is advanced before `end`, so lock-free bumpers only ever see too
//!   little room, never room that is already claimed
//! - `top` and `end` never decrease
//! - nothing is ever decommitted or unmapped while the arena is alive

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use sys_alloc::Mmap;
use thiserror::Error;

use crate::config::M;
use crate::tracing::{fatal, internal};

/// Failure to set up the mark stack space.
#[derive(Debug, Error)]
pub enum SpaceError {
    /// The OS refused to reserve the address range.
    #[error("failed to reserve {size} bytes of address space for mark stacks")]
    Reserve {
        /// Requested reservation size.
        size: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// A reserved range of address space handing out non-overlapping chunks.
pub struct AddressSpaceArena {
    expand_lock: Mutex<()>,
    mapping: Option<Mmap>,
    start: usize,
    top: CachePadded<AtomicUsize>,
    end: CachePadded<AtomicUsize>,
    limit: usize,
    expand_size: usize,
    expansions: AtomicUsize,
}

impl AddressSpaceArena {
    /// Create an uninitialized arena. Nothing is reserved until
    /// [`initialize`](Self::initialize).
    ///
    /// # Panics
    ///
    /// Panics if `limit` cannot hold a single expansion.
    #[must_use]
    pub fn new(limit: usize, expand_size: usize) -> Self {
        assert!(limit >= expand_size, "Mark stack space limit too small");

        Self {
            expand_lock: Mutex::new(()),
            mapping: None,
            start: 0,
            top: CachePadded::new(AtomicUsize::new(0)),
            end: CachePadded::new(AtomicUsize::new(0)),
            limit,
            expand_size,
            expansions: AtomicUsize::new(0),
        }
    }

    /// Create an arena and reserve its address space.
    ///
    /// A failed reservation is logged and leaves the arena uninitialized;
    /// callers must check [`is_initialized`](Self::is_initialized).
    #[must_use]
    pub fn reserve(limit: usize, expand_size: usize) -> Self {
        let mut space = Self::new(limit, expand_size);
        // The failure has been logged; the arena stays uninitialized.
        let _ = space.initialize();
        space
    }

    /// Reserve `limit` bytes of address space without committing any of it.
    ///
    /// Calling this on an initialized arena does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceError::Reserve`] if the OS refused the reservation.
    pub fn initialize(&mut self) -> Result<(), SpaceError> {
        if self.is_initialized() {
            return Ok(());
        }

        let mapping = Mmap::reserve(self.limit).map_err(|source| {
            internal::log_reserve_failed(self.limit, &source);
            SpaceError::Reserve {
                size: self.limit,
                source,
            }
        })?;

        let addr = mapping.ptr() as usize;
        self.mapping = Some(mapping);
        self.start = addr;
        *self.top.get_mut() = addr;
        *self.end.get_mut() = addr;

        internal::log_reserved(addr, self.limit);
        Ok(())
    }

    /// Returns `true` once the address space has been reserved.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.start != 0
    }

    /// First address of the space, or 0 if uninitialized.
    ///
    /// Marking code encodes stack addresses relative to this.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Maximum number of bytes the space may grow to.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes committed per expansion.
    #[must_use]
    pub const fn expand_size(&self) -> usize {
        self.expand_size
    }

    /// Bytes of address space reserved.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.mapping.as_ref().map_or(0, Mmap::len)
    }

    /// Bytes committed so far.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.end.load(Ordering::Acquire) - self.start
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top.load(Ordering::Acquire) - self.start
    }

    /// Number of expansions performed.
    #[must_use]
    pub fn expansions(&self) -> usize {
        self.expansions.load(Ordering::Relaxed)
    }

    /// Returns `true` if `addr` lies inside the reserved range.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.is_initialized() && addr >= self.start && addr - self.start < self.limit
    }

    /// Lock-free fast path: claim `size` bytes of already committed space.
    ///
    /// Returns `None` when the committed region is too small; this is the
    /// signal to expand, not an error. Never touches `end`.
    pub fn try_bump(&self, size: usize) -> Option<usize> {
        let mut top = self.top.load(Ordering::Acquire);

        loop {
            let end = self.end.load(Ordering::Acquire);
            let new_top = top.checked_add(size)?;
            if new_top > end {
                // Not enough space left
                return None;
            }

            match self
                .top
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(top),
                // Another thread moved top, retry
                Err(actual) => top = actual,
            }
        }
    }

    /// Slow path: commit one more increment and claim `size` bytes from it.
    ///
    /// Exceeding the space limit or failing to commit is fatal.
    ///
    /// # Panics
    ///
    /// Panics if the space would grow beyond its limit, if the OS cannot
    /// commit the new increment, or if `size` exceeds one increment.
    pub fn expand_and_bump(&self, size: usize) -> Option<usize> {
        let _guard = self.expand_lock.lock();

        // Another thread may have expanded while we waited for the lock
        if let Some(addr) = self.try_bump(size) {
            return Some(addr);
        }

        let mapping = self.mapping.as_ref()?;
        assert!(size <= self.expand_size, "Allocation larger than expand size");

        let old_size = self.end.load(Ordering::Acquire) - self.start;
        let new_size = old_size + self.expand_size;
        if new_size > self.limit {
            fatal(&format!(
                "Mark stack space exhausted. Use MarkStackConfig::space_limit to increase the \
                 maximum number of bytes allocated for mark stacks. Current limit is {}M ({} bytes).",
                self.limit / M,
                self.limit
            ));
        }

        internal::log_expansion(old_size, new_size);

        if let Err(err) = mapping.commit(old_size, self.expand_size) {
            fatal(&format!(
                "Failed to commit mark stack space ({} bytes at {:#x}): {err}",
                self.expand_size,
                self.start + old_size
            ));
        }

        // Increment top before end so no lock-free bump can claim the
        // newly committed space before our slice is reserved.
        let addr = self.top.fetch_add(size, Ordering::AcqRel);
        self.end.fetch_add(self.expand_size, Ordering::Release);
        self.expansions.fetch_add(1, Ordering::Relaxed);

        Some(addr)
    }

    /// Claim `size` bytes, expanding the space if needed.
    ///
    /// Returns `None` only if the arena was never initialized.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        if !self.is_initialized() {
            return None;
        }

        self.try_bump(size).or_else(|| self.expand_and_bump(size))
    }
}

impl fmt::Debug for AddressSpaceArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceArena")
            .field("start", &format_args!("{:#x}", self.start))
            .field("used", &self.used())
            .field("committed", &self.committed())
            .field("limit", &self.limit)
            .field("expand_size", &self.expand_size)
            .finish_non_exhaustive()
    }
}
