//! Lock-free pool of magazines.
//!
//! An intrusive Treiber stack: the link lives in each magazine's header and
//! the pool head is a single `AtomicU64` holding
//!
//! ```text
//! | version (32 bits) | slot index (32 bits) |
//! ```
//!
//! The slot index is the magazine's offset from the space start in stack
//! units, plus one so that 0 means empty. Every successful push or pop bumps
//! the version, so a head that was popped, reused and pushed back between
//! another thread's load and CAS no longer compares equal.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::magazine::{Magazine, MagazineHeader};

const INDEX_MASK: u64 = u32::MAX as u64;
const VERSION_SHIFT: u32 = 32;

/// Unbounded LIFO pool of magazines shared by all marking threads.
///
/// Pushing hands ownership of a magazine to the pool, popping hands it to
/// the caller. Neither operation blocks.
pub(crate) struct MagazinePool {
    head: CachePadded<AtomicU64>,
    base: usize,
    limit: usize,
    slot_shift: u32,
    len: AtomicIsize,
}

impl MagazinePool {
    /// Create an empty pool for magazines living in `[base, base + limit)`,
    /// carved in `stack_size` slots.
    ///
    /// The space must outlive the pool.
    pub(crate) fn new(base: usize, limit: usize, stack_size: usize) -> Self {
        debug_assert!(stack_size.is_power_of_two());

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            base,
            limit,
            slot_shift: stack_size.trailing_zeros(),
            len: AtomicIsize::new(0),
        }
    }

    /// Returns `true` if `addr` is a slot boundary inside this pool's space.
    fn owns(&self, addr: usize) -> bool {
        self.base != 0
            && addr >= self.base
            && addr - self.base < self.limit
            && (addr - self.base) & ((1 << self.slot_shift) - 1) == 0
    }

    fn encode(&self, header: NonNull<MagazineHeader>, version: u64) -> u64 {
        let offset = header.as_ptr() as usize - self.base;
        let index = ((offset >> self.slot_shift) + 1) as u64;
        (version << VERSION_SHIFT) | index
    }

    fn decode(&self, word: u64) -> Option<NonNull<MagazineHeader>> {
        let index = word & INDEX_MASK;
        if index == 0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let addr = self.base + (((index - 1) as usize) << self.slot_shift);
        NonNull::new(addr as *mut MagazineHeader)
    }

    const fn next_version(word: u64) -> u64 {
        ((word >> VERSION_SHIFT) + 1) & INDEX_MASK
    }

    /// Insert a magazine. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if the magazine was not built in this pool's space.
    pub fn push(&self, magazine: Magazine<'_>) {
        assert!(
            self.owns(magazine.addr()),
            "Magazine does not belong to this allocator"
        );
        let header = magazine.into_header();

        // SAFETY: the magazine was built in the space this pool indexes,
        // which stays mapped while the pool exists.
        let next = unsafe { link(header) };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            next.store(head & INDEX_MASK, Ordering::Relaxed);
            let new_head = self.encode(header, Self::next_version(head));

            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the most recently pushed magazine, or `None` if the pool is
    /// empty.
    pub fn pop(&self) -> Option<Magazine<'_>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let header = self.decode(head)?;

            // SAFETY: every node ever pushed lives in the space, which is never
            // unmapped while the pool exists. The link is atomic, so reading it
            // while another thread owns the magazine is not a data race; a
            // stale value fails the versioned CAS below.
            let next = unsafe { link(header) }.load(Ordering::Relaxed);
            let new_head = (Self::next_version(head) << VERSION_SHIFT) | (next & INDEX_MASK);

            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: the successful CAS unlinked the node, so the
                    // caller is now its only owner.
                    return Some(unsafe { Magazine::from_header(header) });
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Approximate number of pooled magazines.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.len.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Returns `true` if no magazine is pooled.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) & INDEX_MASK == 0
    }
}

/// The pool link of a magazine header.
///
/// Only the atomic link is borrowed; another thread may own the magazine
/// and be writing the rest of its header.
///
/// # Safety
///
/// `header` must point into a live mapping.
unsafe fn link<'a>(header: NonNull<MagazineHeader>) -> &'a AtomicU64 {
    // SAFETY: the caller guarantees the header is mapped; `addr_of!` avoids
    // creating a reference to the whole header.
    unsafe { &*ptr::addr_of!((*header.as_ptr()).next) }
}

impl fmt::Debug for MagazinePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagazinePool")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
