//! Magazines and the mark stacks they carry.
//!
//! A magazine is built in place on a chunk freshly carved out of the mark
//! stack space. Slot 0 of the chunk holds the magazine header followed by
//! the entry array, every other slot is a mark stack:
//!
//! ```text
//! chunk:  | header + entries | stack 1 | stack 2 | ... | stack C |
//!           <- stack_size ->
//! ```
//!
//! The chunk is never unbuilt; once a magazine exists its memory is recycled
//! through the pool for the remaining lifetime of the allocator.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use crate::space::AddressSpaceArena;

/// In-place header at the start of every magazine chunk.
///
/// `capacity` entries of `usize` follow the header directly.
#[repr(C)]
pub(crate) struct MagazineHeader {
    /// Link word owned by the magazine pool while the magazine is pooled.
    pub(crate) next: AtomicU64,
    capacity: usize,
    len: usize,
}

/// Owned handle to one mark stack block.
///
/// The block's contents belong to the marking code; the allocator only
/// tracks its address. Handles are not `Copy`, so a stack lives in at most
/// one place at a time.
pub struct MarkStack<'a> {
    ptr: NonNull<u8>,
    _space: PhantomData<&'a AddressSpaceArena>,
}

impl MarkStack<'_> {
    /// Address of the first byte of the stack.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Raw pointer to the stack memory.
    ///
    /// The memory stays valid while the allocator the stack was taken from
    /// is alive. A stack moved into a magazine of another allocator keeps
    /// pointing into its original space.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl fmt::Debug for MarkStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MarkStack")
            .field(&format_args!("{:#x}", self.addr()))
            .finish()
    }
}

// SAFETY: a `MarkStack` is the unique handle to its block, which lives in
// the shared mapping for at least `'a`.
unsafe impl Send for MarkStack<'_> {}

/// Owned handle to a magazine of mark stacks.
///
/// Obtained from [`MarkStackAllocator::alloc_magazine`] and handed back with
/// [`MarkStackAllocator::free_magazine`]. Moving the handle moves ownership;
/// there is no way to hold the same magazine twice.
///
/// [`MarkStackAllocator::alloc_magazine`]: crate::MarkStackAllocator::alloc_magazine
/// [`MarkStackAllocator::free_magazine`]: crate::MarkStackAllocator::free_magazine
pub struct Magazine<'a> {
    header: NonNull<MagazineHeader>,
    _space: PhantomData<&'a AddressSpaceArena>,
}

impl<'a> Magazine<'a> {
    /// Bytes occupied by a header with room for `capacity` entries.
    #[must_use]
    pub const fn footprint(capacity: usize) -> usize {
        size_of::<MagazineHeader>() + capacity * size_of::<usize>()
    }

    /// Re-wrap a header pointer as an owned handle.
    ///
    /// # Safety
    ///
    /// `header` must point at a magazine built by [`MagazineFactory::build`]
    /// in a mapping that lives for `'a`, and the caller must be its sole
    /// owner.
    pub(crate) const unsafe fn from_header(header: NonNull<MagazineHeader>) -> Self {
        Self {
            header,
            _space: PhantomData,
        }
    }

    /// Give up the handle, returning the header pointer.
    pub(crate) const fn into_header(self) -> NonNull<MagazineHeader> {
        self.header
    }

    pub(crate) const fn header(&self) -> &MagazineHeader {
        // SAFETY: the header stays mapped for 'a and this handle is unique.
        unsafe { self.header.as_ref() }
    }

    /// Address of the magazine, which is also the address of its chunk.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    /// Maximum number of stacks the magazine holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Number of stacks currently held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.header().len
    }

    /// Returns `true` if the magazine holds no stacks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if no more stacks fit.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    fn entries(&self) -> *mut usize {
        // SAFETY: the entry array starts right after the header inside slot 0.
        unsafe { self.header.as_ptr().add(1).cast::<usize>() }
    }

    /// Push a stack.
    ///
    /// # Errors
    ///
    /// Hands the stack back if the magazine is full.
    pub fn push(&mut self, stack: MarkStack<'a>) -> Result<(), MarkStack<'a>> {
        let len = self.len();
        if len == self.capacity() {
            return Err(stack);
        }

        // SAFETY: len < capacity, so the slot lies inside the entry array,
        // and `&mut self` gives exclusive access to the header.
        unsafe {
            self.entries().add(len).write(stack.addr());
            (*self.header.as_ptr()).len = len + 1;
        }
        Ok(())
    }

    /// Pop the most recently pushed stack.
    pub fn pop(&mut self) -> Option<MarkStack<'a>> {
        let len = self.len().checked_sub(1)?;

        // SAFETY: entry `len` was written by a previous push and holds the
        // non-null address of a stack inside this mapping.
        unsafe {
            let addr = self.entries().add(len).read();
            (*self.header.as_ptr()).len = len;
            Some(MarkStack {
                ptr: NonNull::new_unchecked(addr as *mut u8),
                _space: PhantomData,
            })
        }
    }
}

impl fmt::Debug for Magazine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Magazine")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

// SAFETY: the handle is the unique owner of its chunk, which lives in the
// shared mapping for at least `'a`.
unsafe impl Send for Magazine<'_> {}

/// Turns fresh chunks of mark stack space into magazines.
#[derive(Clone, Copy, Debug)]
pub struct MagazineFactory {
    stack_size: usize,
    magazine_size: usize,
}

impl MagazineFactory {
    /// Create a factory for chunks of `magazine_size` bytes split into
    /// `stack_size` slots.
    ///
    /// # Panics
    ///
    /// Panics if `stack_size` does not divide `magazine_size` or the header
    /// does not fit in one slot. Both are startup invariants normally
    /// established by [`MarkStackConfig::validate`](crate::MarkStackConfig::validate).
    #[must_use]
    pub const fn new(stack_size: usize, magazine_size: usize) -> Self {
        assert!(
            stack_size != 0 && magazine_size >= stack_size && magazine_size % stack_size == 0,
            "Invalid magazine size"
        );
        assert!(
            Magazine::footprint(magazine_size / stack_size - 1) <= stack_size,
            "Magazine header does not fit in a mark stack"
        );
        Self {
            stack_size,
            magazine_size,
        }
    }

    /// Number of stacks in every magazine this factory builds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.magazine_size / self.stack_size - 1
    }

    /// Size of the chunk one magazine is built from.
    #[must_use]
    pub const fn magazine_size(&self) -> usize {
        self.magazine_size
    }

    /// Build a full magazine in place on `[addr, addr + magazine_size)`.
    ///
    /// Slot 0 becomes the magazine header, every following `stack_size`
    /// slot is pushed into it as a stack.
    ///
    /// # Safety
    ///
    /// The range must be committed, word aligned, exclusively owned by the
    /// caller, and stay mapped for `'a`.
    pub unsafe fn build<'a>(&self, addr: NonNull<u8>) -> Magazine<'a> {
        debug_assert_eq!(
            addr.as_ptr() as usize % align_of::<MagazineHeader>(),
            0,
            "Misaligned chunk"
        );

        let header = addr.cast::<MagazineHeader>();
        // SAFETY: slot 0 is committed, aligned and exclusively ours.
        unsafe {
            header.as_ptr().write(MagazineHeader {
                next: AtomicU64::new(0),
                capacity: self.capacity(),
                len: 0,
            });
        }
        // SAFETY: the header was just initialized and the chunk is ours.
        let mut magazine = unsafe { Magazine::from_header(header) };

        for offset in (self.stack_size..self.magazine_size).step_by(self.stack_size) {
            // SAFETY: offset stays inside the chunk, which starts at a non-null address.
            let stack = MarkStack {
                ptr: unsafe { NonNull::new_unchecked(addr.as_ptr().add(offset)) },
                _space: PhantomData,
            };
            let pushed = magazine.push(stack);
            assert!(pushed.is_ok(), "Magazine should never get full");
        }

        magazine
    }
}
