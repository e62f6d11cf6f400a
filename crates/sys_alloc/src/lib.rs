//! Virtual memory primitives for the mark stack allocator.
//!
//! A mapping starts as a bare address-space reservation whose pages are
//! committed later, piece by piece, with [`Mmap::commit`]. Committed memory
//! is never handed back to the OS until the whole mapping is dropped.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A reserved range of address space.
///
/// Pages are inaccessible until committed. The whole range is released
/// when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Reserves `len` bytes of address space without committing any of it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, otherwise the OS error if
    /// the range could not be reserved.
    pub fn reserve(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        Ok(Self {
            inner: os::MmapInner::reserve(len)?,
        })
    }

    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Commits `[offset, offset + len)` of this mapping, making it readable
    /// and writable.
    ///
    /// Committing an already committed range is allowed and has no effect.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the range is not page aligned or does not
    /// lie inside the mapping, otherwise the OS error if the commit failed.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "commit range must be page aligned",
            ));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "commit range exceeds mapping",
                ))
            }
        }
        if len == 0 {
            return Ok(());
        }

        // SAFETY: the range was checked to lie inside this live mapping.
        unsafe { self.inner.commit(offset, len) }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_reserve_then_commit() {
        let page = page_size();
        let mmap = Mmap::reserve(page * 16).expect("failed to reserve");
        assert_eq!(mmap.len(), page * 16);
        assert_eq!(mmap.ptr() as usize % page, 0);

        mmap.commit(0, page * 2).expect("failed to commit");
        mmap.commit(page * 2, page * 2).expect("failed to commit");

        unsafe {
            let last = mmap.ptr().add(page * 4 - 1);
            ptr::write_volatile(mmap.ptr(), 7);
            ptr::write_volatile(last, 9);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 7);
            assert_eq!(ptr::read_volatile(last), 9);
        }
    }

    #[test]
    fn test_committed_memory_is_zeroed() {
        let page = page_size();
        let mmap = Mmap::reserve(page * 4).expect("failed to reserve");
        mmap.commit(page, page).expect("failed to commit");

        let bytes = unsafe { std::slice::from_raw_parts(mmap.ptr().add(page), page) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_commit_rejects_bad_ranges() {
        let page = page_size();
        let mmap = Mmap::reserve(page * 4).expect("failed to reserve");

        let err = mmap.commit(1, page).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = mmap.commit(page * 2, page * 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        assert!(mmap.commit(page, 0).is_ok());
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = Mmap::reserve(0).err().expect("zero length must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
