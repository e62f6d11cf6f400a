use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves an inaccessible range. Nothing is backed until `commit`.
    pub fn reserve(len: usize) -> io::Result<MmapInner> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;

        // SAFETY: no address is requested, so the kernel picks a fresh range
        // that cannot alias any existing mapping.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(MmapInner { ptr, len })
    }

    /// Makes a page-aligned sub-range readable and writable.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside this mapping.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ret = unsafe {
            libc::mprotect(
                addr.cast::<libc::c_void>(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };

        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
