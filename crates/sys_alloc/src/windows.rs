use std::io::{self, Error};
#[cfg(not(miri))]
use std::{mem, ptr};

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

#[cfg(miri)]
const MIRI_ALIGN: usize = 65536;

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves an inaccessible range. Nothing is backed until `commit`.
    #[cfg(not(miri))]
    pub fn reserve(len: usize) -> io::Result<MmapInner> {
        // SAFETY: a null address lets the OS pick a fresh range.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(MmapInner { ptr, len })
    }

    /// Miri doesn't support `VirtualAlloc`; the whole range is backed up
    /// front and `commit` becomes a no-op.
    #[cfg(miri)]
    pub fn reserve(len: usize) -> io::Result<MmapInner> {
        use std::alloc::{alloc_zeroed, Layout};

        let layout = Layout::from_size_align(len, MIRI_ALIGN)
            .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(MmapInner {
            ptr: ptr.cast::<std::ffi::c_void>(),
            len,
        })
    }

    /// Commits a page-aligned sub-range of a reservation.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside this mapping.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
            let ret = unsafe {
                VirtualAlloc(
                    addr.cast::<std::ffi::c_void>(),
                    len,
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if ret.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, MIRI_ALIGN) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
