use crate::util::constants::BYTES_IN_PAGE;
use libc::c_void;
use std::io::{Error, Result};
use std::ptr::NonNull;

/// Reserve `size` bytes of address space without occupying physical memory or swap.
///
/// Pages are backed lazily on first touch and read as zero until written.
pub fn mmap_noreserve(size: usize) -> Result<NonNull<u8>> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(Error::last_os_error)
}

/// Return the physical pages behind `[start, start + size)` to the OS. The range stays mapped
/// and reads as zero afterwards.
pub fn decommit(start: NonNull<u8>, size: usize) -> Result<()> {
    debug_assert!(start.as_ptr() as usize % BYTES_IN_PAGE == 0);
    debug_assert!(size % BYTES_IN_PAGE == 0);
    let ptr = start.as_ptr() as *mut c_void;
    wrap_libc_call(&|| unsafe { libc::madvise(ptr, size, libc::MADV_DONTNEED) }, 0)
}

/// Unmap `[start, start + size)`.
pub fn munmap(start: NonNull<u8>, size: usize) -> Result<()> {
    let ptr = start.as_ptr() as *mut c_void;
    wrap_libc_call(&|| unsafe { libc::munmap(ptr, size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// An owned, page-aligned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct MmapRegion {
    start: NonNull<u8>,
    size: usize,
}

// The region is a plain range of memory; synchronizing access to its contents is up to the
// owner.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Reserve a region of at least `size` bytes, rounded up to whole pages.
    pub fn reserve(size: usize) -> Result<Self> {
        let size = size.max(1).next_multiple_of(BYTES_IN_PAGE);
        let start = mmap_noreserve(size)?;
        trace!("Reserved {} bytes at {:?}", size, start);
        Ok(MmapRegion { start, size })
    }

    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A pointer `offset` bytes into the region.
    #[inline(always)]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.size);
        // SAFETY: offset is within the mapping, so the result is in bounds and non-null.
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
    }

    /// Decommit `[offset, offset + size)` of the region.
    pub fn decommit(&self, offset: usize, size: usize) -> Result<()> {
        debug_assert!(offset + size <= self.size);
        decommit(self.at(offset), size)
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = munmap(self.start, self.size) {
            warn!("Failed to unmap {} bytes at {:?}: {}", self.size, self.start, e);
        }
    }
}
