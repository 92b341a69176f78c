//! Segment buffers
//!
//! A worker moves each segment through one buffer of `bs * bpt` bytes. The
//! buffer is either heap memory aligned for O_DIRECT and direct sg IO, or a
//! window onto an sg device's reserve buffer obtained with `mmap(2)`.
//! [`SegmentBuffer`] tags the two so each is released the right way.

use crate::error::CopyError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::unix::io::RawFd;
use std::ptr;

/// Memory-aligned heap buffer suitable for O_DIRECT and sg direct IO
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`
    ///
    /// Fails with [`CopyError::OutOfMemory`] when the allocator gives up.
    pub fn new(size: usize, alignment: usize) -> Result<Self, CopyError> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(CopyError::Other(format!(
                "bad buffer geometry: size={}, alignment={}",
                size, alignment
            )));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| CopyError::Other(format!("bad buffer layout: {}", e)))?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CopyError::OutOfMemory(format!("{} byte segment buffer", size)));
        }

        Ok(AlignedBuffer { ptr, size, layout })
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

// AlignedBuffer is Send because it owns its memory
unsafe impl Send for AlignedBuffer {}

/// A `mmap(2)` region, unmapped on drop
pub struct MappedRegion {
    addr: *mut u8,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `fd` shared and read/write
    ///
    /// For an sg device this maps the file descriptor's reserve buffer.
    pub fn map_fd(fd: RawFd, len: usize) -> std::io::Result<Self> {
        Self::map(fd, len, libc::MAP_SHARED)
    }

    /// Map `len` bytes of anonymous memory
    pub fn anonymous(len: usize) -> std::io::Result<Self> {
        Self::map(-1, len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
    }

    fn map(fd: RawFd, len: usize, flags: libc::c_int) -> std::io::Result<Self> {
        // SAFETY: a fresh mapping with no fixed address; failure is checked below
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            addr: addr as *mut u8,
            len,
        })
    }

    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unmap now, reporting failure
    pub fn unmap(self) -> std::io::Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.release()
    }

    fn release(&self) -> std::io::Result<()> {
        // SAFETY: addr/len came from a successful mmap and are unmapped once
        let rc = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

// The region is owned by exactly one worker
unsafe impl Send for MappedRegion {}

/// The buffer a worker moves segments through
pub enum SegmentBuffer {
    /// Heap memory owned by the worker
    Owned(AlignedBuffer),
    /// Device reserve buffer mapped into the worker's address space
    Mapped(MappedRegion),
}

impl SegmentBuffer {
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            SegmentBuffer::Owned(b) => b.as_mut_ptr(),
            SegmentBuffer::Mapped(m) => m.as_mut_ptr(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            SegmentBuffer::Owned(b) => b.size(),
            SegmentBuffer::Mapped(m) => m.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, SegmentBuffer::Mapped(_))
    }

    /// First `len` bytes of the buffer
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.len());
        match self {
            SegmentBuffer::Owned(b) => &b.as_slice()[..len],
            // SAFETY: the mapping is live for as long as self and len is in bounds
            SegmentBuffer::Mapped(m) => unsafe { std::slice::from_raw_parts(m.as_mut_ptr(), len) },
        }
    }

    /// First `len` bytes of the buffer, writable
    pub fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.len());
        let ptr = self.as_mut_ptr();
        // SAFETY: ptr is valid for self.len() bytes and uniquely borrowed through &mut self
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Zero the first `len` bytes
    pub fn zero(&mut self, len: usize) {
        self.bytes_mut(len).fill(0);
    }

    /// Give the memory back: free the heap buffer or unmap the region
    pub fn release(self) -> std::io::Result<()> {
        match self {
            SegmentBuffer::Owned(b) => {
                drop(b);
                Ok(())
            }
            SegmentBuffer::Mapped(m) => m.unmap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(8192, 4096).unwrap();
        assert_eq!(buf.size(), 8192);
        assert_eq!(buf.as_mut_ptr() as usize % 4096, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_geometry() {
        assert!(AlignedBuffer::new(0, 4096).is_err());
        assert!(AlignedBuffer::new(512, 3).is_err());
    }

    #[test]
    fn test_zero_only_touches_prefix() {
        let mut buf = SegmentBuffer::Owned(AlignedBuffer::new(1024, 512).unwrap());
        buf.bytes_mut(1024).fill(0xaa);
        buf.zero(512);
        assert!(buf.bytes(512).iter().all(|&b| b == 0));
        assert!(buf.bytes(1024)[512..].iter().all(|&b| b == 0xaa));
        buf.release().unwrap();
    }

    #[test]
    fn test_anonymous_mapping() {
        let region = MappedRegion::anonymous(4096).unwrap();
        let mut buf = SegmentBuffer::Mapped(region);
        assert!(buf.is_mapped());
        buf.bytes_mut(16).copy_from_slice(&[7u8; 16]);
        assert_eq!(buf.bytes(16), &[7u8; 16]);
        buf.release().unwrap();
    }
}
