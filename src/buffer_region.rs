use std::io;
use std::ptr;
use anyhow::bail;
use tracing::{debug, warn};
use crate::buffer_pages::BufferPageSet;
use crate::config::BPAGE_SIZE;

/// The memory region a socket registers as its receive buffer pool.
///
/// The region is an anonymous mapping of whole pool pages, aligned to [BPAGE_SIZE]. The
///  kernel transport writes incoming messages into it and hands out the pages via
///  [BufferPageSet]s, so the region is shared between kernel and application without any
///  in-process locking: the application may only look at pages it currently owns.
///
/// The mapping lives until the region is dropped, which must not happen before the socket it
///  is registered with is closed.
pub struct BufferRegion {
    /// start of the actual mapping, which may be below `start` due to alignment
    map_ptr: *mut u8,
    map_len: usize,
    start: *mut u8,
    len: usize,
}

// The region is plain memory; access discipline is the page ownership protocol
unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

impl BufferRegion {
    pub fn new(num_pages: usize) -> anyhow::Result<BufferRegion> {
        if num_pages == 0 {
            bail!("buffer region must have at least one page");
        }
        let len = num_pages * BPAGE_SIZE;

        // over-allocate by one page so we can align the start to BPAGE_SIZE
        let map_len = len + BPAGE_SIZE;
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let map_ptr = map_ptr as *mut u8;

        let misalignment = map_ptr as usize % BPAGE_SIZE;
        let align_offset = if misalignment == 0 { 0 } else { BPAGE_SIZE - misalignment };

        debug!("mapped buffer region of {} pages", num_pages);
        Ok(BufferRegion {
            map_ptr,
            map_len,
            start: unsafe { map_ptr.add(align_offset) },
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn num_pages(&self) -> usize {
        self.len / BPAGE_SIZE
    }

    /// Read `len` bytes at `offset`.
    ///
    /// The caller must own the page(s) containing this range, i.e. they must have been
    ///  handed out by a receive and not been recycled since.
    pub fn slice(&self, offset: u32, len: usize) -> &[u8] {
        let offset = offset as usize;
        assert!(offset + len <= self.len, "range {}+{} outside of buffer region of {} bytes", offset, len, self.len);
        unsafe { std::slice::from_raw_parts(self.start.add(offset), len) }
    }

    /// Copy a received message out of the region
    pub fn read_message(&self, pages: &BufferPageSet, message_len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(message_len);
        for (offset, len) in pages.fragments(message_len) {
            result.extend_from_slice(self.slice(offset, len));
        }
        result
    }

    /// Write raw bytes into the region, bypassing the ownership protocol. This is how the
    ///  kernel (or the simulated kernel) places incoming data.
    ///
    /// SAFETY: the range must be inside a region that is still mapped, and it must not be owned
    ///  by the application
    pub(crate) unsafe fn write_raw(start: usize, offset: usize, data: &[u8]) {
        ptr::copy_nonoverlapping(data.as_ptr(), (start + offset) as *mut u8, data.len());
    }
}

impl Drop for BufferRegion {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.map_ptr as *mut libc::c_void, self.map_len) };
        if result != 0 {
            warn!("error unmapping buffer region: {}", io::Error::last_os_error());
        }
    }
}
