//! Anonymous memory mappings.

use std::ptr;

use crate::error::RuntimeError;

/// A page-aligned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct Mmap {
    ptr: *mut u8,
    len: usize,
}

// The mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map `len` bytes of zeroed read-write memory, rounded up to whole
    /// pages.
    pub fn with_size(len: usize) -> Result<Self, RuntimeError> {
        let len = round_up_to_page(len);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::Mmap(format!(
                "mmap of {} bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Mmap {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Base address.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the mapping empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the protection of the whole mapping.
    pub fn protect(&self, protection: region::Protection) -> Result<(), RuntimeError> {
        unsafe {
            region::protect(self.ptr, self.len, protection)
                .map_err(|e| RuntimeError::Mmap(format!("mprotect failed: {}", e)))
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// The host page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    (len + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let map = Mmap::with_size(100).unwrap();
        assert!(map.len() >= 100);
        unsafe {
            assert_eq!(*map.as_ptr(), 0);
            *map.as_ptr() = 0xaa;
            assert_eq!(*map.as_ptr(), 0xaa);
        }
    }

    #[test]
    fn protect_to_readonly() {
        let map = Mmap::with_size(4096).unwrap();
        map.protect(region::Protection::READ).unwrap();
        unsafe {
            assert_eq!(*map.as_ptr(), 0);
        }
    }
}
