//! The executable text arena.
//!
//! One process-wide region of executable pages. The publisher takes the
//! lock, copies a method's code to the cursor, and advances it; the
//! region stays writable and executable for the lifetime of the process
//! because published code is later patched in place (direct-call and
//! static-field fixups).

use std::sync::Mutex;

use lazy_static::lazy_static;
use log::info;

use crate::error::RuntimeError;
use crate::mmap::Mmap;

/// Default arena size; a few thousand small methods.
const DEFAULT_TEXT_SIZE: usize = 8 * 1024 * 1024;

/// The arena: contiguous RWX pages behind a single lock.
pub struct TextArena {
    map: Mmap,
    cursor: Mutex<usize>,
}

impl TextArena {
    /// Map a fresh arena of `size` bytes.
    pub fn new(size: usize) -> Result<Self, RuntimeError> {
        let map = Mmap::with_size(size)?;
        map.protect(region::Protection::READ_WRITE_EXECUTE)?;
        info!(
            "jit text arena at {:#x}, {} bytes",
            map.as_ptr() as usize,
            map.len()
        );
        Ok(TextArena {
            map,
            cursor: Mutex::new(0),
        })
    }

    /// Copy `code` into the arena and return its final address.
    pub fn publish(&self, code: &[u8]) -> Result<usize, RuntimeError> {
        let mut cursor = self.cursor.lock().unwrap();
        // Keep entry points 16-byte aligned.
        let offset = (*cursor + 15) & !15;
        if offset + code.len() > self.map.len() {
            return Err(RuntimeError::TextArenaFull {
                requested: code.len(),
            });
        }
        let base = self.map.as_ptr() as usize + offset;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base as *mut u8, code.len());
        }
        *cursor = offset + code.len();
        Ok(base)
    }

    /// Reserve space and hand out a writable window at the cursor for
    /// emitters that write in place (trampolines, stubs).
    pub fn reserve(&self, len: usize) -> Result<usize, RuntimeError> {
        let mut cursor = self.cursor.lock().unwrap();
        let offset = (*cursor + 15) & !15;
        if offset + len > self.map.len() {
            return Err(RuntimeError::TextArenaFull { requested: len });
        }
        *cursor = offset + len;
        Ok(self.map.as_ptr() as usize + offset)
    }

    /// Is `addr` inside the arena?
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.map.as_ptr() as usize;
        addr >= base && addr < base + self.map.len()
    }
}

lazy_static! {
    static ref JIT_TEXT: TextArena =
        TextArena::new(DEFAULT_TEXT_SIZE).expect("failed to map the jit text arena");
}

/// The process-wide arena.
pub fn jit_text() -> &'static TextArena {
    &JIT_TEXT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_copies_and_advances() {
        let arena = TextArena::new(64 * 1024).unwrap();
        let a = arena.publish(&[0xc3]).unwrap();
        let b = arena.publish(&[0x90, 0xc3]).unwrap();
        assert!(b > a);
        assert_eq!(b % 16, 0);
        unsafe {
            assert_eq!(*(a as *const u8), 0xc3);
            assert_eq!(*(b as *const u8), 0x90);
        }
        assert!(arena.contains(a));
    }

    #[test]
    fn exhaustion_is_reported() {
        let arena = TextArena::new(4096).unwrap();
        assert!(matches!(
            arena.publish(&vec![0x90; 8192]),
            Err(RuntimeError::TextArenaFull { .. })
        ));
    }
}
