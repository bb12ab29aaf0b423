//! No-access guard pages.
//!
//! A guard page is a single page that faults on any access. The
//! exception machinery arms per-thread pointers with a guard page's
//! address so the next inline poll traps; the static-field and
//! stack-overflow paths use them the same way.

use crate::error::RuntimeError;
use crate::mmap::Mmap;

/// One no-access page.
#[derive(Debug)]
pub struct GuardPage {
    map: Mmap,
}

impl GuardPage {
    /// Allocate a page and revoke all access to it.
    pub fn new() -> Result<Self, RuntimeError> {
        let map = Mmap::with_size(1)?;
        map.protect(region::Protection::NONE)?;
        Ok(GuardPage { map })
    }

    /// The faulting address.
    pub fn addr(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Does this page contain `addr`?
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.map.len()
    }

    /// Temporarily make the page readable (used by the GC to resume
    /// mutators after a safepoint).
    pub fn disarm(&self) -> Result<(), RuntimeError> {
        self.map.protect(region::Protection::READ)
    }

    /// Make the page fault again.
    pub fn arm(&self) -> Result<(), RuntimeError> {
        self.map.protect(region::Protection::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_page_address_is_page_aligned() {
        let page = GuardPage::new().unwrap();
        assert_eq!(page.addr() % crate::mmap::page_size(), 0);
        assert!(page.contains(page.addr() + 8));
        assert!(!page.contains(page.addr().wrapping_sub(1)));
    }
}
