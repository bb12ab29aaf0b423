//! GC safepoints.
//!
//! Mutator threads poll an MPROTECTed page on loop back edges. To stop
//! the world the GC revokes the page's read permission; every mutator
//! faults at its next poll, saves its register state, and waits on the
//! rendezvous condition until the collector resumes them.

use std::sync::{Condvar, Mutex};

use lazy_static::lazy_static;
use log::debug;

use crate::guard_page::GuardPage;

lazy_static! {
    static ref SAFEPOINT_PAGE: GuardPage = {
        let page = GuardPage::new().expect("failed to allocate the safepoint page");
        // Readable by default; mutators poll it without faulting until
        // the GC arms it.
        page.disarm().expect("failed to open the safepoint page");
        page
    };
}

/// Address the emitted back-edge poll reads.
pub fn safepoint_poll_addr() -> usize {
    SAFEPOINT_PAGE.addr()
}

/// Is `addr` the safepoint page? Used by the SEGV dispatcher.
pub fn gc_safepoint_page(addr: usize) -> bool {
    SAFEPOINT_PAGE.contains(addr)
}

/// Register state captured when a thread parks at a safepoint, in the
/// order the signal context presents the general-purpose registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SavedRegisters {
    /// General-purpose registers from the interrupted context.
    pub gprs: [u64; 16],
    /// Interrupted program counter.
    pub pc: u64,
    /// Interrupted stack pointer.
    pub sp: u64,
}

struct RendezvousState {
    stopping: bool,
    parked: usize,
}

/// The stop-the-world rendezvous.
pub struct GcRendezvous {
    state: Mutex<RendezvousState>,
    resume: Condvar,
    all_parked: Condvar,
}

impl GcRendezvous {
    /// A quiescent rendezvous.
    pub fn new() -> Self {
        GcRendezvous {
            state: Mutex::new(RendezvousState {
                stopping: false,
                parked: 0,
            }),
            resume: Condvar::new(),
            all_parked: Condvar::new(),
        }
    }

    /// Arm the safepoint page and wait until `mutators` threads have
    /// parked.
    pub fn stop_the_world(&self, mutators: usize) {
        SAFEPOINT_PAGE.arm().expect("failed to arm the safepoint page");
        let mut state = self.state.lock().unwrap();
        state.stopping = true;
        while state.parked < mutators {
            state = self.all_parked.wait(state).unwrap();
        }
        debug!("gc: {} mutators parked", state.parked);
    }

    /// Disarm the page and release every parked thread.
    pub fn resume_the_world(&self) {
        SAFEPOINT_PAGE
            .disarm()
            .expect("failed to disarm the safepoint page");
        let mut state = self.state.lock().unwrap();
        state.stopping = false;
        self.resume.notify_all();
        debug!("gc: world resumed");
    }

    /// Called from the signal path of a faulting mutator: park with the
    /// saved registers until the collector resumes the world.
    pub fn enter(&self, registers: &SavedRegisters) {
        let _ = registers;
        let mut state = self.state.lock().unwrap();
        state.parked += 1;
        self.all_parked.notify_all();
        while state.stopping {
            state = self.resume.wait(state).unwrap();
        }
        state.parked -= 1;
    }
}

impl Default for GcRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn poll_address_is_readable_when_disarmed() {
        let addr = safepoint_poll_addr();
        assert!(gc_safepoint_page(addr));
        unsafe {
            // Must not fault.
            std::ptr::read_volatile(addr as *const u8);
        }
    }

    #[test]
    fn rendezvous_parks_and_resumes() {
        let rendezvous = Arc::new(GcRendezvous::new());
        let r2 = Arc::clone(&rendezvous);

        let mutator = std::thread::spawn(move || {
            // Simulate the faulting mutator entering the handshake.
            r2.enter(&SavedRegisters::default());
        });

        rendezvous.stop_the_world(1);
        rendezvous.resume_the_world();
        mutator.join().unwrap();
    }
}
