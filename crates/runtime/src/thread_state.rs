//! Per-thread exception state and the guard-page protocol.
//!
//! Two per-thread pointers drive asynchronous exception delivery. When no
//! exception is pending each points at itself, so the inline post-call
//! poll (`mov guard, %r; test (%r), %r`) reads harmlessly. Posting an
//! exception swaps them to the address of a no-access page: the next poll
//! faults, the SEGV handler recognises the address, and control is routed
//! into the unwind machinery. The trampoline variant covers compilations
//! that fail inside the lazy-compile path.

use std::cell::Cell;

use once_cell::sync::OnceCell;

use javelin_environ::ObjectRef;

use crate::guard_page::GuardPage;

#[repr(C)]
struct ThreadJitState {
    exception_guard: Cell<usize>,
    trampoline_exception_guard: Cell<usize>,
    exception_holder: Cell<ObjectRef>,
}

thread_local! {
    static JIT_STATE: ThreadJitState = const {
        ThreadJitState {
            exception_guard: Cell::new(0),
            trampoline_exception_guard: Cell::new(0),
            exception_holder: Cell::new(ObjectRef::null()),
        }
    };
}

static EXCEPTIONS_GUARD_PAGE: OnceCell<GuardPage> = OnceCell::new();
static TRAMPOLINE_GUARD_PAGE: OnceCell<GuardPage> = OnceCell::new();

/// Allocate the process-wide guard pages. Must run before any thread
/// executes compiled code.
pub fn init_exceptions() {
    EXCEPTIONS_GUARD_PAGE
        .set(GuardPage::new().expect("failed to allocate exceptions guard page"))
        .ok();
    TRAMPOLINE_GUARD_PAGE
        .set(GuardPage::new().expect("failed to allocate trampoline guard page"))
        .ok();
    thread_init_exceptions();
}

/// The page armed into `exception_guard` while an exception is pending.
pub fn exceptions_guard_page() -> usize {
    EXCEPTIONS_GUARD_PAGE
        .get()
        .expect("init_exceptions not called")
        .addr()
}

/// The page armed into the trampoline guard.
pub fn trampoline_exceptions_guard_page() -> usize {
    TRAMPOLINE_GUARD_PAGE
        .get()
        .expect("init_exceptions not called")
        .addr()
}

/// Point this thread's guards at their safe self-addresses.
pub fn thread_init_exceptions() {
    JIT_STATE.with(|state| {
        state
            .exception_guard
            .set(&state.exception_guard as *const _ as usize);
        state
            .trampoline_exception_guard
            .set(&state.trampoline_exception_guard as *const _ as usize);
        state.exception_holder.set(ObjectRef::null());
    });
}

/// Post a pending exception on the current thread and arm both guards.
pub fn signal_exception(exception: ObjectRef) {
    debug_assert!(!exception.is_null());
    JIT_STATE.with(|state| {
        state.exception_guard.set(exceptions_guard_page());
        state
            .trampoline_exception_guard
            .set(trampoline_exceptions_guard_page());
        state.exception_holder.set(exception);
    });
}

/// The pending exception, if any.
pub fn exception_occurred() -> Option<ObjectRef> {
    JIT_STATE.with(|state| {
        let held = state.exception_holder.get();
        if held.is_null() {
            None
        } else {
            Some(held)
        }
    })
}

/// Is the trampoline guard armed?
pub fn trampoline_exception_occurred() -> bool {
    JIT_STATE.with(|state| {
        state.trampoline_exception_guard.get() == trampoline_exceptions_guard_page()
    })
}

/// Clear the pending exception and re-arm the guards to their safe
/// self-pointers.
pub fn clear_exception() {
    thread_init_exceptions();
}

/// Segment-relative displacement of the current thread's exception guard
/// field, as needed by the inline poll's `fs`/`gs` load.
///
/// On x86-64 Linux the thread pointer sits in `fs`; thread-locals live at
/// a fixed offset from it, recovered here by subtracting the thread
/// pointer from the field's address. The offset is identical across
/// threads of one binary.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn exception_guard_tls_offset() -> i32 {
    let field_addr = JIT_STATE.with(|state| &state.exception_guard as *const _ as usize);
    let fs_base = read_fs_base();
    (field_addr as i64 - fs_base as i64) as i32
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn read_fs_base() -> usize {
    const ARCH_GET_FS: libc::c_int = 0x1003;
    let mut base: usize = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_arch_prctl,
            ARCH_GET_FS,
            &mut base as *mut usize as usize,
        )
    };
    assert_eq!(rc, 0, "arch_prctl(ARCH_GET_FS) failed");
    base
}

/// Fallback for hosts without a known thread-pointer recipe.
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub fn exception_guard_tls_offset() -> i32 {
    unimplemented!("thread-local layout of this host is not known")
}

/// Segment-relative displacement of the trampoline exception guard; it
/// sits one word after the ordinary guard in the per-thread state.
pub fn trampoline_guard_tls_offset() -> i32 {
    exception_guard_tls_offset() + std::mem::size_of::<usize>() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_protocol_round_trip() {
        init_exceptions();
        assert!(exception_occurred().is_none());

        let fake = ObjectRef::from_raw(0x1000 as *mut usize);
        signal_exception(fake);
        assert_eq!(exception_occurred(), Some(fake));
        assert!(trampoline_exception_occurred());

        clear_exception();
        assert!(exception_occurred().is_none());
        assert!(!trampoline_exception_occurred());
    }

    #[test]
    fn cleared_guard_points_at_itself() {
        init_exceptions();
        clear_exception();
        JIT_STATE.with(|state| {
            let self_addr = &state.exception_guard as *const _ as usize;
            assert_eq!(state.exception_guard.get(), self_addr);
        });
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn tls_offset_resolves_the_guard_field() {
        init_exceptions();
        let offset = exception_guard_tls_offset();
        let base = read_fs_base();
        let addr = (base as i64 + i64::from(offset)) as usize;
        let expected = JIT_STATE.with(|state| &state.exception_guard as *const _ as usize);
        assert_eq!(addr, expected);
    }
}
