//! GDB JIT interface registration.
//!
//! Publishes each code region through the in-memory descriptor protocol
//! GDB watches (`__jit_debug_descriptor` plus a breakpoint on
//! `__jit_debug_register_code`). The entries carry no debug info — just
//! the address ranges — which is enough for the debugger to treat the
//! region as code.

use std::ptr;
use std::sync::Mutex;

use lazy_static::lazy_static;

const JIT_NOACTION: u32 = 0;
const JIT_REGISTER_FN: u32 = 1;

#[repr(C)]
struct JitCodeEntry {
    next_entry: *mut JitCodeEntry,
    prev_entry: *mut JitCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

#[repr(C)]
struct JitDescriptor {
    version: u32,
    action_flag: u32,
    relevant_entry: *mut JitCodeEntry,
    first_entry: *mut JitCodeEntry,
}

#[no_mangle]
static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
    version: 1,
    action_flag: JIT_NOACTION,
    relevant_entry: ptr::null_mut(),
    first_entry: ptr::null_mut(),
};

/// GDB plants a breakpoint here; the body must not be optimised away.
#[no_mangle]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    // The breakpoint is the side effect.
    std::hint::black_box(());
}

lazy_static! {
    static ref REGISTRATION: Mutex<()> = Mutex::new(());
}

/// Notify an attached debugger about a freshly published code region.
pub fn register_code(addr: usize, size: usize) {
    let _guard = REGISTRATION.lock().unwrap();
    let entry = Box::into_raw(Box::new(JitCodeEntry {
        next_entry: ptr::null_mut(),
        prev_entry: ptr::null_mut(),
        symfile_addr: addr as *const u8,
        symfile_size: size as u64,
    }));

    unsafe {
        let descriptor = ptr::addr_of_mut!(__jit_debug_descriptor);
        let first = (*descriptor).first_entry;
        (*entry).next_entry = first;
        if !first.is_null() {
            (*first).prev_entry = entry;
        }
        (*descriptor).first_entry = entry;
        (*descriptor).relevant_entry = entry;
        (*descriptor).action_flag = JIT_REGISTER_FN;
    }
    __jit_debug_register_code();
}
