//! The exception engine: handler lookup, frame unwinding, and the signal
//! bottom halves.
//!
//! A throw never "returns an error" through compiled code. The thrower
//! posts the exception and control reaches `throw_from_jit`, which maps
//! the faulting native address back to a bytecode offset, walks the
//! method's exception table, and answers with the native address
//! execution continues at: a matching handler, the frame's unwind block
//! (propagate to a JIT caller), or its exit block (return to a native
//! caller with the exception pending).

use std::sync::Arc;

use log::trace;

use javelin_environ::{Class, Method, ObjectRef};
use javelin_runtime::{
    clear_exception, exception_occurred, signal_exception, SavedRegisters, SignalRouter,
};

use crate::engine::Jit;
use crate::helpers;
use crate::state::MethodState;

/// Entry the trampolines call to compile a method. Receives the raw
/// method pointer baked into the trampoline; returns the published entry
/// (or 0 with an exception pending).
extern "C" fn jit_compiler_entry(method_ptr: usize) -> usize {
    // The pointer was produced with `Arc::as_ptr` on an immortal method.
    let method = unsafe {
        Arc::increment_strong_count(method_ptr as *const Method);
        Arc::from_raw(method_ptr as *const Method)
    };
    Jit::get().compile(&method)
}

/// Address the trampolines call.
pub fn compiler_entry_addr() -> usize {
    jit_compiler_entry as usize
}

/// Find the handler for the pending exception thrown at `native_ptr`
/// with frame pointer `frame`. Exposed as the brains behind the unwind
/// thunk and the bottom halves.
#[no_mangle]
pub extern "C" fn throw_from_jit(native_ptr: u64, frame: u64) -> u64 {
    let jit = Jit::get();
    let native_ptr = native_ptr as usize;
    let frame = frame as usize;

    let exception = exception_occurred().expect("throw with no pending exception");
    let Some(state) = jit.code_map.lookup(native_ptr) else {
        panic!("throw from non-jit address {:#x}", native_ptr);
    };

    clear_exception();

    if let Some(handler) = find_handler(jit, &state, exception, native_ptr) {
        // The handler block reloads the exception from its reserved
        // frame slot.
        store_exception_in_frame(&state, frame, exception);
        trace!(
            "throw in {} handled at {:#x}",
            state.method.name,
            handler
        );
        return handler as u64;
    }

    signal_exception(exception);

    let base = state.entry();
    let unit = state.unit.lock().unwrap();
    let cu = unit.as_ref().expect("compiled method without a unit");

    let return_address = unsafe { *((frame + std::mem::size_of::<usize>()) as *const usize) };
    if !jit.code_map.contains(return_address) {
        // The caller is native; return through the normal protocol with
        // the exception pending.
        let (unlock_start, past_unlock) = cu.exit_past_unlock;
        let exit = base + cu.blocks[cu.exit_block].mach_offset.unwrap_or(0) as usize;
        if native_ptr >= base + unlock_start as usize
            && native_ptr < base + past_unlock as usize
        {
            return (base + past_unlock as usize) as u64;
        }
        return exit as u64;
    }

    // Unwind to the caller through this frame's unwind block, without
    // unlocking twice if the throw came from the unlock itself.
    let (unlock_start, past_unlock) = cu.unwind_past_unlock;
    let unwind = base + cu.blocks[cu.unwind_block].mach_offset.unwrap_or(0) as usize;
    if native_ptr >= base + unlock_start as usize && native_ptr < base + past_unlock as usize {
        return (base + past_unlock as usize) as u64;
    }
    unwind as u64
}

fn find_handler(
    jit: &'static Jit,
    state: &Arc<MethodState>,
    exception: ObjectRef,
    native_ptr: usize,
) -> Option<usize> {
    let base = state.entry();
    let unit = state.unit.lock().unwrap();
    let cu = unit.as_ref()?;
    let bc_offset = cu.bc_offset_for((native_ptr - base) as u32)?;

    let exception_class = unsafe { class_of(exception) }?;
    let method = &state.method;
    let class = method.class();

    for (i, entry) in method.exception_table.iter().enumerate() {
        if !entry.covers(bc_offset) {
            continue;
        }
        // catch_type 0 catches any throwable.
        if entry.catch_type != 0 {
            let name = class.constant_pool.class_ref(entry.catch_type).ok()?;
            let catch_class = jit.class_by_name(name)?;
            if !catch_class.is_assignable_from(&exception_class) {
                continue;
            }
        }
        trace!(
            "{} thrown at {}.{}:{} caught by entry {}",
            exception_class.name,
            class.name,
            method.name,
            method.line_for(bc_offset).unwrap_or(0),
            i
        );
        return Some(base + cu.eh_handlers[i] as usize);
    }
    None
}

unsafe fn class_of(obj: ObjectRef) -> Option<Arc<Class>> {
    if obj.is_null() {
        return None;
    }
    let class_word = *obj.as_raw();
    if class_word == 0 {
        return None;
    }
    let class_ptr = *(class_word as *const usize) as *const Class;
    class_ptr.as_ref().and_then(|c| Jit::get().class_by_name(&c.name))
}

/// Park the exception object in the frame's reserved spill slot, where
/// handler entry blocks expect it.
fn store_exception_in_frame(state: &Arc<MethodState>, frame: usize, exception: ObjectRef) {
    let unit = state.unit.lock().unwrap();
    if let Some(cu) = unit.as_ref() {
        let disp = cu.frame.slot_disp(cu.exception_spill_slot);
        unsafe {
            *((frame as i64 + i64::from(disp)) as *mut usize) = exception.as_raw() as usize;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {

std::arch::global_asm!(
    ".text",
    // Entered by a jmp from a method's unwind block after its epilogue:
    // rbp is the caller's frame pointer and (%rsp) is the return address
    // into the caller. Continue the throw there.
    ".globl javelin_unwind",
    ".hidden javelin_unwind",
    "javelin_unwind:",
    "mov rdi, [rsp]",
    "mov rsi, rbp",
    "and rsp, -16",
    "call throw_from_jit",
    "jmp rax",
    // Entered when a compilation failed and the trampoline guard poll
    // faulted: drop the trampoline frame, then unwind as above.
    ".globl javelin_trampoline_unwind",
    ".hidden javelin_trampoline_unwind",
    "javelin_trampoline_unwind:",
    "mov rsp, rbp",
    "pop rbp",
    "jmp javelin_unwind",
);

extern "C" {
    fn javelin_unwind();
    fn javelin_trampoline_unwind();
}

/// Address of the unwind entry jumped to by unwind blocks.
pub fn unwind_entry_addr() -> usize {
    javelin_unwind as usize
}

fn trampoline_unwind_addr() -> usize {
    javelin_trampoline_unwind as usize
}

    } else {

/// Unsupported host: unwinding needs the x86-64 thunks.
pub fn unwind_entry_addr() -> usize {
    0
}

fn trampoline_unwind_addr() -> usize {
    0
}

    }
}

// ---- bottom halves ---------------------------------------------------

fn null_pointer_bh(src: u64, frame: u64) -> u64 {
    helpers::post_exception("java/lang/NullPointerException");
    throw_from_jit(src, frame)
}

fn arithmetic_bh(src: u64, frame: u64) -> u64 {
    // Division by zero.
    helpers::post_exception("java/lang/ArithmeticException");
    throw_from_jit(src, frame)
}

fn rethrow_bh(src: u64, frame: u64) -> u64 {
    throw_from_jit(src, frame)
}

fn stack_overflow_bh(src: u64, frame: u64) -> u64 {
    helpers::post_exception("java/lang/StackOverflowError");
    throw_from_jit(src, frame)
}

fn static_field_bh(src: u64, _frame: u64) -> u64 {
    if Jit::get().fixup_static_at(src as usize) {
        // Re-execute the faulting access, now patched.
        src
    } else {
        panic!("static guard fault from unknown code at {:#x}", src);
    }
}

fn trampoline_throw_bh(_src: u64, _frame: u64) -> u64 {
    trampoline_unwind_addr() as u64
}

fn is_jit_address(addr: usize) -> bool {
    Jit::get().code_map.contains(addr)
}

fn static_guard_contains(addr: usize) -> bool {
    Jit::get().static_guard().contains(addr)
}

fn stack_probe_contains(addr: usize) -> bool {
    // Stack-overflow probe pages are the thread stacks' guard regions;
    // approximate by rejecting addresses the other routes own.
    let _ = addr;
    false
}

fn safepoint_enter(saved: &SavedRegisters) {
    crate::engine::rendezvous().enter(saved);
}

/// The router handed to the runtime's signal dispatcher.
pub fn signal_router() -> SignalRouter {
    SignalRouter {
        null_pointer_bh,
        arithmetic_bh,
        rethrow_bh,
        trampoline_throw_bh,
        static_field_bh,
        stack_overflow_bh,
        is_jit_address,
        static_guard_contains,
        stack_probe_contains,
        safepoint_enter,
    }
}
