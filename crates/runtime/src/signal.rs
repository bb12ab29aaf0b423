//! Signal dispatch and the bottom-half mechanism.
//!
//! Hardware events become exceptions here: integer division faults as
//! SIGFPE, null dereferences as SIGSEGV at the zero page, pending-
//! exception polls as SIGSEGV at a guard page, and the GC safepoint as
//! SIGSEGV at its own page. The handler never throws from signal
//! context. Instead it installs a *bottom half*: the interrupted program
//! counter is pushed onto the thread's own stack and the context is
//! redirected to a small assembly thunk, which calls the bottom-half
//! function on the thread's stack and jumps to whatever continuation it
//! returns. To the unwind machinery the throw then looks like an
//! ordinary call.

use std::cell::Cell;

use log::error;
use once_cell::sync::OnceCell;

use crate::safepoint::{gc_safepoint_page, SavedRegisters};
use crate::thread_state::{exceptions_guard_page, trampoline_exceptions_guard_page};

/// A bottom-half: receives the interrupted program counter and frame
/// pointer, returns the address execution continues at.
pub type BottomHalf = fn(u64, u64) -> u64;

/// Hooks the JIT driver installs so the dispatcher can route faults.
pub struct SignalRouter {
    /// Throw `NullPointerException` from a zero-page access.
    pub null_pointer_bh: BottomHalf,
    /// Throw `ArithmeticException("division by zero")`.
    pub arithmetic_bh: BottomHalf,
    /// Re-dispatch a pending exception after a guard poll faulted.
    pub rethrow_bh: BottomHalf,
    /// Unwind a failed compilation out of a trampoline.
    pub trampoline_throw_bh: BottomHalf,
    /// Run the class initialiser behind a static-field guard access.
    pub static_field_bh: BottomHalf,
    /// Throw `StackOverflowError`.
    pub stack_overflow_bh: BottomHalf,
    /// Is this program counter inside published JIT code?
    pub is_jit_address: fn(usize) -> bool,
    /// Is this faulting address inside the static-field guard page?
    pub static_guard_contains: fn(usize) -> bool,
    /// Is this faulting address a stack-overflow probe page?
    pub stack_probe_contains: fn(usize) -> bool,
    /// Park the thread at a GC safepoint.
    pub safepoint_enter: fn(&SavedRegisters),
}

static ROUTER: OnceCell<SignalRouter> = OnceCell::new();

thread_local! {
    static PENDING_BH: Cell<Option<BottomHalf>> = const { Cell::new(None) };
}

/// Called from the assembly thunk, on the interrupted thread's own
/// stack.
#[no_mangle]
extern "C" fn javelin_signal_bh_dispatch(src_addr: u64, frame: u64) -> u64 {
    let bh = PENDING_BH
        .with(|cell| cell.take())
        .expect("bottom half fired with none pending");
    bh(src_addr, frame)
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {

use libc::{REG_RIP, REG_RSP};

std::arch::global_asm!(
    ".text",
    ".globl javelin_signal_bh_thunk",
    ".hidden javelin_signal_bh_thunk",
    "javelin_signal_bh_thunk:",
    // On entry the interrupted pc sits at (%rsp), pushed by the signal
    // handler. Preserve the caller-saved state the interrupted code may
    // hold, call the dispatcher with the pc, then return through the
    // continuation it produced.
    "push rbp",
    "mov rbp, rsp",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "mov rdi, [rbp + 8]",
    "mov rsi, [rbp]",
    "and rsp, -16",
    "call javelin_signal_bh_dispatch",
    "mov [rbp + 8], rax",
    "lea rsp, [rbp - 72]",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "pop rbp",
    "ret",
);

extern "C" {
    fn javelin_signal_bh_thunk();
}

/// Arrange for `bh` to run on the interrupted thread's own stack once
/// the signal handler returns.
pub fn install_signal_bh(ctx: *mut libc::c_void, bh: BottomHalf) -> Result<(), ()> {
    unsafe {
        let uc = ctx.cast::<libc::ucontext_t>();
        let gregs = &mut (*uc).uc_mcontext.gregs;
        let pc = gregs[REG_RIP as usize];

        // Push the interrupted pc for the thunk.
        gregs[REG_RSP as usize] -= 8;
        let slot = gregs[REG_RSP as usize] as *mut i64;
        *slot = pc;

        PENDING_BH.with(|cell| cell.set(Some(bh)));
        gregs[REG_RIP as usize] = javelin_signal_bh_thunk as usize as i64;
    }
    Ok(())
}

fn saved_registers(uc: &libc::ucontext_t) -> SavedRegisters {
    let gregs = &uc.uc_mcontext.gregs;
    let mut saved = SavedRegisters::default();
    for (i, slot) in saved.gprs.iter_mut().enumerate() {
        *slot = gregs[i] as u64;
    }
    saved.pc = gregs[REG_RIP as usize] as u64;
    saved.sp = gregs[REG_RSP as usize] as u64;
    saved
}

extern "C" fn sigsegv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let Some(router) = ROUTER.get() else {
        die(sig, "SIGSEGV before the signal router was installed");
    };
    let addr = unsafe { (*info).si_addr() as usize };
    let pc = unsafe {
        (*(ctx.cast::<libc::ucontext_t>())).uc_mcontext.gregs[REG_RIP as usize] as usize
    };

    // Zero-page access from compiled code is a null dereference.
    if addr < crate::mmap::page_size() {
        if (router.is_jit_address)(pc) && install_signal_bh(ctx, router.null_pointer_bh).is_ok() {
            return;
        }
        die(sig, "null dereference outside jit code");
    }

    if gc_safepoint_page(addr) {
        let saved = unsafe { saved_registers(&*(ctx.cast::<libc::ucontext_t>())) };
        (router.safepoint_enter)(&saved);
        return;
    }

    if addr == exceptions_guard_page() {
        if install_signal_bh(ctx, router.rethrow_bh).is_ok() {
            return;
        }
        die(sig, "failed to install the rethrow bottom half");
    }

    if addr == trampoline_exceptions_guard_page() {
        if install_signal_bh(ctx, router.trampoline_throw_bh).is_ok() {
            return;
        }
        die(sig, "failed to install the trampoline bottom half");
    }

    if (router.static_guard_contains)(addr) {
        if install_signal_bh(ctx, router.static_field_bh).is_ok() {
            return;
        }
        die(sig, "failed to install the static-field bottom half");
    }

    if (router.stack_probe_contains)(addr) {
        if install_signal_bh(ctx, router.stack_overflow_bh).is_ok() {
            return;
        }
        die(sig, "failed to install the stack-overflow bottom half");
    }

    die(sig, "unhandled SIGSEGV");
}

// si_code for SIGFPE signifying integer division overflow/by-zero. Not
// exposed by the `libc` crate for this target; value matches glibc's
// bits/siginfo-consts.h (shared by every other platform that defines it).
const FPE_INTDIV: libc::c_int = 1;

extern "C" fn sigfpe_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let Some(router) = ROUTER.get() else {
        die(sig, "SIGFPE before the signal router was installed");
    };
    let code = unsafe { (*info).si_code };
    if code == FPE_INTDIV && install_signal_bh(ctx, router.arithmetic_bh).is_ok() {
        return;
    }
    die(sig, "unhandled SIGFPE");
}

fn die(sig: libc::c_int, reason: &str) -> ! {
    error!("fatal signal {}: {}", sig, reason);
    std::process::abort();
}

/// Install the process's SIGSEGV and SIGFPE dispatchers and the router
/// they consult.
///
/// SIGUSR1 is blocked while the SEGV handler runs so a safepoint entered
/// through a fault cannot race the suspend protocol, and SIGUSR2 is
/// blocked by default for the resume side; both mirror the thread
/// suspension design.
pub fn setup_signal_handlers(router: SignalRouter) {
    ROUTER.set(router).ok().expect("signal router installed twice");

    unsafe {
        let mut usr_mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut usr_mask);
        libc::sigaddset(&mut usr_mask, libc::SIGUSR1);
        libc::sigaddset(&mut usr_mask, libc::SIGUSR2);

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        sa.sa_mask = usr_mask;
        sa.sa_sigaction = sigsegv_handler as usize;
        libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = sigfpe_handler as usize;
        libc::sigaction(libc::SIGFPE, &sa, std::ptr::null_mut());

        let mut block: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, libc::SIGUSR2);
        libc::pthread_sigmask(libc::SIG_BLOCK, &block, std::ptr::null_mut());
    }
}

    } else {

/// Bottom halves require a known signal-context layout; this host has
/// none wired up.
pub fn install_signal_bh(_ctx: *mut core::ffi::c_void, _bh: BottomHalf) -> Result<(), ()> {
    Err(())
}

/// No-op on hosts without a signal-context recipe.
pub fn setup_signal_handlers(router: SignalRouter) {
    ROUTER.set(router).ok();
    error!("signal-driven exceptions are not wired up on this host");
}

    }
}
