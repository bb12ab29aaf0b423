//! Runtime support fabric for the Javelin JIT.
//!
//! Everything the compiled code leans on at run time lives here: the
//! executable text arena, guard pages and the per-thread exception state
//! they arm, the signal dispatcher with its bottom-half mechanism, the GC
//! safepoint rendezvous, thread bookkeeping, per-object monitors, and a
//! simple object heap. The compiler proper never calls into this crate;
//! the JIT driver wires the two together.

#![warn(missing_docs)]

mod class_runtime;
mod error;
mod guard_page;
mod heap;
mod mmap;
mod monitor;
mod safepoint;
mod signal;
mod text;
mod thread_state;
mod threads;

pub use crate::class_runtime::{ClassRuntime, CLASS_WORD_OFFSET, ITABLE_RESOLVER_OFFSET, VTABLE_OFFSET};
pub use crate::error::RuntimeError;
pub use crate::guard_page::GuardPage;
pub use crate::heap::{SimpleHeap, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET};
pub use crate::mmap::Mmap;
pub use crate::monitor::MonitorTable;
pub use crate::safepoint::{gc_safepoint_page, safepoint_poll_addr, GcRendezvous, SavedRegisters};
pub use crate::signal::{install_signal_bh, setup_signal_handlers, SignalRouter};
pub use crate::text::{jit_text, TextArena};
pub use crate::thread_state::{
    clear_exception, exception_guard_tls_offset, exception_occurred, exceptions_guard_page,
    init_exceptions, signal_exception, thread_init_exceptions,
    trampoline_exception_occurred, trampoline_exceptions_guard_page,
    trampoline_guard_tls_offset,
};
pub use crate::threads::{JavaThread, ThreadRegistry};
