//! The Javelin JIT driver.
//!
//! This crate glues the code generator to the runtime fabric: it owns the
//! lazy-compilation trampolines, drives the per-method pipeline under the
//! unit lock, publishes code into the executable text arena, patches
//! direct call sites and static-field accesses, emits the x86-32
//! interface resolver stubs and the JNI bridge, and implements the
//! exception engine's unwind walk over JIT frames.

#![warn(missing_docs)]

mod code_map;
mod engine;
mod env;
mod exception;
mod gdb;
mod helpers;
mod itable;
mod jni;
mod state;
mod trampoline;

pub use crate::code_map::CodeMap;
pub use crate::engine::{Jit, JitOptions};
pub use crate::exception::throw_from_jit;
pub use crate::itable::{emit_itable_resolver_stub, ItableEntry};
pub use crate::jni::emit_jni_trampoline;
pub use crate::state::MethodState;
pub use crate::trampoline::Trampoline;
