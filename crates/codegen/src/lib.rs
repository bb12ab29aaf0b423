//! Javelin's code generator: JVM bytecode in, x86 machine code out.
//!
//! The pipeline is method-at-a-time and deliberately simple — no SSA, no
//! optimisation passes beyond instruction selection and linear-scan
//! register allocation:
//!
//! 1. `cfg` discovers basic blocks and their successor graph.
//! 2. `hirgen` abstract-interprets the operand stack into tree IR.
//! 3. `isa::x86::select` tiles the trees into a linear LIR stream.
//! 4. `regalloc` runs liveness and linear scan over intervals, inserting
//!    spill code and edge-resolution blocks.
//! 5. `isa::x86::emit` encodes the stream into bytes with branch
//!    backpatching; the embedding JIT publishes the result.
//!
//! Both the 32-bit and 64-bit x86 encoders are always compiled in, so
//! either target can be exercised from any host. The crate talks to the
//! rest of the VM exclusively through the [`hooks::CompileEnv`] trait.

#![warn(missing_docs)]

pub mod binemit;
pub mod bytecode;
pub mod cfg;
pub mod context;
pub mod cu;
pub mod entity;
pub mod error;
pub mod frame;
pub mod hir;
pub mod hirgen;
pub mod hooks;
pub mod isa;
pub mod lir;
pub mod regalloc;

pub use crate::context::compile_method;
pub use crate::error::{CodegenError, CodegenResult};
