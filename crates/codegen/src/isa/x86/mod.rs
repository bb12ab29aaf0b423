//! The x86 backends: instruction selection and binary emission for both
//! the 32-bit and 64-bit targets.

pub mod emit;
pub mod select;

pub use emit::emit_code;
pub use select::select_instructions;

#[cfg(test)]
mod emit_tests;
