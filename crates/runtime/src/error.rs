//! Runtime error type.

use thiserror::Error;

/// Failures in the runtime support layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A memory mapping could not be created or re-protected.
    #[error("memory map failed: {0}")]
    Mmap(String),

    /// The executable text arena is exhausted.
    #[error("jit text arena out of space ({requested} bytes requested)")]
    TextArenaFull {
        /// The allocation that did not fit.
        requested: usize,
    },

    /// The host platform lacks a required facility.
    #[error("unsupported on this host: {0}")]
    Unsupported(&'static str),
}
