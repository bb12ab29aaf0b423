//! Error type for environment record access.

use thiserror::Error;

/// Errors raised while interrogating class records.
#[derive(Debug, Error)]
pub enum EnvironError {
    /// A constant-pool index was out of range or referred to an entry of the
    /// wrong kind.
    #[error("constant pool index {index} is not a {expected} entry")]
    BadConstant {
        /// The offending index.
        index: u16,
        /// What the caller expected to find there.
        expected: &'static str,
    },

    /// A field or method descriptor failed to parse.
    #[error("malformed descriptor `{0}`")]
    BadDescriptor(String),
}
