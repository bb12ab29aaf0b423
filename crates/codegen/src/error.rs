//! Compilation error type.

use thiserror::Error;

/// A compilation failure.
///
/// Verification failures mark the method uncompilable; the runtime raises
/// `VerifyError` when the method is next invoked.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The bytecode failed verification: malformed encodings, branches to
    /// offsets outside the method or into the middle of an instruction,
    /// or inconsistent operand-stack shapes.
    #[error("verifier rejected method: {0}")]
    Verifier(String),

    /// A constant-pool reference could not be resolved.
    #[error("constant pool: {0}")]
    ConstantPool(#[from] javelin_environ::EnvironError),

    /// The method uses a feature the code generator does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An implementation limit was exceeded (code size, block count).
    #[error("implementation limit exceeded: {0}")]
    ImplLimitExceeded(&'static str),
}

/// Convenient alias used throughout the code generator.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Build a verifier error from format arguments.
macro_rules! verify_err {
    ($($arg:tt)*) => {
        $crate::error::CodegenError::Verifier(format!($($arg)*))
    };
}

pub(crate) use verify_err;
