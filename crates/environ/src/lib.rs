//! Standalone environment for the Javelin JIT compiler.
//!
//! This crate defines the records the compiler consumes — classes, methods,
//! fields, and constant pools — together with the narrow traits through which
//! the core talks to its collaborators: the object heap, per-object monitors,
//! the thread model, and the registry of built-in native methods.
//!
//! The records arrive fully constructed from a class loader; no parsing
//! happens here. Classes are immortal once loaded, so `Arc` cycles between a
//! class and its methods are deliberate and never collected.

#![warn(missing_docs)]

mod class;
mod constant_pool;
mod error;
mod host;
mod method;
mod types;

pub use crate::class::{Class, ClassInitState, Field, FieldFlags};
pub use crate::constant_pool::{ConstPool, Constant};
pub use crate::error::EnvironError;
pub use crate::host::{Heap, NativeFn, NativeRegistry, ObjectLocking, ObjectRef, VmThread};
pub use crate::method::{ExceptionTableEntry, LineNumberEntry, Method, MethodFlags, MethodProto};
pub use crate::types::{parse_method_descriptor, VmType};
