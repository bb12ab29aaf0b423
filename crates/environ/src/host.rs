//! Interfaces to the JIT's collaborators.
//!
//! The compiler core never allocates objects, parks threads, or resolves
//! native methods itself; it calls through these traits. The runtime crate
//! provides real implementations; tests substitute stubs.

use std::sync::Arc;
use std::time::Duration;

use crate::class::Class;

/// A reference to a heap object.
///
/// The heap guarantees that the first word of every object is its class
/// slot, so a reference doubles as a pointer to the class word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectRef(*mut usize);

// Object references are handed between mutator threads by design; the heap
// owns the pointees.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// The null reference.
    pub const fn null() -> ObjectRef {
        ObjectRef(std::ptr::null_mut())
    }

    /// Wrap a raw object pointer.
    pub const fn from_raw(ptr: *mut usize) -> ObjectRef {
        ObjectRef(ptr)
    }

    /// The raw object pointer.
    pub fn as_raw(self) -> *mut usize {
        self.0
    }

    /// Is this the null reference?
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// The object heap.
pub trait Heap: Send + Sync {
    /// Allocate a zeroed instance of `class` with its class slot installed.
    fn alloc(&self, class: &Arc<Class>) -> Option<ObjectRef>;

    /// Allocate a reference array.
    fn alloc_array(&self, element: &Arc<Class>, length: usize) -> Option<ObjectRef>;

    /// Allocate a primitive array from an element type tag.
    fn alloc_primitive_array(&self, atype: u8, length: usize) -> Option<ObjectRef>;

    /// Build a string object from UTF-8 bytes.
    fn alloc_string(&self, bytes: &[u8]) -> Option<ObjectRef>;
}

/// Per-object monitors. Locks are re-entrant; unlocking from a non-owner
/// thread is an error surfaced as `Err(())` and turned into an
/// `IllegalMonitorStateException` by the runtime.
pub trait ObjectLocking: Send + Sync {
    /// Acquire the object's monitor, blocking as needed.
    fn lock(&self, obj: ObjectRef);
    /// Release the object's monitor.
    fn unlock(&self, obj: ObjectRef) -> Result<(), ()>;
    /// Wait on the monitor, optionally with a timeout.
    fn wait(&self, obj: ObjectRef, timeout: Option<Duration>) -> Result<(), ()>;
    /// Wake one waiter.
    fn notify(&self, obj: ObjectRef) -> Result<(), ()>;
    /// Wake all waiters.
    fn notify_all(&self, obj: ObjectRef) -> Result<(), ()>;
}

/// The thread model's view of one thread.
pub trait VmThread: Send + Sync {
    /// Thread name, for diagnostics.
    fn name(&self) -> String;
    /// Daemon threads do not keep the VM alive.
    fn is_daemon(&self) -> bool;
    /// Set the interrupt flag and wake the thread if it is waiting.
    fn interrupt(&self);
    /// Read and clear the interrupt flag.
    fn interrupted(&self) -> bool;
    /// Read the interrupt flag without clearing it.
    fn is_interrupted(&self) -> bool;
}

/// A built-in native method implementation.
pub type NativeFn = *const u8;

/// Registry of built-in natives. A hit is called directly with the VM's
/// internal convention; a miss falls through to JNI resolution.
pub trait NativeRegistry: Send + Sync {
    /// Look up a built-in implementation.
    fn lookup_native(&self, class_name: &str, method_name: &str) -> Option<NativeFn>;
}
