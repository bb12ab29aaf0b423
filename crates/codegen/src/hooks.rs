//! The compile environment: everything the translator and selector need
//! from the running VM.
//!
//! Code generation is pure except for the addresses it bakes into the
//! instruction stream — runtime helper entry points, method entries,
//! static field locations, thread-local offsets. All of those come
//! through this trait so the crate stays testable with a stub.

use std::sync::Arc;

use javelin_environ::{Class, Field, Method};

/// Runtime helper routines callable from compiled code. All follow the
/// native calling convention of the target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Helper {
    /// `fn(exception: ObjectRef)` — post a pending exception.
    Throw,
    /// `fn()` — post a pending `ArrayIndexOutOfBoundsException`.
    ThrowArrayBounds,
    /// `fn(array, value)` — array covariance check; posts on mismatch.
    CheckArrayStore,
    /// `fn(class, object)` — posts `ClassCastException` on mismatch.
    CheckCast,
    /// `fn(class, object) -> i32`.
    InstanceOf,
    /// `fn(class) -> ObjectRef`.
    NewObject,
    /// `fn(class, length) -> ObjectRef`.
    NewArray,
    /// `fn(atype, length) -> ObjectRef`.
    NewPrimitiveArray,
    /// `fn(class, nr_dimensions, dims...) -> ObjectRef`.
    NewMultiArray,
    /// `fn(object)`.
    ObjectLock,
    /// `fn(object)`.
    ObjectUnlock,
    /// Three-way compares returning -1/0/1 in the integer return register.
    Lcmp,
    Fcmpl,
    Fcmpg,
    Dcmpl,
    Dcmpg,
    /// Floating remainder.
    Frem,
    Drem,
    /// 64-bit integer emulation used by the x86-32 backend.
    Ldiv,
    Lrem,
    Lmul,
    Lshl,
    Lshr,
    Lushr,
    /// Long/float conversions the x86-32 backend cannot do inline.
    L2f,
    L2d,
    F2l,
    D2l,
    /// `fn(receiver, signature_hash) -> entry` — x86-64 interface dispatch.
    ResolveInterface,
    /// The exception engine's unwind entry, jumped to (not called) from a
    /// method's unwind block.
    Unwind,
}

/// Per-thread state fields compiled code reads through a segment-relative
/// load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TlsField {
    /// The post-call exception poll pointer.
    ExceptionGuard,
}

/// Where a static field access should point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StaticFieldAddr {
    /// The class is initialised; the field lives here.
    Ready(usize),
    /// Not initialised yet: emit this guard-page placeholder and record a
    /// fixup site for the class-init patcher.
    Guarded(usize),
}

/// The compile-time view of the running VM.
pub trait CompileEnv {
    /// Resolve a loaded class by binary name.
    fn resolve_class(&self, name: &str) -> Option<Arc<Class>>;

    /// Current entry point of a method: compiled code if published, the
    /// method's trampoline otherwise.
    fn method_entry(&self, method: &Arc<Method>) -> usize;

    /// Address of the runtime class descriptor an object's class word
    /// points at.
    fn class_runtime_addr(&self, class: &Arc<Class>) -> usize;

    /// Address of the `java/lang/Class` mirror instance, locked by static
    /// synchronized methods.
    fn class_object_addr(&self, class: &Arc<Class>) -> usize;

    /// Displacement of virtual-table slot `index` from the class
    /// descriptor.
    fn vtable_slot_offset(&self, index: u32) -> i32;

    /// Displacement of the interface resolver stub pointer from the class
    /// descriptor (x86-32 interface dispatch).
    fn itable_resolver_offset(&self) -> i32;

    /// Where a static field access should point right now.
    fn static_field_addr(&self, class: &Arc<Class>, field: &Arc<Field>) -> StaticFieldAddr;

    /// Address of the interned string object for a string literal.
    fn string_const(&self, value: &Arc<str>) -> usize;

    /// Entry point of a runtime helper.
    fn helper(&self, helper: Helper) -> usize;

    /// Segment-relative displacement of a per-thread state field, as used
    /// with the `fs`/`gs` prefix in emitted code.
    fn tls_offset(&self, field: TlsField) -> i32;

    /// Address of the GC safepoint page probed on loop back edges.
    fn safepoint_page(&self) -> usize;

    /// Byte offset of an array's length word from the object base.
    fn array_length_offset(&self) -> i32;

    /// Byte offset of an array's first element from the object base.
    fn array_data_offset(&self) -> i32;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A compile environment with synthetic addresses, for pipeline tests.
    /// Helper entries are distinct so emitted displacements can be checked.
    #[derive(Default)]
    pub(crate) struct StubEnv {
        pub classes: Mutex<Vec<Arc<Class>>>,
        pub uninitialized_statics: bool,
    }

    impl StubEnv {
        pub fn with_classes(classes: Vec<Arc<Class>>) -> Self {
            StubEnv {
                classes: Mutex::new(classes),
                uninitialized_statics: false,
            }
        }
    }

    pub(crate) const STUB_HELPER_BASE: usize = 0x70_0000;
    pub(crate) const STUB_METHOD_BASE: usize = 0x80_0000;
    pub(crate) const STUB_STATIC_BASE: usize = 0x90_0000;
    pub(crate) const STUB_GUARD_PAGE: usize = 0xa0_0000;
    pub(crate) const STUB_SAFEPOINT_PAGE: usize = 0xb0_0000;
    pub(crate) const STUB_STRING_BASE: usize = 0xc0_0000;

    impl CompileEnv for StubEnv {
        fn resolve_class(&self, name: &str) -> Option<Arc<Class>> {
            self.classes
                .lock()
                .unwrap()
                .iter()
                .find(|c| &*c.name == name)
                .cloned()
        }

        fn method_entry(&self, method: &Arc<Method>) -> usize {
            STUB_METHOD_BASE + method.virtual_index as usize * 0x100
        }

        fn class_runtime_addr(&self, _class: &Arc<Class>) -> usize {
            0xd0_0000
        }

        fn class_object_addr(&self, _class: &Arc<Class>) -> usize {
            0xd8_0000
        }

        fn vtable_slot_offset(&self, index: u32) -> i32 {
            16 + index as i32 * 8
        }

        fn itable_resolver_offset(&self) -> i32 {
            8
        }

        fn static_field_addr(&self, _class: &Arc<Class>, field: &Arc<Field>) -> StaticFieldAddr {
            if self.uninitialized_statics {
                StaticFieldAddr::Guarded(STUB_GUARD_PAGE + field.offset as usize)
            } else {
                StaticFieldAddr::Ready(STUB_STATIC_BASE + field.offset as usize)
            }
        }

        fn string_const(&self, _value: &Arc<str>) -> usize {
            STUB_STRING_BASE
        }

        fn helper(&self, helper: Helper) -> usize {
            STUB_HELPER_BASE + helper as usize * 0x100
        }

        fn tls_offset(&self, _field: TlsField) -> i32 {
            0x30
        }

        fn safepoint_page(&self) -> usize {
            STUB_SAFEPOINT_PAGE
        }

        fn array_length_offset(&self) -> i32 {
            8
        }

        fn array_data_offset(&self) -> i32 {
            16
        }
    }
}
