//! The engine's implementation of the compiler's environment trait.

use std::sync::Arc;

use javelin_codegen::hooks::{CompileEnv, Helper, StaticFieldAddr, TlsField};
use javelin_environ::{Class, ClassInitState, Field, Method};
use javelin_runtime::{
    exception_guard_tls_offset, safepoint_poll_addr, ClassRuntime, ARRAY_DATA_OFFSET,
    ARRAY_LENGTH_OFFSET, ITABLE_RESOLVER_OFFSET,
};

use crate::engine::Jit;
use crate::helpers;

/// Borrowed view of the engine handed to the code generator.
pub struct JitEnv {
    /// The owning engine.
    pub jit: &'static Jit,
}

impl CompileEnv for JitEnv {
    fn resolve_class(&self, name: &str) -> Option<Arc<Class>> {
        self.jit.class_by_name(name)
    }

    fn method_entry(&self, method: &Arc<Method>) -> usize {
        if method.is_native() {
            if let Some(entry) = self.jit.native_entry(method) {
                return entry;
            }
        }
        self.jit.method_state(method).entry()
    }

    fn class_runtime_addr(&self, class: &Arc<Class>) -> usize {
        self.jit.class_runtime_addr(class)
    }

    fn class_object_addr(&self, class: &Arc<Class>) -> usize {
        self.jit.class_object_addr(class)
    }

    fn vtable_slot_offset(&self, index: u32) -> i32 {
        ClassRuntime::vtable_slot_offset(index)
    }

    fn itable_resolver_offset(&self) -> i32 {
        ITABLE_RESOLVER_OFFSET
    }

    fn static_field_addr(&self, class: &Arc<Class>, field: &Arc<Field>) -> StaticFieldAddr {
        let initialized = *class.init_lock.lock().unwrap() == ClassInitState::Initialized;
        match class.static_field_addr(field) {
            Some(addr) if initialized => StaticFieldAddr::Ready(addr),
            _ => StaticFieldAddr::Guarded(self.jit.static_guard_addr(field)),
        }
    }

    fn string_const(&self, value: &Arc<str>) -> usize {
        self.jit.intern_string(value)
    }

    fn helper(&self, helper: Helper) -> usize {
        helpers::helper_addr(helper)
    }

    fn tls_offset(&self, field: TlsField) -> i32 {
        match field {
            TlsField::ExceptionGuard => exception_guard_tls_offset(),
        }
    }

    fn safepoint_page(&self) -> usize {
        safepoint_poll_addr()
    }

    fn array_length_offset(&self) -> i32 {
        ARRAY_LENGTH_OFFSET
    }

    fn array_data_offset(&self) -> i32 {
        ARRAY_DATA_OFFSET
    }
}
