//! The JNI bridge.
//!
//! Adapts an internally-typed call site to the native-interface
//! convention: establish the JNI frame, prepend the `JNIEnv*` (and the
//! class mirror for static natives), call the native, tear the frame
//! down with the return value preserved, and let the caller's guard poll
//! pick up any exception the native posted. Only the 32-bit bridge is
//! generated; built-in natives cover the 64-bit target, which reports
//! the bridge as unsupported.

use std::cell::Cell;

use javelin_codegen::isa::Target;
use javelin_environ::Method;
use javelin_runtime::{jit_text, RuntimeError};

use crate::engine::Jit;

thread_local! {
    static JNI_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Establish a JNI frame. Returns non-zero when the stack budget is
/// exhausted, which the bridge turns into `StackOverflowError`.
extern "C" fn vm_enter_jni(_method: usize, _caller_frame: usize) -> i32 {
    const MAX_JNI_DEPTH: u32 = 1024;
    JNI_DEPTH.with(|depth| {
        if depth.get() >= MAX_JNI_DEPTH {
            crate::helpers::post_exception("java/lang/StackOverflowError");
            return 1;
        }
        depth.set(depth.get() + 1);
        0
    })
}

/// Tear the JNI frame down.
extern "C" fn vm_leave_jni(_ret: usize) {
    JNI_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
}

/// Opaque `JNIEnv*` handed to natives; one per process is enough for the
/// built-in registry.
fn jni_env_addr() -> usize {
    static ENV_SLOT: usize = 0;
    &ENV_SLOT as *const usize as usize
}

/// Emit the 32-bit JNI trampoline for `method`, targeting the native
/// implementation at `native_entry`.
pub fn emit_jni_trampoline(
    target: Target,
    method: &Method,
    native_entry: usize,
) -> Result<usize, RuntimeError> {
    if target != Target::Ia32 {
        return Err(RuntimeError::Unsupported(
            "the JNI bridge is only generated for x86-32",
        ));
    }

    let mut code: Vec<u8> = Vec::with_capacity(128);
    let mut rel_calls: Vec<(usize, usize)> = Vec::new();
    let mut call = |code: &mut Vec<u8>, rel_calls: &mut Vec<(usize, usize)>, target: usize| {
        code.push(0xe8);
        rel_calls.push((code.len(), target));
        code.extend_from_slice(&[0, 0, 0, 0]);
    };

    // The return address is already on the stack; pass the method and
    // the caller frame to the enter hook.
    code.push(0x68); // push $method
    code.extend_from_slice(&((method as *const Method as usize) as u32).to_le_bytes());
    code.push(0x55); // push %ebp
    call(&mut code, &mut rel_calls, vm_enter_jni as usize);

    // Non-zero means StackOverflowError is pending; bail out.
    code.extend_from_slice(&[0x85, 0xc0]); // test %eax, %eax
    code.extend_from_slice(&[0x0f, 0x85]); // jne overflow
    let jne_field = code.len();
    code.extend_from_slice(&[0, 0, 0, 0]);

    // Clean the hook arguments.
    code.extend_from_slice(&[0x83, 0xc4, 0x08]); // add $8, %esp

    // Static natives get the class mirror as their second argument.
    let mut extra_args = 1u32;
    if method.is_static() {
        let class = method.class();
        let mirror = Jit::get().class_object_addr(&class);
        code.push(0x68);
        code.extend_from_slice(&(mirror as u32).to_le_bytes());
        extra_args += 1;
    }

    // JNIEnv* is always the first argument.
    code.push(0x68);
    code.extend_from_slice(&(jni_env_addr() as u32).to_le_bytes());

    call(&mut code, &mut rel_calls, native_entry);

    // Drop the prepended arguments, keeping the return value.
    code.extend_from_slice(&[0x83, 0xc4]);
    code.push((extra_args * 4) as u8);

    // Leave the JNI frame with eax/edx preserved.
    code.push(0x50); // push %eax
    code.push(0x52); // push %edx
    call(&mut code, &mut rel_calls, vm_leave_jni as usize);
    code.push(0x5a); // pop %edx
    code.push(0x58); // pop %eax
    code.push(0xc3); // ret

    // Stack-overflow path: clean the hook arguments and return; the
    // caller's poll faults on the pending exception.
    let overflow = code.len();
    let rel = (overflow as i64 - jne_field as i64 - 4) as i32;
    code[jne_field..jne_field + 4].copy_from_slice(&rel.to_le_bytes());
    code.extend_from_slice(&[0x83, 0xc4, 0x08]); // add $8, %esp
    code.push(0xc3); // ret

    let base = jit_text().reserve(code.len())?;
    for &(field, target_addr) in &rel_calls {
        let rel = target_addr as i64 - (base + field + 4) as i64;
        code[field..field + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), base as *mut u8, code.len());
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstone::prelude::*;
    use javelin_codegen::isa::Target;
    use javelin_environ::{Class, ConstPool, MethodFlags, MethodProto, VmType};
    use std::sync::Arc;

    #[test]
    fn x64_bridge_is_unsupported() {
        let class = Class::link(
            "T".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            vec![MethodProto {
                name: "nat".into(),
                descriptor: "()V".into(),
                args: Vec::new(),
                ret: VmType::Void,
                flags: MethodFlags::NATIVE,
                code: Vec::new(),
                max_stack: 0,
                max_locals: 0,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            }],
            Vec::new(),
        );
        assert!(matches!(
            emit_jni_trampoline(Target::X64, &class.methods[0], 0x1000),
            Err(RuntimeError::Unsupported(_))
        ));
    }

    #[test]
    fn ia32_bridge_shape() {
        let _jit = crate::engine::Jit::install(Default::default());
        let class = Class::link(
            "T".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            vec![MethodProto {
                name: "nat".into(),
                descriptor: "()V".into(),
                args: Vec::new(),
                ret: VmType::Void,
                flags: MethodFlags::NATIVE,
                code: Vec::new(),
                max_stack: 0,
                max_locals: 0,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            }],
            Vec::new(),
        );
        let addr = emit_jni_trampoline(Target::Ia32, &class.methods[0], 0x5000_0000).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 80) };
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .build()
            .unwrap();
        let decoded = cs.disasm_all(bytes, addr as u64).unwrap();
        let mnemonics: Vec<String> = decoded
            .iter()
            .map(|i| i.mnemonic().unwrap_or("").to_owned())
            .collect();
        // Frame hooks, native call, and both returns decode.
        assert!(mnemonics.iter().filter(|m| *m == "call").count() >= 3);
        assert!(mnemonics.iter().filter(|m| *m == "ret").count() >= 2);
    }
}
