//! End-to-end lazy compilation and call-site patching.

use std::sync::Arc;

use javelin_environ::{Class, ConstPool, Constant, MethodFlags, MethodProto, VmType};
use javelin_jit::{Jit, JitOptions};

// Bytecode opcodes used below.
const ICONST_0: u8 = 0x03;
const IRETURN: u8 = 0xac;
const INVOKESTATIC: u8 = 0xb8;

fn caller_callee_class() -> Arc<Class> {
    let pool = ConstPool::new(vec![
        Constant::Unused,
        Constant::MethodRef {
            class: "patching/Test".into(),
            name: "callee".into(),
            descriptor: "()I".into(),
            interface: false,
        },
    ]);
    Class::link(
        "patching/Test".into(),
        None,
        Vec::new(),
        pool,
        vec![
            MethodProto {
                name: "caller".into(),
                descriptor: "()I".into(),
                args: Vec::new(),
                ret: VmType::Int,
                flags: MethodFlags::STATIC,
                code: vec![INVOKESTATIC, 0x00, 0x01, IRETURN],
                max_stack: 1,
                max_locals: 0,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            },
            MethodProto {
                name: "callee".into(),
                descriptor: "()I".into(),
                args: Vec::new(),
                ret: VmType::Int,
                flags: MethodFlags::STATIC,
                code: vec![ICONST_0, IRETURN],
                max_stack: 1,
                max_locals: 0,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            },
        ],
        Vec::new(),
    )
}

/// Resolve the rel32 of the 5-byte call at `site`.
fn call_target(site: usize) -> usize {
    unsafe {
        assert_eq!(*(site as *const u8), 0xe8, "site must be a call");
        let rel = ((site + 1) as *const u32).read_unaligned() as i32;
        (site as i64 + 5 + i64::from(rel)) as usize
    }
}

#[test]
fn direct_call_site_is_patched_when_the_callee_compiles() {
    let jit = Jit::install(JitOptions::default());
    let class = caller_callee_class();
    jit.register_class(&class);

    let caller = Arc::clone(class.method("caller", "()I").unwrap());
    let callee = Arc::clone(class.method("callee", "()I").unwrap());

    // Compile the caller while the callee is only a trampoline.
    let caller_entry = jit.compile(&caller);
    assert_ne!(caller_entry, 0);

    let caller_state = jit.method_state(&caller);
    let callee_state = jit.method_state(&callee);
    assert!(!callee_state.is_compiled());

    let site = {
        let unit = caller_state.unit.lock().unwrap();
        let cu = unit.as_ref().expect("caller unit kept");
        assert_eq!(cu.call_fixups.len(), 1);
        caller_entry + cu.call_fixups[0].mach_offset as usize
    };

    // Before: the call targets the callee's trampoline.
    assert_eq!(call_target(site), callee_state.trampoline.addr());
    assert_eq!(callee_state.trampoline.nr_fixup_sites(), 1);

    // Compile the callee; the site must now target the real entry.
    let callee_entry = jit.compile(&callee);
    assert_ne!(callee_entry, 0);
    assert_ne!(callee_entry, callee_state.trampoline.addr());
    assert_eq!(call_target(site), callee_entry);

    // Law: the fixup list is drained, and repatching is a no-op.
    assert_eq!(callee_state.trampoline.nr_fixup_sites(), 0);
    callee_state.trampoline.fixup_direct_calls(callee_entry);
    assert_eq!(call_target(site), callee_entry);
}

#[test]
fn compiling_twice_returns_the_same_entry() {
    let jit = Jit::install(JitOptions::default());
    let pool = ConstPool::new(vec![Constant::Unused]);
    let class = Class::link(
        "patching/Twice".into(),
        None,
        Vec::new(),
        pool,
        vec![MethodProto {
            name: "m".into(),
            descriptor: "()I".into(),
            args: Vec::new(),
            ret: VmType::Int,
            flags: MethodFlags::STATIC,
            code: vec![ICONST_0, IRETURN],
            max_stack: 1,
            max_locals: 0,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    );
    jit.register_class(&class);
    let method = Arc::clone(&class.methods[0]);
    let first = jit.compile(&method);
    let second = jit.compile(&method);
    assert_eq!(first, second);
    assert_ne!(first, 0);
}
