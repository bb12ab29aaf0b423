//! Emission tests: encode whole methods and cross-check the byte stream
//! with a third-party disassembler.

use std::sync::Arc;

use capstone::prelude::*;

use javelin_environ::{
    Class, ConstPool, Constant, Field, FieldFlags, MethodFlags, MethodProto, VmType,
};

use crate::bytecode::opc::*;
use crate::cfg::analyze_control_flow;
use crate::cu::CompilationUnit;
use crate::hirgen::build_hir;
use crate::hooks::tests::StubEnv;
use crate::isa::x86::{emit_code, select_instructions};
use crate::isa::Target;
use crate::regalloc;

fn compile(code: Vec<u8>, target: Target) -> CompilationUnit {
    compile_with_env(code, target, &StubEnv::default())
}

fn compile_with_env(code: Vec<u8>, target: Target, env: &StubEnv) -> CompilationUnit {
    let class = Class::link(
        "Test".into(),
        None,
        Vec::new(),
        ConstPool::default(),
        vec![MethodProto {
            name: "test".into(),
            descriptor: "(IJ)I".into(),
            args: vec![VmType::Int, VmType::Long],
            ret: VmType::Int,
            flags: MethodFlags::STATIC,
            code,
            max_stack: 8,
            max_locals: 8,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    );
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), target);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, env).unwrap();
    select_instructions(&mut cu, env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, env).unwrap();
    cu
}

fn disasm(target: Target, bytes: &[u8]) -> Vec<(u64, String, usize)> {
    let mode = match target {
        Target::Ia32 => arch::x86::ArchMode::Mode32,
        Target::X64 => arch::x86::ArchMode::Mode64,
    };
    let cs = Capstone::new().x86().mode(mode).build().unwrap();
    let insns = cs.disasm_all(bytes, 0).unwrap();
    insns
        .iter()
        .map(|i| {
            (
                i.address(),
                i.mnemonic().unwrap_or("").to_owned(),
                i.bytes().len(),
            )
        })
        .collect()
}

/// The whole buffer must decode, with no trailing garbage.
fn assert_fully_decodes(target: Target, bytes: &[u8]) -> Vec<(u64, String, usize)> {
    let decoded = disasm(target, bytes);
    let consumed: usize = decoded.iter().map(|&(_, _, len)| len).sum();
    assert_eq!(
        consumed,
        bytes.len(),
        "disassembler stopped early: {:02x?}",
        &bytes[consumed..bytes.len().min(consumed + 8)]
    );
    decoded
}

const GREATER_THAN_ZERO: &[u8] = &[
    ILOAD_0, IFLE, 0x00, 0x07, ICONST_1, GOTO, 0x00, 0x04, ICONST_0, IRETURN,
];

#[test]
fn reference_method_decodes_on_x64() {
    let cu = compile(GREATER_THAN_ZERO.to_vec(), Target::X64);
    let decoded = assert_fully_decodes(Target::X64, cu.objcode.bytes());
    let mnemonics: Vec<&str> = decoded.iter().map(|(_, m, _)| m.as_str()).collect();
    assert!(mnemonics.contains(&"jle"));
    assert!(mnemonics.contains(&"jmp"));
    assert!(mnemonics.contains(&"ret"));
}

#[test]
fn reference_method_decodes_on_ia32() {
    let cu = compile(GREATER_THAN_ZERO.to_vec(), Target::Ia32);
    let decoded = assert_fully_decodes(Target::Ia32, cu.objcode.bytes());
    let mnemonics: Vec<&str> = decoded.iter().map(|(_, m, _)| m.as_str()).collect();
    assert!(mnemonics.contains(&"jle"));
    assert!(mnemonics.contains(&"ret"));
}

#[test]
fn block_offsets_fall_on_instruction_boundaries() {
    for target in [Target::Ia32, Target::X64] {
        let cu = compile(GREATER_THAN_ZERO.to_vec(), target);
        let decoded = assert_fully_decodes(target, cu.objcode.bytes());
        let boundaries: Vec<u64> = decoded.iter().map(|&(addr, _, _)| addr).collect();
        for &block in &cu.layout {
            let offset = cu.blocks[block].mach_offset.unwrap();
            assert!(
                boundaries.contains(&u64::from(offset)),
                "block at {} splits an instruction on {:?}",
                offset,
                target
            );
        }
    }
}

#[test]
fn conditional_branch_displacement_points_at_its_block() {
    let cu = compile(GREATER_THAN_ZERO.to_vec(), Target::X64);
    let bytes = cu.objcode.bytes();

    // The only jle in the body belongs to the first block's conditional.
    let jle_at = bytes
        .windows(2)
        .position(|w| w == [0x0f, 0x8e])
        .expect("jle emitted");
    let rel = i32::from_le_bytes([
        bytes[jle_at + 2],
        bytes[jle_at + 3],
        bytes[jle_at + 4],
        bytes[jle_at + 5],
    ]);
    let landing = (jle_at as i64 + 6 + i64::from(rel)) as u32;

    // The taken edge leads to the `iconst_0` block, directly or through
    // an edge-resolution block that ends with a jump.
    let iconst0_block = cu.layout[2];
    let target_offset = cu.blocks[iconst0_block].mach_offset.unwrap();
    if landing != target_offset {
        let resolution = cu
            .layout
            .iter()
            .find(|&&b| cu.blocks[b].mach_offset == Some(landing) && cu.blocks[b].is_resolution)
            .expect("branch lands on a resolution block");
        let _ = resolution;
    }
}

#[test]
fn empty_method_gets_prolog_and_epilog() {
    let cu = compile(vec![RETURN], Target::X64);
    let bytes = cu.objcode.bytes();
    assert_eq!(bytes[0], 0x55, "x64 prologue starts with push rbp");
    let decoded = assert_fully_decodes(Target::X64, bytes);
    assert!(decoded.iter().any(|(_, m, _)| m == "ret"));

    let cu = compile(vec![RETURN], Target::Ia32);
    let bytes = cu.objcode.bytes();
    // push edi; push esi; push ebx; push ebp; mov esp -> ebp
    assert_eq!(&bytes[..4], &[0x57, 0x56, 0x53, 0x55]);
    assert_fully_decodes(Target::Ia32, bytes);
}

#[test]
fn max_stack_zero_method_compiles() {
    let class = Class::link(
        "T".into(),
        None,
        Vec::new(),
        ConstPool::default(),
        vec![MethodProto {
            name: "nop".into(),
            descriptor: "()V".into(),
            args: Vec::new(),
            ret: VmType::Void,
            flags: MethodFlags::STATIC,
            code: vec![RETURN],
            max_stack: 0,
            max_locals: 0,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    );
    let env = StubEnv::default();
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), Target::X64);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, &env).unwrap();
    select_instructions(&mut cu, &env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, &env).unwrap();
    assert!(!cu.objcode.bytes().is_empty());
}

#[test]
fn post_call_exception_poll_is_inlined() {
    // A static call followed by the guard poll: segment prefix, load,
    // test.
    let (cu, _env) = compile_call_site(Target::X64);
    let bytes = cu.objcode.bytes();
    let poll_at = bytes
        .windows(3)
        .position(|w| w[0] == 0x64 && w[1] == 0x4c && w[2] == 0x8b)
        .expect("fs-relative guard load");
    let _ = poll_at;
}

fn compile_call_site(target: Target) -> (CompilationUnit, StubEnv) {
    let pool = ConstPool::new(vec![
        Constant::Unused,
        Constant::MethodRef {
            class: "Test".into(),
            name: "callee".into(),
            descriptor: "()I".into(),
            interface: false,
        },
    ]);
    let class = Class::link(
        "Test".into(),
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
    );
    let env = StubEnv::with_classes(vec![Arc::clone(&class)]);
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), target);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, &env).unwrap();
    select_instructions(&mut cu, &env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, &env).unwrap();
    (cu, env)
}

#[test]
fn direct_call_records_fixup_at_the_call_byte() {
    for target in [Target::Ia32, Target::X64] {
        let (cu, _) = compile_call_site(target);
        assert_eq!(cu.call_fixups.len(), 1);
        let offset = cu.call_fixups[0].mach_offset as usize;
        assert_eq!(
            cu.objcode.bytes()[offset],
            0xe8,
            "fixup must point at the call opcode on {:?}",
            target
        );
    }
}

#[test]
fn static_access_records_patchable_site() {
    let pool = ConstPool::new(vec![
        Constant::Unused,
        Constant::FieldRef {
            class: "Test".into(),
            name: "counter".into(),
            descriptor: "I".into(),
        },
    ]);
    let class = Class::link(
        "Test".into(),
        None,
        Vec::new(),
        pool,
        vec![MethodProto {
            name: "get".into(),
            descriptor: "()I".into(),
            args: Vec::new(),
            ret: VmType::Int,
            flags: MethodFlags::STATIC,
            code: vec![GETSTATIC, 0x00, 0x01, IRETURN],
            max_stack: 1,
            max_locals: 0,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        vec![Arc::new(Field {
            name: "counter".into(),
            vm_type: VmType::Int,
            flags: FieldFlags::STATIC,
            offset: 0,
        })],
    );
    let env = StubEnv {
        classes: std::sync::Mutex::new(vec![Arc::clone(&class)]),
        uninitialized_statics: true,
    };
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), Target::Ia32);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, &env).unwrap();
    select_instructions(&mut cu, &env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, &env).unwrap();

    assert_eq!(cu.static_fixups.len(), 1);
    let offset = cu.static_fixups[0].mach_offset as usize;
    // A plain 32-bit load: no REX, no SSE prefix, mod=00 r/m=101.
    assert_eq!(cu.objcode.bytes()[offset], 0x8b);
    assert_eq!(cu.objcode.bytes()[offset + 1] & 0xc7, 0x05);
}

#[test]
fn rex_w_always_set_on_64bit_stack_adjust() {
    // The 64-bit add-immediate keeps its REX.W form even for small
    // immediates, sign-extending over the whole register.
    let (cu, _) = compile_call_site(Target::X64);
    let bytes = cu.objcode.bytes();
    // A call followed by no cleanup here, but the epilogue's `add 8, rsp`
    // before the XMM pops carries REX.W 83 C4.
    assert!(
        bytes.windows(3).any(|w| w == [0x48, 0x83, 0xc4]),
        "expected REX.W add imm8, rsp"
    );
}

#[test]
fn long_return_on_ia32_materialises_pair_in_ax_dx() {
    // static long id(long): lload_0; lreturn
    let class = Class::link(
        "T".into(),
        None,
        Vec::new(),
        ConstPool::default(),
        vec![MethodProto {
            name: "id".into(),
            descriptor: "(J)J".into(),
            args: vec![VmType::Long],
            ret: VmType::Long,
            flags: MethodFlags::STATIC,
            code: vec![LLOAD_0, LRETURN],
            max_stack: 2,
            max_locals: 2,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    );
    let env = StubEnv::default();
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), Target::Ia32);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, &env).unwrap();
    select_instructions(&mut cu, &env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, &env).unwrap();
    assert_fully_decodes(Target::Ia32, cu.objcode.bytes());
}

#[test]
fn synchronized_method_wraps_body_with_lock_and_unlock() {
    let class = Class::link(
        "T".into(),
        None,
        Vec::new(),
        ConstPool::default(),
        vec![MethodProto {
            name: "locked".into(),
            descriptor: "()V".into(),
            args: Vec::new(),
            ret: VmType::Void,
            flags: MethodFlags::STATIC.union(MethodFlags::SYNCHRONIZED),
            code: vec![RETURN],
            max_stack: 0,
            max_locals: 0,
            exception_table: Vec::new(),
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    );
    let env = StubEnv::default();
    let mut cu = CompilationUnit::new(Arc::clone(&class.methods[0]), Target::X64);
    analyze_control_flow(&mut cu).unwrap();
    build_hir(&mut cu, &env).unwrap();
    select_instructions(&mut cu, &env).unwrap();
    regalloc::allocate(&mut cu).unwrap();
    emit_code(&mut cu, &env).unwrap();

    // Unlock code sits on both the exit and unwind paths.
    let (exit_start, exit_end) = cu.exit_past_unlock;
    let (unwind_start, unwind_end) = cu.unwind_past_unlock;
    assert!(exit_end > exit_start, "exit path carries the unlock");
    assert!(unwind_end > unwind_start, "unwind path carries the unlock");
    assert_fully_decodes(Target::X64, cu.objcode.bytes());
}
