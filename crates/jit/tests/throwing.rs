//! Exception-table lookup and unwind-target selection, driven without
//! executing compiled code: frames are synthesised and the engine is
//! asked where execution would continue.

use std::sync::Arc;

use javelin_environ::{
    Class, ConstPool, Constant, ExceptionTableEntry, Heap, MethodFlags, MethodProto, VmType,
};
use javelin_jit::{throw_from_jit, Jit, JitOptions};
use javelin_runtime::signal_exception;

const ICONST_0: u8 = 0x03;
const ICONST_1: u8 = 0x04;
const ISTORE_0: u8 = 0x3b;
const ILOAD_0: u8 = 0x1a;
const IRETURN: u8 = 0xac;
const POP: u8 = 0x57;

fn throwable_class(name: &str) -> Arc<Class> {
    Class::link(
        name.into(),
        None,
        Vec::new(),
        ConstPool::default(),
        Vec::new(),
        Vec::new(),
    )
}

/// A method shaped like `try { v = 0 } catch (Boom e) { v = 1 }; return v`
/// — bytecode offsets 0..4 covered, handler at 4.
fn guarded_class(exception_name: &str) -> Arc<Class> {
    let pool = ConstPool::new(vec![
        Constant::Unused,
        Constant::ClassRef(exception_name.into()),
    ]);
    Class::link(
        "throwing/Guarded".into(),
        None,
        Vec::new(),
        pool,
        vec![MethodProto {
            name: "guarded".into(),
            descriptor: "()I".into(),
            args: Vec::new(),
            ret: VmType::Int,
            flags: MethodFlags::STATIC,
            code: vec![
                /* 0 */ ICONST_0,
                /* 1 */ ISTORE_0,
                /* 2 */ ILOAD_0,
                /* 3 */ IRETURN,
                /* 4 */ POP, // handler: discard the exception
                /* 5 */ ICONST_1,
                /* 6 */ ISTORE_0,
                /* 7 */ ILOAD_0,
                /* 8 */ IRETURN,
            ],
            max_stack: 1,
            max_locals: 1,
            exception_table: vec![ExceptionTableEntry {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 4,
                catch_type: 1,
            }],
            line_numbers: Vec::new(),
        }],
        Vec::new(),
    )
}

struct FakeFrame {
    words: Box<[usize]>,
}

impl FakeFrame {
    /// A frame image: slots below the frame pointer for spills, the
    /// saved-fp word, then the return address.
    fn new(return_address: usize) -> FakeFrame {
        let mut words = vec![0usize; 64].into_boxed_slice();
        words[33] = return_address;
        FakeFrame { words }
    }

    fn fp(&self) -> usize {
        &self.words[32] as *const usize as usize
    }

    fn read(&self, disp: i32) -> usize {
        let index = 32 + disp / std::mem::size_of::<usize>() as i32;
        self.words[index as usize]
    }
}

#[test]
fn matching_handler_receives_the_exception() {
    let jit = Jit::install(JitOptions::default());
    let boom = throwable_class("throwing/Boom");
    jit.register_class(&boom);
    let class = guarded_class("throwing/Boom");
    jit.register_class(&class);

    let method = Arc::clone(&class.methods[0]);
    let entry = jit.compile(&method);
    assert_ne!(entry, 0);

    let state = jit.method_state(&method);
    let (handler_native, covered_pc, slot_disp) = {
        let unit = state.unit.lock().unwrap();
        let cu = unit.as_ref().unwrap();
        // A native pc inside the covered range: the map entry for
        // bytecode offset 0.
        let covered = cu
            .bc_map
            .iter()
            .find(|&&(_, bc)| bc == 0)
            .map(|&(mach, _)| entry + mach as usize)
            .unwrap();
        (
            entry + cu.eh_handlers[0] as usize,
            covered,
            cu.frame.slot_disp(cu.exception_spill_slot),
        )
    };

    let exception = jit.heap.alloc(&boom).unwrap();
    signal_exception(exception);

    let frame = FakeFrame::new(0); // caller is not jit code
    let continuation = throw_from_jit(covered_pc as u64, frame.fp() as u64);

    assert_eq!(continuation as usize, handler_native);
    // The handler entry reloads the exception from the reserved slot.
    assert_eq!(frame.read(slot_disp), exception.as_raw() as usize);
    assert!(javelin_runtime::exception_occurred().is_none());
}

#[test]
fn unrelated_exception_unwinds_to_the_exit_path() {
    let jit = Jit::install(JitOptions::default());
    let boom = throwable_class("throwing/Boom2");
    let other = throwable_class("throwing/Other");
    jit.register_class(&boom);
    jit.register_class(&other);
    let class = guarded_class("throwing/Boom2");
    jit.register_class(&class);

    let method = Arc::clone(&class.methods[0]);
    let entry = jit.compile(&method);
    let state = jit.method_state(&method);

    let (covered_pc, exit_native) = {
        let unit = state.unit.lock().unwrap();
        let cu = unit.as_ref().unwrap();
        let covered = cu
            .bc_map
            .iter()
            .find(|&&(_, bc)| bc == 0)
            .map(|&(mach, _)| entry + mach as usize)
            .unwrap();
        let exit = entry + cu.blocks[cu.exit_block].mach_offset.unwrap() as usize;
        (covered, exit)
    };

    // The pending exception is not assignable to the catch type, and the
    // synthesized caller is native: control leaves through the exit
    // block with the exception still pending.
    let exception = jit.heap.alloc(&other).unwrap();
    signal_exception(exception);
    let frame = FakeFrame::new(0);
    let continuation = throw_from_jit(covered_pc as u64, frame.fp() as u64);

    assert_eq!(continuation as usize, exit_native);
    assert_eq!(javelin_runtime::exception_occurred(), Some(exception));
    javelin_runtime::clear_exception();
}
