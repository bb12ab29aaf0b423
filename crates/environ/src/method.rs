//! Method records.

use std::any::Any;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use crate::class::Class;
use crate::types::VmType;

/// Method access and property flags, as in the class-file `access_flags`
/// word. Only the bits the JIT consults are given names.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodFlags(u16);

impl MethodFlags {
    /// `ACC_STATIC`
    pub const STATIC: MethodFlags = MethodFlags(0x0008);
    /// `ACC_SYNCHRONIZED`
    pub const SYNCHRONIZED: MethodFlags = MethodFlags(0x0020);
    /// `ACC_NATIVE`
    pub const NATIVE: MethodFlags = MethodFlags(0x0100);
    /// `ACC_ABSTRACT`
    pub const ABSTRACT: MethodFlags = MethodFlags(0x0400);

    /// Build from the raw access-flags word.
    pub fn from_bits(bits: u16) -> Self {
        MethodFlags(bits)
    }

    /// Test whether all bits of `other` are set.
    pub fn contains(self, other: MethodFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise-or two flag sets.
    pub fn union(self, other: MethodFlags) -> MethodFlags {
        MethodFlags(self.0 | other.0)
    }
}

/// One row of a method's exception table, in class-file order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    /// Start of the covered bytecode range (inclusive).
    pub start_pc: u32,
    /// End of the covered bytecode range (exclusive).
    pub end_pc: u32,
    /// Bytecode offset of the handler.
    pub handler_pc: u32,
    /// Constant-pool index of the caught class; 0 catches everything.
    pub catch_type: u16,
}

impl ExceptionTableEntry {
    /// Does this entry cover the given bytecode offset?
    pub fn covers(&self, bc_offset: u32) -> bool {
        bc_offset >= self.start_pc && bc_offset < self.end_pc
    }
}

/// One row of the line-number table.
#[derive(Copy, Clone, Debug)]
pub struct LineNumberEntry {
    /// First bytecode offset of the line.
    pub start_pc: u32,
    /// Source line number.
    pub line: u16,
}

/// A loaded method.
///
/// The bytecode, tables, and signature are immutable after class loading.
/// The `jit_state` slot is the lazily-created per-method compiler state; it
/// is owned by the JIT crate and opaque here.
pub struct Method {
    /// Simple method name.
    pub name: Arc<str>,
    /// Raw type descriptor.
    pub descriptor: Arc<str>,
    /// Argument value types, excluding the receiver.
    pub args: Vec<VmType>,
    /// Return value type.
    pub ret: VmType,
    /// Access flags.
    pub flags: MethodFlags,
    /// Bytecode of the method body; empty for native and abstract methods.
    pub code: Vec<u8>,
    /// Operand stack depth bound from the code attribute.
    pub max_stack: u16,
    /// Local variable slot count from the code attribute.
    pub max_locals: u16,
    /// Exception table in class-file order.
    pub exception_table: Vec<ExceptionTableEntry>,
    /// Line-number table, possibly empty.
    pub line_numbers: Vec<LineNumberEntry>,
    /// Slot in the owning class's virtual dispatch table.
    pub virtual_index: u32,

    class: Weak<Class>,
    jit_state: OnceCell<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("args", &self.args)
            .field("ret", &self.ret)
            .field("flags", &self.flags)
            .field("code", &self.code)
            .field("max_stack", &self.max_stack)
            .field("max_locals", &self.max_locals)
            .field("exception_table", &self.exception_table)
            .field("line_numbers", &self.line_numbers)
            .field("virtual_index", &self.virtual_index)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

impl Method {
    /// Construct a method record. Called by `Class::link`, which wires the
    /// back-reference.
    pub(crate) fn new(proto: MethodProto, class: Weak<Class>, virtual_index: u32) -> Self {
        Method {
            name: proto.name,
            descriptor: proto.descriptor,
            args: proto.args,
            ret: proto.ret,
            flags: proto.flags,
            code: proto.code,
            max_stack: proto.max_stack,
            max_locals: proto.max_locals,
            exception_table: proto.exception_table,
            line_numbers: proto.line_numbers,
            virtual_index,
            class,
            jit_state: OnceCell::new(),
        }
    }

    /// The class that declares this method. Classes are immortal, so the
    /// back-reference always resolves.
    pub fn class(&self) -> Arc<Class> {
        self.class.upgrade().expect("declaring class unloaded")
    }

    /// `ACC_STATIC`?
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// `ACC_SYNCHRONIZED`?
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// `ACC_NATIVE`?
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    /// `ACC_ABSTRACT`?
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    /// Does this method have a body the JIT can translate?
    pub fn is_jit_eligible(&self) -> bool {
        !self.is_native() && !self.is_abstract() && !self.code.is_empty()
    }

    /// Number of 32-bit argument slots, including the receiver for instance
    /// methods. Wide types count twice. This is a slot count on every host;
    /// the 64-bit ABI classifier works from the typed signature instead.
    pub fn args_count(&self) -> u32 {
        let explicit: u32 = self.args.iter().map(|ty| ty.slot_count()).sum();
        explicit + if self.is_static() { 0 } else { 1 }
    }

    /// Hash of the method's name and descriptor, used as the interface
    /// dispatch key materialised at `invokeinterface` call sites.
    pub fn signature_hash(&self) -> u32 {
        // FNV-1a over name then descriptor.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.name.bytes().chain(self.descriptor.bytes()) {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// Source line for a bytecode offset, if the table records one.
    pub fn line_for(&self, bc_offset: u32) -> Option<u16> {
        self.line_numbers
            .iter()
            .rev()
            .find(|entry| entry.start_pc <= bc_offset)
            .map(|entry| entry.line)
    }

    /// The JIT's per-method state, created on first touch.
    pub fn jit_state<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Arc<T>,
    {
        let state = self
            .jit_state
            .get_or_init(|| -> Arc<dyn Any + Send + Sync> { init() });
        Arc::clone(state)
            .downcast::<T>()
            .expect("mismatched jit state type")
    }
}

/// The loader-facing description of a method, before it is linked into a
/// class.
pub struct MethodProto {
    /// Simple method name.
    pub name: Arc<str>,
    /// Raw type descriptor.
    pub descriptor: Arc<str>,
    /// Argument value types, excluding the receiver.
    pub args: Vec<VmType>,
    /// Return value type.
    pub ret: VmType,
    /// Access flags.
    pub flags: MethodFlags,
    /// Bytecode of the method body.
    pub code: Vec<u8>,
    /// Operand stack depth bound.
    pub max_stack: u16,
    /// Local variable slot count.
    pub max_locals: u16,
    /// Exception table.
    pub exception_table: Vec<ExceptionTableEntry>,
    /// Line-number table.
    pub line_numbers: Vec<LineNumberEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::constant_pool::ConstPool;
    use crate::types::parse_method_descriptor;

    fn method(flags: MethodFlags, descriptor: &str) -> Arc<Method> {
        let (args, ret) = parse_method_descriptor(descriptor).unwrap();
        let class = Class::link(
            "Test".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            vec![MethodProto {
                name: "m".into(),
                descriptor: descriptor.into(),
                args,
                ret,
                flags,
                code: vec![0xb1], // return
                max_stack: 0,
                max_locals: 1,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            }],
            Vec::new(),
        );
        Arc::clone(&class.methods[0])
    }

    #[test]
    fn args_count_counts_slots() {
        assert_eq!(method(MethodFlags::STATIC, "(IJ)V").args_count(), 3);
        assert_eq!(method(MethodFlags::default(), "(D)V").args_count(), 3);
        assert_eq!(method(MethodFlags::default(), "()V").args_count(), 1);
    }

    #[test]
    fn signature_hash_is_stable_and_distinguishes() {
        let a = method(MethodFlags::STATIC, "(I)V");
        let b = method(MethodFlags::STATIC, "(J)V");
        assert_eq!(a.signature_hash(), a.signature_hash());
        assert_ne!(a.signature_hash(), b.signature_hash());
    }

    #[test]
    fn back_reference_resolves() {
        let m = method(MethodFlags::STATIC, "()V");
        assert_eq!(&*m.class().name, "Test");
    }
}
