//! The runtime class descriptor compiled code dispatches through.
//!
//! Every heap object's first word points at one of these. The layout is
//! part of the compiled-code ABI: virtual dispatch loads the class word,
//! then a vtable slot at a fixed displacement; interface dispatch on
//! x86-32 loads the resolver stub pointer instead.

use std::sync::Arc;

use javelin_environ::Class;

/// Offset of the class word inside an object (`&obj->class == obj`).
pub const CLASS_WORD_OFFSET: i32 = 0;
/// Offset of the itable resolver stub pointer in the descriptor.
pub const ITABLE_RESOLVER_OFFSET: i32 = std::mem::size_of::<usize>() as i32;
/// Offset of the first vtable slot in the descriptor.
pub const VTABLE_OFFSET: i32 = 2 * std::mem::size_of::<usize>() as i32;

/// The descriptor: a class back-pointer, the interface resolver stub, and
/// the virtual dispatch table, laid out as consecutive words.
#[repr(C)]
pub struct ClassRuntime {
    words: Box<[usize]>,
}

impl ClassRuntime {
    /// Build a descriptor with `vtable_len` dispatch slots, all pointing
    /// at `default_entry` (typically each method's trampoline is
    /// installed right after).
    pub fn new(class: &Arc<Class>, vtable_len: usize, default_entry: usize) -> ClassRuntime {
        let mut words = vec![0usize; 2 + vtable_len];
        words[0] = Arc::as_ptr(class) as usize;
        words[1] = 0;
        for slot in &mut words[2..] {
            *slot = default_entry;
        }
        ClassRuntime {
            words: words.into_boxed_slice(),
        }
    }

    /// The address compiled code uses as the class word.
    pub fn addr(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Displacement of vtable slot `index` from the descriptor base.
    pub fn vtable_slot_offset(index: u32) -> i32 {
        VTABLE_OFFSET + index as i32 * std::mem::size_of::<usize>() as i32
    }

    /// Install a method entry into a vtable slot.
    pub fn set_vtable_slot(&mut self, index: u32, entry: usize) {
        self.words[2 + index as usize] = entry;
    }

    /// Read a vtable slot.
    pub fn vtable_slot(&self, index: u32) -> usize {
        self.words[2 + index as usize]
    }

    /// Install the interface resolver stub.
    pub fn set_itable_resolver(&mut self, stub: usize) {
        self.words[1] = stub;
    }

    /// The environment class this descriptor mirrors.
    ///
    /// # Safety
    ///
    /// Valid only while the class (immortal by construction) is alive.
    pub unsafe fn class(&self) -> *const Class {
        self.words[0] as *const Class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use javelin_environ::ConstPool;

    #[test]
    fn layout_offsets_match_accessors() {
        let class = Class::link(
            "T".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            Vec::new(),
            Vec::new(),
        );
        let mut rt = ClassRuntime::new(&class, 3, 0x1111);
        rt.set_vtable_slot(1, 0x2222);
        rt.set_itable_resolver(0x3333);

        let base = rt.addr();
        unsafe {
            let word = |disp: i32| *((base as i64 + i64::from(disp)) as *const usize);
            assert_eq!(word(ITABLE_RESOLVER_OFFSET), 0x3333);
            assert_eq!(word(ClassRuntime::vtable_slot_offset(0)), 0x1111);
            assert_eq!(word(ClassRuntime::vtable_slot_offset(1)), 0x2222);
        }
    }
}
