//! Stack frame layout.
//!
//! Frames are frame-pointer relative. Bytecode locals and compiler
//! temporaries live below the frame pointer; on x86-32, parameter locals
//! are addressed in the caller's argument area above the saved return
//! address instead, exactly where the calling convention pushed them. On
//! x86-64 the prologue stores every argument into its local slot, so all
//! locals are frame-local.

use crate::entity::{entity_impl, EntityRef, PrimaryMap};
use crate::isa::Target;

/// Reference to an allocated spill slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);
entity_impl!(SlotId, "slot");

#[derive(Clone, Debug)]
struct SlotData {
    start_word: u32,
    words: u32,
}

/// Offset of the argument area from the frame pointer on x86-32: saved
/// ebp, ebx, esi, edi, and the return address.
const IA32_ARGS_DISP: i32 = 20;

/// The stack frame of one method: bytecode locals, compiler temporaries,
/// and spill slots. Grows as the register allocator requests slots.
#[derive(Clone, Debug)]
pub struct StackFrame {
    target: Target,
    /// 32-bit argument slots, receiver included.
    args_count: u32,
    /// Bytecode local slots, parameters included.
    max_locals: u32,
    /// Frame words handed out so far (locals plus slots).
    frame_words: u32,
    slots: PrimaryMap<SlotId, SlotData>,
}

impl StackFrame {
    /// Create a frame for a method with the given argument-slot and local
    /// counts.
    pub fn new(target: Target, args_count: u32, max_locals: u32) -> Self {
        let local_words = match target {
            // Parameter locals stay in the caller's argument area.
            Target::Ia32 => max_locals.saturating_sub(args_count),
            // One 8-byte word per bytecode slot; wide values use the first.
            Target::X64 => max_locals,
        };
        StackFrame {
            target,
            args_count,
            max_locals,
            frame_words: local_words,
            slots: PrimaryMap::new(),
        }
    }

    fn word_size(&self) -> i32 {
        self.target.word_size() as i32
    }

    /// Total frame words the prologue must reserve below the frame pointer.
    pub fn frame_words(&self) -> u32 {
        self.frame_words
    }

    /// Frame size in bytes for the prologue's stack adjustment.
    pub fn locals_size(&self) -> u32 {
        self.frame_words * self.target.word_size()
    }

    /// Displacement of bytecode local `index` from the frame pointer.
    pub fn local_disp(&self, index: u16, wide: bool) -> i32 {
        let index = u32::from(index);
        debug_assert!(index < self.max_locals);
        match self.target {
            Target::Ia32 => {
                if index < self.args_count {
                    // In the caller's argument area, pushed left-to-right
                    // from the frame's point of view.
                    IA32_ARGS_DISP + index as i32 * 4
                } else {
                    let frame_index = index - self.args_count;
                    // A wide value occupies this slot and the next one;
                    // address the lower of the two.
                    let words = if wide { 2 } else { 1 };
                    -((frame_index as i32 + words) * 4)
                }
            }
            Target::X64 => -((index as i32 + 1) * 8),
        }
    }

    /// Displacement of the receiver slot, used by synchronized-method
    /// unlock paths.
    pub fn this_disp(&self) -> i32 {
        self.local_disp(0, false)
    }

    /// Allocate a 32-bit spill slot.
    pub fn alloc_slot_32(&mut self) -> SlotId {
        let words = match self.target {
            Target::Ia32 => 1,
            Target::X64 => 1,
        };
        self.alloc_slot(words)
    }

    /// Allocate a 64-bit spill slot.
    pub fn alloc_slot_64(&mut self) -> SlotId {
        let words = match self.target {
            Target::Ia32 => 2,
            Target::X64 => 1,
        };
        self.alloc_slot(words)
    }

    fn alloc_slot(&mut self, words: u32) -> SlotId {
        let start_word = self.frame_words;
        self.frame_words += words;
        self.slots.push(SlotData { start_word, words })
    }

    /// Displacement of an allocated slot from the frame pointer.
    pub fn slot_disp(&self, slot: SlotId) -> i32 {
        let data = &self.slots[slot];
        -((data.start_word + data.words) as i32 * self.word_size())
    }

    /// Number of argument slots (for the x86-64 prologue's argument spill).
    pub fn args_count(&self) -> u32 {
        self.args_count
    }

    /// Number of bytecode locals.
    pub fn max_locals(&self) -> u32 {
        self.max_locals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ia32_params_live_in_caller_frame() {
        let frame = StackFrame::new(Target::Ia32, 2, 4);
        assert_eq!(frame.local_disp(0, false), 20);
        assert_eq!(frame.local_disp(1, false), 24);
        // Non-parameter locals below the frame pointer.
        assert_eq!(frame.local_disp(2, false), -4);
        assert_eq!(frame.local_disp(3, false), -8);
    }

    #[test]
    fn x64_locals_are_all_frame_local() {
        let frame = StackFrame::new(Target::X64, 2, 3);
        assert_eq!(frame.local_disp(0, false), -8);
        assert_eq!(frame.local_disp(2, false), -24);
        assert_eq!(frame.locals_size(), 24);
    }

    #[test]
    fn spill_slots_grow_the_frame() {
        let mut frame = StackFrame::new(Target::Ia32, 0, 1);
        let a = frame.alloc_slot_32();
        let b = frame.alloc_slot_64();
        assert_eq!(frame.slot_disp(a), -8);
        assert_eq!(frame.slot_disp(b), -16);
        assert_eq!(frame.locals_size(), 16);
    }
}
