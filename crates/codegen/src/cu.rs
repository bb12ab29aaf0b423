//! The per-method compilation unit.
//!
//! Created lazily on first invocation, the unit owns everything the
//! pipeline produces: basic blocks, virtual registers, the stack frame,
//! fixup records, and finally the object code buffer. All cross-references
//! are entity ids into the unit's own tables.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use javelin_environ::{Class, Field, Method, VmType};

use crate::binemit::CodeBuffer;
use crate::entity::{entity_impl, EntityRef, PrimaryMap};
use crate::frame::{SlotId, StackFrame};
use crate::hir::Stmt;
use crate::isa::{MachReg, Target};
use crate::lir::InsnData;

/// Reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// Reference to a virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// A pending branch displacement, waiting for its target block to be
/// emitted.
#[derive(Copy, Clone, Debug)]
pub struct BranchFixup {
    /// Buffer offset of the branch instruction's first byte.
    pub branch_offset: u32,
    /// Offset of the rel32 field within the instruction.
    pub field_offset: u32,
    /// Total encoded size of the branch instruction.
    pub insn_size: u32,
}

/// One basic block: a bytecode range, its CFG edges, and the statement and
/// instruction lists the pipeline fills in.
#[derive(Clone, Debug, Default)]
pub struct BasicBlockData {
    /// First covered bytecode offset.
    pub start: u32,
    /// One past the last covered bytecode offset.
    pub end: u32,
    /// Successor blocks, in branch order (fall-through last for
    /// conditional exits).
    pub successors: SmallVec<[BlockId; 2]>,
    /// Predecessor blocks.
    pub predecessors: SmallVec<[BlockId; 4]>,
    /// Tree statements from the HIR builder, tagged with the bytecode
    /// offset they were translated from.
    pub stmts: Vec<(u32, Stmt)>,
    /// Linear instructions from the selector.
    pub insns: Vec<InsnData>,
    /// Is this block an exception-handler entry?
    pub is_eh_entry: bool,
    /// Was this block synthesised by edge resolution?
    pub is_resolution: bool,
    /// Native offset of the block head once emitted.
    pub mach_offset: Option<u32>,
    /// Branches waiting for this block's offset.
    pub backpatch: Vec<BranchFixup>,
}

impl BasicBlockData {
    /// An empty block covering `[start, end)`.
    pub fn new(start: u32, end: u32) -> Self {
        BasicBlockData {
            start,
            end,
            ..Default::default()
        }
    }

    /// Has the emitter placed this block yet?
    pub fn is_emitted(&self) -> bool {
        self.mach_offset.is_some()
    }
}

/// Register(s) backing an HIR temporary.
#[derive(Copy, Clone, Debug)]
pub enum TempLoc {
    /// One general-purpose register.
    Gpr(VReg),
    /// A low/high pair (x86-32 longs).
    Pair(VReg, VReg),
    /// An XMM register.
    Xmm(VReg),
}

/// A virtual register.
#[derive(Clone, Debug)]
pub struct VRegData {
    /// Value type, which fixes the register class and width.
    pub ty: VmType,
    /// Pre-colored machine register, for ABI- and ISA-pinned values.
    pub fixed: Option<MachReg>,
}

/// A direct call site to patch once its target method is compiled.
#[derive(Clone)]
pub struct CallFixupSite {
    /// The method the call site targets.
    pub target: Arc<Method>,
    /// Offset of the call instruction in the unit's object code.
    pub mach_offset: u32,
}

/// A static-field access site to patch once the class is initialised.
#[derive(Clone)]
pub struct StaticFixupSite {
    /// The class whose initialisation resolves this site.
    pub class: Arc<Class>,
    /// The accessed field.
    pub field: Arc<Field>,
    /// Byte offset into the field's storage (4 for the high word of a
    /// split 64-bit access on x86-32).
    pub word_offset: u32,
    /// Offset of the access instruction in the unit's object code.
    pub mach_offset: u32,
}

/// The per-method compilation unit.
pub struct CompilationUnit {
    /// The compiled method.
    pub method: Arc<Method>,
    /// Compilation target.
    pub target: Target,
    /// All blocks, including the synthetic exit and unwind blocks and any
    /// resolution blocks.
    pub blocks: PrimaryMap<BlockId, BasicBlockData>,
    /// Emission order of the bytecode-derived blocks.
    pub layout: Vec<BlockId>,
    /// Normal return path: unlock for synchronized methods, epilogue.
    pub exit_block: BlockId,
    /// Exception propagation path to the caller.
    pub unwind_block: BlockId,
    /// The method's stack frame.
    pub frame: StackFrame,
    /// Virtual registers.
    pub vregs: PrimaryMap<VReg, VRegData>,
    /// Pre-colored vregs, one per machine register, created eagerly so
    /// pinned operands can always be expressed.
    pub fixed_vregs: Vec<VReg>,
    /// Slot the unwind path stores the in-flight exception into.
    pub exception_spill_slot: SlotId,
    /// HIR temporary id to frame slot map; only the reserved exception
    /// temporary lives here, everything else maps to virtual registers.
    pub temp_slots: FxHashMap<u32, SlotId>,
    /// HIR temporary id to virtual register map.
    pub temp_regs: FxHashMap<u32, TempLoc>,
    /// Shared 64-bit scratch slot for constant materialisation.
    scratch_slot: Option<SlotId>,
    /// Pending direct-call patches.
    pub call_fixups: Vec<CallFixupSite>,
    /// Pending static-field patches.
    pub static_fixups: Vec<StaticFixupSite>,
    /// `(native offset, bytecode offset)` map, sorted by native offset.
    pub bc_map: Vec<(u32, u32)>,
    /// Native offset of each exception-table entry's handler, filled after
    /// emission.
    pub eh_handlers: Vec<u32>,
    /// Native offsets `[exit, exit_past_unlock)` and
    /// `[unwind, unwind_past_unlock)` bracketing the monitor-release code
    /// on each path; equal bounds when the method is not synchronized.
    pub exit_past_unlock: (u32, u32),
    /// See `exit_past_unlock`.
    pub unwind_past_unlock: (u32, u32),
    /// The emitted object code.
    pub objcode: CodeBuffer,
    /// LIR position past the last instruction.
    pub last_insn_pos: u32,
    /// Set once control-flow analysis has populated `blocks`.
    pub is_analyzed: bool,
    /// Set once the unit's code has been published.
    pub is_compiled: bool,
}

impl CompilationUnit {
    /// Create the unit for a method: synthetic blocks, frame, fixed vregs,
    /// and the reserved exception spill slot.
    pub fn new(method: Arc<Method>, target: Target) -> Self {
        let mut blocks = PrimaryMap::new();
        let exit_block = blocks.push(BasicBlockData::new(0, 0));
        let unwind_block = blocks.push(BasicBlockData::new(0, 0));

        let mut frame = StackFrame::new(
            target,
            method.args_count(),
            u32::from(method.max_locals),
        );
        let exception_spill_slot = frame.alloc_slot_32();

        let mut vregs = PrimaryMap::new();
        let mut fixed_vregs = Vec::with_capacity(MachReg::COUNT);
        for index in 0..MachReg::COUNT {
            let reg = MACH_REGS[index];
            let ty = if reg.is_xmm() {
                VmType::Double
            } else if target.has_64bit_gprs() {
                VmType::Long
            } else {
                VmType::Int
            };
            fixed_vregs.push(vregs.push(VRegData {
                ty,
                fixed: Some(reg),
            }));
        }

        CompilationUnit {
            method,
            target,
            blocks,
            layout: Vec::new(),
            exit_block,
            unwind_block,
            frame,
            vregs,
            fixed_vregs,
            exception_spill_slot,
            temp_slots: FxHashMap::default(),
            temp_regs: FxHashMap::default(),
            scratch_slot: None,
            call_fixups: Vec::new(),
            static_fixups: Vec::new(),
            bc_map: Vec::new(),
            eh_handlers: Vec::new(),
            exit_past_unlock: (0, 0),
            unwind_past_unlock: (0, 0),
            objcode: CodeBuffer::new(),
            last_insn_pos: 0,
            is_analyzed: false,
            is_compiled: false,
        }
    }

    /// Allocate a fresh virtual register.
    pub fn new_vreg(&mut self, ty: VmType) -> VReg {
        self.vregs.push(VRegData { ty, fixed: None })
    }

    /// The pre-colored vreg pinned to a machine register.
    pub fn fixed_vreg(&self, reg: MachReg) -> VReg {
        self.fixed_vregs[reg.index()]
    }

    /// Find the block containing a bytecode offset. Synthetic blocks are
    /// never returned.
    pub fn find_block(&self, bc_offset: u32) -> Option<BlockId> {
        self.layout
            .iter()
            .copied()
            .find(|&block| {
                let data = &self.blocks[block];
                bc_offset >= data.start && bc_offset < data.end
            })
    }

    /// Number of bytecode-derived blocks.
    pub fn nr_blocks(&self) -> usize {
        self.layout.len()
    }

    /// The shared scratch slot, allocated on first use.
    pub fn scratch_slot(&mut self) -> SlotId {
        if let Some(slot) = self.scratch_slot {
            return slot;
        }
        let slot = self.frame.alloc_slot_64();
        self.scratch_slot = Some(slot);
        slot
    }

    /// The frame slot backing a slot-pinned temporary (the exception
    /// temporary), allocated on first use.
    pub fn temp_slot(&mut self, id: u32, ty: VmType) -> SlotId {
        if let Some(&slot) = self.temp_slots.get(&id) {
            return slot;
        }
        let slot = if ty.is_wide() {
            self.frame.alloc_slot_64()
        } else {
            self.frame.alloc_slot_32()
        };
        self.temp_slots.insert(id, slot);
        slot
    }

    /// The virtual registers backing an HIR temporary, created on first
    /// use.
    pub fn temp_loc(&mut self, id: u32, ty: VmType, pair_longs: bool) -> TempLoc {
        if let Some(&loc) = self.temp_regs.get(&id) {
            return loc;
        }
        let loc = match ty.stack_type() {
            VmType::Float | VmType::Double => TempLoc::Xmm(self.new_vreg(VmType::Double)),
            VmType::Long if pair_longs => {
                TempLoc::Pair(self.new_vreg(VmType::Int), self.new_vreg(VmType::Int))
            }
            other => TempLoc::Gpr(self.new_vreg(other)),
        };
        self.temp_regs.insert(id, loc);
        loc
    }

    /// Assign LIR positions in emission order, in steps of two so later
    /// passes can insert instructions between existing ones.
    pub fn compute_insn_positions(&mut self) {
        let mut pos = 0;
        for i in 0..self.layout.len() {
            let block = self.layout[i];
            for insn in self.blocks[block].insns.iter_mut() {
                insn.pos = pos;
                pos += 2;
            }
        }
        for block in [self.exit_block, self.unwind_block] {
            for insn in self.blocks[block].insns.iter_mut() {
                insn.pos = pos;
                pos += 2;
            }
        }
        self.last_insn_pos = pos;
    }

    /// Map a native offset inside this unit back to a bytecode offset.
    pub fn bc_offset_for(&self, mach_offset: u32) -> Option<u32> {
        match self.bc_map.binary_search_by_key(&mach_offset, |&(m, _)| m) {
            Ok(i) => Some(self.bc_map[i].1),
            Err(0) => None,
            Err(i) => Some(self.bc_map[i - 1].1),
        }
    }
}

/// Machine registers in `MachReg::index` order.
const MACH_REGS: [MachReg; MachReg::COUNT] = {
    use MachReg::*;
    [
        Ax, Cx, Dx, Bx, Sp, Bp, Si, Di, R8, R9, R10, R11, R12, R13, R14, R15, Xmm0, Xmm1, Xmm2,
        Xmm3, Xmm4, Xmm5, Xmm6, Xmm7, Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
    ]
};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use javelin_environ::{ConstPool, MethodFlags, MethodProto};

    pub(crate) fn test_method(code: Vec<u8>, max_locals: u16) -> Arc<Method> {
        let class = Class::link(
            "Test".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            vec![MethodProto {
                name: "test".into(),
                descriptor: "()V".into(),
                args: Vec::new(),
                ret: VmType::Void,
                flags: MethodFlags::STATIC,
                code,
                max_stack: 4,
                max_locals,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            }],
            Vec::new(),
        );
        Arc::clone(&class.methods[0])
    }

    #[test]
    fn unit_reserves_fixed_vregs_and_spill_slot() {
        let cu = CompilationUnit::new(test_method(vec![0xb1], 1), Target::X64);
        assert_eq!(cu.fixed_vregs.len(), MachReg::COUNT);
        let ax = cu.fixed_vreg(MachReg::Ax);
        assert_eq!(cu.vregs[ax].fixed, Some(MachReg::Ax));
        assert!(cu.blocks[cu.exit_block].successors.is_empty());
    }

    #[test]
    fn bc_offset_lookup_picks_covering_entry() {
        let mut cu = CompilationUnit::new(test_method(vec![0xb1], 1), Target::X64);
        cu.bc_map = vec![(0, 0), (10, 3), (25, 7)];
        assert_eq!(cu.bc_offset_for(0), Some(0));
        assert_eq!(cu.bc_offset_for(12), Some(3));
        assert_eq!(cu.bc_offset_for(25), Some(7));
        assert_eq!(cu.bc_offset_for(500), Some(7));
    }
}
