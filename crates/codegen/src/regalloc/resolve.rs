//! Data-flow resolution after the scan.
//!
//! Two kinds of fix-ups: moves at intra-block split boundaries (a value
//! changes location mid-block because its interval was split), and
//! resolution blocks on edges whose predecessor and successor disagree
//! about a value's location. A resolution block carries the move
//! sequence and an unconditional jump to the real successor; the
//! predecessor's branch is retargeted at it.

use javelin_environ::VmType;
use smallvec::smallvec;

use crate::cu::{BasicBlockData, BlockId, CompilationUnit, VReg};
use crate::error::CodegenResult;
use crate::frame::SlotId;
use crate::isa::MachReg;
use crate::lir::{Insn, InsnData, MemLocal, Reg, Width};
use crate::regalloc::linearscan::{Allocation, Loc};
use crate::regalloc::liveness::{lir_blocks, lir_successors, Liveness};

fn vreg_width(cu: &CompilationUnit, vreg: VReg) -> Width {
    match cu.vregs[vreg].ty {
        VmType::Long => {
            if cu.target.has_64bit_gprs() {
                Width::W64
            } else {
                Width::W32
            }
        }
        VmType::Reference => {
            if cu.target.has_64bit_gprs() {
                Width::W64
            } else {
                Width::W32
            }
        }
        _ => Width::W32,
    }
}

fn slot_mem(cu: &CompilationUnit, slot: SlotId) -> MemLocal {
    MemLocal {
        disp: cu.frame.slot_disp(slot),
        slot: Some(slot),
    }
}

/// Emit the instruction(s) for one location-to-location move.
fn push_move(
    cu: &CompilationUnit,
    out: &mut Vec<InsnData>,
    vreg: VReg,
    from: Loc,
    to: Loc,
    pos: u32,
) {
    let xmm = cu.vregs[vreg].ty.is_float();
    let wide = cu.vregs[vreg].ty == VmType::Double;
    let width = vreg_width(cu, vreg);
    let mut emit = |op: Insn| {
        let mut data = InsnData::new(op, 0);
        data.pos = pos;
        out.push(data);
    };
    match (from, to) {
        (Loc::Reg(a), Loc::Reg(b)) => {
            if xmm {
                emit(Insn::FMovRegReg {
                    src: Reg::Mach(a),
                    dst: Reg::Mach(b),
                    wide: true,
                });
            } else {
                emit(Insn::MovRegReg {
                    src: Reg::Mach(a),
                    dst: Reg::Mach(b),
                    width,
                });
            }
        }
        (Loc::Reg(a), Loc::Slot(s)) => {
            if xmm {
                emit(Insn::FMovRegMemLocal {
                    src: Reg::Mach(a),
                    dst: slot_mem(cu, s),
                    wide,
                });
            } else {
                emit(Insn::MovRegMemLocal {
                    src: Reg::Mach(a),
                    dst: slot_mem(cu, s),
                    width,
                });
            }
        }
        (Loc::Slot(s), Loc::Reg(b)) => {
            if xmm {
                emit(Insn::FMovMemLocalReg {
                    src: slot_mem(cu, s),
                    dst: Reg::Mach(b),
                    wide,
                });
            } else {
                emit(Insn::MovMemLocalReg {
                    src: slot_mem(cu, s),
                    dst: Reg::Mach(b),
                    width,
                });
            }
        }
        (Loc::Slot(a), Loc::Slot(b)) => {
            let scratch = if xmm {
                cu.target.regs().xmm_scratch
            } else {
                cu.target.regs().gpr_scratch
            };
            push_move(cu, out, vreg, Loc::Slot(a), Loc::Reg(scratch), pos);
            push_move(cu, out, vreg, Loc::Reg(scratch), Loc::Slot(b), pos);
        }
    }
}

/// Insert moves at intra-block interval split points: the value leaves
/// its old location just before the position where the split child takes
/// over.
pub fn insert_split_moves(cu: &mut CompilationUnit, alloc: &Allocation) -> CodegenResult<()> {
    let block_starts: Vec<u32> = alloc.block_ranges.values().map(|&(s, _)| s).collect();

    let mut insertions: Vec<(u32, Vec<InsnData>)> = Vec::new();
    for (&vreg, ids) in &alloc.vreg_intervals {
        for pair in ids.windows(2) {
            let a = &alloc.intervals[pair[0]];
            let b = &alloc.intervals[pair[1]];
            if a.end != b.start {
                continue;
            }
            // Splits landing on a block boundary are edge-resolved.
            if block_starts.contains(&b.start) {
                continue;
            }
            let (Some(from), Some(to)) = (a.loc, b.loc) else { continue };
            if from == to {
                continue;
            }
            let mut moves = Vec::new();
            push_move(cu, &mut moves, vreg, from, to, b.start.saturating_sub(1));
            insertions.push((b.start, moves));
        }
    }

    for (pos, moves) in insertions {
        let Some((block, index)) = find_insertion_point(cu, alloc, pos) else { continue };
        let insns = &mut cu.blocks[block].insns;
        for (k, m) in moves.into_iter().enumerate() {
            insns.insert(index + k, m);
        }
    }
    Ok(())
}

fn find_insertion_point(
    cu: &CompilationUnit,
    alloc: &Allocation,
    pos: u32,
) -> Option<(BlockId, usize)> {
    for (&block, &(start, end)) in &alloc.block_ranges {
        if pos > start && pos <= end {
            let index = cu.blocks[block]
                .insns
                .iter()
                .position(|i| i.pos >= pos)
                .unwrap_or(cu.blocks[block].insns.len());
            return Some((block, index));
        }
    }
    None
}

/// Insert resolution blocks on edges where locations differ.
pub fn resolve_edges(
    cu: &mut CompilationUnit,
    alloc: &Allocation,
    liveness: &Liveness,
) -> CodegenResult<()> {
    struct Edge {
        pred: BlockId,
        succ: BlockId,
        moves: Vec<(VReg, Loc, Loc)>,
    }

    let mut edges = Vec::new();
    for pred in lir_blocks(cu) {
        if cu.blocks[pred].is_resolution {
            continue;
        }
        let (_, pred_end) = alloc.block_ranges[&pred];
        for succ in lir_successors(cu, pred) {
            let (succ_start, _) = alloc.block_ranges[&succ];
            let mut moves = Vec::new();
            for &v in &liveness.live_in[&succ] {
                if cu.vregs[v].fixed.is_some() {
                    continue;
                }
                let from = alloc.location_at(v, pred_end.saturating_sub(1));
                let to = alloc.location_at(v, succ_start);
                if let (Some(from), Some(to)) = (from, to) {
                    if from != to {
                        moves.push((v, from, to));
                    }
                }
            }
            if !moves.is_empty() {
                edges.push(Edge { pred, succ, moves });
            }
        }
    }

    for edge in edges {
        let ordered = order_moves(cu, edge.moves);
        let mut insns = ordered;
        let mut jump = InsnData::new(
            Insn::Branch {
                cond: None,
                target: edge.succ,
            },
            0,
        );
        jump.pos = cu.last_insn_pos;
        insns.push(jump);

        let mut data = BasicBlockData::new(0, 0);
        data.is_resolution = true;
        data.insns = insns;
        data.predecessors = smallvec![edge.pred];
        data.successors = smallvec![edge.succ];
        let resolution = cu.blocks.push(data);
        cu.layout.push(resolution);

        // Retarget every branch on this edge at the resolution block.
        for insn in cu.blocks[edge.pred].insns.iter_mut() {
            if let Insn::Branch { target, .. } = &mut insn.op {
                if *target == edge.succ {
                    *target = resolution;
                }
            }
        }
    }
    Ok(())
}

/// Order a parallel move set so no move clobbers a pending source; break
/// cycles through the scratch register.
fn order_moves(cu: &CompilationUnit, mut pending: Vec<(VReg, Loc, Loc)>) -> Vec<InsnData> {
    let mut out = Vec::new();
    while !pending.is_empty() {
        let ready = pending.iter().position(|&(_, _, to)| {
            !pending.iter().any(|&(_, from, _)| from == to)
        });
        match ready {
            Some(i) => {
                let (v, from, to) = pending.remove(i);
                push_move(cu, &mut out, v, from, to, 0);
            }
            None => {
                // Cycle: park one source in the scratch register, then
                // redirect its readers.
                let (v, from, _) = pending[0];
                let scratch = if cu.vregs[v].ty.is_float() {
                    Loc::Reg(cu.target.regs().xmm_scratch)
                } else {
                    Loc::Reg(cu.target.regs().gpr_scratch)
                };
                push_move(cu, &mut out, v, from, scratch, 0);
                for entry in pending.iter_mut() {
                    if entry.1 == from {
                        entry.1 = scratch;
                    }
                }
            }
        }
    }
    out
}

/// Does an edge between these blocks carry a resolution block? Test
/// support for the allocator's invariants.
pub fn has_resolution_blocks(cu: &CompilationUnit) -> bool {
    cu.layout
        .iter()
        .any(|&b| cu.blocks[b].is_resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cu::tests::test_method;
    use crate::isa::Target;

    #[test]
    fn move_ordering_respects_dependencies() {
        let mut cu = CompilationUnit::new(test_method(vec![0xb1], 1), Target::X64);
        let a = cu.new_vreg(VmType::Int);
        let b = cu.new_vreg(VmType::Int);
        // b := a must run before a is overwritten.
        let moves = vec![
            (a, Loc::Reg(MachReg::Cx), Loc::Reg(MachReg::Ax)),
            (b, Loc::Reg(MachReg::Ax), Loc::Reg(MachReg::Dx)),
        ];
        let ordered = order_moves(&cu, moves);
        assert_eq!(ordered.len(), 2);
        match &ordered[0].op {
            Insn::MovRegReg { src, dst, .. } => {
                assert_eq!(*src, Reg::Mach(MachReg::Ax));
                assert_eq!(*dst, Reg::Mach(MachReg::Dx));
            }
            other => panic!("unexpected first move {:?}", other),
        }
    }

    #[test]
    fn swap_cycle_goes_through_scratch() {
        let mut cu = CompilationUnit::new(test_method(vec![0xb1], 1), Target::X64);
        let a = cu.new_vreg(VmType::Int);
        let b = cu.new_vreg(VmType::Int);
        let moves = vec![
            (a, Loc::Reg(MachReg::Ax), Loc::Reg(MachReg::Cx)),
            (b, Loc::Reg(MachReg::Cx), Loc::Reg(MachReg::Ax)),
        ];
        let ordered = order_moves(&cu, moves);
        // One park in scratch plus the two real moves.
        assert_eq!(ordered.len(), 3);
    }
}
