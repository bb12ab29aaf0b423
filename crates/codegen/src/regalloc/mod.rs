//! Register allocation: liveness, linear scan over intervals, edge
//! resolution, and the operand rewrite that replaces every virtual
//! register with its machine location.

pub mod linearscan;
pub mod liveness;
pub mod resolve;

use rustc_hash::FxHashMap;

use javelin_environ::VmType;

use crate::cu::{CompilationUnit, VReg};
use crate::error::{CodegenError, CodegenResult};
use crate::isa::MachReg;
use crate::lir::{Insn, InsnData, MemLocal, Reg, Width};
use crate::regalloc::linearscan::{Allocation, Loc};

pub use crate::regalloc::linearscan::Interval;
pub use crate::regalloc::resolve::has_resolution_blocks;

/// Run the whole allocator over a unit with selected instructions.
pub fn allocate(cu: &mut CompilationUnit) -> CodegenResult<Allocation> {
    let liveness = liveness::compute(cu);
    let alloc = linearscan::run(cu, &liveness);
    resolve::insert_split_moves(cu, &alloc)?;
    resolve::resolve_edges(cu, &alloc, &liveness)?;
    rewrite_operands(cu, &alloc)?;
    Ok(alloc)
}

fn reload_width(cu: &CompilationUnit, vreg: VReg) -> Width {
    match cu.vregs[vreg].ty {
        VmType::Long | VmType::Reference if cu.target.has_64bit_gprs() => Width::W64,
        _ => Width::W32,
    }
}

/// Replace virtual registers with machine registers; spilled operands are
/// routed through the reserved scratch registers with a reload before the
/// use and a store after the def.
fn rewrite_operands(cu: &mut CompilationUnit, alloc: &Allocation) -> CodegenResult<()> {
    let blocks: Vec<_> = liveness::lir_blocks(cu);
    let gpr_scratches = [cu.target.regs().gpr_scratch, cu.target.regs().gpr_scratch2];
    let xmm_scratch = cu.target.regs().xmm_scratch;

    for block in blocks {
        let mut insns = std::mem::take(&mut cu.blocks[block].insns);
        let mut rewritten: Vec<InsnData> = Vec::with_capacity(insns.len());

        for mut insn in insns.drain(..) {
            if cu.blocks[block].is_resolution {
                rewritten.push(insn);
                continue;
            }
            let pos = insn.pos;

            let uses: Vec<VReg> = insn.op.uses().into_iter().filter_map(|r| r.as_virt()).collect();
            let defs: Vec<VReg> = insn
                .op
                .defs()
                .into_iter()
                .filter_map(|r| r.as_virt())
                .collect();

            let mut mapping: FxHashMap<VReg, MachReg> = FxHashMap::default();
            let mut reloads: Vec<InsnData> = Vec::new();
            let mut stores: Vec<InsnData> = Vec::new();
            let mut next_gpr_scratch = 0usize;

            let mut all: Vec<VReg> = uses.clone();
            for &d in &defs {
                if !all.contains(&d) {
                    all.push(d);
                }
            }

            for v in all {
                if mapping.contains_key(&v) {
                    continue;
                }
                if let Some(fixed) = cu.vregs[v].fixed {
                    mapping.insert(v, fixed);
                    continue;
                }
                match alloc.location_at(v, pos) {
                    Some(Loc::Reg(reg)) => {
                        mapping.insert(v, reg);
                    }
                    Some(Loc::Slot(slot)) => {
                        let xmm = cu.vregs[v].ty.is_float();
                        let scratch = if xmm {
                            xmm_scratch
                        } else {
                            let Some(&s) = gpr_scratches.get(next_gpr_scratch) else {
                                return Err(CodegenError::ImplLimitExceeded(
                                    "spill rewrite needs more scratch registers",
                                ));
                            };
                            next_gpr_scratch += 1;
                            s
                        };
                        let mem = MemLocal {
                            disp: cu.frame.slot_disp(slot),
                            slot: Some(slot),
                        };
                        if uses.contains(&v) {
                            let op = if xmm {
                                Insn::FMovMemLocalReg {
                                    src: mem,
                                    dst: Reg::Mach(scratch),
                                    wide: cu.vregs[v].ty == VmType::Double,
                                }
                            } else {
                                Insn::MovMemLocalReg {
                                    src: mem,
                                    dst: Reg::Mach(scratch),
                                    width: reload_width(cu, v),
                                }
                            };
                            let mut reload = InsnData::new(op, insn.bc);
                            reload.pos = pos.saturating_sub(1);
                            reloads.push(reload);
                        }
                        if defs.contains(&v) {
                            let op = if xmm {
                                Insn::FMovRegMemLocal {
                                    src: Reg::Mach(scratch),
                                    dst: mem,
                                    wide: cu.vregs[v].ty == VmType::Double,
                                }
                            } else {
                                Insn::MovRegMemLocal {
                                    src: Reg::Mach(scratch),
                                    dst: mem,
                                    width: reload_width(cu, v),
                                }
                            };
                            let mut store = InsnData::new(op, insn.bc);
                            store.pos = pos + 1;
                            stores.push(store);
                        }
                        mapping.insert(v, scratch);
                    }
                    None => {
                        return Err(CodegenError::ImplLimitExceeded(
                            "virtual register has no location at its use",
                        ));
                    }
                }
            }

            insn.op.visit_regs(&mut |reg| {
                if let Reg::Virt(v) = *reg {
                    *reg = Reg::Mach(mapping[&v]);
                }
            });

            rewritten.extend(reloads);
            rewritten.push(insn);
            rewritten.extend(stores);
        }

        cu.blocks[block].insns = rewritten;
    }
    Ok(())
}

/// Post-allocation invariant check used by tests: every operand carries a
/// machine register and every interval received a location, and no two
/// overlapping intervals of one class share a register.
pub fn verify_allocation(cu: &CompilationUnit, alloc: &Allocation) {
    for block in liveness::lir_blocks(cu) {
        for insn in &cu.blocks[block].insns {
            for reg in insn.op.uses().into_iter().chain(insn.op.defs()) {
                assert!(
                    reg.as_virt().is_none(),
                    "unallocated operand {:?} in {:?}",
                    reg,
                    insn.op
                );
            }
        }
    }
    let intervals: Vec<_> = alloc.intervals.values().collect();
    for (i, a) in intervals.iter().enumerate() {
        assert!(a.loc.is_some(), "interval of {} left unassigned", a.vreg);
        for b in intervals.iter().skip(i + 1) {
            if a.vreg == b.vreg || a.end <= b.start || b.end <= a.start {
                continue;
            }
            if let (Some(Loc::Reg(ra)), Some(Loc::Reg(rb))) = (a.loc, b.loc) {
                assert_ne!(
                    ra, rb,
                    "{} and {} overlap in the same register",
                    a.vreg, b.vreg
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opc::*;
    use crate::cfg::analyze_control_flow;
    use crate::cu::tests::test_method;
    use crate::hirgen::build_hir;
    use crate::hooks::tests::StubEnv;
    use crate::isa::x86::select_instructions;
    use crate::isa::Target;

    fn compile_to_alloc(code: Vec<u8>, target: Target) -> (CompilationUnit, Allocation) {
        let mut cu = CompilationUnit::new(test_method(code, 4), target);
        let env = StubEnv::default();
        analyze_control_flow(&mut cu).unwrap();
        build_hir(&mut cu, &env).unwrap();
        select_instructions(&mut cu, &env).unwrap();
        let alloc = allocate(&mut cu).unwrap();
        (cu, alloc)
    }

    #[test]
    fn straight_line_code_allocates_registers() {
        let (cu, alloc) = compile_to_alloc(
            vec![ICONST_1, ICONST_2, IADD, ISTORE_0, ILOAD_0, IRETURN],
            Target::X64,
        );
        verify_allocation(&cu, &alloc);
    }

    #[test]
    fn single_block_methods_have_no_resolution_blocks() {
        let (cu, _) = compile_to_alloc(vec![ICONST_0, IRETURN], Target::X64);
        assert!(!has_resolution_blocks(&cu));
    }

    #[test]
    fn ia32_allocates_with_four_gprs() {
        // Deep expression: ((((1+2)+3)+4)+5)*((6+7)+8)
        let (cu, alloc) = compile_to_alloc(
            vec![
                ICONST_1, ICONST_2, IADD, ICONST_3, IADD, ICONST_4, IADD, ICONST_5, IADD,
                BIPUSH, 6, BIPUSH, 7, IADD, BIPUSH, 8, IADD, IMUL, IRETURN,
            ],
            Target::Ia32,
        );
        verify_allocation(&cu, &alloc);
    }

    #[test]
    fn diamond_join_value_has_one_location_per_position() {
        let (cu, alloc) = compile_to_alloc(
            vec![ILOAD_0, IFLE, 0x00, 0x07, ICONST_1, GOTO, 0x00, 0x04, ICONST_0, IRETURN],
            Target::X64,
        );
        verify_allocation(&cu, &alloc);
        // Every LIR operand is a machine register now.
        for &block in &cu.layout {
            for insn in &cu.blocks[block].insns {
                let mut ok = true;
                let mut probe = insn.op.clone();
                probe.visit_regs(&mut |r| {
                    if matches!(r, Reg::Virt(_)) {
                        ok = false;
                    }
                });
                assert!(ok, "virtual register survived in {:?}", insn.op);
            }
        }
    }

    #[test]
    fn division_gets_ax_and_dx() {
        let (cu, alloc) = compile_to_alloc(
            vec![ILOAD_0, ILOAD_0 + 1, IDIV, IRETURN],
            Target::X64,
        );
        verify_allocation(&cu, &alloc);
        let div = cu
            .layout
            .iter()
            .flat_map(|&b| cu.blocks[b].insns.iter())
            .find_map(|i| match &i.op {
                Insn::Div { divisor, ax, dx, .. } => Some((*divisor, *ax, *dx)),
                _ => None,
            })
            .expect("division survives allocation");
        assert_eq!(div.1, Reg::Mach(MachReg::Ax));
        assert_eq!(div.2, Reg::Mach(MachReg::Dx));
        // The divisor never lands on either implicit register.
        assert_ne!(div.0, Reg::Mach(MachReg::Ax));
        assert_ne!(div.0, Reg::Mach(MachReg::Dx));
    }
}
