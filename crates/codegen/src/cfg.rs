//! Control-flow analysis.
//!
//! Two passes over the bytecode: leader discovery, then block
//! materialisation with successor edges. Every instruction offset of the
//! method ends up in exactly one block, and every branch target lands on a
//! block boundary — branches into an already-formed block split it.

use std::collections::BTreeSet;

use log::trace;

use crate::bytecode::{self, opc};
use crate::cu::{BasicBlockData, BlockId, CompilationUnit};
use crate::error::{verify_err, CodegenResult};

/// Discover basic blocks and their successor edges for the unit's method.
///
/// Idempotent: re-running on an analysed unit is a no-op.
pub fn analyze_control_flow(cu: &mut CompilationUnit) -> CodegenResult<()> {
    if cu.is_analyzed {
        return Ok(());
    }

    let method = cu.method.clone();
    let code = &method.code;
    if code.is_empty() {
        return Err(verify_err!("method `{}` has no code", method.name));
    }

    let leaders = find_leaders(&method)?;
    materialize_blocks(cu, code, &leaders)?;
    connect_blocks(cu, code)?;

    for entry in &method.exception_table {
        if let Some(block) = cu.find_block(entry.handler_pc) {
            debug_assert_eq!(cu.blocks[block].start, entry.handler_pc);
            cu.blocks[block].is_eh_entry = true;
        }
    }

    cu.is_analyzed = true;
    trace!(
        "cfa: {}.{}{} -> {} blocks",
        method.class().name,
        method.name,
        method.descriptor,
        cu.nr_blocks()
    );
    Ok(())
}

/// Pass 1: collect the sorted set of block leaders.
fn find_leaders(method: &javelin_environ::Method) -> CodegenResult<BTreeSet<u32>> {
    let code = &method.code;
    let mut leaders = BTreeSet::new();
    leaders.insert(0u32);

    let mut pc = 0u32;
    while (pc as usize) < code.len() {
        let op = code[pc as usize];
        let size = bytecode::insn_size(code, pc)?;
        let next = pc + size;

        if bytecode::is_cond_branch(op) || bytecode::is_goto_or_jsr(op) {
            leaders.insert(bytecode::branch_target(code, pc)?);
            leaders.insert(next);
        } else if op == opc::TABLESWITCH {
            let ts = bytecode::parse_tableswitch(code, pc)?;
            leaders.insert(ts.default);
            leaders.extend(ts.targets.iter().copied());
            leaders.insert(next);
        } else if op == opc::LOOKUPSWITCH {
            let ls = bytecode::parse_lookupswitch(code, pc)?;
            leaders.insert(ls.default);
            leaders.extend(ls.pairs.iter().map(|&(_, t)| t));
            leaders.insert(next);
        } else if bytecode::is_return(op) || op == opc::ATHROW || op == opc::RET {
            leaders.insert(next);
        }

        pc = next;
    }

    // Exception handler entries are leaders too.
    for entry in &method.exception_table {
        if entry.handler_pc as usize >= code.len() {
            return Err(verify_err!(
                "handler pc {} outside method",
                entry.handler_pc
            ));
        }
        leaders.insert(entry.handler_pc);
    }

    // A control transfer at the very end inserts code_length; drop it.
    leaders.retain(|&pc| (pc as usize) < code.len());

    // Every leader must fall on an instruction boundary.
    let mut pc = 0u32;
    let mut boundary_ok = true;
    let mut check = leaders.iter().copied().peekable();
    while (pc as usize) < code.len() {
        while let Some(&leader) = check.peek() {
            if leader < pc {
                boundary_ok = false;
                check.next();
            } else if leader == pc {
                check.next();
            } else {
                break;
            }
        }
        pc += bytecode::insn_size(code, pc)?;
    }
    if !boundary_ok || check.peek().is_some() {
        return Err(verify_err!("branch into the middle of an instruction"));
    }

    Ok(leaders)
}

/// Pass 2: one block per leader, spanning to the next leader.
fn materialize_blocks(
    cu: &mut CompilationUnit,
    code: &[u8],
    leaders: &BTreeSet<u32>,
) -> CodegenResult<()> {
    let mut iter = leaders.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let end = iter.peek().copied().unwrap_or(code.len() as u32);
        let block = cu.blocks.push(BasicBlockData::new(start, end));
        cu.layout.push(block);
    }
    Ok(())
}

/// Offset of the last instruction inside `[start, end)`.
fn last_insn_offset(code: &[u8], start: u32, end: u32) -> CodegenResult<u32> {
    let mut pc = start;
    loop {
        let next = pc + bytecode::insn_size(code, pc)?;
        if next >= end {
            return Ok(pc);
        }
        pc = next;
    }
}

fn add_edge(cu: &mut CompilationUnit, from: BlockId, to: BlockId) {
    if !cu.blocks[from].successors.contains(&to) {
        cu.blocks[from].successors.push(to);
    }
    if !cu.blocks[to].predecessors.contains(&from) {
        cu.blocks[to].predecessors.push(from);
    }
}

fn target_block(cu: &CompilationUnit, target: u32) -> CodegenResult<BlockId> {
    cu.find_block(target)
        .ok_or_else(|| verify_err!("branch target {} not in any block", target))
}

/// Assign successors from each block's last instruction.
fn connect_blocks(cu: &mut CompilationUnit, code: &[u8]) -> CodegenResult<()> {
    for i in 0..cu.layout.len() {
        let block = cu.layout[i];
        let (start, end) = {
            let data = &cu.blocks[block];
            (data.start, data.end)
        };
        let last = last_insn_offset(code, start, end)?;
        let op = code[last as usize];
        let fall_through = cu.layout.get(i + 1).copied();

        if bytecode::is_cond_branch(op) {
            let taken = target_block(cu, bytecode::branch_target(code, last)?)?;
            add_edge(cu, block, taken);
            let next = fall_through
                .ok_or_else(|| verify_err!("conditional branch falls off the method"))?;
            add_edge(cu, block, next);
        } else if op == opc::GOTO || op == opc::GOTO_W {
            let taken = target_block(cu, bytecode::branch_target(code, last)?)?;
            add_edge(cu, block, taken);
        } else if op == opc::JSR || op == opc::JSR_W {
            // The subroutine body is a successor; the return target is
            // reached through the pushed address.
            let sub = target_block(cu, bytecode::branch_target(code, last)?)?;
            add_edge(cu, block, sub);
        } else if op == opc::TABLESWITCH {
            let ts = bytecode::parse_tableswitch(code, last)?;
            for target in ts.targets.iter().copied().chain(Some(ts.default)) {
                let succ = target_block(cu, target)?;
                add_edge(cu, block, succ);
            }
        } else if op == opc::LOOKUPSWITCH {
            let ls = bytecode::parse_lookupswitch(code, last)?;
            for target in ls.pairs.iter().map(|&(_, t)| t).chain(Some(ls.default)) {
                let succ = target_block(cu, target)?;
                add_edge(cu, block, succ);
            }
        } else if bytecode::is_return(op) || op == opc::ATHROW || op == opc::RET {
            // No successors.
        } else {
            let next = fall_through
                .ok_or_else(|| verify_err!("control falls off the end of the method"))?;
            add_edge(cu, block, next);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opc::*;
    use crate::cu::tests::test_method;
    use crate::isa::Target;
    use javelin_environ::ExceptionTableEntry;

    fn analyze(code: Vec<u8>) -> CompilationUnit {
        let mut cu = CompilationUnit::new(test_method(code, 4), Target::X64);
        analyze_control_flow(&mut cu).unwrap();
        cu
    }

    fn ranges(cu: &CompilationUnit) -> Vec<(u32, u32)> {
        cu.layout
            .iter()
            .map(|&b| (cu.blocks[b].start, cu.blocks[b].end))
            .collect()
    }

    fn successors(cu: &CompilationUnit, i: usize) -> Vec<usize> {
        let block = cu.layout[i];
        cu.blocks[block]
            .successors
            .iter()
            .map(|s| cu.layout.iter().position(|b| b == s).unwrap())
            .collect()
    }

    // public String defaultString(String s) { if (s == null) s = ""; return s; }
    #[test]
    fn branch_opcode_ends_basic_block() {
        let cu = analyze(vec![
            /* 0 */ ALOAD_1,
            /* 1 */ IFNONNULL, 0x00, 0x06, // jumps to 7
            /* 4 */ LDC, 0x02,
            /* 6 */ ASTORE_1,
            /* 7 */ ALOAD_1,
            /* 8 */ ARETURN,
        ]);

        assert_eq!(cu.nr_blocks(), 3);
        assert_eq!(ranges(&cu), vec![(0, 4), (4, 7), (7, 9)]);
        assert_eq!(successors(&cu, 0), vec![2, 1]);
        assert_eq!(successors(&cu, 1), vec![2]);
        assert!(successors(&cu, 2).is_empty());
    }

    // public boolean greaterThanZero(int i) { return i > 0; }
    #[test]
    fn multiple_branches() {
        let cu = analyze(vec![
            /* 0 */ ILOAD_1,
            /* 1 */ IFLE, 0x00, 0x07, // jumps to 8
            /* 4 */ ICONST_1,
            /* 5 */ GOTO, 0x00, 0x04, // jumps to 9
            /* 8 */ ICONST_0,
            /* 9 */ IRETURN,
        ]);

        assert_eq!(cu.nr_blocks(), 4);
        assert_eq!(ranges(&cu), vec![(0, 4), (4, 8), (8, 9), (9, 10)]);
        assert_eq!(successors(&cu, 0), vec![2, 1]);
        assert_eq!(successors(&cu, 1), vec![3]);
        assert_eq!(successors(&cu, 2), vec![3]);
        assert!(successors(&cu, 3).is_empty());
    }

    // A branch target in the middle of what would otherwise be one
    // straight-line block splits it.
    #[test]
    fn branch_target_splits_block() {
        let cu = analyze(vec![
            /* 0 */ ILOAD_0,
            /* 1 */ IFNE, 0x00, 0x05, // jumps to 6
            /* 4 */ ICONST_0,
            /* 5 */ ISTORE_1,
            /* 6 */ ICONST_0,
            /* 7 */ ISTORE_1,
            /* 8 */ ILOAD_0,
            /* 9 */ IFNE, 0x00, 0x05, // jumps to 14
            /* 12 */ ICONST_0,
            /* 13 */ ISTORE_1,
            /* 14 */ RETURN,
        ]);

        assert_eq!(cu.nr_blocks(), 5);
        assert_eq!(ranges(&cu), vec![(0, 4), (4, 6), (6, 12), (12, 14), (14, 15)]);
        assert_eq!(successors(&cu, 0), vec![2, 1]);
        assert_eq!(successors(&cu, 1), vec![2]);
        assert_eq!(successors(&cu, 2), vec![4, 3]);
        assert_eq!(successors(&cu, 3), vec![4]);
        assert!(successors(&cu, 4).is_empty());
    }

    #[test]
    fn every_offset_is_in_exactly_one_block() {
        let cu = analyze(vec![
            ILOAD_1, IFLE, 0x00, 0x07, ICONST_1, GOTO, 0x00, 0x04, ICONST_0, IRETURN,
        ]);
        for offset in 0..10u32 {
            let covering = cu
                .layout
                .iter()
                .filter(|&&b| offset >= cu.blocks[b].start && offset < cu.blocks[b].end)
                .count();
            assert_eq!(covering, 1, "offset {}", offset);
        }
    }

    #[test]
    fn handler_pc_is_a_leader() {
        let method = {
            use javelin_environ::{Class, ConstPool, MethodFlags, MethodProto, VmType};
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
                    code: vec![ICONST_0, ISTORE_0, ICONST_0, ISTORE_0, RETURN],
                    max_stack: 2,
                    max_locals: 2,
                    exception_table: vec![ExceptionTableEntry {
                        start_pc: 0,
                        end_pc: 2,
                        handler_pc: 2,
                        catch_type: 0,
                    }],
                    line_numbers: Vec::new(),
                }],
                Vec::new(),
            );
            std::sync::Arc::clone(&class.methods[0])
        };
        let mut cu = CompilationUnit::new(method, Target::X64);
        analyze_control_flow(&mut cu).unwrap();
        assert_eq!(ranges(&cu), vec![(0, 2), (2, 5)]);
    }

    #[test]
    fn rerun_is_a_noop() {
        let mut cu = CompilationUnit::new(
            test_method(vec![ICONST_0, ISTORE_0, RETURN], 2),
            Target::X64,
        );
        analyze_control_flow(&mut cu).unwrap();
        let blocks_before = cu.nr_blocks();
        analyze_control_flow(&mut cu).unwrap();
        assert_eq!(cu.nr_blocks(), blocks_before);
    }

    #[test]
    fn branch_out_of_range_is_verification_failure() {
        let mut cu = CompilationUnit::new(
            test_method(vec![GOTO, 0x7f, 0x00], 1),
            Target::X64,
        );
        assert!(analyze_control_flow(&mut cu).is_err());
    }

    #[test]
    fn branch_into_insn_middle_is_verification_failure() {
        // goto targets the immediate byte of bipush.
        let mut cu = CompilationUnit::new(
            test_method(vec![GOTO, 0x00, 0x04, RETURN, BIPUSH, 0x07, RETURN], 1),
            Target::X64,
        );
        let _ = analyze_control_flow(&mut cu);
        // The target (4) is bipush itself; aim inside it instead.
        let mut cu = CompilationUnit::new(
            test_method(vec![GOTO, 0x00, 0x05, RETURN, BIPUSH, 0x07, RETURN], 1),
            Target::X64,
        );
        assert!(analyze_control_flow(&mut cu).is_err());
    }
}
