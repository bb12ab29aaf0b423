//! x86 binary code emission.
//!
//! One emit function per LIR opcode over shared ModR/M, SIB, and REX
//! helpers. Branches to unemitted blocks append themselves to the target
//! block's backpatch list and are resolved when the target is placed.
//! Addresses that depend on the final location of the code (calls,
//! RIP-relative operands, taken block addresses) are recorded as
//! relocations for the publisher.

use log::debug;

use javelin_environ::VmType;

use crate::binemit::{CodeBuffer, Reloc};
use crate::cu::{BlockId, BranchFixup, CompilationUnit};
use crate::error::{CodegenError, CodegenResult};
use crate::hooks::{CompileEnv, Helper, TlsField};
use crate::isa::{MachReg, Target};
use crate::lir::{AluOp, Cond, FAluOp, Insn, InsnData, MemBase, MemIndex, MemLocal, ShiftOp, Width};

/// Size of a `call rel32` / `jmp rel32` instruction.
pub const CALL_INSN_SIZE: u32 = 5;
/// Size of the two-byte conditional branch escape.
pub const PREFIX_SIZE: u32 = 1;

fn is_imm8(imm: i32) -> bool {
    (-128..=127).contains(&imm)
}

impl Cond {
    /// Low nibble of the `0F 8x` near-branch opcode.
    fn encoding(self) -> u8 {
        match self {
            Cond::E => 0x4,
            Cond::Ne => 0x5,
            Cond::B => 0x2,
            Cond::Ae => 0x3,
            Cond::Be => 0x6,
            Cond::A => 0x7,
            Cond::L => 0xc,
            Cond::Ge => 0xd,
            Cond::Le => 0xe,
            Cond::G => 0xf,
        }
    }
}

/// Emit the whole unit: prologue, blocks in layout order, the exit and
/// unwind paths, then resolve handler addresses and pending fixups.
pub fn emit_code(cu: &mut CompilationUnit, env: &dyn CompileEnv) -> CodegenResult<()> {
    let mut buf = std::mem::take(&mut cu.objcode);
    let mut emitter = Emitter {
        env,
        target: cu.target,
        block_addr_sites: Vec::new(),
    };

    emitter.emit_prolog(cu, &mut buf);
    if cu.method.is_synchronized() {
        emitter.emit_lock(cu, &mut buf)?;
    }

    for i in 0..cu.layout.len() {
        let block = cu.layout[i];
        emitter.begin_block(cu, &mut buf, block);
        let insns = std::mem::take(&mut cu.blocks[block].insns);
        for insn in &insns {
            emitter.emit_insn(cu, &mut buf, insn)?;
        }
        cu.blocks[block].insns = insns;
    }

    emitter.emit_exit_block(cu, &mut buf)?;
    emitter.emit_unwind_block(cu, &mut buf)?;

    // Taken block addresses become absolute relocations now that every
    // block offset is final.
    for (field_offset, block, wide) in std::mem::take(&mut emitter.block_addr_sites) {
        let code_offset = cu.blocks[block]
            .mach_offset
            .ok_or(CodegenError::ImplLimitExceeded("address taken of unemitted block"))?;
        let reloc = if wide {
            Reloc::CodeAbs8 { code_offset }
        } else {
            Reloc::CodeAbs4 { code_offset }
        };
        buf.record_reloc(field_offset, reloc);
    }

    // Resolved native addresses of the exception handlers, in table order.
    let method = cu.method.clone();
    let mut handlers = Vec::with_capacity(method.exception_table.len());
    for entry in &method.exception_table {
        let offset = cu
            .find_block(entry.handler_pc)
            .and_then(|b| cu.blocks[b].mach_offset)
            .ok_or(CodegenError::ImplLimitExceeded("unresolved handler block"))?;
        handlers.push(offset);
    }
    cu.eh_handlers = handlers;

    debug!(
        "emit: {}.{}{} -> {} bytes, {} blocks",
        cu.method.class().name,
        cu.method.name,
        cu.method.descriptor,
        buf.offset(),
        cu.layout.len()
    );

    cu.objcode = buf;
    Ok(())
}

struct Emitter<'a> {
    env: &'a dyn CompileEnv,
    target: Target,
    /// `(field offset, block, 8-byte?)` for taken block addresses.
    block_addr_sites: Vec<(u32, BlockId, bool)>,
}

impl<'a> Emitter<'a> {
    fn word_is_64(&self) -> bool {
        self.target == Target::X64
    }

    // ---- encoding primitives -----------------------------------------

    fn modrm(&self, m0d: u8, reg: u8, rm: u8) -> u8 {
        ((m0d & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn sib(&self, scale: u8, index: u8, base: u8) -> u8 {
        ((scale & 3) << 6) | ((index & 7) << 3) | (base & 7)
    }

    /// Emit a REX prefix when any extension bit is needed (or `w`).
    fn rex(&self, buf: &mut CodeBuffer, w: bool, reg: u8, index: u8, base: u8) {
        debug_assert!(self.target == Target::X64 || (!w && reg < 8 && index < 8 && base < 8));
        let rex = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1);
        if rex != 0x40 {
            buf.put1(rex);
        }
    }

    /// REX for an instruction with a byte-register operand: `spl`..`dil`
    /// are only addressable with a (possibly empty) REX prefix.
    fn rex_byte(&self, buf: &mut CodeBuffer, byte_reg: u8, reg: u8, index: u8, base: u8) {
        let rex = 0x40
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1);
        let force = self.target == Target::X64 && (4..=7).contains(&byte_reg);
        if rex != 0x40 || force {
            buf.put1(rex);
        }
    }

    /// Legacy SSE prefix, then REX, then the escape bytes; the REX byte
    /// must sit between them.
    fn sse_op(
        &self,
        buf: &mut CodeBuffer,
        prefix: u8,
        opcode: u8,
        w: bool,
        reg: u8,
        index: u8,
        base: u8,
    ) {
        buf.put1(prefix);
        self.rex(buf, w, reg, index, base);
        buf.put1(0x0f);
        buf.put1(opcode);
    }

    /// reg-to-reg ModR/M tail (mod = 11).
    fn modrm_regs(&self, buf: &mut CodeBuffer, reg: u8, rm: u8) {
        let byte = self.modrm(3, reg, rm);
        buf.put1(byte);
    }

    /// `disp(base)` ModR/M tail.
    fn modrm_membase(&self, buf: &mut CodeBuffer, reg: u8, base: u8, disp: i32) {
        let base_low = base & 7;
        let m0d = if disp == 0 && base_low != 5 {
            0
        } else if is_imm8(disp) {
            1
        } else {
            2
        };
        if base_low == 4 {
            // rSP-based addressing needs a SIB byte.
            buf.put1(self.modrm(m0d, reg, 4));
            buf.put1(self.sib(0, 4, base));
        } else {
            buf.put1(self.modrm(m0d, reg, base));
        }
        match m0d {
            1 => buf.put1(disp as u8),
            2 => buf.put4(disp as u32),
            _ => {}
        }
    }

    /// `disp(base, index, 1<<shift)` ModR/M tail.
    fn modrm_memindex(&self, buf: &mut CodeBuffer, reg: u8, mem: &MemIndex) {
        let base = mem.base.mach().encoding();
        let index = mem.index.mach().encoding();
        let disp = mem.disp;
        let m0d = if disp == 0 && (base & 7) != 5 {
            0
        } else if is_imm8(disp) {
            1
        } else {
            2
        };
        buf.put1(self.modrm(m0d, reg, 4));
        buf.put1(self.sib(mem.shift, index, base));
        match m0d {
            1 => buf.put1(disp as u8),
            2 => buf.put4(disp as u32),
            _ => {}
        }
    }

    /// Absolute-address operand. x86-32 encodes the address directly;
    /// x86-64 uses a RIP-relative displacement resolved at publish time.
    fn modrm_memdisp(&self, buf: &mut CodeBuffer, reg: u8, addr: usize) {
        match self.target {
            Target::Ia32 => {
                buf.put1(self.modrm(0, reg, 5));
                buf.put4(addr as u32);
            }
            Target::X64 => {
                buf.put1(self.modrm(0, reg, 5));
                buf.reloc_here(Reloc::PcRel4 { target: addr });
            }
        }
    }

    /// Absolute-address operand that must not be RIP-relative (segment
    /// override loads): SIB form with no base and no index.
    fn modrm_memdisp_abs(&self, buf: &mut CodeBuffer, reg: u8, addr: i32) {
        match self.target {
            Target::Ia32 => {
                buf.put1(self.modrm(0, reg, 5));
                buf.put4(addr as u32);
            }
            Target::X64 => {
                buf.put1(self.modrm(0, reg, 4));
                buf.put1(self.sib(0, 4, 5));
                buf.put4(addr as u32);
            }
        }
    }

    // ---- blocks and branches ----------------------------------------

    fn begin_block(&mut self, cu: &mut CompilationUnit, buf: &mut CodeBuffer, block: BlockId) {
        let offset = buf.offset();
        cu.blocks[block].mach_offset = Some(offset);
        let fixups = std::mem::take(&mut cu.blocks[block].backpatch);
        for fixup in fixups {
            let rel = offset as i64 - fixup.branch_offset as i64 - fixup.insn_size as i64;
            buf.write_u32_at(fixup.field_offset, rel as u32);
        }
        if cu.blocks[block].is_eh_entry {
            // Handler entries are reached by the unwind machinery with a
            // stale stack pointer; re-derive it from the frame pointer.
            self.emit_reanchor_sp(cu, buf);
        }
    }

    /// `lea -(frame)(xBP), xSP`: reset the stack pointer to the frame's
    /// base level.
    fn emit_reanchor_sp(&self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        let disp = match self.target {
            Target::Ia32 => -(cu.frame.locals_size() as i32),
            // GPR and XMM callee saves plus the receiver slot sit below
            // the locals.
            Target::X64 => -((cu.frame.locals_size() as i32) + 5 * 8 + 8 * 8 + 8),
        };
        let sp = MachReg::Sp.encoding();
        self.rex(buf, self.word_is_64(), sp, 0, MachReg::Bp.encoding());
        buf.put1(0x8d);
        self.modrm_membase(buf, sp, MachReg::Bp.encoding(), disp);
    }

    fn emit_branch(
        &mut self,
        cu: &mut CompilationUnit,
        buf: &mut CodeBuffer,
        cond: Option<Cond>,
        target: BlockId,
    ) {
        let branch_offset = buf.offset();
        let insn_size = match cond {
            Some(_) => CALL_INSN_SIZE + PREFIX_SIZE,
            None => CALL_INSN_SIZE,
        };
        match cond {
            Some(cond) => {
                buf.put1(0x0f);
                buf.put1(0x80 | cond.encoding());
            }
            None => buf.put1(0xe9),
        }
        let field_offset = buf.offset();

        if let Some(target_offset) = cu.blocks[target].mach_offset {
            let rel = target_offset as i64 - branch_offset as i64 - insn_size as i64;
            buf.put4(rel as u32);
        } else {
            buf.put4(0);
            cu.blocks[target].backpatch.push(BranchFixup {
                branch_offset,
                field_offset,
                insn_size,
            });
        }
    }

    // ---- instruction dispatch ---------------------------------------

    fn emit_insn(
        &mut self,
        cu: &mut CompilationUnit,
        buf: &mut CodeBuffer,
        insn: &InsnData,
    ) -> CodegenResult<()> {
        // The native-to-bytecode map drives exception handler lookup.
        match cu.bc_map.last() {
            Some(&(_, bc)) if bc == insn.bc => {}
            _ => cu.bc_map.push((buf.offset(), insn.bc)),
        }

        let w64 = |width: Width| width.is_64();
        match &insn.op {
            Insn::MovImmReg { imm, dst, width } => {
                let dst = dst.mach().encoding();
                if *width == Width::W64 {
                    if let Ok(imm32) = i32::try_from(*imm) {
                        self.rex(buf, true, 0, 0, dst);
                        buf.put1(0xc7);
                        buf.put1(self.modrm(3, 0, dst));
                        buf.put4(imm32 as u32);
                    } else {
                        self.rex(buf, true, 0, 0, dst);
                        buf.put1(0xb8 + (dst & 7));
                        buf.put8(*imm as u64);
                    }
                } else {
                    self.rex(buf, false, 0, 0, dst);
                    buf.put1(0xb8 + (dst & 7));
                    buf.put4(*imm as u32);
                }
            }
            Insn::MovBlockAddrReg { block, dst } => {
                let dst = dst.mach().encoding();
                if self.word_is_64() {
                    self.rex(buf, true, 0, 0, dst);
                    buf.put1(0xb8 + (dst & 7));
                    self.block_addr_sites.push((buf.offset(), *block, true));
                    buf.put8(0);
                } else {
                    buf.put1(0xb8 + (dst & 7));
                    self.block_addr_sites.push((buf.offset(), *block, false));
                    buf.put4(0);
                }
            }
            Insn::MovRegReg { src, dst, width } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, w64(*width), src, 0, dst);
                buf.put1(0x89);
                self.modrm_regs(buf, src, dst);
            }
            Insn::MovMemBaseReg { src, dst, width } => {
                self.mov_load(buf, 0x8b, *width, dst.mach(), src);
            }
            Insn::MovRegMemBase { src, dst, width } => {
                let reg = src.mach().encoding();
                let base = dst.base.mach().encoding();
                match width {
                    Width::W8 => {
                        self.rex_byte(buf, reg, reg, 0, base);
                        buf.put1(0x88);
                        self.modrm_membase(buf, reg, base, dst.disp);
                    }
                    Width::W16 => {
                        buf.put1(0x66);
                        self.rex(buf, false, reg, 0, base);
                        buf.put1(0x89);
                        self.modrm_membase(buf, reg, base, dst.disp);
                    }
                    _ => {
                        self.rex(buf, w64(*width), reg, 0, base);
                        buf.put1(0x89);
                        self.modrm_membase(buf, reg, base, dst.disp);
                    }
                }
            }
            Insn::MovMemIndexReg { src, dst, width } => {
                let reg = dst.mach().encoding();
                self.rex(
                    buf,
                    w64(*width),
                    reg,
                    src.index.mach().encoding(),
                    src.base.mach().encoding(),
                );
                buf.put1(0x8b);
                self.modrm_memindex(buf, reg, src);
            }
            Insn::MovRegMemIndex { src, dst, width } => {
                let reg = src.mach().encoding();
                let rex_w = w64(*width);
                match width {
                    Width::W8 => {
                        self.rex_byte(
                            buf,
                            reg,
                            reg,
                            dst.index.mach().encoding(),
                            dst.base.mach().encoding(),
                        );
                        buf.put1(0x88);
                        self.modrm_memindex(buf, reg, dst);
                    }
                    Width::W16 => {
                        buf.put1(0x66);
                        self.rex(
                            buf,
                            false,
                            reg,
                            dst.index.mach().encoding(),
                            dst.base.mach().encoding(),
                        );
                        buf.put1(0x89);
                        self.modrm_memindex(buf, reg, dst);
                    }
                    _ => {
                        self.rex(
                            buf,
                            rex_w,
                            reg,
                            dst.index.mach().encoding(),
                            dst.base.mach().encoding(),
                        );
                        buf.put1(0x89);
                        self.modrm_memindex(buf, reg, dst);
                    }
                }
            }
            Insn::MovMemLocalReg { src, dst, width } => {
                self.mov_load(
                    buf,
                    0x8b,
                    *width,
                    dst.mach(),
                    &MemBase {
                        base: crate::lir::Reg::Mach(MachReg::Bp),
                        disp: src.disp,
                    },
                );
            }
            Insn::MovRegMemLocal { src, dst, width } => {
                let reg = src.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, MachReg::Bp.encoding());
                buf.put1(0x89);
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), dst.disp);
            }
            Insn::MovImmMemLocal { imm, dst, width } => {
                self.rex(buf, w64(*width), 0, 0, MachReg::Bp.encoding());
                buf.put1(0xc7);
                self.modrm_membase(buf, 0, MachReg::Bp.encoding(), dst.disp);
                buf.put4(*imm as u32);
            }
            Insn::MovMemDispReg { addr, dst, width, fixup } => {
                self.record_static_fixup(cu, buf, *fixup);
                let reg = dst.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, 0);
                buf.put1(0x8b);
                self.modrm_memdisp(buf, reg, *addr);
            }
            Insn::MovRegMemDisp { src, addr, width, fixup } => {
                self.record_static_fixup(cu, buf, *fixup);
                let reg = src.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, 0);
                buf.put1(0x89);
                self.modrm_memdisp(buf, reg, *addr);
            }
            Insn::MovSxReg { from, src, dst } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                if *from == Width::W8 {
                    self.rex_byte(buf, src, dst, 0, src);
                } else {
                    self.rex(buf, false, dst, 0, src);
                }
                buf.put1(0x0f);
                buf.put1(if *from == Width::W8 { 0xbe } else { 0xbf });
                self.modrm_regs(buf, dst, src);
            }
            Insn::MovSxMemBaseReg { from, src, dst } => {
                let reg = dst.mach().encoding();
                let base = src.base.mach().encoding();
                self.rex(buf, false, reg, 0, base);
                buf.put1(0x0f);
                buf.put1(if *from == Width::W8 { 0xbe } else { 0xbf });
                self.modrm_membase(buf, reg, base, src.disp);
            }
            Insn::MovSxMemIndexReg { from, src, dst } => {
                let reg = dst.mach().encoding();
                self.rex(
                    buf,
                    false,
                    reg,
                    src.index.mach().encoding(),
                    src.base.mach().encoding(),
                );
                buf.put1(0x0f);
                buf.put1(if *from == Width::W8 { 0xbe } else { 0xbf });
                self.modrm_memindex(buf, reg, src);
            }
            Insn::MovZxReg { src, dst } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, false, dst, 0, src);
                buf.put1(0x0f);
                buf.put1(0xb7);
                self.modrm_regs(buf, dst, src);
            }
            Insn::MovZxMemBaseReg { src, dst } => {
                let reg = dst.mach().encoding();
                let base = src.base.mach().encoding();
                self.rex(buf, false, reg, 0, base);
                buf.put1(0x0f);
                buf.put1(0xb7);
                self.modrm_membase(buf, reg, base, src.disp);
            }
            Insn::MovZxMemIndexReg { src, dst } => {
                let reg = dst.mach().encoding();
                self.rex(
                    buf,
                    false,
                    reg,
                    src.index.mach().encoding(),
                    src.base.mach().encoding(),
                );
                buf.put1(0x0f);
                buf.put1(0xb7);
                self.modrm_memindex(buf, reg, src);
            }
            Insn::MovSx32Reg64 { src, dst } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, true, dst, 0, src);
                buf.put1(0x63);
                self.modrm_regs(buf, dst, src);
            }

            Insn::FMovRegReg { src, dst, wide } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, 0x10, false, dst, 0, src);
                self.modrm_regs(buf, dst, src);
            }
            Insn::FMovMemBaseReg { src, dst, wide } => {
                let reg = dst.mach().encoding();
                let base = src.base.mach().encoding();
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, 0x10, false, reg, 0, base);
                self.modrm_membase(buf, reg, base, src.disp);
            }
            Insn::FMovRegMemBase { src, dst, wide } => {
                let reg = src.mach().encoding();
                let base = dst.base.mach().encoding();
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, 0x11, false, reg, 0, base);
                self.modrm_membase(buf, reg, base, dst.disp);
            }
            Insn::FMovMemIndexReg { src, dst, wide } => {
                let reg = dst.mach().encoding();
                self.sse_op(
                    buf,
                    if *wide { 0xf2 } else { 0xf3 },
                    0x10,
                    false,
                    reg,
                    src.index.mach().encoding(),
                    src.base.mach().encoding(),
                );
                self.modrm_memindex(buf, reg, src);
            }
            Insn::FMovRegMemIndex { src, dst, wide } => {
                let reg = src.mach().encoding();
                self.sse_op(
                    buf,
                    if *wide { 0xf2 } else { 0xf3 },
                    0x11,
                    false,
                    reg,
                    dst.index.mach().encoding(),
                    dst.base.mach().encoding(),
                );
                self.modrm_memindex(buf, reg, dst);
            }
            Insn::FMovMemLocalReg { src, dst, wide } => {
                let reg = dst.mach().encoding();
                self.sse_op(
                    buf,
                    if *wide { 0xf2 } else { 0xf3 },
                    0x10,
                    false,
                    reg,
                    0,
                    MachReg::Bp.encoding(),
                );
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), src.disp);
            }
            Insn::FMovRegMemLocal { src, dst, wide } => {
                let reg = src.mach().encoding();
                self.sse_op(
                    buf,
                    if *wide { 0xf2 } else { 0xf3 },
                    0x11,
                    false,
                    reg,
                    0,
                    MachReg::Bp.encoding(),
                );
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), dst.disp);
            }
            Insn::FMovMemDispReg { addr, dst, wide, fixup } => {
                self.record_static_fixup(cu, buf, *fixup);
                let reg = dst.mach().encoding();
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, 0x10, false, reg, 0, 0);
                self.modrm_memdisp(buf, reg, *addr);
            }
            Insn::FMovRegMemDisp { src, addr, wide, fixup } => {
                self.record_static_fixup(cu, buf, *fixup);
                let reg = src.mach().encoding();
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, 0x11, false, reg, 0, 0);
                self.modrm_memdisp(buf, reg, *addr);
            }

            Insn::AluRegReg { op, src, dst, width } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, w64(*width), dst, 0, src);
                buf.put1(alu_rm_to_reg_opcode(*op));
                self.modrm_regs(buf, dst, src);
            }
            Insn::AluImmReg { op, imm, dst, width } => {
                self.alu_imm(buf, alu_modrm_ext(*op), *imm, dst.mach(), *width);
            }
            Insn::AluMemBaseReg { op, src, dst, width } => {
                let reg = dst.mach().encoding();
                let base = src.base.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, base);
                buf.put1(alu_rm_to_reg_opcode(*op));
                self.modrm_membase(buf, reg, base, src.disp);
            }
            Insn::AluMemLocalReg { op, src, dst, width } => {
                let reg = dst.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, MachReg::Bp.encoding());
                buf.put1(alu_rm_to_reg_opcode(*op));
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), src.disp);
            }
            Insn::CmpRegReg { src, dst, width } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, w64(*width), dst, 0, src);
                buf.put1(0x3b);
                self.modrm_regs(buf, dst, src);
            }
            Insn::CmpImmReg { imm, dst, width } => {
                self.alu_imm(buf, 7, *imm, dst.mach(), *width);
            }
            Insn::TestRegReg { src, dst, width } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, w64(*width), src, 0, dst);
                buf.put1(0x85);
                self.modrm_regs(buf, src, dst);
            }
            Insn::TestImmMemDisp { imm, addr } => {
                buf.put1(0xf7);
                // The RIP base is the end of the instruction; the
                // trailing imm32 shifts it by four more bytes.
                match self.target {
                    Target::Ia32 => self.modrm_memdisp(buf, 0, *addr),
                    Target::X64 => {
                        buf.put1(self.modrm(0, 0, 5));
                        buf.reloc_here(Reloc::PcRel4 {
                            target: addr.wrapping_sub(4),
                        });
                    }
                }
                buf.put4(*imm as u32);
            }
            Insn::Neg { dst, width } => {
                let dst = dst.mach().encoding();
                self.rex(buf, w64(*width), 0, 0, dst);
                buf.put1(0xf7);
                self.modrm_regs(buf, 3, dst);
            }
            Insn::IMulRegReg { src, dst, width } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.rex(buf, w64(*width), dst, 0, src);
                buf.put1(0x0f);
                buf.put1(0xaf);
                self.modrm_regs(buf, dst, src);
            }
            Insn::IMulMemLocalReg { src, dst, width } => {
                let reg = dst.mach().encoding();
                self.rex(buf, w64(*width), reg, 0, MachReg::Bp.encoding());
                buf.put1(0x0f);
                buf.put1(0xaf);
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), src.disp);
            }
            Insn::Cltd { width, .. } => {
                self.rex(buf, w64(*width), 0, 0, 0);
                buf.put1(0x99);
            }
            Insn::Div { divisor, width, .. } => {
                let rm = divisor.mach().encoding();
                self.rex(buf, w64(*width), 0, 0, rm);
                buf.put1(0xf7);
                self.modrm_regs(buf, 7, rm);
            }
            Insn::ShiftRegReg { op, dst, width, .. } => {
                let rm = dst.mach().encoding();
                self.rex(buf, w64(*width), 0, 0, rm);
                buf.put1(0xd3);
                self.modrm_regs(buf, shift_modrm_ext(*op), rm);
            }
            Insn::ShiftImmReg { op, imm, dst, width } => {
                let rm = dst.mach().encoding();
                self.rex(buf, w64(*width), 0, 0, rm);
                buf.put1(0xc1);
                self.modrm_regs(buf, shift_modrm_ext(*op), rm);
                buf.put1(*imm);
            }

            Insn::FAluRegReg { op, src, dst, wide } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                let opcode = match op {
                    FAluOp::Add => 0x58,
                    FAluOp::Mul => 0x59,
                    FAluOp::Sub => 0x5c,
                    FAluOp::Div => 0x5e,
                };
                self.sse_op(buf, if *wide { 0xf2 } else { 0xf3 }, opcode, false, dst, 0, src);
                self.modrm_regs(buf, dst, src);
            }
            Insn::CvtIntToFloat { src, dst, wide_int, wide_float } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.sse_op(
                    buf,
                    if *wide_float { 0xf2 } else { 0xf3 },
                    0x2a,
                    *wide_int,
                    dst,
                    0,
                    src,
                );
                self.modrm_regs(buf, dst, src);
            }
            Insn::CvtFloatToInt { src, dst, wide_int, wide_float } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                self.sse_op(
                    buf,
                    if *wide_float { 0xf2 } else { 0xf3 },
                    0x2c,
                    *wide_int,
                    dst,
                    0,
                    src,
                );
                self.modrm_regs(buf, dst, src);
            }
            Insn::CvtFloatToFloat { src, dst, to_wide } => {
                let (src, dst) = (src.mach().encoding(), dst.mach().encoding());
                // cvtss2sd carries the F3 prefix, cvtsd2ss the F2 one.
                self.sse_op(buf, if *to_wide { 0xf3 } else { 0xf2 }, 0x5a, false, dst, 0, src);
                self.modrm_regs(buf, dst, src);
            }

            Insn::PushReg { src } => {
                let reg = src.mach().encoding();
                self.rex(buf, false, 0, 0, reg);
                buf.put1(0x50 + (reg & 7));
            }
            Insn::PushImm { imm } => {
                if is_imm8(*imm as i32) && i32::try_from(*imm).is_ok() {
                    buf.put1(0x6a);
                    buf.put1(*imm as u8);
                } else {
                    buf.put1(0x68);
                    buf.put4(*imm as u32);
                }
            }
            Insn::PushMemBase { src } => {
                let base = src.base.mach().encoding();
                self.rex(buf, false, 0, 0, base);
                buf.put1(0xff);
                self.modrm_membase(buf, 6, base, src.disp);
            }
            Insn::PushMemLocal { src } => {
                buf.put1(0xff);
                self.modrm_membase(buf, 6, MachReg::Bp.encoding(), src.disp);
            }
            Insn::PopReg { dst } => {
                let reg = dst.mach().encoding();
                self.rex(buf, false, 0, 0, reg);
                buf.put1(0x58 + (reg & 7));
            }

            Insn::Branch { cond, target } => {
                self.emit_branch(cu, buf, *cond, *target);
            }
            Insn::TrapIf { cond, kind: _ } => {
                // Branch over the throw call; the unwind jump lands in the
                // exception engine.
                let skip: u32 = 2 * CALL_INSN_SIZE;
                buf.put1(0x0f);
                buf.put1(0x80 | cond.negated().encoding());
                buf.put4(skip);
                self.emit_call_rel(buf, self.env.helper(Helper::ThrowArrayBounds));
                let unwind = cu.unwind_block;
                let branch_offset = buf.offset();
                buf.put1(0xe9);
                let field_offset = buf.offset();
                buf.put4(0);
                cu.blocks[unwind].backpatch.push(BranchFixup {
                    branch_offset,
                    field_offset,
                    insn_size: CALL_INSN_SIZE,
                });
            }
            Insn::JmpMemIndex { mem } => {
                self.rex(
                    buf,
                    false,
                    4,
                    mem.index.mach().encoding(),
                    mem.base.mach().encoding(),
                );
                buf.put1(0xff);
                self.modrm_memindex(buf, 4, mem);
            }
            Insn::JmpReg { src } => {
                let rm = src.mach().encoding();
                self.rex(buf, false, 0, 0, rm);
                buf.put1(0xff);
                self.modrm_regs(buf, 4, rm);
            }
            Insn::CallRel { target, stack_adjust, fixup, .. } => {
                if let Some(id) = fixup {
                    cu.call_fixups[*id as usize].mach_offset = buf.offset();
                }
                self.emit_call_rel(buf, *target);
                self.emit_stack_adjust(buf, *stack_adjust);
            }
            Insn::CallReg { src, stack_adjust, .. } => {
                let rm = src.mach().encoding();
                self.rex(buf, false, 0, 0, rm);
                buf.put1(0xff);
                self.modrm_regs(buf, 2, rm);
                self.emit_stack_adjust(buf, *stack_adjust);
            }
            Insn::Ret => buf.put1(0xc3),

            Insn::ExcTest { scratch } => {
                self.emit_exception_test(buf, scratch.mach());
            }
        }
        Ok(())
    }

    fn record_static_fixup(&self, cu: &mut CompilationUnit, buf: &CodeBuffer, fixup: Option<u32>) {
        if let Some(id) = fixup {
            cu.static_fixups[id as usize].mach_offset = buf.offset();
        }
    }

    fn mov_load(&self, buf: &mut CodeBuffer, opcode: u8, width: Width, dst: MachReg, src: &MemBase) {
        let reg = dst.encoding();
        let base = src.base.mach().encoding();
        self.rex(buf, width.is_64(), reg, 0, base);
        buf.put1(opcode);
        self.modrm_membase(buf, reg, base, src.disp);
    }

    fn alu_imm(&self, buf: &mut CodeBuffer, ext: u8, imm: i32, dst: MachReg, width: Width) {
        let rm = dst.encoding();
        self.rex(buf, width.is_64(), 0, 0, rm);
        if is_imm8(imm) {
            buf.put1(0x83);
            self.modrm_regs(buf, ext, rm);
            buf.put1(imm as u8);
        } else {
            buf.put1(0x81);
            self.modrm_regs(buf, ext, rm);
            buf.put4(imm as u32);
        }
    }

    fn emit_call_rel(&self, buf: &mut CodeBuffer, target: usize) {
        buf.put1(0xe8);
        buf.reloc_here(Reloc::PcRel4 { target });
    }

    fn emit_stack_adjust(&self, buf: &mut CodeBuffer, adjust: u32) {
        if adjust > 0 {
            self.alu_imm(
                buf,
                0, // add
                adjust as i32,
                MachReg::Sp,
                if self.word_is_64() { Width::W64 } else { Width::W32 },
            );
        }
    }

    /// Post-call exception poll: a segment-relative load of the guard
    /// pointer, then a test through it. When an exception is pending the
    /// guard points at a no-access page and the test faults.
    fn emit_exception_test(&self, buf: &mut CodeBuffer, scratch: MachReg) {
        let offset = self.env.tls_offset(TlsField::ExceptionGuard);
        let reg = scratch.encoding();
        match self.target {
            Target::Ia32 => buf.put1(0x65), // gs
            Target::X64 => buf.put1(0x64),  // fs
        }
        self.rex(buf, self.word_is_64(), reg, 0, 0);
        buf.put1(0x8b);
        self.modrm_memdisp_abs(buf, reg, offset);

        // test (%scratch), %scratch
        self.rex(buf, self.word_is_64(), reg, 0, reg);
        buf.put1(0x85);
        self.modrm_membase(buf, reg, reg, 0);
    }

    // ---- prologue, epilogue, monitors --------------------------------

    fn emit_push(&self, buf: &mut CodeBuffer, reg: MachReg) {
        let enc = reg.encoding();
        self.rex(buf, false, 0, 0, enc);
        buf.put1(0x50 + (enc & 7));
    }

    fn emit_pop(&self, buf: &mut CodeBuffer, reg: MachReg) {
        let enc = reg.encoding();
        self.rex(buf, false, 0, 0, enc);
        buf.put1(0x58 + (enc & 7));
    }

    fn emit_mov_reg_reg(&self, buf: &mut CodeBuffer, src: MachReg, dst: MachReg) {
        self.rex(buf, self.word_is_64(), src.encoding(), 0, dst.encoding());
        buf.put1(0x89);
        self.modrm_regs(buf, src.encoding(), dst.encoding());
    }

    fn emit_push_xmm(&self, buf: &mut CodeBuffer, reg: MachReg) {
        let word = if self.word_is_64() { Width::W64 } else { Width::W32 };
        self.alu_imm(buf, 5, 8, MachReg::Sp, word); // sub 8, sp
        let enc = reg.encoding();
        self.sse_op(buf, 0xf2, 0x11, false, enc, 0, MachReg::Sp.encoding());
        self.modrm_membase(buf, enc, MachReg::Sp.encoding(), 0);
    }

    fn emit_pop_xmm(&self, buf: &mut CodeBuffer, reg: MachReg) {
        let enc = reg.encoding();
        self.sse_op(buf, 0xf2, 0x10, false, enc, 0, MachReg::Sp.encoding());
        self.modrm_membase(buf, enc, MachReg::Sp.encoding(), 0);
        let word = if self.word_is_64() { Width::W64 } else { Width::W32 };
        self.alu_imm(buf, 0, 8, MachReg::Sp, word); // add 8, sp
    }

    fn emit_prolog(&mut self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        match self.target {
            Target::Ia32 => {
                self.emit_push(buf, MachReg::Di);
                self.emit_push(buf, MachReg::Si);
                self.emit_push(buf, MachReg::Bx);
                self.emit_push(buf, MachReg::Bp);
                self.emit_mov_reg_reg(buf, MachReg::Sp, MachReg::Bp);
                let locals = cu.frame.locals_size();
                if locals > 0 {
                    self.alu_imm(buf, 5, locals as i32, MachReg::Sp, Width::W32);
                }
            }
            Target::X64 => {
                self.emit_push(buf, MachReg::Bp);
                self.emit_mov_reg_reg(buf, MachReg::Sp, MachReg::Bp);
                let locals = cu.frame.locals_size();
                if locals > 0 {
                    self.alu_imm(buf, 5, locals as i32, MachReg::Sp, Width::W64);
                }
                for reg in [MachReg::Bx, MachReg::R12, MachReg::R13, MachReg::R14, MachReg::R15] {
                    self.emit_push(buf, reg);
                }
                for reg in [
                    MachReg::Xmm8,
                    MachReg::Xmm9,
                    MachReg::Xmm10,
                    MachReg::Xmm11,
                    MachReg::Xmm12,
                    MachReg::Xmm13,
                    MachReg::Xmm14,
                    MachReg::Xmm15,
                ] {
                    self.emit_push_xmm(buf, reg);
                }
                // Receiver save slot, reloaded by synchronized exits.
                self.emit_push(buf, MachReg::Di);

                self.spill_args_x64(cu, buf);
            }
        }
    }

    /// Store the register-passed arguments into their local slots so the
    /// body addresses every local uniformly.
    fn spill_args_x64(&self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        let regs = self.target.regs();
        let mut gpr_next = 0;
        let mut xmm_next = 0;
        let mut stack_index = 0i32;
        let mut slot = 0u16;

        let method = &cu.method;
        let mut arg_types: Vec<VmType> = Vec::new();
        if !method.is_static() {
            arg_types.push(VmType::Reference);
        }
        arg_types.extend(method.args.iter().copied());

        for ty in arg_types {
            let disp = cu.frame.local_disp(slot, ty.is_wide());
            if ty.is_float() {
                if xmm_next < regs.xmm_args.len() {
                    let reg = regs.xmm_args[xmm_next].encoding();
                    xmm_next += 1;
                    self.sse_op(buf, 0xf2, 0x11, false, reg, 0, MachReg::Bp.encoding());
                    self.modrm_membase(buf, reg, MachReg::Bp.encoding(), disp);
                } else {
                    self.copy_stack_arg(buf, stack_index, disp);
                    stack_index += 1;
                }
            } else if gpr_next < regs.gpr_args.len() {
                let reg = regs.gpr_args[gpr_next].encoding();
                gpr_next += 1;
                self.rex(buf, true, reg, 0, MachReg::Bp.encoding());
                buf.put1(0x89);
                self.modrm_membase(buf, reg, MachReg::Bp.encoding(), disp);
            } else {
                self.copy_stack_arg(buf, stack_index, disp);
                stack_index += 1;
            }
            slot += ty.slot_count() as u16;
        }
    }

    /// Copy the n'th caller-stack argument to a local slot through the
    /// scratch register.
    fn copy_stack_arg(&self, buf: &mut CodeBuffer, index: i32, disp: i32) {
        let scratch = self.target.regs().gpr_scratch.encoding();
        let src_disp = 16 + index * 8;
        self.rex(buf, true, scratch, 0, MachReg::Bp.encoding());
        buf.put1(0x8b);
        self.modrm_membase(buf, scratch, MachReg::Bp.encoding(), src_disp);
        self.rex(buf, true, scratch, 0, MachReg::Bp.encoding());
        buf.put1(0x89);
        self.modrm_membase(buf, scratch, MachReg::Bp.encoding(), disp);
    }

    /// The object a synchronized method locks: the receiver slot, or the
    /// class mirror for static methods.
    fn emit_load_lock_object_ia32_push(&self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        if cu.method.is_static() {
            let class = cu.method.class();
            buf.put1(0x68);
            buf.put4(self.env.class_object_addr(&class) as u32);
        } else {
            buf.put1(0xff);
            self.modrm_membase(buf, 6, MachReg::Bp.encoding(), cu.frame.this_disp());
        }
    }

    fn emit_load_lock_object_x64_rdi(&self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        if cu.method.is_static() {
            let class = cu.method.class();
            let rdi = MachReg::Di.encoding();
            self.rex(buf, true, 0, 0, rdi);
            buf.put1(0xc7);
            self.modrm_regs(buf, 0, rdi);
            buf.put4(self.env.class_object_addr(&class) as u32);
        } else {
            let rdi = MachReg::Di.encoding();
            self.rex(buf, true, rdi, 0, MachReg::Bp.encoding());
            buf.put1(0x8b);
            self.modrm_membase(buf, rdi, MachReg::Bp.encoding(), cu.frame.this_disp());
        }
    }

    fn emit_lock(&mut self, cu: &CompilationUnit, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let lock = self.env.helper(Helper::ObjectLock);
        match self.target {
            Target::Ia32 => {
                self.emit_load_lock_object_ia32_push(cu, buf);
                self.emit_call_rel(buf, lock);
                self.alu_imm(buf, 0, 4, MachReg::Sp, Width::W32);
                self.emit_push(buf, MachReg::Ax);
                self.emit_exception_test(buf, MachReg::Ax);
                self.emit_pop(buf, MachReg::Ax);
            }
            Target::X64 => {
                self.emit_load_lock_object_x64_rdi(cu, buf);
                self.emit_call_rel(buf, lock);
                self.emit_exception_test(buf, self.target.regs().gpr_scratch);
            }
        }
        Ok(())
    }

    /// Monitor release with the return value preserved around the call.
    fn emit_unlock(&mut self, cu: &CompilationUnit, buf: &mut CodeBuffer) {
        let unlock = self.env.helper(Helper::ObjectUnlock);
        match self.target {
            Target::Ia32 => {
                self.emit_push(buf, MachReg::Ax);
                self.emit_push(buf, MachReg::Dx);
                self.emit_load_lock_object_ia32_push(cu, buf);
                self.emit_call_rel(buf, unlock);
                self.alu_imm(buf, 0, 4, MachReg::Sp, Width::W32);
                self.emit_exception_test(buf, MachReg::Ax);
                self.emit_pop(buf, MachReg::Dx);
                self.emit_pop(buf, MachReg::Ax);
            }
            Target::X64 => {
                self.emit_push(buf, MachReg::Ax);
                self.emit_push_xmm(buf, MachReg::Xmm0);
                self.emit_load_lock_object_x64_rdi(cu, buf);
                self.emit_call_rel(buf, unlock);
                self.emit_exception_test(buf, self.target.regs().gpr_scratch);
                self.emit_pop_xmm(buf, MachReg::Xmm0);
                self.emit_pop(buf, MachReg::Ax);
            }
        }
    }

    fn emit_restore_regs(&self, buf: &mut CodeBuffer) {
        match self.target {
            Target::Ia32 => {
                self.emit_pop(buf, MachReg::Bx);
                self.emit_pop(buf, MachReg::Si);
                self.emit_pop(buf, MachReg::Di);
            }
            Target::X64 => {
                // Drop the receiver save slot.
                self.alu_imm(buf, 0, 8, MachReg::Sp, Width::W64);
                for reg in [
                    MachReg::Xmm15,
                    MachReg::Xmm14,
                    MachReg::Xmm13,
                    MachReg::Xmm12,
                    MachReg::Xmm11,
                    MachReg::Xmm10,
                    MachReg::Xmm9,
                    MachReg::Xmm8,
                ] {
                    self.emit_pop_xmm(buf, reg);
                }
                for reg in [MachReg::R15, MachReg::R14, MachReg::R13, MachReg::R12, MachReg::Bx] {
                    self.emit_pop(buf, reg);
                }
            }
        }
    }

    fn emit_leave(&self, buf: &mut CodeBuffer) {
        buf.put1(0xc9);
    }

    fn emit_exit_block(&mut self, cu: &mut CompilationUnit, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let exit = cu.exit_block;
        self.begin_block(cu, buf, exit);
        // The exception engine can enter here with a stale stack pointer
        // when the caller is native code.
        self.emit_reanchor_sp(cu, buf);
        let exit_start = buf.offset();
        if cu.method.is_synchronized() {
            self.emit_unlock(cu, buf);
        }
        cu.exit_past_unlock = (exit_start, buf.offset());

        // Epilogue.
        match self.target {
            Target::Ia32 => {
                self.emit_leave(buf);
                self.emit_restore_regs(buf);
                buf.put1(0xc3);
            }
            Target::X64 => {
                self.emit_restore_regs(buf);
                self.emit_leave(buf);
                buf.put1(0xc3);
            }
        }
        Ok(())
    }

    fn emit_unwind_block(&mut self, cu: &mut CompilationUnit, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let unwind = cu.unwind_block;
        self.begin_block(cu, buf, unwind);
        self.emit_reanchor_sp(cu, buf);
        let unwind_start = buf.offset();
        if cu.method.is_synchronized() {
            self.emit_unlock(cu, buf);
        }
        cu.unwind_past_unlock = (unwind_start, buf.offset());

        match self.target {
            Target::Ia32 => {
                self.emit_leave(buf);
                self.emit_restore_regs(buf);
            }
            Target::X64 => {
                self.emit_restore_regs(buf);
                self.emit_leave(buf);
            }
        }
        // Tail-jump into the exception engine's unwind entry.
        buf.put1(0xe9);
        buf.reloc_here(Reloc::PcRel4 {
            target: self.env.helper(Helper::Unwind),
        });
        Ok(())
    }
}

fn alu_rm_to_reg_opcode(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0x03,
        AluOp::Adc => 0x13,
        AluOp::Sub => 0x2b,
        AluOp::Sbb => 0x1b,
        AluOp::And => 0x23,
        AluOp::Or => 0x0b,
        AluOp::Xor => 0x33,
    }
}

fn alu_modrm_ext(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0,
        AluOp::Or => 1,
        AluOp::Adc => 2,
        AluOp::Sbb => 3,
        AluOp::And => 4,
        AluOp::Sub => 5,
        AluOp::Xor => 6,
    }
}

fn shift_modrm_ext(op: ShiftOp) -> u8 {
    match op {
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    }
}
