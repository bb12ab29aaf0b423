//! HIR to LIR instruction selection.
//!
//! A tree-walk tiler: one handler per statement and expression kind, each
//! emitting a fixed instruction sequence and returning the location of the
//! produced value. Calling-convention lowering lives here too — argument
//! marshalling, fixed return registers, and the pre-colorings division and
//! shifts demand.

use smallvec::{smallvec, SmallVec};

use javelin_environ::{Method, VmType};
use std::sync::Arc;

use crate::cu::{BlockId, CallFixupSite, CompilationUnit, StaticFixupSite};
use crate::error::{verify_err, CodegenError, CodegenResult};
use crate::hir::{BinOp, Expr, InvokeKind, Stmt};
use crate::hooks::{CompileEnv, Helper, StaticFieldAddr};
use crate::lir::{
    AluOp, Cond, FAluOp, Insn, InsnData, MemBase, MemIndex, MemLocal, Reg, ShiftOp, TrapKind,
    Width,
};
use crate::isa::{MachReg, Target};

/// Lower every block's statements into LIR.
pub fn select_instructions(cu: &mut CompilationUnit, env: &dyn CompileEnv) -> CodegenResult<()> {
    let mut selector = Selector {
        env,
        target: cu.target,
        cur: Vec::new(),
        bc: 0,
    };

    for i in 0..cu.layout.len() {
        let block = cu.layout[i];
        selector.select_block(cu, block)?;
    }
    cu.compute_insn_positions();
    Ok(())
}

/// Where a value lives during selection.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Val {
    /// An integer or reference in one GPR.
    Gpr(Reg),
    /// A 64-bit integer split across two GPRs (x86-32 only).
    Pair {
        /// Low half.
        lo: Reg,
        /// High half.
        hi: Reg,
    },
    /// A float in an XMM register.
    Xmm(Reg),
}

impl Val {
    fn gpr(self) -> Reg {
        match self {
            Val::Gpr(r) => r,
            other => panic!("expected a GPR value, got {:?}", other),
        }
    }

    fn xmm(self) -> Reg {
        match self {
            Val::Xmm(r) => r,
            other => panic!("expected an XMM value, got {:?}", other),
        }
    }
}

enum CallDest {
    Rel { target: usize, fixup: Option<u32> },
    Reg(Reg),
}

struct Selector<'a> {
    env: &'a dyn CompileEnv,
    target: Target,
    cur: Vec<InsnData>,
    bc: u32,
}

impl<'a> Selector<'a> {
    fn select_block(&mut self, cu: &mut CompilationUnit, block: BlockId) -> CodegenResult<()> {
        self.cur.clear();
        let stmts = std::mem::take(&mut cu.blocks[block].stmts);
        let block_start = cu.blocks[block].start;

        let mut terminated = false;
        for (bc, stmt) in &stmts {
            self.bc = *bc;
            terminated = self.select_stmt(cu, block, block_start, stmt)?;
        }

        if !terminated {
            // Fall-through edge; make the jump explicit so every edge has
            // a branch instruction to retarget.
            let target = match stmts.last() {
                Some((_, Stmt::If { .. })) => cu.blocks[block].successors.get(1).copied(),
                _ => cu.blocks[block].successors.first().copied(),
            };
            if let Some(target) = target {
                self.emit(Insn::Branch { cond: None, target });
            }
        }

        cu.blocks[block].stmts = stmts;
        cu.blocks[block].insns = std::mem::take(&mut self.cur);
        Ok(())
    }

    fn emit(&mut self, op: Insn) {
        self.cur.push(InsnData::new(op, self.bc));
    }

    // ---- widths and registers ----------------------------------------

    /// Width of a machine word: references and frame slots.
    fn word(&self) -> Width {
        match self.target {
            Target::Ia32 => Width::W32,
            Target::X64 => Width::W64,
        }
    }

    /// GPR width for a value type; `Long` is only register-native on
    /// x86-64.
    fn ty_width(&self, ty: VmType) -> Width {
        match ty.stack_type() {
            VmType::Long => Width::W64,
            VmType::Reference => self.word(),
            _ => Width::W32,
        }
    }

    fn long_is_pair(&self) -> bool {
        self.target == Target::Ia32
    }

    fn fixed(&self, cu: &CompilationUnit, reg: MachReg) -> Reg {
        Reg::Virt(cu.fixed_vreg(reg))
    }

    fn new_gpr(&self, cu: &mut CompilationUnit) -> Reg {
        Reg::Virt(cu.new_vreg(if self.target.has_64bit_gprs() {
            VmType::Long
        } else {
            VmType::Int
        }))
    }

    fn new_xmm(&self, cu: &mut CompilationUnit) -> Reg {
        Reg::Virt(cu.new_vreg(VmType::Double))
    }

    fn scratch_mem(&self, cu: &mut CompilationUnit, word: u32) -> MemLocal {
        let slot = cu.scratch_slot();
        MemLocal {
            disp: cu.frame.slot_disp(slot) + word as i32 * 4,
            slot: Some(slot),
        }
    }

    fn local_mem(&self, cu: &CompilationUnit, index: u16, ty: VmType, word: u32) -> MemLocal {
        MemLocal {
            disp: cu.frame.local_disp(index, ty.is_wide()) + word as i32 * 4,
            slot: None,
        }
    }

    fn temp_mem(&self, cu: &mut CompilationUnit, id: u32, ty: VmType, word: u32) -> MemLocal {
        let slot = cu.temp_slot(id, ty);
        MemLocal {
            disp: cu.frame.slot_disp(slot) + word as i32 * 4,
            slot: Some(slot),
        }
    }

    // ---- expressions -------------------------------------------------

    fn eval(&mut self, cu: &mut CompilationUnit, expr: &Expr) -> CodegenResult<Val> {
        match expr {
            Expr::Value { ty, value } => self.eval_const(cu, *ty, *value),
            Expr::FValue { ty, value } => self.eval_fconst(cu, *ty, *value),
            Expr::StringConst { value } => {
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovImmReg {
                    imm: self.env.string_const(value) as i64,
                    dst,
                    width: self.word(),
                });
                Ok(Val::Gpr(dst))
            }
            Expr::ReturnAddress { block } => {
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovBlockAddrReg { block: *block, dst });
                Ok(Val::Gpr(dst))
            }
            Expr::Local { ty, index } => self.load_slot(cu, *ty, |sel, cu, word| {
                sel.local_mem(cu, *index, *ty, word)
            }),
            Expr::Temporary { ty, id } => {
                if *id == crate::hirgen::EXCEPTION_TEMP {
                    // The unwind machinery parks the exception in its
                    // reserved frame slot, not a register.
                    return self.load_slot(cu, *ty, |sel, cu, word| {
                        sel.temp_mem(cu, crate::hirgen::EXCEPTION_TEMP, *ty, word)
                    });
                }
                Ok(match cu.temp_loc(*id, *ty, self.long_is_pair()) {
                    crate::cu::TempLoc::Gpr(v) => Val::Gpr(Reg::Virt(v)),
                    crate::cu::TempLoc::Pair(lo, hi) => Val::Pair {
                        lo: Reg::Virt(lo),
                        hi: Reg::Virt(hi),
                    },
                    crate::cu::TempLoc::Xmm(v) => Val::Xmm(Reg::Virt(v)),
                })
            }
            Expr::Binop {
                ty, op, left, right,
            } => self.eval_binop(cu, *ty, *op, left, right),
            Expr::Neg { ty, value } => self.eval_neg(cu, *ty, value),
            Expr::Convert { from, to, value } => self.eval_convert(cu, *from, *to, value),
            Expr::Truncate { to, value } => self.eval_truncate(cu, *to, value),
            Expr::ArrayDeref { ty, array, index } => self.eval_array_deref(cu, *ty, array, index),
            Expr::ArrayLength { array } => {
                let array = self.eval(cu, array)?.gpr();
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase {
                        base: array,
                        disp: self.env.array_length_offset(),
                    },
                    dst,
                    width: Width::W32,
                });
                Ok(Val::Gpr(dst))
            }
            Expr::InstanceField { ty, field, object } => {
                let object = self.eval(cu, object)?.gpr();
                self.load_field_mem(cu, *ty, object, field.offset as i32)
            }
            Expr::StaticField { ty, class, field } => {
                let (addr, fixup) = self.static_addr(cu, class, field, 0);
                let wide = *ty == VmType::Double;
                match ty.stack_type() {
                    VmType::Float | VmType::Double => {
                        let dst = self.new_xmm(cu);
                        self.emit(Insn::FMovMemDispReg {
                            addr,
                            dst,
                            wide,
                            fixup,
                        });
                        Ok(Val::Xmm(dst))
                    }
                    VmType::Long if self.long_is_pair() => {
                        let lo = self.new_gpr(cu);
                        let hi = self.new_gpr(cu);
                        self.emit(Insn::MovMemDispReg {
                            addr,
                            dst: lo,
                            width: Width::W32,
                            fixup,
                        });
                        let (addr_hi, fixup_hi) = self.static_addr(cu, class, field, 4);
                        self.emit(Insn::MovMemDispReg {
                            addr: addr_hi,
                            dst: hi,
                            width: Width::W32,
                            fixup: fixup_hi,
                        });
                        Ok(Val::Pair { lo, hi })
                    }
                    _ => {
                        let dst = self.new_gpr(cu);
                        self.emit(Insn::MovMemDispReg {
                            addr,
                            dst,
                            width: self.ty_width(*ty),
                            fixup,
                        });
                        Ok(Val::Gpr(dst))
                    }
                }
            }
            Expr::Invoke {
                ty,
                kind,
                method,
                args,
            } => {
                let result = self.select_invoke(cu, *kind, method, args, *ty)?;
                result.ok_or_else(|| verify_err!("void invocation used as a value"))
            }
            Expr::NewObject { class } => {
                let class_addr = self.imm_gpr(cu, self.env.class_runtime_addr(class) as i64);
                let ret = self.emit_helper_call(
                    cu,
                    Helper::NewObject,
                    vec![Val::Gpr(class_addr)],
                    Some(VmType::Reference),
                )?;
                self.emit_exception_test(cu);
                Ok(ret.expect("allocation returns a value"))
            }
            Expr::NewArray {
                element,
                atype,
                length,
            } => {
                let length = self.eval(cu, length)?;
                let (helper, first) = match element {
                    Some(class) => (
                        Helper::NewArray,
                        self.imm_gpr(cu, self.env.class_runtime_addr(class) as i64),
                    ),
                    None => (Helper::NewPrimitiveArray, self.imm_gpr(cu, i64::from(*atype))),
                };
                let ret = self.emit_helper_call(
                    cu,
                    helper,
                    vec![Val::Gpr(first), length],
                    Some(VmType::Reference),
                )?;
                self.emit_exception_test(cu);
                Ok(ret.expect("allocation returns a value"))
            }
            Expr::NewMultiArray { class, dimensions } => {
                let mut args = Vec::with_capacity(dimensions.len() + 2);
                args.push(Val::Gpr(
                    self.imm_gpr(cu, self.env.class_runtime_addr(class) as i64),
                ));
                args.push(Val::Gpr(self.imm_gpr(cu, dimensions.len() as i64)));
                for dim in dimensions {
                    args.push(self.eval(cu, dim)?);
                }
                let ret = self.emit_helper_call(
                    cu,
                    Helper::NewMultiArray,
                    args,
                    Some(VmType::Reference),
                )?;
                self.emit_exception_test(cu);
                Ok(ret.expect("allocation returns a value"))
            }
            Expr::InstanceOf { class, object } => {
                let class_addr = self.imm_gpr(cu, self.env.class_runtime_addr(class) as i64);
                let object = self.eval(cu, object)?;
                let ret = self.emit_helper_call(
                    cu,
                    Helper::InstanceOf,
                    vec![Val::Gpr(class_addr), object],
                    Some(VmType::Int),
                )?;
                Ok(ret.expect("instanceof returns a value"))
            }
        }
    }

    fn imm_gpr(&mut self, cu: &mut CompilationUnit, imm: i64) -> Reg {
        let dst = self.new_gpr(cu);
        self.emit(Insn::MovImmReg {
            imm,
            dst,
            width: self.word(),
        });
        dst
    }

    fn eval_const(&mut self, cu: &mut CompilationUnit, ty: VmType, value: i64) -> CodegenResult<Val> {
        match ty.stack_type() {
            VmType::Long if self.long_is_pair() => {
                let lo = self.new_gpr(cu);
                let hi = self.new_gpr(cu);
                self.emit(Insn::MovImmReg {
                    imm: value & 0xffff_ffff,
                    dst: lo,
                    width: Width::W32,
                });
                self.emit(Insn::MovImmReg {
                    imm: (value >> 32) & 0xffff_ffff,
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            other => {
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovImmReg {
                    imm: value,
                    dst,
                    width: self.ty_width(other),
                });
                Ok(Val::Gpr(dst))
            }
        }
    }

    fn eval_fconst(&mut self, cu: &mut CompilationUnit, ty: VmType, value: f64) -> CodegenResult<Val> {
        // Materialise the bit pattern through the scratch slot; there is
        // no immediate form for XMM loads.
        let wide = ty == VmType::Double;
        let bits = if wide {
            value.to_bits()
        } else {
            u64::from((value as f32).to_bits())
        };
        let lo_mem = self.scratch_mem(cu, 0);
        self.emit(Insn::MovImmMemLocal {
            imm: bits as u32 as i32,
            dst: lo_mem,
            width: Width::W32,
        });
        if wide {
            let hi_mem = self.scratch_mem(cu, 1);
            self.emit(Insn::MovImmMemLocal {
                imm: (bits >> 32) as u32 as i32,
                dst: hi_mem,
                width: Width::W32,
            });
        }
        let dst = self.new_xmm(cu);
        let mem = self.scratch_mem(cu, 0);
        self.emit(Insn::FMovMemLocalReg {
            src: mem,
            dst,
            wide,
        });
        Ok(Val::Xmm(dst))
    }

    fn load_slot<F>(&mut self, cu: &mut CompilationUnit, ty: VmType, mem: F) -> CodegenResult<Val>
    where
        F: Fn(&Self, &mut CompilationUnit, u32) -> MemLocal,
    {
        match ty.stack_type() {
            VmType::Float | VmType::Double => {
                let dst = self.new_xmm(cu);
                let src = mem(self, cu, 0);
                self.emit(Insn::FMovMemLocalReg {
                    src,
                    dst,
                    wide: ty == VmType::Double,
                });
                Ok(Val::Xmm(dst))
            }
            VmType::Long if self.long_is_pair() => {
                let lo = self.new_gpr(cu);
                let hi = self.new_gpr(cu);
                let src_lo = mem(self, cu, 0);
                self.emit(Insn::MovMemLocalReg {
                    src: src_lo,
                    dst: lo,
                    width: Width::W32,
                });
                let src_hi = mem(self, cu, 1);
                self.emit(Insn::MovMemLocalReg {
                    src: src_hi,
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            other => {
                let dst = self.new_gpr(cu);
                let src = mem(self, cu, 0);
                self.emit(Insn::MovMemLocalReg {
                    src,
                    dst,
                    width: self.ty_width(other),
                });
                Ok(Val::Gpr(dst))
            }
        }
    }

    fn load_field_mem(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        object: Reg,
        disp: i32,
    ) -> CodegenResult<Val> {
        match ty.stack_type() {
            VmType::Float | VmType::Double => {
                let dst = self.new_xmm(cu);
                self.emit(Insn::FMovMemBaseReg {
                    src: MemBase { base: object, disp },
                    dst,
                    wide: ty == VmType::Double,
                });
                Ok(Val::Xmm(dst))
            }
            VmType::Long if self.long_is_pair() => {
                let lo = self.new_gpr(cu);
                let hi = self.new_gpr(cu);
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase { base: object, disp },
                    dst: lo,
                    width: Width::W32,
                });
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase {
                        base: object,
                        disp: disp + 4,
                    },
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            _ => {
                let dst = self.new_gpr(cu);
                match ty {
                    VmType::Byte | VmType::Boolean => self.emit(Insn::MovSxMemBaseReg {
                        from: Width::W8,
                        src: MemBase { base: object, disp },
                        dst,
                    }),
                    VmType::Short => self.emit(Insn::MovSxMemBaseReg {
                        from: Width::W16,
                        src: MemBase { base: object, disp },
                        dst,
                    }),
                    VmType::Char => self.emit(Insn::MovZxMemBaseReg {
                        src: MemBase { base: object, disp },
                        dst,
                    }),
                    _ => self.emit(Insn::MovMemBaseReg {
                        src: MemBase { base: object, disp },
                        dst,
                        width: self.ty_width(ty),
                    }),
                }
                Ok(Val::Gpr(dst))
            }
        }
    }

    fn elem_shift(&self, ty: VmType) -> u8 {
        match ty {
            VmType::Byte | VmType::Boolean => 0,
            VmType::Char | VmType::Short => 1,
            VmType::Long | VmType::Double => 3,
            VmType::Reference => {
                if self.target.has_64bit_gprs() {
                    3
                } else {
                    2
                }
            }
            _ => 2,
        }
    }

    fn eval_array_deref(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        array: &Expr,
        index: &Expr,
    ) -> CodegenResult<Val> {
        let array = self.eval(cu, array)?.gpr();
        let index = self.eval(cu, index)?.gpr();
        let disp = self.env.array_data_offset();
        let shift = self.elem_shift(ty);
        let mem = MemIndex {
            base: array,
            index,
            shift,
            disp,
        };
        match ty.stack_type() {
            VmType::Float | VmType::Double => {
                let dst = self.new_xmm(cu);
                self.emit(Insn::FMovMemIndexReg {
                    src: mem,
                    dst,
                    wide: ty == VmType::Double,
                });
                Ok(Val::Xmm(dst))
            }
            VmType::Long if self.long_is_pair() => {
                let lo = self.new_gpr(cu);
                let hi = self.new_gpr(cu);
                self.emit(Insn::MovMemIndexReg {
                    src: mem,
                    dst: lo,
                    width: Width::W32,
                });
                self.emit(Insn::MovMemIndexReg {
                    src: MemIndex {
                        disp: disp + 4,
                        ..mem
                    },
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            _ => {
                let dst = self.new_gpr(cu);
                match ty {
                    VmType::Byte | VmType::Boolean => self.emit(Insn::MovSxMemIndexReg {
                        from: Width::W8,
                        src: mem,
                        dst,
                    }),
                    VmType::Short => self.emit(Insn::MovSxMemIndexReg {
                        from: Width::W16,
                        src: mem,
                        dst,
                    }),
                    VmType::Char => self.emit(Insn::MovZxMemIndexReg { src: mem, dst }),
                    _ => self.emit(Insn::MovMemIndexReg {
                        src: mem,
                        dst,
                        width: self.ty_width(ty),
                    }),
                }
                Ok(Val::Gpr(dst))
            }
        }
    }

    fn eval_binop(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<Val> {
        if op.is_comparison() {
            return Err(verify_err!("comparison used outside a branch"));
        }

        match op {
            BinOp::CmpL | BinOp::CmpG => return self.eval_cmp3(cu, op, left, right),
            _ => {}
        }

        match ty.stack_type() {
            VmType::Float | VmType::Double => self.eval_fbinop(cu, ty, op, left, right),
            VmType::Long if self.long_is_pair() => self.eval_long_pair_binop(cu, op, left, right),
            VmType::Long => self.eval_int_binop(cu, Width::W64, op, left, right),
            _ => self.eval_int_binop(cu, Width::W32, op, left, right),
        }
    }

    fn eval_int_binop(
        &mut self,
        cu: &mut CompilationUnit,
        width: Width,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<Val> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let alu = match op {
                    BinOp::Add => AluOp::Add,
                    BinOp::Sub => AluOp::Sub,
                    BinOp::And => AluOp::And,
                    BinOp::Or => AluOp::Or,
                    BinOp::Xor => AluOp::Xor,
                    _ => unreachable!(),
                };
                let dst = self.eval_into_fresh(cu, left, width)?;
                if let Some(imm) = const_imm32(right) {
                    self.emit(Insn::AluImmReg {
                        op: alu,
                        imm,
                        dst,
                        width,
                    });
                } else {
                    let src = self.eval(cu, right)?.gpr();
                    self.emit(Insn::AluRegReg {
                        op: alu,
                        src,
                        dst,
                        width,
                    });
                }
                Ok(Val::Gpr(dst))
            }
            BinOp::Mul => {
                let dst = self.eval_into_fresh(cu, left, width)?;
                let src = self.eval(cu, right)?.gpr();
                self.emit(Insn::IMulRegReg { src, dst, width });
                Ok(Val::Gpr(dst))
            }
            BinOp::Div | BinOp::Rem => {
                // idiv wants the dividend in xDX:xAX; cltd sets up xDX.
                let ax = self.fixed(cu, MachReg::Ax);
                let dx = self.fixed(cu, MachReg::Dx);
                let lhs = self.eval(cu, left)?.gpr();
                self.emit(Insn::MovRegReg {
                    src: lhs,
                    dst: ax,
                    width,
                });
                let divisor = self.eval(cu, right)?.gpr();
                self.emit(Insn::Cltd { ax, dx, width });
                self.emit(Insn::Div {
                    divisor,
                    ax,
                    dx,
                    width,
                });
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovRegReg {
                    src: if op == BinOp::Div { ax } else { dx },
                    dst,
                    width,
                });
                Ok(Val::Gpr(dst))
            }
            BinOp::Shl | BinOp::Shr | BinOp::Ushr => {
                let shift = match op {
                    BinOp::Shl => ShiftOp::Shl,
                    BinOp::Shr => ShiftOp::Sar,
                    _ => ShiftOp::Shr,
                };
                let dst = self.eval_into_fresh(cu, left, width)?;
                if let Some(imm) = const_imm32(right) {
                    self.emit(Insn::ShiftImmReg {
                        op: shift,
                        imm: imm as u8,
                        dst,
                        width,
                    });
                } else {
                    let count = self.eval(cu, right)?.gpr();
                    let cx = self.fixed(cu, MachReg::Cx);
                    self.emit(Insn::MovRegReg {
                        src: count,
                        dst: cx,
                        width: Width::W32,
                    });
                    self.emit(Insn::ShiftRegReg {
                        op: shift,
                        count: cx,
                        dst,
                        width,
                    });
                }
                Ok(Val::Gpr(dst))
            }
            other => Err(CodegenError::Unsupported(format!(
                "integer operator {:?}",
                other
            ))),
        }
    }

    /// Copy the left operand into a fresh register; two-address arithmetic
    /// destroys its destination.
    fn eval_into_fresh(
        &mut self,
        cu: &mut CompilationUnit,
        expr: &Expr,
        width: Width,
    ) -> CodegenResult<Reg> {
        let src = self.eval(cu, expr)?.gpr();
        let dst = self.new_gpr(cu);
        self.emit(Insn::MovRegReg { src, dst, width });
        Ok(dst)
    }

    fn eval_long_pair_binop(
        &mut self,
        cu: &mut CompilationUnit,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<Val> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let (first, second) = match op {
                    BinOp::Add => (AluOp::Add, AluOp::Adc),
                    BinOp::Sub => (AluOp::Sub, AluOp::Sbb),
                    BinOp::And => (AluOp::And, AluOp::And),
                    BinOp::Or => (AluOp::Or, AluOp::Or),
                    _ => (AluOp::Xor, AluOp::Xor),
                };
                let l = self.eval_pair(cu, left)?;
                let r = self.eval_pair(cu, right)?;
                let lo = self.copy_reg(cu, l.0, Width::W32);
                let hi = self.copy_reg(cu, l.1, Width::W32);
                self.emit(Insn::AluRegReg {
                    op: first,
                    src: r.0,
                    dst: lo,
                    width: Width::W32,
                });
                self.emit(Insn::AluRegReg {
                    op: second,
                    src: r.1,
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            BinOp::Mul | BinOp::Div | BinOp::Rem | BinOp::Shl | BinOp::Shr | BinOp::Ushr => {
                let helper = match op {
                    BinOp::Mul => Helper::Lmul,
                    BinOp::Div => Helper::Ldiv,
                    BinOp::Rem => Helper::Lrem,
                    BinOp::Shl => Helper::Lshl,
                    BinOp::Shr => Helper::Lshr,
                    _ => Helper::Lushr,
                };
                let l = self.eval(cu, left)?;
                let r = self.eval(cu, right)?;
                let ret = self.emit_helper_call(cu, helper, vec![l, r], Some(VmType::Long))?;
                Ok(ret.expect("long helper returns a value"))
            }
            other => Err(CodegenError::Unsupported(format!(
                "long operator {:?}",
                other
            ))),
        }
    }

    fn eval_pair(&mut self, cu: &mut CompilationUnit, expr: &Expr) -> CodegenResult<(Reg, Reg)> {
        match self.eval(cu, expr)? {
            Val::Pair { lo, hi } => Ok((lo, hi)),
            other => panic!("expected a register pair, got {:?}", other),
        }
    }

    fn copy_reg(&mut self, cu: &mut CompilationUnit, src: Reg, width: Width) -> Reg {
        let dst = self.new_gpr(cu);
        self.emit(Insn::MovRegReg { src, dst, width });
        dst
    }

    fn eval_fbinop(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<Val> {
        let wide = ty == VmType::Double;
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let falu = match op {
                    BinOp::Add => FAluOp::Add,
                    BinOp::Sub => FAluOp::Sub,
                    BinOp::Mul => FAluOp::Mul,
                    _ => FAluOp::Div,
                };
                let l = self.eval(cu, left)?.xmm();
                let dst = self.new_xmm(cu);
                self.emit(Insn::FMovRegReg {
                    src: l,
                    dst,
                    wide,
                });
                let src = self.eval(cu, right)?.xmm();
                self.emit(Insn::FAluRegReg {
                    op: falu,
                    src,
                    dst,
                    wide,
                });
                Ok(Val::Xmm(dst))
            }
            BinOp::Rem => {
                let helper = if wide { Helper::Drem } else { Helper::Frem };
                let l = self.eval(cu, left)?;
                let r = self.eval(cu, right)?;
                let ret = self.emit_helper_call(cu, helper, vec![l, r], Some(ty))?;
                Ok(ret.expect("remainder helper returns a value"))
            }
            other => Err(CodegenError::Unsupported(format!(
                "float operator {:?}",
                other
            ))),
        }
    }

    fn eval_cmp3(
        &mut self,
        cu: &mut CompilationUnit,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> CodegenResult<Val> {
        let operand_ty = left.ty();
        let helper = match (operand_ty, op) {
            (VmType::Long, _) => Helper::Lcmp,
            (VmType::Float, BinOp::CmpL) => Helper::Fcmpl,
            (VmType::Float, BinOp::CmpG) => Helper::Fcmpg,
            (VmType::Double, BinOp::CmpL) => Helper::Dcmpl,
            (_, _) => Helper::Dcmpg,
        };
        let l = self.eval(cu, left)?;
        let r = self.eval(cu, right)?;
        let ret = self.emit_helper_call(cu, helper, vec![l, r], Some(VmType::Int))?;
        Ok(ret.expect("compare helper returns a value"))
    }

    fn eval_neg(&mut self, cu: &mut CompilationUnit, ty: VmType, value: &Expr) -> CodegenResult<Val> {
        match ty.stack_type() {
            VmType::Float | VmType::Double => {
                // 0.0 - x; SSE has no scalar negate.
                let zero = self.eval_fconst(cu, ty, 0.0)?.xmm();
                let src = self.eval(cu, value)?.xmm();
                self.emit(Insn::FAluRegReg {
                    op: FAluOp::Sub,
                    src,
                    dst: zero,
                    wide: ty == VmType::Double,
                });
                Ok(Val::Xmm(zero))
            }
            VmType::Long if self.long_is_pair() => {
                // neg lo; adc hi, 0; neg hi
                let (lo, hi) = self.eval_pair(cu, value)?;
                let lo = self.copy_reg(cu, lo, Width::W32);
                let hi = self.copy_reg(cu, hi, Width::W32);
                self.emit(Insn::Neg {
                    dst: lo,
                    width: Width::W32,
                });
                self.emit(Insn::AluImmReg {
                    op: AluOp::Adc,
                    imm: 0,
                    dst: hi,
                    width: Width::W32,
                });
                self.emit(Insn::Neg {
                    dst: hi,
                    width: Width::W32,
                });
                Ok(Val::Pair { lo, hi })
            }
            other => {
                let width = self.ty_width(other);
                let dst = self.eval_into_fresh(cu, value, width)?;
                self.emit(Insn::Neg { dst, width });
                Ok(Val::Gpr(dst))
            }
        }
    }

    fn eval_convert(
        &mut self,
        cu: &mut CompilationUnit,
        from: VmType,
        to: VmType,
        value: &Expr,
    ) -> CodegenResult<Val> {
        use VmType::*;
        match (from, to) {
            (Int, Long) => {
                if self.long_is_pair() {
                    let src = self.eval(cu, value)?.gpr();
                    let lo = self.copy_reg(cu, src, Width::W32);
                    let hi = self.copy_reg(cu, src, Width::W32);
                    self.emit(Insn::ShiftImmReg {
                        op: ShiftOp::Sar,
                        imm: 31,
                        dst: hi,
                        width: Width::W32,
                    });
                    Ok(Val::Pair { lo, hi })
                } else {
                    let src = self.eval(cu, value)?.gpr();
                    let dst = self.new_gpr(cu);
                    self.emit(Insn::MovSx32Reg64 { src, dst });
                    Ok(Val::Gpr(dst))
                }
            }
            (Long, Int) => match self.eval(cu, value)? {
                Val::Pair { lo, .. } => Ok(Val::Gpr(self.copy_reg(cu, lo, Width::W32))),
                Val::Gpr(src) => Ok(Val::Gpr(self.copy_reg(cu, src, Width::W32))),
                other => panic!("long value in {:?}", other),
            },
            (Int, Float) | (Int, Double) => {
                let src = self.eval(cu, value)?.gpr();
                let dst = self.new_xmm(cu);
                self.emit(Insn::CvtIntToFloat {
                    src,
                    dst,
                    wide_int: false,
                    wide_float: to == Double,
                });
                Ok(Val::Xmm(dst))
            }
            (Long, Float) | (Long, Double) => {
                if self.long_is_pair() {
                    let helper = if to == Double { Helper::L2d } else { Helper::L2f };
                    let v = self.eval(cu, value)?;
                    let ret = self.emit_helper_call(cu, helper, vec![v], Some(to))?;
                    Ok(ret.expect("conversion helper returns a value"))
                } else {
                    let src = self.eval(cu, value)?.gpr();
                    let dst = self.new_xmm(cu);
                    self.emit(Insn::CvtIntToFloat {
                        src,
                        dst,
                        wide_int: true,
                        wide_float: to == Double,
                    });
                    Ok(Val::Xmm(dst))
                }
            }
            (Float, Int) | (Double, Int) => {
                let src = self.eval(cu, value)?.xmm();
                let dst = self.new_gpr(cu);
                self.emit(Insn::CvtFloatToInt {
                    src,
                    dst,
                    wide_int: false,
                    wide_float: from == Double,
                });
                Ok(Val::Gpr(dst))
            }
            (Float, Long) | (Double, Long) => {
                if self.long_is_pair() {
                    let helper = if from == Double { Helper::D2l } else { Helper::F2l };
                    let v = self.eval(cu, value)?;
                    let ret = self.emit_helper_call(cu, helper, vec![v], Some(Long))?;
                    Ok(ret.expect("conversion helper returns a value"))
                } else {
                    let src = self.eval(cu, value)?.xmm();
                    let dst = self.new_gpr(cu);
                    self.emit(Insn::CvtFloatToInt {
                        src,
                        dst,
                        wide_int: true,
                        wide_float: from == Double,
                    });
                    Ok(Val::Gpr(dst))
                }
            }
            (Float, Double) | (Double, Float) => {
                let src = self.eval(cu, value)?.xmm();
                let dst = self.new_xmm(cu);
                self.emit(Insn::CvtFloatToFloat {
                    src,
                    dst,
                    to_wide: to == Double,
                });
                Ok(Val::Xmm(dst))
            }
            (a, b) => Err(CodegenError::Unsupported(format!(
                "conversion {:?} -> {:?}",
                a, b
            ))),
        }
    }

    fn eval_truncate(
        &mut self,
        cu: &mut CompilationUnit,
        to: VmType,
        value: &Expr,
    ) -> CodegenResult<Val> {
        let src = self.eval(cu, value)?.gpr();
        let dst = self.new_gpr(cu);
        match to {
            VmType::Byte => {
                // Byte registers are only generally encodable with REX;
                // on x86-32 route the value through xAX.
                if self.target == Target::Ia32 {
                    let ax = self.fixed(cu, MachReg::Ax);
                    self.emit(Insn::MovRegReg {
                        src,
                        dst: ax,
                        width: Width::W32,
                    });
                    self.emit(Insn::MovSxReg {
                        from: Width::W8,
                        src: ax,
                        dst,
                    });
                } else {
                    self.emit(Insn::MovSxReg {
                        from: Width::W8,
                        src,
                        dst,
                    });
                }
            }
            VmType::Short => self.emit(Insn::MovSxReg {
                from: Width::W16,
                src,
                dst,
            }),
            _ => self.emit(Insn::MovZxReg { src, dst }),
        }
        Ok(Val::Gpr(dst))
    }

    // ---- statements --------------------------------------------------

    /// Returns true when the statement ended the block with an explicit
    /// control transfer.
    fn select_stmt(
        &mut self,
        cu: &mut CompilationUnit,
        _block: BlockId,
        block_start: u32,
        stmt: &Stmt,
    ) -> CodegenResult<bool> {
        match stmt {
            Stmt::Store { dest, value } => {
                let val = self.eval(cu, value)?;
                self.store_slot(cu, dest, val)?;
                Ok(false)
            }
            Stmt::ArrayStore {
                ty,
                array,
                index,
                value,
            } => {
                let value = self.eval(cu, value)?;
                let array = self.eval(cu, array)?.gpr();
                let index = self.eval(cu, index)?.gpr();
                self.store_array_elem(cu, *ty, array, index, value)?;
                Ok(false)
            }
            Stmt::FieldStore {
                field,
                object,
                value,
            } => {
                let value = self.eval(cu, value)?;
                let object = self.eval(cu, object)?.gpr();
                self.store_field(cu, field.vm_type, object, field.offset as i32, value)?;
                Ok(false)
            }
            Stmt::StaticStore {
                class,
                field,
                value,
            } => {
                let value = self.eval(cu, value)?;
                let (addr, fixup) = self.static_addr(cu, class, field, 0);
                match value {
                    Val::Xmm(src) => self.emit(Insn::FMovRegMemDisp {
                        src,
                        addr,
                        wide: field.vm_type == VmType::Double,
                        fixup,
                    }),
                    Val::Pair { lo, hi } => {
                        self.emit(Insn::MovRegMemDisp {
                            src: lo,
                            addr,
                            width: Width::W32,
                            fixup,
                        });
                        let (addr_hi, fixup_hi) = self.static_addr(cu, class, field, 4);
                        self.emit(Insn::MovRegMemDisp {
                            src: hi,
                            addr: addr_hi,
                            width: Width::W32,
                            fixup: fixup_hi,
                        });
                    }
                    Val::Gpr(src) => self.emit(Insn::MovRegMemDisp {
                        src,
                        addr,
                        width: self.ty_width(field.vm_type),
                        fixup,
                    }),
                }
                Ok(false)
            }
            Stmt::Expression { expr } => {
                if let Expr::Invoke {
                    ty,
                    kind,
                    method,
                    args,
                } = expr
                {
                    self.select_invoke(cu, *kind, method, args, *ty)?;
                } else {
                    self.eval(cu, expr)?;
                }
                Ok(false)
            }
            Stmt::If { cond, target } => {
                self.select_if(cu, block_start, cond, *target)?;
                Ok(false)
            }
            Stmt::Goto { target } => {
                self.maybe_safepoint(block_start, cu.blocks[*target].start);
                self.emit(Insn::Branch {
                    cond: None,
                    target: *target,
                });
                Ok(true)
            }
            Stmt::Switch {
                value,
                cases,
                default,
            } => {
                let value = self.eval(cu, value)?.gpr();
                for &(key, target) in cases {
                    self.emit(Insn::CmpImmReg {
                        imm: key,
                        dst: value,
                        width: Width::W32,
                    });
                    self.emit(Insn::Branch {
                        cond: Some(Cond::E),
                        target,
                    });
                }
                self.emit(Insn::Branch {
                    cond: None,
                    target: *default,
                });
                Ok(true)
            }
            Stmt::Return { value } => {
                if let Some(value) = value {
                    let val = self.eval(cu, value)?;
                    self.move_to_return_reg(cu, val);
                }
                self.emit(Insn::Branch {
                    cond: None,
                    target: cu.exit_block,
                });
                Ok(true)
            }
            Stmt::Throw { exception } => {
                let exception = self.eval(cu, exception)?;
                self.emit_helper_call(cu, Helper::Throw, vec![exception], None)?;
                self.emit(Insn::Branch {
                    cond: None,
                    target: cu.unwind_block,
                });
                Ok(true)
            }
            Stmt::MonitorEnter { object } => {
                let object = self.eval(cu, object)?;
                self.emit_helper_call(cu, Helper::ObjectLock, vec![object], None)?;
                self.emit_exception_test(cu);
                Ok(false)
            }
            Stmt::MonitorExit { object } => {
                let object = self.eval(cu, object)?;
                self.emit_helper_call(cu, Helper::ObjectUnlock, vec![object], None)?;
                self.emit_exception_test(cu);
                Ok(false)
            }
            Stmt::NullCheck { .. } => {
                // Null dereferences trap through the zero page; the check
                // statement only marks the site.
                Ok(false)
            }
            Stmt::DivZeroCheck { .. } => {
                // Integer division faults with SIGFPE; nothing to emit.
                Ok(false)
            }
            Stmt::BoundsCheck { array, index } => {
                let array = self.eval(cu, array)?.gpr();
                let index = self.eval(cu, index)?.gpr();
                let len = self.new_gpr(cu);
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase {
                        base: array,
                        disp: self.env.array_length_offset(),
                    },
                    dst: len,
                    width: Width::W32,
                });
                self.emit(Insn::CmpRegReg {
                    src: len,
                    dst: index,
                    width: Width::W32,
                });
                self.emit(Insn::TrapIf {
                    cond: Cond::Ae,
                    kind: TrapKind::ArrayBounds,
                });
                Ok(false)
            }
            Stmt::StoreCheck { array, value } => {
                let array = self.eval(cu, array)?;
                let value = self.eval(cu, value)?;
                self.emit_helper_call(cu, Helper::CheckArrayStore, vec![array, value], None)?;
                self.emit_exception_test(cu);
                Ok(false)
            }
            Stmt::CheckCast { class, object } => {
                let class_addr = self.imm_gpr(cu, self.env.class_runtime_addr(class) as i64);
                let object = self.eval(cu, object)?;
                self.emit_helper_call(
                    cu,
                    Helper::CheckCast,
                    vec![Val::Gpr(class_addr), object],
                    None,
                )?;
                self.emit_exception_test(cu);
                Ok(false)
            }
            Stmt::RetJump { local } => {
                let target = self
                    .load_slot(cu, VmType::Reference, |sel, cu, word| {
                        sel.local_mem(cu, *local, VmType::Reference, word)
                    })?
                    .gpr();
                self.emit(Insn::JmpReg { src: target });
                Ok(true)
            }
        }
    }

    fn store_slot(&mut self, cu: &mut CompilationUnit, dest: &Expr, val: Val) -> CodegenResult<()> {
        // Temporaries other than the exception slot live in registers.
        if let Expr::Temporary { ty, id } = dest {
            if *id != crate::hirgen::EXCEPTION_TEMP {
                return self.store_temp_reg(cu, *ty, *id, val);
            }
        }

        let (ty, mem_of): (VmType, Box<dyn Fn(&Self, &mut CompilationUnit, u32) -> MemLocal>) =
            match dest {
                Expr::Local { ty, index } => {
                    let (ty, index) = (*ty, *index);
                    (ty, Box::new(move |sel: &Self, cu: &mut _, word| {
                        sel.local_mem(cu, index, ty, word)
                    }))
                }
                Expr::Temporary { ty, id } => {
                    let (ty, id) = (*ty, *id);
                    (ty, Box::new(move |sel: &Self, cu: &mut _, word| {
                        sel.temp_mem(cu, id, ty, word)
                    }))
                }
                other => return Err(verify_err!("store into non-slot {:?}", other)),
            };

        match val {
            Val::Xmm(src) => {
                let dst = mem_of(self, cu, 0);
                self.emit(Insn::FMovRegMemLocal {
                    src,
                    dst,
                    wide: ty == VmType::Double,
                });
            }
            Val::Pair { lo, hi } => {
                let dst_lo = mem_of(self, cu, 0);
                self.emit(Insn::MovRegMemLocal {
                    src: lo,
                    dst: dst_lo,
                    width: Width::W32,
                });
                let dst_hi = mem_of(self, cu, 1);
                self.emit(Insn::MovRegMemLocal {
                    src: hi,
                    dst: dst_hi,
                    width: Width::W32,
                });
            }
            Val::Gpr(src) => {
                let dst = mem_of(self, cu, 0);
                self.emit(Insn::MovRegMemLocal {
                    src,
                    dst,
                    width: self.ty_width(ty),
                });
            }
        }
        Ok(())
    }

    fn store_temp_reg(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        id: u32,
        val: Val,
    ) -> CodegenResult<()> {
        match (cu.temp_loc(id, ty, self.long_is_pair()), val) {
            (crate::cu::TempLoc::Gpr(dst), Val::Gpr(src)) => {
                self.emit(Insn::MovRegReg {
                    src,
                    dst: Reg::Virt(dst),
                    width: self.ty_width(ty),
                });
            }
            (crate::cu::TempLoc::Pair(lo, hi), Val::Pair { lo: slo, hi: shi }) => {
                self.emit(Insn::MovRegReg {
                    src: slo,
                    dst: Reg::Virt(lo),
                    width: Width::W32,
                });
                self.emit(Insn::MovRegReg {
                    src: shi,
                    dst: Reg::Virt(hi),
                    width: Width::W32,
                });
            }
            (crate::cu::TempLoc::Xmm(dst), Val::Xmm(src)) => {
                self.emit(Insn::FMovRegReg {
                    src,
                    dst: Reg::Virt(dst),
                    wide: ty == VmType::Double,
                });
            }
            (loc, val) => {
                return Err(verify_err!(
                    "temporary {} shape mismatch: {:?} vs {:?}",
                    id,
                    loc,
                    val
                ))
            }
        }
        Ok(())
    }

    fn store_array_elem(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        array: Reg,
        index: Reg,
        value: Val,
    ) -> CodegenResult<()> {
        let disp = self.env.array_data_offset();
        let mem = MemIndex {
            base: array,
            index,
            shift: self.elem_shift(ty),
            disp,
        };
        match value {
            Val::Xmm(src) => self.emit(Insn::FMovRegMemIndex {
                src,
                dst: mem,
                wide: ty == VmType::Double,
            }),
            Val::Pair { lo, hi } => {
                self.emit(Insn::MovRegMemIndex {
                    src: lo,
                    dst: mem,
                    width: Width::W32,
                });
                self.emit(Insn::MovRegMemIndex {
                    src: hi,
                    dst: MemIndex {
                        disp: disp + 4,
                        ..mem
                    },
                    width: Width::W32,
                });
            }
            Val::Gpr(src) => {
                let width = match ty {
                    VmType::Byte | VmType::Boolean => Width::W8,
                    VmType::Char | VmType::Short => Width::W16,
                    other => self.ty_width(other),
                };
                let src = if width == Width::W8 && self.target == Target::Ia32 {
                    // Only xAX..xBX address their low byte without REX.
                    let ax = self.fixed(cu, MachReg::Ax);
                    self.emit(Insn::MovRegReg {
                        src,
                        dst: ax,
                        width: Width::W32,
                    });
                    ax
                } else {
                    src
                };
                self.emit(Insn::MovRegMemIndex {
                    src,
                    dst: mem,
                    width,
                });
            }
        }
        Ok(())
    }

    fn store_field(
        &mut self,
        cu: &mut CompilationUnit,
        ty: VmType,
        object: Reg,
        disp: i32,
        value: Val,
    ) -> CodegenResult<()> {
        let mem = MemBase { base: object, disp };
        match value {
            Val::Xmm(src) => self.emit(Insn::FMovRegMemBase {
                src,
                dst: mem,
                wide: ty == VmType::Double,
            }),
            Val::Pair { lo, hi } => {
                self.emit(Insn::MovRegMemBase {
                    src: lo,
                    dst: mem,
                    width: Width::W32,
                });
                self.emit(Insn::MovRegMemBase {
                    src: hi,
                    dst: MemBase {
                        base: object,
                        disp: disp + 4,
                    },
                    width: Width::W32,
                });
            }
            Val::Gpr(src) => {
                let width = match ty {
                    VmType::Byte | VmType::Boolean => Width::W8,
                    VmType::Char | VmType::Short => Width::W16,
                    other => self.ty_width(other),
                };
                let src = if width == Width::W8 && self.target == Target::Ia32 {
                    let ax = self.fixed(cu, MachReg::Ax);
                    self.emit(Insn::MovRegReg {
                        src,
                        dst: ax,
                        width: Width::W32,
                    });
                    ax
                } else {
                    src
                };
                self.emit(Insn::MovRegMemBase {
                    src,
                    dst: mem,
                    width,
                });
            }
        }
        Ok(())
    }

    fn select_if(
        &mut self,
        cu: &mut CompilationUnit,
        block_start: u32,
        cond: &Expr,
        target: BlockId,
    ) -> CodegenResult<()> {
        let (op, left, right) = match cond {
            Expr::Binop {
                op, left, right, ..
            } if op.is_comparison() => (*op, left, right),
            other => return Err(verify_err!("non-comparison branch condition {:?}", other)),
        };

        let width = self.ty_width(left.ty());
        let lhs = self.eval(cu, left)?.gpr();
        if let Some(imm) = const_imm32(right) {
            self.emit(Insn::CmpImmReg {
                imm,
                dst: lhs,
                width,
            });
        } else {
            let rhs = self.eval(cu, right)?.gpr();
            self.emit(Insn::CmpRegReg {
                src: rhs,
                dst: lhs,
                width,
            });
        }

        self.maybe_safepoint(block_start, cu.blocks[target].start);
        self.emit(Insn::Branch {
            cond: Some(match op {
                BinOp::Eq => Cond::E,
                BinOp::Ne => Cond::Ne,
                BinOp::Lt => Cond::L,
                BinOp::Ge => Cond::Ge,
                BinOp::Gt => Cond::G,
                _ => Cond::Le,
            }),
            target,
        });
        Ok(())
    }

    /// Probe the GC safepoint page before loop back edges.
    fn maybe_safepoint(&mut self, block_start: u32, target_start: u32) {
        if target_start <= block_start {
            self.emit(Insn::TestImmMemDisp {
                imm: 0,
                addr: self.env.safepoint_page(),
            });
        }
    }

    fn move_to_return_reg(&mut self, cu: &mut CompilationUnit, val: Val) {
        match val {
            Val::Xmm(src) => {
                let xmm0 = self.fixed(cu, MachReg::Xmm0);
                self.emit(Insn::FMovRegReg {
                    src,
                    dst: xmm0,
                    wide: true,
                });
            }
            Val::Pair { lo, hi } => {
                let ax = self.fixed(cu, MachReg::Ax);
                let dx = self.fixed(cu, MachReg::Dx);
                self.emit(Insn::MovRegReg {
                    src: lo,
                    dst: ax,
                    width: Width::W32,
                });
                self.emit(Insn::MovRegReg {
                    src: hi,
                    dst: dx,
                    width: Width::W32,
                });
            }
            Val::Gpr(src) => {
                let ax = self.fixed(cu, MachReg::Ax);
                self.emit(Insn::MovRegReg {
                    src,
                    dst: ax,
                    width: self.word(),
                });
            }
        }
    }

    // ---- calls -------------------------------------------------------

    fn select_invoke(
        &mut self,
        cu: &mut CompilationUnit,
        kind: InvokeKind,
        method: &Arc<Method>,
        args: &[Expr],
        ret: VmType,
    ) -> CodegenResult<Option<Val>> {
        let mut vals = Vec::with_capacity(args.len());
        for arg in args {
            vals.push(self.eval(cu, arg)?);
        }
        let ret_ty = if ret == VmType::Void { None } else { Some(ret) };

        let result = match kind {
            InvokeKind::Static | InvokeKind::Special => {
                let fixup = if method.is_jit_eligible() {
                    let id = cu.call_fixups.len() as u32;
                    cu.call_fixups.push(CallFixupSite {
                        target: Arc::clone(method),
                        mach_offset: 0,
                    });
                    Some(id)
                } else {
                    None
                };
                let target = self.env.method_entry(method);
                self.emit_call(cu, CallDest::Rel { target, fixup }, vals, ret_ty)?
            }
            InvokeKind::Virtual => {
                let receiver = vals[0].gpr();
                let class = self.new_gpr(cu);
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase {
                        base: receiver,
                        disp: 0,
                    },
                    dst: class,
                    width: self.word(),
                });
                let entry = self.new_gpr(cu);
                self.emit(Insn::MovMemBaseReg {
                    src: MemBase {
                        base: class,
                        disp: self.env.vtable_slot_offset(method.virtual_index),
                    },
                    dst: entry,
                    width: self.word(),
                });
                self.emit_call(cu, CallDest::Reg(entry), vals, ret_ty)?
            }
            InvokeKind::Interface => match self.target {
                Target::Ia32 => {
                    self.select_itable_call(cu, method, vals, ret_ty)?
                }
                Target::X64 => {
                    let receiver = vals[0];
                    let hash =
                        self.imm_gpr(cu, i64::from(method.signature_hash()));
                    let entry = self
                        .emit_helper_call(
                            cu,
                            Helper::ResolveInterface,
                            vec![receiver, Val::Gpr(hash)],
                            Some(VmType::Reference),
                        )?
                        .expect("resolver returns an entry")
                        .gpr();
                    self.emit_call(cu, CallDest::Reg(entry), vals, ret_ty)?
                }
            },
        };

        self.emit_exception_test(cu);
        Ok(result)
    }

    /// x86-32 interface dispatch: the per-class resolver stub expects the
    /// signature hash in xAX and the receiver on the stack.
    fn select_itable_call(
        &mut self,
        cu: &mut CompilationUnit,
        method: &Arc<Method>,
        vals: Vec<Val>,
        ret_ty: Option<VmType>,
    ) -> CodegenResult<Option<Val>> {
        let receiver = vals[0].gpr();
        let class = self.new_gpr(cu);
        self.emit(Insn::MovMemBaseReg {
            src: MemBase {
                base: receiver,
                disp: 0,
            },
            dst: class,
            width: Width::W32,
        });
        let resolver = self.new_gpr(cu);
        self.emit(Insn::MovMemBaseReg {
            src: MemBase {
                base: class,
                disp: self.env.itable_resolver_offset(),
            },
            dst: resolver,
            width: Width::W32,
        });

        // Marshal the ordinary arguments, then pin the hash last so no
        // push clobbers it.
        let slots = self.push_args_ia32(cu, &vals);
        let ax = self.fixed(cu, MachReg::Ax);
        self.emit(Insn::MovImmReg {
            imm: i64::from(method.signature_hash()),
            dst: ax,
            width: Width::W32,
        });
        let ret = self.fixed_return_reg(cu, ret_ty);
        self.emit(Insn::CallReg {
            src: resolver,
            args: smallvec![ax],
            ret,
            stack_adjust: slots * 4,
        });
        Ok(self.copy_from_return_reg(cu, ret_ty, ret))
    }

    fn emit_helper_call(
        &mut self,
        cu: &mut CompilationUnit,
        helper: Helper,
        args: Vec<Val>,
        ret_ty: Option<VmType>,
    ) -> CodegenResult<Option<Val>> {
        let target = self.env.helper(helper);
        self.emit_call(cu, CallDest::Rel { target, fixup: None }, args, ret_ty)
    }

    fn emit_call(
        &mut self,
        cu: &mut CompilationUnit,
        dest: CallDest,
        args: Vec<Val>,
        ret_ty: Option<VmType>,
    ) -> CodegenResult<Option<Val>> {
        let (arg_regs, stack_adjust) = match self.target {
            Target::Ia32 => {
                let slots = self.push_args_ia32(cu, &args);
                (SmallVec::new(), slots * 4)
            }
            Target::X64 => self.marshal_args_x64(cu, &args),
        };

        let ret = self.fixed_return_reg(cu, ret_ty);
        match dest {
            CallDest::Rel { target, fixup } => self.emit(Insn::CallRel {
                target,
                args: arg_regs,
                ret,
                stack_adjust,
                fixup,
            }),
            CallDest::Reg(src) => self.emit(Insn::CallReg {
                src,
                args: arg_regs,
                ret,
                stack_adjust,
            }),
        }
        Ok(self.copy_from_return_reg(cu, ret_ty, ret))
    }

    /// Push arguments right-to-left (cdecl); returns the pushed slot
    /// count.
    fn push_args_ia32(&mut self, cu: &mut CompilationUnit, args: &[Val]) -> u32 {
        let mut slots = 0;
        for arg in args.iter().rev() {
            match *arg {
                Val::Gpr(src) => {
                    self.emit(Insn::PushReg { src });
                    slots += 1;
                }
                Val::Pair { lo, hi } => {
                    self.emit(Insn::PushReg { src: hi });
                    self.emit(Insn::PushReg { src: lo });
                    slots += 2;
                }
                Val::Xmm(src) => {
                    // No push for XMM; bounce through the scratch slot.
                    let wide = true;
                    let dst = self.scratch_mem(cu, 0);
                    self.emit(Insn::FMovRegMemLocal { src, dst, wide });
                    let hi = self.scratch_mem(cu, 1);
                    self.emit(Insn::PushMemLocal { src: hi });
                    let lo = self.scratch_mem(cu, 0);
                    self.emit(Insn::PushMemLocal { src: lo });
                    slots += 2;
                }
            }
        }
        slots
    }

    /// System-V argument marshalling; returns the fixed registers used
    /// (for liveness) and the stack cleanup size.
    fn marshal_args_x64(
        &mut self,
        cu: &mut CompilationUnit,
        args: &[Val],
    ) -> (SmallVec<[Reg; 8]>, u32) {
        let env_regs = self.target.regs();
        let mut used: SmallVec<[Reg; 8]> = SmallVec::new();
        let mut gpr_next = 0;
        let mut xmm_next = 0;
        let mut stack: Vec<Val> = Vec::new();

        for arg in args {
            match *arg {
                Val::Gpr(src) => {
                    if gpr_next < env_regs.gpr_args.len() {
                        let dst = self.fixed(cu, env_regs.gpr_args[gpr_next]);
                        gpr_next += 1;
                        self.emit(Insn::MovRegReg {
                            src,
                            dst,
                            width: Width::W64,
                        });
                        used.push(dst);
                    } else {
                        stack.push(*arg);
                    }
                }
                Val::Xmm(src) => {
                    if xmm_next < env_regs.xmm_args.len() {
                        let dst = self.fixed(cu, env_regs.xmm_args[xmm_next]);
                        xmm_next += 1;
                        self.emit(Insn::FMovRegReg {
                            src,
                            dst,
                            wide: true,
                        });
                        used.push(dst);
                    } else {
                        stack.push(*arg);
                    }
                }
                Val::Pair { .. } => unreachable!("register pairs are x86-32 only"),
            }
        }

        let mut slots = 0;
        for arg in stack.iter().rev() {
            match *arg {
                Val::Gpr(src) => {
                    self.emit(Insn::PushReg { src });
                    slots += 1;
                }
                Val::Xmm(src) => {
                    let dst = self.scratch_mem(cu, 0);
                    self.emit(Insn::FMovRegMemLocal {
                        src,
                        dst,
                        wide: true,
                    });
                    let mem = self.scratch_mem(cu, 0);
                    self.emit(Insn::PushMemLocal { src: mem });
                    slots += 1;
                }
                Val::Pair { .. } => unreachable!(),
            }
        }

        (used, slots * 8)
    }

    fn fixed_return_reg(&self, cu: &CompilationUnit, ret_ty: Option<VmType>) -> Option<Reg> {
        ret_ty.map(|ty| {
            if ty.is_float() {
                self.fixed(cu, MachReg::Xmm0)
            } else {
                self.fixed(cu, MachReg::Ax)
            }
        })
    }

    fn copy_from_return_reg(
        &mut self,
        cu: &mut CompilationUnit,
        ret_ty: Option<VmType>,
        ret: Option<Reg>,
    ) -> Option<Val> {
        let ty = ret_ty?;
        let ret = ret.expect("return register for non-void call");
        Some(match ty.stack_type() {
            VmType::Float | VmType::Double => {
                let dst = self.new_xmm(cu);
                self.emit(Insn::FMovRegReg {
                    src: ret,
                    dst,
                    wide: ty == VmType::Double,
                });
                Val::Xmm(dst)
            }
            VmType::Long if self.long_is_pair() => {
                let dx = self.fixed(cu, MachReg::Dx);
                let lo = self.copy_reg(cu, ret, Width::W32);
                let hi = self.copy_reg(cu, dx, Width::W32);
                Val::Pair { lo, hi }
            }
            other => {
                let dst = self.new_gpr(cu);
                self.emit(Insn::MovRegReg {
                    src: ret,
                    dst,
                    width: self.ty_width(other),
                });
                Val::Gpr(dst)
            }
        })
    }

    /// Inline post-call exception poll.
    fn emit_exception_test(&mut self, _cu: &mut CompilationUnit) {
        let scratch = Reg::Mach(self.target.regs().gpr_scratch);
        self.emit(Insn::ExcTest { scratch });
    }

    fn static_addr(
        &mut self,
        cu: &mut CompilationUnit,
        class: &Arc<javelin_environ::Class>,
        field: &Arc<javelin_environ::Field>,
        word_offset: u32,
    ) -> (usize, Option<u32>) {
        match self.env.static_field_addr(class, field) {
            StaticFieldAddr::Ready(addr) => (addr + word_offset as usize, None),
            StaticFieldAddr::Guarded(addr) => {
                let id = cu.static_fixups.len() as u32;
                cu.static_fixups.push(StaticFixupSite {
                    class: Arc::clone(class),
                    field: Arc::clone(field),
                    word_offset,
                    mach_offset: 0,
                });
                (addr + word_offset as usize, Some(id))
            }
        }
    }
}

/// A constant operand encodable as imm32.
fn const_imm32(expr: &Expr) -> Option<i32> {
    match expr {
        Expr::Value { value, .. } => i32::try_from(*value).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::analyze_control_flow;
    use crate::cu::tests::test_method;
    use crate::hirgen::build_hir;
    use crate::hooks::tests::StubEnv;
    use crate::bytecode::opc::*;

    fn select(code: Vec<u8>, target: Target) -> CompilationUnit {
        let mut cu = CompilationUnit::new(test_method(code, 4), target);
        let env = StubEnv::default();
        analyze_control_flow(&mut cu).unwrap();
        build_hir(&mut cu, &env).unwrap();
        select_instructions(&mut cu, &env).unwrap();
        cu
    }

    fn all_insns(cu: &CompilationUnit) -> Vec<&Insn> {
        cu.layout
            .iter()
            .flat_map(|&b| cu.blocks[b].insns.iter().map(|i| &i.op))
            .collect()
    }

    #[test]
    fn division_precolors_ax_and_dx() {
        let cu = select(vec![ILOAD_0, ILOAD_0 + 1, IDIV, IRETURN], Target::X64);
        let insns = all_insns(&cu);
        let div = insns
            .iter()
            .find_map(|i| match i {
                Insn::Div { ax, dx, .. } => Some((*ax, *dx)),
                _ => None,
            })
            .expect("division selected");
        assert_eq!(div.0.as_virt(), Some(cu.fixed_vreg(MachReg::Ax)));
        assert_eq!(div.1.as_virt(), Some(cu.fixed_vreg(MachReg::Dx)));
    }

    #[test]
    fn shift_count_goes_through_cx() {
        let cu = select(vec![ILOAD_0, ILOAD_0 + 1, ISHL, IRETURN], Target::X64);
        let insns = all_insns(&cu);
        let count = insns
            .iter()
            .find_map(|i| match i {
                Insn::ShiftRegReg { count, .. } => Some(*count),
                _ => None,
            })
            .expect("shift selected");
        assert_eq!(count.as_virt(), Some(cu.fixed_vreg(MachReg::Cx)));
    }

    #[test]
    fn long_add_on_ia32_uses_carry_chain() {
        let cu = select(vec![LLOAD_0, LLOAD_0 + 2, LADD, LRETURN], Target::Ia32);
        let insns = all_insns(&cu);
        let has_adc = insns
            .iter()
            .any(|i| matches!(i, Insn::AluRegReg { op: AluOp::Adc, .. }));
        assert!(has_adc, "expected add/adc pair");
    }

    #[test]
    fn long_add_on_x64_is_native() {
        let cu = select(vec![LLOAD_0, LLOAD_0 + 2, LADD, LRETURN], Target::X64);
        let insns = all_insns(&cu);
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::AluRegReg {
                op: AluOp::Add,
                width: Width::W64,
                ..
            }
        )));
        assert!(!insns
            .iter()
            .any(|i| matches!(i, Insn::AluRegReg { op: AluOp::Adc, .. })));
    }

    #[test]
    fn bounds_check_traps_unsigned() {
        let cu = select(vec![ALOAD_0, ICONST_0, IALOAD, IRETURN], Target::X64);
        let insns = all_insns(&cu);
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::TrapIf {
                cond: Cond::Ae,
                kind: TrapKind::ArrayBounds
            }
        )));
    }

    #[test]
    fn every_block_ends_with_a_branch_or_terminator() {
        let cu = select(
            vec![ILOAD_0, IFLE, 0x00, 0x07, ICONST_1, GOTO, 0x00, 0x04, ICONST_0, IRETURN],
            Target::X64,
        );
        for &block in &cu.layout {
            let last = cu.blocks[block].insns.last().expect("nonempty block");
            assert!(
                matches!(last.op, Insn::Branch { .. } | Insn::JmpReg { .. }),
                "block {} ends with {:?}",
                block,
                last.op
            );
        }
    }

    #[test]
    fn backward_branch_polls_the_safepoint_page() {
        // 0: iload_0; 1: ifle +? forward; 4: iinc 0 -1; 7: goto 0 (back edge)
        let cu = select(
            vec![ILOAD_0, IFLE, 0x00, 0x09, IINC, 0x00, 0xff, GOTO, 0xff, 0xf9, RETURN],
            Target::X64,
        );
        let insns = all_insns(&cu);
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::TestImmMemDisp { addr, .. }
                if *addr == crate::hooks::tests::STUB_SAFEPOINT_PAGE
        )));
    }

    #[test]
    fn positions_are_even_and_increasing() {
        let cu = select(vec![ICONST_0, ISTORE_0, ILOAD_0, IRETURN], Target::X64);
        let mut last = None;
        for &block in &cu.layout {
            for insn in &cu.blocks[block].insns {
                assert_eq!(insn.pos % 2, 0);
                if let Some(prev) = last {
                    assert!(insn.pos > prev);
                }
                last = Some(insn.pos);
            }
        }
    }
}
