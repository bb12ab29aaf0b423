//! Bytecode to HIR translation.
//!
//! Each block is translated by abstract interpretation of the typed
//! operand stack: pops build expression trees, side effects become
//! statements. Values still on the mirror stack at a block boundary are
//! stored into shared temporaries and reloaded by the successors.

use std::sync::Arc;

use log::trace;
use rustc_hash::FxHashMap;

use javelin_environ::{Class, Field, Method, VmType};

use crate::bytecode::{self, opc};
use crate::cu::{BlockId, CompilationUnit};
use crate::error::{verify_err, CodegenError, CodegenResult};
use crate::hir::{BinOp, Expr, InvokeKind, Stmt};
use crate::hooks::CompileEnv;

/// Temporary id reserved for the in-flight exception on handler entry.
pub const EXCEPTION_TEMP: u32 = 0;

/// Populate every block's statement list from the method bytecode.
pub fn build_hir(cu: &mut CompilationUnit, env: &dyn CompileEnv) -> CodegenResult<()> {
    debug_assert!(cu.is_analyzed);

    let exception_slot = cu.exception_spill_slot;
    cu.temp_slots.entry(EXCEPTION_TEMP).or_insert(exception_slot);

    let mut builder = HirBuilder {
        env,
        method: cu.method.clone(),
        class: cu.method.class(),
        code: Arc::from(cu.method.code.as_slice()),
        stack: Vec::new(),
        stmts: Vec::new(),
        bc: 0,
        next_temp: EXCEPTION_TEMP + 1,
        transfer_temps: FxHashMap::default(),
        entry_stacks: FxHashMap::default(),
        processed: Vec::new(),
    };

    for i in 0..cu.layout.len() {
        let block = cu.layout[i];
        builder.convert_block(cu, block)?;
    }

    trace!(
        "hir: {}.{} translated, {} temps",
        builder.class.name,
        builder.method.name,
        builder.next_temp - 1
    );
    Ok(())
}

struct HirBuilder<'a> {
    env: &'a dyn CompileEnv,
    method: Arc<Method>,
    class: Arc<Class>,
    code: Arc<[u8]>,
    stack: Vec<Expr>,
    stmts: Vec<(u32, Stmt)>,
    /// Bytecode offset of the instruction being converted; stamped onto
    /// emitted statements for the exception-table map.
    bc: u32,
    next_temp: u32,
    /// Shared inter-block transfer temporaries, keyed by stack depth and
    /// transferred type.
    transfer_temps: FxHashMap<(u32, VmType), u32>,
    /// Expected operand stack on entry to a block, as `(type, temp)` pairs
    /// bottom-up.
    entry_stacks: FxHashMap<BlockId, Vec<(VmType, u32)>>,
    processed: Vec<BlockId>,
}

impl<'a> HirBuilder<'a> {
    fn convert_block(&mut self, cu: &mut CompilationUnit, block: BlockId) -> CodegenResult<()> {
        let (start, end, is_eh_entry) = {
            let data = &cu.blocks[block];
            (data.start, data.end, data.is_eh_entry)
        };

        self.stack.clear();
        self.stmts.clear();

        if is_eh_entry {
            // The unwind path parks the exception in its reserved slot.
            self.stack.push(Expr::Temporary {
                ty: VmType::Reference,
                id: EXCEPTION_TEMP,
            });
        } else if let Some(entry) = self.entry_stacks.get(&block) {
            for &(ty, id) in entry {
                self.stack.push(Expr::Temporary { ty, id });
            }
        }

        let code = Arc::clone(&self.code);
        let mut pc = start;
        while pc < end {
            let size = bytecode::insn_size(&code, pc)?;
            self.bc = pc;
            self.convert_insn(cu, block, &code, pc)?;
            pc += size;
        }

        // A block ending in a plain instruction falls through; transfer
        // the mirror stack to the successor.
        if !ends_with_terminator(&code, start, end)? {
            self.flush_stack(cu, block)?;
        }

        cu.blocks[block].stmts = std::mem::take(&mut self.stmts);
        self.processed.push(block);
        Ok(())
    }

    // ---- mirror stack ------------------------------------------------

    fn emit_stmt(&mut self, stmt: Stmt) {
        self.stmts.push((self.bc, stmt));
    }

    fn push(&mut self, expr: Expr) {
        self.stack.push(expr);
    }

    fn pop(&mut self) -> CodegenResult<Expr> {
        self.stack
            .pop()
            .ok_or_else(|| verify_err!("operand stack underflow in {}", self.method.name))
    }

    fn new_temp(&mut self, ty: VmType) -> Expr {
        let id = self.next_temp;
        self.next_temp += 1;
        Expr::Temporary { ty, id }
    }

    /// Capture an expression into a temporary unless re-evaluating it is
    /// free, so it can appear in more than one position.
    fn capture(&mut self, expr: Expr) -> Expr {
        if expr.is_pure() {
            return expr;
        }
        let temp = self.new_temp(expr.ty());
        self.emit_stmt(Stmt::Store {
            dest: temp.clone(),
            value: expr,
        });
        temp
    }

    /// Capture the top `n` stack values in place.
    fn capture_top(&mut self, n: usize) -> CodegenResult<()> {
        let len = self.stack.len();
        if len < n {
            return Err(verify_err!("operand stack underflow in {}", self.method.name));
        }
        for i in len - n..len {
            let value = self.stack[i].clone();
            if !value.is_pure() {
                let temp = self.capture(value);
                self.stack[i] = temp;
            }
        }
        Ok(())
    }

    /// Capture the whole stack; required before statements whose side
    /// effects could invalidate pending loads.
    fn capture_all(&mut self) -> CodegenResult<()> {
        self.capture_top(self.stack.len())
    }

    /// A store to a local invalidates any stacked load of it.
    fn capture_local_refs(&mut self, index: u16, wide: bool) {
        let hi = index + if wide { 1 } else { 0 };
        for i in 0..self.stack.len() {
            let overlaps = match &self.stack[i] {
                Expr::Local { index: li, ty } => {
                    let lhi = li + if ty.is_wide() { 1 } else { 0 };
                    *li <= hi && index <= lhi
                }
                _ => false,
            };
            if overlaps {
                let value = self.stack[i].clone();
                let temp = self.capture_impure(value);
                self.stack[i] = temp;
            }
        }
    }

    /// Like `capture`, but forces even pure expressions into temporaries.
    fn capture_impure(&mut self, expr: Expr) -> Expr {
        let temp = self.new_temp(expr.ty());
        self.emit_stmt(Stmt::Store {
            dest: temp.clone(),
            value: expr,
        });
        temp
    }

    /// Pop `slots` worth of values; wide values count two. Values must
    /// not straddle the requested boundary.
    fn take_slots(&mut self, slots: u32) -> CodegenResult<Vec<Expr>> {
        let mut taken = Vec::new();
        let mut remaining = slots as i64;
        while remaining > 0 {
            let value = self.pop()?;
            remaining -= i64::from(value.ty().slot_count());
            taken.push(value);
        }
        if remaining != 0 {
            return Err(verify_err!("wide value split by stack shuffle"));
        }
        taken.reverse();
        Ok(taken)
    }

    // ---- inter-block transfer ----------------------------------------

    fn transfer_temp(&mut self, depth: u32, ty: VmType) -> u32 {
        if let Some(&id) = self.transfer_temps.get(&(depth, ty)) {
            return id;
        }
        let id = self.next_temp;
        self.next_temp += 1;
        self.transfer_temps.insert((depth, ty), id);
        id
    }

    /// Store the mirror stack into transfer temporaries and record the
    /// resulting shape as every successor's entry stack.
    fn flush_stack(&mut self, cu: &mut CompilationUnit, block: BlockId) -> CodegenResult<()> {
        let mut shape = Vec::with_capacity(self.stack.len());
        let values = std::mem::take(&mut self.stack);
        for (depth, value) in values.into_iter().enumerate() {
            let ty = value.ty();
            let id = self.transfer_temp(depth as u32, ty);
            shape.push((ty, id));
            let already_there =
                matches!(&value, Expr::Temporary { id: vid, .. } if *vid == id);
            if !already_there {
                self.emit_stmt(Stmt::Store {
                    dest: Expr::Temporary { ty, id },
                    value,
                });
            }
        }

        let successors = cu.blocks[block].successors.clone();
        for succ in successors {
            if cu.blocks[succ].is_eh_entry {
                continue;
            }
            match self.entry_stacks.get(&succ) {
                Some(existing) if *existing != shape => {
                    return Err(verify_err!(
                        "inconsistent operand stack at join, block {}",
                        succ
                    ));
                }
                Some(_) => {}
                None => {
                    if self.processed.contains(&succ) && !shape.is_empty() {
                        return Err(verify_err!(
                            "non-empty operand stack on back edge to {}",
                            succ
                        ));
                    }
                    self.entry_stacks.insert(succ, shape.clone());
                }
            }
        }
        Ok(())
    }

    // ---- resolution --------------------------------------------------

    fn resolve_class(&self, name: &str) -> CodegenResult<Arc<Class>> {
        self.env
            .resolve_class(name)
            .ok_or_else(|| CodegenError::Unsupported(format!("unresolvable class `{}`", name)))
    }

    fn resolve_field(&self, index: u16) -> CodegenResult<(Arc<Class>, Arc<Field>)> {
        let pool = &self.class.constant_pool;
        let (class_name, field_name, _) = pool.field_ref(index)?;
        let mut class = self.resolve_class(class_name)?;
        loop {
            if let Some(field) = class.field(field_name) {
                return Ok((class.clone(), field.clone()));
            }
            match &class.super_class {
                Some(sup) => class = sup.clone(),
                None => {
                    return Err(CodegenError::Unsupported(format!(
                        "unresolvable field `{}.{}`",
                        class_name, field_name
                    )))
                }
            }
        }
    }

    fn resolve_method(&self, index: u16) -> CodegenResult<Arc<Method>> {
        let pool = &self.class.constant_pool;
        let (class_name, name, descriptor, _) = pool.method_ref(index)?;
        let mut class = self.resolve_class(class_name)?;
        loop {
            if let Some(method) = class.method(name, descriptor) {
                return Ok(method.clone());
            }
            let next = class.super_class.clone().or_else(|| {
                class
                    .interfaces
                    .iter()
                    .find(|iface| iface.method(name, descriptor).is_some())
                    .cloned()
            });
            match next {
                Some(next) => class = next,
                None => {
                    return Err(CodegenError::Unsupported(format!(
                        "unresolvable method `{}.{}{}`",
                        class_name, name, descriptor
                    )))
                }
            }
        }
    }

    // ---- conversion --------------------------------------------------

    #[allow(clippy::cognitive_complexity)]
    fn convert_insn(
        &mut self,
        cu: &mut CompilationUnit,
        block: BlockId,
        code: &[u8],
        pc: u32,
    ) -> CodegenResult<()> {
        use opc::*;
        let op = code[pc as usize];

        match op {
            NOP => {}

            // -- constants --
            ACONST_NULL => self.push(Expr::Value {
                ty: VmType::Reference,
                value: 0,
            }),
            ICONST_M1..=ICONST_5 => self.push(Expr::Value {
                ty: VmType::Int,
                value: i64::from(op) - i64::from(ICONST_0),
            }),
            LCONST_0 | LCONST_1 => self.push(Expr::Value {
                ty: VmType::Long,
                value: i64::from(op - LCONST_0),
            }),
            FCONST_0..=FCONST_2 => self.push(Expr::FValue {
                ty: VmType::Float,
                value: f64::from(op - FCONST_0),
            }),
            DCONST_0 | DCONST_1 => self.push(Expr::FValue {
                ty: VmType::Double,
                value: f64::from(op - DCONST_0),
            }),
            BIPUSH => self.push(Expr::Value {
                ty: VmType::Int,
                value: i64::from(bytecode::read_u8(code, pc + 1)? as i8),
            }),
            SIPUSH => self.push(Expr::Value {
                ty: VmType::Int,
                value: i64::from(bytecode::read_i16(code, pc + 1)?),
            }),
            LDC => self.convert_ldc(u16::from(bytecode::read_u8(code, pc + 1)?))?,
            LDC_W | LDC2_W => self.convert_ldc(bytecode::read_u16(code, pc + 1)?)?,

            // -- local loads --
            ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => {
                let ty = load_type(op - ILOAD);
                let index = u16::from(bytecode::read_u8(code, pc + 1)?);
                self.push(Expr::Local { ty, index });
            }
            // iload_0 .. aload_3
            0x1a..=0x2d => {
                let ty = load_type((op - ILOAD_0) / 4);
                let index = u16::from((op - ILOAD_0) % 4);
                self.push(Expr::Local { ty, index });
            }

            // -- array loads --
            IALOAD..=SALOAD => {
                let elem = array_elem_type(op - IALOAD);
                self.convert_array_load(elem)?;
            }

            // -- local stores --
            ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => {
                let ty = load_type(op - ISTORE);
                let index = u16::from(bytecode::read_u8(code, pc + 1)?);
                self.convert_store(ty, index)?;
            }
            // istore_0 .. astore_3
            0x3b..=0x4e => {
                let ty = load_type((op - ISTORE_0) / 4);
                let index = u16::from((op - ISTORE_0) % 4);
                self.convert_store(ty, index)?;
            }

            // -- array stores --
            IASTORE..=SASTORE => {
                let elem = array_elem_type(op - IASTORE);
                self.convert_array_store(elem)?;
            }

            // -- stack shuffles --
            POP => {
                let value = self.pop()?;
                if value.ty().is_wide() {
                    return Err(verify_err!("pop of a wide value"));
                }
            }
            POP2 => {
                let _ = self.take_slots(2)?;
            }
            DUP => {
                self.capture_top(1)?;
                let top = self.stack.last().cloned().ok_or_else(|| {
                    verify_err!("operand stack underflow in {}", self.method.name)
                })?;
                self.push(top);
            }
            DUP_X1 => {
                self.capture_top(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b.clone());
                self.push(a);
                self.push(b);
            }
            DUP_X2 => {
                self.capture_top(3)?;
                let b = self.pop()?;
                let under = self.take_slots(2)?;
                self.push(b.clone());
                for v in under {
                    self.push(v);
                }
                self.push(b);
            }
            DUP2 => {
                self.capture_top(2)?;
                let group = self.take_slots(2)?;
                for v in &group {
                    self.push(v.clone());
                }
                for v in group {
                    self.push(v);
                }
            }
            DUP2_X1 => {
                self.capture_top(3)?;
                let group = self.take_slots(2)?;
                let a = self.pop()?;
                for v in &group {
                    self.push(v.clone());
                }
                self.push(a);
                for v in group {
                    self.push(v);
                }
            }
            DUP2_X2 => {
                self.capture_top(4)?;
                let group1 = self.take_slots(2)?;
                let group2 = self.take_slots(2)?;
                for v in &group1 {
                    self.push(v.clone());
                }
                for v in group2 {
                    self.push(v);
                }
                for v in group1 {
                    self.push(v);
                }
            }
            SWAP => {
                self.capture_top(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
            }

            // -- arithmetic --
            IADD..=DADD => self.convert_binop(op - IADD, BinOp::Add)?,
            ISUB..=DSUB => self.convert_binop(op - ISUB, BinOp::Sub)?,
            IMUL..=DMUL => self.convert_binop(op - IMUL, BinOp::Mul)?,
            IDIV..=DDIV => self.convert_div(op - IDIV, BinOp::Div)?,
            IREM..=DREM => self.convert_div(op - IREM, BinOp::Rem)?,
            INEG..=DNEG => {
                let ty = load_type(op - INEG);
                let value = self.pop()?;
                self.push(Expr::Neg {
                    ty,
                    value: Box::new(value),
                });
            }
            ISHL | LSHL => self.convert_shift(op == LSHL, BinOp::Shl)?,
            ISHR | LSHR => self.convert_shift(op == LSHR, BinOp::Shr)?,
            IUSHR | LUSHR => self.convert_shift(op == LUSHR, BinOp::Ushr)?,
            IAND | LAND => self.convert_logic(op == LAND, BinOp::And)?,
            IOR | LOR => self.convert_logic(op == LOR, BinOp::Or)?,
            IXOR | LXOR => self.convert_logic(op == LXOR, BinOp::Xor)?,

            IINC => {
                let index = u16::from(bytecode::read_u8(code, pc + 1)?);
                let delta = i64::from(bytecode::read_u8(code, pc + 2)? as i8);
                self.convert_iinc(index, delta)?;
            }

            // -- conversions --
            I2L => self.convert_conv(VmType::Int, VmType::Long)?,
            I2F => self.convert_conv(VmType::Int, VmType::Float)?,
            I2D => self.convert_conv(VmType::Int, VmType::Double)?,
            L2I => self.convert_conv(VmType::Long, VmType::Int)?,
            L2F => self.convert_conv(VmType::Long, VmType::Float)?,
            L2D => self.convert_conv(VmType::Long, VmType::Double)?,
            F2I => self.convert_conv(VmType::Float, VmType::Int)?,
            F2L => self.convert_conv(VmType::Float, VmType::Long)?,
            F2D => self.convert_conv(VmType::Float, VmType::Double)?,
            D2I => self.convert_conv(VmType::Double, VmType::Int)?,
            D2L => self.convert_conv(VmType::Double, VmType::Long)?,
            D2F => self.convert_conv(VmType::Double, VmType::Float)?,
            I2B => self.convert_trunc(VmType::Byte)?,
            I2C => self.convert_trunc(VmType::Char)?,
            I2S => self.convert_trunc(VmType::Short)?,

            // -- three-way compares --
            LCMP => self.convert_cmp3(BinOp::CmpL)?,
            FCMPL | DCMPL => self.convert_cmp3(BinOp::CmpL)?,
            FCMPG | DCMPG => self.convert_cmp3(BinOp::CmpG)?,

            // -- branches --
            IFEQ..=IFLE => {
                let cond_op = if_binop(op - IFEQ);
                let value = self.pop()?;
                let zero = Expr::Value {
                    ty: VmType::Int,
                    value: 0,
                };
                self.convert_if(cu, block, code, pc, cond_op, value, zero)?;
            }
            IF_ICMPEQ..=IF_ICMPLE => {
                let cond_op = if_binop(op - IF_ICMPEQ);
                let right = self.pop()?;
                let left = self.pop()?;
                self.convert_if(cu, block, code, pc, cond_op, left, right)?;
            }
            IF_ACMPEQ | IF_ACMPNE => {
                let cond_op = if op == IF_ACMPEQ { BinOp::Eq } else { BinOp::Ne };
                let right = self.pop()?;
                let left = self.pop()?;
                self.convert_if(cu, block, code, pc, cond_op, left, right)?;
            }
            IFNULL | IFNONNULL => {
                let cond_op = if op == IFNULL { BinOp::Eq } else { BinOp::Ne };
                let value = self.pop()?;
                let null = Expr::Value {
                    ty: VmType::Reference,
                    value: 0,
                };
                self.convert_if(cu, block, code, pc, cond_op, value, null)?;
            }
            GOTO | GOTO_W => {
                let target = self.block_at(cu, bytecode::branch_target(code, pc)?)?;
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::Goto { target });
            }
            JSR | JSR_W => {
                let sub = self.block_at(cu, bytecode::branch_target(code, pc)?)?;
                let next = pc + bytecode::insn_size(code, pc)?;
                let ret_block = self.block_at(cu, next)?;
                self.push(Expr::ReturnAddress { block: ret_block });
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::Goto { target: sub });
            }
            RET => {
                let local = u16::from(bytecode::read_u8(code, pc + 1)?);
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::RetJump { local });
            }

            TABLESWITCH => {
                let ts = bytecode::parse_tableswitch(code, pc)?;
                let value = self.pop()?;
                self.capture_all()?;
                let mut cases = Vec::with_capacity(ts.targets.len());
                for (i, &target) in ts.targets.iter().enumerate() {
                    cases.push((
                        ts.low.wrapping_add(i as i32),
                        self.block_at(cu, target)?,
                    ));
                }
                let default = self.block_at(cu, ts.default)?;
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::Switch {
                    value,
                    cases,
                    default,
                });
            }
            LOOKUPSWITCH => {
                let ls = bytecode::parse_lookupswitch(code, pc)?;
                let value = self.pop()?;
                self.capture_all()?;
                let mut cases = Vec::with_capacity(ls.pairs.len());
                for &(key, target) in &ls.pairs {
                    cases.push((key, self.block_at(cu, target)?));
                }
                let default = self.block_at(cu, ls.default)?;
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::Switch {
                    value,
                    cases,
                    default,
                });
            }

            // -- returns --
            IRETURN..=ARETURN => {
                let value = self.pop()?;
                self.emit_stmt(Stmt::Return { value: Some(value) });
            }
            RETURN => {
                self.emit_stmt(Stmt::Return { value: None });
            }

            // -- fields --
            GETSTATIC => {
                let (class, field) = self.resolve_field(bytecode::read_u16(code, pc + 1)?)?;
                self.push(Expr::StaticField {
                    ty: field.vm_type,
                    class,
                    field,
                });
            }
            PUTSTATIC => {
                let (class, field) = self.resolve_field(bytecode::read_u16(code, pc + 1)?)?;
                let value = self.pop()?;
                self.capture_all()?;
                self.emit_stmt(Stmt::StaticStore {
                    class,
                    field,
                    value,
                });
            }
            GETFIELD => {
                let (_, field) = self.resolve_field(bytecode::read_u16(code, pc + 1)?)?;
                let object = self.pop_object()?;
                let object = self.capture(object);
                self.emit_stmt(Stmt::NullCheck {
                    object: object.clone(),
                });
                self.push(Expr::InstanceField {
                    ty: field.vm_type,
                    field,
                    object: Box::new(object),
                });
            }
            PUTFIELD => {
                let (_, field) = self.resolve_field(bytecode::read_u16(code, pc + 1)?)?;
                let value = self.pop()?;
                let object = self.pop_object()?;
                let object = self.capture(object);
                self.capture_all()?;
                self.emit_stmt(Stmt::NullCheck {
                    object: object.clone(),
                });
                self.emit_stmt(Stmt::FieldStore {
                    field,
                    object,
                    value,
                });
            }

            // -- invocations --
            INVOKEVIRTUAL => self.convert_invoke(bytecode::read_u16(code, pc + 1)?, InvokeKind::Virtual)?,
            INVOKESPECIAL => self.convert_invoke(bytecode::read_u16(code, pc + 1)?, InvokeKind::Special)?,
            INVOKESTATIC => self.convert_invoke(bytecode::read_u16(code, pc + 1)?, InvokeKind::Static)?,
            INVOKEINTERFACE => self.convert_invoke(bytecode::read_u16(code, pc + 1)?, InvokeKind::Interface)?,

            // -- allocation --
            NEW => {
                let name = {
                    let pool = &self.class.constant_pool;
                    pool.class_ref(bytecode::read_u16(code, pc + 1)?)?.clone()
                };
                let class = self.resolve_class(&name)?;
                self.capture_all()?;
                let result = self.capture_impure(Expr::NewObject { class });
                self.push(result);
            }
            NEWARRAY => {
                let atype = bytecode::read_u8(code, pc + 1)?;
                let length = self.pop()?;
                self.capture_all()?;
                let result = self.capture_impure(Expr::NewArray {
                    element: None,
                    atype,
                    length: Box::new(length),
                });
                self.push(result);
            }
            ANEWARRAY => {
                let name = {
                    let pool = &self.class.constant_pool;
                    pool.class_ref(bytecode::read_u16(code, pc + 1)?)?.clone()
                };
                let element = self.resolve_class(&name)?;
                let length = self.pop()?;
                self.capture_all()?;
                let result = self.capture_impure(Expr::NewArray {
                    element: Some(element),
                    atype: 0,
                    length: Box::new(length),
                });
                self.push(result);
            }
            MULTIANEWARRAY => {
                let name = {
                    let pool = &self.class.constant_pool;
                    pool.class_ref(bytecode::read_u16(code, pc + 1)?)?.clone()
                };
                let class = self.resolve_class(&name)?;
                let dims = u32::from(bytecode::read_u8(code, pc + 3)?);
                let mut dimensions = Vec::with_capacity(dims as usize);
                for _ in 0..dims {
                    dimensions.push(self.pop()?);
                }
                dimensions.reverse();
                self.capture_all()?;
                let result = self.capture_impure(Expr::NewMultiArray { class, dimensions });
                self.push(result);
            }

            ARRAYLENGTH => {
                let array = self.pop_object()?;
                let array = self.capture(array);
                self.emit_stmt(Stmt::NullCheck {
                    object: array.clone(),
                });
                self.push(Expr::ArrayLength {
                    array: Box::new(array),
                });
            }

            ATHROW => {
                let exception = self.pop()?;
                self.capture_all()?;
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::Throw { exception });
            }

            CHECKCAST => {
                let name = {
                    let pool = &self.class.constant_pool;
                    pool.class_ref(bytecode::read_u16(code, pc + 1)?)?.clone()
                };
                let class = self.resolve_class(&name)?;
                self.capture_top(1)?;
                let object = self.stack.last().cloned().ok_or_else(|| {
                    verify_err!("operand stack underflow in {}", self.method.name)
                })?;
                self.emit_stmt(Stmt::CheckCast { class, object });
            }
            INSTANCEOF => {
                let name = {
                    let pool = &self.class.constant_pool;
                    pool.class_ref(bytecode::read_u16(code, pc + 1)?)?.clone()
                };
                let class = self.resolve_class(&name)?;
                let object = self.pop_object()?;
                self.capture_all()?;
                let result = self.capture_impure(Expr::InstanceOf {
                    class,
                    object: Box::new(object),
                });
                self.push(result);
            }

            MONITORENTER => {
                let object = self.pop_object()?;
                self.capture_all()?;
                self.emit_stmt(Stmt::MonitorEnter { object });
            }
            MONITOREXIT => {
                let object = self.pop_object()?;
                self.capture_all()?;
                self.emit_stmt(Stmt::MonitorExit { object });
            }

            WIDE => self.convert_wide(cu, block, code, pc)?,

            other => {
                return Err(CodegenError::Unsupported(format!(
                    "opcode {:#04x} at {}",
                    other, pc
                )))
            }
        }
        Ok(())
    }

    fn pop_object(&mut self) -> CodegenResult<Expr> {
        let value = self.pop()?;
        if value.ty() != VmType::Reference {
            return Err(verify_err!("expected a reference, found {:?}", value.ty()));
        }
        Ok(value)
    }

    fn convert_ldc(&mut self, index: u16) -> CodegenResult<()> {
        use javelin_environ::Constant;
        let pool = &self.class.constant_pool;
        let expr = match pool.get(index) {
            Some(Constant::Integer(v)) => Expr::Value {
                ty: VmType::Int,
                value: i64::from(*v),
            },
            Some(Constant::Long(v)) => Expr::Value {
                ty: VmType::Long,
                value: *v,
            },
            Some(Constant::Float(v)) => Expr::FValue {
                ty: VmType::Float,
                value: f64::from(*v),
            },
            Some(Constant::Double(v)) => Expr::FValue {
                ty: VmType::Double,
                value: *v,
            },
            Some(Constant::String(_)) => Expr::StringConst {
                value: pool.string(index)?.clone(),
            },
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "ldc of constant pool entry {}",
                    index
                )))
            }
        };
        self.push(expr);
        Ok(())
    }

    fn convert_store(&mut self, ty: VmType, index: u16) -> CodegenResult<()> {
        let value = self.pop()?;
        self.capture_local_refs(index, ty.is_wide());
        self.emit_stmt(Stmt::Store {
            dest: Expr::Local { ty, index },
            value,
        });
        Ok(())
    }

    fn convert_array_load(&mut self, elem: VmType) -> CodegenResult<()> {
        let index = self.pop()?;
        let index = self.capture(index);
        let array = self.pop_object()?;
        let array = self.capture(array);
        self.emit_stmt(Stmt::NullCheck {
            object: array.clone(),
        });
        self.emit_stmt(Stmt::BoundsCheck {
            array: array.clone(),
            index: index.clone(),
        });
        self.push(Expr::ArrayDeref {
            ty: elem,
            array: Box::new(array),
            index: Box::new(index),
        });
        Ok(())
    }

    fn convert_array_store(&mut self, elem: VmType) -> CodegenResult<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let index = self.capture(index);
        let array = self.pop_object()?;
        let array = self.capture(array);
        let value = self.capture(value);
        self.capture_all()?;
        self.emit_stmt(Stmt::NullCheck {
            object: array.clone(),
        });
        self.emit_stmt(Stmt::BoundsCheck {
            array: array.clone(),
            index: index.clone(),
        });
        if elem == VmType::Reference {
            self.emit_stmt(Stmt::StoreCheck {
                array: array.clone(),
                value: value.clone(),
            });
        }
        self.emit_stmt(Stmt::ArrayStore {
            ty: elem,
            array,
            index,
            value,
        });
        Ok(())
    }

    fn convert_binop(&mut self, type_sel: u8, op: BinOp) -> CodegenResult<()> {
        let ty = load_type(type_sel);
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(Expr::Binop {
            ty,
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
        Ok(())
    }

    fn convert_div(&mut self, type_sel: u8, op: BinOp) -> CodegenResult<()> {
        let ty = load_type(type_sel);
        let right = self.pop()?;
        let right = self.capture(right);
        let left = self.pop()?;
        if !ty.is_float() {
            // Integer division faults with SIGFPE; the guard statement
            // marks the site for the ArithmeticException path.
            self.emit_stmt(Stmt::DivZeroCheck {
                ty,
                value: right.clone(),
            });
        }
        self.push(Expr::Binop {
            ty,
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
        Ok(())
    }

    fn convert_shift(&mut self, wide: bool, op: BinOp) -> CodegenResult<()> {
        let ty = if wide { VmType::Long } else { VmType::Int };
        let count = self.pop()?;
        let value = self.pop()?;
        self.push(Expr::Binop {
            ty,
            op,
            left: Box::new(value),
            right: Box::new(count),
        });
        Ok(())
    }

    fn convert_logic(&mut self, wide: bool, op: BinOp) -> CodegenResult<()> {
        let ty = if wide { VmType::Long } else { VmType::Int };
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(Expr::Binop {
            ty,
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
        Ok(())
    }

    fn convert_iinc(&mut self, index: u16, delta: i64) -> CodegenResult<()> {
        self.capture_local_refs(index, false);
        self.emit_stmt(Stmt::Store {
            dest: Expr::Local {
                ty: VmType::Int,
                index,
            },
            value: Expr::Binop {
                ty: VmType::Int,
                op: BinOp::Add,
                left: Box::new(Expr::Local {
                    ty: VmType::Int,
                    index,
                }),
                right: Box::new(Expr::Value {
                    ty: VmType::Int,
                    value: delta,
                }),
            },
        });
        Ok(())
    }

    fn convert_conv(&mut self, from: VmType, to: VmType) -> CodegenResult<()> {
        let value = self.pop()?;
        self.push(Expr::Convert {
            from,
            to,
            value: Box::new(value),
        });
        Ok(())
    }

    fn convert_trunc(&mut self, to: VmType) -> CodegenResult<()> {
        let value = self.pop()?;
        self.push(Expr::Truncate {
            to,
            value: Box::new(value),
        });
        Ok(())
    }

    fn convert_cmp3(&mut self, op: BinOp) -> CodegenResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.capture_all()?;
        // The result is always an int; the selector picks the helper
        // from the operand type.
        let result = self.capture_impure(Expr::Binop {
            ty: VmType::Int,
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
        self.push(result);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn convert_if(
        &mut self,
        cu: &mut CompilationUnit,
        block: BlockId,
        code: &[u8],
        pc: u32,
        op: BinOp,
        left: Expr,
        right: Expr,
    ) -> CodegenResult<()> {
        debug_assert!(op.is_comparison());
        let target = self.block_at(cu, bytecode::branch_target(code, pc)?)?;
        self.flush_stack(cu, block)?;
        self.emit_stmt(Stmt::If {
            cond: Expr::Binop {
                ty: VmType::Int,
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            target,
        });
        Ok(())
    }

    fn convert_invoke(&mut self, index: u16, kind: InvokeKind) -> CodegenResult<()> {
        let method = self.resolve_method(index)?;
        let has_receiver = kind != InvokeKind::Static;

        let mut args = Vec::with_capacity(method.args.len() + 1);
        for _ in 0..method.args.len() {
            args.push(self.pop()?);
        }
        if has_receiver {
            let receiver = self.pop_object()?;
            args.push(receiver);
        }
        args.reverse();

        self.capture_all()?;

        let ret = method.ret;
        let invoke = Expr::Invoke {
            ty: ret,
            kind,
            method,
            args,
        };
        if ret == VmType::Void {
            self.emit_stmt(Stmt::Expression { expr: invoke });
        } else {
            let result = self.capture_impure(invoke);
            self.push(result);
        }
        Ok(())
    }

    fn convert_wide(
        &mut self,
        cu: &mut CompilationUnit,
        block: BlockId,
        code: &[u8],
        pc: u32,
    ) -> CodegenResult<()> {
        use opc::*;
        let modified = bytecode::read_u8(code, pc + 1)?;
        let index = bytecode::read_u16(code, pc + 2)?;
        match modified {
            ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => {
                let ty = load_type(modified - ILOAD);
                self.push(Expr::Local { ty, index });
            }
            ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => {
                let ty = load_type(modified - ISTORE);
                self.convert_store(ty, index)?;
            }
            IINC => {
                let delta = i64::from(bytecode::read_i16(code, pc + 4)?);
                self.convert_iinc(index, delta)?;
            }
            RET => {
                self.flush_stack(cu, block)?;
                self.emit_stmt(Stmt::RetJump { local: index });
            }
            other => {
                return Err(verify_err!("invalid wide form {:#04x}", other));
            }
        }
        Ok(())
    }

    fn block_at(&self, cu: &CompilationUnit, bc_offset: u32) -> CodegenResult<BlockId> {
        cu.find_block(bc_offset)
            .filter(|&b| cu.blocks[b].start == bc_offset)
            .ok_or_else(|| verify_err!("branch target {} is not a block leader", bc_offset))
    }
}

/// Value type selected by an opcode family index (i, l, f, d, a).
fn load_type(selector: u8) -> VmType {
    match selector {
        0 => VmType::Int,
        1 => VmType::Long,
        2 => VmType::Float,
        3 => VmType::Double,
        _ => VmType::Reference,
    }
}

/// Element type of the `*aload`/`*astore` family (i, l, f, d, a, b, c, s).
fn array_elem_type(selector: u8) -> VmType {
    match selector {
        0 => VmType::Int,
        1 => VmType::Long,
        2 => VmType::Float,
        3 => VmType::Double,
        4 => VmType::Reference,
        5 => VmType::Byte,
        6 => VmType::Char,
        _ => VmType::Short,
    }
}

/// Comparison operator of the `if<cond>` family (eq, ne, lt, ge, gt, le).
fn if_binop(selector: u8) -> BinOp {
    match selector {
        0 => BinOp::Eq,
        1 => BinOp::Ne,
        2 => BinOp::Lt,
        3 => BinOp::Ge,
        4 => BinOp::Gt,
        _ => BinOp::Le,
    }
}

/// Does the block's last instruction transfer control itself?
fn ends_with_terminator(code: &[u8], start: u32, end: u32) -> CodegenResult<bool> {
    let mut pc = start;
    let mut last = start;
    while pc < end {
        last = pc;
        pc += bytecode::insn_size(code, pc)?;
    }
    let op = code[last as usize];
    Ok(bytecode::is_cond_branch(op)
        || bytecode::is_unconditional_transfer(op)
        || bytecode::is_goto_or_jsr(op)
        || (op == opc::WIDE && bytecode::read_u8(code, last + 1)? == opc::RET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::opc::*;
    use crate::cfg::analyze_control_flow;
    use crate::cu::tests::test_method;
    use crate::hooks::tests::StubEnv;
    use crate::isa::Target;

    fn build(code: Vec<u8>, max_locals: u16) -> CompilationUnit {
        let mut cu = CompilationUnit::new(test_method(code, max_locals), Target::X64);
        analyze_control_flow(&mut cu).unwrap();
        build_hir(&mut cu, &StubEnv::default()).unwrap();
        cu
    }

    #[test]
    fn iconst_store_becomes_store_stmt() {
        let cu = build(vec![ICONST_3, ISTORE_0, RETURN], 1);
        let block = cu.layout[0];
        let stmts = &cu.blocks[block].stmts;
        assert_eq!(stmts.len(), 2);
        match &stmts[0].1 {
            Stmt::Store { dest, value } => {
                assert!(matches!(dest, Expr::Local { index: 0, .. }));
                assert!(matches!(value, Expr::Value { value: 3, .. }));
            }
            other => panic!("expected store, got {:?}", other),
        }
        assert!(matches!(stmts[1].1, Stmt::Return { value: None }));
    }

    #[test]
    fn arithmetic_builds_a_tree() {
        // return (a + b) * a; with a=local0, b=local1
        let cu = build(vec![ILOAD_0, ILOAD_0 + 1, IADD, ILOAD_0, IMUL, IRETURN], 2);
        let block = cu.layout[0];
        match &cu.blocks[block].stmts[0].1 {
            Stmt::Return { value: Some(expr) } => match expr {
                Expr::Binop { op: BinOp::Mul, left, .. } => {
                    assert!(matches!(**left, Expr::Binop { op: BinOp::Add, .. }));
                }
                other => panic!("expected mul at root, got {:?}", other),
            },
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn division_emits_zero_guard() {
        let cu = build(vec![ILOAD_0, ILOAD_0 + 1, IDIV, IRETURN], 2);
        let block = cu.layout[0];
        assert!(cu.blocks[block]
            .stmts
            .iter()
            .any(|(_, s)| matches!(s, Stmt::DivZeroCheck { .. })));
    }

    #[test]
    fn array_load_emits_checks_in_order() {
        let cu = build(vec![ALOAD_0, ICONST_0, IALOAD, IRETURN], 1);
        let block = cu.layout[0];
        let stmts = &cu.blocks[block].stmts;
        let null_at = stmts
            .iter()
            .position(|(_, s)| matches!(s, Stmt::NullCheck { .. }))
            .unwrap();
        let bounds_at = stmts
            .iter()
            .position(|(_, s)| matches!(s, Stmt::BoundsCheck { .. }))
            .unwrap();
        assert!(null_at < bounds_at);
    }

    #[test]
    fn reference_array_store_adds_store_check() {
        let cu = build(vec![ALOAD_0, ICONST_0, ACONST_NULL, AASTORE, RETURN], 1);
        let block = cu.layout[0];
        assert!(cu.blocks[block]
            .stmts
            .iter()
            .any(|(_, s)| matches!(s, Stmt::StoreCheck { .. })));
    }

    #[test]
    fn dup_duplicates_without_reevaluation() {
        // aload_0; arraylength; dup; pop; ireturn — the arraylength is
        // captured once, not computed twice.
        let cu = build(vec![ALOAD_0, ARRAYLENGTH, DUP, POP, IRETURN], 1);
        let block = cu.layout[0];
        let stores = cu.blocks[block]
            .stmts
            .iter()
            .filter(|(_, s)| matches!(s, Stmt::Store { .. }))
            .count();
        assert_eq!(stores, 1);
    }

    #[test]
    fn conditional_branch_builds_if() {
        let cu = build(
            vec![ILOAD_0, IFLE, 0x00, 0x07, ICONST_1, GOTO, 0x00, 0x04, ICONST_0, IRETURN],
            1,
        );
        let first = cu.layout[0];
        match &cu.blocks[first].stmts.last().unwrap().1 {
            Stmt::If { cond, .. } => match cond {
                Expr::Binop { op, .. } => assert_eq!(*op, BinOp::Le),
                other => panic!("expected comparison, got {:?}", other),
            },
            other => panic!("expected if, got {:?}", other),
        }
        // Values flowing out of blocks 2 and 3 are materialised into the
        // same transfer temporary.
        let b2 = cu.layout[1];
        let b3 = cu.layout[2];
        let store_temp = |b: BlockId| -> u32 {
            cu.blocks[b]
                .stmts
                .iter()
                .find_map(|(_, s)| match s {
                    Stmt::Store {
                        dest: Expr::Temporary { id, .. },
                        ..
                    } => Some(*id),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(store_temp(b2), store_temp(b3));
    }

    #[test]
    fn stack_underflow_is_verification_failure() {
        let mut cu = CompilationUnit::new(test_method(vec![IADD, RETURN], 1), Target::X64);
        analyze_control_flow(&mut cu).unwrap();
        assert!(matches!(
            build_hir(&mut cu, &StubEnv::default()),
            Err(CodegenError::Verifier(_))
        ));
    }
}
