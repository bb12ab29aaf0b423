//! Raw bytecode access: opcode constants, instruction sizes, and branch
//! target decoding.
//!
//! The translator never indexes `code[]` directly; everything goes through
//! the checked readers here so malformed bytecode surfaces as a verifier
//! error instead of a panic.

use crate::error::{verify_err, CodegenResult};

/// Opcode byte values. Only a module of constants; the opcode space is
/// dense and most handling is range-based.
#[allow(missing_docs)]
pub mod opc {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_4: u8 = 0x07;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const LCONST_1: u8 = 0x0a;
    pub const FCONST_0: u8 = 0x0b;
    pub const FCONST_1: u8 = 0x0c;
    pub const FCONST_2: u8 = 0x0d;
    pub const DCONST_0: u8 = 0x0e;
    pub const DCONST_1: u8 = 0x0f;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ILOAD_1: u8 = 0x1b;
    pub const LLOAD_0: u8 = 0x1e;
    pub const FLOAD_0: u8 = 0x22;
    pub const DLOAD_0: u8 = 0x26;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ALOAD_1: u8 = 0x2b;
    pub const IALOAD: u8 = 0x2e;
    pub const LALOAD: u8 = 0x2f;
    pub const FALOAD: u8 = 0x30;
    pub const DALOAD: u8 = 0x31;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const CALOAD: u8 = 0x34;
    pub const SALOAD: u8 = 0x35;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const ISTORE_1: u8 = 0x3c;
    pub const LSTORE_0: u8 = 0x3f;
    pub const FSTORE_0: u8 = 0x43;
    pub const DSTORE_0: u8 = 0x47;
    pub const ASTORE_0: u8 = 0x4b;
    pub const ASTORE_1: u8 = 0x4c;
    pub const IASTORE: u8 = 0x4f;
    pub const LASTORE: u8 = 0x50;
    pub const FASTORE: u8 = 0x51;
    pub const DASTORE: u8 = 0x52;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const CASTORE: u8 = 0x55;
    pub const SASTORE: u8 = 0x56;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5a;
    pub const DUP_X2: u8 = 0x5b;
    pub const DUP2: u8 = 0x5c;
    pub const DUP2_X1: u8 = 0x5d;
    pub const DUP2_X2: u8 = 0x5e;
    pub const SWAP: u8 = 0x5f;
    pub const IADD: u8 = 0x60;
    pub const LADD: u8 = 0x61;
    pub const FADD: u8 = 0x62;
    pub const DADD: u8 = 0x63;
    pub const ISUB: u8 = 0x64;
    pub const LSUB: u8 = 0x65;
    pub const FSUB: u8 = 0x66;
    pub const DSUB: u8 = 0x67;
    pub const IMUL: u8 = 0x68;
    pub const LMUL: u8 = 0x69;
    pub const FMUL: u8 = 0x6a;
    pub const DMUL: u8 = 0x6b;
    pub const IDIV: u8 = 0x6c;
    pub const LDIV: u8 = 0x6d;
    pub const FDIV: u8 = 0x6e;
    pub const DDIV: u8 = 0x6f;
    pub const IREM: u8 = 0x70;
    pub const LREM: u8 = 0x71;
    pub const FREM: u8 = 0x72;
    pub const DREM: u8 = 0x73;
    pub const INEG: u8 = 0x74;
    pub const LNEG: u8 = 0x75;
    pub const FNEG: u8 = 0x76;
    pub const DNEG: u8 = 0x77;
    pub const ISHL: u8 = 0x78;
    pub const LSHL: u8 = 0x79;
    pub const ISHR: u8 = 0x7a;
    pub const LSHR: u8 = 0x7b;
    pub const IUSHR: u8 = 0x7c;
    pub const LUSHR: u8 = 0x7d;
    pub const IAND: u8 = 0x7e;
    pub const LAND: u8 = 0x7f;
    pub const IOR: u8 = 0x80;
    pub const LOR: u8 = 0x81;
    pub const IXOR: u8 = 0x82;
    pub const LXOR: u8 = 0x83;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const I2F: u8 = 0x86;
    pub const I2D: u8 = 0x87;
    pub const L2I: u8 = 0x88;
    pub const L2F: u8 = 0x89;
    pub const L2D: u8 = 0x8a;
    pub const F2I: u8 = 0x8b;
    pub const F2L: u8 = 0x8c;
    pub const F2D: u8 = 0x8d;
    pub const D2I: u8 = 0x8e;
    pub const D2L: u8 = 0x8f;
    pub const D2F: u8 = 0x90;
    pub const I2B: u8 = 0x91;
    pub const I2C: u8 = 0x92;
    pub const I2S: u8 = 0x93;
    pub const LCMP: u8 = 0x94;
    pub const FCMPL: u8 = 0x95;
    pub const FCMPG: u8 = 0x96;
    pub const DCMPL: u8 = 0x97;
    pub const DCMPG: u8 = 0x98;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const IFLT: u8 = 0x9b;
    pub const IFGE: u8 = 0x9c;
    pub const IFGT: u8 = 0x9d;
    pub const IFLE: u8 = 0x9e;
    pub const IF_ICMPEQ: u8 = 0x9f;
    pub const IF_ICMPNE: u8 = 0xa0;
    pub const IF_ICMPLT: u8 = 0xa1;
    pub const IF_ICMPGE: u8 = 0xa2;
    pub const IF_ICMPGT: u8 = 0xa3;
    pub const IF_ICMPLE: u8 = 0xa4;
    pub const IF_ACMPEQ: u8 = 0xa5;
    pub const IF_ACMPNE: u8 = 0xa6;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const MONITORENTER: u8 = 0xc2;
    pub const MONITOREXIT: u8 = 0xc3;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opc::*;

/// Fixed instruction lengths. 0 marks variable-length or invalid opcodes,
/// which take the slow path in `insn_size`.
#[rustfmt::skip]
const INSN_SIZES: [u8; 256] = [
    // 0x00..0x0f: nop, constants
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x10: bipush, sipush, ldc, ldc_w, ldc2_w, loads
    2, 3, 2, 3, 3, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1,
    // 0x20..0x2f: loads
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x30..0x3f: array loads, stores
    1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1,
    // 0x40..0x4f
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x50..0x5f: array stores, stack ops
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x60..0x6f: arithmetic
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x70..0x7f
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x80..0x8f: logic, iinc, conversions
    1, 1, 1, 1, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    // 0x90..0x9f: conversions, compares, branches
    1, 1, 1, 1, 1, 1, 1, 1, 1, 3, 3, 3, 3, 3, 3, 3,
    // 0xa0..0xaf: branches, jsr/ret, switches (variable), returns
    3, 3, 3, 3, 3, 3, 3, 3, 3, 2, 0, 0, 1, 1, 1, 1,
    // 0xb0..0xbf: returns, field/method access
    1, 1, 3, 3, 3, 3, 3, 3, 3, 5, 0, 3, 2, 3, 1, 1,
    // 0xc0..0xcf: checkcast.., wide (variable), goto_w/jsr_w
    3, 3, 1, 1, 0, 4, 3, 3, 5, 5, 0, 0, 0, 0, 0, 0,
    // 0xd0..0xff: invalid
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Read big-endian immediates out of the code array, bounds-checked.
pub fn read_u8(code: &[u8], at: u32) -> CodegenResult<u8> {
    code.get(at as usize)
        .copied()
        .ok_or_else(|| verify_err!("bytecode truncated at {}", at))
}

/// Read a big-endian u16.
pub fn read_u16(code: &[u8], at: u32) -> CodegenResult<u16> {
    Ok(u16::from_be_bytes([read_u8(code, at)?, read_u8(code, at + 1)?]))
}

/// Read a big-endian i16.
pub fn read_i16(code: &[u8], at: u32) -> CodegenResult<i16> {
    Ok(read_u16(code, at)? as i16)
}

/// Read a big-endian i32.
pub fn read_i32(code: &[u8], at: u32) -> CodegenResult<i32> {
    Ok(i32::from_be_bytes([
        read_u8(code, at)?,
        read_u8(code, at + 1)?,
        read_u8(code, at + 2)?,
        read_u8(code, at + 3)?,
    ]))
}

/// Size in bytes of the instruction starting at `pc`, accounting for the
/// variable-length `wide`, `tableswitch`, and `lookupswitch` encodings.
pub fn insn_size(code: &[u8], pc: u32) -> CodegenResult<u32> {
    let op = read_u8(code, pc)?;
    match op {
        WIDE => {
            let modified = read_u8(code, pc + 1)?;
            if modified == IINC {
                Ok(6)
            } else {
                Ok(4)
            }
        }
        TABLESWITCH => {
            let pad = switch_pad(pc);
            let low = read_i32(code, pc + 1 + pad + 4)?;
            let high = read_i32(code, pc + 1 + pad + 8)?;
            if low > high {
                return Err(verify_err!("tableswitch low {} > high {}", low, high));
            }
            let count = (high as i64 - low as i64 + 1) as u32;
            Ok(1 + pad + 12 + count * 4)
        }
        LOOKUPSWITCH => {
            let pad = switch_pad(pc);
            let npairs = read_i32(code, pc + 1 + pad + 4)?;
            if npairs < 0 {
                return Err(verify_err!("lookupswitch npairs {}", npairs));
            }
            Ok(1 + pad + 8 + npairs as u32 * 8)
        }
        _ => {
            let size = INSN_SIZES[op as usize];
            if size == 0 {
                return Err(verify_err!("invalid opcode {:#04x} at {}", op, pc));
            }
            Ok(u32::from(size))
        }
    }
}

/// Alignment padding after a switch opcode: operands start at the next
/// 4-byte boundary relative to the method start.
fn switch_pad(pc: u32) -> u32 {
    3 - (pc % 4)
}

/// Absolute branch target of the branch instruction at `pc`.
pub fn branch_target(code: &[u8], pc: u32) -> CodegenResult<u32> {
    let op = read_u8(code, pc)?;
    let rel = match op {
        GOTO_W | JSR_W => read_i32(code, pc + 1)? as i64,
        _ => i64::from(read_i16(code, pc + 1)?),
    };
    let target = i64::from(pc) + rel;
    if target < 0 || target as usize >= code.len() {
        return Err(verify_err!("branch target {} out of range at {}", target, pc));
    }
    Ok(target as u32)
}

/// Decoded `tableswitch` operands.
pub struct TableSwitch {
    /// Lowest matched key.
    pub low: i32,
    /// Absolute default target.
    pub default: u32,
    /// Absolute targets for keys `low..=high` in order.
    pub targets: Vec<u32>,
}

/// Decoded `lookupswitch` operands.
pub struct LookupSwitch {
    /// Absolute default target.
    pub default: u32,
    /// `(match, absolute target)` pairs in key order.
    pub pairs: Vec<(i32, u32)>,
}

fn abs_target(code: &[u8], pc: u32, rel: i32) -> CodegenResult<u32> {
    let target = i64::from(pc) + i64::from(rel);
    if target < 0 || target as usize >= code.len() {
        return Err(verify_err!("switch target {} out of range at {}", target, pc));
    }
    Ok(target as u32)
}

/// Decode the `tableswitch` at `pc`.
pub fn parse_tableswitch(code: &[u8], pc: u32) -> CodegenResult<TableSwitch> {
    let base = pc + 1 + switch_pad(pc);
    let default = abs_target(code, pc, read_i32(code, base)?)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = (high as i64 - low as i64 + 1) as u32;
    let mut targets = Vec::with_capacity(count as usize);
    for i in 0..count {
        targets.push(abs_target(code, pc, read_i32(code, base + 12 + i * 4)?)?);
    }
    Ok(TableSwitch {
        low,
        default,
        targets,
    })
}

/// Decode the `lookupswitch` at `pc`.
pub fn parse_lookupswitch(code: &[u8], pc: u32) -> CodegenResult<LookupSwitch> {
    let base = pc + 1 + switch_pad(pc);
    let default = abs_target(code, pc, read_i32(code, base)?)?;
    let npairs = read_i32(code, base + 4)? as u32;
    let mut pairs = Vec::with_capacity(npairs as usize);
    for i in 0..npairs {
        let key = read_i32(code, base + 8 + i * 8)?;
        let target = abs_target(code, pc, read_i32(code, base + 12 + i * 8)?)?;
        pairs.push((key, target));
    }
    Ok(LookupSwitch { default, pairs })
}

/// Does this opcode unconditionally transfer control (no fall-through)?
pub fn is_unconditional_transfer(op: u8) -> bool {
    matches!(
        op,
        GOTO | GOTO_W | RET | TABLESWITCH | LOOKUPSWITCH | ATHROW
    ) || is_return(op)
}

/// Is this one of the `*return` opcodes?
pub fn is_return(op: u8) -> bool {
    (IRETURN..=RETURN).contains(&op)
}

/// Is this a conditional branch?
pub fn is_cond_branch(op: u8) -> bool {
    (IFEQ..=IF_ACMPNE).contains(&op) || op == IFNULL || op == IFNONNULL
}

/// Is this `goto`, `goto_w`, `jsr`, or `jsr_w`?
pub fn is_goto_or_jsr(op: u8) -> bool {
    matches!(op, GOTO | GOTO_W | JSR | JSR_W)
}

/// An iterator over `(offset, opcode)` pairs of a method body.
pub struct BytecodeReader<'a> {
    code: &'a [u8],
    pc: u32,
}

impl<'a> BytecodeReader<'a> {
    /// Iterate over `code` from offset 0.
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pc: 0 }
    }
}

impl<'a> Iterator for BytecodeReader<'a> {
    type Item = CodegenResult<(u32, u8)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc as usize >= self.code.len() {
            return None;
        }
        let pc = self.pc;
        let op = self.code[pc as usize];
        match insn_size(self.code, pc) {
            Ok(size) => {
                self.pc = pc + size;
                Some(Ok((pc, op)))
            }
            Err(e) => {
                self.pc = self.code.len() as u32;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizes() {
        let code = [ICONST_0, BIPUSH, 5, SIPUSH, 1, 2, RETURN];
        assert_eq!(insn_size(&code, 0).unwrap(), 1);
        assert_eq!(insn_size(&code, 1).unwrap(), 2);
        assert_eq!(insn_size(&code, 3).unwrap(), 3);
    }

    #[test]
    fn reader_walks_whole_body() {
        let code = [ILOAD_0, IFNE, 0x00, 0x05, ICONST_0, ISTORE_0, RETURN];
        let offsets: Vec<u32> = BytecodeReader::new(&code)
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(offsets, vec![0, 1, 4, 5, 6]);
    }

    #[test]
    fn branch_targets_are_relative_to_branch() {
        let code = [ALOAD_1, IFNONNULL, 0x00, 0x06, LDC, 2, ASTORE_1, ALOAD_1, ARETURN];
        assert_eq!(branch_target(&code, 1).unwrap(), 7);
    }

    #[test]
    fn out_of_range_branch_is_rejected() {
        let code = [GOTO, 0x7f, 0x00];
        assert!(branch_target(&code, 0).is_err());
    }

    #[test]
    fn tableswitch_size_includes_padding() {
        // tableswitch at pc=1: 1 opcode + 2 pad + 12 header + 2*4 targets
        let mut code = vec![NOP, TABLESWITCH, 0, 0];
        code.extend_from_slice(&10i32.to_be_bytes()); // default
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&1i32.to_be_bytes()); // high
        code.extend_from_slice(&10i32.to_be_bytes());
        code.extend_from_slice(&10i32.to_be_bytes());
        code.push(RETURN);
        assert_eq!(insn_size(&code, 1).unwrap(), 1 + 2 + 12 + 8);
        let ts = parse_tableswitch(&code, 1).unwrap();
        assert_eq!(ts.low, 0);
        assert_eq!(ts.default, 11);
        assert_eq!(ts.targets, vec![11, 11]);
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        assert!(insn_size(&[0xff], 0).is_err());
    }
}
