//! Target instruction set descriptions.
//!
//! Both x86 targets are always available so either can be exercised from
//! any host; the host's own target is picked from its `target-lexicon`
//! triple when publishing real code.

pub mod x86;

use target_lexicon::{Architecture, Triple};

use crate::error::{CodegenError, CodegenResult};

/// A compilation target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// 32-bit x86 (cdecl, stack arguments).
    Ia32,
    /// 64-bit x86 (System-V register arguments).
    X64,
}

impl Target {
    /// Look up the target for a triple.
    pub fn from_triple(triple: &Triple) -> CodegenResult<Target> {
        match triple.architecture {
            Architecture::X86_32(_) => Ok(Target::Ia32),
            Architecture::X86_64 => Ok(Target::X64),
            other => Err(CodegenError::Unsupported(format!(
                "no backend for {}",
                other
            ))),
        }
    }

    /// The target the compiler itself runs on.
    pub fn host() -> CodegenResult<Target> {
        Target::from_triple(&Triple::host())
    }

    /// Natural machine word size in bytes.
    pub fn word_size(self) -> u32 {
        match self {
            Target::Ia32 => 4,
            Target::X64 => 8,
        }
    }

    /// Is a 64-bit integer value register-native on this target?
    pub fn has_64bit_gprs(self) -> bool {
        matches!(self, Target::X64)
    }
}

/// A machine register. GPR and XMM banks share the enum; the register
/// class is recovered with `is_xmm`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum MachReg {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl MachReg {
    /// Encoding in the reg/rm fields of ModR/M, 0..=15. Values 8..=15
    /// need a REX extension bit.
    pub fn encoding(self) -> u8 {
        use MachReg::*;
        match self {
            Ax | Xmm0 => 0,
            Cx | Xmm1 => 1,
            Dx | Xmm2 => 2,
            Bx | Xmm3 => 3,
            Sp | Xmm4 => 4,
            Bp | Xmm5 => 5,
            Si | Xmm6 => 6,
            Di | Xmm7 => 7,
            R8 | Xmm8 => 8,
            R9 | Xmm9 => 9,
            R10 | Xmm10 => 10,
            R11 | Xmm11 => 11,
            R12 | Xmm12 => 12,
            R13 | Xmm13 => 13,
            R14 | Xmm14 => 14,
            R15 | Xmm15 => 15,
        }
    }

    /// Is this an XMM register?
    pub fn is_xmm(self) -> bool {
        self >= MachReg::Xmm0
    }

    /// Dense index used for per-register tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Total number of machine registers.
    pub const COUNT: usize = 32;
}

/// Register environment of one target: allocation orders, scratch
/// registers, and save conventions.
pub struct RegisterEnv {
    /// Allocatable GPRs, in allocation preference order.
    pub gprs: &'static [MachReg],
    /// Allocatable XMM registers, in allocation preference order.
    pub xmms: &'static [MachReg],
    /// GPR reserved for spill rewrites and composite sequences.
    pub gpr_scratch: MachReg,
    /// Second GPR scratch, for instructions with two spilled address
    /// registers.
    pub gpr_scratch2: MachReg,
    /// XMM reserved for spill rewrites.
    pub xmm_scratch: MachReg,
    /// Callee-saved GPRs under the JIT frame convention.
    pub callee_saved: &'static [MachReg],
    /// Registers clobbered by a call.
    pub caller_saved: &'static [MachReg],
    /// Integer argument registers, in order. Empty on x86-32.
    pub gpr_args: &'static [MachReg],
    /// Floating argument registers, in order. Empty on x86-32.
    pub xmm_args: &'static [MachReg],
}

use MachReg::*;

static IA32_ENV: RegisterEnv = RegisterEnv {
    gprs: &[Ax, Cx, Dx, Bx],
    xmms: &[Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6],
    gpr_scratch: Di,
    gpr_scratch2: Si,
    xmm_scratch: Xmm7,
    callee_saved: &[Bx, Si, Di],
    caller_saved: &[Ax, Cx, Dx, Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7],
    gpr_args: &[],
    xmm_args: &[],
};

static X64_ENV: RegisterEnv = RegisterEnv {
    gprs: &[Ax, Cx, Dx, Si, Di, R8, R9, Bx, R12, R13, R14, R15],
    xmms: &[
        Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7, Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13,
        Xmm14,
    ],
    gpr_scratch: R11,
    gpr_scratch2: R10,
    xmm_scratch: Xmm15,
    callee_saved: &[Bx, R12, R13, R14, R15],
    // XMM8..XMM15 are saved by the JIT prologue but still clobbered by
    // calls into the C runtime, so calls treat every XMM as caller-saved.
    caller_saved: &[
        Ax, Cx, Dx, Si, Di, R8, R9, R10, R11, Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7,
        Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
    ],
    gpr_args: &[Di, Si, Dx, Cx, R8, R9],
    xmm_args: &[Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7],
};

impl Target {
    /// The target's register environment.
    pub fn regs(self) -> &'static RegisterEnv {
        match self {
            Target::Ia32 => &IA32_ENV,
            Target::X64 => &X64_ENV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_match_the_manual() {
        assert_eq!(MachReg::Ax.encoding(), 0);
        assert_eq!(MachReg::Bp.encoding(), 5);
        assert_eq!(MachReg::R8.encoding(), 8);
        assert_eq!(MachReg::Xmm12.encoding(), 12);
        assert!(MachReg::Xmm0.is_xmm());
        assert!(!MachReg::R15.is_xmm());
    }

    #[test]
    fn scratch_registers_are_not_allocatable() {
        for target in [Target::Ia32, Target::X64] {
            let env = target.regs();
            assert!(!env.gprs.contains(&env.gpr_scratch));
            assert!(!env.gprs.contains(&env.gpr_scratch2));
            assert!(!env.xmms.contains(&env.xmm_scratch));
        }
    }
}
