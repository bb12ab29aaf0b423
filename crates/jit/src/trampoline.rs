//! Method trampolines and direct-call patching.
//!
//! Every JIT-eligible method gets a small thunk at load time. On first
//! entry the thunk saves the argument registers, calls the compiler with
//! the method state, polls the trampoline exception guard (a failed
//! compilation faults there and unwinds), restores the arguments, and
//! jumps to the freshly published entry in `xAX`. Direct call sites that
//! were emitted against the trampoline are re-pointed at the real code
//! once it exists.

use std::sync::{Mutex, Weak};

use log::trace;

use javelin_codegen::isa::Target;
use javelin_runtime::{jit_text, trampoline_guard_tls_offset, RuntimeError};

use crate::state::MethodState;

/// Size of a `call rel32`, and therefore of the patch window.
const CALL_INSN_SIZE: usize = 5;

/// A direct call site still pointing at a trampoline.
pub struct FixupSite {
    /// Address of the 5-byte `call rel32` in published code.
    pub site_addr: usize,
    /// The method whose code contains the site; sites from methods that
    /// have not published yet are skipped (their buffer may still move).
    pub owner: Weak<MethodState>,
}

/// A method's lazy-compilation thunk.
pub struct Trampoline {
    addr: usize,
    len: usize,
    fixup_sites: Mutex<Vec<FixupSite>>,
}

impl Trampoline {
    /// Emit a trampoline into the text arena.
    ///
    /// `state_ptr` is passed to `compiler_entry` as its only argument;
    /// the compiler returns the method entry in the return register.
    pub fn emit(
        target: Target,
        state_ptr: usize,
        compiler_entry: usize,
    ) -> Result<Trampoline, RuntimeError> {
        let mut code: Vec<u8> = Vec::with_capacity(128);
        let mut call_fields: Vec<(usize, usize)> = Vec::new();

        match target {
            Target::Ia32 => emit_ia32(&mut code, state_ptr, compiler_entry, &mut call_fields),
            Target::X64 => emit_x64(&mut code, state_ptr, compiler_entry, &mut call_fields),
        }

        let addr = jit_text().reserve(code.len())?;
        for &(field, target_addr) in &call_fields {
            let rel = target_addr as i64 - (addr + field + 4) as i64;
            code[field..field + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr as *mut u8, code.len());
        }

        trace!("trampoline at {:#x}, {} bytes", addr, code.len());
        Ok(Trampoline {
            addr,
            len: code.len(),
            fixup_sites: Mutex::new(Vec::new()),
        })
    }

    /// The thunk's entry address.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The thunk's size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the thunk empty? (It never is; inherent-method convention.)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a direct call site that currently targets this thunk.
    pub fn add_fixup_site(&self, site: FixupSite) {
        self.fixup_sites.lock().unwrap().push(site);
    }

    /// Number of unpatched sites.
    pub fn nr_fixup_sites(&self) -> usize {
        self.fixup_sites.lock().unwrap().len()
    }

    /// Rewrite every recorded `call rel32` to target `target` directly.
    ///
    /// The write is a single 32-bit store. Nothing serialises other CPUs'
    /// instruction fetch; a stale fetch still lands in this trampoline,
    /// which forwards to the same destination.
    pub fn fixup_direct_calls(&self, target: usize) {
        let mut sites = self.fixup_sites.lock().unwrap();
        sites.retain(|site| {
            let ready = site
                .owner
                .upgrade()
                .map_or(false, |owner| owner.is_compiled());
            if !ready {
                // The owning method may still be compiling; its call
                // site offset is not final until it publishes.
                return true;
            }
            let rel = target as i64 - (site.site_addr + CALL_INSN_SIZE) as i64;
            unsafe {
                let field = (site.site_addr + 1) as *mut u32;
                field.write_unaligned(rel as i32 as u32);
            }
            trace!(
                "patched call site {:#x} -> {:#x}",
                site.site_addr,
                target
            );
            false
        });
    }
}

fn emit_ia32(
    code: &mut Vec<u8>,
    state_ptr: usize,
    compiler_entry: usize,
    call_fields: &mut Vec<(usize, usize)>,
) {
    // push ebp; mov esp -> ebp: keep the frame chain intact for the
    // unwinder and for return-address discovery.
    code.push(0x55);
    code.extend_from_slice(&[0x89, 0xe5]);

    // push $state; call compiler; add 4, esp
    code.push(0x68);
    code.extend_from_slice(&(state_ptr as u32).to_le_bytes());
    code.push(0xe8);
    call_fields.push((code.len(), compiler_entry));
    code.extend_from_slice(&[0, 0, 0, 0]);
    code.extend_from_slice(&[0x83, 0xc4, 0x04]);

    // Poll the trampoline exception guard:
    //   mov gs:(off), %ecx ; test (%ecx), %ecx
    code.push(0x65);
    code.extend_from_slice(&[0x8b, 0x0d]);
    code.extend_from_slice(&(trampoline_guard_tls_offset() as u32).to_le_bytes());
    code.extend_from_slice(&[0x85, 0x09]);

    // pop ebp; jmp *%eax
    code.push(0x5d);
    code.extend_from_slice(&[0xff, 0xe0]);
}

fn emit_x64(
    code: &mut Vec<u8>,
    state_ptr: usize,
    compiler_entry: usize,
    call_fields: &mut Vec<(usize, usize)>,
) {
    // push rbp; mov rsp -> rbp
    code.push(0x55);
    code.extend_from_slice(&[0x48, 0x89, 0xe5]);

    // Save the argument registers the callee expects untouched.
    for reg in [0x57u8, 0x56, 0x52, 0x51] {
        code.push(reg); // push rdi, rsi, rdx, rcx
    }
    code.extend_from_slice(&[0x41, 0x50]); // push r8
    code.extend_from_slice(&[0x41, 0x51]); // push r9
    for xmm in 0..8u8 {
        // sub 8, rsp; movsd %xmmN, (%rsp)
        code.extend_from_slice(&[0x48, 0x83, 0xec, 0x08]);
        code.extend_from_slice(&[0xf2, 0x0f, 0x11, 0x04 | (xmm << 3), 0x24]);
    }

    // movabs $state, %rdi; call compiler
    code.extend_from_slice(&[0x48, 0xbf]);
    code.extend_from_slice(&(state_ptr as u64).to_le_bytes());
    code.push(0xe8);
    call_fields.push((code.len(), compiler_entry));
    code.extend_from_slice(&[0, 0, 0, 0]);

    // Poll the trampoline exception guard:
    //   mov %fs:(off), %rcx ; test (%rcx), %rcx
    code.push(0x64);
    code.extend_from_slice(&[0x48, 0x8b, 0x0c, 0x25]);
    code.extend_from_slice(&(trampoline_guard_tls_offset() as u32).to_le_bytes());
    code.extend_from_slice(&[0x48, 0x85, 0x09]);

    // Restore arguments in reverse order.
    for xmm in (0..8u8).rev() {
        // movsd (%rsp), %xmmN; add 8, rsp
        code.extend_from_slice(&[0xf2, 0x0f, 0x10, 0x04 | (xmm << 3), 0x24]);
        code.extend_from_slice(&[0x48, 0x83, 0xc4, 0x08]);
    }
    code.extend_from_slice(&[0x41, 0x59]); // pop r9
    code.extend_from_slice(&[0x41, 0x58]); // pop r8
    for reg in [0x59u8, 0x5a, 0x5e, 0x5f] {
        code.push(reg); // pop rcx, rdx, rsi, rdi
    }

    // pop rbp; jmp *%rax
    code.push(0x5d);
    code.extend_from_slice(&[0xff, 0xe0]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_calls_the_compiler() {
        let compiler = 0x7000_0000usize;
        let t = Trampoline::emit(Target::X64, 0x1234_5678, compiler).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(t.addr() as *const u8, t.len()) };

        // movabs carries the state pointer.
        let movabs_at = bytes
            .windows(2)
            .position(|w| w == [0x48, 0xbf])
            .expect("movabs rdi");
        let imm = u64::from_le_bytes(bytes[movabs_at + 2..movabs_at + 10].try_into().unwrap());
        assert_eq!(imm, 0x1234_5678);

        // The call displacement resolves to the compiler entry.
        let call_at = movabs_at + 10;
        assert_eq!(bytes[call_at], 0xe8);
        let rel = i32::from_le_bytes(bytes[call_at + 1..call_at + 5].try_into().unwrap());
        let resolved = (t.addr() + call_at + 5) as i64 + i64::from(rel);
        assert_eq!(resolved as usize, compiler);

        // It ends with jmp *%rax.
        assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xe0]);
    }

    #[test]
    fn ia32_trampoline_shape() {
        let t = Trampoline::emit(Target::Ia32, 0xabcd, 0x7000_0000).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(t.addr() as *const u8, t.len()) };
        assert_eq!(bytes[0], 0x55);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xe0]);
        assert!(bytes.windows(1).any(|w| w == [0x68]), "push imm of the unit");
    }
}
