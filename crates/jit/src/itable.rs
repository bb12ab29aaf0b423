//! x86-32 interface-call resolver stubs.
//!
//! One stub per class. The call site materialises the interface method's
//! signature hash in `eax` before calling the stub; the stub runs a
//! compiled-in binary search over the class's sorted
//! `(signature hash, virtual index)` table and tail-jumps through the
//! matching vtable slot in `ecx`. A hash that matches nothing falls into
//! the abort diagnostic — that can only happen on a broken class file.

use log::error;

use javelin_runtime::{jit_text, RuntimeError};

/// One itable row: interface method signature hash and the concrete
/// method's vtable index.
#[derive(Copy, Clone, Debug)]
pub struct ItableEntry {
    /// The key the call site loads into `eax`.
    pub key: u32,
    /// Slot in the receiver class's vtable.
    pub virtual_index: u32,
}

extern "C" fn itable_resolver_stub_error() -> ! {
    error!("itable resolver stub error: no entry for the called signature");
    std::process::abort();
}

struct StubAssembler {
    code: Vec<u8>,
    base: usize,
}

impl StubAssembler {
    fn offset(&self) -> usize {
        self.code.len()
    }

    fn put1(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn put4(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    /// Emit a rel32 placeholder, returning its offset for fixup.
    fn branch_placeholder(&mut self, opcode: &[u8]) -> usize {
        self.code.extend_from_slice(opcode);
        let at = self.code.len();
        self.put4(0);
        at
    }

    fn fixup_to_here(&mut self, field: usize) {
        let rel = (self.code.len() as i64 - field as i64 - 4) as i32;
        self.code[field..field + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn jmp_abs(&mut self, target: usize) {
        self.put1(0xe9);
        let at = self.code.len();
        let rel = target as i64 - (self.base + at + 4) as i64;
        self.put4(rel as i32 as u32);
    }
}

/// Recursive binary-search emission over `table[a..=b]`.
fn emit_bsearch(asm: &mut StubAssembler, table: &[ItableEntry], a: usize, b: usize) {
    let m = a + (b - a) / 2;

    let mut jb_field = None;
    let mut ja_field = None;

    if b > a {
        // cmp $key, %eax
        asm.put1(0x3d);
        asm.put4(table[m].key);
        if m > a {
            jb_field = Some(asm.branch_placeholder(&[0x0f, 0x82]));
        }
        if b > m {
            ja_field = Some(asm.branch_placeholder(&[0x0f, 0x87]));
        }
    }

    // add $4*virtual_index, %ecx ; jmp *(%ecx)
    asm.put1(0x81);
    asm.put1(0xc1);
    asm.put4(table[m].virtual_index * 4);
    asm.put1(0xff);
    asm.put1(0x21);

    if let Some(field) = jb_field {
        asm.fixup_to_here(field);
        emit_bsearch(asm, table, a, m - 1);
    }
    if let Some(field) = ja_field {
        asm.fixup_to_here(field);
        emit_bsearch(asm, table, m + 1, b);
    }
}

/// Emit a resolver stub for a class whose vtable lives at `vtable_addr`.
/// `table` must be sorted by key and non-empty.
pub fn emit_itable_resolver_stub(
    table: &[ItableEntry],
    vtable_addr: usize,
) -> Result<usize, RuntimeError> {
    debug_assert!(!table.is_empty());
    debug_assert!(table.windows(2).all(|w| w[0].key < w[1].key));

    // Upper bound: per entry one cmp (5), two branches (12), and the
    // add/jmp leaf (8); plus the vtable load and the error tail.
    let bound = table.len() * 32 + 32;
    let base = jit_text().reserve(bound)?;

    let mut asm = StubAssembler {
        code: Vec::with_capacity(bound),
        base,
    };

    // mov $vtable, %ecx — the leaves only add the slot displacement.
    asm.put1(0xb9);
    asm.put4(vtable_addr as u32);

    emit_bsearch(&mut asm, table, 0, table.len() - 1);

    // No match: abort with a diagnostic.
    asm.jmp_abs(itable_resolver_stub_error as usize);

    assert!(asm.code.len() <= bound);
    unsafe {
        std::ptr::copy_nonoverlapping(asm.code.as_ptr(), base as *mut u8, asm.code.len());
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstone::prelude::*;

    fn stub_for(n: u32) -> (usize, Vec<ItableEntry>) {
        let table: Vec<ItableEntry> = (0..n)
            .map(|i| ItableEntry {
                key: 0x1000 + i * 0x10,
                virtual_index: i,
            })
            .collect();
        let addr = emit_itable_resolver_stub(&table, 0x4000_0000).unwrap();
        (addr, table)
    }

    fn decode(addr: usize) -> Vec<(u64, String, String)> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .build()
            .unwrap();
        // A generous window; decoding stops making sense after the stub
        // but the instructions we assert on come first.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 256) };
        let insns = cs.disasm_all(bytes, addr as u64).unwrap();
        insns
            .iter()
            .map(|i| {
                (
                    i.address(),
                    i.mnemonic().unwrap_or("").to_owned(),
                    i.op_str().unwrap_or("").to_owned(),
                )
            })
            .collect()
    }

    /// Comparisons executed before the leaf for `key`, walking the same
    /// recursion the emitter performs.
    fn search_depth(table: &[ItableEntry], a: usize, b: usize, key: u32) -> usize {
        let m = a + (b - a) / 2;
        if table[m].key == key || a == b {
            usize::from(b > a)
        } else if key < table[m].key {
            1 + search_depth(table, a, m - 1, key)
        } else {
            1 + search_depth(table, m + 1, b, key)
        }
    }

    #[test]
    fn five_entry_stub_compares_at_most_three_times_per_path() {
        let (addr, table) = stub_for(5);
        let decoded = decode(addr);

        // One compare instruction per table entry in total, and the root
        // compare is against the middle key.
        let cmps: Vec<_> = decoded.iter().filter(|(_, m, _)| m == "cmp").collect();
        assert_eq!(cmps.len(), table.len());
        assert!(
            cmps[0].2.contains(&format!("{:#x}", table[2].key)),
            "root compares against the median, got `{}`",
            cmps[0].2
        );

        // Every search path runs at most ceil(log2(5)) = 3 comparisons.
        for entry in &table {
            assert!(search_depth(&table, 0, table.len() - 1, entry.key) <= 3);
        }
    }

    #[test]
    fn leaf_adds_the_scaled_index_and_jumps_indirect() {
        let (addr, _) = stub_for(5);
        let decoded = decode(addr);
        assert!(decoded
            .iter()
            .any(|(_, m, ops)| m == "add" && ops.contains("ecx")));
        assert!(decoded
            .iter()
            .any(|(_, m, ops)| m == "jmp" && ops.contains("[ecx]")));
    }

    #[test]
    fn stub_loads_the_vtable_base_first() {
        let (addr, _) = stub_for(2);
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 5) };
        assert_eq!(bytes[0], 0xb9);
        assert_eq!(
            u32::from_le_bytes(bytes[1..5].try_into().unwrap()),
            0x4000_0000
        );
    }
}
