//! Binary emission buffer.
//!
//! A growable little-endian byte buffer plus the relocation records the
//! publisher needs once the code is copied to its final address.

/// Offset in bytes from the beginning of a function's code.
pub type CodeOffset = u32;

/// Relocation kinds recorded during emission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reloc {
    /// 4-byte PC-relative field: `target - (field_addr + 4)`.
    PcRel4 {
        /// Absolute target address.
        target: usize,
    },
    /// 4-byte absolute field holding `target` directly (x86-32 memdisp).
    Abs4 {
        /// Absolute target address.
        target: usize,
    },
    /// 4-byte absolute field holding the final address of a code offset
    /// within this same function (x86-32 `jsr` return addresses).
    CodeAbs4 {
        /// Offset into the function's own code.
        code_offset: u32,
    },
    /// 8-byte absolute field holding the final address of a code offset
    /// within this same function (x86-64 `movabs`).
    CodeAbs8 {
        /// Offset into the function's own code.
        code_offset: u32,
    },
}

/// A recorded relocation at a buffer offset.
#[derive(Copy, Clone, Debug)]
pub struct RelocSite {
    /// Offset of the 4-byte field inside the buffer.
    pub offset: CodeOffset,
    /// What the field must resolve to.
    pub reloc: Reloc,
}

/// Growable code buffer.
#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    relocs: Vec<RelocSite>,
}

impl CodeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position.
    pub fn offset(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Append one byte.
    pub fn put1(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Append two little-endian bytes.
    pub fn put2(&mut self, word: u16) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Append four little-endian bytes.
    pub fn put4(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Append eight little-endian bytes.
    pub fn put8(&mut self, word: u64) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Overwrite the 4-byte field at `offset`. The store is to a plain
    /// byte vector here; patching published code goes through the
    /// publisher's atomic path instead.
    pub fn write_u32_at(&mut self, offset: CodeOffset, value: u32) {
        self.bytes[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read back the 4-byte field at `offset`.
    pub fn read_u32_at(&self, offset: CodeOffset) -> u32 {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.bytes[offset as usize..offset as usize + 4]);
        u32::from_le_bytes(field)
    }

    /// Record a relocation for the 4-byte field at the current position,
    /// then emit a placeholder.
    pub fn reloc_here(&mut self, reloc: Reloc) {
        self.relocs.push(RelocSite {
            offset: self.offset(),
            reloc,
        });
        self.put4(0);
    }

    /// Record a relocation for an already-emitted field.
    pub fn record_reloc(&mut self, offset: CodeOffset, reloc: Reloc) {
        self.relocs.push(RelocSite { offset, reloc });
    }

    /// The recorded relocations.
    pub fn relocs(&self) -> &[RelocSite] {
        &self.relocs
    }

    /// Resolve every relocation against the final base address of the
    /// code, writing the fields in place. Called by the publisher after
    /// the copy into the text arena, before the code is made executable.
    pub fn resolve_relocs(bytes: &mut [u8], relocs: &[RelocSite], base: usize) {
        for site in relocs {
            let field_addr = base + site.offset as usize;
            let at = site.offset as usize;
            match site.reloc {
                Reloc::PcRel4 { target } => {
                    let value = (target as i64 - (field_addr as i64 + 4)) as u32;
                    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
                }
                Reloc::Abs4 { target } => {
                    bytes[at..at + 4].copy_from_slice(&(target as u32).to_le_bytes());
                }
                Reloc::CodeAbs4 { code_offset } => {
                    let value = (base + code_offset as usize) as u32;
                    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
                }
                Reloc::CodeAbs8 { code_offset } => {
                    let value = (base + code_offset as usize) as u64;
                    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_patch() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xe9);
        buf.put4(0);
        buf.write_u32_at(1, 0x1234_5678);
        assert_eq!(buf.bytes(), &[0xe9, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(buf.read_u32_at(1), 0x1234_5678);
    }

    #[test]
    fn pcrel_reloc_resolves_against_base() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xe8);
        buf.reloc_here(Reloc::PcRel4 { target: 0x2000 });
        let mut bytes = buf.bytes().to_vec();
        CodeBuffer::resolve_relocs(&mut bytes, buf.relocs(), 0x1000);
        // target - (base + 1 + 4)
        let field = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(field as i32, 0x2000 - 0x1005);
    }
}
