//! Published-code address map.
//!
//! Maps native addresses back to the method state that owns them; the
//! exception engine and the signal dispatcher both key on it.

use std::sync::{Arc, RwLock};

use crate::state::MethodState;

/// Sorted list of published code ranges.
pub struct CodeMap {
    ranges: RwLock<Vec<(usize, usize, Arc<MethodState>)>>,
}

impl CodeMap {
    /// An empty map.
    pub fn new() -> Self {
        CodeMap {
            ranges: RwLock::new(Vec::new()),
        }
    }

    /// Record a published range.
    pub fn insert(&self, start: usize, len: usize, state: Arc<MethodState>) {
        let mut ranges = self.ranges.write().unwrap();
        let at = ranges.partition_point(|&(s, _, _)| s < start);
        ranges.insert(at, (start, start + len, state));
    }

    /// The method whose code contains `addr`.
    pub fn lookup(&self, addr: usize) -> Option<Arc<MethodState>> {
        let ranges = self.ranges.read().unwrap();
        let at = ranges.partition_point(|&(s, _, _)| s <= addr);
        if at == 0 {
            return None;
        }
        let (start, end, ref state) = ranges[at - 1];
        if addr >= start && addr < end {
            Some(Arc::clone(state))
        } else {
            None
        }
    }

    /// Is `addr` inside any published method?
    pub fn contains(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }
}

impl Default for CodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trampoline::Trampoline;
    use javelin_codegen::isa::Target;
    use javelin_environ::{Class, ConstPool, MethodFlags, MethodProto, VmType};

    fn dummy_state() -> Arc<MethodState> {
        let class = Class::link(
            "T".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            vec![MethodProto {
                name: "m".into(),
                descriptor: "()V".into(),
                args: Vec::new(),
                ret: VmType::Void,
                flags: MethodFlags::STATIC,
                code: vec![0xb1],
                max_stack: 0,
                max_locals: 0,
                exception_table: Vec::new(),
                line_numbers: Vec::new(),
            }],
            Vec::new(),
        );
        let method = Arc::clone(&class.methods[0]);
        let trampoline = Trampoline::emit(Target::X64, 0, 0x1000).unwrap();
        MethodState::new(method, trampoline)
    }

    #[test]
    fn lookup_finds_the_covering_range() {
        let map = CodeMap::new();
        let a = dummy_state();
        let b = dummy_state();
        map.insert(0x4000, 0x100, Arc::clone(&a));
        map.insert(0x8000, 0x40, Arc::clone(&b));

        assert!(Arc::ptr_eq(&map.lookup(0x4000).unwrap(), &a));
        assert!(Arc::ptr_eq(&map.lookup(0x40ff).unwrap(), &a));
        assert!(map.lookup(0x4100).is_none());
        assert!(Arc::ptr_eq(&map.lookup(0x8010).unwrap(), &b));
        assert!(!map.contains(0x100));
    }
}
