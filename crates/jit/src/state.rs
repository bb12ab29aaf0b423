//! Per-method JIT state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use javelin_codegen::cu::CompilationUnit;
use javelin_environ::Method;

use crate::trampoline::Trampoline;

/// The lazily-created JIT state of one method: its trampoline, the
/// compilation unit once built, and the published entry point.
pub struct MethodState {
    /// The method this state belongs to.
    pub method: Arc<Method>,
    /// The eager lazy-compilation thunk.
    pub trampoline: Trampoline,
    /// Serialises compilation and owns the unit.
    pub unit: Mutex<Option<Box<CompilationUnit>>>,
    /// Published native entry; the trampoline address until compiled.
    entry: AtomicUsize,
    is_compiled: AtomicBool,
    uncompilable: AtomicBool,
}

impl MethodState {
    pub(crate) fn new(method: Arc<Method>, trampoline: Trampoline) -> Arc<MethodState> {
        let entry = trampoline.addr();
        Arc::new(MethodState {
            method,
            trampoline,
            unit: Mutex::new(None),
            entry: AtomicUsize::new(entry),
            is_compiled: AtomicBool::new(false),
            uncompilable: AtomicBool::new(false),
        })
    }

    /// The address invocations should call right now.
    pub fn entry(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    pub(crate) fn set_entry(&self, entry: usize) {
        self.entry.store(entry, Ordering::Release);
        self.is_compiled.store(true, Ordering::Release);
    }

    /// Has the method been published?
    pub fn is_compiled(&self) -> bool {
        self.is_compiled.load(Ordering::Acquire)
    }

    /// Did a previous compilation fail verification?
    pub fn is_uncompilable(&self) -> bool {
        self.uncompilable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_uncompilable(&self) {
        self.uncompilable.store(true, Ordering::Release);
    }

    /// Drop compile-only state once the method is live, keeping what the
    /// exception engine needs: the bytecode map, handler addresses, frame
    /// shape, and unlock ranges.
    pub(crate) fn shrink(&self) {
        let mut guard = self.unit.lock().unwrap();
        if let Some(cu) = guard.as_mut() {
            for block in cu.blocks.values_mut() {
                block.stmts.clear();
                block.insns.clear();
                block.insns.shrink_to_fit();
            }
            cu.temp_regs.clear();
            cu.temp_slots.clear();
        }
    }
}
