//! The JIT engine: class registration, lazy compilation, publishing, and
//! patching.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;

use javelin_codegen::binemit::CodeBuffer;
use javelin_codegen::cu::CompilationUnit;
use javelin_codegen::isa::Target;
use javelin_codegen::{compile_method, CodegenError};
use javelin_environ::{Class, ClassInitState, Field, Heap, Method, NativeRegistry, ObjectRef};
use javelin_runtime::{
    init_exceptions, jit_text, setup_signal_handlers, ClassRuntime, GuardPage, MonitorTable,
    SimpleHeap, ThreadRegistry,
};

use crate::code_map::CodeMap;
use crate::env::JitEnv;
use crate::exception;
use crate::gdb;
use crate::state::MethodState;
use crate::trampoline::{FixupSite, Trampoline};

/// Engine configuration.
pub struct JitOptions {
    /// Compilation target; defaults to the host.
    pub target: Target,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            target: Target::host().expect("unsupported host architecture"),
        }
    }
}

/// A static-field access site awaiting its class's initialisation.
struct StaticSite {
    state: Arc<MethodState>,
    mach_offset: u32,
}

/// The process-wide JIT engine.
pub struct Jit {
    target: Target,
    classes: Mutex<FxHashMap<String, Arc<Class>>>,
    class_runtimes: Mutex<FxHashMap<String, Box<ClassRuntime>>>,
    class_objects: Mutex<FxHashMap<String, ObjectRef>>,
    interned_strings: Mutex<FxHashMap<String, ObjectRef>>,
    static_sites: Mutex<FxHashMap<String, Vec<StaticSite>>>,
    /// Published-code ranges, for exception lookup and fault routing.
    pub code_map: CodeMap,
    /// The object heap collaborator.
    pub heap: SimpleHeap,
    /// The per-object monitor collaborator.
    pub monitors: MonitorTable,
    /// The thread registry collaborator.
    pub threads: ThreadRegistry,
    natives: OnceCell<Arc<dyn NativeRegistry>>,
    static_guard: GuardPage,
}

static JIT: OnceCell<Jit> = OnceCell::new();

lazy_static::lazy_static! {
    static ref RENDEZVOUS: javelin_runtime::GcRendezvous = javelin_runtime::GcRendezvous::new();
}

/// The process-wide GC rendezvous behind the safepoint page.
pub fn rendezvous() -> &'static javelin_runtime::GcRendezvous {
    &RENDEZVOUS
}

impl Jit {
    /// Install the engine singleton, the guard pages, and the signal
    /// dispatchers.
    pub fn install(options: JitOptions) -> &'static Jit {
        let jit = JIT.get_or_init(|| {
            init_exceptions();
            Jit {
                target: options.target,
                classes: Mutex::new(FxHashMap::default()),
                class_runtimes: Mutex::new(FxHashMap::default()),
                class_objects: Mutex::new(FxHashMap::default()),
                interned_strings: Mutex::new(FxHashMap::default()),
                static_sites: Mutex::new(FxHashMap::default()),
                code_map: CodeMap::new(),
                heap: SimpleHeap::new(),
                monitors: MonitorTable::new(),
                threads: ThreadRegistry::new(),
                natives: OnceCell::new(),
                static_guard: GuardPage::new().expect("failed to allocate the static guard page"),
            }
        });
        setup_signal_handlers(exception::signal_router());
        jit
    }

    /// The installed engine.
    pub fn get() -> &'static Jit {
        JIT.get().expect("Jit::install has not run")
    }

    /// Compilation target.
    pub fn target(&self) -> Target {
        self.target
    }

    /// The static-field guard page.
    pub fn static_guard(&self) -> &GuardPage {
        &self.static_guard
    }

    /// Install the registry of built-in native methods.
    pub fn set_native_registry(&self, registry: Arc<dyn NativeRegistry>) {
        let _ = self.natives.set(registry);
    }

    /// Resolve a native method: a registry hit is called directly with
    /// no JNI conversion; a miss falls through to JNI resolution.
    pub fn native_entry(&self, method: &Arc<Method>) -> Option<usize> {
        let registry = self.natives.get()?;
        let class = method.class();
        registry
            .lookup_native(&class.name, &method.name)
            .map(|f| f as usize)
    }

    // ---- classes -----------------------------------------------------

    /// Register a loaded class: build its runtime descriptor, emit every
    /// JIT-eligible method's trampoline, and fill the dispatch table.
    pub fn register_class(&'static self, class: &Arc<Class>) {
        let vtable_len = class
            .methods
            .iter()
            .map(|m| m.virtual_index + 1)
            .max()
            .unwrap_or(0) as usize;

        let mut runtime = ClassRuntime::new(class, vtable_len, 0);
        for method in &class.methods {
            if method.is_jit_eligible() {
                let state = self.method_state(method);
                runtime.set_vtable_slot(method.virtual_index, state.entry());
            }
        }

        self.heap.register_class(class, runtime.addr());
        self.class_runtimes
            .lock()
            .unwrap()
            .insert(class.name.to_string(), Box::new(runtime));
        self.classes
            .lock()
            .unwrap()
            .insert(class.name.to_string(), Arc::clone(class));
    }

    /// Resolve a registered class by name.
    pub fn class_by_name(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn class_runtime_addr(&self, class: &Arc<Class>) -> usize {
        self.class_runtimes
            .lock()
            .unwrap()
            .get(&*class.name.to_string())
            .map(|rt| rt.addr())
            .unwrap_or(0)
    }

    pub(crate) fn class_object_addr(&self, class: &Arc<Class>) -> usize {
        let mut objects = self.class_objects.lock().unwrap();
        let obj = objects
            .entry(class.name.to_string())
            .or_insert_with(|| {
                self.heap
                    .alloc(class)
                    .expect("failed to allocate a class mirror")
            });
        obj.as_raw() as usize
    }

    pub(crate) fn intern_string(&self, value: &str) -> usize {
        let mut strings = self.interned_strings.lock().unwrap();
        let obj = strings.entry(value.to_string()).or_insert_with(|| {
            self.heap
                .alloc_string(value.as_bytes())
                .expect("failed to allocate a string literal")
        });
        obj.as_raw() as usize
    }

    // ---- method state and compilation --------------------------------

    /// The lazily-created JIT state of a method; emits the trampoline on
    /// first touch.
    pub fn method_state(&'static self, method: &Arc<Method>) -> Arc<MethodState> {
        method.jit_state(|| {
            let trampoline = Trampoline::emit(
                self.target,
                Arc::as_ptr(method) as usize,
                exception::compiler_entry_addr(),
            )
            .expect("failed to emit a trampoline");
            MethodState::new(Arc::clone(method), trampoline)
        })
    }

    /// Compile a method (or return its published entry). On failure the
    /// method is marked uncompilable, a `VerifyError` (or
    /// `OutOfMemoryError`) is posted, and 0 is returned; the trampoline's
    /// guard poll turns that into an unwind.
    pub fn compile(&'static self, method: &Arc<Method>) -> usize {
        let state = self.method_state(method);
        if state.is_compiled() {
            return state.entry();
        }
        if state.is_uncompilable() {
            crate::helpers::post_exception("java/lang/VerifyError");
            return 0;
        }
        if method.is_native() {
            // Only reached when the registry had no built-in and no JNI
            // bridge was bound.
            state.mark_uncompilable();
            crate::helpers::post_exception("java/lang/UnsatisfiedLinkError");
            return 0;
        }

        let mut unit_guard = state.unit.lock().unwrap();
        if state.is_compiled() {
            return state.entry();
        }

        let mut cu = Box::new(CompilationUnit::new(Arc::clone(method), self.target));
        let env = JitEnv { jit: self };
        match compile_method(&mut cu, &env) {
            Ok(()) => {}
            Err(err) => {
                warn!(
                    "compilation of {}.{} failed: {}",
                    method.class().name,
                    method.name,
                    err
                );
                state.mark_uncompilable();
                let class = match err {
                    CodegenError::ImplLimitExceeded(_) => "java/lang/OutOfMemoryError",
                    _ => "java/lang/VerifyError",
                };
                crate::helpers::post_exception(class);
                return 0;
            }
        }

        let entry = match self.publish(&state, &mut cu) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("publishing {} failed: {}", method.name, err);
                state.mark_uncompilable();
                crate::helpers::post_exception("java/lang/OutOfMemoryError");
                return 0;
            }
        };

        let code_len = cu.objcode.bytes().len();
        *unit_guard = Some(cu);
        // The fault router must be able to resolve the code before any
        // thread can reach it, and the entry must be visible before the
        // unit lock is released.
        self.code_map.insert(entry, code_len, Arc::clone(&state));
        state.set_entry(entry);
        drop(unit_guard);

        // Virtual dispatch goes straight to the code from now on.
        let class = method.class();
        if let Some(runtime) = self
            .class_runtimes
            .lock()
            .unwrap()
            .get_mut(&*class.name.to_string())
        {
            runtime.set_vtable_slot(method.virtual_index, entry);
        }

        // Callers that went through the trampoline get retargeted;
        // stale fetches still land in the trampoline, which forwards.
        state.trampoline.fixup_direct_calls(entry);

        gdb::register_code(entry, code_len);
        state.shrink();

        debug!(
            "published {}.{}{} at {:#x}",
            class.name, method.name, method.descriptor, entry
        );
        entry
    }

    /// Copy the unit's code into the text arena, resolve its relocations
    /// against the final base, and register its pending fixups.
    fn publish(
        &'static self,
        state: &Arc<MethodState>,
        cu: &mut CompilationUnit,
    ) -> Result<usize, javelin_runtime::RuntimeError> {
        let bytes = cu.objcode.bytes();
        let base = jit_text().publish(bytes)?;
        unsafe {
            let published = std::slice::from_raw_parts_mut(base as *mut u8, bytes.len());
            CodeBuffer::resolve_relocs(published, cu.objcode.relocs(), base);
        }

        // Direct-call sites against still-uncompiled targets go on the
        // target trampoline's fixup list. Lock order: trampoline first,
        // then (possibly) that method's unit.
        for fixup in &cu.call_fixups {
            let target_state = self.method_state(&fixup.target);
            if target_state.is_compiled() {
                continue;
            }
            target_state.trampoline.add_fixup_site(FixupSite {
                site_addr: base + fixup.mach_offset as usize,
                owner: Arc::downgrade(state),
            });
        }

        // Static-field sites await their class's initialisation.
        for fixup in &cu.static_fixups {
            self.static_sites
                .lock()
                .unwrap()
                .entry(fixup.class.name.to_string())
                .or_default()
                .push(StaticSite {
                    state: Arc::clone(state),
                    mach_offset: fixup.mach_offset,
                });
        }

        Ok(base)
    }

    // ---- static-field patching ---------------------------------------

    /// Placeholder address inside the static guard page for a field.
    pub(crate) fn static_guard_addr(&self, field: &Arc<Field>) -> usize {
        self.static_guard.addr() + (field.offset as usize & 0xff8)
    }

    /// First-access path: initialise the class behind the faulting
    /// instruction and patch every recorded site for it.
    pub fn fixup_static_at(&'static self, fault_pc: usize) -> bool {
        let Some(state) = self.code_map.lookup(fault_pc) else {
            return false;
        };
        let class = state.method.class();
        self.ensure_initialized(&class);
        self.fixup_static(&class);
        true
    }

    fn ensure_initialized(&self, class: &Arc<Class>) {
        let mut init = class.init_lock.lock().unwrap();
        if *init == ClassInitState::Initialized {
            return;
        }
        *init = ClassInitState::Initializing;
        let words = class
            .fields
            .iter()
            .filter(|f| f.is_static())
            .map(|f| (f.offset / 8 + 1) as usize)
            .max()
            .unwrap_or(1);
        class.install_static_values(words);
        *init = ClassInitState::Initialized;
    }

    /// Patch every static-field access site of an initialised class. The
    /// 32-bit operand follows an optional REX prefix and either an SSE
    /// escape (four bytes) or a one-byte opcode plus ModR/M.
    pub fn fixup_static(&'static self, class: &Arc<Class>) {
        let _class_guard = class.init_lock.lock().unwrap();
        let sites = self
            .static_sites
            .lock()
            .unwrap()
            .remove(&*class.name.to_string())
            .unwrap_or_default();

        for site in sites {
            let Some(new_target) = self.resolve_static_target(class, &site) else {
                continue;
            };
            let site_addr = site.state.entry() + site.mach_offset as usize;
            unsafe {
                let mut skip = 0usize;
                let first = *(site_addr as *const u8);
                if self.target == Target::X64 && (first & 0xf0) == 0x40 {
                    skip += 1;
                }
                let opc = site_addr + skip;
                let b0 = *(opc as *const u8);
                let b1 = *((opc + 1) as *const u8);
                if (b0 & 0xfe) == 0xf2 && b1 == 0x0f {
                    skip += 4;
                } else {
                    skip += 2;
                }

                let field = (site_addr + skip) as *mut u32;
                let value = match self.target {
                    Target::Ia32 => new_target as u32,
                    Target::X64 => {
                        (new_target as i64 - (site_addr as i64 + skip as i64 + 4)) as u32
                    }
                };
                field.write_unaligned(value);
            }
        }
    }

    fn resolve_static_target(&self, class: &Arc<Class>, site: &StaticSite) -> Option<usize> {
        // Recover which field the site touches from the unit's fixup
        // record at the same offset.
        let unit = site.state.unit.lock().unwrap();
        let cu = unit.as_ref()?;
        let fixup = cu
            .static_fixups
            .iter()
            .find(|f| f.mach_offset == site.mach_offset)?;
        class
            .static_field_addr(&fixup.field)
            .map(|addr| addr + fixup.word_offset as usize)
    }
}
