//! Class and field records.

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::constant_pool::ConstPool;
use crate::host::ObjectRef;
use crate::method::{Method, MethodProto};
use crate::types::VmType;

/// Field access flags; only the static bit matters to the JIT.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldFlags(u16);

impl FieldFlags {
    /// `ACC_STATIC`
    pub const STATIC: FieldFlags = FieldFlags(0x0008);

    /// Build from the raw access-flags word.
    pub fn from_bits(bits: u16) -> Self {
        FieldFlags(bits)
    }

    /// Test whether all bits of `other` are set.
    pub fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A loaded field.
#[derive(Debug)]
pub struct Field {
    /// Field name.
    pub name: Arc<str>,
    /// Value type of the field.
    pub vm_type: VmType,
    /// Access flags.
    pub flags: FieldFlags,
    /// Byte offset: from the object base for instance fields, into the
    /// static-values block for static fields.
    pub offset: u32,
}

impl Field {
    /// `ACC_STATIC`?
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }
}

/// Initialisation progress of a class, guarded by the class lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassInitState {
    /// `<clinit>` has not run.
    Uninitialized,
    /// `<clinit>` is running on some thread.
    Initializing,
    /// Ready for use; the static-values block exists.
    Initialized,
}

/// A loaded class.
///
/// Classes are immortal: once linked they are never unloaded, so the `Arc`
/// cycle between a class and its methods is intentional.
#[derive(Debug)]
pub struct Class {
    /// Binary name, e.g. `java/lang/String`.
    pub name: Arc<str>,
    /// Direct superclass, absent only for `java/lang/Object`.
    pub super_class: Option<Arc<Class>>,
    /// Directly implemented interfaces.
    pub interfaces: Vec<Arc<Class>>,
    /// The class's constant pool.
    pub constant_pool: ConstPool,
    /// Declared methods.
    pub methods: Vec<Arc<Method>>,
    /// Declared fields.
    pub fields: Vec<Arc<Field>>,

    /// Guards initialisation state transitions and static-site patching.
    pub init_lock: Mutex<ClassInitState>,
    static_values: OnceCell<Box<[u64]>>,
    class_object: OnceCell<ObjectRef>,
}

impl Class {
    /// Link a class from loader output, wiring method back-references.
    pub fn link(
        name: Arc<str>,
        super_class: Option<Arc<Class>>,
        interfaces: Vec<Arc<Class>>,
        constant_pool: ConstPool,
        methods: Vec<MethodProto>,
        fields: Vec<Arc<Field>>,
    ) -> Arc<Class> {
        let base_index = super_class
            .as_ref()
            .map_or(0, |sup| sup.methods.len() as u32);

        Arc::new_cyclic(|weak| Class {
            name,
            super_class,
            interfaces,
            constant_pool,
            methods: methods
                .into_iter()
                .enumerate()
                .map(|(i, proto)| {
                    Arc::new(Method::new(proto, weak.clone(), base_index + i as u32))
                })
                .collect(),
            fields,
            init_lock: Mutex::new(ClassInitState::Uninitialized),
            static_values: OnceCell::new(),
            class_object: OnceCell::new(),
        })
    }

    /// Is a value of class `other` assignable to a variable of this class?
    /// Walks the superclass chain and the transitive interface set.
    pub fn is_assignable_from(&self, other: &Class) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if let Some(sup) = &other.super_class {
            if self.is_assignable_from(sup) {
                return true;
            }
        }
        other
            .interfaces
            .iter()
            .any(|iface| self.is_assignable_from(iface))
    }

    /// Find a declared method by name and descriptor.
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|m| &*m.name == name && &*m.descriptor == descriptor)
    }

    /// Find a declared field by name.
    pub fn field(&self, name: &str) -> Option<&Arc<Field>> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// The static-values block, present once the class is initialised.
    pub fn static_values(&self) -> Option<&[u64]> {
        self.static_values.get().map(|b| &**b)
    }

    /// Address of a static field's storage slot, for code patching.
    pub fn static_field_addr(&self, field: &Field) -> Option<usize> {
        debug_assert!(field.is_static());
        self.static_values
            .get()
            .map(|block| block.as_ptr() as usize + field.offset as usize)
    }

    /// Allocate the static-values block. Called exactly once, from the
    /// class initialiser under the class lock.
    pub fn install_static_values(&self, words: usize) -> &[u64] {
        self.static_values
            .get_or_init(|| vec![0u64; words].into_boxed_slice())
    }

    /// The `java/lang/Class` instance mirroring this class, installed by
    /// the heap when it is created.
    pub fn class_object(&self) -> Option<ObjectRef> {
        self.class_object.get().copied()
    }

    /// Install the mirror instance.
    pub fn set_class_object(&self, obj: ObjectRef) {
        let _ = self.class_object.set(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, sup: Option<Arc<Class>>, ifaces: Vec<Arc<Class>>) -> Arc<Class> {
        Class::link(
            name.into(),
            sup,
            ifaces,
            ConstPool::default(),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn assignability_walks_supers_and_interfaces() {
        let object = class("java/lang/Object", None, vec![]);
        let comparable = class("java/lang/Comparable", Some(Arc::clone(&object)), vec![]);
        let number = class("java/lang/Number", Some(Arc::clone(&object)), vec![]);
        let integer = class(
            "java/lang/Integer",
            Some(Arc::clone(&number)),
            vec![Arc::clone(&comparable)],
        );

        assert!(object.is_assignable_from(&integer));
        assert!(number.is_assignable_from(&integer));
        assert!(comparable.is_assignable_from(&integer));
        assert!(!integer.is_assignable_from(&number));
    }

    #[test]
    fn static_values_block_is_stable() {
        let c = class("C", None, vec![]);
        let first = c.install_static_values(4).as_ptr();
        let again = c.install_static_values(8).as_ptr();
        assert_eq!(first, again);
        assert_eq!(c.static_values().unwrap().len(), 4);
    }
}
