//! Class metadata: hierarchy, member lookup, accessibility and the per-class
//! initialization state.
use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::constant_pool::{ConstantPool, ConstantPoolBuilder};
use crate::heap::Ref;
use crate::program::{AccessFlags, BootstrapMethod, Field, FieldBuilder, Method, MethodBuilder};
use crate::slot::Slot;

pub const OBJECT: &str = "java/lang/Object";

#[derive(Debug, Clone)]
pub enum ClassKind {
    Ordinary,
    /// `int`, `long`, ... carrying their descriptor character.
    Primitive(char),
    Array(Arc<Class>),
}

/// Progress of a class's static initializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    InProgress(u64),
    Initialized,
    Failed,
}

/// What a thread touching a class must do about its initializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitAction {
    /// The caller now owns initialization and must call `finish_init`.
    Run,
    /// Initialized, or being initialized by the calling thread.
    Done,
    Failed,
}

pub struct Class {
    pub name: String,
    pub access: AccessFlags,
    pub super_class: Option<Arc<Class>>,
    pub interfaces: Vec<Arc<Class>>,
    pub constant_pool: ConstantPool,
    pub methods: Vec<Arc<Method>>,
    pub fields: Vec<Arc<Field>>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
    /// Field slots of an instance, inherited ones included.
    pub instance_slot_count: usize,
    pub kind: ClassKind,
    statics: Mutex<Vec<Slot>>,
    init: Mutex<InitState>,
    init_done: Condvar,
    mirror: OnceCell<Ref>,
}

impl Class {
    fn with_kind(name: String, kind: ClassKind, super_class: Option<Arc<Class>>, interfaces: Vec<Arc<Class>>) -> Self {
        Class {
            name,
            access: AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT,
            instance_slot_count: super_class.as_ref().map_or(0, |s| s.instance_slot_count),
            super_class,
            interfaces,
            constant_pool: ConstantPool::default(),
            methods: Vec::new(),
            fields: Vec::new(),
            bootstrap_methods: Vec::new(),
            kind,
            statics: Mutex::new(Vec::new()),
            init: Mutex::new(InitState::Initialized),
            init_done: Condvar::new(),
            mirror: OnceCell::new(),
        }
    }

    pub(crate) fn primitive(name: &str, descriptor: char) -> Arc<Class> {
        Arc::new(Self::with_kind(
            name.to_string(),
            ClassKind::Primitive(descriptor),
            None,
            Vec::new(),
        ))
    }

    /// Array class of `component`. `object` and `interfaces` are
    /// `java/lang/Object` and the array covariance interfaces.
    pub(crate) fn array(component: Arc<Class>, object: Arc<Class>, interfaces: Vec<Arc<Class>>) -> Arc<Class> {
        let name = format!("[{}", component.descriptor());
        Arc::new(Self::with_kind(
            name,
            ClassKind::Array(component),
            Some(object),
            interfaces,
        ))
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(AccessFlags::ABSTRACT)
    }

    /// `ACC_SUPER` selects the modern `invokespecial` semantics.
    pub fn is_super(&self) -> bool {
        self.access.contains(AccessFlags::SUPER)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, ClassKind::Primitive(_))
    }

    pub fn component(&self) -> Option<&Arc<Class>> {
        match &self.kind {
            ClassKind::Array(component) => Some(component),
            _ => None,
        }
    }

    /// Field descriptor naming this class.
    pub fn descriptor(&self) -> String {
        match self.kind {
            ClassKind::Primitive(c) => c.to_string(),
            ClassKind::Array(_) => self.name.clone(),
            ClassKind::Ordinary => format!("L{};", self.name),
        }
    }

    /// First character of `descriptor()`.
    pub fn descriptor_char(&self) -> char {
        match self.kind {
            ClassKind::Primitive(c) => c,
            ClassKind::Array(_) => '[',
            ClassKind::Ordinary => 'L',
        }
    }

    /// Runtime package, the binary name up to its last `/`.
    pub fn package(&self) -> &str {
        match &self.kind {
            ClassKind::Array(component) => component.package(),
            _ => self.name.rsplit_once('/').map_or("", |(package, _)| package),
        }
    }

    pub fn same_class(&self, other: &Class) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }

    /// True if `self` is `other`, extends it, or implements it.
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        if self.same_class(other) {
            return true;
        }
        if self.interfaces.iter().any(|i| i.is_subclass_of(other)) {
            return true;
        }
        self.super_class
            .as_ref()
            .map_or(false, |s| s.is_subclass_of(other))
    }

    /// Assignment compatibility as checked by `checkcast`, `instanceof` and
    /// `aastore`.
    pub fn can_cast_to(&self, target: &Class) -> bool {
        match (&self.kind, &target.kind) {
            (ClassKind::Array(from), ClassKind::Array(to)) => {
                if from.is_primitive() || to.is_primitive() {
                    from.same_class(to)
                } else {
                    from.can_cast_to(to)
                }
            }
            (ClassKind::Array(_), _) => {
                target.name == OBJECT
                    || (target.is_interface() && self.interfaces.iter().any(|i| i.same_class(target)))
            }
            _ => self.is_subclass_of(target),
        }
    }

    /// Class level accessibility: public, or in the visitor's package.
    pub fn is_accessible_to(&self, visitor: &Class) -> bool {
        match &self.kind {
            ClassKind::Primitive(_) => true,
            ClassKind::Array(component) => component.is_accessible_to(visitor),
            ClassKind::Ordinary => {
                self.access.contains(AccessFlags::PUBLIC) || self.package() == visitor.package()
            }
        }
    }

    /// Member level accessibility of a member of `declaring` with `flags`.
    pub fn member_accessible(visitor: &Class, declaring: &Class, flags: AccessFlags) -> bool {
        if flags.contains(AccessFlags::PUBLIC) {
            return true;
        }
        if flags.contains(AccessFlags::PRIVATE) {
            return visitor.same_class(declaring);
        }
        if visitor.package() == declaring.package() {
            return true;
        }
        flags.contains(AccessFlags::PROTECTED) && visitor.is_subclass_of(declaring)
    }

    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
            .cloned()
    }

    pub fn declared_field(&self, name: &str, descriptor: &str) -> Option<Arc<Field>> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
            .cloned()
    }

    /// Method resolution for class method references: the class and its
    /// superclasses, then its superinterfaces.
    pub fn lookup_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut class = Some(self);
        while let Some(c) = class {
            if let Some(m) = c.declared_method(name, descriptor) {
                return Some(m);
            }
            class = c.super_class.as_deref();
        }
        self.lookup_in_superinterfaces(name, descriptor)
    }

    /// The single signature polymorphic method `name` declared by this
    /// class. It matches a call site of any descriptor.
    pub fn lookup_polymorphic_method(&self, name: &str) -> Option<Arc<Method>> {
        let mut candidates = self
            .methods
            .iter()
            .filter(|m| m.name == name && m.is_signature_polymorphic());
        match (candidates.next(), candidates.next()) {
            (Some(method), None) => Some(method.clone()),
            _ => None,
        }
    }

    /// Method resolution for interface method references: the interface,
    /// its superinterfaces, then `java/lang/Object`.
    pub fn lookup_interface_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        self.declared_method(name, descriptor)
            .or_else(|| self.lookup_in_superinterfaces(name, descriptor))
            .or_else(|| {
                self.super_class
                    .as_ref()
                    .and_then(|s| s.lookup_method(name, descriptor))
                    .filter(|m| m.is_public() && !m.is_static())
            })
    }

    fn lookup_in_superinterfaces(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut class = Some(self);
        while let Some(c) = class {
            for interface in &c.interfaces {
                let found = interface
                    .declared_method(name, descriptor)
                    .or_else(|| interface.lookup_in_superinterfaces(name, descriptor));
                if found.is_some() {
                    return found;
                }
            }
            class = c.super_class.as_deref();
        }
        None
    }

    /// Selection of the method a virtual or interface call runs on an
    /// instance of this class: the nearest non-static declaration up the
    /// superclass chain, then a default method from the superinterfaces.
    pub fn lookup_instance_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut class = Some(self);
        while let Some(c) = class {
            if let Some(m) = c.declared_method(name, descriptor).filter(|m| !m.is_static()) {
                return Some(m);
            }
            class = c.super_class.as_deref();
        }
        self.lookup_in_superinterfaces(name, descriptor)
            .filter(|m| !m.is_abstract() && !m.is_static())
    }

    /// Field resolution: the class, its superinterfaces, then its
    /// superclass.
    pub fn lookup_field(&self, name: &str, descriptor: &str) -> Option<Arc<Field>> {
        self.declared_field(name, descriptor)
            .or_else(|| {
                self.interfaces
                    .iter()
                    .find_map(|i| i.lookup_field(name, descriptor))
            })
            .or_else(|| {
                self.super_class
                    .as_ref()
                    .and_then(|s| s.lookup_field(name, descriptor))
            })
    }

    pub fn get_static(&self, slot_id: usize, count: usize) -> Vec<Slot> {
        let statics = self.statics.lock();
        statics[slot_id..slot_id + count].to_vec()
    }

    pub fn set_static(&self, slot_id: usize, values: &[Slot]) {
        let mut statics = self.statics.lock();
        statics[slot_id..slot_id + values.len()].copy_from_slice(values);
    }

    pub fn init_state(&self) -> InitState {
        *self.init.lock()
    }

    /// Claims initialization for `thread_id`, blocking while another thread
    /// holds it.
    pub fn begin_init(&self, thread_id: u64) -> InitAction {
        let mut state = self.init.lock();
        loop {
            match *state {
                InitState::Initialized => return InitAction::Done,
                InitState::Failed => return InitAction::Failed,
                InitState::InProgress(owner) if owner == thread_id => return InitAction::Done,
                InitState::InProgress(_) => self.init_done.wait(&mut state),
                InitState::Uninitialized => {
                    *state = InitState::InProgress(thread_id);
                    return InitAction::Run;
                }
            }
        }
    }

    pub fn finish_init(&self, succeeded: bool) {
        let mut state = self.init.lock();
        *state = if succeeded {
            InitState::Initialized
        } else {
            InitState::Failed
        };
        self.init_done.notify_all();
    }

    pub(crate) fn mirror_cell(&self) -> &OnceCell<Ref> {
        &self.mirror
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("access", &self.access)
            .field("super_class", &self.super_class.as_ref().map(|s| &s.name))
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Assembles a class from parts; the `Jvm` links it against its superclass
/// and interfaces when it is defined.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    access: AccessFlags,
    super_name: Option<String>,
    interfaces: Vec<String>,
    pool: ConstantPoolBuilder,
    methods: Vec<MethodBuilder>,
    fields: Vec<FieldBuilder>,
    bootstrap_methods: Vec<BootstrapMethod>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            access: AccessFlags::PUBLIC | AccessFlags::SUPER,
            super_name: Some(OBJECT.to_string()),
            interfaces: Vec::new(),
            pool: ConstantPoolBuilder::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            bootstrap_methods: Vec::new(),
        }
    }

    pub fn super_class(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_string());
        self
    }

    pub fn no_super(mut self) -> Self {
        self.super_name = None;
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn pool(&mut self) -> &mut ConstantPoolBuilder {
        &mut self.pool
    }

    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }

    pub fn field(mut self, field: FieldBuilder) -> Self {
        self.fields.push(field);
        self
    }

    /// Appends a bootstrap method; entries are numbered in insertion order.
    pub fn bootstrap_method(mut self, method_ref: u16, arguments: Vec<u16>) -> Self {
        self.bootstrap_methods.push(BootstrapMethod {
            method_ref,
            arguments,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    pub fn interface_names(&self) -> &[String] {
        &self.interfaces
    }

    /// Lays out field storage and ties members to the new class.
    pub(crate) fn build(self, super_class: Option<Arc<Class>>, interfaces: Vec<Arc<Class>>) -> Arc<Class> {
        let ClassBuilder {
            name,
            access,
            pool,
            methods,
            fields,
            bootstrap_methods,
            ..
        } = self;
        Arc::new_cyclic(|weak: &Weak<Class>| {
            let mut next_instance = super_class.as_ref().map_or(0, |s| s.instance_slot_count);
            let mut next_static = 0;
            let fields: Vec<Arc<Field>> = fields
                .into_iter()
                .map(|builder| {
                    let width = if matches!(builder.descriptor.as_str(), "J" | "D") { 2 } else { 1 };
                    let counter = if builder.access.contains(AccessFlags::STATIC) {
                        &mut next_static
                    } else {
                        &mut next_instance
                    };
                    let slot_id = *counter;
                    *counter += width;
                    Arc::new(builder.build(slot_id, weak.clone()))
                })
                .collect();
            let methods = methods
                .into_iter()
                .map(|builder| Arc::new(builder.build(weak.clone())))
                .collect();
            Class {
                name,
                access,
                super_class,
                interfaces,
                constant_pool: pool.build(),
                methods,
                fields,
                bootstrap_methods,
                instance_slot_count: next_instance,
                kind: ClassKind::Ordinary,
                statics: Mutex::new(vec![Slot::ZERO; next_static]),
                init: Mutex::new(InitState::Uninitialized),
                init_done: Condvar::new(),
                mirror: OnceCell::new(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> Arc<Class> {
        ClassBuilder::new(OBJECT)
            .no_super()
            .method(MethodBuilder::new("toString", "()Ljava/lang/String;").code(1, 1, vec![0x01, 0xb0]))
            .build(None, Vec::new())
    }

    #[test]
    fn field_slots_continue_after_superclass() {
        let object = object();
        let base = ClassBuilder::new("a/Base")
            .field(FieldBuilder::new("x", "J", AccessFlags::PRIVATE))
            .field(FieldBuilder::new("COUNT", "I", AccessFlags::STATIC))
            .build(Some(object), Vec::new());
        let derived = ClassBuilder::new("a/Derived")
            .super_class("a/Base")
            .field(FieldBuilder::new("y", "I", AccessFlags::PUBLIC))
            .build(Some(base.clone()), Vec::new());
        assert_eq!(base.instance_slot_count, 2);
        assert_eq!(derived.instance_slot_count, 3);
        assert_eq!(derived.declared_field("y", "I").map(|f| f.slot_id), Some(2));
        assert_eq!(base.declared_field("COUNT", "I").map(|f| f.slot_id), Some(0));
        assert_eq!(derived.lookup_field("x", "J").map(|f| f.class().name.clone()), Some("a/Base".into()));
    }

    #[test]
    fn hierarchy_and_casts() {
        let object = object();
        let runnable = ClassBuilder::new("a/Task")
            .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .build(Some(object.clone()), Vec::new());
        let impl_class = ClassBuilder::new("b/Impl")
            .interface("a/Task")
            .build(Some(object.clone()), vec![runnable.clone()]);
        assert!(impl_class.is_subclass_of(&runnable));
        assert!(impl_class.can_cast_to(&object));
        assert!(!object.can_cast_to(&impl_class));

        let int = Class::primitive("int", 'I');
        let long = Class::primitive("long", 'J');
        let ints = Class::array(int, object.clone(), Vec::new());
        let longs = Class::array(long, object.clone(), Vec::new());
        let impls = Class::array(impl_class, object.clone(), Vec::new());
        let tasks = Class::array(runnable, object.clone(), Vec::new());
        assert_eq!(ints.name, "[I");
        assert_eq!(impls.name, "[Lb/Impl;");
        assert!(!ints.can_cast_to(&longs));
        assert!(ints.can_cast_to(&ints));
        assert!(ints.can_cast_to(&object));
        assert!(impls.can_cast_to(&tasks));
        assert!(!tasks.can_cast_to(&impls));
    }

    #[test]
    fn member_access_rules() {
        let object = object();
        let a = ClassBuilder::new("p/A").build(Some(object.clone()), Vec::new());
        let b = ClassBuilder::new("p/B").build(Some(object.clone()), Vec::new());
        let sub = ClassBuilder::new("q/Sub").super_class("p/A").build(Some(a.clone()), Vec::new());
        let other = ClassBuilder::new("q/Other").build(Some(object), Vec::new());
        assert!(Class::member_accessible(&b, &a, AccessFlags::empty()));
        assert!(!Class::member_accessible(&b, &a, AccessFlags::PRIVATE));
        assert!(Class::member_accessible(&sub, &a, AccessFlags::PROTECTED));
        assert!(!Class::member_accessible(&other, &a, AccessFlags::PROTECTED));
        assert!(!Class::member_accessible(&other, &a, AccessFlags::empty()));
    }

    #[test]
    fn virtual_selection_walks_superclasses() {
        let object = object();
        let base = ClassBuilder::new("a/Base")
            .method(MethodBuilder::new("f", "()I").code(1, 1, vec![0x04, 0xac]))
            .build(Some(object), Vec::new());
        let derived = ClassBuilder::new("a/Derived")
            .super_class("a/Base")
            .build(Some(base), Vec::new());
        let f = derived.lookup_instance_method("f", "()I");
        assert_eq!(f.map(|m| m.class_name()), Some("a/Base".to_string()));
        let to_string = derived.lookup_instance_method("toString", "()Ljava/lang/String;");
        assert_eq!(to_string.map(|m| m.class_name()), Some(OBJECT.to_string()));
    }

    #[test]
    fn init_claim_is_reentrant_for_owner() {
        let class = ClassBuilder::new("a/Init").build(None, Vec::new());
        assert_eq!(class.begin_init(1), InitAction::Run);
        assert_eq!(class.begin_init(1), InitAction::Done);
        class.finish_init(false);
        assert_eq!(class.begin_init(2), InitAction::Failed);
    }
}
