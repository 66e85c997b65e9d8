//! Constant pool storage and the lazy resolver.
//!
//! Every entry resolves at most once. The first resolution loads classes,
//! looks members up and checks accessibility against the class owning the
//! pool; later reads return the cached result without repeating the check.
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::class::Class;
use crate::error::{ExceptionKind, NativeResult, Trap};
use crate::heap::{Member, Ref};
use crate::jvm::Jvm;
use crate::program::{Field, Method};
use crate::slot::Slot;

pub const REF_GET_FIELD: u8 = 1;
pub const REF_GET_STATIC: u8 = 2;
pub const REF_PUT_FIELD: u8 = 3;
pub const REF_PUT_STATIC: u8 = 4;
pub const REF_INVOKE_VIRTUAL: u8 = 5;
pub const REF_INVOKE_STATIC: u8 = 6;
pub const REF_INVOKE_SPECIAL: u8 = 7;
pub const REF_NEW_INVOKE_SPECIAL: u8 = 8;
pub const REF_INVOKE_INTERFACE: u8 = 9;

/// Raw constant pool entry as laid out in a class file.
#[derive(Debug, Clone, PartialEq)]
pub enum CPInfo {
    /// Index 0 and the upper half of long and double entries.
    Unusable,
    ConstantUtf8 {
        bytes: String,
    },
    ConstantInteger {
        bytes: i32,
    },
    ConstantFloat {
        bytes: f32,
    },
    ConstantLong {
        bytes: i64,
    },
    ConstantDouble {
        bytes: f64,
    },
    ConstantClass {
        name_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantMethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    ConstantMethodType {
        descriptor_index: u16,
    },
    ConstantInvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
}

/// Cached outcome of resolving one entry.
#[derive(Debug, Clone)]
pub enum Resolved {
    Class(Arc<Class>),
    Field(Arc<Field>),
    Method(Arc<Method>),
    InterfaceMethod(Arc<Method>),
    String(Ref),
    MethodHandle(Ref),
    MethodType(Ref),
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<CPInfo>,
    resolved: Vec<OnceCell<Resolved>>,
}

fn no_such(kind: ExceptionKind, class: &Class, name: &str, descriptor: &str) -> Trap {
    Trap::raise(kind, format!("{}.{}{}", class.name, name, descriptor))
}

fn illegal_access(visitor: &Class, target: impl std::fmt::Display) -> Trap {
    Trap::raise(
        ExceptionKind::IllegalAccess,
        format!("{} cannot access {}", visitor.name, target),
    )
}

impl ConstantPool {
    pub fn new(entries: Vec<CPInfo>) -> Self {
        let resolved = entries.iter().map(|_| OnceCell::new()).collect();
        Self { entries, resolved }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: u16) -> NativeResult<&CPInfo> {
        self.entries
            .get(index as usize)
            .ok_or_else(|| Trap::internal(format!("constant pool index {} out of range", index)))
    }

    pub fn is_resolved(&self, index: u16) -> bool {
        self.resolved
            .get(index as usize)
            .map_or(false, |cell| cell.get().is_some())
    }

    fn cell(&self, index: u16) -> NativeResult<&OnceCell<Resolved>> {
        self.resolved
            .get(index as usize)
            .ok_or_else(|| Trap::internal(format!("constant pool index {} out of range", index)))
    }

    fn malformed(&self, index: u16, expected: &str) -> Trap {
        Trap::internal(format!(
            "constant pool entry {} is {:?}, expected {}",
            index,
            self.entries.get(index as usize),
            expected
        ))
    }

    pub fn utf8(&self, index: u16) -> NativeResult<&str> {
        match self.entry(index)? {
            CPInfo::ConstantUtf8 { bytes } => Ok(bytes),
            _ => Err(self.malformed(index, "Utf8")),
        }
    }

    pub fn class_name(&self, index: u16) -> NativeResult<&str> {
        match self.entry(index)? {
            CPInfo::ConstantClass { name_index } => self.utf8(*name_index),
            _ => Err(self.malformed(index, "Class")),
        }
    }

    pub fn name_and_type(&self, index: u16) -> NativeResult<(&str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantNameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(self.malformed(index, "NameAndType")),
        }
    }

    /// `(class_index, name, descriptor)` of a field, method or interface
    /// method reference.
    pub fn member_ref(&self, index: u16) -> NativeResult<(u16, &str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantFieldRef {
                class_index,
                name_and_type_index,
            }
            | CPInfo::ConstantMethodRef {
                class_index,
                name_and_type_index,
            }
            | CPInfo::ConstantInterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((*class_index, name, descriptor))
            }
            _ => Err(self.malformed(index, "member reference")),
        }
    }

    /// `(bootstrap index, name, descriptor)` of an invokedynamic entry.
    pub fn invoke_dynamic(&self, index: u16) -> NativeResult<(u16, &str, &str)> {
        match self.entry(index)? {
            CPInfo::ConstantInvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((*bootstrap_method_attr_index, name, descriptor))
            }
            _ => Err(self.malformed(index, "InvokeDynamic")),
        }
    }

    pub fn resolve_class(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Arc<Class>> {
        let resolved = self.cell(index)?.get_or_try_init(|| {
            let class = jvm.load_class(self.class_name(index)?)?;
            if !class.is_accessible_to(visitor) {
                return Err(illegal_access(visitor, &class.name));
            }
            Ok(Resolved::Class(class))
        })?;
        match resolved {
            Resolved::Class(class) => Ok(class.clone()),
            _ => Err(self.malformed(index, "Class")),
        }
    }

    pub fn resolve_field(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Arc<Field>> {
        let resolved = self.cell(index)?.get_or_try_init(|| {
            let (class_index, name, descriptor) = self.member_ref(index)?;
            let class = self.resolve_class(jvm, visitor, class_index)?;
            let field = class
                .lookup_field(name, descriptor)
                .ok_or_else(|| no_such(ExceptionKind::NoSuchField, &class, name, descriptor))?;
            if !Class::member_accessible(visitor, &field.class(), field.access) {
                return Err(illegal_access(visitor, &field));
            }
            Ok(Resolved::Field(field))
        })?;
        match resolved {
            Resolved::Field(field) => Ok(field.clone()),
            _ => Err(self.malformed(index, "Fieldref")),
        }
    }

    /// A signature polymorphic method of `MethodHandle` or `VarHandle` is
    /// found by name alone; the call site keeps its own descriptor.
    pub fn resolve_method(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Arc<Method>> {
        let resolved = self.cell(index)?.get_or_try_init(|| {
            let (class_index, name, descriptor) = self.member_ref(index)?;
            let class = self.resolve_class(jvm, visitor, class_index)?;
            if class.is_interface() {
                return Err(Trap::raise(
                    ExceptionKind::IncompatibleClassChange,
                    format!("found interface {}, but class was expected", class.name),
                ));
            }
            let method = class
                .lookup_method(name, descriptor)
                .or_else(|| class.lookup_polymorphic_method(name))
                .ok_or_else(|| no_such(ExceptionKind::NoSuchMethod, &class, name, descriptor))?;
            if !Class::member_accessible(visitor, &method.class(), method.access) {
                return Err(illegal_access(visitor, &method));
            }
            Ok(Resolved::Method(method))
        })?;
        match resolved {
            Resolved::Method(method) => Ok(method.clone()),
            _ => Err(self.malformed(index, "Methodref")),
        }
    }

    pub fn resolve_interface_method(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Arc<Method>> {
        let resolved = self.cell(index)?.get_or_try_init(|| {
            let (class_index, name, descriptor) = self.member_ref(index)?;
            let class = self.resolve_class(jvm, visitor, class_index)?;
            if !class.is_interface() {
                return Err(Trap::raise(
                    ExceptionKind::IncompatibleClassChange,
                    format!("found class {}, but interface was expected", class.name),
                ));
            }
            let method = class
                .lookup_interface_method(name, descriptor)
                .ok_or_else(|| no_such(ExceptionKind::NoSuchMethod, &class, name, descriptor))?;
            if !Class::member_accessible(visitor, &method.class(), method.access) {
                return Err(illegal_access(visitor, &method));
            }
            Ok(Resolved::InterfaceMethod(method))
        })?;
        match resolved {
            Resolved::InterfaceMethod(method) => Ok(method.clone()),
            _ => Err(self.malformed(index, "InterfaceMethodref")),
        }
    }

    /// `invokestatic` and `invokespecial` may name either kind of method
    /// reference.
    pub fn resolve_method_or_interface_method(
        &self,
        jvm: &Jvm,
        visitor: &Class,
        index: u16,
    ) -> NativeResult<Arc<Method>> {
        match self.entry(index)? {
            CPInfo::ConstantInterfaceMethodRef { .. } => self.resolve_interface_method(jvm, visitor, index),
            _ => self.resolve_method(jvm, visitor, index),
        }
    }

    /// Method selected by `invokespecial` from `visitor`. A non-private,
    /// non-constructor method of an `ACC_SUPER` superclass is looked up
    /// again starting at the visitor's direct superclass.
    pub fn resolve_special_method(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Arc<Method>> {
        let method = self.resolve_method_or_interface_method(jvm, visitor, index)?;
        let declaring = method.class();
        if declaring.is_super()
            && !method.is_private()
            && !method.is_constructor()
            && !declaring.is_interface()
            && !visitor.same_class(&declaring)
            && visitor.is_subclass_of(&declaring)
        {
            if let Some(super_class) = &visitor.super_class {
                return super_class
                    .lookup_method(&method.name, &method.descriptor)
                    .ok_or_else(|| {
                        no_such(ExceptionKind::NoSuchMethod, super_class, &method.name, &method.descriptor)
                    });
            }
        }
        Ok(method)
    }

    pub fn resolve_string(&self, jvm: &Jvm, index: u16) -> NativeResult<Ref> {
        let resolved = self.cell(index)?.get_or_try_init(|| match self.entry(index)? {
            CPInfo::ConstantString { string_index } => {
                Ok(Resolved::String(jvm.intern(self.utf8(*string_index)?)?))
            }
            _ => Err(self.malformed(index, "String")),
        })?;
        match resolved {
            Resolved::String(r) => Ok(*r),
            _ => Err(self.malformed(index, "String")),
        }
    }

    pub fn resolve_method_type(&self, jvm: &Jvm, index: u16) -> NativeResult<Ref> {
        let resolved = self.cell(index)?.get_or_try_init(|| match self.entry(index)? {
            CPInfo::ConstantMethodType { descriptor_index } => {
                Ok(Resolved::MethodType(jvm.method_type(self.utf8(*descriptor_index)?)?))
            }
            _ => Err(self.malformed(index, "MethodType")),
        })?;
        match resolved {
            Resolved::MethodType(r) => Ok(*r),
            _ => Err(self.malformed(index, "MethodType")),
        }
    }

    pub fn resolve_method_handle(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Ref> {
        let resolved = self.cell(index)?.get_or_try_init(|| {
            let (kind, reference_index) = match self.entry(index)? {
                CPInfo::ConstantMethodHandle {
                    reference_kind,
                    reference_index,
                } => (*reference_kind, *reference_index),
                _ => return Err(self.malformed(index, "MethodHandle")),
            };
            let member = match kind {
                REF_GET_FIELD..=REF_PUT_STATIC => {
                    Member::Field(self.resolve_field(jvm, visitor, reference_index)?)
                }
                REF_INVOKE_VIRTUAL | REF_NEW_INVOKE_SPECIAL => {
                    Member::Method(self.resolve_method(jvm, visitor, reference_index)?)
                }
                REF_INVOKE_STATIC | REF_INVOKE_SPECIAL => Member::Method(
                    self.resolve_method_or_interface_method(jvm, visitor, reference_index)?,
                ),
                REF_INVOKE_INTERFACE => {
                    Member::Method(self.resolve_interface_method(jvm, visitor, reference_index)?)
                }
                other => return Err(Trap::internal(format!("bad method handle kind {}", other))),
            };
            Ok(Resolved::MethodHandle(jvm.method_handle(kind, member)?))
        })?;
        match resolved {
            Resolved::MethodHandle(r) => Ok(*r),
            _ => Err(self.malformed(index, "MethodHandle")),
        }
    }

    /// Category one value pushed by `ldc` / `ldc_w`.
    pub fn loadable(&self, jvm: &Jvm, visitor: &Class, index: u16) -> NativeResult<Slot> {
        Ok(match self.entry(index)? {
            CPInfo::ConstantInteger { bytes } => Slot::from_int(*bytes),
            CPInfo::ConstantFloat { bytes } => Slot::from_float(*bytes),
            CPInfo::ConstantString { .. } => Slot::from_ref(self.resolve_string(jvm, index)?),
            CPInfo::ConstantClass { .. } => {
                let class = self.resolve_class(jvm, visitor, index)?;
                Slot::from_ref(jvm.mirror(&class)?)
            }
            CPInfo::ConstantMethodType { .. } => Slot::from_ref(self.resolve_method_type(jvm, index)?),
            CPInfo::ConstantMethodHandle { .. } => {
                Slot::from_ref(self.resolve_method_handle(jvm, visitor, index)?)
            }
            _ => return Err(self.malformed(index, "loadable constant")),
        })
    }

    /// Category two value pushed by `ldc2_w`, high slot first.
    pub fn loadable_wide(&self, index: u16) -> NativeResult<[Slot; 2]> {
        match self.entry(index)? {
            CPInfo::ConstantLong { bytes } => Ok(Slot::pair_from_long(*bytes)),
            CPInfo::ConstantDouble { bytes } => Ok(Slot::pair_from_double(*bytes)),
            _ => Err(self.malformed(index, "Long or Double")),
        }
    }

    /// Static arguments of a bootstrap method flattened into slots; longs
    /// and doubles take two.
    pub fn resolve_bootstrap_args(&self, jvm: &Jvm, visitor: &Class, arguments: &[u16]) -> NativeResult<Vec<Slot>> {
        let mut slots = Vec::with_capacity(arguments.len());
        for &index in arguments {
            match self.entry(index)? {
                CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. } => {
                    slots.extend(self.loadable_wide(index)?)
                }
                _ => slots.push(self.loadable(jvm, visitor, index)?),
            }
        }
        Ok(slots)
    }
}

/// Appends entries and hands out their indices. UTF-8 entries are shared.
#[derive(Debug, Clone)]
pub struct ConstantPoolBuilder {
    entries: Vec<CPInfo>,
    utf8: HashMap<String, u16>,
}

impl Default for ConstantPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPoolBuilder {
    pub fn new() -> Self {
        Self {
            entries: vec![CPInfo::Unusable],
            utf8: HashMap::new(),
        }
    }

    pub fn push(&mut self, entry: CPInfo) -> u16 {
        let index = self.entries.len() as u16;
        let wide = matches!(entry, CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. });
        self.entries.push(entry);
        if wide {
            self.entries.push(CPInfo::Unusable);
        }
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        if let Some(&index) = self.utf8.get(value) {
            return index;
        }
        let index = self.push(CPInfo::ConstantUtf8 {
            bytes: value.to_string(),
        });
        self.utf8.insert(value.to_string(), index);
        index
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.push(CPInfo::ConstantInteger { bytes: value })
    }

    pub fn float(&mut self, value: f32) -> u16 {
        self.push(CPInfo::ConstantFloat { bytes: value })
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.push(CPInfo::ConstantLong { bytes: value })
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.push(CPInfo::ConstantDouble { bytes: value })
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.push(CPInfo::ConstantClass { name_index })
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        self.push(CPInfo::ConstantString { string_index })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.push(CPInfo::ConstantNameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantFieldRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantInterfaceMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_handle(&mut self, reference_kind: u8, reference_index: u16) -> u16 {
        self.push(CPInfo::ConstantMethodHandle {
            reference_kind,
            reference_index,
        })
    }

    pub fn method_type(&mut self, descriptor: &str) -> u16 {
        let descriptor_index = self.utf8(descriptor);
        self.push(CPInfo::ConstantMethodType { descriptor_index })
    }

    pub fn invoke_dynamic(&mut self, bootstrap_method_attr_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.push(CPInfo::ConstantInvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        })
    }

    pub fn build(self) -> ConstantPool {
        ConstantPool::new(self.entries)
    }
}
