//! Method and field metadata consumed by the execution engine, together
//! with descriptor decoding.
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Weak};

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::bytecode::OPCode;
use crate::class::Class;
use crate::native::NativeBinding;

/// Access and property flags shared by classes, fields and methods.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct AccessFlags(u16);

impl AccessFlags {
    pub const PUBLIC: AccessFlags = AccessFlags(0x0001);
    pub const PRIVATE: AccessFlags = AccessFlags(0x0002);
    pub const PROTECTED: AccessFlags = AccessFlags(0x0004);
    pub const STATIC: AccessFlags = AccessFlags(0x0008);
    pub const FINAL: AccessFlags = AccessFlags(0x0010);
    /// `ACC_SUPER` on classes, `ACC_SYNCHRONIZED` on methods.
    pub const SUPER: AccessFlags = AccessFlags(0x0020);
    pub const SYNCHRONIZED: AccessFlags = AccessFlags(0x0020);
    pub const VARARGS: AccessFlags = AccessFlags(0x0080);
    pub const NATIVE: AccessFlags = AccessFlags(0x0100);
    pub const INTERFACE: AccessFlags = AccessFlags(0x0200);
    pub const ABSTRACT: AccessFlags = AccessFlags(0x0400);

    pub const fn empty() -> Self {
        AccessFlags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        AccessFlags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Primitive types supported by the JVM.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BaseTypeKind {
    Byte,
    Char,
    Short,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Void,
    Reference,
    List,
}

/// JVM value type as decoded from a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub t: BaseTypeKind,
    pub sub_t: Option<Box<Type>>,
}

impl Type {
    /// Returns the size in slots of a given type.
    pub fn size(&self) -> usize {
        match self.t {
            BaseTypeKind::Long | BaseTypeKind::Double => 2,
            BaseTypeKind::Void => 0,
            _ => 1,
        }
    }

    /// Typed return instruction for a method returning this type.
    pub fn return_opcode(&self) -> OPCode {
        match self.t {
            BaseTypeKind::Void => OPCode::Return,
            BaseTypeKind::Long => OPCode::LReturn,
            BaseTypeKind::Double => OPCode::DReturn,
            BaseTypeKind::Float => OPCode::FReturn,
            BaseTypeKind::Reference | BaseTypeKind::List => OPCode::AReturn,
            _ => OPCode::IReturn,
        }
    }

    /// Returns the Java equivalent type from a type's string representation.
    pub fn decode(type_str: &str) -> Type {
        let base = |t| Type { t, sub_t: None };
        match type_str.as_bytes().first() {
            Some(b'B') => base(BaseTypeKind::Byte),
            Some(b'C') => base(BaseTypeKind::Char),
            Some(b'S') => base(BaseTypeKind::Short),
            Some(b'Z') => base(BaseTypeKind::Boolean),
            Some(b'I') => base(BaseTypeKind::Int),
            Some(b'J') => base(BaseTypeKind::Long),
            Some(b'F') => base(BaseTypeKind::Float),
            Some(b'D') => base(BaseTypeKind::Double),
            Some(b'V') => base(BaseTypeKind::Void),
            Some(b'[') => Type {
                t: BaseTypeKind::List,
                sub_t: Some(Box::new(Self::decode(&type_str[1..]))),
            },
            _ => base(BaseTypeKind::Reference),
        }
    }
}

static METHOD_DESCRIPTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(([^\)]*)\)(.+)$").expect("valid regex"));
static FIELD_DESCRIPTOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[*(?:[BCDFIJSZ]|L[^;]+;)").expect("valid regex"));

/// Parse a method descriptor, returns a tuple of argument types and
/// return type. Malformed descriptors decode as far as they match.
pub fn parse_method_types(descriptor: &str) -> (Vec<Type>, Type) {
    let Some(caps) = METHOD_DESCRIPTOR.captures(descriptor) else {
        return (Vec::new(), Type::decode("V"));
    };
    let arg_string = caps.get(1).map_or("", |m| m.as_str());
    let return_type_string = caps.get(2).map_or("V", |m| m.as_str());
    let types = FIELD_DESCRIPTOR
        .find_iter(arg_string)
        .map(|m| Type::decode(m.as_str()))
        .collect();
    (types, Type::decode(return_type_string))
}

/// Number of slots the arguments of `descriptor` occupy, plus one for the
/// receiver of an instance method.
pub fn arg_slot_count(descriptor: &str, is_static: bool) -> usize {
    let (args, _) = parse_method_types(descriptor);
    args.iter().map(Type::size).sum::<usize>() + usize::from(!is_static)
}

/// One entry of a method's exception table. `end_pc` is exclusive and a
/// `catch_type` of 0 catches everything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

impl ExceptionHandler {
    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize..self.end_pc as usize).contains(&pc)
    }
}

/// Linkage recipe of a dynamic call site: a method handle constant plus
/// the constant pool indices of its static arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMethod {
    pub method_ref: u16,
    pub arguments: Vec<u16>,
}

/// Java class method representation for the interpreter.
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Arc<[u8]>,
    pub exception_table: Vec<ExceptionHandler>,
    pub arg_types: Vec<Type>,
    pub return_type: Type,
    /// Slots taken by the arguments, including the receiver.
    pub arg_slot_count: usize,
    class: Weak<Class>,
    pub(crate) native: OnceCell<Arc<NativeBinding>>,
}

impl Method {
    /// Declaring class. Methods only exist inside a defined class, which the
    /// class registry keeps alive.
    pub fn class(&self) -> Arc<Class> {
        self.class
            .upgrade()
            .unwrap_or_else(|| panic!("class of {} was dropped", self.name))
    }

    pub fn class_name(&self) -> String {
        self.class
            .upgrade()
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_private(&self) -> bool {
        self.access.contains(AccessFlags::PRIVATE)
    }

    pub fn is_public(&self) -> bool {
        self.access.contains(AccessFlags::PUBLIC)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(AccessFlags::NATIVE)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Signature polymorphic methods are the native varargs entry points of
    /// `MethodHandle` and `VarHandle`; their call sites carry their own
    /// descriptor.
    pub fn is_signature_polymorphic(&self) -> bool {
        let class_name = self.class_name();
        (class_name == "java/lang/invoke/MethodHandle"
            || class_name == "java/lang/invoke/VarHandle")
            && self.is_native()
            && self.access.contains(AccessFlags::VARARGS)
            && self.arg_types.len() == 1
            && self.descriptor.starts_with("([Ljava/lang/Object;)")
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Method")
            .field("class", &self.class_name())
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("access", &self.access)
            .finish()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name(), self.name, self.descriptor)
    }
}

/// Builds a `Method` before its class exists.
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    name: String,
    descriptor: String,
    access: AccessFlags,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    exception_table: Vec<ExceptionHandler>,
}

impl MethodBuilder {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: AccessFlags::PUBLIC,
            max_stack: 0,
            max_locals: 0,
            code: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    pub fn code(mut self, max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        self.max_stack = max_stack;
        self.max_locals = max_locals;
        self.code = code;
        self
    }

    pub fn handler(mut self, start_pc: u16, end_pc: u16, handler_pc: u16, catch_type: u16) -> Self {
        self.exception_table.push(ExceptionHandler {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(self, class: Weak<Class>) -> Method {
        let (arg_types, return_type) = parse_method_types(&self.descriptor);
        let is_static = self.access.contains(AccessFlags::STATIC);
        let arg_slot_count =
            arg_types.iter().map(Type::size).sum::<usize>() + usize::from(!is_static);
        let (max_stack, max_locals, code) = if self.access.contains(AccessFlags::NATIVE) {
            // Native bodies are synthesised: hand off to the bridge, then
            // return whatever it pushed.
            (
                2,
                arg_slot_count as u16,
                vec![OPCode::InvokeNative.code(), return_type.return_opcode().code()],
            )
        } else {
            (self.max_stack, self.max_locals.max(arg_slot_count as u16), self.code)
        };
        Method {
            name: self.name,
            descriptor: self.descriptor,
            access: self.access,
            max_stack,
            max_locals,
            code: Arc::from(code),
            exception_table: self.exception_table,
            arg_types,
            return_type,
            arg_slot_count,
            class,
            native: OnceCell::new(),
        }
    }
}

/// Field metadata. `slot_id` indexes either the declaring class's static
/// storage or every instance's field storage.
pub struct Field {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    pub slot_id: usize,
    pub category_two: bool,
    /// Constant pool index of a `ConstantValue` attribute, if any.
    pub constant_value: Option<u16>,
    class: Weak<Class>,
}

impl Field {
    pub fn class(&self) -> Arc<Class> {
        self.class
            .upgrade()
            .unwrap_or_else(|| panic!("class of field {} was dropped", self.name))
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.access.contains(AccessFlags::FINAL)
    }

    pub fn slot_count(&self) -> usize {
        if self.category_two {
            2
        } else {
            1
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("slot_id", &self.slot_id)
            .finish()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let class = self.class.upgrade().map(|c| c.name.clone()).unwrap_or_default();
        write!(f, "{}.{}:{}", class, self.name, self.descriptor)
    }
}

#[derive(Debug, Clone)]
pub struct FieldBuilder {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: AccessFlags,
    pub(crate) constant_value: Option<u16>,
}

impl FieldBuilder {
    pub fn new(name: &str, descriptor: &str, access: AccessFlags) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            constant_value: None,
        }
    }

    pub fn constant_value(mut self, index: u16) -> Self {
        self.constant_value = Some(index);
        self
    }

    pub(crate) fn build(self, slot_id: usize, class: Weak<Class>) -> Field {
        let category_two = matches!(self.descriptor.as_str(), "J" | "D");
        Field {
            name: self.name,
            descriptor: self.descriptor,
            access: self.access,
            slot_id,
            category_two,
            constant_value: self.constant_value,
            class,
        }
    }
}
