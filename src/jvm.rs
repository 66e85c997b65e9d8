//! Shared virtual machine state: the class registry, heap, string pool and
//! native table, plus the built-in classes every program links against.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::bytecode::OPCode;
use crate::class::{Class, ClassBuilder, OBJECT};
use crate::config::Config;
use crate::error::{ExceptionKind, NativeResult, Result, RuntimeError, Trap};
use crate::heap::{Heap, Member, Payload, Ref};
use crate::invoke;
use crate::native::Natives;
use crate::program::{AccessFlags, FieldBuilder, MethodBuilder};
use crate::runtime::Thread;
use crate::slot::Slot;

pub const CLASS: &str = "java/lang/Class";
pub const STRING: &str = "java/lang/String";
pub const THROWABLE: &str = "java/lang/Throwable";
pub const CLONEABLE: &str = "java/lang/Cloneable";
pub const SERIALIZABLE: &str = "java/io/Serializable";
pub const METHOD_TYPE: &str = "java/lang/invoke/MethodType";
pub const METHOD_HANDLE: &str = "java/lang/invoke/MethodHandle";
pub const LOOKUP: &str = "java/lang/invoke/MethodHandles$Lookup";
pub const CALL_SITE: &str = "java/lang/invoke/CallSite";
pub const CONSTANT_CALL_SITE: &str = "java/lang/invoke/ConstantCallSite";

const DETAIL_MESSAGE: (&str, &str) = ("detailMessage", "Ljava/lang/String;");
const POLYMORPHIC: &str = "([Ljava/lang/Object;)Ljava/lang/Object;";

const PRIMITIVES: [(&str, char); 9] = [
    ("boolean", 'Z'),
    ("byte", 'B'),
    ("char", 'C'),
    ("short", 'S'),
    ("int", 'I'),
    ("long", 'J'),
    ("float", 'F'),
    ("double", 'D'),
    ("void", 'V'),
];

/// Throwables above the engine's own exception kinds, parents first.
const THROWABLES: [(&str, &str); 7] = [
    ("java/lang/Exception", THROWABLE),
    ("java/lang/Error", THROWABLE),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
];

fn primitive_name(descriptor: char) -> Option<&'static str> {
    PRIMITIVES
        .iter()
        .find(|(_, c)| *c == descriptor)
        .map(|(name, _)| *name)
}

/// `op` followed by a big-endian constant pool index.
fn indexed(op: OPCode, index: u16) -> [u8; 3] {
    let [high, low] = index.to_be_bytes();
    [op.code(), high, low]
}

fn bytecode(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

/// `JVM` is the state shared by every `Thread`.
pub struct Jvm {
    pub config: Config,
    pub heap: Heap,
    pub natives: Natives,
    classes: RwLock<HashMap<String, Arc<Class>>>,
    strings: Mutex<HashMap<String, Ref>>,
    method_types: Mutex<HashMap<String, Ref>>,
    next_thread_id: AtomicU64,
}

impl Jvm {
    /// Creates a VM with the built-in classes defined and the built-in
    /// natives registered.
    pub fn new(config: Config) -> Result<Arc<Jvm>> {
        let jvm = Jvm {
            config,
            heap: Heap::new(),
            natives: Natives::new(),
            classes: RwLock::new(HashMap::new()),
            strings: Mutex::new(HashMap::new()),
            method_types: Mutex::new(HashMap::new()),
            next_thread_id: AtomicU64::new(1),
        };
        jvm.define_lang_classes()?;
        jvm.define_throwables()?;
        jvm.define_invoke_classes()?;
        jvm.register_builtin_natives()?;
        debug!(classes = jvm.classes.read().len(), "bootstrap complete");
        Ok(Arc::new(jvm))
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Links `builder` against its superclass and interfaces, which must
    /// already be defined, and registers the result.
    pub fn define_class(&self, builder: ClassBuilder) -> Result<Arc<Class>> {
        let super_class = builder.super_name().map(|name| self.load_class(name)).transpose()?;
        let interfaces = builder
            .interface_names()
            .iter()
            .map(|name| self.load_class(name))
            .collect::<Result<Vec<_>>>()?;
        let name = builder.name().to_string();
        if self.classes.read().contains_key(&name) {
            return Err(RuntimeError::Internal(format!("class {} is already defined", name)));
        }
        let class = builder.build(super_class, interfaces);
        self.classes.write().insert(name, class.clone());
        debug!(class = %class.name, "define class");
        Ok(class)
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.read().get(name).cloned()
    }

    /// Class named `name`. Array classes are created on first request.
    pub fn load_class(&self, name: &str) -> Result<Arc<Class>> {
        if let Some(class) = self.find_class(name) {
            return Ok(class);
        }
        match name.strip_prefix('[') {
            Some(component) => {
                let component = self.class_for_descriptor(component)?;
                self.array_class_of(&component)
            }
            None => Err(RuntimeError::ClassNotFound(name.to_string())),
        }
    }

    /// Class named by a field descriptor.
    pub fn class_for_descriptor(&self, descriptor: &str) -> Result<Arc<Class>> {
        let mut chars = descriptor.chars();
        match chars.next() {
            Some('L') => self.load_class(descriptor[1..].trim_end_matches(';')),
            Some('[') => self.load_class(descriptor),
            Some(c) => match primitive_name(c) {
                Some(name) => self.load_class(name),
                None => Err(RuntimeError::ClassNotFound(descriptor.to_string())),
            },
            None => Err(RuntimeError::ClassNotFound(descriptor.to_string())),
        }
    }

    pub fn array_class_of(&self, component: &Arc<Class>) -> Result<Arc<Class>> {
        let name = format!("[{}", component.descriptor());
        if let Some(class) = self.find_class(&name) {
            return Ok(class);
        }
        let object = self.load_class(OBJECT)?;
        let interfaces = vec![self.load_class(CLONEABLE)?, self.load_class(SERIALIZABLE)?];
        let mut classes = self.classes.write();
        let class = classes
            .entry(name)
            .or_insert_with(|| Class::array(component.clone(), object, interfaces));
        Ok(class.clone())
    }

    /// Array class for a `newarray` type code.
    pub fn primitive_array_class(&self, atype: u8) -> NativeResult<Arc<Class>> {
        let descriptor = match atype {
            4 => "[Z",
            5 => "[C",
            6 => "[F",
            7 => "[D",
            8 => "[B",
            9 => "[S",
            10 => "[I",
            11 => "[J",
            other => return Err(Trap::internal(format!("bad newarray type {}", other))),
        };
        Ok(self.load_class(descriptor)?)
    }

    /// Interned string with the given contents.
    pub fn intern(&self, value: &str) -> NativeResult<Ref> {
        if let Some(&r) = self.strings.lock().get(value) {
            return Ok(r);
        }
        let string = self.new_string(value)?;
        Ok(*self.strings.lock().entry(value.to_string()).or_insert(string))
    }

    pub fn new_string(&self, value: &str) -> NativeResult<Ref> {
        Ok(self
            .heap
            .alloc(self.load_class(STRING)?, Payload::Str(value.to_string())))
    }

    pub fn string_value(&self, r: Ref) -> Option<String> {
        self.heap.string_value(r)
    }

    /// The unique `java/lang/Class` object of `class`.
    pub fn mirror(&self, class: &Arc<Class>) -> NativeResult<Ref> {
        class
            .mirror_cell()
            .get_or_try_init(|| {
                Ok::<_, Trap>(self.heap.alloc(self.load_class(CLASS)?, Payload::Mirror(class.clone())))
            })
            .copied()
    }

    /// `MethodType` object of a method descriptor, one per descriptor.
    pub fn method_type(&self, descriptor: &str) -> NativeResult<Ref> {
        if let Some(&r) = self.method_types.lock().get(descriptor) {
            return Ok(r);
        }
        let object = self.heap.alloc(
            self.load_class(METHOD_TYPE)?,
            Payload::MethodType(descriptor.to_string()),
        );
        Ok(*self
            .method_types
            .lock()
            .entry(descriptor.to_string())
            .or_insert(object))
    }

    pub fn method_handle(&self, kind: u8, member: Member) -> NativeResult<Ref> {
        Ok(self.heap.alloc(
            self.load_class(METHOD_HANDLE)?,
            Payload::MethodHandle { kind, member },
        ))
    }

    /// `MethodHandles.Lookup` object standing for `caller`.
    pub fn lookup_object(&self, caller: &Arc<Class>) -> NativeResult<Ref> {
        Ok(self
            .heap
            .alloc(self.load_class(LOOKUP)?, Payload::Lookup(caller.clone())))
    }

    /// Throwable of `kind` with its detail message set. No constructor runs.
    pub fn new_throwable(&self, kind: ExceptionKind, message: &str) -> NativeResult<Ref> {
        let class = self.load_class(kind.class_name())?;
        let exception = self.heap.alloc(class.clone(), Payload::None);
        if !message.is_empty() {
            if let Some(field) = class.lookup_field(DETAIL_MESSAGE.0, DETAIL_MESSAGE.1) {
                let message = self.new_string(message)?;
                self.heap.set_field(exception, field.slot_id, &[Slot::from_ref(message)])?;
            }
        }
        Ok(exception)
    }

    /// Detail message of a throwable, if it has one.
    pub fn exception_message(&self, exception: Ref) -> Option<String> {
        let class = self.heap.class_of(exception)?;
        let field = class.lookup_field(DETAIL_MESSAGE.0, DETAIL_MESSAGE.1)?;
        let slots = self.heap.get_field(exception, field.slot_id, 1).ok()?;
        self.string_value(slots[0].as_ref())
    }

    fn define_lang_classes(&self) -> Result<()> {
        for (name, descriptor) in PRIMITIVES {
            self.classes
                .write()
                .insert(name.to_string(), Class::primitive(name, descriptor));
        }

        let equals = bytecode(&[
            &[OPCode::ALoad0.code(), OPCode::ALoad1.code()],
            &indexed(OPCode::IfACmpNe, 5),
            &[OPCode::Iconst1.code(), OPCode::IReturn.code()],
            &[OPCode::Iconst0.code(), OPCode::IReturn.code()],
        ]);
        self.define_class(
            ClassBuilder::new(OBJECT)
                .no_super()
                .method(MethodBuilder::new("<init>", "()V").code(0, 1, vec![OPCode::Return.code()]))
                .method(MethodBuilder::new("equals", "(Ljava/lang/Object;)Z").code(2, 2, equals))
                .method(MethodBuilder::new("hashCode", "()I").access(AccessFlags::PUBLIC | AccessFlags::NATIVE))
                .method(
                    MethodBuilder::new("getClass", "()Ljava/lang/Class;")
                        .access(AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::NATIVE),
                ),
        )?;

        let interface = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        self.define_class(ClassBuilder::new(CLONEABLE).access(interface))?;
        self.define_class(ClassBuilder::new(SERIALIZABLE).access(interface))?;

        let final_class = AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::SUPER;
        self.define_class(ClassBuilder::new(CLASS).access(final_class).interface(SERIALIZABLE))?;
        self.define_class(ClassBuilder::new(STRING).access(final_class).interface(SERIALIZABLE))?;

        let static_native = AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::NATIVE;
        self.define_class(
            ClassBuilder::new("java/lang/Float")
                .access(final_class)
                .method(MethodBuilder::new("floatToRawIntBits", "(F)I").access(static_native))
                .method(MethodBuilder::new("intBitsToFloat", "(I)F").access(static_native)),
        )?;
        self.define_class(
            ClassBuilder::new("java/lang/Double")
                .access(final_class)
                .method(MethodBuilder::new("doubleToRawLongBits", "(D)J").access(static_native))
                .method(MethodBuilder::new("longBitsToDouble", "(J)D").access(static_native)),
        )?;
        Ok(())
    }

    fn define_throwables(&self) -> Result<()> {
        let mut throwable = ClassBuilder::new(THROWABLE).interface(SERIALIZABLE);
        let object_init = throwable.pool().method_ref(OBJECT, "<init>", "()V");
        let message = throwable
            .pool()
            .field_ref(THROWABLE, DETAIL_MESSAGE.0, DETAIL_MESSAGE.1);
        let init = bytecode(&[
            &[OPCode::ALoad0.code()],
            &indexed(OPCode::InvokeSpecial, object_init),
            &[OPCode::Return.code()],
        ]);
        let init_message = bytecode(&[
            &[OPCode::ALoad0.code()],
            &indexed(OPCode::InvokeSpecial, object_init),
            &[OPCode::ALoad0.code(), OPCode::ALoad1.code()],
            &indexed(OPCode::PutField, message),
            &[OPCode::Return.code()],
        ]);
        let get_message = bytecode(&[
            &[OPCode::ALoad0.code()],
            &indexed(OPCode::GetField, message),
            &[OPCode::AReturn.code()],
        ]);
        self.define_class(
            throwable
                .field(FieldBuilder::new(DETAIL_MESSAGE.0, DETAIL_MESSAGE.1, AccessFlags::PRIVATE))
                .method(MethodBuilder::new("<init>", "()V").code(1, 1, init))
                .method(MethodBuilder::new("<init>", "(Ljava/lang/String;)V").code(2, 2, init_message))
                .method(MethodBuilder::new("getMessage", "()Ljava/lang/String;").code(1, 1, get_message)),
        )?;
        for (name, super_name) in THROWABLES {
            self.define_class(ClassBuilder::new(name).super_class(super_name))?;
        }
        for kind in ExceptionKind::ALL {
            self.define_class(ClassBuilder::new(kind.class_name()).super_class(kind.super_class_name()))?;
        }
        Ok(())
    }

    fn define_invoke_classes(&self) -> Result<()> {
        let final_class = AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::SUPER;
        let abstract_class = AccessFlags::PUBLIC | AccessFlags::ABSTRACT | AccessFlags::SUPER;
        self.define_class(ClassBuilder::new(METHOD_TYPE).access(final_class))?;
        self.define_class(ClassBuilder::new(LOOKUP).access(final_class))?;

        let entry = AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::NATIVE | AccessFlags::VARARGS;
        let link_to = AccessFlags::STATIC | AccessFlags::NATIVE | AccessFlags::VARARGS;
        let mut handle = ClassBuilder::new(METHOD_HANDLE).access(abstract_class);
        for name in ["invokeExact", "invoke"] {
            handle = handle.method(MethodBuilder::new(name, POLYMORPHIC).access(entry));
        }
        for name in invoke::LINK_TO {
            handle = handle.method(MethodBuilder::new(name, POLYMORPHIC).access(link_to));
        }
        self.define_class(handle)?;

        let target = ("target", "Ljava/lang/invoke/MethodHandle;");
        let mut call_site = ClassBuilder::new(CALL_SITE).access(abstract_class);
        let object_init = call_site.pool().method_ref(OBJECT, "<init>", "()V");
        let target_ref = call_site.pool().field_ref(CALL_SITE, target.0, target.1);
        let init = bytecode(&[
            &[OPCode::ALoad0.code()],
            &indexed(OPCode::InvokeSpecial, object_init),
            &[OPCode::ALoad0.code(), OPCode::ALoad1.code()],
            &indexed(OPCode::PutField, target_ref),
            &[OPCode::Return.code()],
        ]);
        let get_target = bytecode(&[
            &[OPCode::ALoad0.code()],
            &indexed(OPCode::GetField, target_ref),
            &[OPCode::AReturn.code()],
        ]);
        self.define_class(
            call_site
                .field(FieldBuilder::new(target.0, target.1, AccessFlags::empty()))
                .method(MethodBuilder::new("<init>", "(Ljava/lang/invoke/MethodHandle;)V").code(2, 2, init))
                .method(MethodBuilder::new("getTarget", "()Ljava/lang/invoke/MethodHandle;").code(1, 1, get_target.clone()))
                .method(MethodBuilder::new("dynamicInvoker", "()Ljava/lang/invoke/MethodHandle;").code(1, 1, get_target)),
        )?;

        let mut constant = ClassBuilder::new(CONSTANT_CALL_SITE).super_class(CALL_SITE);
        let super_init = constant
            .pool()
            .method_ref(CALL_SITE, "<init>", "(Ljava/lang/invoke/MethodHandle;)V");
        let init = bytecode(&[
            &[OPCode::ALoad0.code(), OPCode::ALoad1.code()],
            &indexed(OPCode::InvokeSpecial, super_init),
            &[OPCode::Return.code()],
        ]);
        self.define_class(
            constant.method(MethodBuilder::new("<init>", "(Ljava/lang/invoke/MethodHandle;)V").code(2, 2, init)),
        )?;
        Ok(())
    }

    fn register_builtin_natives(&self) -> Result<()> {
        let natives = &self.natives;
        natives.register("java/lang/Float", "floatToRawIntBits", "(F)I", |_: &mut Thread, value: f32| -> NativeResult<i32> {
            Ok(value.to_bits() as i32)
        })?;
        natives.register("java/lang/Float", "intBitsToFloat", "(I)F", |_: &mut Thread, bits: i32| -> NativeResult<f32> {
            Ok(f32::from_bits(bits as u32))
        })?;
        natives.register("java/lang/Double", "doubleToRawLongBits", "(D)J", |_: &mut Thread, value: f64| -> NativeResult<i64> {
            Ok(value.to_bits() as i64)
        })?;
        natives.register("java/lang/Double", "longBitsToDouble", "(J)D", |_: &mut Thread, bits: i64| -> NativeResult<f64> {
            Ok(f64::from_bits(bits as u64))
        })?;
        natives.register(OBJECT, "hashCode", "()I", |_: &mut Thread, this: Ref| -> NativeResult<i32> {
            Ok(this.handle() as i32)
        })?;
        natives.register(OBJECT, "getClass", "()Ljava/lang/Class;", |thread: &mut Thread, this: Ref| -> NativeResult<Ref> {
            let class = thread.jvm.heap.class_of(this).ok_or_else(Trap::null_pointer)?;
            thread.jvm.mirror(&class)
        })?;
        for name in ["invokeExact", "invoke"] {
            natives.register_polymorphic(METHOD_HANDLE, name, POLYMORPHIC, invoke::invoke_handle);
        }
        for name in invoke::LINK_TO {
            natives.register_link_to(METHOD_HANDLE, name, POLYMORPHIC, invoke::link_to);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Jvm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Jvm")
            .field("config", &self.config)
            .field("classes", &self.classes.read().len())
            .field("objects", &self.heap.len())
            .finish()
    }
}
