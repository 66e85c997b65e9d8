//! Per-thread execution context and the host entry points into the engine.
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::class::{Class, InitAction};
use crate::constant_pool::CPInfo;
use crate::error::{ExceptionKind, NativeResult, Result, RuntimeError, Trap};
use crate::frame::CallStack;
use crate::heap::Ref;
use crate::interpreter;
use crate::jvm::Jvm;
use crate::program::{BaseTypeKind, Method, Type};
use crate::slot::Slot;

/// JVM value types.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Ref),
}

impl Value {
    /// Returns the type of the value.
    pub fn t(&self) -> BaseTypeKind {
        match self {
            Self::Void => BaseTypeKind::Void,
            Self::Int(_) => BaseTypeKind::Int,
            Self::Long(_) => BaseTypeKind::Long,
            Self::Float(_) => BaseTypeKind::Float,
            Self::Double(_) => BaseTypeKind::Double,
            Self::Ref(_) => BaseTypeKind::Reference,
        }
    }

    /// Appends the value's slots, high word first for category two.
    pub fn write_slots(&self, out: &mut Vec<Slot>) {
        match *self {
            Value::Void => {}
            Value::Int(v) => out.push(Slot::from_int(v)),
            Value::Float(v) => out.push(Slot::from_float(v)),
            Value::Ref(v) => out.push(Slot::from_ref(v)),
            Value::Long(v) => out.extend(Slot::pair_from_long(v)),
            Value::Double(v) => out.extend(Slot::pair_from_double(v)),
        }
    }

    /// Decodes the slots of a value of type `t`. Sub-int types widen to
    /// `Int`.
    pub fn from_slots(t: &Type, slots: &[Slot]) -> Value {
        match (t.t, slots) {
            (BaseTypeKind::Void, _) | (_, []) => Value::Void,
            (BaseTypeKind::Long, [high, low, ..]) => Value::Long(Slot::long_from_pair(*high, *low)),
            (BaseTypeKind::Double, [high, low, ..]) => Value::Double(Slot::double_from_pair(*high, *low)),
            (BaseTypeKind::Float, [v, ..]) => Value::Float(v.as_float()),
            (BaseTypeKind::Reference | BaseTypeKind::List, [v, ..]) => Value::Ref(v.as_ref()),
            (_, [v, ..]) => Value::Int(v.as_int()),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<Ref> {
        match self {
            Value::Ref(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Double(v) => write!(f, "{}d", v),
            Value::Ref(v) => write!(f, "{:?}", v),
        }
    }
}

/// An execution thread: one call stack running against a shared `Jvm`.
/// Natives receive the thread explicitly and may re-enter the engine
/// through `execute`.
pub struct Thread {
    pub jvm: Arc<Jvm>,
    pub stack: CallStack,
    id: u64,
}

impl Thread {
    pub fn new(jvm: Arc<Jvm>) -> Self {
        let stack = CallStack::new(&jvm.config);
        let id = jvm.next_thread_id();
        Self { jvm, stack, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `method` with `args` already laid out as its first local
    /// slots, and returns the slots of its result. Frames pushed by this
    /// call are gone when it returns, whatever the outcome.
    #[instrument(skip_all, fields(method = %method))]
    pub fn execute(&mut self, method: &Arc<Method>, args: &[Slot]) -> Result<Vec<Slot>> {
        if method.is_abstract() {
            let trap = Trap::raise(ExceptionKind::AbstractMethod, method.to_string());
            return Err(self.surface(trap));
        }
        let depth = self.stack.depth();
        self.stack.push_host_frame(method.clone(), args)?;
        let result = interpreter::run(self);
        self.stack.truncate(depth);
        result
    }

    /// Initializes the declaring class, then runs `method` with typed
    /// arguments and decodes its result.
    pub fn invoke(&mut self, method: &Arc<Method>, args: &[Value]) -> Result<Value> {
        let class = method.class();
        if let Err(trap) = self.initialize_class(&class) {
            return Err(self.surface(trap));
        }
        let mut slots = Vec::with_capacity(method.arg_slot_count);
        for arg in args {
            arg.write_slots(&mut slots);
        }
        let result = self.execute(method, &slots)?;
        Ok(Value::from_slots(&method.return_type, &result))
    }

    /// Runs the instance method `name descriptor` selected by the runtime
    /// class of `receiver`.
    pub fn invoke_virtual(&mut self, receiver: Ref, name: &str, descriptor: &str, args: &[Value]) -> Result<Value> {
        let Some(class) = self.jvm.heap.class_of(receiver) else {
            return Err(self.surface(Trap::null_pointer()));
        };
        let Some(method) = class.lookup_instance_method(name, descriptor) else {
            let trap = Trap::raise(
                ExceptionKind::AbstractMethod,
                format!("{}.{}{}", class.name, name, descriptor),
            );
            return Err(self.surface(trap));
        };
        let mut slots = vec![Slot::from_ref(receiver)];
        for arg in args {
            arg.write_slots(&mut slots);
        }
        let result = self.execute(&method, &slots)?;
        Ok(Value::from_slots(&method.return_type, &result))
    }

    /// Runs the static initializer of `class` unless it already ran,
    /// superclass first. Another thread initializing the same class blocks
    /// this one until it finishes.
    pub fn initialize_class(&mut self, class: &Arc<Class>) -> NativeResult<()> {
        match class.begin_init(self.id) {
            InitAction::Done => return Ok(()),
            InitAction::Failed => {
                return Err(Trap::raise(
                    ExceptionKind::NoClassDefFound,
                    format!("Could not initialize class {}", class.name),
                ))
            }
            InitAction::Run => {}
        }
        debug!(class = %class.name, thread = self.id, "initialize class");
        let result = self.run_initializer(class);
        class.finish_init(result.is_ok());
        if result.is_err() {
            debug!(class = %class.name, "class initialization failed");
        }
        result
    }

    fn run_initializer(&mut self, class: &Arc<Class>) -> NativeResult<()> {
        if let Some(super_class) = &class.super_class {
            self.initialize_class(super_class)?;
        }
        for field in class.fields.iter().filter(|f| f.is_static()) {
            let Some(index) = field.constant_value else {
                continue;
            };
            let pool = &class.constant_pool;
            let slots = match pool.entry(index)? {
                CPInfo::ConstantLong { .. } | CPInfo::ConstantDouble { .. } => pool.loadable_wide(index)?.to_vec(),
                _ => vec![pool.loadable(&self.jvm, class, index)?],
            };
            class.set_static(field.slot_id, &slots);
        }
        if let Some(clinit) = class.declared_method("<clinit>", "()V") {
            self.execute(&clinit, &[])?;
        }
        Ok(())
    }

    /// Turns a pending engine fault into a throwable object.
    pub fn materialize(&mut self, trap: Trap) -> Result<Ref> {
        match trap {
            Trap::Exception(exception) => Ok(exception),
            Trap::Raise(kind, message) => self.jvm.new_throwable(kind, &message).map_err(|trap| match trap {
                Trap::Fatal(err) => err,
                _ => RuntimeError::Internal(format!("could not create {}", kind.class_name())),
            }),
            Trap::Fatal(err) => Err(err),
        }
    }

    /// Host-facing error for a trap that escaped every frame.
    pub fn surface(&mut self, trap: Trap) -> RuntimeError {
        match self.materialize(trap) {
            Ok(exception) => self.uncaught(exception),
            Err(err) => err,
        }
    }

    pub(crate) fn uncaught(&self, exception: Ref) -> RuntimeError {
        let class_name = self
            .jvm
            .heap
            .class_of(exception)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let message = self.jvm.exception_message(exception).unwrap_or_default();
        if self.stack.is_empty() {
            warn!(exception = %class_name, %message, thread = self.id, "uncaught exception");
        } else {
            debug!(exception = %class_name, %message, "exception escaped nested invocation");
        }
        RuntimeError::UncaughtException {
            exception,
            class_name,
            message,
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("depth", &self.stack.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;
    use crate::config::Config;
    use crate::program::{AccessFlags, FieldBuilder, MethodBuilder};
    use pretty_assertions::assert_eq;

    #[test]
    fn value_slot_layout() {
        let mut slots = Vec::new();
        Value::Int(3).write_slots(&mut slots);
        Value::Long(-9).write_slots(&mut slots);
        Value::Void.write_slots(&mut slots);
        assert_eq!(slots.len(), 3);
        let long = Type::decode("J");
        assert_eq!(Value::from_slots(&long, &slots[1..]), Value::Long(-9));
        assert_eq!(Value::from_slots(&Type::decode("Z"), &slots[..1]), Value::Int(3));
        assert_eq!(Value::Long(2).t(), BaseTypeKind::Long);
    }

    #[test]
    fn constant_value_statics_are_set_before_clinit() {
        let jvm = Jvm::new(Config::default()).unwrap();
        let mut builder = ClassBuilder::new("t/Consts");
        let answer = builder.pool().long(42);
        let seen = builder.pool().field_ref("t/Consts", "ANSWER", "J");
        let copy = builder.pool().field_ref("t/Consts", "COPY", "J");
        // COPY = ANSWER + 1
        let clinit = vec![
            0xb2, (seen >> 8) as u8, seen as u8,
            0x0a,
            0x61,
            0xb3, (copy >> 8) as u8, copy as u8,
            0xb1,
        ];
        let class = jvm
            .define_class(
                builder
                    .field(FieldBuilder::new("ANSWER", "J", AccessFlags::STATIC | AccessFlags::FINAL).constant_value(answer))
                    .field(FieldBuilder::new("COPY", "J", AccessFlags::STATIC))
                    .method(MethodBuilder::new("<clinit>", "()V").access(AccessFlags::STATIC).code(4, 0, clinit)),
            )
            .unwrap();
        let mut thread = Thread::new(jvm);
        thread.initialize_class(&class).ok().unwrap();
        let copy = class.declared_field("COPY", "J").unwrap();
        let slots = class.get_static(copy.slot_id, 2);
        assert_eq!(Slot::long_from_pair(slots[0], slots[1]), 43);
    }

    #[test]
    fn failed_initializer_poisons_class() {
        let jvm = Jvm::new(Config::default()).unwrap();
        // 1 / 0 in <clinit>
        let class = jvm
            .define_class(
                ClassBuilder::new("t/Broken").method(
                    MethodBuilder::new("<clinit>", "()V")
                        .access(AccessFlags::STATIC)
                        .code(2, 0, vec![0x04, 0x03, 0x6c, 0x57, 0xb1]),
                ),
            )
            .unwrap();
        let mut thread = Thread::new(jvm.clone());
        let first = thread.initialize_class(&class);
        let first_name = match first {
            Err(Trap::Exception(r)) => jvm.heap.class_of(r).map(|c| c.name.clone()),
            _ => None,
        };
        assert_eq!(first_name.as_deref(), Some("java/lang/ArithmeticException"));
        assert!(matches!(
            thread.initialize_class(&class),
            Err(Trap::Raise(ExceptionKind::NoClassDefFound, _))
        ));
    }
}
