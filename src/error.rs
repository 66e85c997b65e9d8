//! Error types surfaced to the host and the trap type threaded through the
//! interpreter.
use thiserror::Error;

use crate::heap::Ref;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result of a native function or any engine step that may throw into the
/// guest program.
pub type NativeResult<T> = std::result::Result<T, Trap>;

/// `RuntimeError` represents execution failures that end an `execute` call.
/// Apart from `UncaughtException`, all of them are porting gaps or host
/// misconfiguration rather than guest program errors.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("class {0} is not defined")]
    ClassNotFound(String),
    #[error("no native function registered for {0}")]
    NativeNotFound(String),
    #[error("native function for {method} does not match its descriptor: {reason}")]
    SignatureMismatch { method: String, reason: String },
    #[error("stack overflow at frame depth {depth}")]
    StackOverflow { depth: usize },
    #[error("uncaught exception {class_name}: {message}")]
    UncaughtException {
        exception: Ref,
        class_name: String,
        message: String,
    },
}

/// Exceptions the engine synthesises on its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    NullPointer,
    Arithmetic,
    ArrayIndexOutOfBounds,
    NegativeArraySize,
    ArrayStore,
    ClassCast,
    Instantiation,
    IncompatibleClassChange,
    AbstractMethod,
    IllegalAccess,
    NoSuchField,
    NoSuchMethod,
    NoClassDefFound,
    Internal,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 14] = [
        ExceptionKind::NullPointer,
        ExceptionKind::Arithmetic,
        ExceptionKind::ArrayIndexOutOfBounds,
        ExceptionKind::NegativeArraySize,
        ExceptionKind::ArrayStore,
        ExceptionKind::ClassCast,
        ExceptionKind::Instantiation,
        ExceptionKind::IncompatibleClassChange,
        ExceptionKind::AbstractMethod,
        ExceptionKind::IllegalAccess,
        ExceptionKind::NoSuchField,
        ExceptionKind::NoSuchMethod,
        ExceptionKind::NoClassDefFound,
        ExceptionKind::Internal,
    ];

    pub const fn class_name(self) -> &'static str {
        match self {
            ExceptionKind::NullPointer => "java/lang/NullPointerException",
            ExceptionKind::Arithmetic => "java/lang/ArithmeticException",
            ExceptionKind::ArrayIndexOutOfBounds => "java/lang/ArrayIndexOutOfBoundsException",
            ExceptionKind::NegativeArraySize => "java/lang/NegativeArraySizeException",
            ExceptionKind::ArrayStore => "java/lang/ArrayStoreException",
            ExceptionKind::ClassCast => "java/lang/ClassCastException",
            ExceptionKind::Instantiation => "java/lang/InstantiationException",
            ExceptionKind::IncompatibleClassChange => "java/lang/IncompatibleClassChangeError",
            ExceptionKind::AbstractMethod => "java/lang/AbstractMethodError",
            ExceptionKind::IllegalAccess => "java/lang/IllegalAccessError",
            ExceptionKind::NoSuchField => "java/lang/NoSuchFieldError",
            ExceptionKind::NoSuchMethod => "java/lang/NoSuchMethodError",
            ExceptionKind::NoClassDefFound => "java/lang/NoClassDefFoundError",
            ExceptionKind::Internal => "java/lang/InternalError",
        }
    }

    /// Direct superclass in the built-in throwable hierarchy.
    pub const fn super_class_name(self) -> &'static str {
        match self {
            ExceptionKind::NullPointer
            | ExceptionKind::Arithmetic
            | ExceptionKind::NegativeArraySize
            | ExceptionKind::ArrayStore
            | ExceptionKind::ClassCast => "java/lang/RuntimeException",
            ExceptionKind::ArrayIndexOutOfBounds => "java/lang/IndexOutOfBoundsException",
            ExceptionKind::Instantiation => "java/lang/ReflectiveOperationException",
            ExceptionKind::IncompatibleClassChange | ExceptionKind::NoClassDefFound => {
                "java/lang/LinkageError"
            }
            ExceptionKind::AbstractMethod
            | ExceptionKind::IllegalAccess
            | ExceptionKind::NoSuchField
            | ExceptionKind::NoSuchMethod => "java/lang/IncompatibleClassChangeError",
            ExceptionKind::Internal => "java/lang/VirtualMachineError",
        }
    }
}

/// Control transfer out of the normal instruction flow.
#[derive(Debug, Clone)]
pub enum Trap {
    /// A thrown guest object.
    Exception(Ref),
    /// An engine fault, turned into an object of the named class when the
    /// unwinder reaches it.
    Raise(ExceptionKind, String),
    /// Not catchable by guest code.
    Fatal(RuntimeError),
}

impl Trap {
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Trap::Raise(kind, message.into())
    }

    pub fn null_pointer() -> Self {
        Trap::Raise(ExceptionKind::NullPointer, String::new())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Trap::Fatal(RuntimeError::Internal(message.into()))
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Trap::Fatal(RuntimeError::Unimplemented(message.into()))
    }
}

// A nested `execute` that ended with an uncaught exception keeps unwinding
// in the outer dispatch loop.
impl From<RuntimeError> for Trap {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::UncaughtException { exception, .. } => Trap::Exception(exception),
            other => Trap::Fatal(other),
        }
    }
}
