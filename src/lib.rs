//! A bytecode execution engine for JVM class files: an interpreter over a
//! per-thread slot arena, a lazily resolved constant pool, class
//! initialization, native method bridging and `invokedynamic` linkage.
pub mod bytecode;
pub mod class;
pub mod config;
pub mod constant_pool;
pub mod error;
pub mod frame;
pub mod heap;
pub mod interpreter;
pub mod invoke;
pub mod jvm;
pub mod native;
pub mod program;
pub mod reader;
pub mod runtime;
pub mod slot;

pub use config::Config;
pub use error::{NativeResult, Result, RuntimeError};
pub use jvm::Jvm;
pub use runtime::{Thread, Value};
