//! Bridge between native method frames and Rust functions.
//!
//! A native function is registered once as a plain Rust closure. Its shape
//! (parameter and return kinds) is read off the closure's Rust types at
//! registration, checked against the Java descriptor, and turned into a
//! single boxed marshalling function. Calls do no type inspection.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{NativeResult, Result, RuntimeError, Trap};
use crate::heap::Ref;
use crate::program::{BaseTypeKind, Method, Type};
use crate::runtime::{Thread, Value};
use crate::slot::Slot;

/// Parameter and return kinds a native function may use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NativeKind {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Ref,
}

impl NativeKind {
    pub fn of(t: &Type) -> Self {
        match t.t {
            BaseTypeKind::Boolean => NativeKind::Boolean,
            BaseTypeKind::Byte => NativeKind::Byte,
            BaseTypeKind::Char => NativeKind::Char,
            BaseTypeKind::Short => NativeKind::Short,
            BaseTypeKind::Int => NativeKind::Int,
            BaseTypeKind::Float => NativeKind::Float,
            BaseTypeKind::Long => NativeKind::Long,
            BaseTypeKind::Double => NativeKind::Double,
            BaseTypeKind::Void => NativeKind::Void,
            BaseTypeKind::Reference | BaseTypeKind::List => NativeKind::Ref,
        }
    }

    pub const fn slots(self) -> usize {
        match self {
            NativeKind::Void => 0,
            NativeKind::Long | NativeKind::Double => 2,
            _ => 1,
        }
    }
}

/// A Rust type that can be read out of a native frame's locals.
pub trait NativeArg: Sized {
    const KIND: NativeKind;
    /// Reads the value starting at `slots[0]`.
    fn read(slots: &[Slot]) -> Self;
}

/// A Rust type a native function may return.
pub trait NativeReturn {
    const KIND: NativeKind;
    fn into_value(self) -> Value;
}

macro_rules! int_like {
    ($($ty:ty => $kind:ident, $read:expr, $write:expr;)*) => {
        $(
            impl NativeArg for $ty {
                const KIND: NativeKind = NativeKind::$kind;
                fn read(slots: &[Slot]) -> Self {
                    ($read)(slots[0].as_int())
                }
            }

            impl NativeReturn for $ty {
                const KIND: NativeKind = NativeKind::$kind;
                fn into_value(self) -> Value {
                    Value::Int(($write)(self))
                }
            }
        )*
    };
}

int_like! {
    bool => Boolean, |v: i32| v != 0, i32::from;
    i8 => Byte, |v: i32| v as i8, i32::from;
    u16 => Char, |v: i32| v as u16, i32::from;
    i16 => Short, |v: i32| v as i16, i32::from;
    i32 => Int, |v: i32| v, |v: i32| v;
}

impl NativeArg for f32 {
    const KIND: NativeKind = NativeKind::Float;
    fn read(slots: &[Slot]) -> Self {
        slots[0].as_float()
    }
}

impl NativeArg for Ref {
    const KIND: NativeKind = NativeKind::Ref;
    fn read(slots: &[Slot]) -> Self {
        slots[0].as_ref()
    }
}

impl NativeArg for i64 {
    const KIND: NativeKind = NativeKind::Long;
    fn read(slots: &[Slot]) -> Self {
        Slot::long_from_pair(slots[0], slots[1])
    }
}

impl NativeArg for f64 {
    const KIND: NativeKind = NativeKind::Double;
    fn read(slots: &[Slot]) -> Self {
        Slot::double_from_pair(slots[0], slots[1])
    }
}

impl NativeReturn for () {
    const KIND: NativeKind = NativeKind::Void;
    fn into_value(self) -> Value {
        Value::Void
    }
}

impl NativeReturn for f32 {
    const KIND: NativeKind = NativeKind::Float;
    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl NativeReturn for Ref {
    const KIND: NativeKind = NativeKind::Ref;
    fn into_value(self) -> Value {
        Value::Ref(self)
    }
}

impl NativeReturn for i64 {
    const KIND: NativeKind = NativeKind::Long;
    fn into_value(self) -> Value {
        Value::Long(self)
    }
}

impl NativeReturn for f64 {
    const KIND: NativeKind = NativeKind::Double;
    fn into_value(self) -> Value {
        Value::Double(self)
    }
}

pub type NativeFn = Box<dyn Fn(&mut Thread, &[Slot]) -> NativeResult<Value> + Send + Sync>;

/// Signature polymorphic instance entry point: receives the receiver and
/// every argument slot of the call site, returns the raw result slots.
pub type PolymorphicFn = Box<dyn Fn(&mut Thread, &[Slot]) -> NativeResult<Vec<Slot>> + Send + Sync>;

/// Static `linkTo*` entry point: receives the call site's slot count and
/// its argument slots.
pub type LinkToFn = Box<dyn Fn(&mut Thread, usize, &[Slot]) -> NativeResult<Vec<Slot>> + Send + Sync>;

/// Conversion of a Rust closure into a marshalling function. Implemented
/// for closures taking `&mut Thread` followed by up to seven `NativeArg`s
/// and returning `NativeResult` of a `NativeReturn`.
pub trait IntoNative<Args> {
    fn shape() -> (Vec<NativeKind>, NativeKind);
    fn into_native(self) -> NativeFn;
}

macro_rules! impl_into_native {
    ($($arg:ident),*) => {
        impl<F, R, $($arg,)*> IntoNative<($($arg,)*)> for F
        where
            F: Fn(&mut Thread, $($arg),*) -> NativeResult<R> + Send + Sync + 'static,
            R: NativeReturn,
            $($arg: NativeArg,)*
        {
            fn shape() -> (Vec<NativeKind>, NativeKind) {
                (vec![$($arg::KIND),*], R::KIND)
            }

            #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
            fn into_native(self) -> NativeFn {
                Box::new(move |thread: &mut Thread, locals: &[Slot]| {
                    let mut at = 0;
                    $(
                        let $arg = $arg::read(&locals[at..]);
                        at += $arg::KIND.slots();
                    )*
                    (self)(thread, $($arg),*).map(R::into_value)
                })
            }
        }
    };
}

impl_into_native!();
impl_into_native!(A);
impl_into_native!(A, B);
impl_into_native!(A, B, C);
impl_into_native!(A, B, C, D);
impl_into_native!(A, B, C, D, E);
impl_into_native!(A, B, C, D, E, G);
impl_into_native!(A, B, C, D, E, G, H);

/// A native implementation bound to a method.
pub enum NativeBinding {
    Typed {
        params: Vec<NativeKind>,
        ret: NativeKind,
        call: NativeFn,
    },
    Polymorphic(PolymorphicFn),
    LinkTo(LinkToFn),
}

impl fmt::Debug for NativeBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NativeBinding::Typed { params, ret, .. } => f
                .debug_struct("Typed")
                .field("params", params)
                .field("ret", ret)
                .finish(),
            NativeBinding::Polymorphic(_) => write!(f, "Polymorphic"),
            NativeBinding::LinkTo(_) => write!(f, "LinkTo"),
        }
    }
}

type NativeKey = (String, String, String);

/// Registration table keyed by `(class, name, descriptor)`.
#[derive(Default)]
pub struct Natives {
    table: RwLock<HashMap<NativeKey, Arc<NativeBinding>>>,
}

impl fmt::Debug for Natives {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Natives")
            .field("registered", &self.table.read().len())
            .finish()
    }
}

fn key(class: &str, name: &str, descriptor: &str) -> NativeKey {
    (class.to_string(), name.to_string(), descriptor.to_string())
}

fn descriptor_shape(descriptor: &str) -> (Vec<NativeKind>, NativeKind) {
    let (args, ret) = crate::program::parse_method_types(descriptor);
    (args.iter().map(NativeKind::of).collect(), NativeKind::of(&ret))
}

impl Natives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` for `class.name descriptor`. The closure's parameters
    /// must match the descriptor's, preceded by a `Ref` receiver when the
    /// method is an instance method.
    pub fn register<Args, F: IntoNative<Args>>(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        f: F,
    ) -> Result<()> {
        let (params, ret) = F::shape();
        let (expected, expected_ret) = descriptor_shape(descriptor);
        let static_shape = params == expected;
        let instance_shape =
            params.first() == Some(&NativeKind::Ref) && params[1..] == expected[..];
        if ret != expected_ret || !(static_shape || instance_shape) {
            return Err(RuntimeError::SignatureMismatch {
                method: format!("{}.{}{}", class, name, descriptor),
                reason: format!("closure takes {:?} -> {:?}", params, ret),
            });
        }
        debug!(class, name, descriptor, "register native");
        self.insert(
            class,
            name,
            descriptor,
            NativeBinding::Typed {
                params,
                ret,
                call: f.into_native(),
            },
        );
        Ok(())
    }

    pub fn register_polymorphic<F>(&self, class: &str, name: &str, descriptor: &str, f: F)
    where
        F: Fn(&mut Thread, &[Slot]) -> NativeResult<Vec<Slot>> + Send + Sync + 'static,
    {
        self.insert(class, name, descriptor, NativeBinding::Polymorphic(Box::new(f)));
    }

    pub fn register_link_to<F>(&self, class: &str, name: &str, descriptor: &str, f: F)
    where
        F: Fn(&mut Thread, usize, &[Slot]) -> NativeResult<Vec<Slot>> + Send + Sync + 'static,
    {
        self.insert(class, name, descriptor, NativeBinding::LinkTo(Box::new(f)));
    }

    fn insert(&self, class: &str, name: &str, descriptor: &str, binding: NativeBinding) {
        self.table
            .write()
            .insert(key(class, name, descriptor), Arc::new(binding));
    }

    pub fn contains(&self, class: &str, name: &str, descriptor: &str) -> bool {
        self.table.read().contains_key(&key(class, name, descriptor))
    }

    /// Binding for `method`, cached on the method after the first lookup.
    pub fn bind(&self, method: &Method) -> Result<Arc<NativeBinding>> {
        method
            .native
            .get_or_try_init(|| {
                let binding = self
                    .table
                    .read()
                    .get(&key(&method.class_name(), &method.name, &method.descriptor))
                    .cloned()
                    .ok_or_else(|| RuntimeError::NativeNotFound(method.to_string()))?;
                if let NativeBinding::Typed { params, .. } = &*binding {
                    let receiver = usize::from(!method.is_static());
                    let arg_slots: usize = params.iter().map(|k| k.slots()).sum();
                    if arg_slots != method.arg_slot_count || params.len() != method.arg_types.len() + receiver {
                        return Err(RuntimeError::SignatureMismatch {
                            method: method.to_string(),
                            reason: format!("closure takes {:?}", params),
                        });
                    }
                }
                Ok(binding)
            })
            .cloned()
    }
}

impl Thread {
    /// Body of the synthesised `invokenative` instruction: marshals the
    /// current frame's locals into the bound function and pushes its result
    /// on the frame's operand stack.
    pub(crate) fn call_native(&mut self) -> NativeResult<()> {
        let method = self.stack.frame().method.clone();
        let binding = self.jvm.natives.bind(&method)?;
        let locals = self.stack.locals().to_vec();
        match &*binding {
            NativeBinding::Typed { call, .. } => {
                let value = call(self, &locals)?;
                self.stack.push_value(value);
            }
            NativeBinding::Polymorphic(call) => {
                let slots = call(self, &locals)?;
                self.stack.push_slots(&slots);
            }
            NativeBinding::LinkTo(call) => {
                let slots = call(self, locals.len(), &locals)?;
                self.stack.push_slots(&slots);
            }
        }
        Ok(())
    }

    /// Calls a signature polymorphic method with the slots of a call site,
    /// bypassing the frame machinery. `slots` includes the receiver of an
    /// instance entry point.
    pub(crate) fn call_polymorphic(&mut self, method: &Method, slots: &[Slot]) -> NativeResult<Vec<Slot>> {
        let binding = self.jvm.natives.bind(method)?;
        match &*binding {
            NativeBinding::Polymorphic(call) => call(self, slots),
            NativeBinding::LinkTo(call) => call(self, slots.len(), slots),
            NativeBinding::Typed { .. } => Err(Trap::unimplemented(format!(
                "signature polymorphic {} bound to a typed native",
                method
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jvm::Jvm;

    fn shape_of<Args, F: IntoNative<Args>>(_: &F) -> (Vec<NativeKind>, NativeKind) {
        F::shape()
    }

    #[test]
    fn shape_follows_rust_types() {
        let f = |_: &mut Thread, _: i32, _: f64, _: Ref| -> NativeResult<i64> { Ok(0) };
        assert_eq!(
            shape_of(&f),
            (vec![NativeKind::Int, NativeKind::Double, NativeKind::Ref], NativeKind::Long)
        );
        let g = |_: &mut Thread| -> NativeResult<()> { Ok(()) };
        assert_eq!(shape_of(&g), (vec![], NativeKind::Void));
    }

    #[test]
    fn registration_checks_descriptor() {
        let natives = Natives::new();
        let ok = natives.register("a/A", "f", "(IJ)Z", |_: &mut Thread, _: i32, _: i64| -> NativeResult<bool> {
            Ok(true)
        });
        assert!(ok.is_ok());
        let receiver = natives.register("a/A", "g", "(F)V", |_: &mut Thread, _: Ref, _: f32| -> NativeResult<()> {
            Ok(())
        });
        assert!(receiver.is_ok());
        let bad = natives.register("a/A", "h", "(I)V", |_: &mut Thread, _: i64| -> NativeResult<()> { Ok(()) });
        assert!(matches!(bad, Err(RuntimeError::SignatureMismatch { .. })));
        let bad_ret = natives.register("a/A", "k", "()I", |_: &mut Thread| -> NativeResult<f32> { Ok(1.0) });
        assert!(bad_ret.is_err());
        assert!(natives.contains("a/A", "f", "(IJ)Z"));
        assert!(!natives.contains("a/A", "h", "(I)V"));
    }

    #[test]
    fn marshalling_reads_category_two_pairs() {
        let f = |_: &mut Thread, a: i32, b: i64, c: bool| -> NativeResult<i64> {
            Ok(a as i64 + b + i64::from(c))
        };
        let call = f.into_native();
        let mut locals = vec![Slot::from_int(2)];
        locals.extend(Slot::pair_from_long(40));
        locals.push(Slot::from_int(5));

        let jvm = Jvm::new(Config::default()).unwrap();
        let mut thread = Thread::new(jvm);
        assert_eq!(call(&mut thread, &locals).ok(), Some(Value::Long(43)));
    }
}
