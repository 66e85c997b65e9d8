//! Reference handles and the object store behind them.
//!
//! Objects are never collected; a handle stays valid for the lifetime of
//! the `Heap` that issued it.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class::{Class, ClassKind};
use crate::error::{ExceptionKind, NativeResult, Trap};
use crate::program::{Field, Method};
use crate::runtime::Value;
use crate::slot::Slot;

/// Handle to a heap object. Handle 0 is the null reference.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Ref(u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    pub const fn handle(self) -> u32 {
        self.0
    }

    pub const fn from_handle(handle: u32) -> Self {
        Ref(handle)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "Ref(#{})", self.0)
        }
    }
}

/// Element storage of an array object, one variant per element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Ref(Vec<Ref>),
}

impl ArrayData {
    /// Zeroed storage for `len` elements of the given component descriptor
    /// character. Anything other than a primitive character is a reference.
    pub fn zeroed(component: char, len: usize) -> Self {
        match component {
            'Z' => ArrayData::Boolean(vec![false; len]),
            'B' => ArrayData::Byte(vec![0; len]),
            'C' => ArrayData::Char(vec![0; len]),
            'S' => ArrayData::Short(vec![0; len]),
            'I' => ArrayData::Int(vec![0; len]),
            'J' => ArrayData::Long(vec![0; len]),
            'F' => ArrayData::Float(vec![0.0; len]),
            'D' => ArrayData::Double(vec![0.0; len]),
            _ => ArrayData::Ref(vec![Ref::NULL; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Boolean(v) => v.len(),
            ArrayData::Byte(v) => v.len(),
            ArrayData::Char(v) => v.len(),
            ArrayData::Short(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::Long(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Double(v) => v.len(),
            ArrayData::Ref(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` widened to its computational type, or `None` when
    /// out of bounds.
    pub fn load(&self, index: usize) -> Option<Value> {
        Some(match self {
            ArrayData::Boolean(v) => Value::Int(i32::from(*v.get(index)?)),
            ArrayData::Byte(v) => Value::Int(i32::from(*v.get(index)?)),
            ArrayData::Char(v) => Value::Int(i32::from(*v.get(index)?)),
            ArrayData::Short(v) => Value::Int(i32::from(*v.get(index)?)),
            ArrayData::Int(v) => Value::Int(*v.get(index)?),
            ArrayData::Long(v) => Value::Long(*v.get(index)?),
            ArrayData::Float(v) => Value::Float(*v.get(index)?),
            ArrayData::Double(v) => Value::Double(*v.get(index)?),
            ArrayData::Ref(v) => Value::Ref(*v.get(index)?),
        })
    }

    /// Stores `value` at `index`, narrowing ints to the element width.
    /// Returns false when out of bounds.
    pub fn store(&mut self, index: usize, value: Value) -> bool {
        if index >= self.len() {
            return false;
        }
        match (self, value) {
            (ArrayData::Boolean(v), Value::Int(x)) => v[index] = x != 0,
            (ArrayData::Byte(v), Value::Int(x)) => v[index] = x as i8,
            (ArrayData::Char(v), Value::Int(x)) => v[index] = x as u16,
            (ArrayData::Short(v), Value::Int(x)) => v[index] = x as i16,
            (ArrayData::Int(v), Value::Int(x)) => v[index] = x,
            (ArrayData::Long(v), Value::Long(x)) => v[index] = x,
            (ArrayData::Float(v), Value::Float(x)) => v[index] = x,
            (ArrayData::Double(v), Value::Double(x)) => v[index] = x,
            (ArrayData::Ref(v), Value::Ref(x)) => v[index] = x,
            _ => return false,
        }
        true
    }
}

/// Target of a `java/lang/invoke/MethodHandle` object.
#[derive(Debug, Clone)]
pub enum Member {
    Method(Arc<Method>),
    Field(Arc<Field>),
}

/// Host-side state carried by objects of the built-in classes.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Array(ArrayData),
    Str(String),
    Mirror(Arc<Class>),
    MethodType(String),
    MethodHandle { kind: u8, member: Member },
    Lookup(Arc<Class>),
}

#[derive(Debug)]
pub struct Object {
    pub class: Arc<Class>,
    pub fields: Vec<Slot>,
    pub payload: Payload,
}

/// Object store shared by every thread of a `Jvm`.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Mutex<Vec<Object>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object with zeroed instance fields.
    pub fn alloc(&self, class: Arc<Class>, payload: Payload) -> Ref {
        let fields = vec![Slot::ZERO; class.instance_slot_count];
        let mut objects = self.objects.lock();
        objects.push(Object {
            class,
            fields,
            payload,
        });
        Ref(objects.len() as u32)
    }

    /// Allocates a zeroed array of `class`, which must be an array class.
    pub fn alloc_array(&self, class: Arc<Class>, len: usize) -> Ref {
        let component = match &class.kind {
            ClassKind::Array(component) => component.descriptor_char(),
            _ => 'L',
        };
        self.alloc(class, Payload::Array(ArrayData::zeroed(component, len)))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the object behind `r`; `None` for null or stale
    /// handles.
    pub fn with<R>(&self, r: Ref, f: impl FnOnce(&Object) -> R) -> Option<R> {
        let index = (r.0 as usize).checked_sub(1)?;
        self.objects.lock().get(index).map(f)
    }

    pub fn with_mut<R>(&self, r: Ref, f: impl FnOnce(&mut Object) -> R) -> Option<R> {
        let index = (r.0 as usize).checked_sub(1)?;
        self.objects.lock().get_mut(index).map(f)
    }

    pub fn class_of(&self, r: Ref) -> Option<Arc<Class>> {
        self.with(r, |o| o.class.clone())
    }

    /// Reads `count` field slots starting at `slot_id`, null-checking `r`.
    pub fn get_field(&self, r: Ref, slot_id: usize, count: usize) -> NativeResult<Vec<Slot>> {
        self.with(r, |o| o.fields.get(slot_id..slot_id + count).map(<[Slot]>::to_vec))
            .ok_or_else(Trap::null_pointer)?
            .ok_or_else(|| Trap::internal(format!("field slot {} out of range", slot_id)))
    }

    pub fn set_field(&self, r: Ref, slot_id: usize, values: &[Slot]) -> NativeResult<()> {
        self.with_mut(r, |o| {
            o.fields
                .get_mut(slot_id..slot_id + values.len())
                .map(|dst| dst.copy_from_slice(values))
        })
        .ok_or_else(Trap::null_pointer)?
        .ok_or_else(|| Trap::internal(format!("field slot {} out of range", slot_id)))
    }

    /// Length of the array behind `r`, null-checked.
    pub fn array_length(&self, r: Ref) -> NativeResult<usize> {
        match self.with(r, |o| match &o.payload {
            Payload::Array(data) => Some(data.len()),
            _ => None,
        }) {
            None => Err(Trap::null_pointer()),
            Some(None) => Err(Trap::internal("arraylength on a non-array object")),
            Some(Some(len)) => Ok(len),
        }
    }

    pub fn array_load(&self, r: Ref, index: i32) -> NativeResult<Value> {
        let loaded = self.with(r, |o| match &o.payload {
            Payload::Array(data) => Ok(usize::try_from(index).ok().and_then(|i| data.load(i))),
            _ => Err(Trap::internal("array load from a non-array object")),
        });
        loaded
            .ok_or_else(Trap::null_pointer)??
            .ok_or_else(|| out_of_bounds(index))
    }

    pub fn array_store(&self, r: Ref, index: i32, value: Value) -> NativeResult<()> {
        let stored = self.with_mut(r, |o| match &mut o.payload {
            Payload::Array(data) => Ok(usize::try_from(index)
                .map(|i| data.store(i, value))
                .unwrap_or(false)),
            _ => Err(Trap::internal("array store to a non-array object")),
        });
        if stored.ok_or_else(Trap::null_pointer)?? {
            Ok(())
        } else {
            Err(out_of_bounds(index))
        }
    }

    pub fn string_value(&self, r: Ref) -> Option<String> {
        self.with(r, |o| match &o.payload {
            Payload::Str(s) => Some(s.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn payload(&self, r: Ref) -> Option<Payload> {
        self.with(r, |o| o.payload.clone())
    }
}

fn out_of_bounds(index: i32) -> Trap {
    Trap::raise(
        ExceptionKind::ArrayIndexOutOfBounds,
        format!("Index {} out of bounds", index),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_stores() {
        let mut bytes = ArrayData::zeroed('B', 2);
        assert!(bytes.store(0, Value::Int(0x1ff)));
        assert_eq!(bytes.load(0), Some(Value::Int(-1)));

        let mut chars = ArrayData::zeroed('C', 1);
        assert!(chars.store(0, Value::Int(-1)));
        assert_eq!(chars.load(0), Some(Value::Int(0xffff)));

        let mut flags = ArrayData::zeroed('Z', 1);
        assert!(flags.store(0, Value::Int(2)));
        assert_eq!(flags.load(0), Some(Value::Int(1)));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut ints = ArrayData::zeroed('I', 3);
        assert_eq!(ints.load(3), None);
        assert!(!ints.store(3, Value::Int(1)));
        assert!(ints.store(2, Value::Int(1)));
        assert_eq!(ints.len(), 3);
    }

    #[test]
    fn null_is_handle_zero() {
        assert!(Ref::NULL.is_null());
        assert!(!Ref::from_handle(1).is_null());
        assert_eq!(format!("{:?}", Ref::NULL), "null");
    }
}
