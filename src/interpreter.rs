//! Interpreter for JVM bytecode: the dispatch loop and exception unwinder.
use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bytecode::OPCode;
use crate::class::Class;
use crate::error::{ExceptionKind, NativeResult, Result, RuntimeError, Trap};
use crate::frame::CallStack;
use crate::heap::{Payload, Ref};
use crate::invoke;
use crate::jvm::Jvm;
use crate::runtime::{Thread, Value};
use crate::slot::Slot;

/// Runs the current frame, which must be host-initiated, until it returns
/// or an exception escapes it.
pub(crate) fn run(thread: &mut Thread) -> Result<Vec<Slot>> {
    loop {
        match dispatch(thread) {
            Ok(result) => return Ok(result),
            Err(trap) => unwind(thread, trap)?,
        }
    }
}

/// Transfers control to the nearest handler for `trap`, popping frames
/// that have none. Fails once the host-initiated frame has been popped.
fn unwind(thread: &mut Thread, trap: Trap) -> Result<()> {
    let exception = thread.materialize(trap)?;
    let class = thread
        .jvm
        .heap
        .class_of(exception)
        .ok_or_else(|| RuntimeError::Internal(format!("thrown {:?} is not an object", exception)))?;
    loop {
        if let Some(handler_pc) = find_handler(&thread.jvm, &thread.stack, &class)? {
            debug!(exception = %class.name, method = %thread.stack.frame().method, handler_pc, "catch");
            thread.stack.clear_operand_stack();
            thread.stack.push_ref(exception);
            thread.stack.frame_mut().reader.set_pc(handler_pc);
            return Ok(());
        }
        let Some(frame) = thread.stack.pop_frame() else {
            return Err(thread.uncaught(exception));
        };
        debug!(exception = %class.name, method = %frame.method, "unwind");
        if frame.vm_invoke || thread.stack.is_empty() {
            return Err(thread.uncaught(exception));
        }
    }
}

/// Handler of the current frame covering the faulting instruction whose
/// catch type is a superclass of `thrown`. A catch type whose resolution
/// throws never matches; a fatal resolution failure ends the unwind.
fn find_handler(jvm: &Jvm, stack: &CallStack, thrown: &Class) -> Result<Option<usize>> {
    let frame = stack.frame();
    let covering = frame
        .method
        .exception_table
        .iter()
        .filter(|handler| handler.covers(frame.op_pc));
    for handler in covering {
        if handler.catch_type == 0 {
            return Ok(Some(handler.handler_pc as usize));
        }
        match frame
            .class
            .constant_pool
            .resolve_class(jvm, &frame.class, handler.catch_type)
        {
            Ok(catch) if thrown.is_subclass_of(&catch) => return Ok(Some(handler.handler_pc as usize)),
            Ok(_) | Err(Trap::Exception(_)) | Err(Trap::Raise(..)) => {}
            Err(Trap::Fatal(error)) => return Err(error),
        }
    }
    Ok(None)
}

fn read_u1(stack: &mut CallStack) -> u8 {
    stack.frame_mut().reader.read_u1()
}

fn read_u2(stack: &mut CallStack) -> u16 {
    stack.frame_mut().reader.read_u2()
}

fn load(stack: &mut CallStack, index: usize, width: usize) {
    for i in 0..width {
        let value = stack.local(index + i);
        stack.push_slot(value);
    }
}

fn store(stack: &mut CallStack, index: usize, width: usize) {
    for i in (0..width).rev() {
        let value = stack.pop_slot();
        stack.set_local(index + i, value);
    }
}

/// Reads a 2-byte branch offset and takes it when `taken`.
fn branch(stack: &mut CallStack, taken: bool) {
    let reader = &mut stack.frame_mut().reader;
    let offset = reader.read_s2() as i32;
    if taken {
        reader.skip(offset - 3);
    }
}

/// Three-way comparison; `unordered` is the result when either operand is
/// NaN.
fn compare<T: PartialOrd>(a: T, b: T, unordered: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Greater) => 1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Less) => -1,
        None => unordered,
    }
}

fn divide_by_zero() -> Trap {
    Trap::raise(ExceptionKind::Arithmetic, "/ by zero")
}

fn unsupported(opcode: OPCode) -> Trap {
    Trap::raise(ExceptionKind::Internal, format!("unsupported opcode {}", opcode))
}

/// Pops the frame returning `count` slots. Yields the slots when the frame
/// was host-initiated, otherwise hands them to the caller.
fn return_slots(stack: &mut CallStack, count: usize) -> Option<Vec<Slot>> {
    let result = stack.pop_slots(count);
    let frame = stack.pop_frame()?;
    if frame.vm_invoke || stack.is_empty() {
        return Some(result);
    }
    stack.push_slots(&result);
    None
}

fn table_switch(stack: &mut CallStack) {
    let key = stack.pop_int();
    let frame = stack.frame_mut();
    let op_pc = frame.op_pc;
    let reader = &mut frame.reader;
    reader.align4();
    let default = reader.read_s4();
    let low = reader.read_s4();
    let high = reader.read_s4();
    let offset = if (low..=high).contains(&key) {
        let table = reader.pc();
        reader.set_pc(table + 4 * (key as i64 - low as i64) as usize);
        reader.read_s4()
    } else {
        default
    };
    reader.set_pc((op_pc as i64 + offset as i64) as usize);
}

fn lookup_switch(stack: &mut CallStack) {
    let key = stack.pop_int();
    let frame = stack.frame_mut();
    let op_pc = frame.op_pc;
    let reader = &mut frame.reader;
    reader.align4();
    let default = reader.read_s4();
    let pairs = reader.read_s4().max(0) as usize;
    let table = reader.read_s4s(pairs * 2);
    let offset = table
        .chunks_exact(2)
        .find(|pair| pair[0] == key)
        .map_or(default, |pair| pair[1]);
    reader.set_pc((op_pc as i64 + offset as i64) as usize);
}

fn array_load(thread: &mut Thread) -> NativeResult<()> {
    let index = thread.stack.pop_int();
    let array = thread.stack.pop_ref();
    let value = thread.jvm.heap.array_load(array, index)?;
    thread.stack.push_value(value);
    Ok(())
}

fn array_store(thread: &mut Thread, value: Value) -> NativeResult<()> {
    let index = thread.stack.pop_int();
    let array = thread.stack.pop_ref();
    thread.jvm.heap.array_store(array, index, value)
}

/// `aastore`: the stored reference must be assignable to the component
/// class of the array.
fn reference_array_store(thread: &mut Thread) -> NativeResult<()> {
    let value = thread.stack.pop_ref();
    let index = thread.stack.pop_int();
    let array = thread.stack.pop_ref();
    let heap = &thread.jvm.heap;
    let length = heap.array_length(array)?;
    if index < 0 || index as usize >= length {
        return Err(Trap::raise(
            ExceptionKind::ArrayIndexOutOfBounds,
            format!("Index {} out of bounds for length {}", index, length),
        ));
    }
    if !value.is_null() {
        let array_class = heap.class_of(array).ok_or_else(Trap::null_pointer)?;
        let value_class = heap.class_of(value).ok_or_else(Trap::null_pointer)?;
        if let Some(component) = array_class.component() {
            if !value_class.can_cast_to(component) {
                return Err(Trap::raise(ExceptionKind::ArrayStore, value_class.name.clone()));
            }
        }
    }
    heap.array_store(array, index, Value::Ref(value))
}

fn current_class(thread: &Thread) -> Arc<Class> {
    thread.stack.frame().class.clone()
}

fn get_static(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let field = class.constant_pool.resolve_field(&thread.jvm, &class, index)?;
    if !field.is_static() {
        return Err(Trap::raise(
            ExceptionKind::IncompatibleClassChange,
            format!("Expected static field {}", field),
        ));
    }
    let declaring = field.class();
    thread.initialize_class(&declaring)?;
    let values = declaring.get_static(field.slot_id, field.slot_count());
    thread.stack.push_slots(&values);
    Ok(())
}

fn put_static(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let field = class.constant_pool.resolve_field(&thread.jvm, &class, index)?;
    if !field.is_static() {
        return Err(Trap::raise(
            ExceptionKind::IncompatibleClassChange,
            format!("Expected static field {}", field),
        ));
    }
    let declaring = field.class();
    if field.is_final() && !(thread.stack.frame().method.name == "<clinit>" && class.same_class(&declaring)) {
        return Err(Trap::raise(
            ExceptionKind::IllegalAccess,
            format!("Update to static final field {} attempted from a different method", field),
        ));
    }
    thread.initialize_class(&declaring)?;
    let values = thread.stack.pop_slots(field.slot_count());
    declaring.set_static(field.slot_id, &values);
    Ok(())
}

fn get_field(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let field = class.constant_pool.resolve_field(&thread.jvm, &class, index)?;
    if field.is_static() {
        return Err(Trap::raise(
            ExceptionKind::IncompatibleClassChange,
            format!("Expected non-static field {}", field),
        ));
    }
    let object = thread.stack.pop_ref();
    let values = thread.jvm.heap.get_field(object, field.slot_id, field.slot_count())?;
    thread.stack.push_slots(&values);
    Ok(())
}

fn put_field(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let field = class.constant_pool.resolve_field(&thread.jvm, &class, index)?;
    if field.is_static() {
        return Err(Trap::raise(
            ExceptionKind::IncompatibleClassChange,
            format!("Expected non-static field {}", field),
        ));
    }
    if field.is_final() && !(thread.stack.frame().method.is_constructor() && class.same_class(&field.class())) {
        return Err(Trap::raise(
            ExceptionKind::IllegalAccess,
            format!("Update to final field {} attempted from a different method", field),
        ));
    }
    let values = thread.stack.pop_slots(field.slot_count());
    let object = thread.stack.pop_ref();
    thread.jvm.heap.set_field(object, field.slot_id, &values)
}

fn new_object(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let target = class.constant_pool.resolve_class(&thread.jvm, &class, index)?;
    if target.is_interface() || target.is_abstract() {
        return Err(Trap::raise(ExceptionKind::Instantiation, target.name.clone()));
    }
    thread.initialize_class(&target)?;
    let object = thread.jvm.heap.alloc(target, Payload::None);
    thread.stack.push_ref(object);
    Ok(())
}

fn array_count(count: i32) -> NativeResult<usize> {
    usize::try_from(count).map_err(|_| Trap::raise(ExceptionKind::NegativeArraySize, count.to_string()))
}

fn new_reference_array(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = current_class(thread);
    let component = class.constant_pool.resolve_class(&thread.jvm, &class, index)?;
    let count = array_count(thread.stack.pop_int())?;
    let array_class = thread.jvm.array_class_of(&component)?;
    let array = thread.jvm.heap.alloc_array(array_class, count);
    thread.stack.push_ref(array);
    Ok(())
}

fn new_multi_array(thread: &mut Thread, index: u16, dimensions: usize) -> NativeResult<()> {
    let class = current_class(thread);
    let array_class = class.constant_pool.resolve_class(&thread.jvm, &class, index)?;
    let counts = thread
        .stack
        .pop_slots(dimensions)
        .into_iter()
        .map(|slot| array_count(slot.as_int()))
        .collect::<NativeResult<Vec<_>>>()?;
    let array = multi_array(&thread.jvm, &array_class, &counts)?;
    thread.stack.push_ref(array);
    Ok(())
}

fn multi_array(jvm: &Jvm, class: &Arc<Class>, counts: &[usize]) -> NativeResult<Ref> {
    let Some((&count, rest)) = counts.split_first() else {
        return Err(Trap::internal("multianewarray with no dimensions"));
    };
    let array = jvm.heap.alloc_array(class.clone(), count);
    if let (Some(component), false) = (class.component(), rest.is_empty()) {
        for i in 0..count {
            let sub = multi_array(jvm, component, rest)?;
            jvm.heap.array_store(array, i as i32, Value::Ref(sub))?;
        }
    }
    Ok(array)
}

fn check_cast(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let object = thread.stack.peek(0).as_ref();
    if object.is_null() {
        return Ok(());
    }
    let class = current_class(thread);
    let target = class.constant_pool.resolve_class(&thread.jvm, &class, index)?;
    let actual = thread.jvm.heap.class_of(object).ok_or_else(Trap::null_pointer)?;
    if !actual.can_cast_to(&target) {
        return Err(Trap::raise(
            ExceptionKind::ClassCast,
            format!("class {} cannot be cast to class {}", actual.name, target.name),
        ));
    }
    Ok(())
}

fn instance_of(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let object = thread.stack.pop_ref();
    if object.is_null() {
        thread.stack.push_int(0);
        return Ok(());
    }
    let class = current_class(thread);
    let target = class.constant_pool.resolve_class(&thread.jvm, &class, index)?;
    let actual = thread.jvm.heap.class_of(object).ok_or_else(Trap::null_pointer)?;
    thread.stack.push_int(i32::from(actual.can_cast_to(&target)));
    Ok(())
}

/// `wide` prefixed loads, stores and `iinc` with 2-byte operands.
fn wide(stack: &mut CallStack) -> NativeResult<()> {
    let opcode = OPCode::from(read_u1(stack));
    let index = read_u2(stack) as usize;
    match opcode {
        OPCode::ILoad | OPCode::FLoad | OPCode::ALoad => load(stack, index, 1),
        OPCode::LLoad | OPCode::DLoad => load(stack, index, 2),
        OPCode::IStore | OPCode::FStore | OPCode::AStore => store(stack, index, 1),
        OPCode::LStore | OPCode::DStore => store(stack, index, 2),
        OPCode::IInc => {
            let delta = stack.frame_mut().reader.read_s2() as i32;
            let value = stack.local(index).as_int().wrapping_add(delta);
            stack.set_local(index, Slot::from_int(value));
        }
        OPCode::Ret => return Err(unsupported(opcode)),
        other => return Err(Trap::internal(format!("wide cannot modify {}", other))),
    }
    Ok(())
}

/// Executes instructions until the host-initiated frame returns.
fn dispatch(thread: &mut Thread) -> NativeResult<Vec<Slot>> {
    let trace_opcodes = thread.jvm.config.trace_opcodes;
    loop {
        let stack = &mut thread.stack;
        let frame = stack.frame_mut();
        let pc = frame.reader.pc();
        frame.op_pc = pc;
        let opcode = OPCode::from(frame.reader.read_u1());
        if trace_opcodes {
            trace!(pc, %opcode, method = %frame.method, sp = frame.stack_depth(), "dispatch");
        }

        match opcode {
            OPCode::NOP => {}

            OPCode::AconstNull => stack.push_ref(Ref::NULL),
            OPCode::IconstM1 => stack.push_int(-1),
            OPCode::Iconst0 => stack.push_int(0),
            OPCode::Iconst1 => stack.push_int(1),
            OPCode::Iconst2 => stack.push_int(2),
            OPCode::Iconst3 => stack.push_int(3),
            OPCode::Iconst4 => stack.push_int(4),
            OPCode::Iconst5 => stack.push_int(5),
            OPCode::Lconst0 => stack.push_long(0),
            OPCode::Lconst1 => stack.push_long(1),
            OPCode::Fconst0 => stack.push_float(0.0),
            OPCode::Fconst1 => stack.push_float(1.0),
            OPCode::Fconst2 => stack.push_float(2.0),
            OPCode::Dconst0 => stack.push_double(0.0),
            OPCode::Dconst1 => stack.push_double(1.0),
            OPCode::BiPush => {
                let value = stack.frame_mut().reader.read_s1();
                stack.push_int(value as i32);
            }
            OPCode::SiPush => {
                let value = stack.frame_mut().reader.read_s2();
                stack.push_int(value as i32);
            }
            OPCode::Ldc | OPCode::LdcW => {
                let index = if opcode == OPCode::Ldc {
                    read_u1(stack) as u16
                } else {
                    read_u2(stack)
                };
                let class = stack.frame().class.clone();
                let value = class.constant_pool.loadable(&thread.jvm, &class, index)?;
                stack.push_slot(value);
            }
            OPCode::Ldc2W => {
                let index = read_u2(stack);
                let values = stack.frame().class.constant_pool.loadable_wide(index)?;
                stack.push_slots(&values);
            }

            OPCode::ILoad | OPCode::FLoad | OPCode::ALoad => {
                let index = read_u1(stack) as usize;
                load(stack, index, 1);
            }
            OPCode::LLoad | OPCode::DLoad => {
                let index = read_u1(stack) as usize;
                load(stack, index, 2);
            }
            OPCode::ILoad0 | OPCode::FLoad0 | OPCode::ALoad0 => load(stack, 0, 1),
            OPCode::ILoad1 | OPCode::FLoad1 | OPCode::ALoad1 => load(stack, 1, 1),
            OPCode::ILoad2 | OPCode::FLoad2 | OPCode::ALoad2 => load(stack, 2, 1),
            OPCode::ILoad3 | OPCode::FLoad3 | OPCode::ALoad3 => load(stack, 3, 1),
            OPCode::LLoad0 | OPCode::DLoad0 => load(stack, 0, 2),
            OPCode::LLoad1 | OPCode::DLoad1 => load(stack, 1, 2),
            OPCode::LLoad2 | OPCode::DLoad2 => load(stack, 2, 2),
            OPCode::LLoad3 | OPCode::DLoad3 => load(stack, 3, 2),

            OPCode::IALoad
            | OPCode::LALoad
            | OPCode::FALoad
            | OPCode::DALoad
            | OPCode::AALoad
            | OPCode::BALoad
            | OPCode::CALoad
            | OPCode::SALoad => array_load(thread)?,

            OPCode::IStore | OPCode::FStore | OPCode::AStore => {
                let index = read_u1(stack) as usize;
                store(stack, index, 1);
            }
            OPCode::LStore | OPCode::DStore => {
                let index = read_u1(stack) as usize;
                store(stack, index, 2);
            }
            OPCode::IStore0 | OPCode::FStore0 | OPCode::AStore0 => store(stack, 0, 1),
            OPCode::IStore1 | OPCode::FStore1 | OPCode::AStore1 => store(stack, 1, 1),
            OPCode::IStore2 | OPCode::FStore2 | OPCode::AStore2 => store(stack, 2, 1),
            OPCode::IStore3 | OPCode::FStore3 | OPCode::AStore3 => store(stack, 3, 1),
            OPCode::LStore0 | OPCode::DStore0 => store(stack, 0, 2),
            OPCode::LStore1 | OPCode::DStore1 => store(stack, 1, 2),
            OPCode::LStore2 | OPCode::DStore2 => store(stack, 2, 2),
            OPCode::LStore3 | OPCode::DStore3 => store(stack, 3, 2),

            OPCode::IAStore | OPCode::BAStore | OPCode::CAStore | OPCode::SAStore => {
                let value = stack.pop_int();
                array_store(thread, Value::Int(value))?;
            }
            OPCode::LAStore => {
                let value = stack.pop_long();
                array_store(thread, Value::Long(value))?;
            }
            OPCode::FAStore => {
                let value = stack.pop_float();
                array_store(thread, Value::Float(value))?;
            }
            OPCode::DAStore => {
                let value = stack.pop_double();
                array_store(thread, Value::Double(value))?;
            }
            OPCode::AAStore => reference_array_store(thread)?,

            OPCode::Pop => {
                stack.pop_slot();
            }
            OPCode::Pop2 => {
                stack.pop_slot();
                stack.pop_slot();
            }
            OPCode::Dup => {
                let v1 = stack.peek(0);
                stack.push_slot(v1);
            }
            OPCode::DupX1 => {
                let v1 = stack.pop_slot();
                let v2 = stack.pop_slot();
                stack.push_slots(&[v1, v2, v1]);
            }
            OPCode::DupX2 => {
                let v1 = stack.pop_slot();
                let v2 = stack.pop_slot();
                let v3 = stack.pop_slot();
                stack.push_slots(&[v1, v3, v2, v1]);
            }
            OPCode::Dup2 => {
                let v1 = stack.peek(0);
                let v2 = stack.peek(1);
                stack.push_slots(&[v2, v1]);
            }
            OPCode::Dup2X1 => {
                let v1 = stack.pop_slot();
                let v2 = stack.pop_slot();
                let v3 = stack.pop_slot();
                stack.push_slots(&[v2, v1, v3, v2, v1]);
            }
            OPCode::Dup2X2 => {
                let v1 = stack.pop_slot();
                let v2 = stack.pop_slot();
                let v3 = stack.pop_slot();
                let v4 = stack.pop_slot();
                stack.push_slots(&[v2, v1, v4, v3, v2, v1]);
            }
            OPCode::Swap => {
                let v1 = stack.pop_slot();
                let v2 = stack.pop_slot();
                stack.push_slots(&[v1, v2]);
            }

            OPCode::IAdd => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a.wrapping_add(b));
            }
            OPCode::LAdd => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a.wrapping_add(b));
            }
            OPCode::FAdd => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                stack.push_float(a + b);
            }
            OPCode::DAdd => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                stack.push_double(a + b);
            }
            OPCode::ISub => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a.wrapping_sub(b));
            }
            OPCode::LSub => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a.wrapping_sub(b));
            }
            OPCode::FSub => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                stack.push_float(a - b);
            }
            OPCode::DSub => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                stack.push_double(a - b);
            }
            OPCode::IMul => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a.wrapping_mul(b));
            }
            OPCode::LMul => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a.wrapping_mul(b));
            }
            OPCode::FMul => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                stack.push_float(a * b);
            }
            OPCode::DMul => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                stack.push_double(a * b);
            }
            OPCode::IDiv => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                if b == 0 {
                    return Err(divide_by_zero());
                }
                stack.push_int(a.wrapping_div(b));
            }
            OPCode::LDiv => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                if b == 0 {
                    return Err(divide_by_zero());
                }
                stack.push_long(a.wrapping_div(b));
            }
            OPCode::FDiv => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                stack.push_float(a / b);
            }
            OPCode::DDiv => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                stack.push_double(a / b);
            }
            OPCode::IRem => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                if b == 0 {
                    return Err(divide_by_zero());
                }
                stack.push_int(a.wrapping_rem(b));
            }
            OPCode::LRem => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                if b == 0 {
                    return Err(divide_by_zero());
                }
                stack.push_long(a.wrapping_rem(b));
            }
            OPCode::FRem => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                stack.push_float(a % b);
            }
            OPCode::DRem => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                stack.push_double(a % b);
            }
            OPCode::INeg => {
                let a = stack.pop_int();
                stack.push_int(a.wrapping_neg());
            }
            OPCode::LNeg => {
                let a = stack.pop_long();
                stack.push_long(a.wrapping_neg());
            }
            OPCode::FNeg => {
                let a = stack.pop_float();
                stack.push_float(-a);
            }
            OPCode::DNeg => {
                let a = stack.pop_double();
                stack.push_double(-a);
            }

            // Shift distances are masked to 5 (int) or 6 (long) bits.
            OPCode::IShl => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a.wrapping_shl(b as u32));
            }
            OPCode::LShl => {
                let b = stack.pop_int();
                let a = stack.pop_long();
                stack.push_long(a.wrapping_shl(b as u32));
            }
            OPCode::IShr => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a.wrapping_shr(b as u32));
            }
            OPCode::LShr => {
                let b = stack.pop_int();
                let a = stack.pop_long();
                stack.push_long(a.wrapping_shr(b as u32));
            }
            OPCode::IUShr => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int((a as u32).wrapping_shr(b as u32) as i32);
            }
            OPCode::LUShr => {
                let b = stack.pop_int();
                let a = stack.pop_long();
                stack.push_long((a as u64).wrapping_shr(b as u32) as i64);
            }
            OPCode::IAnd => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a & b);
            }
            OPCode::LAnd => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a & b);
            }
            OPCode::IOr => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a | b);
            }
            OPCode::LOr => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a | b);
            }
            OPCode::IXor => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                stack.push_int(a ^ b);
            }
            OPCode::LXor => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_long(a ^ b);
            }
            OPCode::IInc => {
                let index = read_u1(stack) as usize;
                let delta = stack.frame_mut().reader.read_s1() as i32;
                let value = stack.local(index).as_int().wrapping_add(delta);
                stack.set_local(index, Slot::from_int(value));
            }

            // Float to integral conversions saturate and map NaN to 0.
            OPCode::I2L => {
                let a = stack.pop_int();
                stack.push_long(a as i64);
            }
            OPCode::I2F => {
                let a = stack.pop_int();
                stack.push_float(a as f32);
            }
            OPCode::I2D => {
                let a = stack.pop_int();
                stack.push_double(a as f64);
            }
            OPCode::L2I => {
                let a = stack.pop_long();
                stack.push_int(a as i32);
            }
            OPCode::L2F => {
                let a = stack.pop_long();
                stack.push_float(a as f32);
            }
            OPCode::L2D => {
                let a = stack.pop_long();
                stack.push_double(a as f64);
            }
            OPCode::F2I => {
                let a = stack.pop_float();
                stack.push_int(a as i32);
            }
            OPCode::F2L => {
                let a = stack.pop_float();
                stack.push_long(a as i64);
            }
            OPCode::F2D => {
                let a = stack.pop_float();
                stack.push_double(a as f64);
            }
            OPCode::D2I => {
                let a = stack.pop_double();
                stack.push_int(a as i32);
            }
            OPCode::D2L => {
                let a = stack.pop_double();
                stack.push_long(a as i64);
            }
            OPCode::D2F => {
                let a = stack.pop_double();
                stack.push_float(a as f32);
            }
            OPCode::I2B => {
                let a = stack.pop_int();
                stack.push_int(a as i8 as i32);
            }
            OPCode::I2C => {
                let a = stack.pop_int();
                stack.push_int(a as u16 as i32);
            }
            OPCode::I2S => {
                let a = stack.pop_int();
                stack.push_int(a as i16 as i32);
            }

            OPCode::LCmp => {
                let b = stack.pop_long();
                let a = stack.pop_long();
                stack.push_int(compare(a, b, -1));
            }
            OPCode::FCmpL | OPCode::FCmpG => {
                let b = stack.pop_float();
                let a = stack.pop_float();
                let nan = if opcode == OPCode::FCmpG { 1 } else { -1 };
                stack.push_int(compare(a, b, nan));
            }
            OPCode::DCmpL | OPCode::DCmpG => {
                let b = stack.pop_double();
                let a = stack.pop_double();
                let nan = if opcode == OPCode::DCmpG { 1 } else { -1 };
                stack.push_int(compare(a, b, nan));
            }

            OPCode::IfEq => {
                let a = stack.pop_int();
                branch(stack, a == 0);
            }
            OPCode::IfNe => {
                let a = stack.pop_int();
                branch(stack, a != 0);
            }
            OPCode::IfLt => {
                let a = stack.pop_int();
                branch(stack, a < 0);
            }
            OPCode::IfGe => {
                let a = stack.pop_int();
                branch(stack, a >= 0);
            }
            OPCode::IfGt => {
                let a = stack.pop_int();
                branch(stack, a > 0);
            }
            OPCode::IfLe => {
                let a = stack.pop_int();
                branch(stack, a <= 0);
            }
            OPCode::IfICmpEq => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a == b);
            }
            OPCode::IfICmpNe => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a != b);
            }
            OPCode::IfICmpLt => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a < b);
            }
            OPCode::IfICmpGe => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a >= b);
            }
            OPCode::IfICmpGt => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a > b);
            }
            OPCode::IfICmpLe => {
                let b = stack.pop_int();
                let a = stack.pop_int();
                branch(stack, a <= b);
            }
            OPCode::IfACmpEq => {
                let b = stack.pop_ref();
                let a = stack.pop_ref();
                branch(stack, a == b);
            }
            OPCode::IfACmpNe => {
                let b = stack.pop_ref();
                let a = stack.pop_ref();
                branch(stack, a != b);
            }
            OPCode::IfNull => {
                let a = stack.pop_ref();
                branch(stack, a.is_null());
            }
            OPCode::IfNonNull => {
                let a = stack.pop_ref();
                branch(stack, !a.is_null());
            }
            OPCode::Goto => branch(stack, true),
            OPCode::GotoW => {
                let reader = &mut stack.frame_mut().reader;
                let offset = reader.read_s4();
                reader.skip(offset - 5);
            }
            OPCode::TableSwitch => table_switch(stack),
            OPCode::LookupSwitch => lookup_switch(stack),

            OPCode::IReturn | OPCode::FReturn | OPCode::AReturn => {
                if let Some(result) = return_slots(stack, 1) {
                    return Ok(result);
                }
            }
            OPCode::LReturn | OPCode::DReturn => {
                if let Some(result) = return_slots(stack, 2) {
                    return Ok(result);
                }
            }
            OPCode::Return => {
                if let Some(result) = return_slots(stack, 0) {
                    return Ok(result);
                }
            }

            OPCode::GetStatic => {
                let index = read_u2(stack);
                get_static(thread, index)?;
            }
            OPCode::PutStatic => {
                let index = read_u2(stack);
                put_static(thread, index)?;
            }
            OPCode::GetField => {
                let index = read_u2(stack);
                get_field(thread, index)?;
            }
            OPCode::PutField => {
                let index = read_u2(stack);
                put_field(thread, index)?;
            }

            OPCode::InvokeVirtual => {
                let index = read_u2(stack);
                invoke::invoke_virtual(thread, index)?;
            }
            OPCode::InvokeSpecial => {
                let index = read_u2(stack);
                invoke::invoke_special(thread, index)?;
            }
            OPCode::InvokeStatic => {
                let index = read_u2(stack);
                invoke::invoke_static(thread, index)?;
            }
            OPCode::InvokeInterface => {
                let index = read_u2(stack);
                // count and a zero byte, both implied by the descriptor
                read_u2(stack);
                invoke::invoke_interface(thread, index)?;
            }
            OPCode::InvokeDynamic => {
                let index = read_u2(stack);
                read_u2(stack);
                invoke::invoke_dynamic(thread, index)?;
            }
            OPCode::InvokeNative => thread.call_native()?,

            OPCode::New => {
                let index = read_u2(stack);
                new_object(thread, index)?;
            }
            OPCode::NewArray => {
                let atype = read_u1(stack);
                let count = array_count(stack.pop_int())?;
                let class = thread.jvm.primitive_array_class(atype)?;
                let array = thread.jvm.heap.alloc_array(class, count);
                thread.stack.push_ref(array);
            }
            OPCode::ANewArray => {
                let index = read_u2(stack);
                new_reference_array(thread, index)?;
            }
            OPCode::MultiANewArray => {
                let index = read_u2(stack);
                let dimensions = read_u1(stack) as usize;
                new_multi_array(thread, index, dimensions)?;
            }
            OPCode::ArrayLength => {
                let array = stack.pop_ref();
                let length = thread.jvm.heap.array_length(array)?;
                thread.stack.push_int(length as i32);
            }
            OPCode::AThrow => {
                let exception = stack.pop_ref();
                if exception.is_null() {
                    return Err(Trap::null_pointer());
                }
                return Err(Trap::Exception(exception));
            }
            OPCode::CheckCast => {
                let index = read_u2(stack);
                check_cast(thread, index)?;
            }
            OPCode::InstanceOf => {
                let index = read_u2(stack);
                instance_of(thread, index)?;
            }
            // Monitors only null-check their operand.
            OPCode::MonitorEnter | OPCode::MonitorExit => {
                if stack.pop_ref().is_null() {
                    return Err(Trap::null_pointer());
                }
            }
            OPCode::Wide => wide(stack)?,

            OPCode::Jsr
            | OPCode::Ret
            | OPCode::JsrW
            | OPCode::Breakpoint
            | OPCode::ImpDep2
            | OPCode::Unused(_) => return Err(unsupported(opcode)),
        }
    }
}
