//! Method invocation: the five `invoke*` instructions and the native
//! bodies of `MethodHandle`'s signature polymorphic entry points.
use std::sync::Arc;

use tracing::{debug, trace};

use crate::constant_pool::{
    CPInfo, REF_GET_FIELD, REF_GET_STATIC, REF_INVOKE_INTERFACE, REF_INVOKE_SPECIAL, REF_INVOKE_STATIC,
    REF_INVOKE_VIRTUAL, REF_NEW_INVOKE_SPECIAL, REF_PUT_FIELD, REF_PUT_STATIC,
};
use crate::error::{ExceptionKind, NativeResult, Trap};
use crate::heap::{Member, Payload, Ref};
use crate::program::{arg_slot_count, parse_method_types, Method};
use crate::runtime::Thread;
use crate::slot::Slot;

/// Static entry points taking the target handle as their trailing argument.
pub const LINK_TO: [&str; 4] = ["linkToStatic", "linkToVirtual", "linkToSpecial", "linkToInterface"];

const DYNAMIC_INVOKER: (&str, &str) = ("dynamicInvoker", "()Ljava/lang/invoke/MethodHandle;");
const INVOKE_EXACT: (&str, &str) = ("invokeExact", "([Ljava/lang/Object;)Ljava/lang/Object;");

fn abstract_method(method: &Method) -> Trap {
    Trap::raise(ExceptionKind::AbstractMethod, method.to_string())
}

fn incompatible(message: String) -> Trap {
    Trap::raise(ExceptionKind::IncompatibleClassChange, message)
}

/// Makes `method` the current frame, taking its arguments off the
/// caller's operand stack.
fn link(thread: &mut Thread, method: Arc<Method>) -> NativeResult<()> {
    let arg_slots = method.arg_slot_count;
    thread.stack.push_linked_frame(method, arg_slots)?;
    Ok(())
}

fn receiver(thread: &Thread, method: &Method) -> Ref {
    thread.stack.peek(method.arg_slot_count - 1).as_ref()
}

/// Pushes the result of a call made outside the frame machinery, sized by
/// the call site's descriptor. A void call site discards the result.
fn push_result(thread: &mut Thread, descriptor: &str, result: Vec<Slot>) -> NativeResult<()> {
    let (_, ret) = parse_method_types(descriptor);
    match ret.size() {
        0 => Ok(()),
        size if size == result.len() => {
            thread.stack.push_slots(&result);
            Ok(())
        }
        size => Err(Trap::internal(format!(
            "call site {} expects {} result slots, got {}",
            descriptor,
            size,
            result.len()
        ))),
    }
}

/// Signature polymorphic call: the arguments are laid out by the call
/// site's own descriptor rather than the method's.
fn call_polymorphic_site(
    thread: &mut Thread,
    method: &Arc<Method>,
    descriptor: &str,
    has_receiver: bool,
) -> NativeResult<()> {
    let count = arg_slot_count(descriptor, !has_receiver);
    let slots = thread.stack.pop_slots(count);
    if has_receiver && slots.first().map_or(true, |s| s.as_ref().is_null()) {
        return Err(Trap::null_pointer());
    }
    trace!(method = %method, descriptor, "signature polymorphic call");
    let result = thread.call_polymorphic(method, &slots)?;
    push_result(thread, descriptor, result)
}

pub(crate) fn invoke_static(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = thread.stack.frame().class.clone();
    let pool = &class.constant_pool;
    let method = pool.resolve_method_or_interface_method(&thread.jvm, &class, index)?;
    if !method.is_static() {
        return Err(incompatible(format!("Expected static method {}", method)));
    }
    if method.is_abstract() {
        return Err(abstract_method(&method));
    }
    thread.initialize_class(&method.class())?;
    if method.is_signature_polymorphic() {
        let (_, _, descriptor) = pool.member_ref(index)?;
        return call_polymorphic_site(thread, &method, descriptor, false);
    }
    link(thread, method)
}

pub(crate) fn invoke_special(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = thread.stack.frame().class.clone();
    let method = class
        .constant_pool
        .resolve_special_method(&thread.jvm, &class, index)?;
    if method.is_static() {
        return Err(incompatible(format!("Expected non-static method {}", method)));
    }
    if method.is_abstract() {
        return Err(abstract_method(&method));
    }
    if receiver(thread, &method).is_null() {
        return Err(Trap::null_pointer());
    }
    link(thread, method)
}

pub(crate) fn invoke_virtual(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = thread.stack.frame().class.clone();
    let pool = &class.constant_pool;
    let resolved = pool.resolve_method(&thread.jvm, &class, index)?;
    if resolved.is_static() {
        return Err(incompatible(format!("Expected non-static method {}", resolved)));
    }
    if resolved.is_signature_polymorphic() {
        let (_, _, descriptor) = pool.member_ref(index)?;
        return call_polymorphic_site(thread, &resolved, descriptor, true);
    }
    let receiver = receiver(thread, &resolved);
    let receiver_class = thread
        .jvm
        .heap
        .class_of(receiver)
        .ok_or_else(Trap::null_pointer)?;
    let target = if resolved.is_private() {
        resolved
    } else {
        receiver_class
            .lookup_instance_method(&resolved.name, &resolved.descriptor)
            .ok_or_else(|| abstract_method(&resolved))?
    };
    if target.is_abstract() {
        return Err(abstract_method(&target));
    }
    link(thread, target)
}

pub(crate) fn invoke_interface(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = thread.stack.frame().class.clone();
    let resolved = class
        .constant_pool
        .resolve_interface_method(&thread.jvm, &class, index)?;
    if resolved.is_static() {
        return Err(incompatible(format!("Expected non-static method {}", resolved)));
    }
    let receiver = receiver(thread, &resolved);
    let receiver_class = thread
        .jvm
        .heap
        .class_of(receiver)
        .ok_or_else(Trap::null_pointer)?;
    let target = receiver_class
        .lookup_instance_method(&resolved.name, &resolved.descriptor)
        .ok_or_else(|| abstract_method(&resolved))?;
    if target.is_abstract() {
        return Err(abstract_method(&target));
    }
    if !target.is_public() {
        return Err(Trap::raise(ExceptionKind::IllegalAccess, target.to_string()));
    }
    link(thread, target)
}

fn first_ref(slots: &[Slot], what: &str) -> NativeResult<Ref> {
    slots
        .first()
        .map(|slot| slot.as_ref())
        .ok_or_else(|| Trap::internal(format!("{} returned no value", what)))
}

/// Links the call site through its bootstrap method and invokes the
/// target. The call site is relinked on every execution.
pub(crate) fn invoke_dynamic(thread: &mut Thread, index: u16) -> NativeResult<()> {
    let class = thread.stack.frame().class.clone();
    let jvm = thread.jvm.clone();
    let pool = &class.constant_pool;
    let (bootstrap_index, name, descriptor) = pool.invoke_dynamic(index)?;
    let bootstrap = class
        .bootstrap_methods
        .get(bootstrap_index as usize)
        .ok_or_else(|| Trap::internal(format!("no bootstrap method #{} in {}", bootstrap_index, class.name)))?;
    let (kind, reference_index) = match pool.entry(bootstrap.method_ref)? {
        CPInfo::ConstantMethodHandle {
            reference_kind,
            reference_index,
        } => (*reference_kind, *reference_index),
        _ => return Err(Trap::internal(format!("bootstrap method #{} is not a method handle", bootstrap_index))),
    };
    if kind != REF_INVOKE_STATIC {
        return Err(Trap::unimplemented(format!("bootstrap method handle kind {}", kind)));
    }
    let (class_index, bootstrap_name, bootstrap_descriptor) = pool.member_ref(reference_index)?;
    let bootstrap_class = pool.resolve_class(&jvm, &class, class_index)?;
    let bootstrap_method = bootstrap_class
        .declared_method(bootstrap_name, bootstrap_descriptor)
        .filter(|m| m.is_static())
        .ok_or_else(|| {
            Trap::raise(
                ExceptionKind::NoSuchMethod,
                format!("{}.{}{}", bootstrap_class.name, bootstrap_name, bootstrap_descriptor),
            )
        })?;
    thread.initialize_class(&bootstrap_class)?;

    let mut args = vec![
        Slot::from_ref(jvm.lookup_object(&class)?),
        Slot::from_ref(jvm.intern(name)?),
        Slot::from_ref(jvm.method_type(descriptor)?),
    ];
    args.extend(pool.resolve_bootstrap_args(&jvm, &class, &bootstrap.arguments)?);
    debug!(name, descriptor, bootstrap = %bootstrap_method, "link call site");
    let call_site = first_ref(&thread.execute(&bootstrap_method, &args)?, "bootstrap method")?;

    let call_site_class = jvm.heap.class_of(call_site).ok_or_else(Trap::null_pointer)?;
    let dynamic_invoker = call_site_class
        .lookup_instance_method(DYNAMIC_INVOKER.0, DYNAMIC_INVOKER.1)
        .ok_or_else(|| Trap::raise(ExceptionKind::AbstractMethod, format!("{}.dynamicInvoker", call_site_class.name)))?;
    let handle = first_ref(
        &thread.execute(&dynamic_invoker, &[Slot::from_ref(call_site)])?,
        "dynamicInvoker",
    )?;
    let handle_class = jvm.heap.class_of(handle).ok_or_else(Trap::null_pointer)?;
    let invoke_exact = handle_class
        .lookup_method(INVOKE_EXACT.0, INVOKE_EXACT.1)
        .ok_or_else(|| Trap::raise(ExceptionKind::NoSuchMethod, format!("{}.invokeExact", handle_class.name)))?;

    let mut slots = vec![Slot::from_ref(handle)];
    slots.extend(thread.stack.pop_slots(arg_slot_count(descriptor, true)));
    let result = thread.call_polymorphic(&invoke_exact, &slots)?;
    push_result(thread, descriptor, result)
}

fn instance_receiver(args: &[Slot]) -> NativeResult<Ref> {
    match args.first() {
        Some(slot) if !slot.as_ref().is_null() => Ok(slot.as_ref()),
        _ => Err(Trap::null_pointer()),
    }
}

fn check_arity(method: &Method, given: usize) -> NativeResult<()> {
    if given != method.arg_slot_count {
        return Err(incompatible(format!(
            "{} expects {} argument slots, got {}",
            method, method.arg_slot_count, given
        )));
    }
    Ok(())
}

/// Body of `MethodHandle.invokeExact` and `invoke`: `slots` holds the
/// handle followed by the call site's arguments.
pub fn invoke_handle(thread: &mut Thread, slots: &[Slot]) -> NativeResult<Vec<Slot>> {
    let Some((handle, args)) = slots.split_first() else {
        return Err(Trap::internal("method handle invoked without a receiver"));
    };
    let (kind, member) = match thread.jvm.heap.payload(handle.as_ref()) {
        Some(Payload::MethodHandle { kind, member }) => (kind, member),
        Some(_) => return Err(Trap::internal(format!("{:?} is not a method handle", handle.as_ref()))),
        None => return Err(Trap::null_pointer()),
    };
    trace!(kind, "invoke method handle");
    match (kind, member) {
        (REF_INVOKE_STATIC, Member::Method(method)) => {
            check_arity(&method, args.len())?;
            thread.initialize_class(&method.class())?;
            Ok(thread.execute(&method, args)?)
        }
        (REF_INVOKE_VIRTUAL | REF_INVOKE_INTERFACE, Member::Method(method)) => {
            check_arity(&method, args.len())?;
            let receiver = instance_receiver(args)?;
            let receiver_class = thread.jvm.heap.class_of(receiver).ok_or_else(Trap::null_pointer)?;
            let target = receiver_class
                .lookup_instance_method(&method.name, &method.descriptor)
                .filter(|m| !m.is_abstract())
                .ok_or_else(|| abstract_method(&method))?;
            Ok(thread.execute(&target, args)?)
        }
        (REF_INVOKE_SPECIAL, Member::Method(method)) => {
            check_arity(&method, args.len())?;
            instance_receiver(args)?;
            Ok(thread.execute(&method, args)?)
        }
        (REF_NEW_INVOKE_SPECIAL, Member::Method(constructor)) => {
            // The new object is the constructor's receiver.
            check_arity(&constructor, args.len() + 1)?;
            let class = constructor.class();
            thread.initialize_class(&class)?;
            let object = thread.jvm.heap.alloc(class, Payload::None);
            let mut constructor_args = Vec::with_capacity(args.len() + 1);
            constructor_args.push(Slot::from_ref(object));
            constructor_args.extend_from_slice(args);
            thread.execute(&constructor, &constructor_args)?;
            Ok(vec![Slot::from_ref(object)])
        }
        (REF_GET_FIELD, Member::Field(field)) => {
            let receiver = instance_receiver(args)?;
            thread.jvm.heap.get_field(receiver, field.slot_id, field.slot_count())
        }
        (REF_PUT_FIELD, Member::Field(field)) => {
            let receiver = instance_receiver(args)?;
            thread.jvm.heap.set_field(receiver, field.slot_id, &args[1..])?;
            Ok(Vec::new())
        }
        (REF_GET_STATIC, Member::Field(field)) => {
            let class = field.class();
            thread.initialize_class(&class)?;
            Ok(class.get_static(field.slot_id, field.slot_count()))
        }
        (REF_PUT_STATIC, Member::Field(field)) => {
            let class = field.class();
            thread.initialize_class(&class)?;
            class.set_static(field.slot_id, args);
            Ok(Vec::new())
        }
        (kind, _) => Err(Trap::internal(format!("method handle kind {} does not match its member", kind))),
    }
}

/// Body of the `linkTo*` entry points: the target handle is the trailing
/// argument of the `count` slots.
pub fn link_to(thread: &mut Thread, count: usize, slots: &[Slot]) -> NativeResult<Vec<Slot>> {
    let Some((handle, args)) = slots[..count.min(slots.len())].split_last() else {
        return Err(Trap::internal("linkTo called without a target handle"));
    };
    let mut reordered = Vec::with_capacity(count);
    reordered.push(*handle);
    reordered.extend_from_slice(args);
    invoke_handle(thread, &reordered)
}
