use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use coldbrew_engine::class::{Class, ClassBuilder, InitState};
use coldbrew_engine::constant_pool::REF_INVOKE_STATIC;
use coldbrew_engine::jvm::{CALL_SITE, CONSTANT_CALL_SITE, METHOD_HANDLE};
use coldbrew_engine::program::{AccessFlags, FieldBuilder, MethodBuilder};
use coldbrew_engine::{Config, Jvm, NativeResult, RuntimeError, Thread, Value};
use pretty_assertions::assert_eq;

const STATIC: AccessFlags = AccessFlags::from_bits(0x0009);

fn op(code: u8, index: u16) -> Vec<u8> {
    let [high, low] = index.to_be_bytes();
    vec![code, high, low]
}

fn code(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

fn run(jvm: Arc<Jvm>, class: &Arc<Class>, name: &str, descriptor: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let method = class.declared_method(name, descriptor).expect("method is defined");
    Thread::new(jvm).invoke(&method, args)
}

fn uncaught_class(result: Result<Value, RuntimeError>) -> String {
    match result {
        Err(RuntimeError::UncaughtException { class_name, .. }) => class_name,
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

/// `<init>()V` that only chains to `Object.<init>`.
fn default_constructor(builder: &mut ClassBuilder) -> MethodBuilder {
    let object_init = builder.pool().method_ref("java/lang/Object", "<init>", "()V");
    MethodBuilder::new("<init>", "()V").code(1, 1, code(&[&[0x2a], &op(0xb7, object_init), &[0xb1]]))
}

#[test]
fn static_initializer_runs_before_first_invokestatic() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let mut counter = ClassBuilder::new("t/Counter");
    let value = counter.pool().field_ref("t/Counter", "value", "I");
    let counter = jvm
        .define_class(
            counter
                .field(FieldBuilder::new("value", "I", STATIC))
                .method(
                    MethodBuilder::new("<clinit>", "()V")
                        .access(STATIC)
                        .code(1, 0, code(&[&[0x10, 42], &op(0xb3, value), &[0xb1]])),
                )
                .method(
                    MethodBuilder::new("get", "()I")
                        .access(STATIC)
                        .code(1, 0, code(&[&op(0xb2, value), &[0xac]])),
                ),
        )
        .unwrap();

    let mut main = ClassBuilder::new("t/Main");
    let get = main.pool().method_ref("t/Counter", "get", "()I");
    let main = jvm
        .define_class(main.method(
            MethodBuilder::new("run", "()I")
                .access(STATIC)
                .code(1, 0, code(&[&op(0xb8, get), &[0xac]])),
        ))
        .unwrap();

    assert_eq!(counter.init_state(), InitState::Uninitialized);
    assert_eq!(run(jvm, &main, "run", "()I", &[]).ok(), Some(Value::Int(42)));
    assert_eq!(counter.init_state(), InitState::Initialized);
}

#[test]
fn exception_crosses_frames_to_handler() {
    let jvm = Jvm::new(Config::default()).unwrap();
    // static void boom() { int x = 1 / 0; }
    jvm.define_class(ClassBuilder::new("t/Thrower").method(
        MethodBuilder::new("boom", "()V")
            .access(STATIC)
            .code(2, 0, vec![0x04, 0x03, 0x6c, 0x57, 0xb1]),
    ))
    .unwrap();
    let mut main = ClassBuilder::new("t/Catcher");
    let boom = main.pool().method_ref("t/Thrower", "boom", "()V");
    let arithmetic = main.pool().class("java/lang/ArithmeticException");
    // 0: invokestatic boom; 3: iconst_0; 4: ireturn; 5: pop; 6: bipush 7; 8: ireturn
    let main = jvm
        .define_class(
            main.method(
                MethodBuilder::new("run", "()I")
                    .access(STATIC)
                    .code(1, 0, code(&[&op(0xb8, boom), &[0x03, 0xac, 0x57, 0x10, 7, 0xac]]))
                    .handler(0, 3, 5, arithmetic),
            ),
        )
        .unwrap();
    assert_eq!(run(jvm, &main, "run", "()I", &[]).ok(), Some(Value::Int(7)));
}

#[test]
fn uncaught_exception_reports_class_and_message() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let class = jvm
        .define_class(ClassBuilder::new("t/Fails").method(
            MethodBuilder::new("run", "()I")
                .access(STATIC)
                .code(2, 0, vec![0x04, 0x03, 0x6c, 0xac]),
        ))
        .unwrap();
    let mut thread = Thread::new(jvm.clone());
    let method = class.declared_method("run", "()I").unwrap();
    match thread.invoke(&method, &[]) {
        Err(RuntimeError::UncaughtException { class_name, message, exception }) => {
            assert_eq!(class_name, "java/lang/ArithmeticException");
            assert_eq!(message, "/ by zero");
            assert_eq!(jvm.exception_message(exception).as_deref(), Some("/ by zero"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(thread.stack.depth(), 0);
}

#[test]
fn constructor_fields_and_virtual_dispatch() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let mut point = ClassBuilder::new("t/Point");
    let object_init = point.pool().method_ref("java/lang/Object", "<init>", "()V");
    let x = point.pool().field_ref("t/Point", "x", "I");
    jvm.define_class(
        point
            .field(FieldBuilder::new("x", "I", AccessFlags::PRIVATE | AccessFlags::FINAL))
            .method(MethodBuilder::new("<init>", "(I)V").code(
                2,
                2,
                code(&[&[0x2a], &op(0xb7, object_init), &[0x2a, 0x1b], &op(0xb5, x), &[0xb1]]),
            ))
            .method(MethodBuilder::new("getX", "()I").code(1, 1, code(&[&[0x2a], &op(0xb4, x), &[0xac]]))),
    )
    .unwrap();
    // class Point3 extends Point { int getX() { return 3; } }
    let mut point3 = ClassBuilder::new("t/Point3").super_class("t/Point");
    let super_init = point3.pool().method_ref("t/Point", "<init>", "(I)V");
    jvm.define_class(
        point3
            .method(MethodBuilder::new("<init>", "()V").code(
                2,
                1,
                code(&[&[0x2a, 0x06], &op(0xb7, super_init), &[0xb1]]),
            ))
            .method(MethodBuilder::new("getX", "()I").code(1, 1, vec![0x06, 0xac])),
    )
    .unwrap();

    let mut main = ClassBuilder::new("t/Points");
    let point_class = main.pool().class("t/Point");
    let point3_class = main.pool().class("t/Point3");
    let init = main.pool().method_ref("t/Point", "<init>", "(I)V");
    let init3 = main.pool().method_ref("t/Point3", "<init>", "()V");
    let get_x = main.pool().method_ref("t/Point", "getX", "()I");
    let main = jvm
        .define_class(
            main.method(MethodBuilder::new("base", "()I").access(STATIC).code(
                3,
                0,
                code(&[&op(0xbb, point_class), &[0x59, 0x10, 9], &op(0xb7, init), &op(0xb6, get_x), &[0xac]]),
            ))
            .method(MethodBuilder::new("derived", "()I").access(STATIC).code(
                2,
                0,
                code(&[&op(0xbb, point3_class), &[0x59], &op(0xb7, init3), &op(0xb6, get_x), &[0xac]]),
            )),
        )
        .unwrap();
    assert_eq!(run(jvm.clone(), &main, "base", "()I", &[]).ok(), Some(Value::Int(9)));
    assert_eq!(run(jvm, &main, "derived", "()I", &[]).ok(), Some(Value::Int(3)));
}

#[test]
fn interface_dispatch_reaches_implementation() {
    let jvm = Jvm::new(Config::default()).unwrap();
    jvm.define_class(
        ClassBuilder::new("t/Shape")
            .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .method(MethodBuilder::new("area", "()I").access(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)),
    )
    .unwrap();
    let mut square = ClassBuilder::new("t/Square").interface("t/Shape");
    let init = default_constructor(&mut square);
    jvm.define_class(
        square
            .method(init)
            .method(MethodBuilder::new("area", "()I").code(1, 1, vec![0x10, 16, 0xac])),
    )
    .unwrap();

    let mut main = ClassBuilder::new("t/Shapes");
    let square_class = main.pool().class("t/Square");
    let square_init = main.pool().method_ref("t/Square", "<init>", "()V");
    let area = main.pool().interface_method_ref("t/Shape", "area", "()I");
    let main = jvm
        .define_class(main.method(MethodBuilder::new("run", "()I").access(STATIC).code(
            2,
            0,
            code(&[
                &op(0xbb, square_class),
                &[0x59],
                &op(0xb7, square_init),
                &op(0xb9, area),
                &[1, 0, 0xac],
            ]),
        )))
        .unwrap();
    assert_eq!(run(jvm, &main, "run", "()I", &[]).ok(), Some(Value::Int(16)));
}

#[test]
fn registered_native_receives_typed_arguments() {
    let jvm = Jvm::new(Config::default()).unwrap();
    jvm.natives
        .register("t/Native", "scale", "(IJ)J", |_: &mut Thread, factor: i32, value: i64| -> NativeResult<i64> {
            Ok(value * factor as i64)
        })
        .unwrap();
    let mut native = ClassBuilder::new("t/Native");
    let scale = native.pool().method_ref("t/Native", "scale", "(IJ)J");
    let class = jvm
        .define_class(
            native
                .method(MethodBuilder::new("scale", "(IJ)J").access(STATIC | AccessFlags::NATIVE))
                .method(MethodBuilder::new("run", "(J)J").access(STATIC).code(
                    3,
                    2,
                    code(&[&[0x06, 0x1e], &op(0xb8, scale), &[0xad]]),
                )),
        )
        .unwrap();
    let result = run(jvm, &class, "run", "(J)J", &[Value::Long(1 << 40)]);
    assert_eq!(result.ok().and_then(|v| v.as_long()), Some(3 << 40));
}

#[test]
fn missing_native_is_fatal() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let class = jvm
        .define_class(
            ClassBuilder::new("t/Unbound").method(MethodBuilder::new("f", "()I").access(STATIC | AccessFlags::NATIVE)),
        )
        .unwrap();
    let result = run(jvm, &class, "f", "()I", &[]);
    assert!(matches!(result, Err(RuntimeError::NativeNotFound(_))));
}

#[test]
fn unbounded_recursion_is_stack_overflow() {
    let jvm = Jvm::new(Config::default().with_max_frames(64)).unwrap();
    let mut builder = ClassBuilder::new("t/Recurse");
    let f = builder.pool().method_ref("t/Recurse", "f", "()V");
    let class = jvm
        .define_class(builder.method(
            MethodBuilder::new("f", "()V")
                .access(STATIC)
                .code(0, 0, code(&[&op(0xb8, f), &[0xb1]])),
        ))
        .unwrap();
    let mut thread = Thread::new(jvm);
    let method = class.declared_method("f", "()V").unwrap();
    assert!(matches!(
        thread.invoke(&method, &[]),
        Err(RuntimeError::StackOverflow { .. })
    ));
    assert_eq!(thread.stack.depth(), 0);
}

#[test]
fn string_literals_are_interned() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let mut builder = ClassBuilder::new("t/Strings");
    let hi = builder.pool().string("hi") as u8;
    // ldc "hi"; ldc "hi"; if_acmpne +5; iconst_1; ireturn; iconst_0; ireturn
    let class = jvm
        .define_class(builder.method(MethodBuilder::new("run", "()I").access(STATIC).code(
            2,
            0,
            vec![0x12, hi, 0x12, hi, 0xa6, 0, 5, 0x04, 0xac, 0x03, 0xac],
        )))
        .unwrap();
    assert_eq!(run(jvm.clone(), &class, "run", "()I", &[]).ok(), Some(Value::Int(1)));
    let interned = jvm.intern("hi").ok().unwrap();
    assert_eq!(jvm.string_value(interned).as_deref(), Some("hi"));
}

#[test]
fn invokedynamic_links_through_constant_call_site() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let bootstrap_descriptor = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;\
                                Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;)\
                                Ljava/lang/invoke/CallSite;";
    let mut builder = ClassBuilder::new("t/Indy");
    let add = builder.pool().method_ref("t/Indy", "add", "(II)I");
    let add_handle = builder.pool().method_handle(REF_INVOKE_STATIC, add);
    let bootstrap = builder.pool().method_ref("t/Indy", "bootstrap", bootstrap_descriptor);
    let bootstrap_handle = builder.pool().method_handle(REF_INVOKE_STATIC, bootstrap);
    let call_site = builder.pool().class(CONSTANT_CALL_SITE);
    let call_site_init =
        builder
            .pool()
            .method_ref(CONSTANT_CALL_SITE, "<init>", "(Ljava/lang/invoke/MethodHandle;)V");
    let indy = builder.pool().invoke_dynamic(0, "add", "(II)I");
    let class = jvm
        .define_class(
            builder
                .bootstrap_method(bootstrap_handle, vec![add_handle])
                .method(
                    MethodBuilder::new("add", "(II)I")
                        .access(STATIC)
                        .code(2, 2, vec![0x1a, 0x1b, 0x60, 0xac]),
                )
                // return new ConstantCallSite(target);
                .method(MethodBuilder::new("bootstrap", bootstrap_descriptor).access(STATIC).code(
                    3,
                    4,
                    code(&[&op(0xbb, call_site), &[0x59, 0x2d], &op(0xb7, call_site_init), &[0xb0]]),
                ))
                .method(MethodBuilder::new("run", "(II)I").access(STATIC).code(
                    2,
                    2,
                    code(&[&[0x1a, 0x1b], &op(0xba, indy), &[0, 0, 0xac]]),
                )),
        )
        .unwrap();
    assert!(jvm.find_class(CALL_SITE).is_some());
    let mut thread = Thread::new(jvm);
    let method = class.declared_method("run", "(II)I").unwrap();
    assert_eq!(thread.invoke(&method, &[Value::Int(40), Value::Int(2)]).ok(), Some(Value::Int(42)));
    // Relinked on every execution.
    assert_eq!(thread.invoke(&method, &[Value::Int(-1), Value::Int(1)]).ok(), Some(Value::Int(0)));
}

#[test]
fn invokeinterface_rejects_static_target() {
    let jvm = Jvm::new(Config::default()).unwrap();
    jvm.define_class(
        ClassBuilder::new("t/Iface")
            .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .method(MethodBuilder::new("s", "()V").access(STATIC).code(0, 0, vec![0xb1])),
    )
    .unwrap();
    let mut caller = ClassBuilder::new("t/IfaceCaller");
    let s = caller.pool().interface_method_ref("t/Iface", "s", "()V");
    let caller = jvm
        .define_class(caller.method(
            MethodBuilder::new("run", "()V")
                .access(STATIC)
                .code(1, 0, code(&[&op(0xb9, s), &[1, 0, 0xb1]])),
        ))
        .unwrap();
    let result = run(jvm, &caller, "run", "()V", &[]);
    assert_eq!(uncaught_class(result), "java/lang/IncompatibleClassChangeError");
}

/// Defines `owner` with `static int twice(int)` plus a `run(I)I` built by
/// `body` from the constant pool indices of a handle to `twice` and of the
/// `MethodHandle` entry point `name descriptor`.
fn handle_caller(
    jvm: &Arc<Jvm>,
    owner: &str,
    name: &str,
    descriptor: &str,
    body: impl FnOnce(u16, u16) -> Vec<u8>,
) -> Arc<Class> {
    let mut builder = ClassBuilder::new(owner);
    let twice = builder.pool().method_ref(owner, "twice", "(I)I");
    let handle = builder.pool().method_handle(REF_INVOKE_STATIC, twice);
    let entry = builder.pool().method_ref(METHOD_HANDLE, name, descriptor);
    jvm.define_class(
        builder
            .method(
                MethodBuilder::new("twice", "(I)I")
                    .access(STATIC)
                    .code(2, 1, vec![0x1a, 0x1a, 0x60, 0xac]),
            )
            .method(MethodBuilder::new("run", "(I)I").access(STATIC).code(2, 1, body(handle, entry))),
    )
    .unwrap()
}

#[test]
fn invoke_exact_uses_call_site_descriptor() {
    let jvm = Jvm::new(Config::default()).unwrap();
    // ldc_w handle; iload_0; invokevirtual MethodHandle.invokeExact:(I)I; ireturn
    let class = handle_caller(&jvm, "t/Exact", "invokeExact", "(I)I", |handle, entry| {
        code(&[&op(0x13, handle), &[0x1a], &op(0xb6, entry), &[0xac]])
    });
    assert_eq!(run(jvm, &class, "run", "(I)I", &[Value::Int(21)]).ok(), Some(Value::Int(42)));
}

#[test]
fn link_to_static_takes_trailing_handle() {
    let jvm = Jvm::new(Config::default()).unwrap();
    // The linkTo entry points are package private to java/lang/invoke.
    // iload_0; ldc_w handle; invokestatic MethodHandle.linkToStatic; ireturn
    let class = handle_caller(
        &jvm,
        "java/lang/invoke/LinkCaller",
        "linkToStatic",
        "(ILjava/lang/invoke/MethodHandle;)I",
        |handle, entry| code(&[&[0x1a], &op(0x13, handle), &op(0xb8, entry), &[0xac]]),
    );
    assert_eq!(run(jvm, &class, "run", "(I)I", &[Value::Int(4)]).ok(), Some(Value::Int(8)));
}

#[test]
fn invokespecial_reselects_from_direct_superclass() {
    let jvm = Jvm::new(Config::default()).unwrap();
    jvm.define_class(
        ClassBuilder::new("t/Grand").method(MethodBuilder::new("name", "()I").code(1, 1, vec![0x04, 0xac])),
    )
    .unwrap();
    jvm.define_class(
        ClassBuilder::new("t/Parent")
            .super_class("t/Grand")
            .method(MethodBuilder::new("name", "()I").code(1, 1, vec![0x05, 0xac])),
    )
    .unwrap();
    let mut child = ClassBuilder::new("t/Child").super_class("t/Parent");
    let init = default_constructor(&mut child);
    let child_class = child.pool().class("t/Child");
    let child_init = child.pool().method_ref("t/Child", "<init>", "()V");
    let grand_name = child.pool().method_ref("t/Grand", "name", "()I");
    // new Child; dup; invokespecial <init>; invokespecial Grand.name; ireturn
    let child = jvm
        .define_class(child.method(init).method(MethodBuilder::new("run", "()I").access(STATIC).code(
            2,
            0,
            code(&[
                &op(0xbb, child_class),
                &[0x59],
                &op(0xb7, child_init),
                &op(0xb7, grand_name),
                &[0xac],
            ]),
        )))
        .unwrap();

    assert!(!child.constant_pool.is_resolved(grand_name));
    assert_eq!(run(jvm.clone(), &child, "run", "()I", &[]).ok(), Some(Value::Int(2)));
    assert!(child.constant_pool.is_resolved(grand_name));
    assert_eq!(run(jvm, &child, "run", "()I", &[]).ok(), Some(Value::Int(2)));
}

/// Runs `Shape.area` through invokeinterface on a new `implementor`.
fn area_of(jvm: Arc<Jvm>, implementor: &str) -> Result<Value, RuntimeError> {
    let mut main = ClassBuilder::new(&format!("{}Caller", implementor));
    let class = main.pool().class(implementor);
    let init = main.pool().method_ref(implementor, "<init>", "()V");
    let area = main.pool().interface_method_ref("t/Shape", "area", "()I");
    let main = jvm
        .define_class(main.method(MethodBuilder::new("run", "()I").access(STATIC).code(
            2,
            0,
            code(&[&op(0xbb, class), &[0x59], &op(0xb7, init), &op(0xb9, area), &[1, 0, 0xac]]),
        )))
        .unwrap();
    run(jvm, &main, "run", "()I", &[])
}

#[test]
fn invokeinterface_checks_selected_method() {
    let jvm = Jvm::new(Config::default()).unwrap();
    jvm.define_class(
        ClassBuilder::new("t/Shape")
            .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .method(MethodBuilder::new("area", "()I").access(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)),
    )
    .unwrap();
    let mut hidden = ClassBuilder::new("t/Hidden").interface("t/Shape");
    let init = default_constructor(&mut hidden);
    jvm.define_class(
        hidden
            .method(init)
            .method(MethodBuilder::new("area", "()I").access(AccessFlags::empty()).code(1, 1, vec![0x04, 0xac])),
    )
    .unwrap();
    let mut partial = ClassBuilder::new("t/Partial").interface("t/Shape");
    let init = default_constructor(&mut partial);
    jvm.define_class(partial.method(init)).unwrap();

    assert_eq!(uncaught_class(area_of(jvm.clone(), "t/Hidden")), "java/lang/IllegalAccessError");
    assert_eq!(uncaught_class(area_of(jvm, "t/Partial")), "java/lang/AbstractMethodError");
}

#[test]
fn second_thread_waits_for_class_initialization() {
    let jvm = Jvm::new(Config::default()).unwrap();
    let started = Arc::new(Barrier::new(2));
    let in_clinit = started.clone();
    jvm.natives
        .register("t/Slow", "pause", "()V", move |_: &mut Thread| -> NativeResult<()> {
            in_clinit.wait();
            thread::sleep(Duration::from_millis(100));
            Ok(())
        })
        .unwrap();
    let mut slow = ClassBuilder::new("t/Slow");
    let pause = slow.pool().method_ref("t/Slow", "pause", "()V");
    let runs = slow.pool().field_ref("t/Slow", "runs", "I");
    // pause(); runs = runs + 1;
    let clinit = code(&[&op(0xb8, pause), &op(0xb2, runs), &[0x04, 0x60], &op(0xb3, runs), &[0xb1]]);
    let slow = jvm
        .define_class(
            slow.field(FieldBuilder::new("runs", "I", STATIC))
                .method(MethodBuilder::new("pause", "()V").access(STATIC | AccessFlags::NATIVE))
                .method(MethodBuilder::new("<clinit>", "()V").access(STATIC).code(2, 0, clinit))
                .method(
                    MethodBuilder::new("runs", "()I")
                        .access(STATIC)
                        .code(1, 0, code(&[&op(0xb2, runs), &[0xac]])),
                ),
        )
        .unwrap();

    let first = {
        let (jvm, slow) = (jvm.clone(), slow.clone());
        thread::spawn(move || run(jvm, &slow, "runs", "()I", &[]))
    };
    started.wait();
    assert!(matches!(slow.init_state(), InitState::InProgress(_)));
    let second = run(jvm, &slow, "runs", "()I", &[]);

    assert_eq!(second.ok(), Some(Value::Int(1)));
    assert_eq!(first.join().unwrap().ok(), Some(Value::Int(1)));
    assert_eq!(slow.init_state(), InitState::Initialized);
}
