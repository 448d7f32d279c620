//! Fiber switching, yield/resume, try/abort and yieldWaitTime.

mod common;

use common::{closure_of, native_function, run};
use gravity::bytecode::{Instr, Op};
use gravity::core::object::GravityObject;
use gravity::fiber::FiberStatus;
use gravity::{GravityVm, Value};

/// Assemble `Fiber.<method>(args...)` as a call sequence inside a function
/// body. Registers: r1 = Fiber class, r2..r7 scratch.
fn fiber_static_call(code: &mut Vec<u32>, key_index: u32, fiber_global_index: u32, arg: Option<i32>) {
    code.push(Instr::ab(Op::LoadG, 1, fiber_global_index).0);
    code.push(Instr::ab(Op::LoadK, 6, key_index).0);
    code.push(Instr::abc(Op::Load, 3, 1, 6).0);     // method closure
    code.push(Instr::ab(Op::Move, 4, 1).0);          // receiver = Fiber class
    match arg {
        Some(n) => {
            code.push(Instr::asb(Op::LoadI, 5, n).0);
            code.push(Instr::abc(Op::Call, 2, 3, 2).0);
        }
        None => {
            code.push(Instr::abc(Op::Call, 2, 3, 1).0);
        }
    }
}

/// A fiber that yields 10, 20, 30 and then terminates; four calls see
/// 10, 20, 30, null and the fiber reports done.
#[test]
fn fiber_ping_pong() {
    let mut vm = GravityVm::new_default();

    // fiber body: Fiber.yield(10); Fiber.yield(20); Fiber.yield(30)
    let fiber_key = vm.new_string("Fiber");
    let yield_key = vm.new_string("yield");
    let mut body_code = Vec::new();
    for v in [10, 20, 30] {
        fiber_static_call(&mut body_code, 1, 0, Some(v));
    }
    body_code.push(Instr::none(Op::Ret0).0);
    let body = native_function(&mut vm, "pingpong", 1, 7, 0, body_code, vec![fiber_key, yield_key]);
    let body_closure = closure_of(&mut vm, body);

    // main: f = Fiber.create(body); out = []; 4x out.push(f.call()); push f.isDone()
    let fiber_key2 = vm.new_string("Fiber");
    let create_key = vm.new_string("create");
    let call_key = vm.new_string("call");
    let done_key = vm.new_string("isDone");
    let cpool = vec![
        fiber_key2,                     // 0
        create_key,                     // 1
        Value::Object(body_closure),    // 2
        call_key,                       // 3
        done_key,                       // 4
    ];

    let mut main_code = Vec::new();
    // r2 = Fiber.create(body)
    main_code.push(Instr::ab(Op::LoadG, 1, 0).0);
    main_code.push(Instr::ab(Op::LoadK, 6, 1).0);
    main_code.push(Instr::abc(Op::Load, 4, 1, 6).0);
    main_code.push(Instr::ab(Op::Move, 5, 1).0);
    main_code.push(Instr::ab(Op::LoadK, 6, 2).0);
    main_code.push(Instr::abc(Op::Call, 2, 4, 2).0);
    // r3 = result list
    main_code.push(Instr::ab(Op::ListNew, 3, 5).0);
    for i in 0..4u32 {
        main_code.push(Instr::ab(Op::LoadK, 6, 3).0);
        main_code.push(Instr::abc(Op::Load, 4, 2, 6).0);   // f.call
        main_code.push(Instr::ab(Op::Move, 5, 2).0);       // receiver = fiber
        main_code.push(Instr::abc(Op::Call, 7, 4, 1).0);   // r7 = f.call()
        main_code.push(Instr::abc(Op::StoreAt, 7, 3, (256 + i) as u16).0);
    }
    // f.isDone()
    main_code.push(Instr::ab(Op::LoadK, 6, 4).0);
    main_code.push(Instr::abc(Op::Load, 4, 2, 6).0);
    main_code.push(Instr::ab(Op::Move, 5, 2).0);
    main_code.push(Instr::abc(Op::Call, 7, 4, 1).0);
    main_code.push(Instr::abc(Op::StoreAt, 7, 3, 260).0);
    main_code.push(Instr::a(Op::Ret, 3).0);

    let main = native_function(&mut vm, "main", 1, 7, 0, main_code, cpool);
    let main_closure = closure_of(&mut vm, main);
    let result = run(&mut vm, main_closure);

    let list = result.as_object().expect("main returns a list");
    match vm.heap().get(list) {
        GravityObject::List(l) => {
            assert_eq!(l.items.len(), 5);
            assert_eq!(l.items[0], Value::Int(10));
            assert_eq!(l.items[1], Value::Int(20));
            assert_eq!(l.items[2], Value::Int(30));
            assert_eq!(l.items[3], Value::Null);
            assert_eq!(l.items[4], Value::Bool(true));
        }
        other => panic!("expected List, got {:?}", other),
    }
}

#[test]
fn fiber_status_transitions() {
    let mut vm = GravityVm::new_default();

    // body yields once then returns 99
    let fiber_key = vm.new_string("Fiber");
    let yield_key = vm.new_string("yield");
    let mut body_code = Vec::new();
    fiber_static_call(&mut body_code, 1, 0, Some(1));
    body_code.push(Instr::asb(Op::LoadI, 2, 99).0);
    body_code.push(Instr::a(Op::Ret, 2).0);
    let body = native_function(&mut vm, "once", 1, 7, 0, body_code, vec![fiber_key, yield_key]);
    let body_closure = closure_of(&mut vm, body);

    let fiber = vm.new_fiber(body_closure);
    assert_eq!(vm.heap().fiber(fiber).status, FiberStatus::NeverExecuted);

    // drive it through the public fiber methods
    let fiber_val = Value::Object(fiber);
    let call_key = Value::Object(vm.intern("call"));
    let fiber_cls = vm.core_classes().fiber;
    let call = gravity::core::oop::class_lookup(vm.heap(), fiber_cls, call_key)
        .and_then(|v| v.as_object())
        .expect("Fiber.call");

    let first = vm.run_closure(call, fiber_val, &[]).expect("first call");
    assert_eq!(first, Value::Int(1));
    assert!(!vm.heap().fiber(fiber).is_done());

    let second = vm.run_closure(call, fiber_val, &[]).expect("second call");
    assert_eq!(second, Value::Int(99));
    assert!(vm.heap().fiber(fiber).is_done());
    assert_eq!(vm.heap().fiber(fiber).status, FiberStatus::Terminated);

    // a terminated fiber cannot be called again
    let err = vm.run_closure(call, fiber_val, &[]);
    assert!(err.is_err());
}

#[test]
fn fiber_try_captures_abort() {
    let mut vm = GravityVm::new_default();

    // body: Fiber.abort("boom")
    let fiber_key = vm.new_string("Fiber");
    let abort_key = vm.new_string("abort");
    let boom = vm.new_string("boom");
    let body_code = vec![
        Instr::ab(Op::LoadG, 1, 0).0,
        Instr::ab(Op::LoadK, 6, 1).0,
        Instr::abc(Op::Load, 3, 1, 6).0,
        Instr::ab(Op::Move, 4, 1).0,
        Instr::ab(Op::LoadK, 5, 2).0,
        Instr::abc(Op::Call, 2, 3, 2).0,
        Instr::none(Op::Ret0).0,
    ];
    let body = native_function(&mut vm, "boomer", 1, 7, 0, body_code, vec![fiber_key, abort_key, boom]);
    let body_closure = closure_of(&mut vm, body);
    let fiber = vm.new_fiber(body_closure);

    let fiber_cls = vm.core_classes().fiber;
    let try_key = Value::Object(vm.intern("try"));
    let try_m = gravity::core::oop::class_lookup(vm.heap(), fiber_cls, try_key)
        .and_then(|v| v.as_object())
        .expect("Fiber.try");

    // the abort is captured by the trying fiber, not propagated
    let result = vm.run_closure(try_m, Value::Object(fiber), &[]).expect("try must not abort the VM");
    assert_eq!(result, Value::Null);
    assert_eq!(vm.heap().fiber(fiber).error.as_deref(), Some("boom"));
    assert_eq!(vm.heap().fiber(fiber).status, FiberStatus::AbortedWithError);
    assert!(vm.heap().fiber(fiber).is_done());
}

#[test]
fn abort_without_try_aborts_the_vm() {
    let mut vm = GravityVm::new_default();

    let fiber_key = vm.new_string("Fiber");
    let abort_key = vm.new_string("abort");
    let msg = vm.new_string("fatal");
    let body_code = vec![
        Instr::ab(Op::LoadG, 1, 0).0,
        Instr::ab(Op::LoadK, 6, 1).0,
        Instr::abc(Op::Load, 3, 1, 6).0,
        Instr::ab(Op::Move, 4, 1).0,
        Instr::ab(Op::LoadK, 5, 2).0,
        Instr::abc(Op::Call, 2, 3, 2).0,
        Instr::none(Op::Ret0).0,
    ];
    let body = native_function(&mut vm, "fatal", 1, 7, 0, body_code, vec![fiber_key, abort_key, msg]);
    let c = closure_of(&mut vm, body);

    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        gravity::GravityError::Runtime { message } => assert_eq!(message, "fatal"),
        other => panic!("unexpected error {:?}", other),
    }
    // the VM is aborted: every entry point is a no-op now
    assert!(vm.run_closure(c, Value::Null, &[]).is_err());
}

#[test]
fn abort_requires_a_string_message() {
    let mut vm = GravityVm::new_default();

    let fiber_key = vm.new_string("Fiber");
    let abort_key = vm.new_string("abort");
    let body_code = vec![
        Instr::ab(Op::LoadG, 1, 0).0,
        Instr::ab(Op::LoadK, 6, 1).0,
        Instr::abc(Op::Load, 3, 1, 6).0,
        Instr::ab(Op::Move, 4, 1).0,
        Instr::asb(Op::LoadI, 5, 123).0,
        Instr::abc(Op::Call, 2, 3, 2).0,
        Instr::none(Op::Ret0).0,
    ];
    let body = native_function(&mut vm, "badabort", 1, 7, 0, body_code, vec![fiber_key, abort_key]);
    let c = closure_of(&mut vm, body);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        gravity::GravityError::Runtime { message } => {
            assert!(message.contains("A string error is expected"))
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn yield_wait_time_gates_resume() {
    let mut vm = GravityVm::new_default();

    // body: Fiber.yieldWaitTime(3600); then return 7 (never reached in test)
    let fiber_key = vm.new_string("Fiber");
    let wait_key = vm.new_string("yieldWaitTime");
    let mut body_code = Vec::new();
    body_code.push(Instr::ab(Op::LoadG, 1, 0).0);
    body_code.push(Instr::ab(Op::LoadK, 6, 1).0);
    body_code.push(Instr::abc(Op::Load, 3, 1, 6).0);
    body_code.push(Instr::ab(Op::Move, 4, 1).0);
    body_code.push(Instr::asb(Op::LoadI, 5, 3600).0);
    body_code.push(Instr::abc(Op::Call, 2, 3, 2).0);
    body_code.push(Instr::asb(Op::LoadI, 2, 7).0);
    body_code.push(Instr::a(Op::Ret, 2).0);
    let body = native_function(&mut vm, "sleeper", 1, 7, 0, body_code, vec![fiber_key, wait_key]);
    let body_closure = closure_of(&mut vm, body);
    let fiber = vm.new_fiber(body_closure);

    let fiber_cls = vm.core_classes().fiber;
    let call_key = Value::Object(vm.intern("call"));
    let call = gravity::core::oop::class_lookup(vm.heap(), fiber_cls, call_key)
        .and_then(|v| v.as_object())
        .expect("Fiber.call");

    // first call runs until the wait; the fiber is suspended with a window
    let first = vm.run_closure(call, Value::Object(fiber), &[]).expect("first call");
    assert_eq!(first, Value::Null);
    assert!(vm.heap().fiber(fiber).timewait > 0.0);
    assert!(!vm.heap().fiber(fiber).is_done());

    // a second call inside the window is a no-op: the body does not advance
    let second = vm.run_closure(call, Value::Object(fiber), &[]).expect("second call");
    assert_eq!(second, Value::Null);
    assert!(!vm.heap().fiber(fiber).is_done());
}

#[test]
fn calling_a_running_fiber_raises() {
    let mut vm = GravityVm::new_default();

    // the body tries to call its own fiber (passed through a global)
    let call_key = vm.new_string("call");
    let body_code = vec![
        Instr::ab(Op::LoadG, 1, 0).0,          // the fiber itself
        Instr::ab(Op::LoadK, 6, 1).0,
        Instr::abc(Op::Load, 3, 1, 6).0,
        Instr::ab(Op::Move, 4, 1).0,
        Instr::abc(Op::Call, 2, 3, 1).0,
        Instr::none(Op::Ret0).0,
    ];
    let selfref = vm.new_string("selfFiber");
    let body = native_function(&mut vm, "reenter", 1, 7, 0, body_code, vec![selfref, call_key]);
    let body_closure = closure_of(&mut vm, body);
    let fiber = vm.new_fiber(body_closure);
    vm.set_value("selfFiber", Value::Object(fiber));

    let fiber_cls = vm.core_classes().fiber;
    let ckey = Value::Object(vm.intern("call"));
    let call = gravity::core::oop::class_lookup(vm.heap(), fiber_cls, ckey)
        .and_then(|v| v.as_object())
        .expect("Fiber.call");

    let err = vm.run_closure(call, Value::Object(fiber), &[]).unwrap_err();
    match err {
        gravity::GravityError::Runtime { message } => {
            assert!(message.contains("Fiber has already been called."))
        }
        other => panic!("unexpected error {:?}", other),
    }
}
