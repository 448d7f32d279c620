//! End-to-end interpreter tests over hand-assembled bytecode.
//!
//! These cover:
//!   • arithmetic fast paths and the numeric/string operand contract
//!   • JUMP/JUMPF control flow (counting loop)
//!   • closure capture, upvalue sharing and close-on-return
//!   • map literals, dot sugar and the count property
//!   • inheritance with super dispatch
//!   • string split/join round trip

mod common;

use common::{closure_of, expect_int, native_function, run, string_value_of};
use gravity::bytecode::{Instr, Op, CPOOL_VALUE_NULL};
use gravity::core::object::GravityObject;
use gravity::core::oop::{class_bind, class_lookup, class_new_pair};
use gravity::core::value::value_equals;
use gravity::{GravityError, GravityVm, Value};

// ─── Arithmetic & control flow ───────────────────────────────────────────────

#[test]
fn int_fast_path_arithmetic() {
    let mut vm = GravityVm::new_default();
    // return (7 + 3) * 2 - 5
    let code = vec![
        Instr::asb(Op::LoadI, 1, 7).0,
        Instr::asb(Op::LoadI, 2, 3).0,
        Instr::abc(Op::Add, 3, 1, 2).0,
        Instr::asb(Op::LoadI, 4, 2).0,
        Instr::abc(Op::Mul, 3, 3, 4).0,
        Instr::asb(Op::LoadI, 4, 5).0,
        Instr::abc(Op::Sub, 3, 3, 4).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "arith", 1, 4, 0, code, vec![]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 15);
}

#[test]
fn mixed_int_float_promotes() {
    let mut vm = GravityVm::new_default();
    // return 1 + 2.5
    let k = Value::Float(2.5);
    let code = vec![
        Instr::asb(Op::LoadI, 1, 1).0,
        Instr::ab(Op::LoadK, 2, 0).0,
        Instr::abc(Op::Add, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "mix", 1, 3, 0, code, vec![k]);
    let c = closure_of(&mut vm, f);
    match run(&mut vm, c) {
        Value::Float(f) => assert!((f - 3.5).abs() < 1e-9),
        other => panic!("expected Float, got {:?}", other),
    }
}

#[test]
fn null_behaves_as_zero_in_arithmetic() {
    let mut vm = GravityVm::new_default();
    // return null + 41
    let code = vec![
        Instr::ab(Op::LoadK, 1, CPOOL_VALUE_NULL).0,
        Instr::asb(Op::LoadI, 2, 41).0,
        Instr::abc(Op::Add, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "nullmath", 1, 3, 0, code, vec![]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 41);
}

#[test]
fn division_by_zero_raises() {
    let mut vm = GravityVm::new_default();
    let code = vec![
        Instr::asb(Op::LoadI, 1, 10).0,
        Instr::asb(Op::LoadI, 2, 0).0,
        Instr::abc(Op::Div, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "divzero", 1, 3, 0, code, vec![]);
    let c = closure_of(&mut vm, f);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        GravityError::Runtime { message } => assert!(message.contains("Division by 0")),
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn string_right_operand_of_numeric_add_raises() {
    let mut vm = GravityVm::new_default();
    let s = vm.new_string("x");
    let code = vec![
        Instr::asb(Op::LoadI, 1, 5).0,
        Instr::ab(Op::LoadK, 2, 0).0,
        Instr::abc(Op::Add, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "badadd", 1, 3, 0, code, vec![s]);
    let c = closure_of(&mut vm, f);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        GravityError::Runtime { message } => {
            assert!(message.contains("Right operand must be a number"))
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn string_concat_through_method_dispatch() {
    let mut vm = GravityVm::new_default();
    let a = vm.new_string("gra");
    let b = vm.new_string("vity");
    let code = vec![
        Instr::ab(Op::LoadK, 1, 0).0,
        Instr::ab(Op::LoadK, 2, 1).0,
        Instr::abc(Op::Add, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "concat", 1, 3, 0, code, vec![a, b]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(string_value_of(&vm, result), "gravity");
}

#[test]
fn counting_loop_with_jumpf() {
    let mut vm = GravityVm::new_default();
    // acc = 0; i = 0; while i < 10 { acc += i; i += 1 }; return acc
    let code = vec![
        Instr::asb(Op::LoadI, 1, 0).0,          // 0: acc = 0
        Instr::asb(Op::LoadI, 2, 0).0,          // 1: i = 0
        Instr::asb(Op::LoadI, 3, 10).0,         // 2: limit
        Instr::abc(Op::Lt, 4, 2, 3).0,          // 3: r4 = i < 10
        Instr::afb(Op::JumpF, 4, true, 9).0,    // 4: exit when false
        Instr::abc(Op::Add, 1, 1, 2).0,         // 5: acc += i
        Instr::asb(Op::LoadI, 5, 1).0,          // 6
        Instr::abc(Op::Add, 2, 2, 5).0,         // 7: i += 1
        Instr::n26(Op::Jump, 3).0,              // 8: back to test
        Instr::a(Op::Ret, 1).0,                 // 9
    ];
    let f = native_function(&mut vm, "sumloop", 1, 5, 0, code, vec![]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 45);
}

#[test]
fn unflagged_jumpf_converts_truthiness() {
    let mut vm = GravityVm::new_default();
    let empty = vm.new_string("");
    // empty string is false: jump taken, return 1; otherwise return 2
    let code = vec![
        Instr::ab(Op::LoadK, 1, 0).0,
        Instr::afb(Op::JumpF, 1, false, 4).0,
        Instr::asb(Op::LoadI, 2, 2).0,
        Instr::a(Op::Ret, 2).0,
        Instr::asb(Op::LoadI, 2, 1).0,
        Instr::a(Op::Ret, 2).0,
    ];
    let f = native_function(&mut vm, "truthy", 1, 2, 0, code, vec![empty]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 1);
}

// ─── Closures & upvalues ─────────────────────────────────────────────────────

/// make() closes over a counter; three calls through the shared upvalue
/// return 1, 2 and 3.
#[test]
fn closure_counter_shares_upvalue() {
    let mut vm = GravityVm::new_default();

    // inc() { n = n + 1; return n }   (captures n as upvalue 0)
    let inc_code = vec![
        Instr::ab(Op::LoadU, 1, 0).0,
        Instr::asb(Op::LoadI, 2, 1).0,
        Instr::abc(Op::Add, 1, 1, 2).0,
        Instr::ab(Op::StoreU, 1, 0).0,
        Instr::a(Op::Ret, 1).0,
    ];
    let inc = native_function(&mut vm, "inc", 1, 2, 1, inc_code, vec![]);

    // make() { var n = 0; return closure(inc) }
    let make_code = vec![
        Instr::asb(Op::LoadI, 1, 0).0,      // n = 0 (register 1)
        Instr::ab(Op::Closure, 2, 0).0,     // r2 = closure over inc
        Instr::ab(Op::Move, 1, 1).0,        // pseudo word: capture local 1
        Instr::a(Op::Ret, 2).0,
    ];
    let make = native_function(&mut vm, "make", 1, 2, 0, make_code, vec![Value::Object(inc)]);
    let make_closure = closure_of(&mut vm, make);

    // main() { var c = make(); return c() + c() + c() }
    let main_code = vec![
        Instr::ab(Op::LoadK, 3, 0).0,               // make closure
        Instr::ab(Op::LoadK, 4, CPOOL_VALUE_NULL).0,
        Instr::abc(Op::Call, 1, 3, 1).0,            // c = make()
        Instr::ab(Op::Move, 3, 1).0,
        Instr::ab(Op::LoadK, 4, CPOOL_VALUE_NULL).0,
        Instr::abc(Op::Call, 2, 3, 1).0,            // acc = c() -> 1
        Instr::ab(Op::Move, 3, 1).0,
        Instr::ab(Op::LoadK, 4, CPOOL_VALUE_NULL).0,
        Instr::abc(Op::Call, 5, 3, 1).0,            // -> 2
        Instr::abc(Op::Add, 2, 2, 5).0,
        Instr::ab(Op::Move, 3, 1).0,
        Instr::ab(Op::LoadK, 4, CPOOL_VALUE_NULL).0,
        Instr::abc(Op::Call, 5, 3, 1).0,            // -> 3
        Instr::abc(Op::Add, 2, 2, 5).0,
        Instr::a(Op::Ret, 2).0,
    ];
    let main = native_function(
        &mut vm,
        "main",
        1,
        5,
        0,
        main_code,
        vec![Value::Object(make_closure)],
    );
    let main_closure = closure_of(&mut vm, main);

    let result = run(&mut vm, main_closure);
    assert_eq!(expect_int(&vm, result), 6);

    // after the run no open upvalue survives on the fiber
    let fiber = vm.current_fiber();
    assert!(vm.heap().fiber(fiber).upvalues.is_empty());
}

// ─── Map literals and dot sugar ──────────────────────────────────────────────

/// m.k1 + m["k2"] + m.count == 32: entries win over methods on dot access.
#[test]
fn map_dot_sugar_and_count() {
    let mut vm = GravityVm::new_default();
    let k1 = vm.new_string("k1");
    let k2 = vm.new_string("k2");
    let count_key = vm.new_string("count");
    let code = vec![
        Instr::ab(Op::MapNew, 1, 2).0,
        Instr::ab(Op::LoadK, 2, 0).0,           // "k1"
        Instr::asb(Op::LoadI, 3, 10).0,
        Instr::ab(Op::LoadK, 4, 1).0,           // "k2"
        Instr::asb(Op::LoadI, 5, 20).0,
        Instr::abc(Op::SetList, 1, 2, 0).0,     // two key/value pairs
        Instr::ab(Op::LoadK, 6, 0).0,
        Instr::abc(Op::Load, 2, 1, 6).0,        // m.k1 (entry wins)
        Instr::ab(Op::LoadK, 6, 1).0,
        Instr::abc(Op::LoadAt, 3, 1, 6).0,      // m["k2"]
        Instr::ab(Op::LoadK, 6, 2).0,
        Instr::abc(Op::Load, 4, 1, 6).0,        // m.count (computed property)
        Instr::abc(Op::Add, 2, 2, 3).0,
        Instr::abc(Op::Add, 2, 2, 4).0,
        Instr::a(Op::Ret, 2).0,
    ];
    let f = native_function(&mut vm, "mapsugar", 1, 6, 0, code, vec![k1, k2, count_key]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 32);
}

#[test]
fn missing_map_entry_through_loadat_is_null() {
    let mut vm = GravityVm::new_default();
    let k = vm.new_string("missing");
    let code = vec![
        Instr::ab(Op::MapNew, 1, 0).0,
        Instr::ab(Op::LoadK, 2, 0).0,
        Instr::abc(Op::LoadAt, 3, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "mapmiss", 1, 3, 0, code, vec![k]);
    let c = closure_of(&mut vm, f);
    assert_eq!(run(&mut vm, c), Value::Null);
}

// ─── Inheritance & super dispatch ────────────────────────────────────────────

/// class A { f -> 1 }, class B : A { f -> super.f() + 2 }: B().f() == 3.
#[test]
fn super_dispatch_through_loads() {
    let mut vm = GravityVm::new_default();
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;

    let a = class_new_pair(vm.heap_mut(), class_cls, "A", Some(object_cls));
    let b = class_new_pair(vm.heap_mut(), class_cls, "B", Some(a));

    // A.f() -> 1
    let af_code = vec![
        Instr::asb(Op::LoadI, 1, 1).0,
        Instr::a(Op::Ret, 1).0,
    ];
    let af = native_function(&mut vm, "f", 1, 1, 0, af_code, vec![]);
    let af_closure = closure_of(&mut vm, af);
    let fkey = Value::Object(vm.intern("f"));
    class_bind(vm.heap_mut(), a, fkey, Value::Object(af_closure));

    // B.f() -> super.f() + 2
    let fname = vm.new_string("f");
    let bf_code = vec![
        Instr::ab(Op::LoadK, 1, gravity::bytecode::CPOOL_VALUE_SUPER).0,
        Instr::ab(Op::LoadK, 3, 0).0,           // "f"
        Instr::abc(Op::Loads, 2, 1, 3).0,       // A.f closure
        Instr::ab(Op::Move, 3, 2).0,
        Instr::ab(Op::Move, 4, 0).0,            // self stays the B instance
        Instr::abc(Op::Call, 2, 3, 1).0,
        Instr::asb(Op::LoadI, 3, 2).0,
        Instr::abc(Op::Add, 1, 2, 3).0,
        Instr::a(Op::Ret, 1).0,
    ];
    let bf = native_function(&mut vm, "f", 1, 4, 0, bf_code, vec![fname]);
    let bf_closure = closure_of(&mut vm, bf);
    class_bind(vm.heap_mut(), b, fkey, Value::Object(bf_closure));

    // main() { return B().f() }
    let fname2 = vm.new_string("f");
    let main_code = vec![
        Instr::ab(Op::LoadK, 3, 0).0,           // class B
        Instr::ab(Op::Move, 4, 3).0,            // receiver = class
        Instr::abc(Op::Call, 1, 3, 1).0,        // instance = B()
        Instr::ab(Op::LoadK, 4, 1).0,           // "f"
        Instr::abc(Op::Load, 2, 1, 4).0,        // method lookup on the instance
        Instr::ab(Op::Move, 3, 2).0,
        Instr::ab(Op::Move, 4, 1).0,            // self = instance
        Instr::abc(Op::Call, 2, 3, 1).0,
        Instr::a(Op::Ret, 2).0,
    ];
    let main = native_function(
        &mut vm,
        "main",
        1,
        4,
        0,
        main_code,
        vec![Value::Object(b), fname2],
    );
    let main_closure = closure_of(&mut vm, main);
    let result = run(&mut vm, main_closure);
    assert_eq!(expect_int(&vm, result), 3);
}

#[test]
fn method_lookup_walks_superclass_chain() {
    let mut vm = GravityVm::new_default();
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;
    let a = class_new_pair(vm.heap_mut(), class_cls, "Base", Some(object_cls));
    let b = class_new_pair(vm.heap_mut(), class_cls, "Derived", Some(a));

    let key = Value::Object(vm.intern("answer"));
    class_bind(vm.heap_mut(), a, key, Value::Int(42));

    // monotone lookup: the subclass sees the parent binding until it shadows
    assert_eq!(class_lookup(vm.heap(), b, key), Some(Value::Int(42)));
    class_bind(vm.heap_mut(), b, key, Value::Int(7));
    assert_eq!(class_lookup(vm.heap(), b, key), Some(Value::Int(7)));
    assert_eq!(class_lookup(vm.heap(), a, key), Some(Value::Int(42)));
}

#[test]
fn isa_walks_the_chain() {
    let mut vm = GravityVm::new_default();
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;
    let a = class_new_pair(vm.heap_mut(), class_cls, "A", Some(object_cls));
    let b = class_new_pair(vm.heap_mut(), class_cls, "B", Some(a));

    // B() isa A  &&  B() isa Object
    let main_code = vec![
        Instr::ab(Op::LoadK, 3, 0).0,
        Instr::ab(Op::Move, 4, 3).0,
        Instr::abc(Op::Call, 1, 3, 1).0,     // instance of B
        Instr::ab(Op::LoadK, 2, 1).0,        // class A
        Instr::abc(Op::IsA, 5, 1, 2).0,
        Instr::ab(Op::LoadK, 2, 2).0,        // class Object
        Instr::abc(Op::IsA, 6, 1, 2).0,
        Instr::abc(Op::Band, 5, 5, 6).0,
        Instr::a(Op::Ret, 5).0,
    ];
    let main = native_function(
        &mut vm,
        "main",
        1,
        6,
        0,
        main_code,
        vec![Value::Object(b), Value::Object(a), Value::Object(object_cls)],
    );
    let c = closure_of(&mut vm, main);
    assert_eq!(run(&mut vm, c), Value::Bool(true));
}

// ─── Instance variables ──────────────────────────────────────────────────────

#[test]
fn ivar_load_store_through_inline_int_keys() {
    let mut vm = GravityVm::new_default();
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;
    let point = class_new_pair(vm.heap_mut(), class_cls, "Point", Some(object_cls));
    vm.heap_mut().class_mut(point).grow_ivars(2);

    // main: p = Point(); p[ivar0] = 11; p[ivar1] = 31; return p[0] + p[1]
    let main_code = vec![
        Instr::ab(Op::LoadK, 3, 0).0,
        Instr::ab(Op::Move, 4, 3).0,
        Instr::abc(Op::Call, 1, 3, 1).0,            // p = Point()
        Instr::asb(Op::LoadI, 2, 11).0,
        Instr::abc(Op::Store, 2, 1, 256).0,         // p[0] = 11 (inline int key)
        Instr::asb(Op::LoadI, 2, 31).0,
        Instr::abc(Op::Store, 2, 1, 257).0,         // p[1] = 31
        Instr::abc(Op::Load, 5, 1, 256).0,
        Instr::abc(Op::Load, 6, 1, 257).0,
        Instr::abc(Op::Add, 5, 5, 6).0,
        Instr::a(Op::Ret, 5).0,
    ];
    let main = native_function(&mut vm, "main", 1, 6, 0, main_code, vec![Value::Object(point)]);
    let c = closure_of(&mut vm, main);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 42);
}

#[test]
fn ivar_out_of_bounds_raises() {
    let mut vm = GravityVm::new_default();
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;
    let empty = class_new_pair(vm.heap_mut(), class_cls, "Empty", Some(object_cls));

    let main_code = vec![
        Instr::ab(Op::LoadK, 3, 0).0,
        Instr::ab(Op::Move, 4, 3).0,
        Instr::abc(Op::Call, 1, 3, 1).0,
        Instr::abc(Op::Load, 2, 1, 256).0,   // no ivars declared
        Instr::a(Op::Ret, 2).0,
    ];
    let main = native_function(&mut vm, "main", 1, 4, 0, main_code, vec![Value::Object(empty)]);
    let c = closure_of(&mut vm, main);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        GravityError::Runtime { message } => assert!(message.contains("Out of bounds ivar index")),
        other => panic!("unexpected error {:?}", other),
    }
}

// ─── Ranges ──────────────────────────────────────────────────────────────────

#[test]
fn rangenew_normalizes_exclusive() {
    let mut vm = GravityVm::new_default();
    // 1..<5 has count 4; 1...5 has count 5
    let count_key = vm.new_string("count");
    let code = vec![
        Instr::asb(Op::LoadI, 1, 1).0,
        Instr::asb(Op::LoadI, 2, 5).0,
        Instr::abcf(Op::RangeNew, 3, 1, 2, 1).0,   // exclusive
        Instr::abcf(Op::RangeNew, 4, 1, 2, 0).0,   // inclusive
        Instr::ab(Op::LoadK, 6, 0).0,
        Instr::abc(Op::Load, 5, 3, 6).0,
        Instr::abc(Op::Load, 6, 4, 6).0,
        Instr::abc(Op::Add, 5, 5, 6).0,
        Instr::a(Op::Ret, 5).0,
    ];
    let f = native_function(&mut vm, "ranges", 1, 6, 0, code, vec![count_key]);
    let c = closure_of(&mut vm, f);
    let result = run(&mut vm, c);
    assert_eq!(expect_int(&vm, result), 9);
}

#[test]
fn rangenew_requires_ints() {
    let mut vm = GravityVm::new_default();
    let half = Value::Float(0.5);
    let code = vec![
        Instr::ab(Op::LoadK, 1, 0).0,
        Instr::asb(Op::LoadI, 2, 5).0,
        Instr::abcf(Op::RangeNew, 3, 1, 2, 0).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "badrange", 1, 3, 0, code, vec![half]);
    let c = closure_of(&mut vm, f);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        GravityError::Runtime { message } => {
            assert!(message.contains("Unable to build Range from a non Int value"))
        }
        other => panic!("unexpected error {:?}", other),
    }
}

// ─── String split & join ─────────────────────────────────────────────────────

#[test]
fn string_split_join_round_trip() {
    let mut vm = GravityVm::new_default();
    let s = vm.new_string("a,b,,c");
    let sep = vm.new_string(",");

    let string_cls = vm.core_classes().string;
    let split_key = Value::Object(vm.intern("split"));
    let split = class_lookup(vm.heap(), string_cls, split_key).expect("String.split");
    let split_closure = split.as_object().unwrap();

    let list = vm
        .run_closure(split_closure, s, &[sep])
        .expect("split should succeed");
    let list_ref = list.as_object().expect("split returns a List");
    match vm.heap().get(list_ref) {
        GravityObject::List(l) => {
            assert_eq!(l.items.len(), 4);
            // the empty middle segment is preserved
            assert_eq!(string_value_of(&vm, l.items[2]), "");
        }
        other => panic!("expected List, got {:?}", other),
    }

    let list_cls = vm.core_classes().list;
    let join_key = Value::Object(vm.intern("join"));
    let join = class_lookup(vm.heap(), list_cls, join_key).expect("List.join");
    let join_closure = join.as_object().unwrap();
    let joined = vm
        .run_closure(join_closure, list, &[sep])
        .expect("join should succeed");
    assert_eq!(string_value_of(&vm, joined), "a,b,,c");
}

// ─── Equality opcodes ────────────────────────────────────────────────────────

#[test]
fn eqq_checks_class_identity() {
    let mut vm = GravityVm::new_default();
    // 1 === 1.0 is false, 1 == 1.0 is true
    let one_float = Value::Float(1.0);
    let code = vec![
        Instr::asb(Op::LoadI, 1, 1).0,
        Instr::ab(Op::LoadK, 2, 0).0,
        Instr::abc(Op::Eqq, 3, 1, 2).0,
        Instr::abc(Op::Eq, 4, 1, 2).0,
        Instr::a(Op::Ret, 3).0,
    ];
    let f = native_function(&mut vm, "eqq", 1, 4, 0, code, vec![one_float]);
    let c = closure_of(&mut vm, f);
    assert_eq!(run(&mut vm, c), Value::Bool(false));

    let heap = vm.heap();
    assert!(value_equals(heap, Value::Int(1), Value::Float(1.0)));
}

#[test]
fn undefined_global_raises() {
    let mut vm = GravityVm::new_default();
    let key = vm.new_string("noSuchGlobal");
    let code = vec![
        Instr::ab(Op::LoadG, 1, 0).0,
        Instr::a(Op::Ret, 1).0,
    ];
    let f = native_function(&mut vm, "missing", 1, 1, 0, code, vec![key]);
    let c = closure_of(&mut vm, f);
    let err = vm.run_closure(c, Value::Null, &[]).unwrap_err();
    match err {
        GravityError::Runtime { message } => {
            assert!(message.contains("Unable to find object noSuchGlobal"))
        }
        other => panic!("unexpected error {:?}", other),
    }
}
