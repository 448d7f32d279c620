//! Shared helpers for the interpreter integration tests.
//!
//! The compiler front-end is an external collaborator, so these tests
//! hand-assemble bytecode with the instruction encoders and feed it to the
//! VM the same way a deserialized executable would be.
#![allow(dead_code)]

use gravity::core::object::{GravityClosure, GravityFunction, GravityObject, NativeCode};
use gravity::{GcRef, GravityVm, Value};

/// Build a Native function from raw bytecode and a constant pool.
/// `nlocals` must cover every register the body touches.
pub fn native_function(
    vm: &mut GravityVm,
    name: &str,
    nparams: u16,
    nlocals: u16,
    nupvalues: u16,
    bytecode: Vec<u32>,
    cpool: Vec<Value>,
) -> GcRef {
    let code = NativeCode {
        bytecode,
        cpool,
        ..Default::default()
    };
    let mut f = GravityFunction::native(Some(name.to_string()), nparams, nlocals, code);
    f.nupvalues = nupvalues;
    vm.alloc(GravityObject::Function(f))
}

pub fn closure_of(vm: &mut GravityVm, func: GcRef) -> GcRef {
    vm.alloc(GravityObject::Closure(GravityClosure::new(func, 0)))
}

/// Run a top-level closure with a null receiver and no arguments.
pub fn run(vm: &mut GravityVm, closure: GcRef) -> Value {
    vm.run_closure(closure, Value::Null, &[])
        .expect("execution should succeed")
}

pub fn expect_int(vm: &GravityVm, v: Value) -> i64 {
    match v {
        Value::Int(n) => n,
        other => panic!("expected Int, got {:?} ({})", other, v.type_name(vm.heap())),
    }
}

pub fn string_value_of(vm: &GravityVm, v: Value) -> String {
    gravity::core::value::value_display(vm.heap(), v)
}
