//! Built-in methods for the core classes.
//!
//! Every entry here is an Internal callable registered on a class (or its
//! metaclass for static members) at VM startup. The calling convention
//! follows the embedding API: args[0] is the receiver, the result goes into
//! slot `rindex`, returning false signals an error (fiber error set), a
//! tail-closure request (closure left in `rindex`) or a fiber switch.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::core::object::{
    FunctionKind, GravityClosure, GravityFunction, GravityObject, GravityString, COMPUTED_INDEX,
};
use crate::core::oop::{
    class_bind, class_lookup, instance_anon_class, instance_new, CoreClasses,
};
use crate::core::value::{
    convert_to_bool, convert_to_float, convert_to_int, value_compare, value_display, value_equals,
    Value,
};
use crate::fiber::FiberStatus;
use crate::gc::GcRef;
use crate::vm::GravityVm;

const MAX_ALLOCATION: i64 = 4_194_304;

// ─── Native return protocol ───────────────────────────────────────────────────

macro_rules! ret {
    ($vm:expr, $rindex:expr, $v:expr) => {{
        $vm.set_slot($rindex, $v);
        return true;
    }};
}

macro_rules! ret_error {
    ($vm:expr, $rindex:expr, $($arg:tt)*) => {{
        $vm.set_slot($rindex, Value::Null);
        $vm.fiber_error(format!($($arg)*));
        return false;
    }};
}

// ─── Conversion helpers (class-method override aware) ─────────────────────────

fn to_int(vm: &mut GravityVm, v: Value) -> Option<i64> {
    if let Some(n) = convert_to_int(&vm.heap, v) {
        return Some(n);
    }
    let key = vm.vkeys.int;
    match vm.convert_dispatch(v, key)? {
        Value::Int(n) => Some(n),
        Value::Float(f) => Some(f as i64),
        _ => None,
    }
}

fn to_float(vm: &mut GravityVm, v: Value) -> Option<f64> {
    if let Some(f) = convert_to_float(&vm.heap, v) {
        return Some(f);
    }
    let key = vm.vkeys.float;
    match vm.convert_dispatch(v, key)? {
        Value::Float(f) => Some(f),
        Value::Int(n) => Some(n as f64),
        _ => None,
    }
}

/// Render any value to text, honoring instance String methods and bridged
/// string callbacks.
pub fn to_display(vm: &mut GravityVm, v: Value) -> String {
    if let Some(r) = v.as_object() {
        let is_instance = matches!(vm.heap.get(r), GravityObject::Instance(_));
        if is_instance {
            let bridged = {
                let i = vm.heap.instance(r);
                i.xdata
                    .as_ref()
                    .and_then(|x| vm.delegate.bridge_string(x.0.as_ref()))
            };
            if let Some(s) = bridged {
                return s;
            }
            let key = vm.vkeys.string;
            if let Some(sv) = vm.convert_dispatch(v, key) {
                if sv.is_string(&vm.heap) {
                    return value_display(&vm.heap, sv);
                }
            }
        }
    }
    value_display(&vm.heap, v)
}

// ─── Registration helpers ─────────────────────────────────────────────────────

fn bind(vm: &mut GravityVm, class: GcRef, name: &str, nparams: u16, f: crate::core::object::InternalFn) {
    let key = vm.intern(name);
    let closure = vm.new_internal_closure(name, nparams, f);
    class_bind(&mut vm.heap, class, Value::Object(key), closure);
}

fn meta_of(vm: &GravityVm, class: GcRef) -> GcRef {
    vm.heap.class(class).meta.expect("core class without metaclass")
}

/// Bind a computed property backed by internal getter/setter callables.
fn bind_property(
    vm: &mut GravityVm,
    class: GcRef,
    name: &str,
    getter: crate::core::object::InternalFn,
    setter: Option<crate::core::object::InternalFn>,
) {
    let gfn = vm.alloc(GravityObject::Function(GravityFunction::internal(name, 0, getter)));
    vm.heap.temp_push(gfn);
    let gcl = vm.alloc(GravityObject::Closure(GravityClosure::new(gfn, 0)));
    vm.heap.temp_pop();
    vm.heap.temp_push(gcl);

    let scl = setter.map(|s| {
        let sfn = vm.alloc(GravityObject::Function(GravityFunction::internal(name, 1, s)));
        vm.heap.temp_push(sfn);
        let c = vm.alloc(GravityObject::Closure(GravityClosure::new(sfn, 0)));
        vm.heap.temp_pop();
        c
    });
    if let Some(s) = scl {
        vm.heap.temp_push(s);
    }

    let special = vm.alloc(GravityObject::Function(GravityFunction::special(
        COMPUTED_INDEX,
        Some(gcl),
        scl,
    )));
    vm.heap.temp_push(special);
    let wrapper = vm.alloc(GravityObject::Closure(GravityClosure::new(special, 0)));
    vm.heap.temp_pop();
    if scl.is_some() {
        vm.heap.temp_pop();
    }
    vm.heap.temp_pop();

    let key = vm.intern(name);
    class_bind(&mut vm.heap, class, Value::Object(key), Value::Object(wrapper));
}

/// Wire every built-in method; called once from GravityVm::new with the
/// collector off.
pub fn register_core(vm: &mut GravityVm) {
    let core = *vm.core_classes();

    register_object(vm, &core);
    register_class(vm, &core);
    register_null(vm, &core);
    register_bool(vm, &core);
    register_int(vm, &core);
    register_float(vm, &core);
    register_string(vm, &core);
    register_list(vm, &core);
    register_map(vm, &core);
    register_range(vm, &core);
    register_function(vm, &core);
    register_fiber(vm, &core);
    register_system(vm, &core);

    // expose the core classes as globals so LOADG finds them
    for (name, r) in [
        ("Object", core.object),
        ("Class", core.class),
        ("Null", core.null),
        ("Bool", core.bool_),
        ("Int", core.int),
        ("Float", core.float),
        ("String", core.string),
        ("Func", core.func),
        ("Closure", core.closure),
        ("Fiber", core.fiber),
        ("Instance", core.instance),
        ("List", core.list),
        ("Map", core.map),
        ("Range", core.range),
        ("Upvalue", core.upvalue),
        ("Module", core.module),
        ("System", core.system),
    ] {
        vm.set_value(name, Value::Object(r));
    }
}

fn is_core_class(core: &CoreClasses, r: GcRef) -> bool {
    core.all().contains(&r)
}

// ─── Object ───────────────────────────────────────────────────────────────────

fn register_object(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.object;
    bind(vm, c, "class", 1, object_class);
    bind(vm, c, "==", 2, object_cmp);
    bind(vm, c, "is", 2, object_is);
    bind(vm, c, "!", 1, object_not);
    bind(vm, c, "load", 2, object_load);
    bind(vm, c, "loads", 2, object_loads);
    bind(vm, c, "loadat", 2, object_load);
    bind(vm, c, "store", 3, object_store);
    bind(vm, c, "storeat", 3, object_store);
    bind(vm, c, "bind", 3, object_bind_method);
    bind(vm, c, "unbind", 2, object_unbind);
    bind(vm, c, "clone", 1, object_clone);
    bind(vm, c, "exec", 1, object_exec);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
}

fn object_class(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let v = vm.class_of(args[0]).map(Value::Object).unwrap_or(Value::Null);
    ret!(vm, rindex, v)
}

/// Three-way comparison; the comparison opcodes fold the result to a Bool.
fn object_cmp(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    // bridged instances delegate equality to the embedder
    if let (Some(a), Some(b)) = (args[0].as_object(), args[1].as_object()) {
        let bridged_eq: Option<bool> = {
            match (vm.heap.get(a), vm.heap.get(b)) {
                (GravityObject::Instance(i1), GravityObject::Instance(i2)) => {
                    match (&i1.xdata, &i2.xdata) {
                        (Some(x1), Some(x2)) => {
                            Some(vm.delegate.bridge_equals(x1.0.as_ref(), x2.0.as_ref()))
                        }
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        if let Some(eq) = bridged_eq {
            ret!(vm, rindex, Value::Int(if eq { 0 } else { 1 }));
        }
    }
    let cmp = value_compare(&vm.heap, args[0], args[1])
        .unwrap_or(if value_equals(&vm.heap, args[0], args[1]) { 0 } else { 1 });
    ret!(vm, rindex, Value::Int(cmp))
}

fn object_is(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(target) = args
        .get(1)
        .and_then(|v| v.as_object())
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Class(_)))
    else {
        ret_error!(vm, rindex, "Right operand must be a Class in isa comparison");
    };
    let result = vm
        .class_of(args[0])
        .map(|c| crate::core::oop::class_is_a(&vm.heap, c, target))
        .unwrap_or(false);
    ret!(vm, rindex, Value::Bool(result))
}

fn object_not(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let b = convert_to_bool(&vm.heap, args[0]);
    ret!(vm, rindex, Value::Bool(!b))
}

/// Is the stored method-table value a Special (computed property) closure?
fn special_parts(vm: &GravityVm, v: Value) -> Option<(u32, Option<GcRef>, Option<GcRef>)> {
    let r = v.as_object()?;
    let func = match vm.heap.get(r) {
        GravityObject::Closure(c) => c.func,
        GravityObject::Function(_) => r,
        _ => return None,
    };
    match &vm.heap.function(func).kind {
        FunctionKind::Special { index, getter, setter } => Some((*index, *getter, *setter)),
        _ => None,
    }
}

fn object_load(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let target = args[0];
    let key = args[1];

    // integer key: direct ivar slot
    if let Value::Int(n) = key {
        if let Some(r) = target.as_object() {
            let slot: Option<(Option<Value>, bool)> = match vm.heap.get(r) {
                GravityObject::Instance(i) => Some((i.ivars.get(n as usize).copied(), false)),
                GravityObject::Class(c) => Some((c.ivars.get(n as usize).copied(), true)),
                _ => None,
            };
            match slot {
                Some((Some(v), _)) => ret!(vm, rindex, v),
                Some((None, false)) => {
                    ret_error!(vm, rindex, "Out of bounds ivar index in load operation (1).")
                }
                Some((None, true)) => {
                    ret_error!(vm, rindex, "Out of bounds ivar index in load operation (2).")
                }
                None => ret_error!(vm, rindex, "An integer index can only load an ivar slot."),
            }
        }
    }

    let Some(class) = vm.class_of(target) else {
        ret_error!(vm, rindex, "Unable to load from an invalid value.");
    };
    if !key.is_string(&vm.heap) {
        let cname = vm.heap.class(class).identifier.clone();
        ret_error!(vm, rindex, "Unable to lookup non string value into class {}", cname);
    }

    if let Some(found) = class_lookup(&vm.heap, class, key) {
        if let Some((index, getter, _)) = special_parts(vm, found) {
            // plain indexed accessor reads the ivar directly
            if index != COMPUTED_INDEX && getter.is_none() {
                if let Some(r) = target.as_object() {
                    let slot = match vm.heap.get(r) {
                        GravityObject::Instance(i) => i.ivars.get(index as usize).copied(),
                        GravityObject::Class(c) => c.ivars.get(index as usize).copied(),
                        _ => None,
                    };
                    if let Some(v) = slot {
                        ret!(vm, rindex, v);
                    }
                }
                ret_error!(vm, rindex, "Out of bounds ivar index in load operation (1).");
            }
            match getter {
                // tail-call the getter with the same (target, key) window
                Some(g) => {
                    vm.set_slot(rindex, Value::Object(g));
                    return false;
                }
                None => {
                    let name = value_display(&vm.heap, key);
                    ret_error!(vm, rindex, "Missing special getter function for property {}", name);
                }
            }
        }
        ret!(vm, rindex, found);
    }

    // bridged fallback for undefined properties
    if let Some(r) = target.as_object() {
        let has_xdata = matches!(vm.heap.get(r), GravityObject::Instance(i) if i.xdata.is_some());
        if has_xdata {
            let keyname = value_display(&vm.heap, key);
            let delegate = std::mem::replace(&mut vm.delegate, Box::new(crate::delegate::DefaultDelegate));
            let xdata = vm.heap.instance_mut(r).xdata.take();
            let handled = match &xdata {
                Some(x) => delegate.bridge_get_undef(vm, x.0.as_ref(), target, &keyname, rindex),
                None => false,
            };
            vm.heap.instance_mut(r).xdata = xdata;
            vm.delegate = delegate;
            if handled {
                return true;
            }
        }
    }

    // class notfound handler
    let notfound = vm.vkeys.notfound;
    if let Some(handler) = class_lookup(&vm.heap, class, Value::Object(notfound)) {
        if let Some(r) = handler.as_object() {
            if matches!(vm.heap.get(r), GravityObject::Closure(_)) {
                vm.set_slot(rindex, handler);
                return false;
            }
        }
    }

    if target.is_null() && vm.nullsilent {
        ret!(vm, rindex, Value::Null);
    }
    let name = value_display(&vm.heap, key);
    let cname = vm.heap.class(class).identifier.clone();
    ret_error!(vm, rindex, "Unable to find {} into class {}", name, cname)
}

/// Super lookup: the receiver is a class; resolve the key starting there
/// without rebinding self.
fn object_loads(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let target = args[0];
    if let Some(r) = target.as_object() {
        if matches!(vm.heap.get(r), GravityObject::Class(_)) {
            let key = args[1];
            if let Some(found) = class_lookup(&vm.heap, r, key) {
                ret!(vm, rindex, found);
            }
            let name = value_display(&vm.heap, key);
            let cname = vm.heap.class(r).identifier.clone();
            ret_error!(vm, rindex, "Unable to find {} into class {}", name, cname);
        }
    }
    object_load(vm, args, nargs, rindex)
}

fn object_store(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let target = args[0];
    let key = args[1];
    let value = args[2];

    if let Value::Int(n) = key {
        if let Some(r) = target.as_object() {
            let kind: Option<(bool, usize)> = match vm.heap.get(r) {
                GravityObject::Instance(i) => Some((false, i.ivars.len())),
                GravityObject::Class(c) => Some((true, c.ivars.len())),
                _ => None,
            };
            match kind {
                Some((is_class, len)) => {
                    if (n as usize) >= len {
                        if is_class {
                            ret_error!(vm, rindex, "Out of bounds ivar index in store operation (2).");
                        }
                        ret_error!(vm, rindex, "Out of bounds ivar index in store operation (1).");
                    }
                    match vm.heap.get_mut(r) {
                        GravityObject::Instance(i) => i.ivars[n as usize] = value,
                        GravityObject::Class(c) => c.ivars[n as usize] = value,
                        _ => unreachable!(),
                    }
                    return true;
                }
                None => ret_error!(vm, rindex, "An integer index can only store an ivar slot."),
            }
        }
    }

    let Some(class) = vm.class_of(target) else {
        ret_error!(vm, rindex, "Unable to store into an invalid value.");
    };
    if !key.is_string(&vm.heap) {
        let cname = vm.heap.class(class).identifier.clone();
        ret_error!(vm, rindex, "Unable to lookup non string value into class {}", cname);
    }

    if let Some(found) = class_lookup(&vm.heap, class, key) {
        if let Some((index, _, setter)) = special_parts(vm, found) {
            if index != COMPUTED_INDEX && setter.is_none() {
                if let Some(r) = target.as_object() {
                    let ok = match vm.heap.get_mut(r) {
                        GravityObject::Instance(i) => {
                            if (index as usize) < i.ivars.len() {
                                i.ivars[index as usize] = value;
                                true
                            } else {
                                false
                            }
                        }
                        GravityObject::Class(c) => {
                            if (index as usize) < c.ivars.len() {
                                c.ivars[index as usize] = value;
                                true
                            } else {
                                false
                            }
                        }
                        _ => false,
                    };
                    if ok {
                        return true;
                    }
                }
                ret_error!(vm, rindex, "Out of bounds ivar index in store operation (1).");
            }
            match setter {
                Some(s) => {
                    // tail-call the setter with the (target, key, value) window
                    vm.set_slot(rindex, Value::Object(s));
                    return false;
                }
                None => {
                    let name = value_display(&vm.heap, key);
                    ret_error!(vm, rindex, "Missing special setter function for property {}", name);
                }
            }
        }
    }

    // bridged fallback
    if let Some(r) = target.as_object() {
        let has_xdata = matches!(vm.heap.get(r), GravityObject::Instance(i) if i.xdata.is_some());
        if has_xdata {
            let keyname = value_display(&vm.heap, key);
            let delegate = std::mem::replace(&mut vm.delegate, Box::new(crate::delegate::DefaultDelegate));
            let xdata = vm.heap.instance_mut(r).xdata.take();
            let handled = match &xdata {
                Some(x) => delegate.bridge_set_undef(vm, x.0.as_ref(), target, &keyname, value),
                None => false,
            };
            vm.heap.instance_mut(r).xdata = xdata;
            vm.delegate = delegate;
            if handled {
                return true;
            }
        }
    }

    if target.is_null() && vm.nullsilent {
        return true;
    }
    let name = value_display(&vm.heap, key);
    let cname = vm.heap.class(class).identifier.clone();
    ret_error!(vm, rindex, "Unable to find {} into class {}", name, cname)
}

/// Attach a method to an instance (through an anonymous class) or to a
/// user-defined class.
fn object_bind_method(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 3 {
        ret_error!(vm, rindex, "Incorrect number of arguments.");
    }
    if !args[1].is_string(&vm.heap) {
        ret_error!(vm, rindex, "First argument must be a String.");
    }
    if !args[2].is_closure(&vm.heap) {
        ret_error!(vm, rindex, "Second argument must be a Closure.");
    }
    let core = *vm.core_classes();
    let name = value_display(&vm.heap, args[1]);
    let key = Value::Object(vm.intern(&name));

    match args[0].as_object() {
        Some(r) if matches!(vm.heap.get(r), GravityObject::Class(_)) => {
            if is_core_class(&core, r) {
                ret_error!(vm, rindex, "Unable to bind method to a Gravity core class.");
            }
            class_bind(&mut vm.heap, r, key, args[2]);
            true
        }
        Some(r) if matches!(vm.heap.get(r), GravityObject::Instance(_)) => {
            let GravityVm { heap, anon_counter, .. } = vm;
            let anon = instance_anon_class(heap, core.class, r, anon_counter);
            class_bind(heap, anon, key, args[2]);
            true
        }
        _ => ret_error!(vm, rindex, "bind method can be applied only to instances or classes."),
    }
}

fn object_unbind(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 {
        ret_error!(vm, rindex, "Incorrect number of arguments.");
    }
    if !args[1].is_string(&vm.heap) {
        ret_error!(vm, rindex, "Argument must be a String.");
    }
    let class = match args[0].as_object() {
        Some(r) if matches!(vm.heap.get(r), GravityObject::Class(_)) => r,
        Some(r) if matches!(vm.heap.get(r), GravityObject::Instance(_)) => {
            vm.heap.instance(r).class
        }
        _ => ret_error!(vm, rindex, "unbind method can be applied only to instances or classes."),
    };
    let key = args[1];
    let mut methods = std::mem::take(&mut vm.heap.class_mut(class).methods);
    methods.remove(&vm.heap, key);
    vm.heap.class_mut(class).methods = methods;
    true
}

fn object_clone(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = args[0]
        .as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Instance(_)))
    else {
        ret_error!(vm, rindex, "Unable to clone non instance object.");
    };
    // bridged payloads clone through the delegate
    let cloned = vm.clone_instance(r);
    let xclone = {
        let inst = vm.heap.instance(r);
        inst.xdata
            .as_ref()
            .and_then(|x| vm.delegate.bridge_clone(x.0.as_ref()))
    };
    if let Some(x) = xclone {
        vm.heap.instance_mut(cloned).xdata = Some(crate::core::object::XData(x));
    }
    ret!(vm, rindex, Value::Object(cloned))
}

fn object_exec(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret_error!(vm, rindex, "Forbidden Object execution.")
}

fn object_to_string(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let s = to_display(vm, args[0]);
    let v = vm.new_string(&s);
    ret!(vm, rindex, v)
}

fn object_to_bool(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Bool(convert_to_bool(&vm.heap, args[0])))
}

// ─── Class ────────────────────────────────────────────────────────────────────

fn register_class(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.class;
    bind(vm, c, "exec", 1, class_exec);
    bind_property(vm, c, "name", class_name_getter, None);
}

fn class_name_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = args[0]
        .as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Class(_)))
    else {
        ret_error!(vm, rindex, "name can be read only on a Class.");
    };
    let name = vm.heap.class(r).identifier.clone();
    let v = vm.new_string(&name);
    ret!(vm, rindex, v)
}

/// Instantiation: allocate the instance, then run the matching constructor.
fn class_exec(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let Some(class) = args[0]
        .as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Class(_)))
    else {
        ret_error!(vm, rindex, "Unable to execute non class object.");
    };

    let inst = instance_new(&mut vm.heap, class);
    vm.heap.temp_push(inst);

    // bridged classes build their payload through the delegate
    let xinit = {
        let cls = vm.heap.class(class);
        cls.xdata
            .as_ref()
            .and_then(|x| vm.delegate.bridge_init_instance(x.0.as_ref(), &args[1..]))
    };
    if let Some(x) = xinit {
        vm.heap.instance_mut(inst).xdata = Some(crate::core::object::XData(x));
    }

    // multi-arity bridged constructors first, then the plain init
    let is_bridged = vm.heap.class(class).xdata.is_some();
    let mut init = None;
    if is_bridged {
        let key = vm.intern(&format!("$init{}", nargs - 1));
        init = class_lookup(&vm.heap, class, Value::Object(key));
    }
    if init.is_none() {
        let key = vm.intern("init");
        init = class_lookup(&vm.heap, class, Value::Object(key));
    }

    let result = match init.and_then(|v| vm.as_callable(v)) {
        None => {
            if nargs > 1 {
                let cname = vm.heap.class(class).identifier.clone();
                vm.heap.temp_pop();
                ret_error!(vm, rindex, "No init with {} parameters found in class {}", nargs - 1, cname);
            }
            Ok(Value::Object(inst))
        }
        Some(ctor) => vm
            .run_closure(ctor, Value::Object(inst), &args[1..])
            .map(|_| Value::Object(inst)),
    };
    vm.heap.temp_pop();
    match result {
        Ok(v) => ret!(vm, rindex, v),
        Err(_) => false,
    }
}

// ─── Null ─────────────────────────────────────────────────────────────────────

fn register_null(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.null;
    bind(vm, c, "!", 1, null_not);
    bind(vm, c, "String", 1, null_to_string);
    bind(vm, c, "Int", 1, null_to_int);
    bind(vm, c, "Float", 1, null_to_float);
    bind(vm, c, "Bool", 1, object_to_bool);
}

fn null_not(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Bool(true))
}

fn null_to_string(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let s = if matches!(args[0], Value::Undefined) { "undefined" } else { "null" };
    let v = vm.new_string(s);
    ret!(vm, rindex, v)
}

fn null_to_int(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(0))
}

fn null_to_float(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(0.0))
}

// ─── Bool ─────────────────────────────────────────────────────────────────────

fn register_bool(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.bool_;
    bind(vm, c, "!", 1, bool_not);
    bind(vm, c, "&&", 2, bool_and);
    bind(vm, c, "||", 2, bool_or);
    bind(vm, c, "Int", 1, bool_to_int);
    bind(vm, c, "Float", 1, generic_to_float);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
}

fn bool_not(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Bool(!convert_to_bool(&vm.heap, args[0])))
}

fn bool_and(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let a = convert_to_bool(&vm.heap, args[0]);
    let b = convert_to_bool(&vm.heap, args[1]);
    ret!(vm, rindex, Value::Bool(a && b))
}

fn bool_or(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let a = convert_to_bool(&vm.heap, args[0]);
    let b = convert_to_bool(&vm.heap, args[1]);
    ret!(vm, rindex, Value::Bool(a || b))
}

fn bool_to_int(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(args[0].as_int()))
}

fn generic_to_float(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    match to_float(vm, args[0]) {
        Some(f) => ret!(vm, rindex, Value::Float(f)),
        None => ret_error!(vm, rindex, "Unable to convert object to Float."),
    }
}

// ─── Int ──────────────────────────────────────────────────────────────────────

fn register_int(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.int;
    bind(vm, c, "+", 2, int_add);
    bind(vm, c, "-", 2, int_sub);
    bind(vm, c, "*", 2, int_mul);
    bind(vm, c, "/", 2, int_div);
    bind(vm, c, "%", 2, int_rem);
    bind(vm, c, "<<", 2, int_lshift);
    bind(vm, c, ">>", 2, int_rshift);
    bind(vm, c, "&", 2, int_band);
    bind(vm, c, "|", 2, int_bor);
    bind(vm, c, "^", 2, int_bxor);
    bind(vm, c, "~", 1, int_bnot);
    bind(vm, c, "neg", 1, int_neg);
    bind(vm, c, "abs", 1, int_abs);
    bind(vm, c, "loop", 2, int_loop);
    bind(vm, c, "radians", 1, int_radians);
    bind(vm, c, "degrees", 1, int_degrees);
    bind(vm, c, "Int", 1, int_to_int);
    bind(vm, c, "Float", 1, generic_to_float);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);

    let meta = meta_of(vm, c);
    bind(vm, meta, "min", 1, int_min);
    bind(vm, meta, "max", 1, int_max);
    bind(vm, meta, "random", 3, int_random);
}

macro_rules! int_binop {
    ($name:ident, $op:tt, $checkzero:expr) => {
        fn $name(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
            let Some(a) = to_int(vm, args[0]) else {
                ret_error!(vm, rindex, "Unable to convert object to Int.");
            };
            let Some(b) = to_int(vm, args[1]) else {
                ret_error!(vm, rindex, "Unable to convert object to Int.");
            };
            if $checkzero && b == 0 {
                ret_error!(vm, rindex, "Division by 0 error.");
            }
            ret!(vm, rindex, Value::Int(a $op b))
        }
    };
}

int_binop!(int_add, +, false);
int_binop!(int_sub, -, false);
int_binop!(int_mul, *, false);
int_binop!(int_div, /, true);
int_binop!(int_rem, %, true);
int_binop!(int_band, &, false);
int_binop!(int_bor, |, false);
int_binop!(int_bxor, ^, false);

fn int_lshift(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let (Some(a), Some(b)) = (to_int(vm, args[0]), to_int(vm, args[1])) else {
        ret_error!(vm, rindex, "Unable to convert object to Int.");
    };
    ret!(vm, rindex, Value::Int(a.wrapping_shl(b as u32)))
}

fn int_rshift(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let (Some(a), Some(b)) = (to_int(vm, args[0]), to_int(vm, args[1])) else {
        ret_error!(vm, rindex, "Unable to convert object to Int.");
    };
    ret!(vm, rindex, Value::Int(a.wrapping_shr(b as u32)))
}

fn int_bnot(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(!args[0].as_int()))
}

fn int_neg(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(-args[0].as_int()))
}

fn int_abs(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(args[0].as_int().abs()))
}

fn int_radians(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float((args[0].as_int() as f64).to_radians()))
}

fn int_degrees(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float((args[0].as_int() as f64).to_degrees()))
}

fn int_to_int(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    match to_int(vm, args[0]) {
        Some(n) => ret!(vm, rindex, Value::Int(n)),
        None => ret_error!(vm, rindex, "Unable to convert object to Int."),
    }
}

/// n.loop(closure) runs the closure n times with the iteration index.
fn int_loop(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 || !args[1].is_closure(&vm.heap) {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    }
    let n = args[0].as_int();
    let closure = args[1].as_object().expect("closure checked above");
    for i in 0..n {
        if vm.run_closure(closure, args[0], &[Value::Int(i)]).is_err() {
            return false;
        }
    }
    ret!(vm, rindex, args[0])
}

fn int_min(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(i64::MIN))
}

fn int_max(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(i64::MAX))
}

/// Pseudo random integer in [a, b]; xorshift seeded from the VM clock.
fn int_random(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 3 {
        ret_error!(vm, rindex, "Int.random() expects 2 integer arguments");
    }
    let (Value::Int(a), Value::Int(b)) = (args[1], args[2]) else {
        ret_error!(vm, rindex, "Int.random() arguments must be integers");
    };
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut x = (vm.nanotime() * 1e9) as u64 | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let span = (hi - lo + 1) as u64;
    ret!(vm, rindex, Value::Int(lo + (x % span) as i64))
}

// ─── Float ────────────────────────────────────────────────────────────────────

fn register_float(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.float;
    bind(vm, c, "+", 2, float_add);
    bind(vm, c, "-", 2, float_sub);
    bind(vm, c, "*", 2, float_mul);
    bind(vm, c, "/", 2, float_div);
    bind(vm, c, "neg", 1, float_neg);
    bind(vm, c, "abs", 1, float_abs);
    bind(vm, c, "floor", 1, float_floor);
    bind(vm, c, "ceil", 1, float_ceil);
    bind(vm, c, "round", 1, float_round);
    bind(vm, c, "Int", 1, int_to_int);
    bind(vm, c, "Float", 1, generic_to_float);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
}

macro_rules! float_binop {
    ($name:ident, $op:tt, $checkzero:expr) => {
        fn $name(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
            let Some(a) = to_float(vm, args[0]) else {
                ret_error!(vm, rindex, "Unable to convert object to Float.");
            };
            let Some(b) = to_float(vm, args[1]) else {
                ret_error!(vm, rindex, "Unable to convert object to Float.");
            };
            if $checkzero && b == 0.0 {
                ret_error!(vm, rindex, "Division by 0 error.");
            }
            ret!(vm, rindex, Value::Float(a $op b))
        }
    };
}

float_binop!(float_add, +, false);
float_binop!(float_sub, -, false);
float_binop!(float_mul, *, false);
float_binop!(float_div, /, true);

fn float_neg(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(-args[0].as_float()))
}

fn float_abs(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(args[0].as_float().abs()))
}

fn float_floor(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(args[0].as_float().floor()))
}

fn float_ceil(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(args[0].as_float().ceil()))
}

fn float_round(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(args[0].as_float().round()))
}

// ─── String ───────────────────────────────────────────────────────────────────

fn register_string(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.string;
    bind(vm, c, "+", 2, string_add);
    bind(vm, c, "=~", 2, string_match);
    bind(vm, c, "loadat", 2, string_loadat);
    bind(vm, c, "storeat", 3, string_storeat);
    bind(vm, c, "split", 2, string_split);
    bind(vm, c, "contains", 2, string_contains);
    bind(vm, c, "index", 2, string_index);
    bind(vm, c, "count", 2, string_count);
    bind(vm, c, "replace", 3, string_replace);
    bind(vm, c, "upper", 1, string_upper);
    bind(vm, c, "lower", 1, string_lower);
    bind(vm, c, "trim", 1, string_trim);
    bind(vm, c, "repeat", 2, string_repeat);
    bind(vm, c, "reverse", 1, string_reverse);
    bind(vm, c, "loop", 2, string_loop);
    bind(vm, c, "iterate", 2, string_iterate);
    bind(vm, c, "next", 2, string_next);
    bind(vm, c, "number", 1, string_number);
    bind(vm, c, "Int", 1, int_to_int);
    bind(vm, c, "Float", 1, generic_to_float);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
    bind_property(vm, c, "length", string_length_getter, None);
}

fn string_content(vm: &GravityVm, v: Value) -> Option<String> {
    let r = v.as_object()?;
    match vm.heap.get(r) {
        GravityObject::String(s) => Some(s.s.clone()),
        _ => None,
    }
}

fn string_length_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "length can be read only on a String.");
    };
    ret!(vm, rindex, Value::Int(s.len() as i64))
}

fn string_add(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(a) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let b = to_display(vm, args[1]);
    let v = vm.new_string(&format!("{}{}", a, b));
    ret!(vm, rindex, v)
}

/// Compiled patterns used by =~, cached by source text so a match inside a
/// loop does not recompile on every iteration.
static PATTERN_CACHE: Lazy<Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn cached_pattern(pat: &str) -> Option<Regex> {
    let mut cache = PATTERN_CACHE.lock().unwrap();
    if let Some(re) = cache.get(pat) {
        return Some(re.clone());
    }
    let re = Regex::new(pat).ok()?;
    cache.insert(pat.to_string(), re.clone());
    Some(re)
}

/// The =~ operator: the right operand is a regular expression pattern.
fn string_match(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Some(pat) = string_content(vm, args[1]) else {
        ret_error!(vm, rindex, "A String pattern is expected by the match operator.");
    };
    match cached_pattern(&pat) {
        Some(re) => ret!(vm, rindex, Value::Bool(re.is_match(&s))),
        None => ret_error!(vm, rindex, "Invalid regular expression pattern."),
    }
}

fn string_loadat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    match args[1] {
        Value::Int(mut i) => {
            if i < 0 {
                i += len;
            }
            if i < 0 || i >= len {
                ret_error!(vm, rindex, "Out of bounds error: index {} beyond bounds 0...{}", i, len - 1);
            }
            let v = vm.new_string(&chars[i as usize].to_string());
            ret!(vm, rindex, v)
        }
        _ => ret_error!(vm, rindex, "An integer index is required to access a string item."),
    }
}

fn string_storeat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = args[0]
        .as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::String(_)))
    else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "An integer index is required to access a string item.");
    };
    let Some(repl) = string_content(vm, args[2]) else {
        ret_error!(vm, rindex, "A String value is expected in a string store operation.");
    };
    let s = vm.heap.string(r).s.clone();
    let mut chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let i = if i < 0 { i + len } else { i };
    if i < 0 || i >= len {
        ret_error!(vm, rindex, "Out of bounds error: index {} beyond bounds 0...{}", i, len - 1);
    }
    chars.splice(i as usize..i as usize + 1, repl.chars());
    let rebuilt: String = chars.into_iter().collect();
    match vm.heap.get_mut(r) {
        GravityObject::String(obj) => *obj = GravityString::new(rebuilt),
        _ => unreachable!(),
    }
    true
}

/// Split preserves empty segments ("a,,b" has three parts).
fn string_split(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Some(sep) = string_content(vm, args[1]) else {
        ret_error!(vm, rindex, "String.split() expects a string as an argument");
    };
    let parts: Vec<String> = if sep.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(sep.as_str()).map(|p| p.to_string()).collect()
    };
    let mut items = Vec::with_capacity(parts.len());
    for p in &parts {
        items.push(vm.new_string(p));
    }
    let list = vm.new_list(items);
    ret!(vm, rindex, list)
}

fn string_contains(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Some(needle) = string_content(vm, args[1]) else {
        ret_error!(vm, rindex, "String.index() expects a string as an argument");
    };
    ret!(vm, rindex, Value::Bool(s.contains(&needle)))
}

fn string_index(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Some(needle) = string_content(vm, args[1]) else {
        ret_error!(vm, rindex, "String.index() expects a string as an argument");
    };
    match s.find(&needle) {
        Some(i) => ret!(vm, rindex, Value::Int(i as i64)),
        None => ret!(vm, rindex, Value::Null),
    }
}

/// Number of non-overlapping occurrences of the argument.
fn string_count(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Some(needle) = string_content(vm, args[1]) else {
        ret_error!(vm, rindex, "String.count() expects a string as an argument");
    };
    let n = if needle.is_empty() { 0 } else { s.matches(&needle).count() };
    ret!(vm, rindex, Value::Int(n as i64))
}

fn string_replace(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let (Some(from), Some(to)) = (string_content(vm, args[1]), string_content(vm, args[2])) else {
        ret_error!(vm, rindex, "String.replace() expects 2 string arguments");
    };
    let v = vm.new_string(&s.replace(&from, &to));
    ret!(vm, rindex, v)
}

fn string_upper(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let v = vm.new_string(&s.to_uppercase());
    ret!(vm, rindex, v)
}

fn string_lower(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let v = vm.new_string(&s.to_lowercase());
    ret!(vm, rindex, v)
}

fn string_trim(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let v = vm.new_string(s.trim());
    ret!(vm, rindex, v)
}

fn string_repeat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Value::Int(n) = args[1] else {
        ret_error!(vm, rindex, "String.repeat() expects an integer argument");
    };
    if n < 1 || n >= MAX_ALLOCATION {
        ret_error!(vm, rindex, "String.repeat() expects a value >= 1 and < {}", MAX_ALLOCATION);
    }
    let v = vm.new_string(&s.repeat(n as usize));
    ret!(vm, rindex, v)
}

/// Grapheme-aware reverse so multi-byte text survives the round trip.
fn string_reverse(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let reversed: String = s.graphemes(true).rev().collect();
    let v = vm.new_string(&reversed);
    ret!(vm, rindex, v)
}

fn string_loop(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 || !args[1].is_closure(&vm.heap) {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    }
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let closure = args[1].as_object().expect("closure checked above");
    for ch in s.chars() {
        let cv = vm.new_string(&ch.to_string());
        if vm.run_closure(closure, args[0], &[cv]).is_err() {
            return false;
        }
    }
    ret!(vm, rindex, args[0])
}

fn string_iterate(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let n = s.chars().count() as i64;
    iterate_step(vm, args[1], n, rindex)
}

fn string_next(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "Iterator expects a numeric value here.");
    };
    match s.chars().nth(i as usize) {
        Some(c) => {
            let v = vm.new_string(&c.to_string());
            ret!(vm, rindex, v)
        }
        None => ret!(vm, rindex, Value::Null),
    }
}

/// Parse into Int or Float depending on a decimal dot.
fn string_number(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(s) = string_content(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to convert object to String.");
    };
    if s.contains('.') {
        match convert_to_float(&vm.heap, args[0]) {
            Some(f) => ret!(vm, rindex, Value::Float(f)),
            None => ret_error!(vm, rindex, "Unable to convert object to Float."),
        }
    }
    match convert_to_int(&vm.heap, args[0]) {
        Some(n) => ret!(vm, rindex, Value::Int(n)),
        None => ret_error!(vm, rindex, "Unable to convert object to Int."),
    }
}

// ─── List ─────────────────────────────────────────────────────────────────────

fn register_list(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.list;
    bind(vm, c, "loadat", 2, list_loadat);
    bind(vm, c, "storeat", 3, list_storeat);
    bind(vm, c, "push", 2, list_push);
    bind(vm, c, "pop", 1, list_pop);
    bind(vm, c, "contains", 2, list_contains);
    bind(vm, c, "indexOf", 2, list_index_of);
    bind(vm, c, "remove", 2, list_remove);
    bind(vm, c, "join", 2, list_join);
    bind(vm, c, "map", 2, list_map);
    bind(vm, c, "filter", 2, list_filter);
    bind(vm, c, "reduce", 3, list_reduce);
    bind(vm, c, "sort", 1, list_sort);
    bind(vm, c, "reverse", 1, list_reverse);
    bind(vm, c, "loop", 2, list_loop);
    bind(vm, c, "iterate", 2, list_iterate);
    bind(vm, c, "next", 2, list_next);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
    bind_property(vm, c, "count", list_count_getter, None);
}

fn list_ref(vm: &GravityVm, v: Value) -> Option<GcRef> {
    v.as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::List(_)))
}

fn list_count_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "count can be read only on a List.");
    };
    ret!(vm, rindex, Value::Int(vm.heap.list(r).items.len() as i64))
}

fn list_loadat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let Value::Int(mut i) = args[1] else {
        ret_error!(vm, rindex, "An integer index is required to access a list item.");
    };
    let count = vm.heap.list(r).items.len() as i64;
    if i < 0 {
        i += count;
    }
    if i < 0 || i >= count {
        ret_error!(vm, rindex, "Out of bounds error: index {} beyond bounds 0...{}", i, count - 1);
    }
    ret!(vm, rindex, vm.heap.list(r).items[i as usize])
}

fn list_storeat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "An integer index is required to access a list item.");
    };
    let count = vm.heap.list(r).items.len() as i64;
    if i < 0 {
        ret_error!(vm, rindex, "Out of bounds error: index {} beyond bounds 0...{}", i, count - 1);
    }
    // storing past the end grows the list with nulls
    let list = vm.heap.list_mut(r);
    if i >= count {
        list.items.resize(i as usize + 1, Value::Null);
    }
    list.items[i as usize] = args[2];
    true
}

fn list_push(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    vm.heap.list_mut(r).items.push(args[1]);
    ret!(vm, rindex, Value::Int(vm.heap.list(r).items.len() as i64))
}

fn list_pop(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    match vm.heap.list_mut(r).items.pop() {
        Some(v) => ret!(vm, rindex, v),
        None => ret_error!(vm, rindex, "Unable to pop a value from an empty list."),
    }
}

fn list_contains(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let found = {
        let items = &vm.heap.list(r).items;
        items.iter().any(|&v| value_equals(&vm.heap, v, args[1]))
    };
    ret!(vm, rindex, Value::Bool(found))
}

fn list_index_of(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let pos = {
        let items = &vm.heap.list(r).items;
        items.iter().position(|&v| value_equals(&vm.heap, v, args[1]))
    };
    match pos {
        Some(i) => ret!(vm, rindex, Value::Int(i as i64)),
        None => ret!(vm, rindex, Value::Int(-1)),
    }
}

fn list_remove(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "Parameter must be of type Int.");
    };
    let count = vm.heap.list(r).items.len() as i64;
    if i < 0 || i >= count {
        ret_error!(vm, rindex, "Out of bounds index.");
    }
    vm.heap.list_mut(r).items.remove(i as usize);
    ret!(vm, rindex, args[0])
}

fn list_join(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let sep = if nargs > 1 {
        match string_content(vm, args[1]) {
            Some(s) => s,
            None => ret_error!(vm, rindex, "A String separator is expected by the join function."),
        }
    } else {
        String::new()
    };
    let items = vm.heap.list(r).items.clone();
    let mut parts = Vec::with_capacity(items.len());
    for v in items {
        parts.push(to_display(vm, v));
    }
    let v = vm.new_string(&parts.join(&sep));
    ret!(vm, rindex, v)
}

fn closure_arg(vm: &GravityVm, args: &[Value], idx: usize) -> Option<GcRef> {
    args.get(idx)
        .and_then(|v| v.as_object())
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Closure(_)))
}

fn list_map(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 2 {
        ret_error!(vm, rindex, "One argument is needed by the map function.");
    }
    let Some(closure) = closure_arg(vm, args, 1) else {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    };
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let items = vm.heap.list(r).items.clone();
    let out = vm.new_list(Vec::with_capacity(items.len()));
    let out_ref = out.as_object().expect("list just created");
    vm.heap.temp_push(out_ref);
    for v in items {
        match vm.run_closure(closure, args[0], &[v]) {
            Ok(mapped) => vm.heap.list_mut(out_ref).items.push(mapped),
            Err(_) => {
                vm.heap.temp_pop();
                return false;
            }
        }
    }
    vm.heap.temp_pop();
    ret!(vm, rindex, out)
}

fn list_filter(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 2 {
        ret_error!(vm, rindex, "One argument is needed by the filter function.");
    }
    let Some(closure) = closure_arg(vm, args, 1) else {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    };
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let items = vm.heap.list(r).items.clone();
    let out = vm.new_list(Vec::new());
    let out_ref = out.as_object().expect("list just created");
    vm.heap.temp_push(out_ref);
    for v in items {
        match vm.run_closure(closure, args[0], &[v]) {
            Ok(keep) => {
                if convert_to_bool(&vm.heap, keep) {
                    vm.heap.list_mut(out_ref).items.push(v);
                }
            }
            Err(_) => {
                vm.heap.temp_pop();
                return false;
            }
        }
    }
    vm.heap.temp_pop();
    ret!(vm, rindex, out)
}

fn list_reduce(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 3 {
        ret_error!(vm, rindex, "Two arguments are needed by the reduce function.");
    }
    let Some(closure) = closure_arg(vm, args, 2) else {
        ret_error!(vm, rindex, "Argument 2 must be a Closure.");
    };
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let items = vm.heap.list(r).items.clone();
    let mut acc = args[1];
    for v in items {
        match vm.run_closure(closure, args[0], &[acc, v]) {
            Ok(next) => acc = next,
            Err(_) => return false,
        }
    }
    ret!(vm, rindex, acc)
}

/// Natural ascending sort; pairs without a defined order keep their
/// relative position.
fn list_sort(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let mut items = vm.heap.list(r).items.clone();
    let heap = &vm.heap;
    items.sort_by(|&a, &b| {
        match value_compare(heap, a, b) {
            Some(c) if c < 0 => std::cmp::Ordering::Less,
            Some(c) if c > 0 => std::cmp::Ordering::Greater,
            _ => std::cmp::Ordering::Equal,
        }
    });
    vm.heap.list_mut(r).items = items;
    ret!(vm, rindex, args[0])
}

fn list_reverse(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    vm.heap.list_mut(r).items.reverse();
    ret!(vm, rindex, args[0])
}

fn list_loop(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 {
        ret_error!(vm, rindex, "Incorrect number of arguments.");
    }
    let Some(closure) = closure_arg(vm, args, 1) else {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    };
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let items = vm.heap.list(r).items.clone();
    for v in items {
        if vm.run_closure(closure, args[0], &[v]).is_err() {
            return false;
        }
    }
    ret!(vm, rindex, args[0])
}

/// Shared index-based iterate step: null starts at 0, false terminates.
fn iterate_step(vm: &mut GravityVm, prev: Value, count: i64, rindex: u32) -> bool {
    let next = match prev {
        Value::Null | Value::Undefined => 0,
        Value::Int(i) => i + 1,
        _ => {
            ret_error!(vm, rindex, "Iterator expects a numeric value here.");
        }
    };
    if next >= count {
        ret!(vm, rindex, Value::Bool(false));
    }
    ret!(vm, rindex, Value::Int(next))
}

fn list_iterate(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let count = vm.heap.list(r).items.len() as i64;
    iterate_step(vm, args[1], count, rindex)
}

fn list_next(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = list_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non List object.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "Iterator expects a numeric value here.");
    };
    match vm.heap.list(r).items.get(i as usize) {
        Some(&v) => ret!(vm, rindex, v),
        None => ret!(vm, rindex, Value::Null),
    }
}

// ─── Map ──────────────────────────────────────────────────────────────────────

fn register_map(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.map;
    bind(vm, c, "load", 2, map_load);
    bind(vm, c, "loadat", 2, map_loadat);
    bind(vm, c, "store", 3, map_storeat);
    bind(vm, c, "storeat", 3, map_storeat);
    bind(vm, c, "keys", 1, map_keys);
    bind(vm, c, "hasKey", 2, map_haskey);
    bind(vm, c, "remove", 2, map_remove);
    bind(vm, c, "loop", 2, map_loop);
    bind(vm, c, "iterate", 2, map_iterate);
    bind(vm, c, "next", 2, map_next);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
    bind_property(vm, c, "count", map_count_getter, None);
}

fn map_ref(vm: &GravityVm, v: Value) -> Option<GcRef> {
    v.as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Map(_)))
}

fn map_count_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "count can be read only on a Map.");
    };
    ret!(vm, rindex, Value::Int(vm.heap.map(r).table.len() as i64))
}

/// Dot access on maps: entries win over class methods.
fn map_load(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    if !args[1].is_valid() {
        ret_error!(vm, rindex, "Invalid map key.");
    }
    if let Some(v) = vm.heap.map(r).table.lookup(&vm.heap, args[1]) {
        ret!(vm, rindex, v);
    }
    object_load(vm, args, nargs, rindex)
}

fn map_loadat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    if !args[1].is_valid() {
        ret_error!(vm, rindex, "Invalid map key.");
    }
    let v = vm
        .heap
        .map(r)
        .table
        .lookup(&vm.heap, args[1])
        .unwrap_or(Value::Null);
    ret!(vm, rindex, v)
}

fn map_storeat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    if !args[1].is_valid() {
        ret_error!(vm, rindex, "Invalid map key.");
    }
    let mut table = std::mem::take(&mut vm.heap.map_mut(r).table);
    table.insert(&vm.heap, args[1], args[2]);
    vm.heap.map_mut(r).table = table;
    true
}

fn map_keys(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    let keys: Vec<Value> = vm.heap.map(r).table.keys().collect();
    let list = vm.new_list(keys);
    ret!(vm, rindex, list)
}

fn map_haskey(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    if !args[1].is_valid() {
        ret_error!(vm, rindex, "Invalid map key.");
    }
    let has = vm.heap.map(r).table.contains(&vm.heap, args[1]);
    ret!(vm, rindex, Value::Bool(has))
}

fn map_remove(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    if !args[1].is_valid() {
        ret_error!(vm, rindex, "Invalid map key.");
    }
    let mut table = std::mem::take(&mut vm.heap.map_mut(r).table);
    let removed = table.remove(&vm.heap, args[1]);
    vm.heap.map_mut(r).table = table;
    ret!(vm, rindex, Value::Bool(removed.is_some()))
}

/// loop(closure) invokes the closure once per key.
fn map_loop(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 {
        ret_error!(vm, rindex, "Incorrect number of arguments.");
    }
    let Some(closure) = closure_arg(vm, args, 1) else {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    };
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    let keys: Vec<Value> = vm.heap.map(r).table.keys().collect();
    for k in keys {
        if vm.run_closure(closure, args[0], &[k]).is_err() {
            return false;
        }
    }
    ret!(vm, rindex, args[0])
}

fn map_iterate(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    let count = vm.heap.map(r).table.len() as i64;
    iterate_step(vm, args[1], count, rindex)
}

fn map_next(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(r) = map_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Map object.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "Iterator expects a numeric value here.");
    };
    let key = vm.heap.map(r).table.keys().nth(i as usize);
    match key {
        Some(k) => ret!(vm, rindex, k),
        None => ret!(vm, rindex, Value::Null),
    }
}

// ─── Range ────────────────────────────────────────────────────────────────────

fn register_range(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.range;
    bind(vm, c, "contains", 2, range_contains);
    bind(vm, c, "loadat", 2, range_loadat);
    bind(vm, c, "loop", 2, range_loop);
    bind(vm, c, "iterate", 2, range_iterate);
    bind(vm, c, "next", 2, range_next);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);
    bind_property(vm, c, "count", range_count_getter, None);
    bind_property(vm, c, "from", range_from_getter, None);
    bind_property(vm, c, "to", range_to_getter, None);
}

fn range_of(vm: &GravityVm, v: Value) -> Option<crate::core::object::GravityRange> {
    let r = v.as_object()?;
    match vm.heap.get(r) {
        GravityObject::Range(rg) => Some(*rg),
        _ => None,
    }
}

fn range_count_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "count can be read only on a Range.");
    };
    ret!(vm, rindex, Value::Int(rg.count()))
}

fn range_from_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "from can be read only on a Range.");
    };
    ret!(vm, rindex, Value::Int(rg.from))
}

fn range_to_getter(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "to can be read only on a Range.");
    };
    ret!(vm, rindex, Value::Int(rg.to))
}

fn range_contains(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Range object.");
    };
    let Value::Int(n) = args[1] else {
        ret_error!(vm, rindex, "A numeric value is expected.");
    };
    ret!(vm, rindex, Value::Bool(rg.contains(n)))
}

fn range_loadat(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Range object.");
    };
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "An integer index is required to access a range item.");
    };
    if i < 0 || i >= rg.count() {
        ret_error!(vm, rindex, "Out of bounds error: index {} beyond bounds 0...{}", i, rg.count() - 1);
    }
    let step = if rg.to >= rg.from { 1 } else { -1 };
    ret!(vm, rindex, Value::Int(rg.from + step * i))
}

fn range_loop(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 {
        ret_error!(vm, rindex, "Incorrect number of arguments.");
    }
    let Some(closure) = closure_arg(vm, args, 1) else {
        ret_error!(vm, rindex, "Argument must be a Closure.");
    };
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Range object.");
    };
    let step = if rg.to >= rg.from { 1 } else { -1 };
    let mut i = rg.from;
    loop {
        if vm.run_closure(closure, args[0], &[Value::Int(i)]).is_err() {
            return false;
        }
        if i == rg.to {
            break;
        }
        i += step;
    }
    ret!(vm, rindex, args[0])
}

fn range_iterate(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(rg) = range_of(vm, args[0]) else {
        ret_error!(vm, rindex, "Unable to access a non Range object.");
    };
    let step = if rg.to >= rg.from { 1 } else { -1 };
    match args[1] {
        Value::Null | Value::Undefined => ret!(vm, rindex, Value::Int(rg.from)),
        Value::Int(i) => {
            if i == rg.to {
                ret!(vm, rindex, Value::Bool(false));
            }
            ret!(vm, rindex, Value::Int(i + step))
        }
        _ => ret_error!(vm, rindex, "Iterator expects a numeric value here."),
    }
}

fn range_next(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Value::Int(i) = args[1] else {
        ret_error!(vm, rindex, "Iterator expects a numeric value here.");
    };
    ret!(vm, rindex, Value::Int(i))
}

// ─── Func / Closure ───────────────────────────────────────────────────────────

fn register_function(vm: &mut GravityVm, core: &CoreClasses) {
    for c in [core.func, core.closure] {
        bind(vm, c, "apply", 3, closure_apply);
        bind(vm, c, "bind", 2, closure_bind_context);
        bind(vm, c, "String", 1, object_to_string);
        bind(vm, c, "Bool", 1, object_to_bool);
    }
}

fn closure_apply(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 3 {
        ret_error!(vm, rindex, "Two arguments are needed by the apply function.");
    }
    let Some(closure) = vm.as_callable(args[0]) else {
        ret_error!(vm, rindex, "Unable to convert Object to closure");
    };
    let Some(list) = list_ref(vm, args[2]) else {
        ret_error!(vm, rindex, "A list of arguments is required in the apply function.");
    };
    let call_args = vm.heap.list(list).items.clone();
    match vm.run_closure(closure, args[1], &call_args) {
        Ok(v) => ret!(vm, rindex, v),
        Err(_) => false,
    }
}

fn closure_bind_context(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs != 2 {
        ret_error!(vm, rindex, "An argument is required by the bind function.");
    }
    let Some(closure) = args[0]
        .as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Closure(_)))
    else {
        ret_error!(vm, rindex, "Unable to convert Object to closure");
    };
    match args[1].as_object() {
        Some(ctx) => vm.heap.closure_mut(closure).context = Some(ctx),
        None => vm.heap.closure_mut(closure).context = None,
    }
    ret!(vm, rindex, args[0])
}

// ─── Fiber ────────────────────────────────────────────────────────────────────

fn register_fiber(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.fiber;
    bind(vm, c, "call", 1, fiber_exec);
    bind(vm, c, "exec", 1, fiber_exec);
    bind(vm, c, "try", 1, fiber_try);
    bind(vm, c, "status", 1, fiber_status);
    bind(vm, c, "isDone", 1, fiber_done);
    bind(vm, c, "elapsedTime", 1, fiber_elapsed_time);
    bind(vm, c, "result", 1, fiber_result);
    bind(vm, c, "String", 1, object_to_string);
    bind(vm, c, "Bool", 1, object_to_bool);

    let meta = meta_of(vm, c);
    bind(vm, meta, "create", 2, fiber_create);
    bind(vm, meta, "yield", 1, fiber_yield);
    bind(vm, meta, "yieldWaitTime", 2, fiber_yield_time);
    bind(vm, meta, "abort", 2, fiber_abort);
}

fn fiber_ref(vm: &GravityVm, v: Value) -> Option<GcRef> {
    v.as_object()
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Fiber(_)))
}

fn fiber_create(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(closure) = args.get(1).and_then(|&v| {
        v.as_object()
            .filter(|&r| matches!(vm.heap.get(r), GravityObject::Closure(_)))
    }) else {
        ret_error!(vm, rindex, "A function is expected as argument to Fiber.create.");
    };
    let is_native = {
        let func = vm.heap.closure(closure).func;
        matches!(vm.heap.function(func).kind, FunctionKind::Native(_))
    };
    if !is_native {
        ret_error!(vm, rindex, "A function is expected as argument to Fiber.create.");
    }
    let fiber = vm.new_fiber(closure);
    ret!(vm, rindex, Value::Object(fiber))
}

fn fiber_run(vm: &mut GravityVm, args: &[Value], rindex: u32, is_trying: bool) -> bool {
    // default call result until the fiber yields or returns a value
    vm.set_slot(rindex, Value::Null);

    let Some(target) = fiber_ref(vm, args[0]) else {
        vm.fiber_error("call can be applied only to a Fiber.");
        return false;
    };
    if vm.heap.fiber(target).caller.is_some() {
        vm.fiber_error("Fiber has already been called.");
        return false;
    }
    if vm.heap.fiber(target).frames.is_empty() {
        vm.fiber_error("Unable to call a terminated Fiber.");
        return false;
    }

    // elapsed-time bookkeeping and the cooperative sleep window
    let elapsed = {
        let fib = vm.heap.fiber(target);
        fib.lasttime.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    };
    {
        let fib = vm.heap.fiber_mut(target);
        fib.elapsedtime = elapsed;
        if fib.timewait > 0.0 && elapsed < fib.timewait {
            // not yet: the call returns immediately without running
            return true;
        }
    }

    let current = vm.current_fiber();
    {
        let fib = vm.heap.fiber_mut(target);
        fib.caller = Some(current);
        fib.trying = is_trying;
        fib.status = if is_trying { FiberStatus::Trying } else { FiberStatus::Running };
        fib.resume_dest = Some(rindex);
        fib.error = None;
    }
    vm.set_current_fiber(target);
    false
}

fn fiber_exec(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    fiber_run(vm, args, rindex, false)
}

fn fiber_try(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    fiber_run(vm, args, rindex, true)
}

/// Suspend the current fiber; an optional argument becomes the result of
/// the call that resumed it.
fn fiber_yield(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    vm.set_slot(rindex, Value::Null);
    let current = vm.current_fiber();
    let yielded = if nargs > 1 { args[1] } else { Value::Null };

    {
        let fib = vm.heap.fiber_mut(current);
        fib.timewait = 0.0;
        fib.lasttime = Some(std::time::Instant::now());
    }

    let caller = vm.heap.fiber(current).caller;
    match caller {
        Some(c) => {
            let dest = vm.heap.fiber(current).resume_dest;
            {
                let fib = vm.heap.fiber_mut(current);
                fib.caller = None;
                fib.trying = false;
            }
            vm.set_current_fiber(c);
            if let Some(d) = dest {
                vm.set_slot(d, yielded);
            }
            false
        }
        // yielding with no caller is a no-op
        None => true,
    }
}

fn fiber_yield_time(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    vm.set_slot(rindex, Value::Null);
    let current = vm.current_fiber();
    let t = match args.get(1) {
        Some(Value::Int(n)) => *n as f64,
        Some(Value::Float(f)) => *f,
        _ => 0.0,
    };
    {
        let fib = vm.heap.fiber_mut(current);
        fib.timewait = t;
        fib.lasttime = Some(std::time::Instant::now());
    }

    let caller = vm.heap.fiber(current).caller;
    match caller {
        Some(c) => {
            let dest = vm.heap.fiber(current).resume_dest;
            {
                let fib = vm.heap.fiber_mut(current);
                fib.caller = None;
                fib.trying = false;
            }
            vm.set_current_fiber(c);
            if let Some(d) = dest {
                let v = if nargs > 2 { args[2] } else { Value::Null };
                vm.set_slot(d, v);
            }
            false
        }
        None => true,
    }
}

fn fiber_status(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(target) = fiber_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "status can be read only on a Fiber.");
    };
    let fib = vm.heap.fiber(target);
    let status = if fib.error.is_some() {
        FiberStatus::AbortedWithError
    } else if fib.frames.is_empty() {
        FiberStatus::Terminated
    } else {
        fib.status
    };
    ret!(vm, rindex, Value::Int(status as i64))
}

fn fiber_done(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(target) = fiber_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "isDone can be read only on a Fiber.");
    };
    ret!(vm, rindex, Value::Bool(vm.heap.fiber(target).is_done()))
}

fn fiber_elapsed_time(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(target) = fiber_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "elapsedTime can be read only on a Fiber.");
    };
    ret!(vm, rindex, Value::Float(vm.heap.fiber(target).elapsedtime))
}

/// The value produced by the fiber's last yield or final return.
fn fiber_result(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let Some(target) = fiber_ref(vm, args[0]) else {
        ret_error!(vm, rindex, "result can be read only on a Fiber.");
    };
    ret!(vm, rindex, vm.heap.fiber(target).result)
}

/// Abort the current fiber with an error message; a trying caller observes
/// the error, anything else aborts the VM.
fn fiber_abort(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    if nargs < 2 || !args[1].is_string(&vm.heap) {
        ret_error!(vm, rindex, "A string error is expected as argument of abort.");
    }
    let msg = value_display(&vm.heap, args[1]);
    vm.set_slot(rindex, Value::Null);
    vm.fiber_error(msg);
    false
}

// ─── System ───────────────────────────────────────────────────────────────────

fn register_system(vm: &mut GravityVm, core: &CoreClasses) {
    let c = core.system;
    let meta = meta_of(vm, c);
    bind(vm, meta, "print", 1, system_print);
    bind(vm, meta, "put", 1, system_put);
    bind(vm, meta, "nanotime", 1, system_nanotime);
    bind(vm, meta, "gc", 1, system_gc);
    bind_property(vm, meta, "gcEnabled", system_gc_enabled_get, Some(system_gc_enabled_set));
    bind_property(vm, meta, "gcMinThreshold", system_gc_minthreshold_get, Some(system_gc_minthreshold_set));
    bind_property(vm, meta, "gcThreshold", system_gc_threshold_get, Some(system_gc_threshold_set));
    bind_property(vm, meta, "gcRatio", system_gc_ratio_get, Some(system_gc_ratio_set));
}

fn system_print(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let mut parts = Vec::with_capacity(nargs.saturating_sub(1) as usize);
    for &v in &args[1..] {
        parts.push(to_display(vm, v));
    }
    let line = parts.join(" ");
    vm.delegate.log_callback(&line);
    ret!(vm, rindex, Value::Null)
}

fn system_put(vm: &mut GravityVm, args: &[Value], nargs: u16, rindex: u32) -> bool {
    let mut parts = Vec::with_capacity(nargs.saturating_sub(1) as usize);
    for &v in &args[1..] {
        parts.push(to_display(vm, v));
    }
    print!("{}", parts.join(" "));
    ret!(vm, rindex, Value::Null)
}

fn system_nanotime(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int((vm.nanotime() * 1e9) as i64))
}

fn system_gc(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    vm.gc_collect();
    ret!(vm, rindex, Value::Null)
}

fn system_gc_enabled_get(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Bool(vm.heap.is_enabled()))
}

fn system_gc_enabled_set(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    let on = convert_to_bool(&vm.heap, args[2]);
    if on != vm.heap.is_enabled() {
        vm.heap.set_enabled(on);
    }
    ret!(vm, rindex, Value::Null)
}

fn system_gc_minthreshold_get(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(vm.heap.gcminthreshold as i64))
}

fn system_gc_minthreshold_set(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    if let Value::Int(n) = args[2] {
        vm.heap.gcminthreshold = n.max(0) as u64;
    }
    ret!(vm, rindex, Value::Null)
}

fn system_gc_threshold_get(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Int(vm.heap.gcthreshold as i64))
}

fn system_gc_threshold_set(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    if let Value::Int(n) = args[2] {
        vm.heap.gcthreshold = n.max(0) as u64;
    }
    ret!(vm, rindex, Value::Null)
}

fn system_gc_ratio_get(vm: &mut GravityVm, _args: &[Value], _nargs: u16, rindex: u32) -> bool {
    ret!(vm, rindex, Value::Float(vm.heap.gcratio))
}

fn system_gc_ratio_set(vm: &mut GravityVm, args: &[Value], _nargs: u16, rindex: u32) -> bool {
    if let Some(f) = to_float(vm, args[2]) {
        vm.heap.gcratio = f;
    }
    ret!(vm, rindex, Value::Null)
}
