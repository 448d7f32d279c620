//! Class graph wiring and method lookup.
//!
//! Every class has a metaclass: Object.metaclass is Class, Class.metaclass
//! is Class itself, and any other metaclass inherits from Class so that
//! class-level methods (Fiber.create, Class.exec, ...) resolve through the
//! normal lookup walk. Lookup goes class -> superclass -> ... and stops at
//! Object.

use std::collections::HashMap;

use crate::core::object::{GravityClass, GravityInstance, GravityObject, GravityString};
use crate::core::value::Value;
use crate::gc::{GcHeap, GcRef};

/// Prefix of compiler/VM generated per-instance classes.
pub const ANON_PREFIX: &str = "$$";

/// References to the built-in class singletons. Allocated once at VM
/// startup and rooted for the VM's whole lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub object: GcRef,
    pub class: GcRef,
    pub null: GcRef,
    pub bool_: GcRef,
    pub int: GcRef,
    pub float: GcRef,
    pub string: GcRef,
    pub func: GcRef,
    pub closure: GcRef,
    pub fiber: GcRef,
    pub instance: GcRef,
    pub list: GcRef,
    pub map: GcRef,
    pub range: GcRef,
    pub upvalue: GcRef,
    pub module: GcRef,
    pub system: GcRef,
}

impl CoreClasses {
    pub fn all(&self) -> [GcRef; 17] {
        [
            self.object, self.class, self.null, self.bool_, self.int, self.float,
            self.string, self.func, self.closure, self.fiber, self.instance,
            self.list, self.map, self.range, self.upvalue, self.module, self.system,
        ]
    }
}

/// Intern a string into the shared pool so v-table keys compare by identity.
pub fn intern_str(heap: &mut GcHeap, pool: &mut HashMap<String, GcRef>, s: &str) -> GcRef {
    if let Some(&r) = pool.get(s) {
        return r;
    }
    let r = heap.alloc(GravityObject::String(GravityString::new(s.to_string())));
    pool.insert(s.to_string(), r);
    r
}

/// Allocate a (class, metaclass) pair. The metaclass inherits from Class,
/// the class from `superclass` (Object unless stated otherwise).
pub fn class_new_pair(
    heap: &mut GcHeap,
    class_cls: GcRef,
    name: &str,
    superclass: Option<GcRef>,
) -> GcRef {
    let mut meta = GravityClass::new(format!("{} meta", name));
    meta.superclass = Some(class_cls);
    let meta_ref = heap.alloc(GravityObject::Class(meta));

    let mut class = GravityClass::new(name);
    class.meta = Some(meta_ref);
    class.superclass = superclass;
    heap.alloc(GravityObject::Class(class))
}

/// Build the bare core-class graph (no methods yet; corelib adds those).
pub fn core_classes_init(heap: &mut GcHeap) -> CoreClasses {
    // bootstrap: Class is its own metaclass, Object's metaclass is Class
    let class = heap.alloc(GravityObject::Class(GravityClass::new("Class")));
    let object = {
        let mut c = GravityClass::new("Object");
        c.meta = Some(class);
        heap.alloc(GravityObject::Class(c))
    };
    {
        let c = heap.class_mut(class);
        c.meta = Some(class);
        c.superclass = Some(object);
    }

    let null = class_new_pair(heap, class, "Null", Some(object));
    let bool_ = class_new_pair(heap, class, "Bool", Some(object));
    let int = class_new_pair(heap, class, "Int", Some(object));
    let float = class_new_pair(heap, class, "Float", Some(object));
    let string = class_new_pair(heap, class, "String", Some(object));
    let func = class_new_pair(heap, class, "Func", Some(object));
    let closure = class_new_pair(heap, class, "Closure", Some(object));
    let fiber = class_new_pair(heap, class, "Fiber", Some(object));
    let instance = class_new_pair(heap, class, "Instance", Some(object));
    let list = class_new_pair(heap, class, "List", Some(object));
    let map = class_new_pair(heap, class, "Map", Some(object));
    let range = class_new_pair(heap, class, "Range", Some(object));
    let upvalue = class_new_pair(heap, class, "Upvalue", Some(object));
    let module = class_new_pair(heap, class, "Module", Some(object));
    let system = class_new_pair(heap, class, "System", Some(object));

    CoreClasses {
        object, class, null, bool_, int, float, string, func, closure,
        fiber, instance, list, map, range, upvalue, module, system,
    }
}

/// Runtime class of a value. `None` only for the invalid sentinel.
pub fn class_of(heap: &GcHeap, core: &CoreClasses, v: Value) -> Option<GcRef> {
    match v {
        Value::Null | Value::Undefined => Some(core.null),
        Value::Bool(_) => Some(core.bool_),
        Value::Int(_) => Some(core.int),
        Value::Float(_) => Some(core.float),
        Value::Invalid => None,
        Value::Object(r) => Some(match heap.get(r) {
            GravityObject::String(_) => core.string,
            GravityObject::Range(_) => core.range,
            GravityObject::List(_) => core.list,
            GravityObject::Map(_) => core.map,
            GravityObject::Function(_) => core.func,
            GravityObject::Closure(_) => core.closure,
            GravityObject::Upvalue(_) => core.upvalue,
            GravityObject::Module(_) => core.module,
            GravityObject::Fiber(_) => core.fiber,
            GravityObject::Instance(i) => i.class,
            GravityObject::Class(c) => match c.meta {
                Some(meta) => meta,
                None => core.class, // metaclasses are instances of Class
            },
        }),
    }
}

/// Superclass used by the `super` constant: one level above the value's
/// own class.
pub fn value_getsuper(heap: &GcHeap, core: &CoreClasses, v: Value) -> Option<GcRef> {
    let class = class_of(heap, core, v)?;
    heap.class(class).superclass
}

/// Walk the superclass chain looking for `key`.
pub fn class_lookup(heap: &GcHeap, class: GcRef, key: Value) -> Option<Value> {
    let mut current = Some(class);
    while let Some(c) = current {
        let cls = heap.class(c);
        if let Some(v) = cls.methods.lookup(heap, key) {
            return Some(v);
        }
        current = cls.superclass;
    }
    None
}

/// True when `class` appears in the superclass chain of `sub` (ISA).
pub fn class_is_a(heap: &GcHeap, sub: GcRef, class: GcRef) -> bool {
    let mut current = Some(sub);
    while let Some(c) = current {
        if c == class {
            return true;
        }
        current = heap.class(c).superclass;
    }
    false
}

/// Bind `value` under `key` in the class's method table. The table is moved
/// out and back because hashing needs the heap.
pub fn class_bind(heap: &mut GcHeap, class: GcRef, key: Value, value: Value) {
    let mut methods = std::mem::take(&mut heap.class_mut(class).methods);
    methods.insert(heap, key, value);
    heap.class_mut(class).methods = methods;
}

/// New instance of `class` with ivar slots for the whole chain.
pub fn instance_new(heap: &mut GcHeap, class: GcRef) -> GcRef {
    let nivars = heap.class(class).nivars as usize;
    heap.alloc(GravityObject::Instance(GravityInstance::new(class, nivars)))
}

/// Inject an anonymous class above the instance's class so a per-instance
/// method never pollutes the shared class. Reuses an already injected one.
pub fn instance_anon_class(
    heap: &mut GcHeap,
    class_cls: GcRef,
    instance: GcRef,
    counter: &mut u32,
) -> GcRef {
    let current = heap.instance(instance).class;
    if heap.class(current).identifier.starts_with(ANON_PREFIX) {
        return current;
    }
    *counter += 1;
    let name = format!("{}{}", ANON_PREFIX, *counter);
    let anon = class_new_pair(heap, class_cls, &name, Some(current));
    let nivars = heap.class(current).nivars;
    heap.class_mut(anon).nivars = nivars;
    heap.instance_mut(instance).class = anon;
    anon
}
