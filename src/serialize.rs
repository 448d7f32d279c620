//! JSON executable (de)serialization.
//!
//! The compiler front-end emits a JSON object tree; every serialized object
//! carries a mandatory `type` field (`function`, `class`, `map`, `range`,
//! `instance`, `enum`, `var`). Bytecode travels as uppercase hex text, one
//! 32-bit instruction per 8 characters.
//!
//! Deserialization runs with the collector off, then a second pass resolves
//! superclass names (created classes first, then globals) and instance
//! class names. The returned $moduleinit closure is retained so it survives
//! until the embedder runs it.

use serde_json::{json, Map as JsonMap, Value as Json};

use crate::bytecode::{bytecode_from_hex, bytecode_to_hex};
use crate::core::object::{
    FunctionKind, GravityClosure, GravityFunction, GravityInstance, GravityMap, GravityObject,
    NativeCode,
};
use crate::core::oop::{class_bind, class_new_pair};
use crate::core::value::{value_display, Value};
use crate::errors::GravityError;
use crate::gc::GcRef;
use crate::vm::GravityVm;

const LABEL_TYPE: &str = "type";
const LABEL_IDENTIFIER: &str = "identifier";
const LABEL_TAG: &str = "tag";
const LABEL_NPARAM: &str = "nparam";
const LABEL_NLOCAL: &str = "nlocal";
const LABEL_NTEMP: &str = "ntemp";
const LABEL_NUP: &str = "nup";
const LABEL_ARGS: &str = "args";
const LABEL_PURITY: &str = "purity";
const LABEL_BYTECODE: &str = "bytecode";
const LABEL_LINENO: &str = "lineno";
const LABEL_POOL: &str = "pool";
const LABEL_PVALUES: &str = "pvalues";
const LABEL_PNAMES: &str = "pnames";
const LABEL_SUPER: &str = "super";
const LABEL_NIVAR: &str = "nivar";
const LABEL_SIVAR: &str = "sivar";
const LABEL_STRUCT: &str = "struct";
const LABEL_META: &str = "meta";
const LABEL_INDEX: &str = "index";
const LABEL_FROM: &str = "from";
const LABEL_TO: &str = "to";
const LABEL_GETTER: &str = "$get";
const LABEL_SETTER: &str = "$set";
const LABEL_CLASS: &str = "class";
const LABEL_VALUE: &str = "value";

const TYPE_FUNCTION: &str = "function";
const TYPE_CLASS: &str = "class";
const TYPE_MAP: &str = "map";
const TYPE_RANGE: &str = "range";
const TYPE_INSTANCE: &str = "instance";
const TYPE_ENUM: &str = "enum";
const TYPE_VAR: &str = "var";

/// Module-lifecycle entry point emitted by the compiler.
pub const MODULEINIT_NAME: &str = "$moduleinit";
/// Prefix of multi-arity bridged constructors ($init1, $init2, ...).
pub const INIT_PREFIX: &str = "$init";

pub fn is_bridged_constructor_name(name: &str) -> bool {
    name.len() > INIT_PREFIX.len() && name.starts_with(INIT_PREFIX)
}

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

struct LoadCtx {
    classes: Vec<GcRef>,
    pending_instances: Vec<(GcRef, String)>,
}

/// Parse a compiled JSON executable and return the retained $moduleinit
/// closure, ready for `GravityVm::load_closure`.
pub fn load_buffer(vm: &mut GravityVm, text: &str) -> Result<GcRef, GravityError> {
    let json: Json = serde_json::from_str(text)
        .map_err(|_| GravityError::serialize("Unable to parse JSON executable file."))?;
    load_json(vm, &json)
}

pub fn load_json(vm: &mut GravityVm, json: &Json) -> Result<GcRef, GravityError> {
    let obj = json
        .as_object()
        .filter(|o| o.get(LABEL_TYPE).and_then(Json::as_str) == Some(TYPE_FUNCTION))
        .ok_or_else(|| GravityError::serialize("A function object is expected at the top level."))?;

    vm.gc_enable(false);
    let mut ctx = LoadCtx { classes: Vec::new(), pending_instances: Vec::new() };
    let result = (|| {
        let func = deserialize_function(vm, &mut ctx, obj)?;
        let closure = vm.alloc(GravityObject::Closure(GravityClosure::new(func, 0)));
        resolve_pass(vm, &ctx)?;
        Ok(closure)
    })();
    vm.gc_enable(true);

    let closure = result?;
    // pin it: the embedder owns a reference until it releases the closure
    vm.heap.closure_mut(closure).refcount += 1;
    Ok(closure)
}

/// Second pass: superclasses by name (enclosing classes first, then
/// globals), then pending instance classes.
fn resolve_pass(vm: &mut GravityVm, ctx: &LoadCtx) -> Result<(), GravityError> {
    for &class in &ctx.classes {
        let Some(supername) = vm.heap.class(class).superlook.clone() else {
            continue;
        };
        let resolved = lookup_class_by_name(vm, &ctx.classes, &supername);
        match resolved {
            Some(superclass) => {
                let parent_ivars = vm.heap.class(superclass).nivars;
                let c = vm.heap.class_mut(class);
                c.superclass = Some(superclass);
                c.superlook = None;
                // parent slots come first; this class's indices shift up
                c.nivars += parent_ivars;
                c.ivars.resize(c.nivars as usize, Value::Null);
            }
            None => {
                let cname = vm.heap.class(class).identifier.clone();
                return Err(GravityError::serialize(format!(
                    "Unable to find superclass {} of class {}.",
                    supername, cname
                )));
            }
        }
    }
    for (inst, cname) in &ctx.pending_instances {
        match lookup_class_by_name(vm, &ctx.classes, cname) {
            Some(class) => {
                let nivars = vm.heap.class(class).nivars as usize;
                let i = vm.heap.instance_mut(*inst);
                i.class = class;
                i.ivars.resize(nivars, Value::Null);
            }
            None => {
                return Err(GravityError::serialize(format!(
                    "Unable to find class {} of a serialized instance.",
                    cname
                )));
            }
        }
    }
    Ok(())
}

fn lookup_class_by_name(vm: &mut GravityVm, created: &[GcRef], name: &str) -> Option<GcRef> {
    for &c in created {
        if vm.heap.class(c).identifier == name {
            return Some(c);
        }
    }
    vm.get_value(name)
        .and_then(|v| v.as_object())
        .filter(|&r| matches!(vm.heap.get(r), GravityObject::Class(_)))
}

fn deserialize_value(vm: &mut GravityVm, ctx: &mut LoadCtx, json: &Json) -> Result<Value, GravityError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Json::String(s) => Ok(vm.new_string(s)),
        Json::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for it in items {
                values.push(deserialize_value(vm, ctx, it)?);
            }
            Ok(vm.new_list(values))
        }
        Json::Object(obj) => deserialize_object(vm, ctx, obj),
    }
}

fn deserialize_object(vm: &mut GravityVm, ctx: &mut LoadCtx, obj: &JsonMap<String, Json>) -> Result<Value, GravityError> {
    let Some(ty) = obj.get(LABEL_TYPE).and_then(Json::as_str) else {
        return Err(GravityError::serialize("Unable to recognize object type."));
    };
    match ty {
        TYPE_FUNCTION | TYPE_VAR => {
            let f = deserialize_function(vm, ctx, obj)?;
            Ok(Value::Object(f))
        }
        TYPE_CLASS => {
            let c = deserialize_class(vm, ctx, obj)?;
            Ok(Value::Object(c))
        }
        TYPE_RANGE => {
            let from = obj.get(LABEL_FROM).and_then(Json::as_i64).unwrap_or(0);
            let to = obj.get(LABEL_TO).and_then(Json::as_i64).unwrap_or(0);
            Ok(vm.new_range(from, to))
        }
        TYPE_MAP | TYPE_ENUM => {
            let map = vm.alloc(GravityObject::Map(GravityMap::default()));
            vm.heap.temp_push(map);
            for (k, v) in obj.iter().filter(|(k, _)| k.as_str() != LABEL_TYPE) {
                let key = vm.new_string(k);
                let value = deserialize_value(vm, ctx, v)?;
                let mut table = std::mem::take(&mut vm.heap.map_mut(map).table);
                table.insert(&vm.heap, key, value);
                vm.heap.map_mut(map).table = table;
            }
            vm.heap.temp_pop();
            Ok(Value::Object(map))
        }
        TYPE_INSTANCE => {
            let Some(cname) = obj.get(LABEL_CLASS).and_then(Json::as_str) else {
                return Err(GravityError::serialize("A class name is expected in a serialized instance."));
            };
            let object_cls = vm.core_classes().object;
            let inst = vm.alloc(GravityObject::Instance(GravityInstance::new(object_cls, 0)));
            ctx.pending_instances.push((inst, cname.to_string()));
            Ok(Value::Object(inst))
        }
        _ => Err(GravityError::serialize("Unable to recognize object type.")),
    }
}

fn hex_field(obj: &JsonMap<String, Json>, label: &str) -> Result<Vec<u32>, GravityError> {
    match obj.get(label).and_then(Json::as_str) {
        Some(hex) => bytecode_from_hex(hex)
            .ok_or_else(|| GravityError::serialize("Malformed bytecode hex stream.")),
        None => Ok(Vec::new()),
    }
}

fn deserialize_function(vm: &mut GravityVm, ctx: &mut LoadCtx, obj: &JsonMap<String, Json>) -> Result<GcRef, GravityError> {
    // computed property entry
    if obj.get(LABEL_TYPE).and_then(Json::as_str) == Some(TYPE_VAR) {
        let index = obj.get(LABEL_INDEX).and_then(Json::as_u64).map(|n| n as u32);
        let getter = match obj.get(LABEL_GETTER) {
            Some(Json::Object(g)) => {
                let f = deserialize_function(vm, ctx, g)?;
                Some(vm.alloc(GravityObject::Closure(GravityClosure::new(f, 0))))
            }
            _ => None,
        };
        let setter = match obj.get(LABEL_SETTER) {
            Some(Json::Object(s)) => {
                let f = deserialize_function(vm, ctx, s)?;
                Some(vm.alloc(GravityObject::Closure(GravityClosure::new(f, 0))))
            }
            _ => None,
        };
        let special = GravityFunction::special(
            index.unwrap_or(crate::core::object::COMPUTED_INDEX),
            getter,
            setter,
        );
        return Ok(vm.alloc(GravityObject::Function(special)));
    }

    let identifier = obj
        .get(LABEL_IDENTIFIER)
        .and_then(Json::as_str)
        .map(|s| s.to_string());
    let nparams = obj.get(LABEL_NPARAM).and_then(Json::as_u64).unwrap_or(0) as u16;
    let nlocals = obj.get(LABEL_NLOCAL).and_then(Json::as_u64).unwrap_or(0) as u16;
    let ntemps = obj.get(LABEL_NTEMP).and_then(Json::as_u64).unwrap_or(0) as u16;
    let nupvalues = obj.get(LABEL_NUP).and_then(Json::as_u64).unwrap_or(0) as u16;
    let useargs = obj.get(LABEL_ARGS).and_then(Json::as_bool).unwrap_or(false);
    let purity = obj.get(LABEL_PURITY).and_then(Json::as_f64).unwrap_or(0.0);

    let bytecode = hex_field(obj, LABEL_BYTECODE)?;
    let lineno = hex_field(obj, LABEL_LINENO)?;

    let mut code = NativeCode {
        bytecode,
        lineno,
        cpool: Vec::new(),
        pvalues: Vec::new(),
        pnames: Vec::new(),
        useargs,
        purity,
    };
    let func = vm.alloc(GravityObject::Function(GravityFunction {
        identifier,
        nparams,
        nlocals,
        ntemps,
        nupvalues,
        kind: FunctionKind::Native(NativeCode::default()),
    }));
    vm.heap.temp_push(func);

    let filled: Result<(), GravityError> = (|| {
        if let Some(Json::Array(pool)) = obj.get(LABEL_POOL) {
            for entry in pool {
                let v = deserialize_value(vm, ctx, entry)?;
                code.cpool.push(v);
            }
        }
        if let Some(Json::Array(pvalues)) = obj.get(LABEL_PVALUES) {
            for entry in pvalues {
                let v = deserialize_value(vm, ctx, entry)?;
                code.pvalues.push(v);
            }
        }
        if let Some(Json::Array(pnames)) = obj.get(LABEL_PNAMES) {
            for entry in pnames {
                let v = deserialize_value(vm, ctx, entry)?;
                code.pnames.push(v);
            }
        }
        Ok(())
    })();
    vm.heap.temp_pop();
    filled?;
    vm.heap.function_mut(func).kind = FunctionKind::Native(code);
    Ok(func)
}

fn deserialize_class(vm: &mut GravityVm, ctx: &mut LoadCtx, obj: &JsonMap<String, Json>) -> Result<GcRef, GravityError> {
    let Some(identifier) = obj.get(LABEL_IDENTIFIER).and_then(Json::as_str) else {
        return Err(GravityError::serialize("A class identifier is mandatory."));
    };
    let class_cls = vm.core_classes().class;
    let object_cls = vm.core_classes().object;
    let class = class_new_pair(&mut vm.heap, class_cls, identifier, Some(object_cls));
    ctx.classes.push(class);

    // superclass resolves by name in the second pass; absent or "Object"
    // means the Object root
    if let Some(supername) = obj.get(LABEL_SUPER).and_then(Json::as_str) {
        if supername != "Object" {
            vm.heap.class_mut(class).superlook = Some(supername.to_string());
        }
    }

    let nivar = obj.get(LABEL_NIVAR).and_then(Json::as_u64).unwrap_or(0) as u16;
    let sivar = obj.get(LABEL_SIVAR).and_then(Json::as_u64).unwrap_or(0) as u16;
    let is_struct = obj.get(LABEL_STRUCT).and_then(Json::as_bool).unwrap_or(false);
    {
        let c = vm.heap.class_mut(class);
        c.is_struct = is_struct;
        c.grow_ivars(nivar);
    }
    if sivar > 0 {
        let meta = vm.heap.class(class).meta.expect("class pair has a metaclass");
        vm.heap.class_mut(meta).grow_ivars(sivar);
    }

    // every remaining object-valued key is an inner entry bound under its name
    let reserved = [
        LABEL_TYPE, LABEL_IDENTIFIER, LABEL_SUPER, LABEL_NIVAR, LABEL_SIVAR, LABEL_STRUCT,
        LABEL_META,
    ];
    for (key, entry) in obj.iter() {
        if reserved.contains(&key.as_str()) {
            continue;
        }
        let value = deserialize_value(vm, ctx, entry)?;
        bind_deserialized(vm, class, key, value);
    }

    // metaclass entries
    if let Some(Json::Array(meta_entries)) = obj.get(LABEL_META) {
        let meta = vm.heap.class(class).meta.expect("class pair has a metaclass");
        for entry in meta_entries {
            let value = deserialize_value(vm, ctx, entry)?;
            let name = entry
                .get(LABEL_IDENTIFIER)
                .and_then(Json::as_str)
                .unwrap_or("")
                .to_string();
            if !name.is_empty() {
                bind_deserialized(vm, meta, &name, value);
            }
        }
    }

    Ok(class)
}

/// Bind a deserialized entry to a class; functions are wrapped in closures
/// the way the dispatcher expects them.
fn bind_deserialized(vm: &mut GravityVm, class: GcRef, name: &str, value: Value) {
    let stored = match value.as_object() {
        Some(r) if matches!(vm.heap.get(r), GravityObject::Function(_)) => {
            let wrapped = vm.alloc(GravityObject::Closure(GravityClosure::new(r, 0)));
            Value::Object(wrapped)
        }
        _ => value,
    };
    let key = vm.intern(name);
    class_bind(&mut vm.heap, class, Value::Object(key), stored);
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

pub fn serialize_value(vm: &GravityVm, v: Value) -> Json {
    match v {
        Value::Null | Value::Undefined | Value::Invalid => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(f) => json!(f),
        Value::Object(r) => match vm.heap().get(r) {
            GravityObject::String(s) => json!(s.s),
            GravityObject::Range(rg) => json!({
                LABEL_TYPE: TYPE_RANGE,
                LABEL_FROM: rg.from,
                LABEL_TO: rg.to,
            }),
            GravityObject::List(l) => {
                Json::Array(l.items.iter().map(|&i| serialize_value(vm, i)).collect())
            }
            GravityObject::Map(m) => {
                let mut out = JsonMap::new();
                out.insert(LABEL_TYPE.to_string(), json!(TYPE_MAP));
                for (k, val) in m.table.entries() {
                    out.insert(value_display(vm.heap(), k), serialize_value(vm, val));
                }
                Json::Object(out)
            }
            GravityObject::Function(_) => serialize_function(vm, r),
            GravityObject::Closure(c) => serialize_function(vm, c.func),
            GravityObject::Class(_) => serialize_class(vm, r),
            _ => Json::Null,
        },
    }
}

pub fn serialize_function(vm: &GravityVm, func: GcRef) -> Json {
    let f = vm.heap().function(func);
    let mut out = JsonMap::new();
    out.insert(LABEL_TYPE.to_string(), json!(TYPE_FUNCTION));
    if let Some(id) = &f.identifier {
        out.insert(LABEL_IDENTIFIER.to_string(), json!(id));
    }

    match &f.kind {
        FunctionKind::Native(code) => {
            out.insert(LABEL_TAG.to_string(), json!(0));
            out.insert(LABEL_NPARAM.to_string(), json!(f.nparams));
            out.insert(LABEL_NLOCAL.to_string(), json!(f.nlocals));
            out.insert(LABEL_NTEMP.to_string(), json!(f.ntemps));
            out.insert(LABEL_NUP.to_string(), json!(f.nupvalues));
            out.insert(LABEL_ARGS.to_string(), json!(code.useargs));
            out.insert(LABEL_PURITY.to_string(), json!(code.purity));
            if !code.bytecode.is_empty() {
                out.insert(LABEL_BYTECODE.to_string(), json!(bytecode_to_hex(&code.bytecode)));
            }
            if !code.lineno.is_empty() {
                out.insert(LABEL_LINENO.to_string(), json!(bytecode_to_hex(&code.lineno)));
            }
            if !code.cpool.is_empty() {
                out.insert(
                    LABEL_POOL.to_string(),
                    Json::Array(code.cpool.iter().map(|&v| serialize_value(vm, v)).collect()),
                );
            }
            if !code.pvalues.is_empty() {
                out.insert(
                    LABEL_PVALUES.to_string(),
                    Json::Array(code.pvalues.iter().map(|&v| serialize_value(vm, v)).collect()),
                );
            }
            if !code.pnames.is_empty() {
                out.insert(
                    LABEL_PNAMES.to_string(),
                    Json::Array(code.pnames.iter().map(|&v| serialize_value(vm, v)).collect()),
                );
            }
        }
        FunctionKind::Special { index, getter, setter } => {
            out.insert(LABEL_TYPE.to_string(), json!(TYPE_VAR));
            out.insert(LABEL_INDEX.to_string(), json!(index));
            if let Some(g) = getter {
                let gf = vm.heap().closure(*g).func;
                out.insert(LABEL_GETTER.to_string(), serialize_function(vm, gf));
            }
            if let Some(s) = setter {
                let sf = vm.heap().closure(*s).func;
                out.insert(LABEL_SETTER.to_string(), serialize_function(vm, sf));
            }
        }
        // internal and bridged functions have no portable representation
        _ => {}
    }
    Json::Object(out)
}

pub fn serialize_class(vm: &GravityVm, class: GcRef) -> Json {
    let c = vm.heap().class(class);
    let mut out = JsonMap::new();
    out.insert(LABEL_TYPE.to_string(), json!(TYPE_CLASS));
    out.insert(LABEL_IDENTIFIER.to_string(), json!(c.identifier));
    if let Some(superclass) = c.superclass {
        let sname = &vm.heap().class(superclass).identifier;
        if sname != "Object" {
            out.insert(LABEL_SUPER.to_string(), json!(sname));
        }
    }
    out.insert(LABEL_NIVAR.to_string(), json!(c.nivars));
    if c.is_struct {
        out.insert(LABEL_STRUCT.to_string(), json!(true));
    }
    for (k, v) in c.methods.entries() {
        out.insert(value_display(vm.heap(), k), serialize_value(vm, v));
    }
    if let Some(meta) = c.meta {
        let m = vm.heap().class(meta);
        if m.nivars > 0 {
            out.insert(LABEL_SIVAR.to_string(), json!(m.nivars));
        }
        if !m.methods.is_empty() {
            let entries: Vec<Json> = m.methods.entries().map(|(_, v)| serialize_value(vm, v)).collect();
            out.insert(LABEL_META.to_string(), Json::Array(entries));
        }
    }
    Json::Object(out)
}
