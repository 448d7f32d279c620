//! Heap object variants managed by the garbage collector.
//!
//! Every live object is one arm of `GravityObject`; the mark bits live in the
//! arena slot so the payload structs stay plain data. Cross-object references
//! are non-owning `GcRef` indices, the collector is the only lifetime
//! authority (cycles such as class <-> metaclass are legal).

use std::any::Any;

use crate::core::value::{hash_buffer, Value};
use crate::fiber::GravityFiber;
use crate::gc::GcRef;
use crate::hash::HashTable;
use crate::vm::GravityVm;

/// Sentinel for the `index` field of a bridged function.
pub const BRIDGE_INDEX: u32 = 0xFFFF;
/// Sentinel for the `index` field of a computed property.
pub const COMPUTED_INDEX: u32 = 0xFFFE;

/// Hard cap on instance variables per class.
pub const MAX_IVARS: u16 = 768;

/// Opaque embedder payload attached to bridged classes/instances/functions.
pub struct XData(pub Box<dyn Any>);

impl std::fmt::Debug for XData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<xdata>")
    }
}

impl XData {
    pub fn new(data: impl Any) -> Self {
        XData(Box::new(data))
    }
}

/// Signature of an internal (Rust) callable. Returning `true` means the
/// result has been stored in slot `rindex`; `false` asks the VM to check,
/// in order: a pending fiber error, a closure left in `rindex` to tail-call,
/// or a fiber switch/yield.
pub type InternalFn = fn(&mut GravityVm, &[Value], u16, u32) -> bool;

#[derive(Debug)]
pub enum GravityObject {
    String(GravityString),
    Range(GravityRange),
    List(GravityList),
    Map(GravityMap),
    Function(GravityFunction),
    Closure(GravityClosure),
    Upvalue(GravityUpvalue),
    Class(GravityClass),
    Instance(GravityInstance),
    Module(GravityModule),
    Fiber(Box<GravityFiber>),
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GravityString {
    pub s: String,
    /// murmur3 of the byte content, computed once at allocation.
    pub hash: u32,
}

impl GravityString {
    pub fn new(s: String) -> Self {
        let hash = hash_buffer(s.as_bytes());
        GravityString { s, hash }
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }
}

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

/// Always stored inclusive; RANGENEW normalizes exclusive ranges.
#[derive(Debug, Clone, Copy)]
pub struct GravityRange {
    pub from: i64,
    pub to: i64,
}

impl GravityRange {
    pub fn count(&self) -> i64 {
        if self.to >= self.from {
            self.to - self.from + 1
        } else {
            self.from - self.to + 1
        }
    }

    pub fn contains(&self, n: i64) -> bool {
        let (lo, hi) = if self.from <= self.to {
            (self.from, self.to)
        } else {
            (self.to, self.from)
        };
        n >= lo && n <= hi
    }
}

// ---------------------------------------------------------------------------
// List / Map
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct GravityList {
    pub items: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct GravityMap {
    pub table: HashTable,
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionTag {
    Native,
    Internal,
    Bridged,
    Special,
}

/// Bytecode and constants of a compiled (Native) function.
#[derive(Debug, Default)]
pub struct NativeCode {
    pub bytecode: Vec<u32>,
    pub lineno: Vec<u32>,
    pub cpool: Vec<Value>,
    /// Default values for optional parameters.
    pub pvalues: Vec<Value>,
    /// Parameter names (String values), used by keyword invocation.
    pub pnames: Vec<Value>,
    /// True when the body references the implicit `_args` list.
    pub useargs: bool,
    pub purity: f64,
}

#[derive(Debug)]
pub enum FunctionKind {
    Native(NativeCode),
    Internal(InternalFn),
    Bridged { xdata: Option<XData> },
    /// Computed property or indexed ivar accessor.
    Special {
        index: u32,
        getter: Option<GcRef>,
        setter: Option<GcRef>,
    },
}

#[derive(Debug)]
pub struct GravityFunction {
    pub identifier: Option<String>,
    pub nparams: u16,
    pub nlocals: u16,
    pub ntemps: u16,
    pub nupvalues: u16,
    pub kind: FunctionKind,
}

impl GravityFunction {
    pub fn internal(identifier: &str, nparams: u16, f: InternalFn) -> Self {
        GravityFunction {
            identifier: Some(identifier.to_string()),
            nparams,
            nlocals: 0,
            ntemps: 0,
            nupvalues: 0,
            kind: FunctionKind::Internal(f),
        }
    }

    pub fn native(identifier: Option<String>, nparams: u16, nlocals: u16, code: NativeCode) -> Self {
        GravityFunction {
            identifier,
            nparams,
            nlocals,
            ntemps: 0,
            nupvalues: 0,
            kind: FunctionKind::Native(code),
        }
    }

    pub fn special(index: u32, getter: Option<GcRef>, setter: Option<GcRef>) -> Self {
        GravityFunction {
            identifier: None,
            nparams: 0,
            nlocals: 0,
            ntemps: 0,
            nupvalues: 0,
            kind: FunctionKind::Special { index, getter, setter },
        }
    }

    pub fn tag(&self) -> FunctionTag {
        match self.kind {
            FunctionKind::Native(_) => FunctionTag::Native,
            FunctionKind::Internal(_) => FunctionTag::Internal,
            FunctionKind::Bridged { .. } => FunctionTag::Bridged,
            FunctionKind::Special { .. } => FunctionTag::Special,
        }
    }

    pub fn code(&self) -> &NativeCode {
        match &self.kind {
            FunctionKind::Native(c) => c,
            _ => panic!("function is not native"),
        }
    }

    pub fn code_mut(&mut self) -> &mut NativeCode {
        match &mut self.kind {
            FunctionKind::Native(c) => c,
            _ => panic!("function is not native"),
        }
    }

    /// Register slots a frame running this function needs.
    pub fn countreg(&self, nargs: u16) -> usize {
        (self.nparams.max(nargs) as usize) + self.nlocals as usize + self.ntemps as usize
    }
}

// ---------------------------------------------------------------------------
// Closure / Upvalue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GravityClosure {
    pub func: GcRef,
    pub upvalues: Vec<GcRef>,
    /// Bound receiver set by Func.bind.
    pub context: Option<GcRef>,
    /// Pin count held by the embedder (kept alive across collections).
    pub refcount: u32,
}

impl GravityClosure {
    pub fn new(func: GcRef, nupvalues: usize) -> Self {
        GravityClosure {
            func,
            upvalues: Vec::with_capacity(nupvalues),
            context: None,
            refcount: 0,
        }
    }
}

/// A captured variable: open while the defining frame is live (absolute
/// index into the owning fiber's stack), closed afterwards.
#[derive(Debug)]
pub enum UpvalueState {
    Open { fiber: GcRef, index: usize },
    Closed(Value),
}

#[derive(Debug)]
pub struct GravityUpvalue {
    pub state: UpvalueState,
}

impl GravityUpvalue {
    pub fn stack_index(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { index, .. } => Some(index),
            UpvalueState::Closed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Class / Instance / Module
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GravityClass {
    pub identifier: String,
    /// None only on metaclasses; resolves to the Class class.
    pub meta: Option<GcRef>,
    pub superclass: Option<GcRef>,
    /// Pending superclass name, resolved in the deserializer second pass.
    pub superlook: Option<String>,
    /// Total instance variable count, parents included.
    pub nivars: u16,
    /// Class-level variable storage (statics live on the metaclass).
    pub ivars: Vec<Value>,
    pub methods: HashTable,
    pub is_struct: bool,
    pub is_inited: bool,
    pub has_outer: bool,
    pub xdata: Option<XData>,
}

impl GravityClass {
    pub fn new(identifier: impl Into<String>) -> Self {
        GravityClass {
            identifier: identifier.into(),
            meta: None,
            superclass: None,
            superlook: None,
            nivars: 0,
            ivars: Vec::new(),
            methods: HashTable::new(),
            is_struct: false,
            is_inited: false,
            has_outer: false,
            xdata: None,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.meta.is_none()
    }

    pub fn grow_ivars(&mut self, n: u16) -> bool {
        if self.nivars + n >= MAX_IVARS {
            return false;
        }
        self.nivars += n;
        self.ivars.resize(self.nivars as usize, Value::Null);
        true
    }
}

#[derive(Debug)]
pub struct GravityInstance {
    pub class: GcRef,
    pub ivars: Vec<Value>,
    pub xdata: Option<XData>,
}

impl GravityInstance {
    pub fn new(class: GcRef, nivars: usize) -> Self {
        GravityInstance {
            class,
            ivars: vec![Value::Null; nivars],
            xdata: None,
        }
    }
}

#[derive(Debug)]
pub struct GravityModule {
    pub identifier: String,
    pub exports: HashTable,
}

// ---------------------------------------------------------------------------
// Shallow sizes (GC accounting)
// ---------------------------------------------------------------------------

impl GravityObject {
    /// Bytes owned directly by this object. Container elements are inline
    /// `Value`s; referenced heap objects account for themselves.
    pub fn shallow_size(&self) -> u64 {
        let base = std::mem::size_of::<GravityObject>() as u64;
        base + match self {
            GravityObject::String(s) => s.s.capacity() as u64,
            GravityObject::Range(_) => 0,
            GravityObject::List(l) => (l.items.capacity() * std::mem::size_of::<Value>()) as u64,
            GravityObject::Map(m) => m.table.mem_size(),
            GravityObject::Function(f) => match &f.kind {
                FunctionKind::Native(c) => {
                    (c.bytecode.capacity() * 4
                        + c.lineno.capacity() * 4
                        + (c.cpool.capacity() + c.pvalues.capacity() + c.pnames.capacity())
                            * std::mem::size_of::<Value>()) as u64
                }
                _ => 0,
            },
            GravityObject::Closure(c) => (c.upvalues.capacity() * 4) as u64,
            GravityObject::Upvalue(_) => 0,
            GravityObject::Class(c) => {
                c.identifier.capacity() as u64
                    + (c.ivars.capacity() * std::mem::size_of::<Value>()) as u64
                    + c.methods.mem_size()
            }
            GravityObject::Instance(i) => (i.ivars.capacity() * std::mem::size_of::<Value>()) as u64,
            GravityObject::Module(m) => m.identifier.capacity() as u64 + m.exports.mem_size(),
            GravityObject::Fiber(f) => {
                (f.stack.capacity() * std::mem::size_of::<Value>()) as u64
                    + (f.frames.capacity() * std::mem::size_of::<crate::fiber::CallFrame>()) as u64
            }
        }
    }
}
