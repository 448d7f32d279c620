//! The Gravity virtual machine.
//!
//! ARCHITECTURE
//! ────────────
//! • 32-bit fixed-width instructions, 6-bit opcode, register based
//! • Registers are a window on the current fiber's value stack; register 0
//!   is self and a CALL's arguments start right after the callable
//! • Integer/float/bool fast paths run inline; everything else dispatches
//!   through interned v-table keys ("+", "load", "==", ...) walking the
//!   receiver's superclass chain
//! • Internal (Rust) callables run in place; Native (bytecode) callables
//!   push a call frame; Special callables route to getter/setter closures;
//!   Bridged callables go through the embedder delegate
//! • The collector runs stop-the-world at allocation points; the VM owns
//!   the roots (globals, fibers, intern pool, temp roots)
//!
//! The interpreter is re-entrant: `run_closure` pushes a frame marked
//! `outloop` so the matching RET hands control back to the embedder without
//! unwinding the enclosing dispatch loop.

use std::collections::HashMap;
use std::time::Instant;

use crate::bytecode::{
    Instr, Op, CPOOL_INDEX_MAX, CPOOL_VALUE_ARGUMENTS, CPOOL_VALUE_FALSE, CPOOL_VALUE_FUNC,
    CPOOL_VALUE_NULL, CPOOL_VALUE_SUPER, CPOOL_VALUE_TRUE, CPOOL_VALUE_UNDEFINED, INLINE_INT_BASE,
};
use crate::core::object::{
    FunctionKind, FunctionTag, GravityClosure, GravityFunction, GravityInstance, GravityList,
    GravityMap, GravityObject, GravityRange, GravityString, UpvalueState,
};
use crate::core::oop::{
    class_is_a, class_lookup, class_of, core_classes_init, intern_str, value_getsuper, CoreClasses,
};
use crate::core::value::{
    value_compare, value_equals, value_identical, Value,
};
use crate::corelib;
use crate::delegate::{DefaultDelegate, GravityDelegate};
use crate::errors::{ErrorKind, GravityError};
use crate::fiber::{CallFrame, FiberStatus, GravityFiber, MAX_FRAMES};
use crate::gc::{GcHeap, GcRef};

/// Reserved embedding slot indices.
pub const SLOT_DATA: u32 = u32::MAX;
pub const SLOT_FIBER_RESULT: u32 = u32::MAX - 1;
pub const SLOT_MESSAGE: u32 = u32::MAX - 2;

/// Interned v-table keys used by the dispatch loop; lookup is a GcRef
/// compare because names are interned once at startup.
#[derive(Debug, Clone, Copy)]
pub struct VTableKeys {
    pub notfound: GcRef,
    pub add: GcRef,
    pub sub: GcRef,
    pub div: GcRef,
    pub mul: GcRef,
    pub rem: GcRef,
    pub and: GcRef,
    pub or: GcRef,
    pub cmp: GcRef,
    pub eqq: GcRef,
    pub is: GcRef,
    pub match_: GcRef,
    pub neg: GcRef,
    pub not: GcRef,
    pub lshift: GcRef,
    pub rshift: GcRef,
    pub band: GcRef,
    pub bor: GcRef,
    pub bxor: GcRef,
    pub bnot: GcRef,
    pub load: GcRef,
    pub loads: GcRef,
    pub loadat: GcRef,
    pub store: GcRef,
    pub storeat: GcRef,
    pub int: GcRef,
    pub float: GcRef,
    pub bool_: GcRef,
    pub string: GcRef,
    pub exec: GcRef,
}

impl VTableKeys {
    fn init(heap: &mut GcHeap, pool: &mut HashMap<String, GcRef>) -> Self {
        let mut k = |s: &str| intern_str(heap, pool, s);
        VTableKeys {
            notfound: k("notfound"),
            add: k("+"),
            sub: k("-"),
            div: k("/"),
            mul: k("*"),
            rem: k("%"),
            and: k("&&"),
            or: k("||"),
            cmp: k("=="),
            eqq: k("==="),
            is: k("is"),
            match_: k("=~"),
            neg: k("neg"),
            not: k("!"),
            lshift: k("<<"),
            rshift: k(">>"),
            band: k("&"),
            bor: k("|"),
            bxor: k("^"),
            bnot: k("~"),
            load: k("load"),
            loads: k("loads"),
            loadat: k("loadat"),
            store: k("store"),
            storeat: k("storeat"),
            int: k("Int"),
            float: k("Float"),
            bool_: k("Bool"),
            string: k("String"),
            exec: k("exec"),
        }
    }
}

/// How a Special (computed property) callable is resolved when reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialMode {
    Getter,
    Setter,
    Forbidden,
}

pub struct GravityVm {
    pub(crate) heap: GcHeap,
    pub(crate) delegate: Box<dyn GravityDelegate>,
    pub(crate) globals: crate::hash::HashTable,
    pub(crate) intern: HashMap<String, GcRef>,
    pub(crate) core: CoreClasses,
    pub(crate) vkeys: VTableKeys,
    /// Currently running fiber.
    fiber: GcRef,
    /// The fiber running $moduleinit / main.
    root_fiber: GcRef,
    pub(crate) aborted: bool,
    /// Silent-null option: failed lookups on null yield null instead of
    /// raising.
    pub(crate) nullsilent: bool,
    pub(crate) anon_counter: u32,
    time_started: Instant,
    reserved_slots: [Value; 3],
}

impl GravityVm {
    pub fn new(delegate: Box<dyn GravityDelegate>) -> Self {
        let mut heap = GcHeap::new();
        // core wiring happens with collection off: half-linked class pairs
        // must not be swept from under us
        heap.set_enabled(false);
        let core = core_classes_init(&mut heap);
        let mut intern = HashMap::new();
        let vkeys = VTableKeys::init(&mut heap, &mut intern);
        let fiber = heap.alloc(GravityObject::Fiber(Box::new(GravityFiber::new())));

        let mut vm = GravityVm {
            heap,
            delegate,
            globals: crate::hash::HashTable::new(),
            intern,
            core,
            vkeys,
            fiber,
            root_fiber: fiber,
            aborted: false,
            nullsilent: false,
            anon_counter: 0,
            time_started: Instant::now(),
            reserved_slots: [Value::Null; 3],
        };
        corelib::register_core(&mut vm);
        vm.heap.set_enabled(true);
        vm
    }

    pub fn new_default() -> Self {
        Self::new(Box::new(DefaultDelegate))
    }

    // ── Small accessors ──────────────────────────────────────────────────────

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GcHeap {
        &mut self.heap
    }

    pub fn core_classes(&self) -> &CoreClasses {
        &self.core
    }

    pub fn current_fiber(&self) -> GcRef {
        self.fiber
    }

    pub(crate) fn set_current_fiber(&mut self, f: GcRef) {
        self.fiber = f;
    }

    pub fn set_null_silent(&mut self, on: bool) {
        self.nullsilent = on;
    }

    pub fn nanotime(&self) -> f64 {
        self.time_started.elapsed().as_secs_f64()
    }

    pub fn class_of(&self, v: Value) -> Option<GcRef> {
        class_of(&self.heap, &self.core, v)
    }

    pub fn intern(&mut self, s: &str) -> GcRef {
        intern_str(&mut self.heap, &mut self.intern, s)
    }

    // ── Allocation (GC trigger point) ────────────────────────────────────────

    /// Track a new object; may run a full collection. The object being
    /// allocated is temp-rooted for the duration of that cycle.
    pub fn alloc(&mut self, object: GravityObject) -> GcRef {
        let r = self.heap.alloc(object);
        if self.heap.should_collect() {
            self.heap.temp_push(r);
            self.gc_collect();
            self.heap.temp_pop();
        }
        r
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::Object(self.alloc(GravityObject::String(GravityString::new(s.to_string()))))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        Value::Object(self.alloc(GravityObject::List(GravityList { items })))
    }

    pub fn new_map(&mut self) -> Value {
        Value::Object(self.alloc(GravityObject::Map(GravityMap::default())))
    }

    pub fn new_range(&mut self, from: i64, to: i64) -> Value {
        Value::Object(self.alloc(GravityObject::Range(GravityRange { from, to })))
    }

    pub fn new_fiber(&mut self, closure: GcRef) -> GcRef {
        let mut fiber = GravityFiber::new();
        let func = self.heap.closure(closure).func;
        let need = self.heap.function(func).countreg(1);
        fiber.ensure_stack(need.max(1));
        fiber.stack[0] = Value::Null;
        fiber.stacktop = need.max(1);
        fiber.frames.push(CallFrame {
            ip: 0,
            stackstart: 0,
            closure,
            dest: 0,
            nargs: 1,
            args: None,
            outloop: false,
        });
        self.alloc(GravityObject::Fiber(Box::new(fiber)))
    }

    /// Wrap an internal function into a (function, closure) pair and return
    /// the closure value, the form every method table stores.
    pub fn new_internal_closure(&mut self, name: &str, nparams: u16, f: crate::core::object::InternalFn) -> Value {
        let func = self.alloc(GravityObject::Function(GravityFunction::internal(name, nparams, f)));
        self.heap.temp_push(func);
        let c = self.alloc(GravityObject::Closure(GravityClosure::new(func, 0)));
        self.heap.temp_pop();
        Value::Object(c)
    }

    // ── Globals / embedding values ───────────────────────────────────────────

    pub fn set_value(&mut self, key: &str, value: Value) {
        let k = self.intern(key);
        let GravityVm { globals, heap, .. } = self;
        globals.insert(heap, Value::Object(k), value);
    }

    pub fn get_value(&mut self, key: &str) -> Option<Value> {
        let k = self.intern(key);
        self.globals.lookup(&self.heap, Value::Object(k))
    }

    /// Read/write a register of the current frame. Reserved indices address
    /// the data/fiber-result/message slots.
    pub fn set_slot(&mut self, rindex: u32, value: Value) {
        if rindex >= SLOT_MESSAGE {
            self.reserved_slots[(u32::MAX - rindex) as usize] = value;
            return;
        }
        let f = self.fiber;
        let base = self
            .heap
            .fiber(f)
            .frames
            .last()
            .map(|fr| fr.stackstart)
            .unwrap_or(0);
        let idx = base + rindex as usize;
        let fib = self.heap.fiber_mut(f);
        fib.ensure_stack(idx + 1);
        fib.stack[idx] = value;
        if fib.stacktop <= idx {
            fib.stacktop = idx + 1;
        }
    }

    pub fn get_slot(&self, rindex: u32) -> Value {
        if rindex >= SLOT_MESSAGE {
            return self.reserved_slots[(u32::MAX - rindex) as usize];
        }
        let f = self.fiber;
        let base = self
            .heap
            .fiber(f)
            .frames
            .last()
            .map(|fr| fr.stackstart)
            .unwrap_or(0);
        self.heap.fiber(f).stack[base + rindex as usize]
    }

    /// Set the current fiber's error; the caller returns false to raise.
    pub fn fiber_error(&mut self, msg: impl Into<String>) {
        let f = self.fiber;
        let fib = self.heap.fiber_mut(f);
        fib.error = Some(msg.into());
        fib.status = FiberStatus::AbortedWithError;
    }

    // ── Register access ──────────────────────────────────────────────────────

    #[inline(always)]
    fn reg(&self, f: GcRef, base: usize, i: u32) -> Value {
        self.heap.fiber(f).stack[base + i as usize]
    }

    #[inline(always)]
    fn set_reg(&mut self, f: GcRef, base: usize, i: u32, v: Value) {
        self.heap.fiber_mut(f).stack[base + i as usize] = v;
    }

    /// LOAD/STORE key operand: register below 256, inline int above.
    #[inline(always)]
    fn index_value(&self, f: GcRef, base: usize, r: u32) -> Value {
        if r < INLINE_INT_BASE {
            self.reg(f, base, r)
        } else {
            Value::Int((r - INLINE_INT_BASE) as i64)
        }
    }

    /// First stack slot past the current frame's register window; scratch
    /// space for operator dispatch.
    fn scratch_window(&self, f: GcRef) -> usize {
        let fib = self.heap.fiber(f);
        match fib.frames.last() {
            Some(fr) => {
                let func = self.heap.closure(fr.closure).func;
                fr.stackstart + self.heap.function(func).countreg(fr.nargs)
            }
            None => 0,
        }
    }

    // ── Error path ───────────────────────────────────────────────────────────

    /// Raise a runtime error in the current fiber. A trying fiber hands
    /// control back to its caller (error readable through the fiber object);
    /// anything else aborts the VM through the delegate error callback.
    pub(crate) fn throw(&mut self, msg: impl Into<String>) -> Result<(), GravityError> {
        let msg = msg.into();
        let f = self.fiber;
        {
            let fib = self.heap.fiber_mut(f);
            fib.error = Some(msg.clone());
            fib.status = FiberStatus::AbortedWithError;
        }
        if self.heap.fiber(f).trying {
            let caller = self.heap.fiber(f).caller;
            let resume = self.heap.fiber(f).resume_dest;
            {
                let fib = self.heap.fiber_mut(f);
                fib.caller = None;
                fib.trying = false;
            }
            if let Some(c) = caller {
                self.fiber = c;
                if let Some(dest) = resume {
                    let cbase = self
                        .heap
                        .fiber(c)
                        .frames
                        .last()
                        .map(|fr| fr.stackstart)
                        .unwrap_or(0);
                    let idx = cbase + dest as usize;
                    let fib = self.heap.fiber_mut(c);
                    fib.ensure_stack(idx + 1);
                    fib.stack[idx] = Value::Null;
                }
                return Ok(());
            }
        }
        self.aborted = true;
        self.delegate.error_callback(ErrorKind::Runtime, &msg);
        Err(GravityError::Runtime { message: msg })
    }

    // ── Upvalues ─────────────────────────────────────────────────────────────

    /// Find or create an open upvalue for an absolute stack slot. The open
    /// list is kept sorted by descending stack index so closing at a level
    /// only scans a prefix.
    fn capture_upvalue(&mut self, f: GcRef, abs_index: usize) -> GcRef {
        let mut insert_at = None;
        {
            let fib = self.heap.fiber(f);
            for (i, &u) in fib.upvalues.iter().enumerate() {
                match self.heap.upvalue(u).state {
                    UpvalueState::Open { index, .. } if index == abs_index => return u,
                    UpvalueState::Open { index, .. } if index < abs_index => {
                        insert_at = Some(i);
                        break;
                    }
                    _ => {}
                }
            }
        }
        let up = self.alloc(GravityObject::Upvalue(crate::core::object::GravityUpvalue {
            state: UpvalueState::Open { fiber: f, index: abs_index },
        }));
        let fib = self.heap.fiber_mut(f);
        match insert_at {
            Some(i) => fib.upvalues.insert(i, up),
            None => fib.upvalues.push(up),
        }
        up
    }

    /// Close every open upvalue at or above `level`: copy the stack value
    /// into the upvalue's own storage and drop it from the open list.
    pub(crate) fn close_upvalues(&mut self, f: GcRef, level: usize) {
        loop {
            let (u, index) = {
                let fib = self.heap.fiber(f);
                match fib.upvalues.first() {
                    Some(&u) => match self.heap.upvalue(u).state {
                        UpvalueState::Open { index, .. } if index >= level => (u, index),
                        _ => break,
                    },
                    None => break,
                }
            };
            let v = self.heap.fiber(f).stack[index];
            self.heap.upvalue_mut(u).state = UpvalueState::Closed(v);
            self.heap.fiber_mut(f).upvalues.remove(0);
        }
    }

    fn upvalue_read(&self, u: GcRef) -> Value {
        match self.heap.upvalue(u).state {
            UpvalueState::Open { fiber, index } => self.heap.fiber(fiber).stack[index],
            UpvalueState::Closed(v) => v,
        }
    }

    fn upvalue_write(&mut self, u: GcRef, v: Value) {
        match self.heap.upvalue(u).state {
            UpvalueState::Open { fiber, index } => self.heap.fiber_mut(fiber).stack[index] = v,
            UpvalueState::Closed(_) => self.heap.upvalue_mut(u).state = UpvalueState::Closed(v),
        }
    }

    // ── Callable execution ───────────────────────────────────────────────────

    /// Resolve a callable value into a closure ref, wrapping bare functions.
    pub(crate) fn as_callable(&mut self, v: Value) -> Option<GcRef> {
        let r = v.as_object()?;
        if matches!(self.heap.get(r), GravityObject::Closure(_)) {
            return Some(r);
        }
        if matches!(self.heap.get(r), GravityObject::Function(_)) {
            return Some(self.alloc(GravityObject::Closure(GravityClosure::new(r, 0))));
        }
        None
    }

    /// Run a callable: Native pushes a frame (the dispatch loop continues
    /// inside it), Internal executes in place with the tail-closure trick,
    /// Special resolves through its getter/setter, Bridged goes to the
    /// delegate. `win` is the absolute stack index of the argument window,
    /// `r1` the destination register in the current frame.
    pub(crate) fn exec_callable(
        &mut self,
        mut cref: GcRef,
        r1: u32,
        base: usize,
        win: usize,
        nargs: u16,
        mode: SpecialMode,
    ) -> Result<(), GravityError> {
        loop {
            let fref = self.fiber;
            let func_ref = self.heap.closure(cref).func;
            match self.heap.function(func_ref).tag() {
                FunctionTag::Native => {
                    let need = self.heap.function(func_ref).countreg(nargs);
                    let fib = self.heap.fiber_mut(fref);
                    fib.ensure_stack(win + need);
                    fib.frames.push(CallFrame {
                        ip: 0,
                        stackstart: win,
                        closure: cref,
                        dest: r1,
                        nargs,
                        args: None,
                        outloop: false,
                    });
                    if fib.stacktop < win + need {
                        fib.stacktop = win + need;
                    }
                    if fib.frames.len() >= MAX_FRAMES {
                        self.throw("Infinite loop detected. Current execution must be aborted.")?;
                    }
                    return Ok(());
                }
                FunctionTag::Internal => {
                    let fp = match &self.heap.function(func_ref).kind {
                        FunctionKind::Internal(f) => *f,
                        _ => unreachable!(),
                    };
                    let args: Vec<Value> = {
                        let fib = self.heap.fiber_mut(fref);
                        fib.ensure_stack(win + nargs as usize);
                        if fib.stacktop < win + nargs as usize {
                            fib.stacktop = win + nargs as usize;
                        }
                        fib.stack[win..win + nargs as usize].to_vec()
                    };
                    let r1copy = self.reg(fref, base, r1);
                    self.heap.set_enabled(false);
                    let ok = fp(self, &args, nargs, r1);
                    self.heap.set_enabled(true);
                    if ok {
                        return Ok(());
                    }
                    if self.aborted {
                        return Err(GravityError::Aborted);
                    }
                    // tail-closure trick: an internal callable leaves a
                    // closure in the destination register to chain into
                    let cur = self.reg(fref, base, r1);
                    if let Some(next) = cur.as_object() {
                        if matches!(self.heap.get(next), GravityObject::Closure(_)) {
                            self.set_reg(fref, base, r1, r1copy);
                            cref = next;
                            continue;
                        }
                    }
                    let err = self.heap.fiber(self.fiber).error.clone();
                    if let Some(e) = err {
                        self.throw(e)?;
                    }
                    // fiber switch or yield: the dispatch loop reloads
                    return Ok(());
                }
                FunctionTag::Bridged => {
                    let args: Vec<Value> = {
                        let fib = self.heap.fiber(fref);
                        fib.stack[win..win + nargs as usize].to_vec()
                    };
                    // the payload is moved out for the duration of the call
                    // so the delegate can re-enter the VM freely
                    let xdata = match &mut self.heap.function_mut(func_ref).kind {
                        FunctionKind::Bridged { xdata } => xdata.take(),
                        _ => None,
                    };
                    let delegate =
                        std::mem::replace(&mut self.delegate, Box::new(DefaultDelegate));
                    self.heap.set_enabled(false);
                    let ok = match &xdata {
                        Some(x) => delegate.bridge_execute(self, x.0.as_ref(), &args, nargs, r1),
                        None => true,
                    };
                    self.heap.set_enabled(true);
                    self.delegate = delegate;
                    if let FunctionKind::Bridged { xdata: slot } =
                        &mut self.heap.function_mut(func_ref).kind
                    {
                        *slot = xdata;
                    }
                    if !ok {
                        let err = self.heap.fiber(self.fiber).error.clone();
                        if let Some(e) = err {
                            self.throw(e)?;
                        }
                    }
                    return Ok(());
                }
                FunctionTag::Special => {
                    let (getter, setter) = match &self.heap.function(func_ref).kind {
                        FunctionKind::Special { getter, setter, .. } => (*getter, *setter),
                        _ => unreachable!(),
                    };
                    let next = match mode {
                        SpecialMode::Getter => getter,
                        SpecialMode::Setter => setter,
                        SpecialMode::Forbidden => {
                            self.throw("Unable to handle a special function in current context")?;
                            return Ok(());
                        }
                    };
                    match next {
                        Some(g) => {
                            cref = g;
                            continue;
                        }
                        None => {
                            let what = if mode == SpecialMode::Getter { "getter" } else { "setter" };
                            self.throw(format!("Missing special {} function for property", what))?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Run a callable to completion and hand back its result. Native
    /// closures execute in a nested dispatch loop behind an outloop frame.
    pub(crate) fn call_value_sync(
        &mut self,
        cref: GcRef,
        target: Value,
        args: &[Value],
    ) -> Result<Value, GravityError> {
        let fref = self.fiber;
        let base = self
            .heap
            .fiber(fref)
            .frames
            .last()
            .map(|fr| fr.stackstart)
            .unwrap_or(0);
        let win = self.scratch_window(fref);
        let nargs = (args.len() + 1) as u16;
        {
            let fib = self.heap.fiber_mut(fref);
            fib.ensure_stack(win + nargs as usize);
            fib.stack[win] = target;
            for (i, &a) in args.iter().enumerate() {
                fib.stack[win + 1 + i] = a;
            }
            if fib.stacktop < win + nargs as usize {
                fib.stacktop = win + nargs as usize;
            }
        }
        let func_ref = self.heap.closure(cref).func;
        let rindex = (win - base) as u32;
        match self.heap.function(func_ref).tag() {
            FunctionTag::Native => {
                let need = self.heap.function(func_ref).countreg(nargs);
                let fib = self.heap.fiber_mut(fref);
                fib.ensure_stack(win + need);
                // embedder boundary frame: the matching RET returns control
                // to this call instead of the enclosing dispatch loop
                fib.frames.push(CallFrame {
                    ip: 0,
                    stackstart: win,
                    closure: cref,
                    dest: rindex,
                    nargs,
                    args: None,
                    outloop: true,
                });
                if fib.stacktop < win + need {
                    fib.stacktop = win + need;
                }
                self.run()?;
                Ok(self.heap.fiber(fref).result)
            }
            _ => {
                let was_idle = self.heap.fiber(fref).frames.is_empty();
                self.exec_callable(cref, rindex, base, win, nargs, SpecialMode::Forbidden)?;
                // an internal callable may have switched fibers (Fiber.call
                // from the embedding API): drive the target until control
                // comes back here
                if was_idle && self.fiber != fref {
                    self.run()?;
                }
                Ok(self.reg(fref, base, rindex))
            }
        }
    }

    // ── Operator dispatch helpers ────────────────────────────────────────────

    fn lookup_callable(&mut self, receiver: Value, key: GcRef) -> Option<GcRef> {
        let class = self.class_of(receiver)?;
        let found = class_lookup(&self.heap, class, Value::Object(key))?;
        self.as_callable(found)
    }

    /// Dispatch a binary operator method: args (receiver, rhs), result into
    /// r1 when the method returns.
    fn dispatch_binary(
        &mut self,
        key: GcRef,
        opname: &str,
        r1: u32,
        base: usize,
        v2: Value,
        v3: Value,
    ) -> Result<(), GravityError> {
        let fref = self.fiber;
        let Some(cref) = self.lookup_callable(v2, key) else {
            if v2.is_null() && self.nullsilent {
                self.set_reg(fref, base, r1, Value::Null);
                return Ok(());
            }
            self.throw(format!("Unable to perform operator {} on object", opname))?;
            return Ok(());
        };
        let win = self.scratch_window(fref);
        {
            let fib = self.heap.fiber_mut(fref);
            fib.ensure_stack(win + 2);
            fib.stack[win] = v2;
            fib.stack[win + 1] = v3;
        }
        self.exec_callable(cref, r1, base, win, 2, SpecialMode::Forbidden)
    }

    fn dispatch_unary(
        &mut self,
        key: GcRef,
        opname: &str,
        r1: u32,
        base: usize,
        v2: Value,
    ) -> Result<(), GravityError> {
        let fref = self.fiber;
        let Some(cref) = self.lookup_callable(v2, key) else {
            if v2.is_null() && self.nullsilent {
                self.set_reg(fref, base, r1, Value::Null);
                return Ok(());
            }
            self.throw(format!("Unable to perform operator {} on object", opname))?;
            return Ok(());
        };
        let win = self.scratch_window(fref);
        {
            let fib = self.heap.fiber_mut(fref);
            fib.ensure_stack(win + 1);
            fib.stack[win] = v2;
        }
        self.exec_callable(cref, r1, base, win, 1, SpecialMode::Forbidden)
    }

    /// Arithmetic opcode body: inline fast paths, then method dispatch.
    fn op_arith(
        &mut self,
        inst: Instr,
        base: usize,
        op: Op,
    ) -> Result<(), GravityError> {
        let fref = self.fiber;
        let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
        let v2 = self.reg(fref, base, r2);
        let v3 = self.reg(fref, base, r3);

        // null behaves as integer zero on the fast path
        let n2 = if v2.is_null() { Value::Int(0) } else { v2 };
        let n3 = if v3.is_null() { Value::Int(0) } else { v3 };

        let fast = match (n2, n3) {
            (Value::Int(a), Value::Int(b)) => match op {
                Op::Add => Some(Value::Int(a.wrapping_add(b))),
                Op::Sub => Some(Value::Int(a.wrapping_sub(b))),
                Op::Mul => Some(Value::Int(a.wrapping_mul(b))),
                Op::Div => {
                    if b == 0 {
                        self.throw("Division by 0 error.")?;
                        return Ok(());
                    }
                    Some(Value::Int(a.wrapping_div(b)))
                }
                Op::Rem => {
                    if b == 0 {
                        self.throw("Division by 0 error.")?;
                        return Ok(());
                    }
                    Some(Value::Int(a.wrapping_rem(b)))
                }
                _ => None,
            },
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => {
                let (a, b) = (n2.as_float(), n3.as_float());
                match op {
                    Op::Add => Some(Value::Float(a + b)),
                    Op::Sub => Some(Value::Float(a - b)),
                    Op::Mul => Some(Value::Float(a * b)),
                    Op::Div => {
                        if b == 0.0 {
                            self.throw("Division by 0 error.")?;
                            return Ok(());
                        }
                        Some(Value::Float(a / b))
                    }
                    Op::Rem => Some(Value::Float(a % b)),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(v) = fast {
            self.set_reg(fref, base, r1, v);
            return Ok(());
        }

        // a numeric left operand never silently concatenates with a string
        if matches!(n2, Value::Int(_) | Value::Float(_)) && n3.is_string(&self.heap) {
            self.throw("Right operand must be a number (use the number() method).")?;
            return Ok(());
        }

        let (key, name) = match op {
            Op::Add => (self.vkeys.add, "+"),
            Op::Sub => (self.vkeys.sub, "-"),
            Op::Mul => (self.vkeys.mul, "*"),
            Op::Div => (self.vkeys.div, "/"),
            Op::Rem => (self.vkeys.rem, "%"),
            _ => unreachable!(),
        };
        self.dispatch_binary(key, name, r1, base, v2, v3)
    }

    /// Comparison opcode body: the comparison value is computed inline or
    /// through the receiver's `==` (cmp) method, then folded to a Bool.
    fn op_compare(&mut self, inst: Instr, base: usize, op: Op) -> Result<(), GravityError> {
        let fref = self.fiber;
        let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
        let v2 = self.reg(fref, base, r2);
        let v3 = self.reg(fref, base, r3);

        // bool pairs and undefined operands short-circuit equality checks
        if matches!(op, Op::Eq | Op::Neq) {
            let both_bool = v2.is_bool() && v3.is_bool();
            let any_undef = matches!(v2, Value::Undefined) || matches!(v3, Value::Undefined);
            if both_bool || any_undef {
                let eq = value_identical(&self.heap, v2, v3);
                self.set_reg(fref, base, r1, Value::Bool(if op == Op::Eq { eq } else { !eq }));
                return Ok(());
            }
        }

        let cmp = match value_compare(&self.heap, v2, v3) {
            Some(c) => c,
            None => {
                // user-defined equality through the cmp method
                match self.lookup_callable(v2, self.vkeys.cmp) {
                    Some(cref) => {
                        let result = self.call_value_sync(cref, v2, &[v3])?;
                        result.as_int()
                    }
                    None => {
                        if value_equals(&self.heap, v2, v3) {
                            0
                        } else {
                            1
                        }
                    }
                }
            }
        };
        let b = match op {
            Op::Lt => cmp < 0,
            Op::Gt => cmp > 0,
            Op::Eq => cmp == 0,
            Op::Leq => cmp <= 0,
            Op::Geq => cmp >= 0,
            Op::Neq => cmp != 0,
            _ => unreachable!(),
        };
        self.set_reg(fref, base, r1, Value::Bool(b));
        Ok(())
    }

    fn op_bitwise(&mut self, inst: Instr, base: usize, op: Op) -> Result<(), GravityError> {
        let fref = self.fiber;
        let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
        let v2 = self.reg(fref, base, r2);
        let v3 = self.reg(fref, base, r3);

        if let (Value::Int(a), Value::Int(b)) = (v2, v3) {
            let v = match op {
                Op::Lshift => Value::Int(a.wrapping_shl(b as u32)),
                Op::Rshift => Value::Int(a.wrapping_shr(b as u32)),
                Op::Band => Value::Int(a & b),
                Op::Bor => Value::Int(a | b),
                Op::Bxor => Value::Int(a ^ b),
                _ => unreachable!(),
            };
            self.set_reg(fref, base, r1, v);
            return Ok(());
        }
        if let (Value::Bool(a), Value::Bool(b)) = (v2, v3) {
            let v = match op {
                Op::Band => Some(Value::Bool(a & b)),
                Op::Bor => Some(Value::Bool(a | b)),
                Op::Bxor => Some(Value::Bool(a ^ b)),
                _ => None,
            };
            if let Some(v) = v {
                self.set_reg(fref, base, r1, v);
                return Ok(());
            }
        }
        let (key, name) = match op {
            Op::Lshift => (self.vkeys.lshift, "<<"),
            Op::Rshift => (self.vkeys.rshift, ">>"),
            Op::Band => (self.vkeys.band, "&"),
            Op::Bor => (self.vkeys.bor, "|"),
            Op::Bxor => (self.vkeys.bxor, "^"),
            _ => unreachable!(),
        };
        self.dispatch_binary(key, name, r1, base, v2, v3)
    }

    /// LOAD/LOADS/LOADAT and STORE/STOREAT route through the receiver's
    /// load/store family methods.
    fn op_load(&mut self, inst: Instr, base: usize, op: Op) -> Result<(), GravityError> {
        let fref = self.fiber;
        let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
        let v2 = self.reg(fref, base, r2);
        let key = self.index_value(fref, base, r3);

        let vkey = match op {
            Op::Load => self.vkeys.load,
            Op::Loads => self.vkeys.loads,
            Op::LoadAt => self.vkeys.loadat,
            _ => unreachable!(),
        };
        let Some(cref) = self.lookup_callable(v2, vkey) else {
            if v2.is_null() && self.nullsilent {
                self.set_reg(fref, base, r1, Value::Null);
                return Ok(());
            }
            self.throw(format!(
                "Unable to perform operator {} on object",
                inst.op().name()
            ))?;
            return Ok(());
        };
        let win = self.scratch_window(fref);
        {
            let fib = self.heap.fiber_mut(fref);
            fib.ensure_stack(win + 2);
            fib.stack[win] = v2;
            fib.stack[win + 1] = key;
        }
        self.exec_callable(cref, r1, base, win, 2, SpecialMode::Getter)
    }

    fn op_store(&mut self, inst: Instr, base: usize, op: Op) -> Result<(), GravityError> {
        let fref = self.fiber;
        let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
        let value = self.reg(fref, base, r1);
        let v2 = self.reg(fref, base, r2);
        let key = self.index_value(fref, base, r3);

        let vkey = match op {
            Op::Store => self.vkeys.store,
            Op::StoreAt => self.vkeys.storeat,
            _ => unreachable!(),
        };
        let Some(cref) = self.lookup_callable(v2, vkey) else {
            if v2.is_null() && self.nullsilent {
                return Ok(());
            }
            self.throw(format!(
                "Unable to perform operator {} on object",
                inst.op().name()
            ))?;
            return Ok(());
        };
        let win = self.scratch_window(fref);
        {
            let fib = self.heap.fiber_mut(fref);
            fib.ensure_stack(win + 3);
            fib.stack[win] = v2;
            fib.stack[win + 1] = key;
            fib.stack[win + 2] = value;
        }
        // stores discard the method result: reuse the value register as a
        // scratch destination the way the compiler allocates it
        self.exec_callable(cref, r1, base, win, 3, SpecialMode::Setter)
    }

    /// Truthiness used by unflagged JUMPF.
    fn value_truthiness(&mut self, v: Value) -> Result<bool, GravityError> {
        Ok(match v {
            Value::Null | Value::Undefined => false,
            Value::Bool(b) => b,
            Value::Int(n) => n != 0,
            Value::Float(f) => f != 0.0,
            Value::Invalid => false,
            Value::Object(r) => {
                if let GravityObject::String(s) = self.heap.get(r) {
                    return Ok(!s.s.is_empty());
                }
                match self.lookup_callable(v, self.vkeys.bool_) {
                    Some(cref) => {
                        let result = self.call_value_sync(cref, v, &[])?;
                        result.as_int() != 0
                    }
                    None => true,
                }
            }
        })
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    /// Execute until the current activation finishes: HALT, the root fiber's
    /// last frame returning, or an outloop frame returning to the embedder.
    pub(crate) fn run(&mut self) -> Result<(), GravityError> {
        loop {
            if self.aborted {
                return Err(GravityError::Aborted);
            }
            let fref = self.fiber;
            // control handed back to a fiber with no frames belongs to the
            // embedder, not to this loop
            if self.heap.fiber(fref).frames.is_empty() {
                return Ok(());
            }
            let (cref, ip, base) = {
                let fib = self.heap.fiber(fref);
                let fr = fib.current_frame();
                (fr.closure, fr.ip, fr.stackstart)
            };
            let func_ref = self.heap.closure(cref).func;
            let raw = {
                let code = &self.heap.function(func_ref).code().bytecode;
                if ip < code.len() {
                    code[ip]
                } else {
                    0 // implicit RET0 safeguard
                }
            };
            self.heap.fiber_mut(fref).current_frame_mut().ip = ip + 1;
            let inst = Instr(raw);

            match inst.op() {
                Op::Nop => {}

                Op::Halt => return Ok(()),

                Op::Move => {
                    let (r1, r2) = (inst.get_a(), inst.get_b18());
                    let v = self.reg(fref, base, r2);
                    self.set_reg(fref, base, r1, v);
                }

                Op::Ret0 | Op::Ret => {
                    let result = if inst.op() == Op::Ret {
                        self.reg(fref, base, inst.get_a())
                    } else {
                        Value::Null
                    };
                    self.close_upvalues(fref, base);
                    let frame = self.heap.fiber_mut(fref).frames.pop().expect("RET without frame");

                    if frame.outloop {
                        self.heap.fiber_mut(fref).result = result;
                        return Ok(());
                    }

                    if self.heap.fiber(fref).frames.is_empty() {
                        let caller = self.heap.fiber(fref).caller;
                        let resume = self.heap.fiber(fref).resume_dest;
                        {
                            let fib = self.heap.fiber_mut(fref);
                            fib.result = result;
                            fib.status = FiberStatus::Terminated;
                            fib.caller = None;
                            fib.trying = false;
                        }
                        match caller {
                            None => return Ok(()),
                            Some(c) => {
                                // the caller may be the embedder itself, with
                                // no active frame to index into
                                self.fiber = c;
                                if let Some(dest) = resume {
                                    let cbase = self
                                        .heap
                                        .fiber(c)
                                        .frames
                                        .last()
                                        .map(|fr| fr.stackstart)
                                        .unwrap_or(0);
                                    let idx = cbase + dest as usize;
                                    let fib = self.heap.fiber_mut(c);
                                    fib.ensure_stack(idx + 1);
                                    fib.stack[idx] = result;
                                }
                            }
                        }
                    } else {
                        let fib = self.heap.fiber_mut(fref);
                        fib.stacktop = frame.stackstart;
                        let cbase = fib.current_frame().stackstart;
                        self.set_reg(fref, cbase, frame.dest, result);
                    }
                }

                Op::Call => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let mut nargs = r3;
                    let win = base + r2 as usize + 1;
                    let v = self.reg(fref, base, r2);

                    let cref = match self.as_callable(v) {
                        Some(c) => Some(c),
                        None => self.lookup_callable(v, self.vkeys.exec),
                    };
                    let Some(cref) = cref else {
                        let fname = self
                            .heap
                            .function(func_ref)
                            .identifier
                            .clone()
                            .unwrap_or_else(|| "anonymous".to_string());
                        self.throw(format!("Unable to call object (in function {})", fname))?;
                        continue;
                    };

                    // missing arguments become undefined
                    let nparams = {
                        let f = self.heap.function(self.heap.closure(cref).func);
                        f.nparams as u32
                    };
                    {
                        let fib = self.heap.fiber_mut(fref);
                        fib.ensure_stack(win + nparams.max(nargs) as usize);
                        while nargs < nparams {
                            fib.stack[win + nargs as usize] = Value::Undefined;
                            nargs += 1;
                        }
                    }
                    self.exec_callable(cref, r1, base, win, nargs as u16, SpecialMode::Forbidden)?;
                }

                Op::Load | Op::Loads | Op::LoadAt => self.op_load(inst, base, inst.op())?,
                Op::Store | Op::StoreAt => self.op_store(inst, base, inst.op())?,

                Op::LoadI => {
                    let r1 = inst.get_a();
                    self.set_reg(fref, base, r1, Value::Int(inst.get_sb() as i64));
                }

                Op::LoadK => {
                    let (r1, index) = (inst.get_a(), inst.get_b18());
                    if index < CPOOL_INDEX_MAX {
                        let v = self.heap.function(func_ref).code().cpool[index as usize];
                        self.set_reg(fref, base, r1, v);
                    } else {
                        match index {
                            CPOOL_VALUE_NULL => self.set_reg(fref, base, r1, Value::Null),
                            CPOOL_VALUE_UNDEFINED => {
                                self.set_reg(fref, base, r1, Value::Undefined)
                            }
                            CPOOL_VALUE_TRUE => self.set_reg(fref, base, r1, Value::Bool(true)),
                            CPOOL_VALUE_FALSE => self.set_reg(fref, base, r1, Value::Bool(false)),
                            CPOOL_VALUE_FUNC => self.set_reg(fref, base, r1, Value::Object(cref)),
                            CPOOL_VALUE_SUPER => {
                                let selfv = self.reg(fref, base, 0);
                                let sup = value_getsuper(&self.heap, &self.core, selfv)
                                    .map(Value::Object)
                                    .unwrap_or(Value::Null);
                                self.set_reg(fref, base, r1, sup);
                            }
                            CPOOL_VALUE_ARGUMENTS => {
                                // the arguments list materializes on first use
                                let args = match self.heap.fiber(fref).current_frame().args {
                                    Some(a) => a,
                                    None => {
                                        let items = {
                                            let fib = self.heap.fiber(fref);
                                            let n = fib.current_frame().nargs as usize;
                                            fib.stack[base..base + n].to_vec()
                                        };
                                        let list =
                                            self.alloc(GravityObject::List(GravityList { items }));
                                        self.heap
                                            .fiber_mut(fref)
                                            .current_frame_mut()
                                            .args = Some(list);
                                        list
                                    }
                                };
                                self.set_reg(fref, base, r1, Value::Object(args));
                            }
                            _ => {
                                self.throw("Unknown LOADK index")?;
                            }
                        }
                    }
                }

                Op::LoadG => {
                    let (r1, index) = (inst.get_a(), inst.get_b18());
                    let key = self.heap.function(func_ref).code().cpool[index as usize];
                    match self.globals.lookup(&self.heap, key) {
                        Some(v) => self.set_reg(fref, base, r1, v),
                        None => {
                            let name = crate::core::value::value_display(&self.heap, key);
                            self.throw(format!("Unable to find object {}", name))?;
                        }
                    }
                }

                Op::StoreG => {
                    let (r1, index) = (inst.get_a(), inst.get_b18());
                    let key = self.heap.function(func_ref).code().cpool[index as usize];
                    let v = self.reg(fref, base, r1);
                    let GravityVm { globals, heap, .. } = self;
                    globals.insert(heap, key, v);
                }

                Op::LoadU => {
                    let (r1, r2) = (inst.get_a(), inst.get_b18());
                    let u = self.heap.closure(cref).upvalues[r2 as usize];
                    let v = self.upvalue_read(u);
                    self.set_reg(fref, base, r1, v);
                }

                Op::StoreU => {
                    let (r1, r2) = (inst.get_a(), inst.get_b18());
                    let u = self.heap.closure(cref).upvalues[r2 as usize];
                    let v = self.reg(fref, base, r1);
                    self.upvalue_write(u, v);
                }

                Op::Jump => {
                    self.heap.fiber_mut(fref).current_frame_mut().ip = inst.get_n26() as usize;
                }

                Op::JumpF => {
                    let r1 = inst.get_a();
                    let target = inst.get_n17() as usize;
                    let v1 = self.reg(fref, base, r1);
                    let jump = if inst.get_flag() {
                        // flag set: only a literal Bool false branches
                        matches!(v1, Value::Bool(false))
                    } else {
                        !self.value_truthiness(v1)?
                    };
                    if jump {
                        self.heap.fiber_mut(fref).current_frame_mut().ip = target;
                    }
                }

                Op::Switch => {
                    self.throw("Opcode not implemented in this VM version.")?;
                }

                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem => {
                    self.op_arith(inst, base, inst.op())?
                }

                Op::And | Op::Or => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let v2 = self.reg(fref, base, r2);
                    let v3 = self.reg(fref, base, r3);
                    if let (Value::Bool(a), Value::Bool(b)) = (v2, v3) {
                        let v = if inst.op() == Op::And { a && b } else { a || b };
                        self.set_reg(fref, base, r1, Value::Bool(v));
                    } else {
                        let (key, name) = if inst.op() == Op::And {
                            (self.vkeys.and, "&&")
                        } else {
                            (self.vkeys.or, "||")
                        };
                        self.dispatch_binary(key, name, r1, base, v2, v3)?;
                    }
                }

                Op::Lt | Op::Gt | Op::Eq | Op::Leq | Op::Geq | Op::Neq => {
                    self.op_compare(inst, base, inst.op())?
                }

                Op::Eqq | Op::Neqq => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let v2 = self.reg(fref, base, r2);
                    let v3 = self.reg(fref, base, r3);
                    let same = value_identical(&self.heap, v2, v3);
                    self.set_reg(
                        fref,
                        base,
                        r1,
                        Value::Bool(if inst.op() == Op::Eqq { same } else { !same }),
                    );
                }

                Op::IsA => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let v2 = self.reg(fref, base, r2);
                    let v3 = self.reg(fref, base, r3);
                    let Some(target) = v3.as_object().filter(|&r| {
                        matches!(self.heap.get(r), GravityObject::Class(_))
                    }) else {
                        self.throw("Right operand must be a Class in isa comparison")?;
                        continue;
                    };
                    let result = self
                        .class_of(v2)
                        .map(|c| class_is_a(&self.heap, c, target))
                        .unwrap_or(false);
                    self.set_reg(fref, base, r1, Value::Bool(result));
                }

                Op::Match => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let v2 = self.reg(fref, base, r2);
                    let v3 = self.reg(fref, base, r3);
                    self.dispatch_binary(self.vkeys.match_, "=~", r1, base, v2, v3)?;
                }

                Op::Neg => {
                    let (r1, r2) = (inst.get_a(), inst.get_b8());
                    let v2 = self.reg(fref, base, r2);
                    match v2 {
                        Value::Int(n) => self.set_reg(fref, base, r1, Value::Int(-n)),
                        Value::Float(f) => self.set_reg(fref, base, r1, Value::Float(-f)),
                        _ => self.dispatch_unary(self.vkeys.neg, "neg", r1, base, v2)?,
                    }
                }

                Op::Not => {
                    let (r1, r2) = (inst.get_a(), inst.get_b8());
                    let v2 = self.reg(fref, base, r2);
                    match v2 {
                        Value::Bool(b) => self.set_reg(fref, base, r1, Value::Bool(!b)),
                        Value::Null | Value::Undefined => {
                            self.set_reg(fref, base, r1, Value::Bool(true))
                        }
                        _ => self.dispatch_unary(self.vkeys.not, "!", r1, base, v2)?,
                    }
                }

                Op::Lshift | Op::Rshift | Op::Band | Op::Bor | Op::Bxor => {
                    self.op_bitwise(inst, base, inst.op())?
                }

                Op::Bnot => {
                    let (r1, r2) = (inst.get_a(), inst.get_b8());
                    let v2 = self.reg(fref, base, r2);
                    match v2 {
                        Value::Int(n) => self.set_reg(fref, base, r1, Value::Int(!n)),
                        _ => self.dispatch_unary(self.vkeys.bnot, "~", r1, base, v2)?,
                    }
                }

                Op::MapNew => {
                    let (r1, n) = (inst.get_a(), inst.get_b18());
                    let map = self.alloc(GravityObject::Map(GravityMap {
                        table: crate::hash::HashTable::with_capacity(n.max(8) as usize),
                    }));
                    self.set_reg(fref, base, r1, Value::Object(map));
                }

                Op::ListNew => {
                    let (r1, n) = (inst.get_a(), inst.get_b18());
                    let list = self.alloc(GravityObject::List(GravityList {
                        items: Vec::with_capacity(n as usize),
                    }));
                    self.set_reg(fref, base, r1, Value::Object(list));
                }

                Op::RangeNew => {
                    let (r1, r2, r3, flag) = inst.get_abcf();
                    let v2 = self.reg(fref, base, r2);
                    let v3 = self.reg(fref, base, r3);
                    let (Value::Int(from), Value::Int(to)) = (v2, v3) else {
                        self.throw("Unable to build Range from a non Int value")?;
                        continue;
                    };
                    // exclusive ranges normalize to inclusive
                    let to = if flag != 0 { to - 1 } else { to };
                    let range = self.alloc(GravityObject::Range(GravityRange { from, to }));
                    self.set_reg(fref, base, r1, Value::Object(range));
                }

                Op::SetList => {
                    let (r1, r2, r3) = (inst.get_a(), inst.get_b8(), inst.get_c10());
                    let target = self.reg(fref, base, r1);
                    let Some(tref) = target.as_object() else {
                        self.throw("SETLIST requires a List or Map target")?;
                        continue;
                    };
                    if r2 == 0 {
                        // literal container copied straight from the pool
                        let pooled = self.heap.function(func_ref).code().cpool[r3 as usize];
                        let Some(pref) = pooled.as_object() else {
                            self.throw("SETLIST requires a List or Map constant")?;
                            continue;
                        };
                        match self.heap.get(tref) {
                            GravityObject::List(_) => {
                                let items = self.heap.list(pref).items.clone();
                                self.heap.list_mut(tref).items.extend(items);
                            }
                            GravityObject::Map(_) => {
                                let entries: Vec<(Value, Value)> =
                                    self.heap.map(pref).table.entries().collect();
                                let mut table =
                                    std::mem::take(&mut self.heap.map_mut(tref).table);
                                for (k, v) in entries {
                                    table.insert(&self.heap, k, v);
                                }
                                self.heap.map_mut(tref).table = table;
                            }
                            _ => {
                                self.throw("SETLIST requires a List or Map target")?;
                            }
                        }
                    } else {
                        match self.heap.get(tref) {
                            GravityObject::List(_) => {
                                for i in 0..r2 {
                                    let v = self.reg(fref, base, r1 + 1 + i);
                                    self.heap.list_mut(tref).items.push(v);
                                }
                            }
                            GravityObject::Map(_) => {
                                let mut table =
                                    std::mem::take(&mut self.heap.map_mut(tref).table);
                                let mut slot = r1 + 1;
                                for _ in 0..r2 {
                                    let k = self.reg(fref, base, slot);
                                    let v = self.reg(fref, base, slot + 1);
                                    table.insert(&self.heap, k, v);
                                    slot += 2;
                                }
                                self.heap.map_mut(tref).table = table;
                            }
                            _ => {
                                self.throw("SETLIST requires a List or Map target")?;
                            }
                        }
                    }
                }

                Op::Closure => {
                    let (r1, index) = (inst.get_a(), inst.get_b18());
                    let v = self.heap.function(func_ref).code().cpool[index as usize];
                    let Some(f) = v.as_object().filter(|&r| {
                        matches!(self.heap.get(r), GravityObject::Function(_))
                    }) else {
                        self.throw("Unable to create a closure from a non function object.")?;
                        continue;
                    };
                    let nup = self.heap.function(f).nupvalues as usize;
                    let new_closure = self.alloc(GravityObject::Closure(GravityClosure::new(f, nup)));
                    self.heap.temp_push(new_closure);
                    // the following pseudo-MOVE words describe each capture
                    for _ in 0..nup {
                        let ip_now = self.heap.fiber(fref).current_frame().ip;
                        let word = self.heap.function(func_ref).code().bytecode[ip_now];
                        self.heap.fiber_mut(fref).current_frame_mut().ip = ip_now + 1;
                        let pseudo = Instr(word);
                        let p1 = pseudo.get_a();
                        let is_local = pseudo.get_b18() != 0;
                        let up = if is_local {
                            self.capture_upvalue(fref, base + p1 as usize)
                        } else {
                            self.heap.closure(cref).upvalues[p1 as usize]
                        };
                        self.heap.closure_mut(new_closure).upvalues.push(up);
                    }
                    self.heap.temp_pop();
                    self.set_reg(fref, base, r1, Value::Object(new_closure));
                }

                Op::Close => {
                    let r1 = inst.get_a();
                    self.close_upvalues(fref, base + r1 as usize);
                }

                Op::Check => {
                    let r1 = inst.get_a();
                    let v = self.reg(fref, base, r1);
                    if let Some(iref) = v.as_object() {
                        let is_struct = match self.heap.get(iref) {
                            GravityObject::Instance(i) => self.heap.class(i.class).is_struct,
                            _ => false,
                        };
                        if is_struct {
                            let clone = self.clone_instance(iref);
                            self.set_reg(fref, base, r1, Value::Object(clone));
                        }
                    }
                }

                Op::Reserved2 | Op::Reserved3 | Op::Reserved4 | Op::Reserved5 | Op::Reserved6 => {
                    self.throw("Opcode not implemented in this VM version.")?;
                }
            }
        }
    }

    /// Deep-copy an instance; struct-typed ivars are copied recursively
    /// (value semantics).
    pub(crate) fn clone_instance(&mut self, iref: GcRef) -> GcRef {
        let (class, ivars) = {
            let i = self.heap.instance(iref);
            (i.class, i.ivars.clone())
        };
        let clone = self.alloc(GravityObject::Instance(GravityInstance {
            class,
            ivars: Vec::new(),
            xdata: None,
        }));
        self.heap.temp_push(clone);
        let mut copied = Vec::with_capacity(ivars.len());
        for v in ivars {
            let cv = match v.as_object() {
                Some(r) => {
                    let nested_struct = match self.heap.get(r) {
                        GravityObject::Instance(i) => self.heap.class(i.class).is_struct,
                        _ => false,
                    };
                    if nested_struct {
                        Value::Object(self.clone_instance(r))
                    } else {
                        v
                    }
                }
                None => v,
            };
            copied.push(cv);
        }
        self.heap.instance_mut(clone).ivars = copied;
        self.heap.temp_pop();
        clone
    }

    // ── Embedding API ────────────────────────────────────────────────────────

    /// Execute a freshly deserialized $moduleinit closure on the root fiber,
    /// populating the globals table.
    pub fn load_closure(&mut self, closure: GcRef) -> Result<Value, GravityError> {
        if self.aborted {
            return Err(GravityError::Aborted);
        }
        let fref = self.root_fiber;
        let func = self.heap.closure(closure).func;
        let need = self.heap.function(func).countreg(1).max(1);
        {
            let fib = self.heap.fiber_mut(fref);
            fib.frames.clear();
            fib.upvalues.clear();
            fib.error = None;
            fib.result = Value::Null;
            fib.status = FiberStatus::Running;
            fib.ensure_stack(need);
            fib.stack[0] = Value::Null;
            fib.stacktop = need;
            fib.frames.push(CallFrame {
                ip: 0,
                stackstart: 0,
                closure,
                dest: 0,
                nargs: 1,
                args: None,
                outloop: false,
            });
        }
        self.fiber = fref;
        self.run()?;
        Ok(self.heap.fiber(fref).result)
    }

    /// Re-entrant closure invocation: runs `closure` with an explicit target
    /// and argument list on top of the current fiber and returns its result.
    pub fn run_closure(
        &mut self,
        closure: GcRef,
        target: Value,
        args: &[Value],
    ) -> Result<Value, GravityError> {
        if self.aborted {
            return Err(GravityError::Aborted);
        }
        self.call_value_sync(closure, target, args)
    }

    /// Convenience: load a module closure, then look up and run `main`.
    pub fn run_main(&mut self, module_closure: GcRef) -> Result<Value, GravityError> {
        self.load_closure(module_closure)?;
        let Some(mainv) = self.get_value("main") else {
            let msg = "Unable to find main function.";
            self.aborted = true;
            self.delegate.error_callback(ErrorKind::Runtime, msg);
            return Err(GravityError::runtime(msg));
        };
        let Some(mc) = self.as_callable(mainv) else {
            return Err(GravityError::runtime("main is not a callable object."));
        };
        self.run_closure(mc, Value::Null, &[])
    }

    /// Value of a just-run fiber / closure.
    pub fn result(&self) -> Value {
        self.heap.fiber(self.fiber).result
    }

    /// Convert a conversion-capable value through its class method
    /// ("Int", "Float", "Bool", "String"): used by the core library when the
    /// pure conversions cannot handle an object.
    pub(crate) fn convert_dispatch(&mut self, v: Value, key: GcRef) -> Option<Value> {
        let cref = self.lookup_callable(v, key)?;
        self.call_value_sync(cref, v, &[]).ok()
    }

    // ── GC driver ────────────────────────────────────────────────────────────

    pub fn gc_enable(&mut self, on: bool) {
        self.heap.set_enabled(on);
    }

    /// Pin / unpin a closure so the embedder can hold it across collections.
    pub fn retain_closure(&mut self, closure: GcRef) {
        self.heap.closure_mut(closure).refcount += 1;
    }

    pub fn release_closure(&mut self, closure: GcRef) {
        let c = self.heap.closure_mut(closure);
        c.refcount = c.refcount.saturating_sub(1);
    }

    pub fn gc_temp_push(&mut self, r: GcRef) {
        self.heap.temp_push(r);
    }

    pub fn gc_temp_pop(&mut self) {
        self.heap.temp_pop();
    }

    pub fn gc_set_thresholds(&mut self, min: u64, current: u64, ratio: f64) {
        self.heap.gcminthreshold = min;
        self.heap.gcthreshold = current;
        self.heap.gcratio = ratio;
    }

    /// Stop-the-world collection: gray the roots, drain the worklist, sweep.
    pub fn gc_collect(&mut self) {
        self.heap.mark_begin();

        // 1. globals
        let entries: Vec<(Value, Value)> = self.globals.entries().collect();
        for (k, v) in entries {
            self.heap.gray_value(k);
            self.heap.gray_value(v);
        }
        // 2. interned names and core classes are permanent roots
        let interned: Vec<GcRef> = self.intern.values().copied().collect();
        for r in interned {
            self.heap.gray(r);
        }
        for r in self.core.all() {
            self.heap.gray(r);
        }
        // 3. fibers (stacks, frames and caller chains gray transitively)
        self.heap.gray(self.fiber);
        self.heap.gray(self.root_fiber);
        // 4. embedder slots, temp roots and pinned closures
        for v in self.reserved_slots {
            self.heap.gray_value(v);
        }
        let temps: Vec<GcRef> = self.heap.temp_roots().to_vec();
        for r in temps {
            self.heap.gray(r);
        }
        let mut pinned: Vec<GcRef> = Vec::new();
        for idx in 0..self.heap.slot_count() {
            let r = GcRef::from_index(idx);
            if !self.heap.contains(r) {
                continue;
            }
            if let GravityObject::Closure(c) = self.heap.get(r) {
                if c.refcount > 0 {
                    pinned.push(r);
                }
            }
        }
        for r in pinned {
            self.heap.gray(r);
        }

        // mark
        while let Some(r) = self.heap.gray_pop() {
            let has_xdata = self.heap.blacken(r);
            if has_xdata {
                let extra = match self.heap.get(r) {
                    GravityObject::Instance(i) => i
                        .xdata
                        .as_ref()
                        .map(|x| self.delegate.bridge_blacken(x.0.as_ref())),
                    GravityObject::Class(c) => c
                        .xdata
                        .as_ref()
                        .map(|x| self.delegate.bridge_blacken(x.0.as_ref())),
                    _ => None,
                };
                for e in extra.into_iter().flatten() {
                    self.heap.gray(e);
                }
            }
        }

        // notify the embedder about dying bridged payloads, then sweep
        for idx in 0..self.heap.slot_count() {
            let r = GcRef::from_index(idx);
            if !self.heap.contains(r) || self.heap.is_dark(r) {
                continue;
            }
            let x = match self.heap.get(r) {
                GravityObject::Instance(i) => i.xdata.as_ref(),
                GravityObject::Class(c) => c.xdata.as_ref(),
                _ => None,
            };
            if let Some(x) = x {
                self.delegate.bridge_free(x.0.as_ref());
            }
        }
        self.heap.sweep();
    }
}

impl Drop for GravityVm {
    fn drop(&mut self) {
        // release bridged payloads, honoring the embedder keep filter
        let mut kept: std::collections::HashSet<u32> = std::collections::HashSet::new();
        for idx in 0..self.heap.slot_count() {
            let r = GcRef::from_index(idx);
            if !self.heap.contains(r) {
                continue;
            }
            if self.delegate.keep_on_free(r) {
                kept.insert(r.index());
                continue;
            }
            let x = match self.heap.get(r) {
                GravityObject::Instance(i) => i.xdata.as_ref(),
                GravityObject::Class(c) => c.xdata.as_ref(),
                _ => None,
            };
            if let Some(x) = x {
                self.delegate.bridge_free(x.0.as_ref());
            }
        }
        self.heap
            .sweep_with_filter(&mut |r, _| kept.contains(&r.index()));
    }
}
