//! Object arena and mark-sweep primitives.
//!
//! The heap is a slot vector with a free list; a `GcRef` is a stable typed
//! index, so stack reallocation and slot reuse never invalidate references
//! held by other objects. Collection is stop-the-world tri-color mark-sweep:
//! the VM supplies the roots (it owns globals, fibers and the intern pool)
//! and drives the cycle through `gray_value`/`blacken`/`sweep`.
//!
//! Accounting follows the allocation-trigger model: every allocation grows
//! `memallocated`; the mark phase recomputes it from surviving objects; the
//! sweep recomputes the next trigger threshold from the survivors.

use crate::core::object::{FunctionKind, GravityObject, UpvalueState};
use crate::core::value::Value;
use crate::fiber::GravityFiber;
use crate::core::object::{GravityClass, GravityClosure, GravityFunction, GravityInstance,
                          GravityList, GravityMap, GravityModule, GravityRange, GravityString,
                          GravityUpvalue};

/// Default trigger threshold (bytes).
pub const DEFAULT_THRESHOLD: u64 = 4 * 1024 * 1024;
/// Threshold never drops below this after a cycle.
pub const DEFAULT_MIN_THRESHOLD: u64 = 1024 * 1024;
/// Threshold growth percentage applied to surviving bytes.
pub const DEFAULT_RATIO: f64 = 50.0;

/// Stable index of a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl GcRef {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn from_index(idx: u32) -> GcRef {
        GcRef(idx)
    }
}

impl std::fmt::Debug for GcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({})", self.0)
    }
}

#[derive(Debug)]
struct GcSlot {
    object: GravityObject,
    dark: bool,
    visited: bool,
}

#[derive(Debug)]
pub struct GcHeap {
    slots: Vec<Option<GcSlot>>,
    free_list: Vec<u32>,
    graylist: Vec<GcRef>,
    temp_roots: Vec<GcRef>,
    /// Bytes allocated since the last cycle plus surviving bytes.
    pub memallocated: u64,
    pub gcthreshold: u64,
    pub gcminthreshold: u64,
    pub gcratio: f64,
    /// Collection is enabled while > 0 (nested disable sections count down).
    enabled: i32,
    pub ncollections: u64,
    pub nallocated: u64,
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeap {
    pub fn new() -> Self {
        GcHeap {
            slots: Vec::with_capacity(512),
            free_list: Vec::new(),
            graylist: Vec::new(),
            temp_roots: Vec::new(),
            memallocated: 0,
            gcthreshold: DEFAULT_THRESHOLD,
            gcminthreshold: DEFAULT_MIN_THRESHOLD,
            gcratio: DEFAULT_RATIO,
            enabled: 1,
            ncollections: 0,
            nallocated: 0,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// Track a new object. The caller (the VM) decides whether to run a
    /// cycle afterwards; a freshly allocated object must reach a traced slot
    /// or the temp-root stack before the next possible trigger point.
    pub fn alloc(&mut self, object: GravityObject) -> GcRef {
        self.memallocated += object.shallow_size();
        self.nallocated += 1;
        let slot = GcSlot { object, dark: false, visited: false };
        match self.free_list.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                GcRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                GcRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn should_collect(&self) -> bool {
        self.enabled > 0 && self.memallocated >= self.gcthreshold
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled += if enabled { 1 } else { -1 };
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled > 0
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn contains(&self, r: GcRef) -> bool {
        self.slots
            .get(r.0 as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_dark(&self, r: GcRef) -> bool {
        self.slots
            .get(r.0 as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.dark)
            .unwrap_or(false)
    }

    // ── Temp roots ───────────────────────────────────────────────────────────

    pub fn temp_push(&mut self, r: GcRef) {
        self.temp_roots.push(r);
    }

    pub fn temp_pop(&mut self) {
        self.temp_roots.pop();
    }

    pub fn temp_roots(&self) -> &[GcRef] {
        &self.temp_roots
    }

    // ── Access ───────────────────────────────────────────────────────────────

    #[inline(always)]
    pub fn get(&self, r: GcRef) -> &GravityObject {
        &self.slots[r.0 as usize]
            .as_ref()
            .expect("access to freed heap object")
            .object
    }

    #[inline(always)]
    pub fn get_mut(&mut self, r: GcRef) -> &mut GravityObject {
        &mut self.slots[r.0 as usize]
            .as_mut()
            .expect("access to freed heap object")
            .object
    }

    pub fn string(&self, r: GcRef) -> &GravityString {
        match self.get(r) {
            GravityObject::String(s) => s,
            o => panic!("expected String, found {:?}", o),
        }
    }

    pub fn range(&self, r: GcRef) -> &GravityRange {
        match self.get(r) {
            GravityObject::Range(x) => x,
            o => panic!("expected Range, found {:?}", o),
        }
    }

    pub fn list(&self, r: GcRef) -> &GravityList {
        match self.get(r) {
            GravityObject::List(x) => x,
            o => panic!("expected List, found {:?}", o),
        }
    }

    pub fn list_mut(&mut self, r: GcRef) -> &mut GravityList {
        match self.get_mut(r) {
            GravityObject::List(x) => x,
            o => panic!("expected List, found {:?}", o),
        }
    }

    pub fn map(&self, r: GcRef) -> &GravityMap {
        match self.get(r) {
            GravityObject::Map(x) => x,
            o => panic!("expected Map, found {:?}", o),
        }
    }

    pub fn map_mut(&mut self, r: GcRef) -> &mut GravityMap {
        match self.get_mut(r) {
            GravityObject::Map(x) => x,
            o => panic!("expected Map, found {:?}", o),
        }
    }

    pub fn function(&self, r: GcRef) -> &GravityFunction {
        match self.get(r) {
            GravityObject::Function(x) => x,
            o => panic!("expected Function, found {:?}", o),
        }
    }

    pub fn function_mut(&mut self, r: GcRef) -> &mut GravityFunction {
        match self.get_mut(r) {
            GravityObject::Function(x) => x,
            o => panic!("expected Function, found {:?}", o),
        }
    }

    pub fn closure(&self, r: GcRef) -> &GravityClosure {
        match self.get(r) {
            GravityObject::Closure(x) => x,
            o => panic!("expected Closure, found {:?}", o),
        }
    }

    pub fn closure_mut(&mut self, r: GcRef) -> &mut GravityClosure {
        match self.get_mut(r) {
            GravityObject::Closure(x) => x,
            o => panic!("expected Closure, found {:?}", o),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &GravityUpvalue {
        match self.get(r) {
            GravityObject::Upvalue(x) => x,
            o => panic!("expected Upvalue, found {:?}", o),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut GravityUpvalue {
        match self.get_mut(r) {
            GravityObject::Upvalue(x) => x,
            o => panic!("expected Upvalue, found {:?}", o),
        }
    }

    pub fn class(&self, r: GcRef) -> &GravityClass {
        match self.get(r) {
            GravityObject::Class(x) => x,
            o => panic!("expected Class, found {:?}", o),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut GravityClass {
        match self.get_mut(r) {
            GravityObject::Class(x) => x,
            o => panic!("expected Class, found {:?}", o),
        }
    }

    pub fn instance(&self, r: GcRef) -> &GravityInstance {
        match self.get(r) {
            GravityObject::Instance(x) => x,
            o => panic!("expected Instance, found {:?}", o),
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> &mut GravityInstance {
        match self.get_mut(r) {
            GravityObject::Instance(x) => x,
            o => panic!("expected Instance, found {:?}", o),
        }
    }

    pub fn module(&self, r: GcRef) -> &GravityModule {
        match self.get(r) {
            GravityObject::Module(x) => x,
            o => panic!("expected Module, found {:?}", o),
        }
    }

    pub fn fiber(&self, r: GcRef) -> &GravityFiber {
        match self.get(r) {
            GravityObject::Fiber(x) => x,
            o => panic!("expected Fiber, found {:?}", o),
        }
    }

    pub fn fiber_mut(&mut self, r: GcRef) -> &mut GravityFiber {
        match self.get_mut(r) {
            GravityObject::Fiber(x) => x,
            o => panic!("expected Fiber, found {:?}", o),
        }
    }

    // ── Mark phase ───────────────────────────────────────────────────────────

    /// Begin a cycle: reset accounting, clear the worklist.
    pub fn mark_begin(&mut self) {
        self.memallocated = 0;
        self.graylist.clear();
    }

    pub fn gray_value(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.gray(r);
        }
    }

    /// Put an object on the worklist if it has not been seen this cycle.
    pub fn gray(&mut self, r: GcRef) {
        if let Some(slot) = self.slots.get_mut(r.0 as usize).and_then(|s| s.as_mut()) {
            if !slot.dark {
                slot.dark = true;
                self.graylist.push(r);
            }
        }
    }

    pub fn gray_pop(&mut self) -> Option<GcRef> {
        self.graylist.pop()
    }

    /// Account the object's own size and gray everything it references.
    /// Returns refs to bridged xdata holders so the VM can run the delegate
    /// blacken callback outside the heap borrow.
    pub fn blacken(&mut self, r: GcRef) -> bool {
        let mut children: Vec<GcRef> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        let mut has_xdata = false;

        let size = {
            let obj = self.get(r);
            match obj {
                GravityObject::String(_) | GravityObject::Range(_) => {}
                GravityObject::List(l) => child_values.extend(l.items.iter().copied()),
                GravityObject::Map(m) => {
                    for (k, v) in m.table.entries() {
                        child_values.push(k);
                        child_values.push(v);
                    }
                }
                GravityObject::Function(f) => match &f.kind {
                    FunctionKind::Native(c) => {
                        child_values.extend(c.cpool.iter().copied());
                        child_values.extend(c.pvalues.iter().copied());
                        child_values.extend(c.pnames.iter().copied());
                    }
                    FunctionKind::Special { getter, setter, .. } => {
                        children.extend(getter.iter().copied());
                        children.extend(setter.iter().copied());
                    }
                    FunctionKind::Bridged { .. } => has_xdata = true,
                    FunctionKind::Internal(_) => {}
                },
                GravityObject::Closure(c) => {
                    children.push(c.func);
                    children.extend(c.upvalues.iter().copied());
                    children.extend(c.context.iter().copied());
                }
                GravityObject::Upvalue(u) => match u.state {
                    UpvalueState::Closed(v) => child_values.push(v),
                    // the pointed slot is traced through the fiber stack;
                    // the fiber itself must outlive the open upvalue
                    UpvalueState::Open { fiber, .. } => children.push(fiber),
                },
                GravityObject::Class(c) => {
                    children.extend(c.meta.iter().copied());
                    children.extend(c.superclass.iter().copied());
                    child_values.extend(c.ivars.iter().copied());
                    for (k, v) in c.methods.entries() {
                        child_values.push(k);
                        child_values.push(v);
                    }
                    has_xdata = c.xdata.is_some();
                }
                GravityObject::Instance(i) => {
                    children.push(i.class);
                    child_values.extend(i.ivars.iter().copied());
                    has_xdata = i.xdata.is_some();
                }
                GravityObject::Module(m) => {
                    for (k, v) in m.exports.entries() {
                        child_values.push(k);
                        child_values.push(v);
                    }
                }
                GravityObject::Fiber(f) => {
                    for frame in &f.frames {
                        children.push(frame.closure);
                        children.extend(frame.args.iter().copied());
                    }
                    let top = f.stacktop.min(f.stack.len());
                    child_values.extend(f.stack[..top].iter().copied());
                    children.extend(f.upvalues.iter().copied());
                    children.extend(f.caller.iter().copied());
                    child_values.push(f.result);
                }
            }
            obj.shallow_size()
        };
        self.memallocated += size;

        for c in children {
            self.gray(c);
        }
        for v in child_values {
            self.gray_value(v);
        }
        has_xdata
    }

    // ── Sweep phase ──────────────────────────────────────────────────────────

    /// Free every unmarked object, clear marks on survivors, recompute the
    /// next threshold. Returns the number of freed objects.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            let dead = match &self.slots[idx] {
                Some(slot) => !slot.dark,
                None => false,
            };
            if dead {
                self.slots[idx] = None;
                self.free_list.push(idx as u32);
                freed += 1;
            } else if let Some(slot) = self.slots[idx].as_mut() {
                slot.dark = false;
                slot.visited = false;
            }
        }
        self.gcthreshold = ((self.memallocated as f64) * (1.0 + self.gcratio / 100.0)) as u64;
        if self.gcthreshold < self.gcminthreshold {
            self.gcthreshold = self.gcminthreshold;
        }
        self.ncollections += 1;
        freed
    }

    /// Drop every object that fails the filter, bypassing reachability.
    /// Used at VM teardown so the embedder can keep pinned objects.
    pub fn sweep_with_filter(&mut self, filter: &mut dyn FnMut(GcRef, &GravityObject) -> bool) {
        for idx in 0..self.slots.len() {
            let keep = match &self.slots[idx] {
                Some(slot) => filter(GcRef(idx as u32), &slot.object),
                None => continue,
            };
            if !keep {
                self.slots[idx] = None;
                self.free_list.push(idx as u32);
            }
        }
    }

    // ── Re-entrant size accounting ───────────────────────────────────────────

    /// Deep size of an object graph rooted at `r`. The per-slot `visited`
    /// flag stops recursion on cycles; flags are cleared before returning.
    pub fn object_size(&mut self, r: GcRef) -> u64 {
        let total = self.object_size_inner(r);
        for slot in self.slots.iter_mut().flatten() {
            slot.visited = false;
        }
        total
    }

    fn object_size_inner(&mut self, r: GcRef) -> u64 {
        let slot = match self.slots.get_mut(r.0 as usize).and_then(|s| s.as_mut()) {
            Some(s) => s,
            None => return 0,
        };
        if slot.visited {
            return 0;
        }
        slot.visited = true;
        let mut total = slot.object.shallow_size();

        let mut children: Vec<GcRef> = Vec::new();
        match self.get(r) {
            GravityObject::Closure(c) => {
                children.push(c.func);
                children.extend(c.upvalues.iter().copied());
            }
            GravityObject::Class(c) => {
                children.extend(c.superclass.iter().copied());
                children.extend(c.meta.iter().copied());
            }
            GravityObject::Instance(i) => children.push(i.class),
            GravityObject::List(l) => {
                children.extend(l.items.iter().filter_map(|v| v.as_object()));
            }
            GravityObject::Map(m) => {
                for (k, v) in m.table.entries() {
                    children.extend(k.as_object().into_iter());
                    children.extend(v.as_object().into_iter());
                }
            }
            _ => {}
        }
        for c in children {
            total += self.object_size_inner(c);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::GravityString;

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut heap = GcHeap::new();
        let a = heap.alloc(GravityObject::String(GravityString::new("a".into())));
        let b = heap.alloc(GravityObject::String(GravityString::new("b".into())));
        assert_ne!(a, b);

        // nothing grayed: both die
        heap.mark_begin();
        heap.sweep();
        assert_eq!(heap.live_count(), 0);

        let c = heap.alloc(GravityObject::String(GravityString::new("c".into())));
        assert!(c.index() == a.index() || c.index() == b.index());
    }

    #[test]
    fn marked_objects_survive_and_marks_clear() {
        let mut heap = GcHeap::new();
        let a = heap.alloc(GravityObject::String(GravityString::new("keep".into())));
        let _b = heap.alloc(GravityObject::String(GravityString::new("drop".into())));

        heap.mark_begin();
        heap.gray(a);
        while let Some(r) = heap.gray_pop() {
            heap.blacken(r);
        }
        let freed = heap.sweep();
        assert_eq!(freed, 1);
        assert!(heap.contains(a));
        assert_eq!(heap.string(a).s, "keep");
    }

    #[test]
    fn disable_nesting() {
        let mut heap = GcHeap::new();
        heap.set_enabled(false);
        heap.set_enabled(false);
        heap.set_enabled(true);
        assert!(!heap.is_enabled());
        heap.set_enabled(true);
        assert!(heap.is_enabled());
    }
}
