//! Embedder delegate.
//!
//! Every callback is optional (defaulted); the bridge hooks fire only when a
//! bridged xdata is attached to the class/instance/function involved. The
//! delegate is owned by the VM and invoked from the single VM thread.

use std::any::Any;

use crate::core::value::Value;
use crate::errors::ErrorKind;
use crate::gc::GcRef;
use crate::vm::GravityVm;

#[allow(unused_variables)]
pub trait GravityDelegate {
    /// Runtime/compile diagnostics funnel.
    fn error_callback(&self, kind: ErrorKind, message: &str) {
        eprintln!("{}: {}", kind.name(), message);
    }

    /// System.print output. Default writes to stdout.
    fn log_callback(&self, message: &str) {
        println!("{}", message);
    }

    // ── Bridge hooks ─────────────────────────────────────────────────────────

    /// A bridged class is being instantiated; produce the instance xdata.
    fn bridge_init_instance(&self, class_xdata: &dyn Any, args: &[Value]) -> Option<Box<dyn Any>> {
        None
    }

    /// A bridged function or method is being executed.
    /// Return false with a fiber error set to raise.
    fn bridge_execute(
        &self,
        vm: &mut GravityVm,
        xdata: &dyn Any,
        args: &[Value],
        nargs: u16,
        rindex: u32,
    ) -> bool {
        true
    }

    /// Property read on a bridged instance.
    fn bridge_get_value(
        &self,
        vm: &mut GravityVm,
        xdata: &dyn Any,
        target: Value,
        key: &str,
        rindex: u32,
    ) -> bool {
        false
    }

    /// Property write on a bridged instance.
    fn bridge_set_value(
        &self,
        vm: &mut GravityVm,
        xdata: &dyn Any,
        target: Value,
        key: &str,
        value: Value,
    ) -> bool {
        false
    }

    /// Undefined-property read fallback.
    fn bridge_get_undef(
        &self,
        vm: &mut GravityVm,
        xdata: &dyn Any,
        target: Value,
        key: &str,
        rindex: u32,
    ) -> bool {
        false
    }

    /// Undefined-property write fallback.
    fn bridge_set_undef(
        &self,
        vm: &mut GravityVm,
        xdata: &dyn Any,
        target: Value,
        key: &str,
        value: Value,
    ) -> bool {
        false
    }

    /// Equality between two bridged instances.
    fn bridge_equals(&self, xdata1: &dyn Any, xdata2: &dyn Any) -> bool {
        false
    }

    /// Clone the xdata of a bridged instance.
    fn bridge_clone(&self, xdata: &dyn Any) -> Option<Box<dyn Any>> {
        None
    }

    /// Size in bytes of a bridged payload (GC accounting).
    fn bridge_size(&self, xdata: &dyn Any) -> u64 {
        0
    }

    /// String rendering of a bridged instance.
    fn bridge_string(&self, xdata: &dyn Any) -> Option<String> {
        None
    }

    /// Mark phase hook: return every heap reference the payload keeps alive.
    fn bridge_blacken(&self, xdata: &dyn Any) -> Vec<GcRef> {
        Vec::new()
    }

    /// The payload is being freed with its owner.
    fn bridge_free(&self, xdata: &dyn Any) {}

    /// Teardown filter: return true to keep the object alive through VM drop.
    fn keep_on_free(&self, obj_ref: GcRef) -> bool {
        false
    }
}

/// No-op delegate used when the embedder does not provide one.
#[derive(Debug, Default)]
pub struct DefaultDelegate;

impl GravityDelegate for DefaultDelegate {}
