//! Gravity runtime core.
//!
//! Module layout:
//!   - errors     — error kinds and the public error type
//!   - core       — tagged Value, heap object variants, class graph
//!   - hash       — Value-keyed chained-bucket hash table
//!   - gc         — object arena + tri-color mark-sweep collector
//!   - bytecode   — 6-bit opcode set, 32-bit instruction encoding
//!   - fiber      — fibers, call frames, open-upvalue lists
//!   - vm         — dispatch loop, method dispatch, embedding API
//!   - corelib    — built-in methods on the core classes
//!   - serialize  — JSON executable (de)serialization
//!   - delegate   — embedder callbacks (errors, logging, bridge)

pub mod errors;

pub mod core;
pub mod hash;

pub mod gc;
pub mod bytecode;
pub mod fiber;

pub mod vm;
pub mod corelib;
pub mod serialize;
pub mod delegate;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use crate::core::object::{GravityObject, XData};
pub use crate::core::oop::CoreClasses;
pub use crate::core::value::Value;
pub use bytecode::{Instr, Op};
pub use delegate::{DefaultDelegate, GravityDelegate};
pub use errors::{ErrorKind, GravityError};
pub use gc::{GcHeap, GcRef};
pub use serialize::{load_buffer, serialize_class, serialize_function};
pub use vm::GravityVm;
