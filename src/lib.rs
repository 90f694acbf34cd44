//! Tarn - a small embeddable lisp-family scripting runtime
//!
//! This library provides the tarn value model, the object heap, function
//! definitions with a bytecode verifier, fibers, and the marshaling
//! subsystem that serializes arbitrary value graphs (including cycles,
//! closures with captured environments, and suspended fibers) to a
//! compact self-contained byte format.

pub mod vm;

// Re-export commonly used types
pub use vm::heap::{GcRef, Heap, HeapObject, ObjectKind, OpaqueType};
pub use vm::marshal::{env_lookup, marshal, marshal_into, unmarshal, MarshalError};
pub use vm::value::Value;
