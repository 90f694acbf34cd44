pub mod bytecode;
pub mod fiber;
pub mod heap;
pub mod marshal;
pub mod value;
pub mod verifier;

pub use bytecode::FuncDef;
pub use fiber::Fiber;
pub use heap::{GcRef, Heap, HeapObject};
pub use value::Value;

/// Recursion bound for the mutually recursive graph walks.
///
/// The depth counter lives in the low 16 bits of the `flags` word that is
/// threaded through every recursive call; exceeding this bound aborts the
/// whole operation instead of overflowing the native stack.
pub const RECURSION_GUARD: i32 = 1024;
