//! Per-function machine code generation: register allocation over the
//! textually-linearized IR, then two-pass x86-64 encoding.

pub mod builder;
pub mod regalloc;
pub mod x86;

pub use builder::{build_function, CallSite, CodegenError, CompiledFunction};
pub use regalloc::{allocate, Allocation, Location};
