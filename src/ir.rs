//! The intermediate representation: a flat, per-function instruction list,
//! a scoped symbol table used only while generating it, and the generator
//! that lowers a typed AST down to it.

pub mod gen;
pub mod instr;
pub mod symtab;

pub use gen::gen_function;
pub use instr::{IRFunction, IRInstruction, Opcode, OpcodeFormat, VReg, INVALID_VREG, IR_CHUNK_SIZE};
