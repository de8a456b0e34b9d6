//! Core intermediate representation, bitcode codec, linker and type/tag
//! analysis for a whole-program link-time optimizer.
//!
//! This crate owns the typed SSA-form IR (`ir`), a deterministic
//! little-endian bitcode format with reader and writer (`bitcode`), a
//! symbol-resolution linker that merges modules and archives (`link`), and
//! a forward/backward type-and-tag abstract interpretation (`tags`).
//! Instruction selection, register allocation and runtime-printer
//! back-ends consume this IR through the visitor interface in `inst` but
//! are not implemented here.

pub mod bitcode;
pub mod cfg;
pub mod constant;
pub mod inst;
pub mod ir;
pub mod link;
pub mod printer;
pub mod tags;
pub mod target;
pub mod types;
pub mod value;

pub use crate::ir::Program;
pub use crate::target::Target;
