//! Lowering from the high-level IR to x86-64 machine instructions.

pub mod codegen;
pub mod lowlevel;
