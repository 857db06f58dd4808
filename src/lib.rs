//! Back end of the nearly-C compiler.
//!
//! Consumes the linear high-level IR produced by the front end (one
//! instruction sequence per function, annotated with the function's storage
//! requirements), restructures it into a control-flow graph, improves each
//! basic block with liveness-driven local optimizations, and lowers the
//! result to two-operand x86-64 instructions ready for textual emission.
//!
//! Pipeline: linear high-level IR, CFG construction, iterated local passes
//! over fresh liveness facts, flattening, then lowering to low-level IR.

pub mod backend;
pub mod common;
pub mod ir;
pub mod passes;
