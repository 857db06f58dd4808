//! Back-end error taxonomy.
//!
//! Every error here is fatal for the function being compiled: the back end
//! operates on already-validated input, so a failure indicates either a bug
//! in an upstream phase (type checking, storage allocation) or an incomplete
//! lowering table. There is no retry or recovery; errors propagate with `?`
//! to the per-function entry point and abort the whole compilation.

use thiserror::Error;

/// Fatal conditions raised by CFG transformation, optimization, and lowering.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The lowering table has no expansion for a high-level opcode.
    /// Never silently dropped: an unmapped opcode means the table is incomplete.
    #[error("no low-level expansion for high-level opcode `{0}`")]
    UnhandledOpcode(String),

    /// An operand width was requested for a type that is neither a scalar
    /// basic type nor a pointer. Indicates a type-checking bug upstream.
    #[error("type `{0}` has no machine operand width")]
    NonScalarType(String),

    /// Constant folding encountered division or modulo by a constant zero.
    /// Surfaced at compile time rather than folded into an undefined value.
    #[error("division by zero in constant expression")]
    DivisionByZero,

    /// A reserved communication-channel vreg (vr7–vr9) reached operand
    /// mapping. The front end never allocates these.
    #[error("virtual register vr{0} is reserved and has no storage mapping")]
    ReservedVreg(u32),

    /// The instruction sequence arrived without its function definition
    /// handle (storage size, highest vreg), which lowering requires.
    #[error("instruction sequence has no function definition attached")]
    MissingFunction,
}

pub type Result<T> = std::result::Result<T, CodegenError>;
