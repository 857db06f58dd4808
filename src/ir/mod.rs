//! Intermediate representations shared by the optimizer and the code
//! generator: operands, the high-level instruction set, the control-flow
//! graph, and vreg liveness.

pub mod cfg;
pub mod instruction;
pub mod liveness;
pub mod operand;
