//! The low-level (x86-64) opcode set.
//!
//! Two-operand instructions in AT&T operand order: source first,
//! destination last. Widths ride on the opcode the same way they do in the
//! high-level set, and display as the matching mnemonic suffix
//! (`movl`, `addq`, ...).

use std::fmt;

use crate::common::types::Width;
use crate::ir::instruction::CmpRel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowOp {
    Nop,
    Mov(Width),
    Add(Width),
    Sub(Width),
    Imul(Width),
    Idiv(Width),
    Neg(Width),
    /// Sign-extend %eax into %edx:%eax ahead of a 4-byte divide.
    Cdq,
    /// Sign-extend %rax into %rdx:%rax ahead of an 8-byte divide.
    Cqo,
    /// `leaq off(%rbp), reg`.
    Lea,
    Cmp(Width),
    /// `set<rel>` on a byte register.
    Set(CmpRel),
    /// Sign-extending move (from, to).
    Movs(Width, Width),
    /// Zero-extending move (from, to).
    Movz(Width, Width),
    Push(Width),
    Pop(Width),
    Jmp,
    /// `j<rel>` conditional jump.
    JCond(CmpRel),
    Call,
    Ret,
}

impl fmt::Display for LowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowOp::Nop => write!(f, "nop"),
            LowOp::Mov(w) => write!(f, "mov{}", w),
            LowOp::Add(w) => write!(f, "add{}", w),
            LowOp::Sub(w) => write!(f, "sub{}", w),
            LowOp::Imul(w) => write!(f, "imul{}", w),
            LowOp::Idiv(w) => write!(f, "idiv{}", w),
            LowOp::Neg(w) => write!(f, "neg{}", w),
            LowOp::Cdq => write!(f, "cdq"),
            LowOp::Cqo => write!(f, "cqo"),
            LowOp::Lea => write!(f, "leaq"),
            LowOp::Cmp(w) => write!(f, "cmp{}", w),
            LowOp::Set(rel) => write!(f, "set{}", rel.suffix()),
            LowOp::Movs(from, to) => write!(f, "movs{}{}", from, to),
            LowOp::Movz(from, to) => write!(f, "movz{}{}", from, to),
            LowOp::Push(w) => write!(f, "push{}", w),
            LowOp::Pop(w) => write!(f, "pop{}", w),
            LowOp::Jmp => write!(f, "jmp"),
            LowOp::JCond(rel) => write!(f, "j{}", rel.suffix()),
            LowOp::Call => write!(f, "call"),
            LowOp::Ret => write!(f, "ret"),
        }
    }
}
