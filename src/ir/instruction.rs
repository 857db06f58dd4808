//! The high-level instruction set and the generic instruction containers.
//!
//! High-level instructions are three-address: `opcode dest, src1, src2`.
//! Operand widths and comparison relations are carried as enum payload on
//! the opcode itself, so family membership (is this arithmetic? does it
//! define a destination?) is a pattern match rather than numbering tricks.
//!
//! `Instruction` and `InstructionSequence` are generic over the opcode type
//! and are reused unchanged for the low-level (x86-64) instruction set.

use std::fmt;

use crate::common::error::{CodegenError, Result};
use crate::common::types::Width;
use crate::ir::operand::Operand;

/// Comparison relation, used both by high-level `Cmp` and by low-level
/// `set`/conditional-jump mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpRel {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpRel {
    /// Condition-code suffix (`setl`, `jne`, ...).
    pub fn suffix(self) -> &'static str {
        match self {
            CmpRel::Lt => "l",
            CmpRel::Le => "le",
            CmpRel::Gt => "g",
            CmpRel::Ge => "ge",
            CmpRel::Eq => "e",
            CmpRel::Ne => "ne",
        }
    }

    /// Evaluate the relation on signed integers.
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpRel::Lt => lhs < rhs,
            CmpRel::Le => lhs <= rhs,
            CmpRel::Gt => lhs > rhs,
            CmpRel::Ge => lhs >= rhs,
            CmpRel::Eq => lhs == rhs,
            CmpRel::Ne => lhs != rhs,
        }
    }
}

/// High-level (three-address) opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighOp {
    Nop,
    /// `mov dest, src`
    Mov(Width),
    Add(Width),
    Sub(Width),
    Mul(Width),
    Div(Width),
    Mod(Width),
    /// `neg dest, src`
    Neg(Width),
    /// Sign-extending conversion `sconv dest, src` (from, to).
    SConv(Width, Width),
    /// Zero-extending conversion (from, to).
    UConv(Width, Width),
    /// `cmp dest, src1, src2`: dest = (src1 rel src2) as 0/1.
    Cmp(CmpRel, Width),
    /// Unconditional jump to a label operand.
    Jmp,
    /// Jump if the condition operand is nonzero.
    CJmpT,
    /// Jump if the condition operand is zero.
    CJmpF,
    /// Call the symbol named by the operand. Arguments are in vr1..,
    /// the return value lands in vr0.
    Call,
    Ret,
    /// Function prologue marker; lowering expands the frame setup.
    Enter,
    /// Function epilogue marker.
    Leave,
    /// `localaddr dest, $offset`: address of the local storage slot at
    /// the given byte offset.
    LocalAddr,
}

impl HighOp {
    /// Does operand 0 of this instruction name a destination being written?
    pub fn defines_dest(self) -> bool {
        matches!(
            self,
            HighOp::Mov(_)
                | HighOp::Add(_)
                | HighOp::Sub(_)
                | HighOp::Mul(_)
                | HighOp::Div(_)
                | HighOp::Mod(_)
                | HighOp::Neg(_)
                | HighOp::SConv(..)
                | HighOp::UConv(..)
                | HighOp::Cmp(..)
                | HighOp::LocalAddr
        )
    }

    /// Does this instruction end a basic block? Calls do: the callee may
    /// not return, and treating them as block boundaries keeps every
    /// block's register state call-free.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            HighOp::Jmp | HighOp::CJmpT | HighOp::CJmpF | HighOp::Ret | HighOp::Call
        )
    }

    /// True for the two-source arithmetic family.
    pub fn is_binary_arith(self) -> bool {
        matches!(
            self,
            HighOp::Add(_) | HighOp::Sub(_) | HighOp::Mul(_) | HighOp::Div(_) | HighOp::Mod(_)
        )
    }

    /// Width of the source operands, for opcodes that have one.
    pub fn source_width(self) -> Option<Width> {
        match self {
            HighOp::Mov(w)
            | HighOp::Add(w)
            | HighOp::Sub(w)
            | HighOp::Mul(w)
            | HighOp::Div(w)
            | HighOp::Mod(w)
            | HighOp::Neg(w)
            | HighOp::Cmp(_, w)
            | HighOp::SConv(w, _)
            | HighOp::UConv(w, _) => Some(w),
            _ => None,
        }
    }

    /// Evaluate an arithmetic opcode on constant sources, producing the
    /// value the machine instruction would. Division and modulo by zero
    /// are compile-time fatal rather than a folded value.
    pub fn eval(self, lhs: i64, rhs: i64) -> Result<i64> {
        let (w, raw) = match self {
            HighOp::Add(w) => (w, lhs.wrapping_add(rhs)),
            HighOp::Sub(w) => (w, lhs.wrapping_sub(rhs)),
            HighOp::Mul(w) => (w, lhs.wrapping_mul(rhs)),
            HighOp::Div(w) => {
                if rhs == 0 {
                    return Err(CodegenError::DivisionByZero);
                }
                (w, lhs.wrapping_div(rhs))
            }
            HighOp::Mod(w) => {
                if rhs == 0 {
                    return Err(CodegenError::DivisionByZero);
                }
                (w, lhs.wrapping_rem(rhs))
            }
            other => return Err(CodegenError::UnhandledOpcode(other.to_string())),
        };
        Ok(w.wrap(raw))
    }
}

impl fmt::Display for HighOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HighOp::Nop => write!(f, "nop"),
            HighOp::Mov(w) => write!(f, "mov_{}", w),
            HighOp::Add(w) => write!(f, "add_{}", w),
            HighOp::Sub(w) => write!(f, "sub_{}", w),
            HighOp::Mul(w) => write!(f, "mul_{}", w),
            HighOp::Div(w) => write!(f, "div_{}", w),
            HighOp::Mod(w) => write!(f, "mod_{}", w),
            HighOp::Neg(w) => write!(f, "neg_{}", w),
            HighOp::SConv(from, to) => write!(f, "sconv_{}{}", from, to),
            HighOp::UConv(from, to) => write!(f, "uconv_{}{}", from, to),
            HighOp::Cmp(rel, w) => write!(f, "cmp{}_{}", rel.suffix(), w),
            HighOp::Jmp => write!(f, "jmp"),
            HighOp::CJmpT => write!(f, "cjmp_t"),
            HighOp::CJmpF => write!(f, "cjmp_f"),
            HighOp::Call => write!(f, "call"),
            HighOp::Ret => write!(f, "ret"),
            HighOp::Enter => write!(f, "enter"),
            HighOp::Leave => write!(f, "leave"),
            HighOp::LocalAddr => write!(f, "localaddr"),
        }
    }
}

/// A single instruction: an opcode and its operand list.
///
/// For the high-level set, operand 0 is the destination whenever the opcode
/// defines one. For the low-level set, operands are stored in AT&T emission
/// order. Instructions are owned by exactly one container; `Clone` is the
/// way to duplicate one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction<O> {
    pub opcode: O,
    pub operands: Vec<Operand>,
}

impl<O> Instruction<O> {
    pub fn new(opcode: O, operands: Vec<Operand>) -> Self {
        Instruction { opcode, operands }
    }

    pub fn operand(&self, idx: usize) -> &Operand {
        &self.operands[idx]
    }
}

impl Instruction<HighOp> {
    /// The destination operand, when the opcode defines one.
    pub fn dest(&self) -> Option<&Operand> {
        if self.opcode.defines_dest() {
            self.operands.first()
        } else {
            None
        }
    }

    /// The source operands: everything past the destination for defining
    /// opcodes, the whole operand list otherwise.
    pub fn sources(&self) -> &[Operand] {
        if self.opcode.defines_dest() {
            &self.operands[1..]
        } else {
            &self.operands[..]
        }
    }

    /// Visit every vreg this instruction reads: source vregs, memory
    /// reference bases anywhere in the operand list, and the destination
    /// position when it is itself a store through a vreg.
    pub fn for_each_used_vreg<F: FnMut(u32)>(&self, mut f: F) {
        for src in self.sources() {
            if let Some(r) = src.base_vreg() {
                f(r);
            }
        }
        if let Some(Operand::VregMem(r)) = self.dest() {
            f(*r);
        }
    }

    /// The vreg this instruction writes, if the destination is a plain
    /// vreg. Stores through memory define nothing.
    pub fn dest_vreg(&self) -> Option<u32> {
        self.dest().and_then(Operand::vreg)
    }
}

impl<O: fmt::Display> fmt::Display for Instruction<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", op)?;
            } else {
                write!(f, ", {}", op)?;
            }
        }
        Ok(())
    }
}

/// Per-function metadata attached to an instruction sequence by the
/// storage-allocation stage: how many bytes of in-memory local storage the
/// function needs, and the highest vreg number it mentions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub local_storage: u32,
    pub max_vreg: u32,
}

/// A linear sequence of instructions with optional per-position labels and
/// optionally attached function metadata.
#[derive(Debug, Clone)]
pub struct InstructionSequence<O> {
    instrs: Vec<Instruction<O>>,
    /// Labels parallel to `instrs`, attached to the instruction at the
    /// same index.
    labels: Vec<Option<String>>,
    /// A label defined after the last instruction, waiting for the next
    /// append.
    pending_label: Option<String>,
    pub fun: Option<FunctionInfo>,
}

impl<O> Default for InstructionSequence<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> InstructionSequence<O> {
    pub fn new() -> Self {
        InstructionSequence {
            instrs: Vec::new(),
            labels: Vec::new(),
            pending_label: None,
            fun: None,
        }
    }

    /// Define a label at the current end of the sequence; it attaches to
    /// the next appended instruction.
    pub fn define_label(&mut self, name: impl Into<String>) {
        self.pending_label = Some(name.into());
    }

    pub fn append(&mut self, ins: Instruction<O>) {
        self.labels.push(self.pending_label.take());
        self.instrs.push(ins);
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Instruction<O> {
        &self.instrs[idx]
    }

    /// Label attached to position `idx`, if any.
    pub fn label_at(&self, idx: usize) -> Option<&str> {
        self.labels[idx].as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction<O>> {
        self.instrs.iter()
    }
}

impl<O: fmt::Display> fmt::Display for InstructionSequence<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ins) in self.instrs.iter().enumerate() {
            if let Some(label) = self.label_at(i) {
                writeln!(f, "{}:", label)?;
            }
            writeln!(f, "\t{}", ins)?;
        }
        Ok(())
    }
}
