//! Instruction operands, shared by the high-level and low-level
//! instruction sets.
//!
//! The high-level set uses virtual registers (`Vreg`/`VregMem`) and labels;
//! lowering rewrites those into machine-register and `off(%rbp)` forms. The
//! two sets share one operand type so the register promotion pass can place
//! machine registers directly into high-level instructions.
//!
//! Virtual register numbering is an ABI contract with the front end:
//! vr0 is the return-value channel, vr1..=vr6 are the six argument
//! registers, vr7..=vr9 are reserved, and vr10 onward are function locals.

use std::fmt;

use crate::common::types::Width;

/// First vreg number available for function-local temporaries. Everything
/// below is a caller-visible channel or reserved.
pub const VREG_FIRST_LOCAL: u32 = 10;

/// The return-value vreg.
pub const VREG_RETURN: u32 = 0;

/// Inclusive range of argument vregs (vr1 = first argument).
pub const VREG_FIRST_ARG: u32 = 1;
pub const VREG_LAST_ARG: u32 = 6;

/// x86-64 general-purpose machine register, named independently of access
/// width. The sized name (`%rax`/`%eax`/`%ax`/`%al`) is selected at display
/// time from the operand's `Width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mreg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Mreg {
    /// Sized assembly name for this register, without the `%` sigil.
    pub fn name(self, width: Width) -> &'static str {
        use Mreg::*;
        match (self, width) {
            (Rax, Width::Q) => "rax",
            (Rax, Width::L) => "eax",
            (Rax, Width::W) => "ax",
            (Rax, Width::B) => "al",
            (Rbx, Width::Q) => "rbx",
            (Rbx, Width::L) => "ebx",
            (Rbx, Width::W) => "bx",
            (Rbx, Width::B) => "bl",
            (Rcx, Width::Q) => "rcx",
            (Rcx, Width::L) => "ecx",
            (Rcx, Width::W) => "cx",
            (Rcx, Width::B) => "cl",
            (Rdx, Width::Q) => "rdx",
            (Rdx, Width::L) => "edx",
            (Rdx, Width::W) => "dx",
            (Rdx, Width::B) => "dl",
            (Rsi, Width::Q) => "rsi",
            (Rsi, Width::L) => "esi",
            (Rsi, Width::W) => "si",
            (Rsi, Width::B) => "sil",
            (Rdi, Width::Q) => "rdi",
            (Rdi, Width::L) => "edi",
            (Rdi, Width::W) => "di",
            (Rdi, Width::B) => "dil",
            (Rbp, Width::Q) => "rbp",
            (Rbp, Width::L) => "ebp",
            (Rbp, Width::W) => "bp",
            (Rbp, Width::B) => "bpl",
            (Rsp, Width::Q) => "rsp",
            (Rsp, Width::L) => "esp",
            (Rsp, Width::W) => "sp",
            (Rsp, Width::B) => "spl",
            (R8, Width::Q) => "r8",
            (R8, Width::L) => "r8d",
            (R8, Width::W) => "r8w",
            (R8, Width::B) => "r8b",
            (R9, Width::Q) => "r9",
            (R9, Width::L) => "r9d",
            (R9, Width::W) => "r9w",
            (R9, Width::B) => "r9b",
            (R10, Width::Q) => "r10",
            (R10, Width::L) => "r10d",
            (R10, Width::W) => "r10w",
            (R10, Width::B) => "r10b",
            (R11, Width::Q) => "r11",
            (R11, Width::L) => "r11d",
            (R11, Width::W) => "r11w",
            (R11, Width::B) => "r11b",
            (R12, Width::Q) => "r12",
            (R12, Width::L) => "r12d",
            (R12, Width::W) => "r12w",
            (R12, Width::B) => "r12b",
            (R13, Width::Q) => "r13",
            (R13, Width::L) => "r13d",
            (R13, Width::W) => "r13w",
            (R13, Width::B) => "r13b",
            (R14, Width::Q) => "r14",
            (R14, Width::L) => "r14d",
            (R14, Width::W) => "r14w",
            (R14, Width::B) => "r14b",
            (R15, Width::Q) => "r15",
            (R15, Width::L) => "r15d",
            (R15, Width::W) => "r15w",
            (R15, Width::B) => "r15b",
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Integer immediate.
    Imm(i64),
    /// Immediate symbol reference (e.g. a call target).
    ImmLabel(String),
    /// Control-flow target label.
    Label(String),
    /// Virtual register.
    Vreg(u32),
    /// Memory reference through the address held in a virtual register.
    VregMem(u32),
    /// Machine register accessed at the given width.
    Mreg(Width, Mreg),
    /// Memory reference `(reg)`.
    MregMem(Mreg),
    /// Memory reference `off(reg)`.
    MregMemOff(Mreg, i32),
}

impl Operand {
    /// The vreg number if this operand is a direct vreg access.
    pub fn vreg(&self) -> Option<u32> {
        match self {
            Operand::Vreg(r) => Some(*r),
            _ => None,
        }
    }

    /// The vreg whose value this operand reads, counting memory references
    /// through a vreg (the base address is a read even when the reference
    /// as a whole is being written).
    pub fn base_vreg(&self) -> Option<u32> {
        match self {
            Operand::Vreg(r) | Operand::VregMem(r) => Some(*r),
            _ => None,
        }
    }

    /// True for operands that resolve to a memory location.
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            Operand::VregMem(_) | Operand::MregMem(_) | Operand::MregMemOff(..)
        )
    }

    /// True for immediates (integer or symbol).
    pub fn is_immediate(&self) -> bool {
        matches!(self, Operand::Imm(_) | Operand::ImmLabel(_))
    }

    /// Convert a register operand into a memory reference through it.
    /// Identity on operands that are already memory references.
    pub fn to_memref(&self) -> Operand {
        match self {
            Operand::Vreg(r) => Operand::VregMem(*r),
            Operand::Mreg(_, m) => Operand::MregMem(*m),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "${}", v),
            Operand::ImmLabel(name) => write!(f, "{}", name),
            Operand::Label(name) => write!(f, "{}", name),
            Operand::Vreg(r) => write!(f, "vr{}", r),
            Operand::VregMem(r) => write!(f, "(vr{})", r),
            Operand::Mreg(w, m) => write!(f, "%{}", m.name(*w)),
            Operand::MregMem(m) => write!(f, "(%{})", m.name(Width::Q)),
            Operand::MregMemOff(m, off) => write!(f, "{}(%{})", off, m.name(Width::Q)),
        }
    }
}
