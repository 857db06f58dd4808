//! Type-size information for opcode variant selection.
//!
//! The back end does not type-check; it only needs to know, for each value
//! flowing through an instruction, which of the four machine operand widths
//! (1/2/4/8 bytes) the opcode variant should use. Anything that is not a
//! scalar basic type or a pointer has no width; asking for one is fatal,
//! since it means the type checker let something through.

use std::fmt;

use crate::common::error::{CodegenError, Result};

/// Machine operand width. The letter names follow the AT&T suffixes used by
/// the sized opcode variants (`b`/`w`/`l`/`q`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    B,
    W,
    L,
    Q,
}

impl Width {
    /// Size of this width in bytes.
    #[inline]
    pub fn size(self) -> u32 {
        match self {
            Width::B => 1,
            Width::W => 2,
            Width::L => 4,
            Width::Q => 8,
        }
    }

    /// The width whose size is `bytes`, if any.
    pub fn from_size(bytes: u32) -> Option<Width> {
        match bytes {
            1 => Some(Width::B),
            2 => Some(Width::W),
            4 => Some(Width::L),
            8 => Some(Width::Q),
            _ => None,
        }
    }

    /// AT&T opcode suffix for this width.
    pub fn suffix(self) -> char {
        match self {
            Width::B => 'b',
            Width::W => 'w',
            Width::L => 'l',
            Width::Q => 'q',
        }
    }

    /// Truncate `val` to this width, sign-extending back to i64.
    /// Used when folding arithmetic so the compile-time result matches what
    /// the sized machine instruction would compute.
    pub fn wrap(self, val: i64) -> i64 {
        match self {
            Width::B => val as i8 as i64,
            Width::W => val as i16 as i64,
            Width::L => val as i32 as i64,
            Width::Q => val,
        }
    }

    /// Zero-extend the low `self` bytes of `val` to i64.
    pub fn zero_extend(self, val: i64) -> i64 {
        match self {
            Width::B => val as u8 as i64,
            Width::W => val as u16 as i64,
            Width::L => val as u32 as i64,
            Width::Q => val,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// The subset of the source type system the back end ever sees.
/// Aggregates appear only as the element/field types behind `LocalAddr`
/// address computations and never flow through sized opcodes directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Char,
    Short,
    Int,
    Long,
    Ptr,
    Array(Box<Type>, usize),
    Struct(String),
}

impl Type {
    /// Select the operand width for a value of this type.
    /// Fatal for void and aggregate types: those must never reach a sized
    /// opcode variant.
    pub fn width(&self) -> Result<Width> {
        match self {
            Type::Char => Ok(Width::B),
            Type::Short => Ok(Width::W),
            Type::Int => Ok(Width::L),
            Type::Long | Type::Ptr => Ok(Width::Q),
            Type::Void | Type::Array(..) | Type::Struct(_) => {
                Err(CodegenError::NonScalarType(self.to_string()))
            }
        }
    }

    /// Storage size in bytes, for the storage-allocation collaborator's
    /// bookkeeping (array/struct sizes come from the symbol table; structs
    /// are opaque here).
    pub fn storage_size(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Char => 1,
            Type::Short => 2,
            Type::Int => 4,
            Type::Long | Type::Ptr => 8,
            Type::Array(elem, n) => elem.storage_size() * (*n as u32),
            Type::Struct(_) => 0,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Char => write!(f, "char"),
            Type::Short => write!(f, "short"),
            Type::Int => write!(f, "int"),
            Type::Long => write!(f, "long"),
            Type::Ptr => write!(f, "pointer"),
            Type::Array(elem, n) => write!(f, "{}[{}]", elem, n),
            Type::Struct(name) => write!(f, "struct {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_widths() {
        assert_eq!(Type::Char.width().unwrap(), Width::B);
        assert_eq!(Type::Short.width().unwrap(), Width::W);
        assert_eq!(Type::Int.width().unwrap(), Width::L);
        assert_eq!(Type::Long.width().unwrap(), Width::Q);
        assert_eq!(Type::Ptr.width().unwrap(), Width::Q);
    }

    #[test]
    fn non_scalar_width_is_fatal() {
        let arr = Type::Array(Box::new(Type::Int), 10);
        assert!(matches!(arr.width(), Err(CodegenError::NonScalarType(_))));
        assert!(matches!(Type::Void.width(), Err(CodegenError::NonScalarType(_))));
    }

    #[test]
    fn width_wrap_matches_machine() {
        assert_eq!(Width::B.wrap(300), 44);
        assert_eq!(Width::W.wrap(-1), -1);
        assert_eq!(Width::L.wrap(1 << 40), 0);
        assert_eq!(Width::B.zero_extend(-1), 255);
        assert_eq!(Width::W.zero_extend(-1), 65535);
    }
}
