//! Register types.

use std::fmt;

/// The type carried by a virtual register.
///
/// `Value` is the interpreter's uniform boxed representation; `Int` and
/// `Bool` are unboxed native forms that exist only between an unbox and the
/// next box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    /// Boxed value in the uniform runtime representation.
    Value,
    /// Unboxed 64-bit integer.
    Int,
    /// Unboxed boolean.
    Bool,
}

impl IrType {
    /// True for unboxed native forms that must be boxed before they cross
    /// back into the interpreter.
    pub fn needs_boxing(&self) -> bool {
        matches!(self, IrType::Int | IrType::Bool)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Value => write!(f, "value"),
            IrType::Int => write!(f, "int"),
            IrType::Bool => write!(f, "bool"),
        }
    }
}
