//! Decoded bytecode bodies.
//!
//! The interpreter's loader and decoder live elsewhere; the compile pipeline
//! consumes bodies already decoded into [`Op`] sequences with a literal
//! table. Jump targets are absolute op indices within the body.

use std::fmt;

use crate::memory::ObjectRef;

/// Comparison predicates for [`Op::Cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmpOp::Eq => write!(f, "eq"),
            CmpOp::Ne => write!(f, "ne"),
            CmpOp::Lt => write!(f, "lt"),
            CmpOp::Le => write!(f, "le"),
            CmpOp::Gt => write!(f, "gt"),
            CmpOp::Ge => write!(f, "ge"),
        }
    }
}

/// A constant referenced by [`Op::PushLiteral`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    /// An integer.
    Int(i64),
    /// A boolean.
    Bool(bool),
    /// The nil value.
    Nil,
    /// A heap object (string, symbol, class constant). Embedding one in
    /// generated code makes it part of that code's runtime data.
    Object(ObjectRef),
}

/// One decoded operation. Stack-oriented: operands are popped, results
/// pushed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push an inline integer.
    PushInt(i64),
    /// Push an entry of the body's literal table.
    PushLiteral(u16),
    /// Push the value of a local slot.
    PushLocal(u16),
    /// Pop into a local slot.
    SetLocal(u16),
    /// Push the receiver.
    PushSelf,
    /// Push a field of the receiver, by declaration index.
    PushField(u16),
    /// Pop into a field of the receiver.
    SetField(u16),
    /// Pop two integers, push their sum.
    Add,
    /// Pop two integers, push their difference.
    Sub,
    /// Pop two integers, push their product.
    Mul,
    /// Pop two integers, push the comparison result.
    Cmp(CmpOp),
    /// Unconditional jump to an op index.
    Jump(u16),
    /// Pop a condition; jump to an op index when it is false.
    JumpIfFalse(u16),
    /// Pop the top of stack and return it to the caller.
    Return,
    /// Dynamic message send. The pipeline does not translate sends;
    /// bodies containing one stay interpreted.
    Send {
        /// Literal-table index of the selector symbol.
        selector: u16,
        /// Argument count popped from the stack.
        argc: u8,
    },
    /// Raise an exception. Untranslated, like `Send`.
    Raise,
}

/// A decoded method or block body.
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    /// Decoded operations.
    pub ops: Vec<Op>,
    /// Literal table indexed by [`Op::PushLiteral`].
    pub literals: Vec<Literal>,
    /// Declared parameters; the interpreter seeds local slots
    /// `0..param_count` before entry.
    pub param_count: u16,
    /// Local slots, parameters included.
    pub local_count: u16,
}

impl MethodBody {
    /// A body holding just `ops`, with no literals and no locals.
    pub fn new(ops: Vec<Op>) -> Self {
        MethodBody {
            ops,
            ..MethodBody::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_defaults() {
        let body = MethodBody::new(vec![Op::PushInt(1), Op::Return]);
        assert_eq!(body.ops.len(), 2);
        assert_eq!(body.param_count, 0);
        assert_eq!(body.local_count, 0);
        assert!(body.literals.is_empty());
    }

    #[test]
    fn test_literal_object_carries_ref() {
        let lit = Literal::Object(ObjectRef(0x1000));
        match lit {
            Literal::Object(obj) => assert_eq!(obj, ObjectRef(0x1000)),
            _ => panic!("expected object literal"),
        }
    }
}
