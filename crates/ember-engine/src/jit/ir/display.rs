//! Textual IR dumps.
//!
//! Human-readable only, for the `emit_raw_ir` / `emit_optimized_ir`
//! diagnostics and defect dumps. Not a stable format.

use std::fmt;

use super::instr::{Instr, IrBlock, IrFunction, Terminator};
use super::types::IrType;

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::ConstInt { dest, value } => write!(f, "{} = const_int {}", dest, value),
            Instr::ConstBool { dest, value } => write!(f, "{} = const_bool {}", dest, value),
            Instr::ConstNil { dest } => write!(f, "{} = const_nil", dest),
            Instr::ConstObject { dest, object } => write!(f, "{} = const_obj {}", dest, object),
            Instr::IntBin { dest, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", dest, op, lhs, rhs)
            }
            Instr::Cmp { dest, op, lhs, rhs } => {
                write!(f, "{} = cmp {} {}, {}", dest, op, lhs, rhs)
            }
            Instr::LoadLocal { dest, slot } => write!(f, "{} = load_local {}", dest, slot),
            Instr::StoreLocal { slot, value } => write!(f, "store_local {}, {}", slot, value),
            Instr::LoadSelf { dest } => write!(f, "{} = load_self", dest),
            Instr::LoadField { dest, object, offset } => {
                write!(f, "{} = load_field {}+{}", dest, object, offset)
            }
            Instr::StoreField { object, offset, value } => {
                write!(f, "store_field {}+{}, {}", object, offset, value)
            }
            Instr::LoadFieldDyn { dest, object, index } => {
                write!(f, "{} = load_field_dyn {}[{}]", dest, object, index)
            }
            Instr::StoreFieldDyn { object, index, value } => {
                write!(f, "store_field_dyn {}[{}], {}", object, index, value)
            }
            Instr::BoxValue { dest, value, from } => match from {
                IrType::Bool => write!(f, "{} = box_bool {}", dest, value),
                _ => write!(f, "{} = box_int {}", dest, value),
            },
            Instr::UnboxInt { dest, value } => write!(f, "{} = unbox_int {}", dest, value),
            Instr::IsTruthy { dest, value } => write!(f, "{} = is_truthy {}", dest, value),
            Instr::Move { dest, src } => write!(f, "{} = move {}", dest, src),
            Instr::Phi { dest, inputs } => {
                write!(f, "{} = phi [", dest)?;
                for (i, (block, reg)) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", block, reg)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jmp {}", target),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "br {}, {}, {}", cond, then_block, else_block),
            Terminator::Ret(value) => write!(f, "ret {}", value),
            Terminator::None => write!(f, "<no terminator>"),
        }
    }
}

impl fmt::Display for IrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {}:", self.id)?;
        if !self.predecessors.is_empty() {
            write!(f, " ; preds:")?;
            for pred in &self.predecessors {
                write!(f, " {}", pred)?;
            }
        }
        writeln!(f)?;
        for instr in &self.instrs {
            writeln!(f, "    {}", instr)?;
        }
        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function @{} (params: {}, locals: {}) {{",
            self.name, self.param_count, self.local_count
        )?;
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        writeln!(f, "}}")
    }
}
