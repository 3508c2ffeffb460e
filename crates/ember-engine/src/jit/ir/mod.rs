//! JIT intermediate representation.
//!
//! A function is a list of basic blocks over typed virtual registers; each
//! block ends in exactly one terminator. Builders construct functions, the
//! verifier checks them, passes rewrite them, and a backend lowers them.

pub mod display;
pub mod instr;
pub mod types;
pub mod verify;

pub use instr::{BinOp, BlockId, Instr, IrBlock, IrFunction, Reg, Terminator};
pub use types::IrType;
pub use verify::{sweep_dead_blocks, verify_function, SweepReport, VerifyError};
