//! Stub backend for testing the pipeline without real codegen
//!
//! Encodes the IR into a deterministic byte form instead of lowering it to
//! native instructions. The bytes are never executed; they give tests real
//! sizes and stable content to assert against, and the lower counter lets
//! tests observe exactly how many functions reached the backend.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::traits::*;
use crate::jit::ir::{Instr, IrFunction, Terminator};

const PROLOGUE: u8 = 0x55;
const EPILOGUE: u8 = 0xC3;

/// A backend that re-encodes the IR byte-for-byte instead of generating
/// native code.
#[derive(Default)]
pub struct StubBackend {
    lowered: AtomicUsize,
}

impl StubBackend {
    /// A fresh stub with a zeroed lower counter.
    pub fn new() -> Self {
        StubBackend::default()
    }

    /// Functions lowered through this backend so far.
    pub fn lower_count(&self) -> usize {
        self.lowered.load(Ordering::Relaxed)
    }
}

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn lower(&self, func: &IrFunction) -> Result<MachineCode, CodegenError> {
        self.lowered.fetch_add(1, Ordering::Relaxed);

        let mut enc = Encoder::default();
        enc.byte(PROLOGUE);
        for block in &func.blocks {
            for instr in &block.instrs {
                enc.instr(instr);
            }
            enc.terminator(&block.terminator);
        }
        enc.byte(EPILOGUE);
        Ok(MachineCode::from_buffer(enc.bytes))
    }
}

/// Byte encoder: one tag per instruction, operands in little-endian order.
#[derive(Default)]
struct Encoder {
    bytes: Vec<u8>,
}

impl Encoder {
    fn byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn reg(&mut self, reg: crate::jit::ir::Reg) {
        self.u16(reg.0 as u16);
    }

    fn instr(&mut self, instr: &Instr) {
        match instr {
            Instr::ConstInt { dest, value } => {
                self.byte(0x01);
                self.reg(*dest);
                self.i64(*value);
            }
            Instr::ConstBool { dest, value } => {
                self.byte(0x02);
                self.reg(*dest);
                self.byte(*value as u8);
            }
            Instr::ConstNil { dest } => {
                self.byte(0x03);
                self.reg(*dest);
            }
            Instr::ConstObject { dest, object } => {
                self.byte(0x04);
                self.reg(*dest);
                self.bytes.extend_from_slice(&object.0.to_le_bytes());
            }
            Instr::IntBin { dest, op, lhs, rhs } => {
                self.byte(0x10 + *op as u8);
                self.reg(*dest);
                self.reg(*lhs);
                self.reg(*rhs);
            }
            Instr::Cmp { dest, op, lhs, rhs } => {
                self.byte(0x20 + *op as u8);
                self.reg(*dest);
                self.reg(*lhs);
                self.reg(*rhs);
            }
            Instr::LoadLocal { dest, slot } => {
                self.byte(0x30);
                self.reg(*dest);
                self.u16(*slot);
            }
            Instr::StoreLocal { slot, value } => {
                self.byte(0x31);
                self.u16(*slot);
                self.reg(*value);
            }
            Instr::LoadSelf { dest } => {
                self.byte(0x32);
                self.reg(*dest);
            }
            Instr::LoadField { dest, object, offset } => {
                self.byte(0x33);
                self.reg(*dest);
                self.reg(*object);
                self.u32(*offset);
            }
            Instr::StoreField { object, offset, value } => {
                self.byte(0x34);
                self.reg(*object);
                self.u32(*offset);
                self.reg(*value);
            }
            Instr::LoadFieldDyn { dest, object, index } => {
                self.byte(0x35);
                self.reg(*dest);
                self.reg(*object);
                self.u16(*index);
            }
            Instr::StoreFieldDyn { object, index, value } => {
                self.byte(0x36);
                self.reg(*object);
                self.u16(*index);
                self.reg(*value);
            }
            Instr::BoxValue { dest, value, .. } => {
                self.byte(0x40);
                self.reg(*dest);
                self.reg(*value);
            }
            Instr::UnboxInt { dest, value } => {
                self.byte(0x41);
                self.reg(*dest);
                self.reg(*value);
            }
            Instr::IsTruthy { dest, value } => {
                self.byte(0x42);
                self.reg(*dest);
                self.reg(*value);
            }
            Instr::Move { dest, src } => {
                self.byte(0x43);
                self.reg(*dest);
                self.reg(*src);
            }
            Instr::Phi { dest, inputs } => {
                self.byte(0x50);
                self.reg(*dest);
                self.byte(inputs.len() as u8);
                for (block, reg) in inputs {
                    self.u16(block.0 as u16);
                    self.reg(*reg);
                }
            }
        }
    }

    fn terminator(&mut self, term: &Terminator) {
        match term {
            Terminator::Jump(target) => {
                self.byte(0x60);
                self.u16(target.0 as u16);
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.byte(0x61);
                self.reg(*cond);
                self.u16(then_block.0 as u16);
                self.u16(else_block.0 as u16);
            }
            Terminator::Ret(value) => {
                self.byte(0x62);
                self.reg(*value);
            }
            Terminator::None => self.byte(0x6F),
        }
    }
}
