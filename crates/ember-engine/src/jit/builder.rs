//! Bytecode-to-IR builders.
//!
//! A builder runs exactly once over one compile unit, in three phases:
//! [`Builder::setup`] shapes the function shell and block graph,
//! [`Builder::generate_body`] translates the operations by abstractly
//! simulating the operand stack, and [`Builder::generate_hard_return`]
//! funnels every recorded exit through a single boxed return pad.
//!
//! The stack simulation is block-local: a value never crosses a control
//! edge (a condition is consumed by its branch, a return value by its
//! return). Bodies that would need cross-edge stack flow, and bodies using
//! untranslated operations (`Send`, `Raise`), are declined — the unit
//! stays interpreted.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::{Literal, MethodBody, Op};
use crate::jit::ir::{BinOp, BlockId, Instr, IrType, Reg, Terminator};
use crate::jit::unit::{CompileUnit, Context, ExitSite};

/// Byte offset of the first declared field in an object of known shape.
/// Word 0 is the header, word 1 the slot-table pointer; fields follow.
const FIELDS_BASE: u32 = 16;

fn field_offset(index: u16) -> u32 {
    FIELDS_BASE + index as u32 * 8
}

/// Translates one compile unit's bytecode body into IR.
///
/// Phases run in order, once each. After `generate_body` returns `false`
/// the unit must be abandoned; no further phase runs.
pub trait Builder {
    /// Prepares the function shell: frame counts, basic blocks, jump map.
    fn setup(&mut self);
    /// Translates the body. `false` means the body uses something the
    /// pipeline does not translate.
    fn generate_body(&mut self) -> bool;
    /// Funnels every recorded exit site through one return pad, so exactly
    /// one epilogue performs the boxed-value handoff to the interpreter.
    fn generate_hard_return(&mut self);
}

/// How receiver field access lowers.
enum FieldAccess {
    /// Receiver shape known: fixed offsets into the object.
    Specialized,
    /// Shape unknown: indirect through the object's slot table.
    Generic,
}

/// Builder for whole method bodies.
///
/// When the unit carries a receiver-class specialization, field access
/// compiles to direct loads at fixed offsets; otherwise it goes through
/// the slot table like any megamorphic site.
pub struct MethodBuilder<'a> {
    inner: Translation<'a>,
}

impl<'a> MethodBuilder<'a> {
    /// A builder over the unit's method body.
    pub fn new(unit: &'a mut CompileUnit, ctx: &'a mut Context) -> Self {
        debug_assert!(!unit.is_block());
        let fields = if unit.specialization().is_some() {
            FieldAccess::Specialized
        } else {
            FieldAccess::Generic
        };
        MethodBuilder {
            inner: Translation::new(unit, ctx, fields),
        }
    }
}

impl Builder for MethodBuilder<'_> {
    fn setup(&mut self) {
        self.inner.setup();
    }

    fn generate_body(&mut self) -> bool {
        self.inner.generate_body()
    }

    fn generate_hard_return(&mut self) {
        self.inner.generate_hard_return();
    }
}

/// Builder for nested block bodies.
///
/// Blocks never specialize on the home receiver's shape, so field access
/// is always generic.
pub struct BlockBuilder<'a> {
    inner: Translation<'a>,
}

impl<'a> BlockBuilder<'a> {
    /// A builder over the unit's block body.
    pub fn new(unit: &'a mut CompileUnit, ctx: &'a mut Context) -> Self {
        debug_assert!(unit.is_block());
        BlockBuilder {
            inner: Translation::new(unit, ctx, FieldAccess::Generic),
        }
    }
}

impl Builder for BlockBuilder<'_> {
    fn setup(&mut self) {
        self.inner.setup();
    }

    fn generate_body(&mut self) -> bool {
        self.inner.generate_body()
    }

    fn generate_hard_return(&mut self) {
        self.inner.generate_hard_return();
    }
}

/// The builder matching the unit's target kind.
pub fn builder_for<'a>(
    unit: &'a mut CompileUnit,
    ctx: &'a mut Context,
) -> Box<dyn Builder + 'a> {
    if unit.is_block() {
        Box::new(BlockBuilder::new(unit, ctx))
    } else {
        Box::new(MethodBuilder::new(unit, ctx))
    }
}

/// Shared translation machinery behind both builders.
struct Translation<'a> {
    unit: &'a mut CompileUnit,
    ctx: &'a mut Context,
    body: Arc<MethodBody>,
    fields: FieldAccess,
    /// Op index of each block leader, ascending; block ids follow this
    /// order, so a backward jump always targets a lower id.
    leaders: Vec<usize>,
    /// Leader op index (or `ops.len()` for the virtual end) to its block.
    block_map: FxHashMap<usize, BlockId>,
    /// Virtual end block for fall-off and jumps past the last op; exits
    /// with an implicit nil.
    end_block: Option<BlockId>,
    supported: bool,
}

impl<'a> Translation<'a> {
    fn new(unit: &'a mut CompileUnit, ctx: &'a mut Context, fields: FieldAccess) -> Self {
        let body = Arc::clone(unit.body());
        Translation {
            unit,
            ctx,
            body,
            fields,
            leaders: Vec::new(),
            block_map: FxHashMap::default(),
            end_block: None,
            supported: true,
        }
    }

    fn setup(&mut self) {
        let body = Arc::clone(&self.body);
        let ops = &body.ops;
        {
            let func = self.unit.function_mut();
            func.param_count = body.param_count;
            func.local_count = body.local_count;
        }

        // Leader scan: op 0, every jump target, and every op following a
        // jump or return starts a block.
        let mut leaders: FxHashSet<usize> = FxHashSet::default();
        if !ops.is_empty() {
            leaders.insert(0);
        }
        let mut jumps_to_end = false;
        for (i, op) in ops.iter().enumerate() {
            match op {
                Op::Jump(t) | Op::JumpIfFalse(t) => {
                    let target = *t as usize;
                    if target > ops.len() {
                        // Jump into nowhere: loader garbage, decline.
                        self.supported = false;
                        return;
                    }
                    if target == ops.len() {
                        jumps_to_end = true;
                    } else {
                        leaders.insert(target);
                    }
                    if i + 1 < ops.len() {
                        leaders.insert(i + 1);
                    }
                }
                Op::Return => {
                    if i + 1 < ops.len() {
                        leaders.insert(i + 1);
                    }
                }
                _ => {}
            }
        }

        let mut order: Vec<usize> = leaders.into_iter().collect();
        order.sort_unstable();
        for &leader in &order {
            let id = self.unit.function_mut().add_block();
            self.block_map.insert(leader, id);
        }
        self.leaders = order;

        let falls_off = !matches!(ops.last(), Some(Op::Return) | Some(Op::Jump(_)));
        if falls_off || jumps_to_end {
            let id = self.unit.function_mut().add_block();
            self.block_map.insert(ops.len(), id);
            self.end_block = Some(id);
        }
    }

    fn generate_body(&mut self) -> bool {
        if !self.supported {
            return false;
        }
        let body = Arc::clone(&self.body);
        let leaders = self.leaders.clone();

        for (pos, &leader) in leaders.iter().enumerate() {
            let block = self.block_map[&leader];
            let end = leaders.get(pos + 1).copied().unwrap_or(body.ops.len());
            let mut stack: Vec<Reg> = Vec::new();
            let mut closed = false;

            for i in leader..end {
                match body.ops[i] {
                    Op::PushInt(value) => {
                        let dest = self.unit.function_mut().alloc_reg(IrType::Int);
                        self.emit(block, Instr::ConstInt { dest, value });
                        stack.push(dest);
                    }
                    Op::PushLiteral(index) => {
                        let Some(&literal) = body.literals.get(index as usize) else {
                            return false;
                        };
                        let reg = self.literal(block, literal);
                        stack.push(reg);
                    }
                    Op::PushLocal(slot) => {
                        if slot >= body.local_count {
                            return false;
                        }
                        let dest = self.unit.function_mut().alloc_reg(IrType::Value);
                        self.emit(block, Instr::LoadLocal { dest, slot });
                        stack.push(dest);
                    }
                    Op::SetLocal(slot) => {
                        if slot >= body.local_count {
                            return false;
                        }
                        let Some(value) = stack.pop() else {
                            return false;
                        };
                        let value = self.boxed(block, value);
                        self.emit(block, Instr::StoreLocal { slot, value });
                    }
                    Op::PushSelf => {
                        let dest = self.load_self(block);
                        stack.push(dest);
                    }
                    Op::PushField(index) => {
                        let object = self.load_self(block);
                        let dest = self.unit.function_mut().alloc_reg(IrType::Value);
                        let instr = match self.fields {
                            FieldAccess::Specialized => Instr::LoadField {
                                dest,
                                object,
                                offset: field_offset(index),
                            },
                            FieldAccess::Generic => Instr::LoadFieldDyn {
                                dest,
                                object,
                                index,
                            },
                        };
                        self.emit(block, instr);
                        stack.push(dest);
                    }
                    Op::SetField(index) => {
                        let Some(value) = stack.pop() else {
                            return false;
                        };
                        let value = self.boxed(block, value);
                        let object = self.load_self(block);
                        let instr = match self.fields {
                            FieldAccess::Specialized => Instr::StoreField {
                                object,
                                offset: field_offset(index),
                                value,
                            },
                            FieldAccess::Generic => Instr::StoreFieldDyn {
                                object,
                                index,
                                value,
                            },
                        };
                        self.emit(block, instr);
                    }
                    Op::Add => {
                        if !self.binary_int(block, &mut stack, IrType::Int, |dest, lhs, rhs| {
                            Instr::IntBin { dest, op: BinOp::Add, lhs, rhs }
                        }) {
                            return false;
                        }
                    }
                    Op::Sub => {
                        if !self.binary_int(block, &mut stack, IrType::Int, |dest, lhs, rhs| {
                            Instr::IntBin { dest, op: BinOp::Sub, lhs, rhs }
                        }) {
                            return false;
                        }
                    }
                    Op::Mul => {
                        if !self.binary_int(block, &mut stack, IrType::Int, |dest, lhs, rhs| {
                            Instr::IntBin { dest, op: BinOp::Mul, lhs, rhs }
                        }) {
                            return false;
                        }
                    }
                    Op::Cmp(op) => {
                        if !self.binary_int(block, &mut stack, IrType::Bool, |dest, lhs, rhs| {
                            Instr::Cmp { dest, op, lhs, rhs }
                        }) {
                            return false;
                        }
                    }
                    Op::Jump(target) => {
                        if !stack.is_empty() {
                            return false;
                        }
                        let dest = self.block_map[&(target as usize)];
                        self.unit.function_mut().block_mut(block).terminator =
                            Terminator::Jump(dest);
                        closed = true;
                    }
                    Op::JumpIfFalse(target) => {
                        let Some(value) = stack.pop() else {
                            return false;
                        };
                        let cond = self.as_condition(block, value);
                        if !stack.is_empty() {
                            return false;
                        }
                        let else_block = self.block_map[&(target as usize)];
                        let then_block = self.block_map[&(i + 1)];
                        self.unit.function_mut().block_mut(block).terminator =
                            Terminator::Branch {
                                cond,
                                then_block,
                                else_block,
                            };
                        closed = true;
                    }
                    Op::Return => {
                        let Some(value) = stack.pop() else {
                            return false;
                        };
                        let boxed = self.boxed(block, value);
                        self.unit.record_exit(block, boxed);
                        // Terminator deferred to the hard return.
                        closed = true;
                    }
                    Op::Send { .. } | Op::Raise => return false,
                }
            }

            if !closed {
                // Fall through to the next block in op order.
                if !stack.is_empty() {
                    return false;
                }
                let next = self.block_map[&end];
                self.unit.function_mut().block_mut(block).terminator = Terminator::Jump(next);
            }
        }

        if let Some(end_id) = self.end_block {
            // Falling off the end of a body yields nil.
            let dest = self.unit.function_mut().alloc_reg(IrType::Value);
            self.emit(end_id, Instr::ConstNil { dest });
            self.unit.record_exit(end_id, dest);
        }
        true
    }

    fn generate_hard_return(&mut self) {
        let exits: Vec<ExitSite> = self.unit.exit_sites().to_vec();
        if exits.is_empty() {
            // The body never returns (it loops); no epilogue to build.
            return;
        }
        let func = self.unit.function_mut();
        let pad = func.add_block();
        let result = func.alloc_reg(IrType::Value);
        for site in &exits {
            func.block_mut(site.block).terminator = Terminator::Jump(pad);
        }
        func.block_mut(pad).instrs.push(Instr::Phi {
            dest: result,
            inputs: exits.iter().map(|site| (site.block, site.value)).collect(),
        });
        func.block_mut(pad).terminator = Terminator::Ret(result);
    }

    // ===== Emission helpers =====

    fn emit(&mut self, block: BlockId, instr: Instr) {
        self.unit
            .function_mut()
            .block_mut(block)
            .instrs
            .push(instr);
    }

    fn load_self(&mut self, block: BlockId) -> Reg {
        let dest = self.unit.function_mut().alloc_reg(IrType::Value);
        self.emit(block, Instr::LoadSelf { dest });
        dest
    }

    fn literal(&mut self, block: BlockId, literal: Literal) -> Reg {
        match literal {
            Literal::Int(value) => {
                let dest = self.unit.function_mut().alloc_reg(IrType::Int);
                self.emit(block, Instr::ConstInt { dest, value });
                dest
            }
            Literal::Bool(value) => {
                let dest = self.unit.function_mut().alloc_reg(IrType::Bool);
                self.emit(block, Instr::ConstBool { dest, value });
                dest
            }
            Literal::Nil => {
                let dest = self.unit.function_mut().alloc_reg(IrType::Value);
                self.emit(block, Instr::ConstNil { dest });
                dest
            }
            Literal::Object(object) => {
                // The embedded reference becomes part of the generated
                // code's runtime data.
                self.ctx.record_constant(object);
                let dest = self.unit.function_mut().alloc_reg(IrType::Value);
                self.emit(block, Instr::ConstObject { dest, object });
                dest
            }
        }
    }

    /// Boxes an unboxed register; boxed registers pass through.
    fn boxed(&mut self, block: BlockId, reg: Reg) -> Reg {
        let from = self.unit.function().reg_type(reg);
        if !from.needs_boxing() {
            return reg;
        }
        let dest = self.unit.function_mut().alloc_reg(IrType::Value);
        self.emit(block, Instr::BoxValue { dest, value: reg, from });
        dest
    }

    /// Unboxed integer view of a register; booleans have none.
    fn as_int(&mut self, block: BlockId, reg: Reg) -> Option<Reg> {
        match self.unit.function().reg_type(reg) {
            IrType::Int => Some(reg),
            IrType::Value => {
                let dest = self.unit.function_mut().alloc_reg(IrType::Int);
                self.emit(block, Instr::UnboxInt { dest, value: reg });
                Some(dest)
            }
            IrType::Bool => None,
        }
    }

    /// Unboxed condition for a branch.
    fn as_condition(&mut self, block: BlockId, reg: Reg) -> Reg {
        match self.unit.function().reg_type(reg) {
            IrType::Bool => reg,
            IrType::Value => {
                let dest = self.unit.function_mut().alloc_reg(IrType::Bool);
                self.emit(block, Instr::IsTruthy { dest, value: reg });
                dest
            }
            IrType::Int => {
                // Integers are always truthy; nothing to test at runtime.
                let dest = self.unit.function_mut().alloc_reg(IrType::Bool);
                self.emit(block, Instr::ConstBool { dest, value: true });
                dest
            }
        }
    }

    fn binary_int(
        &mut self,
        block: BlockId,
        stack: &mut Vec<Reg>,
        result: IrType,
        make: impl FnOnce(Reg, Reg, Reg) -> Instr,
    ) -> bool {
        let Some(rhs) = stack.pop() else {
            return false;
        };
        let Some(lhs) = stack.pop() else {
            return false;
        };
        let Some(lhs) = self.as_int(block, lhs) else {
            return false;
        };
        let Some(rhs) = self.as_int(block, rhs) else {
            return false;
        };
        let dest = self.unit.function_mut().alloc_reg(result);
        self.emit(block, make(dest, lhs, rhs));
        stack.push(dest);
        true
    }
}
