//! IR → Cranelift IR lowering
//!
//! Translates the backend-agnostic IR into Cranelift IR. Registers become
//! Cranelift variables, phi nodes become `def_var` copies in predecessor
//! blocks, and Cranelift's SSA construction merges them when blocks are
//! sealed.
//!
//! Boxed value encoding: fixnums are `(n << 1) | 1`; heap references are
//! 8-byte-aligned pointers (low three bits clear); `nil` is 0, `false` is
//! 2, `true` is 6. Truthiness is "neither nil nor false".

use cranelift_codegen::ir::{self, condcodes::IntCC, types, AbiParam, InstBuilder, MemFlags};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Variable};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::CmpOp;
use crate::jit::ir::{BinOp, BlockId, Instr, IrFunction, IrType, Reg, Terminator};

const NIL_BITS: i64 = 0;
const FALSE_BITS: i64 = 2;

/// Byte offset of the slot-table pointer inside an object header; dynamic
/// field access indirects through it.
const SLOT_TABLE_OFFSET: i32 = 8;

/// State maintained during lowering of a single function
pub struct LoweringContext<'a> {
    /// Map from IR Reg → Cranelift Variable
    reg_vars: FxHashMap<Reg, Variable>,
    /// Map from IR BlockId → Cranelift Block
    block_map: FxHashMap<BlockId, ir::Block>,
    /// The IR function being lowered
    func: &'a IrFunction,
    /// Entry-function parameters (locals pointer, boxed receiver)
    params: FunctionParams,
    /// Phi resolution: per predecessor block, (phi_dest, source_reg) pairs
    /// to def_var before the terminator
    phi_copies: FxHashMap<BlockId, Vec<(Reg, Reg)>>,
}

/// The two parameters of the JIT entry ABI
struct FunctionParams {
    locals_ptr: ir::Value,
    recv: ir::Value,
}

/// Identify loop headers: blocks where at least one predecessor has a
/// higher block index (indicating a back-edge).
fn identify_loop_headers(func: &IrFunction) -> FxHashSet<BlockId> {
    let mut headers = FxHashSet::default();
    for block in &func.blocks {
        for pred in &block.predecessors {
            if pred.0 >= block.id.0 {
                headers.insert(block.id);
            }
        }
    }
    headers
}

/// Build the phi resolution map: for each predecessor block, collect the
/// (phi_dest, source_reg) pairs that need def_var before the terminator.
fn build_phi_copies(func: &IrFunction) -> FxHashMap<BlockId, Vec<(Reg, Reg)>> {
    let mut copies: FxHashMap<BlockId, Vec<(Reg, Reg)>> = FxHashMap::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Instr::Phi { dest, inputs } = instr {
                for (src_block, src_reg) in inputs {
                    copies.entry(*src_block).or_default().push((*dest, *src_reg));
                }
            }
        }
    }
    copies
}

impl<'a> LoweringContext<'a> {
    /// Lower an entire IR function into Cranelift IR. Takes ownership of
    /// the FunctionBuilder since finalize() consumes it.
    pub fn lower(func: &'a IrFunction, mut builder: FunctionBuilder<'_>) {
        let mut block_map = FxHashMap::default();
        for ir_block in &func.blocks {
            let cl_block = builder.create_block();
            block_map.insert(ir_block.id, cl_block);
        }

        let loop_headers = identify_loop_headers(func);
        let phi_copies = build_phi_copies(func);

        // Entry block carries the function parameters
        let entry_block = block_map[&func.entry];
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        if !loop_headers.contains(&func.entry) {
            builder.seal_block(entry_block);
        }

        let params = FunctionParams {
            locals_ptr: builder.block_params(entry_block)[0],
            recv: builder.block_params(entry_block)[1],
        };

        let mut ctx = LoweringContext {
            reg_vars: FxHashMap::default(),
            block_map,
            func,
            params,
            phi_copies,
        };

        ctx.declare_all_regs(&mut builder);

        let block_ids: Vec<_> = func.blocks.iter().map(|b| b.id).collect();
        for (idx, block_id) in block_ids.iter().enumerate() {
            let cl_block = ctx.block_map[block_id];
            if idx > 0 {
                builder.switch_to_block(cl_block);
                // Seal immediately unless it's a loop header (defer those)
                if !loop_headers.contains(block_id) {
                    builder.seal_block(cl_block);
                }
            }
            ctx.lower_block(*block_id, &mut builder);
        }

        // Seal deferred loop headers now that all predecessors are known
        for header_id in &loop_headers {
            let cl_block = ctx.block_map[header_id];
            builder.seal_block(cl_block);
        }

        builder.finalize();
    }

    /// Declare every IR register as a Cranelift variable
    fn declare_all_regs(&mut self, builder: &mut FunctionBuilder<'_>) {
        for reg_idx in 0..self.func.reg_count() {
            let reg = Reg(reg_idx);
            let ty = match self.func.reg_type(reg) {
                IrType::Bool => types::I8,
                IrType::Int | IrType::Value => types::I64,
            };
            let var = builder.declare_var(ty);
            self.reg_vars.insert(reg, var);
        }
    }

    fn var_for(&self, reg: Reg) -> Variable {
        self.reg_vars[&reg]
    }

    /// Read an IR register as a Cranelift value
    fn use_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> ir::Value {
        builder.use_var(self.var_for(reg))
    }

    /// Write a Cranelift value to an IR register
    fn def_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg, val: ir::Value) {
        builder.def_var(self.var_for(reg), val);
    }

    /// Lower all instructions and the terminator for a single block
    fn lower_block(&mut self, block_id: BlockId, builder: &mut FunctionBuilder<'_>) {
        let block = self.func.block(block_id);
        let instrs = block.instrs.clone();
        let terminator = block.terminator.clone();

        for instr in &instrs {
            self.lower_instr(instr, builder);
        }

        // Phi resolution: for each phi in a successor sourcing from this
        // block, def_var the phi's dest with this block's source value.
        if let Some(copies) = self.phi_copies.get(&block_id) {
            let copies = copies.clone();
            for (phi_dest, src_reg) in copies {
                let val = self.use_reg(builder, src_reg);
                self.def_reg(builder, phi_dest, val);
            }
        }

        self.lower_terminator(&terminator, builder);
    }

    fn lower_instr(&mut self, instr: &Instr, builder: &mut FunctionBuilder<'_>) {
        match instr {
            Instr::ConstInt { dest, value } => {
                let val = builder.ins().iconst(types::I64, *value);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstBool { dest, value } => {
                let val = builder.ins().iconst(types::I8, *value as i64);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstNil { dest } => {
                let val = builder.ins().iconst(types::I64, NIL_BITS);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstObject { dest, object } => {
                let val = builder.ins().iconst(types::I64, object.0 as i64);
                self.def_reg(builder, *dest, val);
            }
            Instr::IntBin { dest, op, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let result = match op {
                    BinOp::Add => builder.ins().iadd(l, r),
                    BinOp::Sub => builder.ins().isub(l, r),
                    BinOp::Mul => builder.ins().imul(l, r),
                };
                self.def_reg(builder, *dest, result);
            }
            Instr::Cmp { dest, op, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let cc = match op {
                    CmpOp::Eq => IntCC::Equal,
                    CmpOp::Ne => IntCC::NotEqual,
                    CmpOp::Lt => IntCC::SignedLessThan,
                    CmpOp::Le => IntCC::SignedLessThanOrEqual,
                    CmpOp::Gt => IntCC::SignedGreaterThan,
                    CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
                };
                let result = builder.ins().icmp(cc, l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::LoadLocal { dest, slot } => {
                let offset = (*slot as i32) * 8;
                let val = builder.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.params.locals_ptr,
                    offset,
                );
                self.def_reg(builder, *dest, val);
            }
            Instr::StoreLocal { slot, value } => {
                let v = self.use_reg(builder, *value);
                let offset = (*slot as i32) * 8;
                builder
                    .ins()
                    .store(MemFlags::trusted(), v, self.params.locals_ptr, offset);
            }
            Instr::LoadSelf { dest } => {
                let recv = self.params.recv;
                self.def_reg(builder, *dest, recv);
            }
            Instr::LoadField {
                dest,
                object,
                offset,
            } => {
                let obj = self.use_reg(builder, *object);
                let val =
                    builder
                        .ins()
                        .load(types::I64, MemFlags::trusted(), obj, *offset as i32);
                self.def_reg(builder, *dest, val);
            }
            Instr::StoreField {
                object,
                offset,
                value,
            } => {
                let obj = self.use_reg(builder, *object);
                let v = self.use_reg(builder, *value);
                builder
                    .ins()
                    .store(MemFlags::trusted(), v, obj, *offset as i32);
            }
            Instr::LoadFieldDyn {
                dest,
                object,
                index,
            } => {
                let obj = self.use_reg(builder, *object);
                let slots =
                    builder
                        .ins()
                        .load(types::I64, MemFlags::trusted(), obj, SLOT_TABLE_OFFSET);
                let val = builder.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    slots,
                    (*index as i32) * 8,
                );
                self.def_reg(builder, *dest, val);
            }
            Instr::StoreFieldDyn {
                object,
                index,
                value,
            } => {
                let obj = self.use_reg(builder, *object);
                let v = self.use_reg(builder, *value);
                let slots =
                    builder
                        .ins()
                        .load(types::I64, MemFlags::trusted(), obj, SLOT_TABLE_OFFSET);
                builder
                    .ins()
                    .store(MemFlags::trusted(), v, slots, (*index as i32) * 8);
            }
            Instr::BoxValue { dest, value, from } => {
                let v = self.use_reg(builder, *value);
                let boxed = match from {
                    // (b << 2) | 2 maps false → 2, true → 6
                    IrType::Bool => {
                        let wide = builder.ins().uextend(types::I64, v);
                        let shifted = builder.ins().ishl_imm(wide, 2);
                        builder.ins().bor_imm(shifted, 2)
                    }
                    // (n << 1) | 1
                    _ => {
                        let shifted = builder.ins().ishl_imm(v, 1);
                        builder.ins().bor_imm(shifted, 1)
                    }
                };
                self.def_reg(builder, *dest, boxed);
            }
            Instr::UnboxInt { dest, value } => {
                let v = self.use_reg(builder, *value);
                let raw = builder.ins().sshr_imm(v, 1);
                self.def_reg(builder, *dest, raw);
            }
            Instr::IsTruthy { dest, value } => {
                let v = self.use_reg(builder, *value);
                let not_nil = builder.ins().icmp_imm(IntCC::NotEqual, v, NIL_BITS);
                let not_false = builder.ins().icmp_imm(IntCC::NotEqual, v, FALSE_BITS);
                let truthy = builder.ins().band(not_nil, not_false);
                self.def_reg(builder, *dest, truthy);
            }
            Instr::Move { dest, src } => {
                let v = self.use_reg(builder, *src);
                self.def_reg(builder, *dest, v);
            }
            Instr::Phi { .. } => {
                // Resolved by def_var copies in predecessor blocks (see
                // lower_block); Cranelift merges the values when the block
                // is sealed.
            }
        }
    }

    fn lower_terminator(&self, term: &Terminator, builder: &mut FunctionBuilder<'_>) {
        match term {
            Terminator::Jump(target) => {
                let cl_target = self.block_map[target];
                builder.ins().jump(cl_target, &[]);
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let cond_val = self.use_reg(builder, *cond);
                let then_cl = self.block_map[then_block];
                let else_cl = self.block_map[else_block];
                builder.ins().brif(cond_val, then_cl, &[], else_cl, &[]);
            }
            Terminator::Ret(reg) => {
                let val = self.use_reg(builder, *reg);
                // The epilogue hands back a boxed value; box stragglers
                let ret_val = match self.func.reg_type(*reg) {
                    IrType::Int => {
                        let shifted = builder.ins().ishl_imm(val, 1);
                        builder.ins().bor_imm(shifted, 1)
                    }
                    IrType::Bool => {
                        let wide = builder.ins().uextend(types::I64, val);
                        let shifted = builder.ins().ishl_imm(wide, 2);
                        builder.ins().bor_imm(shifted, 2)
                    }
                    IrType::Value => val,
                };
                builder.ins().return_(&[ret_val]);
            }
            Terminator::None => {
                // Verification rejects these before lowering
                builder.ins().trap(ir::TrapCode::user(1).unwrap());
            }
        }
    }
}

/// Build the Cranelift signature for JIT entry functions.
///
/// ABI: `extern "C" fn(locals: *mut u64, recv: u64) -> u64`; locals is the
/// frame's slot array, recv the boxed receiver, and the result a boxed
/// value.
pub fn jit_entry_signature(call_conv: CallConv) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // locals_ptr
    sig.params.push(AbiParam::new(types::I64)); // recv
    sig.returns.push(AbiParam::new(types::I64)); // boxed result
    sig
}
