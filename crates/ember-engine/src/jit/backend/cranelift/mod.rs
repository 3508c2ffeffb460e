//! Cranelift code generation backend
//!
//! Implements `CodegenBackend` using Cranelift to produce real native code
//! from the IR. Supports x86_64 and AArch64 hosts; bytes are emitted
//! position-independent, so they stay valid wherever the artifact lives.

pub mod lowering;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{ir, Context};
use cranelift_frontend::FunctionBuilderContext;
use target_lexicon::Architecture;

use self::lowering::{jit_entry_signature, LoweringContext};
use crate::jit::backend::traits::*;
use crate::jit::ir::IrFunction;

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    isa: Arc<dyn TargetIsa>,
    name: String,
    next_index: AtomicU32,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::Backend(format!("failed to set opt_level: {e}")))?;
        flag_builder
            .set("is_pic", "true")
            .map_err(|e| CodegenError::Backend(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::Backend(format!("no native ISA builder: {e}")))?
            .finish(flags)
            .map_err(|e| CodegenError::Backend(format!("failed to finish ISA: {e}")))?;

        let arch = match isa.triple().architecture {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64(_) => "aarch64",
            other => {
                return Err(CodegenError::Backend(format!(
                    "unsupported architecture {other}"
                )))
            }
        };

        Ok(CraneliftBackend {
            isa,
            name: format!("cranelift-{arch}"),
            next_index: AtomicU32::new(0),
        })
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn lower(&self, func: &IrFunction) -> Result<MachineCode, CodegenError> {
        if func.blocks.is_empty() {
            return Err(CodegenError::Backend(format!(
                "function {} has no body to lower",
                func.name
            )));
        }

        let mut codegen_ctx = Context::new();
        let mut func_builder_ctx = FunctionBuilderContext::new();

        let call_conv = self.isa.default_call_conv();
        codegen_ctx.func.signature = jit_entry_signature(call_conv);
        codegen_ctx.func.name =
            ir::UserFuncName::user(0, self.next_index.fetch_add(1, Ordering::Relaxed));

        // Build Cranelift IR; lower() consumes the builder via finalize()
        {
            let builder = cranelift_frontend::FunctionBuilder::new(
                &mut codegen_ctx.func,
                &mut func_builder_ctx,
            );
            LoweringContext::lower(func, builder);
        }

        let mut ctrl_plane = ControlPlane::default();
        let code = codegen_ctx
            .compile(&*self.isa, &mut ctrl_plane)
            .map_err(|e| CodegenError::Backend(format!("cranelift compilation failed: {e:?}")))?;

        Ok(MachineCode::from_buffer(code.code_buffer().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Instr, IrType, Terminator};

    #[test]
    fn test_backend_creation() {
        let backend = CraneliftBackend::host().unwrap();
        assert!(backend.name().starts_with("cranelift-"));
    }

    #[test]
    fn test_lower_simple_return() {
        let mut func = IrFunction::new("ret42");
        let entry = func.add_block();
        let raw = func.alloc_reg(IrType::Int);
        let boxed = func.alloc_reg(IrType::Value);
        func.block_mut(entry).instrs = vec![
            Instr::ConstInt {
                dest: raw,
                value: 42,
            },
            Instr::BoxValue {
                dest: boxed,
                value: raw,
                from: IrType::Int,
            },
        ];
        func.block_mut(entry).terminator = Terminator::Ret(boxed);

        let backend = CraneliftBackend::host().unwrap();
        let code = backend.lower(&func).unwrap();
        assert!(code.size() > 1);
        assert_eq!(code.address(), code.bytes().as_ptr());
    }

    #[test]
    fn test_lower_branch_and_locals() {
        // entry: r0 = load_local 0, r1 = unbox r0, r2 = const 0,
        //        r3 = cmp gt r1, r2, br r3, b1, b2
        // b1: r4 = box r1, ret r4
        // b2: r5 = const_nil, ret r5
        let mut func = IrFunction::new("positive_or_nil");
        func.param_count = 1;
        func.local_count = 1;
        let entry = func.add_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let loaded = func.alloc_reg(IrType::Value);
        let raw = func.alloc_reg(IrType::Int);
        let zero = func.alloc_reg(IrType::Int);
        let cond = func.alloc_reg(IrType::Bool);
        let boxed = func.alloc_reg(IrType::Value);
        let nil = func.alloc_reg(IrType::Value);

        func.block_mut(entry).instrs = vec![
            Instr::LoadLocal {
                dest: loaded,
                slot: 0,
            },
            Instr::UnboxInt {
                dest: raw,
                value: loaded,
            },
            Instr::ConstInt {
                dest: zero,
                value: 0,
            },
            Instr::Cmp {
                dest: cond,
                op: crate::bytecode::CmpOp::Gt,
                lhs: raw,
                rhs: zero,
            },
        ];
        func.block_mut(entry).terminator = Terminator::Branch {
            cond,
            then_block: b1,
            else_block: b2,
        };
        func.block_mut(b1).instrs = vec![Instr::BoxValue {
            dest: boxed,
            value: raw,
            from: IrType::Int,
        }];
        func.block_mut(b1).terminator = Terminator::Ret(boxed);
        func.block_mut(b2).instrs = vec![Instr::ConstNil { dest: nil }];
        func.block_mut(b2).terminator = Terminator::Ret(nil);
        func.recompute_predecessors();

        let backend = CraneliftBackend::host().unwrap();
        let code = backend.lower(&func).unwrap();
        assert!(!code.bytes().is_empty());
    }

    #[test]
    fn test_lower_released_body_is_an_error() {
        let mut func = IrFunction::new("gone");
        func.add_block();
        func.release_body();
        let backend = CraneliftBackend::host().unwrap();
        assert!(backend.lower(&func).is_err());
    }
}
