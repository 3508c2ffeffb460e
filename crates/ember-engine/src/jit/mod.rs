//! Background JIT compilation for the Ember VM
//!
//! This module turns decoded bytecode bodies into verified, optimized
//! native code without ever blocking mutator threads. It includes:
//! - Typed register IR with basic blocks and explicit terminators (`ir`)
//! - Structural cleanup and a well-formedness verifier (`ir::verify`)
//! - Backend-agnostic optimization passes (`opt`)
//! - Backend trait for pluggable lowering, with a stub backend and an
//!   optional Cranelift backend (`backend`)
//! - Bytecode-to-IR builders for methods and nested blocks (`builder`)
//! - The per-request compile orchestrator (`compiler`)
//! - Generated code as a GC-tracked resource (`code`)
//! - Request queue and background worker pool (`queue`)

pub mod backend;
pub mod builder;
pub mod code;
pub mod compiler;
pub mod ir;
pub mod opt;
pub mod queue;
pub mod unit;

mod engine;
pub use compiler::Compiler;
pub use engine::{JitConfig, JitEngine};
