//! Ember VM Engine
//!
//! This crate implements the background just-in-time compiler of the Ember
//! VM:
//! - **Bytecode**: decoded method bodies the compiler consumes (`bytecode` module)
//! - **Methods**: compiled-method units and native-code install slots (`method` module)
//! - **Memory**: GC-independence protocol, code-resource registry, and
//!   code-size accounting (`memory` module)
//! - **JIT**: IR, verifier, optimizer, lowering backends, and the compile
//!   orchestrator (`jit` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ember_engine::jit::queue::BackgroundCompileRequest;
//! use ember_engine::jit::JitEngine;
//!
//! let engine = Arc::new(JitEngine::native()?);
//! let pool = engine.start_background();
//! pool.schedule(BackgroundCompileRequest::method(method, None));
//! // mutators keep interpreting; dispatch upgrades once code installs
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Bytecode module: decoded ops, literals, and method bodies
pub mod bytecode;

/// Method module: compiled methods, blocks, and install slots
pub mod method;

/// Memory module: GC coordination and code-resource bookkeeping
pub mod memory;

/// JIT module: IR, optimizer, backends, and the background compiler
pub mod jit;

// ============================================================================
// Re-exports
// ============================================================================

pub use bytecode::{Literal, MethodBody, Op};
pub use jit::{Compiler, JitConfig, JitEngine};
pub use memory::{ClassId, ObjectRef, ResourceManager};
pub use method::{Block, CompiledMethod};
