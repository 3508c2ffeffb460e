//! The engine facade: configuration plus the pieces every compile shares.

use std::sync::Arc;

use crate::jit::backend::CodegenBackend;
#[cfg(feature = "cranelift")]
use crate::jit::backend::{CodegenError, CraneliftBackend};
use crate::jit::compiler::Compiler;
use crate::jit::opt::Optimizer;
use crate::jit::queue::BackgroundCompiler;
use crate::memory::ResourceManager;

/// Pipeline tunables. Every dump is human-oriented stderr text, off by
/// default.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Dump each function's IR before optimization.
    pub emit_raw_ir: bool,
    /// Dump each function's IR after optimization.
    pub emit_optimized_ir: bool,
    /// Hex-dump emitted machine code.
    pub emit_disassembly: bool,
    /// Timestamped one-liners as units move through the pipeline.
    pub emit_compile_trace: bool,
    /// Keep IR bodies alive after codegen instead of releasing them.
    pub retain_ir: bool,
    /// Background worker threads.
    pub worker_threads: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            emit_raw_ir: false,
            emit_optimized_ir: false,
            emit_disassembly: false,
            emit_compile_trace: false,
            retain_ir: false,
            // Compilation is a background concern; leave most cores to
            // the mutators.
            worker_threads: (num_cpus::get() / 2).clamp(1, 4),
        }
    }
}

/// Owns the backend, pass pipeline, resource manager, and config; hands
/// out per-request [`Compiler`]s wired to them.
pub struct JitEngine {
    backend: Arc<dyn CodegenBackend>,
    optimizer: Arc<Optimizer>,
    resources: Arc<ResourceManager>,
    config: JitConfig,
}

impl JitEngine {
    /// An engine over `backend` with default configuration.
    pub fn new(backend: Arc<dyn CodegenBackend>) -> Self {
        Self::with_config(backend, JitConfig::default())
    }

    /// An engine over `backend` with explicit configuration.
    pub fn with_config(backend: Arc<dyn CodegenBackend>, config: JitConfig) -> Self {
        JitEngine {
            backend,
            optimizer: Arc::new(Optimizer::new()),
            resources: Arc::new(ResourceManager::new()),
            config,
        }
    }

    /// An engine lowering through the host-native backend.
    #[cfg(feature = "cranelift")]
    pub fn native() -> Result<Self, CodegenError> {
        Ok(Self::new(Arc::new(CraneliftBackend::host()?)))
    }

    /// A fresh compiler for one request.
    pub fn compiler(&self) -> Compiler {
        Compiler::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.optimizer),
            Arc::clone(&self.resources),
            self.config.clone(),
        )
    }

    /// The shared resource manager.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// The engine configuration.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The lowering backend.
    pub fn backend(&self) -> &Arc<dyn CodegenBackend> {
        &self.backend
    }

    /// Spawns the background worker pool against this engine.
    pub fn start_background(self: &Arc<Self>) -> BackgroundCompiler {
        BackgroundCompiler::start(Arc::clone(self))
    }
}
