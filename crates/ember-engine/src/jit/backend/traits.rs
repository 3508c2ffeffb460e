//! Backend-agnostic code generation traits
//!
//! Defines the `CodegenBackend` trait that pluggable backends implement,
//! plus the machine-code artifact they hand back to the compile pipeline.

use crate::jit::ir::IrFunction;

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The backend rejected or failed to lower the function.
    #[error("backend error: {0}")]
    Backend(String),
    /// The function uses an instruction this backend cannot lower.
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
}

/// Machine code emitted for one function: a stable entry address plus the
/// bytes behind it.
///
/// The bytes live in a fixed heap allocation owned by this value, so the
/// address stays valid for as long as the artifact (and the holder wrapping
/// it) is alive. Backends emit position-independent code; mapping it into
/// executable pages is the embedder's loader concern.
pub struct MachineCode {
    address: *const u8,
    size: usize,
    bytes: Box<[u8]>,
}

impl MachineCode {
    /// Takes ownership of an emitted code buffer.
    pub fn from_buffer(bytes: Vec<u8>) -> Self {
        let bytes = bytes.into_boxed_slice();
        MachineCode {
            address: bytes.as_ptr(),
            size: bytes.len(),
            bytes,
        }
    }

    /// Entry address of the emitted code.
    pub fn address(&self) -> *const u8 {
        self.address
    }

    /// Emitted size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// Safety: MachineCode is Send+Sync because `address` points into the owned
// boxed slice, which is never mutated or reallocated after construction.
unsafe impl Send for MachineCode {}
unsafe impl Sync for MachineCode {}

/// The backend-agnostic code generation trait
///
/// Backends lower a verified, optimized IR function to machine code in one
/// call. Lowering runs on compile workers concurrently with mutators, so
/// implementations must be callable from any thread; a failure is reported
/// to the pipeline, never surfaced to running code.
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Lower an IR function to machine code
    fn lower(&self, func: &IrFunction) -> Result<MachineCode, CodegenError>;
}
