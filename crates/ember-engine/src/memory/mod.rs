//! Managed-memory coordination for the compile pipeline.
//!
//! The collector itself lives outside this crate. What compilation needs
//! from it is narrow: a way to declare GC-independence while backend-internal
//! structures are opaque to heap scans, a registry of generated-code
//! resources whose embedded heap references must stay visible to collection
//! cycles, and process-wide accounting of emitted code bytes.
//! [`ResourceManager`] bundles those three concerns behind one handle that is
//! injected wherever it is needed — nothing in the pipeline reaches for
//! ambient globals.

mod independence;
mod resources;

pub use independence::{GcCoordinator, GcIndependentGuard};
pub use resources::CodeResourceRegistry;

use std::fmt;
use std::sync::Arc;

use crate::jit::code::RuntimeDataHolder;

/// Opaque handle to a heap-allocated object.
///
/// The allocator is out of scope; the pipeline only moves these handles
/// around (literal tables, constant tables, runtime data holders) and never
/// dereferences them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{:x}", self.0)
    }
}

/// Identifies a class shape, for receiver specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// The memory-side services the compile pipeline depends on.
#[derive(Default)]
pub struct ResourceManager {
    gc: GcCoordinator,
    code: CodeResourceRegistry,
}

impl ResourceManager {
    /// A manager with zeroed counters and an empty registry.
    pub fn new() -> Self {
        ResourceManager::default()
    }

    /// Enters GC-independence for the calling thread; the returned guard
    /// exits on drop.
    pub fn gc_independent(&self) -> GcIndependentGuard<'_> {
        self.gc.independent()
    }

    /// The GC coordination counters.
    pub fn gc(&self) -> &GcCoordinator {
        &self.gc
    }

    /// The code-resource registry.
    pub fn code(&self) -> &CodeResourceRegistry {
        &self.code
    }

    /// Adds freshly emitted machine-code bytes to the process-wide total.
    pub fn add_code_bytes(&self, bytes: usize) {
        self.code.add_code_bytes(bytes);
    }

    /// Total machine-code bytes emitted so far.
    pub fn code_bytes(&self) -> usize {
        self.code.code_bytes()
    }

    /// Registers an installed holder so its references join collection
    /// cycles.
    pub fn add_code_resource(&self, holder: Arc<RuntimeDataHolder>) {
        self.code.add(holder);
    }
}
