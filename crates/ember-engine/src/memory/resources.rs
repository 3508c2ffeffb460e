//! Code-resource registry and code-size accounting.
//!
//! Generated code is a managed resource: its embedded heap references must
//! stay visible to collection cycles, and the pair (code + references) is
//! reclaimed when the owning method dies. Workers register holders on
//! install; the collector sweeps; both sides serialize on the entry list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::jit::code::RuntimeDataHolder;

/// Registry of installed code resources plus the process-wide code-size
/// counter.
#[derive(Default)]
pub struct CodeResourceRegistry {
    entries: Mutex<Vec<Arc<RuntimeDataHolder>>>,
    code_bytes: AtomicUsize,
}

impl CodeResourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CodeResourceRegistry::default()
    }

    /// Registers a holder, making its heap references visible to collection
    /// cycles.
    pub fn add(&self, holder: Arc<RuntimeDataHolder>) {
        self.entries.lock().push(holder);
    }

    /// Number of registered holders.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every holder the predicate rejects, returning how many were
    /// reclaimed. Collection sweeps call this with a liveness check for the
    /// owning method; an install racing the sweep waits on the entry lock.
    pub fn sweep(&self, mut live: impl FnMut(&RuntimeDataHolder) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|holder| live(holder));
        before - entries.len()
    }

    /// Runs `f` over each registered holder. The collector walks this to
    /// trace embedded references during marking.
    pub fn for_each(&self, mut f: impl FnMut(&RuntimeDataHolder)) {
        for holder in self.entries.lock().iter() {
            f(holder);
        }
    }

    /// Adds emitted machine-code bytes to the process-wide total.
    pub fn add_code_bytes(&self, bytes: usize) {
        self.code_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total machine-code bytes emitted since startup. Never decremented:
    /// this tracks cumulative output, not resident code.
    pub fn code_bytes(&self) -> usize {
        self.code_bytes.load(Ordering::Relaxed)
    }
}
