//! Generated-code artifacts and their GC-visible reference holders.
//!
//! A finished compile produces a [`GeneratedCode`] (the backend's machine
//! code plus an activation tag) wrapped in a [`RuntimeDataHolder`] together
//! with every heap reference the code embeds. The holder is the unit of
//! ownership from install onward: the method's specialization table and the
//! code-resource registry both hold it, and the collector traces its
//! references for as long as either does.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::jit::backend::MachineCode;
use crate::memory::ObjectRef;

/// Lifecycle tag of a generated-code artifact.
///
/// Code is `Ready` from the moment the backend hands it over and becomes
/// `Active` only if its install attempt wins the specialization slot. A
/// losing candidate stays `Ready` until its holder is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeState {
    /// Emitted but not installed; mutators cannot reach it.
    Ready,
    /// Installed in a specialization slot; mutators may be executing it.
    Active,
}

const STATE_READY: u8 = 0;
const STATE_ACTIVE: u8 = 1;

/// Machine code produced by one compile, plus its activation tag.
pub struct GeneratedCode {
    machine: MachineCode,
    state: AtomicU8,
}

impl GeneratedCode {
    /// Wraps freshly lowered machine code. Starts `Ready`.
    pub fn new(machine: MachineCode) -> Self {
        GeneratedCode {
            machine,
            state: AtomicU8::new(STATE_READY),
        }
    }

    /// Native entry address.
    pub fn address(&self) -> *const u8 {
        self.machine.address()
    }

    /// Emitted size in bytes.
    pub fn size(&self) -> usize {
        self.machine.size()
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        self.machine.bytes()
    }

    /// Current lifecycle tag.
    pub fn state(&self) -> CodeState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => CodeState::Active,
            _ => CodeState::Ready,
        }
    }

    /// Flips the tag to `Active`. Called exactly once, by the install that
    /// wins the specialization slot, before the holder becomes visible to
    /// dispatch.
    pub fn mark_active(&self) {
        self.state.store(STATE_ACTIVE, Ordering::Release);
    }

    /// Hex rendering of the emitted bytes, sixteen per line with offsets.
    pub fn hex_dump(&self) -> String {
        let bytes = self.bytes();
        let mut out = String::with_capacity(bytes.len() * 3 + bytes.len() / 4);
        for (line, chunk) in bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:06x} ", line * 16);
            for byte in chunk {
                let _ = write!(out, " {byte:02x}");
            }
            out.push('\n');
        }
        out
    }
}

/// Generated code bundled with the heap references it embeds.
///
/// Moving the references in here is what keeps them alive: once the compile
/// transfers its constant table, the registry and the specialization slot
/// are the only roots those objects need.
pub struct RuntimeDataHolder {
    references: Vec<ObjectRef>,
    code: GeneratedCode,
}

impl RuntimeDataHolder {
    /// Bundles `code` with the references it embeds.
    pub fn new(references: Vec<ObjectRef>, code: GeneratedCode) -> Self {
        RuntimeDataHolder { references, code }
    }

    /// Heap references embedded in the code. The collector traces these
    /// while the holder is registered.
    pub fn references(&self) -> &[ObjectRef] {
        &self.references
    }

    /// The generated code itself.
    pub fn code(&self) -> &GeneratedCode {
        &self.code
    }

    /// Native entry address.
    pub fn address(&self) -> *const u8 {
        self.code.address()
    }

    /// Emitted size in bytes.
    pub fn size(&self) -> usize {
        self.code.size()
    }
}
