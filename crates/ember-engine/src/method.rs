//! Compiled methods, nested blocks, and native-code installation.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::bytecode::MethodBody;
use crate::jit::code::RuntimeDataHolder;
use crate::memory::ClassId;

/// An immutable bytecode method plus its installed native specializations.
///
/// Everything except the specialization table is fixed at load time. The
/// table is touched only by the compile pipeline (install) and the
/// interpreter's dispatch (lookup); at most one holder is active per
/// specialization key.
pub struct CompiledMethod {
    name: String,
    file: String,
    start_line: u32,
    body: Arc<MethodBody>,
    specializations: DashMap<Option<ClassId>, Arc<RuntimeDataHolder>>,
}

impl CompiledMethod {
    /// A method with no installed code.
    pub fn new(
        name: impl Into<String>,
        file: impl Into<String>,
        start_line: u32,
        body: MethodBody,
    ) -> Arc<Self> {
        Arc::new(CompiledMethod {
            name: name.into(),
            file: file.into(),
            start_line,
            body: Arc::new(body),
            specializations: DashMap::new(),
        })
    }

    /// Qualified name, `Point#magnitude` style.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defining file.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Line the definition starts on.
    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    /// The decoded body.
    pub fn body(&self) -> &Arc<MethodBody> {
        &self.body
    }

    /// Installs generated code for a specialization unless one is already
    /// active. The first install wins; the outcome carries whichever holder
    /// is live in the slot afterwards.
    pub fn install_code(
        &self,
        specialization: Option<ClassId>,
        holder: Arc<RuntimeDataHolder>,
    ) -> InstallOutcome {
        match self.specializations.entry(specialization) {
            Entry::Occupied(slot) => InstallOutcome::AlreadyActive(Arc::clone(slot.get())),
            Entry::Vacant(slot) => {
                holder.code().mark_active();
                slot.insert(Arc::clone(&holder));
                InstallOutcome::Installed(holder)
            }
        }
    }

    /// The holder active for a specialization, if any.
    pub fn code_for(&self, specialization: Option<ClassId>) -> Option<Arc<RuntimeDataHolder>> {
        self.specializations
            .get(&specialization)
            .map(|slot| Arc::clone(slot.value()))
    }

    /// Native entry address for a specialization, if code is installed.
    pub fn entry_address(&self, specialization: Option<ClassId>) -> Option<*const u8> {
        self.code_for(specialization).map(|holder| holder.address())
    }

    /// Number of installed specializations.
    pub fn specialization_count(&self) -> usize {
        self.specializations.len()
    }

    /// Removes installed code for a specialization, returning the holder.
    /// Invalidation path: the next hotness trip queues a fresh unit.
    pub fn clear_code(&self, specialization: Option<ClassId>) -> Option<Arc<RuntimeDataHolder>> {
        self.specializations
            .remove(&specialization)
            .map(|(_, holder)| holder)
    }
}

/// Result of an install attempt.
pub enum InstallOutcome {
    /// This attempt's candidate went live.
    Installed(Arc<RuntimeDataHolder>),
    /// Another compile got there first; the slot keeps its holder.
    AlreadyActive(Arc<RuntimeDataHolder>),
}

impl InstallOutcome {
    /// The holder now live in the slot, whichever compile produced it.
    pub fn active(&self) -> &Arc<RuntimeDataHolder> {
        match self {
            InstallOutcome::Installed(holder) => holder,
            InstallOutcome::AlreadyActive(holder) => holder,
        }
    }

    /// True when this attempt's candidate was installed.
    pub fn installed(&self) -> bool {
        matches!(self, InstallOutcome::Installed(_))
    }
}

/// A nested block body, compiled only in the context of its enclosing
/// method.
///
/// Blocks carry their own [`CompiledMethod`]; the parent link points at the
/// lexically enclosing body. A block without a parent (a loader defect)
/// must never reach the backend — the compile pipeline rejects it up front.
pub struct Block {
    method: Arc<CompiledMethod>,
    parent: Option<Arc<MethodBody>>,
}

impl Block {
    /// A block nested inside `parent`.
    pub fn new(method: Arc<CompiledMethod>, parent: Arc<MethodBody>) -> Arc<Self> {
        Arc::new(Block {
            method,
            parent: Some(parent),
        })
    }

    /// A block with no parent link. Only malformed input produces these;
    /// the pipeline refuses them.
    pub fn detached(method: Arc<CompiledMethod>) -> Arc<Self> {
        Arc::new(Block {
            method,
            parent: None,
        })
    }

    /// The block's own compiled method.
    pub fn method(&self) -> &Arc<CompiledMethod> {
        &self.method
    }

    /// The lexically enclosing body, when the link is intact.
    pub fn parent(&self) -> Option<&Arc<MethodBody>> {
        self.parent.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::jit::backend::MachineCode;
    use crate::jit::code::{CodeState, GeneratedCode};

    fn make_method(name: &str) -> Arc<CompiledMethod> {
        let body = MethodBody::new(vec![Op::PushInt(1), Op::Return]);
        CompiledMethod::new(name, "kernel/point.em", 12, body)
    }

    fn make_holder(size: usize) -> Arc<RuntimeDataHolder> {
        let code = GeneratedCode::new(MachineCode::from_buffer(vec![0x90; size]));
        Arc::new(RuntimeDataHolder::new(vec![], code))
    }

    #[test]
    fn test_first_install_wins() {
        let method = make_method("Point#x");
        let first = make_holder(8);
        let second = make_holder(8);

        let outcome = method.install_code(None, Arc::clone(&first));
        assert!(outcome.installed());
        assert_eq!(first.code().state(), CodeState::Active);

        let outcome = method.install_code(None, Arc::clone(&second));
        assert!(!outcome.installed());
        // The losing candidate never went active and the slot is unchanged.
        assert_eq!(second.code().state(), CodeState::Ready);
        assert!(Arc::ptr_eq(outcome.active(), &first));
        assert_eq!(method.specialization_count(), 1);
    }

    #[test]
    fn test_specializations_are_independent_slots() {
        let method = make_method("Point#x");
        method.install_code(None, make_holder(8));
        method.install_code(Some(ClassId(3)), make_holder(8));
        assert_eq!(method.specialization_count(), 2);
        assert!(method.entry_address(None).is_some());
        assert!(method.entry_address(Some(ClassId(3))).is_some());
        assert!(method.entry_address(Some(ClassId(4))).is_none());
    }

    #[test]
    fn test_clear_code_empties_slot() {
        let method = make_method("Point#x");
        method.install_code(None, make_holder(8));
        assert!(method.clear_code(None).is_some());
        assert!(method.code_for(None).is_none());
        // A fresh compile can install again.
        assert!(method.install_code(None, make_holder(8)).installed());
    }

    #[test]
    fn test_block_parent_link() {
        let method = make_method("Array#each");
        let parent = Arc::clone(method.body());
        let block = Block::new(make_method("Array#each{}"), parent);
        assert!(block.parent().is_some());

        let detached = Block::detached(make_method("Array#each{}"));
        assert!(detached.parent().is_none());
    }
}
