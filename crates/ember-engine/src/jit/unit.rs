//! Per-compilation state: the unit being compiled and its context.
//!
//! A [`CompileUnit`] exists for the duration of one compile and tracks the
//! target, the IR under construction, and a one-way state machine. The
//! [`Context`] rides alongside it carrying the root link and the constant
//! table; with inlining, nested block units share the root's context, which
//! is why the table lives here and not on the unit.

use std::sync::Arc;

use crate::bytecode::MethodBody;
use crate::jit::ir::{BlockId, IrFunction, Reg};
use crate::memory::{ClassId, ObjectRef};
use crate::method::{Block, CompiledMethod};

/// Where a unit stands in the pipeline.
///
/// Transitions run one way; `Unsupported`, `Broken`, and `Active` are
/// terminal. A unit that stops in a terminal failure state never touches
/// the target method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Fresh unit; no IR yet.
    Unbuilt,
    /// The builder produced a complete body.
    BodyBuilt,
    /// The builder declined the body (non-fatal; stays interpreted).
    Unsupported,
    /// Structural cleanup and verification passed.
    Verified,
    /// Verification or lowering failed (internal defect; candidate
    /// dropped).
    Broken,
    /// The backend produced machine code.
    CodeReady,
    /// The code won its specialization slot.
    Active,
}

impl UnitState {
    /// True for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Unsupported | UnitState::Broken | UnitState::Active
        )
    }
}

/// A logical exit discovered during body generation: the block it occurs
/// in and the boxed value it returns. The hard-return pad merges these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSite {
    /// Block the exit occurs in.
    pub block: BlockId,
    /// Boxed value returned from that block.
    pub value: Reg,
}

/// What a unit compiles.
enum CompileTarget {
    Method {
        method: Arc<CompiledMethod>,
    },
    Block {
        block: Arc<Block>,
        enclosing: Arc<CompiledMethod>,
    },
}

/// One method or block moving through the pipeline.
pub struct CompileUnit {
    target: CompileTarget,
    specialization: Option<ClassId>,
    state: UnitState,
    function: IrFunction,
    exit_sites: Vec<ExitSite>,
}

impl CompileUnit {
    /// A unit compiling `method`, optionally specialized to a receiver
    /// class.
    pub fn for_method(method: Arc<CompiledMethod>, specialization: Option<ClassId>) -> Self {
        let function = IrFunction::new(method.name());
        CompileUnit {
            target: CompileTarget::Method { method },
            specialization,
            state: UnitState::Unbuilt,
            function,
            exit_sites: Vec::new(),
        }
    }

    /// A unit compiling `block` inside `enclosing`. Blocks carry no
    /// receiver specialization.
    pub fn for_block(block: Arc<Block>, enclosing: Arc<CompiledMethod>) -> Self {
        let function = IrFunction::new(format!("block in {}", enclosing.name()));
        CompileUnit {
            target: CompileTarget::Block { block, enclosing },
            specialization: None,
            state: UnitState::Unbuilt,
            function,
            exit_sites: Vec::new(),
        }
    }

    /// Current pipeline state.
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// True when the target is a block.
    pub fn is_block(&self) -> bool {
        matches!(self.target, CompileTarget::Block { .. })
    }

    /// Display name, `Point#x` or `block in Array#each`.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Receiver-class specialization, if the request carried one.
    pub fn specialization(&self) -> Option<ClassId> {
        self.specialization
    }

    /// The bytecode body being compiled.
    pub fn body(&self) -> &Arc<MethodBody> {
        match &self.target {
            CompileTarget::Method { method } => method.body(),
            CompileTarget::Block { block, .. } => block.method().body(),
        }
    }

    /// The method whose specialization table receives the finished code.
    /// For blocks that is the block's own method, keyed unspecialized.
    pub fn install_method(&self) -> &Arc<CompiledMethod> {
        match &self.target {
            CompileTarget::Method { method } => method,
            CompileTarget::Block { block, .. } => block.method(),
        }
    }

    /// The lexically enclosing method, for block units.
    pub fn enclosing(&self) -> Option<&Arc<CompiledMethod>> {
        match &self.target {
            CompileTarget::Method { .. } => None,
            CompileTarget::Block { enclosing, .. } => Some(enclosing),
        }
    }

    /// The IR under construction.
    pub fn function(&self) -> &IrFunction {
        &self.function
    }

    /// Mutable access to the IR under construction.
    pub fn function_mut(&mut self) -> &mut IrFunction {
        &mut self.function
    }

    /// Records a logical exit for the hard-return pad to merge.
    pub fn record_exit(&mut self, block: BlockId, value: Reg) {
        self.exit_sites.push(ExitSite { block, value });
    }

    /// Exits recorded so far, in discovery order.
    pub fn exit_sites(&self) -> &[ExitSite] {
        &self.exit_sites
    }

    /// Builder produced a complete body.
    pub fn mark_body_built(&mut self) {
        debug_assert_eq!(self.state, UnitState::Unbuilt);
        self.state = UnitState::BodyBuilt;
    }

    /// Builder declined; terminal, non-fatal.
    pub fn mark_unsupported(&mut self) {
        debug_assert_eq!(self.state, UnitState::Unbuilt);
        self.state = UnitState::Unsupported;
    }

    /// Cleanup and verification passed.
    pub fn mark_verified(&mut self) {
        debug_assert_eq!(self.state, UnitState::BodyBuilt);
        self.state = UnitState::Verified;
    }

    /// Verification or lowering failed; terminal.
    pub fn mark_broken(&mut self) {
        debug_assert!(matches!(
            self.state,
            UnitState::BodyBuilt | UnitState::Verified
        ));
        self.state = UnitState::Broken;
    }

    /// The backend handed back machine code.
    pub fn mark_code_ready(&mut self) {
        debug_assert_eq!(self.state, UnitState::Verified);
        self.state = UnitState::CodeReady;
    }

    /// The install attempt won its slot; terminal.
    pub fn mark_active(&mut self) {
        debug_assert_eq!(self.state, UnitState::CodeReady);
        self.state = UnitState::Active;
    }
}

/// The root of a compilation: the outermost unit nested builders inline
/// into.
pub struct RootInfo {
    method: Arc<CompiledMethod>,
    is_block: bool,
}

impl RootInfo {
    /// The root's method.
    pub fn method(&self) -> &Arc<CompiledMethod> {
        &self.method
    }

    /// True when the root is a block unit.
    pub fn is_block(&self) -> bool {
        self.is_block
    }

    /// The root's display name.
    pub fn name(&self) -> &str {
        self.method.name()
    }
}

/// Shared per-compilation context: root link plus the constant table that
/// accumulates heap objects the emitted code embeds.
#[derive(Default)]
pub struct Context {
    root: Option<RootInfo>,
    constants: ConstantTable,
}

impl Context {
    /// A fresh context with no root.
    pub fn new() -> Self {
        Context::default()
    }

    /// Anchors the context at `unit`; nested units compiled under this
    /// context inline into it.
    pub fn set_root(&mut self, unit: &CompileUnit) {
        self.root = Some(RootInfo {
            method: Arc::clone(unit.install_method()),
            is_block: unit.is_block(),
        });
    }

    /// The root, once set.
    pub fn root(&self) -> Option<&RootInfo> {
        self.root.as_ref()
    }

    /// Records a heap object the emitted code embeds, returning its table
    /// index.
    pub fn record_constant(&mut self, object: ObjectRef) -> usize {
        self.constants.intern(object)
    }

    /// The accumulated constant table.
    pub fn constants(&self) -> &ConstantTable {
        &self.constants
    }

    /// Moves the accumulated references out, for the runtime-data holder.
    pub fn take_constants(&mut self) -> Vec<ObjectRef> {
        self.constants.take()
    }
}

/// Heap objects referenced by emitted code, deduplicated, in first-use
/// order. Transfers wholesale into the holder at install time so the
/// references stay collector-visible for the life of the code.
#[derive(Default)]
pub struct ConstantTable {
    objects: Vec<ObjectRef>,
}

impl ConstantTable {
    /// Adds `object` unless already present; returns its index.
    pub fn intern(&mut self, object: ObjectRef) -> usize {
        if let Some(index) = self.objects.iter().position(|o| *o == object) {
            return index;
        }
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// The interned objects.
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    /// Number of interned objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Moves the objects out, leaving the table empty.
    pub fn take(&mut self) -> Vec<ObjectRef> {
        std::mem::take(&mut self.objects)
    }
}
