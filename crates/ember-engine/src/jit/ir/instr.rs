//! IR instructions, blocks, and functions.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::bytecode::CmpOp;
use crate::memory::ObjectRef;

use super::types::IrType;

// ============================================================================
// Identifiers
// ============================================================================

/// A virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Identifies a basic block within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Integer arithmetic selector for [`Instr::IntBin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinOp::Add => write!(f, "add"),
            BinOp::Sub => write!(f, "sub"),
            BinOp::Mul => write!(f, "mul"),
        }
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// One IR instruction. Value-producing instructions name their destination
/// register first, matching the textual dump (`r2 = add r0, r1`).
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Unboxed integer constant.
    ConstInt {
        /// Destination.
        dest: Reg,
        /// The constant.
        value: i64,
    },
    /// Unboxed boolean constant.
    ConstBool {
        /// Destination.
        dest: Reg,
        /// The constant.
        value: bool,
    },
    /// The nil value, boxed.
    ConstNil {
        /// Destination.
        dest: Reg,
    },
    /// A heap-object constant embedded in the code. Builders record each
    /// one in the unit's constant table as they emit it.
    ConstObject {
        /// Destination.
        dest: Reg,
        /// The embedded object.
        object: ObjectRef,
    },
    /// Integer arithmetic on unboxed operands.
    IntBin {
        /// Destination.
        dest: Reg,
        /// Operation.
        op: BinOp,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// Integer comparison producing an unboxed bool.
    Cmp {
        /// Destination.
        dest: Reg,
        /// Predicate.
        op: CmpOp,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// Read a local slot from the frame.
    LoadLocal {
        /// Destination.
        dest: Reg,
        /// Frame slot.
        slot: u16,
    },
    /// Write a boxed value into a local slot.
    StoreLocal {
        /// Frame slot.
        slot: u16,
        /// Boxed value to store.
        value: Reg,
    },
    /// The receiver.
    LoadSelf {
        /// Destination.
        dest: Reg,
    },
    /// Receiver field read at a fixed byte offset; emitted only when the
    /// receiver shape is known.
    LoadField {
        /// Destination.
        dest: Reg,
        /// Object holding the field.
        object: Reg,
        /// Byte offset of the field slot.
        offset: u32,
    },
    /// Receiver field write at a fixed byte offset.
    StoreField {
        /// Object holding the field.
        object: Reg,
        /// Byte offset of the field slot.
        offset: u32,
        /// Boxed value to store.
        value: Reg,
    },
    /// Receiver field read through the object's slot table, by declaration
    /// index. The generic path when the receiver shape is unknown.
    LoadFieldDyn {
        /// Destination.
        dest: Reg,
        /// Object holding the field.
        object: Reg,
        /// Field declaration index.
        index: u16,
    },
    /// Receiver field write through the object's slot table.
    StoreFieldDyn {
        /// Object holding the field.
        object: Reg,
        /// Field declaration index.
        index: u16,
        /// Boxed value to store.
        value: Reg,
    },
    /// Box an unboxed value into the uniform representation.
    BoxValue {
        /// Destination (always `value`-typed).
        dest: Reg,
        /// The unboxed source.
        value: Reg,
        /// Source type being boxed.
        from: IrType,
    },
    /// Extract the integer payload of a boxed fixnum.
    UnboxInt {
        /// Destination (always `int`-typed).
        dest: Reg,
        /// The boxed source.
        value: Reg,
    },
    /// Truthiness of a boxed value: everything except false and nil.
    IsTruthy {
        /// Destination (always `bool`-typed).
        dest: Reg,
        /// The boxed source.
        value: Reg,
    },
    /// Register copy.
    Move {
        /// Destination.
        dest: Reg,
        /// Source.
        src: Reg,
    },
    /// Merge of one value per predecessor block.
    Phi {
        /// Destination.
        dest: Reg,
        /// `(predecessor, value)` pairs.
        inputs: Vec<(BlockId, Reg)>,
    },
}

impl Instr {
    /// The register this instruction defines, if any.
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Instr::ConstInt { dest, .. }
            | Instr::ConstBool { dest, .. }
            | Instr::ConstNil { dest }
            | Instr::ConstObject { dest, .. }
            | Instr::IntBin { dest, .. }
            | Instr::Cmp { dest, .. }
            | Instr::LoadLocal { dest, .. }
            | Instr::LoadSelf { dest }
            | Instr::LoadField { dest, .. }
            | Instr::LoadFieldDyn { dest, .. }
            | Instr::BoxValue { dest, .. }
            | Instr::UnboxInt { dest, .. }
            | Instr::IsTruthy { dest, .. }
            | Instr::Move { dest, .. }
            | Instr::Phi { dest, .. } => Some(*dest),
            Instr::StoreLocal { .. }
            | Instr::StoreField { .. }
            | Instr::StoreFieldDyn { .. } => None,
        }
    }

    /// Visits every register this instruction reads.
    pub fn for_each_use(&self, mut f: impl FnMut(Reg)) {
        match self {
            Instr::ConstInt { .. }
            | Instr::ConstBool { .. }
            | Instr::ConstNil { .. }
            | Instr::ConstObject { .. }
            | Instr::LoadLocal { .. }
            | Instr::LoadSelf { .. } => {}
            Instr::IntBin { lhs, rhs, .. } | Instr::Cmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Instr::StoreLocal { value, .. } => f(*value),
            Instr::LoadField { object, .. } | Instr::LoadFieldDyn { object, .. } => f(*object),
            Instr::StoreField { object, value, .. }
            | Instr::StoreFieldDyn { object, value, .. } => {
                f(*object);
                f(*value);
            }
            Instr::BoxValue { value, .. }
            | Instr::UnboxInt { value, .. }
            | Instr::IsTruthy { value, .. } => f(*value),
            Instr::Move { src, .. } => f(*src),
            Instr::Phi { inputs, .. } => {
                for (_, reg) in inputs {
                    f(*reg);
                }
            }
        }
    }

    /// Visits every use site mutably, for register rewriting.
    pub fn for_each_use_mut(&mut self, mut f: impl FnMut(&mut Reg)) {
        match self {
            Instr::ConstInt { .. }
            | Instr::ConstBool { .. }
            | Instr::ConstNil { .. }
            | Instr::ConstObject { .. }
            | Instr::LoadLocal { .. }
            | Instr::LoadSelf { .. } => {}
            Instr::IntBin { lhs, rhs, .. } | Instr::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instr::StoreLocal { value, .. } => f(value),
            Instr::LoadField { object, .. } | Instr::LoadFieldDyn { object, .. } => f(object),
            Instr::StoreField { object, value, .. }
            | Instr::StoreFieldDyn { object, value, .. } => {
                f(object);
                f(value);
            }
            Instr::BoxValue { value, .. }
            | Instr::UnboxInt { value, .. }
            | Instr::IsTruthy { value, .. } => f(value),
            Instr::Move { src, .. } => f(src),
            Instr::Phi { inputs, .. } => {
                for (_, reg) in inputs {
                    f(reg);
                }
            }
        }
    }

    /// True when removing the instruction would change program behavior
    /// even if its result is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Instr::StoreLocal { .. } | Instr::StoreField { .. } | Instr::StoreFieldDyn { .. }
        )
    }
}

// ============================================================================
// Terminators
// ============================================================================

/// Control transfer ending a basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Unconditional transfer.
    Jump(BlockId),
    /// Two-way conditional transfer on an unboxed bool.
    Branch {
        /// Condition register.
        cond: Reg,
        /// Target when the condition holds.
        then_block: BlockId,
        /// Target when it does not.
        else_block: BlockId,
    },
    /// Return a boxed value to the interpreter.
    Ret(Reg),
    /// Placeholder while a block is under construction. Surviving past
    /// structural cleanup in a non-empty block is a defect.
    None,
}

impl Terminator {
    /// Successor blocks, in branch order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Ret(_) | Terminator::None => Vec::new(),
        }
    }

    /// Visits every register the terminator reads.
    pub fn for_each_use(&self, mut f: impl FnMut(Reg)) {
        match self {
            Terminator::Branch { cond, .. } => f(*cond),
            Terminator::Ret(value) => f(*value),
            Terminator::Jump(_) | Terminator::None => {}
        }
    }

    /// Visits every use site mutably.
    pub fn for_each_use_mut(&mut self, mut f: impl FnMut(&mut Reg)) {
        match self {
            Terminator::Branch { cond, .. } => f(cond),
            Terminator::Ret(value) => f(value),
            Terminator::Jump(_) | Terminator::None => {}
        }
    }
}

// ============================================================================
// Blocks and functions
// ============================================================================

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct IrBlock {
    /// This block's id; equals its index in the function.
    pub id: BlockId,
    /// Straight-line body.
    pub instrs: Vec<Instr>,
    /// The closing control transfer.
    pub terminator: Terminator,
    /// Blocks that transfer here; derived, see
    /// [`IrFunction::recompute_predecessors`].
    pub predecessors: Vec<BlockId>,
}

impl IrBlock {
    /// A fresh, unterminated block.
    pub fn new(id: BlockId) -> Self {
        IrBlock {
            id,
            instrs: Vec::new(),
            terminator: Terminator::None,
            predecessors: Vec::new(),
        }
    }

    /// Dead scaffolding: no instructions and never terminated. A block
    /// holding only a terminator is a legitimate jump pad, not empty.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty() && self.terminator == Terminator::None
    }

    /// True once a real terminator is attached.
    pub fn is_terminated(&self) -> bool {
        self.terminator != Terminator::None
    }
}

/// A function under compilation.
#[derive(Debug, Clone)]
pub struct IrFunction {
    /// Human-readable name, `Point#magnitude` style.
    pub name: String,
    /// Declared parameters; the interpreter seeds those local slots.
    pub param_count: u16,
    /// Local slots, parameters included.
    pub local_count: u16,
    /// Basic blocks, indexed by [`BlockId`].
    pub blocks: Vec<IrBlock>,
    /// The entry block.
    pub entry: BlockId,
    /// Types of allocated registers.
    pub reg_types: FxHashMap<Reg, IrType>,
    next_reg: u32,
}

impl IrFunction {
    /// An empty function shell with no blocks.
    pub fn new(name: impl Into<String>) -> Self {
        IrFunction {
            name: name.into(),
            param_count: 0,
            local_count: 0,
            blocks: Vec::new(),
            entry: BlockId(0),
            reg_types: FxHashMap::default(),
            next_reg: 0,
        }
    }

    /// Allocates a fresh register of the given type.
    pub fn alloc_reg(&mut self, ty: IrType) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    /// Appends a fresh block, returning its id.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock::new(id));
        id
    }

    /// The block with the given id.
    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.0 as usize]
    }

    /// Mutable access to the block with the given id.
    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// The type of a register; `Value` when it was never recorded.
    pub fn reg_type(&self, reg: Reg) -> IrType {
        self.reg_types.get(&reg).copied().unwrap_or(IrType::Value)
    }

    /// Registers allocated so far.
    pub fn reg_count(&self) -> u32 {
        self.next_reg
    }

    /// Instructions across all blocks, terminators excluded.
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Rebuilds every block's predecessor list from the terminators.
    pub fn recompute_predecessors(&mut self) {
        for block in &mut self.blocks {
            block.predecessors.clear();
        }
        let mut edges = Vec::new();
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                edges.push((block.id, succ));
            }
        }
        for (from, to) in edges {
            let preds = &mut self.blocks[to.0 as usize].predecessors;
            if !preds.contains(&from) {
                preds.push(from);
            }
        }
    }

    /// Releases the body, keeping only the shell (name and counts). Run
    /// after lowering: the IR is dead weight unless a debug mode retains
    /// it.
    pub fn release_body(&mut self) {
        self.blocks = Vec::new();
        self.reg_types = FxHashMap::default();
    }

    /// True after [`IrFunction::release_body`].
    pub fn is_released(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for IrFunction {
    fn default() -> Self {
        IrFunction::new("")
    }
}
