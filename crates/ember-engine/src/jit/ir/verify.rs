//! Structural cleanup and well-formedness verification.
//!
//! Builders leave scaffolding behind: blocks created for jump targets that
//! no surviving path uses. [`sweep_dead_blocks`] removes those before
//! verification. [`verify_function`] then checks the invariants every
//! lowered function must satisfy; any finding is an internal compiler
//! defect, not a user error.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use super::instr::{BlockId, Instr, IrFunction, Reg, Terminator};

/// What structural cleanup found and removed.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Dead scaffolding blocks removed.
    pub removed: usize,
    /// Non-empty blocks with no terminator. Compile-stopping defects.
    pub unterminated: Vec<BlockId>,
    /// Empty blocks other blocks still reference; the verifier rejects
    /// these.
    pub empty_referenced: Vec<BlockId>,
}

impl SweepReport {
    /// True when cleanup found a defect that must stop the compile.
    pub fn is_broken(&self) -> bool {
        !self.unterminated.is_empty()
    }
}

/// A well-formedness violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// A non-empty block does not end in a terminator.
    #[error("block {0} is not terminated")]
    MissingTerminator(BlockId),
    /// An empty block is still referenced (or is the entry).
    #[error("block {0} is empty but referenced")]
    EmptyBlockReferenced(BlockId),
    /// A transfer names a block the function does not contain.
    #[error("block {from} targets nonexistent block {to}")]
    BadTarget {
        /// Referencing block.
        from: BlockId,
        /// Missing target.
        to: BlockId,
    },
    /// A register is read but never defined.
    #[error("register {reg} used in block {block} but never defined")]
    UndefinedRegister {
        /// The undefined register.
        reg: Reg,
        /// Block containing the use.
        block: BlockId,
    },
    /// A local access is out of the declared frame range.
    #[error("local slot {slot} out of range ({count} declared)")]
    BadLocalSlot {
        /// The out-of-range slot.
        slot: u16,
        /// Declared slot count.
        count: u16,
    },
    /// Block list and block ids disagree.
    #[error("block {found} stored at index {index}")]
    MisplacedBlock {
        /// Id found in the slot.
        found: BlockId,
        /// Index it was stored at.
        index: usize,
    },
}

/// Removes unreachable empty blocks (zero predecessors, no instructions,
/// no terminator) and reports defects cleanup cannot repair.
///
/// Removal compacts the block list, so surviving ids are remapped and
/// predecessor lists rebuilt.
pub fn sweep_dead_blocks(func: &mut IrFunction) -> SweepReport {
    func.recompute_predecessors();

    let mut report = SweepReport::default();
    let mut dead: FxHashSet<BlockId> = FxHashSet::default();
    for block in &func.blocks {
        if block.is_empty() {
            if block.predecessors.is_empty() && block.id != func.entry {
                dead.insert(block.id);
            } else {
                report.empty_referenced.push(block.id);
            }
        } else if !block.is_terminated() {
            report.unterminated.push(block.id);
        }
    }
    report.removed = dead.len();
    if dead.is_empty() {
        return report;
    }

    // Compact the list and remap every id that survives. Dead blocks have
    // no terminator, so no edges disappear with them.
    let mut remap: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    let mut next = 0u32;
    for block in &func.blocks {
        if !dead.contains(&block.id) {
            remap.insert(block.id, BlockId(next));
            next += 1;
        }
    }

    let old_blocks = std::mem::take(&mut func.blocks);
    for mut block in old_blocks {
        if dead.contains(&block.id) {
            continue;
        }
        block.id = remap[&block.id];
        match &mut block.terminator {
            Terminator::Jump(target) => *target = remap[target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                *then_block = remap[then_block];
                *else_block = remap[else_block];
            }
            Terminator::Ret(_) | Terminator::None => {}
        }
        for instr in &mut block.instrs {
            if let Instr::Phi { inputs, .. } = instr {
                for (pred, _) in inputs {
                    *pred = remap[pred];
                }
            }
        }
        func.blocks.push(block);
    }
    func.entry = remap[&func.entry];
    func.recompute_predecessors();

    // Report surviving defects under their new ids.
    for id in &mut report.unterminated {
        *id = remap[id];
    }
    for id in &mut report.empty_referenced {
        *id = remap[id];
    }
    report
}

/// Checks the invariants a function must satisfy before lowering.
///
/// Returns every violation found; an empty list means well-formed. An
/// empty block with zero predecessors passes (cleanup removes those), but
/// an empty block anything references does not, and neither does the entry
/// when it is empty.
pub fn verify_function(func: &IrFunction) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    let block_count = func.blocks.len() as u32;

    let mut pred_counts: FxHashMap<BlockId, usize> = FxHashMap::default();
    for block in &func.blocks {
        for succ in block.terminator.successors() {
            *pred_counts.entry(succ).or_insert(0) += 1;
        }
    }

    let mut defs: FxHashSet<Reg> = FxHashSet::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            if let Some(dest) = instr.dest() {
                defs.insert(dest);
            }
        }
    }

    for (index, block) in func.blocks.iter().enumerate() {
        if block.id.0 as usize != index {
            errors.push(VerifyError::MisplacedBlock {
                found: block.id,
                index,
            });
        }

        let referenced = pred_counts.get(&block.id).copied().unwrap_or(0) > 0;
        if block.is_empty() {
            if referenced || block.id == func.entry {
                errors.push(VerifyError::EmptyBlockReferenced(block.id));
            }
            continue;
        }
        if !block.is_terminated() {
            errors.push(VerifyError::MissingTerminator(block.id));
        }

        for succ in block.terminator.successors() {
            if succ.0 >= block_count {
                errors.push(VerifyError::BadTarget {
                    from: block.id,
                    to: succ,
                });
            }
        }

        for instr in &block.instrs {
            if let Instr::Phi { inputs, .. } = instr {
                for (pred, _) in inputs {
                    if pred.0 >= block_count {
                        errors.push(VerifyError::BadTarget {
                            from: block.id,
                            to: *pred,
                        });
                    }
                }
            }
            match instr {
                Instr::LoadLocal { slot, .. } | Instr::StoreLocal { slot, .. } => {
                    if *slot >= func.local_count {
                        errors.push(VerifyError::BadLocalSlot {
                            slot: *slot,
                            count: func.local_count,
                        });
                    }
                }
                _ => {}
            }
            instr.for_each_use(|reg| {
                if !defs.contains(&reg) {
                    errors.push(VerifyError::UndefinedRegister {
                        reg,
                        block: block.id,
                    });
                }
            });
        }
        block.terminator.for_each_use(|reg| {
            if !defs.contains(&reg) {
                errors.push(VerifyError::UndefinedRegister {
                    reg,
                    block: block.id,
                });
            }
        });
    }
    errors
}
