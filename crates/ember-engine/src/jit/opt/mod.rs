//! Backend-agnostic optimization passes on the IR
//!
//! Each pass implements the `OptPass` trait and transforms an `IrFunction`
//! in place. The default pipeline runs between verification and lowering;
//! every pass must preserve well-formedness, since the verifier does not
//! run again afterwards.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::CmpOp;
use crate::jit::ir::{BinOp, Instr, IrFunction, IrType, Reg};

/// An optimization pass on the IR
pub trait OptPass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, mutating the function in place
    fn run(&self, func: &mut IrFunction);
}

/// Optimizer that runs a sequence of passes
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    /// Create an optimizer with the default pass pipeline
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(BoxElimination),
                Box::new(CopyPropagation),
                Box::new(ConstantFolding),
                Box::new(DeadCodeElimination),
            ],
        }
    }

    /// Create an empty optimizer (no passes)
    pub fn empty() -> Self {
        Optimizer { passes: vec![] }
    }

    /// Add a pass to the pipeline
    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    /// Run all passes in order
    pub fn optimize(&self, func: &mut IrFunction) {
        for pass in &self.passes {
            pass.run(func);
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Pass 1: Box/Unbox Elimination =====

/// Eliminates redundant box/unbox pairs.
///
/// `r1 = box_int r0; r2 = unbox_int r1` leaves the boxed hop dead:
/// the unbox becomes `r2 = move r0`. Truthiness of a boxed bool collapses
/// the same way. Copy propagation and DCE clean up afterwards.
pub struct BoxElimination;

impl OptPass for BoxElimination {
    fn name(&self) -> &str {
        "box-elimination"
    }

    fn run(&self, func: &mut IrFunction) {
        // dest → (unboxed source, source type) for every box
        let mut box_sources: FxHashMap<Reg, (Reg, IrType)> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::BoxValue { dest, value, from } = instr {
                    box_sources.insert(*dest, (*value, *from));
                }
            }
        }
        if box_sources.is_empty() {
            return;
        }

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                let replacement = match instr {
                    Instr::UnboxInt { dest, value } => box_sources
                        .get(value)
                        .filter(|(_, from)| *from == IrType::Int)
                        .map(|(orig, _)| Instr::Move {
                            dest: *dest,
                            src: *orig,
                        }),
                    Instr::IsTruthy { dest, value } => box_sources
                        .get(value)
                        .filter(|(_, from)| *from == IrType::Bool)
                        .map(|(orig, _)| Instr::Move {
                            dest: *dest,
                            src: *orig,
                        }),
                    _ => None,
                };
                if let Some(new_instr) = replacement {
                    *instr = new_instr;
                }
            }
        }
    }
}

// ===== Pass 2: Copy Propagation =====

/// Replaces uses of `move` destinations with their sources.
pub struct CopyPropagation;

impl OptPass for CopyPropagation {
    fn name(&self) -> &str {
        "copy-propagation"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut copies: FxHashMap<Reg, Reg> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::Move { dest, src } = instr {
                    copies.insert(*dest, *src);
                }
            }
        }
        if copies.is_empty() {
            return;
        }

        // Resolve chains: r3 = move r2, r2 = move r1 makes r3 → r1
        let resolved: FxHashMap<Reg, Reg> = copies
            .keys()
            .map(|&reg| {
                let mut current = reg;
                let mut depth = 0;
                while let Some(&src) = copies.get(&current) {
                    current = src;
                    depth += 1;
                    if depth > 100 {
                        break; // cycle guard
                    }
                }
                (reg, current)
            })
            .collect();

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                instr.for_each_use_mut(|reg| {
                    if let Some(&src) = resolved.get(reg) {
                        *reg = src;
                    }
                });
            }
            block.terminator.for_each_use_mut(|reg| {
                if let Some(&src) = resolved.get(reg) {
                    *reg = src;
                }
            });
        }
    }
}

// ===== Pass 3: Constant Folding =====

/// Folds arithmetic and comparisons over constant operands.
///
/// `add const_int(3), const_int(5)` → `const_int 8`
pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut int_consts: FxHashMap<Reg, i64> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::ConstInt { dest, value } = instr {
                    int_consts.insert(*dest, *value);
                }
            }
        }

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                let replacement = match instr {
                    Instr::IntBin { dest, op, lhs, rhs } => {
                        match (int_consts.get(lhs), int_consts.get(rhs)) {
                            (Some(&l), Some(&r)) => {
                                let value = match op {
                                    BinOp::Add => l.wrapping_add(r),
                                    BinOp::Sub => l.wrapping_sub(r),
                                    BinOp::Mul => l.wrapping_mul(r),
                                };
                                int_consts.insert(*dest, value);
                                Some(Instr::ConstInt { dest: *dest, value })
                            }
                            _ => None,
                        }
                    }
                    Instr::Cmp { dest, op, lhs, rhs } => {
                        match (int_consts.get(lhs), int_consts.get(rhs)) {
                            (Some(&l), Some(&r)) => {
                                let value = match op {
                                    CmpOp::Eq => l == r,
                                    CmpOp::Ne => l != r,
                                    CmpOp::Lt => l < r,
                                    CmpOp::Le => l <= r,
                                    CmpOp::Gt => l > r,
                                    CmpOp::Ge => l >= r,
                                };
                                Some(Instr::ConstBool { dest: *dest, value })
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some(new_instr) = replacement {
                    *instr = new_instr;
                }
            }
        }
    }
}

// ===== Pass 4: Dead Code Elimination =====

/// Removes instructions whose destination register is never used
/// (and which have no side effects).
pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead-code-elimination"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut used: FxHashSet<Reg> = FxHashSet::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                instr.for_each_use(|reg| {
                    used.insert(reg);
                });
            }
            block.terminator.for_each_use(|reg| {
                used.insert(reg);
            });
        }

        for block in &mut func.blocks {
            block.instrs.retain(|instr| {
                if instr.has_side_effects() {
                    return true;
                }
                match instr.dest() {
                    Some(dest) => used.contains(&dest),
                    None => true,
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{BlockId, Terminator};

    fn make_func() -> IrFunction {
        let mut func = IrFunction::new("test");
        func.add_block();
        func
    }

    #[test]
    fn test_box_elimination() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Value);
        let r2 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 42 },
            Instr::BoxValue {
                dest: r1,
                value: r0,
                from: IrType::Int,
            },
            Instr::UnboxInt { dest: r2, value: r1 },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        BoxElimination.run(&mut func);

        let instrs = &func.block(BlockId(0)).instrs;
        assert!(matches!(instrs[2], Instr::Move { dest, src } if dest == r2 && src == r0));
    }

    #[test]
    fn test_box_elimination_respects_source_type() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Bool);
        let r1 = func.alloc_reg(IrType::Value);
        let r2 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstBool {
                dest: r0,
                value: true,
            },
            Instr::BoxValue {
                dest: r1,
                value: r0,
                from: IrType::Bool,
            },
            // Unboxing a boxed bool as an int must not be rewritten.
            Instr::UnboxInt { dest: r2, value: r1 },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        BoxElimination.run(&mut func);
        assert!(matches!(
            func.block(BlockId(0)).instrs[2],
            Instr::UnboxInt { .. }
        ));
    }

    #[test]
    fn test_truthiness_of_boxed_bool_collapses() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Bool);
        let r1 = func.alloc_reg(IrType::Value);
        let r2 = func.alloc_reg(IrType::Bool);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstBool {
                dest: r0,
                value: false,
            },
            Instr::BoxValue {
                dest: r1,
                value: r0,
                from: IrType::Bool,
            },
            Instr::IsTruthy { dest: r2, value: r1 },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        BoxElimination.run(&mut func);
        assert!(matches!(
            func.block(BlockId(0)).instrs[2],
            Instr::Move { dest, src } if dest == r2 && src == r0
        ));
    }

    #[test]
    fn test_copy_propagation() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Int);
        let r2 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 42 },
            Instr::Move { dest: r1, src: r0 },
            Instr::IntBin {
                dest: r2,
                op: BinOp::Add,
                lhs: r1,
                rhs: r1,
            },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        CopyPropagation.run(&mut func);

        let instrs = &func.block(BlockId(0)).instrs;
        if let Instr::IntBin { lhs, rhs, .. } = &instrs[2] {
            assert_eq!(*lhs, r0);
            assert_eq!(*rhs, r0);
        } else {
            panic!("expected IntBin");
        }
    }

    #[test]
    fn test_copy_propagation_reaches_terminators() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Value);
        let r1 = func.alloc_reg(IrType::Value);
        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstNil { dest: r0 },
            Instr::Move { dest: r1, src: r0 },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r1);

        CopyPropagation.run(&mut func);
        assert_eq!(func.block(BlockId(0)).terminator, Terminator::Ret(r0));
    }

    #[test]
    fn test_constant_folding_arithmetic() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Int);
        let r2 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 3 },
            Instr::ConstInt { dest: r1, value: 5 },
            Instr::IntBin {
                dest: r2,
                op: BinOp::Add,
                lhs: r0,
                rhs: r1,
            },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        ConstantFolding.run(&mut func);

        assert!(matches!(
            func.block(BlockId(0)).instrs[2],
            Instr::ConstInt { value: 8, .. }
        ));
    }

    #[test]
    fn test_constant_folding_chains_through_results() {
        // (2 * 3) + 4 folds completely in one pass.
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Int);
        let r2 = func.alloc_reg(IrType::Int);
        let r3 = func.alloc_reg(IrType::Int);
        let r4 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 2 },
            Instr::ConstInt { dest: r1, value: 3 },
            Instr::IntBin {
                dest: r2,
                op: BinOp::Mul,
                lhs: r0,
                rhs: r1,
            },
            Instr::ConstInt { dest: r3, value: 4 },
            Instr::IntBin {
                dest: r4,
                op: BinOp::Add,
                lhs: r2,
                rhs: r3,
            },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r4);

        ConstantFolding.run(&mut func);

        assert!(matches!(
            func.block(BlockId(0)).instrs[4],
            Instr::ConstInt { value: 10, .. }
        ));
    }

    #[test]
    fn test_constant_folding_comparisons() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Int);
        let r2 = func.alloc_reg(IrType::Bool);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 3 },
            Instr::ConstInt { dest: r1, value: 5 },
            Instr::Cmp {
                dest: r2,
                op: CmpOp::Lt,
                lhs: r0,
                rhs: r1,
            },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r2);

        ConstantFolding.run(&mut func);

        assert!(matches!(
            func.block(BlockId(0)).instrs[2],
            Instr::ConstBool { value: true, .. }
        ));
    }

    #[test]
    fn test_dead_code_elimination() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Int);
        let r2 = func.alloc_reg(IrType::Int);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 42 },
            Instr::ConstInt { dest: r1, value: 99 },  // dead
            Instr::ConstInt { dest: r2, value: 100 }, // dead
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r0);

        DeadCodeElimination.run(&mut func);

        let instrs = &func.block(BlockId(0)).instrs;
        assert_eq!(instrs.len(), 1);
        assert!(matches!(instrs[0], Instr::ConstInt { value: 42, .. }));
    }

    #[test]
    fn test_dead_code_elimination_keeps_stores() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Value);
        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstNil { dest: r0 },
            Instr::StoreLocal { slot: 0, value: r0 },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r0);

        DeadCodeElimination.run(&mut func);
        assert_eq!(func.block(BlockId(0)).instrs.len(), 2);
    }

    #[test]
    fn test_full_pipeline_collapses_boxed_roundtrip() {
        // load, unbox, *2, box, return: after folding nothing collapses
        // (the local is unknown), but a boxed round-trip of a constant
        // disappears entirely.
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        let r1 = func.alloc_reg(IrType::Value);
        let r2 = func.alloc_reg(IrType::Int);
        let r3 = func.alloc_reg(IrType::Int);
        let r4 = func.alloc_reg(IrType::Int);
        let r5 = func.alloc_reg(IrType::Value);

        func.block_mut(BlockId(0)).instrs = vec![
            Instr::ConstInt { dest: r0, value: 21 },
            Instr::BoxValue {
                dest: r1,
                value: r0,
                from: IrType::Int,
            },
            Instr::UnboxInt { dest: r2, value: r1 },
            Instr::ConstInt { dest: r3, value: 2 },
            Instr::IntBin {
                dest: r4,
                op: BinOp::Mul,
                lhs: r2,
                rhs: r3,
            },
            Instr::BoxValue {
                dest: r5,
                value: r4,
                from: IrType::Int,
            },
        ];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r5);

        let optimizer = Optimizer::new();
        optimizer.optimize(&mut func);

        let instrs = &func.block(BlockId(0)).instrs;
        // The multiply folded to 42 and the box/unbox hop died.
        assert!(instrs
            .iter()
            .any(|i| matches!(i, Instr::ConstInt { value: 42, .. })));
        assert!(!instrs.iter().any(|i| matches!(i, Instr::UnboxInt { .. })));
        // Only the final box survives, feeding the return.
        assert_eq!(
            instrs
                .iter()
                .filter(|i| matches!(i, Instr::BoxValue { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_empty_optimizer_is_identity() {
        let mut func = make_func();
        let r0 = func.alloc_reg(IrType::Int);
        func.block_mut(BlockId(0)).instrs = vec![Instr::ConstInt { dest: r0, value: 1 }];
        func.block_mut(BlockId(0)).terminator = Terminator::Ret(r0);
        let before = func.block(BlockId(0)).instrs.clone();

        Optimizer::empty().optimize(&mut func);
        assert_eq!(func.block(BlockId(0)).instrs, before);
    }
}
