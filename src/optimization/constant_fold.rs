//! Constant folding & propagation optimization.
//!
//! A peephole transform over one function at a time: any instruction whose
//! two operands are both embedded integer constants is evaluated at compile
//! time, every use of its result is rewritten to the computed constant, and
//! the instruction is erased.  Rewriting a use embeds the constant directly
//! in the consumer's operand list, which can turn the consumer into a
//! candidate too, so the driver re-queues the consumers of every fold and
//! runs until no candidates remain.
//!
//! The components:
//!
//! - [classify] decides whether an instruction is a candidate and extracts
//!   its constant operands.
//! - [evaluate] is the pure compile-time evaluator.
//! - [fold_constants] is the rewrite driver for a single function;
//!   [constant_fold] maps it over a whole program.

use std::collections::VecDeque;

use derive_more::Display;

use super::{Changed, DivZeroPolicy, FoldOptions};
use crate::commons::Valid;
use crate::lir::*;

// SECTION: instruction classifier

/// The binary arithmetic operations the evaluator understands.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ArithOp {
    #[display(fmt = "add")]
    Add,
    #[display(fmt = "sub")]
    Sub,
    #[display(fmt = "mul")]
    Mul,
    #[display(fmt = "sdiv")]
    SDiv,
}

/// The signed comparison predicates the evaluator understands.  This is a
/// closed enum separate from [Predicate]: mapping a predicate into it is an
/// exhaustive match, so a newly added predicate must be handled or
/// explicitly left unsupported.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum SignedPredicate {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "sgt")]
    Sgt,
    #[display(fmt = "sge")]
    Sge,
    #[display(fmt = "slt")]
    Slt,
    #[display(fmt = "sle")]
    Sle,
}

/// The signed reading of a predicate, or `None` for the unsigned ones the
/// pass leaves alone.
pub fn signed_predicate(pred: Predicate) -> Option<SignedPredicate> {
    match pred {
        Predicate::Eq => Some(SignedPredicate::Eq),
        Predicate::Ne => Some(SignedPredicate::Ne),
        Predicate::Sgt => Some(SignedPredicate::Sgt),
        Predicate::Sge => Some(SignedPredicate::Sge),
        Predicate::Slt => Some(SignedPredicate::Slt),
        Predicate::Sle => Some(SignedPredicate::Sle),
        Predicate::Ugt | Predicate::Uge | Predicate::Ult | Predicate::Ule => None,
    }
}

/// The classifier's verdict on an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FoldCategory {
    /// Arithmetic over two constant operands.
    Arithmetic(ArithOp, Constant, Constant),
    /// A signed comparison of two constant operands.
    Comparison(SignedPredicate, Constant, Constant),
    /// Everything else; left untouched.
    NotFoldable,
}

/// Classify an instruction as a folding candidate.
///
/// A candidate has exactly two operands, both embedded constants.  An
/// operand that merely *references* a constant-producing instruction does
/// not count; such chains still collapse because folding the producer
/// rewrites the reference into an embedded constant.
pub fn classify(inst: &Instruction) -> FoldCategory {
    let [Operand::Const(lhs), Operand::Const(rhs)] = inst.operands[..] else {
        return FoldCategory::NotFoldable;
    };

    match inst.opcode {
        Opcode::Add => FoldCategory::Arithmetic(ArithOp::Add, lhs, rhs),
        Opcode::Sub => FoldCategory::Arithmetic(ArithOp::Sub, lhs, rhs),
        Opcode::Mul => FoldCategory::Arithmetic(ArithOp::Mul, lhs, rhs),
        Opcode::SDiv => FoldCategory::Arithmetic(ArithOp::SDiv, lhs, rhs),
        Opcode::ICmp(pred) => match signed_predicate(pred) {
            Some(pred) => FoldCategory::Comparison(pred, lhs, rhs),
            None => FoldCategory::NotFoldable,
        },
        // bitwise ops and terminators are out of scope for this pass.
        Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Br(_)
        | Opcode::Cbr(_, _)
        | Opcode::Ret => FoldCategory::NotFoldable,
    }
}

// SECTION: folding evaluator

/// An error from evaluating an instruction at compile time.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ArithmeticError {
    #[display(fmt = "division by zero")]
    DivideByZero,
}
impl std::error::Error for ArithmeticError {}

/// Evaluate a foldable instruction.
///
/// Arithmetic results take the left operand's width, with two's-complement
/// wraparound on overflow (including `i64::MIN / -1`).  Comparisons produce
/// an `i1`.  Division by a zero constant is reported as an error, never
/// evaluated.
pub fn evaluate(category: FoldCategory) -> Result<Constant, ArithmeticError> {
    match category {
        FoldCategory::Arithmetic(op, lhs, rhs) => {
            let (l, r) = (lhs.value(), rhs.value());
            let raw = match op {
                ArithOp::Add => l.wrapping_add(r),
                ArithOp::Sub => l.wrapping_sub(r),
                ArithOp::Mul => l.wrapping_mul(r),
                ArithOp::SDiv => {
                    if r == 0 {
                        return Err(ArithmeticError::DivideByZero);
                    }
                    l.wrapping_div(r)
                }
            };
            Ok(Constant::new(lhs.width(), raw))
        }
        FoldCategory::Comparison(pred, lhs, rhs) => {
            let (l, r) = (lhs.value(), rhs.value());
            let hold = match pred {
                SignedPredicate::Eq => l == r,
                SignedPredicate::Ne => l != r,
                SignedPredicate::Sgt => l > r,
                SignedPredicate::Sge => l >= r,
                SignedPredicate::Slt => l < r,
                SignedPredicate::Sle => l <= r,
            };
            Ok(Constant::new(Width::I1, hold as i64))
        }
        FoldCategory::NotFoldable => unreachable!("evaluate called on a non-candidate"),
    }
}

// SECTION: rewrite driver

/// Run constant folding & propagation on one function until no instruction
/// with two constant operands remains.
///
/// The worklist is seeded with every instruction in program order.  Folding
/// an instruction re-queues its former users: `replace_all_uses_with` has
/// just embedded the constant into their operand lists, so they may have
/// become candidates, even in a block visited earlier.  Each successful fold
/// erases one instruction, so the loop terminates.
pub fn fold_constants(func: &mut Function, opts: &FoldOptions) -> Result<Changed, ArithmeticError> {
    let mut changed = Changed::No;

    if opts.trace {
        eprintln!("== starting constant folding for {}", func.id);
    }

    let mut worklist: VecDeque<InstId> = func.inst_order().collect();

    while let Some(id) = worklist.pop_front() {
        // the instruction may have been erased since it was queued.
        let Some(inst) = func.get_inst(id) else {
            continue;
        };

        let category = classify(inst);
        if category == FoldCategory::NotFoldable {
            continue;
        }

        if opts.trace {
            eprintln!("both operands are constants: {}", func.inst_string(id));
        }

        match evaluate(category) {
            Ok(result) => {
                if opts.trace {
                    eprintln!("  folded to {} {}", result.width(), result);
                }
                let users = func.replace_all_uses_with(id, result);
                func.erase(id);
                worklist.extend(users);
                changed = Changed::Yes;
            }
            // the error is local to this instruction; folds already
            // performed stay in place under either policy.
            Err(err) => match opts.div_zero {
                DivZeroPolicy::Skip => {
                    if opts.trace {
                        eprintln!("  not folded: {err}");
                    }
                }
                DivZeroPolicy::Abort => {
                    if opts.trace {
                        eprintln!("== aborting constant folding for {}: {err}", func.id);
                    }
                    return Err(err);
                }
            },
        }
    }

    if opts.trace {
        eprintln!("== ending constant folding for {}", func.id);
    }

    Ok(changed)
}

/// The pass over a whole program: fold every function independently.
pub fn constant_fold(
    valid_program: Valid<Program>,
    opts: &FoldOptions,
) -> Result<(Valid<Program>, Changed), ArithmeticError> {
    let mut program = valid_program.0;
    let mut changed = Changed::No;

    for func in program.functions.values_mut() {
        if fold_constants(func, opts)? == Changed::Yes {
            changed = Changed::Yes;
        }
    }

    // folding must never break well-formedness; re-check to catch bugs early.
    let program = program
        .validate()
        .expect("constant folding produced an invalid program");

    Ok((program, changed))
}
