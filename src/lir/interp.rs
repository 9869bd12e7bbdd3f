//! A reference interpreter for the IR.
//!
//! The optimizer's tests run programs before and after folding and compare
//! the results; the interpreter is the ground truth for what an instruction
//! means.  All arithmetic wraps at the instruction's width, matching the
//! folding evaluator.

use derive_more::Display;

use super::*;

/// A runtime error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct RuntimeError(pub String);
impl std::error::Error for RuntimeError {}

// Upper bound on executed instructions, so tests on buggy inputs terminate.
const STEP_BUDGET: usize = 1_000_000;

/// Run a function of the given program on concrete arguments and return the
/// value it returns.
pub fn run(program: &Valid<Program>, func: &FuncId, args: &[i64]) -> Result<i64, RuntimeError> {
    let f = program
        .0
        .functions
        .get(func)
        .ok_or_else(|| RuntimeError(format!("no function named {func}")))?;

    if args.len() != f.params.len() {
        return Err(RuntimeError(format!(
            "{func} takes {} arguments, got {}",
            f.params.len(),
            args.len()
        )));
    }

    // arguments are wrapped to their declared widths on entry.
    let args: Vec<i64> = args
        .iter()
        .zip(&f.params)
        .map(|(&v, &w)| Constant::new(w, v).value())
        .collect();

    let block_index: Map<&BbId, usize> = f.body.iter().enumerate().map(|(i, bb)| (&bb.id, i)).collect();

    let mut env: Map<InstId, i64> = Map::new();
    let mut block = 0;
    let mut steps = 0;

    loop {
        for &id in &f.body[block].insts {
            steps += 1;
            if steps > STEP_BUDGET {
                return Err(RuntimeError(format!("{func} exceeded the step budget")));
            }

            let inst = f
                .get_inst(id)
                .ok_or_else(|| RuntimeError(format!("block lists erased instruction {id}")))?;

            let value_of = |op: &Operand| -> Result<i64, RuntimeError> {
                match op {
                    Operand::Const(c) => Ok(c.value()),
                    Operand::Arg(n) => Ok(args[*n]),
                    Operand::Inst(src) => env
                        .get(src)
                        .copied()
                        .ok_or_else(|| RuntimeError(format!("use of unevaluated instruction {src}"))),
                }
            };

            match &inst.opcode {
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor => {
                    let ty = inst.ty.expect("validated arithmetic has a type");
                    let lhs = value_of(&inst.operands[0])?;
                    let rhs = value_of(&inst.operands[1])?;
                    let raw = match inst.opcode {
                        Opcode::Add => lhs.wrapping_add(rhs),
                        Opcode::Sub => lhs.wrapping_sub(rhs),
                        Opcode::Mul => lhs.wrapping_mul(rhs),
                        Opcode::SDiv => {
                            if rhs == 0 {
                                return Err(RuntimeError("division by zero".to_string()));
                            }
                            lhs.wrapping_div(rhs)
                        }
                        Opcode::And => lhs & rhs,
                        Opcode::Or => lhs | rhs,
                        _ => lhs ^ rhs,
                    };
                    env.insert(id, Constant::new(ty, raw).value());
                }
                Opcode::ICmp(pred) => {
                    let ty = inst.ty.expect("validated icmp has a type");
                    let lhs = value_of(&inst.operands[0])?;
                    let rhs = value_of(&inst.operands[1])?;
                    let (ul, ur) = (ty.unsigned(lhs), ty.unsigned(rhs));
                    let hold = match pred {
                        Predicate::Eq => lhs == rhs,
                        Predicate::Ne => lhs != rhs,
                        Predicate::Sgt => lhs > rhs,
                        Predicate::Sge => lhs >= rhs,
                        Predicate::Slt => lhs < rhs,
                        Predicate::Sle => lhs <= rhs,
                        Predicate::Ugt => ul > ur,
                        Predicate::Uge => ul >= ur,
                        Predicate::Ult => ul < ur,
                        Predicate::Ule => ul <= ur,
                    };
                    // canonical i1 form, so a true compares equal to a folded true.
                    env.insert(id, Constant::new(Width::I1, hold as i64).value());
                }
                Opcode::Br(target) => {
                    block = block_index[target];
                    break;
                }
                Opcode::Cbr(tt, ff) => {
                    let cond = value_of(&inst.operands[0])?;
                    block = block_index[if cond != 0 { tt } else { ff }];
                    break;
                }
                Opcode::Ret => {
                    let value = value_of(&inst.operands[0])?;
                    return Ok(Constant::new(f.ret_ty, value).value());
                }
            }
        }
    }
}
