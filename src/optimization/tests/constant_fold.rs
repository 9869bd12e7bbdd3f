use arbitrary::Unstructured;

use super::super::constant_fold::*;
use super::*;
use crate::lir::*;

// SECTION: classifier

fn add_inst(operands: Vec<Operand>) -> Instruction {
    Instruction {
        opcode: Opcode::Add,
        ty: Some(Width::I32),
        operands,
        result: Some("a".to_string()),
    }
}

fn c32(v: i64) -> Operand {
    Operand::Const(Constant::new(Width::I32, v))
}

#[test]
fn classify_needs_two_constant_operands() {
    assert!(matches!(
        classify(&add_inst(vec![c32(3), c32(4)])),
        FoldCategory::Arithmetic(ArithOp::Add, _, _)
    ));

    // a reference is not a constant, even if it resolves to one.
    assert_eq!(
        classify(&add_inst(vec![c32(3), Operand::Inst(0)])),
        FoldCategory::NotFoldable
    );
    assert_eq!(
        classify(&add_inst(vec![Operand::Arg(0), c32(3)])),
        FoldCategory::NotFoldable
    );
}

#[test]
fn classify_recognizes_signed_comparisons_only() {
    let icmp = |pred| Instruction {
        opcode: Opcode::ICmp(pred),
        ty: Some(Width::I32),
        operands: vec![c32(5), c32(3)],
        result: Some("c".to_string()),
    };

    assert!(matches!(
        classify(&icmp(Predicate::Sgt)),
        FoldCategory::Comparison(SignedPredicate::Sgt, _, _)
    ));
    assert_eq!(classify(&icmp(Predicate::Ult)), FoldCategory::NotFoldable);
    assert_eq!(classify(&icmp(Predicate::Uge)), FoldCategory::NotFoldable);
}

#[test]
fn classify_ignores_unsupported_opcodes() {
    let and = Instruction {
        opcode: Opcode::And,
        ty: Some(Width::I32),
        operands: vec![c32(5), c32(3)],
        result: Some("a".to_string()),
    };
    assert_eq!(classify(&and), FoldCategory::NotFoldable);
}

// SECTION: evaluator

fn eval_arith(op: ArithOp, l: i64, r: i64) -> Result<Constant, ArithmeticError> {
    evaluate(FoldCategory::Arithmetic(
        op,
        Constant::new(Width::I32, l),
        Constant::new(Width::I32, r),
    ))
}

#[test]
fn evaluate_arithmetic() {
    assert_eq!(eval_arith(ArithOp::Add, 3, 4), Ok(Constant::new(Width::I32, 7)));
    assert_eq!(eval_arith(ArithOp::Sub, 3, 4), Ok(Constant::new(Width::I32, -1)));
    assert_eq!(eval_arith(ArithOp::Mul, 3, 4), Ok(Constant::new(Width::I32, 12)));
    assert_eq!(eval_arith(ArithOp::SDiv, 7, 2), Ok(Constant::new(Width::I32, 3)));
    assert_eq!(eval_arith(ArithOp::SDiv, -7, 2), Ok(Constant::new(Width::I32, -3)));
}

#[test]
fn evaluate_wraps_on_overflow() {
    let lhs = Constant::new(Width::I8, 127);
    let rhs = Constant::new(Width::I8, 1);
    assert_eq!(
        evaluate(FoldCategory::Arithmetic(ArithOp::Add, lhs, rhs)),
        Ok(Constant::new(Width::I8, -128))
    );

    // i64::MIN / -1 wraps instead of trapping.
    let min = Constant::new(Width::I64, i64::MIN);
    let neg1 = Constant::new(Width::I64, -1);
    assert_eq!(
        evaluate(FoldCategory::Arithmetic(ArithOp::SDiv, min, neg1)),
        Ok(Constant::new(Width::I64, i64::MIN))
    );
}

#[test]
fn evaluate_reports_division_by_zero() {
    assert_eq!(eval_arith(ArithOp::SDiv, 7, 0), Err(ArithmeticError::DivideByZero));
}

#[test]
fn evaluate_comparisons() {
    let cmp = |pred, l, r| {
        evaluate(FoldCategory::Comparison(
            pred,
            Constant::new(Width::I32, l),
            Constant::new(Width::I32, r),
        ))
        .unwrap()
        .is_true()
    };

    assert!(cmp(SignedPredicate::Sgt, 5, 3));
    assert!(!cmp(SignedPredicate::Sgt, 3, 5));
    assert!(cmp(SignedPredicate::Sge, 3, 3));
    assert!(cmp(SignedPredicate::Slt, -5, 3));
    assert!(cmp(SignedPredicate::Sle, -5, -5));
    assert!(cmp(SignedPredicate::Eq, 7, 7));
    assert!(cmp(SignedPredicate::Ne, 7, 8));

    let result = evaluate(FoldCategory::Comparison(
        SignedPredicate::Sgt,
        Constant::new(Width::I32, 5),
        Constant::new(Width::I32, 3),
    ))
    .unwrap();
    assert_eq!(result.width(), Width::I1);
}

// SECTION: rewrite driver

#[test]
fn folds_a_single_add() {
    optimizes_to(
        r#"
        fn test() -> i32 {
        entry:
          %a = add i32 3, 4
          ret i32 %a
        }
        "#,
        r#"
        fn test() -> i32 {
        entry:
          ret i32 7
        }
        "#,
    );
}

#[test]
fn folds_chains_through_replaced_uses() {
    // %b is not a candidate up front: its lhs is a reference.  Folding %a
    // embeds 5 into %b's operand list, which makes %b a candidate.
    optimizes_to(
        r#"
        fn test() -> i32 {
        entry:
          %a = add i32 2, 3
          %b = mul i32 %a, 10
          ret i32 %b
        }
        "#,
        r#"
        fn test() -> i32 {
        entry:
          ret i32 50
        }
        "#,
    );
}

#[test]
fn folds_comparisons_to_i1() {
    optimizes_to(
        r#"
        fn test() -> i32 {
        entry:
          %c = icmp sgt i32 5, 3
          cbr i1 %c, yes, no
        yes:
          ret i32 1
        no:
          ret i32 0
        }
        "#,
        r#"
        fn test() -> i32 {
        entry:
          cbr i1 1, yes, no
        yes:
          ret i32 1
        no:
          ret i32 0
        }
        "#,
    );
}

#[test]
fn folded_conditions_print_as_one() {
    let input = valid(
        r#"
        fn test() -> i32 {
        entry:
          %c = icmp eq i32 2, 2
          cbr i1 %c, yes, no
        yes:
          ret i32 1
        no:
          ret i32 0
        }
        "#,
    );

    let (actual, _) = constant_fold(input, &FoldOptions::default()).unwrap();

    assert!(actual.0.to_string().contains("cbr i1 1, yes, no"));
}

#[test]
fn folds_across_blocks() {
    optimizes_to(
        r#"
        fn test() -> i32 {
        entry:
          %a = add i32 2, 3
          br next
        next:
          %b = mul i32 %a, 10
          ret i32 %b
        }
        "#,
        r#"
        fn test() -> i32 {
        entry:
          br next
        next:
          ret i32 50
        }
        "#,
    );
}

#[test]
fn replaces_every_use_site() {
    optimizes_to(
        r#"
        fn test(i32) -> i32 {
        entry:
          %a = add i32 1, 1
          %b = add i32 %a, %arg0
          %c = mul i32 %a, %arg0
          %d = add i32 %b, %c
          ret i32 %d
        }
        "#,
        r#"
        fn test(i32) -> i32 {
        entry:
          %b = add i32 2, %arg0
          %c = mul i32 2, %arg0
          %d = add i32 %b, %c
          ret i32 %d
        }
        "#,
    );
}

#[test]
fn folds_wrap_at_the_instruction_width() {
    optimizes_to(
        r#"
        fn test() -> i8 {
        entry:
          %a = add i8 127, 1
          ret i8 %a
        }
        "#,
        r#"
        fn test() -> i8 {
        entry:
          ret i8 -128
        }
        "#,
    );
}

#[test]
fn leaves_unsupported_opcodes_alone() {
    unchanged_by_folding(
        r#"
        fn test() -> i32 {
        entry:
          %a = and i32 5, 3
          %b = or i32 5, 3
          %c = xor i32 5, 3
          %d = add i32 %a, %b
          %e = add i32 %d, %c
          ret i32 %e
        }
        "#,
    );
}

#[test]
fn leaves_unsigned_predicates_alone() {
    unchanged_by_folding(
        r#"
        fn test() -> i32 {
        entry:
          %c = icmp ult i32 5, 3
          cbr i1 %c, yes, no
        yes:
          ret i32 1
        no:
          ret i32 0
        }
        "#,
    );
}

#[test]
fn leaves_non_constant_operands_alone() {
    unchanged_by_folding(
        r#"
        fn test(i32) -> i32 {
        entry:
          %a = add i32 %arg0, 1
          %b = mul i32 %a, %arg0
          ret i32 %b
        }
        "#,
    );
}

#[test]
fn skip_policy_leaves_division_by_zero_in_place() {
    unchanged_by_folding(
        r#"
        fn test() -> i32 {
        entry:
          %bot = sdiv i32 7, 0
          ret i32 %bot
        }
        "#,
    );
}

#[test]
fn skip_policy_keeps_folding_around_the_error() {
    optimizes_to(
        r#"
        fn test() -> i32 {
        entry:
          %a = add i32 1, 2
          %bot = sdiv i32 2, 0
          %b = add i32 %a, 4
          ret i32 %b
        }
        "#,
        r#"
        fn test() -> i32 {
        entry:
          %bot = sdiv i32 2, 0
          ret i32 7
        }
        "#,
    );
}

#[test]
fn abort_policy_reports_the_error() {
    let program = valid(
        r#"
        fn test() -> i32 {
        entry:
          %bot = sdiv i32 7, 0
          ret i32 %bot
        }
        "#,
    );
    let opts = FoldOptions {
        div_zero: DivZeroPolicy::Abort,
        ..FoldOptions::default()
    };
    assert_eq!(
        constant_fold(program, &opts).unwrap_err(),
        ArithmeticError::DivideByZero
    );
}

#[test]
fn reports_whether_anything_changed() {
    let program = valid(
        r#"
        fn test() -> i32 {
        entry:
          %a = add i32 3, 4
          ret i32 %a
        }
        "#,
    );

    let (folded, changed) = constant_fold(program, &FoldOptions::default()).unwrap();
    assert_eq!(changed, Changed::Yes);

    // idempotence: the second run has nothing left to do.
    let before = folded.0.to_string();
    let (refolded, changed) = constant_fold(folded, &FoldOptions::default()).unwrap();
    assert_eq!(changed, Changed::No);
    assert_eq!(refolded.0.to_string(), before);
}

#[test]
fn folds_every_function_in_the_program() {
    optimizes_to(
        r#"
        fn f() -> i32 {
        entry:
          %a = add i32 1, 1
          ret i32 %a
        }

        fn g() -> i32 {
        entry:
          %a = sub i32 5, 3
          ret i32 %a
        }
        "#,
        r#"
        fn f() -> i32 {
        entry:
          ret i32 2
        }

        fn g() -> i32 {
        entry:
          ret i32 2
        }
        "#,
    );
}

// SECTION: properties

// a random straight-line function over two i32 arguments.
fn gen_function(u: &mut Unstructured) -> arbitrary::Result<Program> {
    let mut func = Function::new(func_id("test"), vec![Width::I32, Width::I32], Width::I32);
    let entry = func.add_block(bb_id("entry"));
    let mut defs: Vec<InstId> = Vec::new();

    fn operand(u: &mut Unstructured, defs: &[InstId]) -> arbitrary::Result<Operand> {
        Ok(match u.int_in_range(0u8..=2)? {
            0 => Operand::Const(Constant::new(Width::I32, u.int_in_range(-8i64..=8)?)),
            1 => Operand::Arg(u.int_in_range(0usize..=1)?),
            _ => match u.choose(defs) {
                Ok(&id) => Operand::Inst(id),
                // no defs yet; fall back to a constant.
                Err(_) => Operand::Const(Constant::new(Width::I32, u.int_in_range(-8i64..=8)?)),
            },
        })
    }

    let n = u.int_in_range(1usize..=12)?;
    for i in 0..n {
        let opcode = u
            .choose(&[
                Opcode::Add,
                Opcode::Sub,
                Opcode::Mul,
                Opcode::SDiv,
                Opcode::And,
                Opcode::Or,
                Opcode::Xor,
            ])?
            .clone();
        let lhs = operand(u, &defs)?;
        let rhs = operand(u, &defs)?;
        let id = func.push_inst(
            entry,
            Instruction {
                opcode,
                ty: Some(Width::I32),
                operands: vec![lhs, rhs],
                result: Some(format!("v{i}")),
            },
        );
        defs.push(id);
    }

    let ret = Operand::Inst(*defs.last().unwrap());
    func.push_inst(
        entry,
        Instruction {
            opcode: Opcode::Ret,
            ty: Some(Width::I32),
            operands: vec![ret],
            result: None,
        },
    );

    Ok(Program {
        functions: [(func.id.clone(), func)].into_iter().collect(),
    })
}

#[test]
fn folding_preserves_meaning() {
    arbtest::arbtest(|u| {
        let program = gen_function(u)?;
        let args = [u.arbitrary::<i64>()?, u.arbitrary::<i64>()?];

        let original = program.validate().unwrap();
        let (folded, _) = constant_fold(original.clone(), &FoldOptions::default()).unwrap();

        assert_eq!(
            interp::run(&original, &func_id("test"), &args),
            interp::run(&folded, &func_id("test"), &args)
        );
        Ok(())
    });
}

#[test]
fn folding_reaches_a_fixed_point() {
    arbtest::arbtest(|u| {
        let program = gen_function(u)?;

        let (folded, _) =
            constant_fold(program.validate().unwrap(), &FoldOptions::default()).unwrap();
        let before = folded.0.to_string();
        let (refolded, changed) = constant_fold(folded, &FoldOptions::default()).unwrap();

        assert_eq!(changed, Changed::No);
        assert_eq!(refolded.0.to_string(), before);
        Ok(())
    });
}
