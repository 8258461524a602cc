//! End-to-end semantic scenarios: BigInt round trips, scope resolution,
//! optimizer semantics preservation, and array boundary behavior.

use frontend::ast::*;
use frontend::{lower_program, SymbolResolver};
use integration_tests::{ident, let_decl, num};
use jit_compiler::{build_ir, optimize, validate_ir, OptLevel, OptimizerConfig};
use runtime::{Context, ContextOptions, Interpreter, JsObject, ObjectKind, Realm};

#[test]
fn test_bigint_roundtrip_through_programs() {
    // BigInt("123456789012345678901234567890").toString() round-trips,
    // and two negations give the original back
    let mut context = Context::create(ContextOptions::default());
    let digits = "123456789012345678901234567890";
    let program = vec![Statement::Expression(Expression::Binary {
        op: BinaryOp::Mul,
        left: Box::new(Expression::Binary {
            op: BinaryOp::Mul,
            left: Box::new(Expression::Literal(Literal::BigInt(digits.to_string()))),
            right: Box::new(Expression::Literal(Literal::BigInt("-1".to_string()))),
        }),
        right: Box::new(Expression::Literal(Literal::BigInt("-1".to_string()))),
    })];
    let value = context.evaluate_program(&program).unwrap();
    let result = context.realm.heap.bigint(value.as_bigint().unwrap());
    assert_eq!(result.to_string(), digits);
}

#[test]
fn test_scope_resolution_scenario() {
    // let a = 1; function f() { let a = 2; return a; } f()
    let program = vec![
        let_decl("a", num(1.0)),
        Statement::FunctionDeclaration {
            name: "f".to_string(),
            params: vec![],
            body: vec![
                let_decl("a", num(2.0)),
                Statement::Return(Some(ident("a"))),
            ],
        },
        Statement::Expression(Expression::Call {
            callee: Box::new(ident("f")),
            arguments: vec![],
        }),
    ];

    // Resolution: inner a at function depth 1, outer a at depth 0
    let tree = SymbolResolver::analyze(&program).unwrap();
    let function_scope = tree.scope(0).children[0];
    assert_eq!(tree.resolve(function_scope, "a").unwrap().depth, 1);
    assert_eq!(tree.resolve(0, "a").unwrap().depth, 0);

    // Execution: the call returns the inner binding
    let mut context = Context::create(ContextOptions::default());
    let value = context.evaluate_program(&program).unwrap();
    assert_eq!(value.as_number(), Some(2.0));
}

#[test]
fn test_optimizer_preserves_observable_semantics() {
    // The same program, interpreted, must agree with the constant the
    // optimizer computes for its IR
    let program = vec![Statement::Expression(Expression::Binary {
        op: BinaryOp::Sub,
        left: Box::new(Expression::Binary {
            op: BinaryOp::Mul,
            left: Box::new(Expression::Binary {
                op: BinaryOp::Add,
                left: Box::new(num(10.0)),
                right: Box::new(num(20.0)),
            }),
            right: Box::new(num(2.0)),
        }),
        right: Box::new(num(18.0)),
    })];

    let mut realm = Realm::new();
    let lowered = lower_program(&program, false, &realm.heap.strings).unwrap();
    let interpreted = {
        let mut interp = Interpreter::new(&mut realm, &lowered);
        interp.run().unwrap()
    };
    assert_eq!(interpreted.as_number(), Some(42.0));

    for level in [OptLevel::None, OptLevel::O1, OptLevel::O2, OptLevel::O3, OptLevel::Speed] {
        let mut ir = build_ir(&lowered.functions[0]).unwrap();
        optimize(
            &mut ir,
            OptimizerConfig {
                level,
                max_iterations: 10,
            },
        );
        let diagnostics = validate_ir(&ir);
        assert!(
            diagnostics.iter().all(|d| d.kind.is_warning()),
            "level {:?} broke the IR: {:?}",
            level,
            diagnostics
        );
        // At O2 and up the whole expression folds to the constant the
        // interpreter computed
        if !matches!(level, OptLevel::None | OptLevel::O1) {
            let folded = ir.block_ids().any(|b| {
                ir.block_insts(b).iter().any(|id| {
                    let inst = ir.inst(*id);
                    inst.opcode == jit_compiler::IrOpcode::LoadConst
                        && inst.operands == vec![jit_compiler::Operand::ImmI64(42)]
                })
            });
            assert!(folded, "level {:?} did not fold to 42", level);
        }
    }
}

#[test]
fn test_array_boundary_behavior() {
    // Push onto a zero-length array, pop twice: the second pop is
    // undefined. Splice with delete count 0 returns empty and leaves the
    // length unchanged.
    let mut realm = Realm::new();
    let array = realm.objects.alloc(JsObject {
        shape: realm.shapes.root(),
        slots: Vec::new(),
        kind: ObjectKind::Array {
            elements: Vec::new(),
        },
    });
    assert_eq!(realm.objects.array_push(array, core_types::Value::int32(1)), 1);
    assert_eq!(
        realm.objects.array_pop(array),
        core_types::Value::int32(1)
    );
    assert_eq!(realm.objects.array_pop(array), core_types::Value::undefined());

    for i in 0..4 {
        realm
            .objects
            .array_push(array, core_types::Value::int32(i));
    }
    let removed = realm.objects.array_splice(array, 2, 0);
    assert!(removed.is_empty());
    assert_eq!(realm.objects.array_length(array), Some(4));

    let removed = realm.objects.array_splice(array, 1, 2);
    assert_eq!(removed.len(), 2);
    assert_eq!(realm.objects.array_length(array), Some(2));
}

#[test]
fn test_host_api_surface() {
    let mut context = Context::create(ContextOptions {
        strict_mode: true,
        ..ContextOptions::default()
    });
    assert!(context.options().strict_mode);

    context
        .set_global("answer", core_types::Value::int32(42))
        .unwrap();
    let program = vec![Statement::Expression(ident("answer"))];
    let value = context.evaluate_program(&program).unwrap();
    assert_eq!(value.as_number(), Some(42.0));

    assert!(context.delete_global("answer").unwrap());
    let err = context.evaluate_program(&program).unwrap_err();
    assert_eq!(err.kind, core_types::ErrorKind::ReferenceError);

    context.destroy();
    context.destroy(); // idempotent
    assert!(context.evaluate_program(&program).is_err());
}
