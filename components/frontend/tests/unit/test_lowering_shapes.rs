//! Validates the bytecode shapes the lowering produces for common
//! program structures.

use bytecode_system::{validate, Opcode};
use core_types::StringTable;
use frontend::ast::*;
use frontend::{lower_program, SymbolResolver};

fn num(value: f64) -> Expression {
    Expression::Literal(Literal::Number(value))
}

fn ident(name: &str) -> Expression {
    Expression::Identifier(name.to_string())
}

fn opcodes_of(block: &bytecode_system::BytecodeBlock) -> Vec<Opcode> {
    let mut decoder = block.decoder();
    let mut ops = Vec::new();
    while let Ok(Some(inst)) = decoder.next_instruction() {
        ops.push(inst.opcode);
    }
    ops
}

/// The sum-loop function used by the hotness scenarios:
/// `function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; }`
pub fn sum_program() -> Vec<Statement> {
    vec![Statement::FunctionDeclaration {
        name: "sum".to_string(),
        params: vec![Pattern::Identifier("n".to_string())],
        body: vec![
            Statement::VariableDeclaration {
                kind: DeclKind::Let,
                declarations: vec![(Pattern::Identifier("s".to_string()), Some(num(0.0)))],
            },
            Statement::For {
                init: Some(ForInit::Declaration {
                    kind: DeclKind::Let,
                    declarations: vec![(Pattern::Identifier("i".to_string()), Some(num(0.0)))],
                }),
                test: Some(Expression::Binary {
                    op: BinaryOp::LessThan,
                    left: Box::new(ident("i")),
                    right: Box::new(ident("n")),
                }),
                update: Some(Expression::Update {
                    increment: true,
                    prefix: false,
                    target: "i".to_string(),
                }),
                body: Box::new(Statement::Expression(Expression::Assignment {
                    op: AssignOp::AddAssign,
                    target: AssignTarget::Identifier("s".to_string()),
                    value: Box::new(ident("i")),
                })),
            },
            Statement::Return(Some(ident("s"))),
        ],
    }]
}

#[test]
fn test_sum_function_lowers_and_validates() {
    let strings = StringTable::new();
    let lowered = lower_program(&sum_program(), false, &strings).unwrap();
    assert_eq!(lowered.functions.len(), 2);
    for block in &lowered.functions {
        assert!(validate(block).is_empty());
    }
    let sum = &lowered.functions[1];
    assert_eq!(sum.param_count, 1);
    // n, s, i
    assert_eq!(sum.local_count, 3);
    let ops = opcodes_of(sum);
    assert!(ops.contains(&Opcode::JumpIfFalse));
    assert!(ops.contains(&Opcode::Jump));
    assert_eq!(ops[0], Opcode::FunctionHeader);
}

#[test]
fn test_scope_depths_match_resolution() {
    // let a = 1; function f() { let a = 2; return a; } f()
    let program = vec![
        Statement::VariableDeclaration {
            kind: DeclKind::Let,
            declarations: vec![(Pattern::Identifier("a".to_string()), Some(num(1.0)))],
        },
        Statement::FunctionDeclaration {
            name: "f".to_string(),
            params: vec![],
            body: vec![
                Statement::VariableDeclaration {
                    kind: DeclKind::Let,
                    declarations: vec![(Pattern::Identifier("a".to_string()), Some(num(2.0)))],
                },
                Statement::Return(Some(ident("a"))),
            ],
        },
        Statement::Expression(Expression::Call {
            callee: Box::new(ident("f")),
            arguments: vec![],
        }),
    ];

    let tree = SymbolResolver::analyze(&program).unwrap();
    let function_scope = tree.scope(0).children[0];
    assert_eq!(tree.resolve(function_scope, "a").unwrap().depth, 1);
    assert_eq!(tree.resolve(0, "a").unwrap().depth, 0);

    let strings = StringTable::new();
    let lowered = lower_program(&program, false, &strings).unwrap();
    for block in &lowered.functions {
        assert!(validate(block).is_empty());
    }
    // The inner function reads its own local, not an environment walk
    let ops = opcodes_of(&lowered.functions[1]);
    assert!(ops.contains(&Opcode::LoadLocal));
    assert!(!ops.contains(&Opcode::LoadVar));
}

#[test]
fn test_closure_reads_outer_function_variable() {
    // function outer() { let x = 1; function inner() { return x; } }
    let program = vec![Statement::FunctionDeclaration {
        name: "outer".to_string(),
        params: vec![],
        body: vec![
            Statement::VariableDeclaration {
                kind: DeclKind::Let,
                declarations: vec![(Pattern::Identifier("x".to_string()), Some(num(1.0)))],
            },
            Statement::FunctionDeclaration {
                name: "inner".to_string(),
                params: vec![],
                body: vec![Statement::Return(Some(ident("x")))],
            },
        ],
    }];
    let strings = StringTable::new();
    let lowered = lower_program(&program, false, &strings).unwrap();
    assert_eq!(lowered.functions.len(), 3);
    let inner = opcodes_of(&lowered.functions[2]);
    assert!(inner.contains(&Opcode::LoadVar));
}

#[test]
fn test_unresolved_identifier_uses_global_lookup() {
    let program = vec![Statement::Expression(ident("print"))];
    let strings = StringTable::new();
    let lowered = lower_program(&program, false, &strings).unwrap();
    let ops = opcodes_of(&lowered.functions[0]);
    assert!(ops.contains(&Opcode::LoadGlobal));
}

#[test]
fn test_strict_flag_propagates() {
    let program = vec![Statement::FunctionDeclaration {
        name: "f".to_string(),
        params: vec![],
        body: vec![],
    }];
    let strings = StringTable::new();
    let lowered = lower_program(&program, true, &strings).unwrap();
    assert!(lowered.functions[0].strict);
    assert!(lowered.functions[1].strict);
}
