//! Inline-cache behavior across whole-program executions: the
//! monomorphization and megamorphic-fallback scenarios.

use core_types::Value;
use frontend::ast::*;
use runtime::{Context, ContextOptions, IcState, POLYMORPHIC_CAPACITY};

fn num(value: f64) -> Expression {
    Expression::Literal(Literal::Number(value))
}

fn ident(name: &str) -> Expression {
    Expression::Identifier(name.to_string())
}

/// `function f(o) { return o.x }`
fn reader_decl() -> Statement {
    Statement::FunctionDeclaration {
        name: "f".to_string(),
        params: vec![Pattern::Identifier("o".to_string())],
        body: vec![Statement::Return(Some(Expression::Member {
            object: Box::new(ident("o")),
            property: PropertyKey::Named("x".to_string()),
        }))],
    }
}

fn call_f(argument: Expression) -> Statement {
    Statement::Expression(Expression::Call {
        callee: Box::new(ident("f")),
        arguments: vec![argument],
    })
}

#[test]
fn test_ic_monomorphization_over_twenty_calls() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![reader_decl()];
    for _ in 0..20 {
        // Same shape every call: { x: 1 }
        program.push(call_f(Expression::Object(vec![(
            "x".to_string(),
            num(1.0),
        )])));
    }
    context.evaluate_program(&program).unwrap();

    // The reader's site is function 1, site 0, and stays monomorphic:
    // one miss on the first call, hits on calls 2 through 20
    let site = context.realm.ic_sites.existing(1, 0).unwrap();
    assert!(matches!(site.state, IcState::Monomorphic(_)));
    assert_eq!(site.hits, 19);
    assert_eq!(site.misses, 1);

    let (hits, _) = context.realm.ic_sites.totals();
    assert!(hits >= 19);
}

#[test]
fn test_ic_megamorphic_fallback_on_distinct_shapes() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![reader_decl()];
    // Ten distinct shapes: each object has a unique leading property, so
    // every call sees a different hidden class.
    for i in 0..10 {
        program.push(call_f(Expression::Object(vec![
            (format!("p{}", i), num(0.0)),
            ("x".to_string(), num(i as f64)),
        ])));
    }
    // The 11th call still returns the right value through the generic path
    program.push(Statement::Expression(Expression::Member {
        object: Box::new(Expression::Object(vec![
            ("q".to_string(), num(0.0)),
            ("x".to_string(), num(99.0)),
        ])),
        property: PropertyKey::Named("x".to_string()),
    }));

    let value = context.evaluate_program(&program).unwrap();
    assert_eq!(value.as_number(), Some(99.0));

    let site = context.realm.ic_sites.existing(1, 0).unwrap();
    assert!(site.is_megamorphic());
    assert_eq!(site.entry_count(), 0);
    assert!(site.misses as usize > POLYMORPHIC_CAPACITY);
}

#[test]
fn test_generic_path_still_correct_when_megamorphic() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![reader_decl()];
    for i in 0..8 {
        program.push(call_f(Expression::Object(vec![
            (format!("k{}", i), num(0.0)),
            ("x".to_string(), num(i as f64)),
        ])));
    }
    // Final call's value is the completion
    program.push(Statement::Expression(Expression::Call {
        callee: Box::new(ident("f")),
        arguments: vec![Expression::Object(vec![
            ("z".to_string(), num(0.0)),
            ("x".to_string(), num(7.0)),
        ])],
    }));
    let value = context.evaluate_program(&program).unwrap();
    assert_eq!(value, Value::int32(7));
}
