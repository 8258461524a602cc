//! Inline-cache lifecycle scenarios: monomorphization over a stable
//! shape, and the megamorphic fallback once the entry capacity is
//! exhausted.

use frontend::ast::*;
use integration_tests::{call, ident, num};
use runtime::{Context, ContextOptions, IcState, POLYMORPHIC_CAPACITY};

fn property_reader() -> Statement {
    Statement::FunctionDeclaration {
        name: "f".to_string(),
        params: vec![Pattern::Identifier("o".to_string())],
        body: vec![Statement::Return(Some(Expression::Member {
            object: Box::new(ident("o")),
            property: PropertyKey::Named("x".to_string()),
        }))],
    }
}

#[test]
fn test_monomorphization_after_first_call() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![property_reader()];
    for _ in 0..20 {
        program.push(call(
            ident("f"),
            vec![Expression::Object(vec![("x".to_string(), num(1.0))])],
        ));
    }
    context.evaluate_program(&program).unwrap();

    let site = context.realm.ic_sites.existing(1, 0).unwrap();
    assert!(
        matches!(site.state, IcState::Monomorphic(_)),
        "twenty same-shape calls stay monomorphic"
    );
    assert_eq!(site.misses, 1, "only the first call misses");
    assert_eq!(site.hits, 19, "calls 2 through 20 use the cached entry");
}

#[test]
fn test_megamorphic_fallback_with_ten_shapes() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![property_reader()];
    for i in 0..10 {
        // A distinct leading property gives each object a distinct shape
        program.push(call(
            ident("f"),
            vec![Expression::Object(vec![
                (format!("p{}", i), num(0.0)),
                ("x".to_string(), num(i as f64)),
            ])],
        ));
    }
    // The 11th call must still produce the right value with the site
    // routing through the generic handler and no further entry growth
    program.push(Statement::Expression(Expression::Call {
        callee: Box::new(ident("f")),
        arguments: vec![Expression::Object(vec![
            ("q".to_string(), num(0.0)),
            ("x".to_string(), num(41.0)),
        ])],
    }));

    let value = context.evaluate_program(&program).unwrap();
    assert_eq!(value.as_number(), Some(41.0));

    let site = context.realm.ic_sites.existing(1, 0).unwrap();
    assert!(site.is_megamorphic());
    assert_eq!(site.entry_count(), 0);
    assert!(site.misses as usize > POLYMORPHIC_CAPACITY);
}

#[test]
fn test_polymorphic_site_with_two_shapes() {
    let mut context = Context::create(ContextOptions::default());
    let mut program = vec![property_reader()];
    for i in 0..6 {
        let shape_a = i % 2 == 0;
        let mut props = Vec::new();
        if shape_a {
            props.push(("x".to_string(), num(1.0)));
        } else {
            props.push(("y".to_string(), num(0.0)));
            props.push(("x".to_string(), num(2.0)));
        }
        program.push(call(ident("f"), vec![Expression::Object(props)]));
    }
    context.evaluate_program(&program).unwrap();
    let site = context.realm.ic_sites.existing(1, 0).unwrap();
    assert!(matches!(site.state, IcState::Polymorphic(_)));
    assert_eq!(site.entry_count(), 2);
    // Two misses (one per shape), hits after that
    assert_eq!(site.misses, 2);
    assert_eq!(site.hits, 4);
}
