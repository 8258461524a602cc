//! Hotness promotion and trace side exits, end to end: interpreter,
//! hotness counters, trace recording, compilation, dispatch, and the
//! return to the interpreter when a guard no longer holds.

use frontend::ast::*;
use frontend::lower_program;
use integration_tests::{call, ident, let_decl, num, sum_function};
use jit_compiler::{TracingConfig, TracingJit};
use runtime::{BytecodeAddress, Interpreter, Realm, SideExitKind, TraceRuntime};

#[test]
fn test_hot_loop_promotes_and_returns_4950() {
    let mut realm = Realm::new();
    let program = vec![
        sum_function(),
        call(ident("sum"), vec![num(100.0)]),
        Statement::Expression(Expression::Call {
            callee: Box::new(ident("sum")),
            arguments: vec![num(100.0)],
        }),
    ];
    let lowered = lower_program(&program, false, &realm.heap.strings).unwrap();

    let mut jit = TracingJit::new(TracingConfig::default());
    let value = {
        let mut interp = Interpreter::new(&mut realm, &lowered).with_tracer(&mut jit);
        interp.run().unwrap()
    };
    // The completion value is the second sum(100)
    assert_eq!(value.as_number(), Some(4950.0));

    // A trace was compiled at the loop header and hit at least once
    assert!(realm.profiler.trace_hits >= 1, "no trace hits recorded");
    assert!(
        realm.profiler.side_exits.is_empty(),
        "normal loop exit must not count as a side exit: {:?}",
        realm.profiler.side_exits
    );

    // The tracer holds a compiled trace with real native code installed
    let installed = (0..lowered.functions[1].code.len() as u32)
        .find_map(|offset| jit.trace_for_location(BytecodeAddress::new(1, offset)));
    let trace = installed.expect("a trace is installed at the loop header");
    assert!(trace.code_size > 0);
    assert!(trace.execution_count >= 1);
    assert_eq!(trace.side_exits.len(), 1, "the loop condition is the one guard");
}

#[test]
fn test_dispatch_is_idempotent_at_hot_location() {
    let mut realm = Realm::new();
    let program = vec![sum_function(), call(ident("sum"), vec![num(50.0)])];
    let lowered = lower_program(&program, false, &realm.heap.strings).unwrap();
    let mut jit = TracingJit::new(TracingConfig::default());
    {
        let mut interp = Interpreter::new(&mut realm, &lowered).with_tracer(&mut jit);
        interp.run().unwrap();
    }
    let header = (0..lowered.functions[1].code.len() as u32)
        .map(|offset| BytecodeAddress::new(1, offset))
        .find(|a| jit.trace_for_location(*a).is_some())
        .expect("hot header");
    let first = jit.trace_at(header).unwrap().trace_id;
    let second = jit.trace_at(header).unwrap().trace_id;
    assert_eq!(first, second);
}

#[test]
fn test_guard_failure_mid_trace_side_exits_and_preserves_state() {
    // for (let i = 0; i < 100; i++) a[i] = i; with a of length 50:
    // the bounds check fails at i == 50, control returns to the
    // interpreter, the exit kind is recorded, and the array is unchanged.
    let mut realm = Realm::new();
    let mut elements = Vec::new();
    for _ in 0..50 {
        elements.push(num(0.0));
    }
    let program = vec![
        let_decl("a", Expression::Array(elements)),
        Statement::For {
            init: Some(ForInit::Declaration {
                kind: DeclKind::Let,
                declarations: vec![(Pattern::Identifier("i".to_string()), Some(num(0.0)))],
            }),
            test: Some(Expression::Binary {
                op: BinaryOp::LessThan,
                left: Box::new(ident("i")),
                right: Box::new(num(100.0)),
            }),
            update: Some(Expression::Update {
                increment: true,
                prefix: false,
                target: "i".to_string(),
            }),
            body: Box::new(Statement::Expression(Expression::Assignment {
                op: AssignOp::Assign,
                target: AssignTarget::Member {
                    object: Box::new(ident("a")),
                    property: PropertyKey::Computed(Box::new(ident("i"))),
                },
                value: Box::new(ident("i")),
            })),
        },
    ];
    let lowered = lower_program(&program, false, &realm.heap.strings).unwrap();
    let mut jit = TracingJit::new(TracingConfig::default());
    let result = {
        let mut interp = Interpreter::new(&mut realm, &lowered).with_tracer(&mut jit);
        interp.run()
    };
    // The out-of-bounds store surfaces as a RangeError
    let err = result.unwrap_err();
    assert_eq!(err.kind, core_types::ErrorKind::RangeError);

    // The trace was running and exited through the exception path
    assert!(
        realm
            .profiler
            .side_exits
            .contains(&SideExitKind::ExceptionThrown),
        "expected an exception side exit, saw {:?}",
        realm.profiler.side_exits
    );

    // a.length is still 50
    let slot = lowered.scopes.resolve(0, "a").unwrap().slot;
    let array = realm
        .envs
        .read(realm.global_env, 0, slot)
        .as_object()
        .unwrap();
    assert_eq!(realm.objects.array_length(array), Some(50));
}
