//! Whole-pipeline tests: frontend output through IR construction,
//! validation, optimization, register allocation and baseline emission.

use bytecode_system::validate as validate_bytecode;
use core_types::StringTable;
use frontend::ast::*;
use frontend::lower_program;
use jit_compiler::{
    allocate, analyze_types, build_ir, compute_liveness, optimize, reg_file_for, validate_ir,
    AllocStrategy, Architecture, Assignment, BaselineJit, CodeCache, OptLevel, OptimizerConfig,
    RuntimeHelpers,
};

fn num(value: f64) -> Expression {
    Expression::Literal(Literal::Number(value))
}

fn ident(name: &str) -> Expression {
    Expression::Identifier(name.to_string())
}

/// `function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; }`
fn sum_program() -> Vec<Statement> {
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
fn test_sum_flows_through_every_tier() {
    let strings = StringTable::new();
    let lowered = lower_program(&sum_program(), false, &strings).unwrap();
    let block = &lowered.functions[1];
    assert!(validate_bytecode(block).is_empty());

    // Bytecode -> IR
    let mut ir = build_ir(block).unwrap();
    let diagnostics = validate_ir(&ir);
    assert!(
        diagnostics.iter().all(|d| d.kind.is_warning()),
        "unexpected diagnostics: {:?}",
        diagnostics
    );
    let headers = ir
        .block_ids()
        .filter(|b| ir.block(*b).is_loop_header)
        .count();
    assert_eq!(headers, 1);

    // Types: the loop counter math involves env traffic, so the analysis
    // completes without widening everything
    let analysis = analyze_types(&ir);
    assert!(!analysis.widened);

    // Optimize, then the IR still validates
    optimize(
        &mut ir,
        OptimizerConfig {
            level: OptLevel::O2,
            max_iterations: 10,
        },
    );
    let diagnostics = validate_ir(&ir);
    assert!(diagnostics.iter().all(|d| d.kind.is_warning()));

    // Registers for both strategies on both register-rich and
    // register-poor files
    let liveness = compute_liveness(&ir);
    for strategy in [AllocStrategy::LinearScan, AllocStrategy::GraphColoring] {
        for arch in [
            Architecture::X86_64,
            Architecture::Arm64,
            Architecture::RiscV64,
        ] {
            let file = reg_file_for(arch, false);
            let allocation = allocate(&ir, &liveness, &file, strategy);
            for interval in liveness.intervals.keys() {
                assert!(
                    allocation.assignments.contains_key(interval),
                    "{:?} left unassigned",
                    interval
                );
            }
        }
    }
}

#[test]
fn test_baseline_compiles_lowered_function() {
    let strings = StringTable::new();
    let lowered = lower_program(&sum_program(), false, &strings).unwrap();
    let cache = CodeCache::new(1 << 20);
    let mut sites = runtime::IcSiteTable::new();
    let mut jit = BaselineJit::new(Architecture::X86_64, RuntimeHelpers::stubs(), false);
    let compiled = jit.compile(1, &lowered.functions[1], &cache, &mut sites).unwrap();
    assert!(compiled.code_size >= lowered.functions[1].code.len());
    assert!(compiled.offset_map.is_none(), "debug info was off");
}

#[test]
fn test_spilled_allocation_under_tiny_file() {
    use jit_compiler::{PhysReg, PhysRegFile};
    let strings = StringTable::new();
    let lowered = lower_program(&sum_program(), false, &strings).unwrap();
    let ir = build_ir(&lowered.functions[1]).unwrap();
    let liveness = compute_liveness(&ir);
    let tiny = PhysRegFile {
        gp: vec![PhysReg(0), PhysReg(1)],
        fp: vec![],
        vec: vec![],
    };
    let allocation = allocate(&ir, &liveness, &tiny, AllocStrategy::LinearScan);
    let spills = allocation
        .assignments
        .values()
        .filter(|a| matches!(a, Assignment::Spill(_)))
        .count();
    // Complete even under pressure
    for reg in liveness.intervals.keys() {
        assert!(allocation.assignments.contains_key(reg));
    }
    let _ = spills;
}
