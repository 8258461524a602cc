//! Shared AST builders for the end-to-end integration tests.

use frontend::ast::*;

/// A numeric literal expression.
pub fn num(value: f64) -> Expression {
    Expression::Literal(Literal::Number(value))
}

/// An identifier expression.
pub fn ident(name: &str) -> Expression {
    Expression::Identifier(name.to_string())
}

/// A `let name = init;` statement.
pub fn let_decl(name: &str, init: Expression) -> Statement {
    Statement::VariableDeclaration {
        kind: DeclKind::Let,
        declarations: vec![(Pattern::Identifier(name.to_string()), Some(init))],
    }
}

/// A call expression `callee(args...)`.
pub fn call(callee: Expression, arguments: Vec<Expression>) -> Statement {
    Statement::Expression(Expression::Call {
        callee: Box::new(callee),
        arguments,
    })
}

/// `function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; }`
pub fn sum_function() -> Statement {
    Statement::FunctionDeclaration {
        name: "sum".to_string(),
        params: vec![Pattern::Identifier("n".to_string())],
        body: vec![
            let_decl("s", num(0.0)),
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
    }
}
