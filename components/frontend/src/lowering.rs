//! AST to bytecode lowering.
//!
//! The generator walks the AST recursively, emitting through the bytecode
//! encoder. Control flow uses label placeholders that the encoder fixes up
//! at the end of each function. Identifier references are pre-resolved by
//! the symbol resolver; names that resolve to the current function become
//! direct local accesses, names owned by enclosing functions become
//! environment walks, and everything else falls back to a global lookup by
//! interned name.

use crate::ast::*;
use crate::scope::{ScopeTree, SymbolResolver};
use bytecode_system::{
    BytecodeBlock, BytecodeEncoder, Constant, ExceptionTableEntry, IcSiteKind, Label, Opcode,
};
use core_types::{CompileError, ErrorKind, JsBigInt, JsError, StringTable};
use std::collections::HashMap;

/// The output of lowering one program: a function table whose index 0 is
/// the top-level script, plus the scope tree it was resolved against.
#[derive(Debug)]
pub struct LoweredProgram {
    /// Function bytecode blocks; `functions[0]` is the script body
    pub functions: Vec<BytecodeBlock>,
    /// The resolved scope tree
    pub scopes: ScopeTree,
}

/// Lower a program to bytecode.
pub fn lower_program(
    program: &[Statement],
    strict: bool,
    strings: &StringTable,
) -> Result<LoweredProgram, JsError> {
    let scopes = SymbolResolver::analyze(program)?;
    let mut lowerer = Lowerer {
        strings,
        tree: scopes,
        functions: vec![BytecodeBlock::new()],
        child_cursor: HashMap::new(),
    };

    let mut ctx = FnCtx::new(0, 0, strict);
    ctx.block.local_count = lowerer.tree.local_count(0);
    ctx.enc.emit(
        Opcode::FunctionHeader,
        &[0, ctx.block.local_count as u32],
    );
    for (index, statement) in program.iter().enumerate() {
        // The script's completion value is its trailing expression
        if index + 1 == program.len() {
            if let Statement::Expression(expr) = statement {
                lowerer.lower_expression(&mut ctx, expr)?;
                ctx.enc.emit(Opcode::Return, &[]);
                break;
            }
        }
        lowerer.lower_statement(&mut ctx, statement)?;
    }
    ctx.enc.emit(Opcode::LoadUndefined, &[]);
    ctx.enc.emit(Opcode::Return, &[]);

    let FnCtx { enc, mut block, .. } = ctx;
    block.code = enc.finish().map_err(encoder_error)?;
    lowerer.functions[0] = block;

    Ok(LoweredProgram {
        functions: lowerer.functions,
        scopes: lowerer.tree,
    })
}

fn encoder_error(err: CompileError) -> JsError {
    JsError::new(ErrorKind::SyntaxError, err.to_string())
}

struct LoopLabels {
    break_label: Label,
    continue_label: Label,
}

struct FnCtx {
    enc: BytecodeEncoder,
    block: BytecodeBlock,
    scope: usize,
    function_depth: u32,
    loops: Vec<LoopLabels>,
}

impl FnCtx {
    fn new(scope: usize, function_depth: u32, strict: bool) -> Self {
        let mut block = BytecodeBlock::new();
        block.strict = strict;
        Self {
            enc: BytecodeEncoder::new(),
            block,
            scope,
            function_depth,
            loops: Vec::new(),
        }
    }
}

struct Lowerer<'a> {
    strings: &'a StringTable,
    tree: ScopeTree,
    functions: Vec<BytecodeBlock>,
    child_cursor: HashMap<usize, usize>,
}

impl<'a> Lowerer<'a> {
    /// Take the next child scope of `parent` in resolver visit order.
    fn next_child_scope(&mut self, parent: usize) -> usize {
        let cursor = self.child_cursor.entry(parent).or_insert(0);
        let child = self.tree.scope(parent).children[*cursor];
        *cursor += 1;
        child
    }

    fn intern(&self, text: &str) -> u32 {
        self.strings.intern(text).0
    }

    fn lower_function(
        &mut self,
        ctx: &mut FnCtx,
        params: &[Pattern],
        body: &[Statement],
    ) -> Result<u32, JsError> {
        let fn_scope = self.next_child_scope(ctx.scope);
        let index = self.functions.len() as u32;
        self.functions.push(BytecodeBlock::new());

        let mut inner = FnCtx::new(fn_scope, ctx.function_depth + 1, ctx.block.strict);
        inner.block.param_count = params.len() as u16;
        inner.block.local_count = self.tree.local_count(fn_scope);
        inner.enc.emit(
            Opcode::FunctionHeader,
            &[params.len() as u32, inner.block.local_count as u32],
        );
        for (i, param) in params.iter().enumerate() {
            inner.enc.emit(Opcode::GetParameter, &[i as u32]);
            self.store_pattern(&mut inner, param)?;
        }
        for statement in body {
            self.lower_statement(&mut inner, statement)?;
        }
        inner.enc.emit(Opcode::LoadUndefined, &[]);
        inner.enc.emit(Opcode::Return, &[]);

        let FnCtx { enc, mut block, .. } = inner;
        block.code = enc.finish().map_err(encoder_error)?;
        self.functions[index as usize] = block;
        Ok(index)
    }

    fn emit_load_identifier(&mut self, ctx: &mut FnCtx, name: &str) {
        match self.tree.resolve(ctx.scope, name) {
            Some(res) => {
                let hops = ctx.function_depth - res.depth;
                if hops == 0 {
                    ctx.enc.emit(Opcode::LoadLocal, &[res.slot as u32]);
                } else {
                    ctx.enc.emit(Opcode::LoadVar, &[hops, res.slot as u32]);
                }
            }
            None => {
                let id = self.intern(name);
                ctx.enc.emit(Opcode::LoadGlobal, &[id]);
            }
        }
    }

    fn emit_store_identifier(&mut self, ctx: &mut FnCtx, name: &str) {
        match self.tree.resolve(ctx.scope, name) {
            Some(res) => {
                let hops = ctx.function_depth - res.depth;
                if hops == 0 {
                    ctx.enc.emit(Opcode::StoreLocal, &[res.slot as u32]);
                } else {
                    ctx.enc.emit(Opcode::StoreVar, &[hops, res.slot as u32]);
                }
            }
            None => {
                let id = self.intern(name);
                ctx.enc.emit(Opcode::StoreGlobal, &[id]);
            }
        }
    }

    /// Consume the value on top of the stack, binding it to `pattern`.
    fn store_pattern(&mut self, ctx: &mut FnCtx, pattern: &Pattern) -> Result<(), JsError> {
        match pattern {
            Pattern::Identifier(name) => {
                self.emit_store_identifier(ctx, name);
                Ok(())
            }
            Pattern::Object(props) => {
                for (key, sub) in props {
                    ctx.enc.emit(Opcode::Dup, &[]);
                    let name_id = self.intern(key);
                    let site = ctx.block.add_ic_site(IcSiteKind::Property);
                    ctx.enc
                        .emit(Opcode::GetProperty, &[name_id, site as u32]);
                    self.store_pattern(ctx, sub)?;
                }
                ctx.enc.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Pattern::Array(elements) => {
                for (i, element) in elements.iter().enumerate() {
                    if let Some(sub) = element {
                        ctx.enc.emit(Opcode::Dup, &[]);
                        ctx.enc.emit_number(i as f64);
                        ctx.enc.emit(Opcode::GetElement, &[]);
                        self.store_pattern(ctx, sub)?;
                    }
                }
                ctx.enc.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Pattern::Default { inner, value } => {
                let use_value = ctx.enc.create_label();
                ctx.enc.emit(Opcode::Dup, &[]);
                ctx.enc.emit(Opcode::LoadUndefined, &[]);
                ctx.enc.emit(Opcode::StrictEqual, &[]);
                ctx.enc.emit_jump(Opcode::JumpIfFalse, use_value);
                ctx.enc.emit(Opcode::Pop, &[]);
                self.lower_expression(ctx, value)?;
                ctx.enc.bind_label(use_value).map_err(encoder_error)?;
                self.store_pattern(ctx, inner)
            }
            Pattern::Rest(inner) => {
                // Rest collection requires the iteration protocol, which is
                // a runtime builtin concern; the binding exists but starts
                // undefined.
                ctx.enc.emit(Opcode::Pop, &[]);
                ctx.enc.emit(Opcode::LoadUndefined, &[]);
                self.store_pattern(ctx, inner)
            }
        }
    }

    fn lower_statement(&mut self, ctx: &mut FnCtx, statement: &Statement) -> Result<(), JsError> {
        match statement {
            Statement::VariableDeclaration { declarations, .. } => {
                for (pattern, init) in declarations {
                    match init {
                        Some(expr) => self.lower_expression(ctx, expr)?,
                        None => ctx.enc.emit(Opcode::LoadUndefined, &[]),
                    }
                    self.store_pattern(ctx, pattern)?;
                }
                Ok(())
            }
            Statement::FunctionDeclaration { name, params, body } => {
                let index = self.lower_function(ctx, params, body)?;
                let constant = ctx.block.add_constant(Constant::Function(index));
                ctx.enc.emit(Opcode::LoadConst, &[constant]);
                self.emit_store_identifier(ctx, name);
                Ok(())
            }
            Statement::Expression(expr) => {
                self.lower_expression(ctx, expr)?;
                ctx.enc.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Statement::Return(expr) => {
                match expr {
                    Some(expr) => self.lower_expression(ctx, expr)?,
                    None => ctx.enc.emit(Opcode::LoadUndefined, &[]),
                }
                ctx.enc.emit(Opcode::Return, &[]);
                Ok(())
            }
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                let l_else = ctx.enc.create_label();
                self.lower_expression(ctx, test)?;
                ctx.enc.emit_jump(Opcode::JumpIfFalse, l_else);
                self.lower_statement(ctx, consequent)?;
                match alternate {
                    Some(alternate) => {
                        let l_end = ctx.enc.create_label();
                        ctx.enc.emit_jump(Opcode::Jump, l_end);
                        ctx.enc.bind_label(l_else).map_err(encoder_error)?;
                        self.lower_statement(ctx, alternate)?;
                        ctx.enc.bind_label(l_end).map_err(encoder_error)?;
                    }
                    None => {
                        ctx.enc.bind_label(l_else).map_err(encoder_error)?;
                    }
                }
                Ok(())
            }
            Statement::While { test, body } => {
                let l_head = ctx.enc.create_label();
                let l_exit = ctx.enc.create_label();
                ctx.enc.bind_label(l_head).map_err(encoder_error)?;
                self.lower_expression(ctx, test)?;
                ctx.enc.emit_jump(Opcode::JumpIfFalse, l_exit);
                ctx.loops.push(LoopLabels {
                    break_label: l_exit,
                    continue_label: l_head,
                });
                self.lower_statement(ctx, body)?;
                ctx.loops.pop();
                ctx.enc.emit_jump(Opcode::Jump, l_head);
                ctx.enc.bind_label(l_exit).map_err(encoder_error)?;
                Ok(())
            }
            Statement::For {
                init,
                test,
                update,
                body,
            } => {
                let for_scope = self.next_child_scope(ctx.scope);
                let saved_scope = ctx.scope;
                ctx.scope = for_scope;

                match init {
                    Some(ForInit::Declaration { declarations, .. }) => {
                        for (pattern, init) in declarations {
                            match init {
                                Some(expr) => self.lower_expression(ctx, expr)?,
                                None => ctx.enc.emit(Opcode::LoadUndefined, &[]),
                            }
                            self.store_pattern(ctx, pattern)?;
                        }
                    }
                    Some(ForInit::Expression(expr)) => {
                        self.lower_expression(ctx, expr)?;
                        ctx.enc.emit(Opcode::Pop, &[]);
                    }
                    None => {}
                }

                let l_head = ctx.enc.create_label();
                let l_continue = ctx.enc.create_label();
                let l_exit = ctx.enc.create_label();
                ctx.enc.bind_label(l_head).map_err(encoder_error)?;
                if let Some(test) = test {
                    self.lower_expression(ctx, test)?;
                    ctx.enc.emit_jump(Opcode::JumpIfFalse, l_exit);
                }
                ctx.loops.push(LoopLabels {
                    break_label: l_exit,
                    continue_label: l_continue,
                });
                self.lower_statement(ctx, body)?;
                ctx.loops.pop();
                ctx.enc.bind_label(l_continue).map_err(encoder_error)?;
                if let Some(update) = update {
                    self.lower_expression(ctx, update)?;
                    ctx.enc.emit(Opcode::Pop, &[]);
                }
                ctx.enc.emit_jump(Opcode::Jump, l_head);
                ctx.enc.bind_label(l_exit).map_err(encoder_error)?;

                ctx.scope = saved_scope;
                Ok(())
            }
            Statement::Block(statements) => {
                let block_scope = self.next_child_scope(ctx.scope);
                let saved = ctx.scope;
                ctx.scope = block_scope;
                for statement in statements {
                    self.lower_statement(ctx, statement)?;
                }
                ctx.scope = saved;
                Ok(())
            }
            Statement::Break => {
                let label = ctx
                    .loops
                    .last()
                    .map(|l| l.break_label)
                    .ok_or_else(|| {
                        JsError::new(ErrorKind::SyntaxError, "Illegal break statement")
                    })?;
                ctx.enc.emit_jump(Opcode::Jump, label);
                Ok(())
            }
            Statement::Continue => {
                let label = ctx
                    .loops
                    .last()
                    .map(|l| l.continue_label)
                    .ok_or_else(|| {
                        JsError::new(ErrorKind::SyntaxError, "Illegal continue statement")
                    })?;
                ctx.enc.emit_jump(Opcode::Jump, label);
                Ok(())
            }
            Statement::Throw(expr) => {
                self.lower_expression(ctx, expr)?;
                ctx.enc.emit(Opcode::Throw, &[]);
                Ok(())
            }
            Statement::Try {
                block,
                catch_param,
                handler,
                finalizer,
            } => self.lower_try(ctx, block, catch_param.as_ref(), handler.as_deref(), finalizer.as_deref()),
            Statement::Empty => Ok(()),
        }
    }

    fn lower_statements_in_scope(
        &mut self,
        ctx: &mut FnCtx,
        scope: usize,
        statements: &[Statement],
    ) -> Result<(), JsError> {
        let saved = ctx.scope;
        ctx.scope = scope;
        for statement in statements {
            self.lower_statement(ctx, statement)?;
        }
        ctx.scope = saved;
        Ok(())
    }

    fn lower_try(
        &mut self,
        ctx: &mut FnCtx,
        block: &[Statement],
        catch_param: Option<&Pattern>,
        handler: Option<&[Statement]>,
        finalizer: Option<&[Statement]>,
    ) -> Result<(), JsError> {
        let block_scope = self.next_child_scope(ctx.scope);
        let catch_scope = handler.map(|_| self.next_child_scope(ctx.scope));
        let finalizer_scope = finalizer.map(|_| self.next_child_scope(ctx.scope));

        let l_handler = ctx.enc.create_label();
        let l_end = ctx.enc.create_label();

        let try_start = ctx.enc.offset();
        self.lower_statements_in_scope(ctx, block_scope, block)?;
        let try_end = ctx.enc.offset();

        // Normal completion runs the finalizer and skips the handler
        if let (Some(statements), Some(scope)) = (finalizer, finalizer_scope) {
            let saved_cursor = self.child_cursor.clone();
            self.lower_statements_in_scope(ctx, scope, statements)?;
            self.child_cursor = saved_cursor;
        }
        ctx.enc.emit_jump(Opcode::Jump, l_end);

        ctx.enc.bind_label(l_handler).map_err(encoder_error)?;
        let handler_offset = ctx.enc.offset();
        match (handler, catch_scope) {
            (Some(statements), Some(scope)) => {
                let saved = ctx.scope;
                ctx.scope = scope;
                match catch_param {
                    Some(pattern) => self.store_pattern(ctx, pattern)?,
                    None => ctx.enc.emit(Opcode::Pop, &[]),
                }
                for statement in statements {
                    self.lower_statement(ctx, statement)?;
                }
                ctx.scope = saved;
                if let (Some(statements), Some(scope)) = (finalizer, finalizer_scope) {
                    self.lower_statements_in_scope(ctx, scope, statements)?;
                }
                ctx.enc.emit_jump(Opcode::Jump, l_end);
            }
            _ => {
                // No handler: run the finalizer with the exception parked
                // on the stack, then rethrow
                if let (Some(statements), Some(scope)) = (finalizer, finalizer_scope) {
                    self.lower_statements_in_scope(ctx, scope, statements)?;
                }
                ctx.enc.emit(Opcode::Throw, &[]);
            }
        }
        ctx.enc.bind_label(l_end).map_err(encoder_error)?;

        ctx.block.exception_table.push(ExceptionTableEntry {
            try_start,
            try_end,
            handler_offset,
        });
        Ok(())
    }

    fn binary_opcode(op: BinaryOp) -> Opcode {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::Div,
            BinaryOp::Mod => Opcode::Mod,
            BinaryOp::BitAnd => Opcode::BitAnd,
            BinaryOp::BitOr => Opcode::BitOr,
            BinaryOp::BitXor => Opcode::BitXor,
            BinaryOp::ShiftLeft => Opcode::ShiftLeft,
            BinaryOp::ShiftRight => Opcode::ShiftRight,
            BinaryOp::UShiftRight => Opcode::UShiftRight,
            BinaryOp::Equal => Opcode::Equal,
            BinaryOp::NotEqual => Opcode::NotEqual,
            BinaryOp::StrictEqual => Opcode::StrictEqual,
            BinaryOp::StrictNotEqual => Opcode::StrictNotEqual,
            BinaryOp::LessThan => Opcode::LessThan,
            BinaryOp::LessThanOrEqual => Opcode::LessThanOrEqual,
            BinaryOp::GreaterThan => Opcode::GreaterThan,
            BinaryOp::GreaterThanOrEqual => Opcode::GreaterThanOrEqual,
        }
    }

    fn lower_expression(&mut self, ctx: &mut FnCtx, expr: &Expression) -> Result<(), JsError> {
        match expr {
            Expression::Literal(literal) => self.lower_literal(ctx, literal),
            Expression::Identifier(name) => {
                self.emit_load_identifier(ctx, name);
                Ok(())
            }
            Expression::This => {
                ctx.enc.emit(Opcode::LoadThis, &[]);
                Ok(())
            }
            Expression::Binary { op, left, right } => {
                self.lower_expression(ctx, left)?;
                self.lower_expression(ctx, right)?;
                ctx.enc.emit(Self::binary_opcode(*op), &[]);
                Ok(())
            }
            Expression::Unary { op, argument } => {
                self.lower_expression(ctx, argument)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitNot => Opcode::BitNot,
                };
                ctx.enc.emit(opcode, &[]);
                Ok(())
            }
            Expression::Update {
                increment,
                prefix,
                target,
            } => {
                let op = if *increment { Opcode::Add } else { Opcode::Sub };
                if *prefix {
                    self.emit_load_identifier(ctx, target);
                    ctx.enc.emit_number(1.0);
                    ctx.enc.emit(op, &[]);
                    ctx.enc.emit(Opcode::Dup, &[]);
                    self.emit_store_identifier(ctx, target);
                } else {
                    self.emit_load_identifier(ctx, target);
                    ctx.enc.emit(Opcode::Dup, &[]);
                    ctx.enc.emit_number(1.0);
                    ctx.enc.emit(op, &[]);
                    self.emit_store_identifier(ctx, target);
                }
                Ok(())
            }
            Expression::Logical { op, left, right } => {
                let l_end = ctx.enc.create_label();
                self.lower_expression(ctx, left)?;
                ctx.enc.emit(Opcode::Dup, &[]);
                let jump = match op {
                    LogicalOp::And => Opcode::JumpIfFalse,
                    LogicalOp::Or => Opcode::JumpIfTrue,
                };
                ctx.enc.emit_jump(jump, l_end);
                ctx.enc.emit(Opcode::Pop, &[]);
                self.lower_expression(ctx, right)?;
                ctx.enc.bind_label(l_end).map_err(encoder_error)?;
                Ok(())
            }
            Expression::Assignment { op, target, value } => {
                self.lower_assignment(ctx, *op, target, value)
            }
            Expression::Conditional {
                test,
                consequent,
                alternate,
            } => {
                let l_alt = ctx.enc.create_label();
                let l_end = ctx.enc.create_label();
                self.lower_expression(ctx, test)?;
                ctx.enc.emit_jump(Opcode::JumpIfFalse, l_alt);
                self.lower_expression(ctx, consequent)?;
                ctx.enc.emit_jump(Opcode::Jump, l_end);
                ctx.enc.bind_label(l_alt).map_err(encoder_error)?;
                self.lower_expression(ctx, alternate)?;
                ctx.enc.bind_label(l_end).map_err(encoder_error)?;
                Ok(())
            }
            Expression::Call { callee, arguments } => {
                match callee.as_ref() {
                    Expression::Member {
                        object,
                        property: PropertyKey::Named(name),
                    } => {
                        // Callee-position loads get a method cache site
                        self.lower_expression(ctx, object)?;
                        let name_id = self.intern(name);
                        let site = ctx.block.add_ic_site(IcSiteKind::Method);
                        ctx.enc
                            .emit(Opcode::GetProperty, &[name_id, site as u32]);
                    }
                    _ => self.lower_expression(ctx, callee)?,
                }
                for argument in arguments {
                    self.lower_expression(ctx, argument)?;
                }
                ctx.enc.emit(Opcode::Call, &[arguments.len() as u32]);
                Ok(())
            }
            Expression::New { callee, arguments } => {
                self.lower_expression(ctx, callee)?;
                for argument in arguments {
                    self.lower_expression(ctx, argument)?;
                }
                ctx.enc.emit(Opcode::New, &[arguments.len() as u32]);
                Ok(())
            }
            Expression::Member { object, property } => {
                self.lower_expression(ctx, object)?;
                match property {
                    PropertyKey::Named(name) => {
                        let name_id = self.intern(name);
                        let site = ctx.block.add_ic_site(IcSiteKind::Property);
                        ctx.enc
                            .emit(Opcode::GetProperty, &[name_id, site as u32]);
                    }
                    PropertyKey::Computed(key) => {
                        self.lower_expression(ctx, key)?;
                        ctx.enc.emit(Opcode::GetElement, &[]);
                    }
                }
                Ok(())
            }
            Expression::Array(elements) => {
                for element in elements {
                    self.lower_expression(ctx, element)?;
                }
                ctx.enc
                    .emit(Opcode::CreateArray, &[elements.len() as u32]);
                Ok(())
            }
            Expression::Object(properties) => {
                ctx.enc.emit(Opcode::CreateObject, &[]);
                for (key, value) in properties {
                    ctx.enc.emit(Opcode::Dup, &[]);
                    self.lower_expression(ctx, value)?;
                    let name_id = self.intern(key);
                    let site = ctx.block.add_ic_site(IcSiteKind::Property);
                    ctx.enc
                        .emit(Opcode::SetProperty, &[name_id, site as u32]);
                    ctx.enc.emit(Opcode::Pop, &[]);
                }
                Ok(())
            }
            Expression::Function { params, body, .. } => {
                let index = self.lower_function(ctx, params, body)?;
                let constant = ctx.block.add_constant(Constant::Function(index));
                ctx.enc.emit(Opcode::LoadConst, &[constant]);
                Ok(())
            }
        }
    }

    fn lower_literal(&mut self, ctx: &mut FnCtx, literal: &Literal) -> Result<(), JsError> {
        match literal {
            Literal::Number(value) => ctx.enc.emit_number(*value),
            Literal::String(text) => {
                let id = self.strings.intern(text);
                ctx.enc.emit_string(id);
            }
            Literal::Boolean(true) => ctx.enc.emit(Opcode::LoadTrue, &[]),
            Literal::Boolean(false) => ctx.enc.emit(Opcode::LoadFalse, &[]),
            Literal::Null => ctx.enc.emit(Opcode::LoadNull, &[]),
            Literal::Undefined => ctx.enc.emit(Opcode::LoadUndefined, &[]),
            Literal::BigInt(digits) => {
                let value = JsBigInt::from_str_radix(digits, 10)?;
                let constant = ctx.block.add_constant(Constant::BigInt(value));
                ctx.enc.emit(Opcode::LoadConst, &[constant]);
            }
        }
        Ok(())
    }

    fn compound_opcode(op: AssignOp) -> Option<Opcode> {
        match op {
            AssignOp::Assign => None,
            AssignOp::AddAssign => Some(Opcode::Add),
            AssignOp::SubAssign => Some(Opcode::Sub),
            AssignOp::MulAssign => Some(Opcode::Mul),
            AssignOp::DivAssign => Some(Opcode::Div),
        }
    }

    fn lower_assignment(
        &mut self,
        ctx: &mut FnCtx,
        op: AssignOp,
        target: &AssignTarget,
        value: &Expression,
    ) -> Result<(), JsError> {
        let compound = Self::compound_opcode(op);
        match target {
            AssignTarget::Identifier(name) => {
                if let Some(binop) = compound {
                    self.emit_load_identifier(ctx, name);
                    self.lower_expression(ctx, value)?;
                    ctx.enc.emit(binop, &[]);
                } else {
                    self.lower_expression(ctx, value)?;
                }
                ctx.enc.emit(Opcode::Dup, &[]);
                self.emit_store_identifier(ctx, name);
                Ok(())
            }
            AssignTarget::Member {
                object,
                property: PropertyKey::Named(name),
            } => {
                self.lower_expression(ctx, object)?;
                let name_id = self.intern(name);
                if let Some(binop) = compound {
                    ctx.enc.emit(Opcode::Dup, &[]);
                    let load_site = ctx.block.add_ic_site(IcSiteKind::Property);
                    ctx.enc
                        .emit(Opcode::GetProperty, &[name_id, load_site as u32]);
                    self.lower_expression(ctx, value)?;
                    ctx.enc.emit(binop, &[]);
                } else {
                    self.lower_expression(ctx, value)?;
                }
                let store_site = ctx.block.add_ic_site(IcSiteKind::Property);
                ctx.enc
                    .emit(Opcode::SetProperty, &[name_id, store_site as u32]);
                Ok(())
            }
            AssignTarget::Member {
                object,
                property: PropertyKey::Computed(key),
            } => {
                self.lower_expression(ctx, object)?;
                self.lower_expression(ctx, key)?;
                if let Some(binop) = compound {
                    // The receiver and key are evaluated a second time for
                    // the read half of the compound store.
                    self.lower_expression(ctx, object)?;
                    self.lower_expression(ctx, key)?;
                    ctx.enc.emit(Opcode::GetElement, &[]);
                    self.lower_expression(ctx, value)?;
                    ctx.enc.emit(binop, &[]);
                } else {
                    self.lower_expression(ctx, value)?;
                }
                ctx.enc.emit(Opcode::SetElement, &[]);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::validate;
    use core_types::StringTable;

    fn num(value: f64) -> Expression {
        Expression::Literal(Literal::Number(value))
    }

    fn ident(name: &str) -> Expression {
        Expression::Identifier(name.to_string())
    }

    fn lower(program: &[Statement]) -> LoweredProgram {
        let strings = StringTable::new();
        lower_program(program, false, &strings).unwrap()
    }

    #[test]
    fn test_empty_program() {
        let lowered = lower(&[]);
        assert_eq!(lowered.functions.len(), 1);
        assert!(validate(&lowered.functions[0]).is_empty());
    }

    #[test]
    fn test_let_and_use() {
        // let x = 1; x
        let program = vec![
            Statement::VariableDeclaration {
                kind: DeclKind::Let,
                declarations: vec![(Pattern::Identifier("x".to_string()), Some(num(1.0)))],
            },
            Statement::Expression(ident("x")),
        ];
        let lowered = lower(&program);
        assert!(validate(&lowered.functions[0]).is_empty());
    }

    #[test]
    fn test_function_declaration_produces_second_block() {
        let program = vec![Statement::FunctionDeclaration {
            name: "f".to_string(),
            params: vec![Pattern::Identifier("n".to_string())],
            body: vec![Statement::Return(Some(ident("n")))],
        }];
        let lowered = lower(&program);
        assert_eq!(lowered.functions.len(), 2);
        assert_eq!(lowered.functions[1].param_count, 1);
        for block in &lowered.functions {
            assert!(validate(block).is_empty(), "block failed validation");
        }
    }

    #[test]
    fn test_loop_shape_validates() {
        // for (let i = 0; i < 10; i++) { }
        let program = vec![Statement::For {
            init: Some(ForInit::Declaration {
                kind: DeclKind::Let,
                declarations: vec![(Pattern::Identifier("i".to_string()), Some(num(0.0)))],
            }),
            test: Some(Expression::Binary {
                op: BinaryOp::LessThan,
                left: Box::new(ident("i")),
                right: Box::new(num(10.0)),
            }),
            update: Some(Expression::Update {
                increment: true,
                prefix: false,
                target: "i".to_string(),
            }),
            body: Box::new(Statement::Block(vec![])),
        }];
        let lowered = lower(&program);
        assert!(validate(&lowered.functions[0]).is_empty());
    }

    #[test]
    fn test_try_catch_builds_exception_table() {
        let program = vec![Statement::Try {
            block: vec![Statement::Throw(num(1.0))],
            catch_param: Some(Pattern::Identifier("e".to_string())),
            handler: Some(vec![Statement::Expression(ident("e"))]),
            finalizer: None,
        }];
        let lowered = lower(&program);
        let block = &lowered.functions[0];
        assert_eq!(block.exception_table.len(), 1);
        assert!(validate(block).is_empty());
    }

    #[test]
    fn test_method_call_gets_method_site() {
        // o.m()
        let program = vec![Statement::Expression(Expression::Call {
            callee: Box::new(Expression::Member {
                object: Box::new(ident("o")),
                property: PropertyKey::Named("m".to_string()),
            }),
            arguments: vec![],
        })];
        let lowered = lower(&program);
        assert_eq!(lowered.functions[0].ic_sites, vec![IcSiteKind::Method]);
    }

    #[test]
    fn test_property_load_gets_property_site() {
        let program = vec![Statement::Expression(Expression::Member {
            object: Box::new(ident("o")),
            property: PropertyKey::Named("x".to_string()),
        })];
        let lowered = lower(&program);
        assert_eq!(lowered.functions[0].ic_sites, vec![IcSiteKind::Property]);
    }

    #[test]
    fn test_trailing_expression_returns_completion() {
        let program = vec![Statement::Expression(num(7.0))];
        let lowered = lower(&program);
        let block = &lowered.functions[0];
        // LoadNumber directly followed by Return
        let mut decoder = block.decoder();
        let mut ops = Vec::new();
        while let Ok(Some(inst)) = decoder.next_instruction() {
            ops.push(inst.opcode);
        }
        assert!(ops.windows(2).any(|w| w == [Opcode::LoadNumber, Opcode::Return]));
        assert!(validate(block).is_empty());
    }

    #[test]
    fn test_logical_and_balances_stack() {
        let program = vec![Statement::Expression(Expression::Logical {
            op: LogicalOp::And,
            left: Box::new(num(1.0)),
            right: Box::new(num(2.0)),
        })];
        let lowered = lower(&program);
        assert!(validate(&lowered.functions[0]).is_empty());
    }
}
