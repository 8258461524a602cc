//! Scope analysis and symbol resolution.
//!
//! Scopes form a tree stored in a flat, append-only vector; references
//! between scopes are indices, never pointers. The resolver pre-resolves
//! identifier references to `(scope index, function depth, slot)` so the
//! lowering can emit direct local and environment accesses.

use crate::ast::{DeclKind, Expression, ForInit, Pattern, Statement};
use core_types::{ErrorKind, JsError};
use std::collections::HashMap;

/// The kind of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeType {
    /// The program's outermost scope
    Global,
    /// A function body
    Function,
    /// A block, loop head, or catch/finally body
    Block,
    /// A class body
    Class,
}

/// The kind of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var` - binds in the nearest enclosing function or global scope
    Var,
    /// `let`
    Let,
    /// `const`
    Const,
    /// Function parameter
    Parameter,
}

/// A declared symbol.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Declared name
    pub name: String,
    /// Declaration kind
    pub kind: BindingKind,
    /// Index of the owning scope
    pub scope_index: usize,
    /// Flat slot within the owning function's frame
    pub slot: u16,
    /// Sequential id of the defining declaration site
    pub node_id: u32,
}

/// One scope in the tree.
#[derive(Debug, Clone)]
pub struct Scope {
    /// This scope's index in the flat vector
    pub index: usize,
    /// Parent scope index; `None` only for the global scope
    pub parent: Option<usize>,
    /// What kind of scope this is
    pub scope_type: ScopeType,
    /// Number of enclosing function scopes (global = 0)
    pub function_depth: u32,
    /// Child scopes in visit order
    pub children: Vec<usize>,
    bindings: HashMap<String, usize>,
}

/// A resolved identifier reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Index of the owning scope
    pub scope_index: usize,
    /// Function depth of the owning scope
    pub depth: u32,
    /// Flat slot within the owning function's frame
    pub slot: u16,
    /// Kind of the resolved binding
    pub kind: BindingKind,
}

/// The completed scope tree for one program.
#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    slot_counts: HashMap<usize, u16>,
}

impl ScopeTree {
    /// The scope at `index`.
    pub fn scope(&self, index: usize) -> &Scope {
        &self.scopes[index]
    }

    /// Number of scopes.
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether the tree is empty (it never is after analysis).
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// All bindings, in declaration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// The nearest enclosing function or global scope.
    pub fn function_root(&self, mut index: usize) -> usize {
        loop {
            let scope = &self.scopes[index];
            if matches!(scope.scope_type, ScopeType::Global | ScopeType::Function) {
                return index;
            }
            index = scope.parent.expect("non-global scope has a parent");
        }
    }

    /// Number of frame slots the given function root needs.
    pub fn local_count(&self, function_root: usize) -> u16 {
        self.slot_counts.get(&function_root).copied().unwrap_or(0)
    }

    /// Resolve a name lexically, starting from `from` and walking parents.
    pub fn resolve(&self, from: usize, name: &str) -> Option<Resolution> {
        let mut current = Some(from);
        while let Some(index) = current {
            let scope = &self.scopes[index];
            if let Some(&binding_index) = scope.bindings.get(name) {
                let binding = &self.bindings[binding_index];
                return Some(Resolution {
                    scope_index: index,
                    depth: scope.function_depth,
                    slot: binding.slot,
                    kind: binding.kind,
                });
            }
            current = scope.parent;
        }
        None
    }
}

/// Walks the AST and builds the [`ScopeTree`].
pub struct SymbolResolver {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    slot_counts: HashMap<usize, u16>,
    current: usize,
    next_node_id: u32,
}

impl SymbolResolver {
    fn new() -> Self {
        let global = Scope {
            index: 0,
            parent: None,
            scope_type: ScopeType::Global,
            function_depth: 0,
            children: Vec::new(),
            bindings: HashMap::new(),
        };
        Self {
            scopes: vec![global],
            bindings: Vec::new(),
            slot_counts: HashMap::new(),
            current: 0,
            next_node_id: 0,
        }
    }

    /// Analyze a program and return its scope tree.
    pub fn analyze(program: &[Statement]) -> Result<ScopeTree, JsError> {
        let mut resolver = Self::new();
        for statement in program {
            resolver.visit_statement(statement)?;
        }
        Ok(ScopeTree {
            scopes: resolver.scopes,
            bindings: resolver.bindings,
            slot_counts: resolver.slot_counts,
        })
    }

    fn enter_scope(&mut self, scope_type: ScopeType) -> usize {
        let parent = self.current;
        let function_depth = self.scopes[parent].function_depth
            + (scope_type == ScopeType::Function) as u32;
        let index = self.scopes.len();
        self.scopes.push(Scope {
            index,
            parent: Some(parent),
            scope_type,
            function_depth,
            children: Vec::new(),
            bindings: HashMap::new(),
        });
        self.scopes[parent].children.push(index);
        self.current = index;
        index
    }

    fn exit_scope(&mut self) {
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    fn function_root_of_current(&self) -> usize {
        let mut index = self.current;
        loop {
            let scope = &self.scopes[index];
            if matches!(scope.scope_type, ScopeType::Global | ScopeType::Function) {
                return index;
            }
            index = scope.parent.expect("non-global scope has a parent");
        }
    }

    fn declare(&mut self, name: &str, kind: BindingKind) -> Result<(), JsError> {
        // `var` binds in the nearest function or global scope, never a block
        let target = if kind == BindingKind::Var {
            self.function_root_of_current()
        } else {
            self.current
        };

        if let Some(&existing) = self.scopes[target].bindings.get(name) {
            let existing_kind = self.bindings[existing].kind;
            if kind == BindingKind::Var && existing_kind == BindingKind::Var {
                return Ok(()); // var redeclaration reuses the slot
            }
            return Err(JsError::new(
                ErrorKind::SyntaxError,
                format!("Identifier '{}' has already been declared", name),
            ));
        }

        let root = if kind == BindingKind::Var {
            target
        } else {
            // slots are allocated from the enclosing function's frame
            let saved = self.current;
            self.current = target;
            let root = self.function_root_of_current();
            self.current = saved;
            root
        };
        let counter = self.slot_counts.entry(root).or_insert(0);
        let slot = *counter;
        *counter += 1;

        let binding_index = self.bindings.len();
        self.bindings.push(Binding {
            name: name.to_string(),
            kind,
            scope_index: target,
            slot,
            node_id: self.next_node_id,
        });
        self.next_node_id += 1;
        self.scopes[target]
            .bindings
            .insert(name.to_string(), binding_index);
        Ok(())
    }

    fn declare_pattern(&mut self, pattern: &Pattern, kind: BindingKind) -> Result<(), JsError> {
        let mut names = Vec::new();
        pattern.for_each_binding(&mut |name| names.push(name.to_string()));
        for name in names {
            self.declare(&name, kind)?;
        }
        // Default-value expressions may reference earlier bindings
        self.visit_pattern_defaults(pattern)?;
        Ok(())
    }

    fn visit_pattern_defaults(&mut self, pattern: &Pattern) -> Result<(), JsError> {
        match pattern {
            Pattern::Identifier(_) => Ok(()),
            Pattern::Object(props) => {
                for (_, p) in props {
                    self.visit_pattern_defaults(p)?;
                }
                Ok(())
            }
            Pattern::Array(elements) => {
                for p in elements.iter().flatten() {
                    self.visit_pattern_defaults(p)?;
                }
                Ok(())
            }
            Pattern::Default { inner, value } => {
                self.visit_pattern_defaults(inner)?;
                self.visit_expression(value)
            }
            Pattern::Rest(inner) => self.visit_pattern_defaults(inner),
        }
    }

    fn visit_function(
        &mut self,
        params: &[Pattern],
        body: &[Statement],
        name: Option<&str>,
    ) -> Result<(), JsError> {
        self.enter_scope(ScopeType::Function);
        if let Some(name) = name {
            self.declare(name, BindingKind::Let)?;
        }
        for param in params {
            self.declare_pattern(param, BindingKind::Parameter)?;
        }
        for statement in body {
            self.visit_statement(statement)?;
        }
        self.exit_scope();
        Ok(())
    }

    fn visit_statement(&mut self, statement: &Statement) -> Result<(), JsError> {
        match statement {
            Statement::VariableDeclaration { kind, declarations } => {
                let binding_kind = match kind {
                    DeclKind::Var => BindingKind::Var,
                    DeclKind::Let => BindingKind::Let,
                    DeclKind::Const => BindingKind::Const,
                };
                for (pattern, init) in declarations {
                    self.declare_pattern(pattern, binding_kind)?;
                    if let Some(init) = init {
                        self.visit_expression(init)?;
                    }
                }
                Ok(())
            }
            Statement::FunctionDeclaration { name, params, body } => {
                self.declare(name, BindingKind::Var)?;
                self.visit_function(params, body, None)
            }
            Statement::Expression(expr) => self.visit_expression(expr),
            Statement::Return(expr) => {
                if let Some(expr) = expr {
                    self.visit_expression(expr)?;
                }
                Ok(())
            }
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                self.visit_expression(test)?;
                self.visit_statement(consequent)?;
                if let Some(alternate) = alternate {
                    self.visit_statement(alternate)?;
                }
                Ok(())
            }
            Statement::While { test, body } => {
                self.visit_expression(test)?;
                self.visit_statement(body)
            }
            Statement::For {
                init,
                test,
                update,
                body,
            } => {
                self.enter_scope(ScopeType::Block);
                match init {
                    Some(ForInit::Declaration { kind, declarations }) => {
                        let binding_kind = match kind {
                            DeclKind::Var => BindingKind::Var,
                            DeclKind::Let => BindingKind::Let,
                            DeclKind::Const => BindingKind::Const,
                        };
                        for (pattern, init) in declarations {
                            self.declare_pattern(pattern, binding_kind)?;
                            if let Some(init) = init {
                                self.visit_expression(init)?;
                            }
                        }
                    }
                    Some(ForInit::Expression(expr)) => self.visit_expression(expr)?,
                    None => {}
                }
                if let Some(test) = test {
                    self.visit_expression(test)?;
                }
                if let Some(update) = update {
                    self.visit_expression(update)?;
                }
                self.visit_statement(body)?;
                self.exit_scope();
                Ok(())
            }
            Statement::Block(statements) => {
                self.enter_scope(ScopeType::Block);
                for statement in statements {
                    self.visit_statement(statement)?;
                }
                self.exit_scope();
                Ok(())
            }
            Statement::Throw(expr) => self.visit_expression(expr),
            Statement::Try {
                block,
                catch_param,
                handler,
                finalizer,
            } => {
                self.enter_scope(ScopeType::Block);
                for statement in block {
                    self.visit_statement(statement)?;
                }
                self.exit_scope();
                if let Some(handler) = handler {
                    self.enter_scope(ScopeType::Block);
                    if let Some(param) = catch_param {
                        self.declare_pattern(param, BindingKind::Let)?;
                    }
                    for statement in handler {
                        self.visit_statement(statement)?;
                    }
                    self.exit_scope();
                }
                if let Some(finalizer) = finalizer {
                    self.enter_scope(ScopeType::Block);
                    for statement in finalizer {
                        self.visit_statement(statement)?;
                    }
                    self.exit_scope();
                }
                Ok(())
            }
            Statement::Break | Statement::Continue | Statement::Empty => Ok(()),
        }
    }

    fn visit_expression(&mut self, expr: &Expression) -> Result<(), JsError> {
        match expr {
            Expression::Literal(_) | Expression::Identifier(_) | Expression::This => Ok(()),
            Expression::Binary { left, right, .. } | Expression::Logical { left, right, .. } => {
                self.visit_expression(left)?;
                self.visit_expression(right)
            }
            Expression::Unary { argument, .. } => self.visit_expression(argument),
            Expression::Update { .. } => Ok(()),
            Expression::Assignment { target, value, .. } => {
                if let crate::ast::AssignTarget::Member { object, property } = target {
                    self.visit_expression(object)?;
                    if let crate::ast::PropertyKey::Computed(key) = property {
                        self.visit_expression(key)?;
                    }
                }
                self.visit_expression(value)
            }
            Expression::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.visit_expression(test)?;
                self.visit_expression(consequent)?;
                self.visit_expression(alternate)
            }
            Expression::Call { callee, arguments } | Expression::New { callee, arguments } => {
                self.visit_expression(callee)?;
                for argument in arguments {
                    self.visit_expression(argument)?;
                }
                Ok(())
            }
            Expression::Member { object, property } => {
                self.visit_expression(object)?;
                if let crate::ast::PropertyKey::Computed(key) = property {
                    self.visit_expression(key)?;
                }
                Ok(())
            }
            Expression::Array(elements) => {
                for element in elements {
                    self.visit_expression(element)?;
                }
                Ok(())
            }
            Expression::Object(properties) => {
                for (_, value) in properties {
                    self.visit_expression(value)?;
                }
                Ok(())
            }
            Expression::Function { name, params, body } => {
                self.visit_function(params, body, name.as_deref())
            }
        }
    }
}
