//! The embedder-facing JavaScript context.
//!
//! A context owns one realm and exposes the host API: evaluation, global
//! bindings, module import and teardown. The lexer/parser is an external
//! collaborator injected as a [`ParserHook`]; without one, only the direct
//! AST entry points are usable.

use crate::event_loop::{EventLoop, PromiseTable};
use crate::interp::{Interpreter, Realm};
use crate::profile::TraceRuntime;
use core_types::{ErrorKind, JsError, ObjectId, Value};
use frontend::ast::Statement;
use frontend::{lower_program, LoweredProgram};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Options fixed at context creation.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Treat all evaluated code as strict
    pub strict_mode: bool,
    /// Expose a `console` binding
    pub has_console: bool,
    /// Allow `importModule`
    pub has_modules: bool,
    /// Allow shared-memory primitives
    pub has_shared_array_buffer: bool,
    /// BCP-47 locale tag
    pub locale: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            strict_mode: false,
            has_console: true,
            has_modules: false,
            has_shared_array_buffer: false,
            locale: "en-US".to_string(),
        }
    }
}

/// The external parser's interface: source text in, AST out.
pub trait ParserHook {
    /// Parse a script into the AST the lowering consumes.
    fn parse(&self, source: &str, file_name: Option<&str>) -> Result<Vec<Statement>, JsError>;
}

/// Module loading is an external collaborator as well.
pub trait ModuleHook {
    /// Resolve and evaluate a module, returning its namespace value.
    fn import(&self, context: &mut Context, specifier: &str) -> Result<Value, JsError>;
}

/// A JavaScript execution context.
pub struct Context {
    id: u64,
    options: ContextOptions,
    /// The context's mutable engine state
    pub realm: Realm,
    /// Promises owned by this context
    pub promises: PromiseTable,
    /// The context's microtask queue
    pub event_loop: EventLoop,
    parser: Option<Box<dyn ParserHook>>,
    tracer: Option<Box<dyn TraceRuntime>>,
    destroyed: bool,
}

impl Context {
    /// Create a context with the given options.
    pub fn create(options: ContextOptions) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            realm: Realm::new(),
            promises: PromiseTable::new(),
            event_loop: EventLoop::new(),
            parser: None,
            tracer: None,
            destroyed: false,
        }
    }

    /// The opaque context id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The creation options.
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Install the external parser.
    pub fn set_parser(&mut self, parser: Box<dyn ParserHook>) {
        self.parser = Some(parser);
    }

    /// Install the tracing JIT behind the dispatch seam.
    pub fn set_tracer(&mut self, tracer: Box<dyn TraceRuntime>) {
        self.tracer = Some(tracer);
    }

    /// Take the installed tracer back out (e.g. to inspect its state).
    pub fn take_tracer(&mut self) -> Option<Box<dyn TraceRuntime>> {
        self.tracer.take()
    }

    fn check_alive(&self) -> Result<(), JsError> {
        if self.destroyed {
            return Err(JsError::new(
                ErrorKind::InternalError,
                "Context has been destroyed",
            ));
        }
        Ok(())
    }

    /// Evaluate source text. Requires an installed [`ParserHook`].
    pub fn evaluate(&mut self, code: &str, file_name: Option<&str>) -> Result<Value, JsError> {
        self.check_alive()?;
        let parser = self.parser.take().ok_or_else(|| {
            JsError::new(
                ErrorKind::InternalError,
                "No parser installed on this context",
            )
        })?;
        let parsed = parser.parse(code, file_name);
        self.parser = Some(parser);
        self.evaluate_program(&parsed?)
    }

    /// Evaluate an already-parsed program.
    pub fn evaluate_program(&mut self, program: &[Statement]) -> Result<Value, JsError> {
        self.check_alive()?;
        let lowered = lower_program(program, self.options.strict_mode, &self.realm.heap.strings)?;
        self.run_lowered(&lowered)
    }

    /// Execute a lowered program in this context's realm.
    pub fn run_lowered(&mut self, lowered: &LoweredProgram) -> Result<Value, JsError> {
        self.check_alive()?;
        // Each script gets a fresh global environment; its top-level
        // bindings are exported by name below so later scripts see them.
        self.realm.global_env = self.realm.envs.alloc(None, 0);
        let result = {
            let mut interp = Interpreter::new(&mut self.realm, lowered);
            if let Some(tracer) = self.tracer.as_deref_mut() {
                interp = interp.with_tracer(tracer);
            }
            interp.run()
        };
        let env = self.realm.global_env;
        for binding in lowered.scopes.bindings() {
            if binding.scope_index == 0 {
                let name = self.realm.heap.strings.intern(&binding.name);
                let value = self.realm.envs.read(env, 0, binding.slot);
                self.realm.globals.insert(name, value);
            }
        }
        self.event_loop.run_jobs(&mut self.promises);
        result
    }

    /// Bind a global by name.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), JsError> {
        self.check_alive()?;
        let id = self.realm.heap.strings.intern(name);
        self.realm.globals.insert(id, value);
        Ok(())
    }

    /// Read a global by name.
    pub fn get_global(&mut self, name: &str) -> Result<Value, JsError> {
        self.check_alive()?;
        let id = self.realm.heap.strings.intern(name);
        Ok(self
            .realm
            .globals
            .get(&id)
            .copied()
            .unwrap_or(Value::undefined()))
    }

    /// Remove a global binding; returns whether it existed.
    pub fn delete_global(&mut self, name: &str) -> Result<bool, JsError> {
        self.check_alive()?;
        let id = self.realm.heap.strings.intern(name);
        Ok(self.realm.globals.remove(&id).is_some())
    }

    /// Import a module through the module hook.
    pub fn import_module(
        &mut self,
        hook: &dyn ModuleHook,
        specifier: &str,
    ) -> Result<Value, JsError> {
        self.check_alive()?;
        if !self.options.has_modules {
            return Err(JsError::type_error("Modules are disabled for this context"));
        }
        hook.import(self, specifier)
    }

    /// The global object.
    pub fn global_object(&self) -> ObjectId {
        self.realm.global_object
    }

    /// Tear the context down. Idempotent; all further operations fail.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.realm.globals.clear();
        tracing::debug!(context_id = self.id, "context destroyed");
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontend::ast::{Expression, Literal};

    #[test]
    fn test_context_ids_are_unique() {
        let a = Context::create(ContextOptions::default());
        let b = Context::create(ContextOptions::default());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_globals_roundtrip() {
        let mut context = Context::create(ContextOptions::default());
        context.set_global("answer", Value::int32(42)).unwrap();
        assert_eq!(context.get_global("answer").unwrap(), Value::int32(42));
        assert!(context.delete_global("answer").unwrap());
        assert!(!context.delete_global("answer").unwrap());
        assert_eq!(context.get_global("answer").unwrap(), Value::undefined());
    }

    #[test]
    fn test_destroy_is_idempotent_and_invalidates() {
        let mut context = Context::create(ContextOptions::default());
        context.destroy();
        context.destroy();
        assert!(context.is_destroyed());
        assert!(context.set_global("x", Value::null()).is_err());
        assert!(context.evaluate_program(&[]).is_err());
    }

    #[test]
    fn test_evaluate_without_parser_fails() {
        let mut context = Context::create(ContextOptions::default());
        let err = context.evaluate("1 + 1", None).unwrap_err();
        assert!(err.message.contains("parser"));
    }

    #[test]
    fn test_evaluate_program_returns_completion() {
        let mut context = Context::create(ContextOptions::default());
        let program = vec![Statement::Expression(Expression::Literal(Literal::Number(
            7.0,
        )))];
        let value = context.evaluate_program(&program).unwrap();
        assert_eq!(value.as_number(), Some(7.0));
    }

    #[test]
    fn test_top_level_bindings_visible_to_later_scripts() {
        use frontend::ast::*;
        let mut context = Context::create(ContextOptions::default());
        let first = vec![Statement::VariableDeclaration {
            kind: DeclKind::Let,
            declarations: vec![(
                Pattern::Identifier("x".to_string()),
                Some(Expression::Literal(Literal::Number(5.0))),
            )],
        }];
        context.evaluate_program(&first).unwrap();
        let second = vec![Statement::Expression(Expression::Identifier(
            "x".to_string(),
        ))];
        let value = context.evaluate_program(&second).unwrap();
        assert_eq!(value.as_number(), Some(5.0));
    }

    #[test]
    fn test_modules_disabled_by_default() {
        struct NullModules;
        impl ModuleHook for NullModules {
            fn import(&self, _: &mut Context, _: &str) -> Result<Value, JsError> {
                Ok(Value::undefined())
            }
        }
        let mut context = Context::create(ContextOptions::default());
        assert!(context.import_module(&NullModules, "m").is_err());
    }
}
