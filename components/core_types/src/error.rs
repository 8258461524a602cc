//! JavaScript error types and error handling.
//!
//! Runtime errors surface as [`JsError`] values that unwind call frames and
//! honor try/catch. Compile-time problems are collected into
//! [`CompileError`] lists; the caller decides whether a single error aborts
//! the compilation or the whole list is reported.

use crate::{SourcePosition, StackFrame};

/// The kind of JavaScript error.
///
/// These correspond to JavaScript's built-in error constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Type error (e.g., calling a non-function)
    TypeError,
    /// Value out of allowed range
    RangeError,
    /// Reference to an undefined variable
    ReferenceError,
    /// Syntax error in JavaScript code
    SyntaxError,
    /// Internal engine error
    InternalError,
}

impl ErrorKind {
    /// The `name` property of the corresponding Error instance.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

/// A JavaScript error with message and stack trace.
///
/// Represents an exception that can be thrown and caught. The stack is
/// derived from the live call-frame chain's source positions when available.
#[derive(Debug, Clone, PartialEq)]
pub struct JsError {
    /// The type of error
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Stack trace (call stack at the time of the error)
    pub stack: Vec<StackFrame>,
    /// Source position where the error occurred
    pub source_position: Option<SourcePosition>,
}

impl JsError {
    /// Create an error of the given kind with no stack attached yet.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: Vec::new(),
            source_position: None,
        }
    }

    /// Shorthand for a `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// Shorthand for a `RangeError`.
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message)
    }

    /// Shorthand for a `ReferenceError`.
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReferenceError, message)
    }

    /// Shorthand for an internal engine error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl std::fmt::Display for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

/// Compile-time error kinds raised by the bytecode and IR layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompileErrorKind {
    /// Opcode byte out of range
    #[error("invalid opcode")]
    InvalidOpcode,
    /// Operand count does not match the opcode's arity
    #[error("invalid operand count")]
    InvalidOperandCount,
    /// Register id out of range for the function
    #[error("invalid register")]
    InvalidRegister,
    /// Register used before any definition reaches the use
    #[error("undefined register")]
    UndefinedRegister,
    /// Branch or jump target does not resolve to a defined label
    #[error("undefined label")]
    UndefinedLabel,
    /// Two labels share an id
    #[error("duplicate label")]
    DuplicateLabel,
    /// Instruction cannot be reached from the entry block (warning)
    #[error("unreachable code")]
    UnreachableCode,
    /// Operand stack does not balance across a basic block
    #[error("stack imbalance")]
    StackImbalance,
    /// Virtual register count exceeds the configured maximum
    #[error("max registers exceeded")]
    MaxRegistersExceeded,
    /// Cyclic dependency between compilation units
    #[error("cyclic dependency")]
    CyclicDependency,
    /// Bytecode stream ended in the middle of an instruction
    #[error("truncated bytecode")]
    Truncated,
    /// Bytecode stream is malformed (e.g., unresolved jump fixup)
    #[error("invalid bytecode")]
    InvalidBytecode,
}

impl CompileErrorKind {
    /// Whether this kind is reported as a warning rather than an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, CompileErrorKind::UnreachableCode)
    }
}

/// A single compile-time diagnostic.
///
/// Diagnostics are collected into a vector and never panic; `instruction`
/// is the index of the offending instruction in its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// What went wrong
    pub kind: CompileErrorKind,
    /// Index of the offending instruction
    pub instruction: usize,
    /// Human-readable detail
    pub message: String,
}

impl CompileError {
    /// Create a diagnostic for the instruction at `instruction`.
    pub fn new(kind: CompileErrorKind, instruction: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            instruction,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at #{}: {}", self.kind, self.instruction, self.message)
    }
}
