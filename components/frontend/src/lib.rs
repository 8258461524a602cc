//! Frontend of the AeroJS execution core: the AST interface produced by
//! the external parser, scope analysis with symbol resolution, and the
//! AST-to-bytecode lowering.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod ast;
mod lowering;
mod scope;

pub use lowering::{lower_program, LoweredProgram};
pub use scope::{Binding, BindingKind, Resolution, Scope, ScopeTree, ScopeType, SymbolResolver};
