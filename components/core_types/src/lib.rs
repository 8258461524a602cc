//! Core value types for the AeroJS execution engine.
//!
//! This crate provides the foundational types every compilation tier
//! depends on: the NaN-boxed [`Value`], the [`JsBigInt`] arbitrary-precision
//! integer, string and symbol storage, and the error model shared by the
//! bytecode and IR layers.
//!
//! # Overview
//!
//! - [`Value`] - 64-bit NaN-boxed JavaScript value
//! - [`JsBigInt`] - sign + base-2^32 digits arbitrary-precision integer
//! - [`JsString`] / [`StringTable`] - immutable strings with interning
//! - [`SymbolRegistry`] - symbol identity and the global registry
//! - [`Heap`] - engine-scoped primitive storage the values index into
//! - [`JsError`] / [`CompileError`] - runtime and compile-time errors

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod bigint;
mod error;
mod heap;
mod source;
mod string;
mod symbol;
mod value;

pub use bigint::{JsBigInt, Sign};
pub use error::{CompileError, CompileErrorKind, ErrorKind, JsError};
pub use heap::{BigIntId, Heap, ObjectId};
pub use source::{SourcePosition, StackFrame};
pub use string::{JsString, StringId, StringRepr, StringTable, SMALL_STRING_CAPACITY};
pub use symbol::{SymbolId, SymbolRegistry, WellKnownSymbol};
pub use value::{number_to_string, string_to_number, Value};
