//! Bytecode layer for the AeroJS execution core.
//!
//! A function's bytecode is a linear byte stream: a 1-byte opcode followed
//! by typed operands whose widths come from a static opcode table. This
//! crate provides the opcode set, the [`BytecodeBlock`] container, the
//! encoder with label fixups, the table-driven decoder, and a validator
//! that collects diagnostics without throwing.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod block;
mod decoder;
mod encoder;
mod opcode;
mod validator;

pub use block::{BytecodeBlock, Constant, ExceptionTableEntry, IcSiteKind};
pub use decoder::{BytecodeDecoder, DecodeError, DecodedInstruction};
pub use encoder::{BytecodeEncoder, Label};
pub use opcode::{Opcode, OperandType};
pub use validator::validate;
