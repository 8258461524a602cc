//! Bytecode stream validator.
//!
//! Runs before IR construction. Diagnostics are collected, never thrown;
//! the caller chooses abort-on-first versus collect-all.

use crate::block::BytecodeBlock;
use crate::decoder::{BytecodeDecoder, DecodeError, DecodedInstruction};
use crate::opcode::Opcode;
use core_types::{CompileError, CompileErrorKind};
use std::collections::HashMap;

/// Validate a bytecode block, returning all diagnostics found.
pub fn validate(block: &BytecodeBlock) -> Vec<CompileError> {
    let mut errors = Vec::new();

    // Decode the whole stream once, remembering instruction boundaries.
    let mut instructions: Vec<DecodedInstruction> = Vec::new();
    let mut boundary_index: HashMap<u32, usize> = HashMap::new();
    let mut decoder = BytecodeDecoder::new(&block.code);
    loop {
        match decoder.next_instruction() {
            Ok(Some(inst)) => {
                boundary_index.insert(inst.offset as u32, instructions.len());
                instructions.push(inst);
            }
            Ok(None) => break,
            Err(DecodeError::InvalidOpcode { byte, offset }) => {
                errors.push(CompileError::new(
                    CompileErrorKind::InvalidOpcode,
                    instructions.len(),
                    format!("opcode byte {:#04x} at offset {}", byte, offset),
                ));
                return errors;
            }
            Err(DecodeError::Truncated { offset }) => {
                errors.push(CompileError::new(
                    CompileErrorKind::Truncated,
                    instructions.len(),
                    format!("stream ends inside instruction at offset {}", offset),
                ));
                return errors;
            }
            Err(DecodeError::SeekOutOfRange { .. }) => unreachable!(),
        }
    }

    for (index, inst) in instructions.iter().enumerate() {
        if inst.opcode.is_jump() && !boundary_index.contains_key(&inst.operands[0]) {
            errors.push(CompileError::new(
                CompileErrorKind::UndefinedLabel,
                index,
                format!(
                    "jump target {} is not an instruction boundary",
                    inst.operands[0]
                ),
            ));
        }
        if inst.opcode == Opcode::LoadConst
            && inst.operands[0] as usize >= block.constants.len()
        {
            errors.push(CompileError::new(
                CompileErrorKind::InvalidBytecode,
                index,
                format!("constant index {} out of range", inst.operands[0]),
            ));
        }
        if matches!(inst.opcode, Opcode::LoadLocal | Opcode::StoreLocal)
            && inst.operands[0] >= block.local_count as u32
        {
            errors.push(CompileError::new(
                CompileErrorKind::InvalidRegister,
                index,
                format!(
                    "local slot {} exceeds declared count {}",
                    inst.operands[0], block.local_count
                ),
            ));
        }
        if inst.opcode == Opcode::GetParameter && inst.operands[0] >= block.param_count as u32 {
            errors.push(CompileError::new(
                CompileErrorKind::InvalidRegister,
                index,
                format!(
                    "parameter {} exceeds declared count {}",
                    inst.operands[0], block.param_count
                ),
            ));
        }
    }

    for entry in &block.exception_table {
        for offset in [entry.try_start, entry.handler_offset] {
            if !boundary_index.contains_key(&offset) && offset != block.code.len() as u32 {
                errors.push(CompileError::new(
                    CompileErrorKind::InvalidBytecode,
                    0,
                    format!("exception-table offset {} is not a boundary", offset),
                ));
            }
        }
    }

    if !errors.iter().any(|e| !e.kind.is_warning()) {
        check_stack_balance(&instructions, &boundary_index, block, &mut errors);
    }
    errors
}

/// Worklist simulation of stack depth across the control-flow graph.
/// A merge with disagreeing depths, or a pop from an empty stack, is a
/// `StackImbalance`.
fn check_stack_balance(
    instructions: &[DecodedInstruction],
    boundary_index: &HashMap<u32, usize>,
    block: &BytecodeBlock,
    errors: &mut Vec<CompileError>,
) {
    let mut depth_at: HashMap<usize, i64> = HashMap::new();
    let mut worklist = vec![(0usize, 0i64)];
    for entry in &block.exception_table {
        if let Some(&index) = boundary_index.get(&entry.handler_offset) {
            // Handlers enter with exactly the thrown value on the stack
            worklist.push((index, 1));
        }
    }

    while let Some((mut index, mut depth)) = worklist.pop() {
        loop {
            if index >= instructions.len() {
                break;
            }
            match depth_at.get(&index) {
                Some(&known) if known == depth => break,
                Some(&known) => {
                    errors.push(CompileError::new(
                        CompileErrorKind::StackImbalance,
                        index,
                        format!("merge with depth {} vs {}", known, depth),
                    ));
                    return;
                }
                None => {
                    depth_at.insert(index, depth);
                }
            }

            let inst = &instructions[index];
            let argc = match inst.opcode {
                Opcode::Call | Opcode::TailCall | Opcode::New | Opcode::CreateArray => {
                    inst.operands[0]
                }
                _ => 0,
            };
            let (pops, pushes) = inst.opcode.stack_effect(argc);
            depth -= pops as i64;
            if depth < 0 {
                errors.push(CompileError::new(
                    CompileErrorKind::StackImbalance,
                    index,
                    "pop from empty operand stack",
                ));
                return;
            }
            depth += pushes as i64;

            if inst.opcode.is_jump() {
                if let Some(&target) = boundary_index.get(&inst.operands[0]) {
                    worklist.push((target, depth));
                }
                if inst.opcode == Opcode::Jump {
                    break;
                }
            }
            if matches!(
                inst.opcode,
                Opcode::Return | Opcode::Throw | Opcode::TailCall
            ) {
                break;
            }
            index += 1;
        }
    }
}
