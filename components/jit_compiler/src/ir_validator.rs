//! IR validation.
//!
//! Runs before optimization. All findings are collected into a list of
//! `(kind, instruction index, message)` diagnostics and never thrown; the
//! caller decides whether a single error aborts. Unreachable instructions
//! are reported as warnings, not errors.

use crate::ir::{BlockId, IrFunction, IrOpcode, Operand};
use core_types::{CompileError, CompileErrorKind};

/// Validator limits.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Maximum virtual registers per function
    pub max_registers: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_registers: 1 << 20,
        }
    }
}

/// Validate an IR function with default limits.
pub fn validate_ir(f: &IrFunction) -> Vec<CompileError> {
    validate_ir_with(f, ValidatorConfig::default())
}

/// Validate an IR function.
pub fn validate_ir_with(f: &IrFunction, config: ValidatorConfig) -> Vec<CompileError> {
    let mut errors = Vec::new();

    if f.reg_count() > config.max_registers {
        errors.push(CompileError::new(
            CompileErrorKind::MaxRegistersExceeded,
            0,
            format!("{} registers exceed limit {}", f.reg_count(), config.max_registers),
        ));
        return errors;
    }

    let reachable = {
        let mut set = vec![false; f.block_count()];
        for block in f.reachable_blocks() {
            set[block.0 as usize] = true;
        }
        for block in f.block_ids() {
            if f.block(block).is_handler {
                for b in handler_closure(f, block) {
                    set[b.0 as usize] = true;
                }
            }
        }
        set
    };

    // Structural checks per instruction
    for block in f.block_ids() {
        let b = f.block(block);
        let live_block = reachable[block.0 as usize];
        if !live_block && !b.instructions.is_empty() {
            errors.push(CompileError::new(
                CompileErrorKind::UnreachableCode,
                b.instructions[0].0 as usize,
                format!("block b{} is unreachable", block.0),
            ));
        }
        for id in f.block_insts(block) {
            let inst = f.inst(id);
            let index = id.0 as usize;
            if !arity_ok(inst.opcode, inst.operands.len()) {
                errors.push(CompileError::new(
                    CompileErrorKind::InvalidOperandCount,
                    index,
                    format!("{:?} with {} operands", inst.opcode, inst.operands.len()),
                ));
            }
            for operand in &inst.operands {
                if let Operand::Label(target) = operand {
                    if target.0 as usize >= f.block_count() {
                        errors.push(CompileError::new(
                            CompileErrorKind::UndefinedLabel,
                            index,
                            format!("label b{} does not exist", target.0),
                        ));
                    }
                }
                if let Some(reg) = operand.as_reg() {
                    if reg.0 >= f.reg_count() {
                        errors.push(CompileError::new(
                            CompileErrorKind::InvalidRegister,
                            index,
                            format!("v{} out of range", reg.0),
                        ));
                    }
                }
            }
            if inst.opcode == IrOpcode::Branch {
                let labels: Vec<BlockId> =
                    inst.operands.iter().filter_map(|o| o.as_label()).collect();
                if labels.len() == 2 && labels[0] == labels[1] {
                    errors.push(CompileError::new(
                        CompileErrorKind::DuplicateLabel,
                        index,
                        "branch with identical targets",
                    ));
                }
            }
            if inst.opcode == IrOpcode::Phi && inst.operands.len() != b.predecessors.len() {
                errors.push(CompileError::new(
                    CompileErrorKind::InvalidOperandCount,
                    index,
                    format!(
                        "phi with {} operands in a block with {} predecessors",
                        inst.operands.len(),
                        b.predecessors.len()
                    ),
                ));
            }
        }
        // Terminator discipline on live blocks
        if live_block {
            match b.instructions.last() {
                None => {
                    if b.phis.is_empty() && block != f.entry {
                        errors.push(CompileError::new(
                            CompileErrorKind::InvalidBytecode,
                            0,
                            format!("block b{} has no instructions", block.0),
                        ));
                    }
                }
                Some(&last) => {
                    if !f.inst(last).opcode.is_terminator() {
                        errors.push(CompileError::new(
                            CompileErrorKind::InvalidBytecode,
                            last.0 as usize,
                            format!("block b{} does not end in a terminator", block.0),
                        ));
                    }
                    for &id in &b.instructions[..b.instructions.len() - 1] {
                        if f.inst(id).opcode.is_terminator() {
                            errors.push(CompileError::new(
                                CompileErrorKind::InvalidBytecode,
                                id.0 as usize,
                                "terminator in the middle of a block",
                            ));
                        }
                    }
                }
            }
        }
    }

    check_defs_reach_uses(f, &reachable, &mut errors);
    errors
}

fn handler_closure(f: &IrFunction, root: BlockId) -> Vec<BlockId> {
    let mut seen = vec![false; f.block_count()];
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(block) = stack.pop() {
        if std::mem::replace(&mut seen[block.0 as usize], true) {
            continue;
        }
        out.push(block);
        stack.extend(f.block(block).successors.iter().copied());
    }
    out
}

/// Every register use must be preceded by a definition on all paths from
/// the entry (parameters are pre-defined). Phi operands are exempt; their
/// values flow along edges.
fn check_defs_reach_uses(
    f: &IrFunction,
    reachable: &[bool],
    errors: &mut Vec<CompileError>,
) {
    let regs = f.reg_count() as usize;
    let blocks = f.block_count();
    let mut defined_in: Vec<Vec<bool>> = vec![vec![true; regs]; blocks];
    let mut seeded = vec![false; regs];
    for p in 0..f.param_count as usize {
        seeded[p] = true;
    }
    defined_in[f.entry.0 as usize] = seeded.clone();
    for block in f.block_ids() {
        if f.block(block).is_handler {
            defined_in[block.0 as usize] = seeded.clone();
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for block in f.block_ids() {
            if !reachable[block.0 as usize] {
                continue;
            }
            let mut out = defined_in[block.0 as usize].clone();
            for id in f.block_insts(block) {
                if let Some(result) = f.inst(id).result {
                    out[result.0 as usize] = true;
                }
            }
            for &succ in &f.block(block).successors {
                if succ == f.entry || f.block(succ).is_handler {
                    continue;
                }
                let target = &mut defined_in[succ.0 as usize];
                for (slot, value) in target.iter_mut().enumerate() {
                    if *value && !out[slot] {
                        *value = false;
                        changed = true;
                    }
                }
            }
        }
    }

    for block in f.block_ids() {
        if !reachable[block.0 as usize] {
            continue;
        }
        let mut defined = defined_in[block.0 as usize].clone();
        for id in &f.block(block).phis {
            if let Some(result) = f.inst(*id).result {
                defined[result.0 as usize] = true;
            }
        }
        for &id in &f.block(block).instructions {
            let inst = f.inst(id);
            for reg in inst.uses() {
                if !defined[reg.0 as usize] {
                    errors.push(CompileError::new(
                        CompileErrorKind::UndefinedRegister,
                        id.0 as usize,
                        format!("v{} used before definition", reg.0),
                    ));
                }
            }
            if let Some(result) = inst.result {
                defined[result.0 as usize] = true;
            }
        }
    }
}

fn arity_ok(opcode: IrOpcode, count: usize) -> bool {
    match opcode {
        IrOpcode::LoadUndefined
        | IrOpcode::LoadNull
        | IrOpcode::LoadThis
        | IrOpcode::CreateObject
        | IrOpcode::CaughtException
        | IrOpcode::Nop => count == 0,
        IrOpcode::LoadConst
        | IrOpcode::LoadBool
        | IrOpcode::LoadString
        | IrOpcode::LoadPool
        | IrOpcode::Move
        | IrOpcode::Neg
        | IrOpcode::BitNot
        | IrOpcode::Not
        | IrOpcode::Jump
        | IrOpcode::GetParameter
        | IrOpcode::LoadGlobal
        | IrOpcode::Throw
        | IrOpcode::VecLoad
        | IrOpcode::FastInvSqrt
        | IrOpcode::FastSin
        | IrOpcode::FastCos
        | IrOpcode::FastExp
        | IrOpcode::FastLog => count == 1,
        IrOpcode::Add
        | IrOpcode::Sub
        | IrOpcode::Mul
        | IrOpcode::Div
        | IrOpcode::Mod
        | IrOpcode::BitAnd
        | IrOpcode::BitOr
        | IrOpcode::BitXor
        | IrOpcode::Shl
        | IrOpcode::Shr
        | IrOpcode::UShr
        | IrOpcode::Eq
        | IrOpcode::Ne
        | IrOpcode::StrictEq
        | IrOpcode::StrictNe
        | IrOpcode::Lt
        | IrOpcode::Le
        | IrOpcode::Gt
        | IrOpcode::Ge
        | IrOpcode::LoadEnv
        | IrOpcode::StoreGlobal
        | IrOpcode::GetElement
        | IrOpcode::Guard
        | IrOpcode::VecStore
        | IrOpcode::VecAdd
        | IrOpcode::VecSub
        | IrOpcode::VecMul
        | IrOpcode::VecDiv => count == 2,
        IrOpcode::Branch
        | IrOpcode::StoreEnv
        | IrOpcode::GetProperty
        | IrOpcode::SetElement
        | IrOpcode::GuardType
        | IrOpcode::VecCompare
        | IrOpcode::Fma => count == 3,
        IrOpcode::SetProperty => count == 4,
        IrOpcode::Return => count <= 1,
        IrOpcode::Call | IrOpcode::Construct => count >= 1,
        IrOpcode::Phi => count >= 1,
        IrOpcode::CreateArray => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrInst, RegClass};

    #[test]
    fn test_clean_function_validates() {
        let mut f = IrFunction::new(0);
        let r = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(r), vec![Operand::ImmI64(1)]),
        );
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(r)]));
        assert!(validate_ir(&f).is_empty());
    }

    #[test]
    fn test_use_before_def_reported() {
        let mut f = IrFunction::new(0);
        let ghost = f.new_reg(RegClass::Int64);
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(ghost)]));
        let errors = validate_ir(&f);
        assert!(errors.iter().any(|e| e.kind == CompileErrorKind::UndefinedRegister));
    }

    #[test]
    fn test_parameters_are_predefined() {
        let mut f = IrFunction::new(2);
        f.emit(
            f.entry,
            IrInst::new(
                IrOpcode::Return,
                None,
                vec![Operand::Reg(crate::ir::VirtualReg(1))],
            ),
        );
        assert!(validate_ir(&f).is_empty());
    }

    #[test]
    fn test_missing_terminator_reported() {
        let mut f = IrFunction::new(0);
        let r = f.new_reg(RegClass::Int64);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::LoadConst, Some(r), vec![Operand::ImmI64(1)]),
        );
        let errors = validate_ir(&f);
        assert!(errors.iter().any(|e| e.kind == CompileErrorKind::InvalidBytecode));
    }

    #[test]
    fn test_bad_label_reported() {
        let mut f = IrFunction::new(0);
        f.emit(
            f.entry,
            IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(BlockId(99))]),
        );
        let errors = validate_ir(&f);
        assert!(errors.iter().any(|e| e.kind == CompileErrorKind::UndefinedLabel));
    }

    #[test]
    fn test_bad_arity_reported() {
        let mut f = IrFunction::new(0);
        let r = f.new_reg(RegClass::Int64);
        f.emit(f.entry, IrInst::new(IrOpcode::Add, Some(r), vec![Operand::ImmI64(1)]));
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![]));
        let errors = validate_ir(&f);
        assert!(errors
            .iter()
            .any(|e| e.kind == CompileErrorKind::InvalidOperandCount));
    }

    #[test]
    fn test_unreachable_is_warning_not_error() {
        let mut f = IrFunction::new(0);
        f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![]));
        let orphan = f.new_block();
        f.emit(orphan, IrInst::new(IrOpcode::Return, None, vec![]));
        let errors = validate_ir(&f);
        assert!(errors.iter().all(|e| e.kind.is_warning()));
        assert!(errors.iter().any(|e| e.kind == CompileErrorKind::UnreachableCode));
    }

    #[test]
    fn test_register_cap() {
        let f = IrFunction::new(0);
        let errors = validate_ir_with(
            &f,
            ValidatorConfig { max_registers: 0 },
        );
        assert!(errors.is_empty(), "zero registers is under any cap");
    }
}
