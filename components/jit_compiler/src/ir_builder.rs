//! Bytecode to IR construction.
//!
//! Two passes. Block discovery scans the bytecode linearly and records a
//! block start at offset 0, at every jump target, at every exception
//! handler, and after every terminator. Lowering then simulates the
//! operand stack per block, turning stack traffic into virtual registers;
//! values flowing across block boundaries become phi operands at merge
//! points and plain moves on single-predecessor edges. Unreachable blocks
//! are pruned (handler blocks are preserved) and loop headers are marked
//! from DFS back edges.

use crate::ir::{BlockId, IrFunction, IrInst, IrOpcode, Operand, RegClass, VirtualReg};
use bytecode_system::{BytecodeBlock, Constant, DecodedInstruction, Opcode};
use core_types::{CompileError, CompileErrorKind};
use std::collections::{BTreeMap, HashMap};

/// Build an IR function from a bytecode block.
pub fn build_ir(block: &BytecodeBlock) -> Result<IrFunction, CompileError> {
    Builder::new(block)?.lower()
}

struct Builder<'a> {
    bytecode: &'a BytecodeBlock,
    instructions: Vec<DecodedInstruction>,
    // offset -> index into `instructions`
    by_offset: HashMap<u32, usize>,
    // block start offset -> IR block (filled in lower())
    starts: BTreeMap<u32, BlockId>,
    handler_offsets: Vec<u32>,
}

impl<'a> Builder<'a> {
    fn new(bytecode: &'a BytecodeBlock) -> Result<Self, CompileError> {
        let mut instructions = Vec::new();
        let mut by_offset = HashMap::new();
        let mut decoder = bytecode.decoder();
        loop {
            match decoder.next_instruction() {
                Ok(Some(inst)) => {
                    by_offset.insert(inst.offset as u32, instructions.len());
                    instructions.push(inst);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(CompileError::new(
                        CompileErrorKind::InvalidBytecode,
                        instructions.len(),
                        e.to_string(),
                    ))
                }
            }
        }

        // Pass 1: block discovery
        let mut starts = BTreeMap::new();
        starts.insert(0u32, BlockId(0));
        for (index, inst) in instructions.iter().enumerate() {
            if inst.opcode.is_jump() {
                starts.insert(inst.operands[0], BlockId(0));
            }
            if inst.opcode.is_terminator() {
                if let Some(next) = instructions.get(index + 1) {
                    starts.insert(next.offset as u32, BlockId(0));
                }
            }
        }
        let mut handler_offsets = Vec::new();
        for entry in &bytecode.exception_table {
            starts.insert(entry.handler_offset, BlockId(0));
            handler_offsets.push(entry.handler_offset);
        }

        Ok(Self {
            bytecode,
            instructions,
            by_offset,
            starts,
            handler_offsets,
        })
    }

    fn lower(mut self) -> Result<IrFunction, CompileError> {
        let mut f = IrFunction::new(self.bytecode.param_count as u32);

        // One block per discovered start, plus synthetic entry and exit
        let offsets: Vec<u32> = self.starts.keys().copied().collect();
        for offset in &offsets {
            let block = f.new_block();
            self.starts.insert(*offset, block);
        }
        let exit = f.new_block();
        f.emit(exit, IrInst::new(IrOpcode::Return, None, vec![]));

        if let Some(&first) = self.starts.get(&0) {
            f.emit(
                f.entry,
                IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(first)]),
            );
            f.add_edge(f.entry, first);
        }
        for offset in &self.handler_offsets {
            let block = self.starts[offset];
            f.block_mut(block).is_handler = true;
        }

        // Entry stack depths via worklist; handlers enter with the thrown
        // value on the stack
        let depths = self.compute_entry_depths()?;

        // Fresh entry registers per block and stack slot
        let mut entry_regs: HashMap<u32, Vec<VirtualReg>> = HashMap::new();
        for offset in &offsets {
            let depth = depths.get(offset).copied().unwrap_or(0);
            let regs = (0..depth).map(|_| f.new_reg(RegClass::Int64)).collect();
            entry_regs.insert(*offset, regs);
        }

        // Pass 2: lower each block, recording the exit stack per edge
        let mut edge_stacks: Vec<(BlockId, BlockId, Vec<VirtualReg>)> = Vec::new();
        for (span_index, start_offset) in offsets.iter().enumerate() {
            let block = self.starts[start_offset];
            let end_offset = offsets.get(span_index + 1).copied();
            // The unwinder delivers the thrown value at handler entries
            if f.block(block).is_handler {
                if let Some(&exception_reg) = entry_regs[start_offset].first() {
                    f.emit(
                        block,
                        IrInst::new(IrOpcode::CaughtException, Some(exception_reg), vec![]),
                    );
                }
            }
            self.lower_span(
                &mut f,
                block,
                *start_offset,
                end_offset,
                exit,
                entry_regs[start_offset].clone(),
                &mut edge_stacks,
            )?;
        }

        // Stitch cross-block stack values: phis at merges, moves otherwise
        self.stitch_edges(&mut f, &edge_stacks, &entry_regs)?;

        prune_unreachable(&mut f);
        f.detect_loop_headers();
        Ok(f)
    }

    fn compute_entry_depths(&self) -> Result<HashMap<u32, u32>, CompileError> {
        let mut depths: HashMap<u32, u32> = HashMap::new();
        let mut worklist = vec![(0u32, 0u32)];
        for offset in &self.handler_offsets {
            worklist.push((*offset, 1));
        }
        while let Some((start, mut depth)) = worklist.pop() {
            match depths.get(&start) {
                Some(&known) if known == depth => continue,
                Some(&known) => {
                    return Err(CompileError::new(
                        CompileErrorKind::StackImbalance,
                        self.by_offset.get(&start).copied().unwrap_or(0),
                        format!("entry depth {} vs {}", known, depth),
                    ));
                }
                None => {
                    depths.insert(start, depth);
                }
            }
            let mut index = match self.by_offset.get(&start) {
                Some(&i) => i,
                None => continue,
            };
            loop {
                let Some(inst) = self.instructions.get(index) else {
                    break;
                };
                if inst.offset as u32 != start && self.starts.contains_key(&(inst.offset as u32)) {
                    worklist.push((inst.offset as u32, depth));
                    break;
                }
                let argc = call_family_argc(inst);
                let (pops, pushes) = inst.opcode.stack_effect(argc);
                depth = depth
                    .checked_sub(pops)
                    .ok_or_else(|| {
                        CompileError::new(
                            CompileErrorKind::StackImbalance,
                            index,
                            "stack underflow during block discovery",
                        )
                    })?
                    + pushes;
                if inst.opcode.is_jump() {
                    worklist.push((inst.operands[0], depth));
                }
                if matches!(inst.opcode, Opcode::Jump | Opcode::Return | Opcode::Throw | Opcode::TailCall) {
                    break;
                }
                index += 1;
            }
        }
        Ok(depths)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_span(
        &self,
        f: &mut IrFunction,
        block: BlockId,
        start_offset: u32,
        end_offset: Option<u32>,
        exit: BlockId,
        mut stack: Vec<VirtualReg>,
        edges: &mut Vec<(BlockId, BlockId, Vec<VirtualReg>)>,
    ) -> Result<(), CompileError> {
        let mut index = match self.by_offset.get(&start_offset) {
            Some(&i) => i,
            None => return Ok(()),
        };
        let mut pop = |stack: &mut Vec<VirtualReg>, index: usize| {
            stack.pop().ok_or_else(|| {
                CompileError::new(CompileErrorKind::StackImbalance, index, "operand stack empty")
            })
        };

        loop {
            let Some(inst) = self.instructions.get(index) else {
                // fell off the end of the stream
                f.emit(block, IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(exit)]));
                f.add_edge(block, exit);
                return Ok(());
            };
            let offset = inst.offset as u32;
            if Some(offset) == end_offset {
                // Fallthrough into the next block
                let next = self.starts[&offset];
                f.emit(block, IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(next)]));
                f.add_edge(block, next);
                edges.push((block, next, stack));
                return Ok(());
            }
            let position = Some(offset);
            let mut push_inst = |f: &mut IrFunction,
                                 stack: &mut Vec<VirtualReg>,
                                 opcode: IrOpcode,
                                 operands: Vec<Operand>| {
                let result = f.new_reg(RegClass::Int64);
                let mut ir = IrInst::new(opcode, Some(result), operands);
                ir.position = position;
                f.emit(block, ir);
                stack.push(result);
            };

            match inst.opcode {
                Opcode::Nop | Opcode::Phi | Opcode::FunctionHeader => {}
                Opcode::LoadUndefined => {
                    push_inst(f, &mut stack, IrOpcode::LoadUndefined, vec![])
                }
                Opcode::LoadNull => push_inst(f, &mut stack, IrOpcode::LoadNull, vec![]),
                Opcode::LoadTrue => {
                    push_inst(f, &mut stack, IrOpcode::LoadBool, vec![Operand::ImmI64(1)])
                }
                Opcode::LoadFalse => {
                    push_inst(f, &mut stack, IrOpcode::LoadBool, vec![Operand::ImmI64(0)])
                }
                Opcode::LoadNumber => {
                    let n = inst.number_operand();
                    let operand = if n.fract() == 0.0
                        && (i32::MIN as f64..=i32::MAX as f64).contains(&n)
                        && !(n == 0.0 && n.is_sign_negative())
                    {
                        Operand::ImmI64(n as i64)
                    } else {
                        Operand::ImmF64(n)
                    };
                    push_inst(f, &mut stack, IrOpcode::LoadConst, vec![operand]);
                }
                Opcode::LoadString => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::LoadString,
                    vec![Operand::ImmI64(inst.operands[0] as i64)],
                ),
                Opcode::LoadConst => {
                    let pool_index = inst.operands[0] as usize;
                    match self.bytecode.constants.get(pool_index) {
                        Some(Constant::Number(n)) => {
                            push_inst(f, &mut stack, IrOpcode::LoadConst, vec![Operand::ImmF64(*n)])
                        }
                        Some(Constant::String(id)) => push_inst(
                            f,
                            &mut stack,
                            IrOpcode::LoadString,
                            vec![Operand::ImmI64(id.0 as i64)],
                        ),
                        _ => push_inst(
                            f,
                            &mut stack,
                            IrOpcode::LoadPool,
                            vec![Operand::ImmI64(pool_index as i64)],
                        ),
                    }
                }
                Opcode::LoadLocal => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::LoadEnv,
                    vec![Operand::ImmI64(0), Operand::ImmI64(inst.operands[0] as i64)],
                ),
                Opcode::StoreLocal => {
                    let value = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::StoreEnv,
                        None,
                        vec![
                            Operand::ImmI64(0),
                            Operand::ImmI64(inst.operands[0] as i64),
                            Operand::Reg(value),
                        ],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                }
                Opcode::LoadVar => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::LoadEnv,
                    vec![
                        Operand::ImmI64(inst.operands[0] as i64),
                        Operand::ImmI64(inst.operands[1] as i64),
                    ],
                ),
                Opcode::StoreVar => {
                    let value = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::StoreEnv,
                        None,
                        vec![
                            Operand::ImmI64(inst.operands[0] as i64),
                            Operand::ImmI64(inst.operands[1] as i64),
                            Operand::Reg(value),
                        ],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                }
                Opcode::GetParameter => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::GetParameter,
                    vec![Operand::ImmI64(inst.operands[0] as i64)],
                ),
                Opcode::LoadGlobal => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::LoadGlobal,
                    vec![Operand::ImmI64(inst.operands[0] as i64)],
                ),
                Opcode::StoreGlobal => {
                    let value = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::StoreGlobal,
                        None,
                        vec![Operand::ImmI64(inst.operands[0] as i64), Operand::Reg(value)],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                }
                Opcode::LoadThis => push_inst(f, &mut stack, IrOpcode::LoadThis, vec![]),
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::BitAnd
                | Opcode::BitOr
                | Opcode::BitXor
                | Opcode::ShiftLeft
                | Opcode::ShiftRight
                | Opcode::UShiftRight
                | Opcode::Equal
                | Opcode::NotEqual
                | Opcode::StrictEqual
                | Opcode::StrictNotEqual
                | Opcode::LessThan
                | Opcode::LessThanOrEqual
                | Opcode::GreaterThan
                | Opcode::GreaterThanOrEqual => {
                    let b = pop(&mut stack, index)?;
                    let a = pop(&mut stack, index)?;
                    push_inst(
                        f,
                        &mut stack,
                        binary_ir_opcode(inst.opcode),
                        vec![Operand::Reg(a), Operand::Reg(b)],
                    );
                }
                Opcode::Neg | Opcode::BitNot | Opcode::Not => {
                    let a = pop(&mut stack, index)?;
                    let opcode = match inst.opcode {
                        Opcode::Neg => IrOpcode::Neg,
                        Opcode::BitNot => IrOpcode::BitNot,
                        _ => IrOpcode::Not,
                    };
                    push_inst(f, &mut stack, opcode, vec![Operand::Reg(a)]);
                }
                Opcode::Jump => {
                    let target = self.starts[&inst.operands[0]];
                    f.emit(block, IrInst::new(IrOpcode::Jump, None, vec![Operand::Label(target)]));
                    f.add_edge(block, target);
                    edges.push((block, target, stack));
                    return Ok(());
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let cond = pop(&mut stack, index)?;
                    let target = self.starts[&inst.operands[0]];
                    let fall_offset = self
                        .instructions
                        .get(index + 1)
                        .map(|i| i.offset as u32)
                        .unwrap_or(u32::MAX);
                    let fall = self.starts.get(&fall_offset).copied().unwrap_or(exit);
                    let (then_block, else_block) = if inst.opcode == Opcode::JumpIfTrue {
                        (target, fall)
                    } else {
                        (fall, target)
                    };
                    f.emit(
                        block,
                        IrInst::new(
                            IrOpcode::Branch,
                            None,
                            vec![
                                Operand::Reg(cond),
                                Operand::Label(then_block),
                                Operand::Label(else_block),
                            ],
                        ),
                    );
                    f.add_edge(block, then_block);
                    f.add_edge(block, else_block);
                    edges.push((block, target, stack.clone()));
                    edges.push((block, fall, stack));
                    return Ok(());
                }
                Opcode::Call | Opcode::New => {
                    let argc = inst.operands[0] as usize;
                    let mut args = Vec::with_capacity(argc + 1);
                    for _ in 0..argc {
                        args.push(pop(&mut stack, index)?);
                    }
                    args.reverse();
                    let callee = pop(&mut stack, index)?;
                    let mut operands = vec![Operand::Reg(callee)];
                    operands.extend(args.into_iter().map(Operand::Reg));
                    let opcode = if inst.opcode == Opcode::Call {
                        IrOpcode::Call
                    } else {
                        IrOpcode::Construct
                    };
                    push_inst(f, &mut stack, opcode, operands);
                }
                Opcode::TailCall => {
                    let argc = inst.operands[0] as usize;
                    let mut args = Vec::with_capacity(argc + 1);
                    for _ in 0..argc {
                        args.push(pop(&mut stack, index)?);
                    }
                    args.reverse();
                    let callee = pop(&mut stack, index)?;
                    let mut operands = vec![Operand::Reg(callee)];
                    operands.extend(args.into_iter().map(Operand::Reg));
                    let result = f.new_reg(RegClass::Int64);
                    let mut ir = IrInst::new(IrOpcode::Call, Some(result), operands);
                    ir.position = position;
                    f.emit(block, ir);
                    f.emit(block, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(result)]));
                    f.add_edge(block, exit);
                    return Ok(());
                }
                Opcode::Return => {
                    let value = pop(&mut stack, index)?;
                    f.emit(block, IrInst::new(IrOpcode::Return, None, vec![Operand::Reg(value)]));
                    f.add_edge(block, exit);
                    return Ok(());
                }
                Opcode::Throw => {
                    let value = pop(&mut stack, index)?;
                    f.emit(block, IrInst::new(IrOpcode::Throw, None, vec![Operand::Reg(value)]));
                    f.add_edge(block, exit);
                    return Ok(());
                }
                Opcode::GetProperty => {
                    let object = pop(&mut stack, index)?;
                    push_inst(
                        f,
                        &mut stack,
                        IrOpcode::GetProperty,
                        vec![
                            Operand::Reg(object),
                            Operand::ImmI64(inst.operands[0] as i64),
                            Operand::ImmI64(inst.operands[1] as i64),
                        ],
                    );
                }
                Opcode::SetProperty => {
                    let value = pop(&mut stack, index)?;
                    let object = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::SetProperty,
                        None,
                        vec![
                            Operand::Reg(object),
                            Operand::Reg(value),
                            Operand::ImmI64(inst.operands[0] as i64),
                            Operand::ImmI64(inst.operands[1] as i64),
                        ],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                    stack.push(value);
                }
                Opcode::GetElement => {
                    let key = pop(&mut stack, index)?;
                    let object = pop(&mut stack, index)?;
                    push_inst(
                        f,
                        &mut stack,
                        IrOpcode::GetElement,
                        vec![Operand::Reg(object), Operand::Reg(key)],
                    );
                }
                Opcode::SetElement => {
                    let value = pop(&mut stack, index)?;
                    let key = pop(&mut stack, index)?;
                    let object = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::SetElement,
                        None,
                        vec![Operand::Reg(object), Operand::Reg(key), Operand::Reg(value)],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                    stack.push(value);
                }
                Opcode::CreateObject => push_inst(f, &mut stack, IrOpcode::CreateObject, vec![]),
                Opcode::CreateArray => {
                    let count = inst.operands[0] as usize;
                    let mut elements = Vec::with_capacity(count);
                    for _ in 0..count {
                        elements.push(pop(&mut stack, index)?);
                    }
                    elements.reverse();
                    push_inst(
                        f,
                        &mut stack,
                        IrOpcode::CreateArray,
                        elements.into_iter().map(Operand::Reg).collect(),
                    );
                }
                Opcode::Pop => {
                    pop(&mut stack, index)?;
                }
                Opcode::Dup => {
                    let top = *stack.last().ok_or_else(|| {
                        CompileError::new(CompileErrorKind::StackImbalance, index, "dup on empty stack")
                    })?;
                    stack.push(top);
                }
                Opcode::SimdLoad => push_inst(
                    f,
                    &mut stack,
                    IrOpcode::VecLoad,
                    vec![Operand::ImmI64(inst.operands[0] as i64)],
                ),
                Opcode::SimdStore => {
                    let value = pop(&mut stack, index)?;
                    let mut ir = IrInst::new(
                        IrOpcode::VecStore,
                        None,
                        vec![Operand::ImmI64(inst.operands[0] as i64), Operand::Reg(value)],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                }
                Opcode::SimdAdd | Opcode::SimdSub | Opcode::SimdMul | Opcode::SimdDiv => {
                    let b = pop(&mut stack, index)?;
                    let a = pop(&mut stack, index)?;
                    let opcode = match inst.opcode {
                        Opcode::SimdAdd => IrOpcode::VecAdd,
                        Opcode::SimdSub => IrOpcode::VecSub,
                        Opcode::SimdMul => IrOpcode::VecMul,
                        _ => IrOpcode::VecDiv,
                    };
                    let result = f.new_reg(RegClass::Vector);
                    let mut ir = IrInst::new(opcode, Some(result), vec![Operand::Reg(a), Operand::Reg(b)]);
                    ir.position = position;
                    f.emit(block, ir);
                    stack.push(result);
                }
                Opcode::SimdCompare => {
                    let b = pop(&mut stack, index)?;
                    let a = pop(&mut stack, index)?;
                    let result = f.new_reg(RegClass::Vector);
                    let mut ir = IrInst::new(
                        IrOpcode::VecCompare,
                        Some(result),
                        vec![
                            Operand::Reg(a),
                            Operand::Reg(b),
                            Operand::ImmI64(inst.operands[0] as i64),
                        ],
                    );
                    ir.position = position;
                    f.emit(block, ir);
                    stack.push(result);
                }
                Opcode::Fma => {
                    let c = pop(&mut stack, index)?;
                    let b = pop(&mut stack, index)?;
                    let a = pop(&mut stack, index)?;
                    push_inst(
                        f,
                        &mut stack,
                        IrOpcode::Fma,
                        vec![Operand::Reg(a), Operand::Reg(b), Operand::Reg(c)],
                    );
                }
                Opcode::FastInvSqrt
                | Opcode::FastSin
                | Opcode::FastCos
                | Opcode::FastExp
                | Opcode::FastLog => {
                    let a = pop(&mut stack, index)?;
                    let opcode = match inst.opcode {
                        Opcode::FastInvSqrt => IrOpcode::FastInvSqrt,
                        Opcode::FastSin => IrOpcode::FastSin,
                        Opcode::FastCos => IrOpcode::FastCos,
                        Opcode::FastExp => IrOpcode::FastExp,
                        _ => IrOpcode::FastLog,
                    };
                    push_inst(f, &mut stack, opcode, vec![Operand::Reg(a)]);
                }
                Opcode::Await | Opcode::Yield => {
                    return Err(CompileError::new(
                        CompileErrorKind::InvalidOpcode,
                        index,
                        "suspension points are not compiled; the frame stays interpreted",
                    ));
                }
            }
            index += 1;
        }
    }

    fn stitch_edges(
        &self,
        f: &mut IrFunction,
        edges: &[(BlockId, BlockId, Vec<VirtualReg>)],
        entry_regs: &HashMap<u32, Vec<VirtualReg>>,
    ) -> Result<(), CompileError> {
        // Group incoming stacks per successor, keyed in predecessor order
        let mut incoming: HashMap<BlockId, Vec<(BlockId, Vec<VirtualReg>)>> = HashMap::new();
        for (pred, succ, stack) in edges {
            incoming.entry(*succ).or_default().push((*pred, stack.clone()));
        }
        let block_for_offset: HashMap<BlockId, u32> =
            self.starts.iter().map(|(offset, block)| (*block, *offset)).collect();

        for (succ, mut preds) in incoming {
            let Some(offset) = block_for_offset.get(&succ) else {
                continue; // exit block
            };
            let targets = &entry_regs[offset];
            if targets.is_empty() {
                continue;
            }
            // Stable order: match the block's predecessor list
            let order: Vec<BlockId> = f.block(succ).predecessors.clone();
            preds.sort_by_key(|(pred, _)| order.iter().position(|p| p == pred));

            if preds.len() == 1 {
                let (pred, stack) = &preds[0];
                for (slot, target) in targets.iter().enumerate() {
                    let source = stack[slot];
                    insert_before_terminator(
                        f,
                        *pred,
                        IrInst::new(IrOpcode::Move, Some(*target), vec![Operand::Reg(source)]),
                    );
                }
            } else {
                for (slot, target) in targets.iter().enumerate() {
                    let operands: Vec<Operand> = preds
                        .iter()
                        .map(|(_, stack)| Operand::Reg(stack[slot]))
                        .collect();
                    // A phi is only needed when definitions differ; a value
                    // reaching the merge identically from every side
                    // dominates it and a per-edge copy suffices
                    let first = operands.first().copied();
                    let all_same = operands.iter().all(|op| Some(*op) == first);
                    if all_same {
                        if let Some(Operand::Reg(source)) = first {
                            for (pred, _) in &preds {
                                insert_before_terminator(
                                    f,
                                    *pred,
                                    IrInst::new(
                                        IrOpcode::Move,
                                        Some(*target),
                                        vec![Operand::Reg(source)],
                                    ),
                                );
                            }
                            continue;
                        }
                    }
                    f.emit_phi(succ, IrInst::new(IrOpcode::Phi, Some(*target), operands));
                }
            }
        }
        Ok(())
    }
}

fn insert_before_terminator(f: &mut IrFunction, block: BlockId, inst: IrInst) {
    let id = f.emit(block, inst);
    let instructions = &mut f.block_mut(block).instructions;
    // emit() appended after the terminator; swap it into place
    if instructions.len() >= 2 {
        let last = instructions.len() - 1;
        instructions.swap(last, last - 1);
    }
    let _ = id;
}

fn call_family_argc(inst: &DecodedInstruction) -> u32 {
    match inst.opcode {
        Opcode::Call | Opcode::TailCall | Opcode::New | Opcode::CreateArray => inst.operands[0],
        _ => 0,
    }
}

fn binary_ir_opcode(opcode: Opcode) -> IrOpcode {
    match opcode {
        Opcode::Add => IrOpcode::Add,
        Opcode::Sub => IrOpcode::Sub,
        Opcode::Mul => IrOpcode::Mul,
        Opcode::Div => IrOpcode::Div,
        Opcode::Mod => IrOpcode::Mod,
        Opcode::BitAnd => IrOpcode::BitAnd,
        Opcode::BitOr => IrOpcode::BitOr,
        Opcode::BitXor => IrOpcode::BitXor,
        Opcode::ShiftLeft => IrOpcode::Shl,
        Opcode::ShiftRight => IrOpcode::Shr,
        Opcode::UShiftRight => IrOpcode::UShr,
        Opcode::Equal => IrOpcode::Eq,
        Opcode::NotEqual => IrOpcode::Ne,
        Opcode::StrictEqual => IrOpcode::StrictEq,
        Opcode::StrictNotEqual => IrOpcode::StrictNe,
        Opcode::LessThan => IrOpcode::Lt,
        Opcode::LessThanOrEqual => IrOpcode::Le,
        Opcode::GreaterThan => IrOpcode::Gt,
        Opcode::GreaterThanOrEqual => IrOpcode::Ge,
        _ => unreachable!("not a binary opcode"),
    }
}

/// Remove blocks unreachable from the entry. Handler blocks are treated
/// as extra roots and preserved.
fn prune_unreachable(f: &mut IrFunction) {
    let mut reachable = vec![false; f.block_count()];
    let mut stack = vec![f.entry];
    for block in f.block_ids() {
        if f.block(block).is_handler {
            stack.push(block);
        }
    }
    while let Some(block) = stack.pop() {
        if std::mem::replace(&mut reachable[block.0 as usize], true) {
            continue;
        }
        for &succ in &f.block(block).successors {
            if !reachable[succ.0 as usize] {
                stack.push(succ);
            }
        }
    }
    for block in f.block_ids().collect::<Vec<_>>() {
        if !reachable[block.0 as usize] {
            for succ in f.block(block).successors.clone() {
                f.remove_edge(block, succ);
            }
            let b = f.block_mut(block);
            b.instructions.clear();
            b.phis.clear();
            b.predecessors.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::BytecodeEncoder;

    fn block_of(code: Vec<u8>) -> BytecodeBlock {
        let mut block = BytecodeBlock::new();
        block.code = code;
        block
    }

    #[test]
    fn test_straight_line_single_block() {
        let mut enc = BytecodeEncoder::new();
        enc.emit_number(1.0);
        enc.emit_number(2.0);
        enc.emit(Opcode::Add, &[]);
        enc.emit(Opcode::Return, &[]);
        let f = build_ir(&block_of(enc.finish().unwrap())).unwrap();
        // entry + body + exit
        let reachable = f.reachable_blocks();
        assert_eq!(reachable.len(), 3);
        let body = f.block(f.block(f.entry).successors[0]);
        assert_eq!(body.instructions.len(), 4);
    }

    #[test]
    fn test_loop_becomes_loop_header() {
        // head: i < 100 ? body : exit; body: i++; jump head
        let mut enc = BytecodeEncoder::new();
        let head = enc.create_label();
        let done = enc.create_label();
        enc.bind_label(head).unwrap();
        enc.emit(Opcode::LoadLocal, &[0]);
        enc.emit_number(100.0);
        enc.emit(Opcode::LessThan, &[]);
        enc.emit_jump(Opcode::JumpIfFalse, done);
        enc.emit(Opcode::LoadLocal, &[0]);
        enc.emit_number(1.0);
        enc.emit(Opcode::Add, &[]);
        enc.emit(Opcode::StoreLocal, &[0]);
        enc.emit_jump(Opcode::Jump, head);
        enc.bind_label(done).unwrap();
        enc.emit(Opcode::LoadUndefined, &[]);
        enc.emit(Opcode::Return, &[]);
        let mut block = block_of(enc.finish().unwrap());
        block.local_count = 1;

        let f = build_ir(&block).unwrap();
        let headers: Vec<_> = f
            .block_ids()
            .filter(|b| f.block(*b).is_loop_header)
            .collect();
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_branch_wires_two_successors() {
        let mut enc = BytecodeEncoder::new();
        let alt = enc.create_label();
        enc.emit(Opcode::LoadTrue, &[]);
        enc.emit_jump(Opcode::JumpIfFalse, alt);
        enc.emit(Opcode::LoadNull, &[]);
        enc.emit(Opcode::Return, &[]);
        enc.bind_label(alt).unwrap();
        enc.emit(Opcode::LoadUndefined, &[]);
        enc.emit(Opcode::Return, &[]);
        let f = build_ir(&block_of(enc.finish().unwrap())).unwrap();
        let first_real = f.block(f.entry).successors[0];
        assert_eq!(f.block(first_real).successors.len(), 2);
    }

    #[test]
    fn test_merge_with_different_values_gets_phi() {
        // cond ? 1 : 2, then return - the merge carries a stack value
        let mut enc = BytecodeEncoder::new();
        let alt = enc.create_label();
        let join = enc.create_label();
        enc.emit(Opcode::LoadTrue, &[]);
        enc.emit_jump(Opcode::JumpIfFalse, alt);
        enc.emit_number(1.0);
        enc.emit_jump(Opcode::Jump, join);
        enc.bind_label(alt).unwrap();
        enc.emit_number(2.0);
        enc.bind_label(join).unwrap();
        enc.emit(Opcode::Return, &[]);
        let f = build_ir(&block_of(enc.finish().unwrap())).unwrap();

        let has_phi = f
            .block_ids()
            .any(|b| !f.block(b).phis.is_empty());
        assert!(has_phi, "conditional expression merge should produce a phi");
    }

    #[test]
    fn test_handler_block_preserved_and_marked() {
        let mut enc = BytecodeEncoder::new();
        enc.emit(Opcode::LoadNull, &[]);
        enc.emit(Opcode::Throw, &[]);
        let handler_offset = enc.offset();
        enc.emit(Opcode::Pop, &[]);
        enc.emit(Opcode::LoadUndefined, &[]);
        enc.emit(Opcode::Return, &[]);
        let mut block = block_of(enc.finish().unwrap());
        block.exception_table.push(bytecode_system::ExceptionTableEntry {
            try_start: 0,
            try_end: handler_offset,
            handler_offset,
        });

        let f = build_ir(&block).unwrap();
        let handler = f.block_ids().find(|b| f.block(*b).is_handler).unwrap();
        assert!(!f.block(handler).instructions.is_empty());
    }

    #[test]
    fn test_suspension_opcode_rejected() {
        let mut enc = BytecodeEncoder::new();
        enc.emit(Opcode::LoadNull, &[]);
        enc.emit(Opcode::Await, &[]);
        enc.emit(Opcode::Return, &[]);
        let err = build_ir(&block_of(enc.finish().unwrap())).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidOpcode);
    }

    #[test]
    fn test_unreachable_code_pruned() {
        let mut enc = BytecodeEncoder::new();
        enc.emit(Opcode::LoadUndefined, &[]);
        enc.emit(Opcode::Return, &[]);
        // dead tail
        enc.emit(Opcode::LoadNull, &[]);
        enc.emit(Opcode::Return, &[]);
        let f = build_ir(&block_of(enc.finish().unwrap())).unwrap();
        let reachable = f.reachable_blocks().len();
        let nonempty = f
            .block_ids()
            .filter(|b| !f.block(*b).instructions.is_empty())
            .count();
        assert_eq!(reachable, nonempty);
    }
}
