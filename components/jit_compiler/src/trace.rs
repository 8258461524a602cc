//! Meta-tracing JIT.
//!
//! Hot bytecode addresses are detected by entry counters; the recorder
//! then captures one linear execution path as IR with guards where
//! control flow could diverge. Committed traces are validated, optimized,
//! register-allocated and emitted; each side exit gets a trampoline that
//! loads the exit index and trace id into fixed registers and jumps to
//! the central side-exit handler. Compiled entry points are installed in
//! the per-address trace-entry table the interpreter consults. When the
//! code budget is exceeded, the least-used fifth of all traces is
//! evicted.

use crate::code_cache::CodeCache;
use crate::codegen::{emitter_for, Architecture};
use crate::ir::{IrFunction, IrInst, IrOpcode, Operand, RegClass, VirtualReg};
use crate::ir_validator::validate_ir;
use crate::liveness::compute_liveness;
use crate::optimizer::{optimize, OptLevel, OptimizerConfig};
use crate::register_allocator::{allocate, AllocStrategy};
use crate::codegen::reg_file_for;
use bytecode_system::{DecodedInstruction, Opcode};
use runtime::{BytecodeAddress, InstalledTrace, SideExitKind, TraceRuntime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a recording was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceAbortReason {
    /// The recording exceeded the length cap
    TraceTooLong,
    /// Too many guards accumulated
    TooManyGuardFailures,
    /// A compiled trace kept leaving through side exits
    TooManySideExits,
    /// Recording took longer than the timeout
    Timeout,
    /// Anything else (returns, unsupported opcodes, validation failures)
    Other,
}

/// Tracing-JIT configuration. Thresholds are configuration with the
/// documented defaults, not constants.
#[derive(Debug, Clone, Copy)]
pub struct TracingConfig {
    /// Master switch
    pub enabled: bool,
    /// Optimization level applied to committed traces
    pub opt_level: OptLevel,
    /// Entry count at which recording starts (default 10)
    pub hot_threshold: u32,
    /// Executions required before an evicted location may recompile
    /// (default 3)
    pub min_executions: u32,
    /// Maximum recordings attempted per location (default 5)
    pub max_attempts: u32,
    /// Cap on simultaneously compiled traces (default 1000)
    pub max_compiled_traces: usize,
    /// Code-memory budget in bytes (default 100 MiB)
    pub memory_budget: usize,
    /// Length cap on one recording (default 4096 instructions)
    pub max_trace_length: usize,
    /// Guard cap on one recording (default 256)
    pub max_guards: usize,
    /// Recording wall-clock timeout (default 50 ms)
    pub record_timeout: Duration,
    /// Side exits from one trace before it is dropped for re-tracing
    pub side_exit_threshold: u32,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            opt_level: OptLevel::O2,
            hot_threshold: 10,
            min_executions: 3,
            max_attempts: 5,
            max_compiled_traces: 1000,
            memory_budget: 100 * 1024 * 1024,
            max_trace_length: 4096,
            max_guards: 256,
            record_timeout: Duration::from_millis(50),
            side_exit_threshold: 16,
        }
    }
}

/// One side exit of a compiled trace.
#[derive(Debug, Clone, Copy)]
pub struct SideExit {
    /// Exit index, loaded by the trampoline
    pub exit_index: u32,
    /// Bytecode offset the interpreter resumes at
    pub resume_offset: u32,
    /// Native offset of the trampoline
    pub trampoline_offset: u32,
}

/// A compiled trace.
pub struct CompiledTrace {
    /// Trace id
    pub trace_id: u32,
    /// Entry bytecode address
    pub entry: BytecodeAddress,
    /// Executable region
    pub region: crate::code_cache::CodeRegion,
    /// Native code size
    pub code_size: usize,
    /// Side exits, indexed by exit index
    pub side_exits: Vec<SideExit>,
    /// Call-site bytecode offsets observed during recording
    pub inlined_calls: Vec<u32>,
    /// Bytecode offsets the trace expects, in execution order
    pub expected_offsets: Arc<Vec<u32>>,
    /// Resume offsets of the planned guard exits
    pub exit_resumes: Arc<Vec<u32>>,
    /// Times the trace was entered
    pub execution_count: u64,
    /// Recorded instruction count before optimization
    pub original_instruction_count: usize,
    /// IR instruction count after optimization
    pub optimized_instruction_count: usize,
    /// Wall-clock compile time
    pub compile_time: Duration,
}

/// Per-trace profile information.
#[derive(Debug, Clone, Default)]
pub struct TraceProfile {
    /// Trace-hit events
    pub hits: u64,
    /// Side exits taken, by kind
    pub side_exit_counts: HashMap<SideExitKind, u32>,
}

#[derive(Debug)]
enum RecorderState {
    Idle,
    Recording {
        entry: BytecodeAddress,
        instructions: Vec<DecodedInstruction>,
        guards: usize,
        inlined_calls: Vec<u32>,
        started: Instant,
    },
    Committing,
    Aborting(TraceAbortReason),
}

enum RecorderEvent {
    None,
    Commit(TraceRecord),
    Abort(TraceAbortReason, Option<BytecodeAddress>),
}

struct TraceRecord {
    entry: BytecodeAddress,
    instructions: Vec<DecodedInstruction>,
    inlined_calls: Vec<u32>,
}

/// The trace recorder: an explicit four-state machine. Event methods
/// dispatch on the current state.
struct TraceRecorder {
    state: RecorderState,
    max_length: usize,
    max_guards: usize,
    timeout: Duration,
}

impl TraceRecorder {
    fn new(config: &TracingConfig) -> Self {
        Self {
            state: RecorderState::Idle,
            max_length: config.max_trace_length,
            max_guards: config.max_guards,
            timeout: config.record_timeout,
        }
    }

    fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    fn on_entry(&mut self, address: BytecodeAddress) {
        if matches!(self.state, RecorderState::Idle) {
            self.state = RecorderState::Recording {
                entry: address,
                instructions: Vec::new(),
                guards: 0,
                inlined_calls: Vec::new(),
                started: Instant::now(),
            };
        }
    }

    fn on_opcode(
        &mut self,
        address: BytecodeAddress,
        inst: &DecodedInstruction,
    ) -> RecorderEvent {
        let RecorderState::Recording {
            entry,
            instructions,
            guards,
            inlined_calls,
            started,
        } = &mut self.state
        else {
            return RecorderEvent::None;
        };
        let entry = *entry;
        // Instructions from other functions belong to an inlined call
        if address.function_index() != entry.function_index() {
            return RecorderEvent::None;
        }
        if started.elapsed() > self.timeout {
            return self.abort(TraceAbortReason::Timeout);
        }
        if !instructions.is_empty() && address == entry {
            // Loop closure
            return self.commit();
        }
        if instructions.len() >= self.max_length {
            return self.abort(TraceAbortReason::TraceTooLong);
        }
        match inst.opcode {
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                *guards += 1;
                if *guards > self.max_guards {
                    return self.abort(TraceAbortReason::TooManyGuardFailures);
                }
                instructions.push(*inst);
                RecorderEvent::None
            }
            Opcode::Return | Opcode::TailCall | Opcode::Throw => self.on_return(),
            Opcode::Call | Opcode::New => {
                inlined_calls.push(inst.offset as u32);
                instructions.push(*inst);
                RecorderEvent::None
            }
            Opcode::Await | Opcode::Yield => self.abort(TraceAbortReason::Other),
            _ => {
                instructions.push(*inst);
                RecorderEvent::None
            }
        }
    }

    fn on_branch(&mut self, address: BytecodeAddress, inst: &DecodedInstruction) -> RecorderEvent {
        self.on_opcode(address, inst)
    }

    fn on_return(&mut self) -> RecorderEvent {
        if self.is_recording() {
            self.abort(TraceAbortReason::Other)
        } else {
            RecorderEvent::None
        }
    }

    fn commit(&mut self) -> RecorderEvent {
        let state = std::mem::replace(&mut self.state, RecorderState::Committing);
        let RecorderState::Recording {
            entry,
            instructions,
            inlined_calls,
            ..
        } = state
        else {
            self.state = RecorderState::Idle;
            return RecorderEvent::None;
        };
        self.state = RecorderState::Idle;
        RecorderEvent::Commit(TraceRecord {
            entry,
            instructions,
            inlined_calls,
        })
    }

    fn abort(&mut self, reason: TraceAbortReason) -> RecorderEvent {
        let state = std::mem::replace(&mut self.state, RecorderState::Aborting(reason));
        let entry = match state {
            RecorderState::Recording { entry, .. } => Some(entry),
            _ => None,
        };
        self.state = RecorderState::Idle;
        RecorderEvent::Abort(reason, entry)
    }
}

/// The meta-tracing JIT. Implements the interpreter-facing
/// [`TraceRuntime`] seam.
pub struct TracingJit {
    config: TracingConfig,
    arch: Architecture,
    cache: CodeCache,
    /// Address of the central side-exit handler the trampolines target
    side_exit_handler: usize,
    /// Address of the per-instruction dispatch helper
    dispatch_helper: usize,
    recorder: TraceRecorder,
    next_trace_id: u32,
    location_to_trace: HashMap<BytecodeAddress, u32>,
    traces: HashMap<u32, CompiledTrace>,
    entry_counts: HashMap<BytecodeAddress, u32>,
    attempt_counts: HashMap<BytecodeAddress, u32>,
    profiles: HashMap<u32, TraceProfile>,
    abort_counts: HashMap<TraceAbortReason, u32>,
    evictions: u64,
}

impl TracingJit {
    /// Create a tracing JIT for the host architecture.
    pub fn new(config: TracingConfig) -> Self {
        Self::with_arch(config, Architecture::host(), 0x6000, 0x1000)
    }

    /// Create a tracing JIT with explicit architecture and helper
    /// addresses.
    pub fn with_arch(
        config: TracingConfig,
        arch: Architecture,
        side_exit_handler: usize,
        dispatch_helper: usize,
    ) -> Self {
        Self {
            recorder: TraceRecorder::new(&config),
            cache: CodeCache::new(config.memory_budget),
            config,
            arch,
            side_exit_handler,
            dispatch_helper,
            next_trace_id: 1,
            location_to_trace: HashMap::new(),
            traces: HashMap::new(),
            entry_counts: HashMap::new(),
            attempt_counts: HashMap::new(),
            profiles: HashMap::new(),
            abort_counts: HashMap::new(),
            evictions: 0,
        }
    }

    /// Enable or disable tracing.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// The compiled trace for a trace id.
    pub fn trace(&self, trace_id: u32) -> Option<&CompiledTrace> {
        self.traces.get(&trace_id)
    }

    /// The compiled trace installed at an address.
    pub fn trace_for_location(&self, address: BytecodeAddress) -> Option<&CompiledTrace> {
        self.location_to_trace
            .get(&address)
            .and_then(|id| self.traces.get(id))
    }

    /// Per-trace profile info.
    pub fn profile(&self, trace_id: u32) -> Option<&TraceProfile> {
        self.profiles.get(&trace_id)
    }

    /// Abort counts by reason.
    pub fn abort_counts(&self) -> &HashMap<TraceAbortReason, u32> {
        &self.abort_counts
    }

    /// Attempt count for a location.
    pub fn attempts(&self, address: BytecodeAddress) -> u32 {
        self.attempt_counts.get(&address).copied().unwrap_or(0)
    }

    /// Traces evicted so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Bytes of trace code currently resident.
    pub fn used_memory(&self) -> usize {
        self.cache.used_bytes()
    }

    fn record_abort(&mut self, entry: BytecodeAddress, reason: TraceAbortReason) {
        *self.attempt_counts.entry(entry).or_insert(0) += 1;
        *self.abort_counts.entry(reason).or_insert(0) += 1;
        // Hotness restarts so the location can re-qualify
        self.entry_counts.insert(entry, 0);
        tracing::debug!(?reason, address = entry.0, "trace recording aborted");
    }

    /// Evict the least-used 20% of traces (always at least one).
    fn evict_for_pressure(&mut self) {
        if self.traces.is_empty() {
            return;
        }
        let mut by_usage: Vec<(u32, u64)> = self
            .traces
            .iter()
            .map(|(id, t)| (*id, t.execution_count))
            .collect();
        by_usage.sort_by_key(|(id, count)| (*count, *id));
        let victims = (by_usage.len() / 5).max(1);
        let mut freed = 0usize;
        for (trace_id, _) in by_usage.into_iter().take(victims) {
            if let Some(trace) = self.traces.remove(&trace_id) {
                self.location_to_trace.remove(&trace.entry);
                freed += trace.code_size;
                self.evictions += 1;
                // Dropping the trace's region returns its bytes
            }
        }
        tracing::debug!(freed, evicted = victims, "trace cache pressure eviction");
    }

    fn compile_trace(&mut self, record: TraceRecord) {
        let started = Instant::now();
        let entry = record.entry;
        if self.traces.len() >= self.config.max_compiled_traces {
            self.evict_for_pressure();
        }

        let Some((mut ir, expected_offsets, exits)) = build_trace_ir(&record) else {
            self.record_abort(entry, TraceAbortReason::Other);
            return;
        };
        let errors = validate_ir(&ir);
        if errors.iter().any(|e| !e.kind.is_warning()) {
            self.record_abort(entry, TraceAbortReason::Other);
            return;
        }

        let original_count = record.instructions.len();
        optimize(
            &mut ir,
            OptimizerConfig {
                level: self.config.opt_level,
                max_iterations: 8,
            },
        );
        hoist_redundant_guards(&mut ir);
        eliminate_dead_trace_stores(&mut ir);
        let optimized_count = ir
            .block_ids()
            .map(|b| f_block_len(&ir, b))
            .sum::<usize>();

        let liveness = compute_liveness(&ir);
        let file = reg_file_for(self.arch, false);
        let allocation = allocate(&ir, &liveness, &file, AllocStrategy::LinearScan);

        let Some((code, side_exits)) = emit_trace(
            self.arch,
            &ir,
            &exits,
            self.next_trace_id,
            self.side_exit_handler,
            self.dispatch_helper,
            allocation.frame_size,
        ) else {
            self.record_abort(entry, TraceAbortReason::Other);
            return;
        };

        let mut region = match self.cache.alloc(code.len()) {
            Ok(region) => region,
            Err(_) => {
                self.evict_for_pressure();
                match self.cache.alloc(code.len()) {
                    Ok(region) => region,
                    Err(_) => {
                        self.record_abort(entry, TraceAbortReason::Other);
                        return;
                    }
                }
            }
        };
        if region.install(&code).is_err() {
            self.record_abort(entry, TraceAbortReason::Other);
            return;
        }

        let trace_id = self.next_trace_id;
        self.next_trace_id += 1;
        let exit_resumes = Arc::new(side_exits.iter().map(|e| e.resume_offset).collect());
        let compiled = CompiledTrace {
            trace_id,
            entry,
            code_size: region.code_len(),
            region,
            side_exits,
            exit_resumes,
            inlined_calls: record.inlined_calls,
            expected_offsets: Arc::new(expected_offsets),
            execution_count: 0,
            original_instruction_count: original_count,
            optimized_instruction_count: optimized_count,
            compile_time: started.elapsed(),
        };
        tracing::debug!(
            trace_id,
            entry = entry.0,
            original = original_count,
            optimized = optimized_count,
            code_size = compiled.code_size,
            "trace compiled and installed"
        );
        // Entry-point patch: the interpreter's dispatch table now routes
        // this address into the trace
        self.location_to_trace.insert(entry, trace_id);
        self.traces.insert(trace_id, compiled);
        self.profiles.insert(trace_id, TraceProfile::default());
    }
}

fn f_block_len(f: &IrFunction, b: crate::ir::BlockId) -> usize {
    f.block(b).instructions.len() + f.block(b).phis.len()
}

impl TraceRuntime for TracingJit {
    fn trace_at(&mut self, address: BytecodeAddress) -> Option<InstalledTrace> {
        if !self.config.enabled {
            return None;
        }
        let trace_id = *self.location_to_trace.get(&address)?;
        let trace = self.traces.get_mut(&trace_id)?;
        trace.execution_count += 1;
        let installed = InstalledTrace {
            trace_id,
            expected_offsets: trace.expected_offsets.clone(),
            exit_resume_offsets: trace.exit_resumes.clone(),
            entry_point: trace.region.entry(),
        };
        self.profiles.entry(trace_id).or_default().hits += 1;
        Some(installed)
    }

    fn record_entry(&mut self, address: BytecodeAddress) {
        if !self.config.enabled || self.recorder.is_recording() {
            return;
        }
        let count = self.entry_counts.entry(address).or_insert(0);
        *count += 1;
        if *count == self.config.hot_threshold
            && self.attempts(address) < self.config.max_attempts
        {
            tracing::trace!(address = address.0, "hot loop detected, recording");
            self.recorder.on_entry(address);
        }
    }

    fn record_instruction(&mut self, address: BytecodeAddress, inst: &DecodedInstruction) {
        if !self.recorder.is_recording() {
            return;
        }
        let event = if inst.opcode.is_jump() {
            self.recorder.on_branch(address, inst)
        } else {
            self.recorder.on_opcode(address, inst)
        };
        match event {
            RecorderEvent::None => {}
            RecorderEvent::Commit(record) => self.compile_trace(record),
            RecorderEvent::Abort(reason, entry) => {
                self.record_abort(entry.unwrap_or(address), reason);
            }
        }
    }

    fn record_side_exit(
        &mut self,
        trace_id: u32,
        kind: SideExitKind,
        _resume_address: BytecodeAddress,
    ) {
        let profile = self.profiles.entry(trace_id).or_default();
        *profile.side_exit_counts.entry(kind).or_insert(0) += 1;
        let total: u32 = profile.side_exit_counts.values().sum();
        if total >= self.config.side_exit_threshold {
            // The trace keeps bailing; drop it so the location can
            // re-trace an alternative path, attempts permitting. A trace
            // that has not met the execution minimum is kept: one noisy
            // burst of exits is not yet evidence the path is wrong.
            if let Some(trace) = self.traces.remove(&trace_id) {
                if trace.execution_count >= self.config.min_executions as u64
                    && self.attempts(trace.entry) < self.config.max_attempts
                {
                    self.location_to_trace.remove(&trace.entry);
                    self.entry_counts.insert(trace.entry, 0);
                    *self.abort_counts
                        .entry(TraceAbortReason::TooManySideExits)
                        .or_insert(0) += 1;
                    tracing::debug!(trace_id, "trace dropped after repeated side exits");
                } else {
                    // Out of attempts; keep the trace
                    self.traces.insert(trace_id, trace);
                }
            }
        }
    }
}

struct PendingExit {
    exit_index: u32,
    resume_offset: u32,
}

/// Build a linear guarded IR function from a trace record. Returns the
/// IR, the expected bytecode offsets in order, and the side-exit list.
fn build_trace_ir(
    record: &TraceRecord,
) -> Option<(IrFunction, Vec<u32>, Vec<PendingExit>)> {
    let mut f = IrFunction::new(0);
    let block = f.entry;
    let mut stack: Vec<VirtualReg> = Vec::new();
    let mut exits: Vec<PendingExit> = Vec::new();
    let mut expected = Vec::new();

    let instructions = &record.instructions;
    for (index, inst) in instructions.iter().enumerate() {
        expected.push(inst.offset as u32);
        let next_offset = instructions
            .get(index + 1)
            .map(|i| i.offset as u32)
            .unwrap_or(record.entry.offset());
        let mut push = |f: &mut IrFunction, stack: &mut Vec<VirtualReg>, opcode, operands| {
            let r = f.new_reg(RegClass::Int64);
            let mut ir = IrInst::new(opcode, Some(r), operands);
            ir.position = Some(inst.offset as u32);
            f.emit(block, ir);
            stack.push(r);
        };
        match inst.opcode {
            Opcode::Nop | Opcode::Phi | Opcode::FunctionHeader | Opcode::Jump => {}
            Opcode::LoadUndefined => push(&mut f, &mut stack, IrOpcode::LoadUndefined, vec![]),
            Opcode::LoadNull => push(&mut f, &mut stack, IrOpcode::LoadNull, vec![]),
            Opcode::LoadTrue => {
                push(&mut f, &mut stack, IrOpcode::LoadBool, vec![Operand::ImmI64(1)])
            }
            Opcode::LoadFalse => {
                push(&mut f, &mut stack, IrOpcode::LoadBool, vec![Operand::ImmI64(0)])
            }
            Opcode::LoadNumber => {
                let n = inst.number_operand();
                let operand = if n.fract() == 0.0 && (i32::MIN as f64..=i32::MAX as f64).contains(&n)
                {
                    Operand::ImmI64(n as i64)
                } else {
                    Operand::ImmF64(n)
                };
                push(&mut f, &mut stack, IrOpcode::LoadConst, vec![operand]);
            }
            Opcode::LoadString => push(
                &mut f,
                &mut stack,
                IrOpcode::LoadString,
                vec![Operand::ImmI64(inst.operands[0] as i64)],
            ),
            Opcode::LoadConst => push(
                &mut f,
                &mut stack,
                IrOpcode::LoadPool,
                vec![Operand::ImmI64(inst.operands[0] as i64)],
            ),
            Opcode::LoadLocal | Opcode::LoadVar => {
                let (hops, slot) = if inst.opcode == Opcode::LoadLocal {
                    (0, inst.operands[0])
                } else {
                    (inst.operands[0], inst.operands[1])
                };
                push(
                    &mut f,
                    &mut stack,
                    IrOpcode::LoadEnv,
                    vec![Operand::ImmI64(hops as i64), Operand::ImmI64(slot as i64)],
                );
            }
            Opcode::StoreLocal | Opcode::StoreVar => {
                let value = stack.pop()?;
                let (hops, slot) = if inst.opcode == Opcode::StoreLocal {
                    (0, inst.operands[0])
                } else {
                    (inst.operands[0], inst.operands[1])
                };
                f.emit(
                    block,
                    IrInst::new(
                        IrOpcode::StoreEnv,
                        None,
                        vec![
                            Operand::ImmI64(hops as i64),
                            Operand::ImmI64(slot as i64),
                            Operand::Reg(value),
                        ],
                    ),
                );
            }
            Opcode::GetParameter => push(
                &mut f,
                &mut stack,
                IrOpcode::GetParameter,
                vec![Operand::ImmI64(inst.operands[0] as i64)],
            ),
            Opcode::LoadGlobal => push(
                &mut f,
                &mut stack,
                IrOpcode::LoadGlobal,
                vec![Operand::ImmI64(inst.operands[0] as i64)],
            ),
            Opcode::StoreGlobal => {
                let value = stack.pop()?;
                f.emit(
                    block,
                    IrInst::new(
                        IrOpcode::StoreGlobal,
                        None,
                        vec![Operand::ImmI64(inst.operands[0] as i64), Operand::Reg(value)],
                    ),
                );
            }
            Opcode::LoadThis => push(&mut f, &mut stack, IrOpcode::LoadThis, vec![]),
            op if op.is_binary_arithmetic() || op.is_comparison() => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                push(
                    &mut f,
                    &mut stack,
                    trace_binary_opcode(op),
                    vec![Operand::Reg(a), Operand::Reg(b)],
                );
            }
            Opcode::Neg | Opcode::BitNot | Opcode::Not => {
                let a = stack.pop()?;
                let opcode = match inst.opcode {
                    Opcode::Neg => IrOpcode::Neg,
                    Opcode::BitNot => IrOpcode::BitNot,
                    _ => IrOpcode::Not,
                };
                push(&mut f, &mut stack, opcode, vec![Operand::Reg(a)]);
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let cond = stack.pop()?;
                let target = inst.operands[0];
                let taken = next_offset == target;
                // The guard condition must reproduce the recorded path;
                // the exit resumes at the path not taken
                let (guard_reg, resume) = match (inst.opcode, taken) {
                    (Opcode::JumpIfTrue, true) | (Opcode::JumpIfFalse, false) => {
                        (cond, fallthrough_or_target(inst, taken))
                    }
                    _ => {
                        let inverted = f.new_reg(RegClass::Int64);
                        f.emit(
                            block,
                            IrInst::new(IrOpcode::Not, Some(inverted), vec![Operand::Reg(cond)]),
                        );
                        (inverted, fallthrough_or_target(inst, taken))
                    }
                };
                let exit_index = exits.len() as u32;
                exits.push(PendingExit {
                    exit_index,
                    resume_offset: resume,
                });
                f.emit(
                    block,
                    IrInst::new(
                        IrOpcode::Guard,
                        None,
                        vec![Operand::Reg(guard_reg), Operand::ImmI64(exit_index as i64)],
                    ),
                );
            }
            Opcode::Call | Opcode::New => {
                let argc = inst.operands[0] as usize;
                let mut args = Vec::with_capacity(argc + 1);
                for _ in 0..argc {
                    args.push(stack.pop()?);
                }
                args.reverse();
                let callee = stack.pop()?;
                let mut operands = vec![Operand::Reg(callee)];
                operands.extend(args.into_iter().map(Operand::Reg));
                let opcode = if inst.opcode == Opcode::Call {
                    IrOpcode::Call
                } else {
                    IrOpcode::Construct
                };
                push(&mut f, &mut stack, opcode, operands);
            }
            Opcode::GetProperty => {
                let object = stack.pop()?;
                push(
                    &mut f,
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
                let value = stack.pop()?;
                let object = stack.pop()?;
                f.emit(
                    block,
                    IrInst::new(
                        IrOpcode::SetProperty,
                        None,
                        vec![
                            Operand::Reg(object),
                            Operand::Reg(value),
                            Operand::ImmI64(inst.operands[0] as i64),
                            Operand::ImmI64(inst.operands[1] as i64),
                        ],
                    ),
                );
                stack.push(value);
            }
            Opcode::GetElement => {
                let key = stack.pop()?;
                let object = stack.pop()?;
                push(
                    &mut f,
                    &mut stack,
                    IrOpcode::GetElement,
                    vec![Operand::Reg(object), Operand::Reg(key)],
                );
            }
            Opcode::SetElement => {
                let value = stack.pop()?;
                let key = stack.pop()?;
                let object = stack.pop()?;
                f.emit(
                    block,
                    IrInst::new(
                        IrOpcode::SetElement,
                        None,
                        vec![Operand::Reg(object), Operand::Reg(key), Operand::Reg(value)],
                    ),
                );
                stack.push(value);
            }
            Opcode::CreateObject => push(&mut f, &mut stack, IrOpcode::CreateObject, vec![]),
            Opcode::CreateArray => {
                let count = inst.operands[0] as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(stack.pop()?);
                }
                elements.reverse();
                push(
                    &mut f,
                    &mut stack,
                    IrOpcode::CreateArray,
                    elements.into_iter().map(Operand::Reg).collect(),
                );
            }
            Opcode::Pop => {
                stack.pop()?;
            }
            Opcode::Dup => {
                let top = *stack.last()?;
                stack.push(top);
            }
            _ => return None, // unsupported in traces
        }
    }
    f.emit(f.entry, IrInst::new(IrOpcode::Return, None, vec![]));
    Some((f, expected, exits))
}

fn fallthrough_or_target(inst: &DecodedInstruction, taken: bool) -> u32 {
    if taken {
        // Resume at the fallthrough the trace skipped
        (inst.offset + inst.opcode.encoded_width()) as u32
    } else {
        inst.operands[0]
    }
}

fn trace_binary_opcode(op: Opcode) -> IrOpcode {
    match op {
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
        _ => IrOpcode::Ge,
    }
}

/// Guard hoisting: consecutive guards on the same condition register
/// collapse into the first one.
fn hoist_redundant_guards(f: &mut IrFunction) {
    for block in f.block_ids().collect::<Vec<_>>() {
        let mut seen: Vec<VirtualReg> = Vec::new();
        let ids = f.block(block).instructions.clone();
        let mut keep = Vec::with_capacity(ids.len());
        for id in ids {
            let inst = f.inst(id);
            match inst.opcode {
                IrOpcode::Guard => {
                    if let Some(reg) = inst.operands[0].as_reg() {
                        if seen.contains(&reg) {
                            continue; // dominated by an identical guard
                        }
                        seen.push(reg);
                    }
                    keep.push(id);
                }
                // Anything with effects invalidates guarded knowledge
                op if op.has_side_effects() => {
                    seen.clear();
                    keep.push(id);
                }
                _ => keep.push(id),
            }
        }
        f.block_mut(block).instructions = keep;
    }
}

/// Dead-store elimination within the linear trace: an environment store
/// overwritten by a later store to the same slot, with no intervening
/// read or call, is dropped.
fn eliminate_dead_trace_stores(f: &mut IrFunction) {
    for block in f.block_ids().collect::<Vec<_>>() {
        let ids = f.block(block).instructions.clone();
        let mut dead = Vec::new();
        // (hops, slot) -> index of the pending store
        let mut pending: HashMap<(i64, i64), usize> = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            let inst = f.inst(*id);
            match inst.opcode {
                IrOpcode::StoreEnv => {
                    let key = match (inst.operands[0], inst.operands[1]) {
                        (Operand::ImmI64(h), Operand::ImmI64(s)) => (h, s),
                        _ => continue,
                    };
                    if let Some(previous) = pending.insert(key, index) {
                        dead.push(ids[previous]);
                    }
                }
                IrOpcode::LoadEnv | IrOpcode::Call | IrOpcode::Construct | IrOpcode::Guard => {
                    pending.clear();
                }
                _ => {}
            }
        }
        if !dead.is_empty() {
            f.block_mut(block)
                .instructions
                .retain(|id| !dead.contains(id));
        }
    }
}

/// Emit native code for a trace: call-threaded body with guard checks,
/// then one trampoline per side exit in the fixed trampoline shape:
/// exactly two `MOV imm64` (exit index, trace id) followed by a
/// memory-indirect jump whose operand is the handler address embedded as
/// trailing literal data.
fn emit_trace(
    arch: Architecture,
    f: &IrFunction,
    exits: &[PendingExit],
    trace_id: u32,
    side_exit_handler: usize,
    dispatch_helper: usize,
    frame_size: u32,
) -> Option<(Vec<u8>, Vec<SideExit>)> {
    let mut emitter = emitter_for(arch);
    let args = emitter.arg_regs();
    let (scratch0, scratch1) = emitter.scratch_regs();
    let index_arg = args[1];

    let exit_labels: Vec<_> = exits.iter().map(|_| emitter.create_label()).collect();

    emitter.emit_prologue(frame_size);
    let mut sequence = 0u64;
    for block in f.reachable_blocks() {
        for id in f.block_insts(block) {
            let inst = f.inst(id);
            match inst.opcode {
                IrOpcode::Guard => {
                    let exit_index = match inst.operands.get(1) {
                        Some(Operand::ImmI64(v)) => *v as usize,
                        _ => return None,
                    };
                    emitter.emit_move_imm64(index_arg, sequence);
                    emitter.emit_move_imm64(scratch0, dispatch_helper as u64);
                    emitter.emit_call_reg(scratch0);
                    // The helper leaves the guard verdict in the return
                    // register; zero takes the side exit
                    let ret = emitter.return_reg();
                    emitter.emit_jump_if_zero(ret, exit_labels[exit_index]);
                }
                IrOpcode::Return => {}
                _ => {
                    emitter.emit_move_imm64(index_arg, sequence);
                    emitter.emit_move_imm64(scratch0, dispatch_helper as u64);
                    emitter.emit_call_reg(scratch0);
                }
            }
            sequence += 1;
        }
    }
    emitter.emit_epilogue();

    // Side-exit trampolines
    let mut side_exits = Vec::with_capacity(exits.len());
    for (exit, label) in exits.iter().zip(&exit_labels) {
        emitter.align_to(16);
        emitter.bind_label(*label);
        let trampoline_offset = emitter.offset() as u32;
        emitter.emit_move_imm64(scratch0, exit.exit_index as u64);
        emitter.emit_move_imm64(scratch1, trace_id as u64);
        emitter.emit_jump_mem(side_exit_handler as u64);
        side_exits.push(SideExit {
            exit_index: exit.exit_index,
            resume_offset: exit.resume_offset,
            trampoline_offset,
        });
    }

    Some((emitter.finish(), side_exits))
}
