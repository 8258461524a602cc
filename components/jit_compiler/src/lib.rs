//! Tiered JIT compilation for the AeroJS execution core.
//!
//! The mid-level IR with its builder, validator, type analyzer and
//! optimizer; liveness analysis and the register allocator; hand-written
//! per-architecture code emitters behind one interface; the executable
//! code cache; the baseline JIT with inline-cache wiring; and the
//! meta-tracing JIT that records, optimizes and installs hot traces.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod baseline;
mod code_cache;
mod codegen;
mod ir;
mod ir_builder;
mod ir_validator;
mod liveness;
mod optimizer;
mod register_allocator;
mod trace;
mod type_analyzer;

pub use baseline::{BaselineJit, BaselineStats, CompiledFunction, RuntimeHelpers};
pub use code_cache::{CacheError, CodeCache, CodeRegion};
pub use codegen::{
    emitter_for, reg_file_for, Architecture, Arm64Emitter, EmitLabel, NativeEmitter,
    RiscV64Emitter, X86_64Emitter,
};
pub use ir::{
    BlockId, InstId, IrBlock, IrFunction, IrInst, IrOpcode, Operand, RegClass, VirtualReg,
};
pub use ir_builder::build_ir;
pub use ir_validator::{validate_ir, validate_ir_with, ValidatorConfig};
pub use liveness::{compute_liveness, LiveInterval, Liveness};
pub use optimizer::{optimize, OptLevel, OptStats, OptimizerConfig};
pub use register_allocator::{
    allocate, AllocClass, AllocStrategy, Assignment, PhysReg, PhysRegFile, RegisterAllocation,
};
pub use trace::{
    CompiledTrace, SideExit, TraceAbortReason, TraceProfile, TracingConfig, TracingJit,
};
pub use type_analyzer::{
    analyze_types, analyze_types_with, ConstVal, TypeAnalysis, TypeAnalyzerConfig, TypeInfo,
    TypeMask, ValueType,
};
