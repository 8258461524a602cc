//! Forward dataflow type inference over the IR.
//!
//! Per register and block the analysis tracks a primary type, a bitset of
//! possible types, and an optional known constant. The transfer function
//! is opcode-directed; joins union the possible-type masks. Iteration runs
//! to a fixed point under a configurable ceiling; registers that are still
//! changing when the ceiling is hit widen to `Any`.

use crate::ir::{IrFunction, IrOpcode, Operand, VirtualReg};
use std::collections::HashMap;

/// The 17-element runtime type lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Nothing known yet (bottom)
    Unknown = 0,
    /// `undefined`
    Undefined = 1,
    /// `null`
    Null = 2,
    /// Boolean
    Boolean = 3,
    /// 32-bit integer
    Int32 = 4,
    /// Any number
    Number = 5,
    /// String
    String = 6,
    /// Symbol
    Symbol = 7,
    /// BigInt
    BigInt = 8,
    /// Plain object
    Object = 9,
    /// Array object
    Array = 10,
    /// Callable object
    Function = 11,
    /// RegExp object
    RegExp = 12,
    /// Date object
    Date = 13,
    /// Error object
    Error = 14,
    /// Promise object
    Promise = 15,
    /// Anything (top)
    Any = 16,
}

const PRIORITY: [ValueType; 15] = [
    ValueType::Int32,
    ValueType::Number,
    ValueType::String,
    ValueType::Boolean,
    ValueType::Object,
    ValueType::Array,
    ValueType::Function,
    ValueType::RegExp,
    ValueType::Date,
    ValueType::Error,
    ValueType::Promise,
    ValueType::BigInt,
    ValueType::Symbol,
    ValueType::Null,
    ValueType::Undefined,
];

/// Bitset over [`ValueType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMask(pub u32);

impl TypeMask {
    /// The empty mask.
    pub fn empty() -> Self {
        TypeMask(0)
    }

    /// Every type.
    pub fn any() -> Self {
        TypeMask(1 << ValueType::Any as u32)
    }

    /// A single type.
    pub fn single(ty: ValueType) -> Self {
        TypeMask(1 << ty as u32)
    }

    /// Union.
    pub fn union(self, other: TypeMask) -> Self {
        TypeMask(self.0 | other.0)
    }

    /// Whether `ty` is possible.
    pub fn contains(self, ty: ValueType) -> bool {
        self.0 & (1 << ty as u32) != 0 || self.0 & (1 << ValueType::Any as u32) != 0
    }

    /// Whether this is exactly one concrete type.
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1 && self.0 & (1 << ValueType::Any as u32) == 0
    }

    /// Whether every type in `self` is also in `other`.
    pub fn is_subset_of(self, other: TypeMask) -> bool {
        other.0 & (1 << ValueType::Any as u32) != 0 || (self.0 & !other.0) == 0
    }

    /// The highest-priority type present, used to pick a primary type for
    /// a union.
    pub fn highest_priority(self) -> ValueType {
        if self.0 & (1 << ValueType::Any as u32) != 0 {
            return ValueType::Any;
        }
        for ty in PRIORITY {
            if self.0 & (1 << ty as u32) != 0 {
                return ty;
            }
        }
        ValueType::Unknown
    }
}

/// A known constant value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstVal {
    /// Integer constant
    I64(i64),
    /// Float constant
    F64(f64),
    /// Boolean constant
    Bool(bool),
}

/// Per-register inference result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeInfo {
    /// Best single-type summary
    pub primary: ValueType,
    /// All types the register may hold
    pub mask: TypeMask,
    /// Known constant, when the register is single-valued
    pub constant: Option<ConstVal>,
}

impl TypeInfo {
    /// Unknown (bottom).
    pub fn unknown() -> Self {
        Self {
            primary: ValueType::Unknown,
            mask: TypeMask::empty(),
            constant: None,
        }
    }

    /// Any (top).
    pub fn any() -> Self {
        Self {
            primary: ValueType::Any,
            mask: TypeMask::any(),
            constant: None,
        }
    }

    /// A single concrete type.
    pub fn of(ty: ValueType) -> Self {
        Self {
            primary: ty,
            mask: TypeMask::single(ty),
            constant: None,
        }
    }

    /// A single concrete type with a known constant.
    pub fn constant(ty: ValueType, value: ConstVal) -> Self {
        Self {
            primary: ty,
            mask: TypeMask::single(ty),
            constant: Some(value),
        }
    }

    /// Join: union of masks; the primary type is the more specific of the
    /// two when one subsumes the other, otherwise the union's
    /// highest-priority member.
    pub fn join(self, other: TypeInfo) -> TypeInfo {
        if self.primary == ValueType::Unknown {
            return other;
        }
        if other.primary == ValueType::Unknown {
            return self;
        }
        let mask = self.mask.union(other.mask);
        let primary = if self.mask.is_subset_of(other.mask) {
            other.primary
        } else if other.mask.is_subset_of(self.mask) {
            self.primary
        } else {
            mask.highest_priority()
        };
        let constant = match (self.constant, other.constant) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        };
        TypeInfo {
            primary,
            mask,
            constant,
        }
    }
}

/// Analyzer limits.
#[derive(Debug, Clone, Copy)]
pub struct TypeAnalyzerConfig {
    /// Fixed-point iteration ceiling
    pub max_iterations: u32,
}

impl Default for TypeAnalyzerConfig {
    fn default() -> Self {
        Self { max_iterations: 50 }
    }
}

/// The analysis result: per-register summaries joined over all blocks.
#[derive(Debug, Clone)]
pub struct TypeAnalysis {
    regs: HashMap<VirtualReg, TypeInfo>,
    /// Whether the iteration ceiling was hit and types were widened
    pub widened: bool,
}

impl TypeAnalysis {
    /// The inferred type of a register.
    pub fn type_of(&self, reg: VirtualReg) -> TypeInfo {
        self.regs.get(&reg).copied().unwrap_or_else(TypeInfo::any)
    }
}

/// Run the analysis with default limits.
pub fn analyze_types(f: &IrFunction) -> TypeAnalysis {
    analyze_types_with(f, TypeAnalyzerConfig::default())
}

/// Run the analysis.
pub fn analyze_types_with(f: &IrFunction, config: TypeAnalyzerConfig) -> TypeAnalysis {
    let mut regs: HashMap<VirtualReg, TypeInfo> = HashMap::new();
    for p in 0..f.param_count {
        regs.insert(VirtualReg(p), TypeInfo::any());
    }

    let order = f.reachable_blocks();
    let mut widened = false;
    let mut iterations = 0;
    loop {
        let mut changed = false;
        for &block in &order {
            for id in f.block_insts(block) {
                let inst = f.inst(id);
                let Some(result) = inst.result else { continue };
                let next = transfer(inst.opcode, &inst.operands, &regs);
                let current = regs.get(&result).copied().unwrap_or_else(TypeInfo::unknown);
                let joined = current.join(next);
                if joined != current {
                    regs.insert(result, joined);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
        iterations += 1;
        if iterations >= config.max_iterations {
            // Widen whatever is still in motion
            for info in regs.values_mut() {
                *info = TypeInfo::any();
            }
            widened = true;
            break;
        }
    }

    TypeAnalysis { regs, widened }
}

fn operand_info(operand: &Operand, regs: &HashMap<VirtualReg, TypeInfo>) -> TypeInfo {
    match operand {
        Operand::Reg(r) => regs.get(r).copied().unwrap_or_else(TypeInfo::unknown),
        Operand::ImmI64(v) => TypeInfo::constant(ValueType::Int32, ConstVal::I64(*v)),
        Operand::ImmF64(v) => TypeInfo::constant(ValueType::Number, ConstVal::F64(*v)),
        _ => TypeInfo::any(),
    }
}

fn both(ty: ValueType, a: &TypeInfo, b: &TypeInfo) -> bool {
    a.mask.is_subset_of(TypeMask::single(ty)) && b.mask.is_subset_of(TypeMask::single(ty))
}

fn transfer(
    opcode: IrOpcode,
    operands: &[Operand],
    regs: &HashMap<VirtualReg, TypeInfo>,
) -> TypeInfo {
    match opcode {
        IrOpcode::LoadConst => match operands.first() {
            Some(Operand::ImmI64(v)) if i32::try_from(*v).is_ok() => {
                TypeInfo::constant(ValueType::Int32, ConstVal::I64(*v))
            }
            Some(Operand::ImmI64(v)) => TypeInfo::constant(ValueType::Number, ConstVal::I64(*v)),
            Some(Operand::ImmF64(v)) => TypeInfo::constant(ValueType::Number, ConstVal::F64(*v)),
            _ => TypeInfo::of(ValueType::Number),
        },
        IrOpcode::LoadBool => match operands.first() {
            Some(Operand::ImmI64(v)) => {
                TypeInfo::constant(ValueType::Boolean, ConstVal::Bool(*v != 0))
            }
            _ => TypeInfo::of(ValueType::Boolean),
        },
        IrOpcode::LoadUndefined => TypeInfo::of(ValueType::Undefined),
        IrOpcode::LoadNull => TypeInfo::of(ValueType::Null),
        IrOpcode::LoadString => TypeInfo::of(ValueType::String),
        IrOpcode::Move => operand_info(&operands[0], regs),
        IrOpcode::Phi => operands
            .iter()
            .map(|op| operand_info(op, regs))
            .fold(TypeInfo::unknown(), TypeInfo::join),
        IrOpcode::Add => {
            let a = operand_info(&operands[0], regs);
            let b = operand_info(&operands[1], regs);
            if a.mask.contains(ValueType::String) || b.mask.contains(ValueType::String) {
                if both(ValueType::String, &a, &b) {
                    TypeInfo::of(ValueType::String)
                } else {
                    // May be numeric or string depending on the inputs
                    TypeInfo {
                        primary: ValueType::String,
                        mask: TypeMask::single(ValueType::String)
                            .union(TypeMask::single(ValueType::Number)),
                        constant: None,
                    }
                }
            } else if both(ValueType::BigInt, &a, &b) {
                TypeInfo::of(ValueType::BigInt)
            } else if both(ValueType::Int32, &a, &b) {
                TypeInfo::of(ValueType::Int32)
            } else {
                TypeInfo::of(ValueType::Number)
            }
        }
        IrOpcode::Sub | IrOpcode::Mul | IrOpcode::Mod => {
            let a = operand_info(&operands[0], regs);
            let b = operand_info(&operands[1], regs);
            if both(ValueType::BigInt, &a, &b) {
                TypeInfo::of(ValueType::BigInt)
            } else if both(ValueType::Int32, &a, &b) && opcode != IrOpcode::Mod {
                TypeInfo::of(ValueType::Int32)
            } else {
                TypeInfo::of(ValueType::Number)
            }
        }
        // Division leaves the integer domain
        IrOpcode::Div => {
            let a = operand_info(&operands[0], regs);
            let b = operand_info(&operands[1], regs);
            if both(ValueType::BigInt, &a, &b) {
                TypeInfo::of(ValueType::BigInt)
            } else {
                TypeInfo::of(ValueType::Number)
            }
        }
        IrOpcode::Neg => {
            let a = operand_info(&operands[0], regs);
            if a.mask.is_subset_of(TypeMask::single(ValueType::BigInt)) {
                TypeInfo::of(ValueType::BigInt)
            } else {
                TypeInfo::of(ValueType::Number)
            }
        }
        IrOpcode::BitAnd
        | IrOpcode::BitOr
        | IrOpcode::BitXor
        | IrOpcode::BitNot
        | IrOpcode::Shl
        | IrOpcode::Shr => {
            let a = operand_info(&operands[0], regs);
            if a.mask.is_subset_of(TypeMask::single(ValueType::BigInt)) {
                TypeInfo::of(ValueType::BigInt)
            } else {
                TypeInfo::of(ValueType::Int32)
            }
        }
        IrOpcode::UShr => TypeInfo::of(ValueType::Number),
        IrOpcode::Not
        | IrOpcode::Eq
        | IrOpcode::Ne
        | IrOpcode::StrictEq
        | IrOpcode::StrictNe
        | IrOpcode::Lt
        | IrOpcode::Le
        | IrOpcode::Gt
        | IrOpcode::Ge => TypeInfo::of(ValueType::Boolean),
        IrOpcode::CreateObject => TypeInfo::of(ValueType::Object),
        IrOpcode::CreateArray => TypeInfo::of(ValueType::Array),
        IrOpcode::FastInvSqrt
        | IrOpcode::FastSin
        | IrOpcode::FastCos
        | IrOpcode::FastExp
        | IrOpcode::FastLog
        | IrOpcode::Fma => TypeInfo::of(ValueType::Number),
        // Property access, calls and environment traffic widen to Any
        _ => TypeInfo::any(),
    }
}
