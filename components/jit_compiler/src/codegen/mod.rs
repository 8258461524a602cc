//! Architecture-specific native code emission.
//!
//! One [`NativeEmitter`] interface with three implementations: x86-64
//! (System-V), AArch64 (AAPCS64) and RISC-V (LP64D). The baseline JIT and
//! the tracing JIT both consume this interface; the implementation is
//! selected once at engine construction from the host triple, never by
//! conditional compilation at call sites.

mod arm64;
mod riscv64;
mod x86_64;

pub use arm64::Arm64Emitter;
pub use riscv64::RiscV64Emitter;
pub use x86_64::X86_64Emitter;

use crate::register_allocator::{PhysReg, PhysRegFile};

/// Target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// x86-64, System-V AMD64 calling convention
    X86_64,
    /// AArch64, AAPCS64
    Arm64,
    /// RV64, LP64D
    RiscV64,
}

impl Architecture {
    /// The architecture of the machine this engine is running on.
    pub fn host() -> Architecture {
        use target_lexicon::Architecture as A;
        match target_lexicon::HOST.architecture {
            A::Aarch64(_) => Architecture::Arm64,
            A::Riscv64(_) => Architecture::RiscV64,
            _ => Architecture::X86_64,
        }
    }
}

/// A label inside an emitter's code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitLabel(pub u32);

/// The per-architecture code generator interface.
///
/// Registers are named by their hardware encoding ([`PhysReg`]); the
/// register files returned by [`reg_file_for`] exclude ABI-reserved
/// registers, so any register the allocator hands out is encodable here.
pub trait NativeEmitter {
    /// The architecture this emitter targets.
    fn arch(&self) -> Architecture;

    /// Bytes emitted so far.
    fn offset(&self) -> usize;

    /// Function prologue, reserving `frame_size` bytes of stack.
    fn emit_prologue(&mut self, frame_size: u32);

    /// Function epilogue and return.
    fn emit_epilogue(&mut self);

    /// Load a 64-bit immediate.
    fn emit_move_imm64(&mut self, dst: PhysReg, value: u64);

    /// Register-to-register move.
    fn emit_move_reg(&mut self, dst: PhysReg, src: PhysReg);

    /// Load from `[base + offset]`.
    fn emit_load(&mut self, dst: PhysReg, base: PhysReg, offset: i32);

    /// Store to `[base + offset]`.
    fn emit_store(&mut self, base: PhysReg, offset: i32, src: PhysReg);

    /// `dst += src`.
    fn emit_add(&mut self, dst: PhysReg, src: PhysReg);

    /// `dst -= src`.
    fn emit_sub(&mut self, dst: PhysReg, src: PhysReg);

    /// `dst *= src`.
    fn emit_mul(&mut self, dst: PhysReg, src: PhysReg);

    /// Create an unbound label.
    fn create_label(&mut self) -> EmitLabel;

    /// Bind a label at the current offset.
    fn bind_label(&mut self, label: EmitLabel);

    /// Unconditional jump to a label.
    fn emit_jump(&mut self, label: EmitLabel);

    /// Jump to `label` when `reg` is zero.
    fn emit_jump_if_zero(&mut self, reg: PhysReg, label: EmitLabel);

    /// Indirect call through a register.
    fn emit_call_reg(&mut self, reg: PhysReg);

    /// Indirect jump through a register.
    fn emit_jump_reg(&mut self, reg: PhysReg);

    /// Indirect jump through a memory operand: the 64-bit target address
    /// is embedded as literal data trailing the jump, and the jump reads
    /// it from there. No allocatable register is touched.
    fn emit_jump_mem(&mut self, address: u64);

    /// Pad with no-ops to the given power-of-two alignment. Used for
    /// cache-line alignment of hot blocks during finalization.
    fn align_to(&mut self, alignment: usize);

    /// Argument-passing registers, in order.
    fn arg_regs(&self) -> Vec<PhysReg>;

    /// Return-value register.
    fn return_reg(&self) -> PhysReg;

    /// Two scratch registers never handed to the allocator; side-exit
    /// trampolines load the exit index and trace id into these.
    fn scratch_regs(&self) -> (PhysReg, PhysReg);

    /// Resolve all fixups and return the finished code.
    fn finish(&mut self) -> Vec<u8>;
}

/// Construct the emitter for an architecture.
pub fn emitter_for(arch: Architecture) -> Box<dyn NativeEmitter> {
    match arch {
        Architecture::X86_64 => Box::new(X86_64Emitter::new()),
        Architecture::Arm64 => Box::new(Arm64Emitter::new()),
        Architecture::RiscV64 => Box::new(RiscV64Emitter::new()),
    }
}

/// The allocatable register file for an architecture.
///
/// The stack pointer is reserved unconditionally and the frame pointer
/// whenever debug info is requested; scratch registers used by the
/// emitters are excluded as well.
pub fn reg_file_for(arch: Architecture, debug_info: bool) -> PhysRegFile {
    match arch {
        Architecture::X86_64 => {
            // rsp(4) reserved; r10/r11 are emitter scratch; rbp(5) joins
            // the allocatable set only without debug info
            let mut gp: Vec<PhysReg> = [0u8, 1, 2, 3, 6, 7, 8, 9, 12, 13, 14, 15]
                .iter()
                .map(|r| PhysReg(*r))
                .collect();
            if !debug_info {
                gp.push(PhysReg(5));
            }
            PhysRegFile {
                gp,
                fp: (0..8).map(PhysReg).collect(),        // xmm0-xmm7
                vec: (8..14).map(PhysReg).collect(),      // xmm8-xmm13
            }
        }
        Architecture::Arm64 => {
            // sp/x18 platform, x16/x17 scratch, x29 frame, x30 link
            let mut gp: Vec<PhysReg> = (0..16).map(PhysReg).collect();
            gp.extend((19..29).map(PhysReg));
            if debug_info {
                gp.retain(|r| r.0 != 29);
            }
            PhysRegFile {
                gp,
                fp: (0..8).map(PhysReg).collect(),        // v0-v7
                vec: (16..24).map(PhysReg).collect(),     // v16-v23
            }
        }
        Architecture::RiscV64 => {
            // x0 zero, x1 ra, x2 sp, x3 gp, x4 tp reserved; x30/x31 scratch
            let mut gp: Vec<PhysReg> = (5..30).map(PhysReg).collect();
            if debug_info {
                gp.retain(|r| r.0 != 8); // s0 becomes the frame pointer
            }
            PhysRegFile {
                gp,
                fp: (10..18).map(PhysReg).collect(),      // fa0-fa7
                vec: (0..8).map(PhysReg).collect(),       // v0-v7
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_files_exclude_stack_pointer() {
        let x86 = reg_file_for(Architecture::X86_64, false);
        assert!(!x86.gp.contains(&PhysReg(4)), "rsp is never allocatable");
        let arm = reg_file_for(Architecture::Arm64, false);
        assert!(!arm.gp.contains(&PhysReg(31)));
        assert!(!arm.gp.contains(&PhysReg(30)));
        let riscv = reg_file_for(Architecture::RiscV64, false);
        assert!(!riscv.gp.contains(&PhysReg(2)));
    }

    #[test]
    fn test_debug_info_reserves_frame_pointer() {
        let with = reg_file_for(Architecture::X86_64, true);
        let without = reg_file_for(Architecture::X86_64, false);
        assert!(!with.gp.contains(&PhysReg(5)));
        assert!(without.gp.contains(&PhysReg(5)));
    }

    #[test]
    fn test_emitters_constructible_for_all_arches() {
        for arch in [Architecture::X86_64, Architecture::Arm64, Architecture::RiscV64] {
            let mut emitter = emitter_for(arch);
            assert_eq!(emitter.arch(), arch);
            emitter.emit_prologue(16);
            emitter.emit_epilogue();
            let code = emitter.finish();
            assert!(!code.is_empty());
        }
    }

    #[test]
    fn test_scratch_not_in_alloc_file() {
        for arch in [Architecture::X86_64, Architecture::Arm64, Architecture::RiscV64] {
            let emitter = emitter_for(arch);
            let file = reg_file_for(arch, true);
            let (s0, s1) = emitter.scratch_regs();
            assert!(!file.gp.contains(&s0));
            assert!(!file.gp.contains(&s1));
        }
    }
}
