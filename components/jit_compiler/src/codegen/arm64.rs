//! AArch64 code emission, AAPCS64.
//!
//! Fixed-width 32-bit little-endian words. Arguments arrive in x0-x7;
//! x19-x28 are callee-saved; x16/x17 are kept as emitter scratch, x18 is
//! the platform register, x29/x30 frame and link.

use super::{Architecture, EmitLabel, NativeEmitter};
use crate::register_allocator::PhysReg;

const SP: u32 = 31;
const XZR: u32 = 31;
const FP: u32 = 29;
const LR: u32 = 30;

/// AArch64 emitter.
pub struct Arm64Emitter {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    // (word offset, label, conditional-on register or None)
    fixups: Vec<(usize, EmitLabel, Option<u32>)>,
    frame_size: u32,
}

impl Arm64Emitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            frame_size: 0,
        }
    }

    fn word(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }
}

impl Default for Arm64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEmitter for Arm64Emitter {
    fn arch(&self) -> Architecture {
        Architecture::Arm64
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit_prologue(&mut self, frame_size: u32) {
        // stp x29, x30, [sp, #-16]!
        self.word(0xA9BF0000 | (LR << 10) | (SP << 5) | FP);
        // mov x29, sp  (add x29, sp, #0)
        self.word(0x91000000 | (SP << 5) | FP);
        let aligned = (frame_size + 15) & !15;
        self.frame_size = aligned;
        if aligned > 0 {
            // sub sp, sp, #aligned
            self.word(0xD1000000 | ((aligned & 0xFFF) << 10) | (SP << 5) | SP);
        }
    }

    fn emit_epilogue(&mut self) {
        if self.frame_size > 0 {
            // add sp, sp, #frame
            self.word(0x91000000 | ((self.frame_size & 0xFFF) << 10) | (SP << 5) | SP);
        }
        // ldp x29, x30, [sp], #16
        self.word(0xA8C10000 | (LR << 10) | (SP << 5) | FP);
        // ret
        self.word(0xD65F0000 | (LR << 5));
    }

    fn emit_move_imm64(&mut self, dst: PhysReg, value: u64) {
        let rd = dst.0 as u32;
        // movz + up to three movk, one per 16-bit chunk
        self.word(0xD2800000 | (((value & 0xFFFF) as u32) << 5) | rd);
        for shift in [16u32, 32, 48] {
            let chunk = ((value >> shift) & 0xFFFF) as u32;
            if chunk != 0 {
                self.word(0xF2800000 | ((shift / 16) << 21) | (chunk << 5) | rd);
            }
        }
    }

    fn emit_move_reg(&mut self, dst: PhysReg, src: PhysReg) {
        // orr xd, xzr, xm
        self.word(0xAA000000 | ((src.0 as u32) << 16) | (XZR << 5) | dst.0 as u32);
    }

    fn emit_load(&mut self, dst: PhysReg, base: PhysReg, offset: i32) {
        debug_assert!(offset >= 0 && offset % 8 == 0);
        let imm12 = (offset as u32 / 8) & 0xFFF;
        self.word(0xF9400000 | (imm12 << 10) | ((base.0 as u32) << 5) | dst.0 as u32);
    }

    fn emit_store(&mut self, base: PhysReg, offset: i32, src: PhysReg) {
        debug_assert!(offset >= 0 && offset % 8 == 0);
        let imm12 = (offset as u32 / 8) & 0xFFF;
        self.word(0xF9000000 | (imm12 << 10) | ((base.0 as u32) << 5) | src.0 as u32);
    }

    fn emit_add(&mut self, dst: PhysReg, src: PhysReg) {
        self.word(
            0x8B000000 | ((src.0 as u32) << 16) | ((dst.0 as u32) << 5) | dst.0 as u32,
        );
    }

    fn emit_sub(&mut self, dst: PhysReg, src: PhysReg) {
        self.word(
            0xCB000000 | ((src.0 as u32) << 16) | ((dst.0 as u32) << 5) | dst.0 as u32,
        );
    }

    fn emit_mul(&mut self, dst: PhysReg, src: PhysReg) {
        // madd xd, xd, xm, xzr
        self.word(
            0x9B000000
                | ((src.0 as u32) << 16)
                | (XZR << 10)
                | ((dst.0 as u32) << 5)
                | dst.0 as u32,
        );
    }

    fn create_label(&mut self) -> EmitLabel {
        let label = EmitLabel(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    fn bind_label(&mut self, label: EmitLabel) {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    fn emit_jump(&mut self, label: EmitLabel) {
        self.fixups.push((self.code.len(), label, None));
        self.word(0x14000000);
    }

    fn emit_jump_if_zero(&mut self, reg: PhysReg, label: EmitLabel) {
        // cbz
        self.fixups.push((self.code.len(), label, Some(reg.0 as u32)));
        self.word(0xB4000000 | reg.0 as u32);
    }

    fn emit_call_reg(&mut self, reg: PhysReg) {
        self.word(0xD63F0000 | ((reg.0 as u32) << 5)); // blr
    }

    fn emit_jump_reg(&mut self, reg: PhysReg) {
        self.word(0xD61F0000 | ((reg.0 as u32) << 5)); // br
    }

    fn emit_jump_mem(&mut self, address: u64) {
        // ldr x16, #8; br x16; the target is the literal after the pair.
        // x16 is emitter scratch and never allocated.
        self.word(0x58000000 | (2 << 5) | 16);
        self.word(0xD61F0000 | (16 << 5));
        self.code.extend_from_slice(&address.to_le_bytes());
    }

    fn align_to(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.word(0xD503201F); // nop
        }
    }

    fn arg_regs(&self) -> Vec<PhysReg> {
        (0..8).map(PhysReg).collect()
    }

    fn return_reg(&self) -> PhysReg {
        PhysReg(0)
    }

    fn scratch_regs(&self) -> (PhysReg, PhysReg) {
        (PhysReg(16), PhysReg(17))
    }

    fn finish(&mut self) -> Vec<u8> {
        for (patch, label, cond_reg) in self.fixups.drain(..) {
            let target = self.labels[label.0 as usize].expect("unbound emitter label") as i64;
            let delta_words = ((target - patch as i64) / 4) as i32;
            let word = match cond_reg {
                None => 0x14000000 | ((delta_words as u32) & 0x03FF_FFFF),
                Some(rt) => {
                    0xB4000000 | (((delta_words as u32) & 0x7FFFF) << 5) | rt
                }
            };
            self.code[patch..patch + 4].copy_from_slice(&word.to_le_bytes());
        }
        std::mem::take(&mut self.code)
    }
}
