//! RV64 code emission, LP64D.
//!
//! Base-ISA I/R/S/B-type encodings. Arguments arrive in a0-a7 (x10-x17);
//! s-registers are callee-saved; x30/x31 (t5/t6) are kept as emitter
//! scratch; x1 is the return address, x2 the stack pointer.

use super::{Architecture, EmitLabel, NativeEmitter};
use crate::register_allocator::PhysReg;

const ZERO: u32 = 0;
const RA: u32 = 1;
const SP: u32 = 2;

/// RV64 emitter.
pub struct RiscV64Emitter {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    // (word offset, label, branch-on-zero register or None)
    fixups: Vec<(usize, EmitLabel, Option<u32>)>,
    frame_size: u32,
}

impl RiscV64Emitter {
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

    fn i_type(&mut self, opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) {
        self.word(
            ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode,
        );
    }

    fn r_type(&mut self, funct7: u32, funct3: u32, rd: u32, rs1: u32, rs2: u32) {
        self.word((funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0x33);
    }

    fn s_type(&mut self, funct3: u32, rs1: u32, rs2: u32, imm: i32) {
        let imm = imm as u32;
        self.word(
            ((imm >> 5) << 25)
                | (rs2 << 20)
                | (rs1 << 15)
                | (funct3 << 12)
                | ((imm & 0x1F) << 7)
                | 0x23,
        );
    }

    fn addi(&mut self, rd: u32, rs1: u32, imm: i32) {
        self.i_type(0x13, 0b000, rd, rs1, imm);
    }
}

impl Default for RiscV64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEmitter for RiscV64Emitter {
    fn arch(&self) -> Architecture {
        Architecture::RiscV64
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit_prologue(&mut self, frame_size: u32) {
        let aligned = ((frame_size + 15) & !15) + 16;
        self.frame_size = aligned;
        // addi sp, sp, -frame; sd ra, frame-8(sp); sd s0, frame-16(sp)
        self.addi(SP, SP, -(aligned as i32));
        self.s_type(0b011, SP, RA, aligned as i32 - 8);
        self.s_type(0b011, SP, 8, aligned as i32 - 16);
        // mv s0, sp
        self.addi(8, SP, 0);
    }

    fn emit_epilogue(&mut self) {
        let frame = self.frame_size as i32;
        // ld ra/s0 back, release the frame, ret
        self.i_type(0x03, 0b011, RA, SP, frame - 8);
        self.i_type(0x03, 0b011, 8, SP, frame - 16);
        self.addi(SP, SP, frame);
        self.i_type(0x67, 0b000, ZERO, RA, 0); // jalr x0, 0(ra)
    }

    fn emit_move_imm64(&mut self, dst: PhysReg, value: u64) {
        let rd = dst.0 as u32;
        // Build the value 11 bits at a time, top down: ori immediates are
        // 12-bit signed, so chunks stay positive
        self.addi(rd, ZERO, ((value >> 55) & 0x7FF) as i32);
        for chunk_index in (0..5).rev() {
            let chunk = ((value >> (chunk_index * 11)) & 0x7FF) as i32;
            // slli rd, rd, 11
            self.i_type(0x13, 0b001, rd, rd, 11);
            if chunk != 0 {
                self.i_type(0x13, 0b110, rd, rd, chunk); // ori
            }
        }
    }

    fn emit_move_reg(&mut self, dst: PhysReg, src: PhysReg) {
        self.addi(dst.0 as u32, src.0 as u32, 0);
    }

    fn emit_load(&mut self, dst: PhysReg, base: PhysReg, offset: i32) {
        self.i_type(0x03, 0b011, dst.0 as u32, base.0 as u32, offset); // ld
    }

    fn emit_store(&mut self, base: PhysReg, offset: i32, src: PhysReg) {
        self.s_type(0b011, base.0 as u32, src.0 as u32, offset); // sd
    }

    fn emit_add(&mut self, dst: PhysReg, src: PhysReg) {
        self.r_type(0, 0b000, dst.0 as u32, dst.0 as u32, src.0 as u32);
    }

    fn emit_sub(&mut self, dst: PhysReg, src: PhysReg) {
        self.r_type(0x20, 0b000, dst.0 as u32, dst.0 as u32, src.0 as u32);
    }

    fn emit_mul(&mut self, dst: PhysReg, src: PhysReg) {
        self.r_type(0x01, 0b000, dst.0 as u32, dst.0 as u32, src.0 as u32);
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
        self.word(0x6F); // jal x0, 0
    }

    fn emit_jump_if_zero(&mut self, reg: PhysReg, label: EmitLabel) {
        self.fixups.push((self.code.len(), label, Some(reg.0 as u32)));
        // beq reg, x0, 0
        self.word((reg.0 as u32) << 15 | 0x63);
    }

    fn emit_call_reg(&mut self, reg: PhysReg) {
        self.i_type(0x67, 0b000, RA, reg.0 as u32, 0); // jalr ra, 0(reg)
    }

    fn emit_jump_reg(&mut self, reg: PhysReg) {
        self.i_type(0x67, 0b000, ZERO, reg.0 as u32, 0); // jalr x0, 0(reg)
    }

    fn emit_jump_mem(&mut self, address: u64) {
        // auipc t6, 0; ld t6, 12(t6); jalr x0, 0(t6); the target is the
        // literal after the three-instruction sequence. t6 is emitter
        // scratch and never allocated.
        self.word((31 << 7) | 0x17); // auipc x31, 0
        self.i_type(0x03, 0b011, 31, 31, 12);
        self.i_type(0x67, 0b000, ZERO, 31, 0);
        self.code.extend_from_slice(&address.to_le_bytes());
    }

    fn align_to(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.addi(ZERO, ZERO, 0); // nop
        }
    }

    fn arg_regs(&self) -> Vec<PhysReg> {
        (10..18).map(PhysReg).collect() // a0-a7
    }

    fn return_reg(&self) -> PhysReg {
        PhysReg(10) // a0
    }

    fn scratch_regs(&self) -> (PhysReg, PhysReg) {
        (PhysReg(30), PhysReg(31)) // t5, t6
    }

    fn finish(&mut self) -> Vec<u8> {
        for (patch, label, cond_reg) in self.fixups.drain(..) {
            let target = self.labels[label.0 as usize].expect("unbound emitter label") as i64;
            let delta = (target - patch as i64) as i32;
            let word = match cond_reg {
                None => {
                    // JAL x0: imm[20|10:1|11|19:12]
                    let imm = delta as u32;
                    0x6F | (((imm >> 20) & 1) << 31)
                        | (((imm >> 1) & 0x3FF) << 21)
                        | (((imm >> 11) & 1) << 20)
                        | (((imm >> 12) & 0xFF) << 12)
                }
                Some(rs1) => {
                    // BEQ rs1, x0: imm[12|10:5] ... imm[4:1|11]
                    let imm = delta as u32;
                    0x63 | (((imm >> 12) & 1) << 31)
                        | (((imm >> 5) & 0x3F) << 25)
                        | (ZERO << 20)
                        | (rs1 << 15)
                        | (((imm >> 1) & 0xF) << 8)
                        | (((imm >> 11) & 1) << 7)
                }
            };
            self.code[patch..patch + 4].copy_from_slice(&word.to_le_bytes());
        }
        std::mem::take(&mut self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_addi_encoding() {
        let mut e = RiscV64Emitter::new();
        e.emit_move_reg(PhysReg(10), PhysReg(11)); // addi a0, a1, 0
        let w = words(&e.finish());
        assert_eq!(w[0], (11 << 15) | (10 << 7) | 0x13);
    }

    #[test]
    fn test_add_sub_mul() {
        let mut e = RiscV64Emitter::new();
        e.emit_add(PhysReg(5), PhysReg(6));
        e.emit_sub(PhysReg(5), PhysReg(6));
        e.emit_mul(PhysReg(5), PhysReg(6));
        let w = words(&e.finish());
        assert_eq!(w[0], (6 << 20) | (5 << 15) | (5 << 7) | 0x33);
        assert_eq!(w[1], (0x20 << 25) | (6 << 20) | (5 << 15) | (5 << 7) | 0x33);
        assert_eq!(w[2], (0x01 << 25) | (6 << 20) | (5 << 15) | (5 << 7) | 0x33);
    }

    #[test]
    fn test_move_imm64_roundtrip_by_decode() {
        // Decode the addi/slli/ori stream and recompute the constant
        let value = 0x0123_4567_89AB_CDEFu64;
        let mut e = RiscV64Emitter::new();
        e.emit_move_imm64(PhysReg(5), value);
        let mut acc: u64 = 0;
        for w in words(&e.finish()) {
            let opcode = w & 0x7F;
            let funct3 = (w >> 12) & 7;
            let imm = (w >> 20) & 0xFFF;
            assert_eq!(opcode, 0x13);
            match funct3 {
                0b000 => acc = imm as u64,        // addi seed
                0b001 => acc <<= imm,             // slli
                0b110 => acc |= imm as u64,       // ori
                _ => panic!("unexpected funct3"),
            }
        }
        assert_eq!(acc, value);
    }

    #[test]
    fn test_jal_forward_resolution() {
        let mut e = RiscV64Emitter::new();
        let label = e.create_label();
        e.emit_jump(label);
        e.align_to(16);
        e.bind_label(label);
        e.emit_jump_reg(PhysReg(5));
        let w = words(&e.finish());
        // delta 16: imm[20]=0, imm[10:1]=8, imm[11]=0, imm[19:12]=0
        assert_eq!(w[0], 0x6F | (8 << 21));
    }

    #[test]
    fn test_jump_mem_shape() {
        let mut e = RiscV64Emitter::new();
        e.emit_jump_mem(0x4000);
        let code = e.finish();
        let w = words(&code[..12]);
        assert_eq!(w[0], (31 << 7) | 0x17); // auipc t6, 0
        assert_eq!(w[1], (12 << 20) | (31 << 15) | (0b011 << 12) | (31 << 7) | 0x03); // ld
        assert_eq!(w[2], (31 << 15) | 0x67); // jalr x0, 0(t6)
        assert_eq!(&code[12..20], &0x4000u64.to_le_bytes());
    }

    #[test]
    fn test_prologue_saves_ra_and_fp() {
        let mut e = RiscV64Emitter::new();
        e.emit_prologue(8);
        e.emit_epilogue();
        let w = words(&e.finish());
        // addi sp,sp,-32; sd ra; sd s0; mv s0,sp; ld ra; ld s0; addi; ret
        assert_eq!(w.len(), 8);
        assert_eq!(w[0] & 0x7F, 0x13);
        assert_eq!(w[w.len() - 1], (RA << 15) | 0x67);
    }
}
