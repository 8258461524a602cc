//! x86-64 code emission, System-V AMD64.
//!
//! Hand-rolled REX/ModRM encoding for the instruction subset the JIT
//! tiers use. Integer arguments arrive in RDI, RSI, RDX, RCX, R8, R9;
//! RBX, R12-R15, RBP are callee-saved; RSP is reserved. R10/R11 are kept
//! as emitter scratch and never allocated.

use super::{Architecture, EmitLabel, NativeEmitter};
use crate::register_allocator::PhysReg;

const RSP: u8 = 4;
const RBP: u8 = 5;

/// x86-64 emitter.
#[allow(non_camel_case_types)]
pub struct X86_64Emitter {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    // (patch offset of the rel32, label)
    fixups: Vec<(usize, EmitLabel)>,
}

impl X86_64Emitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn byte(&mut self, value: u8) {
        self.code.push(value);
    }

    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if rm >= 8 {
            rex |= 0x01;
        }
        self.byte(rex);
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.byte((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM for `[base + disp32]`, inserting a SIB byte when the base
    /// register encoding demands one.
    fn mem_operand(&mut self, reg: u8, base: u8, offset: i32) {
        self.modrm(0b10, reg, base);
        if base & 7 == RSP {
            self.byte(0x24); // SIB: scale 1, no index, base
        }
        self.code.extend_from_slice(&offset.to_le_bytes());
    }

    fn alu_rr(&mut self, opcode: u8, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.byte(opcode);
        self.modrm(0b11, src, dst);
    }
}

impl Default for X86_64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEmitter for X86_64Emitter {
    fn arch(&self) -> Architecture {
        Architecture::X86_64
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit_prologue(&mut self, frame_size: u32) {
        // push rbp; mov rbp, rsp
        self.byte(0x55);
        self.alu_rr(0x89, RBP, RSP);
        if frame_size > 0 {
            // sub rsp, imm32 (16-byte keeps calls aligned)
            let aligned = (frame_size + 15) & !15;
            self.rex(true, 0, RSP);
            self.byte(0x81);
            self.modrm(0b11, 5, RSP);
            self.code.extend_from_slice(&aligned.to_le_bytes());
        }
    }

    fn emit_epilogue(&mut self) {
        // mov rsp, rbp; pop rbp; ret
        self.alu_rr(0x89, RSP, RBP);
        self.byte(0x5D);
        self.byte(0xC3);
    }

    fn emit_move_imm64(&mut self, dst: PhysReg, value: u64) {
        self.rex(true, 0, dst.0);
        self.byte(0xB8 + (dst.0 & 7));
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_move_reg(&mut self, dst: PhysReg, src: PhysReg) {
        self.alu_rr(0x89, dst.0, src.0);
    }

    fn emit_load(&mut self, dst: PhysReg, base: PhysReg, offset: i32) {
        self.rex(true, dst.0, base.0);
        self.byte(0x8B);
        self.mem_operand(dst.0, base.0, offset);
    }

    fn emit_store(&mut self, base: PhysReg, offset: i32, src: PhysReg) {
        self.rex(true, src.0, base.0);
        self.byte(0x89);
        self.mem_operand(src.0, base.0, offset);
    }

    fn emit_add(&mut self, dst: PhysReg, src: PhysReg) {
        self.alu_rr(0x01, dst.0, src.0);
    }

    fn emit_sub(&mut self, dst: PhysReg, src: PhysReg) {
        self.alu_rr(0x29, dst.0, src.0);
    }

    fn emit_mul(&mut self, dst: PhysReg, src: PhysReg) {
        // imul dst, src
        self.rex(true, dst.0, src.0);
        self.byte(0x0F);
        self.byte(0xAF);
        self.modrm(0b11, dst.0, src.0);
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
        self.byte(0xE9);
        self.fixups.push((self.code.len(), label));
        self.code.extend_from_slice(&0i32.to_le_bytes());
    }

    fn emit_jump_if_zero(&mut self, reg: PhysReg, label: EmitLabel) {
        // test reg, reg; jz rel32
        self.alu_rr(0x85, reg.0, reg.0);
        self.byte(0x0F);
        self.byte(0x84);
        self.fixups.push((self.code.len(), label));
        self.code.extend_from_slice(&0i32.to_le_bytes());
    }

    fn emit_call_reg(&mut self, reg: PhysReg) {
        if reg.0 >= 8 {
            self.byte(0x41);
        }
        self.byte(0xFF);
        self.modrm(0b11, 2, reg.0);
    }

    fn emit_jump_reg(&mut self, reg: PhysReg) {
        if reg.0 >= 8 {
            self.byte(0x41);
        }
        self.byte(0xFF);
        self.modrm(0b11, 4, reg.0);
    }

    fn emit_jump_mem(&mut self, address: u64) {
        // jmp [rip+0]: the target is the 8-byte literal directly after
        // the instruction
        self.byte(0xFF);
        self.byte(0x25);
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self.code.extend_from_slice(&address.to_le_bytes());
    }

    fn align_to(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.byte(0x90);
        }
    }

    fn arg_regs(&self) -> Vec<PhysReg> {
        // rdi, rsi, rdx, rcx, r8, r9
        vec![
            PhysReg(7),
            PhysReg(6),
            PhysReg(2),
            PhysReg(1),
            PhysReg(8),
            PhysReg(9),
        ]
    }

    fn return_reg(&self) -> PhysReg {
        PhysReg(0) // rax
    }

    fn scratch_regs(&self) -> (PhysReg, PhysReg) {
        (PhysReg(10), PhysReg(11)) // r10, r11
    }

    fn finish(&mut self) -> Vec<u8> {
        for (patch, label) in self.fixups.drain(..) {
            let target = self.labels[label.0 as usize].expect("unbound emitter label") as i64;
            let rel = target - (patch as i64 + 4);
            self.code[patch..patch + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        std::mem::take(&mut self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mov_imm64_encoding() {
        let mut e = X86_64Emitter::new();
        e.emit_move_imm64(PhysReg(0), 0x1122334455667788);
        let code = e.finish();
        // REX.W + B8 io
        assert_eq!(code[0], 0x48);
        assert_eq!(code[1], 0xB8);
        assert_eq!(&code[2..10], &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn test_mov_imm64_extended_reg() {
        let mut e = X86_64Emitter::new();
        e.emit_move_imm64(PhysReg(10), 1);
        let code = e.finish();
        assert_eq!(code[0], 0x49); // REX.W|B
        assert_eq!(code[1], 0xBA); // B8 + (r10 & 7)
    }

    #[test]
    fn test_mov_reg_reg() {
        let mut e = X86_64Emitter::new();
        e.emit_move_reg(PhysReg(3), PhysReg(1)); // mov rbx, rcx
        let code = e.finish();
        assert_eq!(code, vec![0x48, 0x89, 0xCB]);
    }

    #[test]
    fn test_load_store_with_sib_for_rsp() {
        let mut e = X86_64Emitter::new();
        e.emit_load(PhysReg(0), PhysReg(4), 8); // mov rax, [rsp+8]
        let code = e.finish();
        assert_eq!(&code[..4], &[0x48, 0x8B, 0x84, 0x24]);
        assert_eq!(&code[4..8], &8i32.to_le_bytes());
    }

    #[test]
    fn test_prologue_epilogue_shape() {
        let mut e = X86_64Emitter::new();
        e.emit_prologue(24);
        e.emit_epilogue();
        let code = e.finish();
        assert_eq!(code[0], 0x55); // push rbp
        assert_eq!(&code[1..4], &[0x48, 0x89, 0xE5]); // mov rbp, rsp
        // sub rsp rounds 24 up to 32
        assert_eq!(&code[4..7], &[0x48, 0x81, 0xEC]);
        assert_eq!(&code[7..11], &32u32.to_le_bytes());
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_forward_jump_resolves() {
        let mut e = X86_64Emitter::new();
        let label = e.create_label();
        e.emit_jump(label);
        e.align_to(16);
        e.bind_label(label);
        e.emit_epilogue();
        let code = e.finish();
        let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(5 + rel as usize, 16);
    }

    #[test]
    fn test_jump_if_zero_shape() {
        let mut e = X86_64Emitter::new();
        let label = e.create_label();
        e.emit_jump_if_zero(PhysReg(0), label);
        e.bind_label(label);
        let code = e.finish();
        // test rax, rax; jz +0
        assert_eq!(&code[..3], &[0x48, 0x85, 0xC0]);
        assert_eq!(&code[3..5], &[0x0F, 0x84]);
        assert_eq!(&code[5..9], &0i32.to_le_bytes());
    }

    #[test]
    fn test_call_and_jump_reg() {
        let mut e = X86_64Emitter::new();
        e.emit_call_reg(PhysReg(10));
        e.emit_jump_reg(PhysReg(11));
        let code = e.finish();
        assert_eq!(&code[..3], &[0x41, 0xFF, 0xD2]); // call r10
        assert_eq!(&code[3..6], &[0x41, 0xFF, 0xE3]); // jmp r11
    }

    #[test]
    fn test_jump_mem_embeds_literal() {
        let mut e = X86_64Emitter::new();
        e.emit_jump_mem(0x1122334455667788);
        let code = e.finish();
        // jmp [rip+0] then the target as trailing data
        assert_eq!(&code[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&code[6..14], &0x1122334455667788u64.to_le_bytes());
    }
}
