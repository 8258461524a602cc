//! Bytecode encoder.
//!
//! Maintains a byte buffer, a label table and a jump-fixup list. Forward
//! jumps emit a 4-byte placeholder and record `(patch_offset, label)`;
//! `finish` drains the fixup list and overwrites each placeholder with the
//! resolved absolute offset. An unresolved label fails with
//! `InvalidBytecode`.

use crate::opcode::{Opcode, OperandType};
use core_types::{CompileError, CompileErrorKind, StringId};

/// Handle to a label created by [`BytecodeEncoder::create_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// Builder for a function's bytecode stream.
#[derive(Debug, Default)]
pub struct BytecodeEncoder {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl BytecodeEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write offset.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Create an unbound label.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind a label to the current offset. Binding twice is a
    /// `DuplicateLabel` error.
    pub fn bind_label(&mut self, label: Label) -> Result<(), CompileError> {
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(CompileError::new(
                CompileErrorKind::DuplicateLabel,
                self.code.len(),
                format!("label {} bound twice", label.0),
            ));
        }
        *slot = Some(self.code.len() as u32);
        Ok(())
    }

    fn write_operand(&mut self, ty: OperandType, value: u32) {
        match ty {
            OperandType::None => {}
            OperandType::U8 => self.code.push(value as u8),
            OperandType::U16 => self.code.extend_from_slice(&(value as u16).to_le_bytes()),
            OperandType::U32 => self.code.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Emit an instruction with its operands in table order.
    ///
    /// # Panics
    /// Panics when the operand count does not match the opcode table; the
    /// lowering is expected to be written against the table.
    pub fn emit(&mut self, opcode: Opcode, operands: &[u32]) {
        let types = opcode.operand_types();
        assert_eq!(
            types.len(),
            operands.len(),
            "{} expects {} operands",
            opcode.mnemonic(),
            types.len()
        );
        self.code.push(opcode as u8);
        for (ty, &value) in types.iter().zip(operands) {
            self.write_operand(*ty, value);
        }
    }

    /// Emit a jump to `label`, leaving a placeholder to be fixed up.
    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(opcode.is_jump());
        self.code.push(opcode as u8);
        self.fixups.push((self.code.len(), label));
        self.code.extend_from_slice(&u32::MAX.to_le_bytes());
    }

    /// Emit an inline double literal, serialized little-endian.
    pub fn emit_number(&mut self, value: f64) {
        let bits = value.to_bits();
        self.emit(
            Opcode::LoadNumber,
            &[bits as u32, (bits >> 32) as u32],
        );
    }

    /// Emit an interned string load by its 32-bit id.
    pub fn emit_string(&mut self, id: StringId) {
        self.emit(Opcode::LoadString, &[id.0]);
    }

    /// Resolve all fixups and return the finished byte stream.
    pub fn finish(mut self) -> Result<Vec<u8>, CompileError> {
        for (patch_offset, label) in self.fixups.drain(..) {
            let target = self.labels[label.0 as usize].ok_or_else(|| {
                CompileError::new(
                    CompileErrorKind::InvalidBytecode,
                    patch_offset,
                    format!("unresolved label {}", label.0),
                )
            })?;
            self.code[patch_offset..patch_offset + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::BytecodeDecoder;

    #[test]
    fn test_emit_and_decode() {
        let mut enc = BytecodeEncoder::new();
        enc.emit(Opcode::LoadTrue, &[]);
        enc.emit(Opcode::LoadConst, &[7]);
        enc.emit(Opcode::Add, &[]);
        enc.emit(Opcode::Return, &[]);
        let code = enc.finish().unwrap();

        let mut decoder = BytecodeDecoder::new(&code);
        let ops: Vec<_> = std::iter::from_fn(|| decoder.next_instruction().unwrap())
            .map(|i| i.opcode)
            .collect();
        assert_eq!(
            ops,
            vec![Opcode::LoadTrue, Opcode::LoadConst, Opcode::Add, Opcode::Return]
        );
    }

    #[test]
    fn test_forward_jump_fixup() {
        let mut enc = BytecodeEncoder::new();
        let end = enc.create_label();
        enc.emit(Opcode::LoadTrue, &[]);
        enc.emit_jump(Opcode::JumpIfFalse, end);
        enc.emit(Opcode::LoadNull, &[]);
        enc.emit(Opcode::Pop, &[]);
        enc.bind_label(end).unwrap();
        enc.emit(Opcode::Return, &[]);
        let code = enc.finish().unwrap();

        let mut decoder = BytecodeDecoder::new(&code);
        decoder.next_instruction().unwrap();
        let jump = decoder.next_instruction().unwrap().unwrap();
        assert_eq!(jump.opcode, Opcode::JumpIfFalse);
        // Target is the absolute offset of Return: 1 + 5 + 1 + 1
        assert_eq!(jump.operands()[0], 8);
    }

    #[test]
    fn test_backward_jump() {
        let mut enc = BytecodeEncoder::new();
        let top = enc.create_label();
        enc.bind_label(top).unwrap();
        enc.emit(Opcode::Nop, &[]);
        enc.emit_jump(Opcode::Jump, top);
        let code = enc.finish().unwrap();

        let mut decoder = BytecodeDecoder::new(&code);
        decoder.next_instruction().unwrap();
        let jump = decoder.next_instruction().unwrap().unwrap();
        assert_eq!(jump.operands()[0], 0);
    }

    #[test]
    fn test_unresolved_label_fails() {
        let mut enc = BytecodeEncoder::new();
        let dangling = enc.create_label();
        enc.emit_jump(Opcode::Jump, dangling);
        let err = enc.finish().unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidBytecode);
    }

    #[test]
    fn test_duplicate_label_fails() {
        let mut enc = BytecodeEncoder::new();
        let label = enc.create_label();
        enc.bind_label(label).unwrap();
        let err = enc.bind_label(label).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::DuplicateLabel);
    }

    #[test]
    fn test_number_little_endian() {
        let mut enc = BytecodeEncoder::new();
        enc.emit_number(2.5);
        let code = enc.finish().unwrap();
        assert_eq!(code[0], Opcode::LoadNumber as u8);
        assert_eq!(&code[1..9], &2.5f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_encode_decode_reencode_is_identity() {
        let mut enc = BytecodeEncoder::new();
        enc.emit(Opcode::LoadConst, &[3]);
        enc.emit_number(1.5);
        enc.emit(Opcode::GetProperty, &[12, 0]);
        enc.emit(Opcode::Call, &[2]);
        enc.emit(Opcode::Return, &[]);
        let original = enc.finish().unwrap();

        let mut decoder = BytecodeDecoder::new(&original);
        let mut reencoded = Vec::new();
        while let Some(inst) = decoder.next_instruction().unwrap() {
            inst.encode_into(&mut reencoded);
        }
        assert_eq!(original, reencoded);
    }
}
