//! Byte-for-byte decode/encode identity over representative streams.

use bytecode_system::{
    validate, BytecodeBlock, BytecodeDecoder, BytecodeEncoder, Constant, Opcode,
};

fn reencode(code: &[u8]) -> Vec<u8> {
    let mut decoder = BytecodeDecoder::new(code);
    let mut out = Vec::new();
    while let Some(inst) = decoder.next_instruction().unwrap() {
        inst.encode_into(&mut out);
    }
    out
}

#[test]
fn test_every_opcode_roundtrips() {
    // One instruction per opcode byte, operands chosen to exercise widths.
    let mut enc = BytecodeEncoder::new();
    for byte in 0u8..=255 {
        if let Some(op) = Opcode::from_byte(byte) {
            if op.is_jump() {
                continue; // exercised separately with bound labels
            }
            let operands: Vec<u32> = op
                .operand_types()
                .iter()
                .enumerate()
                .map(|(i, _)| (i as u32 + 1) * 3)
                .collect();
            enc.emit(op, &operands);
        }
    }
    let code = enc.finish().unwrap();
    assert_eq!(reencode(&code), code);
}

#[test]
fn test_loop_shape_roundtrips() {
    // while (cond) { body } lowered the usual way
    let mut enc = BytecodeEncoder::new();
    let head = enc.create_label();
    let exit = enc.create_label();
    enc.bind_label(head).unwrap();
    enc.emit(Opcode::LoadLocal, &[0]);
    enc.emit_number(100.0);
    enc.emit(Opcode::LessThan, &[]);
    enc.emit_jump(Opcode::JumpIfFalse, exit);
    enc.emit(Opcode::LoadLocal, &[0]);
    enc.emit_number(1.0);
    enc.emit(Opcode::Add, &[]);
    enc.emit(Opcode::StoreLocal, &[0]);
    enc.emit_jump(Opcode::Jump, head);
    enc.bind_label(exit).unwrap();
    enc.emit(Opcode::LoadUndefined, &[]);
    enc.emit(Opcode::Return, &[]);
    let code = enc.finish().unwrap();

    assert_eq!(reencode(&code), code);

    let mut block = BytecodeBlock::new();
    block.code = code;
    block.local_count = 1;
    assert!(validate(&block).is_empty());
}

#[test]
fn test_validated_block_with_constants() {
    let mut block = BytecodeBlock::new();
    let idx = block.add_constant(Constant::Number(42.0));
    let mut enc = BytecodeEncoder::new();
    enc.emit(Opcode::LoadConst, &[idx]);
    enc.emit(Opcode::Return, &[]);
    block.code = enc.finish().unwrap();
    assert!(validate(&block).is_empty());
    assert_eq!(block.instruction_count(), 2);
}
