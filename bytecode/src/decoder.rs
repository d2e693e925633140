use crate::instruction::{Constant, Instruction};
use crate::op::Op;

/// Decode the instruction starting at `pc`.
///
/// Returns the instruction and the offset of its successor. Decoding never
/// fails: bytes that do not form a valid instruction (including an
/// instruction cut short by the end of the buffer) come back as
/// [`Instruction::Unknown`] carrying the opcode byte.
pub fn decode_at(bytes: &[u8], pc: usize) -> (Instruction, usize) {
    let Some(&byte) = bytes.get(pc) else {
        return (Instruction::Unknown { byte: 0 }, pc + 1);
    };
    let op = Op::of(byte);
    let width = op.width();
    let next = pc + width;
    if next > bytes.len() {
        return (Instruction::Unknown { byte }, bytes.len().max(pc + 1));
    }
    let b1 = if width > 1 { bytes[pc + 1] } else { 0 };
    let b2 = if width > 2 { bytes[pc + 2] } else { 0 };
    let b3 = if width > 3 { bytes[pc + 3] } else { 0 };
    (decode_op(op, byte, b1, b2, b3), next)
}

fn decode_op(op: Op, byte: u8, b1: u8, b2: u8, b3: u8) -> Instruction {
    match op {
        Op::PushReceiverVariable => {
            Instruction::PushReceiverVariable { index: byte & 0x0F }
        }
        Op::PushTemporary => Instruction::PushTemporary { index: byte & 0x0F },
        Op::PushLiteralConstant => {
            Instruction::PushLiteralConstant { index: byte & 0x1F }
        }
        Op::PushLiteralVariable => {
            Instruction::PushLiteralVariable { index: byte & 0x1F }
        }
        Op::PopIntoReceiverVariable => Instruction::StoreReceiverVariable {
            index: byte & 0x07,
            pop: true,
        },
        Op::PopIntoTemporary => Instruction::StoreTemporary {
            index: byte & 0x07,
            pop: true,
        },
        Op::PushSpecial => match byte & 0x07 {
            0 => Instruction::PushReceiver,
            n => Instruction::PushConstant { value: special_constant(n) },
        },
        Op::ReturnSpecial => match byte & 0x03 {
            0 => Instruction::ReturnReceiver,
            n => Instruction::ReturnConstant { value: special_constant(n) },
        },
        Op::ReturnTop => Instruction::ReturnTop,
        Op::BlockReturn => Instruction::BlockReturn,
        Op::Unknown => Instruction::Unknown { byte },

        Op::ExtendedPush => {
            let index = b1 & 0x3F;
            match b1 >> 6 {
                0 => Instruction::PushReceiverVariable { index },
                1 => Instruction::PushTemporary { index },
                2 => Instruction::PushLiteralConstant { index },
                _ => Instruction::PushLiteralVariable { index },
            }
        }
        Op::ExtendedStore | Op::ExtendedPopStore => {
            let pop = op == Op::ExtendedPopStore;
            let index = b1 & 0x3F;
            match b1 >> 6 {
                0 => Instruction::StoreReceiverVariable { index, pop },
                1 => Instruction::StoreTemporary { index, pop },
                // Literal constants are not assignable.
                2 => Instruction::Unknown { byte },
                _ => Instruction::StoreLiteralVariable { index, pop },
            }
        }
        Op::SingleExtendedSend => Instruction::Send {
            literal: b1 & 0x1F,
            num_args: b1 >> 5,
        },
        Op::DoubleExtended => {
            let num_args = b1 & 0x1F;
            match b1 >> 5 {
                0 => Instruction::Send { literal: b2, num_args },
                1 => Instruction::SuperSend { literal: b2, num_args },
                2 => Instruction::PushReceiverVariable { index: b2 },
                3 => Instruction::PushLiteralConstant { index: b2 },
                4 => Instruction::PushLiteralVariable { index: b2 },
                5 => Instruction::StoreReceiverVariable { index: b2, pop: false },
                6 => Instruction::StoreReceiverVariable { index: b2, pop: true },
                _ => Instruction::StoreLiteralVariable { index: b2, pop: false },
            }
        }
        Op::SingleExtendedSuper => Instruction::SuperSend {
            literal: b1 & 0x1F,
            num_args: b1 >> 5,
        },
        Op::SecondExtendedSend => Instruction::Send {
            literal: b1 & 0x3F,
            num_args: b1 >> 6,
        },
        Op::Pop => Instruction::Pop,
        Op::Dup => Instruction::Dup,
        Op::PushActiveContext => Instruction::PushActiveContext,
        Op::PushNewArray => Instruction::PushNewArray {
            size: b1 & 0x7F,
            pop_into: b1 & 0x80 != 0,
        },
        Op::CallPrimitive => Instruction::CallPrimitive {
            index: u16::from_le_bytes([b1, b2]),
        },
        Op::PushRemoteTemp => Instruction::PushRemoteTemp { index: b1, vector: b2 },
        Op::StoreRemoteTemp => Instruction::StoreRemoteTemp {
            index: b1,
            vector: b2,
            pop: false,
        },
        Op::PopIntoRemoteTemp => Instruction::StoreRemoteTemp {
            index: b1,
            vector: b2,
            pop: true,
        },
        Op::PushClosure => Instruction::PushClosure {
            num_copied: b1 >> 4,
            num_args: b1 & 0x0F,
            block_size: u16::from_be_bytes([b2, b3]),
        },
        Op::ShortJump => Instruction::Jump {
            offset: (byte & 0x07) as i16 + 1,
        },
        Op::ShortJumpIfFalse => Instruction::JumpIfFalse {
            offset: (byte & 0x07) as i16 + 1,
        },
        Op::LongJump => Instruction::Jump {
            offset: ((byte & 0x07) as i16 - 4) * 256 + b1 as i16,
        },
        Op::LongJumpIfTrue => Instruction::JumpIfTrue {
            offset: (byte & 0x03) as i16 * 256 + b1 as i16,
        },
        Op::LongJumpIfFalse => Instruction::JumpIfFalse {
            offset: (byte & 0x03) as i16 * 256 + b1 as i16,
        },
        Op::SpecialSend => Instruction::SpecialSend { index: byte - 0xB0 },
        Op::SendLiteral0 => Instruction::Send { literal: byte & 0x0F, num_args: 0 },
        Op::SendLiteral1 => Instruction::Send { literal: byte & 0x0F, num_args: 1 },
        Op::SendLiteral2 => Instruction::Send { literal: byte & 0x0F, num_args: 2 },
    }
}

/// Constants of the 0x71-0x77 and 0x79-0x7B forms, indexed by the low bits.
fn special_constant(n: u8) -> Constant {
    match n {
        1 => Constant::True,
        2 => Constant::False,
        3 => Constant::Nil,
        4 => Constant::Int(-1),
        5 => Constant::Int(0),
        6 => Constant::Int(1),
        _ => Constant::Int(2),
    }
}

/// Decodes a bytecode byte slice into [`Instruction`]s, front to back.
///
/// Block bodies are not skipped: the instructions of a closure follow its
/// `pushClosure` in the stream, exactly as they are laid out.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Start decoding at `pos` instead of the first byte.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction together with its offset, or `None` at
    /// end-of-stream.
    pub fn decode_next(&mut self) -> Option<(usize, Instruction)> {
        if self.is_at_end() {
            return None;
        }
        let pc = self.pos;
        let (instr, next) = decode_at(self.bytes, pc);
        self.pos = next;
        Some((pc, instr))
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        self.decode_next().map(|(_, instr)| instr)
    }
}
