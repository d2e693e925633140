//! Human-readable rendering of decoded instructions, using the vocabulary of
//! the Smalltalk instruction printer (`pushTemp: 3`, `send: foo`, ...).

use std::fmt::Write;

use crate::decoder::BytecodeDecoder;
use crate::instruction::Instruction;
use crate::op::SPECIAL_SELECTORS;

/// Resolves literal indices to printable names.
pub trait LiteralNames {
    fn literal_name(&self, index: usize) -> String;
}

/// Prints literal indices as plain numbers.
pub struct Indices;

impl LiteralNames for Indices {
    fn literal_name(&self, index: usize) -> String {
        index.to_string()
    }
}

impl<S: AsRef<str>> LiteralNames for [S] {
    fn literal_name(&self, index: usize) -> String {
        match self.get(index) {
            Some(name) => name.as_ref().to_string(),
            None => index.to_string(),
        }
    }
}

impl<S: AsRef<str>> LiteralNames for Vec<S> {
    fn literal_name(&self, index: usize) -> String {
        self.as_slice().literal_name(index)
    }
}

/// Render `instr`, which starts at byte offset `pc`.
pub fn describe(instr: &Instruction, pc: usize, literals: &dyn LiteralNames) -> String {
    let lit = |index: u8| literals.literal_name(index as usize);
    match *instr {
        Instruction::PushReceiverVariable { index } => format!("pushRcvr: {index}"),
        Instruction::PushTemporary { index } => format!("pushTemp: {index}"),
        Instruction::PushLiteralConstant { index } => {
            format!("pushConstant: {}", lit(index))
        }
        Instruction::PushLiteralVariable { index } => format!("pushLit: {}", lit(index)),
        Instruction::PushReceiver => "self".to_string(),
        Instruction::PushConstant { value } => format!("pushConstant: {value}"),
        Instruction::PushActiveContext => "pushThisContext:".to_string(),
        Instruction::PushNewArray { size, pop_into } => {
            if pop_into {
                format!("pop: {size} into: (Array new: {size})")
            } else {
                format!("push: (Array new: {size})")
            }
        }
        Instruction::PushRemoteTemp { index, vector } => {
            format!("pushTemp: {index} inVectorAt: {vector}")
        }
        Instruction::PushClosure { num_copied, num_args, block_size } => {
            let start = pc + 4;
            let end = start + block_size as usize;
            format!(
                "closureNumCopied: {num_copied} numArgs: {num_args} bytes {start} to {end}"
            )
        }
        Instruction::StoreReceiverVariable { index, pop } => {
            format!("{}Rcvr: {index}", store_verb(pop))
        }
        Instruction::StoreTemporary { index, pop } => {
            format!("{}Temp: {index}", store_verb(pop))
        }
        Instruction::StoreLiteralVariable { index, pop } => {
            format!("{}Lit: {}", store_verb(pop), lit(index))
        }
        Instruction::StoreRemoteTemp { index, vector, pop } => {
            format!("{}Temp: {index} inVectorAt: {vector}", store_verb(pop))
        }
        Instruction::Pop => "pop".to_string(),
        Instruction::Dup => "dup".to_string(),
        Instruction::Send { literal, .. } => format!("send: {}", lit(literal)),
        Instruction::SuperSend { literal, .. } => format!("sendSuper: {}", lit(literal)),
        Instruction::SpecialSend { index } => {
            format!("send: {}", SPECIAL_SELECTORS[(index & 0x1F) as usize].0)
        }
        Instruction::ReturnReceiver => "returnSelf".to_string(),
        Instruction::ReturnConstant { value } => format!("return: {value}"),
        Instruction::ReturnTop => "returnTop".to_string(),
        Instruction::BlockReturn => "blockReturn".to_string(),
        Instruction::Jump { offset } => format!("jumpTo: {offset}"),
        Instruction::JumpIfTrue { offset } => format!("jumpTrue: {offset}"),
        Instruction::JumpIfFalse { offset } => format!("jumpFalse: {offset}"),
        Instruction::CallPrimitive { index } => format!("callPrimitive: {index}"),
        Instruction::Unknown { byte } => format!("unknown: {byte}"),
    }
}

fn store_verb(pop: bool) -> &'static str {
    if pop { "popInto" } else { "storeInto" }
}

/// One numbered line per instruction: `<n> <indent><HEX BYTES> <text>`.
///
/// Lines inside a closure body are indented one extra space per nesting
/// level; a level opens after `pushClosure` and closes after `blockReturn`.
pub fn listing(bytes: &[u8], literals: &dyn LiteralNames) -> String {
    let mut out = String::new();
    let mut decoder = BytecodeDecoder::new(bytes);
    let mut depth = 0usize;
    let mut line = 1usize;
    while let Some((pc, instr)) = decoder.decode_next() {
        let end = decoder.offset().min(bytes.len());
        let hex = bytes[pc..end]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        if line > 1 {
            out.push('\n');
        }
        let _ = write!(
            out,
            "{line} {}<{hex}> {}",
            " ".repeat(depth),
            describe(&instr, pc, literals)
        );
        match instr {
            Instruction::PushClosure { .. } => depth += 1,
            Instruction::BlockReturn => depth = depth.saturating_sub(1),
            _ => {}
        }
        line += 1;
    }
    out
}
