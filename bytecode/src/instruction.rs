use core::fmt;

use crate::op::SPECIAL_SELECTORS;
use crate::printer::{self, Indices};

/// An immediate constant pushed or returned by the short constant forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    True,
    False,
    Nil,
    Int(i8),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Nil => write!(f, "nil"),
            Self::Int(n) => write!(f, "{n}"),
        }
    }
}

/// A decoded instruction with every operand extracted from its short or
/// extended encoding.
///
/// Jump offsets are relative to the end of the jump instruction. Literal
/// operands are indices into the literal table, header excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    PushReceiverVariable {
        index: u8,
    },
    PushTemporary {
        index: u8,
    },
    PushLiteralConstant {
        index: u8,
    },
    PushLiteralVariable {
        index: u8,
    },
    PushReceiver,
    PushConstant {
        value: Constant,
    },
    PushActiveContext,
    PushNewArray {
        size: u8,
        pop_into: bool,
    },
    /// Push element `index` of the temp vector held in temporary `vector`.
    PushRemoteTemp {
        index: u8,
        vector: u8,
    },
    PushClosure {
        num_copied: u8,
        num_args: u8,
        block_size: u16,
    },
    StoreReceiverVariable {
        index: u8,
        pop: bool,
    },
    StoreTemporary {
        index: u8,
        pop: bool,
    },
    StoreLiteralVariable {
        index: u8,
        pop: bool,
    },
    StoreRemoteTemp {
        index: u8,
        vector: u8,
        pop: bool,
    },
    Pop,
    Dup,
    Send {
        literal: u8,
        num_args: u8,
    },
    SuperSend {
        literal: u8,
        num_args: u8,
    },
    /// One of the 32 special selectors, see [`SPECIAL_SELECTORS`].
    SpecialSend {
        index: u8,
    },
    ReturnReceiver,
    ReturnConstant {
        value: Constant,
    },
    ReturnTop,
    BlockReturn,
    Jump {
        offset: i16,
    },
    JumpIfTrue {
        offset: i16,
    },
    JumpIfFalse {
        offset: i16,
    },
    CallPrimitive {
        index: u16,
    },
    /// A byte that does not start any valid instruction.
    Unknown {
        byte: u8,
    },
}

impl Instruction {
    /// Whether this instruction performs a message send.
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            Self::Send { .. } | Self::SuperSend { .. } | Self::SpecialSend { .. }
        )
    }

    pub fn is_return(&self) -> bool {
        matches!(
            self,
            Self::ReturnReceiver
                | Self::ReturnConstant { .. }
                | Self::ReturnTop
                | Self::BlockReturn
        )
    }

    pub fn jump_offset(&self) -> Option<i16> {
        match *self {
            Self::Jump { offset }
            | Self::JumpIfTrue { offset }
            | Self::JumpIfFalse { offset } => Some(offset),
            _ => None,
        }
    }

    /// Absolute target of a jump that ends at `next_pc`.
    pub fn jump_target(&self, next_pc: usize) -> Option<usize> {
        let offset = self.jump_offset()?;
        next_pc.checked_add_signed(offset as isize)
    }

    /// Number of arguments of a send, `None` for everything else.
    pub fn send_arity(&self) -> Option<u8> {
        match *self {
            Self::Send { num_args, .. } | Self::SuperSend { num_args, .. } => {
                Some(num_args)
            }
            Self::SpecialSend { index } => {
                Some(SPECIAL_SELECTORS[(index & 0x1F) as usize].1)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&printer::describe(self, 0, &Indices))
    }
}
