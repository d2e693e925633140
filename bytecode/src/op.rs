/// Opcode families of the closure-era bytecode set.
///
/// Most families cover a contiguous range of byte values and carry their
/// first operand in the low bits of the opcode byte itself. [`Op::of`] maps
/// any byte to its family; bytes outside every family map to
/// [`Op::Unknown`].
///
/// ```text
/// 0x00-0x0F  push receiver variable        0x80  extended push
/// 0x10-0x1F  push temporary                0x81  extended store
/// 0x20-0x3F  push literal constant         0x82  extended pop-store
/// 0x40-0x5F  push literal variable         0x83  single extended send
/// 0x60-0x67  pop into receiver variable    0x84  double extended
/// 0x68-0x6F  pop into temporary            0x85  single extended super
/// 0x70-0x77  push self/true/false/nil/-1/0/1/2
/// 0x78-0x7B  return self/true/false/nil    0x86  second extended send
/// 0x7C       return top                    0x87  pop   0x88 dup
/// 0x7D       block return                  0x89  push thisContext
/// 0x90-0x97  short jump                    0x8A  push new array
/// 0x98-0x9F  short jump if false           0x8B  call primitive
/// 0xA0-0xA7  long jump                     0x8C-0x8E remote temps
/// 0xA8-0xAB  long jump if true             0x8F  push closure
/// 0xAC-0xAF  long jump if false
/// 0xB0-0xCF  special selector sends
/// 0xD0-0xDF / 0xE0-0xEF / 0xF0-0xFF  literal sends with 0 / 1 / 2 args
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    PushReceiverVariable,
    PushTemporary,
    PushLiteralConstant,
    PushLiteralVariable,
    PopIntoReceiverVariable,
    PopIntoTemporary,
    PushSpecial,
    ReturnSpecial,
    ReturnTop,
    BlockReturn,
    ExtendedPush,
    ExtendedStore,
    ExtendedPopStore,
    SingleExtendedSend,
    DoubleExtended,
    SingleExtendedSuper,
    SecondExtendedSend,
    Pop,
    Dup,
    PushActiveContext,
    PushNewArray,
    CallPrimitive,
    PushRemoteTemp,
    StoreRemoteTemp,
    PopIntoRemoteTemp,
    PushClosure,
    ShortJump,
    ShortJumpIfFalse,
    LongJump,
    LongJumpIfTrue,
    LongJumpIfFalse,
    SpecialSend,
    SendLiteral0,
    SendLiteral1,
    SendLiteral2,
    /// 0x7E and 0x7F.
    Unknown,
}

impl Op {
    pub const fn of(byte: u8) -> Self {
        match byte {
            0x00..=0x0F => Op::PushReceiverVariable,
            0x10..=0x1F => Op::PushTemporary,
            0x20..=0x3F => Op::PushLiteralConstant,
            0x40..=0x5F => Op::PushLiteralVariable,
            0x60..=0x67 => Op::PopIntoReceiverVariable,
            0x68..=0x6F => Op::PopIntoTemporary,
            0x70..=0x77 => Op::PushSpecial,
            0x78..=0x7B => Op::ReturnSpecial,
            0x7C => Op::ReturnTop,
            0x7D => Op::BlockReturn,
            0x7E | 0x7F => Op::Unknown,
            0x80 => Op::ExtendedPush,
            0x81 => Op::ExtendedStore,
            0x82 => Op::ExtendedPopStore,
            0x83 => Op::SingleExtendedSend,
            0x84 => Op::DoubleExtended,
            0x85 => Op::SingleExtendedSuper,
            0x86 => Op::SecondExtendedSend,
            0x87 => Op::Pop,
            0x88 => Op::Dup,
            0x89 => Op::PushActiveContext,
            0x8A => Op::PushNewArray,
            0x8B => Op::CallPrimitive,
            0x8C => Op::PushRemoteTemp,
            0x8D => Op::StoreRemoteTemp,
            0x8E => Op::PopIntoRemoteTemp,
            0x8F => Op::PushClosure,
            0x90..=0x97 => Op::ShortJump,
            0x98..=0x9F => Op::ShortJumpIfFalse,
            0xA0..=0xA7 => Op::LongJump,
            0xA8..=0xAB => Op::LongJumpIfTrue,
            0xAC..=0xAF => Op::LongJumpIfFalse,
            0xB0..=0xCF => Op::SpecialSend,
            0xD0..=0xDF => Op::SendLiteral0,
            0xE0..=0xEF => Op::SendLiteral1,
            0xF0..=0xFF => Op::SendLiteral2,
        }
    }

    /// Encoded size in bytes, opcode included.
    pub const fn width(self) -> usize {
        match self {
            Op::ExtendedPush
            | Op::ExtendedStore
            | Op::ExtendedPopStore
            | Op::SingleExtendedSend
            | Op::SingleExtendedSuper
            | Op::SecondExtendedSend
            | Op::PushNewArray
            | Op::LongJump
            | Op::LongJumpIfTrue
            | Op::LongJumpIfFalse => 2,
            Op::DoubleExtended
            | Op::CallPrimitive
            | Op::PushRemoteTemp
            | Op::StoreRemoteTemp
            | Op::PopIntoRemoteTemp => 3,
            Op::PushClosure => 4,
            _ => 1,
        }
    }
}

// ── Opcode bytes used by the builder ──────────────────────────────

pub(crate) const PUSH_RECEIVER_VARIABLE: u8 = 0x00;
pub(crate) const PUSH_TEMPORARY: u8 = 0x10;
pub(crate) const PUSH_LITERAL_CONSTANT: u8 = 0x20;
pub(crate) const PUSH_LITERAL_VARIABLE: u8 = 0x40;
pub(crate) const POP_INTO_RECEIVER_VARIABLE: u8 = 0x60;
pub(crate) const POP_INTO_TEMPORARY: u8 = 0x68;
pub(crate) const PUSH_RECEIVER: u8 = 0x70;
pub(crate) const RETURN_RECEIVER: u8 = 0x78;
pub(crate) const RETURN_TOP: u8 = 0x7C;
pub(crate) const BLOCK_RETURN: u8 = 0x7D;
pub(crate) const EXTENDED_PUSH: u8 = 0x80;
pub(crate) const EXTENDED_STORE: u8 = 0x81;
pub(crate) const EXTENDED_POP_STORE: u8 = 0x82;
pub(crate) const SINGLE_EXTENDED_SEND: u8 = 0x83;
pub(crate) const DOUBLE_EXTENDED: u8 = 0x84;
pub(crate) const SINGLE_EXTENDED_SUPER: u8 = 0x85;
pub(crate) const POP: u8 = 0x87;
pub(crate) const DUP: u8 = 0x88;
pub(crate) const PUSH_ACTIVE_CONTEXT: u8 = 0x89;
pub(crate) const PUSH_NEW_ARRAY: u8 = 0x8A;
pub(crate) const CALL_PRIMITIVE: u8 = 0x8B;
pub(crate) const PUSH_REMOTE_TEMP: u8 = 0x8C;
pub(crate) const STORE_REMOTE_TEMP: u8 = 0x8D;
pub(crate) const POP_INTO_REMOTE_TEMP: u8 = 0x8E;
pub(crate) const PUSH_CLOSURE: u8 = 0x8F;
pub(crate) const SHORT_JUMP: u8 = 0x90;
pub(crate) const SHORT_JUMP_IF_FALSE: u8 = 0x98;
pub(crate) const LONG_JUMP: u8 = 0xA0;
pub(crate) const LONG_JUMP_IF_TRUE: u8 = 0xA8;
pub(crate) const LONG_JUMP_IF_FALSE: u8 = 0xAC;
pub(crate) const SPECIAL_SEND: u8 = 0xB0;
pub(crate) const SEND_LITERAL_0: u8 = 0xD0;

/// Selector and argument count of the 32 special-selector sends, in
/// opcode order starting at 0xB0.
pub const SPECIAL_SELECTORS: [(&str, u8); 32] = [
    ("+", 1),
    ("-", 1),
    ("<", 1),
    (">", 1),
    ("<=", 1),
    (">=", 1),
    ("=", 1),
    ("~=", 1),
    ("*", 1),
    ("/", 1),
    ("\\\\", 1),
    ("@", 1),
    ("bitShift:", 1),
    ("//", 1),
    ("bitAnd:", 1),
    ("bitOr:", 1),
    ("at:", 1),
    ("at:put:", 2),
    ("size", 0),
    ("next", 0),
    ("nextPut:", 1),
    ("atEnd", 0),
    ("==", 1),
    ("class", 0),
    ("blockCopy:", 1),
    ("value", 0),
    ("value:", 1),
    ("do:", 1),
    ("new", 0),
    ("new:", 1),
    ("x", 0),
    ("y", 0),
];

/// Argument count of special selector `index` (0..32).
pub const fn special_selector_arity(index: u8) -> u8 {
    SPECIAL_SELECTORS[(index & 0x1F) as usize].1
}
