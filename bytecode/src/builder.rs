use crate::instruction::Constant;
use crate::op::*;

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`], [`BytecodeBuilder::jump_if_true`]
/// and [`BytecodeBuilder::jump_if_false`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use]
pub struct Label {
    /// Position of the opcode byte of the long jump.
    op_pos: usize,
}

/// An open `pushClosure` whose body size is patched by
/// [`BytecodeBuilder::end_closure`].
#[derive(Debug)]
#[must_use]
pub struct ClosureLabel {
    op_pos: usize,
}

/// Builds a bytecode byte sequence.
///
/// Every emitter picks the shortest encoding that can express its operands,
/// falling back to the extended forms (0x80-0x86) when an index or argument
/// count does not fit the short one.
#[derive(Default)]
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Emit a raw byte, e.g. to produce an intentionally unknown opcode.
    pub fn raw(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    // ── pushes ─────────────────────────────────────────────────────

    pub fn push_receiver_variable(&mut self, index: u8) {
        match index {
            0..=15 => self.emit(&[PUSH_RECEIVER_VARIABLE + index]),
            16..=63 => self.emit(&[EXTENDED_PUSH, index]),
            _ => self.emit(&[DOUBLE_EXTENDED, 2 << 5, index]),
        }
    }

    pub fn push_temporary(&mut self, index: u8) {
        debug_assert!(index < 64, "temporary index out of range: {index}");
        match index {
            0..=15 => self.emit(&[PUSH_TEMPORARY + index]),
            _ => self.emit(&[EXTENDED_PUSH, (1 << 6) | (index & 0x3F)]),
        }
    }

    pub fn push_literal_constant(&mut self, index: u8) {
        match index {
            0..=31 => self.emit(&[PUSH_LITERAL_CONSTANT + index]),
            32..=63 => self.emit(&[EXTENDED_PUSH, (2 << 6) | index]),
            _ => self.emit(&[DOUBLE_EXTENDED, 3 << 5, index]),
        }
    }

    pub fn push_literal_variable(&mut self, index: u8) {
        match index {
            0..=31 => self.emit(&[PUSH_LITERAL_VARIABLE + index]),
            32..=63 => self.emit(&[EXTENDED_PUSH, (3 << 6) | index]),
            _ => self.emit(&[DOUBLE_EXTENDED, 4 << 5, index]),
        }
    }

    pub fn push_receiver(&mut self) {
        self.emit(&[PUSH_RECEIVER]);
    }

    /// `pushConstant:` for `true`, `false`, `nil` and the integers -1..=2.
    ///
    /// Other integers have no short form; push them as literals instead.
    pub fn push_constant(&mut self, value: Constant) {
        self.emit(&[PUSH_RECEIVER + constant_code(value)]);
    }

    pub fn push_active_context(&mut self) {
        self.emit(&[PUSH_ACTIVE_CONTEXT]);
    }

    pub fn push_new_array(&mut self, size: u8, pop_into: bool) {
        let flag = if pop_into { 0x80 } else { 0 };
        self.emit(&[PUSH_NEW_ARRAY, flag | (size & 0x7F)]);
    }

    pub fn push_remote_temp(&mut self, index: u8, vector: u8) {
        self.emit(&[PUSH_REMOTE_TEMP, index, vector]);
    }

    /// Open a closure body. Emit the body, then close it with
    /// [`end_closure`](Self::end_closure).
    pub fn push_closure(&mut self, num_copied: u8, num_args: u8) -> ClosureLabel {
        let op_pos = self.buf.len();
        self.emit(&[
            PUSH_CLOSURE,
            ((num_copied & 0x0F) << 4) | (num_args & 0x0F),
            0,
            0,
        ]);
        ClosureLabel { op_pos }
    }

    pub fn end_closure(&mut self, label: ClosureLabel) {
        let size = (self.buf.len() - (label.op_pos + 4)) as u16;
        let [hi, lo] = size.to_be_bytes();
        self.buf[label.op_pos + 2] = hi;
        self.buf[label.op_pos + 3] = lo;
    }

    // ── stores ─────────────────────────────────────────────────────

    pub fn store_receiver_variable(&mut self, index: u8, pop: bool) {
        match (index, pop) {
            (0..=7, true) => self.emit(&[POP_INTO_RECEIVER_VARIABLE + index]),
            (0..=63, _) => self.emit(&[extended_store(pop), index]),
            (_, false) => self.emit(&[DOUBLE_EXTENDED, 5 << 5, index]),
            (_, true) => self.emit(&[DOUBLE_EXTENDED, 6 << 5, index]),
        }
    }

    pub fn store_temporary(&mut self, index: u8, pop: bool) {
        debug_assert!(index < 64, "temporary index out of range: {index}");
        match (index, pop) {
            (0..=7, true) => self.emit(&[POP_INTO_TEMPORARY + index]),
            _ => self.emit(&[extended_store(pop), (1 << 6) | (index & 0x3F)]),
        }
    }

    pub fn store_literal_variable(&mut self, index: u8, pop: bool) {
        match index {
            0..=63 => self.emit(&[extended_store(pop), (3 << 6) | index]),
            _ => {
                self.emit(&[DOUBLE_EXTENDED, 7 << 5, index]);
                if pop {
                    self.pop();
                }
            }
        }
    }

    pub fn store_remote_temp(&mut self, index: u8, vector: u8, pop: bool) {
        let op = if pop { POP_INTO_REMOTE_TEMP } else { STORE_REMOTE_TEMP };
        self.emit(&[op, index, vector]);
    }

    pub fn pop(&mut self) {
        self.emit(&[POP]);
    }

    pub fn dup(&mut self) {
        self.emit(&[DUP]);
    }

    // ── sends ──────────────────────────────────────────────────────

    /// Send the selector at literal `literal` with `num_args` arguments.
    pub fn send(&mut self, literal: u8, num_args: u8) {
        match (literal, num_args) {
            (0..=15, 0..=2) => {
                self.emit(&[SEND_LITERAL_0 + num_args * 16 + literal])
            }
            (0..=31, 0..=7) => {
                self.emit(&[SINGLE_EXTENDED_SEND, (num_args << 5) | literal])
            }
            _ => self.emit(&[DOUBLE_EXTENDED, num_args & 0x1F, literal]),
        }
    }

    pub fn super_send(&mut self, literal: u8, num_args: u8) {
        match (literal, num_args) {
            (0..=31, 0..=7) => {
                self.emit(&[SINGLE_EXTENDED_SUPER, (num_args << 5) | literal])
            }
            _ => self.emit(&[
                DOUBLE_EXTENDED,
                (1 << 5) | (num_args & 0x1F),
                literal,
            ]),
        }
    }

    /// Send special selector `index` (0..32), see
    /// [`SPECIAL_SELECTORS`](crate::SPECIAL_SELECTORS).
    pub fn special_send(&mut self, index: u8) {
        self.emit(&[SPECIAL_SEND + (index & 0x1F)]);
    }

    pub fn call_primitive(&mut self, index: u16) {
        let [lo, hi] = index.to_le_bytes();
        self.emit(&[CALL_PRIMITIVE, lo, hi]);
    }

    // ── returns ────────────────────────────────────────────────────

    pub fn return_receiver(&mut self) {
        self.emit(&[RETURN_RECEIVER]);
    }

    /// `return: true`, `return: false` or `return: nil`.
    pub fn return_constant(&mut self, value: Constant) {
        let code = match value {
            Constant::True => 1,
            Constant::False => 2,
            _ => 3,
        };
        self.emit(&[RETURN_RECEIVER + code]);
    }

    pub fn return_top(&mut self) {
        self.emit(&[RETURN_TOP]);
    }

    pub fn block_return(&mut self) {
        self.emit(&[BLOCK_RETURN]);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Short unconditional jump over `distance` bytes (1..=8).
    pub fn short_jump(&mut self, distance: u8) {
        debug_assert!((1..=8).contains(&distance));
        self.emit(&[SHORT_JUMP + (distance - 1)]);
    }

    /// Short jump over `distance` bytes (1..=8) when the popped top is false.
    pub fn short_jump_if_false(&mut self, distance: u8) {
        debug_assert!((1..=8).contains(&distance));
        self.emit(&[SHORT_JUMP_IF_FALSE + (distance - 1)]);
    }

    /// Long unconditional forward jump, resolved by [`bind`](Self::bind).
    pub fn jump(&mut self) -> Label {
        self.open_jump(LONG_JUMP)
    }

    pub fn jump_if_true(&mut self) -> Label {
        self.open_jump(LONG_JUMP_IF_TRUE)
    }

    pub fn jump_if_false(&mut self) -> Label {
        self.open_jump(LONG_JUMP_IF_FALSE)
    }

    fn open_jump(&mut self, op: u8) -> Label {
        let op_pos = self.buf.len();
        self.emit(&[op, 0]);
        Label { op_pos }
    }

    /// Point `label` at the current offset.
    pub fn bind(&mut self, label: Label) {
        let offset = self.buf.len() - (label.op_pos + 2);
        let op = self.buf[label.op_pos];
        if op & 0xF8 == LONG_JUMP {
            let encoded = offset as i32 + 4 * 256;
            self.buf[label.op_pos] = LONG_JUMP | ((encoded >> 8) as u8 & 0x07);
        } else {
            debug_assert!(offset < 1024, "conditional jump too far: {offset}");
            self.buf[label.op_pos] = (op & 0xFC) | ((offset >> 8) as u8 & 0x03);
        }
        self.buf[label.op_pos + 1] = (offset & 0xFF) as u8;
    }

    /// Unconditional long jump back to `target`, an earlier offset.
    pub fn jump_back(&mut self, target: usize) {
        let offset = target as i32 - (self.buf.len() as i32 + 2);
        debug_assert!((-1024..0).contains(&offset), "jump out of range: {offset}");
        let encoded = offset + 4 * 256;
        self.emit(&[LONG_JUMP | ((encoded >> 8) as u8 & 0x07), (encoded & 0xFF) as u8]);
    }
}

fn extended_store(pop: bool) -> u8 {
    if pop { EXTENDED_POP_STORE } else { EXTENDED_STORE }
}

/// Low bits of the 0x70 family for `value`.
fn constant_code(value: Constant) -> u8 {
    match value {
        Constant::True => 1,
        Constant::False => 2,
        Constant::Nil => 3,
        Constant::Int(-1) => 4,
        Constant::Int(0) => 5,
        Constant::Int(1) => 6,
        Constant::Int(_) => 7,
    }
}
