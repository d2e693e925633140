use crate::header::Header;
use crate::largeint::LargeInteger;
use crate::value::visit_oop;
use crate::{Oop, Value};

/// Frame slots available to a method without the large-frame bit.
pub const SMALL_FRAME: usize = 16;
/// Frame slots available to a method with the large-frame bit.
pub const LARGE_FRAME: usize = 56;

/// A heap object: identity header plus a typed body.
#[derive(Debug, Clone)]
pub struct Object {
    pub header: Header,
    pub body: Body,
}

impl Object {
    /// Visit every reference this object holds, the class pointer included.
    ///
    /// Weak slots are only visited with `include_weak`.
    pub fn visit_refs(&mut self, include_weak: bool, visitor: &mut dyn FnMut(&mut Value)) {
        visit_oop(&mut self.header.class, visitor);
        self.body.visit_refs(include_weak, visitor);
    }
}

/// How instances of a class are laid out; decides what `basicNew` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceFormat {
    /// Named instance variables only.
    Fixed,
    /// Named instance variables followed by indexable pointer slots.
    Indexable,
    /// Named instance variables followed by weak indexable slots.
    Weak,
    Bytes,
    LargeInteger,
    Code,
    Context,
    Closure,
    Class,
    /// SmallInteger: no heap instances.
    Immediate,
}

#[derive(Debug, Clone)]
pub enum Body {
    Pointers(Vec<Value>),
    /// Slots from `fixed` onwards do not keep their referents alive.
    Weak { fixed: usize, slots: Vec<Value> },
    Bytes(Vec<u8>),
    LargeInteger(LargeInteger),
    Code(CompiledCode),
    Context(ContextBody),
    Closure(ClosureBody),
    Class(ClassBody),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Pointers(_) => "pointers",
            Body::Weak { .. } => "weak pointers",
            Body::Bytes(_) => "bytes",
            Body::LargeInteger(_) => "large integer",
            Body::Code(_) => "compiled code",
            Body::Context(_) => "context",
            Body::Closure(_) => "closure",
            Body::Class(_) => "class",
        }
    }

    pub fn visit_refs(&mut self, include_weak: bool, visitor: &mut dyn FnMut(&mut Value)) {
        match self {
            Body::Pointers(slots) => slots.iter_mut().for_each(|v| visitor(v)),
            Body::Weak { fixed, slots } => {
                let strong = if include_weak { slots.len() } else { (*fixed).min(slots.len()) };
                slots[..strong].iter_mut().for_each(|v| visitor(v));
            }
            Body::Bytes(_) | Body::LargeInteger(_) => {}
            Body::Code(code) => code.visit_refs(visitor),
            Body::Context(ctx) => ctx.visit_refs(visitor),
            Body::Closure(closure) => closure.visit_refs(visitor),
            Body::Class(class) => class.visit_refs(visitor),
        }
    }
}

// ── Compiled code ──────────────────────────────────────────────────

/// Decoded method header word.
///
/// ```text
/// bits  0-14  numLiterals
/// bit   16    hasPrimitive
/// bit   17    needsLargeFrame
/// bits 18-23  numTemps
/// bits 24-27  numArgs
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodHeader {
    pub num_args: u8,
    pub num_temps: u8,
    pub num_literals: u16,
    pub has_primitive: bool,
    pub large_frame: bool,
}

impl MethodHeader {
    pub const fn decode(word: i64) -> Self {
        Self {
            num_args: ((word >> 24) & 0x0F) as u8,
            num_temps: ((word >> 18) & 0x3F) as u8,
            num_literals: (word & 0x7FFF) as u16,
            has_primitive: word & 0x1_0000 != 0,
            large_frame: word & 0x2_0000 != 0,
        }
    }

    pub const fn encode(self) -> i64 {
        let mut word = ((self.num_args as i64 & 0x0F) << 24)
            | ((self.num_temps as i64 & 0x3F) << 18)
            | (self.num_literals as i64 & 0x7FFF);
        if self.has_primitive {
            word |= 0x1_0000;
        }
        if self.large_frame {
            word |= 0x2_0000;
        }
        word
    }

    pub const fn frame_size(self) -> usize {
        if self.large_frame { LARGE_FRAME } else { SMALL_FRAME }
    }
}

/// Identifies a block body inside its home method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub num_args: u8,
    pub num_copied: u8,
    /// Offset of the first body byte in the home method.
    pub start: usize,
    pub size: usize,
}

/// A compiled method or the code of a block inside one.
///
/// Block code holds a copy of its slice of the home method's bytes; `base`
/// maps its local offsets back to the home method, which nested
/// `pushClosure` bytecodes refer to.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub header: MethodHeader,
    pub literals: Vec<Value>,
    pub bytes: Vec<u8>,
    pub base: usize,
    /// Home method, for block code.
    pub outer: Option<Oop>,
    pub num_copied: u8,
    /// Filled in when the method is installed.
    pub selector: Value,
    pub holder: Value,
    inner_blocks: Vec<(BlockKey, Oop)>,
}

impl CompiledCode {
    pub fn method(header: MethodHeader, literals: Vec<Value>, bytes: Vec<u8>, nil: Value) -> Self {
        Self {
            header,
            literals,
            bytes,
            base: 0,
            outer: None,
            num_copied: 0,
            selector: nil,
            holder: nil,
            inner_blocks: Vec::new(),
        }
    }

    /// Code for the block `key` inside `home`.
    pub fn block(home: Oop, home_code: &CompiledCode, key: BlockKey) -> Self {
        let end = (key.start + key.size).min(home_code.bytes.len());
        let start = key.start.min(end);
        let header = MethodHeader {
            num_args: key.num_args,
            num_temps: key.num_args + key.num_copied,
            num_literals: home_code.header.num_literals,
            has_primitive: false,
            large_frame: home_code.header.large_frame,
        };
        Self {
            header,
            literals: home_code.literals.clone(),
            bytes: home_code.bytes[start..end].to_vec(),
            base: key.start,
            outer: Some(home),
            num_copied: key.num_copied,
            selector: home_code.selector,
            holder: home_code.holder,
            inner_blocks: Vec::new(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.outer.is_some()
    }

    pub fn literal(&self, index: usize) -> Option<Value> {
        self.literals.get(index).copied()
    }

    /// Primitive index from a leading `callPrimitive` bytecode.
    pub fn primitive_index(&self) -> Option<u16> {
        if !self.header.has_primitive {
            return None;
        }
        match self.bytes.as_slice() {
            [0x8B, lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    pub fn inner_block(&self, key: &BlockKey) -> Option<Oop> {
        self.inner_blocks
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, oop)| *oop)
    }

    pub(crate) fn remember_inner_block(&mut self, key: BlockKey, code: Oop) {
        self.inner_blocks.push((key, code));
    }

    pub(crate) fn forget_inner_blocks(&mut self) -> Vec<Oop> {
        self.inner_blocks.drain(..).map(|(_, oop)| oop).collect()
    }

    fn visit_refs(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.literals.iter_mut().for_each(|v| visitor(v));
        visitor(&mut self.selector);
        visitor(&mut self.holder);
        if let Some(outer) = &mut self.outer {
            visit_oop(outer, visitor);
        }
        for (_, block) in self.inner_blocks.iter_mut() {
            visit_oop(block, visitor);
        }
    }
}

// ── Contexts ───────────────────────────────────────────────────────

/// Comparison-only stand-in for an activation that still lives on the
/// interpreter's native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameMarker(u64);

impl FrameMarker {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Where an activation (or a closure's outer context) points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLink {
    Nil,
    Context(Oop),
    /// Not yet materialized; resolved by walking the native stack.
    Frame(FrameMarker),
}

impl ContextLink {
    pub fn is_nil(self) -> bool {
        matches!(self, ContextLink::Nil)
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        if let ContextLink::Context(oop) = self {
            visit_oop(oop, visitor);
        }
    }
}

/// State of one activation, whether on the native stack or in the heap.
#[derive(Debug, Clone)]
pub struct ContextBody {
    pub sender: ContextLink,
    /// `None` once the activation has returned.
    pub pc: Option<usize>,
    /// Arguments and copied values, temporaries, then the operand stack.
    pub stack: Vec<Value>,
    /// Code being executed: the method itself or one of its blocks.
    pub code: Oop,
    /// Home method.
    pub method: Oop,
    pub closure: Option<Oop>,
    pub receiver: Value,
    /// Owning process, once this context has been stored into one.
    pub process: Option<Oop>,
}

impl ContextBody {
    pub fn is_returned(&self) -> bool {
        self.pc.is_none()
    }

    #[inline(always)]
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    #[inline(always)]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    #[inline(always)]
    pub fn top(&self) -> Option<Value> {
        self.stack.last().copied()
    }

    /// Value `depth` slots below the top (0 is the top).
    pub fn peek(&self, depth: usize) -> Option<Value> {
        let len = self.stack.len();
        if depth < len { Some(self.stack[len - 1 - depth]) } else { None }
    }

    pub fn temp(&self, index: usize) -> Option<Value> {
        self.stack.get(index).copied()
    }

    pub fn set_temp(&mut self, index: usize, value: Value) -> bool {
        match self.stack.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Drop the top `n` values, answering them bottom-first.
    pub fn pop_n(&mut self, n: usize) -> Option<Vec<Value>> {
        let len = self.stack.len();
        if n > len {
            return None;
        }
        Some(self.stack.split_off(len - n))
    }

    pub fn visit_refs(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.sender.visit(visitor);
        self.stack.iter_mut().for_each(|v| visitor(v));
        visit_oop(&mut self.code, visitor);
        visit_oop(&mut self.method, visitor);
        if let Some(closure) = &mut self.closure {
            visit_oop(closure, visitor);
        }
        visitor(&mut self.receiver);
        if let Some(process) = &mut self.process {
            visit_oop(process, visitor);
        }
    }
}

// ── Closures ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClosureBody {
    pub outer: ContextLink,
    pub receiver: Value,
    pub copied: Vec<Value>,
    /// Offset of the first body byte in the home method.
    pub start_pc: usize,
    pub num_args: u8,
    pub method: Oop,
    /// Derived from the home method on first activation when absent.
    pub code: Option<Oop>,
}

impl ClosureBody {
    fn visit_refs(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.outer.visit(visitor);
        visitor(&mut self.receiver);
        self.copied.iter_mut().for_each(|v| visitor(v));
        visit_oop(&mut self.method, visitor);
        if let Some(code) = &mut self.code {
            visit_oop(code, visitor);
        }
    }
}

// ── Classes ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClassBody {
    pub name: String,
    pub superclass: Option<Oop>,
    /// Selector symbol to method (compiled code or any object).
    pub methods: Vec<(Oop, Value)>,
    pub format: InstanceFormat,
    /// Number of named instance variables.
    pub inst_size: usize,
    /// For a metaclass, its sole instance.
    pub this_class: Option<Oop>,
}

impl ClassBody {
    pub fn is_meta(&self) -> bool {
        self.this_class.is_some()
    }

    pub fn method(&self, selector: Oop) -> Option<Value> {
        self.methods
            .iter()
            .find(|(s, _)| *s == selector)
            .map(|(_, m)| *m)
    }

    fn visit_refs(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        if let Some(superclass) = &mut self.superclass {
            visit_oop(superclass, visitor);
        }
        for (selector, method) in self.methods.iter_mut() {
            visit_oop(selector, visitor);
            visitor(method);
        }
        if let Some(this_class) = &mut self.this_class {
            visit_oop(this_class, visitor);
        }
    }
}
