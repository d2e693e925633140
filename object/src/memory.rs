use std::collections::HashMap;

use bytecode::Instruction;
use log::debug;
use num_bigint::{BigInt, Sign};

use crate::error::MemoryError;
use crate::header::{Header, HeaderFlags};
use crate::largeint::{self, LargeInteger};
use crate::objects::{
    BlockKey, Body, ClassBody, ClosureBody, CompiledCode, ContextBody, InstanceFormat,
    MethodHeader, Object,
};
use crate::special::SpecialObjects;
use crate::{Oop, Value};

/// The object arena.
///
/// Objects are addressed by [`Oop`] handles into a slot vector; freed slots
/// go on a free list and are reused by later allocations. Method lookup
/// lives here too, together with the version counters dispatch caches use
/// to notice that a lookup result may have changed.
pub struct ObjectMemory {
    objects: Vec<Option<Object>>,
    free: Vec<Oop>,
    last_hash: u32,
    pub special: SpecialObjects,
    symbols: HashMap<String, Oop>,
    /// Bumped whenever a lookup that used to answer this object may now
    /// answer something else.
    versions: HashMap<Oop, u32>,
    /// Bumped by superclass changes and `become:`.
    hierarchy_epoch: u32,
    /// Bumped when a method appears where lookup used to fail.
    dnu_epoch: u32,
}

impl ObjectMemory {
    pub(crate) fn empty() -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            last_hash: 0x2545_f491,
            special: SpecialObjects::placeholder(Oop::from_index(0)),
            symbols: HashMap::new(),
            versions: HashMap::new(),
            hierarchy_epoch: 0,
            dnu_epoch: 0,
        }
    }

    fn next_hash(&mut self) -> u32 {
        self.last_hash = self.last_hash.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (self.last_hash >> 8) & 0x3F_FFFF
    }

    pub fn alloc(&mut self, class: Oop, body: Body) -> Oop {
        let header = Header::new(class, self.next_hash());
        let object = Object { header, body };
        match self.free.pop() {
            Some(oop) => {
                self.objects[oop.index()] = Some(object);
                oop
            }
            None => {
                self.objects.push(Some(object));
                Oop::from_index(self.objects.len() - 1)
            }
        }
    }

    pub(crate) fn release(&mut self, oop: Oop) {
        if let Some(entry) = self.objects.get_mut(oop.index()) {
            if entry.take().is_some() {
                self.free.push(oop);
                self.versions.remove(&oop);
            }
        }
    }

    pub(crate) fn slots(&self) -> &[Option<Object>] {
        &self.objects
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Option<Object>] {
        &mut self.objects
    }

    pub fn is_live(&self, oop: Oop) -> bool {
        matches!(self.objects.get(oop.index()), Some(Some(_)))
    }

    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    // ── raw access ─────────────────────────────────────────────────

    pub fn get(&self, oop: Oop) -> Result<&Object, MemoryError> {
        match self.objects.get(oop.index()) {
            Some(Some(object)) => Ok(object),
            _ => Err(MemoryError::InvalidHandle(oop)),
        }
    }

    pub fn get_mut(&mut self, oop: Oop) -> Result<&mut Object, MemoryError> {
        match self.objects.get_mut(oop.index()) {
            Some(Some(object)) => Ok(object),
            _ => Err(MemoryError::InvalidHandle(oop)),
        }
    }

    pub fn header(&self, oop: Oop) -> Result<&Header, MemoryError> {
        Ok(&self.get(oop)?.header)
    }

    pub fn header_mut(&mut self, oop: Oop) -> Result<&mut Header, MemoryError> {
        Ok(&mut self.get_mut(oop)?.header)
    }

    pub fn body(&self, oop: Oop) -> Result<&Body, MemoryError> {
        Ok(&self.get(oop)?.body)
    }

    pub fn body_mut(&mut self, oop: Oop) -> Result<&mut Body, MemoryError> {
        Ok(&mut self.get_mut(oop)?.body)
    }

    pub fn code(&self, oop: Oop) -> Result<&CompiledCode, MemoryError> {
        match self.body(oop)? {
            Body::Code(code) => Ok(code),
            _ => Err(MemoryError::WrongKind { oop, expected: "compiled code" }),
        }
    }

    pub fn code_mut(&mut self, oop: Oop) -> Result<&mut CompiledCode, MemoryError> {
        match self.body_mut(oop)? {
            Body::Code(code) => Ok(code),
            _ => Err(MemoryError::WrongKind { oop, expected: "compiled code" }),
        }
    }

    pub fn context(&self, oop: Oop) -> Result<&ContextBody, MemoryError> {
        match self.body(oop)? {
            Body::Context(ctx) => Ok(ctx),
            _ => Err(MemoryError::WrongKind { oop, expected: "a context" }),
        }
    }

    pub fn context_mut(&mut self, oop: Oop) -> Result<&mut ContextBody, MemoryError> {
        match self.body_mut(oop)? {
            Body::Context(ctx) => Ok(ctx),
            _ => Err(MemoryError::WrongKind { oop, expected: "a context" }),
        }
    }

    pub fn closure(&self, oop: Oop) -> Result<&ClosureBody, MemoryError> {
        match self.body(oop)? {
            Body::Closure(closure) => Ok(closure),
            _ => Err(MemoryError::WrongKind { oop, expected: "a closure" }),
        }
    }

    pub fn closure_mut(&mut self, oop: Oop) -> Result<&mut ClosureBody, MemoryError> {
        match self.body_mut(oop)? {
            Body::Closure(closure) => Ok(closure),
            _ => Err(MemoryError::WrongKind { oop, expected: "a closure" }),
        }
    }

    pub fn class_body(&self, oop: Oop) -> Result<&ClassBody, MemoryError> {
        match self.body(oop)? {
            Body::Class(class) => Ok(class),
            _ => Err(MemoryError::WrongKind { oop, expected: "a class" }),
        }
    }

    pub fn class_body_mut(&mut self, oop: Oop) -> Result<&mut ClassBody, MemoryError> {
        match self.body_mut(oop)? {
            Body::Class(class) => Ok(class),
            _ => Err(MemoryError::WrongKind { oop, expected: "a class" }),
        }
    }

    // ── identity ───────────────────────────────────────────────────

    #[inline(always)]
    pub fn nil(&self) -> Value {
        Value::Ref(self.special.nil)
    }

    #[inline(always)]
    pub fn is_nil(&self, value: Value) -> bool {
        value == Value::Ref(self.special.nil)
    }

    #[inline(always)]
    pub fn boolean(&self, b: bool) -> Value {
        Value::Ref(if b { self.special.true_obj } else { self.special.false_obj })
    }

    /// `Some(b)` if `value` is `true` or `false`.
    pub fn as_boolean(&self, value: Value) -> Option<bool> {
        match value {
            Value::Ref(oop) if oop == self.special.true_obj => Some(true),
            Value::Ref(oop) if oop == self.special.false_obj => Some(false),
            _ => None,
        }
    }

    pub fn class_of(&self, value: Value) -> Result<Oop, MemoryError> {
        match value {
            Value::Int(_) => Ok(self.special.small_integer),
            Value::Ref(oop) => Ok(self.header(oop)?.class),
        }
    }

    pub fn identity_hash(&self, oop: Oop) -> Result<u32, MemoryError> {
        Ok(self.header(oop)?.hash)
    }

    // ── slots ──────────────────────────────────────────────────────

    /// Number of pointer or byte fields, named ones included.
    pub fn slot_count(&self, oop: Oop) -> Result<usize, MemoryError> {
        Ok(match self.body(oop)? {
            Body::Pointers(slots) | Body::Weak { slots, .. } => slots.len(),
            Body::Bytes(bytes) => bytes.len(),
            Body::LargeInteger(li) => li.len(),
            Body::Code(code) => code.literals.len(),
            Body::Context(ctx) => ctx.stack.len(),
            Body::Closure(closure) => closure.copied.len(),
            Body::Class(_) => 0,
        })
    }

    /// Pointer field `index` (0-based) of a pointers or weak object.
    pub fn fetch(&self, oop: Oop, index: usize) -> Result<Value, MemoryError> {
        match self.body(oop)? {
            Body::Pointers(slots) | Body::Weak { slots, .. } => {
                slots.get(index).copied().ok_or(MemoryError::IndexOutOfBounds {
                    oop,
                    index,
                    size: slots.len(),
                })
            }
            _ => Err(MemoryError::WrongKind { oop, expected: "a pointers object" }),
        }
    }

    pub fn store(&mut self, oop: Oop, index: usize, value: Value) -> Result<(), MemoryError> {
        let object = self.get_mut(oop)?;
        if object.header.is_immutable() {
            return Err(MemoryError::Immutable(oop));
        }
        match &mut object.body {
            Body::Pointers(slots) | Body::Weak { slots, .. } => {
                let size = slots.len();
                let slot = slots
                    .get_mut(index)
                    .ok_or(MemoryError::IndexOutOfBounds { oop, index, size })?;
                *slot = value;
                Ok(())
            }
            _ => Err(MemoryError::WrongKind { oop, expected: "a pointers object" }),
        }
    }

    // ── instantiation ──────────────────────────────────────────────

    pub fn new_pointers(&mut self, class: Oop, slots: Vec<Value>) -> Oop {
        self.alloc(class, Body::Pointers(slots))
    }

    pub fn new_array(&mut self, elements: Vec<Value>) -> Oop {
        let class = self.special.array;
        self.alloc(class, Body::Pointers(elements))
    }

    pub fn new_string(&mut self, s: &str) -> Oop {
        let class = self.special.byte_string;
        self.alloc(class, Body::Bytes(s.as_bytes().to_vec()))
    }

    /// `basicNew` / `basicNew:` for `class`.
    pub fn instantiate(&mut self, class: Oop, indexable: usize) -> Result<Oop, MemoryError> {
        let (format, inst_size) = {
            let body = self.class_body(class)?;
            (body.format, body.inst_size)
        };
        let nil = self.nil();
        let body = match format {
            InstanceFormat::Fixed if indexable == 0 => Body::Pointers(vec![nil; inst_size]),
            InstanceFormat::Indexable => Body::Pointers(vec![nil; inst_size + indexable]),
            InstanceFormat::Weak => Body::Weak {
                fixed: inst_size,
                slots: vec![nil; inst_size + indexable],
            },
            InstanceFormat::Bytes => Body::Bytes(vec![0; indexable]),
            InstanceFormat::LargeInteger => {
                Body::LargeInteger(LargeInteger::from_bytes(vec![0; indexable]))
            }
            _ => {
                return Err(MemoryError::WrongKind {
                    oop: class,
                    expected: "an instantiable class",
                });
            }
        };
        Ok(self.alloc(class, body))
    }

    // ── symbols and strings ────────────────────────────────────────

    pub fn intern(&mut self, name: &str) -> Oop {
        if let Some(&oop) = self.symbols.get(name) {
            return oop;
        }
        let class = self.special.byte_symbol;
        let oop = self.alloc(class, Body::Bytes(name.as_bytes().to_vec()));
        if let Ok(header) = self.header_mut(oop) {
            header.flags.insert(HeaderFlags::IMMUTABLE);
        }
        self.symbols.insert(name.to_string(), oop);
        oop
    }

    pub fn symbol(&self, name: &str) -> Option<Oop> {
        self.symbols.get(name).copied()
    }

    pub(crate) fn symbols_mut(&mut self) -> impl Iterator<Item = &mut Oop> {
        self.symbols.values_mut()
    }

    pub(crate) fn symbol_oops(&self) -> impl Iterator<Item = Oop> + '_ {
        self.symbols.values().copied()
    }

    /// Contents of a string or symbol.
    pub fn string_of(&self, value: Value) -> Option<&str> {
        match self.body(value.as_oop()?).ok()? {
            Body::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Selector `index` of the 32 special selectors, with its arity.
    pub fn special_selector(&self, index: u8) -> Result<(Oop, u8), MemoryError> {
        let table = self.special.special_selectors;
        let i = (index as usize & 0x1F) * 2;
        let selector = self.fetch(table, i)?;
        let arity = self.fetch(table, i + 1)?;
        match (selector, arity) {
            (Value::Ref(sel), Value::Int(n)) => Ok((sel, n as u8)),
            _ => Err(MemoryError::WrongKind { oop: table, expected: "a special selectors table" }),
        }
    }

    // ── classes and lookup ─────────────────────────────────────────

    /// Create `name` together with its metaclass.
    pub fn new_class(
        &mut self,
        name: &str,
        superclass: Option<Oop>,
        format: InstanceFormat,
        inst_size: usize,
    ) -> Result<Oop, MemoryError> {
        let meta_superclass = match superclass {
            Some(sup) => {
                self.class_body(sup)?;
                Some(self.header(sup)?.class)
            }
            None => Some(self.special.class),
        };
        Ok(self.define_class(name, superclass, meta_superclass, format, inst_size))
    }

    pub(crate) fn define_class(
        &mut self,
        name: &str,
        superclass: Option<Oop>,
        meta_superclass: Option<Oop>,
        format: InstanceFormat,
        inst_size: usize,
    ) -> Oop {
        let meta = self.alloc(
            self.special.metaclass,
            Body::Class(ClassBody {
                name: format!("{name} class"),
                superclass: meta_superclass,
                methods: Vec::new(),
                format: InstanceFormat::Class,
                inst_size: 0,
                this_class: None,
            }),
        );
        let class = self.alloc(
            meta,
            Body::Class(ClassBody {
                name: name.to_string(),
                superclass,
                methods: Vec::new(),
                format,
                inst_size,
                this_class: None,
            }),
        );
        if let Ok(body) = self.class_body_mut(meta) {
            body.this_class = Some(class);
        }
        class
    }

    pub fn class_name(&self, class: Oop) -> &str {
        match self.class_body(class) {
            Ok(body) => &body.name,
            Err(_) => "<not a class>",
        }
    }

    pub fn superclass_of(&self, class: Oop) -> Result<Option<Oop>, MemoryError> {
        Ok(self.class_body(class)?.superclass)
    }

    /// Change a class's superclass (and its metaclass's).
    pub fn set_superclass(&mut self, class: Oop, superclass: Option<Oop>) -> Result<(), MemoryError> {
        let meta_superclass = match superclass {
            Some(sup) => Some(self.header(sup)?.class),
            None => Some(self.special.class),
        };
        self.class_body_mut(class)?.superclass = superclass;
        let meta = self.header(class)?.class;
        if let Ok(body) = self.class_body_mut(meta) {
            body.superclass = meta_superclass;
        }
        self.hierarchy_epoch = self.hierarchy_epoch.wrapping_add(1);
        debug!("superclass of {} changed, hierarchy epoch {}", self.class_name(class), self.hierarchy_epoch);
        Ok(())
    }

    /// First method for `selector` along `class`'s superclass chain.
    pub fn lookup(&self, class: Oop, selector: Oop) -> Result<Option<Value>, MemoryError> {
        let mut current = Some(class);
        while let Some(c) = current {
            let body = self.class_body(c)?;
            if let Some(method) = body.method(selector) {
                return Ok(Some(method));
            }
            current = body.superclass;
        }
        Ok(None)
    }

    /// Install (or replace) `selector` in `class`.
    ///
    /// Whatever lookup answered for `class` before is invalidated: its
    /// version is bumped, or the lookup-failure epoch if there was none.
    pub fn install_method(&mut self, class: Oop, selector: Oop, method: Value) -> Result<(), MemoryError> {
        self.class_body(class)?;
        match self.lookup(class, selector)? {
            Some(previous) => self.invalidate(previous),
            None => self.dnu_epoch = self.dnu_epoch.wrapping_add(1),
        }
        if let Value::Ref(m) = method {
            if let Ok(code) = self.code_mut(m) {
                code.selector = Value::Ref(selector);
                code.holder = Value::Ref(class);
            }
        }
        let body = self.class_body_mut(class)?;
        match body.methods.iter_mut().find(|(s, _)| *s == selector) {
            Some(entry) => entry.1 = method,
            None => body.methods.push((selector, method)),
        }
        debug!(
            "installed {}>>{}",
            self.class_name(class),
            self.string_of(Value::Ref(selector)).unwrap_or("?")
        );
        Ok(())
    }

    pub fn remove_method(&mut self, class: Oop, selector: Oop) -> Result<Option<Value>, MemoryError> {
        let body = self.class_body_mut(class)?;
        let Some(pos) = body.methods.iter().position(|(s, _)| *s == selector) else {
            return Ok(None);
        };
        let (_, removed) = body.methods.remove(pos);
        self.invalidate(removed);
        Ok(Some(removed))
    }

    /// Bump the version of a lookup result so cached copies of it miss.
    pub fn invalidate(&mut self, target: Value) {
        if let Value::Ref(oop) = target {
            let version = self.versions.entry(oop).or_insert(0);
            *version = version.wrapping_add(1);
            debug!("invalidated {oop:?}, now version {version}");
        }
    }

    pub fn version_of(&self, oop: Oop) -> u32 {
        self.versions.get(&oop).copied().unwrap_or(0)
    }

    pub fn hierarchy_epoch(&self) -> u32 {
        self.hierarchy_epoch
    }

    pub fn dnu_epoch(&self) -> u32 {
        self.dnu_epoch
    }

    pub(crate) fn bump_hierarchy_epoch(&mut self) {
        self.hierarchy_epoch = self.hierarchy_epoch.wrapping_add(1);
    }

    // ── compiled code ──────────────────────────────────────────────

    pub fn new_method(&mut self, header: MethodHeader, literals: Vec<Value>, bytes: Vec<u8>) -> Oop {
        let nil = self.nil();
        let class = self.special.compiled_method;
        self.alloc(class, Body::Code(CompiledCode::method(header, literals, bytes, nil)))
    }

    /// Replace a method's header, literals and bytes in place.
    ///
    /// Cached inner blocks are dropped and every cache that captured the
    /// method (or one of its blocks) misses on its next use.
    pub fn replace_code(
        &mut self,
        method: Oop,
        header_word: i64,
        literals: Vec<Value>,
        bytes: Vec<u8>,
    ) -> Result<(), MemoryError> {
        let code = self.code_mut(method)?;
        code.header = MethodHeader::decode(header_word);
        code.literals = literals;
        code.bytes = bytes;
        let stale = code.forget_inner_blocks();
        self.invalidate(Value::Ref(method));
        for block in stale {
            self.invalidate(Value::Ref(block));
        }
        Ok(())
    }

    /// The shared code object for block `key` of `method`.
    pub fn block_code(&mut self, method: Oop, key: BlockKey) -> Result<Oop, MemoryError> {
        let home = self.code(method)?;
        if let Some(existing) = home.inner_block(&key) {
            return Ok(existing);
        }
        let block = CompiledCode::block(method, home, key);
        let class = self.special.compiled_method;
        let oop = self.alloc(class, Body::Code(block));
        self.code_mut(method)?.remember_inner_block(key, oop);
        Ok(oop)
    }

    /// Block key for the body starting at `start` in `method`, read back
    /// from the `pushClosure` that precedes it.
    pub fn block_key_at(&self, method: Oop, start: usize) -> Result<BlockKey, MemoryError> {
        let code = self.code(method)?;
        let decoded = start
            .checked_sub(4)
            .map(|pc| bytecode::decode_at(&code.bytes, pc).0);
        match decoded {
            Some(Instruction::PushClosure { num_copied, num_args, block_size }) => Ok(BlockKey {
                num_args,
                num_copied,
                start,
                size: block_size as usize,
            }),
            _ => Err(MemoryError::WrongKind {
                oop: method,
                expected: "a method with a block at that offset",
            }),
        }
    }

    /// Code of `closure`, derived from its home method if not yet known.
    pub fn closure_code(&mut self, closure: Oop) -> Result<Oop, MemoryError> {
        let body = self.closure(closure)?;
        if let Some(code) = body.code {
            return Ok(code);
        }
        let (method, start) = (body.method, body.start_pc);
        let key = self.block_key_at(method, start)?;
        let code = self.block_code(method, key)?;
        self.closure_mut(closure)?.code = Some(code);
        Ok(code)
    }

    // ── integers ───────────────────────────────────────────────────

    /// Exact value of a SmallInteger or large integer.
    pub fn integer_value(&mut self, value: Value) -> Option<BigInt> {
        match value {
            Value::Int(n) => Some(BigInt::from(n)),
            Value::Ref(oop) => {
                let negative = self.header(oop).ok()?.class == self.special.large_negative_integer;
                match &mut self.get_mut(oop).ok()?.body {
                    Body::LargeInteger(li) => Some(li.value(negative)),
                    _ => None,
                }
            }
        }
    }

    /// `n` as a SmallInteger when it fits, else a new large integer.
    pub fn integer_object(&mut self, n: &BigInt) -> Value {
        if let Some(small) = largeint::demote(n) {
            return small;
        }
        let class = if n.sign() == Sign::Minus {
            self.special.large_negative_integer
        } else {
            self.special.large_positive_integer
        };
        Value::Ref(self.alloc(class, Body::LargeInteger(LargeInteger::from_magnitude(n.magnitude()))))
    }

    // ── printing ───────────────────────────────────────────────────

    /// Short printString-like rendering for diagnostics.
    pub fn describe(&self, value: Value) -> String {
        let oop = match value {
            Value::Int(n) => return n.to_string(),
            Value::Ref(oop) => oop,
        };
        if oop == self.special.nil {
            return "nil".to_string();
        }
        if oop == self.special.true_obj {
            return "true".to_string();
        }
        if oop == self.special.false_obj {
            return "false".to_string();
        }
        let Ok(object) = self.get(oop) else {
            return format!("<invalid {oop:?}>");
        };
        let class = object.header.class;
        match &object.body {
            Body::Class(body) => body.name.clone(),
            Body::Bytes(bytes) if class == self.special.byte_symbol => {
                format!("#{}", String::from_utf8_lossy(bytes))
            }
            Body::Bytes(bytes) if class == self.special.byte_string => {
                format!("'{}'", String::from_utf8_lossy(bytes))
            }
            Body::LargeInteger(li) => {
                let mut li = li.clone();
                li.value(class == self.special.large_negative_integer).to_string()
            }
            _ => {
                let name = self.class_name(class);
                let article = match name.chars().next() {
                    Some('A' | 'E' | 'I' | 'O' | 'U') => "an",
                    _ => "a",
                };
                format!("{article} {name}")
            }
        }
    }
}

impl Default for ObjectMemory {
    fn default() -> Self {
        Self::new()
    }
}
