use object::{Oop, Value};

use crate::VM;
use crate::error::{PrimitiveError, RuntimeError};
use crate::frame::InterpreterState;

pub mod array;
pub mod r#become;
pub mod block;
pub mod integer;
pub mod mirror;
pub mod object_clone;
pub mod process;
pub mod vm;

/// A primitive answers `Some(result)` to replace the send, or `None` when
/// it has already arranged the continuation itself (pushed a frame or
/// re-sent).
pub type PrimitiveFn = fn(
    &mut VM,
    &mut InterpreterState,
    Value,
    &[Value],
) -> Result<Option<Value>, PrimitiveError>;

/// Argument count of primitives that accept any number of arguments.
pub const VARIADIC: u8 = u8::MAX;

#[derive(Clone, Copy)]
pub struct PrimitiveDesc {
    /// Squeak primitive number.
    pub index: u16,
    pub name: &'static str,
    pub arity: u8,
    pub func: PrimitiveFn,
}

impl PrimitiveDesc {
    pub const fn new(index: u16, name: &'static str, arity: u8, func: PrimitiveFn) -> Self {
        Self {
            index,
            name,
            arity,
            func,
        }
    }
}

impl std::fmt::Debug for PrimitiveDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<primitive {} {}>", self.index, self.name)
    }
}

pub fn default_primitives() -> Vec<PrimitiveDesc> {
    let mut prims = integer::descriptors();
    prims.extend([
        PrimitiveDesc::new(60, "at", 1, array::at),
        PrimitiveDesc::new(61, "at_put", 2, array::at_put),
        PrimitiveDesc::new(62, "size", 0, array::size),
        PrimitiveDesc::new(70, "basic_new", 0, object_clone::basic_new),
        PrimitiveDesc::new(71, "basic_new_size", 1, object_clone::basic_new_size),
        PrimitiveDesc::new(72, "array_become_one_way", 1, r#become::become_one_way),
        PrimitiveDesc::new(73, "inst_var_at", 1, mirror::inst_var_at),
        PrimitiveDesc::new(74, "inst_var_at_put", 2, mirror::inst_var_at_put),
        PrimitiveDesc::new(75, "identity_hash", 0, mirror::identity_hash),
        PrimitiveDesc::new(83, "perform", VARIADIC, vm::perform),
        PrimitiveDesc::new(84, "perform_with_arguments", 2, vm::perform_with_arguments),
        PrimitiveDesc::new(85, "signal", 0, process::signal),
        PrimitiveDesc::new(86, "wait", 0, process::wait),
        PrimitiveDesc::new(87, "resume", 0, process::resume),
        PrimitiveDesc::new(88, "suspend", 0, process::suspend),
        PrimitiveDesc::new(110, "identical", 1, mirror::identical),
        PrimitiveDesc::new(111, "class", 0, mirror::class),
        PrimitiveDesc::new(128, "array_become", 1, r#become::become_two_way),
        PrimitiveDesc::new(130, "full_gc", 0, vm::full_gc),
        PrimitiveDesc::new(134, "interrupt_semaphore", 1, vm::interrupt_semaphore),
        PrimitiveDesc::new(135, "millisecond_clock", 0, vm::millisecond_clock),
        PrimitiveDesc::new(136, "signal_at_milliseconds", 2, vm::signal_at_milliseconds),
        PrimitiveDesc::new(148, "shallow_copy", 0, object_clone::shallow_copy),
        PrimitiveDesc::new(167, "yield", 0, process::yield_processor),
        PrimitiveDesc::new(169, "not_identical", 1, mirror::not_identical),
        PrimitiveDesc::new(201, "closure_value", 0, block::value),
        PrimitiveDesc::new(202, "closure_value_", 1, block::value),
        PrimitiveDesc::new(203, "closure_value_value", 2, block::value),
        PrimitiveDesc::new(204, "closure_value_value_value", 3, block::value),
        PrimitiveDesc::new(205, "closure_value_value_value_value", 4, block::value),
        PrimitiveDesc::new(206, "closure_value_with_arguments", 1, block::value_with_arguments),
        PrimitiveDesc::new(248, "array_become_one_way_copy_hash", 2, r#become::become_one_way_copy_hash),
    ]);
    prims
}

/// Table indexed by primitive number.
pub fn table() -> Vec<Option<PrimitiveDesc>> {
    let prims = default_primitives();
    let len = prims.iter().map(|p| p.index as usize + 1).max().unwrap_or(0);
    let mut table = vec![None; len];
    for prim in prims {
        table[prim.index as usize] = Some(prim);
    }
    table
}

pub fn get_primitive(table: &[Option<PrimitiveDesc>], index: u16) -> Option<PrimitiveDesc> {
    table.get(index as usize).copied().flatten()
}

/// Run primitive `index`. Unknown numbers and argument count mismatches
/// fail, so the method body runs instead.
pub fn call(
    vm: &mut VM,
    state: &mut InterpreterState,
    index: u16,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let Some(prim) = get_primitive(&vm.primitives, index) else {
        return Err(PrimitiveError::Failed);
    };
    if prim.arity != VARIADIC && prim.arity as usize != args.len() {
        return Err(PrimitiveError::Failed);
    }
    (prim.func)(vm, state, receiver, args)
}

// ── argument helpers ───────────────────────────────────────────────

pub(crate) fn arg(args: &[Value], index: usize) -> Result<Value, PrimitiveError> {
    args.get(index).copied().ok_or(PrimitiveError::Failed)
}

pub(crate) fn expect_int(value: Value) -> Result<i64, PrimitiveError> {
    value.as_int().ok_or(PrimitiveError::Failed)
}

pub(crate) fn expect_ref(value: Value) -> Result<Oop, PrimitiveError> {
    value.as_oop().ok_or(PrimitiveError::Failed)
}

/// A 1-based Smalltalk index as a 0-based one.
pub(crate) fn expect_index(value: Value) -> Result<usize, PrimitiveError> {
    match expect_int(value)? {
        n if n >= 1 => Ok(n as usize - 1),
        _ => Err(PrimitiveError::Failed),
    }
}

/// Bad indices and wrong kinds fail the primitive; anything else stops
/// the VM.
pub(crate) fn soft(err: RuntimeError) -> PrimitiveError {
    match err {
        RuntimeError::Memory(_) | RuntimeError::TypeError { .. } => PrimitiveError::Failed,
        other => PrimitiveError::Fatal(other),
    }
}

pub(crate) fn bool_value(vm: &VM, value: bool) -> Value {
    vm.memory.boolean(value)
}

/// Elements of an Array argument.
pub(crate) fn array_elements(vm: &VM, value: Value) -> Result<Vec<Value>, PrimitiveError> {
    let oop = expect_ref(value)?;
    if vm.memory.class_of(value)? != vm.memory.special.array {
        return Err(PrimitiveError::Failed);
    }
    let size = vm.memory.slot_count(oop)?;
    (0..size).map(|i| Ok(vm.memory.fetch(oop, i)?)).collect()
}
