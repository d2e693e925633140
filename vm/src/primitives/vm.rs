use log::debug;
use object::Value;

use crate::VM;
use crate::dispatch::{self, selector_arity};
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::interrupt::monotonic_millis;
use crate::primitives::{arg, array_elements, expect_int, expect_ref};

/// Send `selector` with `args` as if the receiver had sent it itself.
fn perform_selector(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    selector: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let selector_oop = expect_ref(selector)?;
    let name = vm.memory.string_of(selector).ok_or(PrimitiveError::Failed)?;
    if selector_arity(name) != args.len() {
        return Err(PrimitiveError::Failed);
    }
    let body = state.body_mut(&mut vm.memory).map_err(PrimitiveError::Fatal)?;
    body.push(receiver);
    body.stack.extend_from_slice(args);
    dispatch::send(vm, state, selector_oop, args.len(), None, None)?;
    Ok(None)
}

/// `perform:` through `perform:with:with:with:with:`.
pub fn perform(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let selector = arg(args, 0)?;
    perform_selector(vm, state, receiver, selector, &args[1..])
}

pub fn perform_with_arguments(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let selector = arg(args, 0)?;
    let arguments = array_elements(vm, arg(args, 1)?)?;
    perform_selector(vm, state, receiver, selector, &arguments)
}

/// Full collection. Answers the number of objects freed.
pub fn full_gc(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let stats = vm.collect_garbage(state, &[receiver]);
    debug!("gc primitive: {stats:?}");
    Ok(Some(Value::Int(stats.freed as i64)))
}

fn optional_semaphore(vm: &VM, value: Value) -> Result<Option<object::Oop>, PrimitiveError> {
    if vm.memory.is_nil(value) {
        return Ok(None);
    }
    if vm.memory.class_of(value)? != vm.memory.special.semaphore {
        return Err(PrimitiveError::Failed);
    }
    expect_ref(value).map(Some)
}

pub fn interrupt_semaphore(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let semaphore = optional_semaphore(vm, arg(args, 0)?)?;
    vm.interrupts.set_interrupt_semaphore(semaphore);
    Ok(Some(receiver))
}

pub fn millisecond_clock(
    _vm: &mut VM,
    _state: &mut InterpreterState,
    _receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    Ok(Some(Value::Int(monotonic_millis() as i64)))
}

/// `signal: aSemaphore atMilliseconds: tick`. A nil semaphore cancels the
/// timer.
pub fn signal_at_milliseconds(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let semaphore = optional_semaphore(vm, arg(args, 0)?)?;
    let tick = match expect_int(arg(args, 1)?)? {
        t if t >= 0 => t as u64,
        _ => return Err(PrimitiveError::Failed),
    };
    vm.interrupts.schedule_timer(semaphore, tick);
    Ok(Some(receiver))
}
