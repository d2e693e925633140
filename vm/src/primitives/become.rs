use log::debug;
use object::{Oop, Value};

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::{arg, array_elements, expect_ref};

fn references(values: &[Value]) -> Result<Vec<Oop>, PrimitiveError> {
    values.iter().map(|v| expect_ref(*v)).collect()
}

/// `from elementsForwardIdentityTo: to`, optionally copying hashes.
fn forward(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    to: Value,
    copy_hash: bool,
) -> Result<Option<Value>, PrimitiveError> {
    let from = references(&array_elements(vm, receiver)?)?;
    let to = array_elements(vm, to)?;
    if from.len() != to.len() {
        return Err(PrimitiveError::Failed);
    }
    // Cached targets may be among the forwarded objects.
    vm.caches.clear();
    let (memory, mut roots) = vm.split_roots(state);
    memory.become_one_way(&from, &to, copy_hash, true, &mut roots)?;
    debug!("forwarded {} objects (copy hash: {copy_hash})", from.len());
    Ok(Some(receiver))
}

pub fn become_one_way(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    forward(vm, state, receiver, arg(args, 0)?, false)
}

pub fn become_one_way_copy_hash(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let copy_hash = vm.memory.as_boolean(arg(args, 1)?).ok_or(PrimitiveError::Failed)?;
    forward(vm, state, receiver, arg(args, 0)?, copy_hash)
}

/// `from elementsExchangeIdentityWith: to`.
pub fn become_two_way(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let from = references(&array_elements(vm, receiver)?)?;
    let to = references(&array_elements(vm, arg(args, 0)?)?)?;
    if from.len() != to.len() {
        return Err(PrimitiveError::Failed);
    }
    vm.caches.clear();
    for (a, b) in from.into_iter().zip(to) {
        vm.memory.become_two_way(a, b)?;
    }
    Ok(Some(receiver))
}
