//! Identity and reflective field access.

use object::Value;

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::interpreter;
use crate::primitives::{arg, bool_value, expect_index, expect_ref, soft};

pub fn inst_var_at(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let index = expect_index(arg(args, 0)?)?;
    interpreter::inst_var_at(&mut vm.memory, state, receiver, index)
        .map(Some)
        .map_err(soft)
}

pub fn inst_var_at_put(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let index = expect_index(arg(args, 0)?)?;
    let value = arg(args, 1)?;
    interpreter::inst_var_put(&mut vm.memory, state, receiver, index, value).map_err(soft)?;
    Ok(Some(value))
}

pub fn identity_hash(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let oop = expect_ref(receiver)?;
    Ok(Some(Value::Int(vm.memory.identity_hash(oop)? as i64)))
}

pub fn identical(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    Ok(Some(bool_value(vm, receiver == arg(args, 0)?)))
}

pub fn not_identical(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    Ok(Some(bool_value(vm, receiver != arg(args, 0)?)))
}

pub fn class(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    Ok(Some(Value::Ref(vm.memory.class_of(receiver)?)))
}
