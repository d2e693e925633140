use object::{Body, Value};

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::{arg, expect_int, expect_ref};

pub fn basic_new(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let class = expect_ref(receiver)?;
    Ok(Some(Value::Ref(vm.memory.instantiate(class, 0)?)))
}

pub fn basic_new_size(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let class = expect_ref(receiver)?;
    let size = match expect_int(arg(args, 0)?)? {
        n if n >= 0 => n as usize,
        _ => return Err(PrimitiveError::Failed),
    };
    Ok(Some(Value::Ref(vm.memory.instantiate(class, size)?)))
}

/// A new object of the same class with the same fields. Classes are not
/// copied.
pub fn shallow_copy(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let Value::Ref(oop) = receiver else {
        return Ok(Some(receiver));
    };
    let object = vm.memory.get(oop)?;
    if matches!(object.body, Body::Class(_)) {
        return Err(PrimitiveError::Failed);
    }
    let (class, body) = (object.header.class, object.body.clone());
    Ok(Some(Value::Ref(vm.memory.alloc(class, body))))
}
