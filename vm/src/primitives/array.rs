use object::{Body, MemoryError, ObjectMemory, Oop, Value};

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::{arg, expect_index, expect_ref};

/// Number of named fields in front of the indexable ones.
fn fixed_fields(memory: &ObjectMemory, oop: Oop) -> Result<usize, MemoryError> {
    let class = memory.header(oop)?.class;
    Ok(memory.class_body(class)?.inst_size)
}

/// Indexable element count, or `None` for objects without indexable
/// fields.
fn indexable_size(memory: &ObjectMemory, oop: Oop) -> Result<Option<usize>, MemoryError> {
    Ok(match memory.body(oop)? {
        Body::Pointers(slots) => Some(slots.len().saturating_sub(fixed_fields(memory, oop)?)),
        Body::Weak { fixed, slots } => Some(slots.len().saturating_sub(*fixed)),
        Body::Bytes(bytes) => Some(bytes.len()),
        Body::LargeInteger(li) => Some(li.len()),
        _ => None,
    })
}

pub fn size(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let oop = expect_ref(receiver)?;
    let size = indexable_size(&vm.memory, oop)?.ok_or(PrimitiveError::Failed)?;
    Ok(Some(Value::Int(size as i64)))
}

pub fn at(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let oop = expect_ref(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let memory = &vm.memory;
    let value = match memory.body(oop)? {
        Body::Pointers(_) => memory.fetch(oop, fixed_fields(memory, oop)? + index)?,
        Body::Weak { fixed, .. } => memory.fetch(oop, fixed + index)?,
        Body::Bytes(bytes) => Value::Int(*bytes.get(index).ok_or(PrimitiveError::Failed)? as i64),
        Body::LargeInteger(li) => Value::Int(*li.bytes().get(index).ok_or(PrimitiveError::Failed)? as i64),
        _ => return Err(PrimitiveError::Failed),
    };
    Ok(Some(value))
}

pub fn at_put(
    vm: &mut VM,
    _state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let oop = expect_ref(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let value = arg(args, 1)?;
    if vm.memory.header(oop)?.is_immutable() {
        return Err(PrimitiveError::Failed);
    }
    let fixed = match vm.memory.body(oop)? {
        Body::Pointers(_) => Some(fixed_fields(&vm.memory, oop)?),
        Body::Weak { fixed, .. } => Some(*fixed),
        _ => None,
    };
    if let Some(fixed) = fixed {
        vm.memory.store(oop, fixed + index, value)?;
        return Ok(Some(value));
    }

    let byte = match value {
        Value::Int(b @ 0..=255) => b as u8,
        _ => return Err(PrimitiveError::Failed),
    };
    match vm.memory.body_mut(oop)? {
        Body::Bytes(bytes) => *bytes.get_mut(index).ok_or(PrimitiveError::Failed)? = byte,
        Body::LargeInteger(li) => {
            if !li.set_byte(index, byte) {
                return Err(PrimitiveError::Failed);
            }
        }
        _ => return Err(PrimitiveError::Failed),
    }
    Ok(Some(value))
}
