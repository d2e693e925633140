use object::Value;

use crate::VM;
use crate::dispatch::activate_closure;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::{arg, array_elements, expect_ref, soft};

fn call_with_args(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let closure = expect_ref(receiver)?;
    if !activate_closure(vm, state, closure, args).map_err(soft)? {
        return Err(PrimitiveError::Failed);
    }
    Ok(None)
}

/// `value`, `value:` ... `value:value:value:value:`.
pub fn value(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    call_with_args(vm, state, receiver, args)
}

pub fn value_with_arguments(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let args = array_elements(vm, arg(args, 0)?)?;
    call_with_args(vm, state, receiver, &args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;
    use bytecode::{BytecodeBuilder, Constant};
    use object::{Body, BlockKey, ClosureBody, ContextBody, ContextLink, MethodHeader};

    fn setup() -> (VM, InterpreterState, Value) {
        let mut vm = VM::new(VmConfig::quiet()).unwrap();
        let mut state = InterpreterState::new();
        let mut b = BytecodeBuilder::new();
        let block = b.push_closure(1, 2);
        b.push_constant(Constant::Nil);
        b.block_return();
        b.end_closure(block);
        b.return_top();
        let method = vm.memory.new_method(MethodHeader::default(), Vec::new(), b.into_bytes());
        let nil = vm.memory.nil();
        state.push_frame(ContextBody {
            sender: ContextLink::Nil,
            pc: Some(0),
            stack: Vec::new(),
            code: method,
            method,
            closure: None,
            receiver: nil,
            process: None,
        });
        let code = vm
            .memory
            .block_code(method, BlockKey { num_args: 2, num_copied: 1, start: 4, size: 2 })
            .unwrap();
        let class = vm.memory.special.block_closure;
        let closure = vm.memory.alloc(
            class,
            Body::Closure(ClosureBody {
                outer: state.link_to(0),
                receiver: nil,
                copied: vec![Value::Int(9)],
                start_pc: 4,
                num_args: 2,
                method,
                code: Some(code),
            }),
        );
        (vm, state, Value::Ref(closure))
    }

    #[test]
    fn value_pushes_an_activation() {
        let (mut vm, mut state, closure) = setup();
        let result = value(&mut vm, &mut state, closure, &[Value::Int(1), Value::Int(2)]);
        assert_eq!(result, Ok(None));
        assert_eq!(state.depth(), 2);
        let body = state.body(&vm.memory).unwrap();
        assert_eq!(body.stack, vec![Value::Int(1), Value::Int(2), Value::Int(9)]);
        assert_eq!(body.closure, closure.as_oop());
    }

    #[test]
    fn wrong_argument_count_fails() {
        let (mut vm, mut state, closure) = setup();
        assert_eq!(value(&mut vm, &mut state, closure, &[Value::Int(1)]), Err(PrimitiveError::Failed));
        assert_eq!(state.depth(), 1);
        assert_eq!(value(&mut vm, &mut state, Value::Int(3), &[]), Err(PrimitiveError::Failed));
    }

    #[test]
    fn value_with_arguments_spreads_an_array() {
        let (mut vm, mut state, closure) = setup();
        let args = Value::Ref(vm.memory.new_array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(value_with_arguments(&mut vm, &mut state, closure, &[args]), Ok(None));
        assert_eq!(state.depth(), 2);
        assert_eq!(
            value_with_arguments(&mut vm, &mut state, closure, &[Value::Int(1)]),
            Err(PrimitiveError::Failed)
        );
    }
}
