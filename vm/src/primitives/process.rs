//! Semaphores and processes. These only update scheduler state and record
//! what the interpreter has to do; the switch itself happens once the
//! current send has completed.

use object::{Oop, Value};

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::expect_ref;
use crate::signal::PendingSwitch;

fn expect_instance(vm: &VM, value: Value, class: Oop) -> Result<Oop, PrimitiveError> {
    let oop = expect_ref(value)?;
    if vm.memory.class_of(value)? != class {
        return Err(PrimitiveError::Failed);
    }
    Ok(oop)
}

pub fn signal(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let semaphore = expect_instance(vm, receiver, vm.memory.special.semaphore)?;
    if vm.scheduler.signal(&mut vm.memory, semaphore)? {
        state.request_switch(PendingSwitch::Preempt);
    }
    Ok(Some(receiver))
}

pub fn wait(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let semaphore = expect_instance(vm, receiver, vm.memory.special.semaphore)?;
    if vm.scheduler.wait(&mut vm.memory, semaphore)? {
        state.request_switch(PendingSwitch::Block);
    }
    Ok(Some(receiver))
}

pub fn resume(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let process = expect_instance(vm, receiver, vm.memory.special.process)?;
    if vm.scheduler.resume(&mut vm.memory, process)? {
        state.request_switch(PendingSwitch::Preempt);
    }
    Ok(Some(receiver))
}

pub fn suspend(
    vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    let process = expect_instance(vm, receiver, vm.memory.special.process)?;
    if vm.scheduler.suspend(&mut vm.memory, process)? {
        state.request_switch(PendingSwitch::Block);
    }
    Ok(Some(receiver))
}

pub fn yield_processor(
    _vm: &mut VM,
    state: &mut InterpreterState,
    receiver: Value,
    _args: &[Value],
) -> Result<Option<Value>, PrimitiveError> {
    state.request_switch(PendingSwitch::Yield);
    Ok(Some(receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;
    use crate::scheduler::EXCESS_SIGNALS;

    fn setup() -> (VM, InterpreterState) {
        (VM::new(VmConfig::quiet()).unwrap(), InterpreterState::new())
    }

    fn semaphore(vm: &mut VM) -> Value {
        let class = vm.memory.special.semaphore;
        Value::Ref(vm.memory.instantiate(class, 0).unwrap())
    }

    #[test]
    fn signal_without_waiters_counts() {
        let (mut vm, mut state) = setup();
        let sem = semaphore(&mut vm);
        signal(&mut vm, &mut state, sem, &[]).unwrap();
        signal(&mut vm, &mut state, sem, &[]).unwrap();
        assert_eq!(vm.memory.fetch(sem.as_oop().unwrap(), EXCESS_SIGNALS).unwrap(), Value::Int(2));
        assert_eq!(state.pending, None);

        // An excess signal is consumed without blocking.
        wait(&mut vm, &mut state, sem, &[]).unwrap();
        assert_eq!(state.pending, None);
        assert_eq!(vm.memory.fetch(sem.as_oop().unwrap(), EXCESS_SIGNALS).unwrap(), Value::Int(1));
    }

    #[test]
    fn waiting_blocks_the_active_process() {
        let (mut vm, mut state) = setup();
        let sem = semaphore(&mut vm);
        wait(&mut vm, &mut state, sem, &[]).unwrap();
        assert_eq!(state.pending, Some(PendingSwitch::Block));
    }

    #[test]
    fn block_wins_over_preempt() {
        let (mut vm, mut state) = setup();
        let sem = semaphore(&mut vm);
        wait(&mut vm, &mut state, sem, &[]).unwrap();
        yield_processor(&mut vm, &mut state, Value::Int(0), &[]).unwrap();
        assert_eq!(state.pending, Some(PendingSwitch::Block));
    }

    #[test]
    fn wrong_receivers_fail() {
        let (mut vm, mut state) = setup();
        let array = Value::Ref(vm.memory.new_array(Vec::new()));
        assert_eq!(signal(&mut vm, &mut state, array, &[]), Err(PrimitiveError::Failed));
        assert_eq!(resume(&mut vm, &mut state, Value::Int(1), &[]), Err(PrimitiveError::Failed));
    }

    #[test]
    fn suspending_the_active_process_blocks() {
        let (mut vm, mut state) = setup();
        let active = vm.scheduler.active_process(&vm.memory).unwrap();
        suspend(&mut vm, &mut state, Value::Ref(active), &[]).unwrap();
        assert_eq!(state.pending, Some(PendingSwitch::Block));
    }
}
