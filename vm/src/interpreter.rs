//! The bytecode loop, returns and the top-level driver.
//!
//! [`run`] executes the native stack until control has to leave it; the
//! [`ControlTransfer`] it answers tells [`run_top_level`] which heap
//! context to continue in. Scheduling requests raised by primitives or
//! interrupts are honoured after the instruction that raised them.

use bytecode::{BytecodeBuilder, Constant, Instruction, decode_at, special_selector_arity};
use log::{debug, error, trace};
use object::{
    BlockKey, Body, ClosureBody, ContextBody, ContextLink, MemoryError, MethodHeader,
    ObjectMemory, Oop, Value,
};

use crate::VM;
use crate::debug::stack_trace;
use crate::dispatch::{self, Target};
use crate::error::RuntimeError;
use crate::frame::{InterpreterState, Resolved, retire};
use crate::primitives::integer::IntOp;
use crate::signal::{ControlTransfer, PendingSwitch};

type Step = Result<Option<ControlTransfer>, RuntimeError>;

// Context instance variables as seen from Smalltalk.
pub const CTX_SENDER: usize = 0;
pub const CTX_PC: usize = 1;
pub const CTX_STACKP: usize = 2;
pub const CTX_METHOD: usize = 3;
pub const CTX_CLOSURE: usize = 4;
pub const CTX_RECEIVER: usize = 5;
pub const CTX_STACK: usize = 6;

// BlockClosure instance variables.
pub const CLOSURE_OUTER: usize = 0;
pub const CLOSURE_START_PC: usize = 1;
pub const CLOSURE_NUM_ARGS: usize = 2;
pub const CLOSURE_COPIED: usize = 3;

// Association
const VALUE: usize = 1;

/// Run `context` in the active process until a context whose sender is nil
/// returns, and answer the returned value.
pub fn run_top_level(vm: &mut VM, context: Oop) -> Result<Value, RuntimeError> {
    let mut state = InterpreterState::new();
    let process = vm.scheduler.active_process(&vm.memory)?;
    state.top_process = Some(process);
    vm.memory.context_mut(context)?.process = Some(process);

    let mut resume = (context, None);
    loop {
        enter(vm, &mut state, resume.0, resume.1)?;
        let transfer = run(vm, &mut state)?;
        trace!("control transfer {transfer:?}");
        match transfer {
            ControlTransfer::TopLevelReturn { value } => return Ok(value),
            other => {
                if let Some(next) = other.resumption() {
                    resume = next;
                }
            }
        }
    }
}

/// Make `ctx` the only activation on the native stack.
fn enter(vm: &mut VM, state: &mut InterpreterState, ctx: Oop, value: Option<Value>) -> Result<(), RuntimeError> {
    debug_assert!(state.depth() == 0, "entering with a live native stack");
    let (pc, code) = {
        let body = vm.memory.context(ctx)?;
        (body.pc, body.code)
    };
    match pc {
        None => {
            let value = value.unwrap_or_else(|| vm.memory.nil());
            debug!("resuming returned context {ctx:?}");
            return enter_dead(vm, state, ctx, value);
        }
        Some(0) => {
            debug!("resuming {ctx:?} from the start");
            let temps = vm.memory.code(code)?.header.num_temps as usize;
            let nil = vm.memory.nil();
            let body = vm.memory.context_mut(ctx)?;
            if body.stack.len() < temps {
                body.stack.resize(temps, nil);
            }
        }
        Some(pc) => debug!("resuming {ctx:?} at pc {pc}"),
    }
    state.push_context(ctx);
    if let Some(value) = value {
        state.push_value(&mut vm.memory, value)?;
    }
    Ok(())
}

/// Something returned into a context that already returned: report it with
/// `cannotReturn:` from a fresh bottom activation.
fn enter_dead(vm: &mut VM, state: &mut InterpreterState, ctx: Oop, value: Value) -> Result<(), RuntimeError> {
    ensure_cannot_return_handler(vm, Value::Ref(ctx), value)?;
    let selector = vm.memory.special.cannot_return;
    let mut b = BytecodeBuilder::new();
    b.send(0, 1);
    b.return_top();
    let header = MethodHeader {
        num_literals: 1,
        ..MethodHeader::default()
    };
    let method = vm.memory.new_method(header, vec![Value::Ref(selector)], b.into_bytes());
    state.push_frame(ContextBody {
        sender: ContextLink::Nil,
        pc: Some(0),
        stack: vec![Value::Ref(ctx), value],
        code: method,
        method,
        closure: None,
        receiver: Value::Ref(ctx),
        process: None,
    });
    Ok(())
}

/// Execute until control leaves the native stack.
pub fn run(vm: &mut VM, state: &mut InterpreterState) -> Result<ControlTransfer, RuntimeError> {
    loop {
        let (instruction, pc, next) = {
            let body = state.body(&vm.memory)?;
            let pc = body.pc.ok_or(RuntimeError::PcOutOfRange { pc: usize::MAX })?;
            let bytes = &vm.memory.code(body.code)?.bytes;
            if pc >= bytes.len() {
                return Err(RuntimeError::PcOutOfRange { pc });
            }
            let (instruction, next) = decode_at(bytes, pc);
            (instruction, pc, next)
        };
        state.body_mut(&mut vm.memory)?.pc = Some(next);

        if let Some(transfer) = execute(vm, state, instruction, pc, next)? {
            return Ok(transfer);
        }
        if let Some(switch) = state.pending.take() {
            if let Some(transfer) = perform_switch(vm, state, switch)? {
                return Ok(transfer);
            }
        }
    }
}

fn execute(vm: &mut VM, state: &mut InterpreterState, instruction: Instruction, pc: usize, next: usize) -> Step {
    let memory = &mut vm.memory;
    match instruction {
        Instruction::PushReceiverVariable { index } => {
            let receiver = state.body(memory)?.receiver;
            let value = inst_var_at(memory, state, receiver, index as usize)?;
            state.push_value(memory, value)?;
        }
        Instruction::PushTemporary { index } => {
            let body = state.body_mut(memory)?;
            let value = body.temp(index as usize).ok_or(bad_temp(index))?;
            body.push(value);
        }
        Instruction::PushLiteralConstant { index } => {
            let value = literal(memory, state, index)?;
            state.push_value(memory, value)?;
        }
        Instruction::PushLiteralVariable { index } => {
            let association = expect_oop(literal(memory, state, index)?)?;
            let value = memory.fetch(association, VALUE)?;
            state.push_value(memory, value)?;
        }
        Instruction::PushReceiver => {
            let body = state.body_mut(memory)?;
            let receiver = body.receiver;
            body.push(receiver);
        }
        Instruction::PushConstant { value } => {
            let value = constant(memory, value);
            state.push_value(memory, value)?;
        }
        Instruction::PushActiveContext => {
            let ctx = state.materialize_top(memory)?;
            state.push_value(memory, Value::Ref(ctx))?;
        }
        Instruction::PushNewArray { size, pop_into } => {
            let elements = if pop_into {
                state.body_mut(memory)?.pop_n(size as usize).ok_or_else(underflow)?
            } else {
                vec![memory.nil(); size as usize]
            };
            let array = memory.new_array(elements);
            state.push_value(memory, Value::Ref(array))?;
        }
        Instruction::PushRemoteTemp { index, vector } => {
            let vector = temp_vector(memory, state, vector)?;
            let value = memory.fetch(vector, index as usize)?;
            state.push_value(memory, value)?;
        }
        Instruction::PushClosure {
            num_copied,
            num_args,
            block_size,
        } => push_closure(vm, state, num_copied, num_args, block_size, next)?,
        Instruction::StoreReceiverVariable { index, pop } => {
            let value = top_or_pop(memory, state, pop)?;
            let receiver = state.body(memory)?.receiver;
            inst_var_put(memory, state, receiver, index as usize, value)?;
        }
        Instruction::StoreTemporary { index, pop } => {
            let value = top_or_pop(memory, state, pop)?;
            if !state.body_mut(memory)?.set_temp(index as usize, value) {
                return Err(bad_temp(index));
            }
        }
        Instruction::StoreLiteralVariable { index, pop } => {
            let value = top_or_pop(memory, state, pop)?;
            let association = expect_oop(literal(memory, state, index)?)?;
            memory.store(association, VALUE, value)?;
        }
        Instruction::StoreRemoteTemp { index, vector, pop } => {
            let value = top_or_pop(memory, state, pop)?;
            let vector = temp_vector(memory, state, vector)?;
            memory.store(vector, index as usize, value)?;
        }
        Instruction::Pop => {
            state.pop_value(memory)?;
        }
        Instruction::Dup => {
            let body = state.body_mut(memory)?;
            let top = body.top().ok_or_else(underflow)?;
            body.push(top);
        }
        Instruction::Send { literal: index, num_args } => {
            let selector = expect_oop(literal(memory, state, index)?)?;
            let code = state.body(memory)?.code;
            check_interrupts(vm, state)?;
            dispatch::send(vm, state, selector, num_args as usize, None, Some((code, pc)))?;
        }
        Instruction::SuperSend { literal: index, num_args } => {
            let selector = expect_oop(literal(memory, state, index)?)?;
            let (code, method) = {
                let body = state.body(memory)?;
                (body.code, body.method)
            };
            let holder = memory.code(method)?.holder;
            let class = expect_oop(holder)?;
            let superclass = memory.superclass_of(class)?.ok_or(RuntimeError::TypeError {
                expected: "a method holder with a superclass",
                got: holder,
            })?;
            check_interrupts(vm, state)?;
            dispatch::send(vm, state, selector, num_args as usize, Some(superclass), Some((code, pc)))?;
        }
        Instruction::SpecialSend { index } => {
            if !special_fast_path(memory, state, index)? {
                let (selector, arity) = memory.special_selector(index)?;
                let code = state.body(memory)?.code;
                check_interrupts(vm, state)?;
                dispatch::send(vm, state, selector, arity as usize, None, Some((code, pc)))?;
            }
        }
        Instruction::ReturnReceiver => {
            let value = state.body(memory)?.receiver;
            return method_return(vm, state, value);
        }
        Instruction::ReturnConstant { value } => {
            let value = constant(memory, value);
            return method_return(vm, state, value);
        }
        Instruction::ReturnTop => {
            let value = state.pop_value(memory)?;
            return method_return(vm, state, value);
        }
        Instruction::BlockReturn => {
            let value = state.pop_value(memory)?;
            return local_return(vm, state, value);
        }
        Instruction::Jump { offset } => {
            jump(memory, state, instruction, next)?;
            if offset < 0 {
                check_interrupts(vm, state)?;
            }
        }
        Instruction::JumpIfTrue { .. } | Instruction::JumpIfFalse { .. } => {
            let condition = state.pop_value(memory)?;
            let when = matches!(instruction, Instruction::JumpIfTrue { .. });
            match memory.as_boolean(condition) {
                Some(b) if b == when => jump(memory, state, instruction, next)?,
                Some(_) => {}
                None => {
                    trace!("non-boolean {} in conditional jump", memory.describe(condition));
                    state.push_value(memory, condition)?;
                    let selector = memory.special.must_be_boolean;
                    dispatch::send(vm, state, selector, 0, None, None)?;
                }
            }
        }
        // The primitive already ran (and failed) when the method was sent.
        Instruction::CallPrimitive { .. } => {}
        Instruction::Unknown { byte } => return Err(RuntimeError::UnknownBytecode { byte, pc }),
    }
    Ok(None)
}

// ── operands ───────────────────────────────────────────────────────

fn underflow() -> RuntimeError {
    RuntimeError::Unimplemented {
        message: "operand stack underflow",
    }
}

fn bad_temp(index: u8) -> RuntimeError {
    RuntimeError::TypeError {
        expected: "a temporary index within the frame",
        got: Value::Int(index as i64),
    }
}

fn expect_oop(value: Value) -> Result<Oop, RuntimeError> {
    value.as_oop().ok_or(RuntimeError::Memory(MemoryError::NotAReference(value)))
}

fn constant(memory: &ObjectMemory, value: Constant) -> Value {
    match value {
        Constant::True => memory.boolean(true),
        Constant::False => memory.boolean(false),
        Constant::Nil => memory.nil(),
        Constant::Int(n) => Value::Int(n as i64),
    }
}

fn literal(memory: &ObjectMemory, state: &InterpreterState, index: u8) -> Result<Value, RuntimeError> {
    let code = state.body(memory)?.code;
    memory.code(code)?.literal(index as usize).ok_or(RuntimeError::TypeError {
        expected: "a literal index within the method",
        got: Value::Int(index as i64),
    })
}

fn temp_vector(memory: &ObjectMemory, state: &InterpreterState, vector: u8) -> Result<Oop, RuntimeError> {
    let value = state.body(memory)?.temp(vector as usize).ok_or(bad_temp(vector))?;
    expect_oop(value)
}

fn top_or_pop(memory: &mut ObjectMemory, state: &mut InterpreterState, pop: bool) -> Result<Value, RuntimeError> {
    let body = state.body_mut(memory)?;
    if pop { body.pop() } else { body.top() }.ok_or_else(underflow)
}

fn jump(memory: &mut ObjectMemory, state: &mut InterpreterState, instruction: Instruction, next: usize) -> Result<(), RuntimeError> {
    let target = instruction.jump_target(next).ok_or(RuntimeError::PcOutOfRange { pc: next })?;
    state.body_mut(memory)?.pc = Some(target);
    Ok(())
}

fn push_closure(
    vm: &mut VM,
    state: &mut InterpreterState,
    num_copied: u8,
    num_args: u8,
    block_size: u16,
    next: usize,
) -> Result<(), RuntimeError> {
    let memory = &mut vm.memory;
    let copied = state.body_mut(memory)?.pop_n(num_copied as usize).ok_or_else(underflow)?;
    let (code, method, receiver) = {
        let body = state.body(memory)?;
        (body.code, body.method, body.receiver)
    };
    let start = memory.code(code)?.base + next;
    let key = BlockKey {
        num_args,
        num_copied,
        start,
        size: block_size as usize,
    };
    let block = memory.block_code(method, key)?;
    let outer = state.link_to(state.depth() - 1);
    let class = memory.special.block_closure;
    let closure = memory.alloc(
        class,
        Body::Closure(ClosureBody {
            outer,
            receiver,
            copied,
            start_pc: start,
            num_args,
            method,
            code: Some(block),
        }),
    );
    let body = state.body_mut(memory)?;
    body.push(Value::Ref(closure));
    body.pc = Some(next + block_size as usize);
    Ok(())
}

// ── special selectors ──────────────────────────────────────────────

/// Answer special sends that need no lookup. Leaves the stack untouched
/// and answers `false` when a real send is needed.
fn special_fast_path(memory: &mut ObjectMemory, state: &mut InterpreterState, index: u8) -> Result<bool, RuntimeError> {
    let arity = special_selector_arity(index) as usize;
    let body = state.body(memory)?;
    let result = match (index, arity) {
        (22, _) => {
            let (a, b) = (body.peek(1).ok_or_else(underflow)?, body.peek(0).ok_or_else(underflow)?);
            Some(memory.boolean(a == b))
        }
        (23, _) => Some(Value::Ref(memory.class_of(body.peek(0).ok_or_else(underflow)?)?)),
        (_, 1) => match (body.peek(1), body.peek(0), IntOp::from_special_selector(index)) {
            (Some(Value::Int(a)), Some(Value::Int(b)), Some(op)) => op.small(memory, a, b),
            _ => None,
        },
        _ => None,
    };
    let Some(result) = result else {
        return Ok(false);
    };
    let body = state.body_mut(memory)?;
    body.pop_n(arity + 1).ok_or_else(underflow)?;
    body.push(result);
    Ok(true)
}

// ── returns ────────────────────────────────────────────────────────

/// `^value`: a local return from a method, a non-local one from a block.
fn method_return(vm: &mut VM, state: &mut InterpreterState, value: Value) -> Step {
    if state.body(&vm.memory)?.closure.is_some() {
        non_local_return(vm, state, value)
    } else {
        local_return(vm, state, value)
    }
}

fn is_live_context(memory: &ObjectMemory, ctx: Oop) -> bool {
    memory.context(ctx).is_ok_and(|body| body.pc.is_some())
}

/// Return `value` from the top activation to its sender.
fn local_return(vm: &mut VM, state: &mut InterpreterState, value: Value) -> Step {
    let top = state.depth() - 1;
    let sender = state.body(&vm.memory)?.sender;
    match state.resolve(sender) {
        Resolved::Native(index) if index + 1 == top => {
            state.pop_activation(&mut vm.memory)?;
            state.push_value(&mut vm.memory, value)?;
            Ok(None)
        }
        Resolved::Native(index) => {
            // The sender was rewritten to an activation further down.
            state.flush(&mut vm.memory)?;
            let target = state.materialize(&mut vm.memory, index)?;
            leave_flushed(vm, state)?;
            Ok(Some(ControlTransfer::NonVirtualReturn { value, target }))
        }
        Resolved::Heap(target) if is_live_context(&vm.memory, target) => {
            if top == 0 {
                state.pop_activation(&mut vm.memory)?;
                return Ok(Some(ControlTransfer::LocalReturn { value, target }));
            }
            state.flush(&mut vm.memory)?;
            leave_flushed(vm, state)?;
            Ok(Some(ControlTransfer::NonVirtualReturn { value, target }))
        }
        Resolved::Gone if sender.is_nil() => return_to_nil(vm, state, value),
        _ => cannot_return(vm, state, value),
    }
}

/// Retire the top activation and forget the rest of a flushed stack.
fn leave_flushed(vm: &mut VM, state: &mut InterpreterState) -> Result<(), RuntimeError> {
    state.pop_activation(&mut vm.memory)?;
    state.abandon();
    Ok(())
}

/// The returning activation has no sender: the run is over for the
/// top-level process, any other process terminates.
fn return_to_nil(vm: &mut VM, state: &mut InterpreterState, value: Value) -> Step {
    let active = vm.scheduler.active_process(&vm.memory)?;
    if state.top_process == Some(active) {
        state.discard_all(&mut vm.memory)?;
        return Ok(Some(ControlTransfer::TopLevelReturn { value }));
    }
    debug!(
        "process {active:?} returned {} to nil, terminating it",
        vm.memory.describe(value)
    );
    vm.scheduler.terminate(&mut vm.memory, active)?;
    perform_switch(vm, state, PendingSwitch::Terminate)
}

enum Home {
    Native(usize),
    Heap(Oop),
}

/// Home activation of the running block: follow outer contexts until one
/// is not a block. `None` if some link on the way is dead.
fn find_home(vm: &mut VM, state: &InterpreterState) -> Result<Option<Home>, RuntimeError> {
    let memory = &vm.memory;
    let Some(mut closure) = state.body(memory)?.closure else {
        return Ok(Some(Home::Native(state.depth() - 1)));
    };
    loop {
        let outer = memory.closure(closure)?.outer;
        closure = match state.resolve(outer) {
            Resolved::Native(index) => match state.body_at(memory, index)?.closure {
                None => return Ok(Some(Home::Native(index))),
                Some(next) => next,
            },
            Resolved::Heap(ctx) => {
                let body = memory.context(ctx)?;
                if body.pc.is_none() {
                    return Ok(None);
                }
                match body.closure {
                    None => return Ok(Some(Home::Heap(ctx))),
                    Some(next) => next,
                }
            }
            Resolved::Gone => return Ok(None),
        };
    }
}

/// `^value` inside a block: return from the block's home method.
fn non_local_return(vm: &mut VM, state: &mut InterpreterState, value: Value) -> Step {
    match find_home(vm, state)? {
        Some(Home::Native(home)) => {
            let sender = state.body_at(&vm.memory, home)?.sender;
            let alive = match state.resolve(sender) {
                Resolved::Native(_) => true,
                Resolved::Heap(ctx) => is_live_context(&vm.memory, ctx),
                Resolved::Gone => sender.is_nil(),
            };
            if !alive {
                return cannot_return(vm, state, value);
            }
            while state.depth() > home + 1 {
                state.pop_activation(&mut vm.memory)?;
            }
            local_return(vm, state, value)
        }
        Some(Home::Heap(home)) => {
            // The home must be on the heap part of this process's chain.
            let mut chain = Vec::new();
            let mut link = state.body_at(&vm.memory, 0)?.sender;
            let found = loop {
                match state.resolve(link) {
                    Resolved::Heap(ctx) if is_live_context(&vm.memory, ctx) && !chain.contains(&ctx) => {
                        chain.push(ctx);
                        if ctx == home {
                            break true;
                        }
                        link = vm.memory.context(ctx)?.sender;
                    }
                    _ => break false,
                }
            };
            if !found {
                return cannot_return(vm, state, value);
            }
            let target_link = vm.memory.context(home)?.sender;
            match state.resolve(target_link) {
                Resolved::Heap(target) if is_live_context(&vm.memory, target) => {
                    state.discard_all(&mut vm.memory)?;
                    for ctx in chain {
                        retire(&mut vm.memory, &mut state.escaped, ctx)?;
                    }
                    Ok(Some(ControlTransfer::NonLocalReturn { value, target }))
                }
                Resolved::Gone if target_link.is_nil() => {
                    for ctx in chain {
                        retire(&mut vm.memory, &mut state.escaped, ctx)?;
                    }
                    return_to_nil(vm, state, value)
                }
                _ => cannot_return(vm, state, value),
            }
        }
        None => cannot_return(vm, state, value),
    }
}

fn ensure_cannot_return_handler(vm: &VM, receiver: Value, value: Value) -> Result<(), RuntimeError> {
    let class = vm.memory.class_of(receiver)?;
    let selector = vm.memory.special.cannot_return;
    match dispatch::resolve(&vm.memory, class, selector)? {
        Target::DoesNotUnderstand => Err(RuntimeError::CannotReturn { value }),
        _ => Ok(()),
    }
}

/// `thisContext cannotReturn: value`. Execution continues after the
/// return bytecode once the handler answers.
fn cannot_return(vm: &mut VM, state: &mut InterpreterState, value: Value) -> Step {
    let ctx = state.materialize_top(&mut vm.memory)?;
    debug!("cannot return {} from {ctx:?}", vm.memory.describe(value));
    ensure_cannot_return_handler(vm, Value::Ref(ctx), value)?;
    let body = state.body_mut(&mut vm.memory)?;
    body.push(Value::Ref(ctx));
    body.push(value);
    let selector = vm.memory.special.cannot_return;
    dispatch::send(vm, state, selector, 1, None, None)?;
    Ok(None)
}

// ── scheduling ─────────────────────────────────────────────────────

/// Deliver due interrupts; a woken process that outranks the active one
/// takes over after the current instruction.
pub(crate) fn check_interrupts(vm: &mut VM, state: &mut InterpreterState) -> Result<(), RuntimeError> {
    if vm.interrupts.needs_check() && vm.interrupts.deliver(&mut vm.memory, &vm.scheduler)? {
        state.request_switch(PendingSwitch::Preempt);
    }
    Ok(())
}

/// Carry out a deferred scheduling decision. Answers the switch, or `None`
/// when the active process keeps running.
fn perform_switch(vm: &mut VM, state: &mut InterpreterState, switch: PendingSwitch) -> Step {
    let memory = &mut vm.memory;
    let scheduler = &vm.scheduler;
    let active = scheduler.active_process(memory)?;

    match switch {
        PendingSwitch::Preempt | PendingSwitch::Yield => {
            let priority = scheduler.priority_of(memory, active)?;
            let switch_now = match scheduler.highest_runnable_priority(memory)? {
                Some(runnable) if switch == PendingSwitch::Preempt => runnable > priority,
                Some(runnable) => runnable >= priority,
                None => false,
            };
            if !switch_now {
                return Ok(None);
            }
            store_active(vm, state, active)?;
            vm.scheduler.sleep(&mut vm.memory, active)?;
        }
        PendingSwitch::Block => store_active(vm, state, active)?,
        PendingSwitch::Terminate => state.discard_all(memory)?,
    }

    let next = match vm.scheduler.wake_highest_priority(&mut vm.memory) {
        Ok(next) => next,
        Err(err) => {
            error!("{err}; active process {active:?}");
            if let Ok(Some(ctx)) = vm.scheduler.suspended_context(&vm.memory, active) {
                for line in stack_trace(&vm.memory, ctx) {
                    error!("  {line}");
                }
            }
            return Err(err);
        }
    };
    let new_context = vm.scheduler.activate(&mut vm.memory, next)?;
    trace!("switch {active:?} -> {next:?} ({switch:?})");
    Ok(Some(ControlTransfer::ProcessSwitch { new_context }))
}

/// Flush the native stack into the active process and clear it.
fn store_active(vm: &mut VM, state: &mut InterpreterState, active: Oop) -> Result<(), RuntimeError> {
    if let Some(ctx) = state.flush(&mut vm.memory)? {
        vm.scheduler.store_context(&mut vm.memory, active, ctx)?;
    }
    state.abandon();
    Ok(())
}

// ── instance variables ─────────────────────────────────────────────

/// Named or indexed field `index` of `receiver`, with contexts and
/// closures showing their Smalltalk layout.
pub fn inst_var_at(
    memory: &mut ObjectMemory,
    state: &mut InterpreterState,
    receiver: Value,
    index: usize,
) -> Result<Value, RuntimeError> {
    let oop = expect_oop(receiver)?;
    let nil = memory.nil();
    let out_of_bounds = |size| RuntimeError::Memory(MemoryError::IndexOutOfBounds { oop, index, size });

    // Links may name native activations, which have to escape first.
    let is_sender = index == CTX_SENDER && matches!(memory.body(oop)?, Body::Context(_));
    if is_sender {
        return Ok(state.sender_of(memory, oop)?.map(Value::Ref).unwrap_or(nil));
    }
    let outer = match memory.body(oop)? {
        Body::Closure(body) if index == CLOSURE_OUTER => Some(body.outer),
        _ => None,
    };
    if let Some(outer) = outer {
        return Ok(state.context_of(memory, outer)?.map(Value::Ref).unwrap_or(nil));
    }

    match memory.body(oop)? {
        Body::Context(body) => {
            let size = CTX_STACK + body.stack.len();
            let value = match index {
                CTX_PC => {
                    let base = memory.code(body.code)?.base;
                    body.pc.map(|pc| Value::Int((base + pc) as i64)).unwrap_or(nil)
                }
                CTX_STACKP => Value::Int(body.stack.len() as i64),
                CTX_METHOD => Value::Ref(body.method),
                CTX_CLOSURE => body.closure.map(Value::Ref).unwrap_or(nil),
                CTX_RECEIVER => body.receiver,
                i if i >= CTX_STACK && i < size => body.stack[i - CTX_STACK],
                _ => return Err(out_of_bounds(size)),
            };
            Ok(value)
        }
        Body::Closure(body) => {
            let size = CLOSURE_COPIED + body.copied.len();
            match index {
                CLOSURE_START_PC => Ok(Value::Int(body.start_pc as i64)),
                CLOSURE_NUM_ARGS => Ok(Value::Int(body.num_args as i64)),
                i if i >= CLOSURE_COPIED && i < size => Ok(body.copied[i - CLOSURE_COPIED]),
                _ => Err(out_of_bounds(size)),
            }
        }
        _ => Ok(memory.fetch(oop, index)?),
    }
}

pub fn inst_var_put(
    memory: &mut ObjectMemory,
    state: &mut InterpreterState,
    receiver: Value,
    index: usize,
    value: Value,
) -> Result<(), RuntimeError> {
    let oop = expect_oop(receiver)?;
    let nil = memory.nil();
    let wrong = RuntimeError::TypeError {
        expected: "a writable field",
        got: Value::Int(index as i64),
    };
    let (is_context, is_closure) = match memory.body(oop)? {
        Body::Context(_) => (true, false),
        Body::Closure(_) => (false, true),
        _ => (false, false),
    };
    if (is_context || is_closure) && memory.header(oop)?.is_immutable() {
        return Err(RuntimeError::Memory(MemoryError::Immutable(oop)));
    }

    if is_context && index == CTX_SENDER {
        let sender = if value == nil {
            ContextLink::Nil
        } else {
            let ctx = expect_oop(value)?;
            memory.context(ctx)?;
            ContextLink::Context(ctx)
        };
        // A native activation redirected this way returns through the
        // heap from now on.
        if let Resolved::Native(i) = state.resolve(ContextLink::Context(oop)) {
            state.materialize(memory, i)?;
        }
        memory.context_mut(oop)?.sender = sender;
        return Ok(());
    }

    if is_context {
        let base = {
            let code = memory.context(oop)?.code;
            memory.code(code)?.base
        };
        let body = memory.context_mut(oop)?;
        match (index, value) {
            (CTX_PC, v) if v == nil => body.pc = None,
            (CTX_PC, Value::Int(pc)) if pc >= 0 && pc as usize >= base => body.pc = Some(pc as usize - base),
            (CTX_STACKP, Value::Int(sp)) if sp >= 0 => body.stack.resize(sp as usize, nil),
            (CTX_RECEIVER, v) => body.receiver = v,
            (i, v) if i >= CTX_STACK && i - CTX_STACK < body.stack.len() => body.stack[i - CTX_STACK] = v,
            _ => return Err(wrong),
        }
        return Ok(());
    }

    if is_closure {
        let body = memory.closure_mut(oop)?;
        return match index.checked_sub(CLOSURE_COPIED).and_then(|i| body.copied.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(wrong),
        };
    }

    Ok(memory.store(oop, index, value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special::{install, method_context};
    use crate::{VM, VmConfig};
    use bytecode::BytecodeBuilder;
    use object::InstanceFormat;

    fn vm() -> VM {
        VM::new(VmConfig::quiet()).unwrap()
    }

    fn header(num_args: u8, num_temps: u8) -> MethodHeader {
        MethodHeader {
            num_args,
            num_temps,
            ..MethodHeader::default()
        }
    }

    /// Run `bytes` as a doit with `receiver`.
    fn eval(vm: &mut VM, receiver: Value, literals: Vec<Value>, temps: u8, bytes: Vec<u8>) -> Result<Value, RuntimeError> {
        let method = vm.memory.new_method(header(0, temps), literals, bytes);
        let ctx = method_context(&mut vm.memory, method, receiver, &[])?;
        run_top_level(vm, ctx)
    }

    // ── straight-line code ─────────────────────────────────────────

    #[test]
    fn if_nil_sequence_answers_a_class() {
        let mut vm = vm();
        // (1 ifNil: [true]) class
        let bytes = vec![0x76, 0x88, 0x73, 0xC6, 0x99, 0x87, 0x71, 0xC7, 0x7C];
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, Vec::new(), 0, bytes).unwrap();
        assert_eq!(result, Value::Ref(vm.memory.special.small_integer));
    }

    #[test]
    fn temporaries_and_arrays() {
        let mut vm = vm();
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(3));
        b.store_temporary(0, true);
        b.push_temporary(0);
        b.push_constant(Constant::Int(4));
        b.special_send(8); // *
        b.push_constant(Constant::Nil);
        b.push_new_array(2, true);
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, Vec::new(), 1, b.into_bytes()).unwrap();
        let array = result.as_oop().unwrap();
        assert_eq!(vm.memory.fetch(array, 0).unwrap(), Value::Int(12));
        assert!(vm.memory.is_nil(vm.memory.fetch(array, 1).unwrap()));
    }

    #[test]
    fn backward_jump_loops() {
        let mut vm = vm();
        // t := 0. [t < 10] whileTrue: [t := t + 1]. ^t
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(0));
        b.store_temporary(0, true);
        let top = b.current_offset();
        b.push_temporary(0);
        b.push_literal_constant(0);
        b.special_send(2); // <
        let exit = b.jump_if_false();
        b.push_temporary(0);
        b.push_constant(Constant::Int(1));
        b.special_send(0); // +
        b.store_temporary(0, true);
        b.jump_back(top);
        b.bind(exit);
        b.push_temporary(0);
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, vec![Value::Int(10)], 1, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(10));
    }

    #[test]
    fn small_integer_overflow_promotes() {
        let mut vm = vm();
        let mut b = BytecodeBuilder::new();
        b.push_literal_constant(0);
        b.push_constant(Constant::Int(1));
        b.special_send(0);
        b.return_top();
        let nil = vm.memory.nil();
        let max = Value::Int(object::SMALL_INT_MAX);
        let result = eval(&mut vm, nil, vec![max], 0, b.into_bytes()).unwrap();
        assert_eq!(vm.memory.class_of(result).unwrap(), vm.memory.special.large_positive_integer);
        let n = vm.memory.integer_value(result).unwrap();
        assert_eq!(n, num_bigint::BigInt::from(object::SMALL_INT_MAX) + 1);
    }

    #[test]
    fn unknown_bytecode_is_fatal() {
        let mut vm = vm();
        let nil = vm.memory.nil();
        let err = eval(&mut vm, nil, Vec::new(), 0, vec![0x7E]).unwrap_err();
        assert_eq!(err, RuntimeError::UnknownBytecode { byte: 0x7E, pc: 0 });
    }

    #[test]
    fn running_off_the_end_is_fatal() {
        let mut vm = vm();
        let nil = vm.memory.nil();
        let err = eval(&mut vm, nil, Vec::new(), 0, vec![0x76, 0x87]).unwrap_err();
        assert_eq!(err, RuntimeError::PcOutOfRange { pc: 2 });
    }

    // ── sends ──────────────────────────────────────────────────────

    #[test]
    fn sends_activate_methods_with_arguments() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        let mut b = BytecodeBuilder::new();
        b.push_temporary(0);
        b.push_temporary(1);
        b.special_send(1); // -
        b.return_top();
        install(&mut vm.memory, object, "minus:from:", header(2, 2), Vec::new(), b.into_bytes()).unwrap();

        let selector = vm.memory.intern("minus:from:");
        let mut b = BytecodeBuilder::new();
        b.push_receiver();
        b.push_constant(Constant::Int(7));
        b.push_constant(Constant::Int(2));
        b.send(0, 2);
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, vec![Value::Ref(selector)], 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn super_sends_start_above_the_holder() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        let a = vm.memory.new_class("A", Some(object), InstanceFormat::Fixed, 0).unwrap();
        let b_class = vm.memory.new_class("B", Some(a), InstanceFormat::Fixed, 0).unwrap();
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(1));
        b.return_top();
        install(&mut vm.memory, a, "value", header(0, 0), Vec::new(), b.into_bytes()).unwrap();

        let selector = vm.memory.intern("value");
        let mut b = BytecodeBuilder::new();
        b.push_receiver();
        b.super_send(0, 0);
        b.push_constant(Constant::Int(1));
        b.special_send(0);
        b.return_top();
        install(&mut vm.memory, b_class, "value", header(0, 0), vec![Value::Ref(selector)], b.into_bytes()).unwrap();

        let instance = vm.memory.instantiate(b_class, 0).unwrap();
        let mut b = BytecodeBuilder::new();
        b.push_receiver();
        b.send(0, 0);
        b.return_top();
        let result = eval(&mut vm, Value::Ref(instance), vec![Value::Ref(selector)], 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(2));
    }

    #[test]
    fn non_boolean_condition_sends_must_be_boolean() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(42));
        b.return_top();
        install(&mut vm.memory, object, "mustBeBoolean", header(0, 0), Vec::new(), b.into_bytes()).unwrap();

        // 3 ifTrue: [...] leaves the handler's answer on the stack.
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(3));
        let skip = b.jump_if_false();
        b.bind(skip);
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, Vec::new(), 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    // ── closures and returns ───────────────────────────────────────

    /// `[:x | x + k] value: 5` with `k` copied in.
    #[test]
    fn closures_copy_values_and_take_arguments() {
        let mut vm = vm();
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(10));
        let block = b.push_closure(1, 1);
        b.push_temporary(0);
        b.push_temporary(1);
        b.special_send(0);
        b.block_return();
        b.end_closure(block);
        b.push_constant(Constant::Int(5));
        b.special_send(26); // value:
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, Vec::new(), 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn block_code_is_shared_between_closures() {
        let mut vm = vm();
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        let block = b.push_closure(0, 0);
        b.push_constant(Constant::Nil);
        b.block_return();
        b.end_closure(block);
        b.store_temporary(0, true);
        b.push_temporary(1);
        b.push_constant(Constant::Nil);
        b.special_send(22);
        let done = b.jump_if_false();
        b.push_temporary(0);
        b.store_temporary(1, true);
        b.jump_back(top);
        b.bind(done);
        b.push_temporary(0);
        b.push_temporary(1);
        b.push_new_array(2, true);
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, Vec::new(), 2, b.into_bytes()).unwrap();
        let pair = result.as_oop().unwrap();
        let first = vm.memory.fetch(pair, 0).unwrap().as_oop().unwrap();
        let second = vm.memory.fetch(pair, 1).unwrap().as_oop().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            vm.memory.closure(first).unwrap().code,
            vm.memory.closure(second).unwrap().code
        );
    }

    /// detect: style early exit: `#(1 2 3) do: [:x | x = 2 ifTrue: [^x * 10]]. ^0`
    /// with `do:` written as a method that evaluates the block per element.
    #[test]
    fn non_local_return_unwinds_to_the_home_sender() {
        let mut vm = vm();
        let array_class = vm.memory.special.array;

        // Array>>each: aBlock  1 to: self size do: [:i | aBlock value: (self at: i)]
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(1));
        b.store_temporary(1, true);
        let top = b.current_offset();
        b.push_temporary(1);
        b.push_receiver();
        b.special_send(18); // size
        b.special_send(4); // <=
        let exit = b.jump_if_false();
        b.push_temporary(0);
        b.push_receiver();
        b.push_temporary(1);
        b.special_send(16); // at:
        b.special_send(26); // value:
        b.pop();
        b.push_temporary(1);
        b.push_constant(Constant::Int(1));
        b.special_send(0);
        b.store_temporary(1, true);
        b.jump_back(top);
        b.bind(exit);
        b.return_receiver();
        install(&mut vm.memory, array_class, "each:", header(1, 2), Vec::new(), b.into_bytes()).unwrap();

        let each = vm.memory.intern("each:");
        let array = vm.memory.new_array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let mut b = BytecodeBuilder::new();
        b.push_literal_constant(1);
        let block = b.push_closure(0, 1);
        b.push_temporary(0);
        b.push_constant(Constant::Int(2));
        b.special_send(6); // =
        let skip = b.jump_if_false();
        b.push_temporary(0);
        b.push_constant(Constant::Int(10));
        b.special_send(8);
        b.return_top();
        b.bind(skip);
        b.push_constant(Constant::Nil);
        b.block_return();
        b.end_closure(block);
        b.send(0, 1);
        b.pop();
        b.push_constant(Constant::Int(0));
        b.return_top();
        let nil = vm.memory.nil();
        let literals = vec![Value::Ref(each), Value::Ref(array)];
        let result = eval(&mut vm, nil, literals, 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(20));
    }

    /// A block that outlives its home method and then tries `^`.
    #[test]
    fn returning_from_a_dead_home_sends_cannot_return() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        let ctx_class = vm.memory.special.method_context;

        // Object>>makeBlock  ^[^7]
        let mut b = BytecodeBuilder::new();
        let block = b.push_closure(0, 0);
        b.push_constant(Constant::Int(7));
        b.return_top();
        b.block_return();
        b.end_closure(block);
        b.return_top();
        install(&mut vm.memory, object, "makeBlock", header(0, 0), Vec::new(), b.into_bytes()).unwrap();

        // MethodContext>>cannotReturn: v  ^v + 100
        let mut b = BytecodeBuilder::new();
        b.push_temporary(0);
        b.push_constant(Constant::Int(100));
        b.special_send(0);
        b.return_top();
        install(&mut vm.memory, ctx_class, "cannotReturn:", header(1, 1), Vec::new(), b.into_bytes()).unwrap();

        let make = vm.memory.intern("makeBlock");
        let mut b = BytecodeBuilder::new();
        b.push_receiver();
        b.send(0, 0);
        b.special_send(25); // value
        b.return_top();
        let nil = vm.memory.nil();
        let result = eval(&mut vm, nil, vec![Value::Ref(make)], 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Int(107));
    }

    #[test]
    fn cannot_return_without_handler_is_fatal() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        let mut b = BytecodeBuilder::new();
        let block = b.push_closure(0, 0);
        b.push_constant(Constant::Int(7));
        b.return_top();
        b.end_closure(block);
        b.return_top();
        install(&mut vm.memory, object, "makeBlock", header(0, 0), Vec::new(), b.into_bytes()).unwrap();

        let make = vm.memory.intern("makeBlock");
        let mut b = BytecodeBuilder::new();
        b.push_receiver();
        b.send(0, 0);
        b.special_send(25);
        b.return_top();
        let nil = vm.memory.nil();
        let err = eval(&mut vm, nil, vec![Value::Ref(make)], 0, b.into_bytes()).unwrap_err();
        assert_eq!(err, RuntimeError::CannotReturn { value: Value::Int(7) });
    }

    // ── contexts ───────────────────────────────────────────────────

    #[test]
    fn this_context_sees_its_sender() {
        let mut vm = vm();
        let object = vm.memory.special.object;
        // Object>>callerReceiver  ^thisContext sender receiver, via instVarAt:
        let mut b = BytecodeBuilder::new();
        b.push_active_context();
        b.push_constant(Constant::Int(1));
        b.send(0, 1);
        b.push_constant(Constant::Int(6));
        b.send(0, 1);
        b.return_top();
        let inst_var_at = vm.memory.intern("instVarAt:");
        install(
            &mut vm.memory,
            object,
            "callerReceiver",
            header(0, 0),
            vec![Value::Ref(inst_var_at)],
            b.into_bytes(),
        )
        .unwrap();

        let selector = vm.memory.intern("callerReceiver");
        let mut b = BytecodeBuilder::new();
        b.push_constant(Constant::Int(3));
        b.send(0, 0);
        b.return_top();
        let receiver = vm.memory.new_array(Vec::new());
        let result = eval(&mut vm, Value::Ref(receiver), vec![Value::Ref(selector)], 0, b.into_bytes()).unwrap();
        assert_eq!(result, Value::Ref(receiver));
    }

    #[test]
    fn returned_context_resumes_into_cannot_return() {
        let mut vm = vm();
        let nil = vm.memory.nil();
        let method = vm.memory.new_method(header(0, 0), Vec::new(), vec![0x78]);
        let ctx = method_context(&mut vm.memory, method, nil, &[]).unwrap();
        vm.memory.context_mut(ctx).unwrap().pc = None;
        let err = run_top_level(&mut vm, ctx).unwrap_err();
        assert_eq!(err, RuntimeError::CannotReturn { value: nil });
    }
}
