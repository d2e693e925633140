//! Bootstrap of a runnable VM: object memory with the kernel classes, the
//! scheduler and its first process, the external objects array and the
//! primitive methods of the kernel classes.

use bytecode::BytecodeBuilder;
use log::debug;
use object::{Body, ContextBody, ContextLink, MemoryError, MethodHeader, ObjectMemory, Oop, Value};

use crate::config::VmConfig;
use crate::dispatch::{InlineCaches, selector_arity};
use crate::error::RuntimeError;
use crate::interrupt::InterruptController;
use crate::primitives::{self, integer::IntOp};
use crate::scheduler::Scheduler;
use crate::VM;

/// Slots in the external objects array.
pub const EXTERNAL_OBJECTS: usize = 32;

/// Selectors of SmallInteger primitives 1-17; the large integer ones are
/// the same selectors at 21-37.
const INTEGER_SELECTORS: [&str; 17] = [
    "+", "-", "<", ">", "<=", ">=", "=", "~=", "*", "/", "\\\\", "//", "quo:", "bitAnd:", "bitOr:", "bitXor:",
    "bitShift:",
];

const OBJECT_PRIMITIVES: &[(&str, u16)] = &[
    ("at:", 60),
    ("at:put:", 61),
    ("basicAt:", 60),
    ("basicAt:put:", 61),
    ("size", 62),
    ("basicSize", 62),
    ("instVarAt:", 73),
    ("instVarAt:put:", 74),
    ("identityHash", 75),
    ("perform:", 83),
    ("perform:with:", 83),
    ("perform:with:with:", 83),
    ("perform:with:with:with:", 83),
    ("perform:withArguments:", 84),
    ("==", 110),
    ("class", 111),
    ("shallowCopy", 148),
    ("~~", 169),
    // System services, reachable from any receiver.
    ("garbageCollect", 130),
    ("interruptSemaphore:", 134),
    ("millisecondClock", 135),
    ("signal:atMilliseconds:", 136),
];

const BEHAVIOR_PRIMITIVES: &[(&str, u16)] = &[("basicNew", 70), ("new", 70), ("basicNew:", 71), ("new:", 71)];

const ARRAY_PRIMITIVES: &[(&str, u16)] = &[
    ("elementsForwardIdentityTo:", 72),
    ("elementsExchangeIdentityWith:", 128),
    ("elementsForwardIdentityTo:copyHash:", 248),
];

const CLOSURE_PRIMITIVES: &[(&str, u16)] = &[
    ("value", 201),
    ("value:", 202),
    ("value:value:", 203),
    ("value:value:value:", 204),
    ("value:value:value:value:", 205),
    ("valueWithArguments:", 206),
];

const SEMAPHORE_PRIMITIVES: &[(&str, u16)] = &[("signal", 85), ("wait", 86)];

const PROCESS_PRIMITIVES: &[(&str, u16)] = &[("resume", 87), ("suspend", 88)];

const SCHEDULER_PRIMITIVES: &[(&str, u16)] = &[("yield", 167)];

/// Build a VM for `config`.
pub fn bootstrap(config: VmConfig) -> Result<VM, RuntimeError> {
    config.validate().map_err(RuntimeError::InvalidConfig)?;
    let mut memory = ObjectMemory::new();
    let scheduler = Scheduler::create(&mut memory, config.priorities, config.bootstrap_priority)?;
    let nil = memory.nil();
    let external_objects = memory.new_array(vec![nil; EXTERNAL_OBJECTS]);
    let interval = config.ticker.then_some(config.interrupt_interval);
    let interrupts = InterruptController::new(external_objects, interval);
    install_kernel(&mut memory)?;
    debug!(
        "bootstrapped {} objects, {} priorities, ticker: {}",
        memory.live_count(),
        config.priorities,
        interrupts.has_ticker()
    );
    Ok(VM {
        memory,
        config,
        primitives: primitives::table(),
        caches: InlineCaches::new(config.inline_cache_size),
        scheduler,
        interrupts,
    })
}

/// Install the primitive methods of the kernel classes.
pub fn install_kernel(memory: &mut ObjectMemory) -> Result<(), MemoryError> {
    let special = &memory.special;
    let groups = [
        (special.object, OBJECT_PRIMITIVES),
        (special.class, BEHAVIOR_PRIMITIVES),
        (special.array, ARRAY_PRIMITIVES),
        (special.block_closure, CLOSURE_PRIMITIVES),
        (special.semaphore, SEMAPHORE_PRIMITIVES),
        (special.process, PROCESS_PRIMITIVES),
        (special.process_scheduler, SCHEDULER_PRIMITIVES),
    ];
    for (class, prims) in groups {
        for &(selector, index) in prims {
            install_primitive(memory, class, selector, index)?;
        }
    }

    let (small, large) = (memory.special.small_integer, memory.special.large_positive_integer);
    for (i, selector) in INTEGER_SELECTORS.iter().enumerate() {
        let index = i as u16 + 1;
        debug_assert!(IntOp::from_primitive(index).is_some());
        install_primitive(memory, small, selector, index)?;
        install_primitive(memory, large, selector, index + 20)?;
    }
    Ok(())
}

/// Compile `bytes` as `class>>selector` and install it.
pub fn install(
    memory: &mut ObjectMemory,
    class: Oop,
    selector: &str,
    header: MethodHeader,
    literals: Vec<Value>,
    bytes: Vec<u8>,
) -> Result<Oop, MemoryError> {
    let header = MethodHeader {
        num_literals: literals.len() as u16,
        ..header
    };
    let method = memory.new_method(header, literals, bytes);
    let selector = memory.intern(selector);
    memory.install_method(class, selector, Value::Ref(method))?;
    Ok(method)
}

/// `class>>selector` backed by primitive `index`. When the primitive
/// fails the method answers `self primitiveFailed: #selector`.
pub fn install_primitive(memory: &mut ObjectMemory, class: Oop, selector: &str, index: u16) -> Result<Oop, MemoryError> {
    let arity = selector_arity(selector) as u8;
    let mut b = BytecodeBuilder::new();
    b.call_primitive(index);
    b.push_receiver();
    b.push_literal_constant(1);
    b.send(0, 1);
    b.return_top();
    let literals = vec![
        Value::Ref(memory.intern("primitiveFailed:")),
        Value::Ref(memory.intern(selector)),
    ];
    let header = MethodHeader {
        num_args: arity,
        num_temps: arity,
        has_primitive: true,
        ..MethodHeader::default()
    };
    install(memory, class, selector, header, literals, b.into_bytes())
}

/// A fresh heap context that runs `method` from its first bytecode.
pub fn method_context(memory: &mut ObjectMemory, method: Oop, receiver: Value, args: &[Value]) -> Result<Oop, MemoryError> {
    memory.code(method)?;
    let class = memory.special.method_context;
    Ok(memory.alloc(
        class,
        Body::Context(ContextBody {
            sender: ContextLink::Nil,
            pc: Some(0),
            stack: args.to_vec(),
            code: method,
            method,
            closure: None,
            receiver,
            process: None,
        }),
    ))
}

/// A process at `priority` that will run `method` on `receiver`, made
/// runnable. Answers the process.
pub fn spawn(vm: &mut VM, method: Oop, receiver: Value, priority: usize) -> Result<Oop, RuntimeError> {
    let ctx = method_context(&mut vm.memory, method, receiver, &[])?;
    let process = vm.scheduler.new_process(&mut vm.memory, priority, Value::Ref(ctx))?;
    vm.memory.context_mut(ctx)?.process = Some(process);
    vm.scheduler.sleep(&mut vm.memory, process)?;
    Ok(process)
}

/// A semaphore with no waiters and no excess signals.
pub fn new_semaphore(memory: &mut ObjectMemory) -> Result<Oop, MemoryError> {
    let class = memory.special.semaphore;
    let semaphore = memory.instantiate(class, 0)?;
    memory.store(semaphore, crate::scheduler::EXCESS_SIGNALS, Value::Int(0))?;
    Ok(semaphore)
}

/// Register `semaphore` at 1-based `index` of the external objects array.
pub fn register_external(vm: &mut VM, index: usize, semaphore: Oop) -> Result<(), MemoryError> {
    let array = vm.interrupts.external_objects();
    let slot = index.checked_sub(1).ok_or(MemoryError::IndexOutOfBounds {
        oop: array,
        index,
        size: EXTERNAL_OBJECTS,
    })?;
    vm.memory.store(array, slot, Value::Ref(semaphore))
}
