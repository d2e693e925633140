use object::{MemoryError, Oop, Value};
use thiserror::Error;

/// Errors that stop the interpreter.
///
/// Lookup misses, primitive failures and unreachable return targets are
/// recovered inside the VM (`doesNotUnderstand:`, the fallback method body,
/// `cannotReturn:`); they only surface here when the recovery itself has
/// nowhere to go.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("{receiver:?} does not understand {selector:?}")]
    MessageNotUnderstood { receiver: Value, selector: Oop },
    #[error("stack overflow")]
    StackOverflow,
    #[error("type error: expected {expected}, got {got:?}")]
    TypeError { expected: &'static str, got: Value },
    #[error("unimplemented: {message}")]
    Unimplemented { message: &'static str },
    #[error("cannot return {value:?}: no cannotReturn: handler")]
    CannotReturn { value: Value },
    #[error("no runnable process")]
    SchedulerExhausted,
    #[error("unknown bytecode {byte:#04x} at {pc}")]
    UnknownBytecode { byte: u8, pc: usize },
    #[error("pc {pc} outside of code")]
    PcOutOfRange { pc: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Outcome of a primitive that did not answer a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Run the method body instead.
    Failed,
    Fatal(RuntimeError),
}

impl From<RuntimeError> for PrimitiveError {
    fn from(err: RuntimeError) -> Self {
        PrimitiveError::Fatal(err)
    }
}

/// Bad handles, wrong object kinds and out-of-range indices make a
/// primitive fail rather than stop the VM.
impl From<MemoryError> for PrimitiveError {
    fn from(_: MemoryError) -> Self {
        PrimitiveError::Failed
    }
}
