use object::{Oop, Value};

/// A transfer of control that leaves the native stack.
///
/// The interpreter loop hands one of these back whenever execution must
/// continue in a context that is not on the native stack; `run_top_level`
/// turns it into the next native stack, or into the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTransfer {
    /// The bottom activation returned to its heap sender.
    LocalReturn { value: Value, target: Oop },
    /// A block returned from its home method, whose sender lives in the
    /// heap.
    NonLocalReturn { value: Value, target: Oop },
    /// An activation's sender was rewritten so it no longer is the native
    /// caller; the native stack has been flushed to the heap.
    NonVirtualReturn { value: Value, target: Oop },
    ProcessSwitch { new_context: Oop },
    TopLevelReturn { value: Value },
}

impl ControlTransfer {
    /// Context to continue in and the value to push onto it, if any.
    pub fn resumption(self) -> Option<(Oop, Option<Value>)> {
        match self {
            ControlTransfer::LocalReturn { value, target }
            | ControlTransfer::NonLocalReturn { value, target }
            | ControlTransfer::NonVirtualReturn { value, target } => Some((target, Some(value))),
            ControlTransfer::ProcessSwitch { new_context } => Some((new_context, None)),
            ControlTransfer::TopLevelReturn { .. } => None,
        }
    }
}

/// Scheduling work deferred to the end of the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSwitch {
    /// A process that may outrank the active one became runnable.
    Preempt,
    /// The active process is waiting or suspended.
    Block,
    Yield,
    /// The active process is gone; its contexts are discarded.
    Terminate,
}
