pub mod config;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod interrupt;
pub mod primitives;
pub mod scheduler;
pub mod signal;
pub mod special;

use log::debug;
use object::{GcStats, ObjectMemory, Oop, RootProvider, Value};

pub use config::VmConfig;
pub use error::{PrimitiveError, RuntimeError};
pub use frame::InterpreterState;
pub use interpreter::run_top_level;
pub use signal::ControlTransfer;

use dispatch::InlineCaches;
use interrupt::InterruptController;
use primitives::PrimitiveDesc;
use scheduler::Scheduler;

/// A bootstrapped virtual machine: the object memory plus everything the
/// interpreter keeps beside it.
pub struct VM {
    pub memory: ObjectMemory,
    pub config: VmConfig,
    /// Primitive descriptors indexed by primitive number.
    pub primitives: Vec<Option<PrimitiveDesc>>,
    pub caches: InlineCaches,
    pub scheduler: Scheduler,
    pub interrupts: InterruptController,
}

impl VM {
    pub fn new(config: VmConfig) -> Result<Self, RuntimeError> {
        special::bootstrap(config)
    }

    /// Run `context` to completion in the active process.
    pub fn run(&mut self, context: Oop) -> Result<Value, RuntimeError> {
        run_top_level(self, context)
    }

    /// Split off the object memory from the rest of the roots, for memory
    /// operations that rewrite references.
    pub(crate) fn split_roots<'a>(
        &'a mut self,
        state: &'a mut InterpreterState,
    ) -> (&'a mut ObjectMemory, VmRoots<'a>) {
        let roots = VmRoots {
            state,
            caches: &mut self.caches,
            scheduler: &mut self.scheduler,
            interrupts: &mut self.interrupts,
            extra: Vec::new(),
        };
        (&mut self.memory, roots)
    }

    /// Full collection with the interpreter state and `extra` as additional
    /// roots. Contexts that died are dropped from the escape table and
    /// cleared weak slots are reported to the finalization semaphore.
    pub fn collect_garbage(&mut self, state: &mut InterpreterState, extra: &[Value]) -> GcStats {
        let (memory, mut roots) = self.split_roots(state);
        roots.extra.extend_from_slice(extra);
        let stats = memory.collect_garbage(&mut roots);
        state.escaped.retain_live(&self.memory);
        if stats.cleared_weak > 0 {
            self.interrupts.note_finalization();
        }
        debug!(
            "gc: {} live, {} freed, {} weak slots cleared",
            stats.live, stats.freed, stats.cleared_weak
        );
        stats
    }
}

/// Everything outside the object memory that holds references.
pub(crate) struct VmRoots<'a> {
    state: &'a mut InterpreterState,
    caches: &'a mut InlineCaches,
    scheduler: &'a mut Scheduler,
    interrupts: &'a mut InterruptController,
    extra: Vec<Value>,
}

impl RootProvider for VmRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.state.visit_roots(visitor);
        self.caches.visit_roots(visitor);
        object::visit_oop(&mut self.scheduler.object, visitor);
        self.interrupts.visit_roots(visitor);
        self.extra.visit_roots(visitor);
    }
}
