//! Process scheduler and semaphores.
//!
//! All scheduler state lives in ordinary heap objects laid out like
//! Squeak's: a `ProcessScheduler` holding one `LinkedList` per priority and
//! the active process, `Process`es chained through their `nextLink`, and
//! `Semaphore`s that are linked lists with an excess-signal counter.
//! Nothing here switches the native stack; operations only report whether
//! the interpreter has to (see [`PendingSwitch`](crate::signal::PendingSwitch)).

use log::{debug, trace, warn};
use object::{MemoryError, ObjectMemory, Oop, Value};

use crate::error::RuntimeError;

// Process
pub const NEXT_LINK: usize = 0;
pub const SUSPENDED_CONTEXT: usize = 1;
pub const PRIORITY: usize = 2;
pub const MY_LIST: usize = 3;

// LinkedList / Semaphore
pub const FIRST_LINK: usize = 0;
pub const LAST_LINK: usize = 1;
pub const EXCESS_SIGNALS: usize = 2;

// ProcessScheduler
pub const PROCESS_LISTS: usize = 0;
pub const ACTIVE_PROCESS: usize = 1;

pub struct Scheduler {
    pub(crate) object: Oop,
    priorities: usize,
}

impl Scheduler {
    /// A scheduler with empty run queues and a running process at
    /// `active_priority`.
    pub fn create(memory: &mut ObjectMemory, priorities: usize, active_priority: usize) -> Result<Self, MemoryError> {
        let list_class = memory.special.linked_list;
        let mut lists = Vec::with_capacity(priorities);
        for _ in 0..priorities {
            lists.push(Value::Ref(memory.instantiate(list_class, 0)?));
        }
        let lists = memory.new_array(lists);
        let class = memory.special.process_scheduler;
        let object = memory.instantiate(class, 0)?;
        memory.store(object, PROCESS_LISTS, Value::Ref(lists))?;

        let scheduler = Self { object, priorities };
        let nil = memory.nil();
        let main = scheduler.new_process(memory, active_priority, nil)?;
        memory.store(object, ACTIVE_PROCESS, Value::Ref(main))?;
        Ok(scheduler)
    }

    pub fn object(&self) -> Oop {
        self.object
    }

    pub fn priorities(&self) -> usize {
        self.priorities
    }

    /// A process at `priority` whose suspended context is `context`. It is
    /// not put on any list.
    pub fn new_process(&self, memory: &mut ObjectMemory, priority: usize, context: Value) -> Result<Oop, MemoryError> {
        let class = memory.special.process;
        let process = memory.instantiate(class, 0)?;
        let priority = priority.clamp(1, self.priorities);
        memory.store(process, SUSPENDED_CONTEXT, context)?;
        memory.store(process, PRIORITY, Value::Int(priority as i64))?;
        Ok(process)
    }

    // ── accessors ──────────────────────────────────────────────────

    pub fn active_process(&self, memory: &ObjectMemory) -> Result<Oop, MemoryError> {
        expect_ref(memory.fetch(self.object, ACTIVE_PROCESS)?)
    }

    pub(crate) fn set_active_process(&self, memory: &mut ObjectMemory, process: Oop) -> Result<(), MemoryError> {
        memory.store(self.object, ACTIVE_PROCESS, Value::Ref(process))
    }

    pub fn priority_of(&self, memory: &ObjectMemory, process: Oop) -> Result<usize, MemoryError> {
        match memory.fetch(process, PRIORITY)? {
            Value::Int(p) if p >= 1 => Ok((p as usize).min(self.priorities)),
            other => Err(MemoryError::NotAReference(other)),
        }
    }

    pub fn suspended_context(&self, memory: &ObjectMemory, process: Oop) -> Result<Option<Oop>, MemoryError> {
        optional_ref(memory, memory.fetch(process, SUSPENDED_CONTEXT)?)
    }

    pub fn run_list(&self, memory: &ObjectMemory, priority: usize) -> Result<Oop, MemoryError> {
        let lists = expect_ref(memory.fetch(self.object, PROCESS_LISTS)?)?;
        expect_ref(memory.fetch(lists, priority.clamp(1, self.priorities) - 1)?)
    }

    pub fn excess_signals(&self, memory: &ObjectMemory, semaphore: Oop) -> Result<i64, MemoryError> {
        match memory.fetch(semaphore, EXCESS_SIGNALS)? {
            Value::Int(n) => Ok(n),
            _ => Ok(0),
        }
    }

    // ── linked lists ───────────────────────────────────────────────

    pub fn is_empty_list(&self, memory: &ObjectMemory, list: Oop) -> Result<bool, MemoryError> {
        Ok(memory.is_nil(memory.fetch(list, FIRST_LINK)?))
    }

    pub fn add_last(&self, memory: &mut ObjectMemory, list: Oop, process: Oop) -> Result<(), MemoryError> {
        let nil = memory.nil();
        memory.store(process, NEXT_LINK, nil)?;
        match optional_ref(memory, memory.fetch(list, LAST_LINK)?)? {
            Some(last) => memory.store(last, NEXT_LINK, Value::Ref(process))?,
            None => memory.store(list, FIRST_LINK, Value::Ref(process))?,
        }
        memory.store(list, LAST_LINK, Value::Ref(process))?;
        memory.store(process, MY_LIST, Value::Ref(list))
    }

    pub fn remove_first(&self, memory: &mut ObjectMemory, list: Oop) -> Result<Option<Oop>, MemoryError> {
        let Some(first) = optional_ref(memory, memory.fetch(list, FIRST_LINK)?)? else {
            return Ok(None);
        };
        self.remove(memory, list, first)?;
        Ok(Some(first))
    }

    /// Unlink `process` from `list` wherever it sits. Answers whether it
    /// was found.
    pub fn remove(&self, memory: &mut ObjectMemory, list: Oop, process: Oop) -> Result<bool, MemoryError> {
        let nil = memory.nil();
        let mut previous: Option<Oop> = None;
        let mut current = optional_ref(memory, memory.fetch(list, FIRST_LINK)?)?;
        while let Some(link) = current {
            let next = memory.fetch(link, NEXT_LINK)?;
            if link == process {
                match previous {
                    Some(prev) => memory.store(prev, NEXT_LINK, next)?,
                    None => memory.store(list, FIRST_LINK, next)?,
                }
                if memory.fetch(list, LAST_LINK)? == Value::Ref(process) {
                    let last = previous.map(Value::Ref).unwrap_or(nil);
                    memory.store(list, LAST_LINK, last)?;
                }
                memory.store(process, NEXT_LINK, nil)?;
                memory.store(process, MY_LIST, nil)?;
                return Ok(true);
            }
            previous = Some(link);
            current = optional_ref(memory, next)?;
        }
        Ok(false)
    }

    // ── run queues ─────────────────────────────────────────────────

    /// Put `process` at the back of its priority's run queue.
    pub fn sleep(&self, memory: &mut ObjectMemory, process: Oop) -> Result<(), MemoryError> {
        let priority = self.priority_of(memory, process)?;
        let list = self.run_list(memory, priority)?;
        self.add_last(memory, list, process)
    }

    /// Make `process` runnable. Answers whether it outranks the active
    /// process, in which case the caller should preempt at its next
    /// decision point.
    pub fn resume(&self, memory: &mut ObjectMemory, process: Oop) -> Result<bool, MemoryError> {
        let active = self.active_process(memory)?;
        if process == active {
            return Ok(false);
        }
        match self.suspended_context(memory, process)? {
            Some(ctx) if memory.context(ctx).is_ok() => {}
            _ => return Err(MemoryError::WrongKind { oop: process, expected: "a suspended process" }),
        }
        if let Some(list) = optional_ref(memory, memory.fetch(process, MY_LIST)?)? {
            self.remove(memory, list, process)?;
        }
        self.sleep(memory, process)?;
        let outranks = self.priority_of(memory, process)? > self.priority_of(memory, active)?;
        trace!("resume {process:?}, outranks active: {outranks}");
        Ok(outranks)
    }

    pub fn highest_runnable_priority(&self, memory: &ObjectMemory) -> Result<Option<usize>, MemoryError> {
        for priority in (1..=self.priorities).rev() {
            let list = self.run_list(memory, priority)?;
            if !self.is_empty_list(memory, list)? {
                return Ok(Some(priority));
            }
        }
        Ok(None)
    }

    /// Pop the first runnable process of the highest non-empty priority.
    ///
    /// Entries whose suspended context is not a context are dropped. With
    /// nothing left to run the VM cannot continue.
    pub fn wake_highest_priority(&self, memory: &mut ObjectMemory) -> Result<Oop, RuntimeError> {
        for priority in (1..=self.priorities).rev() {
            let list = self.run_list(memory, priority)?;
            while let Some(process) = self.remove_first(memory, list)? {
                match self.suspended_context(memory, process)? {
                    Some(ctx) if memory.context(ctx).is_ok() => return Ok(process),
                    _ => warn!("dropping zombie process {process:?} at priority {priority}"),
                }
            }
        }
        Err(RuntimeError::SchedulerExhausted)
    }

    // ── semaphores ─────────────────────────────────────────────────

    /// Answers whether a woken process outranks the active one.
    ///
    /// Waiters without a suspended context are dropped; a signal that
    /// wakes nobody is counted as excess.
    pub fn signal(&self, memory: &mut ObjectMemory, semaphore: Oop) -> Result<bool, MemoryError> {
        let active = self.active_process(memory)?;
        while let Some(process) = self.remove_first(memory, semaphore)? {
            match self.suspended_context(memory, process)? {
                Some(ctx) if memory.context(ctx).is_ok() => {}
                _ if process == active => {}
                _ => {
                    warn!("dropping zombie waiter {process:?} on {semaphore:?}");
                    continue;
                }
            }
            trace!("signal {semaphore:?} wakes {process:?}");
            return self.resume(memory, process);
        }
        let excess = self.excess_signals(memory, semaphore)?;
        memory.store(semaphore, EXCESS_SIGNALS, Value::Int(excess + 1))?;
        Ok(false)
    }

    /// Answers whether the active process has to give up the processor.
    pub fn wait(&self, memory: &mut ObjectMemory, semaphore: Oop) -> Result<bool, MemoryError> {
        let excess = self.excess_signals(memory, semaphore)?;
        if excess > 0 {
            memory.store(semaphore, EXCESS_SIGNALS, Value::Int(excess - 1))?;
            return Ok(false);
        }
        let active = self.active_process(memory)?;
        self.add_last(memory, semaphore, active)?;
        trace!("{active:?} waits on {semaphore:?}");
        Ok(true)
    }

    // ── suspension ─────────────────────────────────────────────────

    /// Take `process` off whatever list holds it. Answers whether it was the
    /// active process, which the caller then has to switch away from.
    pub fn suspend(&self, memory: &mut ObjectMemory, process: Oop) -> Result<bool, MemoryError> {
        if process == self.active_process(memory)? {
            return Ok(true);
        }
        if let Some(list) = optional_ref(memory, memory.fetch(process, MY_LIST)?)? {
            self.remove(memory, list, process)?;
        }
        Ok(false)
    }

    /// Unlink `process` from every list and drop its context.
    pub fn terminate(&self, memory: &mut ObjectMemory, process: Oop) -> Result<bool, MemoryError> {
        let was_active = self.suspend(memory, process)?;
        let nil = memory.nil();
        memory.store(process, SUSPENDED_CONTEXT, nil)?;
        debug!("terminated {process:?}");
        Ok(was_active)
    }

    /// Make `process` active and hand back the context it resumes in.
    pub(crate) fn activate(&self, memory: &mut ObjectMemory, process: Oop) -> Result<Oop, RuntimeError> {
        let ctx = self
            .suspended_context(memory, process)?
            .ok_or(RuntimeError::SchedulerExhausted)?;
        let nil = memory.nil();
        memory.store(process, SUSPENDED_CONTEXT, nil)?;
        memory.store(process, MY_LIST, nil)?;
        self.set_active_process(memory, process)?;
        Ok(ctx)
    }

    /// Park `ctx` as the suspended context of `process`.
    pub(crate) fn store_context(&self, memory: &mut ObjectMemory, process: Oop, ctx: Oop) -> Result<(), MemoryError> {
        memory.store(process, SUSPENDED_CONTEXT, Value::Ref(ctx))?;
        memory.context_mut(ctx)?.process = Some(process);
        Ok(())
    }
}

fn optional_ref(memory: &ObjectMemory, value: Value) -> Result<Option<Oop>, MemoryError> {
    if memory.is_nil(value) {
        return Ok(None);
    }
    expect_ref(value).map(Some)
}

fn expect_ref(value: Value) -> Result<Oop, MemoryError> {
    value.as_oop().ok_or(MemoryError::NotAReference(value))
}
