//! Asynchronous interrupts.
//!
//! The ticker thread and any [`InterruptHandle`] only set flags and queue
//! semaphore indices. Semaphores are signalled by [`InterruptController::deliver`],
//! which the interpreter calls at sends and backward jumps when a check is
//! due.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use object::{ObjectMemory, Oop, Value};
use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::scheduler::Scheduler;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call in this process.
pub fn monotonic_millis() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

#[derive(Default)]
struct Shared {
    check: AtomicBool,
    user_interrupt: AtomicBool,
    stop: AtomicBool,
    /// 1-based indices into the external objects array.
    queue: Mutex<VecDeque<usize>>,
}

/// Thread-safe way to raise interrupts from outside the interpreter.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    /// Queue a signal for the semaphore at `index` (1-based) of the
    /// external objects array.
    pub fn signal_semaphore_with_index(&self, index: usize) {
        self.shared.queue.lock().push_back(index);
        self.shared.check.store(true, Ordering::Release);
    }

    pub fn signal_user_interrupt(&self) {
        self.shared.user_interrupt.store(true, Ordering::Release);
        self.shared.check.store(true, Ordering::Release);
    }

    pub fn request_check(&self) {
        self.shared.check.store(true, Ordering::Release);
    }
}

pub struct InterruptController {
    shared: Arc<Shared>,
    ticker: Option<JoinHandle<()>>,
    active: bool,
    interrupt_semaphore: Option<Oop>,
    timer_semaphore: Option<Oop>,
    wake_tick: Option<u64>,
    finalization_semaphore: Option<Oop>,
    pending_finalization: usize,
    external_objects: Oop,
}

impl InterruptController {
    /// A controller signalling semaphores from `external_objects` (an
    /// Array). With `interval` a ticker thread requests a check that often.
    pub fn new(external_objects: Oop, interval: Option<Duration>) -> Self {
        let shared = Arc::new(Shared::default());
        let ticker = interval.and_then(|interval| {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vm-interrupt-ticker".into())
                .spawn(move || {
                    while !shared.stop.load(Ordering::Acquire) {
                        thread::park_timeout(interval);
                        shared.check.store(true, Ordering::Release);
                    }
                })
                .map_err(|err| warn!("interrupt ticker not started: {err}"))
                .ok()
        });
        Self {
            shared,
            ticker,
            active: true,
            interrupt_semaphore: None,
            timer_semaphore: None,
            wake_tick: None,
            finalization_semaphore: None,
            pending_finalization: 0,
            external_objects,
        }
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// While inactive, pending interrupts stay queued.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn request_check(&self) {
        self.shared.check.store(true, Ordering::Release);
    }

    #[inline]
    pub fn needs_check(&self) -> bool {
        self.active && self.shared.check.load(Ordering::Acquire)
    }

    pub fn external_objects(&self) -> Oop {
        self.external_objects
    }

    pub fn interrupt_semaphore(&self) -> Option<Oop> {
        self.interrupt_semaphore
    }

    pub fn set_interrupt_semaphore(&mut self, semaphore: Option<Oop>) {
        self.interrupt_semaphore = semaphore;
    }

    pub fn set_finalization_semaphore(&mut self, semaphore: Option<Oop>) {
        self.finalization_semaphore = semaphore;
    }

    /// Signal `semaphore` once the millisecond clock reaches `tick`.
    /// `None` cancels the wake-up.
    pub fn schedule_timer(&mut self, semaphore: Option<Oop>, tick: u64) {
        self.timer_semaphore = semaphore;
        self.wake_tick = semaphore.map(|_| tick);
        if semaphore.is_some() {
            self.request_check();
        }
    }

    pub fn wake_tick(&self) -> Option<u64> {
        self.wake_tick
    }

    /// A collection cleared weak slots.
    pub fn note_finalization(&mut self) {
        self.pending_finalization += 1;
        self.request_check();
    }

    /// Forget every pending interrupt and registered semaphore.
    pub fn reset(&mut self) {
        self.shared.check.store(false, Ordering::Release);
        self.shared.user_interrupt.store(false, Ordering::Release);
        self.shared.queue.lock().clear();
        self.active = true;
        self.interrupt_semaphore = None;
        self.timer_semaphore = None;
        self.wake_tick = None;
        self.finalization_semaphore = None;
        self.pending_finalization = 0;
    }

    /// Signal everything that is due, in order: the user interrupt, the
    /// timer, finalization, then queued external indices. Answers whether a
    /// woken process outranks the active one.
    pub fn deliver(&mut self, memory: &mut ObjectMemory, scheduler: &Scheduler) -> Result<bool, RuntimeError> {
        self.shared.check.store(false, Ordering::Release);
        let mut preempt = false;

        if self.shared.user_interrupt.swap(false, Ordering::AcqRel) {
            debug!("delivering user interrupt");
            preempt |= signal(memory, scheduler, self.interrupt_semaphore)?;
        }

        if let Some(tick) = self.wake_tick {
            if tick <= monotonic_millis() {
                trace!("timer due at {tick}");
                let semaphore = self.timer_semaphore.take();
                self.wake_tick = None;
                preempt |= signal(memory, scheduler, semaphore)?;
            } else {
                // Keep polling until the wake-up is due.
                self.shared.check.store(true, Ordering::Release);
            }
        }

        while self.pending_finalization > 0 {
            self.pending_finalization -= 1;
            preempt |= signal(memory, scheduler, self.finalization_semaphore)?;
        }

        let queued: Vec<usize> = self.shared.queue.lock().drain(..).collect();
        for index in queued {
            let semaphore = index
                .checked_sub(1)
                .and_then(|i| memory.fetch(self.external_objects, i).ok())
                .and_then(Value::as_oop);
            match semaphore {
                Some(semaphore) if !memory.is_nil(Value::Ref(semaphore)) => {
                    preempt |= signal(memory, scheduler, Some(semaphore))?;
                }
                _ => warn!("no external semaphore at index {index}"),
            }
        }
        Ok(preempt)
    }

    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        object::visit_oop(&mut self.external_objects, visitor);
        for semaphore in [
            &mut self.interrupt_semaphore,
            &mut self.timer_semaphore,
            &mut self.finalization_semaphore,
        ]
        .into_iter()
        .flatten()
        {
            object::visit_oop(semaphore, visitor);
        }
    }
}

fn signal(memory: &mut ObjectMemory, scheduler: &Scheduler, semaphore: Option<Oop>) -> Result<bool, RuntimeError> {
    let Some(semaphore) = semaphore else {
        return Ok(false);
    };
    if memory.class_of(Value::Ref(semaphore))? != memory.special.semaphore {
        warn!("interrupt target {semaphore:?} is not a semaphore");
        return Ok(false);
    }
    Ok(scheduler.signal(memory, semaphore)?)
}

impl Drop for InterruptController {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            self.shared.stop.store(true, Ordering::Release);
            ticker.thread().unpark();
            let _ = ticker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{EXCESS_SIGNALS, SUSPENDED_CONTEXT};
    use object::{Body, ContextBody, ContextLink, MethodHeader};

    fn setup() -> (ObjectMemory, Scheduler) {
        let mut memory = ObjectMemory::new();
        let scheduler = Scheduler::create(&mut memory, 8, 4).unwrap();
        (memory, scheduler)
    }

    fn semaphore(memory: &mut ObjectMemory) -> Oop {
        let class = memory.special.semaphore;
        let sem = memory.instantiate(class, 0).unwrap();
        memory.store(sem, EXCESS_SIGNALS, Value::Int(0)).unwrap();
        sem
    }

    /// A semaphore with one suspended process waiting on it.
    fn waited_on(memory: &mut ObjectMemory, scheduler: &Scheduler) -> (Oop, Oop) {
        let sem = semaphore(memory);
        let method = memory.new_method(MethodHeader::default(), Vec::new(), vec![0x78]);
        let class = memory.special.method_context;
        let nil = memory.nil();
        let ctx = memory.alloc(
            class,
            Body::Context(ContextBody {
                sender: ContextLink::Nil,
                pc: Some(0),
                stack: Vec::new(),
                code: method,
                method,
                closure: None,
                receiver: nil,
                process: None,
            }),
        );
        let process = scheduler.new_process(memory, 2, nil).unwrap();
        memory.store(process, SUSPENDED_CONTEXT, Value::Ref(ctx)).unwrap();
        scheduler.add_last(memory, sem, process).unwrap();
        (sem, process)
    }

    // ── flags ──────────────────────────────────────────────────────

    #[test]
    fn handle_requests_a_check() {
        let array = Oop::from_index(0);
        let controller = InterruptController::new(array, None);
        assert!(!controller.needs_check());
        controller.handle().signal_semaphore_with_index(1);
        assert!(controller.needs_check());
    }

    #[test]
    fn inactive_controller_defers_checks() {
        let mut controller = InterruptController::new(Oop::from_index(0), None);
        controller.request_check();
        controller.set_active(false);
        assert!(!controller.needs_check());
        controller.set_active(true);
        assert!(controller.needs_check());
    }

    #[test]
    fn ticker_sets_the_flag() {
        let controller = InterruptController::new(Oop::from_index(0), Some(Duration::from_millis(1)));
        assert!(controller.has_ticker());
        let deadline = Instant::now() + Duration::from_secs(2);
        while !controller.needs_check() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(controller.needs_check());
        drop(controller);
    }

    // ── delivery ───────────────────────────────────────────────────

    #[test]
    fn delivers_in_order() {
        let (mut memory, scheduler) = setup();
        let (external, p_external) = waited_on(&mut memory, &scheduler);
        let (finalization, p_finalization) = waited_on(&mut memory, &scheduler);
        let (timer, p_timer) = waited_on(&mut memory, &scheduler);
        let (user, p_user) = waited_on(&mut memory, &scheduler);
        let array = memory.new_array(vec![Value::Ref(external)]);

        let mut controller = InterruptController::new(array, None);
        let handle = controller.handle();
        handle.signal_semaphore_with_index(1);
        controller.note_finalization();
        controller.schedule_timer(Some(timer), 0);
        controller.set_interrupt_semaphore(Some(user));
        handle.signal_user_interrupt();
        controller.set_finalization_semaphore(Some(finalization));

        assert!(controller.needs_check());
        controller.deliver(&mut memory, &scheduler).unwrap();
        assert!(!controller.needs_check());
        assert_eq!(controller.wake_tick(), None);

        let woken: Vec<Oop> = (0..4)
            .map(|_| scheduler.wake_highest_priority(&mut memory).unwrap())
            .collect();
        assert_eq!(woken, vec![p_user, p_timer, p_finalization, p_external]);
    }

    #[test]
    fn future_timer_stays_scheduled() {
        let (mut memory, scheduler) = setup();
        let sem = semaphore(&mut memory);
        let array = memory.new_array(Vec::new());
        let mut controller = InterruptController::new(array, None);
        let tick = monotonic_millis() + 60_000;
        controller.schedule_timer(Some(sem), tick);
        controller.deliver(&mut memory, &scheduler).unwrap();
        assert_eq!(controller.wake_tick(), Some(tick));
        assert_eq!(scheduler.excess_signals(&memory, sem).unwrap(), 0);
    }

    #[test]
    fn bad_indices_are_skipped() {
        let (mut memory, scheduler) = setup();
        let sem = semaphore(&mut memory);
        let nil = memory.nil();
        let array = memory.new_array(vec![nil, Value::Ref(sem)]);
        let mut controller = InterruptController::new(array, None);
        let handle = controller.handle();
        for index in [0, 1, 2, 9] {
            handle.signal_semaphore_with_index(index);
        }
        controller.deliver(&mut memory, &scheduler).unwrap();
        assert_eq!(scheduler.excess_signals(&memory, sem).unwrap(), 1);
    }

    #[test]
    fn reset_drops_pending_work() {
        let (mut memory, scheduler) = setup();
        let sem = semaphore(&mut memory);
        let array = memory.new_array(vec![Value::Ref(sem)]);
        let mut controller = InterruptController::new(array, None);
        controller.handle().signal_semaphore_with_index(1);
        controller.set_finalization_semaphore(Some(sem));
        controller.note_finalization();
        controller.reset();
        assert!(!controller.needs_check());
        controller.deliver(&mut memory, &scheduler).unwrap();
        assert_eq!(scheduler.excess_signals(&memory, sem).unwrap(), 0);
    }
}
