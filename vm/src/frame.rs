//! Activations on the native stack and their escape into heap contexts.
//!
//! A fresh activation is *virtual*: its state lives in the interpreter's
//! own stack and other activations refer to it through a [`FrameMarker`].
//! When something needs it as an object (`thisContext`, a process switch,
//! a reflective read of a sender) it is materialized exactly once into a
//! `MethodContext`; from then on every read and write goes through the heap
//! object. Materialized contexts remember their marker in an
//! [`EscapeTable`] so that closures created while the activation was still
//! virtual can find it later.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use object::{Body, ContextBody, ContextLink, FrameMarker, ObjectMemory, Oop, Value};

use crate::error::RuntimeError;
use crate::signal::PendingSwitch;

#[derive(Debug, Clone)]
pub enum Place {
    Virtual(ContextBody),
    Heap(Oop),
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub marker: FrameMarker,
    pub place: Place,
}

impl Activation {
    pub fn is_virtual(&self) -> bool {
        matches!(self.place, Place::Virtual(_))
    }

    pub fn context(&self) -> Option<Oop> {
        match self.place {
            Place::Heap(ctx) => Some(ctx),
            Place::Virtual(_) => None,
        }
    }
}

/// Marker of every materialized context that has not returned yet.
#[derive(Debug, Default)]
pub struct EscapeTable {
    by_marker: HashMap<FrameMarker, Oop>,
    by_context: HashMap<Oop, FrameMarker>,
}

impl EscapeTable {
    pub fn insert(&mut self, marker: FrameMarker, ctx: Oop) {
        self.by_marker.insert(marker, ctx);
        self.by_context.insert(ctx, marker);
    }

    pub fn context_for(&self, marker: FrameMarker) -> Option<Oop> {
        self.by_marker.get(&marker).copied()
    }

    pub fn marker_for(&self, ctx: Oop) -> Option<FrameMarker> {
        self.by_context.get(&ctx).copied()
    }

    pub fn remove_context(&mut self, ctx: Oop) {
        if let Some(marker) = self.by_context.remove(&ctx) {
            self.by_marker.remove(&marker);
        }
    }

    pub fn len(&self) -> usize {
        self.by_marker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_marker.is_empty()
    }

    /// Drop entries whose context was collected.
    pub fn retain_live(&mut self, memory: &ObjectMemory) {
        self.by_marker.retain(|_, ctx| memory.context(*ctx).is_ok());
        self.by_context.retain(|ctx, _| memory.context(*ctx).is_ok());
    }
}

/// Where a [`ContextLink`] leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Index of an activation on the native stack.
    Native(usize),
    /// A context that is not on the native stack.
    Heap(Oop),
    /// Nil, or an activation that returned without escaping.
    Gone,
}

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

/// The native stack of the running process.
pub struct InterpreterState {
    pub(crate) stack: Vec<Activation>,
    pub(crate) escaped: EscapeTable,
    pub(crate) pending: Option<PendingSwitch>,
    /// Process whose return to nil ends the top-level run.
    pub(crate) top_process: Option<Oop>,
}

impl Default for InterpreterState {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpreterState {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            escaped: EscapeTable::default(),
            pending: None,
            top_process: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn activations(&self) -> &[Activation] {
        &self.stack
    }

    pub fn escaped(&self) -> &EscapeTable {
        &self.escaped
    }

    /// Markers are unique across interpreter states, so a stale link
    /// left over from an earlier run never names a new activation.
    fn mint_marker(&mut self) -> FrameMarker {
        FrameMarker::new(NEXT_MARKER.fetch_add(1, Ordering::Relaxed))
    }

    /// Record a scheduling request; a blocking request wins over a mere
    /// preemption check.
    pub(crate) fn request_switch(&mut self, switch: PendingSwitch) {
        self.pending = match self.pending {
            Some(existing) if existing != PendingSwitch::Preempt => Some(existing),
            _ => Some(switch),
        };
    }

    // ── access ─────────────────────────────────────────────────────

    pub fn body_at<'a>(
        &'a self,
        memory: &'a ObjectMemory,
        index: usize,
    ) -> Result<&'a ContextBody, RuntimeError> {
        match self.stack.get(index).map(|a| &a.place) {
            Some(Place::Virtual(body)) => Ok(body),
            Some(Place::Heap(ctx)) => Ok(memory.context(*ctx)?),
            None => Err(RuntimeError::Unimplemented { message: "no activation" }),
        }
    }

    pub fn body_at_mut<'a>(
        &'a mut self,
        memory: &'a mut ObjectMemory,
        index: usize,
    ) -> Result<&'a mut ContextBody, RuntimeError> {
        match self.stack.get_mut(index).map(|a| &mut a.place) {
            Some(Place::Virtual(body)) => Ok(body),
            Some(Place::Heap(ctx)) => Ok(memory.context_mut(*ctx)?),
            None => Err(RuntimeError::Unimplemented { message: "no activation" }),
        }
    }

    /// State of the running activation.
    pub fn body<'a>(&'a self, memory: &'a ObjectMemory) -> Result<&'a ContextBody, RuntimeError> {
        self.body_at(memory, self.stack.len().wrapping_sub(1))
    }

    pub fn body_mut<'a>(
        &'a mut self,
        memory: &'a mut ObjectMemory,
    ) -> Result<&'a mut ContextBody, RuntimeError> {
        let top = self.stack.len().wrapping_sub(1);
        self.body_at_mut(memory, top)
    }

    pub fn push_value(&mut self, memory: &mut ObjectMemory, value: Value) -> Result<(), RuntimeError> {
        self.body_mut(memory)?.push(value);
        Ok(())
    }

    pub fn pop_value(&mut self, memory: &mut ObjectMemory) -> Result<Value, RuntimeError> {
        self.body_mut(memory)?
            .pop()
            .ok_or(RuntimeError::Unimplemented { message: "operand stack underflow" })
    }

    /// Link that refers to activation `index` from a callee or a closure.
    pub fn link_to(&self, index: usize) -> ContextLink {
        match self.stack.get(index) {
            Some(Activation { place: Place::Heap(ctx), .. }) => ContextLink::Context(*ctx),
            Some(activation) => ContextLink::Frame(activation.marker),
            None => ContextLink::Nil,
        }
    }

    // ── push / pop ─────────────────────────────────────────────────

    /// Push a virtual activation whose sender is the current top.
    pub fn push_frame(&mut self, mut body: ContextBody) -> FrameMarker {
        body.sender = match self.stack.len() {
            0 => ContextLink::Nil,
            n => self.link_to(n - 1),
        };
        let marker = self.mint_marker();
        self.stack.push(Activation {
            marker,
            place: Place::Virtual(body),
        });
        marker
    }

    /// Put a heap context on the native stack, keeping the marker it
    /// escaped under if it has one.
    pub fn push_context(&mut self, ctx: Oop) -> FrameMarker {
        let marker = match self.escaped.marker_for(ctx) {
            Some(marker) => marker,
            None => {
                let marker = self.mint_marker();
                self.escaped.insert(marker, ctx);
                marker
            }
        };
        self.stack.push(Activation {
            marker,
            place: Place::Heap(ctx),
        });
        marker
    }

    /// Pop the top activation; a materialized one is marked as returned.
    pub fn pop_activation(&mut self, memory: &mut ObjectMemory) -> Result<(), RuntimeError> {
        if let Some(activation) = self.stack.pop() {
            if let Place::Heap(ctx) = activation.place {
                retire(memory, &mut self.escaped, ctx)?;
            }
        }
        Ok(())
    }

    /// Drop every activation, marking materialized ones as returned.
    pub fn discard_all(&mut self, memory: &mut ObjectMemory) -> Result<(), RuntimeError> {
        while !self.stack.is_empty() {
            self.pop_activation(memory)?;
        }
        Ok(())
    }

    /// Forget the native stack without retiring anything. Every activation
    /// must already live in the heap (see [`flush`](Self::flush)).
    pub(crate) fn abandon(&mut self) {
        debug_assert!(self.stack.iter().all(|a| !a.is_virtual()));
        self.stack.clear();
    }

    // ── escape ─────────────────────────────────────────────────────

    /// Materialize activation `index` into a heap context. Idempotent.
    pub fn materialize(&mut self, memory: &mut ObjectMemory, index: usize) -> Result<Oop, RuntimeError> {
        let caller = index.checked_sub(1).and_then(|i| self.stack.get(i)).map(|a| (a.marker, a.context()));
        let Some(activation) = self.stack.get_mut(index) else {
            return Err(RuntimeError::Unimplemented { message: "no activation" });
        };
        if let Place::Heap(ctx) = activation.place {
            return Ok(ctx);
        }
        let placeholder = Place::Heap(memory.special.nil);
        let Place::Virtual(mut body) = std::mem::replace(&mut activation.place, placeholder) else {
            return Err(RuntimeError::Unimplemented { message: "activation vanished" });
        };
        if let (ContextLink::Frame(marker), Some((caller_marker, Some(caller_ctx)))) = (body.sender, caller) {
            if marker == caller_marker {
                body.sender = ContextLink::Context(caller_ctx);
            }
        }
        let class = memory.special.method_context;
        let ctx = memory.alloc(class, Body::Context(body));
        activation.place = Place::Heap(ctx);
        let marker = activation.marker;
        self.escaped.insert(marker, ctx);
        trace!("materialized activation {index} ({marker:?}) as {ctx:?}");
        Ok(ctx)
    }

    pub fn materialize_top(&mut self, memory: &mut ObjectMemory) -> Result<Oop, RuntimeError> {
        let top = self.stack.len().wrapping_sub(1);
        self.materialize(memory, top)
    }

    /// Materialize the whole native stack and link every context to its
    /// sender's context, so the chain can be stored into a process.
    /// Answers the top context.
    pub fn flush(&mut self, memory: &mut ObjectMemory) -> Result<Option<Oop>, RuntimeError> {
        let mut below: Option<(FrameMarker, Oop)> = None;
        for index in 0..self.stack.len() {
            let ctx = self.materialize(memory, index)?;
            if let Some((marker, sender_ctx)) = below {
                let body = memory.context_mut(ctx)?;
                if body.sender == ContextLink::Frame(marker) {
                    body.sender = ContextLink::Context(sender_ctx);
                }
            }
            below = Some((self.stack[index].marker, ctx));
        }
        Ok(below.map(|(_, ctx)| ctx))
    }

    // ── link resolution ────────────────────────────────────────────

    pub fn resolve(&self, link: ContextLink) -> Resolved {
        match link {
            ContextLink::Nil => Resolved::Gone,
            ContextLink::Frame(marker) => {
                if let Some(index) = self.stack.iter().rposition(|a| a.marker == marker) {
                    return Resolved::Native(index);
                }
                match self.escaped.context_for(marker) {
                    Some(ctx) => self.resolve(ContextLink::Context(ctx)),
                    None => Resolved::Gone,
                }
            }
            ContextLink::Context(ctx) => {
                match self.stack.iter().rposition(|a| a.context() == Some(ctx)) {
                    Some(index) => Resolved::Native(index),
                    None => Resolved::Heap(ctx),
                }
            }
        }
    }

    /// Context object for `link`, materializing a native activation if
    /// needed. `None` for nil or a returned virtual activation.
    pub fn context_of(&mut self, memory: &mut ObjectMemory, link: ContextLink) -> Result<Option<Oop>, RuntimeError> {
        match self.resolve(link) {
            Resolved::Native(index) => self.materialize(memory, index).map(Some),
            Resolved::Heap(ctx) => Ok(Some(ctx)),
            Resolved::Gone => Ok(None),
        }
    }

    /// Sender of a heap context as an object, replacing a marker link with
    /// the materialized sender.
    pub fn sender_of(&mut self, memory: &mut ObjectMemory, ctx: Oop) -> Result<Option<Oop>, RuntimeError> {
        let link = memory.context(ctx)?.sender;
        let sender = self.context_of(memory, link)?;
        if let (ContextLink::Frame(_), Some(sender)) = (link, sender) {
            memory.context_mut(ctx)?.sender = ContextLink::Context(sender);
        }
        Ok(sender)
    }

    // ── roots ──────────────────────────────────────────────────────

    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for activation in self.stack.iter_mut() {
            match &mut activation.place {
                Place::Virtual(body) => body.visit_refs(visitor),
                Place::Heap(ctx) => object::visit_oop(ctx, visitor),
            }
        }
        if let Some(process) = &mut self.top_process {
            object::visit_oop(process, visitor);
        }
    }
}

/// Mark `ctx` as returned.
pub(crate) fn retire(memory: &mut ObjectMemory, escaped: &mut EscapeTable, ctx: Oop) -> Result<(), RuntimeError> {
    let body = memory.context_mut(ctx)?;
    body.pc = None;
    body.sender = ContextLink::Nil;
    escaped.remove_context(ctx);
    Ok(())
}
