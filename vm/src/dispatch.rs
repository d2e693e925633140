//! Message dispatch and per-call-site inline caches.
//!
//! A call site is identified by the code object and pc of its send
//! bytecode. It remembers up to `inline_cache_size` receiver classes with
//! the target each resolved to, then goes megamorphic and looks up on every
//! send. Entries are never walked for invalidation: each one captures the
//! version of its target and the memory's lookup epochs when filled, and a
//! mismatch on use is a miss.

use std::collections::HashMap;

use log::{debug, trace};
use object::{ContextBody, ObjectMemory, Oop, Value};

use crate::VM;
use crate::error::{PrimitiveError, RuntimeError};
use crate::frame::InterpreterState;
use crate::primitives;

/// What a send resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Method { method: Oop, primitive: Option<u16> },
    /// A method dictionary entry that is not compiled code; it is sent
    /// `run:with:in:`.
    ObjectAsMethod { object: Value },
    DoesNotUnderstand,
}

/// Look `selector` up from `class`.
pub fn resolve(memory: &ObjectMemory, class: Oop, selector: Oop) -> Result<Target, RuntimeError> {
    Ok(match memory.lookup(class, selector)? {
        None => Target::DoesNotUnderstand,
        Some(Value::Ref(method)) => match memory.code(method) {
            Ok(code) => Target::Method {
                method,
                primitive: code.primitive_index(),
            },
            Err(_) => Target::ObjectAsMethod {
                object: Value::Ref(method),
            },
        },
        Some(object) => Target::ObjectAsMethod { object },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Guard {
    version: u32,
    hierarchy: u32,
    dnu: u32,
}

impl Guard {
    fn capture(memory: &ObjectMemory, target: Target) -> Self {
        let version = match target {
            Target::Method { method, .. } => memory.version_of(method),
            Target::ObjectAsMethod { object: Value::Ref(oop) } => memory.version_of(oop),
            _ => 0,
        };
        let dnu = match target {
            Target::DoesNotUnderstand => memory.dnu_epoch(),
            _ => 0,
        };
        Self {
            version,
            hierarchy: memory.hierarchy_epoch(),
            dnu,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    class: Oop,
    target: Target,
    guard: Guard,
}

#[derive(Debug, Clone)]
enum SiteState {
    Polymorphic(Vec<CacheEntry>),
    Megamorphic,
}

#[derive(Debug, Clone)]
struct CallSite {
    selector: Oop,
    code_version: u32,
    state: SiteState,
}

impl CallSite {
    fn new(selector: Oop, code_version: u32) -> Self {
        Self {
            selector,
            code_version,
            state: SiteState::Polymorphic(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries or whole sites dropped because a guard no longer held.
    pub invalidations: u64,
    /// Sends through sites that stopped caching.
    pub megamorphic_sends: u64,
}

pub struct InlineCaches {
    sites: HashMap<(Oop, usize), CallSite>,
    capacity: usize,
    stats: CacheStats,
}

impl InlineCaches {
    pub fn new(capacity: usize) -> Self {
        Self {
            sites: HashMap::new(),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop every site, e.g. before `become:` rewrites the classes and
    /// code objects they are keyed by.
    pub fn clear(&mut self) {
        self.sites.clear();
    }

    /// Number of cached classes at a site; `None` if the site is unknown or
    /// megamorphic.
    pub fn entries_at(&self, code: Oop, pc: usize) -> Option<usize> {
        match &self.sites.get(&(code, pc))?.state {
            SiteState::Polymorphic(entries) => Some(entries.len()),
            SiteState::Megamorphic => None,
        }
    }

    pub fn is_megamorphic(&self, code: Oop, pc: usize) -> bool {
        matches!(
            self.sites.get(&(code, pc)).map(|s| &s.state),
            Some(SiteState::Megamorphic)
        )
    }

    /// Target for a send of `selector` to an instance of `class` from the
    /// send at `pc` in `code`.
    pub fn lookup(
        &mut self,
        memory: &ObjectMemory,
        code: Oop,
        pc: usize,
        class: Oop,
        selector: Oop,
    ) -> Result<Target, RuntimeError> {
        let code_version = memory.version_of(code);
        let site = self
            .sites
            .entry((code, pc))
            .or_insert_with(|| CallSite::new(selector, code_version));
        if site.code_version != code_version || site.selector != selector {
            debug!("call site {code:?}@{pc} reset, code changed");
            *site = CallSite::new(selector, code_version);
            self.stats.invalidations += 1;
        }

        let entries = match &mut site.state {
            SiteState::Megamorphic => {
                self.stats.megamorphic_sends += 1;
                return resolve(memory, class, selector);
            }
            SiteState::Polymorphic(entries) => entries,
        };

        if let Some(pos) = entries.iter().position(|e| e.class == class) {
            let entry = &entries[pos];
            if entry.guard == Guard::capture(memory, entry.target) {
                self.stats.hits += 1;
                return Ok(entry.target);
            }
            trace!("call site {code:?}@{pc}: stale entry for {class:?}");
            entries.remove(pos);
            self.stats.invalidations += 1;
        }

        self.stats.misses += 1;
        let target = resolve(memory, class, selector)?;
        if entries.len() < self.capacity {
            entries.push(CacheEntry {
                class,
                target,
                guard: Guard::capture(memory, target),
            });
        } else {
            debug!("call site {code:?}@{pc} went megamorphic");
            site.state = SiteState::Megamorphic;
        }
        Ok(target)
    }

    /// Cached classes and targets stay alive so a recycled handle can never
    /// produce a false hit.
    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for ((code, _), site) in self.sites.iter_mut() {
            let mut code = Value::Ref(*code);
            visitor(&mut code);
            object::visit_oop(&mut site.selector, visitor);
            if let SiteState::Polymorphic(entries) = &mut site.state {
                for entry in entries.iter_mut() {
                    object::visit_oop(&mut entry.class, visitor);
                    match &mut entry.target {
                        Target::Method { method, .. } => object::visit_oop(method, visitor),
                        Target::ObjectAsMethod { object } => visitor(object),
                        Target::DoesNotUnderstand => {}
                    }
                }
            }
        }
    }
}

// ── sends ──────────────────────────────────────────────────────────

fn underflow() -> RuntimeError {
    RuntimeError::Unimplemented {
        message: "operand stack underflow",
    }
}

/// Send `selector` to the receiver `argc` slots below the top of the
/// current activation's stack. `lookup_class` overrides the receiver's
/// class for super sends; `site` enables the inline cache.
pub(crate) fn send(
    vm: &mut VM,
    state: &mut InterpreterState,
    selector: Oop,
    argc: usize,
    lookup_class: Option<Oop>,
    site: Option<(Oop, usize)>,
) -> Result<(), RuntimeError> {
    let receiver = state.body(&vm.memory)?.peek(argc).ok_or_else(underflow)?;
    let class = match lookup_class {
        Some(class) => class,
        None => vm.memory.class_of(receiver)?,
    };
    trace!(
        "send #{} to {}",
        vm.memory.string_of(Value::Ref(selector)).unwrap_or("?"),
        vm.memory.describe(receiver)
    );
    let target = match site {
        Some((code, pc)) => vm.caches.lookup(&vm.memory, code, pc, class, selector)?,
        None => resolve(&vm.memory, class, selector)?,
    };
    perform_target(vm, state, target, selector, argc, class)
}

pub(crate) fn perform_target(
    vm: &mut VM,
    state: &mut InterpreterState,
    target: Target,
    selector: Oop,
    argc: usize,
    class: Oop,
) -> Result<(), RuntimeError> {
    match target {
        Target::Method {
            method,
            primitive: Some(index),
        } => {
            let values = state.body_mut(&mut vm.memory)?.pop_n(argc + 1).ok_or_else(underflow)?;
            match primitives::call(vm, state, index, values[0], &values[1..]) {
                Ok(Some(result)) => state.push_value(&mut vm.memory, result),
                Ok(None) => Ok(()),
                Err(PrimitiveError::Failed) => {
                    trace!("primitive {index} failed, running method body");
                    let body = state.body_mut(&mut vm.memory)?;
                    body.stack.extend(values);
                    activate_method(vm, state, method, argc)
                }
                Err(PrimitiveError::Fatal(err)) => Err(err),
            }
        }
        Target::Method { method, primitive: None } => activate_method(vm, state, method, argc),
        Target::ObjectAsMethod { object } => run_object_as_method(vm, state, object, selector, argc),
        Target::DoesNotUnderstand => does_not_understand(vm, state, selector, argc, class),
    }
}

/// Pop the receiver and arguments and push a virtual activation of
/// `method` for them.
pub(crate) fn activate_method(
    vm: &mut VM,
    state: &mut InterpreterState,
    method: Oop,
    argc: usize,
) -> Result<(), RuntimeError> {
    if state.depth() >= vm.config.max_frames {
        return Err(RuntimeError::StackOverflow);
    }
    let header = vm.memory.code(method)?.header;
    if header.num_args as usize != argc {
        return Err(RuntimeError::TypeError {
            expected: "a method taking that many arguments",
            got: Value::Ref(method),
        });
    }
    let values = state.body_mut(&mut vm.memory)?.pop_n(argc + 1).ok_or_else(underflow)?;
    let nil = vm.memory.nil();
    let mut stack = Vec::with_capacity(header.frame_size());
    stack.extend_from_slice(&values[1..]);
    stack.resize((header.num_temps as usize).max(argc), nil);
    state.push_frame(ContextBody {
        sender: object::ContextLink::Nil,
        pc: Some(0),
        stack,
        code: method,
        method,
        closure: None,
        receiver: values[0],
        process: None,
    });
    Ok(())
}

/// Push an activation of `closure` for `args`. Answers `false` without
/// touching anything when the argument count does not match.
pub(crate) fn activate_closure(
    vm: &mut VM,
    state: &mut InterpreterState,
    closure: Oop,
    args: &[Value],
) -> Result<bool, RuntimeError> {
    let body = vm.memory.closure(closure)?;
    if body.num_args as usize != args.len() {
        return Ok(false);
    }
    if state.depth() >= vm.config.max_frames {
        return Err(RuntimeError::StackOverflow);
    }
    let (receiver, method) = (body.receiver, body.method);
    let copied = body.copied.clone();
    let code = vm.memory.closure_code(closure)?;
    let header = vm.memory.code(code)?.header;

    let mut stack = Vec::with_capacity(header.frame_size());
    stack.extend_from_slice(args);
    stack.extend(copied);
    state.push_frame(ContextBody {
        sender: object::ContextLink::Nil,
        pc: Some(0),
        stack,
        code,
        method,
        closure: Some(closure),
        receiver,
        process: None,
    });
    Ok(true)
}

/// Invoke a non-code method object: `object run: selector with: args in:
/// receiver`, looked up on the object's own class. An object that does not
/// understand `run:with:in:` is sent `doesNotUnderstand:` with the original
/// message.
fn run_object_as_method(
    vm: &mut VM,
    state: &mut InterpreterState,
    object: Value,
    selector: Oop,
    argc: usize,
) -> Result<(), RuntimeError> {
    let run_with_in = vm.memory.special.run_with_in;
    let dnu = vm.memory.special.does_not_understand;
    let object_class = vm.memory.class_of(object)?;
    let target = resolve(&vm.memory, object_class, run_with_in)?;
    let handler = match target {
        Target::DoesNotUnderstand => match resolve(&vm.memory, object_class, dnu)? {
            Target::DoesNotUnderstand => return Err(RuntimeError::MessageNotUnderstood { receiver: object, selector }),
            handler => Some(handler),
        },
        _ => None,
    };

    let values = state.body_mut(&mut vm.memory)?.pop_n(argc + 1).ok_or_else(underflow)?;
    let args = vm.memory.new_array(values[1..].to_vec());
    match handler {
        Some(handler) => {
            let message_class = vm.memory.special.message;
            let message = vm.memory.new_pointers(
                message_class,
                vec![Value::Ref(selector), Value::Ref(args), Value::Ref(object_class)],
            );
            debug!(
                "method object {} does not understand #run:with:in:",
                vm.memory.describe(object)
            );
            let body = state.body_mut(&mut vm.memory)?;
            body.push(object);
            body.push(Value::Ref(message));
            perform_target(vm, state, handler, dnu, 1, object_class)
        }
        None => {
            let body = state.body_mut(&mut vm.memory)?;
            body.push(object);
            body.push(Value::Ref(selector));
            body.push(Value::Ref(args));
            body.push(values[0]);
            perform_target(vm, state, target, run_with_in, 3, object_class)
        }
    }
}

/// Replace the send with `receiver doesNotUnderstand: aMessage`.
fn does_not_understand(
    vm: &mut VM,
    state: &mut InterpreterState,
    selector: Oop,
    argc: usize,
    class: Oop,
) -> Result<(), RuntimeError> {
    let dnu = vm.memory.special.does_not_understand;
    let receiver = state.body(&vm.memory)?.peek(argc).ok_or_else(underflow)?;
    let handler = resolve(&vm.memory, class, dnu)?;
    if handler == Target::DoesNotUnderstand || selector == dnu {
        return Err(RuntimeError::MessageNotUnderstood { receiver, selector });
    }
    let values = state.body_mut(&mut vm.memory)?.pop_n(argc + 1).ok_or_else(underflow)?;
    let args = vm.memory.new_array(values[1..].to_vec());
    let message_class = vm.memory.special.message;
    let message = vm.memory.new_pointers(
        message_class,
        vec![Value::Ref(selector), Value::Ref(args), Value::Ref(class)],
    );
    debug!(
        "{} does not understand #{}",
        vm.memory.describe(receiver),
        vm.memory.string_of(Value::Ref(selector)).unwrap_or("?")
    );
    let body = state.body_mut(&mut vm.memory)?;
    body.push(receiver);
    body.push(Value::Ref(message));
    perform_target(vm, state, handler, dnu, 1, class)
}

/// Number of arguments a selector takes, from its spelling.
pub fn selector_arity(name: &str) -> usize {
    match name.chars().next() {
        Some(c) if c.is_alphabetic() || c == '_' => name.matches(':').count(),
        Some(_) => 1,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{InstanceFormat, MethodHeader};

    fn classes(memory: &mut ObjectMemory) -> (Oop, Oop, Oop) {
        let object = memory.special.object;
        let a = memory.new_class("A", Some(object), InstanceFormat::Fixed, 0).unwrap();
        let b = memory.new_class("B", Some(a), InstanceFormat::Fixed, 0).unwrap();
        let selector = memory.intern("foo");
        (a, b, selector)
    }

    fn method(memory: &mut ObjectMemory, bytes: Vec<u8>) -> Oop {
        memory.new_method(MethodHeader::default(), Vec::new(), bytes)
    }

    // ── resolve ────────────────────────────────────────────────────

    #[test]
    fn resolve_classifies_targets() {
        let mut memory = ObjectMemory::new();
        let (a, b, selector) = classes(&mut memory);
        assert_eq!(resolve(&memory, b, selector).unwrap(), Target::DoesNotUnderstand);

        let m = method(&mut memory, vec![0x78]);
        memory.install_method(a, selector, Value::Ref(m)).unwrap();
        assert_eq!(
            resolve(&memory, b, selector).unwrap(),
            Target::Method { method: m, primitive: None }
        );

        let other = memory.intern("bar");
        let thing = memory.new_array(Vec::new());
        memory.install_method(b, other, Value::Ref(thing)).unwrap();
        assert_eq!(
            resolve(&memory, b, other).unwrap(),
            Target::ObjectAsMethod { object: Value::Ref(thing) }
        );
    }

    #[test]
    fn resolve_reads_primitive_index() {
        let mut memory = ObjectMemory::new();
        let (a, _, selector) = classes(&mut memory);
        let header = MethodHeader {
            has_primitive: true,
            ..MethodHeader::default()
        };
        let m = memory.new_method(header, Vec::new(), vec![0x8B, 60, 0, 0x7C]);
        memory.install_method(a, selector, Value::Ref(m)).unwrap();
        assert_eq!(
            resolve(&memory, a, selector).unwrap(),
            Target::Method { method: m, primitive: Some(60) }
        );
    }

    // ── inline caches ──────────────────────────────────────────────

    #[test]
    fn second_send_hits() {
        let mut memory = ObjectMemory::new();
        let (a, _, selector) = classes(&mut memory);
        let m = method(&mut memory, vec![0x78]);
        memory.install_method(a, selector, Value::Ref(m)).unwrap();
        let site = method(&mut memory, vec![0xD0]);

        let mut caches = InlineCaches::new(6);
        caches.lookup(&memory, site, 0, a, selector).unwrap();
        caches.lookup(&memory, site, 0, a, selector).unwrap();
        assert_eq!(caches.stats().hits, 1);
        assert_eq!(caches.stats().misses, 1);
        assert_eq!(caches.entries_at(site, 0), Some(1));
    }

    #[test]
    fn redefinition_misses_and_resolves_new_method() {
        let mut memory = ObjectMemory::new();
        let (a, b, selector) = classes(&mut memory);
        let old = method(&mut memory, vec![0x78]);
        memory.install_method(a, selector, Value::Ref(old)).unwrap();
        let site = method(&mut memory, vec![0xD0]);
        let mut caches = InlineCaches::new(6);
        caches.lookup(&memory, site, 0, b, selector).unwrap();

        // Overriding in the subclass invalidates what B resolved to.
        let new = method(&mut memory, vec![0x79]);
        memory.install_method(b, selector, Value::Ref(new)).unwrap();
        let target = caches.lookup(&memory, site, 0, b, selector).unwrap();
        assert_eq!(target, Target::Method { method: new, primitive: None });
        assert_eq!(caches.stats().invalidations, 1);
        assert_eq!(caches.stats().hits, 0);
    }

    #[test]
    fn dnu_entries_expire_when_a_method_appears() {
        let mut memory = ObjectMemory::new();
        let (a, _, selector) = classes(&mut memory);
        let site = method(&mut memory, vec![0xD0]);
        let mut caches = InlineCaches::new(6);
        assert_eq!(
            caches.lookup(&memory, site, 0, a, selector).unwrap(),
            Target::DoesNotUnderstand
        );
        let m = method(&mut memory, vec![0x78]);
        memory.install_method(a, selector, Value::Ref(m)).unwrap();
        assert_eq!(
            caches.lookup(&memory, site, 0, a, selector).unwrap(),
            Target::Method { method: m, primitive: None }
        );
    }

    #[test]
    fn replaced_code_resets_its_sites() {
        let mut memory = ObjectMemory::new();
        let (a, _, selector) = classes(&mut memory);
        let site = method(&mut memory, vec![0xD0]);
        let mut caches = InlineCaches::new(6);
        caches.lookup(&memory, site, 0, a, selector).unwrap();
        memory.replace_code(site, 0, Vec::new(), vec![0xD0]).unwrap();
        caches.lookup(&memory, site, 0, a, selector).unwrap();
        assert_eq!(caches.stats().misses, 2);
        assert_eq!(caches.stats().invalidations, 1);
    }

    #[test]
    fn too_many_classes_go_megamorphic() {
        let mut memory = ObjectMemory::new();
        let selector = memory.intern("foo");
        let site = method(&mut memory, vec![0xD0]);
        let object = memory.special.object;
        let mut caches = InlineCaches::new(2);
        for name in ["A", "B", "C"] {
            let class = memory.new_class(name, Some(object), InstanceFormat::Fixed, 0).unwrap();
            caches.lookup(&memory, site, 0, class, selector).unwrap();
        }
        assert!(caches.is_megamorphic(site, 0));
        assert_eq!(caches.entries_at(site, 0), None);
        caches.lookup(&memory, site, 0, object, selector).unwrap();
        assert_eq!(caches.stats().megamorphic_sends, 1);
    }

    #[test]
    fn selector_arities() {
        assert_eq!(selector_arity("size"), 0);
        assert_eq!(selector_arity("+"), 1);
        assert_eq!(selector_arity("at:put:"), 2);
        assert_eq!(selector_arity("run:with:in:"), 3);
    }
}
