use bytecode::SPECIAL_SELECTORS;

use crate::objects::{Body, InstanceFormat};
use crate::value::visit_oop;
use crate::{ObjectMemory, Oop, Value};

/// Well-known objects the VM refers to directly.
///
/// In a loaded image these come from the special objects array; here
/// [`ObjectMemory::new`] builds a minimal set of them.
#[derive(Debug, Clone)]
pub struct SpecialObjects {
    // ── singletons ─────────────────────────────────────────────────
    pub nil: Oop,
    pub true_obj: Oop,
    pub false_obj: Oop,

    // ── classes ────────────────────────────────────────────────────
    pub object: Oop,
    pub class: Oop,
    pub metaclass: Oop,
    pub undefined_object: Oop,
    pub boolean: Oop,
    pub true_class: Oop,
    pub false_class: Oop,
    pub small_integer: Oop,
    pub large_positive_integer: Oop,
    pub large_negative_integer: Oop,
    pub array: Oop,
    pub byte_string: Oop,
    pub byte_symbol: Oop,
    pub message: Oop,
    pub association: Oop,
    pub method_context: Oop,
    pub block_closure: Oop,
    pub compiled_method: Oop,
    pub process: Oop,
    pub semaphore: Oop,
    pub linked_list: Oop,
    pub process_scheduler: Oop,
    pub weak_array: Oop,

    // ── selectors ──────────────────────────────────────────────────
    pub does_not_understand: Oop,
    pub cannot_return: Oop,
    pub must_be_boolean: Oop,
    pub run_with_in: Oop,
    /// Array of 32 (selector, arity) pairs, in special-send order.
    pub special_selectors: Oop,
}

impl SpecialObjects {
    pub(crate) fn placeholder(oop: Oop) -> Self {
        Self {
            nil: oop,
            true_obj: oop,
            false_obj: oop,
            object: oop,
            class: oop,
            metaclass: oop,
            undefined_object: oop,
            boolean: oop,
            true_class: oop,
            false_class: oop,
            small_integer: oop,
            large_positive_integer: oop,
            large_negative_integer: oop,
            array: oop,
            byte_string: oop,
            byte_symbol: oop,
            message: oop,
            association: oop,
            method_context: oop,
            block_closure: oop,
            compiled_method: oop,
            process: oop,
            semaphore: oop,
            linked_list: oop,
            process_scheduler: oop,
            weak_array: oop,
            does_not_understand: oop,
            cannot_return: oop,
            must_be_boolean: oop,
            run_with_in: oop,
            special_selectors: oop,
        }
    }

    pub fn visit_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for oop in [
            &mut self.nil,
            &mut self.true_obj,
            &mut self.false_obj,
            &mut self.object,
            &mut self.class,
            &mut self.metaclass,
            &mut self.undefined_object,
            &mut self.boolean,
            &mut self.true_class,
            &mut self.false_class,
            &mut self.small_integer,
            &mut self.large_positive_integer,
            &mut self.large_negative_integer,
            &mut self.array,
            &mut self.byte_string,
            &mut self.byte_symbol,
            &mut self.message,
            &mut self.association,
            &mut self.method_context,
            &mut self.block_closure,
            &mut self.compiled_method,
            &mut self.process,
            &mut self.semaphore,
            &mut self.linked_list,
            &mut self.process_scheduler,
            &mut self.weak_array,
            &mut self.does_not_understand,
            &mut self.cannot_return,
            &mut self.must_be_boolean,
            &mut self.run_with_in,
            &mut self.special_selectors,
        ] {
            visit_oop(oop, visitor);
        }
    }

    pub fn oops(&self) -> Vec<Oop> {
        let mut out = Vec::new();
        self.clone().visit_mut(&mut |v| {
            if let Value::Ref(oop) = *v {
                out.push(oop);
            }
        });
        out
    }
}

impl ObjectMemory {
    /// A memory holding the kernel class hierarchy, `nil`/`true`/`false`
    /// and the special selectors.
    pub fn new() -> Self {
        use InstanceFormat::*;

        let mut m = Self::empty();
        let placeholder = Oop::from_index(0);
        let nil = m.alloc(placeholder, Body::Pointers(Vec::new()));
        m.special.nil = nil;

        let object = m.define_class("Object", None, None, Fixed, 0);
        let class = sub(&mut m, "Class", object, Class, 0);
        let object_meta = meta_of(&m, object);
        if let Ok(body) = m.class_body_mut(object_meta) {
            body.superclass = Some(class);
        }
        m.special.object = object;
        m.special.class = class;
        m.special.metaclass = sub(&mut m, "Metaclass", object, Class, 0);

        m.special.undefined_object = sub(&mut m, "UndefinedObject", object, Fixed, 0);
        let boolean = sub(&mut m, "Boolean", object, Fixed, 0);
        m.special.boolean = boolean;
        m.special.true_class = sub(&mut m, "True", boolean, Fixed, 0);
        m.special.false_class = sub(&mut m, "False", boolean, Fixed, 0);

        let number = sub(&mut m, "Number", object, Fixed, 0);
        let integer = sub(&mut m, "Integer", number, Fixed, 0);
        m.special.small_integer = sub(&mut m, "SmallInteger", integer, Immediate, 0);
        let large_positive = sub(&mut m, "LargePositiveInteger", integer, LargeInteger, 0);
        m.special.large_positive_integer = large_positive;
        m.special.large_negative_integer =
            sub(&mut m, "LargeNegativeInteger", large_positive, LargeInteger, 0);

        let array = sub(&mut m, "Array", object, Indexable, 0);
        m.special.array = array;
        m.special.weak_array = sub(&mut m, "WeakArray", array, Weak, 0);
        let byte_string = sub(&mut m, "ByteString", object, Bytes, 0);
        m.special.byte_string = byte_string;
        m.special.byte_symbol = sub(&mut m, "ByteSymbol", byte_string, Bytes, 0);
        m.special.message = sub(&mut m, "Message", object, Fixed, 3);
        m.special.association = sub(&mut m, "Association", object, Fixed, 2);
        m.special.method_context = sub(&mut m, "MethodContext", object, Context, 0);
        m.special.block_closure = sub(&mut m, "BlockClosure", object, Closure, 0);
        m.special.compiled_method = sub(&mut m, "CompiledMethod", object, Code, 0);
        m.special.process = sub(&mut m, "Process", object, Fixed, 4);
        let linked_list = sub(&mut m, "LinkedList", object, Fixed, 2);
        m.special.linked_list = linked_list;
        m.special.semaphore = sub(&mut m, "Semaphore", linked_list, Fixed, 3);
        m.special.process_scheduler = sub(&mut m, "ProcessScheduler", object, Fixed, 2);

        // Metaclasses made before Metaclass existed point at the placeholder.
        let metaclass = m.special.metaclass;
        for object in m.slots_mut().iter_mut().flatten() {
            if let Body::Class(body) = &object.body {
                if body.is_meta() {
                    object.header.class = metaclass;
                }
            }
        }
        let undefined_object = m.special.undefined_object;
        if let Ok(header) = m.header_mut(nil) {
            header.class = undefined_object;
        }

        let (true_class, false_class) = (m.special.true_class, m.special.false_class);
        m.special.true_obj = m.alloc(true_class, Body::Pointers(Vec::new()));
        m.special.false_obj = m.alloc(false_class, Body::Pointers(Vec::new()));

        m.special.does_not_understand = m.intern("doesNotUnderstand:");
        m.special.cannot_return = m.intern("cannotReturn:");
        m.special.must_be_boolean = m.intern("mustBeBoolean");
        m.special.run_with_in = m.intern("run:with:in:");

        let mut table = Vec::with_capacity(SPECIAL_SELECTORS.len() * 2);
        for (name, arity) in SPECIAL_SELECTORS {
            table.push(Value::Ref(m.intern(name)));
            table.push(Value::Int(arity as i64));
        }
        m.special.special_selectors = m.new_array(table);
        m
    }
}

fn meta_of(m: &ObjectMemory, class: Oop) -> Oop {
    m.header(class).map(|h| h.class).unwrap_or(class)
}

fn sub(m: &mut ObjectMemory, name: &str, superclass: Oop, format: InstanceFormat, inst_size: usize) -> Oop {
    let meta_superclass = meta_of(m, superclass);
    m.define_class(name, Some(superclass), Some(meta_superclass), format, inst_size)
}
