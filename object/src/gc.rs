use log::debug;

use crate::header::HeaderFlags;
use crate::objects::Body;
use crate::{ObjectMemory, Oop, Value};

/// Supplies the references that live outside the object memory: the
/// interpreter's native frames, dispatch caches, scheduler state.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.iter_mut().for_each(|v| visitor(v));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub live: usize,
    pub freed: usize,
    /// Weak slots set to nil because their referent died.
    pub cleared_weak: usize,
}

impl ObjectMemory {
    /// Mark-sweep collection.
    ///
    /// Marks from `roots`, the special objects and the symbol table through
    /// strong references only, clears weak slots whose referent was not
    /// marked, then frees every unmarked object.
    pub fn collect_garbage(&mut self, roots: &mut dyn RootProvider) -> GcStats {
        let mut pending: Vec<Oop> = self.special.oops();
        pending.extend(self.symbol_oops());
        roots.visit_roots(&mut |v| {
            if let Value::Ref(oop) = *v {
                pending.push(oop);
            }
        });

        while let Some(oop) = pending.pop() {
            let Some(Some(object)) = self.slots_mut().get_mut(oop.index()) else {
                continue;
            };
            if object.header.is_marked() {
                continue;
            }
            object.header.flags.insert(HeaderFlags::MARKED);
            object.visit_refs(false, &mut |v| {
                if let Value::Ref(child) = *v {
                    pending.push(child);
                }
            });
        }

        let mut dead_weak = Vec::new();
        for (index, entry) in self.slots().iter().enumerate() {
            let Some(object) = entry else { continue };
            if !object.header.is_marked() {
                continue;
            }
            if let Body::Weak { fixed, slots } = &object.body {
                for (slot, value) in slots.iter().enumerate().skip(*fixed) {
                    if let Value::Ref(referent) = *value {
                        if !self.is_marked(referent) {
                            dead_weak.push((index, slot));
                        }
                    }
                }
            }
        }
        let nil = self.nil();
        for &(index, slot) in &dead_weak {
            if let Some(Some(object)) = self.slots_mut().get_mut(index) {
                if let Body::Weak { slots, .. } = &mut object.body {
                    slots[slot] = nil;
                }
            }
        }

        let mut dead = Vec::new();
        for (index, entry) in self.slots_mut().iter_mut().enumerate() {
            if let Some(object) = entry {
                if object.header.is_marked() {
                    object.header.flags.remove(HeaderFlags::MARKED);
                } else {
                    dead.push(Oop::from_index(index));
                }
            }
        }
        for &oop in &dead {
            self.release(oop);
        }

        let stats = GcStats {
            live: self.live_count(),
            freed: dead.len(),
            cleared_weak: dead_weak.len(),
        };
        debug!(
            "gc: {} live, {} freed, {} weak slots cleared",
            stats.live, stats.freed, stats.cleared_weak
        );
        stats
    }

    fn is_marked(&self, oop: Oop) -> bool {
        self.header(oop).map(|h| h.is_marked()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weak_holding(m: &mut ObjectMemory, referent: Oop) -> Oop {
        let class = m.special.weak_array;
        let weak = m.instantiate(class, 1).unwrap();
        m.store(weak, 0, Value::Ref(referent)).unwrap();
        weak
    }

    #[test]
    fn unreachable_objects_are_freed_and_reused() {
        let mut m = ObjectMemory::new();
        let garbage = m.new_string("garbage");
        let kept = m.new_string("kept");
        let before = m.live_count();

        let stats = m.collect_garbage(&mut vec![Value::Ref(kept)]);
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.live, before - 1);
        assert!(!m.is_live(garbage));
        assert!(m.is_live(kept));

        let reused = m.new_string("new");
        assert_eq!(reused, garbage);
    }

    #[test]
    fn weak_slots_do_not_keep_referents_alive() {
        let mut m = ObjectMemory::new();
        let referent = m.new_string("weakly held");
        let weak = weak_holding(&mut m, referent);

        let stats = m.collect_garbage(&mut vec![Value::Ref(weak)]);
        assert_eq!(stats.cleared_weak, 1);
        assert!(!m.is_live(referent));
        assert_eq!(m.fetch(weak, 0).unwrap(), m.nil());
    }

    #[test]
    fn weak_slots_survive_while_strongly_reachable() {
        let mut m = ObjectMemory::new();
        let referent = m.new_string("also strong");
        let weak = weak_holding(&mut m, referent);

        let stats = m.collect_garbage(&mut vec![Value::Ref(weak), Value::Ref(referent)]);
        assert_eq!(stats.cleared_weak, 0);
        assert_eq!(m.fetch(weak, 0).unwrap(), Value::Ref(referent));
    }

    #[test]
    fn special_objects_and_symbols_survive() {
        let mut m = ObjectMemory::new();
        let symbol = m.intern("keepMe");
        m.collect_garbage(&mut Vec::<Value>::new());
        assert!(m.is_live(symbol));
        assert!(m.is_live(m.special.nil));
        assert_eq!(m.special_selector(22).unwrap().1, 1);
    }

    #[test]
    fn marks_are_cleared_after_collection() {
        let mut m = ObjectMemory::new();
        let kept = m.new_string("kept");
        m.collect_garbage(&mut vec![Value::Ref(kept)]);
        assert!(!m.header(kept).unwrap().is_marked());
        m.collect_garbage(&mut vec![Value::Ref(kept)]);
        assert!(m.is_live(kept));
    }
}
