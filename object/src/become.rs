use std::collections::HashMap;

use log::debug;

use crate::error::MemoryError;
use crate::gc::RootProvider;
use crate::{ObjectMemory, Oop, Value};

impl ObjectMemory {
    /// Two-way `become:`: every reference to `a` now reaches what `b` was,
    /// and the other way round. Identity hashes travel with the objects.
    ///
    /// Applying it twice to the same pair restores the original state.
    pub fn become_two_way(&mut self, a: Oop, b: Oop) -> Result<(), MemoryError> {
        self.get(a)?;
        self.get(b)?;
        if a == b {
            return Ok(());
        }
        self.slots_mut().swap(a.index(), b.index());
        self.bump_hierarchy_epoch();
        debug!("become: swapped {a:?} and {b:?}");
        Ok(())
    }

    /// One-way `become:`: redirect every reference to `from[i]` so it
    /// refers to `to[i]` instead.
    ///
    /// Heap objects, the special objects, the symbol table and whatever
    /// `roots` exposes (live frames, caches) are all rewritten in one pass.
    /// Weak slots are left alone unless `include_weak` is set. With
    /// `copy_hash`, each target takes over its source's identity hash.
    pub fn become_one_way(
        &mut self,
        from: &[Oop],
        to: &[Value],
        copy_hash: bool,
        include_weak: bool,
        roots: &mut dyn RootProvider,
    ) -> Result<(), MemoryError> {
        if from.len() != to.len() {
            return Err(MemoryError::LengthMismatch { from: from.len(), to: to.len() });
        }
        for &oop in from {
            self.get(oop)?;
        }
        for &target in to {
            if let Value::Ref(oop) = target {
                self.get(oop)?;
            }
        }

        let forward: HashMap<Oop, Value> = from.iter().copied().zip(to.iter().copied()).collect();
        let mut rewritten = 0usize;
        let mut fix = |value: &mut Value| {
            if let Value::Ref(oop) = *value {
                if let Some(&target) = forward.get(&oop) {
                    *value = target;
                    rewritten += 1;
                }
            }
        };

        roots.visit_roots(&mut fix);
        self.special.visit_mut(&mut fix);
        for symbol in self.symbols_mut() {
            crate::value::visit_oop(symbol, &mut fix);
        }
        for object in self.slots_mut().iter_mut().flatten() {
            object.visit_refs(include_weak, &mut fix);
        }

        if copy_hash {
            for (source, target) in from.iter().zip(to) {
                if let Value::Ref(target) = *target {
                    let hash = self.header(*source)?.hash;
                    self.header_mut(target)?.hash = hash;
                }
            }
        }
        self.bump_hierarchy_epoch();
        debug!("become: forwarded {} objects, {rewritten} references rewritten", from.len());
        Ok(())
    }
}
