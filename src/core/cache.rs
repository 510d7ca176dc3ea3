// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::events::{EventBus, ListenerId};

/// A node whose cached value can be invalidated. Marking a node dirty fires
/// its `set_dirty` stream so that dependents invalidate themselves in turn;
/// the propagation terminates because the graph is acyclic.
pub trait Cacheable {
    fn is_dirty(&self) -> bool;
    fn set_dirty(&self);
    /// Called from within `recompute` once the cached value is valid again.
    fn set_clean(&self);
    fn add_dirty_listener(&self, listener: DirtyListener) -> ListenerId;
    fn remove_dirty_listener(&self, id: ListenerId) -> bool;
}

/// Listeners on the `set_dirty` stream. The propagation slot is the hot path
/// and carries no closure; hooks are reserved for bespoke reactions such as
/// accumulator subtraction or cache invalidation.
#[derive(Clone)]
pub enum DirtyListener {
    /// Mark the referenced node dirty (which cascades further).
    Propagate(Weak<dyn Cacheable>),
    /// Run an arbitrary reaction.
    Hook(Rc<dyn Fn()>),
}

/// Default implementation of [`Cacheable`]: a dirty flag plus the listener
/// table, embedded as a field by every cached node.
pub struct DirtyCell {
    dirty: Cell<bool>,
    bus: RefCell<EventBus<DirtyListener>>,
}

impl Default for DirtyCell {
    fn default() -> Self {
        DirtyCell {
            dirty: Cell::new(true),
            bus: RefCell::new(EventBus::new()),
        }
    }
}

impl DirtyCell {
    /// A fresh cell; nodes start dirty so the first read recomputes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn set_clean(&self) {
        self.dirty.set(false);
    }

    /// Idempotently mark dirty, then notify listeners depth-first.
    pub fn set_dirty(&self) {
        self.dirty.set(true);
        let mut idx = 0;
        loop {
            let listener = self.bus.borrow().get_cloned(idx);
            match listener {
                Some(DirtyListener::Propagate(target)) => {
                    if let Some(target) = target.upgrade() {
                        target.set_dirty();
                    }
                }
                Some(DirtyListener::Hook(hook)) => hook(),
                None => break,
            }
            idx += 1;
        }
    }

    pub fn add_listener(&self, listener: DirtyListener) -> ListenerId {
        self.bus.borrow_mut().add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.bus.borrow_mut().remove(id)
    }
}

/// Register `target` so that it is marked dirty whenever `source` is.
pub fn register_dirty_target<T>(source: &dyn Cacheable, target: &Rc<T>) -> ListenerId
where
    T: Cacheable + 'static,
{
    let target: Rc<dyn Cacheable> = target.clone();
    let weak: Weak<dyn Cacheable> = Rc::downgrade(&target);
    source.add_dirty_listener(DirtyListener::Propagate(weak))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        cell: DirtyCell,
    }

    impl Cacheable for Node {
        fn is_dirty(&self) -> bool {
            self.cell.is_dirty()
        }
        fn set_dirty(&self) {
            self.cell.set_dirty();
        }
        fn set_clean(&self) {
            self.cell.set_clean();
        }
        fn add_dirty_listener(&self, listener: DirtyListener) -> ListenerId {
            self.cell.add_listener(listener)
        }
        fn remove_dirty_listener(&self, id: ListenerId) -> bool {
            self.cell.remove_listener(id)
        }
    }

    #[test]
    fn propagates_transitively() {
        let a = Rc::new(Node { cell: DirtyCell::new() });
        let b = Rc::new(Node { cell: DirtyCell::new() });
        let c = Rc::new(Node { cell: DirtyCell::new() });
        register_dirty_target(&*a, &b);
        register_dirty_target(&*b, &c);
        b.set_clean();
        c.set_clean();
        a.set_dirty();
        assert!(b.is_dirty());
        assert!(c.is_dirty());
    }

    #[test]
    fn dropped_targets_are_skipped() {
        let a = Rc::new(Node { cell: DirtyCell::new() });
        {
            let b = Rc::new(Node { cell: DirtyCell::new() });
            register_dirty_target(&*a, &b);
        }
        // no panic, dead listener silently ignored
        a.set_dirty();
    }
}
