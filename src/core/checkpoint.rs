// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use strum_macros::IntoStaticStr;

use crate::core::cache::Cacheable;
use crate::core::events::{EventBus, ListenerId};

/// Tag naming the kernel that originated a snapshot. A restore only pops when
/// the stack top carries the same tag, which guards the lockstep invariant
/// against interleaved snapshot scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum StateId {
    ContinuousWalk,
    BoundedWalk,
    Salt,
    Order,
    ZanellaNeighborOrder,
    ZanellaOrder,
    GenotypeFlip,
    /// Transient snapshots taken while scoring a proposal neighbourhood.
    Scratch,
    /// Reserved for tests and drivers.
    External(u8),
}

/// The operation being delivered through a checkpoint event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOp {
    Save(StateId),
    Restore(StateId),
    Accept,
}

/// A node whose value participates in reversible snapshots.
pub trait Checkpointable {
    fn save_state(&self, id: StateId);
    fn restore_state(&self, id: StateId);
    fn accept_state(&self);
    fn is_saved(&self) -> bool;
    fn add_state_listener(&self, listener: StateListener) -> ListenerId;
    fn remove_state_listener(&self, id: ListenerId) -> bool;
}

#[derive(Clone)]
pub enum StateListener {
    /// Forward save/restore/accept into the referenced node.
    Cascade(Weak<dyn Checkpointable>),
    /// Arbitrary reaction, e.g. cascading with a dirty-flag reset.
    Hook(Rc<dyn Fn(&StateOp)>),
}

/// Default implementation of [`Checkpointable`]: the snapshot stack, the
/// event bus shared by the three operations, and the pre/post hook lists.
/// Nodes embed one cell per checkpointed value.
pub struct CheckpointCell<T> {
    stack: RefCell<Vec<(T, StateId)>>,
    bus: RefCell<EventBus<StateListener>>,
    pre_hooks: RefCell<Vec<Rc<dyn Fn(&StateOp)>>>,
    post_hooks: RefCell<Vec<Rc<dyn Fn(&StateOp)>>>,
}

impl<T> Default for CheckpointCell<T> {
    fn default() -> Self {
        CheckpointCell {
            stack: RefCell::new(Vec::new()),
            bus: RefCell::new(EventBus::new()),
            pre_hooks: RefCell::new(Vec::new()),
            post_hooks: RefCell::new(Vec::new()),
        }
    }
}

impl<T> CheckpointCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_saved(&self) -> bool {
        !self.stack.borrow().is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn add_listener(&self, listener: StateListener) -> ListenerId {
        self.bus.borrow_mut().add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.bus.borrow_mut().remove(id)
    }

    pub fn add_pre_hook(&self, hook: Rc<dyn Fn(&StateOp)>) {
        self.pre_hooks.borrow_mut().push(hook);
    }

    pub fn add_post_hook(&self, hook: Rc<dyn Fn(&StateOp)>) {
        self.post_hooks.borrow_mut().push(hook);
    }

    /// Push the current value. Skipped when the top of the stack was already
    /// pushed under the same id, so a proposal touching a node through
    /// several paths snapshots it exactly once.
    pub fn save(&self, id: StateId, read: impl FnOnce() -> T) {
        let duplicate = self
            .stack
            .borrow()
            .last()
            .map_or(false, |(_, top)| *top == id);
        if duplicate {
            return;
        }
        let op = StateOp::Save(id);
        self.run_hooks(&self.pre_hooks, &op);
        self.notify(&op);
        let value = read();
        self.stack.borrow_mut().push((value, id));
        self.run_hooks(&self.post_hooks, &op);
    }

    /// Pop the top snapshot into `write` iff it carries `id`. A non-matching
    /// delivery is a no-op: a node reached through several cascade paths
    /// receives the restore once per path but pops only once.
    pub fn restore(&self, id: StateId, write: impl FnOnce(T)) {
        let matches = self
            .stack
            .borrow()
            .last()
            .map_or(false, |(_, top)| *top == id);
        if !matches {
            return;
        }
        let op = StateOp::Restore(id);
        self.run_hooks(&self.pre_hooks, &op);
        self.notify(&op);
        let (value, _) = self.stack.borrow_mut().pop().unwrap();
        write(value);
        self.run_hooks(&self.post_hooks, &op);
    }

    /// Commit: drop every snapshot.
    pub fn accept(&self) {
        if !self.is_saved() {
            return;
        }
        let op = StateOp::Accept;
        self.run_hooks(&self.pre_hooks, &op);
        self.notify(&op);
        self.stack.borrow_mut().clear();
        self.run_hooks(&self.post_hooks, &op);
    }

    fn notify(&self, op: &StateOp) {
        let mut idx = 0;
        loop {
            let listener = self.bus.borrow().get_cloned(idx);
            match listener {
                Some(StateListener::Cascade(target)) => {
                    if let Some(target) = target.upgrade() {
                        match op {
                            StateOp::Save(id) => target.save_state(*id),
                            StateOp::Restore(id) => target.restore_state(*id),
                            StateOp::Accept => target.accept_state(),
                        }
                    }
                }
                Some(StateListener::Hook(hook)) => hook(op),
                None => break,
            }
            idx += 1;
        }
    }

    fn run_hooks(&self, hooks: &RefCell<Vec<Rc<dyn Fn(&StateOp)>>>, op: &StateOp) {
        let mut idx = 0;
        loop {
            let hook = hooks.borrow().get(idx).cloned();
            match hook {
                Some(hook) => hook(op),
                None => break,
            }
            idx += 1;
        }
    }
}

/// Cascade save/restore/accept from `source` into `target`.
pub fn register_checkpoint_target<T>(source: &dyn Checkpointable, target: &Rc<T>) -> ListenerId
where
    T: Checkpointable + 'static,
{
    let target: Rc<dyn Checkpointable> = target.clone();
    let weak: Weak<dyn Checkpointable> = Rc::downgrade(&target);
    source.add_state_listener(StateListener::Cascade(weak))
}

/// Cascade like [`register_checkpoint_target`], additionally resetting the
/// target's dirty flag after a restore or accept: the restored (or accepted)
/// cached value is valid by construction.
pub fn register_cacheable_checkpoint_target<T>(
    source: &dyn Checkpointable,
    target: &Rc<T>,
) -> ListenerId
where
    T: Checkpointable + Cacheable + ?Sized + 'static,
{
    let weak = Rc::downgrade(target);
    source.add_state_listener(StateListener::Hook(Rc::new(move |op: &StateOp| {
        if let Some(target) = weak.upgrade() {
            match op {
                StateOp::Save(id) => target.save_state(*id),
                StateOp::Restore(id) => {
                    target.restore_state(*id);
                    target.set_clean();
                }
                StateOp::Accept => {
                    target.accept_state();
                    target.set_clean();
                }
            }
        }
    })))
}
