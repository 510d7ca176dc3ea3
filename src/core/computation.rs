// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use bio::stats::LogProb;

use crate::core::cache::{Cacheable, DirtyCell, DirtyListener};
use crate::core::checkpoint::{
    register_cacheable_checkpoint_target, CheckpointCell, Checkpointable, StateId, StateListener,
    StateOp,
};
use crate::core::events::ListenerId;
use crate::Likelihood;

/// A derived value with a cache. `peek` returns the cache without
/// recomputing; `value` recomputes lazily when the node is dirty.
pub trait Computation<T> {
    fn peek(&self) -> T;
    fn value(&self) -> T;
}

/// A log-likelihood-valued node of the graph.
pub trait LikelihoodNode: Computation<Likelihood> + Cacheable + Checkpointable {
    fn identifier(&self) -> String;
}

/// Sum-reduction over a set of likelihood nodes with per-input dirty
/// tracking: when an input invalidates, its previous cached contribution is
/// subtracted immediately and the fresh contribution is added back on the
/// next read. The dirty-input set and the running sum are snapshotted across
/// save/restore/accept.
pub struct Accumulator {
    label: String,
    value: Cell<f64>,
    targets: RefCell<Vec<Rc<dyn LikelihoodNode>>>,
    dirty_targets: RefCell<BTreeSet<usize>>,
    dirty_cache: RefCell<Vec<BTreeSet<usize>>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl Accumulator {
    pub fn new(label: &str) -> Rc<Self> {
        let acc = Rc::new(Accumulator {
            label: label.to_owned(),
            value: Cell::new(0.0),
            targets: RefCell::new(Vec::new()),
            dirty_targets: RefCell::new(BTreeSet::new()),
            dirty_cache: RefCell::new(Vec::new()),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        let weak = Rc::downgrade(&acc);
        acc.ckpt.add_post_hook(Rc::new(move |op: &StateOp| {
            if let Some(acc) = weak.upgrade() {
                match op {
                    StateOp::Save(_) => {
                        let snapshot = acc.dirty_targets.borrow().clone();
                        acc.dirty_cache.borrow_mut().push(snapshot);
                    }
                    StateOp::Restore(_) => {
                        let snapshot = acc
                            .dirty_cache
                            .borrow_mut()
                            .pop()
                            .expect("accumulator snapshot stack underflow");
                        *acc.dirty_targets.borrow_mut() = snapshot;
                    }
                    StateOp::Accept => {
                        acc.dirty_cache.borrow_mut().clear();
                    }
                }
            }
        }));
        acc
    }

    pub fn add_target(self: &Rc<Self>, target: Rc<dyn LikelihoodNode>) {
        self.cell.set_dirty();
        let idx = self.targets.borrow().len();
        self.targets.borrow_mut().push(target.clone());
        self.dirty_targets.borrow_mut().insert(idx);

        let weak_self = Rc::downgrade(self);
        let weak_target = Rc::downgrade(&target);
        target.add_dirty_listener(DirtyListener::Hook(Rc::new(move || {
            if let (Some(acc), Some(target)) = (weak_self.upgrade(), weak_target.upgrade()) {
                let inserted = acc.dirty_targets.borrow_mut().insert(idx);
                if inserted {
                    if *target.peek() == f64::NEG_INFINITY {
                        debug!("{} reports -inf before invalidation", target.identifier());
                    }
                    acc.value.set(acc.value.get() - *target.peek());
                    acc.cell.set_dirty();
                }
            }
        })));

        register_cacheable_checkpoint_target(&*target, self);
    }

    pub fn num_targets(&self) -> usize {
        self.targets.borrow().len()
    }
}

impl Computation<Likelihood> for Accumulator {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        let dirty: Vec<usize> = self.dirty_targets.borrow().iter().cloned().collect();
        for idx in dirty {
            let target = self.targets.borrow()[idx].clone();
            let contribution = *target.value();
            let contribution = if contribution.is_nan() {
                f64::NEG_INFINITY
            } else {
                contribution
            };
            self.value.set(self.value.get() + contribution);
        }
        self.dirty_targets.borrow_mut().clear();
        self.cell.set_clean();
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for Accumulator {
    fn identifier(&self) -> String {
        format!("Accumulator<{}>", self.label)
    }
}

impl Cacheable for Accumulator {
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

impl Checkpointable for Accumulator {
    fn save_state(&self, id: StateId) {
        self.ckpt.save(id, || self.value.get());
    }
    fn restore_state(&self, id: StateId) {
        self.ckpt.restore(id, |v| self.value.set(v));
    }
    fn accept_state(&self) {
        self.ckpt.accept();
    }
    fn is_saved(&self) -> bool {
        self.ckpt.is_saved()
    }
    fn add_state_listener(&self, listener: StateListener) -> ListenerId {
        self.ckpt.add_listener(listener)
    }
    fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.ckpt.remove_listener(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A checkpointable leaf likelihood driven directly by a value, for
    /// exercising accumulators without a full model.
    pub(crate) struct ConstantLik {
        value: Cell<f64>,
        cell: DirtyCell,
        ckpt: CheckpointCell<f64>,
    }

    impl ConstantLik {
        pub(crate) fn new(value: f64) -> Rc<Self> {
            Rc::new(ConstantLik {
                value: Cell::new(value),
                cell: DirtyCell::new(),
                ckpt: CheckpointCell::new(),
            })
        }

        pub(crate) fn set(&self, value: f64) {
            // mimic a parameter-driven recompute: invalidate first, then
            // store the fresh value for the next read
            self.cell.set_dirty();
            self.value.set(value);
        }
    }

    impl Computation<Likelihood> for ConstantLik {
        fn peek(&self) -> Likelihood {
            LogProb(self.value.get())
        }
        fn value(&self) -> Likelihood {
            self.cell.set_clean();
            LogProb(self.value.get())
        }
    }

    impl LikelihoodNode for ConstantLik {
        fn identifier(&self) -> String {
            "ConstantLik".to_owned()
        }
    }

    impl Cacheable for ConstantLik {
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

    impl Checkpointable for ConstantLik {
        fn save_state(&self, id: StateId) {
            self.ckpt.save(id, || self.value.get());
        }
        fn restore_state(&self, id: StateId) {
            self.ckpt.restore(id, |v| self.value.set(v));
        }
        fn accept_state(&self) {
            self.ckpt.accept();
        }
        fn is_saved(&self) -> bool {
            self.ckpt.is_saved()
        }
        fn add_state_listener(&self, listener: StateListener) -> ListenerId {
            self.ckpt.add_listener(listener)
        }
        fn remove_state_listener(&self, id: ListenerId) -> bool {
            self.ckpt.remove_listener(id)
        }
    }

    #[test]
    fn accumulator_tracks_mutations() {
        let a = ConstantLik::new(-1.0);
        let b = ConstantLik::new(-2.0);
        let acc = Accumulator::new("test");
        acc.add_target(a.clone());
        acc.add_target(b.clone());
        assert_relative_eq!(*acc.value(), -3.0);

        a.set(-5.0);
        assert!(acc.is_dirty());
        assert_relative_eq!(*acc.value(), -7.0);

        b.set(-0.5);
        a.set(-1.5);
        assert_relative_eq!(*acc.value(), -2.0);
    }

    #[test]
    fn accumulator_round_trips_through_snapshots() {
        let a = ConstantLik::new(-1.0);
        let acc = Accumulator::new("test");
        acc.add_target(a.clone());
        assert_relative_eq!(*acc.value(), -1.0);

        a.save_state(StateId::External(0));
        a.set(-4.0);
        assert_relative_eq!(*acc.value(), -4.0);
        a.restore_state(StateId::External(0));
        assert_relative_eq!(*acc.value(), -1.0);

        a.save_state(StateId::External(0));
        a.set(-8.0);
        assert_relative_eq!(*acc.value(), -8.0);
        a.accept_state();
        assert_relative_eq!(*acc.value(), -8.0);
    }
}
