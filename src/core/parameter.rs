// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::rc::Rc;

use crate::core::checkpoint::{CheckpointCell, Checkpointable, StateId, StateListener};
use crate::core::events::{EventBus, ListenerId};

pub type ChangeListener = Rc<dyn Fn()>;

/// A mutable leaf of the computation graph. Parameters carry no dirty flag of
/// their own; every assignment through [`Parameter::set_value`] fires the
/// change streams so dependents invalidate themselves.
pub struct Parameter<T> {
    value: RefCell<T>,
    label: RefCell<String>,
    pre_change: RefCell<EventBus<ChangeListener>>,
    post_change: RefCell<EventBus<ChangeListener>>,
    ckpt: CheckpointCell<T>,
}

impl<T: Clone + 'static> Parameter<T> {
    pub fn new(value: T) -> Rc<Self> {
        Rc::new(Parameter {
            value: RefCell::new(value),
            label: RefCell::new(String::new()),
            pre_change: RefCell::new(EventBus::new()),
            post_change: RefCell::new(EventBus::new()),
            ckpt: CheckpointCell::new(),
        })
    }

    pub fn with_label(value: T, label: &str) -> Rc<Self> {
        let param = Self::new(value);
        param.set_label(label);
        param
    }

    pub fn value(&self) -> T {
        self.value.borrow().clone()
    }

    pub fn set_label(&self, label: &str) {
        *self.label.borrow_mut() = label.to_owned();
    }

    pub fn label(&self) -> String {
        self.label.borrow().clone()
    }

    /// Guarded assignment used by proposals: the parameter must be saved so
    /// the mutation is reversible.
    pub fn set_value(&self, value: T) {
        debug_assert!(
            self.is_saved(),
            "set_value on unsaved parameter {}",
            self.label()
        );
        self.fire(&self.pre_change);
        *self.value.borrow_mut() = value;
        self.fire(&self.post_change);
    }

    /// Unguarded assignment for construction and hotloading.
    pub fn initialize_value(&self, value: T) {
        *self.value.borrow_mut() = value;
    }

    pub fn add_pre_change_listener(&self, listener: ChangeListener) -> ListenerId {
        self.pre_change.borrow_mut().add(listener)
    }

    pub fn add_post_change_listener(&self, listener: ChangeListener) -> ListenerId {
        self.post_change.borrow_mut().add(listener)
    }

    pub fn remove_post_change_listener(&self, id: ListenerId) -> bool {
        self.post_change.borrow_mut().remove(id)
    }

    fn fire(&self, bus: &RefCell<EventBus<ChangeListener>>) {
        let mut idx = 0;
        loop {
            let listener = bus.borrow().get_cloned(idx);
            match listener {
                Some(listener) => listener(),
                None => break,
            }
            idx += 1;
        }
    }
}

impl<T: Clone + 'static> Checkpointable for Parameter<T> {
    fn save_state(&self, id: StateId) {
        self.ckpt.save(id, || self.value.borrow().clone());
    }

    fn restore_state(&self, id: StateId) {
        self.ckpt.restore(id, |v| *self.value.borrow_mut() = v);
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
mod tests {
    use super::*;
    use crate::core::checkpoint::StateId;

    #[test]
    fn save_set_restore_round_trips() {
        let p = Parameter::with_label(1.5f64, "x");
        p.save_state(StateId::External(0));
        p.set_value(2.5);
        assert_eq!(p.value(), 2.5);
        p.restore_state(StateId::External(0));
        assert_eq!(p.value(), 1.5);
        assert!(!p.is_saved());
    }

    #[test]
    fn duplicate_save_under_same_id_is_single_snapshot() {
        let p = Parameter::new(1.0f64);
        p.save_state(StateId::External(0));
        p.save_state(StateId::External(0));
        p.set_value(9.0);
        p.restore_state(StateId::External(0));
        assert_eq!(p.value(), 1.0);
        assert!(!p.is_saved());
    }

    #[test]
    fn nested_saves_restore_in_order() {
        let p = Parameter::new(1.0f64);
        p.save_state(StateId::External(1));
        p.set_value(2.0);
        p.save_state(StateId::External(2));
        p.set_value(3.0);
        p.restore_state(StateId::External(2));
        assert_eq!(p.value(), 2.0);
        p.restore_state(StateId::External(1));
        assert_eq!(p.value(), 1.0);
    }

    #[test]
    fn accept_clears_the_stack() {
        let p = Parameter::new(1.0f64);
        p.save_state(StateId::External(1));
        p.set_value(2.0);
        p.save_state(StateId::External(2));
        p.set_value(3.0);
        p.accept_state();
        assert!(!p.is_saved());
        assert_eq!(p.value(), 3.0);
    }

    #[test]
    fn mismatched_restore_is_a_no_op() {
        let p = Parameter::new(1.0f64);
        p.save_state(StateId::External(1));
        p.set_value(2.0);
        p.restore_state(StateId::External(2));
        assert_eq!(p.value(), 2.0);
        assert!(p.is_saved());
    }
}
