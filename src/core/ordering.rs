// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::core::checkpoint::{CheckpointCell, Checkpointable, StateId, StateListener};
use crate::core::events::{EventBus, ListenerId};

/// Stable identity of an ordering element, used to key the crossing events.
pub trait OrderKey {
    fn order_key(&self) -> usize;
}

impl<T> OrderKey for Rc<T> {
    fn order_key(&self) -> usize {
        Rc::as_ptr(self) as *const u8 as usize
    }
}

pub type MovedListener<E> = Rc<dyn Fn(&E)>;

/// A mutable permutation of entity handles. `swap` fires keyed
/// `moved_left`/`moved_right` events for every pair of elements that crossed,
/// so a dependent interested in a single element subscribes only under that
/// element's key.
pub struct Ordering<E> {
    value: RefCell<Vec<E>>,
    moved_left: RefCell<HashMap<usize, EventBus<MovedListener<E>>>>,
    moved_right: RefCell<HashMap<usize, EventBus<MovedListener<E>>>>,
    ckpt: CheckpointCell<Vec<E>>,
}

impl<E: OrderKey + Clone + 'static> Ordering<E> {
    pub fn new() -> Rc<Self> {
        Rc::new(Ordering {
            value: RefCell::new(Vec::new()),
            moved_left: RefCell::new(HashMap::new()),
            moved_right: RefCell::new(HashMap::new()),
            ckpt: CheckpointCell::new(),
        })
    }

    pub fn from_elements(elements: Vec<E>) -> Rc<Self> {
        let ordering = Self::new();
        ordering.add_elements(elements);
        ordering
    }

    pub fn add_element(&self, element: E) {
        let key = element.order_key();
        self.moved_left.borrow_mut().entry(key).or_default();
        self.moved_right.borrow_mut().entry(key).or_default();
        self.value.borrow_mut().push(element);
    }

    pub fn add_elements(&self, elements: Vec<E>) {
        for element in elements {
            self.add_element(element);
        }
    }

    pub fn value(&self) -> Vec<E> {
        self.value.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.value.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.borrow().is_empty()
    }

    pub fn position_of(&self, element: &E) -> Option<usize> {
        self.value
            .borrow()
            .iter()
            .position(|e| e.order_key() == element.order_key())
    }

    pub fn swap(&self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.value.borrow_mut().swap(a, b);
        let (left, right) = if a < b { (a, b) } else { (b, a) };
        self.notify_swap(left, right);
    }

    pub fn add_moved_left_listener(&self, key: &E, listener: MovedListener<E>) -> ListenerId {
        self.moved_left
            .borrow_mut()
            .get_mut(&key.order_key())
            .expect("unregistered ordering key")
            .add(listener)
    }

    pub fn add_moved_right_listener(&self, key: &E, listener: MovedListener<E>) -> ListenerId {
        self.moved_right
            .borrow_mut()
            .get_mut(&key.order_key())
            .expect("unregistered ordering key")
            .add(listener)
    }

    pub fn remove_moved_left_listener(&self, key: &E, id: ListenerId) -> bool {
        self.moved_left
            .borrow_mut()
            .get_mut(&key.order_key())
            .map_or(false, |bus| bus.remove(id))
    }

    pub fn remove_moved_right_listener(&self, key: &E, id: ListenerId) -> bool {
        self.moved_right
            .borrow_mut()
            .get_mut(&key.order_key())
            .map_or(false, |bus| bus.remove(id))
    }

    fn notify_swap(&self, left: usize, right: usize) {
        // after the swap, the element now at `left` crossed leftwards over
        // everything in (left, right]; the one at `right` crossed rightwards
        let (left_el, right_el) = {
            let value = self.value.borrow();
            (value[left].clone(), value[right].clone())
        };
        self.fire(&self.moved_right, &left_el, &right_el);
        self.fire(&self.moved_left, &right_el, &left_el);
        for i in left + 1..right {
            let mid = self.value.borrow()[i].clone();
            self.fire(&self.moved_left, &right_el, &mid);
            self.fire(&self.moved_right, &left_el, &mid);
            self.fire(&self.moved_right, &mid, &right_el);
            self.fire(&self.moved_left, &mid, &left_el);
        }
    }

    fn fire(
        &self,
        buses: &RefCell<HashMap<usize, EventBus<MovedListener<E>>>>,
        key: &E,
        element: &E,
    ) {
        let mut idx = 0;
        loop {
            let listener = buses
                .borrow()
                .get(&key.order_key())
                .and_then(|bus| bus.get_cloned(idx));
            match listener {
                Some(listener) => listener(element),
                None => break,
            }
            idx += 1;
        }
    }
}

impl<E: OrderKey + Clone + 'static> Checkpointable for Ordering<E> {
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
    use std::cell::Cell;

    #[test]
    fn swap_notifies_crossing_elements() {
        let e1 = Rc::new(1);
        let e2 = Rc::new(2);
        let ordering = Ordering::from_elements(vec![e1.clone(), e2.clone()]);

        let e2_moved_left_of_e1 = Rc::new(Cell::new(false));
        let e1_moved_right_of_e2 = Rc::new(Cell::new(false));
        {
            let flag = e2_moved_left_of_e1.clone();
            let expect = e2.clone();
            ordering.add_moved_left_listener(
                &e1,
                Rc::new(move |el: &Rc<i32>| flag.set(el.order_key() == expect.order_key())),
            );
        }
        {
            let flag = e1_moved_right_of_e2.clone();
            let expect = e1.clone();
            ordering.add_moved_right_listener(
                &e2,
                Rc::new(move |el: &Rc<i32>| flag.set(el.order_key() == expect.order_key())),
            );
        }

        ordering.swap(0, 1);
        assert!(e2_moved_left_of_e1.get());
        assert!(e1_moved_right_of_e2.get());
        assert_eq!(*ordering.value()[0], 2);
        assert_eq!(*ordering.value()[1], 1);
    }

    #[test]
    fn intermediate_elements_see_both_crossings() {
        let elements: Vec<Rc<i32>> = (0..4).map(Rc::new).collect();
        let ordering = Ordering::from_elements(elements.clone());

        let crossings = Rc::new(Cell::new(0));
        {
            let crossings = crossings.clone();
            ordering
                .add_moved_left_listener(&elements[1], Rc::new(move |_| crossings.set(crossings.get() + 1)));
        }
        {
            let crossings = crossings.clone();
            ordering
                .add_moved_right_listener(&elements[1], Rc::new(move |_| crossings.set(crossings.get() + 1)));
        }

        // 0 and 2 swap across element 1: it sees one moved_left and one moved_right
        ordering.swap(0, 2);
        assert_eq!(crossings.get(), 2);
    }

    #[test]
    fn restore_reverses_swaps() {
        let elements: Vec<Rc<i32>> = (0..3).map(Rc::new).collect();
        let ordering = Ordering::from_elements(elements.clone());
        ordering.save_state(StateId::External(0));
        ordering.swap(0, 2);
        ordering.restore_state(StateId::External(0));
        let restored: Vec<i32> = ordering.value().iter().map(|e| **e).collect();
        assert_eq!(restored, vec![0, 1, 2]);
    }
}
