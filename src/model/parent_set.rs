// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use crate::core::cache::DirtyCell;
use crate::core::checkpoint::{register_cacheable_checkpoint_target, CheckpointCell};
use crate::core::computation::Computation;
use crate::core::events::{EventBus, ListenerId};
use crate::core::ordering::Ordering;
use crate::model::infection::Infection;

/// The set of candidate parents of a child, keyed by infection id so that
/// iteration order (and therefore hypothesis enumeration) is deterministic.
pub type ParentSet = BTreeMap<String, Rc<Infection>>;

pub type ElementListener = Rc<dyn Fn(&Rc<Infection>)>;

/// Maintains, for one child, the set of infections preceding it in the
/// ordering minus the explicitly disallowed ones. Updates are driven by the
/// ordering's keyed crossing events; a full scan happens only at
/// construction.
pub struct OrderDerivedParentSet {
    child: Rc<Infection>,
    disallowed: HashSet<String>,
    value: RefCell<ParentSet>,
    element_added: RefCell<EventBus<ElementListener>>,
    element_removed: RefCell<EventBus<ElementListener>>,
    element_changed: RefCell<EventBus<ElementListener>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<ParentSet>,
}

impl OrderDerivedParentSet {
    pub fn new(
        ordering: &Rc<Ordering<Rc<Infection>>>,
        child: &Rc<Infection>,
        disallowed: HashSet<String>,
    ) -> Rc<Self> {
        let set = Rc::new(OrderDerivedParentSet {
            child: child.clone(),
            disallowed,
            value: RefCell::new(ParentSet::new()),
            element_added: RefCell::new(EventBus::new()),
            element_removed: RefCell::new(EventBus::new()),
            element_changed: RefCell::new(EventBus::new()),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });

        // initial scan: everything left of the child
        {
            let mut value = set.value.borrow_mut();
            for element in ordering.value() {
                if Rc::ptr_eq(&element, child) {
                    break;
                }
                if !set.disallowed.contains(element.id()) {
                    value.insert(element.id().clone(), element.clone());
                }
            }
        }
        set.cell.set_clean();

        register_cacheable_checkpoint_target(&**ordering, &set);

        {
            let weak = Rc::downgrade(&set);
            ordering.add_moved_left_listener(
                child,
                Rc::new(move |element: &Rc<Infection>| {
                    if let Some(set) = weak.upgrade() {
                        set.insert(element);
                    }
                }),
            );
        }
        {
            let weak = Rc::downgrade(&set);
            ordering.add_moved_right_listener(
                child,
                Rc::new(move |element: &Rc<Infection>| {
                    if let Some(set) = weak.upgrade() {
                        set.erase(element);
                    }
                }),
            );
        }

        // a genotype change of a current member is reported as
        // `element_changed`; candidates outside the set are ignored at fire
        // time so that restores never have to rewire subscriptions
        for candidate in ordering.value() {
            if Rc::ptr_eq(&candidate, child) || set.disallowed.contains(candidate.id()) {
                continue;
            }
            for locus in candidate.loci().to_vec() {
                let weak = Rc::downgrade(&set);
                let member = candidate.clone();
                candidate
                    .latent_genotype(&locus)
                    .add_post_change_listener(Rc::new(move || {
                        if let Some(set) = weak.upgrade() {
                            if set.value.borrow().contains_key(member.id()) {
                                set.fire(&set.element_changed, &member);
                                set.cell.set_dirty();
                            }
                        }
                    }));
            }
        }

        set
    }

    pub fn child(&self) -> &Rc<Infection> {
        &self.child
    }

    pub fn add_element_added_listener(&self, listener: ElementListener) -> ListenerId {
        self.element_added.borrow_mut().add(listener)
    }

    pub fn add_element_removed_listener(&self, listener: ElementListener) -> ListenerId {
        self.element_removed.borrow_mut().add(listener)
    }

    pub fn add_element_changed_listener(&self, listener: ElementListener) -> ListenerId {
        self.element_changed.borrow_mut().add(listener)
    }

    fn insert(&self, element: &Rc<Infection>) {
        if self.disallowed.contains(element.id()) {
            return;
        }
        self.value
            .borrow_mut()
            .insert(element.id().clone(), element.clone());
        self.fire(&self.element_added, element);
        self.cell.set_dirty();
    }

    fn erase(&self, element: &Rc<Infection>) {
        if self.value.borrow_mut().remove(element.id()).is_some() {
            self.fire(&self.element_removed, element);
            self.cell.set_dirty();
        }
    }

    fn fire(&self, bus: &RefCell<EventBus<ElementListener>>, element: &Rc<Infection>) {
        let mut idx = 0;
        loop {
            let listener = bus.borrow().get_cloned(idx);
            match listener {
                Some(listener) => listener(element),
                None => break,
            }
            idx += 1;
        }
    }
}

impl Computation<ParentSet> for OrderDerivedParentSet {
    fn peek(&self) -> ParentSet {
        self.value.borrow().clone()
    }

    fn value(&self) -> ParentSet {
        self.cell.set_clean();
        self.value.borrow().clone()
    }
}

crate::impl_cacheable!(OrderDerivedParentSet, cell);
crate::impl_checkpointable_refcell!(OrderDerivedParentSet, ckpt, value);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::{Checkpointable, StateId};
    use std::collections::HashMap;

    fn make_infection(id: &str) -> Rc<Infection> {
        Infection::new(id, 0, false, 10.0, Vec::new(), &HashMap::new())
    }

    #[test]
    fn tracks_preceding_elements() {
        let infections: Vec<_> = (0..4).map(|i| make_infection(&format!("i{}", i))).collect();
        let ordering = Ordering::from_elements(infections.clone());
        let set = OrderDerivedParentSet::new(&ordering, &infections[0], HashSet::new());
        assert_eq!(set.value().len(), 0);

        ordering.save_state(StateId::External(0));
        ordering.swap(0, 1);
        assert_eq!(set.value().len(), 1);
        ordering.accept_state();

        ordering.save_state(StateId::External(0));
        ordering.swap(1, 2);
        assert_eq!(set.value().len(), 2);
        ordering.restore_state(StateId::External(0));
        assert_eq!(set.value().len(), 1);
    }

    #[test]
    fn matches_brute_force_after_random_swaps() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let infections: Vec<_> = (0..6).map(|i| make_infection(&format!("i{}", i))).collect();
        let ordering = Ordering::from_elements(infections.clone());
        let mut disallowed = HashSet::new();
        disallowed.insert("i3".to_owned());
        let sets: Vec<_> = infections
            .iter()
            .map(|inf| OrderDerivedParentSet::new(&ordering, inf, disallowed.clone()))
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = rng.gen_range(0..6);
            let b = rng.gen_range(0..6);
            ordering.swap(a, b);

            let order = ordering.value();
            for (inf, set) in infections.iter().zip(&sets) {
                let position = order
                    .iter()
                    .position(|el| Rc::ptr_eq(el, inf))
                    .unwrap();
                let expected: Vec<String> = order[..position]
                    .iter()
                    .filter(|el| !disallowed.contains(el.id()))
                    .map(|el| el.id().clone())
                    .collect();
                let mut expected_sorted = expected;
                expected_sorted.sort();
                let actual: Vec<String> = set.value().keys().cloned().collect();
                assert_eq!(actual, expected_sorted);
            }
        }
    }

    #[test]
    fn disallowed_parents_never_enter() {
        let infections: Vec<_> = (0..3).map(|i| make_infection(&format!("i{}", i))).collect();
        let ordering = Ordering::from_elements(infections.clone());
        let mut disallowed = HashSet::new();
        disallowed.insert("i0".to_owned());
        let set = OrderDerivedParentSet::new(&ordering, &infections[2], disallowed);
        assert_eq!(set.value().len(), 1);
        assert!(set.value().contains_key("i1"));
    }
}
