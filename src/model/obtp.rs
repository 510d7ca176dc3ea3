// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use bio::stats::LogProb;
use itertools::Itertools;

use crate::core::cache::{Cacheable, DirtyCell, DirtyListener};
use crate::core::checkpoint::{
    register_cacheable_checkpoint_target, CheckpointCell, StateOp,
};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::errors;
use crate::model::infection::Infection;
use crate::model::node_transmission::NodeTransmission;
use crate::model::parent_set::{OrderDerivedParentSet, ParentSet};
use crate::model::source::SourceTransmissionProcess;
use crate::utils::{log_sum_exp, CombinationIndices};
use crate::Likelihood;

/// Upper bound on nested snapshot depth; a proposal that pushes past this is
/// a missed accept/restore and aborts loudly.
const MAX_SNAPSHOT_DEPTH: usize = 25;

type HypothesisKey = BTreeSet<String>;
type HypothesisCache = BTreeMap<HypothesisKey, f64>;

/// `ln p(child | ordering)`: the sum over every parent-set hypothesis drawn
/// from the order-derived candidate set, up to a cardinality bound, each with
/// and without the latent background parent.
///
/// Per-hypothesis log-likelihoods are cached by the id-set of the hypothesis
/// and invalidated declaratively: a change to one parent only evicts the
/// hypotheses containing it; a change to the child or the node-transmission
/// model evicts everything; a change to the latent parent or the source
/// process evicts the hypotheses containing the latent parent. Cache
/// snapshots live in a cursor-indexed stack so rejection restores both the
/// value and the memoised hypotheses in O(1).
pub struct OrderBasedTransmissionProcess {
    ntp: Rc<dyn NodeTransmission>,
    stp: Rc<SourceTransmissionProcess>,
    child: Rc<Infection>,
    parent_set: Rc<OrderDerivedParentSet>,
    latent_parent: Rc<Infection>,
    max_cardinality: usize,
    caches: RefCell<Vec<HypothesisCache>>,
    cursor: Cell<usize>,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl OrderBasedTransmissionProcess {
    pub(crate) fn new(
        ntp: &Rc<dyn NodeTransmission>,
        stp: &Rc<SourceTransmissionProcess>,
        child: &Rc<Infection>,
        parent_set: &Rc<OrderDerivedParentSet>,
        latent_parent: &Rc<Infection>,
        candidate_parents: &[Rc<Infection>],
        max_cardinality: usize,
    ) -> Result<Rc<Self>, errors::Error> {
        let process = Rc::new(OrderBasedTransmissionProcess {
            ntp: ntp.clone(),
            stp: stp.clone(),
            child: child.clone(),
            parent_set: parent_set.clone(),
            latent_parent: latent_parent.clone(),
            max_cardinality,
            caches: RefCell::new(vec![HypothesisCache::new()]),
            cursor: Cell::new(0),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });

        // node-transmission model changed: every hypothesis is stale
        register_cacheable_checkpoint_target(&**ntp, &process);
        {
            let weak = Rc::downgrade(&process);
            ntp.add_dirty_listener(DirtyListener::Hook(Rc::new(move || {
                if let Some(process) = weak.upgrade() {
                    process.clear_all();
                    process.cell.set_dirty();
                }
            })));
        }

        // source process changed: only latent-parent hypotheses are stale
        register_cacheable_checkpoint_target(&**stp, &process);
        {
            let weak = Rc::downgrade(&process);
            stp.add_dirty_listener(DirtyListener::Hook(Rc::new(move || {
                if let Some(process) = weak.upgrade() {
                    process.clear_latent();
                    process.cell.set_dirty();
                }
            })));
        }

        // the child's latent genotypes enter every hypothesis
        for locus in child.loci().to_vec() {
            let genotype = child.latent_genotype(&locus);
            register_cacheable_checkpoint_target(&*genotype, &process);
            let weak = Rc::downgrade(&process);
            genotype.add_post_change_listener(Rc::new(move || {
                if let Some(process) = weak.upgrade() {
                    process.clear_all();
                    process.cell.set_dirty();
                }
            }));
        }

        // the latent parent's genotypes enter the latent hypotheses only
        for locus in latent_parent.loci().to_vec() {
            let genotype = latent_parent.latent_genotype(&locus);
            register_cacheable_checkpoint_target(&*genotype, &process);
            let weak = Rc::downgrade(&process);
            genotype.add_post_change_listener(Rc::new(move || {
                if let Some(process) = weak.upgrade() {
                    process.clear_latent();
                    process.cell.set_dirty();
                }
            }));
        }

        // candidate parents: their genotype snapshots must reach this node
        // even while they sit outside the current parent set, because an
        // ordering move can bring them back within one proposal scope
        for candidate in candidate_parents {
            if Rc::ptr_eq(candidate, child) {
                continue;
            }
            for locus in candidate.loci().to_vec() {
                register_cacheable_checkpoint_target(
                    &*candidate.latent_genotype(&locus),
                    &process,
                );
            }
        }

        register_cacheable_checkpoint_target(&**parent_set, &process);
        {
            let weak = Rc::downgrade(&process);
            parent_set.add_element_added_listener(Rc::new(move |_| {
                if let Some(process) = weak.upgrade() {
                    // fresh hypotheses will simply miss and compute
                    process.cell.set_dirty();
                }
            }));
        }
        {
            let weak = Rc::downgrade(&process);
            parent_set.add_element_removed_listener(Rc::new(move |parent: &Rc<Infection>| {
                if let Some(process) = weak.upgrade() {
                    process.clear_parent(parent.id());
                    process.cell.set_dirty();
                }
            }));
        }
        {
            let weak = Rc::downgrade(&process);
            parent_set.add_element_changed_listener(Rc::new(move |parent: &Rc<Infection>| {
                if let Some(process) = weak.upgrade() {
                    process.clear_parent(parent.id());
                    process.cell.set_dirty();
                }
            }));
        }

        // cache snapshots move in lockstep with the value snapshots
        {
            let weak = Rc::downgrade(&process);
            process.ckpt.add_post_hook(Rc::new(move |op: &StateOp| {
                if let Some(process) = weak.upgrade() {
                    match op {
                        StateOp::Save(_) => process.push_cache_snapshot(),
                        StateOp::Restore(_) => {
                            let cursor = process.cursor.get();
                            assert!(cursor > 0, "transmission cache cursor underflow");
                            process.cursor.set(cursor - 1);
                        }
                        StateOp::Accept => {
                            let cursor = process.cursor.get();
                            process.caches.borrow_mut().swap(0, cursor);
                            process.cursor.set(0);
                        }
                    }
                }
            }));
        }

        process.cell.set_dirty();
        process.value();
        if process.value.get() == f64::NEG_INFINITY {
            let parents = process
                .parent_set
                .value()
                .keys()
                .cloned()
                .collect_vec()
                .join(", ");
            return Err(errors::Error::InfeasibleInitialState {
                infection: child.id().clone(),
                parents,
            });
        }
        Ok(process)
    }

    pub fn child(&self) -> &Rc<Infection> {
        &self.child
    }

    /// The per-hypothesis log-likelihoods backing the current value, for
    /// serialising the inferred network.
    pub fn hypothesis_distribution(&self) -> Vec<(Vec<String>, f64)> {
        self.value();
        let caches = self.caches.borrow();
        caches[self.cursor.get()]
            .iter()
            .map(|(key, llik)| (key.iter().cloned().collect(), *llik))
            .collect()
    }

    fn push_cache_snapshot(&self) {
        let cursor = self.cursor.get();
        assert!(
            cursor + 1 < MAX_SNAPSHOT_DEPTH,
            "transmission cache snapshot depth exceeded for child {}",
            self.child.id()
        );
        let snapshot = self.caches.borrow()[cursor].clone();
        let mut caches = self.caches.borrow_mut();
        if cursor + 1 == caches.len() {
            caches.push(snapshot);
        } else {
            caches[cursor + 1] = snapshot;
        }
        self.cursor.set(cursor + 1);
    }

    fn clear_all(&self) {
        self.caches.borrow_mut()[self.cursor.get()].clear();
    }

    fn clear_latent(&self) {
        let latent = self.latent_parent.id();
        self.caches.borrow_mut()[self.cursor.get()]
            .retain(|key, _| !key.contains(latent));
    }

    fn clear_parent(&self, parent: &str) {
        self.caches.borrow_mut()[self.cursor.get()]
            .retain(|key, _| !key.contains(parent));
    }

    fn lookup_or_compute(
        &self,
        key: HypothesisKey,
        compute: impl FnOnce() -> Likelihood,
    ) -> f64 {
        let cached = self.caches.borrow()[self.cursor.get()].get(&key).copied();
        match cached {
            Some(llik) => llik,
            None => {
                let llik = *compute();
                self.caches.borrow_mut()[self.cursor.get()].insert(key, llik);
                llik
            }
        }
    }
}

impl Computation<Likelihood> for OrderBasedTransmissionProcess {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let candidates: Vec<(String, Rc<Infection>)> = self
                .parent_set
                .peek()
                .into_iter()
                .collect();
            let mut lliks = Vec::new();

            // the lone latent background source
            let mut latent_key = HypothesisKey::new();
            latent_key.insert(self.latent_parent.id().clone());
            lliks.push(self.lookup_or_compute(latent_key.clone(), || {
                self.ntp
                    .loglik_latent_only(&self.child, &self.latent_parent, &*self.stp)
            }));

            // every subset of the candidate set, up to the cardinality bound,
            // with and without the latent parent
            for cardinality in 1..=self.max_cardinality.min(candidates.len()) {
                for combo in CombinationIndices::new(candidates.len(), cardinality) {
                    let subset: ParentSet = combo
                        .iter()
                        .map(|&idx| candidates[idx].clone())
                        .collect();
                    let key: HypothesisKey = subset.keys().cloned().collect();

                    lliks.push(self.lookup_or_compute(key.clone(), || {
                        self.ntp.loglik(&self.child, &subset)
                    }));

                    let mut key_with_latent = key;
                    key_with_latent.insert(self.latent_parent.id().clone());
                    lliks.push(self.lookup_or_compute(key_with_latent, || {
                        self.ntp.loglik_with_latent(
                            &self.child,
                            &self.latent_parent,
                            &subset,
                            &*self.stp,
                        )
                    }));
                }
            }

            self.value.set(log_sum_exp(&lliks));
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for OrderBasedTransmissionProcess {
    fn identifier(&self) -> String {
        format!("OrderBasedTransmissionProcess<{}>", self.child.id())
    }
}

crate::impl_cacheable!(OrderBasedTransmissionProcess, cell);
crate::impl_checkpointable_cell!(OrderBasedTransmissionProcess, ckpt, value);
