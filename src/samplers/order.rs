// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::Cell;
use std::rc::Rc;

use rand::Rng;

use crate::core::checkpoint::{Checkpointable, StateId};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::ordering::Ordering;
use crate::model::infection::Infection;
use crate::samplers::{Kernel, SharedRng, Tally};
use crate::utils::{exp_normalize, log_sum_exp};

type InfectionOrdering = Ordering<Rc<Infection>>;

/// Swap a random pivot with a position up to `max_distance` away.
pub struct OrderSampler {
    ordering: Rc<InfectionOrdering>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    max_distance: usize,
    tally: Tally,
    total_updates: Cell<u64>,
}

impl OrderSampler {
    pub fn new(
        ordering: &Rc<InfectionOrdering>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        max_distance: usize,
    ) -> Self {
        assert!(max_distance >= 1);
        assert!(max_distance <= ordering.len() / 2);
        OrderSampler {
            ordering: ordering.clone(),
            target: target.clone(),
            rng: rng.clone(),
            max_distance,
            tally: Tally::new(),
            total_updates: Cell::new(0),
        }
    }

    fn sample_proposal(&self) -> (usize, usize) {
        let elements = self.ordering.len();
        let mut rng = self.rng.borrow_mut();
        let offset = rng.gen_range(1..=self.max_distance);
        let positive: bool = rng.gen::<f64>() > 0.5;
        if positive {
            let pivot = rng.gen_range(0..elements - offset);
            (pivot, pivot + offset)
        } else {
            let pivot = rng.gen_range(offset..elements);
            (pivot, pivot - offset)
        }
    }
}

impl Kernel for OrderSampler {
    fn update(&self) {
        let current_llik = *self.target.value();
        self.ordering.save_state(StateId::Order);

        let (pivot, other) = self.sample_proposal();
        self.ordering.swap(other, pivot);

        let ratio = *self.target.value() - current_llik;
        let u: f64 = self.rng.borrow_mut().gen();
        if u.ln() <= ratio {
            self.tally.accept();
            self.ordering.accept_state();
        } else {
            self.tally.reject();
            self.ordering.restore_state(StateId::Order);
        }
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        "OrderSampler".to_owned()
    }
}

fn sample_categorical(rng: &SharedRng, probabilities: &[f64]) -> usize {
    let u: f64 = rng.borrow_mut().gen();
    let mut cumulative = 0.0;
    for (idx, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return idx;
        }
    }
    probabilities.len() - 1
}

/// Locally informed order move: weight every adjacent swap by the square
/// root of the posterior it leads to, sample one, and correct with the
/// reverse neighbourhood normaliser.
pub struct ZanellaNeighborOrderSampler {
    ordering: Rc<InfectionOrdering>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    tally: Tally,
    total_updates: Cell<u64>,
}

impl ZanellaNeighborOrderSampler {
    pub fn new(
        ordering: &Rc<InfectionOrdering>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
    ) -> Self {
        ZanellaNeighborOrderSampler {
            ordering: ordering.clone(),
            target: target.clone(),
            rng: rng.clone(),
            tally: Tally::new(),
            total_updates: Cell::new(0),
        }
    }

    /// Half log-posterior after each adjacent swap, evaluated under a
    /// scratch snapshot.
    fn neighborhood_logliks(&self) -> Vec<f64> {
        let elements = self.ordering.len();
        let mut neighborhood = Vec::with_capacity(elements - 1);
        for i in 0..elements - 1 {
            self.ordering.save_state(StateId::Scratch);
            self.ordering.swap(i, i + 1);
            let half = 0.5 * *self.target.value();
            if half.is_nan() {
                warn!("NaN posterior while scoring an order neighbourhood");
            }
            neighborhood.push(half);
            self.ordering.restore_state(StateId::Scratch);
        }
        neighborhood
    }
}

impl Kernel for ZanellaNeighborOrderSampler {
    fn update(&self) {
        let state_id = StateId::ZanellaNeighborOrder;
        self.ordering.save_state(state_id);
        let current_llik = *self.target.value();

        let current_neighborhood = self.neighborhood_logliks();
        let current_logsum = log_sum_exp(&current_neighborhood);

        if current_logsum == f64::NEG_INFINITY {
            self.tally.reject();
            self.ordering.restore_state(state_id);
        } else {
            let weights = exp_normalize(&current_neighborhood);
            let proposal = sample_categorical(&self.rng, &weights);
            self.ordering.swap(proposal, proposal + 1);

            let proposed_llik = *self.target.value();
            if proposed_llik == f64::NEG_INFINITY {
                self.tally.reject();
                self.ordering.restore_state(state_id);
            } else {
                let proposed_logsum = log_sum_exp(&self.neighborhood_logliks());
                let ratio = 0.5 * proposed_llik - 0.5 * current_llik + current_logsum
                    - proposed_logsum;
                let u: f64 = self.rng.borrow_mut().gen();
                if u.ln() <= ratio {
                    self.tally.accept();
                    self.ordering.accept_state();
                } else {
                    self.tally.reject();
                    self.ordering.restore_state(state_id);
                }
            }
        }
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        "ZanellaNeighborOrderSampler".to_owned()
    }
}

/// Locally informed move over a windowed neighbourhood: a random pivot may
/// swap with any position within `neighborhood_size`.
pub struct ZanellaOrderSampler {
    ordering: Rc<InfectionOrdering>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    neighborhood_size: usize,
    tally: Tally,
    total_updates: Cell<u64>,
}

impl ZanellaOrderSampler {
    pub fn new(
        ordering: &Rc<InfectionOrdering>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        neighborhood_size: usize,
    ) -> Self {
        assert!(neighborhood_size >= 1);
        ZanellaOrderSampler {
            ordering: ordering.clone(),
            target: target.clone(),
            rng: rng.clone(),
            neighborhood_size,
            tally: Tally::new(),
            total_updates: Cell::new(0),
        }
    }

    /// Candidate swap positions around `pivot` and the half log-posterior of
    /// each candidate swap.
    fn neighborhood_logliks(&self, pivot: usize) -> (Vec<usize>, Vec<f64>) {
        let elements = self.ordering.len();
        let low = pivot.saturating_sub(self.neighborhood_size);
        let high = (pivot + self.neighborhood_size).min(elements - 1);
        let mut candidates = Vec::new();
        let mut logliks = Vec::new();
        for other in low..=high {
            if other == pivot {
                continue;
            }
            self.ordering.save_state(StateId::Scratch);
            self.ordering.swap(pivot, other);
            candidates.push(other);
            logliks.push(0.5 * *self.target.value());
            self.ordering.restore_state(StateId::Scratch);
        }
        (candidates, logliks)
    }
}

impl Kernel for ZanellaOrderSampler {
    fn update(&self) {
        let state_id = StateId::ZanellaOrder;
        self.ordering.save_state(state_id);
        let current_llik = *self.target.value();
        let pivot = self.rng.borrow_mut().gen_range(0..self.ordering.len());

        let (candidates, current_neighborhood) = self.neighborhood_logliks(pivot);
        let current_logsum = log_sum_exp(&current_neighborhood);

        if current_logsum == f64::NEG_INFINITY {
            self.tally.reject();
            self.ordering.restore_state(state_id);
        } else {
            let weights = exp_normalize(&current_neighborhood);
            let proposal = candidates[sample_categorical(&self.rng, &weights)];
            self.ordering.swap(pivot, proposal);

            let proposed_llik = *self.target.value();
            if proposed_llik == f64::NEG_INFINITY {
                self.tally.reject();
                self.ordering.restore_state(state_id);
            } else {
                let (_, proposed_neighborhood) = self.neighborhood_logliks(proposal);
                let proposed_logsum = log_sum_exp(&proposed_neighborhood);
                let ratio = 0.5 * proposed_llik - 0.5 * current_llik + current_logsum
                    - proposed_logsum;
                let u: f64 = self.rng.borrow_mut().gen();
                if u.ln() <= ratio {
                    self.tally.accept();
                    self.ordering.accept_state();
                } else {
                    self.tally.reject();
                    self.ordering.restore_state(state_id);
                }
            }
        }
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        "ZanellaOrderSampler".to_owned()
    }
}
