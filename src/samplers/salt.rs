// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

// Director et al. (2017), "Efficient sampling on the simplex with a
// self-adjusting logit transform proposal", J. Stat. Comput. Simul. 87(18).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

use crate::core::checkpoint::{Checkpointable, StateId};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::datatypes::Simplex;
use crate::samplers::{Kernel, SharedRng};
use crate::utils::{expit, logit, random_sequence};

/// Simplex-preserving random walk: each component in random order receives a
/// logit-scale gaussian step while the remaining components renormalise.
/// Proposals dipping under the floor are rejected without evaluating the
/// posterior.
pub struct SaltSampler {
    parameter: Rc<Parameter<Simplex>>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    variances: RefCell<Vec<f64>>,
    acceptances: RefCell<Vec<u32>>,
    rejections: RefCell<Vec<u32>>,
    min_variance: f64,
    max_variance: f64,
    adaptation_rate: f64,
    target_acceptance_rate: f64,
    lower_limit: f64,
    total_updates: Cell<u64>,
}

impl SaltSampler {
    pub fn new(
        parameter: &Rc<Parameter<Simplex>>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        variance: f64,
        min_variance: f64,
        max_variance: f64,
    ) -> Self {
        let components = parameter.value().len();
        SaltSampler {
            parameter: parameter.clone(),
            target: target.clone(),
            rng: rng.clone(),
            variances: RefCell::new(vec![variance; components]),
            acceptances: RefCell::new(vec![0; components]),
            rejections: RefCell::new(vec![0; components]),
            min_variance,
            max_variance,
            adaptation_rate: 1.0,
            target_acceptance_rate: 0.23,
            lower_limit: 0.01,
            total_updates: Cell::new(0),
        }
    }

    pub fn set_lower_limit(&mut self, lower_limit: f64) {
        self.lower_limit = lower_limit;
    }

    pub fn component_rate(&self, idx: usize) -> f64 {
        let accepted = self.acceptances.borrow()[idx] as f64;
        let rejected = self.rejections.borrow()[idx] as f64;
        if accepted + rejected == 0.0 {
            0.0
        } else {
            accepted / (accepted + rejected)
        }
    }

    pub fn variance(&self, idx: usize) -> f64 {
        self.variances.borrow()[idx]
    }

    fn adapt_with(&self, step: f64) {
        let mut variances = self.variances.borrow_mut();
        for idx in 0..variances.len() {
            let mut updated = variances[idx]
                + (self.component_rate(idx) - self.target_acceptance_rate)
                    / step.powf(self.adaptation_rate);
            if updated.is_nan() {
                updated = self.min_variance;
            }
            variances[idx] = updated.max(self.min_variance).min(self.max_variance);
        }
    }
}

impl Kernel for SaltSampler {
    fn update(&self) {
        let components = self.parameter.value().len();
        let order = random_sequence(0, components, &mut *self.rng.borrow_mut());

        for idx in order {
            let current_llik = *self.target.value();
            let current = self.parameter.value();
            let theta = current.get(idx);

            let eps = Normal::new(0.0, 1.0)
                .unwrap()
                .sample(&mut *self.rng.borrow_mut())
                * self.variances.borrow()[idx];
            let theta_prop = expit(logit(theta) + eps);

            // rescale the remaining components to absorb the change
            let factor = (1.0 - theta_prop) / (1.0 - theta);
            let mut values: Vec<f64> = current.frequencies().to_vec();
            for (j, value) in values.iter_mut().enumerate() {
                if j == idx {
                    *value = theta_prop;
                } else {
                    *value *= factor;
                }
            }

            if values.iter().any(|value| *value < self.lower_limit) {
                self.rejections.borrow_mut()[idx] += 1;
                continue;
            }

            self.parameter.save_state(StateId::Salt);
            self.parameter.set_value(Simplex::new(values));
            let proposed_llik = *self.target.value();

            let adjustment = (theta.ln() - theta_prop.ln())
                + (components as f64 - 1.0) * ((1.0 - theta).ln() - (1.0 - theta_prop).ln());
            let ratio = proposed_llik - current_llik + adjustment;

            let u: f64 = self.rng.borrow_mut().gen();
            if u.ln() <= ratio {
                self.acceptances.borrow_mut()[idx] += 1;
                self.parameter.accept_state();
            } else {
                self.rejections.borrow_mut()[idx] += 1;
                self.parameter.restore_state(StateId::Salt);
            }
        }

        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn adapt(&self) {
        self.adapt_with(self.total_updates.get() as f64 + 1.0);
    }

    fn adapt_scaled(&self, step: u64) {
        self.adapt_with(step.max(1) as f64);
    }

    fn acceptances(&self) -> u32 {
        self.acceptances.borrow().iter().sum()
    }

    fn rejections(&self) -> u32 {
        self.rejections.borrow().iter().sum()
    }

    fn identifier(&self) -> String {
        format!("SaltSampler<{}>", self.parameter.label())
    }
}
