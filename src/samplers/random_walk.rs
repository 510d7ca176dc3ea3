// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::Cell;
use std::rc::Rc;

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;

use crate::core::checkpoint::{Checkpointable, StateId};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::samplers::{Kernel, SharedRng, Tally};
use crate::utils::{expit, logit};

/// Shared accept/reject cycle for scalar proposals.
#[allow(clippy::too_many_arguments)]
fn metropolis_step(
    parameter: &Rc<Parameter<f64>>,
    target: &Rc<dyn LikelihoodNode>,
    rng: &SharedRng,
    state_id: StateId,
    tally: &Tally,
    proposal: f64,
    adjustment: f64,
    debug: bool,
    label: &str,
) {
    let current_llik = *target.value();
    parameter.save_state(state_id);
    parameter.set_value(proposal);
    let proposed_llik = *target.value();
    let ratio = proposed_llik - current_llik + adjustment;

    if debug {
        debug!(
            "{}: proposal {} ratio {:.4} ({} -> {})",
            label,
            proposal,
            ratio,
            current_llik,
            proposed_llik
        );
    }

    let u: f64 = rng.borrow_mut().gen();
    if u.ln() <= ratio {
        tally.accept();
        parameter.accept_state();
    } else {
        tally.reject();
        parameter.restore_state(state_id);
    }
}

fn adapt_variance(
    variance: &Cell<f64>,
    rate: f64,
    target_rate: f64,
    step: f64,
    adaptation_rate: f64,
    min_variance: f64,
    max_variance: f64,
) {
    let mut updated = variance.get() + (rate - target_rate) / step.powf(adaptation_rate);
    if updated.is_nan() {
        updated = min_variance;
    }
    variance.set(updated.max(min_variance).min(max_variance));
}

/// Symmetric gaussian random walk on an unconstrained scalar parameter.
pub struct ContinuousRandomWalk {
    parameter: Rc<Parameter<f64>>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    variance: Cell<f64>,
    min_variance: f64,
    max_variance: f64,
    adaptation_rate: f64,
    target_acceptance_rate: f64,
    total_updates: Cell<u64>,
    tally: Tally,
    debug: Cell<bool>,
}

impl ContinuousRandomWalk {
    pub fn new(
        parameter: &Rc<Parameter<f64>>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        variance: f64,
        min_variance: f64,
        max_variance: f64,
    ) -> Self {
        assert!(variance > 0.0);
        ContinuousRandomWalk {
            parameter: parameter.clone(),
            target: target.clone(),
            rng: rng.clone(),
            variance: Cell::new(variance),
            min_variance,
            max_variance,
            adaptation_rate: 0.66,
            target_acceptance_rate: 0.23,
            total_updates: Cell::new(0),
            tally: Tally::new(),
            debug: Cell::new(false),
        }
    }

    pub fn variance(&self) -> f64 {
        self.variance.get()
    }

    fn sample_proposal(&self) -> f64 {
        let step = Normal::new(0.0, 1.0).unwrap().sample(&mut *self.rng.borrow_mut());
        self.parameter.value() + step * self.variance.get()
    }
}

impl Kernel for ContinuousRandomWalk {
    fn update(&self) {
        let proposal = self.sample_proposal();
        metropolis_step(
            &self.parameter,
            &self.target,
            &self.rng,
            StateId::ContinuousWalk,
            &self.tally,
            proposal,
            0.0,
            self.debug.get(),
            &self.parameter.label(),
        );
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn adapt(&self) {
        adapt_variance(
            &self.variance,
            self.tally.rate(),
            self.target_acceptance_rate,
            self.total_updates.get() as f64 + 1.0,
            self.adaptation_rate,
            self.min_variance,
            self.max_variance,
        );
    }

    fn adapt_scaled(&self, step: u64) {
        adapt_variance(
            &self.variance,
            self.tally.rate(),
            self.target_acceptance_rate,
            step.max(1) as f64,
            self.adaptation_rate,
            self.min_variance,
            self.max_variance,
        );
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        format!("ContinuousRandomWalk<{}>", self.parameter.label())
    }

    fn set_debug(&self, debug: bool) {
        self.debug.set(debug);
    }
}

/// Gaussian random walk on the logit scale of a `(lower, upper)`-bounded
/// scalar; the back-transform contributes a log-Jacobian adjustment.
pub struct BoundedContinuousRandomWalk {
    parameter: Rc<Parameter<f64>>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    lower: f64,
    upper: f64,
    variance: Cell<f64>,
    min_variance: f64,
    max_variance: f64,
    adaptation_rate: f64,
    target_acceptance_rate: f64,
    total_updates: Cell<u64>,
    tally: Tally,
    debug: Cell<bool>,
}

impl BoundedContinuousRandomWalk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parameter: &Rc<Parameter<f64>>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        lower: f64,
        upper: f64,
        variance: f64,
        min_variance: f64,
        max_variance: f64,
    ) -> Self {
        assert!(lower < upper);
        BoundedContinuousRandomWalk {
            parameter: parameter.clone(),
            target: target.clone(),
            rng: rng.clone(),
            lower,
            upper,
            variance: Cell::new(variance),
            min_variance,
            max_variance,
            adaptation_rate: 0.66,
            target_acceptance_rate: 0.23,
            total_updates: Cell::new(0),
            tally: Tally::new(),
            debug: Cell::new(false),
        }
    }

    pub fn variance(&self) -> f64 {
        self.variance.get()
    }

    fn sample_proposal(&self) -> f64 {
        let step = Normal::new(0.0, 1.0).unwrap().sample(&mut *self.rng.borrow_mut())
            * self.variance.get();
        let current = self.parameter.value();
        let span = self.upper - self.lower;
        let unconstrained = logit((current - self.lower) / span) + step;
        let proposal = self.lower + span * expit(unconstrained);
        proposal.max(self.lower).min(self.upper)
    }

    fn adjustment(&self, current: f64, proposal: f64) -> f64 {
        (proposal - self.lower).ln() + (self.upper - proposal).ln()
            - (current - self.lower).ln()
            - (self.upper - current).ln()
    }
}

impl Kernel for BoundedContinuousRandomWalk {
    fn update(&self) {
        let current = self.parameter.value();
        let proposal = self.sample_proposal();
        let adjustment = self.adjustment(current, proposal);
        metropolis_step(
            &self.parameter,
            &self.target,
            &self.rng,
            StateId::BoundedWalk,
            &self.tally,
            proposal,
            adjustment,
            self.debug.get(),
            &self.parameter.label(),
        );
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn adapt(&self) {
        adapt_variance(
            &self.variance,
            self.tally.rate(),
            self.target_acceptance_rate,
            self.total_updates.get() as f64 + 1.0,
            self.adaptation_rate,
            self.min_variance,
            self.max_variance,
        );
    }

    fn adapt_scaled(&self, step: u64) {
        adapt_variance(
            &self.variance,
            self.tally.rate(),
            self.target_acceptance_rate,
            step.max(1) as f64,
            self.adaptation_rate,
            self.min_variance,
            self.max_variance,
        );
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        format!("BoundedContinuousRandomWalk<{}>", self.parameter.label())
    }

    fn set_debug(&self, debug: bool) {
        self.debug.set(debug);
    }
}
