// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bio::stats::LogProb;
use ndarray::Array2;
use statrs::distribution::Continuous;
use statrs::function::gamma::ln_gamma;

use crate::core::cache::{DirtyCell, DirtyListener};
use crate::core::checkpoint::{register_cacheable_checkpoint_target, CheckpointCell};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::Likelihood;

/// Zero-truncated geometric over `1..=max_count`, as a normalised
/// probability vector with a zero leading element.
pub struct ZtGeometric {
    max_count: usize,
    prob: Rc<Parameter<f64>>,
    value: RefCell<Vec<f64>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<Vec<f64>>,
}

impl ZtGeometric {
    pub fn new(prob: &Rc<Parameter<f64>>, max_count: usize) -> Rc<Self> {
        let node = Rc::new(ZtGeometric {
            max_count,
            prob: prob.clone(),
            value: RefCell::new(vec![0.0; max_count + 1]),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**prob, &node);
        let weak = Rc::downgrade(&node);
        prob.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}

impl Computation<Vec<f64>> for ZtGeometric {
    fn peek(&self) -> Vec<f64> {
        self.value.borrow().clone()
    }

    fn value(&self) -> Vec<f64> {
        if self.cell.is_dirty() {
            let p = self.prob.value();
            let mut value = self.value.borrow_mut();
            let mut total = 0.0;
            for j in 1..=self.max_count {
                value[j] = (1.0 - p).powi(j as i32) * p;
                total += value[j];
            }
            for v in value.iter_mut() {
                *v /= total;
            }
            value[0] = 0.0;
            drop(value);
            self.cell.set_clean();
        }
        self.value.borrow().clone()
    }
}

crate::impl_cacheable!(ZtGeometric, cell);
crate::impl_checkpointable_refcell!(ZtGeometric, ckpt, value);

/// Zero-truncated Poisson over `1..=max_count`.
pub struct ZtPoisson {
    max_count: usize,
    mean: Rc<Parameter<f64>>,
    value: RefCell<Vec<f64>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<Vec<f64>>,
}

impl ZtPoisson {
    pub fn new(mean: &Rc<Parameter<f64>>, max_count: usize) -> Rc<Self> {
        let node = Rc::new(ZtPoisson {
            max_count,
            mean: mean.clone(),
            value: RefCell::new(vec![0.0; max_count + 1]),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**mean, &node);
        let weak = Rc::downgrade(&node);
        mean.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}

impl Computation<Vec<f64>> for ZtPoisson {
    fn peek(&self) -> Vec<f64> {
        self.value.borrow().clone()
    }

    fn value(&self) -> Vec<f64> {
        if self.cell.is_dirty() {
            let lambda = self.mean.value();
            let mut value = self.value.borrow_mut();
            let mut total = 0.0;
            for j in 1..=self.max_count {
                let ln_pmf =
                    j as f64 * lambda.ln() - lambda - ln_gamma(j as f64 + 1.0);
                value[j] = ln_pmf.exp();
                total += value[j];
            }
            for v in value.iter_mut() {
                *v /= total;
            }
            value[0] = 0.0;
            drop(value);
            self.cell.set_clean();
        }
        self.value.borrow().clone()
    }
}

crate::impl_cacheable!(ZtPoisson, cell);
crate::impl_checkpointable_refcell!(ZtPoisson, ckpt, value);

/// Zero-truncated multiplicative binomial: a `(k+1) x (k+1)` row-stochastic
/// matrix where row `j` distributes `0..=j` successes as
/// `C(j,k) p^k (1-p)^{j-k} a^{k(j-k)}` row-normalised, and row 0 is zero.
/// The three integer exponent matrices and the binomial-coefficient matrix
/// are precomputed once.
pub struct ZtMultiplicativeBinomial {
    prob: Rc<Parameter<f64>>,
    assoc: Rc<Parameter<f64>>,
    successes: Array2<f64>,
    failures: Array2<f64>,
    interactions: Array2<f64>,
    combinations: Array2<f64>,
    value: RefCell<Array2<f64>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<Array2<f64>>,
}

impl ZtMultiplicativeBinomial {
    pub fn new(
        prob: &Rc<Parameter<f64>>,
        assoc: &Rc<Parameter<f64>>,
        max_count: usize,
    ) -> Rc<Self> {
        let dim = max_count + 1;
        let mut successes = Array2::zeros((dim, dim));
        let mut failures = Array2::zeros((dim, dim));
        let mut interactions = Array2::zeros((dim, dim));
        let mut combinations = Array2::zeros((dim, dim));
        for j in 0..dim {
            for k in 0..=j {
                successes[(j, k)] = k as f64;
                failures[(j, k)] = (j - k) as f64;
                interactions[(j, k)] = (k * (j - k)) as f64;
                combinations[(j, k)] = if j == 0 || k == 0 {
                    0.0
                } else {
                    binomial_coefficient(j, k)
                };
            }
        }
        let node = Rc::new(ZtMultiplicativeBinomial {
            prob: prob.clone(),
            assoc: assoc.clone(),
            successes,
            failures,
            interactions,
            combinations,
            value: RefCell::new(Array2::zeros((dim, dim))),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        for param in &[prob, assoc] {
            register_cacheable_checkpoint_target(&***param, &node);
            let weak = Rc::downgrade(&node);
            param.add_post_change_listener(Rc::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.cell.set_dirty();
                }
            }));
        }
        node.value();
        node
    }
}

impl Computation<Array2<f64>> for ZtMultiplicativeBinomial {
    fn peek(&self) -> Array2<f64> {
        self.value.borrow().clone()
    }

    fn value(&self) -> Array2<f64> {
        if self.cell.is_dirty() {
            let p = self.prob.value();
            let a = self.assoc.value();
            let dim = self.combinations.nrows();
            let mut matrix = Array2::zeros((dim, dim));
            for j in 1..dim {
                let mut row_total = 0.0;
                for k in 0..=j {
                    let weight = self.combinations[(j, k)]
                        * p.powf(self.successes[(j, k)])
                        * (1.0 - p).powf(self.failures[(j, k)])
                        * a.powf(self.interactions[(j, k)]);
                    matrix[(j, k)] = weight;
                    row_total += weight;
                }
                if row_total > 0.0 {
                    for k in 0..=j {
                        matrix[(j, k)] /= row_total;
                    }
                }
            }
            *self.value.borrow_mut() = matrix;
            self.cell.set_clean();
        }
        self.value.borrow().clone()
    }
}

crate::impl_cacheable!(ZtMultiplicativeBinomial, cell);
crate::impl_checkpointable_refcell!(ZtMultiplicativeBinomial, ckpt, value);

fn binomial_coefficient(n: usize, k: usize) -> f64 {
    (ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)).exp()
}

/// A discrete probability vector over days, e.g. an infection-duration prior.
#[derive(Debug, Clone)]
pub struct DiscreteDistribution {
    probabilities: Vec<f64>,
}

impl DiscreteDistribution {
    pub fn new(mut probabilities: Vec<f64>) -> Self {
        assert!(!probabilities.is_empty());
        let total: f64 = probabilities.iter().sum();
        assert!(total > 0.0);
        for p in &mut probabilities {
            *p /= total;
        }
        DiscreteDistribution { probabilities }
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    pub fn ln_pmf(&self, day: usize) -> f64 {
        match self.probabilities.get(day) {
            Some(p) if *p > 0.0 => p.ln(),
            _ => f64::NEG_INFINITY,
        }
    }
}

/// Log-likelihood of an infection duration under a discrete duration prior.
pub struct DurationLikelihood {
    duration: Rc<Parameter<f64>>,
    prior: Rc<DiscreteDistribution>,
    label: String,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl DurationLikelihood {
    pub fn new(
        duration: &Rc<Parameter<f64>>,
        prior: &Rc<DiscreteDistribution>,
        label: &str,
    ) -> Rc<Self> {
        let node = Rc::new(DurationLikelihood {
            duration: duration.clone(),
            prior: prior.clone(),
            label: label.to_owned(),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**duration, &node);
        let weak = Rc::downgrade(&node);
        duration.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }
}

impl Computation<Likelihood> for DurationLikelihood {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let duration = self.duration.value();
            let llik = if duration < 0.0 {
                f64::NEG_INFINITY
            } else {
                self.prior.ln_pmf(duration.floor() as usize)
            };
            self.value.set(llik);
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for DurationLikelihood {
    fn identifier(&self) -> String {
        format!("DurationLikelihood<{}>", self.label)
    }
}

crate::impl_cacheable!(DurationLikelihood, cell);
crate::impl_checkpointable_cell!(DurationLikelihood, ckpt, value);

/// Gamma log-density prior on a positive scalar parameter (shape/scale).
pub struct GammaLogPdf {
    x: Rc<Parameter<f64>>,
    dist: statrs::distribution::Gamma,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl GammaLogPdf {
    pub fn new(x: &Rc<Parameter<f64>>, shape: f64, scale: f64) -> Rc<Self> {
        let node = Rc::new(GammaLogPdf {
            x: x.clone(),
            dist: statrs::distribution::Gamma::new(shape, 1.0 / scale)
                .expect("invalid gamma prior"),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**x, &node);
        let weak = Rc::downgrade(&node);
        x.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }
}

impl Computation<Likelihood> for GammaLogPdf {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let x = self.x.value();
            let llik = if x > 0.0 {
                self.dist.ln_pdf(x)
            } else {
                f64::NEG_INFINITY
            };
            self.value.set(llik);
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for GammaLogPdf {
    fn identifier(&self) -> String {
        format!("GammaLogPdf<{}>", self.x.label())
    }
}

crate::impl_cacheable!(GammaLogPdf, cell);
crate::impl_checkpointable_cell!(GammaLogPdf, ckpt, value);

/// Beta log-density prior on a unit-interval parameter.
pub struct BetaLogPdf {
    x: Rc<Parameter<f64>>,
    dist: statrs::distribution::Beta,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl BetaLogPdf {
    pub fn new(x: &Rc<Parameter<f64>>, alpha: f64, beta: f64) -> Rc<Self> {
        let node = Rc::new(BetaLogPdf {
            x: x.clone(),
            dist: statrs::distribution::Beta::new(alpha, beta).expect("invalid beta prior"),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**x, &node);
        let weak = Rc::downgrade(&node);
        x.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }
}

impl Computation<Likelihood> for BetaLogPdf {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let x = self.x.value();
            let llik = if x > 0.0 && x < 1.0 {
                self.dist.ln_pdf(x)
            } else {
                f64::NEG_INFINITY
            };
            self.value.set(llik);
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for BetaLogPdf {
    fn identifier(&self) -> String {
        format!("BetaLogPdf<{}>", self.x.label())
    }
}

crate::impl_cacheable!(BetaLogPdf, cell);
crate::impl_checkpointable_cell!(BetaLogPdf, ckpt, value);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::core::cache::Cacheable;
    use crate::core::checkpoint::{Checkpointable, StateId};

    #[test]
    fn zt_geometric_is_normalised_and_zero_truncated() {
        let p = Parameter::new(0.5f64);
        let dist = ZtGeometric::new(&p, 10);
        let value = dist.value();
        assert_eq!(value[0], 0.0);
        assert_relative_eq!(value.iter().sum::<f64>(), 1.0, epsilon = 1e-9);

        p.save_state(StateId::External(0));
        p.set_value(0.2);
        let value = dist.value();
        assert_relative_eq!(value.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        p.accept_state();
    }

    #[test]
    fn zt_poisson_matches_direct_pmf() {
        let mean = Parameter::new(2.0f64);
        let dist = ZtPoisson::new(&mean, 8);
        let value = dist.value();
        // ratio of consecutive zero-truncated poisson masses is lambda/(j+1)
        assert_relative_eq!(value[2] / value[1], 2.0 / 2.0, epsilon = 1e-9);
        assert_relative_eq!(value[3] / value[2], 2.0 / 3.0, epsilon = 1e-9);
        assert_eq!(value[0], 0.0);
    }

    #[test]
    fn zt_poisson_tracks_its_parameter() {
        let mean = Parameter::new(1.0f64);
        let dist = ZtPoisson::new(&mean, 6);
        let before = dist.value();
        mean.save_state(StateId::External(0));
        mean.set_value(4.0);
        assert!(dist.is_dirty());
        let after = dist.value();
        assert!(after[4] > before[4]);
        mean.restore_state(StateId::External(0));
        let restored = dist.value();
        assert_relative_eq!(restored[4], before[4], epsilon = 1e-12);
    }

    #[test]
    fn multiplicative_binomial_rows_are_stochastic() {
        let p = Parameter::new(0.6f64);
        let a = Parameter::new(0.9f64);
        let dist = ZtMultiplicativeBinomial::new(&p, &a, 5);
        let matrix = dist.value();
        for j in 1..6 {
            let row_sum: f64 = (0..6).map(|k| matrix[(j, k)]).sum();
            assert_relative_eq!(row_sum, 1.0, epsilon = 1e-9);
        }
        let row0: f64 = (0..6).map(|k| matrix[(0, k)]).sum();
        assert_eq!(row0, 0.0);
    }

    #[test]
    fn duration_likelihood_indexes_the_prior() {
        let prior = Rc::new(DiscreteDistribution::new(vec![0.25; 4]));
        let duration = Parameter::new(2.4f64);
        let node = DurationLikelihood::new(&duration, &prior, "inf1");
        assert_relative_eq!(*node.value(), 0.25f64.ln(), epsilon = 1e-12);
        duration.save_state(StateId::External(0));
        duration.set_value(9.0);
        assert_eq!(*node.value(), f64::NEG_INFINITY);
        duration.restore_state(StateId::External(0));
        assert_relative_eq!(*node.value(), 0.25f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn priors_reject_out_of_domain_values() {
        let x = Parameter::new(0.5f64);
        let beta = BetaLogPdf::new(&x, 2.0, 2.0);
        assert!((*beta.value()).is_finite());
        x.save_state(StateId::External(0));
        x.set_value(1.5);
        assert_eq!(*beta.value(), f64::NEG_INFINITY);
        x.restore_state(StateId::External(0));

        let y = Parameter::new(3.0f64);
        let gamma = GammaLogPdf::new(&y, 2.0, 1.0);
        assert!((*gamma.value()).is_finite());
    }
}
