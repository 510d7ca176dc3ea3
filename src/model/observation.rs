// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bio::stats::LogProb;

use crate::core::cache::DirtyCell;
use crate::core::checkpoint::{
    register_cacheable_checkpoint_target, register_checkpoint_target, CheckpointCell,
};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::datatypes::Genotype;
use crate::Likelihood;

/// Pairwise allele counts treating the latent genotype as ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlleleCounts {
    pub true_positives: u32,
    pub false_positives: u32,
    pub true_negatives: u32,
    pub false_negatives: u32,
}

/// Counts observed-vs-latent agreement at one locus of one infection.
pub struct AlleleCounter {
    latent: Rc<Parameter<Genotype>>,
    observed: Rc<Parameter<Genotype>>,
    value: RefCell<AlleleCounts>,
    cell: DirtyCell,
    ckpt: CheckpointCell<AlleleCounts>,
}

impl AlleleCounter {
    pub fn new(latent: &Rc<Parameter<Genotype>>, observed: &Rc<Parameter<Genotype>>) -> Rc<Self> {
        let node = Rc::new(AlleleCounter {
            latent: latent.clone(),
            observed: observed.clone(),
            value: RefCell::new(AlleleCounts::default()),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        // the counter keeps its dirty flag across restores and re-derives
        // from the restored genotype on the next read
        register_checkpoint_target(&**latent, &node);
        let weak = Rc::downgrade(&node);
        latent.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }
}

impl Computation<AlleleCounts> for AlleleCounter {
    fn peek(&self) -> AlleleCounts {
        *self.value.borrow()
    }

    fn value(&self) -> AlleleCounts {
        if self.cell.is_dirty() {
            let latent = self.latent.value();
            let observed = self.observed.value();
            *self.value.borrow_mut() = AlleleCounts {
                true_positives: Genotype::true_positives(&latent, &observed),
                false_positives: Genotype::false_positives(&latent, &observed),
                true_negatives: Genotype::true_negatives(&latent, &observed),
                false_negatives: Genotype::false_negatives(&latent, &observed),
            };
            self.cell.set_clean();
        }
        *self.value.borrow()
    }
}

crate::impl_cacheable!(AlleleCounter, cell);
crate::impl_checkpointable_refcell!(AlleleCounter, ckpt, value);

/// Log-likelihood of the observed genotype given the latent genotype and the
/// infection's false-positive / false-negative observation rates.
pub struct ObservationLikelihood {
    counter: Rc<AlleleCounter>,
    false_positive_rate: Rc<Parameter<f64>>,
    false_negative_rate: Rc<Parameter<f64>>,
    label: String,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl ObservationLikelihood {
    pub fn new(
        counter: &Rc<AlleleCounter>,
        false_positive_rate: &Rc<Parameter<f64>>,
        false_negative_rate: &Rc<Parameter<f64>>,
        label: &str,
    ) -> Rc<Self> {
        let node = Rc::new(ObservationLikelihood {
            counter: counter.clone(),
            false_positive_rate: false_positive_rate.clone(),
            false_negative_rate: false_negative_rate.clone(),
            label: label.to_owned(),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });

        crate::core::cache::register_dirty_target(&**counter, &node);
        register_cacheable_checkpoint_target(&**counter, &node);

        for rate in &[false_positive_rate, false_negative_rate] {
            register_cacheable_checkpoint_target(&***rate, &node);
            let weak = Rc::downgrade(&node);
            rate.add_post_change_listener(Rc::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.cell.set_dirty();
                }
            }));
        }

        node.value();
        node
    }
}

impl Computation<Likelihood> for ObservationLikelihood {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let counts = self.counter.value();
            let fpr = self.false_positive_rate.value();
            let fnr = self.false_negative_rate.value();
            let llik = counts.true_positives as f64 * (1.0 - fpr).ln()
                + counts.true_negatives as f64 * (1.0 - fnr).ln()
                + counts.false_positives as f64 * fpr.ln()
                + counts.false_negatives as f64 * fnr.ln();
            self.value.set(llik);
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for ObservationLikelihood {
    fn identifier(&self) -> String {
        format!("ObservationLikelihood<{}>", self.label)
    }
}

crate::impl_cacheable!(ObservationLikelihood, cell);
crate::impl_checkpointable_cell!(ObservationLikelihood, ckpt, value);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::core::checkpoint::{Checkpointable, StateId};

    #[test]
    fn counts_and_likelihood_follow_the_latent_genotype() {
        let latent = Parameter::new(Genotype::from_bitstring("1100", 4).unwrap());
        let observed = Parameter::new(Genotype::from_bitstring("1010", 4).unwrap());
        let counter = AlleleCounter::new(&latent, &observed);
        let fpr = Parameter::new(0.05f64);
        let fnr = Parameter::new(0.1f64);
        let obs = ObservationLikelihood::new(&counter, &fpr, &fnr, "i0/m1");

        let expected = 1.0 * (0.95f64).ln() + 1.0 * (0.9f64).ln() + 0.05f64.ln() + 0.1f64.ln();
        assert_relative_eq!(*obs.value(), expected, epsilon = 1e-12);

        latent.save_state(StateId::External(0));
        latent.set_value(Genotype::from_bitstring("1010", 4).unwrap());
        let perfect = 2.0 * (0.95f64).ln() + 2.0 * (0.9f64).ln();
        assert_relative_eq!(*obs.value(), perfect, epsilon = 1e-12);

        latent.restore_state(StateId::External(0));
        assert_relative_eq!(*obs.value(), expected, epsilon = 1e-12);
    }
}
