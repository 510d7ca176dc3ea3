// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use bio::stats::LogProb;

use crate::core::cache::{Cacheable, DirtyCell, DirtyListener};
use crate::core::checkpoint::{
    register_cacheable_checkpoint_target, CheckpointCell, StateOp,
};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::model::distributions::ZtPoisson;
use crate::model::infection::{AlleleFrequencies, Infection};
use crate::utils::{log_sum_exp, prob_any_missing};
use crate::Likelihood;

/// Multinomial log-likelihood of a founder's latent genotype under the
/// population allele frequencies, marginal over the complexity of infection.
///
/// The per-locus log-probabilities conditional on each COI are cached in a
/// `(loci x COI+1)` matrix; a change to one locus (its frequencies or the
/// founder genotype) re-derives only that row, while the log-sum-exp across
/// the COI axis is re-evaluated on every recompute.
pub struct SourceTransmissionProcess {
    coi_dist: Rc<ZtPoisson>,
    frequencies: Rc<AlleleFrequencies>,
    founder: Rc<Infection>,
    locus_index: HashMap<String, usize>,
    llik_matrix: RefCell<Vec<Vec<f64>>>,
    matrix_cache: RefCell<Vec<Vec<Vec<f64>>>>,
    dirty_loci: RefCell<BTreeSet<usize>>,
    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl SourceTransmissionProcess {
    pub fn new(
        coi_dist: &Rc<ZtPoisson>,
        frequencies: &Rc<AlleleFrequencies>,
        founder: &Rc<Infection>,
    ) -> Rc<Self> {
        let max_coi = coi_dist.max_count();
        let total_loci = founder.loci().len();
        let mut locus_index = HashMap::new();
        for (idx, locus) in founder.loci().iter().enumerate() {
            locus_index.insert(locus.label().clone(), idx);
        }

        let process = Rc::new(SourceTransmissionProcess {
            coi_dist: coi_dist.clone(),
            frequencies: frequencies.clone(),
            founder: founder.clone(),
            locus_index,
            llik_matrix: RefCell::new(vec![vec![0.0; max_coi + 1]; total_loci]),
            matrix_cache: RefCell::new(Vec::new()),
            dirty_loci: RefCell::new((0..total_loci).collect()),
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });

        register_cacheable_checkpoint_target(&**coi_dist, &process);
        {
            let weak = Rc::downgrade(&process);
            coi_dist.add_dirty_listener(DirtyListener::Hook(Rc::new(move || {
                if let Some(process) = weak.upgrade() {
                    let total = process.llik_matrix.borrow().len();
                    process.dirty_loci.borrow_mut().extend(0..total);
                    process.cell.set_dirty();
                }
            })));
        }

        for locus in founder.loci().to_vec() {
            let idx = process.locus_index[locus.label()];

            let freq = frequencies.frequencies(&locus);
            register_cacheable_checkpoint_target(&*freq, &process);
            {
                let weak = Rc::downgrade(&process);
                freq.add_post_change_listener(Rc::new(move || {
                    if let Some(process) = weak.upgrade() {
                        process.dirty_loci.borrow_mut().insert(idx);
                        process.cell.set_dirty();
                    }
                }));
            }

            let genotype = founder.latent_genotype(&locus);
            register_cacheable_checkpoint_target(&*genotype, &process);
            {
                let weak = Rc::downgrade(&process);
                genotype.add_post_change_listener(Rc::new(move || {
                    if let Some(process) = weak.upgrade() {
                        process.dirty_loci.borrow_mut().insert(idx);
                        process.cell.set_dirty();
                    }
                }));
            }
        }

        // the row matrix is stateful across partial recomputes, so it is
        // snapshotted alongside the value
        {
            let weak = Rc::downgrade(&process);
            process.ckpt.add_post_hook(Rc::new(move |op: &StateOp| {
                if let Some(process) = weak.upgrade() {
                    match op {
                        StateOp::Save(_) => {
                            let snapshot = process.llik_matrix.borrow().clone();
                            process.matrix_cache.borrow_mut().push(snapshot);
                        }
                        StateOp::Restore(_) => {
                            let snapshot = process
                                .matrix_cache
                                .borrow_mut()
                                .pop()
                                .expect("source process snapshot underflow");
                            *process.llik_matrix.borrow_mut() = snapshot;
                        }
                        StateOp::Accept => {
                            process.matrix_cache.borrow_mut().clear();
                        }
                    }
                }
            }));
        }

        process.value();
        process
    }

    fn recompute_locus(&self, idx: usize) {
        let locus = &self.founder.loci()[idx];
        let frequencies = self.frequencies.frequencies(locus).value();
        let genotype = self.founder.latent_genotype(locus).value();
        let max_coi = self.coi_dist.max_count();

        let mut support = Vec::with_capacity(genotype.popcount() as usize);
        let mut mass = 0.0;
        for allele in 0..locus.alleles() {
            if genotype.allele(allele) {
                support.push(frequencies.get(allele));
                mass += frequencies.get(allele);
            }
        }

        let mut row = vec![f64::NEG_INFINITY; max_coi + 1];
        if mass > 0.0 {
            let normalised: Vec<f64> = support.iter().map(|p| p / mass).collect();
            for draws in 0..=max_coi {
                // P(exactly this presence-set | all draws land in the set)
                // times P(all draws land in the set)
                let pam = prob_any_missing(&normalised, draws);
                row[draws] = (1.0 - pam).ln() + mass.ln() * draws as f64;
            }
        }
        self.llik_matrix.borrow_mut()[idx] = row;
    }
}

impl Computation<Likelihood> for SourceTransmissionProcess {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let dirty: Vec<usize> = self.dirty_loci.borrow().iter().cloned().collect();
            for idx in dirty {
                self.recompute_locus(idx);
            }
            self.dirty_loci.borrow_mut().clear();

            let max_coi = self.coi_dist.max_count();
            let coi_probs = self.coi_dist.value();
            let matrix = self.llik_matrix.borrow();
            let mut per_coi = vec![f64::NEG_INFINITY; max_coi + 1];
            for coi in 1..=max_coi {
                let mut llik = coi_probs[coi].ln();
                for row in matrix.iter() {
                    llik += row[coi];
                }
                per_coi[coi] = llik;
            }
            self.value.set(log_sum_exp(&per_coi[1..]));
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for SourceTransmissionProcess {
    fn identifier(&self) -> String {
        format!("SourceTransmissionProcess<{}>", self.founder.id())
    }
}

crate::impl_cacheable!(SourceTransmissionProcess, cell);
crate::impl_checkpointable_cell!(SourceTransmissionProcess, ckpt, value);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::Cacheable;
    use crate::core::checkpoint::{Checkpointable, StateId};
    use crate::core::parameter::Parameter;
    use crate::datatypes::{Genotype, Simplex};
    use crate::model::infection::Locus;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn setup() -> (
        Rc<Parameter<f64>>,
        Rc<AlleleFrequencies>,
        Rc<Infection>,
        Rc<SourceTransmissionProcess>,
    ) {
        let locus = Rc::new(Locus::new("m1".to_owned(), 4));
        let mut observed = HashMap::new();
        observed.insert(
            "m1".to_owned(),
            Genotype::from_bitstring("1100", 4).unwrap(),
        );
        let founder = Infection::new("i0", 0, false, 10.0, vec![locus.clone()], &observed);
        let frequencies = AlleleFrequencies::new(&[locus]);
        let mean_coi = Parameter::new(2.0f64);
        let coi_dist = ZtPoisson::new(&mean_coi, 5);
        let process = SourceTransmissionProcess::new(&coi_dist, &frequencies, &founder);
        (mean_coi, frequencies, founder, process)
    }

    #[test]
    fn single_allele_founder_matches_closed_form() {
        let locus = Rc::new(Locus::new("m1".to_owned(), 2));
        let mut observed = HashMap::new();
        observed.insert("m1".to_owned(), Genotype::from_bitstring("10", 2).unwrap());
        let founder = Infection::new("i0", 0, false, 10.0, vec![locus.clone()], &observed);
        let frequencies = AlleleFrequencies::new(&[locus.clone()]);
        let mean_coi = Parameter::new(1.5f64);
        let coi_dist = ZtPoisson::new(&mean_coi, 4);
        let process = SourceTransmissionProcess::new(&coi_dist, &frequencies, &founder);

        // one allele with frequency 1/2: P(genotype | coi = m) = (1/2)^m
        let coi = coi_dist.value();
        let expected: f64 = (1..=4).map(|m| coi[m] * 0.5f64.powi(m as i32)).sum();
        assert_relative_eq!(*process.value(), expected.ln(), epsilon = 1e-9);
    }

    #[test]
    fn frequency_change_invalidates_and_round_trips() {
        let (_mean_coi, frequencies, founder, process) = setup();
        let before = *process.value();
        assert!(!process.is_dirty());

        let locus = founder.loci()[0].clone();
        let freq = frequencies.frequencies(&locus);
        freq.save_state(StateId::External(0));
        freq.set_value(Simplex::new(vec![0.7, 0.1, 0.1, 0.1]));
        assert!(process.is_dirty());
        let after = *process.value();
        assert!((after - before).abs() > 1e-9);

        freq.restore_state(StateId::External(0));
        assert_relative_eq!(*process.value(), before, epsilon = 1e-12);
    }

    #[test]
    fn empty_support_is_infeasible() {
        let (_mean_coi, frequencies, founder, process) = setup();
        let locus = founder.loci()[0].clone();
        let freq = frequencies.frequencies(&locus);
        freq.save_state(StateId::External(0));
        // all mass on alleles the founder does not carry
        freq.set_value(Simplex::new(vec![0.0, 0.0, 0.5, 0.5]));
        assert_eq!(*process.value(), f64::NEG_INFINITY);
        freq.restore_state(StateId::External(0));
        assert!((*process.value()).is_finite());
    }
}
