// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::rc::Rc;

use bio::stats::LogProb;
use statrs::function::gamma::ln_gamma;

use crate::core::cache::{Cacheable, DirtyCell, DirtyListener};
use crate::core::checkpoint::{
    register_cacheable_checkpoint_target, CheckpointCell, Checkpointable,
};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::datatypes::Genotype;
use crate::model::distributions::ZtGeometric;
use crate::model::infection::Infection;
use crate::model::parent_set::ParentSet;
use crate::utils::{log_sum_exp, prob_any_missing, MixedRadix};
use crate::Likelihood;

/// Probability of a child's latent genotype given a concrete parent-set
/// hypothesis. Two interchangeable models implement this contract; both are
/// shared nodes whose own cached state participates in dirty propagation and
/// checkpointing.
pub trait NodeTransmission: Cacheable + Checkpointable {
    fn loglik(&self, child: &Infection, parents: &ParentSet) -> Likelihood;

    fn loglik_with_latent(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        parents: &ParentSet,
        source: &dyn LikelihoodNode,
    ) -> Likelihood;

    fn loglik_latent_only(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        source: &dyn LikelihoodNode,
    ) -> Likelihood;

    fn identifier(&self) -> String;
}

fn count_ln(count: u32, p: f64) -> f64 {
    if count == 0 {
        0.0
    } else {
        count as f64 * p.ln()
    }
}

/// Per-allele loss model: each parental allele survives a path of `k`
/// inter-host generations with probability `(1-p_loss)^k`, `k` weighted by a
/// zero-truncated geometric. Child alleles are scored by
/// inclusion-exclusion over the joint presence events of the parent set; a
/// child allele carried by no parent is a mutation and infeasible.
pub struct SimpleLoss {
    loss_prob: Rc<Parameter<f64>>,
    generation_dist: Rc<ZtGeometric>,
    max_transmissions: usize,
    retention: RefCell<Vec<f64>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<Vec<f64>>,
}

impl SimpleLoss {
    pub fn new(loss_prob: &Rc<Parameter<f64>>, generation_dist: &Rc<ZtGeometric>) -> Rc<Self> {
        let max_transmissions = generation_dist.max_count();
        let node = Rc::new(SimpleLoss {
            loss_prob: loss_prob.clone(),
            generation_dist: generation_dist.clone(),
            max_transmissions,
            retention: RefCell::new(vec![0.0; max_transmissions + 1]),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**loss_prob, &node);
        {
            let weak = Rc::downgrade(&node);
            loss_prob.add_post_change_listener(Rc::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.cell.set_dirty();
                }
            }));
        }
        register_cacheable_checkpoint_target(&**generation_dist, &node);
        {
            let weak = Rc::downgrade(&node);
            generation_dist.add_dirty_listener(DirtyListener::Hook(Rc::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.cell.set_dirty();
                }
            })));
        }
        node.value();
        node
    }

    /// Per-locus loss/retention event counts against a list of parent
    /// genotypes. Returns `None` when some child allele has no possible
    /// source.
    fn count_events(
        child: &Infection,
        parents: &[&Rc<Infection>],
    ) -> Option<(Vec<u32>, Vec<u32>)> {
        let np = parents.len();
        let mut lost = vec![0u32; np];
        let mut joint = vec![0u32; 1 << np];
        for locus in child.loci() {
            let child_genotype = child.latent_genotype(locus).value();
            let parent_genotypes: Vec<Genotype> = parents
                .iter()
                .map(|p| p.latent_genotype(locus).value())
                .collect();

            let mut residual = child_genotype;
            for genotype in &parent_genotypes {
                residual = residual.mutation_mask(genotype);
            }
            if residual.popcount() > 0 {
                return None;
            }

            for (p, genotype) in parent_genotypes.iter().enumerate() {
                lost[p] += Genotype::false_negatives(genotype, &child_genotype);
            }

            // child alleles partitioned by the exact subset of parents that
            // carry them
            for mask in 1usize..(1 << np) {
                let mut base = child_genotype;
                for (p, genotype) in parent_genotypes.iter().enumerate() {
                    if mask & (1 << p) != 0 {
                        base = base.and(genotype);
                    } else {
                        base = base.and(&genotype.not());
                    }
                }
                joint[mask] += base.popcount();
            }
        }
        Some((lost, joint))
    }

    /// Mixture over per-parent generation counts. `fixed_tail` marks how
    /// many trailing parents sit one generation away (the latent parent).
    fn mixture(&self, lost: &[u32], joint: &[u32], fixed_tail: usize) -> f64 {
        let np = lost.len();
        let free = np - fixed_tail;
        let retention = self.value();
        let generation_probs = self.generation_dist.value();

        let mut terms = Vec::new();
        for kvec in MixedRadix::new(self.max_transmissions, free) {
            let mut generations = kvec;
            generations.extend(std::iter::repeat(1).take(fixed_tail));

            let mut term = 0.0;
            let mut loss = Vec::with_capacity(np);
            for (p, &k) in generations.iter().enumerate() {
                let loss_p = 1.0 - retention[k];
                loss.push(loss_p);
                term += count_ln(lost[p], loss_p);
                if p < free {
                    term += generation_probs[k].ln();
                }
            }

            for (mask, &count) in joint.iter().enumerate().skip(1) {
                if count == 0 {
                    continue;
                }
                let mut all_lost = 1.0;
                for (p, loss_p) in loss.iter().enumerate() {
                    if mask & (1 << p) != 0 {
                        all_lost *= loss_p;
                    }
                }
                term += count_ln(count, 1.0 - all_lost);
            }
            terms.push(term);
        }
        let llik = log_sum_exp(&terms);
        if llik.is_nan() {
            f64::NEG_INFINITY
        } else {
            llik
        }
    }
}

impl Computation<Vec<f64>> for SimpleLoss {
    fn peek(&self) -> Vec<f64> {
        self.retention.borrow().clone()
    }

    /// Probability of retaining an allele through `k` generations, indexed
    /// by `k`.
    fn value(&self) -> Vec<f64> {
        if self.cell.is_dirty() {
            let p = self.loss_prob.value();
            let mut retention = self.retention.borrow_mut();
            retention[0] = 1.0;
            for k in 1..=self.max_transmissions {
                retention[k] = retention[k - 1] * (1.0 - p);
            }
            drop(retention);
            self.cell.set_clean();
        }
        self.retention.borrow().clone()
    }
}

impl NodeTransmission for SimpleLoss {
    fn loglik(&self, child: &Infection, parents: &ParentSet) -> Likelihood {
        let parent_refs: Vec<&Rc<Infection>> = parents.values().collect();
        match Self::count_events(child, &parent_refs) {
            Some((lost, joint)) => LogProb(self.mixture(&lost, &joint, 0)),
            None => LogProb::ln_zero(),
        }
    }

    fn loglik_with_latent(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        parents: &ParentSet,
        source: &dyn LikelihoodNode,
    ) -> Likelihood {
        let mut parent_refs: Vec<&Rc<Infection>> = parents.values().collect();
        parent_refs.push(latent);
        match Self::count_events(child, &parent_refs) {
            Some((lost, joint)) => {
                LogProb(self.mixture(&lost, &joint, 1) + *source.value())
            }
            None => LogProb::ln_zero(),
        }
    }

    fn loglik_latent_only(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        source: &dyn LikelihoodNode,
    ) -> Likelihood {
        let retention = self.value();
        let mut lost = 0;
        let mut retained = 0;
        for locus in child.loci() {
            let child_genotype = child.latent_genotype(locus).value();
            let latent_genotype = latent.latent_genotype(locus).value();
            if Genotype::false_positives(&latent_genotype, &child_genotype) > 0 {
                return LogProb::ln_zero();
            }
            lost += Genotype::false_negatives(&latent_genotype, &child_genotype);
            retained += Genotype::true_positives(&latent_genotype, &child_genotype);
        }
        let llik = count_ln(lost, 1.0 - retention[1])
            + count_ln(retained, retention[1])
            + *source.value();
        if llik.is_nan() {
            LogProb::ln_zero()
        } else {
            LogProb(llik)
        }
    }

    fn identifier(&self) -> String {
        "SimpleLoss".to_owned()
    }
}

crate::impl_cacheable!(SimpleLoss, cell);
crate::impl_checkpointable_refcell!(SimpleLoss, ckpt, retention);

/// Pooled-multinomial model: the number of transmitted strains is drawn from
/// a normalised truncated compound-Poisson conditioned on the parent count,
/// and every strain's allele at each locus comes from the pooled parental
/// allele distribution (with a small mutation mass on unseen alleles).
pub struct MultinomialTransmission {
    mean_strains: Rc<Parameter<f64>>,
    max_parents: usize,
    max_strains: usize,
    mutation_rate: f64,
    strain_lliks: RefCell<Vec<f64>>,
    cell: DirtyCell,
    ckpt: CheckpointCell<Vec<f64>>,
}

impl MultinomialTransmission {
    pub fn new(
        mean_strains: &Rc<Parameter<f64>>,
        max_parents: usize,
        max_strains: usize,
    ) -> Rc<Self> {
        let node = Rc::new(MultinomialTransmission {
            mean_strains: mean_strains.clone(),
            max_parents,
            max_strains,
            mutation_rate: 0.001,
            strain_lliks: RefCell::new(vec![
                f64::NEG_INFINITY;
                (max_parents + 1) * max_strains
            ]),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });
        register_cacheable_checkpoint_target(&**mean_strains, &node);
        let weak = Rc::downgrade(&node);
        mean_strains.add_post_change_listener(Rc::new(move || {
            if let Some(node) = weak.upgrade() {
                node.cell.set_dirty();
            }
        }));
        node.value();
        node
    }

    /// `ln P(num_strains | num_parents)`.
    fn prob_num_strains(&self, num_strains: usize, num_parents: usize) -> f64 {
        self.strain_lliks.borrow()[(num_parents - 1) * self.max_strains + (num_strains - 1)]
    }

    fn pooled_loglik(
        &self,
        child: &Infection,
        parents: &[&Rc<Infection>],
        source_term: f64,
    ) -> Likelihood {
        let np = parents.len();
        if np == 0 || np > self.max_parents + 1 {
            return LogProb::ln_zero();
        }
        self.value();

        let mut per_strain = vec![0.0; self.max_strains + 1];
        for locus in child.loci() {
            let child_genotype = child.latent_genotype(locus).value();
            let alleles = locus.alleles();
            let mut pooled = vec![0.0; alleles];
            for parent in parents {
                let genotype = parent.latent_genotype(locus).value();
                if Genotype::true_positives(&genotype, &child_genotype) == 0 {
                    // every parent must share at least one allele with the child
                    return LogProb::ln_zero();
                }
                let carried = genotype.popcount() as f64;
                for allele in 0..alleles {
                    if genotype.allele(allele) {
                        pooled[allele] += 1.0 / (carried * np as f64);
                    }
                }
            }

            // shift a small mutation mass onto unseen alleles
            let seen = pooled.iter().filter(|f| **f > 0.0).count();
            let unseen = alleles - seen;
            if unseen > 0 {
                for frequency in pooled.iter_mut() {
                    if *frequency > 0.0 {
                        *frequency -= self.mutation_rate / seen as f64;
                    } else {
                        *frequency = self.mutation_rate / unseen as f64;
                    }
                }
            }

            let mut support = Vec::new();
            let mut mass = 0.0;
            for allele in 0..alleles {
                if child_genotype.allele(allele) {
                    if pooled[allele] < 1e-10 {
                        return LogProb::ln_zero();
                    }
                    support.push(pooled[allele]);
                    mass += pooled[allele];
                }
            }
            let normalised: Vec<f64> = support.iter().map(|f| f / mass).collect();

            for strains in np..=self.max_strains {
                let pam = prob_any_missing(&normalised, strains);
                per_strain[strains] += (1.0 - pam).ln() + mass.ln() * strains as f64;
            }
        }

        let mut terms = Vec::new();
        for strains in np..=self.max_strains {
            terms.push(self.prob_num_strains(strains, np) + per_strain[strains]);
        }
        let llik = log_sum_exp(&terms) + source_term;
        if llik.is_nan() {
            LogProb::ln_zero()
        } else {
            LogProb(llik)
        }
    }
}

impl Computation<Vec<f64>> for MultinomialTransmission {
    fn peek(&self) -> Vec<f64> {
        self.strain_lliks.borrow().clone()
    }

    /// Row-normalised `ln P(num_strains | num_parents)` table. The strain
    /// count from `k` parents is a sum of `k` zero-truncated Poisson draws,
    /// truncated at `max_strains`.
    fn value(&self) -> Vec<f64> {
        if self.cell.is_dirty() {
            let lambda = self.mean_strains.value();
            let mut table = self.strain_lliks.borrow_mut();
            for entry in table.iter_mut() {
                *entry = f64::NEG_INFINITY;
            }
            for parent_row in 0..=self.max_parents {
                let num_parents = parent_row + 1;
                let mut row = Vec::new();
                for strain_col in parent_row..self.max_strains {
                    let num_strains = strain_col + 1;
                    // surjective compositions of num_strains over num_parents
                    let mut correction = 0.0;
                    for i in 0..num_parents {
                        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                        correction += sign
                            * ((num_parents - i) as f64).powi(num_strains as i32)
                            * binomial(num_parents, i);
                    }
                    let llik = num_strains as f64 * lambda.ln()
                        - num_parents as f64 * (lambda.exp() - 1.0).ln()
                        - ln_gamma(num_strains as f64 + 1.0)
                        + correction.max(0.0).ln();
                    table[parent_row * self.max_strains + strain_col] = llik;
                    row.push(llik);
                }
                let normaliser = log_sum_exp(&row);
                for strain_col in parent_row..self.max_strains {
                    table[parent_row * self.max_strains + strain_col] -= normaliser;
                }
            }
            drop(table);
            self.cell.set_clean();
        }
        self.strain_lliks.borrow().clone()
    }
}

impl NodeTransmission for MultinomialTransmission {
    fn loglik(&self, child: &Infection, parents: &ParentSet) -> Likelihood {
        let parent_refs: Vec<&Rc<Infection>> = parents.values().collect();
        self.pooled_loglik(child, &parent_refs, 0.0)
    }

    fn loglik_with_latent(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        parents: &ParentSet,
        source: &dyn LikelihoodNode,
    ) -> Likelihood {
        let mut parent_refs: Vec<&Rc<Infection>> = parents.values().collect();
        parent_refs.push(latent);
        self.pooled_loglik(child, &parent_refs, *source.value())
    }

    fn loglik_latent_only(
        &self,
        child: &Infection,
        latent: &Rc<Infection>,
        source: &dyn LikelihoodNode,
    ) -> Likelihood {
        let parent_refs = vec![latent];
        self.pooled_loglik(child, &parent_refs, *source.value())
    }

    fn identifier(&self) -> String {
        "MultinomialTransmission".to_owned()
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    (ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)).exp()
}

crate::impl_cacheable!(MultinomialTransmission, cell);
crate::impl_checkpointable_refcell!(MultinomialTransmission, ckpt, strain_lliks);
