// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::Cell;
use std::rc::Rc;

use rand::Rng;

use crate::core::checkpoint::{Checkpointable, StateId};
use crate::core::computation::{Computation, LikelihoodNode};
use crate::core::parameter::Parameter;
use crate::datatypes::Genotype;
use crate::model::infection::{Infection, Locus};
use crate::model::parent_set::OrderDerivedParentSet;
use crate::samplers::{Kernel, SharedRng, Tally};

const MAX_PROPOSAL_TRIES: usize = 100;

/// Asymmetric-proposal correction for a single bit flip: a one-allele state
/// cannot flip its last allele off, so it has one fewer reachable
/// neighbours.
fn flip_adjustment(current: &Genotype, proposal: &Genotype) -> f64 {
    let total = current.len() as f64;
    let forward = if proposal.popcount() == 1 {
        -(total - 1.0).ln()
    } else {
        -total.ln()
    };
    let reverse = if current.popcount() == 1 {
        -(total - 1.0).ln()
    } else {
        -total.ln()
    };
    forward - reverse
}

fn metropolis_flip(
    parameter: &Rc<Parameter<Genotype>>,
    target: &Rc<dyn LikelihoodNode>,
    rng: &SharedRng,
    tally: &Tally,
    proposal: Genotype,
) {
    let current = parameter.value();
    let current_llik = *target.value();
    parameter.save_state(StateId::GenotypeFlip);
    parameter.set_value(proposal);
    let adjustment = flip_adjustment(&current, &proposal);
    let ratio = *target.value() - current_llik + adjustment;
    let u: f64 = rng.borrow_mut().gen();
    if u.ln() <= ratio {
        tally.accept();
        parameter.accept_state();
    } else {
        tally.reject();
        parameter.restore_state(StateId::GenotypeFlip);
    }
}

/// Flip one random allele bit of a latent genotype, keeping the allele count
/// within `[1, max_coi]`. Used for latent-parent genotypes, which have no
/// parental constraint.
pub struct RandomAllelesBitSetSampler {
    parameter: Rc<Parameter<Genotype>>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    max_coi: usize,
    tally: Tally,
    total_updates: Cell<u64>,
}

impl RandomAllelesBitSetSampler {
    pub fn new(
        parameter: &Rc<Parameter<Genotype>>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        max_coi: usize,
    ) -> Self {
        RandomAllelesBitSetSampler {
            parameter: parameter.clone(),
            target: target.clone(),
            rng: rng.clone(),
            max_coi,
            tally: Tally::new(),
            total_updates: Cell::new(0),
        }
    }

    fn sample_proposal(&self) -> Genotype {
        let current = self.parameter.value();
        let alleles = current.len();
        for _ in 0..MAX_PROPOSAL_TRIES {
            let idx = self.rng.borrow_mut().gen_range(0..alleles);
            let flipped = current.flipped(idx);
            let count = flipped.popcount() as usize;
            if count >= 1 && count <= self.max_coi {
                return flipped;
            }
        }
        current
    }
}

impl Kernel for RandomAllelesBitSetSampler {
    fn update(&self) {
        let proposal = self.sample_proposal();
        metropolis_flip(
            &self.parameter,
            &self.target,
            &self.rng,
            &self.tally,
            proposal,
        );
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        format!("RandomAllelesBitSetSampler<{}>", self.parameter.label())
    }
}

/// Bit-flip sampler for an observed infection's latent genotype: a bit may
/// only flip on if some current parent (or the latent background parent)
/// carries the allele, so proposals stay inside the feasible region of the
/// transmission likelihood.
pub struct ConstrainedAllelesBitSetSampler {
    parameter: Rc<Parameter<Genotype>>,
    locus: Rc<Locus>,
    parent_set: Rc<OrderDerivedParentSet>,
    latent_parent: Rc<Infection>,
    target: Rc<dyn LikelihoodNode>,
    rng: SharedRng,
    max_coi: usize,
    tally: Tally,
    total_updates: Cell<u64>,
}

impl ConstrainedAllelesBitSetSampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parameter: &Rc<Parameter<Genotype>>,
        locus: &Rc<Locus>,
        parent_set: &Rc<OrderDerivedParentSet>,
        latent_parent: &Rc<Infection>,
        target: &Rc<dyn LikelihoodNode>,
        rng: &SharedRng,
        max_coi: usize,
    ) -> Self {
        ConstrainedAllelesBitSetSampler {
            parameter: parameter.clone(),
            locus: locus.clone(),
            parent_set: parent_set.clone(),
            latent_parent: latent_parent.clone(),
            target: target.clone(),
            rng: rng.clone(),
            max_coi,
            tally: Tally::new(),
            total_updates: Cell::new(0),
        }
    }

    fn sample_proposal(&self) -> Genotype {
        let current = self.parameter.value();
        let alleles = current.len();

        // alleles that may be switched on: carried by any candidate source
        let mut available = self.latent_parent.latent_genotype(&self.locus).value();
        for parent in self.parent_set.peek().values() {
            available = available.or(&parent.latent_genotype(&self.locus).value());
        }

        let mut valid = Vec::new();
        for idx in 0..alleles {
            if current.allele(idx) || available.allele(idx) {
                valid.push(idx);
            }
        }
        if valid.len() <= 1 {
            return current;
        }

        for _ in 0..MAX_PROPOSAL_TRIES {
            let idx = self.rng.borrow_mut().gen_range(0..alleles);
            if !valid.contains(&idx) {
                continue;
            }
            let flipped = current.flipped(idx);
            let count = flipped.popcount() as usize;
            if count >= 1 && count <= self.max_coi {
                return flipped;
            }
        }
        current
    }
}

impl Kernel for ConstrainedAllelesBitSetSampler {
    fn update(&self) {
        let proposal = self.sample_proposal();
        metropolis_flip(
            &self.parameter,
            &self.target,
            &self.rng,
            &self.tally,
            proposal,
        );
        self.total_updates.set(self.total_updates.get() + 1);
    }

    fn acceptances(&self) -> u32 {
        self.tally.acceptances()
    }

    fn rejections(&self) -> u32 {
        self.tally.rejections()
    }

    fn identifier(&self) -> String {
        format!(
            "ConstrainedAllelesBitSetSampler<{}>",
            self.parameter.label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::computation::tests::ConstantLik;
    use crate::core::computation::LikelihoodNode;
    use crate::core::ordering::Ordering;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    fn infection_with(id: &str, bits: &str, locus: &Rc<Locus>) -> Rc<Infection> {
        let mut observed = HashMap::new();
        observed.insert(
            locus.label().clone(),
            Genotype::from_bitstring(bits, locus.alleles()).unwrap(),
        );
        Infection::new(id, 0, false, 10.0, vec![locus.clone()], &observed)
    }

    #[test]
    fn free_sampler_keeps_the_allele_count_bounded() {
        let parameter = Parameter::new(Genotype::from_bitstring("1000", 4).unwrap());
        let target: Rc<dyn LikelihoodNode> = ConstantLik::new(-1.0);
        let rng: SharedRng = Rc::new(RefCell::new(StdRng::seed_from_u64(11)));
        let sampler = RandomAllelesBitSetSampler::new(&parameter, &target, &rng, 2);

        for _ in 0..500 {
            sampler.update();
            let genotype = parameter.value();
            assert!(genotype.popcount() >= 1 && genotype.popcount() <= 2);
        }
        assert!(sampler.acceptances() > 0);
    }

    #[test]
    fn constrained_sampler_only_turns_on_parental_alleles() {
        let locus = Rc::new(Locus::new("m1".to_owned(), 4));
        let parent = infection_with("p", "1100", &locus);
        let child = infection_with("c", "1000", &locus);
        let latent_parent = Infection::surrogate(&child);
        let ordering = Ordering::from_elements(vec![parent.clone(), child.clone()]);
        let parent_set = OrderDerivedParentSet::new(&ordering, &child, HashSet::new());

        let parameter = child.latent_genotype(&locus);
        let target: Rc<dyn LikelihoodNode> = ConstantLik::new(-1.0);
        let rng: SharedRng = Rc::new(RefCell::new(StdRng::seed_from_u64(13)));
        let sampler = ConstrainedAllelesBitSetSampler::new(
            &parameter,
            &locus,
            &parent_set,
            &latent_parent,
            &target,
            &rng,
            3,
        );

        // reachable alleles: the child's own plus the parent's, i.e. {0, 1}
        let allowed = Genotype::from_bitstring("1100", 4).unwrap();
        for _ in 0..500 {
            sampler.update();
            let genotype = parameter.value();
            assert_eq!(genotype.mutation_mask(&allowed).popcount(), 0);
            assert!(genotype.popcount() >= 1 && genotype.popcount() <= 3);
        }
    }
}
