// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The transmission-network model: entities, distribution leaves, the
//! likelihood processes and their assembly into a single tempered posterior
//! computation.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use bio::stats::LogProb;

use crate::core::cache::{register_dirty_target, DirtyCell};
use crate::core::checkpoint::{register_cacheable_checkpoint_target, CheckpointCell};
use crate::core::computation::{Accumulator, Computation, LikelihoodNode};
use crate::Likelihood;

pub mod distributions;
pub mod infection;
pub mod node_transmission;
pub mod obtp;
pub mod observation;
pub mod parent_set;
pub mod source;
pub mod state;

pub use infection::{AlleleFrequencies, Infection, Locus};
pub use state::State;

use distributions::{BetaLogPdf, DurationLikelihood, GammaLogPdf, ZtGeometric, ZtPoisson};
use node_transmission::{MultinomialTransmission, NodeTransmission, SimpleLoss};
use obtp::OrderBasedTransmissionProcess;
use observation::{AlleleCounter, ObservationLikelihood};
use parent_set::OrderDerivedParentSet;
use source::SourceTransmissionProcess;

/// Upper bound on the complexity of infection of any host.
pub const MAX_COI: usize = 20;
/// Cardinality bound on the parent-set hypotheses of one child.
pub const MAX_PARENTS: usize = 2;
/// Longest chain of unobserved intermediate hosts in the loss model.
pub const MAX_TRANSMISSIONS: usize = 8;
/// Most strains transmitted to one child in the multinomial model.
pub const MAX_STRAINS: usize = 12;

/// Which node-transmission likelihood backs the transmission processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionModel {
    SimpleLoss,
    Multinomial,
}

impl Default for TransmissionModel {
    fn default() -> Self {
        TransmissionModel::SimpleLoss
    }
}

/// The root posterior computation of one chain:
/// `value = beta * likelihood + prior`, with the likelihood and the prior
/// each an accumulator over their partial likelihoods.
pub struct Model {
    state: Rc<State>,
    prior: Rc<Accumulator>,
    likelihood: Rc<Accumulator>,
    temperature: Cell<f64>,

    coi_dist: Rc<ZtPoisson>,
    generation_dist: Rc<ZtGeometric>,
    node_transmission: Rc<dyn NodeTransmission>,
    parent_sets: BTreeMap<String, Rc<OrderDerivedParentSet>>,
    source_processes: Vec<Rc<SourceTransmissionProcess>>,
    transmission_processes: Vec<Rc<OrderBasedTransmissionProcess>>,

    value: Cell<f64>,
    cell: DirtyCell,
    ckpt: CheckpointCell<f64>,
}

impl Model {
    pub fn new(
        state: &Rc<State>,
        temperature: f64,
        null_model: bool,
        transmission_model: TransmissionModel,
    ) -> Result<Rc<Self>> {
        let prior = Accumulator::new("prior");
        let likelihood = Accumulator::new("likelihood");

        // scalar-parameter priors
        prior.add_target(BetaLogPdf::new(&state.loss_prob, 1.0, 1.0));
        prior.add_target(BetaLogPdf::new(&state.inter_generation_prob, 10.0, 1.0));
        prior.add_target(GammaLogPdf::new(&state.mean_coi, 20.0, 0.1));
        prior.add_target(GammaLogPdf::new(&state.mean_strains, 2.0, 1.0));
        for eps in state.eps_pos.iter().chain(state.eps_neg.iter()) {
            prior.add_target(GammaLogPdf::new(eps, 10.0, 0.001));
        }
        for infection in &state.infections {
            prior.add_target(DurationLikelihood::new(
                infection.duration(),
                state.duration_prior(infection),
                infection.id(),
            ));
        }

        let coi_dist = ZtPoisson::new(&state.mean_coi, MAX_COI);
        let generation_dist = ZtGeometric::new(&state.inter_generation_prob, MAX_TRANSMISSIONS);
        let node_transmission: Rc<dyn NodeTransmission> = match transmission_model {
            TransmissionModel::SimpleLoss => {
                SimpleLoss::new(&state.loss_prob, &generation_dist)
            }
            TransmissionModel::Multinomial => {
                MultinomialTransmission::new(&state.mean_strains, MAX_PARENTS, MAX_STRAINS)
            }
        };

        let mut parent_sets = BTreeMap::new();
        for infection in &state.infections {
            let disallowed = state
                .disallowed_parents
                .get(infection.id())
                .cloned()
                .unwrap_or_default();
            parent_sets.insert(
                infection.id().clone(),
                OrderDerivedParentSet::new(&state.ordering, infection, disallowed),
            );
        }

        let mut source_processes = Vec::new();
        let mut transmission_processes = Vec::new();
        if !null_model {
            for (index, infection) in state.infections.iter().enumerate() {
                for locus in infection.loci().to_vec() {
                    if !infection.has_observation(&locus) {
                        continue;
                    }
                    let counter = AlleleCounter::new(
                        &infection.latent_genotype(&locus),
                        &infection.observed_genotype(&locus),
                    );
                    likelihood.add_target(ObservationLikelihood::new(
                        &counter,
                        &state.eps_pos[index],
                        &state.eps_neg[index],
                        &format!("{}/{}", infection.id(), locus.label()),
                    ));
                }
            }

            for (index, infection) in state.infections.iter().enumerate() {
                let latent_parent = &state.latent_parents[index];
                let source = SourceTransmissionProcess::new(
                    &coi_dist,
                    &state.allele_frequencies,
                    latent_parent,
                );
                source_processes.push(source.clone());

                let transmission = OrderBasedTransmissionProcess::new(
                    &node_transmission,
                    &source,
                    infection,
                    &parent_sets[infection.id()],
                    latent_parent,
                    &state.infections,
                    MAX_PARENTS,
                )?;
                likelihood.add_target(transmission.clone());
                transmission_processes.push(transmission);
            }
        }

        let model = Rc::new(Model {
            state: state.clone(),
            prior: prior.clone(),
            likelihood: likelihood.clone(),
            temperature: Cell::new(temperature),
            coi_dist,
            generation_dist,
            node_transmission,
            parent_sets,
            source_processes,
            transmission_processes,
            value: Cell::new(f64::NEG_INFINITY),
            cell: DirtyCell::new(),
            ckpt: CheckpointCell::new(),
        });

        for accumulator in &[&model.prior, &model.likelihood] {
            register_dirty_target(&***accumulator, &model);
            register_cacheable_checkpoint_target(&***accumulator, &model);
        }

        if *model.value() == f64::NEG_INFINITY {
            anyhow::bail!(
                "initial log posterior is -inf; check the priors against the initial state"
            );
        }
        Ok(model)
    }

    pub fn state(&self) -> &Rc<State> {
        &self.state
    }

    pub fn prior(&self) -> Likelihood {
        self.prior.value()
    }

    pub fn likelihood(&self) -> Likelihood {
        self.likelihood.value()
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.get()
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.temperature.set(temperature);
        self.cell.set_dirty();
    }

    pub fn parent_sets(&self) -> &BTreeMap<String, Rc<OrderDerivedParentSet>> {
        &self.parent_sets
    }

    pub fn transmission_processes(&self) -> &[Rc<OrderBasedTransmissionProcess>] {
        &self.transmission_processes
    }

    pub fn coi_dist(&self) -> &Rc<ZtPoisson> {
        &self.coi_dist
    }

    pub fn generation_dist(&self) -> &Rc<ZtGeometric> {
        &self.generation_dist
    }

    pub fn node_transmission(&self) -> &Rc<dyn NodeTransmission> {
        &self.node_transmission
    }

    pub fn source_processes(&self) -> &[Rc<SourceTransmissionProcess>] {
        &self.source_processes
    }

    /// The untempered potential `V = -ln p(data | state)` used by the
    /// replica-exchange swap criterion.
    pub fn potential(&self) -> f64 {
        -*self.likelihood()
    }
}

impl Computation<Likelihood> for Model {
    fn peek(&self) -> Likelihood {
        LogProb(self.value.get())
    }

    fn value(&self) -> Likelihood {
        if self.cell.is_dirty() {
            let value =
                self.temperature.get() * *self.likelihood.value() + *self.prior.value();
            self.value.set(value);
            self.cell.set_clean();
        }
        LogProb(self.value.get())
    }
}

impl LikelihoodNode for Model {
    fn identifier(&self) -> String {
        "Model".to_owned()
    }
}

crate::impl_cacheable!(Model, cell);
crate::impl_checkpointable_cell!(Model, ckpt, value);
