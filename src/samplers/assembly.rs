// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::rc::Rc;

use crate::core::computation::LikelihoodNode;
use crate::model::{Model, State, MAX_COI};
use crate::samplers::genotype::{ConstrainedAllelesBitSetSampler, RandomAllelesBitSetSampler};
use crate::samplers::order::{OrderSampler, ZanellaNeighborOrderSampler, ZanellaOrderSampler};
use crate::samplers::random_walk::BoundedContinuousRandomWalk;
use crate::samplers::salt::SaltSampler;
use crate::samplers::scheduler::{RandomizedScheduler, ScheduledKernelBuilder};
use crate::samplers::{Kernel, SharedRng};

const ADAPTATION_END: u64 = 2000;

/// Wire the full kernel suite for one chain. Weights follow the relative
/// sizes of the parameter blocks so each block sees comparable attention per
/// sweep.
pub fn build_scheduler(
    state: &Rc<State>,
    model: &Rc<Model>,
    rng: &SharedRng,
    samples_per_step: usize,
    null_model: bool,
) -> RandomizedScheduler {
    let scheduler = RandomizedScheduler::new(rng, samples_per_step);
    let target: Rc<dyn LikelihoodNode> = model.clone();
    let total_infections = state.infections.len() as f64;
    let total_loci = state.loci.len() as f64;

    let register_scalar = |parameter: &Rc<crate::core::parameter::Parameter<f64>>,
                               id: &str,
                               lower: f64,
                               upper: f64,
                               variance: f64,
                               min_variance: f64,
                               max_variance: f64,
                               weight: f64,
                               adaptation_start: u64| {
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(BoundedContinuousRandomWalk::new(
                    parameter,
                    &target,
                    rng,
                    lower,
                    upper,
                    variance,
                    min_variance,
                    max_variance,
                )) as Box<dyn Kernel>)
                .id(id.to_owned())
                .weight(weight)
                .adaptation_start(adaptation_start)
                .adaptation_end(ADAPTATION_END)
                .build()
                .unwrap(),
        );
    };

    register_scalar(
        &state.inter_generation_prob,
        "inter generation prob",
        0.0,
        1.0,
        0.01,
        0.01,
        2.0,
        total_infections * 10.0,
        0,
    );
    register_scalar(
        &state.loss_prob,
        "loss prob",
        0.0,
        1.0,
        0.01,
        0.01,
        2.0,
        total_infections * 10.0,
        0,
    );
    register_scalar(
        &state.mean_coi,
        "mean coi",
        0.0,
        100.0,
        0.01,
        0.01,
        1.0,
        total_infections * 10.0,
        0,
    );
    register_scalar(
        &state.mean_strains,
        "mean strains",
        0.0,
        20.0,
        0.01,
        0.01,
        1.0,
        total_infections,
        0,
    );

    for (index, infection) in state.infections.iter().enumerate() {
        let duration_upper = state.duration_prior(infection).len() as f64;
        register_scalar(
            infection.duration(),
            &format!("duration {}", infection.id()),
            0.0,
            duration_upper,
            1.0,
            0.1,
            100.0,
            total_loci * 100.0,
            20,
        );
        register_scalar(
            &state.eps_pos[index],
            &format!("eps pos {}", infection.id()),
            0.0,
            0.5,
            0.1,
            0.01,
            2.0,
            total_loci * 10.0,
            20,
        );
        register_scalar(
            &state.eps_neg[index],
            &format!("eps neg {}", infection.id()),
            0.0,
            0.5,
            0.1,
            0.01,
            2.0,
            total_loci * 10.0,
            20,
        );
    }

    if !null_model {
        for locus in state.loci.values() {
            scheduler.register(
                ScheduledKernelBuilder::default()
                    .kernel(Box::new(SaltSampler::new(
                        &state.allele_frequencies.frequencies(locus),
                        &target,
                        rng,
                        1.0,
                        0.01,
                        10.0,
                    )) as Box<dyn Kernel>)
                    .id(format!("allele freq {}", locus.label()))
                    .weight(total_infections)
                    .adaptation_start(20)
                    .adaptation_end(ADAPTATION_END)
                    .build()
                    .unwrap(),
            );
        }

        for (index, infection) in state.infections.iter().enumerate() {
            let parent_set = &model.parent_sets()[infection.id()];
            let latent_parent = &state.latent_parents[index];
            for locus in infection.loci().to_vec() {
                scheduler.register(
                    ScheduledKernelBuilder::default()
                        .kernel(Box::new(ConstrainedAllelesBitSetSampler::new(
                            &infection.latent_genotype(&locus),
                            &locus,
                            parent_set,
                            latent_parent,
                            &target,
                            rng,
                            MAX_COI,
                        )) as Box<dyn Kernel>)
                        .id(format!("genotype {} {}", infection.id(), locus.label()))
                        .weight(5.0)
                        .build()
                        .unwrap(),
                );
            }
        }

        for latent_parent in &state.latent_parents {
            for locus in latent_parent.loci().to_vec() {
                scheduler.register(
                    ScheduledKernelBuilder::default()
                        .kernel(Box::new(RandomAllelesBitSetSampler::new(
                            &latent_parent.latent_genotype(&locus),
                            &target,
                            rng,
                            MAX_COI,
                        )) as Box<dyn Kernel>)
                        .id(format!(
                            "latent genotype {} {}",
                            latent_parent.id(),
                            locus.label()
                        ))
                        .weight(5.0)
                        .build()
                        .unwrap(),
                );
            }
        }
    }

    if state.infections.len() >= 2 {
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(OrderSampler::new(&state.ordering, &target, rng, 1))
                    as Box<dyn Kernel>)
                .id("order swap".to_owned())
                .weight(total_infections * 2.0)
                .build()
                .unwrap(),
        );
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(ZanellaNeighborOrderSampler::new(
                    &state.ordering,
                    &target,
                    rng,
                )) as Box<dyn Kernel>)
                .id("order zanella neighbor".to_owned())
                .weight(1.0)
                .build()
                .unwrap(),
        );
        scheduler.register(
            ScheduledKernelBuilder::default()
                .kernel(Box::new(ZanellaOrderSampler::new(
                    &state.ordering,
                    &target,
                    rng,
                    4,
                )) as Box<dyn Kernel>)
                .id("order zanella".to_owned())
                .weight(1.0)
                .build()
                .unwrap(),
        );
    }

    scheduler
}
