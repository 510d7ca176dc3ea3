// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;

use crate::core::ordering::Ordering;
use crate::core::parameter::Parameter;
use crate::datatypes::Genotype;
use crate::io::input::InputDocument;
use crate::io::logger::{hotload_scalar, hotload_string, hotload_vector};
use crate::model::distributions::DiscreteDistribution;
use crate::model::infection::{AlleleFrequencies, Infection, Locus};
use crate::utils::sanitize_path_component;

/// All mutable parameters and entities of one chain. Chains never share
/// state; the input document and duration priors are the only cross-chain
/// data and they are immutable.
pub struct State {
    pub loci: BTreeMap<String, Rc<Locus>>,
    pub infections: Vec<Rc<Infection>>,
    pub latent_parents: Vec<Rc<Infection>>,
    pub disallowed_parents: HashMap<String, HashSet<String>>,
    pub allele_frequencies: Rc<AlleleFrequencies>,
    pub ordering: Rc<Ordering<Rc<Infection>>>,

    pub symptomatic_duration_prior: Rc<DiscreteDistribution>,
    pub asymptomatic_duration_prior: Rc<DiscreteDistribution>,

    pub eps_pos: Vec<Rc<Parameter<f64>>>,
    pub eps_neg: Vec<Rc<Parameter<f64>>>,
    pub loss_prob: Rc<Parameter<f64>>,
    pub inter_generation_prob: Rc<Parameter<f64>>,
    pub mean_coi: Rc<Parameter<f64>>,
    pub mean_strains: Rc<Parameter<f64>>,
}

impl State {
    pub fn new(
        input: &InputDocument,
        symptomatic_duration_prior: &Rc<DiscreteDistribution>,
        asymptomatic_duration_prior: &Rc<DiscreteDistribution>,
        rng: &mut StdRng,
    ) -> Result<Rc<Self>> {
        Self::build(
            input,
            symptomatic_duration_prior,
            asymptomatic_duration_prior,
            rng,
            None,
        )
    }

    /// Resume from the last row of each output CSV in `output_dir`.
    pub fn hotload(
        input: &InputDocument,
        symptomatic_duration_prior: &Rc<DiscreteDistribution>,
        asymptomatic_duration_prior: &Rc<DiscreteDistribution>,
        rng: &mut StdRng,
        output_dir: &Path,
    ) -> Result<Rc<Self>> {
        Self::build(
            input,
            symptomatic_duration_prior,
            asymptomatic_duration_prior,
            rng,
            Some(output_dir),
        )
    }

    fn build(
        input: &InputDocument,
        symptomatic_duration_prior: &Rc<DiscreteDistribution>,
        asymptomatic_duration_prior: &Rc<DiscreteDistribution>,
        rng: &mut StdRng,
        hotload_dir: Option<&Path>,
    ) -> Result<Rc<Self>> {
        let mut loci = BTreeMap::new();
        for (label, alleles) in &input.loci {
            loci.insert(
                label.clone(),
                Rc::new(Locus::new(label.clone(), *alleles)),
            );
        }
        let locus_list: Vec<Rc<Locus>> = loci.values().cloned().collect();

        let mut infections = Vec::new();
        for record in &input.infections {
            let mut observed = HashMap::new();
            for (label, genotype) in &record.genotypes {
                let locus = &loci[label];
                observed.insert(
                    label.clone(),
                    genotype.to_genotype(&record.id, label, locus.alleles())?,
                );
            }
            let initial_duration = if record.symptomatic {
                initial_duration(symptomatic_duration_prior)
            } else {
                initial_duration(asymptomatic_duration_prior)
            };
            let infection = Infection::new(
                &record.id,
                record.sampling_time,
                record.symptomatic,
                initial_duration,
                locus_list.clone(),
                &observed,
            );
            // a locus with no observation still needs a non-empty latent
            // genotype; seed it with one random allele
            for locus in infection.loci().to_vec() {
                let latent = infection.latent_genotype(&locus);
                if latent.value().popcount() == 0 {
                    let mut genotype = Genotype::empty(locus.alleles());
                    genotype.set(rng.gen_range(0..locus.alleles()), true);
                    latent.initialize_value(genotype);
                }
            }
            infections.push(infection);
        }

        // order infections by sampling time; the chain explores permutations
        // from there
        infections.sort_by(|a, b| {
            a.sampling_time()
                .cmp(&b.sampling_time())
                .then_with(|| a.id().cmp(b.id()))
        });

        let latent_parents: Vec<Rc<Infection>> = infections
            .iter()
            .map(|infection| Infection::surrogate(infection))
            .collect();

        let mut disallowed_parents: HashMap<String, HashSet<String>> = HashMap::new();
        for (child, allowed) in &input.allowed_parents {
            let allowed: HashSet<String> = allowed.iter().cloned().collect();
            let disallowed = infections
                .iter()
                .map(|i| i.id().clone())
                .filter(|id| id != child && !allowed.contains(id))
                .collect();
            disallowed_parents.insert(child.clone(), disallowed);
        }

        let allele_frequencies = AlleleFrequencies::new(&locus_list);
        let ordering = Ordering::from_elements(infections.clone());

        let eps_pos: Vec<_> = infections
            .iter()
            .map(|i| Parameter::with_label(0.01f64, &format!("{}/eps_pos", i.id())))
            .collect();
        let eps_neg: Vec<_> = infections
            .iter()
            .map(|i| Parameter::with_label(0.01f64, &format!("{}/eps_neg", i.id())))
            .collect();

        let state = Rc::new(State {
            loci,
            infections,
            latent_parents,
            disallowed_parents,
            allele_frequencies,
            ordering,
            symptomatic_duration_prior: symptomatic_duration_prior.clone(),
            asymptomatic_duration_prior: asymptomatic_duration_prior.clone(),
            eps_pos,
            eps_neg,
            loss_prob: Parameter::with_label(0.1f64, "loss_prob"),
            inter_generation_prob: Parameter::with_label(0.95f64, "inter_generation_prob"),
            mean_coi: Parameter::with_label(1.01f64, "mean_coi"),
            mean_strains: Parameter::with_label(1.5f64, "mean_strains"),
        });

        if let Some(dir) = hotload_dir {
            state.load_previous_run(dir)?;
        }
        Ok(state)
    }

    fn load_previous_run(&self, output_dir: &Path) -> Result<()> {
        let parameters = output_dir.join("parameters");
        if !parameters.exists() {
            return Err(crate::errors::Error::HotloadMissing {
                path: parameters,
            }
            .into());
        }

        self.loss_prob
            .initialize_value(hotload_scalar(&parameters.join("loss_prob.csv"))?);
        self.inter_generation_prob.initialize_value(hotload_scalar(
            &parameters.join("inter_generation_prob.csv"),
        )?);
        self.mean_coi
            .initialize_value(hotload_scalar(&parameters.join("mean_coi.csv"))?);
        self.mean_strains
            .initialize_value(hotload_scalar(&parameters.join("mean_strains.csv"))?);

        for locus in self.loci.values() {
            let path = parameters
                .join("allele_frequencies")
                .join(format!("{}.csv", sanitize_path_component(locus.label())));
            self.allele_frequencies
                .frequencies(locus)
                .initialize_value(crate::datatypes::Simplex::new(hotload_vector(&path)?));
        }

        for (index, infection) in self.infections.iter().enumerate() {
            let name = format!("{}.csv", sanitize_path_component(infection.id()));
            self.eps_pos[index]
                .initialize_value(hotload_scalar(&parameters.join("eps_pos").join(&name))?);
            self.eps_neg[index]
                .initialize_value(hotload_scalar(&parameters.join("eps_neg").join(&name))?);
            infection.duration().initialize_value(hotload_scalar(
                &parameters.join("infection_duration").join(&name),
            )?);
        }

        for (tree, infections) in [
            ("genotypes", &self.infections),
            ("latent_parents", &self.latent_parents),
        ]
        .iter()
        {
            for infection in infections.iter() {
                let dir = parameters
                    .join(tree)
                    .join(sanitize_path_component(infection.id()));
                for locus in infection.loci().to_vec() {
                    let path =
                        dir.join(format!("{}.csv", sanitize_path_component(locus.label())));
                    let bits = hotload_string(&path)?;
                    let genotype = Genotype::from_bitstring(&bits, locus.alleles())
                        .map_err(|msg| crate::errors::Error::InvalidGenotype {
                            infection: infection.id().clone(),
                            locus: locus.label().clone(),
                            msg,
                        })?;
                    infection.latent_genotype(&locus).initialize_value(genotype);
                }
            }
        }
        Ok(())
    }

    pub fn duration_prior(&self, infection: &Infection) -> &Rc<DiscreteDistribution> {
        if infection.symptomatic() {
            &self.symptomatic_duration_prior
        } else {
            &self.asymptomatic_duration_prior
        }
    }
}

fn initial_duration(prior: &DiscreteDistribution) -> f64 {
    // start at the middle of the prior's support
    (prior.len() as f64 / 2.0).max(1.0).min(prior.len() as f64 - 0.5)
}
