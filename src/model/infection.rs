// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::rc::Rc;

use getset::{CopyGetters, Getters};

use crate::core::parameter::Parameter;
use crate::datatypes::{Genotype, Simplex};

/// An immutable genotyping marker.
#[derive(new, Getters, CopyGetters, Debug, PartialEq, Eq)]
pub struct Locus {
    #[getset(get = "pub")]
    label: String,
    #[getset(get_copy = "pub")]
    alleles: usize,
}

/// One observed infection: metadata, the mutable latent genotype per locus,
/// and the observed genotype the data fixed at parse time. Latent-parent
/// surrogates share this shape but carry no observations.
#[derive(Getters, CopyGetters)]
pub struct Infection {
    #[getset(get = "pub")]
    id: String,
    #[getset(get_copy = "pub")]
    sampling_time: u32,
    #[getset(get_copy = "pub")]
    symptomatic: bool,
    duration: Rc<Parameter<f64>>,
    loci: Vec<Rc<Locus>>,
    latent_genotypes: HashMap<String, Rc<Parameter<Genotype>>>,
    observed_genotypes: HashMap<String, Rc<Parameter<Genotype>>>,
}

impl Infection {
    pub fn new(
        id: &str,
        sampling_time: u32,
        symptomatic: bool,
        initial_duration: f64,
        loci: Vec<Rc<Locus>>,
        observed: &HashMap<String, Genotype>,
    ) -> Rc<Self> {
        let mut latent_genotypes = HashMap::new();
        let mut observed_genotypes = HashMap::new();
        for locus in &loci {
            let genotype = observed
                .get(locus.label())
                .cloned()
                .unwrap_or_else(|| Genotype::empty(locus.alleles()));
            latent_genotypes.insert(
                locus.label().clone(),
                Parameter::with_label(genotype, &format!("{}/{}/latent", id, locus.label())),
            );
            observed_genotypes.insert(
                locus.label().clone(),
                Parameter::with_label(genotype, &format!("{}/{}/observed", id, locus.label())),
            );
        }
        Rc::new(Infection {
            id: id.to_owned(),
            sampling_time,
            symptomatic,
            duration: Parameter::with_label(initial_duration, &format!("{}/duration", id)),
            loci,
            latent_genotypes,
            observed_genotypes,
        })
    }

    /// The unobserved background source paired with an observed infection.
    /// Starts from the infection's current latent genotypes.
    pub fn surrogate(infection: &Infection) -> Rc<Self> {
        let mut latent_genotypes = HashMap::new();
        for locus in &infection.loci {
            let genotype = infection.latent_genotype(locus).value();
            latent_genotypes.insert(
                locus.label().clone(),
                Parameter::with_label(
                    genotype,
                    &format!("{}/{}/background", infection.id, locus.label()),
                ),
            );
        }
        Rc::new(Infection {
            id: infection.id.clone(),
            sampling_time: infection.sampling_time,
            symptomatic: infection.symptomatic,
            duration: Parameter::with_label(
                infection.duration.value(),
                &format!("{}/background-duration", infection.id),
            ),
            loci: infection.loci.clone(),
            latent_genotypes,
            observed_genotypes: HashMap::new(),
        })
    }

    pub fn duration(&self) -> &Rc<Parameter<f64>> {
        &self.duration
    }

    pub fn loci(&self) -> &[Rc<Locus>] {
        &self.loci
    }

    pub fn latent_genotype(&self, locus: &Locus) -> Rc<Parameter<Genotype>> {
        self.latent_genotypes[locus.label()].clone()
    }

    pub fn observed_genotype(&self, locus: &Locus) -> Rc<Parameter<Genotype>> {
        self.observed_genotypes[locus.label()].clone()
    }

    pub fn has_observation(&self, locus: &Locus) -> bool {
        self.observed_genotypes.contains_key(locus.label())
    }
}

/// Per-locus population allele frequencies, each a simplex parameter.
pub struct AlleleFrequencies {
    loci: Vec<Rc<Locus>>,
    frequencies: HashMap<String, Rc<Parameter<Simplex>>>,
}

impl AlleleFrequencies {
    pub fn new(loci: &[Rc<Locus>]) -> Rc<Self> {
        let mut frequencies = HashMap::new();
        for locus in loci {
            frequencies.insert(
                locus.label().clone(),
                Parameter::with_label(
                    Simplex::uniform(locus.alleles()),
                    &format!("freq/{}", locus.label()),
                ),
            );
        }
        Rc::new(AlleleFrequencies {
            loci: loci.to_vec(),
            frequencies,
        })
    }

    pub fn loci(&self) -> &[Rc<Locus>] {
        &self.loci
    }

    pub fn frequencies(&self, locus: &Locus) -> Rc<Parameter<Simplex>> {
        self.frequencies[locus.label()].clone()
    }
}
