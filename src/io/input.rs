// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::Result;
use flate2::read::GzDecoder;

use crate::datatypes::genotype::{Genotype, MAX_ALLELES};
use crate::errors;
use crate::model::distributions::DiscreteDistribution;

/// The deserialised input document: loci, infections with their observed
/// genotypes, and the optional parent restriction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDocument {
    pub loci: BTreeMap<String, usize>,
    pub infections: Vec<InfectionRecord>,
    #[serde(default)]
    pub allowed_parents: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfectionRecord {
    pub id: String,
    pub sampling_time: u32,
    pub symptomatic: bool,
    pub genotypes: BTreeMap<String, GenotypeRecord>,
}

/// Observed genotypes arrive either as a bit string (`"1010"`) or as a list
/// of allele indices (`[0, 2]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenotypeRecord {
    Bits(String),
    Indices(Vec<usize>),
}

impl GenotypeRecord {
    pub fn to_genotype(
        &self,
        infection: &str,
        locus: &str,
        alleles: usize,
    ) -> Result<Genotype, errors::Error> {
        let parsed = match self {
            GenotypeRecord::Bits(bits) => {
                if bits.len() > alleles {
                    return Err(errors::Error::GenotypeExceedsLocus {
                        infection: infection.to_owned(),
                        locus: locus.to_owned(),
                        observed: bits.len(),
                        alleles,
                    });
                }
                Genotype::from_bitstring(bits, alleles)
            }
            GenotypeRecord::Indices(indices) => {
                if let Some(max) = indices.iter().max() {
                    if *max >= alleles {
                        return Err(errors::Error::GenotypeExceedsLocus {
                            infection: infection.to_owned(),
                            locus: locus.to_owned(),
                            observed: max + 1,
                            alleles,
                        });
                    }
                }
                Genotype::from_indices(indices, alleles)
            }
        };
        parsed.map_err(|msg| errors::Error::InvalidGenotype {
            infection: infection.to_owned(),
            locus: locus.to_owned(),
            msg,
        })
    }
}

/// Read the input document, transparently decompressing `.gz` files.
pub fn load_input(path: &Path) -> Result<InputDocument> {
    if !path.exists() {
        return Err(errors::Error::InputFileMissing {
            path: path.to_owned(),
        }
        .into());
    }
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().map_or(false, |ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let document: InputDocument = serde_json::from_reader(BufReader::new(reader))?;
    validate(&document)?;
    Ok(document)
}

/// Structural validation; every violation here is a data error that aborts
/// construction.
pub fn validate(document: &InputDocument) -> Result<(), errors::Error> {
    for (label, alleles) in &document.loci {
        if *alleles == 0 || *alleles > MAX_ALLELES {
            return Err(errors::Error::InvalidAlleleCount {
                locus: label.clone(),
                declared: *alleles,
                max: MAX_ALLELES,
            });
        }
    }

    let mut ids = std::collections::HashSet::new();
    for infection in &document.infections {
        if !ids.insert(infection.id.clone()) {
            return Err(errors::Error::DuplicateInfection {
                name: infection.id.clone(),
            });
        }
        for (locus, genotype) in &infection.genotypes {
            let alleles = *document.loci.get(locus).ok_or_else(|| {
                errors::Error::UnknownLocus {
                    infection: infection.id.clone(),
                    locus: locus.clone(),
                }
            })?;
            genotype.to_genotype(&infection.id, locus, alleles)?;
        }
    }

    for (child, parents) in &document.allowed_parents {
        if !ids.contains(child) {
            return Err(errors::Error::UnknownAllowedParent {
                name: child.clone(),
            });
        }
        for parent in parents {
            if !ids.contains(parent) {
                return Err(errors::Error::UnknownAllowedParent {
                    name: parent.clone(),
                });
            }
        }
    }
    Ok(())
}

/// One probability per line, e.g. an infection-duration prior.
pub fn load_duration_prior(path: &Path) -> Result<DiscreteDistribution> {
    if !path.exists() {
        return Err(errors::Error::InputFileMissing {
            path: path.to_owned(),
        }
        .into());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut probabilities = Vec::new();
    for record in reader.records() {
        let record = record?;
        let value: f64 = record
            .get(0)
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| errors::Error::InvalidDurationPrior {
                path: path.to_owned(),
            })?;
        if value < 0.0 || !value.is_finite() {
            return Err(errors::Error::InvalidDurationPrior {
                path: path.to_owned(),
            }
            .into());
        }
        probabilities.push(value);
    }
    if probabilities.is_empty() || probabilities.iter().sum::<f64>() <= 0.0 {
        return Err(errors::Error::InvalidDurationPrior {
            path: path.to_owned(),
        }
        .into());
    }
    Ok(DiscreteDistribution::new(probabilities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toy_document() -> serde_json::Value {
        serde_json::json!({
            "loci": {"m1": 4},
            "infections": [
                {"id": "i0", "sampling_time": 3, "symptomatic": true, "genotypes": {"m1": "1010"}},
                {"id": "i1", "sampling_time": 9, "symptomatic": false, "genotypes": {"m1": [1, 3]}}
            ],
            "allowed_parents": {"i1": ["i0"]}
        })
    }

    #[test]
    fn parses_both_genotype_encodings() {
        let document: InputDocument = serde_json::from_value(toy_document()).unwrap();
        validate(&document).unwrap();
        let g0 = document.infections[0].genotypes["m1"]
            .to_genotype("i0", "m1", 4)
            .unwrap();
        assert_eq!(g0.to_bitstring(), "1010");
        let g1 = document.infections[1].genotypes["m1"]
            .to_genotype("i1", "m1", 4)
            .unwrap();
        assert_eq!(g1.to_bitstring(), "0101");
    }

    #[test]
    fn rejects_unknown_locus() {
        let mut raw = toy_document();
        raw["infections"][0]["genotypes"]["mX"] = serde_json::json!("10");
        let document: InputDocument = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            validate(&document),
            Err(errors::Error::UnknownLocus { .. })
        ));
    }

    #[test]
    fn rejects_oversized_genotype() {
        let mut raw = toy_document();
        raw["infections"][0]["genotypes"]["m1"] = serde_json::json!("10101");
        let document: InputDocument = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            validate(&document),
            Err(errors::Error::GenotypeExceedsLocus { .. })
        ));
    }

    #[test]
    fn rejects_unknown_allowed_parent() {
        let mut raw = toy_document();
        raw["allowed_parents"]["i1"] = serde_json::json!(["iX"]);
        let document: InputDocument = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            validate(&document),
            Err(errors::Error::UnknownAllowedParent { .. })
        ));
    }

    #[test]
    fn reads_gzipped_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        encoder
            .write_all(toy_document().to_string().as_bytes())
            .unwrap();
        encoder.finish().unwrap();
        let document = load_input(&path).unwrap();
        assert_eq!(document.infections.len(), 2);
    }

    #[test]
    fn reads_duration_priors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idp.csv");
        std::fs::write(&path, "0.0\n0.5\n0.25\n0.25\n").unwrap();
        let prior = load_duration_prior(&path).unwrap();
        assert_eq!(prior.len(), 4);
        assert_eq!(prior.ln_pmf(0), f64::NEG_INFINITY);
        assert!((prior.ln_pmf(1) - 0.5f64.ln()).abs() < 1e-12);
    }
}
