// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::core::computation::Computation;
use crate::model::{Model, State};
use crate::utils::sanitize_path_component;

/// Append-only CSV sink for one logged quantity; one row per thinning
/// interval.
pub struct ValueLogger {
    writer: RefCell<csv::Writer<File>>,
    render: Box<dyn Fn() -> Vec<String>>,
}

impl ValueLogger {
    pub fn new(
        path: &Path,
        header: Option<&str>,
        reset: bool,
        render: Box<dyn Fn() -> Vec<String>>,
    ) -> Result<Self> {
        let fresh = reset || !path.exists();
        let file = if fresh {
            File::create(path)
        } else {
            OpenOptions::new().append(true).open(path)
        }
        .with_context(|| format!("cannot open output file {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        if fresh {
            if let Some(header) = header {
                writer.write_record(&[header])?;
                writer.flush()?;
            }
        }
        Ok(ValueLogger {
            writer: RefCell::new(writer),
            render,
        })
    }

    pub fn log(&self) -> Result<()> {
        let row = (self.render)();
        let mut writer = self.writer.borrow_mut();
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

fn scalar_logger(
    path: PathBuf,
    header: &str,
    reset: bool,
    parameter: Rc<crate::core::parameter::Parameter<f64>>,
) -> Result<ValueLogger> {
    ValueLogger::new(
        &path,
        Some(header),
        reset,
        Box::new(move || vec![format!("{}", parameter.value())]),
    )
}

/// Logs every sampled quantity of a chain's state into the output tree.
pub struct StateLogger {
    loggers: Vec<ValueLogger>,
    network: RefCell<File>,
    state: Rc<State>,
    model: Rc<Model>,
}

impl StateLogger {
    pub fn new(state: &Rc<State>, model: &Rc<Model>, root: &Path, reset: bool) -> Result<Self> {
        let parameters = root.join("parameters");
        let eps_pos = parameters.join("eps_pos");
        let eps_neg = parameters.join("eps_neg");
        let durations = parameters.join("infection_duration");
        let frequencies = parameters.join("allele_frequencies");
        let genotypes = parameters.join("genotypes");
        let latent_parents = parameters.join("latent_parents");
        for dir in [
            &parameters,
            &eps_pos,
            &eps_neg,
            &durations,
            &frequencies,
            &genotypes,
            &latent_parents,
        ]
        .iter()
        {
            fs::create_dir_all(dir)?;
        }

        let mut loggers = Vec::new();
        loggers.push(scalar_logger(
            parameters.join("loss_prob.csv"),
            "loss_prob",
            reset,
            state.loss_prob.clone(),
        )?);
        loggers.push(scalar_logger(
            parameters.join("inter_generation_prob.csv"),
            "inter_generation_prob",
            reset,
            state.inter_generation_prob.clone(),
        )?);
        loggers.push(scalar_logger(
            parameters.join("mean_coi.csv"),
            "mean_coi",
            reset,
            state.mean_coi.clone(),
        )?);
        loggers.push(scalar_logger(
            parameters.join("mean_strains.csv"),
            "mean_strains",
            reset,
            state.mean_strains.clone(),
        )?);

        {
            let ordering = state.ordering.clone();
            loggers.push(ValueLogger::new(
                &parameters.join("infection_order.csv"),
                None,
                reset,
                Box::new(move || {
                    ordering
                        .value()
                        .iter()
                        .map(|infection| infection.id().clone())
                        .collect()
                }),
            )?);
        }

        for (index, infection) in state.infections.iter().enumerate() {
            let name = format!("{}.csv", sanitize_path_component(infection.id()));
            loggers.push(scalar_logger(
                eps_pos.join(&name),
                "eps_pos",
                reset,
                state.eps_pos[index].clone(),
            )?);
            loggers.push(scalar_logger(
                eps_neg.join(&name),
                "eps_neg",
                reset,
                state.eps_neg[index].clone(),
            )?);
            loggers.push(scalar_logger(
                durations.join(&name),
                "duration",
                reset,
                infection.duration().clone(),
            )?);
        }

        for locus in state.loci.values() {
            let frequency = state.allele_frequencies.frequencies(locus);
            loggers.push(ValueLogger::new(
                &frequencies.join(format!("{}.csv", sanitize_path_component(locus.label()))),
                None,
                reset,
                Box::new(move || {
                    frequency
                        .value()
                        .frequencies()
                        .iter()
                        .map(|f| format!("{}", f))
                        .collect()
                }),
            )?);
        }

        for (tree, infections) in [
            (&genotypes, &state.infections),
            (&latent_parents, &state.latent_parents),
        ]
        .iter()
        {
            for infection in infections.iter() {
                let dir = tree.join(sanitize_path_component(infection.id()));
                fs::create_dir_all(&dir)?;
                for locus in infection.loci().to_vec() {
                    let genotype = infection.latent_genotype(&locus);
                    loggers.push(ValueLogger::new(
                        &dir.join(format!("{}.csv", sanitize_path_component(locus.label()))),
                        None,
                        reset,
                        Box::new(move || vec![genotype.value().to_bitstring()]),
                    )?);
                }
            }
        }

        let network_path = root.join("network");
        let network = if reset || !network_path.exists() {
            File::create(&network_path)?
        } else {
            OpenOptions::new().append(true).open(&network_path)?
        };

        Ok(StateLogger {
            loggers,
            network: RefCell::new(network),
            state: state.clone(),
            model: model.clone(),
        })
    }

    pub fn log(&self) -> Result<()> {
        for logger in &self.loggers {
            logger.log()?;
        }
        self.log_network()
    }

    /// One JSON line per interval: the current ordering, each child's
    /// order-derived parent candidates, and the log-likelihood of every
    /// evaluated parent-set hypothesis.
    fn log_network(&self) -> Result<()> {
        let ordering: Vec<String> = self
            .state
            .ordering
            .value()
            .iter()
            .map(|infection| infection.id().clone())
            .collect();
        let parents: std::collections::BTreeMap<String, Vec<String>> = self
            .model
            .parent_sets()
            .iter()
            .map(|(child, set)| (child.clone(), set.value().keys().cloned().collect()))
            .collect();
        let hypotheses: std::collections::BTreeMap<String, Vec<serde_json::Value>> = self
            .model
            .transmission_processes()
            .iter()
            .map(|process| {
                let rows = process
                    .hypothesis_distribution()
                    .into_iter()
                    .map(|(parents, loglik)| {
                        serde_json::json!({ "parents": parents, "loglik": loglik })
                    })
                    .collect();
                (process.child().id().clone(), rows)
            })
            .collect();
        let row = serde_json::json!({
            "ordering": ordering,
            "parents": parents,
            "hypotheses": hypotheses,
        });
        let mut network = self.network.borrow_mut();
        writeln!(network, "{}", row)?;
        network.flush()?;
        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.network.borrow_mut().flush()?;
        Ok(())
    }
}

/// Logs the posterior decomposition of a chain's model.
pub struct ModelLogger {
    logger: ValueLogger,
}

impl ModelLogger {
    pub fn new(model: &Rc<Model>, root: &Path, reset: bool) -> Result<Self> {
        let model = model.clone();
        let logger = ValueLogger::new(
            &root.join("model.csv"),
            Some("posterior"),
            reset,
            Box::new(move || {
                vec![
                    format!("{}", *model.value()),
                    format!("{}", *model.likelihood()),
                    format!("{}", *model.prior()),
                ]
            }),
        )?;
        Ok(ModelLogger { logger })
    }

    pub fn log(&self) -> Result<()> {
        self.logger.log()
    }
}

/// Last row of an output CSV, for resuming a run in place.
pub fn last_line(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("cannot hotload from {}", path.display()))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last.ok_or_else(|| {
        crate::errors::Error::HotloadMissing {
            path: path.to_owned(),
        }
        .into()
    })
}

pub fn hotload_scalar(path: &Path) -> Result<f64> {
    let line = last_line(path)?;
    Ok(line.trim().parse()?)
}

pub fn hotload_vector(path: &Path) -> Result<Vec<f64>> {
    let line = last_line(path)?;
    line.split(',')
        .map(|field| field.trim().parse().map_err(Into::into))
        .collect()
}

pub fn hotload_string(path: &Path) -> Result<String> {
    Ok(last_line(path)?.trim().to_owned())
}
