// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use structopt::StructOpt;

use crate::errors;
use crate::io::input::{load_duration_prior, load_input};
use crate::samplers::replica::{ReplicaExchange, ReplicaExchangeConfigBuilder};

#[derive(Debug, StructOpt, Serialize, Deserialize, Clone)]
#[structopt(
    name = "paratrace",
    about = "Reconstruct malaria transmission networks from genotyped infections.",
    setting = structopt::clap::AppSettings::ColoredHelp,
)]
pub enum Paratrace {
    #[structopt(
        name = "run",
        about = "Sample the posterior over orderings, parent sets, latent genotypes, \
                 allele frequencies and global parameters by MCMC with replica exchange.",
        setting = structopt::clap::AppSettings::ColoredHelp,
    )]
    Run {
        #[structopt(
            long,
            short = "b",
            default_value = "5000",
            help = "Number of steps used for burnin."
        )]
        burnin: u64,
        #[structopt(
            long,
            short = "s",
            default_value = "10000",
            help = "Total number of sampling steps after burnin."
        )]
        sample: u64,
        #[structopt(
            long,
            short = "t",
            default_value = "100",
            help = "Log one sample every this many sampling steps."
        )]
        thin: u64,
        #[structopt(
            long = "numchains",
            short = "n",
            default_value = "1",
            help = "Number of chains in the replica exchange algorithm."
        )]
        numchains: usize,
        #[structopt(
            long = "numcores",
            short = "c",
            default_value = "1",
            help = "Number of cores used to step chains concurrently."
        )]
        numcores: usize,
        #[structopt(
            long,
            short = "g",
            default_value = "1",
            help = "Inverse temperature of the hottest chain; the coldest chain always \
                    runs at 1."
        )]
        gradient: f64,
        #[structopt(
            long,
            default_value = "-1",
            help = "Random number generator seed. -1 derives a seed from the system \
                    clock. Reproducibility is only guaranteed for a single chain on a \
                    single core.",
            allow_hyphen_values = true
        )]
        seed: i64,
        #[structopt(
            long,
            help = "Resume from the last row of the existing CSV outputs."
        )]
        hotload: bool,
        #[structopt(
            long = "null-model",
            help = "Ignore all genotype likelihoods and retain only the transmission \
                    topology priors."
        )]
        null_model: bool,
        #[structopt(long, short = "i", parse(from_os_str), help = "Input JSON file (optionally gzip-compressed).")]
        input: PathBuf,
        #[structopt(
            long = "output-dir",
            short = "o",
            parse(from_os_str),
            help = "Directory receiving the CSV output tree. Must exist."
        )]
        output_dir: PathBuf,
        #[structopt(
            long = "symptomatic-idp",
            parse(from_os_str),
            help = "Infection duration prior for symptomatic infections, one probability per line."
        )]
        symptomatic_idp: PathBuf,
        #[structopt(
            long = "asymptomatic-idp",
            parse(from_os_str),
            help = "Infection duration prior for asymptomatic infections, one probability per line."
        )]
        asymptomatic_idp: PathBuf,
    },
}

/// Exit status for a failed run: 1 for command-line misuse, 2 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<errors::Error>() {
        Some(errors::Error::InputFileMissing { .. })
        | Some(errors::Error::OutputDirMissing { .. })
        | Some(errors::Error::InvalidGradient)
        | Some(errors::Error::InvalidChainCount) => 1,
        _ => 2,
    }
}

pub fn run(opt: Paratrace) -> Result<()> {
    match opt {
        Paratrace::Run {
            burnin,
            sample,
            thin,
            numchains,
            numcores,
            gradient,
            seed,
            hotload,
            null_model,
            input,
            output_dir,
            symptomatic_idp,
            asymptomatic_idp,
        } => {
            if !output_dir.is_dir() {
                return Err(errors::Error::OutputDirMissing { path: output_dir }.into());
            }

            let document = load_input(&input)?;
            let symptomatic_prior = load_duration_prior(&symptomatic_idp)?;
            let asymptomatic_prior = load_duration_prior(&asymptomatic_idp)?;

            let seed = if seed == -1 {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("system clock before unix epoch")
                    .as_nanos() as u64
            } else {
                seed as u64
            };
            info!("seed used: {}", seed);
            if null_model {
                info!("running the null model (no genotype likelihoods)");
            }

            // first SIGINT/SIGTERM requests a clean shutdown, a second one
            // aborts immediately
            let interrupted = Arc::new(AtomicBool::new(false));
            for signal in &[signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                signal_hook::flag::register_conditional_shutdown(
                    *signal,
                    130,
                    interrupted.clone(),
                )?;
                signal_hook::flag::register(*signal, interrupted.clone())?;
            }

            let config = ReplicaExchangeConfigBuilder::default()
                .num_chains(numchains)
                .num_cores(numcores)
                .gradient(gradient)
                .seed(seed)
                .output_dir(output_dir)
                .hotload(hotload)
                .null_model(null_model)
                .build()
                .expect("replica exchange configuration");

            let mut replica_exchange = ReplicaExchange::new(
                &config,
                &document,
                &symptomatic_prior,
                &asymptomatic_prior,
            )?;

            info!("starting log likelihood: {:.2}", replica_exchange.cold_log_likelihood()?);

            for step in 0..burnin {
                if interrupted.load(Ordering::Relaxed) {
                    break;
                }
                replica_exchange.sample()?;
                if (step + 1) % thin.max(1) == 0 {
                    info!(
                        "(b={}) log likelihood: {:.2}",
                        step + 1,
                        replica_exchange.cold_log_likelihood()?
                    );
                }
            }

            for step in 0..sample {
                if interrupted.load(Ordering::Relaxed) {
                    break;
                }
                replica_exchange.sample()?;
                if (step + 1) % thin.max(1) == 0 {
                    replica_exchange.log_sample()?;
                    info!(
                        "(s={}) log likelihood: {:.2}",
                        step + 1,
                        replica_exchange.cold_log_likelihood()?
                    );
                }
            }

            replica_exchange.finalize()?;
            if numchains > 1 {
                info!(
                    "replica swap acceptance rates: {:?}",
                    replica_exchange.swap_acceptance_rates()
                );
            }
            Ok(())
        }
    }
}
