// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors;
use crate::io::input::InputDocument;
use crate::io::logger::{ModelLogger, StateLogger};
use crate::model::distributions::DiscreteDistribution;
use crate::model::{Model, State, TransmissionModel};
use crate::samplers::assembly::build_scheduler;
use crate::samplers::SharedRng;

/// Configuration of the parallel-tempering run.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned")]
pub struct ReplicaExchangeConfig {
    pub num_chains: usize,
    /// Inverse temperature of the hottest chain; the coldest sits at 1.
    pub gradient: f64,
    pub seed: u64,
    pub output_dir: PathBuf,
    #[builder(default = "1")]
    pub samples_per_step: usize,
    /// Upper bound on chains stepping concurrently.
    #[builder(default = "1")]
    pub num_cores: usize,
    #[builder(default = "false")]
    pub hotload: bool,
    #[builder(default = "false")]
    pub null_model: bool,
    #[builder(default)]
    pub transmission_model: TransmissionModel,
}

enum Command {
    Step,
    SetTemperature(f64),
    Potential,
    LogSample,
    Finalize,
    Shutdown,
}

enum Reply {
    Ready,
    Stepped,
    Potential(f64),
    Logged,
    Finalized,
    Failed(String),
}

struct ChainHandle {
    commands: Sender<Command>,
    replies: Receiver<Reply>,
    worker: Option<JoinHandle<()>>,
}

/// The parallel-tempering outer loop. Each chain owns a deeply independent
/// state, model, scheduler and RNG on its own worker thread; the driver only
/// shuffles the temperature assignment between them, so every chain's
/// loggers keep following the same chain.
pub struct ReplicaExchange {
    chains: Vec<ChainHandle>,
    temperatures: Vec<f64>,
    /// temperature-ladder position -> chain index
    swap_indices: Vec<usize>,
    swap_attempts: Vec<u64>,
    swap_accepts: Vec<u64>,
    even_swap: bool,
    num_cores: usize,
    rng: StdRng,
}

impl ReplicaExchange {
    pub fn new(
        config: &ReplicaExchangeConfig,
        input: &InputDocument,
        symptomatic_prior: &DiscreteDistribution,
        asymptomatic_prior: &DiscreteDistribution,
    ) -> Result<Self> {
        if config.num_chains < 1 {
            return Err(errors::Error::InvalidChainCount.into());
        }
        if config.gradient <= 0.0 || config.gradient > 1.0 {
            return Err(errors::Error::InvalidGradient.into());
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let shared_input = Arc::new(input.clone());
        let shared_symptomatic = Arc::new(symptomatic_prior.clone());
        let shared_asymptomatic = Arc::new(asymptomatic_prior.clone());

        let temperature_step = (1.0 - config.gradient) / config.num_chains as f64;
        let temperatures: Vec<f64> = (0..config.num_chains)
            .map(|idx| 1.0 - temperature_step * idx as f64)
            .collect();

        let mut chains = Vec::new();
        for (index, &temperature) in temperatures.iter().enumerate() {
            let chain_seed: u64 = rng.gen();
            let (command_tx, command_rx) = unbounded();
            let (reply_tx, reply_rx) = unbounded();
            let worker_input = shared_input.clone();
            let worker_symptomatic = shared_symptomatic.clone();
            let worker_asymptomatic = shared_asymptomatic.clone();
            let worker_config = config.clone();
            // only the first chain resets existing output files
            let reset = !config.hotload && index == 0;

            let worker = std::thread::Builder::new()
                .name(format!("chain-{}", index))
                .spawn(move || {
                    chain_worker(
                        worker_config,
                        worker_input,
                        worker_symptomatic,
                        worker_asymptomatic,
                        chain_seed,
                        temperature,
                        reset,
                        command_rx,
                        reply_tx,
                    )
                })?;

            // construct chains one at a time so output files are created
            // exactly once before any appends
            match reply_rx.recv() {
                Ok(Reply::Ready) => (),
                Ok(Reply::Failed(msg)) => {
                    return Err(errors::Error::ChainStartup { msg }.into());
                }
                _ => {
                    return Err(errors::Error::ChainStartup {
                        msg: "chain worker hung up during construction".to_owned(),
                    }
                    .into());
                }
            }

            chains.push(ChainHandle {
                commands: command_tx,
                replies: reply_rx,
                worker: Some(worker),
            });
        }

        Ok(ReplicaExchange {
            chains,
            swap_indices: (0..config.num_chains).collect(),
            swap_attempts: vec![0; config.num_chains.saturating_sub(1)],
            swap_accepts: vec![0; config.num_chains.saturating_sub(1)],
            temperatures,
            even_swap: false,
            num_cores: config.num_cores,
            rng,
        })
    }

    /// One sampling step on every chain, at most `num_cores` of them in
    /// flight at a time, then one round of adjacent swap attempts of
    /// alternating parity.
    pub fn sample(&mut self) -> Result<()> {
        for batch in self.chains.chunks(self.num_cores.max(1)) {
            for chain in batch {
                chain.commands.send(Command::Step)?;
            }
            for chain in batch {
                match chain.replies.recv()? {
                    Reply::Stepped => (),
                    Reply::Failed(msg) => anyhow::bail!("chain step failed: {}", msg),
                    _ => anyhow::bail!("unexpected chain reply"),
                }
            }
        }
        if self.chains.len() > 1 {
            self.swap_adjacent()?;
        }
        Ok(())
    }

    fn potential_of(&self, chain: usize) -> Result<f64> {
        self.chains[chain].commands.send(Command::Potential)?;
        match self.chains[chain].replies.recv()? {
            Reply::Potential(v) => Ok(v),
            _ => anyhow::bail!("unexpected chain reply"),
        }
    }

    fn swap_adjacent(&mut self) -> Result<()> {
        let start = self.even_swap as usize;
        for position in (start..self.chains.len() - 1).step_by(2) {
            let lower_chain = self.swap_indices[position];
            let upper_chain = self.swap_indices[position + 1];
            let beta_lower = self.temperatures[position];
            let beta_upper = self.temperatures[position + 1];

            let v_lower = self.potential_of(lower_chain)?;
            let v_upper = self.potential_of(upper_chain)?;

            let ratio = (beta_upper - beta_lower) * (v_upper - v_lower);
            self.swap_attempts[position] += 1;

            let u: f64 = self.rng.gen();
            if !ratio.is_nan() && u.ln() < ratio {
                self.swap_indices.swap(position, position + 1);
                self.chains[self.swap_indices[position]]
                    .commands
                    .send(Command::SetTemperature(beta_lower))?;
                self.chains[self.swap_indices[position + 1]]
                    .commands
                    .send(Command::SetTemperature(beta_upper))?;
                self.swap_accepts[position] += 1;
                debug!(
                    "accepted replica swap at ladder position {} ({} <-> {})",
                    position, lower_chain, upper_chain
                );
            }
        }
        self.even_swap = !self.even_swap;
        Ok(())
    }

    /// Log the model and state of the chain currently holding the coldest
    /// temperature.
    pub fn log_sample(&self) -> Result<()> {
        let cold = self.swap_indices[0];
        self.chains[cold].commands.send(Command::LogSample)?;
        match self.chains[cold].replies.recv()? {
            Reply::Logged => Ok(()),
            Reply::Failed(msg) => anyhow::bail!("logging failed: {}", msg),
            _ => anyhow::bail!("unexpected chain reply"),
        }
    }

    /// Log likelihood of the chain currently holding the coldest
    /// temperature, for progress reporting.
    pub fn cold_log_likelihood(&self) -> Result<f64> {
        let cold = self.swap_indices[0];
        self.chains[cold].commands.send(Command::Potential)?;
        match self.chains[cold].replies.recv()? {
            Reply::Potential(v) => Ok(-v),
            _ => anyhow::bail!("unexpected chain reply"),
        }
    }

    pub fn swap_acceptance_rates(&self) -> Vec<f64> {
        self.swap_attempts
            .iter()
            .zip(&self.swap_accepts)
            .map(|(attempts, accepts)| {
                if *attempts == 0 {
                    0.0
                } else {
                    *accepts as f64 / *attempts as f64
                }
            })
            .collect()
    }

    pub fn finalize(&mut self) -> Result<()> {
        for chain in &self.chains {
            chain.commands.send(Command::Finalize)?;
        }
        for chain in &self.chains {
            match chain.replies.recv()? {
                Reply::Finalized => (),
                _ => anyhow::bail!("unexpected chain reply"),
            }
        }
        Ok(())
    }
}

impl Drop for ReplicaExchange {
    fn drop(&mut self) {
        for chain in &self.chains {
            let _ = chain.commands.send(Command::Shutdown);
        }
        for chain in &mut self.chains {
            if let Some(worker) = chain.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn chain_worker(
    config: ReplicaExchangeConfig,
    input: Arc<InputDocument>,
    symptomatic_prior: Arc<DiscreteDistribution>,
    asymptomatic_prior: Arc<DiscreteDistribution>,
    seed: u64,
    temperature: f64,
    reset: bool,
    commands: Receiver<Command>,
    replies: Sender<Reply>,
) {
    let built = build_chain(
        &config,
        &input,
        &symptomatic_prior,
        &asymptomatic_prior,
        seed,
        temperature,
        reset,
    );
    let chain = match built {
        Ok(chain) => {
            let _ = replies.send(Reply::Ready);
            chain
        }
        Err(err) => {
            let _ = replies.send(Reply::Failed(format!("{:#}", err)));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Step => {
                chain.scheduler.step();
                let _ = replies.send(Reply::Stepped);
            }
            Command::SetTemperature(beta) => {
                chain.model.set_temperature(beta);
            }
            Command::Potential => {
                let _ = replies.send(Reply::Potential(chain.model.potential()));
            }
            Command::LogSample => {
                let outcome = chain
                    .model_logger
                    .log()
                    .and_then(|_| chain.state_logger.log());
                let _ = match outcome {
                    Ok(()) => replies.send(Reply::Logged),
                    Err(err) => replies.send(Reply::Failed(format!("{:#}", err))),
                };
            }
            Command::Finalize => {
                let _ = chain.state_logger.finalize();
                let _ = replies.send(Reply::Finalized);
            }
            Command::Shutdown => break,
        }
    }
}

struct Chain {
    model: Rc<Model>,
    scheduler: crate::samplers::scheduler::RandomizedScheduler,
    state_logger: StateLogger,
    model_logger: ModelLogger,
}

fn build_chain(
    config: &ReplicaExchangeConfig,
    input: &InputDocument,
    symptomatic_prior: &DiscreteDistribution,
    asymptomatic_prior: &DiscreteDistribution,
    seed: u64,
    temperature: f64,
    reset: bool,
) -> Result<Chain> {
    let mut rng = StdRng::seed_from_u64(seed);
    let symptomatic = Rc::new(symptomatic_prior.clone());
    let asymptomatic = Rc::new(asymptomatic_prior.clone());

    let state = if config.hotload {
        State::hotload(
            input,
            &symptomatic,
            &asymptomatic,
            &mut rng,
            &config.output_dir,
        )?
    } else {
        State::new(input, &symptomatic, &asymptomatic, &mut rng)?
    };
    let model = Model::new(
        &state,
        temperature,
        config.null_model,
        config.transmission_model,
    )?;

    let shared_rng: SharedRng = Rc::new(std::cell::RefCell::new(rng));
    let scheduler = build_scheduler(
        &state,
        &model,
        &shared_rng,
        config.samples_per_step,
        config.null_model,
    );

    let state_logger = StateLogger::new(&state, &model, &config.output_dir, reset)?;
    let model_logger = ModelLogger::new(&model, &config.output_dir, reset)?;

    Ok(Chain {
        model,
        scheduler,
        state_logger,
        model_logger,
    })
}
