// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Bayesian reconstruction of malaria transmission networks from genotyped
//! infections. The posterior over infection orderings, parent sets, latent
//! genotypes, allele frequencies and global scalar parameters is explored by
//! MCMC over an incrementally re-evaluated computation graph.

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate derive_builder;

pub mod cli;
pub mod core;
pub mod datatypes;
pub(crate) mod errors;
pub mod io;
pub mod model;
pub mod samplers;
pub mod utils;

use bio::stats::LogProb;

/// Log-space likelihood value used throughout the computation graph.
/// `LogProb::ln_zero()` marks numeric infeasibility and is expected to flow
/// through the graph rather than being raised as an error.
pub type Likelihood = LogProb;
