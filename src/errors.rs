use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub(crate) enum Error {
    #[error("input file {path} does not exist")]
    InputFileMissing { path: PathBuf },
    #[error("output directory {path} does not exist")]
    OutputDirMissing { path: PathBuf },
    #[error("infection {infection} refers to unknown locus {locus}")]
    UnknownLocus { infection: String, locus: String },
    #[error("locus {locus} declares {declared} alleles but must declare between 1 and {max}")]
    InvalidAlleleCount {
        locus: String,
        declared: usize,
        max: usize,
    },
    #[error(
        "genotype of infection {infection} at locus {locus} has {observed} positions but the locus has {alleles} alleles"
    )]
    GenotypeExceedsLocus {
        infection: String,
        locus: String,
        observed: usize,
        alleles: usize,
    },
    #[error("genotype of infection {infection} at locus {locus} cannot be parsed: {msg}")]
    InvalidGenotype {
        infection: String,
        locus: String,
        msg: String,
    },
    #[error("allowed_parents refers to unknown infection {name}")]
    UnknownAllowedParent { name: String },
    #[error("duplicate infection id {name}")]
    DuplicateInfection { name: String },
    #[error("infection duration prior {path} is empty or contains non-probabilities")]
    InvalidDurationPrior { path: PathBuf },
    #[error(
        "initial log posterior is -inf: infection {infection} is infeasible under parent set {{{parents}}}"
    )]
    InfeasibleInitialState { infection: String, parents: String },
    #[error("hotload requires existing output in {path}")]
    HotloadMissing { path: PathBuf },
    #[error("replica exchange chain failed to start: {msg}")]
    ChainStartup { msg: String },
    #[error("--gradient must be in (0, 1]")]
    InvalidGradient,
    #[error("--numchains must be at least 1")]
    InvalidChainCount,
}
