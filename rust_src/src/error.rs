//! Error and warning taxonomy.
//!
//! `MirtError` aborts a call before or during setup. `FitWarning` never aborts: the
//! estimators attach warnings to the returned model and log them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirtError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("quadrature grid would have {nodes} nodes, above the MAXQUAD ceiling of {max}")]
    QuadratureTooLarge { nodes: usize, max: usize },

    #[error("{0} has not been computed")]
    NotComputed(&'static str),

    #[error("linear algebra failure: {0}")]
    Linalg(String),

    #[error("could not parse fit options: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("could not build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

pub type MirtResult<T> = Result<T, MirtError>;

/// Non-fatal conditions raised while fitting or computing standard errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitWarning {
    #[error("estimation stopped at the cycle limit ({cycles}) before converging")]
    MaxCyclesReached { cycles: usize },

    #[error("log-likelihood decreased by {change:.3e} at cycle {cycle}")]
    LogLikelihoodDecreased { cycle: usize, change: f64 },

    #[error("estimation cancelled at cycle {cycle}")]
    Cancelled { cycle: usize },

    #[error("parameter changes stayed large (median {max_change:.3e}); likelihood surface may be flat")]
    FlatLikelihood { max_change: f64 },

    #[error("M-step failed for group {group} item {item} at cycle {cycle}; previous values kept")]
    ItemOptimizationFailed { group: usize, item: usize, cycle: usize },

    #[error("group {group} latent parameters could not be updated at cycle {cycle}")]
    GroupOptimizationFailed { group: usize, cycle: usize },

    #[error("information matrix is not positive definite (smallest eigenvalue {min_eigenvalue:.3e})")]
    NotPositiveDefinite { min_eigenvalue: f64 },

    #[error("information matrix is near singular (condition number {condition:.3e})")]
    NearSingular { condition: f64 },

    #[error("slope {name} of group {group} item {item} is {value:.3}, outside a sane range")]
    SlopeOutOfRange {
        group: usize,
        item: usize,
        name: String,
        value: f64,
    },
}

/// Log and record a warning.
pub(crate) fn raise(warnings: &mut Vec<FitWarning>, warning: FitWarning) {
    log::warn!("{}", warning);
    warnings.push(warning);
}
