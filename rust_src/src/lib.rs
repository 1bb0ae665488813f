//! Marginal maximum likelihood estimation for multidimensional item response theory.
//!
//! This crate provides:
//! - Dichotomous, graded, nominal, partially compensatory and nested-logit item models
//! - EM estimation on a quadrature grid, with Ramsay acceleration and empirical histograms
//! - Metropolis-Hastings Robbins-Monro estimation for high-dimensional models
//! - Standard errors (Fisher, BL, complete, SEM, MHRM, crossprod, Louis, sandwich)
//! - Person scoring (EAP, MAP, ML, WLE, EAPsum) with multiple imputation
//! - Optional Python bindings behind the `python` feature

pub mod utils;

pub mod config;
pub mod data;
pub mod em;
pub mod error;
pub mod estep;
pub mod fit;
pub mod items;
pub mod linalg;
pub mod mhrm;
pub mod model;
pub mod mstep;
pub mod parallel;
pub mod quadrature;
pub mod scoring;
pub mod standard_errors;
pub mod start;

#[cfg(feature = "python")]
pub mod python;

pub use config::{Accelerate, FitOptions, Method, Optimizer, PriorDensity, SeType, Technical};
pub use data::{PatternTable, ResponseMatrix, MISSING};
pub use error::{FitWarning, MirtError, MirtResult};
pub use fit::{mirt, Coefficient, ConvergedModel, FitStatistics};
pub use items::{Item, ItemType, Param, Prior, TraceModel};
pub use model::{Invariance, Model, ModelSpec, ParRef, ParameterTable};
pub use parallel::{CancelToken, Runtime, WorkerPool};
pub use quadrature::QuadratureGrid;
pub use scoring::{FactorScores, OutputMode, ScoreFlag, ScoreInput, ScoreMethod, ScoreOptions};
pub use standard_errors::InformationMatrix;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module for mirt_engine
#[cfg(feature = "python")]
#[pymodule]
fn mirt_engine(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
