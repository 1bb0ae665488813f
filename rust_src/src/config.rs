//! Estimation options.
//!
//! Everything serialisable can be read from TOML; the custom prior density and custom
//! grid are runtime-only and set in code.

use std::fmt;
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{MirtError, MirtResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Method {
    #[default]
    #[serde(rename = "EM")]
    Em,
    #[serde(rename = "MHRM")]
    Mhrm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SeType {
    Fisher,
    #[serde(rename = "BL")]
    Bl,
    Complete,
    #[serde(rename = "SEM")]
    Sem,
    #[serde(rename = "MHRM")]
    Mhrm,
    #[default]
    Crossprod,
    Louis,
    Sandwich,
}

impl fmt::Display for SeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SeType::Fisher => "Fisher",
            SeType::Bl => "BL",
            SeType::Complete => "complete",
            SeType::Sem => "SEM",
            SeType::Mhrm => "MHRM",
            SeType::Crossprod => "crossprod",
            SeType::Louis => "Louis",
            SeType::Sandwich => "sandwich",
        };
        f.write_str(name)
    }
}

/// M-step optimiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Optimizer {
    /// Quasi-Newton; switches to `BoundedBfgs` when a free parameter has finite bounds.
    #[default]
    Bfgs,
    BoundedBfgs,
    NewtonRaphson,
    /// Derivative-free simplex search
    NelderMead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Accelerate {
    None,
    #[default]
    Ramsay,
}

/// Unnormalised latent density used in place of the multivariate normal.
#[derive(Clone)]
pub struct PriorDensity(pub Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>);

impl PriorDensity {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        PriorDensity(Arc::new(f))
    }

    pub fn eval(&self, theta: &[f64]) -> f64 {
        (self.0)(theta)
    }
}

impl fmt::Debug for PriorDensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PriorDensity(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Technical {
    /// Grid-size ceiling
    pub max_quad: usize,
    pub ncycles: Option<usize>,
    pub burnin: usize,
    pub semcycles: usize,
    /// Robbins-Monro gain (g0, g1): gamma_k = (g0 / k)^g1
    pub gain: (f64, f64),
    pub seed: u64,
    pub theta_lim: (f64, f64),
    /// Metropolis-Hastings candidate widths per dimension; tuned automatically when absent
    pub mh_widths: Option<Vec<f64>>,
    pub mstep_tol: f64,
    pub mstep_maxit: usize,
    pub sem_tol: Option<f64>,
    pub mc_draws: usize,
    #[serde(skip)]
    pub custom_prior: Option<PriorDensity>,
    #[serde(skip)]
    pub custom_grid: Option<Array2<f64>>,
}

impl Default for Technical {
    fn default() -> Self {
        Technical {
            max_quad: 20000,
            ncycles: None,
            burnin: 150,
            semcycles: 50,
            gain: (0.15, 0.65),
            seed: 12345,
            theta_lim: (-4.0, 4.0),
            mh_widths: None,
            mstep_tol: 1e-7,
            mstep_maxit: 200,
            sem_tol: None,
            mc_draws: 5000,
            custom_prior: None,
            custom_grid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub method: Method,
    #[serde(rename = "SE")]
    pub se: bool,
    #[serde(rename = "SE_type")]
    pub se_type: SeType,
    pub quadpts: Option<usize>,
    #[serde(rename = "TOL")]
    pub tol: Option<f64>,
    pub accelerate: Accelerate,
    pub empirical_histogram: bool,
    pub calc_null: bool,
    /// Average the information matrix with its transpose
    pub symmetric: bool,
    pub optimizer: Optimizer,
    pub technical: Technical,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            method: Method::Em,
            se: false,
            se_type: SeType::Crossprod,
            quadpts: None,
            tol: None,
            accelerate: Accelerate::Ramsay,
            empirical_histogram: false,
            calc_null: true,
            symmetric: true,
            optimizer: Optimizer::Bfgs,
            technical: Technical::default(),
        }
    }
}

impl FitOptions {
    pub fn from_toml_str(s: &str) -> MirtResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn em() -> Self {
        FitOptions::default()
    }

    pub fn mhrm() -> Self {
        FitOptions {
            method: Method::Mhrm,
            se_type: SeType::Mhrm,
            ..FitOptions::default()
        }
    }

    pub fn with_se(mut self, se_type: SeType) -> Self {
        self.se = true;
        self.se_type = se_type;
        self
    }

    /// Convergence tolerance after method-specific defaults.
    pub fn effective_tol(&self) -> f64 {
        match (self.tol, self.method) {
            (Some(tol), _) => tol,
            (None, Method::Mhrm) => 1e-3,
            (None, Method::Em) if self.empirical_histogram => 3e-5,
            (None, Method::Em) => 1e-4,
        }
    }

    pub fn effective_ncycles(&self) -> usize {
        match (self.technical.ncycles, self.method) {
            (Some(n), _) => n,
            (None, Method::Mhrm) => 2000,
            (None, Method::Em) if self.empirical_histogram => 2000,
            (None, Method::Em) => 500,
        }
    }

    /// Ramsay acceleration is never applied when the SEM trajectory is needed.
    pub fn accelerate_active(&self) -> bool {
        self.accelerate == Accelerate::Ramsay && !(self.se && self.se_type == SeType::Sem)
    }

    /// SEM needs the EM parameter trajectory and a parameter-change stopping rule.
    pub fn sem_mode(&self) -> bool {
        self.se && self.se_type == SeType::Sem && self.method == Method::Em
    }

    /// Reject option combinations before any computation starts.
    pub fn validate(&self, nfact: usize) -> MirtResult<()> {
        if self.se {
            match (self.method, self.se_type) {
                (Method::Mhrm, SeType::Sem) => {
                    return Err(MirtError::Configuration(
                        "SE type 'SEM' requires method 'EM'".into(),
                    ))
                }
                (Method::Em, SeType::Mhrm) => {
                    return Err(MirtError::Configuration(
                        "SE type 'MHRM' requires method 'MHRM'".into(),
                    ))
                }
                _ => {}
            }
            if self.empirical_histogram
                && matches!(self.se_type, SeType::Fisher | SeType::Sem | SeType::Mhrm)
            {
                return Err(MirtError::Configuration(format!(
                    "SE type '{}' is not available with an empirical histogram",
                    self.se_type
                )));
            }
        }
        if self.empirical_histogram {
            if nfact != 1 {
                return Err(MirtError::Configuration(
                    "empirical histogram estimation is only available for one factor".into(),
                ));
            }
            if self.method == Method::Mhrm {
                return Err(MirtError::Configuration(
                    "empirical histogram estimation requires method 'EM'".into(),
                ));
            }
        }
        if self.effective_tol() <= 0.0 {
            return Err(MirtError::Configuration("TOL must be positive".into()));
        }
        let (g0, g1) = self.technical.gain;
        if g0 <= 0.0 || g1 <= 0.0 || g1 > 1.0 {
            return Err(MirtError::Configuration(format!(
                "gain ({}, {}) must satisfy g0 > 0 and 0 < g1 <= 1",
                g0, g1
            )));
        }
        if let Some(widths) = &self.technical.mh_widths {
            if widths.len() != nfact || widths.iter().any(|&w| !(w > 0.0)) {
                return Err(MirtError::Configuration(format!(
                    "mh_widths needs {} positive values",
                    nfact
                )));
            }
        }
        let (lo, hi) = self.technical.theta_lim;
        if !(lo < hi) {
            return Err(MirtError::Configuration("theta_lim must be increasing".into()));
        }
        Ok(())
    }
}
