//! Item response models and their parameters.
//!
//! Every item stores its parameters on the reporting scale. The optimisers work on the
//! raw scale given by each parameter's `ParTransform`, so derivatives returned here
//! (`dprob`, `dprob_at`, `Prior::grad`) are all with respect to raw values.

pub mod dichotomous;
pub mod graded;
pub mod nested;
pub mod nominal;
pub mod partcomp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use statrs::function::beta::ln_beta;

use crate::error::{MirtError, MirtResult};
use crate::utils::{clip, logit, num_jacobian, sigmoid, LOG_2_PI};

/// Floor applied to category probabilities so their logs stay finite.
pub const P_FLOOR: f64 = 1e-20;

/// Map between the reporting scale and the optimiser's scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ParTransform {
    #[default]
    Identity,
    /// Probability-valued parameters (g, u) are optimised as logits
    Logit,
}

impl ParTransform {
    pub fn to_raw(self, value: f64) -> f64 {
        match self {
            ParTransform::Identity => value,
            ParTransform::Logit => logit(clip(value, 1e-10, 1.0 - 1e-10)),
        }
    }

    pub fn from_raw(self, raw: f64) -> f64 {
        match self {
            ParTransform::Identity => raw,
            ParTransform::Logit => sigmoid(raw),
        }
    }

    /// d value / d raw
    pub fn jacobian(self, raw: f64) -> f64 {
        match self {
            ParTransform::Identity => 1.0,
            ParTransform::Logit => {
                let p = sigmoid(raw);
                p * (1.0 - p)
            }
        }
    }
}

/// Prior density added to the M-step objective.
///
/// `Normal` applies to the raw value; `LogNormal` and `Beta` apply to the reported value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Prior {
    #[default]
    None,
    Normal { mean: f64, sd: f64 },
    LogNormal { meanlog: f64, sdlog: f64 },
    Beta { alpha: f64, beta: f64 },
}

impl Prior {
    pub fn is_none(&self) -> bool {
        matches!(self, Prior::None)
    }

    pub fn log_density(&self, raw: f64, transform: ParTransform) -> f64 {
        let v = transform.from_raw(raw);
        match *self {
            Prior::None => 0.0,
            Prior::Normal { mean, sd } => {
                let z = (raw - mean) / sd;
                -0.5 * (z * z + LOG_2_PI) - sd.ln()
            }
            Prior::LogNormal { meanlog, sdlog } => {
                if v <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let z = (v.ln() - meanlog) / sdlog;
                -v.ln() - sdlog.ln() - 0.5 * (z * z + LOG_2_PI)
            }
            Prior::Beta { alpha, beta } => {
                if v <= 0.0 || v >= 1.0 {
                    return f64::NEG_INFINITY;
                }
                (alpha - 1.0) * v.ln() + (beta - 1.0) * (1.0 - v).ln() - ln_beta(alpha, beta)
            }
        }
    }

    /// Derivative of `log_density` with respect to the raw value.
    pub fn grad(&self, raw: f64, transform: ParTransform) -> f64 {
        let v = transform.from_raw(raw);
        let jac = transform.jacobian(raw);
        match *self {
            Prior::None => 0.0,
            Prior::Normal { mean, sd } => -(raw - mean) / (sd * sd),
            Prior::LogNormal { meanlog, sdlog } => {
                if v <= 0.0 {
                    return 0.0;
                }
                (-1.0 / v - (v.ln() - meanlog) / (sdlog * sdlog * v)) * jac
            }
            Prior::Beta { alpha, beta } => {
                if v <= 0.0 || v >= 1.0 {
                    return 0.0;
                }
                ((alpha - 1.0) / v - (beta - 1.0) / (1.0 - v)) * jac
            }
        }
    }
}

/// One named item or group parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    /// Reporting-scale value
    pub value: f64,
    pub free: bool,
    pub lbound: f64,
    pub ubound: f64,
    pub prior: Prior,
    pub transform: ParTransform,
}

impl Param {
    pub fn new(name: impl Into<String>, value: f64, free: bool) -> Self {
        Param {
            name: name.into(),
            value,
            free,
            lbound: f64::NEG_INFINITY,
            ubound: f64::INFINITY,
            prior: Prior::None,
            transform: ParTransform::Identity,
        }
    }

    /// A parameter living in [0, 1], optimised on the logit scale.
    pub fn probability(name: impl Into<String>, value: f64, free: bool) -> Self {
        Param {
            lbound: 0.0,
            ubound: 1.0,
            transform: ParTransform::Logit,
            ..Param::new(name, value, free)
        }
    }

    pub fn raw(&self) -> f64 {
        self.transform.to_raw(self.value)
    }

    pub fn set_raw(&mut self, raw: f64) {
        self.value = self.transform.from_raw(raw);
    }

    /// Bounds on the raw scale; the logit transform already enforces [0, 1].
    pub fn raw_bounds(&self) -> (f64, f64) {
        match self.transform {
            ParTransform::Identity => (self.lbound, self.ubound),
            ParTransform::Logit => {
                let lo = if self.lbound > 0.0 {
                    self.transform.to_raw(self.lbound)
                } else {
                    f64::NEG_INFINITY
                };
                let hi = if self.ubound < 1.0 {
                    self.transform.to_raw(self.ubound)
                } else {
                    f64::INFINITY
                };
                (lo, hi)
            }
        }
    }

    pub fn log_prior(&self) -> f64 {
        self.prior.log_density(self.raw(), self.transform)
    }
}

/// User-supplied trace model for item types outside the built-in families.
pub trait TraceModel: Send + Sync {
    fn name(&self) -> &str;

    fn param_names(&self, ncat: usize, nfact: usize) -> Vec<String>;

    fn start_values(&self, ncat: usize, nfact: usize) -> Vec<f64>;

    /// Category probabilities at one latent point.
    fn probtrace(&self, pars: &[f64], theta: ArrayView1<f64>, ncat: usize) -> Vec<f64>;

    /// K×P derivative of the probabilities; `None` falls back to finite differences.
    fn dprob(&self, _pars: &[f64], _theta: ArrayView1<f64>, _ncat: usize) -> Option<Array2<f64>> {
        None
    }
}

#[derive(Clone)]
pub enum ItemType {
    Rasch,
    TwoPL,
    ThreePL,
    ThreePLu,
    FourPL,
    Graded,
    Grsm,
    Gpcm,
    Rsm,
    Nominal,
    PC2PL,
    PC3PL,
    TwoPLNRM,
    ThreePLNRM,
    FourPLNRM,
    Custom(Arc<dyn TraceModel>),
}

impl ItemType {
    pub fn tag(&self) -> &str {
        match self {
            ItemType::Rasch => "Rasch",
            ItemType::TwoPL => "2PL",
            ItemType::ThreePL => "3PL",
            ItemType::ThreePLu => "3PLu",
            ItemType::FourPL => "4PL",
            ItemType::Graded => "graded",
            ItemType::Grsm => "grsm",
            ItemType::Gpcm => "gpcm",
            ItemType::Rsm => "rsm",
            ItemType::Nominal => "nominal",
            ItemType::PC2PL => "PC2PL",
            ItemType::PC3PL => "PC3PL",
            ItemType::TwoPLNRM => "2PLNRM",
            ItemType::ThreePLNRM => "3PLNRM",
            ItemType::FourPLNRM => "4PLNRM",
            ItemType::Custom(model) => model.name(),
        }
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, ItemType::TwoPLNRM | ItemType::ThreePLNRM | ItemType::FourPLNRM)
    }

    /// Types whose intercepts are shared across items of the same type.
    pub fn is_rating_scale(&self) -> bool {
        matches!(self, ItemType::Grsm | ItemType::Rsm)
    }
}

impl fmt::Debug for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Custom(model) => write!(f, "Custom({})", model.name()),
            other => f.write_str(other.tag()),
        }
    }
}

impl PartialEq for ItemType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ItemType::Custom(a), ItemType::Custom(b)) => Arc::ptr_eq(a, b),
            (ItemType::Custom(_), _) | (_, ItemType::Custom(_)) => false,
            _ => self.tag() == other.tag(),
        }
    }
}

impl FromStr for ItemType {
    type Err = MirtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s {
            "Rasch" => ItemType::Rasch,
            "2PL" => ItemType::TwoPL,
            "3PL" => ItemType::ThreePL,
            "3PLu" => ItemType::ThreePLu,
            "4PL" => ItemType::FourPL,
            "graded" => ItemType::Graded,
            "grsm" => ItemType::Grsm,
            "gpcm" => ItemType::Gpcm,
            "rsm" => ItemType::Rsm,
            "nominal" => ItemType::Nominal,
            "PC2PL" => ItemType::PC2PL,
            "PC3PL" => ItemType::PC3PL,
            "2PLNRM" => ItemType::TwoPLNRM,
            "3PLNRM" => ItemType::ThreePLNRM,
            "4PLNRM" => ItemType::FourPLNRM,
            other => return Err(MirtError::Input(format!("unknown item type '{}'", other))),
        };
        Ok(t)
    }
}

/// Trace formula an item dispatches to once its type and category count are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dichotomous,
    Graded,
    Grsm,
    Nominal,
    Rsm,
    PartComp,
    Nested,
    Custom,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub name: String,
    pub itemtype: ItemType,
    pub ncat: usize,
    pub nfact: usize,
    pub pars: Vec<Param>,
    pub loading: Vec<bool>,
    /// Keyed category (recoded) for nested logit items
    pub key: Option<usize>,
}

fn slope_params(nfact: usize, loading: &[bool], free: bool) -> Vec<Param> {
    (0..nfact)
        .map(|k| {
            let v = if loading[k] { 1.0 } else { 0.0 };
            Param::new(format!("a{}", k + 1), v, free && loading[k])
        })
        .collect()
}

/// Evenly spaced decreasing intercepts in [-1.5, 1.5].
fn spread(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![0.0];
    }
    (0..n).map(|i| 1.5 - 3.0 * i as f64 / (n - 1) as f64).collect()
}

fn divide_by_total(
    nfact: usize,
    ncat: usize,
    loading: &[bool],
    slopes_free: bool,
    gpcm: bool,
) -> Vec<Param> {
    let mut pars = slope_params(nfact, loading, slopes_free);
    for k in 0..ncat {
        let interior = k > 0 && k + 1 < ncat;
        pars.push(Param::new(format!("ak{}", k), k as f64, !gpcm && interior));
    }
    pars.push(Param::new("d0", 0.0, false));
    for k in 1..ncat {
        pars.push(Param::new(format!("d{}", k), 0.0, true));
    }
    pars
}

impl Item {
    pub fn new(
        name: impl Into<String>,
        itemtype: ItemType,
        ncat: usize,
        nfact: usize,
        loading: Vec<bool>,
        key: Option<usize>,
    ) -> MirtResult<Self> {
        let name = name.into();
        if loading.len() != nfact || !loading.iter().any(|&l| l) {
            return Err(MirtError::Input(format!(
                "item {} must load on at least one of {} factors",
                name, nfact
            )));
        }
        if ncat < 2 {
            return Err(MirtError::Input(format!("item {} has fewer than 2 categories", name)));
        }
        let dichotomous_only = matches!(
            itemtype,
            ItemType::TwoPL
                | ItemType::ThreePL
                | ItemType::ThreePLu
                | ItemType::FourPL
                | ItemType::PC2PL
                | ItemType::PC3PL
        );
        if dichotomous_only && ncat != 2 {
            return Err(MirtError::Input(format!(
                "item {} has {} categories but type '{}' is dichotomous",
                name,
                ncat,
                itemtype.tag()
            )));
        }
        if itemtype.is_nested() {
            if ncat < 3 {
                return Err(MirtError::Input(format!(
                    "nested logit item {} needs at least 3 categories",
                    name
                )));
            }
            match key {
                Some(k) if k < ncat => {}
                _ => {
                    return Err(MirtError::Input(format!(
                        "nested logit item {} needs a scoring key",
                        name
                    )))
                }
            }
        }

        let pars = match &itemtype {
            ItemType::Rasch if ncat > 2 => divide_by_total(nfact, ncat, &loading, false, true),
            ItemType::Rasch
            | ItemType::TwoPL
            | ItemType::ThreePL
            | ItemType::ThreePLu
            | ItemType::FourPL => {
                let free_g = matches!(itemtype, ItemType::ThreePL | ItemType::FourPL);
                let free_u = matches!(itemtype, ItemType::ThreePLu | ItemType::FourPL);
                let mut pars = slope_params(nfact, &loading, itemtype != ItemType::Rasch);
                pars.push(Param::new("d", 0.0, true));
                pars.push(Param::probability("g", if free_g { 0.2 } else { 0.0 }, free_g));
                pars.push(Param::probability("u", if free_u { 0.95 } else { 1.0 }, free_u));
                pars
            }
            ItemType::Graded | ItemType::Grsm => {
                let mut pars = slope_params(nfact, &loading, true);
                for (k, d) in spread(ncat - 1).into_iter().enumerate() {
                    pars.push(Param::new(format!("d{}", k + 1), d, true));
                }
                if itemtype == ItemType::Grsm {
                    pars.push(Param::new("c", 0.0, true));
                }
                pars
            }
            ItemType::Gpcm => divide_by_total(nfact, ncat, &loading, true, true),
            ItemType::Nominal => divide_by_total(nfact, ncat, &loading, true, false),
            ItemType::Rsm => {
                let mut pars = slope_params(nfact, &loading, false);
                for (k, d) in spread(ncat - 1).into_iter().enumerate() {
                    pars.push(Param::new(format!("d{}", k + 1), -d, true));
                }
                pars.push(Param::new("c", 0.0, true));
                pars
            }
            ItemType::PC2PL | ItemType::PC3PL => {
                let free_g = itemtype == ItemType::PC3PL;
                let mut pars = slope_params(nfact, &loading, true);
                for k in 0..nfact {
                    pars.push(Param::new(format!("d{}", k + 1), 0.0, loading[k]));
                }
                pars.push(Param::probability("g", if free_g { 0.2 } else { 0.0 }, free_g));
                pars.push(Param::probability("u", 1.0, false));
                pars
            }
            ItemType::TwoPLNRM | ItemType::ThreePLNRM | ItemType::FourPLNRM => {
                let free_g = matches!(itemtype, ItemType::ThreePLNRM | ItemType::FourPLNRM);
                let free_u = itemtype == ItemType::FourPLNRM;
                let mut pars = slope_params(nfact, &loading, true);
                pars.push(Param::new("d", 0.0, true));
                pars.push(Param::probability("g", if free_g { 0.2 } else { 0.0 }, free_g));
                pars.push(Param::probability("u", if free_u { 0.95 } else { 1.0 }, free_u));
                let ndist = ncat - 1;
                for k in 0..ndist {
                    let interior = k > 0 && k + 1 < ndist;
                    pars.push(Param::new(format!("ak{}", k), k as f64, interior));
                }
                for k in 0..ndist {
                    pars.push(Param::new(format!("d{}", k), 0.0, k > 0));
                }
                pars
            }
            ItemType::Custom(model) => {
                let names = model.param_names(ncat, nfact);
                let starts = model.start_values(ncat, nfact);
                if names.len() != starts.len() {
                    return Err(MirtError::Input(format!(
                        "custom item type '{}' gives {} names and {} start values",
                        model.name(),
                        names.len(),
                        starts.len()
                    )));
                }
                names
                    .into_iter()
                    .zip(starts)
                    .map(|(n, v)| Param::new(n, v, true))
                    .collect()
            }
        };

        Ok(Item {
            name,
            itemtype,
            ncat,
            nfact,
            pars,
            loading,
            key,
        })
    }

    fn kind(&self) -> Kind {
        match self.itemtype {
            ItemType::Rasch if self.ncat > 2 => Kind::Nominal,
            ItemType::Rasch
            | ItemType::TwoPL
            | ItemType::ThreePL
            | ItemType::ThreePLu
            | ItemType::FourPL => Kind::Dichotomous,
            ItemType::Graded => Kind::Graded,
            ItemType::Grsm => Kind::Grsm,
            ItemType::Gpcm | ItemType::Nominal => Kind::Nominal,
            ItemType::Rsm => Kind::Rsm,
            ItemType::PC2PL | ItemType::PC3PL => Kind::PartComp,
            ItemType::TwoPLNRM | ItemType::ThreePLNRM | ItemType::FourPLNRM => Kind::Nested,
            ItemType::Custom(_) => Kind::Custom,
        }
    }

    pub fn npars(&self) -> usize {
        self.pars.len()
    }

    pub fn n_free(&self) -> usize {
        self.pars.iter().filter(|p| p.free).count()
    }

    pub fn values(&self) -> Vec<f64> {
        self.pars.iter().map(|p| p.value).collect()
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.pars.iter().position(|p| p.name == name)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.pars.iter().map(|p| p.name.clone()).collect()
    }

    /// Indices of the slope parameters `a1..aD`.
    pub fn slope_indices(&self) -> Vec<usize> {
        self.pars
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                let rest = p.name.strip_prefix('a').unwrap_or("");
                !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn set_raw(&mut self, p: usize, raw: f64) {
        self.pars[p].set_raw(raw);
    }

    /// Category probabilities at one latent point for an explicit parameter vector.
    pub fn prob_at(&self, pars: &[f64], theta: ArrayView1<f64>) -> Vec<f64> {
        let (nf, k) = (self.nfact, self.ncat);
        let mut p = match self.kind() {
            Kind::Dichotomous => dichotomous::probs(pars, nf, theta),
            Kind::Graded => graded::probs(pars, nf, k, false, theta),
            Kind::Grsm => graded::probs(pars, nf, k, true, theta),
            Kind::Nominal => nominal::probs(pars, nf, k, theta),
            Kind::Rsm => nominal::rsm_probs(pars, nf, k, theta),
            Kind::PartComp => partcomp::probs(pars, nf, &self.loading, theta),
            Kind::Nested => nested::probs(pars, nf, k, self.key.unwrap_or(k - 1), theta),
            Kind::Custom => match &self.itemtype {
                ItemType::Custom(model) => model.probtrace(pars, theta, k),
                _ => vec![1.0 / k as f64; k],
            },
        };
        for v in p.iter_mut() {
            if !(*v > P_FLOOR) {
                *v = P_FLOOR;
            }
        }
        p
    }

    /// Q×K trace lines at the current parameter values.
    pub fn probtrace(&self, theta: &Array2<f64>) -> Array2<f64> {
        self.probtrace_with(&self.values(), theta)
    }

    pub fn probtrace_with(&self, pars: &[f64], theta: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((theta.nrows(), self.ncat));
        for (q, row) in theta.rows().into_iter().enumerate() {
            let p = self.prob_at(pars, row);
            for k in 0..self.ncat {
                out[[q, k]] = p[k];
            }
        }
        out
    }

    fn analytic_dprob(&self, pars: &[f64], theta: ArrayView1<f64>) -> Option<Array2<f64>> {
        let (nf, k) = (self.nfact, self.ncat);
        match self.kind() {
            Kind::Dichotomous => Some(dichotomous::dprob(pars, nf, theta)),
            Kind::Graded => Some(graded::dprob(pars, nf, k, false, theta)),
            Kind::Grsm => Some(graded::dprob(pars, nf, k, true, theta)),
            Kind::Nominal => Some(nominal::dprob(pars, nf, k, theta)),
            Kind::Rsm => Some(nominal::rsm_dprob(pars, nf, k, theta)),
            Kind::Custom => match &self.itemtype {
                ItemType::Custom(model) => model.dprob(pars, theta, k),
                _ => None,
            },
            Kind::PartComp | Kind::Nested => None,
        }
    }

    /// K×P derivative of each category probability with respect to each raw parameter.
    /// Columns of fixed parameters are zero.
    pub fn dprob_at(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let values = self.values();
        let npars = self.npars();
        let mut out = Array2::zeros((self.ncat, npars));
        match self.analytic_dprob(&values, theta) {
            Some(d) if d.dim() == (self.ncat, npars) => {
                for (p, par) in self.pars.iter().enumerate() {
                    if par.free {
                        let jac = par.transform.jacobian(par.raw());
                        for k in 0..self.ncat {
                            out[[k, p]] = d[[k, p]] * jac;
                        }
                    }
                }
            }
            _ => {
                let free: Vec<usize> = (0..npars).filter(|&p| self.pars[p].free).collect();
                let raw: Array1<f64> = free.iter().map(|&p| self.pars[p].raw()).collect();
                let jac = num_jacobian(
                    |y| {
                        let mut shifted = values.clone();
                        for (m, &p) in free.iter().enumerate() {
                            shifted[p] = self.pars[p].transform.from_raw(y[m]);
                        }
                        Array1::from(self.prob_at(&shifted, theta))
                    },
                    &raw,
                );
                for (m, &p) in free.iter().enumerate() {
                    out.column_mut(p).assign(&jac.column(m));
                }
            }
        }
        out
    }

    /// Q×K×P raw-scale derivatives over every node.
    pub fn dprob(&self, theta: &Array2<f64>) -> Array3<f64> {
        let mut out = Array3::zeros((theta.nrows(), self.ncat, self.npars()));
        for (q, row) in theta.rows().into_iter().enumerate() {
            let d = self.dprob_at(row);
            out.index_axis_mut(ndarray::Axis(0), q).assign(&d);
        }
        out
    }

    /// K×D derivative of the category probabilities with respect to theta.
    pub fn dprob_dtheta(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let values = self.values();
        num_jacobian(|t| Array1::from(self.prob_at(&values, t.view())), &theta.to_owned())
    }

    /// D×D Fisher information of the item at `theta`.
    pub fn information(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let p = self.prob_at(&self.values(), theta);
        let dp = self.dprob_dtheta(theta);
        let mut info = Array2::zeros((self.nfact, self.nfact));
        for k in 0..self.ncat {
            for a in 0..self.nfact {
                for b in 0..self.nfact {
                    info[[a, b]] += dp[[k, a]] * dp[[k, b]] / p[k];
                }
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn set_values(item: &mut Item, values: &[(&str, f64)]) {
        for (name, v) in values {
            let p = item.param_index(name).unwrap();
            item.pars[p].value = *v;
        }
    }

    fn check_against_finite_differences(item: &Item, theta: ArrayView1<f64>) {
        let analytic = item.dprob_at(theta);
        for (p, par) in item.pars.iter().enumerate() {
            if !par.free {
                continue;
            }
            let mut up = item.clone();
            let mut down = item.clone();
            let h = 1e-6;
            up.set_raw(p, par.raw() + h);
            down.set_raw(p, par.raw() - h);
            let pu = up.prob_at(&up.values(), theta);
            let pd = down.prob_at(&down.values(), theta);
            for k in 0..item.ncat {
                let numeric = (pu[k] - pd[k]) / (2.0 * h);
                assert_abs_diff_eq!(analytic[[k, p]], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn parses_item_tags() {
        assert_eq!("3PLu".parse::<ItemType>().unwrap(), ItemType::ThreePLu);
        assert_eq!("graded".parse::<ItemType>().unwrap().tag(), "graded");
        assert!("5PL".parse::<ItemType>().is_err());
    }

    #[test]
    fn every_family_sums_to_one() {
        let theta = array![[-2.0, 0.5], [0.0, 0.0], [1.7, -1.2]];
        let both = vec![true, true];
        let cases: Vec<(ItemType, usize, Option<usize>)> = vec![
            (ItemType::FourPL, 2, None),
            (ItemType::Graded, 5, None),
            (ItemType::Grsm, 4, None),
            (ItemType::Gpcm, 4, None),
            (ItemType::Nominal, 4, None),
            (ItemType::Rsm, 3, None),
            (ItemType::Rasch, 4, None),
            (ItemType::PC3PL, 2, None),
            (ItemType::ThreePLNRM, 4, Some(1)),
        ];
        for (t, ncat, key) in cases {
            let item = Item::new("x", t, ncat, 2, both.clone(), key).unwrap();
            let tr = item.probtrace(&theta);
            for row in tr.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn analytic_derivatives_match_finite_differences() {
        let theta = array![0.4, -0.9];
        let both = vec![true, true];

        let mut item = Item::new("i", ItemType::FourPL, 2, 2, both.clone(), None).unwrap();
        set_values(&mut item, &[("a1", 1.2), ("a2", 0.6), ("d", -0.3), ("g", 0.15), ("u", 0.9)]);
        check_against_finite_differences(&item, theta.view());

        let mut item = Item::new("i", ItemType::Graded, 4, 2, both.clone(), None).unwrap();
        set_values(&mut item, &[("a1", 0.9), ("d1", 1.4), ("d2", 0.1), ("d3", -1.2)]);
        check_against_finite_differences(&item, theta.view());

        let item = Item::new("i", ItemType::Grsm, 3, 2, both.clone(), None).unwrap();
        check_against_finite_differences(&item, theta.view());

        let mut item = Item::new("i", ItemType::Nominal, 4, 2, both.clone(), None).unwrap();
        set_values(&mut item, &[("ak1", 0.7), ("ak2", 2.4), ("d2", 0.5)]);
        check_against_finite_differences(&item, theta.view());

        let item = Item::new("i", ItemType::Rsm, 4, 2, both, None).unwrap();
        check_against_finite_differences(&item, theta.view());
    }

    #[test]
    fn fixed_parameters_follow_the_item_type() {
        let two = Item::new("i", ItemType::TwoPL, 2, 1, vec![true], None).unwrap();
        assert_eq!(two.n_free(), 2);
        let rasch = Item::new("i", ItemType::Rasch, 2, 1, vec![true], None).unwrap();
        assert_eq!(rasch.n_free(), 1);
        let gpcm = Item::new("i", ItemType::Gpcm, 4, 1, vec![true], None).unwrap();
        // slope plus d1..d3
        assert_eq!(gpcm.n_free(), 4);
        let nominal = Item::new("i", ItemType::Nominal, 4, 1, vec![true], None).unwrap();
        assert_eq!(nominal.n_free(), 6);
        assert!(Item::new("i", ItemType::TwoPL, 3, 1, vec![true], None).is_err());
        assert!(Item::new("i", ItemType::TwoPLNRM, 4, 1, vec![true], None).is_err());
        assert_eq!(nominal.slope_indices(), vec![0]);
    }

    #[test]
    fn logit_transform_keeps_guessing_in_range() {
        let mut item = Item::new("i", ItemType::ThreePL, 2, 1, vec![true], None).unwrap();
        let g = item.param_index("g").unwrap();
        item.set_raw(g, -40.0);
        assert!(item.pars[g].value > 0.0 && item.pars[g].value < 1e-10);
        item.set_raw(g, 0.0);
        assert_abs_diff_eq!(item.pars[g].value, 0.5);
    }

    #[test]
    fn priors_penalise_and_differentiate() {
        let beta = Prior::Beta { alpha: 5.0, beta: 17.0 };
        let raw = ParTransform::Logit.to_raw(0.2);
        let h = 1e-6;
        let numeric = (beta.log_density(raw + h, ParTransform::Logit)
            - beta.log_density(raw - h, ParTransform::Logit))
            / (2.0 * h);
        assert_abs_diff_eq!(beta.grad(raw, ParTransform::Logit), numeric, epsilon = 1e-5);
        let normal = Prior::Normal { mean: 0.0, sd: 1.0 };
        let tail = normal.log_density(3.0, ParTransform::Identity);
        assert!(tail < normal.log_density(0.0, ParTransform::Identity));
    }

    #[test]
    fn information_is_positive_for_a_discriminating_item() {
        let item = Item::new("i", ItemType::TwoPL, 2, 1, vec![true], None).unwrap();
        let info = item.information(array![0.0].view());
        // a = 1, d = 0: P(1 - P) = 0.25
        assert_abs_diff_eq!(info[[0, 0]], 0.25, epsilon = 1e-6);
    }
}
