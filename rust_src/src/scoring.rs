//! Factor scores: EAP, MAP, ML, WLE and EAP for sum scores.
//!
//! Scores are computed once per unique response pattern and expanded to respondents
//! on request. Multiple imputation re-scores under parameter draws from the
//! asymptotic covariance and pools with Rubin's rules.

use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::data::{PatternTable, MISSING};
use crate::error::{MirtError, MirtResult};
use crate::estep::GroupTraces;
use crate::items::P_FLOOR;
use crate::linalg;
use crate::model::{LatentPrior, Model};
use crate::mstep::bounded_bfgs;
use crate::parallel::WorkerPool;
use crate::quadrature::QuadratureGrid;
use crate::utils::num_hessian;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScoreMethod {
    #[default]
    #[serde(rename = "EAP")]
    Eap,
    #[serde(rename = "MAP")]
    Map,
    #[serde(rename = "ML")]
    Ml,
    #[serde(rename = "WLE")]
    Wle,
    #[serde(rename = "EAPsum")]
    EapSum,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreInput {
    /// The responses the model was fitted to
    Fitted,
    /// Custom rows in the original category codes; missing entries negative
    Patterns {
        responses: Array2<i32>,
        groups: Option<Vec<usize>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputMode {
    /// One row per unique pattern, with frequencies
    #[default]
    Table,
    /// One row per respondent, with patterns and standard errors
    Full,
    /// One row per respondent, scores only
    ScoresOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreFlag {
    /// All observed responses in the lowest or highest category; ML is unbounded
    ExtremePattern,
    /// The optimum lies on the `theta_lim` boundary and was clamped
    Divergent,
    NoResponses,
}

/// Score estimate, its standard error and an optional flag for one pattern.
pub type ScoredPattern = (Array1<f64>, Array1<f64>, Option<ScoreFlag>);

#[derive(Debug, Clone)]
pub struct ScoreOptions {
    pub method: ScoreMethod,
    pub input: ScoreInput,
    pub output: OutputMode,
    pub reliability: bool,
    /// Number of parameter draws for multiple imputation
    pub mi_draws: Option<usize>,
    pub quadpts: Option<usize>,
    pub theta_lim: (f64, f64),
    pub max_quad: usize,
    pub seed: u64,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        ScoreOptions {
            method: ScoreMethod::Eap,
            input: ScoreInput::Fitted,
            output: OutputMode::Table,
            reliability: false,
            mi_draws: None,
            quadpts: None,
            theta_lim: (-6.0, 6.0),
            max_quad: 20000,
            seed: 1234,
        }
    }
}

impl ScoreOptions {
    pub fn new(method: ScoreMethod) -> Self {
        ScoreOptions {
            method,
            ..ScoreOptions::default()
        }
    }

    pub fn with_patterns(mut self, responses: Array2<i32>) -> Self {
        self.input = ScoreInput::Patterns {
            responses,
            groups: None,
        };
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

/// Per-pattern estimates.
#[derive(Debug, Clone)]
pub struct PatternScores {
    pub scores: Array2<f64>,
    pub se: Array2<f64>,
    pub flags: Vec<Option<ScoreFlag>>,
}

/// EAP for each attainable sum score of one group (complete responses only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumScoreTable {
    pub group: usize,
    pub sum_score: Vec<usize>,
    pub eap: Vec<f64>,
    pub sd: Vec<f64>,
    pub observed: Vec<f64>,
    pub expected: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct FactorScores {
    pub method: ScoreMethod,
    pub output: OutputMode,
    /// Patterns in original codes (absent for `ScoresOnly`)
    pub patterns: Option<Array2<i32>>,
    /// Pattern frequencies (`Table` only)
    pub freq: Option<Vec<f64>>,
    pub groups: Vec<usize>,
    pub scores: Array2<f64>,
    pub se: Option<Array2<f64>>,
    pub flags: Vec<Option<ScoreFlag>>,
    pub reliability: Option<Array1<f64>>,
    pub sum_scores: Option<Vec<SumScoreTable>>,
}

/// Shared per-model state for scoring many patterns.
pub struct Scorer<'a> {
    model: &'a Model,
    grid: &'a QuadratureGrid,
    traces: Vec<GroupTraces>,
    priors: Vec<LatentPrior>,
    weights: Vec<Array1<f64>>,
    values: Vec<Vec<Vec<f64>>>,
    theta_lim: (f64, f64),
}

impl<'a> Scorer<'a> {
    pub fn new(
        model: &'a Model,
        grid: &'a QuadratureGrid,
        theta_lim: (f64, f64),
    ) -> MirtResult<Self> {
        let traces = (0..model.n_groups())
            .map(|g| GroupTraces::new(model, g, grid))
            .collect::<MirtResult<Vec<_>>>()?;
        let priors = (0..model.n_groups())
            .map(|g| model.latent_prior(g))
            .collect::<MirtResult<Vec<_>>>()?;
        let weights = (0..model.n_groups())
            .map(|g| model.prior_weights(g, grid))
            .collect::<MirtResult<Vec<_>>>()?;
        let values = model
            .groups
            .iter()
            .map(|gm| gm.items.iter().map(|it| it.values()).collect())
            .collect();
        Ok(Scorer {
            model,
            grid,
            traces,
            priors,
            weights,
            values,
            theta_lim,
        })
    }

    fn log_likelihood(&self, g: usize, pattern: ArrayView1<i32>, theta: ArrayView1<f64>) -> f64 {
        let items = &self.model.groups[g].items;
        pattern
            .iter()
            .enumerate()
            .filter(|(_, &r)| r >= 0)
            .map(|(j, &r)| {
                items[j].prob_at(&self.values[g][j], theta)[r as usize]
                    .max(P_FLOOR)
                    .ln()
            })
            .sum()
    }

    fn grad_log_likelihood(
        &self,
        g: usize,
        pattern: ArrayView1<i32>,
        theta: ArrayView1<f64>,
    ) -> Array1<f64> {
        let items = &self.model.groups[g].items;
        let mut grad = Array1::zeros(theta.len());
        for (j, &r) in pattern.iter().enumerate() {
            if r < 0 {
                continue;
            }
            let k = r as usize;
            let p = items[j].prob_at(&self.values[g][j], theta)[k].max(P_FLOOR);
            let dp = items[j].dprob_dtheta(theta);
            grad.scaled_add(1.0 / p, &dp.row(k));
        }
        grad
    }

    fn test_information(
        &self,
        g: usize,
        pattern: ArrayView1<i32>,
        theta: ArrayView1<f64>,
    ) -> Array2<f64> {
        let d = theta.len();
        let mut info = Array2::zeros((d, d));
        for (j, &r) in pattern.iter().enumerate() {
            if r >= 0 {
                info = info + self.model.groups[g].items[j].information(theta);
            }
        }
        info
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![self.theta_lim; self.model.nfact]
    }

    fn se_from_information(info: &Array2<f64>) -> Array1<f64> {
        match linalg::inverse(info) {
            Ok(inv) => inv.diag().mapv(|v| if v > 0.0 { v.sqrt() } else { f64::NAN }),
            Err(_) => Array1::from_elem(info.nrows(), f64::INFINITY),
        }
    }

    /// Posterior mean and standard deviation on the grid.
    pub fn eap(&self, g: usize, pattern: ArrayView1<i32>) -> (Array1<f64>, Array1<f64>) {
        let (post, _) = self.traces[g].posterior(pattern);
        self.posterior_moments(&post)
    }

    fn posterior_moments(&self, post: &[f64]) -> (Array1<f64>, Array1<f64>) {
        let theta = &self.grid.theta;
        let d = theta.ncols();
        let mut mean = Array1::<f64>::zeros(d);
        for (q, &w) in post.iter().enumerate() {
            mean.scaled_add(w, &theta.row(q));
        }
        let mut var = Array1::<f64>::zeros(d);
        for (q, &w) in post.iter().enumerate() {
            let diff = &theta.row(q) - &mean;
            var = var + diff.mapv(|v| v * v) * w;
        }
        (mean, var.mapv(f64::sqrt))
    }

    fn map(&self, g: usize, pattern: ArrayView1<i32>) -> ScoredPattern {
        let prior = &self.priors[g];
        let objective = |t: &Array1<f64>| {
            let v = -(self.log_likelihood(g, pattern, t.view()) + prior.log_density(t.view()));
            let gr = -(self.grad_log_likelihood(g, pattern, t.view())
                + prior.grad_log_density(t.view()));
            (v, gr)
        };
        let (start, _) = self.eap(g, pattern);
        let bounds = self.bounds();
        let fit = bounded_bfgs(&objective, &start, &bounds, 1e-8, 200);
        let hess = num_hessian(|t| objective(t).1, &fit.x);
        let se = Self::se_from_information(&hess);
        let flag = self.boundary_flag(&fit.x);
        (fit.x, se, flag)
    }

    fn boundary_flag(&self, theta: &Array1<f64>) -> Option<ScoreFlag> {
        let (lo, hi) = self.theta_lim;
        let eps = 1e-4 * (hi - lo);
        if theta.iter().any(|&t| t <= lo + eps || t >= hi - eps) {
            Some(ScoreFlag::Divergent)
        } else {
            None
        }
    }

    fn extreme(&self, g: usize, pattern: ArrayView1<i32>) -> Option<f64> {
        let items = &self.model.groups[g].items;
        let observed: Vec<(usize, i32)> = pattern
            .iter()
            .enumerate()
            .filter(|(_, &r)| r >= 0)
            .map(|(j, &r)| (j, r))
            .collect();
        if observed.iter().all(|&(_, r)| r == 0) {
            Some(f64::NEG_INFINITY)
        } else if observed.iter().all(|&(j, r)| r as usize == items[j].ncat - 1) {
            Some(f64::INFINITY)
        } else {
            None
        }
    }

    fn ml(&self, g: usize, pattern: ArrayView1<i32>) -> ScoredPattern {
        let d = self.model.nfact;
        if let Some(inf) = self.extreme(g, pattern) {
            return (
                Array1::from_elem(d, inf),
                Array1::from_elem(d, f64::NAN),
                Some(ScoreFlag::ExtremePattern),
            );
        }
        let objective = |t: &Array1<f64>| {
            (
                -self.log_likelihood(g, pattern, t.view()),
                -self.grad_log_likelihood(g, pattern, t.view()),
            )
        };
        let (start, _) = self.eap(g, pattern);
        let fit = bounded_bfgs(&objective, &start, &self.bounds(), 1e-8, 200);
        let se = Self::se_from_information(&self.test_information(g, pattern, fit.x.view()));
        let flag = self.boundary_flag(&fit.x);
        (fit.x, se, flag)
    }

    fn wle_criterion(&self, g: usize, pattern: ArrayView1<i32>, theta: ArrayView1<f64>) -> f64 {
        let ll = self.log_likelihood(g, pattern, theta);
        let info = self.test_information(g, pattern, theta);
        let det = linalg::to_dmatrix(&info).determinant();
        if det > 0.0 {
            ll + 0.5 * det.ln()
        } else {
            ll
        }
    }

    fn wle(&self, g: usize, pattern: ArrayView1<i32>) -> ScoredPattern {
        let theta = if self.model.nfact == 1 {
            // golden-section search on the bounded interval
            let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
            let (mut a, mut b) = self.theta_lim;
            let crit = |t: f64| self.wle_criterion(g, pattern, Array1::from_elem(1, t).view());
            while (b - a) > 1e-8 {
                let c = b - (b - a) / phi;
                let d = a + (b - a) / phi;
                if crit(c) > crit(d) {
                    b = d;
                } else {
                    a = c;
                }
            }
            Array1::from_elem(1, (a + b) / 2.0)
        } else {
            let objective = |t: &Array1<f64>| {
                let v = -self.wle_criterion(g, pattern, t.view());
                let gr =
                    crate::utils::num_gradient(|y| -self.wle_criterion(g, pattern, y.view()), t);
                (v, gr)
            };
            let (start, _) = self.eap(g, pattern);
            bounded_bfgs(&objective, &start, &self.bounds(), 1e-8, 200).x
        };
        let se = Self::se_from_information(&self.test_information(g, pattern, theta.view()));
        let flag = self.boundary_flag(&theta);
        (theta, se, flag)
    }

    /// Category probabilities of every item of group `g` at node `q`.
    fn node_probs(&self, g: usize, q: usize) -> Vec<Vec<f64>> {
        let items = &self.model.groups[g].items;
        let theta = self.grid.theta.row(q);
        items
            .iter()
            .enumerate()
            .map(|(j, it)| it.prob_at(&self.values[g][j], theta))
            .collect()
    }

    /// Lord-Wingersky recursion: P(sum score = s | θ_q) over the items in `which`.
    fn sum_score_likelihood(probs: &[Vec<f64>], which: &[usize]) -> Vec<f64> {
        let mut dist = vec![1.0];
        for &j in which {
            let p = &probs[j];
            let mut next = vec![0.0; dist.len() + p.len() - 1];
            for (s, &f) in dist.iter().enumerate() {
                for (k, &pk) in p.iter().enumerate() {
                    next[s + k] += f * pk;
                }
            }
            dist = next;
        }
        dist
    }

    fn eap_sum(&self, g: usize, pattern: ArrayView1<i32>) -> (Array1<f64>, Array1<f64>) {
        let which: Vec<usize> = pattern
            .iter()
            .enumerate()
            .filter(|(_, &r)| r >= 0)
            .map(|(j, _)| j)
            .collect();
        let score: usize = pattern.iter().filter(|&&r| r >= 0).map(|&r| r as usize).sum();
        let prior = &self.weights[g];
        let mut post: Vec<f64> = (0..self.grid.n_nodes())
            .map(|q| {
                let l = Self::sum_score_likelihood(&self.node_probs(g, q), &which);
                l.get(score).copied().unwrap_or(0.0) * prior[q]
            })
            .collect();
        let total: f64 = post.iter().sum();
        if total > 0.0 {
            post.iter_mut().for_each(|w| *w /= total);
        }
        self.posterior_moments(&post)
    }

    /// Sum-score table over complete response patterns of group `g`.
    pub fn sum_score_table(&self, g: usize, table: &PatternTable) -> MirtResult<SumScoreTable> {
        if self.model.nfact != 1 {
            return Err(MirtError::Configuration("EAPsum scoring needs a single factor".into()));
        }
        let n_items = self.model.n_items();
        let all: Vec<usize> = (0..n_items).collect();
        let prior = &self.weights[g];
        let likelihood: Vec<Vec<f64>> = (0..self.grid.n_nodes())
            .map(|q| Self::sum_score_likelihood(&self.node_probs(g, q), &all))
            .collect();
        let n_scores = likelihood.first().map(|l| l.len()).unwrap_or(1);

        let mut observed = vec![0.0; n_scores];
        for p in table.group_patterns(g) {
            let pattern = table.pattern(p);
            if pattern.iter().all(|&r| r >= 0) {
                let s: usize = pattern.iter().map(|&r| r as usize).sum();
                observed[s] += table.freq[p];
            }
        }
        let n_complete: f64 = observed.iter().sum();

        let mut out = SumScoreTable {
            group: g,
            sum_score: (0..n_scores).collect(),
            eap: Vec::with_capacity(n_scores),
            sd: Vec::with_capacity(n_scores),
            observed,
            expected: Vec::with_capacity(n_scores),
        };
        let theta = self.grid.theta.column(0);
        for s in 0..n_scores {
            let joint: Vec<f64> =
                likelihood.iter().zip(prior.iter()).map(|(l, w)| l[s] * w).collect();
            let marginal: f64 = joint.iter().sum();
            let mean = joint.iter().zip(theta.iter()).map(|(w, t)| w * t).sum::<f64>() / marginal;
            let var = joint
                .iter()
                .zip(theta.iter())
                .map(|(w, t)| w * (t - mean).powi(2))
                .sum::<f64>()
                / marginal;
            out.eap.push(mean);
            out.sd.push(var.sqrt());
            out.expected.push(n_complete * marginal);
        }
        Ok(out)
    }

    /// Score one recoded pattern of group `g`.
    pub fn score(
        &self,
        method: ScoreMethod,
        g: usize,
        pattern: ArrayView1<i32>,
    ) -> ScoredPattern {
        let no_responses = pattern.iter().all(|&r| r < 0);
        if no_responses && matches!(method, ScoreMethod::Ml | ScoreMethod::Wle) {
            let d = self.model.nfact;
            return (
                Array1::from_elem(d, f64::NAN),
                Array1::from_elem(d, f64::NAN),
                Some(ScoreFlag::NoResponses),
            );
        }
        let (est, se, flag) = match method {
            ScoreMethod::Eap => {
                let (m, s) = self.eap(g, pattern);
                (m, s, None)
            }
            ScoreMethod::EapSum => {
                let (m, s) = self.eap_sum(g, pattern);
                (m, s, None)
            }
            ScoreMethod::Map => self.map(g, pattern),
            ScoreMethod::Ml => self.ml(g, pattern),
            ScoreMethod::Wle => self.wle(g, pattern),
        };
        let flag = if no_responses { Some(ScoreFlag::NoResponses) } else { flag };
        (est, se, flag)
    }

    pub fn score_table(
        &self,
        method: ScoreMethod,
        table: &PatternTable,
        pool: &WorkerPool,
    ) -> PatternScores {
        let d = self.model.nfact;
        let rows = pool.map(table.n_patterns(), |p| {
            self.score(method, table.group[p], table.pattern(p))
        });
        let mut scores = Array2::zeros((rows.len(), d));
        let mut se = Array2::zeros((rows.len(), d));
        let mut flags = Vec::with_capacity(rows.len());
        for (p, (est, err, flag)) in rows.into_iter().enumerate() {
            scores.row_mut(p).assign(&est);
            se.row_mut(p).assign(&err);
            flags.push(flag);
        }
        PatternScores { scores, se, flags }
    }
}

/// Rubin's rules over per-draw scores: pooled estimate and total standard error.
pub fn rubin_pool(draws: &[PatternScores]) -> MirtResult<PatternScores> {
    let m = draws.len();
    let first = draws.first().ok_or(MirtError::Input("no imputations to pool".into()))?;
    let dim = first.scores.dim();
    let mut mean = Array2::<f64>::zeros(dim);
    let mut within = Array2::<f64>::zeros(dim);
    for d in draws {
        mean = mean + &d.scores;
        within = within + d.se.mapv(|s| s * s);
    }
    mean /= m as f64;
    within /= m as f64;
    let mut between = Array2::<f64>::zeros(dim);
    if m > 1 {
        for d in draws {
            let diff = &d.scores - &mean;
            between = between + diff.mapv(|v| v * v);
        }
        between /= (m - 1) as f64;
    }
    let total = within + between * (1.0 + 1.0 / m as f64);
    Ok(PatternScores {
        scores: mean,
        se: total.mapv(f64::sqrt),
        flags: first.flags.clone(),
    })
}

/// Score under `n_draws` parameter vectors drawn from N(x̂, vcov).
#[allow(clippy::too_many_arguments)]
pub fn multiple_imputation(
    model: &Model,
    grid: &QuadratureGrid,
    table: &PatternTable,
    method: ScoreMethod,
    vcov: &Array2<f64>,
    n_draws: usize,
    opts: &ScoreOptions,
    pool: &WorkerPool,
) -> MirtResult<PatternScores> {
    let x_hat = model.raw();
    let chol = linalg::cholesky_lower(&linalg::symmetrize(vcov))?;
    let mut rng = Pcg64::seed_from_u64(opts.seed);
    let mut draws: Vec<Array1<f64>> = Vec::with_capacity(n_draws);
    let mut attempts = 0;
    while draws.len() < n_draws && attempts < 20 * n_draws {
        attempts += 1;
        let z: Array1<f64> =
            (0..x_hat.len()).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        let x = &x_hat + &chol.dot(&z);
        let mut trial = model.clone();
        trial.set_raw(&x);
        if trial.groups.iter().all(|gm| linalg::is_positive_definite(&gm.latent.cov())) {
            draws.push(x);
        }
    }
    if draws.is_empty() {
        return Err(MirtError::Linalg("no admissible parameter draws for imputation".into()));
    }
    let seq = WorkerPool::sequential();
    let scored: Vec<MirtResult<PatternScores>> = pool.map(draws.len(), |m| {
        let mut trial = model.clone();
        trial.set_raw(&draws[m]);
        let scorer = Scorer::new(&trial, grid, opts.theta_lim)?;
        Ok(scorer.score_table(method, table, &seq))
    });
    let scored = scored.into_iter().collect::<MirtResult<Vec<_>>>()?;
    rubin_pool(&scored)
}

/// var(θ̂) / (var(θ̂) + mean SE²) per dimension over finite, weighted rows.
pub fn empirical_reliability(
    scores: &Array2<f64>,
    se: &Array2<f64>,
    weights: &[f64],
) -> Array1<f64> {
    let d = scores.ncols();
    Array1::from_shape_fn(d, |k| {
        let rows: Vec<(f64, f64, f64)> = scores
            .column(k)
            .iter()
            .zip(se.column(k).iter())
            .zip(weights.iter())
            .filter(|((t, s), _)| t.is_finite() && s.is_finite())
            .map(|((&t, &s), &w)| (t, s, w))
            .collect();
        let total: f64 = rows.iter().map(|r| r.2).sum();
        if total <= 0.0 {
            return f64::NAN;
        }
        let mean = rows.iter().map(|r| r.0 * r.2).sum::<f64>() / total;
        let var = rows.iter().map(|r| (r.0 - mean).powi(2) * r.2).sum::<f64>() / total;
        let err = rows.iter().map(|r| r.1 * r.1 * r.2).sum::<f64>() / total;
        var / (var + err)
    })
}

/// Recoded patterns back to the original category codes.
pub fn original_codes(categories: &[Vec<i32>], recoded: &Array2<i32>) -> Array2<i32> {
    Array2::from_shape_fn(recoded.dim(), |(i, j)| {
        let r = recoded[[i, j]];
        if r < 0 {
            MISSING
        } else {
            categories[j][r as usize]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ResponseMatrix;
    use crate::items::ItemType;
    use crate::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn fitted_like() -> (Model, QuadratureGrid) {
        let data = ResponseMatrix::new(array![
            [0, 1, 0, 1],
            [1, 1, 0, 0],
            [1, 0, 1, 1],
            [0, 0, 0, 1],
            [1, 1, 1, 0]
        ])
        .unwrap();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        for (j, item) in model.groups[0].items.iter_mut().enumerate() {
            item.pars[0].value = 1.2;
            item.pars[1].value = -0.5 + 0.4 * j as f64;
        }
        let grid = QuadratureGrid::build(1, Some(61), (-6.0, 6.0), 20000).unwrap();
        (model, grid)
    }

    #[test]
    fn all_max_pattern_scores_above_all_min() {
        let (model, grid) = fitted_like();
        let scorer = Scorer::new(&model, &grid, (-6.0, 6.0)).unwrap();
        let (hi, _, _) = scorer.score(ScoreMethod::Eap, 0, array![1, 1, 1, 1].view());
        let (lo, _, _) = scorer.score(ScoreMethod::Eap, 0, array![0, 0, 0, 0].view());
        assert!(hi[0].is_finite() && lo[0].is_finite());
        assert!(hi[0] > lo[0]);
    }

    #[test]
    fn ml_flags_extreme_patterns() {
        let (model, grid) = fitted_like();
        let scorer = Scorer::new(&model, &grid, (-6.0, 6.0)).unwrap();
        let (est, _, flag) = scorer.score(ScoreMethod::Ml, 0, array![1, 1, -1, 1].view());
        assert_eq!(est[0], f64::INFINITY);
        assert_eq!(flag, Some(ScoreFlag::ExtremePattern));
        let (est, se, flag) = scorer.score(ScoreMethod::Ml, 0, array![1, 0, 1, 0].view());
        assert!(est[0].is_finite() && se[0] > 0.0);
        assert_eq!(flag, None);
        let (_, _, flag) = scorer.score(ScoreMethod::Wle, 0, array![-1, -1, -1, -1].view());
        assert_eq!(flag, Some(ScoreFlag::NoResponses));
    }

    #[test]
    fn map_is_close_to_eap_for_a_mixed_pattern() {
        let (model, grid) = fitted_like();
        let scorer = Scorer::new(&model, &grid, (-6.0, 6.0)).unwrap();
        let pattern = array![1, 0, 1, 0];
        let (eap, _, _) = scorer.score(ScoreMethod::Eap, 0, pattern.view());
        let (map, se, _) = scorer.score(ScoreMethod::Map, 0, pattern.view());
        assert_abs_diff_eq!(eap[0], map[0], epsilon = 0.15);
        assert!(se[0] > 0.0);
    }

    #[test]
    fn wle_lies_between_ml_and_zero_for_mixed_pattern() {
        let (model, grid) = fitted_like();
        let scorer = Scorer::new(&model, &grid, (-6.0, 6.0)).unwrap();
        let pattern = array![1, 1, 1, 0];
        let (ml, _, _) = scorer.score(ScoreMethod::Ml, 0, pattern.view());
        let (wle, _, _) = scorer.score(ScoreMethod::Wle, 0, pattern.view());
        assert!(wle[0].is_finite());
        assert!(wle[0].abs() <= ml[0].abs() + 1e-6);
    }

    #[test]
    fn sum_score_eaps_increase() {
        let (model, grid) = fitted_like();
        let scorer = Scorer::new(&model, &grid, (-6.0, 6.0)).unwrap();
        let table = PatternTable::tabulate(&array![[0, 1, 0, 1], [1, 1, 1, 1]], &[0, 0], 1);
        let sums = scorer.sum_score_table(0, &table).unwrap();
        assert_eq!(sums.eap.len(), 5);
        assert!(sums.eap.windows(2).all(|w| w[1] > w[0]));
        assert_abs_diff_eq!(sums.expected.iter().sum::<f64>(), 2.0, epsilon = 1e-9);
        assert_eq!(sums.observed[2], 1.0);
        // a respondent's EAPsum equals the table entry for the same sum
        let (est, _, _) = scorer.score(ScoreMethod::EapSum, 0, array![0, 1, 0, 1].view());
        assert_abs_diff_eq!(est[0], sums.eap[2], epsilon = 1e-10);
    }

    #[test]
    fn rubin_pooling_adds_between_variance() {
        let a = PatternScores {
            scores: array![[0.0]],
            se: array![[0.5]],
            flags: vec![None],
        };
        let b = PatternScores {
            scores: array![[1.0]],
            se: array![[0.5]],
            flags: vec![None],
        };
        let pooled = rubin_pool(&[a, b]).unwrap();
        assert_abs_diff_eq!(pooled.scores[[0, 0]], 0.5, epsilon = 1e-12);
        // W = 0.25, B = 0.5, T = 0.25 + 1.5 * 0.5
        assert_abs_diff_eq!(pooled.se[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn reliability_is_a_proportion() {
        let scores = array![[-1.0], [0.0], [1.0]];
        let se = array![[0.5], [0.5], [0.5]];
        let rel = empirical_reliability(&scores, &se, &[1.0, 1.0, 1.0]);
        // var = 2/3, err = 0.25
        assert_abs_diff_eq!(rel[0], (2.0 / 3.0) / (2.0 / 3.0 + 0.25), epsilon = 1e-12);
    }
}
