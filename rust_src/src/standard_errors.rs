//! Information matrices for the converged parameters.
//!
//! Every strategy returns the information over the canonical raw parameters. Standard
//! errors on the reported scale follow by the delta method; confidence intervals are
//! built on the raw scale and transformed afterwards.

use std::cell::RefCell;
use std::collections::HashMap;

use ndarray::{Array1, Array2, Array3, ArrayView1};

use crate::config::{FitOptions, Method, SeType};
use crate::data::PatternTable;
use crate::em::{em_map, grid_data};
use crate::error::{raise, FitWarning, MirtError, MirtResult};
use crate::estep::{estep, GroupTraces};
use crate::items::P_FLOOR;
use crate::linalg;
use crate::model::{Model, Owner, Slot};
use crate::mstep::complete_hessian;
use crate::parallel::WorkerPool;
use crate::quadrature::{log_mvn_weights, QuadratureGrid};
use crate::utils::{num_hessian, num_jacobian};

/// Fisher information enumerates every response pattern; beyond this it is refused.
pub const MAX_FISHER_PATTERNS: usize = 50_000;
const NEAR_SINGULAR: f64 = 1e10;

#[derive(Debug, Clone)]
pub struct InformationMatrix {
    pub se_type: SeType,
    /// Information over canonical raw parameters
    pub matrix: Array2<f64>,
    /// Inverse of `matrix`; NaN where it does not exist
    pub vcov: Array2<f64>,
    pub names: Vec<String>,
}

impl InformationMatrix {
    fn from_information(se_type: SeType, matrix: Array2<f64>, names: Vec<String>) -> Self {
        let vcov = linalg::inverse(&matrix)
            .unwrap_or_else(|_| Array2::from_elem(matrix.dim(), f64::NAN));
        InformationMatrix {
            se_type,
            matrix,
            vcov,
            names,
        }
    }

    /// Standard errors on the raw (optimiser) scale.
    pub fn raw_se(&self) -> Array1<f64> {
        self.vcov
            .diag()
            .mapv(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN })
    }

    /// Condition checks raised as identifiability warnings.
    fn diagnose(&self, warnings: &mut Vec<FitWarning>) {
        if self.matrix.is_empty() {
            return;
        }
        let eig = linalg::symmetric_eigenvalues(&self.matrix);
        let min = eig.iter().copied().fold(f64::INFINITY, f64::min);
        let max = eig.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(min > 0.0) {
            raise(warnings, FitWarning::NotPositiveDefinite { min_eigenvalue: min });
        } else if max / min > NEAR_SINGULAR {
            raise(warnings, FitWarning::NearSingular { condition: max / min });
        }
    }
}

/// Per-pattern score contributions of the observed-data log-likelihood.
struct ScoreEngine {
    npars: usize,
    traces: Vec<GroupTraces>,
    /// Per group and item: Q×K×F derivative of log P, with the F canonical columns
    items: Vec<Vec<(Array3<f64>, Vec<usize>)>>,
    /// Per group: Q×L derivative of log w_q, with the L canonical columns
    latent: Vec<(Array2<f64>, Vec<usize>)>,
}

fn canonical_index(model: &Model) -> HashMap<Slot, usize> {
    let layout = model.layout();
    layout
        .slots
        .iter()
        .zip(layout.canon_of_slot.iter())
        .map(|(s, &c)| (*s, c))
        .collect()
}

impl ScoreEngine {
    fn new(model: &Model, grid: &QuadratureGrid) -> MirtResult<Self> {
        let canon = canonical_index(model);
        let mut traces = Vec::with_capacity(model.n_groups());
        let mut items = Vec::with_capacity(model.n_groups());
        let mut latent = Vec::with_capacity(model.n_groups());
        for (g, gm) in model.groups.iter().enumerate() {
            traces.push(GroupTraces::new(model, g, grid)?);
            let mut per_item = Vec::with_capacity(gm.items.len());
            for (j, item) in gm.items.iter().enumerate() {
                let owner = Owner::Item { group: g, item: j };
                let free: Vec<(usize, usize)> = (0..item.npars())
                    .filter_map(|p| canon.get(&Slot { owner, par: p }).map(|&c| (p, c)))
                    .collect();
                let probs = item.probtrace(&grid.theta);
                let dp = item.dprob(&grid.theta);
                let (nq, ncat) = probs.dim();
                let dlog = Array3::from_shape_fn((nq, ncat, free.len()), |(q, k, m)| {
                    dp[[q, k, free[m].0]] / probs[[q, k]].max(P_FLOOR)
                });
                per_item.push((dlog, free.iter().map(|&(_, c)| c).collect()));
            }
            items.push(per_item);

            let owner = Owner::Latent { group: g };
            let free: Vec<(usize, usize)> = (0..gm.latent.pars.len())
                .filter_map(|p| canon.get(&Slot { owner, par: p }).map(|&c| (p, c)))
                .collect();
            let dlogw = if free.is_empty() || gm.histogram.is_some() {
                Array2::zeros((grid.n_nodes(), 0))
            } else {
                let x0: Array1<f64> = free.iter().map(|&(p, _)| gm.latent.pars[p].raw()).collect();
                num_jacobian(
                    |y| {
                        let mut lp = gm.latent.clone();
                        for (m, &(p, _)) in free.iter().enumerate() {
                            lp.pars[p].set_raw(y[m]);
                        }
                        log_mvn_weights(&grid.theta, &lp.mean(), &lp.cov())
                            .unwrap_or_else(|_| Array1::from_elem(grid.n_nodes(), f64::NAN))
                    },
                    &x0,
                )
            };
            let cols = if dlogw.ncols() == 0 {
                Vec::new()
            } else {
                free.iter().map(|&(_, c)| c).collect()
            };
            latent.push((dlogw, cols));
        }
        Ok(ScoreEngine {
            npars: model.npars(),
            traces,
            items,
            latent,
        })
    }

    /// Complete-data score of `pattern` at node `q`.
    fn node_score(&self, g: usize, pattern: ArrayView1<i32>, q: usize) -> Array1<f64> {
        let mut c = Array1::zeros(self.npars);
        for (j, &r) in pattern.iter().enumerate() {
            if r < 0 {
                continue;
            }
            let (dlog, cols) = &self.items[g][j];
            for (m, &col) in cols.iter().enumerate() {
                c[col] += dlog[[q, r as usize, m]];
            }
        }
        let (dlogw, cols) = &self.latent[g];
        for (m, &col) in cols.iter().enumerate() {
            c[col] += dlogw[[q, m]];
        }
        c
    }

    /// Posterior mean of the complete score (the observed score), optionally its
    /// posterior second moment, and the log marginal likelihood.
    fn moments(
        &self,
        g: usize,
        pattern: ArrayView1<i32>,
        second: bool,
    ) -> (Array1<f64>, Option<Array2<f64>>, f64) {
        let (post, lse) = self.traces[g].posterior(pattern);
        let mut s = Array1::zeros(self.npars);
        let mut m2 = if second {
            Some(Array2::zeros((self.npars, self.npars)))
        } else {
            None
        };
        for (q, &w) in post.iter().enumerate() {
            if w < 1e-300 {
                continue;
            }
            let c = self.node_score(g, pattern, q);
            s.scaled_add(w, &c);
            if let Some(m2) = m2.as_mut() {
                for a in 0..self.npars {
                    if c[a] == 0.0 {
                        continue;
                    }
                    for b in 0..self.npars {
                        m2[[a, b]] += w * c[a] * c[b];
                    }
                }
            }
        }
        (s, m2, lse)
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Everything an SE strategy may need from a finished fit.
pub struct SeInputs<'a> {
    pub model: &'a Model,
    pub patterns: &'a PatternTable,
    /// Absent when the grid would exceed MAXQUAD (MH-RM fits only)
    pub grid: Option<&'a QuadratureGrid>,
    pub opts: &'a FitOptions,
    pub pool: &'a WorkerPool,
    /// Un-accelerated EM iterates (SEM only)
    pub trajectory: &'a [Array1<f64>],
    /// Stochastic information from MH-RM
    pub mhrm_information: Option<&'a Array2<f64>>,
}

/// Σ_p f_p s_p s_p'.
pub fn crossprod_information(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    pool: &WorkerPool,
) -> MirtResult<Array2<f64>> {
    let engine = ScoreEngine::new(model, grid)?;
    let parts: Vec<Array1<f64>> = pool.map(patterns.n_patterns(), |p| {
        engine.moments(patterns.group[p], patterns.pattern(p), false).0
    });
    let n = model.npars();
    let mut info = Array2::zeros((n, n));
    for (p, s) in parts.iter().enumerate() {
        info = info + outer(s, s) * patterns.freq[p];
    }
    Ok(info)
}

/// Negative Hessian of the expected complete-data log-likelihood at the final E-step.
pub fn complete_information(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    opts: &FitOptions,
    pool: &WorkerPool,
) -> MirtResult<Array2<f64>> {
    let e = estep(model, patterns, grid, pool, false)?;
    let thetas = vec![&grid.theta; model.n_groups()];
    let data = grid_data(&thetas, &e, opts.empirical_histogram);
    Ok(complete_hessian(model, &data, pool))
}

/// Complete information minus the posterior covariance of the complete score.
pub fn louis_information(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    opts: &FitOptions,
    pool: &WorkerPool,
) -> MirtResult<Array2<f64>> {
    let complete = complete_information(model, patterns, grid, opts, pool)?;
    let engine = ScoreEngine::new(model, grid)?;
    let parts: Vec<Array2<f64>> = pool.map(patterns.n_patterns(), |p| {
        let (s, m2, _) = engine.moments(patterns.group[p], patterns.pattern(p), true);
        let m2 = m2.unwrap_or_else(|| Array2::zeros((s.len(), s.len())));
        (m2 - outer(&s, &s)) * patterns.freq[p]
    });
    let mut missing: Array2<f64> = Array2::zeros(complete.dim());
    for part in parts {
        missing = missing + part;
    }
    Ok(complete - missing)
}

/// Expected information summed over every possible complete response pattern.
pub fn fisher_information(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    pool: &WorkerPool,
) -> MirtResult<Array2<f64>> {
    let n = model.npars();
    let mut info = Array2::zeros((n, n));
    let engine = ScoreEngine::new(model, grid)?;
    for g in 0..model.n_groups() {
        let ncats: Vec<usize> = model.groups[g].items.iter().map(|it| it.ncat).collect();
        let total = ncats
            .iter()
            .try_fold(1usize, |acc, &k| acc.checked_mul(k))
            .filter(|&t| t <= MAX_FISHER_PATTERNS)
            .ok_or_else(|| {
                MirtError::Configuration(format!(
                    "Fisher information needs every response pattern; more than {} here",
                    MAX_FISHER_PATTERNS
                ))
            })?;
        let n_g = patterns.group_total(g);
        let parts: Vec<Array2<f64>> = pool.map(total, |idx| {
            let mut rem = idx;
            let mut pattern = Array1::<i32>::zeros(ncats.len());
            for j in (0..ncats.len()).rev() {
                pattern[j] = (rem % ncats[j]) as i32;
                rem /= ncats[j];
            }
            let (s, _, lse) = engine.moments(g, pattern.view(), false);
            outer(&s, &s) * (n_g * lse.exp())
        });
        for part in parts {
            info = info + part;
        }
    }
    Ok(info)
}

/// Total marginal score plus log-prior gradient at raw parameters `x`.
fn total_score(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    x: &Array1<f64>,
    pool: &WorkerPool,
) -> MirtResult<Array1<f64>> {
    let mut trial = model.clone();
    trial.set_raw(x);
    let engine = ScoreEngine::new(&trial, grid)?;
    let parts: Vec<Array1<f64>> = pool.map(patterns.n_patterns(), |p| {
        engine.moments(patterns.group[p], patterns.pattern(p), false).0
    });
    let mut s = prior_gradient(&trial);
    for (p, sp) in parts.iter().enumerate() {
        s.scaled_add(patterns.freq[p], sp);
    }
    Ok(s)
}

fn prior_gradient(model: &Model) -> Array1<f64> {
    let layout = model.layout();
    (0..model.npars())
        .map(|c| {
            let slot = layout.slots[layout.canon_slots[c][0]];
            let par = model.param(slot.owner, slot.par);
            if par.prior.is_none() {
                0.0
            } else {
                par.prior.grad(par.raw(), par.transform)
            }
        })
        .collect()
}

/// Bock-Lieberman: negative central-difference Jacobian of the marginal score.
pub fn bl_information(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    pool: &WorkerPool,
) -> MirtResult<Array2<f64>> {
    let x = model.raw();
    // the difference closure cannot fail, so the first error is parked here
    let failure: RefCell<Option<MirtError>> = RefCell::new(None);
    let score = |y: &Array1<f64>| match total_score(model, patterns, grid, y, pool) {
        Ok(s) => s,
        Err(e) => {
            let mut slot = failure.borrow_mut();
            if slot.is_none() {
                *slot = Some(e);
            }
            Array1::from_elem(y.len(), f64::NAN)
        }
    };
    let hessian = num_hessian(score, &x);
    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    Ok(-hessian)
}

/// Supplemented EM: the rate matrix of the EM map from the stored trajectory.
pub fn sem_information(inputs: &SeInputs) -> MirtResult<Array2<f64>> {
    let SeInputs {
        model,
        patterns,
        grid,
        opts,
        pool,
        trajectory,
        ..
    } = *inputs;
    let grid = grid.ok_or(MirtError::NotComputed("quadrature grid"))?;
    if trajectory.len() < 2 {
        return Err(MirtError::NotComputed("EM trajectory for SEM"));
    }
    let x_hat = model.raw();
    let n = x_hat.len();
    let sem_tol = opts
        .technical
        .sem_tol
        .unwrap_or_else(|| opts.effective_tol().sqrt());
    let seq = WorkerPool::sequential();
    let base = em_map(model, patterns, grid, &x_hat, opts, &seq)?;

    let rows: Vec<MirtResult<Array1<f64>>> = pool.map(n, |i| {
        let mut previous: Option<Array1<f64>> = None;
        for point in trajectory.iter() {
            let dist = point[i] - x_hat[i];
            if dist.abs() < 1e-8 {
                continue;
            }
            let mut x = x_hat.clone();
            x[i] = point[i];
            let mapped = em_map(model, patterns, grid, &x, opts, &seq)?;
            let row = (&mapped - &base) / dist;
            if let Some(prev) = &previous {
                let diff = (&row - prev).iter().fold(0.0f64, |m, d| m.max(d.abs()));
                if diff < sem_tol {
                    return Ok(row);
                }
            }
            previous = Some(row);
        }
        previous.ok_or(MirtError::NotComputed(
            "SEM rate row (trajectory never moved the parameter)",
        ))
    });
    let mut dm = Array2::<f64>::zeros((n, n));
    for (i, row) in rows.into_iter().enumerate() {
        dm.row_mut(i).assign(&row?);
    }

    let complete = complete_information(model, patterns, grid, opts, pool)?;
    // dm[i][j] = dM_j / dx_i
    Ok((Array2::<f64>::eye(n) - dm).dot(&complete))
}

/// Compute the information matrix requested by `inputs.opts.se_type`.
pub fn compute_information(inputs: &SeInputs) -> MirtResult<(InformationMatrix, Vec<FitWarning>)> {
    let SeInputs {
        model,
        patterns,
        grid,
        opts,
        pool,
        ..
    } = *inputs;
    let se_type = opts.se_type;
    log::info!("computing {} information for {} parameters", se_type, model.npars());
    let mut warnings = Vec::new();
    let names = model.names();
    let finish = |m: Array2<f64>| if opts.symmetric { linalg::symmetrize(&m) } else { m };
    let on_grid = || {
        grid.ok_or_else(|| {
            MirtError::Configuration(format!(
                "SE type '{}' needs a quadrature grid within MAXQUAD",
                se_type
            ))
        })
    };

    let info = match se_type {
        SeType::Fisher => InformationMatrix::from_information(
            se_type,
            finish(fisher_information(model, patterns, on_grid()?, pool)?),
            names,
        ),
        SeType::Bl => InformationMatrix::from_information(
            se_type,
            finish(bl_information(model, patterns, on_grid()?, pool)?),
            names,
        ),
        SeType::Complete => InformationMatrix::from_information(
            se_type,
            finish(complete_information(model, patterns, on_grid()?, opts, pool)?),
            names,
        ),
        SeType::Sem => {
            InformationMatrix::from_information(se_type, finish(sem_information(inputs)?), names)
        }
        SeType::Mhrm => {
            let m = inputs
                .mhrm_information
                .ok_or(MirtError::NotComputed("MH-RM information"))?;
            InformationMatrix::from_information(se_type, finish(m.clone()), names)
        }
        SeType::Crossprod => InformationMatrix::from_information(
            se_type,
            finish(crossprod_information(model, patterns, on_grid()?, pool)?),
            names,
        ),
        SeType::Louis => InformationMatrix::from_information(
            se_type,
            finish(louis_information(model, patterns, on_grid()?, opts, pool)?),
            names,
        ),
        SeType::Sandwich => {
            let a = match opts.method {
                Method::Em => louis_information(model, patterns, on_grid()?, opts, pool)?,
                Method::Mhrm => inputs
                    .mhrm_information
                    .cloned()
                    .ok_or(MirtError::NotComputed("MH-RM information"))?,
            };
            let a = finish(a);
            let b = finish(crossprod_information(model, patterns, on_grid()?, pool)?);
            let nan = || Array2::from_elem(a.dim(), f64::NAN);
            let (matrix, vcov) = match linalg::inverse(&a) {
                Ok(a_inv) => {
                    let vcov = a_inv.dot(&b).dot(&a_inv);
                    let matrix = linalg::inverse(&vcov).unwrap_or_else(|_| nan());
                    (matrix, vcov)
                }
                Err(_) => (nan(), nan()),
            };
            InformationMatrix {
                se_type,
                matrix,
                vcov,
                names,
            }
        }
    };
    info.diagnose(&mut warnings);
    Ok((info, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ResponseMatrix;
    use crate::items::ItemType;
    use crate::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn setup() -> (Model, PatternTable, QuadratureGrid) {
        let data = ResponseMatrix::new(array![
            [0, 0, 1],
            [1, 0, 1],
            [1, 1, 1],
            [0, 0, 0],
            [1, 1, 0],
            [0, 1, 1],
            [1, 1, 1],
            [0, 0, 1]
        ])
        .unwrap();
        let model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(41), (-5.0, 5.0), 20000).unwrap();
        (model, table, grid)
    }

    #[test]
    fn pattern_scores_match_numeric_marginal_gradient() {
        let (model, table, grid) = setup();
        let x = model.raw();
        let analytic = total_score(&model, &table, &grid, &x, &WorkerPool::sequential()).unwrap();
        let loglik = |y: &Array1<f64>| {
            let mut m = model.clone();
            m.set_raw(y);
            estep(&m, &table, &grid, &WorkerPool::sequential(), false).unwrap().loglik
        };
        let numeric = crate::utils::num_gradient(loglik, &x);
        for i in 0..x.len() {
            assert_abs_diff_eq!(analytic[i], numeric[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn crossprod_is_symmetric_positive_semidefinite() {
        let (model, table, grid) = setup();
        let info = crossprod_information(&model, &table, &grid, &WorkerPool::sequential()).unwrap();
        for i in 0..info.nrows() {
            assert!(info[[i, i]] >= 0.0);
            for j in 0..info.ncols() {
                assert_abs_diff_eq!(info[[i, j]], info[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn fisher_weights_sum_to_the_sample_size() {
        let (model, table, grid) = setup();
        // with every pattern enumerated the marginal probabilities sum to one
        let engine = ScoreEngine::new(&model, &grid).unwrap();
        let mut total = 0.0;
        for idx in 0..8 {
            let pattern = array![(idx >> 2) & 1, (idx >> 1) & 1, idx & 1];
            total += engine.moments(0, pattern.view(), false).2.exp();
        }
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
        let info = fisher_information(&model, &table, &grid, &WorkerPool::sequential()).unwrap();
        assert!(info[[0, 0]] > 0.0);
    }

    #[test]
    fn louis_equals_complete_minus_missing_information() {
        let (model, table, grid) = setup();
        let opts = FitOptions::em();
        let pool = WorkerPool::sequential();
        let complete = complete_information(&model, &table, &grid, &opts, &pool).unwrap();
        let louis = louis_information(&model, &table, &grid, &opts, &pool).unwrap();
        // missing information is positive semidefinite
        for i in 0..complete.nrows() {
            assert!(complete[[i, i]] + 1e-6 >= louis[[i, i]]);
        }
    }

    fn warnings_for(matrix: Array2<f64>) -> Vec<FitWarning> {
        let names = vec!["a".to_string(), "b".to_string()];
        let info = InformationMatrix::from_information(SeType::Crossprod, matrix, names);
        let mut warnings = Vec::new();
        info.diagnose(&mut warnings);
        warnings
    }

    #[test]
    fn indefinite_information_is_flagged() {
        let warnings = warnings_for(array![[1.0, 2.0], [2.0, 1.0]]);
        assert_eq!(warnings.len(), 1);
        match warnings[0] {
            FitWarning::NotPositiveDefinite { min_eigenvalue } => {
                assert_abs_diff_eq!(min_eigenvalue, -1.0, epsilon = 1e-10)
            }
            ref other => panic!("unexpected warning {:?}", other),
        }
    }

    #[test]
    fn ill_conditioned_information_is_flagged() {
        let warnings = warnings_for(array![[1.0, 0.0], [0.0, 1e-12]]);
        assert!(matches!(
            warnings[..],
            [FitWarning::NearSingular { condition }] if condition > 1e11
        ));
        assert!(warnings_for(array![[2.0, 0.5], [0.5, 1.0]]).is_empty());
    }
}
