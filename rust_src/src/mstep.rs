//! Maximisation step: block objectives and the optimisers that solve them.
//!
//! The same `CompleteData` view serves EM (quadrature nodes weighted by expected
//! counts) and MH-RM (imputed traits with indicator counts), so the block objectives,
//! their gradients and Hessians are shared by both estimators and by the
//! complete-data information used for standard errors.

use argmin::core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead;
use ndarray::{Array1, Array2};
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::config::Optimizer;
use crate::error::FitWarning;
use crate::items::{Item, P_FLOOR};
use crate::linalg::{self, MvnDensity};
use crate::model::{Block, GroupPars, Model, Owner};
use crate::parallel::WorkerPool;
use crate::quadrature::log_mvn_weights;
use crate::utils::{num_gradient, num_hessian};

/// Objective value substituted for non-finite evaluations.
const LARGE_COST: f64 = 1e10;

/// How the latent mean/covariance enter the complete-data likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentMode {
    /// Normalised weights on a quadrature grid against posterior node counts
    Grid,
    /// Multivariate normal density of imputed traits
    Draws,
}

/// Sufficient statistics of the complete-data likelihood.
#[derive(Debug, Clone, Copy)]
pub struct CompleteData<'a> {
    /// Per group, the latent points the counts refer to
    pub thetas: &'a [&'a Array2<f64>],
    /// Per group and item, points × categories counts
    pub expected: &'a [Vec<Array2<f64>>],
    /// Per group, total weight at each point
    pub node_counts: &'a [Array1<f64>],
    pub latent: LatentMode,
    /// Latent blocks are left alone (empirical histogram estimation)
    pub skip_latent: bool,
}

impl CompleteData<'_> {
    pub fn total(&self) -> f64 {
        self.node_counts.iter().map(|n| n.sum()).sum::<f64>().max(1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MStepSettings {
    pub optimizer: Optimizer,
    pub tol: f64,
    pub maxit: usize,
}

#[derive(Debug, Clone)]
pub struct OptimResult {
    pub x: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// One M-step block bound to a model and its complete data.
pub struct BlockProblem<'a> {
    model: &'a Model,
    block: &'a Block,
    data: &'a CompleteData<'a>,
    /// (owner, parameter index, local index into the block vector)
    map: Vec<(Owner, usize, usize)>,
}

impl<'a> BlockProblem<'a> {
    pub fn new(model: &'a Model, block: &'a Block, data: &'a CompleteData<'a>) -> Self {
        let layout = model.layout();
        let mut map = Vec::new();
        for (local, &c) in block.canon.iter().enumerate() {
            for &s in &layout.canon_slots[c] {
                let slot = layout.slots[s];
                map.push((slot.owner, slot.par, local));
            }
        }
        BlockProblem {
            model,
            block,
            data,
            map,
        }
    }

    pub fn block(&self) -> &Block {
        self.block
    }

    pub fn dim(&self) -> usize {
        self.block.canon.len()
    }

    /// Current raw values of the block's canonical parameters.
    pub fn x0(&self) -> Array1<f64> {
        let raw = self.model.raw();
        self.block.canon.iter().map(|&c| raw[c]).collect()
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let all = self.model.raw_bounds();
        self.block.canon.iter().map(|&c| all[c]).collect()
    }

    fn item_with(&self, owner: Owner, x: &Array1<f64>) -> Option<Item> {
        match owner {
            Owner::Item { group, item } => {
                let mut it = self.model.groups[group].items[item].clone();
                for &(o, p, local) in &self.map {
                    if o == owner {
                        it.set_raw(p, x[local]);
                    }
                }
                Some(it)
            }
            Owner::Latent { .. } => None,
        }
    }

    fn latent_with(&self, group: usize, x: &Array1<f64>) -> GroupPars {
        let mut latent = self.model.groups[group].latent.clone();
        let owner = Owner::Latent { group };
        for &(o, p, local) in &self.map {
            if o == owner {
                latent.pars[p].set_raw(x[local]);
            }
        }
        latent
    }

    /// Negative log-prior over the block's canonical parameters and its gradient.
    fn prior_terms(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
        let mut value = 0.0;
        let mut grad = Array1::zeros(self.dim());
        let layout = self.model.layout();
        for (local, &c) in self.block.canon.iter().enumerate() {
            let slot = layout.slots[layout.canon_slots[c][0]];
            let par = self.model.param(slot.owner, slot.par);
            if !par.prior.is_none() {
                value -= par.prior.log_density(x[local], par.transform);
                grad[local] -= par.prior.grad(x[local], par.transform);
            }
        }
        (value, grad)
    }

    fn latent_value(&self, x: &Array1<f64>) -> f64 {
        let mut total = 0.0;
        for owner in &self.block.owners {
            let g = owner.group();
            let latent = self.latent_with(g, x);
            let (mean, cov) = (latent.mean(), latent.cov());
            let theta = self.data.thetas[g];
            let counts = &self.data.node_counts[g];
            match self.data.latent {
                LatentMode::Grid => match log_mvn_weights(theta, &mean, &cov) {
                    Ok(lw) => {
                        for (n, l) in counts.iter().zip(lw.iter()) {
                            total -= n * l.max(-700.0);
                        }
                    }
                    Err(_) => return f64::INFINITY,
                },
                LatentMode::Draws => match MvnDensity::new(&mean, &cov) {
                    Ok(mvn) => {
                        for (row, n) in theta.rows().into_iter().zip(counts.iter()) {
                            total -= n * mvn.log_pdf(row);
                        }
                    }
                    Err(_) => return f64::INFINITY,
                },
            }
        }
        total
    }

    /// Negative expected complete-data log-likelihood (plus negative log-priors) and gradient.
    pub fn value_grad(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
        let (mut value, mut grad) = self.prior_terms(x);
        if self.block.is_latent() {
            value += self.latent_value(x);
            if value.is_finite() {
                grad = grad + num_gradient(|y| self.latent_value(y), x);
            }
            return (value, grad);
        }
        for owner in &self.block.owners {
            let Some(item) = self.item_with(*owner, x) else {
                continue;
            };
            let g = owner.group();
            let j = match *owner {
                Owner::Item { item, .. } => item,
                Owner::Latent { .. } => continue,
            };
            let theta = self.data.thetas[g];
            let counts = &self.data.expected[g][j];
            let values = item.values();
            let locals: Vec<(usize, usize)> = self
                .map
                .iter()
                .filter(|(o, _, _)| o == owner)
                .map(|&(_, p, local)| (p, local))
                .collect();
            for (q, row) in theta.rows().into_iter().enumerate() {
                let r = counts.row(q);
                if r.iter().all(|&v| v == 0.0) {
                    continue;
                }
                let p = item.prob_at(&values, row);
                let dp = item.dprob_at(row);
                for k in 0..item.ncat {
                    if r[k] == 0.0 {
                        continue;
                    }
                    let pk = p[k].max(P_FLOOR);
                    value -= r[k] * pk.ln();
                    for &(par, local) in &locals {
                        grad[local] -= r[k] * dp[[k, par]] / pk;
                    }
                }
            }
        }
        (value, grad)
    }

    pub fn value(&self, x: &Array1<f64>) -> f64 {
        if self.block.is_latent() {
            self.prior_terms(x).0 + self.latent_value(x)
        } else {
            self.value_grad(x).0
        }
    }

    /// Hessian of the negative complete-data log-likelihood at `x`.
    pub fn hessian(&self, x: &Array1<f64>) -> Array2<f64> {
        num_hessian(|y| self.value_grad(y).1, x)
    }

    /// Moment estimates of the free latent elements from the node counts.
    fn latent_moment_start(&self, x0: &Array1<f64>) -> Array1<f64> {
        let mut x = x0.clone();
        for owner in &self.block.owners {
            let g = owner.group();
            let theta = self.data.thetas[g];
            let counts = &self.data.node_counts[g];
            let total = counts.sum();
            if total <= 0.0 {
                continue;
            }
            let d = theta.ncols();
            let mut mean = Array1::<f64>::zeros(d);
            for (row, n) in theta.rows().into_iter().zip(counts.iter()) {
                mean = mean + &row.mapv(|t| t * n);
            }
            mean /= total;
            let mut cov = Array2::<f64>::zeros((d, d));
            for (row, n) in theta.rows().into_iter().zip(counts.iter()) {
                let diff = &row - &mean;
                for a in 0..d {
                    for b in 0..d {
                        cov[[a, b]] += n * diff[a] * diff[b];
                    }
                }
            }
            cov /= total;
            let mut moment = self.model.groups[g].latent.clone();
            moment.set_mean_cov(&mean, &cov);
            for &(o, p, local) in &self.map {
                if o == *owner {
                    x[local] = moment.pars[p].raw();
                }
            }
        }
        x
    }

    /// Solve the block. `None` when every optimiser failed to produce a finite improvement.
    pub fn solve(&self, settings: &MStepSettings, scale: f64) -> Option<OptimResult> {
        let x0 = self.x0();
        let f0 = self.value(&x0);
        let bounds = self.bounds();

        let result = if self.block.is_latent() {
            let mut start = x0.clone();
            if self.data.latent == LatentMode::Grid {
                let moment = self.latent_moment_start(&x0);
                if self.value(&moment) < f0 {
                    start = moment;
                }
            }
            nelder_mead(
                |x| self.value(x) / scale,
                &start,
                &bounds,
                settings.tol,
                settings.maxit * 20,
            )
        } else {
            let f = |x: &Array1<f64>| {
                let (v, g) = self.value_grad(x);
                (v / scale, g / scale)
            };
            let has_bounds = bounds.iter().any(|(lo, hi)| lo.is_finite() || hi.is_finite());
            match settings.optimizer {
                Optimizer::Bfgs if !has_bounds => {
                    run_bfgs(&f, &x0, settings.tol, settings.maxit)
                        .unwrap_or_else(|| newton(&f, &x0, &bounds, settings.tol, settings.maxit))
                }
                Optimizer::Bfgs | Optimizer::BoundedBfgs => {
                    bounded_bfgs(&f, &x0, &bounds, settings.tol, settings.maxit)
                }
                Optimizer::NewtonRaphson => newton(&f, &x0, &bounds, settings.tol, settings.maxit),
                Optimizer::NelderMead => nelder_mead(
                    |x| f(x).0,
                    &x0,
                    &bounds,
                    settings.tol,
                    settings.maxit * 20,
                ),
            }
        };

        let value = self.value(&result.x);
        if !value.is_finite() || result.x.iter().any(|v| !v.is_finite()) {
            return None;
        }
        if value > f0 {
            // never accept a worse point; keep the previous values
            return Some(OptimResult {
                x: x0,
                value: f0,
                iterations: result.iterations,
                converged: false,
            });
        }
        Some(OptimResult { value, ..result })
    }
}

/// Run every block on the pool. Returns the updated canonical raw vector and a
/// warning for each block that could not be solved.
pub fn mstep(
    model: &Model,
    data: &CompleteData,
    settings: &MStepSettings,
    pool: &WorkerPool,
    cycle: usize,
) -> (Array1<f64>, Vec<FitWarning>) {
    let blocks = &model.layout().blocks;
    let scale = data.total();
    let solved: Vec<Option<Array1<f64>>> = pool.map(blocks.len(), |b| {
        let block = &blocks[b];
        if block.is_latent() && data.skip_latent {
            return None;
        }
        BlockProblem::new(model, block, data)
            .solve(settings, scale)
            .map(|r| r.x)
    });

    let mut raw = model.raw();
    let mut warnings = Vec::new();
    for (block, result) in blocks.iter().zip(solved) {
        match result {
            Some(x) => {
                for (local, &c) in block.canon.iter().enumerate() {
                    raw[c] = x[local];
                }
            }
            None if block.is_latent() && data.skip_latent => {}
            None => match block.owners[0] {
                Owner::Item { group, item } => {
                    warnings.push(FitWarning::ItemOptimizationFailed { group, item, cycle })
                }
                Owner::Latent { group } => {
                    warnings.push(FitWarning::GroupOptimizationFailed { group, cycle })
                }
            },
        }
    }
    (raw, warnings)
}

/// Unscaled complete-data gradient over every canonical parameter.
pub fn complete_gradient(model: &Model, data: &CompleteData) -> Array1<f64> {
    let mut grad = Array1::zeros(model.npars());
    for block in &model.layout().blocks {
        let problem = BlockProblem::new(model, block, data);
        let (_, g) = problem.value_grad(&problem.x0());
        for (local, &c) in block.canon.iter().enumerate() {
            grad[c] = -g[local];
        }
    }
    grad
}

/// Block-diagonal Hessian of the negative complete-data log-likelihood.
pub fn complete_hessian(model: &Model, data: &CompleteData, pool: &WorkerPool) -> Array2<f64> {
    let blocks = &model.layout().blocks;
    let parts: Vec<Array2<f64>> = pool.map(blocks.len(), |b| {
        let problem = BlockProblem::new(model, &blocks[b], data);
        problem.hessian(&problem.x0())
    });
    let n = model.npars();
    let mut h = Array2::zeros((n, n));
    for (block, part) in blocks.iter().zip(parts) {
        for (a, &ca) in block.canon.iter().enumerate() {
            for (b, &cb) in block.canon.iter().enumerate() {
                h[[ca, cb]] = part[[a, b]];
            }
        }
    }
    h
}

fn guard(value: f64, grad: Array1<f64>) -> (f64, Array1<f64>) {
    if !value.is_finite() {
        let n = grad.len();
        return (LARGE_COST, Array1::zeros(n));
    }
    (value, grad.mapv(|g| if g.is_finite() { g } else { 0.0 }))
}

fn project(x: &Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
    x.iter()
        .zip(bounds.iter())
        .map(|(&v, &(lo, hi))| v.max(lo).min(hi))
        .collect()
}

/// Unconstrained quasi-Newton through `wolfe_bfgs`.
pub fn run_bfgs<F>(f: &F, x0: &Array1<f64>, tol: f64, maxit: usize) -> Option<OptimResult>
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let objective = |x: &Array1<f64>| {
        let (v, g) = f(x);
        guard(v, g)
    };
    match Bfgs::new(x0.clone(), objective)
        .with_tolerance(tol)
        .with_max_iterations(maxit)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => Some(OptimResult {
            x: final_point,
            value: final_value,
            iterations,
            converged: true,
        }),
        Err(e) => {
            log::debug!("BFGS stopped early ({:?}); switching to Newton-Raphson", e);
            None
        }
    }
}

/// Damped Newton-Raphson with a numeric Hessian of the analytic gradient.
pub fn newton<F>(
    f: &F,
    x0: &Array1<f64>,
    bounds: &[(f64, f64)],
    tol: f64,
    maxit: usize,
) -> OptimResult
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let mut x = project(x0, bounds);
    let (v, g) = f(&x);
    let (mut value, mut grad) = guard(v, g);
    let mut converged = false;
    let mut iterations = 0;

    for it in 0..maxit {
        iterations = it + 1;
        if grad.iter().fold(0.0f64, |m, g| m.max(g.abs())) < tol {
            converged = true;
            break;
        }
        let hess = linalg::ridge_to_pd(&num_hessian(|y| f(y).1, &x), 1e-8);
        let step = match linalg::solve(&hess, &grad) {
            Ok(s) => s,
            Err(_) => grad.clone(),
        };

        let mut t = 1.0;
        let mut accepted = false;
        for _ in 0..30 {
            let candidate = project(&(&x - &(&step * t)), bounds);
            let (cv, cg) = f(&candidate);
            let (cv, cg) = guard(cv, cg);
            if cv < value {
                let change = (&candidate - &x).iter().fold(0.0f64, |m, d| m.max(d.abs()));
                x = candidate;
                value = cv;
                grad = cg;
                accepted = true;
                if change < tol {
                    converged = true;
                }
                break;
            }
            t *= 0.5;
        }
        if !accepted || converged {
            converged = true;
            break;
        }
    }
    OptimResult {
        x,
        value,
        iterations,
        converged,
    }
}

/// Projected quasi-Newton for box-constrained blocks.
pub fn bounded_bfgs<F>(
    f: &F,
    x0: &Array1<f64>,
    bounds: &[(f64, f64)],
    tol: f64,
    maxit: usize,
) -> OptimResult
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let n = x0.len();
    let mut x = project(x0, bounds);
    let (v, g) = f(&x);
    let (mut value, mut grad) = guard(v, g);
    let mut hinv = Array2::<f64>::eye(n);
    let mut converged = false;
    let mut iterations = 0;

    let projected_grad = |x: &Array1<f64>, g: &Array1<f64>| -> Array1<f64> {
        (0..n)
            .map(|i| {
                let (lo, hi) = bounds[i];
                if (x[i] <= lo && g[i] > 0.0) || (x[i] >= hi && g[i] < 0.0) {
                    0.0
                } else {
                    g[i]
                }
            })
            .collect()
    };

    for it in 0..maxit {
        iterations = it + 1;
        let pg = projected_grad(&x, &grad);
        if pg.iter().fold(0.0f64, |m, v| m.max(v.abs())) < tol {
            converged = true;
            break;
        }
        let mut dir = -hinv.dot(&pg);
        if dir.dot(&pg) >= 0.0 {
            hinv = Array2::eye(n);
            dir = -pg.clone();
        }

        let mut t = 1.0;
        let mut next = None;
        for _ in 0..40 {
            let candidate = project(&(&x + &(&dir * t)), bounds);
            let (cv, cg) = f(&candidate);
            let (cv, cg) = guard(cv, cg);
            let decrease = grad.dot(&(&candidate - &x));
            if cv <= value + 1e-4 * decrease {
                next = Some((candidate, cv, cg));
                break;
            }
            t *= 0.5;
        }
        let Some((xn, vn, gn)) = next else {
            break;
        };

        let s = &xn - &x;
        let y = &gn - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            let rho = 1.0 / sy;
            let eye = Array2::<f64>::eye(n);
            let left = &eye - &(outer(&s, &y) * rho);
            let right = &eye - &(outer(&y, &s) * rho);
            hinv = left.dot(&hinv).dot(&right) + outer(&s, &s) * rho;
        }
        let change = s.iter().fold(0.0f64, |m, d| m.max(d.abs()));
        x = xn;
        value = vn;
        grad = gn;
        if change < tol * 1e-2 {
            converged = true;
            break;
        }
    }
    OptimResult {
        x,
        value,
        iterations,
        converged,
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Simplex objective; points are projected into the box and non-finite values are
/// replaced by `LARGE_COST`.
struct SimplexCost<'a, F> {
    f: F,
    bounds: &'a [(f64, f64)],
}

impl<F> CostFunction for SimplexCost<'_, F>
where
    F: Fn(&Array1<f64>) -> f64,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, ArgminError> {
        let x = project(&Array1::from(p.clone()), self.bounds);
        let v = (self.f)(&x);
        Ok(if v.is_finite() { v } else { LARGE_COST })
    }
}

/// Derivative-free Nelder-Mead search inside the box `bounds`.
pub fn nelder_mead<F>(
    f: F,
    x0: &Array1<f64>,
    bounds: &[(f64, f64)],
    tol: f64,
    maxit: usize,
) -> OptimResult
where
    F: Fn(&Array1<f64>) -> f64,
{
    let start = project(x0, bounds);
    let fallback = |f: &F| {
        let value = f(&start);
        OptimResult {
            x: start.clone(),
            value,
            iterations: 0,
            converged: false,
        }
    };
    if start.is_empty() {
        return OptimResult {
            converged: true,
            ..fallback(&f)
        };
    }

    let mut simplex = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut v = start.clone();
        v[i] += 0.1 * start[i].abs().max(1.0);
        simplex.push(project(&v, bounds).to_vec());
    }
    let solver = match NelderMead::new(simplex).with_sd_tolerance(tol) {
        Ok(solver) => solver,
        Err(e) => {
            log::debug!("Nelder-Mead setup failed: {}", e);
            return fallback(&f);
        }
    };
    let problem = SimplexCost { f: &f, bounds };
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(maxit as u64))
        .run();
    match result {
        Ok(res) => {
            let state = res.state();
            let Some(best) = state.get_best_param() else {
                return fallback(&f);
            };
            let x = project(&Array1::from(best.clone()), bounds);
            OptimResult {
                value: f(&x),
                x,
                iterations: state.get_iter() as usize,
                converged: matches!(
                    state.get_termination_reason(),
                    Some(TerminationReason::SolverConverged)
                ),
            }
        }
        Err(e) => {
            log::debug!("Nelder-Mead stopped with an error: {}", e);
            fallback(&f)
        }
    }
}
