//! Quadrature EM estimator.

use ndarray::{Array1, Array2};

use crate::config::FitOptions;
use crate::data::PatternTable;
use crate::error::{raise, FitWarning, MirtResult};
use crate::estep::{estep, EStepResult};
use crate::linalg;
use crate::model::Model;
use crate::mstep::{mstep, CompleteData, LatentMode, MStepSettings};
use crate::parallel::{Runtime, WorkerPool};
use crate::quadrature::QuadratureGrid;
use crate::utils::max_abs_diff;

/// Ramsay extrapolation never goes further than this.
const RAMSAY_MIN_ALPHA: f64 = -5.0;

#[derive(Debug, Clone)]
pub struct EmOutcome {
    pub loglik: f64,
    pub cycles: usize,
    pub converged: bool,
    pub warnings: Vec<FitWarning>,
    /// Un-accelerated raw iterates, recorded for supplemented EM
    pub trajectory: Vec<Array1<f64>>,
    /// Observed log-likelihood at the start of every cycle
    pub loglik_trace: Vec<f64>,
    /// E-step at the returned parameters
    pub estep: EStepResult,
}

pub(crate) fn mstep_settings(opts: &FitOptions) -> MStepSettings {
    MStepSettings {
        optimizer: opts.optimizer,
        tol: opts.technical.mstep_tol,
        maxit: opts.technical.mstep_maxit,
    }
}

/// Complete-data view of an E-step on a shared grid.
pub fn grid_data<'a>(
    thetas: &'a [&'a Array2<f64>],
    estep: &'a EStepResult,
    skip_latent: bool,
) -> CompleteData<'a> {
    CompleteData {
        thetas,
        expected: &estep.expected,
        node_counts: &estep.node_counts,
        latent: LatentMode::Grid,
        skip_latent,
    }
}

/// Replace every group's histogram with its normalised posterior node counts.
fn update_histogram(model: &mut Model, estep: &EStepResult) {
    for (gm, counts) in model.groups.iter_mut().zip(estep.node_counts.iter()) {
        let total = counts.sum();
        if total > 0.0 {
            gm.histogram = Some(counts.mapv(|n| (n / total).max(1e-300)));
        }
    }
}

/// Report the histogram's mean and variance through the (fixed) latent parameters.
fn histogram_moments(model: &mut Model, grid: &QuadratureGrid) {
    for gm in model.groups.iter_mut() {
        let Some(h) = &gm.histogram else {
            continue;
        };
        let nodes = grid.theta.column(0);
        let mean: f64 = h.iter().zip(nodes.iter()).map(|(w, t)| w * t).sum();
        let var: f64 = h.iter().zip(nodes.iter()).map(|(w, t)| w * (t - mean).powi(2)).sum();
        gm.latent.set_mean_cov(&Array1::from_elem(1, mean), &Array2::from_elem((1, 1), var));
    }
}

/// Accept an extrapolated candidate only when every latent covariance stays PD.
fn admissible(model: &Model, candidate: &Array1<f64>) -> bool {
    let mut trial = model.clone();
    trial.set_raw(candidate);
    trial
        .groups
        .iter()
        .all(|gm| linalg::is_positive_definite(&gm.latent.cov()))
}

/// Highest penalised log-likelihood evaluated so far and the state that produced it.
struct BestIterate {
    obj: f64,
    x: Array1<f64>,
    histograms: Vec<Option<Array1<f64>>>,
}

impl BestIterate {
    fn new(model: &Model) -> Self {
        BestIterate {
            obj: f64::NEG_INFINITY,
            x: model.raw(),
            histograms: model.groups.iter().map(|gm| gm.histogram.clone()).collect(),
        }
    }

    fn record(&mut self, obj: f64, model: &Model) {
        if obj > self.obj {
            self.obj = obj;
            self.x = model.raw();
            for (slot, gm) in self.histograms.iter_mut().zip(model.groups.iter()) {
                slot.clone_from(&gm.histogram);
            }
        }
    }

    fn restore(&self, model: &mut Model) {
        model.set_raw(&self.x);
        for (gm, h) in model.groups.iter_mut().zip(self.histograms.iter()) {
            gm.histogram.clone_from(h);
        }
    }
}

fn clamp_to_bounds(x: &Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
    x.iter()
        .zip(bounds.iter())
        .map(|(&v, &(lo, hi))| v.max(lo).min(hi))
        .collect()
}

/// One full EM cycle started from raw parameters `x`; the map whose Jacobian SEM needs.
pub fn em_map(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    x: &Array1<f64>,
    opts: &FitOptions,
    pool: &WorkerPool,
) -> MirtResult<Array1<f64>> {
    let mut trial = model.clone();
    trial.set_raw(x);
    let e = estep(&trial, patterns, grid, pool, false)?;
    let thetas = vec![&grid.theta; trial.n_groups()];
    let data = grid_data(&thetas, &e, opts.empirical_histogram);
    let (raw, _) = mstep(&trial, &data, &mstep_settings(opts), pool, 0);
    Ok(raw)
}

/// Run EM until the log-likelihood (or, for SEM, the parameters) settle.
pub fn run_em(
    model: &mut Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    opts: &FitOptions,
    runtime: &Runtime,
) -> MirtResult<EmOutcome> {
    let pool = &runtime.pool;
    let tol = opts.effective_tol();
    let ncycles = opts.effective_ncycles();
    let accelerate = opts.accelerate_active();
    let sem = opts.sem_mode();
    let eh = opts.empirical_histogram;
    let settings = mstep_settings(opts);
    let bounds = model.raw_bounds();
    let thetas = vec![&grid.theta; model.n_groups()];

    log::info!(
        "EM: {} free parameters, {} groups, {} quadrature nodes, {} unique patterns",
        model.npars(),
        model.n_groups(),
        grid.n_nodes(),
        patterns.n_patterns()
    );

    if eh {
        for gm in model.groups.iter_mut() {
            gm.histogram = Some(grid.prior.clone());
        }
    }

    let mut warnings = Vec::new();
    let mut x = model.raw();
    let mut trajectory = if sem { vec![x.clone()] } else { Vec::new() };
    let mut loglik_trace = Vec::new();
    let mut best = BestIterate::new(model);
    let mut prev_obj = f64::NEG_INFINITY;
    let mut prev_delta: Option<Array1<f64>> = None;
    let mut accelerated = false;
    let mut converged = false;
    let mut cycles = 0;

    for cycle in 1..=ncycles {
        if runtime.cancel.is_cancelled() {
            raise(&mut warnings, FitWarning::Cancelled { cycle });
            break;
        }
        cycles = cycle;

        let mut e = estep(model, patterns, grid, pool, false)?;
        let mut obj = e.loglik + model.log_prior();
        log::debug!("EM cycle {}: log-likelihood {:.6}", cycle, e.loglik);
        loglik_trace.push(e.loglik);

        let mut restarted = false;
        if accelerated && obj < best.obj {
            log::debug!(
                "EM cycle {}: extrapolated step lost ground, restarting from the best iterate",
                cycle
            );
            best.restore(model);
            x = best.x.clone();
            e = estep(model, patterns, grid, pool, false)?;
            obj = e.loglik + model.log_prior();
            prev_delta = None;
            restarted = true;
        } else if cycle > 1 && !accelerated && obj < prev_obj - 1e-8 * prev_obj.abs().max(1.0) {
            raise(
                &mut warnings,
                FitWarning::LogLikelihoodDecreased {
                    cycle,
                    change: obj - prev_obj,
                },
            );
        }
        best.record(obj, model);
        if !sem && !restarted && cycle > 1 && (obj - prev_obj).abs() < tol {
            converged = true;
            break;
        }
        prev_obj = obj;

        if eh {
            update_histogram(model, &e);
        }

        let data = grid_data(&thetas, &e, eh);
        let (x_m, failures) = mstep(model, &data, &settings, pool, cycle);
        for w in failures {
            raise(&mut warnings, w);
        }

        let delta = &x_m - &x;
        let mut next = x_m.clone();
        accelerated = false;
        if accelerate && cycle > 3 {
            if let Some(prev) = &prev_delta {
                let norm = delta.dot(&delta).sqrt();
                let diff = &delta - prev;
                if norm > 0.0 {
                    let alpha = (1.0 - diff.dot(&diff).sqrt() / norm).max(RAMSAY_MIN_ALPHA);
                    let candidate = clamp_to_bounds(&(&x_m * (1.0 - alpha) + &x * alpha), &bounds);
                    if admissible(model, &candidate) {
                        next = candidate;
                        accelerated = alpha != 0.0;
                    }
                }
            }
        }
        prev_delta = Some(delta);

        let change = max_abs_diff(&next, &x);
        model.set_raw(&next);
        x = next;
        if sem {
            trajectory.push(x.clone());
            if change < tol {
                converged = true;
                break;
            }
        }
    }

    if !converged && !warnings.iter().any(|w| matches!(w, FitWarning::Cancelled { .. })) {
        raise(&mut warnings, FitWarning::MaxCyclesReached { cycles });
    }

    let mut last = estep(model, patterns, grid, pool, false)?;
    if last.loglik + model.log_prior() < best.obj {
        best.restore(model);
        last = estep(model, patterns, grid, pool, false)?;
    }
    if eh {
        histogram_moments(model, grid);
    }
    log::info!(
        "EM finished after {} cycles (converged: {}), log-likelihood {:.4}",
        cycles,
        converged,
        last.loglik
    );

    Ok(EmOutcome {
        loglik: last.loglik,
        cycles,
        converged,
        warnings,
        trajectory,
        loglik_trace,
        estep: last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Accelerate, SeType};
    use crate::data::ResponseMatrix;
    use crate::items::ItemType;
    use crate::model::ModelSpec;
    use ndarray::array;

    fn small_data() -> ResponseMatrix {
        ResponseMatrix::new(array![
            [0, 0, 1, 1],
            [1, 0, 1, 0],
            [1, 1, 1, 1],
            [0, 0, 0, 1],
            [1, 1, 0, 1],
            [0, 1, 1, 0],
            [1, 1, 1, 0],
            [0, 0, 0, 0],
            [1, 0, 1, 1],
            [1, 1, 1, 1]
        ])
        .unwrap()
    }

    #[test]
    fn unaccelerated_em_never_decreases_the_likelihood() {
        let data = small_data();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(31), (-4.0, 4.0), 20000).unwrap();
        let opts = FitOptions {
            accelerate: Accelerate::None,
            ..FitOptions::em()
        };
        let rt = Runtime::new(WorkerPool::sequential());
        let out = run_em(&mut model, &table, &grid, &opts, &rt).unwrap();
        assert!(!out
            .warnings
            .iter()
            .any(|w| matches!(w, FitWarning::LogLikelihoodDecreased { .. })));
        assert!(out.loglik.is_finite());
    }

    #[test]
    fn accelerated_em_returns_its_best_iterate() {
        let data = small_data();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(21), (-4.0, 4.0), 20000).unwrap();
        let rt = Runtime::new(WorkerPool::sequential());
        for ncycles in [2, 4, 5, 6, 8, 12, 20, 40] {
            let spec = ModelSpec::exploratory(1, ItemType::TwoPL);
            let mut model = Model::build(&data, &spec).unwrap();
            let opts = FitOptions {
                accelerate: Accelerate::Ramsay,
                technical: crate::config::Technical {
                    ncycles: Some(ncycles),
                    ..Default::default()
                },
                ..FitOptions::em()
            };
            let out = run_em(&mut model, &table, &grid, &opts, &rt).unwrap();
            let best = out.loglik_trace.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            assert!(
                out.loglik >= best - 1e-6,
                "ncycles {}: returned {} below best {}",
                ncycles,
                out.loglik,
                best
            );
        }
    }

    #[test]
    fn restoring_the_best_iterate_brings_back_parameters_and_histogram() {
        let data = small_data();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        model.groups[0].histogram = Some(array![0.25, 0.5, 0.25]);
        let mut best = BestIterate::new(&model);
        best.record(-10.0, &model);
        let saved = model.raw();

        let mut moved = saved.clone();
        moved[0] += 1.0;
        model.set_raw(&moved);
        model.groups[0].histogram = None;
        best.record(-12.0, &model);
        best.restore(&mut model);

        assert_eq!(model.raw(), saved);
        assert_eq!(model.groups[0].histogram, Some(array![0.25, 0.5, 0.25]));
    }

    #[test]
    fn sem_mode_records_the_trajectory() {
        let data = small_data();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::Rasch)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(21), (-4.0, 4.0), 20000).unwrap();
        let opts = FitOptions::em().with_se(SeType::Sem);
        let rt = Runtime::new(WorkerPool::sequential());
        let out = run_em(&mut model, &table, &grid, &opts, &rt).unwrap();
        assert_eq!(out.trajectory.len(), out.cycles + 1);
        assert_eq!(out.trajectory[0].len(), model.npars());
    }

    #[test]
    fn cancelled_fit_returns_unconverged() {
        let data = small_data();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(21), (-4.0, 4.0), 20000).unwrap();
        let rt = Runtime::new(WorkerPool::sequential());
        rt.cancel.cancel();
        let out = run_em(&mut model, &table, &grid, &FitOptions::em(), &rt).unwrap();
        assert!(!out.converged);
        assert!(matches!(out.warnings[0], FitWarning::Cancelled { cycle: 1 }));
    }

    #[test]
    fn empirical_histogram_reports_its_moments() {
        let data = small_data();
        let mut model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(21), (-4.0, 4.0), 20000).unwrap();
        let opts = FitOptions {
            empirical_histogram: true,
            technical: crate::config::Technical {
                ncycles: Some(50),
                ..Default::default()
            },
            ..FitOptions::em()
        };
        let rt = Runtime::new(WorkerPool::sequential());
        run_em(&mut model, &table, &grid, &opts, &rt).unwrap();
        let h = model.groups[0].histogram.as_ref().unwrap();
        approx::assert_abs_diff_eq!(h.sum(), 1.0, epsilon = 1e-9);
        assert!(model.groups[0].latent.cov()[[0, 0]] > 0.0);
    }
}
