//! Metropolis-Hastings Robbins-Monro estimator.
//!
//! Stage 1 (burn-in) and stage 2 take fixed-gain Newton steps on the complete-data
//! score of the imputed traits; stage 3 switches to the Robbins-Monro gain sequence.
//! When the MHRM information is requested, stage 3 also averages the score, its outer
//! product and the complete-data information.

use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

use crate::config::{FitOptions, SeType};
use crate::data::{PatternTable, ResponseMatrix};
use crate::error::{raise, FitWarning, MirtError, MirtResult};
use crate::estep::estep;
use crate::items::{Item, P_FLOOR};
use crate::linalg::{self, MvnDensity};
use crate::model::{LatentPrior, Model};
use crate::mstep::{complete_gradient, complete_hessian, CompleteData, LatentMode};
use crate::parallel::{Runtime, WorkerPool};
use crate::quadrature::QuadratureGrid;
use crate::utils::{logsumexp, max_abs_diff};

const FIXED_GAIN: f64 = 0.25;
const MAX_STEP: f64 = 1.0;
const FIRST_CYCLE_SWEEPS: usize = 10;
const TUNE_EVERY: usize = 10;
const WIDTH_LIMITS: (f64, f64) = (1e-3, 5.0);
const MIN_SE_CYCLES: usize = 400;
const CONVERGED_STREAK: usize = 3;

#[derive(Debug, Clone)]
pub struct MhrmOutcome {
    pub loglik: f64,
    /// Stage-3 cycles run
    pub cycles: usize,
    pub converged: bool,
    pub warnings: Vec<FitWarning>,
    /// Louis-type observed information accumulated during stage 3
    pub information: Option<Array2<f64>>,
    /// Final imputed traits per group, rows in group order
    pub draws: Vec<Array2<f64>>,
}

fn log_posterior(
    items: &[Item],
    values: &[Vec<f64>],
    row: ArrayView1<i32>,
    theta: ArrayView1<f64>,
    prior: &LatentPrior,
) -> f64 {
    let mut lp = prior.log_density(theta);
    for (j, &r) in row.iter().enumerate() {
        if r < 0 {
            continue;
        }
        let p = items[j].prob_at(&values[j], theta);
        lp += p[r as usize].max(P_FLOOR).ln();
    }
    lp
}

/// Chain state of one group.
struct GroupChain {
    persons: Vec<usize>,
    draws: Array2<f64>,
    widths: Array1<f64>,
    accepted: usize,
    proposed: usize,
}

impl GroupChain {
    fn acceptance(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    fn tune(&mut self) {
        let rate = self.acceptance();
        let factor = if rate < 0.1 {
            0.8
        } else if rate > 0.4 {
            1.2
        } else {
            1.0
        };
        self.widths
            .mapv_inplace(|w| (w * factor).clamp(WIDTH_LIMITS.0, WIDTH_LIMITS.1));
        log::debug!("MH acceptance {:.3}; widths {:?}", rate, self.widths.to_vec());
        self.accepted = 0;
        self.proposed = 0;
    }
}

/// Random-walk Metropolis-Hastings sweeps over every respondent of group `g`.
fn sweep(
    model: &Model,
    g: usize,
    responses: &Array2<i32>,
    chain: &mut GroupChain,
    n_sweeps: usize,
    rng: &mut Pcg64,
    pool: &WorkerPool,
) -> MirtResult<()> {
    let gm = &model.groups[g];
    let values: Vec<Vec<f64>> = gm.items.iter().map(|it| it.values()).collect();
    let prior = model.latent_prior(g)?;
    let n = chain.persons.len();
    let seeds: Vec<u64> = (0..n).map(|_| rng.random()).collect();

    let draws = &chain.draws;
    let widths = &chain.widths;
    let persons = &chain.persons;
    let results: Vec<(Array1<f64>, usize)> = pool.map(n, |i| {
        let mut local = Pcg64::seed_from_u64(seeds[i]);
        let row = responses.row(persons[i]);
        let mut current = draws.row(i).to_owned();
        let mut lp = log_posterior(&gm.items, &values, row, current.view(), &prior);
        let mut accepted = 0;
        for _ in 0..n_sweeps {
            let candidate: Array1<f64> = current
                .iter()
                .zip(widths.iter())
                .map(|(t, w)| t + w * local.sample::<f64, _>(StandardNormal))
                .collect();
            let lc = log_posterior(&gm.items, &values, row, candidate.view(), &prior);
            if lc.is_finite() && (local.random::<f64>().ln() < lc - lp || !lp.is_finite()) {
                current = candidate;
                lp = lc;
                accepted += 1;
            }
        }
        (current, accepted)
    });

    for (i, (theta, accepted)) in results.into_iter().enumerate() {
        chain.draws.row_mut(i).assign(&theta);
        chain.accepted += accepted;
    }
    chain.proposed += n * n_sweeps;
    Ok(())
}

fn indicators(
    model: &Model,
    g: usize,
    responses: &Array2<i32>,
    persons: &[usize],
) -> Vec<Array2<f64>> {
    model.groups[g]
        .items
        .iter()
        .enumerate()
        .map(|(j, item)| {
            let mut m = Array2::zeros((persons.len(), item.ncat));
            for (i, &p) in persons.iter().enumerate() {
                let r = responses[[p, j]];
                if r >= 0 {
                    m[[i, r as usize]] = 1.0;
                }
            }
            m
        })
        .collect()
}

/// Clamp, cap and back off a step until every latent covariance stays PD.
fn constrained_step(
    model: &Model,
    x: &Array1<f64>,
    step: &Array1<f64>,
    bounds: &[(f64, f64)],
) -> Array1<f64> {
    let capped = step.mapv(|s| if s.is_finite() { s.clamp(-MAX_STEP, MAX_STEP) } else { 0.0 });
    let mut scale = 1.0;
    for _ in 0..10 {
        let candidate: Array1<f64> = x
            .iter()
            .zip(capped.iter())
            .zip(bounds.iter())
            .map(|((&xi, &si), &(lo, hi))| (xi + scale * si).max(lo).min(hi))
            .collect();
        let mut trial = model.clone();
        trial.set_raw(&candidate);
        if trial
            .groups
            .iter()
            .all(|gm| linalg::is_positive_definite(&gm.latent.cov()))
        {
            return candidate;
        }
        scale *= 0.5;
    }
    x.clone()
}

fn newton_direction(info: &Array2<f64>, grad: &Array1<f64>) -> Array1<f64> {
    let pd = linalg::ridge_to_pd(&linalg::symmetrize(info), 1e-6);
    linalg::solve(&pd, grad).unwrap_or_else(|_| grad.clone())
}

fn median(values: &[f64]) -> f64 {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if v.is_empty() {
        0.0
    } else {
        v[v.len() / 2]
    }
}

pub fn run_mhrm(
    model: &mut Model,
    data: &ResponseMatrix,
    patterns: &PatternTable,
    opts: &FitOptions,
    runtime: &Runtime,
) -> MirtResult<MhrmOutcome> {
    let pool = &runtime.pool;
    let tech = &opts.technical;
    let tol = opts.effective_tol();
    let ncycles = opts.effective_ncycles();
    let (g0, g1) = tech.gain;
    let want_info = opts.se && matches!(opts.se_type, SeType::Mhrm | SeType::Sandwich);
    let auto_tune = tech.mh_widths.is_none();
    let stage12 = tech.burnin + tech.semcycles;
    let responses = data.data();
    let bounds = model.raw_bounds();
    let npars = model.npars();

    log::info!(
        "MH-RM: {} free parameters, {} respondents, burn-in {}, stage-2 {} cycles",
        npars,
        data.n_persons(),
        tech.burnin,
        tech.semcycles
    );

    let mut rng = Pcg64::seed_from_u64(tech.seed);
    let start_widths = match &tech.mh_widths {
        Some(w) => Array1::from(w.clone()),
        None => Array1::from_elem(model.nfact, 1.0),
    };
    let mut chains: Vec<GroupChain> = (0..model.n_groups())
        .map(|g| {
            let persons: Vec<usize> =
                (0..data.n_persons()).filter(|&i| data.groups()[i] == g).collect();
            GroupChain {
                draws: Array2::zeros((persons.len(), model.nfact)),
                persons,
                widths: start_widths.clone(),
                accepted: 0,
                proposed: 0,
            }
        })
        .collect();
    let counts: Vec<Vec<Array2<f64>>> = (0..model.n_groups())
        .map(|g| indicators(model, g, responses, &chains[g].persons))
        .collect();
    let ones: Vec<Array1<f64>> = chains.iter().map(|c| Array1::ones(c.persons.len())).collect();

    let mut warnings = Vec::new();
    let mut x = model.raw();
    let mut stage2_sum = Array1::<f64>::zeros(npars);
    let mut gamma_info: Option<Array2<f64>> = None;
    let mut mean_score = Array1::<f64>::zeros(npars);
    let mut score_outer = Array2::<f64>::zeros((npars, npars));
    let mut changes: Vec<f64> = Vec::new();
    let mut streak = 0;
    let mut converged = false;
    let mut cancelled = false;
    let mut stage3_cycles = 0;

    for cycle in 1..=stage12 + ncycles {
        if runtime.cancel.is_cancelled() {
            raise(&mut warnings, FitWarning::Cancelled { cycle });
            cancelled = true;
            break;
        }
        let sweeps = if cycle == 1 { FIRST_CYCLE_SWEEPS } else { 1 };
        for (g, chain) in chains.iter_mut().enumerate() {
            sweep(model, g, responses, chain, sweeps, &mut rng, pool)?;
        }
        if auto_tune && cycle <= stage12 && cycle % TUNE_EVERY == 0 {
            for chain in chains.iter_mut() {
                chain.tune();
            }
        }

        let thetas: Vec<&Array2<f64>> = chains.iter().map(|c| &c.draws).collect();
        let complete = CompleteData {
            thetas: &thetas,
            expected: &counts,
            node_counts: &ones,
            latent: LatentMode::Draws,
            skip_latent: false,
        };
        let grad = complete_gradient(model, &complete);
        let info = complete_hessian(model, &complete, pool);

        let step = if cycle <= stage12 {
            newton_direction(&info, &grad) * FIXED_GAIN
        } else {
            stage3_cycles += 1;
            let k = stage3_cycles as f64;
            let gain = (g0 / k).powf(g1).min(1.0);
            let gamma = match gamma_info.take() {
                Some(prev) => &prev + &((&info - &prev) * gain),
                None => info.clone(),
            };
            if want_info {
                if stage3_cycles == 1 {
                    mean_score = grad.clone();
                    score_outer = outer(&grad, &grad);
                } else {
                    mean_score = &mean_score + &((&grad - &mean_score) * gain);
                    score_outer = &score_outer + &((&outer(&grad, &grad) - &score_outer) * gain);
                }
            }
            let dir = newton_direction(&gamma, &grad) * gain;
            gamma_info = Some(gamma);
            dir
        };

        let next = constrained_step(model, &x, &step, &bounds);
        let change = max_abs_diff(&next, &x);
        model.set_raw(&next);
        x = next;

        if cycle > tech.burnin && cycle <= stage12 {
            stage2_sum = stage2_sum + &x;
            if cycle == stage12 {
                let avg = &stage2_sum / tech.semcycles.max(1) as f64;
                let avg = constrained_step(model, &x, &(&avg - &x), &bounds);
                model.set_raw(&avg);
                x = avg;
            }
        }

        if cycle > stage12 {
            log::debug!("MH-RM cycle {}: max change {:.5}", stage3_cycles, change);
            changes.push(change);
            streak = if change < tol { streak + 1 } else { 0 };
            if streak >= CONVERGED_STREAK && (!want_info || stage3_cycles >= MIN_SE_CYCLES) {
                converged = true;
                break;
            }
        } else {
            log::debug!("MH-RM stage {} cycle {}", if cycle <= tech.burnin { 1 } else { 2 }, cycle);
        }
    }

    if !converged && !cancelled {
        raise(&mut warnings, FitWarning::MaxCyclesReached { cycles: stage3_cycles });
        let tail = &changes[changes.len().saturating_sub(20)..];
        let med = median(tail);
        if med > 10.0 * tol {
            raise(&mut warnings, FitWarning::FlatLikelihood { max_change: med });
        }
    }

    let information = match (want_info, gamma_info) {
        (true, Some(gamma)) => {
            let missing = &score_outer - &outer(&mean_score, &mean_score);
            Some(gamma - missing)
        }
        _ => None,
    };

    let loglik = final_loglik(model, patterns, opts, pool, &mut rng)?;
    log::info!(
        "MH-RM finished after {} stage-3 cycles (converged: {}), log-likelihood {:.4}",
        stage3_cycles,
        converged,
        loglik
    );

    Ok(MhrmOutcome {
        loglik,
        cycles: stage3_cycles,
        converged,
        warnings,
        information,
        draws: chains.into_iter().map(|c| c.draws).collect(),
    })
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Observed log-likelihood by quadrature when the grid fits, else by Monte Carlo.
pub fn final_loglik(
    model: &Model,
    patterns: &PatternTable,
    opts: &FitOptions,
    pool: &WorkerPool,
    rng: &mut Pcg64,
) -> MirtResult<f64> {
    let tech = &opts.technical;
    match QuadratureGrid::build(model.nfact, opts.quadpts, tech.theta_lim, tech.max_quad) {
        Ok(grid) => Ok(estep(model, patterns, &grid, pool, false)?.loglik),
        Err(MirtError::QuadratureTooLarge { .. }) => {
            monte_carlo_loglik(model, patterns, tech.mc_draws, rng, pool)
        }
        Err(e) => Err(e),
    }
}

/// Self-normalised importance estimate of the marginal log-likelihood.
pub fn monte_carlo_loglik(
    model: &Model,
    patterns: &PatternTable,
    n_draws: usize,
    rng: &mut Pcg64,
    pool: &WorkerPool,
) -> MirtResult<f64> {
    let d = model.nfact;
    let mut total = 0.0;
    for g in 0..model.n_groups() {
        let gm = &model.groups[g];
        let (mean, cov) = match &model.custom_prior {
            Some(_) => (Array1::zeros(d), Array2::eye(d)),
            None => (gm.latent.mean(), gm.latent.cov()),
        };
        let chol = linalg::cholesky_lower(&cov)?;
        let proposal = MvnDensity::new(&mean, &cov)?;
        let mut draws = Array2::<f64>::zeros((n_draws, d));
        let mut log_w = Vec::with_capacity(n_draws);
        for s in 0..n_draws {
            let z: Array1<f64> = (0..d).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
            let theta = &mean + &chol.dot(&z);
            log_w.push(match &model.custom_prior {
                Some(density) => {
                    density.eval(&theta.to_vec()).ln() - proposal.log_pdf(theta.view())
                }
                None => 0.0,
            });
            draws.row_mut(s).assign(&theta);
        }
        let log_norm = logsumexp(&log_w);
        let traces: Vec<Array2<f64>> = gm
            .items
            .iter()
            .map(|it| it.probtrace(&draws).mapv(|p| p.max(P_FLOOR).ln()))
            .collect();
        let members = patterns.group_patterns(g);
        let parts: Vec<f64> = pool.map(members.len(), |m| {
            let p = members[m];
            let pattern = patterns.pattern(p);
            let mut lj = log_w.clone();
            for (j, &r) in pattern.iter().enumerate() {
                if r < 0 {
                    continue;
                }
                for (s, v) in lj.iter_mut().enumerate() {
                    *v += traces[j][[s, r as usize]];
                }
            }
            patterns.freq[p] * (logsumexp(&lj) - log_norm)
        });
        total += parts.iter().sum::<f64>();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Technical;
    use crate::items::ItemType;
    use crate::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tiny() -> ResponseMatrix {
        ResponseMatrix::new(array![
            [0, 0, 1],
            [1, 0, 1],
            [1, 1, 1],
            [0, 0, 0],
            [1, 1, 0],
            [0, 1, 1],
            [1, 1, 1],
            [0, 0, 1]
        ])
        .unwrap()
    }

    #[test]
    fn widths_shrink_when_acceptance_is_low() {
        let mut chain = GroupChain {
            persons: vec![0],
            draws: Array2::zeros((1, 1)),
            widths: array![1.0],
            accepted: 1,
            proposed: 100,
        };
        chain.tune();
        assert_abs_diff_eq!(chain.widths[0], 0.8, epsilon = 1e-12);
        chain.accepted = 90;
        chain.proposed = 100;
        chain.tune();
        assert_abs_diff_eq!(chain.widths[0], 0.96, epsilon = 1e-12);
    }

    #[test]
    fn same_seed_gives_same_estimates() {
        let data = tiny();
        let table = PatternTable::from_responses(&data);
        let opts = FitOptions {
            technical: Technical {
                burnin: 20,
                semcycles: 10,
                ncycles: Some(30),
                ..Technical::default()
            },
            ..FitOptions::mhrm()
        };
        let run = || {
            let spec = ModelSpec::exploratory(1, ItemType::Rasch);
            let mut model = Model::build(&data, &spec).unwrap();
            let rt = Runtime::new(WorkerPool::global());
            run_mhrm(&mut model, &data, &table, &opts, &rt).unwrap();
            model.raw()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn monte_carlo_agrees_with_quadrature() {
        let data = tiny();
        let table = PatternTable::from_responses(&data);
        let model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let grid = QuadratureGrid::build(1, Some(61), (-6.0, 6.0), 20000).unwrap();
        let quad = estep(&model, &table, &grid, &WorkerPool::sequential(), false)
            .unwrap()
            .loglik;
        let mut rng = Pcg64::seed_from_u64(3);
        let mc =
            monte_carlo_loglik(&model, &table, 20000, &mut rng, &WorkerPool::sequential()).unwrap();
        assert_abs_diff_eq!(mc, quad, epsilon = 0.1);
    }
}
