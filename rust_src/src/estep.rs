//! Expectation step over the quadrature grid.

use ndarray::{Array1, Array2, ArrayView1};

use crate::data::PatternTable;
use crate::error::MirtResult;
use crate::items::P_FLOOR;
use crate::model::Model;
use crate::parallel::WorkerPool;
use crate::quadrature::QuadratureGrid;
use crate::utils::{compute_log_weights, logsumexp};

/// Log trace lines and log prior weights of one group, shared read-only by all patterns.
#[derive(Debug, Clone)]
pub struct GroupTraces {
    /// Per item, Q×K log category probabilities
    pub log_traces: Vec<Array2<f64>>,
    pub log_prior: Vec<f64>,
}

impl GroupTraces {
    pub fn new(model: &Model, g: usize, grid: &QuadratureGrid) -> MirtResult<Self> {
        let prior = model.prior_weights(g, grid)?;
        Ok(Self::with_prior(model, g, grid, &prior))
    }

    pub fn with_prior(model: &Model, g: usize, grid: &QuadratureGrid, prior: &Array1<f64>) -> Self {
        let log_traces = model.groups[g]
            .items
            .iter()
            .map(|item| item.probtrace(&grid.theta).mapv(|p| p.max(P_FLOOR).ln()))
            .collect();
        GroupTraces {
            log_traces,
            log_prior: compute_log_weights(&prior.to_vec()),
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.log_prior.len()
    }

    /// Σ_j log P_j(x_j | θ_q) at every node, ignoring missing responses.
    pub fn log_likelihood(&self, pattern: ArrayView1<i32>) -> Vec<f64> {
        let mut ll = vec![0.0; self.n_nodes()];
        for (j, &r) in pattern.iter().enumerate() {
            if r < 0 {
                continue;
            }
            let lt = &self.log_traces[j];
            for (q, v) in ll.iter_mut().enumerate() {
                *v += lt[[q, r as usize]];
            }
        }
        ll
    }

    /// Normalised posterior over nodes and the log marginal likelihood of the pattern.
    pub fn posterior(&self, pattern: ArrayView1<i32>) -> (Vec<f64>, f64) {
        let mut lj = self.log_likelihood(pattern);
        for (v, lp) in lj.iter_mut().zip(self.log_prior.iter()) {
            *v += lp;
        }
        let lse = logsumexp(&lj);
        let post = lj.iter().map(|&v| (v - lse).exp()).collect();
        (post, lse)
    }
}

#[derive(Debug, Clone)]
pub struct EStepResult {
    pub loglik: f64,
    /// `expected[g][j]` holds Q×K expected category counts
    pub expected: Vec<Vec<Array2<f64>>>,
    /// Posterior node totals per group
    pub node_counts: Vec<Array1<f64>>,
    /// Log marginal likelihood per pattern
    pub log_marginal: Vec<f64>,
    /// Pattern × node posterior, kept on request
    pub posterior: Option<Array2<f64>>,
}

/// Run the E-step for every group; patterns are processed on the pool, aggregation here.
pub fn estep(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    pool: &WorkerPool,
    keep_posterior: bool,
) -> MirtResult<EStepResult> {
    let traces: Vec<GroupTraces> = (0..model.n_groups())
        .map(|g| GroupTraces::new(model, g, grid))
        .collect::<MirtResult<_>>()?;
    Ok(estep_with(model, patterns, &traces, pool, keep_posterior))
}

pub fn estep_with(
    model: &Model,
    patterns: &PatternTable,
    traces: &[GroupTraces],
    pool: &WorkerPool,
    keep_posterior: bool,
) -> EStepResult {
    let n_nodes = traces.first().map(|t| t.n_nodes()).unwrap_or(0);
    let results: Vec<(Vec<f64>, f64)> = pool.map(patterns.n_patterns(), |p| {
        traces[patterns.group[p]].posterior(patterns.pattern(p))
    });

    let mut expected: Vec<Vec<Array2<f64>>> = model
        .groups
        .iter()
        .map(|gm| gm.items.iter().map(|it| Array2::zeros((n_nodes, it.ncat))).collect())
        .collect();
    let mut node_counts: Vec<Array1<f64>> = vec![Array1::zeros(n_nodes); model.n_groups()];
    let mut loglik = 0.0;
    let mut log_marginal = Vec::with_capacity(results.len());
    let mut posterior = if keep_posterior {
        Some(Array2::zeros((patterns.n_patterns(), n_nodes)))
    } else {
        None
    };

    for (p, (post, lse)) in results.iter().enumerate() {
        let g = patterns.group[p];
        let f = patterns.freq[p];
        loglik += f * lse;
        log_marginal.push(*lse);
        for (q, &w) in post.iter().enumerate() {
            node_counts[g][q] += f * w;
        }
        for (j, &r) in patterns.pattern(p).iter().enumerate() {
            if r < 0 {
                continue;
            }
            let counts = &mut expected[g][j];
            for (q, &w) in post.iter().enumerate() {
                counts[[q, r as usize]] += f * w;
            }
        }
        if let Some(all) = posterior.as_mut() {
            for (q, &w) in post.iter().enumerate() {
                all[[p, q]] = w;
            }
        }
    }

    EStepResult {
        loglik,
        expected,
        node_counts,
        log_marginal,
        posterior,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ResponseMatrix;
    use crate::items::ItemType;
    use crate::model::ModelSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn expected_counts_add_up_to_observed_totals() {
        let data =
            ResponseMatrix::new(array![[0, 1, -1], [1, 1, 0], [1, 0, 1], [0, 0, 0], [1, 1, 1]])
                .unwrap();
        let model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, Some(21), (-4.0, 4.0), 20000).unwrap();
        let res = estep(&model, &table, &grid, &WorkerPool::sequential(), true).unwrap();

        assert_abs_diff_eq!(res.node_counts[0].sum(), 5.0, epsilon = 1e-10);
        // item 3 is missing for one respondent
        assert_abs_diff_eq!(res.expected[0][2].sum(), 4.0, epsilon = 1e-10);
        let total: f64 = res.log_marginal.iter().zip(table.freq.iter()).map(|(l, f)| l * f).sum();
        assert_abs_diff_eq!(res.loglik, total, epsilon = 1e-12);
        assert!(res.loglik < 0.0);
        let post = res.posterior.unwrap();
        assert_abs_diff_eq!(post.row(0).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn pool_choice_does_not_change_the_result() {
        let data = ResponseMatrix::new(array![[0, 1], [1, 1], [1, 0], [0, 0], [1, 1]]).unwrap();
        let model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::TwoPL)).unwrap();
        let table = PatternTable::from_responses(&data);
        let grid = QuadratureGrid::build(1, None, (-4.0, 4.0), 20000).unwrap();
        let a = estep(&model, &table, &grid, &WorkerPool::sequential(), false).unwrap();
        let b = estep(&model, &table, &grid, &WorkerPool::global(), false).unwrap();
        assert_eq!(a.loglik, b.loglik);
    }
}
