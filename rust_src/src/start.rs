//! Default starting values from marginal item statistics.
//!
//! Item loadings come from the first factor of the polychoric (tetrachoric for
//! dichotomous items) correlation matrix; slopes and intercepts then follow the
//! normal-ogive to logistic conversion through the uniqueness. Only free parameters
//! are touched.

use std::f64::consts::PI;

use ndarray::Array2;

use crate::items::{Item, ItemType};
use crate::linalg;
use crate::utils::{clip, pnorm, qnorm};

const D_SCALE: f64 = 1.702;
const MAX_RHO: f64 = 0.95;
const MIN_LOADING: f64 = 0.05;
const MAX_LOADING: f64 = 0.9;
const PRINCIPAL_AXIS_ITERATIONS: usize = 5;
/// Even number of Simpson intervals for the bivariate normal integral.
const BVN_INTERVALS: usize = 24;

/// Category proportions of item `j`, floored so that empty categories stay usable.
fn proportions(data: &Array2<i32>, j: usize, ncat: usize) -> Vec<f64> {
    let mut counts = vec![0.0; ncat];
    for &r in data.column(j).iter() {
        if r >= 0 && (r as usize) < ncat {
            counts[r as usize] += 1.0;
        }
    }
    let total: f64 = counts.iter().sum::<f64>().max(1.0);
    let mut p: Vec<f64> = counts.iter().map(|c| (c / total).max(1e-3)).collect();
    let norm: f64 = p.iter().sum();
    for v in p.iter_mut() {
        *v /= norm;
    }
    p
}

/// Normal thresholds for the cumulative category proportions, with infinite ends.
fn thresholds(p: &[f64]) -> Vec<f64> {
    let mut tau = vec![f64::NEG_INFINITY];
    let mut cum = 0.0;
    for pk in p.iter().take(p.len() - 1) {
        cum += pk;
        tau.push(qnorm(cum));
    }
    tau.push(f64::INFINITY);
    tau
}

/// Bivariate standard normal CDF, integrating the density over arcsin(rho).
fn bvn_cdf(h: f64, k: f64, rho: f64) -> f64 {
    if h == f64::NEG_INFINITY || k == f64::NEG_INFINITY {
        return 0.0;
    }
    if h == f64::INFINITY {
        return pnorm(k);
    }
    if k == f64::INFINITY {
        return pnorm(h);
    }
    let top = rho.asin();
    let f = |t: f64| {
        let (s, c) = t.sin_cos();
        (-(h * h + k * k - 2.0 * h * k * s) / (2.0 * c * c)).exp()
    };
    // composite Simpson
    let step = top / BVN_INTERVALS as f64;
    let mut sum = f(0.0) + f(top);
    for i in 1..BVN_INTERVALS {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(i as f64 * step);
    }
    pnorm(h) * pnorm(k) + sum * step / 3.0 / (2.0 * PI)
}

/// Maximum likelihood polychoric correlation of a contingency table with fixed
/// thresholds.
fn polychoric(table: &Array2<f64>, tau_a: &[f64], tau_b: &[f64]) -> f64 {
    if table.sum() < 3.0 {
        return 0.0;
    }
    let loglik = |rho: f64| {
        let cdf = Array2::from_shape_fn((tau_a.len(), tau_b.len()), |(i, j)| {
            bvn_cdf(tau_a[i], tau_b[j], rho)
        });
        let mut ll = 0.0;
        for ((a, b), &n) in table.indexed_iter() {
            if n > 0.0 {
                let cell = cdf[[a + 1, b + 1]] - cdf[[a, b + 1]] - cdf[[a + 1, b]] + cdf[[a, b]];
                ll += n * cell.max(1e-300).ln();
            }
        }
        ll
    };
    // golden section on the concave profile
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (-MAX_RHO, MAX_RHO);
    let mut c = hi - ratio * (hi - lo);
    let mut d = lo + ratio * (hi - lo);
    let (mut fc, mut fd) = (loglik(c), loglik(d));
    while hi - lo > 1e-4 {
        if fc > fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - ratio * (hi - lo);
            fc = loglik(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + ratio * (hi - lo);
            fd = loglik(d);
        }
    }
    0.5 * (lo + hi)
}

/// Pairwise polychoric (tetrachoric for two categories) correlation matrix.
pub fn polychoric_matrix(data: &Array2<i32>, ncats: &[usize]) -> Array2<f64> {
    let n_items = ncats.len();
    let taus: Vec<Vec<f64>> = (0..n_items)
        .map(|j| thresholds(&proportions(data, j, ncats[j])))
        .collect();
    let mut r = Array2::eye(n_items);
    for a in 0..n_items {
        for b in (a + 1)..n_items {
            let mut table = Array2::<f64>::zeros((ncats[a], ncats[b]));
            for row in data.rows() {
                let (x, y) = (row[a], row[b]);
                if x >= 0 && y >= 0 && (x as usize) < ncats[a] && (y as usize) < ncats[b] {
                    table[[x as usize, y as usize]] += 1.0;
                }
            }
            let rho = polychoric(&table, &taus[a], &taus[b]);
            r[[a, b]] = rho;
            r[[b, a]] = rho;
        }
    }
    r
}

/// First-factor loadings of a correlation matrix by iterated principal axes.
pub fn first_factor_loadings(r: &Array2<f64>) -> Vec<f64> {
    let n = r.nrows();
    let mut reduced = r.clone();
    let mut loadings = vec![0.0; n];
    for _ in 0..PRINCIPAL_AXIS_ITERATIONS {
        let (value, vector) = linalg::leading_eigenpair(&reduced);
        let sign = if vector.sum() < 0.0 { -1.0 } else { 1.0 };
        let scale = value.max(0.0).sqrt() * sign;
        for j in 0..n {
            loadings[j] = vector[j] * scale;
            reduced[[j, j]] = clip(loadings[j] * loadings[j], 0.01, 0.95);
        }
    }
    loadings
}

/// Loading per item from the first factor of the polychoric correlations.
pub fn item_loadings(data: &Array2<i32>, ncats: &[usize]) -> Vec<f64> {
    if ncats.len() < 2 {
        return vec![MIN_LOADING; ncats.len()];
    }
    first_factor_loadings(&polychoric_matrix(data, ncats))
        .into_iter()
        .map(|l| {
            let l = clip(l, -MAX_LOADING, MAX_LOADING);
            if l.abs() < MIN_LOADING {
                MIN_LOADING.copysign(l)
            } else {
                l
            }
        })
        .collect()
}

fn set_free(item: &mut Item, name: &str, value: f64) {
    if let Some(p) = item.param_index(name) {
        if item.pars[p].free && value.is_finite() {
            item.pars[p].value = value;
        }
    }
}

/// Fill free parameters of every item from the recoded responses.
pub fn apply_start_values(items: &mut [Item], data: &Array2<i32>) {
    let ncats: Vec<usize> = items.iter().map(|it| it.ncat).collect();
    let loadings = item_loadings(data, &ncats);
    for (j, item) in items.iter_mut().enumerate() {
        if matches!(item.itemtype, ItemType::Custom(_)) {
            continue;
        }
        let lambda = loadings[j];
        let uniq = (1.0 - lambda * lambda).sqrt();
        let n_loaded = item.loading.iter().filter(|&&l| l).count().max(1) as f64;
        let slope = D_SCALE * lambda / uniq / n_loaded.sqrt();
        for k in 0..item.nfact {
            if item.loading[k] {
                set_free(item, &format!("a{}", k + 1), slope);
            }
        }

        let p = proportions(data, j, item.ncat);
        let ncat = item.ncat;
        let itemtype = item.itemtype.clone();
        match itemtype {
            ItemType::Rasch
            | ItemType::TwoPL
            | ItemType::ThreePL
            | ItemType::ThreePLu
            | ItemType::FourPL
                if ncat == 2 =>
            {
                let g = item.param_index("g").map(|i| item.pars[i].value).unwrap_or(0.0);
                let u = item.param_index("u").map(|i| item.pars[i].value).unwrap_or(1.0);
                let adj = clip((p[1] - g) / (u - g).max(1e-3), 0.01, 0.99);
                set_free(item, "d", D_SCALE * qnorm(adj) / uniq);
            }
            ItemType::Graded | ItemType::Grsm => {
                let mut upper = 1.0;
                let mut prev = f64::INFINITY;
                for k in 1..ncat {
                    upper -= p[k - 1];
                    let mut d = D_SCALE * qnorm(clip(upper, 0.005, 0.995)) / uniq;
                    if d >= prev {
                        d = prev - 0.1;
                    }
                    set_free(item, &format!("d{}", k), d);
                    prev = d;
                }
            }
            ItemType::Rasch | ItemType::Gpcm | ItemType::Nominal => {
                for k in 1..ncat {
                    set_free(item, &format!("d{}", k), (p[k] / p[0]).ln());
                }
            }
            ItemType::Rsm => {
                for k in 1..ncat {
                    set_free(item, &format!("d{}", k), (p[k] / p[k - 1]).ln());
                }
            }
            ItemType::PC2PL | ItemType::PC3PL => {
                let per = clip(p[1], 0.01, 0.99).powf(1.0 / n_loaded);
                for k in 0..item.nfact {
                    if item.loading[k] {
                        set_free(item, &format!("d{}", k + 1), D_SCALE * qnorm(per) / uniq);
                    }
                }
            }
            ItemType::TwoPLNRM | ItemType::ThreePLNRM | ItemType::FourPLNRM => {
                let key = item.key.unwrap_or(ncat - 1);
                set_free(item, "d", D_SCALE * qnorm(clip(p[key], 0.01, 0.99)) / uniq);
                let dist: Vec<f64> = (0..ncat).filter(|&k| k != key).map(|k| p[k]).collect();
                for m in 1..dist.len() {
                    set_free(item, &format!("d{}", m), (dist[m] / dist[0]).ln());
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn easier_items_get_larger_intercepts() {
        let data = array![[1, 1], [1, 0], [1, 1], [0, 0], [1, 0], [1, 1], [0, 0], [1, 0]];
        let mut items: Vec<Item> = (0..2)
            .map(|j| Item::new(format!("i{}", j), ItemType::TwoPL, 2, 1, vec![true], None).unwrap())
            .collect();
        apply_start_values(&mut items, &data);
        let d0 = items[0].pars[items[0].param_index("d").unwrap()].value;
        let d1 = items[1].pars[items[1].param_index("d").unwrap()].value;
        assert!(d0 > d1);
        assert!(items[0].pars[0].value > 0.0);
    }

    #[test]
    fn bivariate_normal_cdf_matches_closed_forms() {
        // independent margins factorise
        assert_abs_diff_eq!(
            bvn_cdf(0.3, -0.7, 0.0),
            pnorm(0.3) * pnorm(-0.7),
            epsilon = 1e-10
        );
        // P(X < 0, Y < 0) = 1/4 + asin(rho) / (2 pi)
        let rho: f64 = 0.6;
        let expected = 0.25 + rho.asin() / (2.0 * PI);
        assert_abs_diff_eq!(bvn_cdf(0.0, 0.0, rho), expected, epsilon = 1e-8);
        assert_abs_diff_eq!(bvn_cdf(f64::INFINITY, 0.5, rho), pnorm(0.5), epsilon = 1e-12);
        assert_eq!(bvn_cdf(f64::NEG_INFINITY, 0.5, rho), 0.0);
    }

    #[test]
    fn tetrachoric_recovers_the_latent_correlation() {
        // cell proportions of two median splits of a bivariate normal with rho = 0.5
        let rho: f64 = 0.5;
        let both_low = 0.25 + rho.asin() / (2.0 * PI);
        let off = 0.5 - both_low;
        let table = array![[both_low, off], [off, both_low]] * 1000.0;
        let tau = vec![f64::NEG_INFINITY, 0.0, f64::INFINITY];
        assert_abs_diff_eq!(polychoric(&table, &tau, &tau), rho, epsilon = 1e-3);
    }

    #[test]
    fn skewed_items_keep_strong_loadings() {
        // a common trait drives three rare-endorsement items
        let data = array![
            [1, 1, 1],
            [1, 1, 0],
            [0, 0, 0],
            [0, 0, 0],
            [0, 0, 0],
            [0, 0, 0],
            [0, 0, 0],
            [1, 0, 1],
            [0, 0, 0],
            [0, 0, 0],
            [0, 1, 1],
            [0, 0, 0]
        ];
        let loadings = item_loadings(&data, &[2, 2, 2]);
        for l in loadings {
            assert!(l > 0.5, "loading {}", l);
        }
    }

    #[test]
    fn graded_intercepts_decrease() {
        let data = array![[0, 0], [1, 1], [2, 2], [2, 1], [1, 0], [0, 1], [2, 2], [1, 1]];
        let mut items: Vec<Item> = (0..2)
            .map(|j| {
                Item::new(format!("i{}", j), ItemType::Graded, 3, 1, vec![true], None).unwrap()
            })
            .collect();
        apply_start_values(&mut items, &data);
        let d1 = items[0].pars[items[0].param_index("d1").unwrap()].value;
        let d2 = items[0].pars[items[0].param_index("d2").unwrap()].value;
        assert!(d1 > d2);
    }
}
