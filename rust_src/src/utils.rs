//! Shared numeric helpers.

use finitediff::FiniteDiff;
use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal};

pub const LOG_2_PI: f64 = 1.8378770664093453;

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

#[inline]
pub fn clip(x: f64, min: f64, max: f64) -> f64 {
    x.max(min).min(max)
}

/// Log of quadrature weights with a floor so empty nodes stay finite
pub fn compute_log_weights(weights: &[f64]) -> Vec<f64> {
    weights.iter().map(|&w| (w + 1e-300).ln()).collect()
}

/// Standard normal quantile
pub fn qnorm(p: f64) -> f64 {
    let p = clip(p, 1e-12, 1.0 - 1e-12);
    match Normal::new(0.0, 1.0) {
        Ok(n) => n.inverse_cdf(p),
        Err(_) => 0.0,
    }
}

/// Standard normal distribution function
pub fn pnorm(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(n) => n.cdf(x),
        Err(_) => 0.5,
    }
}

/// Central-difference gradient of a scalar function.
pub fn num_gradient<F>(f: F, x: &Array1<f64>) -> Array1<f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let cost = |v: &Vec<f64>| f(&Array1::from(v.clone()));
    Array1::from(x.to_vec().central_diff(&cost))
}

/// Central-difference Jacobian of a vector function, returned as (outputs × inputs).
pub fn num_jacobian<F>(f: F, x: &Array1<f64>) -> Array2<f64>
where
    F: Fn(&Array1<f64>) -> Array1<f64>,
{
    let fs = |v: &Vec<f64>| f(&Array1::from(v.clone())).to_vec();
    // one row per input coordinate
    let rows = x.to_vec().central_jacobian(&fs);
    let m = rows.first().map(|r| r.len()).unwrap_or(0);
    Array2::from_shape_fn((m, x.len()), |(k, i)| rows[i][k])
}

/// Symmetric central-difference Hessian from a gradient function.
pub fn num_hessian<F>(grad: F, x: &Array1<f64>) -> Array2<f64>
where
    F: Fn(&Array1<f64>) -> Array1<f64>,
{
    let g = |v: &Vec<f64>| grad(&Array1::from(v.clone())).to_vec();
    let rows = x.to_vec().central_hessian(&g);
    let n = x.len();
    Array2::from_shape_fn((n, n), |(i, j)| 0.5 * (rows[i][j] + rows[j][i]))
}

pub fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
