//! Two-category logistic family: Rasch, 2PL, 3PL, 3PLu and 4PL.
//!
//! Parameters are `a1..aD, d, g, u` with `P(1) = g + (u - g) * sigmoid(a.theta + d)`.

use ndarray::{Array2, ArrayView1};

use crate::utils::sigmoid;

#[inline]
pub fn linear_predictor(pars: &[f64], nfact: usize, theta: ArrayView1<f64>) -> f64 {
    let mut z = pars[nfact];
    for k in 0..nfact {
        z += pars[k] * theta[k];
    }
    z
}

/// Probability of the keyed (upper) category.
#[inline]
pub fn p_correct(pars: &[f64], nfact: usize, theta: ArrayView1<f64>) -> f64 {
    let g = pars[nfact + 1];
    let u = pars[nfact + 2];
    g + (u - g) * sigmoid(linear_predictor(pars, nfact, theta))
}

pub fn probs(pars: &[f64], nfact: usize, theta: ArrayView1<f64>) -> Vec<f64> {
    let p1 = p_correct(pars, nfact, theta);
    vec![1.0 - p1, p1]
}

/// 2×P derivative of both category probabilities with respect to each parameter.
pub fn dprob(pars: &[f64], nfact: usize, theta: ArrayView1<f64>) -> Array2<f64> {
    let npars = nfact + 3;
    let g = pars[nfact + 1];
    let u = pars[nfact + 2];
    let s = sigmoid(linear_predictor(pars, nfact, theta));
    let ds = (u - g) * s * (1.0 - s);

    let mut out = Array2::zeros((2, npars));
    for k in 0..nfact {
        out[[1, k]] = ds * theta[k];
    }
    out[[1, nfact]] = ds;
    out[[1, nfact + 1]] = 1.0 - s;
    out[[1, nfact + 2]] = s;
    for p in 0..npars {
        out[[0, p]] = -out[[1, p]];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn asymptotes_bound_the_curve() {
        let pars = [1.5, 0.0, 0.2, 0.9];
        let lo = p_correct(&pars, 1, array![-30.0].view());
        let hi = p_correct(&pars, 1, array![30.0].view());
        assert_abs_diff_eq!(lo, 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(hi, 0.9, epsilon = 1e-9);
    }

    #[test]
    fn derivative_columns_cancel_across_categories() {
        let pars = [0.8, -0.4, 0.5, 0.1, 0.95];
        let d = dprob(&pars, 2, array![0.3, -1.0].view());
        for p in 0..5 {
            assert_abs_diff_eq!(d[[0, p]] + d[[1, p]], 0.0, epsilon = 1e-15);
        }
    }
}
