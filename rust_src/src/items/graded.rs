//! Samejima's graded response model and its rating-scale variant (grsm).
//!
//! Graded: `a1..aD, d1..d(K-1)`. grsm appends a location shift `c` that is added to
//! every intercept, so items sharing the `d`s differ only by `c`.

use ndarray::{Array2, ArrayView1};

use crate::utils::sigmoid;

/// Cumulative probabilities `P*(0) = 1, P*(1..K-1), P*(K) = 0`.
fn cumulative(
    pars: &[f64],
    nfact: usize,
    ncat: usize,
    rating: bool,
    theta: ArrayView1<f64>,
) -> Vec<f64> {
    let mut s = 0.0;
    for k in 0..nfact {
        s += pars[k] * theta[k];
    }
    if rating {
        s += pars[nfact + ncat - 1];
    }
    let mut pstar = vec![0.0; ncat + 1];
    pstar[0] = 1.0;
    for k in 1..ncat {
        pstar[k] = sigmoid(s + pars[nfact + k - 1]);
    }
    pstar
}

pub fn probs(
    pars: &[f64],
    nfact: usize,
    ncat: usize,
    rating: bool,
    theta: ArrayView1<f64>,
) -> Vec<f64> {
    let pstar = cumulative(pars, nfact, ncat, rating, theta);
    (0..ncat).map(|k| pstar[k] - pstar[k + 1]).collect()
}

/// K×P derivative of the category probabilities.
pub fn dprob(
    pars: &[f64],
    nfact: usize,
    ncat: usize,
    rating: bool,
    theta: ArrayView1<f64>,
) -> Array2<f64> {
    let npars = nfact + ncat - 1 + usize::from(rating);
    let pstar = cumulative(pars, nfact, ncat, rating, theta);

    // derivative of each interior P*(k) with respect to every parameter
    let mut dstar = Array2::zeros((ncat + 1, npars));
    for k in 1..ncat {
        let w = pstar[k] * (1.0 - pstar[k]);
        for f in 0..nfact {
            dstar[[k, f]] = w * theta[f];
        }
        dstar[[k, nfact + k - 1]] = w;
        if rating {
            dstar[[k, npars - 1]] = w;
        }
    }

    let mut out = Array2::zeros((ncat, npars));
    for k in 0..ncat {
        for p in 0..npars {
            out[[k, p]] = dstar[[k, p]] - dstar[[k + 1, p]];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn probabilities_sum_to_one() {
        let pars = [1.2, 2.0, 0.5, -1.0];
        for &t in &[-3.0, 0.0, 2.5] {
            let p = probs(&pars, 1, 4, false, array![t].view());
            assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn shift_moves_every_threshold() {
        let base = [1.0, 1.0, -1.0, 0.0];
        let shifted = [1.0, 1.0, -1.0, 0.7];
        let p0 = probs(&base, 1, 3, true, array![0.2].view());
        let p1 = probs(&shifted, 1, 3, true, array![0.9].view());
        // only theta + c matters with a unit slope
        let p2 = probs(&base, 1, 3, true, array![1.6].view());
        for k in 0..3 {
            assert_abs_diff_eq!(p1[k], p2[k], epsilon = 1e-12);
        }
        assert!(p0[0] > p1[0]);
    }
}
