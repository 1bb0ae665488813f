//! Divide-by-total family: nominal, generalized partial credit and rating scale.

use ndarray::{Array2, ArrayView1};

pub(crate) fn softmax(z: &[f64]) -> Vec<f64> {
    let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let e: Vec<f64> = z.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = e.iter().sum();
    e.iter().map(|v| v / total).collect()
}

/// `dP_k = P_k (dz_k - sum_m P_m dz_m)` for every parameter column of `dz`.
pub(crate) fn softmax_dprob(p: &[f64], dz: &Array2<f64>) -> Array2<f64> {
    let (ncat, npars) = dz.dim();
    let mut out = Array2::zeros((ncat, npars));
    for c in 0..npars {
        let mean: f64 = (0..ncat).map(|m| p[m] * dz[[m, c]]).sum();
        for k in 0..ncat {
            out[[k, c]] = p[k] * (dz[[k, c]] - mean);
        }
    }
    out
}

fn slope_sum(pars: &[f64], nfact: usize, theta: ArrayView1<f64>) -> f64 {
    (0..nfact).map(|k| pars[k] * theta[k]).sum()
}

fn logits(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Vec<f64> {
    let s = slope_sum(pars, nfact, theta);
    (0..ncat)
        .map(|k| pars[nfact + k] * s + pars[nfact + ncat + k])
        .collect()
}

pub fn probs(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Vec<f64> {
    softmax(&logits(pars, nfact, ncat, theta))
}

pub fn dprob(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Array2<f64> {
    let npars = nfact + 2 * ncat;
    let s = slope_sum(pars, nfact, theta);
    let p = probs(pars, nfact, ncat, theta);
    let mut dz = Array2::zeros((ncat, npars));
    for k in 0..ncat {
        let ak = pars[nfact + k];
        for f in 0..nfact {
            dz[[k, f]] = ak * theta[f];
        }
        dz[[k, nfact + k]] = s;
        dz[[k, nfact + ncat + k]] = 1.0;
    }
    softmax_dprob(&p, &dz)
}

fn rsm_logits(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Vec<f64> {
    let s = slope_sum(pars, nfact, theta);
    let c = pars[nfact + ncat - 1];
    let mut z = vec![0.0; ncat];
    let mut cum = 0.0;
    for k in 1..ncat {
        cum += pars[nfact + k - 1];
        z[k] = k as f64 * (s + c) + cum;
    }
    z
}

pub fn rsm_probs(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Vec<f64> {
    softmax(&rsm_logits(pars, nfact, ncat, theta))
}

pub fn rsm_dprob(pars: &[f64], nfact: usize, ncat: usize, theta: ArrayView1<f64>) -> Array2<f64> {
    let npars = nfact + ncat;
    let p = rsm_probs(pars, nfact, ncat, theta);
    let mut dz = Array2::zeros((ncat, npars));
    for k in 1..ncat {
        let kf = k as f64;
        for f in 0..nfact {
            dz[[k, f]] = kf * theta[f];
        }
        for m in 1..=k {
            dz[[k, nfact + m - 1]] = 1.0;
        }
        dz[[k, npars - 1]] = kf;
    }
    softmax_dprob(&p, &dz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn gpcm_with_two_categories_is_logistic() {
        // a = 1.3, ak = (0, 1), d = (0, -0.4)
        let pars = [1.3, 0.0, 1.0, 0.0, -0.4];
        let p = probs(&pars, 1, 2, array![0.5].view());
        let expected = crate::utils::sigmoid(1.3 * 0.5 - 0.4);
        assert_abs_diff_eq!(p[1], expected, epsilon = 1e-12);
    }

    #[test]
    fn rating_scale_sums_to_one() {
        let pars = [1.0, 0.5, 0.0, -0.5, 0.2];
        let p = rsm_probs(&pars, 1, 4, array![-0.7].view());
        assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
}
