//! Nested logit models (2PLNRM, 3PLNRM, 4PLNRM).
//!
//! The keyed category follows the dichotomous curve; the remaining probability is
//! shared among the distractors by a nominal model with its own slope multipliers.

use ndarray::ArrayView1;

use super::{dichotomous, nominal};

pub fn probs(
    pars: &[f64],
    nfact: usize,
    ncat: usize,
    key: usize,
    theta: ArrayView1<f64>,
) -> Vec<f64> {
    let p_key = dichotomous::p_correct(pars, nfact, theta);
    let ndist = ncat - 1;
    let base = nfact + 3;
    let s: f64 = (0..nfact).map(|k| pars[k] * theta[k]).sum();
    let z: Vec<f64> = (0..ndist)
        .map(|m| pars[base + m] * s + pars[base + ndist + m])
        .collect();
    let share = nominal::softmax(&z);

    let mut out = vec![0.0; ncat];
    let mut m = 0;
    for (k, slot) in out.iter_mut().enumerate() {
        if k == key {
            *slot = p_key;
        } else {
            *slot = (1.0 - p_key) * share[m];
            m += 1;
        }
    }
    out
}
