//! Partially compensatory items: a correct response needs every loaded component.

use ndarray::ArrayView1;

use crate::utils::sigmoid;

pub fn probs(pars: &[f64], nfact: usize, loading: &[bool], theta: ArrayView1<f64>) -> Vec<f64> {
    let g = pars[2 * nfact];
    let u = pars[2 * nfact + 1];
    let mut prod = 1.0;
    for k in 0..nfact {
        if loading[k] {
            prod *= sigmoid(pars[k] * theta[k] + pars[nfact + k]);
        }
    }
    let p1 = g + (u - g) * prod;
    vec![1.0 - p1, p1]
}
