#![allow(dead_code)]

use mirt_engine::ResponseMatrix;
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Unidimensional 2PL responses with θ ~ N(0, 1).
pub fn simulate_2pl(slopes: &[f64], intercepts: &[f64], n: usize, seed: u64) -> ResponseMatrix {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut data = Array2::<i32>::zeros((n, slopes.len()));
    for i in 0..n {
        let theta: f64 = rng.sample(StandardNormal);
        for j in 0..slopes.len() {
            let p = 1.0 / (1.0 + (-(slopes[j] * theta + intercepts[j])).exp());
            data[[i, j]] = (rng.random::<f64>() < p) as i32;
        }
    }
    ResponseMatrix::new(data).unwrap()
}

/// Graded responses with `ncat` categories and ordered intercepts.
pub fn simulate_graded(
    slopes: &[f64],
    intercepts: &[Vec<f64>],
    n: usize,
    seed: u64,
) -> ResponseMatrix {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut data = Array2::<i32>::zeros((n, slopes.len()));
    for i in 0..n {
        let theta: f64 = rng.sample(StandardNormal);
        for j in 0..slopes.len() {
            let u: f64 = rng.random();
            let mut k = 0;
            for d in &intercepts[j] {
                let p = 1.0 / (1.0 + (-(slopes[j] * theta + d)).exp());
                if u < p {
                    k += 1;
                }
            }
            data[[i, j]] = k;
        }
    }
    ResponseMatrix::new(data).unwrap()
}
