mod common;

use approx::assert_abs_diff_eq;
use mirt_engine::{
    mirt, FitOptions, Invariance, ItemType, MirtError, ModelSpec, ParRef, Prior, ResponseMatrix,
    Runtime, WorkerPool,
};
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

fn runtime() -> Runtime {
    Runtime::new(WorkerPool::global())
}

fn quiet() -> FitOptions {
    FitOptions {
        calc_null: false,
        ..FitOptions::em()
    }
}

/// Two groups answering the same 2PL items; the second group's trait mean is shifted.
fn two_groups(shift: f64, n_per_group: usize) -> ResponseMatrix {
    let slopes = [1.0, 1.3, 0.8, 1.5, 1.1, 0.9];
    let intercepts = [0.5, 0.0, -0.5, 0.8, -1.0, 0.2];
    let mut rng = Pcg64::seed_from_u64(99);
    let n = 2 * n_per_group;
    let mut data = Array2::<i32>::zeros((n, slopes.len()));
    let mut groups = Vec::with_capacity(n);
    for i in 0..n {
        let g = i / n_per_group;
        let z: f64 = rng.sample(StandardNormal);
        let theta = z + if g == 1 { shift } else { 0.0 };
        for j in 0..slopes.len() {
            let p = 1.0 / (1.0 + (-(slopes[j] * theta + intercepts[j])).exp());
            data[[i, j]] = (rng.random::<f64>() < p) as i32;
        }
        groups.push(g);
    }
    ResponseMatrix::with_groups(data, groups).unwrap()
}

#[test]
fn invariant_items_recover_the_group_mean_difference() {
    common::init_logging();
    let data = two_groups(0.6, 2500);
    let spec = ModelSpec::exploratory(1, ItemType::TwoPL).with_invariance(Invariance {
        slopes: true,
        intercepts: true,
        free_means: true,
        free_var: true,
    });
    let fit = mirt(&data, &spec, &quiet(), &runtime()).unwrap();
    assert!(fit.converged);
    let table = fit.parameter_table();
    assert_abs_diff_eq!(table.get(0, None, "MEAN_1").unwrap().value, 0.0);
    assert!(!table.get(0, None, "MEAN_1").unwrap().free);
    assert_abs_diff_eq!(table.get(1, None, "MEAN_1").unwrap().value, 0.6, epsilon = 0.2);
    for j in 0..6 {
        let a0 = table.get(0, Some(j), "a1").unwrap().value;
        let a1 = table.get(1, Some(j), "a1").unwrap().value;
        assert_abs_diff_eq!(a0, a1, epsilon = 1e-10);
    }
}

#[test]
fn fixed_constrained_and_prior_parameters_are_honoured() {
    let intercepts = [0.0, 0.5, -0.5, 0.3, -0.2];
    let data = common::simulate_2pl(&[1.0, 1.0, 1.0, 1.5, 0.7], &intercepts, 1500, 11);
    let spec = ModelSpec::exploratory(1, ItemType::TwoPL)
        .with_item_names((1..=5).map(|j| format!("Q{}", j)).collect())
        .constrain(vec![ParRef::item(0, "a1"), ParRef::item(1, "a1"), ParRef::item(2, "a1")])
        .fix(ParRef::item(4, "d"), -0.2)
        .prior(ParRef::item(3, "a1"), Prior::LogNormal { meanlog: 0.0, sdlog: 0.5 })
        .bound(ParRef::item(3, "d"), -1.0, 1.0)
        .start(ParRef::item(3, "d"), 0.1);
    let fit = mirt(&data, &spec, &quiet(), &runtime()).unwrap();
    let table = fit.parameter_table();

    let a: Vec<f64> = (0..3).map(|j| table.get(0, Some(j), "a1").unwrap().value).collect();
    assert_abs_diff_eq!(a[0], a[1], epsilon = 1e-10);
    assert_abs_diff_eq!(a[0], a[2], epsilon = 1e-10);
    let shared = table.get(0, Some(0), "a1").unwrap().constraint;
    assert!(shared.is_some());
    assert_eq!(table.get(0, Some(2), "a1").unwrap().constraint, shared);

    let fixed = table.get(0, Some(4), "d").unwrap();
    assert!(!fixed.free);
    assert_abs_diff_eq!(fixed.value, -0.2);
    assert_eq!(fixed.item_name, "Q5");

    let bounded = table.get(0, Some(3), "d").unwrap().value;
    assert!((-1.0..=1.0).contains(&bounded));
}

#[test]
fn confirmatory_pattern_leaves_unloaded_slopes_at_zero() {
    let slopes = [1.2, 1.0, 1.4, 0.9, 1.1, 1.3];
    let data = common::simulate_2pl(&slopes, &[0.0; 6], 1000, 5);
    let loadings = Array2::from_shape_fn((6, 2), |(j, k)| (j < 3) == (k == 0));
    let opts = FitOptions {
        quadpts: Some(15),
        ..quiet()
    };
    let spec = ModelSpec::confirmatory(loadings, ItemType::TwoPL);
    let fit = mirt(&data, &spec, &opts, &runtime()).unwrap();
    let table = fit.parameter_table();
    for j in 0..6 {
        let off = if j < 3 { "a2" } else { "a1" };
        let row = table.get(0, Some(j), off).unwrap();
        assert!(!row.free);
        assert_abs_diff_eq!(row.value, 0.0);
    }
}

#[test]
fn malformed_specifications_are_input_errors() {
    let data = common::simulate_2pl(&[1.0, 1.0, 1.0], &[0.0, 0.0, 0.0], 200, 3);
    let wrong_types = ModelSpec::exploratory(1, ItemType::TwoPL)
        .with_itemtypes(vec![ItemType::TwoPL, ItemType::Rasch]);
    assert!(matches!(mirt(&data, &wrong_types, &quiet(), &runtime()), Err(MirtError::Input(_))));

    let bad_bound =
        ModelSpec::exploratory(1, ItemType::TwoPL).bound(ParRef::item(0, "d"), 1.0, -1.0);
    assert!(matches!(mirt(&data, &bad_bound, &quiet(), &runtime()), Err(MirtError::Input(_))));

    let bad_group = ModelSpec::exploratory(1, ItemType::TwoPL)
        .free_par(ParRef::latent("MEAN_1").in_group(3));
    assert!(matches!(mirt(&data, &bad_group, &quiet(), &runtime()), Err(MirtError::Input(_))));

    let bad_key = ModelSpec::exploratory(1, ItemType::TwoPLNRM)
        .with_keys(vec![Some(7), Some(1), Some(1)]);
    assert!(matches!(mirt(&data, &bad_key, &quiet(), &runtime()), Err(MirtError::Input(_))));
}
