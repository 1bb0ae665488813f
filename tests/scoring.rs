mod common;

use approx::assert_abs_diff_eq;
use mirt_engine::{
    mirt, ConvergedModel, FitOptions, ItemType, ModelSpec, OutputMode, Runtime, ScoreFlag,
    ScoreMethod, ScoreOptions, SeType, WorkerPool,
};
use ndarray::array;

fn fitted(se: bool) -> ConvergedModel {
    let intercepts = [0.5, -0.3, 0.0, 1.0, -0.8];
    let data = common::simulate_2pl(&[1.0, 1.4, 0.8, 1.2, 1.6], &intercepts, 1000, 21);
    let mut opts = FitOptions {
        calc_null: false,
        ..FitOptions::em()
    };
    if se {
        opts = opts.with_se(SeType::Crossprod);
    }
    mirt(
        &data,
        &ModelSpec::exploratory(1, ItemType::TwoPL),
        &opts,
        &Runtime::new(WorkerPool::global()),
    )
    .unwrap()
}

#[test]
fn eap_orders_extreme_patterns() {
    let fit = fitted(false);
    let opts = ScoreOptions::new(ScoreMethod::Eap)
        .with_patterns(array![[1, 1, 1, 1, 1], [0, 0, 0, 0, 0]]);
    let scores = fit.fscores(&opts).unwrap();
    let hi = scores.scores[[0, 0]];
    let lo = scores.scores[[1, 0]];
    assert!(hi.is_finite() && lo.is_finite());
    assert!(hi > lo);
}

#[test]
fn ml_flags_extreme_patterns_and_wle_stays_finite() {
    let fit = fitted(false);
    let patterns = array![[1, 1, 1, 1, 1], [0, 1, 0, 1, 1]];
    let ml = fit
        .fscores(&ScoreOptions::new(ScoreMethod::Ml).with_patterns(patterns.clone()))
        .unwrap();
    assert_eq!(ml.flags[0], Some(ScoreFlag::ExtremePattern));
    assert_eq!(ml.scores[[0, 0]], f64::INFINITY);
    assert!(ml.scores[[1, 0]].is_finite());
    let wle = fit
        .fscores(&ScoreOptions::new(ScoreMethod::Wle).with_patterns(patterns))
        .unwrap();
    assert!(wle.scores[[0, 0]].is_finite());
}

#[test]
fn wle_equals_ml_when_information_is_symmetric() {
    let fit = fitted(false);
    let mut table = fit.parameter_table();
    for (j, d) in [-1.0, -0.5, 0.0, 0.5, 1.0].iter().enumerate() {
        table.set_value(0, Some(j), "a1", 1.0).unwrap();
        table.set_value(0, Some(j), "d", *d).unwrap();
    }
    let edited = fit.with_parameter_table(&table).unwrap();
    // a 2-of-5 pattern mirrored against a 3-of-5 pattern
    let patterns = array![[1, 1, 0, 0, 0], [0, 0, 1, 1, 1]];
    let ml = edited
        .fscores(&ScoreOptions::new(ScoreMethod::Ml).with_patterns(patterns.clone()))
        .unwrap();
    let wle = edited
        .fscores(&ScoreOptions::new(ScoreMethod::Wle).with_patterns(patterns))
        .unwrap();
    assert_abs_diff_eq!(ml.scores[[0, 0]], -ml.scores[[1, 0]], epsilon = 1e-4);
    assert_abs_diff_eq!(wle.scores[[0, 0]], -wle.scores[[1, 0]], epsilon = 1e-4);
    assert!(wle.scores[[0, 0]].abs() < ml.scores[[0, 0]].abs());
}

#[test]
fn eapsum_table_is_monotone() {
    let fit = fitted(false);
    let scores = fit.fscores(&ScoreOptions::new(ScoreMethod::EapSum)).unwrap();
    let tables = scores.sum_scores.unwrap();
    assert_eq!(tables.len(), 1);
    let t = &tables[0];
    assert_eq!(t.eap.len(), 6);
    assert!(t.eap.windows(2).all(|w| w[1] > w[0]));
    assert_abs_diff_eq!(t.observed.iter().sum::<f64>(), 1000.0, epsilon = 1e-9);
    assert_abs_diff_eq!(t.expected.iter().sum::<f64>(), 1000.0, epsilon = 1e-6);
}

#[test]
fn multiple_imputation_inflates_standard_errors() {
    let fit = fitted(true);
    let plain = fit.fscores(&ScoreOptions::new(ScoreMethod::Eap)).unwrap();
    let mi = fit
        .fscores(&ScoreOptions {
            mi_draws: Some(30),
            ..ScoreOptions::new(ScoreMethod::Eap)
        })
        .unwrap();
    let mean = |a: &ndarray::Array2<f64>| a.mean().unwrap();
    assert!(mean(mi.se.as_ref().unwrap()) > mean(plain.se.as_ref().unwrap()));
}

#[test]
fn reliability_and_full_output() {
    let fit = fitted(false);
    let opts = ScoreOptions {
        reliability: true,
        ..ScoreOptions::new(ScoreMethod::Eap).with_output(OutputMode::Full)
    };
    let scores = fit.fscores(&opts).unwrap();
    assert_eq!(scores.scores.nrows(), 1000);
    let rel = scores.reliability.unwrap()[0];
    assert!(rel > 0.0 && rel < 1.0);
}

#[test]
fn parameter_table_round_trip_reproduces_traces() {
    let fit = fitted(false);
    let mut table = fit.parameter_table();
    table.set_value(0, Some(2), "a1", 2.0).unwrap();
    table.set_value(0, Some(2), "d", -0.75).unwrap();
    let json = serde_json::to_string(&table).unwrap();
    let restored: mirt_engine::ParameterTable = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, table);

    let edited = fit.with_parameter_table(&restored).unwrap();
    let item = &edited.model.groups[0].items[2];
    let theta = array![[-1.0], [0.0], [1.5]];
    let trace = item.probtrace(&theta);
    for (q, t) in theta.column(0).iter().enumerate() {
        let p = 1.0 / (1.0 + (-(2.0 * t - 0.75)).exp());
        assert_abs_diff_eq!(trace[[q, 1]], p, epsilon = 1e-12);
    }
    assert!(edited.loglik < fit.loglik);
}
