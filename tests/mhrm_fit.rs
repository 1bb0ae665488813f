mod common;

use approx::assert_abs_diff_eq;
use mirt_engine::{mirt, FitOptions, ItemType, ModelSpec, Runtime, SeType, Technical, WorkerPool};

#[test]
fn mhrm_recovers_a_2pl_loosely() {
    common::init_logging();
    let slopes = [1.0, 1.5, 0.8, 1.2, 1.8];
    let intercepts = [0.0, -0.5, 0.5, 1.0, -1.0];
    let data = common::simulate_2pl(&slopes, &intercepts, 2000, 99);
    let opts = FitOptions {
        calc_null: false,
        technical: Technical {
            seed: 2024,
            ..Technical::default()
        },
        ..FitOptions::mhrm().with_se(SeType::Mhrm)
    };
    let fit = mirt(
        &data,
        &ModelSpec::exploratory(1, ItemType::TwoPL),
        &opts,
        &Runtime::new(WorkerPool::global()),
    )
    .unwrap();
    assert!(fit.loglik.is_finite());
    let table = fit.parameter_table();
    for j in 0..slopes.len() {
        assert_abs_diff_eq!(table.get(0, Some(j), "a1").unwrap().value, slopes[j], epsilon = 0.4);
        let d = table.get(0, Some(j), "d").unwrap().value;
        assert_abs_diff_eq!(d, intercepts[j], epsilon = 0.3);
    }
    let info = fit.information().unwrap();
    assert_eq!(info.matrix.nrows(), fit.model.npars());
}

#[test]
fn mhrm_and_em_agree_on_the_likelihood() {
    let data = common::simulate_2pl(&[1.2, 0.9, 1.4, 1.0], &[0.3, -0.2, 0.0, 0.8], 1000, 5);
    let spec = ModelSpec::exploratory(1, ItemType::TwoPL);
    let rt = Runtime::new(WorkerPool::global());
    let em = mirt(
        &data,
        &spec,
        &FitOptions {
            calc_null: false,
            ..FitOptions::em()
        },
        &rt,
    )
    .unwrap();
    let mh = mirt(
        &data,
        &spec,
        &FitOptions {
            calc_null: false,
            ..FitOptions::mhrm()
        },
        &rt,
    )
    .unwrap();
    // EM is the maximiser on the same grid, MH-RM lands close to it
    assert!(mh.loglik <= em.loglik + 0.5);
    assert!(em.loglik - mh.loglik < 5.0);
}
