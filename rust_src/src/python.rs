//! Python bindings.

use numpy::{PyArray1, PyArray2, PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::FitOptions;
use crate::data::ResponseMatrix;
use crate::error::MirtError;
use crate::fit::{mirt, ConvergedModel};
use crate::items::ItemType;
use crate::model::ModelSpec;
use crate::parallel::{Runtime, WorkerPool};
use crate::scoring::{ScoreMethod, ScoreOptions};

fn to_py(err: MirtError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn fit_from_python(
    responses: PyReadonlyArray2<i32>,
    nfact: usize,
    itemtype: &str,
    options: Option<&str>,
) -> PyResult<ConvergedModel> {
    let data = ResponseMatrix::new(responses.as_array().to_owned()).map_err(to_py)?;
    let itemtype: ItemType = itemtype.parse().map_err(to_py)?;
    let opts = match options {
        Some(s) => FitOptions::from_toml_str(s).map_err(to_py)?,
        None => FitOptions::default(),
    };
    let runtime = Runtime::new(WorkerPool::global());
    mirt(&data, &ModelSpec::exploratory(nfact, itemtype), &opts, &runtime).map_err(to_py)
}

/// Fit an exploratory model; options are a TOML document.
///
/// Returns parameter names, reported values, standard errors (NaN when not computed),
/// the log-likelihood, and the convergence flag.
#[pyfunction]
#[pyo3(signature = (responses, nfact, itemtype, options=None))]
#[allow(clippy::type_complexity)]
pub fn fit_mirt<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    nfact: usize,
    itemtype: &str,
    options: Option<&str>,
) -> PyResult<(Vec<String>, Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<f64>>, f64, bool)> {
    let fit = fit_from_python(responses, nfact, itemtype, options)?;
    let coefs = fit.coef(0.95).map_err(to_py)?;
    let names = coefs
        .iter()
        .map(|c| format!("{}.{}", c.item_name, c.name))
        .collect();
    let values: ndarray::Array1<f64> = coefs.iter().map(|c| c.value).collect();
    let se: ndarray::Array1<f64> = coefs.iter().map(|c| c.se.unwrap_or(f64::NAN)).collect();
    Ok((names, values.to_pyarray(py), se.to_pyarray(py), fit.loglik, fit.converged))
}

/// Fit, then score the fitted respondents; returns per-respondent scores and SEs.
#[pyfunction]
#[pyo3(signature = (responses, nfact, itemtype, method="EAP", options=None))]
pub fn fit_and_score<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    nfact: usize,
    itemtype: &str,
    method: &str,
    options: Option<&str>,
) -> PyResult<(Bound<'py, PyArray2<f64>>, Bound<'py, PyArray2<f64>>)> {
    let method = match method {
        "EAP" => ScoreMethod::Eap,
        "MAP" => ScoreMethod::Map,
        "ML" => ScoreMethod::Ml,
        "WLE" => ScoreMethod::Wle,
        "EAPsum" => ScoreMethod::EapSum,
        other => return Err(PyValueError::new_err(format!("unknown scoring method '{}'", other))),
    };
    let fit = fit_from_python(responses, nfact, itemtype, options)?;
    let scores = fit
        .fscores(&ScoreOptions::new(method).with_output(crate::scoring::OutputMode::Full))
        .map_err(to_py)?;
    let se = scores
        .se
        .unwrap_or_else(|| ndarray::Array2::from_elem(scores.scores.dim(), f64::NAN));
    Ok((scores.scores.to_pyarray(py), se.to_pyarray(py)))
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(fit_mirt, m)?)?;
    m.add_function(wrap_pyfunction!(fit_and_score, m)?)?;
    Ok(())
}
