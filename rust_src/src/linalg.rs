//! Dense linear algebra on ndarray values, delegated to nalgebra.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{MirtError, MirtResult};
use crate::utils::LOG_2_PI;

pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (r, c) = a.dim();
    DMatrix::from_fn(r, c, |i, j| a[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

pub fn symmetrize(a: &Array2<f64>) -> Array2<f64> {
    (a + &a.t()) * 0.5
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
pub fn cholesky_lower(a: &Array2<f64>) -> MirtResult<Array2<f64>> {
    to_dmatrix(a)
        .cholesky()
        .map(|c| from_dmatrix(&c.l()))
        .ok_or_else(|| MirtError::Linalg("matrix is not positive definite".into()))
}

pub fn is_positive_definite(a: &Array2<f64>) -> bool {
    a.iter().all(|x| x.is_finite()) && to_dmatrix(a).cholesky().is_some()
}

/// Inverse of a symmetric positive definite matrix via Cholesky.
pub fn inverse_spd(a: &Array2<f64>) -> MirtResult<Array2<f64>> {
    to_dmatrix(a)
        .cholesky()
        .map(|c| from_dmatrix(&c.inverse()))
        .ok_or_else(|| MirtError::Linalg("matrix is not positive definite".into()))
}

/// General inverse via LU.
pub fn inverse(a: &Array2<f64>) -> MirtResult<Array2<f64>> {
    to_dmatrix(a)
        .try_inverse()
        .map(|m| from_dmatrix(&m))
        .ok_or_else(|| MirtError::Linalg("matrix is singular".into()))
}

/// Solve `a x = b`, falling back from Cholesky to LU.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> MirtResult<Array1<f64>> {
    let m = to_dmatrix(a);
    let rhs = DVector::from_iterator(b.len(), b.iter().copied());
    let x = match m.clone().cholesky() {
        Some(c) => Some(c.solve(&rhs)),
        None => m.lu().solve(&rhs),
    };
    x.map(|v| v.iter().copied().collect())
        .ok_or_else(|| MirtError::Linalg("linear system is singular".into()))
}

pub fn symmetric_eigenvalues(a: &Array2<f64>) -> Array1<f64> {
    let eig = to_dmatrix(&symmetrize(a)).symmetric_eigen();
    eig.eigenvalues.iter().copied().collect()
}

/// Largest eigenvalue of a symmetric matrix and its unit eigenvector.
pub fn leading_eigenpair(a: &Array2<f64>) -> (f64, Array1<f64>) {
    let eig = to_dmatrix(&symmetrize(a)).symmetric_eigen();
    let top = eig.eigenvalues.imax();
    let vector = eig.eigenvectors.column(top).iter().copied().collect();
    (eig.eigenvalues[top], vector)
}

/// `a + ridge * I` with the smallest ridge (doubling from `start`) that is positive definite.
pub fn ridge_to_pd(a: &Array2<f64>, start: f64) -> Array2<f64> {
    if is_positive_definite(a) {
        return a.clone();
    }
    let n = a.nrows();
    let mut ridge = start;
    for _ in 0..60 {
        let candidate = a + &(Array2::<f64>::eye(n) * ridge);
        if is_positive_definite(&candidate) {
            return candidate;
        }
        ridge *= 2.0;
    }
    Array2::eye(n)
}

/// Multivariate normal log-density with a cached precision matrix.
#[derive(Debug, Clone)]
pub struct MvnDensity {
    mean: Array1<f64>,
    precision: Array2<f64>,
    log_norm: f64,
}

impl MvnDensity {
    pub fn new(mean: &Array1<f64>, cov: &Array2<f64>) -> MirtResult<Self> {
        let d = mean.len();
        if cov.dim() != (d, d) {
            return Err(MirtError::Input(format!(
                "covariance is {:?} for a mean of length {}",
                cov.dim(),
                d
            )));
        }
        let chol = to_dmatrix(cov)
            .cholesky()
            .ok_or_else(|| MirtError::Linalg("latent covariance is not positive definite".into()))?;
        let log_det: f64 = 2.0 * chol.l().diagonal().iter().map(|x| x.ln()).sum::<f64>();
        let precision = from_dmatrix(&chol.inverse());
        Ok(MvnDensity {
            mean: mean.clone(),
            precision,
            log_norm: -0.5 * (d as f64 * LOG_2_PI + log_det),
        })
    }

    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let diff = &x - &self.mean;
        let quad = diff.dot(&self.precision.dot(&diff));
        self.log_norm - 0.5 * quad
    }

    /// Gradient of the log-density with respect to `x`.
    pub fn grad_log_pdf(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let diff = &x - &self.mean;
        -self.precision.dot(&diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn leading_eigenpair_of_a_diagonal_matrix() {
        let (value, vector) = leading_eigenpair(&array![[1.0, 0.0], [0.0, 3.0]]);
        assert_abs_diff_eq!(value, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vector[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vector[1].abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn inverse_of_spd_matrix() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = inverse_spd(&a).unwrap();
        let id = a.dot(&inv);
        assert_abs_diff_eq!(id[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(id[[0, 1]], 0.0, epsilon = 1e-12);
        assert!(inverse_spd(&array![[1.0, 2.0], [2.0, 1.0]]).is_err());
    }

    #[test]
    fn mvn_density_matches_univariate_formula() {
        let mvn = MvnDensity::new(&array![1.0], &array![[4.0]]).unwrap();
        let x = array![2.0];
        let expected = -0.5 * (LOG_2_PI + 4.0f64.ln()) - 0.5 * 0.25;
        assert_abs_diff_eq!(mvn.log_pdf(x.view()), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(mvn.grad_log_pdf(x.view())[0], -0.25, epsilon = 1e-12);
    }

    #[test]
    fn eigenvalues_and_ridge() {
        let a = array![[2.0, 0.0], [0.0, -1.0]];
        let mut ev = symmetric_eigenvalues(&a).to_vec();
        ev.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_abs_diff_eq!(ev[0], -1.0, epsilon = 1e-12);
        assert!(is_positive_definite(&ridge_to_pd(&a, 1e-6)));
        let x = solve(&array![[2.0, 0.0], [0.0, 4.0]], &array![2.0, 2.0]).unwrap();
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-12);
    }
}
