//! Discretised latent-trait space.

use ndarray::{Array1, Array2};

use crate::config::PriorDensity;
use crate::error::{MirtError, MirtResult};
use crate::linalg;

/// Q×D nodes with normalised standard-normal (or custom) prior weights.
#[derive(Debug, Clone)]
pub struct QuadratureGrid {
    pub theta: Array2<f64>,
    pub prior: Array1<f64>,
}

impl QuadratureGrid {
    /// Default points per dimension; fewer as dimensionality grows.
    pub fn default_points(nfact: usize) -> usize {
        match nfact {
            0 | 1 => 41,
            2 => 21,
            3 => 11,
            4 => 7,
            5 => 5,
            _ => 3,
        }
    }

    /// Cartesian grid of `quadpts` evenly spaced points per dimension over `range`.
    pub fn build(
        nfact: usize,
        quadpts: Option<usize>,
        range: (f64, f64),
        max_quad: usize,
    ) -> MirtResult<Self> {
        if nfact == 0 {
            return Err(MirtError::Configuration(
                "at least one latent dimension is required".into(),
            ));
        }
        let npts = quadpts.unwrap_or_else(|| Self::default_points(nfact));
        if npts < 3 || npts % 2 == 0 {
            return Err(MirtError::Configuration(format!(
                "quadpts must be odd and at least 3, got {}",
                npts
            )));
        }
        let nodes = npts
            .checked_pow(nfact as u32)
            .filter(|&n| n <= max_quad)
            .ok_or(MirtError::QuadratureTooLarge {
                nodes: (npts as f64).powi(nfact as i32).min(usize::MAX as f64) as usize,
                max: max_quad,
            })?;

        let (lo, hi) = range;
        let step = (hi - lo) / (npts - 1) as f64;
        let points: Vec<f64> = (0..npts).map(|i| lo + i as f64 * step).collect();

        let mut theta = Array2::zeros((nodes, nfact));
        for q in 0..nodes {
            let mut rem = q;
            // last dimension varies fastest
            for d in (0..nfact).rev() {
                theta[[q, d]] = points[rem % npts];
                rem /= npts;
            }
        }
        let mut grid = QuadratureGrid {
            prior: Array1::zeros(nodes),
            theta,
        };
        grid.prior = grid.mvn_weights(&Array1::zeros(nfact), &Array2::eye(nfact))?;
        Ok(grid)
    }

    /// Custom grid injection; weights start as standard normal.
    pub fn from_nodes(theta: Array2<f64>, max_quad: usize) -> MirtResult<Self> {
        if theta.nrows() == 0 || theta.ncols() == 0 {
            return Err(MirtError::Input("custom grid is empty".into()));
        }
        if theta.nrows() > max_quad {
            return Err(MirtError::QuadratureTooLarge {
                nodes: theta.nrows(),
                max: max_quad,
            });
        }
        if theta.iter().any(|x| !x.is_finite()) {
            return Err(MirtError::Input("custom grid contains non-finite nodes".into()));
        }
        let nfact = theta.ncols();
        let mut grid = QuadratureGrid {
            prior: Array1::zeros(theta.nrows()),
            theta,
        };
        grid.prior = grid.mvn_weights(&Array1::zeros(nfact), &Array2::eye(nfact))?;
        Ok(grid)
    }

    pub fn n_nodes(&self) -> usize {
        self.theta.nrows()
    }

    /// Multivariate normal density at each node, normalised to sum to one.
    pub fn mvn_weights(&self, mean: &Array1<f64>, cov: &Array2<f64>) -> MirtResult<Array1<f64>> {
        Ok(log_mvn_weights(&self.theta, mean, cov)?.mapv(f64::exp))
    }

    /// Custom unnormalised density evaluated at each node and normalised.
    pub fn density_weights(&self, density: &PriorDensity) -> MirtResult<Array1<f64>> {
        let raw: Vec<f64> = self
            .theta
            .rows()
            .into_iter()
            .map(|t| density.eval(&t.to_vec()))
            .collect();
        if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MirtError::Input("custom prior density returned an invalid value".into()));
        }
        let total: f64 = raw.iter().sum();
        if !(total > 0.0) {
            return Err(MirtError::Input(
                "custom prior density integrates to zero on the grid".into(),
            ));
        }
        Ok(raw.iter().map(|w| w / total).collect())
    }
}

/// Log of normalised multivariate normal weights at arbitrary nodes.
pub fn log_mvn_weights(
    theta: &Array2<f64>,
    mean: &Array1<f64>,
    cov: &Array2<f64>,
) -> MirtResult<Array1<f64>> {
    let mvn = linalg::MvnDensity::new(mean, cov)?;
    let log_dens: Vec<f64> = theta.rows().into_iter().map(|t| mvn.log_pdf(t)).collect();
    let lse = crate::utils::logsumexp(&log_dens);
    if !lse.is_finite() {
        return Err(MirtError::Input("prior density vanishes on the whole grid".into()));
    }
    Ok(log_dens.iter().map(|&l| l - lse).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn weights_sum_to_one_for_every_dimension() {
        for nfact in 1..=4 {
            for &pts in &[3usize, 5, 7] {
                let grid = QuadratureGrid::build(nfact, Some(pts), (-4.0, 4.0), 20000).unwrap();
                assert_eq!(grid.n_nodes(), pts.pow(nfact as u32));
                assert_abs_diff_eq!(grid.prior.sum(), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn default_points_shrink_with_dimension() {
        let pts: Vec<usize> = (1..=7).map(QuadratureGrid::default_points).collect();
        assert_eq!(pts, vec![41, 21, 11, 7, 5, 3, 3]);
        let grid = QuadratureGrid::build(1, None, (-4.0, 4.0), 20000).unwrap();
        assert_eq!(grid.n_nodes(), 41);
        assert_abs_diff_eq!(grid.theta[[20, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn oversized_grid_fails_before_allocating() {
        let err = QuadratureGrid::build(10, Some(7), (-4.0, 4.0), 20000).unwrap_err();
        assert!(matches!(err, MirtError::QuadratureTooLarge { nodes: 282475249, max: 20000 }));
        assert!(QuadratureGrid::build(1, Some(4), (-4.0, 4.0), 20000).is_err());
    }

    #[test]
    fn shifted_normal_moves_the_mean() {
        let grid = QuadratureGrid::build(1, Some(61), (-6.0, 6.0), 20000).unwrap();
        let w = grid.mvn_weights(&array![0.5], &array![[1.0]]).unwrap();
        let mean: f64 = w.iter().zip(grid.theta.column(0).iter()).map(|(w, t)| w * t).sum();
        assert_abs_diff_eq!(mean, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn custom_density_is_normalised() {
        let grid = QuadratureGrid::build(1, Some(11), (-4.0, 4.0), 20000).unwrap();
        let flat = PriorDensity::new(|_| 2.0);
        let w = grid.density_weights(&flat).unwrap();
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 1.0 / 11.0, epsilon = 1e-12);
    }
}
