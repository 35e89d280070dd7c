//! Multivariate Gaussian emission density.

use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;

use crate::error::{PipelineError, Result};

/// Gaussian with a cached Cholesky factor of its covariance.
#[derive(Debug, Clone)]
pub struct Gaussian {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
    chol: Array2<f64>,
    log_det: f64,
}

impl Gaussian {
    /// Fails with a convergence error when the covariance is not symmetric
    /// positive definite.
    pub fn new(mean: Array1<f64>, covariance: Array2<f64>) -> Result<Self> {
        let d = mean.len();
        if covariance.dim() != (d, d) {
            return Err(PipelineError::data(format!(
                "covariance shape {:?} does not match mean length {}",
                covariance.dim(),
                d
            )));
        }
        if mean.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(PipelineError::convergence("emission parameters are not finite"));
        }
        let chol = cholesky(&covariance).ok_or_else(|| {
            PipelineError::convergence("covariance is not positive definite")
        })?;
        let log_det = 2.0 * chol.diag().iter().map(|v| v.ln()).sum::<f64>();
        Ok(Self { mean, covariance, chol, log_det })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn log_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let d = self.dim();
        // Solve L y = (x - mu); the quadratic form is |y|^2.
        let mut y = vec![0.0; d];
        for i in 0..d {
            let mut acc = x[i] - self.mean[i];
            for k in 0..i {
                acc -= self.chol[[i, k]] * y[k];
            }
            y[i] = acc / self.chol[[i, i]];
        }
        let quad: f64 = y.iter().map(|v| v * v).sum();
        -0.5 * (d as f64 * (2.0 * PI).ln() + self.log_det + quad)
    }
}

/// Lower-triangular Cholesky factor, or `None` if `a` is not positive
/// definite.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag.is_finite() && diag > 0.0) {
            return None;
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..n {
            let mut acc = a[[i, j]];
            for k in 0..j {
                acc -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = acc / ljj;
        }
    }
    Some(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, array};

    #[test]
    fn test_standard_normal_log_pdf_at_mean() {
        let g = Gaussian::new(array![0.0, 0.0], Array2::eye(2)).unwrap();
        let expected = -(2.0 * PI).ln();
        assert!((g.log_pdf(array![0.0, 0.0].view()) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_log_pdf_uses_full_covariance() {
        let cov = arr2(&[[2.0, 0.6], [0.6, 1.0]]);
        let g = Gaussian::new(array![1.0, -1.0], cov).unwrap();
        // det = 2 - 0.36 = 1.64; inverse = [[1, -0.6], [-0.6, 2]] / 1.64
        let x = array![2.0, 0.0];
        let quad = (1.0 * 1.0 - 2.0 * 0.6 * 1.0 * 1.0 + 2.0 * 1.0 * 1.0) / 1.64;
        let expected = -0.5 * (2.0 * (2.0 * PI).ln() + 1.64f64.ln() + quad);
        assert!((g.log_pdf(x.view()) - expected).abs() < 1e-10);
    }

    #[test]
    fn test_singular_covariance_rejected() {
        let err = Gaussian::new(array![0.0, 0.0], Array2::zeros((2, 2))).unwrap_err();
        assert!(matches!(err, PipelineError::Convergence(_)));
    }

    #[test]
    fn test_cholesky_reconstructs() {
        let a = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let l = cholesky(&a).unwrap();
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}
