//! Within-model Gaussian proposals.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rjs_core::{Error, Result};

/// Relative eigenvalue floor used by [`regularize_covariance`].
pub const EIGEN_FLOOR: f64 = 1e-10;

/// Draw from `N(current, covariance)` through the Cholesky factor of `covariance`.
///
/// Fails with [`Error::Computation`] when the matrix is not square, does not
/// match `current`, or is not positive definite. No retry happens here.
pub fn propose(current: &[f64], covariance: &DMatrix<f64>, rng: &mut impl Rng) -> Result<Vec<f64>> {
    let n = current.len();
    if covariance.nrows() != covariance.ncols() {
        return Err(Error::Computation(format!(
            "proposal covariance must be square, got {}x{}",
            covariance.nrows(),
            covariance.ncols()
        )));
    }
    if covariance.nrows() != n {
        return Err(Error::Computation(format!(
            "proposal covariance is {}x{} but the parameter vector has length {}",
            covariance.nrows(),
            covariance.ncols(),
            n
        )));
    }
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("proposal covariance has non-finite entries".to_string()));
    }

    let chol = covariance.clone().cholesky().ok_or_else(|| {
        Error::Computation("proposal covariance not SPD (Cholesky failed)".to_string())
    })?;
    let l = chol.l();

    let mut z = DVector::<f64>::zeros(n);
    for i in 0..n {
        z[i] = StandardNormal.sample(rng);
    }
    let step = l * z;
    Ok(current.iter().zip(step.iter()).map(|(&x, &dx)| x + dx).collect())
}

/// Symmetrize `cov` and clamp its eigenvalues from below.
///
/// The floor is [`EIGEN_FLOOR`] relative to the largest eigenvalue magnitude
/// (absolute when that is below one). Non-finite entries are replaced by zero
/// before the decomposition.
pub fn regularize_covariance(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows().min(cov.ncols());
    let mut sym = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let a = if cov[(i, j)].is_finite() { cov[(i, j)] } else { 0.0 };
            let b = if cov[(j, i)].is_finite() { cov[(j, i)] } else { 0.0 };
            sym[(i, j)] = 0.5 * (a + b);
        }
    }
    let eig = SymmetricEigen::new(sym);
    let largest = eig.eigenvalues.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let floor = EIGEN_FLOOR * largest;
    let clamped = eig.eigenvalues.map(|v| if v.is_finite() { v.max(floor) } else { floor });
    let q = eig.eigenvectors;
    &q * DMatrix::from_diagonal(&clamped) * q.transpose()
}

/// Run `draw` once, and once more after regularizing `covariance` if it fails.
///
/// Returns `None` when the second draw also fails; the caller treats that as
/// a rejected candidate.
pub fn propose_with_recovery(
    current: &[f64],
    covariance: &mut DMatrix<f64>,
    mut draw: impl FnMut(&[f64], &DMatrix<f64>) -> Result<Vec<f64>>,
) -> Option<Vec<f64>> {
    match draw(current, covariance) {
        Ok(x) => Some(x),
        Err(e) => {
            log::warn!("proposal failed ({e}); regularizing covariance");
            let n = current.len();
            *covariance = if covariance.nrows() == n && covariance.ncols() == n {
                regularize_covariance(covariance)
            } else {
                DMatrix::identity(n, n) * 0.1
            };
            match draw(current, covariance) {
                Ok(x) => Some(x),
                Err(e) => {
                    log::warn!("proposal failed after regularization ({e}); rejecting candidate");
                    None
                }
            }
        }
    }
}
