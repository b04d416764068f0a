//! Cholesky solve of the Schur-reduced system.
//!
//! After the landmark block is eliminated the reduced matrix `S` is small
//! and dense; it is handed to faer's symbolic+numeric `Llt`
//! factorization. A numeric failure (non-positive-definite `S`) is
//! reported as [`LinAlgError::SingularMatrix`] — the Levenberg-Marquardt
//! loop reacts by raising the damping and retrying, bounded by
//! `max_lambda`.

use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

/// Linear algebra error types.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (symbolic analysis)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or non-positive-definite matrix detected
    #[error("Singular matrix detected (matrix is not positive definite)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from a third-party
    /// library, then return self for chaining.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations.
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Solve `S x = b` for a symmetric positive-definite `S` via Cholesky.
pub fn cholesky_solve(s: &DMatrix<f64>, b: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
    let n = s.nrows();
    debug_assert_eq!(s.ncols(), n);
    debug_assert_eq!(b.len(), n);

    let mut triplets = Vec::with_capacity(n * n);
    for c in 0..n {
        for r in 0..n {
            triplets.push(Triplet::new(r, c, s[(r, c)]));
        }
    }
    let mat = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("reduced system assembly failed".to_string())
            .log_with_source(e)
    })?;

    let sym = SymbolicLlt::try_new(mat.symbolic(), Side::Lower).map_err(|e| {
        LinAlgError::FactorizationFailed("symbolic Cholesky decomposition failed".to_string())
            .log_with_source(e)
    })?;
    let chol = Llt::try_new_with_symbolic(sym, mat.as_ref(), Side::Lower)
        .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

    let rhs = Mat::from_fn(n, 1, |i, _| b[i]);
    let x = chol.solve(&rhs);
    Ok(DVector::from_fn(n, |i, _| x[(i, 0)]))
}

/// Condition number of a symmetric matrix from its eigenvalue spread.
pub fn condition_number(s: &DMatrix<f64>) -> f64 {
    let eigen = s.clone().symmetric_eigen();
    let mut min = f64::INFINITY;
    let mut max: f64 = 0.0;
    for &ev in eigen.eigenvalues.iter() {
        let a = ev.abs();
        min = min.min(a);
        max = max.max(a);
    }
    if min == 0.0 { f64::INFINITY } else { max / min }
}
