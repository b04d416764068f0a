//! Error types for the relba library.
//!
//! The library uses a hierarchical error system:
//! - **`RelbaError`** is the top-level error exposed by public APIs
//! - **Module errors** (`CoreError`, `SolverError`, `LinAlgError`,
//!   `ManifoldError`) are wrapped transparently inside it
//! - **Error sources** are preserved, allowing full error chain
//!   inspection through [`RelbaError::chain`]
//!
//! Fatal problem-state errors (`InvalidId`, `DuplicateKnownLandmark`,
//! `MissingInitialGuess`, `InconsistentGraph`) abort the mutating
//! operation that raised them with no state mutation. Optimization-layer
//! trouble never corrupts the problem: the solver always leaves the
//! problem in the last accepted state and reports divergence in its
//! result rather than through an error.

use crate::core::CoreError;
use crate::linalg::LinAlgError;
use crate::manifold::ManifoldError;
use crate::solver::SolverError;
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the relba library.
pub type RelbaResult<T> = Result<T, RelbaError>;

/// Top-level error type wrapping module-specific errors.
#[derive(Debug, Error)]
pub enum RelbaError {
    /// Problem-state errors (keyframes, edges, observations, landmarks)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization errors
    #[error(transparent)]
    Solver(#[from] SolverError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Pose algebra errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// I/O errors from graph export
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelbaError {
    /// The full error chain as a multi-line string, from this error down
    /// to the root cause.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }
        chain.join("\n")
    }

    /// Compact single-line variant of [`RelbaError::chain`].
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelbaError::from(LinAlgError::SingularMatrix);
        assert!(err.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_transparent_conversion() {
        let core = CoreError::MissingInitialGuess(12);
        let err: RelbaError = core.into();
        match err {
            RelbaError::Core(CoreError::MissingInitialGuess(12)) => {}
            _ => panic!("expected Core variant"),
        }
    }

    #[test]
    fn test_error_chain_compact() {
        let err = RelbaError::from(SolverError::from(LinAlgError::SingularMatrix));
        let chain = err.chain_compact();
        assert!(chain.contains("Singular matrix"));
    }
}
