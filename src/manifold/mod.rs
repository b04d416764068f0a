//! Pose parameterizations for relative bundle adjustment.
//!
//! Keyframe-to-keyframe edges carry elements of a Lie group (SE(2) or SE(3));
//! the optimizer only ever touches them through the [`RelativePose`] trait:
//! composition, inversion, the exp/log maps, and the action on Euclidean
//! points together with its derivative. That is the whole contract — the
//! block Jacobians of the observation model are assembled from rotations and
//! point-action derivatives, so no group-level Jacobians are required here.
//!
//! Tangent conventions follow the [manif](https://github.com/artivis/manif)
//! C++ library: SE(2) tangents are `[x, y, theta]`, SE(3) tangents are
//! `[rho(3), theta(3)]` with the translational part first.

use nalgebra::{DMatrix, DVector};
use std::fmt::Display;
use thiserror::Error;
use tracing::error;

pub mod se2;
pub mod se3;

pub use se2::SE2;
pub use se3::SE3;

/// Errors from pose algebra operations.
#[derive(Debug, Clone, Error)]
pub enum ManifoldError {
    /// Tangent or point vector with the wrong number of components
    #[error("invalid dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// NaN or Inf detected in a group element or tangent vector
    #[error("invalid number: NaN or Inf detected")]
    InvalidNumber,
}

impl ManifoldError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for pose algebra operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// A keyframe-to-keyframe relative pose.
///
/// An element `T` of the trait maps points from its child frame into its
/// parent frame: for an edge `(from, to)` storing `T(from ← to)`,
/// `transform_point` carries a point expressed in `to` coordinates into
/// `from` coordinates.
///
/// Tangent vectors are plain `DVector<f64>` of length [`RelativePose::DOF`];
/// the perturbation convention is right-multiplicative,
/// `T ← T ⊕ exp(delta)`.
pub trait RelativePose: Clone + PartialEq + Display + Send + Sync + 'static {
    /// Degrees of freedom of the tangent space (3 for SE(2), 6 for SE(3)).
    const DOF: usize;

    /// Dimension of the ambient point space the pose acts on.
    const DIM: usize;

    /// The neutral element.
    fn identity() -> Self;

    /// Group composition `self ⊕ other`.
    fn compose(&self, other: &Self) -> Self;

    /// Group inverse.
    fn inverse(&self) -> Self;

    /// Exponential map from a tangent vector of length `DOF`.
    fn exp(tangent: &DVector<f64>) -> Self;

    /// Logarithmic map to a tangent vector of length `DOF`.
    fn log(&self) -> DVector<f64>;

    /// Rotation part as a `DIM x DIM` matrix.
    fn rotation(&self) -> DMatrix<f64>;

    /// Map a point from the child frame into the parent frame.
    fn transform_point(&self, point: &DVector<f64>) -> DVector<f64>;

    /// Derivative of the point action at the identity:
    /// `d(exp(delta) · p)/d(delta)` evaluated at `delta = 0`,
    /// a `DIM x DOF` matrix.
    fn point_action_jacobian(point: &DVector<f64>) -> DMatrix<f64>;

    /// A random group element (for tests and perturbation studies).
    fn random() -> Self;

    /// Approximate equality through the log of the relative transform.
    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.inverse().compose(other).log().norm() < tolerance
    }
}
