//! Sparse block containers for the RBA normal equations.
//!
//! Jacobians and Hessians are stored as collections of small dense blocks
//! (`nalgebra::DMatrix`) addressed by unknown-column and observation-row
//! indices. Each container splits into a symbolic part — which blocks
//! exist and which observations feed them — and a numeric part that is
//! re-evaluated every solver iteration. The symbolic part is built once
//! per `optimize_*` call and cached for its iterations only.

pub mod hessian;
pub mod jacobians;

pub use hessian::SparseBlockHessian;
pub use jacobians::{JacobianData, ObsSymbolic, PathStep};
