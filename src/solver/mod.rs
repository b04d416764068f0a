//! Least-squares optimization of relative-pose and landmark unknowns.
//!
//! The solver is a Levenberg-Marquardt loop over a caller-selected set of
//! kf2kf edges and unknown landmarks. Each iteration refreshes the dirty
//! spanning-tree poses, re-evaluates the block Jacobians (when
//! relinearizing) and Hessians, eliminates the landmark block through the
//! Schur complement and solves the reduced system with a Cholesky
//! factorization. Landmark updates come back by substitution.

pub mod levenberg_marquardt;
pub mod schur;

use crate::core::state::{EdgeId, LandmarkId};
use crate::linalg::LinAlgError;
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tracing::error;
use web_time::Duration;

pub use levenberg_marquardt::optimize_edges;

/// Solver error types. Recoverable numeric trouble (a non-SPD reduced
/// system) never surfaces here — the loop absorbs it by raising the
/// damping; these are structural failures only.
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),

    /// Invalid solver parameters
    #[error("Invalid solver parameters: {0}")]
    InvalidParameters(String),
}

impl SolverError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Covariance recovery policy applied after the last accepted iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovRecovery {
    /// Skip covariance recovery.
    None,
    /// Per-landmark covariance approximated by the blockwise inverse of
    /// the damped landmark Hessian at the final linearization.
    #[default]
    LandmarksApprox,
}

/// Parameters of the RBA engine and its optimizers.
///
/// Built with the usual builder pattern:
///
/// ```
/// use relba::solver::RbaParameters;
///
/// let params = RbaParameters::new()
///     .with_max_tree_depth(3)
///     .with_max_optimize_depth(3)
///     .with_max_iters(30);
/// ```
#[derive(Debug, Clone)]
pub struct RbaParameters {
    /// Maximum depth of the maintained spanning trees.
    pub max_tree_depth: usize,
    /// Topological radius of the local area optimized around a new
    /// keyframe.
    pub max_optimize_depth: usize,
    /// Optimize each newly created edge alone before the joint local
    /// solve (stage 1).
    pub optimize_new_edges_alone: bool,
    /// Robust (pseudo-Huber) kernel in the joint solve.
    pub use_robust_kernel: bool,
    /// Robust kernel in the stage-1 solves.
    pub use_robust_kernel_stage1: bool,
    /// Huber kernel parameter `k`.
    pub kernel_param: f64,
    /// Maximum Levenberg-Marquardt iterations.
    pub max_iters: usize,
    /// Stop once the mean squared error per observation falls below this.
    pub max_error_per_obs_to_stop: f64,
    /// Upper clamp on the reduction ratio used in the relinearization
    /// decision.
    pub max_rho: f64,
    /// Damping ceiling; reaching it reports non-convergence.
    pub max_lambda: f64,
    /// Accepted steps with a reduction ratio below this reuse the current
    /// linearization.
    pub min_error_reduction_ratio_to_relinearize: f64,
    /// Replace analytic Jacobians by central finite differences
    /// (diagnostic, slow).
    pub numeric_jacobians: bool,
    /// Report the condition number of the pose Hessian.
    pub compute_condition_number: bool,
    /// Report sparsity statistics of the problem matrices.
    pub compute_sparsity_stats: bool,
    /// Covariance recovery policy.
    pub cov_recovery: CovRecovery,
}

impl Default for RbaParameters {
    fn default() -> Self {
        RbaParameters {
            max_tree_depth: 4,
            max_optimize_depth: 4,
            optimize_new_edges_alone: true,
            use_robust_kernel: false,
            use_robust_kernel_stage1: false,
            kernel_param: 3.0,
            max_iters: 20,
            max_error_per_obs_to_stop: 1e-9,
            max_rho: 1.0,
            max_lambda: 1e20,
            min_error_reduction_ratio_to_relinearize: 0.01,
            numeric_jacobians: false,
            compute_condition_number: false,
            compute_sparsity_stats: false,
            cov_recovery: CovRecovery::default(),
        }
    }
}

impl RbaParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tree_depth(mut self, depth: usize) -> Self {
        self.max_tree_depth = depth;
        self
    }

    pub fn with_max_optimize_depth(mut self, depth: usize) -> Self {
        self.max_optimize_depth = depth;
        self
    }

    pub fn with_optimize_new_edges_alone(mut self, enable: bool) -> Self {
        self.optimize_new_edges_alone = enable;
        self
    }

    pub fn with_robust_kernel(mut self, enable: bool, kernel_param: f64) -> Self {
        self.use_robust_kernel = enable;
        self.kernel_param = kernel_param;
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_max_lambda(mut self, max_lambda: f64) -> Self {
        self.max_lambda = max_lambda;
        self
    }

    pub fn with_numeric_jacobians(mut self, enable: bool) -> Self {
        self.numeric_jacobians = enable;
        self
    }

    pub fn with_cov_recovery(mut self, policy: CovRecovery) -> Self {
        self.cov_recovery = policy;
        self
    }
}

/// Outcome of one optimization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizeStatus {
    /// Per-observation error dropped below the stop threshold.
    Converged,
    /// Iteration budget exhausted.
    MaxIterationsReached,
    /// Damping exceeded `max_lambda`; the last accepted state is kept.
    NumericDivergence,
    /// Nothing to optimize (no unknowns or no observations selected).
    NoUnknowns,
}

impl Display for OptimizeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizeStatus::Converged => write!(f, "Converged"),
            OptimizeStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizeStatus::NumericDivergence => write!(f, "Numeric divergence (damping exceeded max_lambda)"),
            OptimizeStatus::NoUnknowns => write!(f, "No unknowns selected"),
        }
    }
}

/// Sparsity statistics of the problem matrices (filled-in blocks versus
/// the dense block count).
#[derive(Debug, Clone, Default)]
pub struct SparsityStats {
    pub dh_dap_nnz: usize,
    pub dh_dap_max_size: usize,
    pub dh_df_nnz: usize,
    pub dh_df_max_size: usize,
    pub hap_nnz: usize,
    pub hap_max_size: usize,
    pub hf_nnz: usize,
    pub hf_max_size: usize,
    pub hapf_nnz: usize,
    pub hapf_max_size: usize,
}

/// Everything an optimization run reports back.
#[derive(Clone)]
pub struct OptimizeReport {
    pub status: OptimizeStatus,
    /// Observations taken into account.
    pub num_observations: usize,
    /// Jacobian blocks evaluated per relinearization step.
    pub num_jacobians: usize,
    /// Observations skipped for lack of a usable tree path.
    pub num_invalid_observations: usize,
    /// Hessian block multiplications skipped over invalid observations.
    pub num_hessian_blocks_skipped: usize,
    pub num_kf2kf_edges_optimized: usize,
    pub num_landmarks_optimized: usize,
    /// Total scalar unknowns solved.
    pub num_total_scalar_optimized: usize,
    /// Spanning-tree poses recomputed across all iterations.
    pub num_span_tree_numeric_updates: usize,
    pub total_sqr_error_init: f64,
    pub total_sqr_error_final: f64,
    /// Root-mean-square error per observation after optimization.
    pub obs_rmse: f64,
    /// Levenberg-Marquardt iterations run (accepted and rejected).
    pub iterations: usize,
    pub final_lambda: f64,
    /// Condition number of the pose Hessian, when requested.
    pub condition_number: Option<f64>,
    pub sparsity: Option<SparsityStats>,
    /// Recovered landmark covariances, when requested.
    pub landmark_covariances: Option<BTreeMap<LandmarkId, DMatrix<f64>>>,
    pub optimized_k2k_edges: Vec<EdgeId>,
    pub optimized_landmarks: Vec<LandmarkId>,
    pub elapsed: Duration,
}

impl OptimizeReport {
    pub(crate) fn empty(status: OptimizeStatus) -> Self {
        OptimizeReport {
            status,
            num_observations: 0,
            num_jacobians: 0,
            num_invalid_observations: 0,
            num_hessian_blocks_skipped: 0,
            num_kf2kf_edges_optimized: 0,
            num_landmarks_optimized: 0,
            num_total_scalar_optimized: 0,
            num_span_tree_numeric_updates: 0,
            total_sqr_error_init: 0.0,
            total_sqr_error_final: 0.0,
            obs_rmse: 0.0,
            iterations: 0,
            final_lambda: 0.0,
            condition_number: None,
            sparsity: None,
            landmark_covariances: None,
            optimized_k2k_edges: Vec::new(),
            optimized_landmarks: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

impl Display for OptimizeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local optimization result: {}", self.status)?;
        writeln!(
            f,
            "  Unknowns:     {} edges, {} landmarks ({} scalars)",
            self.num_kf2kf_edges_optimized,
            self.num_landmarks_optimized,
            self.num_total_scalar_optimized
        )?;
        writeln!(
            f,
            "  Observations: {} ({} without a usable path)",
            self.num_observations, self.num_invalid_observations
        )?;
        writeln!(
            f,
            "  Error:        {:.6e} -> {:.6e} (rmse/obs {:.3e})",
            self.total_sqr_error_init, self.total_sqr_error_final, self.obs_rmse
        )?;
        writeln!(
            f,
            "  Iterations:   {} (final lambda {:.3e})",
            self.iterations, self.final_lambda
        )?;
        writeln!(
            f,
            "  Performance:  {:.2}ms, {} tree pose updates",
            self.elapsed.as_secs_f64() * 1000.0,
            self.num_span_tree_numeric_updates
        )?;
        if let Some(cond) = self.condition_number {
            writeln!(f, "  HAp condition number: {:.3e}", cond)?;
        }
        Ok(())
    }
}
