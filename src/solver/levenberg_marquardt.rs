//! The Levenberg-Marquardt loop over selected RBA unknowns.
//!
//! Damping follows the classic schedule: λ starts at 1e-3, grows by 10 on
//! a rejected step and shrinks by 0.1 on an accepted one. Steps are
//! accepted whenever the total weighted squared error decreases; the
//! reduction ratio ρ additionally controls whether the next iteration
//! relinearizes or reuses the current Jacobians. A non-positive-definite
//! reduced system is treated like a rejected step. When λ crosses
//! `max_lambda` the loop reports [`OptimizeStatus::NumericDivergence`]
//! and leaves the problem in the last accepted state.

use crate::core::state::{EdgeId, LandmarkId, ObsIdx, RbaState};
use crate::linalg::{self, LinAlgError};
use crate::manifold::RelativePose;
use crate::models::{NoiseWeight, ObservationNoise, SensorModel};
use crate::solver::schur::{SchurOutcome, solve_schur};
use crate::solver::{
    CovRecovery, OptimizeReport, OptimizeStatus, RbaParameters, SolverError, SolverResult,
    SparsityStats,
};
use crate::sparse::hessian::{self, SparseBlockHessian};
use crate::sparse::jacobians::{self, JacobianData, ObsSymbolic};
use nalgebra::DVector;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use web_time::Instant;

/// Pseudo-Huber cost of one observation with weighted error `delta`.
fn huber_cost(delta: f64, k: f64) -> f64 {
    2.0 * k * k * ((1.0 + (delta / k) * (delta / k)).sqrt() - 1.0)
}

/// First derivative of the pseudo-Huber cost w.r.t. the squared error:
/// the reweighting factor applied to each observation's contribution.
fn huber_weight(delta: f64, k: f64) -> f64 {
    1.0 / (1.0 + (delta / k) * (delta / k)).sqrt()
}

struct ErrorEval {
    total: f64,
    weights: BTreeMap<ObsIdx, NoiseWeight>,
    residuals: BTreeMap<ObsIdx, DVector<f64>>,
    invalid: BTreeSet<ObsIdx>,
}

/// Residuals, robust weights and total error at the current state.
fn evaluate_error<M: SensorModel>(
    state: &RbaState<M>,
    symbolic: &[ObsSymbolic],
    sensor_pose: Option<&M::Pose>,
    sensor_params: &M::Params,
    noise: &dyn ObservationNoise,
    robust: bool,
    kernel_param: f64,
) -> ErrorEval {
    let (residuals, invalid) = jacobians::compute_residuals(state, symbolic, sensor_pose, sensor_params);
    let mut total = 0.0;
    let mut weights = BTreeMap::new();
    for (&obs, r) in &residuals {
        let info = noise.information(obs);
        let sq = info.squared_norm(r);
        if robust {
            let delta = sq.sqrt();
            total += huber_cost(delta, kernel_param);
            weights.insert(obs, info.scaled(huber_weight(delta, kernel_param)));
        } else {
            total += sq;
            weights.insert(obs, info);
        }
    }
    ErrorEval {
        total,
        weights,
        residuals,
        invalid,
    }
}

/// Predicted reduction of the damped quadratic model for the step
/// `(delta_p, delta_f)`.
fn predicted_reduction(
    out: &SchurOutcome,
    hap: &SparseBlockHessian,
    hf: &SparseBlockHessian,
    g_ap: &[DVector<f64>],
    g_f: &[DVector<f64>],
    lambda: f64,
) -> f64 {
    let mut pred = 0.0;
    for (i, dp) in out.delta_p.iter().enumerate() {
        let diag = hap.diagonal_block(i);
        for d in 0..dp.len() {
            let damp = diag.map(|b| b[(d, d)]).unwrap_or(0.0);
            pred += dp[d] * (lambda * damp * dp[d] + g_ap[i][d]);
        }
    }
    for (k, df) in out.delta_f.iter().enumerate() {
        let diag = hf.diagonal_block(k);
        for d in 0..df.len() {
            let damp = diag.map(|b| b[(d, d)]).unwrap_or(0.0);
            pred += df[d] * (lambda * damp * df[d] + g_f[k][d]);
        }
    }
    pred
}

/// Run Levenberg-Marquardt over the given kf2kf-edge and landmark
/// unknowns. With `obs_subset` set only those observations are used;
/// otherwise every observation involving a selected unknown participates.
///
/// The problem state is left at the last accepted point on every exit
/// path, including divergence.
#[allow(clippy::too_many_arguments)]
pub fn optimize_edges<M: SensorModel>(
    state: &mut RbaState<M>,
    k2k_edges: &[EdgeId],
    landmarks: &[LandmarkId],
    obs_subset: Option<&[ObsIdx]>,
    params: &RbaParameters,
    sensor_params: &M::Params,
    sensor_pose: Option<&M::Pose>,
    noise: &dyn ObservationNoise,
    robust: bool,
) -> SolverResult<OptimizeReport> {
    let started = Instant::now();
    let dof = <M::Pose as RelativePose>::DOF;
    let lm_dims = M::LM_DIMS;

    // Column maps over deduplicated unknowns. Known-position landmarks
    // contribute no unknowns regardless of the selection.
    let edge_ids: BTreeSet<EdgeId> = k2k_edges.iter().copied().collect();
    let lm_ids: BTreeSet<LandmarkId> = landmarks
        .iter()
        .copied()
        .filter(|lm| state.unknown_landmarks().contains_key(lm))
        .collect();
    let edge_cols: BTreeMap<EdgeId, usize> =
        edge_ids.iter().enumerate().map(|(c, &e)| (e, c)).collect();
    let lm_cols: BTreeMap<LandmarkId, usize> =
        lm_ids.iter().enumerate().map(|(c, &l)| (l, c)).collect();

    if edge_cols.is_empty() && lm_cols.is_empty() {
        return Ok(OptimizeReport::empty(OptimizeStatus::NoUnknowns));
    }

    // Symbolic paths, then the observation selection: everything whose
    // landmark is a selected unknown or whose path crosses a selected
    // edge.
    let candidate: Vec<ObsIdx> = match obs_subset {
        Some(subset) => {
            if let Some(&bad) = subset.iter().find(|&&i| i >= state.num_observations()) {
                return Err(SolverError::InvalidParameters(format!(
                    "observation index {bad} out of range"
                ))
                .log());
            }
            subset.to_vec()
        }
        None => (0..state.num_observations()).collect(),
    };
    let mut symbolic: Vec<ObsSymbolic> = Vec::new();
    for obs_idx in candidate {
        let sym = jacobians::build_obs_symbolic(state, obs_idx);
        let involves_unknown = lm_cols.contains_key(&sym.lm_id)
            || sym.steps.iter().any(|s| edge_cols.contains_key(&s.edge_id));
        if involves_unknown || obs_subset.is_some() {
            symbolic.push(sym);
        }
    }
    if symbolic.is_empty() {
        return Ok(OptimizeReport::empty(OptimizeStatus::NoUnknowns));
    }

    let mut report = OptimizeReport::empty(OptimizeStatus::MaxIterationsReached);
    report.num_observations = symbolic.len();
    report.num_kf2kf_edges_optimized = edge_cols.len();
    report.num_landmarks_optimized = lm_cols.len();
    report.num_total_scalar_optimized = edge_cols.len() * dof + lm_cols.len() * lm_dims;
    report.optimized_k2k_edges = edge_ids.iter().copied().collect();
    report.optimized_landmarks = lm_ids.iter().copied().collect();

    // Tree roots whose numeric poses feed these observations.
    let roots: BTreeSet<_> = symbolic.iter().map(|s| s.base_kf).collect();
    report.num_span_tree_numeric_updates += state.spanning_update_numeric(&roots);

    let mut eval = evaluate_error(
        state,
        &symbolic,
        sensor_pose,
        sensor_params,
        noise,
        robust,
        params.kernel_param,
    );
    report.total_sqr_error_init = eval.total;
    let num_valid = symbolic.len() - eval.invalid.len();
    if num_valid == 0 {
        report.status = OptimizeStatus::NoUnknowns;
        report.num_invalid_observations = eval.invalid.len();
        report.total_sqr_error_final = eval.total;
        report.elapsed = started.elapsed();
        return Ok(report);
    }

    let mut lambda = 1e-3;
    let mut relinearize = true;
    let mut fresh_linearization = true;

    let mut jac: Option<JacobianData> = None;
    let mut hap: Option<SparseBlockHessian> = None;
    let mut hf: Option<SparseBlockHessian> = None;
    let mut hapf: Option<SparseBlockHessian> = None;
    let mut g_ap: Vec<DVector<f64>> = Vec::new();
    let mut g_f: Vec<DVector<f64>> = Vec::new();
    let mut last_outcome: Option<SchurOutcome> = None;

    debug!(
        "optimize_edges: {} edge unknowns, {} landmark unknowns, {} observations, initial error {:.6e}",
        edge_cols.len(),
        lm_cols.len(),
        symbolic.len(),
        eval.total
    );

    let mut iter = 0;
    while iter < params.max_iters {
        iter += 1;
        report.iterations = iter;

        if fresh_linearization {
            if relinearize || jac.is_none() {
                let data = jacobians::recompute_jacobians(
                    state,
                    &symbolic,
                    &edge_cols,
                    &lm_cols,
                    sensor_pose,
                    sensor_params,
                    params.numeric_jacobians,
                );
                report.num_jacobians = data.num_jacobians;
                // The block structure is fixed for the whole call; build
                // the Hessian symbolics from the first evaluation.
                if hap.is_none() {
                    hap = Some(SparseBlockHessian::build_symbolic_square(&data.dh_dap));
                    hf = Some(SparseBlockHessian::build_symbolic_square(&data.dh_df));
                    hapf = Some(SparseBlockHessian::build_symbolic_rect(
                        &data.dh_dap,
                        &data.dh_df,
                    ));
                }
                jac = Some(data);
            }
            let data = jac.as_ref().expect("jacobians evaluated");
            let invalid = &data.invalid;
            let mut skipped = 0;
            skipped += hap.as_mut().expect("HAp built").update_numeric(
                &data.dh_dap,
                &data.dh_dap,
                &eval.weights,
                invalid,
                dof,
                dof,
            );
            skipped += hf.as_mut().expect("Hf built").update_numeric(
                &data.dh_df,
                &data.dh_df,
                &eval.weights,
                invalid,
                lm_dims,
                lm_dims,
            );
            skipped += hapf.as_mut().expect("HApf built").update_numeric(
                &data.dh_dap,
                &data.dh_df,
                &eval.weights,
                invalid,
                dof,
                lm_dims,
            );
            report.num_hessian_blocks_skipped = skipped;
            report.num_invalid_observations = data.invalid.len();

            g_ap = hessian::gradient(&data.dh_dap, &eval.residuals, &eval.weights, invalid, dof);
            g_f = hessian::gradient(&data.dh_df, &eval.residuals, &eval.weights, invalid, lm_dims);
            fresh_linearization = false;
        }

        let outcome = match solve_schur(
            hap.as_ref().expect("HAp built"),
            hf.as_ref().expect("Hf built"),
            hapf.as_ref().expect("HApf built"),
            &g_ap,
            &g_f,
            lambda,
            dof,
            lm_dims,
        ) {
            Ok(out) => out,
            Err(LinAlgError::SingularMatrix) => {
                // Non-SPD reduced system: damp harder and retry.
                lambda *= 10.0;
                debug!("iteration {iter}: reduced system not SPD, lambda -> {lambda:.3e}");
                if lambda > params.max_lambda {
                    report.status = OptimizeStatus::NumericDivergence;
                    break;
                }
                continue;
            }
            Err(e) => return Err(SolverError::from(e).log()),
        };

        // Trial update: edges by exp-map, landmarks additively. Keep the
        // previous values for an exact revert.
        let saved_poses: Vec<(EdgeId, M::Pose)> = edge_cols
            .keys()
            .map(|&e| (e, state.k2k_edge(e).expect("valid edge").pose.clone()))
            .collect();
        let saved_lms: Vec<(LandmarkId, DVector<f64>)> = lm_cols
            .keys()
            .map(|&l| (l, state.unknown_landmarks()[&l].pos.clone()))
            .collect();

        for (&e, &col) in &edge_cols {
            let step = M::Pose::exp(&outcome.delta_p[col]);
            let pose = state.k2k_edge_pose_mut(e).expect("valid edge");
            *pose = pose.compose(&step);
            state.spanning_mark_dirty(e);
        }
        for (&l, &col) in &lm_cols {
            *state.unknown_landmark_pos_mut(l).expect("unknown landmark") += &outcome.delta_f[col];
        }
        report.num_span_tree_numeric_updates += state.spanning_update_numeric(&roots);

        let trial = evaluate_error(
            state,
            &symbolic,
            sensor_pose,
            sensor_params,
            noise,
            robust,
            params.kernel_param,
        );

        let pred = predicted_reduction(
            &outcome,
            hap.as_ref().expect("HAp built"),
            hf.as_ref().expect("Hf built"),
            &g_ap,
            &g_f,
            lambda,
        );
        let rho = if pred > 0.0 {
            (eval.total - trial.total) / pred
        } else if trial.total < eval.total {
            1.0
        } else {
            -1.0
        };

        if rho > 0.0 {
            debug!(
                "iteration {iter}: accepted, error {:.6e} -> {:.6e}, rho {:.3}, lambda {:.3e}",
                eval.total, trial.total, rho, lambda
            );
            eval = trial;
            lambda *= 0.1;
            relinearize = rho.min(params.max_rho) > params.min_error_reduction_ratio_to_relinearize;
            fresh_linearization = true;
            last_outcome = Some(outcome);

            if eval.total / num_valid as f64 <= params.max_error_per_obs_to_stop {
                report.status = OptimizeStatus::Converged;
                break;
            }
        } else {
            // Revert to the last accepted state.
            for (e, pose) in saved_poses {
                *state.k2k_edge_pose_mut(e).expect("valid edge") = pose;
                state.spanning_mark_dirty(e);
            }
            for (l, pos) in saved_lms {
                *state.unknown_landmark_pos_mut(l).expect("unknown landmark") = pos;
            }
            report.num_span_tree_numeric_updates += state.spanning_update_numeric(&roots);
            lambda *= 10.0;
            debug!(
                "iteration {iter}: rejected (error {:.6e} -> {:.6e}), lambda -> {lambda:.3e}",
                eval.total, trial.total
            );
            if lambda > params.max_lambda {
                report.status = OptimizeStatus::NumericDivergence;
                break;
            }
        }
    }

    report.total_sqr_error_final = eval.total;
    report.obs_rmse = (eval.total / num_valid as f64).sqrt();
    report.final_lambda = lambda;

    if params.compute_condition_number
        && let Some(h) = hap.as_ref()
    {
        report.condition_number = Some(linalg::condition_number(&h.to_dense(dof, dof)));
    }
    if params.compute_sparsity_stats
        && let (Some(data), Some(hap), Some(hf), Some(hapf)) =
            (jac.as_ref(), hap.as_ref(), hf.as_ref(), hapf.as_ref())
    {
        let np = edge_cols.len();
        let nf = lm_cols.len();
        let nobs = symbolic.len();
        report.sparsity = Some(SparsityStats {
            dh_dap_nnz: data.dh_dap.iter().map(BTreeMap::len).sum(),
            dh_dap_max_size: np * nobs,
            dh_df_nnz: data.dh_df.iter().map(BTreeMap::len).sum(),
            dh_df_max_size: nf * nobs,
            hap_nnz: hap.num_blocks(),
            hap_max_size: np * (np + 1) / 2,
            hf_nnz: hf.num_blocks(),
            hf_max_size: nf,
            hapf_nnz: hapf.num_blocks(),
            hapf_max_size: np * nf,
        });
    }
    if params.cov_recovery == CovRecovery::LandmarksApprox
        && let Some(outcome) = last_outcome.as_ref()
    {
        let covs = lm_cols
            .iter()
            .map(|(&lm, &col)| (lm, outcome.hf_inv[col].clone()))
            .collect();
        report.landmark_covariances = Some(covs);
    }

    report.elapsed = started.elapsed();
    Ok(report)
}
