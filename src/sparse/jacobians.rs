//! Block Jacobians of the observation model.
//!
//! For an observation of landmark `f` (base keyframe `b`) taken from
//! keyframe `o`, the prediction is `h(S⁻¹ · T(o←b) · f)` where the
//! composed pose is read from the spanning tree rooted at `b`. The
//! Jacobian with respect to a right perturbation of an on-path edge `e`
//! collapses to
//!
//! ```text
//! ∂h/∂ε_e = sign(e) · J_h · R(T(o ← e.to)) · Jpoint(x_{e.to})
//! ```
//!
//! with `J_h` the sensor point Jacobian at the predicted point (mounting
//! rotation folded in), `x_t = T(t←b)·f` the landmark seen from frame
//! `t`, and `sign(e) = +1` when the path traverses the edge from its
//! `from` to its `to` keyframe while walking away from the observer.
//! The landmark Jacobian is `∂h/∂f = J_h · R(T(o←b))`.
//!
//! The symbolic part of each column is the list of signed on-path edges;
//! it changes only when the graph (and hence the trees) changes. Numeric
//! values are recomputed from the lazily refreshed tree poses. Both an
//! analytic and a finite-difference evaluation exist; the latter is a
//! diagnostic tool selected by the `numeric_jacobians` parameter.

use crate::core::state::{EdgeId, KeyframeId, LandmarkId, ObsIdx, RbaState};
use crate::manifold::RelativePose;
use crate::models::SensorModel;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};

/// One signed edge on an observation's tree path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub edge_id: EdgeId,
    /// +1 when the path walks the edge from `from` to `to` (moving away
    /// from the observer), -1 otherwise.
    pub forward: bool,
    /// The edge's `to` keyframe: the frame in which the point action is
    /// evaluated.
    pub frame: KeyframeId,
}

/// Symbolic Jacobian structure of one observation: its tree path from the
/// observing keyframe down to the landmark's base keyframe.
#[derive(Debug, Clone)]
pub struct ObsSymbolic {
    pub obs_idx: ObsIdx,
    pub obs_kf: KeyframeId,
    pub base_kf: KeyframeId,
    pub lm_id: LandmarkId,
    pub lm_is_known: bool,
    pub steps: Vec<PathStep>,
    /// False when the observer lies outside the base keyframe's bounded
    /// tree; such observations contribute no blocks and are counted.
    pub valid: bool,
}

/// Build the symbolic path of one observation from the spanning tree
/// rooted at the landmark's base keyframe.
pub fn build_obs_symbolic<M: SensorModel>(state: &RbaState<M>, obs_idx: ObsIdx) -> ObsSymbolic {
    let obs = &state.observations()[obs_idx];
    let (entry, _) = state
        .landmark(obs.lm_id)
        .expect("observation references a created landmark");
    let base_kf = entry.base_kf;

    let mut sym = ObsSymbolic {
        obs_idx,
        obs_kf: obs.kf_id,
        base_kf,
        lm_id: obs.lm_id,
        lm_is_known: obs.lm_is_known,
        steps: Vec::new(),
        valid: true,
    };
    if obs.kf_id == base_kf {
        return sym;
    }
    let Some(tree) = state.spanning.tree(base_kf) else {
        sym.valid = false;
        return sym;
    };
    let mut v = obs.kf_id;
    while v != base_kf {
        let Some(e) = tree.get(&v) else {
            sym.valid = false;
            sym.steps.clear();
            return sym;
        };
        let edge = &state.k2k_edges()[e.pred_edge];
        sym.steps.push(PathStep {
            edge_id: e.pred_edge,
            forward: edge.from == v,
            frame: edge.to,
        });
        v = e.pred;
    }
    sym
}

/// Numeric Jacobian blocks for one optimization run.
pub struct JacobianData {
    /// One column per selected kf2kf-edge unknown; each column maps
    /// observation row to its `OBS_DIMS x DOF` block.
    pub dh_dap: Vec<BTreeMap<ObsIdx, DMatrix<f64>>>,
    /// One column per selected unknown landmark; blocks are
    /// `OBS_DIMS x LM_DIMS`.
    pub dh_df: Vec<BTreeMap<ObsIdx, DMatrix<f64>>>,
    /// Observations skipped because their tree path is unavailable.
    pub invalid: BTreeSet<ObsIdx>,
    /// Number of block Jacobians evaluated.
    pub num_jacobians: usize,
}

/// `T(base ← v)` from the numeric tree; identity when `v` is the root.
fn tree_pose<M: SensorModel>(
    state: &RbaState<M>,
    base: KeyframeId,
    v: KeyframeId,
) -> Option<M::Pose> {
    if v == base {
        return Some(M::Pose::identity());
    }
    let np = state.spanning.numeric(base)?.get(&v)?;
    debug_assert!(!np.dirty, "numeric tree pose read while dirty");
    Some(np.pose.clone())
}

/// Landmark position in its base frame.
fn landmark_pos<M: SensorModel>(state: &RbaState<M>, lm: LandmarkId) -> DVector<f64> {
    state
        .landmark(lm)
        .expect("observation references a created landmark")
        .0
        .pos
        .clone()
}

/// Compose `T(obs ← base)` along the symbolic path from the current edge
/// poses, optionally substituting a perturbed pose for one edge. Used by
/// the finite-difference evaluation, which must not depend on the cached
/// numeric trees.
pub fn compose_path_pose<M: SensorModel>(
    state: &RbaState<M>,
    sym: &ObsSymbolic,
    perturbed: Option<(EdgeId, &M::Pose)>,
) -> M::Pose {
    let mut acc = M::Pose::identity();
    for step in &sym.steps {
        let edge = &state.k2k_edges()[step.edge_id];
        let pose = match perturbed {
            Some((id, p)) if id == step.edge_id => p.clone(),
            _ => edge.pose.clone(),
        };
        let oriented = if step.forward { pose } else { pose.inverse() };
        acc = acc.compose(&oriented);
    }
    acc
}

/// Residuals `r = z − h(·)` for the given observations. Requires the
/// numeric trees of every involved base keyframe to be clean. Returns the
/// residual map and the set of observations without a usable path.
pub fn compute_residuals<M: SensorModel>(
    state: &RbaState<M>,
    symbolic: &[ObsSymbolic],
    sensor_pose: Option<&M::Pose>,
    params: &M::Params,
) -> (BTreeMap<ObsIdx, DVector<f64>>, BTreeSet<ObsIdx>) {
    let mut residuals = BTreeMap::new();
    let mut invalid = BTreeSet::new();
    for sym in symbolic {
        let pose = if sym.valid {
            tree_pose(state, sym.base_kf, sym.obs_kf)
        } else {
            None
        };
        let Some(t_base_obs) = pose else {
            invalid.insert(sym.obs_idx);
            continue;
        };
        let t_obs_base = t_base_obs.inverse();
        let f = landmark_pos(state, sym.lm_id);
        let predicted = M::predict(&t_obs_base, &f, sensor_pose, params);
        let z = &state.observations()[sym.obs_idx].z;
        residuals.insert(sym.obs_idx, z - predicted);
    }
    (residuals, invalid)
}

/// Evaluate all block Jacobians for the given observation set.
///
/// `edge_cols` and `lm_cols` map each selected unknown to its column.
/// Observations touching none of the unknowns still pass through here
/// when selected; they simply produce no blocks. With `numeric` set the
/// analytic expressions are replaced by central finite differences
/// (ε = 1e-6) over the same symbolic structure.
#[allow(clippy::too_many_arguments)]
pub fn recompute_jacobians<M: SensorModel>(
    state: &RbaState<M>,
    symbolic: &[ObsSymbolic],
    edge_cols: &BTreeMap<EdgeId, usize>,
    lm_cols: &BTreeMap<LandmarkId, usize>,
    sensor_pose: Option<&M::Pose>,
    params: &M::Params,
    numeric: bool,
) -> JacobianData {
    let mut data = JacobianData {
        dh_dap: vec![BTreeMap::new(); edge_cols.len()],
        dh_df: vec![BTreeMap::new(); lm_cols.len()],
        invalid: BTreeSet::new(),
        num_jacobians: 0,
    };

    for sym in symbolic {
        let pose = if sym.valid {
            tree_pose(state, sym.base_kf, sym.obs_kf)
        } else {
            None
        };
        let Some(t_base_obs) = pose else {
            data.invalid.insert(sym.obs_idx);
            continue;
        };
        let t_obs_base = t_base_obs.inverse();
        let f = landmark_pos(state, sym.lm_id);

        if numeric {
            numeric_blocks::<M>(state, sym, &f, sensor_pose, params, edge_cols, lm_cols, &mut data);
            continue;
        }

        // Shared left factor: sensor point Jacobian at the predicted
        // point, with the mounting rotation folded in.
        let in_robot = t_obs_base.transform_point(&f);
        let (in_sensor, rot_mount_inv) = match sensor_pose {
            Some(s) => {
                let s_inv = s.inverse();
                (s_inv.transform_point(&in_robot), Some(s_inv.rotation()))
            }
            None => (in_robot, None),
        };
        let j_obs = match rot_mount_inv {
            Some(rot) => M::point_jacobian(&in_sensor, params) * rot,
            None => M::point_jacobian(&in_sensor, params),
        };

        for step in &sym.steps {
            let Some(col) = edge_cols.get(&step.edge_id) else {
                continue;
            };
            let t_base_t = tree_pose(state, sym.base_kf, step.frame)
                .expect("on-path frame is in the base tree");
            let x_t = t_base_t.inverse().transform_point(&f);
            let t_obs_t = t_obs_base.compose(&t_base_t);
            let sign = if step.forward { 1.0 } else { -1.0 };
            let block = &j_obs * t_obs_t.rotation() * M::Pose::point_action_jacobian(&x_t) * sign;
            data.dh_dap[*col].insert(sym.obs_idx, block);
            data.num_jacobians += 1;
        }

        if !sym.lm_is_known
            && let Some(col) = lm_cols.get(&sym.lm_id)
        {
            let block = &j_obs * t_obs_base.rotation();
            data.dh_df[*col].insert(sym.obs_idx, block);
            data.num_jacobians += 1;
        }
    }
    data
}

/// Finite-difference twins of the analytic blocks (diagnostic path).
#[allow(clippy::too_many_arguments)]
fn numeric_blocks<M: SensorModel>(
    state: &RbaState<M>,
    sym: &ObsSymbolic,
    f: &DVector<f64>,
    sensor_pose: Option<&M::Pose>,
    params: &M::Params,
    edge_cols: &BTreeMap<EdgeId, usize>,
    lm_cols: &BTreeMap<LandmarkId, usize>,
    data: &mut JacobianData,
) {
    const EPS: f64 = 1e-6;
    let dof = <M::Pose as RelativePose>::DOF;

    let mut on_path_cols: BTreeSet<EdgeId> = BTreeSet::new();
    for step in &sym.steps {
        if !edge_cols.contains_key(&step.edge_id) || !on_path_cols.insert(step.edge_id) {
            continue;
        }
        let col = edge_cols[&step.edge_id];
        let edge_pose = state.k2k_edges()[step.edge_id].pose.clone();
        let mut block = DMatrix::zeros(M::OBS_DIMS, dof);
        for d in 0..dof {
            let mut delta = DVector::zeros(dof);
            delta[d] = EPS;
            let plus_pose = edge_pose.compose(&M::Pose::exp(&delta));
            delta[d] = -EPS;
            let minus_pose = edge_pose.compose(&M::Pose::exp(&delta));

            let h_plus = M::predict(
                &compose_path_pose(state, sym, Some((step.edge_id, &plus_pose))),
                f,
                sensor_pose,
                params,
            );
            let h_minus = M::predict(
                &compose_path_pose(state, sym, Some((step.edge_id, &minus_pose))),
                f,
                sensor_pose,
                params,
            );
            let fd = (h_plus - h_minus) / (2.0 * EPS);
            block.set_column(d, &fd);
        }
        data.dh_dap[col].insert(sym.obs_idx, block);
        data.num_jacobians += 1;
    }

    if !sym.lm_is_known
        && let Some(col) = lm_cols.get(&sym.lm_id)
    {
        let t_obs_base = compose_path_pose(state, sym, None);
        let mut block = DMatrix::zeros(M::OBS_DIMS, M::LM_DIMS);
        for d in 0..M::LM_DIMS {
            let mut fp = f.clone();
            fp[d] += EPS;
            let h_plus = M::predict(&t_obs_base, &fp, sensor_pose, params);
            fp[d] -= 2.0 * EPS;
            let h_minus = M::predict(&t_obs_base, &fp, sensor_pose, params);
            block.set_column(d, &((h_plus - h_minus) / (2.0 * EPS)));
        }
        data.dh_df[*col].insert(sym.obs_idx, block);
        data.num_jacobians += 1;
    }
}
