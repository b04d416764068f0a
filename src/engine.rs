//! The RBA engine: the public façade over the problem state, the
//! spanning trees, the edge-creation policy and the local-area optimizer.
//!
//! The normal entry point is [`RbaEngine::define_new_keyframe`]: append a
//! keyframe with its observations, let the policy introduce the edges,
//! keep the spanning trees current, and optimize the local area around
//! the new keyframe. All mutating operations must be externally
//! serialized; read-only queries may run concurrently with each other.

use crate::core::state::{
    BfsVisitor, EdgeId, Kf2KfEdge, KeyframeId, LandmarkId, NewKfObservation, ObsIdx, Observation,
    RbaState,
};
use crate::core::CoreError;
use crate::error::RelbaResult;
use crate::manifold::RelativePose;
use crate::models::{IdentityNoise, ObservationNoise, SensorModel};
use crate::policies::{EdgeCreationPolicy, EdgeKind, LocalAreasFixedSize};
use crate::solver::{self, OptimizeReport, RbaParameters};
use nalgebra::DVector;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Information about one edge created alongside a new keyframe.
#[derive(Debug, Clone)]
pub struct NewEdgeInfo {
    pub edge_id: EdgeId,
    pub from: KeyframeId,
    pub to: KeyframeId,
    pub kind: EdgeKind,
    /// Whether the initial relative pose was an actual estimate rather
    /// than the identity placeholder.
    pub has_init_guess: bool,
}

/// Everything [`RbaEngine::define_new_keyframe`] reports back.
pub struct NewKeyframeInfo {
    pub kf_id: KeyframeId,
    pub created_edges: Vec<NewEdgeInfo>,
    /// Stage-1 (per new edge) optimization reports, in edge order.
    pub stage1_reports: Vec<OptimizeReport>,
    /// The joint local-area optimization report.
    pub report: Option<OptimizeReport>,
}

/// Options of [`RbaEngine::optimize_local_area`].
#[derive(Debug, Clone)]
pub struct OptimizeLocalAreaParams {
    /// Collect the kf2kf edges of the area as unknowns.
    pub optimize_k2k_edges: bool,
    /// Collect the area's unknown landmarks as unknowns.
    pub optimize_landmarks: bool,
    /// Stop the BFS at keyframes with an id above this bound.
    pub max_visitable_kf_id: KeyframeId,
    /// A landmark becomes an unknown on the observation that makes it
    /// seen this many times within the area.
    pub dont_optimize_landmarks_seen_less_than_n_times: usize,
}

impl Default for OptimizeLocalAreaParams {
    fn default() -> Self {
        OptimizeLocalAreaParams {
            optimize_k2k_edges: true,
            optimize_landmarks: true,
            max_visitable_kf_id: usize::MAX,
            dont_optimize_landmarks_seen_less_than_n_times: 2,
        }
    }
}

/// Collects the unknowns of a local area during the bounded BFS.
struct LocalAreaCollector {
    params: OptimizeLocalAreaParams,
    k2k_edges: Vec<EdgeId>,
    lm_ids: Vec<LandmarkId>,
    lm_times_seen: BTreeMap<LandmarkId, usize>,
}

impl<M: SensorModel> BfsVisitor<M> for LocalAreaCollector {
    fn visit_filter_kf(&mut self, kf: KeyframeId, _depth: usize) -> bool {
        kf <= self.params.max_visitable_kf_id
    }

    fn visit_k2k(
        &mut self,
        _from: KeyframeId,
        _to: KeyframeId,
        edge: &Kf2KfEdge<M::Pose>,
        _depth: usize,
    ) {
        if self.params.optimize_k2k_edges {
            self.k2k_edges.push(edge.id);
        }
    }

    fn visit_filter_k2f(&mut self, _kf: KeyframeId, _obs: &Observation, _depth: usize) -> bool {
        self.params.optimize_landmarks
    }

    fn visit_k2f(&mut self, _kf: KeyframeId, obs: &Observation, _depth: usize) {
        if obs.lm_is_known {
            return;
        }
        let count = self.lm_times_seen.entry(obs.lm_id).or_insert(0);
        *count += 1;
        // "==" so the landmark is added exactly once, on the visit that
        // crosses the threshold.
        if *count == self.params.dont_optimize_landmarks_seen_less_than_n_times {
            self.lm_ids.push(obs.lm_id);
        }
    }
}

/// A relative bundle adjustment problem and its optimizers.
///
/// Generic over the sensor model `M`, which fixes the pose, landmark and
/// observation dimensions. The edge-creation policy and observation
/// noise model are pluggable at construction:
///
/// ```
/// use relba::engine::RbaEngine;
/// use relba::models::RangeBearing2D;
/// use relba::policies::LinearGraph;
/// use relba::solver::RbaParameters;
///
/// let params = RbaParameters::new().with_max_tree_depth(3);
/// let engine = RbaEngine::<RangeBearing2D>::new(params)
///     .with_edge_policy(Box::new(LinearGraph));
/// ```
pub struct RbaEngine<M: SensorModel> {
    state: RbaState<M>,
    /// Engine and optimizer parameters. `max_tree_depth` is fixed at
    /// construction; changing it afterwards has no effect on the trees.
    pub parameters: RbaParameters,
    /// Sensor calibration handed to every projection.
    pub sensor_params: M::Params,
    /// Optional fixed sensor mounting pose on the robot.
    pub sensor_pose: Option<M::Pose>,
    noise: Box<dyn ObservationNoise>,
    policy: Box<dyn EdgeCreationPolicy<M>>,
    /// Scratch for `create_complete_spanning_tree` when the caller does
    /// not bring their own; guarded so concurrent readers with their own
    /// scratch are unaffected.
    complete_st_ws: Mutex<Vec<bool>>,
}

impl<M: SensorModel> RbaEngine<M> {
    pub fn new(parameters: RbaParameters) -> Self {
        let state = RbaState::new(parameters.max_tree_depth);
        RbaEngine {
            state,
            parameters,
            sensor_params: M::Params::default(),
            sensor_pose: None,
            noise: Box::new(IdentityNoise::default()),
            policy: Box::new(LocalAreasFixedSize::default()),
            complete_st_ws: Mutex::new(Vec::new()),
        }
    }

    pub fn with_edge_policy(mut self, policy: Box<dyn EdgeCreationPolicy<M>>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observation_noise(mut self, noise: Box<dyn ObservationNoise>) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_sensor_pose(mut self, sensor_pose: M::Pose) -> Self {
        self.sensor_pose = Some(sensor_pose);
        self
    }

    pub fn with_sensor_params(mut self, sensor_params: M::Params) -> Self {
        self.sensor_params = sensor_params;
        self
    }

    pub fn state(&self) -> &RbaState<M> {
        &self.state
    }

    /// Reset the entire problem to an empty state.
    pub fn clear(&mut self) {
        self.state.clear();
        self.policy.reset();
    }

    /// Append a new keyframe: run the edge-creation policy, allocate the
    /// edges, update the spanning trees, insert the observations, and
    /// (by default) optimize the local area around the new keyframe.
    ///
    /// Fatal observation errors are detected before anything is
    /// allocated, so a failed call leaves the problem untouched.
    pub fn define_new_keyframe(
        &mut self,
        observations: &[NewKfObservation],
        run_local_optimization: bool,
    ) -> RelbaResult<NewKeyframeInfo> {
        self.state.validate_observation_batch(observations)?;

        let new_kf = self.state.num_keyframes();
        let proposals = if new_kf == 0 {
            Vec::new()
        } else {
            self.policy
                .determine_edges(new_kf, observations, &self.state, &self.parameters)?
        };
        if new_kf > 0 && proposals.is_empty() {
            return Err(CoreError::InconsistentGraph(format!(
                "edge-creation policy produced no edges for keyframe {new_kf}"
            ))
            .log()
            .into());
        }
        for p in &proposals {
            for endpoint in [p.from, p.to] {
                if endpoint > new_kf {
                    return Err(CoreError::InconsistentGraph(format!(
                        "policy proposed an edge touching nonexistent keyframe {endpoint}"
                    ))
                    .log()
                    .into());
                }
            }
            if p.from == p.to {
                return Err(CoreError::InconsistentGraph(format!(
                    "policy proposed a self edge on keyframe {}",
                    p.from
                ))
                .log()
                .into());
            }
        }

        let kf_id = self.state.alloc_keyframe();
        debug_assert_eq!(kf_id, new_kf);

        let mut created_edges = Vec::with_capacity(proposals.len());
        let mut new_edge_ids = Vec::with_capacity(proposals.len());
        for p in proposals {
            let edge_id = self
                .state
                .alloc_kf2kf_edge(p.from, p.to, p.init_pose.clone())?;
            new_edge_ids.push(edge_id);
            created_edges.push(NewEdgeInfo {
                edge_id,
                from: p.from,
                to: p.to,
                kind: p.kind,
                has_init_guess: p.has_init_guess,
            });
        }
        self.state
            .spanning_update_symbolic_new_node(kf_id, &new_edge_ids);

        for obs in observations {
            self.state.add_observation(kf_id, obs)?;
        }

        info!(
            "defined keyframe {kf_id}: {} edges, {} observations",
            created_edges.len(),
            observations.len()
        );

        let mut info = NewKeyframeInfo {
            kf_id,
            created_edges,
            stage1_reports: Vec::new(),
            report: None,
        };
        if run_local_optimization && kf_id > 0 {
            if self.parameters.optimize_new_edges_alone {
                for edge in &info.created_edges {
                    let report = solver::optimize_edges(
                        &mut self.state,
                        &[edge.edge_id],
                        &[],
                        None,
                        &self.parameters,
                        &self.sensor_params,
                        self.sensor_pose.as_ref(),
                        self.noise.as_ref(),
                        self.parameters.use_robust_kernel_stage1,
                    )?;
                    debug!(
                        "stage-1 on edge {}: error {:.3e} -> {:.3e}",
                        edge.edge_id, report.total_sqr_error_init, report.total_sqr_error_final
                    );
                    info.stage1_reports.push(report);
                }
            }
            info.report = Some(self.optimize_local_area(
                kf_id,
                self.parameters.max_optimize_depth,
                &OptimizeLocalAreaParams::default(),
            )?);
        }
        Ok(info)
    }

    /// Insert one observation from an existing keyframe, outside the
    /// `define_new_keyframe` pipeline.
    pub fn add_observation(
        &mut self,
        observing_kf: KeyframeId,
        obs: &NewKfObservation,
    ) -> RelbaResult<ObsIdx> {
        Ok(self.state.add_observation(observing_kf, obs)?)
    }

    /// Overwrite the relative pose of an edge (e.g. with an odometry
    /// estimate) and flag the affected tree poses.
    pub fn set_kf2kf_edge_pose(&mut self, edge_id: EdgeId, pose: M::Pose) -> RelbaResult<()> {
        *self.state.k2k_edge_pose_mut(edge_id)? = pose;
        self.state.spanning_mark_dirty(edge_id);
        Ok(())
    }

    /// Least-squares optimization of all unknowns within `radius` hops
    /// of `root_kf`.
    pub fn optimize_local_area(
        &mut self,
        root_kf: KeyframeId,
        radius: usize,
        params: &OptimizeLocalAreaParams,
    ) -> RelbaResult<OptimizeReport> {
        let mut collector = LocalAreaCollector {
            params: params.clone(),
            k2k_edges: Vec::new(),
            lm_ids: Vec::new(),
            lm_times_seen: BTreeMap::new(),
        };
        self.state.bfs_visitor(root_kf, radius, &mut collector)?;
        debug!(
            "optimize_local_area around {root_kf} (radius {radius}): {} edges, {} landmarks",
            collector.k2k_edges.len(),
            collector.lm_ids.len()
        );
        let report = solver::optimize_edges(
            &mut self.state,
            &collector.k2k_edges,
            &collector.lm_ids,
            None,
            &self.parameters,
            &self.sensor_params,
            self.sensor_pose.as_ref(),
            self.noise.as_ref(),
            self.parameters.use_robust_kernel,
        )?;
        Ok(report)
    }

    /// Optimize an explicit set of unknowns (mostly a debugging and
    /// testing entry point; `optimize_local_area` is the normal path).
    pub fn optimize_edges(
        &mut self,
        k2k_edges: &[EdgeId],
        landmarks: &[LandmarkId],
        observation_indices: Option<&[ObsIdx]>,
    ) -> RelbaResult<OptimizeReport> {
        Ok(solver::optimize_edges(
            &mut self.state,
            k2k_edges,
            landmarks,
            observation_indices,
            &self.parameters,
            &self.sensor_params,
            self.sensor_pose.as_ref(),
            self.noise.as_ref(),
            self.parameters.use_robust_kernel,
        )?)
    }

    /// Sum of the squared (noise-weighted) residuals of every
    /// observation, evaluated through full shortest paths rather than the
    /// bounded trees. This may run long BFS searches between distant
    /// keyframes; worst case O(M·(V+E)).
    pub fn eval_overall_squared_error(&self) -> RelbaResult<f64> {
        let mut total = 0.0;
        for obs in self.state.observations() {
            let Some((entry, _)) = self.state.landmark(obs.lm_id) else {
                continue;
            };
            let Some(path) = self.state.find_path_bfs(obs.kf_id, entry.base_kf)? else {
                continue;
            };
            let mut pose = M::Pose::identity();
            for pair in path.windows(2) {
                let edge_id = self
                    .state
                    .edge_between(pair[0], pair[1])
                    .expect("BFS path follows edges");
                let edge = self.state.k2k_edge(edge_id)?;
                let step = if edge.from == pair[0] {
                    edge.pose.clone()
                } else {
                    edge.pose.inverse()
                };
                pose = pose.compose(&step);
            }
            let predicted = M::predict(&pose, &entry.pos, self.sensor_pose.as_ref(), &self.sensor_params);
            let r = &obs.z - predicted;
            total += self.noise.information(obs.obs_idx).squared_norm(&r);
        }
        Ok(total)
    }

    /// Ad-hoc spanning tree of composed poses from `root_id`, by plain
    /// BFS over the whole graph.
    ///
    /// `aux_ws` is an optional caller-owned scratch buffer: pass one to
    /// make concurrent calls from several reader threads safe. With
    /// `None` the engine's internal scratch is used and the call is
    /// non-reentrant.
    pub fn create_complete_spanning_tree(
        &self,
        root_id: KeyframeId,
        max_depth: usize,
        aux_ws: Option<&mut Vec<bool>>,
    ) -> RelbaResult<BTreeMap<KeyframeId, M::Pose>> {
        match aux_ws {
            Some(ws) => Ok(self.state.create_complete_spanning_tree(root_id, max_depth, Some(ws))?),
            None => {
                let mut guard = self.complete_st_ws.lock().expect("scratch lock poisoned");
                Ok(self
                    .state
                    .create_complete_spanning_tree(root_id, max_depth, Some(&mut guard))?)
            }
        }
    }

    /// Shortest undirected hop distance between two keyframes, read from
    /// the bounded spanning trees (None when beyond `max_tree_depth`).
    pub fn topological_distance(
        &self,
        from: KeyframeId,
        to: KeyframeId,
    ) -> Option<usize> {
        self.state.spanning.distance(from, to)
    }

    /// Shortest undirected path between two keyframes (full BFS).
    pub fn find_path_bfs(
        &self,
        src: KeyframeId,
        trg: KeyframeId,
    ) -> RelbaResult<Option<Vec<KeyframeId>>> {
        Ok(self.state.find_path_bfs(src, trg)?)
    }

    /// Export the whole keyframe graph (optionally with landmarks) in
    /// DOT format.
    pub fn save_graph_as_dot(
        &self,
        target: impl AsRef<Path>,
        all_landmarks: bool,
    ) -> RelbaResult<()> {
        crate::export::save_graph_as_dot(&self.state, target, all_landmarks)
    }

    /// Export the high-level structure of the map (keyframes with more
    /// than one kf2kf edge) in DOT format.
    pub fn save_graph_top_structure_as_dot(
        &self,
        target: impl AsRef<Path>,
        set_node_coordinates: bool,
    ) -> RelbaResult<()> {
        crate::export::save_graph_top_structure_as_dot(&self.state, target, set_node_coordinates)
    }

    /// Positions of the unknown landmarks, keyed by landmark id.
    pub fn unknown_landmark_positions(&self) -> BTreeMap<LandmarkId, DVector<f64>> {
        self.state
            .unknown_landmarks()
            .iter()
            .map(|(&id, e)| (id, e.pos.clone()))
            .collect()
    }
}
