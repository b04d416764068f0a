//! The RBA problem state: keyframes, edges, observations and landmarks.
//!
//! Keyframes, keyframe-to-keyframe edges and observations live in arenas
//! indexed by dense sequential ids; cross-references are plain ids. The
//! undirected keyframe graph is mirrored in an adjacency list so BFS
//! queries run in O(V+E).

use crate::core::spanning_tree::SpanningTree;
use crate::core::{CoreError, CoreResult};
use crate::models::SensorModel;
use nalgebra::DVector;
use std::collections::{BTreeMap, VecDeque};

/// Dense keyframe id, assigned sequentially from 0.
pub type KeyframeId = usize;
/// Landmark id, chosen by the caller (data association is external).
pub type LandmarkId = usize;
/// Dense keyframe-to-keyframe edge id.
pub type EdgeId = usize;
/// Dense global observation index, assigned in creation order.
pub type ObsIdx = usize;

/// A keyframe-to-keyframe edge: a problem unknown.
///
/// `pose` is `T(from ← to)`, the pose of keyframe `to` expressed in the
/// frame of keyframe `from`.
#[derive(Clone)]
pub struct Kf2KfEdge<P> {
    pub id: EdgeId,
    pub from: KeyframeId,
    pub to: KeyframeId,
    pub pose: P,
}

/// One landmark observation (a kf2f edge). Immutable after insertion.
#[derive(Clone)]
pub struct Observation {
    pub obs_idx: ObsIdx,
    pub kf_id: KeyframeId,
    pub lm_id: LandmarkId,
    pub z: DVector<f64>,
    /// Cache of the landmark's known/unknown classification at insertion
    /// time (the classification is immutable, so this never goes stale).
    pub lm_is_known: bool,
}

/// A landmark position expressed relative to its base keyframe.
#[derive(Clone)]
pub struct LandmarkEntry {
    pub base_kf: KeyframeId,
    pub pos: DVector<f64>,
}

/// One observation handed to `define_new_keyframe`.
///
/// At the first sighting of a landmark exactly one of the two position
/// fields must be set: `fixed_position` creates a known-position landmark
/// (no unknowns), `unknown_position_init` creates an unknown-position
/// landmark seeded with the given guess. Later sightings must leave both
/// unset.
#[derive(Clone)]
pub struct NewKfObservation {
    pub lm_id: LandmarkId,
    pub z: DVector<f64>,
    pub fixed_position: Option<DVector<f64>>,
    pub unknown_position_init: Option<DVector<f64>>,
}

impl NewKfObservation {
    /// Observation of an already-created landmark.
    pub fn new(lm_id: LandmarkId, z: DVector<f64>) -> Self {
        NewKfObservation {
            lm_id,
            z,
            fixed_position: None,
            unknown_position_init: None,
        }
    }

    /// First observation of a landmark with a fixed, known position.
    pub fn with_known_position(mut self, pos: DVector<f64>) -> Self {
        self.fixed_position = Some(pos);
        self
    }

    /// First observation of an unknown landmark with an initial guess.
    pub fn with_unknown_position(mut self, init: DVector<f64>) -> Self {
        self.unknown_position_init = Some(init);
        self
    }
}

/// Visitor for [`RbaState::bfs_visitor`]: a breadth-first walk over the
/// keyframe graph (k2k edges drive the traversal) that also surfaces each
/// visited keyframe's observations (k2f edges).
///
/// `filter_*` methods gate what is visited; returning `false` from
/// `visit_filter_kf` prunes the node and everything only reachable
/// through it.
pub trait BfsVisitor<M: SensorModel> {
    fn visit_filter_kf(&mut self, _kf: KeyframeId, _depth: usize) -> bool {
        true
    }
    fn visit_kf(&mut self, _kf: KeyframeId, _depth: usize) {}
    fn visit_filter_k2k(
        &mut self,
        _from: KeyframeId,
        _to: KeyframeId,
        _edge: &Kf2KfEdge<M::Pose>,
        _depth: usize,
    ) -> bool {
        true
    }
    fn visit_k2k(
        &mut self,
        _from: KeyframeId,
        _to: KeyframeId,
        _edge: &Kf2KfEdge<M::Pose>,
        _depth: usize,
    ) {
    }
    fn visit_filter_k2f(&mut self, _kf: KeyframeId, _obs: &Observation, _depth: usize) -> bool {
        true
    }
    fn visit_k2f(&mut self, _kf: KeyframeId, _obs: &Observation, _depth: usize) {}
}

/// All the mutable state of one RBA problem.
pub struct RbaState<M: SensorModel> {
    k2k_edges: Vec<Kf2KfEdge<M::Pose>>,
    /// Incident edge ids per keyframe, ascending.
    adjacency: Vec<Vec<EdgeId>>,
    observations: Vec<Observation>,
    obs_by_kf: Vec<Vec<ObsIdx>>,
    obs_by_lm: BTreeMap<LandmarkId, Vec<ObsIdx>>,
    known_lms: BTreeMap<LandmarkId, LandmarkEntry>,
    unknown_lms: BTreeMap<LandmarkId, LandmarkEntry>,
    /// The bounded-depth spanning trees, kept in sync by the engine.
    pub spanning: SpanningTree<M::Pose>,
}

impl<M: SensorModel> RbaState<M> {
    pub fn new(max_tree_depth: usize) -> Self {
        RbaState {
            k2k_edges: Vec::new(),
            adjacency: Vec::new(),
            observations: Vec::new(),
            obs_by_kf: Vec::new(),
            obs_by_lm: BTreeMap::new(),
            known_lms: BTreeMap::new(),
            unknown_lms: BTreeMap::new(),
            spanning: SpanningTree::new(max_tree_depth),
        }
    }

    /// Reset to an empty problem, keeping the configured tree depth.
    pub fn clear(&mut self) {
        let depth = self.spanning.max_depth();
        *self = RbaState::new(depth);
    }

    pub fn num_keyframes(&self) -> usize {
        self.adjacency.len()
    }

    pub fn num_k2k_edges(&self) -> usize {
        self.k2k_edges.len()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn k2k_edges(&self) -> &[Kf2KfEdge<M::Pose>] {
        &self.k2k_edges
    }

    pub fn k2k_edge(&self, id: EdgeId) -> CoreResult<&Kf2KfEdge<M::Pose>> {
        self.k2k_edges.get(id).ok_or(CoreError::InvalidId {
            kind: "edge",
            id,
        })
    }

    pub(crate) fn k2k_edge_pose_mut(&mut self, id: EdgeId) -> CoreResult<&mut M::Pose> {
        self.k2k_edges
            .get_mut(id)
            .map(|e| &mut e.pose)
            .ok_or(CoreError::InvalidId { kind: "edge", id })
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn observation(&self, idx: ObsIdx) -> CoreResult<&Observation> {
        self.observations.get(idx).ok_or(CoreError::InvalidId {
            kind: "observation",
            id: idx,
        })
    }

    /// Global observation indices taken from the given keyframe.
    pub fn observations_of_kf(&self, kf: KeyframeId) -> &[ObsIdx] {
        self.obs_by_kf.get(kf).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Global observation indices of the given landmark, in creation order.
    pub fn observations_of_landmark(&self, lm: LandmarkId) -> &[ObsIdx] {
        self.obs_by_lm.get(&lm).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn known_landmarks(&self) -> &BTreeMap<LandmarkId, LandmarkEntry> {
        &self.known_lms
    }

    pub fn unknown_landmarks(&self) -> &BTreeMap<LandmarkId, LandmarkEntry> {
        &self.unknown_lms
    }

    pub(crate) fn unknown_landmark_pos_mut(&mut self, lm: LandmarkId) -> CoreResult<&mut DVector<f64>> {
        self.unknown_lms
            .get_mut(&lm)
            .map(|e| &mut e.pos)
            .ok_or(CoreError::InvalidId { kind: "landmark", id: lm })
    }

    /// Landmark entry together with its known-position flag.
    pub fn landmark(&self, lm: LandmarkId) -> Option<(&LandmarkEntry, bool)> {
        self.known_lms
            .get(&lm)
            .map(|e| (e, true))
            .or_else(|| self.unknown_lms.get(&lm).map(|e| (e, false)))
    }

    /// Incident edge ids of a keyframe, ascending.
    pub fn incident_edges(&self, kf: KeyframeId) -> &[EdgeId] {
        self.adjacency.get(kf).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lowest-id edge joining the two keyframes, if any.
    pub fn edge_between(&self, a: KeyframeId, b: KeyframeId) -> Option<EdgeId> {
        self.incident_edges(a)
            .iter()
            .copied()
            .find(|&e| {
                let edge = &self.k2k_edges[e];
                (edge.from == a && edge.to == b) || (edge.from == b && edge.to == a)
            })
    }

    /// Append an empty keyframe. Runs in O(1).
    pub fn alloc_keyframe(&mut self) -> KeyframeId {
        let id = self.adjacency.len();
        self.adjacency.push(Vec::new());
        self.obs_by_kf.push(Vec::new());
        id
    }

    /// Create a keyframe-to-keyframe edge with the given initial relative
    /// pose. Does not touch the spanning trees; callers follow up with
    /// [`SpanningTree::update_symbolic_new_node`].
    pub fn alloc_kf2kf_edge(
        &mut self,
        from: KeyframeId,
        to: KeyframeId,
        init_pose: M::Pose,
    ) -> CoreResult<EdgeId> {
        let n = self.num_keyframes();
        if from >= n {
            return Err(CoreError::InvalidId { kind: "keyframe", id: from }.log());
        }
        if to >= n {
            return Err(CoreError::InvalidId { kind: "keyframe", id: to }.log());
        }
        if from == to {
            return Err(
                CoreError::InconsistentGraph(format!("self edge on keyframe {from}")).log(),
            );
        }
        let id = self.k2k_edges.len();
        self.k2k_edges.push(Kf2KfEdge {
            id,
            from,
            to,
            pose: init_pose,
        });
        self.adjacency[from].push(id);
        self.adjacency[to].push(id);
        Ok(id)
    }

    fn classify_new_observation(
        &self,
        obs: &NewKfObservation,
        batch_created: &BTreeMap<LandmarkId, bool>,
    ) -> CoreResult<bool> {
        if obs.z.len() != M::OBS_DIMS {
            return Err(CoreError::DimensionMismatch(format!(
                "observation of landmark {} has {} components, expected {}",
                obs.lm_id,
                obs.z.len(),
                M::OBS_DIMS
            )));
        }
        for pos in [&obs.fixed_position, &obs.unknown_position_init]
            .into_iter()
            .flatten()
        {
            if pos.len() != M::LM_DIMS {
                return Err(CoreError::DimensionMismatch(format!(
                    "landmark {} position has {} components, expected {}",
                    obs.lm_id,
                    pos.len(),
                    M::LM_DIMS
                )));
            }
        }
        if obs.fixed_position.is_some() && obs.unknown_position_init.is_some() {
            return Err(CoreError::InconsistentGraph(format!(
                "landmark {} declared both known and unknown",
                obs.lm_id
            )));
        }

        let existing = if self.known_lms.contains_key(&obs.lm_id) {
            Some(true)
        } else if self.unknown_lms.contains_key(&obs.lm_id) {
            Some(false)
        } else {
            batch_created.get(&obs.lm_id).copied()
        };

        match existing {
            Some(known) => {
                if obs.fixed_position.is_some() {
                    return Err(CoreError::DuplicateKnownLandmark(obs.lm_id));
                }
                if obs.unknown_position_init.is_some() {
                    return Err(CoreError::InconsistentGraph(format!(
                        "landmark {} re-supplied an initial position guess",
                        obs.lm_id
                    )));
                }
                Ok(known)
            }
            None => {
                if obs.fixed_position.is_some() {
                    Ok(true)
                } else if obs.unknown_position_init.is_some() {
                    Ok(false)
                } else {
                    Err(CoreError::MissingInitialGuess(obs.lm_id))
                }
            }
        }
    }

    /// Validate a whole observation batch against the current state
    /// without mutating anything. Used so `define_new_keyframe` can fail
    /// before allocating the keyframe.
    pub(crate) fn validate_observation_batch(&self, obs: &[NewKfObservation]) -> CoreResult<()> {
        let mut batch_created: BTreeMap<LandmarkId, bool> = BTreeMap::new();
        for o in obs {
            let known = self.classify_new_observation(o, &batch_created).map_err(CoreError::log)?;
            if o.fixed_position.is_some() || o.unknown_position_init.is_some() {
                batch_created.insert(o.lm_id, known);
            }
        }
        Ok(())
    }

    /// Create the landmark on its first sighting and append the
    /// observation. Returns the new observation's global index.
    ///
    /// Fatal errors (`InvalidId`, `DuplicateKnownLandmark`,
    /// `MissingInitialGuess`, `InconsistentGraph`) leave the state
    /// untouched.
    pub fn add_observation(
        &mut self,
        observing_kf: KeyframeId,
        obs: &NewKfObservation,
    ) -> CoreResult<ObsIdx> {
        if observing_kf >= self.num_keyframes() {
            return Err(CoreError::InvalidId {
                kind: "keyframe",
                id: observing_kf,
            }
            .log());
        }
        let known = self
            .classify_new_observation(obs, &BTreeMap::new())
            .map_err(CoreError::log)?;

        if let Some(pos) = &obs.fixed_position {
            self.known_lms.insert(
                obs.lm_id,
                LandmarkEntry {
                    base_kf: observing_kf,
                    pos: pos.clone(),
                },
            );
        } else if let Some(pos) = &obs.unknown_position_init {
            self.unknown_lms.insert(
                obs.lm_id,
                LandmarkEntry {
                    base_kf: observing_kf,
                    pos: pos.clone(),
                },
            );
        }

        let obs_idx = self.observations.len();
        self.observations.push(Observation {
            obs_idx,
            kf_id: observing_kf,
            lm_id: obs.lm_id,
            z: obs.z.clone(),
            lm_is_known: known,
        });
        self.obs_by_kf[observing_kf].push(obs_idx);
        self.obs_by_lm.entry(obs.lm_id).or_default().push(obs_idx);
        Ok(obs_idx)
    }

    /// Unconstrained breadth-first search for the shortest undirected
    /// path between two keyframes. Returns the node sequence from `src`
    /// to `trg` inclusive, or `None` if they are disconnected. Runs a
    /// full BFS (O(V+E)); the bounded spanning trees are not consulted.
    pub fn find_path_bfs(
        &self,
        src: KeyframeId,
        trg: KeyframeId,
    ) -> CoreResult<Option<Vec<KeyframeId>>> {
        let n = self.num_keyframes();
        for id in [src, trg] {
            if id >= n {
                return Err(CoreError::InvalidId { kind: "keyframe", id }.log());
            }
        }
        if src == trg {
            return Ok(Some(vec![src]));
        }
        let mut pred: Vec<Option<KeyframeId>> = vec![None; n];
        let mut visited = vec![false; n];
        visited[src] = true;
        let mut queue = VecDeque::from([src]);
        while let Some(u) = queue.pop_front() {
            for &e in &self.adjacency[u] {
                let edge = &self.k2k_edges[e];
                let v = if edge.from == u { edge.to } else { edge.from };
                if !visited[v] {
                    visited[v] = true;
                    pred[v] = Some(u);
                    if v == trg {
                        let mut path = vec![trg];
                        let mut cur = trg;
                        while let Some(p) = pred[cur] {
                            path.push(p);
                            cur = p;
                        }
                        path.reverse();
                        return Ok(Some(path));
                    }
                    queue.push_back(v);
                }
            }
        }
        Ok(None)
    }

    /// Symbolic spanning-tree maintenance after `new_kf` and its
    /// accompanying edges were allocated.
    pub fn spanning_update_symbolic_new_node(&mut self, new_kf: KeyframeId, new_edges: &[EdgeId]) {
        self.spanning
            .update_symbolic_new_node(&self.k2k_edges, &self.adjacency, new_kf, new_edges);
    }

    /// Flag every composed tree pose whose path crosses the given edge.
    pub fn spanning_mark_dirty(&mut self, edge_id: EdgeId) {
        self.spanning.mark_dirty(edge_id);
    }

    /// Refresh the dirty composed poses of the given tree roots. Returns
    /// the number of poses recomputed.
    pub fn spanning_update_numeric(&mut self, roots: &std::collections::BTreeSet<KeyframeId>) -> usize {
        self.spanning.update_numeric(&self.k2k_edges, roots)
    }

    /// Ad-hoc spanning tree of composed poses from `root`, by plain BFS
    /// over the whole graph (the cached bounded trees are not used).
    ///
    /// `ws` is an optional caller-supplied visited buffer: passing one
    /// makes the call safe to run from several reader threads at once.
    /// With `None` a transient buffer is allocated.
    pub fn create_complete_spanning_tree(
        &self,
        root: KeyframeId,
        max_depth: usize,
        ws: Option<&mut Vec<bool>>,
    ) -> CoreResult<BTreeMap<KeyframeId, M::Pose>> {
        if root >= self.num_keyframes() {
            return Err(CoreError::InvalidId { kind: "keyframe", id: root }.log());
        }
        let mut local = Vec::new();
        let ws = ws.unwrap_or(&mut local);
        Ok(SpanningTree::create_complete_spanning_tree(
            &self.k2k_edges,
            &self.adjacency,
            root,
            max_depth,
            ws,
        ))
    }

    /// Breadth-first walk from `root` up to `max_depth` hops, driving the
    /// given visitor. Only k2k edges extend the frontier; each keyframe,
    /// edge and observation is surfaced at most once.
    pub fn bfs_visitor<V: BfsVisitor<M>>(
        &self,
        root: KeyframeId,
        max_depth: usize,
        visitor: &mut V,
    ) -> CoreResult<()> {
        if root >= self.num_keyframes() {
            return Err(CoreError::InvalidId { kind: "keyframe", id: root }.log());
        }
        let mut kf_seen = vec![false; self.num_keyframes()];
        let mut edge_seen = vec![false; self.k2k_edges.len()];

        if !visitor.visit_filter_kf(root, 0) {
            return Ok(());
        }
        kf_seen[root] = true;
        visitor.visit_kf(root, 0);
        for &oi in &self.obs_by_kf[root] {
            let obs = &self.observations[oi];
            if visitor.visit_filter_k2f(root, obs, 0) {
                visitor.visit_k2f(root, obs, 0);
            }
        }

        let mut queue = VecDeque::from([(root, 0usize)]);
        while let Some((u, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for &e in &self.adjacency[u] {
                let edge = &self.k2k_edges[e];
                let v = if edge.from == u { edge.to } else { edge.from };
                if !edge_seen[e] {
                    edge_seen[e] = true;
                    if visitor.visit_filter_k2k(u, v, edge, depth + 1) {
                        visitor.visit_k2k(u, v, edge, depth + 1);
                    }
                }
                if !kf_seen[v] && visitor.visit_filter_kf(v, depth + 1) {
                    kf_seen[v] = true;
                    visitor.visit_kf(v, depth + 1);
                    for &oi in &self.obs_by_kf[v] {
                        let obs = &self.observations[oi];
                        if visitor.visit_filter_k2f(v, obs, depth + 1) {
                            visitor.visit_k2f(v, obs, depth + 1);
                        }
                    }
                    queue.push_back((v, depth + 1));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{RelativePose, SE2};
    use crate::models::RangeBearing2D;

    type State = RbaState<RangeBearing2D>;

    fn z() -> DVector<f64> {
        DVector::from_vec(vec![1.0, 0.1])
    }

    fn lm_pos() -> DVector<f64> {
        DVector::from_vec(vec![1.0, 0.0])
    }

    #[test]
    fn test_dense_ids() {
        let mut st = State::new(4);
        for expected in 0..5 {
            assert_eq!(st.alloc_keyframe(), expected);
        }
        for i in 0..4 {
            let e = st.alloc_kf2kf_edge(i, i + 1, SE2::identity()).unwrap();
            assert_eq!(e, i);
        }
        for i in 0..3 {
            let idx = st
                .add_observation(i, &NewKfObservation::new(i, z()).with_unknown_position(lm_pos()))
                .unwrap();
            assert_eq!(idx, i);
        }
    }

    #[test]
    fn test_alloc_edge_rejects_bad_ids() {
        let mut st = State::new(4);
        st.alloc_keyframe();
        assert!(matches!(
            st.alloc_kf2kf_edge(0, 3, SE2::identity()),
            Err(CoreError::InvalidId { .. })
        ));
        assert!(matches!(
            st.alloc_kf2kf_edge(0, 0, SE2::identity()),
            Err(CoreError::InconsistentGraph(_))
        ));
    }

    #[test]
    fn test_duplicate_known_landmark_rejected() {
        let mut st = State::new(4);
        st.alloc_keyframe();
        st.alloc_keyframe();
        st.add_observation(0, &NewKfObservation::new(7, z()).with_known_position(lm_pos()))
            .unwrap();
        let err = st
            .add_observation(1, &NewKfObservation::new(7, z()).with_known_position(lm_pos()))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKnownLandmark(7)));
        // State untouched by the failed call
        assert_eq!(st.num_observations(), 1);
    }

    #[test]
    fn test_missing_initial_guess_rejected() {
        let mut st = State::new(4);
        st.alloc_keyframe();
        let err = st
            .add_observation(0, &NewKfObservation::new(1, z()))
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingInitialGuess(1)));
        assert_eq!(st.num_observations(), 0);
    }

    #[test]
    fn test_find_path_bfs_chain() {
        let mut st = State::new(4);
        for _ in 0..4 {
            st.alloc_keyframe();
        }
        for i in 0..3 {
            st.alloc_kf2kf_edge(i, i + 1, SE2::identity()).unwrap();
        }
        let path = st.find_path_bfs(0, 3).unwrap().unwrap();
        assert_eq!(path, vec![0, 1, 2, 3]);
        assert_eq!(st.find_path_bfs(2, 2).unwrap().unwrap(), vec![2]);
    }

    #[test]
    fn test_find_path_bfs_disconnected() {
        let mut st = State::new(4);
        st.alloc_keyframe();
        st.alloc_keyframe();
        assert!(st.find_path_bfs(0, 1).unwrap().is_none());
    }

    #[test]
    fn test_bfs_visitor_counts() {
        struct Counter {
            kfs: usize,
            edges: usize,
            obs: usize,
        }
        impl BfsVisitor<RangeBearing2D> for Counter {
            fn visit_kf(&mut self, _kf: KeyframeId, _d: usize) {
                self.kfs += 1;
            }
            fn visit_k2k(&mut self, _f: KeyframeId, _t: KeyframeId, _e: &Kf2KfEdge<SE2>, _d: usize) {
                self.edges += 1;
            }
            fn visit_k2f(&mut self, _kf: KeyframeId, _o: &Observation, _d: usize) {
                self.obs += 1;
            }
        }

        let mut st = State::new(4);
        for _ in 0..4 {
            st.alloc_keyframe();
        }
        for i in 0..3 {
            st.alloc_kf2kf_edge(i, i + 1, SE2::identity()).unwrap();
        }
        // A cycle-closing edge; must still be visited exactly once.
        st.alloc_kf2kf_edge(0, 3, SE2::identity()).unwrap();
        st.add_observation(1, &NewKfObservation::new(0, z()).with_unknown_position(lm_pos()))
            .unwrap();

        let mut c = Counter { kfs: 0, edges: 0, obs: 0 };
        st.bfs_visitor(0, 10, &mut c).unwrap();
        assert_eq!(c.kfs, 4);
        assert_eq!(c.edges, 4);
        assert_eq!(c.obs, 1);
    }
}
