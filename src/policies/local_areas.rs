//! Submap-based edge creation: local areas of a fixed number of
//! keyframes, with vote-driven loop closures between area centers.
//!
//! Keyframes are partitioned into consecutive submaps of `submap_size`
//! keyframes; the first keyframe of each submap is its *center*. A
//! regular keyframe links to its own center. When the observations
//! arriving with a new keyframe re-sight landmarks based in a remote
//! area that is topologically distant (beyond what the bounded spanning
//! trees can relate), and the evidence is strong enough
//! (`min_obs_to_loop_closure` shared observations), a loop-closure edge
//! between the two area centers is proposed.

use crate::core::state::{KeyframeId, NewKfObservation, RbaState};
use crate::core::{CoreError, CoreResult};
use crate::manifold::RelativePose;
use crate::models::SensorModel;
use crate::policies::{EdgeCreationPolicy, EdgeKind, NewEdgeProposal};
use crate::solver::RbaParameters;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// The fixed-size local-areas policy.
#[derive(Debug, Clone)]
pub struct LocalAreasFixedSize {
    /// Number of keyframes per submap.
    pub submap_size: usize,
    /// Minimum shared observations before a loop-closure edge is created.
    pub min_obs_to_loop_closure: usize,
    /// Keyframes touched by the edges of the previous step, used to seed
    /// loop-closure initial guesses from the numeric spanning trees.
    last_touched_kfs: BTreeSet<KeyframeId>,
}

impl Default for LocalAreasFixedSize {
    fn default() -> Self {
        LocalAreasFixedSize {
            submap_size: 15,
            min_obs_to_loop_closure: 4,
            last_touched_kfs: BTreeSet::new(),
        }
    }
}

impl LocalAreasFixedSize {
    pub fn new(submap_size: usize, min_obs_to_loop_closure: usize) -> Self {
        LocalAreasFixedSize {
            submap_size,
            min_obs_to_loop_closure,
            last_touched_kfs: BTreeSet::new(),
        }
    }

    fn center_of(&self, kf: KeyframeId) -> KeyframeId {
        self.submap_size * (kf / self.submap_size)
    }

    /// Best-effort initial guess for a loop-closure edge
    /// `T(from ← to)`, read from `from`'s numeric spanning tree.
    fn loop_closure_guess<M: SensorModel>(
        &self,
        state: &RbaState<M>,
        from: KeyframeId,
        to: KeyframeId,
        prev_kf: Option<KeyframeId>,
    ) -> Option<M::Pose> {
        if !self.last_touched_kfs.contains(&from) {
            return None;
        }
        let tree = state.spanning.numeric(from)?;
        if let Some(np) = tree.get(&to) {
            return Some(np.pose.clone());
        }
        // The previous keyframe usually sits next to the current center;
        // its pose is an acceptable seed.
        prev_kf.and_then(|p| tree.get(&p)).map(|np| np.pose.clone())
    }
}

impl<M: SensorModel> EdgeCreationPolicy<M> for LocalAreasFixedSize {
    fn determine_edges(
        &mut self,
        new_kf: KeyframeId,
        observations: &[NewKfObservation],
        state: &RbaState<M>,
        params: &RbaParameters,
    ) -> CoreResult<Vec<NewEdgeProposal<M::Pose>>> {
        if new_kf == 0 {
            return Err(CoreError::InconsistentGraph(
                "edge-creation policy invoked for the first keyframe".to_string(),
            ));
        }
        let current_center = self.center_of(new_kf);
        // A loop closure only makes sense past the reach of the bounded
        // trees.
        let min_dist_for_loop_closure = params.max_tree_depth + 1;

        // Vote per remote area: how many of the incoming observations
        // re-sight landmarks based in it.
        let mut votes: BTreeMap<KeyframeId, usize> = BTreeMap::new();
        for obs in observations {
            if let Some((entry, _)) = state.landmark(obs.lm_id) {
                *votes.entry(self.center_of(entry.base_kf)).or_default() += 1;
            }
        }
        let mut voted: Vec<(usize, KeyframeId)> =
            votes.into_iter().map(|(area, n)| (n, area)).collect();
        voted.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut proposals: Vec<NewEdgeProposal<M::Pose>> = Vec::new();

        // Regular keyframes always link to their own area center. A new
        // area center instead links through the vote loop below.
        if current_center != new_kf {
            proposals.push(NewEdgeProposal {
                from: current_center,
                to: new_kf,
                init_pose: M::Pose::identity(),
                kind: EdgeKind::Regular,
                has_init_guess: false,
            });
        }

        for (num_obs, remote_center) in voted {
            if remote_center == current_center {
                continue;
            }
            let found_distance = state
                .spanning
                .distance(current_center, remote_center)
                .unwrap_or(usize::MAX);
            if found_distance < min_dist_for_loop_closure.saturating_sub(2) {
                // The two areas are already topologically related.
                debug!(
                    "[edge_creation_policy] skip {remote_center}->{current_center}: distance {found_distance}"
                );
                continue;
            }
            if num_obs < self.min_obs_to_loop_closure {
                debug!(
                    "[edge_creation_policy] skip {remote_center}->{current_center}: only {num_obs} shared observations"
                );
                continue;
            }
            let guess = self.loop_closure_guess(
                state,
                remote_center,
                current_center,
                new_kf.checked_sub(1),
            );
            let has_init_guess = guess.is_some();
            proposals.push(NewEdgeProposal {
                from: remote_center,
                to: current_center,
                init_pose: guess.unwrap_or_else(M::Pose::identity),
                kind: EdgeKind::LoopClosure,
                has_init_guess,
            });
        }

        if proposals.is_empty() {
            return Err(CoreError::InconsistentGraph(format!(
                "no linking keyframe found for new keyframe {new_kf} with a minimum of {} shared observations",
                self.min_obs_to_loop_closure
            )));
        }

        self.last_touched_kfs.clear();
        for p in &proposals {
            self.last_touched_kfs.insert(p.from);
            self.last_touched_kfs.insert(p.to);
        }

        if proposals.len() > 1 {
            info!(
                "[edge_creation_policy] loop closure for keyframe {new_kf}: {} edges",
                proposals.len()
            );
        }
        Ok(proposals)
    }

    fn reset(&mut self) {
        self.last_touched_kfs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::NewKfObservation;
    use crate::manifold::SE2;
    use crate::models::RangeBearing2D;
    use nalgebra::DVector;

    type State = RbaState<RangeBearing2D>;

    fn obs(lm: usize) -> NewKfObservation {
        NewKfObservation::new(lm, DVector::from_vec(vec![1.0, 0.0]))
    }

    #[test]
    fn test_regular_kf_links_to_center() {
        let mut st = State::new(3);
        for _ in 0..5 {
            st.alloc_keyframe();
        }
        let mut policy = LocalAreasFixedSize::new(4, 2);
        let params = RbaParameters::default();
        let proposals = policy.determine_edges(5, &[], &st, &params).unwrap();
        assert_eq!(proposals.len(), 1);
        // Center of KF 5 with submap size 4 is KF 4.
        assert_eq!(proposals[0].from, 4);
        assert_eq!(proposals[0].to, 5);
        assert_eq!(proposals[0].kind, EdgeKind::Regular);
    }

    #[test]
    fn test_loop_closure_on_shared_observations() {
        // Two areas of 2 keyframes; landmarks based in area 0 re-sighted
        // from the start of area 2, far beyond a depth-1 tree.
        let mut st = State::new(1);
        for _ in 0..4 {
            st.alloc_keyframe();
        }
        for i in 0..3 {
            let e = st.alloc_kf2kf_edge(i, i + 1, SE2::identity()).unwrap();
            st.spanning_update_symbolic_new_node(i + 1, &[e]);
        }
        for lm in 0..3 {
            st.add_observation(
                0,
                &NewKfObservation::new(lm, DVector::from_vec(vec![1.0, 0.0]))
                    .with_unknown_position(DVector::from_vec(vec![1.0, 0.0])),
            )
            .unwrap();
        }

        let mut policy = LocalAreasFixedSize::new(2, 2);
        let params = RbaParameters::default().with_max_tree_depth(1);
        let incoming: Vec<_> = (0..3).map(obs).collect();
        let proposals = policy.determine_edges(4, &incoming, &st, &params).unwrap();

        // Regular edge to own center (KF 4 IS a center: 2*(4/2)=4), so
        // only the loop-closure edge is produced.
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].kind, EdgeKind::LoopClosure);
        assert_eq!(proposals[0].from, 0);
        assert_eq!(proposals[0].to, 4);
    }

    #[test]
    fn test_isolated_keyframe_rejected() {
        let mut st = State::new(3);
        st.alloc_keyframe();
        st.alloc_keyframe();
        let mut policy = LocalAreasFixedSize::new(2, 4);
        // KF 2 is a new area center with no qualifying votes.
        let err = policy
            .determine_edges(2, &[], &st, &RbaParameters::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::InconsistentGraph(_)));
    }
}
