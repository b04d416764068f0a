//! The simplest edge-creation policy: a linear keyframe chain.

use crate::core::state::{KeyframeId, NewKfObservation, RbaState};
use crate::core::{CoreError, CoreResult};
use crate::manifold::RelativePose;
use crate::models::SensorModel;
use crate::policies::{EdgeCreationPolicy, EdgeKind, NewEdgeProposal};
use crate::solver::RbaParameters;

/// Connect every new keyframe to its predecessor with a single edge,
/// producing a linear graph (the relative-SLAM equivalent of plain
/// odometry). The initial relative pose is the identity; callers with an
/// odometry estimate can refine it afterwards through
/// `RbaEngine::set_kf2kf_edge_pose`.
#[derive(Debug, Clone, Default)]
pub struct LinearGraph;

impl<M: SensorModel> EdgeCreationPolicy<M> for LinearGraph {
    fn determine_edges(
        &mut self,
        new_kf: KeyframeId,
        _observations: &[NewKfObservation],
        _state: &RbaState<M>,
        _params: &RbaParameters,
    ) -> CoreResult<Vec<NewEdgeProposal<M::Pose>>> {
        if new_kf == 0 {
            return Err(CoreError::InconsistentGraph(
                "linear-graph policy invoked for the first keyframe".to_string(),
            ));
        }
        Ok(vec![NewEdgeProposal {
            from: new_kf - 1,
            to: new_kf,
            init_pose: M::Pose::identity(),
            kind: EdgeKind::Regular,
            has_init_guess: false,
        }])
    }
}
