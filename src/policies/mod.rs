//! Edge-creation policies: which kf2kf edges accompany a new keyframe.
//!
//! A policy only *proposes* edges; the engine validates the endpoints and
//! allocates them, so a policy bug surfaces as
//! [`crate::core::CoreError::InconsistentGraph`] instead of corrupt
//! state. Every new keyframe except the first must come back with at
//! least one proposal, otherwise the keyframe would be disconnected.

pub mod linear_graph;
pub mod local_areas;

use crate::core::state::{KeyframeId, NewKfObservation, RbaState};
use crate::core::CoreResult;
use crate::models::SensorModel;
use crate::solver::RbaParameters;

pub use linear_graph::LinearGraph;
pub use local_areas::LocalAreasFixedSize;

/// What kind of edge a proposal is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Ordinary odometry-like link.
    Regular,
    /// Link closing a topological loop between distant areas.
    LoopClosure,
    /// Link to an externally anchored keyframe.
    FixedBase,
}

/// One proposed kf2kf edge. `init_pose` is `T(from ← to)`;
/// `has_init_guess` says whether it is an actual estimate or just the
/// identity placeholder.
#[derive(Clone, Debug)]
pub struct NewEdgeProposal<P> {
    pub from: KeyframeId,
    pub to: KeyframeId,
    pub init_pose: P,
    pub kind: EdgeKind,
    pub has_init_guess: bool,
}

/// Strategy deciding which kf2kf edges accompany a new keyframe.
pub trait EdgeCreationPolicy<M: SensorModel>: Send {
    /// Propose the edges for `new_kf` (not yet allocated; its id equals
    /// the current keyframe count). `observations` are the measurements
    /// arriving with the keyframe.
    fn determine_edges(
        &mut self,
        new_kf: KeyframeId,
        observations: &[NewKfObservation],
        state: &RbaState<M>,
        params: &RbaParameters,
    ) -> CoreResult<Vec<NewEdgeProposal<M::Pose>>>;

    /// Forget any internal memory (called by `RbaEngine::clear`).
    fn reset(&mut self) {}
}
