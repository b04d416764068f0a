//! Problem state for relative bundle adjustment.
//!
//! This module holds the mutable heart of an RBA problem:
//! - [`state::RbaState`] — keyframes, keyframe-to-keyframe edges,
//!   observations and landmark maps, with BFS utilities;
//! - [`spanning_tree::SpanningTree`] — the bounded-depth shortest-path
//!   trees (symbolic structure plus lazily refreshed composed poses).

pub mod spanning_tree;
pub mod state;

use thiserror::Error;
use tracing::error;

pub use spanning_tree::{NumericPose, SpanTreeEntry, SpanningTree};
pub use state::{
    BfsVisitor, EdgeId, Kf2KfEdge, KeyframeId, LandmarkEntry, LandmarkId, NewKfObservation,
    ObsIdx, Observation, RbaState,
};

/// Errors raised while mutating or querying the problem state.
///
/// The first four variants are fatal: the mutating operation that raises
/// them aborts without touching the state.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A keyframe, landmark or edge id out of range
    #[error("{kind} id {id} out of range")]
    InvalidId { kind: &'static str, id: usize },

    /// A landmark declared known-position more than once
    #[error("landmark {0} declared known-position more than once")]
    DuplicateKnownLandmark(usize),

    /// First observation of an unknown-position landmark without an
    /// initial relative-position guess
    #[error("first observation of landmark {0} carries no initial relative-position guess")]
    MissingInitialGuess(usize),

    /// An edge or observation referencing keyframes that cannot be linked
    #[error("inconsistent graph: {0}")]
    InconsistentGraph(String),

    /// Vector or matrix with the wrong number of components
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with a source error from a third-party
    /// library, then return self for chaining.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for problem-state operations.
pub type CoreResult<T> = Result<T, CoreError>;
