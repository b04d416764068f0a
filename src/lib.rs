//! # relba
//!
//! A Rust library for **relative bundle adjustment** (RBA): SLAM-style
//! estimation where the unknowns are keyframe-to-keyframe relative poses
//! and landmark positions expressed in the frame of a *base* keyframe —
//! never in a single global frame.
//!
//! ## How it works
//!
//! - New sensor data arrives grouped into **keyframes**. A pluggable
//!   [edge-creation policy](policies) decides which relative-pose edges
//!   accompany each keyframe (submap links, loop closures).
//! - **Bounded-depth spanning trees** relate nearby keyframes: symbolic
//!   structure is maintained incrementally, composed poses are refreshed
//!   lazily through dirty flags.
//! - A **Schur-complement Levenberg-Marquardt** solver optimizes the
//!   unknowns of the local topological neighborhood: block Jacobians are
//!   assembled by walking tree paths, the landmark block is eliminated
//!   (it is block diagonal), and the reduced system goes to a Cholesky
//!   factorization.
//!
//! ## Features
//!
//! - **Generic over the sensor**: the [`models::SensorModel`] trait binds
//!   the pose, landmark and observation dimensions; 2-D range-bearing and
//!   3-D Cartesian models ship in the crate
//! - **SE(2) and SE(3)** relative-pose parameterizations
//! - **Robust estimation** with a pseudo-Huber kernel
//! - **Known and unknown landmarks**: fixed anchors contribute no
//!   unknowns
//! - **Diagnostics**: finite-difference Jacobian checking, condition
//!   numbers, sparsity statistics, DOT graph export
//!
//! ## Example
//!
//! ```no_run
//! use nalgebra::dvector;
//! use relba::engine::RbaEngine;
//! use relba::models::RangeBearing2D;
//! use relba::policies::LinearGraph;
//! use relba::solver::RbaParameters;
//! use relba::NewKfObservation;
//!
//! # fn main() -> Result<(), relba::RelbaError> {
//! let params = RbaParameters::new()
//!     .with_max_tree_depth(3)
//!     .with_max_optimize_depth(3);
//! let mut engine = RbaEngine::<RangeBearing2D>::new(params)
//!     .with_edge_policy(Box::new(LinearGraph));
//!
//! // First keyframe: landmarks enter with initial position guesses.
//! let obs = vec![
//!     NewKfObservation::new(0, dvector![1.41, 0.78])
//!         .with_unknown_position(dvector![1.0, 1.0]),
//! ];
//! let info = engine.define_new_keyframe(&obs, true)?;
//! println!("created keyframe {}", info.kf_id);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod export;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod models;
pub mod policies;
pub mod solver;
pub mod sparse;

pub use core::state::{EdgeId, KeyframeId, LandmarkId, NewKfObservation, ObsIdx};
pub use engine::{NewEdgeInfo, NewKeyframeInfo, OptimizeLocalAreaParams, RbaEngine};
pub use error::{RelbaError, RelbaResult};
pub use logger::{init_logger, init_logger_with_level, init_test_logger};
pub use manifold::{RelativePose, SE2, SE3};
pub use models::{IdentityNoise, ObservationNoise, SensorModel};
pub use policies::{EdgeCreationPolicy, EdgeKind, LinearGraph, LocalAreasFixedSize};
pub use solver::{CovRecovery, OptimizeReport, OptimizeStatus, RbaParameters};
