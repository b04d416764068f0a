//! End-to-end tests for relba.
//!
//! The scenarios build small SE(2) range-bearing worlds with known ground
//! truth, feed them through the engine, and verify the optimizer recovers
//! the truth (or fails gracefully):
//!
//! - chain of 3 keyframes with perturbed relative poses
//! - loop closure between the two ends of a square trajectory
//! - known-position landmark anchoring
//! - divergent initialization (graceful non-convergence)
//! - bounded spanning-tree structure on a long chain
//! - analytic vs finite-difference Jacobians on SE(3)

use nalgebra::DVector;
use relba::core::state::RbaState;
use relba::engine::{OptimizeLocalAreaParams, RbaEngine};
use relba::manifold::{RelativePose, SE2, SE3};
use relba::models::{Cartesian3D, RangeBearing2D, SensorModel};
use relba::policies::{EdgeCreationPolicy, EdgeKind, LinearGraph, NewEdgeProposal};
use relba::solver::{OptimizeStatus, RbaParameters};
use relba::{KeyframeId, NewKfObservation};
use std::collections::BTreeMap;

/// Test policy proposing a scripted edge list per keyframe.
struct ScriptedPolicy {
    edges: BTreeMap<KeyframeId, Vec<(KeyframeId, KeyframeId)>>,
}

impl EdgeCreationPolicy<RangeBearing2D> for ScriptedPolicy {
    fn determine_edges(
        &mut self,
        new_kf: KeyframeId,
        _observations: &[NewKfObservation],
        _state: &RbaState<RangeBearing2D>,
        _params: &RbaParameters,
    ) -> relba::core::CoreResult<Vec<NewEdgeProposal<SE2>>> {
        Ok(self
            .edges
            .get(&new_kf)
            .into_iter()
            .flatten()
            .map(|&(from, to)| NewEdgeProposal {
                from,
                to,
                init_pose: SE2::identity(),
                kind: EdgeKind::Regular,
                has_init_guess: false,
            })
            .collect())
    }
}

fn se2(x: f64, y: f64, theta: f64) -> SE2 {
    SE2::from_xy_angle(x, y, theta)
}

/// Ground-truth observation of a world-frame landmark from a world-frame
/// keyframe pose.
fn observe(kf_pose: &SE2, lm_world: &DVector<f64>) -> DVector<f64> {
    let local = kf_pose.inverse().transform_point(lm_world);
    RangeBearing2D::project_point(&local, &Default::default())
}

/// Landmark position relative to its base keyframe.
fn rel_pos(base_pose: &SE2, lm_world: &DVector<f64>) -> DVector<f64> {
    base_pose.inverse().transform_point(lm_world)
}

/// True relative pose T(from <- to) between two world-frame poses.
fn true_edge(from: &SE2, to: &SE2) -> SE2 {
    from.inverse().compose(to)
}

/// Squared residual of one observation, evaluated through the shortest
/// path in the full graph (independent of the engine's bounded trees).
fn obs_sqr_residual(engine: &RbaEngine<RangeBearing2D>, obs_idx: usize) -> f64 {
    let st = engine.state();
    let obs = &st.observations()[obs_idx];
    let (entry, _) = st.landmark(obs.lm_id).unwrap();
    let path = st.find_path_bfs(obs.kf_id, entry.base_kf).unwrap().unwrap();
    let mut pose = SE2::identity();
    for w in path.windows(2) {
        let eid = st.edge_between(w[0], w[1]).unwrap();
        let edge = st.k2k_edge(eid).unwrap();
        let step = if edge.from == w[0] {
            edge.pose.clone()
        } else {
            edge.pose.inverse()
        };
        pose = pose.compose(&step);
    }
    let pred = RangeBearing2D::predict(&pose, &entry.pos, None, &Default::default());
    (&obs.z - pred).norm_squared()
}

// -------------------------------------------------------------------------
// Scenario: chain of 3 keyframes
// -------------------------------------------------------------------------

#[test]
fn test_chain_of_three_converges_to_truth() {
    relba::init_test_logger();
    let gt = [se2(0.0, 0.0, 0.0), se2(1.0, 0.0, 0.0), se2(2.0, 0.0, 0.0)];
    let lms: Vec<DVector<f64>> = [
        (0.5, 1.0),
        (1.0, -0.8),
        (1.5, 1.2),
        (2.0, -1.0),
        (2.5, 0.9),
        (3.0, -0.7),
    ]
    .iter()
    .map(|&(x, y)| DVector::from_vec(vec![x, y]))
    .collect();

    let params = RbaParameters::new()
        .with_max_tree_depth(4)
        .with_max_optimize_depth(3)
        .with_max_iters(50);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(LinearGraph));
    engine.parameters.max_error_per_obs_to_stop = 1e-18;

    // KF 0 creates landmarks 0..3, KF 1 re-sights them and creates 4..5,
    // KF 2 re-sights 2..5.
    let batch0: Vec<_> = (0..4)
        .map(|l| {
            NewKfObservation::new(l, observe(&gt[0], &lms[l]))
                .with_unknown_position(rel_pos(&gt[0], &lms[l]))
        })
        .collect();
    engine.define_new_keyframe(&batch0, false).unwrap();

    let mut batch1: Vec<_> = (0..4)
        .map(|l| NewKfObservation::new(l, observe(&gt[1], &lms[l])))
        .collect();
    batch1.extend((4..6).map(|l| {
        NewKfObservation::new(l, observe(&gt[1], &lms[l]))
            .with_unknown_position(rel_pos(&gt[1], &lms[l]))
    }));
    engine.define_new_keyframe(&batch1, false).unwrap();

    let batch2: Vec<_> = (2..6)
        .map(|l| NewKfObservation::new(l, observe(&gt[2], &lms[l])))
        .collect();
    engine.define_new_keyframe(&batch2, false).unwrap();

    // Perturb both relative poses by [0.05m, 0.05m, 0.02rad].
    let perturbation = DVector::from_vec(vec![0.05, 0.05, 0.02]);
    for e in 0..2 {
        let truth = true_edge(&gt[e], &gt[e + 1]);
        engine
            .set_kf2kf_edge_pose(e, truth.compose(&SE2::exp(&perturbation)))
            .unwrap();
    }

    let report = engine
        .optimize_local_area(2, 3, &OptimizeLocalAreaParams::default())
        .unwrap();

    assert_eq!(report.num_kf2kf_edges_optimized, 2);
    assert_eq!(report.num_landmarks_optimized, 6);
    assert!(report.total_sqr_error_final <= report.total_sqr_error_init);
    assert!(
        report.obs_rmse < 1e-6,
        "rmse {} not below 1e-6",
        report.obs_rmse
    );

    // The recovered relative poses match the ground truth.
    for e in 0..2 {
        let truth = true_edge(&gt[e], &gt[e + 1]);
        let est = &engine.state().k2k_edge(e).unwrap().pose;
        assert!(
            est.is_approx(&truth, 1e-5),
            "edge {e} did not return to truth"
        );
    }
}

// -------------------------------------------------------------------------
// Scenario: loop closure on a square trajectory
// -------------------------------------------------------------------------

/// Build the square-trajectory problem; with `loop_edge`, keyframe 4 is
/// additionally linked back to keyframe 0.
fn build_square(loop_edge: bool) -> RbaEngine<RangeBearing2D> {
    use std::f64::consts::FRAC_PI_2;
    let gt = [
        se2(0.0, 0.0, 0.0),
        se2(1.0, 0.0, FRAC_PI_2),
        se2(1.0, 1.0, 2.0 * FRAC_PI_2),
        se2(0.0, 1.0, 3.0 * FRAC_PI_2),
        se2(0.0, 0.0, 0.0),
    ];
    let shared: Vec<DVector<f64>> = [(0.5, 0.3), (-0.3, 0.4), (0.4, -0.5), (-0.2, -0.4)]
        .iter()
        .map(|&(x, y)| DVector::from_vec(vec![x, y]))
        .collect();
    // One pair of landmarks per chain edge, sighted by both endpoints.
    let middle: Vec<DVector<f64>> = (0..8)
        .map(|i| {
            let seg = i / 2;
            let off = if i % 2 == 0 { 0.4 } else { -0.4 };
            let base = &gt[seg];
            base.transform_point(&DVector::from_vec(vec![0.5, off]))
        })
        .collect();

    let mut edges: BTreeMap<KeyframeId, Vec<(KeyframeId, KeyframeId)>> =
        (1..5).map(|k| (k, vec![(k - 1, k)])).collect();
    if loop_edge {
        edges.get_mut(&4).unwrap().push((0, 4));
    }

    let params = RbaParameters::new()
        .with_max_tree_depth(3)
        .with_max_optimize_depth(5)
        .with_max_iters(60)
        .with_optimize_new_edges_alone(false);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(ScriptedPolicy { edges }));
    engine.parameters.max_error_per_obs_to_stop = 1e-18;

    // Deterministic pseudo-noise on the middle observations and a bias on
    // the middle landmark initializations, so the chain alone cannot
    // recover the truth.
    let noisy = |z: DVector<f64>, k: usize| {
        let s = if k % 2 == 0 { 1.0 } else { -1.0 };
        DVector::from_vec(vec![z[0] + s * 0.03, z[1] - s * 0.02])
    };

    for kf in 0..5usize {
        let mut batch = Vec::new();
        if kf == 0 {
            for (l, p) in shared.iter().enumerate() {
                batch.push(
                    NewKfObservation::new(l, observe(&gt[0], p))
                        .with_unknown_position(rel_pos(&gt[0], p)),
                );
            }
        }
        if kf == 4 {
            for (l, p) in shared.iter().enumerate() {
                batch.push(NewKfObservation::new(l, observe(&gt[4], p)));
            }
        }
        if kf < 4 {
            // This keyframe's own pair of middle landmarks.
            for j in 0..2 {
                let idx = kf * 2 + j;
                let lm_id = 100 + idx;
                batch.push(
                    NewKfObservation::new(lm_id, noisy(observe(&gt[kf], &middle[idx]), idx))
                        .with_unknown_position(
                            &rel_pos(&gt[kf], &middle[idx])
                                + DVector::from_vec(vec![0.05, -0.04]),
                        ),
                );
            }
        }
        if kf > 0 {
            // Re-sight the previous keyframe's pair.
            for j in 0..2 {
                let idx = (kf - 1) * 2 + j;
                let lm_id = 100 + idx;
                batch.push(NewKfObservation::new(
                    lm_id,
                    noisy(observe(&gt[kf], &middle[idx]), idx + 1),
                ));
            }
        }
        engine.define_new_keyframe(&batch, false).unwrap();
    }

    // Perturb the chain; the loop edge (when present) keeps its exact
    // relative pose.
    let perturbation = DVector::from_vec(vec![0.05, 0.05, 0.02]);
    for e in 0..4 {
        let truth = true_edge(&gt[e], &gt[e + 1]);
        engine
            .set_kf2kf_edge_pose(e, truth.compose(&SE2::exp(&perturbation)))
            .unwrap();
    }
    if loop_edge {
        let eid = engine.state().edge_between(0, 4).unwrap();
        engine
            .set_kf2kf_edge_pose(eid, true_edge(&gt[0], &gt[4]))
            .unwrap();
    }
    engine
}

#[test]
fn test_loop_closure_reduces_closure_residual() {
    relba::init_test_logger();
    let closure_error = |engine: &mut RbaEngine<RangeBearing2D>| {
        engine
            .optimize_local_area(4, 5, &OptimizeLocalAreaParams::default())
            .unwrap();
        let st = engine.state();
        let mut total = 0.0;
        for &oi in st.observations_of_kf(4) {
            if st.observations()[oi].lm_id < 100 {
                total += obs_sqr_residual(engine, oi);
            }
        }
        total
    };

    let without = closure_error(&mut build_square(false));
    let with = closure_error(&mut build_square(true));

    assert!(
        without >= 50.0 * with.max(1e-18),
        "closure residual {without:.3e} vs {with:.3e}: improvement below 50x"
    );
    assert!(with < 1e-10, "loop-closure case did not converge: {with:.3e}");
}

// -------------------------------------------------------------------------
// Scenario: known-position landmark anchor
// -------------------------------------------------------------------------

#[test]
fn test_known_landmark_anchors_the_solution() {
    let gt = [se2(0.0, 0.0, 0.0), se2(0.8, 0.2, 0.1)];
    let lms: Vec<DVector<f64>> = [(1.0, 0.5), (0.8, -0.6), (1.5, 0.4), (1.2, -0.3)]
        .iter()
        .map(|&(x, y)| DVector::from_vec(vec![x, y]))
        .collect();

    let params = RbaParameters::new()
        .with_max_tree_depth(3)
        .with_max_optimize_depth(3)
        .with_max_iters(50);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(LinearGraph));
    engine.parameters.max_error_per_obs_to_stop = 1e-18;

    // Landmark 0 has a fixed, known position; 1..3 start off the truth.
    let offset = DVector::from_vec(vec![0.1, -0.08]);
    let mut batch0 = vec![
        NewKfObservation::new(0, observe(&gt[0], &lms[0]))
            .with_known_position(rel_pos(&gt[0], &lms[0])),
    ];
    batch0.extend((1..4).map(|l| {
        NewKfObservation::new(l, observe(&gt[0], &lms[l]))
            .with_unknown_position(&rel_pos(&gt[0], &lms[l]) + &offset)
    }));
    engine.define_new_keyframe(&batch0, false).unwrap();

    let batch1: Vec<_> = (0..4)
        .map(|l| NewKfObservation::new(l, observe(&gt[1], &lms[l])))
        .collect();
    engine.define_new_keyframe(&batch1, false).unwrap();

    let truth_edge = true_edge(&gt[0], &gt[1]);
    engine
        .set_kf2kf_edge_pose(
            0,
            truth_edge.compose(&SE2::exp(&DVector::from_vec(vec![0.05, 0.05, 0.02]))),
        )
        .unwrap();

    let known_before = engine.state().known_landmarks()[&0].pos.clone();
    let report = engine
        .optimize_local_area(1, 3, &OptimizeLocalAreaParams::default())
        .unwrap();

    // The known landmark contributed no unknowns and is bit-identical.
    assert!(!report.optimized_landmarks.contains(&0));
    assert_eq!(engine.state().known_landmarks()[&0].pos, known_before);

    // The unknowns aligned to the ground truth.
    assert!(report.obs_rmse < 1e-7);
    for (l, lm_world) in lms.iter().enumerate().skip(1) {
        let est = &engine.state().unknown_landmarks()[&l].pos;
        let truth = rel_pos(&gt[0], lm_world);
        let diff_norm = (est - &truth).norm();
        assert!(
            diff_norm < 1e-5,
            "landmark {l} off truth by {}",
            diff_norm
        );
    }
}

// -------------------------------------------------------------------------
// Scenario: divergent initialization
// -------------------------------------------------------------------------

#[test]
fn test_divergent_initialization_reports_numeric_divergence() {
    relba::init_test_logger();
    let gt = [se2(0.0, 0.0, 0.0), se2(0.3, 0.0, 0.0)];
    let lms: Vec<DVector<f64>> = [(1.0, 0.5), (0.8, -0.6), (1.5, 0.4), (1.2, -0.3)]
        .iter()
        .map(|&(x, y)| DVector::from_vec(vec![x, y]))
        .collect();

    let params = RbaParameters::new()
        .with_max_tree_depth(3)
        .with_max_iters(200)
        .with_max_lambda(1e-6);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(LinearGraph));
    // Never declare convergence: the run must end in divergence.
    engine.parameters.max_error_per_obs_to_stop = 1e-300;

    let batch0: Vec<_> = (0..4)
        .map(|l| {
            NewKfObservation::new(l, observe(&gt[0], &lms[l]))
                .with_known_position(rel_pos(&gt[0], &lms[l]))
        })
        .collect();
    engine.define_new_keyframe(&batch0, false).unwrap();
    let batch1: Vec<_> = (0..4)
        .map(|l| NewKfObservation::new(l, observe(&gt[1], &lms[l])))
        .collect();
    engine.define_new_keyframe(&batch1, false).unwrap();

    // 10m / 10m / pi/2 away from the truth.
    engine
        .set_kf2kf_edge_pose(0, se2(10.3, 10.0, std::f64::consts::FRAC_PI_2))
        .unwrap();

    let report = engine
        .optimize_local_area(1, 3, &OptimizeLocalAreaParams::default())
        .unwrap();
    assert_eq!(report.status, OptimizeStatus::NumericDivergence);
    assert!(report.total_sqr_error_final.is_finite());

    // The problem is left at the last accepted state...
    let eval = engine.eval_overall_squared_error().unwrap();
    assert!(
        (eval - report.total_sqr_error_final).abs() < 1e-9 * (1.0 + eval),
        "reported final error does not match the retained state"
    );

    // ...and stays usable for further observations.
    engine
        .add_observation(1, &NewKfObservation::new(0, observe(&gt[1], &lms[0])))
        .unwrap();
    let info = engine
        .define_new_keyframe(
            &[NewKfObservation::new(0, observe(&gt[1], &lms[0]))],
            false,
        )
        .unwrap();
    assert_eq!(info.kf_id, 2);
}

// -------------------------------------------------------------------------
// Scenario: bounded spanning trees on a 20-keyframe chain
// -------------------------------------------------------------------------

#[test]
fn test_bounded_trees_on_long_chain() {
    let params = RbaParameters::new().with_max_tree_depth(3);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(LinearGraph));
    for _ in 0..20 {
        engine.define_new_keyframe(&[], false).unwrap();
    }

    let tree0: Vec<_> = engine
        .state()
        .spanning
        .tree(0)
        .unwrap()
        .keys()
        .copied()
        .collect();
    assert_eq!(tree0, vec![1, 2, 3]);

    let tree10: Vec<_> = engine
        .state()
        .spanning
        .tree(10)
        .unwrap()
        .keys()
        .copied()
        .collect();
    assert_eq!(tree10, vec![7, 8, 9, 11, 12, 13]);

    // Distances equal the undirected BFS hop counts capped at the depth.
    for (v, entry) in engine.state().spanning.tree(10).unwrap() {
        assert_eq!(entry.dist, 10usize.abs_diff(*v));
    }
}

// -------------------------------------------------------------------------
// Scenario: the full define_new_keyframe pipeline with stage-1 seeding
// -------------------------------------------------------------------------

#[test]
fn test_define_new_keyframe_pipeline() {
    relba::init_test_logger();
    let gt = [se2(0.0, 0.0, 0.0), se2(0.3, 0.05, 0.05), se2(0.6, 0.0, 0.0)];
    let lms: Vec<DVector<f64>> = [(0.8, 0.6), (0.7, -0.5), (1.2, 0.5), (1.1, -0.6)]
        .iter()
        .map(|&(x, y)| DVector::from_vec(vec![x, y]))
        .collect();

    let params = RbaParameters::new()
        .with_max_tree_depth(3)
        .with_max_optimize_depth(3)
        .with_max_iters(50);
    let mut engine = RbaEngine::<RangeBearing2D>::new(params)
        .with_edge_policy(Box::new(LinearGraph));
    engine.parameters.max_error_per_obs_to_stop = 1e-18;

    let batch0: Vec<_> = (0..4)
        .map(|l| {
            NewKfObservation::new(l, observe(&gt[0], &lms[l]))
                .with_unknown_position(rel_pos(&gt[0], &lms[l]))
        })
        .collect();
    engine.define_new_keyframe(&batch0, true).unwrap();

    for kf in 1..3 {
        let batch: Vec<_> = (0..4)
            .map(|l| NewKfObservation::new(l, observe(&gt[kf], &lms[l])))
            .collect();
        let info = engine.define_new_keyframe(&batch, true).unwrap();
        assert_eq!(info.created_edges.len(), 1);
        // Stage 1 ran on the new edge before the joint solve.
        assert_eq!(info.stage1_reports.len(), 1);
        let report = info.report.unwrap();
        assert!(report.total_sqr_error_final <= report.total_sqr_error_init);
        assert!(
            report.obs_rmse < 1e-6,
            "keyframe {kf}: rmse {} too high",
            report.obs_rmse
        );
    }

    // The optimized relative poses match the ground truth.
    for e in 0..2 {
        let truth = true_edge(&gt[e], &gt[e + 1]);
        assert!(engine.state().k2k_edge(e).unwrap().pose.is_approx(&truth, 1e-5));
    }
}

// -------------------------------------------------------------------------
// Scenario: SE(3) analytic vs finite-difference Jacobians
// -------------------------------------------------------------------------

#[test]
fn test_se3_analytic_matches_numeric_jacobians() {
    use relba::sparse::jacobians;
    use std::collections::BTreeSet;

    let mut st = RbaState::<Cartesian3D>::new(3);
    st.alloc_keyframe();
    st.alloc_keyframe();
    let edge_pose = SE3::from_translation_euler(0.5, -0.2, 0.3, 0.2, -0.4, 0.6);
    let e = st.alloc_kf2kf_edge(0, 1, edge_pose.clone()).unwrap();
    st.spanning_update_symbolic_new_node(1, &[e]);

    let f = DVector::from_vec(vec![1.0, 0.7, -0.4]);
    st.add_observation(
        0,
        &NewKfObservation::new(0, f.clone()).with_unknown_position(f.clone()),
    )
    .unwrap();
    let z = edge_pose.inverse().transform_point(&f);
    let obs = st.add_observation(1, &NewKfObservation::new(0, z)).unwrap();

    let symbolic: Vec<_> = (0..=obs).map(|i| jacobians::build_obs_symbolic(&st, i)).collect();
    let roots: BTreeSet<_> = symbolic.iter().map(|s| s.base_kf).collect();
    st.spanning_update_numeric(&roots);

    let edge_cols = BTreeMap::from([(0usize, 0usize)]);
    let lm_cols = BTreeMap::from([(0usize, 0usize)]);
    let analytic = jacobians::recompute_jacobians(
        &st, &symbolic, &edge_cols, &lm_cols, None, &Default::default(), false,
    );
    let numeric = jacobians::recompute_jacobians(
        &st, &symbolic, &edge_cols, &lm_cols, None, &Default::default(), true,
    );

    for (a_col, n_col) in analytic.dh_dap.iter().zip(&numeric.dh_dap) {
        for (oi, a) in a_col {
            assert!(
                (a - &n_col[oi]).norm() < 1e-5,
                "dh_dAp mismatch on observation {oi}"
            );
        }
    }
    for (a_col, n_col) in analytic.dh_df.iter().zip(&numeric.dh_df) {
        for (oi, a) in a_col {
            assert!(
                (a - &n_col[oi]).norm() < 1e-5,
                "dh_df mismatch on observation {oi}"
            );
        }
    }
}

// -------------------------------------------------------------------------
// Properties: dense ids and DOT round trip through the engine
// -------------------------------------------------------------------------

#[test]
fn test_dense_ids_through_the_engine() {
    let mut engine = RbaEngine::<RangeBearing2D>::new(RbaParameters::default())
        .with_edge_policy(Box::new(LinearGraph));
    for expected in 0..6 {
        let info = engine.define_new_keyframe(&[], false).unwrap();
        assert_eq!(info.kf_id, expected);
    }
    let st = engine.state();
    for (i, edge) in st.k2k_edges().iter().enumerate() {
        assert_eq!(edge.id, i);
    }
    assert_eq!(st.num_k2k_edges(), 5);
}

#[test]
fn test_dot_export_round_trip_through_engine() {
    let mut engine = RbaEngine::<RangeBearing2D>::new(RbaParameters::default())
        .with_edge_policy(Box::new(LinearGraph));
    for _ in 0..4 {
        engine.define_new_keyframe(&[], false).unwrap();
    }
    let path = std::env::temp_dir().join(format!("relba_it_{}.dot", std::process::id()));
    engine.save_graph_as_dot(&path, false).unwrap();
    let (nodes, edges) = relba::export::read_dot_structure(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(nodes.len(), engine.state().num_keyframes());
    assert_eq!(edges.len(), engine.state().num_k2k_edges());
    for edge in engine.state().k2k_edges() {
        assert!(edges.contains(&(edge.from, edge.to)));
    }
}
