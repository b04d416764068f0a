//! DOT (graphviz) export of the keyframe graph.
//!
//! Two views are produced: the full graph (every keyframe and kf2kf
//! edge, optionally with landmarks), and the "high-level structure" —
//! only the keyframes carrying more than one kf2kf edge, which exposes
//! the area/loop skeleton of the map. A small structure reader is
//! provided so exported graphs can be compared by node/edge set.

use crate::core::state::{KeyframeId, RbaState};
use crate::error::RelbaResult;
use crate::manifold::RelativePose;
use crate::models::SensorModel;
use nalgebra::DVector;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Write all keyframes and kf2kf edges; with `all_landmarks`, landmarks
/// appear as point nodes with dotted observation edges.
pub fn save_graph_as_dot<M: SensorModel>(
    state: &RbaState<M>,
    target: impl AsRef<Path>,
    all_landmarks: bool,
) -> RelbaResult<()> {
    let mut f = File::create(target)?;
    writeln!(f, "digraph relba {{")?;
    writeln!(f, "  node [shape=circle];")?;
    for kf in 0..state.num_keyframes() {
        writeln!(f, "  kf{kf};")?;
    }
    for edge in state.k2k_edges() {
        writeln!(f, "  kf{} -> kf{};", edge.from, edge.to)?;
    }
    if all_landmarks {
        let mut seen_pairs: BTreeSet<(KeyframeId, usize)> = BTreeSet::new();
        for (&lm, _) in state.known_landmarks().iter().chain(state.unknown_landmarks()) {
            writeln!(f, "  lm{lm} [shape=point];")?;
        }
        for obs in state.observations() {
            if seen_pairs.insert((obs.kf_id, obs.lm_id)) {
                writeln!(f, "  kf{} -> lm{} [style=dotted];", obs.kf_id, obs.lm_id)?;
            }
        }
    }
    writeln!(f, "}}")?;
    Ok(())
}

/// Write only the keyframes with more than one kf2kf edge and the edges
/// joining them. With `set_node_coordinates`, node positions come from a
/// complete spanning tree rooted at keyframe 0.
pub fn save_graph_top_structure_as_dot<M: SensorModel>(
    state: &RbaState<M>,
    target: impl AsRef<Path>,
    set_node_coordinates: bool,
) -> RelbaResult<()> {
    let selected: BTreeSet<KeyframeId> = (0..state.num_keyframes())
        .filter(|&kf| state.incident_edges(kf).len() > 1)
        .collect();

    let poses = if set_node_coordinates && state.num_keyframes() > 0 {
        Some(state.create_complete_spanning_tree(0, usize::MAX, None)?)
    } else {
        None
    };

    let mut f = File::create(target)?;
    writeln!(f, "digraph relba_structure {{")?;
    writeln!(f, "  node [shape=box];")?;
    for &kf in &selected {
        match poses.as_ref().and_then(|p| p.get(&kf)) {
            Some(pose) => {
                // The pose's translation is its action on the origin.
                let origin = DVector::zeros(<M::Pose as RelativePose>::DIM);
                let t = pose.transform_point(&origin);
                writeln!(f, "  kf{kf} [pos=\"{:.3},{:.3}!\"];", t[0], t[1])?;
            }
            None => writeln!(f, "  kf{kf};")?,
        }
    }
    for edge in state.k2k_edges() {
        if selected.contains(&edge.from) && selected.contains(&edge.to) {
            writeln!(f, "  kf{} -> kf{};", edge.from, edge.to)?;
        }
    }
    writeln!(f, "}}")?;
    Ok(())
}

/// Read back the keyframe node ids and kf-to-kf edges of an exported DOT
/// file. Landmark nodes and observation edges are ignored.
pub fn read_dot_structure(
    source: impl AsRef<Path>,
) -> RelbaResult<(BTreeSet<usize>, BTreeSet<(usize, usize)>)> {
    fn parse_kf(token: &str) -> Option<usize> {
        let rest = token.trim().strip_prefix("kf")?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    let mut nodes = BTreeSet::new();
    let mut edges = BTreeSet::new();
    for line in BufReader::new(File::open(source)?).lines() {
        let line = line?;
        let line = line.trim();
        if let Some((lhs, rhs)) = line.split_once("->") {
            if let (Some(a), Some(b)) = (parse_kf(lhs), parse_kf(rhs)) {
                edges.insert((a, b));
            }
        } else if let Some(kf) = parse_kf(line) {
            nodes.insert(kf);
        }
    }
    Ok((nodes, edges))
}
