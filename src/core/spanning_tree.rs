//! Bounded-depth shortest-path spanning trees.
//!
//! For every keyframe `r` the tree holds, for each keyframe `v` within
//! `max_tree_depth` undirected hops, a symbolic entry (predecessor node,
//! predecessor edge, hop distance) and a numeric composed pose `T(r ← v)`
//! guarded by a dirty bit. Symbolic structure is kept current on every
//! graph change; numeric poses are refreshed lazily, in increasing
//! distance order, only where dirty.
//!
//! Determinism: when several predecessors lie at the same distance, the
//! lowest keyframe id wins (and among parallel edges, the lowest edge id).

use crate::core::state::{EdgeId, Kf2KfEdge, KeyframeId};
use crate::manifold::RelativePose;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Symbolic tree entry for one reachable keyframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanTreeEntry {
    /// Next keyframe towards the root (at distance `dist - 1`).
    pub pred: KeyframeId,
    /// The edge joining `pred` and this keyframe.
    pub pred_edge: EdgeId,
    /// Hop distance from the root.
    pub dist: usize,
}

/// Composed pose `T(root ← v)` with its staleness flag.
#[derive(Clone)]
pub struct NumericPose<P> {
    pub pose: P,
    pub dirty: bool,
}

/// All bounded spanning trees of a problem, one per root keyframe.
pub struct SpanningTree<P: RelativePose> {
    max_depth: usize,
    sym: BTreeMap<KeyframeId, BTreeMap<KeyframeId, SpanTreeEntry>>,
    num: BTreeMap<KeyframeId, BTreeMap<KeyframeId, NumericPose<P>>>,
}

impl<P: RelativePose> SpanningTree<P> {
    pub fn new(max_depth: usize) -> Self {
        assert!(max_depth > 0, "max_tree_depth must be positive");
        SpanningTree {
            max_depth,
            sym: BTreeMap::new(),
            num: BTreeMap::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Symbolic entries of the tree rooted at `root` (the root itself is
    /// implicit and carries no entry).
    pub fn tree(&self, root: KeyframeId) -> Option<&BTreeMap<KeyframeId, SpanTreeEntry>> {
        self.sym.get(&root)
    }

    /// Numeric poses of the tree rooted at `root`.
    pub fn numeric(&self, root: KeyframeId) -> Option<&BTreeMap<KeyframeId, NumericPose<P>>> {
        self.num.get(&root)
    }

    /// Hop distance from `root` to `v` within the bounded tree.
    pub fn distance(&self, root: KeyframeId, v: KeyframeId) -> Option<usize> {
        if root == v {
            return Some(0);
        }
        self.sym.get(&root)?.get(&v).map(|e| e.dist)
    }

    /// Bounded BFS distances over the keyframe graph.
    fn bounded_dists(
        edges: &[Kf2KfEdge<P>],
        adjacency: &[Vec<EdgeId>],
        root: KeyframeId,
        max_depth: usize,
    ) -> BTreeMap<KeyframeId, usize> {
        let mut dist = BTreeMap::from([(root, 0usize)]);
        let mut queue = VecDeque::from([root]);
        while let Some(u) = queue.pop_front() {
            let du = dist[&u];
            if du >= max_depth {
                continue;
            }
            for &e in &adjacency[u] {
                let edge = &edges[e];
                let v = if edge.from == u { edge.to } else { edge.from };
                if !dist.contains_key(&v) {
                    dist.insert(v, du + 1);
                    queue.push_back(v);
                }
            }
        }
        dist
    }

    /// Rebuild one root's tree from scratch, preserving numeric poses
    /// whose entire predecessor chain is unchanged.
    fn rebuild_root(&mut self, edges: &[Kf2KfEdge<P>], adjacency: &[Vec<EdgeId>], root: KeyframeId) {
        let dist = Self::bounded_dists(edges, adjacency, root, self.max_depth);

        // Lowest-id predecessor at distance d-1; lowest edge id among
        // parallel edges.
        let mut fresh: BTreeMap<KeyframeId, SpanTreeEntry> = BTreeMap::new();
        for (&v, &dv) in &dist {
            if v == root {
                continue;
            }
            let mut best: Option<(KeyframeId, EdgeId)> = None;
            for &e in &adjacency[v] {
                let edge = &edges[e];
                let u = if edge.from == v { edge.to } else { edge.from };
                if dist.get(&u) == Some(&(dv - 1)) {
                    let cand = (u, e);
                    if best.is_none() || cand < best.unwrap() {
                        best = Some(cand);
                    }
                }
            }
            let (pred, pred_edge) = best.expect("BFS-reached node has a predecessor");
            fresh.insert(v, SpanTreeEntry { pred, pred_edge, dist: dv });
        }

        let old_sym = self.sym.remove(&root).unwrap_or_default();
        let mut old_num = self.num.remove(&root).unwrap_or_default();

        // A numeric pose survives only if its whole predecessor chain kept
        // the same symbolic entries; process in distance order so the
        // parent's verdict is already known.
        let mut chain_ok: BTreeSet<KeyframeId> = BTreeSet::new();
        let mut by_dist: Vec<(&KeyframeId, &SpanTreeEntry)> = fresh.iter().collect();
        by_dist.sort_by_key(|(_, e)| e.dist);

        let mut new_num: BTreeMap<KeyframeId, NumericPose<P>> = BTreeMap::new();
        for (&v, entry) in by_dist {
            let unchanged = old_sym.get(&v) == Some(entry);
            let parent_ok = entry.pred == root || chain_ok.contains(&entry.pred);
            if unchanged && parent_ok {
                chain_ok.insert(v);
                if let Some(np) = old_num.remove(&v) {
                    new_num.insert(v, np);
                    continue;
                }
            }
            new_num.insert(
                v,
                NumericPose {
                    pose: P::identity(),
                    dirty: true,
                },
            );
        }

        self.sym.insert(root, fresh);
        self.num.insert(root, new_num);
    }

    /// Symbolic maintenance after a new keyframe and its accompanying
    /// edges were allocated. Every tree whose root lies within
    /// `max_tree_depth` of a new-edge endpoint (or of the new keyframe
    /// itself) is brought back to the shortest-path invariant; all other
    /// trees are untouched.
    pub fn update_symbolic_new_node(
        &mut self,
        edges: &[Kf2KfEdge<P>],
        adjacency: &[Vec<EdgeId>],
        new_kf: KeyframeId,
        new_edges: &[EdgeId],
    ) {
        let mut roots: BTreeSet<KeyframeId> = BTreeSet::new();
        let mut seeds: BTreeSet<KeyframeId> = BTreeSet::from([new_kf]);
        for &e in new_edges {
            seeds.insert(edges[e].from);
            seeds.insert(edges[e].to);
        }
        for seed in seeds {
            roots.extend(Self::bounded_dists(edges, adjacency, seed, self.max_depth).into_keys());
        }
        for root in roots {
            self.rebuild_root(edges, adjacency, root);
        }
    }

    /// Mark every composed pose whose predecessor path crosses the given
    /// edge as dirty. Only trees that use the edge as a tree edge are
    /// touched.
    pub fn mark_dirty(&mut self, edge_id: EdgeId) {
        for (root, tree) in self.sym.iter() {
            // The edge appears as a tree edge at most once per tree: at
            // the child node it leads to.
            let Some((&child, _)) = tree.iter().find(|(_, e)| e.pred_edge == edge_id) else {
                continue;
            };
            let mut tainted: BTreeSet<KeyframeId> = BTreeSet::from([child]);
            let mut by_dist: Vec<(&KeyframeId, &SpanTreeEntry)> = tree.iter().collect();
            by_dist.sort_by_key(|(_, e)| e.dist);
            for (&v, entry) in by_dist {
                if tainted.contains(&entry.pred) {
                    tainted.insert(v);
                }
            }
            let num = self.num.get_mut(root).expect("numeric tree exists");
            for v in tainted {
                if let Some(np) = num.get_mut(&v) {
                    np.dirty = true;
                }
            }
        }
    }

    /// Recompute the dirty poses of the given roots, in increasing
    /// distance order, as `T(r←v) = T(r←pred(v)) ⊕ T(pred(v)←v)`.
    /// Returns the number of poses recomputed.
    pub fn update_numeric(
        &mut self,
        edges: &[Kf2KfEdge<P>],
        roots: &BTreeSet<KeyframeId>,
    ) -> usize {
        let mut updated = 0;
        for &root in roots {
            let Some(tree) = self.sym.get(&root) else {
                continue;
            };
            let mut order: Vec<(KeyframeId, SpanTreeEntry)> =
                tree.iter().map(|(&v, e)| (v, e.clone())).collect();
            order.sort_by_key(|(_, e)| e.dist);
            let num = self.num.get_mut(&root).expect("numeric tree exists");
            for (v, entry) in order {
                if !num.get(&v).map(|np| np.dirty).unwrap_or(false) {
                    continue;
                }
                let edge = &edges[entry.pred_edge];
                let step = if edge.from == entry.pred {
                    edge.pose.clone()
                } else {
                    edge.pose.inverse()
                };
                let pose = if entry.pred == root {
                    step
                } else {
                    num[&entry.pred].pose.compose(&step)
                };
                let np = num.get_mut(&v).expect("numeric entry exists");
                np.pose = pose;
                np.dirty = false;
                updated += 1;
            }
        }
        updated
    }

    /// Build a spanning tree of composed poses from `root` by plain BFS,
    /// without consulting the cached bounded trees. `ws` is a visited
    /// buffer supplied by the caller so concurrent readers need not share
    /// scratch space; it is resized and cleaned here.
    pub fn create_complete_spanning_tree(
        edges: &[Kf2KfEdge<P>],
        adjacency: &[Vec<EdgeId>],
        root: KeyframeId,
        max_depth: usize,
        ws: &mut Vec<bool>,
    ) -> BTreeMap<KeyframeId, P> {
        ws.clear();
        ws.resize(adjacency.len(), false);

        let mut out: BTreeMap<KeyframeId, P> = BTreeMap::from([(root, P::identity())]);
        let mut depth: BTreeMap<KeyframeId, usize> = BTreeMap::from([(root, 0)]);
        ws[root] = true;
        let mut queue = VecDeque::from([root]);
        while let Some(u) = queue.pop_front() {
            let du = depth[&u];
            if du >= max_depth {
                continue;
            }
            for &e in &adjacency[u] {
                let edge = &edges[e];
                let v = if edge.from == u { edge.to } else { edge.from };
                if !ws[v] {
                    ws[v] = true;
                    let step = if edge.from == u {
                        edge.pose.clone()
                    } else {
                        edge.pose.inverse()
                    };
                    let pose = out[&u].compose(&step);
                    out.insert(v, pose);
                    depth.insert(v, du + 1);
                    queue.push_back(v);
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.sym.clear();
        self.num.clear();
    }
}
