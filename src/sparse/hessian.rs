//! Sparse block Hessian assembly: `H = Ĵᵀ Λ Ĵ` over block columns.
//!
//! Three instances are produced each iteration: `HAp` (pose x pose,
//! symmetric, upper triangle stored), `Hf` (landmark x landmark — block
//! diagonal, since no observation involves two landmarks) and `HApf`
//! (pose x landmark, rectangular). The symbolic structure — which block
//! positions exist and which observation rows feed each — is built once
//! per optimize call; the numeric update is pure arithmetic and reports
//! how many block multiplications were skipped over invalid observations.

use crate::core::state::ObsIdx;
use crate::models::NoiseWeight;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};

/// One stored block and the observation rows that feed it.
pub struct HessianEntry {
    pub row: usize,
    pub col: usize,
    pub obs: Vec<ObsIdx>,
    pub block: DMatrix<f64>,
}

/// A block matrix with cached symbolic structure.
pub struct SparseBlockHessian {
    pub block_rows: usize,
    pub block_cols: usize,
    /// When set, only entries with `row <= col` are stored and the matrix
    /// is implicitly mirrored.
    pub symmetric: bool,
    pub entries: Vec<HessianEntry>,
    index: BTreeMap<(usize, usize), usize>,
}

fn reverse_index(cols: &[BTreeMap<ObsIdx, DMatrix<f64>>]) -> BTreeMap<ObsIdx, Vec<usize>> {
    let mut by_obs: BTreeMap<ObsIdx, Vec<usize>> = BTreeMap::new();
    for (c, col) in cols.iter().enumerate() {
        for &obs in col.keys() {
            by_obs.entry(obs).or_default().push(c);
        }
    }
    by_obs
}

impl SparseBlockHessian {
    /// Symbolic structure of `JᵀΛJ` for a square product of a column set
    /// with itself (upper triangle only).
    pub fn build_symbolic_square(cols: &[BTreeMap<ObsIdx, DMatrix<f64>>]) -> Self {
        let mut obs_lists: BTreeMap<(usize, usize), Vec<ObsIdx>> = BTreeMap::new();
        for (obs, touched) in reverse_index(cols) {
            for (a, &i) in touched.iter().enumerate() {
                for &j in &touched[a..] {
                    obs_lists.entry((i, j)).or_default().push(obs);
                }
            }
        }
        Self::from_obs_lists(cols.len(), cols.len(), true, obs_lists)
    }

    /// Symbolic structure of `JlᵀΛJr` for two different column sets.
    pub fn build_symbolic_rect(
        left: &[BTreeMap<ObsIdx, DMatrix<f64>>],
        right: &[BTreeMap<ObsIdx, DMatrix<f64>>],
    ) -> Self {
        let right_by_obs = reverse_index(right);
        let mut obs_lists: BTreeMap<(usize, usize), Vec<ObsIdx>> = BTreeMap::new();
        for (obs, lcols) in reverse_index(left) {
            let Some(rcols) = right_by_obs.get(&obs) else {
                continue;
            };
            for &i in &lcols {
                for &j in rcols {
                    obs_lists.entry((i, j)).or_default().push(obs);
                }
            }
        }
        Self::from_obs_lists(left.len(), right.len(), false, obs_lists)
    }

    fn from_obs_lists(
        block_rows: usize,
        block_cols: usize,
        symmetric: bool,
        obs_lists: BTreeMap<(usize, usize), Vec<ObsIdx>>,
    ) -> Self {
        let mut entries = Vec::with_capacity(obs_lists.len());
        let mut index = BTreeMap::new();
        for ((row, col), obs) in obs_lists {
            index.insert((row, col), entries.len());
            entries.push(HessianEntry {
                row,
                col,
                obs,
                block: DMatrix::zeros(0, 0),
            });
        }
        SparseBlockHessian {
            block_rows,
            block_cols,
            symmetric,
            entries,
            index,
        }
    }

    /// Re-evaluate all blocks from the given Jacobian columns and
    /// per-observation weights. Returns the number of block
    /// multiplications skipped because their observation was invalid.
    pub fn update_numeric(
        &mut self,
        left: &[BTreeMap<ObsIdx, DMatrix<f64>>],
        right: &[BTreeMap<ObsIdx, DMatrix<f64>>],
        weights: &BTreeMap<ObsIdx, NoiseWeight>,
        invalid: &BTreeSet<ObsIdx>,
        row_dim: usize,
        col_dim: usize,
    ) -> usize {
        let mut skipped = 0;
        for entry in &mut self.entries {
            let mut block = DMatrix::zeros(row_dim, col_dim);
            for &obs in &entry.obs {
                if invalid.contains(&obs) {
                    skipped += 1;
                    continue;
                }
                let jl = &left[entry.row][&obs];
                let jr = &right[entry.col][&obs];
                let weighted = match weights.get(&obs) {
                    Some(w) => w.apply_matrix(jr),
                    None => jr.clone(),
                };
                block += jl.transpose() * weighted;
            }
            entry.block = block;
        }
        skipped
    }

    /// The diagonal block `(i, i)`, when present.
    pub fn diagonal_block(&self, i: usize) -> Option<&DMatrix<f64>> {
        self.index.get(&(i, i)).map(|&k| &self.entries[k].block)
    }

    pub fn block(&self, row: usize, col: usize) -> Option<&DMatrix<f64>> {
        self.index.get(&(row, col)).map(|&k| &self.entries[k].block)
    }

    /// Number of stored (non-zero-structure) blocks.
    pub fn num_blocks(&self) -> usize {
        self.entries.len()
    }

    /// Expand into a dense scalar matrix, mirroring the upper triangle
    /// when the matrix is symmetric.
    pub fn to_dense(&self, row_dim: usize, col_dim: usize) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.block_rows * row_dim, self.block_cols * col_dim);
        for entry in &self.entries {
            for r in 0..row_dim {
                for c in 0..col_dim {
                    let v = entry.block[(r, c)];
                    dense[(entry.row * row_dim + r, entry.col * col_dim + c)] = v;
                }
            }
            if self.symmetric && entry.row != entry.col {
                for r in 0..row_dim {
                    for c in 0..col_dim {
                        let v = entry.block[(r, c)];
                        dense[(entry.col * col_dim + c, entry.row * row_dim + r)] = v;
                    }
                }
            }
        }
        dense
    }
}

/// Weighted gradient columns `g[c] = Σ_obs JᵀΛr` over a block column set.
pub fn gradient(
    cols: &[BTreeMap<ObsIdx, DMatrix<f64>>],
    residuals: &BTreeMap<ObsIdx, DVector<f64>>,
    weights: &BTreeMap<ObsIdx, NoiseWeight>,
    invalid: &BTreeSet<ObsIdx>,
    dim: usize,
) -> Vec<DVector<f64>> {
    cols.iter()
        .map(|col| {
            let mut g = DVector::zeros(dim);
            for (obs, j) in col {
                if invalid.contains(obs) {
                    continue;
                }
                let Some(r) = residuals.get(obs) else {
                    continue;
                };
                let weighted = match weights.get(obs) {
                    Some(w) => w.apply(r),
                    None => r.clone(),
                };
                g += j.transpose() * weighted;
            }
            g
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(blocks: &[(ObsIdx, DMatrix<f64>)]) -> BTreeMap<ObsIdx, DMatrix<f64>> {
        blocks.iter().cloned().collect()
    }

    #[test]
    fn test_square_symbolic_upper_triangle_only() {
        let j = DMatrix::identity(2, 3);
        let cols = vec![
            col(&[(0, j.clone()), (1, j.clone())]),
            col(&[(1, j.clone()), (2, j.clone())]),
        ];
        let h = SparseBlockHessian::build_symbolic_square(&cols);
        let positions: Vec<_> = h.entries.iter().map(|e| (e.row, e.col)).collect();
        assert_eq!(positions, vec![(0, 0), (0, 1), (1, 1)]);
        assert!(h.entries.iter().all(|e| e.row <= e.col));
    }

    #[test]
    fn test_numeric_update_and_symmetry() {
        let mut j0 = DMatrix::zeros(2, 3);
        j0[(0, 0)] = 1.0;
        j0[(1, 2)] = 2.0;
        let mut j1 = DMatrix::zeros(2, 3);
        j1[(0, 1)] = 3.0;
        let cols = vec![col(&[(0, j0.clone())]), col(&[(0, j1.clone())])];

        let mut h = SparseBlockHessian::build_symbolic_square(&cols);
        let skipped = h.update_numeric(
            &cols,
            &cols,
            &BTreeMap::new(),
            &BTreeSet::new(),
            3,
            3,
        );
        assert_eq!(skipped, 0);

        let dense = h.to_dense(3, 3);
        assert_eq!(dense.nrows(), 6);
        assert!((dense.clone() - dense.transpose()).abs().max() < 1e-12);

        // Spot-check one block against the direct product.
        let expected = j0.transpose() * &j1;
        let b = h.block(0, 1).unwrap();
        assert!((b - expected).abs().max() < 1e-12);
    }

    #[test]
    fn test_invalid_observations_skipped_and_counted() {
        let j = DMatrix::identity(2, 2);
        let cols = vec![col(&[(0, j.clone()), (1, j.clone())])];
        let mut h = SparseBlockHessian::build_symbolic_square(&cols);
        let invalid = BTreeSet::from([1]);
        let skipped = h.update_numeric(&cols, &cols, &BTreeMap::new(), &invalid, 2, 2);
        assert_eq!(skipped, 1);
        // Only observation 0 contributed: block is the identity.
        assert!((h.block(0, 0).unwrap() - DMatrix::identity(2, 2)).abs().max() < 1e-12);
    }

    #[test]
    fn test_block_diagonal_structure_for_disjoint_obs() {
        // Two landmark columns never sharing an observation: Hf has only
        // diagonal entries.
        let j = DMatrix::identity(2, 2);
        let cols = vec![col(&[(0, j.clone())]), col(&[(1, j.clone())])];
        let h = SparseBlockHessian::build_symbolic_square(&cols);
        let positions: Vec<_> = h.entries.iter().map(|e| (e.row, e.col)).collect();
        assert_eq!(positions, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_gradient_weighted() {
        let j = DMatrix::identity(2, 2);
        let cols = vec![col(&[(0, j.clone())])];
        let residuals = BTreeMap::from([(0, DVector::from_vec(vec![1.0, -2.0]))]);
        let weights = BTreeMap::from([(0, NoiseWeight::Scalar(0.5))]);
        let g = gradient(&cols, &residuals, &weights, &BTreeSet::new(), 2);
        assert!((g[0][0] - 0.5).abs() < 1e-12);
        assert!((g[0][1] + 1.0).abs() < 1e-12);
    }
}
