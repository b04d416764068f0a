//! Schur-complement reduction of the damped normal equations.
//!
//! With the Marquardt-damped blocks `H̃Ap = HAp + λ·diag(HAp)` and
//! `H̃f = Hf + λ·diag(Hf)`, the landmark unknowns are eliminated:
//!
//! ```text
//! S = H̃Ap − HApf · H̃f⁻¹ · HApfᵀ        b = g_Ap − HApf · H̃f⁻¹ · g_f
//! S · Δp = b                            Δf = H̃f⁻¹ · (g_f − HApfᵀ · Δp)
//! ```
//!
//! `H̃f` is block diagonal (one block per landmark), so its inverse is a
//! set of small dense inversions. The reduced system is dense and goes to
//! the Cholesky factorization in [`crate::linalg`].

use crate::linalg::{self, LinAlgError, LinAlgResult};
use crate::sparse::SparseBlockHessian;
use nalgebra::{DMatrix, DVector};

/// Solution of one damped, reduced linear system.
pub(crate) struct SchurOutcome {
    /// Pose increments, one tangent vector per edge unknown.
    pub delta_p: Vec<DVector<f64>>,
    /// Landmark increments, one vector per landmark unknown.
    pub delta_f: Vec<DVector<f64>>,
    /// Damped landmark-block inverses (reused for covariance recovery).
    pub hf_inv: Vec<DMatrix<f64>>,
}

fn damped(block: &DMatrix<f64>, lambda: f64) -> DMatrix<f64> {
    let mut out = block.clone();
    for i in 0..out.nrows().min(out.ncols()) {
        out[(i, i)] += lambda * block[(i, i)];
    }
    out
}

/// Eliminate the landmark block and solve for both increment sets.
pub(crate) fn solve_schur(
    hap: &SparseBlockHessian,
    hf: &SparseBlockHessian,
    hapf: &SparseBlockHessian,
    g_ap: &[DVector<f64>],
    g_f: &[DVector<f64>],
    lambda: f64,
    dof: usize,
    lm_dims: usize,
) -> LinAlgResult<SchurOutcome> {
    let np = g_ap.len();
    let nf = g_f.len();

    // Blockwise inverse of the damped landmark Hessian.
    let mut hf_inv = Vec::with_capacity(nf);
    for k in 0..nf {
        let block = hf
            .diagonal_block(k)
            .cloned()
            .unwrap_or_else(|| DMatrix::zeros(lm_dims, lm_dims));
        let inv = damped(&block, lambda)
            .try_inverse()
            .ok_or(LinAlgError::SingularMatrix)?;
        hf_inv.push(inv);
    }

    // Pose-column blocks of HApf grouped per landmark.
    let mut per_landmark: Vec<Vec<(usize, &DMatrix<f64>)>> = vec![Vec::new(); nf];
    for entry in &hapf.entries {
        per_landmark[entry.col].push((entry.row, &entry.block));
    }

    // Dense damped HAp.
    let n = np * dof;
    let mut s = DMatrix::zeros(n, n);
    for entry in &hap.entries {
        let block = if entry.row == entry.col {
            damped(&entry.block, lambda)
        } else {
            entry.block.clone()
        };
        for r in 0..dof {
            for c in 0..dof {
                s[(entry.row * dof + r, entry.col * dof + c)] = block[(r, c)];
                if entry.row != entry.col {
                    s[(entry.col * dof + c, entry.row * dof + r)] = block[(r, c)];
                }
            }
        }
    }

    // S -= HApf · H̃f⁻¹ · HApfᵀ, landmark by landmark.
    let mut b = DVector::zeros(n);
    for (i, g) in g_ap.iter().enumerate() {
        b.rows_mut(i * dof, dof).copy_from(g);
    }
    for k in 0..nf {
        let inv = &hf_inv[k];
        for &(i, bi) in &per_landmark[k] {
            let bi_inv = bi * inv;
            for &(j, bj) in &per_landmark[k] {
                let contrib = &bi_inv * bj.transpose();
                for r in 0..dof {
                    for c in 0..dof {
                        s[(i * dof + r, j * dof + c)] -= contrib[(r, c)];
                    }
                }
            }
            let contrib = bi_inv * &g_f[k];
            for r in 0..dof {
                b[i * dof + r] -= contrib[r];
            }
        }
    }

    let dp = linalg::cholesky_solve(&s, &b)?;
    let delta_p: Vec<DVector<f64>> = (0..np)
        .map(|i| DVector::from(dp.rows(i * dof, dof).clone_owned()))
        .collect();

    // Back-substitute the landmarks.
    let mut delta_f = Vec::with_capacity(nf);
    for k in 0..nf {
        let mut rhs = g_f[k].clone();
        for &(i, bi) in &per_landmark[k] {
            rhs -= bi.transpose() * &delta_p[i];
        }
        delta_f.push(&hf_inv[k] * rhs);
    }

    Ok(SchurOutcome {
        delta_p,
        delta_f,
        hf_inv,
    })
}
