//! Rank-revealing linear algebra used to build subspace projectors.
//!
//! Both routines treat numerical rank deficiency as an expected outcome:
//! tiny singular values are truncated and dependent columns are dropped
//! rather than reported as errors.

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Thin SVD of a matrix together with its rank-truncated pseudo-inverse.
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    /// Left singular vectors, `n x k` with `k = min(n, m)`.
    pub u: DMatrix<f64>,
    /// Singular values in descending order.
    pub singular_values: DVector<f64>,
    /// Right singular vectors (transposed), `k x m`.
    pub v_t: DMatrix<f64>,
    /// Moore-Penrose pseudo-inverse built from the first `rank` triplets, `m x n`.
    pub inverse: DMatrix<f64>,
    /// Number of singular values kept.
    pub rank: usize,
}

impl PseudoInverse {
    /// Rebuilds the input from the retained singular triplets.
    pub fn reconstruct(&self) -> DMatrix<f64> {
        let r = self.rank;
        let u = self.u.columns(0, r);
        let v_t = self.v_t.rows(0, r);
        let s = DMatrix::from_diagonal(&self.singular_values.rows(0, r).into_owned());
        u * s * v_t
    }
}

/// Computes the SVD and rank-truncated pseudo-inverse of `a`.
///
/// A singular value `s_i` is retained when `s_i > eps * s_max`, i.e. `eps` is
/// relative to the largest singular value. A zero matrix has rank 0 and a zero
/// pseudo-inverse.
///
/// Wide matrices (more columns than rows) are decomposed through their
/// transpose and the factors swapped back, so `u`, `v_t` and `inverse` follow
/// the same shape conventions for either orientation.
pub fn pseudo_inverse(a: &DMatrix<f64>, eps: f64) -> Result<PseudoInverse> {
    let (n, m) = a.shape();
    if n == 0 || m == 0 {
        bail!("Cannot pseudo-invert an empty {}x{} matrix", n, m);
    }
    if !(eps >= 0.0) || !eps.is_finite() {
        bail!("Rank tolerance must be finite and non-negative, got {}", eps);
    }
    if a.iter().any(|v| !v.is_finite()) {
        bail!("Cannot pseudo-invert a matrix with non-finite entries");
    }

    if m > n {
        let t = pseudo_inverse(&a.transpose(), eps)?;
        return Ok(PseudoInverse {
            u: t.v_t.transpose(),
            singular_values: t.singular_values,
            v_t: t.u.transpose(),
            inverse: t.inverse.transpose(),
            rank: t.rank,
        });
    }

    let svd = SVD::new(a.clone(), true, true);
    let u_raw = svd
        .u
        .ok_or_else(|| anyhow!("SVD did not produce left singular vectors"))?;
    let v_t_raw = svd
        .v_t
        .ok_or_else(|| anyhow!("SVD did not produce right singular vectors"))?;
    let raw = svd.singular_values;
    let k = raw.len();

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&i, &j| raw[j].total_cmp(&raw[i]));

    let singular_values = DVector::from_iterator(k, order.iter().map(|&i| raw[i]));
    let u = DMatrix::from_fn(n, k, |r, c| u_raw[(r, order[c])]);
    let v_t = DMatrix::from_fn(k, m, |r, c| v_t_raw[(order[r], c)]);

    let cutoff = eps * singular_values[0];
    let rank = singular_values.iter().take_while(|&&s| s > cutoff).count();

    let mut inverse = DMatrix::zeros(m, n);
    for i in 0..rank {
        let outer = v_t.row(i).transpose() * u.column(i).transpose();
        inverse += outer / singular_values[i];
    }

    Ok(PseudoInverse {
        u,
        singular_values,
        v_t,
        inverse,
        rank,
    })
}

/// Tolerances for [`modified_gram_schmidt`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GramSchmidtSettings {
    /// Drop a column once its residual norm, relative to its original norm,
    /// falls below this value.
    pub eps1: f64,
    /// A projection pass that shrinks the (normalized) column by less than
    /// this amount counts as converged.
    pub eps2: f64,
    /// Maximum projection passes per column.
    pub max_iter: usize,
}

impl Default for GramSchmidtSettings {
    fn default() -> Self {
        Self {
            eps1: 1e-15,
            eps2: 1e-6,
            max_iter: 100,
        }
    }
}

/// Orthonormalizes the columns of `x`, optionally against the columns of `y`.
///
/// Columns are processed left to right. Each one is projected against `y`
/// and the columns accepted so far, repeating the projection until a pass no
/// longer changes its norm by more than `eps2`. Dependent or duplicate
/// columns are dropped, so the output may have fewer columns than `x`.
///
/// The drop threshold is floored at `n * f64::EPSILON`: residuals at the level
/// of rounding noise never become basis vectors.
pub fn modified_gram_schmidt(
    x: &DMatrix<f64>,
    y: Option<&DMatrix<f64>>,
    settings: &GramSchmidtSettings,
) -> Result<DMatrix<f64>> {
    let n = x.nrows();
    if let Some(y) = y {
        if y.nrows() != n {
            bail!(
                "Gram-Schmidt: expected {} rows in the fixed basis, got {}",
                n,
                y.nrows()
            );
        }
    }
    if !(settings.eps1 >= 0.0) || !(settings.eps2 > 0.0) {
        bail!(
            "Gram-Schmidt tolerances must be positive (eps1 = {}, eps2 = {})",
            settings.eps1,
            settings.eps2
        );
    }
    if settings.max_iter == 0 {
        bail!("Gram-Schmidt max_iter must be greater than zero.");
    }

    let floor = settings.eps1.max(n as f64 * f64::EPSILON);
    let fixed = match y {
        Some(y) => orthonormal_columns(y, &[], floor, settings),
        None => Vec::new(),
    };
    let accepted = orthonormal_columns(x, &fixed, floor, settings);
    Ok(columns_to_matrix(n, &accepted))
}

fn orthonormal_columns(
    x: &DMatrix<f64>,
    fixed: &[DVector<f64>],
    floor: f64,
    settings: &GramSchmidtSettings,
) -> Vec<DVector<f64>> {
    let mut accepted: Vec<DVector<f64>> = Vec::with_capacity(x.ncols());

    for (idx, column) in x.column_iter().enumerate() {
        let norm0 = column.norm();
        if !(norm0 > 0.0) || !norm0.is_finite() {
            debug!("Gram-Schmidt: dropping column {idx} with norm {norm0}");
            continue;
        }

        let mut v: DVector<f64> = column.into_owned() / norm0;
        let mut retained = 1.0;
        let mut dropped = false;
        let mut converged = false;

        for _ in 0..settings.max_iter {
            for q in fixed.iter().chain(accepted.iter()) {
                let overlap = q.dot(&v);
                v.axpy(-overlap, q, 1.0);
            }

            let norm = v.norm();
            retained *= norm;
            if !(retained >= floor) {
                dropped = true;
                break;
            }
            v /= norm;

            if (1.0 - norm).abs() < settings.eps2 {
                converged = true;
                break;
            }
        }

        if dropped {
            debug!("Gram-Schmidt: column {idx} is linearly dependent (residual {retained:e})");
            continue;
        }
        if !converged {
            warn!(
                "Gram-Schmidt: column {idx} not converged after {} passes",
                settings.max_iter
            );
        }
        accepted.push(v);
    }

    accepted
}

fn columns_to_matrix(n: usize, columns: &[DVector<f64>]) -> DMatrix<f64> {
    if columns.is_empty() {
        return DMatrix::zeros(n, 0);
    }
    DMatrix::from_columns(columns)
}
