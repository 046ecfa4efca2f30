//! In-memory quadratic model of a potential energy surface.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::constraints::InternalStepWeights;
use crate::hessian::ApproximateHessian;
use crate::linalg::{modified_gram_schmidt, pseudo_inverse, GramSchmidtSettings};
use crate::traits::PotentialEnergySurface;

const CONSTRAINT_RANK_EPS: f64 = 1e-10;

/// Counts of each internal-coordinate family, in storage order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalCoordinates {
    pub ncart: usize,
    pub nbonds: usize,
    pub nangles: usize,
    pub ndihedrals: usize,
    pub nangle_sums: usize,
    pub nangle_diffs: usize,
}

impl InternalCoordinates {
    pub fn len(&self) -> usize {
        self.ncart
            + self.nbonds
            + self.nangles
            + self.ndihedrals
            + self.nangle_sums
            + self.nangle_diffs
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-coordinate weights. Angle sums and differences reuse the angle weight.
    pub fn weight_vector(&self, weights: &InternalStepWeights) -> DVector<f64> {
        let blocks = [
            (self.ncart, weights.wx),
            (self.nbonds, weights.wb),
            (self.nangles, weights.wa),
            (self.ndihedrals, weights.wd),
            (self.nangle_sums, weights.wa),
            (self.nangle_diffs, weights.wa),
        ];
        let values = blocks
            .iter()
            .flat_map(|&(count, w)| std::iter::repeat(w).take(count));
        DVector::from_iterator(self.len(), values)
    }
}

/// Quadratic model `E(x) = gᵀx + ½ xᵀHx` with optional linear constraints.
///
/// Without constraints every basis is the identity and the constrained
/// displacement is zero.
#[derive(Debug, Clone)]
pub struct QuadraticPes {
    gradient: DVector<f64>,
    hessian: DMatrix<f64>,
    free_hessian: ApproximateHessian,
    constrained_step: DVector<f64>,
    free_basis: DMatrix<f64>,
    reduced_basis: DMatrix<f64>,
    working_transform: DMatrix<f64>,
    internal: Option<InternalCoordinates>,
}

impl QuadraticPes {
    pub fn new(gradient: DVector<f64>, hessian: DMatrix<f64>) -> Result<Self> {
        let dim = gradient.len();
        if dim == 0 {
            bail!("PES has zero dimension.");
        }
        if hessian.shape() != (dim, dim) {
            bail!(
                "Hessian dimension mismatch. Expected {}x{}, got {}x{}.",
                dim,
                dim,
                hessian.nrows(),
                hessian.ncols()
            );
        }
        if gradient.iter().any(|v| !v.is_finite()) {
            bail!("Gradient contains non-finite entries");
        }
        let free_hessian = ApproximateHessian::new(hessian.clone())?;

        Ok(Self {
            gradient,
            hessian,
            free_hessian,
            constrained_step: DVector::zeros(dim),
            free_basis: DMatrix::identity(dim, dim),
            reduced_basis: DMatrix::identity(dim, dim),
            working_transform: DMatrix::identity(dim, dim),
            internal: None,
        })
    }

    /// Adds linear constraints `J x + r = 0`.
    ///
    /// The constrained displacement becomes the minimum-norm solution
    /// `-J⁺ r`, and the free basis becomes the orthonormal complement of the
    /// constraint normals (the rows of `J`).
    pub fn with_constraints(mut self, jacobian: DMatrix<f64>, residual: DVector<f64>) -> Result<Self> {
        let dim = self.gradient.len();
        if jacobian.ncols() != dim {
            bail!(
                "Constraint Jacobian has {} columns, expected {}",
                jacobian.ncols(),
                dim
            );
        }
        if jacobian.nrows() != residual.len() {
            bail!(
                "Constraint residual has {} entries, expected {}",
                residual.len(),
                jacobian.nrows()
            );
        }
        if jacobian.nrows() == 0 {
            return Ok(self);
        }

        let pinv = pseudo_inverse(&jacobian, CONSTRAINT_RANK_EPS)
            .context("Failed to pseudo-invert the constraint Jacobian.")?;
        self.constrained_step = -(&pinv.inverse * residual);

        let normals = jacobian.transpose();
        self.free_basis = modified_gram_schmidt(
            &DMatrix::identity(dim, dim),
            Some(&normals),
            &GramSchmidtSettings::default(),
        )
        .context("Failed to build the free subspace basis.")?;
        Ok(self)
    }

    /// Replaces the Hessian used inside the free subspace (`HL`).
    pub fn with_free_hessian(mut self, hessian: DMatrix<f64>) -> Result<Self> {
        let dim = self.gradient.len();
        if hessian.shape() != (dim, dim) {
            bail!(
                "Free Hessian dimension mismatch. Expected {}x{}, got {}x{}.",
                dim,
                dim,
                hessian.nrows(),
                hessian.ncols()
            );
        }
        self.free_hessian = ApproximateHessian::new(hessian)?;
        Ok(self)
    }

    /// Restricts the unconstrained directions to the span of `basis`.
    pub fn with_reduced_basis(mut self, basis: DMatrix<f64>) -> Result<Self> {
        let dim = self.gradient.len();
        if basis.nrows() != dim {
            bail!(
                "Reduced basis has {} rows, expected {}",
                basis.nrows(),
                dim
            );
        }
        self.reduced_basis =
            modified_gram_schmidt(&basis, None, &GramSchmidtSettings::default())?;
        Ok(self)
    }

    pub fn with_working_transform(mut self, transform: DMatrix<f64>) -> Result<Self> {
        let dim = self.gradient.len();
        if transform.shape() != (dim, dim) {
            bail!(
                "Working transform dimension mismatch. Expected {}x{}, got {}x{}.",
                dim,
                dim,
                transform.nrows(),
                transform.ncols()
            );
        }
        self.working_transform = transform;
        Ok(self)
    }

    pub fn with_internal_coordinates(mut self, internal: InternalCoordinates) -> Result<Self> {
        if internal.len() != self.gradient.len() {
            bail!(
                "Internal coordinate count {} does not match dimension {}",
                internal.len(),
                self.gradient.len()
            );
        }
        self.internal = Some(internal);
        Ok(self)
    }
}

impl PotentialEnergySurface for QuadraticPes {
    fn gradient(&self) -> DVector<f64> {
        self.gradient.clone()
    }

    fn hessian(&self) -> DMatrix<f64> {
        self.hessian.clone()
    }

    fn free_hessian(&self) -> ApproximateHessian {
        self.free_hessian.clone()
    }

    fn constrained_step(&self) -> DVector<f64> {
        self.constrained_step.clone()
    }

    fn free_basis(&self) -> DMatrix<f64> {
        self.free_basis.clone()
    }

    fn reduced_basis(&self) -> DMatrix<f64> {
        self.reduced_basis.clone()
    }

    fn working_transform(&self) -> DMatrix<f64> {
        self.working_transform.clone()
    }

    fn internal_coordinates(&self) -> Option<&InternalCoordinates> {
        self.internal.as_ref()
    }

    fn dimension(&self) -> usize {
        self.gradient.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn unconstrained_surface_uses_identity_bases() {
        let pes = QuadraticPes::new(DVector::from_vec(vec![1.0, 2.0]), DMatrix::identity(2, 2))
            .expect("pes should build");
        assert_eq!(pes.dimension(), 2);
        assert_eq!(pes.free_basis(), DMatrix::identity(2, 2));
        assert_eq!(pes.constrained_step(), DVector::zeros(2));
        assert!(pes.internal_coordinates().is_none());
    }

    #[test]
    fn constraints_set_displacement_and_free_basis() {
        // Constraint: x0 + x1 - 1 = 0.
        let jacobian = DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 0.0]);
        let residual = DVector::from_vec(vec![-1.0]);
        let pes = QuadraticPes::new(DVector::zeros(3), DMatrix::identity(3, 3))
            .and_then(|p| p.with_constraints(jacobian.clone(), residual))
            .expect("pes should build");

        let scons = pes.constrained_step();
        assert!((scons[0] - 0.5).abs() < 1e-12);
        assert!((scons[1] - 0.5).abs() < 1e-12);
        assert!(scons[2].abs() < 1e-12);

        let free = pes.free_basis();
        assert_eq!(free.ncols(), 2);
        assert!((&jacobian * &free).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn weight_vector_replicates_weights() {
        let internal = InternalCoordinates {
            ncart: 1,
            nbonds: 2,
            nangles: 1,
            ndihedrals: 1,
            nangle_sums: 1,
            nangle_diffs: 1,
        };
        let weights = InternalStepWeights {
            wx: 1.0,
            wb: 2.0,
            wa: 3.0,
            wd: 4.0,
        };
        let w = internal.weight_vector(&weights);
        assert_eq!(w.as_slice(), &[1.0, 2.0, 2.0, 3.0, 4.0, 3.0, 3.0]);
        assert_eq!(internal.len(), 7);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        assert_err_contains(
            QuadraticPes::new(DVector::zeros(2), DMatrix::identity(3, 3)),
            "Hessian dimension mismatch",
        );
        let pes = QuadraticPes::new(DVector::zeros(2), DMatrix::identity(2, 2))
            .expect("pes should build");
        assert_err_contains(
            pes.clone()
                .with_internal_coordinates(InternalCoordinates {
                    nbonds: 3,
                    ..Default::default()
                }),
            "does not match dimension 2",
        );
        assert_err_contains(
            pes.with_constraints(DMatrix::zeros(1, 3), DVector::zeros(1)),
            "expected 2",
        );
    }
}
