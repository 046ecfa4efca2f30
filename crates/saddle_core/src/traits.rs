use nalgebra::{DMatrix, DVector};

use crate::hessian::ApproximateHessian;
use crate::pes::InternalCoordinates;

/// Local quadratic model of a potential energy surface at one configuration.
///
/// Vectors live in the full coordinate space of dimension `n`. The basis
/// matrices have `n` rows and one column per retained direction.
pub trait PotentialEnergySurface {
    /// Gradient in the full space.
    fn gradient(&self) -> DVector<f64>;

    /// Hessian in the full space.
    fn hessian(&self) -> DMatrix<f64>;

    /// Hessian operator restricted to the free subspace (`HL`).
    fn free_hessian(&self) -> ApproximateHessian;

    /// Fixed displacement that enforces the constraints (`scons`).
    fn constrained_step(&self) -> DVector<f64>;

    /// Orthonormal basis of the free subspace (`Ufree`).
    fn free_basis(&self) -> DMatrix<f64>;

    /// Orthonormal basis of the reduced, unconstrained subspace (`Unred`).
    fn reduced_basis(&self) -> DMatrix<f64>;

    /// Working transform applied before projecting onto the free basis (`W`).
    fn working_transform(&self) -> DMatrix<f64>;

    /// Internal-coordinate metadata, `None` for Cartesian surfaces.
    fn internal_coordinates(&self) -> Option<&InternalCoordinates>;

    /// Returns the dimension of the full coordinate space.
    fn dimension(&self) -> usize {
        self.gradient().len()
    }
}

/// A one-parameter family of steps `s(alpha)`.
///
/// `slope` is the sign of d(size)/d(alpha) near `alpha0`; the root finder uses
/// it to decide which side of the bracket the current `alpha` belongs to.
pub trait Stepper: Send {
    fn alpha0(&self) -> f64;
    fn alpha_min(&self) -> f64;
    fn alpha_max(&self) -> f64;
    fn slope(&self) -> f64;

    /// Returns `(s, ds/dalpha)` at `alpha`.
    fn step(&self, alpha: f64) -> (DVector<f64>, DVector<f64>);
}
