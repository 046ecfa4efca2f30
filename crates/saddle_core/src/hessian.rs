use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Symmetric Hessian approximation with a cached eigendecomposition.
///
/// Eigenvalues are stored in ascending order, so the first `order` modes are
/// the most negative-curvature directions.
#[derive(Debug, Clone)]
pub struct ApproximateHessian {
    matrix: DMatrix<f64>,
    eigenvalues: DVector<f64>,
    eigenvectors: DMatrix<f64>,
}

impl ApproximateHessian {
    /// Builds the approximation from a square matrix, symmetrizing it first.
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if !matrix.is_square() {
            bail!(
                "Hessian must be square, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            );
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            bail!("Hessian contains non-finite entries");
        }

        let matrix = (&matrix + matrix.transpose()) * 0.5;
        let dim = matrix.nrows();
        if dim == 0 {
            return Ok(Self {
                matrix,
                eigenvalues: DVector::zeros(0),
                eigenvectors: DMatrix::zeros(0, 0),
            });
        }

        let (eigenvalues, eigenvectors) = sorted_symmetric_eigen(&matrix);

        Ok(Self {
            matrix,
            eigenvalues,
            eigenvectors,
        })
    }

    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn eigenvalues(&self) -> &DVector<f64> {
        &self.eigenvalues
    }

    pub fn eigenvectors(&self) -> &DMatrix<f64> {
        &self.eigenvectors
    }

    /// Hessian-vector product.
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.matrix * v
    }

    /// Restricts the Hessian to the column space of `basis`, returning `Bᵀ H B`.
    pub fn project(&self, basis: &DMatrix<f64>) -> Result<Self> {
        if basis.nrows() != self.dimension() {
            bail!(
                "Projection basis has {} rows, expected {}",
                basis.nrows(),
                self.dimension()
            );
        }
        Self::new(basis.transpose() * &self.matrix * basis)
    }
}

/// Eigendecomposition of a symmetric matrix with eigenvalues ascending.
pub(crate) fn sorted_symmetric_eigen(matrix: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let dim = matrix.nrows();
    let eig = SymmetricEigen::new(matrix.clone());
    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_by(|&i, &j| eig.eigenvalues[i].total_cmp(&eig.eigenvalues[j]));

    let eigenvalues = DVector::from_iterator(dim, order.iter().map(|&i| eig.eigenvalues[i]));
    let eigenvectors = DMatrix::from_fn(dim, dim, |r, c| eig.eigenvectors[(r, order[c])]);
    (eigenvalues, eigenvectors)
}
