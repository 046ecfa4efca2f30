//! Parameterized step families driven by the restricted-step root finder.
//!
//! Every stepper maps a scalar `alpha` to a step in the reduced space plus its
//! derivative. Only the length of the step (under the chosen metric) is
//! searched over; the family itself encodes how the quadratic model is
//! extremized.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{RestrictedStepError, StepResult};
use crate::hessian::{sorted_symmetric_eigen, ApproximateHessian};
use crate::traits::Stepper;

/// Stepper family selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepperMethod {
    #[serde(rename = "qn")]
    QuasiNewton,
    #[serde(rename = "rfo")]
    RationalFunction,
    #[serde(rename = "prfo")]
    PartitionedRationalFunction,
}

impl StepperMethod {
    pub const ALL: [StepperMethod; 3] = [
        StepperMethod::QuasiNewton,
        StepperMethod::RationalFunction,
        StepperMethod::PartitionedRationalFunction,
    ];

    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            StepperMethod::QuasiNewton => &["qn", "quasi-newton", "quasi newton", "newton"],
            StepperMethod::RationalFunction => &[
                "rfo",
                "rational function",
                "rational function optimization",
            ],
            StepperMethod::PartitionedRationalFunction => &[
                "prfo",
                "p-rfo",
                "partitioned rfo",
                "partitioned rational function optimization",
            ],
        }
    }

    pub fn from_name(name: &str) -> StepResult<Self> {
        let key = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|method| method.synonyms().contains(&key.as_str()))
            .ok_or_else(|| RestrictedStepError::UnknownName {
                kind: "stepper",
                name: name.to_string(),
            })
    }
}

impl FromStr for StepperMethod {
    type Err = RestrictedStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for StepperMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.synonyms()[0])
    }
}

/// Builds the stepper for `method` on the reduced gradient and Hessian.
///
/// `order` is the number of lowest-curvature modes the step ascends along.
pub fn build_stepper(
    method: StepperMethod,
    g: &DVector<f64>,
    h: &ApproximateHessian,
    order: usize,
) -> StepResult<Box<dyn Stepper>> {
    let dim = g.len();
    if h.dimension() != dim {
        return Err(RestrictedStepError::DimensionMismatch {
            what: "reduced Hessian",
            expected: dim,
            actual: h.dimension(),
        });
    }
    if order > dim {
        return Err(RestrictedStepError::InvalidConfiguration(format!(
            "saddle order {} exceeds the free subspace dimension {}",
            order, dim
        )));
    }

    Ok(match method {
        StepperMethod::QuasiNewton => Box::new(QuasiNewton::new(g, h, order)),
        StepperMethod::RationalFunction => {
            Box::new(RationalFunction::new(g.clone(), h.matrix().clone(), order))
        }
        StepperMethod::PartitionedRationalFunction => {
            Box::new(PartitionedRationalFunction::new(g, h, order))
        }
    })
}

/// Fixed direction scaled by `alpha`.
pub struct NaiveStepper {
    dx: DVector<f64>,
}

impl NaiveStepper {
    pub fn new(dx: DVector<f64>) -> Self {
        Self { dx }
    }
}

impl Stepper for NaiveStepper {
    fn alpha0(&self) -> f64 {
        0.5
    }

    fn alpha_min(&self) -> f64 {
        0.0
    }

    fn alpha_max(&self) -> f64 {
        1.0
    }

    fn slope(&self) -> f64 {
        1.0
    }

    fn step(&self, alpha: f64) -> (DVector<f64>, DVector<f64>) {
        (&self.dx * alpha, self.dx.clone())
    }
}

/// Levenberg-shifted Newton step in the Hessian eigenbasis.
///
/// The lowest `order` modes have their curvature and shift negated, so the
/// step climbs along them.
pub struct QuasiNewton {
    curvature: DVector<f64>,
    signs: DVector<f64>,
    modes: DMatrix<f64>,
    projected_gradient: DVector<f64>,
}

impl QuasiNewton {
    pub fn new(g: &DVector<f64>, h: &ApproximateHessian, order: usize) -> Self {
        let dim = g.len();
        let modes = h.eigenvectors().clone();
        let projected_gradient = modes.transpose() * g;

        let mut curvature = h.eigenvalues().abs();
        let mut signs = DVector::from_element(dim, 1.0);
        for i in 0..order {
            curvature[i] = -curvature[i];
            signs[i] = -1.0;
        }

        Self {
            curvature,
            signs,
            modes,
            projected_gradient,
        }
    }
}

impl Stepper for QuasiNewton {
    fn alpha0(&self) -> f64 {
        0.0
    }

    fn alpha_min(&self) -> f64 {
        0.0
    }

    fn alpha_max(&self) -> f64 {
        f64::INFINITY
    }

    fn slope(&self) -> f64 {
        -1.0
    }

    fn step(&self, alpha: f64) -> (DVector<f64>, DVector<f64>) {
        let denom = &self.curvature + &self.signs * alpha;
        let s_proj = self.projected_gradient.component_div(&denom);
        let ds_proj = s_proj.component_div(&denom).component_mul(&self.signs);
        (-(&self.modes * s_proj), &self.modes * ds_proj)
    }
}

/// Rational function step from the augmented Hessian
/// `A(alpha) = [[alpha² H, alpha g], [alpha gᵀ, 0]]`.
///
/// The step is built from eigenvector `order` (ascending) of `A(alpha)`, so
/// `order = 0` minimizes and `order = n` maximizes. `alpha = 1` is the plain
/// RFO step; smaller `alpha` shortens it. For intermediate orders the step
/// length does not vanish as `alpha -> 0`; use the partitioned variant there.
pub struct RationalFunction {
    h: DMatrix<f64>,
    g: DVector<f64>,
    order: usize,
}

impl RationalFunction {
    pub fn new(g: DVector<f64>, h: DMatrix<f64>, order: usize) -> Self {
        Self { h, g, order }
    }

    fn augmented(&self, alpha: f64) -> DMatrix<f64> {
        let n = self.g.len();
        let mut a = DMatrix::zeros(n + 1, n + 1);
        a.view_mut((0, 0), (n, n)).copy_from(&(&self.h * (alpha * alpha)));
        for i in 0..n {
            a[(i, n)] = alpha * self.g[i];
            a[(n, i)] = alpha * self.g[i];
        }
        a
    }

    fn augmented_derivative(&self, alpha: f64) -> DMatrix<f64> {
        let n = self.g.len();
        let mut a = DMatrix::zeros(n + 1, n + 1);
        a.view_mut((0, 0), (n, n)).copy_from(&(&self.h * (2.0 * alpha)));
        for i in 0..n {
            a[(i, n)] = self.g[i];
            a[(n, i)] = self.g[i];
        }
        a
    }
}

impl Stepper for RationalFunction {
    fn alpha0(&self) -> f64 {
        1.0
    }

    fn alpha_min(&self) -> f64 {
        0.0
    }

    fn alpha_max(&self) -> f64 {
        1.0
    }

    fn slope(&self) -> f64 {
        1.0
    }

    fn step(&self, alpha: f64) -> (DVector<f64>, DVector<f64>) {
        let n = self.g.len();
        let k = self.order;
        let (lambda, vecs) = sorted_symmetric_eigen(&self.augmented(alpha));
        let v = vecs.column(k).into_owned();

        // First-order eigenvector perturbation: dv = sum_j v_j (v_jᵀ A' v) / (λ_k - λ_j).
        let da_v = self.augmented_derivative(alpha) * &v;
        let mut dv = DVector::zeros(n + 1);
        for j in 0..=n {
            let gap = lambda[k] - lambda[j];
            if j == k || gap == 0.0 {
                continue;
            }
            let vj = vecs.column(j);
            dv.axpy(vj.dot(&da_v) / gap, &vj, 1.0);
        }

        let w = v[n];
        let dw = dv[n];
        let u = v.rows(0, n) / w;
        let du = dv.rows(0, n) / w - v.rows(0, n) * (dw / (w * w));

        let s = &u * alpha;
        let dsda = u + du * alpha;
        (s, dsda)
    }
}

/// RFO maximization in the lowest `order` modes combined with RFO
/// minimization in the remaining ones.
pub struct PartitionedRationalFunction {
    max_modes: DMatrix<f64>,
    min_modes: DMatrix<f64>,
    max_part: Option<RationalFunction>,
    min_part: Option<RationalFunction>,
}

impl PartitionedRationalFunction {
    pub fn new(g: &DVector<f64>, h: &ApproximateHessian, order: usize) -> Self {
        let dim = g.len();
        let vecs = h.eigenvectors();
        let max_modes = vecs.columns(0, order).into_owned();
        let min_modes = vecs.columns(order, dim - order).into_owned();

        let part = |modes: &DMatrix<f64>, order: usize| {
            if modes.ncols() == 0 {
                return None;
            }
            let g_sub = modes.transpose() * g;
            let h_sub = modes.transpose() * h.matrix() * modes;
            Some(RationalFunction::new(g_sub, h_sub, order))
        };
        let max_part = part(&max_modes, order);
        let min_part = part(&min_modes, 0);

        Self {
            max_modes,
            min_modes,
            max_part,
            min_part,
        }
    }
}

impl Stepper for PartitionedRationalFunction {
    fn alpha0(&self) -> f64 {
        1.0
    }

    fn alpha_min(&self) -> f64 {
        0.0
    }

    fn alpha_max(&self) -> f64 {
        1.0
    }

    fn slope(&self) -> f64 {
        1.0
    }

    fn step(&self, alpha: f64) -> (DVector<f64>, DVector<f64>) {
        let dim = self.max_modes.nrows();
        let mut s = DVector::zeros(dim);
        let mut dsda = DVector::zeros(dim);
        for (modes, part) in [
            (&self.max_modes, &self.max_part),
            (&self.min_modes, &self.min_part),
        ] {
            if let Some(part) = part {
                let (s_sub, ds_sub) = part.step(alpha);
                s += modes * s_sub;
                dsda += modes * ds_sub;
            }
        }
        (s, dsda)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag_hessian(values: &[f64]) -> ApproximateHessian {
        ApproximateHessian::new(DMatrix::from_diagonal(&DVector::from_column_slice(values)))
            .expect("hessian should build")
    }

    fn assert_vec_close(a: &DVector<f64>, b: &DVector<f64>, tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tol, "{a} vs {b}");
        }
    }

    fn finite_difference(stepper: &dyn Stepper, alpha: f64) -> DVector<f64> {
        let h = 1e-6;
        let (plus, _) = stepper.step(alpha + h);
        let (minus, _) = stepper.step(alpha - h);
        (plus - minus) / (2.0 * h)
    }

    #[test]
    fn method_names_resolve() {
        assert_eq!(StepperMethod::from_name("QN"), Ok(StepperMethod::QuasiNewton));
        assert_eq!(
            "Rational Function".parse::<StepperMethod>(),
            Ok(StepperMethod::RationalFunction)
        );
        assert_eq!(
            StepperMethod::from_name("p-rfo"),
            Ok(StepperMethod::PartitionedRationalFunction)
        );
        let err = StepperMethod::from_name("dimer").expect_err("expected error");
        assert_eq!(format!("{err}"), "Unknown stepper name: dimer");
    }

    #[test]
    fn naive_stepper_scales_fixed_direction() {
        let dx = DVector::from_vec(vec![1.0, -2.0]);
        let stepper = NaiveStepper::new(dx.clone());
        let (s, dsda) = stepper.step(0.25);
        assert_eq!(s, DVector::from_vec(vec![0.25, -0.5]));
        assert_eq!(dsda, dx);
        assert_eq!(stepper.alpha0(), 0.5);
        assert_eq!(stepper.slope(), 1.0);
    }

    #[test]
    fn quasi_newton_minimization_is_newton_step() {
        let h = diag_hessian(&[2.0, 4.0]);
        let g = DVector::from_vec(vec![1.0, 2.0]);
        let stepper = QuasiNewton::new(&g, &h, 0);
        let (s, _) = stepper.step(0.0);
        assert_vec_close(&s, &DVector::from_vec(vec![-0.5, -0.5]), 1e-12);
    }

    #[test]
    fn quasi_newton_climbs_lowest_mode() {
        let h = diag_hessian(&[2.0, -1.0]);
        let g = DVector::from_vec(vec![1.0, 1.0]);
        let stepper = QuasiNewton::new(&g, &h, 1);
        let (s, _) = stepper.step(0.0);
        assert_vec_close(&s, &DVector::from_vec(vec![-0.5, 1.0]), 1e-12);

        // Shifting shrinks both components.
        let (s, _) = stepper.step(1.0);
        assert_vec_close(&s, &DVector::from_vec(vec![-1.0 / 3.0, 0.5]), 1e-12);
    }

    #[test]
    fn quasi_newton_derivative_matches_finite_difference() {
        let h = ApproximateHessian::new(DMatrix::from_row_slice(
            3,
            3,
            &[3.0, 0.5, 0.1, 0.5, -1.0, 0.2, 0.1, 0.2, 1.5],
        ))
        .expect("hessian should build");
        let g = DVector::from_vec(vec![0.3, -0.2, 0.5]);
        let stepper = QuasiNewton::new(&g, &h, 1);
        let (_, dsda) = stepper.step(0.4);
        assert_vec_close(&dsda, &finite_difference(&stepper, 0.4), 1e-6);
    }

    #[test]
    fn rational_function_step_satisfies_shifted_newton_equation() {
        let h = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let g = DVector::from_vec(vec![0.4, -0.7]);
        let stepper = RationalFunction::new(g.clone(), h.clone(), 0);
        let (s, _) = stepper.step(1.0);
        let shift = g.dot(&s);
        let residual = &h * &s + &g - &s * shift;
        assert!(residual.norm() < 1e-10);
        // Minimization moves downhill.
        assert!(shift < 0.0);
    }

    #[test]
    fn rational_function_derivative_matches_finite_difference() {
        let h = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.0, 0.3, 1.0, 0.2, 0.0, 0.2, -0.5]);
        let g = DVector::from_vec(vec![0.4, -0.7, 0.2]);
        let stepper = RationalFunction::new(g, h, 0);
        let (_, dsda) = stepper.step(0.7);
        assert_vec_close(&dsda, &finite_difference(&stepper, 0.7), 1e-5);
    }

    #[test]
    fn partitioned_rfo_climbs_lowest_mode() {
        let h = diag_hessian(&[2.0, -1.0]);
        let g = DVector::from_vec(vec![1.0, 1.0]);
        let stepper = PartitionedRationalFunction::new(&g, &h, 1);
        let (s, dsda) = stepper.step(1.0);
        // Uphill along the negative-curvature axis, downhill along the other.
        assert!(s[1] > 0.0);
        assert!(s[0] < 0.0);
        let golden = (5.0_f64.sqrt() - 1.0) / 2.0;
        assert!((s[1] - golden).abs() < 1e-10);

        let fd = finite_difference(&stepper, 0.6);
        let (_, dsda_mid) = stepper.step(0.6);
        assert_vec_close(&dsda_mid, &fd, 1e-5);
        assert!(dsda.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn build_stepper_validates_order_and_shape() {
        let h = diag_hessian(&[1.0, 2.0]);
        let g = DVector::from_vec(vec![1.0, 1.0]);
        let err = build_stepper(StepperMethod::QuasiNewton, &g, &h, 3)
            .err()
            .expect("expected error");
        assert!(format!("{err}").contains("saddle order 3"));

        let err = build_stepper(StepperMethod::QuasiNewton, &DVector::zeros(3), &h, 0)
            .err()
            .expect("expected error");
        assert!(matches!(err, RestrictedStepError::DimensionMismatch { .. }));

        for method in StepperMethod::ALL {
            let stepper = build_stepper(method, &g, &h, 0).expect("stepper should build");
            let (s, _) = stepper.step(stepper.alpha0());
            assert_eq!(s.len(), 2);
            assert!(s.dot(&g) < 0.0);
        }
    }
}
