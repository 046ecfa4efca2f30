//! Restricted-step solver.
//!
//! Finds the shift `alpha` at which the stepper's step, measured by the chosen
//! constraint, has size exactly `delta`. The search is a safeguarded hybrid of
//! Newton updates and bisection over the stepper's `alpha` bracket.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::constraints::{ConstraintKind, InternalStepWeights, StepConstraint};
use crate::error::{RestrictedStepError, StepResult};
use crate::stepper::{build_stepper, NaiveStepper, StepperMethod};
use crate::traits::{PotentialEnergySurface, Stepper};

/// Consecutive Newton updates allowed before a bisection is forced.
const MAX_NEWTON_STREAK: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictedStepSettings {
    pub tol: f64,
    pub max_iter: usize,
    pub weights: InternalStepWeights,
}

impl Default for RestrictedStepSettings {
    fn default() -> Self {
        Self {
            tol: 1e-15,
            max_iter: 1000,
            weights: InternalStepWeights::default(),
        }
    }
}

/// Which subspace the step is searched in, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubspaceMode {
    /// The requested stepper runs in the free subspace; `scons` is added to
    /// every step.
    Normal,
    /// The constrained displacement alone already reaches `delta`; the step
    /// is a scaled copy of it projected onto the reduced basis.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct RestrictedStepResult {
    /// Total step in the full space, including `dx1` and `scons`.
    pub step: DVector<f64>,
    /// Achieved constraint value: `delta` after a search, or the size of the
    /// unshifted step when it was already inside the trust region.
    pub value: f64,
    /// Root-finder iterations; zero when no search was needed.
    pub iterations: usize,
}

pub struct RestrictedStep {
    delta: f64,
    constraint: StepConstraint,
    mode: SubspaceMode,
    /// `Pᵀ`: maps a stepper step back into the full space.
    back_projection: DMatrix<f64>,
    dx1: DVector<f64>,
    scons: DVector<f64>,
    stepper: Box<dyn Stepper>,
    tol: f64,
    max_iter: usize,
}

impl RestrictedStep {
    /// Sets up a solve on `pes` for a saddle point of the given `order`.
    ///
    /// `dx1` is a step already taken this iteration (zero if `None`); it must
    /// be strictly inside the trust region.
    pub fn new<P: PotentialEnergySurface + ?Sized>(
        pes: &P,
        order: usize,
        delta: f64,
        constraint: ConstraintKind,
        method: StepperMethod,
        dx1: Option<DVector<f64>>,
        settings: &RestrictedStepSettings,
    ) -> StepResult<Self> {
        if !(delta > 0.0) || !delta.is_finite() {
            return Err(RestrictedStepError::InvalidConfiguration(format!(
                "trust radius must be finite and positive, got {}",
                delta
            )));
        }
        if settings.max_iter == 0 {
            return Err(RestrictedStepError::InvalidConfiguration(
                "max_iter must be greater than zero".to_string(),
            ));
        }
        if !(settings.tol >= 0.0) {
            return Err(RestrictedStepError::InvalidConfiguration(format!(
                "tolerance must be non-negative, got {}",
                settings.tol
            )));
        }

        let dim = pes.dimension();
        if dim == 0 {
            return Err(RestrictedStepError::InvalidConfiguration(
                "potential energy surface has no coordinates".to_string(),
            ));
        }
        let constraint =
            StepConstraint::resolve(constraint, pes.internal_coordinates(), &settings.weights, dim)?;

        let scons = pes.constrained_step();
        check_len("constrained step", dim, scons.len())?;
        let gradient = pes.gradient();
        check_len("gradient", dim, gradient.len())?;
        let hessian = pes.hessian();
        check_shape("Hessian", (dim, dim), hessian.shape())?;
        let g = gradient + &hessian * &scons;

        let dx1 = dx1.unwrap_or_else(|| DVector::zeros(dim));
        check_len("initial step", dim, dx1.len())?;

        let start = constraint.value(&dx1);
        if !(start < delta) {
            return Err(RestrictedStepError::PreconditionViolation(format!(
                "initial step size {} is not below the trust radius {}",
                start, delta
            )));
        }

        let full = constraint.value(&(&dx1 + &scons));
        let (mode, back_projection, stepper, scons) = if full >= delta {
            let reduced = pes.reduced_basis();
            check_len("reduced basis rows", dim, reduced.nrows())?;
            let dx = reduced.transpose() * &scons;
            debug!(
                "restricted step: constrained displacement size {full:e} >= {delta:e}, using fallback"
            );
            (
                SubspaceMode::Fallback,
                reduced,
                Box::new(NaiveStepper::new(dx)) as Box<dyn Stepper>,
                DVector::zeros(dim),
            )
        } else {
            let free = pes.free_basis();
            check_len("free basis rows", dim, free.nrows())?;
            let transform = pes.working_transform();
            check_shape("working transform", (dim, dim), transform.shape())?;

            let projection = free.transpose() * transform;
            let back_projection = projection.transpose();
            let reduced_hessian = pes
                .free_hessian()
                .project(&back_projection)
                .map_err(|err| RestrictedStepError::InvalidConfiguration(format!("{err:#}")))?;
            let stepper = build_stepper(method, &(&projection * &g), &reduced_hessian, order)?;
            debug!(
                "restricted step: {} stepper in a {}-dimensional free subspace",
                method,
                projection.nrows()
            );
            (SubspaceMode::Normal, back_projection, stepper, scons)
        };

        Ok(Self {
            delta,
            constraint,
            mode,
            back_projection,
            dx1,
            scons,
            stepper,
            tol: settings.tol,
            max_iter: settings.max_iter,
        })
    }

    /// Like [`RestrictedStep::new`], resolving the constraint and stepper by name.
    pub fn from_names<P: PotentialEnergySurface + ?Sized>(
        pes: &P,
        order: usize,
        delta: f64,
        constraint: &str,
        method: &str,
        dx1: Option<DVector<f64>>,
        settings: &RestrictedStepSettings,
    ) -> StepResult<Self> {
        let constraint = ConstraintKind::from_name(constraint)?;
        let method = StepperMethod::from_name(method)?;
        Self::new(pes, order, delta, constraint, method, dx1, settings)
    }

    /// Trust radius the step is scaled to.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Subspace chosen at construction.
    pub fn mode(&self) -> SubspaceMode {
        self.mode
    }

    /// Resolved step-size metric.
    pub fn constraint(&self) -> &StepConstraint {
        &self.constraint
    }

    /// Total step at `alpha` with its constraint value and derivative.
    pub fn evaluate(&self, alpha: f64) -> (DVector<f64>, f64, f64) {
        let (s, dsda) = self.stepper.step(alpha);
        let total = &self.back_projection * s + &self.dx1 + &self.scons;
        let dtotal = &self.back_projection * dsda;
        let (val, dval) = self.constraint.value_and_derivative(&total, &dtotal);
        (total, val, dval)
    }

    /// Computes the restricted step.
    pub fn get_s(&self) -> StepResult<RestrictedStepResult> {
        let mut alpha = self.stepper.alpha0();
        let (mut step, mut val, mut dval) = self.evaluate(alpha);
        if val < self.delta {
            ensure_positive(val)?;
            debug!("restricted step: unshifted step of size {val:e} is inside {:e}", self.delta);
            return Ok(RestrictedStepResult {
                step,
                value: val,
                iterations: 0,
            });
        }

        let slope = self.stepper.slope();
        let mut err = val - self.delta;
        let mut lower = self.stepper.alpha_min();
        let mut upper = self.stepper.alpha_max();
        let mut newton_streak = 0usize;
        let mut iterations = 0usize;

        loop {
            if err.abs() <= self.tol {
                break;
            }
            if next_toward(lower, upper) >= upper {
                debug!("restricted step: bracket collapsed at alpha = {alpha:e}");
                break;
            }
            if iterations >= self.max_iter {
                warn!(
                    "restricted step: no convergence after {} iterations (alpha = {alpha:e}, err = {err:e})",
                    self.max_iter
                );
                return Err(RestrictedStepError::NonConvergence {
                    max_iter: self.max_iter,
                    residual: err.abs(),
                });
            }

            if err * slope > 0.0 {
                upper = alpha;
            } else {
                lower = alpha;
            }

            let newton = alpha - err / dval;
            let rejected = newton.is_nan() || newton <= lower || newton >= upper;
            alpha = if rejected || newton_streak >= MAX_NEWTON_STREAK {
                newton_streak = 0;
                let mid = (lower + upper) / 2.0;
                if mid.is_infinite() {
                    alpha + mid.signum()
                } else {
                    mid
                }
            } else {
                newton_streak += 1;
                newton
            };

            (step, val, dval) = self.evaluate(alpha);
            err = val - self.delta;
            iterations += 1;
            debug!(
                "restricted step: iter {iterations}, alpha = {alpha:e}, err = {err:e}, bracket = [{lower:e}, {upper:e}]"
            );
        }

        ensure_positive(val)?;
        Ok(RestrictedStepResult {
            step,
            value: self.delta,
            iterations,
        })
    }
}

fn ensure_positive(val: f64) -> StepResult<()> {
    if val > 0.0 {
        Ok(())
    } else {
        Err(RestrictedStepError::PreconditionViolation(format!(
            "restricted step has non-positive size {}",
            val
        )))
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> StepResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RestrictedStepError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> StepResult<()> {
    check_len(what, expected.0, actual.0)?;
    check_len(what, expected.1, actual.1)
}

/// Next representable value after `x` in the direction of `target`.
fn next_toward(x: f64, target: f64) -> f64 {
    if x.is_nan() || target.is_nan() {
        return f64::NAN;
    }
    if x == target {
        return target;
    }
    if x == 0.0 {
        let tiny = f64::from_bits(1);
        return if target > 0.0 { tiny } else { -tiny };
    }
    let bits = x.to_bits();
    let away_from_zero = (target > x) == (x > 0.0);
    f64::from_bits(if away_from_zero { bits + 1 } else { bits - 1 })
}
