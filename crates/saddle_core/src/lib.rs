pub mod constraints;
pub mod error;
pub mod hessian;
pub mod linalg;
pub mod pes;
pub mod restricted_step;
pub mod stepper;
/// The `saddle_core` crate computes bounded steps for minimum and saddle-point
/// searches on a potential energy surface.
///
/// Key components:
/// - **Traits**: `PotentialEnergySurface` (local quadratic model) and `Stepper`
///   (one-parameter step families).
/// - **Linear algebra**: rank-truncated pseudo-inverse and reorthogonalizing
///   Gram-Schmidt used to build subspace projectors.
/// - **Constraints**: trust region, restricted atomic step and max internal
///   step size metrics.
/// - **Restricted step**: safeguarded Newton/bisection search for the step
///   whose size equals the trust radius.
pub mod traits;

pub use constraints::{ConstraintKind, InternalStepWeights, StepConstraint};
pub use error::{RestrictedStepError, StepResult};
pub use hessian::ApproximateHessian;
pub use linalg::{modified_gram_schmidt, pseudo_inverse, GramSchmidtSettings, PseudoInverse};
pub use pes::{InternalCoordinates, QuadraticPes};
pub use restricted_step::{
    RestrictedStep, RestrictedStepResult, RestrictedStepSettings, SubspaceMode,
};
pub use stepper::{build_stepper, NaiveStepper, StepperMethod};
pub use traits::{PotentialEnergySurface, Stepper};
