use thiserror::Error;

/// Failures reported by the restricted-step solver.
///
/// Configuration errors and precondition violations indicate misuse or a
/// broken model upstream. `NonConvergence` is the only numerical outcome a
/// caller can reasonably retry (looser tolerance, more iterations, another
/// stepper).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RestrictedStepError {
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Unknown {kind} name: {name}")]
    UnknownName { kind: &'static str, name: String },

    #[error("Internal coordinates are {requirement} the {method} trust region method.")]
    IncompatibleCoordinates {
        method: &'static str,
        requirement: &'static str,
    },

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Restricted step failed to converge in {max_iter} iterations (|err| = {residual:e}).")]
    NonConvergence { max_iter: usize, residual: f64 },
}

impl RestrictedStepError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownName { .. }
                | Self::IncompatibleCoordinates { .. }
                | Self::DimensionMismatch { .. }
                | Self::InvalidConfiguration(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NonConvergence { .. })
    }
}

pub type StepResult<T> = Result<T, RestrictedStepError>;
