//! Size metrics a restricted step is measured with.
//!
//! Each metric is a scalar function of the total step. The root finder also
//! needs its derivative along `ds/dalpha`; for the max-based metrics that is
//! the derivative of the currently active (arg-max) branch.

use std::fmt;
use std::str::FromStr;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{RestrictedStepError, StepResult};
use crate::pes::InternalCoordinates;

/// Constraint family selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    #[serde(rename = "tr")]
    TrustRegion,
    #[serde(rename = "ras")]
    RestrictedAtomicStep,
    #[serde(rename = "mis")]
    MaxInternalStep,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 3] = [
        ConstraintKind::TrustRegion,
        ConstraintKind::RestrictedAtomicStep,
        ConstraintKind::MaxInternalStep,
    ];

    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            ConstraintKind::TrustRegion => &[
                "tr",
                "trust region",
                "trust-region",
                "trust radius",
                "trust-radius",
            ],
            ConstraintKind::RestrictedAtomicStep => &["ras", "restricted atomic step"],
            ConstraintKind::MaxInternalStep => &["mis", "max internal step"],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConstraintKind::TrustRegion => "TrustRegion",
            ConstraintKind::RestrictedAtomicStep => "RestrictedAtomicStep",
            ConstraintKind::MaxInternalStep => "MaxInternalStep",
        }
    }

    /// Case-insensitive lookup against the synonym table.
    pub fn from_name(name: &str) -> StepResult<Self> {
        let key = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.synonyms().contains(&key.as_str()))
            .ok_or_else(|| RestrictedStepError::UnknownName {
                kind: "restricted step",
                name: name.to_string(),
            })
    }
}

impl FromStr for ConstraintKind {
    type Err = RestrictedStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.synonyms()[0])
    }
}

/// Per-family weights for the max-internal-step metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalStepWeights {
    /// Cartesian coordinates.
    pub wx: f64,
    /// Bonds.
    pub wb: f64,
    /// Angles, angle sums and angle differences.
    pub wa: f64,
    /// Dihedrals.
    pub wd: f64,
}

impl Default for InternalStepWeights {
    fn default() -> Self {
        Self {
            wx: 1.0,
            wb: 1.0,
            wa: 1.0,
            wd: 1.0,
        }
    }
}

/// A constraint resolved against a particular coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConstraint {
    /// Euclidean norm of the step.
    TrustRegion,
    /// Largest per-atom displacement; the step is read as `n x 3`.
    RestrictedAtomicStep,
    /// Largest weighted internal-coordinate displacement.
    MaxInternalStep { weights: DVector<f64> },
}

impl StepConstraint {
    /// Checks `kind` against the coordinate system and builds its payload.
    pub fn resolve(
        kind: ConstraintKind,
        internal: Option<&InternalCoordinates>,
        weights: &InternalStepWeights,
        dim: usize,
    ) -> StepResult<Self> {
        match kind {
            ConstraintKind::TrustRegion => Ok(StepConstraint::TrustRegion),
            ConstraintKind::RestrictedAtomicStep => {
                if internal.is_some() {
                    return Err(RestrictedStepError::IncompatibleCoordinates {
                        method: kind.name(),
                        requirement: "not compatible with",
                    });
                }
                if dim % 3 != 0 {
                    return Err(RestrictedStepError::InvalidConfiguration(format!(
                        "{} needs 3 Cartesian components per atom, got dimension {}",
                        kind.name(),
                        dim
                    )));
                }
                Ok(StepConstraint::RestrictedAtomicStep)
            }
            ConstraintKind::MaxInternalStep => {
                let internal = internal.ok_or(RestrictedStepError::IncompatibleCoordinates {
                    method: kind.name(),
                    requirement: "required for",
                })?;
                let weights = internal.weight_vector(weights);
                if weights.len() != dim {
                    return Err(RestrictedStepError::DimensionMismatch {
                        what: "internal coordinate weights",
                        expected: dim,
                        actual: weights.len(),
                    });
                }
                Ok(StepConstraint::MaxInternalStep { weights })
            }
        }
    }

    pub fn kind(&self) -> ConstraintKind {
        match self {
            StepConstraint::TrustRegion => ConstraintKind::TrustRegion,
            StepConstraint::RestrictedAtomicStep => ConstraintKind::RestrictedAtomicStep,
            StepConstraint::MaxInternalStep { .. } => ConstraintKind::MaxInternalStep,
        }
    }

    /// Size of `s` under this metric.
    pub fn value(&self, s: &DVector<f64>) -> f64 {
        match self {
            StepConstraint::TrustRegion => s.norm(),
            StepConstraint::RestrictedAtomicStep => max_atom(s).1,
            StepConstraint::MaxInternalStep { weights } => max_weighted(s, weights).1,
        }
    }

    /// Size of `s` and its derivative along `dsda`.
    pub fn value_and_derivative(&self, s: &DVector<f64>, dsda: &DVector<f64>) -> (f64, f64) {
        match self {
            StepConstraint::TrustRegion => {
                let val = s.norm();
                (val, dsda.dot(s) / val)
            }
            StepConstraint::RestrictedAtomicStep => {
                let (atom, val) = max_atom(s);
                let r = 3 * atom..3 * atom + 3;
                let dot: f64 = s.as_slice()[r.clone()]
                    .iter()
                    .zip(&dsda.as_slice()[r])
                    .map(|(a, b)| a * b)
                    .sum();
                (val, dot / val)
            }
            StepConstraint::MaxInternalStep { weights } => {
                let (idx, val) = max_weighted(s, weights);
                (val, sign(s[idx]) * dsda[idx] * weights[idx])
            }
        }
    }
}

/// Index and norm of the atom with the largest displacement. Ties keep the
/// first atom.
fn max_atom(s: &DVector<f64>) -> (usize, f64) {
    let mut best = (0, 0.0);
    for (atom, xyz) in s.as_slice().chunks_exact(3).enumerate() {
        let norm = xyz.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > best.1 {
            best = (atom, norm);
        }
    }
    best
}

fn max_weighted(s: &DVector<f64>, weights: &DVector<f64>) -> (usize, f64) {
    let mut best = (0, 0.0);
    for (idx, (v, w)) in s.iter().zip(weights.iter()).enumerate() {
        let sw = (v * w).abs();
        if sw > best.1 {
            best = (idx, sw);
        }
    }
    best
}

// Unlike f64::signum, zero maps to zero.
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
