//! Error tolerances shared by every integrator.

use crate::error::IntegrationError;

/// Tolerance specification for error control
///
/// The allowed error on component `i` of a state whose magnitude is `m` is
/// `atol_i + rtol_i * m`, where the magnitude is chosen by each method
/// (usually the larger of the states at both ends of the step).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tolerances {
    /// Same absolute and relative tolerance on every component
    Scalar {
        /// Absolute tolerance
        atol: f64,
        /// Relative tolerance
        rtol: f64,
    },
    /// Per-component tolerances
    Vector {
        /// Absolute tolerance per component
        atol: Vec<f64>,
        /// Relative tolerance per component
        rtol: Vec<f64>,
    },
}

impl Tolerances {
    /// Create tolerances with uniform values
    pub fn new(atol: f64, rtol: f64) -> Self {
        Tolerances::Scalar { atol, rtol }
    }

    /// Create tolerances with per-component values
    pub fn with_components(atol: Vec<f64>, rtol: Vec<f64>) -> Self {
        Tolerances::Vector { atol, rtol }
    }

    /// Absolute tolerance of component `i`
    pub fn atol(&self, i: usize) -> f64 {
        match self {
            Tolerances::Scalar { atol, .. } => *atol,
            Tolerances::Vector { atol, .. } => atol[i],
        }
    }

    /// Relative tolerance of component `i`
    pub fn rtol(&self, i: usize) -> f64 {
        match self {
            Tolerances::Scalar { rtol, .. } => *rtol,
            Tolerances::Vector { rtol, .. } => rtol[i],
        }
    }

    /// Allowed error on component `i` for a state of magnitude `magnitude`
    #[inline]
    pub fn scale(&self, i: usize, magnitude: f64) -> f64 {
        match self {
            Tolerances::Scalar { atol, rtol } => atol + rtol * magnitude,
            Tolerances::Vector { atol, rtol } => atol[i] + rtol[i] * magnitude,
        }
    }

    /// Representative relative tolerance, used to pick starting orders.
    pub(crate) fn relative_hint(&self) -> f64 {
        match self {
            Tolerances::Scalar { rtol, .. } => *rtol,
            Tolerances::Vector { rtol, .. } => {
                if rtol.is_empty() {
                    0.0
                } else {
                    rtol.iter().sum::<f64>() / rtol.len() as f64
                }
            }
        }
    }

    /// Check every entry against a system of dimension `dimension`
    pub fn validate(&self, dimension: usize) -> Result<(), IntegrationError> {
        match self {
            Tolerances::Scalar { atol, rtol } => check_pair(None, *atol, *rtol),
            Tolerances::Vector { atol, rtol } => {
                if atol.len() != dimension {
                    return Err(IntegrationError::DimensionMismatch {
                        what: "absolute tolerance",
                        expected: dimension,
                        actual: atol.len(),
                    });
                }
                if rtol.len() != dimension {
                    return Err(IntegrationError::DimensionMismatch {
                        what: "relative tolerance",
                        expected: dimension,
                        actual: rtol.len(),
                    });
                }
                atol.iter()
                    .zip(rtol.iter())
                    .enumerate()
                    .try_for_each(|(i, (&a, &r))| check_pair(Some(i), a, r))
            }
        }
    }
}

fn check_pair(index: Option<usize>, atol: f64, rtol: f64) -> Result<(), IntegrationError> {
    let label = |name: &str| match index {
        Some(i) => format!("{}[{}]", name, i),
        None => name.to_string(),
    };
    if !atol.is_finite() || atol <= 0.0 {
        return Err(IntegrationError::InvalidInput {
            message: format!("{} must be positive and finite", label("atol")),
        });
    }
    if !rtol.is_finite() || rtol < 0.0 {
        return Err(IntegrationError::InvalidInput {
            message: format!("{} must be non-negative and finite", label("rtol")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_scalar_and_vector() {
        let scalar = Tolerances::new(1e-6, 1e-3);
        assert_eq!(scalar.scale(3, 2.0), 1e-6 + 2e-3);

        let vector = Tolerances::with_components(vec![1e-6, 1e-9], vec![0.0, 1e-3]);
        assert_eq!(vector.scale(0, 5.0), 1e-6);
        assert_eq!(vector.scale(1, 5.0), 1e-9 + 5e-3);
        assert_eq!(vector.atol(1), 1e-9);
        assert_eq!(vector.rtol(1), 1e-3);
    }

    #[test]
    fn test_validate() {
        assert!(Tolerances::new(1e-10, 0.0).validate(4).is_ok());
        assert!(matches!(
            Tolerances::new(0.0, 1e-6).validate(1),
            Err(IntegrationError::InvalidInput { .. })
        ));
        assert!(matches!(
            Tolerances::new(1e-6, f64::NAN).validate(1),
            Err(IntegrationError::InvalidInput { .. })
        ));

        let short = Tolerances::with_components(vec![1e-6], vec![1e-6, 1e-6]);
        assert_eq!(
            short.validate(2),
            Err(IntegrationError::DimensionMismatch {
                what: "absolute tolerance",
                expected: 2,
                actual: 1
            })
        );

        let negative = Tolerances::with_components(vec![1e-6, 1e-6], vec![1e-6, -1.0]);
        match negative.validate(2) {
            Err(IntegrationError::InvalidInput { message }) => {
                assert!(message.contains("rtol[1]"), "{}", message)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
