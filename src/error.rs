//! Error types reported by the integrators.

use thiserror::Error;

/// Phase of an integration run in which the evaluation budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPhase {
    /// Regular stepping, including the multistep start procedure
    Stepping,
    /// Refreshing derivatives after an event reset the state or the system
    EventHandling,
}

impl std::fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationPhase::Stepping => write!(f, "stepping"),
            EvaluationPhase::EventHandling => write!(f, "event handling"),
        }
    }
}

/// Errors that abort an integration run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    /// An array length disagrees with the dimension declared by the system
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which array was checked
        what: &'static str,
        /// Dimension declared by the system
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Tolerance cannot be met even at the minimal step size
    #[error("minimal step size ({min:.2e}) reached at t = {t}, integration needs {needed:.2e}")]
    StepSizeUnderflow {
        /// Time at which the step was attempted
        t: f64,
        /// Configured minimal step magnitude
        min: f64,
        /// Step magnitude the controller asked for
        needed: f64,
    },

    /// The derivative evaluation ceiling was hit
    #[error("maximal number of evaluations ({limit}) exceeded during {phase}")]
    MaxEvaluationsExceeded {
        /// Configured ceiling
        limit: u64,
        /// What the integrator was doing when the ceiling was hit
        phase: EvaluationPhase,
    },

    /// Root finding for an event did not converge
    #[error("event location did not converge after {iterations} iterations (best estimate t = {t})")]
    EventConvergenceFailure {
        /// Best estimate of the event time
        t: f64,
        /// Iterations performed
        iterations: usize,
    },

    /// An event function has no sign change where one was detected
    #[error("event function does not bracket a root on [{t_lo}, {t_hi}]: g = {g_lo}, {g_hi}")]
    NoBracketing {
        /// Lower end of the search interval
        t_lo: f64,
        /// Upper end of the search interval
        t_hi: f64,
        /// Event function at `t_lo`
        g_lo: f64,
        /// Event function at `t_hi`
        g_hi: f64,
    },

    /// Start and target times are too close to define a direction
    #[error("integration interval [{t0}, {t}] is too small")]
    IntervalTooSmall {
        /// Initial time
        t0: f64,
        /// Target time
        t: f64,
    },

    /// Invalid input parameters
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input
        message: String,
    },

    /// Non-finite state detected after an accepted step
    #[error("non-finite state detected at t = {t}")]
    NonFiniteState {
        /// Time of the offending state
        t: f64,
    },
}

/// Errors raised while assembling a [`ContinuousOutput`](crate::ContinuousOutput)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContinuousOutputError {
    /// The appended trajectory has a different state dimension
    #[error("dimension mismatch: model has {expected} components, appended one has {actual}")]
    DimensionMismatch {
        /// Dimension of the receiving model
        expected: usize,
        /// Dimension of the appended model
        actual: usize,
    },

    /// The appended trajectory runs in the opposite direction
    #[error("propagation direction mismatch")]
    DirectionMismatch,

    /// The appended trajectory does not start where this one ends
    #[error("hole between time ranges: model ends at {end}, appended one starts at {start}")]
    Gap {
        /// Final time of the receiving model
        end: f64,
        /// Initial time of the appended model
        start: f64,
    },
}
