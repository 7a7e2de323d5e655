//! Differential systems and derivative-evaluation accounting.

use crate::error::{EvaluationPhase, IntegrationError};

/// System of first-order ordinary differential equations: dy/dt = f(t, y)
///
/// # Example
///
/// ```
/// use nonstiff::OdeSystem;
///
/// /// Simple harmonic oscillator: y'' + ω²y = 0, state [y, y']
/// struct HarmonicOscillator {
///     omega: f64,
/// }
///
/// impl OdeSystem for HarmonicOscillator {
///     fn dimension(&self) -> usize {
///         2
///     }
///
///     fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
///         dydt[0] = y[1];
///         dydt[1] = -self.omega * self.omega * y[0];
///     }
/// }
/// ```
pub trait OdeSystem {
    /// Dimension of the state vector
    fn dimension(&self) -> usize;

    /// Evaluate the right-hand side of the ODE system
    ///
    /// The integrators always call this with `y.len() == dydt.len() ==
    /// self.dimension()`. It may be called any number of times per step and
    /// must not retain references to its arguments.
    ///
    /// # Arguments
    /// * `t` - Current time
    /// * `y` - Current state vector
    /// * `dydt` - Output: derivative dy/dt
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);
}

impl<S: OdeSystem + ?Sized> OdeSystem for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
        (**self).rhs(t, y, dydt)
    }
}

/// System of second-order equations: d²y/dt² = f(t, y, dy/dt)
///
/// Integrate it through a [`FirstOrderConverter`].
pub trait SecondOrderSystem {
    /// Dimension of `y`, half the dimension of the converted system
    fn dimension(&self) -> usize;

    /// Evaluate the second derivatives
    ///
    /// # Arguments
    /// * `t` - Current time
    /// * `y` - Current state
    /// * `y_dot` - Current first derivative
    /// * `y_ddot` - Output: second derivative
    fn second_derivatives(&self, t: f64, y: &[f64], y_dot: &[f64], y_ddot: &mut [f64]);
}

/// First-order view `[y, y']` of a [`SecondOrderSystem`]
///
/// # Example
///
/// ```
/// use nonstiff::{FirstOrderConverter, Integrator, SecondOrderSystem, Tolerances};
///
/// struct Pendulum;
///
/// impl SecondOrderSystem for Pendulum {
///     fn dimension(&self) -> usize {
///         1
///     }
///
///     fn second_derivatives(&self, _t: f64, y: &[f64], _y_dot: &[f64], y_ddot: &mut [f64]) {
///         y_ddot[0] = -y[0];
///     }
/// }
///
/// let system = FirstOrderConverter::new(Pendulum);
/// let mut integrator = Integrator::dormand_prince_853(0.0, 1.0, Tolerances::new(1e-10, 1e-10));
/// let mut y = [0.0; 2];
/// integrator.integrate(&system, 0.0, &[0.0, 1.0], 1.0, &mut y).unwrap();
/// assert!((y[0] - 1.0_f64.sin()).abs() < 1e-8);
/// ```
#[derive(Debug, Clone)]
pub struct FirstOrderConverter<S> {
    system: S,
}

impl<S: SecondOrderSystem> FirstOrderConverter<S> {
    /// Wrap a second-order system
    pub fn new(system: S) -> Self {
        Self { system }
    }

    /// The wrapped system
    pub fn inner(&self) -> &S {
        &self.system
    }

    /// Unwrap the second-order system
    pub fn into_inner(self) -> S {
        self.system
    }
}

impl<S: SecondOrderSystem> OdeSystem for FirstOrderConverter<S> {
    fn dimension(&self) -> usize {
        2 * self.system.dimension()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
        let n = self.system.dimension();
        let (position, velocity) = y.split_at(n);
        let (position_dot, velocity_dot) = dydt.split_at_mut(n);
        position_dot.copy_from_slice(velocity);
        self.system
            .second_derivatives(t, position, velocity, velocity_dot);
    }
}

/// Wraps the user system for one run, counting calls against a ceiling.
pub(crate) struct Evaluator<'a> {
    system: &'a dyn OdeSystem,
    count: u64,
    limit: u64,
    phase: EvaluationPhase,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(system: &'a dyn OdeSystem, limit: u64) -> Self {
        Self {
            system,
            count: 0,
            limit,
            phase: EvaluationPhase::Stepping,
        }
    }

    /// Number of calls actually forwarded to the system.
    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn set_phase(&mut self, phase: EvaluationPhase) {
        self.phase = phase;
    }

    /// Evaluate the derivative, refusing once the ceiling is reached.
    pub(crate) fn eval(
        &mut self,
        t: f64,
        y: &[f64],
        dydt: &mut [f64],
    ) -> Result<(), IntegrationError> {
        if self.count >= self.limit {
            log::warn!(
                "evaluation ceiling {} reached at t = {} during {}",
                self.limit,
                t,
                self.phase
            );
            return Err(IntegrationError::MaxEvaluationsExceeded {
                limit: self.limit,
                phase: self.phase,
            });
        }
        self.count += 1;
        self.system.rhs(t, y, dydt);
        Ok(())
    }
}
