//! Event Detection and Handling
//!
//! An event is a zero crossing of a user-defined switching function
//! `g(t, y)` along the trajectory. After each accepted step the integrator
//! samples `g` through the step interpolator, brackets any sign change and
//! refines the crossing time with Brent's method. The handler then decides
//! what happens next: keep going, stop, or restart from a modified state or
//! a modified right-hand side.
//!
//! # Common Applications
//!
//! - Stopping conditions (altitude threshold, target value reached)
//! - Discontinuities of the right-hand side (switching rates, impacts)
//! - State jumps (a bouncing ball reverses its velocity at the ground)
//! - Crossing detection (sign of a coordinate, node passage)

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::IntegrationError;
use crate::interpolator::StepInterpolator;

/// Action requested by an event handler once its event occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventAction {
    /// Record the event and go on unaffected
    #[default]
    Continue,
    /// Stop integration at the event time
    Stop,
    /// Replace the state through [`EventHandler::reset_state`] and restart
    /// stepping from the event time
    ResetState,
    /// Keep the state but recompute the derivatives at the event time,
    /// because the right-hand side changed there
    ResetDerivatives,
}

/// Switching function and event callback
///
/// # Example
///
/// ```
/// use nonstiff::{EventAction, EventHandler};
///
/// /// Stop when the first component falls below a threshold
/// struct Threshold(f64);
///
/// impl EventHandler for Threshold {
///     fn g(&self, _t: f64, y: &[f64]) -> f64 {
///         y[0] - self.0
///     }
///
///     fn event_occurred(&mut self, _t: f64, _y: &[f64], _increasing: bool) -> EventAction {
///         EventAction::Stop
///     }
/// }
/// ```
pub trait EventHandler {
    /// Switching function; an event is a sign change of this value
    fn g(&self, t: f64, y: &[f64]) -> f64;

    /// Called once at the located event time
    ///
    /// `increasing` is true when `g` goes from negative to positive as time
    /// increases.
    fn event_occurred(&mut self, t: f64, y: &[f64], increasing: bool) -> EventAction;

    /// Replace the state in place; only called after
    /// [`EventAction::ResetState`]
    fn reset_state(&mut self, _t: f64, _y: &mut [f64]) {}
}

impl<E: EventHandler + ?Sized> EventHandler for Rc<RefCell<E>> {
    fn g(&self, t: f64, y: &[f64]) -> f64 {
        self.borrow().g(t, y)
    }

    fn event_occurred(&mut self, t: f64, y: &[f64], increasing: bool) -> EventAction {
        self.borrow_mut().event_occurred(t, y, increasing)
    }

    fn reset_state(&mut self, t: f64, y: &mut [f64]) {
        self.borrow_mut().reset_state(t, y)
    }
}

/// Search parameters of one registered event handler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventConfig {
    /// Largest interval between two samples of `g` (default: unbounded)
    pub max_check_interval: f64,
    /// Time accuracy of the located event (default: 1e-10)
    pub convergence: f64,
    /// Maximum root-finding iterations (default: 100)
    pub max_iterations: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_check_interval: f64::INFINITY,
            convergence: 1e-10,
            max_iterations: 100,
        }
    }
}

impl EventConfig {
    pub(crate) fn validate(&self) -> Result<(), IntegrationError> {
        if !(self.max_check_interval > 0.0) {
            return Err(IntegrationError::InvalidInput {
                message: format!(
                    "maximal check interval must be positive, got {}",
                    self.max_check_interval
                ),
            });
        }
        if !(self.convergence > 0.0 && self.convergence.is_finite()) {
            return Err(IntegrationError::InvalidInput {
                message: format!(
                    "event convergence must be positive and finite, got {}",
                    self.convergence
                ),
            });
        }
        if self.max_iterations == 0 {
            return Err(IntegrationError::InvalidInput {
                message: "event root finding needs at least one iteration".to_string(),
            });
        }
        Ok(())
    }
}

/// Brent's method for root finding
///
/// A robust root-finding algorithm combining bisection, secant method,
/// and inverse quadratic interpolation.
///
/// Reference: Brent, R.P. (1973). "Algorithms for Minimization without
/// Derivatives". Prentice-Hall.
#[derive(Debug, Clone, Copy)]
pub struct BrentSolver {
    /// Absolute tolerance on the root
    pub tol: f64,
    /// Maximum iterations
    pub max_iter: usize,
}

impl Default for BrentSolver {
    fn default() -> Self {
        Self {
            tol: 1e-12,
            max_iter: 50,
        }
    }
}

impl BrentSolver {
    /// Create a new Brent solver with specified tolerance
    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self { tol, max_iter }
    }

    /// Find the root of f between `a` and `b`, in either order.
    ///
    /// `fa` and `fb` are computed when not supplied. The returned root is
    /// within `tol` of a sign change of `f`.
    ///
    /// # Returns
    /// * `Ok((root, f_root, iterations))`
    /// * `Err(BrentError)` - If the interval does not bracket a root or the
    ///   iterations ran out
    pub fn find_root<F>(
        &self,
        mut f: F,
        mut a: f64,
        mut b: f64,
        fa: Option<f64>,
        fb: Option<f64>,
    ) -> Result<(f64, f64, usize), BrentError>
    where
        F: FnMut(f64) -> f64,
    {
        let mut fa = fa.unwrap_or_else(|| f(a));
        let mut fb = fb.unwrap_or_else(|| f(b));

        if fa * fb > 0.0 {
            return Err(BrentError::NotBracketed { a, b, fa, fb });
        }

        if fa.abs() < fb.abs() {
            std::mem::swap(&mut a, &mut b);
            std::mem::swap(&mut fa, &mut fb);
        }

        let mut c = a;
        let mut fc = fa;
        let mut mflag = true;
        let mut d = b - a;

        for iter in 0..self.max_iter {
            // b is the best guess
            if fa.abs() < fb.abs() {
                std::mem::swap(&mut a, &mut b);
                std::mem::swap(&mut fa, &mut fb);
            }

            if fb == 0.0 || (b - a).abs() <= self.tol {
                return Ok((b, fb, iter + 1));
            }

            let s = if fa != fc && fb != fc && fa != fb {
                // inverse quadratic interpolation
                a * fb * fc / ((fa - fb) * (fa - fc))
                    + b * fa * fc / ((fb - fa) * (fb - fc))
                    + c * fa * fb / ((fc - fa) * (fc - fb))
            } else if fb != fa {
                // secant
                b - fb * (b - a) / (fb - fa)
            } else {
                (a + b) / 2.0
            };

            let mid = (a + b) / 2.0;
            let use_bisection = (s - (3.0 * a + b) / 4.0) * (s - b) > 0.0
                || (mflag && (s - b).abs() >= (b - c).abs() / 2.0)
                || (!mflag && (s - b).abs() >= (c - d).abs() / 2.0)
                || (mflag && (b - c).abs() < self.tol)
                || (!mflag && (c - d).abs() < self.tol);

            let s = if use_bisection {
                mflag = true;
                mid
            } else {
                mflag = false;
                s
            };

            let fs = f(s);
            d = c;
            c = b;
            fc = fb;

            if fa * fs < 0.0 {
                b = s;
                fb = fs;
            } else {
                a = s;
                fa = fs;
            }
        }

        Err(BrentError::MaxIterations {
            current_best: b,
            f_value: fb,
            iterations: self.max_iter,
        })
    }
}

/// Errors from Brent's method
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrentError {
    /// The root is not bracketed by the given interval
    #[error("root not bracketed: f({a}) = {fa}, f({b}) = {fb} (same sign)")]
    NotBracketed {
        /// Left endpoint
        a: f64,
        /// Right endpoint
        b: f64,
        /// Function value at left endpoint
        fa: f64,
        /// Function value at right endpoint
        fb: f64,
    },
    /// Maximum iterations reached without convergence
    #[error("max iterations ({iterations}) reached, best estimate: {current_best}, f = {f_value}")]
    MaxIterations {
        /// Best root estimate so far
        current_best: f64,
        /// Function value at best estimate
        f_value: f64,
        /// Number of iterations performed
        iterations: usize,
    },
}

impl From<BrentError> for IntegrationError {
    fn from(err: BrentError) -> Self {
        match err {
            BrentError::NotBracketed { a, b, fa, fb } => IntegrationError::NoBracketing {
                t_lo: a.min(b),
                t_hi: a.max(b),
                g_lo: if a <= b { fa } else { fb },
                g_hi: if a <= b { fb } else { fa },
            },
            BrentError::MaxIterations {
                current_best,
                iterations,
                ..
            } => IntegrationError::EventConvergenceFailure {
                t: current_best,
                iterations,
            },
        }
    }
}

/// Where a registered handler stands in its detection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// No candidate event; the sign of `g` at the start of the next step is
    /// known
    Idle,
    /// A sign change was seen inside a check interval and is being refined
    Armed,
    /// An event time was located and waits for the integrator to reach it
    Bracketed,
    /// The handler was called; its action waits to be applied
    Resolved,
}

/// Detection state of one registered event handler over a run
pub struct EventState {
    handler: Box<dyn EventHandler>,
    config: EventConfig,
    status: EventStatus,
    initialized: bool,
    /// Start of the part of the step still to scan
    t0: f64,
    g0: f64,
    g0_positive: bool,
    pending_time: f64,
    /// Time of the last handled event, to avoid handling it twice
    previous_event_time: Option<f64>,
    forward: bool,
    /// Direction of `g` through the pending event, along the integration
    increasing: bool,
    next_action: EventAction,
}

impl std::fmt::Debug for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventState")
            .field("config", &self.config)
            .field("status", &self.status)
            .field("t0", &self.t0)
            .field("g0", &self.g0)
            .field("pending_time", &self.pending_time)
            .field("previous_event_time", &self.previous_event_time)
            .finish_non_exhaustive()
    }
}

impl EventState {
    /// Wrap a handler with its search parameters
    pub fn new(handler: Box<dyn EventHandler>, config: EventConfig) -> Self {
        Self {
            handler,
            config,
            status: EventStatus::Idle,
            initialized: false,
            t0: f64::NAN,
            g0: f64::NAN,
            g0_positive: true,
            pending_time: f64::NAN,
            previous_event_time: None,
            forward: true,
            increasing: true,
            next_action: EventAction::Continue,
        }
    }

    /// Search parameters
    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Current position in the detection cycle
    pub fn status(&self) -> EventStatus {
        self.status
    }

    /// Located event time, if one waits to be handled
    pub fn pending_time(&self) -> Option<f64> {
        match self.status {
            EventStatus::Bracketed | EventStatus::Resolved => Some(self.pending_time),
            _ => None,
        }
    }

    /// Forget everything learned during a previous run
    pub(crate) fn clear(&mut self) {
        self.status = EventStatus::Idle;
        self.initialized = false;
        self.pending_time = f64::NAN;
        self.previous_event_time = None;
        self.next_action = EventAction::Continue;
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record the sign of `g` at the start of the first step
    pub(crate) fn reinitialize_begin(&mut self, interpolator: &StepInterpolator) {
        self.forward = interpolator.is_forward();
        self.t0 = interpolator.previous_time();
        self.g0 = self.handler.g(self.t0, &interpolator.state_at(self.t0));
        if self.g0 == 0.0 {
            // starting exactly on a root: use the sign just after it
            let epsilon = self
                .config
                .convergence
                .max((1e-14 * self.t0).abs());
            let t_start = if self.forward {
                self.t0 + 0.5 * epsilon
            } else {
                self.t0 - 0.5 * epsilon
            };
            self.g0 = self.handler.g(t_start, &interpolator.state_at(t_start));
        }
        self.g0_positive = self.g0 >= 0.0;
        self.initialized = true;
    }

    /// Scan the part of the step after the last accepted time for an
    /// event; returns true when one was located
    pub(crate) fn evaluate_step(
        &mut self,
        interpolator: &StepInterpolator,
    ) -> Result<bool, IntegrationError> {
        self.forward = interpolator.is_forward();
        let convergence = self.config.convergence;
        let t1 = interpolator.current_time();
        let dt = t1 - self.t0;
        if dt.abs() < convergence {
            // too small to hold a distinguishable event
            return Ok(false);
        }

        let n = ((dt.abs() / self.config.max_check_interval).ceil() as usize).max(1);
        let h = dt / n as f64;
        let g = |handler: &dyn EventHandler, t: f64| handler.g(t, &interpolator.state_at(t));

        let mut ta = self.t0;
        let mut ga = self.g0;
        for i in 0..n {
            let tb = if i + 1 == n {
                t1
            } else {
                self.t0 + (i + 1) as f64 * h
            };
            let gb = g(self.handler.as_ref(), tb);

            if self.g0_positive ^ (gb >= 0.0) {
                self.status = EventStatus::Armed;

                // a previous event near ta may have converged on the wrong
                // side of its root, shift ta until the signs differ
                let epsilon = if self.forward { 0.25 } else { -0.25 } * convergence;
                let mut shifts = 0;
                while shifts < 4 && ga * gb > 0.0 {
                    ta += epsilon;
                    ga = g(self.handler.as_ref(), ta);
                    shifts += 1;
                }
                if ga * gb > 0.0 {
                    self.status = EventStatus::Idle;
                    return Err(BrentError::NotBracketed {
                        a: ta,
                        b: tb,
                        fa: ga,
                        fb: gb,
                    }
                    .into());
                }

                self.increasing = gb >= ga;

                let solver = BrentSolver::new(convergence, self.config.max_iterations);
                let handler = self.handler.as_ref();
                let (root, _, iterations) =
                    solver.find_root(|t| g(handler, t), ta, tb, Some(ga), Some(gb))?;

                let seen_before = self
                    .previous_event_time
                    .is_some_and(|previous| (root - previous).abs() <= convergence);
                if seen_before {
                    // the event handled last time, found again
                    ta = tb;
                    ga = gb;
                    self.g0_positive = gb >= 0.0;
                    self.status = EventStatus::Idle;
                } else {
                    log::trace!(
                        "event located at t = {} in {} iterations (step [{}, {}])",
                        root,
                        iterations,
                        self.t0,
                        t1
                    );
                    self.pending_time = root;
                    self.status = EventStatus::Bracketed;
                    return Ok(true);
                }
            } else {
                ta = tb;
                ga = gb;
            }
        }

        self.pending_time = f64::NAN;
        self.status = EventStatus::Idle;
        Ok(false)
    }

    /// The integrator accepted the trajectory up to `(t, y)`; calls the
    /// handler when `t` is the located event time
    pub(crate) fn step_accepted(&mut self, t: f64, y: &[f64]) {
        self.t0 = t;
        self.g0 = self.handler.g(t, y);
        let at_event = self.status == EventStatus::Bracketed
            && (self.pending_time - t).abs() <= self.config.convergence;
        if at_event {
            // force the sign to its value just after the event
            self.previous_event_time = Some(t);
            self.g0_positive = self.increasing;
            self.next_action = self
                .handler
                .event_occurred(t, y, self.increasing == self.forward);
            self.status = EventStatus::Resolved;
        } else {
            self.g0_positive = self.g0 >= 0.0;
            self.next_action = EventAction::Continue;
            if self.status == EventStatus::Bracketed {
                self.status = EventStatus::Idle;
                self.pending_time = f64::NAN;
            }
        }
    }

    /// True when the handled event asked to stop
    pub(crate) fn stop(&self) -> bool {
        self.status == EventStatus::Resolved && self.next_action == EventAction::Stop
    }

    /// Apply the handled event's action to `y`; returns true when the
    /// integrator has to restart from `(t, y)`
    pub(crate) fn reset(&mut self, t: f64, y: &mut [f64]) -> bool {
        if self.status != EventStatus::Resolved {
            return false;
        }
        if self.next_action == EventAction::ResetState {
            self.handler.reset_state(t, y);
            // g may jump with the state
            self.g0 = self.handler.g(t, y);
            if self.g0 != 0.0 {
                self.g0_positive = self.g0 >= 0.0;
            }
        }
        self.status = EventStatus::Idle;
        self.pending_time = f64::NAN;
        matches!(
            self.next_action,
            EventAction::ResetState | EventAction::ResetDerivatives
        )
    }
}
