//! Step observers.
//!
//! A [`StepHandler`] sees every accepted step through its interpolator, in
//! step order and without gaps. Two ready-made observers are provided:
//! [`StepNormalizer`], which resamples the trajectory on a fixed grid for a
//! [`FixedStepHandler`], and [`ContinuousOutput`], which keeps the whole
//! dense trajectory for random access after the run.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::ContinuousOutputError;
use crate::interpolator::StepInterpolator;

/// Observer of accepted steps
pub trait StepHandler {
    /// Whether this observer queries the interpolator inside the step
    ///
    /// When no registered observer needs dense output and no event handler
    /// is registered, the integrators skip building it and interpolate
    /// linearly between the endpoints.
    fn requires_dense_output(&self) -> bool {
        true
    }

    /// Called at the start of every integration run
    fn reset(&mut self) {}

    /// Called once per accepted step, or per part of a step split by an
    /// event; `is_last` flags the final call of the run
    fn handle_step(&mut self, interpolator: &mut StepInterpolator, is_last: bool);
}

impl<H: StepHandler + ?Sized> StepHandler for Rc<RefCell<H>> {
    fn requires_dense_output(&self) -> bool {
        self.borrow().requires_dense_output()
    }

    fn reset(&mut self) {
        self.borrow_mut().reset()
    }

    fn handle_step(&mut self, interpolator: &mut StepInterpolator, is_last: bool) {
        self.borrow_mut().handle_step(interpolator, is_last)
    }
}

/// Observer of a trajectory sampled on a fixed grid
pub trait FixedStepHandler {
    /// Called at each grid point with the state and its derivative
    fn handle_step(&mut self, t: f64, y: &[f64], y_dot: &[f64], is_last: bool);
}

impl<H: FixedStepHandler + ?Sized> FixedStepHandler for Rc<RefCell<H>> {
    fn handle_step(&mut self, t: f64, y: &[f64], y_dot: &[f64], is_last: bool) {
        self.borrow_mut().handle_step(t, y, y_dot, is_last)
    }
}

/// Adapter from variable steps to a fixed grid `t0 + k h`
///
/// The first grid point is the start of the run. A grid point is only
/// delivered once the next one is known to exist or the run ended, so the
/// last call carries `is_last = true` and is the last grid point reached.
#[derive(Debug)]
pub struct StepNormalizer<H> {
    h: f64,
    handler: H,
    first_time: f64,
    count: u64,
    last_time: f64,
    last_state: Vec<f64>,
    last_derivatives: Vec<f64>,
    started: bool,
    forward: bool,
}

impl<H: FixedStepHandler> StepNormalizer<H> {
    /// Sample every `|h|` (the sign follows the integration direction)
    pub fn new(h: f64, handler: H) -> Self {
        Self {
            h: h.abs(),
            handler,
            first_time: f64::NAN,
            count: 0,
            last_time: f64::NAN,
            last_state: Vec::new(),
            last_derivatives: Vec::new(),
            started: false,
            forward: true,
        }
    }

    /// The wrapped handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Unwrap the handler
    pub fn into_inner(self) -> H {
        self.handler
    }

    fn grid_time(&self, k: u64) -> f64 {
        let signed = if self.forward { self.h } else { -self.h };
        self.first_time + k as f64 * signed
    }

    fn store(&mut self, interpolator: &mut StepInterpolator, t: f64) {
        interpolator.set_interpolated_time(t);
        self.last_time = t;
        self.last_state.clear();
        self.last_state
            .extend_from_slice(interpolator.interpolated_state());
        self.last_derivatives.clear();
        self.last_derivatives
            .extend_from_slice(interpolator.interpolated_derivatives());
    }
}

impl<H: FixedStepHandler> StepHandler for StepNormalizer<H> {
    fn reset(&mut self) {
        self.started = false;
        self.count = 0;
        self.first_time = f64::NAN;
        self.last_time = f64::NAN;
        self.last_state.clear();
        self.last_derivatives.clear();
        self.forward = true;
    }

    fn handle_step(&mut self, interpolator: &mut StepInterpolator, is_last: bool) {
        if !self.started {
            self.started = true;
            self.first_time = interpolator.previous_time();
            self.forward = interpolator.is_forward();
            self.count = 0;
            let t = self.first_time;
            self.store(interpolator, t);
        }

        let current = interpolator.current_time();
        let mut next = self.grid_time(self.count + 1);
        while self.forward ^ (next > current) {
            self.handler
                .handle_step(self.last_time, &self.last_state, &self.last_derivatives, false);
            self.count += 1;
            self.store(interpolator, next);
            next = self.grid_time(self.count + 1);
        }

        if is_last {
            self.handler
                .handle_step(self.last_time, &self.last_state, &self.last_derivatives, true);
        }
    }
}

/// Dense trajectory of a whole run
///
/// Register it as a step handler; after the run the solution can be queried
/// at any time through [`set_interpolated_time`](Self::set_interpolated_time).
/// Times outside the run are answered by the polynomial of the nearest step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContinuousOutput {
    initial_time: f64,
    final_time: f64,
    forward: bool,
    index: usize,
    steps: Vec<StepInterpolator>,
}

impl Default for ContinuousOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuousOutput {
    /// An empty trajectory
    pub fn new() -> Self {
        Self {
            initial_time: f64::NAN,
            final_time: f64::NAN,
            forward: true,
            index: 0,
            steps: Vec::new(),
        }
    }

    /// Start time of the trajectory (NaN when empty)
    pub fn initial_time(&self) -> f64 {
        self.initial_time
    }

    /// End time of the trajectory (NaN when empty)
    pub fn final_time(&self) -> f64 {
        self.final_time
    }

    /// Number of stored steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no step was stored
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The stored step interpolators, in step order
    pub fn steps(&self) -> &[StepInterpolator] {
        &self.steps
    }

    /// Append another trajectory that starts where this one ends
    ///
    /// The gap between the two may not exceed 0.1% of this trajectory's
    /// last step.
    pub fn append(&mut self, other: &ContinuousOutput) -> Result<(), ContinuousOutputError> {
        let Some(first) = other.steps.first() else {
            return Ok(());
        };

        match self.steps.last() {
            None => {
                self.initial_time = other.initial_time;
                self.forward = other.forward;
            }
            Some(last) => {
                if last.dimension() != first.dimension() {
                    return Err(ContinuousOutputError::DimensionMismatch {
                        expected: last.dimension(),
                        actual: first.dimension(),
                    });
                }
                if self.forward != other.forward {
                    return Err(ContinuousOutputError::DirectionMismatch);
                }
                let step = last.current_time() - last.previous_time();
                let gap = other.initial_time - last.current_time();
                if gap.abs() > 1.0e-3 * step.abs() {
                    return Err(ContinuousOutputError::Gap {
                        end: last.current_time(),
                        start: other.initial_time,
                    });
                }
            }
        }

        self.steps.extend(other.steps.iter().cloned());
        self.index = self.steps.len() - 1;
        self.final_time = self.steps[self.index].current_time();
        Ok(())
    }

    /// Move the cursor to `t`
    pub fn set_interpolated_time(&mut self, t: f64) {
        if self.steps.is_empty() {
            return;
        }
        let forward = self.forward;
        let found = self.steps.partition_point(|step| {
            if forward {
                step.current_time() < t
            } else {
                step.current_time() > t
            }
        });
        self.index = found.min(self.steps.len() - 1);
        self.steps[self.index].set_interpolated_time(t);
    }

    /// Time of the cursor
    pub fn interpolated_time(&self) -> f64 {
        self.steps
            .get(self.index)
            .map_or(f64::NAN, StepInterpolator::interpolated_time)
    }

    /// State at the cursor
    pub fn interpolated_state(&self) -> &[f64] {
        match self.steps.get(self.index) {
            Some(step) => step.interpolated_state(),
            None => &[],
        }
    }

    /// Derivatives at the cursor
    pub fn interpolated_derivatives(&self) -> &[f64] {
        match self.steps.get(self.index) {
            Some(step) => step.interpolated_derivatives(),
            None => &[],
        }
    }
}

impl StepHandler for ContinuousOutput {
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn handle_step(&mut self, interpolator: &mut StepInterpolator, _is_last: bool) {
        if self.steps.is_empty() {
            self.initial_time = interpolator.previous_time();
            self.forward = interpolator.is_forward();
        }
        self.steps.push(interpolator.clone());
        self.index = self.steps.len() - 1;
        self.final_time = interpolator.current_time();
    }
}
