//! Integration driver.
//!
//! [`Integrator`] owns one stepping [`Engine`] with its step-size controller
//! and tolerances, plus the registered step and event handlers. One call to
//! [`Integrator::integrate`] runs the loop: the engine takes an accepted
//! step, the event layer scans it, observers are notified, and the run ends
//! at the target time, at a stopping event, or on the first fatal error.

use crate::adams_moulton::AdamsMoulton;
use crate::controller::StepController;
use crate::error::{EvaluationPhase, IntegrationError};
use crate::events::{EventConfig, EventHandler, EventState};
use crate::gragg_bulirsch_stoer::GraggBulirschStoer;
use crate::interpolator::StepInterpolator;
use crate::runge_kutta::{EmbeddedRungeKutta, RkMethod};
use crate::step_handler::StepHandler;
use crate::system::{Evaluator, OdeSystem};
use crate::tolerance::Tolerances;

/// What an engine needs from the driver to take a step
pub(crate) struct StepContext<'a, 's> {
    pub(crate) evaluator: &'a mut Evaluator<'s>,
    pub(crate) controller: &'a StepController,
    pub(crate) tolerances: &'a Tolerances,
    /// Direction of the run, fixed by the sign of `target - t0`
    pub(crate) forward: bool,
    /// Whether the steps of this run need full dense output
    pub(crate) dense: bool,
}

/// One step accepted by an engine
#[derive(Debug)]
pub(crate) struct AcceptedStep {
    pub(crate) interpolator: StepInterpolator,
    pub(crate) t: f64,
    pub(crate) y: Vec<f64>,
}

/// The stepping method driven by an [`Integrator`]
#[derive(Debug, Clone)]
pub enum Engine {
    /// Embedded Runge-Kutta pair
    RungeKutta(EmbeddedRungeKutta),
    /// Gragg-Bulirsch-Stoer extrapolation
    Extrapolation(GraggBulirschStoer),
    /// Adams-Moulton multistep method
    Multistep(AdamsMoulton),
}

impl Engine {
    /// Diagnostic name of the method
    pub fn name(&self) -> &'static str {
        match self {
            Engine::RungeKutta(engine) => engine.name(),
            Engine::Extrapolation(engine) => engine.name(),
            Engine::Multistep(engine) => engine.name(),
        }
    }

    /// The extrapolation engine, to reach its tuning setters
    pub fn as_extrapolation_mut(&mut self) -> Option<&mut GraggBulirschStoer> {
        match self {
            Engine::Extrapolation(engine) => Some(engine),
            _ => None,
        }
    }

    /// The extrapolation engine, if this is one
    pub fn as_extrapolation(&self) -> Option<&GraggBulirschStoer> {
        match self {
            Engine::Extrapolation(engine) => Some(engine),
            _ => None,
        }
    }

    fn begin(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        forced_step: Option<f64>,
    ) -> Result<(), IntegrationError> {
        match self {
            Engine::RungeKutta(engine) => engine.begin(ctx, t0, y0, forced_step),
            Engine::Extrapolation(engine) => engine.begin(ctx, t0, y0, forced_step),
            Engine::Multistep(engine) => engine.begin(ctx, t0, y0, forced_step),
        }
    }

    fn restart(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationError> {
        match self {
            Engine::RungeKutta(engine) => engine.restart(ctx, t, y),
            Engine::Extrapolation(engine) => engine.restart(ctx, t, y),
            Engine::Multistep(engine) => engine.restart(ctx, t, y),
        }
    }

    fn advance(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        target: f64,
    ) -> Result<AcceptedStep, IntegrationError> {
        match self {
            Engine::RungeKutta(engine) => engine.advance(ctx, t, y, target),
            Engine::Extrapolation(engine) => engine.advance(ctx, t, y, target),
            Engine::Multistep(engine) => engine.advance(ctx, t, y, target),
        }
    }
}

/// How the event layer closed an accepted step
enum StepOutcome {
    /// Go on from the end of the step
    Continue { t: f64, y: Vec<f64> },
    /// An event changed the state or the system; restart from there
    Reset { t: f64, y: Vec<f64> },
    /// Target reached or stopping event
    Finished { t: f64, y: Vec<f64> },
}

/// Adaptive integrator for non-stiff systems
///
/// # Example
/// ```
/// use nonstiff::{Integrator, OdeSystem, Tolerances};
///
/// struct Decay;
///
/// impl OdeSystem for Decay {
///     fn dimension(&self) -> usize {
///         1
///     }
///
///     fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
///         dydt[0] = -y[0];
///     }
/// }
///
/// let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-10, 1e-10));
/// let mut y = [0.0];
/// let t = integrator.integrate(&Decay, 0.0, &[1.0], 2.0, &mut y).unwrap();
///
/// assert_eq!(t, 2.0);
/// assert!((y[0] - (-2.0_f64).exp()).abs() < 1e-8);
/// ```
pub struct Integrator {
    engine: Engine,
    controller: StepController,
    tolerances: Tolerances,
    step_handlers: Vec<Box<dyn StepHandler>>,
    event_states: Vec<EventState>,
    max_evaluations: u64,
    evaluations: u64,
    initial_step: Option<f64>,
}

impl std::fmt::Debug for Integrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrator")
            .field("engine", &self.engine)
            .field("controller", &self.controller)
            .field("tolerances", &self.tolerances)
            .field("step_handlers", &self.step_handlers.len())
            .field("event_states", &self.event_states)
            .field("max_evaluations", &self.max_evaluations)
            .field("evaluations", &self.evaluations)
            .finish()
    }
}

impl Integrator {
    /// Integrator around an engine and its controller
    pub fn new(engine: Engine, controller: StepController, tolerances: Tolerances) -> Self {
        Self {
            engine,
            controller,
            tolerances,
            step_handlers: Vec::new(),
            event_states: Vec::new(),
            max_evaluations: u64::MAX,
            evaluations: 0,
            initial_step: None,
        }
    }

    fn runge_kutta(method: RkMethod, min_step: f64, max_step: f64, tolerances: Tolerances) -> Self {
        Self::new(
            Engine::RungeKutta(EmbeddedRungeKutta::new(method)),
            StepController::new(min_step, max_step, method.error_order()),
            tolerances,
        )
    }

    /// Dormand-Prince 5(4) with steps bounded by `[min_step, max_step]`
    pub fn dormand_prince_54(min_step: f64, max_step: f64, tolerances: Tolerances) -> Self {
        Self::runge_kutta(RkMethod::DormandPrince54, min_step, max_step, tolerances)
    }

    /// Dormand-Prince 8(5, 3) with steps bounded by `[min_step, max_step]`
    pub fn dormand_prince_853(min_step: f64, max_step: f64, tolerances: Tolerances) -> Self {
        Self::runge_kutta(RkMethod::DormandPrince853, min_step, max_step, tolerances)
    }

    /// Gragg-Bulirsch-Stoer extrapolation with steps bounded by
    /// `[min_step, max_step]`
    ///
    /// The extrapolation engine picks its own steps; the controller only
    /// bounds them.
    pub fn gragg_bulirsch_stoer(min_step: f64, max_step: f64, tolerances: Tolerances) -> Self {
        Self::new(
            Engine::Extrapolation(GraggBulirschStoer::new()),
            StepController::new(min_step, max_step, 1),
            tolerances,
        )
    }

    /// Adams-Moulton with `n_steps` history points (order `n_steps + 1`)
    pub fn adams_moulton(
        n_steps: usize,
        min_step: f64,
        max_step: f64,
        tolerances: Tolerances,
    ) -> Result<Self, IntegrationError> {
        Ok(Self::new(
            Engine::Multistep(AdamsMoulton::new(n_steps)?),
            StepController::for_multistep(min_step, max_step, n_steps),
            tolerances,
        ))
    }

    /// Diagnostic name of the method
    pub fn name(&self) -> &'static str {
        self.engine.name()
    }

    /// The stepping engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The stepping engine, for method-specific tuning
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// The step-size controller
    pub fn controller(&self) -> &StepController {
        &self.controller
    }

    /// The step-size controller, for tuning
    pub fn controller_mut(&mut self) -> &mut StepController {
        &mut self.controller
    }

    /// Error tolerances
    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Replace the error tolerances
    pub fn set_tolerances(&mut self, tolerances: Tolerances) {
        self.tolerances = tolerances;
    }

    /// Register a step observer
    pub fn add_step_handler<H: StepHandler + 'static>(&mut self, handler: H) {
        self.step_handlers.push(Box::new(handler));
    }

    /// Remove every step observer
    pub fn clear_step_handlers(&mut self) {
        self.step_handlers.clear();
    }

    /// Number of registered step observers
    pub fn step_handler_count(&self) -> usize {
        self.step_handlers.len()
    }

    /// Register an event handler
    ///
    /// `g` is sampled at least every `max_check_interval`, the event time is
    /// located within `convergence` using at most `max_iterations`
    /// root-finding iterations.
    pub fn add_event_handler<E: EventHandler + 'static>(
        &mut self,
        handler: E,
        max_check_interval: f64,
        convergence: f64,
        max_iterations: usize,
    ) {
        let config = EventConfig {
            max_check_interval,
            convergence,
            max_iterations,
        };
        self.event_states
            .push(EventState::new(Box::new(handler), config));
    }

    /// Remove every event handler
    pub fn clear_event_handlers(&mut self) {
        self.event_states.clear();
    }

    /// Number of registered event handlers
    pub fn event_handler_count(&self) -> usize {
        self.event_states.len()
    }

    /// Detection state of the registered event handlers
    pub fn event_states(&self) -> &[EventState] {
        &self.event_states
    }

    /// Force the magnitude of the first step of the next run
    ///
    /// The step is still bounded by the controller and may be rejected.
    pub fn set_initial_step_size(&mut self, h: f64) {
        self.initial_step = Some(h);
    }

    /// Ceiling on derivative evaluations per run (default: unlimited)
    pub fn set_max_evaluations(&mut self, max_evaluations: u64) {
        self.max_evaluations = max_evaluations;
    }

    /// Ceiling on derivative evaluations per run
    pub fn max_evaluations(&self) -> u64 {
        self.max_evaluations
    }

    /// Derivative evaluations of the last run, including failed runs
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Integrate `system` from `(t0, y0)` to `t`
    ///
    /// The state reached is written to `y`. Returns the time reached, which
    /// is `t` unless an event handler stopped the run earlier.
    ///
    /// # Errors
    /// * `DimensionMismatch` - `y0`, `y` or vector tolerances disagree with
    ///   the system dimension
    /// * `InvalidInput` / `IntervalTooSmall` - unusable times, states or
    ///   settings
    /// * `StepSizeUnderflow`, `MaxEvaluationsExceeded`, `NonFiniteState`,
    ///   `EventConvergenceFailure`, `NoBracketing` - the run failed
    pub fn integrate<S: OdeSystem>(
        &mut self,
        system: &S,
        t0: f64,
        y0: &[f64],
        t: f64,
        y: &mut [f64],
    ) -> Result<f64, IntegrationError> {
        self.evaluations = 0;
        self.sanity_checks(system.dimension(), t0, y0, t, y)?;

        let forward = t > t0;
        let dense = !self.event_states.is_empty()
            || self
                .step_handlers
                .iter()
                .any(|handler| handler.requires_dense_output());
        for handler in self.step_handlers.iter_mut() {
            handler.reset();
        }
        for state in self.event_states.iter_mut() {
            state.clear();
        }

        log::debug!(
            "{}: integrating {} components from {} to {}",
            self.engine.name(),
            y0.len(),
            t0,
            t
        );

        let mut evaluator = Evaluator::new(system, self.max_evaluations);
        let result = self.run(&mut evaluator, t0, y0, t, y, forward, dense);
        self.evaluations = evaluator.count();

        match &result {
            Ok(reached) => log::debug!(
                "{}: reached t = {} with {} evaluations",
                self.engine.name(),
                reached,
                self.evaluations
            ),
            Err(err) => log::debug!(
                "{}: run failed after {} evaluations: {}",
                self.engine.name(),
                self.evaluations,
                err
            ),
        }
        result
    }

    fn sanity_checks(
        &self,
        dimension: usize,
        t0: f64,
        y0: &[f64],
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationError> {
        if y0.len() != dimension {
            return Err(IntegrationError::DimensionMismatch {
                what: "initial state",
                expected: dimension,
                actual: y0.len(),
            });
        }
        if y.len() != dimension {
            return Err(IntegrationError::DimensionMismatch {
                what: "final state",
                expected: dimension,
                actual: y.len(),
            });
        }
        if !t0.is_finite() || !t.is_finite() {
            return Err(IntegrationError::InvalidInput {
                message: "t0 and t must be finite".to_string(),
            });
        }
        for (i, &value) in y0.iter().enumerate() {
            if !value.is_finite() {
                return Err(IntegrationError::InvalidInput {
                    message: format!("y0[{}] is not finite", i),
                });
            }
        }
        if (t - t0).abs() <= 1.0e-12 * t0.abs().max(t.abs()) {
            return Err(IntegrationError::IntervalTooSmall { t0, t });
        }
        if let Some(h) = self.initial_step {
            if !h.is_finite() || h == 0.0 {
                return Err(IntegrationError::InvalidInput {
                    message: format!("initial step must be finite and non-zero, got {}", h),
                });
            }
        }
        self.tolerances.validate(dimension)?;
        self.controller.validate()?;
        for state in &self.event_states {
            state.config().validate()?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        evaluator: &mut Evaluator<'_>,
        t0: f64,
        y0: &[f64],
        target: f64,
        y_out: &mut [f64],
        forward: bool,
        dense: bool,
    ) -> Result<f64, IntegrationError> {
        let Self {
            engine,
            controller,
            tolerances,
            step_handlers,
            event_states,
            initial_step,
            ..
        } = self;
        let mut ctx = StepContext {
            evaluator,
            controller,
            tolerances,
            forward,
            dense,
        };

        engine.begin(&mut ctx, t0, y0, initial_step.take())?;

        let mut t = t0;
        let mut y = y0.to_vec();
        loop {
            let step = engine.advance(&mut ctx, t, &y, target)?;
            if !step.y.iter().all(|v| v.is_finite()) {
                return Err(IntegrationError::NonFiniteState { t: step.t });
            }

            match accept_step(step, event_states, step_handlers, target)? {
                StepOutcome::Continue { t: t_next, y: y_next } => {
                    t = t_next;
                    y = y_next;
                }
                StepOutcome::Reset { t: t_next, y: y_next } => {
                    t = t_next;
                    y = y_next;
                    if t == target {
                        y_out.copy_from_slice(&y);
                        return Ok(t);
                    }
                    log::debug!("restarting {} at t = {} after an event", engine.name(), t);
                    ctx.evaluator.set_phase(EvaluationPhase::EventHandling);
                    engine.restart(&mut ctx, t, &y)?;
                    ctx.evaluator.set_phase(EvaluationPhase::Stepping);
                }
                StepOutcome::Finished { t: t_end, y: y_end } => {
                    y_out.copy_from_slice(&y_end);
                    return Ok(t_end);
                }
            }
        }
    }
}

/// Position in `occurring` of the pending event closest to the step start
fn earliest(occurring: &[usize], states: &[EventState], forward: bool) -> Option<usize> {
    let key = |index: usize| {
        states[index]
            .pending_time()
            .map_or(f64::INFINITY, |t| if forward { t } else { -t })
    };
    occurring
        .iter()
        .enumerate()
        .min_by(|a, b| key(*a.1).total_cmp(&key(*b.1)))
        .map(|(position, _)| position)
}

/// Run the event layer on an accepted step and notify the observers
///
/// Events are handled in time order; each one splits the step for the
/// observers. A stopping or resetting event ends the step at its time.
fn accept_step(
    step: AcceptedStep,
    event_states: &mut [EventState],
    step_handlers: &mut [Box<dyn StepHandler>],
    target: f64,
) -> Result<StepOutcome, IntegrationError> {
    let AcceptedStep {
        mut interpolator,
        t: current_t,
        y: current_y,
    } = step;
    let forward = interpolator.is_forward();
    let mut previous_t = interpolator.global_previous_time();

    for state in event_states.iter_mut() {
        if !state.is_initialized() {
            state.reinitialize_begin(&interpolator);
        }
    }

    let mut occurring = Vec::new();
    for (index, state) in event_states.iter_mut().enumerate() {
        if state.evaluate_step(&interpolator)? {
            occurring.push(index);
        }
    }

    while let Some(position) = earliest(&occurring, event_states, forward) {
        let index = occurring.remove(position);
        let Some(event_t) = event_states[index].pending_time() else {
            continue;
        };

        // first part of the step, up to the event
        interpolator.set_soft_previous_time(previous_t);
        interpolator.set_soft_current_time(event_t);
        interpolator.set_interpolated_time(event_t);
        let mut event_y = interpolator.interpolated_state().to_vec();

        event_states[index].step_accepted(event_t, &event_y);
        let stop = event_states[index].stop();
        for handler in step_handlers.iter_mut() {
            handler.handle_step(&mut interpolator, stop);
        }

        if stop {
            for &other in &occurring {
                event_states[other].step_accepted(event_t, &event_y);
            }
            log::debug!("integration stopped by an event at t = {}", event_t);
            return Ok(StepOutcome::Finished {
                t: event_t,
                y: event_y,
            });
        }

        if event_states[index].reset(event_t, &mut event_y) {
            // every other switching function restarts from the new state
            for (other, state) in event_states.iter_mut().enumerate() {
                if other != index {
                    state.step_accepted(event_t, &event_y);
                }
            }
            return Ok(StepOutcome::Reset {
                t: event_t,
                y: event_y,
            });
        }

        // remaining part of the step, which may hold the same event again
        previous_t = event_t;
        interpolator.set_soft_previous_time(event_t);
        interpolator.set_soft_current_time(current_t);
        if event_states[index].evaluate_step(&interpolator)? {
            occurring.push(index);
        }
    }

    let mut is_last = current_t == target;
    for state in event_states.iter_mut() {
        state.step_accepted(current_t, &current_y);
        is_last = is_last || state.stop();
    }

    if previous_t != current_t || is_last {
        interpolator.set_interpolated_time(current_t);
        for handler in step_handlers.iter_mut() {
            handler.handle_step(&mut interpolator, is_last);
        }
    }

    Ok(if is_last {
        StepOutcome::Finished {
            t: current_t,
            y: current_y,
        }
    } else {
        StepOutcome::Continue {
            t: current_t,
            y: current_y,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use crate::step_handler::ContinuousOutput;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Decay;

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -y[0];
        }
    }

    /// y' = 1, so y = t - t0 + y0
    struct Clock;

    impl OdeSystem for Clock {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, _y: &[f64], dydt: &mut [f64]) {
            dydt[0] = 1.0;
        }
    }

    fn all_methods(tol: f64) -> Vec<Integrator> {
        let tolerances = Tolerances::new(tol, tol);
        vec![
            Integrator::dormand_prince_54(0.0, 1.0, tolerances.clone()),
            Integrator::dormand_prince_853(0.0, 1.0, tolerances.clone()),
            Integrator::gragg_bulirsch_stoer(0.0, 1.0, tolerances.clone()),
            Integrator::adams_moulton(4, 0.0, 1.0, tolerances).unwrap(),
        ]
    }

    // ==================== Validation ====================

    #[test]
    fn test_dimension_mismatch() {
        let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-6, 1e-6));
        let mut y = [0.0; 2];
        let err = integrator
            .integrate(&Decay, 0.0, &[1.0, 2.0], 1.0, &mut y)
            .unwrap_err();
        assert_eq!(
            err,
            IntegrationError::DimensionMismatch {
                what: "initial state",
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(integrator.evaluations(), 0);

        let mut integrator = Integrator::dormand_prince_54(
            0.0,
            1.0,
            Tolerances::with_components(vec![1e-6, 1e-6], vec![1e-6, 1e-6]),
        );
        let mut y = [0.0];
        assert!(matches!(
            integrator.integrate(&Decay, 0.0, &[1.0], 1.0, &mut y),
            Err(IntegrationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-6, 1e-6));
        let mut y = [0.0];

        let err = integrator
            .integrate(&Decay, 1.0, &[1.0], 1.0, &mut y)
            .unwrap_err();
        assert_eq!(err, IntegrationError::IntervalTooSmall { t0: 1.0, t: 1.0 });

        assert!(matches!(
            integrator.integrate(&Decay, 0.0, &[f64::NAN], 1.0, &mut y),
            Err(IntegrationError::InvalidInput { .. })
        ));
        assert!(matches!(
            integrator.integrate(&Decay, 0.0, &[1.0], f64::INFINITY, &mut y),
            Err(IntegrationError::InvalidInput { .. })
        ));

        integrator.set_initial_step_size(0.0);
        assert!(matches!(
            integrator.integrate(&Decay, 0.0, &[1.0], 1.0, &mut y),
            Err(IntegrationError::InvalidInput { .. })
        ));

        let mut bounds = Integrator::dormand_prince_54(2.0, 1.0, Tolerances::new(1e-6, 1e-6));
        assert!(matches!(
            bounds.integrate(&Decay, 0.0, &[1.0], 1.0, &mut y),
            Err(IntegrationError::InvalidInput { .. })
        ));

        let mut events = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-6, 1e-6));
        events.add_event_handler(Threshold::new(0.5, EventAction::Stop), 1.0, -1.0, 10);
        assert!(matches!(
            events.integrate(&Decay, 0.0, &[1.0], 1.0, &mut y),
            Err(IntegrationError::InvalidInput { .. })
        ));
    }

    // ==================== Runs ====================

    #[test]
    fn test_every_method_reaches_the_target() {
        for mut integrator in all_methods(1e-10) {
            let mut y = [0.0];
            let t = integrator.integrate(&Decay, 0.0, &[1.0], 2.0, &mut y).unwrap();
            let error = (y[0] - (-2.0_f64).exp()).abs();
            println!(
                "{:24} error {:.3e} with {} evaluations",
                integrator.name(),
                error,
                integrator.evaluations()
            );
            assert_eq!(t, 2.0);
            assert!(error < 1e-7, "{}: {}", integrator.name(), error);
        }
    }

    #[test]
    fn test_names() {
        let names: Vec<&str> = all_methods(1e-6).iter().map(Integrator::name).collect();
        assert_eq!(
            names,
            vec![
                "Dormand-Prince 5(4)",
                "Dormand-Prince 8(5, 3)",
                "Gragg-Bulirsch-Stoer",
                "Adams-Moulton"
            ]
        );
        assert!(Integrator::adams_moulton(0, 0.0, 1.0, Tolerances::new(1e-6, 1e-6)).is_err());
    }

    #[test]
    fn test_max_evaluations() {
        for mut integrator in all_methods(1e-10) {
            integrator.set_max_evaluations(30);
            let mut y = [0.0];
            let err = integrator
                .integrate(&Decay, 0.0, &[1.0], 10.0, &mut y)
                .unwrap_err();
            assert_eq!(
                err,
                IntegrationError::MaxEvaluationsExceeded {
                    limit: 30,
                    phase: EvaluationPhase::Stepping
                },
                "{}",
                integrator.name()
            );
            assert_eq!(integrator.evaluations(), 30);
        }
    }

    #[test]
    fn test_step_underflow() {
        let mut integrator = Integrator::dormand_prince_54(0.1, 1.0, Tolerances::new(1e-14, 1e-14));
        let mut y = [0.0];
        // y' = -50 y is far too stiff for a 0.1 minimal step at this tolerance
        struct Fast;
        impl OdeSystem for Fast {
            fn dimension(&self) -> usize {
                1
            }
            fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
                dydt[0] = -50.0 * y[0];
            }
        }
        assert!(matches!(
            integrator.integrate(&Fast, 0.0, &[1.0], 1.0, &mut y),
            Err(IntegrationError::StepSizeUnderflow { .. })
        ));
    }

    #[test]
    fn test_initial_step_is_consumed() {
        let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-3, 1e-3));
        integrator.set_initial_step_size(0.01);
        let output = Rc::new(RefCell::new(ContinuousOutput::new()));
        integrator.add_step_handler(output.clone());

        let mut y = [0.0];
        integrator.integrate(&Clock, 0.0, &[0.0], 1.0, &mut y).unwrap();
        let first = output.borrow().steps()[0].clone();
        assert_relative_eq!(first.current_time() - first.previous_time(), 0.01, epsilon = 1e-15);

        integrator.integrate(&Clock, 0.0, &[0.0], 1.0, &mut y).unwrap();
        // y0 = 0 makes the automatic guess start far below the forced step
        let first = output.borrow().steps()[0].clone();
        assert!(first.current_time() - first.previous_time() < 0.001);
    }

    // ==================== Events ====================

    /// g = y - level
    struct Threshold {
        level: f64,
        action: EventAction,
        times: Vec<f64>,
    }

    impl Threshold {
        fn new(level: f64, action: EventAction) -> Self {
            Self {
                level,
                action,
                times: Vec::new(),
            }
        }
    }

    impl EventHandler for Threshold {
        fn g(&self, _t: f64, y: &[f64]) -> f64 {
            y[0] - self.level
        }

        fn event_occurred(&mut self, t: f64, _y: &[f64], _increasing: bool) -> EventAction {
            self.times.push(t);
            self.action
        }

        fn reset_state(&mut self, _t: f64, y: &mut [f64]) {
            y[0] = 0.0;
        }
    }

    #[test]
    fn test_stop_event() {
        for mut integrator in all_methods(1e-10) {
            integrator.add_event_handler(
                Threshold::new(0.5, EventAction::Stop),
                f64::INFINITY,
                1e-12,
                100,
            );
            let mut y = [0.0];
            let t = integrator.integrate(&Decay, 0.0, &[1.0], 5.0, &mut y).unwrap();
            assert_relative_eq!(t, 2.0_f64.ln(), epsilon = 1e-8);
            assert_relative_eq!(y[0], 0.5, epsilon = 1e-8);
            assert_eq!(integrator.event_handler_count(), 1);
        }
    }

    #[test]
    fn test_reset_state_event_sawtooth() {
        // y' = 1 reset to 0 at y = 1: events at t = 1, 2, 3
        for mut integrator in all_methods(1e-10) {
            let handler = Rc::new(RefCell::new(Threshold::new(1.0, EventAction::ResetState)));
            integrator.add_event_handler(handler.clone(), 0.5, 1e-10, 100);
            let mut y = [0.0];
            let t = integrator.integrate(&Clock, 0.0, &[0.0], 3.5, &mut y).unwrap();
            assert_eq!(t, 3.5);
            assert_relative_eq!(y[0], 0.5, epsilon = 1e-8);

            let times = handler.borrow().times.clone();
            println!("{}: events at {:?}", integrator.name(), times);
            assert_eq!(times.len(), 3, "{}", integrator.name());
            for (k, time) in times.iter().enumerate() {
                assert_relative_eq!(*time, (k + 1) as f64, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_continue_event_splits_the_step() {
        let mut integrator = Integrator::dormand_prince_853(0.0, 10.0, Tolerances::new(1e-10, 1e-10));
        let handler = Rc::new(RefCell::new(Threshold::new(0.3, EventAction::Continue)));
        integrator.add_event_handler(handler.clone(), 10.0, 1e-12, 100);
        let output = Rc::new(RefCell::new(ContinuousOutput::new()));
        integrator.add_step_handler(output.clone());

        let mut y = [0.0];
        integrator.integrate(&Clock, 0.0, &[0.0], 1.0, &mut y).unwrap();
        assert_relative_eq!(y[0], 1.0, epsilon = 1e-12);

        let output = output.borrow();
        let boundaries: Vec<f64> = output.steps().iter().map(|s| s.current_time()).collect();
        assert!(
            boundaries.iter().any(|&t| (t - 0.3).abs() < 1e-10),
            "{:?}",
            boundaries
        );
        for pair in output.steps().windows(2) {
            assert_eq!(pair[0].current_time(), pair[1].previous_time());
        }
        assert_eq!(handler.borrow().times.len(), 1);
    }

    #[test]
    fn test_events_in_time_order() {
        let order = Rc::new(RefCell::new(Vec::new()));

        struct Tagged {
            at: f64,
            tag: &'static str,
            order: Rc<RefCell<Vec<&'static str>>>,
        }
        impl EventHandler for Tagged {
            fn g(&self, t: f64, _y: &[f64]) -> f64 {
                t - self.at
            }
            fn event_occurred(&mut self, _t: f64, _y: &[f64], _inc: bool) -> EventAction {
                self.order.borrow_mut().push(self.tag);
                EventAction::Continue
            }
        }

        let mut integrator = Integrator::dormand_prince_54(0.0, 10.0, Tolerances::new(1e-8, 1e-8));
        for (at, tag) in [(0.7, "late"), (0.2, "early"), (0.5, "middle")] {
            integrator.add_event_handler(
                Tagged {
                    at,
                    tag,
                    order: order.clone(),
                },
                10.0,
                1e-10,
                100,
            );
        }
        let mut y = [0.0];
        integrator.integrate(&Clock, 0.0, &[0.0], 1.0, &mut y).unwrap();
        assert_eq!(*order.borrow(), vec!["early", "middle", "late"]);

        // backward: the order reverses
        order.borrow_mut().clear();
        integrator.integrate(&Clock, 1.0, &[0.0], 0.0, &mut y).unwrap();
        assert_eq!(*order.borrow(), vec!["late", "middle", "early"]);
    }
}
