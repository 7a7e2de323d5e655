//! Adams-Moulton predictor-corrector in Nordsieck form.
//!
//! The history of past derivatives is carried as a Nordsieck vector, so a
//! step-size change is a rescaling of its rows instead of a recomputation.
//! Each step is PECE: predict by Taylor expansion, evaluate, correct with
//! the implicit Adams-Moulton formula, evaluate again at the corrected state.
//! The difference between corrector and predictor is the error estimate.
//!
//! The history is built by one Dormand-Prince 8(5, 3) step whose dense
//! output supplies the derivatives at `n_steps + 1` equally spaced points.

use crate::controller::{Decision, StepController};
use crate::error::IntegrationError;
use crate::integrator::{AcceptedStep, StepContext};
use crate::interpolator::{DenseOutput, StepInterpolator};
use crate::nordsieck::NordsieckTransformer;
use crate::runge_kutta::{EmbeddedRungeKutta, RkMethod};

/// Multistep engine with `n_steps` history points, of order `n_steps + 1`
#[derive(Debug, Clone)]
pub struct AdamsMoulton {
    transformer: NordsieckTransformer,
    /// `h y'` at the current point
    scaled: Vec<f64>,
    /// Rows `h^k y^(k) / k!`, `k = 2..=n_steps + 1`
    nordsieck: Vec<Vec<f64>>,
    /// Step the Nordsieck vector is scaled for
    scaling_h: f64,
    /// Signed step to try next
    h: f64,
    /// Derivative at the point the next start procedure begins from
    y_dot: Vec<f64>,
    needs_start: bool,
    forced_step: Option<f64>,
}

impl AdamsMoulton {
    /// Create an engine using `n_steps` history points
    pub fn new(n_steps: usize) -> Result<Self, IntegrationError> {
        Ok(Self {
            transformer: NordsieckTransformer::new(n_steps)?,
            scaled: Vec::new(),
            nordsieck: Vec::new(),
            scaling_h: 0.0,
            h: 0.0,
            y_dot: Vec::new(),
            needs_start: true,
            forced_step: None,
        })
    }

    /// Diagnostic name of the method
    pub fn name(&self) -> &'static str {
        "Adams-Moulton"
    }

    /// Number of history points
    pub fn n_steps(&self) -> usize {
        self.transformer.n_steps()
    }

    /// Order of the method
    pub fn order(&self) -> usize {
        self.n_steps() + 1
    }

    pub(crate) fn begin(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        forced_step: Option<f64>,
    ) -> Result<(), IntegrationError> {
        self.forced_step = forced_step;
        self.restart(ctx, t0, y0)
    }

    /// Throw the history away; the next step runs the start procedure
    /// from `(t, y)`.
    pub(crate) fn restart(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationError> {
        self.y_dot = vec![0.0; y.len()];
        ctx.evaluator.eval(t, y, &mut self.y_dot)?;
        self.needs_start = true;
        Ok(())
    }

    /// Build the Nordsieck vector at `t` from one Dormand-Prince 8(5, 3)
    /// step toward `target`
    pub(crate) fn start(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        target: f64,
    ) -> Result<(), IntegrationError> {
        let starter_controller = StepController::new(
            ctx.controller.min_step(),
            ctx.controller.max_step(),
            RkMethod::DormandPrince853.error_order(),
        );
        let mut starter = EmbeddedRungeKutta::new(RkMethod::DormandPrince853);
        let mut starter_ctx = StepContext {
            evaluator: &mut *ctx.evaluator,
            controller: &starter_controller,
            tolerances: ctx.tolerances,
            forward: ctx.forward,
            dense: true,
        };
        starter.begin_from(&mut starter_ctx, t, y, &self.y_dot, self.forced_step.take())?;
        let first = starter.advance(&mut starter_ctx, t, y, target)?;
        let interpolator = first.interpolator;

        let n_steps = self.n_steps();
        let previous = interpolator.global_previous_time();
        let h = (interpolator.global_current_time() - previous) / (n_steps + 1) as f64;

        let scale = |derivative: Vec<f64>| -> Vec<f64> { derivative.iter().map(|d| h * d).collect() };
        self.scaled = scale(interpolator.derivative_at(previous));
        let multistep: Vec<Vec<f64>> = (1..=n_steps)
            .map(|i| scale(interpolator.derivative_at(previous + i as f64 * h)))
            .collect();
        self.nordsieck = self.transformer.initialize_high_order(&self.scaled, &multistep);

        self.scaling_h = h;
        self.h = h;
        self.needs_start = false;
        log::debug!(
            "multistep history of {} points built at t = {} with step {:.3e}",
            n_steps,
            t,
            h
        );
        Ok(())
    }

    /// Rescale the Nordsieck vector for a step of `h`
    fn rescale(&mut self, h: f64) {
        let ratio = h / self.scaling_h;
        for s in self.scaled.iter_mut() {
            *s *= ratio;
        }
        let mut power = ratio;
        for row in self.nordsieck.iter_mut() {
            power *= ratio;
            for value in row.iter_mut() {
                *value *= power;
            }
        }
        self.scaling_h = h;
    }

    /// Predict, evaluate and correct a step of `h` from `(t, y)` ending at
    /// `t_end`; returns the normalized predictor-corrector difference.
    ///
    /// The Nordsieck vector must already be scaled for `h`.
    pub(crate) fn try_step(
        &self,
        ctx: &mut StepContext<'_, '_>,
        y: &[f64],
        h: f64,
        t_end: f64,
    ) -> Result<(f64, Correction), IntegrationError> {
        let n = y.len();

        // predict
        let predicted: Vec<f64> = (0..n)
            .map(|i| y[i] + self.scaled[i] + self.nordsieck.iter().map(|row| row[i]).sum::<f64>())
            .collect();

        // evaluate
        let mut y_dot = vec![0.0; n];
        ctx.evaluator.eval(t_end, &predicted, &mut y_dot)?;
        let predicted_scaled: Vec<f64> = y_dot.iter().map(|d| h * d).collect();
        let mut nordsieck = self.transformer.update_phase1(&self.nordsieck);
        self.transformer
            .update_phase2(&self.scaled, &predicted_scaled, &mut nordsieck);

        // correct
        let mut state = vec![0.0; n];
        let mut error = 0.0;
        for i in 0..n {
            let mut sum = 0.0;
            for (row, values) in nordsieck.iter().enumerate() {
                if row % 2 == 0 {
                    sum -= values[i];
                } else {
                    sum += values[i];
                }
            }
            state[i] = y[i] + predicted_scaled[i] + sum;
            let tol = ctx.tolerances.scale(i, y[i].abs().max(state[i].abs()));
            let ratio = (state[i] - predicted[i]) / tol;
            error += ratio * ratio;
        }

        Ok((
            (error / n as f64).sqrt(),
            Correction {
                state,
                predicted_scaled,
                nordsieck,
            },
        ))
    }

    /// Take one accepted step from `(t, y)` toward `target`
    pub(crate) fn advance(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        target: f64,
    ) -> Result<AcceptedStep, IntegrationError> {
        if self.needs_start {
            self.start(ctx, t, y, target)?;
        }

        loop {
            let mut h = self.h;
            let mut last = false;
            if (ctx.forward && t + h >= target) || (!ctx.forward && t + h <= target) {
                h = target - t;
                last = true;
            }
            if h != self.scaling_h {
                self.rescale(h);
            }
            let t_end = if last { target } else { t + h };

            let (error, correction) = self.try_step(ctx, y, h, t_end)?;
            match ctx.controller.decide(error, h, t)? {
                Decision::Reject { h_retry } => self.h = h_retry,
                Decision::Accept { h_next } => {
                    let Correction {
                        state,
                        predicted_scaled,
                        mut nordsieck,
                    } = correction;

                    // evaluate at the corrected state
                    let mut y_dot = vec![0.0; y.len()];
                    ctx.evaluator.eval(t_end, &state, &mut y_dot)?;
                    let corrected_scaled: Vec<f64> = y_dot.iter().map(|d| h * d).collect();
                    self.transformer
                        .update_phase2(&predicted_scaled, &corrected_scaled, &mut nordsieck);

                    self.scaled = corrected_scaled;
                    self.nordsieck = nordsieck;
                    self.h = h_next;

                    let dense = if ctx.dense {
                        DenseOutput::Nordsieck {
                            scaled: self.scaled.clone(),
                            nordsieck: self.nordsieck.clone(),
                        }
                    } else {
                        DenseOutput::Endpoint
                    };
                    let interpolator =
                        StepInterpolator::new(t, y.to_vec(), t_end, state.clone(), dense);
                    return Ok(AcceptedStep {
                        interpolator,
                        t: t_end,
                        y: state,
                    });
                }
            }
        }
    }
}

/// Corrected state of a tried step with the data needed to commit it
#[derive(Debug)]
pub(crate) struct Correction {
    state: Vec<f64>,
    predicted_scaled: Vec<f64>,
    /// Nordsieck rows updated with the predicted derivative
    nordsieck: Vec<Vec<f64>>,
}
