//! Embedded Runge-Kutta engines: Dormand-Prince 5(4) and 8(5, 3).
//!
//! Both pairs are FSAL in practice: the derivative at the accepted state is
//! computed anyway (as the last stage for 5(4), after acceptance for
//! 8(5, 3)) and becomes the first stage of the next step.

use crate::coefficients::{dormand_prince_54 as dp54, dormand_prince_853 as dp853};
use crate::controller::Decision;
use crate::error::IntegrationError;
use crate::integrator::{AcceptedStep, StepContext};
use crate::interpolator::{DenseOutput, StepInterpolator};

/// The embedded pairs available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RkMethod {
    /// Dormand-Prince 5(4), 7 stages, 4th-order dense output
    DormandPrince54,
    /// Dormand-Prince 8(5, 3), 12 stages, 7th-order dense output
    DormandPrince853,
}

impl RkMethod {
    /// Diagnostic name of the method
    pub fn name(self) -> &'static str {
        match self {
            RkMethod::DormandPrince54 => "Dormand-Prince 5(4)",
            RkMethod::DormandPrince853 => "Dormand-Prince 8(5, 3)",
        }
    }

    /// Order of the propagated solution
    pub fn order(self) -> usize {
        match self {
            RkMethod::DormandPrince54 => dp54::ORDER as usize,
            RkMethod::DormandPrince853 => dp853::ORDER as usize,
        }
    }

    /// Order of the error estimator used by the step-size controller
    pub fn error_order(self) -> usize {
        match self {
            RkMethod::DormandPrince54 => dp54::EMBEDDED_ORDER as usize,
            // the blended 5/3 estimate behaves like an order 7 one
            RkMethod::DormandPrince853 => 7,
        }
    }
}

/// Single-step engine for one of the embedded pairs
#[derive(Debug, Clone)]
pub struct EmbeddedRungeKutta {
    method: RkMethod,
    /// Stage derivatives; `k[0]` is f(t, y) at the start of the next step
    k: Vec<Vec<f64>>,
    y_stage: Vec<f64>,
    y_new: Vec<f64>,
    /// Signed step to try next
    h: f64,
}

impl EmbeddedRungeKutta {
    /// Create an engine for `method`
    pub fn new(method: RkMethod) -> Self {
        Self {
            method,
            k: Vec::new(),
            y_stage: Vec::new(),
            y_new: Vec::new(),
            h: 0.0,
        }
    }

    /// The pair driven by this engine
    pub fn method(&self) -> RkMethod {
        self.method
    }

    /// Diagnostic name of the method
    pub fn name(&self) -> &'static str {
        self.method.name()
    }

    fn allocate(&mut self, n: usize) {
        let slots = match self.method {
            RkMethod::DormandPrince54 => dp54::STAGES,
            RkMethod::DormandPrince853 => dp853::STAGES + 1 + dp853::DENSE_STAGES,
        };
        if self.k.len() != slots || self.y_new.len() != n {
            self.k = vec![vec![0.0; n]; slots];
            self.y_stage = vec![0.0; n];
            self.y_new = vec![0.0; n];
        }
    }

    /// Prepare a run from `(t0, y0)`: first derivative and first step
    pub(crate) fn begin(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        forced_step: Option<f64>,
    ) -> Result<(), IntegrationError> {
        let mut y_dot0 = vec![0.0; y0.len()];
        ctx.evaluator.eval(t0, y0, &mut y_dot0)?;
        self.begin_from(ctx, t0, y0, &y_dot0, forced_step)
    }

    /// Same as [`begin`](Self::begin) with the first derivative already known
    pub(crate) fn begin_from(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        y_dot0: &[f64],
        forced_step: Option<f64>,
    ) -> Result<(), IntegrationError> {
        self.allocate(y0.len());
        self.k[0].copy_from_slice(y_dot0);
        self.h = match forced_step {
            Some(h) => h
                .abs()
                .clamp(ctx.controller.min_step(), ctx.controller.max_step())
                .copysign(if ctx.forward { 1.0 } else { -1.0 }),
            None => ctx.controller.initial_step(
                ctx.evaluator,
                ctx.tolerances,
                ctx.forward,
                self.method.order(),
                t0,
                y0,
                &self.k[0],
            )?,
        };
        Ok(())
    }

    /// Start again from `(t, y)` after an event changed the state or the
    /// system. The cached first stage is recomputed.
    pub(crate) fn restart(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationError> {
        self.allocate(y.len());
        ctx.evaluator.eval(t, y, &mut self.k[0])
    }

    /// Compute the stages for a step of size `h` from `(t, y)` and return
    /// the normalized error; the new state is left in `y_new`.
    ///
    /// `k[0]` must hold f(t, y).
    pub(crate) fn try_step(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> Result<f64, IntegrationError> {
        match self.method {
            RkMethod::DormandPrince54 => self.stages_54(ctx, t, y, h),
            RkMethod::DormandPrince853 => self.stages_853(ctx, t, y, h),
        }
    }

    #[allow(clippy::needless_range_loop)]
    fn stages_54(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> Result<f64, IntegrationError> {
        let n = y.len();
        for i in 1..dp54::STAGES {
            for c in 0..n {
                let mut sum = 0.0;
                for j in 0..i {
                    sum += dp54::A[i][j] * self.k[j][c];
                }
                self.y_stage[c] = y[c] + h * sum;
            }
            // the last row is B, so the last argument is the new state
            if i == dp54::STAGES - 1 {
                self.y_new.copy_from_slice(&self.y_stage);
            }
            ctx.evaluator
                .eval(t + dp54::C[i] * h, &self.y_stage, &mut self.k[i])?;
        }

        let mut error = 0.0;
        for c in 0..n {
            let mut err_c = 0.0;
            for j in 0..dp54::STAGES {
                err_c += dp54::E[j] * self.k[j][c];
            }
            let sk = ctx.tolerances.scale(c, y[c].abs().max(self.y_new[c].abs()));
            let ratio = h * err_c / sk;
            error += ratio * ratio;
        }
        Ok((error / n as f64).sqrt())
    }

    #[allow(clippy::needless_range_loop)]
    fn stages_853(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> Result<f64, IntegrationError> {
        let n = y.len();
        for i in 1..dp853::STAGES {
            for c in 0..n {
                let mut sum = 0.0;
                for j in 0..i {
                    sum += dp853::A[i][j] * self.k[j][c];
                }
                self.y_stage[c] = y[c] + h * sum;
            }
            ctx.evaluator
                .eval(t + dp853::C[i] * h, &self.y_stage, &mut self.k[i])?;
        }

        let mut err = 0.0;
        let mut err2 = 0.0;
        for c in 0..n {
            let mut increment = 0.0;
            let mut third = 0.0;
            let mut fifth = 0.0;
            for j in 0..dp853::STAGES {
                increment += dp853::B[j] * self.k[j][c];
                third += dp853::BHH[j] * self.k[j][c];
                fifth += dp853::E[j] * self.k[j][c];
            }
            self.y_new[c] = y[c] + h * increment;

            let sk = ctx.tolerances.scale(c, y[c].abs().max(self.y_new[c].abs()));
            let ratio = fifth / sk;
            err += ratio * ratio;
            let ratio = (increment - third) / sk;
            err2 += ratio * ratio;
        }

        let mut deno = err + 0.01 * err2;
        if deno <= 0.0 {
            deno = 1.0;
        }
        Ok(h.abs() * err * (1.0 / (n as f64 * deno)).sqrt())
    }

    /// Take one accepted step from `(t, y)` toward `target`
    pub(crate) fn advance(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        target: f64,
    ) -> Result<AcceptedStep, IntegrationError> {
        let mut h = self.h;
        loop {
            let mut last = false;
            if (ctx.forward && t + h >= target) || (!ctx.forward && t + h <= target) {
                h = target - t;
                last = true;
            }

            let error = self.try_step(ctx, t, y, h)?;
            match ctx.controller.decide(error, h, t)? {
                Decision::Accept { h_next } => {
                    self.h = h_next;
                    let t_end = if last { target } else { t + h };
                    return self.finish_step(ctx, t, y, h, t_end);
                }
                Decision::Reject { h_retry } => h = h_retry,
            }
        }
    }

    /// Build the interpolator of an accepted step and shift the FSAL stage.
    fn finish_step(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        h: f64,
        t_end: f64,
    ) -> Result<AcceptedStep, IntegrationError> {
        let fsal = match self.method {
            RkMethod::DormandPrince54 => dp54::STAGES - 1,
            RkMethod::DormandPrince853 => {
                ctx.evaluator
                    .eval(t + h, &self.y_new, &mut self.k[dp853::STAGES])?;
                dp853::STAGES
            }
        };

        let dense = if ctx.dense {
            DenseOutput::RungeKutta {
                coefficients: self.dense_coefficients(ctx, t, y, h)?,
            }
        } else {
            DenseOutput::Endpoint
        };

        let interpolator =
            StepInterpolator::new(t, y.to_vec(), t_end, self.y_new.clone(), dense);
        self.k.swap(0, fsal);

        Ok(AcceptedStep {
            interpolator,
            t: t_end,
            y: self.y_new.clone(),
        })
    }

    /// Continuous extension coefficients for the step just accepted;
    /// the derivative at the new state sits in `k[fsal]`.
    #[allow(clippy::needless_range_loop)]
    fn dense_coefficients(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> Result<Vec<Vec<f64>>, IntegrationError> {
        let n = y.len();
        match self.method {
            RkMethod::DormandPrince54 => {
                let mut cont = vec![vec![0.0; n]; 5];
                for c in 0..n {
                    let ydiff = self.y_new[c] - y[c];
                    let bspl = h * self.k[0][c] - ydiff;
                    cont[0][c] = y[c];
                    cont[1][c] = ydiff;
                    cont[2][c] = bspl;
                    cont[3][c] = ydiff - h * self.k[dp54::STAGES - 1][c] - bspl;
                    let mut sum = 0.0;
                    for j in 0..dp54::STAGES {
                        sum += dp54::D[j] * self.k[j][c];
                    }
                    cont[4][c] = h * sum;
                }
                Ok(cont)
            }
            RkMethod::DormandPrince853 => {
                // stages 14 to 16
                for s in 0..dp853::DENSE_STAGES {
                    let slot = dp853::STAGES + 1 + s;
                    for c in 0..n {
                        let mut sum = 0.0;
                        for j in 0..slot {
                            sum += dp853::A_DENSE[s][j] * self.k[j][c];
                        }
                        self.y_stage[c] = y[c] + h * sum;
                    }
                    ctx.evaluator
                        .eval(t + dp853::C_DENSE[s] * h, &self.y_stage, &mut self.k[slot])?;
                }

                let mut cont = vec![vec![0.0; n]; 8];
                for c in 0..n {
                    let ydiff = self.y_new[c] - y[c];
                    let bspl = h * self.k[0][c] - ydiff;
                    cont[0][c] = y[c];
                    cont[1][c] = ydiff;
                    cont[2][c] = bspl;
                    cont[3][c] = ydiff - h * self.k[dp853::STAGES][c] - bspl;
                    for (row, d) in dp853::D.iter().enumerate() {
                        let mut sum = 0.0;
                        for (j, weight) in d.iter().enumerate() {
                            sum += weight * self.k[j][c];
                        }
                        cont[4 + row][c] = h * sum;
                    }
                }
                Ok(cont)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StepController;
    use crate::system::{Evaluator, OdeSystem};
    use crate::tolerance::Tolerances;
    use approx::assert_relative_eq;

    struct ExpDecay;

    impl OdeSystem for ExpDecay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -y[0];
        }
    }

    /// y' = cos(t), y(0) = 0, exact y = sin(t)
    struct Sine;

    impl OdeSystem for Sine {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, t: f64, _y: &[f64], dydt: &mut [f64]) {
            dydt[0] = t.cos();
        }
    }

    fn run<S: OdeSystem>(
        method: RkMethod,
        sys: &S,
        t0: f64,
        y0: &[f64],
        target: f64,
        tol: f64,
        dense: bool,
    ) -> (Vec<f64>, Vec<StepInterpolator>, u64) {
        let controller = StepController::new(0.0, 1.0, method.error_order());
        let tolerances = Tolerances::new(tol, tol);
        let mut evaluator = Evaluator::new(sys, u64::MAX);
        let mut ctx = StepContext {
            evaluator: &mut evaluator,
            controller: &controller,
            tolerances: &tolerances,
            forward: target > t0,
            dense,
        };
        let mut engine = EmbeddedRungeKutta::new(method);
        engine.begin(&mut ctx, t0, y0, None).unwrap();

        let mut t = t0;
        let mut y = y0.to_vec();
        let mut steps = Vec::new();
        while t != target {
            let step = engine.advance(&mut ctx, t, &y, target).unwrap();
            t = step.t;
            y = step.y;
            steps.push(step.interpolator);
        }
        drop(ctx);
        (y, steps, evaluator.count())
    }

    #[test]
    fn test_dp54_exponential_decay() {
        let (y, steps, evals) = run(
            RkMethod::DormandPrince54,
            &ExpDecay,
            0.0,
            &[1.0],
            1.0,
            1e-8,
            false,
        );
        let exact = (-1.0_f64).exp();
        println!(
            "DP54: y(1) = {:.15}, error {:.3e}, {} steps, {} evaluations",
            y[0],
            (y[0] - exact).abs(),
            steps.len(),
            evals
        );
        assert!((y[0] - exact).abs() < 1e-6);
    }

    #[test]
    fn test_dp853_backward_decay() {
        let (y, _, _) = run(
            RkMethod::DormandPrince853,
            &ExpDecay,
            1.0,
            &[(-1.0_f64).exp()],
            0.0,
            1e-10,
            false,
        );
        assert_relative_eq!(y[0], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_dense_output_matches_solution() {
        for method in [RkMethod::DormandPrince54, RkMethod::DormandPrince853] {
            let (_, steps, _) = run(method, &Sine, 0.0, &[0.0], 3.0, 1e-10, true);
            let mut worst: f64 = 0.0;
            for step in &steps {
                let (a, b) = (step.previous_time(), step.current_time());
                for k in 1..10 {
                    let t = a + (b - a) * k as f64 / 10.0;
                    worst = worst.max((step.state_at(t)[0] - t.sin()).abs());
                }
                assert_eq!(step.state_at(b), step.current_state());
            }
            println!("{}: worst dense error {:.3e}", method.name(), worst);
            assert!(worst < 1e-7, "{}: {}", method.name(), worst);
        }
    }

    #[test]
    fn test_evaluations_per_step() {
        // after the first derivative and the initial step probe, DP54 costs
        // 6 evaluations per accepted step without rejection
        let sys = ExpDecay;
        let controller = StepController::new(0.0, 1.0, 4);
        let tolerances = Tolerances::new(1e-3, 1e-3);
        let mut evaluator = Evaluator::new(&sys, u64::MAX);
        let mut ctx = StepContext {
            evaluator: &mut evaluator,
            controller: &controller,
            tolerances: &tolerances,
            forward: true,
            dense: false,
        };
        let mut engine = EmbeddedRungeKutta::new(RkMethod::DormandPrince54);
        engine.begin(&mut ctx, 0.0, &[1.0], Some(0.01)).unwrap();
        engine.advance(&mut ctx, 0.0, &[1.0], 1.0).unwrap();
        drop(ctx);
        assert_eq!(evaluator.count(), 1 + 6);
    }

    #[test]
    fn test_names() {
        assert_eq!(RkMethod::DormandPrince54.name(), "Dormand-Prince 5(4)");
        assert_eq!(RkMethod::DormandPrince853.name(), "Dormand-Prince 8(5, 3)");
        assert_eq!(RkMethod::DormandPrince853.order(), 8);
    }
}
