//! Gragg-Bulirsch-Stoer extrapolation engine.
//!
//! Each step integrates the interval with the modified midpoint rule for an
//! increasing number of substeps and extrapolates the results to a zero
//! substep with Aitken-Neville's scheme. Both the order (the number of
//! columns) and the step size are adapted from the cost per unit time of
//! each column, following Hairer, Nørsett and Wanner, *Solving Ordinary
//! Differential Equations I*, section II.9.
//!
//! Dense output is a Hermite polynomial corrected with extrapolated
//! derivatives at the middle of the step; it needs the substep sequence
//! `4k + 2`, so that sequence is selected for runs that need dense output.

use crate::error::IntegrationError;
use crate::integrator::{AcceptedStep, StepContext};
use crate::interpolator::{DenseOutput, StepInterpolator};
use crate::tolerance::Tolerances;

/// Stability check of the midpoint substeps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityCheck {
    /// Whether the check is performed at all
    pub enabled: bool,
    /// Number of columns in which the check is performed
    pub max_iterations: usize,
    /// Number of substeps checked in each of those columns
    pub max_checks: usize,
    /// Step reduction applied when the check fails
    pub reduction: f64,
}

impl Default for StabilityCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 2,
            max_checks: 1,
            reduction: 0.5,
        }
    }
}

/// Bounds on the step-size factor `control2 / (error / control1)^(1/(2k+1))`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepsizeControl {
    /// Error scaling
    pub control1: f64,
    /// Safety factor
    pub control2: f64,
    /// Base of the factor bounds
    pub control3: f64,
    /// Divisor of the lower factor bound
    pub control4: f64,
}

impl Default for StepsizeControl {
    fn default() -> Self {
        Self {
            control1: 0.65,
            control2: 0.94,
            control3: 0.02,
            control4: 4.0,
        }
    }
}

/// Order selection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderControl {
    /// Maximal extrapolation order (even)
    pub max_order: usize,
    /// Cost ratio under which the order is decreased
    pub control1: f64,
    /// Cost ratio under which the order is increased
    pub control2: f64,
}

impl Default for OrderControl {
    fn default() -> Self {
        Self {
            max_order: 18,
            control1: 0.8,
            control2: 0.9,
        }
    }
}

/// Dense output parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolationControl {
    /// Whether the interpolation error limits the step size
    pub use_error: bool,
    /// Degree reduction of the dense polynomial, in 1..=6
    pub mudif: usize,
}

impl Default for InterpolationControl {
    fn default() -> Self {
        Self {
            use_error: true,
            mudif: 4,
        }
    }
}

/// Extrapolation engine with its four control axes
#[derive(Debug, Clone)]
pub struct GraggBulirschStoer {
    stability: StabilityCheck,
    stepsize: StepsizeControl,
    order: OrderControl,
    interpolation: InterpolationControl,

    sequence: Vec<usize>,
    cost_per_step: Vec<usize>,
    coeff: Vec<Vec<f64>>,
    cost_per_time_unit: Vec<f64>,
    optimal_step: Vec<f64>,

    target_iter: usize,
    /// Signed step to try next
    h_new: f64,
    max_error: f64,
    previous_rejected: bool,
    first_time: bool,
    y_dot0: Vec<f64>,
}

impl Default for GraggBulirschStoer {
    fn default() -> Self {
        Self::new()
    }
}

impl GraggBulirschStoer {
    /// Create an engine with every control at its default
    pub fn new() -> Self {
        let mut engine = Self {
            stability: StabilityCheck::default(),
            stepsize: StepsizeControl::default(),
            order: OrderControl::default(),
            interpolation: InterpolationControl::default(),
            sequence: Vec::new(),
            cost_per_step: Vec::new(),
            coeff: Vec::new(),
            cost_per_time_unit: Vec::new(),
            optimal_step: Vec::new(),
            target_iter: 1,
            h_new: 0.0,
            max_error: f64::MAX,
            previous_rejected: false,
            first_time: true,
            y_dot0: Vec::new(),
        };
        engine.initialize_arrays(false);
        engine
    }

    /// Diagnostic name of the method
    pub fn name(&self) -> &'static str {
        "Gragg-Bulirsch-Stoer"
    }

    /// Current stability check settings
    pub fn stability_check(&self) -> &StabilityCheck {
        &self.stability
    }

    /// Configure the stability check
    ///
    /// `max_iterations == 0` restores 2, `max_checks == 0` restores 1 and a
    /// reduction outside [1e-4, 0.9999] restores 0.5.
    pub fn set_stability_check(
        &mut self,
        enabled: bool,
        max_iterations: usize,
        max_checks: usize,
        reduction: f64,
    ) {
        let defaults = StabilityCheck::default();
        self.stability = StabilityCheck {
            enabled,
            max_iterations: if max_iterations == 0 {
                defaults.max_iterations
            } else {
                max_iterations
            },
            max_checks: if max_checks == 0 {
                defaults.max_checks
            } else {
                max_checks
            },
            reduction: if (1.0e-4..=0.9999).contains(&reduction) {
                reduction
            } else {
                defaults.reduction
            },
        };
    }

    /// Current step-size control settings
    pub fn stepsize_control(&self) -> &StepsizeControl {
        &self.stepsize
    }

    /// Configure the step-size control
    ///
    /// The first three values outside [1e-4, 0.9999] and the fourth outside
    /// [1.0001, 999.9] restore 0.65, 0.94, 0.02 and 4.0.
    pub fn set_stepsize_control(&mut self, control1: f64, control2: f64, control3: f64, control4: f64) {
        let defaults = StepsizeControl::default();
        let unit = |value: f64, default: f64| {
            if (1.0e-4..=0.9999).contains(&value) {
                value
            } else {
                default
            }
        };
        self.stepsize = StepsizeControl {
            control1: unit(control1, defaults.control1),
            control2: unit(control2, defaults.control2),
            control3: unit(control3, defaults.control3),
            control4: if (1.0001..=999.9).contains(&control4) {
                control4
            } else {
                defaults.control4
            },
        };
    }

    /// Current order control settings
    pub fn order_control(&self) -> &OrderControl {
        &self.order
    }

    /// Configure the order selection
    ///
    /// A maximal order that is odd or not above 6 restores 18; `control1`
    /// outside [0.7, 0.9] restores 0.8 and `control2` outside [0.9, 0.99]
    /// restores 0.9.
    pub fn set_order_control(&mut self, max_order: usize, control1: f64, control2: f64) {
        let defaults = OrderControl::default();
        self.order = OrderControl {
            max_order: if max_order <= 6 || max_order % 2 != 0 {
                defaults.max_order
            } else {
                max_order
            },
            control1: if (0.7..=0.9).contains(&control1) {
                control1
            } else {
                defaults.control1
            },
            control2: if (0.9..=0.99).contains(&control2) {
                control2
            } else {
                defaults.control2
            },
        };
        self.initialize_arrays(false);
    }

    /// Current dense output settings
    pub fn interpolation_control(&self) -> &InterpolationControl {
        &self.interpolation
    }

    /// Configure the dense output; `mudif` outside 1..=6 restores 4
    pub fn set_interpolation_control(&mut self, use_error: bool, mudif: usize) {
        self.interpolation = InterpolationControl {
            use_error,
            mudif: if (1..7).contains(&mudif) {
                mudif
            } else {
                InterpolationControl::default().mudif
            },
        };
    }

    /// Substep counts of the extrapolation columns
    pub fn sequence(&self) -> &[usize] {
        &self.sequence
    }

    fn initialize_arrays(&mut self, dense: bool) {
        let size = self.order.max_order / 2;
        self.sequence = (0..size)
            .map(|k| if dense { 4 * k + 2 } else { 2 * (k + 1) })
            .collect();

        self.cost_per_step = vec![0; size];
        self.cost_per_step[0] = self.sequence[0] + 1;
        for k in 1..size {
            self.cost_per_step[k] = self.cost_per_step[k - 1] + self.sequence[k];
        }

        self.coeff = (0..size)
            .map(|k| {
                (0..k)
                    .map(|l| {
                        let ratio = self.sequence[k] as f64 / self.sequence[k - l - 1] as f64;
                        1.0 / (ratio * ratio - 1.0)
                    })
                    .collect()
            })
            .collect();

        self.cost_per_time_unit = vec![0.0; size];
        self.optimal_step = vec![0.0; size];
    }

    /// Prepare a run from `(t0, y0)`
    pub(crate) fn begin(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        forced_step: Option<f64>,
    ) -> Result<(), IntegrationError> {
        self.initialize_arrays(ctx.dense);

        let log10r = ctx.tolerances.relative_hint().max(1.0e-10).log10();
        let guess = (0.5 - 0.6 * log10r).floor().max(1.0) as usize;
        self.target_iter = guess.min(self.sequence.len() - 2).max(1);

        self.max_error = f64::MAX;
        self.previous_rejected = false;
        self.first_time = true;

        self.y_dot0 = vec![0.0; y0.len()];
        ctx.evaluator.eval(t0, y0, &mut self.y_dot0)?;

        self.h_new = match forced_step {
            Some(h) => h
                .abs()
                .clamp(ctx.controller.min_step(), ctx.controller.max_step())
                .copysign(if ctx.forward { 1.0 } else { -1.0 }),
            None => ctx.controller.initial_step(
                ctx.evaluator,
                ctx.tolerances,
                ctx.forward,
                2 * self.target_iter + 1,
                t0,
                y0,
                &self.y_dot0,
            )?,
        };
        log::debug!(
            "extrapolation starts with sequence {:?}, target column {}",
            self.sequence,
            self.target_iter
        );
        Ok(())
    }

    /// Start again from `(t, y)` after an event changed the state or the
    /// system.
    pub(crate) fn restart(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegrationError> {
        self.y_dot0 = vec![0.0; y.len()];
        ctx.evaluator.eval(t, y, &mut self.y_dot0)
    }

    /// Modified midpoint rule over `step` with `sequence[k]` substeps
    ///
    /// Returns `false` when the stability check fails. `f[j]` receives the
    /// derivative at substep `j`, `y_middle` the state at the middle of the
    /// step and `y_end` the smoothed final state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn try_step(
        &self,
        ctx: &mut StepContext<'_, '_>,
        t0: f64,
        y0: &[f64],
        step: f64,
        k: usize,
        scale: &[f64],
        f: &mut [Vec<f64>],
        y_middle: &mut [f64],
        y_end: &mut [f64],
        y_tmp: &mut [f64],
    ) -> Result<bool, IntegrationError> {
        let n = self.sequence[k];
        let sub_step = step / n as f64;
        let sub_step2 = 2.0 * sub_step;

        f[0].copy_from_slice(&self.y_dot0);

        // first substep is an Euler step
        let mut t = t0 + sub_step;
        for i in 0..y0.len() {
            y_tmp[i] = y0[i];
            y_end[i] = y0[i] + sub_step * f[0][i];
        }
        ctx.evaluator.eval(t, y_end, &mut f[1])?;

        for j in 1..n {
            if 2 * j == n {
                y_middle.copy_from_slice(y_end);
            }

            t += sub_step;
            for i in 0..y0.len() {
                let middle = y_end[i];
                y_end[i] = y_tmp[i] + sub_step2 * f[j][i];
                y_tmp[i] = middle;
            }
            ctx.evaluator.eval(t, y_end, &mut f[j + 1])?;

            if self.stability.enabled
                && j <= self.stability.max_checks
                && k < self.stability.max_iterations
            {
                let mut initial_norm = 0.0;
                let mut delta_norm = 0.0;
                for l in 0..scale.len() {
                    let ratio = f[0][l] / scale[l];
                    initial_norm += ratio * ratio;
                    let ratio = (f[j + 1][l] - f[0][l]) / scale[l];
                    delta_norm += ratio * ratio;
                }
                if delta_norm > 4.0 * initial_norm.max(1.0e-15) {
                    return Ok(false);
                }
            }
        }

        // smoothing of the last substep
        for i in 0..y0.len() {
            y_end[i] = 0.5 * (y_tmp[i] + y_end[i] + sub_step * f[n][i]);
        }
        Ok(true)
    }

    /// Take one accepted step from `(t, y)` toward `target`
    pub(crate) fn advance(
        &mut self,
        ctx: &mut StepContext<'_, '_>,
        t: f64,
        y: &[f64],
        target: f64,
    ) -> Result<AcceptedStep, IntegrationError> {
        let dim = y.len();
        let size = self.sequence.len();
        let forward = ctx.forward;

        let mut fk: Vec<Vec<Vec<f64>>> = self
            .sequence
            .iter()
            .map(|&s| vec![vec![0.0; dim]; s + 1])
            .collect();
        let mut diagonal = vec![vec![0.0; dim]; size - 1];
        let mut y1_diag = vec![vec![0.0; dim]; size - 1];
        let mut y_mid_dots = vec![vec![0.0; dim]; 1 + 2 * size];
        let mut y1 = vec![0.0; dim];
        let mut y_tmp = vec![0.0; dim];
        let mut y_dot1 = vec![0.0; dim];
        let mut scale = vec![0.0; dim];

        loop {
            rescale(ctx.tolerances, y, y, &mut scale);

            let mut step = self.h_new;
            let mut last = false;
            if (forward && t + step >= target) || (!forward && t + step <= target) {
                step = target - t;
                last = true;
            }

            // magnitude of the next step, signed at the end
            let mut h_next = step.abs();
            let mut reject = false;
            let mut k = 0;
            loop {
                let stable = {
                    let (y_middle, y_end) = if k == 0 {
                        (&mut y_mid_dots[0], &mut y1)
                    } else {
                        (&mut diagonal[k - 1], &mut y1_diag[k - 1])
                    };
                    self.try_step(
                        ctx, t, y, step, k, &scale, &mut fk[k], y_middle, y_end, &mut y_tmp,
                    )?
                };

                if !stable {
                    h_next = ctx
                        .controller
                        .filter_step(step * self.stability.reduction, forward, false, t)?
                        .abs();
                    reject = true;
                    log::debug!("midpoint rule unstable at t = {} with step {:.3e}", t, step);
                    break;
                }

                if k > 0 {
                    extrapolate(&self.coeff, 0, k, &mut y1_diag, &mut y1);
                    rescale(ctx.tolerances, y, &y1, &mut scale);

                    let mut error = 0.0;
                    for j in 0..dim {
                        let e = (y1[j] - y1_diag[0][j]).abs() / scale[j];
                        error += e * e;
                    }
                    let error = (error / dim as f64).sqrt();

                    if error > 1.0e15 || (k > 1 && error > self.max_error) {
                        h_next = ctx
                            .controller
                            .filter_step(step * self.stability.reduction, forward, false, t)?
                            .abs();
                        reject = true;
                        break;
                    }
                    self.max_error = (4.0 * error).max(1.0);

                    // optimal step for this column
                    let exp = 1.0 / (2 * k + 1) as f64;
                    let mut fac =
                        self.stepsize.control2 / (error / self.stepsize.control1).powf(exp);
                    let pow = self.stepsize.control3.powf(exp);
                    fac = (pow / self.stepsize.control4).max((1.0 / pow).min(fac));
                    self.optimal_step[k] = ctx
                        .controller
                        .filter_step(step * fac, forward, true, t)?
                        .abs();
                    self.cost_per_time_unit[k] = self.cost_per_step[k] as f64 / self.optimal_step[k];

                    let offset = k as isize - self.target_iter as isize;
                    let mut converged = false;
                    match offset {
                        -1 => {
                            if self.target_iter > 1 && !self.previous_rejected {
                                if error <= 1.0 {
                                    converged = true;
                                } else {
                                    let ratio = (self.sequence[self.target_iter]
                                        * self.sequence[self.target_iter + 1])
                                        as f64
                                        / (self.sequence[0] * self.sequence[0]) as f64;
                                    if error > ratio * ratio {
                                        // no convergence expected on the next column
                                        reject = true;
                                        converged = true;
                                        self.target_iter = k;
                                        self.lower_order_if_cheaper();
                                        h_next = self.optimal_step[self.target_iter];
                                    }
                                }
                            }
                        }
                        0 => {
                            if error <= 1.0 {
                                converged = true;
                            } else {
                                let ratio = self.sequence[k + 1] as f64 / self.sequence[0] as f64;
                                if error > ratio * ratio {
                                    reject = true;
                                    converged = true;
                                    self.lower_order_if_cheaper();
                                    h_next = self.optimal_step[self.target_iter];
                                }
                            }
                        }
                        1 => {
                            if error > 1.0 {
                                reject = true;
                                self.lower_order_if_cheaper();
                                h_next = self.optimal_step[self.target_iter];
                            }
                            converged = true;
                        }
                        _ => {
                            if (self.first_time || last) && error <= 1.0 {
                                converged = true;
                            }
                        }
                    }
                    if converged {
                        break;
                    }
                }
                k += 1;
            }

            if !reject {
                ctx.evaluator.eval(t + step, &y1, &mut y_dot1)?;
            }

            let mut h_int = ctx.controller.max_step();
            let mut dense = DenseOutput::Endpoint;
            if ctx.dense && !reject {
                let mudif = self.interpolation.mudif as isize;
                let mu = 2 * k as isize - mudif + 3;
                self.mid_point_derivatives(k, mu, step, &mut fk, &mut diagonal, &mut y_mid_dots);
                let polynomials =
                    compute_coefficients(mu, step, y, &self.y_dot0, &y1, &y_dot1, &y_mid_dots);

                if mu >= 0 && self.interpolation.use_error {
                    let interp_error = estimate_error(&polynomials, &scale);
                    h_int = (step / interp_error.powf(1.0 / (mu + 4) as f64).max(0.01)).abs();
                    if interp_error > 10.0 {
                        log::debug!(
                            "interpolation error {:.3e} too large at t = {}, step {:.3e}",
                            interp_error,
                            t,
                            step
                        );
                        h_next = h_int;
                        reject = true;
                    }
                }
                dense = DenseOutput::Extrapolation { polynomials };
            }

            if !reject {
                h_next = self.select_order(k, step, t);
            }

            h_next = h_next.min(h_int);
            h_next = ctx.controller.filter_step(h_next, true, true, t)?;
            self.h_new = if forward { h_next } else { -h_next };
            self.first_time = false;
            self.previous_rejected = reject;

            if !reject {
                let t_end = if last { target } else { t + step };
                let interpolator = StepInterpolator::new(t, y.to_vec(), t_end, y1.clone(), dense);
                self.y_dot0.copy_from_slice(&y_dot1);
                return Ok(AcceptedStep {
                    interpolator,
                    t: t_end,
                    y: y1,
                });
            }
        }
    }

    fn lower_order_if_cheaper(&mut self) {
        let ti = self.target_iter;
        if ti > 1 && self.cost_per_time_unit[ti - 1] < self.order.control1 * self.cost_per_time_unit[ti] {
            self.target_iter -= 1;
        }
    }

    /// Pick the column for the next step after an accepted step in column
    /// `k` and return the magnitude of the next step.
    fn select_order(&mut self, k: usize, step: f64, t: f64) -> f64 {
        let size = self.sequence.len();
        let ctu = &self.cost_per_time_unit;
        let (oc1, oc2) = (self.order.control1, self.order.control2);

        let optimal_iter = if k == 1 {
            if self.previous_rejected {
                1
            } else {
                2
            }
        } else if k <= self.target_iter {
            if ctu[k - 1] < oc1 * ctu[k] {
                k - 1
            } else if ctu[k] < oc2 * ctu[k - 1] {
                (k + 1).min(size - 2)
            } else {
                k
            }
        } else {
            let mut optimal = k - 1;
            if k > 2 && ctu[k - 2] < oc1 * ctu[k - 1] {
                optimal = k - 2;
            }
            if ctu[k] < oc2 * ctu[optimal] {
                optimal = k.min(size - 2);
            }
            optimal
        };

        let h_next = if self.previous_rejected {
            // after a rejection neither order nor step may grow
            self.target_iter = optimal_iter.min(k);
            step.abs().min(self.optimal_step[self.target_iter])
        } else {
            let h = if optimal_iter <= k {
                self.optimal_step[optimal_iter]
            } else if k < self.target_iter && ctu[k] < oc2 * ctu[k - 1] {
                self.optimal_step[k] * self.cost_per_step[optimal_iter + 1] as f64
                    / self.cost_per_step[k] as f64
            } else {
                self.optimal_step[k] * self.cost_per_step[optimal_iter] as f64
                    / self.cost_per_step[k] as f64
            };
            if optimal_iter != self.target_iter {
                log::debug!(
                    "extrapolation column changes from {} to {} at t = {}",
                    self.target_iter,
                    optimal_iter,
                    t
                );
            }
            self.target_iter = optimal_iter;
            h
        };
        h_next
    }

    /// Extrapolate the state and its derivatives at the middle of the step
    /// into `y_mid_dots`, scaled by powers of the step.
    fn mid_point_derivatives(
        &self,
        k: usize,
        mu: isize,
        step: f64,
        fk: &mut [Vec<Vec<f64>>],
        diagonal: &mut [Vec<f64>],
        y_mid_dots: &mut [Vec<f64>],
    ) {
        let dim = y_mid_dots[0].len();
        for j in 1..=k {
            extrapolate(&self.coeff, 0, j, diagonal, &mut y_mid_dots[0]);
        }

        for l in 0..mu.max(0) as usize {
            let l2 = l / 2;
            let mut factor = (0.5 * self.sequence[l2] as f64).powi(l as i32);
            let middle = fk[l2].len() / 2;
            for i in 0..dim {
                y_mid_dots[l + 1][i] = factor * fk[l2][middle + l][i];
            }
            for j in 1..=k.saturating_sub(l2) {
                factor = (0.5 * self.sequence[j + l2] as f64).powi(l as i32);
                let middle = fk[l2 + j].len() / 2;
                for i in 0..dim {
                    diagonal[j - 1][i] = factor * fk[l2 + j][middle + l][i];
                }
                extrapolate(&self.coeff, l2, j, diagonal, &mut y_mid_dots[l + 1]);
            }
            for value in y_mid_dots[l + 1].iter_mut() {
                *value *= step;
            }

            // centered differences give the next derivatives
            for f in fk.iter_mut().take(k + 1).skip((l + 1) / 2) {
                for m in (2 * (l + 1)..f.len()).rev() {
                    let (lower, upper) = f.split_at_mut(m);
                    for (value, previous) in upper[0].iter_mut().zip(&lower[m - 2]) {
                        *value -= previous;
                    }
                }
            }
        }
    }
}

fn rescale(tolerances: &Tolerances, y1: &[f64], y2: &[f64], scale: &mut [f64]) {
    for (i, s) in scale.iter_mut().enumerate() {
        *s = tolerances.scale(i, y1[i].abs().max(y2[i].abs()));
    }
}

/// Aitken-Neville update of the extrapolation diagonal with column `k`
///
/// `diag[k - 1]` holds the newest column on entry; `last` receives the
/// extrapolated value.
fn extrapolate(coeff: &[Vec<f64>], offset: usize, k: usize, diag: &mut [Vec<f64>], last: &mut [f64]) {
    let c = &coeff[k + offset];
    for j in 1..k {
        for i in 0..last.len() {
            let value = diag[k - j][i] + c[j - 1] * (diag[k - j][i] - diag[k - j - 1][i]);
            diag[k - j - 1][i] = value;
        }
    }
    for i in 0..last.len() {
        last[i] = diag[0][i] + c[k - 1] * (diag[0][i] - last[i]);
    }
}

/// Dense polynomial of degree `mu + 4` (3 when `mu < 0`)
fn compute_coefficients(
    mu: isize,
    h: f64,
    y0: &[f64],
    y0_dot: &[f64],
    y1: &[f64],
    y1_dot: &[f64],
    y_mid_dots: &[Vec<f64>],
) -> Vec<Vec<f64>> {
    let degree = if mu < 0 { 3 } else { mu as usize + 4 };
    let mut p = vec![vec![0.0; y0.len()]; degree + 1];

    for i in 0..y0.len() {
        let yp0 = h * y0_dot[i];
        let yp1 = h * y1_dot[i];
        let ydiff = y1[i] - y0[i];
        let aspl = ydiff - yp1;
        let bspl = yp0 - ydiff;

        p[0][i] = y0[i];
        p[1][i] = ydiff;
        p[2][i] = aspl;
        p[3][i] = bspl;

        if mu < 0 {
            continue;
        }

        let ph0 = 0.5 * (y0[i] + y1[i]) + 0.125 * (aspl + bspl);
        p[4][i] = 16.0 * (y_mid_dots[0][i] - ph0);

        if mu > 0 {
            let ph1 = ydiff + 0.25 * (aspl - bspl);
            p[5][i] = 16.0 * (y_mid_dots[1][i] - ph1);

            if mu > 1 {
                let ph2 = yp1 - yp0;
                p[6][i] = 16.0 * (y_mid_dots[2][i] - ph2 + p[4][i]);

                if mu > 2 {
                    let ph3 = 6.0 * (bspl - aspl);
                    p[7][i] = 16.0 * (y_mid_dots[3][i] - ph3 + 3.0 * p[5][i]);

                    for j in 4..=mu as usize {
                        let fac1 = 0.5 * (j * (j - 1)) as f64;
                        let fac2 = 2.0 * fac1 * ((j - 2) * (j - 3)) as f64;
                        p[j + 4][i] =
                            16.0 * (y_mid_dots[j][i] + fac1 * p[j + 2][i] - fac2 * p[j][i]);
                    }
                }
            }
        }
    }
    p
}

/// Error of the dense polynomial, from its highest coefficient
fn estimate_error(polynomials: &[Vec<f64>], scale: &[f64]) -> f64 {
    let degree = polynomials.len() - 1;
    if degree < 5 {
        return 0.0;
    }
    let mut error = 0.0;
    for (coefficient, s) in polynomials[degree].iter().zip(scale) {
        let e = coefficient / s;
        error += e * e;
    }
    (error / scale.len() as f64).sqrt() * error_factor(degree - 5)
}

fn error_factor(i: usize) -> f64 {
    let ip5 = (i + 5) as f64;
    let e = 0.5 * ((i + 1) as f64 / ip5).sqrt();
    (0..=i).fold(1.0 / (ip5 * ip5), |acc, j| acc * e / (j + 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StepController;
    use crate::system::{Evaluator, OdeSystem};
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

    /// Harmonic oscillator, exact solution [cos t, -sin t]
    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        }
    }

    fn run<S: OdeSystem>(
        sys: &S,
        y0: &[f64],
        target: f64,
        tol: f64,
        dense: bool,
    ) -> (Vec<f64>, Vec<StepInterpolator>) {
        let controller = StepController::new(0.0, 10.0, 1);
        let tolerances = Tolerances::new(tol, tol);
        let mut evaluator = Evaluator::new(sys, u64::MAX);
        let mut ctx = StepContext {
            evaluator: &mut evaluator,
            controller: &controller,
            tolerances: &tolerances,
            forward: target > 0.0,
            dense,
        };
        let mut engine = GraggBulirschStoer::new();
        engine.begin(&mut ctx, 0.0, y0, None).unwrap();

        let mut t = 0.0;
        let mut y = y0.to_vec();
        let mut steps = Vec::new();
        while t != target {
            let step = engine.advance(&mut ctx, t, &y, target).unwrap();
            t = step.t;
            y = step.y;
            steps.push(step.interpolator);
        }
        (y, steps)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    #[test]
    fn test_sequences() {
        let mut engine = GraggBulirschStoer::new();
        assert_eq!(&engine.sequence()[..4], &[2, 4, 6, 8]);
        assert_eq!(engine.cost_per_step[..3], [3, 7, 13]);
        engine.initialize_arrays(true);
        assert_eq!(&engine.sequence()[..4], &[2, 6, 10, 14]);
        assert_eq!(engine.sequence().len(), 9);
        assert_relative_eq!(engine.coeff[1][0], 1.0 / 8.0);
    }

    #[test]
    fn test_setters_restore_defaults() {
        let mut engine = GraggBulirschStoer::new();

        engine.set_stability_check(false, 0, 3, 2.0);
        assert_eq!(
            *engine.stability_check(),
            StabilityCheck {
                enabled: false,
                max_iterations: 2,
                max_checks: 3,
                reduction: 0.5
            }
        );

        engine.set_stepsize_control(0.5, 0.0, 0.05, 1.0);
        assert_eq!(
            *engine.stepsize_control(),
            StepsizeControl {
                control1: 0.5,
                control2: 0.94,
                control3: 0.05,
                control4: 4.0
            }
        );

        engine.set_order_control(9, 0.75, 2.0);
        assert_eq!(engine.order_control().max_order, 18);
        assert_eq!(engine.order_control().control1, 0.75);
        assert_eq!(engine.order_control().control2, 0.9);
        engine.set_order_control(10, -1.0, -1.0);
        assert_eq!(engine.sequence().len(), 5);

        engine.set_interpolation_control(false, 7);
        assert_eq!(engine.interpolation_control().mudif, 4);
        assert!(!engine.interpolation_control().use_error);
        engine.set_interpolation_control(true, 2);
        assert_eq!(engine.interpolation_control().mudif, 2);
    }

    #[test]
    fn test_extrapolate_polynomial_in_h_squared() {
        // values of 1 + h^2 for h = 1/n with the sequence 2, 4, 6
        let engine = GraggBulirschStoer::new();
        let seq = engine.sequence();
        let value = |k: usize| {
            let h = 1.0 / seq[k] as f64;
            vec![1.0 + h * h]
        };
        let mut last = value(0);
        let mut diag = vec![vec![0.0]; 2];
        diag[0] = value(1);
        extrapolate(&engine.coeff, 0, 1, &mut diag, &mut last);
        assert_relative_eq!(last[0], 1.0, epsilon = 1e-14);
        diag[1] = value(2);
        extrapolate(&engine.coeff, 0, 2, &mut diag, &mut last);
        assert_relative_eq!(last[0], 1.0, epsilon = 1e-14);
    }

    // ========================================================================
    // Integration
    // ========================================================================

    #[test]
    fn test_exponential_decay() {
        let (y, steps) = run(&ExpDecay, &[1.0], 2.0, 1e-10, false);
        let exact = (-2.0_f64).exp();
        println!(
            "GBS: y(2) = {:.15}, error {:.3e} in {} steps",
            y[0],
            (y[0] - exact).abs(),
            steps.len()
        );
        assert!((y[0] - exact).abs() < 1e-8);
    }

    #[test]
    fn test_dense_output_on_oscillator() {
        let (y, steps) = run(&Oscillator, &[1.0, 0.0], 6.0, 1e-10, true);
        assert_relative_eq!(y[0], 6.0_f64.cos(), epsilon = 1e-7);

        let mut worst: f64 = 0.0;
        for step in &steps {
            let (a, b) = (step.previous_time(), step.current_time());
            for k in 0..=8 {
                let t = a + (b - a) * k as f64 / 8.0;
                let state = step.state_at(t);
                worst = worst.max((state[0] - t.cos()).abs());
                worst = worst.max((state[1] + t.sin()).abs());
            }
        }
        println!("GBS dense output: worst error {:.3e} over {} steps", worst, steps.len());
        assert!(worst < 1e-6, "worst dense error {}", worst);
    }

    #[test]
    fn test_error_factor() {
        assert_relative_eq!(error_factor(0), 1.0 / 25.0 * 0.5 * (0.2_f64).sqrt());
    }
}
