//! Step-size control shared by the adaptive integrators.
//!
//! The controller is an I-controller in the sense of Hairer, Nørsett and
//! Wanner: the next step is the tried step scaled by
//! `safety * error^(-1/(q+1))` on acceptance and `safety * error^(-1/q)` on
//! rejection, where `q` is the order of the error estimator, and the factor
//! is kept inside `[min_reduction, max_growth]`.

use crate::error::IntegrationError;
use crate::system::Evaluator;
use crate::tolerance::Tolerances;

const DEFAULT_SAFETY: f64 = 0.9;
const DEFAULT_MIN_REDUCTION: f64 = 0.2;
const DEFAULT_MAX_GROWTH: f64 = 10.0;

/// Verdict of the controller on one attempted step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The step meets the tolerance; `h_next` is the size to try next
    Accept {
        /// Proposed next step (signed)
        h_next: f64,
    },
    /// The step must be retried with `h_retry`
    Reject {
        /// Smaller step to retry with (signed)
        h_retry: f64,
    },
}

/// Step-size controller with safety factor and growth bounds
///
/// Each setter restores the documented default when handed an out-of-range
/// value, so `set_safety(0.0)` is the way to ask for "the default again".
#[derive(Debug, Clone)]
pub struct StepController {
    safety: f64,
    min_reduction: f64,
    max_growth: f64,
    default_max_growth: f64,
    h_min: f64,
    h_max: f64,
    /// Order of the error estimator
    order: usize,
}

impl StepController {
    /// Create a controller for an error estimator of order `order`
    ///
    /// `h_min` and `h_max` bound the step magnitude. `h_min == 0` allows
    /// unlimited shrinking, bounded only by the evaluation ceiling.
    pub fn new(h_min: f64, h_max: f64, order: usize) -> Self {
        Self {
            safety: DEFAULT_SAFETY,
            min_reduction: DEFAULT_MIN_REDUCTION,
            max_growth: DEFAULT_MAX_GROWTH,
            default_max_growth: DEFAULT_MAX_GROWTH,
            h_min: h_min.abs(),
            h_max: h_max.abs(),
            order: order.max(1),
        }
    }

    /// Controller tuned for an Adams method with `n_steps` history points,
    /// whose history is costly to rescale: growth is capped at `2^(1/order)`
    /// with the method order `n_steps + 1`. The error exponent stays
    /// `1/n_steps`.
    pub(crate) fn for_multistep(h_min: f64, h_max: f64, n_steps: usize) -> Self {
        let n_steps = n_steps.max(1);
        let growth = 2.0_f64.powf(1.0 / (n_steps + 1) as f64);
        Self {
            max_growth: growth,
            default_max_growth: growth,
            ..Self::new(h_min, h_max, n_steps)
        }
    }

    /// Safety factor applied to every proposed step
    pub fn safety(&self) -> f64 {
        self.safety
    }

    /// Set the safety factor; values outside (0, 1) restore 0.9
    pub fn set_safety(&mut self, safety: f64) {
        self.safety = if safety > 0.0 && safety < 1.0 {
            safety
        } else {
            DEFAULT_SAFETY
        };
    }

    /// Smallest factor a rejected step may be scaled by
    pub fn min_reduction(&self) -> f64 {
        self.min_reduction
    }

    /// Set the minimal reduction factor; values outside (0, 1) restore 0.2
    pub fn set_min_reduction(&mut self, min_reduction: f64) {
        self.min_reduction = if min_reduction > 0.0 && min_reduction < 1.0 {
            min_reduction
        } else {
            DEFAULT_MIN_REDUCTION
        };
    }

    /// Largest factor an accepted step may be scaled by
    pub fn max_growth(&self) -> f64 {
        self.max_growth
    }

    /// Set the maximal growth factor; values not above 1 restore the
    /// method default
    pub fn set_max_growth(&mut self, max_growth: f64) {
        self.max_growth = if max_growth > 1.0 && max_growth.is_finite() {
            max_growth
        } else {
            self.default_max_growth
        };
    }

    /// Minimal step magnitude
    pub fn min_step(&self) -> f64 {
        self.h_min
    }

    /// Maximal step magnitude
    pub fn max_step(&self) -> f64 {
        self.h_max
    }

    /// Order of the error estimator driving the exponents
    pub fn order(&self) -> usize {
        self.order
    }

    pub(crate) fn validate(&self) -> Result<(), IntegrationError> {
        if !self.h_min.is_finite() || self.h_max.is_nan() || self.h_max == 0.0 {
            return Err(IntegrationError::InvalidInput {
                message: format!(
                    "step bounds [{}, {}] are not usable",
                    self.h_min, self.h_max
                ),
            });
        }
        if self.h_min > self.h_max {
            return Err(IntegrationError::InvalidInput {
                message: format!(
                    "minimal step {} exceeds maximal step {}",
                    self.h_min, self.h_max
                ),
            });
        }
        Ok(())
    }

    /// Accept or reject a step of size `h` tried at `t` with normalized
    /// error `error` (≤ 1 meets the tolerance)
    pub fn decide(&self, error: f64, h: f64, t: f64) -> Result<Decision, IntegrationError> {
        let q = self.order as f64;
        if error <= 1.0 {
            let factor = if error == 0.0 {
                self.max_growth
            } else {
                (self.safety * error.powf(-1.0 / (q + 1.0))).min(self.max_growth)
            };
            return Ok(Decision::Accept {
                h_next: self.clamp(h * factor, h),
            });
        }

        if self.h_min > 0.0 && h.abs() <= self.h_min {
            log::warn!(
                "step of {:.3e} at t = {} rejected with error {:.3e} at the minimal step",
                h,
                t,
                error
            );
            let needed = h.abs() * (self.safety * error.powf(-1.0 / q)).max(self.min_reduction);
            return Err(IntegrationError::StepSizeUnderflow {
                t,
                min: self.h_min,
                needed,
            });
        }

        // NaN and infinite errors fall back to the strongest reduction
        let factor = (self.safety * error.powf(-1.0 / q)).max(self.min_reduction);
        let h_retry = self.clamp(h * factor, h);
        log::debug!(
            "step of {:.3e} at t = {} rejected (error {:.3e}), retrying with {:.3e}",
            h,
            t,
            error,
            h_retry
        );
        Ok(Decision::Reject { h_retry })
    }

    /// Keep the magnitude of `h` inside `[h_min, h_max]` with the sign of
    /// `reference`.
    fn clamp(&self, h: f64, reference: f64) -> f64 {
        h.abs().clamp(self.h_min, self.h_max).copysign(reference)
    }

    /// Bound a step proposed by a method with its own step logic
    ///
    /// Steps below the minimum are raised to it when `accept_small` is set,
    /// and reported as an underflow otherwise.
    pub fn filter_step(
        &self,
        h: f64,
        forward: bool,
        accept_small: bool,
        t: f64,
    ) -> Result<f64, IntegrationError> {
        let mut filtered = h;
        if filtered.abs() < self.h_min {
            if accept_small {
                filtered = if forward { self.h_min } else { -self.h_min };
            } else {
                log::warn!("step {:.3e} below minimal step at t = {}", h, t);
                return Err(IntegrationError::StepSizeUnderflow {
                    t,
                    min: self.h_min,
                    needed: h.abs(),
                });
            }
        }
        if filtered > self.h_max {
            filtered = self.h_max;
        } else if filtered < -self.h_max {
            filtered = -self.h_max;
        }
        Ok(filtered)
    }

    /// Guess a first step from the scale of the derivative
    ///
    /// A rough step is derived from `||y|| / ||y'||`, an explicit Euler
    /// probe (one extra evaluation) estimates the second derivative, and the
    /// result targets a local error of 1% for a method of order `order`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initial_step(
        &self,
        evaluator: &mut Evaluator<'_>,
        tolerances: &Tolerances,
        forward: bool,
        order: usize,
        t0: f64,
        y0: &[f64],
        y_dot0: &[f64],
    ) -> Result<f64, IntegrationError> {
        let n = y0.len();
        let scale: Vec<f64> = y0
            .iter()
            .enumerate()
            .map(|(i, yi)| tolerances.scale(i, yi.abs()))
            .collect();

        let mut y_on_scale2 = 0.0;
        let mut y_dot_on_scale2 = 0.0;
        for i in 0..n {
            let ratio = y0[i] / scale[i];
            y_on_scale2 += ratio * ratio;
            let ratio = y_dot0[i] / scale[i];
            y_dot_on_scale2 += ratio * ratio;
        }

        let mut h = if y_on_scale2 < 1.0e-10 || y_dot_on_scale2 < 1.0e-10 {
            1.0e-6
        } else {
            0.01 * (y_on_scale2 / y_dot_on_scale2).sqrt()
        };
        if !forward {
            h = -h;
        }

        // Euler probe
        let y1: Vec<f64> = y0.iter().zip(y_dot0).map(|(y, d)| y + h * d).collect();
        let mut y_dot1 = vec![0.0; n];
        evaluator.eval(t0 + h, &y1, &mut y_dot1)?;

        let mut y_ddot_on_scale = 0.0;
        for i in 0..n {
            let ratio = (y_dot1[i] - y_dot0[i]) / scale[i];
            y_ddot_on_scale += ratio * ratio;
        }
        y_ddot_on_scale = y_ddot_on_scale.sqrt() / h.abs();

        let max_inv2 = y_dot_on_scale2.sqrt().max(y_ddot_on_scale);
        let h1 = if max_inv2 < 1.0e-15 {
            1.0e-6_f64.max(0.001 * h.abs())
        } else {
            (0.01 / max_inv2).powf(1.0 / order.max(1) as f64)
        };

        let mut h = (100.0 * h.abs()).min(h1);
        // avoid a step too small to change t0
        h = h.max(1.0e-12 * t0.abs());
        h = h.clamp(self.h_min, self.h_max);
        Ok(if forward { h } else { -h })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::OdeSystem;
    use approx::assert_relative_eq;

    #[test]
    fn test_accept_growth_is_bounded() {
        let controller = StepController::new(1e-6, 1.0, 4);

        // zero error grows by the full factor, then hits h_max
        match controller.decide(0.0, 0.05, 0.0).unwrap() {
            Decision::Accept { h_next } => assert_relative_eq!(h_next, 0.5),
            other => panic!("unexpected {:?}", other),
        }
        match controller.decide(0.0, 0.5, 0.0).unwrap() {
            Decision::Accept { h_next } => assert_eq!(h_next, 1.0),
            other => panic!("unexpected {:?}", other),
        }

        // err = 0.5 with q = 4 gives 0.9 * 2^(1/5)
        match controller.decide(0.5, -0.01, 0.0).unwrap() {
            Decision::Accept { h_next } => {
                assert_relative_eq!(h_next, -0.01 * 0.9 * 2.0_f64.powf(0.2), epsilon = 1e-15)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reject_and_underflow() {
        let controller = StepController::new(1e-3, 1.0, 4);

        match controller.decide(1.0e6, 0.1, 0.0).unwrap() {
            Decision::Reject { h_retry } => assert_relative_eq!(h_retry, 0.02),
            other => panic!("unexpected {:?}", other),
        }
        match controller.decide(f64::NAN, 0.1, 0.0).unwrap() {
            Decision::Reject { h_retry } => assert_relative_eq!(h_retry, 0.02),
            other => panic!("unexpected {:?}", other),
        }
        // the retry never goes below h_min
        match controller.decide(1.0e6, 0.002, 0.0).unwrap() {
            Decision::Reject { h_retry } => assert_eq!(h_retry, 1e-3),
            other => panic!("unexpected {:?}", other),
        }
        // failing again at h_min is fatal
        let err = controller.decide(2.0, 1e-3, 4.0).unwrap_err();
        assert!(matches!(
            err,
            IntegrationError::StepSizeUnderflow { t, min, .. } if t == 4.0 && min == 1e-3
        ));

        // h_min == 0 never underflows
        let unbounded = StepController::new(0.0, 1.0, 4);
        assert!(unbounded.decide(1.0e3, 1e-300, 0.0).is_ok());
    }

    #[test]
    fn test_setters_restore_defaults() {
        let mut controller = StepController::new(0.0, 1.0, 4);
        controller.set_safety(0.8);
        assert_eq!(controller.safety(), 0.8);
        controller.set_safety(1.5);
        assert_eq!(controller.safety(), 0.9);

        controller.set_min_reduction(0.5);
        assert_eq!(controller.min_reduction(), 0.5);
        controller.set_min_reduction(-1.0);
        assert_eq!(controller.min_reduction(), 0.2);

        controller.set_max_growth(5.0);
        assert_eq!(controller.max_growth(), 5.0);
        controller.set_max_growth(0.5);
        assert_eq!(controller.max_growth(), 10.0);

        // four history points, a fifth-order method
        let mut multistep = StepController::for_multistep(0.0, 1.0, 4);
        assert_relative_eq!(multistep.max_growth(), 2.0_f64.powf(0.2));
        assert_eq!(multistep.order(), 4);
        multistep.set_max_growth(1.0);
        assert_relative_eq!(multistep.max_growth(), 2.0_f64.powf(0.2));
    }

    #[test]
    fn test_filter_step() {
        let controller = StepController::new(0.1, 2.0, 4);
        assert_eq!(controller.filter_step(0.01, true, true, 0.0).unwrap(), 0.1);
        assert_eq!(controller.filter_step(-0.01, false, true, 0.0).unwrap(), -0.1);
        assert_eq!(controller.filter_step(-5.0, false, false, 0.0).unwrap(), -2.0);
        assert!(controller.filter_step(0.01, true, false, 0.0).is_err());
    }

    #[test]
    fn test_initial_step_is_bounded_and_signed() {
        struct Decay;
        impl OdeSystem for Decay {
            fn dimension(&self) -> usize {
                1
            }
            fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
                dydt[0] = -y[0];
            }
        }

        let sys = Decay;
        let tol = Tolerances::new(1e-8, 1e-8);
        let controller = StepController::new(0.0, 0.5, 4);
        let mut evaluator = Evaluator::new(&sys, u64::MAX);

        let h = controller
            .initial_step(&mut evaluator, &tol, true, 5, 0.0, &[1.0], &[-1.0])
            .unwrap();
        assert!(h > 0.0 && h <= 0.5, "h = {}", h);
        assert_eq!(evaluator.count(), 1);

        let h = controller
            .initial_step(&mut evaluator, &tol, false, 5, 0.0, &[1.0], &[-1.0])
            .unwrap();
        assert!(h < 0.0 && h >= -0.5, "h = {}", h);

        let narrow = StepController::new(0.3, 0.4, 4);
        let h = narrow
            .initial_step(&mut evaluator, &tol, true, 5, 0.0, &[1.0], &[-1.0])
            .unwrap();
        assert!((0.3..=0.4).contains(&h), "h = {}", h);
        println!("initial step tests used {} evaluations", evaluator.count());
    }
}
