//! Dense output for one accepted step.
//!
//! Every integrator hands its step observers a [`StepInterpolator`] that
//! owns a copy of the data it needs, so it can be cloned, stored and queried
//! long after the integrator moved on. The polynomial depends on the method
//! that produced the step.

/// Method-specific polynomial data for one step
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub(crate) enum DenseOutput {
    /// Linear blend of the endpoint states, used when no dense output was
    /// requested for the step
    Endpoint,

    /// Runge-Kutta continuous extension in alternating Horner form:
    /// `c0 + θ(c1 + (1-θ)(c2 + θ(c3 + (1-θ)(c4 + ...))))`
    RungeKutta {
        /// `coefficients[k][i]` is `c_k` for component `i`
        coefficients: Vec<Vec<f64>>,
    },

    /// Hermite polynomial plus extrapolated corrections, in powers of
    /// `θ(1-θ)` around the step midpoint
    Extrapolation {
        /// `polynomials[k][i]`, degree `polynomials.len() - 1`
        polynomials: Vec<Vec<f64>>,
    },

    /// Nordsieck vector of a multistep method, referenced at the current
    /// time and scaled by the step size
    Nordsieck {
        /// First scaled derivative `h y'`
        scaled: Vec<f64>,
        /// Rows `h^k y^(k) / k!` for `k = 2..`
        nordsieck: Vec<Vec<f64>>,
    },
}

/// Interpolator over one accepted step
///
/// The global bounds are the step as the integrator computed it. The soft
/// bounds are what the step observers see: they shrink to an event time
/// when an event splits the step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StepInterpolator {
    global_previous_time: f64,
    global_current_time: f64,
    soft_previous_time: f64,
    soft_current_time: f64,
    forward: bool,
    previous_state: Vec<f64>,
    current_state: Vec<f64>,
    dense: DenseOutput,
    interpolated_time: f64,
    interpolated_state: Vec<f64>,
    interpolated_derivatives: Vec<f64>,
}

impl StepInterpolator {
    pub(crate) fn new(
        previous_time: f64,
        previous_state: Vec<f64>,
        current_time: f64,
        current_state: Vec<f64>,
        dense: DenseOutput,
    ) -> Self {
        let dimension = current_state.len();
        let mut interpolator = Self {
            global_previous_time: previous_time,
            global_current_time: current_time,
            soft_previous_time: previous_time,
            soft_current_time: current_time,
            forward: current_time >= previous_time,
            previous_state,
            current_state,
            dense,
            interpolated_time: current_time,
            interpolated_state: vec![0.0; dimension],
            interpolated_derivatives: vec![0.0; dimension],
        };
        interpolator.set_interpolated_time(current_time);
        interpolator
    }

    /// Start of the step as seen by step observers
    pub fn previous_time(&self) -> f64 {
        self.soft_previous_time
    }

    /// End of the step as seen by step observers
    pub fn current_time(&self) -> f64 {
        self.soft_current_time
    }

    /// Start of the step as computed by the integrator
    pub fn global_previous_time(&self) -> f64 {
        self.global_previous_time
    }

    /// End of the step as computed by the integrator
    pub fn global_current_time(&self) -> f64 {
        self.global_current_time
    }

    pub(crate) fn set_soft_previous_time(&mut self, t: f64) {
        self.soft_previous_time = t;
    }

    pub(crate) fn set_soft_current_time(&mut self, t: f64) {
        self.soft_current_time = t;
    }

    /// True when the step runs toward increasing time
    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Number of state components
    pub fn dimension(&self) -> usize {
        self.current_state.len()
    }

    /// State at the start of the integrator step
    pub fn previous_state(&self) -> &[f64] {
        &self.previous_state
    }

    /// State at the end of the integrator step
    pub fn current_state(&self) -> &[f64] {
        &self.current_state
    }

    /// Move the cursor of this interpolator
    ///
    /// Times slightly outside the step are accepted; the polynomial is
    /// simply extrapolated.
    pub fn set_interpolated_time(&mut self, t: f64) {
        self.interpolated_time = t;
        let mut state = std::mem::take(&mut self.interpolated_state);
        let mut derivatives = std::mem::take(&mut self.interpolated_derivatives);
        self.evaluate(t, &mut state, &mut derivatives);
        self.interpolated_state = state;
        self.interpolated_derivatives = derivatives;
    }

    /// Time of the cursor
    pub fn interpolated_time(&self) -> f64 {
        self.interpolated_time
    }

    /// State at the cursor
    pub fn interpolated_state(&self) -> &[f64] {
        &self.interpolated_state
    }

    /// Derivatives at the cursor
    pub fn interpolated_derivatives(&self) -> &[f64] {
        &self.interpolated_derivatives
    }

    /// State at `t`, leaving the cursor alone
    ///
    /// The stored states are returned exactly at both global endpoints.
    pub fn state_at(&self, t: f64) -> Vec<f64> {
        let mut state = vec![0.0; self.dimension()];
        let mut derivatives = vec![0.0; self.dimension()];
        self.evaluate(t, &mut state, &mut derivatives);
        state
    }

    /// Time derivative of the interpolated state at `t`
    pub fn derivative_at(&self, t: f64) -> Vec<f64> {
        let mut state = vec![0.0; self.dimension()];
        let mut derivatives = vec![0.0; self.dimension()];
        self.evaluate(t, &mut state, &mut derivatives);
        derivatives
    }

    fn evaluate(&self, t: f64, state: &mut [f64], derivatives: &mut [f64]) {
        let h = self.global_current_time - self.global_previous_time;
        let theta = if h == 0.0 {
            1.0
        } else {
            (t - self.global_previous_time) / h
        };

        match &self.dense {
            DenseOutput::Endpoint => {
                for i in 0..state.len() {
                    let delta = self.current_state[i] - self.previous_state[i];
                    state[i] = self.previous_state[i] + theta * delta;
                    derivatives[i] = if h == 0.0 { 0.0 } else { delta / h };
                }
            }
            DenseOutput::RungeKutta { coefficients } => {
                runge_kutta_dense(coefficients, theta, h, state, derivatives)
            }
            DenseOutput::Extrapolation { polynomials } => {
                extrapolation_dense(polynomials, theta, h, state, derivatives)
            }
            DenseOutput::Nordsieck { scaled, nordsieck } => {
                let norm = if h == 0.0 {
                    0.0
                } else {
                    (t - self.global_current_time) / h
                };
                for i in 0..state.len() {
                    let mut variation = scaled[i] * norm;
                    let mut slope = scaled[i];
                    for (row, data) in nordsieck.iter().enumerate().rev() {
                        let order = (row + 2) as f64;
                        let power = norm.powi(row as i32 + 1);
                        variation += data[i] * power * norm;
                        slope += order * data[i] * power;
                    }
                    state[i] = self.current_state[i] + variation;
                    derivatives[i] = if h == 0.0 { 0.0 } else { slope / h };
                }
            }
        }

        if t == self.global_previous_time {
            state.copy_from_slice(&self.previous_state);
        } else if t == self.global_current_time {
            state.copy_from_slice(&self.current_state);
        }
    }
}

/// Horner evaluation with multipliers alternating θ, (1-θ), θ, ...
fn runge_kutta_dense(
    coefficients: &[Vec<f64>],
    theta: f64,
    h: f64,
    state: &mut [f64],
    derivatives: &mut [f64],
) {
    let theta1 = 1.0 - theta;
    let last = coefficients.len() - 1;
    for i in 0..state.len() {
        let mut p = coefficients[last][i];
        let mut dp = 0.0;
        for k in (0..last).rev() {
            // multiplier in front of c_{k+1}
            let (m, dm) = if (k + 1) % 2 == 1 {
                (theta, 1.0)
            } else {
                (theta1, -1.0)
            };
            dp = dm * p + m * dp;
            p = coefficients[k][i] + m * p;
        }
        state[i] = p;
        derivatives[i] = if h == 0.0 { 0.0 } else { dp / h };
    }
}

fn extrapolation_dense(
    polynomials: &[Vec<f64>],
    theta: f64,
    h: f64,
    state: &mut [f64],
    derivatives: &mut [f64],
) {
    let degree = polynomials.len() - 1;
    let one_minus_theta = 1.0 - theta;
    let theta05 = theta - 0.5;
    let t_om_t = theta * one_minus_theta;
    let t4 = t_om_t * t_om_t;
    let t4_dot = 2.0 * t_om_t * (1.0 - 2.0 * theta);
    let inv_h = if h == 0.0 { 0.0 } else { 1.0 / h };
    let dot1 = inv_h;
    let dot2 = theta * (2.0 - 3.0 * theta) * inv_h;
    let dot3 = ((3.0 * theta - 4.0) * theta + 1.0) * inv_h;

    for i in 0..state.len() {
        let p0 = polynomials[0][i];
        let p1 = polynomials[1][i];
        let p2 = polynomials[2][i];
        let p3 = polynomials[3][i];
        state[i] = p0 + theta * (p1 + one_minus_theta * (p2 * theta + p3 * one_minus_theta));
        derivatives[i] = dot1 * p1 + dot2 * p2 + dot3 * p3;

        if degree > 3 {
            let mut c_dot = 0.0;
            let mut c = polynomials[degree][i];
            for j in (4..degree).rev() {
                let d = 1.0 / (j - 3) as f64;
                c_dot = d * (theta05 * c_dot + c);
                c = polynomials[j][i] + c * d * theta05;
            }
            state[i] += t4 * c;
            derivatives[i] += (t4 * c_dot + t4_dot * c) * inv_h;
        }
    }
}
