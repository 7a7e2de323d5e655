//! Dense output: keep a whole trajectory and sample it afterwards.
//!
//! A Kepler orbit is integrated once with a `ContinuousOutput` observer and
//! a fixed-step sampler registered side by side; the stored trajectory is
//! then serialized to JSON and queried at arbitrary times.
//!
//! Run with:
//!   cargo run --example dense_trajectory --features serde

use std::cell::RefCell;
use std::rc::Rc;

use nonstiff::{
    ContinuousOutput, FixedStepHandler, Integrator, OdeSystem, StepNormalizer, Tolerances,
};

/// Planar two-body problem, state [x, y, vx, vy]
struct TwoBody {
    mu: f64,
}

impl OdeSystem for TwoBody {
    fn dimension(&self) -> usize {
        4
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        let r2 = y[0] * y[0] + y[1] * y[1];
        let mu_r3 = self.mu / (r2 * r2.sqrt());
        dydt[0] = y[2];
        dydt[1] = y[3];
        dydt[2] = -mu_r3 * y[0];
        dydt[3] = -mu_r3 * y[1];
    }
}

/// Prints the radius on a fixed grid
struct RadiusPrinter;

impl FixedStepHandler for RadiusPrinter {
    fn handle_step(&mut self, t: f64, y: &[f64], _y_dot: &[f64], is_last: bool) {
        let r = (y[0] * y[0] + y[1] * y[1]).sqrt();
        println!("  t = {:8.4}  r = {:.10}{}", t, r, if is_last { "  (last)" } else { "" });
    }
}

fn main() {
    let sys = TwoBody { mu: 1.0 };
    let eccentricity: f64 = 0.6;
    let y0 = [
        1.0 - eccentricity,
        0.0,
        0.0,
        ((1.0 + eccentricity) / (1.0 - eccentricity)).sqrt(),
    ];
    let period = 2.0 * std::f64::consts::PI;

    let output = Rc::new(RefCell::new(ContinuousOutput::new()));
    let mut integrator = Integrator::gragg_bulirsch_stoer(0.0, 1.0, Tolerances::new(1e-11, 1e-11));
    integrator.add_step_handler(output.clone());
    integrator.add_step_handler(StepNormalizer::new(period / 8.0, RadiusPrinter));

    println!("Orbit with e = {eccentricity} sampled every T/8:");
    let mut yf = [0.0; 4];
    if let Err(e) = integrator.integrate(&sys, 0.0, &y0, period, &mut yf) {
        eprintln!("Integration failed: {}", e);
        return;
    }

    let output = output.borrow();
    println!();
    println!(
        "{} steps stored, {} function evaluations",
        output.len(),
        integrator.evaluations()
    );

    let json = match serde_json::to_string(&*output) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Serialization failed: {}", e);
            return;
        }
    };
    println!("Serialized trajectory: {} bytes", json.len());

    let mut restored: ContinuousOutput = match serde_json::from_str(&json) {
        Ok(restored) => restored,
        Err(e) => {
            eprintln!("Deserialization failed: {}", e);
            return;
        }
    };

    println!();
    println!("Apoapsis from the restored trajectory:");
    restored.set_interpolated_time(period / 2.0);
    let state = restored.interpolated_state();
    println!(
        "  r(T/2) = {:.10}   (exact: {:.10})",
        (state[0] * state[0] + state[1] * state[1]).sqrt(),
        1.0 + eccentricity
    );
}
