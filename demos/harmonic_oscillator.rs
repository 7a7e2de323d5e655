//! Basic usage: harmonic oscillator with every method.
//!
//! Integrates y'' + ω²y = 0 for one period and compares with the exact solution.
//!
//! Run with:
//!   cargo run --example harmonic_oscillator

use nonstiff::{Integrator, OdeSystem, Tolerances};

/// Simple harmonic oscillator: y'' + ω²y = 0
///
/// State vector: [y, y']
struct HarmonicOscillator {
    omega: f64,
}

impl OdeSystem for HarmonicOscillator {
    fn dimension(&self) -> usize {
        2
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        dydt[0] = y[1];
        dydt[1] = -self.omega * self.omega * y[0];
    }
}

fn main() {
    let omega = 2.0;
    let sys = HarmonicOscillator { omega };

    // Integrate for one full period: T = 2π/ω
    let period = 2.0 * std::f64::consts::PI / omega;
    let y0 = [1.0, 0.0]; // y(0) = 1, y'(0) = 0

    let tol = Tolerances::new(1e-12, 1e-12);
    let integrators = vec![
        Integrator::dormand_prince_54(0.0, 1.0, tol.clone()),
        Integrator::dormand_prince_853(0.0, 1.0, tol.clone()),
        Integrator::gragg_bulirsch_stoer(0.0, 1.0, tol.clone()),
        Integrator::adams_moulton(5, 0.0, 1.0, tol).expect("five steps is a valid history"),
    ];

    println!("Harmonic Oscillator (ω = {omega}), period {period:.6}");
    println!();
    println!("  {:24} {:>12} {:>12} {:>8}", "method", "y error", "y' error", "evals");

    for mut integrator in integrators {
        let mut yf = [0.0; 2];
        let tf = match integrator.integrate(&sys, 0.0, &y0, period, &mut yf) {
            Ok(tf) => tf,
            Err(e) => {
                eprintln!("{}: {}", integrator.name(), e);
                continue;
            }
        };

        // Exact solution: y(t) = cos(ωt), y'(t) = -ω sin(ωt)
        let y_exact = (omega * tf).cos();
        let v_exact = -omega * (omega * tf).sin();

        println!(
            "  {:24} {:>12.2e} {:>12.2e} {:>8}",
            integrator.name(),
            (yf[0] - y_exact).abs(),
            (yf[1] - v_exact).abs(),
            integrator.evaluations()
        );
    }
}
