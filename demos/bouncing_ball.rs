//! Event handling: a ball bouncing on the floor.
//!
//! Each impact is located with Brent's method, the velocity is reversed and
//! damped through a state reset, and the run stops after a fixed number of
//! bounces.
//!
//! Run with:
//!   cargo run --example bouncing_ball

use std::cell::RefCell;
use std::rc::Rc;

use nonstiff::{EventAction, EventHandler, Integrator, OdeSystem, Tolerances};

const GRAVITY: f64 = 9.81;

/// Free fall, state [height, velocity]
struct Ball;

impl OdeSystem for Ball {
    fn dimension(&self) -> usize {
        2
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        dydt[0] = y[1];
        dydt[1] = -GRAVITY;
    }
}

/// Impact with the floor at height 0
struct Floor {
    restitution: f64,
    max_bounces: usize,
    impacts: Vec<(f64, f64)>,
}

impl EventHandler for Floor {
    fn g(&self, _t: f64, y: &[f64]) -> f64 {
        y[0]
    }

    fn event_occurred(&mut self, t: f64, y: &[f64], _increasing: bool) -> EventAction {
        self.impacts.push((t, y[1]));
        if self.impacts.len() >= self.max_bounces {
            EventAction::Stop
        } else {
            EventAction::ResetState
        }
    }

    fn reset_state(&mut self, _t: f64, y: &mut [f64]) {
        y[0] = 0.0;
        y[1] = -self.restitution * y[1];
    }
}

fn main() {
    let height: f64 = 10.0;
    let restitution = 0.8;

    let floor = Rc::new(RefCell::new(Floor {
        restitution,
        max_bounces: 6,
        impacts: Vec::new(),
    }));

    let mut integrator = Integrator::dormand_prince_54(0.0, 0.5, Tolerances::new(1e-10, 1e-10));
    integrator.add_event_handler(floor.clone(), 0.1, 1e-12, 100);

    let mut y = [0.0; 2];
    let t = match integrator.integrate(&Ball, 0.0, &[height, 0.0], 1000.0, &mut y) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Integration failed: {}", e);
            return;
        }
    };

    // Exact impact times: flight time shrinks by the restitution factor
    let t1 = (2.0 * height / GRAVITY).sqrt();
    let mut exact = t1;
    let mut flight = 2.0 * restitution * GRAVITY * t1 / GRAVITY;

    println!("Bouncing ball from {height} m, restitution {restitution}");
    println!();
    println!("  {:>3} {:>18} {:>18} {:>10}", "#", "impact time", "exact", "velocity");
    for (i, &(t_impact, v_impact)) in floor.borrow().impacts.iter().enumerate() {
        println!(
            "  {:>3} {:>18.12} {:>18.12} {:>10.4}",
            i + 1,
            t_impact,
            exact,
            v_impact
        );
        exact += flight;
        flight *= restitution;
    }
    println!();
    println!("  Stopped at t = {:.12}", t);
    println!("  Function evals: {}", integrator.evaluations());
}
