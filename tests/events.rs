//! Event location through the public integrator interface.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use approx::assert_abs_diff_eq;
use nonstiff::{
    ContinuousOutput, EventAction, EventHandler, IntegrationError, Integrator, OdeSystem,
    Tolerances,
};

const GRAVITY: f64 = 9.81;

fn all_methods(min_step: f64, max_step: f64, atol: f64, rtol: f64) -> Vec<Integrator> {
    let tolerances = Tolerances::new(atol, rtol);
    vec![
        Integrator::dormand_prince_54(min_step, max_step, tolerances.clone()),
        Integrator::dormand_prince_853(min_step, max_step, tolerances.clone()),
        Integrator::gragg_bulirsch_stoer(min_step, max_step, tolerances.clone()),
        Integrator::adams_moulton(4, min_step, max_step, tolerances).unwrap(),
    ]
}

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

/// Bounces with a restitution coefficient, stops at the last bounce
struct Floor {
    restitution: f64,
    max_bounces: usize,
    bounces: Vec<f64>,
}

impl EventHandler for Floor {
    fn g(&self, _t: f64, y: &[f64]) -> f64 {
        y[0]
    }

    fn event_occurred(&mut self, t: f64, _y: &[f64], increasing: bool) -> EventAction {
        assert!(!increasing, "the ball only hits the floor going down");
        self.bounces.push(t);
        if self.bounces.len() == self.max_bounces {
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

// ==================== Stop and reset ====================

#[test]
fn test_bouncing_ball() {
    let height: f64 = 10.0;
    let restitution = 0.8;
    let t1 = (2.0 * height / GRAVITY).sqrt();
    let v1 = GRAVITY * t1;
    let expected = [
        t1,
        t1 + 2.0 * restitution * v1 / GRAVITY,
        t1 + 2.0 * restitution * v1 / GRAVITY * (1.0 + restitution),
    ];

    for mut integrator in all_methods(0.0, 0.5, 1e-10, 1e-10) {
        let floor = Rc::new(RefCell::new(Floor {
            restitution,
            max_bounces: 3,
            bounces: Vec::new(),
        }));
        integrator.add_event_handler(floor.clone(), 0.1, 1e-10, 100);

        let mut y = [0.0; 2];
        let t = integrator
            .integrate(&Ball, 0.0, &[height, 0.0], 100.0, &mut y)
            .unwrap();

        let bounces = floor.borrow().bounces.clone();
        println!("{:24} bounces at {:?}", integrator.name(), bounces);
        assert_eq!(bounces.len(), 3, "{}", integrator.name());
        for (found, wanted) in bounces.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*found, *wanted, epsilon = 1e-7);
        }
        assert_abs_diff_eq!(t, expected[2], epsilon = 1e-7);
        assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-7);
    }
}

/// y' = rate, the rate switching from 0 to 1 at t = 2
struct Switched {
    rate: Rc<Cell<f64>>,
}

impl OdeSystem for Switched {
    fn dimension(&self) -> usize {
        1
    }

    fn rhs(&self, _t: f64, _y: &[f64], dydt: &mut [f64]) {
        dydt[0] = self.rate.get();
    }
}

struct Switch {
    at: f64,
    rate: Rc<Cell<f64>>,
}

impl EventHandler for Switch {
    fn g(&self, t: f64, _y: &[f64]) -> f64 {
        t - self.at
    }

    fn event_occurred(&mut self, _t: f64, _y: &[f64], _increasing: bool) -> EventAction {
        self.rate.set(1.0);
        EventAction::ResetDerivatives
    }
}

#[test]
fn test_reset_derivatives_restarts_the_engine() {
    for mut integrator in all_methods(0.1, 10.0, 1e-12, 0.0) {
        let rate = Rc::new(Cell::new(0.0));
        let system = Switched { rate: rate.clone() };
        integrator.add_event_handler(
            Switch {
                at: 2.0,
                rate: rate.clone(),
            },
            1.0,
            1e-12,
            1000,
        );

        let mut y = [0.0];
        let t = integrator
            .integrate(&system, 0.0, &[0.0], 10.0, &mut y)
            .unwrap();
        assert_eq!(t, 10.0);
        assert_abs_diff_eq!(y[0], 8.0, epsilon = 1e-12);
    }
}

/// y' = 1
struct Clock;

impl OdeSystem for Clock {
    fn dimension(&self) -> usize {
        1
    }

    fn rhs(&self, _t: f64, _y: &[f64], dydt: &mut [f64]) {
        dydt[0] = 1.0;
    }
}

/// Sends y back to zero each time it reaches one
#[derive(Default)]
struct Sawtooth {
    resets: Vec<f64>,
}

impl EventHandler for Sawtooth {
    fn g(&self, _t: f64, y: &[f64]) -> f64 {
        y[0] - 1.0
    }

    fn event_occurred(&mut self, t: f64, _y: &[f64], _increasing: bool) -> EventAction {
        self.resets.push(t);
        EventAction::ResetState
    }

    fn reset_state(&mut self, _t: f64, y: &mut [f64]) {
        y[0] = 0.0;
    }
}

#[test]
fn test_reset_rearms_the_other_handlers() {
    for mut integrator in all_methods(0.0, 1.0, 1e-10, 1e-10) {
        let saw = Rc::new(RefCell::new(Sawtooth::default()));
        let half = Rc::new(RefCell::new(Crossings {
            level: 0.5,
            seen: Vec::new(),
        }));
        integrator.add_event_handler(saw.clone(), 0.25, 1e-10, 100);
        integrator.add_event_handler(half.clone(), 0.25, 1e-10, 100);

        let mut y = [0.0];
        let t = integrator
            .integrate(&Clock, 0.0, &[0.0], 3.8, &mut y)
            .unwrap();
        assert_eq!(t, 3.8);
        assert_abs_diff_eq!(y[0], 0.8, epsilon = 1e-8);

        let resets = saw.borrow().resets.clone();
        let halves = half.borrow().seen.clone();
        println!("{:24} resets {:?}, halves {:?}", integrator.name(), resets, halves);
        assert_eq!(resets.len(), 3, "{}", integrator.name());
        for (k, t) in resets.iter().enumerate() {
            assert_abs_diff_eq!(*t, (k + 1) as f64, epsilon = 1e-8);
        }
        assert_eq!(halves.len(), 4, "{}", integrator.name());
        for (k, &(t, increasing)) in halves.iter().enumerate() {
            assert_abs_diff_eq!(t, k as f64 + 0.5, epsilon = 1e-8);
            assert!(increasing);
        }
    }
}

#[test]
fn test_stop_splits_the_last_step() {
    let mut integrator = Integrator::dormand_prince_853(0.0, 5.0, Tolerances::new(1e-10, 1e-10));
    let floor = Floor {
        restitution: 1.0,
        max_bounces: 1,
        bounces: Vec::new(),
    };
    integrator.add_event_handler(floor, 5.0, 1e-12, 100);
    let output = Rc::new(RefCell::new(ContinuousOutput::new()));
    integrator.add_step_handler(output.clone());

    let mut y = [0.0; 2];
    let t = integrator
        .integrate(&Ball, 0.0, &[GRAVITY / 2.0, 0.0], 100.0, &mut y)
        .unwrap();
    assert_abs_diff_eq!(t, 1.0, epsilon = 1e-10);
    assert_abs_diff_eq!(y[1], -GRAVITY, epsilon = 1e-8);

    let output = output.borrow();
    assert_eq!(output.final_time(), t);
    let last = output.steps().last().unwrap();
    assert_eq!(last.current_time(), t);
    assert!(last.global_current_time() >= t);
}

// ==================== Direction ====================

/// Records every crossing of y[0] = level
struct Crossings {
    level: f64,
    seen: Vec<(f64, bool)>,
}

impl EventHandler for Crossings {
    fn g(&self, _t: f64, y: &[f64]) -> f64 {
        y[0] - self.level
    }

    fn event_occurred(&mut self, t: f64, _y: &[f64], increasing: bool) -> EventAction {
        self.seen.push((t, increasing));
        EventAction::Continue
    }
}

/// y = sin t
struct Sine;

impl OdeSystem for Sine {
    fn dimension(&self) -> usize {
        1
    }

    fn rhs(&self, t: f64, _y: &[f64], dydt: &mut [f64]) {
        dydt[0] = t.cos();
    }
}

#[test]
fn test_crossings_forward_and_backward() {
    // sin t = 0.5 at π/6, 5π/6, 13π/6, 17π/6
    let pi = std::f64::consts::PI;
    let roots = [pi / 6.0, 5.0 * pi / 6.0, 13.0 * pi / 6.0, 17.0 * pi / 6.0];

    for mut integrator in all_methods(0.0, 1.0, 1e-11, 1e-11) {
        let crossings = Rc::new(RefCell::new(Crossings {
            level: 0.5,
            seen: Vec::new(),
        }));
        integrator.add_event_handler(crossings.clone(), 0.25, 1e-10, 100);

        let mut y = [0.0];
        integrator.integrate(&Sine, 0.0, &[0.0], 9.0, &mut y).unwrap();
        let seen = crossings.borrow().seen.clone();
        assert_eq!(seen.len(), 4, "{}", integrator.name());
        for (k, &(t, increasing)) in seen.iter().enumerate() {
            assert_abs_diff_eq!(t, roots[k], epsilon = 1e-7);
            assert_eq!(increasing, k % 2 == 0);
        }

        // backward from 9 to 0, starting on the solution
        crossings.borrow_mut().seen.clear();
        integrator
            .integrate(&Sine, 9.0, &[9.0_f64.sin()], 0.0, &mut y)
            .unwrap();
        let seen = crossings.borrow().seen.clone();
        assert_eq!(seen.len(), 4, "{}", integrator.name());
        for (k, &(t, increasing)) in seen.iter().enumerate() {
            assert_abs_diff_eq!(t, roots[3 - k], epsilon = 1e-7);
            // increasing describes g as a function of time
            assert_eq!(increasing, k % 2 == 1);
        }
        assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-7);
    }
}

// ==================== Failures ====================

/// g with a sign change the solver cannot converge on in two iterations
struct Stubborn;

impl EventHandler for Stubborn {
    fn g(&self, t: f64, _y: &[f64]) -> f64 {
        (t - 0.3).powi(3)
    }

    fn event_occurred(&mut self, _t: f64, _y: &[f64], _increasing: bool) -> EventAction {
        EventAction::Continue
    }
}

#[test]
fn test_event_convergence_failure() {
    let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-8, 1e-8));
    integrator.add_event_handler(Stubborn, 1.0, 1e-15, 2);
    let mut y = [0.0];
    let err = integrator
        .integrate(&Sine, 0.0, &[0.0], 1.0, &mut y)
        .unwrap_err();
    assert!(
        matches!(err, IntegrationError::EventConvergenceFailure { .. }),
        "{:?}",
        err
    );
}

#[test]
fn test_clear_event_handlers() {
    let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-8, 1e-8));
    integrator.add_event_handler(
        Floor {
            restitution: 1.0,
            max_bounces: 1,
            bounces: Vec::new(),
        },
        0.1,
        1e-10,
        100,
    );
    assert_eq!(integrator.event_handler_count(), 1);
    integrator.clear_event_handlers();
    assert_eq!(integrator.event_handler_count(), 0);

    let mut y = [0.0; 2];
    let t = integrator
        .integrate(&Ball, 0.0, &[1.0, 0.0], 2.0, &mut y)
        .unwrap();
    assert_eq!(t, 2.0);
    assert!(y[0] < 0.0);
}
