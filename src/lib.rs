//! # nonstiff: Adaptive Integrators for Non-Stiff ODEs
//!
//! Initial value problems `y' = f(t, y)` integrated with error-controlled
//! adaptive steps, dense output between steps and event location.
//!
//! ## Features
//!
//! - **Dormand-Prince 5(4)** and **8(5, 3)** embedded Runge-Kutta pairs with
//!   their continuous extensions
//! - **Gragg-Bulirsch-Stoer** extrapolation with adaptive order and step
//! - **Adams-Moulton** multistep method in Nordsieck form, started with a
//!   high-order Runge-Kutta pass
//! - Scalar or per-component absolute/relative tolerances
//! - Step observers receive a [`StepInterpolator`] for every accepted step;
//!   [`StepNormalizer`] turns them into a fixed grid and
//!   [`ContinuousOutput`] keeps the whole dense trajectory
//! - **Event location** with Brent's method, in time order, with stop,
//!   state reset and derivative reset actions
//! - Forward and backward integration
//! - Second-order systems through [`FirstOrderConverter`]
//! - Evaluation ceiling and typed errors, no panics on bad input
//!
//! ## Basic Usage
//!
//! ```rust
//! use nonstiff::{Integrator, OdeSystem, Tolerances};
//!
//! struct HarmonicOscillator {
//!     omega: f64,
//! }
//!
//! impl OdeSystem for HarmonicOscillator {
//!     fn dimension(&self) -> usize {
//!         2
//!     }
//!
//!     fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
//!         dydt[0] = y[1];
//!         dydt[1] = -self.omega * self.omega * y[0];
//!     }
//! }
//!
//! let sys = HarmonicOscillator { omega: 1.0 };
//! let mut integrator = Integrator::dormand_prince_853(0.0, 1.0, Tolerances::new(1e-12, 1e-12));
//!
//! let mut y = [0.0; 2];
//! let t = integrator.integrate(&sys, 0.0, &[1.0, 0.0], 10.0, &mut y).unwrap();
//! assert_eq!(t, 10.0);
//! assert!((y[0] - 10.0_f64.cos()).abs() < 1e-9);
//! ```
//!
//! ## Event Location
//!
//! An [`EventHandler`] exposes a switching function `g(t, y)`; its sign
//! changes are located within the requested convergence, and the handler
//! decides what happens next.
//!
//! ```rust
//! use nonstiff::{EventAction, EventHandler, Integrator, OdeSystem, Tolerances};
//!
//! struct Fall;
//!
//! impl OdeSystem for Fall {
//!     fn dimension(&self) -> usize {
//!         2
//!     }
//!
//!     fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
//!         dydt[0] = y[1];
//!         dydt[1] = -9.81;
//!     }
//! }
//!
//! struct Ground;
//!
//! impl EventHandler for Ground {
//!     fn g(&self, _t: f64, y: &[f64]) -> f64 {
//!         y[0]
//!     }
//!
//!     fn event_occurred(&mut self, _t: f64, _y: &[f64], _increasing: bool) -> EventAction {
//!         EventAction::Stop
//!     }
//! }
//!
//! let mut integrator = Integrator::dormand_prince_54(0.0, 1.0, Tolerances::new(1e-10, 1e-10));
//! integrator.add_event_handler(Ground, 0.1, 1e-12, 100);
//!
//! let mut y = [0.0; 2];
//! let t = integrator.integrate(&Fall, 0.0, &[10.0, 0.0], 100.0, &mut y).unwrap();
//! assert!((t - (20.0_f64 / 9.81).sqrt()).abs() < 1e-9);
//! ```
//!
//! ## Choosing a Method
//!
//! - Loose tolerances (`1e-3` to `1e-7`): Dormand-Prince 5(4)
//! - Tight tolerances, expensive derivatives: Dormand-Prince 8(5, 3) or
//!   Gragg-Bulirsch-Stoer
//! - Smooth problems with costly derivatives and few events: Adams-Moulton,
//!   which needs about two evaluations per step once started
//!
//! None of them is suited to stiff problems.
//!
//! ## References
//!
//! 1. Dormand, J.R. & Prince, P.J. (1980). "A family of embedded
//!    Runge-Kutta formulae". J. Comp. Appl. Math. 6(1).
//!
//! 2. Hairer, E., Nørsett, S.P., & Wanner, G. (1993). "Solving
//!    Ordinary Differential Equations I: Nonstiff Problems".
//!    Springer.
//!
//! 3. Nordsieck, A. (1962). "On numerical integration of ordinary
//!    differential equations". Math. Comp. 16.
//!
//! 4. Brent, R.P. (1973). "Algorithms for Minimization without
//!    Derivatives". Prentice-Hall.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod adams_moulton;
pub mod coefficients;
pub mod controller;
pub mod error;
pub mod events;
pub mod gragg_bulirsch_stoer;
pub mod integrator;
pub mod interpolator;
pub mod nordsieck;
pub mod runge_kutta;
pub mod step_handler;
pub mod system;
pub mod tolerance;

pub use adams_moulton::AdamsMoulton;
pub use controller::{Decision, StepController};
pub use error::{ContinuousOutputError, EvaluationPhase, IntegrationError};
pub use events::{
    BrentError, BrentSolver, EventAction, EventConfig, EventHandler, EventState, EventStatus,
};
pub use gragg_bulirsch_stoer::{
    GraggBulirschStoer, InterpolationControl, OrderControl, StabilityCheck, StepsizeControl,
};
pub use integrator::{Engine, Integrator};
pub use interpolator::StepInterpolator;
pub use nordsieck::NordsieckTransformer;
pub use runge_kutta::{EmbeddedRungeKutta, RkMethod};
pub use step_handler::{ContinuousOutput, FixedStepHandler, StepHandler, StepNormalizer};
pub use system::{FirstOrderConverter, OdeSystem, SecondOrderSystem};
pub use tolerance::Tolerances;
