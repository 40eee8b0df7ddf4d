//! Embedded Runge-Kutta integration of satellite states.

use std::ops;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Position and velocity of a satellite in some inertial frame.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl State {
    pub fn new(position: Vector3<f64>, velocity: Vector3<f64>) -> Self {
        Self { position, velocity }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().chain(self.velocity.iter()).all(|x| x.is_finite())
    }

    fn components(&self) -> impl Iterator<Item = f64> + '_ {
        self.position.iter().chain(self.velocity.iter()).copied()
    }
}

/// Time derivative of a [`State`].
#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct Derivative {
    velocity: Vector3<f64>,
    acceleration: Vector3<f64>,
}

impl ops::Add<Derivative> for State {
    type Output = State;

    fn add(self, rhs: Derivative) -> Self::Output {
        State {
            position: self.position + rhs.velocity,
            velocity: self.velocity + rhs.acceleration,
        }
    }
}

impl ops::Mul<f64> for Derivative {
    type Output = Derivative;

    fn mul(self, rhs: f64) -> Self::Output {
        Derivative {
            velocity: self.velocity * rhs,
            acceleration: self.acceleration * rhs,
        }
    }
}

impl ops::AddAssign for Derivative {
    fn add_assign(&mut self, rhs: Derivative) {
        self.velocity += rhs.velocity;
        self.acceleration += rhs.acceleration;
    }
}

fn derivative(state: &State, accel: &mut impl FnMut(&State) -> Vector3<f64>) -> Derivative {
    Derivative {
        velocity: state.velocity,
        acceleration: accel(state),
    }
}

fn combine(k: &[Derivative], weights: &[f64]) -> Derivative {
    let mut out = Derivative::default();
    for (k, &w) in k.iter().zip(weights) {
        if w != 0.0 {
            out += *k * w;
        }
    }
    out
}

struct Tableau {
    a: &'static [&'static [f64]],
    /// Weights of the propagated (higher order) solution.
    b: &'static [f64],
    /// Higher minus lower order weights.
    e: &'static [f64],
    /// Order of the embedded error estimate.
    q: u32,
}

const HEUN_EULER: Tableau = Tableau {
    a: &[&[], &[1.0]],
    b: &[0.5, 0.5],
    e: &[-0.5, 0.5],
    q: 1,
};

const DORMAND_PRINCE: Tableau = Tableau {
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339_200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    q: 4,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Heun-Euler 2(1)
    HeunEuler,
    /// Dormand-Prince 5(4)
    #[default]
    DormandPrince,
}

impl Method {
    fn tableau(self) -> &'static Tableau {
        match self {
            Self::HeunEuler => &HEUN_EULER,
            Self::DormandPrince => &DORMAND_PRINCE,
        }
    }
}

/// Step-size control settings.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Integrator {
    pub method: Method,
    /// Absolute tolerance (`km`, `km/s`)
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// First step tried by a new propagation (`s`)
    pub initial_dt: f64,
    /// Step floor (`s`). Needing a smaller step is an error.
    pub min_dt: f64,
    pub max_dt: f64,
    /// Rejected attempts allowed within one step.
    pub max_rejections: u32,
}

impl Default for Integrator {
    fn default() -> Self {
        Self {
            method: Method::DormandPrince,
            abs_tol: 1e-6,
            rel_tol: 1e-9,
            initial_dt: 10.0,
            min_dt: 1e-6,
            max_dt: 3600.0,
            max_rejections: 64,
        }
    }
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// One accepted step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Step {
    pub state: State,
    /// The step that was actually taken; no larger than the one requested.
    pub achieved_dt: f64,
    /// Suggested size of the following step.
    pub next_dt: f64,
    pub rejections: u32,
    /// Normalized error of the accepted attempt.
    pub error: f64,
}

impl Integrator {
    /// Take one adaptive step of at most `dt` seconds from `state`.
    ///
    /// `t` is only used to label errors. Rejected attempts retry with a
    /// smaller step and never advance time. A requested step below the
    /// floor is attempted as is, so callers can land exactly on a target.
    pub fn step(
        &self,
        t: f64,
        state: &State,
        dt: f64,
        mut accel: impl FnMut(&State) -> Vector3<f64>,
    ) -> Result<Step> {
        let tableau = self.method.tableau();
        let exponent = -1.0 / f64::from(tableau.q + 1);
        let mut dt = dt.min(self.max_dt);
        let mut rejections = 0;
        let mut last_non_finite = false;

        loop {
            if rejections > 0 && (dt < self.min_dt || rejections > self.max_rejections) {
                warn!(t, dt, rejections, "integrator step collapsed");
                return Err(if last_non_finite {
                    Error::NonFinite { t, rejections }
                } else {
                    Error::StepCollapsed {
                        t,
                        min_dt: self.min_dt,
                    }
                });
            }

            let (next, error) = attempt(tableau, state, dt, &mut accel);
            let error = error_norm(state, &next, &error, self.abs_tol, self.rel_tol);
            let finite = next.is_finite() && error.is_finite();
            last_non_finite = !finite;

            let factor = if finite {
                (SAFETY * error.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
            } else {
                MIN_FACTOR
            };

            if finite && error <= 1.0 {
                trace!(t, dt, error, rejections, "accepted step");
                return Ok(Step {
                    state: next,
                    achieved_dt: dt,
                    next_dt: (dt * factor).clamp(self.min_dt, self.max_dt),
                    rejections,
                    error,
                });
            }

            rejections += 1;
            dt *= factor;
        }
    }
}

fn attempt(
    tableau: &Tableau,
    state: &State,
    dt: f64,
    accel: &mut impl FnMut(&State) -> Vector3<f64>,
) -> (State, Derivative) {
    let mut k = Vec::with_capacity(tableau.a.len());
    for row in tableau.a {
        let stage = *state + combine(&k, row) * dt;
        k.push(derivative(&stage, accel));
    }
    // For Dormand-Prince the last stage already sits at the new state.
    let next = *state + combine(&k, tableau.b) * dt;
    (next, combine(&k, tableau.e) * dt)
}

/// Largest per-component error relative to `abs + rel * max(|x|, |x'|)`.
fn error_norm(prev: &State, next: &State, delta: &Derivative, abs: f64, rel: f64) -> f64 {
    let delta = delta.velocity.iter().chain(delta.acceleration.iter());
    prev.components()
        .zip(next.components())
        .zip(delta)
        .map(|((x0, x1), d)| d.abs() / (abs + rel * x0.abs().max(x1.abs())))
        .fold(0.0, f64::max)
}

/// Classical fixed-step fourth order Runge-Kutta.
pub fn rk4_step(state: &State, dt: f64, mut accel: impl FnMut(&State) -> Vector3<f64>) -> State {
    let k1 = derivative(state, &mut accel);
    let k2 = derivative(&(*state + k1 * (dt / 2.0)), &mut accel);
    let k3 = derivative(&(*state + k2 * (dt / 2.0)), &mut accel);
    let k4 = derivative(&(*state + k3 * dt), &mut accel);
    *state + combine(&[k1, k2, k3, k4], &[1.0, 2.0, 2.0, 1.0]) * (dt / 6.0)
}

#[cfg(test)]
mod tests {
    use std::f64::consts;

    use approx::assert_relative_eq;

    use super::*;
    use crate::forces::gravity::point_mass;

    const MU: f64 = 398_600.44;

    fn circular(r: f64) -> State {
        State::new(Vector3::new(r, 0.0, 0.0), Vector3::new(0.0, (MU / r).sqrt(), 0.0))
    }

    fn run(integrator: &Integrator, state: State, duration: f64) -> (State, f64) {
        let mut state = state;
        let mut t = 0.0;
        let mut dt = integrator.initial_dt;
        let mut max_radius_error: f64 = 0.0;
        let r0 = state.position.norm();
        while t < duration {
            let step = integrator
                .step(t, &state, dt.min(duration - t), |s| point_mass(&s.position, MU))
                .unwrap();
            state = step.state;
            t += step.achieved_dt;
            dt = step.next_dt;
            max_radius_error = max_radius_error.max((state.position.norm() - r0).abs() / r0);
        }
        (state, max_radius_error)
    }

    #[test]
    fn circular_orbit_holds_radius() {
        let r = 6771.0;
        let period = consts::TAU * (r * r * r / MU).sqrt();
        for method in [Method::DormandPrince, Method::HeunEuler] {
            let integrator = Integrator {
                method,
                ..Integrator::default()
            };
            let (end, err) = run(&integrator, circular(r), period);
            assert!(err < 1e-3, "{method:?} drifted {err}");
            assert_relative_eq!(end.position, circular(r).position, epsilon = 1.0);
        }
    }

    #[test]
    fn conserves_energy_and_momentum() {
        let state = State::new(Vector3::new(7000.0, 0.0, 0.0), Vector3::new(0.0, 8.5, 1.0));
        let energy = |s: &State| s.velocity.norm_squared() / 2.0 - MU / s.position.norm();
        let h0 = state.position.cross(&state.velocity);
        let a = -MU / (2.0 * energy(&state));
        let period = consts::TAU * (a * a * a / MU).sqrt();
        let (end, _) = run(&Integrator::default(), state, period);
        assert_relative_eq!(energy(&end), energy(&state), max_relative = 1e-7);
        assert_relative_eq!(
            end.position.cross(&end.velocity),
            h0,
            epsilon = 1e-6,
            max_relative = 1e-7
        );
    }

    #[test]
    fn steps_grow_at_most_fivefold() {
        let integrator = Integrator::default();
        let step = integrator
            .step(0.0, &circular(7000.0), 1.0, |s| point_mass(&s.position, MU))
            .unwrap();
        assert_eq!(step.achieved_dt, 1.0);
        assert!(step.next_dt <= 5.0);
    }

    #[test]
    fn non_finite_acceleration_fails() {
        let integrator = Integrator::default();
        let err = integrator
            .step(42.0, &circular(7000.0), 10.0, |_| Vector3::repeat(f64::NAN))
            .unwrap_err();
        assert!(matches!(err, Error::NonFinite { t, .. } if t == 42.0));
    }

    #[test]
    fn rk4_circular_orbit() {
        let r = 7000.0;
        let period = consts::TAU * (r * r * r / MU).sqrt();
        let n = 2000;
        let dt = period / f64::from(n);
        let mut state = circular(r);
        for _ in 0..n {
            state = rk4_step(&state, dt, |s| point_mass(&s.position, MU));
        }
        assert_relative_eq!(state.position.norm(), r, max_relative = 1e-6);
        assert_relative_eq!(state.position, circular(r).position, epsilon = 0.1);
    }
}
