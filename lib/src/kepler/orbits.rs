//! Classical orbital elements, state vectors and analytic two-body
//! propagation with universal variables.

use std::f64::consts;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{bodies::BodyId, time::Epoch};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Apsis {
    Periapsis,
    Apoapsis,
}

/// Osculating elements about some central body. Angles in radians.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    /// Semi-latus rectum (`km`), finite for parabolic orbits too
    pub p: f64,
    pub e: f64,
    pub i: f64,
    /// Right ascension of the ascending node
    pub lan: f64,
    pub argpe: f64,
    pub ta: f64,
}

impl Orbit {
    /// Build an orbit from the semi-major axis and mean anomaly, the way
    /// ephemeris tables usually list them. Returns `None` for unbound or
    /// degenerate elements.
    pub fn from_mean_elements(
        a: f64,
        e: f64,
        i: f64,
        lan: f64,
        argpe: f64,
        ma: f64,
    ) -> Option<Orbit> {
        if !(0.0..1.0).contains(&e) || a <= 0.0 {
            return None;
        }
        Some(Orbit {
            p: a * (1.0 - e.powi(2)),
            e,
            i,
            lan,
            argpe,
            ta: ma_to_ta(ma, e, 1e-12, 50)?,
        })
    }

    pub fn periapsis_radius(&self) -> f64 {
        self.p / (1.0 + self.e)
    }

    pub fn apoapsis_radius(&self) -> f64 {
        self.p / (1.0 - self.e)
    }

    pub fn apsis_radius(&self, apsis: Apsis) -> f64 {
        match apsis {
            Apsis::Periapsis => self.periapsis_radius(),
            Apsis::Apoapsis => self.apoapsis_radius(),
        }
    }

    pub fn semimajor_axis(&self) -> f64 {
        self.p / (1.0 - self.e.powi(2))
    }

    pub fn period(&self, mu: f64) -> f64 {
        2.0 * consts::PI * libm::sqrt(self.semimajor_axis().powi(3) / mu)
    }

    /// Time until the orbit next reaches the given apsis, in seconds.
    /// Only defined for bound orbits.
    pub fn time_to_apsis(&self, mu: f64, apsis: Apsis) -> Option<f64> {
        if !(0.0..1.0).contains(&self.e) {
            return None;
        }
        let n = libm::sqrt(mu / self.semimajor_axis().powi(3));
        let ma = ea_to_ma(ta_to_ea(self.ta, self.e), self.e);
        let target = match apsis {
            Apsis::Periapsis => 2.0 * consts::PI,
            Apsis::Apoapsis => consts::PI,
        };
        let dma = (target - ma).rem_euclid(2.0 * consts::PI);
        Some(dma / n)
    }

    /// Position and velocity in the perifocal coordinate system PQW at
    /// the orbit's current true anomaly.
    fn sv_pqw(&self, mu: f64) -> (Vector3<f64>, Vector3<f64>) {
        let r = self.p / (1.0 + self.e * libm::cos(self.ta));
        let rv = Vector3::new(r * libm::cos(self.ta), r * libm::sin(self.ta), 0.0);
        let vv = libm::sqrt(mu / self.p)
            * Vector3::new(-libm::sin(self.ta), self.e + libm::cos(self.ta), 0.0);
        (rv, vv)
    }

    fn pqw_ijk_matrix(&self) -> Matrix3<f64> {
        let (sl, cl) = (libm::sin(self.lan), libm::cos(self.lan));
        let (sw, cw) = (libm::sin(self.argpe), libm::cos(self.argpe));
        let (si, ci) = (libm::sin(self.i), libm::cos(self.i));

        Matrix3::new(
            cl * cw - sl * sw * ci,
            -cl * sw - sl * cw * ci,
            sl * si,
            sl * cw + cl * sw * ci,
            -sl * sw + cl * cw * ci,
            -cl * si,
            sw * si,
            cw * si,
            ci,
        )
    }

    /// Position and velocity relative to the focus, in the reference plane
    /// of the elements.
    pub fn state(&self, mu: f64) -> (Vector3<f64>, Vector3<f64>) {
        let (rv, vv) = self.sv_pqw(mu);
        let mat = self.pqw_ijk_matrix();
        (mat * rv, mat * vv)
    }
}

/// A body-centered inertial state vector.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub central: BodyId,
    /// Gravitational parameter of the central body (`km^3/s^2`)
    pub mu: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub epoch: Epoch,
}

impl StateVector {
    /// Osculating elements of this state. Eccentricities below `tol` are
    /// treated as circular and inclinations below it as equatorial
    /// (`1e-8` works well).
    pub fn to_orbit(&self, tol: f64) -> Orbit {
        let mu = self.mu;
        let rv = self.position;
        let r = rv.norm();
        let vv = self.velocity;
        let v = vv.norm();
        let hv = rv.cross(&vv);
        let h = hv.norm();
        let nv = Vector3::z().cross(&hv);
        let ev = ((v.powi(2) - mu / r) * rv - rv.dot(&vv) * vv) / mu;
        let p = h.powi(2) / mu;
        let e = ev.norm();
        let i = libm::acos(hv[2] / h);

        let circular = e < tol;
        let equatorial = i.abs() < tol || (i - consts::PI).abs() < tol;

        let (lan, argpe, ta) = match (equatorial, circular) {
            (true, false) => (
                0.0,
                // Longitude of periapsis
                libm::atan2(ev[1], ev[0]).rem_euclid(2.0 * consts::PI),
                libm::atan2(hv.dot(&ev.cross(&rv)) / h, rv.dot(&ev)),
            ),
            (false, true) => (
                libm::atan2(nv[1], nv[0]).rem_euclid(2.0 * consts::PI),
                0.0,
                // Argument of latitude
                libm::atan2(rv.dot(&hv.cross(&nv)) / h, rv.dot(&nv)),
            ),
            // True longitude
            (true, true) => (0.0, 0.0, libm::atan2(rv[1], rv[0])),
            (false, false) => {
                let lan = libm::atan2(nv[1], nv[0]).rem_euclid(2.0 * consts::PI);
                let ta = libm::atan2(hv.dot(&ev.cross(&rv)) / h, rv.dot(&ev));
                let px = rv.dot(&nv);
                let py = rv.dot(&hv.cross(&nv)) / h;
                let argpe = (libm::atan2(py, px) - ta).rem_euclid(2.0 * consts::PI);
                (lan, argpe, ta)
            }
        };

        Orbit {
            p,
            e,
            i,
            lan,
            argpe,
            ta: (ta + consts::PI).rem_euclid(2.0 * consts::PI) - consts::PI,
        }
    }

    /// Specific orbital energy (`km^2/s^2`).
    pub fn energy(&self) -> f64 {
        self.velocity.norm_squared() / 2.0 - self.mu / self.position.norm()
    }

    /// Propagate this state `delta_t` seconds along the two-body orbit.
    /// `None` if the universal-variable solve does not converge.
    pub fn propagate(&self, delta_t: f64, tol: f64, maxiter: u64) -> Option<StateVector> {
        let (position, velocity) =
            propagate_universal(self.position, self.velocity, self.mu, delta_t, tol, maxiter)?;
        Some(StateVector {
            position,
            velocity,
            epoch: self.epoch + delta_t,
            ..*self
        })
    }
}

/// Universal-variable two-body propagation. Returns `None` if the
/// iteration fails to converge.
pub fn propagate_universal(
    r0: Vector3<f64>,
    v0: Vector3<f64>,
    mu: f64,
    delta_t: f64,
    tol: f64,
    maxiter: u64,
) -> Option<(Vector3<f64>, Vector3<f64>)> {
    if delta_t == 0.0 {
        return Some((r0, v0));
    }
    let norm_r0 = r0.norm();
    let alpha = -v0.norm_squared() / mu + 2.0 / norm_r0;
    let dot_r0v0 = r0.dot(&v0);
    let sqrt_mu = libm::sqrt(mu);

    let mut xn_new = if alpha > 1e-6 {
        sqrt_mu * delta_t * alpha
    } else if alpha < -1e-6 {
        let a = 1.0 / alpha;
        delta_t.signum()
            * libm::sqrt(-a)
            * libm::log(
                (-2.0 * mu * alpha * delta_t)
                    / (dot_r0v0
                        + delta_t.signum() * libm::sqrt(-mu * a) * (1.0 - norm_r0 * alpha)),
            )
    } else {
        let h = r0.cross(&v0);
        let p = h.norm_squared() / mu;
        let s = libm::atan2(1.0, 3.0 * delta_t * libm::sqrt(mu / p.powi(3))) / 2.0;
        let w = libm::atan(libm::cbrt(libm::tan(s)));
        libm::sqrt(p) * 2.0 / libm::tan(2.0 * w)
    };

    let mut xn = f64::NAN;
    let mut c2 = f64::NAN;
    let mut c3 = f64::NAN;
    let mut r = f64::NAN;
    let mut psi = f64::NAN;
    let mut converged = false;
    for _ in 0..maxiter {
        xn = xn_new;
        psi = xn.powi(2) * alpha;
        (c2, c3) = calc_c2c3(psi);
        r = xn * xn * c2 + dot_r0v0 / sqrt_mu * xn * (1.0 - psi * c3) + norm_r0 * (1.0 - psi * c2);
        xn_new = xn
            + (sqrt_mu * delta_t
                - xn * xn * xn * c3
                - dot_r0v0 / sqrt_mu * xn * xn * c2
                - norm_r0 * xn * (1.0 - psi * c3))
                / r;

        if (xn_new - xn).abs() < tol {
            converged = true;
            break;
        }
    }
    if !converged || !r.is_finite() {
        return None;
    }

    let f = 1.0 - xn.powi(2) / norm_r0 * c2;
    let g = delta_t - xn.powi(3) / sqrt_mu * c3;
    let gdot = 1.0 - xn.powi(2) / r * c2;
    let fdot = sqrt_mu / (r * norm_r0) * xn * (psi * c3 - 1.0);

    Some((f * r0 + g * v0, fdot * r0 + gdot * v0))
}

pub fn calc_c2c3(psi: f64) -> (f64, f64) {
    if psi > 1e-6 {
        let sp = libm::sqrt(psi);
        ((1.0 - libm::cos(sp)) / psi, (sp - libm::sin(sp)) / (psi * sp))
    } else if psi < -1e-6 {
        let sp = libm::sqrt(-psi);
        ((1.0 - libm::cosh(sp)) / psi, (libm::sinh(sp) - sp) / (sp * sp * sp))
    } else {
        (1.0 / 2.0, 1.0 / 6.0)
    }
}

pub fn ma_to_ta(ma: f64, e: f64, tol: f64, maxiter: u64) -> Option<f64> {
    let ea = ma_to_ea(ma, e, tol, maxiter)?;
    Some(ea_to_ta(ea, e))
}

pub fn ea_to_ta(ea: f64, e: f64) -> f64 {
    let beta = e / (1.0 + libm::sqrt(1.0 - e.powi(2)));
    ea + 2.0 * libm::atan2(beta * libm::sin(ea), 1.0 - beta * libm::cos(ea))
}

pub fn ta_to_ea(ta: f64, e: f64) -> f64 {
    libm::atan2(
        libm::sqrt(1.0 - e.powi(2)) * libm::sin(ta),
        e + libm::cos(ta),
    )
}

pub fn ea_to_ma(ea: f64, e: f64) -> f64 {
    (ea - e * libm::sin(ea)).rem_euclid(2.0 * consts::PI)
}

/// Solve Kepler's equation with Newton iteration.
pub fn ma_to_ea(ma: f64, e: f64, tol: f64, maxiter: u64) -> Option<f64> {
    if !(0.0..1.0).contains(&e) {
        return None;
    }
    let ma = (ma + consts::PI).rem_euclid(2.0 * consts::PI) - consts::PI;
    let mut ea = if ma < 0.0 { ma - e } else { ma + e };

    for _ in 0..maxiter {
        let ea_new = ea + (ma - ea + e * libm::sin(ea)) / (1.0 - e * libm::cos(ea));
        if (ea_new - ea).abs() < tol {
            return Some(ea_new);
        }
        ea = ea_new;
    }
    None
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const MU_EARTH: f64 = 398_600.44;

    fn sv(position: Vector3<f64>, velocity: Vector3<f64>) -> StateVector {
        StateVector {
            central: BodyId::EARTH,
            mu: MU_EARTH,
            position,
            velocity,
            epoch: Epoch::J2000,
        }
    }

    #[test]
    fn elements_round_trip() {
        let orbit = Orbit::from_mean_elements(
            10000.0,
            0.2,
            0.5,
            1.0,
            2.0,
            0.3,
        )
        .unwrap();
        let (r, v) = orbit.state(MU_EARTH);
        let back = sv(r, v).to_orbit(1e-10);
        assert_relative_eq!(back.semimajor_axis(), 10000.0, max_relative = 1e-9);
        assert_relative_eq!(back.e, 0.2, epsilon = 1e-9);
        assert_relative_eq!(back.i, 0.5, epsilon = 1e-9);
        assert_relative_eq!(back.lan, 1.0, epsilon = 1e-9);
        assert_relative_eq!(back.argpe, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn universal_propagation_full_period() {
        let r = 7000.0;
        let v = libm::sqrt(MU_EARTH / r);
        let start = sv(Vector3::new(r, 0.0, 0.0), Vector3::new(0.0, v, 0.0));
        let period = 2.0 * consts::PI * libm::sqrt(r.powi(3) / MU_EARTH);
        let end = start.propagate(period, 1e-9, 100).unwrap();
        assert_relative_eq!(end.position, start.position, epsilon = 1e-3);
        assert_relative_eq!(end.velocity, start.velocity, epsilon = 1e-6);
    }

    #[test]
    fn time_to_periapsis_from_apoapsis_is_half_period() {
        let orbit = Orbit::from_mean_elements(10000.0, 0.2, 0.0, 0.0, 0.0, consts::PI).unwrap();
        let t = orbit.time_to_apsis(MU_EARTH, Apsis::Periapsis).unwrap();
        assert_relative_eq!(t, orbit.period(MU_EARTH) / 2.0, max_relative = 1e-9);
    }

    #[test]
    fn kepler_rejects_hyperbolic() {
        assert_eq!(ma_to_ea(1.0, 1.5, 1e-12, 50), None);
    }
}
