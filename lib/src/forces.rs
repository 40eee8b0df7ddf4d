//! Gravity and perturbation model.
//!
//! Accelerations are expressed in the inertial, non-rotating frame centred
//! on the satellite's central body, in `km/s^2`. Each term lives in its own
//! module and [`acceleration`] sums the enabled ones.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::bodies::{BodyId, CelestialBody};

pub mod drag;
pub mod gravity;
pub mod selector;
pub mod third_body;

/// The central body as seen by the force model at one instant.
#[derive(Copy, Clone, Debug)]
pub struct CentralField<'a> {
    pub body: &'a CelestialBody,
    /// Body-fixed to inertial rotation.
    pub orientation: UnitQuaternion<f64>,
    /// Angular velocity of the body-fixed frame (`rad/s`), inertial axes.
    pub angular_velocity: Vector3<f64>,
}

impl<'a> CentralField<'a> {
    pub fn new(body: &'a CelestialBody, orientation: UnitQuaternion<f64>) -> Self {
        let pole = orientation * Vector3::z();
        Self {
            body,
            orientation,
            angular_velocity: pole * body.rotation.rate(),
        }
    }

    /// A non-rotating central body with its pole along inertial `z`.
    pub fn fixed(body: &'a CelestialBody) -> Self {
        Self {
            body,
            orientation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
        }
    }
}

/// A third body, positioned relative to the central body.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Perturber {
    pub id: BodyId,
    pub mu: f64,
    pub position: Vector3<f64>,
    /// Whether the frame origin is accelerated toward this body. False for
    /// bodies orbiting inside a barycenter used as the origin.
    #[serde(default = "pulls")]
    pub pulls_origin: bool,
}

impl Perturber {
    pub fn new(id: BodyId, mu: f64, position: Vector3<f64>) -> Self {
        Self {
            id,
            mu,
            position,
            pulls_origin: true,
        }
    }
}

fn pulls() -> bool {
    true
}

/// Physical properties of the satellite that matter for drag.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballistic {
    /// `kg`
    pub mass: f64,
    /// `m^2`
    pub area: f64,
    pub cd: f64,
}

impl Default for Ballistic {
    fn default() -> Self {
        Self {
            mass: 1000.0,
            area: 1.0,
            cd: 2.2,
        }
    }
}

/// Which terms beyond the central point mass are enabled.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Terms {
    pub j2: bool,
    pub drag: bool,
    /// Multiplier on every term except the central point mass.
    pub scale: f64,
}

impl Default for Terms {
    fn default() -> Self {
        Self {
            j2: true,
            drag: true,
            scale: 1.0,
        }
    }
}

/// Total acceleration on a satellite at `position`/`velocity` relative to
/// the central body.
pub fn acceleration(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    central: &CentralField,
    perturbers: &[Perturber],
    ballistic: &Ballistic,
    terms: Terms,
) -> Vector3<f64> {
    let mut perturbation = third_body::acceleration(position, perturbers);
    if terms.j2 {
        perturbation += gravity::j2(position, central.body, &central.orientation);
    }
    if terms.drag {
        perturbation += drag::acceleration(position, velocity, central, ballistic);
    }
    gravity::point_mass(position, central.body.mu) + perturbation * terms.scale
}

/// Like [`acceleration`], but with the central body's own acceleration
/// toward the perturbers added back, which makes the result comparable
/// between different central bodies.
pub fn inertial_acceleration(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    central: &CentralField,
    perturbers: &[Perturber],
    ballistic: &Ballistic,
    terms: Terms,
) -> Vector3<f64> {
    let frame = perturbers
        .iter()
        .filter(|p| p.pulls_origin)
        .map(|p| gravity::point_mass(&-p.position, p.mu))
        .fold(Vector3::zeros(), |acc, a| acc + a);
    acceleration(position, velocity, central, perturbers, ballistic, terms) + frame * terms.scale
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::bodies::{BodyId, SolarSystem};
    use crate::time::Epoch;

    #[test]
    fn leo_acceleration_with_moon_and_sun() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let earth = sol.body(BodyId::EARTH).unwrap();
        let central = CentralField::fixed(earth);
        let r = Vector3::new(6771.0, 0.0, 0.0);
        let v = Vector3::new(0.0, (398_600.44_f64 / 6771.0).sqrt(), 0.0);
        let perturbers = [BodyId::MOON, BodyId::SUN]
            .map(|id| {
                let (position, _) = sol.relative_state(id, BodyId::EARTH, 0.0).unwrap();
                Perturber::new(id, sol.body(id).unwrap().mu, position)
            });
        let a = acceleration(
            &r,
            &v,
            &central,
            &perturbers,
            &Ballistic::default(),
            Terms {
                drag: false,
                ..Terms::default()
            },
        );
        assert_relative_eq!(a.norm(), 0.008_69, max_relative = 0.01);
        assert!(a.dot(&r) < 0.0);
    }

    #[test]
    fn scale_leaves_central_term_alone() {
        let body = CelestialBody::new(BodyId::EARTH, "Earth", 398_600.0, 6378.0);
        let central = CentralField::fixed(&body);
        let r = Vector3::new(7000.0, 0.0, 0.0);
        let a = acceleration(
            &r,
            &Vector3::zeros(),
            &central,
            &[],
            &Ballistic::default(),
            Terms {
                j2: false,
                drag: false,
                scale: 0.0,
            },
        );
        assert_relative_eq!(a, gravity::point_mass(&r, 398_600.0));
    }
}
