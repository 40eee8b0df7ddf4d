use nalgebra::{UnitQuaternion, Vector3};

use crate::bodies::CelestialBody;

/// Point-mass attraction `-mu * r / |r|^3`.
pub fn point_mass(position: &Vector3<f64>, mu: f64) -> Vector3<f64> {
    let r = position.norm();
    if r == 0.0 {
        return Vector3::zeros();
    }
    -mu * position / (r * r * r)
}

/// Oblateness perturbation, evaluated in the body's polar-axis frame and
/// rotated back to inertial axes. Zero below the polar radius and for
/// bodies without a J2 coefficient.
pub fn j2(
    position: &Vector3<f64>,
    body: &CelestialBody,
    orientation: &UnitQuaternion<f64>,
) -> Vector3<f64> {
    let Some(j2) = body.j2 else {
        return Vector3::zeros();
    };
    let r = position.norm();
    if r < body.polar_radius() || r == 0.0 {
        return Vector3::zeros();
    }

    let p = orientation.inverse_transform_vector(position);
    let re2 = body.equatorial_radius * body.equatorial_radius;
    let r2 = r * r;
    let z2_r2 = p.z * p.z / r2;
    let factor = -1.5 * j2 * body.mu * re2 / (r2 * r2 * r);
    let a = Vector3::new(
        factor * p.x * (1.0 - 5.0 * z2_r2),
        factor * p.y * (1.0 - 5.0 * z2_r2),
        factor * p.z * (3.0 - 5.0 * z2_r2),
    );
    orientation.transform_vector(&a)
}

#[cfg(test)]
mod tests {
    use std::f64::consts;

    use approx::assert_relative_eq;

    use super::*;
    use crate::bodies::BodyId;

    fn earth() -> CelestialBody {
        CelestialBody {
            j2: Some(1.082_63e-3),
            polar_radius: 6356.75,
            ..CelestialBody::new(BodyId::EARTH, "Earth", 398_600.4418, 6378.137)
        }
    }

    #[test]
    fn j2_strengthens_equatorial_pull() {
        let earth = earth();
        let r = Vector3::new(7000.0, 0.0, 0.0);
        let a = j2(&r, &earth, &UnitQuaternion::identity());
        // At the equator J2 adds 1.5 * J2 * (Re/r)^2 of the point-mass pull.
        let expected = 1.5 * 1.082_63e-3 * (6378.137_f64 / 7000.0).powi(2) * 398_600.4418 / 49e6;
        assert_relative_eq!(a.x, -expected, max_relative = 1e-12);
        assert_eq!(a.y, 0.0);
        assert_eq!(a.z, 0.0);
    }

    #[test]
    fn j2_follows_the_pole() {
        let earth = earth();
        // Pole tilted onto inertial +x.
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), consts::FRAC_PI_2);
        let over_pole = Vector3::new(7000.0, 0.0, 0.0);
        let a = j2(&over_pole, &earth, &q);
        let b = j2(&Vector3::new(0.0, 0.0, 7000.0), &earth, &UnitQuaternion::identity());
        assert_relative_eq!(a.x, b.z, max_relative = 1e-9);
        // Weaker pull over the pole.
        assert!(a.x > 0.0);
    }

    #[test]
    fn j2_vanishes_inside_body() {
        let earth = earth();
        let a = j2(&Vector3::new(1000.0, 0.0, 0.0), &earth, &UnitQuaternion::identity());
        assert_eq!(a, Vector3::zeros());
    }
}
