use nalgebra::Vector3;

use super::{Ballistic, CentralField};

/// Atmospheric drag against the co-rotating atmosphere,
/// `0.5 * rho * v_rel^2 * Cd * A / m` opposite to `v_rel`.
///
/// Density is in `kg/m^3`, area in `m^2` and mass in `kg`, so the magnitude
/// is formed in SI units and converted back to `km/s^2`.
pub fn acceleration(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    central: &CentralField,
    ballistic: &Ballistic,
) -> Vector3<f64> {
    let Some(atmosphere) = central.body.atmosphere else {
        return Vector3::zeros();
    };
    if ballistic.mass <= 0.0 {
        return Vector3::zeros();
    }
    let altitude = position.norm() - central.body.equatorial_radius;
    let rho = atmosphere.density(altitude);
    if rho == 0.0 {
        return Vector3::zeros();
    }

    let v_rel = velocity - central.angular_velocity.cross(position);
    let speed = v_rel.norm();
    if speed == 0.0 {
        return Vector3::zeros();
    }
    let speed_si = speed * 1000.0;
    let magnitude = 0.5 * rho * speed_si * speed_si * ballistic.cd * ballistic.area / ballistic.mass;
    -v_rel / speed * (magnitude / 1000.0)
}
