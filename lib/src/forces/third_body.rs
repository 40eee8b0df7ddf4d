use nalgebra::Vector3;

use super::Perturber;

/// Differential (tidal) attraction of the perturbers: the pull on the
/// satellite minus the pull on the central body. Perturbers that do not
/// pull the origin contribute their direct pull only.
pub fn acceleration(position: &Vector3<f64>, perturbers: &[Perturber]) -> Vector3<f64> {
    perturbers
        .iter()
        .map(|p| {
            let d = p.position;
            let rel = d - position;
            let rel_n = rel.norm();
            if rel_n == 0.0 {
                return Vector3::zeros();
            }
            let direct = p.mu * rel / rel_n.powi(3);
            let d_n = d.norm();
            if !p.pulls_origin {
                direct
            } else if d_n == 0.0 {
                Vector3::zeros()
            } else {
                direct - p.mu * d / d_n.powi(3)
            }
        })
        .fold(Vector3::zeros(), |acc, a| acc + a)
}
