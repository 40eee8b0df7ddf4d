use std::f64::consts;

use nalgebra::{Matrix3, Vector3};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    satellite::SatelliteId,
    time::Epoch,
};

pub mod hohmann;

/// Delta-V in the local orbital basis (`km/s`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalDeltaV {
    pub prograde: f64,
    pub normal: f64,
    pub radial: f64,
}

impl LocalDeltaV {
    pub fn new(prograde: f64, normal: f64, radial: f64) -> Self {
        Self {
            prograde,
            normal,
            radial,
        }
    }

    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.prograde, self.normal, self.radial)
    }

    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    pub fn magnitude(self) -> f64 {
        self.to_vector().norm()
    }

    /// Pitch above the local horizontal and yaw out of plane (`rad`).
    pub fn pitch_yaw(self) -> (f64, f64) {
        let dv = self.to_vector();
        let theta = libm::acos(dv.z / dv.norm());
        let psi = dv.y.signum() * libm::acos(dv.x / libm::sqrt(dv.x.powi(2) + dv.y.powi(2)));
        (consts::FRAC_PI_2 - theta, psi)
    }
}

impl std::ops::Neg for LocalDeltaV {
    type Output = LocalDeltaV;

    fn neg(self) -> Self::Output {
        Self::new(-self.prograde, -self.normal, -self.radial)
    }
}

/// Local orbital basis to inertial conversion matrix. Columns are
/// prograde, orbit normal and the outward in-plane direction.
///
/// `None` for a zero velocity or a purely radial state, where the basis is
/// undefined.
pub fn frenet(position: &Vector3<f64>, velocity: &Vector3<f64>) -> Option<Matrix3<f64>> {
    let t = velocity.try_normalize(1e-12)?;
    let n = position.cross(velocity).try_normalize(1e-12)?;
    let b = t.cross(&n);
    Some(Matrix3::from_columns(&[t, n, b]))
}

/// Velocity after a burn of `dv` at the given state.
pub fn apply_delta_v(
    velocity: &Vector3<f64>,
    dv: LocalDeltaV,
    position: &Vector3<f64>,
) -> Result<Vector3<f64>> {
    let basis = frenet(position, velocity).ok_or(Error::DegenerateBasis)?;
    Ok(velocity + basis * dv.to_vector())
}

/// Express an inertial delta-V in the local basis at the given state.
pub fn to_local(
    dv: &Vector3<f64>,
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
) -> Result<LocalDeltaV> {
    let basis = frenet(position, velocity).ok_or(Error::DegenerateBasis)?;
    Ok(LocalDeltaV::from_vector(&(basis.transpose() * dv)))
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManeuverNode {
    /// Execution time.
    pub time: Epoch,
    pub delta_v: LocalDeltaV,
    pub satellite: SatelliteId,
}

/// What happens to a node once a propagation has executed it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManeuverMode {
    /// Executed nodes are dropped from the propagated copy of the queue.
    #[default]
    Preview,
    /// Executed nodes stay queued; the owner applies each one once, by time
    /// window.
    Committed,
}

/// Maneuver nodes of one satellite, kept in execution order. Nodes at the
/// same time run in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManeuverQueue(Vec<ManeuverNode>);

impl ManeuverQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: ManeuverNode) {
        let key = OrderedFloat(node.time.seconds());
        let at = self
            .0
            .partition_point(|n| OrderedFloat(n.time.seconds()) <= key);
        self.0.insert(at, node);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManeuverNode> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&ManeuverNode> {
        self.0.first()
    }

    /// Execution time of the first node strictly after `after`.
    pub fn next_after(&self, after: Epoch) -> Option<Epoch> {
        self.0.iter().map(|n| n.time).find(|&t| t > after)
    }

    /// Nodes with `from < time <= to`, in order.
    pub fn due(&self, from: Epoch, to: Epoch) -> impl Iterator<Item = &ManeuverNode> {
        self.0.iter().filter(move |n| n.time > from && n.time <= to)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl FromIterator<ManeuverNode> for ManeuverQueue {
    fn from_iter<I: IntoIterator<Item = ManeuverNode>>(iter: I) -> Self {
        let mut queue = Self::new();
        for node in iter {
            queue.push(node);
        }
        queue
    }
}

impl Extend<ManeuverNode> for ManeuverQueue {
    fn extend<I: IntoIterator<Item = ManeuverNode>>(&mut self, iter: I) {
        for node in iter {
            self.push(node);
        }
    }
}
