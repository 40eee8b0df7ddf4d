use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{arena::IdLike, bodies::BodyId, maneuver::ManeuverQueue};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct SatelliteId(pub u64);

impl IdLike for SatelliteId {
    fn from_raw(index: u64) -> Self {
        Self(index)
    }

    fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sat-{}", self.0)
    }
}

/// A propagated object. Position and velocity are relative to the current
/// central body in its inertial, non-rotating frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Satellite {
    pub id: SatelliteId,
    #[serde(default)]
    pub name: String,
    /// `km`
    pub position: Vector3<f64>,
    /// `km/s`
    pub velocity: Vector3<f64>,
    pub central: BodyId,
    /// `kg`
    pub mass: f64,
    /// Cross-sectional area (`m^2`)
    pub area: f64,
    #[serde(alias = "cd")]
    pub drag_coefficient: f64,
    #[serde(default)]
    pub maneuvers: ManeuverQueue,
}

impl Satellite {
    pub fn new(
        id: SatelliteId,
        central: BodyId,
        position: Vector3<f64>,
        velocity: Vector3<f64>,
    ) -> Self {
        Self {
            id,
            name: String::new(),
            position,
            velocity,
            central,
            mass: 1000.0,
            area: 1.0,
            drag_coefficient: 2.2,
            maneuvers: ManeuverQueue::default(),
        }
    }

    pub fn sample(&self, offset: f64) -> TrajectorySample {
        TrajectorySample {
            offset,
            position: self.position,
            velocity: self.velocity,
            central: self.central,
            flags: SampleFlags::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFlags {
    pub entered_soi: bool,
    pub exited_soi: bool,
}

impl SampleFlags {
    pub fn bits(self) -> u8 {
        u8::from(self.entered_soi) | u8::from(self.exited_soi) << 1
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            entered_soi: bits & 1 != 0,
            exited_soi: bits & 2 != 0,
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.entered_soi |= other.entered_soi;
        self.exited_soi |= other.exited_soi;
    }
}

/// One emitted point of a trajectory.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    /// Seconds since the start of the propagation
    pub offset: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub central: BodyId,
    pub flags: SampleFlags,
}

impl TrajectorySample {
    /// Number of `f64`s one sample takes up in a packed buffer.
    pub const STRIDE: usize = 9;

    pub fn pack_into(&self, buf: &mut Vec<f64>) {
        buf.extend_from_slice(&[
            self.offset,
            self.position.x,
            self.position.y,
            self.position.z,
            self.velocity.x,
            self.velocity.y,
            self.velocity.z,
            f64::from(self.central.0),
            f64::from(self.flags.bits()),
        ]);
    }

    /// Inverse of [`Self::pack_into`] for one stride-sized chunk.
    pub fn unpack(chunk: &[f64]) -> Option<Self> {
        let &[offset, x, y, z, vx, vy, vz, central, flags] = chunk else {
            return None;
        };
        Some(Self {
            offset,
            position: Vector3::new(x, y, z),
            velocity: Vector3::new(vx, vy, vz),
            central: BodyId(central as i32),
            flags: SampleFlags::from_bits(flags as u8),
        })
    }
}
