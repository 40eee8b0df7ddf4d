//! Two-burn Hohmann transfers between coplanar (or nearly coplanar)
//! orbits.

use std::f64::consts;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LocalDeltaV, ManeuverNode};
use crate::{
    error::{Error, Result},
    kepler::orbits::{Apsis, StateVector},
    satellite::SatelliteId,
};

const CIRCULAR_TOL: f64 = 1e-6;

/// Orbit to transfer to. Radii in km, inclination in radians.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetOrbit {
    pub periapsis: f64,
    pub apoapsis: f64,
    #[serde(default)]
    pub inclination: Option<f64>,
}

impl TargetOrbit {
    pub fn circular(radius: f64) -> Self {
        Self {
            periapsis: radius,
            apoapsis: radius,
            inclination: None,
        }
    }

    fn semimajor_axis(&self) -> f64 {
        (self.periapsis + self.apoapsis) / 2.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Burn {
    /// Seconds after the state the transfer was planned from.
    pub offset: f64,
    /// Radius the burn happens at (`km`)
    pub radius: f64,
    pub delta_v: LocalDeltaV,
    pub magnitude: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HohmannTransfer {
    pub first: Burn,
    pub second: Burn,
    /// Time between the burns (`s`)
    pub transfer_time: f64,
}

impl HohmannTransfer {
    pub fn total_delta_v(&self) -> f64 {
        self.first.magnitude + self.second.magnitude
    }

    /// Maneuver nodes for both burns, timed from the planning state.
    pub fn nodes(&self, from: &StateVector, satellite: SatelliteId) -> [ManeuverNode; 2] {
        [self.first, self.second].map(|burn| ManeuverNode {
            time: from.epoch + burn.offset,
            delta_v: burn.delta_v,
            satellite,
        })
    }
}

fn vis_viva(mu: f64, r: f64, a: f64) -> f64 {
    libm::sqrt(mu * (2.0 / r - 1.0 / a))
}

/// Plan a transfer from the current orbit of `sv` to `target`.
///
/// Raising transfers start at the next periapsis and lowering ones at the
/// next apoapsis; a circular orbit burns immediately. Any inclination
/// change is folded into the second burn.
pub fn plan(sv: &StateVector, target: &TargetOrbit) -> Result<HohmannTransfer> {
    let mu = sv.mu;
    let orbit = sv.to_orbit(1e-8);
    if orbit.e >= 1.0 {
        return Err(Error::UnboundOrbit(orbit.e));
    }
    let a0 = orbit.semimajor_axis();
    let raising = target.apoapsis >= orbit.apoapsis_radius();

    let (r1, t1) = if orbit.e < CIRCULAR_TOL {
        (sv.position.norm(), 0.0)
    } else {
        let apsis = if raising {
            Apsis::Periapsis
        } else {
            Apsis::Apoapsis
        };
        let t = orbit
            .time_to_apsis(mu, apsis)
            .ok_or(Error::UnboundOrbit(orbit.e))?;
        (orbit.apsis_radius(apsis), t)
    };
    let r2 = if raising {
        target.apoapsis
    } else {
        target.periapsis
    };

    let at = (r1 + r2) / 2.0;
    let transfer_time = consts::PI * libm::sqrt(at.powi(3) / mu);

    let dv1 = vis_viva(mu, r1, at) - vis_viva(mu, r1, a0);

    let vt2 = vis_viva(mu, r2, at);
    let vf = vis_viva(mu, r2, target.semimajor_axis());
    let di = target.inclination.map_or(0.0, |i| i - orbit.i);
    let (sin_di, cos_di) = di.sin_cos();
    let second = LocalDeltaV::new(vf * cos_di - vt2, vf * sin_di, 0.0);

    let transfer = HohmannTransfer {
        first: Burn {
            offset: t1,
            radius: r1,
            delta_v: LocalDeltaV::new(dv1, 0.0, 0.0),
            magnitude: dv1.abs(),
        },
        second: Burn {
            offset: t1 + transfer_time,
            radius: r2,
            delta_v: second,
            magnitude: second.magnitude(),
        },
        transfer_time,
    };
    debug!(
        r1,
        r2,
        dv1,
        dv2 = transfer.second.magnitude,
        transfer_time,
        "planned hohmann transfer"
    );
    Ok(transfer)
}
