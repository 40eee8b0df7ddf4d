//! Sphere-of-influence bookkeeping: decides when a satellite changes
//! central body and rebases its state.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bodies::{BodyId, SolarSystem},
    error::Result,
};

/// What happens when a satellite leaves its central body's SOI.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoiPolicy {
    /// Switch to the parent body and keep going.
    #[default]
    Rebase,
    /// End the propagation at the first exit, leaving the last sample in
    /// the old frame.
    StopAtExit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Exit,
    Entry,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoiEvent {
    /// Seconds since the start of the propagation
    pub offset: f64,
    pub from: BodyId,
    pub to: BodyId,
    pub kind: TransitionKind,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Outcome {
    Stay,
    Rebased(SoiEvent),
    Stopped(SoiEvent),
}

/// Re-express an inertial state relative to a different body.
pub fn rebase(
    system: &SolarSystem,
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    from: BodyId,
    to: BodyId,
    offset: f64,
) -> Result<(Vector3<f64>, Vector3<f64>)> {
    let (dr, dv) = system.relative_state(from, to, offset)?;
    Ok((position + dr, velocity + dv))
}

/// Transition the satellite would make at this state, if any. Exits take
/// priority and lead to the SOI parent. Entries are only looked for while
/// inside the current SOI; the smallest SOI containing the satellite wins.
/// A barycenter central body also hands over to the attractor dominating
/// it.
pub fn pending_transition(
    system: &SolarSystem,
    central: BodyId,
    position: &Vector3<f64>,
    offset: f64,
) -> Result<Option<(BodyId, TransitionKind)>> {
    let body = system.body(central)?;
    if let Some(parent) = system.soi_parent(central) {
        if position.norm() > body.soi {
            return Ok(Some((parent, TransitionKind::Exit)));
        }
    }

    let hub = system.dominant(central);
    let candidates = (hub != central)
        .then_some(hub)
        .into_iter()
        .chain(system.soi_children(hub).iter().copied());
    let mut best: Option<(BodyId, f64)> = None;
    for child in candidates {
        let c = system.body(child)?;
        let (rc, _) = system.relative_state(child, central, offset)?;
        let dist = (position - rc).norm();
        if dist < c.soi && best.map_or(true, |(_, soi)| c.soi < soi) {
            best = Some((child, c.soi));
        }
    }
    Ok(best.map(|(id, _)| (id, TransitionKind::Entry)))
}

/// Check the satellite's state after an accepted step and apply at most one
/// transition according to `policy`.
pub fn update(
    system: &SolarSystem,
    policy: SoiPolicy,
    central: &mut BodyId,
    position: &mut Vector3<f64>,
    velocity: &mut Vector3<f64>,
    offset: f64,
) -> Result<Outcome> {
    let Some((to, kind)) = pending_transition(system, *central, position, offset)? else {
        return Ok(Outcome::Stay);
    };
    let event = SoiEvent {
        offset,
        from: *central,
        to,
        kind,
    };
    if kind == TransitionKind::Exit && policy == SoiPolicy::StopAtExit {
        debug!(from = %event.from, to = %event.to, offset, "soi exit, stopping");
        return Ok(Outcome::Stopped(event));
    }
    let (r, v) = rebase(system, position, velocity, *central, to, offset)?;
    *position = r;
    *velocity = v;
    *central = to;
    debug!(from = %event.from, to = %event.to, ?kind, offset, "soi transition");
    Ok(Outcome::Rebased(event))
}
