//! Picks the third bodies whose pull is worth integrating.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::Perturber;
use crate::{
    bodies::{BodyId, SolarSystem},
    error::Result,
};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Significance {
    /// Minimum ratio of a candidate's point-mass pull to the central pull.
    pub threshold: f64,
    /// A candidate is kept while the satellite is within this many of its
    /// Hill radii about its own SOI parent.
    pub hill_multiple: f64,
}

impl Default for Significance {
    fn default() -> Self {
        Self {
            threshold: 1e-6,
            hill_multiple: 3.0,
        }
    }
}

/// Bodies that should perturb a satellite at `position` (relative to
/// `central`) `offset` seconds after the registry epoch, in id order.
///
/// Moons of a non-star central body are always kept, as is a star above a
/// non-star central body. A barycenter central body always keeps the
/// attractor dominating it, since it pulls nothing itself. Barycenters and
/// the central body are never kept.
pub fn select(
    system: &SolarSystem,
    central: BodyId,
    position: &Vector3<f64>,
    offset: f64,
    significance: &Significance,
) -> Result<Vec<BodyId>> {
    let central_body = system.body(central)?;
    let central_mu = system.system_mu(central);
    let hub = system.dominant(central);
    let r = position.norm();
    let central_accel = if r > 0.0 {
        central_mu / (r * r)
    } else {
        f64::INFINITY
    };

    let mut out = Vec::new();
    for candidate in system.iter() {
        if candidate.id == central || !candidate.is_attractor() {
            continue;
        }
        let always = (candidate.id == hub)
            || (!central_body.is_star && system.soi_parent(candidate.id) == Some(central))
            || (candidate.is_star
                && !central_body.is_star
                && system.is_soi_ancestor(candidate.id, hub));

        let keep = always || {
            let (d, _) = system.relative_state(candidate.id, central, offset)?;
            let sep = (d - position).norm();
            let ratio = candidate.mu / (sep * sep) / central_accel;
            ratio >= significance.threshold
                || sep < significance.hill_multiple * hill_radius(system, candidate.id, offset)?
        };
        if keep {
            out.push(candidate.id);
        }
    }
    out.sort_unstable();
    trace!(%central, bodies = ?out, "selected perturbers");
    Ok(out)
}

/// Hill radius of a body about its SOI parent. Zero for a body with none.
fn hill_radius(system: &SolarSystem, id: BodyId, offset: f64) -> Result<f64> {
    let Some(parent) = system.soi_parent(id) else {
        return Ok(0.0);
    };
    let (a, _) = system.relative_state(id, parent, offset)?;
    let mu = system.body(id)?.mu;
    Ok(a.norm() * libm::cbrt(mu / (3.0 * system.body(parent)?.mu)))
}

/// Positions of the given bodies relative to `central`.
///
/// A barycenter central body is not pulled by the bodies it is the centre
/// of mass of, so those perturbers carry no frame term.
pub fn perturbers_at(
    system: &SolarSystem,
    central: BodyId,
    bodies: &[BodyId],
    offset: f64,
) -> Result<Vec<Perturber>> {
    let barycenter = system.body(central)?.is_barycenter();
    bodies
        .iter()
        .map(|&id| {
            let (position, _) = system.relative_state(id, central, offset)?;
            Ok(Perturber {
                id,
                mu: system.body(id)?.mu,
                position,
                pulls_origin: !(barycenter && system.is_ancestor(central, id)),
            })
        })
        .collect()
}
