//! Numerical search for the next periapsis or apoapsis passage.

use nalgebra::Vector3;
use tracing::trace;

use crate::{
    bodies::{BodyId, SolarSystem},
    error::Result,
    forces::Ballistic,
    integrator::State,
    kepler::orbits::Apsis,
    propagation::{Dynamics, PropagationSettings},
    satellite::{Satellite, SatelliteId},
    time::Epoch,
};

pub const DEFAULT_CADENCE: f64 = 60.0;

/// Steps a satellite forward at a coarse cadence watching the sign of its
/// radial rate.
pub struct ApsisFinder<'a> {
    pub system: &'a SolarSystem,
    pub settings: PropagationSettings,
    pub start: Epoch,
    /// Seconds between radial-rate checks. Anything but a positive value
    /// falls back to [`DEFAULT_CADENCE`].
    pub cadence: f64,
}

impl<'a> ApsisFinder<'a> {
    pub fn new(system: &'a SolarSystem) -> Self {
        Self {
            system,
            settings: PropagationSettings::default(),
            start: system.epoch,
            cadence: DEFAULT_CADENCE,
        }
    }

    /// Seconds until the next passage of `kind`, or `None` if there is none
    /// within `max_lookahead` seconds.
    pub fn find(
        &self,
        satellite: &Satellite,
        kind: Apsis,
        max_lookahead: f64,
    ) -> Result<Option<f64>> {
        let dynamics = Dynamics {
            system: self.system,
            settings: &self.settings,
            ballistic: Ballistic {
                mass: satellite.mass,
                area: satellite.area,
                cd: satellite.drag_coefficient,
            },
            start: self.start,
        };
        let central = satellite.central;
        let mut state = State::new(satellite.position, satellite.velocity);
        let mut warnings = Vec::new();
        let mut t = 0.0;
        let mut dt = self.settings.integrator.initial_dt;
        let mut prev = radial_rate(&state);
        let mut prev_t = 0.0;
        let cadence = if self.cadence > 0.0 {
            self.cadence
        } else {
            DEFAULT_CADENCE
        };

        while t < max_lookahead {
            let mark = (t + cadence).min(max_lookahead);
            while t < mark {
                let requested = dt.min(mark - t);
                let step = dynamics.step(t, central, &state, requested, &mut warnings)?;
                t = if step.achieved_dt == requested && requested == mark - t {
                    mark
                } else {
                    t + step.achieved_dt
                };
                state = step.state;
                dt = step.next_dt;
            }

            let cur = radial_rate(&state);
            let flipped = match kind {
                Apsis::Periapsis => prev < 0.0 && cur >= 0.0,
                Apsis::Apoapsis => prev > 0.0 && cur <= 0.0,
            };
            if flipped {
                let at = t - (t - prev_t) * cur / (cur - prev);
                trace!(?kind, at, "found apsis");
                return Ok(Some(at));
            }
            prev = cur;
            prev_t = t;
        }
        Ok(None)
    }
}

fn radial_rate(state: &State) -> f64 {
    state.position.dot(&state.velocity) / state.position.norm()
}

/// Time until the next `kind` apsis of a state relative to `central`,
/// searched with default settings from the registry epoch.
pub fn find_next_apsis(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    system: &SolarSystem,
    central: BodyId,
    kind: Apsis,
    max_lookahead: f64,
) -> Result<Option<f64>> {
    let satellite = Satellite::new(SatelliteId::default(), central, *position, *velocity);
    ApsisFinder::new(system).find(&satellite, kind, max_lookahead)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        bodies::CelestialBody,
        kepler::orbits::{Orbit, StateVector},
    };

    const MU: f64 = 398_600.4418;

    fn two_body() -> SolarSystem {
        let earth = CelestialBody::new(BodyId::EARTH, "Earth", MU, 6378.0);
        SolarSystem::new(Epoch::J2000, [earth]).unwrap()
    }

    fn orbit(ta: f64) -> Orbit {
        Orbit {
            p: 10_000.0 * (1.0 - 0.04),
            e: 0.2,
            i: 0.3,
            lan: 1.0,
            argpe: 0.5,
            ta,
        }
    }

    #[test]
    fn periapsis_matches_kepler() {
        let system = two_body();
        let orbit = orbit(1.0);
        let (r, v) = orbit.state(MU);
        let expected = orbit.time_to_apsis(MU, Apsis::Periapsis).unwrap();
        let found = find_next_apsis(&r, &v, &system, BodyId::EARTH, Apsis::Periapsis, 20_000.0)
            .unwrap()
            .unwrap();
        assert_relative_eq!(found, expected, epsilon = 5.0);
    }

    #[test]
    fn apoapsis_matches_kepler() {
        let system = two_body();
        let orbit = orbit(-2.0);
        let (r, v) = orbit.state(MU);
        let expected = orbit.time_to_apsis(MU, Apsis::Apoapsis).unwrap();
        let found = find_next_apsis(&r, &v, &system, BodyId::EARTH, Apsis::Apoapsis, 20_000.0)
            .unwrap()
            .unwrap();
        assert_relative_eq!(found, expected, epsilon = 5.0);

        // Sanity check of the analytic reference itself.
        let sv = StateVector {
            central: BodyId::EARTH,
            mu: MU,
            position: r,
            velocity: v,
            epoch: Epoch::J2000,
        };
        let at = sv.propagate(expected, 1e-9, 60).unwrap();
        assert_relative_eq!(at.position.norm(), orbit.apoapsis_radius(), max_relative = 1e-6);
    }

    #[test]
    fn unusable_cadence_falls_back_to_default() {
        let system = two_body();
        let orbit = orbit(1.0);
        let (r, v) = orbit.state(MU);
        let satellite = Satellite::new(SatelliteId(1), BodyId::EARTH, r, v);
        let expected = find_next_apsis(&r, &v, &system, BodyId::EARTH, Apsis::Periapsis, 20_000.0)
            .unwrap()
            .unwrap();
        for cadence in [0.0, -5.0, f64::NAN] {
            let finder = ApsisFinder {
                cadence,
                ..ApsisFinder::new(&system)
            };
            let found = finder
                .find(&satellite, Apsis::Periapsis, 20_000.0)
                .unwrap()
                .unwrap();
            assert_relative_eq!(found, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn nothing_within_short_lookahead() {
        let system = two_body();
        let orbit = orbit(1.0);
        let (r, v) = orbit.state(MU);
        let found =
            find_next_apsis(&r, &v, &system, BodyId::EARTH, Apsis::Periapsis, 600.0).unwrap();
        assert_eq!(found, None);
    }
}
