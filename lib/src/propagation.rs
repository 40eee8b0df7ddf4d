//! Numerical propagation of one satellite through the body hierarchy.

use std::{borrow::Cow, thread};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    bodies::{BodyId, BodyMotion, CelestialBody, SolarSystem},
    error::{Error, PropagationError, Result},
    forces::{
        self,
        selector::{self, Significance},
        Ballistic, CentralField, Terms,
    },
    frames::{self, Frame, FrameTransformer, FrameWarning, Geodetic},
    integrator::{Integrator, State, Step},
    kepler::orbits::Apsis,
    maneuver::{self, ManeuverMode, ManeuverNode},
    satellite::{SampleFlags, Satellite, TrajectorySample},
    soi::{self, Outcome, SoiEvent, SoiPolicy, TransitionKind},
    time::Epoch,
};

/// Offsets closer than this are the same instant.
const TIME_EPS: f64 = 1e-9;

/// Where samples are taken.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Sampling {
    /// `n` evenly spaced samples including both ends.
    Points(usize),
    /// One sample every `dt` seconds, plus one at the end.
    Step(f64),
}

impl Sampling {
    fn times(self, duration: f64) -> Vec<f64> {
        match self {
            Self::Points(0) => Vec::new(),
            Self::Points(1) => vec![0.0],
            Self::Points(n) => (0..n)
                .map(|k| duration * k as f64 / (n - 1) as f64)
                .collect(),
            Self::Step(dt) if dt > 0.0 => {
                let mut times = Vec::new();
                let mut k = 0.0;
                while k * dt < duration - TIME_EPS {
                    times.push(k * dt);
                    k += 1.0;
                }
                times.push(duration);
                times
            }
            Self::Step(_) => vec![0.0, duration],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationSettings {
    pub integrator: Integrator,
    pub include_j2: bool,
    pub include_drag: bool,
    /// Multiplier on every perturbation (everything but the central pull).
    pub perturbation_scale: f64,
    pub significance: Significance,
    pub soi_policy: SoiPolicy,
    pub body_motion: BodyMotion,
    pub maneuver_mode: ManeuverMode,
    /// Samples per streamed chunk.
    pub chunk_size: usize,
    /// Accepted steps between yields of the worker thread.
    pub yield_every: usize,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            integrator: Integrator::default(),
            include_j2: true,
            include_drag: true,
            perturbation_scale: 1.0,
            significance: Significance::default(),
            soi_policy: SoiPolicy::default(),
            body_motion: BodyMotion::default(),
            maneuver_mode: ManeuverMode::default(),
            chunk_size: 256,
            yield_every: 64,
        }
    }
}

impl PropagationSettings {
    pub fn terms(&self) -> Terms {
        Terms {
            j2: self.include_j2,
            drag: self.include_drag,
            scale: self.perturbation_scale,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    Completed,
    /// Stopped at the first SOI exit.
    SoiExit(SoiEvent),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    pub samples: Vec<TrajectorySample>,
    pub transitions: Vec<SoiEvent>,
    pub warnings: Vec<FrameWarning>,
    pub termination: Termination,
    /// The satellite at the end of the propagation.
    pub satellite: Satellite,
}

impl Trajectory {
    /// Apsis passages between consecutive samples around the same body,
    /// located by a sign change of the radial rate and linear interpolation.
    pub fn apsides(&self) -> Vec<(f64, Apsis)> {
        self.samples
            .iter()
            .tuple_windows()
            .filter(|(a, b)| a.central == b.central)
            .filter_map(|(a, b)| {
                let ra = a.position.dot(&a.velocity);
                let rb = b.position.dot(&b.velocity);
                let kind = if ra < 0.0 && rb >= 0.0 {
                    Apsis::Periapsis
                } else if ra > 0.0 && rb <= 0.0 {
                    Apsis::Apoapsis
                } else {
                    return None;
                };
                Some((a.offset + (b.offset - a.offset) * ra / (ra - rb), kind))
            })
            .collect()
    }
}

/// Receives progress from a running propagation.
pub trait Observer {
    /// Fraction of the requested duration covered so far.
    fn progress(&mut self, _fraction: f64) {}

    /// Samples emitted since the last chunk.
    fn chunk(&mut self, _samples: &[TrajectorySample]) {}

    /// Polled between steps.
    fn cancelled(&self) -> bool {
        false
    }
}

impl Observer for () {}

/// Equations of motion of one satellite against one registry snapshot.
pub struct Dynamics<'a> {
    pub system: &'a SolarSystem,
    pub settings: &'a PropagationSettings,
    pub ballistic: Ballistic,
    /// Absolute time at offset zero.
    pub start: Epoch,
}

impl Dynamics<'_> {
    /// Offset of `t` (seconds after `start`) from the registry epoch.
    pub fn body_offset(&self, t: f64) -> f64 {
        (self.start - self.system.epoch) + t
    }

    /// One adaptive step. Perturbers are selected at the start of the step
    /// and held for its duration.
    pub fn step(
        &self,
        t: f64,
        central: BodyId,
        state: &State,
        dt: f64,
        warnings: &mut Vec<FrameWarning>,
    ) -> Result<Step> {
        let body = self.system.body(central)?;
        let offset = self.body_offset(t);
        let selected = selector::select(
            self.system,
            central,
            &state.position,
            offset,
            &self.settings.significance,
        )?;
        let perturbers = selector::perturbers_at(self.system, central, &selected, offset)?;

        let (field, warning) =
            central_field(body, self.settings, self.system.epoch, self.start + t);
        if let Some(w) = warning {
            if !warnings.contains(&w) {
                warn!(body = %central, "no orientation data, assuming identity");
                warnings.push(w);
            }
        }
        let terms = self.settings.terms();

        self.settings.integrator.step(t, state, dt, |s| {
            forces::acceleration(
                &s.position,
                &s.velocity,
                &field,
                &perturbers,
                &self.ballistic,
                terms,
            )
        })
    }
}

/// The central body's field at `epoch`. Orientation only matters when J2 or
/// drag is on.
pub(crate) fn central_field<'a>(
    body: &'a CelestialBody,
    settings: &PropagationSettings,
    snapshot: Epoch,
    epoch: Epoch,
) -> (CentralField<'a>, Option<FrameWarning>) {
    if settings.include_j2 || settings.include_drag {
        let orientation = frames::orientation(body, snapshot, epoch);
        let field = CentralField {
            body,
            orientation: orientation.rotation,
            angular_velocity: orientation.angular_velocity(),
        };
        (field, orientation.warning(body.id))
    } else {
        (CentralField::fixed(body), None)
    }
}

pub struct Propagator<'a> {
    system: Cow<'a, SolarSystem>,
    settings: PropagationSettings,
}

impl<'a> Propagator<'a> {
    pub fn new(system: &'a SolarSystem, settings: PropagationSettings) -> Self {
        let system = if system.motion == settings.body_motion {
            Cow::Borrowed(system)
        } else {
            Cow::Owned(system.clone().with_motion(settings.body_motion))
        };
        Self { system, settings }
    }

    pub fn settings(&self) -> &PropagationSettings {
        &self.settings
    }

    pub fn system(&self) -> &SolarSystem {
        &self.system
    }

    /// Check that a satellite can be propagated against this registry.
    pub fn validate(&self, satellite: &Satellite) -> Result<()> {
        let Some(central) = self.system.get(satellite.central) else {
            return Err(Error::MissingCentralBody {
                satellite: satellite.id,
                body: satellite.central,
            });
        };
        if !central.is_attractor() && self.system.children(central.id).is_empty() {
            return Err(Error::MissingGravParam(central.id));
        }
        Ok(())
    }

    /// Propagate `satellite` for `duration` seconds from `start`.
    #[allow(clippy::too_many_lines)]
    pub fn propagate(
        &self,
        satellite: &Satellite,
        start: Epoch,
        duration: f64,
        sampling: Sampling,
        observer: &mut impl Observer,
    ) -> Result<Trajectory, PropagationError> {
        self.validate(satellite)?;
        let duration = duration.max(0.0);
        let dynamics = Dynamics {
            system: &self.system,
            settings: &self.settings,
            ballistic: Ballistic {
                mass: satellite.mass,
                area: satellite.area,
                cd: satellite.drag_coefficient,
            },
            start,
        };

        let sample_times = sampling.times(duration);
        let end = start + duration;
        let nodes = satellite
            .maneuvers
            .iter()
            .filter(|n| n.time >= start && n.time <= end)
            .copied()
            .collect::<Vec<ManeuverNode>>();

        let mut out = Trajectory {
            samples: Vec::with_capacity(sample_times.len()),
            transitions: Vec::new(),
            warnings: Vec::new(),
            termination: Termination::Completed,
            satellite: satellite.clone(),
        };
        let mut central = satellite.central;
        let mut state = State::new(satellite.position, satellite.velocity);
        let mut t = 0.0;
        let mut dt = self.settings.integrator.initial_dt;
        let mut next_sample = 0;
        let mut next_node = 0;
        let mut flushed = 0;
        let mut steps = 0usize;

        let last_sample = |samples: &[TrajectorySample]| samples.last().copied();

        loop {
            while next_node < nodes.len() && nodes[next_node].time - start <= t + TIME_EPS {
                let node = &nodes[next_node];
                state.velocity =
                    maneuver::apply_delta_v(&state.velocity, node.delta_v, &state.position)
                        .map_err(|e| PropagationError::new(e, last_sample(&out.samples)))?;
                debug!(satellite = %satellite.id, time = %node.time, "applied maneuver");
                next_node += 1;
            }

            if next_sample < sample_times.len() && (sample_times[next_sample] - t).abs() < TIME_EPS
            {
                emit(
                    &mut out.samples,
                    sample(sample_times[next_sample], &state, central, SampleFlags::default()),
                );
                next_sample += 1;
            }

            if out.samples.len() - flushed >= self.settings.chunk_size.max(1) {
                observer.chunk(&out.samples[flushed..]);
                observer.progress(progress(t, duration));
                flushed = out.samples.len();
            }

            if t >= duration - TIME_EPS {
                break;
            }
            if observer.cancelled() {
                debug!(satellite = %satellite.id, t, "propagation cancelled");
                out.termination = Termination::Cancelled;
                break;
            }

            let mut target = duration;
            if let Some(&ts) = sample_times.get(next_sample) {
                target = target.min(ts);
            }
            if let Some(node) = nodes.get(next_node) {
                target = target.min(node.time - start);
            }
            let requested = dt.min(target - t);

            let step = dynamics
                .step(t, central, &state, requested, &mut out.warnings)
                .map_err(|e| PropagationError::new(e, last_sample(&out.samples)))?;
            t = if step.achieved_dt == requested && requested == target - t {
                target
            } else {
                t + step.achieved_dt
            };
            state = step.state;
            // Don't let a short landing step shrink the next one.
            dt = if requested < dt && step.rejections == 0 {
                dt.max(step.next_dt)
            } else {
                step.next_dt
            };
            steps += 1;

            let outcome = soi::update(
                &self.system,
                self.settings.soi_policy,
                &mut central,
                &mut state.position,
                &mut state.velocity,
                dynamics.body_offset(t),
            )
            .map_err(|e| PropagationError::new(e, last_sample(&out.samples)))?;
            match outcome {
                Outcome::Stay => {}
                Outcome::Rebased(mut event) => {
                    event.offset = t;
                    out.transitions.push(event);
                    emit(&mut out.samples, sample(t, &state, central, flags_for(&event)));
                }
                Outcome::Stopped(mut event) => {
                    event.offset = t;
                    out.transitions.push(event);
                    emit(&mut out.samples, sample(t, &state, central, flags_for(&event)));
                    out.termination = Termination::SoiExit(event);
                    break;
                }
            }

            if self.settings.yield_every > 0 && steps % self.settings.yield_every == 0 {
                trace!(t, steps, "yielding");
                thread::yield_now();
            }
        }

        if flushed < out.samples.len() {
            observer.chunk(&out.samples[flushed..]);
        }
        observer.progress(progress(t, duration));

        out.satellite.position = state.position;
        out.satellite.velocity = state.velocity;
        out.satellite.central = central;
        if self.settings.maneuver_mode == ManeuverMode::Preview {
            out.satellite.maneuvers = satellite
                .maneuvers
                .iter()
                .filter(|n| !nodes[..next_node].contains(n))
                .copied()
                .collect();
        }
        debug!(
            satellite = %satellite.id,
            samples = out.samples.len(),
            transitions = out.transitions.len(),
            steps,
            termination = ?out.termination,
            "propagation finished"
        );
        Ok(out)
    }
}

fn progress(t: f64, duration: f64) -> f64 {
    if duration > 0.0 {
        (t / duration).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn sample(offset: f64, state: &State, central: BodyId, flags: SampleFlags) -> TrajectorySample {
    TrajectorySample {
        offset,
        position: state.position,
        velocity: state.velocity,
        central,
        flags,
    }
}

fn flags_for(event: &SoiEvent) -> SampleFlags {
    SampleFlags {
        entered_soi: event.kind == TransitionKind::Entry,
        exited_soi: event.kind == TransitionKind::Exit,
    }
}

/// Push a sample, folding it into the previous one if both describe the
/// same instant in the same frame.
fn emit(samples: &mut Vec<TrajectorySample>, sample: TrajectorySample) {
    if let Some(last) = samples.last_mut() {
        if (last.offset - sample.offset).abs() < TIME_EPS && last.central == sample.central {
            last.flags.merge(sample.flags);
            return;
        }
    }
    samples.push(sample);
}

/// A trajectory sample projected onto the surface of its central body.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundPoint {
    pub offset: f64,
    pub central: BodyId,
    pub geodetic: Geodetic,
}

/// Latitude, longitude and altitude under each sample. Samples around
/// bodies without a surface are skipped.
pub fn ground_track(
    system: &SolarSystem,
    start: Epoch,
    samples: &[TrajectorySample],
) -> Result<(Vec<GroundPoint>, Vec<FrameWarning>)> {
    let frames = FrameTransformer::new(system);
    let mut points = Vec::with_capacity(samples.len());
    let mut warnings = Vec::new();
    for s in samples {
        let body = system.body(s.central)?;
        if body.is_barycenter() || body.equatorial_radius <= 0.0 {
            trace!(central = %s.central, "no surface, skipping ground point");
            continue;
        }
        let out = frames.transform(
            &s.position,
            &s.velocity,
            Frame::PlanetInertial,
            Frame::Geodetic,
            s.central,
            start + s.offset,
        )?;
        for w in out.warnings {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }
        points.push(GroundPoint {
            offset: s.offset,
            central: s.central,
            geodetic: Geodetic::from_vector(&out.position),
        });
    }
    Ok((points, warnings))
}

#[cfg(test)]
mod tests {
    use std::f64::consts;

    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    use super::*;
    use crate::{
        bodies::CelestialBody,
        kepler::orbits::propagate_universal,
        maneuver::{LocalDeltaV, ManeuverQueue},
        satellite::SatelliteId,
    };

    const MU: f64 = 398_600.4418;

    fn two_body() -> SolarSystem {
        let earth = CelestialBody::new(BodyId::EARTH, "Earth", MU, 6378.0);
        SolarSystem::new(Epoch::J2000, [earth]).unwrap()
    }

    fn leo(r: f64) -> Satellite {
        Satellite::new(
            SatelliteId(1),
            BodyId::EARTH,
            Vector3::new(r, 0.0, 0.0),
            Vector3::new(0.0, (MU / r).sqrt(), 0.0),
        )
    }

    #[test]
    fn sample_times() {
        assert_eq!(Sampling::Points(3).times(10.0), [0.0, 5.0, 10.0]);
        assert_eq!(Sampling::Step(4.0).times(10.0), [0.0, 4.0, 8.0, 10.0]);
        assert_eq!(Sampling::Step(5.0).times(10.0), [0.0, 5.0, 10.0]);
        assert!(Sampling::Points(0).times(10.0).is_empty());
    }

    #[test]
    fn samples_land_on_requested_times() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        let traj = propagator
            .propagate(&leo(7000.0), Epoch::J2000, 1000.0, Sampling::Step(100.0), &mut ())
            .unwrap();
        assert_eq!(traj.samples.len(), 11);
        for (k, s) in traj.samples.iter().enumerate() {
            assert_eq!(s.offset, 100.0 * k as f64);
        }
        assert_eq!(traj.termination, Termination::Completed);
    }

    #[test]
    fn circular_orbit_closes() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        let period = consts::TAU * (7000.0_f64.powi(3) / MU).sqrt();
        let sat = leo(7000.0);
        let traj = propagator
            .propagate(&sat, Epoch::J2000, period, Sampling::Points(50), &mut ())
            .unwrap();
        for s in &traj.samples {
            assert_relative_eq!(s.position.norm(), 7000.0, max_relative = 1e-3);
        }
        assert_relative_eq!(traj.satellite.position, sat.position, epsilon = 0.1);
    }

    #[test]
    fn maneuver_raises_orbit_and_preview_drops_node() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        let mut sat = leo(7000.0);
        sat.maneuvers = ManeuverQueue::from_iter([ManeuverNode {
            time: Epoch::from_seconds(100.0),
            delta_v: LocalDeltaV::new(0.5, 0.0, 0.0),
            satellite: sat.id,
        }]);
        let traj = propagator
            .propagate(&sat, Epoch::J2000, 4000.0, Sampling::Step(50.0), &mut ())
            .unwrap();
        let max_r = traj
            .samples
            .iter()
            .map(|s| s.position.norm())
            .fold(0.0, f64::max);
        assert!(max_r > 9000.0);
        assert!(traj.satellite.maneuvers.is_empty());

        let committed = Propagator::new(
            &system,
            PropagationSettings {
                maneuver_mode: ManeuverMode::Committed,
                ..PropagationSettings::default()
            },
        );
        let traj = committed
            .propagate(&sat, Epoch::J2000, 4000.0, Sampling::Step(50.0), &mut ())
            .unwrap();
        assert_eq!(traj.satellite.maneuvers.len(), 1);
    }

    #[test]
    fn apsides_of_eccentric_orbit() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        // Periapsis at 7000 km, apoapsis near 9000 km.
        let mut sat = leo(7000.0);
        sat.velocity *= (2.0 * 9000.0 / 16000.0_f64).sqrt();
        let period = consts::TAU * (8000.0_f64.powi(3) / MU).sqrt();
        let traj = propagator
            .propagate(&sat, Epoch::J2000, 1.6 * period, Sampling::Step(30.0), &mut ())
            .unwrap();
        let apsides = traj.apsides();
        let kinds = apsides.iter().map(|&(_, k)| k).collect::<Vec<_>>();
        assert_eq!(kinds, [Apsis::Apoapsis, Apsis::Periapsis, Apsis::Apoapsis]);
        assert_relative_eq!(apsides[0].0, period / 2.0, epsilon = 5.0);
        assert_relative_eq!(apsides[1].0, period, epsilon = 5.0);
    }

    #[test]
    fn missing_central_body_is_a_configuration_error() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        let mut sat = leo(7000.0);
        sat.central = BodyId::MARS;
        let err = propagator
            .propagate(&sat, Epoch::J2000, 10.0, Sampling::Points(2), &mut ())
            .unwrap_err();
        assert!(matches!(err.source, Error::MissingCentralBody { .. }));
        assert!(err.last_sample.is_none());
    }

    struct CancelAfter {
        chunks: usize,
        progress: Vec<f64>,
    }

    impl Observer for CancelAfter {
        fn progress(&mut self, fraction: f64) {
            self.progress.push(fraction);
        }

        fn chunk(&mut self, samples: &[TrajectorySample]) {
            assert!(samples.len() <= 4);
            self.chunks += 1;
        }

        fn cancelled(&self) -> bool {
            self.chunks >= 2
        }
    }

    #[test]
    fn chunks_progress_and_cancellation() {
        let system = two_body();
        let propagator = Propagator::new(
            &system,
            PropagationSettings {
                chunk_size: 4,
                ..PropagationSettings::default()
            },
        );
        let mut observer = CancelAfter {
            chunks: 0,
            progress: Vec::new(),
        };
        let traj = propagator
            .propagate(&leo(7000.0), Epoch::J2000, 10_000.0, Sampling::Step(10.0), &mut observer)
            .unwrap();
        assert_eq!(traj.termination, Termination::Cancelled);
        assert_eq!(traj.samples.len(), 8);
        assert!(observer.progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(*observer.progress.last().unwrap() < 1.0);
    }

    #[test]
    fn ground_track_of_equatorial_orbit() {
        let system = two_body();
        let propagator = Propagator::new(&system, PropagationSettings::default());
        let traj = propagator
            .propagate(&leo(7000.0), Epoch::J2000, 600.0, Sampling::Points(5), &mut ())
            .unwrap();
        let (points, warnings) = ground_track(&system, Epoch::J2000, &traj.samples).unwrap();
        assert_eq!(points.len(), 5);
        // Earth here carries no orientation data.
        assert_eq!(warnings, [FrameWarning::IdentityOrientation(BodyId::EARTH)]);
        for p in &points {
            assert_relative_eq!(p.geodetic.latitude, 0.0, epsilon = 1e-9);
            assert_relative_eq!(p.geodetic.altitude, 622.0, epsilon = 1e-3);
        }
        assert!(points[4].geodetic.longitude > points[0].geodetic.longitude);
    }

    fn point_masses() -> PropagationSettings {
        PropagationSettings {
            include_j2: false,
            include_drag: false,
            ..PropagationSettings::default()
        }
    }

    /// Above the Sun, relative to the solar system barycenter, on a circular
    /// heliocentric orbit.
    fn above_the_sun(sol: &SolarSystem) -> Satellite {
        let (sun, sun_v) = sol.relative_state(BodyId::SUN, BodyId::SSB, 0.0).unwrap();
        let mu = sol.body(BodyId::SUN).unwrap().mu;
        Satellite::new(
            SatelliteId(1),
            BodyId::SSB,
            sun + Vector3::new(0.0, 0.0, 2.0e8),
            sun_v + Vector3::new((mu / 2.0e8).sqrt(), 0.0, 0.0),
        )
    }

    #[test]
    fn barycenter_central_body_follows_its_star() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let settings = point_masses();
        let sat = above_the_sun(&sol);
        let dynamics = Dynamics {
            system: &sol,
            settings: &settings,
            ballistic: Ballistic::default(),
            start: Epoch::J2000,
        };
        let step = dynamics
            .step(
                0.0,
                BodyId::SSB,
                &State::new(sat.position, sat.velocity),
                600.0,
                &mut Vec::new(),
            )
            .unwrap();

        let dt = step.achieved_dt;
        let mu = sol.body(BodyId::SUN).unwrap().mu;
        let (expected, _) = propagate_universal(
            Vector3::new(0.0, 0.0, 2.0e8),
            Vector3::new((mu / 2.0e8).sqrt(), 0.0, 0.0),
            mu,
            dt,
            1e-12,
            60,
        )
        .unwrap();
        let (sun, _) = sol.relative_state(BodyId::SUN, BodyId::SSB, dt).unwrap();
        assert_relative_eq!(step.state.position - sun, expected, epsilon = 1e-2);
    }

    #[test]
    fn barycenter_start_hands_over_to_the_star() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let propagator = Propagator::new(&sol, point_masses());
        let traj = propagator
            .propagate(&above_the_sun(&sol), Epoch::J2000, 86_400.0, Sampling::Points(5), &mut ())
            .unwrap();
        let first = traj.transitions[0];
        assert_eq!(first.kind, TransitionKind::Entry);
        assert_eq!((first.from, first.to), (BodyId::SSB, BodyId::SUN));
        assert_eq!(traj.satellite.central, BodyId::SUN);
        assert_eq!(traj.termination, Termination::Completed);
        for s in traj.samples.iter().filter(|s| s.central == BodyId::SUN) {
            assert_relative_eq!(s.position.norm(), 2.0e8, max_relative = 1e-6);
        }
    }

    /// Inside the Moon's SOI on the side away from the Earth, climbing
    /// straight out.
    fn leaving_the_moon(sol: &SolarSystem) -> Satellite {
        let (moon, _) = sol.relative_state(BodyId::MOON, BodyId::EARTH, 0.0).unwrap();
        let out = moon.normalize();
        let soi = sol.body(BodyId::MOON).unwrap().soi;
        Satellite::new(SatelliteId(7), BodyId::MOON, out * soi * 0.95, out * 1.5)
    }

    #[test]
    fn leaving_the_moon_rebases_to_earth_and_flags_the_sample() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let propagator = Propagator::new(&sol, PropagationSettings::default());
        let traj = propagator
            .propagate(&leaving_the_moon(&sol), Epoch::J2000, 6000.0, Sampling::Step(600.0), &mut ())
            .unwrap();

        assert_eq!(traj.termination, Termination::Completed);
        assert_eq!(traj.transitions.len(), 1);
        let exit = traj.transitions[0];
        assert_eq!(exit.kind, TransitionKind::Exit);
        assert_eq!((exit.from, exit.to), (BodyId::MOON, BodyId::EARTH));
        assert!(exit.offset > 0.0 && exit.offset < 6000.0);

        let flagged = traj
            .samples
            .iter()
            .filter(|s| s.flags.exited_soi)
            .collect::<Vec<_>>();
        assert_eq!(flagged.len(), 1);
        assert_relative_eq!(flagged[0].offset, exit.offset);
        assert_eq!(flagged[0].central, BodyId::EARTH);
        assert!(traj.samples.iter().all(|s| !s.flags.entered_soi));

        let last = traj.samples.last().unwrap();
        assert_eq!(last.offset, 6000.0);
        assert_eq!(last.central, BodyId::EARTH);
        assert_eq!(traj.satellite.central, BodyId::EARTH);
        // Beyond the Moon, still well inside the Earth's SOI.
        assert!(last.position.norm() > 384_400.0);
        assert!(last.position.norm() < sol.body(BodyId::EARTH).unwrap().soi);
    }

    #[test]
    fn stop_at_exit_ends_on_the_flagged_sample() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let propagator = Propagator::new(
            &sol,
            PropagationSettings {
                soi_policy: SoiPolicy::StopAtExit,
                ..PropagationSettings::default()
            },
        );
        let traj = propagator
            .propagate(&leaving_the_moon(&sol), Epoch::J2000, 6000.0, Sampling::Step(600.0), &mut ())
            .unwrap();

        let Termination::SoiExit(event) = traj.termination else {
            panic!("expected an SOI exit, got {:?}", traj.termination);
        };
        assert_eq!((event.from, event.to), (BodyId::MOON, BodyId::EARTH));
        assert_eq!(traj.transitions, [event]);

        let last = traj.samples.last().unwrap();
        assert!(last.flags.exited_soi);
        assert_relative_eq!(last.offset, event.offset);
        assert!(last.offset < 6000.0);
        // The state stays in the frame it left.
        assert_eq!(last.central, BodyId::MOON);
        assert!(last.position.norm() > sol.body(BodyId::MOON).unwrap().soi);
        assert_eq!(traj.satellite.central, BodyId::MOON);
    }
}
