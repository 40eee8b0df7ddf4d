//! Fixed-cadence real-time simulation of every satellite at once.
//!
//! Each tick turns wall-clock time into simulated time through the warp
//! factor and splits it into bounded RK4 sub-steps. Bodies advance with the
//! loop, SOI changes always rebase, and committed maneuver nodes fire once
//! when their time falls inside a sub-step. Nodes stay queued after firing.
//!
//! A sub-step is computed against scratch copies and committed as a whole.
//! A satellite whose step fails is dropped from the simulation and reported
//! in the tick; the others and the bodies carry on.

use std::{
    collections::HashSet,
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    arena::Arena,
    bodies::{BodyId, SolarSystem},
    error::{Error, Result},
    forces::{self, selector, Ballistic},
    integrator::{rk4_step, State},
    maneuver::{self, ManeuverNode},
    propagation::{central_field, PropagationSettings},
    satellite::{Satellite, SatelliteId},
    soi::{self, Outcome, SoiEvent, SoiPolicy},
    time::Epoch,
};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Target ticks per wall-clock second.
    pub hz: f64,
    /// Simulated seconds per wall-clock second.
    pub warp: f64,
    /// Longest RK4 sub-step (`s`)
    pub max_substep: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            hz: 30.0,
            warp: 1.0,
            max_substep: 60.0,
        }
    }
}

impl SimSettings {
    pub fn frame(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz.max(1e-3))
    }
}

/// What happened during one tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tick {
    /// Simulated seconds covered.
    pub simulated: f64,
    pub substeps: usize,
    pub transitions: Vec<(SatelliteId, SoiEvent)>,
    pub maneuvers: Vec<ManeuverNode>,
    /// Satellites dropped because their step failed.
    pub failures: Vec<Failure>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub satellite: SatelliteId,
    /// Start of the sub-step that failed.
    pub epoch: Epoch,
    pub error: String,
}

pub struct Simulation {
    pub system: SolarSystem,
    pub satellites: Arena<SatelliteId, Satellite>,
    pub settings: SimSettings,
    /// Force model options. SOI policy and integrator choice are ignored.
    pub propagation: PropagationSettings,
    warned: HashSet<BodyId>,
}

impl Simulation {
    pub fn new(system: SolarSystem, satellites: impl IntoIterator<Item = Satellite>) -> Self {
        let satellites = satellites.into_iter().map(|s| (s.id, s)).collect();
        Self {
            system,
            satellites,
            settings: SimSettings::default(),
            propagation: PropagationSettings::default(),
            warned: HashSet::new(),
        }
    }

    pub fn with_settings(mut self, settings: SimSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn epoch(&self) -> Epoch {
        self.system.epoch
    }

    /// Advance by `wall_dt` seconds of wall-clock time.
    pub fn tick(&mut self, wall_dt: f64) -> Result<Tick> {
        let simulated = wall_dt.max(0.0) * self.settings.warp;
        let mut out = Tick {
            simulated,
            ..Tick::default()
        };
        if simulated <= 0.0 {
            return Ok(out);
        }
        let max = self.settings.max_substep.max(1e-3);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = (simulated / max).ceil().max(1.0) as usize;
        let h = simulated / n as f64;
        for _ in 0..n {
            self.substep(h, &mut out)?;
            out.substeps += 1;
        }
        trace!(simulated, substeps = n, epoch = %self.system.epoch, "tick");
        Ok(out)
    }

    fn substep(&mut self, h: f64, out: &mut Tick) -> Result<()> {
        let from = self.system.epoch;
        let mut next = self.system.clone();
        next.advance(h)?;

        let ids = self.satellites.iter().map(|(id, _)| id).collect::<Vec<_>>();
        let mut stepped = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(sat) = self.satellites.get(id) else {
                continue;
            };
            let mut sat = sat.clone();
            let result = self.step_satellite(&mut sat, h, &next);
            stepped.push((id, sat, result));
        }

        self.system = next;
        for (id, sat, result) in stepped {
            match result {
                Ok((fired, transition)) => {
                    out.maneuvers.extend(fired);
                    if let Some(mut event) = transition {
                        event.offset = h;
                        out.transitions.push((id, event));
                    }
                    if let Some(slot) = self.satellites.get_mut(id) {
                        *slot = sat;
                    }
                }
                Err(e) => {
                    warn!(satellite = %id, epoch = %from, error = %e, "satellite step failed, dropping it");
                    self.satellites.remove(id);
                    out.failures.push(Failure {
                        satellite: id,
                        epoch: from,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Step one satellite through the sub-step: integrate to each due node,
    /// burn, finish the sub-step, then check its SOI against the advanced
    /// bodies.
    fn step_satellite(
        &mut self,
        sat: &mut Satellite,
        h: f64,
        next: &SolarSystem,
    ) -> Result<(Vec<ManeuverNode>, Option<SoiEvent>)> {
        let from = self.system.epoch;
        let due = sat.maneuvers.due(from, from + h).copied().collect::<Vec<_>>();

        let mut t = 0.0;
        for node in &due {
            let at = node.time - from;
            self.integrate(sat, t, at - t)?;
            sat.velocity = maneuver::apply_delta_v(&sat.velocity, node.delta_v, &sat.position)?;
            debug!(satellite = %sat.id, time = %node.time, "executed maneuver");
            t = at;
        }
        self.integrate(sat, t, h - t)?;

        let outcome = soi::update(
            next,
            SoiPolicy::Rebase,
            &mut sat.central,
            &mut sat.position,
            &mut sat.velocity,
            0.0,
        )?;
        let transition = match outcome {
            Outcome::Rebased(event) | Outcome::Stopped(event) => Some(event),
            Outcome::Stay => None,
        };
        Ok((due, transition))
    }

    /// One RK4 step of `dt` starting `t` seconds into the current sub-step.
    fn integrate(&mut self, sat: &mut Satellite, t: f64, dt: f64) -> Result<()> {
        if dt <= 0.0 {
            return Ok(());
        }
        let body = self.system.body(sat.central)?;
        let selected = selector::select(
            &self.system,
            sat.central,
            &sat.position,
            t,
            &self.propagation.significance,
        )?;
        let perturbers = selector::perturbers_at(&self.system, sat.central, &selected, t)?;
        let (field, warning) = central_field(
            body,
            &self.propagation,
            self.system.epoch,
            self.system.epoch + t,
        );
        if warning.is_some() && self.warned.insert(sat.central) {
            warn!(body = %sat.central, "no orientation data, assuming identity");
        }
        let ballistic = Ballistic {
            mass: sat.mass,
            area: sat.area,
            cd: sat.drag_coefficient,
        };
        let terms = self.propagation.terms();
        let state = rk4_step(&State::new(sat.position, sat.velocity), dt, |s| {
            forces::acceleration(
                &s.position,
                &s.velocity,
                &field,
                &perturbers,
                &ballistic,
                terms,
            )
        });
        if !state.is_finite() {
            return Err(Error::NonFinite {
                t: t + dt,
                rejections: 0,
            });
        }
        sat.position = state.position;
        sat.velocity = state.velocity;
        Ok(())
    }

    /// Run at the target cadence for `wall` of wall-clock time, calling
    /// `on_tick` after every tick.
    pub fn run_for(&mut self, wall: Duration, mut on_tick: impl FnMut(&Self, &Tick)) -> Result<()> {
        let frame = self.settings.frame();
        let started = Instant::now();
        let mut last = started;
        while started.elapsed() < wall {
            let now = Instant::now();
            let tick = self.tick((now - last).as_secs_f64())?;
            last = now;
            on_tick(self, &tick);
            let spent = now.elapsed();
            if spent < frame {
                thread::sleep(frame - spent);
            }
        }
        Ok(())
    }
}
