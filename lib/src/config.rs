//! Scenario files (RON) and settings files (TOML).

use std::{fs, path::Path};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    bodies::{BodyId, BodyMotion, CelestialBody, SolarSystem},
    error::{Error, Result},
    kepler::orbits::Orbit,
    maneuver::{LocalDeltaV, ManeuverNode, ManeuverQueue},
    propagation::PropagationSettings,
    satellite::{Satellite, SatelliteId},
    sim::SimSettings,
    time::Epoch,
};

/// Everything tunable that is not part of a scenario.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub propagation: PropagationSettings,
    pub sim: SimSettings,
    /// Worker threads for the backend. Zero picks one per core.
    pub workers: usize,
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading settings");
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
        }
    }
}

/// How a satellite's initial state is given.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InitialState {
    /// Relative to the central body (`km`, `km/s`).
    Cartesian {
        position: Vector3<f64>,
        velocity: Vector3<f64>,
    },
    /// Osculating elements. Distances in km, angles in degrees.
    Keplerian {
        a: f64,
        e: f64,
        i: f64,
        lan: f64,
        argpe: f64,
        ta: f64,
    },
}

/// A burn scheduled relative to the scenario epoch.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManeuverConfig {
    /// Seconds after the scenario epoch.
    pub offset: f64,
    #[serde(default)]
    pub prograde: f64,
    #[serde(default)]
    pub normal: f64,
    #[serde(default)]
    pub radial: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub name: String,
    pub central: BodyId,
    pub state: InitialState,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default = "default_area")]
    pub area: f64,
    #[serde(default = "default_cd", alias = "drag_coefficient")]
    pub cd: f64,
    #[serde(default)]
    pub maneuvers: Vec<ManeuverConfig>,
}

fn default_mass() -> f64 {
    1000.0
}

fn default_area() -> f64 {
    1.0
}

fn default_cd() -> f64 {
    2.2
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// ISO 8601, UTC unless an offset is given.
    pub epoch: String,
    /// Bodies to use instead of the built-in solar system.
    #[serde(default)]
    pub bodies: Option<Vec<CelestialBody>>,
    #[serde(default)]
    pub motion: BodyMotion,
    #[serde(default)]
    pub satellites: Vec<SatelliteConfig>,
}

impl Scenario {
    pub fn from_ron(s: &str) -> Result<Self> {
        Ok(ron::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading scenario");
        Self::from_ron(&fs::read_to_string(path)?)
    }

    pub fn epoch(&self) -> Result<Epoch> {
        Ok(Epoch::parse_iso(&self.epoch)?)
    }

    /// Build the body registry and the satellites. Satellites are numbered
    /// in file order starting at 1.
    pub fn build(&self) -> Result<(SolarSystem, Vec<Satellite>)> {
        let epoch = self.epoch()?;
        let system = match &self.bodies {
            Some(bodies) => SolarSystem::new(epoch, bodies.iter().cloned())?,
            None => SolarSystem::sol(epoch)?,
        }
        .with_motion(self.motion);

        let satellites = self
            .satellites
            .iter()
            .zip(1..)
            .map(|(cfg, n)| cfg.build(SatelliteId(n), &system))
            .collect::<Result<Vec<_>>>()?;
        info!(
            epoch = %epoch,
            bodies = system.len(),
            satellites = satellites.len(),
            "scenario built"
        );
        Ok((system, satellites))
    }
}

impl SatelliteConfig {
    pub fn build(&self, id: SatelliteId, system: &SolarSystem) -> Result<Satellite> {
        let Some(central) = system.get(self.central) else {
            return Err(Error::MissingCentralBody {
                satellite: id,
                body: self.central,
            });
        };
        let (position, velocity) = match self.state {
            InitialState::Cartesian { position, velocity } => (position, velocity),
            InitialState::Keplerian {
                a,
                e,
                i,
                lan,
                argpe,
                ta,
            } => {
                if !(0.0..1.0).contains(&e) || a <= 0.0 {
                    return Err(Error::UnboundOrbit(e));
                }
                let orbit = Orbit {
                    p: a * (1.0 - e * e),
                    e,
                    i: i.to_radians(),
                    lan: lan.to_radians(),
                    argpe: argpe.to_radians(),
                    ta: ta.to_radians(),
                };
                orbit.state(central.mu)
            }
        };
        let maneuvers = self
            .maneuvers
            .iter()
            .map(|m| ManeuverNode {
                time: system.epoch + m.offset,
                delta_v: LocalDeltaV::new(m.prograde, m.normal, m.radial),
                satellite: id,
            })
            .collect::<ManeuverQueue>();

        Ok(Satellite {
            name: self.name.clone(),
            mass: self.mass,
            area: self.area,
            drag_coefficient: self.cd,
            maneuvers,
            ..Satellite::new(id, self.central, position, velocity)
        })
    }
}
