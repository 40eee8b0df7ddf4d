//! Definitions of celestial bodies and the body registry.

use std::{collections::HashMap, f64::consts, fmt, sync::Arc};

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    kepler::orbits::{propagate_universal, Orbit},
    time::{Epoch, SECONDS_PER_DAY},
};

/// Gravitational constant (`km^3 kg^-1 s^-2`).
pub const G: f64 = 6.674_30e-20;

/// Obliquity of the ecliptic at J2000 (radians).
pub const OBLIQUITY_J2000: f64 = 23.439_291_1 * consts::PI / 180.0;

/// NAIF-style body identifier.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct BodyId(pub i32);

impl BodyId {
    pub const SSB: BodyId = BodyId(0);
    pub const EARTH_BARYCENTER: BodyId = BodyId(3);
    pub const MARS_BARYCENTER: BodyId = BodyId(4);
    pub const JUPITER_BARYCENTER: BodyId = BodyId(5);
    pub const SUN: BodyId = BodyId(10);
    pub const MERCURY: BodyId = BodyId(199);
    pub const VENUS: BodyId = BodyId(299);
    pub const MOON: BodyId = BodyId(301);
    pub const EARTH: BodyId = BodyId(399);
    pub const PHOBOS: BodyId = BodyId(401);
    pub const MARS: BodyId = BodyId(499);
    pub const IO: BodyId = BodyId(501);
    pub const JUPITER: BodyId = BodyId(599);
    pub const SATURN: BodyId = BodyId(699);
    pub const URANUS: BodyId = BodyId(799);
    pub const NEPTUNE: BodyId = BodyId(899);
    pub const PLUTO: BodyId = BodyId(999);
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exponential atmosphere, `rho0 * exp(-(h - h0) / H)` between
/// `min_altitude` and `max_altitude`, zero outside.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atmosphere {
    /// Reference density (`kg/m^3`)
    pub rho0: f64,
    /// Reference altitude (`km`)
    #[serde(default)]
    pub h0: f64,
    /// Scale height (`km`)
    pub scale_height: f64,
    #[serde(default)]
    pub min_altitude: f64,
    pub max_altitude: f64,
}

impl Atmosphere {
    pub fn earth() -> Self {
        Self {
            rho0: 1.225,
            h0: 0.0,
            scale_height: 8.5,
            min_altitude: 0.0,
            max_altitude: 500.0,
        }
    }

    /// Density in `kg/m^3` at the given altitude in km.
    pub fn density(&self, altitude: f64) -> f64 {
        if altitude < self.min_altitude || altitude > self.max_altitude {
            return 0.0;
        }
        self.rho0 * libm::exp(-(altitude - self.h0) / self.scale_height)
    }
}

/// IAU rotation model: pole right ascension and declination as
/// `[deg, deg/century, deg/century^2]`, prime meridian as
/// `[deg, deg/day, deg/day^2]`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotationModel {
    pub pole_ra: [f64; 3],
    pub pole_dec: [f64; 3],
    pub pm: [f64; 3],
}

impl RotationModel {
    /// Orientation of the body-fixed frame in the ecliptic J2000 frame.
    pub fn orientation(&self, epoch: Epoch) -> UnitQuaternion<f64> {
        let t = epoch.centuries();
        let d = epoch.days();
        let ra = (self.pole_ra[0] + self.pole_ra[1] * t + self.pole_ra[2] * t * t).to_radians();
        let dec =
            (self.pole_dec[0] + self.pole_dec[1] * t + self.pole_dec[2] * t * t).to_radians();
        let w = (self.pm[0] + self.pm[1] * d + self.pm[2] * d * d).to_radians();

        let equatorial = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), consts::FRAC_PI_2 + ra)
            * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), consts::FRAC_PI_2 - dec)
            * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), w);
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -OBLIQUITY_J2000) * equatorial
    }

    /// Sidereal rotation rate (`rad/s`).
    pub fn rate(&self) -> f64 {
        self.pm[1].to_radians() / SECONDS_PER_DAY
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    /// Authoritative orientation at the registry epoch, `[w, x, y, z]`.
    #[serde(default)]
    pub orientation: Option<[f64; 4]>,
    /// Rotation rate about the body pole (`rad/s`). Zero falls back to the
    /// rotation model's rate, if any.
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub model: Option<RotationModel>,
}

impl Rotation {
    pub fn live_orientation(&self) -> Option<UnitQuaternion<f64>> {
        let [w, x, y, z] = self.orientation?;
        let q = nalgebra::Quaternion::new(w, x, y, z);
        (q.norm() > 0.0).then(|| UnitQuaternion::from_quaternion(q))
    }

    pub fn rate(&self) -> f64 {
        if self.rate != 0.0 {
            self.rate
        } else {
            self.model.map_or(0.0, |m| m.rate())
        }
    }
}

/// Canonical Keplerian orbit about the parent body, used when a body's
/// state is not supplied. Distances in km, angles in degrees.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOrbit {
    pub a: f64,
    pub e: f64,
    pub i: f64,
    #[serde(rename = "Omega")]
    pub lan: f64,
    #[serde(rename = "omega")]
    pub argpe: f64,
    #[serde(rename = "M0")]
    pub m0: f64,
}

impl CanonicalOrbit {
    pub fn to_orbit(&self) -> Option<Orbit> {
        Orbit::from_mean_elements(
            self.a,
            self.e,
            self.i.to_radians(),
            self.lan.to_radians(),
            self.argpe.to_radians(),
            self.m0.to_radians(),
        )
    }
}

fn zero() -> Vector3<f64> {
    Vector3::zeros()
}

/// A celestial body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CelestialBody {
    pub id: BodyId,
    pub name: String,
    /// The parent body in the hierarchy. Only the root has none.
    #[serde(default)]
    pub parent: Option<BodyId>,
    /// Mass (`kg`)
    #[serde(default)]
    pub mass: f64,
    /// Standard gravitational parameter (`km^3/s^2`)
    #[serde(default, alias = "GM")]
    pub mu: f64,
    /// Equatorial radius (`km`)
    #[serde(default, alias = "r_eq")]
    pub equatorial_radius: f64,
    /// Polar radius (`km`). Zero means spherical.
    #[serde(default)]
    pub polar_radius: f64,
    #[serde(default)]
    pub j2: Option<f64>,
    #[serde(default)]
    pub atmosphere: Option<Atmosphere>,
    /// Radius of the sphere of influence (`km`). Derived by the registry.
    #[serde(skip, default)]
    pub soi: f64,
    #[serde(default)]
    pub rotation: Rotation,
    /// Barycentric position at the registry epoch (`km`)
    #[serde(default = "zero")]
    pub position: Vector3<f64>,
    /// Barycentric velocity at the registry epoch (`km/s`)
    #[serde(default = "zero")]
    pub velocity: Vector3<f64>,
    #[serde(default)]
    pub is_star: bool,
    #[serde(default, alias = "canonical_orbit")]
    pub orbit: Option<CanonicalOrbit>,
}

impl CelestialBody {
    pub fn new(id: BodyId, name: impl Into<String>, mu: f64, radius: f64) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            mass: 0.0,
            mu,
            equatorial_radius: radius,
            polar_radius: radius,
            j2: None,
            atmosphere: None,
            soi: f64::INFINITY,
            rotation: Rotation::default(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            is_star: false,
            orbit: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: BodyId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn with_state(mut self, position: Vector3<f64>, velocity: Vector3<f64>) -> Self {
        self.position = position;
        self.velocity = velocity;
        self
    }

    /// A body with no mass is an aggregation point, never an attractor.
    pub fn is_attractor(&self) -> bool {
        self.mu > 0.0 && self.mu.is_finite()
    }

    pub fn is_barycenter(&self) -> bool {
        !self.is_attractor()
    }

    pub fn polar_radius(&self) -> f64 {
        if self.polar_radius > 0.0 {
            self.polar_radius
        } else {
            self.equatorial_radius
        }
    }

    fn normalize(&mut self) {
        if self.mu <= 0.0 && self.mass > 0.0 {
            self.mu = G * self.mass;
        } else if self.mass <= 0.0 && self.mu > 0.0 {
            self.mass = self.mu / G;
        }
        if self.polar_radius <= 0.0 {
            self.polar_radius = self.equatorial_radius;
        }
    }
}

/// Refreshed barycentric state for one body.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyStateUpdate {
    pub id: BodyId,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

/// How bodies move while a satellite is being propagated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyMotion {
    /// Bodies stay at their snapshot state. Frame rebasing is only
    /// approximately correct over long spans.
    Frozen,
    /// Bodies follow two-body orbits about their parents, the whole tree
    /// moving in lockstep.
    #[default]
    Keplerian,
}

type StateMap = HashMap<BodyId, (Vector3<f64>, Vector3<f64>)>;

/// Body states at the last offset asked for. Cleared whenever the snapshot
/// changes.
#[derive(Default)]
struct StateCache(Mutex<Option<(f64, Arc<StateMap>)>>);

impl StateCache {
    fn clear(&self) {
        *self.0.lock() = None;
    }
}

impl Clone for StateCache {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for StateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("offset", &self.0.lock().as_ref().map(|(t, _)| *t))
            .finish()
    }
}

/// Body registry: owns the bodies and the parent/child tree at one epoch.
///
/// Massless bodies with children are barycenters. Each barycenter has a
/// primary, the child carrying the most mass, which moves so as to keep the
/// barycenter at the centre of mass of its children. The remaining children
/// orbit the primary. Spheres of influence nest by attractor: a body's SOI
/// parent is the dominant attractor one level up, skipping barycenters.
#[derive(Clone, Debug, Default)]
pub struct SolarSystem {
    pub epoch: Epoch,
    pub motion: BodyMotion,
    bodies: HashMap<BodyId, Arc<CelestialBody>>,
    children: HashMap<BodyId, Vec<BodyId>>,
    primaries: HashMap<BodyId, BodyId>,
    soi_children: HashMap<BodyId, Vec<BodyId>>,
    root: BodyId,
    cache: StateCache,
}

impl SolarSystem {
    /// Build a registry, validating the hierarchy, deriving GM/mass,
    /// filling in missing states from canonical orbits and deriving SOI
    /// radii.
    pub fn new(epoch: Epoch, bodies: impl IntoIterator<Item = CelestialBody>) -> Result<Self> {
        let mut map = HashMap::new();
        for mut body in bodies {
            body.normalize();
            let id = body.id;
            if map.insert(id, Arc::new(body)).is_some() {
                return Err(Error::InvalidHierarchy(format!("duplicate body id {id}")));
            }
        }

        let mut roots = map.values().filter(|b| b.parent.is_none()).map(|b| b.id);
        let root = roots
            .next()
            .ok_or_else(|| Error::InvalidHierarchy("no root body".into()))?;
        if let Some(other) = roots.next() {
            return Err(Error::InvalidHierarchy(format!(
                "more than one root body ({root} and {other})"
            )));
        }

        let mut children: HashMap<BodyId, Vec<BodyId>> = HashMap::new();
        for body in map.values() {
            if let Some(parent) = body.parent {
                if !map.contains_key(&parent) {
                    return Err(Error::InvalidHierarchy(format!(
                        "body {} has unknown parent {parent}",
                        body.id
                    )));
                }
                children.entry(parent).or_default().push(body.id);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        let mut system = Self {
            epoch,
            motion: BodyMotion::default(),
            bodies: map,
            children,
            primaries: HashMap::new(),
            soi_children: HashMap::new(),
            root,
            cache: StateCache::default(),
        };
        let reachable = system.descendants(root).len() + 1;
        if reachable != system.bodies.len() {
            return Err(Error::InvalidHierarchy(
                "hierarchy contains a cycle or detached bodies".into(),
            ));
        }
        system.derive_primaries();
        system.resolve_states();
        system.derive_soi();
        Ok(system)
    }

    #[must_use]
    pub fn with_motion(mut self, motion: BodyMotion) -> Self {
        self.motion = motion;
        self.cache.clear();
        self
    }

    pub fn get(&self, id: BodyId) -> Option<&CelestialBody> {
        self.bodies.get(&id).map(AsRef::as_ref)
    }

    pub fn body(&self, id: BodyId) -> Result<&CelestialBody> {
        self.get(id).ok_or(Error::MissingBody(id))
    }

    pub fn root(&self) -> BodyId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CelestialBody> {
        self.bodies.values().map(AsRef::as_ref)
    }

    pub fn children(&self, id: BodyId) -> &[BodyId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All bodies below `id`, depth first.
    pub fn descendants(&self, id: BodyId) -> Vec<BodyId> {
        let mut out = Vec::new();
        let mut stack = self.children(id).to_vec();
        while let Some(next) = stack.pop() {
            if out.contains(&next) {
                break;
            }
            out.push(next);
            stack.extend_from_slice(self.children(next));
        }
        out
    }

    /// Whether `ancestor` lies on the path from `id` to the root.
    pub fn is_ancestor(&self, ancestor: BodyId, id: BodyId) -> bool {
        let mut cur = self.get(id).and_then(|b| b.parent);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.get(p).and_then(|b| b.parent);
        }
        false
    }

    /// Gravitational parameter of a body, or of its whole subtree if the
    /// body itself is a massless barycenter.
    pub fn system_mu(&self, id: BodyId) -> f64 {
        match self.get(id) {
            Some(b) if b.is_attractor() => b.mu,
            Some(_) => self.children(id).iter().map(|&c| self.system_mu(c)).sum(),
            None => 0.0,
        }
    }

    /// The most massive child of a barycenter.
    pub fn primary(&self, barycenter: BodyId) -> Option<BodyId> {
        self.primaries.get(&barycenter).copied()
    }

    /// The attractor standing in for `id`: the body itself, or for a
    /// barycenter the primary of its primary and so on.
    pub fn dominant(&self, id: BodyId) -> BodyId {
        let mut cur = id;
        while let Some(&p) = self.primaries.get(&cur) {
            cur = p;
        }
        cur
    }

    /// The attractor whose sphere of influence `id` sits in. `None` for
    /// the root and for the body dominating it.
    pub fn soi_parent(&self, id: BodyId) -> Option<BodyId> {
        let node = self.acting_node(id);
        let parent = self.get(node)?.parent?;
        Some(self.dominant(parent))
    }

    /// Attractors whose SOI parent is `id`, in id order.
    pub fn soi_children(&self, id: BodyId) -> &[BodyId] {
        self.soi_children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `ancestor` lies on the chain of SOI parents above `id`.
    pub fn is_soi_ancestor(&self, ancestor: BodyId, id: BodyId) -> bool {
        let mut cur = self.soi_parent(id);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.soi_parent(p);
        }
        false
    }

    /// The node that orbits on behalf of `id`: `id` itself, or the
    /// barycenter it is the primary of, repeated upward.
    fn acting_node(&self, id: BodyId) -> BodyId {
        let mut cur = id;
        while let Some(parent) = self.get(cur).and_then(|b| b.parent) {
            if self.primaries.get(&parent) != Some(&cur) {
                break;
            }
            cur = parent;
        }
        cur
    }

    /// Replace barycentric states of the given bodies.
    pub fn update_states(&mut self, updates: &[BodyStateUpdate]) -> Result<()> {
        self.cache.clear();
        for update in updates {
            let body = self
                .bodies
                .get_mut(&update.id)
                .ok_or(Error::MissingBody(update.id))?;
            let body = Arc::make_mut(body);
            body.position = update.position;
            body.velocity = update.velocity;
        }
        Ok(())
    }

    /// Barycentric state of a body `offset` seconds after the registry
    /// epoch, according to the registry's body motion.
    pub fn barycentric_state(&self, id: BodyId, offset: f64) -> Result<(Vector3<f64>, Vector3<f64>)> {
        let body = self.body(id)?;
        if self.motion == BodyMotion::Frozen || offset == 0.0 {
            return Ok((body.position, body.velocity));
        }
        self.states_at(offset)?
            .get(&id)
            .copied()
            .ok_or(Error::MissingBody(id))
    }

    /// State of `id` relative to `origin`, `offset` seconds after the
    /// registry epoch.
    pub fn relative_state(
        &self,
        id: BodyId,
        origin: BodyId,
        offset: f64,
    ) -> Result<(Vector3<f64>, Vector3<f64>)> {
        if id == origin {
            return Ok((Vector3::zeros(), Vector3::zeros()));
        }
        let (r, v) = self.barycentric_state(id, offset)?;
        let (ro, vo) = self.barycentric_state(origin, offset)?;
        Ok((r - ro, v - vo))
    }

    /// Move the whole registry `dt` seconds forward.
    pub fn advance(&mut self, dt: f64) -> Result<()> {
        if dt == 0.0 {
            return Ok(());
        }
        if self.motion == BodyMotion::Keplerian {
            let states = self.states_at(dt)?;
            let updates = states
                .iter()
                .map(|(&id, &(position, velocity))| BodyStateUpdate {
                    id,
                    position,
                    velocity,
                })
                .collect::<Vec<_>>();
            self.update_states(&updates)?;
        }
        self.epoch += dt;
        self.cache.clear();
        Ok(())
    }

    fn states_at(&self, offset: f64) -> Result<Arc<StateMap>> {
        if let Some((t, states)) = self.cache.0.lock().as_ref() {
            if *t == offset {
                return Ok(Arc::clone(states));
            }
        }
        let states = Arc::new(self.propagate_tree(offset)?);
        *self.cache.0.lock() = Some((offset, Arc::clone(&states)));
        Ok(states)
    }

    /// Two-body motion of the whole tree, top down. Children of an
    /// attractor orbit it; children of a barycenter orbit its primary,
    /// which takes up the opposite motion.
    fn propagate_tree(&self, offset: f64) -> Result<StateMap> {
        let snapshot = |id: BodyId| {
            let b = &self.bodies[&id];
            (b.position, b.velocity)
        };
        let mut out = StateMap::with_capacity(self.bodies.len());
        out.insert(self.root, snapshot(self.root));
        let mut queue = vec![self.root];
        while let Some(id) = queue.pop() {
            let node = &self.bodies[&id];
            let (np, nv) = out[&id];
            if node.is_attractor() {
                for &child in self.children(id) {
                    let (cp, cv) = snapshot(child);
                    let mu = node.mu + self.system_mu(child);
                    let (r, v) = two_body(child, cp - node.position, cv - node.velocity, mu, offset)?;
                    out.insert(child, (np + r, nv + v));
                }
            } else if let Some(primary) = self.primary(id) {
                let (pp, pv) = snapshot(primary);
                let primary_mu = self.system_mu(primary);
                let total = self.system_mu(id);
                let mut shift = (Vector3::zeros(), Vector3::zeros());
                let mut moved = Vec::new();
                for &s in self.children(id) {
                    if s == primary {
                        continue;
                    }
                    let (sp, sv) = snapshot(s);
                    let mu_s = self.system_mu(s);
                    let (r0, v0) = (sp - pp, sv - pv);
                    let (r, v) = two_body(s, r0, v0, primary_mu + mu_s, offset)?;
                    shift.0 += mu_s * (r - r0);
                    shift.1 += mu_s * (v - v0);
                    moved.push((s, r, v));
                }
                let (dr, dv) = if total > 0.0 {
                    (shift.0 / total, shift.1 / total)
                } else {
                    (Vector3::zeros(), Vector3::zeros())
                };
                let p = (np + pp - node.position - dr, nv + pv - node.velocity - dv);
                out.insert(primary, p);
                for (s, r, v) in moved {
                    out.insert(s, (p.0 + r, p.1 + v));
                }
            }
            queue.extend_from_slice(self.children(id));
        }
        Ok(out)
    }

    fn derive_primaries(&mut self) {
        let primaries: HashMap<_, _> = self
            .bodies
            .values()
            .filter(|b| b.is_barycenter())
            .filter_map(|b| {
                let kids = self.children(b.id);
                let mut best = *kids.first()?;
                for &c in &kids[1..] {
                    if self.system_mu(c) > self.system_mu(best) {
                        best = c;
                    }
                }
                Some((b.id, best))
            })
            .collect();
        self.primaries = primaries;
    }

    /// Place bodies that were given a canonical orbit but no state, top
    /// down. Under an attractor a body is placed on its orbit about it.
    /// Under a barycenter the secondaries are placed on their orbits about
    /// the primary, and a primary with no state of its own is put where it
    /// keeps the barycenter at the centre of mass.
    fn resolve_states(&mut self) {
        let mut order = vec![self.root];
        order.extend(self.descendants(self.root));
        order.sort_by_key(|&id| self.depth(id));

        for id in order {
            let node = Arc::clone(&self.bodies[&id]);
            if node.is_attractor() {
                for child in self.children(id).to_vec() {
                    let mu = node.mu + self.system_mu(child);
                    if let Some((r, v)) = self.orbit_state(child, mu) {
                        self.set_state(child, node.position + r, node.velocity + v);
                    }
                }
                continue;
            }
            let Some(primary) = self.primary(id) else {
                continue;
            };
            let primary_mu = self.system_mu(primary);
            let placed = self
                .children(id)
                .iter()
                .filter(|&&s| s != primary)
                .filter_map(|&s| {
                    let mu_s = self.system_mu(s);
                    self.orbit_state(s, primary_mu + mu_s)
                        .map(|rv| (s, mu_s, rv))
                })
                .collect::<Vec<_>>();

            let (pp, pv) = if has_state(&self.bodies[&primary]) {
                let p = &self.bodies[&primary];
                (p.position, p.velocity)
            } else {
                let total = self.system_mu(id);
                let mut moment = (Vector3::zeros(), Vector3::zeros());
                for (_, mu_s, (r, v)) in &placed {
                    moment.0 += *mu_s * *r;
                    moment.1 += *mu_s * *v;
                }
                let (dr, dv) = if total > 0.0 {
                    (moment.0 / total, moment.1 / total)
                } else {
                    (Vector3::zeros(), Vector3::zeros())
                };
                debug!(body = %primary, barycenter = %id, offset = dr.norm(), "placing primary");
                let p = (node.position - dr, node.velocity - dv);
                self.set_state(primary, p.0, p.1);
                p
            };
            for (s, _, (r, v)) in placed {
                self.set_state(s, pp + r, pv + v);
            }
        }
    }

    /// State relative to the parent from the canonical orbit, for a body
    /// that has an orbit and no state yet.
    fn orbit_state(&self, id: BodyId, mu: f64) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let body = &self.bodies[&id];
        if has_state(body) {
            return None;
        }
        let Some(orbit) = body.orbit?.to_orbit() else {
            warn!(body = %id, "canonical orbit is not bound, leaving body at its parent");
            return None;
        };
        Some(orbit.state(mu))
    }

    fn set_state(&mut self, id: BodyId, position: Vector3<f64>, velocity: Vector3<f64>) {
        if let Some(body) = self.bodies.get_mut(&id) {
            let body = Arc::make_mut(body);
            body.position = position;
            body.velocity = velocity;
        }
    }

    fn depth(&self, id: BodyId) -> usize {
        let mut depth = 0;
        let mut cur = self.get(id).and_then(|b| b.parent);
        while let Some(p) = cur {
            depth += 1;
            cur = self.get(p).and_then(|b| b.parent);
        }
        depth
    }

    /// SOI radii and the attractor tree they nest in.
    fn derive_soi(&mut self) {
        let mut soi_children: HashMap<BodyId, Vec<BodyId>> = HashMap::new();
        for body in self.bodies.values().filter(|b| b.is_attractor()) {
            if let Some(parent) = self.soi_parent(body.id) {
                soi_children.entry(parent).or_default().push(body.id);
            }
        }
        for list in soi_children.values_mut() {
            list.sort_unstable();
        }
        self.soi_children = soi_children;

        let radii = self
            .bodies
            .keys()
            .map(|&id| (id, self.laplace_soi(id)))
            .collect::<Vec<_>>();
        for (id, soi) in radii {
            if let Some(body) = self.bodies.get_mut(&id) {
                Arc::make_mut(body).soi = soi;
            }
        }
    }

    /// Laplace SOI, `a * (m / M)^(2/5)`. `a` and `m` belong to the node
    /// orbiting on the body's behalf (its barycenter, if it is a primary),
    /// `M` to the SOI parent. Unbounded for bodies with no SOI parent.
    fn laplace_soi(&self, id: BodyId) -> f64 {
        let Some(big) = self.soi_parent(id).and_then(|p| self.get(p)) else {
            return f64::INFINITY;
        };
        if !big.is_attractor() {
            return f64::INFINITY;
        }
        let node = &self.bodies[&self.acting_node(id)];
        let a = node
            .orbit
            .or(self.bodies[&id].orbit)
            .map(|o| o.a)
            .filter(|a| *a > 0.0)
            .unwrap_or_else(|| (node.position - big.position).norm());
        let ratio = self.system_mu(node.id) / big.mu;
        (a * libm::pow(ratio, 0.4)).max(0.0)
    }

    /// The Sun, the nine planetary systems under their barycenters and the
    /// major moons, all under a massless solar system barycenter. Physical
    /// constants from JPL/IAU tables.
    #[allow(clippy::too_many_lines)]
    pub fn sol(epoch: Epoch) -> Result<Self> {
        let orbit = |[a, e, i, lan, argpe, m0]: [f64; 6]| {
            Some(CanonicalOrbit {
                a,
                e,
                i,
                lan,
                argpe,
                m0,
            })
        };
        let barycenter = |id: i32, name: &str, elements: [f64; 6]| CelestialBody {
            orbit: orbit(elements),
            ..CelestialBody::new(BodyId(id), name, 0.0, 0.0).with_parent(BodyId::SSB)
        };
        let planet = |id: i32, name: &str, mu: f64, radius: f64, j2: Option<f64>| CelestialBody {
            j2,
            ..CelestialBody::new(BodyId(id), name, mu, radius).with_parent(BodyId(id / 100))
        };
        let moon = |id: i32, name: &str, mu: f64, radius: f64, elements: [f64; 6]| CelestialBody {
            orbit: orbit(elements),
            ..CelestialBody::new(BodyId(id), name, mu, radius).with_parent(BodyId(id / 100))
        };

        let ssb = CelestialBody::new(BodyId::SSB, "Solar System Barycenter", 0.0, 0.0);
        let sun = CelestialBody {
            is_star: true,
            rotation: Rotation {
                orientation: None,
                rate: 0.0,
                model: Some(RotationModel {
                    pole_ra: [286.13, 0.0, 0.0],
                    pole_dec: [63.87, 0.0, 0.0],
                    pm: [84.176, 14.1844, 0.0],
                }),
            },
            ..CelestialBody::new(BodyId::SUN, "Sun", 132_712_440_041.939_4, 695_700.0)
                .with_parent(BodyId::SSB)
        };
        let earth = CelestialBody {
            polar_radius: 6356.7519,
            atmosphere: Some(Atmosphere::earth()),
            rotation: Rotation {
                orientation: None,
                rate: 7.292_115_146_706_979e-5,
                model: Some(RotationModel {
                    pole_ra: [0.0, -0.641, 0.0],
                    pole_dec: [90.0, -0.557, 0.0],
                    pm: [190.147, 360.985_623_5, 0.0],
                }),
            },
            ..planet(399, "Earth", 398_600.435_507, 6378.1366, Some(1.082_626_68e-3))
        };
        let luna = CelestialBody {
            j2: Some(2.032e-4),
            rotation: Rotation {
                orientation: Some([
                    0.318_667_562_294_430_6,
                    0.924_089_213_246_231_9,
                    0.195_378_228_080_609_34,
                    -0.079_608_157_216_247_3,
                ]),
                rate: 0.0,
                model: Some(RotationModel {
                    pole_ra: [269.9949, 0.0031, 0.0],
                    pole_dec: [66.5392, 0.0130, 0.0],
                    pm: [38.3213, 13.176_358_15, -1.4e-12],
                }),
            },
            ..moon(301, "Moon", 4902.800_066, 1737.4, [384_400.0, 0.0549, 5.145, 125.08, 318.15, 115.3654])
        };
        let mars = CelestialBody {
            polar_radius: 3376.2,
            ..planet(499, "Mars", 42_828.375_214, 3396.19, Some(1.960_45e-3))
        };

        Self::new(
            epoch,
            [
                ssb,
                sun,
                barycenter(1, "Mercury Barycenter", [57_909_050.0, 0.2056, 7.005, 48.331, 29.124, 174.796]),
                barycenter(2, "Venus Barycenter", [108_208_000.0, 0.0067, 3.3947, 76.680, 54.884, 50.416]),
                barycenter(3, "Earth-Moon Barycenter", [149_598_023.0, 0.0167, 0.0, -11.260_64, 114.207_83, 358.617]),
                barycenter(4, "Mars Barycenter", [227_939_200.0, 0.0935, 1.850, 49.558, 286.502, 19.373]),
                barycenter(5, "Jupiter Barycenter", [778_570_000.0, 0.0489, 1.303, 100.464, 273.867, 20.020]),
                barycenter(6, "Saturn Barycenter", [1_433_530_000.0, 0.0565, 2.485, 113.665, 339.392, 317.020]),
                barycenter(7, "Uranus Barycenter", [2_875_040_000.0, 0.0463, 0.773, 74.006, 96.998, 142.2386]),
                barycenter(8, "Neptune Barycenter", [4_504_450_000.0, 0.0097, 1.770, 131.784, 273.187, 256.228]),
                barycenter(9, "Pluto Barycenter", [5_906_440_628.0, 0.2488, 17.16, 110.299, 113.834, 14.53]),
                planet(199, "Mercury", 22_031.868_55, 2439.7, Some(6.0e-5)),
                planet(299, "Venus", 324_858.592, 6051.8, Some(4.458e-6)),
                earth,
                mars,
                planet(599, "Jupiter", 126_686_531.9, 71_492.0, Some(0.014_696)),
                planet(699, "Saturn", 37_931_207.8, 60_268.0, Some(0.016_298)),
                planet(799, "Uranus", 5_793_951.3, 25_559.0, None),
                planet(899, "Neptune", 6_835_103.1, 24_764.0, None),
                planet(999, "Pluto", 869.613_817, 1188.3, None),
                luna,
                moon(401, "Phobos", 7.112e-4, 11.2667, [9376.0, 0.0151, 1.075, 49.2, 150.057, 177.4]),
                moon(402, "Deimos", 9.85e-5, 6.2, [23_463.2, 0.000_33, 1.788, 316.65, 260.729, 53.2]),
                moon(501, "Io", 5959.916, 1821.6, [421_700.0, 0.0041, 0.036, 43.977, 84.129, 171.016]),
                moon(502, "Europa", 3202.739, 1560.8, [671_034.0, 0.009, 0.465, 219.106, 88.97, 29.298]),
                moon(503, "Ganymede", 9887.834, 2634.1, [1_070_412.0, 0.0013, 0.177, 63.552, 192.417, 192.417]),
                moon(504, "Callisto", 7179.289, 2410.3, [1_882_709.0, 0.007, 0.192, 298.848, 52.643, 52.643]),
                moon(606, "Titan", 8978.0, 2574.7, [1_221_870.0, 0.0288, 0.348_54, 78.6, 78.3, 11.7]),
                moon(801, "Triton", 1427.6, 1353.4, [354_800.0, 0.0, 157.3, 178.1, 0.0, 63.0]),
                moon(901, "Charon", 101.4, 606.0, [19_591.4, 0.0, 96.145, 223.046, 0.0, 0.0]),
            ],
        )
    }
}

fn has_state(body: &CelestialBody) -> bool {
    body.position != Vector3::zeros() || body.velocity != Vector3::zeros()
}

/// Relative state after `offset` seconds of two-body motion. Bodies at the
/// origin or without mass to orbit keep their offset.
fn two_body(
    id: BodyId,
    r0: Vector3<f64>,
    v0: Vector3<f64>,
    mu: f64,
    offset: f64,
) -> Result<(Vector3<f64>, Vector3<f64>)> {
    if mu <= 0.0 || r0.norm() == 0.0 {
        return Ok((r0, v0));
    }
    propagate_universal(r0, v0, mu, offset, 1e-9, 60).ok_or_else(|| {
        Error::InvalidHierarchy(format!("body {id} has an orbit that failed to propagate"))
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn sol_hierarchy() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        assert_eq!(sol.root(), BodyId::SSB);
        assert_eq!(
            sol.children(BodyId::EARTH_BARYCENTER),
            &[BodyId::MOON, BodyId::EARTH]
        );
        assert_eq!(sol.primary(BodyId::EARTH_BARYCENTER), Some(BodyId::EARTH));
        assert_eq!(sol.primary(BodyId::SSB), Some(BodyId::SUN));
        assert_eq!(sol.dominant(BodyId::SSB), BodyId::SUN);
        assert_eq!(sol.dominant(BodyId::JUPITER_BARYCENTER), BodyId::JUPITER);
        assert!(sol.is_ancestor(BodyId::EARTH_BARYCENTER, BodyId::MOON));
        assert!(!sol.is_ancestor(BodyId::MOON, BodyId::SUN));
        assert!(sol.body(BodyId::SSB).unwrap().is_barycenter());
        assert!(sol.body(BodyId::SSB).unwrap().soi.is_infinite());
        assert!(sol.body(BodyId::SUN).unwrap().soi.is_infinite());
    }

    #[test]
    fn soi_tree_skips_barycenters() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        assert_eq!(sol.soi_parent(BodyId::MOON), Some(BodyId::EARTH));
        assert_eq!(sol.soi_parent(BodyId::EARTH), Some(BodyId::SUN));
        assert_eq!(sol.soi_parent(BodyId::PHOBOS), Some(BodyId::MARS));
        assert_eq!(sol.soi_parent(BodyId::SUN), None);
        assert_eq!(sol.soi_parent(BodyId::SSB), None);
        assert_eq!(sol.soi_children(BodyId::EARTH), &[BodyId::MOON]);
        let planets = sol.soi_children(BodyId::SUN);
        for planet in [BodyId::MERCURY, BodyId::EARTH, BodyId::JUPITER, BodyId::PLUTO] {
            assert!(planets.contains(&planet));
        }
        assert!(!planets.contains(&BodyId::MOON));
        assert!(sol.is_soi_ancestor(BodyId::SUN, BodyId::IO));
        assert!(!sol.is_soi_ancestor(BodyId::EARTH, BodyId::IO));
        for planet in planets {
            let soi = sol.body(*planet).unwrap().soi;
            assert!(soi.is_finite() && soi > 0.0, "{planet}: {soi}");
        }
    }

    #[test]
    fn earth_and_moon_soi() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let earth = sol.body(BodyId::EARTH).unwrap();
        let moon = sol.body(BodyId::MOON).unwrap();
        // Textbook values: ~925,000 km and ~66,100 km.
        assert_relative_eq!(earth.soi, 925_000.0, max_relative = 0.02);
        assert_relative_eq!(moon.soi, 66_100.0, max_relative = 0.02);
    }

    #[test]
    fn canonical_orbits_place_bodies() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let (r, _) = sol.relative_state(BodyId::MOON, BodyId::EARTH, 0.0).unwrap();
        assert!(r.norm() > 360_000.0 && r.norm() < 410_000.0);
        let (io, _) = sol.relative_state(BodyId::IO, BodyId::JUPITER, 0.0).unwrap();
        assert_relative_eq!(io.norm(), 421_700.0, max_relative = 0.01);
        let (sun, _) = sol.barycentric_state(BodyId::SUN, 0.0).unwrap();
        assert!(sun.norm() > 0.0 && sun.norm() < 2.0e6);
    }

    #[test]
    fn primary_keeps_barycenter_at_centre_of_mass() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        for offset in [0.0, 86_400.0 * 3.0] {
            let (bary, bary_v) = sol
                .barycentric_state(BodyId::EARTH_BARYCENTER, offset)
                .unwrap();
            let (earth, earth_v) = sol.barycentric_state(BodyId::EARTH, offset).unwrap();
            let (moon, moon_v) = sol.barycentric_state(BodyId::MOON, offset).unwrap();
            let me = 398_600.435_507;
            let mm = 4902.800_066;
            let centre = (me * earth + mm * moon) / (me + mm);
            let centre_v = (me * earth_v + mm * moon_v) / (me + mm);
            assert_relative_eq!(centre, bary, epsilon = 1e-3);
            assert_relative_eq!(centre_v, bary_v, epsilon = 1e-9);
        }
    }

    #[test]
    fn planet_and_moon_under_a_massless_barycenter() {
        let orbit = |a: f64, m0: f64| {
            Some(CanonicalOrbit {
                a,
                e: 0.0,
                i: 0.0,
                lan: 0.0,
                argpe: 0.0,
                m0,
            })
        };
        let bodies = [
            CelestialBody::new(BodyId::SSB, "SSB", 0.0, 0.0),
            CelestialBody {
                is_star: true,
                ..CelestialBody::new(BodyId::SUN, "Sun", 1.327e11, 695_700.0).with_parent(BodyId::SSB)
            },
            CelestialBody {
                orbit: orbit(1.496e8, 0.0),
                ..CelestialBody::new(BodyId::EARTH_BARYCENTER, "EMB", 0.0, 0.0)
                    .with_parent(BodyId::SSB)
            },
            CelestialBody::new(BodyId::EARTH, "Earth", 398_600.0, 6378.0)
                .with_parent(BodyId::EARTH_BARYCENTER),
            CelestialBody {
                orbit: orbit(384_400.0, 90.0),
                ..CelestialBody::new(BodyId::MOON, "Moon", 4902.8, 1737.4)
                    .with_parent(BodyId::EARTH_BARYCENTER)
            },
        ];
        let system = SolarSystem::new(Epoch::J2000, bodies).unwrap();
        let earth = system.body(BodyId::EARTH).unwrap();
        let moon = system.body(BodyId::MOON).unwrap();
        assert!(earth.soi.is_finite() && earth.soi > 800_000.0);
        assert!(moon.soi.is_finite() && moon.soi > 50_000.0);
        assert_eq!(system.soi_children(BodyId::EARTH), &[BodyId::MOON]);
        assert_eq!(system.soi_parent(BodyId::EARTH), Some(BodyId::SUN));

        // A quarter of a sidereal month of two-body motion.
        let period = consts::TAU * libm::sqrt(384_400.0_f64.powi(3) / (398_600.0 + 4902.8));
        let (r0, _) = system.relative_state(BodyId::MOON, BodyId::EARTH, 0.0).unwrap();
        let (r1, _) = system
            .relative_state(BodyId::MOON, BodyId::EARTH, period / 4.0)
            .unwrap();
        assert_relative_eq!(r0.norm(), 384_400.0, max_relative = 1e-9);
        assert_relative_eq!(r1.norm(), 384_400.0, max_relative = 1e-6);
        assert_relative_eq!(r0.angle(&r1), consts::FRAC_PI_2, epsilon = 1e-6);
    }

    #[test]
    fn keplerian_motion_moves_moon() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let (r0, _) = sol.relative_state(BodyId::MOON, BodyId::EARTH, 0.0).unwrap();
        let (r1, _) = sol.relative_state(BodyId::MOON, BodyId::EARTH, 86400.0).unwrap();
        let angle = r0.angle(&r1);
        // About 13 degrees a day.
        assert_relative_eq!(angle.to_degrees(), 13.2, epsilon = 2.0);

        let frozen = sol.clone().with_motion(BodyMotion::Frozen);
        let (r2, _) = frozen
            .relative_state(BodyId::MOON, BodyId::EARTH, 86400.0)
            .unwrap();
        assert_eq!(r0, r2);
    }

    #[test]
    fn mass_and_mu_derive_each_other() {
        let mut body = CelestialBody::new(BodyId(1000), "Rock", 0.0, 10.0);
        body.mass = 1.0e20;
        let system = SolarSystem::new(Epoch::J2000, [body]).unwrap();
        let rock = system.body(BodyId(1000)).unwrap();
        assert_relative_eq!(rock.mu, G * 1.0e20);
    }

    #[test]
    fn rejects_bad_hierarchy() {
        let a = CelestialBody::new(BodyId(1), "A", 1.0, 1.0);
        let b = CelestialBody::new(BodyId(2), "B", 1.0, 1.0);
        assert!(matches!(
            SolarSystem::new(Epoch::J2000, [a.clone(), b]),
            Err(Error::InvalidHierarchy(_))
        ));
        let orphan = CelestialBody::new(BodyId(3), "C", 1.0, 1.0).with_parent(BodyId(99));
        assert!(matches!(
            SolarSystem::new(Epoch::J2000, [a, orphan]),
            Err(Error::InvalidHierarchy(_))
        ));
    }

    #[test]
    fn atmosphere_is_clipped() {
        let atm = Atmosphere::earth();
        assert_eq!(atm.density(500.1), 0.0);
        assert_eq!(atm.density(-1.0), 0.0);
        assert_relative_eq!(atm.density(0.0), 1.225);
        assert_relative_eq!(atm.density(8.5), 1.225 / consts::E, max_relative = 1e-12);
    }

    #[test]
    fn earth_pole_points_north_of_ecliptic() {
        let model = RotationModel {
            pole_ra: [0.0, 0.0, 0.0],
            pole_dec: [90.0, 0.0, 0.0],
            pm: [0.0, 0.0, 0.0],
        };
        let pole = model.orientation(Epoch::J2000) * Vector3::z();
        // The celestial pole sits one obliquity away from the ecliptic pole.
        assert_relative_eq!(pole.angle(&Vector3::z()), OBLIQUITY_J2000, epsilon = 1e-9);
    }
}
