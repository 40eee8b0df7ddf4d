//! Conversions between body-fixed, body-inertial, barycentric and
//! geodetic coordinates.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    bodies::{BodyId, CelestialBody, SolarSystem},
    error::{Error, Result},
    time::Epoch,
};

/// Reference frames, ordered from the body surface outwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Frame {
    /// Latitude and longitude (`rad`) and altitude (`km`) over the body's
    /// ellipsoid. Velocities are East-North-Up.
    Geodetic,
    /// Rotating with the body.
    PlanetFixed,
    /// Centred on the body, non-rotating.
    PlanetInertial,
    /// Centred on the system barycenter, non-rotating.
    Barycentric,
}

impl Frame {
    fn outwards(self) -> Option<Frame> {
        match self {
            Self::Geodetic => Some(Self::PlanetFixed),
            Self::PlanetFixed => Some(Self::PlanetInertial),
            Self::PlanetInertial => Some(Self::Barycentric),
            Self::Barycentric => None,
        }
    }

    fn inwards(self) -> Option<Frame> {
        match self {
            Self::Geodetic => None,
            Self::PlanetFixed => Some(Self::Geodetic),
            Self::PlanetInertial => Some(Self::PlanetFixed),
            Self::Barycentric => Some(Self::PlanetInertial),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrientationSource {
    /// Quaternion supplied with the body, advanced by its rotation rate.
    Live,
    /// IAU pole and prime meridian model.
    Model,
    /// Nothing available; identity was used.
    Fallback,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameWarning {
    /// The body has no orientation data, so its fixed frame was taken to be
    /// aligned with the inertial axes.
    IdentityOrientation(BodyId),
}

/// Orientation of a body-fixed frame at one instant.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Orientation {
    /// Body-fixed to inertial.
    pub rotation: UnitQuaternion<f64>,
    /// `rad/s` about the body pole
    pub rate: f64,
    pub source: OrientationSource,
}

impl Orientation {
    pub fn pole(&self) -> Vector3<f64> {
        self.rotation * Vector3::z()
    }

    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.pole() * self.rate
    }

    pub fn warning(&self, body: BodyId) -> Option<FrameWarning> {
        (self.source == OrientationSource::Fallback).then_some(FrameWarning::IdentityOrientation(body))
    }
}

/// Orientation of `body` at `epoch`, given that the registry snapshot was
/// taken at `snapshot`.
pub fn orientation(body: &CelestialBody, snapshot: Epoch, epoch: Epoch) -> Orientation {
    let rate = body.rotation.rate();
    if let Some(q) = body.rotation.live_orientation() {
        let spin = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), rate * (epoch - snapshot));
        return Orientation {
            rotation: q * spin,
            rate,
            source: OrientationSource::Live,
        };
    }
    if let Some(model) = body.rotation.model {
        return Orientation {
            rotation: model.orientation(epoch),
            rate,
            source: OrientationSource::Model,
        };
    }
    Orientation {
        rotation: UnitQuaternion::identity(),
        rate,
        source: OrientationSource::Fallback,
    }
}

/// Geodetic coordinates in radians and kilometres.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geodetic {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl Geodetic {
    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self {
            latitude: v.x,
            longitude: v.y,
            altitude: v.z,
        }
    }

    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.latitude, self.longitude, self.altitude)
    }

    /// Latitude and longitude in degrees, longitude wrapped to (-180, 180].
    pub fn to_degrees(self) -> Self {
        let mut longitude = self.longitude.to_degrees() % 360.0;
        if longitude > 180.0 {
            longitude -= 360.0;
        } else if longitude <= -180.0 {
            longitude += 360.0;
        }
        Self {
            latitude: self.latitude.to_degrees(),
            longitude,
            altitude: self.altitude,
        }
    }
}

/// A transformed state plus any caveats that applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Transformed {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub warnings: Vec<FrameWarning>,
}

const GEODETIC_MAX_ITER: usize = 16;
const GEODETIC_TOL: f64 = 1e-13;

fn enu_basis(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let (sp, cp) = latitude.sin_cos();
    let (sl, cl) = longitude.sin_cos();
    Matrix3::from_columns(&[
        Vector3::new(-sl, cl, 0.0),
        Vector3::new(-sp * cl, -sp * sl, cp),
        Vector3::new(cp * cl, cp * sl, sp),
    ])
}

/// Body-fixed cartesian to geodetic, iterating on latitude. The body centre
/// maps to latitude and longitude zero, one equatorial radius down.
pub fn fixed_to_geodetic(
    position: &Vector3<f64>,
    velocity: &Vector3<f64>,
    a: f64,
    b: f64,
) -> (Geodetic, Vector3<f64>) {
    let e2 = 1.0 - (b * b) / (a * a);
    let p = position.xy().norm();
    let z = position.z;
    let longitude = libm::atan2(position.y, position.x);

    if p == 0.0 && z == 0.0 {
        let centre = Geodetic {
            latitude: 0.0,
            longitude: 0.0,
            altitude: -a,
        };
        return (centre, enu_basis(0.0, 0.0).transpose() * velocity);
    }

    let mut latitude = libm::atan2(z, p * (1.0 - e2));
    let mut altitude = 0.0;
    for _ in 0..GEODETIC_MAX_ITER {
        let sin = latitude.sin();
        let n = a / (1.0 - e2 * sin * sin).sqrt();
        altitude = if p > z.abs() {
            p / latitude.cos() - n
        } else {
            z / sin - n * (1.0 - e2)
        };
        let next = libm::atan2(z, p * (1.0 - e2 * n / (n + altitude)));
        let done = (next - latitude).abs() < GEODETIC_TOL;
        latitude = next;
        if done {
            break;
        }
    }

    let enu = enu_basis(latitude, longitude).transpose() * velocity;
    (
        Geodetic {
            latitude,
            longitude,
            altitude,
        },
        enu,
    )
}

/// Geodetic to body-fixed cartesian, closed form.
pub fn geodetic_to_fixed(
    geodetic: &Geodetic,
    enu_velocity: &Vector3<f64>,
    a: f64,
    b: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    let e2 = 1.0 - (b * b) / (a * a);
    let (sp, cp) = geodetic.latitude.sin_cos();
    let (sl, cl) = geodetic.longitude.sin_cos();
    let n = a / (1.0 - e2 * sp * sp).sqrt();
    let h = geodetic.altitude;
    let position = Vector3::new((n + h) * cp * cl, (n + h) * cp * sl, (n * (1.0 - e2) + h) * sp);
    let velocity = enu_basis(geodetic.latitude, geodetic.longitude) * enu_velocity;
    (position, velocity)
}

/// Frame conversions against one registry snapshot.
#[derive(Copy, Clone, Debug)]
pub struct FrameTransformer<'a> {
    system: &'a SolarSystem,
}

impl<'a> FrameTransformer<'a> {
    pub fn new(system: &'a SolarSystem) -> Self {
        Self { system }
    }

    pub fn orientation(&self, body: BodyId, epoch: Epoch) -> Result<Orientation> {
        Ok(orientation(self.system.body(body)?, self.system.epoch, epoch))
    }

    /// Convert a state of something near `body` between frames at `epoch`.
    ///
    /// Geodetic states carry `(latitude, longitude, altitude)` in the
    /// position slot and East-North-Up velocity in the velocity slot.
    pub fn transform(
        &self,
        position: &Vector3<f64>,
        velocity: &Vector3<f64>,
        from: Frame,
        to: Frame,
        body: BodyId,
        epoch: Epoch,
    ) -> Result<Transformed> {
        let b = self.system.body(body)?;
        let unsupported = |reason| Error::UnsupportedTransform { from, to, reason };
        if b.is_barycenter() && (from != Frame::Barycentric || to != Frame::Barycentric) {
            return Err(unsupported("frame is tied to a massless barycenter"));
        }
        if (from == Frame::Geodetic || to == Frame::Geodetic) && b.equatorial_radius <= 0.0 {
            return Err(unsupported("body has no radius"));
        }

        let mut out = Transformed {
            position: *position,
            velocity: *velocity,
            warnings: Vec::new(),
        };
        let mut orient = None;
        let mut get_orientation = |out: &mut Transformed| {
            *orient.get_or_insert_with(|| {
                let o = orientation(b, self.system.epoch, epoch);
                if let Some(w) = o.warning(body) {
                    warn!(%body, "no orientation data, assuming identity");
                    out.warnings.push(w);
                }
                o
            })
        };

        let mut frame = from;
        while frame != to {
            let next = if to > frame {
                frame.outwards()
            } else {
                frame.inwards()
            }
            .ok_or_else(|| unsupported("no path between frames"))?;

            match (frame, next) {
                (Frame::Geodetic, Frame::PlanetFixed) => {
                    let (r, v) = geodetic_to_fixed(
                        &Geodetic::from_vector(&out.position),
                        &out.velocity,
                        b.equatorial_radius,
                        b.polar_radius(),
                    );
                    (out.position, out.velocity) = (r, v);
                }
                (Frame::PlanetFixed, Frame::Geodetic) => {
                    let (g, v) = fixed_to_geodetic(
                        &out.position,
                        &out.velocity,
                        b.equatorial_radius,
                        b.polar_radius(),
                    );
                    (out.position, out.velocity) = (g.to_vector(), v);
                }
                (Frame::PlanetFixed, Frame::PlanetInertial) => {
                    let o = get_orientation(&mut out);
                    let r = o.rotation * out.position;
                    let v = o.rotation * out.velocity + o.angular_velocity().cross(&r);
                    (out.position, out.velocity) = (r, v);
                }
                (Frame::PlanetInertial, Frame::PlanetFixed) => {
                    let o = get_orientation(&mut out);
                    let v = out.velocity - o.angular_velocity().cross(&out.position);
                    out.position = o.rotation.inverse_transform_vector(&out.position);
                    out.velocity = o.rotation.inverse_transform_vector(&v);
                }
                (Frame::PlanetInertial, Frame::Barycentric) => {
                    let (r, v) = self.system.barycentric_state(body, epoch - self.system.epoch)?;
                    out.position += r;
                    out.velocity += v;
                }
                (Frame::Barycentric, Frame::PlanetInertial) => {
                    let (r, v) = self.system.barycentric_state(body, epoch - self.system.epoch)?;
                    out.position -= r;
                    out.velocity -= v;
                }
                _ => return Err(unsupported("no path between frames")),
            }
            frame = next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts;

    use approx::assert_relative_eq;

    use super::*;
    use crate::bodies::Rotation;

    const A: f64 = 6378.137;
    const B: f64 = 6356.752_314_245;

    #[test]
    fn geodetic_round_trip() {
        for (lat, lon, alt) in [
            (0.0, 0.0, 0.0),
            (0.7, -2.0, 400.0),
            (-1.2, 3.0, 35_786.0),
            (1.5, 0.1, 10.0),
        ] {
            let g = Geodetic {
                latitude: lat,
                longitude: lon,
                altitude: alt,
            };
            let enu = Vector3::new(0.1, -0.2, 0.3);
            let (r, v) = geodetic_to_fixed(&g, &enu, A, B);
            let (back, enu_back) = fixed_to_geodetic(&r, &v, A, B);
            assert_relative_eq!(back.latitude, lat, epsilon = 1e-10);
            assert_relative_eq!(back.longitude, lon, epsilon = 1e-10);
            assert_relative_eq!(back.altitude, alt, epsilon = 1e-6);
            assert_relative_eq!(enu_back, enu, epsilon = 1e-10);
        }
    }

    #[test]
    fn poles_and_equator() {
        let (g, _) = fixed_to_geodetic(&Vector3::new(0.0, 0.0, B + 100.0), &Vector3::zeros(), A, B);
        assert_relative_eq!(g.latitude, consts::FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(g.altitude, 100.0, epsilon = 1e-6);

        let (g, enu) =
            fixed_to_geodetic(&Vector3::new(0.0, A, 0.0), &Vector3::new(-1.0, 0.0, 0.0), A, B);
        assert_relative_eq!(g.to_degrees().longitude, 90.0, epsilon = 1e-9);
        assert_relative_eq!(g.altitude, 0.0, epsilon = 1e-9);
        // Moving in -x at 90 degrees east is moving east.
        assert_relative_eq!(enu, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn body_centre_has_a_finite_geodetic() {
        let (g, enu) = fixed_to_geodetic(&Vector3::zeros(), &Vector3::new(0.0, 1.0, 0.0), A, B);
        assert_eq!((g.latitude, g.longitude), (0.0, 0.0));
        assert_relative_eq!(g.altitude, -A);
        assert!(enu.iter().all(|x| x.is_finite()));
        assert_relative_eq!(enu, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);

        // Just off the centre along the pole still converges.
        let (g, _) = fixed_to_geodetic(&Vector3::new(0.0, 0.0, 1.0e-3), &Vector3::zeros(), A, B);
        assert!(g.latitude.is_finite() && g.altitude.is_finite());
    }

    #[test]
    fn longitude_wraps_for_display() {
        let g = Geodetic {
            latitude: 0.0,
            longitude: 1.5 * consts::PI,
            altitude: 0.0,
        };
        assert_relative_eq!(g.to_degrees().longitude, -90.0, epsilon = 1e-9);
    }

    fn spinning(id: BodyId, rotation: Rotation) -> SolarSystem {
        let body = CelestialBody {
            rotation,
            ..CelestialBody::new(id, "Spinner", 398_600.0, 6378.0)
        };
        SolarSystem::new(Epoch::J2000, [body]).unwrap()
    }

    #[test]
    fn fixed_point_moves_with_rotation() {
        let rate = 7.292e-5;
        let system = spinning(
            BodyId(1),
            Rotation {
                orientation: Some([1.0, 0.0, 0.0, 0.0]),
                rate,
                model: None,
            },
        );
        let frames = FrameTransformer::new(&system);
        let r = Vector3::new(7000.0, 0.0, 0.0);
        let quarter = consts::FRAC_PI_2 / rate;
        let out = frames
            .transform(
                &r,
                &Vector3::zeros(),
                Frame::PlanetFixed,
                Frame::PlanetInertial,
                BodyId(1),
                Epoch::J2000 + quarter,
            )
            .unwrap();
        assert_relative_eq!(out.position, Vector3::new(0.0, 7000.0, 0.0), epsilon = 1e-6);
        assert_relative_eq!(out.velocity, Vector3::new(-7000.0 * rate, 0.0, 0.0), epsilon = 1e-9);
        assert!(out.warnings.is_empty());

        let back = frames
            .transform(
                &out.position,
                &out.velocity,
                Frame::PlanetInertial,
                Frame::PlanetFixed,
                BodyId(1),
                Epoch::J2000 + quarter,
            )
            .unwrap();
        assert_relative_eq!(back.position, r, epsilon = 1e-6);
        assert_relative_eq!(back.velocity, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn missing_orientation_warns() {
        let system = spinning(BodyId(1), Rotation::default());
        let frames = FrameTransformer::new(&system);
        let r = Vector3::new(7000.0, 1.0, 2.0);
        let out = frames
            .transform(
                &r,
                &Vector3::zeros(),
                Frame::PlanetInertial,
                Frame::PlanetFixed,
                BodyId(1),
                Epoch::J2000,
            )
            .unwrap();
        assert_relative_eq!(out.position, r, epsilon = 1e-9);
        assert_eq!(out.warnings, [FrameWarning::IdentityOrientation(BodyId(1))]);
    }

    #[test]
    fn composed_round_trip_through_geodetic() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let frames = FrameTransformer::new(&sol);
        let epoch = Epoch::J2000 + 3600.0;
        let r = Vector3::new(-4000.0, 5000.0, 2500.0);
        let v = Vector3::new(-5.0, -4.0, 1.0);
        let bary = frames
            .transform(&r, &v, Frame::PlanetInertial, Frame::Barycentric, BodyId::EARTH, epoch)
            .unwrap();
        let geo = frames
            .transform(
                &bary.position,
                &bary.velocity,
                Frame::Barycentric,
                Frame::Geodetic,
                BodyId::EARTH,
                epoch,
            )
            .unwrap();
        let back = frames
            .transform(
                &geo.position,
                &geo.velocity,
                Frame::Geodetic,
                Frame::PlanetInertial,
                BodyId::EARTH,
                epoch,
            )
            .unwrap();
        assert_relative_eq!(back.position, r, epsilon = 1e-6);
        assert_relative_eq!(back.velocity, v, epsilon = 1e-9);
    }

    #[test]
    fn barycenter_frames_are_unsupported() {
        let sol = SolarSystem::sol(Epoch::J2000).unwrap();
        let frames = FrameTransformer::new(&sol);
        let err = frames
            .transform(
                &Vector3::new(1.0, 0.0, 0.0),
                &Vector3::zeros(),
                Frame::Barycentric,
                Frame::PlanetFixed,
                BodyId::SSB,
                Epoch::J2000,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedTransform {
                from: Frame::Barycentric,
                to: Frame::PlanetFixed,
                ..
            }
        ));
    }
}
