//! Error taxonomy for propagation, frame and configuration failures.
//!
//! Stale results are not errors and never show up here; the backend
//! drops them before they reach a consumer.

use crate::{
    bodies::BodyId,
    frames::Frame,
    satellite::{SatelliteId, TrajectorySample},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("body {0} is not in the body set")]
    MissingBody(BodyId),
    #[error("satellite {satellite} references central body {body}, which is not in the body set")]
    MissingCentralBody {
        satellite: SatelliteId,
        body: BodyId,
    },
    #[error("body {0} has neither a gravitational parameter nor a mass")]
    MissingGravParam(BodyId),
    #[error("invalid body hierarchy: {0}")]
    InvalidHierarchy(String),
    #[error("orbit is not bound (e = {0})")]
    UnboundOrbit(f64),
    #[error("local orbital basis is undefined for a radial or zero-velocity state")]
    DegenerateBasis,

    #[error("non-finite state at t = {t} s after {rejections} rejected steps")]
    NonFinite { t: f64, rejections: u32 },
    #[error("step size collapsed below {min_dt} s at t = {t} s")]
    StepCollapsed { t: f64, min_dt: f64 },

    #[error("unsupported transform from {from:?} to {to:?}: {reason}")]
    UnsupportedTransform {
        from: Frame,
        to: Frame,
        reason: &'static str,
    },

    #[error("backend is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ron(#[from] ron::error::SpannedError),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Epoch(#[from] time::error::Parse),
}

impl Error {
    /// Whether this error came out of the integrator rather than from bad
    /// input.
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::NonFinite { .. } | Self::StepCollapsed { .. })
    }
}

/// A failed propagation, tagged with the last sample that was known good.
#[derive(Debug, thiserror::Error)]
#[error("propagation failed: {source}")]
pub struct PropagationError {
    #[source]
    pub source: Error,
    pub last_sample: Option<TrajectorySample>,
}

impl PropagationError {
    pub fn new(source: Error, last_sample: Option<TrajectorySample>) -> Self {
        Self {
            source,
            last_sample,
        }
    }
}

impl From<Error> for PropagationError {
    fn from(source: Error) -> Self {
        Self::new(source, None)
    }
}
