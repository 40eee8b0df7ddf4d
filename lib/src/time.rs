use std::{fmt, ops};

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Iso8601, OffsetDateTime, PrimitiveDateTime};

pub const SECONDS_PER_DAY: f64 = 86400.0;
pub const DAYS_PER_CENTURY: f64 = 36525.0;

/// Unix timestamp of 2000-01-01T12:00:00 UTC.
const J2000_UNIX_SECONDS: i64 = 946_728_000;

/// Simulation time, in seconds since the J2000 epoch.
#[derive(Copy, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Epoch(f64);

impl Epoch {
    pub const J2000: Epoch = Epoch(0.0);

    pub fn from_seconds(seconds: f64) -> Self {
        Self(seconds)
    }

    /// Milliseconds since J2000.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis as f64 / 1000.0)
    }

    /// Milliseconds since the Unix epoch.
    pub fn from_unix_millis(millis: i64) -> Self {
        Self((millis - J2000_UNIX_SECONDS * 1000) as f64 / 1000.0)
    }

    /// Parse an ISO 8601 date-time. A missing offset is taken as UTC.
    pub fn parse_iso(s: &str) -> Result<Self, time::error::Parse> {
        let dt = match OffsetDateTime::parse(s, &Iso8601::DEFAULT) {
            Ok(dt) => dt,
            Err(_) => PrimitiveDateTime::parse(s, &Iso8601::DEFAULT)?.assume_utc(),
        };
        let nanos = dt.unix_timestamp_nanos() - i128::from(J2000_UNIX_SECONDS) * 1_000_000_000;
        Ok(Self(nanos as f64 / 1e9))
    }

    pub fn seconds(self) -> f64 {
        self.0
    }

    pub fn millis(self) -> i64 {
        (self.0 * 1000.0).round() as i64
    }

    pub fn days(self) -> f64 {
        self.0 / SECONDS_PER_DAY
    }

    pub fn centuries(self) -> f64 {
        self.days() / DAYS_PER_CENTURY
    }
}

impl ops::Add<f64> for Epoch {
    type Output = Epoch;

    fn add(self, rhs: f64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl ops::AddAssign<f64> for Epoch {
    fn add_assign(&mut self, rhs: f64) {
        self.0 += rhs;
    }
}

impl ops::Sub<f64> for Epoch {
    type Output = Epoch;

    fn sub(self, rhs: f64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl ops::Sub<Epoch> for Epoch {
    type Output = f64;

    fn sub(self, rhs: Epoch) -> Self::Output {
        self.0 - rhs.0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({self})")
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos =
            i128::from(J2000_UNIX_SECONDS) * 1_000_000_000 + (self.0 * 1e9).round() as i128;
        match OffsetDateTime::from_unix_timestamp_nanos(nanos) {
            Ok(dt) => write!(
                f,
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
                dt.year(),
                dt.month() as u8,
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second(),
                dt.millisecond()
            ),
            Err(_) => write!(f, "J2000{:+}s", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_j2000() {
        let epoch = Epoch::parse_iso("2000-01-01T12:00:00Z").unwrap();
        assert_eq!(epoch.seconds(), 0.0);
        let epoch = Epoch::parse_iso("2000-01-02T12:00:00").unwrap();
        assert_eq!(epoch.seconds(), SECONDS_PER_DAY);
    }

    #[test]
    fn unix_millis_round_trip() {
        let epoch = Epoch::from_unix_millis(946_728_000_000 + 1500);
        assert_eq!(epoch.millis(), 1500);
        assert_eq!(format!("{epoch}"), "2000-01-01T12:00:01.500Z");
    }
}
