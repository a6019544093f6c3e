//! Defines custom `DateTime` type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Thin wrapper around a `chrono::DateTime<Utc>` with functions for custom (de)serialisation.
///
/// Serialised as an RFC3339 string in JSON and in job records.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub struct DateTime(chrono::DateTime<chrono::Utc>);

impl DateTime {
    /// Get current UTC date/time.
    pub fn now() -> Self {
        DateTime(chrono::Utc::now())
    }

    /// Construct from milliseconds since the Unix epoch. Saturates on out of range values.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        match chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, millis) {
            chrono::LocalResult::Single(dt) => DateTime(dt),
            _ => DateTime(chrono::Utc::now()),
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Get number of seconds since another given date/time.
    pub fn seconds_since(&self, other: &DateTime) -> i64 {
        self.0.signed_duration_since(other.0).num_seconds()
    }

    /// This date/time advanced by the given duration.
    pub fn plus(&self, duration: crate::models::Duration) -> Self {
        DateTime(self.0 + chrono::Duration::milliseconds(duration.as_millis() as i64))
    }

    pub fn inner(&self) -> chrono::DateTime<chrono::Utc> {
        self.0
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DateTime {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        DateTime(dt)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Duration;

    #[test]
    fn seconds_since() {
        let earlier = DateTime::from_timestamp_millis(1_000_000);
        let later = DateTime::from_timestamp_millis(61_000_000);
        assert_eq!(later.seconds_since(&earlier), 60_000);
        assert_eq!(earlier.seconds_since(&later), -60_000);
    }

    #[test]
    fn plus() {
        let dt = DateTime::from_timestamp_millis(1_000);
        assert_eq!(dt.plus(Duration::from_secs(9)).timestamp_millis(), 10_000);
    }
}
