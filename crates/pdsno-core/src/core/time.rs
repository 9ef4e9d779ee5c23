// crates/pdsno-core/src/core/time.rs
// ============================================================================
// Module: PDSNO Time Model
// Description: UTC timestamps with RFC 3339 wire form and clock injection.
// Purpose: Keep every expiry and freshness decision testable and skew-aware.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! All PDSNO timestamps are UTC and serialize as RFC 3339 strings. Components
//! that make time-dependent decisions (freshness windows, challenge and token
//! expiry, approval timeouts) take a [`Clock`] so tests can drive time
//! explicitly instead of sleeping. The skew tolerance for message freshness
//! is five minutes across the system.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;
use time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Freshness window applied to signed messages and admission requests (seconds).
pub const SKEW_TOLERANCE_SECONDS: i64 = 300;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while formatting or parsing timestamps.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum TimeError {
    /// Timestamp failed to format as RFC 3339.
    #[error("timestamp format failure: {0}")]
    Format(String),
    /// Timestamp string failed to parse as RFC 3339.
    #[error("invalid timestamp: {0}")]
    Parse(String),
}

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// UTC timestamp with an RFC 3339 wire form.
///
/// # Invariants
/// - Always normalized to the UTC offset.
/// - Serializes as an RFC 3339 string; deserialization rejects non-UTC-parsable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTimestamp(OffsetDateTime);

impl UtcTimestamp {
    /// Wraps an [`OffsetDateTime`], normalizing to UTC.
    #[must_use]
    pub fn from_datetime(datetime: OffsetDateTime) -> Self {
        Self(datetime.to_offset(time::UtcOffset::UTC))
    }

    /// Builds a timestamp from unix seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Parse`] when the value is outside the representable range.
    pub fn from_unix_seconds(seconds: i64) -> Result<Self, TimeError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self::from_datetime)
            .map_err(|err| TimeError::Parse(err.to_string()))
    }

    /// Parses an RFC 3339 string.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Parse`] on malformed input.
    pub fn parse_rfc3339(value: &str) -> Result<Self, TimeError> {
        OffsetDateTime::parse(value, &Rfc3339)
            .map(Self::from_datetime)
            .map_err(|err| TimeError::Parse(err.to_string()))
    }

    /// Formats the timestamp as RFC 3339.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Format`] when the value cannot be formatted.
    pub fn to_rfc3339(&self) -> Result<String, TimeError> {
        self.0.format(&Rfc3339).map_err(|err| TimeError::Format(err.to_string()))
    }

    /// Returns the timestamp as unix seconds.
    #[must_use]
    pub const fn unix_seconds(&self) -> i64 {
        self.0.unix_timestamp()
    }

    /// Returns `self - earlier` in fractional seconds (negative when `self` is earlier).
    #[must_use]
    pub fn seconds_since(&self, earlier: &Self) -> f64 {
        (self.0 - earlier.0).as_seconds_f64()
    }

    /// Returns a timestamp `seconds` later than this one.
    #[must_use]
    pub fn plus_seconds(&self, seconds: i64) -> Self {
        Self(self.0 + Duration::seconds(seconds))
    }

    /// Returns a timestamp `seconds` earlier than this one.
    #[must_use]
    pub fn minus_seconds(&self, seconds: i64) -> Self {
        Self(self.0 - Duration::seconds(seconds))
    }

    /// Returns true when this timestamp is strictly after `other`.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.0 > other.0
    }

    /// Returns true when `|now - self|` is within the shared skew tolerance.
    #[must_use]
    pub fn is_fresh(&self, now: &Self) -> bool {
        now.seconds_since(self).abs() <= SKEW_TOLERANCE_SECONDS as f64
    }
}

impl Serialize for UtcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = self.to_rfc3339().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for UtcTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse_rfc3339(&value).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECTION: Clocks
// ============================================================================

/// Source of the current UTC time.
///
/// # Invariants
/// - `now` is monotone for [`SystemClock`] only to the extent the host clock is;
///   freshness checks therefore tolerate the shared skew window.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> UtcTimestamp;
}

/// Wall-clock [`Clock`] used in production processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcTimestamp {
        UtcTimestamp::from_datetime(OffsetDateTime::now_utc())
    }
}

/// Manually advanced [`Clock`] for deterministic tests.
///
/// # Invariants
/// - Time only moves when a caller sets or advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    /// Shared current instant.
    current: Arc<Mutex<UtcTimestamp>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub fn starting_at(start: UtcTimestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advances the clock by the given number of seconds.
    pub fn advance_seconds(&self, seconds: i64) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = guard.plus_seconds(seconds);
        }
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, instant: UtcTimestamp) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = instant;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UtcTimestamp {
        self.current.lock().map_or_else(|poisoned| *poisoned.into_inner(), |guard| *guard)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::ManualClock;
    use super::UtcTimestamp;
    use crate::core::time::Clock;

    #[test]
    fn rfc3339_round_trip() {
        let ts = UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap();
        let wire = ts.to_rfc3339().unwrap();
        assert_eq!(UtcTimestamp::parse_rfc3339(&wire).unwrap(), ts);
    }

    #[test]
    fn freshness_window_is_symmetric() {
        let now = UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap();
        assert!(now.minus_seconds(299).is_fresh(&now));
        assert!(now.plus_seconds(299).is_fresh(&now));
        assert!(!now.minus_seconds(301).is_fresh(&now));
        assert!(!now.plus_seconds(301).is_fresh(&now));
    }

    #[test]
    fn manual_clock_advances() {
        let start = UtcTimestamp::from_unix_seconds(1_000).unwrap();
        let clock = ManualClock::starting_at(start);
        clock.advance_seconds(30);
        assert_eq!(clock.now().seconds_since(&start), 30.0);
    }
}
