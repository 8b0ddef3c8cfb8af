//! Cyclical and categorical time features.
//!
//! Timestamps are normalized to a UTC instant, then read on the civil
//! calendar of the deployment time zone: ridership follows local clock time.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::f64::consts::PI;

const HOURS_PER_DAY: f64 = 24.0;

/// Naive layouts, read as UTC.
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Time features for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeFeatures {
    pub hour_sin: f64,
    pub hour_cos: f64,
    /// 0 = Monday .. 6 = Sunday
    pub day_of_week: u32,
    /// 1 = January .. 12 = December
    pub month: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFeatureEncoder {
    tz: Tz,
}

impl TimeFeatureEncoder {
    pub fn new(tz: Tz) -> Self {
        TimeFeatureEncoder { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn encode(&self, instant: DateTime<Utc>) -> TimeFeatures {
        let local = instant.with_timezone(&self.tz);
        let (hour_sin, hour_cos) = cyclical_hour(local.hour());

        TimeFeatures {
            hour_sin,
            hour_cos,
            day_of_week: local.weekday().num_days_from_monday(),
            month: local.month(),
        }
    }

    /// Parses and encodes a raw timestamp. `None` if it cannot be parsed.
    pub fn encode_str(&self, raw: &str) -> Option<TimeFeatures> {
        parse_timestamp(raw).map(|instant| self.encode(instant))
    }
}

/// Embeds an hour of day on the unit circle.
pub fn cyclical_hour(hour: u32) -> (f64, f64) {
    let angle = 2.0 * PI * hour as f64 / HOURS_PER_DAY;
    (angle.sin(), angle.cos())
}

/// Recovers the hour of day from its (sin, cos) embedding.
pub fn hour_from_cyclical(hour_sin: f64, hour_cos: f64) -> u32 {
    let mut angle = hour_sin.atan2(hour_cos);
    if angle < 0.0 {
        angle += 2.0 * PI;
    }
    (angle * HOURS_PER_DAY / (2.0 * PI)).round() as u32 % 24
}

/// Normalizes a raw timestamp string to a UTC instant.
///
/// Accepts the weather feed layout (`2023-01-15 12:00:00 UTC`, optionally with
/// a `+0000` offset before the zone name), RFC 3339 with any offset, and naive
/// date-times which are taken to be UTC. A `UTC` suffix after a non-zero
/// offset is rejected.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (body, utc_suffix) = match trimmed.strip_suffix(" UTC") {
        Some(body) => (body, true),
        None => (trimmed, false),
    };

    let offset_time = DateTime::parse_from_rfc3339(body)
        .or_else(|_| DateTime::parse_from_str(body, "%Y-%m-%d %H:%M:%S %z"));
    if let Ok(dt) = offset_time {
        // a "UTC" suffix only agrees with a zero offset
        if utc_suffix && dt.offset().local_minus_utc() != 0 {
            return None;
        }
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(body, format).ok())
        .map(|naive| naive.and_utc())
}
