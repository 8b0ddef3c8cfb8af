//! Pipeline configuration.
//!
//! Stored as a plain JSON object on disk; every key is optional:
//! ```json
//! {
//!   "geohash_precision": 5,
//!   "time_zone": "America/Chicago",
//!   "weather_columns": ["temp", "pressure", "humidity", "wind_speed", "wind_deg", "clouds_all"],
//!   "unknown_category_policy": "ignore",
//!   "missing_station_policy": "unknown",
//!   "non_finite_cap": 1000.0
//! }
//! ```

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{PipelineError, Result};

pub const DEFAULT_GEOHASH_PRECISION: usize = 5;
pub const MAX_GEOHASH_PRECISION: usize = 12;
pub const DEFAULT_TIME_ZONE: &str = "America/Chicago";
pub const DEFAULT_NON_FINITE_CAP: f64 = 1000.0;

pub const DEFAULT_WEATHER_COLUMNS: [&str; 6] = [
    "temp",
    "pressure",
    "humidity",
    "wind_speed",
    "wind_deg",
    "clouds_all",
];

/// What to do with a category that was not seen at fit time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCategoryPolicy {
    /// Encode as the all-zero indicator vector and count it.
    #[default]
    Ignore,
    /// Fail the batch with [`PipelineError::UnknownCategory`].
    Error,
}

/// What to do with trips whose station has no geohash entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingStationPolicy {
    /// Keep the row; its geohash block is routed through the unknown-category policy.
    #[default]
    Unknown,
    /// Remove the row once, before assembly.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub geohash_precision: usize,
    pub time_zone: String,
    pub weather_columns: Vec<String>,
    pub unknown_category_policy: UnknownCategoryPolicy,
    pub missing_station_policy: MissingStationPolicy,
    pub non_finite_cap: f64,
    /// Run the column groups on the rayon pool.
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            geohash_precision: DEFAULT_GEOHASH_PRECISION,
            time_zone: DEFAULT_TIME_ZONE.to_string(),
            weather_columns: DEFAULT_WEATHER_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            unknown_category_policy: UnknownCategoryPolicy::Ignore,
            missing_station_policy: MissingStationPolicy::Unknown,
            non_finite_cap: DEFAULT_NON_FINITE_CAP,
            parallel: true,
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path` and validates it.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.geohash_precision == 0 || self.geohash_precision > MAX_GEOHASH_PRECISION {
            return Err(PipelineError::Config(format!(
                "geohash_precision must be between 1 and {}, got {}",
                MAX_GEOHASH_PRECISION, self.geohash_precision
            )));
        }

        self.tz()?;

        if self.weather_columns.is_empty() {
            return Err(PipelineError::Config(
                "weather_columns must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for column in &self.weather_columns {
            if column.trim().is_empty() {
                return Err(PipelineError::Config(
                    "weather column names must not be blank".to_string(),
                ));
            }
            if !seen.insert(column.as_str()) {
                return Err(PipelineError::Config(format!(
                    "weather column {} listed twice",
                    column
                )));
            }
        }

        if !self.non_finite_cap.is_finite() || self.non_finite_cap <= 0.0 {
            return Err(PipelineError::Config(format!(
                "non_finite_cap must be a finite positive number, got {}",
                self.non_finite_cap
            )));
        }

        Ok(())
    }

    /// Parses the configured civil time zone.
    pub fn tz(&self) -> Result<Tz> {
        parse_time_zone(&self.time_zone)
    }
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    Tz::from_str_insensitive(name)
        .map_err(|e| PipelineError::Config(format!("Unknown time zone {}: {}", name, e)))
}
