//! Tabular records flowing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

/// A docking station. `name` is the join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    #[serde(alias = "station_name")]
    pub name: String,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lon: f64,
}

impl StationRecord {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        StationRecord {
            name: name.to_string(),
            lat,
            lon,
        }
    }
}

/// One trip/observation row as delivered upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRecord {
    pub timestamp: String,
    pub station_name: String,
    pub station_id: Option<String>,
    /// Ingest timestamp of the source row (`dt_iso`).
    pub ingested_at: Option<String>,
    /// Values for [`TripTable::weather_columns`], in the same order.
    pub weather: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripTable {
    pub weather_columns: Vec<String>,
    pub records: Vec<TripRecord>,
}

impl TripTable {
    pub fn new(weather_columns: Vec<String>) -> Self {
        TripTable {
            weather_columns,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TripRecord) -> Result<()> {
        if record.weather.len() != self.weather_columns.len() {
            return Err(PipelineError::malformed(
                self.records.len(),
                format!(
                    "expected {} weather values, got {}",
                    self.weather_columns.len(),
                    record.weather.len()
                ),
            ));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Hourly weather observations keyed by UTC instant, for weather delivered
/// separately from trips.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherTable {
    pub weather_columns: Vec<String>,
    observations: BTreeMap<DateTime<Utc>, Vec<f64>>,
}

impl WeatherTable {
    pub fn new(weather_columns: Vec<String>) -> Self {
        WeatherTable {
            weather_columns,
            observations: BTreeMap::new(),
        }
    }

    /// Adds an observation. A second observation for the same instant is rejected.
    pub fn insert(&mut self, row: usize, at: DateTime<Utc>, values: Vec<f64>) -> Result<()> {
        if values.len() != self.weather_columns.len() {
            return Err(PipelineError::malformed(
                row,
                format!(
                    "expected {} weather values, got {}",
                    self.weather_columns.len(),
                    values.len()
                ),
            ));
        }
        if self.observations.contains_key(&at) {
            return Err(PipelineError::malformed(
                row,
                format!("duplicate weather observation for {}", at),
            ));
        }
        self.observations.insert(at, values);
        Ok(())
    }

    pub fn get(&self, at: &DateTime<Utc>) -> Option<&[f64]> {
        self.observations.get(at).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// A merged row with identifier columns removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub timestamp: String,
    pub weather: Vec<Option<f64>>,
    pub geohash: Option<String>,
}

/// The identifier-free table consumed by the assembler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    pub weather_columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
    /// Input row index of each row, after any global filtering.
    pub source_rows: Vec<usize>,
}

impl FeatureFrame {
    /// Builds a frame whose source rows are `0..rows.len()`.
    pub fn new(weather_columns: Vec<String>, rows: Vec<FeatureRow>) -> Self {
        let source_rows = (0..rows.len()).collect();
        FeatureFrame {
            weather_columns,
            rows,
            source_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Input row index for frame row `i`.
    pub fn source_row(&self, i: usize) -> usize {
        self.source_rows.get(i).copied().unwrap_or(i)
    }
}
