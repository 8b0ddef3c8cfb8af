//! Geohash bucketing of stations and the station-name join.

use ::geohash::Coord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::config::MAX_GEOHASH_PRECISION;
use crate::error::{PipelineError, Result};
use crate::records::{StationRecord, TripRecord, TripTable};

/// Encodes a coordinate as a geohash of `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String> {
    if precision == 0 || precision > MAX_GEOHASH_PRECISION {
        return Err(PipelineError::Config(format!(
            "geohash precision must be between 1 and {}, got {}",
            MAX_GEOHASH_PRECISION, precision
        )));
    }
    // range checks are false for NaN
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(PipelineError::InvalidCoordinate { lat, lon });
    }

    ::geohash::encode(Coord { x: lon, y: lat }, precision)
        .map_err(|_| PipelineError::InvalidCoordinate { lat, lon })
}

/// A row of the station join table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeohashEntry {
    pub station_name: String,
    pub geohash: String,
}

/// Read-only map from station name to geohash at a fixed precision.
#[derive(Debug, Clone, PartialEq)]
pub struct StationGeohashIndex {
    precision: usize,
    codes: BTreeMap<String, String>,
}

impl StationGeohashIndex {
    /// Builds the index from the full station table.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateStation`] if one name appears with two
    /// different coordinates, [`PipelineError::InvalidCoordinate`] for
    /// out-of-range coordinates.
    pub fn build(stations: &[StationRecord], precision: usize) -> Result<Self> {
        let mut codes = BTreeMap::new();
        let mut coords: BTreeMap<&str, (f64, f64)> = BTreeMap::new();

        for station in stations {
            if let Some(&(lat, lon)) = coords.get(station.name.as_str()) {
                if lat != station.lat || lon != station.lon {
                    return Err(PipelineError::DuplicateStation {
                        name: station.name.clone(),
                    });
                }
                debug!(station = %station.name, "Station listed twice with identical coordinates");
                continue;
            }

            let code = encode(station.lat, station.lon, precision)?;
            coords.insert(station.name.as_str(), (station.lat, station.lon));
            codes.insert(station.name.clone(), code);
        }

        let cells: BTreeSet<&String> = codes.values().collect();
        info!(
            stations = codes.len(),
            cells = cells.len(),
            precision,
            "Station geohash index built"
        );

        Ok(StationGeohashIndex { precision, codes })
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    pub fn get(&self, station_name: &str) -> Option<&str> {
        self.codes.get(station_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// The join table, sorted by station name.
    pub fn entries(&self) -> Vec<GeohashEntry> {
        self.codes
            .iter()
            .map(|(name, code)| GeohashEntry {
                station_name: name.clone(),
                geohash: code.clone(),
            })
            .collect()
    }

    /// Left-joins trips to the index on exact station name.
    pub fn merge<'a>(&'a self, trips: &'a TripTable) -> MergedTrips<'a> {
        let mut rows = Vec::with_capacity(trips.len());
        let mut unmatched_rows = Vec::new();
        let mut unmatched_names = BTreeSet::new();

        for (i, trip) in trips.records.iter().enumerate() {
            let geohash = self.get(&trip.station_name);
            if geohash.is_none() {
                unmatched_rows.push(i);
                unmatched_names.insert(trip.station_name.as_str());
            }
            rows.push(MergedTrip { trip, geohash });
        }

        if !unmatched_rows.is_empty() {
            warn!(
                rows = unmatched_rows.len(),
                stations = ?unmatched_names,
                "Trips reference stations missing from the station table"
            );
        }

        MergedTrips {
            rows,
            unmatched_rows,
        }
    }
}

/// A trip with its joined geohash. `None` means the station was not found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedTrip<'a> {
    pub trip: &'a TripRecord,
    pub geohash: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedTrips<'a> {
    pub rows: Vec<MergedTrip<'a>>,
    /// Input rows whose station had no geohash.
    pub unmatched_rows: Vec<usize>,
}
