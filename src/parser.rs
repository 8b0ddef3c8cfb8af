//! CSV parsers for trip, station and weather tables.

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::records::{StationRecord, TripRecord, TripTable, WeatherTable};
use crate::time_features::parse_timestamp;

const TRIP_TIME_COLUMNS: [&str; 2] = ["hourly_data", "timestamp"];
const WEATHER_TIME_COLUMNS: [&str; 3] = ["dt_iso", "hourly_data", "timestamp"];
const STATION_NAME_COLUMNS: [&str; 2] = ["name", "station_name"];
const LAT_COLUMNS: [&str; 2] = ["lat", "latitude"];
const LON_COLUMNS: [&str; 2] = ["lon", "longitude"];

/// Decodes a station table (`name,lat,lon`).
///
/// # Errors
///
/// Returns [`PipelineError::MissingColumn`] if a required header is absent, or
/// a CSV error if a row does not deserialize.
pub fn parse_stations(bytes: &[u8]) -> Result<Vec<StationRecord>> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(bytes);
    let headers = rdr.headers()?.clone();

    for candidates in [&STATION_NAME_COLUMNS, &LAT_COLUMNS, &LON_COLUMNS] {
        find_any(&headers, candidates)
            .ok_or_else(|| PipelineError::MissingColumn(candidates[0].to_string()))?;
    }

    let mut stations = Vec::new();
    for result in rdr.deserialize() {
        let station: StationRecord = result?;
        stations.push(station);
    }

    debug!(stations = stations.len(), "Station table parsed");
    Ok(stations)
}

/// Decodes a trip table. `weather_columns` lists the measurements expected on
/// every row; pass an empty slice when weather is joined from a separate table.
pub fn parse_trips(bytes: &[u8], weather_columns: &[String]) -> Result<TripTable> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(bytes);
    let headers = rdr.headers()?.clone();

    let time_idx = find_any(&headers, &TRIP_TIME_COLUMNS)
        .ok_or_else(|| PipelineError::MissingColumn(TRIP_TIME_COLUMNS[0].to_string()))?;
    let name_idx = find(&headers, "station_name")
        .ok_or_else(|| PipelineError::MissingColumn("station_name".to_string()))?;
    let id_idx = find(&headers, "station_id");
    let ingest_idx = find(&headers, "dt_iso");
    let weather_idx = weather_indices(&headers, weather_columns)?;

    let mut table = TripTable::new(weather_columns.to_vec());

    for (row, result) in rdr.records().enumerate() {
        let record = result?;

        let timestamp = record.get(time_idx).unwrap_or_default().to_string();
        let station_name = record.get(name_idx).unwrap_or_default().to_string();
        if station_name.is_empty() {
            return Err(PipelineError::malformed(row, "empty station_name"));
        }

        let weather = weather_idx
            .iter()
            .zip(weather_columns)
            .map(|(&i, column)| parse_measurement(row, column, record.get(i)))
            .collect::<Result<Vec<_>>>()?;

        table.push(TripRecord {
            timestamp,
            station_name,
            station_id: optional_text(&record, id_idx),
            ingested_at: optional_text(&record, ingest_idx),
            weather,
        })?;
    }

    debug!(rows = table.len(), "Trip table parsed");
    Ok(table)
}

/// Decodes an hourly weather table keyed by `dt_iso` (or `hourly_data` / `timestamp`).
/// Every listed measurement must be present on every row.
pub fn parse_weather(bytes: &[u8], weather_columns: &[String]) -> Result<WeatherTable> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(bytes);
    let headers = rdr.headers()?.clone();

    let time_idx = find_any(&headers, &WEATHER_TIME_COLUMNS)
        .ok_or_else(|| PipelineError::MissingColumn(WEATHER_TIME_COLUMNS[0].to_string()))?;
    let weather_idx = weather_indices(&headers, weather_columns)?;

    let mut table = WeatherTable::new(weather_columns.to_vec());

    for (row, result) in rdr.records().enumerate() {
        let record = result?;

        let raw_time = record.get(time_idx).unwrap_or_default();
        let at = parse_timestamp(raw_time).ok_or_else(|| {
            PipelineError::malformed(row, format!("unparsable timestamp {:?}", raw_time))
        })?;

        let mut values = Vec::with_capacity(weather_columns.len());
        for (&i, column) in weather_idx.iter().zip(weather_columns) {
            let value = parse_measurement(row, column, record.get(i))?.ok_or_else(|| {
                PipelineError::malformed(row, format!("missing value for {}", column))
            })?;
            values.push(value);
        }

        table.insert(row, at, values)?;
    }

    debug!(rows = table.len(), "Weather table parsed");
    Ok(table)
}

fn find(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn find_any(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    names.iter().find_map(|name| find(headers, name))
}

fn weather_indices(headers: &StringRecord, weather_columns: &[String]) -> Result<Vec<usize>> {
    weather_columns
        .iter()
        .map(|column| {
            find(headers, column).ok_or_else(|| PipelineError::MissingColumn(column.clone()))
        })
        .collect()
}

fn optional_text(record: &StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// An empty cell is `None`; text that is not a finite number is rejected.
fn parse_measurement(row: usize, column: &str, raw: Option<&str>) -> Result<Option<f64>> {
    let raw = match raw {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(None),
    };

    let value: f64 = raw.parse().map_err(|_| {
        PipelineError::malformed(row, format!("{} is not a number: {:?}", column, raw))
    })?;

    if !value.is_finite() {
        return Err(PipelineError::malformed(
            row,
            format!("{} is not finite: {:?}", column, raw),
        ));
    }

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_stations_with_aliases() {
        let csv = "station_name,latitude,longitude,capacity\nClark/Lake,41.886,-87.630,23\n";
        let stations = parse_stations(csv.as_bytes()).unwrap();

        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].name, "Clark/Lake");
        assert_eq!(stations[0].lat, 41.886);
        assert_eq!(stations[0].lon, -87.630);
    }

    #[test]
    fn test_parse_stations_missing_column() {
        let csv = "name,lat\nClark/Lake,41.886\n";
        let err = parse_stations(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn(ref c) if c == "lon"));
    }

    #[test]
    fn test_parse_trips_reads_identifiers_and_weather() {
        let csv = "hourly_data,station_name,station_id,dt_iso,temp,humidity\n\
                   2023-01-15 12:00:00 UTC,Clark/Lake,42,2023-01-15 12:00:00 +0000 UTC,-3.5,80\n\
                   2023-01-15 13:00:00 UTC,Clark/Lake,42,,,81\n";
        let table = parse_trips(csv.as_bytes(), &columns(&["temp", "humidity"])).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.weather_columns, columns(&["temp", "humidity"]));

        let first = &table.records[0];
        assert_eq!(first.timestamp, "2023-01-15 12:00:00 UTC");
        assert_eq!(first.station_id.as_deref(), Some("42"));
        assert_eq!(first.weather, vec![Some(-3.5), Some(80.0)]);

        let second = &table.records[1];
        assert_eq!(second.ingested_at, None);
        assert_eq!(second.weather, vec![None, Some(81.0)]);
    }

    #[test]
    fn test_parse_trips_missing_weather_column() {
        let csv = "hourly_data,station_name,temp\n2023-01-15 12:00:00 UTC,Clark/Lake,1\n";
        let err = parse_trips(csv.as_bytes(), &columns(&["temp", "pressure"])).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn(ref c) if c == "pressure"));
    }

    #[test]
    fn test_parse_trips_rejects_non_numeric_weather() {
        let csv = "hourly_data,station_name,temp\n\
                   2023-01-15 12:00:00 UTC,Clark/Lake,1\n\
                   2023-01-15 13:00:00 UTC,Clark/Lake,warm\n";
        let err = parse_trips(csv.as_bytes(), &columns(&["temp"])).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { row: 1, .. }));
    }

    #[test]
    fn test_parse_trips_without_weather() {
        let csv = "timestamp,station_name\n2023-01-15T12:00:00Z,Clark/Lake\n";
        let table = parse_trips(csv.as_bytes(), &[]).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.records[0].weather.is_empty());
    }

    #[test]
    fn test_parse_weather_keys_by_instant() {
        let csv = "dt_iso,temp\n\
                   2023-01-15 12:00:00 +0000 UTC,-3.5\n\
                   2023-01-15 13:00:00 +0000 UTC,-2.0\n";
        let table = parse_weather(csv.as_bytes(), &columns(&["temp"])).unwrap();
        assert_eq!(table.len(), 2);

        let at = parse_timestamp("2023-01-15T13:00:00Z").unwrap();
        assert_eq!(table.get(&at), Some(&[-2.0][..]));
    }

    #[test]
    fn test_parse_weather_requires_values() {
        let csv = "dt_iso,temp\n2023-01-15 12:00:00 UTC,\n";
        let err = parse_weather(csv.as_bytes(), &columns(&["temp"])).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { row: 0, .. }));
    }
}
