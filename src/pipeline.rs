//! Top-level preprocessing.
//!
//! Builds the station index once, attaches weather, left-joins geohashes,
//! drops identifier columns, runs the assembler and finally caps any
//! non-finite cell. Each stage returns a new owned value.

use tracing::{info, warn};

use crate::assembler::{AssembledFeatures, FeatureAssembler, FeatureMatrix, FittedAssembler};
use crate::config::{MissingStationPolicy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::geohash::StationGeohashIndex;
use crate::records::{FeatureFrame, FeatureRow, StationRecord, TripTable, WeatherTable};
use crate::stats::TransformReport;
use crate::time_features::parse_timestamp;

/// Where the weather measurements come from.
#[derive(Debug, Clone, Copy)]
pub enum WeatherSource<'a> {
    /// Already present as columns of the trip table.
    Attached,
    /// Looked up by the trip's UTC instant.
    Join(&'a WeatherTable),
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub fitted: FittedAssembler,
    pub matrix: FeatureMatrix,
    pub index: StationGeohashIndex,
    pub report: TransformReport,
}

#[derive(Debug, Clone)]
pub struct PreprocessingPipeline {
    config: PipelineConfig,
}

impl PreprocessingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(PreprocessingPipeline { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn build_index(&self, stations: &[StationRecord]) -> Result<StationGeohashIndex> {
        StationGeohashIndex::build(stations, self.config.geohash_precision)
    }

    /// Fits a new assembler on `trips` and returns it with the training matrix.
    #[tracing::instrument(skip_all, fields(trips = trips.len(), stations = stations.len()))]
    pub fn run(
        &self,
        trips: &TripTable,
        stations: &[StationRecord],
        weather: WeatherSource<'_>,
    ) -> Result<PipelineOutput> {
        let index = self.build_index(stations)?;
        let (frame, prepared) = self.prepare(trips, &index, weather)?;

        let mut assembler = FeatureAssembler::new(&self.config)?;
        let (fitted, assembled) = assembler.fit_transform(&frame)?;
        let (matrix, report) = self.finish(assembled, prepared);
        report.log_summary();

        Ok(PipelineOutput {
            fitted,
            matrix,
            index,
            report,
        })
    }

    /// Applies a previously fitted assembler.
    pub fn transform(
        &self,
        trips: &TripTable,
        stations: &[StationRecord],
        weather: WeatherSource<'_>,
        fitted: &FittedAssembler,
    ) -> Result<(FeatureMatrix, TransformReport)> {
        let index = self.build_index(stations)?;
        self.transform_with_index(trips, &index, weather, fitted)
    }

    /// Like [`PreprocessingPipeline::transform`], reusing an already built index.
    #[tracing::instrument(skip_all, fields(trips = trips.len()))]
    pub fn transform_with_index(
        &self,
        trips: &TripTable,
        index: &StationGeohashIndex,
        weather: WeatherSource<'_>,
        fitted: &FittedAssembler,
    ) -> Result<(FeatureMatrix, TransformReport)> {
        self.check_fitted(fitted, index)?;

        let (frame, prepared) = self.prepare(trips, index, weather)?;
        let assembled = if self.config.parallel {
            fitted.transform(&frame)?
        } else {
            fitted.transform_sequential(&frame)?
        };
        let (matrix, report) = self.finish(assembled, prepared);
        report.log_summary();

        Ok((matrix, report))
    }

    /// Attaches weather, joins geohashes, applies the missing-station policy
    /// and drops the identifier columns. Row filtering happens here and
    /// nowhere else.
    pub fn prepare(
        &self,
        trips: &TripTable,
        index: &StationGeohashIndex,
        weather: WeatherSource<'_>,
    ) -> Result<(FeatureFrame, TransformReport)> {
        let weather_rows = self.attach_weather(trips, weather)?;
        let merged = index.merge(trips);

        let mut report = TransformReport {
            input_rows: trips.len(),
            unmatched_stations: merged.unmatched_rows.len(),
            ..Default::default()
        };

        let mut rows = Vec::with_capacity(trips.len());
        let mut source_rows = Vec::with_capacity(trips.len());

        for (i, (joined, weather)) in merged.rows.into_iter().zip(weather_rows).enumerate() {
            if joined.geohash.is_none() && self.config.missing_station_policy == MissingStationPolicy::Drop {
                report.dropped_rows += 1;
                continue;
            }
            rows.push(FeatureRow {
                timestamp: joined.trip.timestamp.clone(),
                weather,
                geohash: joined.geohash.map(str::to_string),
            });
            source_rows.push(i);
        }

        if report.dropped_rows > 0 {
            info!(dropped = report.dropped_rows, "Dropped trips with unknown stations");
        }

        let frame = FeatureFrame {
            weather_columns: self.config.weather_columns.clone(),
            rows,
            source_rows,
        };
        Ok((frame, report))
    }

    /// Weather values per trip, in configured column order.
    fn attach_weather(&self, trips: &TripTable, weather: WeatherSource<'_>) -> Result<Vec<Vec<Option<f64>>>> {
        match weather {
            WeatherSource::Attached => {
                let idx = project(&self.config.weather_columns, &trips.weather_columns)?;
                Ok(trips
                    .records
                    .iter()
                    .map(|r| idx.iter().map(|&j| r.weather.get(j).copied().flatten()).collect())
                    .collect())
            }
            WeatherSource::Join(table) => {
                let idx = project(&self.config.weather_columns, &table.weather_columns)?;
                trips
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        let at = parse_timestamp(&r.timestamp).ok_or_else(|| {
                            PipelineError::malformed(i, format!("unparsable timestamp {:?}", r.timestamp))
                        })?;
                        let values = table.get(&at).ok_or_else(|| {
                            PipelineError::malformed(i, format!("no weather observation for {}", at))
                        })?;
                        Ok(idx.iter().map(|&j| values.get(j).copied()).collect())
                    })
                    .collect()
            }
        }
    }

    fn check_fitted(&self, fitted: &FittedAssembler, index: &StationGeohashIndex) -> Result<()> {
        fitted.validate()?;

        if fitted.geohash_precision() != Some(index.precision()) {
            return Err(PipelineError::SchemaMismatch(format!(
                "fitted geohash precision {:?} differs from index precision {}",
                fitted.geohash_precision(),
                index.precision()
            )));
        }

        let tz = self.config.tz()?;
        if fitted.time_zone() != Some(tz) {
            return Err(PipelineError::SchemaMismatch(format!(
                "fitted time zone {:?} differs from configured {}",
                fitted.time_zone(),
                tz
            )));
        }

        if fitted.weather_columns() != self.config.weather_columns {
            return Err(PipelineError::SchemaMismatch(format!(
                "fitted weather columns {:?} differ from configured {:?}",
                fitted.weather_columns(),
                self.config.weather_columns
            )));
        }

        Ok(())
    }

    fn finish(
        &self,
        assembled: AssembledFeatures,
        prepared: TransformReport,
    ) -> (FeatureMatrix, TransformReport) {
        let AssembledFeatures { mut matrix, mut report } = assembled;

        report.input_rows = prepared.input_rows;
        report.unmatched_stations = prepared.unmatched_stations;
        report.dropped_rows = prepared.dropped_rows;
        report.non_finite_replaced = cap_non_finite(&mut matrix, self.config.non_finite_cap);

        (matrix, report)
    }
}

/// Position of each wanted column in `available`.
fn project(wanted: &[String], available: &[String]) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|column| {
            available
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| PipelineError::MissingColumn(column.clone()))
        })
        .collect()
}

/// Replaces non-finite cells: `+inf` and `NaN` become `cap`, `-inf` becomes `-cap`.
/// Returns the number of cells replaced.
pub fn cap_non_finite(matrix: &mut FeatureMatrix, cap: f64) -> usize {
    let mut replaced = 0;
    for value in matrix.values_mut() {
        if !value.is_finite() {
            *value = if *value == f64::NEG_INFINITY { -cap } else { cap };
            replaced += 1;
        }
    }

    if replaced > 0 {
        warn!(replaced, cap, "Replaced non-finite feature values");
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TripRecord;

    fn config() -> PipelineConfig {
        PipelineConfig {
            weather_columns: vec!["temp".to_string(), "humidity".to_string()],
            ..Default::default()
        }
    }

    fn stations() -> Vec<StationRecord> {
        vec![
            StationRecord::new("Clark/Lake", 41.886, -87.630),
            StationRecord::new("Wrigley Field", 41.948, -87.655),
        ]
    }

    fn trip(ts: &str, station: &str, weather: Vec<Option<f64>>) -> TripRecord {
        TripRecord {
            timestamp: ts.to_string(),
            station_name: station.to_string(),
            station_id: Some("1".to_string()),
            ingested_at: Some(ts.to_string()),
            weather,
        }
    }

    fn trips() -> TripTable {
        let mut table = TripTable::new(vec!["temp".to_string(), "humidity".to_string()]);
        table
            .push(trip("2023-01-15 12:00:00 UTC", "Clark/Lake", vec![Some(-3.0), Some(80.0)]))
            .unwrap();
        table
            .push(trip("2023-01-15 13:00:00 UTC", "Wrigley Field", vec![Some(-1.0), Some(75.0)]))
            .unwrap();
        table
            .push(trip("2023-01-15 14:00:00 UTC", "Nowhere St", vec![Some(1.0), Some(70.0)]))
            .unwrap();
        table
    }

    #[test]
    fn test_run_joins_and_drops_identifiers() {
        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let out = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap();

        assert_eq!(out.matrix.n_rows(), 3);
        assert_eq!(out.index.get("Clark/Lake"), Some("dp3wm"));
        for identifier in ["station_name", "station_id", "dt_iso"] {
            assert!(out.matrix.column_index(identifier).is_none());
        }

        assert_eq!(out.report.unmatched_stations, 1);
        assert_eq!(out.report.missing_geohash, 1);
        assert_eq!(out.report.dropped_rows, 0);

        let geohash_cols: Vec<usize> = out
            .matrix
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with("geohash_"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(geohash_cols.len(), 2);
        assert!(geohash_cols.iter().all(|&c| out.matrix.get(2, c) == Some(0.0)));
    }

    #[test]
    fn test_drop_policy_filters_once_and_tracks_source_rows() {
        let pipeline = PreprocessingPipeline::new(PipelineConfig {
            missing_station_policy: MissingStationPolicy::Drop,
            ..config()
        })
        .unwrap();
        let out = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap();

        assert_eq!(out.matrix.n_rows(), 2);
        assert_eq!(out.matrix.source_rows(), &[0, 1]);
        assert_eq!(out.report.dropped_rows, 1);
        assert_eq!(out.report.missing_geohash, 0);
    }

    #[test]
    fn test_missing_weather_column_is_reported() {
        let pipeline = PreprocessingPipeline::new(PipelineConfig {
            weather_columns: vec!["temp".to_string(), "pressure".to_string()],
            ..config()
        })
        .unwrap();
        let err = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn(ref c) if c == "pressure"));
    }

    #[test]
    fn test_weather_join_by_instant() {
        let mut weather = WeatherTable::new(vec!["humidity".to_string(), "temp".to_string()]);
        for (hour, temp) in [(12, -3.0), (13, -1.0), (14, 1.0)] {
            let at = parse_timestamp(&format!("2023-01-15 {}:00:00 UTC", hour)).unwrap();
            weather.insert(hour, at, vec![70.0, temp]).unwrap();
        }

        let mut bare = TripTable::new(vec![]);
        for record in trips().records {
            bare.push(TripRecord { weather: vec![], ..record }).unwrap();
        }

        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let out = pipeline.run(&bare, &stations(), WeatherSource::Join(&weather)).unwrap();

        // humidity is constant in the joined table
        assert_eq!(out.fitted.degenerate_columns(), vec!["humidity"]);
        assert_eq!(out.matrix.column("humidity").unwrap(), vec![70.0, 70.0, 70.0]);
        let temp = out.matrix.column("temp").unwrap();
        assert!(temp[0] < 0.0 && temp[1].abs() < 1e-12 && temp[2] > 0.0);
    }

    #[test]
    fn test_weather_join_requires_observation() {
        let weather = WeatherTable::new(vec!["temp".to_string(), "humidity".to_string()]);
        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let err = pipeline
            .run(&trips(), &stations(), WeatherSource::Join(&weather))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { row: 0, .. }));
    }

    #[test]
    fn test_transform_reuses_fitted_state() {
        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let out = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap();

        let (matrix, report) = pipeline
            .transform_with_index(&trips(), &out.index, WeatherSource::Attached, &out.fitted)
            .unwrap();
        assert_eq!(matrix, out.matrix);
        assert_eq!(report.rows, 3);
    }

    #[test]
    fn test_transform_rejects_changed_precision() {
        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let out = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap();

        let finer = PreprocessingPipeline::new(PipelineConfig {
            geohash_precision: 6,
            ..config()
        })
        .unwrap();
        let err = finer
            .transform(&trips(), &stations(), WeatherSource::Attached, &out.fitted)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn test_transform_rejects_changed_time_zone() {
        let pipeline = PreprocessingPipeline::new(config()).unwrap();
        let out = pipeline.run(&trips(), &stations(), WeatherSource::Attached).unwrap();

        let elsewhere = PreprocessingPipeline::new(PipelineConfig {
            time_zone: "Europe/Paris".to_string(),
            ..config()
        })
        .unwrap();
        let err = elsewhere
            .transform(&trips(), &stations(), WeatherSource::Attached, &out.fitted)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn test_cap_non_finite() {
        let overflow = 1e308_f64 * 1e308_f64;
        assert!(overflow.is_infinite());

        let mut matrix = FeatureMatrix::from_parts(
            vec!["a".to_string(), "b".to_string()],
            vec![overflow, 1.5, -overflow, f64::NAN],
            vec![0, 1],
        );
        let replaced = cap_non_finite(&mut matrix, 1000.0);

        assert_eq!(replaced, 3);
        assert_eq!(matrix.values(), &[1000.0, 1.5, -1000.0, 1000.0]);
    }

    fn temp_trips(temps: &[f64]) -> TripTable {
        let mut table = TripTable::new(vec!["temp".to_string()]);
        for (hour, temp) in temps.iter().enumerate() {
            let ts = format!("2023-01-15 {:02}:00:00 UTC", hour);
            table.push(trip(&ts, "Clark/Lake", vec![Some(*temp)])).unwrap();
        }
        table
    }

    fn temp_config() -> PipelineConfig {
        PipelineConfig {
            weather_columns: vec!["temp".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_run_on_huge_finite_weather() {
        let pipeline = PreprocessingPipeline::new(temp_config()).unwrap();
        let out = pipeline
            .run(&temp_trips(&[1e200, -1e200, 0.0]), &stations(), WeatherSource::Attached)
            .unwrap();

        assert!(out.fitted.degenerate_columns().is_empty());
        let temp = out.matrix.column("temp").unwrap();
        assert!(temp.iter().all(|v| v.is_finite()));
        assert_eq!(temp[2], 0.0);
        assert_eq!(out.report.non_finite_replaced, 0);
    }

    #[test]
    fn test_transform_caps_overflowing_cells() {
        let pipeline = PreprocessingPipeline::new(temp_config()).unwrap();
        let out = pipeline
            .run(&temp_trips(&[0.0, 1.0, 2.0]), &stations(), WeatherSource::Attached)
            .unwrap();

        // (-1.7e308 - 1) / std overflows to -inf
        let (matrix, report) = pipeline
            .transform_with_index(&temp_trips(&[-1.7e308]), &out.index, WeatherSource::Attached, &out.fitted)
            .unwrap();

        assert_eq!(matrix.column("temp").unwrap(), vec![-1000.0]);
        assert_eq!(report.non_finite_replaced, 1);
        assert!(matrix.values().iter().all(|v| v.is_finite()));
    }
}
