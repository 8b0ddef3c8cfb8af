//! Feature assembly.
//!
//! [`FeatureAssembler`] fits the three column groups (time, weather, geohash)
//! and concatenates their blocks in that fixed order. The learned state lives
//! in [`FittedAssembler`], which is serializable and must be reused unchanged
//! for every later transform.

pub mod groups;
pub mod matrix;
pub mod onehot;
pub mod scaler;

pub use groups::{ColumnGroup, FittedGroup, GroupBlock};
pub use matrix::FeatureMatrix;
pub use onehot::OneHotEncoder;
pub use scaler::ColumnScale;

use chrono_tz::Tz;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, UnknownCategoryPolicy};
use crate::error::{PipelineError, Result};
use crate::records::FeatureFrame;
use crate::stats::TransformReport;
use groups::{DAYS_OF_WEEK, GEOHASH_GROUP, MONTHS, TIME_GROUP, WEATHER_GROUP};

pub const SCHEMA_VERSION: u32 = 1;

const GROUP_ORDER: [&str; 3] = [TIME_GROUP, WEATHER_GROUP, GEOHASH_GROUP];

/// Output of one transform call.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFeatures {
    pub matrix: FeatureMatrix,
    pub report: TransformReport,
}

/// Learned statistics and vocabularies, one entry per group in output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedAssembler {
    schema_version: u32,
    unknown_category_policy: UnknownCategoryPolicy,
    groups: Vec<FittedGroup>,
}

impl FittedAssembler {
    /// Checks that the state has the declared group order and canonical vocabularies.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(PipelineError::SchemaMismatch(format!(
                "fitted schema version {} is not supported (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        let names: Vec<&str> = self.groups.iter().map(FittedGroup::name).collect();
        if names != GROUP_ORDER {
            return Err(PipelineError::SchemaMismatch(format!(
                "fitted groups {:?} are not in the order {:?}",
                names, GROUP_ORDER
            )));
        }

        for group in &self.groups {
            match group {
                FittedGroup::Time(t) => {
                    if t.day_of_week.categories() != DAYS_OF_WEEK.collect::<Vec<_>>()
                        || t.month.categories() != MONTHS.collect::<Vec<_>>()
                    {
                        return Err(PipelineError::SchemaMismatch(
                            "calendar vocabulary is not the full calendar domain".to_string(),
                        ));
                    }
                }
                FittedGroup::Weather(w) => {
                    if w.scales.is_empty() {
                        return Err(PipelineError::SchemaMismatch(
                            "fitted weather group has no columns".to_string(),
                        ));
                    }
                    if let Some(bad) = w
                        .scales
                        .iter()
                        .find(|s| !s.mean.is_finite() || !s.std.is_finite())
                    {
                        return Err(PipelineError::SchemaMismatch(format!(
                            "weather column {} has non-finite statistics",
                            bad.name
                        )));
                    }
                }
                FittedGroup::Geohash(g) => {
                    if !g.vocabulary.is_canonical() {
                        return Err(PipelineError::SchemaMismatch(
                            "geohash vocabulary is not sorted and unique".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn unknown_category_policy(&self) -> UnknownCategoryPolicy {
        self.unknown_category_policy
    }

    pub fn groups(&self) -> &[FittedGroup] {
        &self.groups
    }

    pub fn time_zone(&self) -> Option<Tz> {
        self.groups.iter().find_map(|g| match g {
            FittedGroup::Time(t) => Some(t.time_zone),
            _ => None,
        })
    }

    pub fn geohash_precision(&self) -> Option<usize> {
        self.groups.iter().find_map(|g| match g {
            FittedGroup::Geohash(h) => Some(h.precision),
            _ => None,
        })
    }

    pub fn geohash_vocabulary(&self) -> &[String] {
        self.groups
            .iter()
            .find_map(|g| match g {
                FittedGroup::Geohash(h) => Some(h.vocabulary.categories()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn weather_scales(&self) -> &[ColumnScale] {
        self.groups
            .iter()
            .find_map(|g| match g {
                FittedGroup::Weather(w) => Some(w.scales.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn weather_columns(&self) -> Vec<String> {
        self.weather_scales().iter().map(|s| s.name.clone()).collect()
    }

    pub fn degenerate_columns(&self) -> Vec<String> {
        self.weather_scales()
            .iter()
            .filter(|s| s.degenerate)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Output column names, in matrix order.
    pub fn feature_names(&self) -> Vec<String> {
        self.groups.iter().flat_map(FittedGroup::output_columns).collect()
    }

    pub fn n_features(&self) -> usize {
        self.groups.iter().map(FittedGroup::width).sum()
    }

    /// Transforms a frame, running the groups on the rayon pool.
    pub fn transform(&self, frame: &FeatureFrame) -> Result<AssembledFeatures> {
        self.transform_with(frame, true)
    }

    /// Transforms a frame on the calling thread.
    pub fn transform_sequential(&self, frame: &FeatureFrame) -> Result<AssembledFeatures> {
        self.transform_with(frame, false)
    }

    fn transform_with(&self, frame: &FeatureFrame, parallel: bool) -> Result<AssembledFeatures> {
        self.validate()?;

        let expected = self.weather_columns();
        if frame.weather_columns != expected {
            return Err(PipelineError::SchemaMismatch(format!(
                "input weather columns {:?} do not match fitted columns {:?}",
                frame.weather_columns, expected
            )));
        }

        let n_rows = frame.len();
        if frame.source_rows.len() != n_rows {
            return Err(PipelineError::RowCountMismatch {
                group: "frame",
                expected: n_rows,
                actual: frame.source_rows.len(),
            });
        }

        let policy = self.unknown_category_policy;
        let blocks: Vec<GroupBlock> = if parallel {
            self.groups
                .par_iter()
                .map(|g| g.transform(frame, policy))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.groups
                .iter()
                .map(|g| g.transform(frame, policy))
                .collect::<Result<Vec<_>>>()?
        };

        for block in &blocks {
            if block.values.len() != n_rows * block.width {
                let actual = if block.width == 0 {
                    0
                } else {
                    block.values.len() / block.width
                };
                return Err(PipelineError::RowCountMismatch {
                    group: block.group,
                    expected: n_rows,
                    actual,
                });
            }
        }

        let n_cols: usize = blocks.iter().map(|b| b.width).sum();
        let mut values = Vec::with_capacity(n_rows * n_cols);
        for i in 0..n_rows {
            for block in &blocks {
                values.extend_from_slice(&block.values[i * block.width..(i + 1) * block.width]);
            }
        }

        let mut report = TransformReport {
            input_rows: n_rows,
            rows: n_rows,
            columns: n_cols,
            degenerate_columns: self.degenerate_columns(),
            ..Default::default()
        };
        for block in &blocks {
            match block.group {
                TIME_GROUP => report.unknown_calendar += block.unknown,
                GEOHASH_GROUP => {
                    report.unknown_geohash += block.unknown;
                    report.missing_geohash += block.missing;
                }
                _ => {}
            }
        }

        if report.unknown_geohash > 0 || report.missing_geohash > 0 {
            warn!(
                unknown = report.unknown_geohash,
                missing = report.missing_geohash,
                rows = n_rows,
                "Rows encoded with an all-zero geohash block"
            );
        }
        debug!(rows = n_rows, columns = n_cols, "Feature matrix assembled");

        let matrix = FeatureMatrix::from_parts(self.feature_names(), values, frame.source_rows.clone());
        Ok(AssembledFeatures { matrix, report })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Restores a persisted state and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let fitted: FittedAssembler = serde_json::from_str(json)?;
        fitted.validate()?;
        Ok(fitted)
    }
}

/// Holds the group definitions and, once fit, the learned state.
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    groups: Vec<ColumnGroup>,
    unknown_category_policy: UnknownCategoryPolicy,
    parallel: bool,
    fitted: Option<FittedAssembler>,
}

impl FeatureAssembler {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let groups = vec![
            ColumnGroup::Time { tz: config.tz()? },
            ColumnGroup::Weather {
                columns: config.weather_columns.clone(),
            },
            ColumnGroup::Geohash {
                precision: config.geohash_precision,
            },
        ];

        Ok(FeatureAssembler {
            groups,
            unknown_category_policy: config.unknown_category_policy,
            parallel: config.parallel,
            fitted: None,
        })
    }

    pub fn groups(&self) -> &[ColumnGroup] {
        &self.groups
    }

    pub fn fitted(&self) -> Option<&FittedAssembler> {
        self.fitted.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn into_fitted(self) -> Option<FittedAssembler> {
        self.fitted
    }

    /// Learns weather statistics and the geohash vocabulary. Replaces any
    /// previous fit.
    pub fn fit(&mut self, frame: &FeatureFrame) -> Result<&FittedAssembler> {
        if frame.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        let groups = if self.parallel {
            self.groups
                .par_iter()
                .map(|g| g.fit(frame))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.groups
                .iter()
                .map(|g| g.fit(frame))
                .collect::<Result<Vec<_>>>()?
        };

        let fitted = FittedAssembler {
            schema_version: SCHEMA_VERSION,
            unknown_category_policy: self.unknown_category_policy,
            groups,
        };
        fitted.validate()?;

        for column in fitted.degenerate_columns() {
            warn!(column = %column, "Zero variance at fit time, column passes through unscaled");
        }
        info!(
            rows = frame.len(),
            features = fitted.n_features(),
            geohash_cells = fitted.geohash_vocabulary().len(),
            "Assembler fit"
        );

        Ok(self.fitted.insert(fitted))
    }

    /// # Errors
    ///
    /// [`PipelineError::NotFitted`] if [`FeatureAssembler::fit`] was never called.
    pub fn transform(&self, frame: &FeatureFrame) -> Result<AssembledFeatures> {
        let fitted = self.fitted.as_ref().ok_or(PipelineError::NotFitted)?;
        fitted.transform_with(frame, self.parallel)
    }

    pub fn fit_transform(&mut self, frame: &FeatureFrame) -> Result<(FittedAssembler, AssembledFeatures)> {
        let fitted = self.fit(frame)?.clone();
        let assembled = fitted.transform_with(frame, self.parallel)?;
        Ok((fitted, assembled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FeatureRow;

    fn config(weather: &[&str]) -> PipelineConfig {
        PipelineConfig {
            time_zone: "UTC".to_string(),
            weather_columns: weather.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn row(ts: &str, weather: &[f64], geohash: Option<&str>) -> FeatureRow {
        FeatureRow {
            timestamp: ts.to_string(),
            weather: weather.iter().map(|v| Some(*v)).collect(),
            geohash: geohash.map(str::to_string),
        }
    }

    fn training_frame() -> FeatureFrame {
        FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![
                row("2024-03-04 06:00:00 UTC", &[10.0, 70.0], Some("dp3wq")),
                row("2024-03-05 18:00:00 UTC", &[20.0, 80.0], Some("dp3wm")),
                row("2024-07-06 23:00:00 UTC", &[30.0, 90.0], Some("dp3tv")),
            ],
        )
    }

    fn fitted_assembler() -> FeatureAssembler {
        let mut assembler = FeatureAssembler::new(&config(&["temp", "humidity"])).unwrap();
        assembler.fit(&training_frame()).unwrap();
        assembler
    }

    #[test]
    fn test_column_order() {
        let assembler = fitted_assembler();
        let names = assembler.fitted().unwrap().feature_names();

        assert_eq!(names.len(), 7 + 12 + 2 + 2 + 3);
        assert_eq!(names[0], "dow_0");
        assert_eq!(names[6], "dow_6");
        assert_eq!(names[7], "month_1");
        assert_eq!(names[18], "month_12");
        assert_eq!(names[19], "hour_sin");
        assert_eq!(names[20], "hour_cos");
        assert_eq!(names[21], "temp");
        assert_eq!(names[22], "humidity");
        assert_eq!(names[23..], ["geohash_dp3tv", "geohash_dp3wm", "geohash_dp3wq"]);
    }

    #[test]
    fn test_weather_standardized_with_fit_statistics() {
        let assembler = fitted_assembler();
        let out = assembler.transform(&training_frame()).unwrap();

        let temp = out.matrix.column("temp").unwrap();
        let expected = 10.0 / (200.0_f64 / 3.0).sqrt();
        assert!((temp[0] + expected).abs() < 1e-12);
        assert!(temp[1].abs() < 1e-12);
        assert!((temp[2] - expected).abs() < 1e-12);

        // Later batches reuse the fit-time statistics verbatim.
        let later = FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![row("2024-03-04 06:00:00 UTC", &[20.0, 100.0], Some("dp3wm"))],
        );
        let out = assembler.transform(&later).unwrap();
        assert!(out.matrix.column("temp").unwrap()[0].abs() < 1e-12);
        assert!((out.matrix.column("humidity").unwrap()[0] - 2.0 * expected).abs() < 1e-12);
    }

    #[test]
    fn test_transform_before_fit_is_an_error() {
        let assembler = FeatureAssembler::new(&config(&["temp", "humidity"])).unwrap();
        assert!(!assembler.is_fitted());
        let err = assembler.transform(&training_frame()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFitted));
    }

    #[test]
    fn test_fit_on_empty_frame_fails() {
        let mut assembler = FeatureAssembler::new(&config(&["temp"])).unwrap();
        let empty = FeatureFrame::new(vec!["temp".to_string()], vec![]);
        assert!(matches!(assembler.fit(&empty), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn test_empty_transform_keeps_schema() {
        let assembler = fitted_assembler();
        let empty = FeatureFrame::new(vec!["temp".to_string(), "humidity".to_string()], vec![]);
        let out = assembler.transform(&empty).unwrap();
        assert_eq!(out.matrix.n_rows(), 0);
        assert_eq!(out.matrix.n_cols(), 26);
    }

    #[test]
    fn test_column_layout_independent_of_categories_present() {
        let assembler = fitted_assembler();
        let fitted = assembler.fitted().unwrap();

        let subset = FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![row("2024-12-01 00:00:00 UTC", &[5.0, 50.0], Some("dp3wm"))],
        );
        let out = assembler.transform(&subset).unwrap();

        assert_eq!(out.matrix.columns(), fitted.feature_names().as_slice());
        assert_eq!(out.matrix.n_cols(), fitted.n_features());
        let dp3wm = out.matrix.column_index("geohash_dp3wm").unwrap();
        assert_eq!(out.matrix.get(0, dp3wm), Some(1.0));
    }

    #[test]
    fn test_unknown_geohash_is_all_zero_under_ignore() {
        let assembler = fitted_assembler();
        let frame = FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![
                row("2024-03-04 06:00:00 UTC", &[10.0, 70.0], Some("zzzzz")),
                row("2024-03-04 07:00:00 UTC", &[10.0, 70.0], None),
            ],
        );
        let out = assembler.transform(&frame).unwrap();

        for r in out.matrix.rows() {
            assert!(r[23..].iter().all(|v| *v == 0.0));
        }
        assert_eq!(out.report.unknown_geohash, 1);
        assert_eq!(out.report.missing_geohash, 1);
    }

    #[test]
    fn test_unknown_geohash_errors_under_error_policy() {
        let mut cfg = config(&["temp", "humidity"]);
        cfg.unknown_category_policy = UnknownCategoryPolicy::Error;
        let mut assembler = FeatureAssembler::new(&cfg).unwrap();
        assembler.fit(&training_frame()).unwrap();

        let frame = FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![row("2024-03-04 06:00:00 UTC", &[10.0, 70.0], Some("zzzzz"))],
        );
        let err = assembler.transform(&frame).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownCategory { ref value, .. } if value == "zzzzz"));
    }

    #[test]
    fn test_fit_transform_then_transform_is_identical() {
        let mut assembler = FeatureAssembler::new(&config(&["temp", "humidity"])).unwrap();
        let frame = training_frame();

        let (fitted, first) = assembler.fit_transform(&frame).unwrap();
        let second = fitted.transform(&frame).unwrap();
        let third = assembler.transform(&frame).unwrap();

        assert_eq!(first.matrix, second.matrix);
        assert_eq!(first.matrix, third.matrix);
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let assembler = fitted_assembler();
        let fitted = assembler.fitted().unwrap();
        let frame = training_frame();

        assert_eq!(
            fitted.transform(&frame).unwrap().matrix,
            fitted.transform_sequential(&frame).unwrap().matrix
        );
    }

    #[test]
    fn test_zero_variance_column_passes_through() {
        let mut assembler = FeatureAssembler::new(&config(&["temp"])).unwrap();
        let fit_frame = FeatureFrame::new(
            vec!["temp".to_string()],
            vec![
                row("2024-03-04 06:00:00 UTC", &[10.0], None),
                row("2024-03-04 07:00:00 UTC", &[10.0], None),
                row("2024-03-04 08:00:00 UTC", &[10.0], None),
            ],
        );
        let fitted = assembler.fit(&fit_frame).unwrap();
        assert_eq!(fitted.degenerate_columns(), vec!["temp"]);
        assert!(fitted.weather_scales()[0].degenerate);

        let frame = FeatureFrame::new(
            vec!["temp".to_string()],
            vec![row("2024-03-04 09:00:00 UTC", &[10.0], None)],
        );
        let out = assembler.transform(&frame).unwrap();
        assert_eq!(out.matrix.column("temp").unwrap(), vec![10.0]);
        assert_eq!(out.report.degenerate_columns, vec!["temp"]);
    }

    #[test]
    fn test_weather_schema_mismatch_is_fatal() {
        let assembler = fitted_assembler();
        let frame = FeatureFrame::new(
            vec!["humidity".to_string(), "temp".to_string()],
            vec![row("2024-03-04 06:00:00 UTC", &[70.0, 10.0], None)],
        );
        let err = assembler.transform(&frame).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }

    #[test]
    fn test_malformed_timestamp_reports_source_row() {
        let assembler = fitted_assembler();
        let mut frame = FeatureFrame::new(
            vec!["temp".to_string(), "humidity".to_string()],
            vec![
                row("2024-03-04 06:00:00 UTC", &[10.0, 70.0], None),
                row("soon", &[10.0, 70.0], None),
            ],
        );
        frame.source_rows = vec![4, 9];

        let err = assembler.transform(&frame).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedInput { row: 9, .. }));
    }

    #[test]
    fn test_json_round_trip_preserves_transform() {
        let assembler = fitted_assembler();
        let fitted = assembler.fitted().unwrap();

        let restored = FittedAssembler::from_json(&fitted.to_json().unwrap()).unwrap();
        assert_eq!(restored.feature_names(), fitted.feature_names());
        assert_eq!(restored.time_zone(), Some(chrono_tz::UTC));
        assert_eq!(restored.geohash_precision(), Some(5));

        let frame = training_frame();
        let a = fitted.transform(&frame).unwrap().matrix;
        let b = restored.transform(&frame).unwrap().matrix;
        assert_eq!(a.columns(), b.columns());
        for (x, y) in a.values().iter().zip(b.values()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_from_json_rejects_reordered_groups() {
        let assembler = fitted_assembler();
        let mut json = serde_json::to_value(assembler.fitted().unwrap()).unwrap();
        json["groups"].as_array_mut().unwrap().swap(0, 2);

        let err = FittedAssembler::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch(_)));
    }
}
