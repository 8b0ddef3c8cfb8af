//! Column groups: each one fits on, and transforms, a disjoint slice of the
//! frame and returns a block with exactly one output row per input row.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::assembler::onehot::OneHotEncoder;
use crate::assembler::scaler::ColumnScale;
use crate::config::UnknownCategoryPolicy;
use crate::error::{PipelineError, Result};
use crate::records::FeatureFrame;
use crate::time_features::TimeFeatureEncoder;

pub const TIME_GROUP: &str = "time";
pub const WEATHER_GROUP: &str = "weather";
pub const GEOHASH_GROUP: &str = "geohash";

pub const DAYS_OF_WEEK: std::ops::Range<u32> = 0..7;
pub const MONTHS: std::ops::RangeInclusive<u32> = 1..=12;

/// An unfitted group and the configuration it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnGroup {
    Time { tz: Tz },
    Weather { columns: Vec<String> },
    Geohash { precision: usize },
}

impl ColumnGroup {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnGroup::Time { .. } => TIME_GROUP,
            ColumnGroup::Weather { .. } => WEATHER_GROUP,
            ColumnGroup::Geohash { .. } => GEOHASH_GROUP,
        }
    }

    pub fn fit(&self, frame: &FeatureFrame) -> Result<FittedGroup> {
        match self {
            ColumnGroup::Time { tz } => Ok(FittedGroup::Time(FittedTime::new(*tz))),
            ColumnGroup::Weather { columns } => {
                check_weather_schema(columns, &frame.weather_columns)?;

                let mut scales = Vec::with_capacity(columns.len());
                for (j, column) in columns.iter().enumerate() {
                    let values = (0..frame.len())
                        .map(|i| weather_value(frame, i, j, column))
                        .collect::<Result<Vec<f64>>>()?;
                    let scale = ColumnScale::fit(column, &values);
                    if !scale.is_finite() {
                        let row = values.iter().position(|v| !v.is_finite()).unwrap_or(0);
                        return Err(PipelineError::malformed(
                            frame.source_row(row),
                            format!("statistics of {} are not finite", column),
                        ));
                    }
                    scales.push(scale);
                }

                Ok(FittedGroup::Weather(FittedWeather { scales }))
            }
            ColumnGroup::Geohash { precision } => {
                let vocabulary =
                    OneHotEncoder::new(frame.rows.iter().filter_map(|r| r.geohash.clone()));
                Ok(FittedGroup::Geohash(FittedGeohash {
                    precision: *precision,
                    vocabulary,
                }))
            }
        }
    }
}

/// Calendar vocabularies are the full calendar domain, never learned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedTime {
    pub time_zone: Tz,
    pub day_of_week: OneHotEncoder<u32>,
    pub month: OneHotEncoder<u32>,
}

impl FittedTime {
    pub fn new(time_zone: Tz) -> Self {
        FittedTime {
            time_zone,
            day_of_week: OneHotEncoder::new(DAYS_OF_WEEK),
            month: OneHotEncoder::new(MONTHS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedWeather {
    pub scales: Vec<ColumnScale>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedGeohash {
    pub precision: usize,
    pub vocabulary: OneHotEncoder<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "group", rename_all = "lowercase")]
pub enum FittedGroup {
    Time(FittedTime),
    Weather(FittedWeather),
    Geohash(FittedGeohash),
}

/// Row-major output of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBlock {
    pub group: &'static str,
    pub width: usize,
    pub values: Vec<f64>,
    /// Categories not in the fitted vocabulary.
    pub unknown: usize,
    /// Rows with no category at all (null geohash).
    pub missing: usize,
}

impl FittedGroup {
    pub fn name(&self) -> &'static str {
        match self {
            FittedGroup::Time(_) => TIME_GROUP,
            FittedGroup::Weather(_) => WEATHER_GROUP,
            FittedGroup::Geohash(_) => GEOHASH_GROUP,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            FittedGroup::Time(t) => t.day_of_week.width() + t.month.width() + 2,
            FittedGroup::Weather(w) => w.scales.len(),
            FittedGroup::Geohash(g) => g.vocabulary.width(),
        }
    }

    pub fn output_columns(&self) -> Vec<String> {
        match self {
            FittedGroup::Time(t) => {
                let mut columns = t.day_of_week.column_names("dow");
                columns.extend(t.month.column_names("month"));
                columns.push("hour_sin".to_string());
                columns.push("hour_cos".to_string());
                columns
            }
            FittedGroup::Weather(w) => w.scales.iter().map(|s| s.name.clone()).collect(),
            FittedGroup::Geohash(g) => g.vocabulary.column_names("geohash"),
        }
    }

    pub fn transform(&self, frame: &FeatureFrame, policy: UnknownCategoryPolicy) -> Result<GroupBlock> {
        let width = self.width();
        let mut block = GroupBlock {
            group: self.name(),
            width,
            values: Vec::with_capacity(frame.len() * width),
            unknown: 0,
            missing: 0,
        };

        match self {
            FittedGroup::Time(t) => {
                let encoder = TimeFeatureEncoder::new(t.time_zone);
                for (i, row) in frame.rows.iter().enumerate() {
                    let features = encoder.encode_str(&row.timestamp).ok_or_else(|| {
                        PipelineError::malformed(
                            frame.source_row(i),
                            format!("unparsable timestamp {:?}", row.timestamp),
                        )
                    })?;

                    if !t.day_of_week.encode_into(Some(&features.day_of_week), &mut block.values) {
                        on_unknown(policy, TIME_GROUP, features.day_of_week.to_string(), &mut block.unknown)?;
                    }
                    if !t.month.encode_into(Some(&features.month), &mut block.values) {
                        on_unknown(policy, TIME_GROUP, features.month.to_string(), &mut block.unknown)?;
                    }
                    block.values.push(features.hour_sin);
                    block.values.push(features.hour_cos);
                }
            }
            FittedGroup::Weather(w) => {
                let columns: Vec<String> = w.scales.iter().map(|s| s.name.clone()).collect();
                check_weather_schema(&columns, &frame.weather_columns)?;

                for i in 0..frame.len() {
                    for (j, scale) in w.scales.iter().enumerate() {
                        let value = weather_value(frame, i, j, &scale.name)?;
                        block.values.push(scale.apply(value));
                    }
                }
            }
            FittedGroup::Geohash(g) => {
                for row in &frame.rows {
                    match &row.geohash {
                        Some(code) => {
                            if !g.vocabulary.encode_into(Some(code), &mut block.values) {
                                on_unknown(policy, GEOHASH_GROUP, code.clone(), &mut block.unknown)?;
                            }
                        }
                        None => {
                            g.vocabulary.encode_into(None, &mut block.values);
                            if policy == UnknownCategoryPolicy::Error {
                                return Err(PipelineError::UnknownCategory {
                                    group: GEOHASH_GROUP,
                                    value: "<missing station>".to_string(),
                                });
                            }
                            block.missing += 1;
                        }
                    }
                }
            }
        }

        Ok(block)
    }
}

fn on_unknown(
    policy: UnknownCategoryPolicy,
    group: &'static str,
    value: String,
    counter: &mut usize,
) -> Result<()> {
    match policy {
        UnknownCategoryPolicy::Ignore => {
            *counter += 1;
            Ok(())
        }
        UnknownCategoryPolicy::Error => Err(PipelineError::UnknownCategory { group, value }),
    }
}

fn check_weather_schema(expected: &[String], actual: &[String]) -> Result<()> {
    if expected != actual {
        return Err(PipelineError::SchemaMismatch(format!(
            "weather columns {:?} do not match fitted columns {:?}",
            actual, expected
        )));
    }
    Ok(())
}

fn weather_value(frame: &FeatureFrame, row: usize, col: usize, column: &str) -> Result<f64> {
    frame.rows[row]
        .weather
        .get(col)
        .copied()
        .flatten()
        .ok_or_else(|| {
            PipelineError::malformed(frame.source_row(row), format!("missing value for {}", column))
        })
}
