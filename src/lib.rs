//! Feature engineering for hourly transit ridership: cyclical time features,
//! station geohashes, standardized weather and one-hot categoricals,
//! assembled into a dense matrix with a reusable fitted state.

pub mod assembler;
pub mod config;
pub mod error;
pub mod fetch;
pub mod geohash;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod records;
pub mod stats;
pub mod time_features;

pub use assembler::{FeatureAssembler, FeatureMatrix, FittedAssembler};
pub use config::{MissingStationPolicy, PipelineConfig, UnknownCategoryPolicy};
pub use error::{PipelineError, Result};
pub use crate::geohash::StationGeohashIndex;
pub use pipeline::{PipelineOutput, PreprocessingPipeline, WeatherSource, cap_non_finite};
pub use stats::TransformReport;
pub use time_features::{TimeFeatureEncoder, TimeFeatures};
