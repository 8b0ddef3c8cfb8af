//! Persistence for pipeline results.
//!
//! Feature matrices go to CSV (optionally gzip-compressed), fitted state and
//! run reports to JSON, and the station index to a two-column CSV.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::assembler::{FeatureMatrix, FittedAssembler};
use crate::geohash::StationGeohashIndex;

/// Logs any serializable value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn create(path: &str) -> Result<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    File::create(path).with_context(|| format!("creating {}", path))
}

/// Writes the matrix as CSV with a header row of feature names.
///
/// With `gzip` the bytes are compressed the same way regardless of the
/// file extension; callers pick the name.
pub fn write_matrix_csv(path: &str, matrix: &FeatureMatrix, gzip: bool) -> Result<()> {
    let mut file = BufWriter::new(create(path)?);
    if gzip {
        let mut encoder = GzEncoder::new(&mut file, Compression::default());
        write_matrix_to(&mut encoder, matrix)?;
        encoder.finish()?;
    } else {
        write_matrix_to(&mut file, matrix)?;
    }
    file.flush()?;

    debug!(path, rows = matrix.n_rows(), cols = matrix.n_cols(), gzip, "Feature matrix written");
    Ok(())
}

fn write_matrix_to<W: Write>(out: &mut W, matrix: &FeatureMatrix) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(matrix.columns())?;
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Serializes `value` as pretty JSON to `path`.
pub fn write_json<T: Serialize>(path: &str, value: &T) -> Result<()> {
    let mut file = BufWriter::new(create(path)?);
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.flush()?;
    debug!(path, "JSON written");
    Ok(())
}

/// Loads and validates a fitted assembler saved by [`write_json`].
pub fn read_fitted(path: &str) -> Result<FittedAssembler> {
    let json = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    FittedAssembler::from_json(&json).with_context(|| format!("loading fitted state from {}", path))
}

/// Writes `station_name,geohash` rows, sorted by station name.
pub fn write_index_csv(path: &str, index: &StationGeohashIndex) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(create(path)?);
    for entry in index.entries() {
        writer.serialize(&entry)?;
    }
    writer.flush()?;
    debug!(path, stations = index.len(), "Geohash index written");
    Ok(())
}
