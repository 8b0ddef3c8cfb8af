use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Observable counters for one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    /// Trip rows delivered to the pipeline.
    pub input_rows: usize,
    /// Rows in the returned matrix.
    pub rows: usize,
    pub columns: usize,

    // join
    pub unmatched_stations: usize,
    pub dropped_rows: usize,

    // recoverable conditions
    pub unknown_calendar: usize,
    pub unknown_geohash: usize,
    pub missing_geohash: usize,
    pub degenerate_columns: Vec<String>,
    pub non_finite_replaced: usize,
}

impl TransformReport {
    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of matrix rows whose geohash block is all zero.
    pub fn zero_geohash_pct(&self) -> f64 {
        Self::pct(self.unknown_geohash + self.missing_geohash, self.rows)
    }

    /// True if any recoverable condition was hit.
    pub fn has_warnings(&self) -> bool {
        self.unmatched_stations > 0
            || self.unknown_calendar > 0
            || self.unknown_geohash > 0
            || !self.degenerate_columns.is_empty()
            || self.non_finite_replaced > 0
    }

    /// Emits the counters as one structured log event.
    pub fn log_summary(&self) {
        if self.has_warnings() {
            warn!(
                input_rows = self.input_rows,
                rows = self.rows,
                columns = self.columns,
                unmatched_stations = self.unmatched_stations,
                dropped_rows = self.dropped_rows,
                unknown_geohash = self.unknown_geohash,
                missing_geohash = self.missing_geohash,
                zero_geohash_pct = self.zero_geohash_pct(),
                degenerate_columns = ?self.degenerate_columns,
                non_finite_replaced = self.non_finite_replaced,
                "Feature matrix built with recoverable issues"
            );
        } else {
            info!(
                input_rows = self.input_rows,
                rows = self.rows,
                columns = self.columns,
                "Feature matrix built"
            );
        }
    }
}
