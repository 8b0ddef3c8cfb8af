use serde::{Deserialize, Serialize};

/// Largest absolute value, used to bring a column into `[-1, 1]` when a
/// direct sum would overflow.
fn magnitude(values: &[f64]) -> f64 {
    values.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum = values.iter().sum::<f64>();
    if sum.is_finite() {
        return sum / n;
    }

    let scale = magnitude(values);
    scale * (values.iter().map(|v| v / scale).sum::<f64>() / n)
}

/// Computes the population standard deviation given a pre-computed mean.
/// Returns 0.0 for empty input.
///
/// For finite input the result never exceeds the largest absolute value.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    if variance.is_finite() {
        return variance.sqrt();
    }

    let scale = magnitude(values);
    let centre = mean / scale;
    let scaled = values.iter().map(|v| (v / scale - centre).powi(2)).sum::<f64>() / n;
    scale * scaled.sqrt()
}

/// Fit-time standardization parameters for one weather column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnScale {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    /// Zero variance at fit time: values pass through unchanged.
    pub degenerate: bool,
}

impl ColumnScale {
    pub fn fit(name: &str, values: &[f64]) -> Self {
        let mean = mean(values);
        let std = stddev(values, mean);
        let degenerate = !std.is_finite() || std < 10.0 * f64::EPSILON * mean.abs().max(1.0);

        ColumnScale {
            name: name.to_string(),
            mean,
            std,
            degenerate,
        }
    }

    /// False if either statistic is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.std.is_finite()
    }

    pub fn apply(&self, value: f64) -> f64 {
        if self.degenerate {
            value
        } else {
            (value - self.mean) / self.std
        }
    }
}
