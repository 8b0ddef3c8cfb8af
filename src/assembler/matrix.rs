use serde::Serialize;

/// Dense row-major feature matrix with named columns.
///
/// Only built inside the crate, so `values.len() == n_rows * n_cols` always
/// holds. Serialize-only: nothing reads a matrix back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    values: Vec<f64>,
    n_rows: usize,
    /// Input row index of each matrix row.
    source_rows: Vec<usize>,
}

impl FeatureMatrix {
    /// Wraps row-major `values`. Callers guarantee `values.len() == rows * columns`.
    pub(crate) fn from_parts(columns: Vec<String>, values: Vec<f64>, source_rows: Vec<usize>) -> Self {
        let n_rows = source_rows.len();
        debug_assert_eq!(values.len(), n_rows * columns.len());
        FeatureMatrix {
            columns,
            values,
            n_rows,
            source_rows,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row(&self, i: usize) -> Option<&[f64]> {
        if i >= self.n_rows {
            return None;
        }
        let width = self.n_cols();
        self.values.get(i * width..(i + 1) * width)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows).filter_map(move |i| self.row(i))
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.n_rows || col >= self.n_cols() {
            return None;
        }
        self.values.get(row * self.n_cols() + col).copied()
    }

    /// Copies out one named column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let col = self.column_index(name)?;
        Some(self.rows().map(|r| r[col]).collect())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn source_rows(&self) -> &[usize] {
        &self.source_rows
    }
}
