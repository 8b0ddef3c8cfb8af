use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One-hot encoder over a sorted, de-duplicated vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneHotEncoder<T> {
    categories: Vec<T>,
}

impl<T: Ord + Clone + Display> OneHotEncoder<T> {
    pub fn new(categories: impl IntoIterator<Item = T>) -> Self {
        let mut categories: Vec<T> = categories.into_iter().collect();
        categories.sort();
        categories.dedup();
        OneHotEncoder { categories }
    }

    pub fn categories(&self) -> &[T] {
        &self.categories
    }

    pub fn width(&self) -> usize {
        self.categories.len()
    }

    /// True when the stored vocabulary is sorted and free of duplicates.
    pub fn is_canonical(&self) -> bool {
        self.categories.windows(2).all(|w| w[0] < w[1])
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.categories.binary_search(value).ok()
    }

    /// Appends the indicator vector for `value` to `out`. Returns false if the
    /// value is missing or unknown, in which case all appended indicators are zero.
    pub fn encode_into(&self, value: Option<&T>, out: &mut Vec<f64>) -> bool {
        let start = out.len();
        out.resize(start + self.width(), 0.0);

        match value.and_then(|v| self.index_of(v)) {
            Some(i) => {
                out[start + i] = 1.0;
                true
            }
            None => false,
        }
    }

    /// Output column names, `<prefix>_<category>`.
    pub fn column_names(&self, prefix: &str) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("{}_{}", prefix, c))
            .collect()
    }
}
