//! Row/column view over the sampled history of a run.

use std::collections::HashMap;

use indexmap::IndexSet;
use serde_json::Map;
use serde_json::Value;

/// One logged step: metric name to value.
pub type Row = Map<String, Value>;

/// Column holding the monotonic step counter.
pub const STEP_COLUMN: &str = "_step";

/// A run's logged values, one row per sampled step. Columns are ordered by
/// first appearance. Absent and `null` cells are both treated as missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTable {
    columns: IndexSet<String>,
    rows: Vec<Row>,
}

impl HistoryTable {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns = IndexSet::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.contains(key) {
                    columns.insert(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Largest `_step` in the table, if any row carries one.
    pub fn step_max(&self) -> Option<i64> {
        self.rows.iter().filter_map(row_step).max()
    }

    /// The last row logged at [`Self::step_max`].
    pub fn last_row_at_max_step(&self) -> Option<&Row> {
        let step_max = self.step_max()?;
        self.rows
            .iter()
            .rev()
            .find(|row| row_step(row) == Some(step_max))
    }

    /// Every non-missing value of `column`, in row order.
    pub fn series(&self, column: &str) -> Vec<Value> {
        self.rows
            .iter()
            .filter_map(|row| cell(row, column))
            .cloned()
            .collect()
    }

    /// One [`RowKey`] per row, in row order. Rows sharing a step key are
    /// told apart by their occurrence count.
    pub fn row_keys(&self) -> Vec<RowKey> {
        let mut seen: HashMap<i64, usize> = HashMap::new();
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let step = step_key(index, row);
                let occurrence = seen.entry(step).or_insert(0);
                let key = RowKey::new(step, *occurrence);
                *occurrence += 1;
                key
            })
            .collect()
    }

    /// Non-missing values of `column` keyed by [`Self::row_keys`].
    pub fn keyed_series(&self, column: &str) -> Vec<(RowKey, Value)> {
        self.row_keys()
            .into_iter()
            .zip(&self.rows)
            .filter_map(|(key, row)| cell(row, column).map(|value| (key, value.clone())))
            .collect()
    }

    /// The most recent non-missing value of `column`.
    pub fn last_value(&self, column: &str) -> Option<&Value> {
        self.rows.iter().rev().find_map(|row| cell(row, column))
    }
}

/// Position of a row when aligning columns: its [`step_key`], then how many
/// earlier rows had the same step key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub step: i64,
    pub occurrence: usize,
}

impl RowKey {
    pub fn new(step: i64, occurrence: usize) -> Self {
        Self { step, occurrence }
    }
}

/// Non-missing value of `column` in `row`.
pub fn cell<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).filter(|value| !value.is_null())
}

/// `_step` of a row. Integral floats are accepted since some clients log
/// steps as `1.0`.
pub fn row_step(row: &Row) -> Option<i64> {
    let value = cell(row, STEP_COLUMN)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|step| step.fract() == 0.0)
            .map(|step| step as i64)
    })
}

/// Key used to align values across columns: the row's `_step`, or its
/// position when it has none.
pub fn step_key(index: usize, row: &Row) -> i64 {
    row_step(row).unwrap_or(index as i64)
}
