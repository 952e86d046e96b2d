//! Sorting history columns into scalar, histogram and image buckets.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DataTypes;
use crate::history::HistoryTable;
use crate::history::RowKey;
use crate::history::cell;

pub const TYPE_KEY: &str = "_type";
pub const HISTOGRAM_TYPE: &str = "histogram";
pub const IMAGE_FILE_TYPE: &str = "image-file";

/// How the representative sample of a column is picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleRule {
    /// The column's value in the last row at the maximum `_step`. Columns
    /// missing from that row are not exported at all.
    #[default]
    LastStep,
    /// The column's last non-missing value anywhere in the history.
    AnyValue,
}

/// What a representative sample says about its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Scalar,
    Histogram,
    ImageFile,
    /// Tagged media the exporter does not handle (tables, audio, ...).
    OtherMedia,
}

impl ColumnKind {
    pub fn of(sample: &Value) -> Self {
        let tag = sample
            .as_object()
            .and_then(|object| object.get(TYPE_KEY))
            .and_then(Value::as_str);

        match tag {
            None => ColumnKind::Scalar,
            Some(HISTOGRAM_TYPE) => ColumnKind::Histogram,
            Some(IMAGE_FILE_TYPE) => ColumnKind::ImageFile,
            Some(_) => ColumnKind::OtherMedia,
        }
    }
}

/// Scalar values of one column keyed by the row they were logged in.
pub type ScalarSeries = BTreeMap<RowKey, Value>;

/// Disjoint per-type views of a run's columns, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBuckets {
    pub scalars: IndexMap<String, ScalarSeries>,
    pub histograms: IndexMap<String, Vec<Value>>,
    pub images_urls: IndexMap<String, Vec<Value>>,
}

/// Classify every column of `table`. Disabled data types leave their bucket
/// empty; a histogram column is never demoted to a scalar.
pub fn classify_columns(
    table: &HistoryTable,
    data_types: &DataTypes,
    rule: SampleRule,
) -> ColumnBuckets {
    let mut buckets = ColumnBuckets::default();
    let representative = match rule {
        SampleRule::LastStep => table.last_row_at_max_step(),
        SampleRule::AnyValue => None,
    };

    for column in table.columns() {
        let sample = match rule {
            SampleRule::LastStep => representative.and_then(|row| cell(row, column)),
            SampleRule::AnyValue => table.last_value(column),
        };
        let Some(sample) = sample else {
            continue;
        };

        match ColumnKind::of(sample) {
            ColumnKind::Histogram if data_types.histogram => {
                buckets
                    .histograms
                    .insert(column.to_string(), table.series(column));
            }
            ColumnKind::ImageFile if data_types.image_url => {
                buckets
                    .images_urls
                    .insert(column.to_string(), table.series(column));
            }
            ColumnKind::Scalar if data_types.scalar => {
                let series = table.keyed_series(column).into_iter().collect();
                buckets.scalars.insert(column.to_string(), series);
            }
            _ => {}
        }
    }

    buckets
}
