//! File output for one exported run.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::ser::PrettyFormatter;

use crate::classify::ColumnBuckets;
use crate::classify::ScalarSeries;
use crate::config::DataTypes;
use crate::history::RowKey;

pub const METADATA_FILE: &str = "metadata.yaml";
pub const SCALARS_FILE: &str = "scalars.csv";
pub const HISTOGRAMS_FILE: &str = "histograms.json";
pub const IMAGES_URLS_FILE: &str = "images_urls.json";
pub const CONFIG_FILE: &str = "config.yaml";

const JSON_INDENT: &[u8] = b"    ";

/// Contents of `metadata.yaml`. Fields are declared in the order they are
/// written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetadata {
    pub id: String,
    pub name: String,
    pub step_max: Option<i64>,
    pub url: String,
}

/// Everything written for a single run.
#[derive(Debug, Clone)]
pub struct RunExport<'a> {
    pub metadata: RunMetadata,
    pub buckets: &'a ColumnBuckets,
    pub config: &'a Map<String, Value>,
}

/// Directory name for a run: `/` would nest directories, and `.`/`..`/empty
/// names would escape the run's own folder.
pub fn safe_dir_name(name: &str) -> String {
    let replaced = name.replace('/', "_");
    match replaced.as_str() {
        "" | "." | ".." => format!("_{replaced}"),
        _ => replaced,
    }
}

/// Write the enabled files into `dir`, which must already exist. Returns the
/// paths written, in write order.
pub fn write_run(
    dir: &Path,
    export: &RunExport<'_>,
    data_types: &DataTypes,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    if data_types.metadata {
        let path = dir.join(METADATA_FILE);
        write_yaml(&path, &export.metadata)?;
        written.push(path);
    }

    if data_types.scalar {
        let path = dir.join(SCALARS_FILE);
        write_scalars_csv(&path, &export.buckets.scalars)?;
        written.push(path);
    }

    if data_types.histogram {
        let path = dir.join(HISTOGRAMS_FILE);
        write_json(&path, &export.buckets.histograms)?;
        written.push(path);
    }

    if data_types.image_url {
        let path = dir.join(IMAGES_URLS_FILE);
        write_json(&path, &export.buckets.images_urls)?;
        written.push(path);
    }

    if data_types.config {
        let path = dir.join(CONFIG_FILE);
        write_yaml(&path, &sort_keys(&Value::Object(export.config.clone())))?;
        written.push(path);
    }

    Ok(written)
}

/// One CSV row per distinct row key across all columns, ascending, with
/// blank cells where a column has no value at that key. No scalar columns
/// gives an empty file.
pub fn write_scalars_csv(path: &Path, scalars: &IndexMap<String, ScalarSeries>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    if !scalars.is_empty() {
        writer
            .write_record(scalars.keys())
            .with_context(|| format!("failed to write header to {}", path.display()))?;
    }

    let keys: BTreeSet<RowKey> = scalars
        .values()
        .flat_map(|series| series.keys().copied())
        .collect();

    for key in keys {
        let record = scalars
            .values()
            .map(|series| series.get(&key).map(csv_cell).unwrap_or_default());
        writer.write_record(record).with_context(|| {
            format!("failed to write step {} to {}", key.step, path.display())
        })?;
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

/// Pretty JSON with four-space indentation.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(JSON_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .with_context(|| format!("failed to serialize {}", path.display()))?;

    fs::write(path, buffer).with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_yaml::to_string(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Copy of `value` with every object's keys in lexical order, so config
/// files do not depend on the order the server returned them in.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(&String, &Value)> = object.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryTable;
    use serde_json::json;
    use tempfile::TempDir;

    fn metadata() -> RunMetadata {
        RunMetadata {
            id: "abc123".to_string(),
            name: "baseline".to_string(),
            step_max: Some(9),
            url: "https://api.wandb.ai/files/team/proj/abc123".to_string(),
        }
    }

    fn series<const N: usize>(values: [(i64, Value); N]) -> ScalarSeries {
        values
            .into_iter()
            .map(|(step, value)| (RowKey::new(step, 0), value))
            .collect()
    }

    #[test]
    fn safe_names_replace_slashes() {
        assert_eq!(safe_dir_name("sweep/run-1"), "sweep_run-1");
        assert_eq!(safe_dir_name("plain"), "plain");
        assert_eq!(safe_dir_name(".."), "_..");
        assert_eq!(safe_dir_name(""), "_");
    }

    #[test]
    fn ragged_scalars_are_aligned_by_step() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SCALARS_FILE);

        let mut scalars = IndexMap::new();
        scalars.insert(
            "_step".to_string(),
            series([(0, json!(0)), (1, json!(1)), (2, json!(2))]),
        );
        scalars.insert("loss".to_string(), series([(0, json!(1.5)), (2, json!(0.25))]));
        scalars.insert("phase".to_string(), series([(1, json!("warmup, fast"))]));

        write_scalars_csv(&path, &scalars).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "_step,loss,phase\n0,1.5,\n1,,\"warmup, fast\"\n2,0.25,\n"
        );
    }

    #[test]
    fn rows_sharing_a_step_are_all_written() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SCALARS_FILE);
        let history = HistoryTable::from_rows(
            json!([
                {"_step": 0, "loss": 1.0},
                {"loss": 2.0},
                {"_step": 1, "loss": 3.0},
                {"_step": 1, "acc": 0.5, "loss": 5.0},
            ])
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap().clone())
            .collect(),
        );

        let mut scalars = IndexMap::new();
        for column in ["_step", "loss", "acc"] {
            scalars.insert(
                column.to_string(),
                history.keyed_series(column).into_iter().collect(),
            );
        }

        write_scalars_csv(&path, &scalars).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "_step,loss,acc\n0,1.0,\n,2.0,\n1,3.0,\n1,5.0,0.5\n"
        );
    }

    #[test]
    fn no_scalar_columns_give_an_empty_csv() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SCALARS_FILE);
        write_scalars_csv(&path, &IndexMap::new()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn json_uses_four_space_indent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(HISTOGRAMS_FILE);

        let mut histograms = IndexMap::new();
        histograms.insert("weights".to_string(), vec![json!({"bins": [1, 2]})]);
        write_json(&path, &histograms).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("{\n    \"weights\": [\n        {"), "{written}");

        let read_back: IndexMap<String, Vec<Value>> = serde_json::from_str(&written).unwrap();
        assert_eq!(read_back, histograms);
    }

    #[test]
    fn empty_buckets_are_written_as_empty_objects() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(IMAGES_URLS_FILE);
        write_json(&path, &IndexMap::<String, Vec<Value>>::new()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn metadata_yaml_has_expected_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(METADATA_FILE);
        write_yaml(&path, &metadata()).unwrap();

        let read_back: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back["id"], serde_yaml::Value::from("abc123"));
        assert_eq!(read_back["name"], serde_yaml::Value::from("baseline"));
        assert_eq!(read_back["step_max"], serde_yaml::Value::from(9));
        assert_eq!(
            read_back["url"],
            serde_yaml::Value::from("https://api.wandb.ai/files/team/proj/abc123")
        );
    }

    #[test]
    fn write_run_respects_flags_and_sorts_config() {
        let tmp = TempDir::new().unwrap();
        let buckets = ColumnBuckets::default();
        let config = json!({"optimizer": {"name": "adam", "betas": [0.9, 0.99]}, "lr": 0.001})
            .as_object()
            .unwrap()
            .clone();
        let export = RunExport {
            metadata: metadata(),
            buckets: &buckets,
            config: &config,
        };
        let data_types = DataTypes {
            scalar: false,
            image_url: false,
            ..DataTypes::default()
        };

        let written = write_run(tmp.path(), &export, &data_types).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![METADATA_FILE, HISTOGRAMS_FILE, CONFIG_FILE]);
        assert!(!tmp.path().join(SCALARS_FILE).exists());

        let config_yaml = fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        let lr = config_yaml.find("lr:").unwrap();
        let optimizer = config_yaml.find("optimizer:").unwrap();
        assert!(lr < optimizer, "{config_yaml}");
        let betas = config_yaml.find("betas:").unwrap();
        let name = config_yaml.find("name: adam").unwrap();
        assert!(betas < name, "{config_yaml}");
    }
}
