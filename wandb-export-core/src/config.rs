use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use config::Config as ConfigLoader;
use config::Environment;
use config::File;
use config::FileFormat;
use serde::Deserialize;
use serde_yaml::Mapping;
use serde_yaml::Value as YamlValue;

use crate::classify::SampleRule;
use crate::error::ExportError;

/// Embedded template written by `wandb-export-init-config`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/config_default.yaml");

/// Directory, relative to the working directory, holding the config files.
pub const DIR_CONFIGS: &str = "configs_wandb_export";

/// File name of the default config inside [`DIR_CONFIGS`].
pub const NAME_CONFIG_DEFAULT: &str = "config_default.yaml";

/// Prefix of environment overrides, e.g. `WANDB_EXPORT__SAMPLES=500`.
pub const ENV_PREFIX: &str = "WANDB_EXPORT";

pub const DEFAULT_BASE_URL: &str = "https://api.wandb.ai";
const DEFAULT_SAMPLES: u64 = 10_000;
const DEFAULT_MIN_N_METRICS: usize = 1;
const DEFAULT_EXPORT_DIR: &str = "data/wandb_export";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Location of the configuration file that drives an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
}

impl ConfigPaths {
    /// `config_name` may omit the `.yaml` extension.
    pub fn new(config_dir: impl Into<PathBuf>, config_name: &str) -> Self {
        let config_dir = config_dir.into();
        let mut file_name = PathBuf::from(config_name);
        if file_name.extension().is_none() {
            file_name.set_extension("yaml");
        }
        let config_file = config_dir.join(file_name);
        Self {
            config_dir,
            config_file,
        }
    }

    pub fn ensure_config_dir_exists(&self) -> Result<(), ExportError> {
        if self.config_dir.is_dir() {
            Ok(())
        } else {
            Err(ExportError::MissingConfigDir {
                dir: self.config_dir.clone(),
            })
        }
    }
}

/// Result of seeding the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Created(PathBuf),
    AlreadyExists(PathBuf),
}

/// Create the config directory and write [`DEFAULT_CONFIG_TEMPLATE`] into it,
/// unless a config file is already there.
pub fn init_config(paths: &ConfigPaths) -> Result<InitOutcome> {
    fs::create_dir_all(&paths.config_dir).with_context(|| {
        format!(
            "failed to create config directory {}",
            paths.config_dir.display()
        )
    })?;

    if paths.config_file.exists() {
        return Ok(InitOutcome::AlreadyExists(paths.config_file.clone()));
    }

    fs::write(&paths.config_file, DEFAULT_CONFIG_TEMPLATE).with_context(|| {
        format!(
            "failed to write default config to {}",
            paths.config_file.display()
        )
    })?;

    Ok(InitOutcome::Created(paths.config_file.clone()))
}

/// Load the config file, then layer `WANDB_EXPORT__*` environment variables and
/// the command-line `key=value` overrides on top, and resolve the result.
pub fn load_config(paths: &ConfigPaths, overrides: &[String]) -> Result<ExportSettings> {
    load_config_from_sources(paths, overrides, None)
}

/// Same as [`load_config`], but reads environment overrides from `env_source`
/// instead of the process environment when it is provided.
pub fn load_config_from_sources(
    paths: &ConfigPaths,
    overrides: &[String],
    env_source: Option<HashMap<String, String>>,
) -> Result<ExportSettings> {
    paths.ensure_config_dir_exists()?;
    let filters = read_filters(paths, overrides, env_source.as_ref())?;

    let mut builder = ConfigLoader::builder()
        .add_source(
            File::from(paths.config_file.clone())
                .format(FileFormat::Yaml)
                .required(true),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env_source),
        );

    if let Some(yaml) = overrides_to_yaml(overrides)? {
        builder = builder.add_source(File::from_str(&yaml, FileFormat::Yaml));
    }

    let mut config: ExportConfig = builder
        .build()
        .with_context(|| {
            format!(
                "failed to parse configuration at {}",
                paths.config_file.display()
            )
        })?
        .try_deserialize()
        .context("failed to deserialize configuration")?;
    config.filters = filters;

    config.resolve()
}

/// Raw configuration as written in the YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub project: String,
    pub entity: String,
    pub filters: Option<serde_json::Value>,
    pub samples: u64,
    pub min_n_metrics: usize,
    pub export_dir: String,
    pub sample_rule: SampleRule,
    pub data_types: DataTypes,
    pub api: ApiSection,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            entity: String::new(),
            filters: None,
            samples: DEFAULT_SAMPLES,
            min_n_metrics: DEFAULT_MIN_N_METRICS,
            export_dir: DEFAULT_EXPORT_DIR.to_string(),
            sample_rule: SampleRule::default(),
            data_types: DataTypes::default(),
            api: ApiSection::default(),
        }
    }
}

impl ExportConfig {
    pub fn resolve(self) -> Result<ExportSettings> {
        let project = self.project.trim().to_string();
        if project.is_empty() {
            return Err(ExportError::InvalidConfig("'project' is required".to_string()).into());
        }
        if self.samples == 0 {
            return Err(
                ExportError::InvalidConfig("'samples' must be greater than zero".to_string())
                    .into(),
            );
        }

        let filters = normalize_filters(self.filters)?;
        let export_dir = resolve_path_value(&self.export_dir)
            .with_context(|| format!("failed to resolve export_dir '{}'", self.export_dir))?;

        Ok(ExportSettings {
            project,
            entity: self.entity.trim().to_string(),
            filters,
            samples: self.samples,
            min_n_metrics: self.min_n_metrics,
            export_dir,
            sample_rule: self.sample_rule,
            data_types: self.data_types,
            api: self.api.resolve(),
        })
    }
}

/// Per-file export switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DataTypes {
    pub metadata: bool,
    pub scalar: bool,
    pub histogram: bool,
    pub image_url: bool,
    pub config: bool,
}

impl Default for DataTypes {
    fn default() -> Self {
        Self {
            metadata: true,
            scalar: true,
            histogram: true,
            image_url: true,
            config: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ApiSection {
    pub fn resolve(self) -> ApiSettings {
        self.resolve_with(|var| env::var(var).ok())
    }

    /// Fill unset values through `lookup` (`WANDB_BASE_URL`, `WANDB_API_KEY`).
    pub fn resolve_with(self, lookup: impl Fn(&str) -> Option<String>) -> ApiSettings {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let base_url = non_empty(self.base_url)
            .or_else(|| non_empty(lookup("WANDB_BASE_URL")))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        ApiSettings {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: non_empty(self.api_key).or_else(|| non_empty(lookup("WANDB_API_KEY"))),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Flat, validated settings consumed by the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub project: String,
    pub entity: String,
    pub filters: Option<serde_json::Value>,
    pub samples: u64,
    pub min_n_metrics: usize,
    pub export_dir: PathBuf,
    pub sample_rule: SampleRule,
    pub data_types: DataTypes,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Filters may be written as a mapping or as a JSON string. The string form
/// keeps key case intact, which matters for fields like `displayName`.
fn normalize_filters(filters: Option<serde_json::Value>) -> Result<Option<serde_json::Value>> {
    match filters {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(raw)) if raw.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(raw)) => serde_json::from_str(&raw)
            .map(Some)
            .with_context(|| format!("'filters' is not valid JSON: {raw}")),
        Some(other) => Ok(Some(other)),
    }
}

/// The `filters` value from the file, `WANDB_EXPORT__FILTERS` and `filters`
/// overrides, read with `serde_yaml` directly. The layered loader lowercases
/// keys, which would turn W&B fields like `displayName` into other fields.
fn read_filters(
    paths: &ConfigPaths,
    overrides: &[String],
    env_source: Option<&HashMap<String, String>>,
) -> Result<Option<serde_json::Value>> {
    let text = fs::read_to_string(&paths.config_file)
        .with_context(|| format!("failed to read {}", paths.config_file.display()))?;
    let file: YamlValue = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse {}", paths.config_file.display()))?;
    let mut filters = file.get("filters").cloned().unwrap_or(YamlValue::Null);

    let env_key = format!("{ENV_PREFIX}__FILTERS");
    let env_value = match env_source {
        Some(vars) => vars.get(&env_key).cloned(),
        None => env::var(&env_key).ok(),
    };
    if let Some(raw) = env_value {
        filters = YamlValue::String(raw);
    }

    for raw in overrides {
        let (path, value) = parse_override(raw)?;
        let Some((first, rest)) = path.split_first() else {
            continue;
        };
        if first != "filters" {
            continue;
        }
        if rest.is_empty() {
            filters = value;
            continue;
        }
        if !filters.is_mapping() {
            filters = YamlValue::Mapping(Mapping::new());
        }
        if let YamlValue::Mapping(map) = &mut filters {
            insert_nested(map, rest, value);
        }
    }

    if filters.is_null() {
        return Ok(None);
    }
    serde_json::to_value(&filters)
        .map(Some)
        .context("'filters' must be a JSON-compatible value")
}

fn overrides_to_yaml(overrides: &[String]) -> Result<Option<String>> {
    if overrides.is_empty() {
        return Ok(None);
    }

    let mut root = Mapping::new();
    for raw in overrides {
        let (path, value) = parse_override(raw)?;
        insert_nested(&mut root, &path, value);
    }

    let yaml = serde_yaml::to_string(&root).context("failed to render overrides")?;
    Ok(Some(yaml))
}

/// Parse a `a.b.c=value` override. Hydra-style `+`/`++` prefixes are accepted
/// and ignored; the value is read as YAML so numbers, booleans and flow
/// mappings keep their type.
pub fn parse_override(raw: &str) -> Result<(Vec<String>, YamlValue), ExportError> {
    let invalid = || ExportError::InvalidOverride(raw.to_string());

    let (key, value) = raw
        .trim_start_matches('+')
        .split_once('=')
        .ok_or_else(invalid)?;

    let key = key.trim();
    if key.is_empty() || key.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(invalid());
    }

    let value = if value.trim().is_empty() {
        YamlValue::Null
    } else {
        serde_yaml::from_str(value).unwrap_or_else(|_| YamlValue::String(value.to_string()))
    };

    let path = key.split('.').map(|s| s.trim().to_string()).collect();
    Ok((path, value))
}

fn insert_nested(map: &mut Mapping, path: &[String], value: YamlValue) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let key = YamlValue::String(first.clone());

    if rest.is_empty() {
        map.insert(key, value);
        return;
    }

    if !map.get(&key).is_some_and(YamlValue::is_mapping) {
        map.insert(key.clone(), YamlValue::Mapping(Mapping::new()));
    }
    if let Some(YamlValue::Mapping(inner)) = map.get_mut(&key) {
        insert_nested(inner, rest, value);
    }
}

/// Expand `~` and `$VAR` in a configured path.
pub fn resolve_path_value(value: &str) -> Result<PathBuf> {
    let expanded = expand_path(value)?;
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        Ok(path.components().collect())
    } else {
        Ok(path)
    }
}

fn expand_path(value: &str) -> Result<String> {
    let home = home_dir();
    let home_utf8 = match home.as_ref() {
        Some(path) => Some(
            path.to_str()
                .ok_or_else(|| anyhow!("home directory contains invalid UTF-8"))?
                .to_string(),
        ),
        None => None,
    };

    let expanded = shellexpand::full_with_context(
        value,
        || home_utf8.as_deref(),
        |var| Ok(env::var(var).ok()),
    )
    .map_err(|error: shellexpand::LookupError<std::env::VarError>| {
        anyhow!("failed to expand '{value}': {error}")
    })?;
    Ok(expanded.into_owned())
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
}
