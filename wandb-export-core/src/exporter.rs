//! Run-to-local-export pipeline: list runs, then fetch, classify and write
//! each one in turn.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use tracing::Instrument;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use crate::api::ProjectPath;
use crate::api::Run;
use crate::api::TrackingApi;
use crate::classify::classify_columns;
use crate::config::ExportSettings;
use crate::writer::RunExport;
use crate::writer::RunMetadata;
use crate::writer::safe_dir_name;
use crate::writer::write_run;

/// Why a run produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The history table has fewer distinct columns than `min_n_metrics`.
    TooFewMetrics { found: usize, required: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooFewMetrics { found, required } => write!(
                f,
                "only {found} metric(s) logged, at least {required} required"
            ),
        }
    }
}

/// Result of exporting a single run.
#[derive(Debug)]
pub enum RunOutcome {
    Exported { dir: PathBuf, files: Vec<PathBuf> },
    Skipped { reason: SkipReason },
    Failed { error: anyhow::Error },
}

/// Totals of one export invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub listed: usize,
    pub exported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl ExportSummary {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Exported { .. } => self.exported += 1,
            RunOutcome::Skipped { .. } => self.skipped += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run(s) listed: {} exported, {} skipped, {} failed in {:.1}s",
            self.listed,
            self.exported,
            self.skipped,
            self.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Directory names handed out during one invocation, keyed by name with the
/// owning run id as value.
#[derive(Debug, Default)]
pub struct RunDirectories {
    owners: HashMap<String, String>,
}

impl RunDirectories {
    /// Directory name for `run`: its safe display name, or
    /// `<safe_name>_<run_id>` when another run already holds that name.
    pub fn assign(&mut self, run: &Run) -> String {
        let base = safe_dir_name(run.display_name());
        let mut candidate = base.clone();
        let mut attempt = 1;

        loop {
            match self.owners.get(&candidate) {
                Some(owner) if owner != &run.id => {
                    candidate = if attempt == 1 {
                        format!("{base}_{}", safe_dir_name(&run.id))
                    } else {
                        format!("{base}_{}_{attempt}", safe_dir_name(&run.id))
                    };
                    attempt += 1;
                }
                _ => break,
            }
        }

        self.owners.insert(candidate.clone(), run.id.clone());
        candidate
    }
}

/// Exports every run of the configured project into `export_dir`.
#[derive(Debug)]
pub struct Exporter<A> {
    api: A,
    settings: ExportSettings,
    project: ProjectPath,
    span: Span,
}

impl<A: TrackingApi> Exporter<A> {
    pub fn new(api: A, settings: ExportSettings) -> Self {
        let project = ProjectPath::new(settings.entity.clone(), settings.project.clone());
        let span = info_span!("export", project = %project);
        Self {
            api,
            settings,
            project,
            span,
        }
    }

    /// List the project's runs and export them one by one. Only setup and
    /// listing failures are returned as errors; per-run failures are counted
    /// in the summary.
    pub async fn run(&self) -> Result<ExportSummary> {
        self.run_all().instrument(self.span.clone()).await
    }

    async fn run_all(&self) -> Result<ExportSummary> {
        let started = Instant::now();
        let export_dir = &self.settings.export_dir;
        fs::create_dir_all(export_dir).with_context(|| {
            format!("failed to create export directory {}", export_dir.display())
        })?;

        let runs = self
            .api
            .list_runs(&self.project, self.settings.filters.as_ref())
            .await
            .with_context(|| format!("failed to list runs of {}", self.project))?;
        info!(count = runs.len(), "found runs to export");

        let mut summary = ExportSummary {
            listed: runs.len(),
            exported: 0,
            skipped: 0,
            failed: 0,
            elapsed: Duration::ZERO,
        };
        let mut directories = RunDirectories::default();

        for run in &runs {
            let span = info_span!("run", id = %run.id, name = %run.display_name());
            let outcome = self
                .export_run(run, &mut directories)
                .instrument(span)
                .await;
            summary.record(&outcome);
        }

        summary.elapsed = started.elapsed();
        info!(
            exported = summary.exported,
            skipped = summary.skipped,
            failed = summary.failed,
            "export finished"
        );
        Ok(summary)
    }

    /// Export one run, logging the outcome. Never fails: errors become
    /// [`RunOutcome::Failed`].
    pub async fn export_run(&self, run: &Run, directories: &mut RunDirectories) -> RunOutcome {
        let outcome = match self.try_export_run(run, directories).await {
            Ok(outcome) => outcome,
            Err(error) => RunOutcome::Failed { error },
        };

        let name = run.display_name();
        match &outcome {
            RunOutcome::Exported { dir, files } => {
                info!(dir = %dir.display(), files = files.len(), "exported run {name}");
            }
            RunOutcome::Skipped { reason } => {
                warn!("skipped run {name}: {reason}");
            }
            RunOutcome::Failed { error } => {
                error!("failed to export run {name}: {error:#}");
            }
        }
        outcome
    }

    async fn try_export_run(
        &self,
        run: &Run,
        directories: &mut RunDirectories,
    ) -> Result<RunOutcome> {
        let table = self
            .api
            .history(&self.project, run, self.settings.samples)
            .await
            .context("failed to fetch history")?;
        debug!(
            rows = table.rows().len(),
            columns = table.column_count(),
            "fetched history"
        );

        let found = table.column_count();
        let required = self.settings.min_n_metrics;
        if found < required {
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::TooFewMetrics { found, required },
            });
        }

        let buckets = classify_columns(
            &table,
            &self.settings.data_types,
            self.settings.sample_rule,
        );
        debug!(
            scalars = buckets.scalars.len(),
            histograms = buckets.histograms.len(),
            images = buckets.images_urls.len(),
            "classified columns"
        );

        let dir = self.settings.export_dir.join(directories.assign(run));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let export = RunExport {
            metadata: RunMetadata {
                id: run.id.clone(),
                name: run.display_name().to_string(),
                step_max: table.step_max(),
                url: self.project.files_url(&self.settings.api.base_url, &run.id),
            },
            buckets: &buckets,
            config: &run.config,
        };
        let files = write_run(&dir, &export, &self.settings.data_types)?;

        Ok(RunOutcome::Exported { dir, files })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::Map;
    use serde_json::Value;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::api::mock::MockTrackingApi;
    use crate::classify::SampleRule;
    use crate::config::ApiSettings;
    use crate::config::DEFAULT_BASE_URL;
    use crate::config::DataTypes;
    use crate::writer::CONFIG_FILE;
    use crate::writer::HISTOGRAMS_FILE;
    use crate::writer::IMAGES_URLS_FILE;
    use crate::writer::METADATA_FILE;
    use crate::writer::SCALARS_FILE;

    fn settings(export_dir: &Path) -> ExportSettings {
        ExportSettings {
            project: "proj".to_string(),
            entity: "team".to_string(),
            filters: None,
            samples: 100,
            min_n_metrics: 1,
            export_dir: export_dir.to_path_buf(),
            sample_rule: SampleRule::LastStep,
            data_types: DataTypes::default(),
            api: ApiSettings {
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: None,
                timeout: Duration::from_secs(5),
            },
        }
    }

    fn run(id: &str, name: Option<&str>) -> Run {
        let config: Map<String, Value> = json!({"lr": 0.01, "batch_size": 32})
            .as_object()
            .unwrap()
            .clone();
        Run {
            id: id.to_string(),
            name: name.map(str::to_string),
            config,
        }
    }

    fn two_scalar_history() -> Value {
        json!([
            {"_step": 0, "loss": 1.0, "acc": 0.1},
            {"_step": 1, "loss": 0.5, "acc": 0.4},
        ])
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn single_run_writes_every_file() {
        let tmp = TempDir::new().unwrap();
        let api =
            MockTrackingApi::new().with_run(run("abc", Some("baseline")), two_scalar_history());
        let exporter = Exporter::new(api, settings(tmp.path()));

        let summary = exporter.run().await.unwrap();
        assert_eq!(summary.listed, 1);
        assert_eq!(summary.exported, 1);

        let dir = tmp.path().join("baseline");
        assert_eq!(
            read(&dir.join(SCALARS_FILE)),
            "_step,loss,acc\n0,1.0,0.1\n1,0.5,0.4\n"
        );
        assert_eq!(read(&dir.join(HISTOGRAMS_FILE)), "{}");
        assert_eq!(read(&dir.join(IMAGES_URLS_FILE)), "{}");

        let metadata = read(&dir.join(METADATA_FILE));
        assert!(metadata.contains("id: abc"), "{metadata}");
        assert!(metadata.contains("step_max: 1"), "{metadata}");
        assert!(
            metadata.contains("https://api.wandb.ai/files/team/proj/abc"),
            "{metadata}"
        );
        assert_eq!(read(&dir.join(CONFIG_FILE)), "batch_size: 32\nlr: 0.01\n");
    }

    #[tokio::test]
    async fn runs_below_threshold_get_no_directory() {
        let tmp = TempDir::new().unwrap();
        let api = MockTrackingApi::new().with_run(
            run("abc", Some("tiny")),
            json!([{"_step": 0, "loss": 1.0}]),
        );
        let mut settings = settings(tmp.path());
        settings.min_n_metrics = 5;
        let exporter = Exporter::new(api, settings);

        let mut directories = RunDirectories::default();
        let outcome = exporter
            .export_run(&run("abc", Some("tiny")), &mut directories)
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Skipped {
                reason: SkipReason::TooFewMetrics { found: 2, required: 5 }
            }
        ));
        assert!(!tmp.path().join("tiny").exists());

        let summary = exporter.run().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.exported, 0);
    }

    #[tokio::test]
    async fn failed_run_does_not_stop_the_export() {
        let tmp = TempDir::new().unwrap();
        let api = MockTrackingApi::new()
            .with_failing_run(run("bad", Some("broken")), "service unavailable")
            .with_run(run("good", Some("fine")), two_scalar_history());
        let exporter = Exporter::new(api, settings(tmp.path()));

        let summary = exporter.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exported, 1);
        assert_eq!(exporter.api.history_calls(), vec!["bad", "good"]);
        assert!(!tmp.path().join("broken").exists());
        assert!(tmp.path().join("fine").join(SCALARS_FILE).exists());
    }

    #[tokio::test]
    async fn listing_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let api = MockTrackingApi::new().with_list_error("permission denied");
        let exporter = Exporter::new(api, settings(tmp.path()));

        let err = exporter.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("permission denied"), "{err:#}");
    }

    #[tokio::test]
    async fn histogram_columns_only_land_in_histograms() {
        let tmp = TempDir::new().unwrap();
        let histogram = json!({"_type": "histogram", "bins": [0, 1], "values": [3]});
        let api = MockTrackingApi::new().with_run(
            run("abc", Some("hist")),
            json!([{"_step": 0, "loss": 1.0, "weights": histogram}]),
        );
        let exporter = Exporter::new(api, settings(tmp.path()));
        exporter.run().await.unwrap();

        let dir = tmp.path().join("hist");
        assert_eq!(read(&dir.join(SCALARS_FILE)), "_step,loss\n0,1.0\n");
        let histograms: Value = serde_json::from_str(&read(&dir.join(HISTOGRAMS_FILE))).unwrap();
        assert_eq!(histograms, json!({"weights": [histogram]}));
    }

    #[tokio::test]
    async fn colliding_names_get_the_run_id() {
        let tmp = TempDir::new().unwrap();
        let api = MockTrackingApi::new()
            .with_run(run("a1", Some("sweep/trial")), two_scalar_history())
            .with_run(run("b2", Some("sweep_trial")), two_scalar_history())
            .with_run(run("c3", None), two_scalar_history());
        let exporter = Exporter::new(api, settings(tmp.path()));

        let summary = exporter.run().await.unwrap();
        assert_eq!(summary.exported, 3);
        assert!(tmp.path().join("sweep_trial").is_dir());
        assert!(tmp.path().join("sweep_trial_b2").is_dir());
        assert!(tmp.path().join("c3").is_dir());
    }

    #[test]
    fn same_run_keeps_its_directory() {
        let mut directories = RunDirectories::default();
        let first = run("a1", Some("x"));
        assert_eq!(directories.assign(&first), "x");
        assert_eq!(directories.assign(&first), "x");
        assert_eq!(directories.assign(&run("b2", Some("x"))), "x_b2");
        assert_eq!(directories.assign(&run("b2", Some("x_b2"))), "x_b2");
    }

    #[tokio::test]
    async fn rerunning_produces_identical_files() {
        let tmp = TempDir::new().unwrap();
        let history = json!([
            {"_step": 0, "loss": 1.0, "sample": {"_type": "image-file", "path": "a.png"}},
            {"_step": 1, "acc": 0.3, "sample": {"_type": "image-file", "path": "b.png"}},
        ]);
        let api = MockTrackingApi::new().with_run(run("abc", Some("again")), history);
        let mut settings = settings(tmp.path());
        settings.sample_rule = SampleRule::AnyValue;
        let exporter = Exporter::new(api, settings);

        exporter.run().await.unwrap();
        let dir = tmp.path().join("again");
        let files = [METADATA_FILE, SCALARS_FILE, HISTOGRAMS_FILE, IMAGES_URLS_FILE, CONFIG_FILE];
        let first: Vec<Vec<u8>> = files.iter().map(|f| fs::read(dir.join(f)).unwrap()).collect();

        exporter.run().await.unwrap();
        let second: Vec<Vec<u8>> = files.iter().map(|f| fs::read(dir.join(f)).unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(read(&dir.join(SCALARS_FILE)), "_step,loss,acc\n0,1.0,\n1,,0.3\n");
    }
}
