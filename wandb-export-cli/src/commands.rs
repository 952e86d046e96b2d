use anyhow::Context;
use anyhow::Result;
use wandb_export_core::ConfigPaths;
use wandb_export_core::ExportSummary;
use wandb_export_core::Exporter;
use wandb_export_core::InitOutcome;
use wandb_export_core::WandbClient;
use wandb_export_core::init_config;
use wandb_export_core::load_config;

/// Resolve the configuration and export every matching run.
pub async fn handle_export(paths: &ConfigPaths, overrides: &[String]) -> Result<ExportSummary> {
    let settings = load_config(paths, overrides)?;
    tracing::debug!(
        project = %settings.project,
        export_dir = %settings.export_dir.display(),
        "resolved configuration"
    );

    let client = WandbClient::new(&settings.api).context("failed to build W&B client")?;
    Exporter::new(client, settings).run().await
}

/// Seed the config directory with the default template and report what
/// happened.
pub fn handle_init_config(paths: &ConfigPaths) -> Result<InitOutcome> {
    let outcome = init_config(paths)?;

    match &outcome {
        InitOutcome::Created(path) => {
            println!("Default config created at {}", path.display());
        }
        InitOutcome::AlreadyExists(path) => {
            println!(
                "Default config already exists at {}. Please remove/rename it and run again to recreate it.",
                path.display()
            );
        }
    }

    Ok(outcome)
}
