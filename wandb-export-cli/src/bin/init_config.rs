use anyhow::Result;
use clap::Parser;
use wandb_export_cli::ConfigArgs;
use wandb_export_cli::commands;
use wandb_export_cli::logging;

#[derive(Parser)]
#[command(name = "wandb-export-init-config")]
#[command(about = "Write the default wandb-export config if none exists", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(false, false);

    commands::handle_init_config(&cli.config.paths())?;
    Ok(())
}
