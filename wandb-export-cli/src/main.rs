use std::process::ExitCode;

use clap::Parser;
use wandb_export_cli::ConfigArgs;
use wandb_export_cli::commands;
use wandb_export_cli::logging;

#[derive(Parser)]
#[command(name = "wandb-export")]
#[command(about = "Export W&B runs to local CSV/JSON/YAML files", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, short, conflicts_with = "quiet", help = "Show debug output")]
    verbose: bool,

    #[arg(long, short, help = "Only show warnings and errors")]
    quiet: bool,

    #[arg(
        value_name = "KEY=VALUE",
        help = "Config overrides, e.g. project=my-project data_types.histogram=false"
    )]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match commands::handle_export(&cli.config.paths(), &cli.overrides).await {
        Ok(summary) => {
            if !cli.quiet {
                println!("{summary}");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
