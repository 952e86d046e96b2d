use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

const CRATES: [&str; 2] = ["wandb_export_core", "wandb_export_cli"];

/// Install the global fmt subscriber on stderr. `-v`/`-q` pick the level;
/// without them `RUST_LOG` is honoured, falling back to `info`.
pub fn init(verbose: bool, quiet: bool) {
    let filter = match (verbose, quiet) {
        (true, _) => crate_filter("debug"),
        (false, true) => crate_filter("warn"),
        (false, false) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| crate_filter("info"))
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn crate_filter(level: &str) -> EnvFilter {
    let directives: Vec<String> = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect();
    EnvFilter::new(directives.join(","))
}
