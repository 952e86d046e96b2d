//! Shared pieces of the `wandb-export` binaries.

pub mod commands;
pub mod logging;

use std::path::PathBuf;

use clap::Args;
use wandb_export_core::ConfigPaths;
use wandb_export_core::config::DIR_CONFIGS;
use wandb_export_core::config::NAME_CONFIG_DEFAULT;

/// Location of the configuration file.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[arg(long, default_value = DIR_CONFIGS, help = "Directory holding the config files")]
    pub config_dir: PathBuf,

    #[arg(
        long,
        short = 'c',
        default_value = NAME_CONFIG_DEFAULT,
        help = "Config file name inside the config directory (.yaml is optional)"
    )]
    pub config_name: String,
}

impl ConfigArgs {
    pub fn paths(&self) -> ConfigPaths {
        ConfigPaths::new(&self.config_dir, &self.config_name)
    }
}
