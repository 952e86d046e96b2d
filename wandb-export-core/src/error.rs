//! Error types for the export pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the remote tracking service.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Transport-level failure (connection, timeout, TLS, body decoding).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status code.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The GraphQL layer reported one or more errors.
    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// The response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Setup failures that abort an export before any run is processed.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(
        "config directory '{}' does not exist\n\
         To initialize the config, run 'wandb-export-init-config' first.\n\
         Then run 'wandb-export' with optional overrides, e.g. 'wandb-export project=my-project samples=500'.",
        .dir.display()
    )]
    MissingConfigDir { dir: PathBuf },

    #[error("invalid override '{0}': expected KEY=VALUE")]
    InvalidOverride(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
