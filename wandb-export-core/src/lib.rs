//! Core library for exporting W&B runs to local CSV/JSON/YAML files.

pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod exporter;
pub mod history;
pub mod writer;

pub use api::ProjectPath;
pub use api::Run;
pub use api::TrackingApi;
pub use api::WandbClient;
pub use classify::ColumnBuckets;
pub use classify::SampleRule;
pub use classify::classify_columns;
pub use config::ConfigPaths;
pub use config::DataTypes;
pub use config::ExportSettings;
pub use config::InitOutcome;
pub use config::init_config;
pub use config::load_config;
pub use error::ApiError;
pub use error::ExportError;
pub use exporter::ExportSummary;
pub use exporter::Exporter;
pub use exporter::RunOutcome;
pub use exporter::SkipReason;
pub use history::HistoryTable;
