use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Rebuild registry error: {0}")]
    Registry(#[from] crate::rebuild::RegistryError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] crate::reconcile::ReconcileError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors surfaced by the domain processor across its seam. The
/// coordinator never inspects these beyond recording their text on the
/// failed work item.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Failed to parse records: {0}")]
    Parse(String),

    #[error("Failed to read upload '{path}': {source}")]
    ReadUpload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write records: {0}")]
    WriteRecords(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, IntakeError>;
