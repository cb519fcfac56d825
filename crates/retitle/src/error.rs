use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetitleError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Admission error: {0}")]
    Admission(#[from] crate::admission::AdmissionError),

    #[error("Approval error: {0}")]
    Approval(#[from] crate::approval::ApprovalError),

    #[error("Plan error: {0}")]
    Plan(#[from] crate::plan::PlanError),

    #[error("Outcome error: {0}")]
    Outcome(#[from] crate::outcome::OutcomeError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::client::UpstreamError),

    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),
}

impl RetitleError {
    /// Transient failures worth another delivery attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RetitleError::Plan(e) => e.is_retryable(),
            RetitleError::Outcome(e) => e.is_retryable(),
            RetitleError::Upstream(e) => e.is_retryable(),
            RetitleError::Database(e) => e.is_busy(),
            RetitleError::Config(_)
            | RetitleError::Admission(_)
            | RetitleError::Approval(_)
            | RetitleError::Broker(_) => false,
        }
    }
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

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Unknown setting '{0}'")]
    UnknownKey(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Settings store error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, RetitleError>;
