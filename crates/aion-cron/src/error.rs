use thiserror::Error;

/// Errors raised by job storage and scheduling.
#[derive(Debug, Error)]
pub enum CronError {
    /// Unknown job id on get/update/remove.
    #[error("Job not found: {0}")]
    NotFound(String),
    /// Malformed schedule, missing conversation, or other bad input.
    #[error("Invalid job: {0}")]
    Validation(String),
    /// Target conversation or agent unavailable at fire time.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
    #[error("Connector error: {0}")]
    Connector(#[from] anyhow::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CronError {
    pub fn validation(message: impl Into<String>) -> Self {
        CronError::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
