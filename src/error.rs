//! Error types for the background process

use thiserror::Error;

/// Result alias used across the crate
pub type PauseResult<T> = Result<T, PauseError>;

#[derive(Error, Debug)]
pub enum PauseError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Developer-facing contract violation on the message transport
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Invalid pause duration: {0}ms")]
    InvalidDuration(u64),

    #[error("Alarm error: {0}")]
    Alarm(String),

    #[error("Background process is not running")]
    Disconnected,

    #[error("Task error: {0}")]
    Task(String),
}

impl PauseError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_setting(msg: impl Into<String>) -> Self {
        Self::InvalidSetting(msg.into())
    }

    pub fn alarm(msg: impl Into<String>) -> Self {
        Self::Alarm(msg.into())
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<tokio::task::JoinError> for PauseError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
