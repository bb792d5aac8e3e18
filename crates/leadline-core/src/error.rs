//! Error taxonomy shared by every core component

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transport failure or transient server error; the write may be retried
    #[error("Network error: {0}")]
    Network(String),

    /// The payload was rejected; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote state changed incompatibly since the mutation was queued
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Notification or push permission refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Local durable storage is full
    #[error("Local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The session is missing or expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Local database failure other than quota exhaustion
    #[error("Storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether a failed write should go back to the queue for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Classify a non-success HTTP status returned by the remote store.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", body.trim())
        };
        match status {
            401 | 403 => SyncError::Unauthorized(detail),
            409 => SyncError::Conflict(detail),
            408 | 425 | 429 => SyncError::Network(detail),
            500..=599 => SyncError::Network(detail),
            _ => SyncError::Validation(detail),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => SyncError::QuotaExceeded(err.to_string()),
            _ => SyncError::Storage(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return SyncError::from_status(status.as_u16(), "");
        }
        if err.is_decode() {
            return SyncError::Validation(format!("unexpected response body: {err}"));
        }
        SyncError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization: {err}"))
    }
}
