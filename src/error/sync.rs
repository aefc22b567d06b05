use super::IsRetryable;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SyncError {
    #[error("No persisted credential; run the OAuth exchange first")]
    CredentialMissing,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting remote mutation on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Invalid ensemble: {0}")]
    InvalidEnsemble(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource is closed")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Failures that synchronization absorbs by continuing on the local copy.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            SyncError::CredentialMissing
                | SyncError::Auth(_)
                | SyncError::Network(_)
                | SyncError::QuotaExceeded(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(e: figment::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl IsRetryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}
