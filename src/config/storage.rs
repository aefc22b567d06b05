use super::remote::{DriveConfig, DropboxConfig};
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Backend names accepted in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    #[serde(alias = "cloudA", alias = "cloud_a")]
    Dropbox,
    #[serde(alias = "cloudB", alias = "cloud_b", alias = "drive")]
    GoogleDrive,
}

impl BackendKind {
    pub fn is_remote(self) -> bool {
        !matches!(self, BackendKind::Local)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Dropbox => "dropbox",
            BackendKind::GoogleDrive => "google_drive",
        }
    }
}

/// Selected backend with its own settings. Resolved once at process start.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local { root: PathBuf },
    Dropbox(DropboxConfig),
    GoogleDrive(DriveConfig),
}

impl StorageBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            StorageBackend::Local { .. } => BackendKind::Local,
            StorageBackend::Dropbox(_) => BackendKind::Dropbox,
            StorageBackend::GoogleDrive(_) => BackendKind::GoogleDrive,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// TOML: `storage.backend` (`local`, `dropbox`/`cloudA`, `google_drive`/`cloudB`).
    #[serde(default)]
    pub backend: BackendKind,

    /// Remote key of the database snapshot.
    /// TOML: `storage.db_key`. Default: `intentsync.db`.
    #[serde(default = "default_db_key", alias = "dbKey")]
    pub db_key: String,

    /// Remote key prefix for model artifacts, the index and the latest pointer.
    /// TOML: `storage.models_prefix`. Default: `models`.
    #[serde(default = "default_models_prefix", alias = "modelsPrefix")]
    pub models_prefix: String,

    /// TOML: `storage.db_sync_interval_seconds`. Default: `60`.
    #[serde(default = "default_db_sync_interval", alias = "dbSyncIntervalSeconds")]
    pub db_sync_interval_seconds: u64,

    /// TOML: `storage.model_sync_interval_seconds`. Default: `300`.
    #[serde(
        default = "default_model_sync_interval",
        alias = "modelSyncIntervalSeconds"
    )]
    pub model_sync_interval_seconds: u64,

    /// Per remote call timeout; elapsed calls count as network errors.
    /// TOML: `storage.request_timeout_seconds`. Default: `30`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Upper bound for the multiplicative sync backoff.
    /// TOML: `storage.backoff_ceiling_seconds`. Default: `900`.
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_seconds: u64,

    /// TOML: `storage.backoff_factor`. Default: `2.0`.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f32,

    /// Max retry attempts for transient network failures on a single call.
    /// TOML: `storage.retry_max_times`. Default: `2`.
    #[serde(default = "default_retry_max_times")]
    pub retry_max_times: usize,

    /// Root directory of the `local` backend. Default: `<data_dir>/remote`.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            db_key: default_db_key(),
            models_prefix: default_models_prefix(),
            db_sync_interval_seconds: default_db_sync_interval(),
            model_sync_interval_seconds: default_model_sync_interval(),
            request_timeout_seconds: default_request_timeout(),
            backoff_ceiling_seconds: default_backoff_ceiling(),
            backoff_factor: default_backoff_factor(),
            retry_max_times: default_retry_max_times(),
            local_root: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.db_key.trim().is_empty() {
            return Err(SyncError::Config("storage.db_key must be non-empty".into()));
        }
        if self.db_sync_interval_seconds == 0 || self.model_sync_interval_seconds == 0 {
            return Err(SyncError::Config(
                "storage sync intervals must be positive".into(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(SyncError::Config(
                "storage.backoff_factor must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_seconds)
    }

    pub fn db_sync_interval(&self) -> Duration {
        Duration::from_secs(self.db_sync_interval_seconds)
    }

    pub fn model_sync_interval(&self) -> Duration {
        Duration::from_secs(self.model_sync_interval_seconds)
    }
}

fn default_db_key() -> String {
    "intentsync.db".to_string()
}

fn default_models_prefix() -> String {
    "models".to_string()
}

fn default_db_sync_interval() -> u64 {
    60
}

fn default_model_sync_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_backoff_ceiling() -> u64 {
    900
}

fn default_backoff_factor() -> f32 {
    2.0
}

fn default_retry_max_times() -> usize {
    2
}
