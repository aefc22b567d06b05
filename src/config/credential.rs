use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

/// OAuth app settings. Key and secret are injected (env/TOML), never compiled in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialConfig {
    /// Tokens are treated as expired this long before their reported expiry.
    /// TOML: `credential.refresh_skew_seconds`. Default: `300`.
    #[serde(default = "default_refresh_skew", alias = "refreshSkewSeconds")]
    pub refresh_skew_seconds: u64,

    /// Persisted credential file. Default: `<data_dir>/tokens.json`.
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// OAuth client id (Dropbox app key / Google client id).
    #[serde(default)]
    pub app_id: String,

    /// OAuth client secret.
    #[serde(default)]
    pub app_secret: String,

    /// Optional refresh token used to seed the token file on first start.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Token endpoint override; defaults to the selected backend's endpoint.
    #[serde(default)]
    pub token_url: Option<Url>,

    /// Authorization endpoint override; defaults to the selected backend's endpoint.
    #[serde(default)]
    pub auth_url: Option<Url>,

    /// Cadence of the pre-emptive refresh task.
    /// TOML: `credential.refresh_check_interval_seconds`. Default: `120`.
    #[serde(default = "default_refresh_check_interval")]
    pub refresh_check_interval_seconds: u64,

    /// Token endpoint calls allowed per minute.
    /// TOML: `credential.refresh_per_minute`. Default: `6`.
    #[serde(default = "default_refresh_per_minute")]
    pub refresh_per_minute: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_skew_seconds: default_refresh_skew(),
            token_file: None,
            app_id: String::new(),
            app_secret: String::new(),
            refresh_token: None,
            token_url: None,
            auth_url: None,
            refresh_check_interval_seconds: default_refresh_check_interval(),
            refresh_per_minute: default_refresh_per_minute(),
        }
    }
}

impl CredentialConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.app_id.trim().is_empty() || self.app_secret.trim().is_empty() {
            return Err(SyncError::Config(
                "credential.app_id and credential.app_secret must be set for remote backends"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_seconds)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_seconds.max(1))
    }
}

fn default_refresh_skew() -> u64 {
    300
}

fn default_refresh_check_interval() -> u64 {
    120
}

fn default_refresh_per_minute() -> u32 {
    6
}
