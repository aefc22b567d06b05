mod basic;
mod credential;
mod models;
mod remote;
mod storage;

pub use basic::{BasicConfig, WorkingCopy};
pub use credential::CredentialConfig;
pub use models::ModelsConfig;
pub use remote::{DriveConfig, DropboxConfig};
pub(crate) use remote::{DROPBOX_AUTH_URL, DROPBOX_TOKEN_URL, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
pub use storage::{BackendKind, StorageBackend, StorageConfig};

use crate::error::SyncError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Process-level settings (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Remote storage selection and sync cadence (see `storage` table).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Model registry policy (see `models` table).
    #[serde(default)]
    pub models: ModelsConfig,

    /// OAuth credential lifecycle (see `credential` table).
    #[serde(default)]
    pub credential: CredentialConfig,

    /// Dropbox endpoints, used when `storage.backend = "dropbox"`.
    #[serde(default)]
    pub dropbox: DropboxConfig,

    /// Google Drive endpoints, used when `storage.backend = "google_drive"`.
    #[serde(default)]
    pub google_drive: DriveConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "INTENTSYNC_";

impl Config {
    /// Builds a Figment that merges defaults, an optional TOML file and `INTENTSYNC_*` env vars.
    ///
    /// Nested keys use a double underscore: `INTENTSYNC_STORAGE__BACKEND=dropbox`.
    pub fn figment_from(path: &Path) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if path.is_file() {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn figment() -> Figment {
        Self::figment_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads and validates configuration from `config.toml` (if present) and the environment.
    pub fn load() -> Result<Self, SyncError> {
        let cfg: Self = Self::figment().extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        self.models.validate()?;
        self.storage.validate()?;
        if self.storage.backend.is_remote() {
            self.credential.validate()?;
        }
        Ok(())
    }

    /// Resolves the closed backend variant once at startup.
    pub fn backend(&self) -> StorageBackend {
        match self.storage.backend {
            BackendKind::Local => StorageBackend::Local {
                root: self.local_root(),
            },
            BackendKind::Dropbox => StorageBackend::Dropbox(self.dropbox.clone()),
            BackendKind::GoogleDrive => StorageBackend::GoogleDrive(self.google_drive.clone()),
        }
    }

    pub fn local_root(&self) -> PathBuf {
        self.storage
            .local_root
            .clone()
            .unwrap_or_else(|| self.basic.data_dir.join("remote"))
    }

    pub fn token_file(&self) -> PathBuf {
        self.credential
            .token_file
            .clone()
            .unwrap_or_else(|| self.basic.data_dir.join("tokens.json"))
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.basic.data_dir.join("models")
    }

    pub fn working_db_path(&self) -> Option<PathBuf> {
        match self.basic.working_copy {
            WorkingCopy::Memory => None,
            WorkingCopy::Disk => Some(self.basic.data_dir.join("working.db")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_local_and_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.backend, BackendKind::Local);
        assert_eq!(cfg.storage.db_sync_interval_seconds, 60);
        assert_eq!(cfg.storage.model_sync_interval_seconds, 300);
        assert_eq!(cfg.models.max_versions_to_keep, 5);
        assert!((cfg.models.base_weight - 2.0).abs() < f64::EPSILON);
        assert!((cfg.models.member_weight - 1.0).abs() < f64::EPSILON);
        cfg.validate().expect("defaults validate");
        assert!(matches!(cfg.backend(), StorageBackend::Local { .. }));
    }

    #[test]
    fn toml_accepts_camel_case_aliases_and_backend_names() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[storage]
backend = "cloudA"
dbKey = "db/main.sql"
modelsPrefix = "clf"
dbSyncIntervalSeconds = 15

[models]
maxVersionsToKeep = 3

[credential]
app_id = "app"
app_secret = "secret"
"#
        )
        .expect("write toml");

        let cfg: Config = Config::figment_from(file.path())
            .extract()
            .expect("extract config");
        assert_eq!(cfg.storage.backend, BackendKind::Dropbox);
        assert_eq!(cfg.storage.db_key, "db/main.sql");
        assert_eq!(cfg.storage.models_prefix, "clf");
        assert_eq!(cfg.storage.db_sync_interval_seconds, 15);
        assert_eq!(cfg.models.max_versions_to_keep, 3);
        cfg.validate().expect("valid remote config");
        assert!(matches!(cfg.backend(), StorageBackend::Dropbox(_)));
    }

    #[test]
    fn remote_backend_requires_app_credentials() {
        let mut cfg = Config::default();
        cfg.storage.backend = BackendKind::GoogleDrive;
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn base_weight_must_dominate_member_weight() {
        let mut cfg = Config::default();
        cfg.models.base_weight = 0.5;
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
    }
}
