mod authorized;
mod dropbox;
mod drive;
mod guarded;
mod local;

pub use dropbox::DropboxStore;
pub use drive::DriveStore;
pub use guarded::GuardedStore;
pub use local::LocalStore;

pub(crate) use authorized::Authorized;

use crate::{
    config::{BackendKind, Config, StorageBackend},
    credential::CredentialManager,
    error::SyncError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tracing::info;

pub(crate) const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;

/// Uniform key/value view over a remote object store.
///
/// Keys are relative, `/`-separated paths such as `models/index.json`. Stores move opaque bytes
/// and never interpret them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn exists(&self, key: &str) -> Result<bool, SyncError>;

    /// Fails with [`SyncError::NotFound`] when the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, SyncError>;

    /// Creates or overwrites `key`.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), SyncError>;

    /// Keys under `prefix`, sorted. An absent prefix yields an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError>;

    /// Removes `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), SyncError>;
}

/// Builds the store selected by configuration, wrapped in a [`GuardedStore`].
///
/// Remote variants require a [`CredentialManager`]; the local variant ignores it.
pub fn build_remote_store(
    cfg: &Config,
    creds: Option<Arc<CredentialManager>>,
) -> Result<Arc<dyn RemoteStore>, SyncError> {
    let backend = cfg.backend();
    // Cloud calls retry internally, so the guard has to outlast every attempt.
    let (inner, budget): (Arc<dyn RemoteStore>, Duration) = match backend {
        StorageBackend::Local { root } => {
            (Arc::new(LocalStore::new(root)), cfg.storage.request_timeout())
        }
        StorageBackend::Dropbox(dropbox) => {
            let auth = Authorized::new(require_creds(creds, BackendKind::Dropbox)?, cfg);
            (
                Arc::new(DropboxStore::new(dropbox, http_client(cfg)?, auth)),
                Authorized::call_budget(cfg),
            )
        }
        StorageBackend::GoogleDrive(drive) => {
            let auth = Authorized::new(require_creds(creds, BackendKind::GoogleDrive)?, cfg);
            (
                Arc::new(DriveStore::new(drive, http_client(cfg)?, auth)),
                Authorized::call_budget(cfg),
            )
        }
    };

    info!(
        backend = inner.kind().as_str(),
        timeout_secs = cfg.storage.request_timeout_seconds,
        budget = ?budget,
        "Remote store selected"
    );
    Ok(Arc::new(GuardedStore::new(inner, budget)))
}

fn require_creds(
    creds: Option<Arc<CredentialManager>>,
    kind: BackendKind,
) -> Result<Arc<CredentialManager>, SyncError> {
    creds.ok_or_else(|| {
        SyncError::Config(format!(
            "backend {} needs a credential manager",
            kind.as_str()
        ))
    })
}

/// HTTP client shared by the cloud stores.
pub(crate) fn http_client(cfg: &Config) -> Result<reqwest::Client, SyncError> {
    reqwest::Client::builder()
        .user_agent(concat!("intentsync/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .timeout(cfg.storage.request_timeout())
        .build()
        .map_err(|e| SyncError::Config(format!("storage HTTP client: {e}")))
}

/// Rejects keys that are empty, absolute or escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<(), SyncError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(SyncError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Normalizes a list prefix: `""` lists everything, trailing slashes are dropped.
pub(crate) fn normalize_prefix(prefix: &str) -> Result<String, SyncError> {
    let trimmed = prefix.trim_end_matches('/');
    if !trimmed.is_empty() {
        validate_key(trimmed)?;
    }
    Ok(trimmed.to_string())
}

pub(crate) fn key_matches_prefix(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub(crate) async fn body_preview(resp: reqwest::Response) -> String {
    match resp.bytes().await {
        Ok(bytes) => {
            let raw = String::from_utf8_lossy(&bytes);
            format!("{:.len$}", raw, len = UPSTREAM_BODY_PREVIEW_CHARS)
        }
        Err(e) => format!("<failed to read body: {e}>"),
    }
}
