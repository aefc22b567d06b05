use super::token::Credential;
use crate::error::SyncError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Durable JSON file holding the last known [`Credential`].
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Credential, SyncError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::CredentialMissing);
            }
            Err(e) => return Err(e.into()),
        };
        let cred: Credential = serde_json::from_slice(&raw)?;
        if cred.refresh_token().trim().is_empty() {
            return Err(SyncError::CredentialMissing);
        }
        debug!(path = %self.path.display(), "Loaded credential file");
        Ok(cred)
    }

    /// Overwrites the file via write-then-rename so readers never see a torn file.
    pub async fn save(&self, cred: &Credential) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(cred)?;
        let tmp = self.path.with_extension("json.partial");
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Persisted credential file");
        Ok(())
    }

    pub async fn remove(&self) -> Result<(), SyncError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Credential file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
