use super::index::RegistryIndex;
use crate::error::SyncError;
use bytes::Bytes;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

const INDEX_FILE: &str = "index.json";

/// Local directory holding artifact copies and the last known index.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file for a remote key: its last path segment.
    fn path_of(&self, key: &str) -> PathBuf {
        let name = key.rsplit('/').next().unwrap_or(key);
        self.dir.join(name)
    }

    pub async fn read(&self, key: &str) -> Result<Option<Bytes>, SyncError> {
        match fs::read(self.path_of(key)).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError> {
        write_atomic(&self.path_of(key), bytes).await?;
        debug!(key, size = bytes.len(), "Artifact cached");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), SyncError> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_index(&self) -> Result<Option<RegistryIndex>, SyncError> {
        match fs::read(self.dir.join(INDEX_FILE)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_index(&self, index: &RegistryIndex) -> Result<(), SyncError> {
        let body = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &body).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
