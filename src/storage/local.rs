use super::{RemoteStore, key_matches_prefix, normalize_prefix, validate_key};
use crate::{config::BackendKind, error::SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

/// Filesystem-backed store. Keys are paths relative to `root`; no credentials involved.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, SyncError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        let path = self.path_of(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, SyncError> {
        let path = self.path_of(key)?;
        match fs::read(&path).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SyncError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), SyncError> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}{PARTIAL_SUFFIX}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key, size = bytes.len(), "Local put");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let prefix = normalize_prefix(prefix)?;
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if file_type.is_file()
                    && !name.ends_with(PARTIAL_SUFFIX)
                    && key_matches_prefix(&key, &prefix)
                {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(!store.exists("intentsync.db").await.unwrap());
        assert!(store.get("intentsync.db").await.unwrap_err().is_not_found());

        store
            .put("models/a.mlmodel", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put("models/b.mlmodel", Bytes::from_static(b"b"))
            .await
            .unwrap();
        store
            .put("intentsync.db", Bytes::from_static(b"db"))
            .await
            .unwrap();

        assert_eq!(
            store.list("models").await.unwrap(),
            vec!["models/a.mlmodel", "models/b.mlmodel"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert_eq!(store.get("models/b.mlmodel").await.unwrap(), "b");

        store.delete("models/a.mlmodel").await.unwrap();
        store.delete("models/a.mlmodel").await.unwrap();
        assert_eq!(store.list("models/").await.unwrap(), vec!["models/b.mlmodel"]);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let err = store
            .put("../outside", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)));
    }
}
