#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use intentsync::{SyncError, config::BackendKind, storage::RemoteStore};
use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

/// In-memory remote store with switchable outages.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, Bytes>>,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    /// Every call fails with a network error.
    pub offline: AtomicBool,
    /// Only writes fail with a network error.
    pub reject_writes: AtomicBool,
    /// One-shot stall for the next put whose key contains the pattern.
    stall: Mutex<Option<(String, Duration)>>,
}

impl MemoryStore {
    pub fn go_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn stall_next_put(&self, pattern: &str, delay: Duration) {
        *self.stall.lock().unwrap() = Some((pattern.to_string(), delay));
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.into());
    }

    fn check(&self, write: bool) -> Result<(), SyncError> {
        if self.offline.load(Ordering::SeqCst)
            || (write && self.reject_writes.load(Ordering::SeqCst))
        {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn exists(&self, key: &str) -> Result<bool, SyncError> {
        self.check(false)?;
        Ok(self.files.lock().unwrap().contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Bytes, SyncError> {
        self.check(false)?;
        self.raw(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), SyncError> {
        let stall = {
            let mut stall = self.stall.lock().unwrap();
            match stall.as_ref() {
                Some((pattern, _)) if key.contains(pattern.as_str()) => stall.take(),
                _ => None,
            }
        };
        if let Some((_, delay)) = stall {
            tokio::time::sleep(delay).await;
        }
        self.check(true)?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(key, bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        self.check(false)?;
        let prefix = prefix.trim_end_matches('/');
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| prefix.is_empty() || k.starts_with(&format!("{prefix}/")))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        self.check(true)?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().remove(key);
        Ok(())
    }
}
