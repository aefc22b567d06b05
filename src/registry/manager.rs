use super::{
    cache::ArtifactCache,
    ensemble::EnsembleSpec,
    index::RegistryIndex,
    version::{ModelKind, ModelMetadata, ModelVersion, VersionId},
};
use crate::{
    config::{Config, ModelsConfig},
    db::snapshot::sha256_hex,
    error::SyncError,
    scheduler::{Reconcile, SyncOutcome},
    storage::RemoteStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{fmt, sync::Arc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

struct RegistryState {
    index: RegistryIndex,
    /// Highest id handed out but maybe not inserted yet.
    reserved: Option<VersionId>,
    /// Index revision last mirrored to the remote store.
    pushed_revision: u64,
}

impl RegistryState {
    fn reserve(&mut self, prefix: &str) -> VersionId {
        let newest = match (self.index.newest_id(), self.reserved.as_ref()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let id = VersionId::next_after(prefix, Utc::now(), newest);
        self.reserved = Some(id.clone());
        id
    }

    fn is_dirty(&self) -> bool {
        self.index.revision > self.pushed_revision
    }
}

/// Versioned model artifacts in the remote store, with a local cache and a revisioned index.
///
/// The index (including the latest pointer) is only mutated under one lock; artifact transfers
/// happen outside it.
pub struct ModelRegistry {
    store: Arc<dyn RemoteStore>,
    cache: ArtifactCache,
    prefix: String,
    policy: ModelsConfig,
    state: Mutex<RegistryState>,
    publish: Mutex<()>,
    changes: Arc<Notify>,
}

/// Metadata of one version plus a lazy handle on its artifact bytes.
#[derive(Clone)]
pub struct ModelHandle {
    version: ModelVersion,
    store: Arc<dyn RemoteStore>,
    cache: ArtifactCache,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("version", &self.version)
            .field("store", &self.store.kind())
            .finish()
    }
}

impl ModelHandle {
    pub fn version(&self) -> &ModelVersion {
        &self.version
    }

    pub fn into_version(self) -> ModelVersion {
        self.version
    }

    /// Artifact bytes, from the local cache when it holds an intact copy, otherwise from the
    /// remote store (written through to the cache).
    ///
    /// The artifact is returned whole: its SHA-256 is checked against the version record before
    /// any byte is handed out, so a partial stream could expose unverified content.
    pub async fn fetch(&self) -> Result<Bytes, SyncError> {
        let key = &self.version.artifact_ref;
        if let Some(bytes) = self.cache.read(key).await? {
            if sha256_hex(&bytes) == self.version.sha256 {
                return Ok(bytes);
            }
            warn!(key = %key, "Cached artifact does not match its hash, refetching");
        }

        let bytes = self.store.get(key).await?;
        let found = sha256_hex(&bytes);
        if found != self.version.sha256 {
            return Err(SyncError::Conflict {
                key: key.clone(),
                expected: self.version.sha256.clone(),
                found,
            });
        }
        if let Err(e) = self.cache.write(key, &bytes).await {
            warn!(key = %key, error = %e, "Failed to cache fetched artifact");
        }
        debug!(key = %key, size = bytes.len(), "Artifact fetched from remote store");
        Ok(bytes)
    }
}

impl ModelRegistry {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: ArtifactCache,
        prefix: impl Into<String>,
        policy: ModelsConfig,
    ) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            store,
            cache,
            prefix,
            policy,
            state: Mutex::new(RegistryState {
                index: RegistryIndex::default(),
                reserved: None,
                pushed_revision: 0,
            }),
            publish: Mutex::new(()),
            changes: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(cfg: &Config, store: Arc<dyn RemoteStore>) -> Self {
        Self::new(
            store,
            ArtifactCache::new(cfg.model_cache_dir()),
            cfg.storage.models_prefix.clone(),
            cfg.models.clone(),
        )
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    fn index_key(&self) -> String {
        self.key("index.json")
    }

    fn latest_key(&self) -> String {
        self.key("latest.json")
    }

    fn artifact_key(&self, id: &VersionId, kind: ModelKind) -> String {
        match kind {
            ModelKind::Ensemble => self.key(&format!("ensemble_{id}.json")),
            ModelKind::Trained | ModelKind::Uploaded => self.key(&format!("model_{id}.mlmodel")),
        }
    }

    /// Loads the local and remote index and keeps the one with the higher revision.
    ///
    /// Returns `RemoteWon` when the remote copy was adopted and `LocalFallback` when the remote
    /// index could not be read.
    pub async fn open(&self) -> Result<SyncOutcome, SyncError> {
        let local = self.cache.load_index().await?;
        let remote = match self.store.get(&self.index_key()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice::<RegistryIndex>(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) if e.is_degradable() => Err(e),
            Err(e) => return Err(e),
        };

        let mut st = self.state.lock().await;
        let outcome = match (local, remote) {
            (local, Err(e)) => {
                warn!(
                    prefix = %self.prefix,
                    error = %e,
                    "Remote model index unavailable, using local index"
                );
                st.index = local.unwrap_or_default();
                st.pushed_revision = 0;
                SyncOutcome::LocalFallback {
                    reason: e.to_string(),
                }
            }
            (Some(local), Ok(Some(mut remote))) if remote.revision > local.revision => {
                remote.pending_deletes = local.pending_deletes;
                remote.pending_uploads = local
                    .pending_uploads
                    .into_iter()
                    .filter(|id| remote.get(id).is_some())
                    .collect();
                st.pushed_revision = remote.revision;
                st.index = remote;
                SyncOutcome::RemoteWon
            }
            (None, Ok(Some(remote))) => {
                st.pushed_revision = remote.revision;
                st.index = remote;
                SyncOutcome::RemoteWon
            }
            (local, Ok(remote)) => {
                st.pushed_revision = remote.map(|r| r.revision).unwrap_or(0);
                st.index = local.unwrap_or_default();
                SyncOutcome::Unchanged
            }
        };
        self.cache.save_index(&st.index).await?;
        st.index.debug_dump("Model index loaded");

        info!(
            prefix = %self.prefix,
            revision = st.index.revision,
            versions = st.index.versions.len(),
            latest = st.index.latest.as_ref().map(VersionId::as_str).unwrap_or("<none>"),
            outcome = ?outcome,
            "Model registry opened"
        );
        if st.is_dirty() || !st.index.pending_uploads.is_empty() {
            self.changes.notify_one();
        }
        Ok(outcome)
    }

    /// Stores a new artifact version.
    ///
    /// The artifact lands in the local cache first. If the upload is refused for a reason sync
    /// tolerates, the version is still registered and the upload is retried by the next
    /// reconcile. The latest pointer moves when the version is a base, when no base exists yet,
    /// or when it is an ensemble. It never moves back to an older version, whatever order
    /// concurrent registrations complete in.
    pub async fn register(
        &self,
        bytes: Bytes,
        metadata: ModelMetadata,
    ) -> Result<ModelVersion, SyncError> {
        let id = self.state.lock().await.reserve(&self.policy.version_prefix);
        self.register_reserved(id, bytes, metadata).await
    }

    async fn register_reserved(
        &self,
        version_id: VersionId,
        bytes: Bytes,
        metadata: ModelMetadata,
    ) -> Result<ModelVersion, SyncError> {
        let artifact_ref = self.artifact_key(&version_id, metadata.kind);
        self.cache.write(&artifact_ref, &bytes).await?;

        let uploaded = match self.store.put(&artifact_ref, bytes.clone()).await {
            Ok(()) => true,
            Err(e) if e.is_degradable() => {
                warn!(
                    key = %artifact_ref,
                    error = %e,
                    "Artifact upload deferred, serving from local cache"
                );
                false
            }
            Err(e) => {
                if let Err(cleanup) = self.cache.remove(&artifact_ref).await {
                    warn!(key = %artifact_ref, error = %cleanup, "Failed to drop cached artifact");
                }
                return Err(e);
            }
        };

        let weight = metadata.weight.unwrap_or(if metadata.is_base {
            self.policy.base_weight
        } else {
            self.policy.member_weight
        });
        let version = ModelVersion {
            version_id,
            artifact_ref,
            weight,
            created_at: Utc::now(),
            is_base: metadata.is_base,
            kind: metadata.kind,
            accuracy: metadata.accuracy,
            training_data_size: metadata.training_data_size,
            description: metadata.description,
            size_bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };

        {
            let mut st = self.state.lock().await;
            let eligible = version.is_base
                || version.kind == ModelKind::Ensemble
                || st.index.current_base().is_none();
            // Overlapping registrations finish in any order; only a newer version, or the first
            // base replacing a fallback pick, may move the pointer.
            let promote = eligible
                && st.index.latest_version().is_none_or(|current| {
                    current.version_id < version.version_id
                        || (version.is_base
                            && !current.is_base
                            && current.kind != ModelKind::Ensemble)
                });
            if promote {
                st.index.latest = Some(version.version_id.clone());
            }
            if !uploaded {
                st.index.pending_uploads.push(version.version_id.clone());
            }
            st.index.insert(version.clone());
            st.index.bump();
            self.cache.save_index(&st.index).await?;

            info!(
                version = %version.version_id,
                kind = ?version.kind,
                is_base = version.is_base,
                size = version.size_bytes,
                latest = promote,
                "Model version registered"
            );
        }

        self.publish_best_effort().await?;
        Ok(version)
    }

    pub async fn get_latest(&self) -> Result<ModelHandle, SyncError> {
        let st = self.state.lock().await;
        let version = st
            .index
            .latest_version()
            .cloned()
            .ok_or_else(|| SyncError::NotFound("no model version registered".to_string()))?;
        Ok(self.handle(version))
    }

    pub async fn get_version(&self, version_id: &str) -> Result<ModelHandle, SyncError> {
        let st = self.state.lock().await;
        let version = st
            .index
            .find(version_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("model version {version_id}")))?;
        Ok(self.handle(version))
    }

    /// All registered versions, oldest first.
    pub async fn list_versions(&self) -> Vec<ModelVersion> {
        self.state.lock().await.index.versions.clone()
    }

    fn handle(&self, version: ModelVersion) -> ModelHandle {
        ModelHandle {
            version,
            store: self.store.clone(),
            cache: self.cache.clone(),
        }
    }

    /// Evicts the oldest non-base versions until at most `max_versions` remain. Base versions and
    /// the latest version are never evicted.
    ///
    /// Remote deletions that fail are remembered and retried by the next reconcile.
    pub async fn enforce_retention(
        &self,
        max_versions: usize,
    ) -> Result<Vec<ModelVersion>, SyncError> {
        let evicted = self.evict(max_versions).await?;
        if evicted.is_empty() {
            return Ok(evicted);
        }
        if let Err(e) = self.drain_deletes().await {
            if !e.is_degradable() {
                return Err(e);
            }
            warn!(error = %e, "Remote eviction deferred");
        }
        self.publish_best_effort().await?;
        Ok(evicted)
    }

    async fn evict(&self, max_versions: usize) -> Result<Vec<ModelVersion>, SyncError> {
        let mut st = self.state.lock().await;
        let non_base = st.index.versions.iter().filter(|v| !v.is_base).count();
        let excess = non_base.saturating_sub(max_versions);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let victims: Vec<VersionId> = st
            .index
            .versions
            .iter()
            .filter(|v| !v.is_base && st.index.latest.as_ref() != Some(&v.version_id))
            .take(excess)
            .map(|v| v.version_id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(victims.len());
        for id in &victims {
            if let Some(version) = st.index.remove(id) {
                st.index.pending_deletes.push(version.artifact_ref.clone());
                if let Err(e) = self.cache.remove(&version.artifact_ref).await {
                    warn!(
                        key = %version.artifact_ref,
                        error = %e,
                        "Failed to drop cached artifact"
                    );
                }
                evicted.push(version);
            }
        }
        st.index.bump();
        self.cache.save_index(&st.index).await?;

        info!(
            evicted = evicted.len(),
            kept = non_base - evicted.len(),
            max_versions,
            "Retention applied"
        );
        Ok(evicted)
    }

    /// Combines the current base with `member_refs` and registers the result as a new version,
    /// which becomes latest.
    pub async fn build_ensemble(
        &self,
        member_refs: &[&str],
        base_weight: f64,
        member_weight: f64,
    ) -> Result<(EnsembleSpec, ModelVersion), SyncError> {
        let (spec, id) = {
            let mut st = self.state.lock().await;
            let base = st.index.current_base().ok_or_else(|| {
                SyncError::InvalidEnsemble("no base model registered".to_string())
            })?;
            let members = member_refs
                .iter()
                .map(|r| {
                    st.index
                        .find(r)
                        .ok_or_else(|| SyncError::InvalidEnsemble(format!("unknown member {r}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let spec = EnsembleSpec::compose(base, &members, base_weight, member_weight)?;
            (spec, st.reserve(&self.policy.version_prefix))
        };

        let metadata = ModelMetadata {
            kind: ModelKind::Ensemble,
            weight: Some(base_weight),
            description: Some(format!(
                "base {} with {} member(s)",
                spec.base_model_ref,
                spec.member_refs.len()
            )),
            ..ModelMetadata::default()
        };
        let body = Bytes::from(serde_json::to_vec_pretty(&spec)?);
        let version = self.register_reserved(id, body, metadata).await?;
        Ok((spec, version))
    }

    /// Uploads artifacts that only exist in the cache. Returns how many went out.
    async fn retry_pending_uploads(&self) -> Result<usize, SyncError> {
        let pending: Vec<ModelVersion> = {
            let st = self.state.lock().await;
            st.index
                .pending_uploads
                .iter()
                .filter_map(|id| st.index.get(id).cloned())
                .collect()
        };

        let mut uploaded = 0;
        for version in pending {
            let bytes = self.cache.read(&version.artifact_ref).await?;
            if let Some(bytes) = bytes {
                self.store.put(&version.artifact_ref, bytes).await?;
                uploaded += 1;
                info!(version = %version.version_id, "Deferred artifact uploaded");
            } else {
                warn!(
                    version = %version.version_id,
                    "Deferred artifact missing from cache, giving up on upload"
                );
            }

            let mut st = self.state.lock().await;
            st.index.pending_uploads.retain(|id| id != &version.version_id);
            st.index.bump();
            self.cache.save_index(&st.index).await?;
        }
        Ok(uploaded)
    }

    /// Deletes evicted artifacts from the remote store. Returns how many went out.
    async fn drain_deletes(&self) -> Result<usize, SyncError> {
        let keys = self.state.lock().await.index.pending_deletes.clone();
        let mut deleted = 0;
        for key in keys {
            self.store.delete(&key).await?;
            deleted += 1;
            debug!(key = %key, "Evicted artifact deleted");

            let mut st = self.state.lock().await;
            st.index.pending_deletes.retain(|k| k != &key);
            self.cache.save_index(&st.index).await?;
        }
        Ok(deleted)
    }

    /// Mirrors the index and latest pointer when the remote copy is behind.
    async fn publish_index(&self) -> Result<SyncOutcome, SyncError> {
        let _publish = self.publish.lock().await;
        let index = {
            let st = self.state.lock().await;
            if !st.is_dirty() {
                return Ok(SyncOutcome::Unchanged);
            }
            st.index.clone()
        };

        index.debug_dump("Publishing model index");
        let body = serde_json::to_vec_pretty(&index)?;
        self.store.put(&self.index_key(), Bytes::from(body)).await?;
        if let Some(pointer) = index.latest_pointer() {
            let body = serde_json::to_vec(&pointer)?;
            self.store.put(&self.latest_key(), Bytes::from(body)).await?;
        }

        let mut st = self.state.lock().await;
        st.pushed_revision = st.pushed_revision.max(index.revision);
        Ok(SyncOutcome::Uploaded)
    }

    async fn publish_best_effort(&self) -> Result<(), SyncError> {
        match self.publish_index().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_degradable() => {
                warn!(error = %e, "Model index publish deferred");
                self.changes.notify_one();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_all(&self) -> Result<SyncOutcome, SyncError> {
        let mut wrote = self.retry_pending_uploads().await? > 0;
        self.evict(self.policy.max_versions_to_keep).await?;
        wrote |= self.drain_deletes().await? > 0;
        wrote |= self.publish_index().await? == SyncOutcome::Uploaded;
        Ok(if wrote {
            SyncOutcome::Uploaded
        } else {
            SyncOutcome::Unchanged
        })
    }
}

#[async_trait]
impl Reconcile for ModelRegistry {
    fn name(&self) -> &'static str {
        "models"
    }

    async fn reconcile(&self) -> Result<SyncOutcome, SyncError> {
        match self.sync_all().await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_degradable() => {
                warn!(
                    prefix = %self.prefix,
                    error = %e,
                    "Model sync deferred, local registry stays authoritative"
                );
                Ok(SyncOutcome::LocalFallback {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        Some(self.changes.clone())
    }

    async fn drain(&self) -> Result<(), SyncError> {
        self.publish_best_effort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, keep: usize) -> ModelRegistry {
        let store: Arc<dyn RemoteStore> = Arc::new(LocalStore::new(dir.path().join("remote")));
        let policy = ModelsConfig {
            max_versions_to_keep: keep,
            ..ModelsConfig::default()
        };
        ModelRegistry::new(
            store,
            ArtifactCache::new(dir.path().join("cache")),
            "models",
            policy,
        )
    }

    #[tokio::test]
    async fn first_model_becomes_latest_until_a_base_exists() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir, 5);
        reg.open().await.unwrap();

        assert!(reg.get_latest().await.unwrap_err().is_not_found());

        let user = reg
            .register(Bytes::from_static(b"user"), ModelMetadata::uploaded())
            .await
            .unwrap();
        assert_eq!(reg.get_latest().await.unwrap().version(), &user);

        let base = reg
            .register(Bytes::from_static(b"base"), ModelMetadata::base())
            .await
            .unwrap();
        let later = reg
            .register(Bytes::from_static(b"later"), ModelMetadata::uploaded())
            .await
            .unwrap();

        let latest = reg.get_latest().await.unwrap();
        assert_eq!(latest.version(), &base);
        assert_eq!(latest.version().weight, 2.0);
        assert!(base.version_id < later.version_id);
        assert_eq!(later.weight, 1.0);
        assert_eq!(reg.list_versions().await.len(), 3);
    }

    #[tokio::test]
    async fn reopen_prefers_the_higher_revision() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir, 5);
        reg.open().await.unwrap();
        let base = reg
            .register(Bytes::from_static(b"base"), ModelMetadata::base())
            .await
            .unwrap();

        // Fresh cache, same remote.
        tokio::fs::remove_dir_all(dir.path().join("cache"))
            .await
            .unwrap();
        let again = registry(&dir, 5);
        assert_eq!(again.open().await.unwrap(), SyncOutcome::RemoteWon);

        let handle = again.get_version(base.version_id.as_str()).await.unwrap();
        assert_eq!(handle.fetch().await.unwrap(), Bytes::from_static(b"base"));
        let cached = dir
            .path()
            .join("cache")
            .join(format!("model_{}.mlmodel", base.version_id));
        assert!(cached.exists());
    }

    #[tokio::test]
    async fn ensemble_rejects_unknown_members_and_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir, 5);
        reg.open().await.unwrap();

        let err = reg.build_ensemble(&[], 2.0, 1.0).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidEnsemble(_)));

        reg.register(Bytes::from_static(b"base"), ModelMetadata::base())
            .await
            .unwrap();
        let err = reg
            .build_ensemble(&["1.0.nope.1"], 2.0, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidEnsemble(_)));

        let member = reg
            .register(Bytes::from_static(b"m"), ModelMetadata::uploaded())
            .await
            .unwrap();
        let err = reg
            .build_ensemble(&[member.version_id.as_str()], 1.0, 2.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidEnsemble(_)));
    }
}
