use super::version::{ModelVersion, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Level, debug};

/// The registry's metadata document, mirrored to `{prefix}/index.json`.
///
/// `revision` grows on every mutation; when the local and remote copies disagree the higher
/// revision wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub revision: u64,
    pub latest: Option<VersionId>,
    /// Sorted by version id.
    pub versions: Vec<ModelVersion>,
    /// Versions whose artifact only exists in the local cache so far.
    #[serde(default)]
    pub pending_uploads: Vec<VersionId>,
    /// Artifact keys evicted from the index but not yet deleted remotely.
    #[serde(default)]
    pub pending_deletes: Vec<String>,
}

/// Small pointer object at `{prefix}/latest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestPointer {
    pub version_id: VersionId,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl RegistryIndex {
    pub fn get(&self, id: &VersionId) -> Option<&ModelVersion> {
        self.versions
            .binary_search_by(|v| v.version_id.cmp(id))
            .ok()
            .map(|i| &self.versions[i])
    }

    pub fn find(&self, raw: &str) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| v.version_id.as_str() == raw)
    }

    pub fn newest_id(&self) -> Option<&VersionId> {
        self.versions.last().map(|v| &v.version_id)
    }

    pub fn latest_version(&self) -> Option<&ModelVersion> {
        self.latest.as_ref().and_then(|id| self.get(id))
    }

    /// Newest version flagged as base.
    pub fn current_base(&self) -> Option<&ModelVersion> {
        self.versions.iter().rev().find(|v| v.is_base)
    }

    pub fn insert(&mut self, version: ModelVersion) {
        match self
            .versions
            .binary_search_by(|v| v.version_id.cmp(&version.version_id))
        {
            Ok(i) => self.versions[i] = version,
            Err(i) => self.versions.insert(i, version),
        }
    }

    pub fn remove(&mut self, id: &VersionId) -> Option<ModelVersion> {
        let i = self
            .versions
            .binary_search_by(|v| v.version_id.cmp(id))
            .ok()?;
        self.pending_uploads.retain(|p| p != id);
        Some(self.versions.remove(i))
    }

    pub fn bump(&mut self) {
        self.revision += 1;
    }

    pub fn latest_pointer(&self) -> Option<LatestPointer> {
        self.latest.clone().map(|version_id| LatestPointer {
            version_id,
            revision: self.revision,
            updated_at: Utc::now(),
        })
    }

    /// Pretty JSON of the whole document at DEBUG. Nothing is rendered at coarser levels.
    pub(crate) fn debug_dump(&self, action: &str) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let latest = self.latest.as_ref().map_or("<none>", VersionId::as_str);
        match serde_json::to_string_pretty(self) {
            Ok(json) => debug!(
                revision = self.revision,
                versions = self.versions.len(),
                latest,
                "{action}:\n{json}"
            ),
            Err(e) => debug!(revision = self.revision, error = %e, "{action}: index not renderable"),
        }
    }
}
